#![forbid(unsafe_code)]

use std::fmt;

/// Lifecycle state of a processing job.
///
/// Stored as a single character code; see [`JobState::code`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum JobState {
    Unknown,
    Queued,
    Missing,
    Fetching,
    Waiting,
    Running,
    Processed,
    Transferring,
    Ingestion,
    Ingesting,
    Complete,
    Error,
    Deleted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    Queue,
    Fetch,
    Run,
    Complete,
    Error,
}

/// Quality assessment of a job's products. Independent of [`JobState`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QaState {
    Unknown,
    Good,
    Questionable,
    Bad,
    Junk,
    Invalid,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnknownCode {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for UnknownCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {} code {:?}", self.kind, self.value)
    }
}

impl std::error::Error for UnknownCode {}

impl JobState {
    pub const ALL: [JobState; 13] = [
        JobState::Unknown,
        JobState::Queued,
        JobState::Missing,
        JobState::Fetching,
        JobState::Waiting,
        JobState::Running,
        JobState::Processed,
        JobState::Transferring,
        JobState::Ingestion,
        JobState::Ingesting,
        JobState::Complete,
        JobState::Error,
        JobState::Deleted,
    ];

    pub fn code(self) -> char {
        match self {
            JobState::Unknown => '?',
            JobState::Queued => 'Q',
            JobState::Missing => 'M',
            JobState::Fetching => 'F',
            JobState::Waiting => 'W',
            JobState::Running => 'S',
            JobState::Processed => 'P',
            JobState::Transferring => 'T',
            JobState::Ingestion => 'I',
            JobState::Ingesting => 'J',
            JobState::Complete => 'Y',
            JobState::Error => 'E',
            JobState::Deleted => 'X',
        }
    }

    pub fn from_code(code: char) -> Result<Self, UnknownCode> {
        Self::ALL
            .into_iter()
            .find(|state| state.code() == code)
            .ok_or_else(|| UnknownCode {
                kind: "job state",
                value: code.to_string(),
            })
    }

    pub fn name(self) -> &'static str {
        match self {
            JobState::Unknown => "UNKNOWN",
            JobState::Queued => "QUEUED",
            JobState::Missing => "MISSING",
            JobState::Fetching => "FETCHING",
            JobState::Waiting => "WAITING",
            JobState::Running => "RUNNING",
            JobState::Processed => "PROCESSED",
            JobState::Transferring => "TRANSFERRING",
            JobState::Ingestion => "INGESTION",
            JobState::Ingesting => "INGESTING",
            JobState::Complete => "COMPLETE",
            JobState::Error => "ERROR",
            JobState::Deleted => "DELETED",
        }
    }

    /// Accepts either the state name (case-insensitive) or its single-character code.
    pub fn parse(raw: &str) -> Result<Self, UnknownCode> {
        let raw = raw.trim();
        let mut chars = raw.chars();
        if let (Some(ch), None) = (chars.next(), chars.next()) {
            return Self::from_code(ch.to_ascii_uppercase());
        }
        Self::ALL
            .into_iter()
            .find(|state| state.name().eq_ignore_ascii_case(raw))
            .ok_or_else(|| UnknownCode {
                kind: "job state",
                value: raw.to_string(),
            })
    }

    pub fn phase(self) -> Phase {
        match self {
            JobState::Unknown | JobState::Queued | JobState::Missing => Phase::Queue,
            JobState::Fetching | JobState::Waiting => Phase::Fetch,
            JobState::Running => Phase::Run,
            JobState::Processed
            | JobState::Transferring
            | JobState::Ingestion
            | JobState::Ingesting
            | JobState::Complete => Phase::Complete,
            JobState::Error | JobState::Deleted => Phase::Error,
        }
    }

    /// Edges of the directed lifecycle graph that a conditional transition may follow.
    ///
    /// DELETED has no inbound edge: it is reached only by an operator override.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;

        if next == Error {
            return self != Deleted;
        }
        matches!(
            (self, next),
            (Unknown, Queued)
                | (Queued, Missing | Fetching | Waiting)
                | (Missing, Queued | Fetching | Waiting)
                | (Fetching, Missing | Waiting)
                | (Waiting, Queued | Running)
                | (Running, Processed)
                | (Processed, Transferring)
                | (Transferring, Ingestion)
                | (Ingestion, Ingesting)
                | (Ingesting, Complete)
                | (Error, Queued)
        )
    }
}

impl std::str::FromStr for JobState {
    type Err = UnknownCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Phase {
    pub fn name(self) -> &'static str {
        match self {
            Phase::Queue => "QUEUE",
            Phase::Fetch => "FETCH",
            Phase::Run => "RUN",
            Phase::Complete => "COMPLETE",
            Phase::Error => "ERROR",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl QaState {
    pub const ALL: [QaState; 6] = [
        QaState::Unknown,
        QaState::Good,
        QaState::Questionable,
        QaState::Bad,
        QaState::Junk,
        QaState::Invalid,
    ];

    pub fn code(self) -> char {
        match self {
            QaState::Unknown => '?',
            QaState::Good => 'G',
            QaState::Questionable => 'Q',
            QaState::Bad => 'B',
            QaState::Junk => 'J',
            QaState::Invalid => 'I',
        }
    }

    pub fn from_code(code: char) -> Result<Self, UnknownCode> {
        Self::ALL
            .into_iter()
            .find(|qa| qa.code() == code)
            .ok_or_else(|| UnknownCode {
                kind: "QA state",
                value: code.to_string(),
            })
    }

    pub fn name(self) -> &'static str {
        match self {
            QaState::Unknown => "UNKNOWN",
            QaState::Good => "GOOD",
            QaState::Questionable => "QUESTIONABLE",
            QaState::Bad => "BAD",
            QaState::Junk => "JUNK",
            QaState::Invalid => "INVALID",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, UnknownCode> {
        let raw = raw.trim();
        let mut chars = raw.chars();
        if let (Some(ch), None) = (chars.next(), chars.next()) {
            return Self::from_code(ch.to_ascii_uppercase());
        }
        Self::ALL
            .into_iter()
            .find(|qa| qa.name().eq_ignore_ascii_case(raw))
            .ok_or_else(|| UnknownCode {
                kind: "QA state",
                value: raw.to_string(),
            })
    }
}

impl std::str::FromStr for QaState {
    type Err = UnknownCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for QaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
