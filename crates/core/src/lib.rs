#![forbid(unsafe_code)]

mod lifecycle;

pub use lifecycle::{JobState, Phase, QaState, UnknownCode};

pub mod ids {
    use std::fmt;

    /// Database identity of a processing job. Assigned by the store, never reused.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct JobId(i64);

    impl JobId {
        pub fn new(value: i64) -> Self {
            Self(value)
        }

        pub fn get(self) -> i64 {
            self.0
        }
    }

    impl fmt::Display for JobId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    impl std::str::FromStr for JobId {
        type Err = std::num::ParseIntError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            s.trim().parse::<i64>().map(Self)
        }
    }

    /// Processing site tag (e.g. `JAC`, `CADC`). Decides which worker pool may act on a job.
    #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct Location(String);

    impl Location {
        pub fn as_str(&self) -> &str {
            &self.0
        }

        pub fn try_new(value: impl Into<String>) -> Result<Self, LocationError> {
            let value = value.into();
            let value = value.trim().to_ascii_uppercase();
            validate_location(&value)?;
            Ok(Self(value))
        }
    }

    impl fmt::Display for Location {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    impl std::str::FromStr for Location {
        type Err = LocationError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            Self::try_new(s)
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum LocationError {
        Empty,
        TooLong,
        InvalidChar { ch: char, index: usize },
    }

    impl fmt::Display for LocationError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Self::Empty => write!(f, "location must not be empty"),
                Self::TooLong => write!(f, "location is longer than 32 characters"),
                Self::InvalidChar { ch, index } => {
                    write!(f, "location has invalid character {ch:?} at {index}")
                }
            }
        }
    }

    impl std::error::Error for LocationError {}

    fn validate_location(value: &str) -> Result<(), LocationError> {
        if value.is_empty() {
            return Err(LocationError::Empty);
        }
        if value.len() > 32 {
            return Err(LocationError::TooLong);
        }
        for (index, ch) in value.chars().enumerate() {
            if ch.is_ascii_alphanumeric() || ch == '_' {
                continue;
            }
            return Err(LocationError::InvalidChar { ch, index });
        }
        Ok(())
    }
}

pub mod model {
    use crate::ids::{JobId, Location};
    use crate::{JobState, QaState};

    /// Full row of the job table as seen by the worker.
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct JobRecord {
        pub id: JobId,
        pub tag: String,
        pub state: JobState,
        pub qa_state: QaState,
        pub location: Location,
        pub mode: String,
        pub parameters: String,
        pub priority: i64,
        pub created_at_ms: i64,
        pub updated_at_ms: i64,
    }

    /// One append-only entry of a job's log.
    ///
    /// Transition entries carry the state before and after; notes written without a
    /// transition (errors, QA changes) have `state_prev == state_new`.
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct LogEntry {
        pub id: i64,
        pub job_id: JobId,
        pub ts_ms: i64,
        pub state_prev: JobState,
        pub state_new: JobState,
        pub message: String,
        pub host: String,
    }

    impl LogEntry {
        pub fn is_transition(&self) -> bool {
            self.state_prev != self.state_new
        }
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct NewJob {
        pub tag: String,
        pub location: Location,
        pub mode: String,
        pub parameters: String,
        pub priority: i64,
        pub input_files: Vec<String>,
    }
}
