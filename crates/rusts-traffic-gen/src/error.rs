//! Error types for the traffic generator

use std::error::Error as StdError;
use std::fmt;
use thiserror::Error;

/// Too many open files (per process)
const EMFILE: i32 = 24;
/// Too many open files (system wide)
const ENFILE: i32 = 23;

/// Coarse classification of a backend failure, used to pick the log message
/// and to aggregate failure counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// The client ran out of handles (file descriptors, sockets)
    ResourceExhaustion,
    /// The target did not answer in time
    Timeout,
    /// The target could not be reached at all
    Unreachable,
    Other,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::ResourceExhaustion => "resource-exhaustion",
            FailureClass::Timeout => "timeout",
            FailureClass::Unreachable => "unreachable",
            FailureClass::Other => "other",
        }
    }
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by a storage backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server error: {status} - {message}")]
    Server { status: u16, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session already closed")]
    Closed,

    /// Failure produced on purpose by an in-process backend.
    #[error("Simulated {class} failure: {message}")]
    Simulated { class: FailureClass, message: String },
}

impl BackendError {
    pub fn simulated(class: FailureClass, message: impl Into<String>) -> Self {
        BackendError::Simulated {
            class,
            message: message.into(),
        }
    }

    /// Classifies the failure for logging and accounting.
    pub fn classify(&self) -> FailureClass {
        match self {
            BackendError::Simulated { class, .. } => *class,
            BackendError::Http(e) => {
                if is_resource_exhaustion(e) {
                    FailureClass::ResourceExhaustion
                } else if e.is_timeout() {
                    FailureClass::Timeout
                } else if e.is_connect() {
                    FailureClass::Unreachable
                } else {
                    FailureClass::Other
                }
            }
            BackendError::Io(e) => {
                if is_resource_exhaustion(e) {
                    FailureClass::ResourceExhaustion
                } else {
                    match e.kind() {
                        std::io::ErrorKind::TimedOut => FailureClass::Timeout,
                        std::io::ErrorKind::ConnectionRefused
                        | std::io::ErrorKind::ConnectionReset
                        | std::io::ErrorKind::NotConnected => FailureClass::Unreachable,
                        _ => FailureClass::Other,
                    }
                }
            }
            BackendError::Server { status, .. } => match status {
                408 | 504 => FailureClass::Timeout,
                503 => FailureClass::Unreachable,
                _ => FailureClass::Other,
            },
            BackendError::Closed => FailureClass::Other,
        }
    }
}

/// Walks the source chain looking for an exhausted descriptor table.
fn is_resource_exhaustion(err: &(dyn StdError + 'static)) -> bool {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if matches!(io.raw_os_error(), Some(EMFILE) | Some(ENFILE)) {
                return true;
            }
        }
        if e.to_string().to_lowercase().contains("too many open files") {
            return true;
        }
        current = e.source();
    }
    false
}

/// Top-level errors for a traffic run
#[derive(Debug, Error)]
pub enum TrafficError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Initial connection failed: {0}")]
    InitialConnection(#[source] BackendError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type for traffic generator operations
pub type Result<T> = std::result::Result<T, TrafficError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_simulated() {
        let err = BackendError::simulated(FailureClass::Timeout, "slow");
        assert_eq!(err.classify(), FailureClass::Timeout);
        assert!(err.to_string().contains("timeout"));
    }

    #[test]
    fn test_classify_emfile() {
        let err = BackendError::Io(std::io::Error::from_raw_os_error(EMFILE));
        assert_eq!(err.classify(), FailureClass::ResourceExhaustion);

        let err = BackendError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "Too many open files",
        ));
        assert_eq!(err.classify(), FailureClass::ResourceExhaustion);
    }

    #[test]
    fn test_classify_io_kinds() {
        let refused = BackendError::Io(std::io::ErrorKind::ConnectionRefused.into());
        assert_eq!(refused.classify(), FailureClass::Unreachable);

        let timed_out = BackendError::Io(std::io::ErrorKind::TimedOut.into());
        assert_eq!(timed_out.classify(), FailureClass::Timeout);
    }

    #[test]
    fn test_classify_server_status() {
        let err = BackendError::Server {
            status: 504,
            message: "gateway timeout".to_string(),
        };
        assert_eq!(err.classify(), FailureClass::Timeout);

        let err = BackendError::Server {
            status: 400,
            message: "bad request".to_string(),
        };
        assert_eq!(err.classify(), FailureClass::Other);
    }
}
