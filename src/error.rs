use thiserror::Error;

/// Application level error type used throughout the crate.
#[derive(Error, Debug)]
pub enum PlcError {
    /// I/O related failure
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport could not be opened, or was lost
    #[error("Connection error: {0}")]
    Connection(String),

    /// No response arrived within the request window
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// Device answered with a nonzero CIP status
    #[error("{message} (status 0x{status:02X}, extended {extended:?})")]
    Protocol {
        status: u8,
        extended: Vec<u16>,
        message: String,
    },

    /// Invalid request or unit configuration; the text is shown to the operator as is
    #[error("{0}")]
    Validation(String),

    /// A checked value did not match its expectation
    #[error("{0}")]
    Mismatch(String),

    /// Requested tag id is not part of the loaded project
    #[error("Tag not found: {0}")]
    TagNotFound(u32),

    /// Scheduler queue is at capacity
    #[error("Scheduler queue is full ({0} jobs)")]
    QueueFull(usize),

    /// A project-critical unit failed
    #[error("Critical failure in '{0}'")]
    CriticalAbort(String),

    /// Operation was cancelled by an abort request
    #[error("Aborted")]
    Aborted,

    /// Invalid or inconsistent configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Error while parsing YAML files
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Error while parsing JSON files
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PlcError {
    /// Failures that stay inside the unit that produced them and end up as
    /// result text instead of terminating the run.
    pub fn is_unit_failure(&self) -> bool {
        matches!(
            self,
            PlcError::Validation(_) | PlcError::Mismatch(_) | PlcError::Protocol { .. }
        )
    }
}

/// Convenient alias over [`Result`] using [`PlcError`]
pub type Result<T> = std::result::Result<T, PlcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_text_is_shown_verbatim() {
        let err = PlcError::Validation("Requested bit 20 is out of range for INT type".into());
        assert_eq!(err.to_string(), "Requested bit 20 is out of range for INT type");
        assert!(err.is_unit_failure());
    }

    #[test]
    fn transport_errors_escape_the_unit() {
        assert!(!PlcError::Timeout("read".into()).is_unit_failure());
        assert!(!PlcError::TagNotFound(7).is_unit_failure());
    }
}
