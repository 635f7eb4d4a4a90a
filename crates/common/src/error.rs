use thiserror::Error;

/// Canonical rowflow error taxonomy used across crates.
///
/// Classification guidance:
/// - [`RowflowError::InvalidConfig`]: pipeline/stage configuration problems found before any
///   stage thread starts
/// - [`RowflowError::Conversion`]: one row could not be processed; eligible for error-row
///   redirection
/// - [`RowflowError::Spill`] / [`RowflowError::Io`]: resource failures, fatal for the stage
/// - [`RowflowError::Cancelled`]: a channel was cancelled by a cooperative stop
/// - [`RowflowError::Execution`]: any other runtime failure
#[derive(Debug, Error)]
pub enum RowflowError {
    /// Invalid or inconsistent pipeline/stage configuration.
    ///
    /// Examples:
    /// - unknown group or source field
    /// - aggregate kind not applicable to the source field type
    /// - hop referencing an unknown stage, or a cyclic hop graph
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Per-row value conversion failure.
    ///
    /// Carries everything needed to build an error-row envelope.
    #[error("conversion error [{code}]: {message}")]
    Conversion {
        /// Index of the failing field in the input row, if known.
        field_index: Option<usize>,
        /// Short machine-readable code.
        code: String,
        /// Human-readable description.
        message: String,
    },

    /// Runtime failures after initialization succeeded.
    ///
    /// Examples:
    /// - a stage thread panicked
    /// - too many rejected rows for the configured error limits
    #[error("execution error: {0}")]
    Execution(String),

    /// Spill file creation, encode, or decode failures.
    #[error("spill error: {0}")]
    Spill(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The channel (or the whole pipeline) was stopped.
    #[error("cancelled")]
    Cancelled,
}

impl RowflowError {
    /// Build a [`RowflowError::Conversion`] error.
    pub fn conversion(
        field_index: Option<usize>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Conversion {
            field_index,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Whether this error only concerns the row being processed.
    #[must_use]
    pub fn is_row_error(&self) -> bool {
        matches!(self, Self::Conversion { .. })
    }

    /// Stable short code used in error rows and logs.
    #[must_use]
    pub fn code(&self) -> &str {
        match self {
            Self::InvalidConfig(_) => "INVALID_CONFIG",
            Self::Conversion { code, .. } => code,
            Self::Execution(_) => "EXECUTION",
            Self::Spill(_) => "SPILL",
            Self::Io(_) => "IO",
            Self::Cancelled => "CANCELLED",
        }
    }
}

/// Standard rowflow result alias.
pub type Result<T> = std::result::Result<T, RowflowError>;
