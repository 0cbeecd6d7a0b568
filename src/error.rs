//src/error.rs

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MetabarError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Malformed input {source_name} at line {line}: {message}")]
    MalformedInput {
        source_name: String,
        line: usize,
        message: String,
    },

    /// Every problem found while validating parameters, reported at once.
    #[error("Invalid configuration: {}", .0.join("; "))]
    InvalidConfig(Vec<String>),

    #[error("Filter '{stage}' deleted every row; the analysis stops here")]
    AllRowsDeleted { stage: String },

    #[error("Variant {0} has no sequence")]
    UnknownVariant(u32),

    #[error("External tool '{tool}' failed: {message}")]
    Aligner { tool: String, message: String },

    #[error("External tool '{tool}' timed out after {seconds}s")]
    AlignerTimeout { tool: String, seconds: u64 },

    #[error("Operation cancelled")]
    Cancelled,
}

impl MetabarError {
    pub fn malformed(source_name: impl Into<String>, line: usize, message: impl Into<String>) -> Self {
        Self::MalformedInput {
            source_name: source_name.into(),
            line,
            message: message.into(),
        }
    }

    pub fn aligner(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Aligner {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Failures of one external aligner call that leave the rest of the run
    /// usable: a non-zero exit, a timeout or output that does not parse.
    pub fn is_recoverable_aligner_failure(&self) -> bool {
        matches!(
            self,
            Self::Aligner { .. } | Self::AlignerTimeout { .. } | Self::MalformedInput { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, MetabarError>;
