use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid policy for {scope}: {reason}")]
    InvalidPolicy { scope: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AdmissionError {
    pub fn invalid_policy(scope: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPolicy {
            scope: scope.into(),
            reason: reason.into(),
        }
    }
}

pub type AdmissionResult<T> = Result<T, AdmissionError>;
