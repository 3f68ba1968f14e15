use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    // kube::Error is a big type, keep it behind a Box
    #[error("{0}: {1:?}")]
    KubeError(String, #[source] Box<kube::Error>),

    #[error("{0}: {1}")]
    SerializationError(String, #[source] serde_json::Error),

    #[error("{0}: {1}")]
    YamlError(String, #[source] serde_yaml::Error),

    #[error("{0}: {1}")]
    IoError(String, #[source] std::io::Error),

    #[error("{0}: {1}")]
    FormattingError(String, #[source] std::fmt::Error),

    #[error("{0}")]
    MissingData(String),

    #[error("parse error: {0}")]
    ParseError(String),

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("image build error: {0}")]
    ImageBuildError(String),

    #[error("telemetry error: {0}")]
    TelemetryError(String),

    #[error("invalid trace ID")]
    InvalidTraceId,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
