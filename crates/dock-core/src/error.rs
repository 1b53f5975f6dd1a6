use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("malformed snapshot: {0}")]
    MalformedSnapshot(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid shipment: {0}")]
    InvalidShipment(String),

    #[error("unknown {kind}: {value}")]
    UnknownVariant { kind: &'static str, value: String },
}

pub type CoreResult<T> = Result<T, CoreError>;
