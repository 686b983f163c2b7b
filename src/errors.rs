//! Error kinds for the OPC UA driver engine.
//!
//! Each variant corresponds to exactly one row of the engine's error table.
//! The wire-facing representation is a single string token (see
//! [`EngineError::wire_token`]) — no hierarchy is encoded on the wire.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("DeviceIdNotFound: {0}")]
    DeviceIdNotFound(String),

    #[error("TagNotFound: {0}")]
    TagNotFound(String),

    #[error("TagNotWriteable: {0}")]
    TagNotWriteable(String),

    #[error("ConfigError: {0}")]
    ConfigError(String),

    #[error("EmptySession: {0}")]
    EmptySession(String),

    #[error("WriteFail: {0}")]
    WriteFail(String),

    #[error("OpcReject: {0}")]
    OpcReject(String),

    #[error("HostClose: {0}")]
    HostClose(String),

    #[error("SubscriptionTerminated: {0}")]
    SubscriptionTerminated(String),

    #[error("RestartOnChangeParams: {0}")]
    RestartOnChangeParams(String),
}

impl EngineError {
    /// The bare token the supervisor sees on the wire (no context attached).
    pub fn wire_token(&self) -> &'static str {
        match self {
            EngineError::DeviceIdNotFound(_) => "DeviceIdNotFound",
            EngineError::TagNotFound(_) => "TagNotFound",
            EngineError::TagNotWriteable(_) => "TagNotWriteable",
            EngineError::ConfigError(_) => "ConfigError",
            EngineError::EmptySession(_) => "EmptySession",
            EngineError::WriteFail(_) => "WriteFail",
            EngineError::OpcReject(_) => "OpcReject",
            EngineError::HostClose(_) => "HostClose",
            EngineError::SubscriptionTerminated(_) => "SubscriptionTerminated",
            EngineError::RestartOnChangeParams(_) => "RestartOnChangeParams",
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_token_has_no_context() {
        let err = EngineError::TagNotFound("levels[2]".to_string());
        assert_eq!(err.wire_token(), "TagNotFound");
    }
}
