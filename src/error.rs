//! Structured error taxonomy for pipeline construction and session lifecycle.
//!
//! Construction/runtime pipeline failures are a narrower type reused by
//! pipeline-only unit tests; session-level transport/protocol/SDP/bus errors
//! wrap it via `#[from]`. Transport/ExternalTool/Protocol variants are caught
//! and logged at their call site and never propagate past the session; the
//! rest tear the session down.

use crate::pipeline::EncoderProfile;

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("missing required plugin: {0}")]
    MissingPlugin(String),

    #[error("failed to create element {0}: {1}")]
    ElementCreate(String, String),

    #[error("failed to link {from} -> {to}")]
    Link { from: String, to: String },

    #[error("unsupported encoder profile: {0:?}")]
    UnsupportedEncoder(EncoderProfile),

    #[error("pipeline state change failed: {0}")]
    StateChange(String),
}

#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("external tool {tool} failed: {detail}")]
    ExternalTool { tool: String, detail: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("SDP violation: {0}")]
    SdpViolation(String),

    #[error("bus reported EOS or error: {0}")]
    Bus(String),
}

impl SessionError {
    /// True for errors that should tear the whole session down, per the
    /// taxonomy: construction errors, SDP violations, and bus EOS/ERROR are
    /// fatal. Transport/external-tool/protocol errors are isolated instead.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::Pipeline(_) | SessionError::SdpViolation(_) | SessionError::Bus(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_error_converts_into_session_error() {
        let pe = PipelineError::MissingPlugin("webrtcbin".into());
        let se: SessionError = pe.into();
        assert!(se.is_fatal());
        assert!(matches!(se, SessionError::Pipeline(_)));
    }

    #[test]
    fn non_construction_errors_are_not_fatal() {
        assert!(!SessionError::Transport("broken pipe".into()).is_fatal());
        assert!(!SessionError::Protocol("bad op".into()).is_fatal());
        assert!(!SessionError::ExternalTool {
            tool: "xrandr".into(),
            detail: "exit 1".into()
        }
        .is_fatal());
    }

    #[test]
    fn sdp_and_bus_errors_are_fatal() {
        assert!(SessionError::SdpViolation("not an answer".into()).is_fatal());
        assert!(SessionError::Bus("EOS".into()).is_fatal());
    }
}
