//! Error types for channel and service host construction.

use thiserror::Error;
use tonic::{Code, Status};

/// Errors raised while configuring, dialing or hosting gRPC services.
#[derive(Error, Debug, Clone)]
pub enum GrpcError {
    /// Missing or invalid certificate material, or no transport security selected.
    #[error("credential error: {0}")]
    Credential(String),

    /// Transport connect or handshake failure, deadline exceeded, cancellation,
    /// or a closed in-process listener.
    #[error("dial error: {0}")]
    Dial(String),

    /// The listener could not be bound (port in use, permission denied).
    #[error("bind error: {0}")]
    Bind(String),

    /// An interceptor deliberately short-circuited a call.
    #[error("interceptor rejected call ({code:?}): {message}")]
    Interceptor {
        /// The gRPC code reported to the peer.
        code: Code,
        /// Human-readable reason.
        message: String,
    },

    /// A metadata key or value is not valid for a gRPC header.
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    /// The target or bind address could not be parsed.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// An operation was invoked in the wrong lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl GrpcError {
    /// Build an interceptor rejection with the given code.
    pub fn rejected(code: Code, message: impl Into<String>) -> Self {
        Self::Interceptor {
            code,
            message: message.into(),
        }
    }

    /// The gRPC code this error maps to when reported to a peer.
    pub fn code(&self) -> Code {
        match self {
            Self::Interceptor { code, .. } => *code,
            Self::Dial(_) => Code::Unavailable,
            _ => Code::Internal,
        }
    }
}

impl From<GrpcError> for Status {
    fn from(err: GrpcError) -> Self {
        match err {
            GrpcError::Interceptor { code, message } => Status::new(code, message),
            other => Status::new(other.code(), other.to_string()),
        }
    }
}

impl From<tonic::transport::Error> for GrpcError {
    fn from(err: tonic::transport::Error) -> Self {
        // The transport error's own message is generic; the cause carries the detail.
        let mut message = err.to_string();
        let mut source = std::error::Error::source(&err);
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        Self::Dial(message)
    }
}

/// A specialized Result type for RPC operations.
pub type Result<T> = std::result::Result<T, GrpcError>;
