use std::time::Duration;

pub use crate::client::{ClientProtocol, MethodCallHandle, ProtocolConfig};
pub use crate::creator::RemoteObjectCreator;
pub use crate::factory::{
    BackoffConfig, FactoryEvent, FactoryHandle, MethodCallClientFactory, DEFAULT_FACTOR,
    DEFAULT_INITIAL_DELAY, DEFAULT_JITTER, DEFAULT_MAX_DELAY,
};
pub use crate::frame::{Frame, FrameError, MethodCallCodec, Reply, COMMAND_TAG, MAX_FRAME_SIZE};
pub use crate::remote::RemoteObject;
pub use crate::value::{Value, MAX_BYTES_LEN, MAX_STRING_LEN};

mod client;
mod creator;
mod factory;
mod frame;
mod remote;
mod value;

/// Default maximum wait for the `_answer` to a request.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default maximum wait for a `_result_available` frame once a pending
/// ticket has been observed.
pub const DEFAULT_PENDING_TIMEOUT: Duration = Duration::from_secs(60);

/// Stable identifier for a [`MethodCallError`], carried on the wire as a
/// snake_case string.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ErrorCode {
    MethodNotAllowed,
    MethodFailed,
    UnserializableValue,
    UnserializableResult,
    CallTimedOut,
    ConnectionLost,
    BackoffExhausted,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::MethodNotAllowed => "method_not_allowed",
            ErrorCode::MethodFailed => "method_failed",
            ErrorCode::UnserializableValue => "unserializable_value",
            ErrorCode::UnserializableResult => "unserializable_result",
            ErrorCode::CallTimedOut => "timeout",
            ErrorCode::ConnectionLost => "connection_lost",
            ErrorCode::BackoffExhausted => "backoff_exhausted",
        }
    }

    pub(crate) fn parse(code: &str) -> Option<Self> {
        match code {
            "method_not_allowed" => Some(ErrorCode::MethodNotAllowed),
            "method_failed" => Some(ErrorCode::MethodFailed),
            "unserializable_value" => Some(ErrorCode::UnserializableValue),
            "unserializable_result" => Some(ErrorCode::UnserializableResult),
            "timeout" => Some(ErrorCode::CallTimedOut),
            "connection_lost" => Some(ErrorCode::ConnectionLost),
            "backoff_exhausted" => Some(ErrorCode::BackoffExhausted),
            _ => None,
        }
    }
}

/// Typed failure delivered on a call's eventual value.
///
/// The display form is the wire description, e.g. `Forbidden method 'x'`
/// for a call rejected by the server allow-list or `timeout` for a call
/// that exceeded its deadline.
#[derive(thiserror::Error, Clone, Debug, Eq, PartialEq)]
#[error("{description}")]
pub struct MethodCallError {
    code: ErrorCode,
    description: String,
}

impl MethodCallError {
    pub fn new(code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }

    /// A call to a method not present in the server allow-list.
    pub fn forbidden(method: &str) -> Self {
        Self::new(
            ErrorCode::MethodNotAllowed,
            format!("Forbidden method '{method}'"),
        )
    }

    /// A target method that was invoked but failed.
    pub fn method_failed(description: impl Into<String>) -> Self {
        Self::new(ErrorCode::MethodFailed, description)
    }

    /// An outbound argument outside the value grammar.
    pub fn unserializable_value(description: impl Into<String>) -> Self {
        Self::new(ErrorCode::UnserializableValue, description)
    }

    /// A server-side result outside the value grammar.
    pub fn unserializable_result(description: impl Into<String>) -> Self {
        Self::new(ErrorCode::UnserializableResult, description)
    }

    /// A call that exceeded its response timeout or hard deadline.
    pub fn timed_out() -> Self {
        Self::new(ErrorCode::CallTimedOut, "timeout")
    }

    pub fn connection_lost() -> Self {
        Self::new(ErrorCode::ConnectionLost, "connection lost")
    }

    pub fn backoff_exhausted(attempts: u32) -> Self {
        Self::new(
            ErrorCode::BackoffExhausted,
            format!("gave up after {attempts} connection attempts"),
        )
    }

    pub(crate) fn from_wire(code: &str, description: String) -> Self {
        let code = ErrorCode::parse(code).unwrap_or(ErrorCode::MethodFailed);
        Self { code, description }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn is_connection_lost(&self) -> bool {
        self.code == ErrorCode::ConnectionLost
    }
}

/// A specialized library [`Result`] type.
///
/// [`Result`]: enum@std::result::Result
pub type MethodCallResult<T> = std::result::Result<T, MethodCallError>;
