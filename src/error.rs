use std::fmt;
use std::time::Duration;

use crate::protocol::ProtocolState;
use crate::{Event, Fault};

/// A converter declined to turn a native value into a [`crate::Value`].
#[derive(Debug, Clone, PartialEq)]
pub enum SerializationError {
    /// NaN and the infinities have no wire representation.
    NonFinite(f64),
    /// An integer does not fit the 64 bit wire integer.
    OutOfRange(String),
    /// Struct member names must be strings, integers or booleans.
    KeyMustBeString,
    Message(String),
}

impl fmt::Display for SerializationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonFinite(d) => write!(f, "cannot serialize non-finite double {d}"),
            Self::OutOfRange(n) => write!(f, "integer {n} does not fit in 64 bits"),
            Self::KeyMustBeString => f.write_str("struct member names must be strings"),
            Self::Message(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for SerializationError {}

impl serde::ser::Error for SerializationError {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        Self::Message(msg.to_string())
    }
}

/// A [`crate::Value`] could not be turned into the requested native type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeserializeError {
    /// The value's shape does not match the target type.
    TypeMismatch { expected: String, found: String },
    /// A required struct member is absent.
    FieldMissing(String),
    Message(String),
}

impl fmt::Display for DeserializeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TypeMismatch { expected, found } => {
                write!(f, "type mismatch: expected {expected}, found {found}")
            }
            Self::FieldMissing(name) => write!(f, "missing field `{name}`"),
            Self::Message(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for DeserializeError {}

impl serde::de::Error for DeserializeError {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        Self::Message(msg.to_string())
    }

    fn invalid_type(unexp: serde::de::Unexpected, exp: &dyn serde::de::Expected) -> Self {
        Self::TypeMismatch {
            expected: exp.to_string(),
            found: unexp.to_string(),
        }
    }

    fn missing_field(field: &'static str) -> Self {
        Self::FieldMissing(field.to_string())
    }
}

/// The response did not follow the method response grammar.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// An event arrived that the current state has no transition for.
    Unexpected { state: ProtocolState, event: Event },
    /// An element that has no place inside a value.
    UnexpectedInValue(Event),
    /// Scalar text that does not parse as its declared type.
    InvalidScalar { kind: &'static str, text: String },
    /// The fault payload lacks an integer `faultCode` or string `faultString`.
    InvalidFault(String),
    /// The byte stream is not well-formed markup.
    Markup(String),
    /// The response ended before a terminal state was reached.
    UnexpectedEof(ProtocolState),
    /// A second call was started while one is still pending.
    CallInProgress,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unexpected { state, event } => {
                write!(f, "unexpected {event} in state {state:?}")
            }
            Self::UnexpectedInValue(event) => write!(f, "unexpected {event} inside value"),
            Self::InvalidScalar { kind, text } => write!(f, "invalid {kind} value {text:?}"),
            Self::InvalidFault(reason) => write!(f, "malformed fault: {reason}"),
            Self::Markup(reason) => write!(f, "malformed markup: {reason}"),
            Self::UnexpectedEof(state) => {
                write!(f, "response ended early in state {state:?}")
            }
            Self::CallInProgress => f.write_str("call already in progress"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Connection-level failures reported by a [`crate::Transport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The peer went away or the connection was reset.
    ConnectionLost(String),
    /// `begin_execute` or `execute` was called without a prepared request.
    NotPrepared,
    Io(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionLost(msg) => write!(f, "connection lost: {msg}"),
            Self::NotPrepared => f.write_str("no request prepared"),
            Self::Io(msg) => write!(f, "I/O error: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Every way a call can end other than with a result.
#[derive(Debug, Clone, PartialEq)]
pub enum CallError {
    Transport(TransportError),
    /// No terminal state was reached within the session timeout.
    Timeout(Duration),
    Protocol(ProtocolError),
    Serialization(SerializationError),
    Deserialization(DeserializeError),
    /// The remote method answered with a well-formed fault.
    Fault(Fault),
    /// The session dropped the call before it completed.
    Canceled,
}

impl CallError {
    pub fn as_fault(&self) -> Option<&Fault> {
        match self {
            Self::Fault(fault) => Some(fault),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::Timeout(after) => write!(f, "timeout after {after:?}"),
            Self::Protocol(e) => write!(f, "protocol error: {e}"),
            Self::Serialization(e) => write!(f, "serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "deserialization error: {e}"),
            Self::Fault(fault) => write!(f, "remote fault: {fault}"),
            Self::Canceled => f.write_str("call canceled"),
        }
    }
}

impl std::error::Error for CallError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            Self::Protocol(e) => Some(e),
            Self::Serialization(e) => Some(e),
            Self::Deserialization(e) => Some(e),
            Self::Fault(fault) => Some(fault),
            Self::Timeout(_) | Self::Canceled => None,
        }
    }
}

impl From<TransportError> for CallError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<ProtocolError> for CallError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

impl From<SerializationError> for CallError {
    fn from(e: SerializationError) -> Self {
        Self::Serialization(e)
    }
}

impl From<DeserializeError> for CallError {
    fn from(e: DeserializeError) -> Self {
        Self::Deserialization(e)
    }
}

impl From<Fault> for CallError {
    fn from(fault: Fault) -> Self {
        Self::Fault(fault)
    }
}
