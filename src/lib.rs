//! Client-side XML-RPC engine.
//!
//! Arguments travel through a serde bridge into [`Value`]s, the
//! [`Formatter`] writes them as a method call, and responses are decoded
//! incrementally: the [`XmlReader`] turns bytes into structural [`Event`]s
//! and the [`ResponseParser`] classifies them as a result or a [`Fault`]
//! while its [`Scanner`] rebuilds the returned value.
//!
//! With the `client` feature, [`Session`] drives one call at a time over
//! a [`Transport`] and [`RemoteProcedure`] binds a method name to typed
//! arguments and a typed result.

mod codec;
mod de;
mod error;
mod impls;
mod protocol;
mod ser;
mod types;
mod value;
mod xml;

#[cfg(feature = "client")]
mod procedure;
#[cfg(feature = "client")]
mod session;
#[cfg(feature = "client")]
mod transport;

use serde::{Deserialize, Serialize};

pub use codec::{EventSink, Formatter, ScanState, Scanner};
pub use de::from_value;
pub use error::{CallError, DeserializeError, ProtocolError, SerializationError, TransportError};
pub use protocol::{Outcome, ProtocolState, ResponseParser};
pub use ser::{to_value, ValueSerializer};
pub use types::{Binary, DateTime};
pub use value::{ArrayBuilder, Map, StructBuilder, Value};
pub use xml::{XmlReader, XmlWriter};

#[cfg(feature = "client")]
pub use procedure::{Arguments, PendingCall, RemoteProcedure};
#[cfg(feature = "client")]
pub use session::{Notification, Session, SessionConfig};
#[cfg(feature = "client")]
pub use transport::{ChannelPeer, ChannelTransport, IncomingRequest, Transport};

/// One structural parse event of a request or response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Open(String),
    Close(String),
    Text(String),
}

/// A well-formed error answer from the remote method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    #[serde(rename = "faultCode")]
    pub code: i64,
    #[serde(rename = "faultString")]
    pub message: String,
}
