use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, warn};

use crate::codec::Formatter;
use crate::error::{CallError, ProtocolError};
use crate::protocol::{Outcome, ProtocolState, ResponseParser};
use crate::transport::Transport;
use crate::value::Value;
use crate::xml::{XmlReader, XmlWriter};
use crate::Fault;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Upper bound on the wait for a terminal response state.
    #[serde(rename = "timeout_ms", with = "millis")]
    pub timeout: Duration,
    /// Accept more than one `param` in a response, returning them as an array.
    pub multiple_params: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            multiple_params: false,
        }
    }
}

impl SessionConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_multiple_params(mut self, enabled: bool) -> Self {
        self.multiple_params = enabled;
        self
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// What observers hear about each completed call.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Finished { method: String, value: Value },
    Fault { method: String, fault: Fault },
    Error { method: String, message: String },
}

/// Receives the outcome of a call started with [`Session::begin`].
pub(crate) trait Completion: Send {
    fn complete(self: Box<Self>, outcome: Result<Value, CallError>);
}

struct ActiveCall {
    method: String,
    deadline: Instant,
    /// `None` for blocking calls, which hand their outcome back directly.
    completion: Option<Box<dyn Completion>>,
}

/// Drives one call at a time over a [`Transport`].
///
/// The session owns the response decoder, so it must only be used from the
/// task that drives it; concurrent calls need separate sessions.
pub struct Session<T> {
    transport: T,
    config: SessionConfig,
    parser: ResponseParser,
    reader: XmlReader,
    active: Option<ActiveCall>,
    observers: Vec<mpsc::UnboundedSender<Notification>>,
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, SessionConfig::default())
    }

    pub fn with_config(transport: T, config: SessionConfig) -> Self {
        Self {
            transport,
            config,
            parser: ResponseParser::new().with_multiple_params(config.multiple_params),
            reader: XmlReader::new(),
            active: None,
            observers: Vec::new(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.config.timeout = timeout;
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Current position of the response decoder.
    pub fn state(&self) -> ProtocolState {
        self.parser.state()
    }

    /// Whether a call started with [`Session::begin`] is awaiting completion.
    pub fn is_pending(&self) -> bool {
        self.active.is_some()
    }

    /// Registers an observer for every subsequent call outcome.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<Notification> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.observers.push(tx);
        rx
    }

    /// Performs a call and waits for its outcome.
    ///
    /// The response is decoded as it streams in, so the call returns as
    /// soon as the response is complete even if the transport stays open.
    /// A well-formed fault answer is returned as [`CallError::Fault`].
    pub async fn call(&mut self, method: &str, params: &[Value]) -> Result<Value, CallError> {
        self.start(method, params, None)?;

        let outcome = match self.transport.begin_execute() {
            Ok(()) => self.read_response().await,
            Err(e) => Err(e.into()),
        };

        self.settle(outcome)
    }

    /// Submits a call and returns without waiting; the outcome is delivered
    /// to `completion` by [`Session::drive`].
    pub(crate) fn begin(
        &mut self,
        method: &str,
        params: &[Value],
        completion: Box<dyn Completion>,
    ) -> Result<(), CallError> {
        self.start(method, params, Some(completion))?;

        if let Err(e) = self.transport.begin_execute() {
            // The caller hears about this directly, so the completion is
            // dropped rather than told.
            if let Some(active) = self.active.as_mut() {
                active.completion = None;
            }
            return self.settle(Err(e.into())).map(drop);
        }
        Ok(())
    }

    /// Reads the response of the pending call until it reaches a terminal
    /// state, fails, or times out, then delivers its outcome.
    ///
    /// Returns `false` if no call was pending.
    pub async fn drive(&mut self) -> bool {
        if self.active.is_none() {
            return false;
        }

        let outcome = self.read_response().await;
        // Completion receives its own copy of the outcome.
        let _ = self.settle(outcome);
        true
    }

    /// Reads and decodes response chunks until a terminal state, a failure
    /// or the active call's deadline.
    async fn read_response(&mut self) -> Result<Outcome, CallError> {
        let deadline = match &self.active {
            Some(active) => active.deadline,
            None => Instant::now() + self.config.timeout,
        };

        loop {
            match time::timeout_at(deadline, self.transport.read_chunk()).await {
                Err(_) => return Err(CallError::Timeout(self.config.timeout)),
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok(None)) => {
                    return Err(ProtocolError::UnexpectedEof(self.parser.state()).into())
                }
                Ok(Ok(Some(chunk))) => {
                    if let Some(outcome) = self.feed(&chunk)? {
                        return Ok(outcome);
                    }
                }
            }
        }
    }

    fn start(
        &mut self,
        method: &str,
        params: &[Value],
        completion: Option<Box<dyn Completion>>,
    ) -> Result<(), CallError> {
        if let Some(active) = &self.active {
            if active.completion.is_some() {
                return Err(ProtocolError::CallInProgress.into());
            }
            // A blocking call whose future was dropped mid-flight.
            warn!(method = %active.method, "discarding abandoned call");
            self.active = None;
        }

        self.reset_decoder();

        let mut formatter = Formatter::new(XmlWriter::document());
        formatter.method_call(method, params);
        self.transport.prepare_request(formatter.into_inner().into_bytes());

        debug!(
            method,
            params = params.len(),
            endpoint = self.transport.endpoint().unwrap_or("-"),
            "submitting call"
        );
        self.active = Some(ActiveCall {
            method: method.to_string(),
            deadline: Instant::now() + self.config.timeout,
            completion,
        });
        Ok(())
    }

    /// Feeds response bytes through the reader and state machine.
    fn feed(&mut self, bytes: &[u8]) -> Result<Option<Outcome>, CallError> {
        self.reader.feed(bytes);
        while let Some(event) = self.reader.next_event()? {
            self.parser.advance(event)?;
            if self.parser.is_terminal() {
                return Ok(self.parser.take_outcome());
            }
        }
        Ok(None)
    }

    /// Finishes the active call: notifies observers and the completion, and
    /// leaves the decoder ready for the next call.
    fn settle(&mut self, outcome: Result<Outcome, CallError>) -> Result<Value, CallError> {
        let active = self.active.take();
        self.reset_decoder();

        let method = active
            .as_ref()
            .map(|a| a.method.clone())
            .unwrap_or_default();

        let result = match outcome {
            Ok(Outcome::Result(value)) => {
                debug!(%method, "call finished");
                self.notify(Notification::Finished {
                    method,
                    value: value.clone(),
                });
                Ok(value)
            }
            Ok(Outcome::Fault(fault)) => {
                debug!(%method, code = fault.code, message = %fault.message, "call faulted");
                self.notify(Notification::Fault {
                    method,
                    fault: fault.clone(),
                });
                Err(CallError::Fault(fault))
            }
            Err(e) => {
                if e.is_timeout() {
                    warn!(%method, "call timed out");
                } else {
                    debug!(%method, error = %e, "call failed");
                }
                self.notify(Notification::Error {
                    method,
                    message: e.to_string(),
                });
                Err(e)
            }
        };

        if let Some(completion) = active.and_then(|a| a.completion) {
            completion.complete(result.clone());
        }
        result
    }

    fn notify(&mut self, notification: Notification) {
        self.observers
            .retain(|observer| observer.send(notification.clone()).is_ok());
    }

    fn reset_decoder(&mut self) {
        self.parser.reset();
        self.parser.set_multiple_params(self.config.multiple_params);
        self.reader.reset();
    }
}
