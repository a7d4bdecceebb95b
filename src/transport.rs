//! Request transmission boundary.
//!
//! A transport moves an already encoded request body to the remote side and
//! hands back the response bytes. It knows nothing about the call grammar.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;

/// How a session transmits requests.
#[async_trait]
pub trait Transport: Send {
    /// Installs the encoded body for the next execution.
    fn prepare_request(&mut self, body: Vec<u8>);

    /// Starts transmitting the prepared request without waiting for a reply.
    fn begin_execute(&mut self) -> Result<(), TransportError>;

    /// Next chunk of the response to the request last started, or `None`
    /// once the response is complete.
    async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, TransportError>;

    /// Transmits the prepared request and collects the raw response until
    /// the transport reports its end. Decoding is left to the caller.
    async fn execute(&mut self) -> Result<Vec<u8>, TransportError> {
        self.begin_execute()?;
        let mut body = Vec::new();
        while let Some(chunk) = self.read_chunk().await? {
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }

    /// Where requests go, for logging.
    fn endpoint(&self) -> Option<&str> {
        None
    }
}

#[derive(Debug)]
enum Reply {
    Chunk(Vec<u8>),
    End,
    Fail(TransportError),
}

/// In-process transport backed by tokio channels.
///
/// Every request carries a sequence number and replies to anything but the
/// latest request are dropped, so a late answer to a timed-out call never
/// leaks into the next one.
#[derive(Debug)]
pub struct ChannelTransport {
    requests: mpsc::UnboundedSender<(u64, Vec<u8>)>,
    replies: mpsc::UnboundedReceiver<(u64, Reply)>,
    prepared: Option<Vec<u8>>,
    seq: u64,
    endpoint: Option<String>,
}

/// The remote end of a [`ChannelTransport`].
#[derive(Debug)]
pub struct ChannelPeer {
    requests: mpsc::UnboundedReceiver<(u64, Vec<u8>)>,
    replies: mpsc::UnboundedSender<(u64, Reply)>,
}

/// One request as seen by a [`ChannelPeer`], with the means to answer it.
#[derive(Debug)]
pub struct IncomingRequest {
    pub body: Vec<u8>,
    seq: u64,
    replies: mpsc::UnboundedSender<(u64, Reply)>,
}

impl ChannelTransport {
    pub fn pair() -> (Self, ChannelPeer) {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (replies_tx, replies_rx) = mpsc::unbounded_channel();

        let transport = Self {
            requests: requests_tx,
            replies: replies_rx,
            prepared: None,
            seq: 0,
            endpoint: None,
        };
        let peer = ChannelPeer {
            requests: requests_rx,
            replies: replies_tx,
        };

        (transport, peer)
    }

    /// Names the transport in log output.
    pub fn with_endpoint<E: Into<String>>(mut self, endpoint: E) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    fn prepare_request(&mut self, body: Vec<u8>) {
        self.prepared = Some(body);
    }

    fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    fn begin_execute(&mut self) -> Result<(), TransportError> {
        let body = self.prepared.take().ok_or(TransportError::NotPrepared)?;
        self.seq = self.seq.wrapping_add(1);
        self.requests
            .send((self.seq, body))
            .map_err(|_| TransportError::ConnectionLost("peer closed".into()))
    }

    async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        loop {
            let Some((seq, reply)) = self.replies.recv().await else {
                return Err(TransportError::ConnectionLost("peer closed".into()));
            };
            if seq != self.seq {
                continue;
            }
            return match reply {
                Reply::Chunk(bytes) => Ok(Some(bytes)),
                Reply::End => Ok(None),
                Reply::Fail(e) => Err(e),
            };
        }
    }
}

impl ChannelPeer {
    /// Waits for the next request; `None` once the transport is dropped.
    pub async fn next_request(&mut self) -> Option<IncomingRequest> {
        let (seq, body) = self.requests.recv().await?;
        Some(IncomingRequest {
            body,
            seq,
            replies: self.replies.clone(),
        })
    }
}

impl IncomingRequest {
    pub fn body_text(&self) -> &str {
        std::str::from_utf8(&self.body).unwrap_or_default()
    }

    /// Sends part of the response. Returns `false` if the transport is gone.
    pub fn send_chunk<B: Into<Vec<u8>>>(&self, bytes: B) -> bool {
        self.replies.send((self.seq, Reply::Chunk(bytes.into()))).is_ok()
    }

    pub fn end(&self) -> bool {
        self.replies.send((self.seq, Reply::End)).is_ok()
    }

    pub fn fail(&self, error: TransportError) -> bool {
        self.replies.send((self.seq, Reply::Fail(error))).is_ok()
    }

    /// Sends a complete response in one piece.
    pub fn respond<B: Into<Vec<u8>>>(&self, body: B) -> bool {
        self.send_chunk(body) && self.end()
    }
}
