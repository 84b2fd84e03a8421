//! Observation points surfaced to the embedding harness.
//!
//! Every externally significant occurrence is reported on a channel so a
//! surrounding harness can assert on engine behavior without scraping log
//! output.  Emission never blocks the engine; when nobody is listening the
//! observation is logged and discarded.
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tracing::*;

/// One externally observable occurrence.
#[derive(Clone, Debug, PartialEq)]
pub enum Observation {
    /// A client connected.
    ConnectionOpened { peer: SocketAddr },

    /// A connection ended, whether by the peer, a handler, the auth
    /// deadline, or server shutdown.  Emitted exactly once per connection.
    ConnectionClosed { peer: SocketAddr },

    /// Transport-level failure on an individual connection.
    ConnectionError { peer: SocketAddr, error: String },

    /// A frame that could not be decoded.  The frame was dropped; the
    /// connection stays open.
    ParseError { raw: String, error: String },

    /// A call is about to be routed to its handler.
    Dispatch { method: String, authorized: bool },

    /// The client answered a request this peer sent earlier.
    ReplyReceived {
        id: serde_json::Value,
        result: Option<serde_json::Value>,
        error: Option<serde_json::Value>,
    },

    /// The listening socket shut down.
    ServerClosed,

    /// The listening socket failed; surfaced upward, never auto-restarted.
    ServerError { error: String },
}

/// Receiving side of the observation channel, handed to the embedder by
/// [`crate::MockServer::bind`].
pub type ObservationReceiver = mpsc::UnboundedReceiver<Observation>;

/// Emits observations without ever blocking or failing.
#[derive(Clone, Debug)]
pub(crate) struct ObservationSink {
    sender: mpsc::UnboundedSender<Observation>,
}

impl ObservationSink {
    pub(crate) fn channel() -> (Self, ObservationReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub(crate) fn emit(&self, observation: Observation) {
        trace!(?observation, "observation");
        if self.sender.send(observation).is_err() {
            debug!("no observation receiver; observation discarded");
        }
    }
}
