//! Request-id keyed registry of open log channels.
//!
//! A job never talks to a connection directly: it relays lines for its request id and the
//! broker forwards them to whichever channel is currently bound, if any. Delivery is
//! best-effort and never influences the outcome of a job.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Identifies one open log channel (one client connection).
pub type ChannelId = u64;

/// Sending half of a client log connection.
#[derive(Debug, Clone)]
pub struct LogChannel {
    id: ChannelId,
    tx: mpsc::UnboundedSender<String>,
}

impl LogChannel {
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Whether the receiving side is still alive.
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Routes log lines to the channel bound for a request id.
#[derive(Debug, Default)]
pub struct LogBroker {
    bindings: DashMap<String, LogChannel>,
    next_id: AtomicU64,
}

impl LogBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new channel. The receiver yields relayed lines in order.
    pub fn open_channel(&self) -> (LogChannel, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        (LogChannel { id, tx }, rx)
    }

    /// Bind `channel` to `request_id`, replacing any earlier binding for that id.
    pub fn bind(&self, request_id: impl Into<String>, channel: LogChannel) {
        let request_id = request_id.into();
        debug!(request_id = %request_id, channel = channel.id, "log channel bound");
        if let Some(previous) = self.bindings.insert(request_id.clone(), channel) {
            debug!(request_id = %request_id, channel = previous.id, "replaced earlier log channel");
        }
    }

    /// Drop every binding that points at `channel`. Bindings to other channels are untouched.
    pub fn unbind(&self, channel: ChannelId) {
        self.bindings.retain(|_, bound| bound.id != channel);
    }

    /// Send `message` to the channel bound for `request_id`. Dropped silently if unbound or closed.
    pub fn relay(&self, request_id: &str, message: impl Into<String>) {
        let Some(bound) = self.bindings.get(request_id) else {
            return;
        };
        if bound.tx.send(message.into()).is_err() {
            trace!(request_id, channel = bound.id, "log channel closed, line dropped");
        }
    }

    pub fn is_bound(&self, request_id: &str) -> bool {
        self.bindings.contains_key(request_id)
    }

    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }
}
