use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rand::distr::Alphanumeric;
use rand::Rng;
use tokio::sync::{mpsc, oneshot};

use leap_protocol::{ErrorCode, Message, ProtocolError};

/// Length of the one-time connect token
pub const TOKEN_LENGTH: usize = 64;

/// Deadline for queueing a close frame on one tunnel
const CLOSE_SEND_TIMEOUT: Duration = Duration::from_millis(500);

/// Frames queued for a tunnel's channel writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// An encoded protocol message
    Message(String),
    /// Close the channel; `going_away` selects the close code
    Close { going_away: bool },
}

/// What the relay client answered for one dispatched request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Raw response bytes, to be written back verbatim
    Data(Vec<u8>),
    /// The client could not forward the request
    Error(ErrorCode),
}

/// Result of handing a reply from the channel to the tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// A waiting dispatch received it
    Delivered,
    /// It answered a request whose caller already gave up
    Discarded,
    /// Nobody asked for it
    Unsolicited,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Tunnel {0} has no connected client")]
    NotConnected(String),

    #[error("Tunnel channel closed")]
    ChannelClosed,

    #[error("Timed out waiting for the tunnel client")]
    TimedOut,

    #[error("Failed to encode request: {0}")]
    Encode(#[from] ProtocolError),
}

/// Single-item handoff between the channel reader and the in-flight dispatch
#[derive(Default)]
struct ReplySlot {
    waiter: Option<oneshot::Sender<Reply>>,
    /// Replies still owed to dispatches that were abandoned after sending
    orphaned: usize,
}

/// Server-side relay endpoint for one client
///
/// The channel carries no request identifier, so a reply is matched to a
/// request purely by order. `dispatch_lock` keeps at most one request in
/// flight; every other caller queues on it in arrival order.
pub struct Tunnel {
    subdomain: String,
    token: String,
    claimed: AtomicBool,
    channel: Mutex<Option<mpsc::Sender<Outbound>>>,
    dispatch_lock: tokio::sync::Mutex<()>,
    slot: Mutex<ReplySlot>,
}

impl Tunnel {
    /// Create a pending tunnel with a fresh token
    pub fn new(subdomain: impl Into<String>) -> Self {
        Self {
            subdomain: subdomain.into(),
            token: generate_token(),
            claimed: AtomicBool::new(false),
            channel: Mutex::new(None),
            dispatch_lock: tokio::sync::Mutex::new(()),
            slot: Mutex::new(ReplySlot::default()),
        }
    }

    pub fn subdomain(&self) -> &str {
        &self.subdomain
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Whether a connect handshake has already used the token
    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    /// Mark the token as used; false if it already was
    pub(crate) fn try_claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_connected(&self) -> bool {
        self.channel.lock().is_some()
    }

    /// Bind the live channel's outbound queue
    pub fn attach(&self, sender: mpsc::Sender<Outbound>) {
        *self.slot.lock() = ReplySlot::default();
        *self.channel.lock() = Some(sender);
    }

    /// Drop the channel; a dispatch waiting for a reply fails with `ChannelClosed`
    pub fn detach(&self) {
        self.channel.lock().take();
        *self.slot.lock() = ReplySlot::default();
    }

    /// Send a raw request over the channel and wait for the correlated reply
    ///
    /// Waits forever for the reply when `timeout` is `None`.
    pub async fn dispatch(
        &self,
        raw_request: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<Reply, DispatchError> {
        // Declared first so it is released last, after `pending` settles the slot
        let _in_flight = self.dispatch_lock.lock().await;

        let frame = Message::Request(raw_request).encode()?;

        let (reply_tx, reply_rx) = oneshot::channel();
        // The waiter goes in under the channel lock, so a concurrent `detach`
        // either comes first (not connected) or drops the waiter (channel closed)
        let (sender, mut pending) = {
            let channel = self.channel.lock();
            let sender = channel
                .clone()
                .ok_or_else(|| DispatchError::NotConnected(self.subdomain.clone()))?;
            (sender, PendingReply::install(self, reply_tx))
        };

        if sender.send(Outbound::Message(frame)).await.is_err() {
            return Err(DispatchError::ChannelClosed);
        }
        pending.sent = true;

        let received = match timeout {
            Some(limit) => tokio::time::timeout(limit, reply_rx)
                .await
                .map_err(|_| DispatchError::TimedOut)?,
            None => reply_rx.await,
        };

        pending.settled = true;
        received.map_err(|_| DispatchError::ChannelClosed)
    }

    /// Hand a reply read from the channel to whoever is waiting for it
    pub fn deliver(&self, reply: Reply) -> Delivery {
        let mut slot = self.slot.lock();
        if slot.orphaned > 0 {
            slot.orphaned -= 1;
            return Delivery::Discarded;
        }
        match slot.waiter.take() {
            Some(waiter) => {
                // The receiver may have been dropped an instant ago; nothing to do then
                let _ = waiter.send(reply);
                Delivery::Delivered
            }
            None => Delivery::Unsolicited,
        }
    }

    /// Ask the client to close the channel
    pub async fn close(&self, going_away: bool) -> bool {
        let Some(sender) = self.channel.lock().clone() else {
            return false;
        };
        matches!(
            tokio::time::timeout(CLOSE_SEND_TIMEOUT, sender.send(Outbound::Close { going_away })).await,
            Ok(Ok(()))
        )
    }
}

/// Settles the reply slot however the dispatch future ends
struct PendingReply<'a> {
    tunnel: &'a Tunnel,
    sent: bool,
    settled: bool,
}

impl<'a> PendingReply<'a> {
    fn install(tunnel: &'a Tunnel, waiter: oneshot::Sender<Reply>) -> Self {
        tunnel.slot.lock().waiter = Some(waiter);
        Self {
            tunnel,
            sent: false,
            settled: false,
        }
    }
}

impl Drop for PendingReply<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut slot = self.tunnel.slot.lock();
        // Only one dispatch runs at a time, so a waiter still in the slot is ours
        if slot.waiter.take().is_some() && self.sent {
            slot.orphaned += 1;
            tracing::debug!(
                "Request on {} abandoned before its reply; next reply will be discarded",
                self.tunnel.subdomain
            );
        }
    }
}

/// Generate a connect token from the alphanumeric alphabet
pub fn generate_token() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LENGTH)
        .map(char::from)
        .collect()
}
