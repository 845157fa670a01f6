use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, trace, warn};

use crate::core::{CommandResult, Config, Error, ExecMode, NodeIdentity, Result};
use crate::protocol::{Message, MessageCodec, MessageId, MessageKind};

/// Outstanding requests awaiting their correlated response
type PendingMap = HashMap<MessageId, oneshot::Sender<Result<CommandResult>>>;

/// State shared between the channel handle and its socket tasks
struct Shared {
    /// Local identity, used as the request source
    local: NodeIdentity,
    /// Peer this channel is connected to
    remote: NodeIdentity,
    /// Correlation table for in-flight requests
    pending: Mutex<PendingMap>,
    /// Whether the channel still accepts sends
    open: AtomicBool,
    /// Message id counter for requests on this channel
    next_id: AtomicU64,
}

impl Shared {
    fn lock_pending(&self) -> MutexGuard<'_, PendingMap> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    /// Fails every outstanding waiter with a fresh instance of `err`
    fn fail_all(&self, err: fn() -> Error) {
        let waiters: Vec<_> = self.lock_pending().drain().map(|(_, tx)| tx).collect();
        for waiter in waiters {
            let _ = waiter.send(Err(err()));
        }
    }

    /// Routes an incoming frame to its waiter
    fn dispatch(&self, message: Message) {
        match message.kind {
            MessageKind::CommandResponse { result } => {
                match self.lock_pending().remove(&message.message_id) {
                    Some(waiter) => {
                        let _ = waiter.send(Ok(result));
                    }
                    None => trace!(
                        peer = %self.remote.id,
                        id = %message.message_id,
                        "discarding late or duplicate response"
                    ),
                }
            }
            MessageKind::Ack => {
                trace!(peer = %self.remote.id, id = %message.message_id, "request acknowledged");
            }
            other => {
                debug!(peer = %self.remote.id, kind = other.name(), "discarding unexpected message");
            }
        }
    }
}

/// Reliable point-to-point command connection to one peer
///
/// A channel is either fully connected or closed. Concurrent `send` calls
/// are multiplexed by message id; the read loop keeps servicing other
/// in-flight requests while any one caller waits.
pub struct CommandChannel {
    shared: Arc<Shared>,
    outgoing: mpsc::Sender<Message>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CommandChannel {
    /// Connects to the peer and performs the version handshake.
    ///
    /// The codec rejects a mismatched protocol version on the first frame,
    /// so an incompatible peer surfaces as `UnsupportedVersion` here.
    pub async fn connect(
        local: NodeIdentity,
        remote: NodeIdentity,
        config: &Config,
    ) -> Result<CommandChannel> {
        let stream = TcpStream::connect(remote.command_addr()).await.map_err(|e| {
            Error::connect_failed(format!("{}: {}", remote.command_addr(), e))
        })?;
        let mut framed = Framed::new(stream, MessageCodec::new());

        let greeting = Message::hello_to(local.clone(), remote.id.clone(), MessageId(0));
        framed.send(greeting).await.map_err(|e| match e {
            Error::Io(io) => Error::connect_failed(io.to_string()),
            other => other,
        })?;

        let first = match timeout(config.handshake_timeout, framed.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(e))) => return Err(e),
            Ok(None) => return Err(Error::connect_failed("connection closed during handshake")),
            Err(_) => return Err(Error::connect_failed("handshake timed out")),
        };

        match first.kind {
            MessageKind::Hello { ref identity } if identity.id == remote.id => {}
            MessageKind::Hello { identity } => {
                return Err(Error::connect_failed(format!(
                    "peer identified as {}, expected {}",
                    identity.id, remote.id
                )));
            }
            other => {
                return Err(Error::connect_failed(format!(
                    "unexpected {} during handshake",
                    other.name()
                )));
            }
        }

        let (sink, stream) = framed.split();
        let (outgoing, outgoing_rx) = mpsc::channel(32);
        let shared = Arc::new(Shared {
            local,
            remote,
            pending: Mutex::new(HashMap::new()),
            open: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
        });

        let writer = tokio::spawn(write_loop(sink, outgoing_rx, Arc::clone(&shared)));
        let reader = tokio::spawn(read_loop(stream, Arc::clone(&shared)));
        debug!(peer = %shared.remote.id, "channel connected");

        Ok(CommandChannel {
            shared,
            outgoing,
            tasks: Mutex::new(vec![writer, reader]),
        })
    }

    /// Returns the peer this channel is connected to
    pub fn remote(&self) -> &NodeIdentity {
        &self.shared.remote
    }

    /// Returns whether the channel still accepts sends
    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    /// Sends a command and waits for its correlated response.
    ///
    /// Suspends only the calling task. Expiry of `timeout_after` forgets
    /// this request and returns `TimedOut`; the channel and any other
    /// in-flight requests are unaffected.
    pub async fn send(
        &self,
        command: impl Into<String>,
        exec_mode: ExecMode,
        unattended: bool,
        timeout_after: Duration,
    ) -> Result<CommandResult> {
        if !self.is_open() {
            return Err(Error::ChannelClosed);
        }

        let message_id = MessageId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let (waiter, response) = oneshot::channel();
        self.shared.lock_pending().insert(message_id, waiter);

        let request = Message::request(
            self.shared.local.id.clone(),
            self.shared.remote.id.clone(),
            message_id,
            command,
            exec_mode,
            unattended,
        );
        if self.outgoing.send(request).await.is_err() {
            self.shared.lock_pending().remove(&message_id);
            return Err(Error::ChannelClosed);
        }

        match timeout(timeout_after, response).await {
            Ok(Ok(result)) => result,
            // Waiter dropped without a verdict: the channel went away.
            Ok(Err(_)) => Err(Error::ChannelClosed),
            Err(_) => {
                self.shared.lock_pending().remove(&message_id);
                Err(Error::TimedOut)
            }
        }
    }

    /// Closes the channel, failing all outstanding waiters with
    /// `ChannelClosed`. Safe to call repeatedly.
    pub fn close(&self) {
        if !self.shared.open.swap(false, Ordering::SeqCst) {
            return;
        }
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
        self.shared.fail_all(|| Error::ChannelClosed);
        debug!(peer = %self.shared.remote.id, "channel closed");
    }
}

impl Drop for CommandChannel {
    fn drop(&mut self) {
        self.close();
    }
}

async fn write_loop(
    mut sink: SplitSink<Framed<TcpStream, MessageCodec>, Message>,
    mut outgoing: mpsc::Receiver<Message>,
    shared: Arc<Shared>,
) {
    while let Some(message) = outgoing.recv().await {
        if let Err(e) = sink.send(message).await {
            warn!(peer = %shared.remote.id, error = %e, "write failed, closing channel");
            shared.close();
            shared.fail_all(|| Error::ConnectionLost);
            return;
        }
    }
}

async fn read_loop(mut stream: SplitStream<Framed<TcpStream, MessageCodec>>, shared: Arc<Shared>) {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(message) => shared.dispatch(message),
            Err(e) => {
                warn!(peer = %shared.remote.id, error = %e, "read failed, closing channel");
                break;
            }
        }
    }
    // EOF or transport error: every outstanding waiter learns at once.
    shared.close();
    shared.fail_all(|| Error::ConnectionLost);
}
