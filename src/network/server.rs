use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::core::{CommandResult, Config, ExecMode, NodeIdentity, Result};
use crate::protocol::{Message, MessageCodec, MessageId, MessageKind};

/// Executes commands arriving over command connections.
///
/// The command string is opaque to this crate; what executing one means
/// belongs to the host application. Implementations should return promptly
/// or offload internally, as a handler runs on the async worker pool.
pub trait CommandHandler: Send + Sync + 'static {
    /// Executes a command and returns its result
    fn handle(&self, command: &str, exec_mode: ExecMode, unattended: bool) -> CommandResult;
}

/// Accepts incoming command connections and serves requests on them
pub struct CommandServer {
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
    connections: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl CommandServer {
    /// Binds the command listener on the identity's advertised address
    pub async fn bind(
        identity: NodeIdentity,
        config: &Config,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<CommandServer> {
        let listener = TcpListener::bind(identity.command_addr()).await?;
        let local_addr = listener.local_addr()?;

        let connections: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));
        let accept_connections = Arc::clone(&connections);
        let accept_identity = identity.clone();
        let handshake_timeout = config.handshake_timeout;

        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        debug!(%addr, "incoming command connection");
                        let task = tokio::spawn(serve_connection(
                            stream,
                            accept_identity.clone(),
                            Arc::clone(&handler),
                            handshake_timeout,
                        ));
                        accept_connections
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .push(task);
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
        });

        info!(node = %identity.id, addr = %local_addr, "command server listening");
        Ok(CommandServer {
            local_addr,
            accept_task,
            connections,
        })
    }

    /// Returns the address the server is listening on
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting and severs all live connections; safe to call repeatedly
    pub fn shutdown(&self) {
        self.accept_task.abort();
        let tasks: Vec<_> = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
    }
}

impl Drop for CommandServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Serves one command connection: handshake, then request/response traffic.
async fn serve_connection(
    stream: TcpStream,
    identity: NodeIdentity,
    handler: Arc<dyn CommandHandler>,
    handshake_timeout: Duration,
) {
    let mut framed = Framed::new(stream, MessageCodec::new());

    let hello = match timeout(handshake_timeout, framed.next()).await {
        Ok(Some(Ok(message))) => message,
        Ok(Some(Err(e))) => {
            debug!(error = %e, "handshake failed");
            return;
        }
        Ok(None) => return,
        Err(_) => {
            debug!("handshake timed out");
            return;
        }
    };
    let client_id = match hello.kind {
        MessageKind::Hello { identity: client } => client.id,
        other => {
            debug!(kind = other.name(), "expected Hello, dropping connection");
            return;
        }
    };
    let greeting = Message::hello_to(identity.clone(), client_id.clone(), MessageId(0));
    if framed.send(greeting).await.is_err() {
        return;
    }
    debug!(peer = %client_id, "command connection established");

    let (mut sink, mut stream) = framed.split();
    let (responses, mut responses_rx) = mpsc::channel::<Message>(32);

    let writer = tokio::spawn(async move {
        while let Some(message) = responses_rx.recv().await {
            if sink.send(message).await.is_err() {
                return;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        let message = match frame {
            Ok(message) => message,
            Err(e) => {
                debug!(peer = %client_id, error = %e, "read failed, dropping connection");
                break;
            }
        };
        match message.kind {
            MessageKind::CommandRequest {
                command,
                unattended,
                exec_mode,
            } => {
                let ack = Message::ack(identity.id.clone(), client_id.clone(), message.message_id);
                if responses.send(ack).await.is_err() {
                    break;
                }

                // Execute off the read loop; a slow command must not hold up
                // requests queued behind it, so responses may complete out
                // of order and the client correlates by message id.
                let handler = Arc::clone(&handler);
                let responses = responses.clone();
                let source = identity.id.clone();
                let destination = client_id.clone();
                let message_id = message.message_id;
                tokio::spawn(async move {
                    let result = handler.handle(&command, exec_mode, unattended);
                    let response = Message::response(source, destination, message_id, result);
                    let _ = responses.send(response).await;
                });
            }
            other => debug!(peer = %client_id, kind = other.name(), "discarding unexpected message"),
        }
    }

    // Let in-flight executions flush their responses before the writer goes.
    drop(responses);
    let _ = writer.await;
}
