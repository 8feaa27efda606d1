// Persistent connection to the dispatcher
//
// State machine: Disconnected -> Connecting -> Connected -> Disconnected, driven
// by a fixed-delay RetryPolicy and repeated for the lifetime of the process.
// The session loop is the only writer on the socket: results from in-flight
// executions come back over a channel and are sent one whole message at a time.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use testmachine_common::protocol::{encode_handshake, encode_result};
use testmachine_common::types::Handshake;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::executor::TaskDispatcher;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// How long to wait before the next connection attempt
///
/// The delay is fixed: no growth, no attempt cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    delay: Duration,
}

impl RetryPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self { delay }
    }

    /// Delay after `attempt` consecutive failures
    pub fn delay_for(&self, _attempt: u64) -> Duration {
        self.delay
    }
}

/// A bidirectional text-message channel to the dispatcher
#[async_trait]
pub trait Transport: Send {
    async fn send_text(&mut self, text: String) -> Result<()>;

    /// Next text message, or `None` once the peer closed the connection.
    /// Must be cancel-safe: it is raced against outbound results.
    async fn recv_text(&mut self) -> Result<Option<String>>;

    /// Best-effort graceful close
    async fn close(&mut self);
}

#[async_trait]
pub trait Connector: Send + Sync {
    type Transport: Transport;

    async fn connect(&self) -> Result<Self::Transport>;
}

/// WebSocket client connector
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WsConnector {
    type Transport = WsTransport;

    async fn connect(&self) -> Result<WsTransport> {
        let (stream, response) = connect_async(self.url.as_str())
            .await
            .with_context(|| format!("WebSocket connect to {} failed", self.url))?;
        debug!(status = %response.status(), "WebSocket handshake complete");
        Ok(WsTransport { stream })
    }
}

pub struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.stream
            .send(Message::text(text))
            .await
            .context("WebSocket send failed")
    }

    async fn recv_text(&mut self) -> Result<Option<String>> {
        loop {
            match self.stream.next().await {
                None => return Ok(None),
                Some(Ok(Message::Text(text))) => return Ok(Some(text.to_string())),
                Some(Ok(Message::Binary(bytes))) => {
                    return Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(frame = ?frame, "Dispatcher sent close frame");
                    return Ok(None);
                }
                // Ping replies are queued by tungstenite itself
                Some(Ok(_)) => continue,
                Some(Err(WsError::ConnectionClosed)) => return Ok(None),
                Some(Err(e)) => return Err(e).context("WebSocket receive failed"),
            }
        }
    }

    async fn close(&mut self) {
        match tokio::time::timeout(CLOSE_TIMEOUT, self.stream.close(None)).await {
            Ok(Ok(())) => debug!("WebSocket closed"),
            Ok(Err(e)) => debug!(error = %e, "WebSocket close failed"),
            Err(_) => debug!("WebSocket close timed out"),
        }
    }
}

enum SessionEnd {
    Shutdown,
    Closed,
    Failed(anyhow::Error),
}

pub struct ConnectionManager<C> {
    connector: C,
    dispatcher: TaskDispatcher,
    retry: RetryPolicy,
    state: watch::Sender<ConnectionState>,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, dispatcher: TaskDispatcher, retry: RetryPolicy) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            dispatcher,
            retry,
            state,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    /// Keep a connection open until `shutdown` is cancelled
    ///
    /// Connection failures never end the loop; each one is followed by exactly
    /// one retry delay.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut failures: u64 = 0;

        loop {
            self.set_state(ConnectionState::Connecting);
            info!(attempt = failures + 1, "Connecting to dispatcher...");

            let connected = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.connector.connect() => result,
            };

            match connected {
                Ok(mut transport) => {
                    failures = 0;
                    self.set_state(ConnectionState::Connected);
                    match self.session(&mut transport, &shutdown).await {
                        SessionEnd::Shutdown => {
                            transport.close().await;
                            break;
                        }
                        SessionEnd::Closed => {
                            warn!(
                                retry_in_secs = self.retry.delay_for(failures).as_secs_f64(),
                                "Connection closed by dispatcher"
                            );
                        }
                        SessionEnd::Failed(e) => {
                            error!(
                                error = %format!("{:#}", e),
                                retry_in_secs = self.retry.delay_for(failures).as_secs_f64(),
                                "Connection lost"
                            );
                            transport.close().await;
                        }
                    }
                }
                Err(e) => {
                    failures += 1;
                    warn!(
                        error = %format!("{:#}", e),
                        retry_in_secs = self.retry.delay_for(failures).as_secs_f64(),
                        "Connection failed"
                    );
                }
            }

            self.set_state(ConnectionState::Disconnected);
            let delay = self.retry.delay_for(failures);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(ConnectionState::Disconnected);
        info!("Connection loop stopped");
    }

    async fn session(&self, transport: &mut C::Transport, shutdown: &CancellationToken) -> SessionEnd {
        let handshake = match encode_handshake(&Handshake::worker()) {
            Ok(handshake) => handshake,
            Err(e) => return SessionEnd::Failed(e.into()),
        };
        if let Err(e) = transport.send_text(handshake).await {
            return SessionEnd::Failed(e.context("Failed to send handshake"));
        }
        info!("Connected. Sent TestMachine role, waiting for tasks...");

        // Results of executions started on this connection; dropped with it
        let (results_tx, mut results_rx) = mpsc::unbounded_channel();

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => return SessionEnd::Shutdown,

                Some(result) = results_rx.recv() => {
                    let payload = match encode_result(&result) {
                        Ok(payload) => payload,
                        Err(e) => {
                            error!(error = %e, "Failed to encode result");
                            continue;
                        }
                    };
                    if let Err(e) = transport.send_text(payload).await {
                        return SessionEnd::Failed(e.context("Failed to send result"));
                    }
                    info!(status = %result.status(), exit_code = result.exit_code(), "Sent result");
                }

                message = transport.recv_text() => match message {
                    Ok(Some(text)) => {
                        if let Err(e) = self.dispatcher.dispatch(&text, results_tx.clone()) {
                            error!(error = %e, "Dropping malformed message");
                        }
                    }
                    Ok(None) => return SessionEnd::Closed,
                    Err(e) => return SessionEnd::Failed(e),
                },
            }
        }
    }
}
