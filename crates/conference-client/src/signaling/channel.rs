//! `SignalingChannel` actor - owns the WebSocket and the heartbeat.
//!
//! The socket is split: the actor keeps the write half and a reader task
//! forwards frames back into the actor tagged with a transport generation.
//! Bumping the generation on every teardown makes late frames from an old
//! socket harmless.

use super::{classify_close, SignalingConfig, SignalingEvent, SignalingState};
use crate::errors::ClientError;
use crate::observability::metrics;
use crate::timing::{deadline_after, sleep_until_deadline};
use common::secret::{ExposeSecret, SecretString};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use signaling_protocol::codec::{decode_envelope, encode_envelope};
use signaling_protocol::Envelope;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Mailbox capacity for channel commands.
const SIGNALING_CHANNEL_BUFFER: usize = 256;

/// Upper bound for the WebSocket handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound for flushing a close frame on `disconnect()`.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug)]
enum SignalingMessage {
    Connect {
        ticket: SecretString,
        respond_to: oneshot::Sender<Result<(), ClientError>>,
    },
    Send {
        envelope: Envelope,
        respond_to: oneshot::Sender<Result<(), ClientError>>,
    },
    Disconnect {
        respond_to: oneshot::Sender<()>,
    },
}

#[derive(Debug)]
enum TransportEvent {
    Frame(String),
    Closed { code: Option<u16>, reason: String },
}

#[derive(Debug)]
struct TransportMessage {
    generation: u64,
    event: TransportEvent,
}

/// Handle to a running signaling channel.
#[derive(Clone, Debug)]
pub struct SignalingHandle {
    sender: mpsc::Sender<SignalingMessage>,
    state: watch::Receiver<SignalingState>,
    cancel_token: CancellationToken,
}

impl SignalingHandle {
    /// Open (or reopen) the transport with a room ticket.
    ///
    /// # Errors
    ///
    /// `ChannelClosed` once the channel is `Closed`; `Signaling` if the
    /// handshake fails (the channel is then `Disconnected`).
    pub async fn connect(&self, ticket: SecretString) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SignalingMessage::Connect {
                ticket,
                respond_to: tx,
            })
            .await
            .map_err(|e| ClientError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| ClientError::Internal(format!("response receive failed: {e}")))?
    }

    /// Send one envelope.
    ///
    /// # Errors
    ///
    /// `ChannelClosed` unless the channel is `Connected`.
    pub async fn send(&self, envelope: Envelope) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SignalingMessage::Send {
                envelope,
                respond_to: tx,
            })
            .await
            .map_err(|_| ClientError::ChannelClosed)?;

        rx.await.map_err(|_| ClientError::ChannelClosed)?
    }

    /// Close gracefully (code 1000). The channel ends up `Closed`.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Internal` if the actor is gone.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SignalingMessage::Disconnect { respond_to: tx })
            .await
            .map_err(|e| ClientError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| ClientError::Internal(format!("response receive failed: {e}")))
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        *self.state.borrow() == SignalingState::Connected
    }

    #[must_use]
    pub fn state(&self) -> SignalingState {
        *self.state.borrow()
    }

    /// Stop the actor without a close handshake.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }
}

/// Actor owning the WebSocket transport.
pub struct SignalingChannel {
    config: SignalingConfig,
    receiver: mpsc::Receiver<SignalingMessage>,
    events_tx: mpsc::UnboundedSender<SignalingEvent>,
    state: SignalingState,
    state_tx: watch::Sender<SignalingState>,
    cancel_token: CancellationToken,

    sink: Option<SplitSink<WsStream, Message>>,
    reader: Option<JoinHandle<()>>,
    generation: u64,
    transport_tx: mpsc::UnboundedSender<TransportMessage>,
    transport_rx: mpsc::UnboundedReceiver<TransportMessage>,

    ping_seq: u64,
    next_ping: Option<Instant>,
    echo_deadline: Option<Instant>,
}

impl SignalingChannel {
    /// Spawn a channel. It starts in `Connecting` and does nothing until
    /// [`SignalingHandle::connect`] is called.
    #[must_use]
    pub fn spawn(
        config: SignalingConfig,
        cancel_token: CancellationToken,
    ) -> (
        SignalingHandle,
        mpsc::UnboundedReceiver<SignalingEvent>,
        JoinHandle<()>,
    ) {
        let (sender, receiver) = mpsc::channel(SIGNALING_CHANNEL_BUFFER);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SignalingState::Connecting);
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();

        let actor = Self {
            config,
            receiver,
            events_tx,
            state: SignalingState::Connecting,
            state_tx,
            cancel_token: cancel_token.clone(),
            sink: None,
            reader: None,
            generation: 0,
            transport_tx,
            transport_rx,
            ping_seq: 0,
            next_ping: None,
            echo_deadline: None,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = SignalingHandle {
            sender,
            state: state_rx,
            cancel_token,
        };

        (handle, events_rx, task_handle)
    }

    #[instrument(skip_all, name = "cc.signaling.channel")]
    async fn run(mut self) {
        debug!(target: "cc.signaling", url = %self.config.url, "Signaling channel started");

        loop {
            let deadline = self.next_timer();

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    debug!(target: "cc.signaling", "Signaling channel cancelled");
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(msg) => self.handle_message(msg).await,
                        None => {
                            debug!(target: "cc.signaling", "All handles dropped");
                            break;
                        }
                    }
                }

                Some(transport) = self.transport_rx.recv() => {
                    self.handle_transport(transport);
                }

                () = sleep_until_deadline(deadline) => {
                    self.handle_timer().await;
                }
            }
        }

        self.drop_transport();
    }

    async fn handle_message(&mut self, msg: SignalingMessage) {
        match msg {
            SignalingMessage::Connect { ticket, respond_to } => {
                let result = self.open(&ticket).await;
                let _ = respond_to.send(result);
            }
            SignalingMessage::Send {
                envelope,
                respond_to,
            } => {
                let result = self.send_envelope(&envelope).await;
                let _ = respond_to.send(result);
            }
            SignalingMessage::Disconnect { respond_to } => {
                self.close_gracefully().await;
                let _ = respond_to.send(());
            }
        }
    }

    async fn open(&mut self, ticket: &SecretString) -> Result<(), ClientError> {
        if self.state == SignalingState::Closed {
            return Err(ClientError::ChannelClosed);
        }

        // Reconnecting over a live transport replaces it without a
        // Disconnected transition.
        self.drop_transport();
        self.set_state(SignalingState::Connecting);

        let mut url = url::Url::parse(&self.config.url).map_err(|e| {
            self.set_state(SignalingState::Disconnected);
            ClientError::Signaling(format!("invalid signaling url: {e}"))
        })?;
        url.query_pairs_mut()
            .append_pair("ticket", ticket.expose_secret());

        let connected = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url.as_str())).await;
        let ws_stream = match connected {
            Ok(Ok((ws_stream, _response))) => ws_stream,
            Ok(Err(e)) => {
                warn!(target: "cc.signaling", error = %e, "WebSocket connect failed");
                self.set_state(SignalingState::Disconnected);
                return Err(ClientError::Signaling(format!("connect failed: {e}")));
            }
            Err(_) => {
                warn!(target: "cc.signaling", "WebSocket connect timed out");
                self.set_state(SignalingState::Disconnected);
                return Err(ClientError::Signaling("connect timed out".to_string()));
            }
        };

        let (sink, stream) = ws_stream.split();
        self.generation += 1;
        self.sink = Some(sink);
        self.reader = Some(tokio::spawn(read_transport(
            stream,
            self.generation,
            self.transport_tx.clone(),
        )));

        self.echo_deadline = None;
        self.next_ping = Some(deadline_after(Instant::now(), self.config.heartbeat_interval));
        self.set_state(SignalingState::Connected);
        Ok(())
    }

    async fn send_envelope(&mut self, envelope: &Envelope) -> Result<(), ClientError> {
        if self.state != SignalingState::Connected {
            return Err(ClientError::ChannelClosed);
        }
        let Some(sink) = self.sink.as_mut() else {
            return Err(ClientError::ChannelClosed);
        };

        let text = encode_envelope(envelope)?;
        if let Err(e) = sink.send(Message::Text(text)).await {
            warn!(target: "cc.signaling", error = %e, "WebSocket write failed");
            self.drop_transport();
            self.set_state(SignalingState::Disconnected);
            return Err(ClientError::Signaling(format!("send failed: {e}")));
        }
        Ok(())
    }

    async fn close_gracefully(&mut self) {
        if self.state == SignalingState::Closed {
            return;
        }

        if let Some(mut sink) = self.sink.take() {
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: "client disconnect".into(),
            };
            let flushed =
                tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, sink.send(Message::Close(Some(frame))))
                    .await;
            if !matches!(flushed, Ok(Ok(()))) {
                debug!(target: "cc.signaling", "Close frame not delivered");
            }
        }

        self.drop_transport();
        self.set_state(SignalingState::Closed);
    }

    fn handle_transport(&mut self, transport: TransportMessage) {
        if transport.generation != self.generation || self.sink.is_none() {
            return;
        }

        match transport.event {
            TransportEvent::Frame(text) => self.handle_frame(&text),
            TransportEvent::Closed { code, reason } => {
                let next = classify_close(code);
                info!(
                    target: "cc.signaling",
                    code = ?code,
                    reason = %reason,
                    next_state = next.as_str(),
                    "Signaling transport closed"
                );
                self.drop_transport();
                self.set_state(next);
            }
        }
    }

    fn handle_frame(&mut self, text: &str) {
        let envelope = match decode_envelope(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(target: "cc.signaling", error = %e, "Dropping undecodable frame");
                return;
            }
        };

        if envelope.is_echo() {
            match envelope.echo_seq() {
                Some(seq) if seq != self.ping_seq => {
                    debug!(target: "cc.signaling", seq, expected = self.ping_seq, "Stale echo");
                }
                _ => {
                    self.echo_deadline = None;
                }
            }
            return;
        }

        let _ = self
            .events_tx
            .send(SignalingEvent::MessageReceived(envelope));
    }

    async fn handle_timer(&mut self) {
        let now = Instant::now();

        if self.echo_deadline.is_some_and(|deadline| deadline <= now) {
            warn!(
                target: "cc.signaling",
                timeout_ms = u64::try_from(self.config.heartbeat_timeout.as_millis()).unwrap_or(u64::MAX),
                "Heartbeat echo not received, dropping transport"
            );
            metrics::record_heartbeat_timeout();
            self.drop_transport();
            self.set_state(SignalingState::Disconnected);
            return;
        }

        if self.next_ping.is_some_and(|at| at <= now) {
            self.ping_seq += 1;
            self.next_ping = Some(deadline_after(now, self.config.heartbeat_interval));
            if self.echo_deadline.is_none() {
                self.echo_deadline = Some(deadline_after(now, self.config.heartbeat_timeout));
            }
            let ping = Envelope::echo_ping(self.ping_seq);
            // A failed write already moved the channel to Disconnected.
            let _ = self.send_envelope(&ping).await;
        }
    }

    fn next_timer(&self) -> Option<Instant> {
        if self.state != SignalingState::Connected {
            return None;
        }
        match (self.next_ping, self.echo_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn drop_transport(&mut self) {
        self.generation += 1;
        self.sink = None;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.next_ping = None;
        self.echo_deadline = None;
    }

    fn set_state(&mut self, next: SignalingState) {
        if self.state == next || self.state == SignalingState::Closed {
            return;
        }

        info!(
            target: "cc.signaling",
            from = self.state.as_str(),
            to = next.as_str(),
            "Signaling state changed"
        );
        self.state = next;
        metrics::record_signaling_state(next.as_str());
        self.state_tx.send_replace(next);
        let _ = self
            .events_tx
            .send(SignalingEvent::ConnectionStateChanged(next));
    }
}

/// Forward frames from the read half until the socket ends.
async fn read_transport(
    mut stream: SplitStream<WsStream>,
    generation: u64,
    tx: mpsc::UnboundedSender<TransportMessage>,
) {
    let closed = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                let _ = tx.send(TransportMessage {
                    generation,
                    event: TransportEvent::Frame(text),
                });
            }
            Some(Ok(Message::Close(frame))) => {
                break TransportEvent::Closed {
                    code: frame.as_ref().map(|f| u16::from(f.code)),
                    reason: frame.map(|f| f.reason.into_owned()).unwrap_or_default(),
                };
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                break TransportEvent::Closed {
                    code: None,
                    reason: e.to_string(),
                };
            }
            None => {
                break TransportEvent::Closed {
                    code: None,
                    reason: "stream ended".to_string(),
                };
            }
        }
    };

    let _ = tx.send(TransportMessage {
        generation,
        event: closed,
    });
}
