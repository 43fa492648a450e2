//! Mock WebSocket signaling server.
//!
//! Listens on `127.0.0.1:0`, records every envelope clients send, answers
//! heartbeat pings while echo is enabled, and lets the test push envelopes,
//! close with a chosen code, or drop the socket without a close frame.
//!
//! # Example
//!
//! ```rust,ignore
//! let server = MockSignalingServer::start().await;
//! server.set_echo(false); // let the heartbeat time out
//! let config = SignalingConfig::new(server.url());
//! ```

use futures::{SinkExt, StreamExt};
use signaling_protocol::codec::{decode_client_media_action, decode_envelope, encode_envelope};
use signaling_protocol::envelope::MEDIA_NAMESPACE;
use signaling_protocol::media::ClientMediaAction;
use signaling_protocol::Envelope;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::accept_hdr_async;

use crate::mock_peer::wait_for;

#[derive(Debug, Clone)]
enum ServerCommand {
    Send(Envelope),
    Close(u16),
    Drop,
}

#[derive(Debug, Default)]
struct ServerState {
    echo: AtomicBool,
    connections: AtomicUsize,
    pings: AtomicUsize,
    received: Mutex<Vec<Envelope>>,
    tickets: Mutex<Vec<String>>,
}

/// In-process signaling server for tests.
#[derive(Debug)]
pub struct MockSignalingServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    commands: broadcast::Sender<ServerCommand>,
    task: JoinHandle<()>,
}

impl MockSignalingServer {
    /// Bind and start accepting. Echo replies are on.
    ///
    /// # Panics
    ///
    /// Panics if the listener cannot bind.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock signaling server");
        let addr = listener.local_addr().expect("local addr");
        let state = Arc::new(ServerState::default());
        state.echo.store(true, Ordering::SeqCst);
        let (commands, _) = broadcast::channel(64);

        let accept_state = Arc::clone(&state);
        let accept_commands = commands.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = Arc::clone(&accept_state);
                let commands = accept_commands.subscribe();
                tokio::spawn(serve(stream, state, commands));
            }
        });

        Self {
            addr,
            state,
            commands,
            task,
        }
    }

    /// `ws://` URL of the server.
    #[must_use]
    pub fn url(&self) -> String {
        format!("ws://{}/signaling", self.addr)
    }

    /// Turn heartbeat echo replies on or off.
    pub fn set_echo(&self, echo: bool) {
        self.state.echo.store(echo, Ordering::SeqCst);
    }

    /// Connections accepted so far.
    #[must_use]
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Heartbeat pings received so far.
    #[must_use]
    pub fn pings(&self) -> usize {
        self.state.pings.load(Ordering::SeqCst)
    }

    /// `ticket` query parameters, one per connection.
    #[must_use]
    pub fn tickets(&self) -> Vec<String> {
        self.state.tickets.lock().unwrap().clone()
    }

    /// Non-echo envelopes received so far.
    #[must_use]
    pub fn received(&self) -> Vec<Envelope> {
        self.state.received.lock().unwrap().clone()
    }

    /// Media actions received so far, decoded.
    #[must_use]
    pub fn media_actions(&self) -> Vec<ClientMediaAction> {
        self.received()
            .iter()
            .filter(|e| e.namespace == MEDIA_NAMESPACE)
            .filter_map(|e| decode_client_media_action(e).ok())
            .collect()
    }

    /// Push an envelope to every open connection.
    pub fn send(&self, envelope: Envelope) {
        let _ = self.commands.send(ServerCommand::Send(envelope));
    }

    /// Close every open connection with `code`.
    pub fn close(&self, code: u16) {
        let _ = self.commands.send(ServerCommand::Close(code));
    }

    /// Drop every open connection without a close frame.
    pub fn drop_connections(&self) {
        let _ = self.commands.send(ServerCommand::Drop);
    }

    /// Wait until `count` connections have been accepted.
    pub async fn wait_for_connections(&self, count: usize) {
        wait_for(|| self.connections() >= count, "signaling connections").await;
    }

    /// Wait until a media action matching `predicate` has been received.
    pub async fn wait_for_media_action(
        &self,
        mut predicate: impl FnMut(&ClientMediaAction) -> bool,
    ) -> ClientMediaAction {
        wait_for(
            || self.media_actions().iter().any(&mut predicate),
            "media action",
        )
        .await;
        self.media_actions()
            .into_iter()
            .find(|a| predicate(a))
            .expect("media action vanished")
    }
}

impl Drop for MockSignalingServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    stream: TcpStream,
    state: Arc<ServerState>,
    mut commands: broadcast::Receiver<ServerCommand>,
) {
    let ticket_state = Arc::clone(&state);
    let callback = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let ticket = request
            .uri()
            .query()
            .and_then(|q| q.split('&').find_map(|pair| pair.strip_prefix("ticket=")))
            .unwrap_or_default()
            .to_string();
        ticket_state.tickets.lock().unwrap().push(ticket);
        Ok(response)
    };

    let Ok(ws) = accept_hdr_async(stream, callback).await else {
        return;
    };
    state.connections.fetch_add(1, Ordering::SeqCst);
    let (mut sink, mut source) = ws.split();

    loop {
        tokio::select! {
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let Ok(envelope) = decode_envelope(&text) else {
                        continue;
                    };
                    if envelope.is_echo() {
                        state.pings.fetch_add(1, Ordering::SeqCst);
                        if state.echo.load(Ordering::SeqCst) && sink.send(Message::Text(text)).await.is_err() {
                            return;
                        }
                    } else {
                        state.received.lock().unwrap().push(envelope);
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                Some(Ok(_)) => {}
            },

            command = commands.recv() => match command {
                Ok(ServerCommand::Send(envelope)) => {
                    let text = encode_envelope(&envelope).expect("encode envelope");
                    if sink.send(Message::Text(text)).await.is_err() {
                        return;
                    }
                }
                Ok(ServerCommand::Close(code)) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: "mock close".into(),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    return;
                }
                Ok(ServerCommand::Drop) | Err(_) => return,
            },
        }
    }
}
