use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use chat_core::{
    ChatError, ChatErrorCategory, LinkState, OutboundMessage, PushChannel, PushEvent, RetryPolicy,
};
use futures_util::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{broadcast, mpsc, oneshot},
    time::sleep,
};
use tokio_tungstenite::{WebSocketStream, connect_async, tungstenite::Message as WsMessage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::wire::{decode_frame, encode_outbound, encode_register};

const OUTBOUND_BUFFER: usize = 64;
const EVENT_BUFFER: usize = 256;

#[derive(Debug)]
enum PumpExit {
    Stopped,
    Dropped,
}

/// A frame waiting for the writer, with the caller's confirmation slot.
struct Outgoing {
    frame: String,
    written: oneshot::Sender<Result<(), ChatError>>,
}

fn task_stopped() -> ChatError {
    ChatError::network("channel_closed", "push socket task has stopped")
}

/// Push channel over a JSON WebSocket that reconnects until shut down.
pub struct SocketPushChannel {
    url: Url,
    policy: RetryPolicy,
    events: broadcast::Sender<PushEvent>,
    outbound_tx: mpsc::Sender<Outgoing>,
    outbound_rx: Mutex<Option<mpsc::Receiver<Outgoing>>>,
    connected: Arc<AtomicBool>,
    stop: CancellationToken,
}

impl SocketPushChannel {
    pub fn new(url: &str, policy: RetryPolicy) -> Result<Self, ChatError> {
        let url = Url::parse(url.trim()).map_err(|err| {
            ChatError::new(
                ChatErrorCategory::Config,
                "invalid_socket_url",
                format!("invalid socket URL '{url}': {err}"),
            )
        })?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ChatError::new(
                ChatErrorCategory::Config,
                "invalid_socket_url",
                format!("socket URL '{url}' must use ws:// or wss://"),
            ));
        }
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        Ok(Self {
            url,
            policy,
            events,
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            connected: Arc::new(AtomicBool::new(false)),
            stop: CancellationToken::new(),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Close the socket and stop reconnecting.
    pub fn shutdown(&self) {
        self.stop.cancel();
    }

    /// Queue `frame` and wait until it is on the wire or known to be lost.
    async fn enqueue(&self, frame: String) -> Result<(), ChatError> {
        if !self.is_connected() {
            return Err(ChatError::network(
                "channel_disconnected",
                "push socket is not connected",
            ));
        }
        let (written, confirmation) = oneshot::channel();
        self.outbound_tx
            .send(Outgoing { frame, written })
            .await
            .map_err(|_| task_stopped())?;
        confirmation.await.map_err(|_| task_stopped())?
    }
}

impl Drop for SocketPushChannel {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

#[async_trait]
impl PushChannel for SocketPushChannel {
    fn connect(&self) {
        let outbound = match self.outbound_rx.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        let Some(outbound) = outbound else {
            trace!("push socket already started");
            return;
        };
        tokio::spawn(run_connection(
            self.url.clone(),
            self.policy,
            outbound,
            self.events.clone(),
            self.connected.clone(),
            self.stop.clone(),
        ));
    }

    fn subscribe(&self) -> broadcast::Receiver<PushEvent> {
        self.events.subscribe()
    }

    async fn register_identity(&self, user_id: &str) -> Result<(), ChatError> {
        self.enqueue(encode_register(user_id)).await
    }

    async fn send(&self, message: OutboundMessage) -> Result<(), ChatError> {
        self.enqueue(encode_outbound(&message)).await
    }
}

async fn run_connection(
    url: Url,
    policy: RetryPolicy,
    mut outbound: mpsc::Receiver<Outgoing>,
    events: broadcast::Sender<PushEvent>,
    connected: Arc<AtomicBool>,
    stop: CancellationToken,
) {
    let mut backoff = policy.backoff();
    loop {
        let _ = events.send(PushEvent::Link(LinkState::Connecting));
        let attempt = tokio::select! {
            _ = stop.cancelled() => break,
            attempt = connect_async(url.as_str()) => attempt,
        };

        match attempt {
            Ok((stream, _)) => {
                backoff.reset();
                info!(url = %url, "push socket connected");
                fail_queued(&mut outbound);
                connected.store(true, Ordering::SeqCst);
                let _ = events.send(PushEvent::Link(LinkState::Connected));

                let exit = pump(stream, &mut outbound, &events, &stop).await;
                connected.store(false, Ordering::SeqCst);
                fail_queued(&mut outbound);
                let _ = events.send(PushEvent::Link(LinkState::Disconnected));
                if matches!(exit, PumpExit::Stopped) {
                    break;
                }
            }
            Err(err) => {
                warn!(url = %url, error = %err, "push socket connect failed");
                let _ = events.send(PushEvent::Link(LinkState::Disconnected));
            }
        }

        let delay = backoff.next_delay();
        debug!(
            delay_ms = delay.as_millis() as u64,
            attempt = backoff.attempts(),
            "push socket reconnect scheduled"
        );
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = sleep(delay) => {}
        }
    }
    info!("push socket task stopped");
}

/// Answer every frame still queued: none of them reached the socket.
fn fail_queued(outbound: &mut mpsc::Receiver<Outgoing>) {
    let mut dropped = 0_usize;
    while let Ok(outgoing) = outbound.try_recv() {
        dropped += 1;
        let _ = outgoing.written.send(Err(ChatError::network(
            "channel_dropped",
            "push socket dropped before the frame was written",
        )));
    }
    if dropped > 0 {
        debug!(dropped, "failed frames queued on a dropped push socket");
    }
}

/// Reads take priority so a dead link is noticed before more frames are written to it.
async fn pump<S>(
    stream: WebSocketStream<S>,
    outbound: &mut mpsc::Receiver<Outgoing>,
    events: &broadcast::Sender<PushEvent>,
    stop: &CancellationToken,
) -> PumpExit
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut source) = stream.split();
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => {
                let _ = sink.send(WsMessage::Close(None)).await;
                return PumpExit::Stopped;
            }
            incoming = source.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    if let Some(event) = decode_frame(text.as_str()) {
                        let _ = events.send(event);
                    }
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    debug!(?frame, "push socket closed by server");
                    return PumpExit::Dropped;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(error = %err, "push socket read failed");
                    return PumpExit::Dropped;
                }
                None => return PumpExit::Dropped,
            },
            outgoing = outbound.recv() => {
                let Some(Outgoing { frame, written }) = outgoing else {
                    return PumpExit::Stopped;
                };
                if let Err(err) = sink.send(WsMessage::text(frame)).await {
                    warn!(error = %err, "push socket write failed");
                    let _ = written.send(Err(ChatError::network(
                        "channel_dropped",
                        format!("push socket write failed: {err}"),
                    )));
                    return PumpExit::Dropped;
                }
                let _ = written.send(Ok(()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chat_core::Message;
    use chrono::{TimeZone, Utc};
    use tokio::{net::TcpListener, time::timeout};
    use tokio_tungstenite::{accept_async, tungstenite::protocol::Role};

    use super::*;

    async fn next_event(events: &mut broadcast::Receiver<PushEvent>) -> PushEvent {
        timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event should arrive")
            .expect("event channel open")
    }

    #[test]
    fn rejects_non_websocket_urls() {
        let err = SocketPushChannel::new("https://chat.example.com", RetryPolicy::default())
            .err()
            .expect("https is not a socket URL");
        assert_eq!(err.code, "invalid_socket_url");
    }

    #[tokio::test]
    async fn sending_while_disconnected_fails_fast() {
        let channel = SocketPushChannel::new("ws://127.0.0.1:9", RetryPolicy::default())
            .expect("valid url");
        let err = channel
            .register_identity("me")
            .await
            .expect_err("not connected");
        assert_eq!(err.code, "channel_disconnected");
    }

    #[tokio::test]
    async fn frame_queued_on_a_dropped_link_reports_failure() {
        let (client_io, server_io) = tokio::io::duplex(1024);
        let stream = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        drop(server_io);

        let (outbound_tx, mut outbound) = mpsc::channel(4);
        let (events, _) = broadcast::channel(4);
        let (written, confirmation) = oneshot::channel();
        outbound_tx
            .send(Outgoing {
                frame: r#"{"event":"chat-message","data":{}}"#.to_owned(),
                written,
            })
            .await
            .expect("queue frame");

        let exit = pump(stream, &mut outbound, &events, &CancellationToken::new()).await;
        assert!(matches!(exit, PumpExit::Dropped));
        fail_queued(&mut outbound);

        let err = timeout(Duration::from_secs(5), confirmation)
            .await
            .expect("sender is answered")
            .expect("confirmation slot kept")
            .expect_err("frame never reached the socket");
        assert_eq!(err.code, "channel_dropped");
    }

    #[tokio::test]
    async fn delivers_frames_and_reconnects_after_server_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            // First connection: read the register frame, push a message, then hang up.
            let (tcp, _) = listener.accept().await.expect("accept first");
            let mut ws = accept_async(tcp).await.expect("handshake");
            if let Some(Ok(WsMessage::Text(text))) = ws.next().await {
                let _ = frames_tx.send(text.as_str().to_owned());
            }
            let push = r#"{"event":"chat-message","data":{"_id":"m1","from":"peer","to":"me","text":"hi","timestamp":"2024-05-01T10:00:00Z"}}"#;
            ws.send(WsMessage::text(push.to_owned())).await.expect("push frame");
            ws.close(None).await.expect("close");

            // Second connection stays open until the client leaves.
            let (tcp, _) = listener.accept().await.expect("accept second");
            let mut ws = accept_async(tcp).await.expect("handshake");
            while let Some(Ok(_)) = ws.next().await {}
        });

        let channel = SocketPushChannel::new(
            &format!("ws://{addr}/"),
            RetryPolicy::from_millis(10, 50),
        )
        .expect("valid url");
        let mut events = channel.subscribe();
        channel.connect();
        channel.connect();

        assert_eq!(next_event(&mut events).await, PushEvent::Link(LinkState::Connecting));
        assert_eq!(next_event(&mut events).await, PushEvent::Link(LinkState::Connected));
        channel.register_identity("me").await.expect("register");

        let registered = timeout(Duration::from_secs(5), frames_rx.recv())
            .await
            .expect("frame should arrive")
            .expect("frame channel open");
        let registered: serde_json::Value =
            serde_json::from_str(&registered).expect("register frame is json");
        assert_eq!(
            registered,
            serde_json::json!({ "event": "register", "data": "me" })
        );

        let expected = Message::new(
            "peer",
            "me",
            "hi",
            Utc.timestamp_opt(1_714_557_600, 0).single().expect("timestamp"),
        )
        .with_id("m1");
        assert_eq!(next_event(&mut events).await, PushEvent::Message(expected));
        assert_eq!(
            next_event(&mut events).await,
            PushEvent::Link(LinkState::Disconnected)
        );
        assert_eq!(next_event(&mut events).await, PushEvent::Link(LinkState::Connecting));
        assert_eq!(next_event(&mut events).await, PushEvent::Link(LinkState::Connected));
        assert!(channel.is_connected());

        channel.shutdown();
    }
}
