use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info, warn};

use crate::envelope::{Envelope, InboundRequest};
use crate::hub::Hub;
use crate::producer::Publisher;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Registered,
    Running,
    Draining,
    Closed,
}

impl ClientState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Registered,
            1 => Self::Running,
            2 => Self::Draining,
            _ => Self::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CloseReason {
    #[error("send buffer overflow")]
    Overflow,
    #[error("peer closed connection")]
    PeerClosed,
    #[error("read failed")]
    ReadFailed,
    #[error("write failed")]
    WriteFailed,
    #[error("server shutting down")]
    Shutdown,
}

/// Result of a non-blocking push onto a client's outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    Accepted,
    Overflow,
    Closed,
}

#[derive(Debug, Clone, Copy)]
pub struct ClientSettings {
    pub send_buffer_size: usize,
    pub write_wait: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            send_buffer_size: 16,
            write_wait: Duration::from_secs(5),
        }
    }
}

/// The Hub-facing side of one connection: the sending half of its bounded
/// outbound queue plus a close-once gate.
#[derive(Clone)]
pub struct ClientHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    id: u64,
    user_id: String,
    outbound: mpsc::Sender<Arc<str>>,
    closing: CancellationToken,
    reason: OnceLock<CloseReason>,
    state: AtomicU8,
}

impl ClientHandle {
    pub(crate) fn new(user_id: &str, capacity: usize) -> (Self, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            inner: Arc::new(HandleInner {
                id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
                user_id: user_id.to_owned(),
                outbound: tx,
                closing: CancellationToken::new(),
                reason: OnceLock::new(),
                state: AtomicU8::new(ClientState::Registered as u8),
            }),
        };
        (handle, rx)
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn user_id(&self) -> &str {
        &self.inner.user_id
    }

    pub fn try_enqueue(&self, frame: Arc<str>) -> Enqueue {
        if self.inner.closing.is_cancelled() {
            return Enqueue::Closed;
        }
        match self.inner.outbound.try_send(frame) {
            Ok(()) => Enqueue::Accepted,
            Err(TrySendError::Full(_)) => Enqueue::Overflow,
            Err(TrySendError::Closed(_)) => Enqueue::Closed,
        }
    }

    /// Signals the pumps to wind down. Only the first caller's reason sticks;
    /// returns whether this call was that first one.
    pub fn close(&self, reason: CloseReason) -> bool {
        if self.inner.reason.set(reason).is_err() {
            return false;
        }
        debug!(
            "closing client {} for {}: {reason}",
            self.inner.id, self.inner.user_id
        );
        self.inner.closing.cancel();
        true
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.reason.get().copied()
    }

    pub fn closing(&self) -> WaitForCancellationFuture<'_> {
        self.inner.closing.cancelled()
    }

    pub fn state(&self) -> ClientState {
        ClientState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ClientState) {
        self.inner.state.store(state as u8, Ordering::Release);
    }
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle")
            .field("id", &self.inner.id)
            .field("user_id", &self.inner.user_id)
            .field("state", &self.state())
            .finish()
    }
}

/// One authenticated WebSocket connection, registered in the Hub until
/// [`Client::run`] returns.
pub struct Client<S> {
    handle: ClientHandle,
    outbound: mpsc::Receiver<Arc<str>>,
    ws: WebSocketStream<S>,
    hub: Arc<Hub>,
    publisher: Arc<dyn Publisher>,
    settings: ClientSettings,
}

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub async fn connect(
        user_id: &str,
        ws: WebSocketStream<S>,
        hub: Arc<Hub>,
        publisher: Arc<dyn Publisher>,
        settings: ClientSettings,
    ) -> Self {
        let (handle, outbound) = ClientHandle::new(user_id, settings.send_buffer_size);
        hub.register(handle.clone()).await;
        Self {
            handle,
            outbound,
            ws,
            hub,
            publisher,
            settings,
        }
    }

    #[cfg(test)]
    pub fn handle(&self) -> &ClientHandle {
        &self.handle
    }

    /// Drives both pumps and returns once the connection has drained, the
    /// close frame is out and the client is no longer registered. Dropping
    /// the future stops both pumps and still unregisters the client.
    pub async fn run(self, cancel: CancellationToken) {
        let Client {
            handle,
            outbound,
            ws,
            hub,
            publisher,
            settings,
        } = self;

        handle.set_state(ClientState::Running);
        let registration = Registration {
            hub,
            handle: handle.clone(),
            released: false,
        };
        // Publishes in flight give up once the client starts closing.
        let publish_scope = cancel.child_token();
        let (sink, stream) = ws.split();

        let reading = async {
            let reason = read_pump(
                stream,
                &handle,
                publisher.as_ref(),
                &cancel,
                &publish_scope,
            )
            .await;
            handle.close(reason);
            handle.set_state(ClientState::Draining);
            registration.release().await;
            reason
        };
        let writing = write_pump(
            sink,
            outbound,
            handle.clone(),
            cancel.clone(),
            settings.write_wait,
        );
        let scoping = async {
            handle.closing().await;
            publish_scope.cancel();
        };
        let (reason, (), ()) = tokio::join!(reading, writing, scoping);

        handle.set_state(ClientState::Closed);
        info!(
            "client {} for {} closed: {}",
            handle.id(),
            handle.user_id(),
            handle.close_reason().unwrap_or(reason)
        );
    }
}

/// Keeps a client registered until released; dropped unreleased, it closes
/// the handle and unregisters in the background.
struct Registration {
    hub: Arc<Hub>,
    handle: ClientHandle,
    released: bool,
}

impl Registration {
    async fn release(mut self) {
        self.hub.unregister(&self.handle).await;
        self.released = true;
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.handle.close(CloseReason::Shutdown);
        self.handle.set_state(ClientState::Closed);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let hub = self.hub.clone();
        let handle = self.handle.clone();
        runtime.spawn(async move {
            hub.unregister(&handle).await;
        });
    }
}

async fn read_pump<S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    handle: &ClientHandle,
    publisher: &dyn Publisher,
    cancel: &CancellationToken,
    publish_scope: &CancellationToken,
) -> CloseReason
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return CloseReason::Shutdown,
            _ = handle.closing() => {
                return handle.close_reason().unwrap_or(CloseReason::Shutdown);
            }
            next = stream.next() => next,
        };
        let frame = match next {
            None => return CloseReason::PeerClosed,
            Some(Err(err)) => {
                debug!("read from client {} failed: {err}", handle.id());
                return CloseReason::ReadFailed;
            }
            Some(Ok(Message::Text(text))) => text.into_bytes(),
            Some(Ok(Message::Binary(bytes))) => bytes,
            Some(Ok(Message::Close(_))) => return CloseReason::PeerClosed,
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
        };

        let request = match InboundRequest::parse(&frame) {
            Ok(request) => request,
            Err(err) => {
                warn!("invalid JSON frame from {}: {err}", handle.user_id());
                continue;
            }
        };
        if !request.has_recipients() {
            warn!("dropping frame from {} with no recipients", handle.user_id());
            continue;
        }

        let envelope = Envelope::from_request(handle.user_id(), request);
        if let Err(err) = publisher.publish(publish_scope, &envelope).await {
            warn!(
                "publish {} from {} failed: {err}",
                envelope.id,
                handle.user_id()
            );
        }
    }
}

async fn write_pump<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut outbound: mpsc::Receiver<Arc<str>>,
    handle: ClientHandle,
    cancel: CancellationToken,
    write_wait: Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                handle.close(CloseReason::Shutdown);
                break;
            }
            _ = handle.closing() => {
                outbound.close();
                while let Ok(frame) = outbound.try_recv() {
                    if !write_frame(&mut sink, &handle, &frame, write_wait).await {
                        return;
                    }
                }
                break;
            }
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if !write_frame(&mut sink, &handle, &frame, write_wait).await {
                        return;
                    }
                }
                None => break,
            },
        }
    }

    let close = Message::Close(Some(close_frame(CloseCode::Normal, "")));
    match tokio::time::timeout(write_wait, sink.send(close)).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => debug!("close frame to client {} failed: {err}", handle.id()),
        Err(_) => debug!("close frame to client {} timed out", handle.id()),
    }
}

async fn write_frame<S>(
    sink: &mut SplitSink<WebSocketStream<S>, Message>,
    handle: &ClientHandle,
    frame: &str,
    write_wait: Duration,
) -> bool
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let result = tokio::time::timeout(write_wait, sink.send(Message::Text(frame.to_owned()))).await;
    match result {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            debug!("write to client {} failed: {err}", handle.id());
            handle.close(CloseReason::WriteFailed);
            false
        }
        Err(_) => {
            warn!(
                "write to client {} exceeded {}ms deadline",
                handle.id(),
                write_wait.as_millis()
            );
            handle.close(CloseReason::WriteFailed);
            false
        }
    }
}

pub fn close_frame(code: CloseCode, reason: &'static str) -> CloseFrame<'static> {
    CloseFrame {
        code,
        reason: reason.into(),
    }
}
