use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{extract_token, Identity, IdentityVerifier};
use crate::client::{Client, ClientSettings};
use crate::config::ServerConfig;
use crate::hub::Hub;
use crate::producer::Publisher;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const CONTROL_HTTP_READ_CHUNK_BYTES: usize = 4 * 1024;
const CONTROL_HTTP_MAX_REQUEST_BYTES: usize = 64 * 1024;

/// WebSocket listener plus the optional control HTTP listener.
pub struct GatewayServer {
    server: ServerConfig,
    state: Arc<ServerState>,
}

struct ServerState {
    path: String,
    hub: Arc<Hub>,
    publisher: Arc<dyn Publisher>,
    verifier: Arc<dyn IdentityVerifier>,
    settings: ClientSettings,
    ws_config: WebSocketConfig,
}

impl GatewayServer {
    pub fn new(
        server: ServerConfig,
        hub: Arc<Hub>,
        publisher: Arc<dyn Publisher>,
        verifier: Arc<dyn IdentityVerifier>,
    ) -> Self {
        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(server.max_message_bytes);
        ws_config.max_frame_size = Some(server.max_message_bytes);
        let state = Arc::new(ServerState {
            path: server.path.clone(),
            hub,
            publisher,
            verifier,
            settings: ClientSettings {
                send_buffer_size: server.send_buffer_size,
                write_wait: server.write_wait(),
            },
            ws_config,
        });
        Self { server, state }
    }

    /// Accepts connections until `cancel` fires, then waits (bounded by the
    /// drain timeout) for every connection to send its close frame.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(&self.server.bind)
            .await
            .with_context(|| format!("failed binding gateway listener on {}", self.server.bind))?;
        let bound_addr = listener
            .local_addr()
            .context("failed reading bound address")?;
        info!("gateway listening on ws://{bound_addr}{}", self.state.path);

        let http_task = self.spawn_control_http_task(cancel.clone());
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote_addr)) => {
                            let state = self.state.clone();
                            let cancel = cancel.clone();
                            connections.spawn(async move {
                                if let Err(err) = handle_connection(stream, remote_addr, state, cancel).await {
                                    debug!("gateway connection {remote_addr} ended: {err:#}");
                                }
                            });
                        }
                        Err(err) => {
                            warn!("gateway accept failed: {err}");
                        }
                    }
                }
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(err) = joined {
                        warn!("gateway connection task failed: {err}");
                    }
                }
            }
        }
        drop(listener);

        let open = connections.len();
        if open > 0 {
            info!("draining {open} gateway connection(s)");
        }
        let drained = timeout(self.server.drain_timeout(), async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                "gateway drain exceeded {}ms, aborting {} connection(s)",
                self.server.drain_timeout_ms,
                connections.len()
            );
            connections.shutdown().await;
        }

        if let Some(task) = http_task {
            task.abort();
            let _ = task.await;
        }
        info!("gateway stopped");
        Ok(())
    }

    fn spawn_control_http_task(
        &self,
        cancel: CancellationToken,
    ) -> Option<tokio::task::JoinHandle<()>> {
        let bind = self.server.http_bind.clone()?;
        if bind.trim().is_empty() {
            return None;
        }
        let hub = self.state.hub.clone();
        Some(tokio::spawn(async move {
            let listener = match TcpListener::bind(&bind).await {
                Ok(listener) => listener,
                Err(err) => {
                    warn!("control-http bind failed on {bind}: {err}");
                    return;
                }
            };
            let bound = listener
                .local_addr()
                .map(|addr| addr.to_string())
                .unwrap_or(bind.clone());
            info!("control-http listening on http://{bound}");
            loop {
                let accepted = tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, remote_addr)) => {
                        let hub = hub.clone();
                        tokio::spawn(async move {
                            if let Err(err) = handle_control_http_connection(stream, hub).await {
                                warn!("control-http connection {remote_addr} failed: {err}");
                            }
                        });
                    }
                    Err(err) => {
                        warn!("control-http accept failed: {err}");
                    }
                }
            }
        }))
    }
}

/// Runs an upgraded, authenticated connection to completion. Returns once
/// the close frame has been sent and the client is out of the Hub.
pub async fn serve_connection<S>(
    ws: WebSocketStream<S>,
    identity: &Identity,
    hub: Arc<Hub>,
    publisher: Arc<dyn Publisher>,
    settings: ClientSettings,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    Client::connect(&identity.user_id, ws, hub, publisher, settings)
        .await
        .run(cancel)
        .await;
}

async fn handle_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    state: Arc<ServerState>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut identity = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let found = authorize_upgrade(&state, &cancel, request)?;
        identity = Some(found);
        Ok(response)
    };
    let ws = timeout(
        HANDSHAKE_TIMEOUT,
        accept_hdr_async_with_config(stream, callback, Some(state.ws_config)),
    )
    .await
    .with_context(|| format!("websocket handshake timed out for {remote_addr}"))?
    .with_context(|| format!("websocket upgrade failed for {remote_addr}"))?;
    let identity = identity
        .ok_or_else(|| anyhow::anyhow!("upgrade for {remote_addr} completed without identity"))?;

    debug!("upgraded {remote_addr} as {}", identity.user_id);
    serve_connection(
        ws,
        &identity,
        state.hub.clone(),
        state.publisher.clone(),
        state.settings,
        cancel,
    )
    .await;
    Ok(())
}

fn authorize_upgrade(
    state: &ServerState,
    cancel: &CancellationToken,
    request: &Request,
) -> Result<Identity, ErrorResponse> {
    if request.uri().path() != state.path {
        return Err(reject(StatusCode::NOT_FOUND, "not found"));
    }
    let token = extract_token(request).map_err(|err| {
        debug!("rejecting upgrade without usable token: {err}");
        reject(StatusCode::UNAUTHORIZED, "unauthorized")
    })?;
    state.verifier.validate(cancel, &token).map_err(|err| {
        warn!("rejecting upgrade: {err}");
        reject(StatusCode::UNAUTHORIZED, "unauthorized")
    })
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_owned()));
    *response.status_mut() = status;
    response
}

async fn handle_control_http_connection(mut stream: TcpStream, hub: Arc<Hub>) -> Result<()> {
    let Some(request) = read_control_http_request(&mut stream).await? else {
        return Ok(());
    };

    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/health") => {
            write_http_json_response(&mut stream, 200, &json!({ "ok": true })).await
        }
        ("GET", "/status") => {
            let stats = hub.stats().await;
            let payload = json!({
                "ok": true,
                "identities": stats.identities,
                "connections": stats.connections,
                "version": env!("CARGO_PKG_VERSION"),
            });
            write_http_json_response(&mut stream, 200, &payload).await
        }
        ("GET", _) => {
            let payload = json!({
                "ok": false,
                "error": "not_found",
                "path": request.path
            });
            write_http_json_response(&mut stream, 404, &payload).await
        }
        _ => {
            let body = json!({
                "ok": false,
                "error": "method_not_allowed"
            });
            write_http_json_response(&mut stream, 405, &body).await
        }
    }
}

#[derive(Debug)]
struct ControlHttpRequest {
    method: String,
    path: String,
}

fn find_http_header_terminator(buf: &[u8]) -> Option<usize> {
    if let Some(idx) = buf.windows(4).position(|chunk| chunk == b"\r\n\r\n") {
        return Some(idx);
    }
    buf.windows(2).position(|chunk| chunk == b"\n\n")
}

async fn read_control_http_request(stream: &mut TcpStream) -> Result<Option<ControlHttpRequest>> {
    let mut buffer = Vec::with_capacity(CONTROL_HTTP_READ_CHUNK_BYTES);
    let mut chunk = vec![0_u8; CONTROL_HTTP_READ_CHUNK_BYTES];
    let header_end = loop {
        let read = stream
            .read(&mut chunk)
            .await
            .context("failed reading control-http request bytes")?;
        if read == 0 {
            if buffer.is_empty() {
                return Ok(None);
            }
            anyhow::bail!("invalid control-http request: missing header terminator");
        }
        buffer.extend_from_slice(&chunk[..read]);
        if buffer.len() > CONTROL_HTTP_MAX_REQUEST_BYTES {
            anyhow::bail!("control-http request exceeds max size");
        }
        if let Some(end) = find_http_header_terminator(&buffer) {
            break end;
        }
    };

    let headers = String::from_utf8_lossy(&buffer[..header_end]);
    let request_line = headers.lines().next().unwrap_or_default();
    let mut segments = request_line.split_whitespace();
    let method = segments
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_uppercase();
    if method.is_empty() {
        anyhow::bail!("invalid control-http request line");
    }
    let path_raw = segments.next().unwrap_or("/").trim();
    let path = path_raw
        .split('?')
        .next()
        .unwrap_or(path_raw)
        .trim()
        .to_owned();
    Ok(Some(ControlHttpRequest { method, path }))
}

async fn write_http_json_response(
    stream: &mut TcpStream,
    status_code: u16,
    payload: &Value,
) -> Result<()> {
    let body = serde_json::to_vec(payload).context("failed serializing control-http JSON body")?;
    let status_text = match status_code {
        200 => "OK",
        404 => "Not Found",
        405 => "Method Not Allowed",
        _ => "OK",
    };
    let head = format!(
        "HTTP/1.1 {status_code} {status_text}\r\nContent-Type: application/json; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\nCache-Control: no-store\r\n\r\n",
        body.len()
    );
    stream
        .write_all(head.as_bytes())
        .await
        .context("failed writing control-http headers")?;
    stream
        .write_all(&body)
        .await
        .context("failed writing control-http body")?;
    let _ = stream.shutdown().await;
    Ok(())
}
