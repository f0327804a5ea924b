//! WebSocket entry point.
//!
//! ```text
//! TCP accept ──► handshake (path + roomId/userId) ──► ConnectionHandle
//!                     │ rejected: HTTP 400                │
//!                     ▼                                   ▼
//!                 no state touched          session::start (join + loops)
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use percent_encoding::percent_decode_str;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::config::HubConfig;
use crate::connection::ConnectionHandle;
use crate::error::HubError;
use crate::registry::RoomRegistry;
use crate::session;

/// Pause after a failed `accept` before trying again.
pub const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Identity carried by the upgrade request's query string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    pub room_id: String,
    pub user_id: String,
    /// Display name, if the client sent one
    pub username: Option<String>,
}

impl ConnectParams {
    /// Parse `roomId`, `userId` and `username` from a raw query string.
    pub fn from_query(query: Option<&str>) -> Result<Self, HubError> {
        let mut room_id = None;
        let mut user_id = None;
        let mut username = None;

        for pair in query.unwrap_or_default().split('&') {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let value = decode_component(value);
            match decode_component(key).as_str() {
                "roomId" => room_id = Some(value),
                "userId" => user_id = Some(value),
                "username" => username = Some(value),
                _ => {}
            }
        }

        let room_id = non_blank(room_id).ok_or(HubError::MissingIdentifier("roomId"))?;
        let user_id = non_blank(user_id).ok_or(HubError::MissingIdentifier("userId"))?;
        Ok(Self {
            room_id,
            user_id,
            username: non_blank(username),
        })
    }

    /// Validate an upgrade request against the served path.
    pub fn from_request(request: &Request, ws_path: &str) -> Result<Self, HubError> {
        let path = request.uri().path();
        if path != ws_path {
            return Err(HubError::UnknownPath(path.to_string()));
        }
        Self::from_query(request.uri().query())
    }
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    percent_decode_str(&spaced).decode_utf8_lossy().into_owned()
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn bad_request(reason: String) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason));
    *response.status_mut() = StatusCode::BAD_REQUEST;
    response
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub rejected_handshakes: u64,
    pub active_rooms: usize,
    pub active_connections: usize,
}

#[derive(Debug, Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    rejected_handshakes: AtomicU64,
}

/// The presence server.
pub struct PresenceServer {
    config: Arc<HubConfig>,
    registry: Arc<RoomRegistry>,
    stats: Arc<AtomicServerStats>,
}

impl PresenceServer {
    /// Create a server. Must be called inside a Tokio runtime, since the
    /// registry starts its presence task immediately.
    pub fn new(config: HubConfig) -> Self {
        Self {
            config: Arc::new(config),
            registry: RoomRegistry::new(),
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    /// Bind `bind_addr` and serve. Returns only if the config is invalid
    /// or the bind fails.
    pub async fn run(&self) -> Result<(), HubError> {
        self.config.validate()?;
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an existing listener, one task per connection.
    ///
    /// Accept errors (descriptor exhaustion and the like) are logged and
    /// retried after [`ACCEPT_BACKOFF`].
    pub async fn serve(&self, listener: TcpListener) -> Result<(), HubError> {
        self.config.validate()?;
        log::info!(
            "Presence server listening on {} (path {})",
            listener.local_addr()?,
            self.config.ws_path
        );

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::error!("Accept failed: {e}");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };
            log::debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let config = self.config.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, registry, config, stats).await {
                    log::debug!("Connection from {addr} ended with error: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<RoomRegistry>,
        config: Arc<HubConfig>,
        stats: Arc<AtomicServerStats>,
    ) -> Result<(), HubError> {
        let mut params = None;
        let callback = |request: &Request, response: Response| {
            match ConnectParams::from_request(request, &config.ws_path) {
                Ok(parsed) => {
                    params = Some(parsed);
                    Ok(response)
                }
                Err(e) => Err(bad_request(e.to_string())),
            }
        };

        let ws_config = config.websocket_config();
        let ws_stream = match tokio_tungstenite::accept_hdr_async_with_config(
            stream,
            callback,
            Some(ws_config),
        )
        .await
        {
            Ok(ws) => ws,
            Err(WsError::Http(response)) => {
                stats.rejected_handshakes.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "Rejected handshake from {addr}: {}",
                    String::from_utf8_lossy(response.body().as_deref().unwrap_or(&b"bad request"[..]))
                );
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let params = params.ok_or(HubError::MissingIdentifier("roomId"))?;
        stats.total_connections.fetch_add(1, Ordering::Relaxed);

        let (handle, outbound) =
            ConnectionHandle::new(&params.room_id, &params.user_id, config.queue_capacity)?;
        let handle = match params.username {
            Some(name) => handle.with_display_name(name),
            None => handle,
        };
        let handle = Arc::new(handle);
        log::info!(
            "Client connected from {addr}: userID={} room={}",
            handle.user_id(),
            handle.room_id()
        );

        if let Err(e) = session::start(registry, handle.clone(), outbound, ws_stream, config).await {
            log::error!("Session supervisor for {} failed: {e}", handle.id());
        }
        log::info!("Client disconnected: userID={}", handle.user_id());
        Ok(())
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Get server statistics.
    pub fn stats(&self) -> ServerStats {
        let registry = self.registry.stats();
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            rejected_handshakes: self.stats.rejected_handshakes.load(Ordering::Relaxed),
            active_rooms: registry.active_rooms,
            active_connections: registry.active_connections,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_from_query() {
        let params = ConnectParams::from_query(Some("roomId=r1&userId=alice")).unwrap();
        assert_eq!(params.room_id, "r1");
        assert_eq!(params.user_id, "alice");
        assert!(params.username.is_none());
    }

    #[test]
    fn test_params_percent_decoded_and_trimmed() {
        let params =
            ConnectParams::from_query(Some("roomId=%20team%2Fone%20&userId=a+b&username=Al%C3%AFce"))
                .unwrap();
        assert_eq!(params.room_id, "team/one");
        assert_eq!(params.user_id, "a b");
        assert_eq!(params.username.as_deref(), Some("Alïce"));
    }

    #[test]
    fn test_params_missing_identifiers() {
        assert!(matches!(
            ConnectParams::from_query(None),
            Err(HubError::MissingIdentifier("roomId"))
        ));
        assert!(matches!(
            ConnectParams::from_query(Some("roomId=r1")),
            Err(HubError::MissingIdentifier("userId"))
        ));
        assert!(matches!(
            ConnectParams::from_query(Some("roomId=%20%20&userId=u")),
            Err(HubError::MissingIdentifier("roomId"))
        ));
    }

    #[test]
    fn test_blank_username_ignored() {
        let params = ConnectParams::from_query(Some("roomId=r&userId=u&username=")).unwrap();
        assert!(params.username.is_none());
    }

    #[test]
    fn test_request_path_checked() {
        let request = Request::builder()
            .uri("/chat?roomId=r&userId=u")
            .body(())
            .unwrap();
        assert!(matches!(
            ConnectParams::from_request(&request, "/ws"),
            Err(HubError::UnknownPath(p)) if p == "/chat"
        ));

        let request = Request::builder()
            .uri("/ws?roomId=r&userId=u")
            .body(())
            .unwrap();
        assert!(ConnectParams::from_request(&request, "/ws").is_ok());
    }

    #[test]
    fn test_bad_request_status() {
        let response = bad_request("missing roomId".to_string());
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.body().as_deref(), Some("missing roomId"));
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = PresenceServer::new(HubConfig::default());
        assert_eq!(server.stats(), ServerStats::default());
        assert_eq!(server.config().ws_path, "/ws");
        assert_eq!(server.registry().room_count(), 0);
    }

    #[tokio::test]
    async fn test_run_returns_bind_error() {
        let server = PresenceServer::new(HubConfig {
            bind_addr: "not-an-address".to_string(),
            ..HubConfig::default()
        });
        let result = tokio::time::timeout(Duration::from_secs(2), server.run())
            .await
            .expect("run should return instead of looping");
        assert!(matches!(result, Err(HubError::Io(_))));
    }

    #[tokio::test]
    async fn test_serve_rejects_invalid_config() {
        let server = PresenceServer::new(HubConfig {
            queue_capacity: 0,
            ..HubConfig::default()
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        assert!(matches!(server.serve(listener).await, Err(HubError::Config(_))));
    }
}
