use futures::stream::{SplitSink, SplitStream};
use std::time::Duration;
use tokio::{net::TcpStream, time::Instant};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

use crate::error::FeedError;

/*----- */
// Convenient types
/*----- */
pub type WsMessage = tokio_tungstenite::tungstenite::Message;
pub type WsError = tokio_tungstenite::tungstenite::Error;
pub type WebSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub type WsRead = SplitStream<WebSocket>;
pub type WsWrite = SplitSink<WebSocket, WsMessage>;

pub async fn connect(url: &Url) -> Result<WebSocket, FeedError> {
    debug!(url = %url, "attempting to establish WebSocket connection");
    connect_async(url.as_str())
        .await
        .map(|(websocket, _)| websocket)
        .map_err(FeedError::WebSocket)
}

/*----- */
// Keepalive
/*----- */
/// Tracks pongs against the ping schedule. The connection is considered dead
/// once no pong has arrived for two ping intervals.
#[derive(Debug, Clone)]
pub struct Keepalive {
    pub interval: Duration,
    last_pong: Instant,
}

impl Keepalive {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_pong: Instant::now(),
        }
    }

    pub fn on_pong(&mut self) {
        self.last_pong = Instant::now();
    }

    pub fn timeout(&self) -> Duration {
        self.interval * 2
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_pong) > self.timeout()
    }
}
