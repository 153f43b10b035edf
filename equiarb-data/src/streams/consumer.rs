use chrono::Utc;
use futures::{SinkExt, StreamExt};
use std::{collections::HashSet, sync::Arc, time::Duration};
use tokio::{
    sync::mpsc,
    time::{interval, sleep, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};
use url::Url;

use super::{handler::TickerHandler, StreamHandle};
use crate::{
    error::FeedError,
    protocols::{
        binary::decode_frame,
        text::{filter_order, parse_text, TextMessage},
        ws::{connect, Keepalive, WebSocket, WsMessage},
    },
    shared::subscription_models::{StreamCommand, SubscriptionBook},
};

pub const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(2);
pub const DEFAULT_RECONNECT_MAX_DELAY_SECS: u64 = 60;
pub const MIN_RECONNECT_MAX_DELAY_SECS: u64 = 5;
pub const DEFAULT_RECONNECT_MAX_TRIES: u32 = 50;
pub const MAX_RECONNECT_MAX_TRIES: u32 = 300;
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(1);

/*----- */
// Reconnect policy
/*----- */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_tries: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RECONNECT_MAX_DELAY_SECS, DEFAULT_RECONNECT_MAX_TRIES)
    }
}

impl ReconnectPolicy {
    /// Clamps the delay cap to at least 5 s and the retry budget to at most 300.
    pub fn new(max_delay_secs: u64, max_tries: u32) -> Self {
        if max_delay_secs < MIN_RECONNECT_MAX_DELAY_SECS {
            warn!(
                requested = max_delay_secs,
                applied = MIN_RECONNECT_MAX_DELAY_SECS,
                message = "reconnect max delay below minimum, clamping"
            );
        }
        if max_tries > MAX_RECONNECT_MAX_TRIES {
            warn!(
                requested = max_tries,
                applied = MAX_RECONNECT_MAX_TRIES,
                message = "reconnect max tries above maximum, clamping"
            );
        }

        Self {
            initial_delay: INITIAL_RECONNECT_DELAY,
            max_delay: Duration::from_secs(max_delay_secs.max(MIN_RECONNECT_MAX_DELAY_SECS)),
            max_tries: max_tries.min(MAX_RECONNECT_MAX_TRIES),
        }
    }

    pub fn with_initial_delay(self, initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            ..self
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(31);
        self.initial_delay
            .saturating_mul(1u32 << doublings)
            .min(self.max_delay)
    }
}

/*----- */
// Feed config
/*----- */
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub name: String,
    pub url: Url,
    pub ping_interval: Duration,
    pub reconnect: ReconnectPolicy,
}

impl FeedConfig {
    pub fn new(name: impl Into<String>, url: Url) -> Self {
        Self {
            name: name.into(),
            url,
            ping_interval: DEFAULT_PING_INTERVAL,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/*----- */
// Ticker connection
/*----- */
/// One websocket connection serving one subscription group. Owns the
/// reconnect loop and replays its subscription book on every connect.
pub struct TickerConnection<Handler> {
    config: FeedConfig,
    handler: Arc<Handler>,
    book: SubscriptionBook,
    symbols: HashSet<String>,
    command_rx: mpsc::UnboundedReceiver<StreamCommand>,
    commands_open: bool,
}

impl<Handler> TickerConnection<Handler>
where
    Handler: TickerHandler,
{
    pub fn new(
        config: FeedConfig,
        handler: Arc<Handler>,
        book: SubscriptionBook,
        symbols: HashSet<String>,
    ) -> (Self, StreamHandle) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let connection = Self {
            config,
            handler,
            book,
            symbols,
            command_rx,
            commands_open: true,
        };

        (connection, StreamHandle::new(command_tx))
    }

    /// Runs until stopped through the handle (`Ok`) or until the retry
    /// budget is spent (`FeedError::RetriesExhausted`).
    pub async fn run(mut self) -> Result<(), FeedError> {
        let name = self.config.name.clone();
        let mut attempt: u32 = 0;

        info!(
            connection = %name,
            url = %self.config.url,
            instruments = self.book.len(),
            action = "Attempting to connect to ticker feed"
        );

        loop {
            /*---------- Connect ---------- */
            match connect(&self.config.url).await {
                Ok(websocket) => {
                    attempt = 0;
                    self.handler.on_connect(&name);
                    info!(
                        connection = %name,
                        instruments = self.book.len(),
                        message = "Connected to ticker feed"
                    );

                    /*---------- Session ---------- */
                    match self.session(websocket).await {
                        Ok(()) => {
                            self.handler.on_close(&name, None);
                            info!(connection = %name, message = "Ticker feed stopped");
                            return Ok(());
                        }
                        Err(error) => {
                            self.handler.on_close(&name, Some(&error));
                            error!(
                                connection = %name,
                                error = %error,
                                action = "Reconnecting web socket",
                                message = "Encountered a terminal error"
                            );
                        }
                    }
                }
                Err(error) => {
                    self.handler.on_error(&name, &error);
                    warn!(
                        connection = %name,
                        error = %error,
                        message = "Encountered error while attempting to connect"
                    );
                }
            }

            /*---------- Backoff ---------- */
            attempt += 1;
            if attempt > self.config.reconnect.max_tries {
                self.handler.on_no_reconnect(&name);
                error!(
                    connection = %name,
                    attempts = attempt - 1,
                    message = "Reconnect retries exhausted, giving up"
                );
                return Err(FeedError::RetriesExhausted {
                    attempts: attempt - 1,
                });
            }

            let delay = self.config.reconnect.delay_for(attempt);
            self.handler.on_reconnect(&name, attempt, delay);
            warn!(
                connection = %name,
                action = "attempting re-connection after backoff",
                reconnection_attempts = attempt,
                backoff_ms = delay.as_millis() as u64,
            );

            if self.wait(delay).await {
                self.handler.on_close(&name, None);
                return Ok(());
            }
        }
    }

    /// Sleep through the backoff while still accepting commands. Returns
    /// true when a stop was requested.
    async fn wait(&mut self, delay: Duration) -> bool {
        let backoff = sleep(delay);
        tokio::pin!(backoff);

        loop {
            tokio::select! {
                _ = &mut backoff => return false,
                command = self.command_rx.recv(), if self.commands_open => match command {
                    Some(StreamCommand::Stop) => return true,
                    Some(command) => {
                        // Offline: recorded now, sent on the next connect
                        self.book.apply(command);
                    }
                    None => self.commands_open = false,
                },
            }
        }
    }

    async fn session(&mut self, websocket: WebSocket) -> Result<(), FeedError> {
        let (mut ws_write, mut ws_read) = websocket.split();

        for message in self.book.resubscribe_messages() {
            ws_write.send(message.to_ws()?).await?;
        }

        let mut keepalive = Keepalive::new(self.config.ping_interval);
        let mut pings = interval(self.config.ping_interval);
        pings.set_missed_tick_behavior(MissedTickBehavior::Delay);
        pings.tick().await;

        loop {
            tokio::select! {
                frame = ws_read.next() => match frame {
                    Some(Ok(message)) => match self.on_message(message, &mut keepalive) {
                        Ok(()) => {}
                        Err(error) if error.is_terminal() => return Err(error),
                        Err(error) => self.on_non_terminal(error),
                    },
                    Some(Err(error)) => return Err(FeedError::WebSocket(error)),
                    None => return Err(FeedError::ConnectionLost("stream ended".to_string())),
                },
                _ = pings.tick() => {
                    if keepalive.is_expired(Instant::now()) {
                        return Err(FeedError::ConnectionLost(format!(
                            "no pong received within {:?}",
                            keepalive.timeout()
                        )));
                    }
                    ws_write.send(WsMessage::Ping(Vec::new())).await?;
                },
                command = self.command_rx.recv(), if self.commands_open => match command {
                    Some(StreamCommand::Stop) => {
                        let _ = ws_write.send(WsMessage::Close(None)).await;
                        return Ok(());
                    }
                    Some(command) => {
                        for message in self.book.apply(command) {
                            ws_write.send(message.to_ws()?).await?;
                        }
                    }
                    None => self.commands_open = false,
                },
            }
        }
    }

    fn on_message(&self, message: WsMessage, keepalive: &mut Keepalive) -> Result<(), FeedError> {
        match message {
            WsMessage::Binary(frame) => {
                let ticks = decode_frame(&frame, Utc::now())?;
                if !ticks.is_empty() {
                    self.handler.on_ticks(ticks);
                }
                Ok(())
            }
            WsMessage::Text(payload) => match parse_text(&payload)? {
                TextMessage::Order(update) => {
                    if let Some(update) = filter_order(update, &self.symbols) {
                        self.handler.on_order_update(update);
                    }
                    Ok(())
                }
                TextMessage::Error(message) => Err(FeedError::Venue(message)),
                TextMessage::Message(_) => Ok(()),
            },
            WsMessage::Pong(_) => {
                keepalive.on_pong();
                Ok(())
            }
            WsMessage::Close(frame) => Err(FeedError::Terminated(
                frame
                    .map(|frame| frame.reason.to_string())
                    .unwrap_or_default(),
            )),
            WsMessage::Ping(_) | WsMessage::Frame(_) => Ok(()),
        }
    }

    fn on_non_terminal(&self, error: FeedError) {
        match error {
            // Unknown text payloads are harmless
            FeedError::Deserialise { error, payload } => debug!(
                connection = %self.config.name,
                error = %error,
                payload = %payload,
                action = "Continuing...",
                message = "Encountered a non-terminal error",
            ),
            error => {
                self.handler.on_error(&self.config.name, &error);
                warn!(
                    connection = %self.config.name,
                    error = %error,
                    action = "Continuing...",
                    message = "Encountered a non-terminal error",
                );
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_cap() {
        let policy = ReconnectPolicy::new(10, 5);
        let delays = (1..=5).map(|n| policy.delay_for(n)).collect::<Vec<_>>();

        assert_eq!(
            delays,
            vec![
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(10),
                Duration::from_secs(10),
            ]
        );
    }

    #[test]
    fn policy_limits_are_clamped() {
        struct TestCase {
            max_delay_secs: u64,
            max_tries: u32,
            expected_delay: Duration,
            expected_tries: u32,
        }

        let cases = vec![
            TestCase {
                max_delay_secs: 1,
                max_tries: 10,
                expected_delay: Duration::from_secs(5),
                expected_tries: 10,
            },
            TestCase {
                max_delay_secs: 60,
                max_tries: 1_000,
                expected_delay: Duration::from_secs(60),
                expected_tries: 300,
            },
        ];

        for (index, test) in cases.into_iter().enumerate() {
            let policy = ReconnectPolicy::new(test.max_delay_secs, test.max_tries);
            assert_eq!(policy.max_delay, test.expected_delay, "TC{index} failed");
            assert_eq!(policy.max_tries, test.expected_tries, "TC{index} failed");
        }
    }

    #[test]
    fn large_attempt_numbers_do_not_overflow() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(200), Duration::from_secs(60));
    }
}
