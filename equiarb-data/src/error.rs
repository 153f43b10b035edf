use thiserror::Error;

use crate::protocols::ws::WsError;

/*----- */
// Feed errors
/*----- */
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Invalid feed url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Deserialising JSON error: {error} for payload: {payload}")]
    Deserialise {
        error: serde_json::Error,
        payload: String,
    },

    #[error("Serialising JSON error: {0}")]
    Serialise(serde_json::Error),

    #[error("error subscribing to instruments over the socket: {0}")]
    Subscribe(String),

    #[error("Venue reported error: {0}")]
    Venue(String),

    // Terminal errors
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Feed terminated with closing frame: {0}")]
    Terminated(String),

    #[error("Gave up reconnecting after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
}

impl FeedError {
    /// Terminal errors tear the session down and go through the reconnect
    /// path. Everything else is logged and the session keeps reading.
    #[allow(clippy::match_like_matches_macro)]
    pub fn is_terminal(&self) -> bool {
        match self {
            FeedError::WebSocket(_) => true,
            FeedError::ConnectionLost(_) => true,
            FeedError::Terminated(_) => true,
            FeedError::RetriesExhausted { .. } => true,
            _ => false,
        }
    }
}

/*----- */
// Binary frame errors
/*----- */
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("packet {index} declares {declared} bytes but only {remaining} remain")]
    Truncated {
        index: u16,
        declared: usize,
        remaining: usize,
    },

    #[error("packet {index} length prefix missing, {remaining} bytes remain")]
    MissingLength { index: u16, remaining: usize },
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn terminal_errors_force_reconnect() {
        struct TestCase {
            error: FeedError,
            expected: bool,
        }

        let cases = vec![
            TestCase {
                error: FeedError::ConnectionLost("pong timeout".to_string()),
                expected: true,
            },
            TestCase {
                error: FeedError::Terminated("going away".to_string()),
                expected: true,
            },
            TestCase {
                error: FeedError::Protocol(ProtocolError::MissingLength {
                    index: 0,
                    remaining: 1,
                }),
                expected: false,
            },
            TestCase {
                error: FeedError::Venue("invalid token".to_string()),
                expected: false,
            },
        ];

        for (index, test) in cases.into_iter().enumerate() {
            assert_eq!(test.error.is_terminal(), test.expected, "TC{index} failed");
        }
    }
}
