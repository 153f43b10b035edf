use itertools::Itertools;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{
    collections::{HashMap, HashSet},
    fmt::{Display, Formatter},
};

use crate::{error::FeedError, protocols::ws::WsMessage};

/*----- */
// Exchange segment
/*----- */
/// Exchange segment encoded in the low byte of every instrument token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Segment {
    Nse,
    Nfo,
    Cds,
    Bse,
    Bfo,
    Bcd,
    Mcx,
    Mcxsx,
    Indices,
    Unknown(u8),
}

impl Segment {
    pub fn from_token(instrument_token: u32) -> Self {
        match instrument_token & 0xff {
            1 => Segment::Nse,
            2 => Segment::Nfo,
            3 => Segment::Cds,
            4 => Segment::Bse,
            5 => Segment::Bfo,
            6 => Segment::Bcd,
            7 => Segment::Mcx,
            8 => Segment::Mcxsx,
            9 => Segment::Indices,
            other => Segment::Unknown(other as u8),
        }
    }

    /// Number of implied decimal places in integer prices for this segment.
    pub fn price_scale(&self) -> u32 {
        match self {
            Segment::Cds => 7,
            Segment::Bcd => 4,
            _ => 2,
        }
    }

    pub fn price(&self, raw: u32) -> Decimal {
        Decimal::new(raw as i64, self.price_scale())
    }

    pub fn is_tradable(&self) -> bool {
        !matches!(self, Segment::Indices)
    }
}

impl Display for Segment {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Segment::Nse => write!(f, "nse"),
            Segment::Nfo => write!(f, "nfo"),
            Segment::Cds => write!(f, "cds"),
            Segment::Bse => write!(f, "bse"),
            Segment::Bfo => write!(f, "bfo"),
            Segment::Bcd => write!(f, "bcd"),
            Segment::Mcx => write!(f, "mcx"),
            Segment::Mcxsx => write!(f, "mcxsx"),
            Segment::Indices => write!(f, "indices"),
            Segment::Unknown(code) => write!(f, "unknown({code})"),
        }
    }
}

/*----- */
// Stream mode
/*----- */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    Full,
    Quote,
    Ltp,
}

impl StreamMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamMode::Full => "full",
            StreamMode::Quote => "quote",
            StreamMode::Ltp => "ltp",
        }
    }
}

impl Display for StreamMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/*----- */
// Control messages
/*----- */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Subscribe(Vec<u32>),
    Unsubscribe(Vec<u32>),
    Mode(StreamMode, Vec<u32>),
}

impl ControlMessage {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ControlMessage::Subscribe(tokens) => json!({ "a": "subscribe", "v": tokens }),
            ControlMessage::Unsubscribe(tokens) => json!({ "a": "unsubscribe", "v": tokens }),
            ControlMessage::Mode(mode, tokens) => json!({ "a": "mode", "v": [mode, tokens] }),
        }
    }

    pub fn to_ws(&self) -> Result<WsMessage, FeedError> {
        serde_json::to_string(&self.to_json())
            .map(WsMessage::Text)
            .map_err(FeedError::Serialise)
    }
}

/// Runtime requests sent to a live connection through its `StreamHandle`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamCommand {
    Subscribe { tokens: Vec<u32>, mode: StreamMode },
    Unsubscribe { tokens: Vec<u32> },
    SetMode { tokens: Vec<u32>, mode: StreamMode },
    Stop,
}

/*----- */
// Subscription book
/*----- */
/// Last known mode per subscribed token. Replayed on every (re)connect.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionBook {
    modes: HashMap<u32, StreamMode>,
}

impl SubscriptionBook {
    pub fn new(tokens: &[u32], mode: StreamMode) -> Self {
        Self {
            modes: tokens.iter().map(|token| (*token, mode)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.modes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modes.is_empty()
    }

    pub fn mode_of(&self, token: u32) -> Option<StreamMode> {
        self.modes.get(&token).copied()
    }

    pub fn tokens(&self) -> Vec<u32> {
        self.modes.keys().copied().sorted().collect()
    }

    /// Subscribe + mode message for every group of tokens sharing a mode.
    pub fn resubscribe_messages(&self) -> Vec<ControlMessage> {
        self.modes
            .iter()
            .map(|(token, mode)| (*mode, *token))
            .into_group_map()
            .into_iter()
            .sorted_by_key(|(mode, _)| *mode)
            .flat_map(|(mode, tokens)| {
                let tokens = tokens.into_iter().sorted().collect::<Vec<_>>();
                [
                    ControlMessage::Subscribe(tokens.clone()),
                    ControlMessage::Mode(mode, tokens),
                ]
            })
            .collect()
    }

    /// Record a runtime command and return what has to go over the wire.
    pub fn apply(&mut self, command: StreamCommand) -> Vec<ControlMessage> {
        match command {
            StreamCommand::Subscribe { tokens, mode } => {
                tokens.iter().for_each(|token| {
                    self.modes.insert(*token, mode);
                });
                vec![
                    ControlMessage::Subscribe(tokens.clone()),
                    ControlMessage::Mode(mode, tokens),
                ]
            }
            StreamCommand::Unsubscribe { tokens } => {
                tokens.iter().for_each(|token| {
                    self.modes.remove(token);
                });
                vec![ControlMessage::Unsubscribe(tokens)]
            }
            StreamCommand::SetMode { tokens, mode } => {
                let tokens = tokens
                    .into_iter()
                    .filter(|token| match self.modes.get_mut(token) {
                        Some(current) => {
                            *current = mode;
                            true
                        }
                        None => false,
                    })
                    .collect::<Vec<_>>();

                if tokens.is_empty() {
                    Vec::new()
                } else {
                    vec![ControlMessage::Mode(mode, tokens)]
                }
            }
            StreamCommand::Stop => Vec::new(),
        }
    }
}

/*----- */
// Subscription groups
/*----- */
pub const DEFAULT_GROUP_CAPACITY: usize = 500;

/// Split instrument pairs into connection groups of at most `capacity`
/// tokens. Pairs sharing a token are kept together; a linked set larger than
/// one group is chunked across several.
pub fn partition_pairs(pairs: &[(u32, u32)], capacity: usize) -> Vec<Vec<u32>> {
    let capacity = capacity.max(2);

    // Linked components so that a token used by several pairs is never split
    let mut parent: HashMap<u32, u32> = HashMap::new();
    fn find(parent: &mut HashMap<u32, u32>, token: u32) -> u32 {
        let next = *parent.entry(token).or_insert(token);
        if next == token {
            return token;
        }
        let root = find(parent, next);
        parent.insert(token, root);
        root
    }

    for (a, b) in pairs {
        let root_a = find(&mut parent, *a);
        let root_b = find(&mut parent, *b);
        if root_a != root_b {
            parent.insert(root_a, root_b);
        }
    }

    // Preserve first-seen order of tokens
    let mut seen = HashSet::new();
    let ordered = pairs
        .iter()
        .flat_map(|(a, b)| [*a, *b])
        .filter(|token| seen.insert(*token))
        .collect::<Vec<_>>();

    let mut components: Vec<(u32, Vec<u32>)> = Vec::new();
    for token in ordered {
        let root = find(&mut parent, token);
        match components.iter_mut().find(|(r, _)| *r == root) {
            Some((_, members)) => members.push(token),
            None => components.push((root, vec![token])),
        }
    }

    let mut groups: Vec<Vec<u32>> = Vec::new();
    for (_, members) in components {
        if members.len() > capacity {
            groups.extend(members.chunks(capacity).map(|chunk| chunk.to_vec()));
            continue;
        }

        match groups
            .iter_mut()
            .find(|group| group.len() + members.len() <= capacity)
        {
            Some(group) => group.extend(members),
            None => groups.push(members),
        }
    }

    groups
}
