use bytes::Buf;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::{
    assets::level::{Depth, Level},
    error::ProtocolError,
    model::tick::{Ohlc, QuoteSummary, Tick},
    shared::subscription_models::{Segment, StreamMode},
};

/*----- */
// Packet layout
/*----- */
pub const HEARTBEAT_MAX_LEN: usize = 4;

const LTP_PACKET_LEN: usize = 8;
const INDEX_QUOTE_PACKET_LEN: usize = 28;
const INDEX_FULL_PACKET_LEN: usize = 32;
const QUOTE_PACKET_LEN: usize = 44;
const DEPTH_PACKET_LEN: usize = 124;
const FULL_PACKET_LEN: usize = 184;

const DEPTH_ENTRY_LEN: usize = 12;
const DEPTH_LEVELS_PER_SIDE: usize = 5;
const FULL_DEPTH_OFFSET: usize = 64;
const COMPACT_DEPTH_OFFSET: usize = 4;

/// Decode one binary frame into ticks. Heartbeat frames decode to nothing.
/// Packets with an unrecognised length are skipped.
pub fn decode_frame(frame: &[u8], received_time: DateTime<Utc>) -> Result<Vec<Tick>, ProtocolError> {
    if frame.len() <= HEARTBEAT_MAX_LEN {
        return Ok(Vec::new());
    }

    let mut buf = frame;
    let packet_count = buf.get_u16();
    let mut ticks = Vec::with_capacity(packet_count as usize);

    for index in 0..packet_count {
        if buf.remaining() < 2 {
            return Err(ProtocolError::MissingLength {
                index,
                remaining: buf.remaining(),
            });
        }

        let declared = buf.get_u16() as usize;
        if buf.remaining() < declared {
            return Err(ProtocolError::Truncated {
                index,
                declared,
                remaining: buf.remaining(),
            });
        }

        let (packet, rest) = buf.split_at(declared);
        buf = rest;

        match decode_packet(packet, received_time) {
            Some(tick) => ticks.push(tick),
            None => debug!(
                packet_index = index,
                packet_len = declared,
                action = "skipping packet",
                message = "unrecognised packet length"
            ),
        }
    }

    Ok(ticks)
}

fn decode_packet(packet: &[u8], received_time: DateTime<Utc>) -> Option<Tick> {
    if !matches!(
        packet.len(),
        LTP_PACKET_LEN
            | INDEX_QUOTE_PACKET_LEN
            | INDEX_FULL_PACKET_LEN
            | QUOTE_PACKET_LEN
            | DEPTH_PACKET_LEN
            | FULL_PACKET_LEN
    ) {
        return None;
    }

    let reader = PacketReader(packet);
    let instrument_token = reader.u32_at(0);
    let segment = Segment::from_token(instrument_token);
    let price = |offset: usize| segment.price(reader.u32_at(offset));

    let base = Tick::ltp(instrument_token, price(4), received_time);

    match packet.len() {
        LTP_PACKET_LEN => Some(base),
        INDEX_QUOTE_PACKET_LEN | INDEX_FULL_PACKET_LEN => {
            let exchange_time = (packet.len() == INDEX_FULL_PACKET_LEN)
                .then(|| reader.timestamp_at(28))
                .flatten();

            Some(Tick {
                mode: if exchange_time.is_some() {
                    StreamMode::Full
                } else {
                    StreamMode::Quote
                },
                quote: Some(QuoteSummary {
                    last_traded_quantity: 0,
                    average_traded_price: Default::default(),
                    volume_traded: 0,
                    total_buy_quantity: 0,
                    total_sell_quantity: 0,
                    ohlc: Ohlc {
                        high: price(8),
                        low: price(12),
                        open: price(16),
                        close: price(20),
                    },
                    last_trade_time: None,
                    open_interest: None,
                }),
                exchange_time,
                ..base
            })
        }
        QUOTE_PACKET_LEN => Some(Tick {
            mode: StreamMode::Quote,
            quote: Some(reader.quote(segment, false)),
            ..base
        }),
        DEPTH_PACKET_LEN => Some(Tick {
            mode: StreamMode::Full,
            depth: reader.depth(segment, COMPACT_DEPTH_OFFSET),
            ..base
        }),
        FULL_PACKET_LEN => Some(Tick {
            mode: StreamMode::Full,
            quote: Some(reader.quote(segment, true)),
            exchange_time: reader.timestamp_at(60),
            depth: reader.depth(segment, FULL_DEPTH_OFFSET),
            ..base
        }),
        _ => None,
    }
}

/*----- */
// Packet reader
/*----- */
// Offsets are only read for packet lengths matched above, so every read is
// in bounds.
struct PacketReader<'a>(&'a [u8]);

impl PacketReader<'_> {
    fn u32_at(&self, offset: usize) -> u32 {
        (&self.0[offset..offset + 4]).get_u32()
    }

    fn u16_at(&self, offset: usize) -> u16 {
        (&self.0[offset..offset + 2]).get_u16()
    }

    fn timestamp_at(&self, offset: usize) -> Option<DateTime<Utc>> {
        match self.u32_at(offset) {
            0 => None,
            secs => DateTime::<Utc>::from_timestamp(secs as i64, 0),
        }
    }

    fn quote(&self, segment: Segment, full: bool) -> QuoteSummary {
        QuoteSummary {
            last_traded_quantity: self.u32_at(8),
            average_traded_price: segment.price(self.u32_at(12)),
            volume_traded: self.u32_at(16),
            total_buy_quantity: self.u32_at(20),
            total_sell_quantity: self.u32_at(24),
            ohlc: Ohlc {
                open: segment.price(self.u32_at(28)),
                high: segment.price(self.u32_at(32)),
                low: segment.price(self.u32_at(36)),
                close: segment.price(self.u32_at(40)),
            },
            last_trade_time: full.then(|| self.timestamp_at(44)).flatten(),
            open_interest: full.then(|| self.u32_at(48)),
        }
    }

    fn depth(&self, segment: Segment, offset: usize) -> Depth {
        let mut levels = (0..DEPTH_LEVELS_PER_SIDE * 2).map(|index| {
            let entry = offset + index * DEPTH_ENTRY_LEN;
            Level::new(
                segment.price(self.u32_at(entry + 4)),
                self.u32_at(entry) as u64,
                self.u16_at(entry + 8),
            )
        });

        let buy = levels.by_ref().take(DEPTH_LEVELS_PER_SIDE).collect::<Vec<_>>();
        let sell = levels.collect::<Vec<_>>();

        // Venues pad unused levels with zeros
        Depth::new(strip_empty(buy), strip_empty(sell))
    }
}

fn strip_empty(levels: Vec<Level>) -> Vec<Level> {
    levels
        .into_iter()
        .filter(|level| level.quantity > 0 || !level.price.is_zero())
        .collect()
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use rust_decimal_macros::dec;

    pub const NSE_TOKEN: u32 = (408065 << 8) | 1;

    /// Encode a full packet the way the venue does.
    pub fn full_packet(token: u32, ltp: u32, buy: &[(u32, u32)], sell: &[(u32, u32)]) -> Vec<u8> {
        let mut packet = vec![0u8; FULL_PACKET_LEN];
        packet[0..4].copy_from_slice(&token.to_be_bytes());
        packet[4..8].copy_from_slice(&ltp.to_be_bytes());
        packet[8..12].copy_from_slice(&25u32.to_be_bytes());
        packet[60..64].copy_from_slice(&1_700_000_000u32.to_be_bytes());

        let entries = buy
            .iter()
            .chain(std::iter::repeat(&(0, 0)).take(5 - buy.len()))
            .chain(sell.iter())
            .chain(std::iter::repeat(&(0, 0)).take(5 - sell.len()));

        for (index, (price, quantity)) in entries.enumerate() {
            let entry = FULL_DEPTH_OFFSET + index * DEPTH_ENTRY_LEN;
            packet[entry..entry + 4].copy_from_slice(&quantity.to_be_bytes());
            packet[entry + 4..entry + 8].copy_from_slice(&price.to_be_bytes());
            packet[entry + 8..entry + 10].copy_from_slice(&1u16.to_be_bytes());
        }

        packet
    }

    pub fn frame(packets: &[Vec<u8>]) -> Vec<u8> {
        let mut frame = (packets.len() as u16).to_be_bytes().to_vec();
        for packet in packets {
            frame.extend_from_slice(&(packet.len() as u16).to_be_bytes());
            frame.extend_from_slice(packet);
        }
        frame
    }

    #[test]
    fn heartbeat_frames_decode_to_nothing() {
        let now = Utc::now();
        assert_eq!(decode_frame(&[], now), Ok(Vec::new()));
        assert_eq!(decode_frame(&[0x00], now), Ok(Vec::new()));
        assert_eq!(decode_frame(&[0, 0, 0, 0], now), Ok(Vec::new()));
    }

    #[test]
    fn decodes_ltp_packet() {
        let mut packet = NSE_TOKEN.to_be_bytes().to_vec();
        packet.extend_from_slice(&188645u32.to_be_bytes());

        let now = Utc::now();
        let ticks = decode_frame(&frame(&[packet]), now).unwrap();

        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].instrument_token, NSE_TOKEN);
        assert_eq!(ticks[0].mode, StreamMode::Ltp);
        assert_eq!(ticks[0].last_price, dec!(1886.45));
        assert!(ticks[0].tradable);
        assert_eq!(ticks[0].received_time, now);
    }

    #[test]
    fn decodes_full_packet_depth() {
        let packet = full_packet(
            NSE_TOKEN,
            188645,
            &[(188645, 1486), (188625, 1)],
            &[(188680, 30), (188685, 30), (188690, 10)],
        );

        let ticks = decode_frame(&frame(&[packet]), Utc::now()).unwrap();
        let tick = &ticks[0];

        assert_eq!(tick.mode, StreamMode::Full);
        assert_eq!(tick.depth.buy.len(), 2);
        assert_eq!(tick.depth.sell.len(), 3);
        assert_eq!(tick.depth.buy[0], Level::new(dec!(1886.45), 1486, 1));
        assert_eq!(tick.depth.sell[2], Level::new(dec!(1886.90), 10, 1));
        assert_eq!(
            tick.exchange_time,
            DateTime::<Utc>::from_timestamp(1_700_000_000, 0)
        );
        assert_eq!(tick.quote.as_ref().map(|q| q.last_traded_quantity), Some(25));
    }

    #[test]
    fn every_tick_in_a_frame_shares_ingest_time() {
        let second = (738561 << 8) | 4;
        let packets = vec![
            full_packet(NSE_TOKEN, 188645, &[(188645, 10)], &[(188680, 10)]),
            full_packet(second, 188285, &[(188285, 35)], &[(188450, 10)]),
        ];

        let now = Utc::now();
        let ticks = decode_frame(&frame(&packets), now).unwrap();

        assert_eq!(ticks.len(), 2);
        assert!(ticks.iter().all(|tick| tick.received_time == now));
    }

    #[test]
    fn currency_segment_uses_wider_scale() {
        let token: u32 = (1 << 8) | 3;
        let mut packet = token.to_be_bytes().to_vec();
        packet.extend_from_slice(&832_512_500u32.to_be_bytes());

        let ticks = decode_frame(&frame(&[packet]), Utc::now()).unwrap();
        assert_eq!(ticks[0].last_price, dec!(83.25125));
    }

    #[test]
    fn unknown_packet_lengths_are_skipped() {
        let mut ltp = NSE_TOKEN.to_be_bytes().to_vec();
        ltp.extend_from_slice(&100u32.to_be_bytes());

        let ticks = decode_frame(&frame(&[vec![0u8; 10], ltp]), Utc::now()).unwrap();
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].last_price, dec!(1.00));
    }

    #[test]
    fn truncated_frames_are_rejected() {
        struct TestCase {
            frame: Vec<u8>,
            expected: ProtocolError,
        }

        let cases = vec![
            // TC0: declared length overruns buffer
            TestCase {
                frame: vec![0, 1, 0, 44, 1, 2, 3],
                expected: ProtocolError::Truncated {
                    index: 0,
                    declared: 44,
                    remaining: 3,
                },
            },
            // TC1: second packet has no length prefix
            TestCase {
                frame: {
                    let mut frame = vec![0, 2, 0, 8];
                    frame.extend_from_slice(&[0u8; 8]);
                    frame.push(0);
                    frame
                },
                expected: ProtocolError::MissingLength {
                    index: 1,
                    remaining: 1,
                },
            },
        ];

        for (index, test) in cases.into_iter().enumerate() {
            let actual = decode_frame(&test.frame, Utc::now());
            assert_eq!(actual, Err(test.expected), "TC{index} failed");
        }
    }
}
