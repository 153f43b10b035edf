use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Running inter-arrival statistics of ticks, per instrument.
#[derive(Debug, Default)]
pub struct ArrivalStats {
    instruments: HashMap<u32, ArrivalWindow>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArrivalSummary {
    pub instrument_token: u32,
    pub count: u64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub mean_ms: f64,
    pub std_ms: f64,
}

#[derive(Debug, Default)]
struct ArrivalWindow {
    last: Option<DateTime<Utc>>,
    count: u64,
    min_ms: f64,
    max_ms: f64,
    mean_ms: f64,
    m2: f64,
}

impl ArrivalStats {
    pub fn record(&mut self, instrument_token: u32, received_time: DateTime<Utc>) {
        let window = self.instruments.entry(instrument_token).or_default();
        let last = match window.last {
            // Out-of-order arrivals neither count nor move the window back
            Some(last) if received_time < last => return,
            Some(last) => last,
            None => {
                window.last = Some(received_time);
                return;
            }
        };
        window.last = Some(received_time);

        let gap_ms = (received_time - last).num_microseconds().unwrap_or(i64::MAX) as f64 / 1_000.0;

        // Welford
        window.count += 1;
        if window.count == 1 {
            window.min_ms = gap_ms;
            window.max_ms = gap_ms;
        } else {
            window.min_ms = window.min_ms.min(gap_ms);
            window.max_ms = window.max_ms.max(gap_ms);
        }
        let delta = gap_ms - window.mean_ms;
        window.mean_ms += delta / window.count as f64;
        window.m2 += delta * (gap_ms - window.mean_ms);
    }

    pub fn summaries(&self) -> Vec<ArrivalSummary> {
        let mut summaries = self
            .instruments
            .iter()
            .filter(|(_, window)| window.count > 0)
            .map(|(token, window)| ArrivalSummary {
                instrument_token: *token,
                count: window.count,
                min_ms: window.min_ms,
                max_ms: window.max_ms,
                mean_ms: window.mean_ms,
                std_ms: if window.count > 1 {
                    (window.m2 / (window.count - 1) as f64).sqrt()
                } else {
                    0.0
                },
            })
            .collect::<Vec<_>>();

        summaries.sort_by_key(|summary| summary.instrument_token);
        summaries
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::Duration;

    #[test]
    fn gaps_are_summarised_per_instrument() {
        let mut stats = ArrivalStats::default();
        let start = Utc::now();

        for offset in [0, 100, 300, 600] {
            stats.record(7, start + Duration::milliseconds(offset));
        }
        stats.record(8, start);

        let summaries = stats.summaries();
        assert_eq!(summaries.len(), 1);

        let summary = summaries[0];
        assert_eq!(summary.instrument_token, 7);
        assert_eq!(summary.count, 3);
        assert_eq!(summary.min_ms, 100.0);
        assert_eq!(summary.max_ms, 300.0);
        assert_eq!(summary.mean_ms, 200.0);
        assert_eq!(summary.std_ms, 100.0);
    }

    #[test]
    fn out_of_order_arrivals_are_ignored() {
        let mut stats = ArrivalStats::default();
        let start = Utc::now();

        stats.record(7, start);
        stats.record(7, start + Duration::milliseconds(100));
        stats.record(7, start - Duration::milliseconds(500));
        stats.record(7, start + Duration::milliseconds(200));

        let summary = stats.summaries()[0];
        assert_eq!(summary.count, 2);
        assert_eq!(summary.min_ms, 100.0);
        assert_eq!(summary.max_ms, 100.0);
        assert_eq!(summary.mean_ms, 100.0);
    }
}
