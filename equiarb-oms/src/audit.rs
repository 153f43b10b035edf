use chrono::{DateTime, Utc};
use equiarb_data::{OrderUpdate, Tick};
use equiarb_strategy::Opportunity;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    path::PathBuf,
    sync::atomic::{AtomicBool, Ordering},
};
use tokio::{fs::OpenOptions, io::AsyncWriteExt, sync::mpsc, task::JoinHandle};
use tracing::{error, warn};

/*----- */
// Audit records
/*----- */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum AuditRecord {
    Opportunity {
        recorded_at: DateTime<Utc>,
        opportunity: Opportunity,
    },
    Ticks {
        recorded_at: DateTime<Utc>,
        ticks: Vec<Tick>,
    },
    OrderUpdate {
        recorded_at: DateTime<Utc>,
        update: OrderUpdate,
    },
}

/// Durable audit trail. Fire-and-forget: callers never wait on storage.
pub trait AuditSink: Send + Sync {
    fn record(&self, record: AuditRecord);

    fn record_opportunity(&self, opportunity: &Opportunity) {
        self.record(AuditRecord::Opportunity {
            recorded_at: Utc::now(),
            opportunity: opportunity.clone(),
        });
    }

    fn record_ticks(&self, ticks: Vec<Tick>) {
        self.record(AuditRecord::Ticks {
            recorded_at: Utc::now(),
            ticks,
        });
    }

    fn record_order_update(&self, update: &OrderUpdate) {
        self.record(AuditRecord::OrderUpdate {
            recorded_at: Utc::now(),
            update: update.clone(),
        });
    }
}

/*----- */
// In-memory log
/*----- */
#[derive(Debug, Default)]
pub struct InMemoryAuditLog {
    records: Mutex<Vec<AuditRecord>>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }

    pub fn opportunities(&self) -> Vec<Opportunity> {
        self.records
            .lock()
            .iter()
            .filter_map(|record| match record {
                AuditRecord::Opportunity { opportunity, .. } => Some(opportunity.clone()),
                _ => None,
            })
            .collect()
    }
}

impl AuditSink for InMemoryAuditLog {
    fn record(&self, record: AuditRecord) {
        self.records.lock().push(record);
    }
}

/*----- */
// JSON lines log
/*----- */
/// Forwards records to a background task appending one JSON document per
/// line.
#[derive(Debug)]
pub struct JsonLinesAuditLog {
    receiver_dropped: AtomicBool,
    record_tx: mpsc::UnboundedSender<AuditRecord>,
}

impl JsonLinesAuditLog {
    pub fn spawn(path: PathBuf) -> (Self, JoinHandle<()>) {
        let (record_tx, record_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_lines(path, record_rx));

        (
            Self {
                receiver_dropped: AtomicBool::new(false),
                record_tx,
            },
            writer,
        )
    }
}

impl AuditSink for JsonLinesAuditLog {
    fn record(&self, record: AuditRecord) {
        if self.receiver_dropped.load(Ordering::Relaxed) {
            return;
        }

        if self.record_tx.send(record).is_err() {
            warn!(
                action = "setting receiver_dropped = true",
                why = "audit writer stopped",
                "cannot send AuditRecords"
            );
            self.receiver_dropped.store(true, Ordering::Relaxed);
        }
    }
}

async fn write_lines(path: PathBuf, mut record_rx: mpsc::UnboundedReceiver<AuditRecord>) {
    let mut file = match OpenOptions::new().create(true).append(true).open(&path).await {
        Ok(file) => file,
        Err(error) => {
            error!(
                path = %path.display(),
                error = %error,
                message = "Failed to open audit log, records will be dropped"
            );
            return;
        }
    };

    while let Some(record) = record_rx.recv().await {
        let mut line = match serde_json::to_vec(&record) {
            Ok(line) => line,
            Err(error) => {
                warn!(error = %error, message = "Failed to serialise audit record");
                continue;
            }
        };
        line.push(b'\n');

        if let Err(error) = file.write_all(&line).await {
            error!(
                path = %path.display(),
                error = %error,
                message = "Failed to write audit record"
            );
        }
    }

    let _ = file.flush().await;
}

#[cfg(test)]
mod test {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn json_lines_log_appends_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        let (log, writer) = JsonLinesAuditLog::spawn(path.clone());
        log.record_ticks(vec![Tick::ltp(1, dec!(10.5), Utc::now())]);
        log.record_ticks(vec![Tick::ltp(2, dec!(11), Utc::now())]);
        drop(log);
        writer.await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let records = contents
            .lines()
            .map(|line| serde_json::from_str::<AuditRecord>(line).unwrap())
            .collect::<Vec<_>>();

        assert_eq!(records.len(), 2);
        assert!(matches!(&records[1], AuditRecord::Ticks { ticks, .. } if ticks[0].instrument_token == 2));
    }
}
