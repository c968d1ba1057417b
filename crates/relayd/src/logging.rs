use crate::message::MessageId;
use anyhow::Context;
use async_trait::async_trait;
use bounce_classify::BouncePair;
use chrono::{DateTime, Utc};
use flume::{Receiver, Sender};
use parking_lot::Mutex;
use rfc5321::Response;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::net::IpAddr;
use std::path::PathBuf;
use std::thread::JoinHandle;

#[derive(Serialize, Deserialize, Debug, Copy, Clone, Eq, PartialEq, strum::Display)]
pub enum RecordType {
    /// The destination accepted the message
    Delivery,
    /// The message failed permanently
    Bounce,
    /// The attempt failed and the message will be retried
    TransientFailure,
    /// The attempt was denied by a local rate limit
    Throttled,
    /// Recorded when a message is expiring from the queue
    Expiration,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TransactionRecord {
    /// What kind of record this is
    #[serde(rename = "type")]
    pub kind: RecordType,
    /// The message id
    pub id: MessageId,
    /// The envelope sender
    pub sender: String,
    /// The envelope recipients
    pub recipients: Vec<String>,
    /// Which MX host the message was being delivered to
    pub site: Option<String>,
    /// The local address the attempt was made from
    pub sending_ip: Option<IpAddr>,
    pub egress_source: Option<String>,
    /// The response from the peer, or a synthesized description
    /// of a local failure
    pub response: Response,
    /// Present when the outcome is not a success
    pub bounce_classification: Option<BouncePair>,
    /// The time at which we are logging this event
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
    /// The time at which the message was initially queued
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created: DateTime<Utc>,
    /// The number of delivery attempts that have been made,
    /// including this one
    pub num_attempts: u32,
}

/// Receives one record per delivery attempt.
/// Logging never fails the attempt; implementations report their own
/// errors through tracing.
#[async_trait]
pub trait TransactionLogger: Send + Sync {
    async fn log_transaction(&self, record: TransactionRecord);

    /// Flush and stop; called once the engine has drained
    async fn shutdown(&self) {}
}

/// Emits records as structured diagnostic events
#[derive(Default, Debug)]
pub struct TracingLogger;

#[async_trait]
impl TransactionLogger for TracingLogger {
    async fn log_transaction(&self, record: TransactionRecord) {
        tracing::info!(
            message_id = %record.id,
            kind = %record.kind,
            site = record.site.as_deref().unwrap_or(""),
            sending_ip = ?record.sending_ip,
            bounce = ?record.bounce_classification,
            attempts = record.num_attempts,
            "{}",
            record.response.to_single_line()
        );
    }
}

/// Keeps records in memory
#[derive(Default, Debug)]
pub struct MemoryLogger {
    records: Mutex<Vec<TransactionRecord>>,
}

impl MemoryLogger {
    pub fn records(&self) -> Vec<TransactionRecord> {
        self.records.lock().clone()
    }

    pub fn records_for(&self, id: MessageId) -> Vec<TransactionRecord> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.id == id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl TransactionLogger for MemoryLogger {
    async fn log_transaction(&self, record: TransactionRecord) {
        self.records.lock().push(record);
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct LogFileParams {
    /// Where to place the log files
    pub log_dir: PathBuf,
    /// How many bytes to allow per file segment
    #[serde(default = "LogFileParams::default_max_file_size")]
    pub max_file_size: u64,
    /// Maximum number of outstanding items to be logged before
    /// the submission will block; helps to avoid runaway issues
    /// spiralling out of control.
    #[serde(default = "LogFileParams::default_back_pressure")]
    pub back_pressure: usize,
}

impl LogFileParams {
    fn default_max_file_size() -> u64 {
        1_000_000_000
    }
    fn default_back_pressure() -> usize {
        128_000
    }
}

enum LogCommand {
    Record(TransactionRecord),
    Terminate,
}

/// Writes one JSON document per line into segment files under
/// `log_dir`. The writing happens on a dedicated thread so that slow
/// storage applies back pressure rather than stalling the runtime.
pub struct JsonFileLogger {
    sender: Sender<LogCommand>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

struct OpenedFile {
    file: std::io::BufWriter<std::fs::File>,
    name: PathBuf,
    written: u64,
}

impl JsonFileLogger {
    pub fn new(params: LogFileParams) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&params.log_dir)
            .with_context(|| format!("creating log directory {}", params.log_dir.display()))?;

        let (sender, receiver) = flume::bounded(params.back_pressure);
        let thread = std::thread::Builder::new()
            .name("transaction-log".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        tracing::error!("failed to create logger runtime: {err:#}");
                        return;
                    }
                };
                runtime.block_on(Self::logger_thread(params, receiver));
            })
            .context("spawning transaction log thread")?;

        Ok(Self {
            sender,
            thread: Mutex::new(Some(thread)),
        })
    }

    fn do_record(
        params: &LogFileParams,
        file: &mut Option<OpenedFile>,
        record: TransactionRecord,
    ) -> anyhow::Result<()> {
        if file.is_none() {
            let now = Utc::now();
            let name = params
                .log_dir
                .join(format!("{}.jsonl", now.format("%Y%m%d-%H%M%S-%f")));

            let f = std::fs::OpenOptions::new()
                .append(true)
                .create(true)
                .open(&name)
                .with_context(|| format!("open log file {name:?}"))?;

            file.replace(OpenedFile {
                file: std::io::BufWriter::new(f),
                name,
                written: 0,
            });
        }

        let mut need_rotate = false;

        if let Some(file) = file.as_mut() {
            let mut json = serde_json::to_string(&record).context("serializing record")?;
            json.push('\n');
            file.file
                .write_all(json.as_bytes())
                .with_context(|| format!("writing record to {}", file.name.display()))?;
            file.written += json.len() as u64;

            need_rotate = file.written >= params.max_file_size;
        }

        if need_rotate {
            Self::close_file(file);
        }

        Ok(())
    }

    fn close_file(file: &mut Option<OpenedFile>) {
        if let Some(mut file) = file.take() {
            if let Err(err) = file.file.flush() {
                tracing::error!("failed to flush {}: {err:#}", file.name.display());
            }
        }
    }

    async fn logger_thread(params: LogFileParams, receiver: Receiver<LogCommand>) {
        let mut file: Option<OpenedFile> = None;

        while let Ok(cmd) = receiver.recv_async().await {
            match cmd {
                LogCommand::Terminate => break,
                LogCommand::Record(record) => {
                    if let Err(err) = Self::do_record(&params, &mut file, record) {
                        tracing::error!("failed to log: {err:#}");
                    }
                }
            }
        }

        Self::close_file(&mut file);
    }
}

#[async_trait]
impl TransactionLogger for JsonFileLogger {
    async fn log_transaction(&self, record: TransactionRecord) {
        if let Err(err) = self.sender.send_async(LogCommand::Record(record)).await {
            tracing::error!("transaction log is not accepting records: {err:#}");
        }
    }

    async fn shutdown(&self) {
        self.sender.send_async(LogCommand::Terminate).await.ok();
        let thread = self.thread.lock().take();
        if let Some(thread) = thread {
            if let Err(err) = tokio::task::spawn_blocking(move || thread.join()).await {
                tracing::error!("waiting for transaction log thread: {err:#}");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bounce_classify::{BounceCode, BounceType};

    fn record(kind: RecordType, code: u16, text: &str) -> TransactionRecord {
        let now = Utc::now();
        TransactionRecord {
            kind,
            id: MessageId::new(),
            sender: "sender@example.com".to_string(),
            recipients: vec!["user@example.net".to_string()],
            site: Some("mx.example.net".to_string()),
            sending_ip: Some("10.0.0.1".parse().unwrap()),
            egress_source: Some("vmta1".to_string()),
            response: Response::with_code_and_message(code, text),
            bounce_classification: Some(BouncePair::new(BounceType::Hard, BounceCode::BadEmailAddress)),
            timestamp: now,
            created: now,
            num_attempts: 1,
        }
    }

    #[test_log::test(tokio::test)]
    async fn json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let logger = JsonFileLogger::new(LogFileParams {
            log_dir: dir.path().to_path_buf(),
            max_file_size: LogFileParams::default_max_file_size(),
            back_pressure: 16,
        })
        .unwrap();

        logger
            .log_transaction(record(RecordType::Bounce, 550, "5.1.1 no such user"))
            .await;
        logger
            .log_transaction(record(RecordType::Delivery, 250, "2.0.0 ok"))
            .await;
        logger.shutdown().await;

        let mut lines = vec![];
        for entry in std::fs::read_dir(dir.path()).unwrap() {
            let text = std::fs::read_to_string(entry.unwrap().path()).unwrap();
            lines.extend(text.lines().map(|l| l.to_string()));
        }
        k9::assert_equal!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
        k9::assert_equal!(first["type"].as_str(), Some("Bounce"));
        k9::assert_equal!(first["response"]["code"].as_u64(), Some(550));
        k9::assert_equal!(first["site"].as_str(), Some("mx.example.net"));
        k9::assert_equal!(
            first["bounce_classification"]["bounce_code"].as_str(),
            Some("BadEmailAddress")
        );
    }

    #[test_log::test(tokio::test)]
    async fn rotation() {
        let dir = tempfile::tempdir().unwrap();
        let logger = JsonFileLogger::new(LogFileParams {
            log_dir: dir.path().to_path_buf(),
            max_file_size: 1,
            back_pressure: 16,
        })
        .unwrap();

        for _ in 0..3 {
            logger
                .log_transaction(record(RecordType::TransientFailure, 451, "4.3.0 later"))
                .await;
            // Segment names have sub-second precision; keep them distinct
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        logger.shutdown().await;

        k9::assert_equal!(std::fs::read_dir(dir.path()).unwrap().count(), 3);
    }

    #[tokio::test]
    async fn memory() {
        let logger = MemoryLogger::default();
        let r = record(RecordType::Throttled, 451, "4.7.0 throttled");
        let id = r.id;
        logger.log_transaction(r).await;
        logger
            .log_transaction(record(RecordType::Delivery, 250, "ok"))
            .await;
        k9::assert_equal!(logger.records().len(), 2);
        k9::assert_equal!(logger.records_for(id).len(), 1);
    }
}
