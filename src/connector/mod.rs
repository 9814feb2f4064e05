use std::fs;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::core::config::ConfigLookup;
use crate::core::error::{Error, ErrorKind, Result};
use crate::server::ShardSearchServer;

/// Default seconds between change-log polls when the configuration does not
/// say otherwise (`listenerWaitTime`).
const DEFAULT_LISTENER_WAIT_SECS: u64 = 1;

/// The engine-side interface a connector drives records through.
pub trait ServerInterface: Send + Sync {
    fn config_look_up(&self, key: &str) -> Option<String>;
    fn insert_record(&self, json: &str) -> Result<()>;
    fn delete_record(&self, primary_key: &str) -> Result<()>;
    fn update_record(&self, primary_key: &str, json: &str) -> Result<()>;
}

/// Contract for pluggable change-data-capture connectors feeding an external
/// database's records into the engine.
pub trait DataConnector: Send {
    /// Configuration lookup, connection setup, schema discovery.
    fn init(&mut self, server: Arc<dyn ServerInterface>) -> Result<()>;

    /// Bulk initial ingest: stream every existing row through
    /// `insert_record`.
    fn create_new_indexes(&mut self) -> Result<()>;

    /// Poll the change log and translate entries into engine mutations,
    /// retrying with a fixed backoff on transient database errors, until the
    /// stop flag is raised.
    fn run_listener(&mut self, stop: &AtomicBool) -> Result<()>;

    /// Flush the high-water mark. The engine calls this on graceful
    /// shutdown in addition to the listener's own periodic flushes.
    fn save_last_accessed_log_record_time(&mut self) -> Result<()>;
}

/// File-backed high-water mark of the last applied change-log entry.
pub struct HighWaterMark {
    path: PathBuf,
    value: u64,
    dirty: bool,
}

impl HighWaterMark {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let value = match fs::read_to_string(&path) {
            Ok(content) => content.trim().parse().unwrap_or(0),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => 0,
            Err(err) => return Err(err.into()),
        };
        Ok(HighWaterMark {
            path,
            value,
            dirty: false,
        })
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn advance(&mut self, value: u64) {
        if value > self.value {
            self.value = value;
            self.dirty = true;
        }
    }

    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, self.value.to_string())?;
        fs::rename(&tmp, &self.path)?;
        self.dirty = false;
        Ok(())
    }
}

/// Adapter exposing one shard server through the connector-facing interface.
pub struct ShardServerInterface {
    server: Arc<ShardSearchServer>,
    config: ConfigLookup,
}

impl ShardServerInterface {
    pub fn new(server: Arc<ShardSearchServer>, config: ConfigLookup) -> Self {
        ShardServerInterface { server, config }
    }
}

impl ServerInterface for ShardServerInterface {
    fn config_look_up(&self, key: &str) -> Option<String> {
        self.config.get(key).map(str::to_string)
    }

    fn insert_record(&self, json: &str) -> Result<()> {
        self.server.insert_json(json)
    }

    fn delete_record(&self, primary_key: &str) -> Result<()> {
        self.server.delete(primary_key)
    }

    fn update_record(&self, _primary_key: &str, json: &str) -> Result<()> {
        self.server.update_json(json)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase", tag = "op")]
enum ChangeEntry {
    Insert {
        seq: u64,
        record: serde_json::Value,
    },
    Update {
        seq: u64,
        pk: String,
        record: serde_json::Value,
    },
    Delete {
        seq: u64,
        pk: String,
    },
}

impl ChangeEntry {
    fn seq(&self) -> u64 {
        match self {
            ChangeEntry::Insert { seq, .. }
            | ChangeEntry::Update { seq, .. }
            | ChangeEntry::Delete { seq, .. } => *seq,
        }
    }
}

/// Reference connector: tails a JSON-lines change log on disk. Each line is
/// `{"op": "insert"|"update"|"delete", "seq": N, ...}`; entries at or below
/// the persisted high-water mark are skipped on restart.
pub struct JsonLinesConnector {
    log_path: PathBuf,
    mark_path: PathBuf,
    server: Option<Arc<dyn ServerInterface>>,
    mark: Option<HighWaterMark>,
    wait: Duration,
}

impl JsonLinesConnector {
    pub fn new(log_path: impl Into<PathBuf>, mark_path: impl Into<PathBuf>) -> Self {
        JsonLinesConnector {
            log_path: log_path.into(),
            mark_path: mark_path.into(),
            server: None,
            mark: None,
            wait: Duration::from_secs(DEFAULT_LISTENER_WAIT_SECS),
        }
    }

    fn server(&self) -> Result<&Arc<dyn ServerInterface>> {
        self.server
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::InvalidState, "connector not initialised"))
    }

    fn apply(&self, entry: &ChangeEntry) -> Result<()> {
        let server = self.server()?;
        match entry {
            ChangeEntry::Insert { record, .. } => server.insert_record(&record.to_string()),
            ChangeEntry::Update { pk, record, .. } => {
                server.update_record(pk, &record.to_string())
            }
            ChangeEntry::Delete { pk, .. } => server.delete_record(pk),
        }
    }

    /// Apply every unseen entry; flush the mark once per committed batch.
    fn drain_log(&mut self) -> Result<usize> {
        let file = match fs::File::open(&self.log_path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };
        let watermark = self.mark.as_ref().map(|m| m.value()).unwrap_or(0);

        let mut applied = 0;
        let mut highest = watermark;
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: ChangeEntry = serde_json::from_str(&line)
                .map_err(|e| Error::validation(format!("bad change entry: {}", e)))?;
            if entry.seq() <= watermark {
                continue;
            }
            match self.apply(&entry) {
                Ok(()) => {}
                // A duplicate insert or missing delete target means the
                // entry was already applied before a crash; skip it.
                Err(err)
                    if matches!(
                        err.kind,
                        ErrorKind::DuplicatePrimaryKey | ErrorKind::NotFound
                    ) =>
                {
                    debug!(seq = entry.seq(), error = %err, "change already applied");
                }
                Err(err) => return Err(err),
            }
            highest = highest.max(entry.seq());
            applied += 1;
        }

        if let Some(mark) = &mut self.mark {
            mark.advance(highest);
            mark.flush()?;
        }
        Ok(applied)
    }
}

impl DataConnector for JsonLinesConnector {
    fn init(&mut self, server: Arc<dyn ServerInterface>) -> Result<()> {
        if let Some(wait) = server
            .config_look_up("listenerWaitTime")
            .and_then(|v| v.parse().ok())
        {
            self.wait = Duration::from_secs(wait);
        }
        self.mark = Some(HighWaterMark::load(&self.mark_path)?);
        self.server = Some(server);
        info!(log = %self.log_path.display(), "connector initialised");
        Ok(())
    }

    fn create_new_indexes(&mut self) -> Result<()> {
        let applied = self.drain_log()?;
        info!(records = applied, "initial ingest complete");
        Ok(())
    }

    fn run_listener(&mut self, stop: &AtomicBool) -> Result<()> {
        while !stop.load(Ordering::Relaxed) {
            match self.drain_log() {
                Ok(0) => {}
                Ok(applied) => debug!(applied, "applied change batch"),
                Err(err) if err.is_transient() => {
                    warn!(error = %err, "transient failure, backing off");
                }
                Err(err) => return Err(err),
            }
            std::thread::sleep(self.wait);
        }
        self.save_last_accessed_log_record_time()
    }

    fn save_last_accessed_log_record_time(&mut self) -> Result<()> {
        if let Some(mark) = &mut self.mark {
            mark.flush()?;
        }
        Ok(())
    }
}
