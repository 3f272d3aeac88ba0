//! JSON-lines exporter
//!
//! Writes one line per record: `{"signal", "resource", "record"}`. Meant for
//! local runs and tests where no collector is available.

use ampyobs_core::export::{BatchPayload, ExportBatch, ExportError, ExportResult, Exporter};
use ampyobs_core::records::Signal;
use ampyobs_core::resource::Resource;
use async_trait::async_trait;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JsonlTarget {
    Stdout,
    File(PathBuf),
}

/// JSONL exporter configuration
#[derive(Debug, Clone)]
pub struct JsonlExporterConfig {
    pub target: JsonlTarget,

    /// Whether to append to an existing file
    pub append: bool,

    /// Flush after each batch
    pub flush_each: bool,
}

impl Default for JsonlExporterConfig {
    fn default() -> Self {
        Self {
            target: JsonlTarget::File(PathBuf::from("ampyobs.jsonl")),
            append: true,
            flush_each: true,
        }
    }
}

#[derive(Serialize)]
struct Line<'a, R> {
    signal: Signal,
    resource: &'a Resource,
    record: &'a R,
}

pub struct JsonlExporter {
    config: JsonlExporterConfig,
    writer: Mutex<Box<dyn Write + Send>>,
    lines_written: AtomicU64,
    closed: AtomicBool,
}

impl JsonlExporter {
    /// Open the target, creating the file if needed
    pub fn open(config: JsonlExporterConfig) -> ExportResult<Self> {
        let writer: Box<dyn Write + Send> = match &config.target {
            JsonlTarget::Stdout => Box::new(io::stdout()),
            JsonlTarget::File(path) => {
                let file = if config.append {
                    OpenOptions::new().create(true).append(true).open(path)?
                } else {
                    File::create(path)?
                };
                info!("JSONL exporter writing to: {:?}", path);
                Box::new(BufWriter::new(file))
            }
        };

        Ok(Self {
            config,
            writer: Mutex::new(writer),
            lines_written: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn lines_written(&self) -> u64 {
        self.lines_written.load(Ordering::Relaxed)
    }

    fn encode(batch: &ExportBatch) -> ExportResult<String> {
        fn lines<R: Serialize>(
            out: &mut String,
            batch: &ExportBatch,
            records: &[R],
        ) -> ExportResult<()> {
            for record in records {
                let line = Line {
                    signal: batch.signal,
                    resource: &batch.resource,
                    record,
                };
                out.push_str(&serde_json::to_string(&line)?);
                out.push('\n');
            }
            Ok(())
        }

        let mut out = String::new();
        match &batch.records {
            BatchPayload::Logs(records) => lines(&mut out, batch, records)?,
            BatchPayload::Metrics(records) => lines(&mut out, batch, records)?,
            BatchPayload::Traces(records) => lines(&mut out, batch, records)?,
        }
        Ok(out)
    }

    fn with_writer<T>(&self, f: impl FnOnce(&mut dyn Write) -> io::Result<T>) -> ExportResult<T> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|e| io::Error::other(format!("Lock poisoned: {}", e)))?;
        Ok(f(&mut **writer)?)
    }
}

#[async_trait]
impl Exporter for JsonlExporter {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn export(&self, batch: &ExportBatch) -> ExportResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ExportError::Shutdown);
        }

        // encode everything first so a bad record never leaves a partial batch
        let payload = Self::encode(batch)?;
        let flush_each = self.config.flush_each;
        self.with_writer(|w| {
            w.write_all(payload.as_bytes())?;
            if flush_each {
                w.flush()?;
            }
            Ok(())
        })?;

        self.lines_written
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        debug!(signal = %batch.signal, records = batch.len(), "Wrote JSONL batch");
        Ok(())
    }

    async fn flush(&self) -> ExportResult<()> {
        self.with_writer(|w| w.flush())
    }

    async fn shutdown(&self) -> ExportResult<()> {
        self.closed.store(true, Ordering::Release);
        self.flush().await
    }
}
