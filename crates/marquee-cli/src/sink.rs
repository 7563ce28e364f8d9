//! File-backed record sinks: one CSV or JSON-lines file per entity kind.
//!
//! The schema of each file is the union of the profile's declared fields
//! for that entity, in declaration order with the identity first. Absent
//! data is an empty CSV cell / an explicit JSON null — keys are never
//! omitted.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fs::File;
use std::io::{BufWriter, Write as _};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use marquee_core::error::CrawlError;
use marquee_core::profile::SiteProfile;
use marquee_core::record::{EntityKind, EntityRecord};
use marquee_core::traits::RecordSink;
use serde_json::Value;

/// Entity kinds a profile can actually emit.
fn emitted_entities(profile: &SiteProfile) -> Vec<EntityKind> {
    let mut out = vec![profile.detail.entity];
    for sub in &profile.subresources {
        if !out.contains(&sub.entity) {
            out.push(sub.entity);
        }
    }
    out
}

fn declared_headers(profile: &SiteProfile) -> HashMap<EntityKind, Vec<String>> {
    emitted_entities(profile)
        .into_iter()
        .map(|kind| (kind, profile.declared_fields(kind)))
        .collect()
}

fn sink_err(e: impl std::fmt::Display) -> CrawlError {
    CrawlError::Sink(e.to_string())
}

fn lock_recovering<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("Recovered from poisoned sink lock");
        poisoned.into_inner()
    })
}

// ---------------------------------------------------------------------------
// CSV
// ---------------------------------------------------------------------------

/// Per-entity CSV files (`movie.csv`, `review.csv`, …) under one directory.
#[derive(Clone)]
pub struct CsvSink {
    inner: Arc<Mutex<CsvInner>>,
}

struct CsvInner {
    dir: PathBuf,
    headers: HashMap<EntityKind, Vec<String>>,
    writers: HashMap<EntityKind, csv::Writer<File>>,
}

impl CsvSink {
    pub fn create(dir: &Path, profile: &SiteProfile) -> Result<Self, CrawlError> {
        std::fs::create_dir_all(dir).map_err(sink_err)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(CsvInner {
                dir: dir.to_path_buf(),
                headers: declared_headers(profile),
                writers: HashMap::new(),
            })),
        })
    }
}

impl CsvInner {
    fn write(&mut self, record: &EntityRecord) -> Result<(), CrawlError> {
        let headers = self
            .headers
            .get(&record.entity)
            .cloned()
            .ok_or_else(|| sink_err(format!("no declared fields for entity {}", record.entity)))?;

        let writer = match self.writers.entry(record.entity) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let path = self.dir.join(format!("{}.csv", record.entity));
                let mut writer = csv::Writer::from_path(&path).map_err(sink_err)?;
                writer.write_record(&headers).map_err(sink_err)?;
                entry.insert(writer)
            }
        };

        let row: Vec<String> = headers
            .iter()
            .map(|name| record.get(name).map(csv_cell).unwrap_or_default())
            .collect();
        writer.write_record(&row).map_err(sink_err)
    }
}

/// Flatten a field value into one CSV cell. Lists join with `", "`;
/// structured values fall back to their JSON text.
fn csv_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(", "),
        Value::Object(_) => value.to_string(),
    }
}

impl RecordSink for CsvSink {
    async fn write(&self, record: &EntityRecord) -> Result<(), CrawlError> {
        lock_recovering(&self.inner).write(record)
    }

    async fn flush(&self) -> Result<(), CrawlError> {
        let mut inner = lock_recovering(&self.inner);
        for writer in inner.writers.values_mut() {
            writer.flush().map_err(sink_err)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JSON lines
// ---------------------------------------------------------------------------

/// Per-entity JSON-lines files (`movie.jsonl`, …) under one directory.
#[derive(Clone)]
pub struct JsonlSink {
    inner: Arc<Mutex<JsonlInner>>,
}

struct JsonlInner {
    dir: PathBuf,
    headers: HashMap<EntityKind, Vec<String>>,
    writers: HashMap<EntityKind, BufWriter<File>>,
}

impl JsonlSink {
    pub fn create(dir: &Path, profile: &SiteProfile) -> Result<Self, CrawlError> {
        std::fs::create_dir_all(dir).map_err(sink_err)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(JsonlInner {
                dir: dir.to_path_buf(),
                headers: declared_headers(profile),
                writers: HashMap::new(),
            })),
        })
    }
}

impl JsonlInner {
    fn write(&mut self, record: &EntityRecord) -> Result<(), CrawlError> {
        let headers = self
            .headers
            .get(&record.entity)
            .cloned()
            .ok_or_else(|| sink_err(format!("no declared fields for entity {}", record.entity)))?;

        let writer = match self.writers.entry(record.entity) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let path = self.dir.join(format!("{}.jsonl", record.entity));
                let file = File::create(&path).map_err(sink_err)?;
                entry.insert(BufWriter::new(file))
            }
        };

        let mut object = serde_json::Map::new();
        for name in &headers {
            let value = record.get(name).cloned().unwrap_or(Value::Null);
            object.insert(name.clone(), value);
        }
        let line = serde_json::to_string(&Value::Object(object))?;
        writeln!(writer, "{line}").map_err(sink_err)
    }
}

impl RecordSink for JsonlSink {
    async fn write(&self, record: &EntityRecord) -> Result<(), CrawlError> {
        lock_recovering(&self.inner).write(record)
    }

    async fn flush(&self) -> Result<(), CrawlError> {
        let mut inner = lock_recovering(&self.inner);
        for writer in inner.writers.values_mut() {
            writer.flush().map_err(sink_err)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Format dispatch
// ---------------------------------------------------------------------------

/// Sink chosen at the CLI by `--format`.
#[derive(Clone)]
pub enum AnySink {
    Csv(CsvSink),
    Jsonl(JsonlSink),
}

impl RecordSink for AnySink {
    async fn write(&self, record: &EntityRecord) -> Result<(), CrawlError> {
        match self {
            AnySink::Csv(sink) => sink.write(record).await,
            AnySink::Jsonl(sink) => sink.write(record).await,
        }
    }

    async fn flush(&self) -> Result<(), CrawlError> {
        match self {
            AnySink::Csv(sink) => sink.flush().await,
            AnySink::Jsonl(sink) => sink.flush().await,
        }
    }
}
