//! Trust-on-first-use store: a persistent map from `host:port` to the
//! certificate fingerprint seen there, with first/last-seen timestamps.
//! All operations serialize on an internal mutex; the JSON database is
//! rewritten after each mutation.

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use toml::{Table, Value};

use crate::error::TofuError;
use crate::gemini::cert;
use crate::time;

pub const EXPORT_VERSION: &str = "1.0";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TofuEntry {
    pub hostname: String,
    pub port: u16,
    pub fingerprint: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TofuVerdict {
    /// No record for this host yet. Not inserted; call `trust` to pin it.
    FirstUse,
    Match,
    Changed {
        old_fingerprint: String,
        new_fingerprint: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportMode {
    Merge,
    Replace,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ImportStats {
    pub imported: usize,
    pub skipped: usize,
}

pub struct TofuStore {
    path: Option<PathBuf>,
    inner: Mutex<HashMap<String, TofuEntry>>,
}

fn host_key(host: &str, port: u16) -> String {
    format!("{}:{}", host, port)
}

impl TofuStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<TofuStore, TofuError> {
        let path = path.into();
        let entries = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            serde_json::from_str(&raw)
                .map_err(|e| TofuError::Corrupt(format!("{:?}: {}", path, e)))?
        } else {
            HashMap::new()
        };
        Ok(TofuStore {
            path: Some(path),
            inner: Mutex::new(entries),
        })
    }

    /// A store that never touches disk.
    pub fn in_memory() -> TofuStore {
        TofuStore {
            path: None,
            inner: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TofuEntry>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check a presented certificate against the pinned fingerprint.
    /// A match refreshes `last_seen`; a mismatch changes nothing.
    pub fn verify(&self, host: &str, port: u16, der: &[u8]) -> Result<TofuVerdict, TofuError> {
        let presented = cert::fingerprint(der);
        let mut entries = self.lock();
        match entries.get_mut(&host_key(host, port)) {
            None => Ok(TofuVerdict::FirstUse),
            Some(entry) if entry.fingerprint == presented => {
                entry.last_seen = Utc::now();
                self.persist(&entries)?;
                Ok(TofuVerdict::Match)
            }
            Some(entry) => Ok(TofuVerdict::Changed {
                old_fingerprint: entry.fingerprint.clone(),
                new_fingerprint: presented,
            }),
        }
    }

    /// Pin a certificate, replacing any previous one. `first_seen` is
    /// preserved across replacements.
    pub fn trust(&self, host: &str, port: u16, der: &[u8]) -> Result<(), TofuError> {
        let now = Utc::now();
        let presented = cert::fingerprint(der);
        let mut entries = self.lock();
        entries
            .entry(host_key(host, port))
            .and_modify(|entry| {
                entry.fingerprint = presented.clone();
                entry.last_seen = now;
            })
            .or_insert_with(|| TofuEntry {
                hostname: host.to_string(),
                port,
                fingerprint: presented,
                first_seen: now,
                last_seen: now,
            });
        self.persist(&entries)
    }

    /// Drop the pin for a host. Returns whether a record existed.
    pub fn revoke(&self, host: &str, port: u16) -> Result<bool, TofuError> {
        let mut entries = self.lock();
        let removed = entries.remove(&host_key(host, port)).is_some();
        if removed {
            self.persist(&entries)?;
        }
        Ok(removed)
    }

    pub fn get(&self, host: &str, port: u16) -> Option<TofuEntry> {
        self.lock().get(&host_key(host, port)).cloned()
    }

    /// All entries, ordered by host then port for stable output.
    pub fn list(&self) -> Vec<TofuEntry> {
        let mut entries: Vec<TofuEntry> = self.lock().values().cloned().collect();
        entries.sort_by(|a, b| (&a.hostname, a.port).cmp(&(&b.hostname, b.port)));
        entries
    }

    /// Write the whole store as a TOML document with a `[_metadata]`
    /// table and one table per `host:port` key.
    pub fn export<W: Write>(&self, writer: &mut W) -> Result<(), TofuError> {
        let mut root = Table::new();
        let mut metadata = Table::new();
        metadata.insert(
            "exported_at".to_string(),
            Value::String(time::now_rfc3339()),
        );
        metadata.insert("version".to_string(), Value::String(EXPORT_VERSION.into()));
        root.insert("_metadata".to_string(), Value::Table(metadata));

        for entry in self.list() {
            let mut table = Table::new();
            table.insert("hostname".to_string(), Value::String(entry.hostname.clone()));
            table.insert("port".to_string(), Value::Integer(entry.port.into()));
            table.insert(
                "fingerprint".to_string(),
                Value::String(entry.fingerprint.clone()),
            );
            table.insert(
                "first_seen".to_string(),
                Value::String(time::format_rfc3339(entry.first_seen)),
            );
            table.insert(
                "last_seen".to_string(),
                Value::String(time::format_rfc3339(entry.last_seen)),
            );
            root.insert(host_key(&entry.hostname, entry.port), Value::Table(table));
        }

        let document = toml::to_string_pretty(&root)
            .map_err(|e| TofuError::Corrupt(format!("export serialization: {}", e)))?;
        writer.write_all(document.as_bytes())?;
        Ok(())
    }

    /// Read a document produced by `export`. In merge mode an existing
    /// entry with a different fingerprint is kept or replaced according
    /// to `on_conflict(existing, incoming) -> take_incoming`.
    pub fn import<R: Read>(
        &self,
        reader: &mut R,
        mode: ImportMode,
        on_conflict: &mut dyn FnMut(&TofuEntry, &TofuEntry) -> bool,
    ) -> Result<ImportStats, TofuError> {
        let mut raw = String::new();
        reader.read_to_string(&mut raw)?;
        let document: Table = raw
            .parse()
            .map_err(|e| TofuError::BadImport(format!("{}", e)))?;

        if let Some(metadata) = document.get("_metadata").and_then(Value::as_table) {
            if let Some(version) = metadata.get("version").and_then(Value::as_str) {
                if !version.starts_with("1.") {
                    return Err(TofuError::BadImport(format!(
                        "unsupported export version {}",
                        version
                    )));
                }
            }
        }

        let mut incoming = Vec::new();
        for (key, value) in &document {
            if key == "_metadata" {
                continue;
            }
            let table = value
                .as_table()
                .ok_or_else(|| TofuError::BadImport(format!("{} is not a table", key)))?;
            incoming.push(entry_from_table(key, table)?);
        }

        let mut stats = ImportStats::default();
        let mut entries = self.lock();
        if mode == ImportMode::Replace {
            entries.clear();
        }
        for entry in incoming {
            let key = host_key(&entry.hostname, entry.port);
            match entries.get(&key) {
                Some(existing) if existing.fingerprint == entry.fingerprint => {
                    stats.skipped += 1;
                }
                Some(existing) => {
                    if on_conflict(existing, &entry) {
                        entries.insert(key, entry);
                        stats.imported += 1;
                    } else {
                        stats.skipped += 1;
                    }
                }
                None => {
                    entries.insert(key, entry);
                    stats.imported += 1;
                }
            }
        }
        self.persist(&entries)?;
        Ok(stats)
    }

    fn persist(&self, entries: &HashMap<String, TofuEntry>) -> Result<(), TofuError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(entries)
            .map_err(|e| TofuError::Corrupt(format!("serialization: {}", e)))?;
        fs::write(path, raw)?;
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

fn entry_from_table(key: &str, table: &Table) -> Result<TofuEntry, TofuError> {
    let (key_host, key_port) = key
        .rsplit_once(':')
        .ok_or_else(|| TofuError::BadImport(format!("bad key {:?}", key)))?;
    let hostname = table
        .get("hostname")
        .and_then(Value::as_str)
        .unwrap_or(key_host)
        .to_string();
    let port: u16 = match table.get("port").and_then(Value::as_integer) {
        Some(p) => u16::try_from(p).map_err(|_| TofuError::BadImport(format!("bad port {}", p)))?,
        None => key_port
            .parse()
            .map_err(|_| TofuError::BadImport(format!("bad key {:?}", key)))?,
    };
    let fingerprint = table
        .get("fingerprint")
        .and_then(Value::as_str)
        .ok_or_else(|| TofuError::BadImport(format!("{} is missing a fingerprint", key)))?
        .to_string();
    let first_seen = parse_time(table, "first_seen", key)?;
    let last_seen = parse_time(table, "last_seen", key)?;
    Ok(TofuEntry {
        hostname,
        port,
        fingerprint,
        first_seen,
        last_seen,
    })
}

fn parse_time(table: &Table, field: &str, key: &str) -> Result<DateTime<Utc>, TofuError> {
    let raw = table
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| TofuError::BadImport(format!("{} is missing {}", key, field)))?;
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| TofuError::BadImport(format!("{} has a bad {}: {}", key, field, e)))
}
