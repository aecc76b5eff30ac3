//! Durable outcome ledger.
//!
//! The ledger maps scenario ids to terminal statuses and is the only record of
//! what remains to run. Every `record` rewrites the whole file through a
//! temp-file-and-rename so a killed orchestrator leaves either the previous or
//! the next complete ledger on disk, never a torn one.
use crate::outcome::OutcomeStatus;
use crate::util::now_epoch_ms;
use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct OutcomeLedger {
    path: PathBuf,
    // Insertion-ordered (serde_json `preserve_order`).
    entries: Map<String, Value>,
}

impl OutcomeLedger {
    /// Read persisted outcomes. Missing or unreadable files yield an empty ledger.
    ///
    /// A file that exists but does not parse as a JSON object is moved aside to
    /// `<ledger>.corrupt-<epoch_ms>` so the next write cannot destroy it.
    pub fn load(path: &Path) -> Self {
        Self::read(path, true)
    }

    /// Like [`OutcomeLedger::load`] but never touches the file system.
    pub fn inspect(path: &Path) -> Self {
        Self::read(path, false)
    }

    fn read(path: &Path, move_corrupt_aside: bool) -> Self {
        let entries = match fs::read(path) {
            Ok(bytes) => match serde_json::from_slice::<Value>(&bytes) {
                Ok(Value::Object(entries)) => entries,
                Ok(other) => {
                    tracing::warn!(
                        path = %path.display(),
                        kind = json_kind(&other),
                        "outcome ledger is not a JSON object; starting fresh"
                    );
                    if move_corrupt_aside {
                        quarantine(path);
                    }
                    Map::new()
                }
                Err(err) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %err,
                        "could not decode outcome ledger; starting fresh"
                    );
                    if move_corrupt_aside {
                        quarantine(path);
                    }
                    Map::new()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => Map::new(),
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "could not read outcome ledger; starting fresh"
                );
                Map::new()
            }
        };
        for (id, value) in &entries {
            if !value.is_string() {
                tracing::warn!(scenario = %id, "ledger entry is not a string; treating as done");
            }
        }
        Self {
            path: path.to_path_buf(),
            entries,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, scenario_id: &str) -> bool {
        self.entries.contains_key(scenario_id)
    }

    /// Raw status string, including hand-edited values this crate does not know.
    pub fn status(&self, scenario_id: &str) -> Option<&str> {
        self.entries.get(scenario_id).and_then(Value::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in insertion order; non-string values render as their JSON text.
    pub fn entries(&self) -> impl Iterator<Item = (&str, String)> + '_ {
        self.entries.iter().map(|(id, value)| {
            let status = match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            (id.as_str(), status)
        })
    }

    /// Insert the outcome for `scenario_id` and persist the full ledger before returning.
    pub fn record(&mut self, scenario_id: &str, status: OutcomeStatus) -> Result<()> {
        let previous = self.entries.insert(
            scenario_id.to_string(),
            Value::String(status.as_str().to_string()),
        );
        if let Some(previous) = previous {
            tracing::warn!(scenario = %scenario_id, %previous, %status, "overwrote ledger entry");
        }
        self.persist()
            .with_context(|| format!("persist outcome for {scenario_id}"))
    }

    fn persist(&self) -> Result<()> {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).with_context(|| format!("create {}", parent.display()))?;
        let mut text =
            serde_json::to_string_pretty(&self.entries).context("serialize outcome ledger")?;
        text.push('\n');

        let mut tmp = tempfile::NamedTempFile::new_in(&parent)
            .with_context(|| format!("create temp file in {}", parent.display()))?;
        tmp.write_all(text.as_bytes())
            .context("write outcome ledger")?;
        tmp.as_file().sync_all().context("sync outcome ledger")?;
        tmp.persist(&self.path)
            .with_context(|| format!("replace {}", self.path.display()))?;
        sync_dir(&parent);
        Ok(())
    }
}

fn quarantine(path: &Path) {
    let suffix = now_epoch_ms().unwrap_or_default();
    let mut target = path.as_os_str().to_owned();
    target.push(format!(".corrupt-{suffix}"));
    let target = PathBuf::from(target);
    match fs::rename(path, &target) {
        Ok(()) => tracing::warn!(moved_to = %target.display(), "kept corrupt ledger for inspection"),
        Err(err) => tracing::warn!(error = %err, "could not move corrupt ledger aside"),
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(handle) = fs::File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
#[path = "ledger_tests.rs"]
mod tests;
