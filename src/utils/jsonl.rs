// src/utils/jsonl.rs - JSON Lines interchange for already-parsed inputs and output tables
use anyhow::{Context, Result};
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// Reads one record per non-blank line. A malformed line fails the whole read with its line number.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut records = Vec::new();
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read line {} of {}", line_no + 1, path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line)
            .with_context(|| format!("Invalid record on line {} of {}", line_no + 1, path.display()))?;
        records.push(record);
    }
    debug!("Read {} records from {}", records.len(), path.display());
    Ok(records)
}

/// Like [`read_jsonl`], but an absent file is an empty input.
pub fn read_jsonl_if_present<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        warn!("⚠️  {} does not exist; treating it as empty", path.display());
        return Ok(Vec::new());
    }
    read_jsonl(path)
}

pub fn write_jsonl<T: Serialize>(path: &Path, records: &[T]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    for record in records {
        serde_json::to_writer(&mut writer, record)
            .with_context(|| format!("Failed to serialize a record for {}", path.display()))?;
        writer.write_all(b"\n")?;
    }
    writer.flush().with_context(|| format!("Failed to flush {}", path.display()))?;
    debug!("Wrote {} records to {}", records.len(), path.display());
    Ok(())
}
