//! Writing captured records to the local data folder.
//!
//! Raw pages keep the extractor output as-is. The normalized source file has
//! one row per record: the primary key columns, a `content` column holding
//! the remaining fields as JSON, and `timestamp_captura`.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::context::{CaptureContext, PAGE_PLACEHOLDER};
use crate::error::{CaptureError, Result};
use crate::extract::Record;

pub const CONTENT_COLUMN: &str = "content";
pub const CAPTURE_TIMESTAMP_COLUMN: &str = "timestamp_captura";

/// Split records into pages of at most `chunk` records.
///
/// Always yields at least one page so an empty capture still leaves a file.
pub fn paginate(records: &[Record], chunk: Option<usize>) -> Vec<&[Record]> {
    match chunk {
        Some(size) if size > 0 && !records.is_empty() => records.chunks(size).collect(),
        _ => vec![records],
    }
}

/// Write the raw pages and record them on the context.
///
/// Pages left over from an earlier capture of the same timestamp are removed
/// first, so the folder only ever holds the pages of the latest capture.
pub fn save_raw_pages(ctx: &mut CaptureContext, records: &[Record]) -> Result<Vec<PathBuf>> {
    let filetype = ctx.source().raw_filetype().to_string();
    let chunk = ctx.source().file_chunk_size();
    remove_stale_pages(ctx)?;

    let mut written = Vec::new();
    for (page, rows) in paginate(records, chunk).into_iter().enumerate() {
        let path = ctx.raw_filepath_for_page(page);
        ensure_parent(&path)?;
        match filetype.as_str() {
            "csv" => write_flat_csv(&path, rows)?,
            "txt" => write_ndjson(&path, rows)?,
            _ => fs::write(&path, serde_json::to_vec(rows)?)?,
        }
        debug!(path = %path.display(), rows = rows.len(), "raw page written");
        ctx.record_captured(path.clone());
        written.push(path);
    }
    Ok(written)
}

/// Delete local raw pages written for this timestamp by a previous run.
fn remove_stale_pages(ctx: &CaptureContext) -> Result<()> {
    let template = ctx.raw_filepath();
    let (Some(dir), Some(name)) = (template.parent(), template.file_name()) else {
        return Ok(());
    };
    let name = name.to_string_lossy();
    let Some(stem) = name.split(PAGE_PLACEHOLDER).next() else {
        return Ok(());
    };
    if !dir.is_dir() {
        return Ok(());
    }

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() && entry.file_name().to_string_lossy().starts_with(stem) {
            fs::remove_file(entry.path())?;
            debug!(path = %entry.path().display(), "stale raw page removed");
        }
    }
    Ok(())
}

/// Write the normalized source CSV for `records`.
pub fn write_source_file(ctx: &CaptureContext, records: &[Record]) -> Result<PathBuf> {
    let path = ctx.source_filepath().to_path_buf();
    ensure_parent(&path)?;

    let primary_keys = ctx.source().primary_keys();
    let captured_at = smtr_core::format_timestamp(ctx.timestamp());

    let mut writer = csv::Writer::from_path(&path)?;
    let mut header: Vec<&str> = primary_keys.iter().map(String::as_str).collect();
    header.push(CONTENT_COLUMN);
    header.push(CAPTURE_TIMESTAMP_COLUMN);
    writer.write_record(&header)?;

    for (index, record) in records.iter().enumerate() {
        let mut row = Vec::with_capacity(header.len());
        for key in primary_keys {
            let value = record.get(key).ok_or_else(|| CaptureError::MissingPrimaryKey {
                index,
                key: key.clone(),
            })?;
            row.push(cell(value));
        }

        let content: Record = record
            .iter()
            .filter(|(k, _)| !primary_keys.contains(*k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        row.push(serde_json::to_string(&content)?);
        row.push(captured_at.clone());
        writer.write_record(&row)?;
    }
    writer.flush()?;

    debug!(path = %path.display(), rows = records.len(), "source file written");
    Ok(path)
}

/// Render a JSON value as a CSV cell: strings unquoted, null empty.
fn cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Columns are the union of record keys in first-seen order.
fn write_flat_csv(path: &Path, rows: &[Record]) -> Result<()> {
    let mut columns: Vec<&str> = Vec::new();
    for row in rows {
        for key in row.keys() {
            if !columns.contains(&key.as_str()) {
                columns.push(key);
            }
        }
    }

    let mut writer = csv::Writer::from_path(path)?;
    if !columns.is_empty() {
        writer.write_record(&columns)?;
    }
    for row in rows {
        let cells: Vec<String> = columns
            .iter()
            .map(|c| row.get(*c).map(cell).unwrap_or_default())
            .collect();
        writer.write_record(&cells)?;
    }
    writer.flush()?;
    Ok(())
}

fn write_ndjson(path: &Path, rows: &[Record]) -> Result<()> {
    let mut file = fs::File::create(path)?;
    for row in rows {
        serde_json::to_writer(&mut file, row)?;
        file.write_all(b"\n")?;
    }
    Ok(())
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}
