//! Append-only list of uploaded archives.
//!
//! One CSV line per archive: `description,remote id`. Fields containing a
//! comma, a quote or a line break are quoted, with quotes doubled.

use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::source::timestamp_from_description;
use crate::backup::upload::RemoteId;
use chrono::{DateTime, Utc};
use getset::Getters;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, PartialEq, Eq, Getters)]
#[getset(get = "pub")]
pub struct ArchiveRecord {
    description: String,
    remote_id: RemoteId,
    /// Parsed from the description, `None` if it has no timestamp prefix
    timestamp: Option<DateTime<Utc>>,
}

impl ArchiveRecord {
    pub fn new<D: Into<String>>(description: D, remote_id: RemoteId) -> Self {
        let description = description.into();
        let timestamp = timestamp_from_description(&description);
        Self {
            description,
            remote_id,
            timestamp,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ArchiveLog {
    path: PathBuf,
}

impl ArchiveLog {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one line and syncs it to disk before returning.
    pub fn append(&self, description: &str, remote_id: &RemoteId) -> Result<ArchiveRecord> {
        let line = format!(
            "{},{}\n",
            quote_field(description),
            quote_field(remote_id.as_str())
        );
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(Error::RecordWrite)?;
        file.write_all(line.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(Error::RecordWrite)?;
        tracing::info!("Recorded {:?} as {} in {:?}", description, remote_id, self.path);
        Ok(ArchiveRecord::new(description, remote_id.clone()))
    }

    /// All records in file order. A missing file has no records.
    pub fn records(&self) -> Result<Vec<ArchiveRecord>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(parse_rows(&content)
            .into_iter()
            .enumerate()
            .filter_map(|(i, row)| match <[String; 2]>::try_from(row) {
                Ok([description, remote_id]) => {
                    Some(ArchiveRecord::new(description, remote_id.into()))
                }
                Err(row) => {
                    tracing::warn!(
                        "Skipping row {} of {:?}: expected 2 fields, got {}",
                        i + 1,
                        self.path,
                        row.len()
                    );
                    None
                }
            })
            .collect())
    }
}

fn quote_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Splits CSV text into rows of fields. Blank lines are skipped.
fn parse_rows(content: &str) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let mut row = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = content.chars().peekable();

    while let Some(c) = chars.next() {
        match (in_quotes, c) {
            (true, '"') if chars.peek() == Some(&'"') => {
                chars.next();
                field.push('"');
            }
            (true, '"') => in_quotes = false,
            (true, c) => field.push(c),
            (false, '"') if field.is_empty() => in_quotes = true,
            (false, ',') => row.push(std::mem::take(&mut field)),
            (false, '\r') if chars.peek() == Some(&'\n') => {}
            (false, '\n') => {
                row.push(std::mem::take(&mut field));
                if !(row.len() == 1 && row[0].is_empty()) {
                    rows.push(std::mem::take(&mut row));
                }
                row.clear();
            }
            (false, c) => field.push(c),
        }
    }
    if !field.is_empty() || !row.is_empty() {
        row.push(field);
        rows.push(row);
    }
    rows
}
