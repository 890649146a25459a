//! JSONL entries and the per-instance file writer.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One line of a JSONL log file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonLogEntry {
    /// RFC 3339 timestamp with milliseconds
    pub ts: String,
    /// trace, debug, info, warn, error
    pub level: String,
    /// Instance name
    pub instance: String,
    /// Module path
    pub target: String,
    /// Message
    pub msg: String,
    /// Structured fields
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Value>,
    /// Span path, outermost first
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span: Option<String>,
}

impl JsonLogEntry {
    /// New entry stamped now
    pub fn new(
        level: impl Into<String>,
        instance: impl Into<String>,
        target: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self {
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            level: level.into(),
            instance: instance.into(),
            target: target.into(),
            msg: msg.into(),
            fields: None,
            span: None,
        }
    }

    /// Attach structured fields
    pub fn with_fields(mut self, fields: Value) -> Self {
        self.fields = Some(fields);
        self
    }

    /// Attach the span path
    pub fn with_span(mut self, span: impl Into<String>) -> Self {
        self.span = Some(span.into());
        self
    }
}

/// Appends entries to `<logs_dir>/raw/<date>_<instance>.jsonl`.
pub struct InstanceLogWriter {
    instance: String,
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl InstanceLogWriter {
    /// Open (or create) today's file for `instance`.
    pub fn new(logs_dir: impl AsRef<Path>, instance: impl Into<String>) -> std::io::Result<Self> {
        let instance = instance.into();
        let raw_dir = logs_dir.as_ref().join("raw");
        fs::create_dir_all(&raw_dir)?;

        let date = chrono::Local::now().format("%Y-%m-%d");
        let path = raw_dir.join(format!("{}_{}.jsonl", date, instance));

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            instance,
            writer: Mutex::new(BufWriter::new(file)),
            path,
        })
    }

    /// Instance name
    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// File being written
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry as a single line.
    pub fn write(&self, entry: &JsonLogEntry) -> std::io::Result<()> {
        let json = serde_json::to_string(entry)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let mut writer = self.writer.lock();
        writeln!(writer, "{}", json)?;
        writer.flush()
    }
}

impl Drop for InstanceLogWriter {
    fn drop(&mut self) {
        let _ = self.writer.lock().flush();
    }
}

/// Read every entry under `<logs_dir>/raw`, sorted by timestamp.
///
/// Lines that fail to parse are skipped.
pub fn read_entries(logs_dir: impl AsRef<Path>) -> std::io::Result<Vec<JsonLogEntry>> {
    let raw_dir = logs_dir.as_ref().join("raw");
    if !raw_dir.exists() {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    for file in fs::read_dir(&raw_dir)? {
        let path = file?.path();
        if path.extension().is_some_and(|ext| ext == "jsonl") {
            let content = fs::read_to_string(&path)?;
            entries.extend(
                content
                    .lines()
                    .filter_map(|line| serde_json::from_str::<JsonLogEntry>(line).ok()),
            );
        }
    }
    entries.sort_by(|a, b| a.ts.cmp(&b.ts));
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_and_read_back() {
        let temp = TempDir::new().unwrap();
        let writer = InstanceLogWriter::new(temp.path(), "laptop").unwrap();
        assert!(writer.path().to_string_lossy().ends_with("_laptop.jsonl"));

        writer
            .write(&JsonLogEntry::new("info", "laptop", "masq_core", "first"))
            .unwrap();
        writer
            .write(
                &JsonLogEntry::new("warn", "laptop", "masq_core", "second")
                    .with_fields(serde_json::json!({"channel": "abc"})),
            )
            .unwrap();

        let entries = read_entries(temp.path()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].fields.as_ref().unwrap()["channel"], "abc");
    }

    #[test]
    fn test_missing_dir_is_empty() {
        let temp = TempDir::new().unwrap();
        assert!(read_entries(temp.path().join("nope")).unwrap().is_empty());
    }
}
