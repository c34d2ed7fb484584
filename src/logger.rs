use log::{debug, error, info, warn};
use serde::{de::DeserializeOwned, Serialize};
use std::ffi::OsStr;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::ScanError;

/// Give up after this many flushes in a row have failed
const MAX_FLUSH_FAILURES: usize = 10;

/// Buffered JSONL writer for experiment records.
///
/// Records are appended to `<path>.jsonl` every `buffer_size` entries. With
/// `final_format_json` a pretty JSON array is also written to `<path>.json` when the logger
/// is finalized or dropped; the JSONL file is kept. Short-lived write failures are logged and retried on the
/// next flush so a full disk does not abort a running sweep.
#[derive(Debug)]
pub struct Logger<T>
where
    T: Serialize + DeserializeOwned,
{
    buffer: Vec<T>,
    buffer_size: usize,
    file_path: PathBuf,
    final_format_json: bool,
    flush_failures: usize,
    finalized: bool,
}

impl<T> Logger<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new<P: Into<PathBuf>>(file_path: P, buffer_size: usize, final_format_json: bool) -> Self {
        let mut path = file_path.into();
        if path.extension() != Some(OsStr::new("jsonl")) {
            path.set_extension("jsonl");
        }

        Self {
            buffer: Vec::with_capacity(buffer_size.max(1)),
            buffer_size: buffer_size.max(1),
            file_path: path,
            final_format_json,
            flush_failures: 0,
            finalized: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    /// Where `finalize` writes the JSON array, if enabled
    pub fn json_path(&self) -> Option<PathBuf> {
        self.final_format_json
            .then(|| self.file_path.with_extension("json"))
    }

    pub fn add(&mut self, record: T) -> Result<(), ScanError> {
        self.buffer.push(record);
        if self.buffer.len() >= self.buffer_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Append buffered records to the file
    pub fn flush(&mut self) -> Result<(), ScanError> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        match self.append_buffer() {
            Ok(()) => {
                debug!(
                    "Flushed {} records to {}",
                    self.buffer.len(),
                    self.file_path.display()
                );
                self.flush_failures = 0;
                self.buffer.clear();
                Ok(())
            }
            Err(e) => {
                self.flush_failures += 1;
                error!(
                    "Flush failure {}/{} for {}: {e}",
                    self.flush_failures,
                    MAX_FLUSH_FAILURES,
                    self.file_path.display()
                );
                if self.flush_failures >= MAX_FLUSH_FAILURES {
                    return Err(e);
                }
                if self.flush_failures % 3 == 0 {
                    warn!("{} records waiting to be written", self.buffer.len());
                }
                Ok(())
            }
        }
    }

    fn append_buffer(&self) -> Result<(), ScanError> {
        if let Some(parent) = self.file_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)?;
        let mut writer = BufWriter::new(file);
        for record in &self.buffer {
            serde_json::to_writer(&mut writer, record)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Flush, then write the records as a JSON array if requested. Safe to call twice.
    pub fn finalize(&mut self) -> Result<(), ScanError> {
        self.flush()?;
        let json_path = match self.json_path() {
            Some(path) if !self.finalized && self.file_path.exists() => path,
            _ => {
                self.finalized = true;
                return Ok(());
            }
        };

        let content = std::fs::read_to_string(&self.file_path)?;
        let records = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(serde_json::from_str::<T>)
            .collect::<Result<Vec<_>, _>>()?;
        std::fs::write(&json_path, serde_json::to_string_pretty(&records)?)?;
        self.finalized = true;

        info!(
            "Wrote {} records as JSON to {}",
            records.len(),
            json_path.display()
        );
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl<T> Drop for Logger<T>
where
    T: Serialize + DeserializeOwned,
{
    fn drop(&mut self) {
        if let Err(e) = self.finalize() {
            error!("Failed to finalize {}: {e}", self.file_path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        n: u32,
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("qm_scan_logger_{}_{}", std::process::id(), name))
    }

    #[test]
    fn test_live_file_is_always_jsonl() {
        let plain: Logger<Record> = Logger::new(temp_path("ext_a.txt"), 4, false);
        assert_eq!(plain.path().extension(), Some(OsStr::new("jsonl")));
        assert_eq!(plain.json_path(), None);
        let json: Logger<Record> = Logger::new(temp_path("ext_b.jsonl"), 4, true);
        assert_eq!(json.path().extension(), Some(OsStr::new("jsonl")));
        assert_eq!(json.json_path(), Some(temp_path("ext_b.json")));
    }

    #[test]
    fn test_flushes_when_buffer_fills() {
        let mut logger = Logger::new(temp_path("fill"), 2, false);
        let path = logger.path().to_path_buf();
        logger.add(Record { n: 1 }).unwrap();
        assert_eq!(logger.len(), 1);
        assert!(!path.exists());
        logger.add(Record { n: 2 }).unwrap();
        assert!(logger.is_empty());

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "{\"n\":1}\n{\"n\":2}\n");
        drop(logger);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_finalize_as_json_array() {
        let mut logger = Logger::new(temp_path("final"), 10, true);
        let path = logger.path().to_path_buf();
        let json_path = logger.json_path().unwrap();
        for n in 0..3 {
            logger.add(Record { n }).unwrap();
        }
        logger.finalize().unwrap();
        logger.finalize().unwrap();
        drop(logger);

        let records: Vec<Record> =
            serde_json::from_str(&std::fs::read_to_string(&json_path).unwrap()).unwrap();
        assert_eq!(records, vec![Record { n: 0 }, Record { n: 1 }, Record { n: 2 }]);
        let lines = std::fs::read_to_string(&path).unwrap();
        assert_eq!(lines.lines().count(), 3);
        let _ = std::fs::remove_file(path);
        let _ = std::fs::remove_file(json_path);
    }
}
