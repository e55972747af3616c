//! Calibration dataset: (prompt, target) pairs streamed from JSONL
//!
//! One JSON object per line:
//!
//! ```json
//! {"prompt": "Q: 2+2?\nA:", "answer": " 4"}
//! ```
//!
//! `completion` is used when `answer` is absent or empty. Blank lines are
//! ignored; lines that are not UTF-8, invalid JSON, non-objects, and items with
//! an empty prompt or target are skipped and counted. Only I/O failures are
//! errors.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use serde_json::Value;

/// One labeled calibration example
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalibrationItem {
    pub prompt: String,
    /// Continuation the model is teacher-forced through
    pub target: String,
}

impl CalibrationItem {
    /// Parse one dataset line; `None` for anything unusable
    pub fn parse_line(line: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(line).ok()?;
        let prompt = str_field(&value, "prompt");
        let target = match str_field(&value, "answer") {
            "" => str_field(&value, "completion"),
            answer => answer,
        };
        if prompt.is_empty() || target.is_empty() {
            return None;
        }
        Some(Self {
            prompt: prompt.to_string(),
            target: target.to_string(),
        })
    }
}

fn str_field<'a>(value: &'a Value, name: &str) -> &'a str {
    value.get(name).and_then(Value::as_str).unwrap_or("")
}

/// Streaming reader over a JSONL dataset
pub struct DatasetReader<R: BufRead> {
    reader: R,
    buf: Vec<u8>,
    skipped: usize,
}

impl DatasetReader<BufReader<File>> {
    /// Open a dataset file; an unreadable path is an error
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open dataset {}", path.display()))?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: BufRead> DatasetReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            skipped: 0,
        }
    }

    /// Malformed or empty items skipped so far
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

impl<R: BufRead> Iterator for DatasetReader<R> {
    type Item = Result<CalibrationItem>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buf.clear();
            match self.reader.read_until(b'\n', &mut self.buf) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(e) => return Some(Err(anyhow::Error::new(e).context("Failed to read dataset"))),
            }
            let Ok(line) = std::str::from_utf8(&self.buf) else {
                self.skipped += 1;
                continue;
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match CalibrationItem::parse_line(line) {
                Some(item) => return Some(Ok(item)),
                None => self.skipped += 1,
            }
        }
    }
}
