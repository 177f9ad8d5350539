//! Trace loader: newline-delimited JSON (optionally gzip) into records
//!
//! Each line is parsed on its own. A line that is not a JSON object, or an
//! object with none of the recognized record fields, is dropped and counted
//! against its source; the load keeps going. Blank lines are skipped and not
//! counted. Compression is detected from the gzip magic bytes, so file names
//! do not matter.
//!
//! ```rust
//! use bisectar::loader::{load_sources, TraceSource};
//!
//! let source = TraceSource::memory(
//!     "baseline",
//!     b"{\"prompt_id\":\"p0\",\"tensor\":\"logits\",\"hash\":\"aa\"}\nnot json\n".to_vec(),
//! );
//! let traces = load_sources(&[source]).unwrap();
//! assert_eq!(traces.records.len(), 1);
//! assert_eq!(traces.dropped_total(), 1);
//! ```

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Cursor, Read};
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{BisectarError, Result};
use crate::record::{RawRecord, TraceRecord};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Line numbers of at most this many drops are kept per source
pub const MAX_DROPPED_LINES_KEPT: usize = 8;

/// An addressable byte stream of trace lines
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TraceSource {
    /// A file on disk
    File(PathBuf),
    /// An in-memory buffer with a display name
    Memory {
        /// Name used in statistics and errors
        name: String,
        /// Raw (possibly gzip-compressed) content
        bytes: Vec<u8>,
    },
}

impl TraceSource {
    /// A file-backed source
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File(path.into())
    }

    /// An in-memory source
    pub fn memory(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self::Memory {
            name: name.into(),
            bytes,
        }
    }

    /// Display name of the source
    #[must_use]
    pub fn name(&self) -> String {
        match self {
            Self::File(path) => path.display().to_string(),
            Self::Memory { name, .. } => name.clone(),
        }
    }

    /// Open the stream, transparently decompressing gzip content
    pub fn open(&self) -> Result<Box<dyn BufRead + Send + '_>> {
        match self {
            Self::File(path) => {
                let file = File::open(path).map_err(|e| BisectarError::IoError {
                    message: format!("Failed to open trace file {}: {e}", path.display()),
                })?;
                sniff(BufReader::new(file), path)
            },
            Self::Memory { name, bytes } => sniff(Cursor::new(bytes.as_slice()), Path::new(name)),
        }
    }
}

fn sniff<'a, R: BufRead + Send + 'a>(
    mut reader: R,
    path: &Path,
) -> Result<Box<dyn BufRead + Send + 'a>> {
    let head = reader.fill_buf().map_err(|e| BisectarError::IoError {
        message: format!("Failed to read trace stream {}: {e}", path.display()),
    })?;
    if head.starts_with(&GZIP_MAGIC) {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(reader))))
    } else {
        Ok(Box::new(reader))
    }
}

/// Per-source load statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceStats {
    /// Source display name
    pub source: String,
    /// Non-blank lines read
    pub lines: usize,
    /// Records accepted
    pub records: usize,
    /// Lines dropped as malformed
    pub dropped: usize,
    /// 1-based line numbers of the first dropped lines
    pub dropped_lines: Vec<usize>,
}

/// Records loaded from a set of sources
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadedTraces {
    /// All accepted records, in source then line order
    pub records: Vec<TraceRecord>,
    /// Statistics per source, in load order
    pub sources: Vec<SourceStats>,
}

impl LoadedTraces {
    /// Total dropped lines across sources
    #[must_use]
    pub fn dropped_total(&self) -> usize {
        self.sources.iter().map(|s| s.dropped).sum()
    }

    /// Dropped line count per source name
    #[must_use]
    pub fn dropped_by_source(&self) -> BTreeMap<String, usize> {
        self.sources
            .iter()
            .map(|s| (s.source.clone(), s.dropped))
            .collect()
    }

    /// True when no record was accepted
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Parse one line into a record; `None` means the line is dropped
fn parse_line(line: &[u8]) -> Option<TraceRecord> {
    let start = line.iter().position(|b| !b.is_ascii_whitespace())?;
    let trimmed = &line[start..];
    if trimmed[0] != b'{' {
        return None;
    }
    let raw: RawRecord = serde_json::from_slice(trimmed).ok()?;
    if raw.is_empty() {
        return None;
    }
    Some(raw.into())
}

/// Parse every line of a reader
///
/// Only genuine I/O failures are errors; content problems are counted in
/// the returned statistics.
pub fn parse_reader<R: Read>(name: &str, reader: R) -> Result<(Vec<TraceRecord>, SourceStats)> {
    let mut reader = BufReader::new(reader);
    parse_buffered(name, &mut reader)
}

fn parse_buffered(
    name: &str,
    reader: &mut dyn BufRead,
) -> Result<(Vec<TraceRecord>, SourceStats)> {
    let mut stats = SourceStats {
        source: name.to_string(),
        ..Default::default()
    };
    let mut records = Vec::new();
    let mut buf = Vec::new();
    let mut line_no = 0usize;

    loop {
        buf.clear();
        let n = reader
            .read_until(b'\n', &mut buf)
            .map_err(|e| BisectarError::IoError {
                message: format!("Failed to read trace stream {name}: {e}"),
            })?;
        if n == 0 {
            break;
        }
        line_no += 1;
        if buf.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        stats.lines += 1;
        match parse_line(&buf) {
            Some(record) => {
                records.push(record);
                stats.records += 1;
            },
            None => {
                stats.dropped += 1;
                if stats.dropped_lines.len() < MAX_DROPPED_LINES_KEPT {
                    stats.dropped_lines.push(line_no);
                }
            },
        }
    }

    if stats.dropped > 0 {
        warn!(
            source = name,
            dropped = stats.dropped,
            lines = stats.lines,
            "dropped malformed trace lines"
        );
    }
    debug!(source = name, records = stats.records, "loaded trace source");
    Ok((records, stats))
}

/// Load a single source
pub fn load_source(source: &TraceSource) -> Result<(Vec<TraceRecord>, SourceStats)> {
    let name = source.name();
    let mut reader = source.open()?;
    parse_buffered(&name, reader.as_mut())
}

/// Load several sources into one collection, preserving source order
pub fn load_sources(sources: &[TraceSource]) -> Result<LoadedTraces> {
    let mut loaded = LoadedTraces::default();
    for source in sources {
        let (records, stats) = load_source(source)?;
        loaded.records.extend(records);
        loaded.sources.push(stats);
    }
    Ok(loaded)
}
