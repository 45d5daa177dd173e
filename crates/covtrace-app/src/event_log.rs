//! The append-only event log (`coverage_by_group.csv`) and its reader.

use crate::csv_escape;
use covtrace_types::{
    event_log_columns, CoverageKind, CoverageTotals, EventRecord, MetricTotals, ELAPSED_COLUMN,
    TIMESTAMP_COLUMN,
};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum EventLogError {
    #[error("event log I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("event log has no header row")]
    MissingHeader,

    #[error("event log is missing required column {0:?}")]
    MissingColumn(String),

    #[error("event log line {line}: expected {expected} fields, found {found}")]
    FieldCount {
        line: usize,
        expected: usize,
        found: usize,
    },

    #[error("event log line {line}: cannot parse {column} value {value:?}")]
    BadCell {
        line: usize,
        column: String,
        value: String,
    },
}

/// One CSV row in event-log column order, without the line terminator.
pub fn render_event_row(record: &EventRecord) -> String {
    let mut row = String::with_capacity(160);
    row.push_str(&csv_escape(&record.timestamp_iso));
    row.push_str(&format!(",{:.6}", record.elapsed_sec));
    for kind in CoverageKind::ALL {
        let m = record.totals.get(kind);
        row.push_str(&format!(",{},{},{:.2}", m.covered, m.total, m.percent));
    }
    row
}

/// Writes the header on creation and the baseline row before the first
/// real record. Every row is flushed and synced before `append` returns.
#[derive(Debug)]
pub struct EventLogWriter {
    path: PathBuf,
    out: BufWriter<File>,
    t0_iso: String,
    rows: usize,
}

impl EventLogWriter {
    /// Create (truncating) the log at `path`. `t0_iso` stamps the baseline row.
    pub fn create(path: &Path, t0_iso: impl Into<String>) -> Result<Self, EventLogError> {
        let io = |source| EventLogError::Io {
            path: path.to_path_buf(),
            source,
        };
        let file = File::create(path).map_err(io)?;
        let mut w = Self {
            path: path.to_path_buf(),
            out: BufWriter::new(file),
            t0_iso: t0_iso.into(),
            rows: 0,
        };
        let header = event_log_columns().join(",");
        w.write_line(&header)?;
        Ok(w)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Data rows written so far, baseline included.
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn append(&mut self, record: &EventRecord) -> Result<(), EventLogError> {
        if self.rows == 0 {
            let baseline = EventRecord {
                timestamp_iso: self.t0_iso.clone(),
                elapsed_sec: 0.0,
                totals: record.totals.baseline(),
            };
            self.write_line(&render_event_row(&baseline))?;
            self.rows += 1;
        }
        self.write_line(&render_event_row(record))?;
        self.rows += 1;
        Ok(())
    }

    fn write_line(&mut self, line: &str) -> Result<(), EventLogError> {
        let io = |source| EventLogError::Io {
            path: self.path.clone(),
            source,
        };
        writeln!(self.out, "{line}").map_err(io)?;
        self.out.flush().map_err(io)?;
        self.out.get_ref().sync_data().map_err(io)
    }
}

/// Split one CSV line, honouring double-quoted fields.
fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut cur = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    cur.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            }
            '"' if cur.is_empty() => in_quotes = true,
            ',' if !in_quotes => fields.push(std::mem::take(&mut cur)),
            _ => cur.push(c),
        }
    }
    fields.push(cur);
    fields
}

/// Parse an event log. Columns are located by name, so extra columns and a
/// different order are tolerated; `timestamp_iso` is optional.
///
/// A log with only a header yields no records.
pub fn parse_event_log(text: &str) -> Result<Vec<EventRecord>, EventLogError> {
    let mut lines = text
        .lines()
        .enumerate()
        .map(|(i, l)| (i + 1, l.trim_end_matches('\r')))
        .filter(|(_, l)| !l.trim().is_empty());

    let (_, header) = lines.next().ok_or(EventLogError::MissingHeader)?;
    let header: Vec<String> = split_csv_line(header)
        .into_iter()
        .map(|h| h.trim().to_string())
        .collect();
    let col = |name: &str| {
        header
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| EventLogError::MissingColumn(name.to_string()))
    };

    let ts_col = header.iter().position(|h| h == TIMESTAMP_COLUMN);
    let elapsed_col = col(ELAPSED_COLUMN)?;
    let mut metric_cols = Vec::with_capacity(CoverageKind::ALL.len());
    for kind in CoverageKind::ALL {
        metric_cols.push((
            kind,
            col(&kind.covered_column())?,
            col(&kind.total_column())?,
            col(&kind.percent_column())?,
        ));
    }

    let mut records = Vec::new();
    for (line, raw) in lines {
        let fields = split_csv_line(raw);
        if fields.len() != header.len() {
            return Err(EventLogError::FieldCount {
                line,
                expected: header.len(),
                found: fields.len(),
            });
        }

        let elapsed_sec: f64 = parse_cell(&fields, elapsed_col, &header, line)?;
        let mut totals = CoverageTotals::zero();
        for &(kind, c, t, p) in &metric_cols {
            *totals.get_mut(kind) = MetricTotals {
                covered: parse_cell(&fields, c, &header, line)?,
                total: parse_cell(&fields, t, &header, line)?,
                percent: parse_cell(&fields, p, &header, line)?,
            };
        }

        records.push(EventRecord {
            timestamp_iso: ts_col.map(|i| fields[i].clone()).unwrap_or_default(),
            elapsed_sec,
            totals,
        });
    }
    Ok(records)
}

fn parse_cell<T: std::str::FromStr>(
    fields: &[String],
    idx: usize,
    header: &[String],
    line: usize,
) -> Result<T, EventLogError> {
    let value = fields[idx].trim();
    value.parse().map_err(|_| EventLogError::BadCell {
        line,
        column: header[idx].clone(),
        value: value.to_string(),
    })
}

pub fn read_event_log(path: &Path) -> Result<Vec<EventRecord>, EventLogError> {
    let text = std::fs::read_to_string(path).map_err(|source| EventLogError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_event_log(&text)
}
