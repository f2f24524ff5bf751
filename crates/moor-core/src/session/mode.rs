//! Statement execution modes and their row-emission policies.
//!
//! A statement selects its mode with the `type` local option:
//!
//! | `type`              | mode           | emits                                   |
//! |---------------------|----------------|-----------------------------------------|
//! | (absent), `batch`   | `Batch`        | all output as one TEXT fragment         |
//! | `single`            | `Snapshot`     | the latest row only, as TEXT            |
//! | `update`, `retract` | `Changelog`    | materialized TABLE after retractions    |
//! | `ts`                | `TimeBucketed` | TABLE of the most recent `window` buckets |
//!
//! `type` may be omitted: statements then run as plain batch commands.
//! A `parallelism` option, when present, must be a positive integer and is
//! handed to the statement's process as `MOOR_PARALLELISM`.
//!
//! Changelog rows are `+\t<row>` (insert, the `+\t` prefix is optional) or
//! `-\t<row>` (retract the oldest equal row). Time-bucketed rows start with
//! the bucket key followed by a tab. In both table modes the first line is
//! the header.

use std::collections::VecDeque;

use super::statement::{LocalOptions, ResultFragment};

/// Local option selecting the mode.
pub const MODE_OPTION: &str = "type";
/// Local option for the number of buckets kept by `TimeBucketed`.
pub const WINDOW_OPTION: &str = "window";
/// Local option for the statement's degree of parallelism.
pub const PARALLELISM_OPTION: &str = "parallelism";

const DEFAULT_WINDOW: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineMode {
    Batch,
    Snapshot,
    Changelog,
    TimeBucketed { window: usize },
}

impl EngineMode {
    /// Resolve the mode from a statement's local options. The error is the
    /// message reported back as the statement's error payload.
    pub fn from_options(options: &LocalOptions) -> Result<Self, String> {
        let Some(kind) = options.get(MODE_OPTION) else {
            return Ok(Self::Batch);
        };
        match kind.to_ascii_lowercase().as_str() {
            "batch" => Ok(Self::Batch),
            "single" => Ok(Self::Snapshot),
            "update" | "retract" => Ok(Self::Changelog),
            "ts" => {
                let window = match options.get(WINDOW_OPTION) {
                    Some(raw) => raw
                        .trim()
                        .parse::<usize>()
                        .ok()
                        .filter(|w| *w > 0)
                        .ok_or_else(|| format!("Invalid window: {raw}"))?,
                    None => DEFAULT_WINDOW,
                };
                Ok(Self::TimeBucketed { window })
            }
            _ => Err(format!("Unrecognized stream type: {kind}")),
        }
    }

    /// Turn raw engine output into result fragments.
    pub fn emit(&self, output: &str) -> Vec<ResultFragment> {
        match self {
            Self::Batch => {
                if output.trim().is_empty() {
                    Vec::new()
                } else {
                    vec![ResultFragment::text(output)]
                }
            }
            Self::Snapshot => output
                .lines()
                .rev()
                .find(|line| !line.trim().is_empty())
                .map(|line| vec![ResultFragment::text(line)])
                .unwrap_or_default(),
            Self::Changelog => table_fragment(materialize_changelog(output)),
            Self::TimeBucketed { window } => table_fragment(latest_buckets(output, *window)),
        }
    }
}

/// The statement's requested parallelism, if any.
pub fn parallelism(options: &LocalOptions) -> Result<Option<u32>, String> {
    let Some(raw) = options.get(PARALLELISM_OPTION) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<u32>()
        .ok()
        .filter(|p| *p > 0)
        .map(Some)
        .ok_or_else(|| format!("Invalid parallelism: {raw}"))
}

fn table_fragment(rows: Option<(String, Vec<String>)>) -> Vec<ResultFragment> {
    let Some((header, rows)) = rows else {
        return Vec::new();
    };
    let mut data = header;
    data.push('\n');
    for row in rows {
        data.push_str(&row);
        data.push('\n');
    }
    vec![ResultFragment::table(data)]
}

fn split_header(output: &str) -> Option<(String, impl Iterator<Item = &str>)> {
    let mut lines = output.lines().filter(|line| !line.trim().is_empty());
    let header = lines.next()?.to_string();
    Some((header, lines))
}

fn materialize_changelog(output: &str) -> Option<(String, Vec<String>)> {
    let (header, changes) = split_header(output)?;
    let mut rows: Vec<String> = Vec::new();
    for line in changes {
        if let Some(row) = line.strip_prefix("-\t") {
            if let Some(pos) = rows.iter().position(|r| r == row) {
                rows.remove(pos);
            }
        } else {
            let row = line.strip_prefix("+\t").unwrap_or(line);
            rows.push(row.to_string());
        }
    }
    Some((header, rows))
}

fn latest_buckets(output: &str, window: usize) -> Option<(String, Vec<String>)> {
    let (header, lines) = split_header(output)?;
    let mut buckets: VecDeque<(String, Vec<String>)> = VecDeque::new();
    for line in lines {
        let key = line.split('\t').next().unwrap_or(line);
        match buckets.iter_mut().find(|(k, _)| k == key) {
            Some((_, rows)) => rows.push(line.to_string()),
            None => {
                buckets.push_back((key.to_string(), vec![line.to_string()]));
                if buckets.len() > window {
                    buckets.pop_front();
                }
            }
        }
    }
    Some((header, buckets.into_iter().flat_map(|(_, rows)| rows).collect()))
}
