//! Routing table parser
//!
//! A routing table lists scale-up links as `src_module src_port dst_module dst_port`,
//! one per line, separated by any whitespace. Lines starting with `#` and
//! blank lines are ignored. Malformed rows are collected next to the parsed
//! edges so that a single bad line never aborts the load.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{ConnectError, Result};

/// Directory holding the connectivity tables shipped with the perf-test package
pub const CONNECTIVITY_DATA_DIR: &str = "/opt/habanalabs/perf-test/scale_up_tool/internal_data";

/// Well-known server topologies with a shipped connectivity table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum RoutingPreset {
    #[serde(rename = "HLS2")]
    #[value(name = "HLS2")]
    Hls2,
    #[serde(rename = "HLS2pcie")]
    #[value(name = "HLS2pcie")]
    Hls2Pcie,
    #[serde(rename = "HLS3")]
    #[value(name = "HLS3")]
    Hls3,
    #[serde(rename = "HLS3pcie")]
    #[value(name = "HLS3pcie")]
    Hls3Pcie,
}

impl RoutingPreset {
    fn file_name(&self) -> &'static str {
        match self {
            RoutingPreset::Hls2 => "connectivity_HLS2.csv",
            RoutingPreset::Hls2Pcie => "connectivity_HLS2PCIE.csv",
            RoutingPreset::Hls3 => "connectivity_HLS3.csv",
            RoutingPreset::Hls3Pcie => "connectivity_HLS3PCIE.csv",
        }
    }

    /// Path of the connectivity table for this topology
    pub fn path(&self) -> PathBuf {
        Path::new(CONNECTIVITY_DATA_DIR).join(self.file_name())
    }
}

/// One declared link between two module ports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoutingEdge {
    pub src_module: u32,
    pub src_port: u32,
    pub dst_module: u32,
    pub dst_port: u32,
}

impl RoutingEdge {
    pub fn new(src_module: u32, src_port: u32, dst_module: u32, dst_port: u32) -> Self {
        Self {
            src_module,
            src_port,
            dst_module,
            dst_port,
        }
    }
}

impl fmt::Display for RoutingEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.src_module, self.src_port, self.dst_module, self.dst_port
        )
    }
}

/// Row-level parse defect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowError {
    /// Always `MALFORMED_ROW`
    pub kind: RowErrorKind,
    /// 1-based line number in the routing source
    pub line: usize,
    pub content: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RowErrorKind {
    MalformedRow,
}

impl fmt::Display for RowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MALFORMED_ROW at line {}: {} ({:?})",
            self.line, self.reason, self.content
        )
    }
}

/// Parsed routing table: edges in source order plus collected row errors
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingTable {
    pub edges: Vec<RoutingEdge>,
    pub errors: Vec<RowError>,
}

impl RoutingTable {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

fn parse_row(line: &str) -> std::result::Result<RoutingEdge, String> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() != 4 {
        return Err(format!("expected 4 fields, found {}", tokens.len()));
    }

    let mut values = [0u32; 4];
    for (slot, token) in values.iter_mut().zip(&tokens) {
        *slot = token
            .parse()
            .map_err(|_| format!("invalid integer {:?}", token))?;
    }

    Ok(RoutingEdge::new(values[0], values[1], values[2], values[3]))
}

/// Parses routing lines, preserving their order.
pub fn parse_lines<I, S>(lines: I) -> RoutingTable
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut table = RoutingTable::default();

    for (idx, raw) in lines.into_iter().enumerate() {
        let line = raw.as_ref().trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        match parse_row(line) {
            Ok(edge) => table.edges.push(edge),
            Err(reason) => {
                warn!(line = idx + 1, content = %line, %reason, "Skipping malformed routing row");
                table.errors.push(RowError {
                    kind: RowErrorKind::MalformedRow,
                    line: idx + 1,
                    content: line.to_string(),
                    reason,
                });
            }
        }
    }

    debug!(
        edges = table.edges.len(),
        errors = table.errors.len(),
        "Parsed routing table"
    );
    table
}

/// Parses a routing table from a reader. Only IO failures are fatal.
pub fn parse_reader<R: BufRead>(reader: R) -> Result<RoutingTable> {
    let lines = reader.lines().collect::<std::io::Result<Vec<_>>>()?;
    Ok(parse_lines(lines))
}

/// Loads a routing table from a file.
pub fn load(path: impl AsRef<Path>) -> Result<RoutingTable> {
    let path = path.as_ref();
    let file = std::fs::File::open(path).map_err(|e| {
        ConnectError::Routing(format!("cannot open {}: {}", path.display(), e))
    })?;
    let table = parse_reader(std::io::BufReader::new(file))?;

    info!(
        path = %path.display(),
        edges = table.edges.len(),
        malformed = table.errors.len(),
        "Loaded routing table"
    );
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_valid_rows() {
        let table = parse_lines("0 7 1 7\n0 6 1 6\n".lines());
        assert_eq!(
            table.edges,
            vec![RoutingEdge::new(0, 7, 1, 7), RoutingEdge::new(0, 6, 1, 6)]
        );
        assert!(table.is_clean());
    }

    #[test]
    fn test_comments_blank_lines_and_tabs() {
        let input = "# src_mod\tsrc_port\tdst_mod\tdst_port\n\n  \n0\t1\t1\t1\n   2  3   4 5\n";
        let table = parse_lines(input.lines());
        assert_eq!(
            table.edges,
            vec![RoutingEdge::new(0, 1, 1, 1), RoutingEdge::new(2, 3, 4, 5)]
        );
        assert!(table.errors.is_empty());
    }

    #[test]
    fn test_malformed_row_collected() {
        let table = parse_lines("0 7 1\n0 6 1 6\n".lines());
        assert_eq!(table.edges, vec![RoutingEdge::new(0, 6, 1, 6)]);
        assert_eq!(table.errors.len(), 1);
        assert_eq!(table.errors[0].kind, RowErrorKind::MalformedRow);
        assert_eq!(table.errors[0].line, 1);
        assert_eq!(table.errors[0].content, "0 7 1");
    }

    #[test]
    fn test_non_integer_and_extra_tokens() {
        let table = parse_lines(["0 x 1 1", "0 1 1 1 9", "-1 0 1 0", "3 3 4 4"]);
        assert_eq!(table.edges, vec![RoutingEdge::new(3, 3, 4, 4)]);
        let lines: Vec<usize> = table.errors.iter().map(|e| e.line).collect();
        assert_eq!(lines, vec![1, 2, 3]);
        assert!(table.errors[0].reason.contains("invalid integer"));
        assert!(table.errors[1].reason.contains("found 5"));
    }

    #[test]
    fn test_duplicates_are_kept() {
        let table = parse_lines(["0 7 1 7", "0 7 1 7"]);
        assert_eq!(table.edges.len(), 2);
    }

    #[test]
    fn test_load_missing_file() {
        let err = load("/nonexistent/connectivity.csv").unwrap_err();
        assert!(matches!(err, ConnectError::Routing(_)));
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("connectivity_HLS2.csv");
        std::fs::write(&path, "# header\n0 1 1 1\nbad row\n").unwrap();
        let table = load(&path).unwrap();
        assert_eq!(table.edges.len(), 1);
        assert_eq!(table.errors.len(), 1);
        assert_eq!(table.errors[0].line, 3);
    }

    #[test]
    fn test_preset_paths() {
        assert_eq!(
            RoutingPreset::Hls2.path(),
            PathBuf::from("/opt/habanalabs/perf-test/scale_up_tool/internal_data/connectivity_HLS2.csv")
        );
        assert!(RoutingPreset::Hls3Pcie
            .path()
            .ends_with("connectivity_HLS3PCIE.csv"));
    }
}
