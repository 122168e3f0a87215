//! Result aggregation and reporting

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Write as _;
use std::path::Path;
use tracing::info;

use crate::error::Result;
use crate::orchestrator::{ProbeMode, ProbeOutcome, ProbeStatus};
use crate::routing::RowError;

/// Outcome counts of one run.
///
/// `succeeded + failed + skipped + errored == total`. Timeouts are failures;
/// `timed_out` breaks them out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errored: usize,
    pub timed_out: usize,
}

impl Summary {
    /// Percentage of non-skipped outcomes that succeeded
    pub fn success_rate(&self) -> f64 {
        let tested = self.total - self.skipped;
        if tested == 0 {
            return 0.0;
        }
        self.succeeded as f64 * 100.0 / tested as f64
    }

    /// True when nothing failed or errored
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.errored == 0
    }
}

pub fn summarize(outcomes: &[ProbeOutcome]) -> Summary {
    outcomes.iter().fold(
        Summary {
            total: outcomes.len(),
            ..Summary::default()
        },
        |mut summary, outcome| {
            match outcome.status {
                ProbeStatus::Success => summary.succeeded += 1,
                ProbeStatus::Failure => summary.failed += 1,
                ProbeStatus::Timeout => {
                    summary.failed += 1;
                    summary.timed_out += 1;
                }
                ProbeStatus::Skipped => summary.skipped += 1,
                ProbeStatus::Error => summary.errored += 1,
            }
            summary
        },
    )
}

/// Complete result of one run
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub generated_at: DateTime<Utc>,
    pub mode: ProbeMode,
    pub summary: Summary,
    pub outcomes: Vec<ProbeOutcome>,
    pub parse_errors: Vec<RowError>,
}

impl Report {
    pub fn new(mode: ProbeMode, outcomes: Vec<ProbeOutcome>, parse_errors: Vec<RowError>) -> Self {
        Self {
            generated_at: Utc::now(),
            mode,
            summary: summarize(&outcomes),
            outcomes,
            parse_errors,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let mode = match self.mode {
            ProbeMode::VerifyOnly => "port verification",
            ProbeMode::Performance => "performance",
        };
        let _ = writeln!(
            out,
            "Connectivity report ({}) generated {}",
            mode,
            self.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
        );

        if !self.parse_errors.is_empty() {
            let _ = writeln!(out, "\nRouting table errors:");
            for err in &self.parse_errors {
                let _ = writeln!(out, "  {}", err);
            }
        }

        let _ = writeln!(out, "\nConnections:");
        for (idx, outcome) in self.outcomes.iter().enumerate() {
            let _ = write!(
                out,
                "  [{:>3}] {:<8} {}",
                idx + 1,
                outcome.status,
                outcome.connection
            );
            if let Some(metrics) = &outcome.metrics {
                let values: Vec<String> = metrics.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
                let _ = write!(out, " [{}]", values.join(" "));
            }
            let _ = writeln!(out);
            if let Some(detail) = &outcome.detail {
                for line in detail.lines() {
                    let _ = writeln!(out, "         {}", line);
                }
            }
        }

        let s = &self.summary;
        let _ = writeln!(out, "\nSummary:");
        let _ = writeln!(out, "  total:     {}", s.total);
        let _ = writeln!(out, "  succeeded: {}", s.succeeded);
        let _ = writeln!(out, "  failed:    {} ({} timed out)", s.failed, s.timed_out);
        let _ = writeln!(out, "  skipped:   {}", s.skipped);
        let _ = writeln!(out, "  errored:   {}", s.errored);
        let _ = writeln!(out, "  success rate: {:.1}%", s.success_rate());
        out
    }

    /// Writes the report to `path`, as JSON or text.
    pub fn write_to(&self, path: impl AsRef<Path>, json: bool) -> Result<()> {
        let path = path.as_ref();
        let content = if json { self.to_json()? } else { self.render_text() };
        std::fs::write(path, content)?;
        info!(path = %path.display(), "Wrote report");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::build;
    use crate::inventory::Inventory;
    use crate::routing::{parse_lines, RoutingEdge};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn outcomes(statuses: &[ProbeStatus]) -> Vec<ProbeOutcome> {
        let edges: Vec<RoutingEdge> = (0..statuses.len() as u32)
            .map(|i| RoutingEdge::new(i, 1, i + 1, 1))
            .collect();
        build(&edges, &Inventory::default())
            .into_iter()
            .zip(statuses)
            .map(|(conn, &status)| ProbeOutcome {
                connection: Arc::new(conn),
                status,
                detail: Some("line one\nline two".to_string()),
                metrics: (status == ProbeStatus::Success)
                    .then(|| BTreeMap::from([("bandwidth_gbps".to_string(), 12.5)])),
                duration_ms: Some(5),
                commands: None,
            })
            .collect()
    }

    #[test]
    fn test_summarize_counts() {
        let all = [
            ProbeStatus::Success,
            ProbeStatus::Success,
            ProbeStatus::Failure,
            ProbeStatus::Timeout,
            ProbeStatus::Skipped,
            ProbeStatus::Error,
        ];
        let summary = summarize(&outcomes(&all));
        assert_eq!(
            summary,
            Summary {
                total: 6,
                succeeded: 2,
                failed: 2,
                skipped: 1,
                errored: 1,
                timed_out: 1,
            }
        );
        assert_eq!(
            summary.succeeded + summary.failed + summary.skipped + summary.errored,
            summary.total
        );
        assert!((summary.success_rate() - 40.0).abs() < f64::EPSILON);
        assert!(!summary.is_clean());
    }

    #[test]
    fn test_empty_summary() {
        let summary = summarize(&[]);
        assert_eq!(summary, Summary::default());
        assert_eq!(summary.success_rate(), 0.0);
        assert!(summary.is_clean());
    }

    #[test]
    fn test_report_json_fields() {
        let errors = parse_lines(["0 7 1"]).errors;
        let report = Report::new(
            ProbeMode::Performance,
            outcomes(&[ProbeStatus::Success, ProbeStatus::Skipped]),
            errors,
        );
        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["mode"], "PERFORMANCE");
        assert_eq!(json["summary"]["total"], 2);
        assert_eq!(json["outcomes"][0]["status"], "SUCCESS");
        assert_eq!(json["outcomes"][0]["metrics"]["bandwidth_gbps"], 12.5);
        assert_eq!(json["outcomes"][1]["connection"]["resolved"], false);
        assert_eq!(json["parse_errors"][0]["kind"], "MALFORMED_ROW");
        assert!(json["generated_at"].is_string());
    }

    #[test]
    fn test_render_text() {
        let report = Report::new(
            ProbeMode::VerifyOnly,
            outcomes(&[ProbeStatus::Success, ProbeStatus::Timeout]),
            parse_lines(["bad"]).errors,
        );
        let text = report.render_text();
        assert!(text.contains("port verification"));
        assert!(text.contains("MALFORMED_ROW at line 1"));
        assert!(text.contains("SUCCESS"));
        assert!(text.contains("bandwidth_gbps=12.5"));
        assert!(text.contains("         line two"));
        assert!(text.contains("failed:    1 (1 timed out)"));
    }

    #[test]
    fn test_write_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        let report = Report::new(ProbeMode::Performance, vec![], vec![]);
        report.write_to(&path, true).unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["summary"]["total"], 0);
    }
}
