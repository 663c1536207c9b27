//! Run reports.
//!
//! Aggregates executor results into counts plus one line per resource, and
//! renders them as text or JSON.

use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::error::{
    ConvergeError, EXIT_COMPLETED_WITH_FAILURES, EXIT_SUCCESS, Result,
};
use crate::graph::ResourceKind;
use crate::planner::{ExecutionResult, NodeOutcome, NodeResult, PlanAction, PlanMode, SkipReason};

/// Outcome counts for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    /// Resources created.
    pub created: usize,
    /// Resources updated in place.
    pub updated: usize,
    /// Resources destroyed.
    pub destroyed: usize,
    /// Resources left unchanged.
    pub unchanged: usize,
    /// Resources whose operation failed.
    pub failed: usize,
    /// Resources not executed.
    pub skipped: usize,
}

/// One line of a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportLine {
    /// Resource id.
    pub id: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Planned action.
    pub action: PlanAction,
    /// Declaration position; `None` for resources only known from state.
    pub position: Option<usize>,
    /// Terminal outcome.
    pub outcome: NodeOutcome,
    /// Provider id, if the resource exists after the run.
    pub provider_id: Option<String>,
    /// Provider attempts made.
    pub attempts: u32,
}

/// Report for an apply or destroy run.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    /// Run mode.
    pub mode: PlanMode,
    /// Aggregate counts.
    pub summary: Summary,
    /// Per-resource lines, by declaration position.
    pub lines: Vec<ReportLine>,
    /// Whether the run was cancelled.
    pub cancelled: bool,
}

#[derive(Tabled)]
struct LineRow {
    #[tabled(rename = "Resource")]
    id: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Outcome")]
    outcome: String,
    #[tabled(rename = "Provider ID")]
    provider_id: String,
}

impl Summary {
    /// Counts outcomes.
    #[must_use]
    pub fn from_results<'a>(results: impl IntoIterator<Item = &'a NodeResult>) -> Self {
        let mut summary = Self::default();
        for result in results {
            match result.outcome {
                NodeOutcome::Created => summary.created += 1,
                NodeOutcome::Updated => summary.updated += 1,
                NodeOutcome::Destroyed => summary.destroyed += 1,
                NodeOutcome::Unchanged => summary.unchanged += 1,
                NodeOutcome::Failed(_) => summary.failed += 1,
                NodeOutcome::Skipped(_) => summary.skipped += 1,
            }
        }
        summary
    }

    /// Total number of resources counted.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.created + self.updated + self.destroyed + self.unchanged + self.failed + self.skipped
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Resources: {} added, {} changed, {} destroyed, {} failed, {} skipped.",
            self.created, self.updated, self.destroyed, self.failed, self.skipped
        )
    }
}

impl Report {
    /// Builds a report from executor results.
    #[must_use]
    pub fn from_execution(result: &ExecutionResult) -> Self {
        let mut lines: Vec<ReportLine> = result
            .results
            .iter()
            .map(|r| ReportLine {
                id: r.id.clone(),
                kind: r.kind,
                action: r.action,
                position: r.position,
                outcome: r.outcome.clone(),
                provider_id: r.provider_id.clone(),
                attempts: r.attempts,
            })
            .collect();

        // Declared resources by position, then state-only resources by id.
        // The sort is stable so a replacement keeps its destroy before its create.
        lines.sort_by(|a, b| match (a.position, b.position) {
            (Some(pa), Some(pb)) => pa.cmp(&pb),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.id.cmp(&b.id),
        });

        Self {
            mode: result.mode,
            summary: Summary::from_results(&result.results),
            lines,
            cancelled: result.cancelled,
        }
    }

    /// Returns true if nothing failed and the run was not cancelled.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.summary.failed == 0 && !self.cancelled
    }

    /// Process exit code for this report.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        if self.is_success() {
            EXIT_SUCCESS
        } else {
            EXIT_COMPLETED_WITH_FAILURES
        }
    }

    /// Lines that failed, with their reasons.
    pub fn failures(&self) -> impl Iterator<Item = (&str, &str)> {
        self.lines.iter().filter_map(|l| match &l.outcome {
            NodeOutcome::Failed(reason) => Some((l.id.as_str(), reason.as_str())),
            _ => None,
        })
    }

    /// Renders the report as a table followed by the summary line.
    #[must_use]
    pub fn render_text(&self) -> String {
        let mut output = String::new();

        if !self.lines.is_empty() {
            let rows: Vec<LineRow> = self
                .lines
                .iter()
                .map(|l| LineRow {
                    id: l.id.clone(),
                    kind: l.kind.to_string(),
                    outcome: format_outcome(&l.outcome),
                    provider_id: l.provider_id.clone().unwrap_or_else(|| String::from("-")),
                })
                .collect();
            output.push_str(&Table::new(rows).to_string());
            output.push('\n');
        }

        let failures: Vec<(&str, &str)> = self.failures().collect();
        if !failures.is_empty() {
            let _ = write!(output, "\n{} Errors:\n", "✗".red());
            for (id, reason) in failures {
                let _ = writeln!(output, "   - {id}: {reason}");
            }
        }

        if self.cancelled {
            let _ = writeln!(output, "\n{} Run cancelled before completion.", "⚠".yellow());
        }

        let marker = if self.is_success() {
            "✓".green()
        } else {
            "✗".red()
        };
        let _ = writeln!(output, "\n{marker} {}", self.summary);
        output
    }

    /// Renders the report as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn render_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| ConvergeError::internal(format!("Failed to serialize report: {e}")))
    }
}

/// Formats an outcome with color.
fn format_outcome(outcome: &NodeOutcome) -> String {
    match outcome {
        NodeOutcome::Created => "+created".green().to_string(),
        NodeOutcome::Updated => "~updated".yellow().to_string(),
        NodeOutcome::Destroyed => "-destroyed".red().to_string(),
        NodeOutcome::Unchanged => "unchanged".dimmed().to_string(),
        NodeOutcome::Failed(_) => "failed".red().bold().to_string(),
        NodeOutcome::Skipped(SkipReason::DependencyFailed(id)) => {
            format!("skipped ({id} failed)").yellow().to_string()
        }
        NodeOutcome::Skipped(reason) => format!("skipped ({reason})").dimmed().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(id: &str, position: Option<usize>, outcome: NodeOutcome) -> NodeResult {
        NodeResult {
            id: id.to_string(),
            kind: ResourceKind::Role,
            action: PlanAction::Create,
            position,
            outcome,
            provider_id: None,
            attempts: 1,
            duration_ms: None,
        }
    }

    fn execution(results: Vec<NodeResult>) -> ExecutionResult {
        ExecutionResult {
            mode: PlanMode::Apply,
            results,
            cancelled: false,
        }
    }

    #[test]
    fn test_summary_line() {
        let exec = execution(vec![
            result("a", Some(0), NodeOutcome::Created),
            result("b", Some(1), NodeOutcome::Created),
            result("c", Some(2), NodeOutcome::Updated),
            result("d", Some(3), NodeOutcome::Failed(String::from("boom"))),
            result("e", Some(4), NodeOutcome::Skipped(SkipReason::DependencyFailed(String::from("d")))),
            result("f", Some(5), NodeOutcome::Skipped(SkipReason::Disabled)),
        ]);
        let report = Report::from_execution(&exec);

        assert_eq!(
            report.summary.to_string(),
            "Resources: 2 added, 1 changed, 0 destroyed, 1 failed, 2 skipped."
        );
        assert_eq!(report.summary.total(), 6);
        assert_eq!(report.exit_code(), EXIT_COMPLETED_WITH_FAILURES);
        assert_eq!(report.failures().collect::<Vec<_>>(), vec![("d", "boom")]);
    }

    #[test]
    fn test_lines_ordered_by_position_then_state_only_by_id() {
        let exec = execution(vec![
            result("zeta", None, NodeOutcome::Destroyed),
            result("cluster", Some(1), NodeOutcome::Unchanged),
            result("alpha", None, NodeOutcome::Destroyed),
            result("vpc", Some(0), NodeOutcome::Unchanged),
        ]);
        let report = Report::from_execution(&exec);

        let ids: Vec<&str> = report.lines.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, vec!["vpc", "cluster", "alpha", "zeta"]);
        assert!(report.is_success());
        assert_eq!(report.exit_code(), EXIT_SUCCESS);
    }

    #[test]
    fn test_cancelled_run_is_not_success() {
        let mut exec = execution(vec![result("a", Some(0), NodeOutcome::Skipped(SkipReason::Cancelled))]);
        exec.cancelled = true;
        let report = Report::from_execution(&exec);

        assert!(!report.is_success());
        assert!(report.render_text().contains("cancelled"));
    }

    #[test]
    fn test_render_json() {
        let report = Report::from_execution(&execution(vec![result(
            "a",
            Some(0),
            NodeOutcome::Failed(String::from("rejected")),
        )]));
        let json: serde_json::Value = serde_json::from_str(&report.render_json().unwrap()).unwrap();

        assert_eq!(json["mode"], "apply");
        assert_eq!(json["summary"]["failed"], 1);
        assert_eq!(json["lines"][0]["outcome"]["status"], "failed");
        assert_eq!(json["lines"][0]["outcome"]["detail"], "rejected");
    }
}
