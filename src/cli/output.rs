//! Output formatting for CLI commands.

use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::{Document, ValidationResult};
use crate::graph::{EdgeOrigin, ResourceGraph, Schedule};
use crate::planner::{PlanAction, ReconcilePlan};
use crate::reconciler::DriftReport;
use crate::reporter::Report;
use crate::state::{LockInfo, ReconcileState};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    format: OutputFormat,
}

#[derive(Tabled)]
struct PlanEntryRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

#[derive(Tabled)]
struct OrderRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Depends on")]
    depends_on: String,
}

#[derive(Tabled)]
struct StateRow {
    #[tabled(rename = "Resource")]
    id: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Provider ID")]
    provider_id: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

#[derive(Serialize)]
struct GraphJson<'a> {
    apply_order: Vec<&'a str>,
    excluded: Vec<&'a str>,
    edges: Vec<EdgeJson<'a>>,
}

#[derive(Serialize)]
struct EdgeJson<'a> {
    from: &'a str,
    to: &'a str,
    origin: &'static str,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Returns true for JSON output.
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    /// Formats a plan.
    #[must_use]
    pub fn format_plan(&self, plan: &ReconcilePlan) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(plan).unwrap_or_default(),
            OutputFormat::Text => Self::format_plan_text(plan),
        }
    }

    fn format_plan_text(plan: &ReconcilePlan) -> String {
        if plan.is_empty() {
            return format!(
                "{} No changes. Infrastructure matches the document.\n",
                "✓".green()
            );
        }

        let rows: Vec<PlanEntryRow> = plan
            .entries
            .iter()
            .filter(|e| !matches!(e.action, PlanAction::NoOp | PlanAction::Skip))
            .enumerate()
            .map(|(i, e)| PlanEntryRow {
                index: i + 1,
                action: Self::format_action(e.action),
                resource: e.id.clone(),
                kind: e.kind.to_string(),
                reason: Self::truncate(&e.reason, 48),
            })
            .collect();

        let mut output = String::new();
        let _ = writeln!(output, "\nPlan ({})\n", Self::short(&plan.config_hash));
        output.push_str(&Table::new(rows).to_string());
        let _ = write!(output, "\n\n{}\n", plan.summary());
        output
    }

    /// Formats the apply order of a prepared graph.
    #[must_use]
    pub fn format_graph(&self, graph: &ResourceGraph, schedule: &Schedule, excluded: &[usize]) -> String {
        if self.is_json() {
            let json = GraphJson {
                apply_order: schedule
                    .apply_order()
                    .iter()
                    .map(|&i| graph.node_at(i).id.as_str())
                    .collect(),
                excluded: excluded.iter().map(|&i| graph.node_at(i).id.as_str()).collect(),
                edges: graph
                    .edges()
                    .iter()
                    .map(|e| EdgeJson {
                        from: &e.from,
                        to: &e.to,
                        origin: match e.origin {
                            EdgeOrigin::Explicit => "explicit",
                            EdgeOrigin::Implicit => "implicit",
                        },
                    })
                    .collect(),
            };
            return serde_json::to_string_pretty(&json).unwrap_or_default();
        }

        let rows: Vec<OrderRow> = schedule
            .apply_order()
            .iter()
            .enumerate()
            .map(|(i, &idx)| {
                let node = graph.node_at(idx);
                OrderRow {
                    index: i + 1,
                    resource: node.id.clone(),
                    kind: node.kind.to_string(),
                    depends_on: graph
                        .dependencies_of(idx)
                        .iter()
                        .map(|&d| graph.node_at(d).id.as_str())
                        .collect::<Vec<_>>()
                        .join(", "),
                }
            })
            .collect();

        let mut output = String::from("\nApply order\n\n");
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');
        if !excluded.is_empty() {
            let names: Vec<&str> = excluded.iter().map(|&i| graph.node_at(i).id.as_str()).collect();
            let _ = writeln!(output, "\n{} {}", "Disabled:".dimmed(), names.join(", "));
        }
        output
    }

    /// Formats an apply or destroy report.
    #[must_use]
    pub fn format_report(&self, report: &Report) -> String {
        match self.format {
            OutputFormat::Json => report.render_json().unwrap_or_default(),
            OutputFormat::Text => report.render_text(),
        }
    }

    /// Formats a validation result.
    #[must_use]
    pub fn format_validation(&self, doc: &Document, result: &ValidationResult, show_warnings: bool) -> String {
        if self.is_json() {
            let json = serde_json::json!({
                "valid": result.is_valid(),
                "project": doc.project.name,
                "environment": doc.project.environment,
                "resources": doc.resources.len(),
                "flags": doc.flags,
                "warnings": result.warnings,
            });
            return serde_json::to_string_pretty(&json).unwrap_or_default();
        }

        let mut output = format!("{} Document is valid.\n", "✓".green());
        if show_warnings && !result.warnings.is_empty() {
            let _ = write!(output, "\n{} Warnings:\n", "⚠".yellow());
            for warning in &result.warnings {
                let _ = writeln!(output, "   - {warning}");
            }
        }
        let _ = writeln!(output, "\n   Project: {}/{}", doc.project.name, doc.project.environment);
        let _ = writeln!(output, "   Resources: {}", doc.resources.len());
        let _ = writeln!(output, "   Flags: {}", doc.flags.len());
        output
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text => {
                if report.is_converged() {
                    return format!("{} No drift detected. State is converged.\n", "✓".green());
                }
                let mut output = format!("{} Drift detected:\n\n", "⚠".yellow());
                for item in &report.drifted {
                    let _ = writeln!(output, "   - {} [{}] {}", item.id, item.change, item.reason);
                }
                let _ = write!(
                    output,
                    "\n{}/{} resources would change.\n",
                    report.drifted.len(),
                    report.total_resources
                );
                output
            }
        }
    }

    /// Formats recorded state.
    #[must_use]
    pub fn format_state(&self, state: &ReconcileState) -> String {
        if self.is_json() {
            return serde_json::to_string_pretty(state).unwrap_or_default();
        }

        let mut output = String::new();
        let _ = write!(output, "\nState: {}/{}\n\n", state.project, state.environment);
        let _ = writeln!(output, "   Version: {} (serial {})", state.version, state.serial);
        let _ = writeln!(output, "   Naming suffix: {}", state.naming_suffix);
        let _ = writeln!(output, "   Document hash: {}", Self::short(&state.config_hash));
        let _ = writeln!(output, "   Last updated: {}", state.last_updated);

        if !state.resources.is_empty() {
            let mut resources: Vec<_> = state.resources.values().collect();
            resources.sort_by(|a, b| a.position.cmp(&b.position).then_with(|| a.id.cmp(&b.id)));
            let rows: Vec<StateRow> = resources
                .into_iter()
                .map(|r| StateRow {
                    id: r.id.clone(),
                    kind: r.kind.to_string(),
                    provider_id: r.provider_id.clone(),
                    updated: r.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                })
                .collect();
            output.push('\n');
            output.push_str(&Table::new(rows).to_string());
            output.push('\n');
        }

        if !state.history.is_empty() {
            let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
            for entry in state.history.iter().rev().take(5) {
                let status = if entry.success { "✓".green() } else { "✗".red() };
                let _ = writeln!(
                    output,
                    "     {status} {} - {} ({})",
                    entry.timestamp.format("%Y-%m-%d %H:%M"),
                    entry.operation,
                    entry.error.as_deref().unwrap_or(&entry.resources.join(", "))
                );
            }
        }

        output
    }

    /// Formats lock information.
    #[must_use]
    pub fn format_lock(&self, lock: &LockInfo) -> String {
        if self.is_json() {
            return serde_json::to_string_pretty(lock).unwrap_or_default();
        }
        format!(
            "State locked: {}\n   Holder: {}\n   Operation: {}\n   Expires in: {}s\n",
            lock.lock_id,
            lock.holder,
            lock.operation,
            lock.remaining_secs()
        )
    }

    fn format_action(action: PlanAction) -> String {
        match action {
            PlanAction::Create => "+create".green().to_string(),
            PlanAction::Update => "~update".yellow().to_string(),
            PlanAction::Destroy => "-destroy".red().to_string(),
            PlanAction::Skip => "skip".dimmed().to_string(),
            PlanAction::NoOp => "no-op".dimmed().to_string(),
        }
    }

    fn short(hash: &str) -> &str {
        &hash[..12.min(hash.len())]
    }

    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let kept: String = s.chars().take(max_len - 3).collect();
            format!("{kept}...")
        }
    }
}
