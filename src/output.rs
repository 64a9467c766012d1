//! Output and Reporting
//!
//! Renders per-document outcomes and aggregate statistics for the CLI.
//! Dashboards and other programmatic consumers use the JSON form.

use std::collections::BTreeMap;
use std::path::Path;

use serde_json::{Value, json};

use crate::cli::VerbosityLevel;
use crate::engine::IngestOutcome;
use crate::lifecycle::DocumentStatus;
use crate::store::AggregateBucket;

/// Output formatter for human-readable and JSON results.
pub struct Output {
    verbosity: VerbosityLevel,
    show_colors: bool,
}

impl Output {
    pub fn new(verbosity: VerbosityLevel) -> Self {
        Self {
            verbosity,
            show_colors: atty::is(atty::Stream::Stdout),
        }
    }

    fn colorize(&self, text: &str, color: &str) -> String {
        if self.show_colors {
            format!("\x1b[{}m{}\x1b[0m", color, text)
        } else {
            text.to_string()
        }
    }

    pub fn format_outcome(&self, path: &Path, outcome: &IngestOutcome) -> String {
        let path_display = path.display();
        match outcome {
            IngestOutcome::Accepted(record) => format!(
                "{}  {} [{} {} {}]",
                self.colorize("✓ ACCEPTED", "32"),
                path_display,
                record.uuid,
                record.total,
                record.currency
            ),
            IngestOutcome::RejectedParse(e) => format!(
                "{}  {} - {}",
                self.colorize("✗ PARSE", "31"),
                path_display,
                e
            ),
            IngestOutcome::RejectedValidation(report) => {
                let mut line = format!(
                    "{}  {} - {} violation{}",
                    self.colorize("✗ INVALID", "31"),
                    path_display,
                    report.violations().len(),
                    if report.violations().len() == 1 { "" } else { "s" }
                );
                if self.verbosity >= VerbosityLevel::Verbose {
                    for violation in report.violations() {
                        line.push_str(&format!(
                            "\n    [{}] {}",
                            violation.rule, violation.message
                        ));
                    }
                }
                line
            }
            IngestOutcome::RejectedSeal(verification) => {
                let reason = verification
                    .failure
                    .as_ref()
                    .map(|f| f.to_string())
                    .unwrap_or_else(|| "seal invalid".to_string());
                format!(
                    "{}  {} - {}",
                    self.colorize("✗ SEAL", "31"),
                    path_display,
                    reason
                )
            }
            IngestOutcome::DuplicateIgnored(uuid) => format!(
                "{}  {} [{}]",
                self.colorize("- DUPLICATE", "36"),
                path_display,
                uuid
            ),
            IngestOutcome::ConflictRejected(uuid) => format!(
                "{}  {} [{}] identifier already bound to different content",
                self.colorize("⚠ CONFLICT", "33"),
                path_display,
                uuid
            ),
            IngestOutcome::CancellationProcessed { applied, deferred } => format!(
                "{}  {} - {} applied, {} deferred",
                self.colorize("✓ CANCELLATION", "32"),
                path_display,
                applied.len(),
                deferred.len()
            ),
        }
    }

    pub fn format_summary(&self, outcomes: &[IngestOutcome]) -> String {
        let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
        for outcome in outcomes {
            *counts.entry(outcome.kind()).or_default() += 1;
        }

        let mut output = String::new();
        output.push_str("Ingestion Summary:\n");
        output.push_str(&format!("  Total documents: {}\n", outcomes.len()));
        for (kind, count) in counts {
            output.push_str(&format!("  {}: {}\n", kind, count));
        }
        output
    }

    pub fn format_status_aggregates(
        &self,
        aggregates: &BTreeMap<DocumentStatus, AggregateBucket>,
    ) -> String {
        let mut output = String::new();
        output.push_str("Status Aggregates:\n");
        if aggregates.is_empty() {
            output.push_str("  (empty store)\n");
            return output;
        }
        for (status, bucket) in aggregates {
            let label = match status {
                DocumentStatus::Valid => self.colorize(status.as_str(), "32"),
                DocumentStatus::Canceled | DocumentStatus::Replaced => {
                    self.colorize(status.as_str(), "33")
                }
                DocumentStatus::Pending => status.as_str().to_string(),
            };
            output.push_str(&format!(
                "  {}: count={} total={}\n",
                label, bucket.count, bucket.total
            ));
        }
        output
    }

    /// Machine-readable report for dashboards and scripting.
    pub fn json_report(
        outcomes: &[(std::path::PathBuf, IngestOutcome)],
        aggregates: &BTreeMap<DocumentStatus, AggregateBucket>,
    ) -> Value {
        let documents: Vec<Value> = outcomes
            .iter()
            .map(|(path, outcome)| {
                let mut entry = json!({
                    "path": path.display().to_string(),
                    "outcome": outcome.kind(),
                });
                match outcome {
                    IngestOutcome::Accepted(record) => {
                        entry["folio"] = json!(record.uuid.to_string());
                        entry["status"] = json!(record.status.as_str());
                        entry["total"] = json!(record.total.to_string());
                    }
                    IngestOutcome::RejectedParse(e) => {
                        entry["error"] = json!(e.to_string());
                    }
                    IngestOutcome::RejectedValidation(report) => {
                        entry["violations"] = json!(report.violations());
                    }
                    IngestOutcome::RejectedSeal(verification) => {
                        entry["failure"] =
                            json!(verification.failure.as_ref().map(|f| f.to_string()));
                        entry["chain_status"] = json!(verification.chain_status);
                    }
                    IngestOutcome::DuplicateIgnored(uuid)
                    | IngestOutcome::ConflictRejected(uuid) => {
                        entry["folio"] = json!(uuid.to_string());
                    }
                    IngestOutcome::CancellationProcessed { applied, deferred } => {
                        entry["applied"] =
                            json!(applied.iter().map(|u| u.to_string()).collect::<Vec<_>>());
                        entry["deferred"] =
                            json!(deferred.iter().map(|u| u.to_string()).collect::<Vec<_>>());
                    }
                }
                entry
            })
            .collect();

        let aggregate_map: BTreeMap<&'static str, Value> = aggregates
            .iter()
            .map(|(status, bucket)| {
                (
                    status.as_str(),
                    json!({ "count": bucket.count, "total": bucket.total.to_string() }),
                )
            })
            .collect();

        json!({
            "documents": documents,
            "aggregates_by_status": aggregate_map,
        })
    }
}
