// ABOUTME: Per-step results for provisioning and replication runs
// ABOUTME: Distinguishes "already in desired state" from "changed state" and renders run summaries

use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum StepOutcome {
    Unchanged(String),
    Changed(String),
}

impl StepOutcome {
    pub fn unchanged(detail: impl Into<String>) -> Self {
        StepOutcome::Unchanged(detail.into())
    }

    pub fn changed(detail: impl Into<String>) -> Self {
        StepOutcome::Changed(detail.into())
    }

    pub fn is_changed(&self) -> bool {
        matches!(self, StepOutcome::Changed(_))
    }

    pub fn detail(&self) -> &str {
        match self {
            StepOutcome::Unchanged(detail) | StepOutcome::Changed(detail) => detail,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub step: String,
    #[serde(flatten)]
    pub outcome: StepOutcome,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub command: String,
    pub steps: Vec<StepReport>,
}

impl RunSummary {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            steps: Vec::new(),
        }
    }

    /// Records the outcome of a step and logs it.
    pub fn record(&mut self, step: impl Into<String>, outcome: StepOutcome) {
        let step = step.into();
        match &outcome {
            StepOutcome::Changed(detail) => tracing::info!("✓ {}: {}", step, detail),
            StepOutcome::Unchanged(detail) => tracing::info!("= {}: {}", step, detail),
        }
        self.steps.push(StepReport { step, outcome });
    }

    pub fn changed_count(&self) -> usize {
        self.steps.iter().filter(|s| s.outcome.is_changed()).count()
    }

    pub fn outcome_of(&self, step: &str) -> Option<&StepOutcome> {
        self.steps
            .iter()
            .find(|s| s.step == step)
            .map(|s| &s.outcome)
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let width = self.steps.iter().map(|s| s.step.len()).max().unwrap_or(0);
        writeln!(f, "{} summary:", self.command)?;
        for report in &self.steps {
            let marker = if report.outcome.is_changed() {
                "changed"
            } else {
                "ok"
            };
            writeln!(
                f,
                "  {:<width$}  {:<7}  {}",
                report.step,
                marker,
                report.outcome.detail(),
                width = width
            )?;
        }
        write!(
            f,
            "{} step(s), {} changed",
            self.steps.len(),
            self.changed_count()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_counts_changed_steps() {
        let mut summary = RunSummary::new("install");
        summary.record("require_root", StepOutcome::unchanged("running as root"));
        summary.record("reset_layout", StepOutcome::changed("recreated 4 directories"));

        assert_eq!(summary.changed_count(), 1);
        assert_eq!(
            summary.outcome_of("reset_layout"),
            Some(&StepOutcome::changed("recreated 4 directories"))
        );
        assert!(summary.to_string().ends_with("2 step(s), 1 changed"));
    }

    #[test]
    fn test_summary_serializes_status_and_detail() {
        let mut summary = RunSummary::new("test");
        summary.record("ensure_wal_level", StepOutcome::unchanged("already logical"));

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["steps"][0]["step"], "ensure_wal_level");
        assert_eq!(json["steps"][0]["status"], "unchanged");
        assert_eq!(json["steps"][0]["detail"], "already logical");
    }
}
