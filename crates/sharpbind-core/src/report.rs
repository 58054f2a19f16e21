//! Export outcome collection.
//!
//! Exporters record one outcome per function or type and keep going; the
//! pipeline driver turns the collected outcomes into a single verdict.

use std::fmt;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    Error = 1,
    Warning = 2,
    Info = 3,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Trampolines,
    Wrappers,
    Placeholders,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Trampolines => "trampolines",
            Stage::Wrappers => "wrappers",
            Stage::Placeholders => "placeholders",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Handled locally; the item falls back to a slower path.
    Recovered(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportEntry {
    pub subject: String,
    pub outcome: Outcome,
}

impl ReportEntry {
    pub fn severity(&self) -> Severity {
        match self.outcome {
            Outcome::Success => Severity::Info,
            Outcome::Recovered(_) => Severity::Warning,
            Outcome::Failed(_) => Severity::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportReport {
    pub stage: Stage,
    entries: Vec<ReportEntry>,
}

impl ExportReport {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            entries: Vec::new(),
        }
    }

    pub fn record_success(&mut self, subject: impl Into<String>) {
        self.push(subject.into(), Outcome::Success);
    }

    pub fn record_recovered(&mut self, subject: impl Into<String>, reason: impl Into<String>) {
        let (subject, reason) = (subject.into(), reason.into());
        warn!(stage = %self.stage, %subject, "{reason}");
        self.push(subject, Outcome::Recovered(reason));
    }

    pub fn record_failure(&mut self, subject: impl Into<String>, reason: impl Into<String>) {
        let (subject, reason) = (subject.into(), reason.into());
        error!(stage = %self.stage, %subject, "{reason}");
        self.push(subject, Outcome::Failed(reason));
    }

    fn push(&mut self, subject: String, outcome: Outcome) {
        self.entries.push(ReportEntry { subject, outcome });
    }

    pub fn entries(&self) -> &[ReportEntry] {
        &self.entries
    }

    /// No item failed. Recovered items do not fail a stage.
    pub fn is_success(&self) -> bool {
        self.failures().next().is_none()
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ReportEntry> {
        self.entries.iter().filter(|e| e.severity() == Severity::Warning)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ReportEntry> {
        self.entries.iter().filter(|e| e.severity() == Severity::Error)
    }

    pub fn success_count(&self) -> usize {
        self.entries.iter().filter(|e| e.outcome == Outcome::Success).count()
    }

    /// One line per warning or error, e.g. `warning[trampolines] Actor.Log: ...`.
    pub fn render_problems(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter_map(|entry| match &entry.outcome {
                Outcome::Success => None,
                Outcome::Recovered(reason) | Outcome::Failed(reason) => Some(format!(
                    "{}[{}] {}: {}",
                    entry.severity().as_str(),
                    self.stage,
                    entry.subject,
                    reason
                )),
            })
            .collect()
    }
}

impl fmt::Display for ExportReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} ok, {} recovered, {} failed",
            self.stage,
            self.success_count(),
            self.warnings().count(),
            self.failures().count()
        )
    }
}
