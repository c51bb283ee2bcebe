//! Run report: one outcome per object plus totals

use std::fmt;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FailureKind;
use crate::object::ObjectRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Skipped,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub namespace: String,
    pub name: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub attempts: u32,
}

impl Outcome {
    pub fn skipped(object: &ObjectRef, detail: impl Into<String>) -> Self {
        Self::new(object, Status::Skipped, None, Some(detail.into()), 0)
    }

    pub fn succeeded(object: &ObjectRef, detail: Option<String>, attempts: u32) -> Self {
        Self::new(object, Status::Succeeded, None, detail, attempts)
    }

    pub fn failed(object: &ObjectRef, kind: FailureKind, detail: impl Into<String>, attempts: u32) -> Self {
        Self::new(object, Status::Failed, Some(kind), Some(detail.into()), attempts)
    }

    fn new(
        object: &ObjectRef,
        status: Status,
        kind: Option<FailureKind>,
        detail: Option<String>,
        attempts: u32,
    ) -> Self {
        Self {
            namespace: object.namespace.clone(),
            name: object.name.clone(),
            status,
            kind,
            detail,
            attempts,
        }
    }

    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(&self.namespace, &self.name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub processed: usize,
    pub skipped: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Overall result, mapped to the CLI exit code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    AllSucceeded,
    CompletedWithFailures,
    Aborted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
    pub totals: Totals,
    pub outcomes: Vec<Outcome>,
}

impl Report {
    pub fn status(&self) -> RunStatus {
        if self.aborted.is_some() {
            RunStatus::Aborted
        } else if self.totals.failed > 0 {
            RunStatus::CompletedWithFailures
        } else {
            RunStatus::AllSucceeded
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self.status() {
            RunStatus::AllSucceeded => 0,
            RunStatus::CompletedWithFailures => 2,
            RunStatus::Aborted => 3,
        }
    }

    pub fn outcome(&self, object: &ObjectRef) -> Option<&Outcome> {
        self.outcomes
            .iter()
            .find(|o| o.namespace == object.namespace && o.name == object.name)
    }

    pub fn failures(&self) -> impl Iterator<Item = &Outcome> + '_ {
        self.outcomes.iter().filter(|o| o.status == Status::Failed)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn write_json(&self, path: &Path) -> std::io::Result<()> {
        let json = self.to_json().map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }

    /// One-line human summary
    pub fn summary(&self) -> String {
        let mut line = format!(
            "run {}: {} processed, {} succeeded, {} skipped, {} failed",
            self.run_id,
            self.totals.processed,
            self.totals.succeeded,
            self.totals.skipped,
            self.totals.failed,
        );
        if self.dry_run {
            line.push_str(" (dry run)");
        }
        if let Some(reason) = &self.aborted {
            line.push_str(&format!("; aborted: {reason}"));
        }
        line
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

/// Collects outcomes from concurrent workers
pub struct ReportBuilder {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    dry_run: bool,
    outcomes: Mutex<Vec<Outcome>>,
}

impl ReportBuilder {
    pub fn new(dry_run: bool) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            dry_run,
            outcomes: Mutex::new(Vec::new()),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn record(&self, outcome: Outcome) {
        match self.outcomes.lock() {
            Ok(mut outcomes) => outcomes.push(outcome),
            Err(poisoned) => poisoned.into_inner().push(outcome),
        }
    }

    /// Close the report. Outcomes are ordered by namespace then name.
    pub fn finish(&self, aborted: Option<String>) -> Report {
        let mut outcomes = match self.outcomes.lock() {
            Ok(mut outcomes) => std::mem::take(&mut *outcomes),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        outcomes.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));

        let mut totals = Totals {
            processed: outcomes.len(),
            ..Totals::default()
        };
        for outcome in &outcomes {
            match outcome.status {
                Status::Skipped => totals.skipped += 1,
                Status::Succeeded => totals.succeeded += 1,
                Status::Failed => totals.failed += 1,
            }
        }

        Report {
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at: Utc::now(),
            dry_run: self.dry_run,
            aborted,
            totals,
            outcomes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_totals_and_order() {
        let builder = ReportBuilder::new(false);
        builder.record(Outcome::succeeded(&ObjectRef::new("prod", "b"), None, 1));
        builder.record(Outcome::skipped(&ObjectRef::new("prod", "a"), "current"));
        builder.record(Outcome::failed(
            &ObjectRef::new("dev", "z"),
            FailureKind::Tampered,
            "bad tag",
            1,
        ));

        let report = builder.finish(None);
        assert_eq!(
            report.totals,
            Totals { processed: 3, skipped: 1, succeeded: 1, failed: 1 }
        );
        let names: Vec<_> = report.outcomes.iter().map(|o| o.object_ref().to_string()).collect();
        assert_eq!(names, ["dev/z", "prod/a", "prod/b"]);
        assert_eq!(report.status(), RunStatus::CompletedWithFailures);
        assert_eq!(report.exit_code(), 2);
    }

    #[test]
    fn test_exit_codes() {
        let clean = ReportBuilder::new(false);
        clean.record(Outcome::skipped(&ObjectRef::new("a", "b"), "current"));
        assert_eq!(clean.finish(None).exit_code(), 0);

        let aborted = ReportBuilder::new(false).finish(Some("list failed".into()));
        assert_eq!(aborted.status(), RunStatus::Aborted);
        assert_eq!(aborted.exit_code(), 3);
        assert!(aborted.summary().contains("aborted: list failed"));
    }

    #[test]
    fn test_json_shape() {
        let builder = ReportBuilder::new(true);
        builder.record(Outcome::failed(
            &ObjectRef::new("prod", "db"),
            FailureKind::NoMatchingKey,
            "no key",
            1,
        ));
        let json: serde_json::Value = serde_json::from_str(&builder.finish(None).to_json().unwrap()).unwrap();

        assert_eq!(json["dryRun"], true);
        assert_eq!(json["totals"]["failed"], 1);
        assert_eq!(json["outcomes"][0]["status"], "failed");
        assert_eq!(json["outcomes"][0]["kind"], "no-matching-key");
        assert!(json.get("aborted").is_none());
    }

    #[test]
    fn test_write_json() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("report.json");
        ReportBuilder::new(false).finish(None).write_json(&path).unwrap();

        let parsed: Report = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(parsed.totals.processed, 0);
    }
}
