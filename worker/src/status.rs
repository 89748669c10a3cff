//! Status aggregation over the record store.
//!
//! Counts records per distribution and status, for the `status` command.

use crate::error::Result;
use crate::store::RecordStore;
use rebuilder_common::record::BuildRecord;
use rebuilder_common::task::BuildStatus;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write;

/// Record counts per distribution and status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    /// `distribution -> status -> count`; statuses without records are
    /// omitted.
    pub distributions: BTreeMap<String, BTreeMap<BuildStatus, usize>>,
}

impl StatusReport {
    /// Aggregates `records`.
    ///
    /// # Examples
    ///
    /// ```
    /// use rebuilder_common::identity::PackageIdentity;
    /// use rebuilder_common::record::BuildRecord;
    /// use rebuilder_common::task::{BuildStatus, BuildTask};
    /// use rebuilder_worker::status::StatusReport;
    ///
    /// let mut task = BuildTask::new(
    ///     PackageIdentity::new("bash", None, "5.1-2+b3", "amd64", "bullseye"),
    ///     "bash_5.1-2+b3_amd64.buildinfo",
    /// );
    /// task.status = BuildStatus::Reproducible;
    /// let report = StatusReport::from_records(&[BuildRecord::from_task(&task)]);
    /// assert_eq!(report.count("bullseye", BuildStatus::Reproducible), 1);
    /// assert_eq!(report.total(), 1);
    /// ```
    #[must_use]
    pub fn from_records(records: &[BuildRecord]) -> Self {
        let mut distributions: BTreeMap<String, BTreeMap<BuildStatus, usize>> = BTreeMap::new();
        for record in records {
            *distributions
                .entry(record.identity.distribution().to_owned())
                .or_default()
                .entry(record.status)
                .or_default() += 1;
        }
        Self { distributions }
    }

    /// Aggregates every record of `store`.
    ///
    /// # Errors
    ///
    /// Returns `Store` errors.
    pub fn collect(store: &dyn RecordStore) -> Result<Self> {
        Ok(Self::from_records(&store.dump_all(None)?))
    }

    /// Records of `distribution` with `status`.
    #[must_use]
    pub fn count(&self, distribution: &str, status: BuildStatus) -> usize {
        self.distributions
            .get(distribution)
            .and_then(|counts| counts.get(&status))
            .copied()
            .unwrap_or(0)
    }

    /// Number of records.
    #[must_use]
    pub fn total(&self) -> usize {
        self.distributions.values().flat_map(BTreeMap::values).sum()
    }
}

/// Renders `report` as a table with one row per distribution.
#[must_use]
pub fn format_human(report: &StatusReport) -> String {
    if report.distributions.is_empty() {
        return String::from("No build records.\n");
    }

    let width = report
        .distributions
        .keys()
        .map(String::len)
        .chain(std::iter::once("DISTRIBUTION".len()))
        .max()
        .unwrap_or_default();

    let mut output = format!("{:<width$}", "DISTRIBUTION");
    for status in BuildStatus::ALL {
        let _ = write!(output, " {:>14}", status.as_str());
    }
    let _ = writeln!(output, " {:>14}", "total");

    for distribution in report.distributions.keys() {
        let _ = write!(output, "{distribution:<width$}");
        let mut row_total = 0;
        for status in BuildStatus::ALL {
            let count = report.count(distribution, status);
            row_total += count;
            let _ = write!(output, " {count:>14}");
        }
        let _ = writeln!(output, " {row_total:>14}");
    }
    output
}

/// Renders `report` as pretty-printed JSON.
#[must_use]
pub fn format_json(report: &StatusReport) -> String {
    serde_json::to_string_pretty(report).unwrap_or_else(|_| "{}".to_owned())
}
