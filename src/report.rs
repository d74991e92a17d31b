// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Report renderer.
//!
//! Turns the composer's per-entrypoint results into a `Report`: one row per
//! entrypoint, grouped by priority group in the order each group was first
//! encountered (an `IndexMap`, so the grouped view reads in the same order
//! the flat table does, rather than sorted numerically), plus a computed
//! global maximum over the rows that succeeded.

use std::io;

use indexmap::IndexMap;
use serde::Serialize;
use termcolor::{Color, ColorSpec, WriteColor};

use crate::compose::AnalysisResult;
use crate::entrypoint::Entrypoint;
use crate::error::AnalysisError;

#[derive(Clone, Debug, Serialize)]
pub struct ReportRow {
    pub name: String,
    pub vector_index: u32,
    pub priority_group: i32,
    pub local_depth: Option<u32>,
    pub preemption_surcharge: Option<u32>,
    pub total_depth: Option<u32>,
    /// `"ok"` on success, otherwise the failing `AnalysisError`'s machine
    /// tag (e.g. `"recursion"`, `"unresolved-call"`).
    pub status: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct Report {
    pub rows: Vec<ReportRow>,
    pub global_max: Option<u32>,
}

impl Report {
    pub fn build(
        results: &[(Entrypoint, Result<AnalysisResult, AnalysisError>)],
    ) -> Report {
        let mut rows = Vec::with_capacity(results.len());
        let mut global_max: Option<u32> = None;

        for (ep, result) in results {
            let row = match result {
                Ok(r) => {
                    global_max =
                        Some(global_max.unwrap_or(0).max(r.total_depth));
                    ReportRow {
                        name: ep.name.clone(),
                        vector_index: ep.vector_index,
                        priority_group: ep.priority_group,
                        local_depth: Some(r.local_depth),
                        preemption_surcharge: Some(r.preemption_surcharge),
                        total_depth: Some(r.total_depth),
                        status: "ok".to_string(),
                    }
                }
                Err(e) => ReportRow {
                    name: ep.name.clone(),
                    vector_index: ep.vector_index,
                    priority_group: ep.priority_group,
                    local_depth: None,
                    preemption_surcharge: None,
                    total_depth: None,
                    status: e.tag().to_string(),
                },
            };
            rows.push(row);
        }

        Report { rows, global_max }
    }

    /// Rows grouped by priority group, preserving the order each group was
    /// first seen in the (vector-index-ordered) row list.
    pub fn by_priority_group(&self) -> IndexMap<i32, Vec<&ReportRow>> {
        let mut groups: IndexMap<i32, Vec<&ReportRow>> = IndexMap::new();
        for row in &self.rows {
            groups.entry(row.priority_group).or_default().push(row);
        }
        groups
    }

    pub fn write_text<W: WriteColor + io::Write>(
        &self,
        out: &mut W,
    ) -> io::Result<()> {
        writeln!(
            out,
            "{:<16} {:>6} {:>9} {:>11} {:>11} {:>9} {}",
            "entrypoint", "vector", "priority", "local", "surcharge", "total", "status"
        )?;
        for row in &self.rows {
            let ok = row.status == "ok";
            out.set_color(ColorSpec::new().set_fg(Some(if ok {
                Color::Green
            } else {
                Color::Red
            })))?;
            writeln!(
                out,
                "{:<16} {:>6} {:>9} {:>11} {:>11} {:>9} {}",
                row.name,
                row.vector_index,
                row.priority_group,
                field(row.local_depth),
                field(row.preemption_surcharge),
                field(row.total_depth),
                row.status,
            )?;
            out.reset()?;
        }
        if let Some(max) = self.global_max {
            writeln!(out, "\nglobal worst case: {max} bytes")?;
        } else {
            writeln!(out, "\nglobal worst case: indeterminate")?;
        }
        Ok(())
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "rows": self.rows,
            "global_max": self.global_max,
        })
    }
}

fn field(value: Option<u32>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::WitnessStep;

    fn entrypoint(name: &str, vector_index: u32, priority_group: i32) -> Entrypoint {
        Entrypoint {
            name: name.to_string(),
            vector_index,
            handler: name.to_string(),
            priority_group,
            enabled: true,
        }
    }

    #[test]
    fn ok_row_reports_status_ok_and_feeds_global_max() {
        let results = vec![(
            entrypoint("reset", 1, i32::MAX),
            Ok(AnalysisResult {
                local_depth: 16,
                preemption_surcharge: 0,
                total_depth: 16,
                witness: vec![WitnessStep {
                    function: "main".into(),
                    depth_at_call: 0,
                }],
            }),
        )];
        let report = Report::build(&results);
        assert_eq!(report.rows[0].status, "ok");
        assert_eq!(report.global_max, Some(16));
    }

    #[test]
    fn failed_row_carries_error_tag_and_is_excluded_from_global_max() {
        let results = vec![(
            entrypoint("irq0", 16, 0),
            Err(AnalysisError::RecursionDetected {
                cycle: vec!["a".into(), "b".into()],
            }),
        )];
        let report = Report::build(&results);
        assert_eq!(report.rows[0].status, "recursion");
        assert_eq!(report.global_max, None);
    }

    #[test]
    fn groups_preserve_first_seen_order() {
        let results = vec![
            (
                entrypoint("irq_hi", 16, 1),
                Ok(AnalysisResult {
                    local_depth: 8,
                    preemption_surcharge: 0,
                    total_depth: 8,
                    witness: vec![],
                }),
            ),
            (
                entrypoint("reset", 1, i32::MAX),
                Ok(AnalysisResult {
                    local_depth: 8,
                    preemption_surcharge: 0,
                    total_depth: 8,
                    witness: vec![],
                }),
            ),
        ];
        let report = Report::build(&results);
        let groups = report.by_priority_group();
        let keys: Vec<i32> = groups.keys().copied().collect();
        assert_eq!(keys, vec![1, i32::MAX]);
    }
}
