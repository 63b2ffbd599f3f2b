//! Mechanical correction plans that restore desired state.

use driftwatch_core::{CorrectionPlan, DriftRecord, Patch, PlanSource, UnitId};
use itertools::Itertools;

use crate::error::{Error, Result};

/// Turns drift records into correction plans.
///
/// A plan always restores the value the desired document declared at the
/// drifted path. It never adopts the observed value.
#[derive(Debug, Clone, Copy, Default)]
pub struct CorrectionGenerator;

impl CorrectionGenerator {
    /// Plan for a single record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotCorrectable`] for records that describe a failed
    /// live status rather than a field divergence.
    pub fn generate(&self, record: &DriftRecord) -> Result<CorrectionPlan> {
        if !record.is_correctable() {
            return Err(Error::not_correctable(format!(
                "{} on {} reports '{}' without a field divergence",
                record.path, record.resource, record.actual
            )));
        }
        Ok(CorrectionPlan {
            unit: record.unit,
            scope: record.scope.clone(),
            resource: record.resource.clone(),
            patch: Patch::single(record.path.clone(), record.restore.clone()),
            explanation: explain(record),
            origin: vec![record.clone()],
            source: PlanSource::Mechanical,
        })
    }

    /// One plan per unit, in order of first appearance.
    ///
    /// Patches of the same unit are deep-merged; later records override
    /// overlapping branches. Records that cannot be corrected are left out.
    pub fn generate_all(&self, records: &[DriftRecord]) -> Vec<CorrectionPlan> {
        records
            .iter()
            .filter_map(|record| self.generate(record).ok())
            .into_group_map_by(|plan| plan.unit)
            .into_iter()
            .sorted_by_key(|(unit, _)| first_seen(records, *unit))
            .filter_map(|(_, plans)| {
                plans.into_iter().reduce(|mut merged, plan| {
                    merged.patch.merge(plan.patch);
                    merged.explanation = format!("{}; {}", merged.explanation, plan.explanation);
                    merged.origin.extend(plan.origin);
                    merged
                })
            })
            .collect()
    }
}

fn first_seen(records: &[DriftRecord], unit: UnitId) -> usize {
    records
        .iter()
        .position(|record| record.unit == unit)
        .unwrap_or(usize::MAX)
}

fn explain(record: &DriftRecord) -> String {
    format!(
        "restore {} on {} to {} (observed {})",
        record.path, record.resource, record.expected, record.actual
    )
}
