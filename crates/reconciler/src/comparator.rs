//! Field-level comparison of desired units against observed resources.

use chrono::Utc;
use driftwatch_core::document::paths;
use driftwatch_core::{
    DesiredUnit, DriftRecord, FieldPath, FieldValue, ObservedResource, ResourceStatus, Severity,
};
use serde_json::Value;

/// Compares desired and observed state over each kind's comparable fields.
///
/// Only fields present in the desired document are compared. A config map
/// whose desired document declares no data is outside the monitored scope
/// and yields nothing.
#[derive(Debug, Clone, Default)]
pub struct DriftComparator {
    ignore_paths: Vec<FieldPath>,
}

impl DriftComparator {
    pub fn new(ignore_paths: Vec<FieldPath>) -> Self {
        Self { ignore_paths }
    }

    fn ignored(&self, path: &FieldPath) -> bool {
        self.ignore_paths.iter().any(|ignored| ignored.is_prefix_of(path))
    }

    /// Drift records for one unit, in comparable-field order.
    ///
    /// When no field diverges but the live resource reports a failed status,
    /// a single [`Severity::PossibleDrift`] record is emitted at `status`.
    pub fn compare(&self, desired: &DesiredUnit, actual: &ObservedResource) -> Vec<DriftRecord> {
        let schema = desired.document.schema();
        if !schema.is_monitored() {
            return Vec::new();
        }

        let detected_at = Utc::now();
        let record = |path: FieldPath, expected, actual_value, restore, severity| DriftRecord {
            unit: desired.id,
            scope: desired.scope.clone(),
            resource: actual.identity.clone(),
            path,
            expected,
            actual: actual_value,
            restore,
            severity,
            detected_at,
        };

        let mut records: Vec<DriftRecord> = schema
            .comparable_fields()
            .into_iter()
            .filter(|field| !self.ignored(&field.path))
            .filter_map(|field| {
                let expected = field.field_type.coerce(&field.desired);
                let observed = actual
                    .field(&field.path)
                    .map_or(FieldValue::Absent, |raw| field.field_type.coerce(raw));
                (expected != observed).then(|| {
                    record(field.path, expected, observed, field.desired, field.severity)
                })
            })
            .collect();

        if let ResourceStatus::Failed { reason } = &actual.status {
            if records.is_empty() && !self.ignored(&paths::status()) {
                records.push(record(
                    paths::status(),
                    FieldValue::Text("ready".to_string()),
                    FieldValue::Text(reason.clone()),
                    Value::Null,
                    Severity::PossibleDrift,
                ));
            }
        }
        records
    }
}

/// Compare with no ignored paths.
pub fn compare(desired: &DesiredUnit, actual: &ObservedResource) -> Vec<DriftRecord> {
    DriftComparator::default().compare(desired, actual)
}
