use std::collections::{BTreeMap, HashMap};

use serde_json::Value;

use crate::store::document::{self, Document, TYPE_FIELD, USER_ID_FIELD};

use super::normalize;
use super::{IdentityField, TransformError};

/// Identity fields every record type starts with, in order.
pub const BASE_IDENTITY_FIELDS: [&str; 4] = [USER_ID_FIELD, "deviceId", "time", TYPE_FIELD];

/// Per-type capabilities the fingerprint builder needs.
pub trait RecordKind: Send + Sync {
    /// Ordered identity fields for a record of this kind.
    fn identity_fields(
        &self,
        record_type: &str,
        record: &Document,
    ) -> Result<Vec<IdentityField>, TransformError>;

    /// Bring the record's shape up to the current schema, in place.
    fn normalize(&self, _record_type: &str, _record: &mut Document) -> Result<(), TransformError> {
        Ok(())
    }
}

/// Extract a required identity field, rendered as a string.
pub fn required_field(
    record_type: &str,
    record: &Document,
    path: &str,
) -> Result<IdentityField, TransformError> {
    let missing = || TransformError::MissingIdentityField {
        record_type: record_type.to_string(),
        field: path.to_string(),
    };

    let value = match document::get_path(record, path) {
        None | Some(Value::Null) => return Err(missing()),
        Some(Value::String(s)) if s.trim().is_empty() => return Err(missing()),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => normalize::canonical_number(n),
        Some(Value::Bool(b)) => b.to_string(),
        Some(other) => {
            return Err(TransformError::InvalidIdentityField {
                record_type: record_type.to_string(),
                field: path.to_string(),
                reason: format!("expected a scalar, found {}", other),
            })
        }
    };

    Ok(IdentityField {
        name: path.to_string(),
        value,
    })
}

/// The identity fields shared by every type: user, device, canonical time, type.
pub fn base_identity_fields(
    record_type: &str,
    record: &Document,
) -> Result<Vec<IdentityField>, TransformError> {
    BASE_IDENTITY_FIELDS
        .iter()
        .map(|field| {
            let mut identity = required_field(record_type, record, field)?;
            if *field == "time" {
                identity.value = normalize::canonical_time(&identity.value).map_err(|reason| {
                    TransformError::InvalidTime {
                        record_type: record_type.to_string(),
                        value: identity.value.clone(),
                        reason,
                    }
                })?;
            }
            Ok(identity)
        })
        .collect()
}

// ============================================================================
// Kinds
// ============================================================================

/// Base identity fields followed by a fixed list of extra fields.
pub struct StandardKind {
    extra_fields: Vec<String>,
}

impl StandardKind {
    pub fn new<S: Into<String>>(extra_fields: impl IntoIterator<Item = S>) -> Self {
        Self {
            extra_fields: extra_fields.into_iter().map(Into::into).collect(),
        }
    }
}

impl RecordKind for StandardKind {
    fn identity_fields(
        &self,
        record_type: &str,
        record: &Document,
    ) -> Result<Vec<IdentityField>, TransformError> {
        let mut fields = base_identity_fields(record_type, record)?;
        for extra in &self.extra_fields {
            fields.push(required_field(record_type, record, extra)?);
        }
        Ok(fields)
    }
}

/// Glucose readings: base identity fields followed by the value in canonical units.
pub struct GlucoseKind;

impl RecordKind for GlucoseKind {
    fn identity_fields(
        &self,
        record_type: &str,
        record: &Document,
    ) -> Result<Vec<IdentityField>, TransformError> {
        let mut fields = base_identity_fields(record_type, record)?;

        let units = required_field(record_type, record, "units")?;
        let invalid = |reason: String| TransformError::InvalidGlucose {
            record_type: record_type.to_string(),
            reason,
        };
        let value = match document::get_path(record, "value") {
            Some(Value::Number(n)) => n
                .as_f64()
                .ok_or_else(|| invalid(format!("value {} is not representable", n)))?,
            Some(Value::Null) | None => {
                return Err(TransformError::MissingIdentityField {
                    record_type: record_type.to_string(),
                    field: "value".to_string(),
                })
            }
            Some(other) => return Err(invalid(format!("value {} is not a number", other))),
        };

        fields.push(IdentityField {
            name: "value".to_string(),
            value: normalize::canonical_glucose(value, &units.value).map_err(invalid)?,
        });
        Ok(fields)
    }
}

/// Pump settings: base identity fields, plus shape fixes for the `bolus`
/// collection name and the day lists of sleep schedules.
pub struct PumpSettingsKind;

impl PumpSettingsKind {
    fn normalize_schedule(
        record_type: &str,
        name: &str,
        schedule: &mut Value,
    ) -> Result<(), TransformError> {
        if let Some(Value::Array(days)) = schedule.get_mut("days") {
            *days = normalize::normalize_days(days).map_err(|value| {
                TransformError::UnknownDayOfWeek {
                    record_type: record_type.to_string(),
                    schedule: name.to_string(),
                    value,
                }
            })?;
        }
        Ok(())
    }
}

impl RecordKind for PumpSettingsKind {
    fn identity_fields(
        &self,
        record_type: &str,
        record: &Document,
    ) -> Result<Vec<IdentityField>, TransformError> {
        base_identity_fields(record_type, record)
    }

    fn normalize(&self, record_type: &str, record: &mut Document) -> Result<(), TransformError> {
        if !record.contains_key("boluses") {
            if let Some(boluses) = record.remove("bolus") {
                record.insert("boluses".to_string(), boluses);
            }
        }

        match record.get_mut("sleepSchedules") {
            Some(Value::Object(schedules)) => {
                for (name, schedule) in schedules.iter_mut() {
                    Self::normalize_schedule(record_type, name, schedule)?;
                }
            }
            Some(Value::Array(schedules)) => {
                for (index, schedule) in schedules.iter_mut().enumerate() {
                    Self::normalize_schedule(record_type, &index.to_string(), schedule)?;
                }
            }
            _ => {}
        }

        Ok(())
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Maps a type discriminator to the kind that fingerprints it.
///
/// Built once at startup and passed by reference to the components that need
/// it. Unknown discriminators are an error, never a default.
pub struct TypeRegistry {
    kinds: HashMap<String, Box<dyn RecordKind>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self {
            kinds: HashMap::new(),
        }
    }

    /// Registry with every record type this engine knows how to fingerprint.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        registry.register("basal", Box::new(StandardKind::new(["deliveryType"])));
        registry.register("bolus", Box::new(StandardKind::new(["subType"])));
        registry.register("deviceEvent", Box::new(StandardKind::new(["subType"])));
        registry.register("bloodKetone", Box::new(StandardKind::new(["units", "value"])));
        registry.register("cbg", Box::new(GlucoseKind));
        registry.register("smbg", Box::new(GlucoseKind));
        registry.register("pumpSettings", Box::new(PumpSettingsKind));

        let no_extra: [&str; 0] = [];
        for record_type in [
            "cgmSettings",
            "food",
            "insulin",
            "physicalActivity",
            "reportedState",
            "wizard",
        ] {
            registry.register(record_type, Box::new(StandardKind::new(no_extra)));
        }

        registry
    }

    pub fn register(&mut self, record_type: impl Into<String>, kind: Box<dyn RecordKind>) {
        self.kinds.insert(record_type.into(), kind);
    }

    /// Register (or replace) standard kinds from an identity table mapping a
    /// type discriminator to the extra fields that follow the base fields.
    pub fn register_identity_table(&mut self, table: &BTreeMap<String, Vec<String>>) {
        for (record_type, extra_fields) in table {
            self.register(
                record_type.clone(),
                Box::new(StandardKind::new(extra_fields.iter().cloned())),
            );
        }
    }

    pub fn lookup(&self, record_type: &str) -> Result<&dyn RecordKind, TransformError> {
        self.kinds
            .get(record_type)
            .map(|kind| kind.as_ref())
            .ok_or_else(|| TransformError::UnknownType(record_type.to_string()))
    }

    pub fn record_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.kinds.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    fn values(fields: &[IdentityField]) -> Vec<&str> {
        fields.iter().map(|f| f.value.as_str()).collect()
    }

    #[test]
    fn test_basal_identity_fields_in_order() {
        let registry = TypeRegistry::with_defaults();
        let record = doc(json!({
            "_userId": "u1", "deviceId": "d1", "time": "2024-01-01T00:00:00Z",
            "type": "basal", "deliveryType": "scheduled", "rate": 0.8
        }));
        let fields = registry.lookup("basal").unwrap().identity_fields("basal", &record).unwrap();
        assert_eq!(
            values(&fields),
            vec!["u1", "d1", "2024-01-01T00:00:00.000Z", "basal", "scheduled"]
        );
    }

    #[test]
    fn test_missing_and_empty_identity_fields() {
        let registry = TypeRegistry::with_defaults();
        let kind = registry.lookup("bolus").unwrap();

        let record = doc(json!({"_userId": "u1", "time": "2024-01-01T00:00:00Z", "type": "bolus", "subType": "normal"}));
        match kind.identity_fields("bolus", &record) {
            Err(TransformError::MissingIdentityField { field, .. }) => assert_eq!(field, "deviceId"),
            other => panic!("unexpected {:?}", other),
        }

        let record = doc(json!({"_userId": "u1", "deviceId": "d", "time": "2024-01-01T00:00:00Z", "type": "bolus", "subType": "  "}));
        match kind.identity_fields("bolus", &record) {
            Err(TransformError::MissingIdentityField { field, .. }) => assert_eq!(field, "subType"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_object_identity_field_is_invalid() {
        let registry = TypeRegistry::with_defaults();
        let record = doc(json!({"_userId": "u1", "deviceId": {"id": 1}, "time": "2024-01-01T00:00:00Z", "type": "food"}));
        assert!(matches!(
            registry.lookup("food").unwrap().identity_fields("food", &record),
            Err(TransformError::InvalidIdentityField { .. })
        ));
    }

    #[test]
    fn test_numeric_identity_field_ignores_notation() {
        let registry = TypeRegistry::with_defaults();
        let kind = registry.lookup("bloodKetone").unwrap();
        let record = |value: &str| {
            serde_json::from_str::<Document>(&format!(
                r#"{{"_userId": "u", "deviceId": "d", "time": "2024-01-01T00:00:00Z",
                    "type": "bloodKetone", "units": "mmol/L", "value": {}}}"#,
                value
            ))
            .unwrap()
        };

        let integer = kind.identity_fields("bloodKetone", &record("1")).unwrap();
        let float = kind.identity_fields("bloodKetone", &record("1.0")).unwrap();
        assert_eq!(integer, float);
        assert_eq!(integer.last().unwrap().value, "1");
    }

    #[test]
    fn test_glucose_identity_ignores_unit_system() {
        let registry = TypeRegistry::with_defaults();
        let kind = registry.lookup("cbg").unwrap();
        let mgdl = doc(json!({"_userId": "u", "deviceId": "d", "time": "2024-01-01T00:00:00Z", "type": "cbg", "units": "mg/dL", "value": 100}));
        let mmoll = doc(json!({"_userId": "u", "deviceId": "d", "time": "2024-01-01T00:00:00Z", "type": "cbg", "units": "mmol/L", "value": 100.0 / normalize::MGDL_PER_MMOLL}));
        assert_eq!(
            kind.identity_fields("cbg", &mgdl).unwrap(),
            kind.identity_fields("cbg", &mmoll).unwrap()
        );
    }

    #[test]
    fn test_pump_settings_normalize() {
        let registry = TypeRegistry::with_defaults();
        let mut record = doc(json!({
            "type": "pumpSettings",
            "bolus": {"amountMaximum": {"value": 10}},
            "sleepSchedules": {"weekday": {"enabled": true, "days": ["Friday", "monday"]}}
        }));
        registry.lookup("pumpSettings").unwrap().normalize("pumpSettings", &mut record).unwrap();
        assert_eq!(
            record,
            doc(json!({
                "type": "pumpSettings",
                "boluses": {"amountMaximum": {"value": 10}},
                "sleepSchedules": {"weekday": {"enabled": true, "days": ["monday", "friday"]}}
            }))
        );
    }

    #[test]
    fn test_pump_settings_unknown_day_surfaces_value() {
        let registry = TypeRegistry::with_defaults();
        let mut record = doc(json!({
            "type": "pumpSettings",
            "sleepSchedules": {"1": {"days": ["mon"]}}
        }));
        let err = registry
            .lookup("pumpSettings")
            .unwrap()
            .normalize("pumpSettings", &mut record)
            .unwrap_err();
        assert_eq!(
            err,
            TransformError::UnknownDayOfWeek {
                record_type: "pumpSettings".to_string(),
                schedule: "1".to_string(),
                value: "mon".to_string(),
            }
        );
        assert!(err.to_string().contains("mon"));
    }

    #[test]
    fn test_unknown_type_is_error() {
        let registry = TypeRegistry::with_defaults();
        assert_eq!(
            registry.lookup("mystery").err(),
            Some(TransformError::UnknownType("mystery".to_string()))
        );
    }

    #[test]
    fn test_identity_table_overrides_defaults() {
        let mut registry = TypeRegistry::with_defaults();
        let mut table = BTreeMap::new();
        table.insert("food".to_string(), vec!["nutrition.carbohydrate.net".to_string()]);
        table.insert("water".to_string(), vec!["amount.value".to_string()]);
        registry.register_identity_table(&table);

        assert!(registry.record_types().contains(&"water"));
        let record = doc(json!({
            "_userId": "u", "deviceId": "d", "time": "2024-01-01T00:00:00Z", "type": "food",
            "nutrition": {"carbohydrate": {"net": 30}}
        }));
        let fields = registry.lookup("food").unwrap().identity_fields("food", &record).unwrap();
        assert_eq!(fields.last().unwrap().value, "30");
    }
}
