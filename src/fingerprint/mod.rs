pub mod normalize;
pub mod registry;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use strum::AsRefStr;
use thiserror::Error;

use crate::store::document::{self, Document};
use crate::store::{PathConflict, RecordFilter, RecordUpdate, UpdateOp};

pub use registry::{RecordKind, TypeRegistry};

/// Path of the deduplication fingerprint on every migrated record.
pub const FINGERPRINT_PATH: &str = "deduplicator.hash";

/// Separator placed between identity field values before hashing.
const IDENTITY_SEPARATOR: &str = "|";

/// Why a single record could not be transformed.
#[derive(Error, Debug, Clone, PartialEq, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum TransformError {
    #[error("record has no string _id")]
    MissingId,

    #[error("record has no type discriminator")]
    MissingType,

    #[error("unknown record type '{0}'")]
    UnknownType(String),

    #[error("{record_type}: missing or empty identity field '{field}'")]
    MissingIdentityField { record_type: String, field: String },

    #[error("{record_type}: invalid identity field '{field}': {reason}")]
    InvalidIdentityField {
        record_type: String,
        field: String,
        reason: String,
    },

    #[error("{record_type}: invalid time '{value}': {reason}")]
    InvalidTime {
        record_type: String,
        value: String,
        reason: String,
    },

    #[error("{record_type}: invalid glucose reading: {reason}")]
    InvalidGlucose { record_type: String, reason: String },

    #[error("{record_type}: unrecognised day of week '{value}' in schedule '{schedule}'")]
    UnknownDayOfWeek {
        record_type: String,
        schedule: String,
        value: String,
    },

    #[error("{record_type}: {conflict}")]
    FieldConflict {
        record_type: String,
        conflict: PathConflict,
    },

    #[error("invalid rollback stash in '{section}': {reason}")]
    InvalidRollbackStash { section: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentityField {
    pub name: String,
    pub value: String,
}

/// Deterministic fingerprint of an ordered identity field list:
/// base64(sha256(v1|v2|...|vn)).
pub fn identity_hash(fields: &[IdentityField]) -> String {
    let joined = fields
        .iter()
        .map(|f| f.value.as_str())
        .collect::<Vec<_>>()
        .join(IDENTITY_SEPARATOR);

    let mut hasher = Sha256::new();
    hasher.update(joined.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// One record's pending change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateData {
    pub id: String,
    pub record_type: String,
    pub filter: RecordFilter,
    pub forward: Vec<UpdateOp>,
    /// Operations that restore every field `forward` touches.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reverse: Option<Vec<UpdateOp>>,
}

impl UpdateData {
    pub fn to_record_update(&self) -> RecordUpdate {
        RecordUpdate {
            filter: self.filter.clone(),
            ops: self.forward.clone(),
        }
    }
}

/// Builds per-record updates: the fingerprint, shape fixes, and (optionally)
/// the reverse operations stashed for rollback.
pub struct FingerprintBuilder<'a> {
    registry: &'a TypeRegistry,
    guard_field: String,
    rollback_section: String,
    capture_rollback: bool,
}

impl<'a> FingerprintBuilder<'a> {
    pub fn new(
        registry: &'a TypeRegistry,
        guard_field: impl Into<String>,
        rollback_section: impl Into<String>,
        capture_rollback: bool,
    ) -> Self {
        Self {
            registry,
            guard_field: guard_field.into(),
            rollback_section: rollback_section.into(),
            capture_rollback,
        }
    }

    /// Compute the fingerprint of a record without building an update.
    #[cfg(test)]
    pub fn fingerprint(&self, record: &Document) -> Result<String, TransformError> {
        let record_type = document::record_type(record).ok_or(TransformError::MissingType)?;
        let kind = self.registry.lookup(record_type)?;

        let mut normalized = record.clone();
        kind.normalize(record_type, &mut normalized)?;
        Ok(identity_hash(&kind.identity_fields(record_type, &normalized)?))
    }

    /// Build the forward update for an unmigrated record.
    pub fn build_update(&self, record: &Document) -> Result<UpdateData, TransformError> {
        let id = document::record_id(record).ok_or(TransformError::MissingId)?;
        let record_type = document::record_type(record).ok_or(TransformError::MissingType)?;
        let kind = self.registry.lookup(record_type)?;

        let mut normalized = record.clone();
        kind.normalize(record_type, &mut normalized)?;
        let hash = identity_hash(&kind.identity_fields(record_type, &normalized)?);

        let mut forward = Self::shape_ops(record, &normalized);
        forward.push(UpdateOp::set(FINGERPRINT_PATH, Value::String(hash)));

        // Reject the update up front if any write would run into a scalar
        let mut scratch = record.clone();
        for op in &forward {
            op.apply(&mut scratch)
                .map_err(|conflict| TransformError::FieldConflict {
                    record_type: record_type.to_string(),
                    conflict,
                })?;
        }

        let reverse = if self.capture_rollback {
            let reverse = Self::capture_reverse(record, &forward);
            let stash = serde_json::to_value(&reverse).map_err(|e| {
                TransformError::InvalidRollbackStash {
                    section: self.rollback_section.clone(),
                    reason: e.to_string(),
                }
            })?;
            forward.push(UpdateOp::set(self.rollback_section.clone(), stash));
            Some(reverse)
        } else {
            None
        };

        Ok(UpdateData {
            id: id.to_string(),
            record_type: record_type.to_string(),
            filter: self.filter_for(id, record),
            forward,
            reverse,
        })
    }

    /// Build the update that undoes a previous forward migration, using the
    /// reverse operations stashed on the record. The stash itself is removed.
    pub fn build_rollback(&self, record: &Document) -> Result<UpdateData, TransformError> {
        let id = document::record_id(record).ok_or(TransformError::MissingId)?;
        let record_type = document::record_type(record).unwrap_or_default();

        let invalid = |reason: String| TransformError::InvalidRollbackStash {
            section: self.rollback_section.clone(),
            reason,
        };
        let stash = document::get_path(record, &self.rollback_section)
            .ok_or_else(|| invalid("missing".to_string()))?;
        let mut forward: Vec<UpdateOp> =
            serde_json::from_value(stash.clone()).map_err(|e| invalid(e.to_string()))?;

        if forward.iter().any(|op| op.path() == self.rollback_section) {
            return Err(invalid("stash rewrites its own section".to_string()));
        }
        forward.push(UpdateOp::unset(self.rollback_section.clone()));

        Ok(UpdateData {
            id: id.to_string(),
            record_type: record_type.to_string(),
            filter: self.filter_for(id, record),
            forward,
            reverse: None,
        })
    }

    fn filter_for(&self, id: &str, record: &Document) -> RecordFilter {
        RecordFilter {
            id: id.to_string(),
            guard_field: self.guard_field.clone(),
            guard_value: document::get_path(record, &self.guard_field).cloned(),
        }
    }

    /// Top-level set/unset operations turning `original` into `normalized`.
    fn shape_ops(original: &Document, normalized: &Document) -> Vec<UpdateOp> {
        let mut keys: Vec<&String> = original.keys().chain(normalized.keys()).collect();
        keys.sort();
        keys.dedup();

        keys.into_iter()
            .filter(|key| original.get(*key) != normalized.get(*key))
            .map(|key| match normalized.get(key) {
                Some(value) => UpdateOp::set(key.clone(), value.clone()),
                None => UpdateOp::unset(key.clone()),
            })
            .collect()
    }

    /// Operations restoring the pre-update state of every path `forward` touches,
    /// in the reverse of the order the forward operations apply.
    fn capture_reverse(original: &Document, forward: &[UpdateOp]) -> Vec<UpdateOp> {
        let mut reverse: Vec<UpdateOp> = Vec::with_capacity(forward.len());
        for op in forward.iter().rev() {
            let restore = match document::first_missing_prefix(original, op.path()) {
                Some(prefix) => UpdateOp::unset(prefix),
                None => match document::get_path(original, op.path()) {
                    Some(value) => UpdateOp::set(op.path(), value.clone()),
                    None => continue,
                },
            };
            if !reverse.contains(&restore) {
                reverse.push(restore);
            }
        }
        reverse
    }
}
