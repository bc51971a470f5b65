use serde_json::{Map, Value};
use thiserror::Error;

/// A raw record as read from the store: an untyped field map.
pub type Document = Map<String, Value>;

/// Field holding the record identifier.
pub const ID_FIELD: &str = "_id";

/// Field holding the record type discriminator.
pub const TYPE_FIELD: &str = "type";

/// Field holding the owning user's identifier.
pub const USER_ID_FIELD: &str = "_userId";

#[derive(Error, Debug, Clone, PartialEq)]
#[error("cannot write '{path}': '{blocked_at}' is not an object")]
pub struct PathConflict {
    pub path: String,
    pub blocked_at: String,
}

pub fn record_id(doc: &Document) -> Option<&str> {
    doc.get(ID_FIELD).and_then(Value::as_str)
}

pub fn record_type(doc: &Document) -> Option<&str> {
    doc.get(TYPE_FIELD).and_then(Value::as_str)
}

/// Look up a dotted path (`a.b.c`) in a document.
pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = doc.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Write `value` at a dotted path, creating intermediate objects as needed.
pub fn set_path(doc: &mut Document, path: &str, value: Value) -> Result<(), PathConflict> {
    let segments: Vec<&str> = path.split('.').collect();
    let (last, parents) = match segments.split_last() {
        Some(split) => split,
        None => return Ok(()),
    };

    let mut current = doc;
    for (depth, segment) in parents.iter().enumerate() {
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        current = match entry {
            Value::Object(map) => map,
            _ => {
                return Err(PathConflict {
                    path: path.to_string(),
                    blocked_at: segments[..=depth].join("."),
                })
            }
        };
    }

    current.insert(last.to_string(), value);
    Ok(())
}

/// Remove the value at a dotted path. Returns true if something was removed.
pub fn unset_path(doc: &mut Document, path: &str) -> bool {
    let segments: Vec<&str> = path.split('.').collect();
    let (last, parents) = match segments.split_last() {
        Some(split) => split,
        None => return false,
    };

    let mut current = doc;
    for segment in parents {
        current = match current.get_mut(*segment) {
            Some(Value::Object(map)) => map,
            _ => return false,
        };
    }

    current.remove(*last).is_some()
}

/// Returns the shortest prefix of `path` that does not exist in `doc`, or
/// `None` when the full path is present.
///
/// Unsetting that prefix undoes a `set_path` of `path` exactly, including any
/// intermediate objects the set had to create.
pub fn first_missing_prefix(doc: &Document, path: &str) -> Option<String> {
    let segments: Vec<&str> = path.split('.').collect();
    let mut current = doc;
    for (depth, segment) in segments.iter().enumerate() {
        match current.get(*segment) {
            None => return Some(segments[..=depth].join(".")),
            Some(value) if depth + 1 < segments.len() => match value {
                Value::Object(map) => current = map,
                // A scalar where an object is expected; the whole scalar is what gets replaced
                _ => return None,
            },
            Some(_) => {}
        }
    }
    None
}
