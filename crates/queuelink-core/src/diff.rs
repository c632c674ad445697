//! # Diff Reconstruction
//!
//! Generator jobs on the diff-capable protocol send intermediate outputs as
//! structural diffs against the previous snapshot of the same output slot.
//!
//! A diff is a JSON list of edits, each `[action, path, value]`:
//!
//! | action    | empty path              | non-empty path                         |
//! |-----------|-------------------------|----------------------------------------|
//! | `replace` | value becomes `value`   | set key / index                        |
//! | `append`  | string concat / push    | string concat / push at the target     |
//! | `add`     | —                       | insert into array / set object key     |
//! | `delete`  | —                       | remove array element / object key      |
//!
//! [`DiffReconstructor`] keeps the last full snapshot per event id and slot.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use serde_json::Value;
use thiserror::Error;

use crate::ids::EventId;

/// Errors raised while applying a diff.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DiffError {
    /// The diff is not a list of `[action, path, value]` edits.
    #[error("malformed diff: {0}")]
    Malformed(String),
    /// The action name is not recognized.
    #[error("unknown diff action '{0}'")]
    UnknownAction(String),
    /// A path segment does not exist in the target.
    #[error("diff path not found: {0}")]
    PathNotFound(String),
    /// `append` against a value that cannot be appended to.
    #[error("cannot append to {0}")]
    InvalidAppend(&'static str),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Action {
    Replace,
    Append,
    Add,
    Delete,
}

impl Action {
    fn parse(name: &str) -> Result<Self, DiffError> {
        match name {
            "replace" => Ok(Self::Replace),
            "append" => Ok(Self::Append),
            "add" => Ok(Self::Add),
            "delete" => Ok(Self::Delete),
            other => Err(DiffError::UnknownAction(other.to_owned())),
        }
    }
}

/// Apply a diff (list of edits) to `target`, returning the new value.
pub fn apply_diff(mut target: Value, diff: &Value) -> Result<Value, DiffError> {
    let edits = diff
        .as_array()
        .ok_or_else(|| DiffError::Malformed("diff is not a list".into()))?;
    for edit in edits {
        let (action, path, value) = parse_edit(edit)?;
        target = apply_edit(target, path, action, value)?;
    }
    Ok(target)
}

fn parse_edit(edit: &Value) -> Result<(Action, &[Value], &Value), DiffError> {
    let parts = edit
        .as_array()
        .ok_or_else(|| DiffError::Malformed(format!("edit is not a list: {edit}")))?;
    let action = parts
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| DiffError::Malformed(format!("edit has no action: {edit}")))?;
    let path = parts
        .get(1)
        .and_then(Value::as_array)
        .ok_or_else(|| DiffError::Malformed(format!("edit has no path: {edit}")))?;
    let value = parts.get(2).unwrap_or(&Value::Null);
    Ok((Action::parse(action)?, path.as_slice(), value))
}

fn apply_edit(
    mut target: Value,
    path: &[Value],
    action: Action,
    value: &Value,
) -> Result<Value, DiffError> {
    let Some((last, parents)) = path.split_last() else {
        return match action {
            Action::Replace => Ok(value.clone()),
            Action::Append => {
                append(&mut target, value)?;
                Ok(target)
            }
            Action::Add | Action::Delete => Err(DiffError::Malformed(
                "add/delete require a non-empty path".into(),
            )),
        };
    };

    let mut current = &mut target;
    for segment in parents {
        current = child_mut(current, segment)?;
    }

    match action {
        Action::Replace => *child_mut(current, last)? = value.clone(),
        Action::Append => append(child_mut(current, last)?, value)?,
        Action::Add => match current {
            Value::Array(items) => {
                let index = array_index(last, items.len() + 1)?;
                items.insert(index, value.clone());
            }
            Value::Object(map) => {
                let _ = map.insert(object_key(last), value.clone());
            }
            _ => return Err(DiffError::PathNotFound(last.to_string())),
        },
        Action::Delete => match current {
            Value::Array(items) => {
                let index = array_index(last, items.len())?;
                let _ = items.remove(index);
            }
            Value::Object(map) => {
                let _ = map
                    .remove(&object_key(last))
                    .ok_or_else(|| DiffError::PathNotFound(last.to_string()))?;
            }
            _ => return Err(DiffError::PathNotFound(last.to_string())),
        },
    }
    Ok(target)
}

fn child_mut<'a>(parent: &'a mut Value, segment: &Value) -> Result<&'a mut Value, DiffError> {
    match parent {
        Value::Array(items) => {
            let index = array_index(segment, items.len())?;
            Ok(&mut items[index])
        }
        Value::Object(map) => map
            .get_mut(&object_key(segment))
            .ok_or_else(|| DiffError::PathNotFound(segment.to_string())),
        _ => Err(DiffError::PathNotFound(segment.to_string())),
    }
}

/// Resolve an index segment, requiring `index < bound`.
fn array_index(segment: &Value, bound: usize) -> Result<usize, DiffError> {
    let index = match segment {
        Value::Number(n) => n.as_u64().and_then(|n| usize::try_from(n).ok()),
        Value::String(s) => s.parse().ok(),
        _ => None,
    };
    index
        .filter(|&i| i < bound)
        .ok_or_else(|| DiffError::PathNotFound(segment.to_string()))
}

fn object_key(segment: &Value) -> String {
    match segment {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn append(target: &mut Value, value: &Value) -> Result<(), DiffError> {
    match (target, value) {
        (Value::String(existing), Value::String(more)) => {
            existing.push_str(more);
            Ok(())
        }
        (Value::Array(items), more) => {
            items.push(more.clone());
            Ok(())
        }
        (Value::String(_), _) => Err(DiffError::InvalidAppend("string with non-string value")),
        (Value::Null, _) => Err(DiffError::InvalidAppend("null")),
        (Value::Object(_), _) => Err(DiffError::InvalidAppend("object")),
        _ => Err(DiffError::InvalidAppend("scalar")),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// DiffReconstructor
// ─────────────────────────────────────────────────────────────────────────────

/// Last full snapshot per output slot, keyed by event id.
#[derive(Debug, Default)]
pub struct DiffReconstructor {
    snapshots: HashMap<EventId, Vec<Value>>,
}

impl DiffReconstructor {
    /// Create an empty reconstructor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild full slot values in `output["data"]` in place.
    ///
    /// The first call for an event id stores the slots as-is. Later calls
    /// treat each slot as a diff against the stored snapshot of that slot and
    /// replace it with the merged result.
    pub fn apply(&mut self, event_id: &EventId, output: &mut Value) -> Result<(), DiffError> {
        let slots = output
            .get_mut("data")
            .and_then(Value::as_array_mut)
            .ok_or_else(|| DiffError::Malformed("output has no data list".into()))?;

        let stored = match self.snapshots.entry(event_id.clone()) {
            Entry::Vacant(entry) => {
                let _ = entry.insert(slots.clone());
                return Ok(());
            }
            Entry::Occupied(entry) => entry.into_mut(),
        };

        for (index, slot) in slots.iter_mut().enumerate() {
            let merged = match stored.get(index) {
                Some(previous) => apply_diff(previous.clone(), slot)?,
                None => slot.clone(),
            };
            if index < stored.len() {
                stored[index] = merged.clone();
            } else {
                stored.push(merged.clone());
            }
            *slot = merged;
        }
        Ok(())
    }

    /// Last reconstructed slots for `event_id`.
    pub fn snapshot(&self, event_id: &EventId) -> Option<&[Value]> {
        self.snapshots.get(event_id).map(Vec::as_slice)
    }

    /// Drop state for an event id that reached a terminal status.
    pub fn discard(&mut self, event_id: &EventId) {
        let _ = self.snapshots.remove(event_id);
    }

    /// Number of event ids currently tracked.
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    /// Whether no event id is tracked.
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn replace_whole_value() {
        let out = apply_diff(json!("old"), &json!([["replace", [], "new"]])).unwrap();
        assert_eq!(out, json!("new"));
    }

    #[test]
    fn append_to_root_string() {
        let out = apply_diff(json!("ab"), &json!([["append", [], "c"]])).unwrap();
        assert_eq!(out, json!("abc"));
    }

    #[test]
    fn append_nested_key() {
        let out = apply_diff(json!({"text": "a"}), &json!([["append", ["text"], "b"]])).unwrap();
        assert_eq!(out, json!({"text": "ab"}));
    }

    #[test]
    fn append_to_array_pushes() {
        let out = apply_diff(json!([[1, "x"]]), &json!([["append", [], [2, "y"]]])).unwrap();
        assert_eq!(out, json!([[1, "x"], [2, "y"]]));
    }

    #[test]
    fn nested_index_set() {
        let base = json!([["user", "hi"], ["bot", "hel"]]);
        let out = apply_diff(base, &json!([["append", [1, 1], "lo"]])).unwrap();
        assert_eq!(out, json!([["user", "hi"], ["bot", "hello"]]));
    }

    #[test]
    fn add_and_delete() {
        let base = json!({"items": [1, 3]});
        let out = apply_diff(
            base,
            &json!([["add", ["items", 1], 2], ["add", ["extra"], true], ["delete", ["items", 0], null]]),
        )
        .unwrap();
        assert_eq!(out, json!({"items": [2, 3], "extra": true}));
    }

    #[test]
    fn string_index_segments_address_arrays() {
        let out = apply_diff(json!(["a", "b"]), &json!([["replace", ["1"], "z"]])).unwrap();
        assert_eq!(out, json!(["a", "z"]));
    }

    #[test]
    fn missing_path_is_an_error() {
        let err = apply_diff(json!({"a": 1}), &json!([["append", ["b"], "x"]])).unwrap_err();
        assert!(matches!(err, DiffError::PathNotFound(_)));
    }

    #[test]
    fn unknown_action_is_an_error() {
        let err = apply_diff(json!({}), &json!([["merge", [], {}]])).unwrap_err();
        assert_eq!(err, DiffError::UnknownAction("merge".into()));
    }

    #[test]
    fn non_list_diff_is_malformed() {
        assert!(matches!(
            apply_diff(json!({}), &json!({"x": 1})),
            Err(DiffError::Malformed(_))
        ));
    }

    #[test]
    fn reconstructor_first_output_is_base() {
        let mut rec = DiffReconstructor::new();
        let id = EventId::from("E1");
        let mut output = json!({"data": [{"text": "a"}]});
        rec.apply(&id, &mut output).unwrap();
        assert_eq!(output, json!({"data": [{"text": "a"}]}));
        assert_eq!(rec.snapshot(&id).unwrap(), &[json!({"text": "a"})]);
    }

    #[test]
    fn reconstructor_merges_following_diffs() {
        let mut rec = DiffReconstructor::new();
        let id = EventId::from("E1");
        rec.apply(&id, &mut json!({"data": [{"text": "a"}]})).unwrap();

        let mut next = json!({"data": [[["append", ["text"], "b"]]]});
        rec.apply(&id, &mut next).unwrap();
        assert_eq!(next, json!({"data": [{"text": "ab"}]}));

        let mut next = json!({"data": [[["append", ["text"], "c"]]]});
        rec.apply(&id, &mut next).unwrap();
        assert_eq!(next, json!({"data": [{"text": "abc"}]}));
    }

    #[test]
    fn reconstructor_isolates_event_ids() {
        let mut rec = DiffReconstructor::new();
        let a = EventId::from("A");
        let b = EventId::from("B");
        rec.apply(&a, &mut json!({"data": ["x"]})).unwrap();
        rec.apply(&b, &mut json!({"data": ["y"]})).unwrap();

        let mut next_b = json!({"data": [[["append", [], "2"]]]});
        rec.apply(&b, &mut next_b).unwrap();
        let mut next_a = json!({"data": [[["append", [], "1"]]]});
        rec.apply(&a, &mut next_a).unwrap();

        assert_eq!(next_a, json!({"data": ["x1"]}));
        assert_eq!(next_b, json!({"data": ["y2"]}));
    }

    #[test]
    fn reconstructor_discard_resets_base() {
        let mut rec = DiffReconstructor::new();
        let id = EventId::from("E1");
        rec.apply(&id, &mut json!({"data": ["a"]})).unwrap();
        rec.discard(&id);
        assert!(rec.is_empty());

        let mut fresh = json!({"data": ["z"]});
        rec.apply(&id, &mut fresh).unwrap();
        assert_eq!(fresh, json!({"data": ["z"]}));
    }

    #[test]
    fn reconstructor_rejects_output_without_data() {
        let mut rec = DiffReconstructor::new();
        assert!(rec.apply(&EventId::from("E"), &mut json!({"error": "x"})).is_err());
    }

    fn edit_strategy() -> impl Strategy<Value = Value> {
        prop_oneof![
            "[a-z]{0,4}".prop_map(|s| json!(["append", ["text"], s])),
            "[a-z]{0,4}".prop_map(|s| json!(["replace", ["text"], s])),
            any::<u8>().prop_map(|n| json!(["append", ["items"], n])),
        ]
    }

    proptest! {
        #[test]
        fn sequential_application_matches_batched(
            edits in proptest::collection::vec(edit_strategy(), 0..12),
            split in 0usize..12,
        ) {
            let base = json!({"text": "", "items": []});
            let split = split.min(edits.len());
            let (first, second) = edits.split_at(split);

            let stepwise = apply_diff(
                apply_diff(base.clone(), &Value::Array(first.to_vec())).unwrap(),
                &Value::Array(second.to_vec()),
            )
            .unwrap();
            let batched = apply_diff(base, &Value::Array(edits.clone())).unwrap();
            prop_assert_eq!(stepwise, batched);
        }
    }
}
