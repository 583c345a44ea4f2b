//! Rebuild the mirror tree from a fresh schema.
//!
//! The old tree is never edited in place. A new tree is compiled from the
//! schema and selected state from the old one is copied across by path:
//!
//! - `preserve_values = true`: every stored value and group flag whose path
//!   still exists (and whose value still fits) is restored.
//! - `preserve_values = false`: only the listen-enabled and expanded flags
//!   of groups are restored; values come from the schema's `VALUE` fields.
//!
//! The schema is authoritative for structure in both modes.

use crate::schema;
use crate::tree::MirrorTree;

/// Compile `schema` into a new tree, carrying state over from `old`.
pub fn reconcile(old: &MirrorTree, schema: &serde_json::Value, preserve_values: bool) -> MirrorTree {
    let mut tree = schema::compile(schema);
    carry_over(&mut tree, old, preserve_values);
    tree
}

/// Copy group flags (and values when `preserve_values`) from `old` into a
/// freshly compiled `tree`.
///
/// Split from [`reconcile`] so the engine can compile without holding the
/// tree lock and carry state across under it.
pub fn carry_over(tree: &mut MirrorTree, old: &MirrorTree, preserve_values: bool) {
    let state = old.snapshot();
    let groups = tree.apply_flags(&state);
    if preserve_values {
        let values = tree.apply_values(&state);
        log::debug!("Reconciled tree: restored {values} values and {groups} group flags");
    } else {
        log::debug!("Reconciled tree: restored {groups} group flags");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Value;
    use serde_json::json;

    fn schema() -> serde_json::Value {
        json!({
            "x": {
                "CONTENTS": {
                    "y": {"TYPE": "i", "VALUE": 1},
                    "inner": {"CONTENTS": {"z": {"TYPE": "f", "VALUE": 0.5}}}
                }
            },
            "w": {"CONTENTS": {"v": {"TYPE": "s", "VALUE": "a"}}}
        })
    }

    #[test]
    fn test_preserve_values_keeps_prior_value() {
        let mut old = schema::compile(&schema());
        old.parameter_mut("x/y").unwrap().set_value(&Value::Int(7));

        let tree = reconcile(&old, &schema(), true);
        assert_eq!(tree.parameter("x/y").unwrap().value, Value::Int(7));
    }

    #[test]
    fn test_without_preserve_values_reset_but_flags_kept() {
        let mut old = schema::compile(&schema());
        old.parameter_mut("x/y").unwrap().set_value(&Value::Int(7));
        old.group_mut("x/inner").unwrap().listen_enabled = true;
        old.group_mut("w").unwrap().expanded = true;

        let tree = reconcile(&old, &schema(), false);
        assert_eq!(tree.parameter("x/y").unwrap().value, Value::Int(1));
        assert!(tree.group("x/inner").unwrap().listen_enabled);
        assert!(tree.group("w").unwrap().expanded);
        assert!(!tree.group("x").unwrap().listen_enabled);
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let mut old = schema::compile(&schema());
        old.group_mut("x").unwrap().listen_enabled = true;
        old.group_mut("x/inner").unwrap().expanded = true;
        old.parameter_mut("w/v").unwrap().set_value(&Value::String("changed".to_string()));

        let once = reconcile(&old, &schema(), false);
        let twice = reconcile(&once, &schema(), false);
        assert_eq!(once, twice);
        assert_eq!(twice.parameter("w/v").unwrap().value, Value::String("a".to_string()));
        assert!(twice.group("x").unwrap().listen_enabled);
    }

    #[test]
    fn test_structural_change_skips_missing_paths() {
        let mut old = schema::compile(&schema());
        old.parameter_mut("x/y").unwrap().set_value(&Value::Int(9));
        old.group_mut("w").unwrap().listen_enabled = true;

        let new_schema = json!({
            "x": {"CONTENTS": {"y": {"TYPE": "s", "VALUE": "text"}}},
            "added": {"CONTENTS": {}}
        });
        let tree = reconcile(&old, &new_schema, true);
        assert!(tree.group("w").is_none());
        // Int 9 still renders into the new string leaf
        assert_eq!(tree.parameter("x/y").unwrap().value, Value::String("9".to_string()));
        assert!(!tree.group("added").unwrap().listen_enabled);
    }

    #[test]
    fn test_preserve_values_also_restores_flags() {
        let mut old = schema::compile(&schema());
        old.group_mut("w").unwrap().listen_enabled = true;
        let tree = reconcile(&old, &schema(), true);
        assert!(tree.group("w").unwrap().listen_enabled);
    }

    #[test]
    fn test_old_tree_untouched() {
        let old = schema::compile(&schema());
        let before = old.clone();
        let _ = reconcile(&old, &json!({}), true);
        assert_eq!(old, before);
    }
}
