//! Schema compiler: OSCQuery JSON description → mirror tree nodes.
//!
//! A node object with a `CONTENTS` map is a group; anything else is a leaf
//! described by `TYPE`, `VALUE`, `RANGE`, `ACCESS` and `DESCRIPTION`.
//! Leaves whose tag we do not understand, or whose description cannot
//! produce a parameter, are skipped without affecting their siblings.

use serde_json::{Map, Value as Json};

use crate::codec::{ParameterKind, TypeTag, Value};
use crate::tree::{Access, Constraint, EnumOption, Group, MirrorTree, Node, Parameter, Range};

/// Compile a whole structure response into a tree.
///
/// The root's `CONTENTS` map is used when present; otherwise the root
/// object itself is taken as the contents map.
pub fn compile(root: &Json) -> MirrorTree {
    let mut group = Group::new("", "");
    match root.get("CONTENTS").and_then(Json::as_object) {
        Some(contents) => fill_group(&mut group, contents),
        None => {
            if let Some(contents) = root.as_object() {
                fill_group(&mut group, contents);
            } else {
                log::warn!("Structure root is not a JSON object, tree left empty");
            }
        }
    }
    MirrorTree::new(group)
}

fn fill_group(group: &mut Group, contents: &Map<String, Json>) {
    for (key, node) in contents {
        if !node.is_object() {
            log::debug!("Skipping non-object schema entry '{key}'");
            continue;
        }

        if let Some(children) = node.get("CONTENTS").and_then(Json::as_object) {
            let mut child = Group::new(key.as_str(), display_label(key, node));
            fill_group(&mut child, children);
            group.add_child(Node::Group(child));
        } else if let Some(param) = compile_parameter(key, node) {
            group.add_child(Node::Parameter(param));
        }
    }
}

fn display_label(key: &str, node: &Json) -> String {
    match node.get("DESCRIPTION").and_then(Json::as_str) {
        Some(desc) if !desc.is_empty() => desc.to_string(),
        _ => key.to_string(),
    }
}

/// Read a `RANGE` entry's bounds, defaulting to the full 32-bit range.
fn range_of(entry: &Json) -> Range {
    let bound = |name: &str, default: f64| entry.get(name).and_then(Json::as_f64).unwrap_or(default);
    Range {
        min: bound("MIN", Range::FULL.min),
        max: bound("MAX", Range::FULL.max),
    }
}

/// `VALUE` and `RANGE` may each be a single item or an array of items.
fn as_items(field: Option<&Json>) -> Vec<Json> {
    match field {
        Some(Json::Array(items)) => items.clone(),
        Some(other) => vec![other.clone()],
        None => Vec::new(),
    }
}

/// Compile one leaf description. Returns `None` when the node is skipped.
pub fn compile_parameter(key: &str, node: &Json) -> Option<Parameter> {
    let raw_tag = node.get("TYPE").and_then(Json::as_str).unwrap_or_default();
    let Some(tag) = TypeTag::parse(raw_tag) else {
        log::debug!("Skipping '{key}': unsupported type tag {raw_tag:?}");
        return None;
    };

    let values: Vec<Value> = as_items(node.get("VALUE")).iter().map(Value::from_json).collect();
    let ranges = as_items(node.get("RANGE"));
    let access = node
        .get("ACCESS")
        .and_then(Json::as_i64)
        .map_or(Access::ReadWrite, Access::from_code);

    let mut param = Parameter {
        key: key.to_string(),
        label: display_label(key, node),
        tag,
        kind: tag.kind(),
        value: Value::None,
        constraint: Constraint::None,
        access,
    };

    let first = values.first().cloned().unwrap_or(Value::None);

    match tag.kind() {
        ParameterKind::Trigger => {}
        ParameterKind::Int | ParameterKind::Float => {
            param.constraint = Constraint::Ranges(vec![ranges.first().map_or(Range::FULL, range_of)]);
            param.value = if param.kind == ParameterKind::Int {
                Value::Int(0)
            } else {
                Value::Float(0.0)
            };
            if let Some(v) = param.normalize(&first) {
                param.value = v;
            }
        }
        ParameterKind::Point2D | ParameterKind::Point3D => {
            let n = tag.arity();
            param.value = zeros(tag, n);
            if ranges.len() >= n {
                param.constraint = Constraint::Ranges(ranges[..n].iter().map(range_of).collect());
            }
            if values.len() >= n {
                if let Some(v) = param.normalize(&Value::Array(values.clone())) {
                    param.value = v;
                }
            }
        }
        ParameterKind::Color => {
            param.value = compile_color(tag, &values);
        }
        ParameterKind::String | ParameterKind::Enum => {
            let described = ranges.first().filter(|r| r.is_object());
            if let Some(options) = described.and_then(|r| r.get("VALS")).and_then(Json::as_array) {
                param.kind = ParameterKind::Enum;
                param.constraint = Constraint::Options(
                    options
                        .iter()
                        .filter_map(|o| Value::from_json(o).as_text())
                        .map(|v| EnumOption {
                            label: v.clone(),
                            value: v,
                        })
                        .collect(),
                );
                let selected = first.as_text().filter(|t| {
                    param.options().is_some_and(|o| o.iter().any(|opt| &opt.value == t))
                });
                param.value = match selected {
                    Some(t) => Value::String(t),
                    None => match param.options().and_then(|o| o.first()) {
                        Some(opt) => Value::String(opt.value.clone()),
                        None => {
                            log::debug!("Skipping '{key}': enum without options");
                            return None;
                        }
                    },
                };
            } else if described.is_some() {
                log::debug!("Skipping '{key}': string range without VALS");
                return None;
            } else {
                param.value = Value::String(first.as_text().unwrap_or_default());
            }
        }
        ParameterKind::Bool => {
            param.value = Value::Bool(first.as_bool().unwrap_or(tag == TypeTag::True));
        }
    }

    Some(param)
}

fn zeros(tag: TypeTag, n: usize) -> Value {
    let zero = match tag {
        TypeTag::Number { format, .. } if format.is_integer() => Value::Int(0),
        _ => Value::Float(0.0),
    };
    Value::Array(vec![zero; n])
}

fn compile_color(tag: TypeTag, values: &[Value]) -> Value {
    match tag {
        TypeTag::PackedColor => values
            .first()
            .and_then(Value::as_text)
            .and_then(|s| crate::codec::parse_packed_color(&s))
            .map_or_else(Value::black, Value::color_from_bytes),
        TypeTag::Number { format, .. } => {
            if values.len() < 4 {
                return Value::black();
            }
            let mut channels = [0.0f32; 4];
            for (slot, v) in channels.iter_mut().zip(values) {
                let Some(x) = v.as_f32() else {
                    return Value::black();
                };
                *slot = if format.is_integer() { x / 255.0 } else { x };
                *slot = slot.clamp(0.0, 1.0);
            }
            let [r, g, b, a] = channels;
            Value::color(r, g, b, a)
        }
        _ => Value::black(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn leaf(tree: &MirrorTree, path: &str) -> Parameter {
        tree.parameter(path)
            .unwrap_or_else(|| panic!("missing parameter {path}"))
            .clone()
    }

    #[test]
    fn test_float_leaf_with_range() {
        let tree = compile(&json!({"vol": {"TYPE": "f", "VALUE": 0.5, "RANGE": [{"MIN": 0, "MAX": 1}]}}));
        let vol = leaf(&tree, "vol");
        assert_eq!(vol.kind, ParameterKind::Float);
        assert_eq!(vol.value, Value::Float(0.5));
        assert_eq!(vol.ranges(), Some(&[Range { min: 0.0, max: 1.0 }][..]));
    }

    #[test]
    fn test_packed_color_channel_order() {
        let tree = compile(&json!({"col": {"TYPE": "r", "VALUE": "#FF112233"}}));
        let col = leaf(&tree, "col");
        assert_eq!(col.kind, ParameterKind::Color);
        assert_eq!(col.value.rgba_bytes(), Some([0xFF, 0x11, 0x22, 0x33]));
    }

    #[test]
    fn test_root_contents_is_used() {
        let tree = compile(&json!({
            "FULL_PATH": "/",
            "CONTENTS": {"gain": {"TYPE": "i", "VALUE": 3}}
        }));
        assert_eq!(leaf(&tree, "gain").value, Value::Int(3));
        assert!(tree.find("FULL_PATH").is_none());
    }

    #[test]
    fn test_int_without_range_gets_full_range() {
        let tree = compile(&json!({"n": {"TYPE": "i"}}));
        let n = leaf(&tree, "n");
        assert_eq!(n.value, Value::Int(0));
        assert_eq!(n.ranges(), Some(&[Range::FULL][..]));
    }

    #[test]
    fn test_scalar_value_clamped_into_range() {
        let tree = compile(&json!({"n": {"TYPE": "i", "VALUE": 50, "RANGE": {"MIN": 0, "MAX": 10}}}));
        assert_eq!(leaf(&tree, "n").value, Value::Int(10));
    }

    #[test]
    fn test_points_default_to_zero() {
        let tree = compile(&json!({
            "p2": {"TYPE": "ff"},
            "p3": {"TYPE": "iii", "VALUE": [1, 2, 3], "RANGE": [{"MIN": 0, "MAX": 2}, {}, {}]}
        }));
        assert_eq!(
            leaf(&tree, "p2").value,
            Value::Array(vec![Value::Float(0.0), Value::Float(0.0)])
        );
        assert_eq!(
            leaf(&tree, "p3").value,
            Value::Array(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
        );
    }

    #[test]
    fn test_point_range_requires_full_arity() {
        let tree = compile(&json!({"p": {"TYPE": "ff", "VALUE": [5, 5], "RANGE": [{"MIN": 0, "MAX": 1}]}}));
        let p = leaf(&tree, "p");
        assert!(p.ranges().is_none());
        assert_eq!(p.value, Value::Array(vec![Value::Float(5.0), Value::Float(5.0)]));
    }

    #[test]
    fn test_colors_from_float_and_int_rgba() {
        let tree = compile(&json!({
            "cf": {"TYPE": "ffff", "VALUE": [1, 0.5, 0, 1]},
            "ci": {"TYPE": "iiii", "VALUE": [255, 0, 51, 255]},
            "short": {"TYPE": "ffff", "VALUE": [1, 1]}
        }));
        assert_eq!(leaf(&tree, "cf").value, Value::color(1.0, 0.5, 0.0, 1.0));
        assert_eq!(leaf(&tree, "ci").value.rgba_bytes(), Some([255, 0, 51, 255]));
        assert_eq!(leaf(&tree, "short").value, Value::black());
    }

    #[test]
    fn test_enum_from_vals() {
        let tree = compile(&json!({
            "mode": {"TYPE": "s", "VALUE": "b", "RANGE": [{"VALS": ["a", "b", "c"]}]},
            "fallback": {"TYPE": "s", "VALUE": "zzz", "RANGE": [{"VALS": ["x", "y"]}]}
        }));
        let mode = leaf(&tree, "mode");
        assert_eq!(mode.kind, ParameterKind::Enum);
        assert_eq!(mode.value, Value::String("b".to_string()));
        assert_eq!(mode.options().map(<[_]>::len), Some(3));
        assert_eq!(leaf(&tree, "fallback").value, Value::String("x".to_string()));
    }

    #[test]
    fn test_enum_with_empty_vals_is_skipped() {
        let tree = compile(&json!({"mode": {"TYPE": "s", "RANGE": [{"VALS": []}]}}));
        assert!(tree.find("mode").is_none());
    }

    #[test]
    fn test_plain_string_and_missing_value() {
        let tree = compile(&json!({
            "name": {"TYPE": "s", "VALUE": "hello"},
            "empty": {"TYPE": "S"}
        }));
        let name = leaf(&tree, "name");
        assert_eq!(name.kind, ParameterKind::String);
        assert_eq!(name.value, Value::String("hello".to_string()));
        assert_eq!(leaf(&tree, "empty").value, Value::String(String::new()));
    }

    #[test]
    fn test_string_with_numeric_range_is_skipped() {
        let tree = compile(&json!({
            "s": {"TYPE": "s", "VALUE": "x", "RANGE": [{"MIN": 0, "MAX": 1}]},
            "t": {"TYPE": "s", "VALUE": "y", "RANGE": [null]}
        }));
        assert!(tree.find("s").is_none());
        assert_eq!(leaf(&tree, "t").value, Value::String("y".to_string()));
    }

    #[test]
    fn test_large_int_value_is_exact() {
        let tree = compile(&json!({"n": {"TYPE": "i", "VALUE": 16_777_217}}));
        assert_eq!(leaf(&tree, "n").value, Value::Int(16_777_217));
    }

    #[test]
    fn test_bool_and_trigger() {
        let tree = compile(&json!({
            "on": {"TYPE": "T"},
            "off": {"TYPE": "T", "VALUE": false},
            "bang": {"TYPE": "I"},
            "nil": {"TYPE": "N"}
        }));
        assert_eq!(leaf(&tree, "on").value, Value::Bool(true));
        assert_eq!(leaf(&tree, "off").value, Value::Bool(false));
        assert_eq!(leaf(&tree, "bang").kind, ParameterKind::Trigger);
        assert_eq!(leaf(&tree, "nil").value, Value::None);
    }

    #[test]
    fn test_unknown_tag_skipped_without_affecting_siblings() {
        let tree = compile(&json!({
            "blob": {"TYPE": "b"},
            "weird": {"TYPE": "fi"},
            "ok": {"TYPE": "f", "VALUE": 1.5}
        }));
        assert!(tree.find("blob").is_none());
        assert!(tree.find("weird").is_none());
        assert_eq!(leaf(&tree, "ok").value, Value::Float(1.5));
    }

    #[test]
    fn test_access_read_only() {
        let tree = compile(&json!({
            "meter": {"TYPE": "f", "ACCESS": 1},
            "knob": {"TYPE": "f"}
        }));
        assert!(leaf(&tree, "meter").read_only());
        assert!(!leaf(&tree, "knob").read_only());
    }

    #[test]
    fn test_groups_keep_keys_and_use_description_as_label() {
        let tree = compile(&json!({
            "fx": {
                "DESCRIPTION": "Effects",
                "CONTENTS": {
                    "rev": {"TYPE": "f", "DESCRIPTION": "Reverb amount", "VALUE": 0.1}
                }
            }
        }));
        let fx = tree.group("fx").unwrap();
        assert_eq!(fx.label, "Effects");
        assert!(!fx.expanded);
        assert!(!fx.listen_enabled);
        let rev = leaf(&tree, "fx/rev");
        assert_eq!(rev.label, "Reverb amount");
        assert!(tree.find("Effects/Reverb amount").is_none());
    }

    #[test]
    fn test_child_order_follows_schema() {
        let tree = compile(&json!({"z": {"TYPE": "i"}, "a": {"TYPE": "i"}, "m": {"TYPE": "i"}}));
        let keys: Vec<_> = tree.root().children().iter().map(|c| c.key().to_string()).collect();
        assert_eq!(keys, vec!["z", "a", "m"]);
    }

    #[test]
    fn test_non_object_root_gives_empty_tree() {
        assert!(compile(&json!([1, 2, 3])).is_empty());
    }
}
