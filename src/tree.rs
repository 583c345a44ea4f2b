//! The mirror tree: typed replica of the remote's parameter structure.
//!
//! A tree is a root [`Group`] whose children are groups or leaf
//! [`Parameter`]s. Every node is addressed by the slash-joined chain of its
//! stable keys (`"synth/osc1/freq"`). Display labels come from the remote's
//! `DESCRIPTION` and never take part in addressing.
//!
//! Trees are plain owned data. The engine keeps the live tree behind an
//! `Arc` and edits it copy-on-write, so a reader holding a snapshot is never
//! affected by later edits or by a reconcile swapping in a new tree.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::codec::{ParameterKind, TypeTag, Value};

/// Split a path into its non-empty segments.
///
/// Leading, trailing and doubled slashes are ignored, so `"/a/b"`,
/// `"a/b/"` and `"a//b"` address the same node.
pub fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Normalize a path to its canonical form (no leading or trailing slash).
pub fn normalize_path(path: &str) -> String {
    split_path(path).collect::<Vec<_>>().join("/")
}

/// Join a parent path and a child key.
pub fn join_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{parent}/{key}")
    }
}

/// OSC address for a tree path (leading slash).
pub fn osc_address(path: &str) -> String {
    format!("/{}", normalize_path(path))
}

/// Inclusive numeric range for one component.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Range {
    /// Lower bound.
    pub min: f64,
    /// Upper bound.
    pub max: f64,
}

impl Range {
    /// The range used when the remote gives no bounds.
    pub const FULL: Range = Range {
        min: i32::MIN as f64,
        max: i32::MAX as f64,
    };

    fn clamp(&self, v: f32) -> f32 {
        if self.min <= self.max {
            f64::from(v).clamp(self.min, self.max) as f32
        } else {
            v
        }
    }

    /// Clamp an integer against the integral part of the range.
    fn clamp_int(&self, v: i32) -> i32 {
        let (lo, hi) = (self.min.ceil(), self.max.floor());
        if lo > hi {
            return v;
        }
        let x = f64::from(v);
        if x < lo {
            lo as i32
        } else if x > hi {
            hi as i32
        } else {
            v
        }
    }
}

/// One selectable enum entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnumOption {
    /// Text shown to the user.
    pub label: String,
    /// Value sent to and received from the remote.
    pub value: String,
}

/// Value constraint attached to a parameter.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Constraint {
    /// Unconstrained.
    #[default]
    None,
    /// One range per value component.
    Ranges(Vec<Range>),
    /// Closed option set (enum parameters).
    Options(Vec<EnumOption>),
}

/// OSCQuery `ACCESS` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Access {
    /// 0 - neither readable nor writable.
    None,
    /// 1 - value can only be read (feedback only).
    ReadOnly,
    /// 2 - value can only be written.
    WriteOnly,
    /// 3 - full access.
    #[default]
    ReadWrite,
}

impl Access {
    /// Map the numeric `ACCESS` field; unknown numbers mean full access.
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => Self::None,
            1 => Self::ReadOnly,
            2 => Self::WriteOnly,
            _ => Self::ReadWrite,
        }
    }
}

/// A leaf parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    /// Stable path segment.
    pub key: String,
    /// Display label.
    pub label: String,
    /// Remote type tag, used for encoding.
    pub tag: TypeTag,
    /// Compiled kind.
    pub kind: ParameterKind,
    /// Current value ([`Value::None`] for triggers).
    pub value: Value,
    /// Range or option constraint.
    pub constraint: Constraint,
    /// Remote access flag.
    pub access: Access,
}

impl Parameter {
    /// Whether local writes are refused (remote feedback only).
    pub fn read_only(&self) -> bool {
        self.access == Access::ReadOnly
    }

    /// Per-component ranges, if any.
    pub fn ranges(&self) -> Option<&[Range]> {
        match &self.constraint {
            Constraint::Ranges(r) => Some(r),
            _ => None,
        }
    }

    /// Enum options, if any.
    pub fn options(&self) -> Option<&[EnumOption]> {
        match &self.constraint {
            Constraint::Options(o) => Some(o),
            _ => None,
        }
    }

    fn range_at(&self, i: usize) -> Option<&Range> {
        self.ranges().and_then(|r| r.get(i))
    }

    fn number_is_integer(&self) -> bool {
        match self.tag {
            TypeTag::Number { format, .. } => format.is_integer(),
            _ => false,
        }
    }

    fn component(&self, i: usize, v: &Value) -> Option<Value> {
        let range = self.range_at(i);
        if self.number_is_integer() {
            let x = v.as_i32()?;
            Some(Value::Int(range.map_or(x, |r| r.clamp_int(x))))
        } else {
            let x = v.as_f32()?;
            Some(Value::Float(range.map_or(x, |r| r.clamp(x))))
        }
    }

    /// Coerce `value` to this parameter's shape, clamped into range.
    ///
    /// Returns `None` when the value cannot feed this parameter: wrong
    /// component count, non-numeric input for a number, or a string that
    /// is not one of the enum options.
    pub fn normalize(&self, value: &Value) -> Option<Value> {
        match self.kind {
            ParameterKind::Trigger => Some(Value::None),
            ParameterKind::Bool => value.as_bool().map(Value::Bool),
            ParameterKind::Int => {
                let v = value.components().first()?.as_i32()?;
                let v = self.range_at(0).map_or(v, |r| r.clamp_int(v));
                Some(Value::Int(v))
            }
            ParameterKind::Float => {
                let v = value.components().first()?.as_f32()?;
                Some(Value::Float(self.range_at(0).map_or(v, |r| r.clamp(v))))
            }
            ParameterKind::Point2D | ParameterKind::Point3D => {
                let n = self.tag.arity();
                let items = value.components();
                if items.len() < n {
                    return None;
                }
                items[..n]
                    .iter()
                    .enumerate()
                    .map(|(i, v)| self.component(i, v))
                    .collect::<Option<Vec<_>>>()
                    .map(Value::Array)
            }
            ParameterKind::Color => {
                if let Value::String(s) = value {
                    return crate::codec::parse_packed_color(s).map(Value::color_from_bytes);
                }
                let items = value.components();
                if items.len() < 4 {
                    return None;
                }
                let mut channels = [0.0f32; 4];
                for (slot, item) in channels.iter_mut().zip(items) {
                    *slot = item.as_f32()?.clamp(0.0, 1.0);
                }
                let [r, g, b, a] = channels;
                Some(Value::color(r, g, b, a))
            }
            ParameterKind::String => value.components().first()?.as_text().map(Value::String),
            ParameterKind::Enum => {
                let text = value.components().first()?.as_text()?;
                self.options()?
                    .iter()
                    .any(|o| o.value == text)
                    .then_some(Value::String(text))
            }
        }
    }

    /// Set the value after normalizing it.
    ///
    /// Returns `Some(new_value)` when the stored value changed, `None` when
    /// the input was rejected or identical. Triggers always report a change.
    pub fn set_value(&mut self, value: &Value) -> Option<Value> {
        let normalized = self.normalize(value)?;
        if self.kind != ParameterKind::Trigger && normalized == self.value {
            return None;
        }
        self.value = normalized.clone();
        Some(normalized)
    }
}

/// A group of child nodes.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Group {
    /// Stable path segment (empty for the root).
    pub key: String,
    /// Display label.
    pub label: String,
    /// Whether push notifications are requested for this group's leaves.
    pub listen_enabled: bool,
    /// UI expansion state.
    pub expanded: bool,
    children: Vec<Node>,
}

impl Group {
    /// Create an empty, collapsed, non-listening group.
    pub fn new(key: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            label: label.into(),
            listen_enabled: false,
            expanded: false,
            children: Vec::new(),
        }
    }

    /// Child nodes in schema order.
    pub fn children(&self) -> &[Node] {
        &self.children
    }

    /// Add a child, replacing any existing child with the same key.
    pub fn add_child(&mut self, node: Node) {
        if let Some(existing) = self.children.iter_mut().find(|c| c.key() == node.key()) {
            log::debug!("Duplicate key '{}' replaced", node.key());
            *existing = node;
        } else {
            self.children.push(node);
        }
    }

    /// Direct child by key.
    pub fn child(&self, key: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.key() == key)
    }

    fn child_mut(&mut self, key: &str) -> Option<&mut Node> {
        self.children.iter_mut().find(|c| c.key() == key)
    }

    /// Whether the group has no children.
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Paths of every descendant parameter, depth first, relative to `base`.
    pub fn parameter_paths(&self, base: &str) -> Vec<String> {
        let mut out = Vec::new();
        collect_parameters(self, base, &mut |path, _| out.push(path.to_string()));
        out
    }
}

/// A tree node.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// Nested group.
    Group(Group),
    /// Leaf parameter.
    Parameter(Parameter),
}

impl Node {
    /// Stable key of this node.
    pub fn key(&self) -> &str {
        match self {
            Node::Group(g) => &g.key,
            Node::Parameter(p) => &p.key,
        }
    }

    /// Display label of this node.
    pub fn label(&self) -> &str {
        match self {
            Node::Group(g) => &g.label,
            Node::Parameter(p) => &p.label,
        }
    }
}

fn collect_parameters<'a>(group: &'a Group, base: &str, f: &mut dyn FnMut(&str, &'a Parameter)) {
    for child in &group.children {
        let path = join_path(base, child.key());
        match child {
            Node::Parameter(p) => f(&path, p),
            Node::Group(g) => collect_parameters(g, &path, f),
        }
    }
}

fn collect_groups<'a>(group: &'a Group, base: &str, f: &mut dyn FnMut(&str, &'a Group)) {
    for child in &group.children {
        if let Node::Group(g) = child {
            let path = join_path(base, &g.key);
            f(&path, g);
            collect_groups(g, &path, f);
        }
    }
}

/// Per-group UI/session flags kept across resyncs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GroupFlags {
    /// Listen-enabled flag.
    pub listen_enabled: bool,
    /// Expanded flag.
    pub expanded: bool,
}

/// Serializable snapshot of a tree's mutable state, keyed by path.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TreeState {
    /// Leaf values (triggers excluded).
    #[serde(default)]
    pub values: BTreeMap<String, Value>,
    /// Group flags.
    #[serde(default)]
    pub groups: BTreeMap<String, GroupFlags>,
}

/// The mirror tree.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MirrorTree {
    root: Group,
}

impl MirrorTree {
    /// Wrap a compiled root group.
    pub fn new(root: Group) -> Self {
        Self { root }
    }

    /// The root group.
    pub fn root(&self) -> &Group {
        &self.root
    }

    /// Whether the tree has no nodes.
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Look up any node by path. The empty path is not a node.
    pub fn find(&self, path: &str) -> Option<&Node> {
        let mut segments = split_path(path);
        let mut node = self.root.child(segments.next()?)?;
        for seg in segments {
            match node {
                Node::Group(g) => node = g.child(seg)?,
                Node::Parameter(_) => return None,
            }
        }
        Some(node)
    }

    fn find_mut(&mut self, path: &str) -> Option<&mut Node> {
        let mut segments = split_path(path);
        let mut node = self.root.child_mut(segments.next()?)?;
        for seg in segments {
            let current = node;
            node = match current {
                Node::Group(g) => g.child_mut(seg)?,
                Node::Parameter(_) => return None,
            };
        }
        Some(node)
    }

    /// Parameter at `path`.
    pub fn parameter(&self, path: &str) -> Option<&Parameter> {
        match self.find(path)? {
            Node::Parameter(p) => Some(p),
            Node::Group(_) => None,
        }
    }

    /// Mutable parameter at `path`.
    pub fn parameter_mut(&mut self, path: &str) -> Option<&mut Parameter> {
        match self.find_mut(path)? {
            Node::Parameter(p) => Some(p),
            Node::Group(_) => None,
        }
    }

    /// Group at `path`; the empty path is the root.
    pub fn group(&self, path: &str) -> Option<&Group> {
        if split_path(path).next().is_none() {
            return Some(&self.root);
        }
        match self.find(path)? {
            Node::Group(g) => Some(g),
            Node::Parameter(_) => None,
        }
    }

    /// Mutable group at `path`; the empty path is the root.
    pub fn group_mut(&mut self, path: &str) -> Option<&mut Group> {
        if split_path(path).next().is_none() {
            return Some(&mut self.root);
        }
        match self.find_mut(path)? {
            Node::Group(g) => Some(g),
            Node::Parameter(_) => None,
        }
    }

    /// All parameters with their paths, depth first.
    pub fn parameters(&self) -> Vec<(String, &Parameter)> {
        let mut out = Vec::new();
        collect_parameters(&self.root, "", &mut |path, p| out.push((path.to_string(), p)));
        out
    }

    /// All groups below the root with their paths, depth first.
    pub fn groups(&self) -> Vec<(String, &Group)> {
        let mut out = Vec::new();
        collect_groups(&self.root, "", &mut |path, g| out.push((path.to_string(), g)));
        out
    }

    /// Snapshot values and group flags.
    pub fn snapshot(&self) -> TreeState {
        let values = self
            .parameters()
            .into_iter()
            .filter(|(_, p)| p.kind != ParameterKind::Trigger)
            .map(|(path, p)| (path, p.value.clone()))
            .collect();
        let groups = self
            .groups()
            .into_iter()
            .map(|(path, g)| {
                (
                    path,
                    GroupFlags {
                        listen_enabled: g.listen_enabled,
                        expanded: g.expanded,
                    },
                )
            })
            .collect();
        TreeState { values, groups }
    }

    /// Reapply group flags from a snapshot; unknown paths are skipped.
    ///
    /// Returns how many groups were matched.
    pub fn apply_flags(&mut self, state: &TreeState) -> usize {
        let mut applied = 0;
        for (path, flags) in &state.groups {
            if let Some(g) = self.group_mut(path) {
                g.listen_enabled = flags.listen_enabled;
                g.expanded = flags.expanded;
                applied += 1;
            }
        }
        applied
    }

    /// Reapply values from a snapshot; unknown or incompatible entries are
    /// skipped. Returns how many values were applied.
    pub fn apply_values(&mut self, state: &TreeState) -> usize {
        let mut applied = 0;
        for (path, value) in &state.values {
            let Some(p) = self.parameter_mut(path) else {
                log::debug!("Stored value for '{path}' has no matching parameter");
                continue;
            };
            match p.normalize(value) {
                Some(v) => {
                    p.value = v;
                    applied += 1;
                }
                None => log::debug!("Stored value for '{path}' does not fit {}", p.tag),
            }
        }
        applied
    }

    /// Human-readable outline, one node per line.
    pub fn outline(&self) -> String {
        let mut out = String::new();
        outline_group(&self.root, 0, &mut out);
        out
    }
}

fn outline_group(group: &Group, depth: usize, out: &mut String) {
    for child in group.children() {
        let indent = "  ".repeat(depth);
        match child {
            Node::Group(g) => {
                let _ = writeln!(out, "{indent}{}/ ({})", g.key, g.label);
                outline_group(g, depth + 1, out);
            }
            Node::Parameter(p) => {
                let ro = if p.read_only() { " [read-only]" } else { "" };
                let _ = writeln!(out, "{indent}{} <{}> = {}{ro}", p.key, p.tag, p.value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn float_param(key: &str, label: &str, value: f32, range: Option<Range>) -> Parameter {
        Parameter {
            key: key.to_string(),
            label: label.to_string(),
            tag: TypeTag::parse("f").unwrap(),
            kind: ParameterKind::Float,
            value: Value::Float(value),
            constraint: range.map_or(Constraint::None, |r| Constraint::Ranges(vec![r])),
            access: Access::ReadWrite,
        }
    }

    fn sample_tree() -> MirrorTree {
        let mut inner = Group::new("osc1", "Oscillator One");
        inner.add_child(Node::Parameter(float_param("freq", "Frequency", 440.0, None)));
        let mut synth = Group::new("synth", "Synth");
        synth.add_child(Node::Group(inner));
        synth.add_child(Node::Parameter(float_param(
            "gain",
            "Gain",
            0.5,
            Some(Range { min: 0.0, max: 1.0 }),
        )));
        let mut root = Group::new("", "");
        root.add_child(Node::Group(synth));
        MirrorTree::new(root)
    }

    #[test]
    fn test_path_helpers() {
        assert_eq!(normalize_path("/a//b/"), "a/b");
        assert_eq!(join_path("", "a"), "a");
        assert_eq!(join_path("a", "b"), "a/b");
        assert_eq!(osc_address("a/b"), "/a/b");
        assert_eq!(osc_address("/a/b"), "/a/b");
    }

    #[test]
    fn test_find_by_keys_not_labels() {
        let tree = sample_tree();
        assert!(tree.parameter("synth/osc1/freq").is_some());
        assert!(tree.parameter("/synth/osc1/freq").is_some());
        assert!(tree.parameter("Synth/Oscillator One/Frequency").is_none());
        assert_eq!(tree.group("synth/osc1").map(|g| g.label.as_str()), Some("Oscillator One"));
    }

    #[test]
    fn test_find_through_parameter_fails() {
        let tree = sample_tree();
        assert!(tree.find("synth/gain/extra").is_none());
        assert!(tree.group("synth/gain").is_none());
        assert!(tree.find("").is_none());
        assert!(tree.group("").is_some());
    }

    #[test]
    fn test_set_value_clamps_to_range() {
        let mut tree = sample_tree();
        let p = tree.parameter_mut("synth/gain").unwrap();
        assert_eq!(p.set_value(&Value::Float(3.0)), Some(Value::Float(1.0)));
        assert_eq!(p.set_value(&Value::Float(1.0)), None, "unchanged value reports no change");
        assert_eq!(p.set_value(&Value::Int(0)), Some(Value::Float(0.0)));
    }

    #[test]
    fn test_large_integers_keep_precision() {
        let mut p = float_param("n", "n", 0.0, Some(Range { min: 0.0, max: 1e8 }));
        p.tag = TypeTag::parse("i").unwrap();
        p.kind = ParameterKind::Int;
        p.value = Value::Int(0);
        assert_eq!(p.set_value(&Value::Int(33_554_435)), Some(Value::Int(33_554_435)));
        assert_eq!(p.set_value(&Value::Int(200_000_001)), Some(Value::Int(100_000_000)));

        p.constraint = Constraint::Ranges(vec![Range::FULL]);
        assert_eq!(p.set_value(&Value::Int(i32::MAX)), Some(Value::Int(i32::MAX)));
        assert_eq!(p.set_value(&Value::Int(i32::MIN + 1)), Some(Value::Int(i32::MIN + 1)));
    }

    #[test]
    fn test_integer_range_uses_integral_bounds() {
        let mut p = float_param("n", "n", 0.0, Some(Range { min: 0.5, max: 9.5 }));
        p.tag = TypeTag::parse("i").unwrap();
        p.kind = ParameterKind::Int;
        p.value = Value::Int(5);
        assert_eq!(p.set_value(&Value::Int(0)), Some(Value::Int(1)));
        assert_eq!(p.set_value(&Value::Int(10)), Some(Value::Int(9)));
    }

    #[test]
    fn test_set_value_rejects_wrong_shape() {
        let mut tree = sample_tree();
        let p = tree.parameter_mut("synth/gain").unwrap();
        assert_eq!(p.set_value(&Value::String("loud".to_string())), None);
        assert_eq!(p.value, Value::Float(0.5));
    }

    #[test]
    fn test_enum_accepts_only_known_options() {
        let mut p = Parameter {
            key: "mode".to_string(),
            label: "mode".to_string(),
            tag: TypeTag::String,
            kind: ParameterKind::Enum,
            value: Value::String("a".to_string()),
            constraint: Constraint::Options(vec![
                EnumOption { label: "a".to_string(), value: "a".to_string() },
                EnumOption { label: "b".to_string(), value: "b".to_string() },
            ]),
            access: Access::ReadWrite,
        };
        assert_eq!(p.set_value(&Value::String("c".to_string())), None);
        assert_eq!(p.set_value(&Value::String("b".to_string())), Some(Value::String("b".to_string())));
    }

    #[test]
    fn test_trigger_always_reports_change() {
        let mut p = float_param("go", "go", 0.0, None);
        p.tag = TypeTag::Impulse;
        p.kind = ParameterKind::Trigger;
        p.value = Value::None;
        assert_eq!(p.set_value(&Value::None), Some(Value::None));
        assert_eq!(p.set_value(&Value::None), Some(Value::None));
    }

    #[test]
    fn test_color_accepts_packed_string() {
        let p = Parameter {
            key: "col".to_string(),
            label: "col".to_string(),
            tag: TypeTag::PackedColor,
            kind: ParameterKind::Color,
            value: Value::black(),
            constraint: Constraint::None,
            access: Access::ReadWrite,
        };
        assert_eq!(
            p.normalize(&Value::String("#FF000080".to_string())),
            Some(Value::color_from_bytes([0xFF, 0, 0, 0x80]))
        );
    }

    #[test]
    fn test_parameter_paths_are_depth_first() {
        let tree = sample_tree();
        let synth = tree.group("synth").unwrap();
        assert_eq!(synth.parameter_paths("synth"), vec!["synth/osc1/freq", "synth/gain"]);
    }

    #[test]
    fn test_snapshot_and_apply() {
        let mut tree = sample_tree();
        tree.group_mut("synth/osc1").unwrap().listen_enabled = true;
        tree.parameter_mut("synth/gain").unwrap().set_value(&Value::Float(0.9));
        let state = tree.snapshot();

        let mut fresh = sample_tree();
        assert_eq!(fresh.apply_flags(&state), 2);
        assert!(fresh.group("synth/osc1").unwrap().listen_enabled);
        assert_eq!(fresh.parameter("synth/gain").unwrap().value, Value::Float(0.5));

        assert_eq!(fresh.apply_values(&state), 2);
        assert_eq!(fresh.parameter("synth/gain").unwrap().value, Value::Float(0.9));
    }

    #[test]
    fn test_apply_values_skips_missing_paths() {
        let mut tree = sample_tree();
        let mut state = TreeState::default();
        state.values.insert("gone/away".to_string(), Value::Int(1));
        state.values.insert("synth/gain".to_string(), Value::String("bad".to_string()));
        assert_eq!(tree.apply_values(&state), 0);
    }

    #[test]
    fn test_add_child_replaces_duplicate_key() {
        let mut g = Group::new("g", "g");
        g.add_child(Node::Parameter(float_param("a", "first", 1.0, None)));
        g.add_child(Node::Parameter(float_param("a", "second", 2.0, None)));
        assert_eq!(g.children().len(), 1);
        assert_eq!(g.children()[0].label(), "second");
    }
}
