//! Type codec bridging the generic [`Value`] model and OSCQuery type tags.
//!
//! OSCQuery describes every leaf with a compact tag string (`"f"`, `"ii"`,
//! `"ffff"`, `"r"`, ...). [`TypeTag`] is the closed set of tags we understand;
//! each maps to exactly one [`ParameterKind`] and a component count. The
//! same tag drives both directions:
//!
//! - [`decode`]: OSC arguments received for a leaf → [`Value`]
//! - [`encode`]: leaf [`Value`] → OSC arguments to send
//!
//! Colors are always held as four floats in RGBA order, `0.0..=1.0`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::osc::OscArg;

/// Numeric wire format for number tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NumberFormat {
    /// `i` - 32-bit integer.
    Int,
    /// `h` - 64-bit integer.
    Int64,
    /// `f` - 32-bit float.
    Float,
    /// `d` - 64-bit float.
    Double,
}

impl NumberFormat {
    fn from_char(c: char) -> Option<Self> {
        match c {
            'i' => Some(Self::Int),
            'h' => Some(Self::Int64),
            'f' => Some(Self::Float),
            'd' => Some(Self::Double),
            _ => None,
        }
    }

    fn as_char(self) -> char {
        match self {
            Self::Int => 'i',
            Self::Int64 => 'h',
            Self::Float => 'f',
            Self::Double => 'd',
        }
    }

    /// Whether values of this format are integers.
    pub fn is_integer(self) -> bool {
        matches!(self, Self::Int | Self::Int64)
    }
}

/// Number of components in a numeric tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arity {
    /// Scalar.
    One,
    /// 2D point.
    Two,
    /// 3D point.
    Three,
    /// Color.
    Four,
}

impl Arity {
    fn from_count(n: usize) -> Option<Self> {
        match n {
            1 => Some(Self::One),
            2 => Some(Self::Two),
            3 => Some(Self::Three),
            4 => Some(Self::Four),
            _ => None,
        }
    }

    /// Component count.
    pub fn count(self) -> usize {
        match self {
            Self::One => 1,
            Self::Two => 2,
            Self::Three => 3,
            Self::Four => 4,
        }
    }
}

/// An OSCQuery `TYPE` tag we know how to mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeTag {
    /// `N` - nil, mirrored as a trigger.
    Nil,
    /// `I` - impulse, mirrored as a trigger.
    Impulse,
    /// `i`, `ff`, `hhh`, `dddd`, ... - one to four repeated number tags.
    Number {
        /// Wire format of every component.
        format: NumberFormat,
        /// Number of components.
        arity: Arity,
    },
    /// `s` - string.
    String,
    /// `S` - symbol.
    Symbol,
    /// `c` - character.
    Char,
    /// `r` - packed 32-bit color.
    PackedColor,
    /// `T` - boolean, default true.
    True,
    /// `F` - boolean, default false.
    False,
}

/// Parameter kind a tag compiles to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParameterKind {
    /// Fires on receipt, holds no value.
    Trigger,
    /// Boolean.
    Bool,
    /// 32-bit integer.
    Int,
    /// 32-bit float.
    Float,
    /// Two numeric components.
    Point2D,
    /// Three numeric components.
    Point3D,
    /// RGBA color.
    Color,
    /// Free text.
    String,
    /// Text restricted to an option list.
    Enum,
}

impl TypeTag {
    /// Parse a `TYPE` string. Unknown tags yield `None`.
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "N" => return Some(Self::Nil),
            "I" => return Some(Self::Impulse),
            "s" => return Some(Self::String),
            "S" => return Some(Self::Symbol),
            "c" => return Some(Self::Char),
            "r" => return Some(Self::PackedColor),
            "T" => return Some(Self::True),
            "F" => return Some(Self::False),
            _ => {}
        }

        let mut chars = tag.chars();
        let first = chars.next()?;
        let format = NumberFormat::from_char(first)?;
        if !chars.all(|c| c == first) {
            return None;
        }
        let arity = Arity::from_count(tag.len())?;

        Some(Self::Number { format, arity })
    }

    /// The parameter kind this tag compiles to.
    ///
    /// Text tags report [`ParameterKind::String`]; the schema compiler
    /// refines them to [`ParameterKind::Enum`] when an option list exists.
    pub fn kind(self) -> ParameterKind {
        match self {
            Self::Nil | Self::Impulse => ParameterKind::Trigger,
            Self::Number { format, arity } => match arity {
                Arity::One if format.is_integer() => ParameterKind::Int,
                Arity::One => ParameterKind::Float,
                Arity::Two => ParameterKind::Point2D,
                Arity::Three => ParameterKind::Point3D,
                Arity::Four => ParameterKind::Color,
            },
            Self::String | Self::Symbol | Self::Char => ParameterKind::String,
            Self::PackedColor => ParameterKind::Color,
            Self::True | Self::False => ParameterKind::Bool,
        }
    }

    /// Number of value components (0 for triggers).
    pub fn arity(self) -> usize {
        match self {
            Self::Nil | Self::Impulse => 0,
            Self::Number { arity, .. } => arity.count(),
            Self::PackedColor => 4,
            Self::String | Self::Symbol | Self::Char | Self::True | Self::False => 1,
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nil => f.write_str("N"),
            Self::Impulse => f.write_str("I"),
            Self::Number { format, arity } => {
                let c = format.as_char();
                for _ in 0..arity.count() {
                    write!(f, "{c}")?;
                }
                Ok(())
            }
            Self::String => f.write_str("s"),
            Self::Symbol => f.write_str("S"),
            Self::Char => f.write_str("c"),
            Self::PackedColor => f.write_str("r"),
            Self::True => f.write_str("T"),
            Self::False => f.write_str("F"),
        }
    }
}

/// Generic tagged value held by mirror leaves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// No value (triggers).
    None,
    /// Boolean.
    Bool(bool),
    /// 32-bit integer.
    Int(i32),
    /// 32-bit float.
    Float(f32),
    /// Text.
    String(String),
    /// Ordered components (points, colors).
    Array(Vec<Value>),
}

impl Value {
    /// Build a color value from RGBA floats.
    pub fn color(r: f32, g: f32, b: f32, a: f32) -> Self {
        Value::Array(vec![
            Value::Float(r),
            Value::Float(g),
            Value::Float(b),
            Value::Float(a),
        ])
    }

    /// Build a color value from 0-255 RGBA bytes.
    pub fn color_from_bytes(rgba: [u8; 4]) -> Self {
        let [r, g, b, a] = rgba.map(|c| f32::from(c) / 255.0);
        Self::color(r, g, b, a)
    }

    /// Opaque black, the fallback for colors with missing components.
    pub fn black() -> Self {
        Self::color(0.0, 0.0, 0.0, 1.0)
    }

    /// Whether this value is an array.
    pub fn is_array(&self) -> bool {
        matches!(self, Value::Array(_))
    }

    /// Component view: arrays yield their items, scalars yield themselves.
    pub fn components(&self) -> &[Value] {
        match self {
            Value::Array(items) => items,
            Value::None => &[],
            other => std::slice::from_ref(other),
        }
    }

    /// Numeric view as `f32` (bools become 0/1, numeric strings parse).
    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f32),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::String(s) => s.trim().parse().ok(),
            Value::None | Value::Array(_) => None,
        }
    }

    /// Numeric view as `i32`, truncating floats.
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Float(v) => Some(*v as i32),
            Value::Bool(b) => Some(i32::from(*b)),
            Value::String(s) => s.trim().parse().ok(),
            Value::None | Value::Array(_) => None,
        }
    }

    /// Truthiness for boolean leaves.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(v) => Some(*v != 0),
            Value::Float(v) => Some(*v != 0.0),
            Value::String(s) => match s.as_str() {
                "true" | "1" => Some(true),
                "false" | "0" => Some(false),
                _ => None,
            },
            Value::None | Value::Array(_) => None,
        }
    }

    /// String view for text leaves; numbers are rendered.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Value::String(s) => Some(s.clone()),
            Value::Int(v) => Some(v.to_string()),
            Value::Float(v) => Some(v.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            Value::None | Value::Array(_) => None,
        }
    }

    /// Color channels as bytes, when this is a four-component array.
    pub fn rgba_bytes(&self) -> Option<[u8; 4]> {
        let items = self.components();
        if items.len() < 4 {
            return None;
        }
        let mut out = [0u8; 4];
        for (slot, item) in out.iter_mut().zip(items) {
            *slot = unit_to_byte(item.as_f32()?);
        }
        Some(out)
    }

    /// Convert a JSON scalar or array into a value.
    ///
    /// Integral numbers that fit in 32 bits become [`Value::Int`], other
    /// numbers [`Value::Float`]. Objects have no value representation.
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null | serde_json::Value::Object(_) => Value::None,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64().and_then(|v| i32::try_from(v).ok()) {
                Some(v) => Value::Int(v),
                None => Value::Float(n.as_f64().unwrap_or_default() as f32),
            },
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => Value::Array(items.iter().map(Value::from_json).collect()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => f.write_str("-"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::String(s) => write!(f, "\"{s}\""),
            Value::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

fn unit_to_byte(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Parse a packed color string into RGBA bytes.
///
/// Accepts an optional `#` followed by 6 or 8 hex digits, read as one
/// 32-bit ARGB word (a 6-digit string has a zero alpha byte). The channels
/// are then rotated so the first byte of the word lands in red and the
/// last in alpha.
pub fn parse_packed_color(text: &str) -> Option<[u8; 4]> {
    let hex = text.trim();
    let hex = hex.strip_prefix('#').unwrap_or(hex);
    if !matches!(hex.len(), 6 | 8) || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let word = u32::from_str_radix(hex, 16).ok()?;

    let [alpha, red, green, blue] = word.to_be_bytes();
    // Remote order is channel-reversed relative to ARGB
    Some([alpha, red, green, blue])
}

/// Format RGBA bytes as the remote's packed color string.
pub fn format_packed_color(rgba: [u8; 4]) -> String {
    let [r, g, b, a] = rgba;
    format!("#{r:02X}{g:02X}{b:02X}{a:02X}")
}

fn number_arg(format: NumberFormat, value: &Value) -> OscArg {
    match format {
        NumberFormat::Int => OscArg::Int(value.as_i32().unwrap_or_default()),
        NumberFormat::Int64 => OscArg::Int64(i64::from(value.as_i32().unwrap_or_default())),
        NumberFormat::Float => OscArg::Float(value.as_f32().unwrap_or_default()),
        NumberFormat::Double => OscArg::Double(f64::from(value.as_f32().unwrap_or_default())),
    }
}

/// Encode a leaf value into OSC arguments for the given tag.
///
/// Triggers encode to no arguments, tuples to one argument per component
/// in declared order. Missing components are sent as zero.
pub fn encode(tag: TypeTag, value: &Value) -> Vec<OscArg> {
    match tag {
        TypeTag::Nil | TypeTag::Impulse => Vec::new(),
        TypeTag::Number {
            format,
            arity: Arity::Four,
        } => {
            let rgba = value.rgba_bytes().unwrap_or([0, 0, 0, 255]);
            if format.is_integer() {
                rgba.iter()
                    .map(|c| number_arg(format, &Value::Int(i32::from(*c))))
                    .collect()
            } else {
                value
                    .components()
                    .iter()
                    .chain(std::iter::repeat(&Value::Float(0.0)))
                    .take(4)
                    .map(|c| number_arg(format, c))
                    .collect()
            }
        }
        TypeTag::Number { format, arity } => value
            .components()
            .iter()
            .chain(std::iter::repeat(&Value::Int(0)))
            .take(arity.count())
            .map(|c| number_arg(format, c))
            .collect(),
        TypeTag::String => vec![OscArg::String(value.as_text().unwrap_or_default())],
        TypeTag::Symbol => vec![OscArg::Symbol(value.as_text().unwrap_or_default())],
        TypeTag::Char => {
            let c = value
                .as_text()
                .and_then(|s| s.chars().next())
                .unwrap_or('\0');
            vec![OscArg::Char(c)]
        }
        TypeTag::PackedColor => vec![OscArg::Color(value.rgba_bytes().unwrap_or([0, 0, 0, 255]))],
        TypeTag::True | TypeTag::False => vec![OscArg::Bool(value.as_bool().unwrap_or(false))],
    }
}

fn saturate_i64(v: i64) -> i32 {
    i32::try_from(v).unwrap_or(if v < 0 { i32::MIN } else { i32::MAX })
}

fn arg_value(arg: &OscArg) -> Option<Value> {
    match arg {
        OscArg::Int(v) => Some(Value::Int(*v)),
        OscArg::Int64(v) => Some(Value::Int(saturate_i64(*v))),
        OscArg::Float(v) => Some(Value::Float(*v)),
        OscArg::Double(v) => Some(Value::Float(*v as f32)),
        OscArg::String(s) | OscArg::Symbol(s) => Some(Value::String(s.clone())),
        OscArg::Char(c) => Some(Value::String(c.to_string())),
        OscArg::Bool(b) => Some(Value::Bool(*b)),
        OscArg::Color(_) | OscArg::Blob(_) | OscArg::TimeTag(_) | OscArg::Nil | OscArg::Impulse => None,
    }
}

fn number_value(format: NumberFormat, arg: &OscArg) -> Option<Value> {
    let v = arg_value(arg)?;
    if format.is_integer() {
        v.as_i32().map(Value::Int)
    } else {
        v.as_f32().map(Value::Float)
    }
}

fn color_from_args(format: Option<NumberFormat>, args: &[OscArg]) -> Option<Value> {
    if let Some(OscArg::Color(rgba)) = args.first() {
        return Some(Value::color_from_bytes(*rgba));
    }
    if args.len() < 4 {
        return None;
    }
    let integer = format.is_some_and(NumberFormat::is_integer)
        || args[..4].iter().all(|a| matches!(a, OscArg::Int(_) | OscArg::Int64(_)));
    let mut channels = [0.0f32; 4];
    for (slot, arg) in channels.iter_mut().zip(args) {
        let v = arg_value(arg)?.as_f32()?;
        *slot = if integer { v / 255.0 } else { v };
    }
    let [r, g, b, a] = channels;
    Some(Value::color(r, g, b, a))
}

/// Decode received OSC arguments into a value for a leaf with `tag`.
///
/// Numeric arguments are coerced to the leaf's number class. Returns
/// `None` when the arguments cannot feed the leaf (too few components,
/// wrong shape). Triggers always decode to [`Value::None`].
pub fn decode(tag: TypeTag, args: &[OscArg]) -> Option<Value> {
    match tag {
        TypeTag::Nil | TypeTag::Impulse => Some(Value::None),
        TypeTag::Number {
            format,
            arity: Arity::Four,
        } => color_from_args(Some(format), args),
        TypeTag::Number {
            format,
            arity: Arity::One,
        } => number_value(format, args.first()?),
        TypeTag::Number { format, arity } => {
            if args.len() < arity.count() {
                return None;
            }
            args[..arity.count()]
                .iter()
                .map(|a| number_value(format, a))
                .collect::<Option<Vec<_>>>()
                .map(Value::Array)
        }
        TypeTag::String | TypeTag::Symbol | TypeTag::Char => {
            arg_value(args.first()?)?.as_text().map(Value::String)
        }
        TypeTag::PackedColor => color_from_args(None, args),
        TypeTag::True | TypeTag::False => arg_value(args.first()?)?.as_bool().map(Value::Bool),
    }
}
