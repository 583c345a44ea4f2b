//! OSC 1.0 wire codec for the control transport.
//!
//! Packets are either a message or a bundle:
//!
//! ```text
//! message: [address, NUL padded to 4] [",tags", NUL padded to 4] [args...]
//! bundle:  ["#bundle\0"] [u64 BE timetag] ([i32 BE size] [packet])*
//! ```
//!
//! All numeric arguments are big-endian. Strings and blobs are padded to a
//! multiple of four bytes. `T`, `F`, `N` and `I` carry no payload.

use anyhow::{anyhow, bail, Result};

/// Bundle header (`#bundle` followed by a NUL byte).
const BUNDLE_TAG: &[u8; 8] = b"#bundle\0";

/// Nested bundles deeper than this are rejected.
const MAX_BUNDLE_DEPTH: usize = 8;

/// A single OSC argument.
#[derive(Debug, Clone, PartialEq)]
pub enum OscArg {
    /// `i` - 32-bit integer.
    Int(i32),
    /// `h` - 64-bit integer.
    Int64(i64),
    /// `f` - 32-bit float.
    Float(f32),
    /// `d` - 64-bit float.
    Double(f64),
    /// `s` - string.
    String(String),
    /// `S` - alternate string type ("symbol").
    Symbol(String),
    /// `c` - ASCII character sent as 32 bits.
    Char(char),
    /// `r` - 32-bit RGBA color, one byte per channel in R, G, B, A order.
    Color([u8; 4]),
    /// `b` - binary blob.
    Blob(Vec<u8>),
    /// `t` - NTP timetag.
    TimeTag(u64),
    /// `T` / `F` - boolean with no payload.
    Bool(bool),
    /// `N` - nil.
    Nil,
    /// `I` - impulse ("infinitum").
    Impulse,
}

impl OscArg {
    /// The single-character type tag for this argument.
    pub fn tag(&self) -> char {
        match self {
            OscArg::Int(_) => 'i',
            OscArg::Int64(_) => 'h',
            OscArg::Float(_) => 'f',
            OscArg::Double(_) => 'd',
            OscArg::String(_) => 's',
            OscArg::Symbol(_) => 'S',
            OscArg::Char(_) => 'c',
            OscArg::Color(_) => 'r',
            OscArg::Blob(_) => 'b',
            OscArg::TimeTag(_) => 't',
            OscArg::Bool(true) => 'T',
            OscArg::Bool(false) => 'F',
            OscArg::Nil => 'N',
            OscArg::Impulse => 'I',
        }
    }

    /// Human-readable rendering used by incoming/outgoing data logs.
    pub fn describe(&self) -> String {
        match self {
            OscArg::Int(v) => v.to_string(),
            OscArg::Int64(v) => v.to_string(),
            OscArg::Float(v) => v.to_string(),
            OscArg::Double(v) => v.to_string(),
            OscArg::String(s) | OscArg::Symbol(s) => format!("\"{s}\""),
            OscArg::Char(c) => format!("'{c}'"),
            OscArg::Color([r, g, b, a]) => format!("#{r:02X}{g:02X}{b:02X}{a:02X}"),
            OscArg::Blob(data) => format!("<blob {} bytes>", data.len()),
            OscArg::TimeTag(t) => format!("<time {t}>"),
            OscArg::Bool(b) => b.to_string(),
            OscArg::Nil => "nil".to_string(),
            OscArg::Impulse => "impulse".to_string(),
        }
    }
}

/// An OSC message: an address pattern plus arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct OscMessage {
    /// Address, always starting with `/`.
    pub address: String,
    /// Arguments in wire order.
    pub args: Vec<OscArg>,
}

impl OscMessage {
    /// Create a message with no arguments.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            args: Vec::new(),
        }
    }

    /// Create a message with the given arguments.
    pub fn with_args(address: impl Into<String>, args: Vec<OscArg>) -> Self {
        Self {
            address: address.into(),
            args,
        }
    }

    /// Type tag string including the leading comma (e.g. `",if"`).
    pub fn type_tags(&self) -> String {
        let mut tags = String::with_capacity(self.args.len() + 1);
        tags.push(',');
        tags.extend(self.args.iter().map(OscArg::tag));
        tags
    }

    /// Encode this message into a datagram payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.address.len() + 8 + self.args.len() * 4);
        write_padded_str(&mut buf, &self.address);
        write_padded_str(&mut buf, &self.type_tags());

        for arg in &self.args {
            match arg {
                OscArg::Int(v) => buf.extend_from_slice(&v.to_be_bytes()),
                OscArg::Int64(v) => buf.extend_from_slice(&v.to_be_bytes()),
                OscArg::Float(v) => buf.extend_from_slice(&v.to_be_bytes()),
                OscArg::Double(v) => buf.extend_from_slice(&v.to_be_bytes()),
                OscArg::String(s) | OscArg::Symbol(s) => write_padded_str(&mut buf, s),
                OscArg::Char(c) => buf.extend_from_slice(&u32::from(*c).to_be_bytes()),
                OscArg::Color(rgba) => buf.extend_from_slice(rgba),
                OscArg::Blob(data) => {
                    buf.extend_from_slice(&(data.len() as i32).to_be_bytes());
                    buf.extend_from_slice(data);
                    pad_to_four(&mut buf);
                }
                OscArg::TimeTag(t) => buf.extend_from_slice(&t.to_be_bytes()),
                OscArg::Bool(_) | OscArg::Nil | OscArg::Impulse => {}
            }
        }

        buf
    }
}

/// A decoded OSC packet.
#[derive(Debug, Clone, PartialEq)]
pub enum OscPacket {
    /// A single message.
    Message(OscMessage),
    /// A bundle of packets sharing a timetag.
    Bundle {
        /// NTP timetag (1 = immediately).
        timetag: u64,
        /// Contained packets, possibly nested bundles.
        content: Vec<OscPacket>,
    },
}

impl OscPacket {
    /// Flatten into the contained messages, depth first.
    pub fn into_messages(self) -> Vec<OscMessage> {
        match self {
            OscPacket::Message(m) => vec![m],
            OscPacket::Bundle { content, .. } => content
                .into_iter()
                .flat_map(OscPacket::into_messages)
                .collect(),
        }
    }
}

/// Decode a datagram or push-channel frame into a packet.
///
/// # Errors
///
/// Returns an error if the bytes are truncated, misaligned, carry an
/// unknown type tag, or the address does not start with `/`.
pub fn decode_packet(bytes: &[u8]) -> Result<OscPacket> {
    decode_packet_at_depth(bytes, 0)
}

fn decode_packet_at_depth(bytes: &[u8], depth: usize) -> Result<OscPacket> {
    if bytes.is_empty() {
        bail!("Empty OSC packet");
    }
    if bytes.len() % 4 != 0 {
        bail!("OSC packet size {} is not a multiple of 4", bytes.len());
    }

    if bytes.starts_with(BUNDLE_TAG) {
        if depth >= MAX_BUNDLE_DEPTH {
            bail!("OSC bundle nesting exceeds {MAX_BUNDLE_DEPTH}");
        }
        return decode_bundle(bytes, depth);
    }

    decode_message(bytes).map(OscPacket::Message)
}

fn decode_bundle(bytes: &[u8], depth: usize) -> Result<OscPacket> {
    let mut pos = BUNDLE_TAG.len();
    let timetag = u64::from_be_bytes(take_array(bytes, &mut pos)?);
    let mut content = Vec::new();

    while pos < bytes.len() {
        let size = i32::from_be_bytes(take_array(bytes, &mut pos)?);
        let size = usize::try_from(size).map_err(|_| anyhow!("Negative bundle element size"))?;
        let end = pos
            .checked_add(size)
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| anyhow!("Bundle element overruns packet ({size} bytes)"))?;
        content.push(decode_packet_at_depth(&bytes[pos..end], depth + 1)?);
        pos = end;
    }

    Ok(OscPacket::Bundle { timetag, content })
}

fn decode_message(bytes: &[u8]) -> Result<OscMessage> {
    let mut pos = 0;
    let address = read_padded_str(bytes, &mut pos)?;
    if !address.starts_with('/') {
        bail!("OSC address must start with '/': {address:?}");
    }

    // Messages without a type tag string are legal in old OSC; treat as no args
    if pos >= bytes.len() {
        return Ok(OscMessage::new(address));
    }

    let tags = read_padded_str(bytes, &mut pos)?;
    let Some(tags) = tags.strip_prefix(',') else {
        bail!("OSC type tag string must start with ',': {tags:?}");
    };

    let mut args = Vec::with_capacity(tags.len());
    for tag in tags.chars() {
        let arg = match tag {
            'i' => OscArg::Int(i32::from_be_bytes(take_array(bytes, &mut pos)?)),
            'h' => OscArg::Int64(i64::from_be_bytes(take_array(bytes, &mut pos)?)),
            'f' => OscArg::Float(f32::from_be_bytes(take_array(bytes, &mut pos)?)),
            'd' => OscArg::Double(f64::from_be_bytes(take_array(bytes, &mut pos)?)),
            's' => OscArg::String(read_padded_str(bytes, &mut pos)?),
            'S' => OscArg::Symbol(read_padded_str(bytes, &mut pos)?),
            'c' => {
                let code = u32::from_be_bytes(take_array(bytes, &mut pos)?);
                OscArg::Char(char::from_u32(code).ok_or_else(|| anyhow!("Invalid char {code}"))?)
            }
            'r' => OscArg::Color(take_array(bytes, &mut pos)?),
            'b' => {
                let len = i32::from_be_bytes(take_array(bytes, &mut pos)?);
                let len = usize::try_from(len).map_err(|_| anyhow!("Negative blob size"))?;
                let end = pos
                    .checked_add(len)
                    .filter(|end| *end <= bytes.len())
                    .ok_or_else(|| anyhow!("Blob overruns packet ({len} bytes)"))?;
                let data = bytes[pos..end].to_vec();
                pos = align4(end);
                OscArg::Blob(data)
            }
            't' => OscArg::TimeTag(u64::from_be_bytes(take_array(bytes, &mut pos)?)),
            'T' => OscArg::Bool(true),
            'F' => OscArg::Bool(false),
            'N' => OscArg::Nil,
            'I' => OscArg::Impulse,
            other => bail!("Unsupported OSC type tag '{other}'"),
        };
        args.push(arg);
    }

    Ok(OscMessage { address, args })
}

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

fn pad_to_four(buf: &mut Vec<u8>) {
    buf.resize(align4(buf.len()), 0);
}

fn write_padded_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    // At least one NUL terminator, then pad
    buf.push(0);
    pad_to_four(buf);
}

fn read_padded_str(bytes: &[u8], pos: &mut usize) -> Result<String> {
    let rest = bytes
        .get(*pos..)
        .ok_or_else(|| anyhow!("OSC string starts past end of packet"))?;
    let nul = rest
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| anyhow!("Unterminated OSC string"))?;
    let s = std::str::from_utf8(&rest[..nul])
        .map_err(|e| anyhow!("OSC string is not UTF-8: {e}"))?
        .to_string();
    *pos = align4(*pos + nul + 1);
    Ok(s)
}

fn take_array<const N: usize>(bytes: &[u8], pos: &mut usize) -> Result<[u8; N]> {
    let end = *pos + N;
    let slice = bytes
        .get(*pos..end)
        .ok_or_else(|| anyhow!("OSC packet truncated at byte {}", *pos))?;
    let mut out = [0u8; N];
    out.copy_from_slice(slice);
    *pos = end;
    Ok(out)
}
