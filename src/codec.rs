// SPDX-License-Identifier: MIT

//! A declarative, bit-precise binary codec engine.
//!
//! A [Codec] describes a wire layout. Every codec supports two operations:
//! [Codec::pack] turns a [Value] into bytes and [Codec::parse] turns bytes
//! into a [Value]. Codecs are immutable and may be shared between threads,
//! all per-call state lives in a [Context] that is created for a single
//! pack or parse call and dropped when it returns.
//!
//! Fields narrower than a byte pack contiguously, matching the bit-packed
//! layout of USB HID reports:
//!
//! ```
//! # use hidschema::codec::*;
//! # use hidschema::Value;
//! let codec = Codec::map([
//!     ("x", Codec::bits(3).unwrap()),
//!     ("y", Codec::bits(5).unwrap()),
//!     ("z", Codec::U16),
//! ]);
//! let value = Value::map().with("x", 5u8).with("y", 1u8).with("z", 0x1234u16);
//! let bytes = codec.pack(&value).unwrap();
//! assert_eq!(bytes, [0b00001_101, 0x34, 0x12]);
//! assert_eq!(codec.parse(&bytes).unwrap().data, value);
//! ```
//!
//! Later fields may depend on fields that were already produced, e.g. a
//! byte span whose length is stored in a preceding field:
//!
//! ```
//! # use hidschema::codec::*;
//! # use hidschema::Value;
//! let codec = Codec::map([
//!     ("len", Codec::U8),
//!     ("data", Codec::bytes("len")),
//! ]);
//! let parsed = codec.parse(&[2, 0xaa, 0xbb, 0xcc]).unwrap();
//! assert_eq!(parsed.size, 3);
//! assert_eq!(parsed.data.get("data"), Some(&Value::Bytes(vec![0xaa, 0xbb])));
//! ```

use crate::bits::{bytes_for, fits, read_bits, write_bits};
use crate::value::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("Cannot encode {value} as {codec}")]
    EncodeRange { codec: String, value: String },
    #[error("Cannot decode {codec}: {message}")]
    DecodeRange { codec: String, message: String },
    #[error("Invalid size {size} for {codec}")]
    InvalidSize { codec: String, size: usize },
    #[error("Unknown choice {key}, expected one of {valid:?}")]
    UnknownChoice { key: i64, valid: Vec<i64> },
    #[error("Insufficient data: missing {name}")]
    InsufficientData { name: String },
    #[error("Budget of {budget} bytes not matched exactly, {consumed} bits consumed")]
    BudgetExceeded { budget: usize, consumed: usize },
    #[error("Cannot embed {message}")]
    Shape { message: String },
}

pub type Result<T> = std::result::Result<T, CodecError>;

/// Byte order of byte-aligned multi-byte scalars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endian {
    #[default]
    Little,
    Big,
}

// ---------------------------- Context -----------------------------------

#[derive(Clone, Copy)]
enum Scope<'a> {
    Empty,
    Named(&'a [(String, Value)]),
    Positional(&'a [Value]),
}

/// The lookup scope of a single pack or parse call.
///
/// Each structured codec exposes its in-progress result (or, when packing,
/// its source value) to its members through a child context. Lookups walk
/// from the innermost scope outwards through the parent links, so a member
/// can read any sibling or ancestor field that already exists. Contexts only
/// borrow, they never own the values they expose.
#[derive(Clone, Copy)]
pub struct Context<'a> {
    scope: Scope<'a>,
    parent: Option<&'a Context<'a>>,
}

impl Context<'static> {
    /// A context without any values.
    pub fn root() -> Context<'static> {
        Context {
            scope: Scope::Empty,
            parent: None,
        }
    }
}

impl<'a> Context<'a> {
    /// A root context exposing caller-supplied values.
    pub fn with_values(values: &'a [(String, Value)]) -> Context<'a> {
        Context {
            scope: Scope::Named(values),
            parent: None,
        }
    }

    fn nested(scope: Scope<'a>, parent: &'a Context<'a>) -> Context<'a> {
        Context {
            scope,
            parent: Some(parent),
        }
    }

    /// Find the closest value with the given name.
    pub fn get(&self, name: &str) -> Option<&'a Value> {
        let found = match self.scope {
            Scope::Named(entries) => entries.iter().rev().find(|(n, _)| n == name),
            Scope::Empty | Scope::Positional(_) => None,
        };
        match found {
            Some((_, value)) => Some(value),
            None => self.parent.and_then(|p| p.get(name)),
        }
    }

    /// Find the closest value with the given name and convert it to an
    /// integer.
    pub fn integer(&self, name: &str) -> Result<i64> {
        let value = self.get(name).ok_or_else(|| CodecError::InsufficientData {
            name: name.to_owned(),
        })?;
        value.as_i64().ok_or_else(|| CodecError::DecodeRange {
            codec: format!("context field {name}"),
            message: format!("{value} is not an integer"),
        })
    }

    /// The enclosing context, if any.
    pub fn parent(&self) -> Option<&'a Context<'a>> {
        self.parent
    }

    /// True if the innermost aggregate is map-shaped.
    pub fn is_named(&self) -> bool {
        matches!(self.scope, Scope::Named(_))
    }

    /// The number of elements already produced by the innermost positional
    /// aggregate, i.e. the index of the element being processed.
    pub fn position(&self) -> Option<usize> {
        match self.scope {
            Scope::Positional(items) => Some(items.len()),
            _ => None,
        }
    }
}

// ---------------------------- sizes -------------------------------------

type LengthFn = dyn Fn(&Context<'_>) -> Result<usize> + Send + Sync;
type ChooseFn = dyn Fn(&Context<'_>) -> Result<i64> + Send + Sync;
type FillFn = dyn Fn(&Context<'_>) -> Result<u8> + Send + Sync;
type PadDecodeFn = dyn Fn(&[u8]) -> Value + Send + Sync;

/// A length that is either static or resolved from the [Context].
#[derive(Clone)]
pub enum Length {
    Fixed(usize),
    /// The integer value of the closest field with this name.
    Field(String),
    Computed(Arc<LengthFn>),
}

impl Length {
    pub fn computed(f: impl Fn(&Context<'_>) -> Result<usize> + Send + Sync + 'static) -> Length {
        Length::Computed(Arc::new(f))
    }

    pub fn fixed(&self) -> Option<usize> {
        match self {
            Length::Fixed(n) => Some(*n),
            _ => None,
        }
    }

    fn resolve(&self, ctx: &Context<'_>) -> Result<usize> {
        match self {
            Length::Fixed(n) => Ok(*n),
            Length::Field(name) => {
                let v = ctx.integer(name)?;
                usize::try_from(v).map_err(|_| CodecError::InvalidSize {
                    codec: format!("length field {name}"),
                    size: 0,
                })
            }
            Length::Computed(f) => f(ctx),
        }
    }
}

impl fmt::Debug for Length {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Length::Fixed(n) => write!(f, "Fixed({n})"),
            Length::Field(name) => write!(f, "Field({name:?})"),
            Length::Computed(_) => write!(f, "Computed"),
        }
    }
}

impl From<usize> for Length {
    fn from(n: usize) -> Length {
        Length::Fixed(n)
    }
}

impl From<&str> for Length {
    fn from(name: &str) -> Length {
        Length::Field(name.to_owned())
    }
}

/// The extent of an opaque span.
#[derive(Debug, Clone)]
pub enum Span {
    Bytes(Length),
    Bits(Length),
}

impl Span {
    fn bits(&self, ctx: &Context<'_>) -> Result<usize> {
        match self {
            Span::Bytes(len) => Ok(len.resolve(ctx)? * 8),
            Span::Bits(len) => len.resolve(ctx),
        }
    }

    fn static_bits(&self) -> Option<usize> {
        match self {
            Span::Bytes(len) => len.fixed().map(|n| n * 8),
            Span::Bits(len) => len.fixed(),
        }
    }
}

// ---------------------------- composites --------------------------------

/// Skipped space. Packs as zero bytes unless a fill function is given and
/// parses as `0` unless a decode function is given.
#[derive(Clone)]
pub struct Padding {
    span: Span,
    fill: Option<Arc<FillFn>>,
    decode: Option<Arc<PadDecodeFn>>,
}

impl Padding {
    pub fn new(span: Span) -> Padding {
        Padding {
            span,
            fill: None,
            decode: None,
        }
    }

    /// Fill every written byte with the result of `f`.
    pub fn fill(mut self, f: impl Fn(&Context<'_>) -> Result<u8> + Send + Sync + 'static) -> Padding {
        self.fill = Some(Arc::new(f));
        self
    }

    /// Report the skipped bytes through `f` instead of `0`.
    pub fn decode(mut self, f: impl Fn(&[u8]) -> Value + Send + Sync + 'static) -> Padding {
        self.decode = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for Padding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Padding")
            .field("span", &self.span)
            .field("fill", &self.fill.is_some())
            .field("decode", &self.decode.is_some())
            .finish()
    }
}

/// Produces the key a [Branch] dispatches on.
#[derive(Clone)]
pub enum Chooser {
    /// The integer value of the closest field with this name.
    Field(String),
    Computed(Arc<ChooseFn>),
}

impl Chooser {
    pub fn computed(f: impl Fn(&Context<'_>) -> Result<i64> + Send + Sync + 'static) -> Chooser {
        Chooser::Computed(Arc::new(f))
    }
}

impl fmt::Debug for Chooser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Chooser::Field(name) => write!(f, "Field({name:?})"),
            Chooser::Computed(_) => write!(f, "Computed"),
        }
    }
}

impl From<&str> for Chooser {
    fn from(name: &str) -> Chooser {
        Chooser::Field(name.to_owned())
    }
}

/// Dispatch to exactly one of several codecs.
#[derive(Debug, Clone)]
pub struct Branch {
    chooser: Chooser,
    choices: Vec<(i64, Codec)>,
    default: Option<Box<Codec>>,
}

impl Branch {
    fn select(&self, ctx: &Context<'_>) -> Result<&Codec> {
        let key = match &self.chooser {
            Chooser::Field(name) => ctx.integer(name)?,
            Chooser::Computed(f) => f(ctx)?,
        };
        self.choices
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, codec)| codec)
            .or(self.default.as_deref())
            .ok_or_else(|| CodecError::UnknownChoice {
                key,
                valid: self.choices.iter().map(|(k, _)| *k).collect(),
            })
    }
}

/// How often a [Repeat] repeats its element.
#[derive(Debug, Clone)]
pub enum RepeatBy {
    /// Exactly this many elements.
    Count(Length),
    /// Exactly this many bytes worth of elements.
    Bytes(Length),
}

#[derive(Debug, Clone)]
pub struct Repeat {
    by: RepeatBy,
    element: Box<Codec>,
}

// ---------------------------- Codec -------------------------------------

/// A composable binary codec, see the [module documentation](self).
#[derive(Debug, Clone)]
pub enum Codec {
    /// An unsigned bitfield of 1 to 7 bits.
    Bits(u8),
    /// An unsigned integer of 1 to 7, 8, 16, 32 or 64 bits. If `wide` is
    /// set, 64-bit values parse as [Value::Wide].
    Uint { bits: u8, endian: Endian, wide: bool },
    /// A two's complement integer of 8, 16 or 32 bits.
    Int { bits: u8, endian: Endian },
    /// An IEEE 754 float of 32 or 64 bits.
    Float { bits: u8, endian: Endian },
    /// An opaque span, parsed as [Value::Bytes]. Bit spans are stored
    /// LSB-first with the unused high bits of the last byte zeroed.
    Bytes(Span),
    /// UTF-8 text in a span of this many bytes, zero padded.
    Text(Length),
    Padding(Padding),
    /// Named members in declaration order, parsed as [Value::Map].
    Map(Vec<(String, Codec)>),
    /// Positional members, parsed as [Value::List].
    Array(Vec<Codec>),
    Branch(Branch),
    /// Flattens the result of the inner codec into the enclosing
    /// [Codec::Map] or [Codec::Array] instead of nesting it.
    Embed(Box<Codec>),
    Repeat(Repeat),
}

/// The result of [Codec::parse].
#[derive(Debug, Clone, PartialEq)]
pub struct Parsed {
    pub data: Value,
    /// The number of bytes consumed, rounded up to whole bytes.
    pub size: usize,
}

/// An encoded fragment; `bits` may end mid-byte.
#[derive(Debug, Default)]
struct Packed {
    bytes: Vec<u8>,
    bits: usize,
}

impl Packed {
    /// Concatenate fragments into one freshly sized buffer. The total size
    /// is only known once every fragment exists.
    fn concat(parts: Vec<Packed>) -> Packed {
        let bits = parts.iter().map(|p| p.bits).sum();
        let mut bytes = vec![0u8; bytes_for(bits)];
        let mut offset = 0;
        for part in parts {
            write_bits(&mut bytes, offset, &part.bytes, part.bits);
            offset += part.bits;
        }
        Packed { bytes, bits }
    }
}

impl Codec {
    pub const U8: Codec = Codec::Uint {
        bits: 8,
        endian: Endian::Little,
        wide: false,
    };
    pub const U16: Codec = Codec::Uint {
        bits: 16,
        endian: Endian::Little,
        wide: false,
    };
    pub const U32: Codec = Codec::Uint {
        bits: 32,
        endian: Endian::Little,
        wide: false,
    };
    pub const I8: Codec = Codec::Int {
        bits: 8,
        endian: Endian::Little,
    };
    pub const I16: Codec = Codec::Int {
        bits: 16,
        endian: Endian::Little,
    };
    pub const I32: Codec = Codec::Int {
        bits: 32,
        endian: Endian::Little,
    };

    pub fn bits(n: u8) -> Result<Codec> {
        check_bits(n)?;
        Ok(Codec::Bits(n))
    }

    /// A little-endian unsigned integer.
    pub fn uint(n: u8) -> Result<Codec> {
        Codec::uint_with(n, Endian::Little)
    }

    pub fn uint_with(n: u8, endian: Endian) -> Result<Codec> {
        check_uint(n)?;
        Ok(Codec::Uint {
            bits: n,
            endian,
            wide: false,
        })
    }

    /// A 64-bit unsigned integer that parses as [Value::Wide] and thus
    /// keeps full 64-bit fidelity.
    pub fn wide_uint(endian: Endian) -> Codec {
        Codec::Uint {
            bits: 64,
            endian,
            wide: true,
        }
    }

    /// A little-endian signed integer.
    pub fn int(n: u8) -> Result<Codec> {
        Codec::int_with(n, Endian::Little)
    }

    pub fn int_with(n: u8, endian: Endian) -> Result<Codec> {
        check_int(n)?;
        Ok(Codec::Int { bits: n, endian })
    }

    /// A little-endian float.
    pub fn float(n: u8) -> Result<Codec> {
        Codec::float_with(n, Endian::Little)
    }

    pub fn float_with(n: u8, endian: Endian) -> Result<Codec> {
        check_float(n)?;
        Ok(Codec::Float { bits: n, endian })
    }

    /// An opaque byte span.
    pub fn bytes(len: impl Into<Length>) -> Codec {
        Codec::Bytes(Span::Bytes(len.into()))
    }

    /// An opaque bit span.
    pub fn bit_span(len: impl Into<Length>) -> Codec {
        Codec::Bytes(Span::Bits(len.into()))
    }

    pub fn text(len: impl Into<Length>) -> Codec {
        Codec::Text(len.into())
    }

    /// Zero-filled padding of `nbits` bits.
    pub fn padding(nbits: usize) -> Codec {
        Codec::Padding(Padding::new(Span::Bits(Length::Fixed(nbits))))
    }

    pub fn map<S: Into<String>>(fields: impl IntoIterator<Item = (S, Codec)>) -> Codec {
        Codec::Map(fields.into_iter().map(|(n, c)| (n.into(), c)).collect())
    }

    pub fn array(items: impl IntoIterator<Item = Codec>) -> Codec {
        Codec::Array(items.into_iter().collect())
    }

    pub fn branch(chooser: impl Into<Chooser>, choices: impl IntoIterator<Item = (i64, Codec)>) -> Codec {
        Codec::Branch(Branch {
            chooser: chooser.into(),
            choices: choices.into_iter().collect(),
            default: None,
        })
    }

    /// A [Codec::Branch] with a fallback for unmatched keys.
    pub fn branch_or(
        chooser: impl Into<Chooser>,
        choices: impl IntoIterator<Item = (i64, Codec)>,
        default: Codec,
    ) -> Codec {
        Codec::Branch(Branch {
            chooser: chooser.into(),
            choices: choices.into_iter().collect(),
            default: Some(Box::new(default)),
        })
    }

    pub fn embed(inner: Codec) -> Codec {
        Codec::Embed(Box::new(inner))
    }

    pub fn repeat(count: impl Into<Length>, element: Codec) -> Codec {
        Codec::Repeat(Repeat {
            by: RepeatBy::Count(count.into()),
            element: Box::new(element),
        })
    }

    pub fn repeat_bytes(budget: impl Into<Length>, element: Codec) -> Codec {
        Codec::Repeat(Repeat {
            by: RepeatBy::Bytes(budget.into()),
            element: Box::new(element),
        })
    }

    /// The packed size in bits if it does not depend on the [Context].
    pub fn static_bits(&self) -> Option<usize> {
        match self {
            Codec::Bits(n) => Some(usize::from(*n)),
            Codec::Uint { bits, .. } | Codec::Int { bits, .. } | Codec::Float { bits, .. } => {
                Some(usize::from(*bits))
            }
            Codec::Bytes(span) => span.static_bits(),
            Codec::Padding(padding) => padding.span.static_bits(),
            Codec::Text(len) => len.fixed().map(|n| n * 8),
            Codec::Map(fields) => fields.iter().map(|(_, c)| c.static_bits()).sum(),
            Codec::Array(items) => items.iter().map(Codec::static_bits).sum(),
            Codec::Branch(_) => None,
            Codec::Embed(inner) => inner.static_bits(),
            Codec::Repeat(Repeat { by, element }) => match by {
                RepeatBy::Count(Length::Fixed(n)) => element.static_bits().map(|b| b * n),
                RepeatBy::Bytes(Length::Fixed(n)) => Some(n * 8),
                _ => None,
            },
        }
    }

    /// Pack `value` into a freshly allocated buffer.
    pub fn pack(&self, value: &Value) -> Result<Vec<u8>> {
        self.pack_with(value, &Context::root())
    }

    pub fn pack_with(&self, value: &Value, ctx: &Context<'_>) -> Result<Vec<u8>> {
        Ok(self.encode(value, ctx)?.bytes)
    }

    /// Pack `value` into `buffer` starting at `byte_offset` and return the
    /// number of bytes written. Bits of a trailing partial byte that are
    /// not part of the value are preserved.
    pub fn pack_into(&self, value: &Value, buffer: &mut [u8], byte_offset: usize) -> Result<usize> {
        let packed = self.encode(value, &Context::root())?;
        let size = bytes_for(packed.bits);
        if !fits(buffer.len(), byte_offset * 8, packed.bits) {
            return Err(CodecError::EncodeRange {
                codec: self.to_string(),
                value: format!(
                    "{size} bytes at offset {byte_offset} into a buffer of {} bytes",
                    buffer.len()
                ),
            });
        }
        write_bits(buffer, byte_offset * 8, &packed.bytes, packed.bits);
        Ok(size)
    }

    /// Parse a value from the start of `bytes`.
    pub fn parse(&self, bytes: &[u8]) -> Result<Parsed> {
        self.parse_at(bytes, 0)
    }

    pub fn parse_at(&self, bytes: &[u8], byte_offset: usize) -> Result<Parsed> {
        self.parse_with(bytes, byte_offset, &Context::root())
    }

    pub fn parse_with(&self, bytes: &[u8], byte_offset: usize, ctx: &Context<'_>) -> Result<Parsed> {
        let (data, bits) = self.decode(bytes, byte_offset * 8, ctx)?;
        Ok(Parsed {
            data,
            size: bytes_for(bits),
        })
    }

    fn encode(&self, value: &Value, ctx: &Context<'_>) -> Result<Packed> {
        match self {
            Codec::Bits(n) => {
                check_bits(*n)?;
                self.encode_uint(value, *n, Endian::Little)
            }
            Codec::Uint { bits, endian, .. } => {
                check_uint(*bits)?;
                self.encode_uint(value, *bits, *endian)
            }
            Codec::Int { bits, endian } => {
                check_int(*bits)?;
                self.encode_int(value, *bits, *endian)
            }
            Codec::Float { bits, endian } => {
                check_float(*bits)?;
                self.encode_float(value, *bits, *endian)
            }
            Codec::Bytes(span) => {
                let bits = span.bits(ctx)?;
                let bytes = value.as_bytes().ok_or_else(|| self.range(value))?;
                if bytes.len() != bytes_for(bits) {
                    return Err(self.range(value));
                }
                Ok(Packed {
                    bytes: bytes.to_vec(),
                    bits,
                })
            }
            Codec::Text(len) => {
                let len = len.resolve(ctx)?;
                let text = value.as_str().ok_or_else(|| self.range(value))?;
                if text.len() > len {
                    return Err(self.range(value));
                }
                let mut bytes = text.as_bytes().to_vec();
                bytes.resize(len, 0);
                Ok(Packed { bytes, bits: len * 8 })
            }
            Codec::Padding(padding) => {
                let bits = padding.span.bits(ctx)?;
                let fill = match &padding.fill {
                    Some(f) => f(ctx)?,
                    None => 0,
                };
                Ok(Packed {
                    bytes: vec![fill; bytes_for(bits)],
                    bits,
                })
            }
            Codec::Map(fields) => encode_map(fields, value, ctx),
            Codec::Array(items) => {
                let values = value.items().ok_or_else(|| self.range(value))?;
                let scope = Context::nested(Scope::Positional(values), ctx);
                let mut cursor = 0;
                let parts = encode_positional(items, values, &mut cursor, &scope)?;
                if cursor != values.len() {
                    return Err(CodecError::EncodeRange {
                        codec: self.to_string(),
                        value: format!("{} elements, expected {cursor}", values.len()),
                    });
                }
                Ok(Packed::concat(parts))
            }
            Codec::Branch(branch) => branch.select(ctx)?.encode(value, ctx),
            Codec::Embed(inner) => inner.encode(value, ctx),
            Codec::Repeat(repeat) => {
                let values = value.items().ok_or_else(|| self.range(value))?;
                repeat.encode(values, ctx)
            }
        }
    }

    /// Encode an embedded codec inside a positional container, consuming
    /// as many values as the codec produces when parsed.
    fn encode_spread(&self, values: &[Value], cursor: &mut usize, ctx: &Context<'_>) -> Result<Vec<Packed>> {
        match self {
            Codec::Array(items) => encode_positional(items, values, cursor, ctx),
            Codec::Branch(branch) => branch.select(ctx)?.encode_spread(values, cursor, ctx),
            Codec::Embed(inner) => inner.encode_spread(values, cursor, ctx),
            Codec::Map(_) => Err(CodecError::Shape {
                message: "a named structure into a positional one".into(),
            }),
            Codec::Repeat(repeat) => {
                let rest = values.get(*cursor..).unwrap_or_default();
                let n = match &repeat.by {
                    RepeatBy::Count(len) => len.resolve(ctx)?.min(rest.len()),
                    RepeatBy::Bytes(_) => rest.len(),
                };
                let packed = repeat.encode(&rest[..n], ctx)?;
                *cursor += n;
                Ok(vec![packed])
            }
            _ => {
                let value = values.get(*cursor).ok_or_else(|| CodecError::InsufficientData {
                    name: format!("[{cursor}]"),
                })?;
                *cursor += 1;
                Ok(vec![self.encode(value, ctx)?])
            }
        }
    }

    fn decode(&self, data: &[u8], offset: usize, ctx: &Context<'_>) -> Result<(Value, usize)> {
        match self {
            Codec::Bits(n) => {
                check_bits(*n)?;
                let raw = self.read(data, offset, usize::from(*n))?;
                Ok((Value::Integer(i64::from(raw[0])), usize::from(*n)))
            }
            Codec::Uint { bits, endian, wide } => {
                check_uint(*bits)?;
                let raw = self.read(data, offset, usize::from(*bits))?;
                let value = self.decode_uint(&raw, *bits, *endian, *wide)?;
                Ok((value, usize::from(*bits)))
            }
            Codec::Int { bits, endian } => {
                check_int(*bits)?;
                let raw = self.read(data, offset, usize::from(*bits))?;
                let value = match (bits, endian) {
                    (8, _) => i64::from(raw[0] as i8),
                    (16, Endian::Little) => i64::from(i16::from_le_bytes([raw[0], raw[1]])),
                    (16, Endian::Big) => i64::from(i16::from_be_bytes([raw[0], raw[1]])),
                    (_, Endian::Little) => i64::from(i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])),
                    (_, Endian::Big) => i64::from(i32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]])),
                };
                Ok((Value::Integer(value), usize::from(*bits)))
            }
            Codec::Float { bits, endian } => {
                check_float(*bits)?;
                let raw = self.read(data, offset, usize::from(*bits))?;
                let value = if *bits == 32 {
                    let b = [raw[0], raw[1], raw[2], raw[3]];
                    f64::from(match endian {
                        Endian::Little => f32::from_le_bytes(b),
                        Endian::Big => f32::from_be_bytes(b),
                    })
                } else {
                    let b = [raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7]];
                    match endian {
                        Endian::Little => f64::from_le_bytes(b),
                        Endian::Big => f64::from_be_bytes(b),
                    }
                };
                Ok((Value::Float(value), usize::from(*bits)))
            }
            Codec::Bytes(span) => {
                let bits = span.bits(ctx)?;
                let raw = self.read(data, offset, bits)?;
                Ok((Value::Bytes(raw), bits))
            }
            Codec::Text(len) => {
                let bits = len.resolve(ctx)? * 8;
                let mut raw = self.read(data, offset, bits)?;
                while raw.last() == Some(&0) {
                    raw.pop();
                }
                let text = String::from_utf8(raw).map_err(|e| CodecError::DecodeRange {
                    codec: self.to_string(),
                    message: e.to_string(),
                })?;
                Ok((Value::Text(text), bits))
            }
            Codec::Padding(padding) => {
                let bits = padding.span.bits(ctx)?;
                let raw = self.read(data, offset, bits)?;
                let value = match &padding.decode {
                    Some(f) => f(&raw),
                    None => Value::Integer(0),
                };
                Ok((value, bits))
            }
            Codec::Map(fields) => {
                let mut entries: Vec<(String, Value)> = Vec::with_capacity(fields.len());
                let mut consumed = 0;
                for (name, codec) in fields {
                    let (value, bits) = {
                        let scope = Context::nested(Scope::Named(&entries), ctx);
                        match codec {
                            Codec::Embed(inner) => inner.decode(data, offset + consumed, &scope)?,
                            _ => codec.decode(data, offset + consumed, &scope)?,
                        }
                    };
                    consumed += bits;
                    match codec {
                        Codec::Embed(_) => merge_named(&mut entries, value)?,
                        _ => entries.push((name.clone(), value)),
                    }
                }
                Ok((Value::Map(entries), consumed))
            }
            Codec::Array(codecs) => {
                let mut items: Vec<Value> = Vec::with_capacity(codecs.len());
                let mut consumed = 0;
                for codec in codecs {
                    let (value, bits) = {
                        let scope = Context::nested(Scope::Positional(&items), ctx);
                        match codec {
                            Codec::Embed(inner) => inner.decode(data, offset + consumed, &scope)?,
                            _ => codec.decode(data, offset + consumed, &scope)?,
                        }
                    };
                    consumed += bits;
                    match codec {
                        Codec::Embed(_) => merge_positional(&mut items, value)?,
                        _ => items.push(value),
                    }
                }
                Ok((Value::List(items), consumed))
            }
            Codec::Branch(branch) => branch.select(ctx)?.decode(data, offset, ctx),
            Codec::Embed(inner) => inner.decode(data, offset, ctx),
            Codec::Repeat(repeat) => repeat.decode(data, offset, ctx),
        }
    }

    fn read(&self, data: &[u8], offset: usize, nbits: usize) -> Result<Vec<u8>> {
        if !fits(data.len(), offset, nbits) {
            return Err(CodecError::DecodeRange {
                codec: self.to_string(),
                message: format!(
                    "{nbits} bits at bit offset {offset} exceed {} available bits",
                    data.len() * 8
                ),
            });
        }
        Ok(read_bits(data, offset, nbits))
    }

    fn range(&self, value: &Value) -> CodecError {
        CodecError::EncodeRange {
            codec: self.to_string(),
            value: value.to_string(),
        }
    }

    fn encode_uint(&self, value: &Value, bits: u8, endian: Endian) -> Result<Packed> {
        let v = value.as_u64().ok_or_else(|| self.range(value))?;
        if bits < 64 && v >= (1u64 << bits) {
            return Err(self.range(value));
        }
        let bytes = match (bits, endian) {
            (1..=8, _) => vec![v as u8],
            (16, Endian::Little) => (v as u16).to_le_bytes().to_vec(),
            (16, Endian::Big) => (v as u16).to_be_bytes().to_vec(),
            (32, Endian::Little) => (v as u32).to_le_bytes().to_vec(),
            (32, Endian::Big) => (v as u32).to_be_bytes().to_vec(),
            // 64-bit values travel as two 32-bit words in endian order
            (_, Endian::Little) => [(v as u32).to_le_bytes(), ((v >> 32) as u32).to_le_bytes()].concat(),
            (_, Endian::Big) => [((v >> 32) as u32).to_be_bytes(), (v as u32).to_be_bytes()].concat(),
        };
        Ok(Packed {
            bytes,
            bits: usize::from(bits),
        })
    }

    fn decode_uint(&self, raw: &[u8], bits: u8, endian: Endian, wide: bool) -> Result<Value> {
        let v: u64 = match (bits, endian) {
            (1..=8, _) => u64::from(raw[0]),
            (16, Endian::Little) => u64::from(u16::from_le_bytes([raw[0], raw[1]])),
            (16, Endian::Big) => u64::from(u16::from_be_bytes([raw[0], raw[1]])),
            (32, Endian::Little) => u64::from(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])),
            (32, Endian::Big) => u64::from(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]])),
            (_, Endian::Little) => {
                let lo = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
                let hi = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
                (u64::from(hi) << 32) | u64::from(lo)
            }
            (_, Endian::Big) => {
                let hi = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
                let lo = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]);
                (u64::from(hi) << 32) | u64::from(lo)
            }
        };
        if wide {
            return Ok(Value::Wide(v));
        }
        i64::try_from(v).map(Value::Integer).map_err(|_| CodecError::DecodeRange {
            codec: self.to_string(),
            message: format!("{v} exceeds the exact integer limit {}", i64::MAX),
        })
    }

    fn encode_int(&self, value: &Value, bits: u8, endian: Endian) -> Result<Packed> {
        let v = value.as_i64().ok_or_else(|| self.range(value))?;
        let min = -(1i64 << (bits - 1));
        let max = (1i64 << (bits - 1)) - 1;
        if v < min || v > max {
            return Err(self.range(value));
        }
        let bytes = match (bits, endian) {
            (8, _) => vec![v as i8 as u8],
            (16, Endian::Little) => (v as i16).to_le_bytes().to_vec(),
            (16, Endian::Big) => (v as i16).to_be_bytes().to_vec(),
            (_, Endian::Little) => (v as i32).to_le_bytes().to_vec(),
            (_, Endian::Big) => (v as i32).to_be_bytes().to_vec(),
        };
        Ok(Packed {
            bytes,
            bits: usize::from(bits),
        })
    }

    fn encode_float(&self, value: &Value, bits: u8, endian: Endian) -> Result<Packed> {
        let v = value.as_f64().ok_or_else(|| self.range(value))?;
        let bytes = if bits == 32 {
            if v.is_finite() && v.abs() > f64::from(f32::MAX) {
                return Err(self.range(value));
            }
            match endian {
                Endian::Little => (v as f32).to_le_bytes().to_vec(),
                Endian::Big => (v as f32).to_be_bytes().to_vec(),
            }
        } else {
            match endian {
                Endian::Little => v.to_le_bytes().to_vec(),
                Endian::Big => v.to_be_bytes().to_vec(),
            }
        };
        Ok(Packed {
            bytes,
            bits: usize::from(bits),
        })
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Codec::Bits(n) => write!(f, "Bits({n})"),
            Codec::Uint { bits, .. } => write!(f, "Uint({bits})"),
            Codec::Int { bits, .. } => write!(f, "Int({bits})"),
            Codec::Float { bits, .. } => write!(f, "Float({bits})"),
            Codec::Bytes(Span::Bytes(len)) => write!(f, "Bytes({len:?})"),
            Codec::Bytes(Span::Bits(len)) => write!(f, "BitSpan({len:?})"),
            Codec::Text(len) => write!(f, "Text({len:?})"),
            Codec::Padding(p) => write!(f, "Padding({:?})", p.span),
            Codec::Map(fields) => write!(f, "Map({})", fields.len()),
            Codec::Array(items) => write!(f, "Array({})", items.len()),
            Codec::Branch(b) => write!(f, "Branch({:?})", b.chooser),
            Codec::Embed(inner) => write!(f, "Embed({inner})"),
            Codec::Repeat(r) => write!(f, "Repeat({:?}, {})", r.by, r.element),
        }
    }
}

impl Repeat {
    fn encode(&self, values: &[Value], ctx: &Context<'_>) -> Result<Packed> {
        let scope = Context::nested(Scope::Positional(values), ctx);
        match &self.by {
            RepeatBy::Count(len) => {
                let count = len.resolve(ctx)?;
                if values.len() < count {
                    return Err(CodecError::InsufficientData {
                        name: format!("[{}]", values.len()),
                    });
                }
                if values.len() > count {
                    return Err(CodecError::EncodeRange {
                        codec: format!("Repeat({count})"),
                        value: format!("{} elements", values.len()),
                    });
                }
                let parts = values
                    .iter()
                    .map(|v| self.element.encode(v, &scope))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Packed::concat(parts))
            }
            RepeatBy::Bytes(len) => {
                let budget = len.resolve(ctx)?;
                let mut consumed = 0;
                let mut parts = Vec::with_capacity(values.len());
                for value in values {
                    let part = self.element.encode(value, &scope)?;
                    consumed += part.bits;
                    if consumed > budget * 8 {
                        return Err(CodecError::BudgetExceeded { budget, consumed });
                    }
                    parts.push(part);
                }
                if consumed != budget * 8 {
                    return Err(CodecError::BudgetExceeded { budget, consumed });
                }
                Ok(Packed::concat(parts))
            }
        }
    }

    fn decode(&self, data: &[u8], offset: usize, ctx: &Context<'_>) -> Result<(Value, usize)> {
        let mut items: Vec<Value> = Vec::new();
        let mut consumed = 0;
        match &self.by {
            RepeatBy::Count(len) => {
                let count = len.resolve(ctx)?;
                for _ in 0..count {
                    let (value, bits) = {
                        let scope = Context::nested(Scope::Positional(&items), ctx);
                        self.element.decode(data, offset + consumed, &scope)?
                    };
                    consumed += bits;
                    items.push(value);
                }
            }
            RepeatBy::Bytes(len) => {
                let budget = len.resolve(ctx)?;
                let budget_bits = budget * 8;
                while consumed < budget_bits {
                    let result = {
                        let scope = Context::nested(Scope::Positional(&items), ctx);
                        self.element.decode(data, offset + consumed, &scope)
                    };
                    let (value, bits) = match result {
                        // the data covers the budget, so the element ran past it
                        Err(CodecError::DecodeRange { .. }) if fits(data.len(), offset, budget_bits) => {
                            return Err(CodecError::BudgetExceeded { budget, consumed });
                        }
                        r => r?,
                    };
                    if bits == 0 {
                        return Err(CodecError::InvalidSize {
                            codec: format!("{} in Repeat", self.element),
                            size: 0,
                        });
                    }
                    consumed += bits;
                    if consumed > budget_bits {
                        return Err(CodecError::BudgetExceeded { budget, consumed });
                    }
                    items.push(value);
                }
            }
        }
        Ok((Value::List(items), consumed))
    }
}

fn encode_map(fields: &[(String, Codec)], value: &Value, ctx: &Context<'_>) -> Result<Packed> {
    let entries = value.entries().ok_or_else(|| CodecError::EncodeRange {
        codec: format!("Map({})", fields.len()),
        value: value.to_string(),
    })?;
    let scope = Context::nested(Scope::Named(entries), ctx);
    let mut parts = Vec::with_capacity(fields.len());
    for (name, codec) in fields {
        let part = match codec {
            // embedded members read their fields from the enclosing value
            Codec::Embed(inner) => inner.encode(value, &scope)?,
            _ => {
                let member = value.get(name).ok_or_else(|| CodecError::InsufficientData {
                    name: name.clone(),
                })?;
                codec.encode(member, &scope)?
            }
        };
        parts.push(part);
    }
    Ok(Packed::concat(parts))
}

fn encode_positional(
    codecs: &[Codec],
    values: &[Value],
    cursor: &mut usize,
    ctx: &Context<'_>,
) -> Result<Vec<Packed>> {
    let mut parts = Vec::with_capacity(codecs.len());
    for codec in codecs {
        match codec {
            Codec::Embed(inner) => parts.extend(inner.encode_spread(values, cursor, ctx)?),
            _ => {
                let value = values.get(*cursor).ok_or_else(|| CodecError::InsufficientData {
                    name: format!("[{cursor}]"),
                })?;
                parts.push(codec.encode(value, ctx)?);
                *cursor += 1;
            }
        }
    }
    Ok(parts)
}

/// Flatten an embedded result into a named container. Scalars (padding)
/// have no name and contribute nothing.
fn merge_named(entries: &mut Vec<(String, Value)>, value: Value) -> Result<()> {
    match value {
        Value::Map(sub) => entries.extend(sub),
        Value::List(_) => {
            return Err(CodecError::Shape {
                message: "a positional structure into a named one".into(),
            })
        }
        _ => {}
    }
    Ok(())
}

fn merge_positional(items: &mut Vec<Value>, value: Value) -> Result<()> {
    match value {
        Value::List(sub) => items.extend(sub),
        Value::Map(_) => {
            return Err(CodecError::Shape {
                message: "a named structure into a positional one".into(),
            })
        }
        other => items.push(other),
    }
    Ok(())
}

fn check_bits(n: u8) -> Result<()> {
    match n {
        1..=7 => Ok(()),
        _ => Err(CodecError::InvalidSize {
            codec: "Bits".into(),
            size: usize::from(n),
        }),
    }
}

fn check_uint(n: u8) -> Result<()> {
    match n {
        1..=8 | 16 | 32 | 64 => Ok(()),
        _ => Err(CodecError::InvalidSize {
            codec: "Uint".into(),
            size: usize::from(n),
        }),
    }
}

fn check_int(n: u8) -> Result<()> {
    match n {
        8 | 16 | 32 => Ok(()),
        _ => Err(CodecError::InvalidSize {
            codec: "Int".into(),
            size: usize::from(n),
        }),
    }
}

fn check_float(n: u8) -> Result<()> {
    match n {
        32 | 64 => Ok(()),
        _ => Err(CodecError::InvalidSize {
            codec: "Float".into(),
            size: usize::from(n),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(codec: &Codec, value: Value) {
        let bytes = codec.pack(&value).unwrap();
        assert_eq!(codec.parse(&bytes).unwrap().data, value, "{codec}");
    }

    #[test]
    fn invalid_sizes() {
        assert!(matches!(Codec::bits(0), Err(CodecError::InvalidSize { .. })));
        assert!(matches!(Codec::bits(8), Err(CodecError::InvalidSize { .. })));
        assert!(matches!(Codec::uint(12), Err(CodecError::InvalidSize { .. })));
        assert!(matches!(Codec::int(64), Err(CodecError::InvalidSize { .. })));
        assert!(matches!(Codec::float(16), Err(CodecError::InvalidSize { .. })));
        assert!(Codec::uint(7).is_ok());
        assert!(Codec::uint(64).is_ok());
    }

    #[test]
    fn uint_range() {
        let codec = Codec::uint(4).unwrap();
        roundtrip(&codec, Value::Integer(15));
        assert!(matches!(
            codec.pack(&Value::Integer(16)),
            Err(CodecError::EncodeRange { .. })
        ));
        assert!(matches!(
            codec.pack(&Value::Integer(-1)),
            Err(CodecError::EncodeRange { .. })
        ));
        assert!(matches!(
            Codec::U8.pack(&Value::Float(1.5)),
            Err(CodecError::EncodeRange { .. })
        ));
        assert_eq!(Codec::U8.pack(&Value::Float(2.0)).unwrap(), [2]);
    }

    #[test]
    fn int_range() {
        roundtrip(&Codec::I8, Value::Integer(-128));
        roundtrip(&Codec::I8, Value::Integer(127));
        roundtrip(&Codec::I16, Value::Integer(-2));
        roundtrip(&Codec::I32, Value::Integer(i64::from(i32::MIN)));
        assert!(matches!(
            Codec::I8.pack(&Value::Integer(128)),
            Err(CodecError::EncodeRange { .. })
        ));
        assert!(matches!(
            Codec::I16.pack(&Value::Integer(-32769)),
            Err(CodecError::EncodeRange { .. })
        ));
        assert_eq!(Codec::I16.pack(&Value::Integer(-2)).unwrap(), [0xfe, 0xff]);
    }

    #[test]
    fn endianness() {
        let be = Codec::uint_with(16, Endian::Big).unwrap();
        assert_eq!(be.pack(&Value::Integer(0x1234)).unwrap(), [0x12, 0x34]);
        assert_eq!(Codec::U16.pack(&Value::Integer(0x1234)).unwrap(), [0x34, 0x12]);
        let be = Codec::uint_with(64, Endian::Big).unwrap();
        let bytes = be.pack(&Value::Integer(0x0102030405060708)).unwrap();
        assert_eq!(bytes, [1, 2, 3, 4, 5, 6, 7, 8]);
        roundtrip(&be, Value::Integer(0x0102030405060708));
        roundtrip(&Codec::int_with(32, Endian::Big).unwrap(), Value::Integer(-5));
    }

    #[test]
    fn uint64_exact_integer_limit() {
        let codec = Codec::uint(64).unwrap();
        roundtrip(&codec, Value::Integer(i64::MAX));

        let above = Value::Wide(i64::MAX as u64 + 1);
        let bytes = codec.pack(&above).unwrap();
        assert!(matches!(codec.parse(&bytes), Err(CodecError::DecodeRange { .. })));

        let wide = Codec::wide_uint(Endian::Little);
        assert_eq!(wide.parse(&bytes).unwrap().data, above);
        roundtrip(&wide, Value::Wide(u64::MAX));
    }

    #[test]
    fn floats() {
        roundtrip(&Codec::float(32).unwrap(), Value::Float(1.5));
        roundtrip(&Codec::float(64).unwrap(), Value::Float(-0.1));
        assert!(matches!(
            Codec::float(32).unwrap().pack(&Value::Float(1e300)),
            Err(CodecError::EncodeRange { .. })
        ));
        assert!(matches!(
            Codec::float(32).unwrap().pack(&Value::Text("x".into())),
            Err(CodecError::EncodeRange { .. })
        ));
    }

    #[test]
    fn bit_fields_pack_contiguously() {
        let codec = Codec::array([
            Codec::bits(1).unwrap(),
            Codec::bits(1).unwrap(),
            Codec::bits(1).unwrap(),
            Codec::padding(5),
            Codec::I8,
        ]);
        let value = Value::List(vec![1u8.into(), 0u8.into(), 1u8.into(), 0u8.into(), (-1i8).into()]);
        let bytes = codec.pack(&value).unwrap();
        assert_eq!(bytes, [0b101, 0xff]);
        assert_eq!(codec.parse(&bytes).unwrap().data, value);
        assert_eq!(codec.static_bits(), Some(16));
    }

    #[test]
    fn unaligned_multibyte() {
        let codec = Codec::map([("a", Codec::bits(3).unwrap()), ("b", Codec::U16), ("c", Codec::bits(5).unwrap())]);
        let value = Value::map().with("a", 0b101u8).with("b", 0xbeefu16).with("c", 0b10011u8);
        let bytes = codec.pack(&value).unwrap();
        assert_eq!(bytes.len(), 3);
        assert_eq!(codec.parse(&bytes).unwrap(), Parsed { data: value, size: 3 });
    }

    #[test]
    fn pack_into_preserves_neighbours() {
        let codec = Codec::bits(3).unwrap();
        let mut buffer = [0b000_11111u8, 0xaa];
        // a 3-bit field at bit offset 5 via an enclosing array
        let codec = Codec::array([Codec::padding(5), codec]);
        let packed = codec.pack(&Value::List(vec![0u8.into(), 0b110u8.into()])).unwrap();
        assert_eq!(packed, [0b110_00000]);

        let size = Codec::U8.pack_into(&Value::Integer(7), &mut buffer, 1).unwrap();
        assert_eq!(size, 1);
        assert_eq!(buffer, [0b000_11111, 7]);
        assert!(matches!(
            Codec::U16.pack_into(&Value::Integer(7), &mut buffer, 1),
            Err(CodecError::EncodeRange { .. })
        ));
    }

    #[test]
    fn parse_at_offset() {
        let parsed = Codec::U16.parse_at(&[0xff, 0x34, 0x12], 1).unwrap();
        assert_eq!(parsed.data, Value::Integer(0x1234));
        assert_eq!(parsed.size, 2);
        assert!(matches!(Codec::U32.parse(&[1, 2]), Err(CodecError::DecodeRange { .. })));
    }

    #[test]
    fn text() {
        let codec = Codec::text(6usize);
        let bytes = codec.pack(&Value::from("héllo")).unwrap();
        assert_eq!(bytes, [b'h', 0xc3, 0xa9, b'l', b'l', b'o']);
        roundtrip(&codec, Value::from("hi"));
        assert_eq!(codec.pack(&"hi".into()).unwrap(), [b'h', b'i', 0, 0, 0, 0]);
        assert!(matches!(codec.pack(&"too long".into()), Err(CodecError::EncodeRange { .. })));
        assert!(matches!(codec.parse(&[0xff; 6]), Err(CodecError::DecodeRange { .. })));
    }

    #[test]
    fn padding_fill_and_decode() {
        let codec = Codec::Padding(Padding::new(Span::Bytes(2.into())).fill(|_| Ok(0xee)));
        assert_eq!(codec.pack(&Value::Integer(0)).unwrap(), [0xee, 0xee]);
        assert_eq!(codec.parse(&[1, 2]).unwrap().data, Value::Integer(0));

        let codec = Codec::Padding(Padding::new(Span::Bytes(2.into())).decode(|raw| Value::Bytes(raw.to_vec())));
        assert_eq!(codec.parse(&[1, 2]).unwrap().data, Value::Bytes(vec![1, 2]));
    }

    #[test]
    fn bytes_and_bit_spans() {
        let codec = Codec::map([("n", Codec::U8), ("data", Codec::bytes("n"))]);
        let value = Value::map().with("n", 2u8).with("data", vec![1u8, 2]);
        roundtrip(&codec, value);
        let wrong = Value::map().with("n", 3u8).with("data", vec![1u8, 2]);
        assert!(matches!(codec.pack(&wrong), Err(CodecError::EncodeRange { .. })));

        let codec = Codec::array([Codec::bit_span(12usize), Codec::bits(4).unwrap()]);
        let value = Value::List(vec![Value::Bytes(vec![0xbc, 0x0a]), 0xfu8.into()]);
        let bytes = codec.pack(&value).unwrap();
        assert_eq!(bytes, [0xbc, 0xfa]);
        assert_eq!(codec.parse(&bytes).unwrap().data, value);
    }

    #[test]
    fn insufficient_data() {
        let codec = Codec::map([("a", Codec::U8), ("b", Codec::U8)]);
        let err = codec.pack(&Value::map().with("a", 1u8)).unwrap_err();
        assert_eq!(err, CodecError::InsufficientData { name: "b".into() });

        let codec = Codec::array([Codec::U8, Codec::U8]);
        assert!(matches!(
            codec.pack(&Value::List(vec![1u8.into()])),
            Err(CodecError::InsufficientData { .. })
        ));
    }

    #[test]
    fn branch_totality() {
        let codec = Codec::map([
            ("kind", Codec::U8),
            ("body", Codec::branch("kind", [(0, Codec::U8), (1, Codec::U16)])),
        ]);
        let parsed = codec.parse(&[1, 0x34, 0x12]).unwrap();
        assert_eq!(parsed.data.get("body"), Some(&Value::Integer(0x1234)));
        assert_eq!(parsed.size, 3);

        let err = codec.parse(&[2, 0, 0]).unwrap_err();
        assert_eq!(err, CodecError::UnknownChoice { key: 2, valid: vec![0, 1] });

        let err = codec.pack(&Value::map().with("kind", 2u8).with("body", 0u8)).unwrap_err();
        assert!(matches!(err, CodecError::UnknownChoice { key: 2, .. }));

        let fallback = Codec::branch_or("kind", [(0, Codec::U16)], Codec::U8);
        let ctx_values = [("kind".to_string(), Value::Integer(9))];
        let ctx = Context::with_values(&ctx_values);
        assert_eq!(fallback.parse_with(&[5], 0, &ctx).unwrap().data, Value::Integer(5));
    }

    #[test]
    fn embed_flattens_into_map() {
        let codec = Codec::map([
            ("tag", Codec::U8),
            (
                "",
                Codec::embed(Codec::branch(
                    "tag",
                    [
                        (1, Codec::map([("x", Codec::U8)])),
                        (2, Codec::map([("y", Codec::U16)])),
                    ],
                )),
            ),
        ]);
        let parsed = codec.parse(&[2, 0x01, 0x02]).unwrap();
        assert_eq!(parsed.data, Value::map().with("tag", 2u8).with("y", 0x0201u16));
        let bytes = codec.pack(&parsed.data).unwrap();
        assert_eq!(bytes, [2, 0x01, 0x02]);
    }

    #[test]
    fn embed_resolves_through_parent() {
        // the inner map's length lookup reaches the outer "len" field
        let codec = Codec::map([
            ("len", Codec::U8),
            ("", Codec::embed(Codec::map([("kind", Codec::U8), ("data", Codec::bytes("len"))]))),
        ]);
        let parsed = codec.parse(&[2, 7, 0xaa, 0xbb]).unwrap();
        assert_eq!(parsed.data.get("kind"), Some(&Value::Integer(7)));
        assert_eq!(parsed.data.get("data"), Some(&Value::Bytes(vec![0xaa, 0xbb])));

        let nested = Codec::map([
            ("len", Codec::U8),
            ("inner", Codec::map([("data", Codec::bytes("len"))])),
        ]);
        let parsed = nested.parse(&[1, 0xcc]).unwrap();
        assert_eq!(
            parsed.data.get("inner").and_then(|v| v.get("data")),
            Some(&Value::Bytes(vec![0xcc]))
        );
    }

    #[test]
    fn embed_into_array() {
        let codec = Codec::array([Codec::U8, Codec::embed(Codec::array([Codec::U8, Codec::U8]))]);
        let value = Value::List(vec![1u8.into(), 2u8.into(), 3u8.into()]);
        assert_eq!(codec.pack(&value).unwrap(), [1, 2, 3]);
        assert_eq!(codec.parse(&[1, 2, 3]).unwrap().data, value);

        let bad = Codec::array([Codec::embed(Codec::map([("a", Codec::U8)]))]);
        assert!(matches!(bad.parse(&[1]), Err(CodecError::Shape { .. })));
        assert!(matches!(bad.pack(&Value::List(vec![1u8.into()])), Err(CodecError::Shape { .. })));
    }

    #[test]
    fn embedded_padding_is_anonymous() {
        let codec = Codec::map([
            ("a", Codec::bits(3).unwrap()),
            ("", Codec::embed(Codec::padding(5))),
            ("b", Codec::U8),
        ]);
        let value = Value::map().with("a", 1u8).with("b", 2u8);
        assert_eq!(codec.pack(&value).unwrap(), [1, 2]);
        assert_eq!(codec.parse(&[1, 2]).unwrap().data, value);
    }

    #[test]
    fn repeat_count_from_context() {
        let codec = Codec::map([("n", Codec::U8), ("items", Codec::repeat("n", Codec::U16))]);
        let parsed = codec.parse(&[2, 1, 0, 2, 0, 0xff]).unwrap();
        assert_eq!(parsed.size, 5);
        assert_eq!(
            parsed.data.get("items"),
            Some(&Value::List(vec![1u16.into(), 2u16.into()]))
        );
        let short = Value::map().with("n", 3u8).with("items", Value::List(vec![1u16.into()]));
        assert!(matches!(codec.pack(&short), Err(CodecError::InsufficientData { .. })));
    }

    #[test]
    fn repeat_bytes_exact() {
        let codec = Codec::repeat_bytes(4usize, Codec::U8);
        let four = Value::List(vec![1u8.into(), 2u8.into(), 3u8.into(), 4u8.into()]);
        assert_eq!(codec.pack(&four).unwrap(), [1, 2, 3, 4]);
        assert_eq!(codec.parse(&[1, 2, 3, 4, 5]).unwrap(), Parsed { data: four, size: 4 });

        let five = Value::List((1u8..=5).map(Value::from).collect());
        assert!(matches!(codec.pack(&five), Err(CodecError::BudgetExceeded { budget: 4, .. })));
        let three = Value::List((1u8..=3).map(Value::from).collect());
        assert!(matches!(codec.pack(&three), Err(CodecError::BudgetExceeded { budget: 4, .. })));

        // an element straddling the end of the budget
        let codec = Codec::repeat_bytes(3usize, Codec::U16);
        assert!(matches!(
            codec.parse(&[1, 0, 2, 0]),
            Err(CodecError::BudgetExceeded { budget: 3, .. })
        ));
        assert!(matches!(
            codec.parse(&[1, 0, 2]),
            Err(CodecError::BudgetExceeded { budget: 3, .. })
        ));
    }

    #[test]
    fn context_lookup() {
        let values = [("a".to_string(), Value::Integer(1))];
        let root = Context::with_values(&values);
        let inner = [("b".to_string(), Value::Integer(2))];
        let child = Context::nested(Scope::Named(&inner), &root);
        assert_eq!(child.integer("a").unwrap(), 1);
        assert_eq!(child.integer("b").unwrap(), 2);
        assert!(child.is_named());
        assert!(child.parent().is_some());
        assert_eq!(
            child.integer("c").unwrap_err(),
            CodecError::InsufficientData { name: "c".into() }
        );
        let items = [Value::Integer(5)];
        let positional = Context::nested(Scope::Positional(&items), &child);
        assert_eq!(positional.position(), Some(1));
        assert_eq!(positional.integer("a").unwrap(), 1);
    }
}
