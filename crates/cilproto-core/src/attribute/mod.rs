//! Custom attribute decoding for IL2CPP metadata.
//!
//! Starting with metadata version 29, IL2CPP stores every attribute instance
//! attached to a member as a packed blob: the constructor method of each
//! attribute followed by its encoded constructor arguments and named
//! field/property assignments. Older metadata only records attribute types.
//!
//! ## Blob layout (version 29+)
//!
//! ```text
//! count            compressed u32
//! ctor[count]      u32 little-endian method indices
//! per attribute:
//!   argc           compressed u32
//!   fieldc         compressed u32
//!   propc          compressed u32
//!   args[argc]     tagged values
//!   fields[fieldc] tagged value + member reference
//!   props[propc]   tagged value + member reference
//! ```
//!
//! Named field and property assignments are consumed but discarded; only
//! constructor arguments carry information the decompiler needs.

pub mod reader;

pub use reader::BlobReader;

use crate::error::{Error, Result};
use std::fmt;
use tracing::trace;

/// Metadata version at which full attribute blobs become available
pub const ATTRIBUTE_BLOB_VERSION: f32 = 29.0;

/// Highest metadata version that indexes attribute types per member directly
pub const DIRECT_INDEX_MAX_VERSION: f32 = 24.0;

/// IL2CPP type enum values that can appear as value tags in an attribute blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum TypeTag {
    Boolean = 0x02,
    Char = 0x03,
    I1 = 0x04,
    U1 = 0x05,
    I2 = 0x06,
    U2 = 0x07,
    I4 = 0x08,
    U4 = 0x09,
    I8 = 0x0A,
    U8 = 0x0B,
    R4 = 0x0C,
    R8 = 0x0D,
    String = 0x0E,
    Class = 0x12,
    GenericInst = 0x15,
    Object = 0x1C,
    SzArray = 0x1D,
    Enum = 0x55,
    TypeIndex = 0xFF,
}

impl TypeTag {
    /// Maps a raw tag byte, returning `None` for values that never appear in blobs
    pub fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            0x02 => Self::Boolean,
            0x03 => Self::Char,
            0x04 => Self::I1,
            0x05 => Self::U1,
            0x06 => Self::I2,
            0x07 => Self::U2,
            0x08 => Self::I4,
            0x09 => Self::U4,
            0x0A => Self::I8,
            0x0B => Self::U8,
            0x0C => Self::R4,
            0x0D => Self::R8,
            0x0E => Self::String,
            0x12 => Self::Class,
            0x15 => Self::GenericInst,
            0x1C => Self::Object,
            0x1D => Self::SzArray,
            0x55 => Self::Enum,
            0xFF => Self::TypeIndex,
            _ => return None,
        })
    }
}

/// A decoded attribute constructor argument.
///
/// Shared by both metadata backends: the reflection-style backend produces
/// these directly, the IL2CPP backend decodes them from blobs.
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(tag = "kind", content = "value")]
#[allow(missing_docs)]
pub enum AttributeValue {
    Bool(bool),
    Char(u16),
    I1(i8),
    U1(u8),
    I2(i16),
    U2(u16),
    I4(i32),
    U4(u32),
    I8(i64),
    U8(u64),
    R4(f32),
    R8(f64),
    /// `None` encodes a null string
    String(Option<String>),
    /// `None` encodes a null array
    Array(Option<Vec<AttributeValue>>),
    /// A `System.Type` argument resolved to its full name
    Type(String),
    /// A `System.Type` argument left as a raw IL2CPP type index
    TypeIndex(i32),
    /// A null reference passed for a class or object parameter
    Null,
}

impl AttributeValue {
    /// Returns the string payload, if this is a non-null string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(Some(s)) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{}", v),
            Self::Char(v) => write!(f, "'\\u{{{:04x}}}'", v),
            Self::I1(v) => write!(f, "{}", v),
            Self::U1(v) => write!(f, "{}", v),
            Self::I2(v) => write!(f, "{}", v),
            Self::U2(v) => write!(f, "{}", v),
            Self::I4(v) => write!(f, "{}", v),
            Self::U4(v) => write!(f, "{}", v),
            Self::I8(v) => write!(f, "{}", v),
            Self::U8(v) => write!(f, "{}", v),
            Self::R4(v) => write!(f, "{}", v),
            Self::R8(v) => write!(f, "{}", v),
            Self::String(Some(s)) => write!(f, "{:?}", s),
            Self::String(None) | Self::Array(None) | Self::Null => f.write_str("null"),
            Self::Array(Some(items)) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
            Self::Type(name) => write!(f, "typeof({})", name),
            Self::TypeIndex(idx) => write!(f, "typeof(#{})", idx),
        }
    }
}

/// One attribute instance recovered from a blob
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAttribute {
    /// Index of the attribute constructor in the method definition table
    pub constructor_index: u32,
    /// Decoded constructor arguments, in declaration order
    pub arguments: Vec<AttributeValue>,
}

/// Resolves enum-typed values to the tag of their underlying integer type.
pub trait EnumResolver {
    /// Returns the raw type tag of the underlying type of the enum at `type_index`
    fn enum_underlying_tag(&self, type_index: i32) -> Result<u8>;
}

impl<F> EnumResolver for F
where
    F: Fn(i32) -> Result<u8>,
{
    fn enum_underlying_tag(&self, type_index: i32) -> Result<u8> {
        self(type_index)
    }
}

/// How a given metadata version exposes custom attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeMode {
    /// Each member carries an index straight into the attribute type ranges
    DirectIndex,
    /// Attribute type ranges are located by binary search on the member token
    TypeRanges,
    /// Full blobs with constructor arguments, located by token
    DataBlobs,
}

impl AttributeMode {
    /// Selects the mode for a metadata version
    pub fn for_version(version: f32) -> Self {
        if version >= ATTRIBUTE_BLOB_VERSION {
            Self::DataBlobs
        } else if version <= DIRECT_INDEX_MAX_VERSION {
            Self::DirectIndex
        } else {
            Self::TypeRanges
        }
    }

    /// Whether constructor argument values can be recovered in this mode
    pub fn can_read_arguments(self) -> bool {
        self == Self::DataBlobs
    }
}

/// An entry of a token-sorted range table
pub trait TokenRange {
    /// Metadata token this entry belongs to
    fn token(&self) -> u32;
}

/// Binary searches `ranges[start..start + count]` for the entry keyed by `token`.
///
/// Returns the absolute index of the match. A window that falls outside the
/// table, or a token with no entry, yields `None`.
pub fn find_token_range<T: TokenRange>(
    ranges: &[T],
    token: u32,
    start: usize,
    count: usize,
) -> Option<usize> {
    let end = start.checked_add(count)?;
    let window = ranges.get(start..end)?;
    window
        .binary_search_by_key(&token, |r| r.token())
        .ok()
        .map(|i| start + i)
}

/// Decodes every attribute stored in one member's blob.
///
/// Any truncation or unknown tag aborts the whole decode; a partial result
/// would silently misattribute the remaining bytes.
pub fn decode_attribute_blob<R: EnumResolver + ?Sized>(
    blob: &[u8],
    resolver: &R,
) -> Result<Vec<DecodedAttribute>> {
    let mut reader = BlobReader::new(blob);
    let count = reader.read_compressed_u32()? as usize;

    // Each constructor index occupies four bytes; reject absurd counts early.
    if count > reader.remaining() / 4 {
        return Err(Error::malformed_blob(
            0,
            format!("attribute count {} exceeds blob size {}", count, blob.len()),
        ));
    }

    let mut constructors = Vec::with_capacity(count);
    for _ in 0..count {
        constructors.push(reader.read_u32_le()?);
    }

    let mut attributes = Vec::with_capacity(count);
    for constructor_index in constructors {
        let argc = reader.read_compressed_u32()?;
        let fieldc = reader.read_compressed_u32()?;
        let propc = reader.read_compressed_u32()?;

        let mut arguments = Vec::new();
        for _ in 0..argc {
            arguments.push(read_tagged_value(&mut reader, resolver)?);
        }

        let named = u64::from(fieldc) + u64::from(propc);
        for _ in 0..named {
            read_tagged_value(&mut reader, resolver)?;
            skip_member_reference(&mut reader)?;
        }

        trace!(
            constructor_index,
            args = arguments.len(),
            named,
            "decoded attribute"
        );
        attributes.push(DecodedAttribute {
            constructor_index,
            arguments,
        });
    }

    Ok(attributes)
}

fn read_tagged_value<R: EnumResolver + ?Sized>(
    reader: &mut BlobReader<'_>,
    resolver: &R,
) -> Result<AttributeValue> {
    let offset = reader.offset();
    let tag = reader.read_u8()?;
    read_value(reader, resolver, tag, offset)
}

fn read_value<R: EnumResolver + ?Sized>(
    reader: &mut BlobReader<'_>,
    resolver: &R,
    raw_tag: u8,
    offset: usize,
) -> Result<AttributeValue> {
    let unsupported = || Error::UnsupportedAttributeValue {
        tag: raw_tag,
        offset,
    };
    let tag = TypeTag::from_u8(raw_tag).ok_or_else(unsupported)?;

    Ok(match tag {
        TypeTag::Enum => {
            let underlying = read_enum_underlying(reader, resolver)?;
            return read_value(reader, resolver, underlying, offset);
        }
        TypeTag::SzArray => AttributeValue::Array(read_array(reader, resolver)?),
        TypeTag::TypeIndex => AttributeValue::TypeIndex(reader.read_compressed_i32()?),
        TypeTag::Boolean => AttributeValue::Bool(reader.read_bool()?),
        TypeTag::Char => AttributeValue::Char(reader.read_u16_le()?),
        TypeTag::I1 => AttributeValue::I1(reader.read_i8()?),
        TypeTag::U1 => AttributeValue::U1(reader.read_u8()?),
        TypeTag::I2 => AttributeValue::I2(reader.read_i16_le()?),
        TypeTag::U2 => AttributeValue::U2(reader.read_u16_le()?),
        TypeTag::I4 => AttributeValue::I4(reader.read_compressed_i32()?),
        TypeTag::U4 => AttributeValue::U4(reader.read_compressed_u32()?),
        TypeTag::I8 => AttributeValue::I8(reader.read_i64_le()?),
        TypeTag::U8 => AttributeValue::U8(reader.read_u64_le()?),
        TypeTag::R4 => AttributeValue::R4(reader.read_f32_le()?),
        TypeTag::R8 => AttributeValue::R8(reader.read_f64_le()?),
        TypeTag::String => AttributeValue::String(read_string(reader)?),
        // Reference-typed constants can only be null and occupy no bytes.
        TypeTag::Class | TypeTag::Object | TypeTag::GenericInst => AttributeValue::Null,
    })
}

fn read_enum_underlying<R: EnumResolver + ?Sized>(
    reader: &mut BlobReader<'_>,
    resolver: &R,
) -> Result<u8> {
    let type_index = reader.read_compressed_i32()?;
    resolver.enum_underlying_tag(type_index)
}

fn read_array<R: EnumResolver + ?Sized>(
    reader: &mut BlobReader<'_>,
    resolver: &R,
) -> Result<Option<Vec<AttributeValue>>> {
    let start = reader.offset();
    let length = reader.read_compressed_i32()?;
    if length == -1 {
        return Ok(None);
    }
    let length = usize::try_from(length)
        .map_err(|_| Error::malformed_blob(start, format!("negative array length {}", length)))?;
    if length > reader.remaining() {
        return Err(Error::malformed_blob(
            start,
            format!("array length {} exceeds remaining blob", length),
        ));
    }

    let element_offset = reader.offset();
    let mut element_tag = reader.read_u8()?;
    if element_tag == TypeTag::Enum as u8 {
        element_tag = read_enum_underlying(reader, resolver)?;
    }

    let type_prefixed = reader.read_bool()?;
    if type_prefixed && element_tag != TypeTag::Object as u8 {
        return Err(Error::malformed_blob(
            element_offset,
            "array elements are type-prefixed but the element type is not object",
        ));
    }

    let mut items = Vec::with_capacity(length);
    for _ in 0..length {
        let item = if type_prefixed {
            read_tagged_value(reader, resolver)?
        } else {
            read_value(reader, resolver, element_tag, element_offset)?
        };
        items.push(item);
    }
    Ok(Some(items))
}

fn read_string(reader: &mut BlobReader<'_>) -> Result<Option<String>> {
    let start = reader.offset();
    let length = reader.read_compressed_i32()?;
    if length == -1 {
        return Ok(None);
    }
    let length = usize::try_from(length)
        .map_err(|_| Error::malformed_blob(start, format!("negative string length {}", length)))?;
    let bytes = reader.read_bytes(length)?;
    let s = std::str::from_utf8(bytes)
        .map_err(|e| Error::malformed_blob(start, format!("invalid utf-8 in string: {}", e)))?;
    Ok(Some(s.to_owned()))
}

// Named arguments reference their target field/property by index; a negative
// index means the member lives on a base type and is followed by that type's index.
fn skip_member_reference(reader: &mut BlobReader<'_>) -> Result<()> {
    let member_index = reader.read_compressed_i32()?;
    if member_index < 0 {
        reader.read_compressed_u32()?;
    }
    Ok(())
}
