// SPDX-License-Identifier: MIT

//! The HID item grammar. This module handles splitting a report descriptor
//! byte stream into its individual items and, in reverse, turning items
//! into their shortest byte representation.
//!
//! The grammar itself is a [Codec](crate::codec::Codec): each item is a
//! one-byte header with `size`, `type` and `tag` packed as 2, 2 and 4 bits,
//! followed by a payload whose shape is picked from those three values.
//! Interpretation of the resulting [ItemType]s is left to the caller, see
//! [ReportDescriptor](crate::ReportDescriptor) for that.
//!
//! Section numbers refer to the
//! [HID 1.11 class definition](https://www.usb.org/document-library/device-class-definition-hid-111).
//!
//! # Splitting a descriptor into items
//!
//! ```
//! # use hidschema::hid::*;
//! let bytes = [0x05, 0x01, 0x09, 0x02, 0xa1, 0x01, 0xc0];
//! let items = ReportDescriptorItems::try_from(bytes.as_slice()).unwrap();
//! assert_eq!(items.len(), 4);
//! assert_eq!(items[2].offset(), 4);
//! assert!(matches!(
//!     items[2].item_type(),
//!     ItemType::Main(MainItem::Collection(CollectionItem::Application))
//! ));
//! ```
//!
//! # Writing a descriptor
//!
//! ```
//! # use hidschema::hid::*;
//! # use hidschema::types::*;
//! let rdesc = ReportDescriptorBuilder::new()
//!     .append(UsagePage(0x01).into())
//!     .append(UsageId(0x02).into())
//!     .open_collection(CollectionItem::Application)
//!     .append(ReportSize(8).into())
//!     .append(ReportCount(1).into())
//!     .input(DataFlags::default().variable())
//!     .close_collection()
//!     .build()
//!     .unwrap();
//! assert_eq!(rdesc, [0x05, 0x01, 0x09, 0x02, 0xa1, 0x01, 0x75, 0x08, 0x95, 0x01, 0x81, 0x02, 0xc0]);
//! ```

use crate::codec::{Chooser, Codec, CodecError};
use crate::types::*;
use crate::value::Value;
use crate::{ensure, ParserError};
use std::sync::OnceLock;
use thiserror::Error;

#[cfg(feature = "hut")]
use hut::{AsUsage, AsUsagePage};

#[derive(Error, Debug)]
pub enum HidError {
    #[error("Invalid data: {message}")]
    InvalidData { message: String },
    #[error("Insufficient data")]
    InsufficientData,
    #[error(transparent)]
    Codec(#[from] CodecError),
}

type Result<T> = std::result::Result<T, HidError>;

/// The header byte of every long item, see Section 6.2.2.3.
pub const LONG_ITEM_HEADER: u8 = 0b11111110;

const TYPE_MAIN: u8 = 0;
const TYPE_GLOBAL: u8 = 1;
const TYPE_LOCAL: u8 = 2;
const TYPE_RESERVED: u8 = 3;

/// The payload of a short item, one of 0, 1, 2 or 4 bytes selected by the
/// `size` bits.
fn short_data(signed: bool) -> Codec {
    let (b1, b2, b4) = if signed {
        (Codec::I8, Codec::I16, Codec::I32)
    } else {
        (Codec::U8, Codec::U16, Codec::U32)
    };
    Codec::map([(
        "data",
        Codec::branch("size", [(0, Codec::padding(0)), (1, b1), (2, b2), (3, b4)]),
    )])
}

fn build_item_codec() -> Codec {
    let long = Codec::map([
        ("data_size", Codec::U8),
        ("long_tag", Codec::U8),
        ("data", Codec::bytes("data_size")),
    ]);
    // The minimums are the only items where the sign is known without
    // looking at other items. The maximums are read unsigned which is good
    // enough for anything that doesn't have a maximum < 0.
    let global = Codec::branch_or("tag", [(1, short_data(true)), (3, short_data(true))], short_data(false));
    let local = Codec::branch_or(
        "tag",
        [(
            0,
            Codec::branch_or(
                "size",
                [(3, Codec::map([("usage_id", Codec::U16), ("usage_page", Codec::U16)]))],
                short_data(false),
            ),
        )],
        short_data(false),
    );
    let payload = Codec::branch_or(
        Chooser::computed(|ctx| Ok(ctx.integer("tag")? * 16 + ctx.integer("type")? * 4 + ctx.integer("size")?)),
        [(i64::from(LONG_ITEM_HEADER), long)],
        Codec::branch_or(
            "type",
            [(i64::from(TYPE_GLOBAL), global), (i64::from(TYPE_LOCAL), local)],
            short_data(false),
        ),
    );
    Codec::map([
        ("size", Codec::Bits(2)),
        ("type", Codec::Bits(2)),
        ("tag", Codec::Bits(4)),
        ("", Codec::embed(payload)),
    ])
}

/// The codec for a single HID item.
///
/// Parsing yields a map with the header fields `size`, `type` and `tag`
/// plus either `data` (short items), `usage_id` and `usage_page` (a
/// Usage item with four data bytes) or `data_size`, `long_tag` and `data`
/// (long items).
pub fn item_codec() -> &'static Codec {
    static CODEC: OnceLock<Codec> = OnceLock::new();
    CODEC.get_or_init(build_item_codec)
}

/// A decoded item, grouped by the `type` bits of its header.
///
/// [ItemType::Long] and [ItemType::Reserved] carry no meaning for the
/// interpreter and are unlikely to be seen in the wild.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemType {
    Main(MainItem),
    Global(GlobalItem),
    Local(LocalItem),
    Long { tag: u8, data: Vec<u8> },
    /// A short item with the reserved type `0b11`.
    Reserved { tag: u8, data: u32 },
}

/// The data of a short item before it is given its minimal width.
enum Payload {
    Empty,
    Unsigned(u32),
    Signed(i32),
}

impl Payload {
    /// The `size` bits for the shortest encoding of this payload.
    fn size(&self) -> u8 {
        match self {
            Payload::Empty => 0,
            Payload::Unsigned(0..=0xff) => 1,
            Payload::Unsigned(0x100..=0xffff) => 2,
            Payload::Unsigned(_) => 3,
            Payload::Signed(-128..=127) => 1,
            Payload::Signed(-32768..=32767) => 2,
            Payload::Signed(_) => 3,
        }
    }

    fn short(self, itype: u8, tag: u8) -> Value {
        let size = self.size();
        let data = match self {
            Payload::Empty => Value::Integer(0),
            Payload::Unsigned(v) => v.into(),
            Payload::Signed(v) => v.into(),
        };
        Value::map()
            .with("size", size)
            .with("type", itype)
            .with("tag", tag)
            .with("data", data)
    }
}

impl ItemType {
    /// The value of this item as consumed by [item_codec].
    pub fn to_value(&self) -> Value {
        match self {
            ItemType::Main(item) => item.payload().short(TYPE_MAIN, item.tag()),
            ItemType::Global(item) => item.payload().short(TYPE_GLOBAL, item.tag()),
            ItemType::Local(LocalItem::Usage(usage)) => Value::map()
                .with("size", 3u8)
                .with("type", TYPE_LOCAL)
                .with("tag", 0u8)
                .with("usage_id", usage.id.0)
                .with("usage_page", usage.page.0),
            ItemType::Local(item) => item.payload().short(TYPE_LOCAL, item.tag()),
            ItemType::Long { tag, data } => Value::map()
                .with("size", 2u8)
                .with("type", TYPE_RESERVED)
                .with("tag", 15u8)
                .with("data_size", data.len() as u64)
                .with("long_tag", *tag)
                .with("data", data.clone()),
            ItemType::Reserved { tag, data } => Payload::Unsigned(*data).short(TYPE_RESERVED, *tag),
        }
    }

    /// Return the HID bytes representing this [ItemType], using the
    /// smallest data size that holds the value. This is the opposite of
    /// [ItemType::try_from].
    ///
    /// ```
    /// # use hidschema::hid::*;
    /// # use hidschema::types::*;
    /// let item = ItemType::from(LogicalMinimum::from(128i32));
    /// let bytes = item.as_bytes().unwrap();
    /// // the LogicalMinimum prefix plus two data bytes for signed 128
    /// assert_eq!(bytes, [0b00010100 + 2, 128, 0]);
    ///
    /// let item2 = ItemType::try_from(bytes.as_slice()).unwrap();
    /// assert_eq!(item, item2);
    /// ```
    pub fn as_bytes(&self) -> Result<Vec<u8>> {
        if let ItemType::Long { data, .. } = self {
            ensure!(
                data.len() <= 255,
                HidError::InvalidData {
                    message: format!("Long item data of {} bytes", data.len())
                }
            );
        }
        Ok(item_codec().pack(&self.to_value())?)
    }
}

impl TryFrom<&Value> for ItemType {
    type Error = HidError;

    /// Convert the output of [item_codec] into an item.
    fn try_from(value: &Value) -> Result<ItemType> {
        let field = |name: &str| -> Result<i64> { value.get(name).and_then(Value::as_i64).ok_or(HidError::InsufficientData) };
        let size = field("size")?;
        let itype = field("type")? as u8;
        let tag = field("tag")? as u8;

        if let Some(long_tag) = value.get("long_tag") {
            let tag = long_tag.as_i64().ok_or(HidError::InsufficientData)? as u8;
            let data = value
                .get("data")
                .and_then(Value::as_bytes)
                .ok_or(HidError::InsufficientData)?;
            return Ok(ItemType::Long {
                tag,
                data: data.to_vec(),
            });
        }

        if itype == TYPE_LOCAL && tag == 0 && size == 3 {
            let id = field("usage_id")? as u16;
            let page = field("usage_page")? as u16;
            return Ok(ItemType::Local(LocalItem::Usage(Usage::new(page, id))));
        }

        let data = field("data")?;
        let item = match itype {
            TYPE_MAIN => ItemType::Main(MainItem::from_parts(tag, data as u32)),
            TYPE_GLOBAL => ItemType::Global(GlobalItem::from_parts(tag, data)?),
            TYPE_LOCAL => ItemType::Local(LocalItem::from_parts(tag, data as u32)),
            _ => ItemType::Reserved {
                tag,
                data: data as u32,
            },
        };
        Ok(item)
    }
}

impl TryFrom<&[u8]> for ItemType {
    type Error = HidError;

    /// Parse the first item in `bytes`, trailing bytes are ignored.
    fn try_from(bytes: &[u8]) -> Result<ItemType> {
        ensure!(!bytes.is_empty(), HidError::InsufficientData);
        let parsed = item_codec().parse(bytes)?;
        ItemType::try_from(&parsed.data)
    }
}

#[cfg(feature = "hut")]
impl From<&hut::UsagePage> for ItemType {
    fn from(hut: &hut::UsagePage) -> ItemType {
        GlobalItem::UsagePage(UsagePage(hut.usage_page_value())).into()
    }
}

#[cfg(feature = "hut")]
impl From<hut::UsagePage> for ItemType {
    fn from(hut: hut::UsagePage) -> ItemType {
        ItemType::from(&hut)
    }
}

#[cfg(feature = "hut")]
impl From<&hut::Usage> for ItemType {
    fn from(hut: &hut::Usage) -> ItemType {
        LocalItem::Usage(Usage::from_extended(hut.usage_value())).into()
    }
}

#[cfg(feature = "hut")]
impl From<hut::Usage> for ItemType {
    fn from(hut: hut::Usage) -> ItemType {
        ItemType::from(&hut)
    }
}

impl From<MainItem> for ItemType {
    fn from(item: MainItem) -> ItemType {
        ItemType::Main(item)
    }
}

impl From<GlobalItem> for ItemType {
    fn from(item: GlobalItem) -> ItemType {
        ItemType::Global(item)
    }
}

impl From<LocalItem> for ItemType {
    fn from(item: LocalItem) -> ItemType {
        ItemType::Local(item)
    }
}

impl From<CollectionItem> for ItemType {
    fn from(item: CollectionItem) -> ItemType {
        ItemType::Main(MainItem::Collection(item))
    }
}

/// Implements `From<$t> for ItemType` by wrapping `$t` in the enum variant
/// of the same name.
macro_rules! impl_item_from {
    ($kind:ident, $($t:ident),*) => {
        $(
            impl From<$t> for ItemType {
                fn from(v: $t) -> ItemType {
                    $kind::$t(v).into()
                }
            }
        )*
    };
}

impl_item_from!(
    GlobalItem,
    UsagePage,
    LogicalMinimum,
    LogicalMaximum,
    PhysicalMinimum,
    PhysicalMaximum,
    UnitExponent,
    Unit,
    ReportSize,
    ReportId,
    ReportCount
);

impl_item_from!(
    LocalItem,
    UsageId,
    UsageMinimum,
    UsageMaximum,
    DesignatorIndex,
    DesignatorMinimum,
    DesignatorMaximum,
    StringIndex,
    StringMinimum,
    StringMaximum,
    Delimiter
);

impl From<Usage> for ItemType {
    fn from(usage: Usage) -> ItemType {
        LocalItem::Usage(usage).into()
    }
}

/// A main item, see Section 6.2.2.4. Input, Output and Feature create
/// fields in a report, the collection items only group them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MainItem {
    Input(DataFlags),
    Output(DataFlags),
    Feature(DataFlags),
    Collection(CollectionItem),
    EndCollection,
    Reserved { tag: u8, data: u32 },
}

impl MainItem {
    pub fn tag(&self) -> u8 {
        match self {
            MainItem::Input(_) => 0b1000,
            MainItem::Output(_) => 0b1001,
            MainItem::Collection(_) => 0b1010,
            MainItem::Feature(_) => 0b1011,
            MainItem::EndCollection => 0b1100,
            MainItem::Reserved { tag, .. } => *tag,
        }
    }

    fn from_parts(tag: u8, data: u32) -> MainItem {
        match tag {
            0b1000 => MainItem::Input(DataFlags(data)),
            0b1001 => MainItem::Output(DataFlags(data)),
            0b1010 => MainItem::Collection(CollectionItem::from(data as u8)),
            0b1011 => MainItem::Feature(DataFlags(data)),
            0b1100 => MainItem::EndCollection,
            tag => MainItem::Reserved { tag, data },
        }
    }

    fn payload(&self) -> Payload {
        match self {
            MainItem::Input(flags) | MainItem::Output(flags) | MainItem::Feature(flags) => {
                Payload::Unsigned(flags.0)
            }
            MainItem::Collection(c) => Payload::Unsigned(u32::from(u8::from(c))),
            MainItem::EndCollection => Payload::Empty,
            MainItem::Reserved { data, .. } => Payload::Unsigned(*data),
        }
    }
}

/// The flags of an Input, Output or Feature item, see Section 6.2.2.5.
///
/// > Input, Output, and Feature items are used to create data fields within a report.
///
/// The properties come in pairs (bit set or unset), for readability in
/// the caller a function is provided for each state. The builder-style
/// setters set the bit for the non-default state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataFlags(pub u32);

macro_rules! flag {
    ($bit:literal, $set:ident, $is:ident, $isnt:ident) => {
        pub fn $is(&self) -> bool {
            self.0 & (1 << $bit) != 0
        }

        pub fn $isnt(&self) -> bool {
            !self.$is()
        }

        pub fn $set(self) -> DataFlags {
            DataFlags(self.0 | (1 << $bit))
        }
    };
}

impl DataFlags {
    flag!(0, constant, is_constant, is_data);
    flag!(1, variable, is_variable, is_array);
    flag!(2, relative, is_relative, is_absolute);
    flag!(3, wrap, wraps, does_not_wrap);
    flag!(4, nonlinear, is_nonlinear, is_linear);
    flag!(5, no_preferred_state, has_no_preferred_state, has_preferred_state);
    flag!(6, null_state, has_null_state, has_no_null_state);
    // Input items reserve this bit
    flag!(7, volatile, is_volatile, is_nonvolatile);
    flag!(8, buffered_bytes, is_buffered_bytes, is_bitfield);
}

/// The kind of a Collection item, see Section 6.2.2.6. Each collection
/// is closed by a matching [MainItem::EndCollection].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionItem {
    Physical,
    Application,
    Logical,
    Report,
    NamedArray,
    UsageSwitch,
    UsageModifier,
    /// Values `0x07..=0x7f`.
    Reserved { value: u8 },
    /// Values `0x80..=0xff`.
    VendorDefined { value: u8 },
}

impl From<&CollectionItem> for u8 {
    fn from(c: &CollectionItem) -> u8 {
        match c {
            CollectionItem::Physical => 0x00,
            CollectionItem::Application => 0x01,
            CollectionItem::Logical => 0x02,
            CollectionItem::Report => 0x03,
            CollectionItem::NamedArray => 0x04,
            CollectionItem::UsageSwitch => 0x05,
            CollectionItem::UsageModifier => 0x06,
            CollectionItem::Reserved { value } | CollectionItem::VendorDefined { value } => *value,
        }
    }
}

impl From<CollectionItem> for u8 {
    fn from(c: CollectionItem) -> u8 {
        u8::from(&c)
    }
}

impl From<u8> for CollectionItem {
    fn from(v: u8) -> CollectionItem {
        match v {
            0x00 => CollectionItem::Physical,
            0x01 => CollectionItem::Application,
            0x02 => CollectionItem::Logical,
            0x03 => CollectionItem::Report,
            0x04 => CollectionItem::NamedArray,
            0x05 => CollectionItem::UsageSwitch,
            0x06 => CollectionItem::UsageModifier,
            value @ 0x07..=0x7f => CollectionItem::Reserved { value },
            value @ 0x80..=0xff => CollectionItem::VendorDefined { value },
        }
    }
}

/// A global item, see Section 6.2.2.7. Its value stays in effect for
/// every following main item until replaced or popped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GlobalItem {
    UsagePage(UsagePage),
    LogicalMinimum(LogicalMinimum),
    LogicalMaximum(LogicalMaximum),
    PhysicalMinimum(PhysicalMinimum),
    PhysicalMaximum(PhysicalMaximum),
    UnitExponent(UnitExponent),
    Unit(Unit),
    ReportSize(ReportSize),
    ReportId(ReportId),
    ReportCount(ReportCount),
    Push,
    Pop,
    Reserved { tag: u8, data: u32 },
}

impl GlobalItem {
    pub fn tag(&self) -> u8 {
        match self {
            GlobalItem::UsagePage(_) => 0,
            GlobalItem::LogicalMinimum(_) => 1,
            GlobalItem::LogicalMaximum(_) => 2,
            GlobalItem::PhysicalMinimum(_) => 3,
            GlobalItem::PhysicalMaximum(_) => 4,
            GlobalItem::UnitExponent(_) => 5,
            GlobalItem::Unit(_) => 6,
            GlobalItem::ReportSize(_) => 7,
            GlobalItem::ReportId(_) => 8,
            GlobalItem::ReportCount(_) => 9,
            GlobalItem::Push => 10,
            GlobalItem::Pop => 11,
            GlobalItem::Reserved { tag, .. } => *tag,
        }
    }

    /// `data` is already sign-extended for the minimums.
    fn from_parts(tag: u8, data: i64) -> Result<GlobalItem> {
        let item = match tag {
            0 => GlobalItem::UsagePage(UsagePage(data as u16)),
            1 => GlobalItem::LogicalMinimum(LogicalMinimum(data as i32)),
            2 => GlobalItem::LogicalMaximum(LogicalMaximum(data as u32)),
            3 => GlobalItem::PhysicalMinimum(PhysicalMinimum(data as i32)),
            4 => GlobalItem::PhysicalMaximum(PhysicalMaximum(data as u32)),
            5 => {
                // a signed nibble
                let nibble = (data & 0xf) as i32;
                let exponent = if nibble > 7 { nibble - 16 } else { nibble };
                GlobalItem::UnitExponent(UnitExponent(exponent))
            }
            6 => GlobalItem::Unit(Unit(data as u32)),
            7 => GlobalItem::ReportSize(ReportSize(data as usize)),
            8 => {
                let id = u8::try_from(data).map_err(|_| HidError::InvalidData {
                    message: format!("Report ID {data} out of range"),
                })?;
                GlobalItem::ReportId(ReportId(id))
            }
            9 => GlobalItem::ReportCount(ReportCount(data as usize)),
            10 => GlobalItem::Push,
            11 => GlobalItem::Pop,
            tag => GlobalItem::Reserved {
                tag,
                data: data as u32,
            },
        };
        Ok(item)
    }

    fn payload(&self) -> Payload {
        match self {
            GlobalItem::UsagePage(page) => Payload::Unsigned(u32::from(page.0)),
            GlobalItem::LogicalMinimum(min) => Payload::Signed(min.0),
            GlobalItem::LogicalMaximum(max) => Payload::Unsigned(max.0),
            GlobalItem::PhysicalMinimum(min) => Payload::Signed(min.0),
            GlobalItem::PhysicalMaximum(max) => Payload::Unsigned(max.0),
            GlobalItem::UnitExponent(exponent) => Payload::Unsigned((exponent.0 & 0xf) as u32),
            GlobalItem::Unit(unit) => Payload::Unsigned(unit.0),
            GlobalItem::ReportSize(size) => Payload::Unsigned(size.0 as u32),
            GlobalItem::ReportId(id) => Payload::Unsigned(u32::from(id.0)),
            GlobalItem::ReportCount(count) => Payload::Unsigned(count.0 as u32),
            GlobalItem::Push | GlobalItem::Pop => Payload::Empty,
            GlobalItem::Reserved { data, .. } => Payload::Unsigned(*data),
        }
    }
}

/// A local item, see Section 6.2.2.8. Local state is reset after each
/// main item.
///
/// A Usage item with four data bytes carries its own Usage Page and is
/// represented as [LocalItem::Usage], shorter ones as [LocalItem::UsageId].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LocalItem {
    Usage(Usage),
    UsageId(UsageId),
    UsageMinimum(UsageMinimum),
    UsageMaximum(UsageMaximum),
    DesignatorIndex(DesignatorIndex),
    DesignatorMinimum(DesignatorMinimum),
    DesignatorMaximum(DesignatorMaximum),
    StringIndex(StringIndex),
    StringMinimum(StringMinimum),
    StringMaximum(StringMaximum),
    Delimiter(Delimiter),
    Reserved { tag: u8, data: u32 },
}

impl LocalItem {
    pub fn tag(&self) -> u8 {
        match self {
            LocalItem::Usage(_) | LocalItem::UsageId(_) => 0,
            LocalItem::UsageMinimum(_) => 1,
            LocalItem::UsageMaximum(_) => 2,
            LocalItem::DesignatorIndex(_) => 3,
            LocalItem::DesignatorMinimum(_) => 4,
            LocalItem::DesignatorMaximum(_) => 5,
            LocalItem::StringIndex(_) => 7,
            LocalItem::StringMinimum(_) => 8,
            LocalItem::StringMaximum(_) => 9,
            LocalItem::Delimiter(_) => 10,
            LocalItem::Reserved { tag, .. } => *tag,
        }
    }

    fn from_parts(tag: u8, data: u32) -> LocalItem {
        match tag {
            0 => LocalItem::UsageId(UsageId(data as u16)),
            1 => LocalItem::UsageMinimum(UsageMinimum(data)),
            2 => LocalItem::UsageMaximum(UsageMaximum(data)),
            3 => LocalItem::DesignatorIndex(DesignatorIndex(data)),
            4 => LocalItem::DesignatorMinimum(DesignatorMinimum(data)),
            5 => LocalItem::DesignatorMaximum(DesignatorMaximum(data)),
            7 => LocalItem::StringIndex(StringIndex(data)),
            8 => LocalItem::StringMinimum(StringMinimum(data)),
            9 => LocalItem::StringMaximum(StringMaximum(data)),
            10 => LocalItem::Delimiter(Delimiter(data)),
            tag => LocalItem::Reserved { tag, data },
        }
    }

    fn payload(&self) -> Payload {
        match self {
            LocalItem::Usage(usage) => Payload::Unsigned(usage.extended()),
            LocalItem::UsageId(id) => Payload::Unsigned(u32::from(id.0)),
            LocalItem::UsageMinimum(v) => Payload::Unsigned(v.0),
            LocalItem::UsageMaximum(v) => Payload::Unsigned(v.0),
            LocalItem::DesignatorIndex(v) => Payload::Unsigned(v.0),
            LocalItem::DesignatorMinimum(v) => Payload::Unsigned(v.0),
            LocalItem::DesignatorMaximum(v) => Payload::Unsigned(v.0),
            LocalItem::StringIndex(v) => Payload::Unsigned(v.0),
            LocalItem::StringMinimum(v) => Payload::Unsigned(v.0),
            LocalItem::StringMaximum(v) => Payload::Unsigned(v.0),
            LocalItem::Delimiter(v) => Payload::Unsigned(v.0),
            LocalItem::Reserved { data, .. } => Payload::Unsigned(*data),
        }
    }
}

/// One item of a report descriptor together with where it was found.
#[derive(Debug, Clone)]
pub struct ReportDescriptorItem {
    offset: usize,
    bytes: Vec<u8>,
    item: ItemType,
}

impl ReportDescriptorItem {
    /// Byte offset of the header within the descriptor.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn item_type(&self) -> &ItemType {
        &self.item
    }

    /// The bytes representing this item as found in the report
    /// descriptor. The first byte is the header byte.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The length of this item in bytes, inclusive of the header.
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// The header byte of this item, [LONG_ITEM_HEADER] for long items.
    pub fn header(&self) -> u8 {
        self.bytes[0]
    }

    pub fn is_long_item(&self) -> bool {
        matches!(self.item, ItemType::Long { .. })
    }

    /// The item's data bytes, excluding any header bytes.
    pub fn data(&self) -> &[u8] {
        if self.is_long_item() {
            &self.bytes[3..]
        } else {
            &self.bytes[1..]
        }
    }
}

/// The items of a report descriptor in the order they appear, not yet
/// interpreted.
#[derive(Debug, Clone)]
pub struct ReportDescriptorItems {
    items: Vec<ReportDescriptorItem>,
}

impl std::ops::Deref for ReportDescriptorItems {
    type Target = [ReportDescriptorItem];

    fn deref(&self) -> &Self::Target {
        &self.items
    }
}

impl TryFrom<&[u8]> for ReportDescriptorItems {
    type Error = ParserError;

    fn try_from(bytes: &[u8]) -> crate::Result<Self> {
        itemize(bytes)
    }
}

/// Each item is parsed at its own offset so errors can point at it.
fn itemize(bytes: &[u8]) -> crate::Result<ReportDescriptorItems> {
    let codec = item_codec();
    let mut offset = 0;
    let mut items: Vec<ReportDescriptorItem> = Vec::new();
    while offset < bytes.len() {
        let invalid = |message: String| ParserError::Descriptor {
            offset: Some(offset),
            message,
        };
        let parsed = codec.parse_at(bytes, offset).map_err(|e| invalid(e.to_string()))?;
        let item = ItemType::try_from(&parsed.data).map_err(|e| invalid(e.to_string()))?;
        tracing::trace!("{offset:04x}: {item:?}");
        items.push(ReportDescriptorItem {
            offset,
            bytes: bytes[offset..offset + parsed.size].to_vec(),
            item,
        });
        offset += parsed.size;
    }
    Ok(ReportDescriptorItems { items })
}

/// Builds a HID Report Descriptor from a sequence of items.
///
/// Each item is encoded with the minimum required data size, i.e. a value
/// that fits into a u8 will be encoded as HID Item with a data length of 1, etc.
/// Apart from collection and push/pop balance, the builder does **not**
/// validate the items.
#[derive(Debug, Default, Clone)]
pub struct ReportDescriptorBuilder {
    items: Vec<ItemType>,
    collections: usize,
    pushes: usize,
}

impl ReportDescriptorBuilder {
    pub fn new() -> ReportDescriptorBuilder {
        ReportDescriptorBuilder::default()
    }

    /// Append an item to this builder. This will append the necessary
    /// bytes once [ReportDescriptorBuilder::build()] is called.
    pub fn append(mut self, item: ItemType) -> Self {
        match item {
            ItemType::Main(MainItem::Collection(_)) => self.collections += 1,
            ItemType::Main(MainItem::EndCollection) => self.collections = self.collections.wrapping_sub(1),
            ItemType::Global(GlobalItem::Push) => self.pushes += 1,
            ItemType::Global(GlobalItem::Pop) => self.pushes = self.pushes.wrapping_sub(1),
            _ => {}
        }
        self.items.push(item);
        self
    }

    /// Append the given UsagePage to the report descriptor.
    ///
    /// This only appends the Usage Page but not the Usage ID for the
    /// given Usage, use [Self::usage_id()] for the latter.
    #[cfg(feature = "hut")]
    pub fn usage_page(self, usage_page: impl AsUsagePage) -> Self {
        self.append(UsagePage(usage_page.usage_page_value()).into())
    }

    /// Append the Usage ID of the given Usage to the report descriptor.
    /// The Usage Page is **not** appended and must match the current one.
    #[cfg(feature = "hut")]
    pub fn usage_id(self, usage: impl AsUsage) -> Self {
        self.append(UsageId(usage.usage_id_value()).into())
    }

    pub fn input(self, flags: DataFlags) -> Self {
        self.append(MainItem::Input(flags).into())
    }

    pub fn output(self, flags: DataFlags) -> Self {
        self.append(MainItem::Output(flags).into())
    }

    pub fn feature(self, flags: DataFlags) -> Self {
        self.append(MainItem::Feature(flags).into())
    }

    pub fn open_collection(self, item: CollectionItem) -> Self {
        self.append(item.into())
    }

    pub fn close_collection(self) -> Self {
        self.append(MainItem::EndCollection.into())
    }

    pub fn push(self) -> Self {
        self.append(GlobalItem::Push.into())
    }

    pub fn pop(self) -> Self {
        self.append(GlobalItem::Pop.into())
    }

    /// Build the report descriptor bytes. Fails if a collection or a
    /// push is left unbalanced.
    pub fn build(&self) -> Result<Vec<u8>> {
        ensure!(
            self.collections == 0,
            HidError::InvalidData {
                message: "Unbalanced collections".into()
            }
        );
        ensure!(
            self.pushes == 0,
            HidError::InvalidData {
                message: "Unbalanced push/pop".into()
            }
        );
        let mut bytes = Vec::new();
        for item in &self.items {
            bytes.extend(item.as_bytes()?);
        }
        Ok(bytes)
    }
}
