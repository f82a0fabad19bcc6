// SPDX-License-Identifier: MIT

//! A declarative binary codec engine and a HID Report Descriptor compiler.
//!
//! The [codec] module provides bit-precise, composable [Codec]s. The [hid]
//! module uses those to tokenize a HID Report Descriptor into items, and
//! [ReportDescriptor::compile] interprets the items into one [Report] schema
//! per report and direction. Each [Report] can then [pack](Report::pack) and
//! [parse](Report::parse) reports of that shape.
//!
//! Devices that advertise the SimpleHID platform capability in their BOS
//! descriptor (see [bos]) assign typed roles to vendor usages. Within an
//! Application collection matching those roles, fields compile to typed,
//! optionally named codecs. Everything else compiles to raw byte spans.
//!
//! ```
//! # use hidschema::*;
//! # use std::collections::HashMap;
//! let roles = UsageRoles {
//!     page: 0xff00,
//!     application: 1,
//!     array: 2,
//!     object: 3,
//!     uint: 4,
//!     int: 5,
//!     float: 6,
//!     bits: 7,
//!     utf8: 8,
//! };
//! #[rustfmt::skip]
//! let rdesc = [
//!     0x06, 0x00, 0xff,  // Usage Page (0xff00)
//!     0x09, 0x01,        // Usage (application)
//!     0xa1, 0x01,        // Collection (Application)
//!     0x09, 0x03,        //   Usage (object)
//!     0xa1, 0x02,        //   Collection (Logical)
//!     0x85, 0x01,        //     Report ID (1)
//!     0x09, 0x04,        //     Usage (uint)
//!     0x79, 0x01,        //     String Index (1)
//!     0x75, 0x10,        //     Report Size (16)
//!     0x95, 0x01,        //     Report Count (1)
//!     0xb1, 0x02,        //     Feature (Data,Var,Abs)
//!     0xc0,              //   End Collection
//!     0xc0,              // End Collection
//! ];
//! let strings = HashMap::from([(1u32, String::from("Brightness"))]);
//! let rdesc = ReportDescriptor::compile_blocking(&rdesc, Some(&roles), strings, CompileOptions::default()).unwrap();
//! let report = rdesc.feature().get(Some(ReportId(1))).unwrap();
//! assert_eq!(report.byte_length(), 2);
//! let bytes = report.pack(&Value::map().with("Brightness", 300u16)).unwrap();
//! assert_eq!(bytes, [0x2c, 0x01]);
//! ```

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use thiserror::Error;
use tracing::{debug, trace};

/// Return early with the given error if the condition does not hold.
macro_rules! ensure {
    ($cond:expr, $err:expr $(,)?) => {
        if !$cond {
            return Err($err.into());
        }
    };
}
pub(crate) use ensure;

mod bits;
pub mod bos;
pub mod class;
pub mod codec;
pub mod hid;
pub mod types;
mod value;

pub use bos::{Role, UsageRoles};
pub use codec::{Codec, CodecError, Parsed};
pub use types::*;
pub use value::Value;

use hid::*;

#[derive(Error, Debug)]
pub enum ParserError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("Invalid descriptor{}: {message}", at(.offset))]
    Descriptor {
        offset: Option<usize>,
        message: String,
    },
    #[error("Invalid report: {message}")]
    Report { message: String },
    #[error("Unable to resolve string {index}: {message}")]
    StringResolution { index: StringIndex, message: String },
}

fn at(offset: &Option<usize>) -> String {
    offset.map(|o| format!(" at offset {o}")).unwrap_or_default()
}

pub type Result<T> = std::result::Result<T, ParserError>;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    Input,
    Output,
    Feature,
}

impl Direction {
    pub const ALL: [Direction; 3] = [Direction::Input, Direction::Output, Direction::Feature];
}

/// How strictly the type of a Collection item is checked.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum CollectionCheck {
    /// Every collection type is accepted, reserved types are treated
    /// like vendor-defined ones.
    #[default]
    Lenient,
    /// The reserved collection types `0x07..=0x7f` are rejected.
    Strict,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct CompileOptions {
    pub collection_check: CollectionCheck,
}

/// Looks up USB string descriptors by index, used to name reports and
/// fields. Resolution may suspend, e.g. for a control transfer.
pub trait StringResolver {
    fn resolve(&mut self, index: StringIndex) -> impl Future<Output = Result<String>>;
}

impl StringResolver for HashMap<u32, String> {
    fn resolve(&mut self, index: StringIndex) -> impl Future<Output = Result<String>> {
        let result = self
            .get(&index.0)
            .cloned()
            .ok_or_else(|| ParserError::StringResolution {
                index,
                message: "No such string".into(),
            });
        std::future::ready(result)
    }
}

impl<R: StringResolver + ?Sized> StringResolver for &mut R {
    fn resolve(&mut self, index: StringIndex) -> impl Future<Output = Result<String>> {
        (**self).resolve(index)
    }
}

/// A [StringResolver] for devices without string descriptors, every
/// lookup fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoStrings;

impl StringResolver for NoStrings {
    fn resolve(&mut self, index: StringIndex) -> impl Future<Output = Result<String>> {
        std::future::ready(Err(ParserError::StringResolution {
            index,
            message: "No string descriptors available".into(),
        }))
    }
}

/// The largest report accepted, in bytes excluding the report ID.
/// Descriptors declaring longer reports fail to compile.
pub const MAX_REPORT_LENGTH: usize = 65535;

const MAX_REPORT_BITS: usize = MAX_REPORT_LENGTH * 8;

/// The compiled schema of a single report.
#[derive(Debug, Clone)]
pub struct Report {
    id: Option<ReportId>,
    name: Option<String>,
    direction: Direction,
    bits: usize,
    codec: Codec,
}

impl Report {
    /// The report ID, if any. On the wire the ID precedes the report data.
    pub fn id(&self) -> Option<ReportId> {
        self.id
    }

    /// The name resolved from the collection's string index, if any.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// The codec for this report's data, a [Codec::Map] for named reports
    /// and a [Codec::Array] otherwise.
    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    /// The size of this report in bits, excluding the report ID.
    pub fn bits(&self) -> usize {
        self.bits
    }

    /// The size of this report in bytes, excluding the report ID.
    pub fn byte_length(&self) -> usize {
        self.bits.div_ceil(8)
    }

    pub fn pack(&self, value: &Value) -> Result<Vec<u8>> {
        Ok(self.codec.pack(value)?)
    }

    /// Pack into `buffer` at `byte_offset`, returning the number of bytes
    /// written.
    pub fn pack_into(&self, value: &Value, buffer: &mut [u8], byte_offset: usize) -> Result<usize> {
        Ok(self.codec.pack_into(value, buffer, byte_offset)?)
    }

    pub fn parse(&self, bytes: &[u8]) -> Result<Parsed> {
        Ok(self.codec.parse(bytes)?)
    }

    pub fn parse_at(&self, bytes: &[u8], byte_offset: usize) -> Result<Parsed> {
        Ok(self.codec.parse_at(bytes, byte_offset)?)
    }
}

/// The reports of one [Direction], by report ID and by name.
#[derive(Debug, Default, Clone)]
pub struct ReportTable {
    // a report without ID is stored as 0, an ID the HID spec reserves
    reports: BTreeMap<u8, Report>,
    names: HashMap<String, u8>,
}

impl ReportTable {
    pub fn get(&self, id: Option<ReportId>) -> Option<&Report> {
        self.reports.get(&id.map_or(0, u8::from))
    }

    pub fn by_name(&self, name: &str) -> Option<&Report> {
        self.names.get(name).and_then(|id| self.reports.get(id))
    }

    /// The reports in ascending report ID order.
    pub fn iter(&self) -> impl Iterator<Item = &Report> {
        self.reports.values()
    }

    pub fn len(&self) -> usize {
        self.reports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }

    /// Parse a report as sent by the device. If the reports in this table
    /// are numbered, the first byte selects the report and is not part of
    /// the returned value.
    pub fn parse_report(&self, bytes: &[u8]) -> Result<(Option<ReportId>, Value)> {
        if let Some(report) = self.reports.get(&0) {
            return Ok((None, report.parse(bytes)?.data));
        }
        let id = *bytes.first().ok_or_else(|| ParserError::Report {
            message: "Empty report".into(),
        })?;
        let report = self.reports.get(&id).ok_or_else(|| ParserError::Report {
            message: format!("Unknown report ID {id}"),
        })?;
        Ok((report.id, report.parse_at(bytes, 1)?.data))
    }

    /// Pack a report for sending to the device, prefixed with the report
    /// ID if the report has one.
    pub fn pack_report(&self, id: Option<ReportId>, value: &Value) -> Result<Vec<u8>> {
        let report = self.get(id).ok_or_else(|| ParserError::Report {
            message: format!("Unknown report ID {}", id.map_or(0, u8::from)),
        })?;
        let data = report.pack(value)?;
        Ok(match report.id {
            Some(id) => [vec![id.0], data].concat(),
            None => data,
        })
    }

    fn insert(&mut self, report: Report) -> Result<()> {
        let key = report.id.map_or(0, u8::from);
        ensure!(
            !self.reports.contains_key(&key),
            ParserError::Report {
                message: format!("{:?} report {key} is defined more than once", report.direction),
            }
        );
        if let Some(name) = &report.name {
            ensure!(
                !self.names.contains_key(name),
                ParserError::Report {
                    message: format!("{:?} report name \"{name}\" is used more than once", report.direction),
                }
            );
            self.names.insert(name.clone(), key);
        }
        self.reports.insert(key, report);
        Ok(())
    }
}

/// A compiled HID Report Descriptor.
#[derive(Debug, Default, Clone)]
pub struct ReportDescriptor {
    input: ReportTable,
    output: ReportTable,
    feature: ReportTable,
    max_input_length: usize,
}

impl ReportDescriptor {
    /// Compile the report descriptor `bytes` into report schemas.
    ///
    /// `roles` are the SimpleHID usage roles of the device, if any (see
    /// [bos::Bos::usage_roles]). `resolver` names reports and fields, it is
    /// awaited in item order and each index is resolved at most once.
    pub async fn compile<R: StringResolver>(
        bytes: &[u8],
        roles: Option<&UsageRoles>,
        resolver: R,
        options: CompileOptions,
    ) -> Result<ReportDescriptor> {
        let items = ReportDescriptorItems::try_from(bytes)?;
        let report_ids = items
            .iter()
            .any(|item| matches!(item.item_type(), ItemType::Global(GlobalItem::ReportId(_))));
        let interpreter = Interpreter {
            roles,
            resolver,
            options,
            strings: HashMap::new(),
            stack: Stack::default(),
            report_ids,
            legacy: BTreeMap::new(),
            descriptor: ReportDescriptor::default(),
        };
        interpreter.run(&items).await
    }

    /// Like [ReportDescriptor::compile], blocking the current thread until
    /// every string is resolved.
    pub fn compile_blocking<R: StringResolver>(
        bytes: &[u8],
        roles: Option<&UsageRoles>,
        resolver: R,
        options: CompileOptions,
    ) -> Result<ReportDescriptor> {
        futures::executor::block_on(Self::compile(bytes, roles, resolver, options))
    }

    pub fn input(&self) -> &ReportTable {
        &self.input
    }

    pub fn output(&self) -> &ReportTable {
        &self.output
    }

    pub fn feature(&self) -> &ReportTable {
        &self.feature
    }

    pub fn reports(&self, direction: Direction) -> &ReportTable {
        match direction {
            Direction::Input => &self.input,
            Direction::Output => &self.output,
            Direction::Feature => &self.feature,
        }
    }

    /// The largest [Report::byte_length] of all input reports.
    pub fn max_input_length(&self) -> usize {
        self.max_input_length
    }

    fn insert(&mut self, report: Report) -> Result<()> {
        let table = match report.direction {
            Direction::Input => {
                self.max_input_length = self.max_input_length.max(report.byte_length());
                &mut self.input
            }
            Direction::Output => &mut self.output,
            Direction::Feature => &mut self.feature,
        };
        table.insert(report)
    }
}

impl TryFrom<&[u8]> for ReportDescriptor {
    type Error = ParserError;

    /// Compile without usage roles or strings, every report is made of raw
    /// byte spans.
    fn try_from(bytes: &[u8]) -> Result<ReportDescriptor> {
        ReportDescriptor::compile_blocking(bytes, None, NoStrings, CompileOptions::default())
    }
}

impl TryFrom<&Vec<u8>> for ReportDescriptor {
    type Error = ParserError;

    fn try_from(bytes: &Vec<u8>) -> Result<ReportDescriptor> {
        ReportDescriptor::try_from(bytes.as_slice())
    }
}

// ------------------------- interpreter state ---------------------------

/// The global items that affect the report layout.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct Globals {
    usage_page: Option<UsagePage>,
    report_size: Option<ReportSize>,
    report_count: Option<ReportCount>,
    report_id: Option<ReportId>,
}

/// A Usage as declared, the page of a short one is only known once the
/// Main item is reached.
#[derive(Clone, Copy, Debug, PartialEq)]
enum LocalUsage {
    Id(UsageId),
    Extended(Usage),
}

#[derive(Clone, Debug, Default, PartialEq)]
struct Locals {
    usages: Vec<LocalUsage>,
    usage_minimum: Option<UsageMinimum>,
    usage_maximum: Option<UsageMaximum>,
    strings: Vec<StringIndex>,
    string_minimum: Option<StringMinimum>,
    string_maximum: Option<StringMaximum>,
}

#[derive(Debug, Default)]
struct Stack {
    globals: Globals,
    global_stack: Vec<Globals>,
    locals: Locals,
    delimited: bool,
    // index of the first usage of the open delimited set
    delimiter_start: usize,
    delimiter_stack: Vec<Locals>,
    frames: Vec<Frame>,
}

macro_rules! update_stack {
    ($stack:expr, $class:ident, $which:ident, $from:expr) => {
        $stack.$class.$which = Some($from)
    };
}

impl Stack {
    fn push(&mut self) {
        self.global_stack.push(self.globals);
    }

    fn pop(&mut self) {
        self.globals = self.global_stack.pop().unwrap_or_default();
    }

    fn delimiter(&mut self, delimiter: Delimiter) {
        match (delimiter.0, self.delimited) {
            (1, false) => {
                self.delimited = true;
                self.delimiter_start = self.locals.usages.len();
            }
            (0, true) => {
                // only the first usage of a delimited set is used
                self.delimited = false;
                let mut closed = std::mem::take(&mut self.locals);
                closed.usages.truncate(self.delimiter_start + 1);
                self.delimiter_stack.push(closed);
            }
            _ => trace!("Ignoring Delimiter ({delimiter})"),
        }
    }

    /// The local state for a Main item: the first delimited set (if any)
    /// followed by the current locals. Clears all local state.
    fn take_locals(&mut self) -> Locals {
        let current = std::mem::take(&mut self.locals);
        let mut merged = self.delimiter_stack.drain(..).next().unwrap_or_default();
        merged.usages.extend(current.usages);
        merged.strings.extend(current.strings);
        merged.usage_minimum = current.usage_minimum.or(merged.usage_minimum);
        merged.usage_maximum = current.usage_maximum.or(merged.usage_maximum);
        merged.string_minimum = current.string_minimum.or(merged.string_minimum);
        merged.string_maximum = current.string_maximum.or(merged.string_maximum);
        self.delimited = false;
        merged
    }

    /// Where the fields of a data item go.
    fn target(&self) -> Target {
        let mut inert = false;
        for frame in self.frames.iter().rev() {
            match frame {
                Frame::Report(_) | Frame::Nested(_) if inert => return Target::Inert,
                Frame::Report(_) | Frame::Nested(_) => return Target::Report,
                Frame::Application { matched: true } if !inert => return Target::Unreported,
                Frame::Application { .. } => return Target::Legacy,
                Frame::Passthrough => inert = true,
            }
        }
        Target::Legacy
    }

    fn innermost_report(&mut self) -> Option<&mut ReportFrame> {
        for frame in self.frames.iter_mut().rev() {
            match frame {
                Frame::Report(f) | Frame::Nested(f) => return Some(f),
                Frame::Application { .. } => return None,
                Frame::Passthrough => {}
            }
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Target {
    /// Outside any SimpleHID application, raw byte spans.
    Legacy,
    /// Inside a SimpleHID application but not inside a report.
    Unreported,
    /// Inside a SimpleHID report.
    Report,
    /// Below an inert collection inside a SimpleHID report. Fields still
    /// lay out in the report, collections add no structure.
    Inert,
}

#[derive(Debug)]
enum Frame {
    Application { matched: bool },
    /// A collection directly inside a SimpleHID application.
    Report(ReportFrame),
    /// A collection inside a [Frame::Report], merged into it when closed.
    Nested(ReportFrame),
    /// A collection without meaning for the schema.
    Passthrough,
}

#[derive(Debug)]
struct ReportFrame {
    id: Option<ReportId>,
    // set once a data item of this collection fixed the id
    pinned: bool,
    name: Option<String>,
    sections: [Section; 3],
}

impl ReportFrame {
    fn new(id: Option<ReportId>, name: Option<String>, named: bool) -> ReportFrame {
        ReportFrame {
            id,
            pinned: false,
            name,
            sections: [Section::new(named), Section::new(named), Section::new(named)],
        }
    }

    fn section(&mut self, direction: Direction) -> &mut Section {
        &mut self.sections[direction as usize]
    }

    /// Take the Report ID in effect at a data item of this report. All
    /// data items of one report must agree on it.
    fn pin_id(&mut self, id: Option<ReportId>, offset: usize) -> Result<()> {
        ensure!(
            !self.pinned || self.id == id,
            ParserError::Report {
                message: format!(
                    "Report ID {} at offset {offset} differs from Report ID {} in the same collection",
                    id.map_or(0, u8::from),
                    self.id.map_or(0, u8::from)
                ),
            }
        );
        self.id = id;
        self.pinned = true;
        Ok(())
    }
}

/// The fields of one direction of a report under construction.
#[derive(Debug)]
struct Section {
    members: Members,
    bits: usize,
}

#[derive(Debug)]
enum Members {
    Named(Vec<Member>),
    Positional(Vec<Codec>),
}

#[derive(Debug)]
enum Member {
    /// A named field, more than one codec makes it an array.
    Field(String, Vec<Codec>),
    /// A gap without name, e.g. padding.
    Anonymous(Codec),
}

impl Member {
    fn bits(&self) -> usize {
        match self {
            Member::Field(_, group) => group.iter().filter_map(Codec::static_bits).sum(),
            Member::Anonymous(codec) => codec.static_bits().unwrap_or(0),
        }
    }
}

impl Section {
    fn new(named: bool) -> Section {
        let members = if named {
            Members::Named(Vec::new())
        } else {
            Members::Positional(Vec::new())
        };
        Section { members, bits: 0 }
    }

    fn is_named(&self) -> bool {
        matches!(self.members, Members::Named(_))
    }

    fn is_empty(&self) -> bool {
        match &self.members {
            Members::Named(members) => members.is_empty(),
            Members::Positional(items) => items.is_empty(),
        }
    }

    fn push(&mut self, name: Option<String>, codec: Codec) -> Result<()> {
        let member = match name {
            Some(name) => Member::Field(name, vec![codec]),
            None => Member::Anonymous(codec),
        };
        self.push_member(member)
    }

    /// Append a member. A name may only repeat immediately, repeated
    /// fields become an array under that name.
    fn push_member(&mut self, member: Member) -> Result<()> {
        self.bits += member.bits();
        match &mut self.members {
            Members::Positional(items) => match member {
                Member::Field(_, group) => items.extend(group),
                Member::Anonymous(codec) => items.push(codec),
            },
            Members::Named(members) => match member {
                Member::Anonymous(codec) => members.push(Member::Anonymous(codec)),
                Member::Field(name, group) => {
                    if let Some(Member::Field(last, existing)) = members.last_mut() {
                        if *last == name {
                            existing.extend(group);
                            return Ok(());
                        }
                    }
                    ensure!(
                        !members.iter().any(|m| matches!(m, Member::Field(n, _) if *n == name)),
                        ParserError::Report {
                            message: format!("Field \"{name}\" is interrupted by other fields"),
                        }
                    );
                    members.push(Member::Field(name, group));
                }
            },
        }
        Ok(())
    }

    /// Merge a closed nested collection into this section.
    fn merge(&mut self, child: Section, name: Option<String>) -> Result<()> {
        if child.is_empty() {
            return Ok(());
        }
        if !self.is_named() {
            let flatten = !child.is_named();
            let codec = child.into_codec();
            return self.push(None, if flatten { Codec::embed(codec) } else { codec });
        }
        match (name, child.members) {
            (Some(name), members) => {
                let codec = Section {
                    members,
                    bits: child.bits,
                }
                .into_codec();
                self.push(Some(name), codec)
            }
            (None, Members::Named(members)) => {
                for member in members {
                    self.push_member(member)?;
                }
                Ok(())
            }
            (None, Members::Positional(_)) => Err(ParserError::Report {
                message: "Unnamed array collection inside a named report".into(),
            }),
        }
    }

    fn into_codec(self) -> Codec {
        match self.members {
            Members::Positional(items) => Codec::Array(items),
            Members::Named(members) => Codec::Map(
                members
                    .into_iter()
                    .map(|member| match member {
                        Member::Field(name, mut group) => {
                            let codec = if group.len() == 1 {
                                group.remove(0)
                            } else {
                                Codec::Array(group)
                            };
                            (name, codec)
                        }
                        Member::Anonymous(codec) => (String::new(), Codec::embed(codec)),
                    })
                    .collect(),
            ),
        }
    }
}

/// A report outside any SimpleHID application.
#[derive(Debug)]
struct Legacy {
    id: Option<ReportId>,
    fields: Vec<Codec>,
    bits: usize,
}

/// Resolve the usages for the first `limit` fields. Explicit usages come
/// first, followed by the Usage Minimum/Maximum range.
fn compile_usages(globals: &Globals, locals: &Locals, limit: usize) -> Vec<Usage> {
    let page = globals.usage_page.unwrap_or_default();
    let resolve = |value: u32| {
        if value > 0xffff {
            Usage::from_extended(value)
        } else {
            Usage {
                page,
                id: UsageId(value as u16),
            }
        }
    };
    let mut usages: Vec<Usage> = locals
        .usages
        .iter()
        .map(|usage| match usage {
            LocalUsage::Id(id) => Usage { page, id: *id },
            LocalUsage::Extended(usage) => *usage,
        })
        .collect();
    if let (Some(min), Some(max)) = (locals.usage_minimum, locals.usage_maximum) {
        let room = limit.saturating_sub(usages.len());
        usages.extend((min.0..=max.0).take(room).map(resolve));
    }
    usages
}

fn compile_strings(locals: &Locals, limit: usize) -> Vec<StringIndex> {
    let mut strings = locals.strings.clone();
    if let (Some(min), Some(max)) = (locals.string_minimum, locals.string_maximum) {
        let room = limit.saturating_sub(strings.len());
        strings.extend((min.0..=max.0).take(room).map(StringIndex));
    }
    strings
}

/// The codec for a field of the SimpleHID usage page.
fn simple_field(roles: &UsageRoles, usage: Usage, size: usize, offset: usize) -> Result<Codec> {
    let invalid = || ParserError::Descriptor {
        offset: Some(offset),
        message: format!("Invalid usage {:#06x} for a field of {size} bits", usage.id.0),
    };
    let bits = u8::try_from(size).map_err(|_| invalid())?;
    let codec = match roles.role_of(usage.id.0) {
        Some(Role::Uint) => Codec::uint(bits),
        Some(Role::Int) => Codec::int(bits),
        Some(Role::Float) => Codec::float(bits),
        Some(Role::Utf8) if size % 8 == 0 => Ok(Codec::text(size / 8)),
        _ => return Err(invalid()),
    };
    codec.map_err(|_| invalid())
}

/// The codec for a raw field outside SimpleHID.
fn raw_span(size: usize) -> Codec {
    if size % 8 == 0 {
        Codec::bytes(size / 8)
    } else {
        Codec::bit_span(size)
    }
}

struct Interpreter<'a, R> {
    roles: Option<&'a UsageRoles>,
    resolver: R,
    options: CompileOptions,
    strings: HashMap<StringIndex, String>,
    stack: Stack,
    // true if any Report ID item exists in the descriptor
    report_ids: bool,
    legacy: BTreeMap<(Direction, u8), Legacy>,
    descriptor: ReportDescriptor,
}

impl<R: StringResolver> Interpreter<'_, R> {
    async fn run(mut self, items: &ReportDescriptorItems) -> Result<ReportDescriptor> {
        for item in items.iter() {
            match item.item_type() {
                ItemType::Main(main) => self.main_item(main, item.offset()).await?,
                ItemType::Global(global) => self.global_item(global),
                ItemType::Local(local) => self.local_item(local),
                other => trace!("Ignoring {other:?}"),
            }
        }
        ensure!(
            self.stack.frames.is_empty(),
            ParserError::Descriptor {
                offset: None,
                message: format!("{} collection(s) left open", self.stack.frames.len()),
            }
        );
        for ((direction, _), legacy) in std::mem::take(&mut self.legacy) {
            debug!(
                "{direction:?} report {:?} has {} raw fields",
                legacy.id,
                legacy.fields.len()
            );
            self.descriptor.insert(Report {
                id: legacy.id,
                name: None,
                direction,
                bits: legacy.bits,
                codec: Codec::Array(legacy.fields),
            })?;
        }
        Ok(self.descriptor)
    }

    fn global_item(&mut self, item: &GlobalItem) {
        match item {
            GlobalItem::UsagePage(page) => update_stack!(self.stack, globals, usage_page, *page),
            GlobalItem::ReportSize(size) => update_stack!(self.stack, globals, report_size, *size),
            GlobalItem::ReportCount(count) => update_stack!(self.stack, globals, report_count, *count),
            GlobalItem::ReportId(id) => update_stack!(self.stack, globals, report_id, *id),
            GlobalItem::Push => self.stack.push(),
            GlobalItem::Pop => self.stack.pop(),
            other => trace!("{other:?} does not affect the report layout"),
        }
    }

    fn local_item(&mut self, item: &LocalItem) {
        match item {
            LocalItem::Usage(usage) => self.stack.locals.usages.push(LocalUsage::Extended(*usage)),
            LocalItem::UsageId(id) => self.stack.locals.usages.push(LocalUsage::Id(*id)),
            LocalItem::UsageMinimum(min) => update_stack!(self.stack, locals, usage_minimum, *min),
            LocalItem::UsageMaximum(max) => update_stack!(self.stack, locals, usage_maximum, *max),
            LocalItem::StringIndex(index) => self.stack.locals.strings.push(*index),
            LocalItem::StringMinimum(min) => update_stack!(self.stack, locals, string_minimum, *min),
            LocalItem::StringMaximum(max) => update_stack!(self.stack, locals, string_maximum, *max),
            LocalItem::Delimiter(delimiter) => self.stack.delimiter(*delimiter),
            other => trace!("{other:?} does not affect the report layout"),
        }
    }

    async fn main_item(&mut self, item: &MainItem, offset: usize) -> Result<()> {
        let globals = self.stack.globals;
        let locals = self.stack.take_locals();
        match item {
            MainItem::Input(_) => self.data_item(Direction::Input, offset, &globals, &locals).await,
            MainItem::Output(_) => self.data_item(Direction::Output, offset, &globals, &locals).await,
            MainItem::Feature(_) => self.data_item(Direction::Feature, offset, &globals, &locals).await,
            MainItem::Collection(collection) => self.open_collection(collection, offset, &globals, &locals).await,
            MainItem::EndCollection => self.close_collection(offset),
            MainItem::Reserved { tag, .. } => {
                trace!("Ignoring reserved main item {tag}");
                Ok(())
            }
        }
    }

    async fn resolve(&mut self, index: StringIndex) -> Result<String> {
        if let Some(name) = self.strings.get(&index) {
            return Ok(name.clone());
        }
        let name = self.resolver.resolve(index).await?;
        trace!("String {index} is {name:?}");
        self.strings.insert(index, name.clone());
        Ok(name)
    }

    async fn open_collection(
        &mut self,
        collection: &CollectionItem,
        offset: usize,
        globals: &Globals,
        locals: &Locals,
    ) -> Result<()> {
        let usage = compile_usages(globals, locals, 1).first().copied();
        let frame = match collection {
            CollectionItem::Application => {
                let matched = self
                    .roles
                    .zip(usage)
                    .is_some_and(|(roles, usage)| usage == Usage::new(roles.page, roles.application));
                if matched {
                    debug!("Application collection at offset {offset} uses SimpleHID");
                }
                Frame::Application { matched }
            }
            CollectionItem::Physical | CollectionItem::Logical | CollectionItem::Report => {
                let target = self.stack.target();
                if matches!(target, Target::Legacy | Target::Inert) {
                    Frame::Passthrough
                } else {
                    let named = self
                        .roles
                        .zip(usage)
                        .is_some_and(|(roles, usage)| usage == Usage::new(roles.page, roles.object));
                    let name = match compile_strings(locals, 1).first() {
                        Some(index) => Some(self.resolve(*index).await?),
                        None => None,
                    };
                    let frame = ReportFrame::new(globals.report_id, name, named);
                    if target == Target::Report {
                        Frame::Nested(frame)
                    } else {
                        Frame::Report(frame)
                    }
                }
            }
            CollectionItem::Reserved { value } => {
                ensure!(
                    self.options.collection_check == CollectionCheck::Lenient,
                    ParserError::Descriptor {
                        offset: Some(offset),
                        message: format!("Invalid collection type {value:#04x}"),
                    }
                );
                debug!("Ignoring reserved collection type {value:#04x}");
                Frame::Passthrough
            }
            other => {
                debug!("Ignoring {other:?} collection at offset {offset}");
                Frame::Passthrough
            }
        };
        self.stack.frames.push(frame);
        Ok(())
    }

    fn close_collection(&mut self, offset: usize) -> Result<()> {
        let frame = self.stack.frames.pop().ok_or_else(|| ParserError::Descriptor {
            offset: Some(offset),
            message: "End Collection without Collection".into(),
        })?;
        match frame {
            Frame::Application { .. } | Frame::Passthrough => Ok(()),
            Frame::Report(frame) => self.seal(frame),
            Frame::Nested(ReportFrame {
                id,
                pinned,
                name,
                sections,
            }) => {
                let parent = self.stack.innermost_report().ok_or_else(|| ParserError::Descriptor {
                    offset: Some(offset),
                    message: "Nested collection outside of a report".into(),
                })?;
                if pinned {
                    parent.pin_id(id, offset)?;
                }
                for (section, child) in parent.sections.iter_mut().zip(sections) {
                    section.merge(child, name.clone())?;
                }
                Ok(())
            }
        }
    }

    fn seal(&mut self, frame: ReportFrame) -> Result<()> {
        let id = frame.id.or(self.stack.globals.report_id);
        ensure!(
            id.is_some() || !self.report_ids,
            ParserError::Report {
                message: format!(
                    "Report {} has no Report ID",
                    frame.name.as_deref().unwrap_or("(unnamed)")
                ),
            }
        );
        for (direction, section) in Direction::ALL.into_iter().zip(frame.sections) {
            if section.is_empty() {
                continue;
            }
            ensure!(
                section.bits <= MAX_REPORT_BITS,
                ParserError::Report {
                    message: format!("{direction:?} report {:?} exceeds {MAX_REPORT_LENGTH} bytes", id),
                }
            );
            let report = Report {
                id,
                name: frame.name.clone(),
                direction,
                bits: section.bits,
                codec: section.into_codec(),
            };
            debug!(
                "{direction:?} report {:?} ({}) is {} bytes",
                id,
                report.name().unwrap_or("unnamed"),
                report.byte_length()
            );
            self.descriptor.insert(report)?;
        }
        Ok(())
    }

    async fn data_item(&mut self, direction: Direction, offset: usize, globals: &Globals, locals: &Locals) -> Result<()> {
        let missing = |what: &str| ParserError::Report {
            message: format!("Missing {what} for the {direction:?} item at offset {offset}"),
        };
        let size = globals.report_size.ok_or_else(|| missing("Report Size"))?.0;
        let count = globals.report_count.ok_or_else(|| missing("Report Count"))?.0;
        let too_long = || ParserError::Report {
            message: format!(
                "{direction:?} item at offset {offset} exceeds {MAX_REPORT_LENGTH} bytes (Report Size {size}, Report Count {count})"
            ),
        };
        let bits = size
            .checked_mul(count)
            .filter(|bits| *bits <= MAX_REPORT_BITS && count <= MAX_REPORT_BITS)
            .ok_or_else(too_long)?;

        match self.stack.target() {
            Target::Legacy => {
                let key = (direction, globals.report_id.map_or(0, u8::from));
                let legacy = self.legacy.entry(key).or_insert_with(|| Legacy {
                    id: globals.report_id,
                    fields: Vec::new(),
                    bits: 0,
                });
                let total = legacy.bits + bits;
                ensure!(total <= MAX_REPORT_BITS, too_long());
                legacy.fields.extend(std::iter::repeat(raw_span(size)).take(count));
                legacy.bits = total;
                Ok(())
            }
            Target::Unreported => Err(ParserError::Report {
                message: format!("{direction:?} item at offset {offset} is not inside a Report collection"),
            }),
            Target::Report | Target::Inert => {
                let current = self
                    .stack
                    .innermost_report()
                    .map_or(0, |frame| frame.section(direction).bits);
                ensure!(current + bits <= MAX_REPORT_BITS, too_long());
                self.typed_fields(direction, offset, globals, locals, size, count).await
            }
        }
    }

    async fn typed_fields(
        &mut self,
        direction: Direction,
        offset: usize,
        globals: &Globals,
        locals: &Locals,
        size: usize,
        count: usize,
    ) -> Result<()> {
        let roles = self.roles.copied().ok_or_else(|| ParserError::Report {
            message: "SimpleHID report without usage roles".into(),
        })?;
        let named = self
            .stack
            .innermost_report()
            .is_some_and(|frame| frame.section(direction).is_named());
        let usages = compile_usages(globals, locals, count);
        let strings = compile_strings(locals, count);

        let mut fields = Vec::with_capacity(count);
        for i in 0..count {
            let (codec, typed) = match usages.get(i).or(usages.last()) {
                None => {
                    ensure!(
                        size <= 7,
                        ParserError::Descriptor {
                            offset: Some(offset),
                            message: format!("Padding of {size} bits without usage"),
                        }
                    );
                    (Codec::padding(size), false)
                }
                Some(usage) if usage.page.0 == roles.page => (simple_field(&roles, *usage, size, offset)?, true),
                // controls of other pages are opaque, a gap in named reports
                Some(_) if named => (Codec::padding(size), false),
                Some(_) => (raw_span(size), false),
            };
            let name = if named && typed {
                let index = strings.get(i).or(strings.last()).copied().ok_or_else(|| ParserError::Report {
                    message: format!("Missing String Index for the field at offset {offset}"),
                })?;
                Some(self.resolve(index).await?)
            } else {
                None
            };
            fields.push((name, codec));
        }

        let frame = self.stack.innermost_report().ok_or_else(|| ParserError::Report {
            message: format!("{direction:?} item at offset {offset} is not inside a Report collection"),
        })?;
        frame.pin_id(globals.report_id, offset)?;
        let section = frame.section(direction);
        for (name, codec) in fields {
            section.push(name, codec)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(stack: &mut Stack, item: GlobalItem) {
        match item {
            GlobalItem::UsagePage(page) => update_stack!(stack, globals, usage_page, page),
            GlobalItem::Push => stack.push(),
            GlobalItem::Pop => stack.pop(),
            _ => unreachable!(),
        }
    }

    #[test]
    fn push_pop_fidelity() {
        let mut stack = Stack::default();
        update_stack!(stack, globals, usage_page, UsagePage(1));
        update_stack!(stack, globals, report_size, ReportSize(8));
        let before = stack.globals;

        apply(&mut stack, GlobalItem::Push);
        apply(&mut stack, GlobalItem::UsagePage(UsagePage(5)));
        assert_eq!(stack.globals.usage_page, Some(UsagePage(5)));
        apply(&mut stack, GlobalItem::Pop);
        assert_eq!(stack.globals, before);

        // popping an empty stack restores an empty table
        apply(&mut stack, GlobalItem::Pop);
        assert_eq!(stack.globals, Globals::default());
    }

    #[test]
    fn delimiter_keeps_first_usage() {
        let mut stack = Stack::default();
        stack.delimiter(Delimiter(1));
        stack.locals.usages.push(LocalUsage::Id(UsageId(0x30)));
        stack.locals.usages.push(LocalUsage::Id(UsageId(0x31)));
        stack.delimiter(Delimiter(0));
        assert!(stack.locals.usages.is_empty());

        let locals = stack.take_locals();
        assert_eq!(locals.usages, [LocalUsage::Id(UsageId(0x30))]);
        assert!(stack.delimiter_stack.is_empty());
        assert_eq!(stack.take_locals(), Locals::default());
    }

    #[test]
    fn inert_collections_end_structure() {
        let mut stack = Stack::default();
        stack.frames.push(Frame::Application { matched: true });
        assert_eq!(stack.target(), Target::Unreported);
        stack.frames.push(Frame::Passthrough);
        assert_eq!(stack.target(), Target::Legacy);

        stack.frames.clear();
        stack.frames.push(Frame::Application { matched: true });
        stack.frames.push(Frame::Report(ReportFrame::new(None, None, true)));
        assert_eq!(stack.target(), Target::Report);
        stack.frames.push(Frame::Passthrough);
        assert_eq!(stack.target(), Target::Inert);
        // fields below the marker still belong to the report
        assert!(stack.innermost_report().is_some());
    }

    #[test]
    fn report_id_is_pinned_by_fields() {
        let mut frame = ReportFrame::new(Some(ReportId(1)), None, false);
        frame.pin_id(Some(ReportId(2)), 10).unwrap();
        assert_eq!(frame.id, Some(ReportId(2)));
        frame.pin_id(Some(ReportId(2)), 12).unwrap();
        assert!(matches!(
            frame.pin_id(Some(ReportId(3)), 14),
            Err(ParserError::Report { .. })
        ));
    }

    #[test]
    fn delimiter_ignores_unbalanced_values() {
        let mut stack = Stack::default();
        stack.delimiter(Delimiter(0));
        stack.delimiter(Delimiter(2));
        assert!(!stack.delimited);
        stack.delimiter(Delimiter(1));
        stack.delimiter(Delimiter(1));
        assert!(stack.delimited);
        assert!(stack.delimiter_stack.is_empty());
    }

    #[test]
    fn usages_and_ranges() {
        let globals = Globals {
            usage_page: Some(UsagePage(0x07)),
            ..Globals::default()
        };
        let locals = Locals {
            usages: vec![
                LocalUsage::Id(UsageId(0x04)),
                LocalUsage::Extended(Usage::new(0x0c, 0xe9)),
            ],
            usage_minimum: Some(UsageMinimum(0xe0)),
            usage_maximum: Some(UsageMaximum(0xe7)),
            ..Locals::default()
        };
        let usages = compile_usages(&globals, &locals, 4);
        assert_eq!(
            usages,
            [
                Usage::new(0x07, 0x04),
                Usage::new(0x0c, 0xe9),
                Usage::new(0x07, 0xe0),
                Usage::new(0x07, 0xe1),
            ]
        );

        let locals = Locals {
            usage_minimum: Some(UsageMinimum(0x0009_0001)),
            usage_maximum: Some(UsageMaximum(0x0009_0003)),
            ..Locals::default()
        };
        assert_eq!(compile_usages(&globals, &locals, 8).last(), Some(&Usage::new(0x09, 0x03)));
    }

    #[test]
    fn repeated_names_group() {
        let mut section = Section::new(true);
        section.push(Some("a".into()), Codec::U8).unwrap();
        section.push(Some("a".into()), Codec::U8).unwrap();
        section.push(None, Codec::padding(4)).unwrap();
        section.push(Some("b".into()), Codec::bits(4).unwrap()).unwrap();
        assert_eq!(section.bits, 24);

        let err = section.push(Some("a".into()), Codec::U8).unwrap_err();
        assert!(matches!(err, ParserError::Report { .. }));

        assert!(Section::new(true).is_empty());

        let codec = section.into_codec();
        let value = Value::map()
            .with("a", Value::List(vec![1u8.into(), 2u8.into()]))
            .with("b", 0xfu8);
        let bytes = codec.pack(&value).unwrap();
        assert_eq!(bytes, [1, 2, 0xf0]);
        assert_eq!(codec.parse(&bytes).unwrap().data, value);
    }

    #[test]
    fn nested_sections() {
        let mut parent = Section::new(true);
        parent.push(Some("x".into()), Codec::U8).unwrap();

        let mut child = Section::new(true);
        child.push(Some("y".into()), Codec::U8).unwrap();
        parent.merge(child, None).unwrap();

        let mut child = Section::new(false);
        child.push(None, Codec::U16).unwrap();
        child.push(None, Codec::U16).unwrap();
        parent.merge(child, Some("z".into())).unwrap();

        let mut child = Section::new(false);
        child.push(None, Codec::U8).unwrap();
        assert!(parent.merge(child, None).is_err());

        assert_eq!(parent.bits, 48);
        let value = Value::map()
            .with("x", 1u8)
            .with("y", 2u8)
            .with("z", Value::List(vec![3u16.into(), 4u16.into()]));
        assert_eq!(parent.into_codec().pack(&value).unwrap(), [1, 2, 3, 0, 4, 0]);
    }

    #[test]
    fn report_table_numbering() {
        let mut table = ReportTable::default();
        table
            .insert(Report {
                id: Some(ReportId(2)),
                name: Some("Light".into()),
                direction: Direction::Input,
                bits: 8,
                codec: Codec::Array(vec![Codec::U8]),
            })
            .unwrap();
        let duplicate = Report {
            id: Some(ReportId(2)),
            name: None,
            direction: Direction::Input,
            bits: 0,
            codec: Codec::Array(vec![]),
        };
        assert!(table.insert(duplicate).is_err());

        assert_eq!(table.by_name("Light").and_then(Report::id), Some(ReportId(2)));
        let (id, value) = table.parse_report(&[2, 7]).unwrap();
        assert_eq!(id, Some(ReportId(2)));
        assert_eq!(value, Value::List(vec![7u8.into()]));
        assert!(table.parse_report(&[3, 7]).is_err());
        assert_eq!(
            table
                .pack_report(Some(ReportId(2)), &Value::List(vec![9u8.into()]))
                .unwrap(),
            [2, 9]
        );
    }

    #[test]
    fn simple_field_mapping() {
        let roles = UsageRoles {
            page: 0xff00,
            application: 1,
            array: 2,
            object: 3,
            uint: 4,
            int: 5,
            float: 6,
            bits: 7,
            utf8: 8,
        };
        let field = |id: u16, size: usize| simple_field(&roles, Usage::new(0xff00, id), size, 0);
        assert_eq!(field(4, 3).unwrap().static_bits(), Some(3));
        assert_eq!(field(4, 64).unwrap().static_bits(), Some(64));
        assert_eq!(field(5, 16).unwrap().static_bits(), Some(16));
        assert_eq!(field(6, 32).unwrap().static_bits(), Some(32));
        assert_eq!(field(8, 48).unwrap().static_bits(), Some(48));
        for (id, size) in [(4, 12), (5, 4), (6, 16), (8, 12), (7, 8), (2, 8), (99, 8), (4, 300)] {
            assert!(
                matches!(field(id, size), Err(ParserError::Descriptor { .. })),
                "{id}/{size}"
            );
        }
    }
}
