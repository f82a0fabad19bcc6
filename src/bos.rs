// SPDX-License-Identifier: MIT

//! The USB Binary Object Store (BOS) descriptor and its device capabilities.
//!
//! A device supporting SimpleHID advertises it with a platform capability
//! that assigns the SimpleHID roles to usages of one vendor usage page.
//! Pass [Bos::usage_roles] to [ReportDescriptor::compile](crate::ReportDescriptor::compile)
//! to get typed, named report schemas.
//!
//! ```
//! # use hidschema::bos::*;
//! #[rustfmt::skip]
//! let bytes = [
//!     0x05, 0x0f, 0x0c, 0x00, 0x01,       // BOS, 12 bytes, 1 capability
//!     0x07, 0x10, 0x02,                   // USB 2.0 Extension
//!     0x06, 0x00, 0x00, 0x00,
//! ];
//! let bos = Bos::parse(&bytes).unwrap();
//! assert_eq!(
//!     bos.capabilities(),
//!     [Capability::Other { capability_type: 0x02, data: vec![0x06, 0, 0, 0] }]
//! );
//! assert!(bos.usage_roles().is_none());
//! ```

use crate::codec::{Chooser, Codec, CodecError, Length, Padding, Span};
use crate::{ensure, ParserError, Result, Value};
use tracing::debug;

pub const BOS_DESCRIPTOR_TYPE: u8 = 0x0f;
pub const DEVICE_CAPABILITY_DESCRIPTOR_TYPE: u8 = 0x10;
pub const PLATFORM_CAPABILITY: u8 = 0x05;

/// `{3408b638-09a9-47a0-8bfd-a0768815b665}` in wire order.
pub const WEBUSB_UUID: [u8; 16] = [
    0x38, 0xb6, 0x08, 0x34, 0xa9, 0x09, 0xa0, 0x47, 0x8b, 0xfd, 0xa0, 0x76, 0x88, 0x15, 0xb6, 0x65,
];

/// `{a8adf97c-6a20-48e4-a97c-79978eec00c7}` in wire order.
pub const SIMPLEHID_UUID: [u8; 16] = [
    0x7c, 0xf9, 0xad, 0xa8, 0x20, 0x6a, 0xe4, 0x48, 0xa9, 0x7c, 0x79, 0x97, 0x8e, 0xec, 0x00, 0xc7,
];

/// The highest SimpleHID major version this crate understands.
pub const SIMPLEHID_MAJOR_VERSION: u8 = 1;

/// The roles SimpleHID assigns to usages of its usage page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// The Application collection of SimpleHID reports.
    Application,
    /// A collection compiled to a positional report.
    Array,
    /// A collection compiled to a report with named fields.
    Object,
    Uint,
    Int,
    Float,
    Bits,
    Utf8,
}

/// The usage ids of each [Role], all on usage page `page`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UsageRoles {
    pub page: u16,
    pub application: u16,
    pub array: u16,
    pub object: u16,
    pub uint: u16,
    pub int: u16,
    pub float: u16,
    pub bits: u16,
    pub utf8: u16,
}

impl UsageRoles {
    /// The role of the given usage id of the SimpleHID page. If two roles
    /// share a usage id the first in declaration order wins.
    pub fn role_of(&self, usage_id: u16) -> Option<Role> {
        [
            (self.application, Role::Application),
            (self.array, Role::Array),
            (self.object, Role::Object),
            (self.uint, Role::Uint),
            (self.int, Role::Int),
            (self.float, Role::Float),
            (self.bits, Role::Bits),
            (self.utf8, Role::Utf8),
        ]
        .into_iter()
        .find(|(id, _)| *id == usage_id)
        .map(|(_, role)| role)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimpleHid {
    pub version: Version,
    pub roles: UsageRoles,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WebUsb {
    pub version: u16,
    pub vendor_code: u8,
    pub landing_page: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    WebUsb(WebUsb),
    SimpleHid(SimpleHid),
    /// A platform capability with an unknown UUID.
    Platform { uuid: [u8; 16], data: Vec<u8> },
    /// Any other device capability.
    Other { capability_type: u8, data: Vec<u8> },
}

const WEBUSB: i64 = 1;
const SIMPLEHID: i64 = 2;

const ROLE_FIELDS: [&str; 9] = [
    "page",
    "application",
    "array",
    "object",
    "uint",
    "int",
    "float",
    "bits",
    "utf8",
];

/// The bytes of a capability after its first `used` bytes.
fn remainder(used: usize) -> Length {
    Length::computed(move |ctx| {
        let length = usize::try_from(ctx.integer("bLength")?).unwrap_or(0);
        length.checked_sub(used).ok_or_else(|| CodecError::InvalidSize {
            codec: format!("capability of at least {used} bytes"),
            size: length,
        })
    })
}

fn skip_remainder(used: usize) -> Codec {
    Codec::embed(Codec::Padding(Padding::new(Span::Bytes(remainder(used)))))
}

fn capability_codec(simplehid: [u8; 16]) -> Codec {
    let webusb = Codec::map([
        ("bcdVersion", Codec::U16),
        ("bVendorCode", Codec::U8),
        ("iLandingPage", Codec::U8),
        ("", skip_remainder(24)),
    ]);

    let version = Codec::map([("major", Codec::U8), ("minor", Codec::U8), ("patch", Codec::U8)]);
    let simplehid_payload = Codec::map(
        std::iter::once(("version", version))
            .chain(ROLE_FIELDS.iter().map(|name| (*name, Codec::U16)))
            .chain(std::iter::once(("", skip_remainder(41)))),
    );

    let uuid = Chooser::computed(move |ctx| {
        let uuid = ctx.get("PlatformCapabilityUUID").and_then(Value::as_bytes);
        Ok(match uuid {
            Some(uuid) if uuid == WEBUSB_UUID.as_slice() => WEBUSB,
            Some(uuid) if uuid == simplehid.as_slice() => SIMPLEHID,
            _ => 0,
        })
    });
    let platform = Codec::map([
        ("bReserved", Codec::U8),
        ("PlatformCapabilityUUID", Codec::bytes(16)),
        (
            "",
            Codec::embed(Codec::branch_or(
                uuid,
                [(WEBUSB, webusb), (SIMPLEHID, simplehid_payload)],
                Codec::map([("CapabilityData", Codec::bytes(remainder(20)))]),
            )),
        ),
    ]);

    Codec::map([
        ("bLength", Codec::U8),
        ("bDescriptorType", Codec::U8),
        ("bDevCapabilityType", Codec::U8),
        (
            "",
            Codec::embed(Codec::branch_or(
                "bDevCapabilityType",
                [(i64::from(PLATFORM_CAPABILITY), platform)],
                Codec::map([("CapabilityData", Codec::bytes(remainder(3)))]),
            )),
        ),
    ])
}

/// The codec of a whole BOS descriptor, recognizing SimpleHID capabilities
/// by the given UUID.
///
/// Capabilities are parsed into flat maps using the USB field names, e.g.
/// `bDevCapabilityType` or `PlatformCapabilityUUID`.
pub fn bos_codec(simplehid: [u8; 16]) -> Codec {
    Codec::map([
        ("bLength", Codec::U8),
        ("bDescriptorType", Codec::U8),
        ("wTotalLength", Codec::U16),
        ("bNumDeviceCaps", Codec::U8),
        ("capabilities", Codec::repeat("bNumDeviceCaps", capability_codec(simplehid))),
    ])
}

fn missing(name: &str) -> ParserError {
    ParserError::Descriptor {
        offset: None,
        message: format!("BOS descriptor without valid {name}"),
    }
}

fn field<'a>(value: &'a Value, name: &str) -> Result<&'a Value> {
    value.get(name).ok_or_else(|| missing(name))
}

fn int<T: TryFrom<i64>>(value: &Value, name: &str) -> Result<T> {
    field(value, name)?
        .as_i64()
        .and_then(|v| T::try_from(v).ok())
        .ok_or_else(|| missing(name))
}

fn bytes(value: &Value, name: &str) -> Result<Vec<u8>> {
    field(value, name)?
        .as_bytes()
        .map(<[u8]>::to_vec)
        .ok_or_else(|| missing(name))
}

impl Capability {
    fn from_value(value: &Value, simplehid: [u8; 16]) -> Result<Capability> {
        let descriptor_type: u8 = int(value, "bDescriptorType")?;
        ensure!(
            descriptor_type == DEVICE_CAPABILITY_DESCRIPTOR_TYPE,
            ParserError::Descriptor {
                offset: None,
                message: format!("Invalid device capability descriptor type {descriptor_type:#04x}"),
            }
        );
        let capability_type: u8 = int(value, "bDevCapabilityType")?;
        if capability_type != PLATFORM_CAPABILITY {
            debug!("Skipping device capability {capability_type:#04x}");
            return Ok(Capability::Other {
                capability_type,
                data: bytes(value, "CapabilityData")?,
            });
        }

        let uuid: [u8; 16] = bytes(value, "PlatformCapabilityUUID")?
            .try_into()
            .map_err(|_| missing("PlatformCapabilityUUID"))?;
        if uuid == WEBUSB_UUID {
            Ok(Capability::WebUsb(WebUsb {
                version: int(value, "bcdVersion")?,
                vendor_code: int(value, "bVendorCode")?,
                landing_page: int(value, "iLandingPage")?,
            }))
        } else if uuid == simplehid {
            SimpleHid::from_value(value).map(Capability::SimpleHid)
        } else {
            debug!("Skipping platform capability {uuid:02x?}");
            Ok(Capability::Platform {
                uuid,
                data: bytes(value, "CapabilityData")?,
            })
        }
    }
}

impl SimpleHid {
    fn from_value(value: &Value) -> Result<SimpleHid> {
        let version = field(value, "version")?;
        let version = Version {
            major: int(version, "major")?,
            minor: int(version, "minor")?,
            patch: int(version, "patch")?,
        };
        ensure!(
            version.major <= SIMPLEHID_MAJOR_VERSION,
            ParserError::Descriptor {
                offset: None,
                message: format!(
                    "Incompatible SimpleHID version {}.{}.{}",
                    version.major, version.minor, version.patch
                ),
            }
        );
        let roles = UsageRoles {
            page: int(value, "page")?,
            application: int(value, "application")?,
            array: int(value, "array")?,
            object: int(value, "object")?,
            uint: int(value, "uint")?,
            int: int(value, "int")?,
            float: int(value, "float")?,
            bits: int(value, "bits")?,
            utf8: int(value, "utf8")?,
        };
        debug!("SimpleHID {}.{} on usage page {:#06x}", version.major, version.minor, roles.page);
        Ok(SimpleHid { version, roles })
    }
}

/// A decoded BOS descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bos {
    total_length: usize,
    capabilities: Vec<Capability>,
}

impl Bos {
    pub fn parse(bytes: &[u8]) -> Result<Bos> {
        Bos::parse_with(bytes, SIMPLEHID_UUID)
    }

    /// Parse, recognizing SimpleHID capabilities by `simplehid` instead of
    /// [SIMPLEHID_UUID].
    pub fn parse_with(bytes: &[u8], simplehid: [u8; 16]) -> Result<Bos> {
        let parsed = bos_codec(simplehid).parse(bytes)?;
        let value = parsed.data;
        let descriptor_type: u8 = int(&value, "bDescriptorType")?;
        ensure!(
            descriptor_type == BOS_DESCRIPTOR_TYPE,
            ParserError::Descriptor {
                offset: Some(1),
                message: format!("Not a BOS descriptor: type {descriptor_type:#04x}"),
            }
        );
        let total_length: usize = int(&value, "wTotalLength")?;
        if total_length != parsed.size {
            debug!("BOS wTotalLength is {total_length} but {} bytes were parsed", parsed.size);
        }
        let capabilities = field(&value, "capabilities")?
            .items()
            .unwrap_or_default()
            .iter()
            .map(|cap| Capability::from_value(cap, simplehid))
            .collect::<Result<Vec<_>>>()?;
        Ok(Bos {
            total_length,
            capabilities,
        })
    }

    /// The total length as declared by the descriptor.
    pub fn total_length(&self) -> usize {
        self.total_length
    }

    pub fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    pub fn simplehid(&self) -> Option<&SimpleHid> {
        self.capabilities.iter().find_map(|cap| match cap {
            Capability::SimpleHid(simplehid) => Some(simplehid),
            _ => None,
        })
    }

    /// The SimpleHID roles, if the device supports SimpleHID.
    pub fn usage_roles(&self) -> Option<&UsageRoles> {
        self.simplehid().map(|simplehid| &simplehid.roles)
    }

    pub fn webusb(&self) -> Option<&WebUsb> {
        self.capabilities.iter().find_map(|cap| match cap {
            Capability::WebUsb(webusb) => Some(webusb),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roles() -> UsageRoles {
        UsageRoles {
            page: 0xff00,
            application: 1,
            array: 2,
            object: 3,
            uint: 4,
            int: 5,
            float: 6,
            bits: 7,
            utf8: 8,
        }
    }

    #[test]
    fn role_lookup() {
        let roles = roles();
        assert_eq!(roles.role_of(1), Some(Role::Application));
        assert_eq!(roles.role_of(8), Some(Role::Utf8));
        assert_eq!(roles.role_of(9), None);

        let shared = UsageRoles { int: 4, ..roles };
        assert_eq!(shared.role_of(4), Some(Role::Uint));
    }

    #[test]
    fn pack_simplehid_capability() {
        let roles = roles();
        let mut capability = Value::map()
            .with("bLength", 41u8)
            .with("bDescriptorType", DEVICE_CAPABILITY_DESCRIPTOR_TYPE)
            .with("bDevCapabilityType", PLATFORM_CAPABILITY)
            .with("bReserved", 0u8)
            .with("PlatformCapabilityUUID", SIMPLEHID_UUID.to_vec())
            .with(
                "version",
                Value::map().with("major", 1u8).with("minor", 2u8).with("patch", 0u8),
            );
        let ids = [
            roles.page,
            roles.application,
            roles.array,
            roles.object,
            roles.uint,
            roles.int,
            roles.float,
            roles.bits,
            roles.utf8,
        ];
        for (name, id) in ROLE_FIELDS.iter().zip(ids) {
            capability = capability.with(*name, id);
        }
        let bos = Value::map()
            .with("bLength", 5u8)
            .with("bDescriptorType", BOS_DESCRIPTOR_TYPE)
            .with("wTotalLength", 46u16)
            .with("bNumDeviceCaps", 1u8)
            .with("capabilities", Value::List(vec![capability]));

        let bytes = bos_codec(SIMPLEHID_UUID).pack(&bos).unwrap();
        assert_eq!(bytes.len(), 46);
        assert_eq!(bytes[5..9], [41, 0x10, 0x05, 0x00]);
        assert_eq!(bytes[28..30], [0x00, 0xff]);

        let parsed = Bos::parse(&bytes).unwrap();
        assert_eq!(parsed.total_length(), 46);
        assert_eq!(parsed.usage_roles(), Some(&roles));
        assert_eq!(
            parsed.simplehid().map(|s| s.version),
            Some(Version {
                major: 1,
                minor: 2,
                patch: 0
            })
        );
    }

    #[test]
    fn short_capability() {
        // a platform capability must hold at least its UUID
        #[rustfmt::skip]
        let bytes = [
            0x05, 0x0f, 0x0a, 0x00, 0x01,
            0x05, 0x10, 0x05, 0x00, 0x00,
        ];
        assert!(Bos::parse(&bytes).is_err());
    }

    #[test]
    fn wrong_descriptor_type() {
        let bytes = [0x05, 0x02, 0x05, 0x00, 0x00];
        let err = Bos::parse(&bytes).unwrap_err();
        assert!(matches!(err, ParserError::Descriptor { offset: Some(1), .. }));
    }
}
