// SPDX-License-Identifier: MIT

//! The HID class descriptor, Section 6.2.1 of the HID 1.11 specification.
//!
//! It is part of the configuration descriptor and tells the host how long
//! the Report Descriptor is before fetching it.

use crate::codec::Codec;
use crate::{ensure, ParserError, Result, Value};

pub const HID_DESCRIPTOR_TYPE: u8 = 0x21;
pub const REPORT_DESCRIPTOR_TYPE: u8 = 0x22;
pub const PHYSICAL_DESCRIPTOR_TYPE: u8 = 0x23;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HidDescriptor {
    /// The HID specification release in BCD, e.g. `0x0111`.
    pub bcd_hid: u16,
    pub country_code: u8,
    /// The class descriptors as (type, length) pairs.
    pub descriptors: Vec<(u8, u16)>,
}

fn hid_descriptor_codec() -> Codec {
    Codec::map([
        ("bLength", Codec::U8),
        ("bDescriptorType", Codec::U8),
        ("bcdHID", Codec::U16),
        ("bCountryCode", Codec::U8),
        ("bNumDescriptors", Codec::U8),
        (
            "descriptors",
            Codec::repeat(
                "bNumDescriptors",
                Codec::map([("bDescriptorType", Codec::U8), ("wDescriptorLength", Codec::U16)]),
            ),
        ),
    ])
}

fn int<T: TryFrom<i64>>(value: &Value, name: &str) -> Result<T> {
    value
        .get(name)
        .and_then(Value::as_i64)
        .and_then(|v| T::try_from(v).ok())
        .ok_or_else(|| ParserError::Descriptor {
            offset: None,
            message: format!("HID descriptor without valid {name}"),
        })
}

impl HidDescriptor {
    pub fn parse(bytes: &[u8]) -> Result<HidDescriptor> {
        let value = hid_descriptor_codec().parse(bytes)?.data;
        let descriptor_type: u8 = int(&value, "bDescriptorType")?;
        ensure!(
            descriptor_type == HID_DESCRIPTOR_TYPE,
            ParserError::Descriptor {
                offset: Some(1),
                message: format!("Not a HID descriptor: type {descriptor_type:#04x}"),
            }
        );
        let descriptors = value
            .get("descriptors")
            .and_then(Value::items)
            .unwrap_or_default()
            .iter()
            .map(|d| -> Result<(u8, u16)> {
                Ok((int(d, "bDescriptorType")?, int(d, "wDescriptorLength")?))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(HidDescriptor {
            bcd_hid: int(&value, "bcdHID")?,
            country_code: int(&value, "bCountryCode")?,
            descriptors,
        })
    }

    /// The length of the Report Descriptor, if listed.
    pub fn report_descriptor_length(&self) -> Option<u16> {
        self.descriptors
            .iter()
            .find(|(kind, _)| *kind == REPORT_DESCRIPTOR_TYPE)
            .map(|(_, length)| *length)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let count = u8::try_from(self.descriptors.len()).map_err(|_| ParserError::Descriptor {
            offset: None,
            message: format!("{} class descriptors do not fit", self.descriptors.len()),
        })?;
        let descriptors = self
            .descriptors
            .iter()
            .map(|(kind, length)| {
                Value::map()
                    .with("bDescriptorType", *kind)
                    .with("wDescriptorLength", *length)
            })
            .collect::<Vec<_>>();
        let value = Value::map()
            .with("bLength", 6 + 3 * u16::from(count))
            .with("bDescriptorType", HID_DESCRIPTOR_TYPE)
            .with("bcdHID", self.bcd_hid)
            .with("bCountryCode", self.country_code)
            .with("bNumDescriptors", count)
            .with("descriptors", Value::List(descriptors));
        Ok(hid_descriptor_codec().pack(&value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mouse() {
        let bytes = [0x09, 0x21, 0x11, 0x01, 0x00, 0x01, 0x22, 0x34, 0x00];
        let hid = HidDescriptor::parse(&bytes).unwrap();
        assert_eq!(hid.bcd_hid, 0x0111);
        assert_eq!(hid.country_code, 0);
        assert_eq!(hid.descriptors, [(REPORT_DESCRIPTOR_TYPE, 0x34)]);
        assert_eq!(hid.report_descriptor_length(), Some(0x34));
        assert_eq!(hid.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn with_physical_descriptor() {
        let hid = HidDescriptor {
            bcd_hid: 0x0101,
            country_code: 33,
            descriptors: vec![(PHYSICAL_DESCRIPTOR_TYPE, 12), (REPORT_DESCRIPTOR_TYPE, 0x1ff)],
        };
        let bytes = hid.to_bytes().unwrap();
        assert_eq!(bytes.len(), 12);
        assert_eq!(bytes[0], 12);
        assert_eq!(HidDescriptor::parse(&bytes).unwrap(), hid);
        assert_eq!(hid.report_descriptor_length(), Some(0x1ff));
    }

    #[test]
    fn invalid() {
        assert!(matches!(
            HidDescriptor::parse(&[0x09, 0x22, 0x11, 0x01, 0x00, 0x00]),
            Err(ParserError::Descriptor { .. })
        ));
        // one descriptor announced but missing
        assert!(matches!(
            HidDescriptor::parse(&[0x09, 0x21, 0x11, 0x01, 0x00, 0x01]),
            Err(ParserError::Codec(_))
        ));
    }
}
