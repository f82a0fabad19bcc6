// SPDX-License-Identifier: MIT

//! Wrapper types for the data carried by HID items.
//!
//! These exist for type safety only, each wraps the integer type the
//! interpreter stores for that item. Section references point to the
//! [HID Device Class Definition for HID 1.11](https://www.usb.org/document-library/device-class-definition-hid-111).

/// Declares a `Copy` newtype around `$inner` with lossless conversions in
/// both directions and a `Display` that prints the inner number.
macro_rules! hid_type {
    ($(#[$meta:meta])* $name:ident($inner:ty)) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name(pub $inner);

        impl From<$name> for $inner {
            fn from(v: $name) -> $inner {
                v.0
            }
        }

        impl From<&$name> for $inner {
            fn from(v: &$name) -> $inner {
                v.0
            }
        }

        impl From<$inner> for $name {
            fn from(v: $inner) -> $name {
                $name(v)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

// Global items, Section 6.2.2.7

hid_type!(UsagePage(u16));
hid_type!(LogicalMinimum(i32));
hid_type!(LogicalMaximum(u32));
hid_type!(PhysicalMinimum(i32));
hid_type!(PhysicalMaximum(u32));
hid_type!(
    /// Exponent of the unit, a signed nibble on the wire.
    UnitExponent(i32)
);
hid_type!(Unit(u32));
hid_type!(
    /// The width of a single field in bits.
    ReportSize(usize)
);
hid_type!(
    /// The first byte of a report when a device uses more than one report.
    ReportId(u8)
);
hid_type!(ReportCount(usize));

// Local items, Section 6.2.2.8

hid_type!(UsageId(u16));
hid_type!(UsageMinimum(u32));
hid_type!(UsageMaximum(u32));
hid_type!(DesignatorIndex(u32));
hid_type!(DesignatorMinimum(u32));
hid_type!(DesignatorMaximum(u32));
hid_type!(
    /// Index of a USB string descriptor.
    StringIndex(u32)
);
hid_type!(StringMinimum(u32));
hid_type!(StringMaximum(u32));
hid_type!(
    /// `1` opens a delimited set, `0` closes it.
    Delimiter(u32)
);

/// A fully qualified usage.
///
/// A Usage item with four data bytes carries its own page in the upper 16
/// bits (an "extended usage"), shorter Usage items inherit the page of the
/// current [UsagePage].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Usage {
    pub page: UsagePage,
    pub id: UsageId,
}

impl Usage {
    pub fn new(page: u16, id: u16) -> Usage {
        Usage {
            page: UsagePage(page),
            id: UsageId(id),
        }
    }

    /// Split an extended usage into page and id.
    pub fn from_extended(value: u32) -> Usage {
        Usage::new((value >> 16) as u16, (value & 0xffff) as u16)
    }

    pub fn extended(&self) -> u32 {
        (u32::from(self.page.0) << 16) | u32::from(self.id.0)
    }
}

impl std::fmt::Display for Usage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04x}:{:04x}", self.page.0, self.id.0)
    }
}
