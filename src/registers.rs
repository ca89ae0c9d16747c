use crate::sentinel::{Fault, SentinelTable};

/// Pages on which the controller substitutes faults for out-of-range measurements.
pub const SENTINEL_PAGES: [u8; 3] = [4, 6, 7];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize)]
pub struct RegisterAddress {
    pub page: u8,
    pub offset: u8,
}

impl RegisterAddress {
    pub const fn new(page: u8, offset: u8) -> Self {
        Self { page, offset }
    }

    /// The address of the first register on the wire.
    pub const fn linear(&self) -> u16 {
        (self.page as u16) * 256 + self.offset as u16
    }
}

impl std::fmt::Display for RegisterAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{}:{}", self.page, self.offset))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub enum Width {
    /// A single 16-bit register.
    Word,
    /// Two consecutive registers, high word first.
    Long,
}

impl Width {
    pub const fn registers(&self) -> u16 {
        match self {
            Width::Word => 1,
            Width::Long => 2,
        }
    }

    pub const fn bits(&self) -> u8 {
        match self {
            Width::Word => 16,
            Width::Long => 32,
        }
    }
}

/// How to interpret the raw value of one field.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize)]
pub struct RegisterDescriptor {
    pub width: Width,
    pub signed: bool,
    pub scale: f64,
    pub sentinel_eligible: bool,
}

impl RegisterDescriptor {
    pub fn decode(&self, raw: i64) -> DecodedValue {
        if self.sentinel_eligible {
            if let Some(fault) = SentinelTable::for_type(self.width, self.signed).get(raw) {
                return DecodedValue::Sentinel(fault);
            }
        }
        DecodedValue::Numeric(raw as f64 * self.scale)
    }
}

/// A register location together with the way its contents are decoded.
///
/// Fields are declared as constants by chaining the builder methods:
/// `Field::long(4, 8).scale(0.1)` is the unsigned 32-bit value at page 4, offset 8, in tenths.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize)]
pub struct Field {
    pub address: RegisterAddress,
    pub descriptor: RegisterDescriptor,
}

impl Field {
    const fn new(page: u8, offset: u8, width: Width) -> Self {
        let mut sentinel_eligible = false;
        let mut idx = 0;
        while idx < SENTINEL_PAGES.len() {
            sentinel_eligible |= SENTINEL_PAGES[idx] == page;
            idx += 1;
        }
        Self {
            address: RegisterAddress::new(page, offset),
            descriptor: RegisterDescriptor { width, signed: false, scale: 1.0, sentinel_eligible },
        }
    }

    pub const fn word(page: u8, offset: u8) -> Self {
        Self::new(page, offset, Width::Word)
    }

    pub const fn long(page: u8, offset: u8) -> Self {
        Self::new(page, offset, Width::Long)
    }

    pub const fn signed(mut self) -> Self {
        self.descriptor.signed = true;
        self
    }

    pub const fn scale(mut self, scale: f64) -> Self {
        self.descriptor.scale = scale;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum DecodedValue {
    Sentinel(Fault),
    Numeric(f64),
}

impl DecodedValue {
    pub fn numeric(&self) -> Option<f64> {
        match *self {
            DecodedValue::Numeric(n) => Some(n),
            DecodedValue::Sentinel(_) => None,
        }
    }
}

impl std::fmt::Display for DecodedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            DecodedValue::Sentinel(fault) => f.write_fmt(format_args!("[{fault}]")),
            DecodedValue::Numeric(n) => f.write_fmt(format_args!("{n}")),
        }
    }
}

impl serde::Serialize for DecodedValue {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match *self {
            DecodedValue::Sentinel(fault) => serializer.serialize_str(<&str>::from(fault)),
            DecodedValue::Numeric(n) => serializer.serialize_f64(n),
        }
    }
}
