//! Reserved raw values the controller reports in place of a measurement.
//!
//! The top eight representable values of every register type are not measurements, but markers
//! for why no measurement is available. Which eight values those are depends on the width and
//! signedness of the register.

use crate::registers::Width;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display, strum::IntoStaticStr)]
pub enum Fault {
    #[strum(serialize = "Unimplemented")]
    Unimplemented,
    #[strum(serialize = "Over measurable range")]
    OverRange,
    #[strum(serialize = "Under measurable range")]
    UnderRange,
    #[strum(serialize = "Transducer fault")]
    TransducerFault,
    #[strum(serialize = "Bad Data")]
    BadData,
    #[strum(serialize = "High digital input")]
    DigitalHigh,
    #[strum(serialize = "Low digital input")]
    DigitalLow,
    #[strum(serialize = "Reserved")]
    Reserved,
}

/// Faults in the order of their raw codes, starting at the top of the range.
const FAULTS: [Fault; 8] = [
    Fault::Unimplemented,
    Fault::OverRange,
    Fault::UnderRange,
    Fault::TransducerFault,
    Fault::BadData,
    Fault::DigitalHigh,
    Fault::DigitalLow,
    Fault::Reserved,
];

/// An exact map of eight raw codes to faults for one register type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SentinelTable {
    entries: [(i64, Fault); 8],
}

impl SentinelTable {
    pub const U16: Self = Self::below(0xFFFF);
    pub const I16: Self = Self::below(0x7FFF);
    pub const U32: Self = Self::below(0xFFFF_FFFF);
    pub const I32: Self = Self::below(0x7FFF_FFFF);

    const fn below(top: i64) -> Self {
        let mut entries = [(0, Fault::Unimplemented); 8];
        let mut idx = 0;
        while idx < FAULTS.len() {
            entries[idx] = (top - idx as i64, FAULTS[idx]);
            idx += 1;
        }
        Self { entries }
    }

    pub const fn for_type(width: Width, signed: bool) -> &'static Self {
        match (width, signed) {
            (Width::Word, false) => &Self::U16,
            (Width::Word, true) => &Self::I16,
            (Width::Long, false) => &Self::U32,
            (Width::Long, true) => &Self::I32,
        }
    }

    pub fn get(&self, raw: i64) -> Option<Fault> {
        self.entries.iter().find(|(code, _)| *code == raw).map(|(_, fault)| *fault)
    }

    pub fn entries(&self) -> impl Iterator<Item = (i64, Fault)> + '_ {
        self.entries.iter().copied()
    }
}
