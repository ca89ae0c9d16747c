//! Typed snapshots of the controller's instrumentation, each read field by field.

use crate::connection::Bus;
use crate::reader::{self, RetryingReader};
use crate::registers::{DecodedValue, Field};

pub const CONTROL_MODE: Field = Field::word(3, 4);
pub const ALARMS: Field = Field::word(3, 6);

/// Declares a snapshot struct together with the fields it is read from.
///
/// Every member is either a `value` read from one field or a `triple` of per-phase values read
/// from three fields. `FIELDS` lists the same fields for introspection.
macro_rules! snapshot {
    (@type value) => { DecodedValue };
    (@type triple) => { [DecodedValue; 3] };
    (@read $reader:ident, value, $f:expr) => { $reader.read($f).await? };
    (@read $reader:ident, triple, $a:expr, $b:expr, $c:expr) => {
        [$reader.read($a).await?, $reader.read($b).await?, $reader.read($c).await?]
    };
    (@display $v:expr, value) => { $v.to_string() };
    (@display $v:expr, triple) => {
        $v.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ")
    };
    (
        $(#[$attr:meta])*
        pub struct $name:ident {
            $($field:ident: $shape:ident [$($f:expr),+ $(,)?],)*
        }
    ) => {
        $(#[$attr])*
        #[derive(Clone, Debug, PartialEq, serde::Serialize)]
        pub struct $name {
            $(pub $field: snapshot!(@type $shape),)*
        }

        impl $name {
            pub const FIELDS: &'static [(&'static str, &'static [Field])] =
                &[$((stringify!($field), &[$($f),+]),)*];

            pub async fn read<B: Bus>(
                reader: &mut RetryingReader<B>,
            ) -> Result<Self, reader::Error> {
                Ok(Self {
                    $($field: snapshot!(@read reader, $shape, $($f),+),)*
                })
            }

            /// Field names with their values formatted for display.
            pub fn values(&self) -> Vec<(&'static str, String)> {
                vec![$((stringify!($field), snapshot!(@display self.$field, $shape)),)*]
            }
        }
    };
}

snapshot! {
    pub struct Status {
        manufacturer_id: value [Field::word(3, 0)],
        model_id: value [Field::word(3, 1)],
        serial_number: value [Field::long(3, 2)],
        control_mode: value [CONTROL_MODE],
    }
}

snapshot! {
    pub struct BasicInstrumentation {
        oil_pressure: value [Field::word(4, 0)],
        coolant_temperature: value [Field::word(4, 1).signed()],
        fuel_level: value [Field::word(4, 3)],
        alternator_voltage: value [Field::word(4, 4).scale(0.1)],
        battery_voltage: value [Field::word(4, 5).scale(0.1)],
        engine_speed: value [Field::word(4, 6)],
        frequency: value [Field::word(4, 7).scale(0.1)],
        l_n_voltage: triple [
            Field::long(4, 8).scale(0.1),
            Field::long(4, 10).scale(0.1),
            Field::long(4, 12).scale(0.1),
        ],
        l_l_voltage: triple [
            Field::long(4, 14).scale(0.1),
            Field::long(4, 16).scale(0.1),
            Field::long(4, 18).scale(0.1),
        ],
        l_current: triple [
            Field::long(4, 20).scale(0.1),
            Field::long(4, 22).scale(0.1),
            Field::long(4, 24).scale(0.1),
        ],
        earth_current: value [Field::long(4, 26).scale(0.1)],
        l_power: triple [
            Field::long(4, 28).signed(),
            Field::long(4, 30).signed(),
            Field::long(4, 32).signed(),
        ],
        current_theta: value [Field::word(4, 34).signed()],
    }
}

snapshot! {
    pub struct DerivedInstrumentation {
        true_power: value [Field::long(5, 0).signed()],
        l_apparent_power: triple [Field::long(5, 2), Field::long(5, 4), Field::long(5, 6)],
        apparent_power: value [Field::long(5, 8)],
        l_reactive_power: triple [Field::long(5, 10), Field::long(5, 12), Field::long(5, 14)],
        reactive_power: value [Field::long(5, 16)],
        l_power_factor: triple [
            Field::word(5, 18).signed().scale(0.01),
            Field::word(5, 19).signed().scale(0.01),
            Field::word(5, 20).signed().scale(0.01),
        ],
        power_factor: value [Field::word(5, 21).signed().scale(0.01)],
        true_power_capacity: value [Field::word(5, 22).signed().scale(0.1)],
        reactive_power_capacity: value [Field::word(5, 23).signed().scale(0.1)],
    }
}

snapshot! {
    pub struct DiagnosticGeneral {
        software_version: value [Field::word(11, 0).scale(0.01)],
        cpu_usage: value [Field::word(11, 1)],
        last_button_pressed: value [Field::word(11, 2)],
        backup_supply_voltage: value [Field::word(11, 3)],
    }
}

macro_rules! alarms {
    ($($name:ident = $bit:literal,)*) => {
        /// Alarm flags decoded from the bits of a single register.
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
        pub struct AlarmState {
            $(pub $name: bool,)*
        }

        impl AlarmState {
            pub const BITS: &'static [(&'static str, u32)] = &[$((stringify!($name), $bit),)*];

            pub fn from_raw(raw: i64) -> Self {
                Self { $($name: (raw >> $bit) & 1 == 1,)* }
            }

            pub fn flags(&self) -> impl Iterator<Item = (&'static str, bool)> {
                [$((stringify!($name), self.$name),)*].into_iter()
            }
        }
    };
}

// Bit 16 lies past the end of the 16-bit register, so it never reads as set.
alarms! {
    control_unit_not_configured = 16,
    control_unit_failure = 14,
    shutdown_alarm = 13,
    electrical_trip_alarm = 12,
    warning_alarm = 11,
    telemetry_alarm = 10,
    satellite_telemetry_alarm = 9,
    no_font_file = 8,
}

impl AlarmState {
    pub async fn read<B: Bus>(reader: &mut RetryingReader<B>) -> Result<Self, reader::Error> {
        Ok(Self::from_raw(reader.read_raw(ALARMS).await?))
    }

    pub fn active(&self) -> impl Iterator<Item = &'static str> {
        self.flags().filter_map(|(name, set)| set.then_some(name))
    }

    pub fn values(&self) -> Vec<(&'static str, String)> {
        self.flags().map(|(name, set)| (name, set.to_string())).collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::FromRepr, strum::Display)]
#[repr(u16)]
pub enum ControlMode {
    #[strum(serialize = "Stop")]
    Stop = 0,
    #[strum(serialize = "Auto")]
    Auto = 1,
    #[strum(serialize = "Manual")]
    Manual = 2,
    #[strum(serialize = "Test on load")]
    TestOnLoad = 3,
    #[strum(serialize = "Auto with manual restore")]
    AutoWithManualRestore = 4,
    #[strum(serialize = "User configuration")]
    UserConfiguration = 5,
    #[strum(serialize = "Test off load")]
    TestOffLoad = 6,
}

impl ControlMode {
    pub fn from_value(value: DecodedValue) -> Option<Self> {
        let n = value.numeric()?;
        if n.fract() != 0.0 || !(0.0..=f64::from(u16::MAX)).contains(&n) {
            return None;
        }
        Self::from_repr(n as u16)
    }

    pub fn describe(value: DecodedValue) -> String {
        match Self::from_value(value) {
            Some(mode) => mode.to_string(),
            None => "Unknown".to_string(),
        }
    }
}

/// Everything read during one polling cycle.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct Reading {
    pub taken_at: jiff::Timestamp,
    pub control_mode: DecodedValue,
    pub basic: BasicInstrumentation,
    pub derived: DerivedInstrumentation,
    pub alarms: AlarmState,
}

impl Reading {
    pub async fn read<B: Bus>(reader: &mut RetryingReader<B>) -> Result<Self, reader::Error> {
        let control_mode = reader.read(CONTROL_MODE).await?;
        let basic = BasicInstrumentation::read(reader).await?;
        let derived = DerivedInstrumentation::read(reader).await?;
        let alarms = AlarmState::read(reader).await?;
        Ok(Self { taken_at: jiff::Timestamp::now(), control_mode, basic, derived, alarms })
    }
}
