//! Units and values for decoded sensor readings

use std::fmt;

/// Unit attached to a decoded reading
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ObdUnit {
    /// Revolutions per minute
    Rpm,
    /// Kilometres per hour
    KilometersPerHour,
    /// Degrees Celsius
    Celsius,
    /// Percent. Fuel trims are signed around zero
    Percent,
    /// Kilopascal
    KiloPascal,
    /// Grams per second
    GramsPerSecond,
    /// Volts
    Volts,
    /// Seconds
    Seconds,
    /// Degrees of crankshaft rotation before top dead centre
    Degrees,
    /// Dimensionless count
    Count,
}

impl ObdUnit {
    /// Display symbol, where the unit has a customary one
    pub fn symbol(&self) -> Option<&'static str> {
        match self {
            Self::Rpm => Some("rpm"),
            Self::KilometersPerHour => Some("km/h"),
            Self::Celsius => Some("°C"),
            Self::Percent => Some("%"),
            Self::KiloPascal => Some("kPa"),
            Self::GramsPerSecond => Some("g/s"),
            Self::Volts => Some("V"),
            Self::Seconds => Some("s"),
            Self::Degrees => Some("°"),
            Self::Count => None,
        }
    }
}

/// A decoded sensor value tagged with its unit
#[derive(Debug, Copy, Clone, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ObdValue {
    value: f32,
    unit: ObdUnit,
}

impl ObdValue {
    /// Wraps a raw value with its unit
    pub fn new(value: f32, unit: ObdUnit) -> Self {
        Self { value, unit }
    }

    /// The numeric value, expressed in [ObdValue::unit]
    pub fn value(&self) -> f32 {
        self.value
    }

    /// Unit the value is expressed in
    pub fn unit(&self) -> ObdUnit {
        self.unit
    }

    /// Formats in metric units, the native OBD2 scaling
    pub fn to_metric_string(&self) -> String {
        self.to_string()
    }

    /// Formats in imperial units where a customary conversion exists,
    /// metric otherwise
    pub fn to_imperial_string(&self) -> String {
        match self.unit {
            ObdUnit::KilometersPerHour => format!("{:.1} mph", self.value * 0.621_371),
            ObdUnit::Celsius => format!("{:.1} °F", self.value * 1.8 + 32.0),
            ObdUnit::KiloPascal => format!("{:.2} psi", self.value * 0.145_038),
            _ => self.to_string(),
        }
    }
}

impl fmt::Display for ObdValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.unit.symbol() {
            Some(symbol) => write!(f, "{} {symbol}", self.value),
            None => write!(f, "{}", self.value),
        }
    }
}
