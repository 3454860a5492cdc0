use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use validator::Validate;

pub const DEFAULT_TILT_DEG: f64 = 35.0;
pub const DEFAULT_ORIENTATION_DEG: f64 = 180.0;

/// Which vendor API (if any) supplies live generation for a site
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum InverterType {
    Enphase,
    Solis,
    GivEnergy,
    Solarman,
    Victron,
    #[default]
    None,
}

impl InverterType {
    pub fn has_live_data(&self) -> bool {
        !matches!(self, InverterType::None)
    }
}

/// A PV installation.
///
/// Angles are in degrees. `orientation` is the panel azimuth measured
/// clockwise from north, so 180 faces due south.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct PvSite {
    #[validate(range(min = -90.0, max = 90.0))]
    pub latitude: f64,
    #[validate(range(min = -180.0, max = 180.0))]
    pub longitude: f64,
    #[validate(range(min = 0.0))]
    pub capacity_kwp: f64,
    #[serde(default = "default_tilt")]
    #[validate(range(min = 0.0, max = 90.0))]
    pub tilt: f64,
    #[serde(default = "default_orientation")]
    #[validate(range(min = 0.0, max = 360.0))]
    pub orientation: f64,
    #[serde(default)]
    pub inverter_type: InverterType,
}

fn default_tilt() -> f64 {
    DEFAULT_TILT_DEG
}

fn default_orientation() -> f64 {
    DEFAULT_ORIENTATION_DEG
}

impl PvSite {
    pub fn new(latitude: f64, longitude: f64, capacity_kwp: f64) -> Self {
        Self {
            latitude,
            longitude,
            capacity_kwp,
            tilt: DEFAULT_TILT_DEG,
            orientation: DEFAULT_ORIENTATION_DEG,
            inverter_type: InverterType::None,
        }
    }

    pub fn with_panel(mut self, tilt: f64, orientation: f64) -> Self {
        self.tilt = tilt;
        self.orientation = orientation;
        self
    }

    pub fn with_inverter(mut self, inverter_type: InverterType) -> Self {
        self.inverter_type = inverter_type;
        self
    }

    /// Copy with coordinates rounded to two decimals (~1 km), so exact
    /// locations never leave the service.
    pub fn round_latitude_and_longitude(&self) -> Self {
        let round2 = |v: f64| (v * 100.0).round() / 100.0;
        Self {
            latitude: round2(self.latitude),
            longitude: round2(self.longitude),
            ..self.clone()
        }
    }
}
