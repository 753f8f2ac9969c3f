use chrono::{DateTime, FixedOffset};
use serde::Serialize;

/// Local wall-clock time together with its UTC offset. Calendar fields are
/// local; the difference of two values is the real elapsed time, also across
/// a daylight saving change.
pub type LocalTime = DateTime<FixedOffset>;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Activated(usize),
    Deactivated(usize),
    RateLimited,
    NoChange,
    RelayFailed(usize),
}

impl StepOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Activated(_) => "ACTIVATED",
            Self::Deactivated(_) => "DEACTIVATED",
            Self::RateLimited => "RATE_LIMITED",
            Self::NoChange => "NO_CHANGE",
            Self::RelayFailed(_) => "RELAY_FAILED",
        }
    }

    pub fn changed(self) -> bool {
        matches!(self, Self::Activated(_) | Self::Deactivated(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ElementStatus {
    pub id: usize,
    pub activated: bool,
    #[serde(rename = "lastActivation")]
    pub last_activation: String,
    #[serde(rename = "lastDeactivation")]
    pub last_deactivation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeaterStatus {
    pub power: u32,
    #[serde(rename = "maxPower")]
    pub max_power: u32,
    #[serde(rename = "elementPowerWatts")]
    pub element_power_watts: u32,
    #[serde(rename = "elementCount")]
    pub element_count: usize,
    #[serde(rename = "activeCount")]
    pub active_count: usize,
    pub elements: Vec<ElementStatus>,
    #[serde(rename = "consumptionToday")]
    pub consumption_today: u64,
    #[serde(rename = "consumptionCurrentYear")]
    pub consumption_current_year: u64,
    #[serde(rename = "consumptionEstimatedYear")]
    pub consumption_estimated_year: u64,
    #[serde(rename = "consumedPowerEstimate")]
    pub consumed_power_estimate: u32,
    #[serde(rename = "lastPowerChange")]
    pub last_power_change: String,
    #[serde(rename = "lastTimeHeating")]
    pub last_time_heating: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepResponse {
    pub outcome: &'static str,
    pub status: HeaterStatus,
}
