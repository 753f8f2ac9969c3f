pub mod config;
pub mod controller;
pub mod element;
pub mod error;
pub mod relay;
pub mod statistics;
pub mod store;
pub mod topics;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{HeaterConfig, MqttConfig, RelayConfig, RuntimeConfig};
pub use controller::{wear_leveling_order, HeaterController, StatusListener};
pub use element::HeatingElement;
pub use error::{HeaterError, RelayError};
pub use relay::{register_auto_off_scripts, restart_stopped_scripts, RelayClient};
pub use statistics::{ConsumptionReport, ReportGate};
pub use store::{CounterEntry, DayCounterStore, MemoryCounterStore};
pub use topics::*;
pub use types::{ElementStatus, HeaterStatus, LocalTime, StepOutcome, StepResponse};
