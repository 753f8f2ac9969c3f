use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaterConfig {
    pub element_count: usize,
    pub element_power_watts: u32,
    pub reconcile_interval_secs: u64,
    pub statistics_check_interval_secs: u64,
    pub statistics_report_interval_hours: u32,
    pub auto_decrease_check_interval_secs: u64,
    pub auto_decrease_after_mins: u32,
    pub increase_cooldown_step_mins: u32,
    pub script_health_interval_secs: u64,
    pub activity_sample_interval_secs: u64,
    pub counter_ttl_days: u32,
    pub counter_flush_interval_secs: u64,
}

impl Default for HeaterConfig {
    fn default() -> Self {
        Self {
            element_count: 3,
            element_power_watts: 500,
            reconcile_interval_secs: 59,
            statistics_check_interval_secs: 600,
            statistics_report_interval_hours: 3,
            auto_decrease_check_interval_secs: 60,
            auto_decrease_after_mins: 23,
            increase_cooldown_step_mins: 1,
            script_health_interval_secs: 7 * 60 * 60,
            activity_sample_interval_secs: 30,
            counter_ttl_days: 366,
            counter_flush_interval_secs: 60,
        }
    }
}

impl HeaterConfig {
    pub fn sanitize(&mut self) {
        self.element_count = self.element_count.clamp(1, 16);
        self.element_power_watts = self.element_power_watts.max(1);
        self.reconcile_interval_secs = self.reconcile_interval_secs.max(1);
        self.statistics_check_interval_secs = self.statistics_check_interval_secs.max(1);
        self.statistics_report_interval_hours = self.statistics_report_interval_hours.max(1);
        self.auto_decrease_check_interval_secs = self.auto_decrease_check_interval_secs.max(1);
        self.auto_decrease_after_mins = self.auto_decrease_after_mins.max(1);
        self.script_health_interval_secs = self.script_health_interval_secs.max(60);
        // The activity record has one slot per minute; sampling slower than
        // that leaves holes in it.
        self.activity_sample_interval_secs = self.activity_sample_interval_secs.clamp(1, 60);
        self.counter_ttl_days = self.counter_ttl_days.max(1);
        self.counter_flush_interval_secs = self.counter_flush_interval_secs.max(1);
    }

    pub fn max_power(&self) -> u32 {
        self.element_count as u32 * self.element_power_watts
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub address: String,
    pub request_timeout_secs: u64,
    pub script_timeout_secs: u64,
    pub auto_off_minutes: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            address: "http://192.168.1.110".to_string(),
            request_timeout_secs: 10,
            script_timeout_secs: 15,
            auto_off_minutes: 45,
        }
    }
}

impl RelayConfig {
    pub fn sanitize(&mut self) {
        while self.address.ends_with('/') {
            self.address.pop();
        }
        self.request_timeout_secs = self.request_timeout_secs.clamp(1, 60);
        self.script_timeout_secs = self.script_timeout_secs.clamp(1, 60);
        self.auto_off_minutes = self.auto_off_minutes.clamp(1, 24 * 60);
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
}

impl MqttConfig {
    pub fn is_enabled(&self) -> bool {
        !self.host.trim().is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub heater: HeaterConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_timezone() -> String {
    "Europe/Berlin".to_string()
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            heater: HeaterConfig::default(),
            relay: RelayConfig::default(),
            mqtt: MqttConfig {
                port: 1883,
                ..MqttConfig::default()
            },
            timezone: default_timezone(),
        }
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.heater.sanitize();
        self.relay.sanitize();
        if self.mqtt.port == 0 {
            self.mqtt.port = 1883;
        }
    }
}
