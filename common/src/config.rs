use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoostConfig {
    pub base_secs: u16,
    pub increment_secs: u16,
    pub max_presses: u8,
}

impl Default for BoostConfig {
    fn default() -> Self {
        Self {
            base_secs: 1_800,
            increment_secs: 900,
            max_presses: 3,
        }
    }
}

/// The schedule/broadcast tick is fixed at one second; it also counts boost down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub button_tick_ms: u64,
    pub relay_tick_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            button_tick_ms: 1,
            relay_tick_ms: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    pub button_pin: i32,
    pub relay_trigger_pin: i32,
    pub relay_hold_pin: i32,
    pub status_led_pin: Option<i32>,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            // Valid on both ESP32 and ESP32-S3, clear of strapping and flash pins.
            button_pin: 18,
            relay_trigger_pin: 4,
            relay_hold_pin: 13,
            status_led_pin: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub boost: BoostConfig,
    #[serde(default)]
    pub hardware: HardwareConfig,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            timing: TimingConfig::default(),
            boost: BoostConfig::default(),
            hardware: HardwareConfig::default(),
            timezone: default_timezone(),
            http_port: default_http_port(),
        }
    }
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_http_port() -> u16 {
    80
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.timing.sanitize();
        self.boost.sanitize();
        if self.timezone.trim().is_empty() {
            self.timezone = default_timezone();
        }
        if self.http_port == 0 {
            self.http_port = default_http_port();
        }
    }
}

impl TimingConfig {
    pub fn sanitize(&mut self) {
        // Debounce has to stay well under the ~8-sample press window.
        self.button_tick_ms = self.button_tick_ms.clamp(1, 5);
        self.relay_tick_ms = self.relay_tick_ms.clamp(50, 2_000);
    }
}

impl BoostConfig {
    pub fn sanitize(&mut self) {
        if self.base_secs == 0 {
            self.base_secs = Self::default().base_secs;
        }
        self.max_presses = self.max_presses.clamp(1, 10);

        // Worst case countdown must fit the u16 counter.
        let ladder = u32::from(self.base_secs)
            + u32::from(self.increment_secs) * u32::from(self.max_presses - 1);
        if ladder > u32::from(u16::MAX) {
            *self = Self::default();
        }
    }
}
