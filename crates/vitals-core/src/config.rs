//! Runtime configuration for the coordination core.
//!
//! Every interval the task loops depend on lives here rather than in
//! scattered constants, so the tick model is explicit and tests can shrink
//! the windows to keep wall-clock time down.

use embassy_time::Duration;
use serde::{Deserialize, Serialize};

/// Timing and bound configuration for the coordination core.
///
/// The defaults match the original device firmware: 50 ms hardware button
/// debounce, 200 ms UI event cooldown, 100 ms sensor tick, a 10 s
/// temperature scan, 10-deep queues, a 2 s single-flight send gate timeout,
/// a 100 ms inter-send delay, 5 uplink retries, and a 30 s display
/// inactivity blank.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreConfig {
    /// Stage-1 debounce window per physical button, in milliseconds.
    pub button_debounce_ms: u64,
    /// Stage-2 cooldown between accepted button events, in milliseconds.
    pub button_cooldown_ms: u64,
    /// Period of the sensor sampling task, in milliseconds.
    pub sensor_tick_ms: u64,
    /// Period of the UI refresh task, in milliseconds.
    pub ui_refresh_ms: u64,
    /// Duration of a temperature scan, in milliseconds.
    pub scan_duration_ms: u64,
    /// Bound on waiting for the sensor bus lock, in milliseconds.
    pub bus_acquire_timeout_ms: u64,
    /// Bound on a single bus transaction once the lock is held, in
    /// milliseconds.
    pub bus_transaction_timeout_ms: u64,
    /// Bound on acquiring the single-flight send gate, in milliseconds.
    pub send_gate_timeout_ms: u64,
    /// Enforced pause between outbound sends, in milliseconds.
    pub inter_send_delay_ms: u64,
    /// How long the telemetry consumer sleeps while the link is not up, in
    /// milliseconds.
    pub link_poll_ms: u64,
    /// Automatic uplink reconnect attempts before giving up.
    pub max_link_retries: u8,
    /// Inactivity window after which the display blanks, in milliseconds.
    pub display_timeout_ms: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            button_debounce_ms: 50,
            button_cooldown_ms: 200,
            sensor_tick_ms: 100,
            ui_refresh_ms: 100,
            scan_duration_ms: 10_000,
            bus_acquire_timeout_ms: 250,
            bus_transaction_timeout_ms: 100,
            send_gate_timeout_ms: 2_000,
            inter_send_delay_ms: 100,
            link_poll_ms: 1_000,
            max_link_retries: 5,
            display_timeout_ms: 30_000,
        }
    }
}

impl CoreConfig {
    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.button_debounce_ms)
    }

    pub fn cooldown_window(&self) -> Duration {
        Duration::from_millis(self.button_cooldown_ms)
    }

    pub fn sensor_tick(&self) -> Duration {
        Duration::from_millis(self.sensor_tick_ms)
    }

    pub fn ui_refresh(&self) -> Duration {
        Duration::from_millis(self.ui_refresh_ms)
    }

    pub fn scan_duration(&self) -> Duration {
        Duration::from_millis(self.scan_duration_ms)
    }

    pub fn bus_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.bus_acquire_timeout_ms)
    }

    pub fn bus_transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.bus_transaction_timeout_ms)
    }

    pub fn send_gate_timeout(&self) -> Duration {
        Duration::from_millis(self.send_gate_timeout_ms)
    }

    pub fn inter_send_delay(&self) -> Duration {
        Duration::from_millis(self.inter_send_delay_ms)
    }

    pub fn link_poll(&self) -> Duration {
        Duration::from_millis(self.link_poll_ms)
    }

    pub fn display_timeout(&self) -> Duration {
        Duration::from_millis(self.display_timeout_ms)
    }
}
