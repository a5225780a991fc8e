//! Public types shared across the SDK: endpoints, inventory configuration
//! and the events emitted by the inventory engine.

use crate::protocol;
use std::fmt;
use std::time::{Duration, SystemTime};

/// Network address of a reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Endpoint {
            host: host.into(),
            port,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Controls how the reader performs inventory polling.
///
/// `session`, `target` and `q_value` pass through to the Gen2 air protocol
/// untouched. `no_tag_ab_switch` is the number of consecutive empty rounds
/// before the inventory target is flipped (0 disables). `single_fallback_each`
/// additionally issues the one-shot inventory command every Nth round, for
/// firmwares that answer 0x01 with a count only (0 disables).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryConfig {
    pub reader_address: u8,
    pub auto_address: bool,
    pub q_value: u8,
    pub session: u8,
    pub target: u8,
    pub antenna_mask: u8,
    pub scan_time: u8,
    pub poll_interval: Duration,
    pub output_power: u8,
    pub region: Option<(u8, u8)>,
    pub per_antenna_power: Vec<u8>,
    pub no_tag_ab_switch: u32,
    pub single_fallback_each: u32,
}

impl Default for InventoryConfig {
    /// Balanced low-latency configuration.
    fn default() -> Self {
        InventoryConfig {
            reader_address: protocol::DEFAULT_READER_ADDRESS,
            auto_address: true,
            q_value: 0x04,
            session: 0x01,
            target: 0x00,
            antenna_mask: 0x01,
            scan_time: 0x01,
            poll_interval: Duration::from_millis(40),
            output_power: 0x1E,
            region: None,
            per_antenna_power: Vec::new(),
            no_tag_ab_switch: 4,
            single_fallback_each: 6,
        }
    }
}

impl InventoryConfig {
    /// Real inventory cycle; firmware scan-time is a hard lower bound.
    pub fn effective_interval(&self) -> Duration {
        let mut floor = Duration::from_millis(u64::from(self.scan_time) * 100);
        if floor < Duration::from_millis(40) {
            floor = Duration::from_millis(40);
        }
        self.poll_interval.max(floor)
    }

    /// Clamps out-of-range fields to safe values.
    pub fn normalized(mut self) -> Self {
        if self.antenna_mask == 0 {
            self.antenna_mask = 0x01;
        }
        if self.scan_time == 0 {
            self.scan_time = 0x01;
        }
        if self.output_power > 0x1E {
            self.output_power = 0x1E;
        }
        if self.poll_interval.is_zero() {
            self.poll_interval = Duration::from_millis(40);
        }
        for power in &mut self.per_antenna_power {
            if *power > 0x1E {
                *power = 0x1E;
            }
        }
        self
    }
}

/// Picks the next active antenna from the mask, round-robin from `start`.
///
/// Returns the wire antenna byte (`0x80 | bit_index`) and the index to resume
/// from next round. An empty mask yields `0x80`.
pub fn next_inventory_antenna(mask: u8, start: usize) -> (u8, usize) {
    let mask = if mask == 0 { 0x01 } else { mask };
    let start = start % 8;
    for i in 0..8 {
        let idx = (start + i) % 8;
        if mask & (1 << idx) != 0 {
            return (0x80 | idx as u8, (idx + 1) % 8);
        }
    }
    (0x80, start)
}

/// One decoded EPC read.
#[derive(Debug, Clone)]
pub struct TagEvent {
    pub when: SystemTime,
    pub source: &'static str,
    pub epc: String,
    pub antenna: u8,
    pub rssi: u8,
    pub is_new: bool,
    pub rounds: u64,
    pub unique_tags: u64,
}

/// Lightweight progress signal from the SDK loops.
#[derive(Debug, Clone)]
pub struct StatusEvent {
    pub when: SystemTime,
    pub message: String,
}

/// Current inventory counters.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub running: bool,
    pub rounds: u64,
    pub unique_tags: u64,
    pub last_tag_epc: String,
    pub reader_address: u8,
    pub target: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_interval_uses_scan_time_floor() {
        let cfg = InventoryConfig {
            scan_time: 2,
            poll_interval: Duration::from_millis(40),
            ..InventoryConfig::default()
        };
        assert_eq!(cfg.effective_interval(), Duration::from_millis(200));
    }

    #[test]
    fn effective_interval_uses_poll_when_larger() {
        let cfg = InventoryConfig {
            scan_time: 1,
            poll_interval: Duration::from_millis(350),
            ..InventoryConfig::default()
        };
        assert_eq!(cfg.effective_interval(), Duration::from_millis(350));
    }

    #[test]
    fn effective_interval_has_40ms_floor() {
        let cfg = InventoryConfig {
            scan_time: 0,
            poll_interval: Duration::from_millis(1),
            ..InventoryConfig::default()
        };
        assert_eq!(cfg.effective_interval(), Duration::from_millis(40));
    }

    #[test]
    fn normalized_sets_safe_defaults() {
        let cfg = InventoryConfig {
            antenna_mask: 0,
            scan_time: 0,
            poll_interval: Duration::ZERO,
            output_power: 0x40,
            per_antenna_power: vec![0x10, 0x7F],
            ..InventoryConfig::default()
        }
        .normalized();

        assert_eq!(cfg.antenna_mask, 0x01);
        assert_eq!(cfg.scan_time, 0x01);
        assert_eq!(cfg.output_power, 0x1E);
        assert_eq!(cfg.poll_interval, Duration::from_millis(40));
        assert_eq!(cfg.per_antenna_power, vec![0x10, 0x1E]);
    }

    #[test]
    fn antenna_cycles_mask() {
        let mask = 0x05; // ports 1 and 3
        let (a1, next) = next_inventory_antenna(mask, 0);
        assert_eq!(a1, 0x80);
        let (a2, next) = next_inventory_antenna(mask, next);
        assert_eq!(a2, 0x82);
        let (a3, _) = next_inventory_antenna(mask, next);
        assert_eq!(a3, 0x80);
    }

    #[test]
    fn antenna_empty_mask_falls_back_to_port_one() {
        let (a, _) = next_inventory_antenna(0, 3);
        assert_eq!(a, 0x80);
    }

    #[test]
    fn antenna_wraps_past_last_bit() {
        let (a, _) = next_inventory_antenna(0x02, 5);
        assert_eq!(a, 0x81);
    }
}
