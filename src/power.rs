//! Battery monitor. Fuses the battery-bus and dock-contact current-sense
//! channels into a [`BatteryState`]; the charging flag latches only after
//! both dock-bus thresholds hold for N consecutive samples.

use crate::config::{BatterySafetyConfig, PowerSensorConfig};
use crate::types::{BatteryState, PowerSample};
use std::collections::VecDeque;

/// Pack voltage mapped linearly onto state of charge.
const SOC_EMPTY_VOLTAGE: f64 = 10.5;
const SOC_FULL_VOLTAGE: f64 = 13.4;

#[derive(Clone, Debug, PartialEq)]
pub enum PowerEvent {
    ChargeConfirmed,
    ChargeLost,
    RapidDrain { volts_per_min: f64 },
}

pub struct BatteryMonitor {
    charge_current_threshold: f64,
    contact_voltage_threshold: f64,
    confirm_samples: u32,
    rapid_drain_threshold: f64,

    state: BatteryState,
    good_dock_samples: u32,
    /// (timestamp, voltage) window for drain-rate estimation.
    voltage_history: VecDeque<(f64, f64)>,
    rapid_drain_reported: bool,
}

impl BatteryMonitor {
    pub fn new(power: &PowerSensorConfig, battery: &BatterySafetyConfig) -> Self {
        BatteryMonitor {
            charge_current_threshold: power.charge_current_threshold,
            contact_voltage_threshold: power.contact_voltage_threshold,
            confirm_samples: power.confirm_samples.max(1),
            rapid_drain_threshold: battery.rapid_drain_threshold,
            state: BatteryState::default(),
            good_dock_samples: 0,
            voltage_history: VecDeque::new(),
            rapid_drain_reported: false,
        }
    }

    pub fn feed_battery_bus(&mut self, sample: &PowerSample) -> Vec<PowerEvent> {
        let mut events = Vec::new();
        self.state.voltage = sample.voltage;
        self.state.current = sample.current;
        self.state.state_of_charge = ((sample.voltage - SOC_EMPTY_VOLTAGE)
            / (SOC_FULL_VOLTAGE - SOC_EMPTY_VOLTAGE))
            .clamp(0.0, 1.0);

        self.voltage_history
            .push_back((sample.timestamp, sample.voltage));
        while let Some(&(ts, _)) = self.voltage_history.front() {
            if sample.timestamp - ts > 60.0 {
                self.voltage_history.pop_front();
            } else {
                break;
            }
        }
        if let (Some(&(t0, v0)), Some(&(t1, v1))) =
            (self.voltage_history.front(), self.voltage_history.back())
        {
            let span = t1 - t0;
            if span > 10.0 && !self.state.charging {
                let volts_per_min = (v0 - v1) / span * 60.0;
                if volts_per_min > self.rapid_drain_threshold {
                    if !self.rapid_drain_reported {
                        self.rapid_drain_reported = true;
                        events.push(PowerEvent::RapidDrain { volts_per_min });
                    }
                } else {
                    self.rapid_drain_reported = false;
                }
            }
        }
        events
    }

    pub fn feed_dock_bus(&mut self, sample: &PowerSample) -> Vec<PowerEvent> {
        let mut events = Vec::new();
        self.state.dock_bus_voltage = sample.voltage;
        self.state.dock_bus_current = sample.current;

        let good = sample.current > self.charge_current_threshold
            && sample.voltage > self.contact_voltage_threshold;
        if good {
            self.good_dock_samples = self.good_dock_samples.saturating_add(1);
        } else {
            self.good_dock_samples = 0;
        }

        let charging = self.good_dock_samples >= self.confirm_samples;
        if charging != self.state.charging {
            self.state.charging = charging;
            events.push(if charging {
                PowerEvent::ChargeConfirmed
            } else {
                PowerEvent::ChargeLost
            });
        }
        events
    }

    pub fn state(&self) -> BatteryState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> BatteryMonitor {
        BatteryMonitor::new(
            &PowerSensorConfig::default(),
            &BatterySafetyConfig::default(),
        )
    }

    fn dock_sample(ts: f64, voltage: f64, current: f64) -> PowerSample {
        PowerSample {
            timestamp: ts,
            voltage,
            current,
        }
    }

    #[test]
    fn test_charging_latches_after_n_samples() {
        let mut m = monitor();
        // Defaults: 0.2 A / 13.0 V thresholds, 5 confirm samples.
        for i in 0..4 {
            let events = m.feed_dock_bus(&dock_sample(i as f64 * 0.1, 13.5, 0.5));
            assert!(events.is_empty());
            assert!(!m.state().charging);
        }
        let events = m.feed_dock_bus(&dock_sample(0.5, 13.5, 0.5));
        assert_eq!(events, vec![PowerEvent::ChargeConfirmed]);
        assert!(m.state().charging);
    }

    #[test]
    fn test_one_bad_sample_resets_the_count() {
        let mut m = monitor();
        for i in 0..4 {
            m.feed_dock_bus(&dock_sample(i as f64 * 0.1, 13.5, 0.5));
        }
        // Current dips below threshold: counter resets, no latch.
        m.feed_dock_bus(&dock_sample(0.4, 13.5, 0.1));
        for i in 0..4 {
            m.feed_dock_bus(&dock_sample(0.5 + i as f64 * 0.1, 13.5, 0.5));
            assert!(!m.state().charging);
        }
    }

    #[test]
    fn test_charge_lost_when_contact_breaks() {
        let mut m = monitor();
        for i in 0..5 {
            m.feed_dock_bus(&dock_sample(i as f64 * 0.1, 13.5, 0.5));
        }
        assert!(m.state().charging);
        let events = m.feed_dock_bus(&dock_sample(0.6, 12.0, 0.5));
        assert_eq!(events, vec![PowerEvent::ChargeLost]);
        assert!(!m.state().charging);
    }

    #[test]
    fn test_thresholds_are_strict() {
        let mut m = monitor();
        // Exactly at the thresholds does not count as charging contact.
        for i in 0..10 {
            m.feed_dock_bus(&dock_sample(i as f64 * 0.1, 13.0, 0.2));
        }
        assert!(!m.state().charging);
    }

    #[test]
    fn test_soc_estimate_clamped() {
        let mut m = monitor();
        m.feed_battery_bus(&PowerSample {
            timestamp: 0.0,
            voltage: 13.4,
            current: 1.0,
        });
        assert!((m.state().state_of_charge - 1.0).abs() < 1e-9);
        m.feed_battery_bus(&PowerSample {
            timestamp: 1.0,
            voltage: 9.0,
            current: 1.0,
        });
        assert_eq!(m.state().state_of_charge, 0.0);
    }

    #[test]
    fn test_rapid_drain_detected_once() {
        let mut m = monitor();
        // 12.8 V falling to 12.0 V over 40 s: 1.2 V/min, above the 0.5
        // default threshold.
        let mut reports = 0;
        for i in 0..40 {
            let v = 12.8 - i as f64 * 0.02;
            let events = m.feed_battery_bus(&PowerSample {
                timestamp: i as f64,
                voltage: v,
                current: 2.0,
            });
            reports += events
                .iter()
                .filter(|e| matches!(e, PowerEvent::RapidDrain { .. }))
                .count();
        }
        assert_eq!(reports, 1);
    }
}
