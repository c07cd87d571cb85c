// SPDX-License-Identifier: AGPL-3.0-only

//! Checking and recording the output packets of a run.
//!
//! Expected count `i` belongs to output tick `tick_latency + 1 + i`. Packets
//! on earlier ticks are ignored. Strict mode compares each packet with the
//! next expected one; relaxed mode accepts any packet still expected on the
//! current tick. [`OutputRecorder`] captures the same layout from a device
//! whose outputs are not known yet.

use crate::error::{DriverError, Result};
use spikegrid_models::scenario::ScenarioParams;
use spikegrid_models::PacketSchedule;
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, info};

/// Ticks without output after which a recording stops.
pub const QUIET_TICKS: u64 = 3;

/// Consumer of the output packets a scenario run produces.
pub trait OutputHandler {
    /// Take one output packet received on `tick`.
    ///
    /// # Errors
    ///
    /// Implementation-defined; the run stops on the first error.
    fn accept(&mut self, tick: u32, packet: u32) -> Result<()>;

    /// Called after every TICK frame with the number sent so far.
    fn tick_sent(&mut self, ticks_sent: u64);

    /// True once the run may stop ticking.
    fn completed(&self) -> bool;

    /// Packets taken so far.
    fn accepted(&self) -> usize;
}

/// Incremental output checker for one scenario.
#[derive(Debug, Clone)]
pub struct OutputValidator {
    relaxed: bool,
    tick_latency: u32,
    check_ticks: Option<u32>,
    expected: Vec<Vec<u32>>,
    slot: usize,
    current: VecDeque<u32>,
    remaining: usize,
    checked: usize,
    completed: bool,
}

impl OutputValidator {
    /// Validator for `outputs` under `params`.
    pub fn new(outputs: &PacketSchedule<u32>, params: &ScenarioParams) -> Self {
        let expected: Vec<Vec<u32>> = outputs.ticks().map(<[u32]>::to_vec).collect();
        let current = expected.first().cloned().unwrap_or_default().into();
        Self {
            relaxed: params.relax_packet_ordering,
            tick_latency: params.tick_latency,
            check_ticks: params.num_ticks_to_check,
            expected,
            slot: 0,
            current,
            remaining: outputs.len(),
            checked: 0,
            completed: outputs.is_empty(),
        }
    }

    /// True once every expected packet has been matched, or checking was
    /// cut short with [`OutputValidator::finish`].
    pub const fn completed(&self) -> bool {
        self.completed
    }

    /// Packets matched so far.
    pub const fn checked(&self) -> usize {
        self.checked
    }

    /// Stop checking; later packets are ignored.
    pub fn finish(&mut self) {
        self.completed = true;
    }

    fn slot_tick(&self) -> u64 {
        u64::from(self.tick_latency) + 1 + self.slot as u64
    }

    /// Check one output packet received on `tick`.
    ///
    /// # Errors
    ///
    /// [`DriverError::OutputMismatch`] if the packet was not expected, or an
    /// earlier tick is still missing packets.
    pub fn check(&mut self, tick: u32, packet: u32) -> Result<()> {
        if tick <= self.tick_latency || self.completed {
            return Ok(());
        }

        if u64::from(tick) != self.slot_tick() {
            if !self.current.is_empty() {
                return Err(DriverError::output_mismatch(
                    tick,
                    packet,
                    format!(
                        "{} packets expected on tick {} never arrived",
                        self.current.len(),
                        self.slot_tick()
                    ),
                ));
            }
            debug!("tick {} complete", self.slot_tick());
            while self.current.is_empty() {
                self.slot += 1;
                match self.expected.get(self.slot) {
                    Some(next) => self.current = next.iter().copied().collect(),
                    None => {
                        self.completed = true;
                        return Ok(());
                    }
                }
            }
            if u64::from(tick) != self.slot_tick() {
                return Err(DriverError::output_mismatch(
                    tick,
                    packet,
                    format!("next expected output is on tick {}", self.slot_tick()),
                ));
            }
        }

        if self.relaxed {
            let Some(position) = self.current.iter().position(|p| *p == packet) else {
                return Err(DriverError::output_mismatch(
                    tick,
                    packet,
                    "not expected during this tick",
                ));
            };
            if position > 0 {
                debug!("tick {tick}: packet {packet:#b} correct but out of order");
            }
            self.current.remove(position);
        } else {
            match self.current.pop_front() {
                Some(expected) if expected == packet => {}
                Some(expected) => {
                    return Err(DriverError::output_mismatch(
                        tick,
                        packet,
                        format!("expected {expected:#b}"),
                    ));
                }
                None => {
                    return Err(DriverError::output_mismatch(
                        tick,
                        packet,
                        "no packets expected during this tick",
                    ));
                }
            }
        }

        self.checked += 1;
        self.remaining -= 1;
        if self.remaining == 0 {
            debug!("all {} expected packets correct", self.checked);
            self.completed = true;
        }
        Ok(())
    }
}

impl OutputHandler for OutputValidator {
    fn accept(&mut self, tick: u32, packet: u32) -> Result<()> {
        self.check(tick, packet)
    }

    fn tick_sent(&mut self, ticks_sent: u64) {
        if let Some(limit) = self.check_ticks {
            if ticks_sent >= u64::from(limit) && !self.completed {
                info!("stopped checking outputs after {limit} ticks");
                self.finish();
            }
        }
    }

    fn completed(&self) -> bool {
        self.completed
    }

    fn accepted(&self) -> usize {
        self.checked
    }
}

/// Captures a device's output packets as an expected-output schedule.
///
/// Recording stops once [`QUIET_TICKS`] ticks pass without output after the
/// later of the last output and the last input tick, or after
/// `num_ticks_to_check` ticks when that is set.
#[derive(Debug, Clone)]
pub struct OutputRecorder {
    tick_latency: u32,
    check_ticks: Option<u32>,
    last_active: u64,
    ticks: BTreeMap<u32, Vec<u32>>,
    recorded: usize,
    completed: bool,
}

impl OutputRecorder {
    /// Recorder for a scenario with `input_ticks` ticks of inputs.
    pub fn new(params: &ScenarioParams, input_ticks: usize) -> Self {
        Self {
            tick_latency: params.tick_latency,
            check_ticks: params.num_ticks_to_check,
            last_active: u64::from(params.tick_latency).max(input_ticks as u64),
            ticks: BTreeMap::new(),
            recorded: 0,
            completed: false,
        }
    }

    /// Packets recorded so far.
    pub const fn recorded(&self) -> usize {
        self.recorded
    }

    /// Stop recording; later packets are ignored.
    pub fn finish(&mut self) {
        self.completed = true;
    }

    /// Expected-output schedule: one count per tick from `tick_latency + 1`
    /// to the last tick with output, packets sorted within each tick.
    ///
    /// # Errors
    ///
    /// [`DriverError::Model`] if the schedule cannot be assembled.
    pub fn into_schedule(self) -> Result<PacketSchedule<u32>> {
        let Some(&last) = self.ticks.keys().next_back() else {
            return Ok(PacketSchedule::default());
        };
        let mut packets = Vec::with_capacity(self.recorded);
        let mut counts = Vec::new();
        for tick in self.tick_latency + 1..=last {
            let mut these = self.ticks.get(&tick).cloned().unwrap_or_default();
            these.sort_unstable();
            counts.push(these.len());
            packets.extend(these);
        }
        Ok(PacketSchedule::new(packets, counts)?)
    }
}

impl OutputHandler for OutputRecorder {
    fn accept(&mut self, tick: u32, packet: u32) -> Result<()> {
        if tick <= self.tick_latency || self.completed {
            return Ok(());
        }
        debug!("tick {tick}: recorded packet {packet:#b}");
        self.ticks.entry(tick).or_default().push(packet);
        self.last_active = self.last_active.max(u64::from(tick));
        self.recorded += 1;
        Ok(())
    }

    fn tick_sent(&mut self, ticks_sent: u64) {
        if self.completed {
            return;
        }
        let cut_off = self
            .check_ticks
            .is_some_and(|limit| ticks_sent >= u64::from(limit));
        if cut_off || self.last_active + QUIET_TICKS < ticks_sent {
            info!("recorded {} output packets after {ticks_sent} ticks", self.recorded);
            self.completed = true;
        }
    }

    fn completed(&self) -> bool {
        self.completed
    }

    fn accepted(&self) -> usize {
        self.recorded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(tick_latency: u32, relaxed: bool) -> ScenarioParams {
        ScenarioParams {
            tick_latency,
            num_ticks_to_check: None,
            relax_packet_ordering: relaxed,
        }
    }

    fn schedule(packets: Vec<u32>, counts: Vec<usize>) -> PacketSchedule<u32> {
        PacketSchedule::new(packets, counts).unwrap()
    }

    #[test]
    fn test_strict_order() {
        let outputs = schedule(vec![1, 2, 3], vec![2, 0, 1]);
        let mut v = OutputValidator::new(&outputs, &params(1, false));
        v.check(1, 9).unwrap(); // inside the latency window
        v.check(2, 1).unwrap();
        v.check(2, 2).unwrap();
        assert!(!v.completed());
        v.check(4, 3).unwrap();
        assert!(v.completed());
        assert_eq!(v.checked(), 3);

        let mut v = OutputValidator::new(&outputs, &params(1, false));
        assert!(matches!(
            v.check(2, 2),
            Err(DriverError::OutputMismatch { tick: 2, packet: 2, .. })
        ));
    }

    #[test]
    fn test_relaxed_order() {
        let outputs = schedule(vec![1, 2], vec![2]);
        let mut v = OutputValidator::new(&outputs, &params(0, true));
        v.check(1, 2).unwrap();
        v.check(1, 1).unwrap();
        assert!(v.completed());

        let mut v = OutputValidator::new(&outputs, &params(0, true));
        assert!(v.check(1, 3).is_err());
    }

    #[test]
    fn test_missing_and_early_packets() {
        let outputs = schedule(vec![1, 2], vec![1, 0, 1]);
        let mut v = OutputValidator::new(&outputs, &params(0, false));
        // tick 1 still owes a packet
        assert!(v.check(2, 2).is_err());

        let mut v = OutputValidator::new(&outputs, &params(0, false));
        v.check(1, 1).unwrap();
        // nothing is expected on tick 2
        assert!(v.check(2, 2).is_err());
    }

    #[test]
    fn test_check_ticks_cut_off() {
        let outputs = schedule(vec![1, 2], vec![1, 1]);
        let mut p = params(0, false);
        p.num_ticks_to_check = Some(3);
        let mut v = OutputValidator::new(&outputs, &p);
        v.accept(1, 1).unwrap();
        v.tick_sent(2);
        assert!(!OutputHandler::completed(&v));
        v.tick_sent(3);
        assert!(OutputHandler::completed(&v));
        assert_eq!(v.accepted(), 1);
    }

    #[test]
    fn test_recorder_builds_sorted_schedule() {
        let mut r = OutputRecorder::new(&params(1, false), 0);
        r.accept(1, 7).unwrap(); // inside the latency window
        r.accept(2, 9).unwrap();
        r.accept(2, 4).unwrap();
        r.accept(4, 3).unwrap();
        assert_eq!(r.recorded(), 3);
        let s = r.into_schedule().unwrap();
        assert_eq!(s.packets(), &[4, 9, 3]);
        assert_eq!(s.counts(), &[2, 0, 1]);

        // the recording checks clean against its own schedule
        let mut v = OutputValidator::new(&s, &params(1, false));
        for (tick, packet) in [(2, 4), (2, 9), (4, 3)] {
            v.check(tick, packet).unwrap();
        }
        assert!(v.completed());
    }

    #[test]
    fn test_recorder_stops_when_quiet() {
        let mut r = OutputRecorder::new(&params(1, false), 2);
        r.tick_sent(5);
        assert!(!r.completed());
        r.accept(5, 1).unwrap();
        r.tick_sent(8);
        assert!(!r.completed());
        r.tick_sent(9);
        assert!(r.completed());
        r.accept(9, 2).unwrap();
        assert_eq!(r.recorded(), 1);

        let r = OutputRecorder::new(&params(0, false), 0);
        assert!(r.into_schedule().unwrap().is_empty());
    }

    #[test]
    fn test_nothing_expected() {
        let v = OutputValidator::new(&PacketSchedule::default(), &params(0, false));
        assert!(v.completed());
        let mut v = OutputValidator::new(&schedule(vec![1], vec![1]), &params(0, false));
        v.finish();
        v.check(1, 7).unwrap();
        assert_eq!(v.checked(), 0);
    }
}
