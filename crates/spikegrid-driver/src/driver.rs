// SPDX-License-Identifier: AGPL-3.0-only

//! Scenario driver
//!
//! Runs one or more scenarios against a [`SimulationOracle`]:
//!
//! ```text
//! initialise ─► RESET ─► CORE_DATA × cores ─┐
//!                                           ▼
//!        ┌── IN_PACKETS (tick 0) ◄── inputs remain?
//!        │   TICK, IN_PACKETS (tick n)      │ no
//!        │   service OUT_PACKETS ──► validator
//!        └──────────────► TICK until every expected output is checked
//!                                           ▼
//!                          TERMINATE ─► wait for acc_done + device TERMINATE
//! ```
//!
//! Before every header read the driver services any device write that is
//! already pending, so outputs are checked as soon as the device emits them.
//! [`ScenarioDriver::record`] runs the same flow but captures the outputs
//! instead of checking them.

use crate::error::{DriverError, Result};
use crate::frames::{FrameManager, WRITE_BASE_BYTES};
use crate::oracle::{DeviceSignal, SimulationOracle};
use crate::validation::{OutputHandler, OutputRecorder, OutputValidator};
use spikegrid_chip::{ArchitectureParams, ResetFlags};
use spikegrid_models::scenario::{Scenario, ScenarioParams};
use spikegrid_models::{GridModel, PacketSchedule};
use std::borrow::Cow;
use tracing::{debug, info};

/// Cycles the device is given to settle after a reset pulse between scenarios.
pub const RESET_SETTLE_CYCLES: u64 = 10_000;

/// Outcome of one successful scenario run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScenarioReport {
    /// Output packets matched against the expected schedule, or recorded.
    pub packets_checked: usize,
    /// TICK frames sent.
    pub ticks_sent: u64,
    /// Cores uploaded with CORE_DATA.
    pub cores_uploaded: usize,
    /// Clock edges the run took.
    pub steps: u64,
}

/// Host-side driver for one device session.
#[derive(Debug)]
pub struct ScenarioDriver<O> {
    frames: FrameManager<O>,
    arch: ArchitectureParams,
}

impl<O: SimulationOracle> ScenarioDriver<O> {
    /// Driver for a device built with `arch`.
    ///
    /// # Errors
    ///
    /// [`DriverError::Chip`] if `arch` is inconsistent.
    pub fn new(oracle: O, arch: ArchitectureParams) -> Result<Self> {
        arch.validate()?;
        Ok(Self {
            frames: FrameManager::new(oracle, arch)?,
            arch,
        })
    }

    /// Driver whose architecture covers every scenario in `scenarios`.
    ///
    /// # Errors
    ///
    /// [`DriverError::Chip`] if the scenarios disagree on a field that must
    /// be equal.
    pub fn for_scenarios(oracle: O, scenarios: &[Scenario]) -> Result<Self> {
        let archs: Vec<ArchitectureParams> = scenarios.iter().map(|s| *s.model.arch()).collect();
        let arch = ArchitectureParams::covering(&archs)?;
        Self::new(oracle, arch)
    }

    /// Device architecture.
    pub const fn arch(&self) -> &ArchitectureParams {
        &self.arch
    }

    /// Frame layer.
    pub fn frames(&self) -> &FrameManager<O> {
        &self.frames
    }

    /// Unwrap the oracle.
    pub fn into_oracle(self) -> O {
        self.frames.into_oracle()
    }

    /// Bring the device out of reset and start its DMA engine.
    ///
    /// # Errors
    ///
    /// Any handshake error.
    pub fn initialise(&mut self) -> Result<()> {
        info!("initialising device");
        self.frames.rewind();
        self.frames
            .link_mut()
            .initialise(WRITE_BASE_BYTES, WRITE_BASE_BYTES)
    }

    /// Pulse reset and start a fresh session with rewound cursors.
    ///
    /// # Errors
    ///
    /// Any handshake error.
    pub fn restart(&mut self) -> Result<()> {
        debug!("restarting device session");
        self.frames.link_mut().pulse_reset(RESET_SETTLE_CYCLES)?;
        self.frames.rewind();
        self.frames
            .link_mut()
            .configure(WRITE_BASE_BYTES, WRITE_BASE_BYTES)
    }

    /// Initialise, then run every scenario in order, restarting the device
    /// between them.
    ///
    /// # Errors
    ///
    /// The first scenario failure; later scenarios are not run.
    pub fn run_all(&mut self, scenarios: &[Scenario]) -> Result<Vec<ScenarioReport>> {
        self.initialise()?;
        let mut reports = Vec::with_capacity(scenarios.len());
        for (idx, scenario) in scenarios.iter().enumerate() {
            if idx > 0 {
                self.restart()?;
            }
            info!("scenario {}/{}", idx + 1, scenarios.len());
            reports.push(self.run(&scenario.model, &scenario.params)?);
        }
        Ok(reports)
    }

    /// Run one scenario on an initialised device.
    ///
    /// A model encoded for a smaller architecture is retargeted first.
    ///
    /// # Errors
    ///
    /// [`DriverError::Chip`] if the device architecture does not cover the
    /// model, [`DriverError::OutputMismatch`] on a wrong output packet,
    /// [`DriverError::NoOutputObserved`] if nothing was checked, or any
    /// protocol error.
    pub fn run(&mut self, model: &GridModel, params: &ScenarioParams) -> Result<ScenarioReport> {
        let model = self.fit(model)?;
        let mut validator = OutputValidator::new(model.outputs(), params);
        self.drive(&model, params, &mut validator)
    }

    /// Run one scenario on an initialised device and capture its outputs as
    /// an expected-output schedule. The model's own expected outputs are
    /// ignored.
    ///
    /// # Errors
    ///
    /// [`DriverError::Chip`] if the device architecture does not cover the
    /// model, [`DriverError::NoOutputObserved`] if the device produced no
    /// output, or any protocol error.
    pub fn record(
        &mut self,
        model: &GridModel,
        params: &ScenarioParams,
    ) -> Result<(PacketSchedule<u32>, ScenarioReport)> {
        let model = self.fit(model)?;
        let mut recorder = OutputRecorder::new(params, model.inputs().tick_count());
        let report = self.drive(&model, params, &mut recorder)?;
        Ok((recorder.into_schedule()?, report))
    }

    fn fit<'m>(&self, model: &'m GridModel) -> Result<Cow<'m, GridModel>> {
        self.arch.check_covers(model.arch())?;
        Ok(if *model.arch() == self.arch {
            Cow::Borrowed(model)
        } else {
            Cow::Owned(model.retarget(&self.arch)?)
        })
    }

    fn drive<H: OutputHandler>(
        &mut self,
        model: &GridModel,
        params: &ScenarioParams,
        handler: &mut H,
    ) -> Result<ScenarioReport> {
        let start = self.frames.link().steps();
        let cores_uploaded = self.upload(model, handler)?;
        let tick_limit = u64::from(params.tick_latency)
            + model.outputs().tick_count() as u64
            + model.inputs().tick_count() as u64
            + u64::from(self.arch.num_ticks)
            + 2;

        let mut ticks_sent = 0u64;
        let mut inputs = model.inputs().ticks().enumerate();
        while !handler.completed() {
            if let Some((tick, packets)) = inputs.next() {
                if tick > 0 {
                    self.send_tick(handler, &mut ticks_sent)?;
                }
                let words = packets
                    .iter()
                    .map(|p| p.encode(&self.arch))
                    .collect::<spikegrid_models::Result<Vec<u64>>>()?;
                self.await_read(handler)?;
                self.frames.in_packets_header(words.len())?;
                if !words.is_empty() {
                    self.await_read(handler)?;
                    self.frames.in_packets_payload(&words)?;
                }
                debug!("tick {tick}: {} input packets sent", words.len());
            } else {
                if ticks_sent >= tick_limit {
                    return Err(DriverError::timeout(
                        format!("outputs within {tick_limit} ticks"),
                        self.frames.link().steps() - start,
                    ));
                }
                self.send_tick(handler, &mut ticks_sent)?;
            }
        }

        if handler.accepted() == 0 {
            return Err(DriverError::NoOutputObserved);
        }
        info!(
            "{} output packets taken after {ticks_sent} ticks",
            handler.accepted()
        );
        self.finish(handler)?;

        Ok(ScenarioReport {
            packets_checked: handler.accepted(),
            ticks_sent,
            cores_uploaded,
            steps: self.frames.link().steps() - start,
        })
    }

    fn upload<H: OutputHandler>(&mut self, model: &GridModel, handler: &mut H) -> Result<usize> {
        self.await_read(handler)?;
        self.frames.reset(ResetFlags::ALL)?;
        let mut uploaded = 0;
        for core in model.cores() {
            let (x, y) = core.position();
            if self.arch.is_output_core(x, y) {
                continue;
            }
            let words = core.to_words(&self.arch)?;
            self.await_read(handler)?;
            self.frames.core_data_header(self.arch.core_index(x, y))?;
            self.await_read(handler)?;
            self.frames.core_data_payload(&words)?;
            debug!("core ({x}, {y}) uploaded");
            uploaded += 1;
        }
        info!("{uploaded} cores uploaded");
        Ok(uploaded)
    }

    fn send_tick<H: OutputHandler>(&mut self, handler: &mut H, ticks_sent: &mut u64) -> Result<()> {
        self.await_read(handler)?;
        self.frames.tick(1, None)?;
        *ticks_sent += 1;
        handler.tick_sent(*ticks_sent);
        Ok(())
    }

    fn receive<H: OutputHandler>(&mut self, handler: &mut H) -> Result<()> {
        self.frames
            .out_frame(&mut |tick, packet| handler.accept(tick, packet))?;
        Ok(())
    }

    /// Step until the device requests a read, servicing its writes meanwhile.
    fn await_read<H: OutputHandler>(&mut self, handler: &mut H) -> Result<()> {
        let timeout = self.frames.link().timeout();
        let mut waited = 0;
        loop {
            if self.frames.link().is_high(DeviceSignal::ReadCtrlValid) {
                return Ok(());
            }
            if self.frames.link().is_high(DeviceSignal::WriteCtrlValid) {
                self.receive(handler)?;
                waited = 0;
                continue;
            }
            if waited >= timeout {
                return Err(DriverError::timeout("device read request", waited));
            }
            self.frames.link_mut().step()?;
            waited += 1;
        }
    }

    /// Send TERMINATE, then wait until `acc_done` has been seen and the
    /// device's own TERMINATE frame has arrived, in either order.
    fn finish<H: OutputHandler>(&mut self, handler: &mut H) -> Result<()> {
        self.await_read(handler)?;
        self.frames.terminate()?;
        let timeout = self.frames.link().timeout();
        let mut waited = 0;
        let mut done = false;
        loop {
            done |= self.frames.link().is_high(DeviceSignal::AccDone);
            if done && self.frames.device_terminated() {
                break;
            }
            if waited >= timeout {
                return Err(DriverError::timeout("device termination", waited));
            }
            if self.frames.link().is_high(DeviceSignal::WriteCtrlValid) {
                self.receive(handler)?;
            } else {
                self.frames.link_mut().step()?;
            }
            waited += 1;
        }
        debug!("device terminated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    //! Full runs against the software device. The relay core at (1, 0)
    //! turns an input spike on axon 3 into output axon 5 two ticks later:
    //! the packet is sent during tick 0 and lands on tick 1, the spike
    //! reaches the output core on tick 4, behind a latency of 3.

    use super::*;
    use crate::oracle::HostSignal;
    use crate::software::SoftwareDevice;
    use spikegrid_chip::ArchField;
    use spikegrid_models::scenario::{load_scenario, write_scenario};
    use spikegrid_models::{CoreRecord, Destination, NeuronRecord, Packet};

    fn arch() -> ArchitectureParams {
        ArchitectureParams::REFERENCE
            .with_field(ArchField::ClockCyclesPerTick, 64)
            .unwrap()
    }

    fn relay_neuron(arch: &ArchitectureParams, output: u32) -> NeuronRecord {
        let mut n = NeuronRecord::unused(arch);
        n.axons.set(3, true);
        n.weights = vec![1, 0, 0, 0];
        n.destination = Destination {
            dx: -1,
            dy: 0,
            axon: output,
            tick: 2,
        };
        n
    }

    fn relay(arch: ArchitectureParams, outputs: &[u32], expected: Vec<u32>, counts: Vec<usize>) -> GridModel {
        let mut core = CoreRecord::empty(1, 0, &arch);
        for (i, output) in outputs.iter().enumerate() {
            core.set_neuron(i, relay_neuron(&arch, *output)).unwrap();
        }
        let inputs = PacketSchedule::new(
            vec![Packet {
                tick: 1,
                axon: 3,
                dx: 1,
                dy: 0,
            }],
            vec![1],
        )
        .unwrap();
        let outputs = PacketSchedule::new(expected, counts).unwrap();
        GridModel::new(arch, vec![core], inputs, outputs).unwrap()
    }

    fn params(relaxed: bool) -> ScenarioParams {
        ScenarioParams {
            tick_latency: 3,
            num_ticks_to_check: None,
            relax_packet_ordering: relaxed,
        }
    }

    fn driver(arch: ArchitectureParams) -> ScenarioDriver<SoftwareDevice> {
        let mut driver = ScenarioDriver::new(SoftwareDevice::new(arch).unwrap(), arch).unwrap();
        driver.initialise().unwrap();
        driver
    }

    /// Validator that logs its completion flag around every packet.
    struct Watched {
        inner: OutputValidator,
        log: Vec<(u32, u32, bool, bool)>,
    }

    impl OutputHandler for Watched {
        fn accept(&mut self, tick: u32, packet: u32) -> Result<()> {
            let before = self.inner.completed();
            self.inner.check(tick, packet)?;
            self.log.push((tick, packet, before, self.inner.completed()));
            Ok(())
        }

        fn tick_sent(&mut self, ticks_sent: u64) {
            self.inner.tick_sent(ticks_sent);
        }

        fn completed(&self) -> bool {
            self.inner.completed()
        }

        fn accepted(&self) -> usize {
            self.inner.checked()
        }
    }

    /// Raises acc_done only while a device write request is pending, so it
    /// is gone again once that frame has been serviced.
    struct BriefDone<O>(O);

    impl<O: SimulationOracle> SimulationOracle for BriefDone<O> {
        fn drive(&mut self, signal: HostSignal, value: u128) {
            self.0.drive(signal, value);
        }

        fn sample(&self, signal: DeviceSignal) -> u128 {
            match signal {
                DeviceSignal::AccDone => self.0.sample(DeviceSignal::WriteCtrlValid),
                other => self.0.sample(other),
            }
        }

        fn step(&mut self) -> Result<()> {
            self.0.step()
        }
    }

    #[test]
    fn test_relay_output_is_checked() {
        let arch = arch();
        let model = relay(arch, &[5], vec![5], vec![1]);
        let mut driver = driver(arch);
        let report = driver.run(&model, &params(false)).unwrap();

        assert_eq!(report.packets_checked, 1);
        assert_eq!(report.cores_uploaded, 1);
        // the output is collected just before the sixth TICK
        assert_eq!(report.ticks_sent, 6);
        assert!(report.steps > 0);
        assert!(driver.frames().device_terminated());

        let device = driver.into_oracle();
        assert_eq!(device.core(1, 0), model.core(1, 0));
        assert_eq!(device.outputs_written(), 1);
    }

    #[test]
    fn test_two_core_grid_completes_on_its_packet() {
        let arch = arch()
            .with_field(ArchField::GridDimensionX, 2)
            .and_then(|a| a.with_field(ArchField::GridDimensionY, 1))
            .unwrap();
        assert!(arch.is_output_core(0, 0));
        let model = relay(arch, &[5], vec![5], vec![1]);
        let mut driver = driver(arch);
        let mut watched = Watched {
            inner: OutputValidator::new(model.outputs(), &params(false)),
            log: Vec::new(),
        };
        let report = driver.drive(&model, &params(false), &mut watched).unwrap();

        assert_eq!(watched.log, vec![(4, 5, false, true)]);
        assert_eq!(report.packets_checked, 1);
        assert_eq!(report.cores_uploaded, 1);
        assert_eq!(driver.into_oracle().core(1, 0), model.core(1, 0));
    }

    #[test]
    fn test_relay_on_wide_bus() {
        let arch = arch()
            .with_field(ArchField::DmaBusWidth, 64)
            .and_then(|a| a.with_field(ArchField::DmaFrameHeaderWordWidth, 64))
            .unwrap();
        let model = relay(arch, &[5, 9], vec![5, 9], vec![2]);
        let report = driver(arch).run(&model, &params(false)).unwrap();
        assert_eq!(report.packets_checked, 2);
    }

    #[test]
    fn test_wrong_output_is_reported() {
        let arch = arch();
        let model = relay(arch, &[5], vec![6], vec![1]);
        let err = driver(arch).run(&model, &params(false)).unwrap_err();
        assert!(matches!(
            err,
            DriverError::OutputMismatch {
                tick: 4,
                packet: 5,
                ..
            }
        ));
    }

    #[test]
    fn test_relaxed_ordering_accepts_permutation() {
        let arch = arch();
        let model = relay(arch, &[5, 6], vec![6, 5], vec![2]);
        let report = driver(arch).run(&model, &params(true)).unwrap();
        assert_eq!(report.packets_checked, 2);

        let err = driver(arch).run(&model, &params(false)).unwrap_err();
        assert!(matches!(err, DriverError::OutputMismatch { packet: 5, .. }));
    }

    #[test]
    fn test_missing_output_times_out() {
        let arch = arch();
        // the second expected packet never arrives
        let model = relay(arch, &[5], vec![5, 9], vec![1, 1]);
        let err = driver(arch).run(&model, &params(false)).unwrap_err();
        assert!(matches!(err, DriverError::ProtocolTimeout { .. }));

        let cut_off = ScenarioParams {
            num_ticks_to_check: Some(6),
            ..params(false)
        };
        let report = driver(arch).run(&model, &cut_off).unwrap();
        assert_eq!(report.packets_checked, 1);
        assert_eq!(report.ticks_sent, 6);
    }

    #[test]
    fn test_no_output_observed() {
        let arch = arch();
        let model = relay(arch, &[5], vec![5], vec![1]);
        let cut_off = ScenarioParams {
            num_ticks_to_check: Some(2),
            ..params(false)
        };
        let err = driver(arch).run(&model, &cut_off).unwrap_err();
        assert!(matches!(err, DriverError::NoOutputObserved));
    }

    #[test]
    fn test_brief_acc_done_is_latched() {
        let arch = arch();
        let model = relay(arch, &[5], vec![5], vec![1]);
        let device = BriefDone(SoftwareDevice::new(arch).unwrap());
        let mut driver = ScenarioDriver::new(device, arch).unwrap();
        driver.initialise().unwrap();
        let report = driver.run(&model, &params(false)).unwrap();
        assert_eq!(report.packets_checked, 1);
        assert!(driver.frames().device_terminated());
    }

    #[test]
    fn test_record_captures_expected_outputs() {
        let arch = arch();
        let unchecked = relay(arch, &[9, 5], Vec::new(), Vec::new());
        let (outputs, report) = driver(arch).record(&unchecked, &params(false)).unwrap();
        assert_eq!(outputs.packets(), &[5, 9]);
        assert_eq!(outputs.counts(), &[2]);
        assert_eq!(report.packets_checked, 2);
        // three quiet ticks after the output on tick 4
        assert_eq!(report.ticks_sent, 8);

        // the recording replays as a strict check
        let checked = relay(arch, &[9, 5], outputs.packets().to_vec(), outputs.counts().to_vec());
        let err = driver(arch).run(&checked, &params(false)).unwrap_err();
        assert!(matches!(err, DriverError::OutputMismatch { packet: 9, .. }));
        let report = driver(arch).run(&checked, &params(true)).unwrap();
        assert_eq!(report.packets_checked, 2);
    }

    #[test]
    fn test_record_without_output_fails() {
        let arch = arch();
        let relay = relay(arch, &[5], Vec::new(), Vec::new());
        let silent = GridModel::new(
            arch,
            relay.cores().to_vec(),
            PacketSchedule::default(),
            PacketSchedule::default(),
        )
        .unwrap();
        let err = driver(arch).record(&silent, &params(false)).unwrap_err();
        assert!(matches!(err, DriverError::NoOutputObserved));
    }

    #[test]
    fn test_scenarios_from_disk_share_a_session() {
        let arch = arch();
        let dir = tempfile::tempdir().unwrap();
        let first = Scenario {
            params: params(false),
            model: relay(arch, &[5], vec![5], vec![1]),
        };
        // smaller grid, retargeted onto the covering architecture
        let small = arch.with_field(ArchField::GridDimensionY, 1).unwrap();
        let second = Scenario {
            params: params(true),
            model: relay(small, &[5, 7], vec![7, 5], vec![2]),
        };
        write_scenario(&dir.path().join("first"), &first).unwrap();
        write_scenario(&dir.path().join("second"), &second).unwrap();

        let scenarios = vec![
            load_scenario(&dir.path().join("first"), None).unwrap(),
            load_scenario(&dir.path().join("second"), None).unwrap(),
        ];
        let device = SoftwareDevice::new(arch).unwrap();
        let mut driver = ScenarioDriver::for_scenarios(device, &scenarios).unwrap();
        assert_eq!(*driver.arch(), arch);

        let reports = driver.run_all(&scenarios).unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].packets_checked, 1);
        assert_eq!(reports[1].packets_checked, 2);
        assert_eq!(reports[1].cores_uploaded, 1);
    }
}
