// SPDX-License-Identifier: AGPL-3.0-only

//! Software device behind the [`SimulationOracle`] interface
//!
//! A single DMA engine that reads frames from the host stream, evaluates a
//! deliberately simple integrate-and-fire network, and writes OUT_PACKETS
//! and TERMINATE frames back, using the same handshakes as the hardware.
//! It exists so the whole runtime protocol can be exercised without an HDL
//! simulator. It is not a model of device timing, and it is only built for
//! tests or with the `software-device` feature.
//!
//! ## Network model
//!
//! ```text
//! potential += sum(weights[selector[axon]] for each spiking axon) + leak
//! potential >= positive_threshold  =>  fire, potential = reset_potential
//! spike fired on tick t arrives on tick t + 1 + destination.tick
//! host packet sent during tick t arrives on tick t + packet.tick
//! ```
//!
//! Spikes reaching the output coordinate are written back as one OUT_PACKETS
//! frame per tick. A TICK frame's delay stalls the next header read by that
//! many cycles.

use crate::beats::{pack_words, unpack_beats};
use crate::error::Result;
use crate::oracle::{DeviceSignal, HostSignal, SimulationOracle};
use spikegrid_chip::bitfield::PAYLOAD_WORD_WIDTH;
use spikegrid_chip::frame::{dma_word_size_code, payload_beats};
use spikegrid_chip::{ArchitectureParams, FrameHeader, ResetFlags};
use spikegrid_models::{CoreRecord, Packet};
use std::collections::{BTreeMap, VecDeque};
use std::fmt::Display;
use tracing::{debug, info, trace, warn};

/// Debug code: a header failed to decode or had an unexpected tag.
pub const FAULT_BAD_FRAME: u128 = 1;
/// Debug code: a CORE_DATA frame addressed no core or failed to decode.
pub const FAULT_BAD_CORE: u128 = 2;
/// Debug code: an input packet failed to decode.
pub const FAULT_BAD_PACKET: u128 = 3;

#[derive(Debug, Clone, Copy)]
struct HostWires {
    reset_n: u128,
    conf_done: u128,
    tx_size: u128,
    read_ctrl_ready: u128,
    read_chnl_valid: u128,
    read_chnl_data: u128,
    write_ctrl_ready: u128,
    write_chnl_ready: u128,
}

#[derive(Debug, Clone, Copy, Default)]
struct DeviceWires {
    read_ctrl_valid: bool,
    read_ctrl_index: u64,
    read_ctrl_length: u64,
    read_ctrl_size: u32,
    read_chnl_ready: bool,
    write_ctrl_valid: bool,
    write_ctrl_index: u64,
    write_ctrl_length: u64,
    write_ctrl_size: u32,
    write_chnl_valid: bool,
    write_chnl_data: u128,
    acc_done: bool,
    debug: u128,
}

#[derive(Debug, Clone, Copy)]
enum ReadKind {
    Header,
    InPackets { count: usize, end: u64 },
    CoreData { core_index: u32, end: u64 },
}

#[derive(Debug)]
enum Engine {
    Idle,
    ReadRequest {
        kind: ReadKind,
        word_width: u32,
        length: u64,
    },
    Reading {
        kind: ReadKind,
        word_width: u32,
        remaining: u64,
        beats: Vec<u128>,
    },
    WriteRequest(VecDeque<u128>),
    Writing(VecDeque<u128>),
    Waiting(u64),
    Done,
}

#[derive(Debug)]
struct PendingWrite {
    index: u64,
    word_width: u32,
    words: Vec<u64>,
}

#[derive(Debug)]
struct SimCore {
    record: CoreRecord,
    potentials: Vec<i64>,
}

impl SimCore {
    fn new(record: CoreRecord) -> Self {
        let potentials = record.neurons().iter().map(|n| n.current_potential).collect();
        Self { record, potentials }
    }

    fn reload(&mut self) {
        for (v, n) in self.potentials.iter_mut().zip(self.record.neurons()) {
            *v = n.current_potential;
        }
    }
}

/// Cycle-stepped software device.
#[derive(Debug)]
pub struct SoftwareDevice {
    arch: ArchitectureParams,
    header_beats: u64,
    host: HostWires,
    wires: DeviceWires,
    seen: DeviceWires,
    engine: Engine,
    read_offset: u64,
    write_offset: u64,
    pending: VecDeque<PendingWrite>,
    stall: u64,
    noop_backoff: u64,
    terminated: bool,
    cores: BTreeMap<(u32, u32), SimCore>,
    events: BTreeMap<u64, Vec<(i64, i64, u32)>>,
    tick: u64,
    outputs_written: usize,
}

impl SoftwareDevice {
    /// Device built for `arch`.
    ///
    /// # Errors
    ///
    /// [`crate::DriverError::Chip`] if `arch` is inconsistent.
    pub fn new(arch: ArchitectureParams) -> Result<Self> {
        arch.validate()?;
        Ok(Self {
            arch,
            header_beats: u64::from(arch.header_beats()?),
            host: HostWires {
                reset_n: 1,
                conf_done: 0,
                tx_size: 0,
                read_ctrl_ready: 0,
                read_chnl_valid: 0,
                read_chnl_data: 0,
                write_ctrl_ready: 0,
                write_chnl_ready: 0,
            },
            wires: DeviceWires::default(),
            seen: DeviceWires::default(),
            engine: Engine::Idle,
            read_offset: 0,
            write_offset: 0,
            pending: VecDeque::new(),
            stall: 0,
            noop_backoff: 0,
            terminated: false,
            cores: BTreeMap::new(),
            events: BTreeMap::new(),
            tick: 0,
            outputs_written: 0,
        })
    }

    /// Current tick index.
    pub const fn tick(&self) -> u64 {
        self.tick
    }

    /// Loaded core at `(x, y)`.
    pub fn core(&self, x: u32, y: u32) -> Option<&CoreRecord> {
        self.cores.get(&(y, x)).map(|c| &c.record)
    }

    /// Number of loaded cores.
    pub fn core_count(&self) -> usize {
        self.cores.len()
    }

    /// Output packets written to the host so far.
    pub const fn outputs_written(&self) -> usize {
        self.outputs_written
    }

    fn bus_bytes(&self) -> u64 {
        u64::from(self.arch.dma_bus_width / 8)
    }

    fn power_on_reset(&mut self) {
        self.wires = DeviceWires::default();
        self.engine = Engine::Idle;
        self.pending.clear();
        self.stall = 0;
        self.noop_backoff = 0;
        self.terminated = false;
        self.cores.clear();
        self.events.clear();
        self.tick = 0;
    }

    fn start(&mut self) {
        let base = u64::try_from(self.host.tx_size).unwrap_or(u64::MAX);
        self.read_offset = 0;
        self.write_offset = base / self.bus_bytes();
        self.terminated = false;
        self.wires.acc_done = false;
        debug!(
            "software device configured, write stream at beat {}",
            self.write_offset
        );
        self.engine = self.header_request();
    }

    fn fault(&mut self, code: u128, reason: &dyn Display) -> Engine {
        warn!("software device fault {code}: {reason}");
        self.wires.debug = code;
        self.wires.read_ctrl_valid = false;
        self.wires.read_chnl_ready = false;
        self.wires.write_ctrl_valid = false;
        self.wires.write_chnl_valid = false;
        Engine::Idle
    }

    fn read_request(&mut self, index: u64, length: u64, word_width: u32, kind: ReadKind) -> Engine {
        let size = match dma_word_size_code(word_width) {
            Ok(size) => size,
            Err(e) => return self.fault(FAULT_BAD_FRAME, &e),
        };
        self.wires.read_ctrl_valid = true;
        self.wires.read_ctrl_index = index;
        self.wires.read_ctrl_length = length;
        self.wires.read_ctrl_size = size;
        Engine::ReadRequest {
            kind,
            word_width,
            length,
        }
    }

    fn header_request(&mut self) -> Engine {
        self.read_request(
            self.read_offset,
            self.header_beats,
            self.arch.dma_frame_header_word_width,
            ReadKind::Header,
        )
    }

    fn queue_write(&mut self, words: Vec<u64>, word_width: u32) {
        let beats = payload_beats(words.len(), word_width, self.arch.dma_bus_width);
        self.pending.push_back(PendingWrite {
            index: self.write_offset,
            word_width,
            words,
        });
        self.write_offset += beats;
    }

    fn next_transfer(&mut self) -> Engine {
        if let Some(write) = self.pending.pop_front() {
            let size = match dma_word_size_code(write.word_width) {
                Ok(size) => size,
                Err(e) => return self.fault(FAULT_BAD_FRAME, &e),
            };
            let beats: VecDeque<u128> =
                pack_words(&write.words, write.word_width, self.arch.dma_bus_width).into();
            self.wires.write_ctrl_valid = true;
            self.wires.write_ctrl_index = write.index;
            self.wires.write_ctrl_length = beats.len() as u64;
            self.wires.write_ctrl_size = size;
            return Engine::WriteRequest(beats);
        }
        if self.terminated {
            info!("software device done at tick {}", self.tick);
            self.wires.acc_done = true;
            return Engine::Done;
        }
        if self.stall > 0 {
            return Engine::Waiting(std::mem::take(&mut self.stall));
        }
        self.header_request()
    }

    fn on_header(&mut self, words: &[u64]) -> Engine {
        let header_width = self.arch.dma_frame_header_word_width;
        let header = match FrameHeader::from_words(words, header_width) {
            Ok(header) => header,
            Err(e) => return self.fault(FAULT_BAD_FRAME, &e),
        };
        trace!("software device read {:?}", header);
        if header != FrameHeader::Noop {
            self.read_offset += self.header_beats;
        }
        match header {
            FrameHeader::Noop => {
                self.stall = self.noop_backoff;
                self.next_transfer()
            }
            FrameHeader::NoopConf { amount } => {
                self.noop_backoff = amount;
                self.next_transfer()
            }
            FrameHeader::Terminate => match FrameHeader::Terminate.to_words(header_width) {
                Ok(words) => {
                    self.queue_write(words, header_width);
                    self.terminated = true;
                    self.next_transfer()
                }
                Err(e) => self.fault(FAULT_BAD_FRAME, &e),
            },
            FrameHeader::InPackets {
                count,
                payload_address,
            } => {
                let width = match self.arch.packet_word_width() {
                    Ok(width) => width,
                    Err(e) => return self.fault(FAULT_BAD_FRAME, &e),
                };
                if count == 0 {
                    return self.next_transfer();
                }
                let count = count as usize;
                let index = payload_address / self.bus_bytes();
                let length = payload_beats(count, width, self.arch.dma_bus_width);
                self.read_request(
                    index,
                    length,
                    width,
                    ReadKind::InPackets {
                        count,
                        end: index + length,
                    },
                )
            }
            FrameHeader::Tick { amount, delay } => {
                for _ in 0..amount {
                    self.evaluate_tick();
                }
                self.stall = delay;
                self.next_transfer()
            }
            FrameHeader::CoreData {
                core_index,
                payload_address,
            } => {
                let index = payload_address / self.bus_bytes();
                let length = payload_beats(
                    self.arch.core_data_words(),
                    PAYLOAD_WORD_WIDTH,
                    self.arch.dma_bus_width,
                );
                self.read_request(
                    index,
                    length,
                    PAYLOAD_WORD_WIDTH,
                    ReadKind::CoreData {
                        core_index,
                        end: index + length,
                    },
                )
            }
            FrameHeader::Reset(flags) => {
                self.apply_reset(flags);
                self.next_transfer()
            }
            FrameHeader::OutPackets { .. } => {
                self.fault(FAULT_BAD_FRAME, &"OUT_PACKETS frame in the host stream")
            }
        }
    }

    fn on_payload(&mut self, kind: ReadKind, words: &[u64]) -> Engine {
        match kind {
            ReadKind::Header => self.on_header(words),
            ReadKind::InPackets { count, end } => {
                self.read_offset = end;
                for &bits in words.iter().take(count) {
                    match Packet::decode(bits, &self.arch) {
                        Ok(p) => {
                            let at = self.tick + u64::from(p.tick);
                            self.events.entry(at).or_default().push((p.dx, p.dy, p.axon));
                        }
                        Err(e) => return self.fault(FAULT_BAD_PACKET, &e),
                    }
                }
                trace!("software device queued {count} input packets");
                self.next_transfer()
            }
            ReadKind::CoreData { core_index, end } => {
                self.read_offset = end;
                let grid_x = self.arch.grid_dimension_x;
                let (x, y) = (core_index % grid_x, core_index / grid_x);
                if y >= self.arch.grid_dimension_y {
                    return self.fault(FAULT_BAD_CORE, &format!("core index {core_index}"));
                }
                match CoreRecord::from_words(words, &self.arch, x, y) {
                    Ok(record) => {
                        debug!("software device loaded core ({x}, {y})");
                        self.cores.insert((y, x), SimCore::new(record));
                        self.next_transfer()
                    }
                    Err(e) => self.fault(FAULT_BAD_CORE, &e),
                }
            }
        }
    }

    fn apply_reset(&mut self, flags: ResetFlags) {
        if flags.tick_index {
            self.tick = 0;
        }
        if flags.network {
            self.events.clear();
        }
        if flags.model {
            for core in self.cores.values_mut() {
                core.reload();
            }
        }
    }

    fn evaluate_tick(&mut self) {
        let t = self.tick;
        let output = (
            i64::from(self.arch.output_core_x),
            i64::from(self.arch.output_core_y),
        );
        let mut outputs = Vec::new();
        let mut hits: BTreeMap<(u32, u32), Vec<u32>> = BTreeMap::new();
        for (x, y, axon) in self.events.remove(&t).unwrap_or_default() {
            if (x, y) == output {
                outputs.push(axon);
                continue;
            }
            match (u32::try_from(y), u32::try_from(x)) {
                (Ok(y), Ok(x)) if self.cores.contains_key(&(y, x)) => {
                    hits.entry((y, x)).or_default().push(axon);
                }
                _ => trace!("tick {t}: spike for ({x}, {y}) dropped"),
            }
        }

        let mut fired = Vec::new();
        for (&(y, x), core) in &mut self.cores {
            let spikes = hits.get(&(y, x)).map_or(&[][..], Vec::as_slice);
            let selectors = core.record.axons();
            for (n, neuron) in core.record.neurons().iter().enumerate() {
                if neuron.is_unused() {
                    continue;
                }
                let input: i64 = spikes
                    .iter()
                    .filter(|a| neuron.axons.bit(**a as usize))
                    .map(|a| {
                        let selector = selectors.get(*a as usize).copied().unwrap_or(0);
                        neuron.weights.get(selector as usize).copied().unwrap_or(0)
                    })
                    .sum();
                let v = &mut core.potentials[n];
                *v += input + neuron.leak;
                if *v >= neuron.positive_threshold {
                    *v = neuron.reset_potential;
                    let d = neuron.destination;
                    fired.push((
                        t + 1 + u64::from(d.tick),
                        i64::from(x) + d.dx,
                        i64::from(y) + d.dy,
                        d.axon,
                    ));
                }
            }
        }
        for (at, x, y, axon) in fired {
            self.events.entry(at).or_default().push((x, y, axon));
        }
        if !outputs.is_empty() {
            self.queue_out_packets(t, outputs);
        }
        self.tick += 1;
    }

    #[allow(clippy::cast_possible_truncation)]
    fn queue_out_packets(&mut self, tick: u64, outputs: Vec<u32>) {
        let header_width = self.arch.dma_frame_header_word_width;
        let (Ok(width), Ok(count)) = (self.arch.output_word_width(), u16::try_from(outputs.len()))
        else {
            warn!("tick {tick}: {} output packets cannot be framed", outputs.len());
            return;
        };
        let header = FrameHeader::OutPackets {
            count,
            tick: (tick & 0xFFFF) as u16,
            payload_address: (self.write_offset + self.header_beats) * self.bus_bytes(),
        };
        match header.to_words(header_width) {
            Ok(words) => self.queue_write(words, header_width),
            Err(e) => {
                warn!("tick {tick}: {e}");
                return;
            }
        }
        debug!("tick {tick}: {count} output packets");
        self.outputs_written += outputs.len();
        self.queue_write(outputs.into_iter().map(u64::from).collect(), width);
    }
}

impl SimulationOracle for SoftwareDevice {
    fn drive(&mut self, signal: HostSignal, value: u128) {
        let wire = match signal {
            HostSignal::Reset => &mut self.host.reset_n,
            HostSignal::ConfDone => &mut self.host.conf_done,
            HostSignal::ConfTxSize => &mut self.host.tx_size,
            HostSignal::ConfRxSize => return,
            HostSignal::ReadCtrlReady => &mut self.host.read_ctrl_ready,
            HostSignal::ReadChnlValid => &mut self.host.read_chnl_valid,
            HostSignal::ReadChnlData => &mut self.host.read_chnl_data,
            HostSignal::WriteCtrlReady => &mut self.host.write_ctrl_ready,
            HostSignal::WriteChnlReady => &mut self.host.write_chnl_ready,
        };
        *wire = value;
    }

    fn sample(&self, signal: DeviceSignal) -> u128 {
        let w = &self.seen;
        match signal {
            DeviceSignal::ReadCtrlValid => u128::from(w.read_ctrl_valid),
            DeviceSignal::ReadCtrlIndex => u128::from(w.read_ctrl_index),
            DeviceSignal::ReadCtrlLength => u128::from(w.read_ctrl_length),
            DeviceSignal::ReadCtrlSize => u128::from(w.read_ctrl_size),
            DeviceSignal::ReadChnlReady => u128::from(w.read_chnl_ready),
            DeviceSignal::WriteCtrlValid => u128::from(w.write_ctrl_valid),
            DeviceSignal::WriteCtrlIndex => u128::from(w.write_ctrl_index),
            DeviceSignal::WriteCtrlLength => u128::from(w.write_ctrl_length),
            DeviceSignal::WriteCtrlSize => u128::from(w.write_ctrl_size),
            DeviceSignal::WriteChnlValid => u128::from(w.write_chnl_valid),
            DeviceSignal::WriteChnlData => w.write_chnl_data,
            DeviceSignal::AccDone => u128::from(w.acc_done),
            DeviceSignal::Debug => w.debug,
        }
    }

    fn step(&mut self) -> Result<()> {
        self.seen = self.wires;
        if self.host.reset_n == 0 {
            self.power_on_reset();
            return Ok(());
        }
        if self.host.conf_done != 0 {
            self.start();
            return Ok(());
        }

        let bus_mask = if self.arch.dma_bus_width >= 128 {
            u128::MAX
        } else {
            (1u128 << self.arch.dma_bus_width) - 1
        };
        self.engine = match std::mem::replace(&mut self.engine, Engine::Idle) {
            Engine::ReadRequest {
                kind,
                word_width,
                length,
            } if self.wires.read_ctrl_valid && self.host.read_ctrl_ready != 0 => {
                self.wires.read_ctrl_valid = false;
                self.wires.read_chnl_ready = true;
                Engine::Reading {
                    kind,
                    word_width,
                    remaining: length,
                    beats: Vec::new(),
                }
            }
            Engine::Reading {
                kind,
                word_width,
                remaining,
                mut beats,
            } if self.wires.read_chnl_ready && self.host.read_chnl_valid != 0 => {
                beats.push(self.host.read_chnl_data & bus_mask);
                if remaining > 1 {
                    Engine::Reading {
                        kind,
                        word_width,
                        remaining: remaining - 1,
                        beats,
                    }
                } else {
                    self.wires.read_chnl_ready = false;
                    let words = unpack_beats(&beats, word_width, self.arch.dma_bus_width);
                    self.on_payload(kind, &words)
                }
            }
            Engine::WriteRequest(beats)
                if self.wires.write_ctrl_valid && self.host.write_ctrl_ready != 0 =>
            {
                self.wires.write_ctrl_valid = false;
                self.wires.write_chnl_valid = true;
                self.wires.write_chnl_data = beats.front().copied().unwrap_or(0);
                Engine::Writing(beats)
            }
            Engine::Writing(mut beats)
                if self.wires.write_chnl_valid && self.host.write_chnl_ready != 0 =>
            {
                beats.pop_front();
                if let Some(next) = beats.front() {
                    self.wires.write_chnl_data = *next;
                    Engine::Writing(beats)
                } else {
                    self.wires.write_chnl_valid = false;
                    self.next_transfer()
                }
            }
            Engine::Waiting(n) if n > 1 => Engine::Waiting(n - 1),
            Engine::Waiting(_) => self.next_transfer(),
            other => other,
        };
        Ok(())
    }
}
