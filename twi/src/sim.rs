//! Software model of a bus instance for the unit tests
//!
//! [`Sim`] implements [`Registers`] on top of a small bus model: as master it
//! talks to a single device (or to anyone when no device address is set), as
//! slave it is driven by the `remote_*` methods standing in for a remote
//! master. Everything observable on the bus lands in the [`Wire`] log, and
//! selected register calls are journaled as [`Call`]s so tests can check
//! their order.

use crate::address::{ten_bit_prefix, Address, AddressDecoder, Decoded, Direction};
use crate::bus::{BusManager, Peripherals};
use crate::reg::{Control, Divider, OwnAddress, Registers, Status};
use fugit::{HertzU32, MillisDurationU32, RateExtU32};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;
use twi_core::{Clocks, DmaChannel, DmaDirection, DmaTransfer, Semaphore};

const READY: u32 = 1 << 9;
const START: u32 = 1 << 8;
const TCF: u32 = 1 << 7;
const ADDRESSED: u32 = 1 << 6;
const BUSY: u32 = 1 << 5;
const ARB: u32 = 1 << 4;
const STOP: u32 = 1 << 3;
const SRW: u32 = 1 << 2;
const IBIF: u32 = 1 << 1;
const RXAK: u32 = 1;

/// Bus level happenings
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Wire {
    Start,
    RepeatedStart,
    Byte { value: u8, ack: bool },
    Stop,
    ArbitrationLost,
}

/// Journaled calls
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Call {
    DisableInterrupt,
    DisableDma,
    Stop,
    DmaConfigure,
    DmaStart,
    DmaStop,
    /// Recorded by tests from their event handler
    Ended,
}

#[derive(Default)]
struct Device {
    /// `None` acknowledges everything
    address: Option<Address>,
    decoder: AddressDecoder,
    matched: Option<(Address, Direction)>,
    respond: VecDeque<u8>,
    nack_after: Option<usize>,
    data_count: usize,
    received: Vec<u8>,
}

impl Device {
    fn ack(&mut self, byte: u8) -> bool {
        match self.decoder.byte(byte) {
            Decoded::Matched(address, direction) => {
                let ack = self.address.map_or(true, |a| a == address);
                if ack {
                    self.matched = Some((address, direction));
                    self.data_count = 0;
                }
                ack
            }
            Decoded::Pending => match self.address {
                None => true,
                Some(Address::Ten(a)) => ten_bit_prefix(a) == byte,
                Some(Address::Seven(_)) => false,
            },
            Decoded::Data => {
                let ack = (self.matched.is_some() || self.address.is_none())
                    && self.nack_after.map_or(true, |limit| self.data_count < limit);
                if ack {
                    self.received.push(byte);
                }
                self.data_count += 1;
                ack
            }
            Decoded::Invalid => self.address.is_none(),
        }
    }
}

#[derive(Default)]
struct DmaState {
    transfer: Option<DmaTransfer>,
    running: bool,
    stopped: bool,
    remaining: usize,
}

// Safety: the pointers are only dereferenced by `FakeDma::run`, on buffers
// the test keeps alive.
unsafe impl Send for DmaState {}

struct SimState {
    ctrl: Control,
    flags: u32,
    data: u8,
    divider: Divider,
    own: OwnAddress,
    device: Device,
    ignore_start: bool,
    stall_after: Option<usize>,
    lose_at: Option<usize>,
    master_bytes: usize,
    wire: Vec<Wire>,
    journal: Vec<Call>,
    acks: Vec<bool>,
    generated_stops: usize,
    dma: DmaState,
}

impl SimState {
    fn set(&mut self, flags: u32, on: bool) {
        if on {
            self.flags |= flags;
        } else {
            self.flags &= !flags;
        }
    }

    fn flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }
}

/// Shared handle to one simulated bus instance
#[derive(Clone)]
pub struct Sim(Arc<Mutex<SimState>>);

impl Sim {
    /// Bus where any address is acknowledged
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(SimState {
            ctrl: Control(0),
            flags: 0,
            data: 0,
            divider: Divider(0),
            own: OwnAddress(0),
            device: Device::default(),
            ignore_start: false,
            stall_after: None,
            lose_at: None,
            master_bytes: 0,
            wire: Vec::new(),
            journal: Vec::new(),
            acks: Vec::new(),
            generated_stops: 0,
            dma: DmaState::default(),
        })))
    }

    /// Bus with a single device at `address`
    pub fn with_device(address: Address) -> Self {
        let sim = Self::new();
        sim.state().device.address = Some(address);
        sim
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.0.lock().unwrap()
    }

    pub fn wire(&self) -> Vec<Wire> {
        self.state().wire.clone()
    }

    pub fn journal(&self) -> Vec<Call> {
        self.state().journal.clone()
    }

    pub fn record(&self, call: Call) {
        self.state().journal.push(call);
    }

    /// Acknowledge bits sent by the master for received bytes
    pub fn acks(&self) -> Vec<bool> {
        self.state().acks.clone()
    }

    /// Data bytes accepted by the device
    pub fn received(&self) -> Vec<u8> {
        self.state().device.received.clone()
    }

    pub fn device_address(&self) -> Option<(Address, Direction)> {
        self.state().device.matched
    }

    pub fn control(&self) -> Control {
        self.state().ctrl
    }

    /// Stop conditions requested through `generate_stop`
    pub fn generated_stops(&self) -> usize {
        self.state().generated_stops
    }

    /// Bytes the device sends when read, `0xFF` once exhausted
    pub fn respond_with(&self, data: &[u8]) {
        self.state().device.respond.extend(data);
    }

    /// The device refuses data bytes after the first `count`
    pub fn nack_data_after(&self, count: usize) {
        self.state().device.nack_after = Some(count);
    }

    /// Arbitration is lost on master byte number `index`, counting from zero
    pub fn lose_arbitration_at(&self, index: usize) {
        self.state().lose_at = Some(index);
    }

    /// Start conditions are never acknowledged by the core
    pub fn ignore_start(&self) {
        self.state().ignore_start = true;
    }

    /// After `count` more master bytes the bus hangs until the next stop
    pub fn stall_after(&self, count: usize) {
        self.state().stall_after = Some(count);
    }

    /// A remote master addresses this instance. Returns whether the own
    /// address matched.
    pub fn remote_begin(&self, address: Address, direction: Direction) -> bool {
        let mut s = self.state();
        if !s.ctrl.enable() || Address::from_own_address(s.own) != address {
            return false;
        }
        s.set(BUSY | ADDRESSED | IBIF | TCF, true);
        s.set(SRW, direction == Direction::Read);
        s.set(RXAK, false);
        true
    }

    /// The remote master writes `byte`. Returns the acknowledge bit sent
    /// back by this instance.
    pub fn remote_write(&self, byte: u8) -> bool {
        let mut s = self.state();
        s.data = byte;
        s.set(IBIF | TCF, true);
        !s.ctrl.nack()
    }

    /// The remote master reads a byte and acknowledges it with `ack`.
    pub fn remote_read(&self, ack: bool) -> u8 {
        let mut s = self.state();
        s.set(IBIF | TCF, true);
        s.set(RXAK, !ack);
        s.data
    }

    pub fn remote_stop(&self) {
        let mut s = self.state();
        s.set(STOP, true);
        s.set(BUSY | ADDRESSED, false);
    }
}

impl Registers for Sim {
    fn enable_module(&mut self) {
        let mut s = self.state();
        s.ctrl.set_enable(true);
        s.set(READY, true);
    }

    fn disable_module(&mut self) {
        let mut s = self.state();
        s.ctrl.set_enable(false);
        s.set(READY, false);
    }

    fn generate_start(&mut self) {
        let mut s = self.state();
        if s.ignore_start {
            return;
        }
        s.ctrl.set_master(true);
        s.set(BUSY | START, true);
        s.wire.push(Wire::Start);
        s.device.decoder.start();
    }

    fn generate_repeated_start(&mut self) {
        let mut s = self.state();
        s.set(START, true);
        s.wire.push(Wire::RepeatedStart);
        s.device.decoder.start();
    }

    fn generate_stop(&mut self) {
        let mut s = self.state();
        s.generated_stops += 1;
        s.journal.push(Call::Stop);
        if s.ctrl.master() && s.flag(BUSY) {
            s.wire.push(Wire::Stop);
            s.set(BUSY, false);
            s.set(STOP, true);
            s.device.decoder.stop();
        }
        s.ctrl.set_master(false);
        s.stall_after = None;
    }

    fn select_transmit(&mut self) {
        self.state().ctrl.set_transmit(true);
    }

    fn select_receive(&mut self) {
        self.state().ctrl.set_transmit(false);
    }

    fn select_ack(&mut self) {
        self.state().ctrl.set_nack(false);
    }

    fn select_nack(&mut self) {
        self.state().ctrl.set_nack(true);
    }

    fn write_data(&mut self, byte: u8) {
        let mut s = self.state();
        if !(s.ctrl.master() && s.ctrl.transmit()) {
            s.data = byte;
            s.set(ADDRESSED, false);
            return;
        }
        match s.stall_after.as_mut() {
            Some(0) => return,
            Some(count) => *count -= 1,
            None => {}
        }
        s.data = byte;
        let index = s.master_bytes;
        s.master_bytes += 1;
        if s.lose_at == Some(index) {
            s.wire.push(Wire::ArbitrationLost);
            s.ctrl.set_master(false);
            s.set(BUSY, false);
            s.set(ARB | IBIF, true);
            return;
        }
        let ack = s.device.ack(byte);
        s.wire.push(Wire::Byte { value: byte, ack });
        s.set(IBIF | TCF, true);
        s.set(RXAK, !ack);
        if !ack {
            // Refused bytes make the core release the bus
            s.wire.push(Wire::Stop);
            s.ctrl.set_master(false);
            s.set(BUSY, false);
            s.device.decoder.stop();
        }
    }

    fn read_data(&mut self) -> u8 {
        let mut s = self.state();
        if s.ctrl.master() && !s.ctrl.transmit() && s.flag(BUSY) {
            let previous = s.data;
            let next = s.device.respond.pop_front().unwrap_or(0xFF);
            let ack = !s.ctrl.nack();
            s.data = next;
            s.acks.push(ack);
            s.wire.push(Wire::Byte { value: next, ack });
            s.set(IBIF | TCF, true);
            previous
        } else {
            s.set(ADDRESSED, false);
            s.data
        }
    }

    fn read_last_byte(&mut self) -> u8 {
        let mut s = self.state();
        s.ctrl.set_transmit(true);
        s.data
    }

    fn clear_byte_done(&mut self) {
        self.state().set(IBIF, false);
    }

    fn clear_arbitration_lost(&mut self) {
        self.state().set(ARB, false);
    }

    fn clear_stop_detected(&mut self) {
        self.state().set(STOP, false);
    }

    fn clear_start_detected(&mut self) {
        self.state().set(START, false);
    }

    fn enable_interrupt(&mut self) {
        self.state().ctrl.set_interrupt_enable(true);
    }

    fn disable_interrupt(&mut self) {
        let mut s = self.state();
        s.ctrl.set_interrupt_enable(false);
        s.journal.push(Call::DisableInterrupt);
    }

    fn enable_dma(&mut self) {
        self.state().ctrl.set_dma_enable(true);
    }

    fn disable_dma(&mut self) {
        let mut s = self.state();
        s.ctrl.set_dma_enable(false);
        s.journal.push(Call::DisableDma);
    }

    fn set_wakeup(&mut self, enabled: bool) {
        self.state().ctrl.set_wakeup_enable(enabled);
    }

    fn set_own_address(&mut self, address: OwnAddress) {
        self.state().own = address;
    }

    fn set_dividers(&mut self, divider: Divider) {
        self.state().divider = divider;
    }

    fn dividers(&self) -> Divider {
        self.state().divider
    }

    fn status(&self) -> Status {
        Status(self.state().flags)
    }

    fn data_register(&self) -> *mut u8 {
        std::ptr::null_mut()
    }
}

/// DMA channel moving bytes through a [`Sim`]
///
/// Handles created from the same simulator share one channel.
pub struct FakeDma {
    sim: Sim,
}

impl FakeDma {
    pub fn new(sim: &Sim) -> Self {
        Self { sim: sim.clone() }
    }

    pub fn configured(&self) -> Option<DmaTransfer> {
        self.sim.state().dma.transfer
    }

    pub fn stopped(&self) -> bool {
        self.sim.state().dma.stopped
    }

    /// Move every outstanding byte of a started transfer.
    pub fn run(&self) {
        let (transfer, count) = {
            let s = self.sim.state();
            match s.dma.transfer {
                Some(transfer) if s.dma.running => (transfer, s.dma.remaining),
                _ => return,
            }
        };
        let mut regs = self.sim.clone();
        for i in 0..count {
            // Safety: the transfer describes a buffer kept alive by the test.
            unsafe {
                match transfer.direction {
                    DmaDirection::MemoryToPeripheral => regs.write_data(transfer.memory.add(i).read()),
                    DmaDirection::PeripheralToMemory => transfer.memory.add(i).write(regs.read_data()),
                }
            }
        }
        self.sim.state().dma.remaining = 0;
    }
}

// Safety: `FakeDma` only touches memory from `run`, which tests call while
// the configured buffer is alive.
unsafe impl DmaChannel for FakeDma {
    fn configure(&mut self, transfer: &DmaTransfer) {
        let mut s = self.sim.state();
        s.journal.push(Call::DmaConfigure);
        s.dma = DmaState {
            transfer: Some(*transfer),
            running: false,
            stopped: false,
            remaining: transfer.len,
        };
    }

    fn start(&mut self) {
        let mut s = self.sim.state();
        s.journal.push(Call::DmaStart);
        s.dma.running = true;
    }

    fn stop(&mut self) {
        let mut s = self.sim.state();
        s.journal.push(Call::DmaStop);
        s.dma.running = false;
        s.dma.stopped = true;
    }

    fn remaining(&self) -> usize {
        self.sim.state().dma.remaining
    }
}

pub struct TestClock {
    pub enabled: bool,
    pub resets: usize,
    frequency: HertzU32,
}

impl TestClock {
    pub fn new(frequency: HertzU32) -> Self {
        Self {
            enabled: false,
            resets: 0,
            frequency,
        }
    }
}

impl Clocks for TestClock {
    fn enable(&mut self) {
        self.enabled = true;
    }

    fn disable(&mut self) {
        self.enabled = false;
    }

    fn soft_reset(&mut self) {
        self.resets += 1;
    }

    fn input_clock(&self) -> HertzU32 {
        self.frequency
    }
}

#[derive(Default)]
pub struct TestSemaphore {
    count: Mutex<u32>,
    posted: Condvar,
}

impl Semaphore for TestSemaphore {
    fn clear(&self) {
        *self.count.lock().unwrap() = 0;
    }

    fn post(&self) {
        *self.count.lock().unwrap() += 1;
        self.posted.notify_one();
    }

    fn wait(&self, timeout: MillisDurationU32) -> bool {
        let count = self.count.lock().unwrap();
        let timeout = Duration::from_millis(u64::from(timeout.to_millis()));
        let (mut count, _) = self
            .posted
            .wait_timeout_while(count, timeout, |c| *c == 0)
            .unwrap();
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }
}

pub type TestManager<'a, N> = BusManager<'a, Sim, TestClock, FakeDma, TestSemaphore, N>;

/// Peripherals of a simulated instance with an 8 MHz input clock
pub fn peripherals(sim: &Sim, dma: Option<FakeDma>) -> Peripherals<Sim, TestClock, FakeDma> {
    Peripherals {
        regs: sim.clone(),
        clocks: TestClock::new(8.MHz()),
        dma,
    }
}
