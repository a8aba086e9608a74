//! Transaction sequencer
//!
//! Short blocking handshakes shared by every transfer. They run with
//! interrupts masked, so each polled wait is bounded by an iteration count
//! ([`SPIN_LIMIT`]) rather than by wall-clock time. Nothing here fails
//! outright; every exceeded wait leaves a phase specific bit in the returned
//! [`SequenceStatus`] and the caller folds the bits into a single decision.

use crate::address::{ten_bit_prefix, Address, Direction};
use crate::bus::Error;
use crate::reg::{Registers, Status};
use bitfield::bitfield;

/// Iteration ceiling of every polled wait
pub const SPIN_LIMIT: u32 = 10_000;

bitfield! {
    /// Accumulated outcome of a sequence of handshakes
    #[derive(Copy, Clone, Default, PartialEq, Eq)]
    pub struct SequenceStatus(u8);

    /// Start condition was not acknowledged, or the bus did not turn busy
    pub start_timeout, set_start_timeout: 0;
    /// The bus did not return to idle after a stop condition
    pub stop_timeout, set_stop_timeout: 1;
    /// The core never became ready for a new start condition
    pub ready_timeout, set_ready_timeout: 2;
    /// A byte never completed
    pub byte_timeout, set_byte_timeout: 3;
    /// The last byte was not acknowledged
    pub nack, set_nack: 4;
    /// Another master won the bus
    pub arbitration_lost, set_arbitration_lost: 5;
}

impl SequenceStatus {
    /// No bit is set
    pub fn is_ok(self) -> bool {
        self.0 == 0
    }

    /// Any of the timeout bits is set
    pub fn timed_out(self) -> bool {
        self.start_timeout() || self.stop_timeout() || self.ready_timeout() || self.byte_timeout()
    }

    /// Fold the bits into a transfer result
    ///
    /// Arbitration loss takes precedence over a missing acknowledge, since a
    /// lost byte is never acknowledged either. Bounded waits that expired are
    /// reported as [`Error::Failure`]; [`Error::Timeout`] is reserved for
    /// caller supplied deadlines.
    pub fn into_result(self) -> Result<(), Error> {
        if self.arbitration_lost() {
            Err(Error::ArbitrationLost)
        } else if self.nack() {
            Err(Error::Nack)
        } else if self.timed_out() {
            Err(Error::Failure)
        } else {
            Ok(())
        }
    }
}

impl core::ops::BitOrAssign for SequenceStatus {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl core::fmt::Debug for SequenceStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "SequenceStatus {{ ")?;
        if self.start_timeout() {
            write!(f, "START_TIMEOUT ")?;
        }
        if self.stop_timeout() {
            write!(f, "STOP_TIMEOUT ")?;
        }
        if self.ready_timeout() {
            write!(f, "READY_TIMEOUT ")?;
        }
        if self.byte_timeout() {
            write!(f, "BYTE_TIMEOUT ")?;
        }
        if self.nack() {
            write!(f, "NACK ")?;
        }
        if self.arbitration_lost() {
            write!(f, "ARBITRATION_LOST ")?;
        }
        write!(f, "}}")
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for SequenceStatus {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "SequenceStatus({=u8:#b})", self.0)
    }
}

fn poll<R: Registers + ?Sized>(regs: &R, done: impl Fn(Status) -> bool) -> bool {
    (0..SPIN_LIMIT).any(|_| done(regs.status()))
}

/// Wait until the core accepts a new start condition.
pub fn wait_ready<R: Registers + ?Sized>(regs: &mut R) -> SequenceStatus {
    let mut status = SequenceStatus::default();
    if !poll(regs, |s| s.ready()) {
        status.set_ready_timeout(true);
    }
    status
}

/// Assert a start condition from idle and wait for the bus to turn busy.
pub fn start<R: Registers + ?Sized>(regs: &mut R) -> SequenceStatus {
    let mut status = wait_ready(regs);
    if !status.is_ok() {
        return status;
    }
    regs.select_transmit();
    regs.generate_start();
    if !poll(regs, |s| s.start_detected() && s.bus_busy()) {
        status.set_start_timeout(true);
    }
    regs.clear_start_detected();
    status
}

/// Assert a repeated start while the bus is already owned.
pub fn repeated_start<R: Registers + ?Sized>(regs: &mut R) -> SequenceStatus {
    let mut status = SequenceStatus::default();
    regs.select_transmit();
    regs.generate_repeated_start();
    if !poll(regs, |s| s.start_detected()) {
        status.set_start_timeout(true);
    }
    regs.clear_start_detected();
    status
}

/// Transmit one byte and wait for it to complete.
pub fn send_byte<R: Registers + ?Sized>(regs: &mut R, byte: u8) -> SequenceStatus {
    let mut status = SequenceStatus::default();
    regs.clear_byte_done();
    regs.write_data(byte);
    if !poll(regs, |s| s.byte_done()) {
        status.set_byte_timeout(true);
        return status;
    }
    let flags = regs.status();
    if flags.arbitration_lost() {
        status.set_arbitration_lost(true);
        regs.clear_arbitration_lost();
    } else if flags.nack_received() {
        status.set_nack(true);
    }
    regs.clear_byte_done();
    status
}

/// Assert a stop condition and wait for the bus to return to idle.
pub fn stop<R: Registers + ?Sized>(regs: &mut R) -> SequenceStatus {
    let mut status = SequenceStatus::default();
    regs.generate_stop();
    if !poll(regs, |s| !s.bus_busy()) {
        status.set_stop_timeout(true);
    }
    regs.clear_stop_detected();
    status
}

/// Run the complete address phase of a master transfer
///
/// Starts with a start condition, or with a repeated start when `repeated`
/// is set because the bus is still held from a transfer that ended without a
/// stop. Returns as soon as any handshake fails.
pub fn address_phase<R: Registers + ?Sized>(
    regs: &mut R,
    address: Address,
    direction: Direction,
    repeated: bool,
) -> SequenceStatus {
    let status = if repeated {
        repeated_start(regs)
    } else {
        start(regs)
    };
    if !status.is_ok() {
        return status;
    }
    match address {
        Address::Seven(_) => send_byte(regs, address.header(direction)),
        Address::Ten(a) => {
            let status = send_byte(regs, ten_bit_prefix(a));
            if !status.is_ok() {
                return status;
            }
            let status = send_byte(regs, a as u8);
            if !status.is_ok() || direction == Direction::Write {
                return status;
            }
            let status = repeated_start(regs);
            if !status.is_ok() {
                return status;
            }
            send_byte(regs, address.header(Direction::Read))
        }
    }
}
