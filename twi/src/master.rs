//! Master transfer state machine
//!
//! `Idle -> Address -> Data -> Idle`. The address phase runs synchronously
//! through the [`sequencer`] while the instance is locked; the data phase is
//! driven by byte-complete interrupts or by the DMA channel. Every failure
//! ends the transfer, the context is never left busy after an error.
//!
//! Receiving needs care around the last two bytes. Reading the data register
//! hands back the byte that just arrived and starts clocking in the next one,
//! acknowledged according to the ACK/NACK selection at that moment. So the
//! NACK for the final byte has to be armed before the second to last byte is
//! read, and the final byte is fetched with [`Registers::read_last_byte`],
//! which switches direction first so no further byte is clocked in. With `i`
//! bytes already stored out of `n`:
//!
//! - `i == n - 1`: read the last byte and end the transfer
//! - `i == n - 2`: arm NACK, then read
//! - otherwise: arm ACK, then read
//!
//! A single byte receive arms NACK before the priming read that starts the
//! data phase.
//!
//! A transfer may leave its data phase open for a follow-up of the same
//! direction that carries on without a new address phase. A send that ends
//! without a stop can always be continued. A receive is told how many `more`
//! bytes follow-up receives will take: the ACK/NACK decisions above count
//! those bytes in, and the first byte beyond the buffer is left waiting in the
//! data register, holding the bus, for the follow-up to pick up.

use crate::address::{Address, Direction};
use crate::buffer::{RxCursor, TxCursor};
use crate::bus::Error;
use crate::config::Transport;
use crate::event::Notifications;
use crate::reg::Registers;
use crate::sequencer::{self, SequenceStatus};
use twi_core::{DmaChannel, DmaDirection, DmaEvent, DmaTransfer};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Address,
    Data,
}

/// Per-instance state of a master
#[derive(Debug)]
pub(crate) struct MasterContext {
    pub(crate) target: Address,
    transport: Transport,
    phase: Phase,
    direction: Direction,
    tx: TxCursor,
    rx: RxCursor,
    /// Generate a stop condition once the data phase completes
    stop: bool,
    /// The bus is held from a transfer that ended without a stop
    bus_owned: bool,
    /// Data phase left open by the last transfer for a follow-up
    open: Option<Direction>,
    /// Bytes follow-up receives take over from the current one
    more: usize,
    dma_active: bool,
    dma_len: usize,
    /// Hand the receive buffer back through `take_received` once done
    keep: bool,
    reclaim: Option<RxCursor>,
    pub(crate) result: Result<(), Error>,
}

impl MasterContext {
    pub(crate) fn new(target: Address, transport: Transport) -> Self {
        Self {
            target,
            transport,
            phase: Phase::Idle,
            direction: Direction::Write,
            tx: TxCursor::empty(),
            rx: RxCursor::empty(),
            stop: true,
            bus_owned: false,
            open: None,
            more: 0,
            dma_active: false,
            dma_len: 0,
            keep: false,
            reclaim: None,
            result: Ok(()),
        }
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.phase != Phase::Idle
    }

    /// Bytes still to be sent or received by the current or last transfer
    pub(crate) fn remaining(&self) -> usize {
        match self.direction {
            Direction::Write => self.tx.remaining(),
            Direction::Read => self.rx.remaining(),
        }
    }

    pub(crate) fn take_received(&mut self) -> Option<RxCursor> {
        self.reclaim.take()
    }

    /// The last transfer left its data phase open for a follow-up in
    /// `direction`.
    pub(crate) fn can_continue(&self, direction: Direction) -> bool {
        !self.is_busy() && self.bus_owned && self.open == Some(direction)
    }

    fn begin(&mut self, direction: Direction, stop: bool) {
        self.direction = direction;
        self.stop = stop;
        self.result = Ok(());
        self.phase = Phase::Address;
        self.open = None;
        self.more = 0;
        self.reclaim = None;
    }

    pub(crate) fn start_send<H: Registers, D: DmaChannel>(
        &mut self,
        regs: &mut H,
        dma: Option<&mut D>,
        data: TxCursor,
        stop: bool,
        n: &mut Notifications,
    ) {
        self.begin(Direction::Write, stop);
        self.tx = data;
        self.keep = false;
        debug!("master send, {=usize} bytes", self.tx.remaining());

        regs.enable_interrupt();
        let status = sequencer::address_phase(regs, self.target, Direction::Write, self.bus_owned);
        if !status.is_ok() {
            self.address_failed(regs, status, n);
            return;
        }
        self.bus_owned = true;
        self.send_data(regs, dma, n);
    }

    /// Carry on the data phase of a send that ended without a stop. The
    /// caller checks [`MasterContext::can_continue`] first.
    pub(crate) fn continue_send<H: Registers, D: DmaChannel>(
        &mut self,
        regs: &mut H,
        dma: Option<&mut D>,
        data: TxCursor,
        stop: bool,
        n: &mut Notifications,
    ) {
        self.begin(Direction::Write, stop);
        self.tx = data;
        self.keep = false;
        trace!("master send continued, {=usize} bytes", self.tx.remaining());
        regs.enable_interrupt();
        self.send_data(regs, dma, n);
    }

    fn send_data<H: Registers, D: DmaChannel>(
        &mut self,
        regs: &mut H,
        dma: Option<&mut D>,
        n: &mut Notifications,
    ) {
        self.phase = Phase::Data;
        match dma {
            Some(dma) if self.transport == Transport::Dma && self.tx.remaining() > 0 => {
                let (memory, len) = self.tx.rest();
                self.start_dma(regs, dma, DmaDirection::MemoryToPeripheral, memory, len);
            }
            _ => self.transmit_next(regs, n),
        }
    }

    pub(crate) fn start_receive<H: Registers, D: DmaChannel>(
        &mut self,
        regs: &mut H,
        dma: Option<&mut D>,
        buffer: RxCursor,
        stop: bool,
        more: usize,
        keep: bool,
        n: &mut Notifications,
    ) {
        self.begin(Direction::Read, stop);
        self.rx = buffer;
        self.more = more;
        self.keep = keep;
        let total = self.rx.len() + more;
        debug!("master receive, {=usize} bytes", total);

        regs.enable_interrupt();
        let status = sequencer::address_phase(regs, self.target, Direction::Read, self.bus_owned);
        if !status.is_ok() {
            self.address_failed(regs, status, n);
            return;
        }
        self.bus_owned = true;
        self.phase = Phase::Data;

        regs.select_receive();
        if total == 1 {
            regs.select_nack();
        } else {
            regs.select_ack();
        }
        // The last two bytes always go through `receive_next`
        if let Some(dma) = dma {
            if self.transport == Transport::Dma && more == 0 && total > 2 {
                let (memory, _) = self.rx.rest();
                self.start_dma(regs, dma, DmaDirection::PeripheralToMemory, memory, total - 2);
            }
        }
        // Priming read, clocks in the first byte
        let _ = regs.read_data();
    }

    /// Carry on a receive that left the next byte waiting in the data
    /// register. The caller checks [`MasterContext::can_continue`] first.
    pub(crate) fn continue_receive<H: Registers>(
        &mut self,
        regs: &mut H,
        buffer: RxCursor,
        stop: bool,
        more: usize,
        n: &mut Notifications,
    ) {
        self.begin(Direction::Read, stop);
        self.rx = buffer;
        self.more = more;
        self.keep = false;
        trace!("master receive continued, {=usize} bytes", self.rx.len());
        self.phase = Phase::Data;
        regs.enable_interrupt();
        self.receive_next(regs, n);
    }

    fn start_dma<H: Registers, D: DmaChannel>(
        &mut self,
        regs: &mut H,
        dma: &mut D,
        direction: DmaDirection,
        memory: *mut u8,
        len: usize,
    ) {
        trace!("dma armed, {=usize} bytes", len);
        dma.configure(&DmaTransfer {
            direction,
            memory,
            peripheral: regs.data_register(),
            len,
        });
        self.dma_active = true;
        self.dma_len = len;
        regs.enable_dma();
        dma.start();
    }

    fn stop_dma<H: Registers, D: DmaChannel>(&mut self, regs: &mut H, dma: Option<&mut D>) {
        if let Some(dma) = dma {
            dma.stop();
        }
        regs.disable_dma();
        self.dma_active = false;
    }

    /// Byte-complete interrupt
    pub(crate) fn on_interrupt<H: Registers, D: DmaChannel>(
        &mut self,
        regs: &mut H,
        dma: Option<&mut D>,
        n: &mut Notifications,
    ) {
        let status = regs.status();
        if !status.byte_done() {
            return;
        }
        if self.phase != Phase::Data {
            regs.clear_byte_done();
            return;
        }
        if status.arbitration_lost() {
            warn!("arbitration lost");
            regs.clear_arbitration_lost();
            regs.clear_byte_done();
            if self.dma_active {
                self.stop_dma(regs, dma);
            }
            self.bus_owned = false;
            regs.disable_interrupt();
            self.end(Err(Error::ArbitrationLost), n);
            return;
        }
        // Bytes belong to the DMA channel until it reports completion
        if self.dma_active {
            return;
        }
        regs.clear_byte_done();
        match self.direction {
            Direction::Write if status.nack_received() => {
                // The hardware releases the bus on its own
                self.bus_owned = false;
                regs.disable_interrupt();
                self.end(Err(Error::Nack), n);
            }
            Direction::Write => self.transmit_next(regs, n),
            Direction::Read => self.receive_next(regs, n),
        }
    }

    pub(crate) fn on_dma_event<H: Registers, D: DmaChannel>(
        &mut self,
        regs: &mut H,
        mut dma: Option<&mut D>,
        event: DmaEvent,
        n: &mut Notifications,
    ) {
        if !self.dma_active {
            return;
        }
        if event == DmaEvent::Error {
            warn!("dma channel error");
            self.abort(regs, dma, Error::Failure, n);
            return;
        }
        let moved = self.dma_len - dma.as_deref().map_or(0, |d| d.remaining());
        self.stop_dma(regs, dma.as_deref_mut());
        match self.direction {
            Direction::Write => {
                self.tx.skip(moved);
                if regs.status().nack_received() {
                    self.bus_owned = false;
                    regs.disable_interrupt();
                    self.end(Err(Error::Nack), n);
                } else {
                    regs.clear_byte_done();
                    self.transmit_next(regs, n);
                }
            }
            Direction::Read => {
                self.rx.advance(moved);
                if regs.status().byte_done() {
                    regs.clear_byte_done();
                    self.receive_next(regs, n);
                }
            }
        }
    }

    fn transmit_next<H: Registers>(&mut self, regs: &mut H, n: &mut Notifications) {
        match self.tx.next() {
            Some(byte) => regs.write_data(byte),
            None => self.complete(regs, n),
        }
    }

    fn receive_next<H: Registers>(&mut self, regs: &mut H, n: &mut Notifications) {
        let total = self.rx.len() + self.more;
        let index = self.rx.received();
        if self.rx.remaining() == 0 {
            // Only with `more`: the waiting byte is the follow-up's first
            regs.disable_interrupt();
            self.end(Ok(()), n);
            self.open = Some(Direction::Read);
            return;
        }
        if index + 1 >= total {
            let byte = regs.read_last_byte();
            self.rx.push(byte);
            self.complete(regs, n);
            return;
        }
        if index + 2 == total {
            regs.select_nack();
        } else {
            regs.select_ack();
        }
        let byte = regs.read_data();
        self.rx.push(byte);
    }

    /// Successful end of the data phase
    fn complete<H: Registers>(&mut self, regs: &mut H, n: &mut Notifications) {
        let mut result = Ok(());
        // A receive that fetched its last byte has switched direction
        let open = (!self.stop && self.direction == Direction::Write).then_some(Direction::Write);
        if self.stop {
            let status = sequencer::stop(regs);
            if !status.is_ok() {
                warn!("stop not completed");
                result = Err(Error::Failure);
            }
            self.bus_owned = false;
        }
        regs.disable_interrupt();
        self.end(result, n);
        self.open = open;
    }

    fn address_failed<H: Registers>(
        &mut self,
        regs: &mut H,
        status: SequenceStatus,
        n: &mut Notifications,
    ) {
        let result = status.into_result();
        debug!("address phase failed: {}", status);
        if status.timed_out() && !status.ready_timeout() {
            // Whatever part of the handshake went through is undone by a stop
            let _ = sequencer::stop(regs);
        }
        self.bus_owned = false;
        regs.disable_interrupt();
        self.end(result, n);
    }

    /// Cancel the transfer in flight
    ///
    /// Interrupts and the DMA channel are shut off before the context is
    /// torn down, and the bus is released if it is still held. Returns
    /// `false` if there was nothing to cancel.
    pub(crate) fn abort<H: Registers, D: DmaChannel>(
        &mut self,
        regs: &mut H,
        dma: Option<&mut D>,
        reason: Error,
        n: &mut Notifications,
    ) -> bool {
        if !self.is_busy() {
            return false;
        }
        warn!("master transfer aborted: {}", reason);
        regs.disable_interrupt();
        if self.dma_active {
            self.stop_dma(regs, dma);
        }
        if self.bus_owned {
            let _ = sequencer::stop(regs);
            self.bus_owned = false;
        }
        self.end(Err(reason), n);
        true
    }

    /// Release a bus still held by a transfer that ended without a stop.
    pub(crate) fn release_bus<H: Registers>(&mut self, regs: &mut H) {
        if !self.is_busy() && self.bus_owned {
            let _ = sequencer::stop(regs);
            self.bus_owned = false;
        }
    }

    fn end(&mut self, result: Result<(), Error>, n: &mut Notifications) {
        debug!("master transfer done: {}", result);
        self.phase = Phase::Idle;
        self.open = None;
        self.dma_active = false;
        let rx = core::mem::replace(&mut self.rx, RxCursor::empty());
        if self.keep {
            self.reclaim = Some(rx);
        }
        self.tx = TxCursor::empty();
        self.result = result;
        n.end(result);
    }
}
