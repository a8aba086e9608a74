//! Slave transfer state machine
//!
//! An armed slave waits for its own address. On a match the direction bit
//! set by the hardware tells whether the remote master reads or writes; bytes
//! then stream from the transmit buffer or into the receive buffer until a
//! stop condition ends the transfer. Running out of buffer space is not fatal:
//! the application is asked for a fresh buffer first, and if none comes the
//! condition is recorded while the bus keeps moving (filler bytes on
//! transmit, discarded bytes on receive).

use crate::address::{Address, Direction};
use crate::buffer::{RxCursor, TxCursor};
use crate::bus::Error;
use crate::config::Transport;
use crate::event::{Event, EventHandler, Notifications};
use crate::reg::Registers;
use twi_core::{DmaChannel, DmaDirection, DmaEvent, DmaTransfer};

/// Byte transmitted when the master keeps reading past the transmit buffer
pub const FILLER: u8 = 0xFF;

/// Per-instance state of a slave
#[derive(Debug)]
pub(crate) struct SlaveContext {
    pub(crate) address: Address,
    transport: Transport,
    pub(crate) always_listen: bool,
    tx: TxCursor,
    rx: RxCursor,
    /// Responding to address matches
    listening: bool,
    /// Between an address match and the following stop condition
    in_progress: bool,
    direction: Direction,
    /// Direction fixed by the last buffer handed in, used by DMA transport
    dma_direction: Option<Direction>,
    dma_active: bool,
    dma_len: usize,
    keep: bool,
    pub(crate) result: Result<(), Error>,
}

impl SlaveContext {
    pub(crate) fn new(address: Address, transport: Transport, always_listen: bool) -> Self {
        Self {
            address,
            transport,
            always_listen,
            tx: TxCursor::empty(),
            rx: RxCursor::empty(),
            listening: false,
            in_progress: false,
            direction: Direction::Write,
            dma_direction: None,
            dma_active: false,
            dma_len: 0,
            keep: false,
            result: Ok(()),
        }
    }

    pub(crate) fn is_listening(&self) -> bool {
        self.listening
    }

    /// A one-shot slave is busy while armed, an always-listening one only
    /// between address match and stop.
    pub(crate) fn is_busy(&self) -> bool {
        self.listening && (!self.always_listen || self.in_progress)
    }

    /// Bytes left in the buffer of the current or last transfer direction
    pub(crate) fn remaining(&self) -> usize {
        match self.direction {
            Direction::Read => self.tx.remaining(),
            Direction::Write => self.rx.remaining(),
        }
    }

    pub(crate) fn set_transmit_buffer(&mut self, buffer: TxCursor) {
        self.tx = buffer;
        self.dma_direction = Some(Direction::Read);
    }

    pub(crate) fn set_receive_buffer(&mut self, buffer: RxCursor, keep: bool) {
        self.rx = buffer;
        self.keep = keep;
        self.dma_direction = Some(Direction::Write);
    }

    /// Hand back a receive buffer set with `keep`, once no transfer uses it.
    pub(crate) fn take_received(&mut self) -> Option<RxCursor> {
        if self.in_progress || !self.keep {
            return None;
        }
        self.keep = false;
        Some(core::mem::replace(&mut self.rx, RxCursor::empty()))
    }

    /// Start responding to address matches.
    pub(crate) fn arm<H: Registers>(&mut self, regs: &mut H, expected: Direction) {
        debug!("slave armed");
        self.listening = true;
        self.in_progress = false;
        self.direction = expected;
        self.result = Ok(());
        regs.select_receive();
        regs.select_ack();
        regs.enable_interrupt();
    }

    pub(crate) fn on_interrupt<'a, H: Registers, D: DmaChannel>(
        &mut self,
        regs: &mut H,
        mut dma: Option<&mut D>,
        handler: Option<&dyn EventHandler<'a>>,
        instance: usize,
        n: &mut Notifications,
    ) {
        let status = regs.status();
        if status.arbitration_lost() {
            regs.clear_arbitration_lost();
        }
        if !self.listening {
            regs.clear_byte_done();
            regs.clear_stop_detected();
            return;
        }
        if status.byte_done() {
            regs.clear_byte_done();
            if status.addressed() {
                let direction = if status.slave_read() {
                    Direction::Read
                } else {
                    Direction::Write
                };
                self.address_matched(regs, dma.as_deref_mut(), handler, instance, direction, n);
            } else if self.in_progress && !self.dma_active {
                match self.direction {
                    Direction::Read if status.nack_received() => {
                        // Master is done reading; let go of the data line
                        regs.select_receive();
                        let _ = regs.read_data();
                    }
                    Direction::Read => self.transmit_next(regs, handler, instance, n),
                    Direction::Write => self.receive_byte(regs, handler, instance, n),
                }
            }
        }
        if status.stop_detected() {
            regs.clear_stop_detected();
            self.stopped(regs, dma, n);
        }
    }

    fn address_matched<'a, H: Registers, D: DmaChannel>(
        &mut self,
        regs: &mut H,
        dma: Option<&mut D>,
        handler: Option<&dyn EventHandler<'a>>,
        instance: usize,
        direction: Direction,
        n: &mut Notifications,
    ) {
        debug!("slave addressed, {}", direction);
        self.direction = direction;
        self.in_progress = true;
        self.result = Ok(());
        n.push(Event::AddressMatch(direction));

        let pending = match direction {
            Direction::Read => self.tx.remaining(),
            Direction::Write => self.rx.remaining(),
        };
        if let Some(dma) = dma {
            if self.transport == Transport::Dma
                && self.dma_direction == Some(direction)
                && pending > 0
            {
                self.start_dma(regs, dma, direction);
                return;
            }
        }
        match direction {
            Direction::Read => {
                regs.select_transmit();
                self.transmit_next(regs, handler, instance, n);
            }
            Direction::Write => {
                regs.select_receive();
                if self.rx.remaining() > 0 || self.refill_receive(handler, instance) {
                    regs.select_ack();
                } else {
                    regs.select_nack();
                }
                // Releases the address byte
                let _ = regs.read_data();
            }
        }
    }

    fn start_dma<H: Registers, D: DmaChannel>(
        &mut self,
        regs: &mut H,
        dma: &mut D,
        direction: Direction,
    ) {
        let (dma_direction, (memory, len)) = match direction {
            Direction::Read => {
                regs.select_transmit();
                (DmaDirection::MemoryToPeripheral, self.tx.rest())
            }
            Direction::Write => {
                regs.select_receive();
                regs.select_ack();
                (DmaDirection::PeripheralToMemory, self.rx.rest())
            }
        };
        trace!("slave dma armed, {=usize} bytes", len);
        dma.configure(&DmaTransfer {
            direction: dma_direction,
            memory,
            peripheral: regs.data_register(),
            len,
        });
        self.dma_active = true;
        self.dma_len = len;
        regs.enable_dma();
        dma.start();
        if direction == Direction::Write {
            let _ = regs.read_data();
        }
    }

    fn transmit_next<'a, H: Registers>(
        &mut self,
        regs: &mut H,
        handler: Option<&dyn EventHandler<'a>>,
        instance: usize,
        n: &mut Notifications,
    ) {
        if self.tx.remaining() == 0 {
            if let Some(buffer) = handler.and_then(|h| h.refill_transmit(instance)) {
                self.tx = TxCursor::new(buffer);
            }
        }
        match self.tx.next() {
            Some(byte) => {
                regs.write_data(byte);
                if self.tx.remaining() == 0 {
                    n.push(Event::TransmitEmpty);
                }
            }
            None => {
                warn!("slave transmit underrun");
                self.result = Err(Error::TxUnderrun);
                n.push(Event::Error(Error::TxUnderrun));
                regs.write_data(FILLER);
            }
        }
    }

    fn receive_byte<'a, H: Registers>(
        &mut self,
        regs: &mut H,
        handler: Option<&dyn EventHandler<'a>>,
        instance: usize,
        n: &mut Notifications,
    ) {
        let byte = regs.read_data();
        if !self.rx.push(byte) {
            warn!("slave receive overrun");
            self.result = Err(Error::RxOverrun);
            n.push(Event::Error(Error::RxOverrun));
            regs.select_nack();
            return;
        }
        if self.rx.remaining() == 0 && !self.refill_receive(handler, instance) {
            n.push(Event::ReceiveFull);
            regs.select_nack();
        }
    }

    fn refill_receive<'a>(&mut self, handler: Option<&dyn EventHandler<'a>>, instance: usize) -> bool {
        match handler.and_then(|h| h.refill_receive(instance)) {
            Some(buffer) => {
                self.rx = RxCursor::new(buffer);
                self.keep = false;
                true
            }
            None => false,
        }
    }

    /// Completion interrupt of the DMA channel
    ///
    /// The stop condition ends a slave transfer. Once the channel has moved
    /// the whole buffer, further bytes of the same transfer go through the
    /// byte handler, which refills or records the underrun or overrun.
    pub(crate) fn on_dma_event<'a, H: Registers, D: DmaChannel>(
        &mut self,
        regs: &mut H,
        dma: Option<&mut D>,
        handler: Option<&dyn EventHandler<'a>>,
        instance: usize,
        event: DmaEvent,
        n: &mut Notifications,
    ) {
        if !self.dma_active {
            return;
        }
        if event == DmaEvent::Error {
            warn!("slave dma channel error");
            self.abort(regs, dma, Error::Failure, n);
            return;
        }
        self.stop_dma(regs, dma);
        match self.direction {
            Direction::Read => {
                if self.tx.remaining() == 0 {
                    n.push(Event::TransmitEmpty);
                }
            }
            Direction::Write => {
                if self.rx.remaining() == 0 && !self.refill_receive(handler, instance) {
                    n.push(Event::ReceiveFull);
                    regs.select_nack();
                }
            }
        }
    }

    fn stop_dma<H: Registers, D: DmaChannel>(&mut self, regs: &mut H, dma: Option<&mut D>) {
        if let Some(dma) = dma {
            let moved = self.dma_len - dma.remaining();
            dma.stop();
            match self.direction {
                Direction::Read => self.tx.skip(moved),
                Direction::Write => self.rx.advance(moved),
            }
        }
        regs.disable_dma();
        self.dma_active = false;
    }

    fn stopped<H: Registers, D: DmaChannel>(
        &mut self,
        regs: &mut H,
        dma: Option<&mut D>,
        n: &mut Notifications,
    ) {
        if self.dma_active {
            self.stop_dma(regs, dma);
        }
        if !self.in_progress {
            return;
        }
        self.in_progress = false;
        let result = self.result;
        debug!("slave transfer done: {}", result);
        regs.select_receive();
        regs.select_ack();
        if self.always_listen {
            n.push(Event::TransferDone(result));
        } else {
            self.listening = false;
            regs.disable_interrupt();
            self.release_buffers();
            n.end(result);
        }
    }

    /// Stop listening, shutting off interrupts and DMA before the context
    /// is torn down. Returns `false` if the slave was not listening.
    pub(crate) fn abort<H: Registers, D: DmaChannel>(
        &mut self,
        regs: &mut H,
        dma: Option<&mut D>,
        reason: Error,
        n: &mut Notifications,
    ) -> bool {
        if !self.listening {
            return false;
        }
        warn!("slave transfer aborted: {}", reason);
        regs.disable_interrupt();
        if self.dma_active {
            self.stop_dma(regs, dma);
        }
        self.listening = false;
        self.in_progress = false;
        self.result = Err(reason);
        self.release_buffers();
        n.end(Err(reason));
        true
    }

    fn release_buffers(&mut self) {
        self.tx = TxCursor::empty();
        if !self.keep {
            self.rx = RxCursor::empty();
        }
    }
}
