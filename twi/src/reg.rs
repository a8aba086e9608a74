//! Register-level primitives
//!
//! Every method of [`Registers`] has exactly one documented hardware effect
//! and completes in bounded time. Nothing in here knows about the bus
//! protocol; callers interpret [`Status`] bits themselves.

use bitfield::bitfield;
use vcell::VolatileCell;

/// Memory layout of one bus instance
#[repr(C)]
pub struct RegisterBlock {
    /// 0x00: own (slave) address
    pub addr: VolatileCell<u32>,
    /// 0x04: clock divider fields
    pub freq: VolatileCell<u32>,
    /// 0x08: control
    pub ctrl: VolatileCell<u32>,
    /// 0x0C: status, flags marked W1C are cleared by writing a 1
    pub status: VolatileCell<u32>,
    /// 0x10: data, the low byte is shifted onto / off the wire
    pub data: VolatileCell<u32>,
}

bitfield! {
    /// Control register
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct Control(u32);
    impl Debug;
    /// Module enable
    pub enable, set_enable: 7;
    /// Bus interrupt enable
    pub interrupt_enable, set_interrupt_enable: 6;
    /// Master mode. A 0 to 1 transition generates a start condition, a 1 to 0
    /// transition a stop condition.
    pub master, set_master: 5;
    /// Transmit direction (1) or receive direction (0)
    pub transmit, set_transmit: 4;
    /// Respond to the next received byte with NACK
    pub nack, set_nack: 3;
    /// Generate a repeated start (self-clearing)
    pub repeated_start, set_repeated_start: 2;
    /// Route byte requests to the DMA channel
    pub dma_enable, set_dma_enable: 1;
    /// Wake the system up on own address match
    pub wakeup_enable, set_wakeup_enable: 0;
}

bitfield! {
    /// Status register
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct Status(u32);
    impl Debug;
    /// Core ready to accept a new start condition
    pub ready, _: 9;
    /// Start condition acknowledged by the core (W1C)
    pub start_detected, set_start_detected: 8;
    /// Byte transfer complete
    pub transfer_complete, _: 7;
    /// Addressed as slave
    pub addressed, _: 6;
    /// Bus busy, between a start and a stop condition
    pub bus_busy, _: 5;
    /// Arbitration lost (W1C)
    pub arbitration_lost, set_arbitration_lost: 4;
    /// Stop condition detected (W1C)
    pub stop_detected, set_stop_detected: 3;
    /// Slave read/write: the remote master requests to read from this slave
    pub slave_read, _: 2;
    /// Byte done interrupt flag (W1C)
    pub byte_done, set_byte_done: 1;
    /// No acknowledge was received for the last byte transmitted
    pub nack_received, _: 0;
}

bitfield! {
    /// Divider register
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct Divider(u32);
    impl Debug;
    /// Sample divisor
    pub u8, sample, set_sample: 7, 0;
    /// Step divisor
    pub u8, step, set_step: 11, 8;
}

bitfield! {
    /// Own address register
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct OwnAddress(u32);
    impl Debug;
    /// Slave address, 7 or 10 significant bits
    pub u16, address, set_address: 9, 0;
    /// Match 10-bit addresses
    pub ten_bit, set_ten_bit: 15;
}

/// Hardware capabilities of one bus instance
///
/// Implemented by [`Mmio`] for real hardware. Each method maps to exactly one
/// hardware effect.
pub trait Registers {
    /// Enable the module.
    fn enable_module(&mut self);
    /// Disable the module. Divider fields may only change while disabled.
    fn disable_module(&mut self);
    /// Enter master mode, which asserts a start condition.
    fn generate_start(&mut self);
    /// Assert a repeated start while already owning the bus.
    fn generate_repeated_start(&mut self);
    /// Leave master mode, which asserts a stop condition.
    fn generate_stop(&mut self);
    /// Select transmit direction.
    fn select_transmit(&mut self);
    /// Select receive direction.
    fn select_receive(&mut self);
    /// Acknowledge the next received byte.
    fn select_ack(&mut self);
    /// Do not acknowledge the next received byte.
    fn select_nack(&mut self);
    /// Load a byte into the data register, starting its transmission.
    fn write_data(&mut self, byte: u8);
    /// Read the data register. In receive direction this starts clocking the
    /// next byte in.
    fn read_data(&mut self) -> u8;
    /// Switch to transmit direction and read the data register, so no
    /// further byte is clocked in.
    fn read_last_byte(&mut self) -> u8;
    /// Clear the byte done flag.
    fn clear_byte_done(&mut self);
    /// Clear the arbitration lost flag.
    fn clear_arbitration_lost(&mut self);
    /// Clear the stop detected flag.
    fn clear_stop_detected(&mut self);
    /// Clear the start detected flag.
    fn clear_start_detected(&mut self);
    /// Enable the bus interrupt.
    fn enable_interrupt(&mut self);
    /// Disable the bus interrupt.
    fn disable_interrupt(&mut self);
    /// Route byte requests to DMA.
    fn enable_dma(&mut self);
    /// Stop routing byte requests to DMA.
    fn disable_dma(&mut self);
    /// Enable or disable wakeup on own address match.
    fn set_wakeup(&mut self, enabled: bool);
    /// Program the own (slave) address.
    fn set_own_address(&mut self, address: OwnAddress);
    /// Program the divider fields.
    fn set_dividers(&mut self, divider: Divider);
    /// Read back the divider fields.
    fn dividers(&self) -> Divider;
    /// Read the status register.
    fn status(&self) -> Status;
    /// Address of the data register, for DMA programming.
    fn data_register(&self) -> *mut u8;
}

const W1C_MASK: u32 = (1 << 8) | (1 << 4) | (1 << 3) | (1 << 1);

/// Memory mapped [`Registers`] implementation
pub struct Mmio {
    regs: *const RegisterBlock,
}

// Safety: `Mmio` is the sole owner of its register block, see `Mmio::new`.
unsafe impl Send for Mmio {}

impl Mmio {
    /// # Safety
    /// `address` must point to the register block of a bus instance and no
    /// other code may access that register block while the returned value
    /// exists.
    pub unsafe fn new(address: *const ()) -> Self {
        Self {
            regs: address as *const RegisterBlock,
        }
    }

    fn block(&self) -> &RegisterBlock {
        // Safety: guaranteed valid and exclusively owned by `Mmio::new`.
        unsafe { &*self.regs }
    }

    fn modify_ctrl(&mut self, f: impl FnOnce(&mut Control)) {
        let ctrl = &self.block().ctrl;
        let mut value = Control(ctrl.get());
        f(&mut value);
        ctrl.set(value.0);
    }

    fn clear_flag(&mut self, f: impl FnOnce(&mut Status)) {
        let mut value = Status(0);
        f(&mut value);
        self.block().status.set(value.0 & W1C_MASK);
    }
}

impl Registers for Mmio {
    fn enable_module(&mut self) {
        self.modify_ctrl(|c| c.set_enable(true));
    }

    fn disable_module(&mut self) {
        self.modify_ctrl(|c| c.set_enable(false));
    }

    fn generate_start(&mut self) {
        self.modify_ctrl(|c| c.set_master(true));
    }

    fn generate_repeated_start(&mut self) {
        self.modify_ctrl(|c| c.set_repeated_start(true));
    }

    fn generate_stop(&mut self) {
        self.modify_ctrl(|c| c.set_master(false));
    }

    fn select_transmit(&mut self) {
        self.modify_ctrl(|c| c.set_transmit(true));
    }

    fn select_receive(&mut self) {
        self.modify_ctrl(|c| c.set_transmit(false));
    }

    fn select_ack(&mut self) {
        self.modify_ctrl(|c| c.set_nack(false));
    }

    fn select_nack(&mut self) {
        self.modify_ctrl(|c| c.set_nack(true));
    }

    fn write_data(&mut self, byte: u8) {
        self.block().data.set(u32::from(byte));
    }

    fn read_data(&mut self) -> u8 {
        self.block().data.get() as u8
    }

    fn read_last_byte(&mut self) -> u8 {
        self.modify_ctrl(|c| c.set_transmit(true));
        self.block().data.get() as u8
    }

    fn clear_byte_done(&mut self) {
        self.clear_flag(|s| s.set_byte_done(true));
    }

    fn clear_arbitration_lost(&mut self) {
        self.clear_flag(|s| s.set_arbitration_lost(true));
    }

    fn clear_stop_detected(&mut self) {
        self.clear_flag(|s| s.set_stop_detected(true));
    }

    fn clear_start_detected(&mut self) {
        self.clear_flag(|s| s.set_start_detected(true));
    }

    fn enable_interrupt(&mut self) {
        self.modify_ctrl(|c| c.set_interrupt_enable(true));
    }

    fn disable_interrupt(&mut self) {
        self.modify_ctrl(|c| c.set_interrupt_enable(false));
    }

    fn enable_dma(&mut self) {
        self.modify_ctrl(|c| c.set_dma_enable(true));
    }

    fn disable_dma(&mut self) {
        self.modify_ctrl(|c| c.set_dma_enable(false));
    }

    fn set_wakeup(&mut self, enabled: bool) {
        self.modify_ctrl(|c| c.set_wakeup_enable(enabled));
    }

    fn set_own_address(&mut self, address: OwnAddress) {
        self.block().addr.set(address.0);
    }

    fn set_dividers(&mut self, divider: Divider) {
        self.block().freq.set(divider.0);
    }

    fn dividers(&self) -> Divider {
        Divider(self.block().freq.get())
    }

    fn status(&self) -> Status {
        Status(self.block().status.get())
    }

    fn data_register(&self) -> *mut u8 {
        self.block().data.as_ptr() as *mut u8
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn block() -> RegisterBlock {
        RegisterBlock {
            addr: VolatileCell::new(0),
            freq: VolatileCell::new(0),
            ctrl: VolatileCell::new(0),
            status: VolatileCell::new(0),
            data: VolatileCell::new(0),
        }
    }

    #[test]
    fn divider_fields_do_not_overlap() {
        let mut d = Divider(0);
        d.set_sample(0xff);
        d.set_step(0xf);
        assert_eq!(d.0, 0xfff);
        assert_eq!(d.sample(), 0xff);
        assert_eq!(d.step(), 0xf);
    }

    #[test]
    fn control_primitives_touch_a_single_bit() {
        let block = block();
        let mut mmio = unsafe { Mmio::new(&block as *const _ as *const ()) };
        mmio.enable_module();
        assert_eq!(block.ctrl.get(), 1 << 7);
        mmio.select_transmit();
        mmio.generate_start();
        assert_eq!(block.ctrl.get(), (1 << 7) | (1 << 5) | (1 << 4));
        mmio.generate_stop();
        assert_eq!(block.ctrl.get(), (1 << 7) | (1 << 4));
        mmio.select_nack();
        assert!(Control(block.ctrl.get()).nack());
        mmio.select_ack();
        assert!(!Control(block.ctrl.get()).nack());
    }

    #[test]
    fn read_last_byte_switches_to_transmit() {
        let block = block();
        block.data.set(0x5a);
        let mut mmio = unsafe { Mmio::new(&block as *const _ as *const ()) };
        mmio.select_receive();
        assert_eq!(mmio.read_last_byte(), 0x5a);
        assert!(Control(block.ctrl.get()).transmit());
    }

    #[test]
    fn flag_clears_only_write_their_own_bit() {
        let block = block();
        let mut mmio = unsafe { Mmio::new(&block as *const _ as *const ()) };
        mmio.clear_byte_done();
        assert_eq!(block.status.get(), 1 << 1);
        mmio.clear_arbitration_lost();
        assert_eq!(block.status.get(), 1 << 4);
        mmio.clear_stop_detected();
        assert_eq!(block.status.get(), 1 << 3);
    }
}
