#![no_std]
#![warn(missing_docs)]

//! Collaborator traits of the [`twi`] transfer engine.
//!
//! The engine never touches clock controllers, DMA controllers or the
//! scheduler itself. Whatever crate brings up a particular MCU (or RTOS port)
//! hands it three objects per bus instance:
//!
//! - [`Clocks`]: gates the peripheral clock, pulses the soft reset and tells
//!   the input frequency the divider solver works from
//! - [`DmaChannel`]: moves bytes between the bus data register and memory
//! - [`Semaphore`]: parks the caller of a blocking transfer until the
//!   interrupt handler reports the end of the transfer
//!
//! Application code normally only picks these up from its platform crate.
//! [`DmaChannel`] is an `unsafe` trait: the engine hands it raw buffer
//! pointers, and an implementation has to honour the contract documented on
//! the trait for the resulting transfers to be sound.
//!
//! [`twi`]: <https://docs.rs/crate/twi/>

pub use fugit;

/// Clock management of a single bus instance
///
/// Structs implementing [`Clocks`] should be constructible only when it is
/// safe and sound to interact with the bus peripheral (pins are routed, the
/// clock tree feeding the peripheral is configured) and be a singleton per bus
/// instance.
///
/// # Example
/// ```no_run
/// use fugit::HertzU32;
///
/// pub struct PeripheralClock {
///     gate: *mut u32,
///     bit: u32,
///     frequency: HertzU32,
/// }
///
/// impl twi_core::Clocks for PeripheralClock {
///     fn enable(&mut self) {
///         unsafe { self.gate.write_volatile(self.gate.read_volatile() | self.bit) }
///     }
///     fn disable(&mut self) {
///         unsafe { self.gate.write_volatile(self.gate.read_volatile() & !self.bit) }
///     }
///     fn soft_reset(&mut self) {
///         self.disable();
///         self.enable();
///     }
///     fn input_clock(&self) -> HertzU32 {
///         self.frequency
///     }
/// }
/// ```
pub trait Clocks {
    /// Ungate the peripheral clock.
    fn enable(&mut self);
    /// Gate the peripheral clock.
    fn disable(&mut self);
    /// Put the peripheral through a reset cycle, restoring register defaults.
    fn soft_reset(&mut self);
    /// Frequency of the clock feeding the bus divider chain.
    ///
    /// Must not change while the owning bus instance is initialized.
    fn input_clock(&self) -> fugit::HertzU32;
}

/// Direction of a DMA transfer, from the point of view of memory
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DmaDirection {
    /// Memory is read and bytes are written into the bus data register
    MemoryToPeripheral,
    /// The bus data register is read and bytes are stored into memory
    PeripheralToMemory,
}

/// Description of a single block transfer handed to a [`DmaChannel`]
#[derive(Copy, Clone, Debug)]
pub struct DmaTransfer {
    /// Which way the bytes flow
    pub direction: DmaDirection,
    /// First byte of the memory side. Only read from when `direction` is
    /// [`DmaDirection::MemoryToPeripheral`].
    pub memory: *mut u8,
    /// Address of the bus data register
    pub peripheral: *mut u8,
    /// Number of bytes to move
    pub len: usize,
}

/// Outcome reported by the platform's DMA interrupt for a bus instance
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DmaEvent {
    /// All bytes of the programmed transfer were moved
    Complete,
    /// The channel reported a bus or configuration error
    Error,
}

/// A DMA channel bound to one bus instance
///
/// The completion interrupt of the channel is expected to be routed by the
/// target HAL to `twi::bus::BusManager::on_dma_event` for the owning bus
/// instance.
///
/// # Safety
/// - the channel must only touch the memory described by the last
///   [`DmaTransfer`] passed to [`DmaChannel::configure`], and only between
///   [`DmaChannel::start`] and the point where it reports completion or
///   [`DmaChannel::stop`] returns
/// - once [`DmaChannel::stop`] returns, no further memory access and no
///   further completion report may happen for the stopped transfer
pub unsafe trait DmaChannel {
    /// Program the channel. The channel must be idle.
    fn configure(&mut self, transfer: &DmaTransfer);
    /// Start the programmed transfer.
    fn start(&mut self);
    /// Stop the channel, discarding any outstanding bytes.
    fn stop(&mut self);
    /// Number of bytes of the programmed transfer not yet moved.
    fn remaining(&self) -> usize;
}

/// Counting semaphore provided by the RTOS
///
/// The engine posts from interrupt context and waits from task context, so
/// `post` must be callable from an interrupt handler.
pub trait Semaphore {
    /// Drop all pending counts.
    fn clear(&self);
    /// Increment the count, waking a waiter if there is one.
    fn post(&self);
    /// Wait until the count is non-zero and decrement it. Returns `false` if
    /// `timeout` elapsed first.
    fn wait(&self, timeout: fugit::MillisDurationU32) -> bool;
}

/// Placeholder channel for instances that never use DMA
///
/// The type is uninhabited, so `Option<NoDma>` is always `None`.
#[derive(Debug)]
pub enum NoDma {}

// Safety: no value of `NoDma` can exist, so none of the methods can run.
unsafe impl DmaChannel for NoDma {
    fn configure(&mut self, _: &DmaTransfer) {
        match *self {}
    }
    fn start(&mut self) {
        match *self {}
    }
    fn stop(&mut self) {
        match *self {}
    }
    fn remaining(&self) -> usize {
        match *self {}
    }
}
