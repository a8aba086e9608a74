#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
//! # TWI
//!
//! ## Overview
//! This crate provides a platform-agnostic transfer engine for the two-wire
//! (I2C compatible) bus controller found on automotive MCUs.
//!
//! It provides the following features:
//!
//! - master transfers with 7-bit and 10-bit addressing, repeated starts and
//!   transfers that keep the bus held for a follow-up
//! - slave transfers, either one-shot or continuously listening
//! - interrupt driven or DMA backed data phases
//! - blocking calls with a deadline, built on an RTOS semaphore
//! - bus rate solving over the controller's two divider fields
//! - an [`embedded_hal::i2c::I2c`] implementation for master instances
//!
//! The engine is split into layers. [`reg`] exposes one function per
//! hardware effect, [`sequencer`] builds bounded start/address/stop
//! handshakes out of them, and the state machines driven by the interrupt
//! handler move the data. [`BusManager`] ties the layers together per bus
//! instance and is the only entry point applications use.
//!
//! Platform specifics are reached through the traits of [`twi_core`]: clock
//! gating and reset, the DMA channel of an instance and the semaphore used by
//! blocking calls. Target HALs implement them and route the bus and DMA
//! interrupts to [`BusManager::on_interrupt`] and
//! [`BusManager::on_dma_event`].
//!
//! ## Usage
//!
//! ```no_run
//! use twi::address::Address;
//! use twi::bus::{BusManager, Peripherals};
//! use twi::config::MasterConfig;
//! use twi::core::fugit::{ExtU32, RateExtU32};
//! use twi::core::{Clocks, NoDma, Semaphore};
//! use twi::generic_array::typenum::U2;
//! use twi::reg::Mmio;
//!
//! # struct Clock;
//! # impl Clocks for Clock {
//! #     fn enable(&mut self) {}
//! #     fn disable(&mut self) {}
//! #     fn soft_reset(&mut self) {}
//! #     fn input_clock(&self) -> twi::core::fugit::HertzU32 { 8.MHz() }
//! # }
//! # struct Sem;
//! # impl Semaphore for Sem {
//! #     fn clear(&self) {}
//! #     fn post(&self) {}
//! #     fn wait(&self, _: twi::core::fugit::MillisDurationU32) -> bool { true }
//! # }
//! let manager: BusManager<'static, Mmio, Clock, NoDma, Sem, U2> = BusManager::new(|_| Sem);
//! let peripherals = Peripherals {
//!     // Safety: the address is the register block of instance 0
//!     regs: unsafe { Mmio::new(0x4000_6000 as *const ()) },
//!     clocks: Clock,
//!     dma: None,
//! };
//! manager
//!     .init_master(0, peripherals, MasterConfig::new(100.kHz(), Address::Seven(0x50)))
//!     .unwrap();
//!
//! let mut id = [0u8; 2];
//! manager
//!     .master_write_read(0, &[0x0F], &mut id, 10.millis())
//!     .unwrap();
//! ```

#[macro_use]
mod fmt;

pub mod address;
mod blocking;
mod buffer;
pub mod bus;
pub mod config;
pub mod event;
pub mod hal;
mod master;
pub mod reg;
pub mod sequencer;
mod slave;
#[cfg(test)]
mod sim;
pub mod timing;

pub use bus::{BusManager, Error};
pub use embedded_hal;
pub use generic_array;
pub use slave::FILLER;
pub use twi_core as core;
