//! Bus manager
//!
//! [`BusManager`] owns one [`Slot`] per bus instance. A slot holds the
//! peripherals of an initialized instance together with its master or slave
//! context, guarded by a critical section, plus the lock-free handshake
//! fields: the `idle` flag that gates starting a transfer and the `blocking`
//! flag that tells the end-of-transfer path to hand its result to a waiting
//! caller and post the semaphore.
//!
//! All methods take `&self`, so the manager can live in a `static` and be
//! shared between tasks and the interrupt handlers wired to
//! [`BusManager::on_interrupt`] and [`BusManager::on_dma_event`].

use crate::address::{Address, Direction};
use crate::blocking::run_blocking;
use crate::buffer::{RxCursor, TxCursor};
use crate::config::{MasterConfig, SlaveConfig, Transport};
use crate::event::{EventHandler, Notifications};
use crate::master::MasterContext;
use crate::reg::Registers;
use crate::slave::SlaveContext;
use crate::timing::{Dividers, TimingError};
use core::cell::{Cell, RefCell};
use core::fmt::{self, Debug};
use core::sync::atomic::{AtomicBool, Ordering};
use critical_section::{CriticalSection, Mutex};
use fugit::{HertzU32, MillisDurationU32};
use generic_array::{sequence::GenericSequence, ArrayLength, GenericArray};
use twi_core::{Clocks, DmaChannel, DmaEvent, Semaphore};

/// Result codes of bus operations
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The hardware did not complete a handshake in time
    Failure,
    /// A transfer is already in flight on the instance
    Busy,
    /// A blocking call's deadline passed before the transfer ended
    Timeout,
    /// The addressed device did not acknowledge
    Nack,
    /// A remote master read more bytes than the slave had to send
    TxUnderrun,
    /// A remote master wrote more bytes than the slave could store
    RxOverrun,
    /// Another master won the bus
    ArbitrationLost,
    /// The transfer was cancelled
    Aborted,
    /// The instance has not been initialized
    NotInitialized,
    /// The operation does not match the instance's role
    WrongRole,
    /// No such instance
    InvalidInstance,
    /// An argument is out of range, e.g. an empty receive buffer
    InvalidArgument,
}

impl embedded_hal::i2c::Error for Error {
    fn kind(&self) -> embedded_hal::i2c::ErrorKind {
        use embedded_hal::i2c::{ErrorKind, NoAcknowledgeSource};
        match self {
            Error::Nack => ErrorKind::NoAcknowledge(NoAcknowledgeSource::Unknown),
            Error::ArbitrationLost => ErrorKind::ArbitrationLoss,
            Error::TxUnderrun | Error::RxOverrun => ErrorKind::Overrun,
            _ => ErrorKind::Other,
        }
    }
}

/// Errors that may occur during configuration
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigurationError {
    /// Problems with the requested bus rate
    Timing(TimingError),
    /// No such instance
    InvalidInstance,
    /// The instance is already initialized
    AlreadyInitialized,
    /// The instance has not been initialized
    NotInitialized,
    /// DMA transport was requested without a DMA channel
    MissingDmaChannel,
    /// The address does not fit its width
    InvalidAddress,
    /// A transfer is in flight
    Busy,
}

impl From<TimingError> for ConfigurationError {
    fn from(value: TimingError) -> Self {
        Self::Timing(value)
    }
}

/// Hardware owned by an initialized instance
pub struct Peripherals<H, C, D> {
    /// Register access
    pub regs: H,
    /// Clock management
    pub clocks: C,
    /// DMA channel, required for [`Transport::Dma`]
    pub dma: Option<D>,
}

/// Failed initialization, handing the peripherals back
pub struct Rejected<H, C, D> {
    /// Why the instance was not initialized
    pub error: ConfigurationError,
    /// The peripherals passed in
    pub peripherals: Peripherals<H, C, D>,
}

impl<H, C, D> Debug for Rejected<H, C, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

/// State of the current or last transfer
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransferState {
    /// Still in flight
    Busy,
    /// Ended with the contained result
    Done(Result<(), Error>),
}

/// Snapshot returned by [`BusManager::master_status`] and
/// [`BusManager::slave_status`]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransferStatus {
    /// Bytes not yet moved
    pub remaining: usize,
    /// Busy or done
    pub state: TransferState,
}

impl TransferStatus {
    /// [`nb::Error::WouldBlock`] while the transfer is in flight, its result
    /// afterwards
    pub fn poll(self) -> nb::Result<(), Error> {
        match self.state {
            TransferState::Busy => Err(nb::Error::WouldBlock),
            TransferState::Done(result) => result.map_err(nb::Error::Other),
        }
    }
}

enum Role {
    Master(MasterContext),
    Slave(SlaveContext),
}

struct Bound<H, C, D> {
    regs: H,
    clocks: C,
    dma: Option<D>,
    role: Role,
}

/// Storage of one bus instance inside a [`BusManager`]
pub struct Slot<'a, H, C, D, S> {
    idle: AtomicBool,
    blocking: AtomicBool,
    semaphore: S,
    /// Result of the transfer a blocking call waited for
    outcome: Mutex<Cell<Result<(), Error>>>,
    handler: Mutex<Cell<Option<&'a dyn EventHandler<'a>>>>,
    bound: Mutex<RefCell<Option<Bound<H, C, D>>>>,
}

impl<'a, H, C, D, S> Slot<'a, H, C, D, S> {
    fn new(semaphore: S) -> Self {
        Self {
            idle: AtomicBool::new(true),
            blocking: AtomicBool::new(false),
            semaphore,
            outcome: Mutex::new(Cell::new(Ok(()))),
            handler: Mutex::new(Cell::new(None)),
            bound: Mutex::new(RefCell::new(None)),
        }
    }

    /// Flip `idle` to busy, the only way a transfer may start
    fn claim(&self) -> Result<(), Error> {
        self.idle
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| Error::Busy)
    }

    fn is_idle(&self) -> bool {
        self.idle.load(Ordering::Acquire)
    }

    /// Book the end of a transfer. The first transfer to end while a
    /// blocking call waits stores its result for that call and consumes the
    /// `blocking` flag, so a transfer started from an event handler cannot
    /// overwrite it. Returns whether the waiting call has to be woken.
    fn settle(&self, cs: CriticalSection<'_>, n: &Notifications) -> bool {
        let Some(result) = n.ended else {
            return false;
        };
        self.idle.store(true, Ordering::Release);
        if !self.blocking.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.outcome.borrow(cs).set(result);
        true
    }

    /// Result stored by [`Slot::settle`]
    fn outcome(&self) -> Result<(), Error> {
        critical_section::with(|cs| self.outcome.borrow(cs).get())
    }
}

type Handler<'a> = Option<&'a dyn EventHandler<'a>>;

/// Place of a receive in a run of receives sharing one address phase
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct Chain {
    /// Pick up from the previous part instead of addressing the target
    pub(crate) resume: bool,
    /// Bytes the parts after this one take
    pub(crate) more: usize,
}

/// Table of bus instances
///
/// `N` is the number of instances, e.g. `generic_array::typenum::U2`.
pub struct BusManager<'a, H, C, D, S, N>
where
    N: ArrayLength<Slot<'a, H, C, D, S>>,
{
    slots: GenericArray<Slot<'a, H, C, D, S>, N>,
}

impl<'a, H, C, D, S, N> BusManager<'a, H, C, D, S, N>
where
    H: Registers,
    C: Clocks,
    D: DmaChannel,
    S: Semaphore,
    N: ArrayLength<Slot<'a, H, C, D, S>>,
{
    /// Create a manager with all instances uninitialized. `semaphore` is
    /// called once per instance.
    pub fn new(mut semaphore: impl FnMut(usize) -> S) -> Self {
        Self {
            slots: GenericArray::generate(|i| Slot::new(semaphore(i))),
        }
    }

    /// Number of instances
    pub fn instances(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, instance: usize) -> Result<&Slot<'a, H, C, D, S>, Error> {
        self.slots.get(instance).ok_or(Error::InvalidInstance)
    }

    /// Run `f` on the locked instance and act on the notifications it
    /// collected once the lock is released.
    fn run<R>(
        &self,
        instance: usize,
        f: impl FnOnce(&Slot<'a, H, C, D, S>, &mut Bound<H, C, D>, Handler<'a>, &mut Notifications) -> Result<R, Error>,
    ) -> Result<R, Error> {
        let slot = self.slot(instance)?;
        let mut n = Notifications::new();
        let (result, handler, wake) = critical_section::with(|cs| {
            let handler = slot.handler.borrow(cs).get();
            let mut bound = slot.bound.borrow_ref_mut(cs);
            let result = match bound.as_mut() {
                Some(bound) => f(slot, bound, handler, &mut n),
                None => Err(Error::NotInitialized),
            };
            (result, handler, slot.settle(cs, &n))
        });
        self.notify(instance, slot, handler, &n, wake);
        result
    }

    fn notify(
        &self,
        instance: usize,
        slot: &Slot<'a, H, C, D, S>,
        handler: Handler<'a>,
        n: &Notifications,
        wake: bool,
    ) {
        if wake {
            slot.semaphore.post();
        }
        if let Some(handler) = handler {
            for event in n.events() {
                handler.on_event(instance, event);
            }
        }
    }

    fn master<R>(
        &self,
        instance: usize,
        f: impl FnOnce(&Slot<'a, H, C, D, S>, &mut H, Option<&mut D>, &mut MasterContext, &mut Notifications) -> Result<R, Error>,
    ) -> Result<R, Error> {
        self.run(instance, |slot, bound, _, n| {
            let Bound { regs, dma, role, .. } = bound;
            match role {
                Role::Master(ctx) => f(slot, regs, dma.as_mut(), ctx, n),
                Role::Slave(_) => Err(Error::WrongRole),
            }
        })
    }

    fn slave<R>(
        &self,
        instance: usize,
        f: impl FnOnce(&Slot<'a, H, C, D, S>, &mut H, Option<&mut D>, &mut SlaveContext, &mut Notifications) -> Result<R, Error>,
    ) -> Result<R, Error> {
        self.run(instance, |slot, bound, _, n| {
            let Bound { regs, dma, role, .. } = bound;
            match role {
                Role::Slave(ctx) => f(slot, regs, dma.as_mut(), ctx, n),
                Role::Master(_) => Err(Error::WrongRole),
            }
        })
    }

    fn init(
        &self,
        instance: usize,
        mut peripherals: Peripherals<H, C, D>,
        transport: Transport,
        setup: impl FnOnce(&mut H, &mut C) -> Result<(Role, bool), ConfigurationError>,
    ) -> Result<(), Rejected<H, C, D>> {
        let Some(slot) = self.slots.get(instance) else {
            return Err(Rejected {
                error: ConfigurationError::InvalidInstance,
                peripherals,
            });
        };
        if transport == Transport::Dma && peripherals.dma.is_none() {
            return Err(Rejected {
                error: ConfigurationError::MissingDmaChannel,
                peripherals,
            });
        }
        critical_section::with(|cs| {
            let mut bound = slot.bound.borrow_ref_mut(cs);
            if bound.is_some() {
                return Err(Rejected {
                    error: ConfigurationError::AlreadyInitialized,
                    peripherals,
                });
            }
            peripherals.clocks.enable();
            peripherals.clocks.soft_reset();
            match setup(&mut peripherals.regs, &mut peripherals.clocks) {
                Ok((role, idle)) => {
                    let Peripherals { regs, clocks, dma } = peripherals;
                    slot.idle.store(idle, Ordering::Release);
                    *bound = Some(Bound {
                        regs,
                        clocks,
                        dma,
                        role,
                    });
                    Ok(())
                }
                Err(error) => {
                    peripherals.clocks.disable();
                    Err(Rejected { error, peripherals })
                }
            }
        })
    }

    /// Initialize `instance` as bus master.
    pub fn init_master(
        &self,
        instance: usize,
        peripherals: Peripherals<H, C, D>,
        config: MasterConfig,
    ) -> Result<(), Rejected<H, C, D>> {
        self.init(instance, peripherals, config.transport, |regs, clocks| {
            if !config.target.is_valid() {
                return Err(ConfigurationError::InvalidAddress);
            }
            let dividers = Dividers::solve(config.rate, clocks.input_clock())?;
            regs.disable_module();
            regs.set_dividers(dividers.into());
            regs.enable_module();
            debug!(
                "master {=usize} up, step {=u8} sample {=u8}",
                instance,
                dividers.step,
                dividers.sample
            );
            Ok((
                Role::Master(MasterContext::new(config.target, config.transport)),
                true,
            ))
        })
    }

    /// Initialize `instance` as bus slave.
    ///
    /// An always-listening slave is armed right away and stays armed until
    /// [`BusManager::slave_abort`], a DMA channel failure or
    /// [`BusManager::deinit`]. [`BusManager::slave_send`] and
    /// [`BusManager::slave_receive`] arm it again.
    pub fn init_slave(
        &self,
        instance: usize,
        peripherals: Peripherals<H, C, D>,
        config: SlaveConfig,
    ) -> Result<(), Rejected<H, C, D>> {
        self.init(instance, peripherals, config.transport, |regs, _| {
            if !config.address.is_valid() {
                return Err(ConfigurationError::InvalidAddress);
            }
            regs.set_own_address(config.address.own_address());
            regs.set_wakeup(config.wakeup_on_match);
            regs.enable_module();
            let mut ctx = SlaveContext::new(config.address, config.transport, config.always_listen);
            if config.always_listen {
                ctx.arm(regs, Direction::Write);
            }
            debug!("slave {=usize} up", instance);
            Ok((Role::Slave(ctx), !config.always_listen))
        })
    }

    /// Tear `instance` down and hand its peripherals back.
    ///
    /// A transfer in flight is aborted first.
    pub fn deinit(&self, instance: usize) -> Result<Peripherals<H, C, D>, Error> {
        let slot = self.slot(instance)?;
        let (bound, handler) = critical_section::with(|cs| {
            (
                slot.bound.borrow_ref_mut(cs).take(),
                slot.handler.borrow(cs).get(),
            )
        });
        let Bound {
            mut regs,
            mut clocks,
            mut dma,
            role,
        } = bound.ok_or(Error::NotInitialized)?;
        let mut n = Notifications::new();
        match role {
            Role::Master(mut ctx) => {
                ctx.abort(&mut regs, dma.as_mut(), Error::Aborted, &mut n);
                ctx.release_bus(&mut regs);
            }
            Role::Slave(mut ctx) => {
                ctx.abort(&mut regs, dma.as_mut(), Error::Aborted, &mut n);
            }
        }
        regs.disable_interrupt();
        regs.disable_module();
        clocks.disable();
        let wake = critical_section::with(|cs| slot.settle(cs, &n));
        slot.idle.store(true, Ordering::Release);
        self.notify(instance, slot, handler, &n, wake);
        debug!("instance {=usize} down", instance);
        Ok(Peripherals { regs, clocks, dma })
    }

    /// Change the bus rate, returning the rate actually achieved.
    pub fn set_rate(&self, instance: usize, rate: HertzU32) -> Result<HertzU32, ConfigurationError> {
        let slot = self
            .slots
            .get(instance)
            .ok_or(ConfigurationError::InvalidInstance)?;
        critical_section::with(|cs| {
            let mut bound = slot.bound.borrow_ref_mut(cs);
            let bound = bound.as_mut().ok_or(ConfigurationError::NotInitialized)?;
            if !slot.is_idle() {
                return Err(ConfigurationError::Busy);
            }
            let input = bound.clocks.input_clock();
            let dividers = Dividers::solve(rate, input)?;
            bound.regs.disable_module();
            bound.regs.set_dividers(dividers.into());
            bound.regs.enable_module();
            Ok(dividers.rate(input))
        })
    }

    /// Current bus rate, derived from the divider fields.
    pub fn rate(&self, instance: usize) -> Result<HertzU32, Error> {
        self.run(instance, |_, bound, _, _| {
            let dividers = Dividers::from(bound.regs.dividers());
            Ok(dividers.rate(bound.clocks.input_clock()))
        })
    }

    /// Install or remove the event handler of `instance`.
    pub fn set_event_handler(&self, instance: usize, handler: Handler<'a>) -> Result<(), Error> {
        let slot = self.slot(instance)?;
        critical_section::with(|cs| slot.handler.borrow(cs).set(handler));
        Ok(())
    }

    /// Shared interrupt entry of `instance`
    pub fn on_interrupt(&self, instance: usize) {
        let _ = self.run(instance, |_, bound, handler, n| {
            let Bound { regs, dma, role, .. } = bound;
            match role {
                Role::Master(ctx) => ctx.on_interrupt(regs, dma.as_mut(), n),
                Role::Slave(ctx) => ctx.on_interrupt(regs, dma.as_mut(), handler, instance, n),
            }
            Ok(())
        });
    }

    /// Completion interrupt of the DMA channel bound to `instance`
    pub fn on_dma_event(&self, instance: usize, event: DmaEvent) {
        let _ = self.run(instance, |_, bound, handler, n| {
            let Bound { regs, dma, role, .. } = bound;
            match role {
                Role::Master(ctx) => ctx.on_dma_event(regs, dma.as_mut(), event, n),
                Role::Slave(ctx) => ctx.on_dma_event(regs, dma.as_mut(), handler, instance, event, n),
            }
            Ok(())
        });
    }

    fn start_send(&self, instance: usize, data: TxCursor, stop: bool, resume: bool) -> Result<(), Error> {
        self.master(instance, |slot, regs, dma, ctx, n| {
            slot.claim()?;
            if !resume {
                ctx.start_send(regs, dma, data, stop, n);
            } else if ctx.can_continue(Direction::Write) {
                ctx.continue_send(regs, dma, data, stop, n);
            } else {
                slot.idle.store(true, Ordering::Release);
                return Err(Error::InvalidArgument);
            }
            if ctx.is_busy() {
                Ok(())
            } else {
                ctx.result
            }
        })
    }

    fn start_receive(
        &self,
        instance: usize,
        buffer: RxCursor,
        stop: bool,
        keep: bool,
        chain: Chain,
    ) -> Result<(), Error> {
        if buffer.len() == 0 {
            return Err(Error::InvalidArgument);
        }
        self.master(instance, |slot, regs, dma, ctx, n| {
            slot.claim()?;
            if !chain.resume {
                ctx.start_receive(regs, dma, buffer, stop, chain.more, keep, n);
            } else if ctx.can_continue(Direction::Read) {
                ctx.continue_receive(regs, buffer, stop, chain.more, n);
            } else {
                slot.idle.store(true, Ordering::Release);
                return Err(Error::InvalidArgument);
            }
            if ctx.is_busy() {
                Ok(())
            } else {
                ctx.result
            }
        })
    }

    /// Start sending `data` to the target device.
    ///
    /// Returns once the address phase is through; the rest is reported by
    /// [`Event::TransferDone`](crate::event::Event::TransferDone) and
    /// [`BusManager::master_status`]. Without `stop` the bus stays held and
    /// the next transfer begins with a repeated start. An address phase that
    /// fails is reported right away.
    pub fn master_send(&self, instance: usize, data: &'a [u8], stop: bool) -> Result<(), Error> {
        self.start_send(instance, TxCursor::new(data), stop, false)
    }

    /// Start receiving `buffer.len()` bytes from the target device.
    ///
    /// The filled buffer is handed back by [`BusManager::take_received`].
    pub fn master_receive(&self, instance: usize, buffer: &'a mut [u8], stop: bool) -> Result<(), Error> {
        self.start_receive(instance, RxCursor::new(buffer), stop, true, Chain::default())
    }

    /// Send `data` and wait for the transfer to end.
    pub fn master_send_blocking(
        &self,
        instance: usize,
        data: &[u8],
        stop: bool,
        timeout: MillisDurationU32,
    ) -> Result<(), Error> {
        let slot = self.slot(instance)?;
        run_blocking(
            &slot.semaphore,
            &slot.blocking,
            timeout,
            || self.start_send(instance, TxCursor::new(data), stop, false),
            || self.abort_master(instance, Error::Timeout),
            || slot.outcome(),
        )
    }

    /// [`BusManager::master_send_blocking`] carrying on the data phase of a
    /// send that ended without a stop, with no new address phase
    pub(crate) fn master_continue_send_blocking(
        &self,
        instance: usize,
        data: &[u8],
        stop: bool,
        timeout: MillisDurationU32,
    ) -> Result<(), Error> {
        let slot = self.slot(instance)?;
        run_blocking(
            &slot.semaphore,
            &slot.blocking,
            timeout,
            || self.start_send(instance, TxCursor::new(data), stop, true),
            || self.abort_master(instance, Error::Timeout),
            || slot.outcome(),
        )
    }

    /// Fill `buffer` and wait for the transfer to end.
    pub fn master_receive_blocking(
        &self,
        instance: usize,
        buffer: &mut [u8],
        stop: bool,
        timeout: MillisDurationU32,
    ) -> Result<(), Error> {
        let slot = self.slot(instance)?;
        run_blocking(
            &slot.semaphore,
            &slot.blocking,
            timeout,
            || self.start_receive(instance, RxCursor::new(buffer), stop, false, Chain::default()),
            || self.abort_master(instance, Error::Timeout),
            || slot.outcome(),
        )
    }

    /// Fill `buffer` as one part of a longer receive and wait for it.
    pub(crate) fn master_receive_part_blocking(
        &self,
        instance: usize,
        buffer: &mut [u8],
        chain: Chain,
        stop: bool,
        timeout: MillisDurationU32,
    ) -> Result<(), Error> {
        let slot = self.slot(instance)?;
        run_blocking(
            &slot.semaphore,
            &slot.blocking,
            timeout,
            || self.start_receive(instance, RxCursor::new(buffer), stop, false, chain),
            || self.abort_master(instance, Error::Timeout),
            || slot.outcome(),
        )
    }

    /// Send `data`, then read into `buffer` after a repeated start, ending
    /// with a stop. `timeout` applies to each of the two phases.
    pub fn master_write_read(
        &self,
        instance: usize,
        data: &[u8],
        buffer: &mut [u8],
        timeout: MillisDurationU32,
    ) -> Result<(), Error> {
        self.master_send_blocking(instance, data, false, timeout)?;
        self.master_receive_blocking(instance, buffer, true, timeout)
    }

    fn abort_master(&self, instance: usize, reason: Error) -> bool {
        self.master(instance, |_, regs, dma, ctx, n| Ok(ctx.abort(regs, dma, reason, n)))
            .unwrap_or(false)
    }

    /// Cancel the master transfer in flight.
    ///
    /// With nothing in flight, a bus still held by a transfer that ended
    /// without a stop is released.
    pub fn master_abort(&self, instance: usize) -> Result<(), Error> {
        self.master(instance, |_, regs, dma, ctx, n| {
            if !ctx.abort(regs, dma, Error::Aborted, n) {
                ctx.release_bus(regs);
            }
            Ok(())
        })
    }

    /// Progress of the current or last master transfer
    pub fn master_status(&self, instance: usize) -> Result<TransferStatus, Error> {
        self.master(instance, |_, _, _, ctx, _| {
            Ok(TransferStatus {
                remaining: ctx.remaining(),
                state: if ctx.is_busy() {
                    TransferState::Busy
                } else {
                    TransferState::Done(ctx.result)
                },
            })
        })
    }

    /// Hand back the buffer of the last [`BusManager::master_receive`].
    pub fn take_received(&self, instance: usize) -> Result<Option<&'a mut [u8]>, Error> {
        self.master(instance, |_, _, _, ctx, _| {
            if ctx.is_busy() {
                return Err(Error::Busy);
            }
            // Safety: only `master_receive` keeps its cursor, which was
            // created from a `&'a mut [u8]` and is handed out once.
            Ok(ctx.take_received().and_then(|c| unsafe { c.into_slice() }))
        })
    }

    /// Address subsequent master transfers to `address`.
    pub fn set_target_address(&self, instance: usize, address: Address) -> Result<(), Error> {
        if !address.is_valid() {
            return Err(Error::InvalidArgument);
        }
        self.master(instance, |_, _, _, ctx, _| {
            if ctx.is_busy() {
                return Err(Error::Busy);
            }
            ctx.target = address;
            Ok(())
        })
    }

    /// Replace the slave transmit buffer.
    pub fn slave_set_transmit_buffer(&self, instance: usize, data: &'a [u8]) -> Result<(), Error> {
        self.slave(instance, |_, _, _, ctx, _| {
            ctx.set_transmit_buffer(TxCursor::new(data));
            Ok(())
        })
    }

    /// Replace the slave receive buffer. It is handed back by
    /// [`BusManager::slave_take_received`].
    pub fn slave_set_receive_buffer(&self, instance: usize, buffer: &'a mut [u8]) -> Result<(), Error> {
        self.slave(instance, |_, _, _, ctx, _| {
            ctx.set_receive_buffer(RxCursor::new(buffer), true);
            Ok(())
        })
    }

    fn start_slave(
        &self,
        instance: usize,
        blocking: bool,
        arm: impl FnOnce(&mut H, &mut SlaveContext),
    ) -> Result<(), Error> {
        self.slave(instance, |slot, regs, _, ctx, _| {
            if ctx.always_listen {
                // Its buffers stay in use after any single transfer
                if blocking {
                    return Err(Error::WrongRole);
                }
                if ctx.is_listening() {
                    return Err(Error::Busy);
                }
            }
            slot.claim()?;
            arm(regs, ctx);
            Ok(())
        })
    }

    /// Serve one remote read from `data`, ending at the next stop condition.
    ///
    /// An always-listening slave that stopped listening after an abort or a
    /// DMA failure is armed again and keeps serving from `data`.
    pub fn slave_send(&self, instance: usize, data: &'a [u8]) -> Result<(), Error> {
        self.start_slave(instance, false, |regs, ctx| {
            ctx.set_transmit_buffer(TxCursor::new(data));
            ctx.arm(regs, Direction::Read);
        })
    }

    /// Serve one remote write into `buffer`, ending at the next stop
    /// condition.
    ///
    /// Re-arms an always-listening slave the same way as
    /// [`BusManager::slave_send`].
    pub fn slave_receive(&self, instance: usize, buffer: &'a mut [u8]) -> Result<(), Error> {
        self.start_slave(instance, false, |regs, ctx| {
            ctx.set_receive_buffer(RxCursor::new(buffer), true);
            ctx.arm(regs, Direction::Write);
        })
    }

    /// [`BusManager::slave_send`] waiting for the stop condition
    ///
    /// Not available to an always-listening slave.
    pub fn slave_send_blocking(
        &self,
        instance: usize,
        data: &[u8],
        timeout: MillisDurationU32,
    ) -> Result<(), Error> {
        let slot = self.slot(instance)?;
        run_blocking(
            &slot.semaphore,
            &slot.blocking,
            timeout,
            || {
                self.start_slave(instance, true, |regs, ctx| {
                    ctx.set_transmit_buffer(TxCursor::new(data));
                    ctx.arm(regs, Direction::Read);
                })
            },
            || self.abort_slave(instance, Error::Timeout),
            || slot.outcome(),
        )
    }

    /// [`BusManager::slave_receive`] waiting for the stop condition
    ///
    /// Not available to an always-listening slave.
    pub fn slave_receive_blocking(
        &self,
        instance: usize,
        buffer: &mut [u8],
        timeout: MillisDurationU32,
    ) -> Result<(), Error> {
        let slot = self.slot(instance)?;
        run_blocking(
            &slot.semaphore,
            &slot.blocking,
            timeout,
            || {
                self.start_slave(instance, true, |regs, ctx| {
                    ctx.set_receive_buffer(RxCursor::new(buffer), false);
                    ctx.arm(regs, Direction::Write);
                })
            },
            || self.abort_slave(instance, Error::Timeout),
            || slot.outcome(),
        )
    }

    fn abort_slave(&self, instance: usize, reason: Error) -> bool {
        self.slave(instance, |_, regs, dma, ctx, n| Ok(ctx.abort(regs, dma, reason, n)))
            .unwrap_or(false)
    }

    /// Stop listening, cancelling a transfer in progress.
    pub fn slave_abort(&self, instance: usize) -> Result<(), Error> {
        self.slave(instance, |_, regs, dma, ctx, n| {
            ctx.abort(regs, dma, Error::Aborted, n);
            Ok(())
        })
    }

    /// Progress of the current or last slave transfer
    pub fn slave_status(&self, instance: usize) -> Result<TransferStatus, Error> {
        self.slave(instance, |_, _, _, ctx, _| {
            Ok(TransferStatus {
                remaining: ctx.remaining(),
                state: if ctx.is_busy() {
                    TransferState::Busy
                } else {
                    TransferState::Done(ctx.result)
                },
            })
        })
    }

    /// Hand back the receive buffer set by [`BusManager::slave_receive`] or
    /// [`BusManager::slave_set_receive_buffer`] once no transfer uses it.
    pub fn slave_take_received(&self, instance: usize) -> Result<Option<&'a mut [u8]>, Error> {
        self.slave(instance, |_, _, _, ctx, _| {
            // Safety: only cursors created from a `&'a mut [u8]` are kept,
            // and each is handed out once.
            Ok(ctx.take_received().and_then(|c| unsafe { c.into_slice() }))
        })
    }

    /// Respond to `address` from now on.
    pub fn set_own_address(&self, instance: usize, address: Address) -> Result<(), Error> {
        if !address.is_valid() {
            return Err(Error::InvalidArgument);
        }
        self.slave(instance, |_, regs, _, ctx, _| {
            if ctx.is_busy() {
                return Err(Error::Busy);
            }
            regs.set_own_address(address.own_address());
            ctx.address = address;
            Ok(())
        })
    }
}
