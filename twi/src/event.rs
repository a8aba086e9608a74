//! Event notification
//!
//! The interrupt handler reports progress through an [`EventHandler`]
//! registered per bus instance. Closures taking `(instance, event)` implement
//! the trait directly.

use crate::address::Direction;
use crate::bus::Error;

/// Something worth telling the application about
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Event {
    /// A transfer ended, carrying its result
    TransferDone(Result<(), Error>),
    /// The slave was addressed by a remote master
    AddressMatch(Direction),
    /// The slave receive buffer is full and no replacement was supplied
    ReceiveFull,
    /// The last byte of the slave transmit buffer was handed to the bus
    TransmitEmpty,
    /// A recoverable condition was recorded, the transfer continues
    Error(Error),
}

/// Receiver of [`Event`]s
///
/// `on_event` is called from interrupt context after the instance's state has
/// been updated and may start a new transfer. The `refill_*` hooks are called
/// while the instance is locked and must not call back into the bus manager.
pub trait EventHandler<'a>: Sync {
    /// Handle `event` raised by bus instance `instance`.
    fn on_event(&self, instance: usize, event: Event);

    /// The slave transmit buffer ran dry; return a new one to keep streaming.
    fn refill_transmit(&self, _instance: usize) -> Option<&'a [u8]> {
        None
    }

    /// The slave receive buffer is full; return a new one to keep accepting.
    fn refill_receive(&self, _instance: usize) -> Option<&'a mut [u8]> {
        None
    }
}

impl<'a, F> EventHandler<'a> for F
where
    F: Fn(usize, Event) + Sync,
{
    fn on_event(&self, instance: usize, event: Event) {
        self(instance, event)
    }
}

const CAPACITY: usize = 4;

/// Outcome of one pass through a state machine
///
/// Collected while the instance is locked and acted upon once it is released.
#[derive(Debug, Default)]
pub(crate) struct Notifications {
    events: [Option<Event>; CAPACITY],
    len: usize,
    /// The transfer ended with this result and the instance is idle again
    pub(crate) ended: Option<Result<(), Error>>,
}

impl Notifications {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, event: Event) {
        match self.events.get_mut(self.len) {
            Some(slot) => {
                *slot = Some(event);
                self.len += 1;
            }
            None => warn!("event dropped"),
        }
    }

    /// Mark the end of the transfer and queue its completion event.
    pub(crate) fn end(&mut self, result: Result<(), Error>) {
        self.ended = Some(result);
        self.push(Event::TransferDone(result));
    }

    pub(crate) fn events(&self) -> impl Iterator<Item = Event> + '_ {
        self.events.iter().flatten().copied()
    }
}
