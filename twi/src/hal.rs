//! [`embedded_hal::i2c::I2c`] on top of a master instance
//!
//! A transaction is split into runs of adjacent operations of the same kind.
//! Each run gets one address phase, with a start condition for the first run
//! and a repeated start for the following ones; the operations inside a run
//! carry on the data phase of the one before. Only the last operation ends
//! with a stop.

use crate::address::Address;
use crate::bus::{BusManager, Chain, Error, Slot};
use crate::reg::Registers;
use embedded_hal::i2c::{ErrorType, I2c, Operation, SevenBitAddress, TenBitAddress};
use fugit::MillisDurationU32;
use generic_array::ArrayLength;
use twi_core::{Clocks, DmaChannel, Semaphore};

/// Blocking view of one master instance of a [`BusManager`]
pub struct MasterBus<'m, 'a, H, C, D, S, N>
where
    N: ArrayLength<Slot<'a, H, C, D, S>>,
{
    manager: &'m BusManager<'a, H, C, D, S, N>,
    instance: usize,
    timeout: MillisDurationU32,
}

impl<'m, 'a, H, C, D, S, N> MasterBus<'m, 'a, H, C, D, S, N>
where
    H: Registers,
    C: Clocks,
    D: DmaChannel,
    S: Semaphore,
    N: ArrayLength<Slot<'a, H, C, D, S>>,
{
    /// Drive `instance`, which must be initialized as master. `timeout`
    /// applies to each operation.
    pub fn new(manager: &'m BusManager<'a, H, C, D, S, N>, instance: usize, timeout: MillisDurationU32) -> Self {
        Self {
            manager,
            instance,
            timeout,
        }
    }

    fn run(&mut self, address: Address, operations: &mut [Operation<'_>]) -> Result<(), Error> {
        self.manager.set_target_address(self.instance, address)?;
        let result = self.transfer(operations);
        if result.is_err() {
            // Do not leave the bus held by the operations that went through
            let _ = self.manager.master_abort(self.instance);
        }
        result
    }

    fn transfer(&mut self, operations: &mut [Operation<'_>]) -> Result<(), Error> {
        let count = operations.len();
        let mut first = 0;
        while first < count {
            let read = is_read(&operations[first]);
            let end = operations[first..]
                .iter()
                .position(|op| is_read(op) != read)
                .map_or(count, |p| first + p);
            let run = &mut operations[first..end];
            if read {
                self.read_run(run, end == count)?;
            } else {
                self.write_run(run, end == count)?;
            }
            first = end;
        }
        Ok(())
    }

    fn write_run(&mut self, run: &[Operation<'_>], stop: bool) -> Result<(), Error> {
        let last = run.len() - 1;
        for (i, operation) in run.iter().enumerate() {
            let Operation::Write(data) = operation else {
                continue;
            };
            let stop = stop && i == last;
            if i == 0 {
                self.manager
                    .master_send_blocking(self.instance, data, stop, self.timeout)?;
            } else {
                self.manager
                    .master_continue_send_blocking(self.instance, data, stop, self.timeout)?;
            }
        }
        Ok(())
    }

    fn read_run(&mut self, run: &mut [Operation<'_>], stop: bool) -> Result<(), Error> {
        let mut more: usize = run
            .iter()
            .map(|op| match op {
                Operation::Read(buffer) => buffer.len(),
                Operation::Write(_) => 0,
            })
            .sum();
        if more == 0 {
            return Err(Error::InvalidArgument);
        }
        let mut resume = false;
        for operation in run.iter_mut() {
            let Operation::Read(buffer) = operation else {
                continue;
            };
            if buffer.is_empty() {
                continue;
            }
            more -= buffer.len();
            let chain = Chain { resume, more };
            self.manager.master_receive_part_blocking(
                self.instance,
                buffer,
                chain,
                stop && more == 0,
                self.timeout,
            )?;
            resume = true;
        }
        Ok(())
    }
}

fn is_read(operation: &Operation<'_>) -> bool {
    matches!(operation, Operation::Read(_))
}

impl<'m, 'a, H, C, D, S, N> ErrorType for MasterBus<'m, 'a, H, C, D, S, N>
where
    N: ArrayLength<Slot<'a, H, C, D, S>>,
{
    type Error = Error;
}

impl<'m, 'a, H, C, D, S, N> I2c<SevenBitAddress> for MasterBus<'m, 'a, H, C, D, S, N>
where
    H: Registers,
    C: Clocks,
    D: DmaChannel,
    S: Semaphore,
    N: ArrayLength<Slot<'a, H, C, D, S>>,
{
    fn transaction(&mut self, address: u8, operations: &mut [Operation<'_>]) -> Result<(), Self::Error> {
        self.run(Address::seven(address)?, operations)
    }
}

impl<'m, 'a, H, C, D, S, N> I2c<TenBitAddress> for MasterBus<'m, 'a, H, C, D, S, N>
where
    H: Registers,
    C: Clocks,
    D: DmaChannel,
    S: Semaphore,
    N: ArrayLength<Slot<'a, H, C, D, S>>,
{
    fn transaction(&mut self, address: u16, operations: &mut [Operation<'_>]) -> Result<(), Self::Error> {
        self.run(Address::ten(address)?, operations)
    }
}
