//! Bus instance configuration

use crate::address::Address;
use fugit::HertzU32;

/// How data bytes are moved between memory and the bus
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Transport {
    /// One byte per byte-complete interrupt
    #[default]
    Interrupt,
    /// Data phase in bulk through the instance's DMA channel
    ///
    /// The address phase and the last two bytes of a master receive still go
    /// through the interrupt handler.
    Dma,
}

/// Configuration of an instance acting as bus master
#[derive(Copy, Clone, Debug)]
pub struct MasterConfig {
    /// Bus rate, the closest achievable rate is used
    pub rate: HertzU32,
    /// Device addressed by subsequent transfers, see
    /// [`BusManager::set_target_address`]
    ///
    /// [`BusManager::set_target_address`]: crate::bus::BusManager::set_target_address
    pub target: Address,
    /// Data phase transport
    pub transport: Transport,
}

impl MasterConfig {
    /// Interrupt driven master talking to `target` at `rate`
    pub fn new(rate: HertzU32, target: Address) -> Self {
        Self {
            rate,
            target,
            transport: Transport::Interrupt,
        }
    }
}

/// Configuration of an instance acting as bus slave
#[derive(Copy, Clone, Debug)]
pub struct SlaveConfig {
    /// Own address the instance responds to
    pub address: Address,
    /// Data phase transport
    pub transport: Transport,
    /// Wake the system up when the own address is matched
    pub wakeup_on_match: bool,
    /// Stay armed after each stop condition instead of serving a single
    /// transfer per send/receive call
    pub always_listen: bool,
}

impl SlaveConfig {
    /// One-shot, interrupt driven slave at `address`
    pub fn new(address: Address) -> Self {
        Self {
            address,
            transport: Transport::Interrupt,
            wakeup_on_match: false,
            always_listen: false,
        }
    }
}
