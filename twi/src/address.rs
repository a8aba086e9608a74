//! Device addressing
//!
//! A 7-bit address occupies a single header byte, `address << 1 | direction`.
//! A 10-bit address is announced by an extension prefix `0b11110xx0` carrying
//! the two high address bits, followed by the low address byte. Reading from
//! a 10-bit device additionally requires a repeated start followed by the
//! prefix with the read bit set.

use crate::bus::Error;
use crate::reg::OwnAddress;

/// Fixed pattern of the 10-bit extension prefix
pub const TEN_BIT_PREFIX: u8 = 0b1111_0000;
const TEN_BIT_PREFIX_MASK: u8 = 0b1111_1000;

/// Address of a device on the bus
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Address {
    /// 7-bit address, `0..=0x7F`
    Seven(u8),
    /// 10-bit address, `0..=0x3FF`
    Ten(u16),
}

/// Transfer direction as seen by the bus master
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    /// Master transmits, slave receives
    Write,
    /// Master receives, slave transmits
    Read,
}

impl Direction {
    /// Value of the R/W bit in an address header
    pub fn bit(self) -> u8 {
        match self {
            Direction::Write => 0,
            Direction::Read => 1,
        }
    }

    fn from_bit(byte: u8) -> Self {
        if byte & 1 == 0 {
            Direction::Write
        } else {
            Direction::Read
        }
    }
}

impl Address {
    /// Validated 7-bit address
    pub fn seven(address: u8) -> Result<Self, Error> {
        if address > 0x7F {
            return Err(Error::InvalidArgument);
        }
        Ok(Self::Seven(address))
    }

    /// Validated 10-bit address
    pub fn ten(address: u16) -> Result<Self, Error> {
        if address > 0x3FF {
            return Err(Error::InvalidArgument);
        }
        Ok(Self::Ten(address))
    }

    pub(crate) fn is_valid(self) -> bool {
        match self {
            Address::Seven(a) => a <= 0x7F,
            Address::Ten(a) => a <= 0x3FF,
        }
    }

    /// First byte on the wire after a start condition
    ///
    /// For 10-bit addresses this is the extension prefix; the low address
    /// byte follows separately.
    pub fn header(self, direction: Direction) -> u8 {
        match self {
            Address::Seven(a) => (a << 1) | direction.bit(),
            Address::Ten(a) => ten_bit_prefix(a) | direction.bit(),
        }
    }

    pub(crate) fn own_address(self) -> OwnAddress {
        let mut own = OwnAddress(0);
        match self {
            Address::Seven(a) => own.set_address(u16::from(a)),
            Address::Ten(a) => {
                own.set_address(a);
                own.set_ten_bit(true);
            }
        }
        own
    }

    pub(crate) fn from_own_address(own: OwnAddress) -> Self {
        if own.ten_bit() {
            Address::Ten(own.address())
        } else {
            Address::Seven(own.address() as u8)
        }
    }
}

/// Extension prefix with the write bit clear
pub fn ten_bit_prefix(address: u16) -> u8 {
    TEN_BIT_PREFIX | (((address >> 7) as u8) & 0b110)
}

/// Outcome of feeding one byte to an [`AddressDecoder`]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Decoded {
    /// An extension prefix was seen, the low byte is still to come
    Pending,
    /// The address phase completed
    Matched(Address, Direction),
    /// The byte belongs to the data phase of the current transfer
    Data,
    /// The byte cannot be interpreted, e.g. a 10-bit read header without a
    /// preceding 10-bit write
    Invalid,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum DecoderState {
    Idle,
    Header,
    /// Start after a complete 10-bit write addressing
    RepeatedHeader(u16),
    LowByte(u8),
    /// Data phase of a 10-bit write transfer, remembered for a read repeat
    TenBitData(u16),
    Data,
}

/// Slave side address recognition
///
/// Recovers address and direction from the bytes following a start or
/// repeated start condition.
#[derive(Copy, Clone, Debug)]
pub struct AddressDecoder {
    state: DecoderState,
}

impl Default for AddressDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressDecoder {
    /// Decoder waiting for a start condition
    pub const fn new() -> Self {
        Self {
            state: DecoderState::Idle,
        }
    }

    /// A start or repeated start condition was seen.
    pub fn start(&mut self) {
        self.state = match self.state {
            DecoderState::TenBitData(a) | DecoderState::RepeatedHeader(a) => {
                DecoderState::RepeatedHeader(a)
            }
            _ => DecoderState::Header,
        };
    }

    /// A stop condition was seen.
    pub fn stop(&mut self) {
        self.state = DecoderState::Idle;
    }

    /// Feed the next byte seen on the wire.
    pub fn byte(&mut self, byte: u8) -> Decoded {
        match self.state {
            DecoderState::Idle => Decoded::Invalid,
            DecoderState::Header | DecoderState::RepeatedHeader(_)
                if byte & TEN_BIT_PREFIX_MASK == TEN_BIT_PREFIX =>
            {
                let high = (byte >> 1) & 0b11;
                match (Direction::from_bit(byte), self.state) {
                    (Direction::Write, _) => {
                        self.state = DecoderState::LowByte(high);
                        Decoded::Pending
                    }
                    (Direction::Read, DecoderState::RepeatedHeader(a))
                        if (a >> 8) as u8 == high =>
                    {
                        self.state = DecoderState::Data;
                        Decoded::Matched(Address::Ten(a), Direction::Read)
                    }
                    (Direction::Read, _) => {
                        self.state = DecoderState::Idle;
                        Decoded::Invalid
                    }
                }
            }
            DecoderState::Header | DecoderState::RepeatedHeader(_) => {
                self.state = DecoderState::Data;
                Decoded::Matched(Address::Seven(byte >> 1), Direction::from_bit(byte))
            }
            DecoderState::LowByte(high) => {
                let address = (u16::from(high) << 8) | u16::from(byte);
                self.state = DecoderState::TenBitData(address);
                Decoded::Matched(Address::Ten(address), Direction::Write)
            }
            DecoderState::TenBitData(_) | DecoderState::Data => Decoded::Data,
        }
    }
}
