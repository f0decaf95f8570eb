//! Register transport for the SX127x family.
//!
//! The driver only ever needs single-byte register access. Bit 7 of the
//! address byte selects the direction on the wire (clear = read, set = write);
//! implementations take care of that, callers pass the bare register address.

use embedded_hal::spi::{Error as _, ErrorKind, SpiDevice};
use std::fmt;

/// Byte-addressable register file of the transceiver.
pub trait RegisterBus {
    /// Read one register.
    fn read_register(&mut self, address: u8) -> Result<u8, BusError>;

    /// Write one register.
    fn write_register(&mut self, address: u8, value: u8) -> Result<(), BusError>;
}

impl<T: RegisterBus + ?Sized> RegisterBus for &mut T {
    fn read_register(&mut self, address: u8) -> Result<u8, BusError> {
        (**self).read_register(address)
    }

    fn write_register(&mut self, address: u8, value: u8) -> Result<(), BusError> {
        (**self).write_register(address, value)
    }
}

/// Errors raised by a register transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusError {
    /// The SPI peripheral reported an error.
    Spi(ErrorKind),
    /// The (simulated) device is no longer reachable.
    Disconnected,
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spi(kind) => write!(f, "SPI error: {}", kind),
            Self::Disconnected => write!(f, "register bus disconnected"),
        }
    }
}

impl std::error::Error for BusError {}

const WRITE_FLAG: u8 = 0x80;

/// SPI register transport (mode 0, MSB first, chip select handled by the device).
pub struct SpiBus<SPI> {
    spi: SPI,
}

impl<SPI: SpiDevice> SpiBus<SPI> {
    pub fn new(spi: SPI) -> Self {
        Self { spi }
    }

    /// Release the underlying SPI device.
    pub fn free(self) -> SPI {
        self.spi
    }
}

impl<SPI: SpiDevice> RegisterBus for SpiBus<SPI> {
    fn read_register(&mut self, address: u8) -> Result<u8, BusError> {
        let mut buffer = [address & !WRITE_FLAG, 0];
        self.spi
            .transfer_in_place(&mut buffer)
            .map_err(|e| BusError::Spi(e.kind()))?;
        Ok(buffer[1])
    }

    fn write_register(&mut self, address: u8, value: u8) -> Result<(), BusError> {
        self.spi
            .write(&[address | WRITE_FLAG, value])
            .map_err(|e| BusError::Spi(e.kind()))
    }
}
