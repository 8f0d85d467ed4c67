#![doc = include_str!("../README.md")]
#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

mod eeprom;
mod error;
pub mod layout;
mod redundancy;
pub mod sim;
pub mod slot;
mod wear;

pub use eeprom::{Eeprom, ReadStatus, State, WriteStatus};
pub use error::{ConfigError, Error, FlashError, Status};
pub use layout::{physical_size, Config, Layout, StorageRegion};

/// Physical properties of a flash device
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FlashGeometry {
    /// Address of the first byte of the device
    pub base_address: u32,
    /// Size of the device in bytes
    pub capacity: usize,
    /// The smallest unit that can be programmed at once, in bytes
    pub program_size: usize,
    /// The smallest unit that can be erased at once, in bytes
    pub erase_size: usize,
}

impl FlashGeometry {
    /// The address one past the last byte of the device
    pub fn end_address(&self) -> u64 {
        u64::from(self.base_address) + self.capacity as u64
    }
}

/// A trait defining the common flash operations
///
/// Erased flash reads as `0xFF` and programming may only clear bits.
/// The blocking calls return once the operation has completed. The `start_*` calls
/// may return while the controller is still busy, in which case [Flash::is_busy]
/// reports `true` until it is done. Drivers without a non-blocking mode can rely on
/// the default implementations.
///
/// A program, erase or read must never be issued while another operation on the same
/// sector is running. The engine upholds this for its own calls.
pub trait Flash {
    /// Get the geometry of the device
    fn geometry(&self) -> FlashGeometry;

    /// Erase the sector that starts at the given address
    fn erase_sector(&mut self, address: u32) -> Result<(), FlashError>;

    /// Program the data at the given address.
    /// The address and the length of the data are multiples of the program size.
    fn program_row(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError>;

    /// Read the flash at the given address into the buffer
    fn read_raw(&self, address: u32, buffer: &mut [u8]) -> Result<(), FlashError>;

    /// Start erasing the sector without waiting for it to finish
    fn start_erase_sector(&mut self, address: u32) -> Result<(), FlashError> {
        self.erase_sector(address)
    }

    /// Start programming the data without waiting for it to finish
    fn start_program_row(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        self.program_row(address, data)
    }

    /// Returns true while a started operation has not finished yet
    fn is_busy(&mut self) -> Result<bool, FlashError> {
        Ok(false)
    }
}
