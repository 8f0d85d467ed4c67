//! An in-memory flash with NOR semantics
//!
//! Erasing sets every byte of a sector to `0xFF` and programming can only clear bits,
//! so programming over data that was not erased leaves a mix of both that fails
//! verification. The simulator counts erases per sector, can fail the next program
//! or erase, and can keep started operations busy for a number of polls.

use alloc::{vec, vec::Vec};

use crate::{slot::ERASED_BYTE, Flash, FlashError, FlashGeometry};

/// An operation that was started but has not completed yet
#[derive(Debug, Clone)]
enum Started {
    Erase { address: u32 },
    Program { address: u32, data: Vec<u8> },
}

/// A RAM backed flash device
#[derive(Debug, Clone)]
pub struct RamFlash {
    geometry: FlashGeometry,
    memory: Vec<u8>,
    erase_counts: Vec<u32>,
    programs_until_failure: Option<u32>,
    fail_next_erase: bool,
    busy_polls: u32,
    started: Option<(Started, u32)>,
}

impl RamFlash {
    /// Creates a fully erased device
    pub fn new(geometry: FlashGeometry) -> Self {
        assert!(
            geometry.erase_size > 0 && geometry.capacity % geometry.erase_size == 0,
            "Capacity must be a whole number of sectors"
        );

        Self {
            geometry,
            memory: vec![ERASED_BYTE; geometry.capacity],
            erase_counts: vec![0; geometry.capacity / geometry.erase_size],
            programs_until_failure: None,
            fail_next_erase: false,
            busy_polls: 0,
            started: None,
        }
    }

    /// Creates a device from a previously saved memory image
    pub fn from_image(geometry: FlashGeometry, image: Vec<u8>) -> Result<Self, FlashError> {
        if image.len() != geometry.capacity {
            return Err(FlashError::OutOfRange {
                address: geometry.base_address,
                len: image.len(),
            });
        }

        let mut flash = Self::new(geometry);
        flash.memory = image;
        Ok(flash)
    }

    /// The raw memory of the device
    pub fn image(&self) -> &[u8] {
        &self.memory
    }

    /// Direct mutable access to the memory, bypassing the flash semantics.
    /// Useful to inject bit errors.
    pub fn image_mut(&mut self) -> &mut [u8] {
        &mut self.memory
    }

    /// The number of times the sector containing the address has been erased
    pub fn erase_count(&self, address: u32) -> u32 {
        self.offset(address, 0)
            .map(|offset| self.erase_counts[offset / self.geometry.erase_size])
            .unwrap_or(0)
    }

    /// Makes the next program operation report a controller failure
    pub fn fail_next_program(&mut self) {
        self.fail_program_after(0);
    }

    /// Lets `count` program operations succeed and makes the one after them fail,
    /// which is how a power loss in the middle of a multi step write is simulated
    pub fn fail_program_after(&mut self, count: u32) {
        self.programs_until_failure = Some(count);
    }

    /// Makes the next erase operation report a controller failure
    pub fn fail_next_erase(&mut self) {
        self.fail_next_erase = true;
    }

    /// Sets how many times [Flash::is_busy] reports `true` after an operation is started
    pub fn set_busy_polls(&mut self, polls: u32) {
        self.busy_polls = polls;
    }

    fn offset(&self, address: u32, len: usize) -> Result<usize, FlashError> {
        let out_of_range = FlashError::OutOfRange { address, len };
        let offset = address
            .checked_sub(self.geometry.base_address)
            .ok_or(out_of_range)? as usize;
        if offset + len > self.memory.len() {
            return Err(out_of_range);
        }
        Ok(offset)
    }

    fn check_aligned(address: u32, alignment: usize) -> Result<(), FlashError> {
        if address as usize % alignment != 0 {
            return Err(FlashError::Unaligned { address, alignment });
        }
        Ok(())
    }

    fn check_erase(&mut self, address: u32) -> Result<usize, FlashError> {
        Self::check_aligned(address, self.geometry.erase_size)?;
        let offset = self.offset(address, self.geometry.erase_size)?;
        if core::mem::take(&mut self.fail_next_erase) {
            return Err(FlashError::Controller { address });
        }
        Ok(offset)
    }

    fn check_program(&mut self, address: u32, data: &[u8]) -> Result<usize, FlashError> {
        Self::check_aligned(address, self.geometry.program_size)?;
        if data.len() % self.geometry.program_size != 0 {
            return Err(FlashError::Unaligned {
                address: address + data.len() as u32,
                alignment: self.geometry.program_size,
            });
        }
        let offset = self.offset(address, data.len())?;
        match self.programs_until_failure {
            Some(0) => {
                self.programs_until_failure = None;
                Err(FlashError::Controller { address })
            }
            Some(remaining) => {
                self.programs_until_failure = Some(remaining - 1);
                Ok(offset)
            }
            None => Ok(offset),
        }
    }

    fn apply_erase(&mut self, offset: usize) {
        let erase_size = self.geometry.erase_size;
        self.memory[offset..offset + erase_size].fill(ERASED_BYTE);
        self.erase_counts[offset / erase_size] += 1;
    }

    fn apply_program(&mut self, offset: usize, data: &[u8]) {
        // Programming can only turn ones into zeros
        for (cell, byte) in self.memory[offset..offset + data.len()].iter_mut().zip(data) {
            *cell &= *byte;
        }
    }

    fn complete(&mut self, started: Started) -> Result<(), FlashError> {
        match started {
            Started::Erase { address } => {
                let offset = self.offset(address, self.geometry.erase_size)?;
                self.apply_erase(offset);
            }
            Started::Program { address, data } => {
                let offset = self.offset(address, data.len())?;
                self.apply_program(offset, &data);
            }
        }
        Ok(())
    }

    fn start(&mut self, started: Started) -> Result<(), FlashError> {
        if self.busy_polls == 0 {
            return self.complete(started);
        }
        self.started = Some((started, self.busy_polls));
        Ok(())
    }
}

impl Flash for RamFlash {
    fn geometry(&self) -> FlashGeometry {
        self.geometry
    }

    fn erase_sector(&mut self, address: u32) -> Result<(), FlashError> {
        let offset = self.check_erase(address)?;
        self.apply_erase(offset);
        Ok(())
    }

    fn program_row(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        let offset = self.check_program(address, data)?;
        self.apply_program(offset, data);
        Ok(())
    }

    fn read_raw(&self, address: u32, buffer: &mut [u8]) -> Result<(), FlashError> {
        let offset = self.offset(address, buffer.len())?;
        buffer.copy_from_slice(&self.memory[offset..offset + buffer.len()]);
        Ok(())
    }

    fn start_erase_sector(&mut self, address: u32) -> Result<(), FlashError> {
        self.check_erase(address)?;
        self.start(Started::Erase { address })
    }

    fn start_program_row(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        self.check_program(address, data)?;
        self.start(Started::Program {
            address,
            data: data.to_vec(),
        })
    }

    fn is_busy(&mut self) -> Result<bool, FlashError> {
        match self.started.take() {
            None => Ok(false),
            Some((started, 0)) => {
                self.complete(started)?;
                Ok(false)
            }
            Some((started, polls)) => {
                self.started = Some((started, polls - 1));
                Ok(true)
            }
        }
    }
}
