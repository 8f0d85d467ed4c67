//! Implementation of [Flash] on top of an image file
//!
//! The image survives the process, which is what a power cycle of the demo needs.

use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::Path,
};

use anyhow::{ensure, Context};
use em_eeprom::{sim::RamFlash, Flash, FlashError, FlashGeometry};
use tracing::{debug, error};

/// The emulated EEPROM flash region of the device the demo runs on
pub const DEVICE_GEOMETRY: FlashGeometry = FlashGeometry {
    base_address: 0x1400_0000,
    capacity: 0x8000,
    program_size: 512,
    erase_size: 512,
};

/// A flash device whose content is kept in a file
pub struct FileFlash {
    memory: RamFlash,
    file: File,
}

impl FileFlash {
    /// Opens the image, creating an erased one if the file does not exist yet
    pub fn open(path: &Path, geometry: FlashGeometry) -> anyhow::Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Could not open flash image {}", path.display()))?;

        let mut image = Vec::new();
        file.read_to_end(&mut image)
            .with_context(|| format!("Could not read flash image {}", path.display()))?;

        let memory = if image.is_empty() {
            debug!("Creating erased flash image {}", path.display());
            let memory = RamFlash::new(geometry);
            file.write_all(memory.image())
                .with_context(|| format!("Could not write flash image {}", path.display()))?;
            memory
        } else {
            ensure!(
                image.len() == geometry.capacity,
                "Flash image {} is {} bytes, expected {}",
                path.display(),
                image.len(),
                geometry.capacity
            );
            RamFlash::from_image(geometry, image)?
        };

        Ok(Self { memory, file })
    }

    /// Writes the given part of the memory back to the file
    fn persist(&mut self, address: u32, len: usize) -> Result<(), FlashError> {
        let offset = (address - self.memory.geometry().base_address) as usize;
        let data = &self.memory.image()[offset..offset + len];

        self.file
            .seek(SeekFrom::Start(offset as u64))
            .and_then(|_| self.file.write_all(data))
            .and_then(|_| self.file.sync_data())
            .map_err(|e| {
                error!("Could not persist {} bytes at {:#010X}: {}", len, address, e);
                FlashError::Controller { address }
            })
    }
}

impl Flash for FileFlash {
    fn geometry(&self) -> FlashGeometry {
        self.memory.geometry()
    }

    fn erase_sector(&mut self, address: u32) -> Result<(), FlashError> {
        self.memory.erase_sector(address)?;
        self.persist(address, self.geometry().erase_size)
    }

    fn program_row(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        self.memory.program_row(address, data)?;
        self.persist(address, data.len())
    }

    fn read_raw(&self, address: u32, buffer: &mut [u8]) -> Result<(), FlashError> {
        self.memory.read_raw(address, buffer)
    }
}
