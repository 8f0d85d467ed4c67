//! Mapping of the logical EEPROM image onto physical flash slots
//!
//! The storage region is divided into slots of one erase block each.
//! Every logical row owns a group of `wear_leveling_factor` consecutive slots.
//! The groups of the primary copy come first, followed by those of the redundant copy:
//!
//! ```text
//! | row 0: slot 0 .. slot W-1 | row 1: ... | row N-1 | (redundant) row 0 | ... |
//! ```

use core::ops::Range;

use crate::{slot::HEADER_SIZE, ConfigError, FlashGeometry};

/// The largest supported wear leveling factor
pub const MAX_WEAR_LEVELING_FACTOR: usize = 10;

/// A fixed region of flash reserved for the emulated EEPROM
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct StorageRegion {
    /// Address of the first byte of the region
    pub base_address: u32,
    /// Size of the region in bytes
    pub size: usize,
}

impl StorageRegion {
    /// The address range of the region
    pub fn range(&self) -> Range<u64> {
        let start = u64::from(self.base_address);
        start..start.saturating_add(self.size as u64)
    }
}

/// The configuration of the engine
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Config {
    /// Logical size of the emulated EEPROM in bytes
    pub eeprom_size: usize,
    /// Wait for every flash operation to complete before returning from a write
    pub blocking_write: bool,
    /// Keep a mirror of all data to recover from a corrupted primary copy
    pub redundant_copy: bool,
    /// Number of slots the writes of one row rotate over
    pub wear_leveling_factor: usize,
    /// Store data directly without headers, wear leveling or redundancy
    pub simple_mode: bool,
    /// Where the physical storage lives
    pub storage: StorageRegion,
}

/// One of the two copies of the stored image
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Replica {
    /// The authoritative copy
    Primary,
    /// The mirror that is used when the primary copy is corrupted
    Redundant,
}

impl Replica {
    fn index(self) -> usize {
        match self {
            Replica::Primary => 0,
            Replica::Redundant => 1,
        }
    }
}

/// Calculates the number of flash bytes needed to store an image of the given size.
/// Saturates at `usize::MAX` for sizes no flash can hold.
pub fn physical_size(
    eeprom_size: usize,
    simple_mode: bool,
    wear_leveling_factor: usize,
    redundant_copy: bool,
    geometry: FlashGeometry,
) -> usize {
    let (payload, factor, copies) = if simple_mode {
        (geometry.erase_size, 1, 1)
    } else {
        let copies = if redundant_copy { 2 } else { 1 };
        (
            geometry.erase_size.saturating_sub(HEADER_SIZE),
            wear_leveling_factor,
            copies,
        )
    };

    if payload == 0 {
        return 0;
    }

    region_size(eeprom_size.div_ceil(payload), factor, copies, geometry.erase_size)
}

fn region_size(rows: usize, wear_leveling_factor: usize, copies: usize, erase_size: usize) -> usize {
    rows.checked_mul(wear_leveling_factor)
        .and_then(|slots| slots.checked_mul(copies))
        .and_then(|slots| slots.checked_mul(erase_size))
        .unwrap_or(usize::MAX)
}

/// The validated physical layout of an engine
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Layout {
    base_address: u32,
    eeprom_size: usize,
    slot_size: usize,
    program_size: usize,
    payload_size: usize,
    rows: usize,
    wear_leveling_factor: usize,
    copies: usize,
    simple_mode: bool,
}

impl Layout {
    /// Validates the config against the flash geometry and computes the layout
    pub fn new(config: &Config, geometry: FlashGeometry) -> Result<Self, ConfigError> {
        if config.eeprom_size == 0 {
            return Err(ConfigError::ZeroSize);
        }

        let erase_size = geometry.erase_size;
        let program_size = geometry.program_size;
        if program_size == 0
            || erase_size == 0
            || erase_size % program_size != 0
            || (!config.simple_mode && erase_size <= HEADER_SIZE)
        {
            return Err(ConfigError::Geometry {
                erase_size,
                program_size,
            });
        }

        let (wear_leveling_factor, copies, payload_size) = if config.simple_mode {
            // Wear leveling and the redundant copy are ignored
            (1, 1, erase_size)
        } else {
            if !(1..=MAX_WEAR_LEVELING_FACTOR).contains(&config.wear_leveling_factor) {
                return Err(ConfigError::WearLevelingFactor {
                    factor: config.wear_leveling_factor,
                    max: MAX_WEAR_LEVELING_FACTOR,
                });
            }
            let copies = if config.redundant_copy { 2 } else { 1 };
            (config.wear_leveling_factor, copies, erase_size - HEADER_SIZE)
        };

        let rows = config.eeprom_size.div_ceil(payload_size);
        if rows > usize::from(u16::MAX) + 1 {
            return Err(ConfigError::TooManyRows { rows });
        }

        let storage = config.storage;
        if storage.base_address as usize % erase_size != 0 {
            return Err(ConfigError::UnalignedBase {
                address: storage.base_address,
                erase_size,
            });
        }

        let required = region_size(rows, wear_leveling_factor, copies, erase_size);
        if storage.size < required {
            return Err(ConfigError::RegionTooSmall {
                required,
                available: storage.size,
            });
        }

        let region = storage.range();
        if region.start < u64::from(geometry.base_address) || region.end > geometry.end_address() {
            return Err(ConfigError::OutsideFlash {
                address: storage.base_address,
            });
        }

        Ok(Self {
            base_address: storage.base_address,
            eeprom_size: config.eeprom_size,
            slot_size: erase_size,
            program_size,
            payload_size,
            rows,
            wear_leveling_factor,
            copies,
            simple_mode: config.simple_mode,
        })
    }

    /// Logical size of the emulated EEPROM in bytes
    pub fn eeprom_size(&self) -> usize {
        self.eeprom_size
    }

    /// Size of one physical slot, which is one erase block
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// The program unit of the underlying flash
    pub fn program_size(&self) -> usize {
        self.program_size
    }

    /// Number of logical bytes stored in one slot
    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    /// Number of logical rows
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of slots in one row group
    pub fn wear_leveling_factor(&self) -> usize {
        self.wear_leveling_factor
    }

    /// Whether a redundant copy is maintained
    pub fn has_redundant_copy(&self) -> bool {
        self.copies == 2
    }

    /// Whether slots are stored without headers
    pub fn is_simple(&self) -> bool {
        self.simple_mode
    }

    /// The copies that are stored, primary first
    pub fn copies(&self) -> &'static [Replica] {
        if self.has_redundant_copy() {
            &[Replica::Primary, Replica::Redundant]
        } else {
            &[Replica::Primary]
        }
    }

    /// Number of flash bytes used
    pub fn footprint(&self) -> usize {
        self.rows * self.wear_leveling_factor * self.copies * self.slot_size
    }

    /// The address of a slot of a row group
    pub fn slot_address(&self, copy: Replica, row: usize, slot: usize) -> u32 {
        debug_assert!(row < self.rows && slot < self.wear_leveling_factor);
        let index = (copy.index() * self.rows + row) * self.wear_leveling_factor + slot;
        self.base_address + (index * self.slot_size) as u32
    }

    /// The addresses of all slots of a row group
    pub fn group_addresses(&self, copy: Replica, row: usize) -> impl Iterator<Item = u32> + '_ {
        (0..self.wear_leveling_factor).map(move |slot| self.slot_address(copy, row, slot))
    }

    /// The logical byte range stored by a row
    pub fn row_span(&self, row: usize) -> Range<usize> {
        let start = row * self.payload_size;
        start..(start + self.payload_size).min(self.eeprom_size)
    }

    /// The rows touched by the logical byte range
    pub fn rows_touched(&self, range: Range<usize>) -> Range<usize> {
        if range.is_empty() {
            return 0..0;
        }
        range.start / self.payload_size..(range.end - 1) / self.payload_size + 1
    }

    /// Every slot address of the footprint, in address order
    pub fn all_slots(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.footprint() / self.slot_size)
            .map(move |index| self.base_address + (index * self.slot_size) as u32)
    }
}
