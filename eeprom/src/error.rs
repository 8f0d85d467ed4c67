//! Error types of the engine and of the flash drivers

use num_enum::IntoPrimitive;
use thiserror::Error;

use crate::State;

/// An error reported by a flash driver
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum FlashError {
    /// The access does not lie inside the device
    #[error("access of {len} bytes at {address:#010X} is outside of the flash")]
    OutOfRange {
        /// Start of the access
        address: u32,
        /// Length of the access in bytes
        len: usize,
    },
    /// The access is not aligned to the program or erase unit
    #[error("address {address:#010X} is not aligned to {alignment} bytes")]
    Unaligned {
        /// Start of the access
        address: u32,
        /// The required alignment
        alignment: usize,
    },
    /// The flash controller reported a failure
    #[error("flash controller reported a failure at {address:#010X}")]
    Controller {
        /// Address of the failed operation
        address: u32,
    },
    /// The data read back after an operation is not what was expected
    #[error("verification failed at {address:#010X}")]
    VerifyMismatch {
        /// Address of the first mismatching byte
        address: u32,
    },
}

/// Rejected engine configuration
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum ConfigError {
    /// The logical size is zero
    #[error("logical size must not be zero")]
    ZeroSize,
    /// The wear leveling factor is out of range
    #[error("wear leveling factor {factor} is outside of 1..={max}")]
    WearLevelingFactor {
        /// The configured factor
        factor: usize,
        /// The largest supported factor
        max: usize,
    },
    /// The flash geometry cannot hold slots
    #[error("erase size {erase_size} cannot hold slots programmed in units of {program_size} bytes")]
    Geometry {
        /// Erase unit of the flash
        erase_size: usize,
        /// Program unit of the flash
        program_size: usize,
    },
    /// The storage region does not start on an erase block
    #[error("storage base {address:#010X} is not aligned to the {erase_size} byte erase block")]
    UnalignedBase {
        /// The configured base address
        address: u32,
        /// Erase unit of the flash
        erase_size: usize,
    },
    /// The storage region is smaller than the physical footprint
    #[error("storage region holds {available} bytes but {required} are needed")]
    RegionTooSmall {
        /// The physical footprint
        required: usize,
        /// The configured region size
        available: usize,
    },
    /// The storage region does not lie inside the flash device
    #[error("storage region at {address:#010X} lies outside of the flash")]
    OutsideFlash {
        /// The configured base address
        address: u32,
    },
    /// There are more rows than the slot header can index
    #[error("{rows} rows exceed the addressable row count")]
    TooManyRows {
        /// The required number of rows
        rows: usize,
    },
}

/// Errors returned by the engine
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum Error {
    /// The configuration was rejected
    #[error("invalid configuration: {0}")]
    Configuration(#[from] ConfigError),
    /// The access exceeds the logical size
    #[error("access of {len} bytes at offset {offset} exceeds the logical size of {size} bytes")]
    OutOfBounds {
        /// Logical offset of the access
        offset: usize,
        /// Length of the access
        len: usize,
        /// Logical size of the emulated EEPROM
        size: usize,
    },
    /// Programming a slot failed
    #[error("writing flash at {address:#010X} failed")]
    Write {
        /// Address of the failed program
        address: u32,
        /// What the driver or the verification reported
        #[source]
        source: FlashError,
    },
    /// Erasing a slot failed
    #[error("erasing flash at {address:#010X} failed")]
    Erase {
        /// Address of the failed erase
        address: u32,
        /// What the driver or the verification reported
        #[source]
        source: FlashError,
    },
    /// Reading flash failed
    #[error("reading flash at {address:#010X} failed")]
    Read {
        /// Address of the failed read
        address: u32,
        /// What the driver reported
        #[source]
        source: FlashError,
    },
    /// Neither copy of the row holds valid data
    #[error("row {row} is corrupted in every copy")]
    CorruptedData {
        /// The affected logical row
        row: usize,
    },
    /// The stored data could not be recovered while initializing
    #[error("row {row} could not be recovered while initializing")]
    Initialization {
        /// The affected logical row
        row: usize,
    },
    /// The engine does not accept the call in its current state
    #[error("engine is {state:?}")]
    NotReady {
        /// The current state
        state: State,
    },
    /// A non-blocking write is still in progress
    #[error("a write is still in progress")]
    Busy,
}

impl Error {
    /// The status code of this error
    pub fn status(&self) -> Status {
        match self {
            Self::Configuration(_) => Status::ConfigurationError,
            Self::OutOfBounds { .. } => Status::OutOfBoundsError,
            Self::Write { .. } => Status::WriteError,
            Self::Erase { .. } => Status::EraseError,
            // A failing read of the medium leaves the data unreadable
            Self::Read { .. } | Self::CorruptedData { .. } => Status::CorruptedDataError,
            Self::Initialization { .. } => Status::InitializationError,
            Self::NotReady { .. } => Status::NotReady,
            Self::Busy => Status::Busy,
        }
    }

    /// Physical I/O errors may succeed when the operation is repeated
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Write { .. } | Self::Erase { .. } | Self::Busy)
    }
}

/// Status codes reported by every engine call
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoPrimitive)]
pub enum Status {
    /// The operation completed
    Success = 0x00,
    /// The primary copy is corrupted and the redundant copy was used
    RedundantCopyUsed = 0x01,
    /// The access exceeds the logical size
    OutOfBoundsError = 0x02,
    /// Programming failed
    WriteError = 0x03,
    /// Erasing failed
    EraseError = 0x04,
    /// The data is lost
    CorruptedDataError = 0x05,
    /// The stored state could not be recovered at init
    InitializationError = 0x06,
    /// The configuration was rejected
    ConfigurationError = 0x07,
    /// A non-blocking write is still in progress
    Busy = 0x08,
    /// The engine is not in the ready state
    NotReady = 0x09,
}

impl Status {
    /// Statuses that the caller may continue after
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success | Self::RedundantCopyUsed)
    }
}

impl<T> From<&Result<T, Error>> for Status
where
    T: Into<Status> + Copy,
{
    fn from(result: &Result<T, Error>) -> Self {
        match result {
            Ok(value) => (*value).into(),
            Err(e) => e.status(),
        }
    }
}
