//! Demo configuration from CLI arguments and environment variables
//!
//! Every option can be given as `--option` or through its `EM_EEPROM_*` variable.
//! The defaults are the settings of the board demo.

use std::path::PathBuf;

use clap::Parser;
use em_eeprom::{physical_size, Config, StorageRegion};

use crate::flash::DEVICE_GEOMETRY;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "em-eeprom-demo",
    about = "Counts power cycles in an emulated EEPROM kept in a flash image",
    version
)]
pub struct DemoConfig {
    /// The file that holds the content of the flash
    #[arg(long, env = "EM_EEPROM_IMAGE", default_value = "em_eeprom.bin")]
    pub image: PathBuf,

    /// Logical size of the emulated EEPROM in bytes
    #[arg(long, env = "EM_EEPROM_SIZE", default_value_t = 256)]
    pub eeprom_size: usize,

    /// Number of slots the writes of a row rotate over (1 to 10)
    #[arg(long, env = "EM_EEPROM_WEAR_LEVELING", default_value_t = 2)]
    pub wear_leveling: usize,

    /// Do not keep a redundant copy of the data
    #[arg(long, env = "EM_EEPROM_NO_REDUNDANT_COPY")]
    pub no_redundant_copy: bool,

    /// Queue writes and poll them to completion
    #[arg(long, env = "EM_EEPROM_NON_BLOCKING")]
    pub non_blocking: bool,

    /// Store the data without headers, wear leveling or redundancy
    #[arg(long, env = "EM_EEPROM_SIMPLE_MODE")]
    pub simple_mode: bool,

    /// Flash address of the storage, aligned to a row
    #[arg(
        long,
        env = "EM_EEPROM_BASE_ADDRESS",
        default_value = "0x14000000",
        value_parser = parse_address
    )]
    pub base_address: u32,

    /// Number of power cycles to run
    #[arg(long, env = "EM_EEPROM_BOOTS", default_value_t = 1)]
    pub boots: u32,
}

impl DemoConfig {
    /// The engine configuration, with the storage sized for the requested layout
    pub fn eeprom_config(&self) -> Config {
        let redundant_copy = !self.no_redundant_copy;

        Config {
            eeprom_size: self.eeprom_size,
            blocking_write: !self.non_blocking,
            redundant_copy,
            wear_leveling_factor: self.wear_leveling,
            simple_mode: self.simple_mode,
            storage: StorageRegion {
                base_address: self.base_address,
                size: physical_size(
                    self.eeprom_size,
                    self.simple_mode,
                    self.wear_leveling,
                    redundant_copy,
                    DEVICE_GEOMETRY,
                ),
            },
        }
    }
}

/// Parses a decimal or `0x` prefixed hexadecimal address. Underscores are ignored.
fn parse_address(value: &str) -> Result<u32, String> {
    let value = value.replace('_', "");
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|e| format!("invalid address `{}`: {}", value, e))
}
