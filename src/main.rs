use std::io;

use clap::Parser;
use em_eeprom::Eeprom;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::{
    config::DemoConfig,
    flash::{FileFlash, DEVICE_GEOMETRY},
    serial::Serial,
};

mod app;
mod config;
mod flash;
mod record;
mod serial;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    let demo = DemoConfig::parse();
    let config = demo.eeprom_config();
    info!("Using {:?}", config);

    let mut serial = Serial::new(io::stdout());

    for power_cycle in 1..=demo.boots {
        info!("Power cycle {} of {}", power_cycle, demo.boots);

        // Every boot starts from what is in the image, like a reset does
        let flash = FileFlash::open(&demo.image, DEVICE_GEOMETRY)?;
        let mut eeprom = Eeprom::new(flash);
        app::boot(&mut eeprom, config, &mut serial)?;
    }

    Ok(())
}
