//! One boot of the power cycle application
//!
//! The application reads its record, writes the initial record if there is none
//! and otherwise counts the boot. Any engine error halts the application, except for
//! data that was recovered from the redundant copy.

use std::io::Write;

use em_eeprom::{Config, Eeprom, Error, Flash, Status, WriteStatus};
use tracing::{error, info, warn};

use crate::{
    record::{Record, COUNTER_RANGE, RECORD_SIZE},
    serial::Serial,
    uprintln,
};

/// The application stopped on an engine error
#[derive(Debug, thiserror::Error)]
#[error("{message} (status {status:?})")]
pub struct Halted {
    pub message: &'static str,
    pub status: Status,
}

/// Decides whether the application can continue after an engine call
fn handle<T, W>(result: &Result<T, Error>, message: &'static str, serial: &mut Serial<W>) -> anyhow::Result<()>
where
    T: Into<Status> + Copy,
    W: Write,
{
    let status = Status::from(result);
    if status == Status::RedundantCopyUsed {
        uprintln!(serial, "Main copy is corrupted. Redundant copy in Emulated EEPROM is used")?;
    }
    if status.is_success() {
        return Ok(());
    }

    if let Err(e) = result {
        error!("{}", e);
    }
    uprintln!(serial, "{}", message)?;
    warn!("User LED off, halting");
    Err(Halted { message, status }.into())
}

/// Writes and polls a non-blocking write until it is done
fn write<F: Flash>(eeprom: &mut Eeprom<F>, offset: usize, data: &[u8]) -> Result<WriteStatus, Error> {
    let mut result = eeprom.write(offset, data);
    while let Ok(WriteStatus::Pending) = result {
        result = eeprom.poll();
    }
    result
}

/// Runs the application once on a freshly reset device and returns the record it printed
pub fn boot<F, W>(eeprom: &mut Eeprom<F>, config: Config, serial: &mut Serial<W>) -> anyhow::Result<Record>
where
    F: Flash,
    W: Write,
{
    uprintln!(serial, "EmEEPROM demo")?;

    let result = eeprom.init(config).map(|()| Status::Success);
    handle(&result, "Emulated EEPROM Initialization Error", serial)?;

    let mut bytes = [0; RECORD_SIZE];
    let result = eeprom.read(0, &mut bytes);
    handle(&result, "Emulated EEPROM Read failed", serial)?;

    let mut record = Record::new(bytes);
    let result = if record.is_initialized() {
        record.increment();
        write(eeprom, COUNTER_RANGE.start, record.counter())
    } else {
        info!("No record found, writing the initial record");
        write(eeprom, 0, Record::initial().as_bytes())
    };
    handle(&result, "Emulated EEPROM Write failed", serial)?;

    let result = eeprom.read(0, &mut bytes);
    handle(&result, "Emulated EEPROM Read failed", serial)?;

    serial.write_bytes(&bytes)?;
    uprintln!(serial, "")?;
    Ok(Record::new(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::{FileFlash, DEVICE_GEOMETRY};
    use em_eeprom::{physical_size, sim::RamFlash, ReadStatus, StorageRegion};
    use pretty_assertions::assert_eq;

    fn config(blocking_write: bool) -> Config {
        Config {
            eeprom_size: 256,
            blocking_write,
            redundant_copy: true,
            wear_leveling_factor: 2,
            simple_mode: false,
            storage: StorageRegion {
                base_address: DEVICE_GEOMETRY.base_address,
                size: physical_size(256, false, 2, true, DEVICE_GEOMETRY),
            },
        }
    }

    /// Boots once and returns the flash and what was printed
    fn run(flash: RamFlash, config: Config) -> (RamFlash, anyhow::Result<Record>, String) {
        let mut eeprom = Eeprom::new(flash);
        let mut serial = Serial::new(Vec::new());
        let result = boot(&mut eeprom, config, &mut serial);
        let output = String::from_utf8(serial.into_inner()).unwrap();
        (eeprom.release(), result, output)
    }

    #[test]
    fn first_boot_writes_the_initial_record() {
        let (_, record, output) = run(RamFlash::new(DEVICE_GEOMETRY), config(true));
        assert_eq!(record.unwrap(), Record::initial());
        assert_eq!(output, "EmEEPROM demo\r\nPower Cycle# 00\r\n");
    }

    #[test]
    fn later_boots_count() {
        let mut flash = RamFlash::new(DEVICE_GEOMETRY);
        for _ in 0..11 {
            let (next, record, _) = run(flash, config(true));
            record.unwrap();
            flash = next;
        }

        let (_, record, output) = run(flash, config(true));
        assert_eq!(record.unwrap().as_bytes(), b"Power Cycle# 11");
        assert_eq!(output, "EmEEPROM demo\r\nPower Cycle# 11\r\n");
    }

    #[test]
    fn count_survives_in_the_image_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("em_eeprom.bin");

        for expected in [b"00", b"01", b"02"] {
            let mut eeprom = Eeprom::new(FileFlash::open(&path, DEVICE_GEOMETRY).unwrap());
            let mut serial = Serial::new(Vec::new());
            let record = boot(&mut eeprom, config(true), &mut serial).unwrap();
            assert_eq!(record.counter(), expected);
        }
    }

    #[test]
    fn non_blocking_writes_are_polled_to_completion() {
        let mut flash = RamFlash::new(DEVICE_GEOMETRY);
        flash.set_busy_polls(3);

        let (flash, record, _) = run(flash, config(false));
        assert_eq!(record.unwrap(), Record::initial());
        let (_, record, _) = run(flash, config(false));
        assert_eq!(record.unwrap().counter(), b"01");
    }

    #[test]
    fn rejected_config_halts() {
        let mut config = config(true);
        config.wear_leveling_factor = 11;

        let (_, result, output) = run(RamFlash::new(DEVICE_GEOMETRY), config);
        let halted = result.unwrap_err().downcast::<Halted>().unwrap();
        assert_eq!(halted.status, Status::ConfigurationError);
        assert_eq!(output, "EmEEPROM demo\r\nEmulated EEPROM Initialization Error\r\n");
    }

    #[test]
    fn failed_write_halts() {
        let mut flash = RamFlash::new(DEVICE_GEOMETRY);
        flash.fail_next_program();

        let (_, result, output) = run(flash, config(true));
        let halted = result.unwrap_err().downcast::<Halted>().unwrap();
        assert_eq!(halted.status, Status::WriteError);
        assert!(output.ends_with("Emulated EEPROM Write failed\r\n"));
    }

    #[test]
    fn recovered_data_does_not_halt() {
        let mut serial = Serial::new(Vec::new());
        let result: Result<ReadStatus, Error> = Ok(ReadStatus::RedundantCopyUsed);
        handle(&result, "Emulated EEPROM Read failed", &mut serial).unwrap();
        assert_eq!(
            serial.into_inner(),
            b"Main copy is corrupted. Redundant copy in Emulated EEPROM is used\r\n"
        );
    }
}
