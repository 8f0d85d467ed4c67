//! Randomized checks of the logical image against a plain byte array model

use em_eeprom::{sim::RamFlash, Config, Eeprom, FlashGeometry, ReadStatus, StorageRegion, WriteStatus};
use proptest::prelude::*;

const GEOMETRY: FlashGeometry = FlashGeometry {
    base_address: 0x1000_0000,
    capacity: 0x4000,
    program_size: 8,
    erase_size: 64,
};

const EEPROM_SIZE: usize = 200;

fn engine(wear_leveling_factor: usize, redundant_copy: bool, blocking_write: bool) -> Eeprom<RamFlash> {
    let mut flash = RamFlash::new(GEOMETRY);
    if !blocking_write {
        flash.set_busy_polls(2);
    }

    let mut eeprom = Eeprom::new(flash);
    eeprom
        .init(Config {
            eeprom_size: EEPROM_SIZE,
            blocking_write,
            redundant_copy,
            wear_leveling_factor,
            simple_mode: false,
            storage: StorageRegion {
                base_address: GEOMETRY.base_address,
                size: GEOMETRY.capacity,
            },
        })
        .unwrap();
    eeprom
}

fn write(eeprom: &mut Eeprom<RamFlash>, offset: usize, data: &[u8]) {
    let mut status = eeprom.write(offset, data).unwrap();
    while status == WriteStatus::Pending {
        status = eeprom.poll().unwrap();
    }
}

/// An offset and data that fit in the image
fn access() -> impl Strategy<Value = (usize, Vec<u8>)> {
    (0..EEPROM_SIZE).prop_flat_map(|offset| {
        (
            Just(offset),
            prop::collection::vec(any::<u8>(), 1..=EEPROM_SIZE - offset),
        )
    })
}

proptest! {
    #[test]
    fn written_data_reads_back(
        (offset, data) in access(),
        wear_leveling_factor in 1..=4usize,
        redundant_copy in any::<bool>(),
    ) {
        let mut eeprom = engine(wear_leveling_factor, redundant_copy, true);
        write(&mut eeprom, offset, &data);

        let mut buffer = vec![0; data.len()];
        prop_assert_eq!(eeprom.read(offset, &mut buffer), Ok(ReadStatus::Success));
        prop_assert_eq!(buffer, data);
    }

    #[test]
    fn image_matches_a_byte_array(
        accesses in prop::collection::vec(access(), 1..12),
        wear_leveling_factor in 1..=3usize,
        redundant_copy in any::<bool>(),
        blocking_write in any::<bool>(),
    ) {
        let mut eeprom = engine(wear_leveling_factor, redundant_copy, blocking_write);
        let mut model = vec![0; EEPROM_SIZE];

        for (offset, data) in accesses {
            write(&mut eeprom, offset, &data);
            model[offset..offset + data.len()].copy_from_slice(&data);
        }

        let mut image = vec![0xAA; EEPROM_SIZE];
        prop_assert_eq!(eeprom.read(0, &mut image), Ok(ReadStatus::Success));
        prop_assert_eq!(image, model);
    }

    #[test]
    fn partial_write_keeps_the_rest_of_the_row(
        prefix in prop::collection::vec(any::<u8>(), 13),
        counter in prop::collection::vec(any::<u8>(), 2),
    ) {
        let mut eeprom = engine(2, true, true);
        write(&mut eeprom, 0, &prefix);
        write(&mut eeprom, 13, &counter);

        let mut record = [0; 15];
        eeprom.read(0, &mut record).unwrap();
        prop_assert_eq!(&record[..13], &prefix[..]);
        prop_assert_eq!(&record[13..], &counter[..]);
    }
}
