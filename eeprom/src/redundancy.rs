//! Reading rows with a fallback to the redundant copy, and bringing both copies
//! back in line after an interrupted write.
//!
//! Writes go to the primary copy first and to the redundant copy second, with the
//! same sequence number. A power loss while writing the primary copy leaves the
//! previous generation valid in both copies. A power loss while writing the
//! redundant copy leaves the new generation valid in the primary copy.
//! Either way [reconcile] finds a consistent generation at the next init.

use alloc::vec::Vec;

use tracing::{debug, warn};

use crate::{
    layout::{Layout, Replica},
    slot::{self, SlotState},
    wear::{self, read_slot, Cursor, FlashOp},
    Error, Flash, ReadStatus,
};

/// The cursors of both copies of one row
pub(crate) type RowCursors = [Option<Cursor>; 2];

pub(crate) fn cursor_of(cursors: &RowCursors, copy: Replica) -> Option<Cursor> {
    match copy {
        Replica::Primary => cursors[0],
        Replica::Redundant => cursors[1],
    }
}

pub(crate) fn set_cursor(cursors: &mut RowCursors, copy: Replica, cursor: Cursor) {
    match copy {
        Replica::Primary => cursors[0] = Some(cursor),
        Replica::Redundant => cursors[1] = Some(cursor),
    }
}

/// The sequence number for the next generation of a row
pub(crate) fn next_sequence(cursors: &RowCursors) -> u32 {
    cursors
        .iter()
        .flatten()
        .map(|cursor| cursor.sequence)
        .reduce(|a, b| if slot::is_newer(a, b) { a } else { b })
        .map_or(0, |newest| newest.wrapping_add(1))
}

/// Reads the payload of the current slot of one copy.
/// Returns `None` if the slot no longer holds the generation the cursor points at.
fn read_current(
    flash: &impl Flash,
    layout: &Layout,
    copy: Replica,
    row: usize,
    cursor: Cursor,
) -> Result<Option<Vec<u8>>, Error> {
    let raw = read_slot(flash, layout.slot_address(copy, row, cursor.slot), layout.slot_size())?;

    match slot::inspect(&raw, row as u16) {
        SlotState::Valid { sequence } if sequence == cursor.sequence => {
            Ok(Some(slot::payload(&raw).to_vec()))
        }
        state => {
            warn!(
                "Row {} ({:?}) slot {} is {:?}, expected generation {}",
                row, copy, cursor.slot, state, cursor.sequence
            );
            Ok(None)
        }
    }
}

/// Reads the current data of a row into `out`, which is as long as the row's logical span.
/// Rows that have never been written read as zeros.
pub(crate) fn read_row(
    flash: &impl Flash,
    layout: &Layout,
    row: usize,
    cursors: &RowCursors,
    out: &mut [u8],
) -> Result<ReadStatus, Error> {
    out.fill(0);

    if cursors.iter().all(Option::is_none) {
        return Ok(ReadStatus::Success);
    }

    for &copy in layout.copies() {
        let Some(cursor) = cursor_of(cursors, copy) else {
            continue;
        };
        if let Some(payload) = read_current(flash, layout, copy, row, cursor)? {
            let len = payload.len().min(out.len());
            out[..len].copy_from_slice(&payload[..len]);

            return Ok(match copy {
                Replica::Primary => ReadStatus::Success,
                Replica::Redundant => {
                    warn!("Row {} is read from the redundant copy", row);
                    ReadStatus::RedundantCopyUsed
                }
            });
        }
    }

    Err(Error::CorruptedData { row })
}

/// What a scan found in the slots of one copy of a row
#[derive(Debug, Default)]
struct GroupScan {
    /// The newest valid slot
    newest: Option<Cursor>,
    /// Valid slots that are older than the newest one
    stale: Vec<usize>,
    /// Whether any slot has been retired
    retired: bool,
    /// Slots that hold data that is neither valid nor retired
    corrupt: Vec<usize>,
}

impl GroupScan {
    /// Whether any slot has been programmed since the last erase
    fn is_written(&self) -> bool {
        self.newest.is_some() || self.retired || !self.corrupt.is_empty()
    }
}

fn scan_group(flash: &impl Flash, layout: &Layout, copy: Replica, row: usize) -> Result<GroupScan, Error> {
    let mut scan = GroupScan::default();
    let mut valid = Vec::new();

    for (slot, address) in layout.group_addresses(copy, row).enumerate() {
        let raw = read_slot(flash, address, layout.slot_size())?;
        match slot::inspect(&raw, row as u16) {
            SlotState::Valid { sequence } => valid.push(Cursor { slot, sequence }),
            SlotState::Erased => {}
            SlotState::Retired => scan.retired = true,
            SlotState::Corrupt => scan.corrupt.push(slot),
        }
    }

    for cursor in valid {
        match scan.newest {
            Some(newest) if slot::is_newer(newest.sequence, cursor.sequence) => {
                scan.stale.push(cursor.slot)
            }
            Some(newest) => {
                scan.stale.push(newest.slot);
                scan.newest = Some(cursor);
            }
            None => scan.newest = Some(cursor),
        }
    }

    Ok(scan)
}

/// Whether the only data of a row is a primary slot whose first write was cut short.
///
/// The redundant copy is written after the primary copy is verified, so an erased
/// redundant group means no generation of the row was ever committed.
fn is_interrupted_first_write(scans: &[GroupScan]) -> bool {
    match scans {
        [primary, redundant] => {
            !primary.retired && !primary.corrupt.is_empty() && !redundant.is_written()
        }
        _ => false,
    }
}

/// Restores the invariants of one row and returns the cursors of its copies.
///
/// Superseded slots that were not retired are retired, and a copy that lags behind
/// or lost its data is rewritten from the other copy.
pub(crate) fn reconcile(flash: &mut impl Flash, layout: &Layout, row: usize) -> Result<RowCursors, Error> {
    let mut cursors: RowCursors = [None, None];
    let mut scans = Vec::with_capacity(layout.copies().len());

    for &copy in layout.copies() {
        let scan = scan_group(&*flash, layout, copy, row)?;

        for &slot in &scan.stale {
            warn!("Row {} ({:?}) slot {} was not retired, retiring it now", row, copy, slot);
            let op = wear::plan_retire(&*flash, layout, copy, row, slot)?;
            wear::execute(flash, &[op], |_| {})?;
        }

        if let Some(newest) = scan.newest {
            set_cursor(&mut cursors, copy, newest);
        }
        scans.push(scan);
    }

    let newest = layout
        .copies()
        .iter()
        .filter_map(|&copy| cursor_of(&cursors, copy).map(|cursor| (copy, cursor)))
        .reduce(|a, b| if slot::is_newer(b.1.sequence, a.1.sequence) { b } else { a });

    let Some((source, source_cursor)) = newest else {
        if is_interrupted_first_write(&scans) {
            warn!("Row {} holds a first write that never completed, erasing it", row);
            let ops: Vec<_> = scans[0]
                .corrupt
                .iter()
                .map(|&slot| FlashOp::Erase {
                    address: layout.slot_address(Replica::Primary, row, slot),
                    len: layout.slot_size(),
                })
                .collect();
            wear::execute(flash, &ops, |_| {})?;
            return Ok(cursors);
        }
        if scans.iter().any(GroupScan::is_written) {
            return Err(Error::Initialization { row });
        }
        debug!("Row {} has never been written", row);
        return Ok(cursors);
    };

    for &copy in layout.copies() {
        let current = cursor_of(&cursors, copy);
        if current.map(|cursor| cursor.sequence) == Some(source_cursor.sequence) {
            continue;
        }

        warn!(
            "Row {} ({:?}) is behind the {:?} copy, restoring generation {}",
            row, copy, source, source_cursor.sequence
        );
        let payload = read_current(&*flash, layout, source, row, source_cursor)?
            .ok_or(Error::Initialization { row })?;
        let ops = wear::plan_row_write(
            &*flash,
            layout,
            copy,
            row,
            current,
            source_cursor.sequence,
            &payload,
        )?;
        wear::execute(flash, &ops, |commit| set_cursor(&mut cursors, commit.copy, commit.cursor))?;
    }

    Ok(cursors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        layout::{Config, StorageRegion},
        sim::RamFlash,
        slot::HEADER_SIZE,
        FlashGeometry,
    };

    const GEOMETRY: FlashGeometry = FlashGeometry {
        base_address: 0,
        capacity: 2048,
        program_size: 8,
        erase_size: 64,
    };

    fn layout(redundant_copy: bool) -> Layout {
        let config = Config {
            eeprom_size: 48,
            blocking_write: true,
            redundant_copy,
            wear_leveling_factor: 2,
            simple_mode: false,
            storage: StorageRegion {
                base_address: 0,
                size: 2048,
            },
        };
        Layout::new(&config, GEOMETRY).unwrap()
    }

    fn write(flash: &mut RamFlash, layout: &Layout, cursors: &mut RowCursors, payload: &[u8]) {
        let sequence = next_sequence(cursors);
        for &copy in layout.copies() {
            let ops = wear::plan_row_write(&*flash, layout, copy, 0, cursor_of(cursors, copy), sequence, payload)
                .unwrap();
            wear::execute(flash, &ops, |commit| set_cursor(cursors, commit.copy, commit.cursor)).unwrap();
        }
    }

    fn read(flash: &RamFlash, layout: &Layout, cursors: &RowCursors) -> Result<(ReadStatus, Vec<u8>), Error> {
        let mut out = [0xAA; 48];
        let status = read_row(flash, layout, 0, cursors, &mut out)?;
        Ok((status, out.to_vec()))
    }

    fn payload(fill: u8) -> Vec<u8> {
        alloc::vec![fill; 48]
    }

    #[test]
    fn unwritten_row_reads_as_zeros() {
        let layout = layout(true);
        let flash = RamFlash::new(GEOMETRY);
        assert_eq!(read(&flash, &layout, &[None, None]), Ok((ReadStatus::Success, payload(0))));
    }

    #[test]
    fn corrupted_primary_falls_back_to_the_redundant_copy() {
        let layout = layout(true);
        let mut flash = RamFlash::new(GEOMETRY);
        let mut cursors = [None, None];
        write(&mut flash, &layout, &mut cursors, &payload(1));
        write(&mut flash, &layout, &mut cursors, &payload(2));

        let primary = layout.slot_address(Replica::Primary, 0, cursors[0].unwrap().slot) as usize;
        flash.image_mut()[primary + HEADER_SIZE] ^= 0x10;

        assert_eq!(
            read(&flash, &layout, &cursors),
            Ok((ReadStatus::RedundantCopyUsed, payload(2)))
        );
    }

    #[test]
    fn both_copies_corrupted_is_an_error() {
        let layout = layout(true);
        let mut flash = RamFlash::new(GEOMETRY);
        let mut cursors = [None, None];
        write(&mut flash, &layout, &mut cursors, &payload(1));

        for copy in [Replica::Primary, Replica::Redundant] {
            let address = layout.slot_address(copy, 0, 0) as usize;
            flash.image_mut()[address + 8] ^= 0x01;
        }

        assert_eq!(read(&flash, &layout, &cursors), Err(Error::CorruptedData { row: 0 }));
    }

    #[test]
    fn reconcile_finds_the_written_generation() {
        let layout = layout(true);
        let mut flash = RamFlash::new(GEOMETRY);
        let mut cursors = [None, None];
        write(&mut flash, &layout, &mut cursors, &payload(1));
        write(&mut flash, &layout, &mut cursors, &payload(2));
        write(&mut flash, &layout, &mut cursors, &payload(3));

        assert_eq!(reconcile(&mut flash, &layout, 0), Ok(cursors));
        assert_eq!(next_sequence(&cursors), 3);
    }

    #[test]
    fn reconcile_retires_a_slot_left_valid_by_a_power_loss() {
        let layout = layout(false);
        let mut flash = RamFlash::new(GEOMETRY);
        let mut cursors = [None, None];
        write(&mut flash, &layout, &mut cursors, &payload(1));

        // The second generation is programmed but the first is never retired
        let ops = wear::plan_row_write(&flash, &layout, Replica::Primary, 0, cursors[0], 1, &payload(2)).unwrap();
        wear::execute(&mut flash, &ops[..1], |_| {}).unwrap();

        let repaired = reconcile(&mut flash, &layout, 0).unwrap();
        assert_eq!(repaired[0], Some(Cursor { slot: 1, sequence: 1 }));

        let raw = read_slot(&flash, layout.slot_address(Replica::Primary, 0, 0), 64).unwrap();
        assert_eq!(slot::inspect(&raw, 0), SlotState::Retired);
        assert_eq!(read(&flash, &layout, &repaired), Ok((ReadStatus::Success, payload(2))));
    }

    #[test]
    fn reconcile_restores_a_lagging_redundant_copy() {
        let layout = layout(true);
        let mut flash = RamFlash::new(GEOMETRY);
        let mut cursors = [None, None];
        write(&mut flash, &layout, &mut cursors, &payload(1));

        // Power is lost after the primary copy of the second generation is written
        let ops = wear::plan_row_write(&flash, &layout, Replica::Primary, 0, cursors[0], 1, &payload(2)).unwrap();
        wear::execute(&mut flash, &ops, |_| {}).unwrap();

        let repaired = reconcile(&mut flash, &layout, 0).unwrap();
        assert_eq!(repaired[0].unwrap().sequence, 1);
        assert_eq!(repaired[1].unwrap().sequence, 1);

        // Both copies now hold the second generation
        let primary = layout.slot_address(Replica::Primary, 0, repaired[0].unwrap().slot) as usize;
        flash.image_mut()[primary + HEADER_SIZE] ^= 0x01;
        assert_eq!(
            read(&flash, &layout, &repaired),
            Ok((ReadStatus::RedundantCopyUsed, payload(2)))
        );
    }

    #[test]
    fn reconcile_rebuilds_a_destroyed_primary_copy() {
        let layout = layout(true);
        let mut flash = RamFlash::new(GEOMETRY);
        let mut cursors = [None, None];
        write(&mut flash, &layout, &mut cursors, &payload(7));

        let primary = layout.slot_address(Replica::Primary, 0, 0) as usize;
        flash.image_mut()[primary + HEADER_SIZE] ^= 0x01;

        let repaired = reconcile(&mut flash, &layout, 0).unwrap();
        assert_eq!(repaired[0], Some(Cursor { slot: 0, sequence: 0 }));
        assert_eq!(read(&flash, &layout, &repaired), Ok((ReadStatus::Success, payload(7))));
    }

    #[test]
    fn reconcile_fails_when_no_copy_survives() {
        let layout = layout(false);
        let mut flash = RamFlash::new(GEOMETRY);
        let mut cursors = [None, None];
        write(&mut flash, &layout, &mut cursors, &payload(7));
        flash.image_mut()[HEADER_SIZE] ^= 0x01;

        assert_eq!(reconcile(&mut flash, &layout, 0), Err(Error::Initialization { row: 0 }));
    }

    #[test]
    fn reconcile_forgets_an_interrupted_first_write() {
        let layout = layout(true);
        let mut flash = RamFlash::new(GEOMETRY);

        // Power is lost after the first three program units of the very first slot
        let image = slot::encode(64, 0, 0, &payload(7));
        flash.program_row(0, &image[..24]).unwrap();

        assert_eq!(reconcile(&mut flash, &layout, 0), Ok([None, None]));
        let raw = read_slot(&flash, layout.slot_address(Replica::Primary, 0, 0), 64).unwrap();
        assert_eq!(slot::inspect(&raw, 0), SlotState::Erased);
        assert_eq!(read(&flash, &layout, &[None, None]), Ok((ReadStatus::Success, payload(0))));

        let mut cursors = [None, None];
        write(&mut flash, &layout, &mut cursors, &payload(8));
        assert_eq!(reconcile(&mut flash, &layout, 0), Ok(cursors));
        assert_eq!(read(&flash, &layout, &cursors), Ok((ReadStatus::Success, payload(8))));
    }

    #[test]
    fn reconcile_keeps_failing_when_the_redundant_copy_was_written() {
        let layout = layout(true);
        let mut flash = RamFlash::new(GEOMETRY);
        let mut cursors = [None, None];
        write(&mut flash, &layout, &mut cursors, &payload(7));

        for copy in [Replica::Primary, Replica::Redundant] {
            let address = layout.slot_address(copy, 0, 0) as usize;
            flash.image_mut()[address + HEADER_SIZE] ^= 0x01;
        }

        assert_eq!(reconcile(&mut flash, &layout, 0), Err(Error::Initialization { row: 0 }));
    }

    #[test]
    fn reconcile_keeps_failing_when_a_slot_was_retired() {
        let layout = layout(true);
        let mut flash = RamFlash::new(GEOMETRY);
        let mut cursors = [None, None];
        write(&mut flash, &layout, &mut cursors, &payload(1));
        write(&mut flash, &layout, &mut cursors, &payload(2));

        // Primary slot 0 is retired and slot 1 is damaged, the redundant copy is gone
        let primary = layout.slot_address(Replica::Primary, 0, 1) as usize;
        flash.image_mut()[primary + HEADER_SIZE] ^= 0x01;
        for slot in 0..2 {
            let address = layout.slot_address(Replica::Redundant, 0, slot);
            flash.erase_sector(address).unwrap();
        }

        assert_eq!(reconcile(&mut flash, &layout, 0), Err(Error::Initialization { row: 0 }));
    }
}
