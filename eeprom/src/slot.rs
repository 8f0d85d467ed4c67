//! Implementation of the slot format
//!
//! Every slot starts with a header followed by the payload of its row:
//!
//! | bytes    | content                                   |
//! |----------|-------------------------------------------|
//! | `0..4`   | sequence number                           |
//! | `4..8`   | marker (erased, valid or retired)         |
//! | `8..12`  | crc over sequence, row, length and payload |
//! | `12..14` | logical row index                         |
//! | `14..16` | payload length                            |
//!
//! All fields are little endian.

use alloc::{vec, vec::Vec};
use core::ops::Range;

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// The size of the slot header in bytes
pub const HEADER_SIZE: usize = 16;

/// The value of an erased flash byte
pub const ERASED_BYTE: u8 = 0xFF;

const SEQUENCE_RANGE: Range<usize> = 0..4;
/// The marker is the only field that is rewritten without an erase
pub const MARKER_RANGE: Range<usize> = 4..8;
const CRC_RANGE: Range<usize> = 8..12;
const ROW_RANGE: Range<usize> = 12..14;
const LENGTH_RANGE: Range<usize> = 14..16;

/// The marker word of a slot
///
/// The values are ordered so that every transition only clears bits.
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
pub enum Marker {
    /// The slot has not been programmed since its last erase
    Erased = 0xFFFF_FFFF,
    /// The slot holds a generation of its row
    Valid = 0xEE50_C0DE,
    /// The slot has been superseded by a newer generation
    Retired = 0x0000_0000,
}

/// What a slot was found to contain
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SlotState {
    /// Every byte of the slot is erased
    Erased,
    /// The slot holds a valid generation
    Valid {
        /// The sequence number of the generation
        sequence: u32,
    },
    /// The slot held a generation that has since been superseded
    Retired,
    /// The slot holds data that does not pass validation
    Corrupt,
}

/// Returns true if `a` comes after `b` in the sequence number space.
/// The numbers are compared using serial number arithmetic, so they may wrap.
pub fn is_newer(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// Calculates the crc of a slot.
/// The marker is not included because it is burned in place when the slot is retired.
fn calculate_crc(sequence: u32, row: u16, payload: &[u8]) -> u32 {
    let crc = crc::Crc::<u32>::new(&crc::CRC_32_MPEG_2);
    let mut digest = crc.digest();
    digest.update(&sequence.to_le_bytes());
    digest.update(&row.to_le_bytes());
    digest.update(&(payload.len() as u16).to_le_bytes());
    digest.update(payload);
    digest.finalize()
}

fn read_u32(raw: &[u8], range: Range<usize>) -> u32 {
    let mut bytes = [0; 4];
    bytes.copy_from_slice(&raw[range]);
    u32::from_le_bytes(bytes)
}

fn read_u16(raw: &[u8], range: Range<usize>) -> u16 {
    let mut bytes = [0; 2];
    bytes.copy_from_slice(&raw[range]);
    u16::from_le_bytes(bytes)
}

/// Builds the image of a valid slot.
/// The image is padded with erased bytes up to the slot size.
pub fn encode(slot_size: usize, row: u16, sequence: u32, payload: &[u8]) -> Vec<u8> {
    debug_assert!(HEADER_SIZE + payload.len() <= slot_size);

    let mut image = vec![ERASED_BYTE; slot_size];
    image[SEQUENCE_RANGE].copy_from_slice(&sequence.to_le_bytes());
    image[MARKER_RANGE].copy_from_slice(&u32::from(Marker::Valid).to_le_bytes());
    image[CRC_RANGE].copy_from_slice(&calculate_crc(sequence, row, payload).to_le_bytes());
    image[ROW_RANGE].copy_from_slice(&row.to_le_bytes());
    image[LENGTH_RANGE].copy_from_slice(&(payload.len() as u16).to_le_bytes());
    image[HEADER_SIZE..HEADER_SIZE + payload.len()].copy_from_slice(payload);
    image
}

/// Validates the raw content of a slot that is expected to belong to the given row
pub fn inspect(raw: &[u8], row: u16) -> SlotState {
    if raw.iter().all(|b| *b == ERASED_BYTE) {
        return SlotState::Erased;
    }
    if raw.len() < HEADER_SIZE {
        return SlotState::Corrupt;
    }

    match Marker::try_from(read_u32(raw, MARKER_RANGE)) {
        Ok(Marker::Retired) => SlotState::Retired,
        Ok(Marker::Valid) => {
            let sequence = read_u32(raw, SEQUENCE_RANGE);
            let length = usize::from(read_u16(raw, LENGTH_RANGE));
            let stored_crc = read_u32(raw, CRC_RANGE);

            if read_u16(raw, ROW_RANGE) != row || HEADER_SIZE + length > raw.len() {
                return SlotState::Corrupt;
            }

            let payload = &raw[HEADER_SIZE..HEADER_SIZE + length];
            if calculate_crc(sequence, row, payload) == stored_crc {
                SlotState::Valid { sequence }
            } else {
                SlotState::Corrupt
            }
        }
        // A programmed slot with an erased marker was interrupted while being written
        Ok(Marker::Erased) | Err(_) => SlotState::Corrupt,
    }
}

/// The payload of a slot that passed [inspect]
pub fn payload(raw: &[u8]) -> &[u8] {
    let length = usize::from(read_u16(raw, LENGTH_RANGE));
    &raw[HEADER_SIZE..HEADER_SIZE + length]
}

/// Gets the part of the slot that has to be reprogrammed to retire it.
///
/// Returns the offset into the slot and the data to program. The data is the current
/// content of the program units that cover the marker, with the marker cleared.
pub fn retire_chunk(raw: &[u8], program_size: usize) -> (usize, Vec<u8>) {
    let start = MARKER_RANGE.start / program_size * program_size;
    let end = MARKER_RANGE.end.div_ceil(program_size) * program_size;

    let mut chunk = raw[start..end].to_vec();
    let marker = MARKER_RANGE.start - start..MARKER_RANGE.end - start;
    chunk[marker].copy_from_slice(&u32::from(Marker::Retired).to_le_bytes());
    (start, chunk)
}
