//! Planning of row writes that rotate over the slots of a row group
//!
//! A write never touches the current slot of a group. The next slot in the rotation
//! is erased if needed and programmed with the new generation, and only after that
//! the previous slot is retired. A power loss at any point leaves either the old or
//! the new generation valid.

use alloc::{vec, vec::Vec};

use tracing::debug;

use crate::{
    layout::{Layout, Replica},
    slot::{self, ERASED_BYTE},
    Error, Flash, FlashError,
};

/// The RAM record of the current slot of a row group
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct Cursor {
    pub slot: usize,
    pub sequence: u32,
}

/// What to record once an operation has been verified
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct Commit {
    pub copy: Replica,
    pub row: usize,
    pub cursor: Cursor,
}

/// A single physical flash operation
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) enum FlashOp {
    Erase {
        address: u32,
        len: usize,
    },
    Program {
        address: u32,
        data: Vec<u8>,
        commit: Option<Commit>,
    },
}

impl FlashOp {
    /// Starts or performs the operation on the flash
    pub fn issue(&self, flash: &mut impl Flash, blocking: bool) -> Result<(), Error> {
        match self {
            Self::Erase { address, .. } => {
                let result = if blocking {
                    flash.erase_sector(*address)
                } else {
                    flash.start_erase_sector(*address)
                };
                result.map_err(|source| Error::Erase {
                    address: *address,
                    source,
                })
            }
            Self::Program { address, data, .. } => {
                let result = if blocking {
                    flash.program_row(*address, data)
                } else {
                    flash.start_program_row(*address, data)
                };
                result.map_err(|source| Error::Write {
                    address: *address,
                    source,
                })
            }
        }
    }

    /// Reads back the affected flash and checks that the operation took effect
    pub fn verify(&self, flash: &impl Flash) -> Result<(), Error> {
        match self {
            Self::Erase { address, len } => {
                let raw = read_slot(flash, *address, *len)?;
                match raw.iter().position(|b| *b != ERASED_BYTE) {
                    None => Ok(()),
                    Some(index) => Err(Error::Erase {
                        address: *address,
                        source: FlashError::VerifyMismatch {
                            address: *address + index as u32,
                        },
                    }),
                }
            }
            Self::Program { address, data, .. } => {
                let raw = read_slot(flash, *address, data.len())?;
                match raw.iter().zip(data).position(|(stored, expected)| stored != expected) {
                    None => Ok(()),
                    Some(index) => Err(Error::Write {
                        address: *address,
                        source: FlashError::VerifyMismatch {
                            address: *address + index as u32,
                        },
                    }),
                }
            }
        }
    }

    /// The cursor update this operation makes once it has been verified
    pub fn commit(&self) -> Option<Commit> {
        match self {
            Self::Erase { .. } => None,
            Self::Program { commit, .. } => *commit,
        }
    }
}

/// Reads `len` bytes of raw flash
pub(crate) fn read_slot(flash: &impl Flash, address: u32, len: usize) -> Result<Vec<u8>, Error> {
    let mut raw = vec![0; len];
    flash
        .read_raw(address, &mut raw)
        .map_err(|source| Error::Read { address, source })?;
    Ok(raw)
}

fn erase_if_needed(ops: &mut Vec<FlashOp>, raw: &[u8], address: u32) {
    if raw.iter().any(|b| *b != ERASED_BYTE) {
        debug!("Slot {:#010X} is in use and is erased before reuse", address);
        ops.push(FlashOp::Erase {
            address,
            len: raw.len(),
        });
    }
}

/// Plans the retirement of a slot that is no longer current
pub(crate) fn plan_retire(
    flash: &impl Flash,
    layout: &Layout,
    copy: Replica,
    row: usize,
    slot: usize,
) -> Result<FlashOp, Error> {
    let address = layout.slot_address(copy, row, slot);
    let raw = read_slot(flash, address, layout.slot_size())?;
    let (offset, chunk) = slot::retire_chunk(&raw, layout.program_size());

    Ok(FlashOp::Program {
        address: address + offset as u32,
        data: chunk,
        commit: None,
    })
}

/// Plans writing a new generation of a row to one copy.
///
/// Returns the operations in the order they have to be performed.
/// The last program of the new slot carries the cursor of the copy after the write.
pub(crate) fn plan_row_write(
    flash: &impl Flash,
    layout: &Layout,
    copy: Replica,
    row: usize,
    current: Option<Cursor>,
    sequence: u32,
    payload: &[u8],
) -> Result<Vec<FlashOp>, Error> {
    let next = current.map_or(0, |cursor| (cursor.slot + 1) % layout.wear_leveling_factor());
    let address = layout.slot_address(copy, row, next);

    debug!(
        "Writing row {} ({:?}) generation {} to slot {} at {:#010X}",
        row, copy, sequence, next, address
    );

    let mut ops = Vec::with_capacity(3);
    erase_if_needed(&mut ops, &read_slot(flash, address, layout.slot_size())?, address);

    ops.push(FlashOp::Program {
        address,
        data: slot::encode(layout.slot_size(), row as u16, sequence, payload),
        commit: Some(Commit {
            copy,
            row,
            cursor: Cursor {
                slot: next,
                sequence,
            },
        }),
    });

    // With a single slot the erase already removed the previous generation
    if let Some(previous) = current.filter(|cursor| cursor.slot != next) {
        ops.push(plan_retire(flash, layout, copy, row, previous.slot)?);
    }

    Ok(ops)
}

/// Plans writing a row in simple mode, where the data is stored without a header
pub(crate) fn plan_simple_write(
    flash: &impl Flash,
    layout: &Layout,
    row: usize,
    data: &[u8],
) -> Result<Vec<FlashOp>, Error> {
    let address = layout.slot_address(Replica::Primary, row, 0);
    let mut image = vec![ERASED_BYTE; layout.slot_size()];
    image[..data.len()].copy_from_slice(data);

    let mut ops = Vec::with_capacity(2);
    erase_if_needed(&mut ops, &read_slot(flash, address, layout.slot_size())?, address);
    ops.push(FlashOp::Program {
        address,
        data: image,
        commit: None,
    });
    Ok(ops)
}

/// Performs the operations one after another, verifying each
pub(crate) fn execute(
    flash: &mut impl Flash,
    ops: &[FlashOp],
    mut on_commit: impl FnMut(Commit),
) -> Result<(), Error> {
    for op in ops {
        op.issue(flash, true)?;
        op.verify(&*flash)?;
        if let Some(commit) = op.commit() {
            on_commit(commit);
        }
    }
    Ok(())
}
