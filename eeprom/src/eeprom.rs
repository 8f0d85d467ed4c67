//! Implementation of the emulated EEPROM engine

use alloc::{collections::VecDeque, vec, vec::Vec};
use core::ops::Range;

use tracing::{debug, info, warn};

use crate::{
    layout::{Config, Layout, Replica},
    redundancy::{self, RowCursors},
    slot::ERASED_BYTE,
    wear::{self, read_slot, FlashOp},
    Error, Flash, Status,
};

/// The lifecycle state of an engine
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum State {
    /// [Eeprom::init] has not been called yet
    Uninitialized,
    /// [Eeprom::init] is scanning and repairing the storage
    Initializing,
    /// Reads and writes are served
    Ready,
    /// Unrecoverable corruption was found. Only a successful init or an erase recovers.
    Faulted,
}

/// The outcome of a successful read
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ReadStatus {
    /// All data came from the primary copy
    Success,
    /// Part of the data came from the redundant copy because the primary copy is corrupted
    RedundantCopyUsed,
}

impl From<ReadStatus> for Status {
    fn from(status: ReadStatus) -> Self {
        match status {
            ReadStatus::Success => Status::Success,
            ReadStatus::RedundantCopyUsed => Status::RedundantCopyUsed,
        }
    }
}

/// The outcome of a successful write or poll
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum WriteStatus {
    /// All flash operations have completed
    Complete,
    /// Flash operations are still in progress, call [Eeprom::poll] until the write completes
    Pending,
}

impl From<WriteStatus> for Status {
    fn from(_: WriteStatus) -> Self {
        Status::Success
    }
}

/// An emulated EEPROM on top of a flash device
///
/// The engine owns the flash and every access goes through `&mut self`,
/// so no other code can touch the storage while an operation is running.
pub struct Eeprom<F: Flash> {
    flash: F,
    state: State,
    layout: Option<Layout>,
    blocking: bool,
    cursors: Vec<RowCursors>,
    queue: VecDeque<FlashOp>,
    in_flight: Option<FlashOp>,
}

impl<F: Flash> Eeprom<F> {
    /// Creates an uninitialized engine on the given flash
    pub fn new(flash: F) -> Self {
        Self {
            flash,
            state: State::Uninitialized,
            layout: None,
            blocking: true,
            cursors: Vec::new(),
            queue: VecDeque::new(),
            in_flight: None,
        }
    }

    /// Validates the config, then scans the storage and repairs what an interrupted write left behind.
    ///
    /// A rejected configuration leaves the engine in its current state.
    /// If stored data turns out to be lost, the engine is [State::Faulted] and can be
    /// recovered with [Eeprom::erase].
    pub fn init(&mut self, config: Config) -> Result<(), Error> {
        if self.is_busy() {
            return Err(Error::Busy);
        }

        let layout = Layout::new(&config, self.flash.geometry())?;
        info!(
            "Initializing {} byte EEPROM: {} rows, {} slots each, {} bytes of flash at {:#010X}",
            layout.eeprom_size(),
            layout.rows(),
            layout.wear_leveling_factor(),
            layout.footprint(),
            config.storage.base_address
        );

        self.state = State::Initializing;
        self.blocking = config.blocking_write;
        self.cursors.clear();

        if !layout.is_simple() {
            for row in 0..layout.rows() {
                match redundancy::reconcile(&mut self.flash, &layout, row) {
                    Ok(cursors) => self.cursors.push(cursors),
                    Err(e) => {
                        warn!("Initialization failed: {}", e);
                        self.layout = Some(layout);
                        self.state = State::Faulted;
                        return Err(e);
                    }
                }
            }
        }

        self.layout = Some(layout);
        self.state = State::Ready;
        info!("EEPROM is ready");
        Ok(())
    }

    /// The current state of the engine
    pub fn state(&self) -> State {
        self.state
    }

    /// The layout the engine was initialized with
    pub fn layout(&self) -> Option<&Layout> {
        self.layout.as_ref()
    }

    /// Returns true while flash operations of a non-blocking write are outstanding
    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some() || !self.queue.is_empty()
    }

    /// The flash the engine runs on
    pub fn flash(&self) -> &F {
        &self.flash
    }

    /// Mutable access to the flash, bypassing the engine
    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    /// Consumes the engine and gives back the flash
    pub fn release(self) -> F {
        self.flash
    }

    fn ready_layout(&self) -> Result<&Layout, Error> {
        match (&self.layout, self.state) {
            (Some(layout), State::Ready) => Ok(layout),
            (_, state) => Err(Error::NotReady { state }),
        }
    }

    fn checked_range(layout: &Layout, offset: usize, len: usize) -> Result<Range<usize>, Error> {
        match offset.checked_add(len) {
            Some(end) if end <= layout.eeprom_size() => Ok(offset..end),
            _ => Err(Error::OutOfBounds {
                offset,
                len,
                size: layout.eeprom_size(),
            }),
        }
    }

    /// Reads the current data of a row, which is as long as the row's logical span
    fn read_row_data(&self, layout: &Layout, row: usize) -> Result<(Vec<u8>, ReadStatus), Error> {
        let span = layout.row_span(row);

        if layout.is_simple() {
            let address = layout.slot_address(Replica::Primary, row, 0);
            return Ok((read_slot(&self.flash, address, span.len())?, ReadStatus::Success));
        }

        let mut data = vec![0; span.len()];
        let status = redundancy::read_row(&self.flash, layout, row, &self.cursors[row], &mut data)?;
        Ok((data, status))
    }

    fn fault_on_corruption<T>(&mut self, result: Result<T, Error>) -> Result<T, Error> {
        if let Err(e @ Error::CorruptedData { .. }) = &result {
            warn!("{}, the engine is faulted", e);
            self.state = State::Faulted;
        }
        result
    }

    /// Reads `buffer.len()` bytes starting at the logical offset.
    ///
    /// Returns [ReadStatus::RedundantCopyUsed] if the primary copy of any touched row
    /// was corrupted and its data came from the redundant copy.
    pub fn read(&mut self, offset: usize, buffer: &mut [u8]) -> Result<ReadStatus, Error> {
        let result = self.read_inner(offset, buffer);
        self.fault_on_corruption(result)
    }

    fn read_inner(&self, offset: usize, buffer: &mut [u8]) -> Result<ReadStatus, Error> {
        let layout = self.ready_layout()?;
        if self.is_busy() {
            return Err(Error::Busy);
        }
        let range = Self::checked_range(layout, offset, buffer.len())?;

        let mut status = ReadStatus::Success;
        for row in layout.rows_touched(range.clone()) {
            let span = layout.row_span(row);
            let (data, row_status) = self.read_row_data(layout, row)?;
            if row_status == ReadStatus::RedundantCopyUsed {
                status = row_status;
            }

            let start = range.start.max(span.start);
            let end = range.end.min(span.end);
            buffer[start - range.start..end - range.start]
                .copy_from_slice(&data[start - span.start..end - span.start]);
        }

        Ok(status)
    }

    /// Writes the data starting at the logical offset.
    ///
    /// Bytes of the touched rows outside of the written range keep their value.
    /// Rows are written one after another. If a row fails, the rows before it keep their new data.
    ///
    /// In non-blocking mode this returns [WriteStatus::Pending] while flash operations are
    /// running, and [Eeprom::poll] has to be called until it returns [WriteStatus::Complete].
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<WriteStatus, Error> {
        let result = self.write_inner(offset, data);
        self.fault_on_corruption(result)
    }

    fn write_inner(&mut self, offset: usize, data: &[u8]) -> Result<WriteStatus, Error> {
        let layout = self.ready_layout()?.clone();
        if self.is_busy() {
            return Err(Error::Busy);
        }
        let range = Self::checked_range(&layout, offset, data.len())?;

        for row in layout.rows_touched(range.clone()) {
            let span = layout.row_span(row);
            let (mut row_data, _) = self.read_row_data(&layout, row)?;

            let start = range.start.max(span.start);
            let end = range.end.min(span.end);
            row_data[start - span.start..end - span.start]
                .copy_from_slice(&data[start - range.start..end - range.start]);

            if layout.is_simple() {
                let ops = wear::plan_simple_write(&self.flash, &layout, row, &row_data)?;
                self.submit(ops)?;
                continue;
            }

            let sequence = redundancy::next_sequence(&self.cursors[row]);
            for &copy in layout.copies() {
                let current = redundancy::cursor_of(&self.cursors[row], copy);
                let ops = wear::plan_row_write(&self.flash, &layout, copy, row, current, sequence, &row_data)?;
                self.submit(ops)?;
            }
        }

        self.advance()
    }

    /// Performs the operations right away in blocking mode, or queues them otherwise
    fn submit(&mut self, ops: Vec<FlashOp>) -> Result<(), Error> {
        if self.blocking {
            let cursors = &mut self.cursors;
            wear::execute(&mut self.flash, &ops, |commit| {
                redundancy::set_cursor(&mut cursors[commit.row], commit.copy, commit.cursor)
            })
        } else {
            self.queue.extend(ops);
            Ok(())
        }
    }

    /// Advances outstanding non-blocking flash operations.
    ///
    /// Returns [WriteStatus::Complete] once nothing is outstanding anymore.
    /// If an operation fails, the remaining operations of the write are dropped.
    pub fn poll(&mut self) -> Result<WriteStatus, Error> {
        self.advance()
    }

    fn advance(&mut self) -> Result<WriteStatus, Error> {
        let result = self.advance_inner();
        if result.is_err() {
            self.queue.clear();
            self.in_flight = None;
        }
        result
    }

    fn advance_inner(&mut self) -> Result<WriteStatus, Error> {
        loop {
            if let Some(op) = &self.in_flight {
                let busy = self.flash.is_busy().map_err(|source| match op {
                    FlashOp::Erase { address, .. } => Error::Erase {
                        address: *address,
                        source,
                    },
                    FlashOp::Program { address, .. } => Error::Write {
                        address: *address,
                        source,
                    },
                })?;
                if busy {
                    return Ok(WriteStatus::Pending);
                }

                op.verify(&self.flash)?;
                if let Some(commit) = op.commit() {
                    redundancy::set_cursor(&mut self.cursors[commit.row], commit.copy, commit.cursor);
                }
                self.in_flight = None;
            }

            let Some(op) = self.queue.pop_front() else {
                return Ok(WriteStatus::Complete);
            };
            debug!("Starting {:?} operation at {:#010X}", op_name(&op), op_address(&op));
            op.issue(&mut self.flash, false)?;
            self.in_flight = Some(op);
        }
    }

    /// Erases the whole footprint, after which every row reads as never written.
    ///
    /// This is the way out of [State::Faulted].
    pub fn erase(&mut self) -> Result<(), Error> {
        let Some(layout) = self.layout.clone() else {
            return Err(Error::NotReady { state: self.state });
        };
        if self.is_busy() {
            return Err(Error::Busy);
        }

        info!("Erasing {} bytes of EEPROM storage", layout.footprint());
        let mut ops = Vec::new();
        for address in layout.all_slots() {
            let raw = read_slot(&self.flash, address, layout.slot_size())?;
            if raw.iter().any(|b| *b != ERASED_BYTE) {
                ops.push(FlashOp::Erase {
                    address,
                    len: layout.slot_size(),
                });
            }
        }
        wear::execute(&mut self.flash, &ops, |_| {})?;

        self.cursors = vec![[None, None]; if layout.is_simple() { 0 } else { layout.rows() }];
        self.state = State::Ready;
        Ok(())
    }
}

fn op_name(op: &FlashOp) -> &'static str {
    match op {
        FlashOp::Erase { .. } => "erase",
        FlashOp::Program { .. } => "program",
    }
}

fn op_address(op: &FlashOp) -> u32 {
    match op {
        FlashOp::Erase { address, .. } | FlashOp::Program { address, .. } => *address,
    }
}
