//! The power cycle record kept in the emulated EEPROM

use core::ops::Range;

/// Size of the record in bytes
pub const RECORD_SIZE: usize = 15;

/// The content written on the first boot
pub const INITIAL_RECORD: [u8; RECORD_SIZE] = *b"Power Cycle# 00";

/// The first byte of a record that has been written before
const TAG: u8 = b'P';

/// Where the two ASCII digits of the counter are
pub const COUNTER_RANGE: Range<usize> = 13..15;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Record([u8; RECORD_SIZE]);

impl Record {
    pub fn new(bytes: [u8; RECORD_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn initial() -> Self {
        Self(INITIAL_RECORD)
    }

    /// Returns true if the record was written on an earlier boot
    pub fn is_initialized(&self) -> bool {
        self.0[0] == TAG
    }

    /// Counts one more boot. The counter stops at 99.
    pub fn increment(&mut self) {
        let tens = COUNTER_RANGE.start;
        let ones = tens + 1;

        self.0[ones] = self.0[ones].wrapping_add(1);
        if self.0[ones] > b'9' {
            self.0[ones] = b'0';
            self.0[tens] = self.0[tens].wrapping_add(1);

            if self.0[tens] > b'9' {
                self.0[tens] = b'9';
                self.0[ones] = b'9';
            }
        }
    }

    /// The bytes of the counter, which is all an increment changes
    pub fn counter(&self) -> &[u8] {
        &self.0[COUNTER_RANGE]
    }

    pub fn as_bytes(&self) -> &[u8; RECORD_SIZE] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn incremented(times: usize) -> Record {
        let mut record = Record::initial();
        for _ in 0..times {
            record.increment();
        }
        record
    }

    #[test]
    fn initial_record_is_tagged() {
        assert!(Record::initial().is_initialized());
        assert!(!Record::new([0; RECORD_SIZE]).is_initialized());
        assert!(!Record::new([0xFF; RECORD_SIZE]).is_initialized());
    }

    #[test]
    fn counter_carries_into_the_tens() {
        assert_eq!(incremented(1).counter(), b"01");
        assert_eq!(incremented(10).counter(), b"10");
        assert_eq!(incremented(42).as_bytes(), b"Power Cycle# 42");
    }

    #[test]
    fn counter_saturates() {
        assert_eq!(incremented(99).counter(), b"99");
        assert_eq!(incremented(100).counter(), b"99");
        assert_eq!(incremented(250).as_bytes(), b"Power Cycle# 99");
    }
}
