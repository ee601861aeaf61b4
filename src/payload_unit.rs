//! Reassembly of a PSI section that may span several TS packets, tracked
//! per-PID until its declared length is filled.
//!
//! PES reassembly does not use this: a PES unit's end is marked by the
//! *next* payload-unit-start rather than a length declared up front, so it
//! is handled directly by the decoding pipeline instead.

use crate::error::Result;
use crate::slice_reader::SliceReader;
use log::warn;
use std::collections::HashMap;

struct PendingUnit {
    data: Vec<u8>,
    remaining: usize,
}

impl PendingUnit {
    fn append(&mut self, reader: &mut SliceReader) -> Result<bool> {
        if reader.remaining_len() <= self.remaining {
            self.remaining -= reader.remaining_len();
            self.data.extend_from_slice(reader.read_to_end()?);
        } else {
            self.data.extend_from_slice(reader.read(self.remaining)?);
            self.remaining = 0;
        }
        Ok(self.remaining == 0)
    }
}

/// Tracks in-progress PSI section reassembly per PID across TS packets.
#[derive(Default)]
pub struct PayloadUnitTracker {
    pending: HashMap<u16, PendingUnit>,
}

impl PayloadUnitTracker {
    /// Starts a new payload unit on `pid` with a declared total `length`,
    /// discarding any unit still pending on that PID (a PUSI always starts
    /// a fresh unit).
    pub fn start(&mut self, pid: u16, length: usize, reader: &mut SliceReader) -> Result<Option<Vec<u8>>> {
        let mut unit = PendingUnit {
            data: Vec::with_capacity(length),
            remaining: length,
        };
        let done = unit.append(reader)?;
        if done {
            Ok(Some(unit.data))
        } else {
            self.pending.insert(pid, unit);
            Ok(None)
        }
    }

    /// Continues a payload unit previously started on `pid`. Logs and
    /// discards the packet if no unit is pending on that PID.
    pub fn continue_unit(&mut self, pid: u16, reader: &mut SliceReader) -> Result<Option<Vec<u8>>> {
        match self.pending.get_mut(&pid) {
            Some(unit) => {
                let done = unit.append(reader)?;
                if done {
                    Ok(Some(self.pending.remove(&pid).unwrap().data))
                } else {
                    Ok(None)
                }
            }
            None => {
                warn!("discarding payload unit continuation on unknown PID {:#x}", pid);
                Ok(None)
            }
        }
    }

    /// Drops any in-progress unit for `pid` (used on a continuity gap).
    pub fn discard(&mut self, pid: u16) {
        self.pending.remove(&pid);
    }
}
