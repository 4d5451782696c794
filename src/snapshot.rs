//! Portable dump of a tree's live points.
//!
//! Layout, all little-endian:
//!
//! ```text
//! u64            entry count
//! (i64, u64)*    id, fingerprint; ascending id
//! ```
//!
//! Only points are saved. Vantage points and thresholds are recomputed when
//! the snapshot is loaded into a fresh tree.

use std::io::{self, Read, Write};

use crate::error::{MvpError, Result};

/// Bytes per encoded entry.
pub const ENTRY_BYTES: usize = 16;

/// Cap on entries preallocated from an untrusted header count.
const PREALLOC_CAP: usize = 1 << 16;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    entries: Vec<(i64, u64)>,
}

impl Snapshot {
    pub fn new(entries: Vec<(i64, u64)>) -> Self {
        Self { entries }
    }

    #[inline]
    pub fn entries(&self) -> &[(i64, u64)] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<(i64, u64)> {
        self.entries
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn encoded_len(&self) -> usize {
        8 + self.entries.len() * ENTRY_BYTES
    }

    pub fn write_to<W: Write>(&self, mut out: W) -> Result<()> {
        out.write_all(&(self.entries.len() as u64).to_le_bytes())?;
        for &(id, value) in &self.entries {
            out.write_all(&id.to_le_bytes())?;
            out.write_all(&value.to_le_bytes())?;
        }
        out.flush()?;
        Ok(())
    }

    pub fn read_from<R: Read>(mut input: R) -> Result<Self> {
        let mut word = [0u8; 8];
        read_exact_or(&mut input, &mut word, 0, 0)?;
        let expected = u64::from_le_bytes(word);

        let mut entries = Vec::with_capacity((expected as usize).min(PREALLOC_CAP));
        let mut id = [0u8; 8];
        let mut value = [0u8; 8];
        for actual in 0..expected {
            read_exact_or(&mut input, &mut id, expected, actual)?;
            read_exact_or(&mut input, &mut value, expected, actual)?;
            entries.push((i64::from_le_bytes(id), u64::from_le_bytes(value)));
        }
        Ok(Self { entries })
    }
}

fn read_exact_or<R: Read>(input: &mut R, buf: &mut [u8], expected: u64, actual: u64) -> Result<()> {
    match input.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            Err(MvpError::SnapshotTruncated { expected, actual })
        }
        Err(e) => Err(e.into()),
    }
}

impl FromIterator<(i64, u64)> for Snapshot {
    fn from_iter<I: IntoIterator<Item = (i64, u64)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
