//! Compact binary encoding for edits and snapshot chunk planning.
//!
//! An edit record is exactly 8 bytes: x (u16 LE), y (u16 LE), r, g, b and a
//! group tag, one byte each. A batch is the bare concatenation of records
//! with no length prefix; receivers infer the count from `len / 8`. The
//! fixed width gives O(1) random access into a batch and leaves no parsing
//! ambiguity, at the cost of 8-bit color channels and 256 group tags.

use crate::PixelEdit;
use thiserror::Error;

/// Size of one encoded edit record in bytes.
pub const RECORD_LEN: usize = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("edit record is {0} bytes, expected {RECORD_LEN}")]
    Truncated(usize),
    #[error("batch payload of {0} bytes is not a multiple of {RECORD_LEN}")]
    Misaligned(usize),
}

pub fn encode_edit(edit: &PixelEdit) -> [u8; RECORD_LEN] {
    let x = edit.x.to_le_bytes();
    let y = edit.y.to_le_bytes();
    [x[0], x[1], y[0], y[1], edit.r, edit.g, edit.b, edit.team]
}

/// Decodes a single record; the payload must be exactly [`RECORD_LEN`] bytes.
pub fn decode_edit(bytes: &[u8]) -> Result<PixelEdit, CodecError> {
    if bytes.len() < RECORD_LEN {
        return Err(CodecError::Truncated(bytes.len()));
    }
    if bytes.len() > RECORD_LEN {
        return Err(CodecError::Misaligned(bytes.len()));
    }
    Ok(PixelEdit {
        x: u16::from_le_bytes([bytes[0], bytes[1]]),
        y: u16::from_le_bytes([bytes[2], bytes[3]]),
        r: bytes[4],
        g: bytes[5],
        b: bytes[6],
        team: bytes[7],
    })
}

pub fn encode_batch(edits: &[PixelEdit]) -> Vec<u8> {
    let mut out = Vec::with_capacity(edits.len() * RECORD_LEN);
    for edit in edits {
        out.extend_from_slice(&encode_edit(edit));
    }
    out
}

pub fn decode_batch(bytes: &[u8]) -> Result<Vec<PixelEdit>, CodecError> {
    if bytes.len() % RECORD_LEN != 0 {
        return Err(CodecError::Misaligned(bytes.len()));
    }
    bytes
        .chunks_exact(RECORD_LEN)
        .map(decode_edit)
        .collect()
}

/// One horizontal band of the board within the initial-sync stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Band {
    pub start_row: u32,
    pub rows: u32,
    /// Fraction of the board covered once this band has been applied.
    pub progress: f32,
}

/// Plans the snapshot stream: bands in increasing row order covering every
/// row exactly once, with strictly increasing progress and the final band
/// reporting exactly 1.0.
pub fn band_plan(height: u32, rows_per_band: u32) -> Vec<Band> {
    let rows_per_band = rows_per_band.max(1);
    let mut bands = Vec::new();
    let mut start_row = 0;
    while start_row < height {
        let rows = rows_per_band.min(height - start_row);
        let end = start_row + rows;
        let progress = if end == height {
            1.0
        } else {
            end as f32 / height as f32
        };
        bands.push(Band {
            start_row,
            rows,
            progress,
        });
        start_row = end;
    }
    bands
}
