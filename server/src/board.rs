//! The authoritative pixel board and its snapshot migration.
//!
//! The board is a single mutable resource owned by the server's event loop;
//! every mutation goes through the methods here, which clip to bounds and
//! detect no-op writes. A write that leaves a pixel at its current color is
//! not counted as a change, which is what keeps redundant edits off the
//! broadcast and replication paths.

use shared::{PixelEdit, BACKGROUND, LEGACY_BOARD_SIZES};

/// Bytes per pixel: R, G, B.
pub const BYTES_PER_PIXEL: usize = 3;

/// How a stored snapshot related to the configured board dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotFit {
    /// Byte length matched the current dimensions exactly.
    Exact,
    /// A known legacy size, migrated by top-left copy.
    Migrated { from_width: u32, from_height: u32 },
    /// Unrecognized size; the board fell back to a fresh background.
    Corrupt,
}

#[derive(Debug, Clone)]
pub struct Board {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl Board {
    /// Creates a board filled with the default background color.
    pub fn new(width: u32, height: u32) -> Self {
        let len = width as usize * height as usize * BYTES_PER_PIXEL;
        let mut data = vec![0u8; len];
        for cell in data.chunks_exact_mut(BYTES_PER_PIXEL) {
            cell[0] = BACKGROUND.0;
            cell[1] = BACKGROUND.1;
            cell[2] = BACKGROUND.2;
        }
        Self {
            width,
            height,
            data,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Copy of the raw buffer, for flushing or streaming to a client.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.clone()
    }

    fn index(&self, x: u32, y: u32) -> usize {
        (y as usize * self.width as usize + x as usize) * BYTES_PER_PIXEL
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<(u8, u8, u8)> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = self.index(x, y);
        Some((self.data[i], self.data[i + 1], self.data[i + 2]))
    }

    /// Writes one in-bounds pixel; returns whether the cell actually changed.
    fn put(&mut self, x: u32, y: u32, color: (u8, u8, u8)) -> bool {
        let i = self.index(x, y);
        let cell = &mut self.data[i..i + BYTES_PER_PIXEL];
        if cell == [color.0, color.1, color.2] {
            return false;
        }
        cell.copy_from_slice(&[color.0, color.1, color.2]);
        true
    }

    /// Solid fill of `[x0, x1) x [y0, y1)`, clipped to the board. Returns how
    /// many cells changed color; out-of-range coordinates are dropped, never
    /// an error.
    pub fn write_rect(&mut self, x0: i64, y0: i64, x1: i64, y1: i64, color: (u8, u8, u8)) -> u32 {
        let sx = x0.clamp(0, self.width as i64) as u32;
        let ex = x1.clamp(0, self.width as i64) as u32;
        let sy = y0.clamp(0, self.height as i64) as u32;
        let ey = y1.clamp(0, self.height as i64) as u32;

        let mut changed = 0;
        for y in sy..ey {
            for x in sx..ex {
                if self.put(x, y, color) {
                    changed += 1;
                }
            }
        }
        changed
    }

    /// A size-by-size square centered on (x, y), clipped to the board.
    pub fn stamp(&mut self, x: u32, y: u32, size: u32, color: (u8, u8, u8)) -> u32 {
        let size = size.max(1) as i64;
        let half = size / 2;
        let x0 = x as i64 - half;
        let y0 = y as i64 - half;
        self.write_rect(x0, y0, x0 + size, y0 + size, color)
    }

    /// Applies heterogeneous per-point writes. Out-of-range points are
    /// silently dropped. Returns the changed-cell count together with the
    /// subset of edits that actually changed a cell, which is what gets
    /// broadcast and replicated.
    pub fn apply_batch(&mut self, edits: &[PixelEdit]) -> (u32, Vec<PixelEdit>) {
        let mut applied = Vec::new();
        for edit in edits {
            let (x, y) = (edit.x as u32, edit.y as u32);
            if x >= self.width || y >= self.height {
                continue;
            }
            if self.put(x, y, (edit.r, edit.g, edit.b)) {
                applied.push(*edit);
            }
        }
        (applied.len() as u32, applied)
    }

    /// Dry run of [`Board::apply_batch`]: how many cells the batch would
    /// change. Used for the budget check, so pixels already at their target
    /// color are free.
    pub fn count_batch_changes(&self, edits: &[PixelEdit]) -> u32 {
        edits
            .iter()
            .filter(|edit| {
                self.pixel(edit.x as u32, edit.y as u32)
                    .map_or(false, |current| current != (edit.r, edit.g, edit.b))
            })
            .count() as u32
    }

    /// Builds a board from a stored snapshot, migrating across known size
    /// changes. An exact-size buffer is adopted as-is; a known legacy size is
    /// copied into the top-left corner (cropping or background-extending as
    /// needed); anything else yields a fresh board. Deterministic and
    /// idempotent: migrating already-correct data is a no-op.
    pub fn from_snapshot(width: u32, height: u32, bytes: Vec<u8>) -> (Self, SnapshotFit) {
        let expected = width as usize * height as usize * BYTES_PER_PIXEL;
        if bytes.len() == expected {
            return (
                Self {
                    width,
                    height,
                    data: bytes,
                },
                SnapshotFit::Exact,
            );
        }

        if let Some((from_width, from_height)) = legacy_dims(bytes.len()) {
            let mut board = Self::new(width, height);
            let rows = from_height.min(height);
            let cols = from_width.min(width) as usize * BYTES_PER_PIXEL;
            for y in 0..rows as usize {
                let src = y * from_width as usize * BYTES_PER_PIXEL;
                let dst = y * width as usize * BYTES_PER_PIXEL;
                board.data[dst..dst + cols].copy_from_slice(&bytes[src..src + cols]);
            }
            return (
                board,
                SnapshotFit::Migrated {
                    from_width,
                    from_height,
                },
            );
        }

        (Self::new(width, height), SnapshotFit::Corrupt)
    }
}

/// Maps a stored byte length back to the legacy dimensions that produced it.
fn legacy_dims(len: usize) -> Option<(u32, u32)> {
    LEGACY_BOARD_SIZES
        .iter()
        .copied()
        .find(|(w, h)| *w as usize * *h as usize * BYTES_PER_PIXEL == len)
}
