//! Authoritative canvas state: the board plus the validation policy.
//!
//! All mutation funnels through [`CanvasState`], which the event loop owns
//! exclusively, so no locking happens here. Client edits pass the zone check
//! first (protected edits never consume ink and are dropped without any
//! signal), then the ink check, then land on the board; the debit is the
//! number of cells that actually changed. Replicated edits from peer
//! processes enter through the `apply_remote_*` methods, which bypass
//! validation and have no way to publish anything.

use crate::board::Board;
use crate::ink::{InkLedger, InkStatus};
use crate::zones::{self, Zone};
use shared::{PixelEdit, MAX_BATCH_LEN};
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EditError {
    /// Reported to the originating identity only, never broadcast.
    #[error("out of ink")]
    OutOfInk,
}

/// Result of an accepted edit.
#[derive(Debug, PartialEq, Eq)]
pub enum PaintOutcome {
    /// No cell changed: already the target color, protected, or out of
    /// bounds. Nothing to broadcast, nothing debited.
    Unchanged,
    /// Cells changed; `cells` is what gets broadcast and replicated.
    Applied { changed: u32, cells: Vec<PixelEdit> },
}

pub struct CanvasState {
    board: Board,
    ledger: InkLedger,
    zones: Vec<Zone>,
}

impl CanvasState {
    pub fn new(board: Board, zones: Vec<Zone>) -> Self {
        Self {
            board,
            ledger: InkLedger::new(),
            zones,
        }
    }

    pub fn board(&self) -> &Board {
        &self.board
    }

    pub fn ink_status(&mut self, identity: &str, now: Instant) -> InkStatus {
        self.ledger.status(identity, now)
    }

    pub fn set_authenticated(&mut self, identity: &str, now: Instant) {
        self.ledger.set_authenticated(identity, now);
    }

    /// A point edit, optionally stroke-sized. The zone check applies to the
    /// target pixel; a sized stroke is expanded to its changed cells so it
    /// can travel as plain records.
    pub fn paint(
        &mut self,
        identity: &str,
        edit: PixelEdit,
        size: u32,
        now: Instant,
    ) -> Result<PaintOutcome, EditError> {
        if zones::is_protected(&self.zones, edit.x as u32, edit.y as u32) {
            return Ok(PaintOutcome::Unchanged);
        }
        if self.ledger.available(identity, now) < 1.0 {
            return Err(EditError::OutOfInk);
        }

        let color = (edit.r, edit.g, edit.b);
        let (changed, cells) = if size <= 1 {
            let changed =
                self.board
                    .write_rect(edit.x as i64, edit.y as i64, edit.x as i64 + 1, edit.y as i64 + 1, color);
            (changed, vec![edit])
        } else {
            let cells = stamp_cells(edit, size, &self.board);
            self.board.apply_batch(&cells)
        };

        if changed == 0 {
            return Ok(PaintOutcome::Unchanged);
        }
        self.ledger.debit(identity, changed as f64, now);
        Ok(PaintOutcome::Applied { changed, cells })
    }

    /// A batch of 1x1 edits. Oversized batches are dropped silently.
    /// Out-of-bounds and protected points are filtered per-pixel; the ink
    /// check is all-or-nothing against the number of cells the remainder
    /// would actually change.
    pub fn paint_batch(
        &mut self,
        identity: &str,
        edits: &[PixelEdit],
        now: Instant,
    ) -> Result<PaintOutcome, EditError> {
        if edits.is_empty() || edits.len() > MAX_BATCH_LEN {
            return Ok(PaintOutcome::Unchanged);
        }

        let accepted: Vec<PixelEdit> = edits
            .iter()
            .copied()
            .filter(|e| {
                (e.x as u32) < self.board.width()
                    && (e.y as u32) < self.board.height()
                    && !zones::is_protected(&self.zones, e.x as u32, e.y as u32)
            })
            .collect();

        let cost = self.board.count_batch_changes(&accepted);
        if cost == 0 {
            return Ok(PaintOutcome::Unchanged);
        }
        if self.ledger.available(identity, now) < cost as f64 {
            return Err(EditError::OutOfInk);
        }

        let (changed, cells) = self.board.apply_batch(&accepted);
        self.ledger.debit(identity, changed as f64, now);
        Ok(PaintOutcome::Applied { changed, cells })
    }

    /// Applies a replicated point edit straight to the board. No zones, no
    /// ink: validation already ran at the originating process.
    pub fn apply_remote_point(&mut self, edit: PixelEdit) -> u32 {
        self.board.write_rect(
            edit.x as i64,
            edit.y as i64,
            edit.x as i64 + 1,
            edit.y as i64 + 1,
            (edit.r, edit.g, edit.b),
        )
    }

    /// Applies a replicated batch; returns the changed count and the cells
    /// that changed, for forwarding to this process's own clients.
    pub fn apply_remote_batch(&mut self, edits: &[PixelEdit]) -> (u32, Vec<PixelEdit>) {
        self.board.apply_batch(edits)
    }
}

/// The cells a size-by-size stamp centered on `edit` covers, clipped to the
/// board, each carrying the stamp's color and team tag.
fn stamp_cells(edit: PixelEdit, size: u32, board: &Board) -> Vec<PixelEdit> {
    let size = size as i64;
    let half = size / 2;
    let x0 = (edit.x as i64 - half).clamp(0, board.width() as i64);
    let y0 = (edit.y as i64 - half).clamp(0, board.height() as i64);
    let x1 = (edit.x as i64 - half + size).clamp(0, board.width() as i64);
    let y1 = (edit.y as i64 - half + size).clamp(0, board.height() as i64);

    let mut cells = Vec::with_capacity(((x1 - x0) * (y1 - y0)).max(0) as usize);
    for y in y0..y1 {
        for x in x0..x1 {
            cells.push(PixelEdit {
                x: x as u16,
                y: y as u16,
                ..edit
            });
        }
    }
    cells
}
