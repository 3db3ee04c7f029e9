//! Wire protocol shared between the canvas server and its clients.
//!
//! Two encodings live here. Control traffic (handshake, ink status,
//! snapshot chunks) travels as bincode-serialized [`Packet`] values inside
//! length-prefixed frames. Edit traffic uses the fixed 8-byte record format
//! in [`codec`], which is what gets broadcast to clients and replicated to
//! peer server processes.

pub mod codec;

use serde::{Deserialize, Serialize};

/// Default board width in pixels.
pub const DEFAULT_BOARD_WIDTH: u32 = 3000;
/// Default board height in pixels.
pub const DEFAULT_BOARD_HEIGHT: u32 = 3000;

/// Background color of a fresh board (white).
pub const BACKGROUND: (u8, u8, u8) = (255, 255, 255);

/// Board sizes from earlier deployments that the loader can still migrate.
pub const LEGACY_BOARD_SIZES: &[(u32, u32)] = &[(1000, 1000), (2000, 2000), (3000, 3000)];

/// Largest batch a client may submit; anything longer is dropped.
pub const MAX_BATCH_LEN: usize = 500;

/// Guest ink capacity and refill rate (ms per unit).
pub const GUEST_MAX_INK: f64 = 250.0;
pub const GUEST_REFILL_MS: u64 = 15_000;

/// Authenticated-user ink capacity and refill rate (ms per unit).
pub const USER_MAX_INK: f64 = 750.0;
pub const USER_REFILL_MS: u64 = 10_000;

/// Default rows per snapshot chunk during the initial sync.
pub const DEFAULT_CHUNK_ROWS: u32 = 64;
/// Default pause between snapshot chunks, the sender's self-pacing.
pub const DEFAULT_CHUNK_DELAY_MS: u64 = 15;

/// A single pixel write: position, color and the editor's group tag.
///
/// This is the unit the 8-byte wire record in [`codec`] encodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelEdit {
    pub x: u16,
    pub y: u16,
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub team: u8,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum Packet {
    // Client -> server
    Hello {
        identity: String,
    },
    Paint {
        x: u16,
        y: u16,
        r: u8,
        g: u8,
        b: u8,
        team: u8,
        /// Brush size; a size-by-size square centered on (x, y).
        size: u8,
    },
    PaintBatch {
        pixels: Vec<PixelEdit>,
    },

    // Server -> client
    BoardInfo {
        width: u32,
        height: u32,
    },
    BoardChunk {
        start_row: u32,
        rows: u32,
        /// Raw row-major RGB bytes for this band.
        data: Vec<u8>,
        /// Monotonically increasing, exactly 1.0 on the final chunk.
        progress: f32,
    },
    /// One 8-byte edit record (see [`codec`]).
    Edit {
        data: Vec<u8>,
    },
    /// Concatenated 8-byte edit records, no length prefix.
    EditBatch {
        data: Vec<u8>,
    },
    Ink {
        ink: u64,
        max: u64,
        rate_ms: u64,
    },
    Notice {
        text: String,
    },
}
