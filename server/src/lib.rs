//! # Canvas Server Library
//!
//! Authoritative server for a shared pixel canvas. Many clients edit one
//! large RGB board concurrently; the server validates every edit, applies it
//! to the single canonical buffer, and fans the accepted changes out to all
//! other clients, so every connected editor converges on the same picture.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative Board State
//! The server owns the only writable copy of the board. Clients render a
//! local replica seeded by a snapshot stream at connect time and kept
//! current by edit broadcasts; everything they see is what the server
//! already accepted.
//!
//! ### Edit Validation
//! Each edit runs through the same pipeline: the protected-zone check, then
//! the per-identity ink budget, then change detection on the board itself.
//! Edits that would not change any pixel cost nothing and generate no
//! traffic.
//!
//! ### Durability
//! The board survives restarts through periodic snapshot flushes to a local
//! cache file and an optional remote store, with deterministic migration of
//! snapshots taken under older board dimensions.
//!
//! ### Replication
//! Several server processes can serve the same board: each publishes its
//! accepted edits on a pub/sub channel exactly once and applies what it
//! hears from peers, converging last-write-wins per pixel.
//!
//! ## Architecture Design
//!
//! ### Single-Threaded Event Loop
//! All board mutation happens on one task. Connection readers, the
//! replication pump, and flush completions communicate with it exclusively
//! through a command channel, which eliminates locking on the hot path and
//! makes edit ordering deterministic within a process.
//!
//! ### Framed TCP Communication
//! Clients speak length-prefixed bincode frames over TCP. The initial
//! snapshot is streamed as row bands with deliberate pacing so a freshly
//! connected client cannot monopolize the writer.
//!
//! ## Module Organization
//!
//! - [`board`] — the pixel buffer, change-detecting writes, snapshot
//!   migration.
//! - [`canvas`] — validation policy tying zones, ink, and the board
//!   together.
//! - [`ink`] — per-identity edit budgets with lazy timer-free refill.
//! - [`zones`] — protected-region list loaded from JSON.
//! - [`persistence`] — snapshot stores, startup recovery, flush bookkeeping.
//! - [`replication`] — cross-process edit pub/sub.
//! - [`network`] — TCP transport, framing, and the event loop.
//! - [`client_manager`] — connected-client registry and broadcast fan-out.

pub mod board;
pub mod canvas;
pub mod client_manager;
pub mod ink;
pub mod network;
pub mod persistence;
pub mod replication;
pub mod zones;
