//! TCP transport and the server event loop.
//!
//! All board mutation happens on one task: connection readers and the
//! replication pump only forward [`ServerCommand`]s over a channel, and the
//! event loop runs each to completion before the next, so the canvas needs
//! no locking. The two long-running jobs that must not stall the loop are
//! handled off it: snapshot streaming runs per-client with a fixed pause
//! between chunks, and snapshot uploads run as spawned single-flight tasks
//! that report back through the same command channel.

use crate::canvas::{CanvasState, EditError, PaintOutcome};
use crate::client_manager::ClientManager;
use crate::persistence::{self, FlushState, SnapshotStore};
use crate::replication::{self, RemoteEdit, ReplicationBridge};
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::{codec, Packet, PixelEdit};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};

/// Upper bound on one frame; the largest legitimate frame is a snapshot
/// chunk, well below this for any supported board width.
pub const MAX_FRAME_LEN: u32 = 4 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame io: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame encoding: {0}")]
    Codec(#[from] bincode::Error),
    #[error("frame of {0} bytes exceeds the limit")]
    TooLarge(u32),
}

/// Writes one length-prefixed bincode frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    packet: &Packet,
) -> Result<(), FrameError> {
    let data = serialize(packet)?;
    let len = data.len() as u32;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(&data).await?;
    Ok(())
}

/// Reads one length-prefixed bincode frame.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Packet, FrameError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }
    let mut data = vec![0u8; len as usize];
    reader.read_exact(&mut data).await?;
    Ok(deserialize(&data)?)
}

/// Everything the event loop reacts to.
#[derive(Debug)]
pub enum ServerCommand {
    Connect {
        identity: String,
        addr: SocketAddr,
        sender: mpsc::UnboundedSender<Packet>,
        reply: oneshot::Sender<Option<u32>>,
    },
    FromClient {
        client_id: u32,
        packet: Packet,
    },
    Disconnect {
        client_id: u32,
    },
    RemoteEdit(RemoteEdit),
    FlushDone(Result<(), persistence::SnapshotError>),
    Shutdown,
}

pub struct ServerConfig {
    pub addr: String,
    pub width: u32,
    pub height: u32,
    pub cache_path: PathBuf,
    pub flush_interval: Duration,
    pub chunk_rows: u32,
    pub chunk_delay: Duration,
    pub max_clients: usize,
}

pub struct CanvasServer {
    config: ServerConfig,
    listener: Arc<TcpListener>,
    canvas: CanvasState,
    clients: ClientManager,
    remote: Option<Arc<dyn SnapshotStore>>,
    bridge: Option<ReplicationBridge>,
    flush: FlushState,
    cmd_tx: mpsc::UnboundedSender<ServerCommand>,
    cmd_rx: mpsc::UnboundedReceiver<ServerCommand>,
}

impl CanvasServer {
    /// Binds the listener and loads (or migrates) the board.
    pub async fn new(
        config: ServerConfig,
        zones: Vec<crate::zones::Zone>,
        remote: Option<Arc<dyn SnapshotStore>>,
        bridge: Option<ReplicationBridge>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let listener = Arc::new(TcpListener::bind(&config.addr).await?);
        info!("Canvas server listening on {}", listener.local_addr()?);

        let board = persistence::load_board(
            remote.as_deref(),
            &config.cache_path,
            config.width,
            config.height,
        )
        .await;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        Ok(Self {
            clients: ClientManager::new(config.max_clients),
            canvas: CanvasState::new(board, zones),
            config,
            listener,
            remote,
            bridge,
            flush: FlushState::default(),
            cmd_tx,
            cmd_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Sender for injecting commands, used by tests and for shutdown.
    pub fn command_sender(&self) -> mpsc::UnboundedSender<ServerCommand> {
        self.cmd_tx.clone()
    }

    pub fn flush_state(&self) -> &FlushState {
        &self.flush
    }

    /// Spawns the task that accepts connections and hands each one off.
    fn spawn_acceptor(&self) {
        let listener = Arc::clone(&self.listener);
        let cmd_tx = self.cmd_tx.clone();

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        tokio::spawn(handle_connection(stream, addr, cmd_tx.clone()));
                    }
                    Err(e) => {
                        error!("Accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns the task that pulls peer edits off the replication channel.
    fn spawn_replication_pump(&self) {
        let Some(bridge) = &self.bridge else { return };
        let mut subscription = bridge.subscribe();
        let cmd_tx = self.cmd_tx.clone();

        tokio::spawn(async move {
            while let Some(body) = subscription.recv().await {
                match replication::decode_message(&body) {
                    Some(edit) => {
                        if cmd_tx.send(ServerCommand::RemoteEdit(edit)).is_err() {
                            break;
                        }
                    }
                    None => warn!("Dropping malformed replication message"),
                }
            }
            debug!("Replication subscription ended");
        });
    }

    /// Main loop: commands and flush ticks, one at a time.
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.spawn_acceptor();
        self.spawn_replication_pump();

        let mut flush_interval = interval(self.config.flush_interval);
        flush_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it.
        flush_interval.tick().await;

        info!("Server started successfully");

        loop {
            tokio::select! {
                command = self.cmd_rx.recv() => {
                    match command {
                        Some(ServerCommand::Shutdown) | None => {
                            info!("Server shutting down");
                            break;
                        }
                        Some(command) => self.handle_command(command).await,
                    }
                },
                _ = flush_interval.tick() => {
                    self.maybe_flush();
                },
            }
        }

        Ok(())
    }

    async fn handle_command(&mut self, command: ServerCommand) {
        match command {
            ServerCommand::Connect {
                identity,
                addr,
                sender,
                reply,
            } => {
                match self.clients.add_client(identity.clone(), addr, sender.clone()) {
                    Some(client_id) => {
                        let now = Instant::now();
                        // Identities arrive pre-verified; the auth gateway
                        // prefixes logged-in accounts with "user:".
                        if identity.starts_with("user:") {
                            self.canvas.set_authenticated(&identity, now);
                        }
                        let status = self.canvas.ink_status(&identity, now);
                        let _ = sender.send(Packet::Ink {
                            ink: status.ink,
                            max: status.max,
                            rate_ms: status.rate_ms,
                        });

                        let board = self.canvas.board();
                        tokio::spawn(stream_snapshot(
                            sender,
                            board.width(),
                            board.height(),
                            Arc::new(board.snapshot()),
                            self.config.chunk_rows,
                            self.config.chunk_delay,
                        ));
                        let _ = reply.send(Some(client_id));
                    }
                    None => {
                        warn!("Rejecting client from {}: server full", addr);
                        let _ = sender.send(Packet::Notice {
                            text: "Server full".to_string(),
                        });
                        let _ = reply.send(None);
                    }
                }
            }
            ServerCommand::FromClient { client_id, packet } => {
                self.handle_packet(client_id, packet);
            }
            ServerCommand::Disconnect { client_id } => {
                self.clients.remove_client(client_id);
            }
            ServerCommand::RemoteEdit(edit) => {
                self.handle_remote_edit(edit);
            }
            ServerCommand::FlushDone(result) => {
                self.flush.in_flight = false;
                match result {
                    Ok(()) => {
                        self.flush.last_error = None;
                        debug!("Snapshot flushed");
                    }
                    Err(e) => {
                        // Keep the unsaved work marked; the next tick retries.
                        warn!("Snapshot upload failed, will retry: {}", e);
                        self.flush.dirty = true;
                        self.flush.last_error = Some(e.to_string());
                    }
                }
            }
            ServerCommand::Shutdown => {}
        }
    }

    /// Processes one packet from a connected client.
    fn handle_packet(&mut self, client_id: u32, packet: Packet) {
        let now = Instant::now();
        let Some(identity) = self.clients.identity_of(client_id).map(str::to_string) else {
            return;
        };

        match packet {
            Packet::Paint {
                x,
                y,
                r,
                g,
                b,
                team,
                size,
            } => {
                let edit = PixelEdit { x, y, r, g, b, team };
                let outcome = self.canvas.paint(&identity, edit, size as u32, now);
                self.finish_edit(client_id, &identity, outcome, now);
            }
            Packet::PaintBatch { pixels } => {
                let outcome = self.canvas.paint_batch(&identity, &pixels, now);
                self.finish_edit(client_id, &identity, outcome, now);
            }
            Packet::Hello { .. } => {
                warn!("Client {} sent a second hello, ignoring", client_id);
            }
            _ => {
                warn!("Unexpected packet from client {}", client_id);
            }
        }
    }

    /// Shared tail of the edit path: broadcast, replicate, report ink.
    fn finish_edit(
        &mut self,
        client_id: u32,
        identity: &str,
        outcome: Result<PaintOutcome, EditError>,
        now: Instant,
    ) {
        match outcome {
            Ok(PaintOutcome::Applied { changed, cells }) => {
                self.flush.dirty = true;
                debug!("{} changed {} cells", identity, changed);

                if cells.len() == 1 {
                    let data = codec::encode_edit(&cells[0]).to_vec();
                    self.clients.broadcast(&Packet::Edit { data }, Some(client_id));
                    if let Some(bridge) = &self.bridge {
                        bridge.publish_point(&cells[0]);
                    }
                } else {
                    let data = codec::encode_batch(&cells);
                    self.clients
                        .broadcast(&Packet::EditBatch { data }, Some(client_id));
                    if let Some(bridge) = &self.bridge {
                        bridge.publish_batch(&cells);
                    }
                }
            }
            Ok(PaintOutcome::Unchanged) => {}
            Err(EditError::OutOfInk) => {
                // Only the originator hears about it.
                self.clients.send_to(
                    client_id,
                    Packet::Notice {
                        text: "Out of ink!".to_string(),
                    },
                );
            }
        }

        let status = self.canvas.ink_status(identity, now);
        self.clients.send_to(
            client_id,
            Packet::Ink {
                ink: status.ink,
                max: status.max,
                rate_ms: status.rate_ms,
            },
        );
    }

    /// Applies a peer's edit locally and forwards it to local clients only.
    /// This path has no access to the bridge, so it can never re-publish.
    fn handle_remote_edit(&mut self, edit: RemoteEdit) {
        match edit {
            RemoteEdit::Point(edit) => {
                if self.canvas.apply_remote_point(edit) > 0 {
                    self.flush.dirty = true;
                    let data = codec::encode_edit(&edit).to_vec();
                    self.clients.broadcast(&Packet::Edit { data }, None);
                }
            }
            RemoteEdit::Batch(edits) => {
                let (changed, cells) = self.canvas.apply_remote_batch(&edits);
                if changed > 0 {
                    self.flush.dirty = true;
                    let data = codec::encode_batch(&cells);
                    self.clients.broadcast(&Packet::EditBatch { data }, None);
                }
            }
        }
    }

    /// Kicks off an upload when there is unsaved work and none in flight.
    fn maybe_flush(&mut self) {
        if !self.flush.dirty || self.flush.in_flight {
            return;
        }
        self.flush.in_flight = true;
        self.flush.dirty = false;

        let bytes = self.canvas.board().snapshot();
        let remote = self.remote.clone();
        let cache_path = self.config.cache_path.clone();
        let cmd_tx = self.cmd_tx.clone();

        tokio::spawn(async move {
            let result = persistence::flush_snapshot(remote, cache_path, bytes).await;
            let _ = cmd_tx.send(ServerCommand::FlushDone(result));
        });
    }
}

/// Streams the board to one freshly connected client: metadata, then bands
/// in row order with a fixed pause between them so a single connection
/// cannot soak the sender. Stops as soon as the client's queue closes.
async fn stream_snapshot(
    sender: mpsc::UnboundedSender<Packet>,
    width: u32,
    height: u32,
    bytes: Arc<Vec<u8>>,
    chunk_rows: u32,
    chunk_delay: Duration,
) {
    if sender.send(Packet::BoardInfo { width, height }).is_err() {
        return;
    }

    let row_len = width as usize * crate::board::BYTES_PER_PIXEL;
    for band in codec::band_plan(height, chunk_rows) {
        if sender.is_closed() {
            debug!("Client went away mid-snapshot, stopping the stream");
            return;
        }

        let start = band.start_row as usize * row_len;
        let end = start + band.rows as usize * row_len;
        let chunk = Packet::BoardChunk {
            start_row: band.start_row,
            rows: band.rows,
            data: bytes[start..end].to_vec(),
            progress: band.progress,
        };
        if sender.send(chunk).is_err() {
            return;
        }

        tokio::time::sleep(chunk_delay).await;
    }
}

/// Per-connection task: handshake, register, then pump frames inward until
/// the client goes away.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    cmd_tx: mpsc::UnboundedSender<ServerCommand>,
) {
    let (mut read_half, mut write_half) = stream.into_split();

    let identity = match read_frame(&mut read_half).await {
        Ok(Packet::Hello { identity }) => identity,
        Ok(_) => {
            warn!("Client at {} did not open with a hello, dropping", addr);
            return;
        }
        Err(e) => {
            debug!("Handshake with {} failed: {}", addr, e);
            return;
        }
    };

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Packet>();
    let writer = tokio::spawn(async move {
        while let Some(packet) = out_rx.recv().await {
            if let Err(e) = write_frame(&mut write_half, &packet).await {
                debug!("Write to {} failed: {}", addr, e);
                break;
            }
        }
    });

    let (reply_tx, reply_rx) = oneshot::channel();
    if cmd_tx
        .send(ServerCommand::Connect {
            identity,
            addr,
            sender: out_tx,
            reply: reply_tx,
        })
        .is_err()
    {
        return;
    }
    let client_id = match reply_rx.await {
        Ok(Some(client_id)) => client_id,
        _ => return, // server full or shutting down
    };

    loop {
        match read_frame(&mut read_half).await {
            Ok(packet) => {
                if cmd_tx
                    .send(ServerCommand::FromClient { client_id, packet })
                    .is_err()
                {
                    break;
                }
            }
            Err(_) => break,
        }
    }

    let _ = cmd_tx.send(ServerCommand::Disconnect { client_id });
    // The registry drop closes the outbound queue, letting the writer drain.
    let _ = writer.await;
}
