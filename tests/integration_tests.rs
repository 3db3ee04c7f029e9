//! Integration tests for the shared pixel-canvas server
//!
//! These tests run real servers on loopback TCP and validate the full
//! paths: snapshot handshake, edit broadcast, ink accounting over the wire,
//! cross-process replication, and snapshot persistence across restarts.

use server::network::{read_frame, write_frame, CanvasServer, ServerCommand, ServerConfig};
use server::persistence::{FileStore, SnapshotStore};
use server::replication::{LocalBus, ReplicationBridge};
use server::zones::Zone;
use shared::{codec, Packet, PixelEdit};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

/// Boots a server on an ephemeral port and runs it in the background.
async fn spawn_server(
    width: u32,
    height: u32,
    zones: Vec<Zone>,
    remote: Option<Arc<dyn SnapshotStore>>,
    bridge: Option<ReplicationBridge>,
    cache: PathBuf,
    flush_interval: Duration,
) -> (SocketAddr, mpsc::UnboundedSender<ServerCommand>) {
    let config = ServerConfig {
        addr: "127.0.0.1:0".to_string(),
        width,
        height,
        cache_path: cache,
        flush_interval,
        chunk_rows: 5,
        chunk_delay: Duration::from_millis(0),
        max_clients: 16,
    };
    let mut server = CanvasServer::new(config, zones, remote, bridge)
        .await
        .expect("failed to start test server");
    let addr = server.local_addr().unwrap();
    let commands = server.command_sender();
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    (addr, commands)
}

struct TestClient {
    stream: TcpStream,
}

impl TestClient {
    async fn connect(addr: SocketAddr, identity: &str) -> Self {
        let mut stream = TcpStream::connect(addr).await.expect("connect failed");
        write_frame(
            &mut stream,
            &Packet::Hello {
                identity: identity.to_string(),
            },
        )
        .await
        .unwrap();
        Self { stream }
    }

    async fn recv(&mut self) -> Packet {
        timeout(Duration::from_secs(5), read_frame(&mut self.stream))
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed unexpectedly")
    }

    /// Asserts that no frame arrives within a grace period.
    async fn expect_silence(&mut self) {
        let result = timeout(Duration::from_millis(150), read_frame(&mut self.stream)).await;
        assert!(result.is_err(), "expected no traffic, got a frame");
    }

    async fn expect_ink(&mut self) -> (u64, u64, u64) {
        match self.recv().await {
            Packet::Ink { ink, max, rate_ms } => (ink, max, rate_ms),
            other => panic!("Expected Ink, got {:?}", other),
        }
    }

    /// Consumes the snapshot handshake and assembles the full board.
    async fn sync(&mut self) -> (u32, u32, Vec<u8>) {
        let (width, height) = match self.recv().await {
            Packet::BoardInfo { width, height } => (width, height),
            other => panic!("Expected BoardInfo, got {:?}", other),
        };

        let mut board = vec![0u8; width as usize * height as usize * 3];
        let row_len = width as usize * 3;
        loop {
            match self.recv().await {
                Packet::BoardChunk {
                    start_row,
                    rows,
                    data,
                    progress,
                } => {
                    let start = start_row as usize * row_len;
                    board[start..start + rows as usize * row_len].copy_from_slice(&data);
                    if progress >= 1.0 {
                        break;
                    }
                }
                other => panic!("Expected BoardChunk, got {:?}", other),
            }
        }
        (width, height, board)
    }

    async fn paint(&mut self, x: u16, y: u16, color: (u8, u8, u8)) {
        write_frame(
            &mut self.stream,
            &Packet::Paint {
                x,
                y,
                r: color.0,
                g: color.1,
                b: color.2,
                team: 0,
                size: 1,
            },
        )
        .await
        .unwrap();
    }
}

fn pixel_at(board: &[u8], width: u32, x: u32, y: u32) -> (u8, u8, u8) {
    let i = (y as usize * width as usize + x as usize) * 3;
    (board[i], board[i + 1], board[i + 2])
}

const RED: (u8, u8, u8) = (255, 0, 0);

/// SNAPSHOT HANDSHAKE TESTS
mod snapshot_tests {
    use super::*;

    /// A fresh client receives ink status, board metadata, then the whole
    /// board in row order.
    #[tokio::test]
    async fn snapshot_handshake_assembles_full_board() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, _commands) = spawn_server(
            16,
            12,
            Vec::new(),
            None,
            None,
            dir.path().join("board.dat"),
            Duration::from_secs(3600),
        )
        .await;

        let mut client = TestClient::connect(addr, "guest-1").await;
        let (ink, max, rate_ms) = client.expect_ink().await;
        assert_eq!((ink, max, rate_ms), (250, 250, 15_000));

        let (width, height, board) = client.sync().await;
        assert_eq!((width, height), (16, 12));
        assert_eq!(board.len(), 16 * 12 * 3);
        assert!(board.iter().all(|&b| b == 255), "fresh board is background");
    }

    /// A pre-verified account identity gets the upgraded budget on connect.
    #[tokio::test]
    async fn authenticated_identity_gets_bigger_budget() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, _commands) = spawn_server(
            8,
            8,
            Vec::new(),
            None,
            None,
            dir.path().join("board.dat"),
            Duration::from_secs(3600),
        )
        .await;

        let mut client = TestClient::connect(addr, "user:alice").await;
        let (ink, max, rate_ms) = client.expect_ink().await;
        assert_eq!((ink, max, rate_ms), (750, 750, 10_000));
    }
}

/// EDIT BROADCAST TESTS
mod edit_tests {
    use super::*;

    /// An accepted point edit reaches every other client but never echoes
    /// back to its originator, who gets a fresh ink status instead.
    #[tokio::test]
    async fn point_edit_broadcasts_to_other_clients() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, _commands) = spawn_server(
            32,
            32,
            Vec::new(),
            None,
            None,
            dir.path().join("board.dat"),
            Duration::from_secs(3600),
        )
        .await;

        let mut alice = TestClient::connect(addr, "guest-a").await;
        alice.expect_ink().await;
        alice.sync().await;
        let mut bob = TestClient::connect(addr, "guest-b").await;
        bob.expect_ink().await;
        bob.sync().await;

        alice.paint(3, 4, RED).await;

        let (ink, _, _) = alice.expect_ink().await;
        assert_eq!(ink, 249);

        match bob.recv().await {
            Packet::Edit { data } => {
                let edit = codec::decode_edit(&data).unwrap();
                assert_eq!((edit.x, edit.y), (3, 4));
                assert_eq!((edit.r, edit.g, edit.b), RED);
            }
            other => panic!("Expected Edit, got {:?}", other),
        }
    }

    /// Batch pixels already at their target color are free; only the cells
    /// that changed travel to other clients.
    #[tokio::test]
    async fn batch_skips_unchanged_pixels() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, _commands) = spawn_server(
            32,
            32,
            Vec::new(),
            None,
            None,
            dir.path().join("board.dat"),
            Duration::from_secs(3600),
        )
        .await;

        let mut alice = TestClient::connect(addr, "guest-a").await;
        alice.expect_ink().await;
        alice.sync().await;
        let mut bob = TestClient::connect(addr, "guest-b").await;
        bob.expect_ink().await;
        bob.sync().await;

        alice.paint(1, 1, RED).await;
        alice.expect_ink().await;
        match bob.recv().await {
            Packet::Edit { .. } => {}
            other => panic!("Expected Edit, got {:?}", other),
        }

        // (1,1) is already red: three submitted, two change, two debited.
        let pixels = [(1u16, 1u16), (2, 2), (3, 3)]
            .iter()
            .map(|&(x, y)| PixelEdit {
                x,
                y,
                r: RED.0,
                g: RED.1,
                b: RED.2,
                team: 0,
            })
            .collect();
        write_frame(&mut alice.stream, &Packet::PaintBatch { pixels })
            .await
            .unwrap();

        let (ink, _, _) = alice.expect_ink().await;
        assert_eq!(ink, 247);

        match bob.recv().await {
            Packet::EditBatch { data } => {
                let edits = codec::decode_batch(&data).unwrap();
                let cells: Vec<(u16, u16)> = edits.iter().map(|e| (e.x, e.y)).collect();
                assert_eq!(cells, vec![(2, 2), (3, 3)]);
            }
            other => panic!("Expected EditBatch, got {:?}", other),
        }
    }

    /// Draining the guest budget yields an out-of-ink notice to the
    /// originator only, and the rejected edit never lands.
    #[tokio::test]
    async fn exhausted_budget_notifies_originator() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, _commands) = spawn_server(
            32,
            32,
            Vec::new(),
            None,
            None,
            dir.path().join("board.dat"),
            Duration::from_secs(3600),
        )
        .await;

        let mut alice = TestClient::connect(addr, "guest-a").await;
        alice.expect_ink().await;
        alice.sync().await;

        for i in 0..250u16 {
            alice.paint(i % 32, i / 32, RED).await;
        }
        let mut last_ink = u64::MAX;
        for _ in 0..250 {
            last_ink = alice.expect_ink().await.0;
        }
        assert_eq!(last_ink, 0);

        alice.paint(31, 31, RED).await;
        match alice.recv().await {
            Packet::Notice { text } => assert_eq!(text, "Out of ink!"),
            other => panic!("Expected Notice, got {:?}", other),
        }
        let (ink, _, _) = alice.expect_ink().await;
        assert_eq!(ink, 0);
    }

    /// Edits inside a protected zone vanish without any reply that would
    /// reveal the zone, and no budget is spent.
    #[tokio::test]
    async fn protected_zone_edit_is_silent() {
        let dir = tempfile::tempdir().unwrap();
        let zones = vec![Zone {
            x: 0,
            y: 0,
            w: 4,
            h: 4,
            reason: "spawn art".to_string(),
        }];
        let (addr, _commands) = spawn_server(
            16,
            16,
            zones,
            None,
            None,
            dir.path().join("board.dat"),
            Duration::from_secs(3600),
        )
        .await;

        let mut alice = TestClient::connect(addr, "guest-a").await;
        alice.expect_ink().await;
        alice.sync().await;
        let mut bob = TestClient::connect(addr, "guest-b").await;
        bob.expect_ink().await;
        bob.sync().await;

        alice.paint(1, 1, RED).await;

        let (ink, _, _) = alice.expect_ink().await;
        assert_eq!(ink, 250, "protected edits never consume ink");
        alice.expect_silence().await;
        bob.expect_silence().await;
    }
}

/// CROSS-PROCESS REPLICATION TESTS
mod replication_tests {
    use super::*;

    /// Two servers on the same replication channel converge: an edit
    /// accepted by one reaches the other's clients and board.
    #[tokio::test]
    async fn two_servers_converge_via_shared_bus() {
        let dir = tempfile::tempdir().unwrap();
        let bus = LocalBus::new(64);

        let (addr1, _commands1) = spawn_server(
            16,
            16,
            Vec::new(),
            None,
            Some(ReplicationBridge::new(bus.handle())),
            dir.path().join("board1.dat"),
            Duration::from_secs(3600),
        )
        .await;
        let (addr2, _commands2) = spawn_server(
            16,
            16,
            Vec::new(),
            None,
            Some(ReplicationBridge::new(bus.handle())),
            dir.path().join("board2.dat"),
            Duration::from_secs(3600),
        )
        .await;

        let mut alice = TestClient::connect(addr1, "guest-a").await;
        alice.expect_ink().await;
        alice.sync().await;
        let mut bob = TestClient::connect(addr2, "guest-b").await;
        bob.expect_ink().await;
        bob.sync().await;

        alice.paint(5, 5, RED).await;
        alice.expect_ink().await;

        // Bob never talked to server 1, yet the edit arrives.
        match bob.recv().await {
            Packet::Edit { data } => {
                let edit = codec::decode_edit(&data).unwrap();
                assert_eq!((edit.x, edit.y), (5, 5));
                assert_eq!((edit.r, edit.g, edit.b), RED);
            }
            other => panic!("Expected Edit, got {:?}", other),
        }

        // A client connecting to server 2 afterwards sees the pixel in its
        // snapshot.
        let mut carol = TestClient::connect(addr2, "guest-c").await;
        carol.expect_ink().await;
        let (width, _, board) = carol.sync().await;
        assert_eq!(pixel_at(&board, width, 5, 5), RED);
    }
}

/// PERSISTENCE TESTS
mod persistence_tests {
    use super::*;

    /// Edits survive a restart: the flush loop uploads to the remote store
    /// and a new server instance recovers the board from it.
    #[tokio::test]
    async fn board_survives_restart_via_remote_store() {
        let dir = tempfile::tempdir().unwrap();
        let remote_path = dir.path().join("remote.dat");
        let remote: Arc<dyn SnapshotStore> = Arc::new(FileStore::new(remote_path.clone()));

        let (addr, commands) = spawn_server(
            16,
            16,
            Vec::new(),
            Some(Arc::clone(&remote)),
            None,
            dir.path().join("cache1.dat"),
            Duration::from_millis(50),
        )
        .await;

        let mut alice = TestClient::connect(addr, "guest-a").await;
        alice.expect_ink().await;
        alice.sync().await;
        alice.paint(2, 3, RED).await;
        alice.expect_ink().await;

        // Wait for a flush to reach the remote store.
        let mut uploaded = false;
        for _ in 0..100 {
            if let Ok(Some(bytes)) = remote.download().await {
                if bytes.len() == 16 * 16 * 3 && pixel_at(&bytes, 16, 2, 3) == RED {
                    uploaded = true;
                    break;
                }
            }
            sleep(Duration::from_millis(20)).await;
        }
        assert!(uploaded, "flush never reached the remote store");

        commands.send(ServerCommand::Shutdown).unwrap();

        let (addr2, _commands2) = spawn_server(
            16,
            16,
            Vec::new(),
            Some(remote),
            None,
            dir.path().join("cache2.dat"),
            Duration::from_secs(3600),
        )
        .await;
        let mut bob = TestClient::connect(addr2, "guest-b").await;
        bob.expect_ink().await;
        let (width, _, board) = bob.sync().await;
        assert_eq!(pixel_at(&board, width, 2, 3), RED);
    }

    /// A snapshot taken under older, smaller board dimensions loads into a
    /// larger deployment with its content intact at the origin.
    #[tokio::test]
    async fn legacy_snapshot_migrates_on_startup() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("board.dat");

        // A 1000x1000 snapshot: white except one red pixel at (100, 100).
        let mut legacy = vec![255u8; 1000 * 1000 * 3];
        let i = (100 * 1000 + 100) * 3;
        legacy[i] = RED.0;
        legacy[i + 1] = RED.1;
        legacy[i + 2] = RED.2;
        std::fs::write(&cache, &legacy).unwrap();

        let (addr, _commands) = spawn_server(
            1200,
            1200,
            Vec::new(),
            None,
            None,
            cache,
            Duration::from_secs(3600),
        )
        .await;

        let mut client = TestClient::connect(addr, "guest-a").await;
        client.expect_ink().await;
        let (width, height, board) = client.sync().await;
        assert_eq!((width, height), (1200, 1200));
        assert_eq!(pixel_at(&board, width, 100, 100), RED);
        assert_eq!(pixel_at(&board, width, 1100, 1100), (255, 255, 255));
    }
}
