//! Persistence integration tests.
//!
//! Verifies:
//! - Placements reach RocksDB through the full server stack
//! - Restart recovery: drop the server, reopen, the canvas survives
//! - Last write wins across restarts
//! - A store outage never affects commits or broadcasts
//! - Reopening with another canvas size is refused

use place_sync::client::{CanvasClient, ClientEvent};
use place_sync::config::{CanvasConfig, ServerConfig};
use place_sync::placement::{PlacementRequest, PlacementResult};
use place_sync::server::CanvasServer;
use place_sync::storage::{MemoryPixelStore, PixelStore, StoreError};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::net::TcpListener;
use tokio::time::timeout;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn config_at(path: &Path) -> ServerConfig {
    ServerConfig {
        storage_path: Some(path.to_path_buf()),
        canvas: CanvasConfig {
            size: 100,
            cooldown: Duration::ZERO,
            ..CanvasConfig::default()
        },
        ..ServerConfig::default()
    }
}

/// Open a server on `config`, retrying while a dropped predecessor's
/// persister thread still holds the RocksDB lock.
async fn reopen(config: ServerConfig) -> CanvasServer {
    for _ in 0..100 {
        match CanvasServer::new(config.clone()) {
            Ok(server) => return server,
            Err(StoreError::DatabaseError(_)) => {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(e) => panic!("Unexpected store error: {e}"),
        }
    }
    panic!("RocksDB lock was never released");
}

fn place(server: &CanvasServer, x: i64, y: i64, color: &str, who: &str) -> PlacementResult {
    server
        .service()
        .place(PlacementRequest::new(x, y, color, who))
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_canvas_survives_restart() {
    let dir = tempdir().unwrap();
    let config = config_at(&dir.path().join("db"));

    {
        let server = reopen(config.clone()).await;
        for i in 0..20 {
            let result = place(&server, i, i * 2, "#3690EA", "10.1.0.1");
            assert!(matches!(result, PlacementResult::Committed { .. }));
        }
        server.flush().await;
    }

    let server = reopen(config).await;
    assert_eq!(server.recover().unwrap(), 20);

    let grid = server.service().grid();
    for i in 0..20 {
        let cell = grid.get(i, i * 2).unwrap();
        assert_eq!(server.service().palette().color(cell.color.unwrap()), Some("#3690EA"));
        assert_eq!(cell.last_writer.as_deref(), Some("10.1.0.1"));
    }
    assert!(grid.get(1, 1).unwrap().is_default());
}

#[tokio::test]
async fn test_last_write_survives_restart() {
    let dir = tempdir().unwrap();
    let config = config_at(&dir.path().join("db"));

    {
        let server = reopen(config.clone()).await;
        place(&server, 50, 50, "#000000", "a");
        place(&server, 50, 50, "#FFFFFF", "b");
        place(&server, 50, 50, "#811E9F", "c");
        server.flush().await;
    }

    let server = reopen(config).await;
    server.recover().unwrap();
    let cell = server.service().grid().get(50, 50).unwrap();
    assert_eq!(server.service().palette().color(cell.color.unwrap()), Some("#811E9F"));
    assert_eq!(cell.last_writer.as_deref(), Some("c"));
}

#[tokio::test]
async fn test_recovered_pixels_appear_in_snapshot() {
    let dir = tempdir().unwrap();
    let config = config_at(&dir.path().join("db"));

    {
        let server = reopen(config.clone()).await;
        place(&server, 4, 2, "#FF99AA", "10.1.0.2");
        server.flush().await;
    }

    let server = Arc::new(reopen(config).await);
    server.recover().unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let serving = server.clone();
    tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });

    let mut client = CanvasClient::new(format!("ws://127.0.0.1:{port}"));
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    let mut snapshot = None;
    while snapshot.is_none() {
        let event = timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        if let ClientEvent::Snapshot { size, pixels, .. } = event {
            assert_eq!(size, 100);
            snapshot = Some(pixels);
        }
    }
    let pixels = snapshot.unwrap();
    assert_eq!(pixels.len(), 1);
    assert_eq!((pixels[0].x, pixels[0].y), (4, 2));
    assert_eq!(pixels[0].color, "#FF99AA");
}

#[tokio::test]
async fn test_canvas_size_change_is_refused() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");

    {
        let server = reopen(config_at(&path)).await;
        place(&server, 1, 1, "#000000", "a");
        server.flush().await;
    }

    let mut bigger = config_at(&path);
    bigger.canvas.size = 200;
    let mut result = CanvasServer::new(bigger.clone());
    for _ in 0..100 {
        if !matches!(result, Err(StoreError::DatabaseError(_))) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        result = CanvasServer::new(bigger.clone());
    }
    assert!(matches!(
        result,
        Err(StoreError::CanvasMismatch {
            stored: 100,
            configured: 200
        })
    ));
}

#[tokio::test]
async fn test_store_outage_does_not_block_placements() {
    let store = Arc::new(MemoryPixelStore::new());
    store.set_available(false);

    let config = ServerConfig {
        canvas: CanvasConfig {
            size: 100,
            cooldown: Duration::ZERO,
            ..CanvasConfig::default()
        },
        ..ServerConfig::default()
    };
    let server = CanvasServer::with_store(config, store.clone()).unwrap();
    let mut observer = server.service().hub().subscribe();
    observer.recv().await.unwrap();

    assert!(matches!(
        place(&server, 9, 9, "#00A368", "10.1.0.3"),
        PlacementResult::Committed { .. }
    ));
    assert!(observer.try_recv().is_ok());
    assert!(!server.service().grid().get(9, 9).unwrap().is_default());

    server.flush().await;
    assert!(store.is_empty());
    assert_eq!(server.service().persister().unwrap().stats().failed, 1);

    // Writes resume once the store is back.
    store.set_available(true);
    place(&server, 9, 10, "#00A368", "10.1.0.3");
    server.flush().await;
    assert_eq!(store.len(), 1);
    assert!(store.load_all().unwrap().iter().any(|(x, y, _)| (*x, *y) == (9, 10)));
}
