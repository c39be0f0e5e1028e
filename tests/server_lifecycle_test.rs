//! Integration tests for server lifecycle, registry tracking, and the purge
//! cadence.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use linesock::{Connection, LineServer, ServerConfig, ServerEventHandler};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn test_config() -> ServerConfig {
    ServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        ..ServerConfig::default()
    }
}

#[derive(Default)]
struct CountingHandler {
    connects: AtomicUsize,
    disconnects: AtomicUsize,
}

impl ServerEventHandler for CountingHandler {
    fn on_connect(&self, _connection: Arc<Connection>) {
        self.connects.fetch_add(1, Ordering::SeqCst);
    }

    fn on_disconnect(&self, _connection: Arc<Connection>) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

async fn wait_for_count(server: &LineServer, expected: usize) {
    for _ in 0..200 {
        if server.connection_count().await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "registry never reached {} connections (currently {})",
        expected,
        server.connection_count().await
    );
}

async fn wait_until_all_disconnected(server: &LineServer) {
    for _ in 0..200 {
        let connections = server.connections().await;
        if connections.iter().all(|c| !c.is_connected()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("server-side connections never observed peer disconnect");
}

#[tokio::test]
async fn registry_tracks_accepted_connections() {
    init_tracing();
    let mut server = LineServer::new(test_config());
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();

    let handler = Arc::new(CountingHandler::default());
    server.set_event_handler(Arc::clone(&handler) as Arc<dyn ServerEventHandler>).await;

    let mut clients = Vec::new();
    for _ in 0..5 {
        clients.push(Connection::connect(addr).await.unwrap());
    }

    wait_for_count(&server, 5).await;
    assert_eq!(server.accepted_total(), 5);

    for _ in 0..200 {
        if handler.connects.load(Ordering::SeqCst) == 5 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(handler.connects.load(Ordering::SeqCst), 5);
    assert_eq!(handler.disconnects.load(Ordering::SeqCst), 0);

    for client in &clients {
        client.close().await;
    }
    server.stop().await.unwrap();
}

#[tokio::test]
async fn purge_runs_before_the_triggering_connection_is_registered() {
    init_tracing();
    let mut server = LineServer::new(ServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        purge_interval: 3,
        ..ServerConfig::default()
    });
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();

    let handler = Arc::new(CountingHandler::default());
    server.set_event_handler(Arc::clone(&handler) as Arc<dyn ServerEventHandler>).await;

    // Two connections, both torn down by the client side.
    let first = Connection::connect(addr).await.unwrap();
    let second = Connection::connect(addr).await.unwrap();
    wait_for_count(&server, 2).await;
    first.close().await;
    second.close().await;
    wait_until_all_disconnected(&server).await;

    // The third acceptance hits the purge interval, so the dead entries are
    // removed before the new connection is registered.
    let third = Connection::connect(addr).await.unwrap();
    wait_for_count(&server, 1).await;
    assert_eq!(server.accepted_total(), 3);

    let survivors = server.connections().await;
    assert_eq!(survivors.len(), 1);
    assert!(survivors[0].is_connected());

    for _ in 0..200 {
        if handler.disconnects.load(Ordering::SeqCst) == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(handler.disconnects.load(Ordering::SeqCst), 2);

    third.close().await;
    server.stop().await.unwrap();
}

#[tokio::test]
async fn purge_never_removes_a_live_connection() {
    init_tracing();
    let mut server = LineServer::new(ServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        purge_interval: 1,
        ..ServerConfig::default()
    });
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();

    // With a purge on every acceptance, each new connection triggers a scan
    // over all previously registered ones.
    let mut clients = Vec::new();
    for _ in 0..4 {
        clients.push(Connection::connect(addr).await.unwrap());
    }

    wait_for_count(&server, 4).await;
    assert!(server.connections().await.iter().all(|c| c.is_connected()));

    for client in &clients {
        client.close().await;
    }
    server.stop().await.unwrap();
}

#[tokio::test]
async fn stop_leaves_registered_connections_alive() {
    init_tracing();
    let mut server = LineServer::new(test_config());
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();

    let client = Connection::connect(addr).await.unwrap();
    wait_for_count(&server, 1).await;

    server.stop().await.unwrap();

    // The registered connection still works after the listener is gone.
    let server_side = server.connections().await.into_iter().next().unwrap();
    client.write("still alive").await.unwrap();
    let message = server_side
        .wait_for_message_timeout(Duration::from_secs(2))
        .await;
    assert_eq!(message.as_deref(), Some("still alive"));
    assert!(server_side.is_connected());

    client.close().await;
}

#[tokio::test]
async fn stop_rejects_new_connections() {
    init_tracing();
    let mut server = LineServer::new(test_config());
    server.start().await.unwrap();
    let addr = server.local_addr().unwrap();
    server.stop().await.unwrap();

    // The listener is dropped with the accept task, so a fresh dial must
    // fail outright or be torn down immediately.
    match tokio::net::TcpStream::connect(addr).await {
        Err(_) => {}
        Ok(stream) => {
            let connection = Connection::new(stream);
            let message = connection
                .wait_for_message_timeout(Duration::from_secs(2))
                .await;
            assert_eq!(message, None);
            assert!(!connection.is_connected());
        }
    }
}
