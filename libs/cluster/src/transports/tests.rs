//! Transport Layer Tests
//!
//! Pool checkout semantics, listener behaviour and node reconnects, all
//! over real loopback sockets.

use super::*;
use crate::routing::MessageRouter;
use crate::ClusterError;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use trellis_codec::{Frame, RequestFrame, CODE_DISPATCH_FAILED, CODE_OK, HEARTBEAT_SESSION_ID};
use trellis_config::ClusterSettings;

/// Accepts and holds connections without ever reading from them
struct CountingServer {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
}

impl CountingServer {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));

        let count = accepted.clone();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                count.fetch_add(1, Ordering::SeqCst);
                held.push(stream);
            }
        });

        Self { addr, accepted }
    }

    fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

/// Poll `condition` until it holds or `limit` passes
async fn wait_until<F: Fn() -> bool>(condition: F, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

fn unused_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

mod pool {
    use super::*;

    #[tokio::test]
    async fn test_checkout_blocks_until_put() {
        let server = CountingServer::start().await;
        let pool = ConnectionPool::connect(&server.addr.to_string(), 2, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(pool.size(), 2);
        assert_eq!(pool.free_count(), 2);

        let first = pool.get().await.unwrap();
        let second = pool.get().await.unwrap();
        assert_ne!(first.slot(), second.slot());
        assert_eq!(pool.free_count(), 0);

        let blocked = tokio::time::timeout(Duration::from_millis(100), pool.get()).await;
        assert!(blocked.is_err(), "third checkout should wait");

        pool.put(first);
        let third = tokio::time::timeout(Duration::from_secs(1), pool.get())
            .await
            .expect("checkout after put")
            .unwrap();

        pool.put(second);
        pool.put(third);
        assert_eq!(pool.free_count(), 2);
    }

    #[tokio::test]
    async fn test_close_fails_checkout_and_wakes_waiters() {
        let server = CountingServer::start().await;
        let pool = Arc::new(
            ConnectionPool::connect(&server.addr.to_string(), 1, Duration::from_secs(1))
                .await
                .unwrap(),
        );

        let held = pool.get().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.get().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        pool.close();
        pool.close();
        assert!(pool.is_closed());

        let woken = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(woken, Err(ClusterError::PoolClosed { .. })));
        assert!(matches!(pool.get().await, Err(ClusterError::PoolClosed { .. })));

        // Returned after close: dropped, not restored
        pool.put(held);
        assert_eq!(pool.free_count(), 0);
    }

    #[tokio::test]
    async fn test_foreign_connection_is_ignored() {
        let server = CountingServer::start().await;
        let target = server.addr.to_string();
        let ours = ConnectionPool::connect(&target, 1, Duration::from_secs(1)).await.unwrap();
        let theirs = ConnectionPool::connect(&target, 1, Duration::from_secs(1)).await.unwrap();
        assert_ne!(ours.id(), theirs.id());

        let ours_conn = ours.get().await.unwrap();
        let foreign = theirs.get().await.unwrap();

        ours.put(foreign);
        assert_eq!(ours.free_count(), 0);

        ours.put(ours_conn);
        assert_eq!(ours.free_count(), 1);
    }

    #[tokio::test]
    async fn test_readers_handed_over_once() {
        let server = CountingServer::start().await;
        let pool = ConnectionPool::connect(&server.addr.to_string(), 3, Duration::from_secs(1))
            .await
            .unwrap();

        let readers = pool.take_readers();
        let mut slots: Vec<usize> = readers.iter().map(|(slot, _)| *slot).collect();
        slots.sort_unstable();
        assert_eq!(slots, vec![0, 1, 2]);
        assert!(pool.take_readers().is_empty());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let target = format!("127.0.0.1:{}", unused_port());
        let result = ConnectionPool::connect(&target, 2, Duration::from_secs(1)).await;
        assert!(result.unwrap_err().is_transport());
    }

    #[tokio::test]
    async fn test_zero_size_uses_default() {
        let server = CountingServer::start().await;
        let pool = ConnectionPool::connect(&server.addr.to_string(), 0, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(pool.size(), DEFAULT_POOL_SIZE);
        assert!(wait_until(|| server.accepted() == DEFAULT_POOL_SIZE, Duration::from_secs(1)).await);
    }
}

mod listener {
    use super::*;
    use tokio::sync::mpsc;

    fn settings() -> ClusterSettings {
        ClusterSettings {
            listener_initial_timeout_ms: 2_000,
            listener_idle_timeout_ms: 2_000,
            ..Default::default()
        }
    }

    /// Router that forwards every `(7, 1)` payload to the returned channel
    fn recording_router() -> (Arc<MessageRouter>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let router = Arc::new(MessageRouter::new());
        router.register(7, 1, move |payload| {
            tx.send(payload.to_vec())?;
            Ok(())
        });
        router.register(7, 2, |_| anyhow::bail!("handler refused"));
        (router, rx)
    }

    #[tokio::test]
    async fn test_heartbeat_echo_on_every_pooled_connection() {
        let (router, _rx) = recording_router();
        let listener = Listener::bind("127.0.0.1:0", router, &settings()).await.unwrap();

        let pool = ConnectionPool::connect(
            &listener.local_addr().to_string(),
            2,
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        let mut readers = pool.take_readers();

        let heartbeat = Frame::Request(RequestFrame::heartbeat());
        let mut first = pool.get().await.unwrap();
        let mut second = pool.get().await.unwrap();
        first.send(&heartbeat).await.unwrap();
        second.send(&heartbeat).await.unwrap();
        pool.put(first);
        pool.put(second);

        for (_, reader) in readers.iter_mut() {
            let reply = tcp::recv_frame(reader, 1024, Some(Duration::from_secs(2)))
                .await
                .unwrap();
            match reply {
                Frame::Response(response) => {
                    assert!(response.is_heartbeat());
                    assert_eq!(response.code, 0);
                    assert_eq!(response.session_id, HEARTBEAT_SESSION_ID);
                    assert!(response.payload.is_empty());
                }
                other => panic!("expected heartbeat response, got {:?}", other),
            }
        }

        listener.shutdown().await;
    }

    #[tokio::test]
    async fn test_requests_dispatched_and_failures_survived() {
        let (router, mut rx) = recording_router();
        let listener = Listener::bind("127.0.0.1:0", router, &settings()).await.unwrap();

        let mut stream = tcp::dial(&listener.local_addr().to_string()).await.unwrap();
        for (module, cmd, payload) in [(7, 2, "refused"), (9, 9, "unrouted"), (7, 1, "hello")] {
            let request = RequestFrame::new(module, cmd, "session-1", payload.as_bytes().to_vec());
            tcp::send_frame(&mut stream, &Frame::Request(request)).await.unwrap();
        }

        let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, b"hello".to_vec());
        assert_eq!(listener.connection_count(), 1);

        // Every request is answered in order on the same connection
        let expected = [
            (7, 2, CODE_DISPATCH_FAILED),
            (9, 9, CODE_DISPATCH_FAILED),
            (7, 1, CODE_OK),
        ];
        for (module, cmd, code) in expected {
            let reply = tcp::recv_frame(&mut stream, 1024, Some(Duration::from_secs(2)))
                .await
                .unwrap();
            match reply {
                Frame::Response(response) => {
                    assert_eq!((response.module, response.cmd), (module, cmd));
                    assert_eq!(response.session_id, "session-1");
                    assert_eq!(response.code, code);
                    if code == CODE_OK {
                        assert_eq!(&response.payload[..], b"hello");
                    } else {
                        assert!(!response.payload.is_empty());
                    }
                }
                other => panic!("expected response, got {:?}", other),
            }
        }

        // Same connection still answers heartbeats
        tcp::send_frame(&mut stream, &Frame::Request(RequestFrame::heartbeat()))
            .await
            .unwrap();
        let reply = tcp::recv_frame(&mut stream, 1024, Some(Duration::from_secs(2)))
            .await
            .unwrap();
        assert!(matches!(reply, Frame::Response(ref response) if response.is_heartbeat()));

        listener.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_completes_while_peer_stops_reading() {
        let (router, _rx) = recording_router();
        let listener = Listener::bind("127.0.0.1:0", router, &settings()).await.unwrap();

        // Keep writing large requests but never read the replies, so the
        // listener ends up blocked writing into a full socket buffer
        let stream = tcp::dial(&listener.local_addr().to_string()).await.unwrap();
        let (_reader, mut writer) = stream.into_split();
        let flood = tokio::spawn(async move {
            let payload = vec![0x5au8; 256 * 1024];
            for _ in 0..256 {
                let request = RequestFrame::new(7, 1, "flood", payload.clone());
                if tcp::send_frame(&mut writer, &Frame::Request(request)).await.is_err() {
                    break;
                }
            }
            writer
        });
        tokio::time::sleep(Duration::from_millis(300)).await;

        tokio::time::timeout(Duration::from_secs(2), listener.shutdown())
            .await
            .expect("shutdown should not wait on a stalled peer");
        assert_eq!(listener.connection_count(), 0);
        flood.abort();
    }

    #[tokio::test]
    async fn test_silent_connection_closed_after_initial_timeout() {
        let (router, _rx) = recording_router();
        let settings = ClusterSettings {
            listener_initial_timeout_ms: 100,
            ..settings()
        };
        let listener = Listener::bind("127.0.0.1:0", router, &settings).await.unwrap();

        let mut stream = TcpStream::connect(listener.local_addr()).await.unwrap();
        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .expect("listener should close the connection")
            .unwrap_or(0);
        assert_eq!(read, 0);
        assert!(wait_until(|| listener.connection_count() == 0, Duration::from_secs(1)).await);

        listener.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections_and_is_idempotent() {
        let (router, _rx) = recording_router();
        let listener = Listener::bind("127.0.0.1:0", router, &settings()).await.unwrap();
        let addr = listener.local_addr();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        assert!(wait_until(|| listener.connection_count() == 1, Duration::from_secs(1)).await);

        listener.shutdown().await;
        listener.shutdown().await;
        assert_eq!(listener.connection_count(), 0);

        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(read, 0);
    }
}

mod node {
    use super::*;
    use crate::cluster::{Node, NodeStatus};
    use trellis_config::{Addr, AppConfig};

    #[tokio::test]
    async fn test_heartbeat_failure_reconnects_exactly_once() {
        let server = CountingServer::start().await;
        let config = AppConfig::new(1, "shard", "test", Addr::new("127.0.0.1", server.addr.port()));
        let settings = ClusterSettings {
            pool_size: 2,
            dial_timeout_ms: 1_000,
            heartbeat_interval_ms: 60_000,
            monitor_interval_ms: 60_000,
            reconnect_delay_ms: 60_000,
            ..Default::default()
        };
        let node = Node::new(config.service_id(), config, settings).unwrap();

        node.connect().await.unwrap();
        assert_eq!(node.status(), NodeStatus::Connected);
        assert!(wait_until(|| server.accepted() == 2, Duration::from_secs(1)).await);

        // Every heartbeat checkout now fails against the same pool
        node.pool().unwrap().close();
        assert_eq!(node.heartbeat_tick().await, 0);
        assert_eq!(node.heartbeat_tick().await, 0);

        assert!(wait_until(|| server.accepted() == 4, Duration::from_secs(2)).await);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(server.accepted(), 4);

        assert!(wait_until(|| node.status() == NodeStatus::Connected, Duration::from_secs(1)).await);
        let pool = node.pool().unwrap();
        assert!(!pool.is_closed());
        assert_eq!(pool.size(), 2);

        node.disconnect().await;
        assert!(node.pool().is_none());
    }

    #[tokio::test]
    async fn test_send_goes_out_on_pooled_connection() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let router = Arc::new(MessageRouter::new());
        router.register(3, 4, move |payload| {
            tx.send(payload.to_vec())?;
            Ok(())
        });
        let listener = Listener::bind("127.0.0.1:0", router, &ClusterSettings::default())
            .await
            .unwrap();

        let port = listener.local_addr().port();
        let config = AppConfig::new(2, "shard", "test", Addr::new("127.0.0.1", port));
        let node = Node::new(config.service_id(), config, ClusterSettings::default()).unwrap();
        node.connect().await.unwrap();

        let session_id = node.send(3, 4, b"ping".to_vec()).await.unwrap();
        assert_eq!(session_id.len(), 36);

        let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, b"ping".to_vec());

        node.disconnect().await;
        listener.shutdown().await;
    }

    #[tokio::test]
    async fn test_reply_reaches_node_router() {
        let remote = Arc::new(MessageRouter::new());
        remote.register(3, 4, |_| Ok(()));
        let listener = Listener::bind("127.0.0.1:0", remote, &ClusterSettings::default())
            .await
            .unwrap();

        // Replies echo the request route, so the node's own (3, 4) handler sees them
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let local = Arc::new(MessageRouter::new());
        local.register(3, 4, move |payload| {
            tx.send(payload.to_vec())?;
            Ok(())
        });

        let port = listener.local_addr().port();
        let config = AppConfig::new(2, "shard", "test", Addr::new("127.0.0.1", port));
        let node = Node::with_router(config.service_id(), config, ClusterSettings::default(), local)
            .unwrap();
        node.connect().await.unwrap();

        node.send(3, 4, b"ping".to_vec()).await.unwrap();
        let echoed = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("reply should reach the node router")
            .unwrap();
        assert_eq!(echoed, b"ping".to_vec());

        node.disconnect().await;
        listener.shutdown().await;
    }
}
