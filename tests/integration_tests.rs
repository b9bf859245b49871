// Integration tests for the drift file store
// These tests validate end-to-end behavior across real TCP connections:
// replication on store, remote fetch on get, and the stream latch that
// keeps bulk payloads out of the frame decoder.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

use drift::crypto;
use drift::frame;
use drift::server::{FileServer, FileServerOpts};
use drift::storage::cas_path_transform;
use drift::transport::{TcpPeer, TcpTransport, TcpTransportOpts};
use drift::{Error, KEY_SIZE};

fn test_root(name: &str) -> String {
    std::env::temp_dir()
        .join(format!("drift_test_{}_{}", name, std::process::id()))
        .to_string_lossy()
        .into_owned()
}

fn make_server(
    key: &[u8; KEY_SIZE],
    bootstrap: Vec<String>,
    root: String,
) -> Arc<FileServer> {
    let server = Arc::new(FileServer::new(FileServerOpts {
        encrypt_key: *key,
        listen_addr: "127.0.0.1:0".to_string(),
        storage_root: root,
        path_transform: cas_path_transform,
        bootstrap_nodes: bootstrap,
    }));

    let spawned = Arc::clone(&server);
    tokio::spawn(async move {
        if let Err(e) = spawned.start().await {
            eprintln!("server exited: {}", e);
        }
    });

    server
}

async fn wait_listen_addr(server: &FileServer) -> SocketAddr {
    for _ in 0..100 {
        if let Some(addr) = server.listen_addr() {
            return addr;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("server never bound its listener");
}

async fn read_all(server: &FileServer, key: &str) -> Vec<u8> {
    let mut file = server.get(key).await.expect("get should succeed");
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await.unwrap();
    buf
}

// ============================================================================
// Two-Node End-to-End Tests
// ============================================================================

#[tokio::test]
async fn test_store_replicates_to_peer() {
    let key = crypto::new_encryption_key();
    let root_a = test_root("replicate_a");
    let root_b = test_root("replicate_b");

    let node_a = make_server(&key, vec![], root_a.clone());
    let addr_a = wait_listen_addr(&node_a).await;

    let node_b = make_server(&key, vec![addr_a.to_string()], root_b.clone());
    wait_listen_addr(&node_b).await;
    sleep(Duration::from_millis(500)).await;

    node_b
        .store("hello", &mut &b"hello world"[..])
        .await
        .expect("store should succeed");
    sleep(Duration::from_millis(500)).await;

    // the push reached node a, which now serves it locally
    assert!(node_a.exists("hello").await);
    assert_eq!(read_all(&node_a, "hello").await, b"hello world");
    assert_eq!(read_all(&node_b, "hello").await, b"hello world");

    node_a.stop();
    node_b.stop();
    let _ = std::fs::remove_dir_all(&root_a);
    let _ = std::fs::remove_dir_all(&root_b);
}

#[tokio::test]
async fn test_get_fetches_from_remote_peer() {
    let key = crypto::new_encryption_key();
    let root_a = test_root("fetch_a");
    let root_b = test_root("fetch_b");
    let root_c = test_root("fetch_c");

    let node_a = make_server(&key, vec![], root_a.clone());
    let addr_a = wait_listen_addr(&node_a).await;

    let node_b = make_server(&key, vec![addr_a.to_string()], root_b.clone());
    wait_listen_addr(&node_b).await;
    sleep(Duration::from_millis(500)).await;

    node_b
        .store("shared", &mut &b"fetched over the wire"[..])
        .await
        .unwrap();
    sleep(Duration::from_millis(500)).await;

    // node c joins after the store, so it holds nothing locally
    let node_c = make_server(&key, vec![addr_a.to_string()], root_c.clone());
    wait_listen_addr(&node_c).await;
    sleep(Duration::from_millis(500)).await;

    assert!(!node_c.exists("shared").await);
    assert_eq!(read_all(&node_c, "shared").await, b"fetched over the wire");

    // the fetched copy is now local
    assert!(node_c.exists("shared").await);

    node_a.stop();
    node_b.stop();
    node_c.stop();
    let _ = std::fs::remove_dir_all(&root_a);
    let _ = std::fs::remove_dir_all(&root_b);
    let _ = std::fs::remove_dir_all(&root_c);
}

#[tokio::test]
async fn test_demo_scenario_ten_keys() {
    let key = crypto::new_encryption_key();
    let root_a = test_root("ten_a");
    let root_b = test_root("ten_b");

    let node_a = make_server(&key, vec![], root_a.clone());
    let addr_a = wait_listen_addr(&node_a).await;

    let node_b = make_server(&key, vec![addr_a.to_string()], root_b.clone());
    wait_listen_addr(&node_b).await;
    sleep(Duration::from_millis(500)).await;

    for i in 0..10 {
        let key_name = format!("hello{}", i);
        let payload = format!("hello world {}", i);
        node_b
            .store(&key_name, &mut payload.as_bytes())
            .await
            .unwrap();
    }
    sleep(Duration::from_millis(500)).await;

    for i in 0..10 {
        let key_name = format!("hello{}", i);
        let expected = format!("hello world {}", i);
        assert_eq!(read_all(&node_a, &key_name).await, expected.as_bytes());
        assert_eq!(read_all(&node_b, &key_name).await, expected.as_bytes());
    }

    node_a.stop();
    node_b.stop();
    let _ = std::fs::remove_dir_all(&root_a);
    let _ = std::fs::remove_dir_all(&root_b);
}

// ============================================================================
// Broadcast Fan-Out Tests
// ============================================================================

#[tokio::test]
async fn test_store_fans_out_to_all_peers() {
    let key = crypto::new_encryption_key();
    let root_a = test_root("fanout_a");
    let root_b = test_root("fanout_b");
    let root_c = test_root("fanout_c");

    let node_a = make_server(&key, vec![], root_a.clone());
    let addr_a = wait_listen_addr(&node_a).await;

    let node_b = make_server(&key, vec![addr_a.to_string()], root_b.clone());
    let node_c = make_server(&key, vec![addr_a.to_string()], root_c.clone());
    wait_listen_addr(&node_b).await;
    wait_listen_addr(&node_c).await;
    sleep(Duration::from_millis(500)).await;

    // both b and c are connected to a; one store reaches each of them
    node_a
        .store("fanned", &mut &b"one write, every peer"[..])
        .await
        .unwrap();
    sleep(Duration::from_millis(500)).await;

    assert!(node_b.exists("fanned").await);
    assert!(node_c.exists("fanned").await);
    assert_eq!(read_all(&node_b, "fanned").await, b"one write, every peer");
    assert_eq!(read_all(&node_c, "fanned").await, b"one write, every peer");

    node_a.stop();
    node_b.stop();
    node_c.stop();
    let _ = std::fs::remove_dir_all(&root_a);
    let _ = std::fs::remove_dir_all(&root_b);
    let _ = std::fs::remove_dir_all(&root_c);
}

// ============================================================================
// Local Hit Tests
// ============================================================================

#[tokio::test]
async fn test_get_hits_local_store_without_peers() {
    let key = crypto::new_encryption_key();
    let root = test_root("local_hit");

    let node = make_server(&key, vec![], root.clone());
    wait_listen_addr(&node).await;

    node.store("solo", &mut &b"no peers required"[..])
        .await
        .unwrap();

    // no cluster, no network: the value comes straight off disk
    assert_eq!(read_all(&node, "solo").await, b"no peers required");

    node.stop();
    let _ = std::fs::remove_dir_all(&root);
}

#[tokio::test]
async fn test_get_unknown_key_is_not_found() {
    let key = crypto::new_encryption_key();
    let root = test_root("unknown");

    let node = make_server(&key, vec![], root.clone());
    wait_listen_addr(&node).await;

    let err = node.get("never-stored").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    node.stop();
    let _ = std::fs::remove_dir_all(&root);
}

// ============================================================================
// Stream Latch Tests
// ============================================================================

#[tokio::test]
async fn test_stream_marker_pauses_frame_decoding() {
    // capture peers as the transport sees them
    let peers: Arc<Mutex<Vec<Arc<TcpPeer>>>> = Arc::new(Mutex::new(Vec::new()));
    let on_peer = {
        let peers = Arc::clone(&peers);
        Arc::new(move |peer: Arc<TcpPeer>| -> Result<(), Error> {
            peers.lock().unwrap().push(peer);
            Ok(())
        }) as drift::transport::OnPeerFn
    };

    let transport = TcpTransport::new(TcpTransportOpts {
        listen_addr: "127.0.0.1:0".to_string(),
        handshake: None,
        on_peer: Some(on_peer),
    });
    transport.listen_and_accept().await.unwrap();
    let addr = transport.listen_addr().unwrap();
    let mut rpc_rx = transport.consume();

    let mut client = TcpStream::connect(addr).await.unwrap();

    // control frame, stream marker, then another control frame
    client
        .write_all(&frame::encode_message(b"before").unwrap())
        .await
        .unwrap();
    client.write_all(&[frame::STREAM_FRAME]).await.unwrap();
    client
        .write_all(&frame::encode_message(b"after").unwrap())
        .await
        .unwrap();
    client.flush().await.unwrap();

    // the first frame arrives normally
    let rpc = timeout(Duration::from_secs(1), rpc_rx.recv())
        .await
        .expect("first frame should arrive")
        .unwrap();
    assert_eq!(rpc.payload, b"before");

    // the worker is now parked on the latch: the frame behind the
    // marker must not be decoded
    assert!(
        timeout(Duration::from_millis(300), rpc_rx.recv())
            .await
            .is_err(),
        "no frame may be published while the peer is streaming"
    );

    let peer = peers.lock().unwrap().first().cloned().unwrap();
    assert!(peer.is_streaming());

    // releasing the latch resumes decoding in order
    peer.close_stream();
    let rpc = timeout(Duration::from_secs(1), rpc_rx.recv())
        .await
        .expect("decoding should resume after close_stream")
        .unwrap();
    assert_eq!(rpc.payload, b"after");

    transport.close();
}

#[tokio::test]
async fn test_frames_from_other_peers_flow_during_stream() {
    let transport = TcpTransport::new(TcpTransportOpts {
        listen_addr: "127.0.0.1:0".to_string(),
        handshake: None,
        on_peer: None,
    });
    transport.listen_and_accept().await.unwrap();
    let addr = transport.listen_addr().unwrap();
    let mut rpc_rx = transport.consume();

    // first client parks its worker with a stream marker
    let mut blocked = TcpStream::connect(addr).await.unwrap();
    blocked.write_all(&[frame::STREAM_FRAME]).await.unwrap();
    blocked.flush().await.unwrap();
    sleep(Duration::from_millis(100)).await;

    // a second client's frames are unaffected
    let mut active = TcpStream::connect(addr).await.unwrap();
    active
        .write_all(&frame::encode_message(b"independent").unwrap())
        .await
        .unwrap();
    active.flush().await.unwrap();

    let rpc = timeout(Duration::from_secs(1), rpc_rx.recv())
        .await
        .expect("other peers keep flowing")
        .unwrap();
    assert_eq!(rpc.payload, b"independent");

    transport.close();
}
