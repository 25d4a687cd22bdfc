//! Integration tests for the persistent client/server link over real TCP.

use specsplit_core::transport::{read_frame, write_frame};
use specsplit_core::{
    ClientConfig, ConnectionState, PersistentClient, PersistentServer, ServerConfig, SplitError,
    TransportConfig,
};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};

const MAX: u32 = TransportConfig::DEFAULT_MAX_FRAME_SIZE;

async fn bind_server() -> PersistentServer {
    PersistentServer::bind(ServerConfig::new("127.0.0.1", 0))
        .await
        .expect("Failed to bind server")
}

fn client_for(server: &PersistentServer) -> PersistentClient {
    PersistentClient::new(
        ClientConfig::new("127.0.0.1", server.local_addr().port())
            .with_max_retries(3)
            .with_retry_backoff(Duration::from_millis(20)),
    )
}

/// Connect `client` and accept it on `server`.
async fn connect_pair(client: &mut PersistentClient, server: &mut PersistentServer) {
    client.ensure_connected().await.unwrap();
    server.accept().await.unwrap();
}

#[tokio::test]
async fn test_proposals_scores_scenario() {
    let mut server = bind_server().await;
    let mut client = client_for(&server);
    connect_pair(&mut client, &mut server).await;

    client.send(b"PROPOSALS01").await.unwrap();
    assert_eq!(server.receive().await.unwrap(), b"PROPOSALS01".to_vec());

    server.send(b"SCORES0001").await.unwrap();
    assert_eq!(client.receive().await.unwrap(), b"SCORES0001".to_vec());
}

#[tokio::test]
async fn test_server_send_before_accept_is_not_connected() {
    let mut server = bind_server().await;
    assert!(matches!(
        server.send(b"SCORES0001").await,
        Err(SplitError::NotConnected)
    ));
}

#[tokio::test]
async fn test_frames_arrive_in_order_with_exact_bytes() {
    let mut server = bind_server().await;
    let mut client = client_for(&server);
    connect_pair(&mut client, &mut server).await;

    let mut payloads: Vec<Vec<u8>> = (0..64u32)
        .map(|i| (0..i * 13).map(|j| (j % 251) as u8).collect())
        .collect();
    payloads.push(Vec::new());
    payloads.push(vec![0xAB; 2 * 1024 * 1024]);

    let expected = payloads.clone();
    let sender = tokio::spawn(async move {
        for p in &payloads {
            client.send(p).await.unwrap();
        }
        client
    });

    for want in &expected {
        assert_eq!(&server.receive().await.unwrap(), want);
    }
    sender.await.unwrap();
}

#[tokio::test]
async fn test_reconnect_after_peer_drop() {
    let mut server = bind_server().await;
    let mut client = client_for(&server);
    connect_pair(&mut client, &mut server).await;
    let first_local = client.local_addr();

    server.release_peer().await;
    // Let the client's socket observe the close.
    tokio::time::sleep(Duration::from_millis(50)).await;

    client.ensure_connected().await.unwrap();
    assert_eq!(client.reconnects(), 1);
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_ne!(client.local_addr(), first_local);

    server.accept().await.unwrap();
    client.send(b"PROPOSALS01").await.unwrap();
    assert_eq!(server.receive().await.unwrap(), b"PROPOSALS01".to_vec());
    server.send(b"SCORES0001").await.unwrap();
    assert_eq!(client.receive().await.unwrap(), b"SCORES0001".to_vec());
}

#[tokio::test]
async fn test_receive_after_peer_drop_marks_client_broken() {
    let mut server = bind_server().await;
    let mut client = client_for(&server);
    connect_pair(&mut client, &mut server).await;

    server.close().await;

    let err = client.receive().await.unwrap_err();
    assert!(err.is_connection_fatal());
    assert_eq!(client.state(), ConnectionState::Broken);
    assert!(matches!(
        client.send(b"late").await,
        Err(SplitError::NotConnected)
    ));
}

#[tokio::test]
async fn test_retry_bound_against_closed_port() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let backoff = Duration::from_millis(25);
    let mut client = PersistentClient::new(
        ClientConfig::new("127.0.0.1", port)
            .with_max_retries(3)
            .with_retry_backoff(backoff),
    );

    let started = Instant::now();
    let err = client.ensure_connected().await.unwrap_err();
    match err {
        SplitError::ConnectFailed { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("Expected ConnectFailed, got: {:?}", other),
    }
    assert!(started.elapsed() >= backoff * 2);

    // The client stays usable once the target comes up.
    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
    client.ensure_connected().await.unwrap();
    assert!(client.is_connected());
    drop(accept.await.unwrap());
}

#[tokio::test]
async fn test_zero_retries_still_attempts_once() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let mut client =
        PersistentClient::new(ClientConfig::new("127.0.0.1", port).with_max_retries(0));

    match client.ensure_connected().await.unwrap_err() {
        SplitError::ConnectFailed { attempts, .. } => assert_eq!(attempts, 1),
        other => panic!("Expected ConnectFailed, got: {:?}", other),
    }
}

#[tokio::test]
async fn test_second_client_does_not_disturb_session() {
    let mut server = bind_server().await;
    let mut client = client_for(&server);
    connect_pair(&mut client, &mut server).await;

    let mut intruder = TcpStream::connect(server.local_addr()).await.unwrap();
    let mut buf = [0u8; 16];
    let n = intruder.read(&mut buf).await.unwrap_or(0);
    assert_eq!(n, 0, "intruder should be closed without data");
    assert_eq!(server.rejected_connections(), 1);

    client.send(b"PROPOSALS01").await.unwrap();
    assert_eq!(server.receive().await.unwrap(), b"PROPOSALS01".to_vec());
    server.send(b"SCORES0001").await.unwrap();
    assert_eq!(client.receive().await.unwrap(), b"SCORES0001".to_vec());
}

#[tokio::test]
async fn test_oversized_length_prefix_is_protocol_violation() {
    let config = ServerConfig::new("127.0.0.1", 0).with_max_frame_size(1024);
    let mut server = PersistentServer::bind(config).await.unwrap();
    let addr = server.local_addr();

    let raw = tokio::spawn(async move {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        use tokio::io::AsyncWriteExt;
        stream.write_all(&4096u32.to_be_bytes()).await.unwrap();
        stream
    });
    server.accept().await.unwrap();
    let _raw = raw.await.unwrap();

    assert!(matches!(
        server.receive().await,
        Err(SplitError::ProtocolViolation { .. })
    ));
    assert!(!server.has_peer());
}

#[tokio::test]
async fn test_oversized_send_leaves_session_usable() {
    let mut server = bind_server().await;
    let mut client = PersistentClient::new(
        ClientConfig::new("127.0.0.1", server.local_addr().port()).with_max_frame_size(8),
    );
    connect_pair(&mut client, &mut server).await;

    assert!(matches!(
        client.send(&[0; 9]).await,
        Err(SplitError::ProtocolViolation { .. })
    ));
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(client.reconnects(), 0);

    client.send(b"PROPOSAL").await.unwrap();
    assert_eq!(server.receive().await.unwrap(), b"PROPOSAL".to_vec());
    server.send(b"SCORES01").await.unwrap();
    assert_eq!(client.receive().await.unwrap(), b"SCORES01".to_vec());
}

#[tokio::test]
async fn test_client_frames_readable_by_plain_framing() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let peer = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let request = read_frame(&mut stream, MAX).await.unwrap();
        write_frame(&mut stream, &request, MAX).await.unwrap();
        stream
    });

    let mut client = PersistentClient::new(ClientConfig::new("127.0.0.1", port));
    client.ensure_connected().await.unwrap();
    client.send(&[1, 2, 3, 4, 5]).await.unwrap();
    assert_eq!(client.receive().await.unwrap(), vec![1, 2, 3, 4, 5]);
    drop(peer.await.unwrap());
}
