//! End-to-end relays over loopback TCP with the stock collaborators

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use tunnel_relay::config::{Config, PeerConfig};
use tunnel_relay::selector::ConfiguredSelector;
use tunnel_relay::{Address, Error, Relay, RelayReport, Result, Transaction};

/// Echo everything back until the other side closes
async fn spawn_origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let (mut reader, mut writer) = stream.split();
        let _ = tokio::io::copy(&mut reader, &mut writer).await;
    });
    addr
}

/// A relaying peer: answers one CONNECT with 200 and a greeting, then echoes
async fn spawn_peer() -> (SocketAddr, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        stream
            .write_all(b"HTTP/1.1 200 Connection established\r\n\r\nwelcome;")
            .await
            .unwrap();
        let (mut reader, mut writer) = stream.split();
        let _ = tokio::io::copy(&mut reader, &mut writer).await;
        String::from_utf8_lossy(&head).to_string()
    });
    (addr, handle)
}

/// An address nobody listens on
async fn dead_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Connected loopback pair: (relay side, browser side)
async fn client_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let browser = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
    let (accepted, _) = listener.accept().await.unwrap();
    (accepted, browser)
}

fn relay_for(config: &Config) -> Arc<Relay> {
    let selector = ConfiguredSelector::new(config.peer_destinations(), config.direct);
    Arc::new(
        Relay::builder(config.relay.clone(), Arc::new(selector))
            .build()
            .unwrap(),
    )
}

fn peer_config(name: &str, addr: SocketAddr) -> PeerConfig {
    PeerConfig {
        name: name.to_string(),
        address: addr.ip().to_string(),
        port: addr.port(),
        tls: false,
        server_name: None,
        username: None,
        password: None,
    }
}

fn spawn_relay(
    relay: Arc<Relay>,
    target: Address,
    client: TcpStream,
) -> JoinHandle<Result<RelayReport>> {
    let browser_addr = client.peer_addr().unwrap();
    tokio::spawn(async move {
        relay
            .start_relay(Transaction::connect(Address::Socket(browser_addr), target), client)
            .await
    })
}

#[tokio::test]
async fn test_direct_to_origin() {
    let origin = spawn_origin().await;
    let relay = relay_for(&Config::default());
    let (client, mut browser) = client_pair().await;
    let handle = spawn_relay(relay, Address::Socket(origin), client);

    let ack = b"HTTP/1.1 200 Connection established\r\n\r\n";
    let mut buf = vec![0u8; ack.len()];
    browser.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, ack);

    browser.write_all(b"hello origin").await.unwrap();
    let mut echoed = [0u8; 12];
    browser.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"hello origin");

    browser.shutdown().await.unwrap();
    let mut rest = Vec::new();
    browser.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    let report = handle.await.unwrap().unwrap();
    assert_eq!(report.attempts, 1);
    assert_eq!(report.client_to_server, 12);
    assert_eq!(report.server_to_client, 12);
}

#[tokio::test]
async fn test_fails_over_to_live_peer() {
    let dead = dead_addr().await;
    let (live, peer_handle) = spawn_peer().await;
    let config = Config {
        peers: vec![peer_config("dead", dead), peer_config("live", live)],
        direct: false,
        ..Default::default()
    };

    let relay = relay_for(&config);
    let (client, mut browser) = client_pair().await;
    let handle = spawn_relay(relay, Address::domain("example.com", 443), client);

    let expected = b"HTTP/1.1 200 Connection established\r\n\r\nwelcome;".to_vec();
    let mut buf = vec![0u8; expected.len()];
    browser.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf, expected);

    browser.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    browser.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping");
    drop(browser);

    let report = handle.await.unwrap().unwrap();
    assert_eq!(report.attempts, 2);
    assert_eq!(report.destination.address, Address::Socket(live));

    let head = peer_handle.await.unwrap();
    assert!(head.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
}

#[tokio::test]
async fn test_all_peers_down_gets_error_reply() {
    let config = Config {
        peers: vec![
            peer_config("a", dead_addr().await),
            peer_config("b", dead_addr().await),
        ],
        direct: false,
        ..Default::default()
    };

    let relay = relay_for(&config);
    let (client, mut browser) = client_pair().await;
    let handle = spawn_relay(relay, Address::domain("example.com", 443), client);

    let mut reply = Vec::new();
    browser.read_to_end(&mut reply).await.unwrap();
    let reply = String::from_utf8_lossy(&reply);
    assert!(reply.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));

    let error = handle.await.unwrap().unwrap_err();
    assert!(!matches!(error, Error::NoPaths));
    assert_eq!(error.http_status(), 503);
}
