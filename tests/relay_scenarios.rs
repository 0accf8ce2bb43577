//! End-to-end scenarios over real sockets: SOCKS5 in, QUIC across, TCP out.

use netshaper::client::Client;
use netshaper::config::Config;
use netshaper::registration::{PtAnnouncer, ServerBindaddr};
use netshaper::server::Server;
use netshaper::transport::quic::{generate_self_signed, server_config_from_pem, QuicDialer};
use netshaper::transport::socks5::{auth, reply, SOCKS_VERSION};
use netshaper::transport::Dialer;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn test_config(methods: &[&str]) -> Config {
    let mut config = Config::default();
    config.transport_methods = methods.iter().map(|m| m.to_string()).collect();
    config.timeouts.connect_timeout = 2;
    config.timeouts.close_linger = 1;
    config
}

fn test_server(config: Config) -> Server {
    let generated = generate_self_signed(vec!["localhost".to_string(), "127.0.0.1".to_string()]).unwrap();
    let server_config =
        server_config_from_pem(generated.cert_pem.as_bytes(), generated.key_pem.as_bytes(), &config).unwrap();
    Server::with_server_config(config, server_config)
}

fn bindaddr(method: &str, addr: SocketAddr) -> ServerBindaddr {
    ServerBindaddr {
        method: method.to_string(),
        addr,
    }
}

/// TCP echo server standing in for the ORPort
async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
            });
        }
    });
    addr
}

/// SOCKS5 CONNECT through the client role's listener
async fn socks_connect(socks_addr: SocketAddr, target: SocketAddr) -> TcpStream {
    let mut socks = TcpStream::connect(socks_addr).await.unwrap();
    socks.write_all(&[SOCKS_VERSION, 1, auth::NO_AUTH]).await.unwrap();
    let mut choice = [0u8; 2];
    socks.read_exact(&mut choice).await.unwrap();
    assert_eq!(choice, [SOCKS_VERSION, auth::NO_AUTH]);

    let SocketAddr::V4(target) = target else {
        panic!("test targets are IPv4");
    };
    let mut request = vec![SOCKS_VERSION, 1, 0, 1];
    request.extend_from_slice(&target.ip().octets());
    request.extend_from_slice(&target.port().to_be_bytes());
    socks.write_all(&request).await.unwrap();

    let mut response = [0u8; 10];
    socks.read_exact(&mut response).await.unwrap();
    assert_eq!(response[1], reply::SUCCESS);
    socks
}

fn payload(seed: usize) -> Vec<u8> {
    (0..4096).map(|i| ((i * 31 + seed * 7) % 251) as u8).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_circuits_echo_and_drain() {
    let orport = spawn_echo_server().await;

    let mut server = test_server(test_config(&["example"]));
    let announcer = PtAnnouncer::new(Vec::new());
    let server_endpoints = server
        .bind_all(&[bindaddr("example", "127.0.0.1:0".parse().unwrap())], orport, &announcer)
        .await
        .unwrap();
    assert_eq!(server_endpoints.len(), 1);
    let bridge_addr = server_endpoints[0].address;

    let client = Client::new(test_config(&["example"])).unwrap();
    let client_announcer = PtAnnouncer::new(Vec::new());
    let client_endpoints = client
        .bind_all(&["example".to_string()], &client_announcer)
        .await
        .unwrap();
    let socks_addr = client_endpoints[0].address;

    let mut circuits = Vec::new();
    for seed in 0..10 {
        circuits.push(tokio::spawn(async move {
            let mut socks = socks_connect(socks_addr, bridge_addr).await;
            let sent = payload(seed);
            socks.write_all(&sent).await.unwrap();
            socks.shutdown().await.unwrap();

            let mut received = Vec::new();
            socks.read_to_end(&mut received).await.unwrap();
            assert_eq!(received, sent, "circuit {} echo mismatch", seed);
        }));
    }
    for circuit in circuits {
        tokio::time::timeout(Duration::from_secs(20), circuit)
            .await
            .expect("circuit timed out")
            .unwrap();
    }

    let client_shutdown = client.shutdown();
    client_shutdown.begin_drain();
    tokio::time::timeout(Duration::from_secs(10), client_shutdown.await_drain())
        .await
        .expect("client did not drain");

    let server_shutdown = server.shutdown();
    server_shutdown.begin_drain();
    tokio::time::timeout(Duration::from_secs(10), server_shutdown.await_drain())
        .await
        .expect("server did not drain");
    assert_eq!(server_shutdown.active_bridges(), 0);
    assert_eq!(server_shutdown.active_listeners(), 0);

    let lines = String::from_utf8(announcer.into_inner()).unwrap();
    assert_eq!(lines, format!("SMETHOD example {}\nSMETHODS DONE\n", bridge_addr));
    let lines = String::from_utf8(client_announcer.into_inner()).unwrap();
    assert_eq!(lines, format!("CMETHOD example socks5 {}\nCMETHODS DONE\n", socks_addr));
}

#[tokio::test]
async fn test_bind_in_use_fails_only_that_method() {
    let occupied = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let taken = occupied.local_addr().unwrap();

    let mut server = test_server(test_config(&["example", "netshaper"]));
    let announcer = PtAnnouncer::new(Vec::new());
    let endpoints = server
        .bind_all(
            &[
                bindaddr("example", taken),
                bindaddr("netshaper", "127.0.0.1:0".parse().unwrap()),
            ],
            "127.0.0.1:9".parse().unwrap(),
            &announcer,
        )
        .await
        .unwrap();

    assert_eq!(endpoints.len(), 1);
    assert_eq!(endpoints[0].method, "netshaper");

    let output = String::from_utf8(announcer.into_inner()).unwrap();
    let lines: Vec<&str> = output.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("SMETHOD-ERROR example "));
    assert_eq!(lines[1], format!("SMETHOD netshaper {}", endpoints[0].address));
    assert_eq!(lines[2], "SMETHODS DONE");
    assert_eq!(output.matches("example").count(), 1);

    let shutdown = server.shutdown();
    shutdown.begin_drain();
    tokio::time::timeout(Duration::from_secs(2), shutdown.await_drain())
        .await
        .unwrap();
    drop(occupied);
}

#[tokio::test]
async fn test_unreachable_orport_closes_quic_connection_with_code() {
    // Nothing listens on the released port
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let orport = closed.local_addr().unwrap();
    drop(closed);

    let mut server = test_server(test_config(&["example"]));
    let announcer = PtAnnouncer::new(Vec::new());
    let endpoints = server
        .bind_all(&[bindaddr("example", "127.0.0.1:0".parse().unwrap())], orport, &announcer)
        .await
        .unwrap();

    let dialer = QuicDialer::new(&test_config(&["example"])).unwrap();
    let mut stream = dialer.open_to(&endpoints[0].address.to_string()).await.unwrap();
    // The server only sees the stream once data arrives on it
    stream.write_all(b"hello").await.unwrap();

    let mut buf = Vec::new();
    let err = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut buf))
        .await
        .expect("read did not finish")
        .expect_err("connection should be refused");

    let read_err = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<quinn::ReadError>())
        .expect("quinn read error");
    match read_err {
        quinn::ReadError::ConnectionLost(quinn::ConnectionError::ApplicationClosed(close)) => {
            assert_eq!(close.error_code, quinn::VarInt::from_u32(1));
        }
        other => panic!("unexpected read error: {:?}", other),
    }

    let shutdown = server.shutdown();
    shutdown.begin_drain();
    tokio::time::timeout(Duration::from_secs(5), shutdown.await_drain())
        .await
        .unwrap();
}
