use intercept_proxy::config::ProxyConfig;
use intercept_proxy::core::{ChunkSink, Direction, HookEvent, HookRegistry, ProxyServer, Scope, SessionInfo};
use intercept_proxy::transport::tls;
use intercept_proxy::{Endpoint, Protocol, RuleSet};

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tokio::time::timeout;

#[derive(Default)]
struct Recorder {
    chunks: Mutex<Vec<(Direction, Vec<u8>)>>,
    events: Mutex<Vec<HookEvent>>,
}

impl Recorder {
    fn chunks(&self) -> Vec<(Direction, Vec<u8>)> {
        self.chunks.lock().unwrap().clone()
    }

    fn count(&self, event: HookEvent) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| **e == event)
            .count()
    }

    fn hooks(self: &Arc<Self>) -> HookRegistry {
        let mut hooks = HookRegistry::new();
        let r = Arc::clone(self);
        hooks.on_client_connect(move |_| r.events.lock().unwrap().push(HookEvent::ClientConnect));
        let r = Arc::clone(self);
        hooks.on_client_disconnect(move |_| {
            r.events.lock().unwrap().push(HookEvent::ClientDisconnect)
        });
        let r = Arc::clone(self);
        hooks.on_server_connect(move |_| r.events.lock().unwrap().push(HookEvent::ServerConnect));
        let r = Arc::clone(self);
        hooks.on_server_disconnect(move |_| {
            r.events.lock().unwrap().push(HookEvent::ServerDisconnect)
        });
        hooks
    }
}

impl ChunkSink for Recorder {
    fn chunk(&self, _info: &SessionInfo, direction: Direction, data: &[u8]) {
        self.chunks.lock().unwrap().push((direction, data.to_vec()));
    }
}

struct Proxy {
    server: Arc<ProxyServer>,
    addr: SocketAddr,
    task: JoinHandle<intercept_proxy::Result<()>>,
}

impl Proxy {
    async fn stop(self) {
        self.server.request_stop();
        timeout(Duration::from_secs(3), self.task)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }
}

async fn start_proxy(
    protocol: Protocol,
    upstream: SocketAddr,
    rules: RuleSet,
    recorder: &Arc<Recorder>,
    upstream_sni: Option<&str>,
) -> Proxy {
    let mut config = ProxyConfig::new(
        protocol,
        Endpoint::parse_listen("127.0.0.1:0").unwrap(),
        Endpoint::parse_upstream(&upstream.to_string()).unwrap(),
    );
    config.tls.upstream_sni = upstream_sni.map(str::to_string);

    let server = ProxyServer::builder(config)
        .rules(rules)
        .hooks(recorder.hooks())
        .sink(Arc::clone(recorder) as Arc<dyn ChunkSink>)
        .build();
    let bound = server.bind().await.unwrap();
    let addr = bound.local_addr().unwrap();
    let task = tokio::spawn(bound.serve());
    Proxy { server, addr, task }
}

/// Poll `cond` until it holds or two seconds pass
async fn wait_until(cond: impl Fn() -> bool) {
    timeout(Duration::from_secs(2), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

/// Read until end of stream or error, keeping whatever arrived
async fn drain<R: AsyncRead + Unpin>(stream: &mut R) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match timeout(Duration::from_secs(2), stream.read(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) | Err(_) => return out,
            Ok(Ok(n)) => out.extend_from_slice(&buf[..n]),
        }
    }
}

#[tokio::test]
async fn test_reset_rule_aborts_session() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    let upstream_task = tokio::spawn(async move {
        let (mut s, _) = upstream.accept().await.unwrap();
        drain(&mut s).await
    });

    let recorder = Arc::new(Recorder::default());
    let rules = RuleSet::builder()
        .reset(Scope::Client, "QUIT")
        .unwrap()
        .build();
    let proxy = start_proxy(Protocol::Tcp, upstream_addr, rules, &recorder, None).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client.write_all(b"QUIT\n").await.unwrap();

    let mut buf = [0u8; 16];
    let err = timeout(Duration::from_secs(2), client.read(&mut buf))
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset);

    let received = upstream_task.await.unwrap();
    assert!(received.is_empty());

    wait_until(|| recorder.count(HookEvent::ServerDisconnect) == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.count(HookEvent::ClientDisconnect), 1);
    assert_eq!(recorder.count(HookEvent::ServerDisconnect), 1);
    assert!(recorder.chunks().is_empty());

    proxy.stop().await;
}

#[tokio::test]
async fn test_rewrite_reaches_client_and_display() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut s, _) = upstream.accept().await.unwrap();
        s.write_all(b"token=secret123").await.unwrap();
        drain(&mut s).await;
    });

    let recorder = Arc::new(Recorder::default());
    let rules = RuleSet::builder()
        .rewrite(Scope::Both, "secret", "REDACTED")
        .unwrap()
        .build();
    let proxy = start_proxy(Protocol::Tcp, upstream_addr, rules, &recorder, None).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    let mut buf = vec![0u8; "token=REDACTED123".len()];
    timeout(Duration::from_secs(2), client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(buf, b"token=REDACTED123");

    wait_until(|| !recorder.chunks().is_empty()).await;
    assert_eq!(
        recorder.chunks()[0],
        (Direction::Server, b"token=REDACTED123".to_vec())
    );

    drop(client);
    proxy.stop().await;
}

#[tokio::test]
async fn test_chunks_relayed_in_order() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    let upstream_task = tokio::spawn(async move {
        let (mut s, _) = upstream.accept().await.unwrap();
        drain(&mut s).await
    });

    let recorder = Arc::new(Recorder::default());
    let proxy = start_proxy(Protocol::Tcp, upstream_addr, RuleSet::new(), &recorder, None).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    for chunk in [b"A", b"B", b"C"] {
        client.write_all(chunk).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    client.shutdown().await.unwrap();

    assert_eq!(upstream_task.await.unwrap(), b"ABC");
    let displayed: Vec<u8> = recorder
        .chunks()
        .into_iter()
        .filter(|(d, _)| *d == Direction::Client)
        .flat_map(|(_, data)| data)
        .collect();
    assert_eq!(displayed, b"ABC");

    drop(client);
    proxy.stop().await;
}

#[tokio::test]
async fn test_close_rule_forwards_then_closes() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut s, _) = upstream.accept().await.unwrap();
        s.write_all(b"221 bye").await.unwrap();
        drain(&mut s).await;
    });

    let recorder = Arc::new(Recorder::default());
    let rules = RuleSet::builder()
        .close(Scope::Server, "/^221/")
        .unwrap()
        .build();
    let proxy = start_proxy(Protocol::Tcp, upstream_addr, rules, &recorder, None).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    assert_eq!(drain(&mut client).await, b"221 bye");

    wait_until(|| proxy.server.active_sessions() == 0).await;
    assert_eq!(recorder.count(HookEvent::ClientDisconnect), 1);
    assert_eq!(recorder.count(HookEvent::ServerDisconnect), 1);

    proxy.stop().await;
}

#[tokio::test]
async fn test_ignored_chunk_never_displayed() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    let upstream_task = tokio::spawn(async move {
        let (mut s, _) = upstream.accept().await.unwrap();
        drain(&mut s).await
    });

    let recorder = Arc::new(Recorder::default());
    let rules = RuleSet::builder()
        .ignore(Scope::Both, "/PING/")
        .unwrap()
        .build();
    let proxy = start_proxy(Protocol::Tcp, upstream_addr, rules, &recorder, None).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client.write_all(b"PING").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.write_all(b"DATA").await.unwrap();
    client.shutdown().await.unwrap();

    assert_eq!(upstream_task.await.unwrap(), b"DATA");
    let chunks = recorder.chunks();
    assert!(chunks.iter().all(|(_, data)| data != b"PING"));

    drop(client);
    proxy.stop().await;
}

#[tokio::test]
async fn test_sessions_with_independent_rules_are_isolated() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut s, _)) = upstream.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 64];
                while let Ok(n) = s.read(&mut buf).await {
                    if n == 0 || s.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    let first_recorder = Arc::new(Recorder::default());
    let second_recorder = Arc::new(Recorder::default());
    let first_rules = RuleSet::builder()
        .rewrite(Scope::Client, "x", "1")
        .unwrap()
        .build();
    let second_rules = RuleSet::builder()
        .rewrite(Scope::Client, "x", "2")
        .unwrap()
        .build();
    let first = start_proxy(Protocol::Tcp, upstream_addr, first_rules, &first_recorder, None).await;
    let second =
        start_proxy(Protocol::Tcp, upstream_addr, second_rules, &second_recorder, None).await;

    let mut a = TcpStream::connect(first.addr).await.unwrap();
    let mut b = TcpStream::connect(second.addr).await.unwrap();
    a.write_all(b"x").await.unwrap();
    b.write_all(b"x").await.unwrap();

    let mut buf = [0u8; 1];
    a.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"1");
    b.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"2");

    assert!(first_recorder.chunks().iter().all(|(_, d)| d == b"1"));
    assert!(second_recorder.chunks().iter().all(|(_, d)| d == b"2"));
    assert_eq!(first_recorder.count(HookEvent::ClientConnect), 1);
    assert_eq!(second_recorder.count(HookEvent::ClientConnect), 1);

    drop((a, b));
    first.stop().await;
    second.stop().await;
}

#[tokio::test]
async fn test_udp_clients_have_independent_sessions() {
    let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 1500];
        while let Ok((n, from)) = upstream.recv_from(&mut buf).await {
            // reply with the sender's port so cross-talk would be visible
            let reply = format!("{}:{}", from.port(), String::from_utf8_lossy(&buf[..n]));
            let _ = upstream.send_to(reply.as_bytes(), from).await;
        }
    });

    let recorder = Arc::new(Recorder::default());
    let proxy = start_proxy(Protocol::Udp, upstream_addr, RuleSet::new(), &recorder, None).await;

    let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    a.connect(proxy.addr).await.unwrap();
    b.connect(proxy.addr).await.unwrap();

    let mut buf = [0u8; 1500];
    let mut upstream_ports = Vec::new();
    for (socket, payload) in [(&a, "a1"), (&b, "b1"), (&a, "a2"), (&b, "b2")] {
        socket.send(payload.as_bytes()).await.unwrap();
        let n = timeout(Duration::from_secs(2), socket.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let reply = String::from_utf8_lossy(&buf[..n]).to_string();
        let (port, echoed) = reply.split_once(':').unwrap();
        assert_eq!(echoed, payload);
        upstream_ports.push(port.to_string());
    }

    // each client keeps its own upstream socket
    assert_eq!(upstream_ports[0], upstream_ports[2]);
    assert_eq!(upstream_ports[1], upstream_ports[3]);
    assert_ne!(upstream_ports[0], upstream_ports[1]);
    assert_eq!(proxy.server.active_sessions(), 2);

    proxy.stop().await;
    assert_eq!(recorder.count(HookEvent::ClientDisconnect), 2);
}

#[tokio::test]
async fn test_tls_traffic_is_decrypted_and_rewritten() {
    // upstream TLS server
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    let acceptor = tokio_rustls::TlsAcceptor::from(tls::self_signed_server_config(&["localhost"]).unwrap());
    tokio::spawn(async move {
        let (s, _) = upstream.accept().await.unwrap();
        let mut s = acceptor.accept(s).await.unwrap();
        let mut buf = [0u8; 64];
        let n = s.read(&mut buf).await.unwrap();
        let mut reply = b"got ".to_vec();
        reply.extend_from_slice(&buf[..n]);
        s.write_all(&reply).await.unwrap();
        s.flush().await.unwrap();
        drain(&mut s).await;
    });

    let recorder = Arc::new(Recorder::default());
    let rules = RuleSet::builder()
        .rewrite(Scope::Client, "password", "********")
        .unwrap()
        .build();
    let proxy = start_proxy(Protocol::Tls, upstream_addr, rules, &recorder, Some("localhost")).await;

    let connector = tokio_rustls::TlsConnector::from(tls::insecure_client_config().unwrap());
    let tcp = TcpStream::connect(proxy.addr).await.unwrap();
    let server_name = rustls::pki_types::ServerName::try_from("localhost").unwrap();
    let mut client = connector.connect(server_name, tcp).await.unwrap();

    client.write_all(b"password").await.unwrap();
    client.flush().await.unwrap();
    let mut buf = vec![0u8; "got ********".len()];
    timeout(Duration::from_secs(3), client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(buf, b"got ********");

    let chunks = recorder.chunks();
    assert_eq!(chunks[0], (Direction::Client, b"********".to_vec()));

    drop(client);
    proxy.stop().await;
}

#[tokio::test]
async fn test_failed_tls_handshake_fires_no_hooks() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();

    let recorder = Arc::new(Recorder::default());
    let proxy = start_proxy(Protocol::Tls, upstream_addr, RuleSet::new(), &recorder, None).await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
    drain(&mut client).await;

    wait_until(|| proxy.server.active_sessions() == 0).await;
    assert_eq!(recorder.count(HookEvent::ClientConnect), 0);
    assert_eq!(recorder.count(HookEvent::ServerConnect), 0);

    proxy.stop().await;
}

#[tokio::test]
async fn test_stop_unwinds_live_sessions() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((s, _)) = upstream.accept().await {
            held.push(s);
        }
    });

    let recorder = Arc::new(Recorder::default());
    let proxy = start_proxy(Protocol::Tcp, upstream_addr, RuleSet::new(), &recorder, None).await;

    let _c1 = TcpStream::connect(proxy.addr).await.unwrap();
    let _c2 = TcpStream::connect(proxy.addr).await.unwrap();
    wait_until(|| recorder.count(HookEvent::ClientConnect) == 2).await;

    let server = Arc::clone(&proxy.server);
    proxy.stop().await;
    assert_eq!(server.active_sessions(), 0);
    assert_eq!(recorder.count(HookEvent::ClientDisconnect), 2);
    assert_eq!(recorder.count(HookEvent::ServerDisconnect), 2);
}
