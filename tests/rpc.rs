use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::Result;
use crossbeam_channel::{Receiver, Sender};
use quanta::Instant;

use rdmarpc::prelude::*;
use rdmarpc::rdma::cm::{CmEventType, CmId, EventChannel};
use rdmarpc::rdma::context::Context;
use rdmarpc::rdma::cq::WcStatus;

const ECHO: u32 = 1;
const EMPTY: u32 = 2;
const FAIL: u32 = 3;
const PANIC: u32 = 4;
const GATED: u32 = 5;
const BIG: u32 = 6;
const SLOW: u32 = 7;

fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A running server that is shut down on drop.
struct TestServer {
    server: Arc<Server>,
    runner: Option<JoinHandle<Result<(), ServerError>>>,
    port: String,
}

impl TestServer {
    fn start(config: ServerConfig) -> Self {
        init_log();
        let server = Arc::new(Server::with_config("127.0.0.1", "0", config));
        server.register_handler(ECHO, |req, resp| {
            resp.write_all(req)?;
            Ok(())
        });
        server.register_handler(EMPTY, |_, _| Ok(()));
        server.register_handler(FAIL, |_, _| Err("no such key".into()));
        server.register_handler(PANIC, |_, _| panic!("handler exploded"));
        server.register_handler(BIG, |req, resp| {
            let n = String::from_utf8_lossy(req).parse::<usize>()?;
            resp.write_all(&vec![7u8; n])?;
            Ok(())
        });

        let runner = thread::spawn({
            let server = server.clone();
            move || server.run()
        });
        let addr = server
            .wait_listening(Duration::from_secs(5))
            .expect("server did not start listening");
        Self {
            server,
            runner: Some(runner),
            port: addr.port().to_string(),
        }
    }

    fn stop(&mut self) -> Result<(), ServerError> {
        self.server.shutdown_handle().shutdown();
        match self.runner.take() {
            Some(runner) => runner.join().expect("server thread panicked"),
            None => Ok(()),
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Register a handler that blocks until the returned sender lets it go, and
/// reports each entry on the returned receiver.
fn gate(server: &Server, id: u32) -> (Sender<()>, Receiver<()>) {
    let (open_tx, open_rx) = crossbeam_channel::unbounded::<()>();
    let (entered_tx, entered_rx) = crossbeam_channel::unbounded::<()>();
    server.register_handler(id, move |req, resp| {
        let _ = entered_tx.send(());
        open_rx.recv()?;
        resp.write_all(req)?;
        Ok(())
    });
    (open_tx, entered_rx)
}

#[test]
fn echo_round_trip() -> Result<()> {
    let server = TestServer::start(ServerConfig::default());
    let client = Client::new();
    let conn = client.connect("127.0.0.1", &server.port)?;

    assert_eq!(client.call(conn, ECHO, b"hello")?, b"hello");
    assert_eq!(client.call(conn, ECHO, b"")?, b"");
    let large = (0..4096).map(|i| i as u8).collect::<Vec<_>>();
    assert_eq!(client.call(conn, ECHO, &large)?, large);
    assert_eq!(client.available_slots(conn)?, MAX_CONTEXT_NUM);
    Ok(())
}

#[test]
fn unknown_procedure_is_not_empty_response() -> Result<()> {
    let server = TestServer::start(ServerConfig::default());
    let client = Client::new();
    let conn = client.connect("127.0.0.1", &server.port)?;

    assert_eq!(client.call(conn, EMPTY, b"x")?, Vec::<u8>::new());
    assert!(matches!(
        client.call(conn, 99, b"x"),
        Err(RpcError::UnknownProcedure(99))
    ));
    assert_eq!(client.call(conn, ECHO, b"still alive")?, b"still alive");
    Ok(())
}

#[test]
fn handler_faults_keep_connection() -> Result<()> {
    let server = TestServer::start(ServerConfig::default());
    let client = Client::new();
    let conn = client.connect("127.0.0.1", &server.port)?;

    match client.call(conn, FAIL, b"k") {
        Err(RpcError::HandlerFault(msg)) => assert_eq!(msg, "no such key"),
        other => panic!("unexpected result {:?}", other),
    }
    match client.call(conn, PANIC, b"") {
        Err(RpcError::HandlerFault(msg)) => assert!(msg.contains("handler exploded")),
        other => panic!("unexpected result {:?}", other),
    }
    assert_eq!(client.call(conn, ECHO, b"after")?, b"after");
    Ok(())
}

#[test]
fn handlers_registered_while_serving() -> Result<()> {
    let server = TestServer::start(ServerConfig::default());
    let client = Client::new();
    let conn = client.connect("127.0.0.1", &server.port)?;

    assert!(matches!(
        client.call(conn, 42, b""),
        Err(RpcError::UnknownProcedure(42))
    ));
    server.server.register_handler(42, |_, resp| {
        resp.write_all(b"late")?;
        Ok(())
    });
    assert_eq!(client.call(conn, 42, b"")?, b"late");

    // Registering again replaces the handler.
    server.server.register_handler(42, |_, resp| {
        resp.write_all(b"later")?;
        Ok(())
    });
    assert_eq!(client.call(conn, 42, b"")?, b"later");
    Ok(())
}

#[test]
fn backpressure_blocks_extra_call() -> Result<()> {
    let server = TestServer::start(ServerConfig::default());
    let (open, entered) = gate(&server.server, GATED);
    let client = Arc::new(Client::new());
    let conn = client.connect("127.0.0.1", &server.port)?;

    let callers = (0..MAX_CONTEXT_NUM + 1)
        .map(|i| {
            let client = client.clone();
            thread::spawn(move || {
                let req = format!("call-{}", i);
                client.call(conn, GATED, req.as_bytes()).map(|resp| (req, resp))
            })
        })
        .collect::<Vec<_>>();

    // Every context ends up lent out; the extra caller waits for one.
    let deadline = Instant::now() + Duration::from_secs(5);
    while client.available_slots(conn)? > 0 {
        assert!(Instant::now() < deadline, "contexts never ran out");
        thread::sleep(Duration::from_millis(5));
    }
    entered.recv_timeout(Duration::from_secs(5))?;
    thread::sleep(Duration::from_millis(50));
    assert!(callers.iter().all(|c| !c.is_finished()));

    for _ in 0..MAX_CONTEXT_NUM + 1 {
        open.send(())?;
    }
    for caller in callers {
        let (req, resp) = caller.join().expect("caller panicked")?;
        assert_eq!(resp, req.as_bytes());
    }
    assert_eq!(client.available_slots(conn)?, MAX_CONTEXT_NUM);
    Ok(())
}

#[test]
fn concurrent_calls_get_their_own_response() -> Result<()> {
    let server = TestServer::start(ServerConfig::default());
    let client = Arc::new(Client::new());
    let conn = client.connect("127.0.0.1", &server.port)?;

    let callers = (0..6)
        .map(|t| {
            let client = client.clone();
            thread::spawn(move || -> Result<(), RpcError> {
                for i in 0..50 {
                    let req = format!("thread {} call {}", t, i).repeat(i % 7 + 1);
                    assert_eq!(client.call(conn, ECHO, req.as_bytes())?, req.as_bytes());
                }
                Ok(())
            })
        })
        .collect::<Vec<_>>();
    for caller in callers {
        caller.join().expect("caller panicked")?;
    }
    Ok(())
}

#[test]
fn multiple_connections() -> Result<()> {
    let server = TestServer::start(ServerConfig::default());
    let client = Client::new();
    let a = client.connect("127.0.0.1", &server.port)?;
    let b = client.connect("127.0.0.1", &server.port)?;
    assert_ne!(a, b);

    assert_eq!(client.call(a, ECHO, b"a")?, b"a");
    assert_eq!(client.call(b, ECHO, b"b")?, b"b");

    client.disconnect(a)?;
    assert!(matches!(
        client.call(a, ECHO, b"a"),
        Err(RpcError::InvalidConnection)
    ));
    assert!(matches!(client.disconnect(a), Err(RpcError::InvalidConnection)));
    assert_eq!(client.call(b, ECHO, b"b")?, b"b");

    // A freed index is handed out again.
    assert_eq!(client.connect("127.0.0.1", &server.port)?, a);
    Ok(())
}

#[test]
fn accepts_while_another_connection_tears_down() -> Result<()> {
    let server = TestServer::start(ServerConfig::default());
    let (open, entered) = gate(&server.server, GATED);
    let client = Arc::new(Client::new());
    let a = client.connect("127.0.0.1", &server.port)?;

    let caller = thread::spawn({
        let client = client.clone();
        move || client.call(a, GATED, b"held")
    });
    entered.recv_timeout(Duration::from_secs(5))?;

    // The server cannot finish tearing `a` down while its handler runs.
    client.disconnect(a)?;
    assert!(caller.join().expect("caller panicked").is_err());

    let start = Instant::now();
    let b = client.connect("127.0.0.1", &server.port)?;
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(client.call(b, ECHO, b"b")?, b"b");

    open.send(())?;
    Ok(())
}

#[test]
fn size_limits() -> Result<()> {
    let server = TestServer::start(ServerConfig::default());
    let client = Client::with_config(ClientConfig {
        buffer_size: 1024,
        ..Default::default()
    });
    let conn = client.connect("127.0.0.1", &server.port)?;

    assert!(matches!(
        client.call(conn, ECHO, &[0u8; 1025]),
        Err(RpcError::RequestTooLarge(_))
    ));

    // The response must fit in the client's buffer, not just the server's.
    assert_eq!(client.call(conn, BIG, b"1024")?, vec![7u8; 1024]);
    assert!(matches!(
        client.call(conn, BIG, b"2000"),
        Err(RpcError::ResponseTooLarge(_))
    ));
    assert_eq!(client.call(conn, ECHO, b"ok")?, b"ok");
    Ok(())
}

#[test]
fn oversized_client_buffer_is_rejected() {
    let server = TestServer::start(ServerConfig::default());
    let client = Client::with_config(ClientConfig {
        buffer_size: 8192,
        ..Default::default()
    });
    assert!(matches!(
        client.connect("127.0.0.1", &server.port),
        Err(ConnectError::Rejected(CmEventType::Rejected))
    ));
}

#[test]
fn connect_to_nobody() {
    init_log();
    let client = Client::new();
    assert!(matches!(
        client.connect("127.0.0.1", "1"),
        Err(ConnectError::Rejected(CmEventType::Unreachable))
    ));
    assert!(matches!(
        client.connect("127.0.0.1", "port"),
        Err(ConnectError::Resolve(_))
    ));
}

/// A listener that never answers connect requests.
fn silent_listener() -> (EventChannel, CmId, String) {
    let ec = EventChannel::new();
    let id = CmId::new(&ec, &Context::open(None));
    id.bind_addr(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
        .unwrap();
    id.listen(8).unwrap();
    let port = id.local_addr().unwrap().port().to_string();
    (ec, id, port)
}

#[test]
fn connect_timeout() {
    init_log();
    let (_ec, _id, port) = silent_listener();
    let client = Client::with_config(ClientConfig {
        connect_timeout_ms: 200,
        ..Default::default()
    });

    let start = Instant::now();
    let result = client.connect("127.0.0.1", &port);
    let elapsed = Instant::now() - start;
    assert!(matches!(
        result,
        Err(ConnectError::Timeout {
            expected: CmEventType::Established,
            ..
        })
    ));
    assert!(elapsed >= Duration::from_millis(190), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(1500), "{:?}", elapsed);
}

#[test]
fn connect_timeout_default() {
    init_log();
    let (_ec, _id, port) = silent_listener();
    let client = Client::new();

    let start = Instant::now();
    let result = client.connect("127.0.0.1", &port);
    let elapsed = Instant::now() - start;
    assert!(matches!(result, Err(ConnectError::Timeout { .. })));
    assert!(elapsed >= Duration::from_millis(2900), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(5000), "{:?}", elapsed);
}

#[test]
fn call_timeout_tears_down_connection() -> Result<()> {
    let server = TestServer::start(ServerConfig::default());
    server.server.register_handler(SLOW, |req, resp| {
        thread::sleep(Duration::from_millis(300));
        resp.write_all(req)?;
        Ok(())
    });
    let client = Client::with_config(ClientConfig {
        call_timeout_ms: Some(50),
        ..Default::default()
    });
    let conn = client.connect("127.0.0.1", &server.port)?;

    assert_eq!(client.call(conn, ECHO, b"fast")?, b"fast");
    assert!(matches!(
        client.call(conn, SLOW, b"slow"),
        Err(RpcError::Timeout(50))
    ));
    assert!(matches!(
        client.call(conn, ECHO, b"fast"),
        Err(RpcError::InvalidConnection)
    ));
    Ok(())
}

#[test]
fn shutdown_fails_calls_in_flight() -> Result<()> {
    let mut server = TestServer::start(ServerConfig::default());
    let (open, entered) = gate(&server.server, GATED);
    let client = Arc::new(Client::new());
    let conn = client.connect("127.0.0.1", &server.port)?;

    let caller = thread::spawn({
        let client = client.clone();
        move || client.call(conn, GATED, b"never answered")
    });
    entered.recv_timeout(Duration::from_secs(5))?;

    // Tearing the connection down blocks until the running handler returns,
    // so stop the server from another thread.
    let stopper = thread::spawn(move || {
        let result = server.stop();
        (server, result)
    });
    assert!(matches!(
        caller.join().expect("caller panicked"),
        Err(RpcError::Completion(WcStatus::WrFlushErr))
    ));
    open.send(())?;
    let (_server, result) = stopper.join().expect("stopper panicked");
    result?;

    assert!(matches!(
        client.call(conn, ECHO, b"x"),
        Err(RpcError::InvalidConnection)
    ));
    Ok(())
}

#[test]
fn config_from_toml() -> Result<()> {
    let config = RpcConfig::from_toml_str(
        r#"
        [rdmarpc.client]
        buffer_size = 512

        [rdmarpc.server]
        worker_threads = 1
        buffer_size = 512
        "#,
    )?;
    let server = TestServer::start(config.server);
    let client = Client::with_config(config.client);
    let conn = client.connect("127.0.0.1", &server.port)?;
    assert_eq!(client.call(conn, ECHO, &[1u8; 512])?, vec![1u8; 512]);
    Ok(())
}
