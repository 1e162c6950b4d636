//! Integration tests for the stride transport.
//!
//! These tests start real servers on loopback ports and talk to them with
//! clients and raw sockets to verify end-to-end behavior.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use stride::config::Settings;
use stride::{
    CallContext, Client, ClientOptions, Codec, Handler, Methods, Params, Payload, RpcError,
    RpcResult, Server, WireType,
};

/// Shared observations from inside a test handler.
#[derive(Debug, Default)]
struct Probe {
    invocations: AtomicUsize,
    in_flight: AtomicBool,
    overlaps: AtomicUsize,
    initialized: AtomicBool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Point {
    x: i64,
    y: i64,
}

impl WireType for Point {
    const TYPE_NAME: &'static str = "Point";
}

fn point_codec() -> Codec {
    let mut codec = Codec::new();
    codec.register::<Point>();
    codec
}

struct Calc {
    probe: Arc<Probe>,
    recorded: Vec<i64>,
}

impl Calc {
    fn enter(&self) {
        self.probe.invocations.fetch_add(1, Ordering::SeqCst);
    }

    fn add(&mut self, _ctx: &mut CallContext, params: Params) -> RpcResult<Payload> {
        self.enter();
        params.expect_len(2)?;
        Ok((params.get_i64(0)? + params.get_i64(1)?).into())
    }

    fn divide(&mut self, _ctx: &mut CallContext, params: Params) -> RpcResult<Payload> {
        self.enter();
        let divisor = params.get_i64(1)?;
        if divisor == 0 {
            return Err(RpcError::failed("divided by 0"));
        }
        Ok((params.get_i64(0)? / divisor).into())
    }

    fn record(&mut self, _ctx: &mut CallContext, params: Params) -> RpcResult<Payload> {
        self.enter();
        self.recorded.push(params.get_i64(0)?);
        Ok(Payload::Null)
    }

    fn recorded(&mut self, _ctx: &mut CallContext, _params: Params) -> RpcResult<Payload> {
        self.enter();
        let values: Vec<Payload> = self.recorded.iter().map(|v| Payload::from(*v)).collect();
        Ok(values.into())
    }

    fn slow(&mut self, _ctx: &mut CallContext, _params: Params) -> RpcResult<Payload> {
        self.enter();
        if self.probe.in_flight.swap(true, Ordering::SeqCst) {
            self.probe.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        std::thread::sleep(Duration::from_millis(5));
        self.probe.in_flight.store(false, Ordering::SeqCst);
        Ok(Payload::Null)
    }

    fn echo(&mut self, _ctx: &mut CallContext, params: Params) -> RpcResult<Payload> {
        self.enter();
        Ok(params.payload(0)?.clone())
    }

    fn shift(&mut self, _ctx: &mut CallContext, params: Params) -> RpcResult<Payload> {
        self.enter();
        let p = params.tagged::<Point>(0)?;
        Ok(Payload::tagged(Point {
            x: p.x + 1,
            y: p.y + 1,
        }))
    }

    fn shout(&mut self, ctx: &mut CallContext, params: Params) -> RpcResult<Payload> {
        self.enter();
        let text = params.get_string(0)?;
        ctx.notify_caller("heard", vec![text.to_uppercase().into()]);
        Ok("sent".into())
    }

    fn boom(&mut self, _ctx: &mut CallContext, _params: Params) -> RpcResult<Payload> {
        self.enter();
        panic!("handler exploded");
    }
}

impl Handler for Calc {
    fn register(methods: &mut Methods<Self>) {
        methods
            .register("add", Self::add)
            .register("divide", Self::divide)
            .register("record", Self::record)
            .register("recorded", Self::recorded)
            .register("slow", Self::slow)
            .register("echo", Self::echo)
            .register("shift", Self::shift)
            .register("shout", Self::shout)
            .register("boom", Self::boom);
    }

    fn initialize(&mut self, _server: &stride::ServerHandle) {
        self.probe.initialized.store(true, Ordering::SeqCst);
    }
}

/// Test server instance.
struct TestServer {
    server: Server,
    addr: String,
    probe: Arc<Probe>,
    connects: Arc<AtomicUsize>,
    disconnects: Arc<AtomicUsize>,
}

impl TestServer {
    async fn start() -> Self {
        Self::start_with(Codec::new(), None).await
    }

    async fn start_with(codec: Codec, max_connections: Option<usize>) -> Self {
        let probe = Arc::new(Probe::default());
        let connects = Arc::new(AtomicUsize::new(0));
        let disconnects = Arc::new(AtomicUsize::new(0));

        let factory_probe = Arc::clone(&probe);
        let on_connect = Arc::clone(&connects);
        let on_disconnect = Arc::clone(&disconnects);

        let server = Server::builder(&Settings::default())
            .listen("127.0.0.1:0")
            .codec(codec)
            .max_connections(max_connections)
            .on_connect(move |_| {
                on_connect.fetch_add(1, Ordering::SeqCst);
            })
            .on_disconnect(move |_| {
                on_disconnect.fetch_add(1, Ordering::SeqCst);
            })
            .start(move || Calc {
                probe: factory_probe,
                recorded: Vec::new(),
            })
            .await
            .expect("Failed to start server");

        let addr = server
            .local_addr()
            .expect("Server should be listening")
            .to_string();

        Self {
            server,
            addr,
            probe,
            connects,
            disconnects,
        }
    }

    async fn client(&self) -> Client {
        Client::connect(&self.addr, ClientOptions::new())
            .await
            .expect("Failed to connect")
    }

    async fn raw(&self) -> BufReader<TcpStream> {
        BufReader::new(TcpStream::connect(&self.addr).await.expect("Failed to connect"))
    }
}

/// Poll `condition` until it holds or two seconds pass.
async fn wait_until(condition: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

async fn send_line(stream: &mut BufReader<TcpStream>, line: &str) {
    stream
        .get_mut()
        .write_all(format!("{}\n", line).as_bytes())
        .await
        .expect("Failed to write");
}

async fn read_json(stream: &mut BufReader<TcpStream>) -> Value {
    let mut line = String::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_line(&mut line))
        .await
        .expect("Timed out waiting for a frame")
        .expect("Failed to read");
    serde_json::from_str(&line).expect("Frame is not JSON")
}

#[tokio::test]
async fn test_call_returns_result() {
    let ts = TestServer::start().await;
    let client = ts.client().await;

    let result = client.call("add", vec![2.into(), 3.into()]).await.unwrap();
    assert_eq!(result.as_i64(), Some(5));
    assert!(ts.probe.initialized.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_wire_exchange_for_call() {
    let ts = TestServer::start().await;
    let mut raw = ts.raw().await;

    send_line(&mut raw, r#"{"method":"add","params":[2,3],"id":1}"#).await;
    assert_eq!(read_json(&mut raw).await, json!({"id": 1, "result": 5}));
}

#[tokio::test]
async fn test_notification_gets_no_response() {
    let ts = TestServer::start().await;
    let mut raw = ts.raw().await;

    send_line(&mut raw, r#"{"method":"record","params":[1],"id":null}"#).await;
    send_line(&mut raw, r#"{"method":"add","params":[1,1],"id":7}"#).await;

    // The first frame back answers the call; the notification produced nothing.
    assert_eq!(read_json(&mut raw).await, json!({"id": 7, "result": 2}));
    assert_eq!(ts.probe.invocations.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_handler_failure_becomes_remote_error() {
    let ts = TestServer::start().await;
    let client = ts.client().await;

    let err = client
        .call("divide", vec![1.into(), 0.into()])
        .await
        .unwrap_err();
    match err {
        RpcError::Remote { error } => {
            assert!(error.as_str().unwrap().contains("divided by 0"));
        }
        other => panic!("expected remote error, got {:?}", other),
    }

    // Connection stays usable.
    assert!(client.is_open());
    let result = client.call("divide", vec![6.into(), 3.into()]).await.unwrap();
    assert_eq!(result.as_i64(), Some(2));
}

#[tokio::test]
async fn test_handler_panic_is_reported_and_dispatch_continues() {
    let ts = TestServer::start().await;
    let client = ts.client().await;

    let err = client.call("boom", vec![]).await.unwrap_err();
    assert!(err.to_string().contains("handler exploded"));

    let result = client.call("add", vec![1.into(), 1.into()]).await.unwrap();
    assert_eq!(result.as_i64(), Some(2));
}

#[tokio::test]
async fn test_unknown_method_runs_no_handler_code() {
    let ts = TestServer::start().await;
    let client = ts.client().await;

    let err = client.call("nope", vec![]).await.unwrap_err();
    assert!(matches!(err, RpcError::Remote { .. }));
    assert!(err.to_string().contains("nope"));
    assert_eq!(ts.probe.invocations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_malformed_method_and_params_get_error_replies() {
    let ts = TestServer::start().await;
    let mut raw = ts.raw().await;

    send_line(&mut raw, r#"{"method":5,"params":[],"id":1}"#).await;
    let reply = read_json(&mut raw).await;
    assert_eq!(reply["id"], json!(1));
    assert!(reply["error"].as_str().unwrap().contains("not a string"));

    send_line(&mut raw, r#"{"method":"add","params":{"a":1},"id":2}"#).await;
    let reply = read_json(&mut raw).await;
    assert_eq!(reply["id"], json!(2));
    assert!(reply["error"].as_str().unwrap().contains("not an array"));

    assert_eq!(ts.probe.invocations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_peer_close_releases_blocked_caller() {
    // A peer that reads one request and hangs up.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
    });

    let client = Client::connect(&addr, ClientOptions::new()).await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), client.call("wait", vec![]))
        .await
        .expect("Caller was left hanging");

    assert!(result.unwrap_err().is_connection_closed());
    assert!(!client.is_open());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_calls_get_their_own_results() {
    let ts = TestServer::start().await;
    let client = Arc::new(ts.client().await);

    let mut tasks = Vec::new();
    for i in 0..50i64 {
        let client = Arc::clone(&client);
        tasks.push(tokio::spawn(async move {
            let value = client.call("echo", vec![i.into()]).await.unwrap();
            (i, value.as_i64())
        }));
    }

    for task in tasks {
        let (sent, received) = task.await.unwrap();
        assert_eq!(received, Some(sent));
    }
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_notifications_dispatch_in_send_order() {
    let ts = TestServer::start().await;
    let client = ts.client().await;

    for i in 0..100i64 {
        client.notify("record", vec![i.into()]).await.unwrap();
    }
    let recorded = client.call("recorded", vec![]).await.unwrap();

    let expected: Vec<i64> = (0..100).collect();
    let recorded: Vec<i64> = recorded.deserialize().unwrap();
    assert_eq!(recorded, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dispatch_is_serialized_across_connections() {
    let ts = TestServer::start().await;

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let client = ts.client().await;
        tasks.push(tokio::spawn(async move {
            for _ in 0..5 {
                client.call("slow", vec![]).await.unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(ts.probe.invocations.load(Ordering::SeqCst), 20);
    assert_eq!(ts.probe.overlaps.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_close_is_idempotent_and_disconnect_fires_once() {
    let ts = TestServer::start().await;
    let client = ts.client().await;
    assert!(wait_until(|| ts.connects.load(Ordering::SeqCst) == 1).await);
    assert_eq!(ts.server.connections().len(), 1);

    // Close from the server side, twice, then from the client.
    let accepted = ts.server.connections().remove(0);
    accepted.close().await;
    accepted.close().await;
    client.close().await;

    assert!(wait_until(|| ts.disconnects.load(Ordering::SeqCst) >= 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(ts.disconnects.load(Ordering::SeqCst), 1);
    assert!(ts.server.connections().is_empty());
}

#[tokio::test]
async fn test_client_disconnect_untracks_connection() {
    let ts = TestServer::start().await;
    let client = ts.client().await;
    assert!(wait_until(|| ts.server.connections().len() == 1).await);

    drop(client);
    assert!(wait_until(|| ts.server.connections().is_empty()).await);
    assert_eq!(ts.disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_malformed_frame_gets_error_and_connection_recovers() {
    let ts = TestServer::start().await;
    let mut raw = ts.raw().await;

    send_line(&mut raw, "{this is not json").await;
    let reply = read_json(&mut raw).await;
    assert_eq!(reply["id"], Value::Null);
    assert!(reply["error"].is_string());

    send_line(&mut raw, r#"{"method":"add","params":[4,5],"id":2}"#).await;
    assert_eq!(read_json(&mut raw).await, json!({"id": 2, "result": 9}));
}

#[tokio::test]
async fn test_broadcast_reaches_every_connection() {
    let ts = TestServer::start().await;
    let mut first = ts.raw().await;
    let mut second = ts.raw().await;
    assert!(wait_until(|| ts.server.connections().len() == 2).await);

    let delivered = ts
        .server
        .broadcast("news", vec!["hello".into()])
        .await
        .unwrap();
    assert_eq!(delivered, 2);

    let expected = json!({"method": "news", "params": ["hello"], "id": null});
    assert_eq!(read_json(&mut first).await, expected);
    assert_eq!(read_json(&mut second).await, expected);
}

#[tokio::test]
async fn test_handler_notifies_caller_before_replying() {
    let ts = TestServer::start().await;
    let mut raw = ts.raw().await;

    send_line(&mut raw, r#"{"method":"shout","params":["hi"],"id":3}"#).await;
    assert_eq!(
        read_json(&mut raw).await,
        json!({"method": "heard", "params": ["HI"], "id": null})
    );
    assert_eq!(read_json(&mut raw).await, json!({"id": 3, "result": "sent"}));
}

/// Collects callbacks arriving on a client-bound server.
struct Listener {
    events: mpsc::UnboundedSender<String>,
}

impl Handler for Listener {
    fn register(methods: &mut Methods<Self>) {
        methods
            .register("heard", |this, _ctx, params| {
                let _ = this.events.send(params.get_string(0)?);
                Ok(Payload::Null)
            })
            .register("whoami", |_, _, _| Ok("listener".into()));
    }
}

#[tokio::test]
async fn test_peer_calls_back_into_client_bound_server() {
    let ts = TestServer::start().await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let local = Server::builder(&Settings::default())
        .no_listen()
        .start(move || Listener { events: tx })
        .await
        .unwrap();
    assert!(local.local_addr().is_none());

    let client = Client::connect(&ts.addr, ClientOptions::new().server(local.handle()))
        .await
        .unwrap();

    // Notification from the remote handler lands in the local handler.
    let reply = client.call("shout", vec!["ping".into()]).await.unwrap();
    assert_eq!(reply.as_str(), Some("sent"));
    let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap();
    assert_eq!(event.as_deref(), Some("PING"));

    // The remote side can issue a full call over the same connection.
    assert!(wait_until(|| ts.server.connections().len() == 1).await);
    let accepted = ts.server.connections().remove(0);
    let answer = accepted.call("whoami", vec![]).await.unwrap();
    assert_eq!(answer.as_str(), Some("listener"));

    // Outbound connections are not tracked by the bound server.
    assert!(local.connections().is_empty());
}

#[tokio::test]
async fn test_request_to_plain_client_is_rejected() {
    let ts = TestServer::start().await;
    let client = ts.client().await;
    assert!(wait_until(|| ts.server.connections().len() == 1).await);

    let accepted = ts.server.connections().remove(0);
    let err = accepted.call("anything", vec![]).await.unwrap_err();
    assert!(err.to_string().contains("No handler"));
    drop(client);
}

#[tokio::test]
async fn test_tagged_values_cross_the_wire() {
    let ts = TestServer::start_with(point_codec(), None).await;
    let client = Client::connect(&ts.addr, ClientOptions::new().codec(point_codec()))
        .await
        .unwrap();

    let result = client
        .call("shift", vec![Payload::tagged(Point { x: 1, y: 2 })])
        .await
        .unwrap();
    assert_eq!(result.downcast_ref::<Point>(), Some(&Point { x: 2, y: 3 }));
}

#[tokio::test]
async fn test_unregistered_type_is_reported_to_caller() {
    let ts = TestServer::start().await;
    let client = Client::connect(&ts.addr, ClientOptions::new().codec(point_codec()))
        .await
        .unwrap();

    let err = client
        .call("echo", vec![Payload::tagged(Point { x: 1, y: 2 })])
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Remote { .. }));
    assert!(err.to_string().contains("Point"));
    assert_eq!(ts.probe.invocations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_call_async_delivers_reply_to_continuation() {
    let ts = TestServer::start().await;
    let client = ts.client().await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let ok_tx = tx.clone();
    client
        .call_async("add", vec![2.into(), 3.into()], move |mut reply| {
            let _ = ok_tx.send(reply.result().map(|p| p.as_i64()));
        })
        .await
        .unwrap();
    let first = rx.recv().await.unwrap();
    assert_eq!(first.unwrap(), Some(5));

    client
        .call_async("divide", vec![1.into(), 0.into()], move |mut reply| {
            let first = reply.result().is_err();
            let second = reply.value().is_ok();
            let _ = tx.send(Ok(Some(i64::from(first && second))));
        })
        .await
        .unwrap();
    let second = rx.recv().await.unwrap();
    assert_eq!(second.unwrap(), Some(1));
}

#[tokio::test]
async fn test_scoped_client_closes_on_exit() {
    let ts = TestServer::start().await;

    let sum = Client::open(&ts.addr, ClientOptions::new(), |conn| async move {
        conn.call("add", vec![20.into(), 22.into()]).await
    })
    .await
    .unwrap();
    assert_eq!(sum.as_i64(), Some(42));

    assert!(wait_until(|| ts.disconnects.load(Ordering::SeqCst) == 1).await);
}

#[tokio::test]
async fn test_connection_limit_rejects_extra_peers() {
    let ts = TestServer::start_with(Codec::new(), Some(1)).await;
    let _first = ts.client().await;
    assert!(wait_until(|| ts.server.connections().len() == 1).await);

    let mut second = ts.raw().await;
    let mut line = String::new();
    let read = tokio::time::timeout(Duration::from_secs(5), second.read_line(&mut line))
        .await
        .expect("Rejected socket was not closed");
    assert!(matches!(read, Ok(0) | Err(_)));
    assert_eq!(ts.server.connections().len(), 1);
}

#[tokio::test]
async fn test_stop_closes_connections_and_rejects_work() {
    let mut ts = TestServer::start().await;
    let client = ts.client().await;
    client.call("add", vec![1.into(), 2.into()]).await.unwrap();

    ts.server.stop().await;
    assert!(!ts.server.is_started());
    assert!(ts.server.connections().is_empty());
    assert_eq!(ts.disconnects.load(Ordering::SeqCst), 1);

    assert!(wait_until(|| !client.is_open()).await);
    assert!(client.call("add", vec![1.into(), 2.into()]).await.is_err());
}

#[tokio::test]
async fn test_metrics_count_requests() {
    let ts = TestServer::start().await;
    let client = ts.client().await;

    client.call("add", vec![1.into(), 2.into()]).await.unwrap();
    client.call("divide", vec![1.into(), 0.into()]).await.unwrap_err();
    client.call("missing", vec![]).await.unwrap_err();

    let metrics = ts.server.metrics();
    assert_eq!(metrics.total_requests(), 3);
    assert_eq!(metrics.failed_requests(), 2);
    assert_eq!(metrics.accepted(), 1);
    assert_eq!(metrics.active(), 1);
}

#[tokio::test]
async fn test_start_refuses_unusable_delimiter() {
    let mut settings = Settings::default();
    settings.transport.delimiter = String::new();

    let initialized = Arc::new(AtomicBool::new(false));
    let factory_flag = Arc::clone(&initialized);
    let result = Server::builder(&settings)
        .listen("127.0.0.1:0")
        .start(move || {
            factory_flag.store(true, Ordering::SeqCst);
            Calc {
                probe: Arc::new(Probe::default()),
                recorded: Vec::new(),
            }
        })
        .await;

    assert!(matches!(result, Err(RpcError::Config { .. })));
    assert!(!initialized.load(Ordering::SeqCst));

    settings.transport.delimiter = "}}".to_string();
    let result = Server::builder(&settings)
        .no_listen()
        .start(|| Calc {
            probe: Arc::new(Probe::default()),
            recorded: Vec::new(),
        })
        .await;
    assert!(matches!(result, Err(RpcError::Config { .. })));
}
