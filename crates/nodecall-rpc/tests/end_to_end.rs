use std::fs;
use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use nodecall_codec::from_slice;
use nodecall_frame::{encode_frame, DEFAULT_MAX_FRAME_SIZE};
use nodecall_rpc::{
    FunctionRegistry, PeerInfo, RpcConfig, RpcContext, SendFailure, TlsConfig,
};
use rcgen::{
    BasicConstraints, CertificateParams, ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};

const WAIT: Duration = Duration::from_secs(10);

static SEEN: Mutex<Vec<(i32, char, char, char)>> = Mutex::new(Vec::new());
static RETRY_HITS: AtomicUsize = AtomicUsize::new(0);
static CONCURRENT_SEEN: Mutex<Vec<(u8, u32)>> = Mutex::new(Vec::new());
static GIVE_UP_HITS: AtomicUsize = AtomicUsize::new(0);
static BROADCAST_HITS: AtomicUsize = AtomicUsize::new(0);
static RECONNECT_HITS: AtomicUsize = AtomicUsize::new(0);
static TLS_HITS: AtomicUsize = AtomicUsize::new(0);
static RAW_HITS: AtomicUsize = AtomicUsize::new(0);

fn remote_call(id: i32, a: char, b: char, c: char) -> i32 {
    SEEN.lock().expect("seen lock").push((id, a, b, c));
    0
}

fn retry_target(_n: u32) {
    RETRY_HITS.fetch_add(1, Ordering::SeqCst);
}

fn concurrent_target(sender: u8, seq: u32) {
    CONCURRENT_SEEN
        .lock()
        .expect("concurrent lock")
        .push((sender, seq));
}

fn give_up_target() {
    GIVE_UP_HITS.fetch_add(1, Ordering::SeqCst);
}

fn broadcast_target(_from: String) {
    BROADCAST_HITS.fetch_add(1, Ordering::SeqCst);
}

fn reconnect_target() {
    RECONNECT_HITS.fetch_add(1, Ordering::SeqCst);
}

fn tls_target(text: String) -> usize {
    TLS_HITS.fetch_add(1, Ordering::SeqCst);
    text.len()
}

fn raw_target(step: u32) {
    RAW_HITS.fetch_add(step as usize, Ordering::SeqCst);
}

fn free_port_pair() -> u16 {
    for _ in 0..64 {
        let first = TcpListener::bind("127.0.0.1:0").expect("probe bind");
        let port = first.local_addr().expect("probe addr").port();
        if port < u16::MAX && TcpListener::bind(("127.0.0.1", port + 1)).is_ok() {
            return port;
        }
    }
    panic!("no adjacent free ports");
}

fn registry_with<F>(register: F) -> Arc<FunctionRegistry>
where
    F: FnOnce(&FunctionRegistry),
{
    let registry = Arc::new(FunctionRegistry::new());
    register(&registry);
    registry
}

fn context(registry: Arc<FunctionRegistry>) -> RpcContext {
    RpcContext::with_registry(RpcConfig::default(), registry).expect("rpc context")
}

/// A running context listening on an ephemeral port.
fn serving(config: RpcConfig, registry: Arc<FunctionRegistry>) -> (RpcContext, u16) {
    let ctx = RpcContext::with_registry(config, registry).expect("rpc context");
    ctx.async_run().expect("start loop");
    let addr = ctx
        .listen_and_wait("127.0.0.1", 0, WAIT)
        .expect("listen");
    (ctx, addr.port())
}

fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn two_nodes_call_each_other() {
    let port = free_port_pair();
    let register = |registry: &FunctionRegistry| {
        registry
            .register("remote_call", remote_call)
            .expect("register");
    };
    let a = context(registry_with(register));
    let b = context(registry_with(register));

    a.listen("127.0.0.1", port).expect("a listen");
    b.listen("127.0.0.1", port + 1).expect("b listen");
    a.add_node(2, "127.0.0.1", port + 1).expect("a add node");
    b.add_node(1, "127.0.0.1", port).expect("b add node");

    let (reply_tx, reply_rx) = mpsc::channel();
    a.on_reply(move |node, value| {
        let _ = reply_tx.send((node, from_slice::<i32>(value.as_slice())));
    })
    .expect("reply callback");

    a.async_run().expect("a run");
    b.async_run().expect("b run");
    a.connect("127.0.0.1", port + 1).expect("a connect");
    b.connect("127.0.0.1", port).expect("b connect");

    a.call_with_reply(2, &remote_call, (1i32, 'a', 'b', 'c'))
        .expect("call");

    let (node, value) = reply_rx.recv_timeout(WAIT).expect("reply");
    assert_eq!(node, 2);
    assert_eq!(value, Ok(0));
    assert_eq!(*SEEN.lock().expect("seen lock"), vec![(1, 'a', 'b', 'c')]);

    wait_until("b to reach node 1", || {
        b.node(1)
            .expect("query b")
            .is_some_and(|node| node.socket.is_some())
    });

    a.shutdown().expect("a shutdown");
    b.shutdown().expect("b shutdown");
    let stats = a.wait().expect("a stopped");
    assert_eq!(stats.replies_received, 1);
    let stats = b.wait().expect("b stopped");
    assert_eq!(stats.dispatched, 1);
    assert_eq!(stats.replies_sent, 1);
}

#[test]
fn call_to_unconnected_node_connects_once() {
    let register = |registry: &FunctionRegistry| {
        registry
            .register("retry_target", retry_target)
            .expect("register");
    };
    let (callee, port) = serving(RpcConfig::default(), registry_with(register));
    let caller = context(registry_with(register));
    caller.add_node(2, "127.0.0.1", port).expect("add node");
    caller.async_run().expect("caller run");

    for n in 0..3u32 {
        caller.call_fn(2, &retry_target, (n,)).expect("call");
    }

    wait_until("three deliveries", || RETRY_HITS.load(Ordering::SeqCst) == 3);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(RETRY_HITS.load(Ordering::SeqCst), 3);

    let stats = caller.stats().expect("stats");
    assert_eq!(stats.connects, 1);
    assert_eq!(stats.calls_sent, 3);
    assert!(caller
        .node(2)
        .expect("query")
        .is_some_and(|node| node.socket.is_some() && !node.connecting));
    drop(callee);
}

#[test]
fn concurrent_senders_dispatch_each_call_once() {
    let register = |registry: &FunctionRegistry| {
        registry
            .register("concurrent_target", concurrent_target)
            .expect("register");
    };
    let (_callee, port) = serving(RpcConfig::default(), registry_with(register));
    let caller = Arc::new(context(registry_with(register)));
    caller.add_node(2, "127.0.0.1", port).expect("add node");
    caller.async_run().expect("caller run");

    let senders: Vec<_> = (0..4u8)
        .map(|sender| {
            let caller = Arc::clone(&caller);
            thread::spawn(move || {
                for seq in 0..50u32 {
                    caller
                        .call_fn(2, &concurrent_target, (sender, seq))
                        .expect("call");
                }
            })
        })
        .collect();
    for sender in senders {
        sender.join().expect("sender thread");
    }

    wait_until("all calls", || {
        CONCURRENT_SEEN.lock().expect("concurrent lock").len() >= 200
    });
    thread::sleep(Duration::from_millis(50));

    let mut seen = CONCURRENT_SEEN.lock().expect("concurrent lock").clone();
    assert_eq!(seen.len(), 200);
    seen.sort_unstable();
    seen.dedup();
    assert_eq!(seen.len(), 200);
}

#[test]
fn unreachable_node_gives_up_after_bounded_attempts() {
    let port = {
        let probe = TcpListener::bind("127.0.0.1:0").expect("probe bind");
        probe.local_addr().expect("probe addr").port()
    };
    let config = RpcConfig {
        retry_defer: 1,
        max_send_attempts: 3,
        ..RpcConfig::default()
    };
    let registry = registry_with(|registry| {
        registry
            .register("give_up_target", give_up_target)
            .expect("register");
    });
    let caller = RpcContext::with_registry(config, registry).expect("rpc context");
    let (tx, rx) = mpsc::channel();
    caller
        .on_send_failed(move |node, failure| {
            let _ = tx.send((node, failure.clone()));
        })
        .expect("failure callback");
    caller.add_node(5, "127.0.0.1", port).expect("add node");
    caller.async_run().expect("caller run");

    caller.call_fn(5, &give_up_target, ()).expect("call");
    let (node, failure) = rx.recv_timeout(WAIT).expect("give up");
    assert_eq!(node, 5);
    assert_eq!(failure, SendFailure::RetriesExhausted { attempts: 3 });
    assert_eq!(GIVE_UP_HITS.load(Ordering::SeqCst), 0);
}

#[test]
fn node_zero_broadcasts_to_every_connection() {
    let register = |registry: &FunctionRegistry| {
        registry
            .register("broadcast_target", broadcast_target)
            .expect("register");
    };
    let (_first, first_port) = serving(RpcConfig::default(), registry_with(register));
    let (_second, second_port) = serving(RpcConfig::default(), registry_with(register));
    let caller = context(registry_with(register));
    caller.add_node(2, "127.0.0.1", first_port).expect("add node");
    caller.add_node(3, "127.0.0.1", second_port).expect("add node");
    caller.async_run().expect("caller run");

    caller
        .call_fn(2, &broadcast_target, ("direct".to_string(),))
        .expect("call 2");
    caller
        .call_fn(3, &broadcast_target, ("direct".to_string(),))
        .expect("call 3");
    wait_until("direct calls", || BROADCAST_HITS.load(Ordering::SeqCst) == 2);

    caller
        .call_fn(0, &broadcast_target, ("everyone".to_string(),))
        .expect("broadcast");
    wait_until("broadcast", || BROADCAST_HITS.load(Ordering::SeqCst) == 4);
    assert_eq!(caller.stats().expect("stats").broadcast_sends, 2);
}

#[test]
fn disconnect_then_call_reconnects() {
    let register = |registry: &FunctionRegistry| {
        registry
            .register("reconnect_target", reconnect_target)
            .expect("register");
    };
    let (_callee, port) = serving(RpcConfig::default(), registry_with(register));
    let caller = context(registry_with(register));
    let (closed_tx, closed_rx) = mpsc::channel::<PeerInfo>();
    caller
        .on_close(move |peer| {
            let _ = closed_tx.send(peer.clone());
        })
        .expect("close callback");
    caller.add_node(2, "127.0.0.1", port).expect("add node");
    caller.async_run().expect("caller run");

    caller.call_fn(2, &reconnect_target, ()).expect("first call");
    wait_until("first call", || RECONNECT_HITS.load(Ordering::SeqCst) == 1);

    caller.disconnect(2).expect("disconnect");
    let closed = closed_rx.recv_timeout(WAIT).expect("close callback");
    assert_eq!(closed.node, 2);
    assert_ne!(closed.connection, 0);
    assert!(closed.is_client);

    caller.call_fn(2, &reconnect_target, ()).expect("second call");
    wait_until("second call", || RECONNECT_HITS.load(Ordering::SeqCst) == 2);
    assert_eq!(caller.stats().expect("stats").connects, 2);
}

struct PkiDir(PathBuf);

impl PkiDir {
    fn mint(name: &str) -> Self {
        let dir = std::env::temp_dir().join(format!("nodecall-{name}-{}", std::process::id()));
        fs::create_dir_all(&dir).expect("pki dir");

        let mut ca_params = CertificateParams::new(Vec::<String>::new()).expect("ca params");
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let ca_key = KeyPair::generate().expect("ca key");
        let ca_cert = ca_params.self_signed(&ca_key).expect("ca cert");

        let mut leaf_params =
            CertificateParams::new(vec!["localhost".to_string(), "127.0.0.1".to_string()])
                .expect("leaf params");
        leaf_params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        let leaf_key = KeyPair::generate().expect("leaf key");
        let leaf_cert = leaf_params
            .signed_by(&leaf_key, &ca_cert, &ca_key)
            .expect("leaf cert");

        fs::write(dir.join("ca.pem"), ca_cert.pem()).expect("write ca");
        fs::write(dir.join("node.pem"), leaf_cert.pem()).expect("write cert");
        fs::write(dir.join("node.key"), leaf_key.serialize_pem()).expect("write key");
        Self(dir)
    }

    fn tls(&self) -> TlsConfig {
        TlsConfig::new(self.0.join("node.pem"), self.0.join("node.key"))
            .with_ca_file(self.0.join("ca.pem"))
    }
}

impl Drop for PkiDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.0);
    }
}

#[test]
fn calls_over_mutual_tls() {
    let pki = PkiDir::mint("mutual-tls");
    let mut config = RpcConfig::default();
    config.context.tls = Some(pki.tls());

    let register = |registry: &FunctionRegistry| {
        registry.register("tls_target", tls_target).expect("register");
    };
    let (_callee, port) = serving(config.clone(), registry_with(register));
    let caller =
        RpcContext::with_registry(config, registry_with(register)).expect("rpc context");
    let (reply_tx, reply_rx) = mpsc::channel();
    caller
        .on_reply(move |node, value| {
            let _ = reply_tx.send((node, from_slice::<usize>(value.as_slice())));
        })
        .expect("reply callback");
    caller.add_node(2, "127.0.0.1", port).expect("add node");
    caller.async_run().expect("caller run");

    caller
        .call_with_reply(2, &tls_target, ("sealed".to_string(),))
        .expect("call");
    let (node, value) = reply_rx.recv_timeout(WAIT).expect("reply");
    assert_eq!(node, 2);
    assert_eq!(value, Ok(6));
    assert_eq!(TLS_HITS.load(Ordering::SeqCst), 1);
}

#[test]
fn malformed_frames_are_counted_and_keep_the_connection() {
    let register = |registry: &FunctionRegistry| {
        registry.register("raw_target", raw_target).expect("register");
    };
    let (callee, port) = serving(RpcConfig::default(), registry_with(register));
    let (closed_tx, closed_rx) = mpsc::channel();
    callee
        .on_close(move |peer: &PeerInfo| {
            let _ = closed_tx.send(peer.node);
        })
        .expect("close callback");

    let max = DEFAULT_MAX_FRAME_SIZE;
    let mut frames = BytesMut::new();
    // No function has ID 99.
    encode_frame(&99u32.to_le_bytes(), max, &mut frames).expect("frame");
    // raw_target wants a u32 and gets two bytes.
    encode_frame(&[1, 0, 0, 0, 7, 0], max, &mut frames).expect("frame");
    // Shorter than a function ID.
    encode_frame(&[1, 0], max, &mut frames).expect("frame");
    let mut call = 1u32.to_le_bytes().to_vec();
    call.extend_from_slice(&5u32.to_le_bytes());
    encode_frame(&call, max, &mut frames).expect("frame");

    let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    stream.write_all(&frames).expect("write frames");

    wait_until("the well-formed call", || RAW_HITS.load(Ordering::SeqCst) == 5);
    let stats = callee.stats().expect("stats");
    assert_eq!(stats.dispatch_errors, 3);
    assert_eq!(stats.dispatched, 1);
    assert!(closed_rx.try_recv().is_err());
    drop(stream);
}
