use std::io::Write;
use std::net::SocketAddr;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use nodecall_codec::Buffer;
use nodecall_net::{
    CloseReason, ContextConfig, ContextId, Event, EventOutcome, Handler, Loop, LoopHandle,
    LoopState, Net, NetError, OpenInfo, Queued, SocketId,
};

const WAIT: Duration = Duration::from_secs(10);

#[derive(Debug)]
enum Seen {
    Open(OpenInfo),
    Message(SocketId, Vec<u8>),
    Closed(SocketId, String),
    ConnectFailed(Option<u64>),
}

struct Recorder {
    seen: mpsc::Sender<Seen>,
    echo: bool,
}

impl Handler for Recorder {
    fn on_open(&mut self, _net: &mut Net<Self>, info: &OpenInfo) {
        let _ = self.seen.send(Seen::Open(info.clone()));
    }

    fn on_message(&mut self, net: &mut Net<Self>, socket: SocketId, message: Buffer) {
        let bytes = message.as_slice().to_vec();
        if self.echo {
            net.send(socket, message).expect("echo should queue");
        }
        let _ = self.seen.send(Seen::Message(socket, bytes));
    }

    fn on_close(&mut self, _net: &mut Net<Self>, socket: SocketId, reason: &CloseReason) {
        let _ = self.seen.send(Seen::Closed(socket, reason.to_string()));
    }

    fn on_connect_failed(&mut self, _net: &mut Net<Self>, failure: &nodecall_net::ConnectFailure) {
        let _ = self.seen.send(Seen::ConnectFailed(failure.tag));
    }
}

struct Running {
    handle: LoopHandle<Recorder>,
    context: ContextId,
    seen: mpsc::Receiver<Seen>,
    thread: thread::JoinHandle<nodecall_net::Result<Recorder>>,
}

fn start(echo: bool, config: ContextConfig) -> Running {
    let (tx, seen) = mpsc::channel();
    let mut event_loop = Loop::new(Recorder { seen: tx, echo });
    let context = event_loop
        .add_context(config)
        .expect("context should be created");
    let handle = event_loop.handle();
    let thread = thread::spawn(move || event_loop.run());
    Running {
        handle,
        context,
        seen,
        thread,
    }
}

fn listen(running: &Running) -> SocketAddr {
    let (tx, rx) = mpsc::channel();
    let queued = Queued::new(Event::ListenStart {
        context: running.context,
        host: "127.0.0.1".to_string(),
        port: 0,
    })
    .then(move |_, _, outcome| {
        let _ = tx.send(outcome);
    });
    running.handle.push_queued(queued).expect("push listen");
    match rx.recv_timeout(WAIT).expect("listen outcome") {
        EventOutcome::Listening { addr, .. } => addr,
        other => panic!("unexpected listen outcome: {other:?}"),
    }
}

fn next(seen: &mpsc::Receiver<Seen>) -> Seen {
    seen.recv_timeout(WAIT).expect("event should arrive")
}

fn stop(running: Running) -> Recorder {
    running.handle.stop().expect("stop should queue");
    running
        .thread
        .join()
        .expect("loop thread")
        .expect("loop should stop cleanly")
}

fn raw_frame(payload: &[u8]) -> Vec<u8> {
    let mut wire = (payload.len() as u32).to_le_bytes().to_vec();
    wire.extend_from_slice(payload);
    wire
}

#[test]
fn loop_to_loop_echo() {
    let server = start(true, ContextConfig::default());
    let addr = listen(&server);

    let client = start(false, ContextConfig::default());
    client
        .handle
        .connect(client.context, "127.0.0.1", addr.port(), Some(7))
        .expect("push connect");

    let socket = match next(&client.seen) {
        Seen::Open(info) => {
            assert!(info.is_client);
            assert_eq!(info.tag, Some(7));
            assert_eq!(info.peer_addr, addr);
            info.socket
        }
        other => panic!("expected open, got {other:?}"),
    };
    assert!(matches!(next(&server.seen), Seen::Open(info) if !info.is_client));

    client
        .handle
        .send(socket, Buffer::from(&b"ping"[..]))
        .expect("push send");

    assert!(matches!(next(&server.seen), Seen::Message(_, bytes) if bytes == b"ping"));
    assert!(matches!(next(&client.seen), Seen::Message(s, bytes) if s == socket && bytes == b"ping"));

    stop(client);
    stop(server);
}

#[test]
fn frame_split_across_writes_is_delivered_once() {
    let server = start(false, ContextConfig::default());
    let addr = listen(&server);

    let mut raw = std::net::TcpStream::connect(addr).expect("raw connect");
    raw.set_nodelay(true).expect("nodelay");
    assert!(matches!(next(&server.seen), Seen::Open(_)));

    let wire = raw_frame(b"reassembled from many writes");
    for chunk in wire.chunks(3) {
        raw.write_all(chunk).expect("raw write");
        raw.flush().expect("raw flush");
        thread::sleep(Duration::from_millis(2));
    }
    // Two frames in one write.
    let mut pair = raw_frame(b"a");
    pair.extend(raw_frame(b""));
    raw.write_all(&pair).expect("raw write pair");

    assert!(
        matches!(next(&server.seen), Seen::Message(_, bytes) if bytes == b"reassembled from many writes")
    );
    assert!(matches!(next(&server.seen), Seen::Message(_, bytes) if bytes == b"a"));
    assert!(matches!(next(&server.seen), Seen::Message(_, bytes) if bytes.is_empty()));

    drop(raw);
    assert!(matches!(next(&server.seen), Seen::Closed(_, reason) if reason == "closed by peer"));
    stop(server);
}

#[test]
fn oversized_frame_closes_socket() {
    let mut config = ContextConfig::default();
    config.frame.max_frame_size = 16;
    let server = start(false, config);
    let addr = listen(&server);

    let mut raw = std::net::TcpStream::connect(addr).expect("raw connect");
    assert!(matches!(next(&server.seen), Seen::Open(_)));
    raw.write_all(&raw_frame(&[0u8; 17])).expect("raw write");

    match next(&server.seen) {
        Seen::Closed(_, reason) => assert!(reason.starts_with("protocol error"), "{reason}"),
        other => panic!("expected close, got {other:?}"),
    }
    stop(server);
}

#[test]
fn connect_failure_reports_tag() {
    let port = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").expect("probe bind");
        probe.local_addr().expect("probe addr").port()
    };
    let client = start(false, ContextConfig::default());
    client
        .handle
        .connect(client.context, "127.0.0.1", port, Some(42))
        .expect("push connect");
    assert!(matches!(next(&client.seen), Seen::ConnectFailed(Some(42))));
    stop(client);
}

#[test]
fn deferred_event_waits_for_passes() {
    let running = start(false, ContextConfig::default());
    let (tx, rx) = mpsc::channel();

    let start_tx = tx.clone();
    running
        .handle
        .custom(move |_, net| {
            let _ = start_tx.send(net.passes());
        })
        .expect("push custom");
    let first = rx.recv_timeout(WAIT).expect("first pass");

    running
        .handle
        .push_deferred(
            Event::Custom(Box::new(move |_: &mut Recorder, net: &mut Net<Recorder>| {
                let _ = tx.send(net.passes());
            })),
            3,
        )
        .expect("push deferred");
    let executed = rx.recv_timeout(WAIT).expect("deferred pass");
    assert!(executed >= first + 4, "ran at pass {executed}, queued after {first}");
    stop(running);
}

#[test]
fn stop_drops_parked_events() {
    let running = start(false, ContextConfig::default());
    let (tx, rx) = mpsc::channel();

    let queued = Queued::new(Event::Custom(Box::new(
        |_: &mut Recorder, _: &mut Net<Recorder>| panic!("must not run"),
    )))
        .deferred(u32::MAX)
        .then(move |_, _, outcome| {
            let _ = tx.send(matches!(outcome, EventOutcome::Dropped));
        });
    running.handle.push_queued(queued).expect("push parked");

    let handle = running.handle.clone();
    stop(running);
    assert_eq!(rx.recv_timeout(WAIT), Ok(true));
    assert_eq!(handle.state(), LoopState::Stopped);
    assert!(matches!(handle.stop(), Err(NetError::LoopClosed)));
}

#[test]
fn send_to_unknown_socket_fails() {
    let running = start(false, ContextConfig::default());
    let (tx, rx) = mpsc::channel();
    let queued = Queued::new(Event::Send {
        socket: SocketId::from_raw(999),
        payload: Buffer::from(&b"lost"[..]),
    })
    .then(move |_, _, outcome| {
        let _ = tx.send(matches!(
            outcome,
            EventOutcome::Failed(NetError::UnknownSocket(id)) if id == SocketId::from_raw(999)
        ));
    });
    running.handle.push_queued(queued).expect("push send");
    assert_eq!(rx.recv_timeout(WAIT), Ok(true));
    stop(running);
}

#[test]
fn second_loop_on_same_thread_is_rejected() {
    let running = start(false, ContextConfig::default());
    let (tx, rx) = mpsc::channel();
    running
        .handle
        .custom(move |_, _| {
            let (nested_tx, _nested_rx) = mpsc::channel();
            let nested = Loop::new(Recorder {
                seen: nested_tx,
                echo: false,
            });
            let _ = tx.send(matches!(nested.run(), Err(NetError::LoopAlreadyRunning)));
        })
        .expect("push custom");
    assert_eq!(rx.recv_timeout(WAIT), Ok(true));
    stop(running);
}

#[test]
fn broadcast_reaches_every_socket() {
    let server = start(false, ContextConfig::default());
    let addr = listen(&server);

    let mut peers = Vec::new();
    for _ in 0..3 {
        let raw = std::net::TcpStream::connect(addr).expect("raw connect");
        raw.set_read_timeout(Some(WAIT)).expect("read timeout");
        assert!(matches!(next(&server.seen), Seen::Open(_)));
        peers.push(raw);
    }

    let (tx, rx) = mpsc::channel();
    let queued = Queued::new(Event::BroadcastContext {
        context: server.context,
        payload: Buffer::from(&b"all"[..]),
    })
    .then(move |_, _, outcome| {
        let _ = tx.send(matches!(outcome, EventOutcome::Broadcast(3)));
    });
    server.handle.push_queued(queued).expect("push broadcast");
    assert_eq!(rx.recv_timeout(WAIT), Ok(true));

    for peer in &mut peers {
        let mut frame = [0u8; 7];
        std::io::Read::read_exact(peer, &mut frame).expect("broadcast frame");
        assert_eq!(&frame, &[3, 0, 0, 0, b'a', b'l', b'l']);
    }
    stop(server);
}
