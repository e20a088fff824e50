//! Live end-to-end capture over localhost: handshake, protocol mismatch,
//! nested ops and name resolution.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::{Duration, Instant};

use rinspect::client;
use rinspect::protocol::{HANDSHAKE_SHIBBOLETH, PROTOCOL_VERSION};
use rinspect::{
    install_inspector, uninstall_inspector, HandshakeStatus, InspectorConfig, ScopedOp, Worker,
};

const TEST_PORT: u16 = 18186;

fn wait_for<T>(what: &str, timeout: Duration, mut poll: impl FnMut() -> Option<T>) -> T {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = poll() {
            return value;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

// One test drives the whole lifecycle: the inspector instance is
// process-wide, so scenarios share a single install/uninstall pair.
#[test]
fn live_session_end_to_end() {
    install_inspector(InspectorConfig {
        program_name: Some("session-test".into()),
        data_port: TEST_PORT,
        broadcast: false,
        send_buffer: None,
    })
    .unwrap();

    let port = wait_for("listen port", Duration::from_secs(5), client::listen_port);

    // A viewer speaking a newer protocol gets an explicit mismatch status
    // and the producer returns to advertising.
    {
        let mut sock = TcpStream::connect(("127.0.0.1", port)).unwrap();
        sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        sock.write_all(HANDSHAKE_SHIBBOLETH).unwrap();
        sock.write_all(&(PROTOCOL_VERSION + 1).to_le_bytes()).unwrap();
        let mut status = [0u8; 1];
        sock.read_exact(&mut status).unwrap();
        assert_eq!(status[0], HandshakeStatus::ProtocolMismatch as u8);
    }

    // the same port accepts a well-behaved viewer right after
    let worker = Worker::connect("127.0.0.1", port).unwrap();
    let status = wait_for("handshake", Duration::from_secs(5), || worker.handshake());
    assert_eq!(status, HandshakeStatus::Welcome);
    wait_for("session", Duration::from_secs(5), || worker.is_connected().then_some(()));

    // nested ops with an attribute on the inner one, then a frame mark
    {
        let _outer = ScopedOp::new(1);
        {
            let _inner = ScopedOp::new(2);
            client::send_attribute_float("radius", 2.5);
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(Duration::from_millis(1));
    }
    client::send_frame_mark();

    wait_for("ops and frame", Duration::from_secs(10), || {
        let ctx = worker.context();
        (ctx.op_tasks.len() == 2
            && ctx.op_tasks.iter().all(|op| op.end >= 0)
            && ctx.frame_count() >= 2)
            .then_some(())
    });

    {
        let ctx = worker.context();
        // the init placeholder from the welcome plus our mark
        assert_eq!(ctx.frame_count(), 2);
        let outer = ctx.op_tasks[0];
        let inner = ctx.op_tasks[1];
        assert_eq!(outer.kind, 1);
        assert_eq!(inner.kind, 2);
        assert!(outer.start <= inner.start, "{outer:?} {inner:?}");
        assert!(inner.start <= inner.end);
        assert!(inner.end <= outer.end);
        assert_eq!(ctx.op_childs.get(&0), Some(&vec![1]));
        // all times are offsets from the session base time
        assert!(outer.start >= 0);
        let mark = ctx.frame_data.frames[1];
        assert!(mark.start >= outer.end);
        // the attribute landed on the inner op
        assert_eq!(ctx.properties[&1].summary.len(), 1);
    }

    // the "radius" handle resolves through a server query round trip
    wait_for("name resolution", Duration::from_secs(10), || {
        let ctx = worker.context();
        ctx.name_map.values().any(|name| name == "radius").then_some(())
    });

    worker.shutdown();
    drop(worker);
    uninstall_inspector();
}
