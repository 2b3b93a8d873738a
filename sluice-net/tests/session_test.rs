use std::net::UdpSocket;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use sluice_net::{new_block_crypt, stretch_key, Listener, NetError, Session, SessionConfig};

fn fast_config(crypt: &str, ds: usize, ps: usize) -> SessionConfig {
    let key = stretch_key("it's a secret");
    SessionConfig {
        data_shards: ds,
        parity_shards: ps,
        block: new_block_crypt(crypt, &key).unwrap(),
        snd_wnd: 128,
        rcv_wnd: 128,
        nodelay: true,
        interval: 10,
        resend: 2,
        nc: true,
        ..Default::default()
    }
}

#[test]
fn echo_short_message() {
    let cfg = fast_config("aes", 10, 3);
    let listener = Listener::bind("127.0.0.1:0", &cfg).unwrap();
    let addr = listener.local_addr().unwrap();

    let echo = thread::spawn(move || {
        let sess = listener.accept().unwrap();
        let mut buf = [0u8; 256];
        let n = sess.read(&mut buf).unwrap();
        sess.write(&buf[..n]).unwrap();
        // Hold the session open until the peer has read the echo.
        thread::sleep(Duration::from_millis(500));
    });

    let client = Session::dial(&addr.to_string(), &cfg).unwrap();
    client.write(b"hello\n").unwrap();

    client.set_read_deadline(Some(Instant::now() + Duration::from_secs(1)));
    let mut buf = [0u8; 256];
    let n = client.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"hello\n");

    client.close().unwrap();
    echo.join().unwrap();
}

#[test]
fn zero_byte_write_is_a_noop() {
    let cfg = fast_config("null", 0, 0);
    let listener = Listener::bind("127.0.0.1:0", &cfg).unwrap();
    let addr = listener.local_addr().unwrap();
    let client = Session::dial(&addr.to_string(), &cfg).unwrap();
    assert_eq!(client.write(b"").unwrap(), 0);
    client.close().unwrap();
}

#[test]
fn read_deadline_returns_timeout() {
    let cfg = fast_config("none", 0, 0);
    let listener = Listener::bind("127.0.0.1:0", &cfg).unwrap();
    let addr = listener.local_addr().unwrap();
    let client = Session::dial(&addr.to_string(), &cfg).unwrap();

    client.set_read_deadline(Some(Instant::now() + Duration::from_millis(100)));
    let mut buf = [0u8; 16];
    let start = Instant::now();
    match client.read(&mut buf) {
        Err(NetError::Timeout) => {}
        other => panic!("expected timeout, got {other:?}"),
    }
    assert!(start.elapsed() < Duration::from_secs(2));
    client.close().unwrap();
}

#[test]
fn close_releases_blocked_readers() {
    let cfg = fast_config("null", 0, 0);
    let listener = Listener::bind("127.0.0.1:0", &cfg).unwrap();
    let addr = listener.local_addr().unwrap();
    let client = Session::dial(&addr.to_string(), &cfg).unwrap();

    let reader = client.clone();
    let handle = thread::spawn(move || {
        let mut buf = [0u8; 16];
        reader.read(&mut buf)
    });
    thread::sleep(Duration::from_millis(100));
    client.close().unwrap();
    match handle.join().unwrap() {
        Err(NetError::ClosedPipe) => {}
        other => panic!("expected closed pipe, got {other:?}"),
    }
}

#[test]
fn accepted_session_refuses_socket_options() {
    let cfg = fast_config("null", 0, 0);
    let listener = Listener::bind("127.0.0.1:0", &cfg).unwrap();
    let addr = listener.local_addr().unwrap();
    let client = Session::dial(&addr.to_string(), &cfg).unwrap();
    client.write(b"x").unwrap();

    let accepted = listener.accept().unwrap();
    assert!(matches!(
        accepted.set_dscp(46),
        Err(NetError::InvalidOperation)
    ));
    assert!(client.set_dscp(46).is_ok());
    client.close().unwrap();
}

/// UDP forwarding proxy with deterministic random loss in both directions.
fn lossy_proxy(upstream: std::net::SocketAddr, loss_percent: u32, seed: u64) -> std::net::SocketAddr {
    use parking_lot::Mutex;

    let front = Arc::new(UdpSocket::bind("127.0.0.1:0").unwrap());
    let front_addr = front.local_addr().unwrap();
    let back = Arc::new(UdpSocket::bind("127.0.0.1:0").unwrap());
    let client: Arc<Mutex<Option<std::net::SocketAddr>>> = Arc::new(Mutex::new(None));

    front.set_read_timeout(Some(Duration::from_secs(60))).unwrap();
    back.set_read_timeout(Some(Duration::from_secs(60))).unwrap();

    {
        let (front, back, client) = (front.clone(), back.clone(), client.clone());
        thread::spawn(move || {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut buf = [0u8; 2048];
            while let Ok((n, from)) = front.recv_from(&mut buf) {
                *client.lock() = Some(from);
                if rng.gen_range(0..100) >= loss_percent {
                    let _ = back.send_to(&buf[..n], upstream);
                }
            }
        });
    }
    thread::spawn(move || {
        let mut rng = StdRng::seed_from_u64(seed ^ 1);
        let mut buf = [0u8; 2048];
        while let Ok((n, _)) = back.recv_from(&mut buf) {
            let dst = *client.lock();
            if let Some(dst) = dst {
                if rng.gen_range(0..100) >= loss_percent {
                    let _ = front.send_to(&buf[..n], dst);
                }
            }
        }
    });
    front_addr
}

#[test]
fn one_mebibyte_survives_twenty_percent_loss() {
    let cfg = fast_config("aes", 10, 3);
    let listener = Listener::bind("127.0.0.1:0", &cfg).unwrap();
    let addr = listener.local_addr().unwrap();
    let proxy = lossy_proxy(addr, 20, 0xBADC0FFE);

    const TOTAL: usize = 1024 * 1024;
    let payload: Vec<u8> = (0..TOTAL).map(|i| (i * 7 % 251) as u8).collect();
    let expect = payload.clone();

    let server = thread::spawn(move || {
        let sess = listener.accept().unwrap();
        sess.set_read_deadline(Some(Instant::now() + Duration::from_secs(45)));
        let mut got = Vec::with_capacity(TOTAL);
        let mut buf = vec![0u8; 64 * 1024];
        while got.len() < TOTAL {
            let n = sess.read(&mut buf).expect("read under loss");
            got.extend_from_slice(&buf[..n]);
        }
        got
    });

    let client = Session::dial(&proxy.to_string(), &cfg).unwrap();
    for chunk in payload.chunks(16 * 1024) {
        client.write(chunk).unwrap();
    }

    let got = server.join().unwrap();
    assert_eq!(got.len(), TOTAL);
    assert_eq!(got, expect);
    client.close().unwrap();
}

#[test]
fn new_conversation_replaces_old_session() {
    let cfg = fast_config("null", 0, 0);
    let listener = Listener::bind("127.0.0.1:0", &cfg).unwrap();
    let addr = listener.local_addr().unwrap();

    // Both conversations come from the same local socket so the listener
    // sees one remote address with two convs.
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.connect(addr).unwrap();

    // First conversation: PUSH with sn=0, conv=1.
    let seg1 = raw_push_segment(1, 0, b"one");
    socket.send(&seg1).unwrap();
    let first = listener.accept().unwrap();
    assert_eq!(first.conv(), 1);

    // Fresh conversation id with sn=0 from the same remote: replace.
    let seg2 = raw_push_segment(2, 0, b"two");
    socket.send(&seg2).unwrap();
    let second = listener.accept().unwrap();
    assert_eq!(second.conv(), 2);

    // The replaced session observes ClosedPipe.
    first.set_read_deadline(Some(Instant::now() + Duration::from_secs(2)));
    let mut buf = [0u8; 16];
    loop {
        match first.read(&mut buf) {
            Err(NetError::ClosedPipe) => break,
            Err(e) => panic!("expected closed pipe, got {e}"),
            Ok(_) => continue,
        }
    }
}

/// Hand-built PUSH segment for driving the listener directly.
fn raw_push_segment(conv: u32, sn: u32, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&conv.to_le_bytes());
    out.push(81); // PUSH
    out.push(0); // frg
    out.extend_from_slice(&32u16.to_le_bytes()); // wnd
    out.extend_from_slice(&0u32.to_le_bytes()); // ts
    out.extend_from_slice(&sn.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // una
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);
    out
}

#[test]
fn dup_knob_multiplies_outbound_packets() {
    let cfg = fast_config("null", 0, 0);
    let listener = Listener::bind("127.0.0.1:0", &cfg).unwrap();
    let addr = listener.local_addr().unwrap();

    let client = Session::dial(&addr.to_string(), &cfg).unwrap();
    client.set_dup(1);
    client.write(b"dup me").unwrap();

    let accepted = listener.accept().unwrap();
    let mut buf = [0u8; 64];
    let n = accepted.read(&mut buf).unwrap();
    // Duplicates are absorbed by the ARQ dedup; payload arrives once.
    assert_eq!(&buf[..n], b"dup me");
    client.close().unwrap();
}

#[test]
fn arc_session_is_shareable_across_threads() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<Arc<Session>>();
    assert_send_sync::<Listener>();
}
