use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

use sluice_mux::{pipe, Conn, MuxConfig, MuxSession, SnappyConn};

/// In-memory byte-stream endpoint; a pair of these forms a duplex pipe.
struct MemEnd {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    leftover: Mutex<(Vec<u8>, usize)>,
    die_rx: Receiver<()>,
    die_tx: Arc<Mutex<Option<Sender<()>>>>,
    closed: AtomicBool,
}

fn mem_pair() -> (Arc<MemEnd>, Arc<MemEnd>) {
    let (a_tx, b_rx) = bounded::<Vec<u8>>(1024);
    let (b_tx, a_rx) = bounded::<Vec<u8>>(1024);
    let (die_tx, die_rx) = bounded::<()>(0);
    let die_tx = Arc::new(Mutex::new(Some(die_tx)));
    let a = Arc::new(MemEnd {
        tx: a_tx,
        rx: a_rx,
        leftover: Mutex::new((Vec::new(), 0)),
        die_rx: die_rx.clone(),
        die_tx: die_tx.clone(),
        closed: AtomicBool::new(false),
    });
    let b = Arc::new(MemEnd {
        tx: b_tx,
        rx: b_rx,
        leftover: Mutex::new((Vec::new(), 0)),
        die_rx,
        die_tx,
        closed: AtomicBool::new(false),
    });
    (a, b)
}

impl Conn for MemEnd {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        {
            let mut left = self.leftover.lock();
            if left.1 < left.0.len() {
                let n = buf.len().min(left.0.len() - left.1);
                buf[..n].copy_from_slice(&left.0[left.1..left.1 + n]);
                left.1 += n;
                return Ok(n);
            }
        }
        let chunk = crossbeam_channel::select! {
            recv(self.rx) -> c => match c {
                Ok(c) => c,
                Err(_) => return Ok(0),
            },
            recv(self.die_rx) -> _ => return Ok(0),
        };
        let n = buf.len().min(chunk.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
            *self.leftover.lock() = (chunk, n);
        }
        Ok(n)
    }

    fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::ErrorKind::BrokenPipe.into())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.die_tx.lock().take();
    }
}

fn quick_config(version: u8) -> MuxConfig {
    MuxConfig {
        version,
        keep_alive_interval: Duration::from_millis(100),
        keep_alive_timeout: Duration::from_millis(300),
        ..Default::default()
    }
}

#[test]
fn open_accept_echo() {
    let (a, b) = mem_pair();
    let client = MuxSession::client(a, quick_config(1)).unwrap();
    let server = MuxSession::server(b, quick_config(1)).unwrap();

    let srv = thread::spawn(move || {
        let stream = server.accept_stream().unwrap();
        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).unwrap();
        stream.write(&buf[..n]).unwrap();
        server
    });

    let stream = client.open_stream().unwrap();
    stream.write(b"hello mux").unwrap();
    let mut buf = [0u8; 64];
    let n = stream.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"hello mux");

    let server = srv.join().unwrap();
    client.close();
    server.close();
}

#[test]
fn sid_parity_by_role() {
    let (a, b) = mem_pair();
    let client = MuxSession::client(a, quick_config(1)).unwrap();
    let server = MuxSession::server(b, quick_config(1)).unwrap();

    let s1 = client.open_stream().unwrap();
    let s2 = client.open_stream().unwrap();
    assert_eq!(s1.sid() % 2, 1);
    assert_eq!(s2.sid() % 2, 1);
    assert!(s2.sid() > s1.sid());

    let t1 = server.open_stream().unwrap();
    assert_eq!(t1.sid() % 2, 0);

    client.close();
    server.close();
}

#[test]
fn fin_drains_then_eof() {
    let (a, b) = mem_pair();
    let client = MuxSession::client(a, quick_config(1)).unwrap();
    let server = MuxSession::server(b, quick_config(1)).unwrap();

    let stream = client.open_stream().unwrap();
    stream.write(b"last").unwrap();
    stream.close();

    let accepted = server.accept_stream().unwrap();
    let mut buf = [0u8; 16];
    let n = accepted.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"last");
    assert_eq!(accepted.read(&mut buf).unwrap(), 0);

    client.close();
    server.close();
}

#[test]
fn v2_window_updates_allow_large_transfer() {
    let mut cfg = quick_config(2);
    cfg.max_stream_buffer = 4096;
    cfg.max_frame_size = 1024;

    let (a, b) = mem_pair();
    let client = MuxSession::client(a, cfg.clone()).unwrap();
    let server = MuxSession::server(b, cfg).unwrap();

    const TOTAL: usize = 256 * 1024;
    let payload: Vec<u8> = (0..TOTAL).map(|i| (i % 251) as u8).collect();
    let expect = payload.clone();

    let srv = thread::spawn(move || {
        let stream = server.accept_stream().unwrap();
        let mut got = Vec::with_capacity(TOTAL);
        let mut buf = [0u8; 8192];
        while got.len() < TOTAL {
            let n = stream.read(&mut buf).unwrap();
            assert!(n > 0, "unexpected eof");
            got.extend_from_slice(&buf[..n]);
        }
        (server, got)
    });

    let stream = client.open_stream().unwrap();
    stream.write(&payload).unwrap();

    let (server, got) = srv.join().unwrap();
    assert_eq!(got, expect);
    client.close();
    server.close();
}

#[test]
fn keepalive_noops_keep_idle_session_open() {
    let (a, b) = mem_pair();
    let client = MuxSession::client(a, quick_config(1)).unwrap();
    let server = MuxSession::server(b, quick_config(1)).unwrap();

    // Three timeout periods of silence at the application layer.
    thread::sleep(Duration::from_millis(900));
    assert!(!client.is_closed());
    assert!(!server.is_closed());

    client.close();
    server.close();
}

#[test]
fn silent_peer_tears_session_down() {
    let (a, _b) = mem_pair();
    // The far end never speaks the protocol; no NOPs ever arrive.
    let client = MuxSession::client(a, quick_config(1)).unwrap();
    thread::sleep(Duration::from_millis(900));
    assert!(client.is_closed());
}

#[test]
fn pipe_joins_two_endpoints_and_closes_both() {
    let (x_a, x_b) = mem_pair();
    let (y_a, y_b) = mem_pair();

    let writer = thread::spawn(move || {
        x_a.write_all(b"through the tunnel").unwrap();
        thread::sleep(Duration::from_millis(50));
        x_a.close();
        x_a
    });

    let reader = thread::spawn(move || {
        let mut buf = [0u8; 64];
        let n = y_b.read(&mut buf).unwrap();
        (y_b, buf[..n].to_vec())
    });

    let (res_ab, res_ba) = pipe(&*x_b, &*y_a, Duration::from_secs(1));
    assert_eq!(res_ab.unwrap(), 18);
    assert!(res_ba.is_ok());

    writer.join().unwrap();
    let (_y, got) = reader.join().unwrap();
    assert_eq!(got, b"through the tunnel");
}

#[test]
fn snappy_filter_roundtrips() {
    let (a, b) = mem_pair();
    let ca = SnappyConn::new(a);
    let cb = SnappyConn::new(b);

    let payload = b"compress me ".repeat(100);
    ca.write_all(&payload).unwrap();

    let mut got = Vec::new();
    let mut buf = [0u8; 512];
    while got.len() < payload.len() {
        let n = cb.read(&mut buf).unwrap();
        assert!(n > 0);
        got.extend_from_slice(&buf[..n]);
    }
    assert_eq!(got, payload);
}

#[test]
fn zero_byte_stream_write_is_noop() {
    let (a, b) = mem_pair();
    let client = MuxSession::client(a, quick_config(1)).unwrap();
    let _server = MuxSession::server(b, quick_config(1)).unwrap();
    let stream = client.open_stream().unwrap();
    assert_eq!(stream.write(b"").unwrap(), 0);
    client.close();
}
