use std::collections::HashSet;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use sluice::config::{Config, MultiPort};
use sluice::endpoint::{qpp_pad, wrap_conn, TunnelPool};
use sluice_mux::{pipe, MuxSession};
use sluice_net::Listener;

fn test_config(remote: &str, crypt: &str, ds: usize, ps: usize) -> Config {
    Config {
        listen: "127.0.0.1:0".into(),
        remoteaddr: remote.into(),
        target: String::new(),
        key: "secret".into(),
        crypt: crypt.into(),
        mtu: 1350,
        sndwnd: 128,
        rcvwnd: 512,
        datashard: ds,
        parityshard: ps,
        dscp: 0,
        sockbuf: 4194304,
        smuxver: 1,
        smuxbuf: 4194304,
        streambuf: 2097152,
        framesize: 4096,
        keepalive: 10,
        closewait: 3,
        ratelimit: 0,
        conn: 1,
        autoexpire: 0,
        scavengettl: 600,
        nocomp: false,
        acknodelay: true,
        quiet: true,
        qpp: false,
        qpp_count: 61,
        nodelay: 1,
        interval: 10,
        resend: 2,
        nc: 1,
        snmplog: None,
        snmpperiod: 60,
    }
}

/// Upstream echo service; returns its address.
fn echo_upstream() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        for inbound in listener.incoming() {
            let Ok(mut tcp) = inbound else { return };
            thread::spawn(move || {
                let mut buf = [0u8; 4096];
                let mut out = tcp.try_clone().unwrap();
                while let Ok(n) = tcp.read(&mut buf) {
                    if n == 0 || out.write_all(&buf[..n]).is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

/// Boots a tunnel server forwarding to `target`; returns the UDP address.
fn tunnel_server(cfg: Config, target: std::net::SocketAddr) -> std::net::SocketAddr {
    let sess_cfg = cfg.session_config().unwrap();
    let listener = Listener::bind("127.0.0.1:0", &sess_cfg).unwrap();
    let addr = listener.local_addr().unwrap();
    let pad = qpp_pad(&cfg);
    thread::spawn(move || loop {
        let Ok(sess) = listener.accept() else { return };
        let cfg = cfg.clone();
        let pad = pad.clone();
        thread::spawn(move || {
            let conn = wrap_conn(sess, &cfg, pad.as_ref(), false);
            let mux = MuxSession::server(conn, cfg.mux_config()).unwrap();
            let close_wait = Duration::from_secs(cfg.closewait);
            loop {
                let Ok(stream) = mux.accept_stream() else { return };
                thread::spawn(move || {
                    let upstream = TcpStream::connect(target).unwrap();
                    let _ = pipe(&*stream, &upstream, close_wait);
                });
            }
        });
    });
    addr
}

#[test]
fn echo_through_the_full_stack() {
    let upstream = echo_upstream();
    let cfg = test_config("placeholder:1", "aes", 10, 3);
    let server_addr = tunnel_server(cfg.clone(), upstream);

    let client_cfg = test_config(&server_addr.to_string(), "aes", 10, 3);
    let pool = TunnelPool::new(client_cfg).unwrap();

    let mux = pool.pick().unwrap();
    let stream = mux.open_stream().unwrap();
    stream.set_read_deadline(Some(Instant::now() + Duration::from_secs(1)));

    stream.write(b"hello\n").unwrap();
    let mut buf = [0u8; 64];
    let n = stream.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"hello\n");
    stream.close();
}

#[test]
fn compressed_and_obfuscated_stack_roundtrips() {
    let upstream = echo_upstream();
    let mut cfg = test_config("placeholder:1", "salsa20", 0, 0);
    cfg.qpp = true;
    let server_addr = tunnel_server(cfg.clone(), upstream);

    let mut client_cfg = test_config(&server_addr.to_string(), "salsa20", 0, 0);
    client_cfg.qpp = true;
    let pool = TunnelPool::new(client_cfg).unwrap();

    let mux = pool.pick().unwrap();
    let stream = mux.open_stream().unwrap();
    stream.set_read_deadline(Some(Instant::now() + Duration::from_secs(2)));

    let payload = b"obfuscated and compressed ".repeat(50);
    stream.write(&payload).unwrap();
    let mut got = Vec::new();
    let mut buf = [0u8; 4096];
    while got.len() < payload.len() {
        let n = stream.read(&mut buf).unwrap();
        assert!(n > 0);
        got.extend_from_slice(&buf[..n]);
    }
    assert_eq!(got, payload);
    stream.close();
}

#[test]
fn graceful_close_wait_delivers_last_bytes() {
    let upstream = echo_upstream();
    let cfg = test_config("placeholder:1", "none", 0, 0);
    let server_addr = tunnel_server(cfg.clone(), upstream);

    let client_cfg = test_config(&server_addr.to_string(), "none", 0, 0);
    let pool = TunnelPool::new(client_cfg).unwrap();
    let mux = pool.pick().unwrap();
    let stream = mux.open_stream().unwrap();

    stream.write(b"last").unwrap();
    // Half-close: the peer must still see the payload, then end-of-stream,
    // within the close-wait grace.
    let started = Instant::now();
    stream.set_read_deadline(Some(Instant::now() + Duration::from_secs(3)));
    let mut buf = [0u8; 16];
    let n = stream.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"last");
    stream.close();
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[test]
fn port_range_dialing_spreads_across_ports() {
    // Three listeners on consecutive ports; retry bases until one works.
    let mut bound = None;
    for base in (40000u16..60000).step_by(977) {
        let cfg = test_config("placeholder:1", "null", 0, 0);
        let sess_cfg = cfg.session_config().unwrap();
        let try_bind = (0..3u16)
            .map(|i| Listener::bind(&format!("127.0.0.1:{}", base + i), &sess_cfg))
            .collect::<Result<Vec<_>, _>>();
        if let Ok(listeners) = try_bind {
            bound = Some((base, listeners));
            break;
        }
    }
    let (base, listeners) = bound.expect("no free port triple");

    let range = MultiPort {
        host: "127.0.0.1".into(),
        min: base,
        max: base + 2,
    };
    let mut rng = rand::thread_rng();
    let mut seen = HashSet::new();
    for _ in 0..12 {
        let addr = range.choose(&mut rng);
        let port: u16 = addr.rsplit_once(':').unwrap().1.parse().unwrap();
        assert!((base..=base + 2).contains(&port));
        seen.insert(port);
    }
    // Uniform selection over 3 ports practically never picks one port twelve
    // times in a row.
    assert!(seen.len() >= 2);
    drop(listeners);
}

#[test]
fn pool_rotates_expired_conversations() {
    let upstream = echo_upstream();
    let cfg = test_config("placeholder:1", "null", 0, 0);
    let server_addr = tunnel_server(cfg.clone(), upstream);

    let mut client_cfg = test_config(&server_addr.to_string(), "null", 0, 0);
    client_cfg.autoexpire = 1;
    let pool = TunnelPool::new(client_cfg).unwrap();

    let first = pool.pick().unwrap();
    thread::sleep(Duration::from_millis(1200));
    let second = pool.pick().unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
}
