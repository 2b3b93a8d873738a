use std::io;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError};
use tracing::trace;

use crate::conn::Conn;

/// Copies `src` into `dst` until end-of-stream or error.
fn copy_conn(src: &dyn Conn, dst: &dyn Conn) -> io::Result<u64> {
    let mut buf = [0u8; 32 * 1024];
    let mut total = 0u64;
    loop {
        let n = src.read(&mut buf)?;
        if n == 0 {
            return Ok(total);
        }
        dst.write_all(&buf[..n])?;
        total += n as u64;
    }
}

/// Runs the two copies `a→b` and `b→a` concurrently. As soon as either
/// direction terminates, the other is given `close_wait` to drain, after
/// which both endpoints are closed; the call returns only once both
/// directions have stopped. `close_wait` of zero closes immediately on
/// first-side termination.
///
/// The two results are reported separately so the caller can tell which
/// side failed.
pub fn pipe(
    a: &(dyn Conn),
    b: &(dyn Conn),
    close_wait: Duration,
) -> (io::Result<u64>, io::Result<u64>) {
    let (done_tx, done_rx) = bounded::<()>(2);

    let (res_ab, res_ba) = thread::scope(|scope| {
        let tx1 = done_tx.clone();
        let h_ab = scope.spawn(move || {
            let res = copy_conn(a, b);
            let _ = tx1.send(());
            res
        });
        let tx2 = done_tx.clone();
        let h_ba = scope.spawn(move || {
            let res = copy_conn(b, a);
            let _ = tx2.send(());
            res
        });

        // First direction done; grant the grace period, then force both
        // sides shut so the second join cannot hang.
        let _ = done_rx.recv();
        match done_rx.recv_timeout(close_wait) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {}
        }
        trace!("pipe closing both endpoints");
        a.close();
        b.close();

        let res_ab = h_ab.join().unwrap_or_else(|_| Err(io::ErrorKind::Other.into()));
        let res_ba = h_ba.join().unwrap_or_else(|_| Err(io::ErrorKind::Other.into()));
        (res_ab, res_ba)
    });

    (res_ab, res_ba)
}
