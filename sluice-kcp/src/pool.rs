use once_cell::sync::Lazy;
use parking_lot::Mutex;

/// Hard cap on the size of any datagram the tunnel handles.
pub const MTU_LIMIT: usize = 1500;

/// Maximum number of idle buffers retained; beyond this, `put` lets buffers
/// drop so the pool can shrink under memory pressure.
const MAX_IDLE: usize = 512;

static POOL: Lazy<Mutex<Vec<Vec<u8>>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// Fetches an empty buffer with capacity exactly [`MTU_LIMIT`].
///
/// All packet-sized allocations on the hot path go through here so steady-state
/// traffic recycles a fixed working set instead of hitting the allocator.
pub fn get() -> Vec<u8> {
    if let Some(mut buf) = POOL.lock().pop() {
        buf.clear();
        return buf;
    }
    Vec::with_capacity(MTU_LIMIT)
}

/// Returns a buffer to the pool. Buffers whose capacity is not exactly
/// [`MTU_LIMIT`] are rejected and simply dropped; anything else would poison
/// the uniform-size contract `get` relies on.
pub fn put(buf: Vec<u8>) {
    if buf.capacity() != MTU_LIMIT {
        return;
    }
    let mut pool = POOL.lock();
    if pool.len() < MAX_IDLE {
        pool.push(buf);
    }
}
