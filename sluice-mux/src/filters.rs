use std::io;
use std::io::{Read, Write};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

use crate::conn::Conn;

// ----------------------------------------------------------------------
// Snappy compression
// ----------------------------------------------------------------------

struct ConnReader(Arc<dyn Conn>);

impl io::Read for ConnReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

struct ConnWriter(Arc<dyn Conn>);

impl io::Write for ConnWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Transparent Snappy framing around a [`Conn`]. Every write is flushed as
/// a complete frame so the peer can decode without waiting for more input;
/// session semantics underneath are untouched.
pub struct SnappyConn {
    inner: Arc<dyn Conn>,
    rd: Mutex<snap::read::FrameDecoder<ConnReader>>,
    wr: Mutex<snap::write::FrameEncoder<ConnWriter>>,
}

impl SnappyConn {
    pub fn new(inner: Arc<dyn Conn>) -> SnappyConn {
        SnappyConn {
            rd: Mutex::new(snap::read::FrameDecoder::new(ConnReader(inner.clone()))),
            wr: Mutex::new(snap::write::FrameEncoder::new(ConnWriter(inner.clone()))),
            inner,
        }
    }
}

impl Conn for SnappyConn {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.rd.lock().read(buf)
    }

    fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        let mut wr = self.wr.lock();
        wr.write_all(buf)?;
        wr.flush()
    }

    fn close(&self) {
        self.inner.close();
    }
}

// ----------------------------------------------------------------------
// Quantum permutation pad
// ----------------------------------------------------------------------

/// A shared pad of byte-permutation matrices derived deterministically from
/// the pre-shared key. Both ends build the identical pad; per-session seeds
/// then drive which matrix scrambles each byte.
pub struct QppPad {
    pads: Vec<[u8; 256]>,
    inv_pads: Vec<[u8; 256]>,
}

impl QppPad {
    /// Derives `count` permutation matrices (1..=255) from the key.
    pub fn new(key: &[u8; 32], count: u8) -> QppPad {
        let count = count.max(1) as usize;
        let mut pads = Vec::with_capacity(count);
        let mut inv_pads = Vec::with_capacity(count);
        for i in 0..count {
            let mut seed = [0u8; 32];
            for (j, b) in key.iter().enumerate() {
                seed[j] = b ^ (i as u8).wrapping_mul(0x9D).wrapping_add(j as u8);
            }
            let mut rng = StdRng::from_seed(seed);
            let mut perm = [0u8; 256];
            for (k, p) in perm.iter_mut().enumerate() {
                *p = k as u8;
            }
            for k in (1..256usize).rev() {
                let r = rng.gen_range(0..=k);
                perm.swap(k, r);
            }
            let mut inv = [0u8; 256];
            for (k, &p) in perm.iter().enumerate() {
                inv[p as usize] = k as u8;
            }
            pads.push(perm);
            inv_pads.push(inv);
        }
        QppPad { pads, inv_pads }
    }

    fn count(&self) -> usize {
        self.pads.len()
    }
}

/// One direction of the permutation stream: a seeded PRNG selects which
/// matrix scrambles each byte, so the byte stream is position-dependent.
struct QppStream {
    rng: StdRng,
}

impl QppStream {
    fn new(seed: u64) -> QppStream {
        QppStream {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn encrypt(&mut self, pad: &QppPad, data: &mut [u8]) {
        for b in data {
            let idx = self.rng.next_u32() as usize % pad.count();
            *b = pad.pads[idx][*b as usize];
        }
    }

    fn decrypt(&mut self, pad: &QppPad, data: &mut [u8]) {
        for b in data {
            let idx = self.rng.next_u32() as usize % pad.count();
            *b = pad.inv_pads[idx][*b as usize];
        }
    }
}

const DIRECTION_SALT: u64 = 0x9E37_79B9_7F4A_7C15;

/// Permutation-pad obfuscation around a [`Conn`]. Each direction runs its
/// own PRNG stream; both ends must agree on the pad and the session seed or
/// the peer's checksum layer rejects everything.
pub struct QppConn {
    inner: Arc<dyn Conn>,
    pad: Arc<QppPad>,
    tx: Mutex<QppStream>,
    rx: Mutex<QppStream>,
}

impl QppConn {
    /// `seed` is the per-session seed (both ends derive it from the
    /// conversation id); `client` picks which directional stream is which.
    pub fn new(inner: Arc<dyn Conn>, pad: Arc<QppPad>, seed: u64, client: bool) -> QppConn {
        let (tx_seed, rx_seed) = if client {
            (seed, seed ^ DIRECTION_SALT)
        } else {
            (seed ^ DIRECTION_SALT, seed)
        };
        QppConn {
            inner,
            pad,
            tx: Mutex::new(QppStream::new(tx_seed)),
            rx: Mutex::new(QppStream::new(rx_seed)),
        }
    }
}

impl Conn for QppConn {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.rx.lock().decrypt(&self.pad, &mut buf[..n]);
        Ok(n)
    }

    fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        let mut owned = buf.to_vec();
        self.tx.lock().encrypt(&self.pad, &mut owned);
        self.inner.write_all(&owned)
    }

    fn close(&self) {
        self.inner.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pad_permutations_invert() {
        let pad = QppPad::new(&[7u8; 32], 13);
        for (perm, inv) in pad.pads.iter().zip(&pad.inv_pads) {
            for b in 0..=255u8 {
                assert_eq!(inv[perm[b as usize] as usize], b);
            }
        }
    }

    #[test]
    fn directional_streams_roundtrip() {
        let pad = QppPad::new(&[42u8; 32], 61);
        let mut client_tx = QppStream::new(99);
        let mut server_rx = QppStream::new(99);

        let mut data = b"permute me gently".to_vec();
        client_tx.encrypt(&pad, &mut data);
        assert_ne!(&data, b"permute me gently");
        server_rx.decrypt(&pad, &mut data);
        assert_eq!(&data, b"permute me gently");
    }

    #[test]
    fn mismatched_seed_produces_garbage() {
        let pad = QppPad::new(&[42u8; 32], 61);
        let mut tx = QppStream::new(1);
        let mut rx = QppStream::new(2);
        let mut data = b"secret".to_vec();
        tx.encrypt(&pad, &mut data);
        rx.decrypt(&pad, &mut data);
        assert_ne!(&data, b"secret");
    }
}
