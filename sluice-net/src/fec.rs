use bytes::{Buf, BufMut};
use reed_solomon_erasure::galois_8::ReedSolomon;
use tracing::{debug, trace};

use crate::error::NetError;
use crate::snmp;

/// Bytes of `seqid | type` preceding every FEC-framed payload.
pub const FEC_HEADER_SIZE: usize = 6;
/// Header plus the 2-byte size field; the KCP segment stream of a DATA
/// packet begins at this offset.
pub const FEC_HEADER_SIZE_PLUS2: usize = FEC_HEADER_SIZE + 2;

pub const TYPE_DATA: u16 = 0xF1;
pub const TYPE_PARITY: u16 = 0xF2;

/// Shard sets this many ids behind the newest are dropped.
const MAX_SHARD_SETS: u32 = 32;

/// Detection window of the parameter tuner.
const MAX_AUTOTUNE_SAMPLES: usize = 258;

#[inline]
fn paws(shard_size: usize) -> u32 {
    (u32::MAX / shard_size as u32) * shard_size as u32
}

fn new_codec(data: usize, parity: usize) -> Result<ReedSolomon, NetError> {
    if data == 0 || parity == 0 || data + parity > 255 {
        return Err(NetError::InvalidFecParams { data, parity });
    }
    ReedSolomon::new(data, parity).map_err(|_| NetError::InvalidFecParams { data, parity })
}

/// Stamps outbound packets with DATA headers and emits parity packets for
/// each completed shard set, provided the set's packets are close enough in
/// time to still be worth protecting.
pub struct FecEncoder {
    data_shards: usize,
    parity_shards: usize,
    shard_size: usize,
    paws: u32,
    next: u32,

    shard_count: usize,
    max_size: usize,

    /// Offset of the FEC header inside each packet (the crypto headroom).
    header_offset: usize,
    /// Offset of the size field; Reed-Solomon coding covers everything from
    /// here on.
    payload_offset: usize,

    shard_cache: Vec<Vec<u8>>,
    ts_latest: u32,
    rs: ReedSolomon,
}

impl FecEncoder {
    pub fn new(
        data_shards: usize,
        parity_shards: usize,
        header_offset: usize,
    ) -> Result<Self, NetError> {
        let rs = new_codec(data_shards, parity_shards)?;
        let shard_size = data_shards + parity_shards;
        Ok(FecEncoder {
            data_shards,
            parity_shards,
            shard_size,
            paws: paws(shard_size),
            next: 0,
            shard_count: 0,
            max_size: 0,
            header_offset,
            payload_offset: header_offset + FEC_HEADER_SIZE,
            shard_cache: vec![Vec::new(); data_shards],
            ts_latest: 0,
            rs,
        })
    }

    /// Marks `pkt` (which carries `header_offset` bytes of headroom followed
    /// by 8 reserved FEC bytes and the KCP payload) as a DATA shard. When
    /// this packet completes a shard set and the set's packets arrived
    /// within `rto_ms` of each other, returns freshly built parity packets.
    ///
    /// A stale set is skipped rather than protected: its data has already
    /// been retransmitted and parity would arrive too late to matter. The
    /// sequence space still advances by `parity_shards` so the receiver's
    /// set arithmetic stays aligned.
    pub fn encode(&mut self, pkt: &mut [u8], rto_ms: u32, now_ms: u32) -> Vec<Vec<u8>> {
        self.mark(pkt, TYPE_DATA);
        let size = (pkt.len() - self.payload_offset) as u16;
        (&mut pkt[self.payload_offset..]).put_u16_le(size);

        let cache = &mut self.shard_cache[self.shard_count];
        cache.clear();
        cache.extend_from_slice(&pkt[self.payload_offset..]);
        self.shard_count += 1;
        self.max_size = self.max_size.max(pkt.len());

        let mut parity_out = Vec::new();
        if self.shard_count == self.data_shards {
            if now_ms.wrapping_sub(self.ts_latest) < rto_ms {
                let shard_len = self.max_size - self.payload_offset;
                for cache in &mut self.shard_cache {
                    cache.resize(shard_len, 0);
                }
                let mut parity = vec![vec![0u8; shard_len]; self.parity_shards];
                if self.rs.encode_sep(&self.shard_cache, &mut parity).is_ok() {
                    for p in parity {
                        let mut out = vec![0u8; self.header_offset];
                        out.reserve(FEC_HEADER_SIZE + p.len());
                        let seq_at = out.len();
                        out.resize(seq_at + FEC_HEADER_SIZE, 0);
                        self.mark(&mut out, TYPE_PARITY);
                        out.extend_from_slice(&p);
                        parity_out.push(out);
                    }
                    snmp::get()
                        .fec_parity_shards
                        .fetch_add(self.parity_shards as u64, std::sync::atomic::Ordering::Relaxed);
                }
            } else {
                trace!(gap = now_ms.wrapping_sub(self.ts_latest), "stale shard set skipped");
                self.next = (self.next + self.parity_shards as u32) % self.paws;
            }
            self.shard_count = 0;
            self.max_size = 0;
        }
        self.ts_latest = now_ms;
        parity_out
    }

    fn mark(&mut self, pkt: &mut [u8], typ: u16) {
        let mut hdr = &mut pkt[self.header_offset..];
        hdr.put_u32_le(self.next);
        hdr.put_u16_le(typ);
        self.next = (self.next + 1) % self.paws;
    }
}

/// One partially received shard set, indexed by position within the set.
struct ShardSet {
    shards: Vec<Option<Vec<u8>>>,
    count: usize,
    maxlen: usize,
}

impl ShardSet {
    fn new(shard_size: usize) -> Self {
        ShardSet {
            shards: vec![None; shard_size],
            count: 0,
            maxlen: 0,
        }
    }
}

/// Rebuilds lost DATA payloads from parity and, when the peer's shard split
/// visibly changes, re-learns `(data_shards, parity_shards)` from the pulse
/// pattern of incoming sequence ids.
pub struct FecDecoder {
    data_shards: usize,
    parity_shards: usize,
    shard_size: usize,
    rs: ReedSolomon,

    sets: Vec<(u32, ShardSet)>,
    newest_set: u32,

    tune: AutoTune,
    should_tune: bool,
}

impl FecDecoder {
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self, NetError> {
        let rs = new_codec(data_shards, parity_shards)?;
        Ok(FecDecoder {
            data_shards,
            parity_shards,
            shard_size: data_shards + parity_shards,
            rs,
            sets: Vec::new(),
            newest_set: 0,
            tune: AutoTune::default(),
            should_tune: false,
        })
    }

    pub fn shards(&self) -> (usize, usize) {
        (self.data_shards, self.parity_shards)
    }

    /// Consumes one FEC packet (starting at its header) and returns any KCP
    /// payloads recovered by reconstruction. The caller feeds DATA payloads
    /// to the ARQ core itself; only recovered ones come back from here.
    pub fn decode(&mut self, pkt: &[u8]) -> Vec<Vec<u8>> {
        if pkt.len() < FEC_HEADER_SIZE {
            return Vec::new();
        }
        let mut hdr = pkt;
        let seqid = hdr.get_u32_le();
        let typ = hdr.get_u16_le();

        if seqid >= paws(self.shard_size) {
            return Vec::new();
        }

        self.tune.sample(typ == TYPE_DATA, seqid);

        // A packet whose role contradicts the current split means the peer
        // reconfigured; re-learn the parameters from the pulse pattern.
        let pos = (seqid % self.shard_size as u32) as usize;
        let expect_data = pos < self.data_shards;
        if (typ == TYPE_DATA) != expect_data {
            self.should_tune = true;
        }

        if self.should_tune {
            let dp = self.tune.find_period(true);
            let pp = self.tune.find_period(false);
            if dp > 0 && pp > 0 && dp + pp < 256 {
                let (data, parity) = (dp as usize, pp as usize);
                if let Ok(rs) = new_codec(data, parity) {
                    debug!(data, parity, "fec parameters retuned");
                    self.data_shards = data;
                    self.parity_shards = parity;
                    self.shard_size = data + parity;
                    self.rs = rs;
                    self.sets.clear();
                    self.should_tune = false;
                }
            }
            if self.should_tune {
                return Vec::new();
            }
        }

        let shard_id = seqid / self.shard_size as u32;
        let pos = (seqid % self.shard_size as u32) as usize;
        if (shard_id.wrapping_sub(self.newest_set) as i32) > 0 || self.sets.is_empty() {
            self.newest_set = shard_id;
        }

        let idx = match self.sets.iter().position(|(id, _)| *id == shard_id) {
            Some(i) => i,
            None => {
                self.sets.push((shard_id, ShardSet::new(self.shard_size)));
                self.sets.len() - 1
            }
        };

        let mut recovered = Vec::new();
        let mut set_finished = false;
        let data_shards = self.data_shards;
        let set = &mut self.sets[idx].1;
        // Deduplicate by sequence id; a retransmitted shard changes nothing.
        if set.shards[pos].is_none() {
            let shard = pkt[FEC_HEADER_SIZE..].to_vec();
            set.maxlen = set.maxlen.max(shard.len());
            set.shards[pos] = Some(shard);
            set.count += 1;

            if set.count >= data_shards {
                set_finished = true;
                let all_data_present = set.shards[..data_shards].iter().all(Option::is_some);
                if all_data_present {
                    snmp::get()
                        .fec_full_shards
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                } else {
                    let maxlen = set.maxlen;
                    let missing: Vec<usize> = (0..data_shards)
                        .filter(|&i| set.shards[i].is_none())
                        .collect();
                    for s in set.shards.iter_mut().flatten() {
                        s.resize(maxlen, 0);
                    }
                    match self.rs.reconstruct_data(&mut set.shards) {
                        Ok(()) => {
                            for i in missing {
                                if let Some(shard) = &set.shards[i] {
                                    if let Some(payload) = unwrap_sized(shard) {
                                        recovered.push(payload.to_vec());
                                    }
                                }
                            }
                            snmp::get()
                                .fec_recovered
                                .fetch_add(recovered.len() as u64, std::sync::atomic::Ordering::Relaxed);
                        }
                        Err(e) => {
                            debug!(?e, "fec reconstruction failed");
                            snmp::get()
                                .fec_errs
                                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        }
                    }
                }
            }
        }
        if set_finished {
            self.sets.retain(|(id, _)| *id != shard_id);
        }

        // Age out sets the sender has long moved past.
        let newest = self.newest_set;
        let before = self.sets.len();
        self.sets.retain(|(id, _)| {
            let behind = newest.wrapping_sub(*id);
            (behind as i32) <= 0 || behind <= MAX_SHARD_SETS
        });
        let evicted = before - self.sets.len();
        if evicted > 0 {
            snmp::get()
                .fec_short_shards
                .fetch_add(evicted as u64, std::sync::atomic::Ordering::Relaxed);
        }

        recovered
    }
}

/// Strips the leading size field of a reconstructed DATA shard, yielding the
/// KCP payload. Rejects sizes the shard cannot hold; recovery can only ever
/// shorten to `maxlen` observed in the set.
fn unwrap_sized(shard: &[u8]) -> Option<&[u8]> {
    if shard.len() < 2 {
        return None;
    }
    let sz = u16::from_le_bytes([shard[0], shard[1]]) as usize;
    if sz < 2 || sz > shard.len() {
        return None;
    }
    Some(&shard[2..sz])
}

#[derive(Debug, Clone, Copy, Default)]
struct Pulse {
    bit: bool,
    seq: u32,
}

/// Period detector over the most recent 258 sequence ids. Each incoming
/// packet is a pulse (DATA = high, PARITY = low); a run of continuous ids
/// between a rising and a falling edge measures one half of the peer's
/// shard split.
#[derive(Default)]
pub struct AutoTune {
    pulses: Vec<Pulse>,
}

impl AutoTune {
    pub fn sample(&mut self, bit: bool, seq: u32) {
        if self.pulses.is_empty() {
            self.pulses = vec![Pulse::default(); MAX_AUTOTUNE_SAMPLES];
        }
        self.pulses[seq as usize % MAX_AUTOTUNE_SAMPLES] = Pulse { bit, seq };
    }

    /// Length of the first complete run of `bit` pulses with continuous
    /// sequence ids, or -1 when the window holds no such run.
    pub fn find_period(&self, bit: bool) -> i32 {
        if self.pulses.is_empty() {
            return -1;
        }
        let mut last = self.pulses[0];
        let mut idx = 1;

        // Rising edge into `bit`.
        let mut left_edge = 0;
        while idx < MAX_AUTOTUNE_SAMPLES {
            let cur = self.pulses[idx];
            if cur.seq != last.seq.wrapping_add(1) {
                return -1;
            }
            if cur.bit == bit && last.bit != bit {
                left_edge = idx;
                break;
            }
            last = cur;
            idx += 1;
        }
        if left_edge == 0 {
            return -1;
        }

        // Falling edge out of `bit`.
        last = self.pulses[left_edge];
        idx = left_edge + 1;
        while idx < MAX_AUTOTUNE_SAMPLES {
            let cur = self.pulses[idx];
            if cur.seq != last.seq.wrapping_add(1) {
                return -1;
            }
            if cur.bit != bit && last.bit == bit {
                return (idx - left_edge) as i32;
            }
            last = cur;
            idx += 1;
        }
        -1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_packet(enc: &mut FecEncoder, payload: &[u8], now: u32) -> (Vec<u8>, Vec<Vec<u8>>) {
        let mut pkt = vec![0u8; FEC_HEADER_SIZE_PLUS2];
        pkt.extend_from_slice(payload);
        let parity = enc.encode(&mut pkt, 1000, now);
        (pkt, parity)
    }

    #[test]
    fn parity_emitted_per_complete_set() {
        let mut enc = FecEncoder::new(3, 2, 0).unwrap();
        let mut all_parity = Vec::new();
        for i in 0..3 {
            let (_, parity) = data_packet(&mut enc, &[i; 100], 10 * i as u32 + 1);
            all_parity.extend(parity);
        }
        assert_eq!(all_parity.len(), 2);
        for p in &all_parity {
            assert_eq!(u16::from_le_bytes([p[4], p[5]]), TYPE_PARITY);
        }
    }

    #[test]
    fn stale_set_skips_parity_but_advances_seqids() {
        let mut enc = FecEncoder::new(2, 1, 0).unwrap();
        let (_, p) = data_packet(&mut enc, b"aaa", 0);
        assert!(p.is_empty());
        // Second data packet arrives far outside the rto window.
        let (_, p) = data_packet(&mut enc, b"bbb", 50_000);
        assert!(p.is_empty());
        // Next set begins on the next aligned boundary regardless.
        let (pkt, _) = data_packet(&mut enc, b"ccc", 50_001);
        let seqid = u32::from_le_bytes([pkt[0], pkt[1], pkt[2], pkt[3]]);
        assert_eq!(seqid, 3);
    }

    #[test]
    fn decoder_recovers_dropped_data_shard() {
        let mut enc = FecEncoder::new(3, 2, 0).unwrap();
        let mut dec = FecDecoder::new(3, 2).unwrap();

        let payloads: Vec<Vec<u8>> = (0..3u8).map(|i| vec![i + 1; 50 + i as usize]).collect();
        let mut wire = Vec::new();
        for (i, p) in payloads.iter().enumerate() {
            let (pkt, parity) = data_packet(&mut enc, p, i as u32 + 1);
            wire.push(pkt);
            wire.extend(parity);
        }
        assert_eq!(wire.len(), 5);

        // Drop data shard 1; feed the rest.
        let mut recovered = Vec::new();
        for (i, pkt) in wire.iter().enumerate() {
            if i == 1 {
                continue;
            }
            recovered.extend(dec.decode(pkt));
        }
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0], payloads[1]);
    }

    #[test]
    fn drop_beyond_parity_fails() {
        let mut enc = FecEncoder::new(3, 1, 0).unwrap();
        let mut dec = FecDecoder::new(3, 1).unwrap();

        let mut wire = Vec::new();
        for i in 0..3u8 {
            let (pkt, parity) = data_packet(&mut enc, &[i; 40], i as u32 + 1);
            wire.push(pkt);
            wire.extend(parity);
        }
        // Drop two data shards with only one parity shard available.
        let mut recovered = Vec::new();
        for (i, pkt) in wire.iter().enumerate() {
            if i == 0 || i == 1 {
                continue;
            }
            recovered.extend(dec.decode(pkt));
        }
        assert!(recovered.is_empty());
    }

    #[test]
    fn duplicate_seqids_are_ignored() {
        let mut enc = FecEncoder::new(2, 1, 0).unwrap();
        let mut dec = FecDecoder::new(2, 1).unwrap();
        let (pkt, _) = data_packet(&mut enc, b"dup", 1);
        assert!(dec.decode(&pkt).is_empty());
        assert!(dec.decode(&pkt).is_empty());
        assert_eq!(dec.sets.len(), 1);
        assert_eq!(dec.sets[0].1.count, 1);
    }

    #[test]
    fn recovered_shard_never_exceeds_maxlen() {
        let mut enc = FecEncoder::new(2, 1, 0).unwrap();
        let mut dec = FecDecoder::new(2, 1).unwrap();
        let (p0, _) = data_packet(&mut enc, &[7; 10], 1);
        let (_p1, parity) = data_packet(&mut enc, &[8; 200], 2);
        let maxlen = FEC_HEADER_SIZE_PLUS2 + 200 - FEC_HEADER_SIZE;
        let mut rec = Vec::new();
        rec.extend(dec.decode(&p0));
        for p in &parity {
            rec.extend(dec.decode(p));
        }
        assert_eq!(rec.len(), 1);
        assert!(rec[0].len() <= maxlen);
        assert_eq!(rec[0], vec![8; 200]);
    }

    #[test]
    fn autotune_detects_split_change() {
        let mut dec = FecDecoder::new(10, 3).unwrap();
        // Peer switched to a 7/2 split; feed a long continuous run.
        let mut fed = 0u32;
        let mut seq = 0u32;
        while fed < 600 {
            let pos = seq % 9;
            let typ = if pos < 7 { TYPE_DATA } else { TYPE_PARITY };
            let mut pkt = Vec::new();
            pkt.put_u32_le(seq);
            pkt.put_u16_le(typ);
            pkt.put_u16_le(2);
            dec.decode(&pkt);
            seq += 1;
            fed += 1;
        }
        assert_eq!(dec.shards(), (7, 2));
    }

    #[test]
    fn invalid_parameters_rejected() {
        assert!(FecEncoder::new(0, 3, 0).is_err());
        assert!(FecEncoder::new(200, 100, 0).is_err());
        assert!(FecDecoder::new(1, 0).is_err());
    }
}
