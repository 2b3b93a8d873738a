use std::sync::atomic::{AtomicU64, Ordering};

use once_cell::sync::Lazy;

/// Process-wide traffic counters, updated with relaxed atomics from every
/// session and drained by the optional CSV dump loop.
#[derive(Debug, Default)]
pub struct Snmp {
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub max_conn: AtomicU64,
    pub active_opens: AtomicU64,
    pub passive_opens: AtomicU64,
    pub curr_estab: AtomicU64,
    pub in_errs: AtomicU64,
    pub in_csum_errors: AtomicU64,
    pub kcp_in_errors: AtomicU64,
    pub in_pkts: AtomicU64,
    pub out_pkts: AtomicU64,
    pub in_segs: AtomicU64,
    pub out_segs: AtomicU64,
    pub in_bytes: AtomicU64,
    pub out_bytes: AtomicU64,
    pub retrans_segs: AtomicU64,
    pub fast_retrans_segs: AtomicU64,
    pub early_retrans_segs: AtomicU64,
    pub lost_segs: AtomicU64,
    pub repeat_segs: AtomicU64,
    pub fec_parity_shards: AtomicU64,
    pub fec_errs: AtomicU64,
    pub fec_recovered: AtomicU64,
    pub fec_short_shards: AtomicU64,
    pub fec_full_shards: AtomicU64,
}

static GLOBAL: Lazy<Snmp> = Lazy::new(Snmp::default);

/// The process-wide counter block.
pub fn get() -> &'static Snmp {
    &GLOBAL
}

macro_rules! counter_list {
    ($macro_cb:ident) => {
        $macro_cb!(
            (bytes_sent, "BytesSent"),
            (bytes_received, "BytesReceived"),
            (max_conn, "MaxConn"),
            (active_opens, "ActiveOpens"),
            (passive_opens, "PassiveOpens"),
            (curr_estab, "CurrEstab"),
            (in_errs, "InErrs"),
            (in_csum_errors, "InCsumErrors"),
            (kcp_in_errors, "KCPInErrors"),
            (in_pkts, "InPkts"),
            (out_pkts, "OutPkts"),
            (in_segs, "InSegs"),
            (out_segs, "OutSegs"),
            (in_bytes, "InBytes"),
            (out_bytes, "OutBytes"),
            (retrans_segs, "RetransSegs"),
            (fast_retrans_segs, "FastRetransSegs"),
            (early_retrans_segs, "EarlyRetransSegs"),
            (lost_segs, "LostSegs"),
            (repeat_segs, "RepeatSegs"),
            (fec_parity_shards, "FECParityShards"),
            (fec_errs, "FECErrs"),
            (fec_recovered, "FECRecovered"),
            (fec_short_shards, "FECShortShards"),
            (fec_full_shards, "FECFullShards")
        )
    };
}

impl Snmp {
    /// CSV header matching [`Snmp::row`].
    pub fn header() -> String {
        macro_rules! names {
            ($(($field:ident, $name:expr)),*) => {
                [$($name),*].join(",")
            };
        }
        counter_list!(names)
    }

    /// One CSV row with the current counter values.
    pub fn row(&self) -> String {
        macro_rules! values {
            ($(($field:ident, $name:expr)),*) => {
                [$(self.$field.load(Ordering::Relaxed).to_string()),*].join(",")
            };
        }
        counter_list!(values)
    }

    /// Copies all counters into a fresh, detached block.
    pub fn copy(&self) -> Snmp {
        let out = Snmp::default();
        macro_rules! copy_all {
            ($(($field:ident, $name:expr)),*) => {
                $(out.$field.store(self.$field.load(Ordering::Relaxed), Ordering::Relaxed);)*
            };
        }
        counter_list!(copy_all);
        out
    }

    /// Zeroes every counter.
    pub fn reset(&self) {
        macro_rules! reset_all {
            ($(($field:ident, $name:expr)),*) => {
                $(self.$field.store(0, Ordering::Relaxed);)*
            };
        }
        counter_list!(reset_all);
    }
}
