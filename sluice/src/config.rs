use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use serde::Deserialize;

use sluice_mux::MuxConfig;
use sluice_net::SessionConfig;

/// A listen/dial address: a host plus either one port or an inclusive range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiPort {
    pub host: String,
    pub min: u16,
    pub max: u16,
}

impl MultiPort {
    /// Concrete `host:port` string; an empty host means every interface.
    pub fn addr(&self, port: u16) -> String {
        let host = if self.host.is_empty() {
            "0.0.0.0"
        } else {
            &self.host
        };
        format!("{host}:{port}")
    }

    /// Picks one concrete port uniformly from the range.
    pub fn choose(&self, rng: &mut impl rand::Rng) -> String {
        self.addr(rng.gen_range(self.min..=self.max))
    }

    pub fn ports(&self) -> impl Iterator<Item = u16> {
        self.min..=self.max
    }
}

impl fmt::Display for MultiPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.min == self.max {
            write!(f, "{}:{}", self.host, self.min)
        } else {
            write!(f, "{}:{}-{}", self.host, self.min, self.max)
        }
    }
}

/// Parses `host:port` or `host:minport-maxport` (inclusive). Port 0 and
/// inverted ranges are rejected.
pub fn parse_multi_port(addr: &str) -> anyhow::Result<MultiPort> {
    let (host, ports) = addr
        .rsplit_once(':')
        .with_context(|| format!("address {addr:?} has no port"))?;

    let (min_s, max_s) = match ports.split_once('-') {
        Some((a, b)) => (a, b),
        None => (ports, ports),
    };
    let min: u32 = min_s.parse().with_context(|| format!("bad port {min_s:?}"))?;
    let max: u32 = max_s.parse().with_context(|| format!("bad port {max_s:?}"))?;
    if min == 0 || max == 0 {
        bail!("port 0 is not bindable in {addr:?}");
    }
    if min > 65535 || max > 65535 {
        bail!("port out of range in {addr:?}");
    }
    if min > max {
        bail!("inverted port range in {addr:?}");
    }
    Ok(MultiPort {
        host: host.to_string(),
        min: min as u16,
        max: max as u16,
    })
}

/// The merged tunnel configuration. JSON files use the same field names,
/// lowercased, as the long flags.
#[derive(Debug, Clone, Parser)]
#[command(name = "sluice", about = "encrypted, FEC-protected UDP tunnel")]
pub struct Flags {
    /// Local listen address (host:port or host:minport-maxport).
    #[arg(short = 'l', long)]
    pub listen: Option<String>,
    /// Peer address, same grammar.
    #[arg(short = 'r', long)]
    pub remoteaddr: Option<String>,
    /// Upstream target the server forwards streams to.
    #[arg(short = 't', long)]
    pub target: Option<String>,
    /// Pre-shared secret; KCPTUN_KEY overrides the default when the flag is
    /// absent.
    #[arg(long)]
    pub key: Option<String>,
    /// Block cipher name.
    #[arg(long)]
    pub crypt: Option<String>,
    /// Latency/throughput preset: fast3, fast2, fast, normal, manual.
    #[arg(long)]
    pub mode: Option<String>,
    #[arg(long)]
    pub mtu: Option<usize>,
    #[arg(long)]
    pub sndwnd: Option<u16>,
    #[arg(long)]
    pub rcvwnd: Option<u16>,
    #[arg(long)]
    pub datashard: Option<usize>,
    #[arg(long)]
    pub parityshard: Option<usize>,
    #[arg(long)]
    pub dscp: Option<u8>,
    #[arg(long)]
    pub sockbuf: Option<usize>,
    #[arg(long)]
    pub smuxver: Option<u8>,
    #[arg(long)]
    pub smuxbuf: Option<usize>,
    #[arg(long)]
    pub streambuf: Option<usize>,
    #[arg(long)]
    pub framesize: Option<usize>,
    /// Keepalive interval in seconds.
    #[arg(long)]
    pub keepalive: Option<u64>,
    /// Grace period in seconds for a half-closed pipe to drain.
    #[arg(long)]
    pub closewait: Option<u64>,
    /// Outbound rate limit in bytes per second; negative clamps to zero.
    #[arg(long)]
    pub ratelimit: Option<i64>,
    /// Number of parallel conversations (client only).
    #[arg(long)]
    pub conn: Option<usize>,
    /// Seconds before a dialed conversation is retired for new streams.
    #[arg(long)]
    pub autoexpire: Option<u64>,
    /// Upper bound in seconds a retired conversation may linger.
    #[arg(long)]
    pub scavengettl: Option<u64>,
    #[arg(long)]
    pub nocomp: bool,
    #[arg(long)]
    pub acknodelay: bool,
    #[arg(long)]
    pub tcp: bool,
    #[arg(long)]
    pub quiet: bool,
    #[arg(long)]
    pub pprof: bool,
    #[arg(long = "QPP")]
    pub qpp: bool,
    #[arg(long = "QPPCount")]
    pub qpp_count: Option<u8>,
    /// Manual-mode knobs.
    #[arg(long)]
    pub nodelay: Option<u32>,
    #[arg(long)]
    pub interval: Option<u32>,
    #[arg(long)]
    pub resend: Option<u32>,
    #[arg(long)]
    pub nc: Option<u32>,
    /// SNMP CSV dump path; the filename is a time-format template.
    #[arg(long)]
    pub snmplog: Option<String>,
    /// SNMP dump period in seconds.
    #[arg(long)]
    pub snmpperiod: Option<u64>,
    /// JSON configuration with the same field names, lowercased.
    #[arg(short = 'c')]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    listen: Option<String>,
    remoteaddr: Option<String>,
    target: Option<String>,
    key: Option<String>,
    crypt: Option<String>,
    mode: Option<String>,
    mtu: Option<usize>,
    sndwnd: Option<u16>,
    rcvwnd: Option<u16>,
    datashard: Option<usize>,
    parityshard: Option<usize>,
    dscp: Option<u8>,
    sockbuf: Option<usize>,
    smuxver: Option<u8>,
    smuxbuf: Option<usize>,
    streambuf: Option<usize>,
    framesize: Option<usize>,
    keepalive: Option<u64>,
    closewait: Option<u64>,
    ratelimit: Option<i64>,
    conn: Option<usize>,
    autoexpire: Option<u64>,
    scavengettl: Option<u64>,
    nocomp: Option<bool>,
    acknodelay: Option<bool>,
    tcp: Option<bool>,
    quiet: Option<bool>,
    pprof: Option<bool>,
    #[serde(rename = "qpp")]
    qpp: Option<bool>,
    #[serde(rename = "qppcount")]
    qpp_count: Option<u8>,
    nodelay: Option<u32>,
    interval: Option<u32>,
    resend: Option<u32>,
    nc: Option<u32>,
    snmplog: Option<String>,
    snmpperiod: Option<u64>,
}

/// Fully resolved, validated configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub remoteaddr: String,
    pub target: String,
    pub key: String,
    pub crypt: String,
    pub mtu: usize,
    pub sndwnd: u16,
    pub rcvwnd: u16,
    pub datashard: usize,
    pub parityshard: usize,
    pub dscp: u8,
    pub sockbuf: usize,
    pub smuxver: u8,
    pub smuxbuf: usize,
    pub streambuf: usize,
    pub framesize: usize,
    pub keepalive: u64,
    pub closewait: u64,
    pub ratelimit: u64,
    pub conn: usize,
    pub autoexpire: u64,
    pub scavengettl: u64,
    pub nocomp: bool,
    pub acknodelay: bool,
    pub quiet: bool,
    pub qpp: bool,
    pub qpp_count: u8,
    pub nodelay: u32,
    pub interval: u32,
    pub resend: u32,
    pub nc: u32,
    pub snmplog: Option<String>,
    pub snmpperiod: u64,
}

macro_rules! pick {
    ($flag:expr, $file:expr, $default:expr) => {
        $flag.or($file).unwrap_or($default)
    };
}

impl Config {
    /// Resolves flags, the optional JSON file and defaults into a validated
    /// configuration. Flags win over file values, file values over defaults.
    pub fn resolve(flags: Flags) -> anyhow::Result<Config> {
        let file: FileConfig = match &flags.config {
            Some(path) => {
                let raw = fs::read_to_string(path)
                    .with_context(|| format!("reading config {path:?}"))?;
                serde_json::from_str(&raw).with_context(|| format!("parsing config {path:?}"))?
            }
            None => FileConfig::default(),
        };

        let key = flags
            .key
            .or(file.key)
            .or_else(|| std::env::var("KCPTUN_KEY").ok())
            .unwrap_or_else(|| "it's a secret".to_string());

        let mode = pick!(flags.mode, file.mode, "fast".to_string());
        let (mut nodelay, mut interval, mut resend, mut nc) = match mode.as_str() {
            "fast3" => (1, 10, 2, 1),
            "fast2" => (1, 20, 2, 1),
            "fast" => (0, 20, 2, 1),
            "normal" => (0, 40, 2, 1),
            "manual" => (0, 40, 2, 1),
            other => bail!("unknown mode {other:?}"),
        };
        if mode == "manual" {
            nodelay = pick!(flags.nodelay, file.nodelay, nodelay);
            interval = pick!(flags.interval, file.interval, interval);
            resend = pick!(flags.resend, file.resend, resend);
            nc = pick!(flags.nc, file.nc, nc);
        }

        let cfg = Config {
            listen: pick!(flags.listen, file.listen, ":29900".to_string()),
            remoteaddr: pick!(
                flags.remoteaddr,
                file.remoteaddr,
                "127.0.0.1:29900".to_string()
            ),
            target: pick!(flags.target, file.target, "127.0.0.1:12948".to_string()),
            key,
            crypt: pick!(flags.crypt, file.crypt, "aes".to_string()),
            mtu: pick!(flags.mtu, file.mtu, 1350),
            sndwnd: pick!(flags.sndwnd, file.sndwnd, 128),
            rcvwnd: pick!(flags.rcvwnd, file.rcvwnd, 512),
            datashard: pick!(flags.datashard, file.datashard, 10),
            parityshard: pick!(flags.parityshard, file.parityshard, 3),
            dscp: pick!(flags.dscp, file.dscp, 0),
            sockbuf: pick!(flags.sockbuf, file.sockbuf, 4194304),
            smuxver: pick!(flags.smuxver, file.smuxver, 1),
            smuxbuf: pick!(flags.smuxbuf, file.smuxbuf, 4194304),
            streambuf: pick!(flags.streambuf, file.streambuf, 2097152),
            framesize: pick!(flags.framesize, file.framesize, 4096),
            keepalive: pick!(flags.keepalive, file.keepalive, 10),
            closewait: pick!(flags.closewait, file.closewait, 0),
            ratelimit: pick!(flags.ratelimit, file.ratelimit, 0).max(0) as u64,
            conn: pick!(flags.conn, file.conn, 1).max(1),
            autoexpire: pick!(flags.autoexpire, file.autoexpire, 0),
            scavengettl: pick!(flags.scavengettl, file.scavengettl, 600),
            nocomp: flags.nocomp || file.nocomp.unwrap_or(false),
            acknodelay: flags.acknodelay || file.acknodelay.unwrap_or(false),
            quiet: flags.quiet || file.quiet.unwrap_or(false),
            qpp: flags.qpp || file.qpp.unwrap_or(false),
            qpp_count: pick!(flags.qpp_count, file.qpp_count, 61),
            nodelay,
            interval,
            resend,
            nc,
            snmplog: flags.snmplog.or(file.snmplog),
            snmpperiod: pick!(flags.snmpperiod, file.snmpperiod, 60),
        };

        if flags.tcp || file.tcp.unwrap_or(false) {
            bail!("tcp transport emulation is not supported by this build");
        }
        if flags.pprof || file.pprof.unwrap_or(false) {
            tracing::warn!("pprof endpoint is not built into this binary, ignoring");
        }
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.mtu > 1500 {
            bail!("mtu {} exceeds the 1500-byte cap", self.mtu);
        }
        if self.mtu < 50 {
            bail!("mtu {} too small", self.mtu);
        }
        if !(1..=2).contains(&self.smuxver) {
            bail!("unsupported smux version {}", self.smuxver);
        }
        if self.qpp && self.qpp_count == 0 {
            bail!("QPPCount must be between 1 and 255");
        }
        if self.datashard + self.parityshard > 255 {
            bail!(
                "datashard {} + parityshard {} exceeds 255",
                self.datashard,
                self.parityshard
            );
        }
        if self.framesize == 0 || self.framesize > 65535 {
            bail!("framesize {} out of range", self.framesize);
        }
        parse_multi_port(&self.listen).context("bad listen address")?;
        parse_multi_port(&self.remoteaddr).context("bad remote address")?;
        Ok(())
    }

    /// The session-layer view of this configuration.
    pub fn session_config(&self) -> anyhow::Result<SessionConfig> {
        let key = sluice_net::stretch_key(&self.key);
        let block = sluice_net::new_block_crypt(&self.crypt, &key)
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        Ok(SessionConfig {
            data_shards: self.datashard,
            parity_shards: self.parityshard,
            block,
            mtu: self.mtu,
            snd_wnd: self.sndwnd,
            rcv_wnd: self.rcvwnd,
            nodelay: self.nodelay != 0,
            interval: self.interval,
            resend: self.resend,
            nc: self.nc != 0,
            ack_nodelay: self.acknodelay,
            write_delay: false,
            rate_limit: self.ratelimit,
            stream: true,
        })
    }

    /// The multiplexer view of this configuration.
    pub fn mux_config(&self) -> MuxConfig {
        let interval = Duration::from_secs(self.keepalive.max(1));
        MuxConfig {
            version: self.smuxver,
            keep_alive_interval: interval,
            keep_alive_timeout: interval * 2,
            max_frame_size: self.framesize,
            max_receive_buffer: self.smuxbuf,
            max_stream_buffer: self.streambuf,
        }
    }

    /// 32-byte pad key for the QPP filter.
    pub fn qpp_key(&self) -> [u8; 32] {
        sluice_net::stretch_key(&self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_port_roundtrip() {
        for (host, min, max) in [("example.org", 1u16, 1u16), ("10.0.0.1", 29900, 29902)] {
            let rendered = if min == max {
                format!("{host}:{min}")
            } else {
                format!("{host}:{min}-{max}")
            };
            let parsed = parse_multi_port(&rendered).unwrap();
            assert_eq!(parsed.host, host);
            assert_eq!(parsed.min, min);
            assert_eq!(parsed.max, max);
        }
    }

    #[test]
    fn multi_port_boundaries() {
        assert!(parse_multi_port("host:0").is_err());
        assert!(parse_multi_port(":65536").is_err());
        assert!(parse_multi_port("host:200-100").is_err());
        assert!(parse_multi_port("no-port-at-all").is_err());
        assert!(parse_multi_port("host:65535").is_ok());
    }

    #[test]
    fn multi_port_choose_stays_in_range() {
        let mp = parse_multi_port("127.0.0.1:29900-29902").unwrap();
        let mut rng = rand::thread_rng();
        for _ in 0..64 {
            let addr = mp.choose(&mut rng);
            let port: u16 = addr.rsplit_once(':').unwrap().1.parse().unwrap();
            assert!((29900..=29902).contains(&port));
        }
    }

    fn base_flags() -> Flags {
        Flags::parse_from(["sluice"])
    }

    #[test]
    fn mode_presets() {
        let mut flags = base_flags();
        flags.mode = Some("fast3".into());
        let cfg = Config::resolve(flags).unwrap();
        assert_eq!((cfg.nodelay, cfg.interval, cfg.resend, cfg.nc), (1, 10, 2, 1));

        let mut flags = base_flags();
        flags.mode = Some("normal".into());
        let cfg = Config::resolve(flags).unwrap();
        assert_eq!((cfg.nodelay, cfg.interval, cfg.resend, cfg.nc), (0, 40, 2, 1));
    }

    #[test]
    fn manual_mode_honours_knobs() {
        let mut flags = base_flags();
        flags.mode = Some("manual".into());
        flags.nodelay = Some(1);
        flags.interval = Some(15);
        flags.resend = Some(3);
        flags.nc = Some(0);
        let cfg = Config::resolve(flags).unwrap();
        assert_eq!((cfg.nodelay, cfg.interval, cfg.resend, cfg.nc), (1, 15, 3, 0));
    }

    #[test]
    fn negative_ratelimit_clamps_to_zero() {
        let mut flags = base_flags();
        flags.ratelimit = Some(-1000);
        let cfg = Config::resolve(flags).unwrap();
        assert_eq!(cfg.ratelimit, 0);
    }

    #[test]
    fn oversized_mtu_rejected() {
        let mut flags = base_flags();
        flags.mtu = Some(1501);
        assert!(Config::resolve(flags).is_err());
    }

    #[test]
    fn bad_smux_version_rejected() {
        let mut flags = base_flags();
        flags.smuxver = Some(3);
        assert!(Config::resolve(flags).is_err());
    }

    #[test]
    fn tcp_flag_is_fatal() {
        let mut flags = base_flags();
        flags.tcp = true;
        assert!(Config::resolve(flags).is_err());
    }

    #[test]
    fn json_config_merges_under_flags() {
        let dir = std::env::temp_dir().join(format!("sluice-cfg-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");
        fs::write(
            &path,
            r#"{"listen": "127.0.0.1:4000", "crypt": "salsa20", "sndwnd": 256}"#,
        )
        .unwrap();

        let mut flags = base_flags();
        flags.config = Some(path.clone());
        flags.crypt = Some("aes".into());
        let cfg = Config::resolve(flags).unwrap();
        // Flag beats file; file beats default.
        assert_eq!(cfg.crypt, "aes");
        assert_eq!(cfg.listen, "127.0.0.1:4000");
        assert_eq!(cfg.sndwnd, 256);
        fs::remove_file(path).ok();
    }
}
