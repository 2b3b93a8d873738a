use bytes::{Buf, BufMut, BytesMut};

/// Fixed per-segment header cost on the wire.
pub const HEADER_LEN: usize = 24;

/// One KCP segment. Everything before `data` is serialised little-endian in
/// the field order below; the trailing book-keeping fields (`resendts`, `rto`,
/// `fastack`, `xmit`) never leave the sender.
#[derive(Default, Clone, Debug)]
pub struct Segment {
    pub conv: u32,
    pub cmd: u8,
    pub frg: u8,
    pub wnd: u16,
    pub ts: u32,
    pub sn: u32,
    pub una: u32,
    pub data: BytesMut,

    pub resendts: u32,
    pub rto: u32,
    pub fastack: u32,
    pub xmit: u32,
}

impl Segment {
    pub fn with_data(data: BytesMut) -> Self {
        Segment {
            data,
            ..Default::default()
        }
    }

    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.data.len()
    }

    /// Appends the wire form of this segment to `out`. The caller guarantees
    /// space; flush sizes its packets against the MTU before encoding.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.put_u32_le(self.conv);
        out.put_u8(self.cmd);
        out.put_u8(self.frg);
        out.put_u16_le(self.wnd);
        out.put_u32_le(self.ts);
        out.put_u32_le(self.sn);
        out.put_u32_le(self.una);
        out.put_u32_le(self.data.len() as u32);
        out.put_slice(&self.data);
    }
}

/// Reads the conversation id from the front of a raw segment stream.
pub fn conv_of(mut raw: &[u8]) -> u32 {
    debug_assert!(raw.len() >= HEADER_LEN);
    raw.get_u32_le()
}

/// Reads the sequence number of the first segment in a raw stream.
pub fn sn_of(raw: &[u8]) -> u32 {
    debug_assert!(raw.len() >= HEADER_LEN);
    (&raw[12..]).get_u32_le()
}

/// Reads the command byte of the first segment in a raw stream.
pub fn cmd_of(raw: &[u8]) -> u8 {
    debug_assert!(raw.len() >= HEADER_LEN);
    raw[4]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_little_endian() {
        let seg = Segment {
            conv: 0x0403_0201,
            cmd: 81,
            frg: 2,
            wnd: 0x0605,
            ts: 0x0A09_0807,
            sn: 0x0E0D_0C0B,
            una: 0x1211_100F,
            data: BytesMut::from(&b"xy"[..]),
            ..Default::default()
        };
        let mut out = Vec::new();
        seg.encode(&mut out);
        assert_eq!(out.len(), HEADER_LEN + 2);
        assert_eq!(&out[..4], &[1, 2, 3, 4]);
        assert_eq!(out[4], 81);
        assert_eq!(out[5], 2);
        assert_eq!(&out[6..8], &[5, 6]);
        assert_eq!(&out[8..12], &[7, 8, 9, 10]);
        assert_eq!(&out[12..16], &[0x0B, 0x0C, 0x0D, 0x0E]);
        assert_eq!(&out[16..20], &[0x0F, 0x10, 0x11, 0x12]);
        assert_eq!(&out[20..24], &[2, 0, 0, 0]);
        assert_eq!(&out[24..], b"xy");

        assert_eq!(conv_of(&out), 0x0403_0201);
        assert_eq!(sn_of(&out), 0x0E0D_0C0B);
        assert_eq!(cmd_of(&out), 81);
    }
}
