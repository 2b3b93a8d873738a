use bytes::{Buf, BufMut};

/// `version | cmd | length | sid`, little-endian.
pub const HEADER_SIZE: usize = 8;

pub const CMD_SYN: u8 = 0;
pub const CMD_FIN: u8 = 1;
pub const CMD_PSH: u8 = 2;
pub const CMD_NOP: u8 = 3;
/// Version 2 only: per-stream window update `consumed:u32 | window:u32`.
pub const CMD_UPD: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub cmd: u8,
    pub length: u16,
    pub sid: u32,
}

impl Header {
    pub fn decode(mut raw: &[u8]) -> Header {
        debug_assert!(raw.len() >= HEADER_SIZE);
        Header {
            version: raw.get_u8(),
            cmd: raw.get_u8(),
            length: raw.get_u16_le(),
            sid: raw.get_u32_le(),
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.put_u8(self.version);
        out.put_u8(self.cmd);
        out.put_u16_le(self.length);
        out.put_u32_le(self.sid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        let hdr = Header {
            version: 2,
            cmd: CMD_PSH,
            length: 0x0201,
            sid: 0x06050403,
        };
        let mut out = Vec::new();
        hdr.encode(&mut out);
        assert_eq!(out, vec![2, 2, 1, 2, 3, 4, 5, 6]);
        assert_eq!(Header::decode(&out), hdr);
    }
}
