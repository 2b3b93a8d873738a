use std::sync::Arc;

use aes::cipher::{
    generic_array::GenericArray, BlockEncrypt, KeyInit, KeyIvInit, StreamCipher,
};
use aes::{Aes128, Aes192, Aes256};
use aes_gcm::{aead::AeadInPlace, Aes128Gcm};
use rand::{rngs::OsRng, RngCore};
use sha1::Sha1;

use crate::error::NetError;

/// Leading random bytes of every sealed datagram.
pub const NONCE_SIZE: usize = 16;
/// Bytes of CRC32 following the nonce.
pub const CRC_SIZE: usize = 4;
/// Total framing cost when a cipher is active.
pub const CRYPT_HEADER_SIZE: usize = NONCE_SIZE + CRC_SIZE;

/// The fixed initialisation vector shared by all stream-mode ciphers. Packet
/// uniqueness comes from the random nonce prefix, not the IV.
const INITIAL_VECTOR: [u8; 16] = [
    167, 115, 79, 156, 18, 172, 27, 1, 62, 228, 7, 100, 201, 17, 97, 218,
];

/// Capability consumed by the session layer: encrypt/decrypt one whole
/// datagram in place. Implementations are cheap to call per packet and hold
/// no per-packet state.
pub trait BlockCrypt: Send + Sync {
    /// Encrypts a sealed frame in place. `pkt` starts at the nonce. AEAD
    /// modes may append their tag, which is why the buffer is a `Vec`.
    fn encrypt(&self, pkt: &mut Vec<u8>);

    /// Decrypts in place and returns the length of the valid plaintext
    /// prefix (AEAD modes strip their tag). `Err` means authentication
    /// failed and the packet must be dropped.
    fn decrypt(&self, pkt: &mut [u8]) -> Result<usize, NetError>;

    /// Extra trailing bytes `encrypt` appends; the session subtracts this
    /// from the usable MTU.
    fn tail_overhead(&self) -> usize {
        0
    }
}

/// Stretches a pre-shared passphrase into cipher key material.
pub fn stretch_key(pass: &str) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha1>(pass.as_bytes(), b"kcp-go", 4096, &mut key);
    key
}

/// Resolves a cipher name to a [`BlockCrypt`], or `None` for `"null"` which
/// disables the crypto frame entirely (the 20-byte header disappears from
/// the wire). Unknown names are a startup error.
pub fn new_block_crypt(
    name: &str,
    key: &[u8; 32],
) -> Result<Option<Arc<dyn BlockCrypt>>, NetError> {
    let crypt: Arc<dyn BlockCrypt> = match name {
        "null" => return Ok(None),
        "none" => Arc::new(NoneCrypt),
        "aes" | "aes-256" => Arc::new(AesCfbCrypt::Aes256(key_array::<32>(key))),
        "aes-192" => Arc::new(AesCfbCrypt::Aes192(key_array::<24>(key))),
        "aes-128" => Arc::new(AesCfbCrypt::Aes128(key_array::<16>(key))),
        "aes-128-gcm" => Arc::new(AesGcmCrypt::new(key_array::<16>(key))),
        "salsa20" => Arc::new(Salsa20Crypt(key_array::<32>(key))),
        "chacha20" => Arc::new(ChaCha20Crypt(key_array::<32>(key))),
        "xor" => Arc::new(XorCrypt(*key)),
        other => return Err(NetError::UnknownCipher(other.to_string())),
    };
    Ok(Some(crypt))
}

fn key_array<const N: usize>(key: &[u8; 32]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&key[..N]);
    out
}

/// AES in CFB mode over the whole frame, nonce included.
enum AesCfbCrypt {
    Aes128([u8; 16]),
    Aes192([u8; 24]),
    Aes256([u8; 32]),
}

impl BlockCrypt for AesCfbCrypt {
    fn encrypt(&self, pkt: &mut Vec<u8>) {
        use cfb_mode::cipher::AsyncStreamCipher;
        let iv = GenericArray::from_slice(&INITIAL_VECTOR);
        match self {
            AesCfbCrypt::Aes128(k) => {
                cfb_mode::Encryptor::<Aes128>::new(k.into(), iv).encrypt(pkt)
            }
            AesCfbCrypt::Aes192(k) => {
                cfb_mode::Encryptor::<Aes192>::new(k.into(), iv).encrypt(pkt)
            }
            AesCfbCrypt::Aes256(k) => {
                cfb_mode::Encryptor::<Aes256>::new(k.into(), iv).encrypt(pkt)
            }
        }
    }

    fn decrypt(&self, pkt: &mut [u8]) -> Result<usize, NetError> {
        use cfb_mode::cipher::AsyncStreamCipher;
        let iv = GenericArray::from_slice(&INITIAL_VECTOR);
        match self {
            AesCfbCrypt::Aes128(k) => {
                cfb_mode::Decryptor::<Aes128>::new(k.into(), iv).decrypt(pkt)
            }
            AesCfbCrypt::Aes192(k) => {
                cfb_mode::Decryptor::<Aes192>::new(k.into(), iv).decrypt(pkt)
            }
            AesCfbCrypt::Aes256(k) => {
                cfb_mode::Decryptor::<Aes256>::new(k.into(), iv).decrypt(pkt)
            }
        }
        Ok(pkt.len())
    }
}

/// AES-128-GCM. The nonce region rides in clear (it is random keystream
/// anyway) and doubles as the AEAD nonce; everything after it is encrypted
/// and authenticated, with the 16-byte tag appended to the datagram.
struct AesGcmCrypt {
    aead: Aes128Gcm,
}

impl AesGcmCrypt {
    const TAG_SIZE: usize = 16;

    fn new(key: [u8; 16]) -> Self {
        AesGcmCrypt {
            aead: Aes128Gcm::new(GenericArray::from_slice(&key)),
        }
    }
}

impl BlockCrypt for AesGcmCrypt {
    fn encrypt(&self, pkt: &mut Vec<u8>) {
        if pkt.len() < NONCE_SIZE {
            return;
        }
        let (nonce, body) = pkt.split_at_mut(NONCE_SIZE);
        let nonce = GenericArray::from_slice(&nonce[..12]);
        let tag = self
            .aead
            .encrypt_in_place_detached(nonce, &[], body)
            .expect("gcm sealing is infallible for in-range lengths");
        pkt.extend_from_slice(&tag);
    }

    fn decrypt(&self, pkt: &mut [u8]) -> Result<usize, NetError> {
        if pkt.len() < NONCE_SIZE + Self::TAG_SIZE {
            return Err(NetError::AuthFailed);
        }
        let body_len = pkt.len() - Self::TAG_SIZE;
        let (frame, tag) = pkt.split_at_mut(body_len);
        let (nonce, body) = frame.split_at_mut(NONCE_SIZE);
        let nonce_arr = GenericArray::from_slice(&nonce[..12]);
        let tag = GenericArray::from_slice(tag);
        self.aead
            .decrypt_in_place_detached(nonce_arr, &[], body, tag)
            .map_err(|_| NetError::AuthFailed)?;
        Ok(body_len)
    }

    fn tail_overhead(&self) -> usize {
        Self::TAG_SIZE
    }
}

/// Salsa20 keyed per packet by the first 8 nonce bytes, which stay in clear.
struct Salsa20Crypt([u8; 32]);

impl Salsa20Crypt {
    fn apply(&self, pkt: &mut [u8]) {
        if pkt.len() <= 8 {
            return;
        }
        let (head, body) = pkt.split_at_mut(8);
        let nonce = GenericArray::from_slice(head);
        let mut cipher = salsa20::Salsa20::new(GenericArray::from_slice(&self.0), nonce);
        cipher.apply_keystream(body);
    }
}

impl BlockCrypt for Salsa20Crypt {
    fn encrypt(&self, pkt: &mut Vec<u8>) {
        self.apply(pkt);
    }

    fn decrypt(&self, pkt: &mut [u8]) -> Result<usize, NetError> {
        self.apply(pkt);
        Ok(pkt.len())
    }
}

/// ChaCha20 keyed per packet by the first 12 nonce bytes, which stay in clear.
struct ChaCha20Crypt([u8; 32]);

impl ChaCha20Crypt {
    fn apply(&self, pkt: &mut [u8]) {
        if pkt.len() <= 12 {
            return;
        }
        let (head, body) = pkt.split_at_mut(12);
        let nonce = GenericArray::from_slice(head);
        let mut cipher = chacha20::ChaCha20::new(GenericArray::from_slice(&self.0), nonce);
        cipher.apply_keystream(body);
    }
}

impl BlockCrypt for ChaCha20Crypt {
    fn encrypt(&self, pkt: &mut Vec<u8>) {
        self.apply(pkt);
    }

    fn decrypt(&self, pkt: &mut [u8]) -> Result<usize, NetError> {
        self.apply(pkt);
        Ok(pkt.len())
    }
}

/// Repeating-key XOR; obfuscation only.
struct XorCrypt([u8; 32]);

impl XorCrypt {
    fn apply(&self, pkt: &mut [u8]) {
        for (i, b) in pkt.iter_mut().enumerate() {
            *b ^= self.0[i % 32];
        }
    }
}

impl BlockCrypt for XorCrypt {
    fn encrypt(&self, pkt: &mut Vec<u8>) {
        self.apply(pkt);
    }

    fn decrypt(&self, pkt: &mut [u8]) -> Result<usize, NetError> {
        self.apply(pkt);
        Ok(pkt.len())
    }
}

/// Keeps the frame (nonce + CRC) but applies no primitive. The key is still
/// consumed at configuration time so both ends agree on the layout.
struct NoneCrypt;

impl BlockCrypt for NoneCrypt {
    fn encrypt(&self, _pkt: &mut Vec<u8>) {}

    fn decrypt(&self, pkt: &mut [u8]) -> Result<usize, NetError> {
        Ok(pkt.len())
    }
}

/// Deterministic, keyed nonce source: an AES-128 state block re-encrypted
/// per packet, reseeded from OS entropy whenever the leading state byte
/// lands on zero. Cheap, unpredictable, and free of syscalls on the hot
/// path.
pub struct NonceGenerator {
    state: [u8; 16],
    cipher: Aes128,
}

impl NonceGenerator {
    pub fn new() -> Self {
        let mut key = [0u8; 16];
        let mut state = [0u8; 16];
        OsRng.fill_bytes(&mut key);
        OsRng.fill_bytes(&mut state);
        NonceGenerator {
            state,
            cipher: Aes128::new(GenericArray::from_slice(&key)),
        }
    }

    pub fn fill(&mut self, out: &mut [u8]) {
        if self.state[0] == 0 {
            OsRng.fill_bytes(&mut self.state);
        }
        let block = GenericArray::from_mut_slice(&mut self.state);
        self.cipher.encrypt_block(block);
        let n = out.len().min(16);
        out[..n].copy_from_slice(&self.state[..n]);
    }
}

impl Default for NonceGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(name: &str) {
        let key = stretch_key("it's a secret");
        let crypt = new_block_crypt(name, &key).unwrap().unwrap();
        let mut nonce = NonceGenerator::new();

        let payload = b"the quick brown fox jumps over the lazy dog";
        let mut pkt = vec![0u8; CRYPT_HEADER_SIZE + payload.len()];
        nonce.fill(&mut pkt[..NONCE_SIZE]);
        pkt[CRYPT_HEADER_SIZE..].copy_from_slice(payload);
        let original = pkt.clone();

        crypt.encrypt(&mut pkt);
        if name != "none" {
            assert_ne!(&pkt[CRYPT_HEADER_SIZE..CRYPT_HEADER_SIZE + payload.len()], payload);
        }

        let valid = crypt.decrypt(&mut pkt).unwrap();
        assert_eq!(&pkt[..valid], &original[..]);
    }

    #[test]
    fn all_ciphers_roundtrip() {
        for name in ["aes", "aes-128", "aes-192", "aes-128-gcm", "salsa20", "chacha20", "xor", "none"] {
            roundtrip(name);
        }
    }

    #[test]
    fn null_disables_the_frame() {
        let key = stretch_key("x");
        assert!(new_block_crypt("null", &key).unwrap().is_none());
    }

    #[test]
    fn unknown_cipher_rejected() {
        let key = stretch_key("x");
        assert!(matches!(
            new_block_crypt("vigenere", &key),
            Err(NetError::UnknownCipher(_))
        ));
    }

    #[test]
    fn gcm_rejects_tampering() {
        let key = stretch_key("k");
        let crypt = new_block_crypt("aes-128-gcm", &key).unwrap().unwrap();
        let mut pkt = vec![0u8; 64];
        NonceGenerator::new().fill(&mut pkt[..NONCE_SIZE]);
        crypt.encrypt(&mut pkt);
        pkt[40] ^= 0x80;
        assert!(crypt.decrypt(&mut pkt).is_err());
    }

    #[test]
    fn key_stretch_is_deterministic() {
        assert_eq!(stretch_key("secret"), stretch_key("secret"));
        assert_ne!(stretch_key("secret"), stretch_key("Secret"));
    }

    #[test]
    fn nonce_stream_does_not_repeat_quickly() {
        let mut gen = NonceGenerator::new();
        let mut a = [0u8; 16];
        let mut b = [0u8; 16];
        gen.fill(&mut a);
        gen.fill(&mut b);
        assert_ne!(a, b);
    }
}
