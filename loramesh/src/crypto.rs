//! AES/CMAC backend and the LoRaWAN frame constructions built on it.
//!
//! ## Block layouts
//!
//! ```text
//! A_i = 0x01 || 0x00 x4 || dir || DevAddr (LE) || FCnt (LE) || 0x00 || i
//! B0  = 0x49 || 0x00 x4 || dir || DevAddr (LE) || FCnt (LE) || 0x00 || len(msg)
//! ```
//!
//! Payload encryption XORs the payload with `AES(key, A_i)` for i = 1..;
//! the same call decrypts. The data-frame MIC is the first four bytes of
//! `CMAC(NwkSKey, B0 || msg)`.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::{Cmac, Mac};

use crate::traits::Cipher;
use crate::types::{AesKey, DevAddr, SessionKeys, RADIO_MAX_FRAME};

/// Link direction, as encoded in the A and B0 blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Up = 0,
    Down = 1,
}

/// Software AES-128 and AES-CMAC.
#[derive(Clone, Copy, Debug, Default)]
pub struct AesCmacCipher;

impl AesCmacCipher {
    pub const fn new() -> Self {
        Self
    }
}

impl Cipher for AesCmacCipher {
    fn encrypt_block(&self, key: &AesKey, block: &mut [u8; 16]) {
        let aes = Aes128::new(GenericArray::from_slice(key));
        aes.encrypt_block(GenericArray::from_mut_slice(block));
    }

    fn decrypt_block(&self, key: &AesKey, block: &mut [u8; 16]) {
        let aes = Aes128::new(GenericArray::from_slice(key));
        aes.decrypt_block(GenericArray::from_mut_slice(block));
    }

    fn cmac(&self, key: &AesKey, data: &[u8]) -> [u8; 16] {
        let mut mac = <Cmac<Aes128> as KeyInit>::new(GenericArray::from_slice(key));
        mac.update(data);
        let tag = mac.finalize().into_bytes();
        let mut out = [0u8; 16];
        out.copy_from_slice(&tag);
        out
    }
}

fn frame_block(prefix: u8, dir: Direction, addr: DevAddr, fcnt: u32, last: u8) -> [u8; 16] {
    let mut b = [0u8; 16];
    b[0] = prefix;
    b[5] = dir as u8;
    b[6..10].copy_from_slice(&addr.to_le_bytes());
    b[10..14].copy_from_slice(&fcnt.to_le_bytes());
    b[15] = last;
    b
}

/// Encrypt or decrypt a frame payload in place.
pub fn payload_crypt<C: Cipher>(
    cipher: &C,
    key: &AesKey,
    addr: DevAddr,
    dir: Direction,
    fcnt: u32,
    data: &mut [u8],
) {
    for (i, chunk) in data.chunks_mut(16).enumerate() {
        let mut keystream = frame_block(0x01, dir, addr, fcnt, (i + 1) as u8);
        cipher.encrypt_block(key, &mut keystream);
        for (byte, k) in chunk.iter_mut().zip(keystream.iter()) {
            *byte ^= k;
        }
    }
}

/// MIC over a data frame (MHDR through end of payload).
pub fn compute_mic<C: Cipher>(
    cipher: &C,
    key: &AesKey,
    addr: DevAddr,
    dir: Direction,
    fcnt: u32,
    msg: &[u8],
) -> u32 {
    let mut buf: heapless::Vec<u8, { 16 + RADIO_MAX_FRAME }> = heapless::Vec::new();
    let b0 = frame_block(0x49, dir, addr, fcnt, msg.len() as u8);
    // Frames are bounded by the PHY payload, far below the buffer size.
    let _ = buf.extend_from_slice(&b0);
    let _ = buf.extend_from_slice(msg);
    mic_from_tag(&cipher.cmac(key, &buf))
}

/// MIC keyed directly over `msg` (join frames and mesh control frames).
pub fn compute_plain_mic<C: Cipher>(cipher: &C, key: &AesKey, msg: &[u8]) -> u32 {
    mic_from_tag(&cipher.cmac(key, msg))
}

fn mic_from_tag(tag: &[u8; 16]) -> u32 {
    u32::from_le_bytes([tag[0], tag[1], tag[2], tag[3]])
}

/// Network-side join-accept encryption (AES decrypt per block).
pub fn join_accept_encrypt<C: Cipher>(cipher: &C, app_key: &AesKey, data: &mut [u8]) {
    for chunk in data.chunks_exact_mut(16) {
        let mut block = [0u8; 16];
        block.copy_from_slice(chunk);
        cipher.decrypt_block(app_key, &mut block);
        chunk.copy_from_slice(&block);
    }
}

/// Device-side join-accept decryption (AES encrypt per block).
pub fn join_accept_decrypt<C: Cipher>(cipher: &C, app_key: &AesKey, data: &mut [u8]) {
    for chunk in data.chunks_exact_mut(16) {
        let mut block = [0u8; 16];
        block.copy_from_slice(chunk);
        cipher.encrypt_block(app_key, &mut block);
        chunk.copy_from_slice(&block);
    }
}

/// Derive NwkSKey and AppSKey after a join accept.
pub fn derive_session_keys<C: Cipher>(
    cipher: &C,
    app_key: &AesKey,
    app_nonce: u32,
    net_id: u32,
    dev_nonce: u16,
) -> SessionKeys {
    let derive = |prefix: u8| {
        let mut block = [0u8; 16];
        block[0] = prefix;
        block[1..4].copy_from_slice(&app_nonce.to_le_bytes()[..3]);
        block[4..7].copy_from_slice(&net_id.to_le_bytes()[..3]);
        block[7..9].copy_from_slice(&dev_nonce.to_le_bytes());
        cipher.encrypt_block(app_key, &mut block);
        block
    };
    SessionKeys::new(derive(0x01), derive(0x02))
}
