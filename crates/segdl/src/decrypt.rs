use aes::cipher::{
    block_padding::{NoPadding, Pkcs7, RawPadding},
    BlockDecryptMut, KeyIvInit,
};

use crate::error::{SegdlError, SegdlResult};

const BLOCK_SIZE: usize = 16;

/// IV of a segment: the explicit IV when the playlist declares one, otherwise
/// the segment index as a 16-byte big-endian integer.
pub fn segment_iv(explicit_iv: Option<[u8; 16]>, index: u64) -> [u8; 16] {
    explicit_iv.unwrap_or_else(|| (index as u128).to_be_bytes())
}

/// Decrypt one AES-128-CBC segment.
///
/// PKCS7 padding is stripped when it is valid. Data without valid padding is
/// returned as decrypted.
pub fn decrypt(data: &[u8], key: &[u8], iv: Option<[u8; 16]>, index: u64) -> SegdlResult<Vec<u8>> {
    let decryption_error = |reason: String| SegdlError::Decryption { index, reason };

    let iv = segment_iv(iv, index);
    let decryptor = cbc::Decryptor::<aes::Aes128>::new_from_slices(key, &iv)
        .map_err(|_| decryption_error(format!("invalid AES-128 key length {}", key.len())))?;

    if data.len() % BLOCK_SIZE != 0 {
        return Err(decryption_error(format!(
            "ciphertext length {} is not a multiple of {BLOCK_SIZE}",
            data.len()
        )));
    }

    let mut plain = decryptor
        .decrypt_padded_vec_mut::<NoPadding>(data)
        .map_err(|e| decryption_error(e.to_string()))?;
    let len = unpadded_len(&plain);
    plain.truncate(len);
    Ok(plain)
}

/// Length of `data` with PKCS7 padding removed, or the full length when the
/// last block is not validly padded.
fn unpadded_len(data: &[u8]) -> usize {
    if data.len() < BLOCK_SIZE {
        return data.len();
    }

    let last_block = &data[data.len() - BLOCK_SIZE..];
    match Pkcs7::raw_unpad(last_block) {
        Ok(rest) => data.len() - BLOCK_SIZE + rest.len(),
        Err(_) => {
            tracing::debug!("Segment is not PKCS7 padded, keeping decrypted data as is.");
            data.len()
        }
    }
}

/// Decryptor bound to the key material of one job.
#[derive(Clone)]
pub struct SegmentDecryptor {
    key: std::sync::Arc<Vec<u8>>,
    iv: Option<[u8; 16]>,
}

impl SegmentDecryptor {
    pub fn new(key: Vec<u8>, iv: Option<[u8; 16]>) -> Self {
        Self {
            key: std::sync::Arc::new(key),
            iv,
        }
    }

    /// Decrypt on the blocking pool.
    pub async fn decrypt(&self, data: bytes::Bytes, index: u64) -> SegdlResult<Vec<u8>> {
        let key = self.key.clone();
        let iv = self.iv;
        tokio::task::spawn_blocking(move || decrypt(&data, &key, iv, index))
            .await
            .map_err(|e| SegdlError::Decryption {
                index,
                reason: format!("decryption task failed: {e}"),
            })?
    }
}
