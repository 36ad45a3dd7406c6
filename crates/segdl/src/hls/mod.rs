mod resolver;

pub use m3u8_rs;
pub use resolver::*;

use reqwest::Url;

/// One `#EXT-X-STREAM-INF` entry of a master playlist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistVariant {
    /// Bits per second
    pub bandwidth: u64,
    /// `<width>x<height>`
    pub resolution: Option<String>,
    pub uri: Url,
}

/// Pick the variant with the highest bandwidth. On a tie the first declared
/// variant wins.
pub fn select_variant(variants: &[PlaylistVariant]) -> Option<&PlaylistVariant> {
    variants.iter().fold(None, |best, variant| match best {
        Some(best) if best.bandwidth >= variant.bandwidth => Some(best),
        _ => Some(variant),
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum EncryptionMethod {
    #[default]
    None,
    Aes128,
}

/// Encryption of every segment in a media playlist.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncryptionDescriptor {
    pub method: EncryptionMethod,
    /// Raw key bytes, fetched once for the whole playlist.
    pub key: Vec<u8>,
    /// Explicit IV. When absent the IV is derived from the segment index.
    pub iv: Option<[u8; 16]>,
}

impl EncryptionDescriptor {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn aes128(key: Vec<u8>, iv: Option<[u8; 16]>) -> Self {
        Self {
            method: EncryptionMethod::Aes128,
            key,
            iv,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.method != EncryptionMethod::None
    }
}

/// Result of resolving a playlist URL down to its media playlist.
#[derive(Debug, Clone)]
pub struct ResolvedPlaylist {
    /// Final media playlist location, after redirects.
    pub playlist_url: Url,
    /// The variant chosen from a master playlist, if there was one.
    pub variant: Option<PlaylistVariant>,
    /// Segment URLs in playlist order. The position is the segment index.
    pub segments: Vec<Url>,
    pub encryption: EncryptionDescriptor,
}

/// Parse an `IV=` attribute value into 16 big-endian bytes.
///
/// A leading `0x` / `0X` is dropped. Shorter values are zero-extended on the left.
pub fn parse_iv(iv: &str) -> Option<[u8; 16]> {
    let iv = iv
        .strip_prefix("0x")
        .or_else(|| iv.strip_prefix("0X"))
        .unwrap_or(iv);
    if iv.is_empty() || iv.len() > 32 || !iv.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }

    u128::from_str_radix(iv, 16).ok().map(u128::to_be_bytes)
}
