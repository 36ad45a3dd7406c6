use std::time::Duration;

use bytes::Bytes;
use m3u8_rs::{KeyMethod, MasterPlaylist, MediaPlaylist, Playlist};
use reqwest::{header::HeaderMap, Url};

use super::{
    parse_iv, select_variant, EncryptionDescriptor, PlaylistVariant, ResolvedPlaylist,
};
use crate::{
    error::{SegdlError, SegdlResult},
    util::http::{error_for_status, HttpClient},
};

/// Master playlists pointing at other master playlists are followed at most this deep.
const MAX_PLAYLIST_DEPTH: usize = 8;

/// Turns a playlist URL into an ordered segment list and its encryption.
#[derive(Clone)]
pub struct PlaylistResolver {
    client: HttpClient,
    manifest_timeout: Duration,
    key_timeout: Duration,
}

impl PlaylistResolver {
    pub fn new(client: HttpClient) -> Self {
        Self {
            client,
            manifest_timeout: Duration::from_secs(30),
            key_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeouts(mut self, manifest_timeout: Duration, key_timeout: Duration) -> Self {
        self.manifest_timeout = manifest_timeout;
        self.key_timeout = key_timeout;
        self
    }

    pub async fn resolve(&self, url: &str, headers: &HeaderMap) -> SegdlResult<ResolvedPlaylist> {
        let mut url = Url::parse(url).map_err(|e| SegdlError::PlaylistFetch {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let mut variant = None;

        for _ in 0..MAX_PLAYLIST_DEPTH {
            log::info!("Start fetching M3U8 file.");
            let (playlist_url, body) = self.fetch_manifest(url.clone(), headers).await?;
            log::info!("M3U8 file fetched.");

            let playlist = m3u8_rs::parse_playlist_res(&body).map_err(|_| {
                SegdlError::PlaylistParse(format!("{playlist_url} is not a valid m3u8 playlist"))
            })?;

            match playlist {
                Playlist::MasterPlaylist(pl) => {
                    log::info!("Master playlist input detected. Auto selecting best quality streams.");
                    let variants = master_variants(&pl, &playlist_url)?;
                    let best = select_variant(&variants)
                        .cloned()
                        .ok_or_else(|| SegdlError::NoVariantFound(playlist_url.to_string()))?;

                    log::info!(
                        "Best stream: {url}; Bandwidth: {bandwidth}; Resolution: {resolution}",
                        url = best.uri,
                        bandwidth = best.bandwidth,
                        resolution = best.resolution.as_deref().unwrap_or("unknown"),
                    );
                    url = best.uri.clone();
                    variant = Some(best);
                }
                Playlist::MediaPlaylist(pl) => {
                    let segments = media_segments(&pl, &playlist_url)?;
                    let encryption = self.encryption(&pl, &playlist_url, headers).await?;
                    return Ok(ResolvedPlaylist {
                        playlist_url,
                        variant,
                        segments,
                        encryption,
                    });
                }
            }
        }

        Err(SegdlError::PlaylistParse(format!(
            "master playlists nested deeper than {MAX_PLAYLIST_DEPTH} levels at {url}"
        )))
    }

    /// Fetch a manifest and return the URL it was served from.
    async fn fetch_manifest(&self, url: Url, headers: &HeaderMap) -> SegdlResult<(Url, Bytes)> {
        let fetch_error = |reason: String| SegdlError::PlaylistFetch {
            url: url.to_string(),
            reason,
        };

        let response = self
            .client
            .get_with(url.clone(), headers)
            .timeout(self.manifest_timeout)
            .send()
            .await
            .map_err(|e| fetch_error(e.to_string()))?;
        let response = error_for_status(response).map_err(|e| fetch_error(e.to_string()))?;

        let playlist_url = response.url().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| fetch_error(e.to_string()))?;
        Ok((playlist_url, body))
    }

    async fn encryption(
        &self,
        playlist: &MediaPlaylist,
        playlist_url: &Url,
        headers: &HeaderMap,
    ) -> SegdlResult<EncryptionDescriptor> {
        let Some(key) = playlist.segments.iter().find_map(|s| s.key.as_ref()) else {
            return Ok(EncryptionDescriptor::none());
        };

        match &key.method {
            KeyMethod::None => Ok(EncryptionDescriptor::none()),
            KeyMethod::AES128 => {
                let uri = key.uri.as_deref().ok_or_else(|| {
                    SegdlError::PlaylistParse("URI field in AES-128 key is missing".to_string())
                })?;
                let key_url = join_uri(playlist_url, uri.trim_matches(|c| c == '"' || c == '\''))?;

                let iv = match &key.iv {
                    Some(iv) => Some(parse_iv(iv).ok_or_else(|| {
                        SegdlError::PlaylistParse(format!("Invalid IV attribute: {iv}"))
                    })?),
                    None => None,
                };

                let key_bytes = self.fetch_key(key_url, headers).await?;
                tracing::debug!(
                    "AES-128 key fetched ({} bytes), IV: {}",
                    key_bytes.len(),
                    iv.map(hex::encode).unwrap_or_else(|| "by sequence".to_string())
                );
                Ok(EncryptionDescriptor::aes128(key_bytes, iv))
            }
            KeyMethod::SampleAES => Err(SegdlError::PlaylistParse(
                "SAMPLE-AES encryption is not supported".to_string(),
            )),
            KeyMethod::Other(name) => Err(SegdlError::PlaylistParse(format!(
                "Unknown key method: {name}"
            ))),
        }
    }

    async fn fetch_key(&self, key_url: Url, headers: &HeaderMap) -> SegdlResult<Vec<u8>> {
        let fetch_error = |reason: String| SegdlError::PlaylistFetch {
            url: key_url.to_string(),
            reason,
        };

        let response = self
            .client
            .get_with(key_url.clone(), headers)
            .timeout(self.key_timeout)
            .send()
            .await
            .map_err(|e| fetch_error(e.to_string()))?;
        let response = error_for_status(response).map_err(|e| fetch_error(e.to_string()))?;

        let key = response
            .bytes()
            .await
            .map_err(|e| fetch_error(e.to_string()))?;
        if key.is_empty() {
            return Err(fetch_error("empty key".to_string()));
        }
        Ok(key.to_vec())
    }
}

fn join_uri(base: &Url, uri: &str) -> SegdlResult<Url> {
    base.join(uri)
        .map_err(|e| SegdlError::PlaylistParse(format!("Invalid URI {uri:?} in {base}: {e}")))
}

fn master_variants(playlist: &MasterPlaylist, base: &Url) -> SegdlResult<Vec<PlaylistVariant>> {
    playlist
        .variants
        .iter()
        .filter(|v| !v.is_i_frame)
        .map(|v| {
            Ok(PlaylistVariant {
                bandwidth: v.bandwidth,
                resolution: v.resolution.as_ref().map(|r| format!("{}x{}", r.width, r.height)),
                uri: join_uri(base, v.uri.trim())?,
            })
        })
        .collect()
}

fn media_segments(playlist: &MediaPlaylist, base: &Url) -> SegdlResult<Vec<Url>> {
    if playlist.segments.is_empty() {
        return Err(SegdlError::PlaylistParse(format!(
            "{base} contains no segments"
        )));
    }

    playlist
        .segments
        .iter()
        .map(|segment| join_uri(base, segment.uri.trim()))
        .collect()
}
