use std::{collections::HashMap, ops::Deref, str::FromStr};

use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue},
    Client, ClientBuilder, IntoUrl, RequestBuilder, Response,
};

use crate::{
    config::{DownloadConfig, DEFAULT_USER_AGENT},
    error::{SegdlError, SegdlResult},
};

/// Shared, immutable HTTP client configuration.
///
/// Per-job headers are applied on each request instead of mutating the client.
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    pub fn new(builder: ClientBuilder) -> SegdlResult<Self> {
        let client = builder.build()?;
        Ok(Self { client })
    }

    pub fn from_config(config: &DownloadConfig) -> SegdlResult<Self> {
        Self::new(Client::builder().user_agent(config.user_agent.as_str()))
    }

    /// A GET request carrying the given job headers.
    pub fn get_with<U>(&self, url: U, headers: &HeaderMap) -> RequestBuilder
    where
        U: IntoUrl,
    {
        self.client.get(url).headers(headers.clone())
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        let client = Client::builder()
            .user_agent(DEFAULT_USER_AGENT)
            .build()
            .unwrap_or_default();

        Self { client }
    }
}

impl Deref for HttpClient {
    type Target = Client;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

/// Turn a non-2xx response into [SegdlError::HttpError].
pub fn error_for_status(response: Response) -> SegdlResult<Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(SegdlError::HttpError(status))
    }
}

/// Convert job headers into a [HeaderMap].
pub fn header_map(headers: &HashMap<String, String>) -> SegdlResult<HeaderMap> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (key, value) in headers {
        let name = HeaderName::from_str(key.trim())
            .map_err(|_| SegdlError::InvalidHeader(key.clone()))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|_| SegdlError::InvalidHeader(format!("{key}: {value}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// Parse a `Name: value` header line.
pub fn parse_header_line(line: &str) -> SegdlResult<(String, String)> {
    let (key, value) = line
        .split_once(':')
        .ok_or_else(|| SegdlError::InvalidHeader(line.to_string()))?;
    Ok((key.trim().to_string(), value.trim().to_string()))
}
