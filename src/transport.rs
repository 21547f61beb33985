use std::io::Read;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};

use crate::domain::ArchiveIdentifier;
use crate::error::PreloadError;

/// Streaming body of a successful GET.
pub struct RemoteBody {
    pub content_length: Option<u64>,
    pub reader: Box<dyn Read + Send>,
}

pub trait Transport: Send + Sync {
    /// Issues a GET. Non-success responses must be reported as errors.
    fn get(&self, uri: &str) -> Result<RemoteBody, PreloadError>;
}

/// `{endpoint}/records/{record}/files/{filename}`
pub fn record_file_uri(endpoint: &str, id: &ArchiveIdentifier) -> String {
    format!(
        "{}/records/{}/files/{}",
        endpoint.trim_end_matches('/'),
        id.record(),
        id.filename()
    )
}

#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, PreloadError> {
        Self::with_timeouts(Duration::from_secs(30), None)
    }

    /// Read timeouts apply to the whole body, so large archives usually
    /// need `None` there and only a connect timeout.
    pub fn with_timeouts(
        connect: Duration,
        read: Option<Duration>,
    ) -> Result<Self, PreloadError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("zenodo-preload/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| PreloadError::Transport(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(connect)
            .timeout(read)
            .build()
            .map_err(|err| PreloadError::Transport(err.to_string()))?;
        Ok(Self { client })
    }

    fn handle_status(
        response: reqwest::blocking::Response,
    ) -> Result<reqwest::blocking::Response, PreloadError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .status()
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string();
        Err(PreloadError::TransportStatus { status, message })
    }
}

impl Transport for HttpTransport {
    fn get(&self, uri: &str) -> Result<RemoteBody, PreloadError> {
        let response = self
            .client
            .get(uri)
            .send()
            .map_err(|err| PreloadError::Transport(err.to_string()))?;
        let response = Self::handle_status(response)?;
        Ok(RemoteBody {
            content_length: response.content_length(),
            reader: Box::new(response),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_from_identifier() {
        let id: ArchiveIdentifier = "1234567/test.zip".parse().unwrap();
        assert_eq!(
            record_file_uri("https://zenodo.org/", &id),
            "https://zenodo.org/records/1234567/files/test.zip"
        );
    }
}
