//! HTTP transport for sending events.

use crate::config::Config;
use crate::error::TransportError;
use crate::Error;
use async_trait::async_trait;
use tracing::{debug, warn};

/// Performs one request against the CoolaData service.
///
/// `path` is relative to the endpoint. With `data` the request is a form
/// POST carrying `data=<json>`, without it a GET.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, path: &str, data: Option<&str>) -> Result<String, TransportError>;
}

/// HTTP transport for sending events to the CoolaData API.
#[derive(Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    max_single_request_retries: u32,
}

impl HttpTransport {
    /// Create a new HTTP transport talking to `endpoint_url`.
    pub fn new(endpoint_url: &str, config: &Config) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(config.publish_interval())
            .build()?;

        let mut base_url = endpoint_url.to_string();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }

        Ok(Self {
            client,
            base_url,
            max_single_request_retries: config.max_single_request_retries(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn read_response(response: reqwest::Response) -> Result<String, TransportError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, body = %body, "API request failed");
            let description = match status.canonical_reason() {
                Some(reason) => reason.to_string(),
                None if !body.is_empty() => body,
                None => "Unknown error".into(),
            };
            return Err(TransportError::Status {
                code: status.as_u16(),
                description,
            });
        }

        response.text().await.map_err(|e| TransportError::Network {
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, path: &str, data: Option<&str>) -> Result<String, TransportError> {
        let url = self.url(path);
        let mut connect_retries = 0;

        loop {
            let request = match data {
                Some(json) => self.client.post(&url).form(&[("data", json)]),
                None => self.client.get(&url),
            };

            debug!(url = %url, post = data.is_some(), "sending request");

            match request.send().await {
                Ok(response) => return Self::read_response(response).await,
                Err(e) if e.is_timeout() => return Err(TransportError::Timeout),
                Err(e) if e.is_connect() && connect_retries < self.max_single_request_retries => {
                    connect_retries += 1;
                    debug!(error = %e, retry = connect_retries, "connection failed, retrying");
                }
                Err(e) => {
                    return Err(TransportError::Network {
                        message: e.to_string(),
                    })
                }
            }
        }
    }
}
