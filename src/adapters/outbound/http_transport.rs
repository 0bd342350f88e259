//! HTTP Push Transport
//!
//! Implements TransportManager over reqwest. A push transport buffers what
//! is written and POSTs it to `{sync_url}/push?nodeId=<local>` when the
//! response is read; the acknowledgement comes back as the response body.

use crate::domain::entities::Node;
use crate::domain::errors::TransportError;
use crate::domain::ports::{OutgoingTransport, TransportManager};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;

/// Configuration for HTTP transports.
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(300),
        }
    }
}

pub struct HttpTransportManager {
    client: reqwest::Client,
}

impl HttpTransportManager {
    pub fn new(config: HttpTransportConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.read_timeout)
            .build()?;
        Ok(Self { client })
    }

    pub fn push_url(remote: &Node, local: &Node) -> String {
        format!(
            "{}/push?nodeId={}",
            remote.sync_url.trim_end_matches('/'),
            local.node_id
        )
    }
}

#[async_trait]
impl TransportManager for HttpTransportManager {
    async fn open_push(
        &self,
        remote: &Node,
        local: &Node,
    ) -> Result<Box<dyn OutgoingTransport>, TransportError> {
        if remote.sync_url.is_empty() {
            return Err(TransportError::ConnectionRefused(format!(
                "{} has no sync url",
                remote.node_id
            )));
        }
        Ok(Box::new(HttpPushTransport {
            client: self.client.clone(),
            url: Self::push_url(remote, local),
            body: String::new(),
            closed: false,
        }))
    }
}

pub struct HttpPushTransport {
    client: reqwest::Client,
    url: String,
    body: String,
    closed: bool,
}

impl HttpPushTransport {
    fn map_status(&self, status: StatusCode) -> TransportError {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                TransportError::AuthenticationFailed(self.url.clone())
            }
            StatusCode::SERVICE_UNAVAILABLE => TransportError::ConnectionRejected(self.url.clone()),
            other => TransportError::Http {
                status: other.as_u16(),
                url: self.url.clone(),
            },
        }
    }

    fn map_error(&self, error: reqwest::Error) -> TransportError {
        if error.is_connect() {
            TransportError::ConnectionRefused(self.url.clone())
        } else {
            TransportError::Socket(error.to_string())
        }
    }
}

#[async_trait]
impl OutgoingTransport for HttpPushTransport {
    fn write(&mut self, payload: &str) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.body.push_str(payload);
        Ok(())
    }

    async fn read_response(&mut self) -> Result<Vec<String>, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let body = std::mem::take(&mut self.body);
        tracing::debug!("pushing {} bytes to {}", body.len(), self.url);

        let response = self
            .client
            .post(&self.url)
            .header("content-type", "text/plain; charset=utf-8")
            .body(body)
            .send()
            .await
            .map_err(|e| self.map_error(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.map_status(status));
        }

        let text = response.text().await.map_err(|e| self.map_error(e))?;
        Ok(text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn close(&mut self) {
        self.closed = true;
        self.body.clear();
    }
}
