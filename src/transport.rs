use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use reqwest::redirect::Policy;

use crate::error::FailureReason;
use crate::signing::SIGNATURE_HEADER;

pub const DEFAULT_USER_AGENT: &str = concat!("webhook-engine/", env!("CARGO_PKG_VERSION"));
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_EXCERPT_LIMIT: usize = 1024;

/// A subscriber's answer to one POST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    /// At most the configured excerpt limit, lossily decoded.
    pub body_excerpt: String,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sends one signed webhook request.
///
/// Any HTTP response, whatever its status, is `Ok`; `Err` means no response
/// was obtained.
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn post(
        &self,
        url: &str,
        body: Vec<u8>,
        signature: Option<&str>,
    ) -> Result<TransportResponse, FailureReason>;
}

/// reqwest-backed transport sharing one connection pool.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    user_agent: String,
    timeout: Duration,
    excerpt_limit: usize,
}

impl HttpTransport {
    pub fn new(
        user_agent: impl Into<String>,
        timeout: Duration,
        excerpt_limit: usize,
    ) -> Result<Self, reqwest::Error> {
        // Redirects could bounce a vetted destination to an internal one.
        let client = reqwest::Client::builder()
            .redirect(Policy::none())
            .pool_max_idle_per_host(10)
            .build()?;

        Ok(Self {
            client,
            user_agent: user_agent.into(),
            timeout,
            excerpt_limit,
        })
    }

    async fn read_excerpt(&self, mut response: reqwest::Response) -> String {
        let mut buf = Vec::with_capacity(self.excerpt_limit.min(1024));
        while buf.len() < self.excerpt_limit {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    let take = (self.excerpt_limit - buf.len()).min(chunk.len());
                    buf.extend_from_slice(&chunk[..take]);
                }
                Ok(None) | Err(_) => break,
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }
}

#[async_trait]
impl WebhookTransport for HttpTransport {
    async fn post(
        &self,
        url: &str,
        body: Vec<u8>,
        signature: Option<&str>,
    ) -> Result<TransportResponse, FailureReason> {
        let mut request = self
            .client
            .post(url)
            .timeout(self.timeout)
            .header(CONTENT_TYPE, "application/json")
            .header(USER_AGENT, self.user_agent.as_str());

        if let Some(signature) = signature {
            request = request.header(SIGNATURE_HEADER, signature);
        }

        let response = request.body(body).send().await.map_err(|err| {
            if err.is_timeout() {
                FailureReason::Timeout
            } else {
                FailureReason::Network(err.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let body_excerpt = self.read_excerpt(response).await;
        Ok(TransportResponse {
            status,
            body_excerpt,
        })
    }
}
