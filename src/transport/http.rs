use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Duration;

use super::Transport;
use super::protocol::{self, ENDPOINT_FOP, FopRequest, FopResponse};
use crate::error::{Errno, FopResult};
use crate::fop::{Fop, Reply};
use crate::topology::types::SubvolId;

/// Transport reaching bricks over HTTP.
pub struct HttpTransport {
    /// Subvolume -> base url (`http://host:port`).
    pub endpoints: DashMap<SubvolId, String>,
    http_client: reqwest::Client,
    timeout: Duration,
    attempts: usize,
}

impl HttpTransport {
    pub fn new(timeout: Duration, attempts: usize) -> Self {
        Self {
            endpoints: DashMap::new(),
            http_client: reqwest::Client::new(),
            timeout,
            attempts: attempts.max(1),
        }
    }

    pub fn add_endpoint(&self, id: SubvolId, base_url: impl Into<String>) {
        let url = base_url.into();
        tracing::info!("Subvolume {} at {}", id, url);
        self.endpoints.insert(id, url.trim_end_matches('/').to_string());
    }

    /// Posts a frame, retrying connection failures with exponential backoff and jitter.
    ///
    /// Only transport errors are retried: once a brick answered, its reply is final.
    async fn post_with_retry(&self, url: String, body: Vec<u8>) -> FopResult<reqwest::Response> {
        let mut delay_ms = 150u64;

        for attempt in 0..self.attempts {
            let response = self
                .http_client
                .post(url.clone())
                .header("content-type", "application/octet-stream")
                .body(body.clone())
                .timeout(self.timeout)
                .send()
                .await;

            match response {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    if attempt + 1 == self.attempts {
                        tracing::debug!("POST {} failed: {}", url, e);
                        return Err(if e.is_timeout() {
                            Errno::ETIMEDOUT
                        } else {
                            Errno::ENOTCONN
                        });
                    }
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(1200);
                }
            }
        }

        Err(Errno::ENOTCONN)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn submit(&self, target: &SubvolId, fop: Fop) -> FopResult<Reply> {
        let base = self
            .endpoints
            .get(target)
            .map(|e| e.value().clone())
            .ok_or(Errno::ENOTCONN)?;

        let request = FopRequest {
            op_id: uuid::Uuid::new_v4().to_string(),
            fop,
        };
        tracing::trace!("{} {} -> {}", request.op_id, request.fop.name(), target);

        let body = protocol::encode(&request)?;
        let response = self
            .post_with_retry(format!("{}{}", base, ENDPOINT_FOP), body)
            .await?;

        if !response.status().is_success() {
            tracing::warn!("Brick {} answered {}", target, response.status());
            return Err(Errno::EIO);
        }

        let raw = response.bytes().await.map_err(|e| {
            tracing::debug!("Reading reply from {} failed: {}", target, e);
            Errno::ENOTCONN
        })?;
        let reply: FopResponse = protocol::decode(&raw)?;
        reply.result
    }
}
