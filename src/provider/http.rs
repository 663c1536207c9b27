//! Generic REST provider.
//!
//! Resources are addressed as `{endpoint}/v1/resources/{kind}[/{provider_id}]`
//! and authenticated with a bearer token. Transient failures (429, 5xx,
//! network) are retried a bounded number of times before surfacing.

use async_trait::async_trait;
use reqwest::{header, Client, Method, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, trace};

use super::{CreateOutcome, ObservedResource, Outputs, Provider, ProviderResult};
use crate::error::ProviderError;
use crate::graph::{Attributes, ResourceKind};

/// Maximum number of attempts for transient failures.
const MAX_ATTEMPTS: u32 = 3;

/// Base delay between attempts in milliseconds.
const RETRY_DELAY_MS: u64 = 1000;

/// Retry-after used when a 429 carries no usable header.
const DEFAULT_RETRY_AFTER_SECS: u64 = 1;

/// REST provider client.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    client: Client,
    endpoint: String,
    token: String,
    max_attempts: u32,
    retry_delay: Duration,
}

#[derive(Debug, Serialize)]
struct CreateRequest<'a> {
    id: &'a str,
    attributes: &'a Attributes,
}

#[derive(Debug, Serialize)]
struct UpdateRequest<'a> {
    attributes: &'a Attributes,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    id: String,
    #[serde(default)]
    outputs: Outputs,
}

#[derive(Debug, Deserialize)]
struct UpdateResponse {
    #[serde(default)]
    outputs: Outputs,
}

#[derive(Debug, Deserialize)]
struct ReadResponse {
    #[serde(default)]
    attributes: Attributes,
    #[serde(default)]
    outputs: Outputs,
}

impl HttpProvider {
    /// Creates a client for `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(endpoint: &str, token: &str, timeout_secs: u64) -> ProviderResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ProviderError::network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token: token.to_string(),
            max_attempts: MAX_ATTEMPTS,
            retry_delay: Duration::from_millis(RETRY_DELAY_MS),
        })
    }

    /// Overrides the internal retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, max_attempts: u32, retry_delay: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.retry_delay = retry_delay;
        self
    }

    fn url(&self, kind: ResourceKind, provider_id: Option<&str>) -> String {
        provider_id.map_or_else(
            || format!("{}/v1/resources/{kind}", self.endpoint),
            |id| format!("{}/v1/resources/{kind}/{id}", self.endpoint),
        )
    }

    /// Sends a request, retrying transient failures.
    async fn send<B: Serialize + Sync>(
        &self,
        method: Method,
        url: &str,
        body: Option<&B>,
    ) -> ProviderResult<Response> {
        let mut last_error = None;

        for attempt in 0..self.max_attempts {
            if attempt > 0 {
                debug!("Retry attempt {attempt} of {}", self.max_attempts);
                tokio::time::sleep(self.retry_delay * attempt).await;
            }

            match self.send_once(method.clone(), url, body).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transient() => last_error = Some(e),
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| ProviderError::network("Max retries exceeded")))
    }

    async fn send_once<B: Serialize + Sync>(
        &self,
        method: Method,
        url: &str,
        body: Option<&B>,
    ) -> ProviderResult<Response> {
        trace!("{} {}", method, url);

        let mut request = self
            .client
            .request(method, url)
            .header(header::AUTHORIZATION, format!("Bearer {}", self.token));
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::network(format!("Request failed: {e}")))?;

        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
            return Err(ProviderError::RateLimited {
                retry_after_secs: retry_after,
            });
        }

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ProviderError::AuthenticationFailed {
                message: String::from("Invalid provider token"),
            });
        }

        if status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Unavailable {
                message: format!("{status}: {body}"),
            });
        }

        Ok(response)
    }
}

/// Maps a non-success, non-retryable response to an error.
async fn reject(response: Response, provider_id: Option<&str>) -> ProviderError {
    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        if let Some(id) = provider_id {
            return ProviderError::NotFound {
                provider_id: id.to_string(),
            };
        }
    }
    let body = response.text().await.unwrap_or_default();
    ProviderError::rejected(status.as_u16(), body)
}

async fn parse<T: for<'de> Deserialize<'de>>(response: Response) -> ProviderResult<T> {
    response.json().await.map_err(|e| ProviderError::InvalidResponse {
        message: format!("Failed to parse response: {e}"),
    })
}

#[async_trait]
impl Provider for HttpProvider {
    async fn create(
        &self,
        kind: ResourceKind,
        id: &str,
        attributes: &Attributes,
    ) -> ProviderResult<CreateOutcome> {
        let url = self.url(kind, None);
        let body = CreateRequest { id, attributes };
        let response = self.send(Method::POST, &url, Some(&body)).await?;
        if !response.status().is_success() {
            return Err(reject(response, None).await);
        }

        let created: CreateResponse = parse(response).await?;
        debug!("Created {} {} as {}", kind, id, created.id);
        Ok(CreateOutcome {
            provider_id: created.id,
            outputs: created.outputs,
        })
    }

    async fn update(
        &self,
        kind: ResourceKind,
        provider_id: &str,
        attributes: &Attributes,
    ) -> ProviderResult<Outputs> {
        let url = self.url(kind, Some(provider_id));
        let body = UpdateRequest { attributes };
        let response = self.send(Method::PUT, &url, Some(&body)).await?;
        if !response.status().is_success() {
            return Err(reject(response, Some(provider_id)).await);
        }

        let updated: UpdateResponse = parse(response).await?;
        Ok(updated.outputs)
    }

    async fn destroy(&self, kind: ResourceKind, provider_id: &str) -> ProviderResult<()> {
        let url = self.url(kind, Some(provider_id));
        let response = self.send::<()>(Method::DELETE, &url, None).await?;
        if !response.status().is_success() {
            return Err(reject(response, Some(provider_id)).await);
        }
        Ok(())
    }

    async fn read(
        &self,
        kind: ResourceKind,
        provider_id: &str,
    ) -> ProviderResult<Option<ObservedResource>> {
        let url = self.url(kind, Some(provider_id));
        let response = self.send::<()>(Method::GET, &url, None).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(reject(response, Some(provider_id)).await);
        }

        let observed: ReadResponse = parse(response).await?;
        Ok(Some(ObservedResource {
            attributes: observed.attributes,
            outputs: observed.outputs,
        }))
    }
}
