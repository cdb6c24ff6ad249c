use async_trait::async_trait;
use reqwest::{Client, StatusCode, header};
use serde::Serialize;
use serde_json::Value;

use crate::config::FetchConfig;
use crate::error::UpstreamError;
use crate::models::Endpoint;

/// Paginated listing source. One call, one key, one page.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn fetch_page(
        &self,
        endpoint: Endpoint,
        username: &str,
        cursor: Option<&str>,
        api_key: &str,
    ) -> Result<Value, UpstreamError>;
}

// Listing request body
#[derive(Debug, Serialize)]
struct ListingRequest<'a> {
    username: &'a str,
    #[serde(rename = "maxId")]
    max_id: &'a str,
}

// RapidAPI instagram120 client
pub struct RapidApiClient {
    client: Client,
    base_url: String,
    host: String,
}

impl RapidApiClient {
    pub fn new(config: &FetchConfig) -> Result<Self, UpstreamError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| UpstreamError::Transport(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            host: config.api_host.clone(),
        })
    }

    fn url(&self, endpoint: Endpoint) -> String {
        format!("{}{}", self.base_url, endpoint.path())
    }
}

/// Map a non-success status to the error the key pool acts on.
pub fn classify_status(status: StatusCode, body: String) -> UpstreamError {
    let message: String = body.chars().take(200).collect();
    match status.as_u16() {
        401 | 403 | 429 => UpstreamError::Rejected {
            status: status.as_u16(),
            message,
        },
        404 => UpstreamError::NotFound,
        code => UpstreamError::Http {
            status: code,
            message,
        },
    }
}

#[async_trait]
impl Upstream for RapidApiClient {
    async fn fetch_page(
        &self,
        endpoint: Endpoint,
        username: &str,
        cursor: Option<&str>,
        api_key: &str,
    ) -> Result<Value, UpstreamError> {
        let body = ListingRequest {
            username,
            max_id: cursor.unwrap_or_default(),
        };

        let resp = self
            .client
            .post(self.url(endpoint))
            .header("x-rapidapi-key", api_key)
            .header("x-rapidapi-host", &self.host)
            .header(header::CONTENT_TYPE, "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, text));
        }

        let text = resp.text().await?;
        let value: Value = serde_json::from_str(&text)?;
        Ok(value)
    }
}
