//! HttpScrapeProcessor - fetches the source URL with reqwest.
//!
//! Only the source page itself is fetched. `depth` is accepted and echoed in
//! the result; following links is left to a richer scraper behind the same
//! `Processor` port.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG, HeaderMap, LAST_MODIFIED};
use serde_json::json;
use tracing::debug;

use crate::domain::metadata::RawValue;
use crate::domain::{Artifact, HarvestError, HarvestResult, ProcessorError, ProcessorOutput, TaskConfig};
use crate::ports::Processor;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

pub struct HttpScrapeProcessor {
    client: reqwest::Client,
}

impl HttpScrapeProcessor {
    pub fn new(request_timeout: Duration, user_agent: &str) -> HarvestResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| HarvestError::Config(format!("http client: {e}")))?;
        Ok(Self { client })
    }
}

fn classify_status(status: StatusCode, url: &str) -> Option<ProcessorError> {
    if status.is_success() {
        return None;
    }
    let message = format!("GET {url} returned {status}");
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        Some(ProcessorError::transient(message))
    } else {
        Some(ProcessorError::permanent(message))
    }
}

fn classify_error(err: reqwest::Error, url: &str) -> ProcessorError {
    if err.is_builder() {
        ProcessorError::validation(format!("cannot request {url}: {err}"))
    } else if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        ProcessorError::transient(format!("GET {url} failed: {err}"))
    } else {
        ProcessorError::permanent(format!("GET {url} failed: {err}"))
    }
}

fn header_metadata(headers: &HeaderMap) -> RawValue {
    let picked = [CONTENT_TYPE, CONTENT_LENGTH, LAST_MODIFIED, ETAG]
        .into_iter()
        .filter_map(|name| {
            let value = headers.get(&name)?.to_str().ok()?;
            Some((name.as_str().to_string(), RawValue::from(value)))
        })
        .collect();
    RawValue::Map(picked)
}

#[async_trait]
impl Processor for HttpScrapeProcessor {
    fn name(&self) -> &'static str {
        "http-scrape"
    }

    async fn run(&self, config: &TaskConfig) -> Result<ProcessorOutput, ProcessorError> {
        let url = url::Url::parse(config.source.trim())
            .map_err(|e| ProcessorError::validation(format!("'{}' is not a URL: {e}", config.source)))?;
        let depth = config.param("depth").and_then(|d| d.as_u64()).unwrap_or(0);

        debug!(%url, depth, "fetching");
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| classify_error(e, url.as_str()))?;

        let status = response.status();
        if let Some(err) = classify_status(status, url.as_str()) {
            return Err(err);
        }

        let final_url = response.url().to_string();
        let headers = header_metadata(response.headers());
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .filter(|v| crate::domain::data_object::validate_content_type(v).is_ok())
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();
        let body = response
            .bytes()
            .await
            .map_err(|e| classify_error(e, url.as_str()))?;

        let artifact = Artifact::new(body.to_vec(), content_type)
            .with_metadata("url", url.as_str())
            .with_metadata("final_url", final_url.clone())
            .with_metadata("status", u64::from(status.as_u16()))
            .with_metadata("fetched_at", Utc::now())
            .with_metadata("headers", headers);

        Ok(ProcessorOutput::new(json!({
            "url": url.as_str(),
            "final_url": final_url,
            "status": status.as_u16(),
            "bytes": body.len(),
            "depth": depth,
        }))
        .with_artifact(artifact))
    }
}
