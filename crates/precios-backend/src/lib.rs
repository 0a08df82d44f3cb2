//! HTTP plumbing: a retrying page fetcher and the hosted-backend client
//! (PostgREST tables + storage buckets) used for all persistence.

use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info_span, Instrument};

pub const CRATE_NAME: &str = "precios-backend";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Retrying GET client for retailer pages and product images. Fetches are
/// strictly sequential; the only timing logic is the exponential backoff
/// between retry attempts.
#[derive(Debug, Clone)]
pub struct PageFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl PageFetcher {
    pub fn new(config: FetcherConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(
        &self,
        url: &str,
        referer: Option<&str>,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("page_fetch", url);
        self.fetch_bytes_inner(url, referer).instrument(span).await
    }

    async fn fetch_bytes_inner(
        &self,
        url: &str,
        referer: Option<&str>,
    ) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            let mut request = self.client.get(url);
            if let Some(referer) = referer {
                request = request.header(reqwest::header::REFERER, referer);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    let content_type = resp
                        .headers()
                        .get(reqwest::header::CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .map(|v| v.to_string());

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            content_type,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("backend status {status} for {path}: {body}")]
    Status {
        status: u16,
        path: String,
        body: String,
    },
    #[error("decoding backend response for {path}: {source}")]
    Decode {
        path: String,
        source: serde_json::Error,
    },
    #[error("invalid backend credentials: {0}")]
    Credentials(String),
}

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub url: String,
    pub service_key: String,
    pub timeout: Duration,
}

/// Object listing entry from a storage bucket.
#[derive(Debug, Clone, Deserialize)]
pub struct BucketObject {
    pub name: String,
}

/// Thin client for the hosted backend's REST and storage surfaces. The
/// backend's own consistency and availability guarantees are out of scope;
/// no call here spans a transaction.
#[derive(Debug, Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    base: String,
}

impl BackendClient {
    pub fn new(config: BackendConfig) -> Result<Self, BackendError> {
        let mut headers = HeaderMap::new();
        let api_key = HeaderValue::from_str(&config.service_key)
            .map_err(|e| BackendError::Credentials(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", config.service_key))
            .map_err(|e| BackendError::Credentials(e.to_string()))?;
        headers.insert("apikey", api_key);
        headers.insert(AUTHORIZATION, bearer);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            http,
            base: config.url.trim_end_matches('/').to_string(),
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.base)
    }

    async fn read_checked(
        resp: reqwest::Response,
        path: &str,
    ) -> Result<(StatusCode, HeaderMap, Vec<u8>), BackendError> {
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.bytes().await?.to_vec();
        if !status.is_success() {
            return Err(BackendError::Status {
                status: status.as_u16(),
                path: path.to_string(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        Ok((status, headers, body))
    }

    fn decode<T: DeserializeOwned>(path: &str, body: &[u8]) -> Result<T, BackendError> {
        serde_json::from_slice(body).map_err(|source| BackendError::Decode {
            path: path.to_string(),
            source,
        })
    }

    /// `GET /rest/v1/{table}` with PostgREST filter pairs.
    pub async fn select<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &[(&str, &str)],
    ) -> Result<Vec<T>, BackendError> {
        let url = self.table_url(table);
        let resp = self.http.get(&url).query(query).send().await?;
        let (_, _, body) = Self::read_checked(resp, table).await?;
        Self::decode(table, &body)
    }

    /// First matching row, if any.
    pub async fn select_one<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &[(&str, &str)],
    ) -> Result<Option<T>, BackendError> {
        let mut rows = self.select::<T>(table, query).await?;
        if rows.is_empty() {
            Ok(None)
        } else {
            Ok(Some(rows.remove(0)))
        }
    }

    /// Plain insert, returning the representation of the created rows.
    pub async fn insert<T: Serialize, R: DeserializeOwned>(
        &self,
        table: &str,
        row: &T,
    ) -> Result<Vec<R>, BackendError> {
        let url = self.table_url(table);
        let resp = self
            .http
            .post(&url)
            .header("Prefer", "return=representation")
            .json(row)
            .send()
            .await?;
        let (_, _, body) = Self::read_checked(resp, table).await?;
        Self::decode(table, &body)
    }

    /// Insert-or-update keyed by `on_conflict` columns, returning the merged
    /// representation.
    pub async fn upsert<T: Serialize, R: DeserializeOwned>(
        &self,
        table: &str,
        on_conflict: &str,
        row: &T,
    ) -> Result<Vec<R>, BackendError> {
        let url = self.table_url(table);
        let resp = self
            .http
            .post(&url)
            .query(&[("on_conflict", on_conflict)])
            .header("Prefer", "resolution=merge-duplicates,return=representation")
            .json(row)
            .send()
            .await?;
        let (_, _, body) = Self::read_checked(resp, table).await?;
        Self::decode(table, &body)
    }

    /// `PATCH` rows matching the filter pairs, returning the updated rows.
    pub async fn update<T: Serialize, R: DeserializeOwned>(
        &self,
        table: &str,
        query: &[(&str, &str)],
        patch: &T,
    ) -> Result<Vec<R>, BackendError> {
        let url = self.table_url(table);
        let resp = self
            .http
            .patch(&url)
            .query(query)
            .header("Prefer", "return=representation")
            .json(patch)
            .send()
            .await?;
        let (_, _, body) = Self::read_checked(resp, table).await?;
        Self::decode(table, &body)
    }

    /// `DELETE` rows matching the filter pairs; returns the exact row count
    /// reported in `Content-Range`.
    pub async fn delete(
        &self,
        table: &str,
        query: &[(&str, &str)],
    ) -> Result<u64, BackendError> {
        let url = self.table_url(table);
        let resp = self
            .http
            .delete(&url)
            .query(query)
            .header("Prefer", "count=exact")
            .send()
            .await?;
        let (_, headers, _) = Self::read_checked(resp, table).await?;
        Ok(headers
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total)
            .unwrap_or(0))
    }

    fn object_url(&self, bucket: &str, path: &str) -> String {
        format!("{}/storage/v1/object/{bucket}/{path}", self.base)
    }

    /// Public URL for an object in a public bucket.
    pub fn public_object_url(&self, bucket: &str, path: &str) -> String {
        format!("{}/storage/v1/object/public/{bucket}/{path}", self.base)
    }

    /// Upload bytes into a bucket, overwriting any existing object at `path`.
    pub async fn upload_object(
        &self,
        bucket: &str,
        path: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<(), BackendError> {
        let url = self.object_url(bucket, path);
        let resp = self
            .http
            .post(&url)
            .header("x-upsert", "true")
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await?;
        Self::read_checked(resp, &format!("{bucket}/{path}")).await?;
        Ok(())
    }

    pub async fn list_objects(
        &self,
        bucket: &str,
        limit: usize,
    ) -> Result<Vec<BucketObject>, BackendError> {
        let url = format!("{}/storage/v1/object/list/{bucket}", self.base);
        let resp = self
            .http
            .post(&url)
            .json(&json!({ "prefix": "", "limit": limit, "offset": 0 }))
            .send()
            .await?;
        let (_, _, body) = Self::read_checked(resp, bucket).await?;
        Self::decode(bucket, &body)
    }

    pub async fn remove_objects(
        &self,
        bucket: &str,
        names: &[String],
    ) -> Result<(), BackendError> {
        let url = format!("{}/storage/v1/object/{bucket}", self.base);
        let resp = self
            .http
            .delete(&url)
            .json(&json!({ "prefixes": names }))
            .send()
            .await?;
        Self::read_checked(resp, bucket).await?;
        Ok(())
    }
}

fn parse_content_range_total(value: &str) -> Option<u64> {
    value.rsplit('/').next()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn content_range_totals_parse() {
        assert_eq!(parse_content_range_total("0-24/25"), Some(25));
        assert_eq!(parse_content_range_total("*/0"), Some(0));
        assert_eq!(parse_content_range_total("garbage"), None);
    }

    #[test]
    fn public_urls_are_rooted_at_the_backend() {
        let client = BackendClient::new(BackendConfig {
            url: "https://example.supabase.co/".to_string(),
            service_key: "service-key".to_string(),
            timeout: Duration::from_secs(5),
        })
        .expect("client");
        assert_eq!(
            client.public_object_url("product-images", "arroz-primor-abc123.jpg"),
            "https://example.supabase.co/storage/v1/object/public/product-images/arroz-primor-abc123.jpg"
        );
    }
}
