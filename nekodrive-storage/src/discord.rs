//! Discord webhook shard store
//!
//! Each shard is posted as a single attachment to one of the configured
//! webhooks (round-robin). The locator records which webhook and which
//! message hold the shard: `"{webhook_index}:{message_id}"`. Downloads go
//! through the webhook message endpoint to obtain a fresh attachment URL,
//! then fetch the bytes from the CDN.

use crate::backend::{ShardFuture, ShardStore, ShardStoreStats};
use bytes::Bytes;
use nekodrive_core::chunk::ShardLocator;
use nekodrive_core::error::{NekoError, Result};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, instrument};

const SHARD_FILE_NAME: &str = "shard.bin";

/// Webhook substrate settings
#[derive(Debug, Clone)]
pub struct DiscordSettings {
    /// Webhook URLs, `https://discord.com/api/webhooks/{id}/{token}`
    pub webhook_urls: Vec<String>,
    /// Per-request timeout
    pub timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct Attachment {
    url: String,
    #[serde(default)]
    size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct Message {
    id: String,
    #[serde(default)]
    attachments: Vec<Attachment>,
}

#[derive(Debug, Deserialize)]
struct RateLimitBody {
    retry_after: f64,
}

/// Shard store backed by Discord webhooks
pub struct DiscordShardStore {
    client: Client,
    webhooks: Vec<String>,
    cursor: AtomicUsize,
    puts: AtomicU64,
    gets: AtomicU64,
    deletes: AtomicU64,
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
}

impl DiscordShardStore {
    pub fn new(settings: &DiscordSettings) -> Result<Self> {
        if settings.webhook_urls.is_empty() {
            return Err(NekoError::Configuration(
                "at least one webhook URL is required".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| NekoError::Configuration(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            webhooks: settings
                .webhook_urls
                .iter()
                .map(|u| u.trim_end_matches('/').to_string())
                .collect(),
            cursor: AtomicUsize::new(0),
            puts: AtomicU64::new(0),
            gets: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
        })
    }

    fn next_webhook(&self) -> usize {
        self.cursor.fetch_add(1, Ordering::Relaxed) % self.webhooks.len()
    }

    /// Split a locator into its webhook URL and message id
    fn resolve<'a>(&'a self, locator: &'a ShardLocator) -> Result<(&'a str, &'a str)> {
        let (idx, message_id) = parse_locator(locator)?;
        let url = self.webhooks.get(idx).ok_or_else(|| {
            NekoError::NotFound(format!(
                "locator {} refers to webhook {} but only {} are configured",
                locator,
                idx,
                self.webhooks.len()
            ))
        })?;
        Ok((url.as_str(), message_id))
    }

    async fn fetch_message(&self, url: &str, message_id: &str) -> Result<Message> {
        let response = self
            .client
            .get(format!("{}/messages/{}", url, message_id))
            .send()
            .await
            .map_err(request_error)?;
        let response = check(response).await?;
        response
            .json::<Message>()
            .await
            .map_err(|e| NekoError::transient(format!("malformed message response: {}", e)))
    }

    #[instrument(skip(self, data), fields(size = data.len()))]
    async fn put_shard(&self, data: Bytes) -> Result<ShardLocator> {
        let idx = self.next_webhook();
        let url = &self.webhooks[idx];
        let size = data.len() as u64;

        let part = Part::bytes(data.to_vec())
            .file_name(SHARD_FILE_NAME)
            .mime_str("application/octet-stream")
            .map_err(|e| NekoError::Internal(format!("multipart: {}", e)))?;
        let payload = serde_json::json!({
            "attachments": [{ "id": 0, "filename": SHARD_FILE_NAME }]
        });
        let form = Form::new()
            .text("payload_json", payload.to_string())
            .part("files[0]", part);

        let response = self
            .client
            .post(format!("{}?wait=true", url))
            .multipart(form)
            .send()
            .await
            .map_err(request_error)?;
        let response = check(response).await?;
        let message: Message = response
            .json()
            .await
            .map_err(|e| NekoError::transient(format!("malformed upload response: {}", e)))?;

        debug!(webhook = idx, message_id = %message.id, "Shard uploaded");
        self.puts.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(size, Ordering::Relaxed);

        Ok(format_locator(idx, &message.id))
    }

    #[instrument(skip(self), fields(locator = %locator))]
    async fn get_shard(&self, locator: &ShardLocator) -> Result<Bytes> {
        let (url, message_id) = self.resolve(locator)?;
        let message = self.fetch_message(url, message_id).await?;
        let attachment = message
            .attachments
            .first()
            .ok_or_else(|| NekoError::NotFound(format!("shard {} has no attachment", locator)))?;

        let response = self
            .client
            .get(&attachment.url)
            .send()
            .await
            .map_err(request_error)?;
        let response = check(response).await?;
        let data = response.bytes().await.map_err(request_error)?;

        if let Some(size) = attachment.size {
            if size != data.len() as u64 {
                return Err(NekoError::transient(format!(
                    "short read for {}: {} of {} bytes",
                    locator,
                    data.len(),
                    size
                )));
            }
        }

        self.gets.fetch_add(1, Ordering::Relaxed);
        self.bytes_read
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(data)
    }

    #[instrument(skip(self), fields(locator = %locator))]
    async fn delete_shard(&self, locator: &ShardLocator) -> Result<()> {
        let (url, message_id) = self.resolve(locator)?;
        let response = self
            .client
            .delete(format!("{}/messages/{}", url, message_id))
            .send()
            .await
            .map_err(request_error)?;
        check(response).await?;
        self.deletes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn ping_webhooks(&self) -> Result<()> {
        for url in &self.webhooks {
            let response = self.client.get(url).send().await.map_err(request_error)?;
            check(response).await?;
        }
        Ok(())
    }
}

impl ShardStore for DiscordShardStore {
    fn put<'a>(&'a self, data: Bytes) -> ShardFuture<'a, ShardLocator> {
        Box::pin(self.put_shard(data))
    }

    fn get<'a>(&'a self, locator: &'a ShardLocator) -> ShardFuture<'a, Bytes> {
        Box::pin(self.get_shard(locator))
    }

    fn delete<'a>(&'a self, locator: &'a ShardLocator) -> ShardFuture<'a, ()> {
        Box::pin(self.delete_shard(locator))
    }

    fn ping<'a>(&'a self) -> ShardFuture<'a, ()> {
        Box::pin(self.ping_webhooks())
    }

    fn name(&self) -> &'static str {
        "discord"
    }

    fn stats(&self) -> ShardStoreStats {
        ShardStoreStats {
            puts: self.puts.load(Ordering::Relaxed),
            gets: self.gets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            retries: 0,
        }
    }
}

fn format_locator(webhook: usize, message_id: &str) -> ShardLocator {
    ShardLocator::new(format!("{}:{}", webhook, message_id))
}

fn parse_locator(locator: &ShardLocator) -> Result<(usize, &str)> {
    let (idx, message_id) = locator
        .as_str()
        .split_once(':')
        .ok_or_else(|| NekoError::NotFound(format!("malformed locator {}", locator)))?;
    let idx = idx
        .parse::<usize>()
        .map_err(|_| NekoError::NotFound(format!("malformed locator {}", locator)))?;
    if message_id.is_empty() || !message_id.bytes().all(|b| b.is_ascii_digit()) {
        return Err(NekoError::NotFound(format!("malformed locator {}", locator)));
    }
    Ok((idx, message_id))
}

fn request_error(e: reqwest::Error) -> NekoError {
    NekoError::transient(format!("request failed: {}", e))
}

/// Turn a non-success response into the matching error
async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let headers = response.headers().clone();
    let body = response.text().await.unwrap_or_default();
    Err(classify(status, &headers, &body))
}

fn classify(status: StatusCode, headers: &HeaderMap, body: &str) -> NekoError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => NekoError::Transient {
            message: "rate limited".to_string(),
            retry_after: retry_after(headers, body),
        },
        StatusCode::NOT_FOUND => NekoError::NotFound(format!("substrate: {}", body)),
        s if s.is_server_error() || s == StatusCode::REQUEST_TIMEOUT => {
            NekoError::transient(format!("substrate returned {}", s))
        }
        s => NekoError::Storage(format!("substrate returned {}: {}", s, body)),
    }
}

fn retry_after(headers: &HeaderMap, body: &str) -> Option<Duration> {
    let from_header = headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok());
    let from_body = || {
        serde_json::from_str::<RateLimitBody>(body)
            .ok()
            .map(|b| b.retry_after)
    };
    from_header
        .or_else(from_body)
        .filter(|s| s.is_finite() && *s >= 0.0)
        .map(Duration::from_secs_f64)
}
