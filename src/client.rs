//! HTTP client for the deployment API, including a resilient log follower.
//!
//! The follower reconnects with exponential backoff when the stream drops or
//! stalls. Events carry a per-job sequence number, so anything replayed after
//! a reconnect is skipped rather than shown twice.

use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::{EventPage, Submission};
use crate::domain::{CompletionEvent, DeployRequest, Job, LogEvent, Outcome};

/// Reconnect behaviour of a stream follower
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Consecutive failed connection attempts before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first reconnect, in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between reconnects, in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each attempt)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// A connection silent for this long (no events, no heartbeats) is dropped
    #[serde(default = "default_stall_timeout")]
    pub stall_timeout_ms: u64,
}

fn default_max_attempts() -> u32 {
    6
}
fn default_initial_delay() -> u64 {
    500
}
fn default_max_delay() -> u64 {
    10_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_stall_timeout() -> u64 {
    45_000
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            stall_timeout_ms: default_stall_timeout(),
        }
    }
}

impl ReconnectPolicy {
    /// Calculate delay for a specific attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms);
        }

        let delay = self.initial_delay_ms as f64 * self.backoff_multiplier.powi((attempt - 1) as i32);
        Duration::from_millis(delay.min(self.max_delay_ms as f64) as u64)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }
}

/// One parsed server-sent event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    /// A dispatched message with its optional `event:` name
    Message { event: Option<String>, data: String },

    /// A `:` comment line (keepalive)
    Comment,
}

/// Incremental parser for `text/event-stream` bodies
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes; returns every frame completed by them
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(frame) = self.process_line(line) {
                frames.push(frame);
            }
        }
        frames
    }

    fn process_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            if self.data.is_empty() {
                self.event = None;
                return None;
            }
            let data = std::mem::take(&mut self.data).join("\n");
            return Some(SseFrame::Message {
                event: self.event.take(),
                data,
            });
        }

        if line.starts_with(':') {
            return Some(SseFrame::Comment);
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => self.data.push(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            // id/retry are not used by this API
            _ => {}
        }
        None
    }
}

/// What a follower reports to its caller
#[derive(Debug, Clone, PartialEq)]
pub enum StreamUpdate {
    Event(LogEvent),
    Completed(CompletionEvent),
}

/// Drops events already seen on an earlier connection
#[derive(Debug, Default)]
pub struct SeqFilter {
    last_seq: Option<u64>,
}

impl SeqFilter {
    /// Whether the event is new; records it if so
    pub fn accept(&mut self, event: &LogEvent) -> bool {
        match self.last_seq {
            Some(last) if event.seq <= last => false,
            _ => {
                self.last_seq = Some(event.seq);
                true
            }
        }
    }

    pub fn last_seq(&self) -> Option<u64> {
        self.last_seq
    }
}

/// Turn a parsed frame into an update
pub fn decode_frame(frame: &SseFrame) -> Result<Option<StreamUpdate>> {
    match frame {
        SseFrame::Comment => Ok(None),
        SseFrame::Message { event, data } => match event.as_deref() {
            Some("completion") => {
                let completion: CompletionEvent =
                    serde_json::from_str(data).context("Invalid completion frame")?;
                Ok(Some(StreamUpdate::Completed(completion)))
            }
            None | Some("message") => {
                let event: LogEvent = serde_json::from_str(data).context("Invalid event frame")?;
                Ok(Some(StreamUpdate::Event(event)))
            }
            Some(other) => {
                debug!(event = other, "Ignoring unknown stream event");
                Ok(None)
            }
        },
    }
}

/// How one connection ended
enum ConnectionEnd {
    Completed(CompletionEvent),
    /// Closed or stalled; `progressed` is true if anything new arrived
    Dropped { progressed: bool, reason: String },
}

/// Client for a deployment server
#[derive(Clone)]
pub struct DeployClient {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl DeployClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
            client: reqwest::Client::new(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => builder.header("Authorization", format!("Bearer {}", token)),
            None => builder,
        }
    }

    /// Decode a JSON response, surfacing the server's error message
    async fn decode<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return response.json().await.context("Invalid response from server");
        }

        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<serde_json::Value>(&text)
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
            .unwrap_or(text);
        anyhow::bail!("Server error ({}): {}", status, message)
    }

    pub async fn submit(&self, request: &DeployRequest) -> Result<Submission> {
        let response = self
            .request(reqwest::Method::POST, "/api/deployments")
            .json(request)
            .send()
            .await
            .context("Failed to reach deployment server")?;
        Self::decode(response).await
    }

    pub async fn get_job(&self, id: &str) -> Result<Job> {
        let response = self
            .request(reqwest::Method::GET, &format!("/api/deployments/{}", id))
            .send()
            .await
            .context("Failed to reach deployment server")?;
        Self::decode(response).await
    }

    pub async fn list_jobs(&self, limit: usize) -> Result<Vec<Job>> {
        let response = self
            .request(reqwest::Method::GET, &format!("/api/deployments?limit={}", limit))
            .send()
            .await
            .context("Failed to reach deployment server")?;
        Self::decode(response).await
    }

    pub async fn logs(&self, id: &str, page: usize, limit: usize) -> Result<EventPage> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/api/deployments/{}/logs?page={}&limit={}", id, page, limit),
            )
            .send()
            .await
            .context("Failed to reach deployment server")?;
        Self::decode(response).await
    }

    /// Follow a job's stream until it completes, reconnecting per `policy`.
    ///
    /// `on_update` sees every event once, in order, then the completion.
    pub async fn follow<F>(&self, id: &str, policy: &ReconnectPolicy, mut on_update: F) -> Result<CompletionEvent>
    where
        F: FnMut(&StreamUpdate),
    {
        let mut seen = SeqFilter::default();
        let mut attempt = 0u32;

        loop {
            let reason = match self.follow_once(id, policy, &mut seen, &mut on_update).await? {
                ConnectionEnd::Completed(completion) => return Ok(completion),
                ConnectionEnd::Dropped { progressed, reason } => {
                    if progressed {
                        attempt = 0;
                    }
                    reason
                }
            };

            // The stream may have closed because the job finished while we were away
            if let Ok(job) = self.get_job(id).await {
                if job.status.is_terminal() && seen.last_seq().is_some() {
                    let completion = completion_from_job(&job);
                    on_update(&StreamUpdate::Completed(completion.clone()));
                    return Ok(completion);
                }
            }

            attempt += 1;
            if !policy.should_retry(attempt) {
                anyhow::bail!("Log stream lost after {} attempts: {}", attempt, reason);
            }
            let delay = policy.delay_for_attempt(attempt);
            warn!(attempt, delay_ms = delay.as_millis() as u64, %reason, "Log stream dropped, reconnecting");
            tokio::time::sleep(delay).await;
        }
    }

    async fn follow_once<F>(
        &self,
        id: &str,
        policy: &ReconnectPolicy,
        seen: &mut SeqFilter,
        on_update: &mut F,
    ) -> Result<ConnectionEnd>
    where
        F: FnMut(&StreamUpdate),
    {
        let response = match self
            .request(reqwest::Method::GET, &format!("/api/deployments/{}/stream", id))
            .header("Accept", "text/event-stream")
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                return Ok(ConnectionEnd::Dropped {
                    progressed: false,
                    reason: e.to_string(),
                })
            }
        };

        let status = response.status();
        if status.is_client_error() {
            // Not found / unauthorized will not improve by retrying
            let err: Result<serde_json::Value> = Self::decode(response).await;
            return Err(err.err().unwrap_or_else(|| anyhow::anyhow!("Server error ({})", status)));
        }
        if !status.is_success() {
            return Ok(ConnectionEnd::Dropped {
                progressed: false,
                reason: format!("server returned {}", status),
            });
        }

        let mut body = response.bytes_stream();
        let mut parser = SseParser::new();
        let mut progressed = false;

        loop {
            let chunk = match tokio::time::timeout(policy.stall_timeout(), body.next()).await {
                Err(_) => {
                    return Ok(ConnectionEnd::Dropped {
                        progressed,
                        reason: "stream stalled".to_string(),
                    })
                }
                Ok(None) => {
                    return Ok(ConnectionEnd::Dropped {
                        progressed,
                        reason: "stream closed".to_string(),
                    })
                }
                Ok(Some(Err(e))) => {
                    return Ok(ConnectionEnd::Dropped {
                        progressed,
                        reason: e.to_string(),
                    })
                }
                Ok(Some(Ok(chunk))) => chunk,
            };

            for frame in parser.feed(&chunk) {
                match decode_frame(&frame) {
                    Ok(Some(StreamUpdate::Event(event))) => {
                        if seen.accept(&event) {
                            progressed = true;
                            on_update(&StreamUpdate::Event(event));
                        }
                    }
                    Ok(Some(StreamUpdate::Completed(completion))) => {
                        on_update(&StreamUpdate::Completed(completion.clone()));
                        return Ok(ConnectionEnd::Completed(completion));
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "Skipping malformed stream frame"),
                }
            }
        }
    }
}

fn completion_from_job(job: &Job) -> CompletionEvent {
    match &job.failure_reason {
        Some(reason) if job.status == crate::domain::JobStatus::Failed => {
            CompletionEvent::for_outcome(Outcome::Failed, &format!("Deployment failed: {}", reason))
        }
        _ => CompletionEvent::for_outcome(Outcome::Succeeded, "Deployment completed successfully"),
    }
}
