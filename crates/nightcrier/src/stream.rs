use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::error::StreamError;
use crate::event::{FaultEvent, StreamFrame};
use crate::manager::{AnnotatedEvent, ClusterStatus};
use crate::probe::ClusterPermissions;
use crate::registry::ClusterSpec;

/// A session with no frames (not even pings) for this long is assumed
/// dead and torn down for reconnection.
const IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Exponential reconnect backoff: doubles from 1s, ±25% jitter, 60s cap.
/// A successful subscription resets it.
#[derive(Debug)]
pub struct Backoff {
    attempt: u32,
}

impl Backoff {
    const BASE_SECS: u64 = 1;
    const CAP_SECS: u64 = 60;

    pub fn new() -> Self {
        Self { attempt: 0 }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delay before the next reconnect attempt, advancing the counter.
    pub fn next_delay(&mut self) -> Duration {
        // 2^6 already exceeds the cap, so the shift cannot overflow
        let base = (Self::BASE_SECS << self.attempt.min(6)).min(Self::CAP_SECS);
        self.attempt = self.attempt.saturating_add(1);

        let jitter = rand::thread_rng().gen_range(0.75..=1.25);
        Duration::from_secs_f64(base as f64 * jitter)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// One monitoring-endpoint subscriber. Owns nothing shared beyond its
/// status record and the fan-in sender; isolation between clusters is by
/// channel, not shared objects.
pub struct StreamClient {
    spec: Arc<ClusterSpec>,
    http: reqwest::Client,
    status: Arc<ClusterStatus>,
    permissions: Option<Arc<ClusterPermissions>>,
    events_tx: mpsc::Sender<AnnotatedEvent>,
    shutdown: watch::Receiver<bool>,
}

impl StreamClient {
    pub fn new(
        spec: Arc<ClusterSpec>,
        http: reqwest::Client,
        status: Arc<ClusterStatus>,
        permissions: Option<Arc<ClusterPermissions>>,
        events_tx: mpsc::Sender<AnnotatedEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            spec,
            http,
            status,
            permissions,
            events_tx,
            shutdown,
        }
    }

    /// Run until cancelled. Any session error other than cancellation
    /// sends the client into a jittered backoff and a fresh session.
    pub async fn run(mut self) {
        let mut backoff = Backoff::new();

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            match self.run_session(&mut backoff).await {
                Ok(()) => break, // cancelled
                Err(e) => {
                    let delay = backoff.next_delay();
                    let retry_at = chrono::Utc::now()
                        + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                    self.status.mark_failed(e.to_string(), retry_at);
                    warn!(
                        cluster = %self.spec.name,
                        error = %e,
                        retry_in = %format!("{:.1}s", delay.as_secs_f64()),
                        "Stream session failed"
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.changed() => {}
                    }
                }
            }
        }

        debug!(cluster = %self.spec.name, "Stream client stopped");
    }

    /// One session: connect, subscribe, pump frames. Returns `Ok(())`
    /// only on cancellation; every other exit is a reconnectable error.
    async fn run_session(&mut self, backoff: &mut Backoff) -> Result<(), StreamError> {
        self.status.mark_connecting();

        let mut url = self.spec.endpoint.clone();
        url.set_path("/v1/events/subscribe");

        let mut request = self.http.post(url).json(&serde_json::json!({
            "mode": self.spec.subscription_mode.as_str(),
        }));
        if let Some(token) = &self.spec.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| StreamError::Connect(e.to_string()))?;
        if !response.status().is_success() {
            return Err(StreamError::SubscribeRejected(format!(
                "HTTP {}",
                response.status()
            )));
        }

        self.status.mark_subscribing();
        let mut lines = NdjsonLines::new(response.bytes_stream().boxed());
        let mut subscription_id: Option<String> = None;

        loop {
            let next = tokio::select! {
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        return Ok(());
                    }
                    continue;
                }
                next = tokio::time::timeout(IDLE_TIMEOUT, lines.next_line()) => next,
            };

            let line = match next {
                Err(_) => return Err(StreamError::IdleTimeout(IDLE_TIMEOUT.as_secs())),
                Ok(None) => {
                    return Err(StreamError::SessionClosed("server closed the stream".into()))
                }
                Ok(Some(Err(e))) => return Err(StreamError::Http(e)),
                Ok(Some(Ok(line))) => line,
            };

            // A malformed frame is dropped; it never tears down the
            // session and does not affect backoff.
            let frame = match StreamFrame::decode(&line) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(
                        cluster = %self.spec.name,
                        error = %e,
                        "Dropping undecodable stream frame"
                    );
                    continue;
                }
            };

            match frame {
                StreamFrame::Subscribed { subscription_id: id } => {
                    info!(
                        cluster = %self.spec.name,
                        subscription_id = %id,
                        mode = self.spec.subscription_mode.as_str(),
                        "Subscription active"
                    );
                    self.status.mark_active();
                    backoff.reset();
                    subscription_id = Some(id);
                }
                StreamFrame::Event { event } => {
                    let Some(sub_id) = subscription_id.as_deref() else {
                        warn!(
                            cluster = %self.spec.name,
                            "Dropping event received before subscribe ack"
                        );
                        continue;
                    };
                    let event = FaultEvent::from_wire(&self.spec.name, sub_id, event);
                    self.status.record_event();

                    let annotated = AnnotatedEvent {
                        event,
                        spec: self.spec.clone(),
                        permissions: self.permissions.clone(),
                    };
                    // Backpressure: a full fan-in channel parks this
                    // cluster's session, preserving per-cluster order.
                    // Shutdown must still be able to interrupt the wait.
                    tokio::select! {
                        sent = self.events_tx.send(annotated) => {
                            if sent.is_err() {
                                return Ok(()); // pipeline gone, we are shutting down
                            }
                        }
                        _ = self.shutdown.changed() => {
                            if *self.shutdown.borrow() {
                                return Ok(());
                            }
                        }
                    }
                }
                StreamFrame::Ping => {
                    trace!(cluster = %self.spec.name, "keep-alive");
                }
            }
        }
    }
}

/// Incremental newline-delimited framing over a chunked byte stream.
/// Blank lines are skipped.
struct NdjsonLines<E> {
    stream: BoxStream<'static, Result<Bytes, E>>,
    buf: Vec<u8>,
    done: bool,
}

impl<E> NdjsonLines<E> {
    fn new(stream: BoxStream<'static, Result<Bytes, E>>) -> Self {
        Self {
            stream,
            buf: Vec::new(),
            done: false,
        }
    }

    async fn next_line(&mut self) -> Option<Result<String, E>> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let raw: Vec<u8> = self.buf.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&raw[..raw.len() - 1])
                    .trim()
                    .to_string();
                if line.is_empty() {
                    continue;
                }
                return Some(Ok(line));
            }

            if self.done {
                // Trailing bytes without a final newline still form a line
                let rest = String::from_utf8_lossy(&self.buf).trim().to_string();
                self.buf.clear();
                if rest.is_empty() {
                    return None;
                }
                return Some(Ok(rest));
            }

            match self.stream.next().await {
                Some(Ok(chunk)) => self.buf.extend_from_slice(&chunk),
                Some(Err(e)) => return Some(Err(e)),
                None => self.done = true,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    #[test]
    fn test_backoff_doubles_within_jitter_bounds() {
        let mut backoff = Backoff::new();
        for n in 0..10u32 {
            let expected = (1u64 << n.min(6)).min(60) as f64;
            let delay = backoff.next_delay().as_secs_f64();
            assert!(
                delay >= expected * 0.75 - 1e-9 && delay <= expected * 1.25 + 1e-9,
                "attempt {n}: delay {delay} outside [{}, {}]",
                expected * 0.75,
                expected * 1.25
            );
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let mut backoff = Backoff::new();
        for _ in 0..32 {
            let delay = backoff.next_delay();
            assert!(delay <= Duration::from_secs_f64(60.0 * 1.25));
        }
    }

    #[test]
    fn test_backoff_reset_restarts_at_base() {
        let mut backoff = Backoff::new();
        for _ in 0..5 {
            backoff.next_delay();
        }
        backoff.reset();
        let delay = backoff.next_delay().as_secs_f64();
        assert!(delay <= 1.25 && delay >= 0.75);
    }

    fn chunked(parts: &[&str]) -> NdjsonLines<Infallible> {
        let chunks: Vec<Result<Bytes, Infallible>> = parts
            .iter()
            .map(|p| Ok(Bytes::copy_from_slice(p.as_bytes())))
            .collect();
        NdjsonLines::new(futures::stream::iter(chunks).boxed())
    }

    #[tokio::test]
    async fn test_lines_reassembled_across_chunks() {
        let mut lines = chunked(&["{\"a\":1}\n{\"b\"", ":2}\n"]);
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "{\"a\":1}");
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "{\"b\":2}");
        assert!(lines.next_line().await.is_none());
    }

    #[tokio::test]
    async fn test_trailing_line_without_newline() {
        let mut lines = chunked(&["{\"a\":1}"]);
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "{\"a\":1}");
        assert!(lines.next_line().await.is_none());
    }

    #[tokio::test]
    async fn test_blank_lines_skipped() {
        let mut lines = chunked(&["\n\n{\"a\":1}\n\n"]);
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "{\"a\":1}");
        assert!(lines.next_line().await.is_none());
    }
}
