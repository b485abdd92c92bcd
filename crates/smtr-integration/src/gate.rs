//! Outbound POST fan-out behind a counting gate.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{FuturesUnordered, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::error::{IntegrationError, Result};

/// Result of one POST, in the position of its payload.
#[derive(Debug, Clone, Serialize)]
pub struct PostOutcome {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Parsed JSON response, or the raw text when it is not JSON.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl PostOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.status.is_some_and(|s| (200..300).contains(&s))
    }
}

/// Build a header map from `name: value` pairs. A JSON content type is
/// added unless one is given.
pub fn header_map<'a, I>(pairs: I) -> Result<HeaderMap>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        let invalid = |reason: String| IntegrationError::InvalidHeader {
            name: name.to_string(),
            reason,
        };
        let key = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|e| invalid(e.to_string()))?;
        let val = HeaderValue::from_str(value.trim()).map_err(|e| invalid(e.to_string()))?;
        headers.insert(key, val);
    }
    if !headers.contains_key(CONTENT_TYPE) {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    }
    Ok(headers)
}

/// POST every payload to `url` with at most `max_concurrent` requests in
/// flight.
///
/// Returns one outcome per payload in input order. A failed request is
/// recorded in its outcome and never cancels the others.
pub async fn post_all<T>(
    client: &reqwest::Client,
    url: &str,
    payloads: &[T],
    headers: &HeaderMap,
    max_concurrent: usize,
    timeout: Duration,
) -> Vec<PostOutcome>
where
    T: Serialize + Sync,
{
    let limit = max_concurrent.max(1);
    let semaphore = Arc::new(Semaphore::new(limit));
    info!(url, count = payloads.len(), max_concurrent = limit, "posting payloads");

    let mut pending = FuturesUnordered::new();
    for (index, payload) in payloads.iter().enumerate() {
        let semaphore = Arc::clone(&semaphore);
        pending.push(async move {
            let started = Instant::now();
            let Ok(_permit) = semaphore.acquire().await else {
                return failed(index, started, "request gate closed".to_string());
            };
            send_one(client, url, payload, headers, timeout, index, started).await
        });
    }

    let mut outcomes = Vec::with_capacity(payloads.len());
    while let Some(outcome) = pending.next().await {
        outcomes.push(outcome);
    }
    outcomes.sort_by_key(|o| o.index);

    let failures = outcomes.iter().filter(|o| !o.is_success()).count();
    if failures > 0 {
        warn!(url, failures, "some requests failed");
    }
    info!(url, sent = outcomes.len(), failures, "payloads posted");
    outcomes
}

async fn send_one<T: Serialize>(
    client: &reqwest::Client,
    url: &str,
    payload: &T,
    headers: &HeaderMap,
    timeout: Duration,
    index: usize,
    started: Instant,
) -> PostOutcome {
    let response = client
        .post(url)
        .headers(headers.clone())
        .timeout(timeout)
        .json(payload)
        .send()
        .await;

    let response = match response {
        Ok(response) => response,
        Err(e) => return failed(index, started, e.to_string()),
    };

    let status = response.status();
    let text = match response.text().await {
        Ok(text) => text,
        Err(e) => {
            let mut outcome = failed(index, started, e.to_string());
            outcome.status = Some(status.as_u16());
            return outcome;
        }
    };
    let body = serde_json::from_str(&text).unwrap_or(Value::String(text));

    debug!(index, status = status.as_u16(), "request finished");
    PostOutcome {
        index,
        status: Some(status.as_u16()),
        body: Some(body),
        error: (!status.is_success()).then(|| format!("server answered {}", status.as_u16())),
        elapsed_ms: elapsed_ms(started),
    }
}

fn failed(index: usize, started: Instant, error: String) -> PostOutcome {
    debug!(index, %error, "request failed");
    PostOutcome {
        index,
        status: None,
        body: None,
        error: Some(error),
        elapsed_ms: elapsed_ms(started),
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_get_json_content_type() {
        let headers = header_map([("PREVKEY", "k"), ("PREVTOKEN", "t")]).unwrap();
        assert_eq!(headers["prevkey"], "k");
        assert_eq!(headers[CONTENT_TYPE], "application/json");

        let custom = header_map([("Content-Type", "text/plain")]).unwrap();
        assert_eq!(custom[CONTENT_TYPE], "text/plain");
    }

    #[test]
    fn bad_header_is_rejected() {
        assert!(matches!(
            header_map([("bad header", "x")]),
            Err(IntegrationError::InvalidHeader { .. })
        ));
        assert!(header_map([("X-Key", "line\nbreak")]).is_err());
    }

    #[test]
    fn outcome_success_requires_2xx() {
        let mut outcome = PostOutcome {
            index: 0,
            status: Some(201),
            body: None,
            error: None,
            elapsed_ms: 1,
        };
        assert!(outcome.is_success());
        outcome.status = Some(500);
        assert!(!outcome.is_success());
        outcome.status = None;
        assert!(!outcome.is_success());
    }

    #[tokio::test]
    async fn unreachable_host_is_recorded_per_payload() {
        let client = reqwest::Client::new();
        let headers = header_map(std::iter::empty::<(&str, &str)>()).unwrap();
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let outcomes = post_all(
            &client,
            &format!("http://127.0.0.1:{port}/"),
            &[serde_json::json!({"a": 1}), serde_json::json!({"a": 2})],
            &headers,
            1,
            Duration::from_secs(2),
        )
        .await;
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[1].index, 1);
        assert!(outcomes.iter().all(|o| o.error.is_some()));
    }
}
