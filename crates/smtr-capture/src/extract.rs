use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::context::CaptureContext;
use crate::error::{CaptureError, Result};

/// One upstream row as a JSON object.
pub type Record = serde_json::Map<String, Value>;

/// Pulls the records belonging to one capture context.
///
/// Implementations must be safe to call again for the same context; the
/// runner may retry a timestamp in a later run.
#[async_trait]
pub trait Extractor: Send + Sync {
    fn name(&self) -> &str;

    async fn extract(&self, ctx: &CaptureContext) -> Result<Vec<Record>>;
}

/// Reads records from an HTTP endpoint that accepts `start`/`end` query
/// parameters (`YYYY-MM-DD HH:MM:SS`) and answers with a JSON array of
/// objects, or an object whose `data` field holds that array.
pub struct HttpExtractor {
    client: reqwest::Client,
    url: String,
}

impl HttpExtractor {
    pub fn new(url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.to_string(),
        }
    }

    pub fn with_client(client: reqwest::Client, url: &str) -> Self {
        Self {
            client,
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl Extractor for HttpExtractor {
    fn name(&self) -> &str {
        "http"
    }

    async fn extract(&self, ctx: &CaptureContext) -> Result<Vec<Record>> {
        let (start, end) = ctx.capture_window();
        let start = smtr_core::format_timestamp(&start);
        let end = smtr_core::format_timestamp(&end);

        debug!(url = %self.url, %start, %end, "requesting records");

        let mut request = self
            .client
            .get(&self.url)
            .query(&[("start", start.as_str()), ("end", end.as_str())]);
        if let Some(Value::Object(params)) = ctx.extra_parameters() {
            for (key, value) in params {
                let rendered = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                request = request.query(&[(key.as_str(), rendered.as_str())]);
            }
        }

        let resp = request.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), body = %text, "extraction endpoint error");
            return Err(CaptureError::Extraction(format!(
                "{} answered {}",
                self.url,
                status.as_u16()
            )));
        }

        let body: Value = resp.json().await?;
        records_from_value(body)
    }
}

/// Accept `[{...}, ...]`, `{"data": [...]}` or a single object.
pub fn records_from_value(body: Value) -> Result<Vec<Record>> {
    let rows = match body {
        Value::Array(rows) => rows,
        Value::Object(mut obj) => match obj.remove("data") {
            Some(Value::Array(rows)) => rows,
            Some(other) => {
                return Err(CaptureError::Extraction(format!(
                    "'data' is not an array: {other}"
                )))
            }
            None => vec![Value::Object(obj)],
        },
        Value::Null => Vec::new(),
        other => {
            return Err(CaptureError::Extraction(format!(
                "expected JSON array or object, got {other}"
            )))
        }
    };

    rows.into_iter()
        .enumerate()
        .map(|(i, row)| match row {
            Value::Object(record) => Ok(record),
            other => Err(CaptureError::Extraction(format!(
                "row {i} is not an object: {other}"
            ))),
        })
        .collect()
}
