use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CACHE_CONTROL, USER_AGENT};
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::core::error::TransportError;
use crate::core::model::DocumentUpload;
use crate::plugins::transport::{DriverContext, TransportDriver, TransportSession, TransportSignal, UploadRequest};

const MAX_DETAIL_CHARS: usize = 512;

/// Streams the document to `process_doc` as multipart and relays the event-stream response.
pub struct HttpDriver {
    client: reqwest::Client,
}

impl HttpDriver {
    pub fn new(ctx: &DriverContext) -> Result<Self, TransportError> {
        // 不设置总超时：处理流可能持续很久，由调用方自行取消
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .connect_timeout(Duration::from_secs(ctx.connect_timeout_secs))
            .build()
            .map_err(TransportError::network)?;
        Ok(Self { client })
    }

    fn upload_body(data: Bytes, chunk_size: usize, tx: mpsc::UnboundedSender<TransportSignal>) -> reqwest::Body {
        let total = data.len() as u64;
        let chunk_size = chunk_size.max(1);
        let pieces: Vec<Bytes> = (0..data.len())
            .step_by(chunk_size)
            .map(|start| data.slice(start..(start + chunk_size).min(data.len())))
            .collect();

        let mut sent = 0u64;
        let body = stream::iter(pieces).map(move |piece| {
            sent += piece.len() as u64;
            let _ = tx.send(TransportSignal::BytesSent { sent, total: Some(total) });
            Ok::<Bytes, std::io::Error>(piece)
        });
        reqwest::Body::wrap_stream(body)
    }
}

#[async_trait]
impl TransportDriver for HttpDriver {
    fn name(&self) -> &'static str {
        "http-driver"
    }

    async fn open(&self, req: &UploadRequest, ctx: &DriverContext) -> Result<TransportSession, TransportError> {
        let mut url = ctx.endpoint("process_doc").map_err(TransportError::network)?;
        url.query_pairs_mut().append_pair("model_name", &req.model);

        let mut headers = build_headers(ctx)?;
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));

        let (tx, rx) = mpsc::unbounded_channel();
        let body = Self::upload_body(req.document.data.clone(), ctx.upload_chunk_bytes, tx.clone());
        let form = Form::new().part("file", document_part(&req.document, body)?);

        tracing::debug!(task = %req.task_id, %url, size = req.document.size(), "opening process_doc stream");
        let request = self.client.post(url).headers(headers).multipart(form);

        let task = tokio::spawn(async move {
            let outcome = exchange(request, &tx).await;
            let _ = tx.send(TransportSignal::Closed(outcome));
        });

        Ok(TransportSession::new(rx, Some(task)))
    }
}

async fn exchange(
    request: reqwest::RequestBuilder,
    tx: &mpsc::UnboundedSender<TransportSignal>,
) -> Result<(), TransportError> {
    let resp = request.send().await.map_err(TransportError::network)?;
    let status = resp.status();
    let _ = tx.send(TransportSignal::Status(status.as_u16()));

    if status != StatusCode::OK {
        let detail = resp.text().await.ok().and_then(|body| error_detail(&body));
        return Err(TransportError::Status { status: status.as_u16(), detail });
    }

    let mut body = resp.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(TransportError::network)?;
        if tx.send(TransportSignal::Chunk(chunk)).is_err() {
            // 接收端已放弃
            break;
        }
    }
    Ok(())
}

/// The `file` field both upload routes expect.
pub(crate) fn document_part(document: &DocumentUpload, body: reqwest::Body) -> Result<Part, TransportError> {
    Part::stream_with_length(body, document.size())
        .file_name(document.file_name.clone())
        .mime_str(&document.content_type)
        .map_err(TransportError::network)
}

pub(crate) fn build_headers(ctx: &DriverContext) -> Result<HeaderMap, TransportError> {
    let mut h = HeaderMap::new();
    h.insert(USER_AGENT, HeaderValue::from_str(&ctx.user_agent).map_err(TransportError::network)?);
    for (k, v) in &ctx.headers {
        let name = HeaderName::from_bytes(k.as_bytes()).map_err(TransportError::network)?;
        let value = HeaderValue::from_str(v).map_err(TransportError::network)?;
        h.insert(name, value);
    }
    Ok(h)
}

/// FastAPI puts the reason in `{"detail": ...}`; anything else is returned trimmed.
pub(crate) fn error_detail(body: &str) -> Option<String> {
    let body = body.trim();
    if body.is_empty() {
        return None;
    }
    if let Ok(serde_json::Value::Object(map)) = serde_json::from_str::<serde_json::Value>(body) {
        for key in ["detail", "message", "error"] {
            match map.get(key) {
                Some(serde_json::Value::String(s)) => return Some(s.clone()),
                Some(other) if !other.is_null() => return Some(other.to_string()),
                _ => {}
            }
        }
    }
    Some(body.chars().take(MAX_DETAIL_CHARS).collect())
}
