use crate::core::error::TransportError;
use crate::core::model::{DocumentUpload, TaskId};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

pub const DEFAULT_API_URL: &str = "http://localhost:8000/";

#[derive(Debug, Clone)]
pub struct DriverContext {
    pub base_url: Url,
    pub user_agent: String,
    /// Applies to the plain REST calls only; the processing stream has no total timeout.
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub upload_chunk_bytes: usize,
    pub headers: HashMap<String, String>,
}

impl Default for DriverContext {
    fn default() -> Self {
        Self {
            base_url: Url::parse(DEFAULT_API_URL).expect("default api url"),
            user_agent: "finetune-client/0.1".to_string(),
            timeout_secs: 60,
            connect_timeout_secs: 10,
            upload_chunk_bytes: 64 * 1024,
            headers: HashMap::new(),
        }
    }
}

impl DriverContext {
    pub fn with_base_url(mut self, raw: &str) -> Result<Self, url::ParseError> {
        self.base_url = normalize_base(raw)?;
        Ok(self)
    }

    /// Joins `path` (e.g. `process_doc`) onto the base url.
    pub fn endpoint(&self, path: &str) -> Result<Url, url::ParseError> {
        self.base_url.join(path)
    }
}

/// Makes sure relative joins append to the base path instead of replacing its last segment.
pub fn normalize_base(raw: &str) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(raw.trim())?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub task_id: TaskId,
    pub document: DocumentUpload,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSignal {
    BytesSent { sent: u64, total: Option<u64> },
    Status(u16),
    Chunk(Bytes),
    Closed(Result<(), TransportError>),
}

/// One network exchange. Signals arrive in order; dropping the session aborts it.
#[derive(Debug)]
pub struct TransportSession {
    signals: mpsc::UnboundedReceiver<TransportSignal>,
    task: Option<JoinHandle<()>>,
}

impl TransportSession {
    pub fn new(signals: mpsc::UnboundedReceiver<TransportSignal>, task: Option<JoinHandle<()>>) -> Self {
        Self { signals, task }
    }

    pub async fn next(&mut self) -> Option<TransportSignal> {
        self.signals.recv().await
    }

    pub fn abort(&mut self) {
        self.signals.close();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        self.abort();
    }
}

#[async_trait]
pub trait TransportDriver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Starts the upload. Progress, response chunks and the terminal outcome
    /// are delivered through the returned session.
    async fn open(&self, req: &UploadRequest, ctx: &DriverContext) -> Result<TransportSession, TransportError>;
}
