use crate::core::error::ProcessError;
use anyhow::Context;
use bytes::Bytes;
use sanitize_filename::sanitize;
use std::path::Path;
use uuid::Uuid;

pub type TaskId = Uuid;

/// The document sent to the processing endpoint. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentUpload {
    pub file_name: String,
    pub content_type: String,
    pub data: Bytes,
}

impl DocumentUpload {
    pub fn new(file_name: impl AsRef<str>, data: impl Into<Bytes>) -> Self {
        let file_name = sanitize(file_name.as_ref());
        let file_name = if file_name.is_empty() { "document.bin".to_string() } else { file_name };
        let content_type = guess_content_type(&file_name).to_string();
        Self { file_name, content_type, data: data.into() }
    }

    pub async fn from_path(path: &Path) -> anyhow::Result<Self> {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("read {}", path.display()))?;
        let name = path
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        Ok(Self::new(name, data))
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

fn guess_content_type(file_name: &str) -> &'static str {
    let ext = file_name.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("pdf") => "application/pdf",
        Some("txt") => "text/plain",
        Some("json") => "application/json",
        Some("jsonl") => "application/jsonl",
        _ => "application/octet-stream",
    }
}

/// Server-reported progress through a paginated document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageProgress {
    pub current: u32,
    pub total: u32,
}

impl PageProgress {
    /// `total_pages`: keeps the larger total and clamps `current` to it.
    pub fn set_total(&mut self, total: u32) {
        self.total = self.total.max(total);
        self.current = self.current.min(self.total);
    }

    /// `page_start` / `page_complete`.
    pub fn set_page(&mut self, page: u32, total: u32) {
        self.total = self.total.max(total);
        self.current = self.current.max(page).min(self.total);
    }

    pub fn is_done(&self) -> bool {
        self.total > 0 && self.current == self.total
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessReport {
    pub task_id: TaskId,
    pub file_name: String,
    pub pages: PageProgress,
    /// Stream closed normally without an explicit `complete` marker.
    pub implicit: bool,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    Uploading,
    AwaitingEvents,
    Completed(ProcessReport),
    Failed(ProcessError),
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed(_) | TaskState::Failed(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            TaskState::Idle => "idle",
            TaskState::Uploading => "uploading",
            TaskState::AwaitingEvents => "awaiting-events",
            TaskState::Completed(_) => "completed",
            TaskState::Failed(_) => "failed",
        }
    }
}

/// One in-flight upload+process operation, owned by whoever started it.
#[derive(Debug, Clone)]
pub struct UploadTask {
    pub id: TaskId,
    pub document: DocumentUpload,
    pub target_model: String,
    pub byte_progress: u8,
    pub page_progress: PageProgress,
    state: TaskState,
}

impl UploadTask {
    pub fn new(document: DocumentUpload, target_model: &str) -> Result<Self, ProcessError> {
        if document.data.is_empty() {
            return Err(ProcessError::InvalidRequest(format!("document {} is empty", document.file_name)));
        }
        let target_model = target_model.trim();
        if target_model.is_empty() {
            return Err(ProcessError::InvalidRequest("model name is empty".to_string()));
        }

        Ok(Self {
            id: Uuid::new_v4(),
            document,
            target_model: target_model.to_string(),
            byte_progress: 0,
            page_progress: PageProgress::default(),
            state: TaskState::Idle,
        })
    }

    pub fn state(&self) -> &TaskState {
        &self.state
    }

    /// Moves to `next` unless the task already sits in a terminal state.
    pub fn transition(&mut self, next: TaskState) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        tracing::debug!(task = %self.id, from = self.state.label(), to = next.label(), "task state");
        self.state = next;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> DocumentUpload {
        DocumentUpload::new("paper.pdf", &b"%PDF-1.7"[..])
    }

    #[test]
    fn rejects_empty_inputs() {
        let empty = DocumentUpload::new("a.pdf", Vec::new());
        assert!(matches!(UploadTask::new(empty, "m"), Err(ProcessError::InvalidRequest(_))));
        assert!(matches!(UploadTask::new(doc(), "  "), Err(ProcessError::InvalidRequest(_))));
    }

    #[test]
    fn file_names_are_sanitized_and_typed() {
        let d = DocumentUpload::new("../etc/passwd.PDF", &b"x"[..]);
        assert!(!d.file_name.contains('/'));
        assert_eq!(d.content_type, "application/pdf");

        let d = DocumentUpload::new("", &b"x"[..]);
        assert_eq!(d.file_name, "document.bin");
        assert_eq!(d.content_type, "application/octet-stream");
    }

    #[test]
    fn terminal_state_is_sticky() {
        let mut task = UploadTask::new(doc(), "llama").unwrap();
        assert!(task.transition(TaskState::Uploading));
        assert!(task.transition(TaskState::Failed(ProcessError::Cancelled)));
        assert!(!task.transition(TaskState::AwaitingEvents));
        assert_eq!(task.state(), &TaskState::Failed(ProcessError::Cancelled));
    }

    #[test]
    fn page_progress_never_moves_backwards() {
        let mut p = PageProgress::default();
        p.set_total(10);
        assert_eq!(p, PageProgress { current: 0, total: 10 });
        p.set_page(4, 10);
        p.set_page(2, 10);
        assert_eq!(p.current, 4);
        p.set_total(3);
        assert_eq!(p, PageProgress { current: 4, total: 10 });
        p.set_page(12, 10);
        assert_eq!(p.current, 10);
        assert!(p.is_done());
    }
}
