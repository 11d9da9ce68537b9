use crate::core::error::{ProcessError, TransportError};
use crate::core::events::{ProgressEvent, ProgressObserver};
use crate::core::model::{ProcessReport, TaskState, UploadTask};

/// Interprets decoded payloads for one task and decides its outcome exactly once.
#[derive(Debug)]
pub struct CompletionArbiter {
    task: UploadTask,
    body_bytes: u64,
    upload_reported: bool,
    /// Status of the response, once the transport reports it.
    status: Option<u16>,
}

impl CompletionArbiter {
    pub fn new(task: UploadTask) -> Self {
        Self { task, body_bytes: 0, upload_reported: false, status: None }
    }

    pub fn task(&self) -> &UploadTask {
        &self.task
    }

    pub fn is_settled(&self) -> bool {
        self.task.state().is_terminal()
    }

    pub fn begin(&mut self) {
        if matches!(self.task.state(), TaskState::Idle) {
            self.task.transition(TaskState::Uploading);
        }
    }

    pub fn bytes_sent(&mut self, sent: u64, total: Option<u64>, observer: &mut dyn ProgressObserver) {
        if self.is_settled() {
            return;
        }
        let Some(total) = total.filter(|t| *t > 0) else {
            return;
        };

        let percent = upload_percent(sent, total);
        if self.upload_reported && percent <= self.task.byte_progress {
            return;
        }
        self.upload_reported = true;
        self.task.byte_progress = percent;
        observer.upload_progress(percent);

        if percent == 100 {
            self.awaiting_events();
        }
    }

    pub fn response_status(&mut self, status: u16) {
        if self.is_settled() {
            return;
        }
        self.status = Some(status);
        self.awaiting_events();
    }

    /// Payloads are only meaningful while the response is (or may still be) a 200.
    pub fn accepts_events(&self) -> bool {
        !self.is_settled() && self.status.map_or(true, |s| s == 200)
    }

    pub fn body_received(&mut self, len: usize) {
        if self.is_settled() {
            return;
        }
        self.body_bytes += len as u64;
        self.awaiting_events();
    }

    pub fn interpret(&mut self, payload: &str, observer: &mut dyn ProgressObserver) {
        if !self.accepts_events() {
            return;
        }
        let event = match ProgressEvent::parse(payload) {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!(task = %self.task.id, "{e}");
                return;
            }
        };

        observer.event(&event);
        let pages = &mut self.task.page_progress;
        match event {
            ProgressEvent::TotalPages { total } => {
                pages.set_total(total);
                observer.page_progress(pages.current, pages.total);
            }
            ProgressEvent::PageStart { page, total } | ProgressEvent::PageComplete { page, total } => {
                pages.set_page(page, total);
                observer.page_progress(pages.current, pages.total);
            }
            ProgressEvent::Saving { message } => {
                tracing::info!(task = %self.task.id, "{}", message.as_deref().unwrap_or("saving"));
            }
            ProgressEvent::Complete { message } => {
                self.complete(false, message);
            }
        }
    }

    /// Terminal transport outcome.
    pub fn transport_closed(&mut self, result: Result<(), TransportError>) {
        match (result, self.status) {
            (Err(e), _) => self.fail(e.into()),
            (Ok(()), Some(status)) if status != 200 => {
                self.fail(TransportError::Status { status, detail: None }.into());
            }
            (Ok(()), _) if self.body_bytes > 0 => self.complete(true, None),
            (Ok(()), _) => self.fail(TransportError::EmptyResponse.into()),
        }
    }

    pub fn cancel(&mut self) {
        self.fail(ProcessError::Cancelled);
    }

    pub fn into_outcome(self) -> Result<ProcessReport, ProcessError> {
        match self.task.state() {
            TaskState::Completed(report) => Ok(report.clone()),
            TaskState::Failed(err) => Err(err.clone()),
            // 调用方在未结算时取结果，按断开处理
            _ => Err(TransportError::Disconnected.into()),
        }
    }

    fn awaiting_events(&mut self) {
        if matches!(self.task.state(), TaskState::Idle | TaskState::Uploading) {
            self.task.transition(TaskState::AwaitingEvents);
        }
    }

    fn complete(&mut self, implicit: bool, message: Option<String>) {
        let report = ProcessReport {
            task_id: self.task.id,
            file_name: self.task.document.file_name.clone(),
            pages: self.task.page_progress,
            implicit,
            message,
        };
        if self.task.transition(TaskState::Completed(report)) {
            tracing::info!(task = %self.task.id, implicit, pages = self.task.page_progress.current, "processing completed");
        }
    }

    fn fail(&mut self, err: ProcessError) {
        let msg = err.to_string();
        if self.task.transition(TaskState::Failed(err)) {
            tracing::warn!(task = %self.task.id, "processing failed: {msg}");
        }
    }
}

/// `round(sent * 100 / total)`, capped at 100.
pub fn upload_percent(sent: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = (sent.min(total) as u128 * 200 + total as u128) / (total as u128 * 2);
    pct.min(100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::DocumentUpload;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct Recorder {
        uploads: Vec<u8>,
        pages: Vec<(u32, u32)>,
        kinds: Vec<&'static str>,
    }

    impl ProgressObserver for Recorder {
        fn upload_progress(&mut self, percent: u8) {
            self.uploads.push(percent);
        }

        fn page_progress(&mut self, current: u32, total: u32) {
            self.pages.push((current, total));
        }

        fn event(&mut self, event: &ProgressEvent) {
            self.kinds.push(event.kind());
        }
    }

    fn arbiter() -> CompletionArbiter {
        let task = UploadTask::new(DocumentUpload::new("doc.pdf", &b"abc"[..]), "tiny-llama").unwrap();
        let mut a = CompletionArbiter::new(task);
        a.begin();
        a
    }

    #[test]
    fn percent_rounds_half_up() {
        assert_eq!(upload_percent(0, 10), 0);
        assert_eq!(upload_percent(1, 3), 33);
        assert_eq!(upload_percent(2, 3), 67);
        assert_eq!(upload_percent(1, 200), 1);
        assert_eq!(upload_percent(99, 200), 50);
        assert_eq!(upload_percent(500, 100), 100);
        assert_eq!(upload_percent(5, 0), 0);
    }

    #[test]
    fn full_run_resolves_with_last_page() {
        let mut a = arbiter();
        let mut rec = Recorder::default();
        a.response_status(200);
        a.body_received(1);
        a.interpret(r#"{"type":"total_pages","total":10}"#, &mut rec);
        for page in 1..=10 {
            a.interpret(&format!(r#"{{"type":"page_start","page":{page},"total":10}}"#), &mut rec);
            a.interpret(&format!(r#"{{"type":"page_complete","page":{page},"total":10}}"#), &mut rec);
        }
        a.interpret(r#"{"type":"complete"}"#, &mut rec);

        assert_eq!(rec.pages.first(), Some(&(0, 10)));
        assert_eq!(rec.pages.last(), Some(&(10, 10)));
        assert_eq!(rec.pages.len(), 21);
        let report = a.into_outcome().unwrap();
        assert!(!report.implicit);
        assert_eq!(report.pages.current, 10);
    }

    #[test]
    fn stream_close_without_marker_is_implicit_success() {
        let mut a = arbiter();
        let mut rec = Recorder::default();
        a.body_received(64);
        a.interpret(r#"{"type":"total_pages","total":3}"#, &mut rec);
        a.interpret(r#"{"type":"page_start","page":1,"total":3}"#, &mut rec);
        a.transport_closed(Ok(()));
        let report = a.into_outcome().unwrap();
        assert!(report.implicit);
        assert_eq!(report.pages.current, 1);
        assert_eq!(report.pages.total, 3);
    }

    #[test]
    fn empty_body_is_not_success() {
        let mut a = arbiter();
        a.transport_closed(Ok(()));
        assert_eq!(a.into_outcome(), Err(ProcessError::Transport(TransportError::EmptyResponse)));
    }

    #[test]
    fn error_status_wins_over_complete_marker_in_body() {
        let mut a = arbiter();
        let mut rec = Recorder::default();
        a.response_status(500);
        a.body_received(24);
        a.interpret(r#"{"type":"complete"}"#, &mut rec);
        assert!(!a.is_settled());
        let err = TransportError::Status { status: 500, detail: None };
        a.transport_closed(Err(err.clone()));
        assert_eq!(a.into_outcome(), Err(ProcessError::Transport(err)));
        assert!(rec.kinds.is_empty());
    }

    #[test]
    fn settles_once_and_ignores_late_signals() {
        let mut a = arbiter();
        let mut rec = Recorder::default();
        a.body_received(10);
        a.interpret(r#"{"type":"complete","message":"done"}"#, &mut rec);
        a.interpret(r#"{"type":"total_pages","total":4}"#, &mut rec);
        a.bytes_sent(10, Some(10), &mut rec);
        a.transport_closed(Err(TransportError::Network("late".into())));
        a.cancel();

        assert_eq!(rec.kinds, vec!["complete"]);
        assert!(rec.pages.is_empty() && rec.uploads.is_empty());
        assert_eq!(a.into_outcome().unwrap().message.as_deref(), Some("done"));
    }

    #[test]
    fn malformed_and_unknown_payloads_change_nothing() {
        let mut a = arbiter();
        let mut rec = Recorder::default();
        a.interpret(r#"{"type":"page_start","pa"#, &mut rec);
        a.interpret(r#"{"type":"heartbeat"}"#, &mut rec);
        a.interpret("not json", &mut rec);
        assert!(!a.is_settled());
        assert!(rec.kinds.is_empty());
        assert_eq!(a.task().page_progress.total, 0);
    }

    #[test]
    fn upload_ticks_are_monotonic_and_move_state() {
        let mut a = arbiter();
        let mut rec = Recorder::default();
        a.bytes_sent(0, Some(4), &mut rec);
        a.bytes_sent(1, Some(4), &mut rec);
        a.bytes_sent(1, Some(4), &mut rec);
        a.bytes_sent(3, None, &mut rec);
        assert!(matches!(a.task().state(), TaskState::Uploading));
        a.bytes_sent(4, Some(4), &mut rec);
        assert_eq!(rec.uploads, vec![0, 25, 100]);
        assert!(matches!(a.task().state(), TaskState::AwaitingEvents));
    }

    #[test]
    fn saving_is_forwarded_without_side_effects() {
        let mut a = arbiter();
        let mut rec = Recorder::default();
        a.interpret(r#"{"type":"saving","message":"Saving training data..."}"#, &mut rec);
        assert_eq!(rec.kinds, vec!["saving"]);
        assert!(rec.pages.is_empty());
        assert!(!a.is_settled());
    }
}
