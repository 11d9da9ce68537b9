use crate::core::error::MalformedEvent;
use serde::Deserialize;

/// Typed payload of one `data: ` frame, dispatched on its `type` field.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    TotalPages { total: u32 },
    PageStart { page: u32, total: u32 },
    PageComplete { page: u32, total: u32 },
    Saving {
        #[serde(default)]
        message: Option<String>,
    },
    Complete {
        #[serde(default)]
        message: Option<String>,
    },
}

impl ProgressEvent {
    pub fn parse(payload: &str) -> Result<Self, MalformedEvent> {
        serde_json::from_str(payload.trim()).map_err(|e| MalformedEvent { reason: e.to_string() })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProgressEvent::TotalPages { .. } => "total_pages",
            ProgressEvent::PageStart { .. } => "page_start",
            ProgressEvent::PageComplete { .. } => "page_complete",
            ProgressEvent::Saving { .. } => "saving",
            ProgressEvent::Complete { .. } => "complete",
        }
    }
}

/// Advisory progress observer. Every method defaults to a no-op.
pub trait ProgressObserver: Send {
    fn upload_progress(&mut self, _percent: u8) {}

    fn page_progress(&mut self, _current: u32, _total: u32) {}

    /// Raw event, fired before its effect on page progress. Lets observers tell
    /// `page_start` from `page_complete`.
    fn event(&mut self, _event: &ProgressEvent) {}
}

impl ProgressObserver for () {}

impl<T: ProgressObserver + ?Sized> ProgressObserver for Box<T> {
    fn upload_progress(&mut self, percent: u8) {
        (**self).upload_progress(percent)
    }

    fn page_progress(&mut self, current: u32, total: u32) {
        (**self).page_progress(current, total)
    }

    fn event(&mut self, event: &ProgressEvent) {
        (**self).event(event)
    }
}

type UploadFn = Box<dyn FnMut(u8) + Send>;
type PageFn = Box<dyn FnMut(u32, u32) + Send>;

/// Closure-backed observer for callers that only care about one or two signals.
#[derive(Default)]
pub struct ProgressCallbacks {
    on_upload: Option<UploadFn>,
    on_page: Option<PageFn>,
}

impl ProgressCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_upload(mut self, f: impl FnMut(u8) + Send + 'static) -> Self {
        self.on_upload = Some(Box::new(f));
        self
    }

    pub fn on_page(mut self, f: impl FnMut(u32, u32) + Send + 'static) -> Self {
        self.on_page = Some(Box::new(f));
        self
    }
}

impl ProgressObserver for ProgressCallbacks {
    fn upload_progress(&mut self, percent: u8) {
        if let Some(f) = self.on_upload.as_mut() {
            f(percent);
        }
    }

    fn page_progress(&mut self, current: u32, total: u32) {
        if let Some(f) = self.on_page.as_mut() {
            f(current, total);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_shapes() {
        assert_eq!(
            ProgressEvent::parse(r#"{"type":"total_pages","total":3}"#).unwrap(),
            ProgressEvent::TotalPages { total: 3 }
        );
        assert_eq!(
            ProgressEvent::parse(r#"{"type": "page_start", "page": 1, "total": 3}"#).unwrap(),
            ProgressEvent::PageStart { page: 1, total: 3 }
        );
        assert_eq!(
            ProgressEvent::parse(r#"{"type":"complete"}"#).unwrap(),
            ProgressEvent::Complete { message: None }
        );
        assert_eq!(
            ProgressEvent::parse(r#"{"type":"complete","message":"Processing complete"}"#).unwrap(),
            ProgressEvent::Complete { message: Some("Processing complete".into()) }
        );
    }

    #[test]
    fn rejects_unknown_and_truncated_payloads() {
        assert!(ProgressEvent::parse(r#"{"type":"heartbeat"}"#).is_err());
        assert!(ProgressEvent::parse(r#"{"type":"page_start","pa"#).is_err());
        assert!(ProgressEvent::parse(r#"{"type":"total_pages","total":-1}"#).is_err());
        assert!(ProgressEvent::parse("").is_err());
    }

    #[test]
    fn callbacks_forward_only_what_was_registered() {
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut cb = ProgressCallbacks::new().on_page(move |c, t| sink.lock().unwrap().push((c, t)));
        cb.upload_progress(50);
        cb.page_progress(1, 2);
        assert_eq!(*seen.lock().unwrap(), vec![(1, 2)]);
    }
}
