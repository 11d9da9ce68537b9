//! Client for a document fine-tuning backend.
//!
//! The centrepiece is [`core::engine::Processor`], which uploads a document to
//! `process_doc` and follows the `data: <json>` progress stream the backend
//! writes back on the same response.

pub mod core;
pub mod plugins;

pub use crate::core::engine::{Processor, UploadHandle};
pub use crate::core::error::{ProcessError, TransportError};
pub use crate::core::events::{ProgressCallbacks, ProgressEvent, ProgressObserver};
pub use crate::core::model::{DocumentUpload, PageProgress, ProcessReport, TaskId};
pub use crate::plugins::transport::DriverContext;
