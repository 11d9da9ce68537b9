use crate::core::arbiter::CompletionArbiter;
use crate::core::decoder::FrameDecoder;
use crate::core::error::{ProcessError, TransportError};
use crate::core::events::ProgressObserver;
use crate::core::model::{DocumentUpload, ProcessReport, TaskId, UploadTask};
use crate::plugins::http::driver::HttpDriver;
use crate::plugins::transport::{DriverContext, TransportDriver, TransportSignal, UploadRequest};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Drives upload+process tasks. Cheap to clone; tasks share nothing but the driver.
#[derive(Clone)]
pub struct Processor {
    driver: Arc<dyn TransportDriver>,
    ctx: DriverContext,
}

impl Processor {
    pub fn new(driver: Arc<dyn TransportDriver>, ctx: DriverContext) -> Self {
        Self { driver, ctx }
    }

    pub fn http(ctx: DriverContext) -> Result<Self, TransportError> {
        let driver = HttpDriver::new(&ctx)?;
        Ok(Self::new(Arc::new(driver), ctx))
    }

    /// Uploads `document`, follows the processing stream and resolves once.
    pub async fn process_document(
        &self,
        document: DocumentUpload,
        model: &str,
        mut observer: impl ProgressObserver,
    ) -> Result<ProcessReport, ProcessError> {
        let task = UploadTask::new(document, model)?;
        self.run(task, &mut observer, CancellationToken::new()).await
    }

    /// Spawns the task and returns a handle that can cancel or await it.
    pub fn start<O>(&self, document: DocumentUpload, model: &str, observer: O) -> Result<UploadHandle, ProcessError>
    where
        O: ProgressObserver + 'static,
    {
        let task = UploadTask::new(document, model)?;
        let id = task.id;
        let token = CancellationToken::new();

        let processor = self.clone();
        let run_token = token.clone();
        let join = tokio::spawn(async move {
            let mut observer = observer;
            processor.run(task, &mut observer, run_token).await
        });

        Ok(UploadHandle { id, token, join })
    }

    async fn run(
        &self,
        task: UploadTask,
        observer: &mut dyn ProgressObserver,
        token: CancellationToken,
    ) -> Result<ProcessReport, ProcessError> {
        let span = tracing::info_span!("process", task = %task.id, model = %task.target_model);
        self.drive(task, observer, token).instrument(span).await
    }

    async fn drive(
        &self,
        task: UploadTask,
        observer: &mut dyn ProgressObserver,
        token: CancellationToken,
    ) -> Result<ProcessReport, ProcessError> {
        let req = UploadRequest {
            task_id: task.id,
            document: task.document.clone(),
            model: task.target_model.clone(),
        };
        let mut arbiter = CompletionArbiter::new(task);
        if token.is_cancelled() {
            arbiter.cancel();
            return arbiter.into_outcome();
        }

        arbiter.begin();
        tracing::info!(driver = self.driver.name(), file = %req.document.file_name, size = req.document.size(), "upload started");

        let opened = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            opened = self.driver.open(&req, &self.ctx) => Some(opened),
        };
        let mut session = match opened {
            None => {
                arbiter.cancel();
                return arbiter.into_outcome();
            }
            Some(Err(e)) => {
                arbiter.transport_closed(Err(e));
                return arbiter.into_outcome();
            }
            Some(Ok(session)) => session,
        };

        let mut decoder = FrameDecoder::new();
        while !arbiter.is_settled() {
            let signal = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    arbiter.cancel();
                    break;
                }
                signal = session.next() => signal,
            };
            // 取消可能在信号到达后才发出：不再回调
            if token.is_cancelled() {
                arbiter.cancel();
                break;
            }

            match signal {
                Some(TransportSignal::BytesSent { sent, total }) => arbiter.bytes_sent(sent, total, observer),
                Some(TransportSignal::Status(status)) => {
                    tracing::debug!(status, "response status");
                    arbiter.response_status(status);
                }
                Some(TransportSignal::Chunk(bytes)) => {
                    arbiter.body_received(bytes.len());
                    if !arbiter.accepts_events() {
                        continue;
                    }
                    for payload in decoder.push(&bytes) {
                        if token.is_cancelled() {
                            arbiter.cancel();
                            break;
                        }
                        arbiter.interpret(&payload, observer);
                        if arbiter.is_settled() {
                            break;
                        }
                    }
                }
                Some(TransportSignal::Closed(result)) => {
                    if result.is_ok() && arbiter.accepts_events() {
                        if let Some(payload) = decoder.finish() {
                            arbiter.interpret(&payload, observer);
                        }
                    }
                    arbiter.transport_closed(result);
                }
                None => arbiter.transport_closed(Err(TransportError::Disconnected)),
            }
        }

        session.abort();
        arbiter.into_outcome()
    }
}

/// Handle to a spawned task. Dropping it detaches the task without cancelling it.
#[derive(Debug)]
pub struct UploadHandle {
    id: TaskId,
    token: CancellationToken,
    join: JoinHandle<Result<ProcessReport, ProcessError>>,
}

impl UploadHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Requests cancellation. A callback already running finishes; none start afterwards.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Token for layering deadlines or shutdown on top of the task.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub async fn wait(self) -> Result<ProcessReport, ProcessError> {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => Err(ProcessError::Cancelled),
            Err(e) => Err(ProcessError::Internal(e.to_string())),
        }
    }
}
