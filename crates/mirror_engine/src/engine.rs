use std::io;
use std::sync::{mpsc, Mutex};
use std::thread;

use pipeline_logging::{pipeline_info, pipeline_warn};
use tokio::sync::mpsc as async_mpsc;

use crate::config::MirrorConfig;
use crate::fetch::ChannelProgressSink;
use crate::mirror::MediaMirror;
use crate::{EngineEvent, JobId};

/// One detached mirror batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorJob {
    pub job_id: JobId,
    pub urls: Vec<String>,
    pub config: MirrorConfig,
}

/// Accepts mirror jobs off the request path.
///
/// `schedule` returns before the job runs; its outcome is never reported back
/// to the caller that scheduled it. [`EngineHandle`] runs jobs one after
/// another, so at most one batch window is in flight across all jobs.
pub trait MirrorScheduler: Send + Sync {
    fn schedule(&self, job: MirrorJob);
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to start mirror worker: {0}")]
    Startup(#[from] io::Error),
}

enum EngineCommand {
    Mirror(MirrorJob),
}

/// Background worker: a dedicated thread running its own tokio runtime,
/// fed through a channel.
pub struct EngineHandle {
    cmd_tx: Mutex<Option<async_mpsc::UnboundedSender<EngineCommand>>>,
    event_rx: Mutex<mpsc::Receiver<EngineEvent>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl EngineHandle {
    pub fn new(mirror: MediaMirror) -> Result<Self, EngineError> {
        let (cmd_tx, mut cmd_rx) = async_mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel();
        let runtime = tokio::runtime::Runtime::new()?;

        let worker = thread::Builder::new()
            .name("mirror-worker".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    // One batch at a time keeps outbound work within `upload_concurrency`.
                    // After the channel closes, queued jobs are still drained.
                    while let Some(command) = cmd_rx.recv().await {
                        handle_command(&mirror, command, event_tx.clone()).await;
                    }
                });
            })?;

        Ok(Self {
            cmd_tx: Mutex::new(Some(cmd_tx)),
            event_rx: Mutex::new(event_rx),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn try_recv(&self) -> Option<EngineEvent> {
        self.event_rx.lock().ok()?.try_recv().ok()
    }

    /// Stop accepting jobs and block until every scheduled batch has finished.
    ///
    /// Returns the events not yet taken with [`EngineHandle::try_recv`].
    /// Must not be called from inside an async task.
    pub fn shutdown(&self) -> Vec<EngineEvent> {
        if let Ok(mut cmd_tx) = self.cmd_tx.lock() {
            cmd_tx.take();
        }
        let worker = self.worker.lock().ok().and_then(|mut worker| worker.take());
        if let Some(worker) = worker {
            if worker.join().is_err() {
                pipeline_warn!("Mirror worker panicked during shutdown");
            }
        }
        self.event_rx
            .lock()
            .map(|events| events.try_iter().collect())
            .unwrap_or_default()
    }
}

impl MirrorScheduler for EngineHandle {
    fn schedule(&self, job: MirrorJob) {
        let job_id = job.job_id;
        let sent = match self.cmd_tx.lock() {
            Ok(cmd_tx) => cmd_tx
                .as_ref()
                .is_some_and(|tx| tx.send(EngineCommand::Mirror(job)).is_ok()),
            Err(_) => false,
        };
        if !sent {
            pipeline_warn!("Mirror worker unavailable, dropping job {}", job_id);
        }
    }
}

async fn handle_command(mirror: &MediaMirror, command: EngineCommand, event_tx: mpsc::Sender<EngineEvent>) {
    match command {
        EngineCommand::Mirror(job) => {
            pipeline_info!("Mirror job {} started with {} url(s)", job.job_id, job.urls.len());
            let sink = ChannelProgressSink::new(event_tx.clone());
            let stats = mirror.mirror(&job.urls, &job.config, &sink).await;
            let _ = event_tx.send(EngineEvent::MirrorCompleted {
                job_id: job.job_id,
                stats,
            });
        }
    }
}
