//! # Production Task
//!
//! One tokio task per session walks the decoded track window by window,
//! feeding each record to the analyzer and both delivery queues.
//!
//! ## Flow per record:
//! 1. Extract the next window through the `ChunkSequencer`, on the blocking pool
//! 2. Append it to the analyzer (sliding window + full history)
//! 3. Push it onto the chunk queue, waiting while the queue is full
//! 4. Every `analysis_interval` records, publish an `AnalysisReport`
//! 5. Yield for `producer_yield` so connection handlers get scheduled
//!
//! Every wait observes the session's cancellation token. Cancellation is not
//! an error: the task stops without touching the queues again and the drop
//! guard releases the session.

use futures_util::FutureExt;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::queue::QueueError;
use super::session::StreamSession;
use crate::analysis::RelationalAnalyzer;
use crate::audio::sequencer::SequenceError;
use crate::audio::{ChunkSequencer, FeatureExtractor, FeatureRecord};
use crate::error::StreamError;

/// Releases the session when the task ends because it was cancelled.
struct ReleaseOnCancel(Arc<StreamSession>);

impl Drop for ReleaseOnCancel {
    fn drop(&mut self) {
        if self.0.cancel_token().is_cancelled() {
            self.0.release();
        }
    }
}

/// Spawn the production task for `session`.
pub fn spawn(session: Arc<StreamSession>, extractor: Arc<dyn FeatureExtractor>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let _guard = ReleaseOnCancel(session.clone());
        let session_id = session.id().to_string();

        match AssertUnwindSafe(produce(&session, extractor)).catch_unwind().await {
            Ok(Ok(produced)) => {
                info!(session_id = %session_id, produced, "Production completed");
            }
            Ok(Err(StreamError::Cancelled)) => {
                debug!(session_id = %session_id, "Production cancelled");
            }
            Ok(Err(err)) => {
                error!(session_id = %session_id, error = %err, "Production failed");
                session.fail(err.to_string());
            }
            Err(payload) => {
                let message = panic_message(&*payload);
                error!(session_id = %session_id, panic = %message, "Production task panicked");
                session.fail(format!("production task panicked: {}", message));
            }
        }
    })
}

async fn produce(
    session: &StreamSession,
    extractor: Arc<dyn FeatureExtractor>,
) -> Result<usize, StreamError> {
    let samples = session.samples().ok_or(StreamError::Cancelled)?;
    let settings = session.settings().clone();
    let cancel = session.cancel_token().clone();

    let mut sequencer = ChunkSequencer::new(
        samples,
        session.sample_rate(),
        settings.chunk_duration_seconds,
        extractor,
    );
    let total = sequencer.total_windows();
    let mut analyzer = RelationalAnalyzer::new(
        settings.analysis_window_size,
        settings.chunk_duration_seconds,
        session.history().clone(),
    );
    let interval = settings.analysis_interval.max(1);

    debug!(session_id = %session.id(), total, "Production loop starting");

    let mut processed = 0;
    let mut pending = 0;
    loop {
        let (rest, next) = next_window(sequencer).await?;
        sequencer = rest;
        let Some(next) = next else {
            break;
        };
        if cancel.is_cancelled() {
            return Err(StreamError::Cancelled);
        }
        let record = next.map_err(|err| StreamError::ProductionFailure(err.to_string()))?;

        analyzer.add_record(record.clone());
        session
            .chunk_queue()
            .push(record, &cancel)
            .await
            .map_err(|err| queue_error(err, &cancel))?;

        processed += 1;
        pending += 1;
        if processed < total {
            session.record_progress(processed);
        }

        if pending == interval {
            pending = 0;
            publish_report(session, &analyzer, &cancel).await?;
        }

        pause(settings.producer_yield, &cancel).await?;
    }

    if pending > 0 {
        publish_report(session, &analyzer, &cancel).await?;
    }

    session
        .chunk_queue()
        .finish()
        .map_err(|err| queue_error(err, &cancel))?;
    session
        .analysis_queue()
        .finish()
        .map_err(|err| queue_error(err, &cancel))?;

    session.complete(processed);
    Ok(processed)
}

/// Run one window's extraction on the blocking pool so the FFT work never
/// occupies the worker thread that serves connections.
async fn next_window(
    mut sequencer: ChunkSequencer,
) -> Result<(ChunkSequencer, Option<Result<FeatureRecord, SequenceError>>), StreamError> {
    let task = tokio::task::spawn_blocking(move || {
        let next = sequencer.next();
        (sequencer, next)
    });

    match task.await {
        Ok(result) => Ok(result),
        // Re-raised so the task boundary reports it like any other panic.
        Err(err) if err.is_panic() => panic::resume_unwind(err.into_panic()),
        Err(_) => Err(StreamError::Cancelled),
    }
}

async fn publish_report(
    session: &StreamSession,
    analyzer: &RelationalAnalyzer,
    cancel: &CancellationToken,
) -> Result<(), StreamError> {
    let Some(report) = analyzer.analyze() else {
        return Ok(());
    };

    session.reports().append(report.clone());
    session
        .analysis_queue()
        .push(report, cancel)
        .await
        .map_err(|err| queue_error(err, cancel))
}

async fn pause(duration: Duration, cancel: &CancellationToken) -> Result<(), StreamError> {
    if duration.is_zero() {
        tokio::task::yield_now().await;
    } else {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = cancel.cancelled() => {}
        }
    }

    if cancel.is_cancelled() {
        Err(StreamError::Cancelled)
    } else {
        Ok(())
    }
}

/// A queue closed by teardown means cancellation; closed for any other reason is a bug.
fn queue_error(err: QueueError, cancel: &CancellationToken) -> StreamError {
    match err {
        QueueError::Cancelled => StreamError::Cancelled,
        QueueError::Closed if cancel.is_cancelled() => StreamError::Cancelled,
        QueueError::Closed => {
            warn!("Queue closed while production was still running");
            StreamError::ProductionFailure(err.to_string())
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
