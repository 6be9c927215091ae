//! # Transcription Worker
//!
//! Runs a [`TranscriptionSession`] on a dedicated thread so callers never
//! block on the spectral transform. Requests go in over a crossbeam channel
//! and results come back as [`WorkerEvent`]s.
//!
//! Every request gets a generation number. Submitting a request supersedes
//! all earlier ones: a queued request still applies its change (new audio or
//! new settings) but skips the analysis, and a run already in progress
//! notices at the next frame and stops. Only the newest request publishes.
//!
//! The event queue holds at most [`EVENT_CAPACITY`] events. A caller that
//! stops draining [`TranscriptionWorker::events`] loses the oldest ones first.

use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use crate::config::PipelineConfig;
use crate::error::{TabError, TabResult};
use crate::session::{SnapshotHandle, TranscriptionSession};
use crate::Transcription;

/// Undrained events kept before the oldest is discarded.
pub const EVENT_CAPACITY: usize = 64;

#[derive(Debug)]
enum Command {
    Transcribe(Arc<[f32]>),
    UpdateSensitivity(f32),
    Reconfigure(Box<PipelineConfig>),
}

#[derive(Debug)]
struct Request {
    generation: u64,
    command: Command,
}

/// Outcome of one request.
#[derive(Debug)]
pub enum WorkerEvent {
    Completed {
        generation: u64,
        transcription: Arc<Transcription>,
    },
    /// A newer request arrived before this one finished.
    Cancelled { generation: u64 },
    Failed { generation: u64, error: TabError },
}

impl WorkerEvent {
    pub fn generation(&self) -> u64 {
        match self {
            WorkerEvent::Completed { generation, .. }
            | WorkerEvent::Cancelled { generation }
            | WorkerEvent::Failed { generation, .. } => *generation,
        }
    }
}

/// Handle to the background transcription thread.
#[derive(Debug)]
pub struct TranscriptionWorker {
    request_tx: Sender<Request>,
    event_rx: Receiver<WorkerEvent>,
    shutdown_tx: Sender<()>,
    thread_handle: Option<JoinHandle<()>>,
    latest: Arc<AtomicU64>,
    snapshot: SnapshotHandle,
}

impl TranscriptionWorker {
    /// Moves `session` onto a new worker thread.
    pub fn spawn(session: TranscriptionSession) -> TabResult<Self> {
        let (request_tx, request_rx) = crossbeam_channel::unbounded::<Request>();
        let (event_tx, event_rx) = crossbeam_channel::bounded(EVENT_CAPACITY);
        let overflow_rx = event_rx.clone();
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);
        let latest = Arc::new(AtomicU64::new(0));
        let snapshot = session.snapshot_handle();

        let thread_latest = latest.clone();
        let thread_handle = thread::Builder::new()
            .name("fretscribe-worker".to_string())
            .spawn(move || {
                run_worker(session, request_rx, event_tx, overflow_rx, shutdown_rx, thread_latest)
            })?;

        Ok(Self {
            request_tx,
            event_rx,
            shutdown_tx,
            thread_handle: Some(thread_handle),
            latest,
            snapshot,
        })
    }

    /// Queues a new audio buffer. Returns the request's generation.
    pub fn transcribe(&self, samples: impl Into<Arc<[f32]>>) -> TabResult<u64> {
        self.submit(Command::Transcribe(samples.into()))
    }

    pub fn update_sensitivity(&self, factor: f32) -> TabResult<u64> {
        self.submit(Command::UpdateSensitivity(factor))
    }

    pub fn reconfigure(&self, config: PipelineConfig) -> TabResult<u64> {
        self.submit(Command::Reconfigure(Box::new(config)))
    }

    /// Completion, cancellation and failure reports, one per request.
    pub fn events(&self) -> &Receiver<WorkerEvent> {
        &self.event_rx
    }

    /// The latest published transcription.
    pub fn snapshot(&self) -> Arc<Transcription> {
        self.snapshot.load()
    }

    /// Generation of the most recently submitted request, 0 if none.
    pub fn latest_generation(&self) -> u64 {
        self.latest.load(Ordering::SeqCst)
    }

    /// Cancels any run in progress, stops the thread and waits for it.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn submit(&self, command: Command) -> TabResult<u64> {
        let generation = self.latest.fetch_add(1, Ordering::SeqCst) + 1;
        self.request_tx
            .send(Request {
                generation,
                command,
            })
            .map_err(|_| TabError::WorkerDisconnected)?;
        Ok(generation)
    }

    fn stop(&mut self) {
        let Some(handle) = self.thread_handle.take() else {
            return;
        };
        // Bumping the generation makes an in-flight run give up.
        self.latest.fetch_add(1, Ordering::SeqCst);
        let _ = self.shutdown_tx.try_send(());
        if handle.join().is_err() {
            log::warn!("Transcription worker thread panicked");
        }
    }
}

impl Drop for TranscriptionWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker(
    mut session: TranscriptionSession,
    request_rx: Receiver<Request>,
    event_tx: Sender<WorkerEvent>,
    overflow_rx: Receiver<WorkerEvent>,
    shutdown_rx: Receiver<()>,
    latest: Arc<AtomicU64>,
) {
    log::debug!("Transcription worker started");
    loop {
        crossbeam_channel::select! {
            recv(request_rx) -> msg => match msg {
                Ok(request) => {
                    let event = handle_request(&mut session, request, &latest);
                    deliver(&event_tx, &overflow_rx, event);
                }
                Err(_) => break,
            },
            recv(shutdown_rx) -> _ => {
                log::debug!("Transcription worker received shutdown signal");
                break;
            }
        }
    }
    log::debug!("Transcription worker finished");
}

/// Queues `event`, discarding the oldest undrained event if the queue is full.
fn deliver(
    event_tx: &Sender<WorkerEvent>,
    overflow_rx: &Receiver<WorkerEvent>,
    event: WorkerEvent,
) {
    let mut pending = event;
    loop {
        match event_tx.try_send(pending) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => return,
            Err(TrySendError::Full(event)) => {
                if let Ok(dropped) = overflow_rx.try_recv() {
                    log::debug!("Event queue full, dropped event {}", dropped.generation());
                }
                pending = event;
            }
        }
    }
}

fn handle_request(
    session: &mut TranscriptionSession,
    request: Request,
    latest: &AtomicU64,
) -> WorkerEvent {
    let generation = request.generation;
    let applied = match request.command {
        Command::Transcribe(samples) => {
            session.set_samples(samples);
            Ok(())
        }
        Command::UpdateSensitivity(factor) => session.set_sensitivity(factor),
        Command::Reconfigure(config) => session.apply_config(*config),
    };
    if let Err(error) = applied {
        log::warn!("Request {} rejected: {}", generation, error);
        return WorkerEvent::Failed { generation, error };
    }

    let superseded = || latest.load(Ordering::SeqCst) != generation;
    if superseded() {
        log::debug!("Request {} superseded before it started", generation);
        return WorkerEvent::Cancelled { generation };
    }

    match session.refresh(&superseded) {
        Ok(transcription) => WorkerEvent::Completed {
            generation,
            transcription,
        },
        Err(TabError::Cancelled) => {
            log::warn!("Request {} abandoned for a newer one", generation);
            WorkerEvent::Cancelled { generation }
        }
        Err(error) => {
            log::warn!("Request {} failed: {}", generation, error);
            WorkerEvent::Failed { generation, error }
        }
    }
}
