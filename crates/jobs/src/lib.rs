//! Background detector runs.
//!
//! Detection can take seconds per image, so it runs on worker threads. The
//! editing thread submits a request, keeps polling the event stream, and
//! applies the result itself once a `Done` event arrives.

use annotations::FrameId;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use detect::{Detection, Detector};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("worker stopped")]
    Stopped,
}

pub type JobId = String;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectionRequest {
    /// Frame the result belongs to; used to discard results that arrive after
    /// the editor moved on.
    pub frame: FrameId,
    pub image: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobStatus {
    Pending,
    Running,
    Done(Vec<Detection>),
    Failed(String),
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool { matches!(self, JobStatus::Done(_) | JobStatus::Failed(_) | JobStatus::Canceled) }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobEvent {
    pub id: JobId,
    pub frame: FrameId,
    pub status: JobStatus,
}

#[derive(Clone, Debug)]
pub struct JobsHandle {
    tx_submit: Sender<(JobId, DetectionRequest)>,
    tx_events: Sender<JobEvent>,
    canceled: Arc<Mutex<HashSet<JobId>>>,
    pub rx_events: Receiver<JobEvent>,
}

pub struct JobsRuntime;

impl JobsRuntime {
    /// Starts `num_workers` threads running `detector`. The workers exit once
    /// every handle has been dropped.
    pub fn start(detector: Arc<dyn Detector>, num_workers: usize) -> JobsHandle {
        let (tx_submit, rx_submit) = unbounded::<(JobId, DetectionRequest)>();
        let (tx_events, rx_events) = unbounded::<JobEvent>();
        let canceled = Arc::new(Mutex::new(HashSet::new()));

        for _ in 0..num_workers.max(1) {
            let rx = rx_submit.clone();
            let tx_e = tx_events.clone();
            let canceled = canceled.clone();
            let detector = detector.clone();
            thread::spawn(move || {
                while let Ok((id, req)) = rx.recv() {
                    run_job(detector.as_ref(), &canceled, &tx_e, id, req);
                }
            });
        }

        JobsHandle { tx_submit, tx_events, canceled, rx_events }
    }
}

fn run_job(
    detector: &dyn Detector,
    canceled: &Mutex<HashSet<JobId>>,
    tx_e: &Sender<JobEvent>,
    id: JobId,
    req: DetectionRequest,
) {
    let event = |status| JobEvent { id: id.clone(), frame: req.frame.clone(), status };
    if canceled.lock().remove(&id) {
        let _ = tx_e.send(event(JobStatus::Canceled));
        return;
    }
    let _ = tx_e.send(event(JobStatus::Running));
    let status = match detector.detect(&req.image) {
        Ok(found) => {
            debug!(job = %id, frame = %req.frame, detections = found.len(), "detection finished");
            JobStatus::Done(found)
        }
        Err(e) => {
            warn!(job = %id, frame = %req.frame, "detection failed: {e}");
            JobStatus::Failed(e.to_string())
        }
    };
    // a cancel that came in while the detector ran still wins
    let status = if canceled.lock().remove(&id) { JobStatus::Canceled } else { status };
    let _ = tx_e.send(event(status));
}

impl JobsHandle {
    pub fn enqueue(&self, req: DetectionRequest) -> Result<JobId, JobError> {
        let id = Uuid::new_v4().to_string();
        let frame = req.frame.clone();
        self.tx_submit.send((id.clone(), req)).map_err(|_| JobError::Stopped)?;
        let _ = self.tx_events.send(JobEvent { id: id.clone(), frame, status: JobStatus::Pending });
        Ok(id)
    }

    /// Marks a job as canceled. A job that has not started is skipped; a
    /// running one finishes but reports `Canceled` instead of its result.
    pub fn cancel_job(&self, job_id: &str) { self.canceled.lock().insert(job_id.to_string()); }

    pub fn try_next_event(&self) -> Option<JobEvent> { self.rx_events.try_recv().ok() }

    pub fn next_event_timeout(&self, timeout: Duration) -> Result<Option<JobEvent>, JobError> {
        match self.rx_events.recv_timeout(timeout) {
            Ok(ev) => Ok(Some(ev)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(JobError::Stopped),
        }
    }
}
