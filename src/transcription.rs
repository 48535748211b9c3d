//! Transcription Orchestrator (spec.md §4.6). One background task per
//! accepted transcription job, owning exactly one chunk-consumer loop
//! until the job ends.
//!
//! The process-wide per-job broadcast map is grounded on `engine/state.rs`'s
//! `active_runs: HashMap<String, AbortHandle>` (Design Note §9: "model the
//! per-job broadcast as an owned object stored in a process-wide
//! registry"). The single-writer/single-reader chunk queue is an
//! `mpsc::unbounded_channel` drained by one spawned task — `OnChunk` is a
//! synchronous `FnMut` (spec.md §6), so it cannot itself `.await` the STT
//! call; it only enqueues, and the spawned consumer is the sole reader,
//! which is what keeps `consecutive_errors`/`stream_offset` lock-free.

use crate::domain::{Job, JobStatus, LogEntry, Severity, TranscriptionSegment};
use crate::error::{EngineError, EngineResult};
use crate::external::{AudioCaptureDriver, ProviderKeyResolver, TranscriptionClient};
use chrono::Utc;
use log::{error, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const CHUNK_DURATION: Duration = Duration::from_secs(3);
const MAX_CONSECUTIVE_FAILURES: u32 = 5;
const BROADCAST_CAPACITY: usize = 256;

fn now() -> String {
    Utc::now().to_rfc3339()
}

/// Collaborators the orchestrator needs beyond the job store: the
/// out-of-scope audio driver and STT client (spec.md §6), and the
/// optional provider-key vault (§4.6 step 1).
pub struct TranscriptionOrchestrator {
    job_store: Arc<dyn crate::external::JobStore>,
    capture: Arc<dyn AudioCaptureDriver>,
    transcriber: Arc<dyn TranscriptionClient>,
    key_resolver: Option<Arc<dyn ProviderKeyResolver>>,
    active: Mutex<HashMap<String, CancellationToken>>,
    channels: Mutex<HashMap<String, broadcast::Sender<TranscriptionSegment>>>,
}

impl TranscriptionOrchestrator {
    pub fn new(
        job_store: Arc<dyn crate::external::JobStore>,
        capture: Arc<dyn AudioCaptureDriver>,
        transcriber: Arc<dyn TranscriptionClient>,
        key_resolver: Option<Arc<dyn ProviderKeyResolver>>,
    ) -> Self {
        Self {
            job_store,
            capture,
            transcriber,
            key_resolver,
            active: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
        }
    }

    async fn log(&self, job_id: &str, severity: Severity, message: impl Into<String>) {
        let entry = LogEntry {
            id: Uuid::new_v4().to_string(),
            job_id: job_id.to_string(),
            severity,
            message: message.into(),
            created_at: now(),
        };
        if let Err(e) = self.job_store.append_log(&entry).await {
            error!("[transcription] failed to append log for job {job_id}: {e}");
        }
    }

    /// Start(jobId, modelId, deviceId, language) — spec.md §4.6.
    /// `job` must already carry its transcription payload fields.
    pub async fn start(&self, job: Job, ct: CancellationToken) -> EngineResult<()> {
        let job_id = job.id.clone();
        {
            let active = self.active.lock();
            if active.contains_key(&job_id) {
                return Err(EngineError::InvariantViolation(format!(
                    "transcription already started for job {job_id}"
                )));
            }
        }

        let model_id = job
            .payload
            .transcription_model
            .clone()
            .ok_or_else(|| EngineError::Validation("transcription job missing modelId".to_string()))?;
        let device_id = job
            .payload
            .transcription_device_id
            .clone()
            .ok_or_else(|| EngineError::Validation("transcription job missing deviceId".to_string()))?;
        let language = job.payload.transcription_language.clone();

        if let Some(resolver) = &self.key_resolver {
            // Decrypted only to confirm resolution succeeds before capture
            // starts; the key itself is zeroized on drop and never logged
            // or forwarded — the concrete `TranscriptionClient` is
            // responsible for its own provider authentication.
            let _key = resolver.resolve_key(&model_id).await?;
        }

        let (tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        self.channels.lock().insert(job_id.clone(), tx.clone());
        self.active.lock().insert(job_id.clone(), ct.clone());

        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<(Vec<u8>, u32)>();

        let on_chunk: crate::external::OnChunk = Box::new(move |wav, idx| {
            chunk_tx
                .send((wav, idx))
                .map_err(|_| EngineError::Other("transcription chunk queue closed".to_string()))
        });

        let capture = self.capture.clone();
        let capture_ct = ct.clone();
        let capture_device = device_id.clone();
        tokio::spawn(async move {
            if let Err(e) = capture.capture(&capture_device, CHUNK_DURATION, on_chunk, capture_ct).await {
                if !matches!(e, EngineError::Cancelled) {
                    error!("[transcription] capture driver error: {e}");
                }
            }
        });

        let job_store = self.job_store.clone();
        let transcriber = self.transcriber.clone();
        let consumer_ct = ct.clone();

        tokio::spawn(async move {
            let mut stream_offset = 0.0f64;
            let mut consecutive_errors = 0u32;

            loop {
                let chunk = tokio::select! {
                    biased;
                    _ = consumer_ct.cancelled() => break,
                    chunk = chunk_rx.recv() => chunk,
                };
                let Some((wav, _idx)) = chunk else { break };

                match transcriber.transcribe(&model_id, &wav, language.as_deref()).await {
                    Ok(transcription) => {
                        for segment in &transcription.segments {
                            let record = TranscriptionSegment {
                                id: Uuid::new_v4().to_string(),
                                job_id: job_id.clone(),
                                start_time: stream_offset + segment.start,
                                end_time: stream_offset + segment.end,
                                text: segment.text.clone(),
                                confidence: segment.confidence,
                                created_at: now(),
                            };
                            if let Err(e) = job_store.append_segment(&record).await {
                                error!("[transcription] failed to persist segment for job {job_id}: {e}");
                            }
                            let _ = tx.send(record);
                        }
                        stream_offset += transcription.duration;
                        consecutive_errors = 0;
                    }
                    Err(e) => {
                        consecutive_errors += 1;
                        warn!("[transcription] chunk failure {consecutive_errors}/{MAX_CONSECUTIVE_FAILURES} for job {job_id}: {e}");
                        if consecutive_errors >= MAX_CONSECUTIVE_FAILURES {
                            if let Ok(Some(mut failed)) = job_store.get_job(&job_id).await {
                                if !failed.status.is_terminal() {
                                    failed.status = JobStatus::Failed;
                                    failed.error_log = Some(format!(
                                        "{MAX_CONSECUTIVE_FAILURES} consecutive transcription failures: {e}"
                                    ));
                                    failed.completed_at = Some(now());
                                    let _ = job_store.update_job(&failed).await;
                                }
                            }
                            let entry = LogEntry {
                                id: Uuid::new_v4().to_string(),
                                job_id: job_id.clone(),
                                severity: Severity::Error,
                                message: format!("transcription failed after {MAX_CONSECUTIVE_FAILURES} consecutive chunk errors: {e}"),
                                created_at: now(),
                            };
                            let _ = job_store.append_log(&entry).await;
                            break;
                        }
                    }
                }
            }
        });

        self.log(&job_id, Severity::Info, format!("transcription started on device {device_id}")).await;
        Ok(())
    }

    /// StopTranscription(jobId) — cleanly ends capture without marking the
    /// job `Cancelled` (that distinction is the job lifecycle manager's to
    /// make; this just tears down the background task and channel).
    pub async fn stop(&self, job_id: &str) -> EngineResult<()> {
        self.end(job_id).await;
        self.log(job_id, Severity::Info, "transcription stopped").await;
        Ok(())
    }

    /// Cancel(jobId) for a transcription job: signal + close channel,
    /// same teardown as `stop`, distinguished only by the caller's
    /// resulting job status.
    pub async fn cancel(&self, job_id: &str) -> EngineResult<()> {
        self.end(job_id).await;
        Ok(())
    }

    async fn end(&self, job_id: &str) {
        if let Some(ct) = self.active.lock().remove(job_id) {
            ct.cancel();
        }
        // Dropping the sender closes the broadcast channel for all
        // subscribers (spec.md §4.4's "closes its broadcast channel").
        self.channels.lock().remove(job_id);
    }

    /// Subscribe(jobId) — spec.md §4.6.
    pub fn subscribe(&self, job_id: &str) -> Option<broadcast::Receiver<TranscriptionSegment>> {
        self.channels.lock().get(job_id).map(|tx| tx.subscribe())
    }

    pub fn is_active(&self, job_id: &str) -> bool {
        self.active.lock().contains_key(job_id)
    }

    /// On process restart, any transcription job left `Executing` or
    /// `Queued` in persisted state is reconciled to `Cancelled` (spec.md
    /// §4.6).
    pub async fn reconcile_stale_on_startup(&self) -> EngineResult<usize> {
        let stale = self.job_store.list_stale_transcription_jobs().await?;
        let count = stale.len();
        for mut job in stale {
            job.status = JobStatus::Cancelled;
            job.completed_at = Some(now());
            self.job_store.update_job(&job).await?;
            self.log(&job.id, Severity::Warning, "reconciled to Cancelled after process restart").await;
        }
        Ok(count)
    }
}
