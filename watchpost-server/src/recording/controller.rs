//! Recording controller: owns the session state machine and the writer of
//! the active session.
//!
//! Every input (manual command, motion trigger, timer tick, camera failure,
//! frame) goes through one mutex, is fed to [`RecorderMachine`] and the
//! effects it returns are carried out before the lock is released. That
//! keeps "one session at a time" true no matter how triggers race.

use std::collections::VecDeque;
use std::fs::File;
use std::future::Future;
use std::io::{self, BufWriter};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::time::{interval, MissedTickBehavior};
use tokio_graceful_shutdown::SubsystemHandle;

use watchpost_core::recording::{Effect, FinalizeReason, RecorderEvent};
use watchpost_core::{
    Frame, MotionEvent, RecorderMachine, RecordingError, RecordingPolicy, SessionId, Trigger,
};

use super::file_format::{WprHeader, WprWriter};
use crate::config::ServiceClock;
use crate::error::ServiceError;
use crate::hub::FrameHub;
use crate::motion::TriggerSlot;
use crate::storage::{RecordingFile, StorageManager, RECORDING_EXTENSION};

#[derive(Error, Debug)]
pub enum RecorderError {
    #[error(transparent)]
    State(#[from] RecordingError),

    #[error("Cannot create recording {}: {source}", path.display())]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Snapshot of the controller for status queries
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingStatus {
    /// `idle`, `recording` or `finalizing`
    pub state: &'static str,
    pub trigger: Option<Trigger>,
    pub session_id: Option<SessionId>,
    pub filename: Option<String>,
    pub elapsed_ms: Option<u64>,
    /// Absent while idle and for unbounded sessions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_ms: Option<u64>,
    pub frame_count: u32,
    pub byte_count: u64,
    /// Frames refused because their sequence number went backwards
    pub dropped_out_of_order: u64,
    pub last_warning: Option<String>,
    /// Relative path of the most recently registered recording
    pub last_recording: Option<String>,
}

struct ActiveSession {
    id: SessionId,
    filename: String,
    path: PathBuf,
    started_at: DateTime<Local>,
    writer: WprWriter<BufWriter<File>>,
    last_seq: Option<u64>,
    first_frame_at: Option<DateTime<Utc>>,
}

struct Inner {
    machine: RecorderMachine,
    session: Option<ActiveSession>,
    dropped_out_of_order: u64,
    last_warning: Option<String>,
    last_recording: Option<RecordingFile>,
}

pub struct RecordingController {
    inner: Mutex<Inner>,
    storage: Arc<StorageManager>,
    hub: Arc<FrameHub>,
    motion_enabled: watch::Receiver<bool>,
    clock: ServiceClock,
}

impl RecordingController {
    pub fn new(
        policy: RecordingPolicy,
        storage: Arc<StorageManager>,
        hub: Arc<FrameHub>,
        motion_enabled: watch::Receiver<bool>,
        clock: ServiceClock,
    ) -> Self {
        RecordingController {
            inner: Mutex::new(Inner {
                machine: RecorderMachine::new(policy),
                session: None,
                dropped_out_of_order: 0,
                last_warning: None,
                last_recording: None,
            }),
            storage,
            hub,
            motion_enabled,
            clock,
        }
    }

    /// Start a manual session. `None` uses the policy default, which may be
    /// unbounded.
    pub async fn start_manual(&self, duration: Option<Duration>) -> Result<SessionId, RecorderError> {
        let mut inner = self.inner.lock().await;
        let duration_ms = duration.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        let effects = inner.machine.handle(
            RecorderEvent::ManualStart { duration_ms },
            self.clock.now_ms(),
            self.motion_enabled(),
        )?;
        self.carry_out(&mut inner, effects)?;
        // A session that failed to open is already back to idle
        inner
            .machine
            .state()
            .session()
            .ok_or(RecorderError::State(RecordingError::NotRecording))
    }

    /// Stop the active session, whatever started it
    pub async fn stop(&self) -> Result<(), RecorderError> {
        let mut inner = self.inner.lock().await;
        let effects = inner.machine.handle(
            RecorderEvent::ManualStop,
            self.clock.now_ms(),
            self.motion_enabled(),
        )?;
        self.carry_out(&mut inner, effects)
    }

    pub async fn on_motion(&self, event: MotionEvent) {
        self.feed(RecorderEvent::Motion(event)).await;
    }

    /// Check the session expiry
    pub async fn tick(&self) {
        self.feed(RecorderEvent::Tick).await;
    }

    /// The camera source was replaced mid-session
    pub async fn source_failed(&self) {
        self.feed(RecorderEvent::SourceFailure).await;
    }

    /// Finalize whatever is being written
    pub async fn shutdown(&self) {
        self.feed(RecorderEvent::Shutdown).await;
    }

    /// Append a frame to the active session, if any
    pub async fn on_frame(&self, frame: &Frame) {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        if !inner.machine.state().is_recording() {
            return;
        }
        let Some(session) = inner.session.as_mut() else {
            return;
        };

        if session.last_seq.is_some_and(|last| frame.seq <= last) {
            log::debug!(
                "Session {}: dropping frame {} after {:?}",
                session.id,
                frame.seq,
                session.last_seq
            );
            inner.dropped_out_of_order += 1;
            return;
        }

        let first = *session.first_frame_at.get_or_insert(frame.captured_at);
        let timestamp_ms = (frame.captured_at - first).num_milliseconds().max(0) as u64;
        match session.writer.write_frame(timestamp_ms, frame.seq, &frame.data) {
            Ok(_) => session.last_seq = Some(frame.seq),
            Err(e) => {
                let warning = format!("Write to {} failed: {}", session.filename, e);
                log::warn!("{}", warning);
                inner.last_warning = Some(warning);
                let effects = self.handle(inner, RecorderEvent::WriteFailure);
                let _ = self.carry_out(inner, effects);
            }
        }
    }

    pub async fn status(&self) -> RecordingStatus {
        let inner = self.inner.lock().await;
        let state = inner.machine.state();
        let now = self.clock.now_ms();
        let session = inner.session.as_ref();

        RecordingStatus {
            state: state.name(),
            trigger: state.trigger(),
            session_id: state.session(),
            filename: session.map(|s| s.filename.clone()),
            elapsed_ms: state.elapsed_ms(now),
            remaining_ms: state.remaining_ms(now),
            frame_count: session.map_or(0, |s| s.writer.frame_count()),
            byte_count: session.map_or(0, |s| s.writer.bytes_written()),
            dropped_out_of_order: inner.dropped_out_of_order,
            last_warning: inner.last_warning.clone(),
            last_recording: inner.last_recording.as_ref().map(|r| r.relative_path.clone()),
        }
    }

    pub async fn is_recording(&self) -> bool {
        self.inner.lock().await.machine.state().is_recording()
    }

    fn motion_enabled(&self) -> bool {
        *self.motion_enabled.borrow()
    }

    async fn feed(&self, event: RecorderEvent) {
        let mut inner = self.inner.lock().await;
        let effects = self.handle(&mut inner, event);
        if let Err(e) = self.carry_out(&mut inner, effects) {
            log::warn!("{}", e);
        }
    }

    /// Feed an event the machine cannot refuse
    fn handle(&self, inner: &mut Inner, event: RecorderEvent) -> Vec<Effect> {
        match inner
            .machine
            .handle(event, self.clock.now_ms(), self.motion_enabled())
        {
            Ok(effects) => effects,
            Err(e) => {
                log::debug!("{:?} refused: {}", event, e);
                Vec::new()
            }
        }
    }

    /// Perform effects, including the ones they cause in turn. Returns the
    /// first error opening a session.
    fn carry_out(&self, inner: &mut Inner, effects: Vec<Effect>) -> Result<(), RecorderError> {
        let mut queue: VecDeque<Effect> = effects.into();
        let mut failure = None;

        while let Some(effect) = queue.pop_front() {
            match effect {
                Effect::OpenSession { session, trigger } => match self.open(session, trigger) {
                    Ok(active) => {
                        log::info!("Recording {} started: {}", session, active.filename);
                        inner.session = Some(active);
                    }
                    Err(e) => {
                        log::error!("{}", e);
                        inner.last_warning = Some(e.to_string());
                        queue.extend(self.handle(inner, RecorderEvent::WriteFailure));
                        failure.get_or_insert(e);
                    }
                },
                Effect::Finalize { session, reason } => {
                    self.finalize(inner, session, reason);
                    queue.extend(self.handle(inner, RecorderEvent::Finalized));
                }
            }
        }

        failure.map_or(Ok(()), Err)
    }

    fn open(&self, id: SessionId, trigger: Trigger) -> Result<ActiveSession, RecorderError> {
        let started_at = Local::now();
        let filename = format!(
            "{}_{}.{}",
            trigger,
            started_at.format("%Y%m%d_%H%M%S"),
            RECORDING_EXTENSION
        );
        let path = self.storage.incoming_path(&filename);

        let (width, height) = self.hub.latest().map_or((0, 0), |f| (f.width, f.height));
        let mut header = WprHeader::new(
            trigger,
            width,
            height,
            self.hub.config().fps,
            started_at.timestamp_millis() as u64,
        );
        header.session_id = id;

        // One index entry per second of video
        let index_interval = self.hub.config().fps;
        let writer = File::create(&path)
            .map(BufWriter::new)
            .and_then(|file| WprWriter::new(file, &header))
            .map(|writer| writer.with_index_interval(index_interval))
            .map_err(|source| RecorderError::Create {
                path: path.clone(),
                source,
            })?;

        Ok(ActiveSession {
            id,
            filename,
            path,
            started_at,
            writer,
            last_seq: None,
            first_frame_at: None,
        })
    }

    fn finalize(&self, inner: &mut Inner, id: SessionId, reason: FinalizeReason) {
        let Some(active) = inner.session.take() else {
            return;
        };
        if active.id != id {
            log::warn!("Finalizing session {} while {} was open", id, active.id);
        }
        let frames = active.writer.frame_count();
        let duration_ms = active.writer.duration_ms();

        if let Err(e) = active.writer.finish() {
            let warning = format!("Closing {} failed, kept without index: {}", active.filename, e);
            log::warn!("{}", warning);
            inner.last_warning = Some(warning);
        }

        match reason {
            FinalizeReason::SourceFailure | FinalizeReason::WriteFailure => {
                let warning = format!("Recording {} cut short: {}", active.filename, reason);
                log::warn!("{}", warning);
                inner.last_warning = Some(warning);
            }
            _ => {}
        }

        match self.storage.register(&active.path, active.started_at) {
            Ok(file) => {
                log::info!(
                    "Recording {} finished ({}): {} frames, {} ms, {}",
                    id,
                    reason,
                    frames,
                    duration_ms,
                    file.relative_path
                );
                inner.last_recording = Some(file);
            }
            Err(e) => {
                let warning = format!("Cannot register {}: {}", active.filename, e);
                log::error!("{}", warning);
                inner.last_warning = Some(warning);
            }
        }
    }
}

// =============================================================================
// Task
// =============================================================================

/// Feeds frames, motion triggers, expiry ticks and source changes into the
/// controller
pub struct RecorderTask {
    controller: Arc<RecordingController>,
    slot: Arc<TriggerSlot>,
    tick: Duration,
}

impl RecorderTask {
    pub fn new(controller: Arc<RecordingController>, slot: Arc<TriggerSlot>, tick: Duration) -> Self {
        RecorderTask {
            controller,
            slot,
            tick,
        }
    }

    pub async fn run(self, subsys: SubsystemHandle) -> Result<(), ServiceError> {
        self.run_until(subsys.on_shutdown_requested()).await
    }

    pub async fn run_until<F: Future<Output = ()>>(self, shutdown: F) -> Result<(), ServiceError> {
        tokio::pin!(shutdown);
        let controller = &self.controller;
        let mut frames = controller.hub.subscribe();
        let mut hub_status = controller.hub.watch_status();
        let mut reopen_count = hub_status.borrow_and_update().reopen_count;

        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("Recorder shutdown requested");
                    break;
                }
                frame = frames.recv() => match frame {
                    Some(frame) => controller.on_frame(&frame).await,
                    None => {
                        log::info!("Frame stream closed, recorder stopping");
                        break;
                    }
                },
                event = self.slot.wait() => controller.on_motion(event).await,
                _ = ticker.tick() => controller.tick().await,
                Ok(()) = hub_status.changed() => {
                    let count = hub_status.borrow_and_update().reopen_count;
                    if count != reopen_count {
                        reopen_count = count;
                        controller.source_failed().await;
                    }
                }
            }
        }

        // Frames already buffered still belong to the session
        while let Some(frame) = frames.try_recv() {
            controller.on_frame(&frame).await;
        }
        controller.shutdown().await;
        Ok(())
    }
}
