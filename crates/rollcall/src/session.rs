//! The attendance session: one camera, one operator, one ledger.
//!
//! A synchronous state machine driven frame by frame. Each cycle either
//! marks a recognised student present or walks an unknown student through
//! ID-card registration. Cancellation is checked at every frame boundary.

use crate::announcer::{self, Announcer};
use crate::input::{OperatorCommand, OperatorInput};
use rollcall_core::{CodeReader, IdentityMatcher, IdentityStore, Sighting, StudentId};
use rollcall_hw::{CameraError, Frame, FrameSource};
use rollcall_ledger::{AttendanceLedger, ErrorLog, LedgerError, SyncMirror};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Granularity of cancellable sleeps.
const PAUSE_SLICE: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("final ledger flush failed: {0}")]
    Flush(#[from] LedgerError),
}

/// Shared stop flag, set from the signal handler.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub recognize_every: u32,
    pub recognize_interval: Duration,
    pub scan_every: u32,
    pub unrecognized_grace: Duration,
    pub auto_capture: bool,
    pub cycle_pause: Duration,
    pub retry_pause: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            recognize_every: 10,
            recognize_interval: Duration::from_millis(300),
            scan_every: 5,
            unrecognized_grace: Duration::from_secs(2),
            auto_capture: false,
            cycle_pause: Duration::from_secs(1),
            retry_pause: Duration::from_secs(1),
        }
    }
}

/// Everything a session step works with besides the camera.
pub struct SessionContext {
    pub matcher: IdentityMatcher,
    pub store: IdentityStore,
    pub codes: Box<dyn CodeReader>,
    pub ledger: AttendanceLedger,
    pub mirror: SyncMirror,
    pub announcer: Box<dyn Announcer>,
    pub input: Box<dyn OperatorInput>,
    pub error_log: ErrorLog,
}

#[derive(Debug)]
pub enum SessionState {
    AwaitingFace,
    Recognized(StudentId),
    /// Nobody matched; the frame is kept for registration.
    Unrecognized(Frame),
    AwaitingCode(Frame),
    Registering { face: Frame, id: StudentId },
    ShuttingDown,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub recorded: usize,
    pub registered: usize,
    pub rejected: usize,
    pub device_errors: usize,
}

pub struct Session {
    camera: Option<Box<dyn FrameSource>>,
    ctx: SessionContext,
    settings: SessionSettings,
    cancel: CancelToken,
    summary: SessionSummary,
    closed: bool,
}

impl Session {
    pub fn new(
        camera: Box<dyn FrameSource>,
        ctx: SessionContext,
        settings: SessionSettings,
        cancel: CancelToken,
    ) -> Self {
        Self {
            camera: Some(camera),
            ctx,
            settings,
            cancel,
            summary: SessionSummary::default(),
            closed: false,
        }
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    /// Drive the state machine until the operator quits or the token is cancelled,
    /// then release the camera and flush the ledger.
    pub fn run(&mut self) -> Result<SessionSummary, SessionError> {
        tracing::info!("session started");
        let mut state = SessionState::AwaitingFace;
        loop {
            state = match state {
                SessionState::ShuttingDown => break,
                other => self.step(other),
            };
        }
        self.shutdown()?;
        Ok(self.summary.clone())
    }

    fn step(&mut self, state: SessionState) -> SessionState {
        tracing::trace!(state = state_name(&state), "step");
        match state {
            SessionState::AwaitingFace => self.await_face(),
            SessionState::Recognized(id) => {
                self.commit(&id);
                self.pause(self.settings.cycle_pause)
            }
            SessionState::Unrecognized(frame) => {
                println!("Face not recognized. Show your ID card to the camera to register ('q' to quit).");
                SessionState::AwaitingCode(frame)
            }
            SessionState::AwaitingCode(face) => self.await_code(face),
            SessionState::Registering { face, id } => self.register(face, id),
            SessionState::ShuttingDown => SessionState::ShuttingDown,
        }
    }

    /// Sample every `recognize_every`th lit frame, at most once per
    /// `recognize_interval`. Only a located face nobody matched counts as a
    /// stranger; an empty view keeps waiting.
    fn await_face(&mut self) -> SessionState {
        println!("Position your face for attendance. Type 'c' + Enter to capture, 'q' to quit.");
        let started = Instant::now();
        let mut frames: u64 = 0;
        let mut last_sample: Option<Instant> = None;
        let mut last: Option<Sighting> = None;
        let mut prompted = false;

        loop {
            if self.cancel.is_cancelled() {
                return SessionState::ShuttingDown;
            }
            let frame = match self.next_frame() {
                Ok(frame) => frame,
                Err(e) => return self.device_error(e),
            };
            frames += 1;

            let due = last_sample.map_or(true, |t| t.elapsed() >= self.settings.recognize_interval);
            if frames % u64::from(self.settings.recognize_every.max(1)) == 0 && due {
                if frame.is_dark {
                    tracing::trace!(sequence = frame.sequence, "dark frame skipped");
                } else {
                    last_sample = Some(Instant::now());
                    last = Some(self.recognize(&frame));
                }
            }

            let stranger = last.as_ref().is_some_and(Sighting::is_stranger);
            if stranger && !prompted && started.elapsed() >= self.settings.unrecognized_grace {
                println!("Face not recognized. Type 'c' + Enter to register with your ID card.");
                self.ctx.announcer.say(announcer::NOT_RECOGNIZED);
                prompted = true;
            }

            match self.ctx.input.poll() {
                Some(OperatorCommand::Quit) => return SessionState::ShuttingDown,
                Some(OperatorCommand::Capture) => {
                    let sighting = match last {
                        Some(sighting) => sighting,
                        None => self.recognize(&frame),
                    };
                    return capture(sighting.student_id, frame);
                }
                None => {}
            }
            if self.settings.auto_capture {
                if let Some(id) = last.as_ref().and_then(|s| s.student_id.clone()) {
                    return SessionState::Recognized(id);
                }
                if stranger && prompted {
                    return SessionState::Unrecognized(frame);
                }
            }
        }
    }

    /// A failed pass is logged and treated as an empty view.
    fn recognize(&mut self, frame: &Frame) -> Sighting {
        let result = self
            .ctx
            .matcher
            .recognize(&mut self.ctx.store, &frame.data, frame.width, frame.height);
        match result {
            Ok(sighting) => sighting,
            Err(e) => {
                tracing::warn!(sequence = frame.sequence, error = %e, "recognition failed");
                println!("Recognition error: {e}");
                self.ctx.error_log.append("Recognition error", "camera", &e);
                Sighting::default()
            }
        }
    }

    fn await_code(&mut self, face: Frame) -> SessionState {
        let mut frames: u64 = 0;
        loop {
            if self.cancel.is_cancelled() {
                return SessionState::ShuttingDown;
            }
            let frame = match self.next_frame() {
                Ok(frame) => frame,
                Err(e) => return self.device_error(e),
            };
            frames += 1;

            if frames % u64::from(self.settings.scan_every.max(1)) == 0 {
                if let Some(text) = self.ctx.codes.scan(&frame.data, frame.width, frame.height) {
                    match text.parse::<StudentId>() {
                        Ok(id) => {
                            println!("ID card read: {id}");
                            return SessionState::Registering { face, id };
                        }
                        Err(_) => tracing::debug!("blank code ignored"),
                    }
                }
            }

            if self.ctx.input.poll() == Some(OperatorCommand::Quit) {
                return SessionState::ShuttingDown;
            }
        }
    }

    fn register(&mut self, face: Frame, id: StudentId) -> SessionState {
        let result = self
            .ctx
            .matcher
            .register(&mut self.ctx.store, &id, &face.data, face.width, face.height);
        match result {
            Ok(()) => {
                println!("Face registered for {id}.");
                self.summary.registered += 1;
                self.commit(&id);
            }
            Err(e) if e.is_subject_error() => {
                tracing::warn!(id = %id, error = %e, "registration rejected");
                println!("{}", announcer::ONE_FACE_ONLY);
                self.ctx.announcer.say(announcer::ONE_FACE_ONLY);
                self.ctx.error_log.append("Registration rejected", id.as_str(), &e);
                self.summary.rejected += 1;
            }
            Err(e) => {
                tracing::error!(id = %id, error = %e, "registration failed");
                println!("Registration failed for {id}: {e}");
                self.ctx.error_log.append("Registration error", id.as_str(), &e);
                self.summary.rejected += 1;
            }
        }
        self.pause(self.settings.cycle_pause)
    }

    /// Ledger first, mirror second; a mirror failure never undoes the ledger.
    fn commit(&mut self, id: &StudentId) {
        let now = chrono::Local::now().naive_local();
        let record = self.ctx.ledger.record(id, now);
        self.ctx.mirror.replicate(&record);
        println!("Attendance marked for {id} at {}", record.time.format("%H:%M:%S"));
        self.ctx.announcer.say(&announcer::marked(id.as_str()));
        self.summary.recorded += 1;
    }

    fn next_frame(&mut self) -> Result<Frame, CameraError> {
        match self.camera.as_mut() {
            Some(camera) => camera.next_frame(),
            None => Err(CameraError::CaptureFailed("camera released".into())),
        }
    }

    fn device_error(&mut self, e: CameraError) -> SessionState {
        tracing::error!(error = %e, "frame capture failed");
        println!("Camera error: {e}");
        self.ctx.error_log.append("Camera error", "camera", &e);
        self.summary.device_errors += 1;
        self.pause(self.settings.retry_pause)
    }

    /// Sleep for `total`, waking early on cancellation.
    fn pause(&self, total: Duration) -> SessionState {
        let deadline = Instant::now() + total;
        loop {
            if self.cancel.is_cancelled() {
                return SessionState::ShuttingDown;
            }
            let now = Instant::now();
            if now >= deadline {
                return SessionState::AwaitingFace;
            }
            std::thread::sleep(PAUSE_SLICE.min(deadline - now));
        }
    }

    /// Release the camera, persist the ledger, stop speech. Runs once.
    fn shutdown(&mut self) -> Result<(), SessionError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.camera.take();
        let flushed = self.ctx.ledger.flush();
        self.ctx.announcer.stop();
        if let Err(e) = &flushed {
            self.ctx.error_log.append("Ledger save error", "session", e);
        }
        tracing::info!(summary = ?self.summary, "session closed");
        flushed.map_err(SessionError::from)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!(error = %e, "session cleanup failed");
        }
    }
}

fn capture(current: Option<StudentId>, frame: Frame) -> SessionState {
    match current {
        Some(id) => SessionState::Recognized(id),
        None => SessionState::Unrecognized(frame),
    }
}

fn state_name(state: &SessionState) -> &'static str {
    match state {
        SessionState::AwaitingFace => "awaiting_face",
        SessionState::Recognized(_) => "recognized",
        SessionState::Unrecognized(_) => "unrecognized",
        SessionState::AwaitingCode(_) => "awaiting_code",
        SessionState::Registering { .. } => "registering",
        SessionState::ShuttingDown => "shutting_down",
    }
}
