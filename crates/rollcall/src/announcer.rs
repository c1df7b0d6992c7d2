//! Spoken feedback for the student in front of the camera.

use std::process::{Child, Command, Stdio};

pub const NOT_RECOGNIZED: &str = "Face not recognized. Please scan your ID for registration.";
pub const ONE_FACE_ONLY: &str = "Please ensure only one face is visible for registration.";

pub fn marked(id: &str) -> String {
    format!("Attendance marked successfully for {id}")
}

/// Speaks short messages without blocking the capture loop.
pub trait Announcer {
    fn say(&mut self, message: &str);

    /// Cut off anything still being spoken.
    fn stop(&mut self);
}

/// Announcer for stations without audio.
pub struct LogAnnouncer;

impl Announcer for LogAnnouncer {
    fn say(&mut self, message: &str) {
        tracing::info!(message, "announce");
    }

    fn stop(&mut self) {}
}

/// Runs an external text-to-speech command with the message as its last argument.
///
/// One utterance at a time: a new message waits for the previous one.
pub struct SpeechAnnouncer {
    program: String,
    args: Vec<String>,
    current: Option<Child>,
}

impl SpeechAnnouncer {
    /// `command_line` is split on whitespace, e.g. `espeak-ng -s 150`.
    pub fn new(command_line: &str) -> Option<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
            current: None,
        })
    }

    fn command(&self, message: &str) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(message)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        command
    }

    fn wait_current(&mut self) {
        if let Some(mut child) = self.current.take() {
            if let Err(e) = child.wait() {
                tracing::warn!(error = %e, "speech process wait failed");
            }
        }
    }
}

impl Announcer for SpeechAnnouncer {
    fn say(&mut self, message: &str) {
        self.wait_current();
        tracing::info!(message, "announce");
        match self.command(message).spawn() {
            Ok(child) => self.current = Some(child),
            Err(e) => tracing::warn!(program = %self.program, error = %e, "speech command failed"),
        }
    }

    fn stop(&mut self) {
        if let Some(mut child) = self.current.take() {
            let _ = child.kill();
            let _ = child.wait();
            tracing::debug!("speech stopped");
        }
    }
}

impl Drop for SpeechAnnouncer {
    fn drop(&mut self) {
        self.stop();
    }
}
