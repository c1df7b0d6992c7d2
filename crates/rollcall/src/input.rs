//! Operator keyboard commands, read line by line from stdin.

use std::io::BufRead;
use std::sync::mpsc::{self, Receiver, TryRecvError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorCommand {
    /// Act on the current frame.
    Capture,
    Quit,
}

/// Non-blocking source of operator commands, polled once per frame.
pub trait OperatorInput {
    fn poll(&mut self) -> Option<OperatorCommand>;
}

pub fn parse_command(line: &str) -> Option<OperatorCommand> {
    match line.trim().to_ascii_lowercase().as_str() {
        "c" | "capture" => Some(OperatorCommand::Capture),
        "q" | "k" | "quit" | "esc" | "\u{1b}" => Some(OperatorCommand::Quit),
        _ => None,
    }
}

/// Commands typed on the terminal, fed through a reader thread.
pub struct StdinInput {
    rx: Receiver<OperatorCommand>,
}

impl StdinInput {
    pub fn spawn() -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel();
        std::thread::Builder::new()
            .name("rollcall-stdin".into())
            .spawn(move || {
                for line in std::io::stdin().lock().lines() {
                    let Ok(line) = line else { break };
                    match parse_command(&line) {
                        Some(cmd) => {
                            if tx.send(cmd).is_err() {
                                break;
                            }
                        }
                        None if !line.trim().is_empty() => {
                            tracing::debug!(input = %line.trim(), "unknown operator command");
                        }
                        None => {}
                    }
                }
                tracing::debug!("stdin closed");
            })?;
        Ok(Self { rx })
    }
}

impl OperatorInput for StdinInput {
    fn poll(&mut self) -> Option<OperatorCommand> {
        match self.rx.try_recv() {
            Ok(cmd) => Some(cmd),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command("c"), Some(OperatorCommand::Capture));
        assert_eq!(parse_command(" C \n"), Some(OperatorCommand::Capture));
        assert_eq!(parse_command("q"), Some(OperatorCommand::Quit));
        assert_eq!(parse_command("k"), Some(OperatorCommand::Quit));
        assert_eq!(parse_command("Quit"), Some(OperatorCommand::Quit));
        assert_eq!(parse_command("\u{1b}"), Some(OperatorCommand::Quit));
        assert_eq!(parse_command("x"), None);
        assert_eq!(parse_command(""), None);
    }
}
