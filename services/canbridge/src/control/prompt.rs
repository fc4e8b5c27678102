//! Interactive operator prompt on stdin/stdout
//!
//! Stdin is read on a dedicated OS thread and handed over line by line, so a
//! pending read never holds up runtime shutdown.

use std::io::{self, BufRead, Write};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::command::HELP_TEXT;
use super::dispatch::ControlPlane;
use crate::error::Result;

const PROMPT: &str = "Enter command: ";

/// Why the prompt stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptExit {
    /// Operator typed `quit`/`exit`
    Quit,
    /// Stdin reached end of file
    InputClosed,
    Cancelled,
}

/// Forward stdin lines to a channel from a background thread
pub fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    let spawned = std::thread::Builder::new()
        .name("canbridge-stdin".to_string())
        .spawn(move || {
            let stdin = io::stdin();
            for line in stdin.lock().lines() {
                match line {
                    Ok(line) => {
                        if tx.blocking_send(line).is_err() {
                            break;
                        }
                    },
                    Err(e) => {
                        warn!("Failed to read stdin: {}", e);
                        break;
                    },
                }
            }
            debug!("Stdin reader finished");
        });

    if let Err(e) = spawned {
        // rx sees a closed channel and the prompt ends as on EOF
        warn!("Could not start stdin reader: {}", e);
    }
    rx
}

/// Run the prompt until quit, end of input or cancellation
pub async fn run_prompt<W: Write>(
    plane: &ControlPlane,
    mut input: mpsc::Receiver<String>,
    mut out: W,
    cancel: &CancellationToken,
) -> Result<PromptExit> {
    writeln!(out)?;
    writeln!(out, "CAN Bus Bridge CLI")?;
    for line in HELP_TEXT {
        writeln!(out, "{line}")?;
    }

    loop {
        write!(out, "\n{PROMPT}")?;
        out.flush()?;

        let line = tokio::select! {
            _ = cancel.cancelled() => return Ok(PromptExit::Cancelled),
            line = input.recv() => line,
        };
        let Some(line) = line else {
            return Ok(PromptExit::InputClosed);
        };

        let Some(reply) = plane.handle_line(&line).await else {
            continue;
        };
        if reply.quit {
            writeln!(out, "Shutting down...")?;
            out.flush()?;
            return Ok(PromptExit::Quit);
        }
        for text in &reply.lines {
            writeln!(out, "{text}")?;
        }
    }
}
