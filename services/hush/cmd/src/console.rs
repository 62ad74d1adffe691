//! Line-oriented console front-end.
//!
//! Commands are read from stdin, snapshots and interrupts are written to
//! stdout. While an interrupt is waiting for `ok`, only commands that do not
//! change the session are accepted; the session itself keeps running.

use anyhow::Result;
use clap::ValueEnum;
use hush_session::{Interrupt, SessionHandle, SessionSnapshot};
use serde::Serialize;
use std::collections::VecDeque;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

const RECENT_EVENTS: usize = 5;

const HELP: &str = "\
commands:
  connect [name]    connect to the device, optionally as <name>
  disconnect        close the connection
  filter            toggle the acoustic filter
  threshold <dB>    set the alarm threshold (30-85)
  status            show the current state
  ok                acknowledge the pending alert
  help              show this help
  quit              exit";

/// How snapshots and interrupts are printed
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per line
    Json,
}

/// A parsed console line
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Connect(Option<String>),
    Disconnect,
    Filter,
    Threshold(f64),
    Status,
    Ack,
    Help,
    Quit,
}

impl ConsoleCommand {
    /// Commands that stay available while an interrupt is pending
    fn allowed_while_interrupted(&self) -> bool {
        matches!(
            self,
            ConsoleCommand::Ack | ConsoleCommand::Status | ConsoleCommand::Help | ConsoleCommand::Quit
        )
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum CommandError {
    #[error("unknown command '{0}', type 'help'")]
    Unknown(String),
    #[error("'{0}' needs an argument")]
    MissingArgument(&'static str),
    #[error("'{0}' is not a number")]
    NotANumber(String),
}

/// Parse one input line; blank lines yield `None`
pub fn parse_command(line: &str) -> Result<Option<ConsoleCommand>, CommandError> {
    let line = line.trim();
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    let command = match word.to_ascii_lowercase().as_str() {
        "" => return Ok(None),
        "connect" | "c" => {
            ConsoleCommand::Connect(Some(rest.to_string()).filter(|name| !name.is_empty()))
        }
        "disconnect" | "d" => ConsoleCommand::Disconnect,
        "filter" | "f" => ConsoleCommand::Filter,
        "threshold" | "t" => {
            if rest.is_empty() {
                return Err(CommandError::MissingArgument("threshold"));
            }
            let value = rest
                .parse::<f64>()
                .map_err(|_| CommandError::NotANumber(rest.to_string()))?;
            ConsoleCommand::Threshold(value)
        }
        "status" | "s" => ConsoleCommand::Status,
        "ok" => ConsoleCommand::Ack,
        "help" | "?" => ConsoleCommand::Help,
        "quit" | "exit" | "q" => ConsoleCommand::Quit,
        other => return Err(CommandError::Unknown(other.to_string())),
    };
    Ok(Some(command))
}

#[derive(Serialize)]
struct SnapshotLine<'a> {
    #[serde(flatten)]
    snapshot: &'a SessionSnapshot,
    threshold_exceeded: bool,
}

#[derive(Serialize)]
struct InterruptLine<'a> {
    title: &'a str,
    body: String,
    ack: &'a str,
}

/// Render a snapshot for stdout
pub fn render_snapshot(snapshot: &SessionSnapshot, format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => {
            let line = SnapshotLine {
                snapshot,
                threshold_exceeded: snapshot.threshold_exceeded(),
            };
            serde_json::to_string(&serde_json::json!({ "snapshot": line }))
                .unwrap_or_else(|e| format!(r#"{{"error":"{}"}}"#, e))
        }
        OutputFormat::Text => {
            let mut out = format!(
                "[{}] user: {} | threshold: {} dB(A) | filter: {}",
                snapshot.status,
                if snapshot.user_name.is_empty() { "-" } else { &snapshot.user_name },
                snapshot.threshold,
                if snapshot.filter_active { "on" } else { "off" },
            );
            match snapshot.last_measured_level {
                Some(level) if snapshot.threshold_exceeded() => {
                    out.push_str(&format!(" | level: {:.1} dB(A) OVER THRESHOLD", level))
                }
                Some(level) => out.push_str(&format!(" | level: {:.1} dB(A)", level)),
                None => out.push_str(" | level: -"),
            }
            if !snapshot.event_log.is_empty() {
                let skip = snapshot.event_log.len().saturating_sub(RECENT_EVENTS);
                let recent: Vec<&str> =
                    snapshot.event_log[skip..].iter().map(String::as_str).collect();
                out.push_str(&format!("\n  events: {}", recent.join(", ")));
            }
            if let Some(error) = &snapshot.last_error {
                out.push_str(&format!("\n  last error: {}", error));
            }
            out
        }
    }
}

/// Render an interrupt dialog for stdout
pub fn render_interrupt(interrupt: &Interrupt, format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => {
            let line = InterruptLine {
                title: interrupt.title(),
                body: interrupt.body(),
                ack: interrupt.ack_label(),
            };
            serde_json::to_string(&serde_json::json!({ "interrupt": line }))
                .unwrap_or_else(|e| format!(r#"{{"error":"{}"}}"#, e))
        }
        OutputFormat::Text => format!(
            "!!! {}\n{}\n(type 'ok' to acknowledge: {})",
            interrupt.title(),
            interrupt.body(),
            interrupt.ack_label()
        ),
    }
}

/// Outcome of one console line
#[derive(Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// Console state between lines
pub struct Console {
    handle: SessionHandle,
    endpoint: String,
    default_user_name: Option<String>,
    format: OutputFormat,
    pending: VecDeque<Interrupt>,
}

impl Console {
    pub fn new(
        handle: SessionHandle,
        endpoint: String,
        default_user_name: Option<String>,
        format: OutputFormat,
    ) -> Self {
        Self {
            handle,
            endpoint,
            default_user_name,
            format,
            pending: VecDeque::new(),
        }
    }

    /// Queue an interrupt; returns the text to show if it is now on top
    pub fn push_interrupt(&mut self, interrupt: Interrupt) -> Option<String> {
        self.pending.push_back(interrupt);
        if self.pending.len() == 1 {
            self.pending.front().map(|i| render_interrupt(i, self.format))
        } else {
            None
        }
    }

    /// True while an interrupt waits for `ok`
    pub fn is_interrupted(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Apply one command and return the lines to print
    pub async fn execute(&mut self, command: ConsoleCommand) -> (Flow, Vec<String>) {
        if self.is_interrupted() && !command.allowed_while_interrupted() {
            return (
                Flow::Continue,
                vec!["acknowledge the alert with 'ok' first".to_string()],
            );
        }

        let result = match command {
            ConsoleCommand::Quit => return (Flow::Quit, Vec::new()),
            ConsoleCommand::Help => return (Flow::Continue, vec![HELP.to_string()]),
            ConsoleCommand::Status => {
                let snapshot = self.handle.snapshot();
                return (Flow::Continue, vec![render_snapshot(&snapshot, self.format)]);
            }
            ConsoleCommand::Ack => {
                let mut out = Vec::new();
                if self.pending.pop_front().is_none() {
                    out.push("nothing to acknowledge".to_string());
                } else if let Some(next) = self.pending.front() {
                    out.push(render_interrupt(next, self.format));
                }
                return (Flow::Continue, out);
            }
            ConsoleCommand::Connect(name) => {
                let user_name = name
                    .or_else(|| {
                        let current = self.handle.snapshot().user_name;
                        Some(current).filter(|n| !n.is_empty())
                    })
                    .or_else(|| self.default_user_name.clone())
                    .unwrap_or_default();
                self.handle
                    .request_connect(self.endpoint.clone(), user_name)
                    .await
            }
            ConsoleCommand::Disconnect => self.handle.request_disconnect().await,
            ConsoleCommand::Filter => self.handle.toggle_filter().await,
            ConsoleCommand::Threshold(value) => self.handle.set_threshold(value).await,
        };

        match result {
            Ok(_) => (Flow::Continue, Vec::new()),
            Err(e) => {
                crate::component_debug!("console", "Command rejected: {}", e);
                (Flow::Continue, vec![format!("error: {}", e)])
            }
        }
    }
}

/// Drive the console until `quit`, end of input or Ctrl-C
pub async fn run(mut console: Console, mut interrupts: mpsc::UnboundedReceiver<Interrupt>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut snapshots = console.handle.subscribe();
    let format = console.format;

    println!("{}", render_snapshot(&snapshots.borrow_and_update().clone(), format));
    if format == OutputFormat::Text {
        println!("type 'help' for commands");
    }

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    crate::component_info!("console", "End of input");
                    break;
                };
                let command = match parse_command(&line) {
                    Ok(Some(command)) => command,
                    Ok(None) => continue,
                    Err(e) => {
                        println!("error: {}", e);
                        continue;
                    }
                };
                let (flow, output) = console.execute(command).await;
                for text in output {
                    println!("{}", text);
                }
                if flow == Flow::Quit {
                    break;
                }
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    crate::component_warn!("console", "Session controller stopped");
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                println!("{}", render_snapshot(&snapshot, format));
            }
            Some(interrupt) = interrupts.recv() => {
                if let Some(text) = console.push_interrupt(interrupt) {
                    println!("{}", text);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                crate::component_info!("console", "Interrupted, shutting down");
                break;
            }
        }
    }
    Ok(())
}
