//! Collaborator seams for roster delivery, and command-line implementations.
//!
//! The processor only knows these traits. Layout and transport settings are
//! opaque JSON that it passes through untouched.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rollcall_core::config::PrintConfig;
use rollcall_upstream::{Attendee, EventDetail};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{DeliveryError, Result};

/// Renders the attendee roster of one event to a file.
#[async_trait]
pub trait DocumentGenerator: Send + Sync {
    async fn generate(
        &self,
        event: &EventDetail,
        attendees: &[Attendee],
        layout: &Value,
    ) -> Result<PathBuf>;
}

/// Hands a file to a local device, typically a printer.
#[async_trait]
pub trait LocalDelivery: Send + Sync {
    async fn deliver(&self, file: &Path) -> Result<()>;
}

/// Sends a file to one recipient.
#[async_trait]
pub trait EmailDelivery: Send + Sync {
    async fn send(&self, transport: &Value, recipient: &str, file: &Path) -> Result<()>;
}

async fn run_command(program: &str, args: &[String]) -> Result<()> {
    debug!(program, ?args, "running delivery command");
    let out = tokio::process::Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await?;

    if out.status.success() {
        Ok(())
    } else {
        Err(DeliveryError::Command {
            program: program.to_string(),
            code: out.status.code(),
            stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
        })
    }
}

/// Prints by running `<program> <args..> <file>`, e.g. `lp -d office roster.csv`.
pub struct CommandPrinter {
    program: String,
    args: Vec<String>,
}

impl CommandPrinter {
    pub fn new(cfg: &PrintConfig) -> Self {
        Self {
            program: cfg.program.clone(),
            args: cfg.args.clone(),
        }
    }
}

#[async_trait]
impl LocalDelivery for CommandPrinter {
    async fn deliver(&self, file: &Path) -> Result<()> {
        let mut args = self.args.clone();
        args.push(file.display().to_string());
        run_command(&self.program, &args).await?;
        info!(program = %self.program, file = %file.display(), "roster sent to printer");
        Ok(())
    }
}

const DEFAULT_SUBJECT: &str = "Attendee roster";

/// Mails by running the command described by the transport table:
///
/// ```toml
/// [delivery.email.transport]
/// program = "mutt"
/// args = ["-s", "{subject}", "-a", "{file}", "--", "{recipient}"]
/// subject = "Tonight's roster"
/// ```
///
/// `{recipient}`, `{file}` and `{subject}` are substituted in every argument.
#[derive(Debug, Default)]
pub struct CommandMailer;

impl CommandMailer {
    fn command(transport: &Value, recipient: &str, file: &Path) -> Result<(String, Vec<String>)> {
        let program = transport
            .get("program")
            .and_then(Value::as_str)
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| DeliveryError::Config("email transport needs a `program`".into()))?;
        let subject = transport
            .get("subject")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_SUBJECT);
        let file = file.display().to_string();

        let args = match transport.get("args") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str().map(String::from).ok_or_else(|| {
                        DeliveryError::Config("email transport `args` must be strings".into())
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            Some(_) => {
                return Err(DeliveryError::Config(
                    "email transport `args` must be an array".into(),
                ))
            }
        };
        let args = args
            .into_iter()
            .map(|arg| {
                arg.replace("{recipient}", recipient)
                    .replace("{file}", &file)
                    .replace("{subject}", subject)
            })
            .collect();
        Ok((program.to_string(), args))
    }
}

#[async_trait]
impl EmailDelivery for CommandMailer {
    async fn send(&self, transport: &Value, recipient: &str, file: &Path) -> Result<()> {
        let (program, args) = Self::command(transport, recipient, file)?;
        run_command(&program, &args).await?;
        info!(%recipient, file = %file.display(), "roster mailed");
        Ok(())
    }
}
