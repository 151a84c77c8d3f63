//! CLI command definitions and the interactive session loop

use std::future::Future;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::time::MissedTickBehavior;

use rlk_core::activity::{ActivityLog, ConsoleActivitySink, FileActivitySink};
use rlk_core::client::{Client, ClientEvent};
use rlk_core::errors::validate_session_id;
use rlk_core::link::parse_session_input;
use rlk_core::session::DisconnectReason;
use rlk_core::sqlite_store::SqliteStore;
use rlk_core::types::now_millis;
use rlk_core::SessionStore;

use crate::config::{CliOverrides, Config};
use crate::terminal::TerminalDevice;
use crate::ExitCode;

/// Remote lock client
#[derive(Parser, Debug)]
#[command(name = "rlk-client")]
#[command(version, about = "Join a remote lock session and enforce the lock on this terminal")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Config file path
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Session database path
    #[arg(long, global = true, env = "RLK_STORE")]
    pub store: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Join a session by id or share link.
    ///
    /// While connected, stdin accepts `status`, `disconnect` and
    /// `emergency-unlock`. Everything else is dropped while locked.
    Connect {
        /// Session id or share link
        #[arg(value_name = "SESSION")]
        session: String,
        /// Client id reported to the controller
        #[arg(long)]
        client_id: Option<String>,
        /// Do not ring the terminal bell
        #[arg(long)]
        no_bell: bool,
    },
    /// Print the session id contained in a share link
    ParseLink {
        text: String,
        /// Print JSON
        #[arg(long)]
        json: bool,
    },
}

impl Cli {
    pub fn overrides(&self) -> CliOverrides {
        let (client_id, no_bell) = match &self.command {
            Commands::Connect { client_id, no_bell, .. } => (client_id.clone(), *no_bell),
            Commands::ParseLink { .. } => (None, false),
        };
        CliOverrides {
            debug: self.debug.then_some(true),
            store_path: self.store.clone(),
            client_id,
            no_bell,
        }
    }

    pub async fn execute_with_config(self, config: Config) -> anyhow::Result<ExitCode> {
        match self.command {
            Commands::Connect { session, .. } => connect(&config, &session).await,
            Commands::ParseLink { text, json } => Ok(parse_link(&text, json)),
        }
    }
}

fn parse_link(text: &str, json: bool) -> ExitCode {
    let id = parse_session_input(text).filter(|id| validate_session_id(id).is_ok());
    match (id, json) {
        (Some(id), false) => {
            println!("{id}");
            ExitCode::Success
        }
        (Some(id), true) => {
            println!("{}", serde_json::json!({ "success": true, "session_id": id }));
            ExitCode::Success
        }
        (None, false) => {
            eprintln!("Error: no session id in {text:?}");
            ExitCode::InvalidInput
        }
        (None, true) => {
            println!("{}", serde_json::json!({ "success": false, "error": "no session id" }));
            ExitCode::InvalidInput
        }
    }
}

async fn connect(config: &Config, input: &str) -> anyhow::Result<ExitCode> {
    let path = config.store_path()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let store = Arc::new(SqliteStore::new(&path)?.with_poll_interval(config.poll_interval()));

    let mut activity = ActivityLog::new();
    activity.add_sink(Arc::new(ConsoleActivitySink));
    if let Some(file) = &config.logging.activity_file {
        activity.add_sink(Arc::new(FileActivitySink::new(file)));
    }

    let device = TerminalDevice::stdout(config.device.bell, config.device.notifications);
    let mut client = Client::new(store, device, Arc::new(activity), config.client_config());

    if let Err(e) = client.connect(input).await {
        eprintln!("Error: {e}");
        return Ok(ExitCode::for_session_error(&e));
    }
    println!(
        "Connected to {} as {} ({})",
        client.session_id().unwrap_or_default(),
        client.config().client_id,
        client.state().name()
    );

    let stdin = BufReader::new(tokio::io::stdin());
    let interrupted = async {
        // Without a signal handler the session ends on stdin commands only.
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    let reason = run_interactive(&mut client, stdin, interrupted).await?;
    println!("Disconnected: {reason}");

    Ok(match reason {
        DisconnectReason::ConnectionLost => ExitCode::ConnectionFailed,
        _ => ExitCode::Success,
    })
}

/// Drive a connected client until it leaves the session.
///
/// Store events win over typed input, so a lock that lands together with a
/// keystroke is applied before the keystroke is judged. Only the waits race;
/// an event that was picked up is processed in full, so the overlay cannot be
/// left behind by a timer tick.
pub async fn run_interactive<S, W, R, F>(
    client: &mut Client<S, TerminalDevice<W>>,
    input: R,
    interrupted: F,
) -> anyhow::Result<DisconnectReason>
where
    S: SessionStore + ?Sized,
    W: Write + Send,
    R: AsyncBufRead + Unpin,
    F: Future<Output = ()>,
{
    let mut lines = input.lines();
    let mut input_open = true;
    let mut elapsed = tokio::time::interval(Duration::from_secs(1));
    elapsed.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tokio::pin!(interrupted);

    loop {
        let locked = client.is_locked();
        tokio::select! {
            biased;
            _ = &mut interrupted => {
                client.disconnect().await?;
                return Ok(DisconnectReason::UserRequested);
            }
            wake = client.recv() => {
                let Some(wake) = wake else {
                    return Ok(DisconnectReason::ConnectionLost);
                };
                match client.process(wake).await? {
                    Some(ClientEvent::Disconnected(reason)) => return Ok(reason),
                    Some(event) => tracing::debug!(?event, "client event"),
                    None => {}
                }
            }
            line = lines.next_line(), if input_open => match line? {
                Some(line) => {
                    if let Some(reason) = handle_input(client, line.trim()).await? {
                        return Ok(reason);
                    }
                }
                None => input_open = false,
            },
            _ = elapsed.tick(), if locked => {
                if let Some(held) = client.locked_for(now_millis()) {
                    eprint!("\rLocked for {}  ", format_elapsed(held));
                }
            }
        }
    }
}

/// One typed line. Returns the reason when the client left the session.
async fn handle_input<S, W>(
    client: &mut Client<S, TerminalDevice<W>>,
    line: &str,
) -> anyhow::Result<Option<DisconnectReason>>
where
    S: SessionStore + ?Sized,
    W: Write + Send,
{
    match line {
        "" => {}
        "status" => {
            let held = client
                .locked_for(now_millis())
                .map(|d| format!(", locked for {}", format_elapsed(d)))
                .unwrap_or_default();
            println!(
                "{} ({}{held})",
                client.session_id().unwrap_or("-"),
                client.state().name()
            );
        }
        "disconnect" => {
            client.disconnect().await?;
            return Ok(Some(DisconnectReason::UserRequested));
        }
        "emergency-unlock" | "emergency" => match client.emergency_unlock().await {
            Ok(()) => return Ok(Some(DisconnectReason::EmergencyUnlock)),
            Err(e) => eprintln!("Emergency unlock unavailable: {e}"),
        },
        _ if client.device().input_suppressed() => {
            eprintln!("Input blocked: this device is locked");
        }
        other => eprintln!("Unknown command: {other} (status, disconnect, emergency-unlock)"),
    }
    Ok(None)
}

fn format_elapsed(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        format!("{}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
    } else {
        format!("{:02}:{:02}", secs / 60, secs % 60)
    }
}
