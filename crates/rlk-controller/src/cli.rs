//! CLI command definitions and argument parsing

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};

use rlk_core::activity::{ActivityLog, ConsoleActivitySink, FileActivitySink};
use rlk_core::controller::Controller;
use rlk_core::harness::{run_lock_cycle, DEFAULT_IDLE};
use rlk_core::model::TestKind;
use rlk_core::sqlite_store::SqliteStore;
use rlk_core::{CommandPayload, InMemoryStore, SessionError};

use crate::config::Config;
use crate::output::{render_qr_svg, OutputFormat, OutputFormatter, SuccessMessage};
use crate::ExitCode;

/// Remote lock controller
#[derive(Parser, Debug)]
#[command(name = "rlk-controller")]
#[command(version, about = "Create remote lock sessions and lock or unlock the joined phone")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    pub output: OutputFormat,

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

    /// Origin share links point at
    #[arg(long, global = true)]
    pub origin: Option<String>,
}

/// Session id or share link, from the flag or `RLK_SESSION`.
#[derive(Parser, Debug, Clone)]
pub struct SessionArg {
    #[arg(short, long, env = "RLK_SESSION")]
    pub session: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Generate a new session and print its share link
    Create {
        /// Also print the share link as a QR code
        #[arg(long)]
        qr: bool,
    },
    /// List sessions in the store
    List,
    /// Show a session record
    Status(SessionArg),
    /// Lock the connected phone
    Lock(SessionArg),
    /// Unlock the phone
    Unlock(SessionArg),
    /// Append a command of any type
    Send {
        #[command(flatten)]
        target: SessionArg,
        /// Command type: welcome, disconnect, test, or any other string
        #[arg(value_name = "TYPE")]
        kind: String,
        /// `data.message` for welcome
        #[arg(long)]
        message: Option<String>,
        /// `data.reason` for disconnect
        #[arg(long)]
        reason: Option<String>,
        /// `data.type` for test: vibration, sound, notification
        #[arg(long = "test")]
        test_kind: Option<String>,
        /// Raw JSON `data` object
        #[arg(long, conflicts_with_all = ["message", "reason", "test_kind"])]
        data: Option<String>,
    },
    /// Tell the client the session is over and delete it
    End(SessionArg),
    /// Print the share link and QR code
    Link {
        #[command(flatten)]
        target: SessionArg,
        /// Skip the terminal QR code
        #[arg(long)]
        no_qr: bool,
        /// Write the QR code as SVG
        #[arg(long)]
        svg: Option<PathBuf>,
    },
    /// Follow a session: presence, lock state, commands.
    ///
    /// Reads `lock`, `unlock`, `welcome`, `test <kind>`, `status`, `link` and
    /// `end` from stdin. Creates a session when none is given.
    Watch {
        #[arg(short, long, env = "RLK_SESSION")]
        session: Option<String>,
        /// End the session on Ctrl-C
        #[arg(long)]
        end_on_exit: bool,
    },
    /// Run create, join, lock, unlock, end in-process on an in-memory store
    Demo,
}

/// Per-invocation context shared by the commands.
struct Runtime {
    config: Config,
    formatter: OutputFormatter,
}

impl Runtime {
    fn new(config: Config) -> Self {
        let format = config.output.format.parse().unwrap_or_default();
        let formatter = OutputFormatter::new(format, config.output.verbose);
        Self { config, formatter }
    }

    fn open_store(&self) -> anyhow::Result<Arc<SqliteStore>> {
        let path = self.config.store_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        self.formatter.progress(&format!("Opening session store {}", path.display()));
        let store = SqliteStore::new(&path)?.with_poll_interval(self.config.poll_interval());
        Ok(Arc::new(store))
    }

    fn activity(&self, console: bool) -> Arc<ActivityLog> {
        let mut log = ActivityLog::new();
        if let Some(path) = &self.config.logging.activity_file {
            log.add_sink(Arc::new(FileActivitySink::new(path)));
        }
        if console && self.formatter.format() == OutputFormat::Table {
            log.add_sink(Arc::new(ConsoleActivitySink));
        }
        Arc::new(log)
    }

    fn controller(&self, console: bool) -> anyhow::Result<Controller<SqliteStore>> {
        Ok(Controller::new(
            self.open_store()?,
            self.activity(console),
            self.config.controller_config(),
        ))
    }

    /// Print a role error and pick its exit code.
    fn fail(&self, error: &SessionError) -> ExitCode {
        let code = ExitCode::for_session_error(error);
        let rendered = self.formatter.format_error_with_code(error, code);
        if !rendered.is_empty() {
            eprintln!("{rendered}");
        }
        code
    }
}

impl Cli {
    /// Execute the CLI command with a pre-loaded configuration
    pub async fn execute_with_config(self, config: Config) -> anyhow::Result<ExitCode> {
        let rt = Runtime::new(config);

        match self.command {
            Commands::Create { qr } => create(&rt, qr).await,
            Commands::List => list(&rt).await,
            Commands::Status(target) => status(&rt, &target.session).await,
            Commands::Lock(target) => lock(&rt, &target.session, true).await,
            Commands::Unlock(target) => lock(&rt, &target.session, false).await,
            Commands::Send {
                target,
                kind,
                message,
                reason,
                test_kind,
                data,
            } => {
                let payload = match build_payload(&kind, message, reason, test_kind, data) {
                    Ok(payload) => payload,
                    Err(e) => {
                        let rendered = rt.formatter.format_error_with_code(&e, ExitCode::InvalidInput);
                        if !rendered.is_empty() {
                            eprintln!("{rendered}");
                        }
                        return Ok(ExitCode::InvalidInput);
                    }
                };
                send(&rt, &target.session, payload).await
            }
            Commands::End(target) => end(&rt, &target.session).await,
            Commands::Link { target, no_qr, svg } => link(&rt, &target.session, !no_qr, svg).await,
            Commands::Watch { session, end_on_exit } => watch(&rt, session.as_deref(), end_on_exit).await,
            Commands::Demo => demo(&rt).await,
        }
    }
}

/// Build a command payload from `send` arguments.
pub fn build_payload(
    kind: &str,
    message: Option<String>,
    reason: Option<String>,
    test_kind: Option<String>,
    data: Option<String>,
) -> anyhow::Result<CommandPayload> {
    let kind = kind.trim();
    if kind.is_empty() {
        anyhow::bail!("command type must not be empty");
    }

    let data = match data {
        Some(raw) => {
            let value: serde_json::Value =
                serde_json::from_str(&raw).context("--data must be a JSON object")?;
            if !value.is_object() {
                anyhow::bail!("--data must be a JSON object");
            }
            Some(value)
        }
        None => {
            let mut fields = serde_json::Map::new();
            if let Some(message) = message {
                fields.insert("message".into(), message.into());
            }
            if let Some(reason) = reason {
                fields.insert("reason".into(), reason.into());
            }
            if let Some(test_kind) = test_kind {
                let parsed: TestKind = test_kind.parse().map_err(|e: String| anyhow::anyhow!(e))?;
                fields.insert("type".into(), parsed.as_str().into());
            }
            (!fields.is_empty()).then_some(serde_json::Value::Object(fields))
        }
    };

    let payload = CommandPayload::from_parts(kind, data);
    if matches!(payload, CommandPayload::Test { kind: None }) {
        anyhow::bail!("test needs --test vibration|sound|notification");
    }
    if matches!(payload, CommandPayload::ClientConnected { .. }) {
        anyhow::bail!("client_connected is sent by the client");
    }
    Ok(payload)
}

async fn create(rt: &Runtime, qr: bool) -> anyhow::Result<ExitCode> {
    let mut controller = rt.controller(false)?;
    let id = match controller.create_session().await {
        Ok(id) => id,
        Err(e) => return Ok(rt.fail(&e)),
    };
    let record = controller.snapshot().await?;
    let link = controller.share_link()?;
    controller.shutdown().await;

    rt.formatter.success(&format!("Session created: {id}"));
    rt.formatter.print(&rt.formatter.format_session(&record, &link, None));
    if qr {
        rt.formatter.print(&rt.formatter.format_link(&id, &link, true));
    }
    Ok(ExitCode::Success)
}

async fn list(rt: &Runtime) -> anyhow::Result<ExitCode> {
    let store = rt.open_store()?;
    let ids = store.session_ids().await?;
    match rt.formatter.format() {
        OutputFormat::Table if ids.is_empty() => println!("No sessions found."),
        OutputFormat::Table => ids.iter().for_each(|id| println!("{id}")),
        OutputFormat::Json => rt.formatter.print(&rt.formatter.format_success(&ids, "list")),
        OutputFormat::Quiet => {}
    }
    Ok(ExitCode::Success)
}

async fn status(rt: &Runtime, session: &str) -> anyhow::Result<ExitCode> {
    let mut controller = rt.controller(false)?;
    let record = match controller.load_session(session).await {
        Ok(record) => record,
        Err(e) => return Ok(rt.fail(&e)),
    };
    let link = controller.share_link()?;
    rt.formatter
        .print(&rt.formatter.format_session(&record, &link, Some(controller.view())));
    controller.shutdown().await;
    Ok(ExitCode::Success)
}

async fn lock(rt: &Runtime, session: &str, locked: bool) -> anyhow::Result<ExitCode> {
    let payload = if locked { CommandPayload::Lock } else { CommandPayload::Unlock };
    send(rt, session, payload).await
}

async fn send(rt: &Runtime, session: &str, payload: CommandPayload) -> anyhow::Result<ExitCode> {
    let mut controller = rt.controller(false)?;
    let result = match controller.load_session(session).await {
        Ok(_) => controller.send_command(payload).await,
        Err(e) => Err(e),
    };
    let id = controller.session_id().unwrap_or(session).to_string();
    controller.shutdown().await;

    match result {
        Ok(command) => {
            rt.formatter.success(&format!("{} command sent", command.type_name()));
            rt.formatter.print(&rt.formatter.format_command(&id, &command));
            Ok(ExitCode::Success)
        }
        Err(e) => Ok(rt.fail(&e)),
    }
}

async fn end(rt: &Runtime, session: &str) -> anyhow::Result<ExitCode> {
    let mut controller = rt.controller(false)?;
    let result = match controller.load_session(session).await {
        Ok(record) => controller.end_session().await.map(|_| record.id),
        Err(e) => Err(e),
    };

    match result {
        Ok(id) => {
            rt.formatter.success(&format!("Session {id} ended"));
            rt.formatter.print(
                &rt.formatter
                    .format_success(&SuccessMessage::new(format!("Session {id} ended")), "end"),
            );
            Ok(ExitCode::Success)
        }
        Err(e) => {
            controller.shutdown().await;
            Ok(rt.fail(&e))
        }
    }
}

async fn link(rt: &Runtime, session: &str, show_qr: bool, svg: Option<PathBuf>) -> anyhow::Result<ExitCode> {
    let mut controller = rt.controller(false)?;
    if let Err(e) = controller.load_session(session).await {
        return Ok(rt.fail(&e));
    }
    let link = controller.share_link()?;
    let id = controller.session_id().unwrap_or_default().to_string();
    controller.shutdown().await;

    if let Some(path) = svg {
        let image = render_qr_svg(&link)?;
        tokio::fs::write(&path, image)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        rt.formatter.success(&format!("QR code written to {}", path.display()));
    }
    rt.formatter.print(&rt.formatter.format_link(&id, &link, show_qr));
    Ok(ExitCode::Success)
}

async fn watch(rt: &Runtime, session: Option<&str>, end_on_exit: bool) -> anyhow::Result<ExitCode> {
    let mut controller = rt.controller(true)?;
    let attached = match session {
        Some(input) => controller.load_session(input).await.map(|r| r.id),
        None => controller.create_session().await,
    };
    let id = match attached {
        Ok(id) => id,
        Err(e) => return Ok(rt.fail(&e)),
    };
    let link = controller.share_link()?;
    rt.formatter.print(&rt.formatter.format_link(&id, &link, session.is_none()));
    rt.formatter.progress("Commands: lock, unlock, welcome, test <kind>, status, link, end");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                if end_on_exit {
                    if let Err(e) = controller.end_session().await {
                        return Ok(rt.fail(&e));
                    }
                } else {
                    controller.shutdown().await;
                }
                return Ok(ExitCode::Success);
            }
            line = lines.next_line(), if stdin_open => {
                match line? {
                    Some(line) => {
                        if let Some(code) = handle_watch_input(rt, &mut controller, line.trim()).await? {
                            return Ok(code);
                        }
                    }
                    None => stdin_open = false,
                }
            }
            wake = controller.recv() => {
                let Some(wake) = wake else {
                    return Ok(ExitCode::Success);
                };
                // Runs to completion even when stdin or ctrl-c become ready meanwhile.
                if let Some(event) = controller.process(wake).await? {
                    rt.formatter.print(&rt.formatter.format_event(&event));
                }
            }
        }
    }
}

/// One line typed into `watch`. Returns an exit code when the loop should stop.
async fn handle_watch_input(
    rt: &Runtime,
    controller: &mut Controller<SqliteStore>,
    line: &str,
) -> anyhow::Result<Option<ExitCode>> {
    let mut words = line.split_whitespace();
    let result = match (words.next(), words.next()) {
        (None, _) => return Ok(None),
        (Some("lock"), _) => controller.send_lock().await.map(|_| ()),
        (Some("unlock"), _) => controller.send_unlock().await.map(|_| ()),
        (Some("welcome"), _) => controller
            .send_command(CommandPayload::Welcome { message: None })
            .await
            .map(|_| ()),
        (Some("test"), kind) => match kind.map(str::parse::<TestKind>) {
            Some(Ok(kind)) => controller
                .send_command(CommandPayload::Test { kind: Some(kind) })
                .await
                .map(|_| ()),
            _ => {
                rt.formatter.warning("usage: test vibration|sound|notification");
                return Ok(None);
            }
        },
        (Some("status"), _) => {
            let record = controller.snapshot().await;
            record.map(|record| {
                let link = controller.share_link().unwrap_or_default();
                rt.formatter
                    .print(&rt.formatter.format_session(&record, &link, Some(controller.view())));
            })
        }
        (Some("link"), _) => controller.share_link().map(|link| {
            let id = controller.session_id().unwrap_or_default();
            rt.formatter.print(&rt.formatter.format_link(id, &link, true));
        }),
        (Some("end"), _) => {
            return match controller.end_session().await {
                Ok(()) => Ok(Some(ExitCode::Success)),
                Err(e) => Ok(Some(rt.fail(&e))),
            };
        }
        (Some(other), _) => {
            rt.formatter.warning(&format!("unknown input: {other}"));
            return Ok(None);
        }
    };

    // Failures are already in the activity log; the loop keeps going.
    if let Err(e) = result {
        tracing::debug!(error = %e, "watch input failed");
    }
    Ok(None)
}

async fn demo(rt: &Runtime) -> anyhow::Result<ExitCode> {
    let store = InMemoryStore::new_shared();
    let activity = rt.activity(rt.formatter.format() == OutputFormat::Table && rt.config.output.verbose);
    match run_lock_cycle(store, activity, DEFAULT_IDLE).await {
        Ok(transcript) => {
            rt.formatter.print(&rt.formatter.format_demo(&transcript));
            Ok(ExitCode::Success)
        }
        Err(e) => Ok(rt.fail(&e)),
    }
}
