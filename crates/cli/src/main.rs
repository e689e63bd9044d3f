//! CLI for the Beacon client core.
//!
//! `simulate` runs a scripted session against the in-memory backend and
//! transport: startup -> realtime connect -> change events -> report.

use beacon_core::{BeaconConfig, BeaconError, Permissions, RawChange, Role};
use beacon_sync::sink::json_stream::JsonStreamSink;
use beacon_sync::{AppController, InvalidationBus, SessionReport};
use beacon_transport::{
    Credentials, MemoryBackend, MemoryTransport, Phase, Profile, RealtimeTransport, Session,
};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;

const DEMO_EMAIL: &str = "demo@beacon.local";
const DEMO_PASSWORD: &str = "demo";
const DEMO_USER: &str = "u-demo";
const SETTLE_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Parser, Debug)]
#[command(name = "beacon", version, about = "Client readiness and realtime sync simulator")]
struct Cli {
    /// JSON config file. Defaults apply to missing fields.
    #[arg(short, long, env = "BEACON_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a scripted session against in-memory doubles.
    Simulate {
        /// Role of the simulated user (Administrator, Manager, Employee, ...).
        #[arg(long, default_value = "Administrator")]
        role: String,

        /// Start without a cached session and sign in with credentials.
        #[arg(long, default_value_t = false)]
        no_cache: bool,

        /// Fail cache validation once with a network error, then retry.
        #[arg(long, default_value_t = false)]
        fail_validation: bool,

        /// Realtime connect attempts that fail before one succeeds.
        #[arg(long, default_value_t = 0)]
        failed_connects: u32,

        /// Drop the realtime connection halfway through the events.
        #[arg(long, default_value_t = false)]
        drop_connection: bool,

        /// Change events to emit, round-robin over the known tables.
        #[arg(long, default_value_t = 12)]
        events: usize,

        /// Also emit one malformed notification.
        #[arg(long, default_value_t = false)]
        malformed: bool,

        #[arg(long, default_value_t = false)]
        json: bool,

        /// Sink output: "ndjson" writes NDJSON to stdout,
        /// "ndjson:/path/to/file" writes to file.
        #[arg(long)]
        sink: Option<String>,
    },
    /// Print the effective configuration as JSON.
    Config,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => BeaconConfig::load(path)?,
        None => BeaconConfig::default(),
    };
    config.validate()?;

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Simulate {
            role,
            no_cache,
            fail_validation,
            failed_connects,
            drop_connection,
            events,
            malformed,
            json,
            sink,
        } => {
            let t0 = Instant::now();
            let role = Role::from(role.as_str());
            tracing::info!(%role, no_cache, fail_validation, failed_connects, events, "starting simulation");

            // 1. Script the doubles.
            let backend = Arc::new(MemoryBackend::new());
            backend
                .add_user(
                    DEMO_EMAIL,
                    DEMO_PASSWORD,
                    Profile {
                        id: DEMO_USER.to_string(),
                        role: role.clone(),
                        display_name: Some("Demo User".to_string()),
                    },
                    demo_permissions(&role),
                )
                .await;
            if !no_cache {
                backend
                    .set_cached_session(Some(Session {
                        user_id: DEMO_USER.to_string(),
                        expires_at: None,
                    }))
                    .await;
            }
            if fail_validation {
                backend
                    .push_failure(
                        Phase::Validate,
                        beacon_core::AppError::network("simulated network failure"),
                    )
                    .await;
            }
            let transport = Arc::new(MemoryTransport::new());
            transport.fail_next_connects(failed_connects).await;

            let bus = InvalidationBus::new();
            let mut invalidations = bus.subscribe();
            let listener = tokio::spawn(async move {
                let mut seen = 0usize;
                loop {
                    match invalidations.recv().await {
                        Ok(key) => {
                            tracing::debug!(%key, "view invalidated");
                            seen += 1;
                        }
                        Err(RecvError::Lagged(skipped)) => seen += skipped as usize,
                        Err(RecvError::Closed) => break seen,
                    }
                }
            });

            let ctl = AppController::new(backend, &config, Arc::new(bus));
            let realtime = {
                let ctl = ctl.clone();
                let transport: Arc<dyn RealtimeTransport> = transport.clone();
                tokio::spawn(async move { ctl.run_realtime(transport).await })
            };

            // 2. Startup.
            let state = startup(&ctl, !no_cache).await?;
            tracing::info!(state = %state.kind(), elapsed_ms = t0.elapsed().as_millis() as u64, "startup finished");

            // 3. Realtime traffic.
            wait_connected(&ctl).await?;
            let changes = demo_changes(events);
            let half = changes.len() / 2;
            for (i, change) in changes.into_iter().enumerate() {
                if drop_connection && i == half {
                    transport.close("simulated drop").await?;
                    wait_connected(&ctl).await?;
                }
                transport.emit(change).await?;
            }
            if malformed {
                transport
                    .emit(RawChange::new("projects", "INSERT", json!({ "name": "no id" })))
                    .await?;
            }
            settle(&ctl).await;

            ctl.shutdown();
            realtime
                .await
                .map_err(|e| BeaconError::Internal(e.to_string()))??;

            // 4. Report.
            let report = {
                let machine = ctl.machine();
                let hub = ctl.hub();
                let machine = machine.lock().await;
                let hub = hub.lock().await;
                SessionReport::build(&machine, &hub, t0.elapsed())
            };
            drop(ctl);
            let invalidated = listener.await.unwrap_or(0);
            tracing::info!(
                invalidated,
                health = %report.health(),
                elapsed_ms = report.elapsed.as_millis() as u64,
                "simulation complete"
            );

            // 5. Output.
            if let Some(ref sink_spec) = sink {
                if sink_spec == "ndjson" {
                    let n = write_rows(JsonStreamSink::stdout(), &report)?;
                    tracing::info!(rows = n, "ndjson sink: wrote to stdout");
                } else if let Some(path) = sink_spec.strip_prefix("ndjson:") {
                    let file = std::fs::File::create(path)?;
                    let n = write_rows(JsonStreamSink::new(file), &report)?;
                    tracing::info!(rows = n, path, "ndjson sink: wrote to file");
                } else {
                    eprintln!("Unknown sink: {sink_spec}. Use 'ndjson' or 'ndjson:/path'");
                }
                eprint!("{}", report.render());
            } else if json {
                let (transitions, status, failed) = report.to_rows();
                let doc = json!({
                    "transitions": transitions,
                    "status": status,
                    "failed": failed,
                });
                println!("{}", serde_json::to_string_pretty(&doc)?);
            } else {
                print!("{}", report.render());
            }
        }
    }

    Ok(())
}

/// Cached-session bootstrap with one retry, falling back to sign-in.
async fn startup(
    ctl: &AppController,
    has_cache: bool,
) -> Result<beacon_core::LoadingState, BeaconError> {
    let credentials = Credentials::new(DEMO_EMAIL, DEMO_PASSWORD);
    if !has_cache {
        ctl.bootstrap(false).await?;
        return ctl.sign_in(&credentials).await;
    }
    match ctl.bootstrap(true).await {
        Err(BeaconError::Startup(error)) if error.recoverable => {
            tracing::warn!(error = %error, "startup failed, retrying");
            let state = ctl.retry().await?;
            if state.is_ready() {
                Ok(state)
            } else {
                ctl.sign_in(&credentials).await
            }
        }
        other => other,
    }
}

/// Waits for the realtime channel, pressing manual reconnect when parked.
async fn wait_connected(ctl: &AppController) -> Result<(), BeaconError> {
    let deadline = Instant::now() + SETTLE_TIMEOUT;
    let mut status = ctl.subscribe_status();
    while !status.borrow_and_update().connected {
        if Instant::now() >= deadline {
            return Err(BeaconError::Transport("realtime never connected".to_string()));
        }
        if ctl.hub().lock().await.monitor().needs_manual_reconnect() {
            tracing::warn!("automatic reconnect exhausted, reconnecting manually");
            ctl.reconnect().await;
        }
        let _ = tokio::time::timeout(Duration::from_millis(250), status.changed()).await;
    }
    Ok(())
}

/// Gives the pump time to drain, including scheduled apply retries.
async fn settle(ctl: &AppController) {
    let mut status = ctl.subscribe_status();
    let drained = tokio::time::timeout(SETTLE_TIMEOUT, status.wait_for(|s| s.queued_events == 0));
    if drained.await.is_err() {
        tracing::warn!("queue did not drain before timeout");
    }
}

fn write_rows<W: Write>(mut sink: JsonStreamSink<W>, report: &SessionReport) -> std::io::Result<usize> {
    let (transitions, status, failed) = report.to_rows();
    sink.write_transitions(&transitions)?;
    sink.write_status(&status)?;
    sink.write_failed(&failed)?;
    sink.finish()
}

fn demo_permissions(role: &Role) -> Permissions {
    let mut permissions = Permissions::new();
    permissions.push("quotes.read".to_string());
    permissions.push("planning.read".to_string());
    if role.is_admin() {
        permissions.push("users.manage".to_string());
        permissions.push("settings.write".to_string());
    }
    permissions
}

fn demo_changes(count: usize) -> Vec<RawChange> {
    (0..count)
        .map(|i| match i % 4 {
            0 => RawChange::new(
                "emails",
                "INSERT",
                json!({ "id": format!("e{i}"), "account_id": "acc-1", "folder": "inbox" }),
            ),
            1 => RawChange::new(
                "email_accounts",
                "UPDATE",
                json!({ "id": "acc-1", "sync_status": "synced" }),
            ),
            2 => RawChange::new(
                "planning_slots",
                "UPDATE",
                json!({
                    "id": format!("s{i}"),
                    "user_id": DEMO_USER,
                    "starts_at": "2026-03-02T08:00:00Z",
                    "ends_at": "2026-03-02T12:00:00Z",
                }),
            ),
            _ => RawChange::new(
                "projects",
                if i % 8 == 7 { "DELETE" } else { "UPDATE" },
                json!({ "id": format!("p{i}"), "name": "Roof renovation", "status": "active" }),
            ),
        })
        .collect()
}
