//! `casare-robot` command line: start, stop, and status.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Table};
use console::style;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::adapters::engine::SequentialEngine;
use crate::adapters::postgres::backend::PgBackend;
use crate::application::agent::RobotAgent;
use crate::infrastructure::config::ConfigLoader;
use crate::infrastructure::logging::{cleanup_old_logs, init_logging};
use crate::infrastructure::paths::RobotPaths;
use crate::services::audit::{AuditConfig, AuditLogger};
use crate::services::connection::ConnectionEvents;

#[derive(Parser)]
#[command(
    name = "casare-robot",
    about = "CasareRPA robot agent: claims workflow jobs and executes them durably",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a robot agent in the foreground.
    Start {
        /// YAML configuration file.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override the persistent robot id.
        #[arg(long)]
        robot_id: Option<String>,
        /// Debug-level logging.
        #[arg(short, long)]
        verbose: bool,
    },
    /// Signal a running robot to shut down.
    Stop {
        #[arg(long)]
        robot_id: String,
        /// Send SIGKILL instead of SIGTERM.
        #[arg(long)]
        force: bool,
    },
    /// Show a robot's last known status.
    Status {
        /// Defaults to the persisted robot id.
        #[arg(long)]
        robot_id: Option<String>,
        /// Print the raw status document.
        #[arg(long)]
        json: bool,
    },
}

/// Foreground agent run; returns the process exit code.
pub async fn handle_start(
    config_file: Option<PathBuf>,
    robot_id: Option<String>,
    verbose: bool,
) -> Result<i32> {
    let mut config = ConfigLoader::load(config_file.as_deref())?;
    if robot_id.is_some() {
        config.robot_id = robot_id;
    }

    let paths = RobotPaths::resolve(config.data_dir.as_deref())?;
    let _log_guard = init_logging(&paths.logs_dir(), verbose)?;
    cleanup_old_logs(&paths.logs_dir(), config.log_retention_days)
        .await
        .ok();

    let Some(database_url) = config.database_url.clone() else {
        eprintln!(
            "{} no backend URL configured (set POSTGRES_URL or DATABASE_URL)",
            style("error:").red().bold()
        );
        return Ok(1);
    };

    let resolved_id = paths.load_or_create_robot_id(config.robot_id.as_deref())?;
    let audit = Arc::new(
        AuditLogger::new(paths.audit_dir(), resolved_id.clone(), AuditConfig::default())
            .context("audit log init")?,
    );

    let events = connection_audit_events(Arc::clone(&audit));
    let backend = Arc::new(PgBackend::new(
        database_url,
        (&config.connection).into(),
        events,
        config.visibility_timeout,
    ));

    let agent = RobotAgent::new(
        config,
        Arc::clone(&backend) as Arc<dyn crate::domain::ports::backend::BackendQueue>,
        Arc::new(SequentialEngine::new()),
        paths.clone(),
        audit,
    )
    .await?;
    Arc::clone(&agent).start().await?;

    let pid_file = paths.write_pid_file(&resolved_id).context("write pid file")?;
    println!(
        "{} robot {} running (pid file {})",
        style("started:").green().bold(),
        resolved_id,
        pid_file.display()
    );
    println!("{}", style("Press Ctrl+C to stop").dim());

    // Status snapshot every 5s while the agent runs.
    let status_task = {
        let agent = Arc::clone(&agent);
        let backend = Arc::clone(&backend);
        let paths = paths.clone();
        let robot_id = resolved_id.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            loop {
                ticker.tick().await;
                let mut status = agent.status().await;
                if let Some(obj) = status.as_object_mut() {
                    obj.insert(
                        "connected".to_string(),
                        serde_json::Value::Bool(backend.is_connected().await),
                    );
                }
                paths.write_status(&robot_id, &status);
            }
        })
    };

    wait_for_shutdown_signal().await;
    println!("{}", style("shutting down...").yellow());

    agent.stop().await;
    status_task.abort();
    paths.remove_pid_file(&resolved_id);
    println!("{}", style("robot agent stopped").green());
    Ok(0)
}

fn connection_audit_events(audit: Arc<AuditLogger>) -> ConnectionEvents {
    let on_connected = {
        let audit = Arc::clone(&audit);
        Arc::new(move || {
            let audit = Arc::clone(&audit);
            tokio::spawn(async move { audit.connection_established().await });
        }) as Arc<dyn Fn() + Send + Sync>
    };
    let on_disconnected = {
        let audit = Arc::clone(&audit);
        Arc::new(move || {
            let audit = Arc::clone(&audit);
            tokio::spawn(async move { audit.connection_lost(None).await });
        }) as Arc<dyn Fn() + Send + Sync>
    };
    let on_reconnecting = {
        Arc::new(move |attempt: u32| {
            let audit = Arc::clone(&audit);
            tokio::spawn(async move { audit.connection_reconnecting(attempt).await });
        }) as Arc<dyn Fn(u32) + Send + Sync>
    };
    ConnectionEvents {
        on_connected: Some(on_connected),
        on_disconnected: Some(on_disconnected),
        on_reconnecting: Some(on_reconnecting),
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Signal a running robot; exit code 0 unless permissions block the
/// signal.
pub fn handle_stop(robot_id: &str, force: bool) -> Result<i32> {
    let paths = RobotPaths::resolve(None)?;
    let Some(pid) = paths.read_pid(robot_id) else {
        println!(
            "{} robot {} is not running (no PID file)",
            style("stop:").yellow(),
            robot_id
        );
        return Ok(0);
    };

    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let signal = if force {
            Signal::SIGKILL
        } else {
            Signal::SIGTERM
        };
        match kill(Pid::from_raw(pid), signal) {
            Ok(()) => {
                println!(
                    "{} sent {} to robot {} (pid {})",
                    style("stop:").green(),
                    signal,
                    robot_id,
                    pid
                );
                Ok(0)
            }
            Err(Errno::ESRCH) => {
                println!(
                    "{} robot {} already exited, removing stale PID file",
                    style("stop:").yellow(),
                    robot_id
                );
                paths.remove_pid_file(robot_id);
                Ok(0)
            }
            Err(Errno::EPERM) => {
                eprintln!(
                    "{} not permitted to signal pid {}",
                    style("error:").red().bold(),
                    pid
                );
                Ok(1)
            }
            Err(e) => {
                eprintln!("{} signal failed: {}", style("error:").red().bold(), e);
                Ok(1)
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = force;
        anyhow::bail!("robot stop is only supported on unix platforms")
    }
}

/// Report liveness and the last status snapshot.
pub fn handle_status(robot_id: Option<String>, json: bool) -> Result<i32> {
    let paths = RobotPaths::resolve(None)?;
    let Some(robot_id) = robot_id.or_else(|| paths.read_robot_id()) else {
        eprintln!(
            "{} no robot id given and none persisted yet",
            style("error:").red().bold()
        );
        return Ok(1);
    };

    let pid = paths.read_pid(&robot_id);
    let alive = pid.map(process_alive).unwrap_or(false);
    let status = paths.read_status(&robot_id);

    if json {
        let doc = serde_json::json!({
            "robot_id": robot_id,
            "running": alive,
            "pid": pid,
            "status": status,
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(0);
    }

    let running_label = if alive {
        style(format!("running (pid {})", pid.unwrap_or_default())).green()
    } else {
        style("not running".to_string()).red()
    };
    println!(
        "Robot {} is {}",
        style(&robot_id).bold(),
        running_label
    );

    if let Some(status) = status {
        let field = |key: &str| -> String {
            status
                .get(key)
                .map(|v| match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_else(|| "-".to_string())
        };
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(vec!["Field", "Value"]);
        table.add_row(vec!["State", &field("state")]);
        table.add_row(vec!["Connected", &field("connected")]);
        table.add_row(vec!["Environment", &field("environment")]);
        table.add_row(vec!["Current jobs", &field("current_job_count")]);
        table.add_row(vec!["Capacity", &field("capacity")]);
        if let Some(stats) = status.get("stats") {
            let stat = |key: &str| {
                stats
                    .get(key)
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "-".to_string())
            };
            table.add_row(vec!["Jobs completed", &stat("jobs_completed")]);
            table.add_row(vec!["Jobs failed", &stat("jobs_failed")]);
            table.add_row(vec!["Nodes executed", &stat("nodes_executed")]);
        }
        table.add_row(vec!["Uptime (s)", &field("uptime_seconds")]);
        table.add_row(vec!["Updated", &field("updated_at")]);
        println!("{table}");
    } else {
        println!("{}", style("no status snapshot found").dim());
    }
    Ok(0)
}

fn process_alive(pid: i32) -> bool {
    #[cfg(unix)]
    {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        kill(Pid::from_raw(pid), None).is_ok()
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}
