use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use taskforge_core::{Daemon, WorkerConfig};
use taskforge_manager::{BotsConfig, ManagerSettings, MultiBotManager};
use taskforge_store::is_process_alive;
use taskforge_transport::FileStoreTransport;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "taskforge", version, about = "Chat-driven task daemon and multi-bot supervisor")]
struct Cli {
    #[arg(
        long,
        default_value = "~/.taskforge",
        help = "Home directory (config, bot workspaces, logs)"
    )]
    home: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run one bot worker (parameterized by environment)")]
    Worker {
        #[arg(long, help = "Workspace root (overrides TASKFORGE_WORKSPACE)")]
        workspace: Option<PathBuf>,
    },
    #[command(about = "Supervise one worker process per active bot")]
    Manager {
        #[arg(long, short = 'd', help = "Run in the background")]
        daemon: bool,
        #[arg(long, help = "Bot roster file (default <home>/config/bots.yaml)")]
        config: Option<PathBuf>,
    },
    #[command(about = "Stop a running manager")]
    Stop,
    #[command(about = "Show manager liveness")]
    Status,
    #[command(about = "Validate the bot roster")]
    Validate {
        #[arg(long, help = "Bot roster file (default <home>/config/bots.yaml)")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut cli = Cli::parse();
    cli.home = expand_home(&cli.home);

    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        println!();
        return Ok(());
    };

    match command {
        Commands::Worker { workspace } => run_worker(workspace).await,
        Commands::Manager { daemon, config } => {
            let mut settings = ManagerSettings::new(&cli.home);
            if let Some(config) = config {
                settings.config_path = config;
            }
            if daemon {
                daemonize_manager(&cli.home, &settings)
            } else {
                run_manager(settings).await
            }
        }
        Commands::Stop => stop_manager(&ManagerSettings::new(&cli.home)),
        Commands::Status => {
            status_manager(&ManagerSettings::new(&cli.home));
            Ok(())
        }
        Commands::Validate { config } => {
            let path = config.unwrap_or_else(|| ManagerSettings::new(&cli.home).config_path);
            let bots = BotsConfig::load(&path)?;
            println!(
                "Config valid. {} bot(s), {} active and runnable, {} allowed user(s).",
                bots.bots.len(),
                bots.desired_bots().len(),
                bots.allowed_users.len()
            );
            Ok(())
        }
    }
}

async fn run_worker(workspace: Option<PathBuf>) -> Result<()> {
    if let Some(workspace) = workspace {
        std::env::set_var("TASKFORGE_WORKSPACE", expand_home(&workspace));
    }
    let config = WorkerConfig::from_env()?;
    let workspace = config.workspace();
    workspace.ensure_dirs()?;
    let _guard = init_tracing(&workspace.logs_dir())?;

    let allowed_chats = std::env::var("TASKFORGE_ALLOWED_USERS")
        .unwrap_or_default()
        .split(',')
        .filter_map(|raw| raw.trim().parse::<i64>().ok())
        .filter(|id| *id > 0)
        .collect::<Vec<_>>();
    let transport = FileStoreTransport::new(workspace.message_store_file(), workspace.outbox_file())
        .with_allowed_chats(allowed_chats);

    let mut daemon = Daemon::new(config, Arc::new(transport))?;
    spawn_shutdown_listener(daemon.shutdown_token());
    daemon.run().await
}

async fn run_manager(settings: ManagerSettings) -> Result<()> {
    std::fs::create_dir_all(&settings.logs_dir)?;
    let _guard = init_tracing(&settings.logs_dir)?;

    let mut manager = MultiBotManager::new(settings);
    spawn_shutdown_listener(manager.shutdown_token());
    manager.run().await
}

/// Respawn the manager in the background with stdout/stderr appended to
/// `logs/taskforge.out`.
fn daemonize_manager(home: &Path, settings: &ManagerSettings) -> Result<()> {
    use std::process::{Command, Stdio};

    let exe = std::env::current_exe()?;
    std::fs::create_dir_all(&settings.logs_dir)?;
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(settings.logs_dir.join("taskforge.out"))?;
    let log_file_err = log_file.try_clone()?;

    let child = Command::new(&exe)
        .arg("--home")
        .arg(home)
        .arg("manager")
        .arg("--config")
        .arg(&settings.config_path)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log_file))
        .stderr(Stdio::from(log_file_err))
        .spawn()?;

    println!("taskforge manager started in background (pid: {})", child.id());
    Ok(())
}

/// Stop a running manager: SIGTERM, bounded wait, then SIGKILL.
fn stop_manager(settings: &ManagerSettings) -> Result<()> {
    let pid_file = settings.pid_file();
    let pid = match read_pid(&pid_file) {
        Some(pid) => pid,
        None => {
            println!("No pid file found. taskforge manager is not running.");
            return Ok(());
        }
    };

    if !is_process_alive(pid) {
        println!("Process {pid} is not running. Cleaning up stale pid file.");
        let _ = std::fs::remove_file(&pid_file);
        return Ok(());
    }

    println!("Stopping taskforge manager (pid: {pid})...");
    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }
    for _ in 0..20 {
        std::thread::sleep(Duration::from_millis(500));
        if !is_process_alive(pid) {
            println!("Stopped.");
            return Ok(());
        }
    }

    eprintln!("Process did not exit after 10s, sending SIGKILL...");
    unsafe {
        libc::kill(pid as i32, libc::SIGKILL);
    }
    std::thread::sleep(Duration::from_millis(500));
    let _ = std::fs::remove_file(&pid_file);
    println!("Killed.");
    Ok(())
}

fn status_manager(settings: &ManagerSettings) {
    match read_pid(&settings.pid_file()) {
        Some(pid) if is_process_alive(pid) => {
            println!("taskforge manager is running (pid: {pid}).");
        }
        Some(pid) => {
            println!("taskforge manager is not running (stale pid file: {pid}).");
        }
        None => {
            println!("taskforge manager is not running.");
        }
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|content| content.trim().parse().ok())
}

fn expand_home(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    path.to_path_buf()
}

/// Stderr layer plus a daily rolling file layer under the given log dir.
fn init_tracing(log_dir: &Path) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "taskforge.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .init();
    Ok(guard)
}

fn spawn_shutdown_listener(token: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => tracing::info!("Received SIGINT, shutting down..."),
                _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down..."),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            tracing::info!("Received SIGINT, shutting down...");
        }
        token.cancel();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_home_substitutes_prefix() {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
        assert_eq!(
            expand_home(Path::new("~/.taskforge")),
            PathBuf::from(home).join(".taskforge")
        );
        assert_eq!(expand_home(Path::new("/abs/path")), PathBuf::from("/abs/path"));
    }

    #[test]
    fn read_pid_parses_and_tolerates_garbage() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("manager.pid");
        assert_eq!(read_pid(&path), None);
        std::fs::write(&path, "1234\n").unwrap();
        assert_eq!(read_pid(&path), Some(1234));
        std::fs::write(&path, "not a pid").unwrap();
        assert_eq!(read_pid(&path), None);
    }
}
