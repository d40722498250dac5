// Outer supervisor. Runs the trading agent as a child process, polls
// its liveness and health endpoint, and restarts it within a budget
// when it dies or goes unresponsive.

use std::process::Stdio;
use std::time::Duration;

use clap::Parser;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout, Instant};
use tracing::{error, info, warn};

// Give the child time to bind its health server before the first poll.
const STARTUP_GRACE_SECS: u64 = 15;
// Consecutive failed health polls that count as unresponsive.
const MAX_HEALTH_FAILURES: u32 = 3;
// SIGTERM grace before SIGKILL.
const TERM_GRACE_SECS: u64 = 10;
const RESTART_PAUSE_SECS: u64 = 5;
const RESTART_WINDOW_SECS: u64 = 3600;
const HEALTH_POLL_TIMEOUT_SECS: u64 = 5;

#[derive(Parser, Debug)]
#[command(name = "guardian", about = "Keeps the trading agent process alive")]
struct Args {
    /// Health endpoint of the supervised process.
    #[arg(long, default_value = "http://127.0.0.1:8080/health")]
    health_url: String,

    /// Seconds between checks.
    #[arg(long, default_value_t = 60)]
    check_interval_secs: u64,

    /// Restarts allowed per hour before giving up.
    #[arg(long, default_value_t = 5)]
    max_restarts: u32,

    /// Command (and arguments) to supervise.
    #[arg(trailing_var_arg = true, num_args = 1.., default_value = "./perpbot")]
    command: Vec<String>,
}

fn spawn_child(command: &[String]) -> std::io::Result<Child> {
    info!("starting: {}", command.join(" "));
    Command::new(&command[0])
        .args(&command[1..])
        .stdin(Stdio::null())
        .spawn()
}

/// Cooperative stop: SIGTERM, bounded wait, then SIGKILL.
async fn stop_child(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        match timeout(Duration::from_secs(TERM_GRACE_SECS), child.wait()).await {
            Ok(_) => {
                info!("child exited after SIGTERM");
                return;
            }
            Err(_) => warn!("child ignored SIGTERM for {}s", TERM_GRACE_SECS),
        }
    }
    if let Err(err) = child.kill().await {
        warn!("kill failed: {}", err);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "guardian=info".into()),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(HEALTH_POLL_TIMEOUT_SECS))
        .build()?;

    let mut child = spawn_child(&args.command)?;
    sleep(Duration::from_secs(STARTUP_GRACE_SECS)).await;

    let mut restarts: u32 = 0;
    let mut window_start = Instant::now();
    let mut health_failures: u32 = 0;

    loop {
        sleep(Duration::from_secs(args.check_interval_secs)).await;

        if window_start.elapsed() >= Duration::from_secs(RESTART_WINDOW_SECS) {
            if restarts > 0 {
                info!("hourly window elapsed, clearing restart counter");
            }
            restarts = 0;
            window_start = Instant::now();
        }

        let needs_restart = match child.try_wait()? {
            Some(status) => {
                warn!("child exited with {}", status);
                true
            }
            None => {
                match http.get(&args.health_url).send().await {
                    Ok(response) if response.status().is_success() => {
                        health_failures = 0;
                        false
                    }
                    Ok(response) => {
                        health_failures += 1;
                        warn!(
                            "health check returned {} ({}/{})",
                            response.status(),
                            health_failures,
                            MAX_HEALTH_FAILURES
                        );
                        health_failures >= MAX_HEALTH_FAILURES
                    }
                    Err(err) => {
                        health_failures += 1;
                        warn!(
                            "health check unreachable ({}/{}): {}",
                            health_failures, MAX_HEALTH_FAILURES, err
                        );
                        health_failures >= MAX_HEALTH_FAILURES
                    }
                }
            }
        };

        if !needs_restart {
            continue;
        }

        restarts += 1;
        if restarts > args.max_restarts {
            error!(
                "restart budget of {} per hour exhausted, giving up",
                args.max_restarts
            );
            stop_child(&mut child).await;
            std::process::exit(1);
        }

        warn!("restarting child ({}/{})", restarts, args.max_restarts);
        stop_child(&mut child).await;
        sleep(Duration::from_secs(RESTART_PAUSE_SECS)).await;

        child = spawn_child(&args.command)?;
        health_failures = 0;
        sleep(Duration::from_secs(STARTUP_GRACE_SECS)).await;
    }
}
