// demos/follow_output.rs

use command_supervisor::{run, CommandSpec, ErrorKind};
use std::path::PathBuf;
use std::time::Duration;
use tempfile::Builder;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

// Define the Git repository URL
const REPO_URL: &str = "https://github.com/git/git.git";

// Run like this:
// RUST_LOG=debug cargo run --example follow_output

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("Setting default tracing subscriber failed");

    info!("Starting git clone example...");

    let timeout = Duration::from_secs(60 * 5);

    let target = Builder::new().prefix("follow_output_clone").tempdir()?;
    let target_path: PathBuf = target.path().join("repo");

    info!(
        "Preparing to clone '{}' into '{}' (timeout {:?})",
        REPO_URL,
        target_path.display(),
        timeout
    );

    // `git clone --progress` reports on stderr, which lands in the same output.
    let spec = CommandSpec::new([
        "git".to_string(),
        "clone".to_string(),
        "--progress".to_string(),
        "--depth=1".to_string(),
        REPO_URL.to_string(),
        target_path.display().to_string(),
    ])
    .timeout(timeout)
    .env("GIT_TERMINAL_PROMPT", "0")
    .on_line(|line| info!(target: "git", "{}", line));

    match run(spec).await {
        Ok(response) => {
            info!("Clone finished in {:?}", response.duration);
            info!("Output length: {} bytes", response.output.len());
        }
        Err(e) => {
            match e.kind() {
                ErrorKind::Timeout => error!("Clone FAILED due to timeout: {}", e),
                ErrorKind::NotFound => error!("git is not installed: {}", e),
                ErrorKind::NonZeroExit => warn!(exit_code = e.exit_code(), "git exited with an error"),
                _ => error!("Command execution failed: {}", e),
            }
            return Err(e.into());
        }
    }

    Ok(())
}
