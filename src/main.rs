use clap::Parser;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use command_supervisor::{run, CommandSpec, ErrorKind, ExecutionError, DEFAULT_GRACE_PERIOD};

/// Run a command with a timeout, killing its whole process group if it overruns.
///
/// Example usage:
///
///     command_supervisor -c "curl https://www.google.com/" --timeout-ms 5000 --follow
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// External command to execute (e.g., curl https://www.google.com/).
    /// Split on whitespace, no shell. If not provided, you will be prompted.
    #[arg(short = 'c', long = "command")]
    command: Option<String>,

    /// Optional TOML configuration file with timeout, cwd and env settings.
    #[arg(short = 'f', long = "conf")]
    config: Option<PathBuf>,

    /// Timeout in milliseconds; overrides `timeout_ms` from the config file.
    #[arg(short = 't', long = "timeout-ms")]
    timeout_ms: Option<u64>,

    /// Print each output line as soon as the command writes it.
    #[arg(long)]
    follow: bool,

    /// Log level used when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// The configuration structure loaded from a TOML file.
#[derive(Deserialize, Debug, Default, PartialEq)]
#[serde(deny_unknown_fields)]
struct Config {
    timeout_ms: Option<u64>,
    grace_period_ms: Option<u64>,
    cwd: Option<PathBuf>,
    #[serde(default)]
    env: BTreeMap<String, String>,
}

/// Reads and parses configuration from a TOML file.
fn read_config(path: &PathBuf) -> Result<Config, Box<dyn std::error::Error>> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

fn parse_config(content: &str) -> Result<Config, Box<dyn std::error::Error>> {
    let cfg: Config = toml::from_str(content)?;
    Ok(cfg)
}

fn split_command(command_str: &str) -> Vec<String> {
    command_str.split_whitespace().map(|s| s.to_string()).collect()
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn prompt_for_input(prompt: &str) -> Result<String, Box<dyn std::error::Error>> {
    print!("{}", prompt);
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

fn build_spec(argv: Vec<String>, config: Config, timeout_ms: Option<u64>, follow: bool) -> CommandSpec {
    let mut spec = CommandSpec::new(argv).envs(config.env).grace_period(
        config
            .grace_period_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_GRACE_PERIOD),
    );
    if let Some(ms) = timeout_ms.or(config.timeout_ms) {
        spec = spec.timeout(Duration::from_millis(ms));
    }
    if let Some(dir) = config.cwd {
        spec = spec.current_dir(dir);
    }
    if follow {
        spec = spec.on_line(|line| println!("{}", line));
    }
    spec
}

/// Process exit status mirroring the conventions of coreutils `timeout` and shells.
fn exit_status_for(err: &ExecutionError) -> i32 {
    match err.kind() {
        ErrorKind::NonZeroExit => err.exit_code(),
        ErrorKind::SignalTerminated => 128 - err.exit_code(),
        ErrorKind::Timeout => 124,
        ErrorKind::NotFound => 127,
        _ => 1,
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    init_logging(&args.log_level);
    info!("Starting CLI");

    let command_str = if let Some(cmd) = args.command {
        cmd
    } else {
        match prompt_for_input("Enter your Command - ") {
            Ok(cmd) if !cmd.is_empty() => cmd,
            _ => {
                eprintln!("No command provided; exiting.");
                std::process::exit(1);
            }
        }
    };

    let config = match &args.config {
        Some(path) => match read_config(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Error reading config file: {}", e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };
    debug!("Loaded config: {:#?}", config);

    let argv = split_command(&command_str);
    if argv.is_empty() {
        eprintln!("Empty command provided; exiting.");
        std::process::exit(1);
    }
    info!(command = ?argv, "Command to run");

    let spec = build_spec(argv, config, args.timeout_ms, args.follow);

    match run(spec).await {
        Ok(response) => {
            info!(duration = ?response.duration, "Command finished");
            if !args.follow && !response.output.is_empty() {
                println!("{}", response.output);
            }
        }
        Err(e) => {
            error!(kind = %e.kind(), exit_code = e.exit_code(), "{}", e);
            if !args.follow && e.kind() != ErrorKind::NonZeroExit && e.output() != e.message() {
                println!("{}", e.output());
            }
            std::process::exit(exit_status_for(&e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let cfg = parse_config(
            r#"
timeout_ms = 1500
grace_period_ms = 100
cwd = "/tmp"

[env]
RUST_LOG = "debug"
"#,
        )
        .unwrap();
        assert_eq!(cfg.timeout_ms, Some(1500));
        assert_eq!(cfg.grace_period_ms, Some(100));
        assert_eq!(cfg.cwd, Some(PathBuf::from("/tmp")));
        assert_eq!(cfg.env.get("RUST_LOG").map(String::as_str), Some("debug"));

        assert_eq!(parse_config("").unwrap(), Config::default());
        assert!(parse_config("minimum_timeout_ms = 5").is_err());
    }

    #[test]
    fn test_split_command() {
        assert_eq!(split_command("  ls   -la /tmp "), vec!["ls", "-la", "/tmp"]);
        assert!(split_command("   ").is_empty());
    }

    #[test]
    fn test_cli_timeout_overrides_config() {
        let cfg = Config {
            timeout_ms: Some(10_000),
            ..Config::default()
        };
        let spec = build_spec(vec!["true".to_string()], cfg, Some(250), false);
        let debug = format!("{:?}", spec);
        assert!(debug.contains("timeout: Some(250ms)"), "{}", debug);
    }

    #[test]
    fn test_exit_status_mapping() {
        assert_eq!(exit_status_for(&ExecutionError::new(ErrorKind::Timeout, "t")), 124);
        assert_eq!(exit_status_for(&ExecutionError::new(ErrorKind::NotFound, "n")), 127);
        assert_eq!(exit_status_for(&ExecutionError::new(ErrorKind::SpawnError, "s")), 1);
    }
}
