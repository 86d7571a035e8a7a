//! voicetotex - host for the VoiceToTex speech backend
//!
//! Run with `voicetotex` or `voicetotex run` to supervise the backend.
//! Use `voicetotex provision` to inspect or bootstrap the Python runtime.
//! Use `voicetotex status` to read the backend status of a running host.

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use voicetotex::cli::{Cli, Commands};
use voicetotex::config::{self, Config};
use voicetotex::provision::{accel, Provisioner};
use voicetotex::Host;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("voicetotex={},warn", log_level))),
        )
        .with_target(false)
        .init();

    // Load configuration
    let mut config = config::load_config(cli.config.as_deref())?;

    // Apply CLI overrides
    if let Some(dir) = cli.backend_dir {
        config.worker.backend_dir = Some(dir);
    }

    match cli.command.unwrap_or(Commands::Run { command: None }) {
        Commands::Run { command } => {
            Host::new(config)
                .with_python(cli.python)
                .with_initial_command(command)
                .run()
                .await?;
        }

        Commands::Provision { bootstrap } => {
            run_provision(&config, cli.python, bootstrap).await?;
        }

        Commands::Status { format } => {
            run_status(&config, &format)?;
        }

        Commands::Config => {
            show_config(&config)?;
        }
    }

    Ok(())
}

/// Print the resolved launch parameters, bootstrapping first if asked
async fn run_provision(
    config: &Config,
    python: Option<PathBuf>,
    bootstrap: bool,
) -> anyhow::Result<()> {
    let provisioner = Provisioner::from_config(config).with_python_override(python);

    println!("Backend directory: {:?}", provisioner.backend_dir());
    if !provisioner.backend_dir().is_dir() {
        println!("  (missing; set [worker] backend_dir or VOICETOTEX_BACKEND_DIR)");
    }

    if bootstrap {
        if provisioner.needs_bootstrap() {
            let progress = |message: String| println!("{}", message);
            let python = provisioner.bootstrap(&progress).await?;
            println!("Environment ready: {:?}", python);
        } else {
            println!("Runtime already available, nothing to bootstrap");
        }
    } else if provisioner.needs_bootstrap() {
        println!("No runtime yet; it will be created on first run (or use --bootstrap)");
    }

    let interpreter = provisioner.locate_interpreter();
    println!(
        "Interpreter: {:?} ({})",
        interpreter.path,
        interpreter.source.display_name()
    );

    let accel_dirs = accel::discover_accelerator_path(&interpreter.path);
    if accel_dirs.is_empty() {
        println!("GPU libraries: none found (CPU only)");
    } else {
        println!("GPU libraries:");
        for dir in &accel_dirs {
            println!("  {:?}", dir);
        }
    }

    let spec = provisioner.spawn_spec(&interpreter, &accel_dirs);
    let args: Vec<String> = spec
        .args
        .iter()
        .map(|a| a.to_string_lossy().into_owned())
        .collect();
    println!("Command: {} {}", spec.program.display(), args.join(" "));
    println!("Working directory: {:?}", spec.cwd);
    for (key, value) in &spec.env {
        println!("  {}={}", key.to_string_lossy(), value.to_string_lossy());
    }

    Ok(())
}

/// Read the state file written by a running host
fn run_status(config: &Config, format: &str) -> anyhow::Result<()> {
    let Some(state_path) = config.resolve_state_file() else {
        anyhow::bail!(
            "state_file is not configured.\n\n\
             To enable status monitoring, add to your config.toml:\n\n  state_file = \"auto\""
        );
    };

    let state = std::fs::read_to_string(&state_path).unwrap_or_else(|_| "stopped".to_string());
    let state = state.trim();

    if format == "json" {
        println!("{}", format_state_json(state));
    } else {
        println!("{}", state);
    }
    Ok(())
}

fn format_state_json(state: &str) -> String {
    let tooltip = match state {
        "loading" => "Preparing the speech backend...",
        "starting" => "Starting the speech backend...",
        "ready" => "VoiceToTex ready",
        "restarting" => "Backend crashed, restarting...",
        "crashed" => "Backend stopped; restart with SIGUSR1",
        "error" => "Backend cannot be launched; see the host log",
        "idle" => "Backend exited; restart with SIGUSR1",
        "stopped" => "VoiceToTex not running",
        _ => "Unknown state",
    };

    serde_json::json!({
        "text": state,
        "class": state,
        "tooltip": tooltip,
    })
    .to_string()
}

/// Show current configuration
fn show_config(config: &Config) -> anyhow::Result<()> {
    if let Some(path) = Config::default_path() {
        println!("# Config file: {:?}\n", path);
    }
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}
