//! Weaver command-line entry point.
//!
//! Binary name: `weaver`
//!
//! Parses CLI arguments, sets up tracing, loads `weaver.toml`, then
//! dispatches to the command handler.

mod cli;

use clap::Parser;
use clap_complete::generate;
use weaver_core::config::load_engine_config;
use weaver_observe::tracing_setup::{init_tracing_with, shutdown_tracing, TracingOptions};

use cli::execution::{default_checkpoint_dir, Runtime};
use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Shell completions need nothing else
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "weaver", &mut std::io::stdout());
        return Ok(());
    }

    let default_filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,weaver_core=debug",
        _ => "trace",
    };
    init_tracing_with(TracingOptions {
        enable_otel: cli.otel,
        json: cli.log_json,
        default_filter: Some(default_filter),
    })
    .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let outcome = dispatch(cli).await;
    shutdown_tracing();
    outcome
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Validate { file } => cli::workflow::validate(&file, cli.json),
        Commands::Plan { file } => {
            let runtime = runtime(&cli.config_dir, cli.checkpoint_dir, cli.otel, cli.json, cli.quiet).await?;
            cli::workflow::plan(&file, &runtime.config, cli.json)
        }
        Commands::List { dir } => cli::workflow::list(&dir, cli.json),
        Commands::Schema => cli::workflow::schema(),

        Commands::Run {
            file,
            input,
            input_file,
            account,
            balance,
        } => {
            let runtime = runtime(&cli.config_dir, cli.checkpoint_dir, cli.otel, cli.json, cli.quiet).await?;
            let inputs = cli::execution::read_inputs(input.as_deref(), input_file.as_deref()).await?;
            cli::execution::run(&runtime, &file, inputs, account, balance).await
        }

        Commands::Resume { execution_id, balance } => {
            let runtime = runtime(&cli.config_dir, cli.checkpoint_dir, cli.otel, cli.json, cli.quiet).await?;
            cli::execution::resume(&runtime, execution_id, balance).await
        }

        Commands::Checkpoints => {
            let runtime = runtime(&cli.config_dir, cli.checkpoint_dir, cli.otel, cli.json, cli.quiet).await?;
            cli::execution::checkpoints(&runtime).await
        }

        Commands::Completions { .. } => unreachable!("handled above"),
    }
}

async fn runtime(
    config_dir: &Option<std::path::PathBuf>,
    checkpoint_dir: Option<std::path::PathBuf>,
    otel: bool,
    json: bool,
    quiet: bool,
) -> anyhow::Result<Runtime> {
    let config_dir = match config_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };
    let config = load_engine_config(&config_dir).await;
    let checkpoint_dir = checkpoint_dir.unwrap_or_else(default_checkpoint_dir);
    tracing::debug!(
        config_dir = %config_dir.display(),
        checkpoint_dir = %checkpoint_dir.display(),
        "runtime configured"
    );

    Ok(Runtime {
        config,
        checkpoints: weaver_core::workflow::checkpoint::FileExecutionStore::new(checkpoint_dir),
        otel,
        silent: json || quiet,
        json,
    })
}
