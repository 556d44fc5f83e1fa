// file: src/main.rs
// version: 2.0.0
// guid: h8i9j0k1-l2m3-4567-8901-234567hijklm

//! `syntropy` - main entry point

use clap::Parser;
use std::process::ExitCode;
use syntropy_provision::{
    cli::{
        args::{Cli, Commands},
        commands::*,
    },
    logging::logger,
    pipeline::CancelToken,
};
use tokio::signal;
use tracing::warn;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let logging = if cli.log_json {
        logger::init_json_logger()
    } else {
        logger::init_logger(cli.verbose, cli.quiet)
    };
    if let Err(e) = logging {
        eprintln!("{}", e);
    }

    let result = match Context::load(cli.json, cli.quiet) {
        Ok(ctx) => run(&ctx, cli.command).await,
        Err(e) => Err(e.report()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(report) => {
            print_report(&report, cli.json);
            ExitCode::from(u8::try_from(report.exit_code).unwrap_or(1))
        }
    }
}

async fn run(ctx: &Context, command: Commands) -> CommandResult {
    match command {
        Commands::Create(args) => {
            // Device work must reach its release step, so Ctrl+C only requests cancellation
            let cancel = CancelToken::new();
            let handler = cancel.clone();
            tokio::spawn(async move {
                if signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received; stopping at the next safe point");
                    handler.cancel();
                }
                if signal::ctrl_c().await.is_ok() {
                    warn!("Second interrupt; exiting without releasing the device");
                    std::process::exit(130);
                }
            });
            create_command(ctx, args, &cancel).await
        }
        other => {
            tokio::select! {
                result = run_adapter(ctx, other) => result,
                _ = signal::ctrl_c() => {
                    warn!("Interrupted");
                    std::process::exit(130);
                }
            }
        }
    }
}

async fn run_adapter(ctx: &Context, command: Commands) -> CommandResult {
    match command {
        Commands::Create(args) => create_command(ctx, args, &CancelToken::new()).await,
        Commands::List => list_command(ctx).await,
        Commands::Format {
            device,
            label,
            force,
        } => format_command(ctx, &device, &label, force).await,
        Commands::Debug => debug_command(ctx).await,
        Commands::Keys { action } => keys_command(ctx, action).await,
        Commands::RecordNode {
            node_name,
            description,
            created_by,
        } => record_node_command(ctx, &node_name, description, created_by).await,
        Commands::Cache { action } => cache_command(ctx, action).await,
    }
}
