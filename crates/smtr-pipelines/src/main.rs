mod app;
mod cli;
mod commands;

use clap::Parser;

use crate::app::App;
use crate::cli::{Cli, Commands};
use crate::commands::PlanOptions;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries the JSON results, logs go to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "smtr_pipelines=info,smtr_capture=info,smtr_treatment=info,\
                 smtr_integration=info,smtr_core=info"
                    .into()
            }),
        )
        .init();

    let cli = Cli::parse();
    let app = App::load(cli.config.as_ref(), &cli.run)?;

    match cli.command {
        Commands::Env => commands::env(&app),
        Commands::Context {
            table_id,
            timestamp,
        } => commands::context(&app, &table_id, timestamp.as_deref()),
        Commands::Plan {
            table_id,
            start,
            end,
            days,
            cap,
            historical,
        } => commands::plan(
            &app,
            &table_id,
            PlanOptions {
                start: start.as_deref(),
                end: end.as_deref(),
                days,
                cap,
                historical,
            },
        ),
        Commands::Capture(args) => commands::capture(&app, args).await,
        Commands::Materialize(args) => commands::materialize(&app, args).await,
        Commands::Post(args) => commands::post(&app, args).await,
    }
}
