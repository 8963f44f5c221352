use clap::Parser;

use pglink_telemetry::init_tracing;

mod commands;
mod render;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = commands::Cli::parse();

    init_tracing(env!("CARGO_BIN_NAME"))?;

    commands::run(cli).await
}
