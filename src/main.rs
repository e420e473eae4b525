use clap::Parser;
use peersend::headless::{run, CliArgs};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    run(CliArgs::parse()).await
}
