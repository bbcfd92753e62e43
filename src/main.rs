use anyhow::Result;
use babelarr::cli::Cli;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    babelarr::run(cli).await
}
