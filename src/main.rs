use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser as _;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    quest_archiver::logging::init().context("init logging")?;

    let cli = quest_archiver::cli::Cli::parse();
    tracing::debug!(?cli, "parsed cli");

    match cli.command {
        quest_archiver::cli::Command::Scrape(args) => {
            quest_archiver::pipeline::scrape(args)
                .await
                .context("scrape")?;
        }
        quest_archiver::cli::Command::Targeted(args) => {
            quest_archiver::pipeline::targeted(args)
                .await
                .context("targeted")?;
        }
        quest_archiver::cli::Command::View(args) => {
            quest_archiver::pipeline::view(args).context("view")?;
        }
    }

    Ok(())
}
