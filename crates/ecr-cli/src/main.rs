use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use ecr_sync::{Pipeline, PipelineConfig, ProcessSummary};

mod logging;

use logging::{init_logging, LogFormat};

#[derive(Debug, Parser)]
#[command(name = "ecr")]
#[command(about = "CRS report archive pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Restrict work to files or reports whose name contains this substring.
    #[arg(long, global = true, env = "ONLY")]
    only: Option<String>,

    #[arg(long, global = true)]
    incoming: Option<PathBuf>,

    #[arg(long, global = true)]
    reports: Option<PathBuf>,

    #[arg(long, global = true)]
    site: Option<PathBuf>,

    #[arg(long, global = true)]
    workers: Option<usize>,

    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum Commands {
    /// Adapt raw records, redact files and write report JSON.
    Process,
    /// Compute version-to-version HTML diffs.
    Diff,
    /// Package ePubs.
    Epub,
    /// Render report pages.
    Pages,
    /// Run every phase in order.
    All,
}

impl Cli {
    fn config(&self) -> PipelineConfig {
        let mut config = PipelineConfig::from_env();
        if let Some(dir) = &self.incoming {
            config.incoming_dir = dir.clone();
        }
        if let Some(dir) = &self.reports {
            config.reports_dir = dir.clone();
        }
        if let Some(dir) = &self.site {
            config.site_dir = dir.clone();
        }
        if let Some(workers) = self.workers.filter(|n| *n > 0) {
            config.workers = workers;
        }
        if let Some(only) = self.only.as_ref().filter(|v| !v.is_empty()) {
            config.only = Some(only.clone());
        }
        config
    }
}

fn print_process(summary: &ProcessSummary) {
    println!(
        "process complete: run_id={} records={} reports={} conflicts={} cleaned={} thumbnails={} written={} removed={}",
        summary.run_id,
        summary.raw_records,
        summary.reports,
        summary.same_day_conflicts,
        summary.files_cleaned,
        summary.thumbnails,
        summary.reports_written,
        summary.reports_removed + summary.files_removed,
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);
    let pipeline = Pipeline::new(cli.config());

    match cli.command.unwrap_or(Commands::Process) {
        Commands::Process => print_process(&pipeline.process().await?),
        Commands::Diff => println!("diff complete: written={}", pipeline.diff().await?),
        Commands::Epub => println!("epub complete: written={}", pipeline.epub().await?),
        Commands::Pages => {
            let pages = pipeline.pages().await?;
            println!(
                "pages complete: rendered={} current={} failed={} removed={}",
                pages.rendered,
                pages.current,
                pages.failed,
                pages.removed.len()
            );
        }
        Commands::All => {
            let summary = pipeline.run_all().await?;
            print_process(&summary.process);
            println!(
                "derived complete: diffs={} epubs={} pages={}",
                summary.diffs, summary.epubs, summary.pages_rendered
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_environment_defaults() {
        let cli = Cli::parse_from(["ecr", "--reports", "/tmp/out", "--workers", "3", "diff"]);
        let config = cli.config();
        assert_eq!(config.reports_dir, PathBuf::from("/tmp/out"));
        assert_eq!(config.workers, 3);
        assert!(matches!(cli.command, Some(Commands::Diff)));
    }

    #[test]
    fn process_is_the_default_command() {
        let cli = Cli::parse_from(["ecr", "-vv"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.verbose, 2);
    }
}
