pub mod cmd;

use anyhow::Result;
use clap::{Parser, Subcommand};
use cmd::Build;
use env_logger::WriteStyle;
use log::LevelFilter;

/// Code-injection build driver: compiles, links, and patches ARM objects
/// into an extracted Nintendo DS ROM filesystem.
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Enables debug logs.
    #[arg(long, short)]
    debug: bool,

    /// Forces colored output.
    #[arg(long, short)]
    force_color: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    Build(Build),
}

impl Command {
    fn run(&self) -> Result<()> {
        match self {
            Command::Build(build) => build.run(),
        }
    }
}

fn main() -> Result<()> {
    let args = Cli::parse();

    let level = if args.debug { LevelFilter::Debug } else { LevelFilter::Info };
    let write_style = if args.force_color { WriteStyle::Always } else { WriteStyle::Auto };
    let mut builder = env_logger::builder();
    if !args.debug {
        builder.format_timestamp(None).format_target(false);
    }
    builder.filter_level(level).write_style(write_style);
    builder.init();

    args.command.run()
}
