use std::path::PathBuf;

use anyhow::Result;
use clap::Args;

/// Runs a code-injection build from a JSON config file.
#[derive(Args)]
pub struct Build {
    /// Path to the build config.
    #[arg(long, short = 'c')]
    pub config: PathBuf,
}

impl Build {
    pub fn run(&self) -> Result<()> {
        ffc_core::run_build(&self.config)?;
        Ok(())
    }
}
