//! CLI for the dstage data-staging engine.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use dstage_core::config;
use std::path::{Path, PathBuf};
use std::time::Duration;

use commands::{run_check_uploads, run_checksum, run_recovery, run_stage, StageRequest};

/// Top-level CLI for dstage.
#[derive(Debug, Parser)]
#[command(name = "dstage")]
#[command(about = "dstage: data staging for batch jobs", long_about = None)]
pub struct Cli {
    /// Log to stderr instead of the log file in the state directory.
    #[arg(long, global = true)]
    pub log_stderr: bool,

    /// Configuration file (default `~/.config/dstage/config.toml`).
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StageDirection {
    /// Download inputs into the session directory.
    In,
    /// Upload outputs from the session directory.
    Out,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Stage the input or output files of one job and wait for the result.
    Stage {
        /// Job identifier (names the `job.<id>.*` control files).
        #[arg(long)]
        job_id: String,
        /// Session directory of the job.
        #[arg(long)]
        session_dir: PathBuf,
        #[arg(long, value_enum)]
        direction: StageDirection,
        /// Job priority, 1..=100.
        #[arg(long, default_value_t = 50)]
        priority: i32,
        /// Owner of the session directory (default: its current owner).
        #[arg(long)]
        uid: Option<u32>,
        #[arg(long)]
        gid: Option<u32>,
    },

    /// Check files the user uploads into the session directory.
    CheckUploads {
        #[arg(long)]
        job_id: String,
        #[arg(long)]
        session_dir: PathBuf,
        /// How long ago the job started waiting for uploads.
        #[arg(long, default_value_t = 0, value_name = "SECS")]
        started_secs_ago: u64,
    },

    /// List destinations left mid-transfer by a previous run.
    Recovery,

    /// Compute SHA-256 of a file.
    Checksum {
        /// Path to the file.
        path: String,
    },
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let cfg = match &self.config {
            Some(path) => config::load_from_path(path)?,
            None => config::load_or_init()?,
        };
        tracing::debug!("loaded config: {:?}", cfg);

        match self.command {
            CliCommand::Stage {
                job_id,
                session_dir,
                direction,
                priority,
                uid,
                gid,
            } => {
                let req = StageRequest {
                    job_id,
                    session_dir,
                    staging_in: direction == StageDirection::In,
                    priority,
                    uid,
                    gid,
                };
                run_stage(&cfg, req).await?;
            }
            CliCommand::CheckUploads {
                job_id,
                session_dir,
                started_secs_ago,
            } => {
                run_check_uploads(
                    &cfg,
                    &job_id,
                    &session_dir,
                    Duration::from_secs(started_secs_ago),
                )?;
            }
            CliCommand::Recovery => run_recovery(&cfg)?,
            CliCommand::Checksum { path } => run_checksum(Path::new(&path))?,
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests;
