//! Command-line surface.

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};

use jobgate_core::JobIdentity;

#[derive(Debug, Parser)]
#[command(name = "jobgate-runner")]
#[command(about = "Run a job at most once per identity under a conditional-write lock", version)]
pub struct Cli {
    /// Postgres connection string; without it an in-memory store is used
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    pub database_url: Option<String>,

    /// Endpoint receiving failure notifications as JSON
    #[arg(long, env = "JOBGATE_WEBHOOK_URL", global = true)]
    pub webhook_url: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Execute the command once, if the job is eligible
    Run {
        #[command(flatten)]
        target: Target,

        /// Fixed result reference (`{identity}` is substituted)
        #[arg(long)]
        result_ref: Option<String>,

        /// The job command (after --)
        #[arg(last = true, required = true)]
        cmd: Vec<String>,
    },

    /// Create the idle record of a job
    Seed {
        #[command(flatten)]
        target: Target,
    },

    /// Print the stored record as JSON
    Inspect {
        #[command(flatten)]
        target: Target,
    },
}

#[derive(Debug, Clone, Args)]
pub struct Target {
    /// Job identity (record partition key)
    #[arg(long)]
    pub identity: Option<String>,

    /// Treat the identity as a YYYY-MM-DD date key (defaults to today, UTC)
    #[arg(long)]
    pub date_key: bool,
}

impl Target {
    pub fn resolve(&self, today: NaiveDate) -> anyhow::Result<JobIdentity> {
        match (&self.identity, self.date_key) {
            (Some(raw), true) => Ok(JobIdentity::parse_date_key(raw)?),
            (Some(raw), false) => Ok(JobIdentity::new(raw.as_str())?),
            (None, true) => Ok(JobIdentity::for_date(today)),
            (None, false) => anyhow::bail!("either --identity or --date-key is required"),
        }
    }
}
