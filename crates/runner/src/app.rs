//! Wiring of store, notifier and coordinator for one runner invocation.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use jobgate_core::JobIdentity;
use jobgate_infra::{
    AcquireMode, CoordinatorConfig, CoordinatorError, ExecutionCoordinator, ExecutionOutcome,
    InMemoryStateStore, LockError, LogNotifier, NotificationSink, PostgresStateStore, StateStore,
    StateStoreError,
};

use crate::cli::{Cli, Commands};
use crate::command::CommandJob;

pub const EXIT_OK: u8 = 0;
pub const EXIT_JOB_FAILED: u8 = 1;
pub const EXIT_ERROR: u8 = 2;

/// Storage backend picked from the command line.
pub enum Backend {
    Postgres(PostgresStateStore),
    InMemory(Arc<InMemoryStateStore>),
}

impl Backend {
    pub async fn connect(database_url: Option<&str>) -> anyhow::Result<Self> {
        let Some(url) = database_url else {
            warn!("DATABASE_URL not set; using an in-memory store (state is lost on exit)");
            return Ok(Backend::InMemory(InMemoryStateStore::arc()));
        };

        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
            .await
            .context("connecting to Postgres")?;
        let store = PostgresStateStore::new(pool);
        store.migrate().await.context("ensuring job_records schema")?;
        Ok(Backend::Postgres(store))
    }

    fn store(&self) -> Arc<dyn StateStore> {
        match self {
            Backend::Postgres(store) => Arc::new(store.clone()),
            Backend::InMemory(store) => store.clone(),
        }
    }

    fn is_ephemeral(&self) -> bool {
        matches!(self, Backend::InMemory(_))
    }
}

fn notifier(webhook_url: Option<&str>) -> anyhow::Result<Arc<dyn NotificationSink>> {
    #[cfg(feature = "webhook")]
    {
        if let Some(url) = webhook_url {
            return Ok(Arc::new(jobgate_infra::WebhookNotifier::new(url)?));
        }
    }
    #[cfg(not(feature = "webhook"))]
    {
        if webhook_url.is_some() {
            warn!("built without the `webhook` feature; failure notifications go to the log");
        }
    }
    Ok(Arc::new(LogNotifier))
}

/// Run the parsed command line; returns the process exit code.
pub async fn execute(cli: Cli, config: CoordinatorConfig) -> anyhow::Result<u8> {
    let backend = Backend::connect(cli.database_url.as_deref()).await?;
    let coordinator = ExecutionCoordinator::builder(backend.store())
        .notifier(notifier(cli.webhook_url.as_deref())?)
        .config(config.clone())
        .build()?;
    let today = Utc::now().date_naive();

    match cli.command {
        Commands::Run {
            target,
            result_ref,
            cmd,
        } => {
            let identity = target.resolve(today)?;
            let mut body = CommandJob::from_argv(&cmd)?;
            if let Some(template) = result_ref.as_deref() {
                body = body.with_result_ref(template, &identity);
            }

            // A throwaway store has nothing seeded out-of-band.
            if backend.is_ephemeral() && config.acquire_mode == AcquireMode::PreExisting {
                coordinator.seed(&identity).await?;
            }

            let outcome = coordinator.run(&identity, &body).await?;
            print_json(&outcome)?;
            Ok(exit_code(&outcome))
        }
        Commands::Seed { target } => {
            let identity = target.resolve(today)?;
            seed(&coordinator, &identity).await
        }
        Commands::Inspect { target } => {
            let identity = target.resolve(today)?;
            match coordinator.inspect(&identity).await? {
                Some(record) => {
                    print_json(&record)?;
                    Ok(EXIT_OK)
                }
                None => {
                    eprintln!("no job record for {identity}");
                    Ok(EXIT_JOB_FAILED)
                }
            }
        }
    }
}

async fn seed(coordinator: &ExecutionCoordinator, identity: &JobIdentity) -> anyhow::Result<u8> {
    match coordinator.seed(identity).await {
        Ok(record) => {
            print_json(&record)?;
            Ok(EXIT_OK)
        }
        Err(CoordinatorError::Lock(LockError::Store(StateStoreError::AlreadyExists(key)))) => {
            info!(%key, "record already exists; left untouched");
            if let Some(record) = coordinator.inspect(identity).await? {
                print_json(&record)?;
            }
            Ok(EXIT_OK)
        }
        Err(e) => Err(e.into()),
    }
}

pub fn exit_code(outcome: &ExecutionOutcome) -> u8 {
    match outcome {
        ExecutionOutcome::Succeeded { .. } | ExecutionOutcome::Skipped { .. } => EXIT_OK,
        ExecutionOutcome::Failed { .. } => EXIT_JOB_FAILED,
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}
