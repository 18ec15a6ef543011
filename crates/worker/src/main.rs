//! One orchestrator tick: read a `TickEvent` on stdin, dispatch, print the `DispatchReport`.
//!
//! The concurrency limit comes from the job the event names, as snapshotted
//! when the job was created.
//!
//! Environment: `DATABASE_URL`, `REDIS_URL`, `LAKEPURGE_QUERY_STREAM`,
//! `LAKEPURGE_EXECUTIONS_STREAM`, `LAKEPURGE_CONSUMER`, plus the purge settings
//! read by `PurgeConfig::from_env`.

use std::io::{Read, Write};
use std::process::ExitCode;

use anyhow::Context;

use lakepurge_infra::config::PurgeConfig;
use lakepurge_infra::dispatcher::{DispatchReport, ExecutionLauncher, TickEvent, WorkQueueDispatcher};
use lakepurge_infra::jobs::{JobStore, PostgresJobStore};
use lakepurge_infra::pg::PgRuntime;
use lakepurge_infra::work_queue::{RedisStreamsLauncher, RedisStreamsWorkQueue, WorkQueue};

const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

fn main() -> ExitCode {
    lakepurge_observability::init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "dispatch tick failed");
            ExitCode::FAILURE
        }
    }
}

fn run() -> anyhow::Result<()> {
    let config = PurgeConfig::from_env().context("loading purge settings")?;

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pg = PgRuntime::connect(&database_url, 2).context("connecting to postgres")?;
    let jobs = PostgresJobStore::new(pg);

    let redis_url = std::env::var("REDIS_URL").unwrap_or_else(|_| {
        tracing::warn!("REDIS_URL not set; using {DEFAULT_REDIS_URL}");
        DEFAULT_REDIS_URL.to_string()
    });
    let consumer = std::env::var("LAKEPURGE_CONSUMER")
        .unwrap_or_else(|_| format!("dispatcher-{}", std::process::id()));

    let queue = RedisStreamsWorkQueue::new(&redis_url, std::env::var("LAKEPURGE_QUERY_STREAM").ok(), consumer)
        .context("opening query queue")?;
    let launcher = RedisStreamsLauncher::new(&redis_url, std::env::var("LAKEPURGE_EXECUTIONS_STREAM").ok())
        .context("opening executions stream")?;

    let dispatcher = WorkQueueDispatcher::new(queue, launcher, config.dispatcher);
    let report = run_tick(std::io::stdin().lock(), &jobs, &dispatcher)?;

    let mut out = std::io::stdout().lock();
    serde_json::to_writer(&mut out, &report).context("writing dispatch report")?;
    writeln!(out)?;
    Ok(())
}

/// Read one event and dispatch it against the named job's snapshot.
fn run_tick<J, Q, L>(
    input: impl Read,
    jobs: &J,
    dispatcher: &WorkQueueDispatcher<Q, L>,
) -> anyhow::Result<DispatchReport>
where
    J: JobStore,
    Q: WorkQueue,
    L: ExecutionLauncher,
{
    let event = read_event(input)?;
    dispatcher
        .dispatch_tick(&event, jobs)
        .with_context(|| format!("dispatching for execution {}", event.execution_id))
}

fn read_event(mut input: impl Read) -> anyhow::Result<TickEvent> {
    let mut raw = String::new();
    input.read_to_string(&mut raw).context("reading tick event from stdin")?;
    serde_json::from_str(&raw).context("parsing tick event")
}
