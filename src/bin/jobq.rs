//! jobq CLI: run workers and inspect the queue.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use jobq_rs::config::Config;
use jobq_rs::config::secrets::ExposeSecret;
use jobq_rs::db::Db;
use jobq_rs::engine::Queue;
use jobq_rs::model::{Disposition, InFlightPolicy, JobId, NewJob, Status};
use jobq_rs::telemetry::{TelemetryConfig, init_telemetry};
use jobq_rs::worker::{LogHandler, Worker, WorkerConfig, WorkerPool};

#[derive(Parser)]
#[command(name = "jobq", about = "Durable background job queue")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a pool of workers until ctrl-c
    Serve {
        /// Number of concurrent workers (defaults to WORKER_COUNT)
        #[arg(long)]
        workers: Option<usize>,
        /// Simulated work time per job, in milliseconds
        #[arg(long, default_value_t = 0)]
        delay_ms: u64,
    },
    /// Job operations
    Job {
        #[command(subcommand)]
        action: JobAction,
    },
    /// Process queued jobs until none remain, then exit
    Drain,
    /// Check database reachability
    Health,
}

#[derive(Subcommand)]
enum JobAction {
    /// Submit a new job
    Submit {
        /// JSON object payload
        payload: String,
        /// Idempotency key (defaults to a digest of the payload)
        #[arg(long)]
        dedup_key: Option<String>,
        /// Queue alongside an in-flight duplicate instead of rejecting
        #[arg(long)]
        allow_in_flight: bool,
    },
    /// Show a job
    Show {
        /// Job ID (full UUID or prefix)
        id: String,
    },
    /// List jobs
    List {
        /// Filter by status
        #[arg(long)]
        status: Option<String>,
        /// Maximum jobs to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let db = Db::connect(config.database_url.expose_secret(), config.db_max_connections).await?;
    db.migrate().await?;

    let result = match cli.command {
        Command::Serve { workers, delay_ms } => cmd_serve(&config, &db, workers, delay_ms).await,
        Command::Drain => cmd_drain(&config, &db).await,
        Command::Health => cmd_health(&db).await,
        Command::Job { action } => match action {
            JobAction::Submit {
                payload,
                dedup_key,
                allow_in_flight,
            } => cmd_job_submit(&db, payload, dedup_key, allow_in_flight).await,
            JobAction::Show { id } => cmd_job_show(&db, id).await,
            JobAction::List { status, limit } => cmd_job_list(&db, status, limit).await,
        },
    };

    db.close().await;
    result
}

fn queue(db: &Db) -> Queue {
    Queue::new(Arc::new(db.clone()))
}

async fn cmd_serve(
    config: &Config,
    db: &Db,
    workers: Option<usize>,
    delay_ms: u64,
) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "jobq".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let count = workers.unwrap_or(config.worker_count).max(1);
    let pool = WorkerPool::spawn(
        &queue(db),
        Arc::new(LogHandler::new(Duration::from_millis(delay_ms))),
        WorkerConfig::from(config),
        count,
    );

    let token = pool.shutdown_token();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("shutdown requested, finishing in-flight jobs");
        token.cancel();
    });

    let reports = pool.join().await;
    for (id, report) in &reports {
        tracing::info!(
            worker_id = %id,
            completed = report.completed,
            failed = report.failed,
            store_errors = report.store_errors,
            "worker summary"
        );
    }
    Ok(())
}

async fn cmd_drain(config: &Config, db: &Db) -> anyhow::Result<()> {
    let worker = Worker::new(
        queue(db),
        Arc::new(LogHandler::default()),
        WorkerConfig::from(config),
    );
    let report = worker.drain().await?;
    println!(
        "Drained: {} completed, {} failed",
        report.completed, report.failed
    );
    Ok(())
}

async fn cmd_health(db: &Db) -> anyhow::Result<()> {
    match queue(db).health().await {
        Ok(()) => {
            println!("healthy");
            Ok(())
        }
        Err(e) => anyhow::bail!("database unavailable: {e}"),
    }
}

async fn cmd_job_submit(
    db: &Db,
    payload: String,
    dedup_key: Option<String>,
    allow_in_flight: bool,
) -> anyhow::Result<()> {
    let payload: serde_json::Value = serde_json::from_str(&payload)?;
    let mut new = NewJob::new(payload);
    if let Some(key) = dedup_key {
        new = new.dedup_key(key);
    }

    let policy = if allow_in_flight {
        InFlightPolicy::Enqueue
    } else {
        InFlightPolicy::Reject
    };
    let submitted = queue(db).with_in_flight_policy(policy).submit(new).await?;

    println!(
        "{}: {} (status: {})",
        match submitted.disposition {
            Disposition::Created => "Created",
            Disposition::Replaced => "Replaced",
        },
        submitted.job.id,
        submitted.job.status
    );
    Ok(())
}

async fn cmd_job_show(db: &Db, id_str: String) -> anyhow::Result<()> {
    let queue = queue(db);

    // Support prefix matching against recent jobs
    let id = if id_str.len() < 36 {
        let jobs = queue.list(None, 100).await?;
        let matches: Vec<_> = jobs
            .iter()
            .filter(|job| job.id.to_string().starts_with(&id_str))
            .collect();
        match matches.len() {
            0 => anyhow::bail!("no job matching prefix '{id_str}'"),
            1 => matches[0].id,
            n => anyhow::bail!("{n} jobs match prefix '{id_str}', be more specific"),
        }
    } else {
        id_str.parse::<JobId>()?
    };

    let job = queue.get(id).await?;

    println!("ID:         {}", job.id);
    println!("Status:     {}", job.status);
    println!("Attempts:   {}", job.attempt_count);
    println!("Dedup Key:  {}", job.dedup_key.as_deref().unwrap_or("-"));
    println!("Worker:     {}", job.worker_id.as_deref().unwrap_or("-"));
    println!("Payload:    {}", serde_json::to_string_pretty(&job.payload)?);
    println!("Created:    {}", job.created_at);
    if let Some(started) = job.started_at {
        println!("Started:    {started}");
    }
    if let Some(completed) = job.completed_at {
        println!("Finished:   {completed}");
    }
    if let Some(ref err) = job.last_error {
        println!("Error:      {err}");
    }

    Ok(())
}

async fn cmd_job_list(db: &Db, status: Option<String>, limit: usize) -> anyhow::Result<()> {
    let status: Option<Status> = match status {
        Some(s) => Some(
            s.parse()
                .map_err(|_| anyhow::anyhow!("invalid status: {s}"))?,
        ),
        None => None,
    };

    let jobs = queue(db).list(status, limit).await?;

    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<10}  {:<3}  {:<24}  CREATED",
        "ID", "STATUS", "TRY", "WORKER"
    );
    println!("{}", "-".repeat(72));

    for job in &jobs {
        let worker = truncate_chars(job.worker_id.as_deref().unwrap_or("-"), 24);
        println!(
            "{:<8}  {:<10}  {:<3}  {:<24}  {}",
            job.id.short(),
            job.status,
            job.attempt_count,
            worker,
            job.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    println!("\n{} job(s)", jobs.len());
    Ok(())
}

/// At most `max` characters of `s`, cut on a char boundary.
fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((end, _)) => &s[..end],
        None => s,
    }
}
