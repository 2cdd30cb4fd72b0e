mod commands;
mod config;
mod telemetry;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use invoice_sync::{
    Amount, CfdiParser, Collaborators, Direction, NaturalKey, RequestId, Resolution,
    ServiceSettings, SubjectId, SyncService, Throttle,
};
use invoice_sync_http::{HttpSyncClient, HttpSyncClientConfig};
use invoice_sync_store::SqliteStore;

use crate::config::AppConfig;

#[derive(Parser)]
#[command(name = "invoice-sync")]
#[command(about = "Bulk-download and import CFDI invoices from the tax authority")]
struct Cli {
    /// Config file (defaults to ~/.config/invoice-sync/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Treat this date as today (YYYY-MM-DD)
    #[arg(long, global = true)]
    today: Option<NaiveDate>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the range the next job for a subject would cover
    Plan {
        /// Taxpayer RFC
        subject: String,
        #[arg(long, default_value = "issued")]
        direction: Direction,
    },
    /// Advance every pending job of a subject, then request what is missing
    Sync {
        subject: String,
        /// Only this direction (defaults to both)
        #[arg(long)]
        direction: Option<Direction>,
    },
    /// Request a job for an explicit date range
    Create {
        subject: String,
        #[arg(long, default_value = "issued")]
        direction: Direction,
        #[arg(long)]
        from: NaiveDate,
        #[arg(long)]
        to: NaiveDate,
    },
    /// Poll the provider for a job
    Verify { id: String },
    /// Download the packages of a verified job
    Download { id: String },
    /// Import downloaded packages
    Import { id: String },
    /// Show the status of one job
    Status {
        id: String,
        #[arg(long)]
        json: bool,
    },
    /// List jobs
    List {
        /// Only jobs of this subject
        #[arg(long)]
        subject: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Show the audit trail of a job
    Audit { id: String },
    /// Settle a job whose creation was never confirmed by the provider
    Resolve {
        id: String,
        /// Provider job id to continue with
        #[arg(long, required_unless_present = "abandon", conflicts_with = "abandon")]
        job: Option<String>,
        /// Give up on the job and free its slot
        #[arg(long)]
        abandon: bool,
    },
    /// Override the tax amounts of an imported invoice
    Edit {
        subject: String,
        /// Fiscal folio (UUID) of the invoice
        key: String,
        #[arg(long)]
        transferred: Option<Amount>,
        #[arg(long)]
        withheld: Option<Amount>,
    },
}

fn build_service(config: &AppConfig) -> Result<SyncService> {
    let path = config::store_path(config)?;
    let store = Arc::new(
        SqliteStore::open(&path)
            .with_context(|| format!("failed to open sync database at {}", path.display()))?,
    );

    let client = HttpSyncClient::new(HttpSyncClientConfig {
        base_url: config.gateway.base_url.clone(),
        token: config.gateway.token(),
        timeout: Duration::from_secs(config.gateway.timeout_secs),
    })
    .context("failed to configure gateway client")?;

    let deps = Collaborators {
        client: Arc::new(client),
        requests: store.clone(),
        packages: store.clone(),
        invoices: store.clone(),
        watermarks: store.clone(),
        audit: store,
        parser: Arc::new(CfdiParser),
    };
    let settings = ServiceSettings {
        import_concurrency: config.import.concurrency.max(1),
        ..ServiceSettings::default()
    };
    let throttle = Throttle::per_minute(config.throttle.requests_per_minute, config.throttle.burst);

    Ok(SyncService::new(deps, settings, throttle))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::load_config(cli.config.as_deref())?;
    telemetry::init(&config.log.level)?;

    let service = build_service(&config)?;
    let today = cli.today.unwrap_or_else(|| Local::now().date_naive());
    tracing::debug!(gateway = service.client_label(), %today, "starting");

    match cli.command {
        Command::Plan { subject, direction } => {
            commands::plan::run(&service, &SubjectId::new(subject), direction, today).await
        }
        Command::Sync { subject, direction } => {
            let directions = match direction {
                Some(direction) => vec![direction],
                None => Direction::all().to_vec(),
            };
            commands::sync::run(&service, &SubjectId::new(subject), &directions, today).await
        }
        Command::Create {
            subject,
            direction,
            from,
            to,
        } => commands::create::run(&service, &SubjectId::new(subject), direction, from, to).await,
        Command::Verify { id } => {
            commands::stage::run(&service, commands::stage::Step::Verify, &RequestId::new(id))
                .await
        }
        Command::Download { id } => {
            commands::stage::run(&service, commands::stage::Step::Download, &RequestId::new(id))
                .await
        }
        Command::Import { id } => {
            commands::stage::run(&service, commands::stage::Step::Import, &RequestId::new(id))
                .await
        }
        Command::Status { id, json } => {
            commands::status::run(&service, &RequestId::new(id), json).await
        }
        Command::List { subject, json } => {
            let subject = subject.map(SubjectId::new);
            commands::list::run(&service, subject.as_ref(), json).await
        }
        Command::Audit { id } => commands::audit::run(&service, &RequestId::new(id)).await,
        Command::Resolve { id, job, abandon: _ } => {
            let resolution = match job {
                Some(job_id) => Resolution::Attach(job_id),
                None => Resolution::Abandon("abandoned by operator".to_owned()),
            };
            commands::resolve::run(&service, &RequestId::new(id), resolution).await
        }
        Command::Edit {
            subject,
            key,
            transferred,
            withheld,
        } => {
            commands::edit::run(
                &service,
                &SubjectId::new(subject),
                &NaturalKey::new(key),
                transferred,
                withheld,
            )
            .await
        }
    }
}
