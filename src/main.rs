//! mdr: operator CLI for the metadata registry.
//!
//! Reads config from flags or env vars (a `.env` file is loaded first):
//!   MDR_DATABASE_URL    Postgres connection string (required)
//!   MDR_MAX_CONNECTIONS pool size (default: 10)
//!   MDR_BUNDLE_DIR      directory for export bundles (default: ./bundles)
//!   MDR_ACTOR           actor recorded on writes (default: $USER, else "operator")
//!   MDR_LANGUAGES       comma-separated designation languages (default: en)
//!
//! Import and export jobs run inside this process, so a command that starts
//! one stays up until the job leaves PROCESSING. `--wait` prints the final
//! record instead of the job id.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use mdr_core::content::{Content, ElementBody};
use mdr_core::export::ExportBundle;
use mdr_core::staging::StagedElementPayload;
use mdr_core::types::{ElementType, JobStatus, RegistrySettings, Status};
use mdr_core::{Principal, RegistryService, RegistryServiceImpl, Urn};
use mdr_postgres::{bootstrap_schema, FsBundleStore, PgStores};

const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Parser)]
#[command(name = "mdr")]
#[command(version = "0.1.0")]
#[command(about = "Metadata registry: namespaces, versioned elements, staged imports and exports")]
struct Cli {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Config {
    /// Postgres connection string
    #[arg(long, env = "MDR_DATABASE_URL", hide_env_values = true)]
    database_url: String,

    #[arg(long, env = "MDR_MAX_CONNECTIONS", default_value_t = 10)]
    max_connections: u32,

    /// Where export bundles are written
    #[arg(long, env = "MDR_BUNDLE_DIR", default_value = "./bundles")]
    bundle_dir: PathBuf,

    /// Actor id recorded on every write
    #[arg(long, env = "MDR_ACTOR")]
    actor: Option<String>,

    /// Designation language preference, most preferred first
    #[arg(long, env = "MDR_LANGUAGES", default_value = "en", value_delimiter = ',')]
    languages: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the registry schema if missing
    Migrate,

    /// Namespace administration
    Namespace {
        #[command(subcommand)]
        command: NamespaceCommand,
    },

    /// Show an element: identity, content and preferred designation
    Resolve {
        urn: String,

        /// Resolve the newest version instead of the exact one
        #[arg(long)]
        latest: bool,
    },

    /// Release a DRAFT or STAGED element
    Release { urn: String },

    /// Delete a DRAFT/STAGED element, or outdate a RELEASED one
    Delete { urn: String },

    /// List the top-level elements of a namespace
    Roots {
        namespace: String,

        /// Element types to include (default: every non-namespace type)
        #[arg(long, value_delimiter = ',', value_parser = ElementType::parse)]
        types: Vec<ElementType>,

        /// Include elements that are members of another element
        #[arg(long)]
        all: bool,
    },

    /// Stage a JSON file of elements (array or export bundle) into a namespace
    Import {
        file: PathBuf,

        #[arg(long)]
        namespace: String,

        #[arg(long)]
        wait: bool,
    },

    /// Continue converting an interrupted import job
    ImportResume { job: Uuid },

    ImportStatus { job: Uuid },

    /// Export elements and everything they reference into a bundle
    Export {
        #[arg(required = true)]
        urns: Vec<String>,

        /// Include elements that are not RELEASED
        #[arg(long)]
        full: bool,

        #[arg(long)]
        wait: bool,
    },

    ExportStatus { job: Uuid },
}

#[derive(Subcommand)]
enum NamespaceCommand {
    /// Create a namespace; its identifier is allocated by the registry
    Create {
        designation: String,

        #[arg(long, default_value = "")]
        definition: String,

        #[arg(long, default_value = "en")]
        language: String,

        #[arg(long, default_value = "DRAFT", value_parser = Status::parse)]
        status: Status,

        /// Hide the namespace from default listings
        #[arg(long)]
        hidden: bool,
    },
}

/// Accepted import file shapes.
#[derive(Deserialize)]
#[serde(untagged)]
enum ImportFile {
    Bundle(ExportBundle),
    Elements(Vec<StagedElementPayload>),
}

impl ImportFile {
    fn into_elements(self) -> Vec<StagedElementPayload> {
        match self {
            Self::Bundle(bundle) => bundle.elements,
            Self::Elements(elements) => elements,
        }
    }
}

// =============================================================================
// MAIN
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,mdr_core=debug".into()),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = e
                .downcast_ref::<mdr_core::MdrError>()
                .map_or("INTERNAL", |e| e.code());
            println!("{}", json!({ "error": { "code": code, "message": format!("{e:#}") } }));
            ExitCode::FAILURE
        }
    }
}

async fn connect(config: &Config) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;
    tracing::info!("Connected to database");
    Ok(pool)
}

fn principal(config: &Config) -> Principal {
    let actor = config
        .actor
        .clone()
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "operator".into());
    Principal::admin(actor)
}

fn print<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = cli.config;
    let pool = connect(&config).await?;
    if let Commands::Migrate = cli.command {
        bootstrap_schema(&pool).await?;
        return print(&json!({ "migrated": true }));
    }

    let service = PgStores::new(pool)
        .service(Arc::new(FsBundleStore::new(&config.bundle_dir)))
        .with_settings(RegistrySettings {
            default_languages: config.languages.clone(),
        });
    let p = principal(&config);

    match cli.command {
        Commands::Migrate => Ok(()),
        Commands::Namespace {
            command:
                NamespaceCommand::Create {
                    designation,
                    definition,
                    language,
                    status,
                    hidden,
                },
        } => {
            let content = Content::new(ElementBody::Namespace { hidden })
                .with_definition(language, designation, definition);
            print(&service.create_namespace(&p, content, status).await?)
        }
        Commands::Resolve { urn, latest } => {
            let mut urn = Urn::parse(&urn)?;
            if latest {
                urn = service.resolve_latest(&p, &urn).await?.urn();
            }
            print(&service.describe(&p, &urn).await?)
        }
        Commands::Release { urn } => print(&service.release_element(&p, &Urn::parse(&urn)?).await?),
        Commands::Delete { urn } => print(&service.delete_element(&p, &Urn::parse(&urn)?).await?),
        Commands::Roots {
            namespace,
            types,
            all,
        } => {
            let types = if types.is_empty() {
                ElementType::all_elements()
            } else {
                types
            };
            let roots = service
                .visible_roots(&p, &Urn::parse(&namespace)?, &types, !all)
                .await?;
            print(&roots)
        }
        Commands::Import {
            file,
            namespace,
            wait,
        } => {
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let elements = serde_json::from_slice::<ImportFile>(&bytes)
                .with_context(|| format!("{} is neither a bundle nor an element array", file.display()))?
                .into_elements();
            let job = service
                .submit_import(&p, &Urn::parse(&namespace)?, elements)
                .await?;
            if !wait {
                print(&json!({ "jobId": job }))?;
            }
            let report = wait_import(&service, &p, job).await?;
            if wait {
                print(&report)?;
            }
            Ok(())
        }
        Commands::ImportResume { job } => print(&service.convert_all(&p, job).await?),
        Commands::ImportStatus { job } => print(&service.import_status(&p, job).await?),
        Commands::Export { urns, full, wait } => {
            let roots = urns
                .iter()
                .map(|u| Urn::parse(u))
                .collect::<Result<Vec<_>, _>>()?;
            let job = service.submit_export(&p, &roots, full).await?;
            if !wait {
                print(&json!({ "jobId": job }))?;
            }
            let finished = wait_export(&service, &p, job).await?;
            if wait {
                print(&finished)?;
            }
            Ok(())
        }
        Commands::ExportStatus { job } => print(&service.export_status(&p, job).await?),
    }
}

async fn wait_import(
    service: &RegistryServiceImpl,
    p: &Principal,
    job: Uuid,
) -> anyhow::Result<mdr_core::staging::ImportReport> {
    loop {
        let report = service.import_status(p, job).await?;
        if report.job.status != JobStatus::Processing {
            return Ok(report);
        }
        tracing::debug!(job_id = %job, converted = report.converted, pending = report.pending, "waiting for import");
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

async fn wait_export(
    service: &RegistryServiceImpl,
    p: &Principal,
    job: Uuid,
) -> anyhow::Result<mdr_core::export::ExportJob> {
    loop {
        let record = service.export_status(p, job).await?;
        if record.status != JobStatus::Processing {
            return Ok(record);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
