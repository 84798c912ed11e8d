mod config;
mod coordinator_cmd;
mod dequeue_cmd;
mod dry_cmd;
mod enqueue_cmd;
mod retry_cmd;
mod scheduler_cmd;
mod server_cmd;
mod start_cmd;
mod stop_cmd;
mod worker_cmd;

use clap::{Parser, Subcommand};

use dagctl_db::pool;

use config::DagctlConfig;

#[derive(Parser)]
#[command(name = "dagctl", about = "Orchestrates DAGs of shell steps across a fleet of workers")]
struct Cli {
    /// Database URL (overrides DAGCTL_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a dagctl config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/dagctl")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the dagctl database (requires config file or env vars)
    DbInit,
    /// Register a DAG and create a Queued attempt
    Enqueue {
        /// Path to the DAG's YAML definition
        dag: String,
        #[arg(long)]
        run_id: Option<String>,
        #[arg(long)]
        params: Option<String>,
    },
    /// Cancel a Queued attempt and remove its queue entry
    Dequeue {
        /// "<dag_name>:<run_id>"
        #[arg(long)]
        workflow: String,
    },
    /// Register a DAG, enqueue at High priority, and tick the scheduler immediately
    Start {
        /// Path to the DAG's YAML definition
        dag: String,
        #[arg(long)]
        run_id: Option<String>,
        #[arg(long)]
        params: Option<String>,
    },
    /// Send a Cancel directive for a running attempt
    Stop {
        /// Registered DAG name
        dag: String,
        #[arg(long)]
        run_id: String,
    },
    /// Create attempt_number + 1 from a terminal attempt
    Retry {
        /// Registered DAG name
        dag: String,
        #[arg(long)]
        run_id: String,
    },
    /// Validate a DAG and simulate a run with no subprocesses
    Dry {
        /// Path to the DAG's YAML definition
        dag: String,
    },
    /// Run the gRPC coordinator service
    Coordinator,
    /// Run a worker that polls the coordinator for tasks
    Worker {
        #[arg(long)]
        worker_id: Option<String>,
        /// Repeatable; "key=value"
        #[arg(long = "label")]
        labels: Vec<String>,
        #[arg(long)]
        max_concurrent: Option<usize>,
    },
    /// Run the scheduler loop standalone (no coordinator)
    Scheduler,
    /// Run coordinator and scheduler together in one process
    Server,
}

/// Execute the `dagctl init` command: write config file.
fn cmd_init(db_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_string(),
        },
        coordinator: config::CoordinatorSection::default(),
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!();
    println!("Next: run `dagctl db-init` to create and migrate the database.");

    Ok(())
}

/// Execute the `dagctl db-init` command: create database and run migrations.
async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = DagctlConfig::resolve(cli_db_url)?;

    println!("Initializing dagctl database...");

    pool::ensure_database_exists(&resolved.db_config).await?;
    let db_pool = pool::create_pool(&resolved.db_config).await?;
    pool::run_migrations(&db_pool).await?;

    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;

    println!("dagctl db-init complete.");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_url, force } => {
            cmd_init(&db_url, force)?;
        }
        Commands::DbInit => {
            cmd_db_init(cli.database_url.as_deref()).await?;
        }
        Commands::Enqueue { dag, run_id, params } => {
            let resolved = DagctlConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = enqueue_cmd::run(&db_pool, &dag, run_id.as_deref(), params.as_deref()).await;
            db_pool.close().await;
            result?;
        }
        Commands::Dequeue { workflow } => {
            let resolved = DagctlConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = dequeue_cmd::run(&db_pool, &workflow).await;
            db_pool.close().await;
            result?;
        }
        Commands::Start { dag, run_id, params } => {
            let resolved = DagctlConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = start_cmd::run(&db_pool, &dag, run_id.as_deref(), params.as_deref()).await;
            db_pool.close().await;
            result?;
        }
        Commands::Stop { dag, run_id } => {
            let resolved = DagctlConfig::resolve(cli.database_url.as_deref())?;
            let result = stop_cmd::run(&resolved.coordinator_addr, &dag, &run_id).await;
            result?;
        }
        Commands::Retry { dag, run_id } => {
            let resolved = DagctlConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = retry_cmd::run(&db_pool, &dag, &run_id).await;
            db_pool.close().await;
            result?;
        }
        Commands::Dry { dag } => {
            let resolved = DagctlConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = dry_cmd::run(&db_pool, &dag).await;
            db_pool.close().await;
            result?;
        }
        Commands::Coordinator => {
            let resolved = DagctlConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = coordinator_cmd::run(db_pool, &resolved).await;
            result?;
        }
        Commands::Worker {
            worker_id,
            labels,
            max_concurrent,
        } => {
            let resolved = DagctlConfig::resolve(cli.database_url.as_deref())?;
            let result = worker_cmd::run(&resolved, worker_id, labels, max_concurrent).await;
            result?;
        }
        Commands::Scheduler => {
            let resolved = DagctlConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = scheduler_cmd::run(db_pool).await;
            result?;
        }
        Commands::Server => {
            let resolved = DagctlConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = server_cmd::run(db_pool, &resolved).await;
            result?;
        }
    }

    Ok(())
}
