use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use deadpool_postgres::Pool;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use nlsql::config::AppConfig;
use nlsql::db::{create_pool, ExecutionResult, PgStore, SqlStore};
use nlsql::export::to_delimited_text;
use nlsql::history::{HistoryStore, MemoryHistoryStore, PgHistoryStore, QueryRecord, UserId};
use nlsql::llm::Synthesizer;
use nlsql::service::QueryService;

/// Ask questions about a PostgreSQL database in plain language
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Config file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Identity that owns recorded queries (defaults to $USER)
    #[arg(long, global = true)]
    user: Option<String>,

    /// Keep query history in memory for this run only
    #[arg(long, global = true)]
    memory: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the introspected schema
    Schema,
    /// Turn a question into SQL, run it and record it
    Ask { question: Vec<String> },
    /// Execute a recorded query again
    Rerun { id: i64 },
    /// Write a recorded query's current result as CSV
    Export {
        id: i64,
        /// Output file (defaults to query_result_<id>.csv)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Rate a recorded query
    Feedback {
        id: i64,
        #[arg(long)]
        rating: i64,
        #[arg(long)]
        helpful: bool,
        #[arg(long)]
        comments: Option<String>,
    },
    /// List recorded queries, newest first
    History,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = AppConfig::load(cli.config.as_deref())?;

    if config.database.password.is_empty() && std::io::stdin().is_terminal() {
        let prompt = format!("Password for {}: ", config.database.display_string());
        config.database.password = rpassword::read_password_from_tty(Some(&prompt))?;
    }

    let pool = create_pool(&config.database)?;
    let store = Arc::new(PgStore::new(
        pool.clone(),
        config.database.introspect_schema.clone(),
        config.executor.read_only,
    ));

    let user = UserId::new(
        cli.user
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "anonymous".to_string()),
    );
    let memory = cli.memory;

    match cli.command {
        // schema browsing needs no generation backend or history
        Command::Schema => {
            let schema = store
                .describe_schema()
                .await
                .context("schema introspection failed")?;
            print!("{}", schema.render());
        }
        Command::Ask { question } => {
            let service = open_service(&config, pool, store, memory).await?;
            let record = service.submit_query(&user, &question.join(" ")).await?;
            print_record(&record);
        }
        Command::Rerun { id } => {
            let service = open_service(&config, pool, store, memory).await?;
            let record = service.rerun(&user, id).await?;
            print_record(&record);
        }
        Command::Export { id, output } => {
            let service = open_service(&config, pool, store, memory).await?;
            let export = service.export(&user, id).await?;
            let path = output.unwrap_or_else(|| PathBuf::from(&export.filename));
            std::fs::write(&path, export.content)
                .with_context(|| format!("writing {}", path.display()))?;
            println!("Wrote {}", path.display());
        }
        Command::Feedback {
            id,
            rating,
            helpful,
            comments,
        } => {
            let service = open_service(&config, pool, store, memory).await?;
            let feedback = service
                .submit_feedback(&user, id, rating, helpful, comments)
                .await?;
            println!(
                "Feedback saved for query {}: {}/5{}",
                feedback.query_id,
                feedback.rating.value(),
                if feedback.is_helpful { ", helpful" } else { "" }
            );
        }
        Command::History => {
            let service = open_service(&config, pool, store, memory).await?;
            for entry in service.history(&user).await? {
                let q = &entry.query;
                let status = match &q.result {
                    Some(r) if r.is_success() => format!("{} rows", r.row_count()),
                    Some(_) => "failed".to_string(),
                    None => "not run".to_string(),
                };
                let rating = entry
                    .feedback
                    .map(|f| format!("  rated {}/5", f.rating.value()))
                    .unwrap_or_default();
                println!(
                    "#{:<5} {}  {}  [{}]{}",
                    q.id,
                    q.created_at.format("%Y-%m-%d %H:%M"),
                    q.natural_language,
                    status,
                    rating
                );
            }
        }
    }

    Ok(())
}

async fn open_service(
    config: &AppConfig,
    pool: Pool,
    store: Arc<PgStore>,
    memory: bool,
) -> Result<QueryService> {
    let history: Arc<dyn HistoryStore> = if memory {
        Arc::new(MemoryHistoryStore::new())
    } else {
        let pg = PgHistoryStore::new(pool, &config.database.history_schema);
        pg.bootstrap().await.context("preparing history tables")?;
        Arc::new(pg)
    };

    let synthesizer = Synthesizer::from_config(&config.generation)?;
    Ok(QueryService::new(store, synthesizer, history))
}

fn print_record(record: &QueryRecord) {
    println!("Query #{}", record.id);
    println!("{}", record.sql_query);
    println!();
    match &record.result {
        Some(result @ ExecutionResult::Success { .. }) => {
            print!("{}", to_delimited_text(result));
            println!("({} rows)", result.row_count());
        }
        Some(ExecutionResult::Failure { message }) => println!("Error: {}", message),
        None => {}
    }
}
