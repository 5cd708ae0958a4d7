use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use shelfmark_catalog::identifiers::Isbn;
use shelfmark_catalog::{
    BookResolver, CacheState, CatalogError, GoogleBooksAdapter, Normalizer, OpenLibraryAdapter, SearchOrchestrator,
    SearchRequest, SearchStrategy, evaluate,
};
use shelfmark_core::{
    AppConfig, CacheStore, CachedBook, CuratedFields, Database, ExitCode, IdentityKeys, RecommendationCacheRepository,
    ShelfError,
};

// ─── CLI Definition ─────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "shelfmark",
    about = "Book identity resolution with a local multi-catalog cache",
    version,
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output in JSON format (for scripts).
    /// Also enabled by setting SHELFMARK_JSON=1.
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Search the local cache, then the catalogs.
    Search {
        query: String,
        #[arg(long)]
        author: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, value_enum, default_value = "hybrid")]
        strategy: StrategyArg,
        /// Cache the hit at this 1-based rank.
        #[arg(long, value_name = "RANK")]
        save: Option<usize>,
    },

    /// Resolve a book by ISBN or Open Library work key and cache it.
    Add {
        identifier: String,
        /// Refetch even if cached, overwriting curated fields.
        #[arg(long)]
        force: bool,
    },

    /// Show a cached book by id, ISBN or work key. Never hits the network.
    Show { identifier: String },

    /// Refresh stale cache records from the catalogs.
    Refresh {
        #[arg(long, default_value = "50")]
        limit: usize,
    },

    /// Edit curated fields of a cached book.
    Curate {
        id: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long = "category", action = clap::ArgAction::Append)]
        categories: Vec<String>,
        #[arg(long)]
        publisher: Option<String>,
        #[arg(long)]
        year: Option<String>,
    },

    /// Recommendation cache.
    Recs {
        #[command(subcommand)]
        action: RecsAction,
    },

    /// Config management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show version information.
    Version,
}

#[derive(Clone, Copy, ValueEnum)]
enum StrategyArg {
    Hybrid,
    FanOut,
}

impl From<StrategyArg> for SearchStrategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Hybrid => SearchStrategy::Hybrid,
            StrategyArg::FanOut => SearchStrategy::FanOut,
        }
    }
}

#[derive(Subcommand)]
enum RecsAction {
    /// Show a user's cached recommendations and whether they are still valid.
    Status { user: String },
    /// Record one qualifying activity for a user.
    Bump { user: String },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective config (file plus environment overrides).
    Show,
    /// Print the config file path.
    Path,
}

// ─── Main ────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let json_output = cli.json || std::env::var("SHELFMARK_JSON").as_deref() == Ok("1");
    let start = Instant::now();

    if let Err(err) = run(cli.command, json_output, start).await {
        let code = exit_code(&err);
        if json_output {
            let envelope = serde_json::json!({
                "status": "error",
                "error": error_kind(code),
                "message": format!("{err:#}"),
                "meta": { "duration_ms": start.elapsed().as_millis() }
            });
            println!("{envelope:#}");
        } else {
            eprintln!("Error: {err:#}");
        }
        std::process::exit(code as i32);
    }
}

/// `SHELFMARK_LOG` takes `EnvFilter` directives; default `warn`. Logs go to stderr
/// so `--json` output stays parseable.
fn init_tracing() {
    let filter = EnvFilter::try_from_env("SHELFMARK_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(command: Commands, json_output: bool, start: Instant) -> Result<()> {
    let config = AppConfig::load()?;

    match command {
        Commands::Search {
            query,
            author,
            limit,
            strategy,
            save,
        } => {
            let db = Database::open(&config.database_path())?;
            let (primary, secondary) = adapters(&config)?;
            let orchestrator = SearchOrchestrator::new(
                store(&db, &config),
                primary.clone(),
                secondary.clone(),
                Normalizer::from_config(&config),
                &config,
            )
            .with_strategy(strategy.into());

            let mut request = SearchRequest::new(&query, limit.unwrap_or(config.search.default_limit));
            if let Some(author) = author {
                request = request.with_author(author);
            }
            let outcome = orchestrator.search(&request).await?;

            let saved = match save {
                Some(rank) => {
                    let Some(hit) = rank.checked_sub(1).and_then(|i| outcome.hits.get(i)) else {
                        bail!(ShelfError::ValidationError(format!(
                            "--save {rank} is outside the {} results",
                            outcome.hits.len()
                        )));
                    };
                    let resolver = BookResolver::new(
                        store(&db, &config),
                        primary,
                        secondary,
                        Normalizer::from_config(&config),
                        &config,
                    );
                    Some(resolver.persist(&hit.book).await?)
                }
                None => None,
            };

            if json_output {
                print_json(&serde_json::json!({
                    "status": "ok",
                    "data": { "items": outcome.hits, "total": outcome.hits.len(), "query": query },
                    "meta": {
                        "duration_ms": start.elapsed().as_millis(),
                        "consulted": outcome.consulted,
                        "failures": outcome.failures,
                        "degraded": outcome.degraded,
                        "saved": saved.as_ref().map(|r| r.id),
                    }
                }))?;
            } else if outcome.hits.is_empty() {
                println!("No results for: {query}");
            } else {
                if outcome.degraded {
                    eprintln!("Catalogs unavailable; showing cached results only.");
                }
                println!("Found {} results:", outcome.hits.len());
                for hit in &outcome.hits {
                    let marker = match (hit.id, hit.stale) {
                        (Some(_), true) => "~",
                        (Some(_), false) => "*",
                        (None, _) => " ",
                    };
                    println!(
                        "{marker} {score:>7.1}  {title:<45}  {authors}",
                        score = hit.score,
                        title = hit.book.title,
                        authors = hit.book.authors.join(", "),
                    );
                }
                if let Some(record) = &saved {
                    println!("Saved {}  {}", record.id, record.book.title);
                }
            }
        }

        Commands::Add { identifier, force } => {
            let keys = parse_identity(&identifier)?;
            let db = Database::open(&config.database_path())?;
            let resolver = resolver(&db, &config)?;
            let resolved = resolver.resolve(&keys, force).await?;

            if json_output {
                print_json(&serde_json::json!({
                    "status": "ok",
                    "data": resolved,
                    "meta": { "duration_ms": start.elapsed().as_millis() }
                }))?;
            } else {
                let book = &resolved.record.book;
                println!("{}  {} ({:?})", resolved.record.id, book.title, resolved.from);
                if resolved.stale {
                    eprintln!("Catalogs unavailable; cached copy may be out of date.");
                }
            }
        }

        Commands::Show { identifier } => {
            let db = Database::open(&config.database_path())?;
            let store = store(&db, &config);
            let found = match Uuid::parse_str(&identifier) {
                Ok(id) => store.find_by_id(&id)?,
                Err(_) => store.find_by_identity(&parse_identity(&identifier)?)?,
            };
            let Some(cached) = found else {
                return Err(ShelfError::BookNotFound(identifier).into());
            };
            print_cached(&cached, json_output, start)?;
        }

        Commands::Refresh { limit } => {
            let db = Database::open(&config.database_path())?;
            let report = resolver(&db, &config)?.refresh_stale(limit).await?;

            if json_output {
                print_json(&serde_json::json!({
                    "status": "ok",
                    "data": report,
                    "meta": { "duration_ms": start.elapsed().as_millis() }
                }))?;
            } else {
                println!(
                    "Refreshed {}, unchanged {}, failed {}.",
                    report.refreshed, report.unchanged, report.failed
                );
            }
        }

        Commands::Curate {
            id,
            description,
            categories,
            publisher,
            year,
        } => {
            let id = Uuid::parse_str(&id).with_context(|| format!("invalid record id: {id}"))?;
            let fields = CuratedFields {
                description,
                categories: (!categories.is_empty()).then_some(categories),
                publisher,
                published_year: year,
            };
            let db = Database::open(&config.database_path())?;
            let store = store(&db, &config);
            let record = store.apply_curation(&id, &fields)?;
            let cached = CachedBook {
                stale: store.is_stale(&record),
                record,
            };
            print_cached(&cached, json_output, start)?;
        }

        Commands::Recs { action } => {
            let db = Database::open(&config.database_path())?;
            let repo = db.recommendations();
            match action {
                RecsAction::Status { user } => {
                    let entry = repo.find(&user)?;
                    let state = evaluate(&config.recommendations, entry.as_ref(), chrono::Utc::now());
                    if json_output {
                        print_json(&serde_json::json!({
                            "status": "ok",
                            "data": { "user": user, "state": state, "entry": entry },
                            "meta": { "duration_ms": start.elapsed().as_millis() }
                        }))?;
                    } else {
                        match entry {
                            None => println!("No cached recommendations for {user}."),
                            Some(e) => {
                                let state = match state {
                                    CacheState::Valid => "valid".to_string(),
                                    CacheState::Expired(trigger) => format!("expired ({trigger:?})"),
                                };
                                println!(
                                    "{user}: {} recommendations, {state}, expires {}, activity {}",
                                    e.recommendations.len(),
                                    e.expires_at.format("%Y-%m-%d %H:%M"),
                                    e.activity_counter
                                );
                                for rec in &e.recommendations {
                                    println!("  {} by {}: {}", rec.title, rec.author, rec.reason);
                                }
                            }
                        }
                    }
                }
                RecsAction::Bump { user } => {
                    let Some(counter) = repo.increment_activity(&user)? else {
                        bail!(ShelfError::BookNotFound(format!("recommendation cache for {user}")));
                    };
                    if json_output {
                        print_json(&serde_json::json!({
                            "status": "ok",
                            "data": { "user": user, "activity_counter": counter },
                            "meta": { "duration_ms": start.elapsed().as_millis() }
                        }))?;
                    } else {
                        println!("{user}: activity {counter}");
                    }
                }
            }
        }

        Commands::Config { action } => match action {
            ConfigAction::Show => {
                if json_output {
                    print_json(&serde_json::json!({
                        "status": "ok",
                        "data": config,
                        "meta": { "duration_ms": start.elapsed().as_millis() }
                    }))?;
                } else {
                    print!("{}", toml::to_string_pretty(&config)?);
                }
            }
            ConfigAction::Path => {
                let path = AppConfig::config_path();
                if json_output {
                    print_json(&serde_json::json!({
                        "status": "ok",
                        "data": { "path": path, "exists": path.exists() },
                        "meta": { "duration_ms": start.elapsed().as_millis() }
                    }))?;
                } else {
                    println!("{}", path.display());
                }
            }
        },

        Commands::Version => {
            let version = env!("CARGO_PKG_VERSION");
            if json_output {
                print_json(&serde_json::json!({
                    "status": "ok",
                    "data": { "version": version },
                    "meta": { "duration_ms": start.elapsed().as_millis() }
                }))?;
            } else {
                println!("shelfmark v{version}");
            }
        }
    }

    Ok(())
}

// ─── Helpers ────────────────────────────────────────────────────────────────

fn print_json(val: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(val)?);
    Ok(())
}

fn print_cached(cached: &CachedBook, json_output: bool, start: Instant) -> Result<()> {
    if json_output {
        return print_json(&serde_json::json!({
            "status": "ok",
            "data": cached,
            "meta": { "duration_ms": start.elapsed().as_millis() }
        }));
    }
    println!("{}", serde_json::to_string_pretty(&cached.record)?);
    if cached.stale {
        eprintln!("(stale: last updated {})", cached.record.last_updated.format("%Y-%m-%d"));
    }
    Ok(())
}

fn store(db: &Database, config: &AppConfig) -> CacheStore {
    CacheStore::new(Arc::new(db.books()), &config.cache)
}

fn adapters(config: &AppConfig) -> Result<(Arc<OpenLibraryAdapter>, Arc<GoogleBooksAdapter>)> {
    Ok((
        Arc::new(OpenLibraryAdapter::from_config(&config.catalogs)?),
        Arc::new(GoogleBooksAdapter::from_config(&config.catalogs)?),
    ))
}

fn resolver(db: &Database, config: &AppConfig) -> Result<BookResolver> {
    let (primary, secondary) = adapters(config)?;
    Ok(BookResolver::new(
        store(db, config),
        primary,
        secondary,
        Normalizer::from_config(config),
        config,
    ))
}

/// An ISBN (either form, hyphens allowed) or an Open Library work key.
fn parse_identity(input: &str) -> Result<IdentityKeys> {
    let trimmed = input.trim();
    if let Ok(isbn) = Isbn::parse(trimmed) {
        return Ok(IdentityKeys {
            isbn13: Some(isbn.isbn13),
            isbn10: isbn.isbn10,
            ..Default::default()
        });
    }
    let key = trimmed.trim_start_matches("/works/");
    if key.starts_with("OL") && key.ends_with('W') {
        return Ok(IdentityKeys::catalog_key(key));
    }
    Err(CatalogError::InvalidIsbn(input.to_string()).into())
}

fn exit_code(err: &anyhow::Error) -> ExitCode {
    if let Some(err) = err.downcast_ref::<CatalogError>() {
        return match err {
            CatalogError::NotFound { .. } => ExitCode::NotFound,
            CatalogError::InvalidIsbn(_) => ExitCode::InvalidArgs,
            CatalogError::Store(inner) => shelf_exit_code(inner),
            e if e.is_upstream() => ExitCode::NetworkError,
            CatalogError::AllSourcesUnavailable { .. } | CatalogError::Http(_) => ExitCode::NetworkError,
            _ => ExitCode::GeneralError,
        };
    }
    if let Some(err) = err.downcast_ref::<ShelfError>() {
        return shelf_exit_code(err);
    }
    if err.downcast_ref::<uuid::Error>().is_some() {
        return ExitCode::InvalidArgs;
    }
    ExitCode::GeneralError
}

fn shelf_exit_code(err: &ShelfError) -> ExitCode {
    match err {
        ShelfError::BookNotFound(_) => ExitCode::NotFound,
        ShelfError::ValidationError(_) | ShelfError::ConfigError(_) => ExitCode::InvalidArgs,
        ShelfError::IdentityConflict(_) => ExitCode::Conflict,
        _ => ExitCode::GeneralError,
    }
}

fn error_kind(code: ExitCode) -> &'static str {
    match code {
        ExitCode::Success => "ok",
        ExitCode::NotFound => "not_found",
        ExitCode::InvalidArgs => "invalid_args",
        ExitCode::NetworkError => "network",
        ExitCode::Conflict => "conflict",
        ExitCode::GeneralError => "error",
    }
}
