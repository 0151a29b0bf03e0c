use crate::progress::BarProgress;
use crate::{CatalogCommands, InitArgs, SyncArgs};
use anyhow::{Context, Result};
use asynchy::scheduler::{self, summarize, LogProgress, ProgressSink, RunOptions};
use asynchy::{expand_home, AsynchyError, Config, Item, RsyncTransfer, SqliteCatalog};
use chrono::{DateTime, Utc};
use console::style;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;

pub async fn handle_init(config_path: &Path, args: InitArgs) -> Result<ExitCode> {
    let mut config = Config::new(args.host, args.user, expand_home(&args.keypath), expand_home(&args.db));
    config.port = args.port;
    if let Some(threads) = args.threads {
        config.threads = threads;
    }

    config.save(config_path, args.overwrite).await?;
    println!(
        "{} Wrote configuration to {}",
        style("✓").green(),
        style(config_path.display()).cyan()
    );
    Ok(ExitCode::SUCCESS)
}

/// Apply command line overrides on top of the stored configuration.
fn apply_overrides(config: &mut Config, args: &SyncArgs) {
    if let Some(threads) = args.threads {
        config.threads = threads;
    }
    if let Some(retry) = args.retry {
        config.retry = retry;
    }
    config.partial |= args.partial;
    config.compress |= args.compress;
}

fn sync_limit(args: &SyncArgs) -> Option<usize> {
    (args.limit > 0).then_some(args.limit)
}

pub async fn handle_sync(config_path: &Path, args: SyncArgs) -> Result<ExitCode> {
    let mut config = Config::load(config_path).await?;
    apply_overrides(&mut config, &args);
    config.validate().map_err(AsynchyError::from)?;

    let catalog = Arc::new(
        SqliteCatalog::open(&config.db).with_context(|| format!("opening catalog {}", config.db.display()))?,
    );
    let transfer = RsyncTransfer::new(config.transfer_config())?;

    let options = RunOptions {
        order: args.order,
        limit: sync_limit(&args),
        ..RunOptions::new(&args.dest, args.src_prefix.clone())
    };

    let mut sink: Box<dyn ProgressSink> = if console::Term::stderr().is_term() {
        Box::new(BarProgress::new())
    } else {
        Box::new(LogProgress::new())
    };

    let outcomes = scheduler::run(&transfer, catalog, &options, sink.as_mut()).await?;
    let summary = summarize(&outcomes);

    if let Some(path) = &args.metrics_file {
        let metrics = transfer.pool().metrics().export()?;
        tokio::fs::write(path, metrics)
            .await
            .with_context(|| format!("writing metrics to {}", path.display()))?;
        info!("Wrote metrics to {}", path.display());
    }

    let marker = if summary.is_clean() {
        style("✓").green()
    } else {
        style("✗").red()
    };
    println!(
        "{} {} transferred, {} failed, {} cancelled ({} bytes)",
        marker, summary.succeeded, summary.failed, summary.cancelled, summary.bytes
    );

    Ok(if summary.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn catalog_path(config_path: &Path, db: Option<PathBuf>) -> Result<PathBuf> {
    match db {
        Some(db) => Ok(expand_home(&db)),
        None => Ok(Config::load(config_path).await?.db),
    }
}

fn parse_modified(value: Option<&str>) -> Result<DateTime<Utc>> {
    match value {
        Some(value) => Ok(DateTime::parse_from_rfc3339(value)
            .with_context(|| format!("invalid modification time '{}'", value))?
            .with_timezone(&Utc)),
        None => Ok(Utc::now()),
    }
}

pub async fn handle_catalog(config_path: &Path, db: Option<PathBuf>, command: CatalogCommands) -> Result<ExitCode> {
    let db = catalog_path(config_path, db).await?;
    let catalog = SqliteCatalog::open(&db).with_context(|| format!("opening catalog {}", db.display()))?;

    match command {
        CatalogCommands::Init => {
            // Opening the catalog already created the schema.
            println!("{} Catalog ready at {}", style("✓").green(), style(db.display()).cyan());
        }
        CatalogCommands::Add { key, size, modified } => {
            let item = Item::new(key, size, parse_modified(modified.as_deref())?);
            catalog.upsert_item(&item)?;
            println!("{} Added {}", style("✓").green(), style(&item.key).cyan());
        }
        CatalogCommands::Pending { order, limit, json } => {
            let (items, total) = scheduler::get_items(&catalog, order, limit)?;

            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "items": items,
                        "total_size": total,
                    }))?
                );
            } else if items.is_empty() {
                println!("{} Nothing left to transfer", style("ℹ").blue());
            } else {
                println!("{:<40} {:>16}", "Item", "Expected bytes");
                println!("{}", "-".repeat(57));
                for item in &items {
                    println!("{:<40} {:>16}", item.key, item.expected_size);
                }
                println!("{:<40} {:>16}", style("Total").bold(), total);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use asynchy::{Catalog, SortOrder};
    use tempfile::TempDir;

    fn sync_args() -> SyncArgs {
        SyncArgs {
            dest: PathBuf::from("/srv/epns"),
            src_prefix: "/data".to_string(),
            order: SortOrder::Asc,
            limit: 50,
            threads: Some(3),
            retry: None,
            partial: true,
            compress: false,
            metrics_file: None,
        }
    }

    #[test]
    fn test_overrides_only_touch_given_options() {
        let mut config = Config::new("sftp.test.com", "xxxxx", "/path/to/key", "/tmp/files.db");
        config.retry = 4;
        config.compress = true;

        apply_overrides(&mut config, &sync_args());
        assert_eq!(config.threads, 3);
        assert_eq!(config.retry, 4);
        assert!(config.partial);
        assert!(config.compress);
    }

    #[test]
    fn test_zero_limit_means_everything() {
        assert_eq!(sync_limit(&sync_args()), Some(50));
        let args = SyncArgs { limit: 0, ..sync_args() };
        assert_eq!(sync_limit(&args), None);
    }

    #[tokio::test]
    async fn test_init_expands_home_in_paths() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("asynchy.toml");
        let args = InitArgs {
            host: "sftp.test.com".to_string(),
            port: 22,
            user: "xxxxx".to_string(),
            keypath: PathBuf::from("~/.ssh/id_rsa"),
            db: PathBuf::from("files.db"),
            threads: None,
            overwrite: false,
        };
        handle_init(&config_path, args).await.unwrap();

        let config = Config::load(&config_path).await.unwrap();
        assert_eq!(config.keypath, expand_home(Path::new("~/.ssh/id_rsa")));
        assert!(!config.keypath.starts_with("~"));
        assert_eq!(config.db, PathBuf::from("files.db"));
    }

    #[test]
    fn test_parse_modified() {
        let parsed = parse_modified(Some("2019-02-01T10:00:00+10:00")).unwrap();
        assert_eq!(parsed.to_rfc3339(), "2019-02-01T00:00:00+00:00");
        assert!(parse_modified(Some("yesterday")).is_err());
    }

    #[tokio::test]
    async fn test_catalog_add_with_explicit_db() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("files.db");
        let config_path = dir.path().join("missing.toml");

        let add = CatalogCommands::Add {
            key: "mx/12345".to_string(),
            size: 2048,
            modified: None,
        };
        handle_catalog(&config_path, Some(db.clone()), add).await.unwrap();

        let catalog = SqliteCatalog::open(&db).unwrap();
        let pending = catalog.list_incomplete(SortOrder::Asc, None).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].expected_size, 2048);
    }
}
