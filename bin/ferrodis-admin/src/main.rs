//! Ferrodis Admin - Offline database maintenance
//!
//! Opens one logical database directly and runs a maintenance command
//! against it. The server must not have the database open at the same time.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use ferrodis_common::{DataType, OptionType, StorageOptions};
use ferrodis_storage::{CompactionReport, Db, Engine};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "ferrodis-admin")]
#[command(about = "Ferrodis database maintenance tool")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/ferrodis/ferrodis.toml")]
    config: String,

    /// Directory holding the logical databases
    #[arg(long)]
    data_dir: Option<String>,

    /// Logical database index
    #[arg(long, default_value = "0")]
    db: usize,

    /// Commit writes without waiting for fsync
    #[arg(long)]
    no_sync: bool,

    /// Page cache size in bytes
    #[arg(long)]
    block_cache_size: Option<usize>,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the engine INFO block
    Info {
        /// Prefix of every metric name
        #[arg(long, default_value = "")]
        prefix: String,
    },
    /// Print one engine property
    Property {
        /// Property name, e.g. rocksdb.estimate-num-keys
        name: String,
    },
    /// Count keys per type
    Keys,
    /// List keys matching a pattern
    Scan {
        #[arg(long, default_value = "*")]
        pattern: String,
        /// Keys examined per page
        #[arg(long, default_value = "100")]
        count: usize,
    },
    /// Print every logical key with its version, TTL and size
    Dump,
    /// Compact the database, a type or a single key
    Compact {
        /// Restrict to the families of one type
        #[arg(long = "type")]
        data_type: Option<DataType>,
        /// Compact only this key (requires --type)
        #[arg(long)]
        key: Option<String>,
        /// First logical key of the range
        #[arg(long)]
        begin: Option<String>,
        /// Last logical key of the range
        #[arg(long)]
        end: Option<String>,
    },
    /// Write a checkpoint of the database
    Checkpoint {
        /// Target directory (must not already hold a checkpoint)
        dir: PathBuf,
    },
    /// Replace the database contents with a checkpoint
    Restore {
        /// Checkpoint directory
        dir: PathBuf,
    },
    /// Apply runtime options, given as name=value pairs
    SetOption {
        /// Apply to every column family instead of the database
        #[arg(long)]
        cf: bool,
        #[arg(required = true)]
        options: Vec<String>,
    },
}

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct Config {
    #[serde(default)]
    admin: AdminConfig,
    #[serde(default)]
    storage: StorageOptions,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
struct AdminConfig {
    #[serde(default = "default_data_dir")]
    data_dir: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct LoggingConfig {
    #[serde(default = "default_log_level")]
    level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_data_dir() -> String {
    "./ferrodis-data".to_string()
}

fn default_log_level() -> String {
    "warn".to_string()
}

fn load_config(path: &str) -> Result<Config> {
    if !Path::new(path).exists() {
        return Ok(Config::default());
    }
    let config_str = std::fs::read_to_string(path)?;
    toml::from_str(&config_str).with_context(|| format!("invalid config file {path}"))
}

fn parse_options(pairs: &[String]) -> Result<HashMap<String, String>> {
    pairs
        .iter()
        .map(|pair| match pair.split_once('=') {
            Some((name, value)) => Ok((name.trim().to_string(), value.trim().to_string())),
            None => bail!("expected name=value, got {pair:?}"),
        })
        .collect()
}

fn print_report(report: &CompactionReport) {
    for cf in &report.column_families {
        println!("{:<16} examined {:>10}  dropped {:>10}", cf.cf.name(), cf.examined, cf.dropped);
    }
    println!("total: examined {} dropped {}", report.examined(), report.dropped());
}

fn compact(
    engine: &Engine,
    data_type: Option<DataType>,
    key: Option<&str>,
    begin: Option<&str>,
    end: Option<&str>,
) -> Result<CompactionReport> {
    let begin = begin.map(str::as_bytes);
    let end = end.map(str::as_bytes);
    let report = match (data_type, key) {
        (Some(data_type), Some(key)) => engine.compact_key(data_type, key.as_bytes())?,
        (None, Some(_)) => bail!("--key requires --type"),
        (Some(data_type), None) => engine.compact_type(data_type, begin, end)?,
        (None, None) => engine.compact_range(begin, end)?,
    };
    Ok(report)
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Load config file if it exists
    let config = load_config(&args.config)?;

    // Merge CLI args with config file (CLI takes precedence)
    let log_level = if args.log_level != "warn" {
        args.log_level.clone()
    } else {
        config.logging.level.clone()
    };
    let data_dir = args.data_dir.clone().unwrap_or(config.admin.data_dir);
    let mut options = config.storage;
    if args.no_sync {
        options.sync_writes = false;
    }
    if let Some(size) = args.block_cache_size {
        options.block_cache_size = size;
    }
    // one-shot tool: no periodic compaction
    options.compaction_interval_secs = 0;

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let path = Path::new(&data_dir).join(format!("db{}", args.db));
    info!("Opening {}", path.display());
    let db = Db::open(options, args.db, &path)
        .with_context(|| format!("failed to open {}", path.display()))?;

    match args.command {
        Commands::Info { prefix } => {
            print!("{}", db.engine()?.engine_info(&prefix)?);
        }
        Commands::Property { name } => {
            println!("{}", db.engine()?.get_property(&name)?);
        }
        Commands::Keys => {
            let infos = db.engine()?.scan_key_num()?;
            for (data_type, info) in DataType::SCAN_ORDER.iter().zip(infos) {
                println!(
                    "# {data_type}: keys={}, expires={}, avg_ttl={}, invalid_keys={}",
                    info.keys, info.expires, info.avg_ttl, info.invalid_keys
                );
            }
        }
        Commands::Scan { pattern, count } => {
            let engine = db.engine()?;
            let mut cursor = 0;
            loop {
                let (next, keys) = engine.scan(cursor, pattern.as_bytes(), count)?;
                for key in keys {
                    println!("{}", String::from_utf8_lossy(&key));
                }
                if next == 0 {
                    break;
                }
                cursor = next;
            }
        }
        Commands::Dump => {
            let report = db.engine()?.scan_database()?;
            for (data_type, keys) in &report.types {
                println!("{data_type}: {} keys", keys.len());
                for key in keys {
                    let ttl = match (key.expired, key.ttl_ms) {
                        (true, _) => "expired".to_string(),
                        (false, Some(ms)) => format!("{ms}ms"),
                        (false, None) => "-1".to_string(),
                    };
                    println!(
                        "  {} version={} ttl={ttl} size={}",
                        String::from_utf8_lossy(&key.key),
                        key.version,
                        key.size
                    );
                }
            }
            if report.corrupted > 0 {
                println!("corrupted meta records: {}", report.corrupted);
            }
        }
        Commands::Compact {
            data_type,
            key,
            begin,
            end,
        } => {
            let engine = db.engine()?;
            let report = compact(
                &engine,
                data_type,
                key.as_deref(),
                begin.as_deref(),
                end.as_deref(),
            )?;
            print_report(&report);
        }
        Commands::Checkpoint { dir } => {
            let sync = db.engine()?.write_sync();
            let manifest = db.create_checkpoint(&dir, sync)?;
            println!("{}", serde_json::to_string_pretty(&manifest)?);
        }
        Commands::Restore { dir } => {
            let sync = db.engine()?.write_sync();
            db.load_from_checkpoint(&dir, sync)?;
            println!("restored db{} from {}", args.db, dir.display());
        }
        Commands::SetOption { cf, options } => {
            let scope = if cf {
                OptionType::ColumnFamily
            } else {
                OptionType::Db
            };
            db.engine()?.set_options(scope, &parse_options(&options)?)?;
        }
    }

    db.close();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_options() {
        let options = parse_options(&["sync-writes = false".to_string()]).unwrap();
        assert_eq!(options["sync-writes"], "false");
        assert!(parse_options(&["oops".to_string()]).is_err());
    }

    #[test]
    fn test_load_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ferrodis.toml");
        std::fs::write(
            &path,
            r#"
            [admin]
            data_dir = "/var/lib/ferrodis"

            [storage]
            small_compaction_threshold = 100
            "#,
        )
        .unwrap();
        let config = load_config(path.to_str().unwrap()).unwrap();
        assert_eq!(config.admin.data_dir, "/var/lib/ferrodis");
        assert_eq!(config.storage.small_compaction_threshold, 100);
        assert_eq!(config.storage.lock_shards, 1000);
        assert_eq!(config.logging.level, "warn");

        let missing = load_config("/nonexistent/ferrodis.toml").unwrap();
        assert_eq!(missing.admin.data_dir, "./ferrodis-data");
    }

    #[test]
    fn test_compact_requires_type_for_key() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(StorageOptions::default(), 0, dir.path().join("db0")).unwrap();
        let engine = db.engine().unwrap();
        engine.hset(b"h", b"f", b"v").unwrap();
        engine.del(&[b"h".as_slice()]).unwrap();

        assert!(compact(&engine, None, Some("h"), None, None).is_err());
        let report = compact(&engine, Some(DataType::Hashes), Some("h"), None, None).unwrap();
        assert_eq!(report.dropped(), 1);
    }
}
