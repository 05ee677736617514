//! StripeCache Tool - Cache span administration
//!
//! Lists, allocates, checks and repairs the spans of a cache. Nothing is
//! written to disk unless `--write` is given; without it, allocation and
//! repair commands run in memory and only report what they would do.

mod commands;
mod mode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use mode::Mode;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use stripecache_common::{Diagnostics, Severity, ToolConfig};
use stripecache_storage::{Cache, DeviceOptions, ReadOnly, ReadWrite};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "stripecache-tool")]
#[command(about = "StripeCache span administration")]
#[command(version)]
struct Args {
    /// Span and volume configuration (TOML)
    #[arg(short, long, env = "STRIPECACHE_CONFIG", default_value = "/etc/stripecache/cache.toml")]
    config: PathBuf,

    /// Open spans read-write and persist changes
    #[arg(long)]
    write: bool,

    /// Override the average object size in bytes
    #[arg(long)]
    aos: Option<u64>,

    /// Bypass the page cache
    #[arg(long)]
    direct_io: bool,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List spans
    List,
    /// List stripes with their metadata copies
    Stripes {
        /// Only this span
        #[arg(long)]
        device: Option<PathBuf>,
    },
    /// Show volumes against their targets
    Volumes,
    /// Allocate span space to volumes
    Alloc {
        #[command(subcommand)]
        action: AllocCommands,
    },
    /// Destroy span headers and stripe metadata
    Clear {
        /// Only this span
        #[arg(long)]
        device: Option<PathBuf>,
    },
    /// Check stripe directories
    DirCheck {
        #[arg(value_enum, default_value_t = CheckKind::Full)]
        kind: CheckKind,
        /// Only this span
        #[arg(long)]
        device: Option<PathBuf>,
    },
    /// Show the stripe each URL is routed to
    Find(UrlArgs),
    /// Read the cached fragment of each URL
    Retrieve(UrlArgs),
    /// Walk every stripe of every span in parallel
    Scan {
        /// Emit JSON reports
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Debug)]
enum AllocCommands {
    /// Allocate every span without stripes in use
    Free,
    /// Allocate one uninitialized span
    Span {
        path: PathBuf,
    },
    /// Derive a fresh layout for all spans without writing it
    Simulate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum CheckKind {
    /// Read-only audit with statistics
    Full,
    /// Freelist loop detection and repair
    Freelist,
    /// Stale entry removal and chain loop repair
    BucketChain,
}

#[derive(clap::Args, Debug)]
struct UrlArgs {
    urls: Vec<String>,
    /// File with one URL per line
    #[arg(long)]
    input: Option<PathBuf>,
}

impl UrlArgs {
    fn collect(&self) -> Result<Vec<String>> {
        let mut urls = self.urls.clone();
        if let Some(path) = &self.input {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read URLs from {}", path.display()))?;
            urls.extend(
                text.lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty() && !l.starts_with('#'))
                    .map(str::to_owned),
            );
        }
        Ok(urls)
    }
}

fn load_config(path: &Path, aos: Option<u64>) -> Result<ToolConfig> {
    let mut config = ToolConfig::load(path)
        .with_context(|| format!("failed to load configuration {}", path.display()))?;
    if let Some(aos) = aos {
        config.average_object_size = aos;
        config.validate()?;
    }
    Ok(config)
}

fn run<M: Mode>(args: &Args, config: ToolConfig) -> Result<Diagnostics> {
    let options = DeviceOptions {
        direct_io: args.direct_io,
    };
    let (mut cache, mut diags) = Cache::<M>::load(config, options);
    debug!(spans = cache.spans().len(), stripes = cache.stripes().len(), "cache loaded");

    let more = match &args.command {
        Commands::List => {
            commands::list_spans(&cache);
            Diagnostics::new()
        }
        Commands::Stripes { device } => commands::list_stripes(&mut cache, device.as_deref())?,
        Commands::Volumes => {
            commands::list_volumes(&cache);
            Diagnostics::new()
        }
        Commands::Alloc { action } => match action {
            AllocCommands::Free => {
                let d = M::allocate_empty_spans(&mut cache);
                commands::list_volumes(&cache);
                d
            }
            AllocCommands::Span { path } => {
                let d = M::init_span(&mut cache, path)?;
                commands::list_volumes(&cache);
                d
            }
            AllocCommands::Simulate => {
                let (_, d) = cache.fill_all_spans();
                commands::list_volumes(&cache);
                d
            }
        },
        Commands::Clear { device } => M::clear_spans(&mut cache, device.as_deref())?,
        Commands::DirCheck { kind, device } => {
            let device = device.as_deref();
            let (mut d, repaired) = match kind {
                CheckKind::Full => (commands::dir_check(&mut cache, device)?, Vec::new()),
                CheckKind::Freelist => commands::check_freelists(&mut cache, device)?,
                CheckKind::BucketChain => commands::walk_bucket_chains(&mut cache, device)?,
            };
            if !repaired.is_empty() {
                d.merge(M::persist(&mut cache, &repaired));
            }
            d
        }
        Commands::Find(urls) => commands::find(&cache, &urls.collect()?),
        Commands::Retrieve(urls) => commands::retrieve(&mut cache, &urls.collect()?),
        Commands::Scan { json } => commands::scan(&mut cache, *json)?,
    };
    diags.merge(more);
    Ok(diags)
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = load_config(&args.config, args.aos)?;
    info!(config = %args.config.display(), spans = config.spans.len(), write = args.write, "starting");

    let diags = if args.write {
        run::<ReadWrite>(&args, config)?
    } else {
        run::<ReadOnly>(&args, config)?
    };

    for d in &diags {
        eprintln!("{d}");
    }
    if diags.has_fatal() {
        eprintln!(
            "{} fatal, {} warnings",
            diags.count(Severity::Fatal),
            diags.count(Severity::Warning)
        );
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "stripecache-tool",
            "--config",
            "c.toml",
            "--write",
            "dir-check",
            "bucket-chain",
            "--device",
            "/dev/sdb",
        ])
        .unwrap();
        assert!(args.write);
        match args.command {
            Commands::DirCheck { kind, device } => {
                assert_eq!(kind, CheckKind::BucketChain);
                assert_eq!(device.as_deref(), Some(Path::new("/dev/sdb")));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_urls_from_input_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("urls.txt");
        std::fs::write(&path, "http://a/\n\n# comment\n  http://b/x  \n").unwrap();
        let urls = UrlArgs {
            urls: vec!["http://c/".to_owned()],
            input: Some(path),
        };
        assert_eq!(urls.collect().unwrap(), ["http://c/", "http://a/", "http://b/x"]);
    }

    #[test]
    fn test_aos_override() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("cache.toml");
        std::fs::write(&path, "[[spans]]\npath = \"/dev/sdb\"\n").unwrap();
        assert_eq!(load_config(&path, Some(16000)).unwrap().average_object_size, 16000);
        assert!(load_config(&path, Some(0)).is_err());
    }
}
