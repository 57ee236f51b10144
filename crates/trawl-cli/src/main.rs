use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use trawl_client::{HttpBackend, SelectorSource, SourceDefinition};
use trawl_core::proxy::ProxyRotator;
use trawl_core::{
    AutomationBackend, ConcurrentJobScraper, FetchConfig, Filters, JobQuery, JobRecord, Limiter,
    PooledSourceScraper, ResourcePool, ScrapeOutcome,
};

#[derive(Parser)]
#[command(name = "trawl", version, about = "Concurrent job board scraper")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Search every source and print the deduplicated postings
    Scrape {
        /// Search terms
        #[arg(short, long)]
        query: String,

        #[arg(short, long)]
        location: Option<String>,

        /// Maximum postings per source
        #[arg(long, default_value_t = 25)]
        limit: usize,

        /// Source definition file (repeatable)
        #[arg(short, long = "source", required = true)]
        sources: Vec<PathBuf>,

        /// Source-specific filter as SOURCE:KEY=VALUE (repeatable)
        #[arg(short, long = "filter")]
        filters: Vec<String>,

        #[arg(long, value_enum, default_value_t = Backend::Http)]
        backend: Backend,

        #[arg(long, value_enum, default_value_t = Format::Json)]
        format: Format,

        /// Proxy URL to rotate through (repeatable); overrides TRAWL_PROXY
        #[arg(long = "proxy")]
        proxies: Vec<String>,

        /// Fail instead of going direct once every proxy is excluded
        #[arg(long, default_value_t = false)]
        strict_proxies: bool,

        /// Concurrent detail fetches per source (also sizes each pool)
        #[arg(long, env = "TRAWL_MAX_CONCURRENT")]
        max_concurrent: Option<usize>,

        /// Per-page timeout in seconds
        #[arg(long, env = "TRAWL_TIMEOUT_SECS")]
        timeout: Option<u64>,

        /// Allow requests to loopback and private addresses (HTTP backend)
        #[arg(long, default_value_t = false)]
        allow_private_urls: bool,
    },

    /// Load and check source definition files
    Validate {
        #[arg(short, long = "source", required = true)]
        sources: Vec<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    Http,
    Browser,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Json,
    Csv,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("trawl=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Scrape {
            query,
            location,
            limit,
            sources,
            filters,
            backend,
            format,
            proxies,
            strict_proxies,
            max_concurrent,
            timeout,
            allow_private_urls,
        } => {
            let mut config = FetchConfig::from_env().context("Invalid TRAWL_* configuration")?;
            if let Some(max) = max_concurrent {
                config = config.with_max_concurrent(max);
            }
            if let Some(secs) = timeout {
                config = config.with_timeout(Duration::from_secs(secs));
            }
            config.validate()?;

            let mut job_query = JobQuery::new(query).with_limit(limit);
            if let Some(location) = location {
                job_query = job_query.with_location(location);
            }

            let rotator = (!proxies.is_empty()).then(|| {
                let rotator = ProxyRotator::new(proxies);
                Arc::new(if strict_proxies { rotator.strict() } else { rotator })
            });

            let run = ScrapeRun {
                query: job_query,
                filters: parse_filters(&filters)?,
                definitions: load_definitions(&sources)?,
                config: Arc::new(config),
                rotator,
            };

            let outcome = match backend {
                Backend::Http => {
                    let mut http = HttpBackend::new();
                    if allow_private_urls {
                        http = http.allow_private_urls();
                    }
                    run.execute(http).await?
                }
                Backend::Browser => run_browser(run).await?,
            };

            write_records(&outcome.all, format)?;
            print_summary(&outcome);

            if outcome.all.is_empty() && !outcome.errors.is_empty() && !outcome.cancelled {
                bail!("every source failed");
            }
        }
        Commands::Validate { sources } => cmd_validate(&sources)?,
    }

    Ok(())
}

#[cfg(feature = "browser")]
async fn run_browser(run: ScrapeRun) -> Result<ScrapeOutcome> {
    run.execute(trawl_client::BrowserBackend::new()).await
}

#[cfg(not(feature = "browser"))]
async fn run_browser(_run: ScrapeRun) -> Result<ScrapeOutcome> {
    bail!("trawl was built without browser support; rebuild with --features browser")
}

struct ScrapeRun {
    query: JobQuery,
    filters: BTreeMap<String, Filters>,
    definitions: Vec<SourceDefinition>,
    config: Arc<FetchConfig>,
    rotator: Option<Arc<ProxyRotator>>,
}

impl ScrapeRun {
    async fn execute<B: AutomationBackend + Clone>(self, backend: B) -> Result<ScrapeOutcome> {
        let mut orchestrator = ConcurrentJobScraper::new();

        for definition in self.definitions {
            let name = definition.name.clone();
            let source = SelectorSource::new(definition)
                .with_context(|| format!("Invalid source definition '{name}'"))?;
            let rate_limit = source.rate_limit().cloned().unwrap_or_default();
            let limiter = Limiter::from_config(&rate_limit)
                .with_context(|| format!("Invalid rate limit for '{name}'"))?;
            tracing::debug!(source = %name, config = ?rate_limit, "Rate limiter configured");

            let mut pool = ResourcePool::new(backend.clone(), Arc::clone(&self.config))?;
            if let Some(rotator) = &self.rotator {
                pool = pool.with_proxy_rotator(Arc::clone(rotator));
            }

            let scraper =
                PooledSourceScraper::new(source, pool, limiter, Arc::clone(&self.config))?;
            orchestrator.add_source(Arc::new(scraper))?;
        }

        for name in self.filters.keys() {
            if !orchestrator.source_names().contains(&name.as_str()) {
                tracing::warn!(source = %name, "Filter given for unknown source");
            }
        }

        // Ctrl-C stops the run; sources keep what they already collected.
        let cancel = CancellationToken::new();
        let on_signal = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, finishing with partial results");
                on_signal.cancel();
            }
        });

        let result = orchestrator.scrape(&self.query, &self.filters, cancel).await;
        orchestrator.close().await;

        if let Some(rotator) = &self.rotator {
            for endpoint in rotator.health_report() {
                tracing::info!(
                    proxy = %endpoint.address,
                    health = ?endpoint.health,
                    successes = endpoint.successes,
                    failures = endpoint.failures,
                    "Proxy health"
                );
            }
        }

        Ok(result?)
    }
}

fn load_definitions(paths: &[PathBuf]) -> Result<Vec<SourceDefinition>> {
    paths
        .iter()
        .map(|path| {
            SourceDefinition::load(path)
                .with_context(|| format!("Failed to load source definition {}", path.display()))
        })
        .collect()
}

/// Parse `SOURCE:KEY=VALUE` arguments into per-source filter maps.
fn parse_filters(raw: &[String]) -> Result<BTreeMap<String, Filters>> {
    let mut filters: BTreeMap<String, Filters> = BTreeMap::new();
    for arg in raw {
        let (source, pair) = arg
            .split_once(':')
            .with_context(|| format!("Filter '{arg}' must look like SOURCE:KEY=VALUE"))?;
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("Filter '{arg}' must look like SOURCE:KEY=VALUE"))?;
        if source.trim().is_empty() || key.trim().is_empty() {
            bail!("Filter '{arg}' has an empty source or key");
        }
        filters
            .entry(source.trim().to_string())
            .or_default()
            .insert(key.trim().to_string(), value.to_string());
    }
    Ok(filters)
}

fn write_records(records: &[JobRecord], format: Format) -> Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    match format {
        Format::Json => {
            serde_json::to_writer_pretty(&mut out, records)?;
            writeln!(out)?;
        }
        Format::Csv => write_csv(&mut out, records)?,
    }
    out.flush()?;
    Ok(())
}

const CSV_HEADER: [&str; 14] = [
    "source",
    "job_id",
    "title",
    "company",
    "location",
    "url",
    "salary_min",
    "salary_max",
    "currency",
    "period",
    "employment_type",
    "posted_at",
    "scraped_at",
    "description",
];

fn write_csv(out: impl Write, records: &[JobRecord]) -> Result<()> {
    let mut writer = csv::Writer::from_writer(out);
    writer.write_record(CSV_HEADER)?;

    for record in records {
        let salary = record.salary.as_ref();
        let number = |v: Option<f64>| v.map(|v| v.to_string()).unwrap_or_default();
        writer.write_record([
            record.source.clone().unwrap_or_default(),
            record.job_id.clone(),
            record.title.clone(),
            record.company.clone(),
            record.location.clone().unwrap_or_default(),
            record.url.clone(),
            number(salary.and_then(|s| s.min)),
            number(salary.and_then(|s| s.max)),
            salary.and_then(|s| s.currency.clone()).unwrap_or_default(),
            salary.and_then(|s| s.period.clone()).unwrap_or_default(),
            record.employment_type.clone().unwrap_or_default(),
            record.posted_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
            record.scraped_at.to_rfc3339(),
            record.description.clone().unwrap_or_default(),
        ])?;
    }

    writer.flush()?;
    Ok(())
}

fn print_summary(outcome: &ScrapeOutcome) {
    let stats = &outcome.stats;
    eprintln!();
    eprintln!("Run {}", outcome.run_id);
    for (source, found) in &stats.found_per_source {
        match outcome.errors.get(source) {
            Some(error) => eprintln!("  {source}: {found} postings (error: {error})"),
            None => eprintln!("  {source}: {found} postings"),
        }
    }
    eprintln!(
        "Found {} postings, {} unique ({} duplicates removed) in {:.1}s ({:.2} jobs/s)",
        stats.total_found,
        stats.unique,
        stats.duplicates_removed,
        stats.duration.as_secs_f64(),
        stats.jobs_per_second
    );
    if outcome.cancelled {
        eprintln!("Run was cancelled; results are partial");
    }
}

fn cmd_validate(paths: &[PathBuf]) -> Result<()> {
    let mut failed = 0;
    for path in paths {
        match validate_one(path) {
            Ok(definition) => println!(
                "ok    {} ({}, up to {} pages)",
                definition.name,
                path.display(),
                definition.max_pages
            ),
            Err(e) => {
                failed += 1;
                println!("error {}: {e:#}", path.display());
            }
        }
    }
    if failed > 0 {
        bail!("{failed} of {} source definitions are invalid", paths.len());
    }
    Ok(())
}

fn validate_one(path: &Path) -> Result<SourceDefinition> {
    let definition = SourceDefinition::load(path)?;
    definition.validate()?;
    Ok(definition)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_group_by_source() {
        let raw = vec![
            "indeed:remote=true".to_string(),
            "indeed:radius=25".to_string(),
            "glassdoor:sort=date".to_string(),
            "indeed:q=a=b".to_string(),
        ];
        let filters = parse_filters(&raw).unwrap();
        assert_eq!(filters["indeed"]["remote"], "true");
        assert_eq!(filters["indeed"]["radius"], "25");
        assert_eq!(filters["indeed"]["q"], "a=b");
        assert_eq!(filters["glassdoor"]["sort"], "date");
    }

    #[test]
    fn malformed_filters_are_rejected() {
        assert!(parse_filters(&["remote=true".to_string()]).is_err());
        assert!(parse_filters(&["indeed:remote".to_string()]).is_err());
        assert!(parse_filters(&[":remote=true".to_string()]).is_err());
    }

    #[test]
    fn csv_flattens_salary() {
        let record = JobRecord::new("1", "Rust Engineer", "Acme", "https://jobs.example/1")
            .with_source("acme")
            .with_salary(trawl_core::SalaryRange {
                min: Some(100000.0),
                max: None,
                currency: Some("USD".into()),
                period: Some("year".into()),
            });

        let mut buf = Vec::new();
        write_csv(&mut buf, &[record]).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let mut lines = text.lines();

        assert!(lines.next().unwrap().starts_with("source,job_id,title"));
        assert!(
            lines
                .next()
                .unwrap()
                .starts_with("acme,1,Rust Engineer,Acme,,https://jobs.example/1,100000,,USD,year,")
        );
    }

    #[test]
    fn cli_parses_scrape() {
        let cli = Cli::try_parse_from([
            "trawl", "scrape", "--query", "rust", "--source", "a.json", "--source", "b.json",
            "--filter", "a:remote=true", "--format", "csv", "--backend", "browser",
        ])
        .unwrap();
        match cli.command {
            Commands::Scrape {
                sources,
                format,
                backend,
                limit,
                ..
            } => {
                assert_eq!(sources.len(), 2);
                assert_eq!(format, Format::Csv);
                assert_eq!(backend, Backend::Browser);
                assert_eq!(limit, 25);
            }
            Commands::Validate { .. } => panic!("expected scrape"),
        }
    }
}
