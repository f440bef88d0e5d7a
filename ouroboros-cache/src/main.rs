use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use futures::stream::{self, StreamExt};
use rand::Rng;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use ouroboros_cache::{
    AnswerSource, CacheConfig, CacheKey, CacheKeyBuilder, CacheManager, ComputeResult,
    DocumentRef, DurableStore, FileDurableStore, InMemoryDistributedBackend, InMemoryDurableStore,
};

#[derive(Parser)]
#[command(name = "ouroboros-cache")]
#[command(about = "Tiered cache for RAG query results", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective configuration (environment and .env applied)
    Config,

    /// Run a synthetic concurrent workload against in-memory tiers
    Simulate {
        /// Total lookups to issue
        #[arg(long, default_value_t = 2_000)]
        requests: usize,

        /// Distinct queries in the workload
        #[arg(long, default_value_t = 100)]
        queries: usize,

        /// Documents in the synthetic corpus
        #[arg(long, default_value_t = 10)]
        documents: usize,

        /// Lookups in flight at once
        #[arg(short, long, default_value_t = 32)]
        concurrency: usize,

        /// Simulated RAG latency per computation
        #[arg(long, default_value_t = 25)]
        compute_ms: u64,

        /// Take the distributed tier offline after this many lookups
        #[arg(long)]
        kill_distributed_after: Option<usize>,

        /// Re-index one document every N lookups
        #[arg(long)]
        invalidate_every: Option<usize>,

        /// Keep the durable tier on disk under this directory
        #[arg(long)]
        durable_dir: Option<PathBuf>,
    },
}

/// Stand-in for the RAG pipeline: sleeps, then answers
struct SyntheticSource {
    latency: Duration,
}

#[async_trait]
impl AnswerSource for SyntheticSource {
    async fn compute(&self, key: &CacheKey) -> ComputeResult {
        tokio::time::sleep(self.latency).await;
        Ok(format!("answer to '{}' ({})", key.query(), Uuid::new_v4()).into_bytes())
    }
}

/// Current version token of every synthetic document
struct Corpus {
    versions: RwLock<Vec<String>>,
}

impl Corpus {
    fn new(documents: usize) -> Self {
        Self {
            versions: RwLock::new((0..documents).map(|_| Uuid::new_v4().to_string()).collect()),
        }
    }

    fn refs_for(&self, query: usize) -> Vec<DocumentRef> {
        let versions = self.versions.read().unwrap_or_else(|p| p.into_inner());
        let n = versions.len();
        [query % n, (query * 7 + 3) % n]
            .iter()
            .map(|&d| DocumentRef::new(format!("doc-{}", d), versions[d].clone()))
            .collect()
    }

    /// Give document `d` a new version; returns its id
    fn reindex(&self, d: usize) -> String {
        let mut versions = self.versions.write().unwrap_or_else(|p| p.into_inner());
        let d = d % versions.len();
        versions[d] = Uuid::new_v4().to_string();
        format!("doc-{}", d)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "ouroboros_cache=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Config => {
            let config = CacheConfig::from_env().context("loading cache configuration")?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }

        Commands::Simulate {
            requests,
            queries,
            documents,
            concurrency,
            compute_ms,
            kill_distributed_after,
            invalidate_every,
            durable_dir,
        } => {
            anyhow::ensure!(queries > 0 && documents > 0, "queries and documents must be positive");

            let config = CacheConfig::from_env().context("loading cache configuration")?;
            let latency = Duration::from_millis(compute_ms);
            let backend = Arc::new(InMemoryDistributedBackend::new());
            let durable: Arc<dyn DurableStore> = match durable_dir {
                Some(dir) => Arc::new(FileDurableStore::new(dir)),
                None => Arc::new(InMemoryDurableStore::new()),
            };

            let manager = Arc::new(
                CacheManager::builder(config)
                    .distributed(backend.clone())
                    .durable(durable)
                    .answer_source(Arc::new(SyntheticSource { latency }))
                    .build()?,
            );
            let corpus = Arc::new(Corpus::new(documents));
            let builder = CacheKeyBuilder::answers("synthetic-llm");

            info!(
                "Simulating {} lookups over {} queries and {} documents",
                requests, queries, documents
            );
            let started = Instant::now();

            let outcomes: Vec<bool> = stream::iter(0..requests)
                .map(|n| {
                    // skew towards low query ids so some keys are hot
                    let r: f64 = rand::thread_rng().gen();
                    let query = ((r * r) * queries as f64) as usize;
                    let manager = manager.clone();
                    let corpus = corpus.clone();
                    let backend = backend.clone();
                    let builder = builder.clone();

                    async move {
                        if kill_distributed_after == Some(n) {
                            info!("Taking the distributed tier offline");
                            backend.shutdown();
                        }
                        if let Some(every) = invalidate_every {
                            if every > 0 && n > 0 && n % every == 0 {
                                let document = corpus.reindex(n / every);
                                manager.invalidate(&document).await;
                            }
                        }

                        let key = match builder.build(&format!("question {}", query), &corpus.refs_for(query)) {
                            Ok(key) => key,
                            Err(_) => return false,
                        };
                        let source = SyntheticSource { latency };
                        let compute_key = key.clone();
                        manager
                            .get_or_compute(&key, || async move { source.compute(&compute_key).await })
                            .await
                            .is_ok()
                    }
                })
                .buffer_unordered(concurrency.max(1))
                .collect()
                .await;

            let failed = outcomes.iter().filter(|ok| !**ok).count();
            let stats = manager.stats().await;
            manager.shutdown().await;

            println!("Completed {} lookups in {:?} ({} failed)", requests, started.elapsed(), failed);
            println!("{}", stats);
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }

    Ok(())
}
