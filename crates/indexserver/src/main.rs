use anyhow::Context;
use clap::Parser;
use indexserver::{owner, process, queue, server, sync, worker, App, Config};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Indexing control plane: keeps this node's shard set converged with the
/// repositories the source of truth assigns to it.
#[derive(clap::Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Directory holding the shard set.
    #[arg(long, env = "INDEX_DIR")]
    index_dir: PathBuf,

    /// Base URL of the source of truth.
    #[arg(long, env = "INDEX_URL")]
    url: url::Url,

    /// Hostname to claim assignments under.
    #[arg(long, env = "HOSTNAME")]
    hostname: String,

    /// Base cadence of the reconciliation loop (jittered per tick).
    #[arg(long, value_parser = humantime::parse_duration, default_value = "1m")]
    interval: Duration,

    /// Cadence of the compound-shard merge pass.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "8h")]
    merge_interval: Duration,

    /// Cadence of the compound-shard vacuum pass.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "1h")]
    vacuum_interval: Duration,

    /// Summed size at which a merge group is cut.
    #[arg(long, value_parser = parse_size, default_value = "2GiB")]
    merge_target_size: u64,

    /// Compound shards below this size are exploded again.
    #[arg(long, value_parser = parse_size, default_value = "1.8GiB")]
    merge_min_size: u64,

    /// Repositories with commits younger than this are not merged.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "7d")]
    min_merge_age: Duration,

    /// Repositories above this priority are not merged.
    #[arg(long, default_value_t = 100.0)]
    max_merge_priority: f64,

    /// Fraction of available cores given to one build.
    #[arg(long, default_value_t = 1.0)]
    cpu_fraction: f64,

    /// Address of the debug/metrics HTTP server.
    #[arg(long, default_value = "127.0.0.1:6072")]
    listen: std::net::SocketAddr,

    /// Base failure backoff; zero disables backoff.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "10s")]
    backoff: Duration,

    /// Failure backoff cap; zero disables backoff.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "2h")]
    max_backoff: Duration,

    /// Hard deadline for one indexing job.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "90m")]
    index_timeout: Duration,

    /// Builder output silence before quit/kill escalation.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "30m")]
    output_silence_timeout: Duration,

    /// Per-file size limit passed to the builder.
    #[arg(long, value_parser = parse_size, default_value = "2MiB")]
    max_file_size: u64,

    /// Repository names always allowed to build incrementally.
    #[arg(long, env = "DELTA_REPOS", value_delimiter = ',')]
    delta_repos: Vec<String>,

    /// Prior-shard count above which delta builds abort to full builds.
    #[arg(long, default_value_t = 150)]
    delta_shard_threshold: u64,

    /// Repository names granted their own metric label.
    #[arg(long, env = "SEPARATE_METRICS", value_delimiter = ',')]
    separate_metrics: Vec<String>,

    /// Tombstone repositories inside compound shards instead of trashing
    /// the whole shard.
    #[arg(long)]
    tombstones: bool,

    #[arg(long, default_value = "git")]
    git_binary: String,

    #[arg(long, default_value = "zoekt-git-index")]
    index_binary: String,

    #[arg(long, default_value = "zoekt-merge-index")]
    merge_binary: String,
}

fn parse_size(s: &str) -> Result<u64, String> {
    s.parse::<bytesize::ByteSize>().map(|b| b.as_u64())
}

fn main() -> Result<(), anyhow::Error> {
    // Use reasonable defaults for printing structured logs to stderr.
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_ansi(if matches!(std::env::var("NO_COLOR"), Ok(v) if v == "1") {
            false
        } else {
            true
        })
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting tracing default failed");

    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let result = runtime.block_on(runtime.spawn(async move { run(cli).await }));

    runtime.shutdown_timeout(std::time::Duration::from_secs(5));
    result?
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let shards = shardset::ShardDir::create(&cli.index_dir)
        .with_context(|| format!("index directory {} is not usable", cli.index_dir.display()))?;

    let cfg = Config {
        hostname: cli.hostname.clone(),
        interval: cli.interval,
        merge_interval: cli.merge_interval,
        vacuum_interval: cli.vacuum_interval,
        merge_min_size: cli.merge_min_size,
        cpu_fraction: cli.cpu_fraction,
        file_limit: cli.max_file_size,
        index_timeout: cli.index_timeout,
        silence_timeout: cli.output_silence_timeout,
        git_binary: cli.git_binary,
        index_binary: cli.index_binary,
        merge_binary: cli.merge_binary,
        delta_repos: cli.delta_repos,
        delta_shard_threshold: cli.delta_shard_threshold,
        separate_metrics: cli.separate_metrics,
    };

    let app = App::new(
        cfg,
        shards,
        queue::BackoffPolicy {
            base: cli.backoff,
            max: cli.max_backoff,
        },
        shardset::cleanup::CleanupConfig {
            tombstone_compounds: cli.tombstones,
            ..Default::default()
        },
        shardset::compound::MergePolicy {
            target_size: cli.merge_target_size,
            min_age: cli.min_merge_age,
            max_priority: cli.max_merge_priority,
        },
        Arc::new(process::LocalRunner),
    );

    // Claiming the marker doubles as the writability check: an unusable
    // shard directory is a startup error, not something to limp along with.
    owner::claim(&app.shards, &app.cfg.hostname)
        .context("shard directory is not writable")?;

    let source = Arc::new(indexserver::controlplane::HttpConfigSource::new(cli.url)?);
    let prometheus = server::install_metrics_recorder();

    tracing::info!(
        dir = %app.shards.root().display(),
        hostname = %app.cfg.hostname,
        "indexserver starting"
    );

    let sync_loop = sync::SyncLoop::new(app.clone(), source).run();
    let index_worker = worker::Worker::new(app.clone()).run();
    let merge_loop = indexserver::maintenance::Maintainer::new(app.clone()).run_merge_loop();
    let vacuum_loop = indexserver::maintenance::Maintainer::new(app.clone()).run_vacuum_loop();
    let owner_heartbeat = owner::heartbeat(app.clone());
    let debug_server = server::serve(app.clone(), prometheus, cli.listen);

    // Every loop runs forever; the first to return carries the error that
    // brings the daemon down.
    tokio::try_join!(
        sync_loop,
        index_worker,
        merge_loop,
        vacuum_loop,
        owner_heartbeat,
        debug_server,
    )?;
    Ok(())
}
