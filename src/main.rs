//! news-relay binary entrypoint.
//! Loads configuration, wires the adapters, and runs the fetch, retry and
//! purge loops until Ctrl-C.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use news_relay::breaker::BreakerRegistry;
use news_relay::config::AppConfig;
use news_relay::ingest::{self, rss::RssFeedSource, types::FeedSource};
use news_relay::pipeline::Pipeline;
use news_relay::publish::{DryRunPublisher, Publisher, TelegramPublisher};
use news_relay::scoring::{start_hot_reload_thread, ScoringConfig, ScoringEngine, ScoringHandle};
use news_relay::store::SqliteStore;
use news_relay::translate::{NoopTranslator, TranslationBackend, YandexTranslator};

/// Compact logs by default, one JSON object per line with LOG_FORMAT=json.
fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("news_relay=info,warn"));

    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_current_span(false)).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

fn build_scoring(cfg: &AppConfig) -> anyhow::Result<ScoringHandle> {
    let scoring_cfg = match &cfg.scoring.config_path {
        Some(path) => ScoringConfig::load(path)?,
        None => ScoringConfig::default(),
    };
    let handle = ScoringHandle::new(ScoringEngine::new(scoring_cfg)?);

    if let (Some(path), true) = (&cfg.scoring.config_path, cfg.scoring.hot_reload) {
        start_hot_reload_thread(
            handle.clone(),
            path.clone(),
            Duration::from_secs(cfg.scoring.reload_poll_secs.max(1)),
        );
        tracing::info!(path = %path.display(), "scoring hot reload enabled");
    }
    Ok(handle)
}

fn build_backend(cfg: &AppConfig) -> anyhow::Result<Arc<dyn TranslationBackend>> {
    if !cfg.translation.enabled || cfg.yandex.api_key.trim().is_empty() {
        tracing::warn!("no translation backend configured; articles go out untranslated");
        return Ok(Arc::new(NoopTranslator));
    }
    let t = YandexTranslator::new(
        cfg.yandex.api_key.clone(),
        cfg.yandex.folder_id.clone(),
        Duration::from_secs(cfg.translation.timeout_secs),
    )?;
    Ok(Arc::new(t))
}

fn build_publisher(cfg: &AppConfig) -> anyhow::Result<Arc<dyn Publisher>> {
    if cfg.publish.dry_run || !cfg.telegram_configured() {
        tracing::warn!("telegram not configured or dry_run set; messages are only logged");
        return Ok(Arc::new(DryRunPublisher));
    }
    let p = TelegramPublisher::new(
        cfg.telegram.token.clone(),
        cfg.telegram.channel_id.clone(),
        Duration::from_secs(cfg.publish.timeout_secs),
    )?;
    Ok(Arc::new(p))
}

fn build_sources(cfg: &AppConfig) -> anyhow::Result<Vec<Box<dyn FeedSource>>> {
    let mut out: Vec<Box<dyn FeedSource>> = Vec::new();
    for feed in cfg.feeds.iter().filter(|f| f.enabled) {
        let language = feed
            .language
            .clone()
            .unwrap_or_else(|| cfg.translation.source.clone());
        let src = RssFeedSource::from_url(feed.name.clone(), feed.url.clone(), Duration::from_secs(30))
            .with_context(|| format!("feed `{}`", feed.name))?
            .with_language(language);
        out.push(Box::new(src));
    }
    Ok(out)
}

fn ticker(every_secs: u64) -> tokio::time::Interval {
    let mut t = tokio::time::interval(Duration::from_secs(every_secs.max(1)));
    t.set_missed_tick_behavior(MissedTickBehavior::Delay);
    t
}

fn spawn_fetch_loop(pipeline: Arc<Pipeline>, sources: Vec<Box<dyn FeedSource>>, every_secs: u64) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = ticker(every_secs);
        loop {
            tick.tick().await;
            if pipeline.is_shutting_down() {
                break;
            }
            let articles = ingest::run_once(&sources).await;
            tracing::info!(fetched = articles.len(), "fetch cycle");
            pipeline.run_batch(articles).await;
        }
    })
}

fn spawn_retry_loop(pipeline: Arc<Pipeline>, every_secs: u64) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = ticker(every_secs);
        loop {
            tick.tick().await;
            if pipeline.is_shutting_down() {
                break;
            }
            if let Err(e) = pipeline.drive_retries().await {
                tracing::warn!(error = %e, "retry pass failed");
            }
        }
    })
}

fn spawn_purge_loop(pipeline: Arc<Pipeline>, every_secs: u64) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = ticker(every_secs);
        loop {
            tick.tick().await;
            if pipeline.is_shutting_down() {
                break;
            }
            match pipeline.purge().await {
                Ok(n) if n > 0 => tracing::info!(purged = n, "retention purge"),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "retention purge failed"),
            }
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op when the file is absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = AppConfig::load_default().context("loading configuration")?;

    match std::env::var("METRICS_ADDR") {
        Ok(addr) => {
            let addr: SocketAddr = addr.parse().context("METRICS_ADDR")?;
            news_relay::metrics::install_prometheus(addr)?;
            tracing::info!(%addr, "prometheus exporter listening");
        }
        Err(_) => news_relay::metrics::ensure_described(),
    }

    let store = Arc::new(SqliteStore::open(&cfg.database.path)?);
    let breakers = BreakerRegistry::new(cfg.breaker_config());
    let pipeline = Arc::new(Pipeline::from_config(
        &cfg,
        store,
        build_publisher(&cfg)?,
        build_backend(&cfg)?,
        build_scoring(&cfg)?,
        &breakers,
    ));

    let sources = build_sources(&cfg)?;
    if sources.is_empty() {
        tracing::warn!("no enabled feeds; only retries and purges will run");
    }
    tracing::info!(
        feeds = sources.len(),
        workers = cfg.pipeline.workers,
        threshold = cfg.scoring.threshold,
        db = %cfg.database.path.display(),
        "news-relay started"
    );

    let loops = [
        spawn_fetch_loop(pipeline.clone(), sources, cfg.pipeline.fetch_interval_secs),
        spawn_retry_loop(pipeline.clone(), cfg.pipeline.retry_poll_secs),
        spawn_purge_loop(pipeline.clone(), cfg.pipeline.purge_interval_secs),
    ];

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("ctrl-c received");

    let clean = pipeline
        .shutdown(Duration::from_secs(cfg.pipeline.shutdown_grace_secs))
        .await;
    for h in loops {
        h.abort();
    }
    for (name, state) in breakers.states() {
        tracing::info!(breaker = %name, state = ?state, "breaker state at exit");
    }
    tracing::info!(clean, "news-relay stopped");
    Ok(())
}
