// src/scoring.rs
//! # Relevance scoring
//!
//! Heuristic score in `[0, max_score]` made of three parts:
//! - keyword tiers (high=3, medium=2, low=1), each distinct keyword counted once,
//!   word-boundary matched against lower-cased `title + " " + body`;
//! - source weight, by the longest table key contained in the source name;
//! - a fixed freshness bonus for articles younger than the window.
//!
//! The engine holds no threshold. [`meets_threshold`] is the only gate.
//!
//! Configuration is an immutable value. Reloading builds a new engine and
//! swaps it behind a [`ScoringHandle`]; readers keep whatever `Arc` they
//! already hold.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use metrics::histogram;
use regex::Regex;
use serde::Deserialize;

use crate::ingest::anon_hash;
use crate::model::Article;

pub const HIGH_WEIGHT: i32 = 3;
pub const MEDIUM_WEIGHT: i32 = 2;
pub const LOW_WEIGHT: i32 = 1;

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct KeywordTiers {
    pub high: Vec<String>,
    pub medium: Vec<String>,
    pub low: Vec<String>,
}

impl Default for KeywordTiers {
    fn default() -> Self {
        let v = |xs: &[&str]| xs.iter().map(|s| s.to_string()).collect();
        Self {
            high: v(&[
                "анонс", "релиз", "трейлер", "announcement", "release", "trailer",
                "announced", "released", "exclusive", "debut", "premiere",
            ]),
            medium: v(&[
                "патч", "обновление", "скидка", "patch", "update", "sale", "discount",
                "upgrade", "bug fix", "hotfix", "expansion", "dlc",
            ]),
            low: v(&[
                "мод", "ранний доступ", "mod", "early access", "beta", "alpha",
                "rumor", "leak", "speculation", "fan-made",
            ]),
        }
    }
}

/// Source name → weight. Keys are matched case-insensitively as substrings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct SourceWeights {
    pub default_weight: i32,
    pub weights: HashMap<String, i32>,
}

impl Default for SourceWeights {
    fn default() -> Self {
        let weights = [
            ("ign", 10),
            ("polygon", 8),
            ("kotaku", 7),
            ("eurogamer", 9),
            ("gamespot", 8),
            ("rockpapershotgun", 8),
            ("pc gamer", 7),
            ("destructoid", 7),
            ("gameinformer", 9),
            ("cnet", 6),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        Self {
            default_weight: 5,
            weights,
        }
    }
}

impl SourceWeights {
    /// Longest key contained in the normalized source name wins; ties go to
    /// the lexicographically smaller key so the result never depends on map order.
    pub fn weight_for(&self, source: &str) -> i32 {
        let s = normalize_source(source);
        self.weights
            .iter()
            .map(|(k, &w)| (normalize_source(k), w))
            .filter(|(k, _)| !k.is_empty() && s.contains(k.as_str()))
            .max_by(|(a, _), (b, _)| a.len().cmp(&b.len()).then_with(|| b.cmp(a)))
            .map(|(_, w)| w)
            .unwrap_or(self.default_weight)
    }
}

/// Lowercase, fold separators to spaces, collapse whitespace.
fn normalize_source(s: &str) -> String {
    let mut out = s.trim().to_lowercase();
    for ch in ['—', '–', '-', '_', '/', '\\', '.', ','] {
        out = out.replace(ch, " ");
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Immutable scoring configuration. Loadable from its own TOML file.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScoringConfig {
    pub keywords: KeywordTiers,
    pub sources: SourceWeights,
    pub freshness_bonus: i32,
    pub freshness_window_secs: u64,
    pub max_score: u32,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            keywords: KeywordTiers::default(),
            sources: SourceWeights::default(),
            freshness_bonus: 5,
            freshness_window_secs: 15 * 60,
            max_score: 100,
        }
    }
}

impl ScoringConfig {
    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        let cfg: Self = toml::from_str(s)?;
        if cfg.max_score == 0 {
            anyhow::bail!("scoring: max_score must be positive");
        }
        Ok(cfg)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("failed to read scoring config at {}: {}", path.display(), e)
        })?;
        Self::from_toml_str(&content)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredArticle {
    pub article: Article,
    pub keyword_score: i32,
    pub source_weight: i32,
    pub freshness_bonus: i32,
    pub total: u32,
    /// Keywords that contributed, for logging.
    pub matched: Vec<String>,
}

#[derive(Debug)]
struct CompiledKeyword {
    keyword: String,
    weight: i32,
    re: Regex,
}

#[derive(Debug)]
pub struct ScoringEngine {
    cfg: ScoringConfig,
    keywords: Vec<CompiledKeyword>,
}

impl ScoringEngine {
    pub fn new(cfg: ScoringConfig) -> anyhow::Result<Self> {
        // A keyword listed in several tiers counts once, at its highest weight.
        let mut best: HashMap<String, i32> = HashMap::new();
        for (list, weight) in [
            (&cfg.keywords.high, HIGH_WEIGHT),
            (&cfg.keywords.medium, MEDIUM_WEIGHT),
            (&cfg.keywords.low, LOW_WEIGHT),
        ] {
            for kw in list {
                let kw = kw.trim().to_lowercase();
                if kw.is_empty() {
                    continue;
                }
                let e = best.entry(kw).or_insert(weight);
                *e = (*e).max(weight);
            }
        }

        let mut keywords = best
            .into_iter()
            .map(|(keyword, weight)| {
                let re = Regex::new(&format!(r"\b{}\b", regex::escape(&keyword)))
                    .map_err(|e| anyhow::anyhow!("keyword `{}` regex error: {}", keyword, e))?;
                Ok(CompiledKeyword { keyword, weight, re })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        keywords.sort_by(|a, b| b.weight.cmp(&a.weight).then_with(|| a.keyword.cmp(&b.keyword)));

        Ok(Self { cfg, keywords })
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.cfg
    }

    /// Pure given `article`, `now` and the engine's configuration.
    pub fn score(&self, article: &Article, now: DateTime<Utc>) -> ScoredArticle {
        let text = format!("{} {}", article.title, article.body).to_lowercase();

        let mut keyword_score = 0;
        let mut matched = Vec::new();
        for kw in &self.keywords {
            if kw.re.is_match(&text) {
                keyword_score += kw.weight;
                matched.push(kw.keyword.clone());
            }
        }

        let source_weight = self.cfg.sources.weight_for(&article.source_name);

        // Future-dated articles count as fresh.
        let age = now.signed_duration_since(article.published_at);
        let window = chrono::Duration::seconds(self.cfg.freshness_window_secs as i64);
        let freshness_bonus = if age < window {
            self.cfg.freshness_bonus
        } else {
            0
        };

        let sum = keyword_score as i64 + source_weight as i64 + freshness_bonus as i64;
        let total = sum.clamp(0, self.cfg.max_score as i64) as u32;

        histogram!("scoring_total_score").record(total as f64);
        tracing::debug!(
            target: "scoring",
            article_id = %article.id,
            title = %anon_hash(&article.title),
            keyword_score,
            source_weight,
            freshness_bonus,
            total,
            matched = ?matched,
            "scored"
        );

        ScoredArticle {
            article: article.clone(),
            keyword_score,
            source_weight,
            freshness_bonus,
            total,
            matched,
        }
    }
}

pub fn meets_threshold(total: u32, threshold: u32) -> bool {
    total >= threshold
}

/* ----------------------------
Shared handle + hot reload
---------------------------- */

/// Cloneable handle to the current engine. Reload swaps the whole engine.
#[derive(Clone)]
pub struct ScoringHandle {
    inner: Arc<RwLock<Arc<ScoringEngine>>>,
}

impl ScoringHandle {
    pub fn new(engine: ScoringEngine) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(engine))),
        }
    }

    /// Snapshot of the engine in use right now.
    pub fn current(&self) -> Arc<ScoringEngine> {
        match self.inner.read() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn score(&self, article: &Article, now: DateTime<Utc>) -> ScoredArticle {
        self.current().score(article, now)
    }

    pub fn swap(&self, engine: ScoringEngine) {
        let engine = Arc::new(engine);
        match self.inner.write() {
            Ok(mut g) => *g = engine,
            Err(poisoned) => *poisoned.into_inner() = engine,
        }
    }

    /// Rebuild from `path`. On error the current engine stays in place.
    pub fn reload_from(&self, path: &Path) -> anyhow::Result<()> {
        let engine = ScoringEngine::new(ScoringConfig::load(path)?)?;
        self.swap(engine);
        tracing::info!(target: "scoring", path = %path.display(), "scoring config reloaded");
        Ok(())
    }
}

/// Tracks a config file's mtime and reloads the handle when it moves forward.
pub struct ReloadWatcher {
    handle: ScoringHandle,
    path: PathBuf,
    last_mtime: Option<SystemTime>,
}

impl ReloadWatcher {
    pub fn new(handle: ScoringHandle, path: PathBuf) -> Self {
        let last_mtime = fs::metadata(&path).and_then(|m| m.modified()).ok();
        Self {
            handle,
            path,
            last_mtime,
        }
    }

    /// One poll. Returns true if a new engine was installed.
    pub fn poll(&mut self) -> bool {
        let mtime = match fs::metadata(&self.path).and_then(|m| m.modified()) {
            Ok(m) => m,
            // Missing or unreadable; keep the current engine and try again later.
            Err(_) => return false,
        };
        let changed = self.last_mtime.map_or(true, |prev| mtime > prev);
        if !changed {
            return false;
        }
        self.last_mtime = Some(mtime);
        match self.handle.reload_from(&self.path) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(target: "scoring", error = %e, "scoring reload rejected; keeping previous config");
                false
            }
        }
    }
}

/// Poll `path` every `every` on a background thread and hot-swap the engine.
pub fn start_hot_reload_thread(handle: ScoringHandle, path: PathBuf, every: Duration) {
    let mut watcher = ReloadWatcher::new(handle, path);
    thread::spawn(move || loop {
        thread::sleep(every);
        watcher.poll();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eng() -> ScoringEngine {
        ScoringEngine::new(ScoringConfig::default()).unwrap()
    }

    fn art(title: &str, source: &str, published_at: DateTime<Utc>) -> Article {
        Article::new(title, "", source, published_at)
    }

    #[test]
    fn ign_review_passes_threshold() {
        let now = Utc::now();
        let s = eng().score(&art("IGN Reviews New RPG Game", "IGN", now), now);
        assert_eq!(s.source_weight, 10);
        assert_eq!(s.freshness_bonus, 5);
        assert!(meets_threshold(s.total, 8));
    }

    #[test]
    fn stale_unknown_update_is_filtered() {
        let now = Utc::now();
        let s = eng().score(
            &art("Random update", "Unknown", now - chrono::Duration::hours(1)),
            now,
        );
        assert_eq!(s.keyword_score, MEDIUM_WEIGHT);
        assert_eq!(s.source_weight, 5);
        assert_eq!(s.freshness_bonus, 0);
        assert_eq!(s.total, 7);
        assert!(!meets_threshold(s.total, 8));
    }

    #[test]
    fn keywords_need_word_boundaries_and_count_once() {
        let now = Utc::now();
        let e = eng();
        // "modern" must not match "mod", "updated" must not match "update".
        let s = e.score(&art("Modern warfare updated", "x", now - chrono::Duration::days(1)), now);
        assert_eq!(s.keyword_score, 0);

        let s = e.score(&art("Trailer, trailer, TRAILER", "x", now - chrono::Duration::days(1)), now);
        assert_eq!(s.keyword_score, HIGH_WEIGHT);
        assert_eq!(s.matched, vec!["trailer".to_string()]);
    }

    #[test]
    fn multi_word_and_cyrillic_keywords_match() {
        let now = Utc::now();
        let s = eng().score(
            &art("Анонс: ранний доступ и bug fix", "x", now - chrono::Duration::days(1)),
            now,
        );
        assert_eq!(s.keyword_score, HIGH_WEIGHT + LOW_WEIGHT + MEDIUM_WEIGHT);
    }

    #[test]
    fn longest_source_key_wins() {
        let mut sw = SourceWeights::default();
        sw.weights.insert("pc gamer uk".into(), 3);
        assert_eq!(sw.weight_for("PC Gamer UK"), 3);
        assert_eq!(sw.weight_for("PC-Gamer"), 7);
        assert_eq!(sw.weight_for("Nowhere Weekly"), 5);
    }

    #[test]
    fn future_dates_are_fresh_and_total_is_capped() {
        let now = Utc::now();
        let mut cfg = ScoringConfig::default();
        cfg.max_score = 12;
        let e = ScoringEngine::new(cfg).unwrap();
        let s = e.score(
            &art("Release trailer announced", "IGN", now + chrono::Duration::hours(2)),
            now,
        );
        assert_eq!(s.freshness_bonus, 5);
        assert_eq!(s.total, 12);
    }

    #[test]
    fn negative_weights_floor_at_zero() {
        let now = Utc::now();
        let mut cfg = ScoringConfig::default();
        cfg.sources.default_weight = -50;
        let e = ScoringEngine::new(cfg).unwrap();
        let s = e.score(&art("nothing", "nobody", now - chrono::Duration::days(3)), now);
        assert_eq!(s.total, 0);
    }

    #[test]
    fn deterministic_for_same_inputs() {
        let now = Utc::now();
        let e = eng();
        let a = art("DLC expansion release", "Eurogamer", now);
        assert_eq!(e.score(&a, now), e.score(&a, now));
    }

    #[test]
    fn toml_overrides_defaults() {
        let cfg = ScoringConfig::from_toml_str(
            r#"
freshness_bonus = 2

[keywords]
high = ["remaster"]

[sources]
default_weight = 1
[sources.weights]
"my feed" = 4
"#,
        )
        .unwrap();
        assert_eq!(cfg.freshness_bonus, 2);
        assert_eq!(cfg.keywords.high, vec!["remaster".to_string()]);
        assert!(cfg.keywords.medium.contains(&"patch".to_string()));
        assert_eq!(cfg.sources.weight_for("My Feed"), 4);
        assert_eq!(cfg.max_score, 100);
        assert!(ScoringConfig::from_toml_str("max_score = 0").is_err());
    }

    #[test]
    fn handle_swap_is_seen_by_new_snapshots_only() {
        let handle = ScoringHandle::new(eng());
        let old = handle.current();

        let mut cfg = ScoringConfig::default();
        cfg.freshness_bonus = 50;
        handle.swap(ScoringEngine::new(cfg).unwrap());

        assert_eq!(old.config().freshness_bonus, 5);
        assert_eq!(handle.current().config().freshness_bonus, 50);
    }

    #[test]
    fn watcher_reloads_on_change_and_keeps_engine_on_bad_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scoring.toml");
        fs::write(&path, "freshness_bonus = 1\n").unwrap();

        let handle = ScoringHandle::new(eng());
        let mut w = ReloadWatcher::new(handle.clone(), path.clone());
        w.last_mtime = None;
        assert!(w.poll());
        assert_eq!(handle.current().config().freshness_bonus, 1);
        assert!(!w.poll());

        fs::write(&path, "max_score = 0\n").unwrap();
        w.last_mtime = None;
        assert!(!w.poll());
        assert_eq!(handle.current().config().freshness_bonus, 1);
    }
}
