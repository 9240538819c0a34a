// tests/scoring_scenarios.rs
use chrono::{Duration, Utc};
use news_relay::model::Article;
use news_relay::scoring::{meets_threshold, ReloadWatcher, ScoringConfig, ScoringEngine, ScoringHandle};
use std::fs;

fn engine() -> ScoringEngine {
    ScoringEngine::new(ScoringConfig::default()).unwrap()
}

#[test]
fn fresh_trailer_from_top_outlet_is_hot() {
    let now = Utc::now();
    let a = Article::new("Elden Ring: new trailer", "", "IGN", now - Duration::minutes(5));
    let s = engine().score(&a, now);
    assert_eq!(s.keyword_score, 3);
    assert_eq!(s.source_weight, 10);
    assert_eq!(s.freshness_bonus, 5);
    assert_eq!(s.total, 18);
    assert_eq!(s.matched, vec!["trailer".to_string()]);
}

#[test]
fn stale_patch_note_from_unknown_source_is_filtered() {
    let now = Utc::now();
    let a = Article::new("Minor patch", "small fixes", "random-blog.example", now - Duration::hours(3));
    let s = engine().score(&a, now);
    assert_eq!(s.total, 2 + 5);
    assert!(!meets_threshold(s.total, 8));
}

#[test]
fn freshness_window_edge() {
    let now = Utc::now();
    let e = engine();
    let inside = Article::new("x", "", "nobody", now - Duration::seconds(899));
    let outside = Article::new("x", "", "nobody", now - Duration::seconds(900));
    assert_eq!(e.score(&inside, now).freshness_bonus, 5);
    assert_eq!(e.score(&outside, now).freshness_bonus, 0);
}

#[test]
fn russian_keywords_score_too() {
    let now = Utc::now();
    let a = Article::new("Анонс новой игры", "вышло обновление", "Kotaku", now - Duration::days(1));
    let s = engine().score(&a, now);
    assert_eq!(s.keyword_score, 3 + 2);
    assert_eq!(s.source_weight, 7);
}

#[test]
fn score_is_capped() {
    let cfg = ScoringConfig::from_toml_str(
        r#"
max_score = 12

[sources]
default_weight = 10
"#,
    )
    .unwrap();
    let e = ScoringEngine::new(cfg).unwrap();
    let now = Utc::now();
    let a = Article::new("Release trailer announced, exclusive debut", "", "whoever", now);
    assert_eq!(e.score(&a, now).total, 12);
}

#[test]
fn config_file_reload_swaps_engine() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scoring.toml");
    fs::write(
        &path,
        r#"
[keywords]
high = ["speedrun"]
medium = []
low = []
"#,
    )
    .unwrap();

    let handle = ScoringHandle::new(ScoringEngine::new(ScoringConfig::load(&path).unwrap()).unwrap());
    let mut watcher = ReloadWatcher::new(handle.clone(), path.clone());
    let now = Utc::now() - Duration::days(1);
    let a = Article::new("World record speedrun", "", "nobody", now);
    assert_eq!(handle.score(&a, Utc::now()).keyword_score, 3);

    // Make sure the mtime moves on coarse filesystems.
    std::thread::sleep(std::time::Duration::from_millis(1100));
    fs::write(
        &path,
        r#"
[keywords]
high = []
medium = []
low = ["speedrun"]
"#,
    )
    .unwrap();
    assert!(watcher.poll());
    assert_eq!(handle.score(&a, Utc::now()).keyword_score, 1);

    // A broken file keeps the previous engine.
    std::thread::sleep(std::time::Duration::from_millis(1100));
    fs::write(&path, "keywords = 42").unwrap();
    assert!(!watcher.poll());
    assert_eq!(handle.score(&a, Utc::now()).keyword_score, 1);
}
