// tests/publication_retry.rs
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use news_relay::breaker::{BreakerConfig, BreakerState, CircuitBreaker};
use news_relay::cache::MemoryCache;
use news_relay::error::{PipelineError, PublishError};
use news_relay::model::Article;
use news_relay::publish::{PublicationMachine, PublicationState, PublishOutcome, RetryPolicy};
use news_relay::testing::{FailingStore, MemoryStore, ScriptedPublisher, ScriptedTranslator};
use news_relay::translate::EntityPreservingTranslator;

struct Rig {
    machine: PublicationMachine,
    publisher: Arc<ScriptedPublisher>,
    breaker: Arc<CircuitBreaker>,
}

fn rig(max_retries: u32, breaker_cfg: BreakerConfig) -> Rig {
    let publisher = Arc::new(ScriptedPublisher::new());
    let breaker = Arc::new(CircuitBreaker::new("publisher", breaker_cfg));
    let machine = PublicationMachine::new(
        Arc::new(MemoryStore::new()),
        publisher.clone(),
        breaker.clone(),
        RetryPolicy {
            max_retries,
            backoff_base: 2.0,
        },
    );
    Rig {
        machine,
        publisher,
        breaker,
    }
}

fn article() -> Article {
    Article::new("Silksong release date trailer", "Team Cherry shows gameplay", "IGN", Utc::now())
        .with_link("https://example.com/silksong")
}

#[tokio::test]
async fn published_article_is_never_sent_twice() {
    let r = rig(3, BreakerConfig::default());
    let a = article();

    let first = r.machine.publish(&a).await.unwrap();
    let second = r.machine.publish(&a).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first, PublishOutcome::Published { message_id: "msg-1".into() });
    assert_eq!(r.publisher.calls(), 1);

    let sent = r.publisher.sent();
    assert!(sent[0].text.starts_with("<b>Silksong release date trailer</b>"));
    assert!(sent[0].text.contains("#Release #Trailer"));
    assert!(sent[0].text.ends_with("🔗 <a href=\"https://example.com/silksong\">IGN</a>"));
}

#[tokio::test]
async fn transient_failures_exhaust_the_budget() {
    let r = rig(3, BreakerConfig::default());
    r.publisher
        .fail_always(Some(PublishError::Transient("HTTP 502".into())));
    let a = article();
    let t0 = Utc::now();

    let o1 = r.machine.publish_at(&a, t0).await.unwrap();
    assert_eq!(o1, PublishOutcome::Scheduled { next_retry_at: t0 + chrono::Duration::seconds(1) });

    // Not due yet: no attempt.
    let early = r.machine.publish_at(&a, t0).await.unwrap();
    assert!(matches!(early, PublishOutcome::Scheduled { .. }));
    assert_eq!(r.publisher.calls(), 1);

    let t1 = t0 + chrono::Duration::seconds(1);
    let o2 = r.machine.publish_at(&a, t1).await.unwrap();
    assert_eq!(o2, PublishOutcome::Scheduled { next_retry_at: t1 + chrono::Duration::seconds(2) });

    let t2 = t1 + chrono::Duration::seconds(2);
    let o3 = r.machine.publish_at(&a, t2).await.unwrap();
    assert!(matches!(o3, PublishOutcome::Failed { .. }));

    let rec = r.machine.get(a.id).await.unwrap().unwrap();
    assert_eq!(rec.attempt_count, 3);
    assert!(matches!(rec.state, PublicationState::Failed { .. }));
    assert!(rec.last_error.unwrap().contains("HTTP 502"));
    assert_eq!(r.publisher.calls(), 3);

    let failed = r.machine.list_failed(10).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].article_id, a.id);

    // Terminal: further calls are answered from the record.
    assert!(matches!(r.machine.publish(&a).await.unwrap(), PublishOutcome::Failed { .. }));
    assert_eq!(r.publisher.calls(), 3);
}

#[tokio::test]
async fn retry_then_success() {
    let r = rig(3, BreakerConfig::default());
    r.publisher.push_error(PublishError::Transient("timeout".into()));
    let a = article();
    let t0 = Utc::now();

    assert!(matches!(r.machine.publish_at(&a, t0).await.unwrap(), PublishOutcome::Scheduled { .. }));
    let due = r.machine.find_retryable(t0 + chrono::Duration::seconds(1), 10).await.unwrap();
    assert_eq!(due.len(), 1);

    let out = r
        .machine
        .publish_at(&a, t0 + chrono::Duration::seconds(1))
        .await
        .unwrap();
    assert!(matches!(out, PublishOutcome::Published { .. }));
    let rec = r.machine.get(a.id).await.unwrap().unwrap();
    assert_eq!(rec.attempt_count, 1);
    assert!(rec.last_error.is_none());
    assert!(r.machine.find_retryable(Utc::now() + chrono::Duration::days(1), 10).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn open_breaker_short_circuits_and_probe_recovers() {
    let r = rig(
        10,
        BreakerConfig {
            failure_threshold: 2,
            recovery_timeout: Duration::from_secs(60),
        },
    );
    r.publisher.push_error(PublishError::Transient("HTTP 500".into()));
    r.publisher.push_error(PublishError::Transient("HTTP 500".into()));
    let a = article();
    let b = Article::new("Another trailer", "", "Polygon", Utc::now());
    let t0 = Utc::now();

    r.machine.publish_at(&a, t0).await.unwrap();
    r.machine.publish_at(&b, t0).await.unwrap();
    assert_eq!(r.breaker.state(), BreakerState::Open);
    assert_eq!(r.publisher.calls(), 2);

    // Due, but the circuit refuses: the port is not touched and no budget is spent.
    let later = t0 + chrono::Duration::minutes(5);
    let out = r.machine.publish_at(&a, later).await.unwrap();
    match out {
        PublishOutcome::Scheduled { next_retry_at } => assert!(next_retry_at >= later + chrono::Duration::seconds(1)),
        other => panic!("expected scheduled, got {other:?}"),
    }
    assert_eq!(r.publisher.calls(), 2);
    assert_eq!(r.machine.get(a.id).await.unwrap().unwrap().attempt_count, 1);

    tokio::time::advance(Duration::from_secs(61)).await;

    let much_later = t0 + chrono::Duration::hours(1);
    let out = r.machine.publish_at(&a, much_later).await.unwrap();
    assert!(matches!(out, PublishOutcome::Published { .. }));
    assert_eq!(r.breaker.state(), BreakerState::Closed);
    assert_eq!(r.publisher.calls(), 3);
}

#[tokio::test]
async fn permanent_rejection_dead_letters_immediately() {
    let r = rig(3, BreakerConfig::default());
    r.publisher
        .push_error(PublishError::Permanent("HTTP 400: chat not found".into()));
    let a = article();

    let out = r.machine.publish(&a).await.unwrap();
    assert!(matches!(out, PublishOutcome::Failed { ref reason } if reason.contains("chat not found")));
    let rec = r.machine.get(a.id).await.unwrap().unwrap();
    assert_eq!(rec.attempt_count, 0);
    assert_eq!(r.breaker.state(), BreakerState::Closed);

    // Operator requeue gives it another go.
    let requeued = r.machine.requeue_failed(a.id).await.unwrap();
    assert!(matches!(requeued.state, PublicationState::Retrying { .. }));
    assert!(matches!(r.machine.publish(&a).await.unwrap(), PublishOutcome::Published { .. }));
}

#[tokio::test]
async fn concurrent_publish_of_same_article_sends_once() {
    let r = Arc::new(rig(3, BreakerConfig::default()));
    r.publisher.set_delay(Some(Duration::from_millis(50)));
    let a = article();

    let (x, y) = tokio::join!(r.machine.publish(&a), r.machine.publish(&a));
    let outcomes = [x.unwrap(), y.unwrap()];
    assert!(outcomes.contains(&PublishOutcome::InProgress));
    assert!(outcomes.iter().any(|o| matches!(o, PublishOutcome::Published { .. })));
    assert_eq!(r.publisher.calls(), 1);
}

#[tokio::test]
async fn lost_placeholders_schedule_a_retry_instead_of_publishing() {
    let publisher = Arc::new(ScriptedPublisher::new());
    let backend = Arc::new(ScriptedTranslator::fixed("Кольцо старейшин: дополнение"));
    let translator = Arc::new(EntityPreservingTranslator::new(
        backend,
        Arc::new(MemoryCache::new(8)),
        Arc::new(CircuitBreaker::new("translator", BreakerConfig::default())),
    ));
    let machine = PublicationMachine::new(
        Arc::new(MemoryStore::new()),
        publisher.clone(),
        Arc::new(CircuitBreaker::new("publisher", BreakerConfig::default())),
        RetryPolicy::default(),
    )
    .with_translation(translator, "ru");

    let a = Article::new("Elden Ring DLC", "", "IGN", Utc::now());
    let out = machine.publish(&a).await.unwrap();
    assert!(matches!(out, PublishOutcome::Scheduled { .. }));
    assert_eq!(publisher.calls(), 0);
}

#[tokio::test]
async fn translated_text_keeps_entities() {
    let publisher = Arc::new(ScriptedPublisher::new());
    let backend = Arc::new(ScriptedTranslator::fixed("Вышло дополнение для __ENT0__"));
    let translator = Arc::new(EntityPreservingTranslator::new(
        backend,
        Arc::new(MemoryCache::new(8)),
        Arc::new(CircuitBreaker::new("translator", BreakerConfig::default())),
    ));
    let machine = PublicationMachine::new(
        Arc::new(MemoryStore::new()),
        publisher.clone(),
        Arc::new(CircuitBreaker::new("publisher", BreakerConfig::default())),
        RetryPolicy::default(),
    )
    .with_translation(translator, "ru");

    let a = Article::new("Elden Ring expansion released", "", "IGN", Utc::now());
    assert!(matches!(machine.publish(&a).await.unwrap(), PublishOutcome::Published { .. }));
    let sent = publisher.sent();
    assert!(sent[0].text.contains("Вышло дополнение для Elden Ring"));
}

fn machine_over(store: Arc<FailingStore>, publisher: Arc<ScriptedPublisher>) -> PublicationMachine {
    PublicationMachine::new(
        store,
        publisher,
        Arc::new(CircuitBreaker::new("publisher", BreakerConfig::default())),
        RetryPolicy::default(),
    )
}

#[tokio::test]
async fn unrecorded_success_surfaces_as_infrastructure_error() {
    let store = Arc::new(FailingStore::new());
    let publisher = Arc::new(ScriptedPublisher::new());
    let machine = machine_over(store.clone(), publisher.clone());
    let a = article();

    store.fail_updates(true);
    let err = machine.publish(&a).await.unwrap_err();
    assert!(matches!(err, PipelineError::TransientInfrastructure(ref m) if m.contains("update_publication")));
    assert_eq!(publisher.calls(), 1);
    let rec = machine.get(a.id).await.unwrap().unwrap();
    assert_eq!(rec.state, PublicationState::Pending);
}

#[tokio::test]
async fn unrecorded_failure_surfaces_as_infrastructure_error() {
    let store = Arc::new(FailingStore::new());
    let publisher = Arc::new(ScriptedPublisher::new());
    let machine = machine_over(store.clone(), publisher.clone());

    store.fail_updates(true);
    publisher.push_error(PublishError::Transient("HTTP 503".into()));
    let a = article();
    assert!(matches!(
        machine.publish(&a).await.unwrap_err(),
        PipelineError::TransientInfrastructure(_)
    ));

    publisher.push_error(PublishError::Permanent("HTTP 400".into()));
    let b = Article::new("Another release", "", "IGN", Utc::now());
    assert!(matches!(
        machine.publish(&b).await.unwrap_err(),
        PipelineError::TransientInfrastructure(_)
    ));
    assert!(machine.list_failed(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn record_creation_failure_sends_nothing() {
    let store = Arc::new(FailingStore::new());
    let publisher = Arc::new(ScriptedPublisher::new());
    let machine = machine_over(store.clone(), publisher.clone());

    store.fail_creates(true);
    assert!(matches!(
        machine.publish(&article()).await.unwrap_err(),
        PipelineError::TransientInfrastructure(_)
    ));
    assert_eq!(publisher.calls(), 0);
}
