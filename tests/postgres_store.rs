/// PostgreSQL store tests
///
/// These require a running PostgreSQL instance and are skipped when
/// DATABASE_URL is not set. Each test uses its own identifiers so runs
/// against a shared database do not interfere.
use chrono::{Duration, Utc};
use requestguard::config::StoreConfig;
use requestguard::security::CsrfToken;
use requestguard::security::rate_limiting::MAX_SUBJECT_CHARS;
use requestguard::store::{AttemptKey, EventFilter};
use requestguard::{
    GuardConfig, PgSecurityStore, RequestContext, SecurityEvent, SecurityEventType, SecurityGuard,
    SecuritySeverity, SecurityStore, SystemClock,
};
use std::sync::Arc;
use uuid::Uuid;

async fn connect() -> Option<PgSecurityStore> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("Skipping database test - DATABASE_URL not set");
        return None;
    };

    let config = StoreConfig {
        database_url: Some(url),
        ..StoreConfig::default()
    };
    Some(PgSecurityStore::connect(&config).await.expect("Failed to connect"))
}

#[tokio::test(flavor = "multi_thread")]
async fn test_upsert_increment_is_atomic() {
    let Some(store) = connect().await else {
        return;
    };
    let store = Arc::new(store);
    let key = AttemptKey::new(format!("pg-{}", Uuid::new_v4()), "login");
    let now = Utc::now();

    let handles: Vec<_> = (0..20)
        .map(|_| {
            let store = store.clone();
            let key = key.clone();
            tokio::spawn(async move { store.upsert_increment(&key, "8.8.8.8", now).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().expect("upsert failed");
    }

    let counter = store.get_counter(&key).await.unwrap().unwrap();
    assert_eq!(counter.attempts_count, 20);

    store.set_block(&key, now + Duration::minutes(15)).await.unwrap();
    assert_eq!(
        store.purge_stale_counters("login", now + Duration::seconds(1), now).await.unwrap(),
        0
    );
    store.delete_counter(&key).await.unwrap();
    assert!(store.get_counter(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn test_event_round_trip_and_filters() {
    let Some(store) = connect().await else {
        return;
    };
    let ip = format!("pg-{}", Uuid::new_v4());

    for severity in [SecuritySeverity::Low, SecuritySeverity::High, SecuritySeverity::Critical] {
        let mut event = SecurityEvent::new(SecurityEventType::SqlInjection, severity, "fixture".to_string());
        event.ip_address = ip.clone();
        event.user_agent = Some("tests".to_string());
        store.insert_event(&event).await.unwrap();
    }

    let filter = EventFilter::default()
        .ip_address(ip.clone())
        .min_severity(SecuritySeverity::High);
    assert_eq!(store.count_events(&filter).await.unwrap(), 2);

    let events = store.query_events(&filter.clone().limit(1)).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, SecurityEventType::SqlInjection);
    assert_eq!(events[0].user_agent.as_deref(), Some("tests"));
}

#[tokio::test]
async fn test_csrf_compare_and_delete() {
    let Some(store) = connect().await else {
        return;
    };
    let session = format!("pg-{}", Uuid::new_v4());
    let now = Utc::now();
    let token = CsrfToken {
        form_name: "booking".to_string(),
        token: "pg-token".to_string(),
        created_at: now,
        expires_at: now + Duration::hours(1),
    };

    store.set_csrf_token(&session, "booking", &token).await.unwrap();
    assert_eq!(
        store.get_csrf_token(&session, "booking").await.unwrap().map(|t| t.token),
        Some("pg-token".to_string())
    );
    assert!(!store.consume_csrf_token(&session, "booking", "other").await.unwrap());
    assert!(store.consume_csrf_token(&session, "booking", "pg-token").await.unwrap());
    assert!(!store.consume_csrf_token(&session, "booking", "pg-token").await.unwrap());
}

#[tokio::test]
async fn test_long_identifier_is_counted() {
    let Some(store) = connect().await else {
        return;
    };
    let store = Arc::new(store);
    let guard = SecurityGuard::new(GuardConfig::default(), store.clone(), Arc::new(SystemClock))
        .expect("default configuration is valid");
    let ctx = RequestContext::new("8.8.4.4");
    let identifier = format!("{}{}", Uuid::new_v4(), "a".repeat(300));

    for _ in 0..2 {
        guard.record_attempt(&ctx, "contact_form", Some(&identifier), false).await;
    }

    let stored: String = identifier.chars().take(MAX_SUBJECT_CHARS).collect();
    let counter = store
        .get_counter(&AttemptKey::new(stored.clone(), "contact_form"))
        .await
        .unwrap()
        .expect("counter was not written");
    assert_eq!(counter.attempts_count, 2);

    guard.record_attempt(&ctx, "contact_form", Some(&identifier), false).await;
    assert!(!guard.check_rate_limit(&ctx, "contact_form", Some(&identifier)).await.allowed);
    store.delete_counter(&AttemptKey::new(stored, "contact_form")).await.unwrap();
}
