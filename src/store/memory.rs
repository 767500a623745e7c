use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::{Mutex, RwLock};

use super::{AttemptKey, EventFilter, SecurityStore};
use crate::error::GuardResult;
use crate::security::audit::{IpActivity, SecurityEvent, SecurityEventType};
use crate::security::csrf::CsrfToken;
use crate::security::rate_limiting::AttemptCounter;

type CsrfKey = (String, String);

/// In-process store for tests and single-instance deployments.
///
/// Each collection sits behind its own lock, and every read-modify-write
/// happens under one write guard, which gives the same atomicity as the
/// upsert and compare-and-delete statements of the SQL store.
#[derive(Default)]
pub struct MemorySecurityStore {
    counters: Mutex<HashMap<AttemptKey, AttemptCounter>>,
    events: RwLock<Vec<SecurityEvent>>,
    csrf_tokens: Mutex<HashMap<CsrfKey, CsrfToken>>,
}

impl MemorySecurityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn csrf_key(session_id: &str, form_name: &str) -> CsrfKey {
    (session_id.to_string(), form_name.to_string())
}

#[async_trait]
impl SecurityStore for MemorySecurityStore {
    async fn upsert_increment(
        &self,
        key: &AttemptKey,
        ip_address: &str,
        now: DateTime<Utc>,
    ) -> GuardResult<AttemptCounter> {
        let mut counters = self.counters.lock().await;
        let counter = counters
            .entry(key.clone())
            .and_modify(|c| {
                c.attempts_count += 1;
                c.last_attempt_at = now;
            })
            .or_insert_with(|| AttemptCounter {
                ip_address: ip_address.to_string(),
                identifier: key.identifier.clone(),
                action: key.action.clone(),
                attempts_count: 1,
                first_attempt_at: now,
                last_attempt_at: now,
                blocked_until: None,
            });
        Ok(counter.clone())
    }

    async fn get_counter(&self, key: &AttemptKey) -> GuardResult<Option<AttemptCounter>> {
        Ok(self.counters.lock().await.get(key).cloned())
    }

    async fn delete_counter(&self, key: &AttemptKey) -> GuardResult<()> {
        self.counters.lock().await.remove(key);
        Ok(())
    }

    async fn set_block(&self, key: &AttemptKey, until: DateTime<Utc>) -> GuardResult<()> {
        if let Some(counter) = self.counters.lock().await.get_mut(key) {
            counter.blocked_until = Some(until);
        }
        Ok(())
    }

    async fn purge_stale_counters(
        &self,
        action: &str,
        window_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> GuardResult<u64> {
        let mut counters = self.counters.lock().await;
        let before = counters.len();
        counters.retain(|_, c| {
            !(c.action == action && c.first_attempt_at < window_start && !c.is_blocked_at(now))
        });
        Ok((before - counters.len()) as u64)
    }

    async fn purge_counters_before(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> GuardResult<u64> {
        let mut counters = self.counters.lock().await;
        let before = counters.len();
        counters.retain(|_, c| !(c.last_attempt_at < cutoff && !c.is_blocked_at(now)));
        Ok((before - counters.len()) as u64)
    }

    async fn insert_event(&self, event: &SecurityEvent) -> GuardResult<()> {
        self.events.write().await.push(event.clone());
        Ok(())
    }

    async fn query_events(&self, filter: &EventFilter) -> GuardResult<Vec<SecurityEvent>> {
        let events = self.events.read().await;
        let mut matched: Vec<SecurityEvent> = events.iter().filter(|e| filter.matches(e)).cloned().collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    async fn count_events(&self, filter: &EventFilter) -> GuardResult<u64> {
        let events = self.events.read().await;
        Ok(events.iter().filter(|e| filter.matches(e)).count() as u64)
    }

    async fn count_events_by_type(
        &self,
        since: DateTime<Utc>,
    ) -> GuardResult<Vec<(SecurityEventType, u64)>> {
        let events = self.events.read().await;
        let mut counts: BTreeMap<SecurityEventType, u64> = BTreeMap::new();
        for event in events.iter().filter(|e| e.created_at >= since) {
            *counts.entry(event.event_type).or_insert(0) += 1;
        }
        Ok(counts.into_iter().collect())
    }

    async fn top_ips(&self, since: DateTime<Utc>, limit: usize) -> GuardResult<Vec<IpActivity>> {
        let events = self.events.read().await;
        let mut counts: HashMap<&str, u64> = HashMap::new();
        for event in events.iter().filter(|e| e.created_at >= since) {
            *counts.entry(event.ip_address.as_str()).or_insert(0) += 1;
        }

        let mut activity: Vec<IpActivity> = counts
            .into_iter()
            .map(|(ip, count)| IpActivity {
                ip_address: ip.to_string(),
                event_count: count,
            })
            .collect();
        activity.sort_by(|a, b| {
            b.event_count
                .cmp(&a.event_count)
                .then_with(|| a.ip_address.cmp(&b.ip_address))
        });
        activity.truncate(limit);
        Ok(activity)
    }

    async fn purge_events_before(&self, cutoff: DateTime<Utc>) -> GuardResult<u64> {
        let mut events = self.events.write().await;
        let before = events.len();
        events.retain(|e| e.created_at >= cutoff);
        Ok((before - events.len()) as u64)
    }

    async fn set_csrf_token(
        &self,
        session_id: &str,
        form_name: &str,
        token: &CsrfToken,
    ) -> GuardResult<()> {
        self.csrf_tokens
            .lock()
            .await
            .insert(csrf_key(session_id, form_name), token.clone());
        Ok(())
    }

    async fn get_csrf_token(
        &self,
        session_id: &str,
        form_name: &str,
    ) -> GuardResult<Option<CsrfToken>> {
        Ok(self
            .csrf_tokens
            .lock()
            .await
            .get(&csrf_key(session_id, form_name))
            .cloned())
    }

    async fn consume_csrf_token(
        &self,
        session_id: &str,
        form_name: &str,
        token: &str,
    ) -> GuardResult<bool> {
        let mut tokens = self.csrf_tokens.lock().await;
        let key = csrf_key(session_id, form_name);
        match tokens.get(&key) {
            Some(stored) if stored.token == token => {
                tokens.remove(&key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn purge_expired_csrf_tokens(&self, now: DateTime<Utc>) -> GuardResult<u64> {
        let mut tokens = self.csrf_tokens.lock().await;
        let before = tokens.len();
        tokens.retain(|_, t| !t.is_expired_at(now));
        Ok((before - tokens.len()) as u64)
    }
}
