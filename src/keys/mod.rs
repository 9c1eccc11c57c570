//! Multi-key registry with rotation, per-day quotas, and cooldowns.
//!
//! Every outbound call borrows one key for its duration: `acquire` reserves
//! a quota unit, `record` settles the reservation with the observed outcome.
//! Counters are serialized behind one lock so two tasks hitting the same key
//! always observe record() effects in call order, and every mutation is
//! written through to the persistent per-day ledger.

pub mod quota_store;

use std::sync::Arc;
use std::sync::Mutex;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use chrono_tz::Tz;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::BatchError;
use crate::providers::Provider;
use quota_store::{KeyLedgerRow, QuotaStore};

/// Consecutive transient errors before a key is pulled from rotation.
const MAX_CONSECUTIVE_ERRORS: u32 = 5;
/// Cooldown after the provider reports a rate limit.
const RATE_LIMIT_COOLDOWN_MINS: i64 = 60;
/// Cooldown before an error-disabled key becomes probe-eligible.
const ERROR_COOLDOWN_MINS: i64 = 30;

/// Dispensing state of one credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Active,
    Cooling,
    Exhausted,
    Disabled,
}

impl KeyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyState::Active => "active",
            KeyState::Cooling => "cooling",
            KeyState::Exhausted => "exhausted",
            KeyState::Disabled => "disabled",
        }
    }

    fn from_str(s: &str) -> KeyState {
        match s {
            "cooling" => KeyState::Cooling,
            "exhausted" => KeyState::Exhausted,
            "disabled" => KeyState::Disabled,
            _ => KeyState::Active,
        }
    }
}

/// Classified outcome of one call made with a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOutcome {
    Ok,
    RateLimited,
    TransientError,
    AuthError,
}

#[derive(Debug, Clone)]
struct ApiKey {
    secret: String,
    hash: String,
    quota: u32,
    usage: u32,
    /// In-flight reservations not yet settled by record().
    pending: u32,
    consecutive_errors: u32,
    total_calls: u64,
    total_successes: u64,
    state: KeyState,
    cooldown_until: Option<DateTime<Utc>>,
    last_used: Option<DateTime<Utc>>,
}

impl ApiKey {
    fn new(secret: String, quota: u32) -> Self {
        let hash = fingerprint(&secret);
        Self {
            secret,
            hash,
            quota,
            usage: 0,
            pending: 0,
            consecutive_errors: 0,
            total_calls: 0,
            total_successes: 0,
            state: KeyState::Active,
            cooldown_until: None,
            last_used: None,
        }
    }

    fn dispensable(&self, now: DateTime<Utc>) -> bool {
        self.state == KeyState::Active
            && self.usage + self.pending < self.quota
            && self.cooldown_until.map(|t| t <= now).unwrap_or(true)
    }

    fn ledger_row(&self) -> KeyLedgerRow {
        KeyLedgerRow {
            key_hash: self.hash.clone(),
            usage: self.usage,
            consecutive_errors: self.consecutive_errors,
            total_calls: self.total_calls,
            total_successes: self.total_successes,
            state: self.state.as_str().to_string(),
            cooldown_until: self.cooldown_until.map(|t| t.to_rfc3339()),
        }
    }
}

/// A key borrowed for one call. Carries the secret for request signing and
/// the fingerprint for everything that gets logged or stored.
#[derive(Debug, Clone)]
pub struct KeyLease {
    pub provider: Provider,
    pub secret: String,
    pub hash: String,
    pub remaining: u32,
}

/// Observability view of one key. No secrets.
#[derive(Debug, Clone)]
pub struct KeySnapshot {
    pub hash: String,
    pub state: KeyState,
    pub usage: u32,
    pub quota: u32,
    pub consecutive_errors: u32,
    pub total_calls: u64,
    pub total_successes: u64,
    pub last_used: Option<DateTime<Utc>>,
}

/// Aggregated registry stats for the operator surface.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    pub day: NaiveDate,
    pub kto: Vec<KeySnapshot>,
    pub kma: Vec<KeySnapshot>,
}

struct ProviderKeys {
    rotation: usize,
    keys: Vec<ApiKey>,
}

struct Inner {
    day: NaiveDate,
    kto: ProviderKeys,
    kma: ProviderKeys,
}

impl Inner {
    fn lane_mut(&mut self, provider: Provider) -> &mut ProviderKeys {
        match provider {
            Provider::Kto => &mut self.kto,
            Provider::Kma => &mut self.kma,
        }
    }
}

/// Owns every credential and its quota accounting.
pub struct KeyRegistry {
    tz: Tz,
    store: Arc<dyn QuotaStore>,
    inner: Mutex<Inner>,
}

impl KeyRegistry {
    pub fn new(
        tz: Tz,
        kto_secrets: &[String],
        kto_quota: u32,
        kma_secrets: &[String],
        kma_quota: u32,
        store: Arc<dyn QuotaStore>,
    ) -> Self {
        let day = Utc::now().with_timezone(&tz).date_naive();
        let mut inner = Inner {
            day,
            kto: ProviderKeys {
                rotation: 0,
                keys: kto_secrets
                    .iter()
                    .map(|s| ApiKey::new(s.clone(), kto_quota))
                    .collect(),
            },
            kma: ProviderKeys {
                rotation: 0,
                keys: kma_secrets
                    .iter()
                    .map(|s| ApiKey::new(s.clone(), kma_quota))
                    .collect(),
            },
        };

        let day_str = day.to_string();
        for provider in [Provider::Kto, Provider::Kma] {
            match store.load_day(provider, &day_str) {
                Ok(rows) => {
                    let lane = inner.lane_mut(provider);
                    for row in rows {
                        if let Some(key) = lane.keys.iter_mut().find(|k| k.hash == row.key_hash) {
                            key.usage = row.usage;
                            key.consecutive_errors = row.consecutive_errors;
                            key.total_calls = row.total_calls;
                            key.total_successes = row.total_successes;
                            key.state = KeyState::from_str(&row.state);
                            key.cooldown_until = row
                                .cooldown_until
                                .as_deref()
                                .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                                .map(|t| t.with_timezone(&Utc));
                        }
                    }
                }
                Err(e) => warn!("quota ledger hydration failed for {provider}: {e}"),
            }
        }
        if let Err(e) = store.purge_before(&day_str) {
            warn!("quota ledger purge failed: {e}");
        }

        info!(
            "key registry ready: {} KTO, {} KMA key(s), quota day {}",
            inner.kto.keys.len(),
            inner.kma.keys.len(),
            day
        );

        Self {
            tz,
            store,
            inner: Mutex::new(inner),
        }
    }

    /// Reserve the next usable key, round-robin from the rotation index.
    pub fn acquire(&self, provider: Provider) -> Result<KeyLease, BatchError> {
        let now = Utc::now();
        let mut inner = self.inner.lock().expect("key registry lock poisoned");
        self.roll_day(&mut inner);
        let lane = inner.lane_mut(provider);

        if lane.keys.is_empty() {
            return Err(BatchError::QuotaExhausted { provider });
        }

        let len = lane.keys.len();
        let start = lane.rotation;
        for offset in 0..len {
            let idx = (start + offset) % len;
            let key = &mut lane.keys[idx];

            // Cooling keys return to rotation once the cooldown lapses.
            if key.state == KeyState::Cooling
                && key.cooldown_until.map(|t| t <= now).unwrap_or(true)
            {
                key.state = KeyState::Active;
                key.cooldown_until = None;
            }

            if key.dispensable(now) {
                key.pending += 1;
                let lease = KeyLease {
                    provider,
                    secret: key.secret.clone(),
                    hash: key.hash.clone(),
                    remaining: key.quota - key.usage - key.pending,
                };
                debug!(
                    "dispensed {provider} key {} (usage {}/{})",
                    key.hash, key.usage, key.quota
                );
                lane.rotation = (idx + 1) % len;
                return Ok(lease);
            }
        }

        // Distinguish "all cooling down" from a genuinely spent day.
        let all_cooling = lane
            .keys
            .iter()
            .all(|k| k.state == KeyState::Cooling && k.cooldown_until.map(|t| t > now).unwrap_or(false));
        if all_cooling {
            Err(BatchError::RateLimited { provider })
        } else {
            Err(BatchError::QuotaExhausted { provider })
        }
    }

    /// Settle a reservation with the classified call outcome.
    pub fn record(&self, provider: Provider, key_hash: &str, outcome: KeyOutcome) {
        let now = Utc::now();
        let mut inner = self.inner.lock().expect("key registry lock poisoned");
        self.roll_day(&mut inner);
        let day = inner.day.to_string();
        let lane = inner.lane_mut(provider);

        let Some(key) = lane.keys.iter_mut().find(|k| k.hash == key_hash) else {
            warn!("record() for unknown {provider} key {key_hash}");
            return;
        };

        key.pending = key.pending.saturating_sub(1);
        key.total_calls += 1;

        match outcome {
            KeyOutcome::Ok => {
                key.usage += 1;
                key.consecutive_errors = 0;
                key.total_successes += 1;
                key.last_used = Some(now);
                if key.usage >= key.quota {
                    key.state = KeyState::Exhausted;
                    key.cooldown_until = None;
                    info!("{provider} key {} exhausted its daily quota", key.hash);
                }
            }
            KeyOutcome::RateLimited => {
                key.state = KeyState::Cooling;
                key.cooldown_until = Some(now + Duration::minutes(RATE_LIMIT_COOLDOWN_MINS));
                warn!(
                    "{provider} key {} rate limited, cooling until {:?}",
                    key.hash, key.cooldown_until
                );
            }
            KeyOutcome::TransientError => {
                key.consecutive_errors += 1;
                if key.consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    key.state = KeyState::Disabled;
                    key.cooldown_until = Some(now + Duration::minutes(ERROR_COOLDOWN_MINS));
                    warn!(
                        "{provider} key {} disabled after {} consecutive errors",
                        key.hash, key.consecutive_errors
                    );
                }
            }
            KeyOutcome::AuthError => {
                key.state = KeyState::Disabled;
                key.cooldown_until = None;
                warn!(
                    "{provider} key {} disabled: credential rejected, manual reactivation required",
                    key.hash
                );
            }
        }

        let row = key.ledger_row();
        if let Err(e) = self.store.write_through(provider, &day, &row) {
            warn!("quota ledger write failed for {provider} key {key_hash}: {e}");
        }
    }

    /// Error-disabled keys whose cooldown elapsed, eligible for a probe.
    /// Keys disabled by an auth rejection never appear here.
    pub fn probe_candidates(&self, provider: Provider) -> Vec<KeyLease> {
        let now = Utc::now();
        let mut inner = self.inner.lock().expect("key registry lock poisoned");
        let lane = inner.lane_mut(provider);
        lane.keys
            .iter()
            .filter(|k| {
                k.state == KeyState::Disabled
                    && k.cooldown_until.map(|t| t <= now).unwrap_or(false)
            })
            .map(|k| KeyLease {
                provider,
                secret: k.secret.clone(),
                hash: k.hash.clone(),
                remaining: k.quota.saturating_sub(k.usage),
            })
            .collect()
    }

    /// Return a probed key to rotation.
    pub fn reactivate(&self, provider: Provider, key_hash: &str) {
        let mut inner = self.inner.lock().expect("key registry lock poisoned");
        let day = inner.day.to_string();
        let lane = inner.lane_mut(provider);
        if let Some(key) = lane.keys.iter_mut().find(|k| k.hash == key_hash) {
            key.state = KeyState::Active;
            key.consecutive_errors = 0;
            key.cooldown_until = None;
            info!("{provider} key {} reactivated", key.hash);
            let row = key.ledger_row();
            if let Err(e) = self.store.write_through(provider, &day, &row) {
                warn!("quota ledger write failed for {provider} key {key_hash}: {e}");
            }
        }
    }

    /// Push a failed probe's cooldown forward.
    pub fn defer_probe(&self, provider: Provider, key_hash: &str) {
        let mut inner = self.inner.lock().expect("key registry lock poisoned");
        let lane = inner.lane_mut(provider);
        if let Some(key) = lane.keys.iter_mut().find(|k| k.hash == key_hash) {
            key.cooldown_until = Some(Utc::now() + Duration::minutes(ERROR_COOLDOWN_MINS));
        }
    }

    /// Aggregated stats. Hash fingerprints only.
    pub fn snapshot(&self) -> RegistrySnapshot {
        let inner = self.inner.lock().expect("key registry lock poisoned");
        let view = |keys: &[ApiKey]| {
            keys.iter()
                .map(|k| KeySnapshot {
                    hash: k.hash.clone(),
                    state: k.state,
                    usage: k.usage,
                    quota: k.quota,
                    consecutive_errors: k.consecutive_errors,
                    total_calls: k.total_calls,
                    total_successes: k.total_successes,
                    last_used: k.last_used,
                })
                .collect()
        };
        RegistrySnapshot {
            day: inner.day,
            kto: view(&inner.kto.keys),
            kma: view(&inner.kma.keys),
        }
    }

    /// Reset counters when the local calendar day changes.
    fn roll_day(&self, inner: &mut Inner) {
        let today = Utc::now().with_timezone(&self.tz).date_naive();
        if today == inner.day {
            return;
        }
        info!("quota day boundary crossed: {} -> {}", inner.day, today);
        inner.day = today;
        let day = today.to_string();

        for provider in [Provider::Kto, Provider::Kma] {
            let lane = inner.lane_mut(provider);
            for key in &mut lane.keys {
                key.usage = 0;
                key.consecutive_errors = 0;
                match key.state {
                    KeyState::Exhausted => {
                        key.state = KeyState::Active;
                        key.cooldown_until = None;
                    }
                    KeyState::Cooling => {
                        if key.cooldown_until.map(|t| t <= Utc::now()).unwrap_or(true) {
                            key.state = KeyState::Active;
                            key.cooldown_until = None;
                        }
                    }
                    KeyState::Active | KeyState::Disabled => {}
                }
                let row = key.ledger_row();
                if let Err(e) = self.store.write_through(provider, &day, &row) {
                    warn!("quota ledger write failed at day roll: {e}");
                }
            }
        }
        if let Err(e) = self.store.purge_before(&day) {
            warn!("quota ledger purge failed: {e}");
        }
    }

    #[cfg(test)]
    fn set_day(&self, day: NaiveDate) {
        self.inner.lock().unwrap().day = day;
    }

    #[cfg(test)]
    fn set_cooldown(&self, provider: Provider, key_hash: &str, until: DateTime<Utc>) {
        let mut inner = self.inner.lock().unwrap();
        let lane = inner.lane_mut(provider);
        if let Some(key) = lane.keys.iter_mut().find(|k| k.hash == key_hash) {
            key.cooldown_until = Some(until);
        }
    }
}

/// Short, stable fingerprint of a secret. Safe to log and persist.
pub fn fingerprint(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::quota_store::{MemoryQuotaStore, SqliteQuotaStore};
    use super::*;

    fn registry_with(kto_secrets: &[&str], quota: u32) -> KeyRegistry {
        let secrets: Vec<String> = kto_secrets.iter().map(|s| s.to_string()).collect();
        KeyRegistry::new(
            chrono_tz::Asia::Seoul,
            &secrets,
            quota,
            &[],
            quota,
            Arc::new(MemoryQuotaStore::new()),
        )
    }

    #[test]
    fn fingerprint_is_stable_and_short() {
        let a = fingerprint("secret-a");
        assert_eq!(a.len(), 16);
        assert_eq!(a, fingerprint("secret-a"));
        assert_ne!(a, fingerprint("secret-b"));
    }

    #[test]
    fn rotation_distributes_usage_across_keys() {
        let registry = registry_with(&["key-a", "key-b"], 1000);
        for _ in 0..6 {
            let lease = registry.acquire(Provider::Kto).unwrap();
            registry.record(Provider::Kto, &lease.hash, KeyOutcome::Ok);
        }
        let snap = registry.snapshot();
        let usages: Vec<u32> = snap.kto.iter().map(|k| k.usage).collect();
        assert_eq!(usages.iter().sum::<u32>(), 6);
        assert!(usages.iter().max().unwrap() - usages.iter().min().unwrap() <= 1);
    }

    #[test]
    fn usage_equals_ok_outcomes() {
        let registry = registry_with(&["key-a", "key-b"], 1000);
        let mut ok = 0;
        for i in 0..10 {
            let lease = registry.acquire(Provider::Kto).unwrap();
            if i % 3 == 0 {
                registry.record(Provider::Kto, &lease.hash, KeyOutcome::TransientError);
            } else {
                registry.record(Provider::Kto, &lease.hash, KeyOutcome::Ok);
                ok += 1;
            }
        }
        let snap = registry.snapshot();
        assert_eq!(snap.kto.iter().map(|k| k.usage).sum::<u32>(), ok);
    }

    #[test]
    fn rate_limited_key_cools_and_rotation_skips_it() {
        let registry = registry_with(&["key-a", "key-b"], 1000);
        let first = registry.acquire(Provider::Kto).unwrap();
        registry.record(Provider::Kto, &first.hash, KeyOutcome::RateLimited);

        let snap = registry.snapshot();
        let cooled = snap.kto.iter().find(|k| k.hash == first.hash).unwrap();
        assert_eq!(cooled.state, KeyState::Cooling);

        // The other key keeps serving.
        for _ in 0..3 {
            let lease = registry.acquire(Provider::Kto).unwrap();
            assert_ne!(lease.hash, first.hash);
            registry.record(Provider::Kto, &lease.hash, KeyOutcome::Ok);
        }
    }

    #[test]
    fn five_transient_errors_disable_a_key() {
        let registry = registry_with(&["only"], 1000);
        for _ in 0..5 {
            let lease = registry.acquire(Provider::Kto).unwrap();
            registry.record(Provider::Kto, &lease.hash, KeyOutcome::TransientError);
        }
        let snap = registry.snapshot();
        assert_eq!(snap.kto[0].state, KeyState::Disabled);
        assert!(matches!(
            registry.acquire(Provider::Kto),
            Err(BatchError::QuotaExhausted { .. })
        ));
    }

    #[test]
    fn auth_error_disables_without_probe_eligibility() {
        let registry = registry_with(&["only"], 1000);
        let lease = registry.acquire(Provider::Kto).unwrap();
        registry.record(Provider::Kto, &lease.hash, KeyOutcome::AuthError);
        assert!(registry.probe_candidates(Provider::Kto).is_empty());
    }

    #[test]
    fn error_disabled_key_becomes_probe_candidate_after_cooldown() {
        let registry = registry_with(&["only"], 1000);
        for _ in 0..5 {
            let lease = registry.acquire(Provider::Kto).unwrap();
            registry.record(Provider::Kto, &lease.hash, KeyOutcome::TransientError);
        }
        assert!(registry.probe_candidates(Provider::Kto).is_empty());

        let hash = registry.snapshot().kto[0].hash.clone();
        registry.set_cooldown(Provider::Kto, &hash, Utc::now() - Duration::minutes(1));
        let candidates = registry.probe_candidates(Provider::Kto);
        assert_eq!(candidates.len(), 1);

        registry.reactivate(Provider::Kto, &hash);
        assert!(registry.acquire(Provider::Kto).is_ok());
    }

    #[test]
    fn quota_exhaustion_after_quota_ok_calls() {
        let registry = registry_with(&["only"], 5);
        for _ in 0..5 {
            let lease = registry.acquire(Provider::Kto).unwrap();
            registry.record(Provider::Kto, &lease.hash, KeyOutcome::Ok);
        }
        assert!(matches!(
            registry.acquire(Provider::Kto),
            Err(BatchError::QuotaExhausted { .. })
        ));
    }

    #[test]
    fn last_quota_unit_is_reserved_once() {
        let registry = registry_with(&["only"], 1);
        let first = registry.acquire(Provider::Kto);
        assert!(first.is_ok());
        // The reservation is still pending, nothing recorded yet.
        assert!(matches!(
            registry.acquire(Provider::Kto),
            Err(BatchError::QuotaExhausted { .. })
        ));
    }

    #[test]
    fn midnight_boundary_resets_usage() {
        let registry = registry_with(&["only"], 3);
        for _ in 0..3 {
            let lease = registry.acquire(Provider::Kto).unwrap();
            registry.record(Provider::Kto, &lease.hash, KeyOutcome::Ok);
        }
        assert!(registry.acquire(Provider::Kto).is_err());

        registry.set_day(NaiveDate::from_ymd_opt(2020, 1, 1).unwrap());
        let lease = registry.acquire(Provider::Kto).unwrap();
        assert_eq!(lease.remaining, 2);
        let snap = registry.snapshot();
        assert_eq!(snap.kto[0].usage, 0);
    }

    #[test]
    fn usage_survives_restart_through_the_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quota.db");
        let secrets = vec!["persisted".to_string()];

        {
            let store = Arc::new(SqliteQuotaStore::open(&path).unwrap());
            let registry =
                KeyRegistry::new(chrono_tz::Asia::Seoul, &secrets, 100, &[], 100, store);
            for _ in 0..7 {
                let lease = registry.acquire(Provider::Kto).unwrap();
                registry.record(Provider::Kto, &lease.hash, KeyOutcome::Ok);
            }
        }

        let store = Arc::new(SqliteQuotaStore::open(&path).unwrap());
        let registry = KeyRegistry::new(chrono_tz::Asia::Seoul, &secrets, 100, &[], 100, store);
        let snap = registry.snapshot();
        assert_eq!(snap.kto[0].usage, 7);
        assert_eq!(snap.kto[0].total_successes, 7);
    }
}
