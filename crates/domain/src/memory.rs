//! Process-local adapters for every port. Used by tests and by the
//! `memory` storage backend.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use time::{Date, OffsetDateTime};
use tokio::sync::{Notify, RwLock};

use crate::DomainResult;
use crate::error::DomainError;
use crate::ports::BoxFuture;
use crate::ports::counters::CounterStore;
use crate::ports::documents::{DocumentRecord, DocumentSource};
use crate::ports::idempotency::{
    IdempotencyError, IdempotencyRecord, IdempotencyStore, PutOutcome,
};
use crate::ports::jobs::{JobEnvelope, JobQueue, JobQueueError, QueueSnapshot};
use crate::ports::lock::{LockError, LockLease, LockService};
use crate::ports::reconciliation::{ReconciliationLog, ReconciliationQuery};
use crate::reconciliation::ReconciliationRecord;
use crate::stats::{CityFilter, CounterDelta, DailyCounter, HourlyCounter, StatsTotals};

fn lock_state<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct CounterState {
    daily: BTreeMap<(String, Date), DailyCounter>,
    hourly: BTreeMap<(String, OffsetDateTime), HourlyCounter>,
}

#[derive(Default)]
pub struct InMemoryCounterStore {
    state: RwLock<CounterState>,
    unavailable: AtomicBool,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail with `DomainError::Persistence` while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Test hook: overwrites a row without touching its version.
    pub async fn put_daily_raw(&self, counter: DailyCounter) {
        let mut state = self.state.write().await;
        state
            .daily
            .insert((counter.city_code.clone(), counter.date), counter);
    }

    fn check(&self) -> DomainResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DomainError::Persistence("counter store unavailable".into()));
        }
        Ok(())
    }
}

impl CounterStore for InMemoryCounterStore {
    fn get_daily(
        &self,
        city_code: &str,
        date: Date,
    ) -> BoxFuture<'_, DomainResult<Option<DailyCounter>>> {
        let key = (city_code.to_string(), date);
        Box::pin(async move {
            self.check()?;
            let state = self.state.read().await;
            Ok(state.daily.get(&key).cloned())
        })
    }

    fn upsert_daily_delta(
        &self,
        city_code: &str,
        date: Date,
        delta: &CounterDelta,
        at: OffsetDateTime,
    ) -> BoxFuture<'_, DomainResult<DailyCounter>> {
        let city_code = city_code.to_string();
        let delta = delta.clone();
        Box::pin(async move {
            self.check()?;
            let mut state = self.state.write().await;
            let key = (city_code.clone(), date);
            let next = match state.daily.get(&key) {
                Some(current) => current.with_delta(&delta, at),
                None => DailyCounter::from_delta(city_code, date, &delta, at),
            };
            state.daily.insert(key, next.clone());
            Ok(next)
        })
    }

    fn create_daily(&self, counter: &DailyCounter) -> BoxFuture<'_, DomainResult<DailyCounter>> {
        let counter = counter.clone();
        Box::pin(async move {
            self.check()?;
            let mut state = self.state.write().await;
            let key = (counter.city_code.clone(), counter.date);
            if state.daily.contains_key(&key) {
                return Err(DomainError::Conflict);
            }
            state.daily.insert(key, counter.clone());
            Ok(counter)
        })
    }

    fn update_daily_if_version(
        &self,
        counter: &DailyCounter,
        expected_version: u64,
    ) -> BoxFuture<'_, DomainResult<Option<DailyCounter>>> {
        let counter = counter.clone();
        Box::pin(async move {
            self.check()?;
            let mut state = self.state.write().await;
            let key = (counter.city_code.clone(), counter.date);
            match state.daily.get(&key) {
                Some(current) if current.version == expected_version => {
                    state.daily.insert(key, counter.clone());
                    Ok(Some(counter))
                }
                _ => Ok(None),
            }
        })
    }

    fn replace_daily(&self, counter: &DailyCounter) -> BoxFuture<'_, DomainResult<DailyCounter>> {
        let mut counter = counter.clone();
        Box::pin(async move {
            self.check()?;
            let mut state = self.state.write().await;
            let key = (counter.city_code.clone(), counter.date);
            counter.version = state
                .daily
                .get(&key)
                .map_or(1, |current| current.version + 1);
            counter.refresh_derived();
            state.daily.insert(key, counter.clone());
            Ok(counter)
        })
    }

    fn list_daily(
        &self,
        filter: &CityFilter,
        start: Date,
        end: Date,
    ) -> BoxFuture<'_, DomainResult<Vec<DailyCounter>>> {
        let filter = filter.clone();
        Box::pin(async move {
            self.check()?;
            let state = self.state.read().await;
            let mut rows: Vec<DailyCounter> = state
                .daily
                .values()
                .filter(|row| filter.allows(&row.city_code))
                .filter(|row| row.date >= start && row.date <= end)
                .cloned()
                .collect();
            rows.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.city_code.cmp(&b.city_code)));
            Ok(rows)
        })
    }

    fn bump_hourly(
        &self,
        city_code: &str,
        hour: OffsetDateTime,
        delta: &CounterDelta,
        at: OffsetDateTime,
    ) -> BoxFuture<'_, DomainResult<HourlyCounter>> {
        let city_code = city_code.to_string();
        let delta = delta.clone();
        Box::pin(async move {
            self.check()?;
            let mut state = self.state.write().await;
            let row = state
                .hourly
                .entry((city_code.clone(), hour))
                .or_insert_with(|| HourlyCounter {
                    city_code,
                    hour,
                    totals: StatsTotals::default(),
                    last_updated_at: at,
                });
            row.totals.apply(&delta);
            row.last_updated_at = at;
            Ok(row.clone())
        })
    }

    fn list_hourly(
        &self,
        filter: &CityFilter,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> BoxFuture<'_, DomainResult<Vec<HourlyCounter>>> {
        let filter = filter.clone();
        Box::pin(async move {
            self.check()?;
            let state = self.state.read().await;
            let mut rows: Vec<HourlyCounter> = state
                .hourly
                .values()
                .filter(|row| filter.allows(&row.city_code))
                .filter(|row| row.hour >= start && row.hour < end)
                .cloned()
                .collect();
            rows.sort_by(|a, b| a.hour.cmp(&b.hour).then_with(|| a.city_code.cmp(&b.city_code)));
            Ok(rows)
        })
    }

    fn list_city_codes(&self) -> BoxFuture<'_, DomainResult<Vec<String>>> {
        Box::pin(async move {
            self.check()?;
            let state = self.state.read().await;
            let mut cities: Vec<String> = state
                .daily
                .keys()
                .map(|(city, _)| city.clone())
                .collect();
            cities.dedup();
            Ok(cities)
        })
    }
}

#[derive(Default)]
pub struct InMemoryLockService {
    held: Mutex<HashMap<String, (String, Instant)>>,
    unavailable: AtomicBool,
}

impl InMemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Keys with an unexpired lease, sorted.
    pub fn held_keys(&self) -> Vec<String> {
        let now = Instant::now();
        let held = lock_state(&self.held);
        let mut keys: Vec<String> = held
            .iter()
            .filter(|(_, (_, expires_at))| *expires_at > now)
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    fn check(&self) -> Result<(), LockError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LockError::Unavailable("lock service unavailable".into()));
        }
        Ok(())
    }
}

impl LockService for InMemoryLockService {
    fn try_acquire(
        &self,
        key: &str,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<Option<LockLease>, LockError>> {
        let key = key.to_string();
        Box::pin(async move {
            self.check()?;
            let now = Instant::now();
            let mut held = lock_state(&self.held);
            if let Some((_, expires_at)) = held.get(&key) {
                if *expires_at > now {
                    return Ok(None);
                }
            }
            let token = crate::util::uuid_v7_without_dashes();
            held.insert(key.clone(), (token.clone(), now + ttl));
            Ok(Some(LockLease { key, token }))
        })
    }

    fn release(&self, lease: &LockLease) -> BoxFuture<'_, Result<bool, LockError>> {
        let lease = lease.clone();
        Box::pin(async move {
            self.check()?;
            let now = Instant::now();
            let mut held = lock_state(&self.held);
            match held.get(&lease.key) {
                Some((token, expires_at)) if *token == lease.token => {
                    let live = *expires_at > now;
                    held.remove(&lease.key);
                    Ok(live)
                }
                _ => Ok(false),
            }
        })
    }
}

#[derive(Default)]
pub struct InMemoryIdempotencyStore {
    entries: Mutex<HashMap<String, (IdempotencyRecord, Option<Instant>)>>,
    unavailable: AtomicBool,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), IdempotencyError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(IdempotencyError::Unavailable(
                "idempotency store unavailable".into(),
            ));
        }
        Ok(())
    }

    fn expiry(ttl: Duration) -> Option<Instant> {
        if ttl.is_zero() {
            None
        } else {
            Some(Instant::now() + ttl)
        }
    }
}

impl IdempotencyStore for InMemoryIdempotencyStore {
    fn put_if_absent(
        &self,
        key: &str,
        record: &IdempotencyRecord,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<PutOutcome, IdempotencyError>> {
        let key = key.to_string();
        let record = record.clone();
        Box::pin(async move {
            self.check()?;
            let now = Instant::now();
            let mut entries = lock_state(&self.entries);
            if let Some((existing, expires_at)) = entries.get(&key) {
                if expires_at.is_none_or(|deadline| deadline > now) {
                    return Ok(PutOutcome::Existing(existing.clone()));
                }
            }
            entries.insert(key, (record, Self::expiry(ttl)));
            Ok(PutOutcome::Stored)
        })
    }

    fn update(
        &self,
        key: &str,
        record: &IdempotencyRecord,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<(), IdempotencyError>> {
        let key = key.to_string();
        let record = record.clone();
        Box::pin(async move {
            self.check()?;
            lock_state(&self.entries).insert(key, (record, Self::expiry(ttl)));
            Ok(())
        })
    }

    fn remove(&self, key: &str) -> BoxFuture<'_, Result<(), IdempotencyError>> {
        let key = key.to_string();
        Box::pin(async move {
            self.check()?;
            lock_state(&self.entries).remove(&key);
            Ok(())
        })
    }
}

#[derive(Default)]
pub struct InMemoryDocumentSource {
    documents: RwLock<Vec<DocumentRecord>>,
}

impl InMemoryDocumentSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, document: DocumentRecord) {
        let mut documents = self.documents.write().await;
        documents.retain(|existing| existing.document_id != document.document_id);
        documents.push(document);
    }

    pub async fn extend(&self, documents: impl IntoIterator<Item = DocumentRecord>) {
        for document in documents {
            self.insert(document).await;
        }
    }
}

impl DocumentSource for InMemoryDocumentSource {
    fn list_documents(
        &self,
        city_code: &str,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> BoxFuture<'_, DomainResult<Vec<DocumentRecord>>> {
        let city_code = city_code.to_string();
        Box::pin(async move {
            let documents = self.documents.read().await;
            Ok(documents
                .iter()
                .filter(|doc| doc.city_code == city_code)
                .filter(|doc| doc.processed_at >= start && doc.processed_at < end)
                .cloned()
                .collect())
        })
    }

    fn list_active_cities(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> BoxFuture<'_, DomainResult<Vec<String>>> {
        Box::pin(async move {
            let documents = self.documents.read().await;
            let mut cities: Vec<String> = documents
                .iter()
                .filter(|doc| doc.processed_at >= start && doc.processed_at < end)
                .map(|doc| doc.city_code.clone())
                .collect();
            cities.sort();
            cities.dedup();
            Ok(cities)
        })
    }
}

#[derive(Default)]
pub struct InMemoryReconciliationLog {
    records: RwLock<Vec<ReconciliationRecord>>,
}

impl InMemoryReconciliationLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReconciliationLog for InMemoryReconciliationLog {
    fn append(
        &self,
        record: &ReconciliationRecord,
    ) -> BoxFuture<'_, DomainResult<ReconciliationRecord>> {
        let record = record.clone();
        Box::pin(async move {
            let mut records = self.records.write().await;
            if records
                .iter()
                .any(|existing| existing.audit_id == record.audit_id)
            {
                return Err(DomainError::Conflict);
            }
            records.push(record.clone());
            Ok(record)
        })
    }

    fn get(&self, audit_id: &str) -> BoxFuture<'_, DomainResult<Option<ReconciliationRecord>>> {
        let audit_id = audit_id.to_string();
        Box::pin(async move {
            let records = self.records.read().await;
            Ok(records
                .iter()
                .find(|record| record.audit_id == audit_id)
                .cloned())
        })
    }

    fn list(
        &self,
        query: &ReconciliationQuery,
    ) -> BoxFuture<'_, DomainResult<Vec<ReconciliationRecord>>> {
        let query = query.clone();
        Box::pin(async move {
            let records = self.records.read().await;
            let mut matched: Vec<ReconciliationRecord> = records
                .iter()
                .filter(|record| {
                    query
                        .city_code
                        .as_ref()
                        .is_none_or(|city| &record.city_code == city)
                })
                .filter(|record| query.start.is_none_or(|start| record.date >= start))
                .filter(|record| query.end.is_none_or(|end| record.date <= end))
                .cloned()
                .collect();
            matched.sort_by(|a, b| {
                b.executed_at
                    .cmp(&a.executed_at)
                    .then_with(|| b.audit_id.cmp(&a.audit_id))
            });
            if query.limit > 0 {
                matched.truncate(query.limit);
            }
            Ok(matched)
        })
    }
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<String>,
    delayed: BTreeMap<(i64, String), ()>,
    processing: Vec<String>,
    payloads: HashMap<String, JobEnvelope>,
    dedupe: HashMap<String, Instant>,
}

/// Mirrors the Redis queue layout: ready list, delayed set, processing list.
#[derive(Default)]
pub struct InMemoryJobQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    unavailable: AtomicBool,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Ready and delayed jobs, ready first.
    pub fn pending_jobs(&self) -> Vec<JobEnvelope> {
        let state = lock_state(&self.state);
        state
            .ready
            .iter()
            .chain(state.delayed.keys().map(|(_, job_id)| job_id))
            .filter_map(|job_id| state.payloads.get(job_id).cloned())
            .collect()
    }

    pub fn processing_len(&self) -> usize {
        lock_state(&self.state).processing.len()
    }

    /// Dedupe markers still held, expired or not.
    pub fn dedupe_markers(&self) -> usize {
        lock_state(&self.state).dedupe.len()
    }

    fn check(&self) -> Result<(), JobQueueError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(JobQueueError::Unavailable("job queue unavailable".into()));
        }
        Ok(())
    }

    fn push(&self, state: &mut QueueState, job: &JobEnvelope) {
        state.payloads.insert(job.job_id.clone(), job.clone());
        if job.run_at_ms <= crate::jobs::now_ms() {
            state.ready.push_back(job.job_id.clone());
            self.notify.notify_one();
        } else {
            state
                .delayed
                .insert((job.run_at_ms, job.job_id.clone()), ());
        }
    }
}

impl JobQueue for InMemoryJobQueue {
    fn enqueue(&self, job: &JobEnvelope) -> BoxFuture<'_, Result<(), JobQueueError>> {
        let job = job.clone();
        Box::pin(async move {
            self.check()?;
            let mut state = lock_state(&self.state);
            self.push(&mut state, &job);
            Ok(())
        })
    }

    fn enqueue_if_absent(
        &self,
        job: &JobEnvelope,
        dedupe_ttl_ms: u64,
    ) -> BoxFuture<'_, Result<bool, JobQueueError>> {
        let job = job.clone();
        Box::pin(async move {
            self.check()?;
            let now = Instant::now();
            let mut state = lock_state(&self.state);
            state.dedupe.retain(|_, expires_at| *expires_at > now);
            if state.dedupe.contains_key(&job.job_id) {
                return Ok(false);
            }
            let ttl = Duration::from_millis(dedupe_ttl_ms.max(1));
            state.dedupe.insert(job.job_id.clone(), now + ttl);
            self.push(&mut state, &job);
            Ok(true)
        })
    }

    fn dequeue(
        &self,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<Option<JobEnvelope>, JobQueueError>> {
        Box::pin(async move {
            self.check()?;
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                let notified = self.notify.notified();
                {
                    let mut state = lock_state(&self.state);
                    while let Some(job_id) = state.ready.pop_front() {
                        if let Some(job) = state.payloads.get(&job_id).cloned() {
                            state.processing.push(job_id);
                            return Ok(Some(job));
                        }
                    }
                }
                if tokio::time::timeout_at(deadline, notified).await.is_err() {
                    return Ok(None);
                }
            }
        })
    }

    fn ack(&self, job_id: &str) -> BoxFuture<'_, Result<(), JobQueueError>> {
        let job_id = job_id.to_string();
        Box::pin(async move {
            self.check()?;
            let mut state = lock_state(&self.state);
            if let Some(position) = state.processing.iter().position(|id| *id == job_id) {
                state.processing.remove(position);
            }
            let still_queued = state.ready.contains(&job_id)
                || state.delayed.keys().any(|(_, id)| *id == job_id);
            if !still_queued {
                state.payloads.remove(&job_id);
            }
            Ok(())
        })
    }

    fn retry_later(&self, job: &JobEnvelope) -> BoxFuture<'_, Result<(), JobQueueError>> {
        let job = job.clone();
        Box::pin(async move {
            self.check()?;
            let mut state = lock_state(&self.state);
            if let Some(position) = state.processing.iter().position(|id| *id == job.job_id) {
                state.processing.remove(position);
            }
            self.push(&mut state, &job);
            Ok(())
        })
    }

    fn promote_due(
        &self,
        now_ms: i64,
        limit: usize,
    ) -> BoxFuture<'_, Result<usize, JobQueueError>> {
        Box::pin(async move {
            self.check()?;
            let mut state = lock_state(&self.state);
            let due: Vec<(i64, String)> = state
                .delayed
                .keys()
                .take_while(|(run_at_ms, _)| *run_at_ms <= now_ms)
                .take(limit)
                .cloned()
                .collect();
            for key in &due {
                state.delayed.remove(key);
                state.ready.push_back(key.1.clone());
            }
            if !due.is_empty() {
                self.notify.notify_waiters();
            }
            Ok(due.len())
        })
    }

    fn requeue_processing(&self, limit: usize) -> BoxFuture<'_, Result<usize, JobQueueError>> {
        Box::pin(async move {
            self.check()?;
            let mut state = lock_state(&self.state);
            let count = limit.min(state.processing.len());
            let moved: Vec<String> = state.processing.drain(..count).collect();
            let seen: HashSet<String> = state.ready.iter().cloned().collect();
            for job_id in moved {
                if !seen.contains(&job_id) {
                    state.ready.push_back(job_id);
                }
            }
            if count > 0 {
                self.notify.notify_waiters();
            }
            Ok(count)
        })
    }

    fn snapshot(&self) -> BoxFuture<'_, Result<QueueSnapshot, JobQueueError>> {
        Box::pin(async move {
            self.check()?;
            let state = lock_state(&self.state);
            Ok(QueueSnapshot {
                ready: state.ready.len() as u64,
                delayed: state.delayed.len() as u64,
                processing: state.processing.len() as u64,
                oldest_delayed_ms: state.delayed.keys().next().map(|(run_at_ms, _)| *run_at_ms),
            })
        })
    }
}
