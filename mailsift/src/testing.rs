//! In-memory collaborators for tests.
//!
//! Every fake is cheap to clone behind an `Arc`, records what it was asked to
//! do and can be scripted to fail, stall or panic.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::analysis::{
    AnalysisContext, AnalysisFailure, AnalysisInput, AnalysisResult, Analyzer, DerivedEntry,
};
use crate::database::models::{RecordId, TenantId};
use crate::notification::{NotificationChannel, ReminderNotice};
use crate::schedule::{EntryId, ScheduleError, Scheduler};
use crate::source::{MessageHeader, MessagePayload, MessageSource, SourceError};
use crate::Error;

#[derive(Default)]
struct SourceState {
    messages: BTreeMap<(TenantId, u64), MessagePayload>,
    listing_error: Option<SourceError>,
    header_errors: HashMap<u64, SourceError>,
    full_errors: HashMap<u64, SourceError>,
    hide_next_id: bool,
    header_fetches: Vec<u64>,
    full_fetches: Vec<u64>,
    cancel_after: Option<(usize, CancellationToken)>,
}

/// Mailbox held in memory. Ids are whatever the test inserts.
#[derive(Default)]
pub struct FakeSource {
    state: Mutex<SourceState>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a message with a stable message id and a generated subject.
    pub fn add_message(&self, tenant: TenantId, id: u64) {
        let payload = MessagePayload {
            header: MessageHeader {
                id,
                message_id: Some(format!("<{id}@tenant{tenant}.test>")),
                subject: format!("message {id}"),
                sender: "sender@example.com".to_string(),
                received_at: Utc.timestamp_opt(1_700_000_000 + id as i64, 0).single(),
            },
            body: format!("body of message {id}"),
            html_body: None,
        };
        self.add_payload(tenant, payload);
    }

    /// Add a message with a chosen subject; scripted analyzer behaviour keys
    /// off the subject.
    pub fn add_message_with_subject(&self, tenant: TenantId, id: u64, subject: &str) {
        self.add_message(tenant, id);
        if let Some(payload) = self.state.lock().messages.get_mut(&(tenant, id)) {
            payload.header.subject = subject.to_string();
        }
    }

    pub fn add_payload(&self, tenant: TenantId, payload: MessagePayload) {
        self.state
            .lock()
            .messages
            .insert((tenant, payload.header.id), payload);
    }

    pub fn fail_listing(&self, err: SourceError) {
        self.state.lock().listing_error = Some(err);
    }

    pub fn fail_header(&self, id: u64, err: SourceError) {
        self.state.lock().header_errors.insert(id, err);
    }

    pub fn fail_full(&self, id: u64, err: SourceError) {
        self.state.lock().full_errors.insert(id, err);
    }

    /// Drop every scripted failure.
    pub fn heal(&self) {
        let mut state = self.state.lock();
        state.listing_error = None;
        state.header_errors.clear();
        state.full_errors.clear();
    }

    /// Make `next_id` report `None`, as a source without UIDNEXT would.
    pub fn hide_next_id(&self) {
        self.state.lock().hide_next_id = true;
    }

    /// Cancel `token` right after the `n`-th successful full fetch.
    pub fn cancel_after_full_fetches(&self, n: usize, token: CancellationToken) {
        self.state.lock().cancel_after = Some((n, token));
    }

    pub fn full_fetches(&self) -> Vec<u64> {
        self.state.lock().full_fetches.clone()
    }

    pub fn header_fetches(&self) -> Vec<u64> {
        self.state.lock().header_fetches.clone()
    }

    fn ids(&self, tenant: TenantId) -> Result<Vec<u64>, SourceError> {
        let state = self.state.lock();
        if let Some(err) = &state.listing_error {
            return Err(err.clone());
        }
        Ok(state
            .messages
            .keys()
            .filter(|(t, _)| *t == tenant)
            .map(|(_, id)| *id)
            .collect())
    }
}

#[async_trait]
impl MessageSource for FakeSource {
    async fn next_id(&self, tenant: TenantId) -> Result<Option<u64>, SourceError> {
        if self.state.lock().hide_next_id {
            return Ok(None);
        }
        Ok(Some(self.ids(tenant)?.last().map_or(1, |max| max + 1)))
    }

    async fn list_ids_since(&self, tenant: TenantId, after: u64) -> Result<Vec<u64>, SourceError> {
        Ok(self
            .ids(tenant)?
            .into_iter()
            .filter(|id| *id > after)
            .collect())
    }

    async fn list_ids_within(
        &self,
        tenant: TenantId,
        _window: Duration,
    ) -> Result<Vec<u64>, SourceError> {
        self.ids(tenant)
    }

    async fn fetch_header(&self, tenant: TenantId, id: u64) -> Result<MessageHeader, SourceError> {
        let mut state = self.state.lock();
        state.header_fetches.push(id);
        if let Some(err) = state.header_errors.get(&id) {
            return Err(err.clone());
        }
        state
            .messages
            .get(&(tenant, id))
            .map(|p| p.header.clone())
            .ok_or(SourceError::NotFound(id))
    }

    async fn fetch_full(&self, tenant: TenantId, id: u64) -> Result<MessagePayload, SourceError> {
        let mut state = self.state.lock();
        if let Some(err) = state.full_errors.get(&id) {
            return Err(err.clone());
        }
        let payload = state
            .messages
            .get(&(tenant, id))
            .cloned()
            .ok_or(SourceError::NotFound(id))?;
        state.full_fetches.push(id);
        if let Some((n, token)) = &state.cancel_after
            && state.full_fetches.len() >= *n
        {
            token.cancel();
        }
        Ok(payload)
    }
}

/// Scripted analyzer behaviour, keyed by subject.
#[derive(Debug, Clone)]
pub enum FakeBehavior {
    /// Succeed with these derived entries.
    Entries(Vec<DerivedEntry>),
    Fail(AnalysisFailure),
    /// Sleep, then succeed.
    Delay(Duration),
    /// Report `PayloadTooLarge` while the body is longer than this many bytes.
    TooLargeAbove(usize),
    Panic,
}

/// Analyzer returning canned results.
#[derive(Default)]
pub struct FakeAnalyzer {
    scripts: Mutex<HashMap<String, FakeBehavior>>,
    inputs: Mutex<Vec<AnalysisInput>>,
    calls: AtomicUsize,
}

impl FakeAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, subject: &str, behavior: FakeBehavior) {
        self.scripts.lock().insert(subject.to_string(), behavior);
    }

    pub fn clear_scripts(&self) {
        self.scripts.lock().clear();
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Subjects seen, in call order.
    pub fn subjects(&self) -> Vec<String> {
        self.inputs.lock().iter().map(|i| i.subject.clone()).collect()
    }

    fn result_for(input: &AnalysisInput, entries: Vec<DerivedEntry>) -> AnalysisResult {
        AnalysisResult {
            summary: format!("summary of {}", input.subject),
            importance_score: 5,
            importance_reason: "routine".to_string(),
            derived_entries: entries,
            model_tag: "fake".to_string(),
            produced_at: Utc::now(),
        }
    }
}

#[async_trait]
impl Analyzer for FakeAnalyzer {
    async fn analyze(
        &self,
        input: &AnalysisInput,
        _ctx: &AnalysisContext,
    ) -> Result<AnalysisResult, AnalysisFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inputs.lock().push(input.clone());
        let behavior = self.scripts.lock().get(&input.subject).cloned();

        match behavior {
            None => Ok(Self::result_for(input, Vec::new())),
            Some(FakeBehavior::Entries(entries)) => Ok(Self::result_for(input, entries)),
            Some(FakeBehavior::Fail(failure)) => Err(failure),
            Some(FakeBehavior::Delay(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(Self::result_for(input, Vec::new()))
            }
            Some(FakeBehavior::TooLargeAbove(limit)) if input.body.len() > limit => {
                Err(AnalysisFailure::PayloadTooLarge)
            }
            Some(FakeBehavior::TooLargeAbove(_)) => Ok(Self::result_for(input, Vec::new())),
            Some(FakeBehavior::Panic) => panic!("analyzer blew up on {}", input.subject),
        }
    }
}

/// Scheduler that keeps entries in memory.
#[derive(Default)]
pub struct FakeScheduler {
    entries: Mutex<Vec<(TenantId, RecordId, DerivedEntry)>>,
    clears: AtomicUsize,
    reject_titles: Mutex<Vec<String>>,
}

impl FakeScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse entries with this title.
    pub fn reject_title(&self, title: &str) {
        self.reject_titles.lock().push(title.to_string());
    }

    pub fn entries_for(&self, record_id: RecordId) -> Vec<DerivedEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|(_, r, _)| *r == record_id)
            .map(|(_, _, e)| e.clone())
            .collect()
    }

    pub fn total_entries(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn clears(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Scheduler for FakeScheduler {
    async fn clear_entries(
        &self,
        tenant: TenantId,
        record_id: RecordId,
    ) -> Result<u64, ScheduleError> {
        self.clears.fetch_add(1, Ordering::SeqCst);
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(t, r, _)| !(*t == tenant && *r == record_id));
        Ok((before - entries.len()) as u64)
    }

    async fn create_entry(
        &self,
        tenant: TenantId,
        record_id: RecordId,
        entry: &DerivedEntry,
    ) -> Result<EntryId, ScheduleError> {
        if self.reject_titles.lock().contains(&entry.title) {
            return Err(ScheduleError::InvalidEntry(entry.title.clone()));
        }
        let mut entries = self.entries.lock();
        entries.push((tenant, record_id, entry.clone()));
        Ok(entries.len() as EntryId)
    }
}

/// Notification channel that records what it was sent.
pub struct RecordingChannel {
    name: String,
    fail_remaining: AtomicUsize,
    sent: Mutex<Vec<ReminderNotice>>,
}

impl RecordingChannel {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fail_remaining: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Fail the next `n` sends.
    pub fn fail_next(&self, n: usize) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<ReminderNotice> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl NotificationChannel for RecordingChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, notice: &ReminderNotice) -> crate::Result<()> {
        let failing = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::Other(format!("{} unavailable", self.name)));
        }
        self.sent.lock().push(notice.clone());
        Ok(())
    }
}
