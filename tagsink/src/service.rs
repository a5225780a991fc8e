//! Ingest/submit service: the process-wide pipeline between tag observations
//! and the ERP.
//!
//! Every observed EPC lands in a recent-seen TTL window, is gated on the
//! draft cache, then flows through a bounded dedup queue to the submitter
//! workers. The queue drops on overflow instead of blocking: the producer is
//! the RFID frame decoder, and stalling it would lose packets on the wire.
//! Draft refreshes replay recently seen EPCs that the cache did not know
//! about at observation time.

use crate::cache::Store;
use crate::config::Config;
use crate::erp::{normalize_epc, Erp, SubmitStatus};
use crate::error::{Error, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Poll granularity for worker/refresher shutdown checks.
const LOOP_POLL: Duration = Duration::from_millis(100);

/// Receives user-facing progress messages. Implementations must not block;
/// the service calls them outside its lock.
pub trait Notifier: Send + Sync {
    fn notify(&self, text: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestAction {
    Invalid,
    ScanInactive,
    Miss,
    Queued,
    QueuedOrDropped,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestResult {
    pub epc: String,
    pub action: IngestAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Stats {
    pub cache_size: usize,
    pub draft_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_refresh_at: Option<u64>,
    pub last_refresh_ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub scan_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scan_since: Option<u64>,

    pub seen_total: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub submitted_ok: u64,
    pub submit_not_found: u64,
    pub submit_errors: u64,
    pub queue_dropped: u64,
    pub scan_inactive: u64,
}

#[derive(Default)]
struct Counters {
    seen_total: u64,
    cache_hits: u64,
    cache_misses: u64,
    submitted_ok: u64,
    submit_not_found: u64,
    submit_errors: u64,
    queue_dropped: u64,
    scan_inactive: u64,
}

struct State {
    inflight: HashSet<String>,
    queued: HashSet<String>,
    recent_seen: HashMap<String, Instant>,
    draft_count: u64,
    last_refresh: Option<SystemTime>,
    last_refresh_ok: bool,
    last_error: Option<String>,
    scan_active: bool,
    scan_since: Option<SystemTime>,
    counters: Counters,
    notifier: Option<Arc<dyn Notifier>>,
}

pub struct Service {
    cfg: Config,
    erp: Option<Arc<dyn Erp>>,
    cache: Arc<Store>,
    queue_tx: Sender<String>,
    queue_rx: Receiver<String>,
    state: Mutex<State>,
    stop: Arc<AtomicBool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Service {
    pub fn new(cfg: Config, erp: Option<Arc<dyn Erp>>, cache: Arc<Store>) -> Self {
        let (queue_tx, queue_rx) = bounded(cfg.queue_size);
        let scan_since = if cfg.scan_default_active {
            Some(SystemTime::now())
        } else {
            None
        };
        Service {
            state: Mutex::new(State {
                inflight: HashSet::new(),
                queued: HashSet::new(),
                recent_seen: HashMap::new(),
                draft_count: 0,
                last_refresh: None,
                last_refresh_ok: false,
                last_error: None,
                scan_active: cfg.scan_default_active,
                scan_since,
                counters: Counters::default(),
                notifier: None,
            }),
            cfg,
            erp,
            cache,
            queue_tx,
            queue_rx,
            stop: Arc::new(AtomicBool::new(false)),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn set_notifier(&self, notifier: Arc<dyn Notifier>) {
        self.state.lock().notifier = Some(notifier);
    }

    /// One synchronous refresh before the workers start.
    pub fn bootstrap(&self) -> Result<()> {
        self.refresh_cache("startup", true)
    }

    /// Spawns the submitter workers and the periodic refresher.
    pub fn run(self: &Arc<Self>) {
        let mut handles = self.handles.lock();
        for worker_id in 1..=self.cfg.worker_count {
            let svc = Arc::clone(self);
            let handle = thread::Builder::new()
                .name(format!("submit-{}", worker_id))
                .spawn(move || svc.worker_loop(worker_id))
                .expect("spawn submit worker");
            handles.push(handle);
        }

        let svc = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("cache-refresh".to_string())
            .spawn(move || svc.refresh_loop())
            .expect("spawn refresh loop");
        handles.push(handle);
    }

    /// Stops workers and refresher and waits for them.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }

    fn refresh_loop(self: Arc<Self>) {
        let mut next_at = Instant::now() + self.cfg.refresh_interval;
        while !self.stop.load(Ordering::SeqCst) {
            if Instant::now() < next_at {
                thread::sleep(LOOP_POLL.min(self.cfg.refresh_interval));
                continue;
            }
            next_at = Instant::now() + self.cfg.refresh_interval;
            if let Err(err) = self.refresh_cache("periodic", false) {
                log::warn!("periodic refresh failed: {}", err);
            }
        }
    }

    /// Fetches the draft list and swaps the cache, replaying recently seen
    /// EPCs the new drafts cover. Concurrent refreshes are allowed; the last
    /// writer wins.
    pub fn refresh_cache(&self, reason: &str, announce: bool) -> Result<()> {
        let erp = self
            .erp
            .as_ref()
            .ok_or_else(|| Error::Erp("no ERP client configured".into()))?;

        let result = match erp.fetch_draft_epcs(self.cfg.request_timeout) {
            Ok(result) => result,
            Err(err) => {
                let mut state = self.state.lock();
                state.last_refresh = Some(SystemTime::now());
                state.last_refresh_ok = false;
                state.last_error = Some(err.to_string());
                return Err(err);
            }
        };

        let new_epcs = self.diff_new_epcs(&result.epcs);
        self.cache.replace(&result.epcs);
        let replay = self.collect_replay(Instant::now(), Some(&result.epcs));

        let prev_draft_count = {
            let mut state = self.state.lock();
            let prev = state.draft_count;
            state.draft_count = result.draft_count;
            state.last_refresh = Some(SystemTime::now());
            state.last_refresh_ok = true;
            state.last_error = None;
            prev
        };

        if self.scan_active() {
            for epc in &replay {
                self.enqueue(epc);
            }
        }

        if reason != "startup" {
            let cache_size = self.cache.len();
            if !new_epcs.is_empty() {
                self.notify(&format!(
                    "New drafts from ERP: +{} EPC (cache={}). Sample: {}",
                    new_epcs.len(),
                    cache_size,
                    summarize_epcs(&new_epcs, 3)
                ));
            } else if result.draft_count > prev_draft_count {
                self.notify(&format!(
                    "New drafts from ERP: draft +{} (cache={}, EPC diff=0)",
                    result.draft_count - prev_draft_count,
                    cache_size
                ));
            }
        }

        if announce {
            self.notify(&format!(
                "Turbo ready: {} drafts, {} EPCs cached.",
                result.draft_count,
                result.epcs.len()
            ));
        } else {
            log::info!(
                "cache refresh ({}): drafts={} epcs={} replay={}",
                reason,
                result.draft_count,
                result.epcs.len(),
                replay.len()
            );
        }

        Ok(())
    }

    /// Incremental draft feed (webhooks): adds to the cache instead of
    /// replacing it. Returns (added, replayed).
    pub fn add_draft_epcs(&self, epcs: &[String]) -> (usize, usize) {
        let clean = normalize_epc_list(epcs);
        let new_epcs = self.diff_new_epcs(&clean);
        let added = self.cache.add(&clean);
        let replay = self.collect_replay(Instant::now(), Some(&clean));

        if self.scan_active() {
            for epc in &replay {
                self.enqueue(epc);
            }
        }

        if added > 0 {
            self.notify(&format!(
                "New drafts from webhook: +{} EPC (cache={}). Sample: {}",
                added,
                self.cache.len(),
                summarize_epcs(&new_epcs, 3)
            ));
        }
        (added, replay.len())
    }

    /// One observed EPC from any source.
    pub fn handle_epc(&self, raw_epc: &str, _source: &str) -> IngestResult {
        let epc = normalize_epc(raw_epc);
        if epc.is_empty() {
            return IngestResult {
                epc,
                action: IngestAction::Invalid,
                error: Some("epc is empty".to_string()),
            };
        }

        let now = Instant::now();
        let scan_active = {
            let mut state = self.state.lock();
            state.recent_seen.insert(epc.clone(), now);
            Self::gc_recent_seen_locked(&mut state, now, self.cfg.recent_seen_ttl);
            state.counters.seen_total += 1;
            if !state.scan_active {
                state.counters.scan_inactive += 1;
            }
            state.scan_active
        };
        if !scan_active {
            return IngestResult {
                epc,
                action: IngestAction::ScanInactive,
                error: None,
            };
        }

        if !self.cache.has(&epc) {
            self.state.lock().counters.cache_misses += 1;
            // Stays in recent-seen so a late draft can replay it.
            return IngestResult {
                epc,
                action: IngestAction::Miss,
                error: None,
            };
        }

        self.state.lock().counters.cache_hits += 1;
        let action = if self.enqueue(&epc) {
            IngestAction::Queued
        } else {
            IngestAction::QueuedOrDropped
        };
        IngestResult {
            epc,
            action,
            error: None,
        }
    }

    /// Flips the scan flag. A false→true transition replays the recent-seen
    /// window against the cache and returns how many EPCs were produced.
    pub fn set_scan_active(&self, active: bool, reason: &str) -> usize {
        let now = Instant::now();
        let became_active = {
            let mut state = self.state.lock();
            if state.scan_active == active {
                false
            } else {
                state.scan_active = active;
                if active {
                    state.scan_since = Some(SystemTime::now());
                    true
                } else {
                    state.scan_since = None;
                    false
                }
            }
        };

        if !became_active {
            return 0;
        }

        let replay = self.collect_replay(now, None);
        for epc in &replay {
            self.enqueue(epc);
        }
        log::info!("scan active ({}): replay={}", reason, replay.len());
        replay.len()
    }

    pub fn scan_active(&self) -> bool {
        self.state.lock().scan_active
    }

    pub fn status(&self) -> Stats {
        let state = self.state.lock();
        Stats {
            cache_size: self.cache.len(),
            draft_count: state.draft_count,
            last_refresh_at: state.last_refresh.map(unix_secs),
            last_refresh_ok: state.last_refresh_ok,
            last_error: state.last_error.clone(),
            scan_active: state.scan_active,
            scan_since: state.scan_since.map(unix_secs),
            seen_total: state.counters.seen_total,
            cache_hits: state.counters.cache_hits,
            cache_misses: state.counters.cache_misses,
            submitted_ok: state.counters.submitted_ok,
            submit_not_found: state.counters.submit_not_found,
            submit_errors: state.counters.submit_errors,
            queue_dropped: state.counters.queue_dropped,
            scan_inactive: state.counters.scan_inactive,
        }
    }

    pub fn status_text(&self) -> String {
        let st = self.status();
        format!(
            "Scan: active={} since={}\nCache: {} EPC (draft={})\nSeen: {} | hit={} miss={} inactive={}\nSubmit: ok={} not_found={} err={}\nLast refresh: {} (ok={})",
            st.scan_active,
            format_unix(st.scan_since),
            st.cache_size,
            st.draft_count,
            st.seen_total,
            st.cache_hits,
            st.cache_misses,
            st.scan_inactive,
            st.submitted_ok,
            st.submit_not_found,
            st.submit_errors,
            format_unix(st.last_refresh_at),
            st.last_refresh_ok,
        )
    }

    /// Normalized EPCs observed within the recent-seen window, sorted.
    pub fn recent_seen_epcs(&self) -> Vec<String> {
        let mut state = self.state.lock();
        Self::gc_recent_seen_locked(&mut state, Instant::now(), self.cfg.recent_seen_ttl);
        let mut out: Vec<String> = state.recent_seen.keys().cloned().collect();
        out.sort();
        out
    }

    /// Current draft cache snapshot, sorted.
    pub fn draft_epcs(&self) -> Vec<String> {
        self.cache.snapshot_sorted()
    }

    fn worker_loop(self: Arc<Self>, worker_id: usize) {
        loop {
            if self.stop.load(Ordering::SeqCst) {
                return;
            }
            match self.queue_rx.recv_timeout(LOOP_POLL) {
                Ok(epc) => {
                    self.state.lock().queued.remove(&epc);
                    if let Err(err) = self.process_submit(&epc) {
                        log::warn!("worker={} submit failed epc={}: {}", worker_id, epc, err);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    fn process_submit(&self, epc: &str) -> Result<()> {
        if epc.is_empty() {
            return Ok(());
        }
        // The draft may be gone already: another worker submitted it, or a
        // refresh replaced the cache. Dropping the work is not an error.
        if !self.cache.has(epc) {
            return Ok(());
        }
        if !self.lock_inflight(epc) {
            return Ok(());
        }

        let outcome = self.submit_with_retry(epc);
        self.unlock_inflight(epc);
        outcome
    }

    fn submit_with_retry(&self, epc: &str) -> Result<()> {
        let Some(erp) = self.erp.as_ref() else {
            return Ok(());
        };

        let mut last_err: Option<Error> = None;
        for attempt in 0..=self.cfg.submit_retry {
            match erp.submit_by_epc(epc, self.cfg.request_timeout) {
                Ok(SubmitStatus::Submitted) => {
                    self.cache.remove(epc);
                    self.state.lock().counters.submitted_ok += 1;
                    self.notify(&format!("Submit OK: {}", trim_epc(epc)));
                    return Ok(());
                }
                Ok(SubmitStatus::NotFound) => {
                    // Draft already gone upstream; absorb silently.
                    self.cache.remove(epc);
                    self.state.lock().counters.submit_not_found += 1;
                    return Ok(());
                }
                Err(err) => last_err = Some(err),
            }
            if attempt < self.cfg.submit_retry {
                thread::sleep(self.cfg.submit_retry_delay);
            }
        }

        self.state.lock().counters.submit_errors += 1;
        self.notify(&format!("Submit error: {}", trim_epc(epc)));
        Err(last_err.unwrap_or_else(|| Error::Erp("submit failed".into())))
    }

    /// The dedup gate: an EPC already queued or inflight is not enqueued
    /// again. Queue overflow rolls the membership back so a later
    /// observation may retry.
    fn enqueue(&self, epc: &str) -> bool {
        if epc.is_empty() {
            return false;
        }

        {
            let mut state = self.state.lock();
            if state.queued.contains(epc) || state.inflight.contains(epc) {
                return false;
            }
            state.queued.insert(epc.to_string());
        }

        match self.queue_tx.try_send(epc.to_string()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                let mut state = self.state.lock();
                state.queued.remove(epc);
                state.counters.queue_dropped += 1;
                false
            }
        }
    }

    fn lock_inflight(&self, epc: &str) -> bool {
        self.state.lock().inflight.insert(epc.to_string())
    }

    fn unlock_inflight(&self, epc: &str) {
        self.state.lock().inflight.remove(epc);
    }

    /// Recent-seen ∩ cache, optionally restricted to `focus`.
    fn collect_replay(&self, now: Instant, focus: Option<&[String]>) -> Vec<String> {
        let focus_set: Option<HashSet<&str>> =
            focus.map(|list| list.iter().map(String::as_str).collect());

        let mut state = self.state.lock();
        Self::gc_recent_seen_locked(&mut state, now, self.cfg.recent_seen_ttl);

        let mut out = Vec::new();
        for epc in state.recent_seen.keys() {
            if let Some(ref focus) = focus_set {
                if !focus.contains(epc.as_str()) {
                    continue;
                }
            }
            if self.cache.has(epc) {
                out.push(epc.clone());
            }
        }
        out
    }

    fn gc_recent_seen_locked(state: &mut State, now: Instant, ttl: Duration) {
        state
            .recent_seen
            .retain(|_, seen_at| now.duration_since(*seen_at) <= ttl);
    }

    /// EPCs in `epcs` the cache does not know yet.
    fn diff_new_epcs(&self, epcs: &[String]) -> Vec<String> {
        epcs.iter()
            .filter(|epc| !epc.is_empty() && !self.cache.has(epc))
            .cloned()
            .collect()
    }

    fn notify(&self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let notifier = self.state.lock().notifier.clone();
        if let Some(notifier) = notifier {
            notifier.notify(text);
        }
    }
}

fn normalize_epc_list(values: &[String]) -> Vec<String> {
    let mut unique = HashSet::with_capacity(values.len());
    let mut out = Vec::with_capacity(values.len());
    for raw in values {
        let epc = normalize_epc(raw);
        if epc.is_empty() || !unique.insert(epc.clone()) {
            continue;
        }
        out.push(epc);
    }
    out
}

fn summarize_epcs(epcs: &[String], max: usize) -> String {
    if epcs.is_empty() {
        return "-".to_string();
    }
    let max = max.max(1).min(epcs.len());
    let parts: Vec<String> = epcs[..max].iter().map(|epc| trim_epc(epc)).collect();
    if epcs.len() > max {
        format!("{} (+{})", parts.join(", "), epcs.len() - max)
    } else {
        parts.join(", ")
    }
}

fn trim_epc(epc: &str) -> String {
    if epc.len() <= 16 {
        epc.to_string()
    } else {
        format!("{}...", &epc[..16])
    }
}

fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

fn format_unix(t: Option<u64>) -> String {
    match t {
        Some(secs) => format!("unix:{}", secs),
        None => "never".to_string(),
    }
}
