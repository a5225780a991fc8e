//! Reader supervisor: keeps one reader connected and inventorying, feeding
//! unique EPC reads into the ingest pipeline.
//!
//! The engine itself never reconnects; this loop owns that decision. Each
//! iteration discovers (or dials directly), applies the active inventory
//! profile, starts inventory and consumes events until the engine reports an
//! unrecoverable error, then tears down and retries after a delay.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::ipc::Scanner;
use crate::service::Notifier;
use crossbeam_channel::select;
use parking_lot::Mutex;
use reader18_io::discovery::{self, ScanOptions};
use reader18_io::{Endpoint, InventoryConfig, Reader, ReaderLink, TcpLink};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

const CONSUME_POLL: Duration = Duration::from_millis(100);

/// Supervisor status snapshot.
#[derive(Debug, Clone)]
pub struct MgrStatus {
    pub running: bool,
    pub connected: bool,
    pub endpoint: String,
    pub last_error: String,
    pub unique_seen: u64,
    pub last_tag_epc: String,
    pub last_tag_at: Option<SystemTime>,
    pub last_start_at: Option<SystemTime>,
    pub restart_count: u64,
    pub scan_profile: String,
    pub output_power: u8,
    pub scan_time: u8,
    pub poll_cycle: Duration,
    pub antenna_mask: u8,
    pub region_code: String,
    pub region: Option<(u8, u8)>,
    pub per_antenna: usize,
}

impl MgrStatus {
    fn from_profile(cfg: &InventoryConfig, profile: &str, region_code: &str) -> Self {
        MgrStatus {
            running: false,
            connected: false,
            endpoint: String::new(),
            last_error: String::new(),
            unique_seen: 0,
            last_tag_epc: String::new(),
            last_tag_at: None,
            last_start_at: None,
            restart_count: 0,
            scan_profile: profile.to_string(),
            output_power: cfg.output_power,
            scan_time: cfg.scan_time,
            poll_cycle: cfg.effective_interval(),
            antenna_mask: cfg.antenna_mask,
            region_code: region_code.to_string(),
            region: cfg.region,
            per_antenna: cfg.per_antenna_power.len(),
        }
    }
}

struct Profile {
    inv_cfg: InventoryConfig,
    long_range: bool,
}

struct Run {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

struct MgrInner {
    cfg: Config,
    on_epc: Box<dyn Fn(&str) + Send + Sync>,
    notifier: Mutex<Option<Arc<dyn Notifier>>>,
    status: Mutex<MgrStatus>,
    profile: Mutex<Profile>,
    run: Mutex<Option<Run>>,
}

#[derive(Clone)]
pub struct ReaderManager {
    inner: Arc<MgrInner>,
}

impl ReaderManager {
    pub fn new(cfg: Config, on_epc: Box<dyn Fn(&str) + Send + Sync>) -> Self {
        let inv_cfg = InventoryConfig::default();
        let status = MgrStatus::from_profile(&inv_cfg, "balanced", "-");
        ReaderManager {
            inner: Arc::new(MgrInner {
                cfg,
                on_epc,
                notifier: Mutex::new(None),
                status: Mutex::new(status),
                profile: Mutex::new(Profile {
                    inv_cfg,
                    long_range: false,
                }),
                run: Mutex::new(None),
            }),
        }
    }

    pub fn set_notifier(&self, notifier: Arc<dyn Notifier>) {
        *self.inner.notifier.lock() = Some(notifier);
    }

    /// Starts the supervisor loop; a no-op when already running.
    pub fn start(&self) -> Result<()> {
        let mut run = self.inner.run.lock();
        if run.is_some() {
            return Ok(());
        }

        let stop = Arc::new(AtomicBool::new(false));
        {
            let mut status = self.inner.status.lock();
            status.running = true;
            status.last_error.clear();
            status.last_start_at = Some(SystemTime::now());
        }

        let inner = Arc::clone(&self.inner);
        let loop_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("reader-scan".to_string())
            .spawn(move || {
                inner.scan_loop(&loop_stop);
                let mut status = inner.status.lock();
                status.running = false;
                status.connected = false;
            })?;

        *run = Some(Run { stop, handle });
        Ok(())
    }

    pub fn stop(&self) {
        let run = self.inner.run.lock().take();
        let Some(run) = run else {
            return;
        };
        run.stop.store(true, Ordering::SeqCst);
        let _ = run.handle.join();
    }

    pub fn status(&self) -> MgrStatus {
        self.inner.status.lock().clone()
    }

    pub fn status_text(&self) -> String {
        let st = self.status();
        let (region_high, region_low) = st.region.unwrap_or((0, 0));
        format!(
            "running={} connected={} endpoint={}\nprofile={} power=0x{:02X} scan={} cycle={:?} ant_mask=0x{:02X} region={} [0x{:02X}/0x{:02X}] per_ant={}\nseen={} last_tag={} restarts={} last_error={}",
            st.running,
            st.connected,
            fallback(&st.endpoint, "-"),
            fallback(&st.scan_profile, "-"),
            st.output_power,
            st.scan_time,
            st.poll_cycle,
            st.antenna_mask,
            fallback(&st.region_code, "-"),
            region_high,
            region_low,
            st.per_antenna,
            st.unique_seen,
            fallback(&st.last_tag_epc, "-"),
            st.restart_count,
            fallback(&st.last_error, "-"),
        )
    }

    pub fn long_range(&self) -> bool {
        self.inner.profile.lock().long_range
    }

    /// Switches between the balanced and long-range inventory profiles.
    /// Takes effect on the next (re)connect.
    pub fn set_long_range(&self, enabled: bool) -> String {
        let (next_cfg, region_code, profile_name) = if enabled {
            let (cfg, code) = long_range_inventory_config();
            (cfg, code, "long_range")
        } else {
            (InventoryConfig::default(), "-", "balanced")
        };

        {
            let mut profile = self.inner.profile.lock();
            profile.long_range = enabled;
            profile.inv_cfg = next_cfg.clone();
        }
        {
            let mut status = self.inner.status.lock();
            status.scan_profile = profile_name.to_string();
            status.output_power = next_cfg.output_power;
            status.scan_time = next_cfg.scan_time;
            status.poll_cycle = next_cfg.effective_interval();
            status.antenna_mask = next_cfg.antenna_mask;
            status.region_code = region_code.to_string();
            status.region = next_cfg.region;
            status.per_antenna = next_cfg.per_antenna_power.len();
        }

        if enabled {
            let (high, low) = next_cfg.region.unwrap_or((0, 0));
            format!(
                "long-range enabled: power=0x{:02X} scan={} cycle={:?} mask=0x{:02X} region={} [0x{:02X}/0x{:02X}] per_ant={}",
                next_cfg.output_power,
                next_cfg.scan_time,
                next_cfg.effective_interval(),
                next_cfg.antenna_mask,
                region_code,
                high,
                low,
                next_cfg.per_antenna_power.len(),
            )
        } else {
            "long-range disabled: back to balanced profile".to_string()
        }
    }
}

impl Scanner for ReaderManager {
    fn start(&self) -> Result<()> {
        ReaderManager::start(self)
    }

    fn stop(&self) {
        ReaderManager::stop(self)
    }
}

impl MgrInner {
    fn scan_loop(self: &Arc<Self>, stop: &Arc<AtomicBool>) {
        let retry = self.cfg.reader_retry_delay;

        loop {
            if stop.load(Ordering::SeqCst) {
                return;
            }

            let reader = match self.connect_and_start(stop) {
                Ok(reader) => reader,
                Err(err) => {
                    log::warn!("reader start failed: {}", err);
                    self.set_error(&err.to_string());
                    if !sleep_unless_stopped(stop, retry) {
                        return;
                    }
                    continue;
                }
            };

            self.notify(&format!(
                "RFID scan started: {}",
                self.status.lock().endpoint
            ));

            let should_reconnect = self.consume(&reader, stop);
            reader.stop();
            let _ = reader.link().disconnect();

            {
                let mut status = self.status.lock();
                status.connected = false;
                status.endpoint.clear();
            }

            if !should_reconnect || !sleep_unless_stopped(stop, retry) {
                return;
            }
            self.status.lock().restart_count += 1;
        }
    }

    fn connect_and_start(self: &Arc<Self>, stop: &Arc<AtomicBool>) -> Result<Reader<TcpLink>> {
        let timeout = self.cfg.reader_connect_timeout;
        let mut inv_cfg = self.profile.lock().inv_cfg.clone();

        let endpoint = if !self.cfg.reader_host.is_empty() && self.cfg.reader_port > 0 {
            Endpoint::new(self.cfg.reader_host.clone(), self.cfg.reader_port)
        } else {
            let candidates = discovery::scan(&ScanOptions::default(), stop)?;
            let chosen = candidates
                .iter()
                .find(|c| c.verified)
                .or_else(|| {
                    if let Some(first) = candidates.first() {
                        log::warn!(
                            "no verified endpoint, falling back to {}:{}",
                            first.host,
                            first.port
                        );
                    }
                    candidates.first()
                })
                .ok_or_else(|| Error::Other("discover: no reader endpoint found".into()))?;
            if chosen.verified {
                inv_cfg.reader_address = chosen.reader_address;
            }
            chosen.endpoint()
        };

        let link = Arc::new(TcpLink::new());
        link.connect(endpoint.clone(), timeout)?;
        let reader = Reader::with_config(link, inv_cfg.clone());
        reader.start()?;

        {
            let mut status = self.status.lock();
            status.connected = true;
            status.endpoint = endpoint.address();
            status.last_error.clear();
            status.output_power = inv_cfg.output_power;
            status.scan_time = inv_cfg.scan_time;
            status.poll_cycle = inv_cfg.effective_interval();
            status.antenna_mask = inv_cfg.antenna_mask;
            status.region = inv_cfg.region;
            status.per_antenna = inv_cfg.per_antenna_power.len();
        }
        Ok(reader)
    }

    /// Consumes engine events until the run ends. Returns whether the
    /// supervisor should reconnect.
    fn consume<L: ReaderLink + 'static>(&self, reader: &Reader<L>, stop: &AtomicBool) -> bool {
        let tags = reader.tags();
        let errors = reader.errors();

        loop {
            if stop.load(Ordering::SeqCst) {
                return false;
            }
            select! {
                recv(tags) -> msg => match msg {
                    Ok(tag) => {
                        if !tag.is_new || tag.epc.is_empty() {
                            continue;
                        }
                        {
                            let mut status = self.status.lock();
                            status.unique_seen += 1;
                            status.last_tag_at = Some(SystemTime::now());
                            status.last_tag_epc = tag.epc.clone();
                        }
                        (self.on_epc)(&tag.epc);
                    }
                    Err(_) => {
                        self.set_error("tag channel closed");
                        return true;
                    }
                },
                recv(errors) -> msg => {
                    match msg {
                        Ok(err) => self.set_error(&err.to_string()),
                        Err(_) => self.set_error("error channel closed"),
                    }
                    return true;
                },
                default(CONSUME_POLL) => {}
            }
        }
    }

    fn set_error(&self, message: &str) {
        if message.is_empty() {
            return;
        }
        self.status.lock().last_error = message.to_string();
    }

    fn notify(&self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let notifier = self.notifier.lock().clone();
        if let Some(notifier) = notifier {
            notifier.notify(text);
        }
    }
}

fn sleep_unless_stopped(stop: &AtomicBool, duration: Duration) -> bool {
    let deadline = std::time::Instant::now() + duration;
    while std::time::Instant::now() < deadline {
        if stop.load(Ordering::SeqCst) {
            return false;
        }
        thread::sleep(Duration::from_millis(50).min(duration));
    }
    !stop.load(Ordering::SeqCst)
}

fn fallback<'a>(value: &'a str, default: &'a str) -> &'a str {
    if value.trim().is_empty() {
        default
    } else {
        value
    }
}

/// Aggressive profile for sparse, distant tag populations.
fn long_range_inventory_config() -> (InventoryConfig, &'static str) {
    let mut cfg = InventoryConfig {
        // Vendor manual exposes the power range as 0..30.
        output_power: 30,
        scan_time: 10,
        q_value: 4,
        session: 0,
        no_tag_ab_switch: 0,
        single_fallback_each: 4,
        poll_interval: Duration::from_millis(200),
        antenna_mask: 0x0F,
        per_antenna_power: vec![30, 30, 30, 30, 0, 0, 0, 0],
        ..InventoryConfig::default()
    };

    let (code, high, low) = default_us_region();
    cfg.region = Some((high, low));
    (cfg, code)
}

fn default_us_region() -> (&'static str, u8, u8) {
    let (high, low) = encode_region(2, 49, 0);
    ("US", high, low)
}

/// Packs band and channel bounds into the 0x22 region window bytes.
fn encode_region(band: u8, max_chan: u8, min_chan: u8) -> (u8, u8) {
    let high = ((band & 0x0C) << 4) | (max_chan & 0x3F);
    let low = ((band & 0x03) << 6) | (min_chan & 0x3F);
    (high, low)
}
