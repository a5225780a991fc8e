//! Inventory engine: turns a connected link plus an [`InventoryConfig`] into
//! a stream of deduped tag events.
//!
//! Two threads per run: a transmit loop issuing one inventory round per
//! effective interval (antenna round-robin, periodic single-tag fallback) and
//! a receive loop reassembling frames from raw byte bursts. The engine never
//! reconnects on its own; unrecoverable link errors end the run with an error
//! event and the supervisor decides what happens next.

use crate::error::{Error, Result};
use crate::protocol::{self, Frame};
use crate::transport::ReaderLink;
use crate::types::{
    next_inventory_antenna, EngineStats, InventoryConfig, StatusEvent, TagEvent,
};
use crossbeam_channel::{bounded, select, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

const TAG_CHANNEL_CAPACITY: usize = 256;
const STATUS_CHANNEL_CAPACITY: usize = 256;
const ERROR_CHANNEL_CAPACITY: usize = 64;
const SEND_TIMEOUT: Duration = Duration::from_secs(2);
/// Receive loop poll granularity for noticing the stop flag.
const RX_POLL: Duration = Duration::from_millis(50);

/// Parser buffer hard cap; on overflow the oldest bytes are truncated.
const PARSER_BUFFER_MAX: usize = 8192;
const PARSER_BUFFER_KEEP: usize = 4096;

struct EngineState {
    cfg: InventoryConfig,
    seen: HashSet<String>,
    parser: Vec<u8>,
    rounds: u64,
    unique_tags: u64,
    no_tag_hits: u32,
    ant_idx: usize,
    reader_addr: u8,
    target: u8,
    last_tag_epc: String,
}

struct Shared<L: ReaderLink> {
    link: Arc<L>,
    state: Mutex<EngineState>,
    running: AtomicBool,
    tags_tx: Sender<TagEvent>,
    statuses_tx: Sender<StatusEvent>,
    errors_tx: Sender<Error>,
}

struct Run {
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

/// High-level reader facade over a connected [`ReaderLink`].
pub struct Reader<L: ReaderLink + 'static> {
    shared: Arc<Shared<L>>,
    run: Mutex<Option<Run>>,
    tags_rx: Receiver<TagEvent>,
    statuses_rx: Receiver<StatusEvent>,
    errors_rx: Receiver<Error>,
}

impl<L: ReaderLink + 'static> Reader<L> {
    pub fn new(link: Arc<L>) -> Self {
        Self::with_config(link, InventoryConfig::default())
    }

    pub fn with_config(link: Arc<L>, cfg: InventoryConfig) -> Self {
        let cfg = cfg.normalized();
        let (tags_tx, tags_rx) = bounded(TAG_CHANNEL_CAPACITY);
        let (statuses_tx, statuses_rx) = bounded(STATUS_CHANNEL_CAPACITY);
        let (errors_tx, errors_rx) = bounded(ERROR_CHANNEL_CAPACITY);

        let state = EngineState {
            reader_addr: cfg.reader_address,
            target: cfg.target,
            cfg,
            seen: HashSet::new(),
            parser: Vec::new(),
            rounds: 0,
            unique_tags: 0,
            no_tag_hits: 0,
            ant_idx: 0,
            last_tag_epc: String::new(),
        };

        Reader {
            shared: Arc::new(Shared {
                link,
                state: Mutex::new(state),
                running: AtomicBool::new(false),
                tags_tx,
                statuses_tx,
                errors_tx,
            }),
            run: Mutex::new(None),
            tags_rx,
            statuses_rx,
            errors_rx,
        }
    }

    pub fn tags(&self) -> Receiver<TagEvent> {
        self.tags_rx.clone()
    }

    pub fn statuses(&self) -> Receiver<StatusEvent> {
        self.statuses_rx.clone()
    }

    pub fn errors(&self) -> Receiver<Error> {
        self.errors_rx.clone()
    }

    pub fn link(&self) -> &L {
        &self.shared.link
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> InventoryConfig {
        self.shared.state.lock().cfg.clone()
    }

    pub fn set_config(&self, cfg: InventoryConfig) {
        let cfg = cfg.normalized();
        {
            let mut state = self.shared.state.lock();
            if state.reader_addr == 0 {
                state.reader_addr = cfg.reader_address;
            }
            state.cfg = cfg;
        }
        self.shared.emit_status("inventory config updated");
    }

    pub fn stats(&self) -> EngineStats {
        let state = self.shared.state.lock();
        EngineStats {
            running: self.shared.running.load(Ordering::SeqCst),
            rounds: state.rounds,
            unique_tags: state.unique_tags,
            last_tag_epc: state.last_tag_epc.clone(),
            reader_address: state.reader_addr,
            target: state.target,
        }
    }

    /// Sends GetReaderInfo; the reply shows up as a status event.
    pub fn probe_info(&self) -> Result<()> {
        if !self.shared.link.is_connected() {
            return Err(Error::NotConnected);
        }
        let addr = self.shared.state.lock().reader_addr;
        self.shared
            .link
            .send_raw(&protocol::reader_info_command(addr), SEND_TIMEOUT)
    }

    /// Pushes the inventory-related configuration to the reader.
    pub fn apply_config(&self) -> Result<()> {
        if !self.shared.link.is_connected() {
            return Err(Error::NotConnected);
        }
        self.shared.apply_config()
    }

    /// Starts the inventory loops. Fails when already running.
    pub fn start(&self) -> Result<()> {
        if !self.shared.link.is_connected() {
            return Err(Error::NotConnected);
        }

        let mut run = self.run.lock();
        if run.is_some() || self.shared.running.load(Ordering::SeqCst) {
            return Err(Error::InventoryRunning);
        }

        let packets = self.shared.link.packets().ok_or(Error::NotConnected)?;
        let errors = self.shared.link.errors().ok_or(Error::NotConnected)?;

        {
            let mut state = self.shared.state.lock();
            state.seen.clear();
            state.parser.clear();
            state.rounds = 0;
            state.unique_tags = 0;
            state.no_tag_hits = 0;
            state.ant_idx = 0;
            state.last_tag_epc.clear();
            state.target = state.cfg.target;
            if state.reader_addr == 0 {
                state.reader_addr = state.cfg.reader_address;
            }
        }

        self.shared.apply_config()?;
        self.shared.running.store(true, Ordering::SeqCst);

        let stop = Arc::new(AtomicBool::new(false));

        let tx_shared = Arc::clone(&self.shared);
        let tx_stop = Arc::clone(&stop);
        let tx_handle = thread::Builder::new()
            .name("inventory-tx".to_string())
            .spawn(move || tx_loop(tx_shared, tx_stop))?;

        let rx_shared = Arc::clone(&self.shared);
        let rx_stop = Arc::clone(&stop);
        let rx_handle = thread::Builder::new()
            .name("inventory-rx".to_string())
            .spawn(move || rx_loop(rx_shared, rx_stop, packets, errors))?;

        *run = Some(Run {
            stop,
            handles: vec![tx_handle, rx_handle],
        });
        self.shared.emit_status("inventory started");
        Ok(())
    }

    /// Stops the loops and waits for them to exit. The transmit loop may take
    /// up to one effective interval to observe the flag.
    pub fn stop(&self) {
        let run = self.run.lock().take();
        let Some(run) = run else {
            return;
        };

        run.stop.store(true, Ordering::SeqCst);
        for handle in run.handles {
            let _ = handle.join();
        }
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.emit_status("inventory stopped");
    }
}

impl<L: ReaderLink + 'static> Drop for Reader<L> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn tx_loop<L: ReaderLink>(shared: Arc<Shared<L>>, stop: Arc<AtomicBool>) {
    loop {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        let Some((inventory, single, interval)) = shared.next_round() else {
            return;
        };

        if let Err(err) = shared.link.send_raw(&inventory, SEND_TIMEOUT) {
            shared.emit_err(err);
            shared.abort(&stop);
            return;
        }
        if let Some(single) = single {
            if let Err(err) = shared.link.send_raw(&single, SEND_TIMEOUT) {
                shared.emit_err(err);
                shared.abort(&stop);
                return;
            }
        }

        thread::sleep(interval);
    }
}

fn rx_loop<L: ReaderLink>(
    shared: Arc<Shared<L>>,
    stop: Arc<AtomicBool>,
    packets: Receiver<crate::transport::Packet>,
    errors: Receiver<Error>,
) {
    loop {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        select! {
            recv(packets) -> msg => match msg {
                Ok(packet) => shared.consume_packet(&packet.data),
                Err(_) => {
                    shared.emit_err(Error::LinkClosed("packet channel closed".into()));
                    shared.abort(&stop);
                    return;
                }
            },
            recv(errors) -> msg => {
                match msg {
                    Ok(err) => shared.emit_err(err),
                    Err(_) => shared.emit_err(Error::LinkClosed("error channel closed".into())),
                }
                shared.abort(&stop);
                return;
            },
            default(RX_POLL) => {}
        }
    }
}

impl<L: ReaderLink> Shared<L> {
    fn apply_config(&self) -> Result<()> {
        let (cfg, addr) = {
            let state = self.state.lock();
            (state.cfg.clone(), state.reader_addr)
        };

        let mut commands: Vec<Vec<u8>> = Vec::with_capacity(6);
        commands.push(protocol::set_work_mode_command(addr, &[0x00]));
        if let Some((high, low)) = cfg.region {
            commands.push(protocol::set_region_command(addr, high, low));
        }
        commands.push(protocol::set_scan_time_command(addr, cfg.scan_time));
        commands.push(protocol::set_antenna_mux_command(addr, cfg.antenna_mask));
        if !cfg.per_antenna_power.is_empty() {
            commands.push(protocol::set_output_power_by_antenna_command(
                addr,
                &cfg.per_antenna_power,
            ));
        }
        // Global power last, as a fallback after optional per-antenna values.
        commands.push(protocol::set_output_power_command(addr, cfg.output_power));

        for command in commands {
            self.link.send_raw(&command, SEND_TIMEOUT)?;
        }
        Ok(())
    }

    /// Builds the next round's commands. `None` once the engine is stopping.
    fn next_round(&self) -> Option<(Vec<u8>, Option<Vec<u8>>, Duration)> {
        if !self.running.load(Ordering::SeqCst) {
            return None;
        }
        let mut state = self.state.lock();
        state.rounds += 1;

        let (antenna, next_idx) = next_inventory_antenna(state.cfg.antenna_mask, state.ant_idx);
        state.ant_idx = next_idx;

        let inventory = protocol::inventory_g2_command(
            state.reader_addr,
            state.cfg.q_value,
            state.cfg.session,
            0x00,
            0x00,
            state.target,
            antenna,
            state.cfg.scan_time,
        );
        let single = if state.cfg.single_fallback_each > 0
            && state.rounds % u64::from(state.cfg.single_fallback_each) == 0
        {
            Some(protocol::inventory_single_command(state.reader_addr))
        } else {
            None
        };

        Some((inventory, single, state.cfg.effective_interval()))
    }

    fn consume_packet(&self, data: &[u8]) {
        let frames = {
            let mut state = self.state.lock();
            state.parser.extend_from_slice(data);
            if state.parser.len() > PARSER_BUFFER_MAX {
                let keep_from = state.parser.len() - PARSER_BUFFER_KEEP;
                state.parser.drain(..keep_from);
            }
            let (frames, remaining) = protocol::parse_frames(&state.parser);
            state.parser = remaining;
            frames
        };

        for frame in frames {
            self.consume_frame(frame);
        }
    }

    fn consume_frame(&self, frame: Frame) {
        {
            let mut state = self.state.lock();
            if state.cfg.auto_address {
                state.reader_addr = frame.address;
            }
        }

        match frame.command {
            protocol::CMD_INVENTORY => self.handle_inventory_frame(&frame),
            protocol::CMD_INVENTORY_SINGLE => self.handle_single_frame(&frame),
            protocol::CMD_GET_READER_INFO => self.emit_status("reader info received"),
            _ => {}
        }
    }

    fn handle_inventory_frame(&self, frame: &Frame) {
        let tags = match protocol::parse_inventory_tags(frame) {
            Ok(tags) => tags,
            Err(err) => {
                self.emit_err(err);
                return;
            }
        };

        if !tags.is_empty() {
            for tag in tags {
                self.record_tag("inventory-g2", tag.antenna, tag.rssi, &tag.epc);
            }
            return;
        }

        if frame.status == protocol::STATUS_SUCCESS {
            if let Ok(count) = protocol::inventory_tag_count(frame) {
                if count > 0 {
                    self.emit_status(&format!("count-only inventory response: {}", count));
                }
            }
            return;
        }
        self.observe_no_tag(frame.status);
    }

    fn handle_single_frame(&self, frame: &Frame) {
        let Ok(result) = protocol::parse_single_inventory(frame) else {
            return;
        };
        if result.tag_count > 0 && !result.epc.is_empty() {
            self.record_tag("inventory-single", result.antenna, 0, &result.epc);
        } else {
            self.observe_no_tag(frame.status);
        }
    }

    fn observe_no_tag(&self, status: u8) {
        match status {
            protocol::STATUS_NO_TAG | protocol::STATUS_NO_TAG_OR_TIMEOUT | 0x02 | 0x03 | 0x04 => {}
            _ => return,
        }

        let switched_to = {
            let mut state = self.state.lock();
            state.no_tag_hits += 1;
            if state.cfg.session > 1
                && state.cfg.no_tag_ab_switch > 0
                && state.no_tag_hits >= state.cfg.no_tag_ab_switch
            {
                state.target ^= 0x01;
                state.no_tag_hits = 0;
                Some(state.target)
            } else {
                None
            }
        };

        if let Some(target) = switched_to {
            self.emit_status(&format!("target switched to {}", target_label(target)));
        }
    }

    fn record_tag(&self, source: &'static str, antenna: u8, rssi: u8, epc: &[u8]) {
        if epc.is_empty() {
            return;
        }
        let mut epc_text = String::with_capacity(epc.len() * 2);
        for byte in epc {
            let _ = write!(epc_text, "{:02X}", byte);
        }

        let (is_new, rounds, unique) = {
            let mut state = self.state.lock();
            state.no_tag_hits = 0;
            let is_new = state.seen.insert(epc_text.clone());
            if is_new {
                state.unique_tags += 1;
            }
            state.last_tag_epc = epc_text.clone();
            (is_new, state.rounds, state.unique_tags)
        };

        self.emit_tag(TagEvent {
            when: SystemTime::now(),
            source,
            epc: epc_text,
            antenna,
            rssi,
            is_new,
            rounds,
            unique_tags: unique,
        });
    }

    /// Stops the run from inside a loop thread; `stop()` joins later.
    fn abort(&self, stop: &AtomicBool) {
        stop.store(true, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
    }

    fn emit_tag(&self, event: TagEvent) {
        let _ = self.tags_tx.try_send(event);
    }

    fn emit_status(&self, message: &str) {
        let _ = self.statuses_tx.try_send(StatusEvent {
            when: SystemTime::now(),
            message: message.to_string(),
        });
    }

    fn emit_err(&self, err: Error) {
        let _ = self.errors_tx.try_send(err);
    }
}

fn target_label(target: u8) -> &'static str {
    if target & 0x01 == 0 {
        "A"
    } else {
        "B"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        build_command, CMD_GET_READER_INFO, CMD_INVENTORY, CMD_INVENTORY_SINGLE,
        CMD_SET_ANTENNA_MUX, CMD_SET_WORK_MODE, STATUS_NO_TAG, STATUS_NO_TAG_OR_TIMEOUT,
        STATUS_SUCCESS,
    };
    use crate::transport::MockLink;

    const WAIT: Duration = Duration::from_secs(2);

    fn quick_config() -> InventoryConfig {
        InventoryConfig {
            poll_interval: Duration::from_millis(40),
            ..InventoryConfig::default()
        }
    }

    fn g2_response(address: u8, antenna: u8, epc: &[u8], rssi: u8) -> Vec<u8> {
        let mut data = vec![STATUS_SUCCESS, antenna, 0x01, epc.len() as u8];
        data.extend_from_slice(epc);
        data.push(rssi);
        build_command(address, CMD_INVENTORY, &data)
    }

    fn no_tag_response(address: u8) -> Vec<u8> {
        build_command(address, CMD_INVENTORY, &[STATUS_NO_TAG_OR_TIMEOUT])
    }

    fn wait_status(reader: &Reader<MockLink>, needle: &str) -> StatusEvent {
        let statuses = reader.statuses();
        let deadline = std::time::Instant::now() + WAIT;
        while std::time::Instant::now() < deadline {
            if let Ok(event) = statuses.recv_timeout(Duration::from_millis(100)) {
                if event.message.contains(needle) {
                    return event;
                }
            }
        }
        panic!("status event containing {:?} not observed", needle);
    }

    #[test]
    fn start_applies_config_and_refuses_second_start() {
        let link = Arc::new(MockLink::new());
        let reader = Reader::with_config(Arc::clone(&link), quick_config());

        reader.start().unwrap();
        assert!(reader.is_running());
        assert!(matches!(reader.start(), Err(Error::InventoryRunning)));

        let written = link.written();
        assert!(written.len() >= 4);
        assert_eq!(written[0][2], CMD_SET_WORK_MODE);
        assert!(written.iter().any(|cmd| cmd[2] == CMD_SET_ANTENNA_MUX));

        reader.stop();
        assert!(!reader.is_running());
        // A fresh start is allowed after stop.
        reader.start().unwrap();
        reader.stop();
    }

    #[test]
    fn g2_frame_emits_deduped_tag_events() {
        let link = Arc::new(MockLink::new());
        let reader = Reader::with_config(Arc::clone(&link), quick_config());
        let tags = reader.tags();
        reader.start().unwrap();

        link.inject(&g2_response(0x01, 0x81, &[0xE2, 0x00, 0x10], 0x30));
        let first = tags.recv_timeout(WAIT).unwrap();
        assert!(first.is_new);
        assert_eq!(first.epc, "E20010");
        assert_eq!(first.antenna, 0x81);
        assert_eq!(first.rssi, 0x30);
        assert_eq!(first.unique_tags, 1);

        link.inject(&g2_response(0x01, 0x81, &[0xE2, 0x00, 0x10], 0x2A));
        let second = tags.recv_timeout(WAIT).unwrap();
        assert!(!second.is_new);
        assert_eq!(second.unique_tags, 1);

        reader.stop();
    }

    #[test]
    fn torn_frame_across_bursts_still_decodes() {
        let link = Arc::new(MockLink::new());
        let reader = Reader::with_config(Arc::clone(&link), quick_config());
        let tags = reader.tags();
        reader.start().unwrap();

        let frame = g2_response(0x01, 0x80, &[0xAB, 0xCD], 0x11);
        let (head, tail) = frame.split_at(3);
        link.inject(head);
        link.inject(tail);

        let event = tags.recv_timeout(WAIT).unwrap();
        assert_eq!(event.epc, "ABCD");
        reader.stop();
    }

    #[test]
    fn no_tag_rounds_flip_target_and_tag_resets_counter() {
        let link = Arc::new(MockLink::new());
        let cfg = InventoryConfig {
            session: 2,
            no_tag_ab_switch: 3,
            target: 0,
            ..quick_config()
        };
        let reader = Reader::with_config(Arc::clone(&link), cfg);
        reader.start().unwrap();

        for _ in 0..3 {
            link.inject(&no_tag_response(0x01));
        }
        wait_status(&reader, "target switched to B");
        assert_eq!(reader.stats().target, 1);

        // A successful read resets the counter...
        link.inject(&g2_response(0x01, 0x80, &[0x01, 0x02], 0x20));
        let tags = reader.tags();
        tags.recv_timeout(WAIT).unwrap();

        // ...so three more empty rounds flip back to A.
        for _ in 0..3 {
            link.inject(&no_tag_response(0x01));
        }
        wait_status(&reader, "target switched to A");
        assert_eq!(reader.stats().target, 0);

        reader.stop();
    }

    #[test]
    fn count_only_response_is_a_status_event() {
        let link = Arc::new(MockLink::new());
        let reader = Reader::with_config(Arc::clone(&link), quick_config());
        reader.start().unwrap();

        link.inject(&build_command(0x01, CMD_INVENTORY, &[STATUS_SUCCESS, 0x05]));
        let event = wait_status(&reader, "count-only inventory response: 5");
        assert!(event.message.contains('5'));

        assert!(reader.tags().try_recv().is_err());
        reader.stop();
    }

    #[test]
    fn single_inventory_frame_records_tag() {
        let link = Arc::new(MockLink::new());
        let reader = Reader::with_config(Arc::clone(&link), quick_config());
        let tags = reader.tags();
        reader.start().unwrap();

        let data = [STATUS_NO_TAG, 0x82, 0x01, 0x02, 0xBE, 0xEF];
        link.inject(&build_command(0x01, CMD_INVENTORY_SINGLE, &data));

        let event = tags.recv_timeout(WAIT).unwrap();
        assert_eq!(event.source, "inventory-single");
        assert_eq!(event.epc, "BEEF");
        reader.stop();
    }

    #[test]
    fn reader_info_frame_and_auto_address_learn() {
        let link = Arc::new(MockLink::new());
        let reader = Reader::with_config(Arc::clone(&link), quick_config());
        reader.start().unwrap();

        link.inject(&build_command(0x07, CMD_GET_READER_INFO, &[STATUS_SUCCESS, 0x01]));
        wait_status(&reader, "reader info received");
        assert_eq!(reader.stats().reader_address, 0x07);

        reader.stop();
    }

    #[test]
    fn link_error_ends_the_run_with_an_error_event() {
        let link = Arc::new(MockLink::new());
        let reader = Reader::with_config(Arc::clone(&link), quick_config());
        let errors = reader.errors();
        reader.start().unwrap();

        link.inject_error(Error::LinkClosed("test".into()));
        assert!(errors.recv_timeout(WAIT).is_ok());

        let deadline = std::time::Instant::now() + WAIT;
        while reader.is_running() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!reader.is_running());
        reader.stop();
    }

    #[test]
    fn single_fallback_issued_every_nth_round() {
        let link = Arc::new(MockLink::new());
        let cfg = InventoryConfig {
            single_fallback_each: 2,
            ..quick_config()
        };
        let reader = Reader::with_config(Arc::clone(&link), cfg);
        reader.start().unwrap();

        let deadline = std::time::Instant::now() + WAIT;
        loop {
            let singles = link
                .written()
                .iter()
                .filter(|cmd| cmd[2] == CMD_INVENTORY_SINGLE)
                .count();
            if singles >= 2 {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "no single fallback seen");
            thread::sleep(Duration::from_millis(20));
        }
        reader.stop();
    }

    #[test]
    fn probe_info_writes_reader_info_command() {
        let link = Arc::new(MockLink::new());
        let reader = Reader::with_config(Arc::clone(&link), quick_config());
        reader.probe_info().unwrap();

        let written = link.written();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0][2], CMD_GET_READER_INFO);
    }
}
