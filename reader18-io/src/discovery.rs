//! LAN discovery: sweep candidate endpoints, score them, verify the real
//! readers.
//!
//! The sweep expands every up, non-loopback IPv4 interface into host/port
//! targets and dials them from a bounded worker pool. Reachable endpoints get
//! a heuristic score; candidates above the verification floor are probed with
//! GetReaderInfo to separate actual readers from ports that merely accepted
//! the connection. Unverified candidates are kept so an operator can still
//! connect manually.

use crate::error::Result;
use crate::protocol;
use crate::types::Endpoint;
use crossbeam_channel::unbounded;
use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Vendor-common reader ports, most likely first.
pub const DEFAULT_PORTS: &[u16] = &[6000, 4001, 5000, 2022, 10001, 8899, 9090];

const BANNER_READ_TIMEOUT: Duration = Duration::from_millis(150);
const BANNER_MAX: usize = 64;
const VERIFY_REPLY_WINDOW: Duration = Duration::from_secs(1);
const VERIFY_POLL: Duration = Duration::from_millis(100);
/// Candidates scoring below this are listed but not probed.
const VERIFY_MIN_SCORE: i32 = 2;
const FAST_ACCEPT: Duration = Duration::from_millis(50);

/// Controls LAN discovery behavior.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub ports: Vec<u16>,
    /// Per-attempt dial timeout.
    pub dial_timeout: Duration,
    pub concurrency: usize,
    pub host_limit_per_interface: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        ScanOptions {
            ports: DEFAULT_PORTS.to_vec(),
            dial_timeout: Duration::from_millis(300),
            concurrency: 256,
            host_limit_per_interface: 254,
        }
    }
}

/// One discovered endpoint with scoring and verification metadata.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub host: String,
    pub port: u16,
    pub score: i32,
    pub banner: String,
    pub reason: String,
    pub verified: bool,
    pub reader_address: u8,
    pub protocol: String,
}

impl Candidate {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }
}

/// Scans the LAN for probable reader endpoints.
///
/// Raising `cancel` stops the sweep early; whatever was found so far is
/// returned, sorted verified-first then by score.
pub fn scan(opts: &ScanOptions, cancel: &Arc<AtomicBool>) -> Result<Vec<Candidate>> {
    let targets = interface_targets(opts)?;
    log::debug!("discovery sweep over {} targets", targets.len());

    let mut candidates = sweep(targets, opts, cancel);
    verify_all(&mut candidates, opts, cancel);
    sort_candidates(&mut candidates);
    Ok(candidates)
}

fn interface_targets(opts: &ScanOptions) -> Result<Vec<(String, u16)>> {
    let mut targets = Vec::new();
    for iface in if_addrs::get_if_addrs()? {
        if iface.is_loopback() {
            continue;
        }
        let if_addrs::IfAddr::V4(ref v4) = iface.addr else {
            continue;
        };
        let hosts = expand_hosts(v4.ip, v4.netmask, opts.host_limit_per_interface);
        log::debug!("interface {}: {} hosts", iface.name, hosts.len());
        for host in hosts {
            for &port in &opts.ports {
                targets.push((host.to_string(), port));
            }
        }
    }
    Ok(targets)
}

/// Expands the host bits of `ip`/`netmask`, skipping the network and
/// broadcast addresses, capped at `limit` hosts.
fn expand_hosts(ip: Ipv4Addr, netmask: Ipv4Addr, limit: usize) -> Vec<Ipv4Addr> {
    let ip = u32::from(ip);
    let mask = u32::from(netmask);
    if mask == u32::MAX || mask.leading_ones() >= 31 {
        return Vec::new();
    }

    let network = ip & mask;
    let broadcast = network | !mask;
    let mut hosts = Vec::new();
    for addr in (network + 1)..broadcast {
        if hosts.len() >= limit {
            break;
        }
        hosts.push(Ipv4Addr::from(addr));
    }
    hosts
}

/// Dials every target from a bounded worker pool and scores the reachable
/// ones. Unreachable targets are silently discarded.
pub fn sweep(
    targets: Vec<(String, u16)>,
    opts: &ScanOptions,
    cancel: &Arc<AtomicBool>,
) -> Vec<Candidate> {
    if targets.is_empty() {
        return Vec::new();
    }

    let workers = opts.concurrency.clamp(1, targets.len());
    let (target_tx, target_rx) = unbounded::<(String, u16)>();
    let (result_tx, result_rx) = unbounded::<Candidate>();
    for target in targets {
        let _ = target_tx.send(target);
    }
    drop(target_tx);

    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let target_rx = target_rx.clone();
        let result_tx = result_tx.clone();
        let cancel = Arc::clone(cancel);
        let dial_timeout = opts.dial_timeout;
        handles.push(thread::spawn(move || {
            while let Ok((host, port)) = target_rx.recv() {
                if cancel.load(Ordering::Relaxed) {
                    return;
                }
                if let Some(candidate) = probe_target(&host, port, dial_timeout) {
                    let _ = result_tx.send(candidate);
                }
            }
        }));
    }
    drop(result_tx);

    let mut candidates: Vec<Candidate> = result_rx.iter().collect();
    for handle in handles {
        let _ = handle.join();
    }
    candidates.sort_by(|a, b| (&a.host, a.port).cmp(&(&b.host, b.port)));
    candidates
}

fn probe_target(host: &str, port: u16, dial_timeout: Duration) -> Option<Candidate> {
    let addr: SocketAddr = format!("{}:{}", host, port).parse().ok()?;
    let started = Instant::now();
    let stream = TcpStream::connect_timeout(&addr, dial_timeout).ok()?;
    let elapsed = started.elapsed();

    let banner = read_banner(&stream);
    let (score, reason) = score_endpoint(port, &banner, elapsed);

    Some(Candidate {
        host: host.to_string(),
        port,
        score,
        banner: printable_banner(&banner),
        reason,
        verified: false,
        reader_address: 0,
        protocol: String::new(),
    })
}

/// Opportunistic banner grab with a tight deadline; many readers say nothing
/// until spoken to, so an empty banner is normal.
fn read_banner(stream: &TcpStream) -> Vec<u8> {
    if stream.set_read_timeout(Some(BANNER_READ_TIMEOUT)).is_err() {
        return Vec::new();
    }
    let mut buf = [0u8; BANNER_MAX];
    match (&*stream).read(&mut buf) {
        Ok(n) if n > 0 => buf[..n].to_vec(),
        _ => Vec::new(),
    }
}

/// Scores a reachable endpoint. The reason records the strongest signal.
fn score_endpoint(port: u16, banner: &[u8], elapsed: Duration) -> (i32, String) {
    let mut signals: Vec<(i32, &str)> = vec![(1, "tcp accept")];

    if DEFAULT_PORTS.contains(&port) {
        signals.push((3, "known reader port"));
    }
    if !banner.is_empty() {
        let (frames, _) = protocol::parse_frames(banner);
        let text = String::from_utf8_lossy(banner).to_uppercase();
        if !frames.is_empty() {
            signals.push((4, "reader18 frame in banner"));
        } else if text.contains("RFID") || text.contains("UHF") || text.contains("READER") {
            signals.push((2, "vendor banner"));
        } else {
            signals.push((1, "unsolicited banner"));
        }
    }
    if elapsed < FAST_ACCEPT {
        signals.push((1, "fast accept"));
    }

    let score = signals.iter().map(|(points, _)| points).sum();
    let reason = signals
        .iter()
        .max_by_key(|(points, _)| *points)
        .map(|(_, reason)| reason.to_string())
        .unwrap_or_default();
    (score, reason)
}

fn printable_banner(banner: &[u8]) -> String {
    banner
        .iter()
        .map(|&b| {
            if (0x20..0x7F).contains(&b) {
                b as char
            } else {
                '.'
            }
        })
        .collect()
}

fn verify_all(candidates: &mut [Candidate], opts: &ScanOptions, cancel: &Arc<AtomicBool>) {
    for candidate in candidates.iter_mut() {
        if cancel.load(Ordering::Relaxed) {
            return;
        }
        if candidate.score < VERIFY_MIN_SCORE {
            continue;
        }
        if let Some((address, protocol)) =
            verify_endpoint(&candidate.host, candidate.port, opts.dial_timeout)
        {
            candidate.verified = true;
            candidate.reader_address = address;
            candidate.protocol = protocol;
        }
    }
}

/// Asks the endpoint for reader info on a fresh connection. Only a CRC-valid
/// Reader18 reply counts; anything else leaves the candidate unverified.
pub fn verify_endpoint(host: &str, port: u16, dial_timeout: Duration) -> Option<(u8, String)> {
    let addr: SocketAddr = format!("{}:{}", host, port).parse().ok()?;
    let stream = TcpStream::connect_timeout(&addr, dial_timeout).ok()?;
    stream.set_read_timeout(Some(VERIFY_POLL)).ok()?;

    for probe_addr in [
        protocol::BROADCAST_READER_ADDRESS,
        protocol::DEFAULT_READER_ADDRESS,
    ] {
        let command = protocol::reader_info_command(probe_addr);
        if (&stream).write_all(&command).is_err() {
            return None;
        }

        let mut collected = Vec::new();
        let deadline = Instant::now() + VERIFY_REPLY_WINDOW;
        let mut buf = [0u8; 512];
        while Instant::now() < deadline {
            match (&stream).read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    collected.extend_from_slice(&buf[..n]);
                    let (frames, _) = protocol::parse_frames(&collected);
                    if let Some(frame) = frames
                        .iter()
                        .find(|f| f.command == protocol::CMD_GET_READER_INFO)
                    {
                        return Some((frame.address, "reader18".to_string()));
                    }
                }
                Err(err)
                    if err.kind() == std::io::ErrorKind::WouldBlock
                        || err.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(_) => break,
            }
        }
    }
    None
}

/// Verified candidates first, then by score; ties keep sweep order.
fn sort_candidates(candidates: &mut [Candidate]) {
    candidates.sort_by_key(|c| (!c.verified, -c.score));
}
