//! Sweeps the LAN and prints every candidate endpoint with its score and
//! verification result.

use reader18_io::discovery::{scan, ScanOptions};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let opts = ScanOptions::default();
    let cancel = Arc::new(AtomicBool::new(false));

    let started = std::time::Instant::now();
    let candidates = match scan(&opts, &cancel) {
        Ok(candidates) => candidates,
        Err(err) => {
            eprintln!("scan error: {}", err);
            return;
        }
    };

    println!("scan duration: {:?}", started.elapsed());
    println!("candidates: {}", candidates.len());
    for (i, c) in candidates.iter().enumerate() {
        println!(
            "{:2}) {}:{} verified={} addr=0x{:02X} proto={} score={} reason={} banner={:?}",
            i + 1,
            c.host,
            c.port,
            c.verified,
            c.reader_address,
            c.protocol,
            c.score,
            c.reason,
            c.banner,
        );
    }
}
