//! tagsink - RFID ingest daemon reconciling EPC reads against ERP drafts

mod cache;
mod config;
mod erp;
mod error;
mod ipc;
mod reader_mgr;
mod service;
mod testmode;

use crate::cache::Store;
use crate::config::Config;
use crate::erp::Erp;
use crate::ipc::{IpcServer, Scanner};
use crate::reader_mgr::ReaderManager;
use crate::service::{Notifier, Service};
use crate::testmode::TestMode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default notifier: progress messages go to the log. Chat front-ends plug
/// in their own implementation through the same trait.
struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, text: &str) {
        log::info!("[notify] {}", text);
    }
}

fn main() -> error::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("tagsink v0.4.0 starting...");
    let cfg = Config::load()?;

    let cache = Arc::new(Store::new());
    let erp_client: Arc<dyn Erp> = Arc::new(erp::Client::new(
        &cfg.erp_url,
        &cfg.erp_api_key,
        &cfg.erp_api_secret,
    ));
    let svc = Arc::new(Service::new(
        cfg.clone(),
        Some(erp_client),
        Arc::clone(&cache),
    ));

    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
    svc.set_notifier(Arc::clone(&notifier));

    let test_mode = Arc::new(TestMode::new());

    // Every unique tag read flows into the ingest pipeline and, when a test
    // session is live, into its tally.
    let epc_svc = Arc::clone(&svc);
    let epc_test = Arc::clone(&test_mode);
    let manager = ReaderManager::new(
        cfg.clone(),
        Box::new(move |epc| {
            let result = epc_svc.handle_epc(epc, "reader");
            log::debug!("epc {} -> {:?}", epc, result.action);

            let matched = epc_test.record_read(epc);
            if matched.matched && matched.newly_read {
                log::info!(
                    "test match {}/{}: {} (session {})",
                    matched.read_count,
                    matched.total,
                    matched.epc,
                    matched.session_id
                );
            }
        }),
    );
    manager.set_notifier(Arc::clone(&notifier));

    // One synchronous refresh so the first observations hit a warm cache. A
    // failure is not fatal: the periodic refresher keeps retrying.
    if let Err(err) = svc.bootstrap() {
        log::warn!("startup refresh failed: {}", err);
    }
    svc.run();

    let mut ipc_server = if !cfg.ipc_socket.is_empty() {
        let scanner: Arc<dyn Scanner> = Arc::new(manager.clone());
        let mut server = IpcServer::new(&cfg.ipc_socket, Arc::clone(&svc), Some(scanner));
        server.start()?;
        Some(server)
    } else {
        None
    };

    if cfg.auto_scan {
        if let Err(err) = manager.start() {
            log::warn!("auto scan start failed: {}", err);
        }
    }

    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    ctrlc::set_handler(move || {
        log::info!("received shutdown signal");
        flag.store(false, Ordering::SeqCst);
    })
    .map_err(|err| error::Error::Other(format!("signal handler: {}", err)))?;

    log::info!("tagsink running. Press Ctrl-C to stop.");
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
    }

    log::info!("shutting down...");
    if let Some(server) = ipc_server.as_mut() {
        server.shutdown();
    }
    manager.stop();
    svc.shutdown();
    log::info!("tagsink stopped");
    Ok(())
}
