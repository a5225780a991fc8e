//! Control socket: line-delimited JSON request/response over a local unix
//! domain socket, exposing the ingest service to other processes.

use crate::error::Result;
use crate::service::{IngestResult, Service, Stats};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Per-connection request line cap.
const MAX_LINE: u64 = 1 << 20;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// The reader supervisor as the control socket sees it.
pub trait Scanner: Send + Sync {
    fn start(&self) -> Result<()>;
    fn stop(&self);
}

#[derive(Debug, Deserialize)]
struct Request {
    #[serde(rename = "type", default)]
    request_type: String,
    #[serde(default)]
    source: String,
    #[serde(default)]
    epc: String,
    #[serde(default)]
    epcs: Vec<String>,
}

#[derive(Serialize)]
struct Response {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    action: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    warning: Option<String>,
    #[serde(rename = "replayed_seen", skip_serializing_if = "Option::is_none")]
    replay: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    added: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    results: Option<Vec<IngestResult>>,
    stats: Stats,
}

impl Response {
    fn ok(action: &'static str, stats: Stats) -> Self {
        Response {
            ok: true,
            action: Some(action),
            error: None,
            warning: None,
            replay: None,
            added: None,
            results: None,
            stats,
        }
    }

    fn err(action: Option<&'static str>, error: String, stats: Stats) -> Self {
        Response {
            ok: false,
            action,
            error: Some(error),
            warning: None,
            replay: None,
            added: None,
            results: None,
            stats,
        }
    }
}

pub struct IpcServer {
    socket_path: String,
    svc: Arc<Service>,
    scanner: Option<Arc<dyn Scanner>>,
    stop: Arc<AtomicBool>,
    accept_handle: Option<JoinHandle<()>>,
}

impl IpcServer {
    pub fn new(socket_path: &str, svc: Arc<Service>, scanner: Option<Arc<dyn Scanner>>) -> Self {
        IpcServer {
            socket_path: socket_path.trim().to_string(),
            svc,
            scanner,
            stop: Arc::new(AtomicBool::new(false)),
            accept_handle: None,
        }
    }

    /// Binds the socket (parent dir auto-created, stale socket unlinked,
    /// mode 0666) and spawns the accept loop.
    pub fn start(&mut self) -> Result<()> {
        if self.socket_path.is_empty() {
            return Ok(());
        }

        let path = Path::new(&self.socket_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let _ = std::fs::remove_file(path);

        let listener = UnixListener::bind(path)?;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666));
        listener.set_nonblocking(true)?;
        log::info!("ipc listening on {}", self.socket_path);

        let stop = Arc::clone(&self.stop);
        let svc = Arc::clone(&self.svc);
        let scanner = self.scanner.clone();
        let socket_path = self.socket_path.clone();

        let handle = thread::Builder::new()
            .name("ipc-accept".to_string())
            .spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    match listener.accept() {
                        Ok((stream, _)) => {
                            let svc = Arc::clone(&svc);
                            let scanner = scanner.clone();
                            let _ = thread::Builder::new()
                                .name("ipc-conn".to_string())
                                .spawn(move || handle_conn(stream, svc, scanner));
                        }
                        Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                            thread::sleep(ACCEPT_BACKOFF);
                        }
                        Err(err) => {
                            // Transient accept failures must not kill the server.
                            log::warn!("ipc accept error: {}", err);
                            thread::sleep(ACCEPT_BACKOFF);
                        }
                    }
                }
                let _ = std::fs::remove_file(&socket_path);
            })?;
        self.accept_handle = Some(handle);
        Ok(())
    }

    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.accept_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn handle_conn(stream: UnixStream, svc: Arc<Service>, scanner: Option<Arc<dyn Scanner>>) {
    let Ok(write_half) = stream.try_clone() else {
        return;
    };
    let mut writer = write_half;
    let mut reader = BufReader::new(stream);

    loop {
        let mut line = String::new();
        match (&mut reader).take(MAX_LINE).read_line(&mut line) {
            Ok(0) => return,
            Ok(_) => {}
            Err(_) => return,
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(line) {
            Ok(request) => handle_request(request, &svc, scanner.as_deref()),
            Err(_) => Response::err(None, "invalid json".to_string(), svc.status()),
        };

        let Ok(mut encoded) = serde_json::to_vec(&response) else {
            return;
        };
        encoded.push(b'\n');
        if writer.write_all(&encoded).is_err() {
            return;
        }
    }
}

fn handle_request(request: Request, svc: &Arc<Service>, scanner: Option<&dyn Scanner>) -> Response {
    let request_type = request.request_type.trim().to_lowercase();
    let source = {
        let s = request.source.trim();
        if s.is_empty() { "ipc" } else { s }.to_string()
    };

    match request_type.as_str() {
        "status" => Response::ok("status", svc.status()),

        "scan_start" => {
            if let Err(err) = svc.refresh_cache("ipc_scan_start", false) {
                return Response::err(Some("scan_start"), err.to_string(), svc.status());
            }
            let replay = svc.set_scan_active(true, "ipc_scan_start");
            let warning = scanner.and_then(|scanner| {
                scanner
                    .start()
                    .err()
                    .map(|err| format!("scan active, reader start failed: {}", err))
            });
            Response {
                replay: Some(replay),
                warning,
                ..Response::ok("scan_start", svc.status())
            }
        }

        "scan_stop" => {
            if let Some(scanner) = scanner {
                scanner.stop();
            }
            svc.set_scan_active(false, "ipc_scan_stop");
            Response::ok("scan_stop", svc.status())
        }

        "turbo" => match svc.refresh_cache("ipc_turbo", false) {
            Ok(()) => Response::ok("turbo", svc.status()),
            Err(err) => Response::err(Some("turbo"), err.to_string(), svc.status()),
        },

        "epc" => {
            let result = svc.handle_epc(&request.epc, &source);
            Response {
                results: Some(vec![result]),
                ..Response::ok("epc", svc.status())
            }
        }

        "epcs" => {
            let results = request
                .epcs
                .iter()
                .map(|epc| svc.handle_epc(epc, &source))
                .collect();
            Response {
                results: Some(results),
                ..Response::ok("epcs", svc.status())
            }
        }

        "draft_epc" => {
            let (added, replay) = svc.add_draft_epcs(&[request.epc]);
            Response {
                added: Some(added),
                replay: Some(replay),
                ..Response::ok("draft_epc", svc.status())
            }
        }

        "draft_epcs" => {
            let (added, replay) = svc.add_draft_epcs(&request.epcs);
            Response {
                added: Some(added),
                replay: Some(replay),
                ..Response::ok("draft_epcs", svc.status())
            }
        }

        _ => Response::err(
            None,
            format!("unsupported type: {}", request.request_type),
            svc.status(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Store;
    use crate::config::Config;
    use std::io::BufRead;

    fn test_service() -> Arc<Service> {
        let cfg = Config {
            scan_default_active: false,
            worker_count: 1,
            queue_size: 64,
            ..Config::default()
        };
        Arc::new(Service::new(cfg, None, Arc::new(Store::new())))
    }

    fn socket_path(tag: &str) -> String {
        let dir = std::env::temp_dir().join("tagsink-ipc-tests");
        let pid = std::process::id();
        dir.join(format!("{}-{}.sock", tag, pid))
            .to_string_lossy()
            .to_string()
    }

    fn request(stream: &mut UnixStream, line: &str) -> serde_json::Value {
        stream.write_all(line.as_bytes()).unwrap();
        stream.write_all(b"\n").unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut reply = String::new();
        reader.read_line(&mut reply).unwrap();
        serde_json::from_str(&reply).unwrap()
    }

    #[test]
    fn status_and_unknown_requests() {
        let svc = test_service();
        let path = socket_path("status");
        let mut server = IpcServer::new(&path, Arc::clone(&svc), None);
        server.start().unwrap();

        let mut stream = UnixStream::connect(&path).unwrap();
        let reply = request(&mut stream, r#"{"type":"status"}"#);
        assert_eq!(reply["ok"], true);
        assert_eq!(reply["action"], "status");
        assert_eq!(reply["stats"]["scan_active"], false);

        let reply = request(&mut stream, r#"{"type":"bogus"}"#);
        assert_eq!(reply["ok"], false);
        assert!(reply["error"].as_str().unwrap().contains("unsupported type"));

        server.shutdown();
    }

    #[test]
    fn invalid_json_keeps_connection_usable() {
        let svc = test_service();
        let path = socket_path("badjson");
        let mut server = IpcServer::new(&path, Arc::clone(&svc), None);
        server.start().unwrap();

        let mut stream = UnixStream::connect(&path).unwrap();
        let reply = request(&mut stream, "{nope");
        assert_eq!(reply["ok"], false);
        assert_eq!(reply["error"], "invalid json");

        let reply = request(&mut stream, r#"{"type":"status"}"#);
        assert_eq!(reply["ok"], true);

        server.shutdown();
    }

    #[test]
    fn epc_and_draft_requests_flow_through_the_service() {
        let svc = test_service();
        let path = socket_path("flow");
        let mut server = IpcServer::new(&path, Arc::clone(&svc), None);
        server.start().unwrap();

        let mut stream = UnixStream::connect(&path).unwrap();

        // Scan is off, so observations park in recent-seen.
        let reply = request(&mut stream, r#"{"type":"epc","epc":"E2AA","source":"test"}"#);
        assert_eq!(reply["results"][0]["action"], "scan_inactive");

        // The earlier observation is a replay candidate now that its draft
        // exists, even though the inactive scan keeps it out of the queue.
        let reply = request(&mut stream, r#"{"type":"draft_epcs","epcs":["E2AA","E2BB"]}"#);
        assert_eq!(reply["added"], 2);
        assert_eq!(reply["replayed_seen"], 1);
        assert_eq!(reply["stats"]["cache_size"], 2);

        let reply = request(&mut stream, r#"{"type":"epcs","epcs":["E2AA",""]}"#);
        let results = reply["results"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[1]["action"], "invalid");

        server.shutdown();
    }

    #[test]
    fn scan_stop_flips_the_flag() {
        let svc = test_service();
        svc.set_scan_active(true, "test");
        let path = socket_path("scanstop");
        let mut server = IpcServer::new(&path, Arc::clone(&svc), None);
        server.start().unwrap();

        let mut stream = UnixStream::connect(&path).unwrap();
        let reply = request(&mut stream, r#"{"type":"scan_stop"}"#);
        assert_eq!(reply["ok"], true);
        assert_eq!(reply["stats"]["scan_active"], false);
        assert!(!svc.scan_active());

        server.shutdown();
    }

    #[test]
    fn scan_start_without_erp_reports_refresh_error() {
        let svc = test_service();
        let path = socket_path("scanstart");
        let mut server = IpcServer::new(&path, Arc::clone(&svc), None);
        server.start().unwrap();

        let mut stream = UnixStream::connect(&path).unwrap();
        let reply = request(&mut stream, r#"{"type":"scan_start"}"#);
        assert_eq!(reply["ok"], false);
        assert!(reply["error"].as_str().unwrap().contains("ERP"));
        // The refresh failed before the flag flip.
        assert!(!svc.scan_active());

        server.shutdown();
    }
}
