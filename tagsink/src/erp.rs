//! ERP HTTP client: fetch open draft EPCs, submit stock entries by EPC.
//!
//! Plain blocking JSON over HTTPS. Response bodies are capped at 4 MiB so a
//! misbehaving endpoint cannot balloon memory; non-2xx replies surface a
//! truncated body snippet.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::io::Read;
use std::time::Duration;

const BODY_CAP: u64 = 4 << 20;
const SNIPPET_MAX: usize = 320;

/// Strips a raw scan to uppercase hex. Empty output means the input carried
/// no EPC at all; every boundary rejects it.
pub fn normalize_epc(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter_map(|ch| {
            let up = ch.to_ascii_uppercase();
            if up.is_ascii_digit() || ('A'..='F').contains(&up) {
                Some(up)
            } else {
                None
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResult {
    pub epcs: Vec<String>,
    pub draft_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitStatus {
    Submitted,
    NotFound,
}

/// The ERP operations the ingest service depends on. The production
/// implementation is [`Client`]; tests plug in stubs.
pub trait Erp: Send + Sync {
    fn fetch_draft_epcs(&self, timeout: Duration) -> Result<FetchResult>;
    fn submit_by_epc(&self, epc: &str, timeout: Duration) -> Result<SubmitStatus>;
}

pub struct Client {
    base_url: String,
    auth: String,
    agent: ureq::Agent,
}

impl Client {
    pub fn new(base_url: &str, api_key: &str, api_secret: &str) -> Self {
        Client {
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            auth: format!("token {}:{}", api_key.trim(), api_secret.trim()),
            agent: ureq::AgentBuilder::new().build(),
        }
    }

    fn read_body(response: ureq::Response) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        response
            .into_reader()
            .take(BODY_CAP)
            .read_to_end(&mut body)?;
        Ok(body)
    }

    fn call(&self, request: ureq::Request, body: Option<&[u8]>) -> Result<Vec<u8>> {
        let result = match body {
            Some(bytes) => request.send_bytes(bytes),
            None => request.call(),
        };
        match result {
            Ok(response) => Self::read_body(response),
            Err(ureq::Error::Status(code, response)) => {
                let body = Self::read_body(response).unwrap_or_default();
                Err(Error::Erp(format!(
                    "HTTP {}: {}",
                    code,
                    compact_body(&body)
                )))
            }
            Err(err) => Err(Error::Erp(err.to_string())),
        }
    }
}

impl Erp for Client {
    fn fetch_draft_epcs(&self, timeout: Duration) -> Result<FetchResult> {
        let url = format!(
            "{}/api/method/titan_telegram.api.get_open_stock_entry_drafts_fast\
             ?limit=5000&include_items=0&only_with_epc=1&compact=1&epc_only=1",
            self.base_url
        );
        let request = self
            .agent
            .get(&url)
            .set("Authorization", &self.auth)
            .timeout(timeout);

        let body = self.call(request, None)?;
        let envelope: FastDraftEnvelope = serde_json::from_slice(&body)
            .map_err(|err| Error::Erp(format!("fast drafts decode: {}", err)))?;
        let msg = envelope.message;

        if !msg.ok {
            return Err(Error::Erp(format!("fast drafts error: {}", msg.error)));
        }
        if !msg.epc_only {
            return Err(Error::Erp("fast drafts response is not epc_only".into()));
        }

        let mut seen = std::collections::HashSet::with_capacity(msg.epcs.len());
        let mut epcs = Vec::with_capacity(msg.epcs.len());
        for raw in msg.epcs {
            let epc = normalize_epc(&raw);
            if epc.is_empty() || !seen.insert(epc.clone()) {
                continue;
            }
            epcs.push(epc);
        }

        let draft_count = if msg.count_drafts > 0 {
            msg.count_drafts
        } else {
            msg.draft_count
        };

        Ok(FetchResult { epcs, draft_count })
    }

    fn submit_by_epc(&self, epc: &str, timeout: Duration) -> Result<SubmitStatus> {
        let epc = normalize_epc(epc);
        if epc.is_empty() {
            return Err(Error::Erp("epc is empty".into()));
        }

        let url = format!(
            "{}/api/method/titan_telegram.api.submit_open_stock_entry_by_epc",
            self.base_url
        );
        let payload = serde_json::to_vec(&serde_json::json!({ "epc": epc }))?;
        let request = self
            .agent
            .post(&url)
            .set("Authorization", &self.auth)
            .set("Content-Type", "application/json")
            .timeout(timeout);

        let body = self.call(request, Some(&payload))?;
        let envelope: SubmitEnvelope = serde_json::from_slice(&body)
            .map_err(|err| Error::Erp(format!("submit decode: {}", err)))?;
        let msg = envelope.message;

        if msg.ok && msg.status == "submitted" {
            return Ok(SubmitStatus::Submitted);
        }
        if msg.ok && msg.status == "not_found" {
            return Ok(SubmitStatus::NotFound);
        }
        if !msg.error.is_empty() {
            return Err(Error::Erp(format!("submit error: {}", msg.error)));
        }
        Err(Error::Erp("submit unexpected payload".into()))
    }
}

fn compact_body(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.len() > SNIPPET_MAX {
        let mut end = SNIPPET_MAX;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &text[..end])
    } else {
        text.to_string()
    }
}

#[derive(Deserialize)]
struct FastDraftEnvelope {
    #[serde(default)]
    message: FastDraftMessage,
}

#[derive(Deserialize, Default)]
struct FastDraftMessage {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    error: String,
    #[serde(default)]
    epc_only: bool,
    #[serde(default)]
    epcs: Vec<String>,
    #[serde(default)]
    count_drafts: u64,
    #[serde(default)]
    draft_count: u64,
}

#[derive(Deserialize)]
struct SubmitEnvelope {
    #[serde(default)]
    message: SubmitMessage,
}

#[derive(Deserialize, Default)]
struct SubmitMessage {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    status: String,
    #[serde(default)]
    error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::thread;

    /// Minimal HTTP/1.1 fixture: serves one canned response per connection
    /// and records the raw request heads it saw.
    struct TestServer {
        port: u16,
        requests: Arc<Mutex<Vec<String>>>,
    }

    impl TestServer {
        fn serve(responses: Vec<(u16, &'static str)>) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            let port = listener.local_addr().unwrap().port();
            let requests = Arc::new(Mutex::new(Vec::new()));
            let seen = Arc::clone(&requests);

            thread::spawn(move || {
                for (status, body) in responses {
                    let Ok((stream, _)) = listener.accept() else {
                        return;
                    };
                    let mut reader = BufReader::new(stream);

                    let mut head = String::new();
                    let mut content_length = 0usize;
                    loop {
                        let mut line = String::new();
                        if reader.read_line(&mut line).unwrap_or(0) == 0 {
                            break;
                        }
                        if let Some(value) = line
                            .to_ascii_lowercase()
                            .strip_prefix("content-length:")
                            .map(str::trim)
                        {
                            content_length = value.parse().unwrap_or(0);
                        }
                        let done = line == "\r\n" || line == "\n";
                        head.push_str(&line);
                        if done {
                            break;
                        }
                    }
                    if content_length > 0 {
                        let mut body_buf = vec![0u8; content_length];
                        use std::io::Read;
                        let _ = reader.read_exact(&mut body_buf);
                        head.push_str(&String::from_utf8_lossy(&body_buf));
                    }
                    seen.lock().push(head);

                    let mut stream = reader.into_inner();
                    let reply = format!(
                        "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        status,
                        body.len(),
                        body
                    );
                    let _ = stream.write_all(reply.as_bytes());
                }
            });

            TestServer { port, requests }
        }

        fn url(&self) -> String {
            format!("http://127.0.0.1:{}", self.port)
        }
    }

    const TIMEOUT: Duration = Duration::from_secs(2);

    #[test]
    fn normalize_strips_everything_but_hex() {
        assert_eq!(normalize_epc("  e2-00:00 aa\t"), "E20000AA");
        assert_eq!(normalize_epc("xyz"), "");
        assert_eq!(normalize_epc(""), "");
    }

    #[test]
    fn fetch_parses_and_normalizes() {
        let server = TestServer::serve(vec![(
            200,
            r#"{"message":{"ok":true,"epc_only":true,"epcs":["e2-0001","E20001","E20002"],"count_drafts":3}}"#,
        )]);
        let client = Client::new(&server.url(), "k", "s");

        let result = client.fetch_draft_epcs(TIMEOUT).unwrap();
        assert_eq!(result.epcs, vec!["E20001".to_string(), "E20002".to_string()]);
        assert_eq!(result.draft_count, 3);

        let requests = server.requests.lock();
        assert!(requests[0].contains("get_open_stock_entry_drafts_fast"));
        assert!(requests[0].contains("epc_only=1"));
        assert!(requests[0].contains("Authorization: token k:s"));
    }

    #[test]
    fn fetch_uses_alternate_draft_count_field() {
        let server = TestServer::serve(vec![(
            200,
            r#"{"message":{"ok":true,"epc_only":true,"epcs":["AA"],"draft_count":7}}"#,
        )]);
        let client = Client::new(&server.url(), "k", "s");
        assert_eq!(client.fetch_draft_epcs(TIMEOUT).unwrap().draft_count, 7);
    }

    #[test]
    fn fetch_rejects_protocol_errors() {
        let server = TestServer::serve(vec![(
            200,
            r#"{"message":{"ok":false,"error":"nope"}}"#,
        )]);
        let client = Client::new(&server.url(), "k", "s");
        let err = client.fetch_draft_epcs(TIMEOUT).unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn fetch_surfaces_http_status_with_body_snippet() {
        let server = TestServer::serve(vec![(502, "bad gateway")]);
        let client = Client::new(&server.url(), "k", "s");
        let err = client.fetch_draft_epcs(TIMEOUT).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("502"));
        assert!(text.contains("bad gateway"));
    }

    #[test]
    fn submit_maps_statuses() {
        let server = TestServer::serve(vec![
            (200, r#"{"message":{"ok":true,"status":"submitted"}}"#),
            (200, r#"{"message":{"ok":true,"status":"not_found"}}"#),
            (200, r#"{"message":{"ok":false,"error":"db down"}}"#),
        ]);
        let client = Client::new(&server.url(), "k", "s");

        assert_eq!(
            client.submit_by_epc("E2AA", TIMEOUT).unwrap(),
            SubmitStatus::Submitted
        );
        assert_eq!(
            client.submit_by_epc("E2AA", TIMEOUT).unwrap(),
            SubmitStatus::NotFound
        );
        assert!(client.submit_by_epc("E2AA", TIMEOUT).is_err());

        let requests = server.requests.lock();
        assert!(requests[0].contains("submit_open_stock_entry_by_epc"));
        assert!(requests[0].contains(r#"{"epc":"E2AA"}"#));
        assert!(requests[0].contains("Content-Type: application/json"));
    }

    #[test]
    fn submit_rejects_empty_epc_without_network() {
        let client = Client::new("http://127.0.0.1:1", "k", "s");
        assert!(client.submit_by_epc("--", TIMEOUT).is_err());
    }

    #[test]
    fn compact_body_truncates_long_text() {
        let long = "x".repeat(500);
        let snippet = compact_body(long.as_bytes());
        assert!(snippet.ends_with("..."));
        assert!(snippet.len() <= SNIPPET_MAX + 3);
    }
}
