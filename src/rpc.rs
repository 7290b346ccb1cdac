//! Minimal JSON-RPC over HTTP/1.1.
//!
//! One POST per call on a kept-open [`ConnSock`]. The daemon answers with a
//! single-line JSON body, so the response is read line by line until the
//! first line starting with `{`. Any failure leaves the socket drained and
//! reconnected so the next call starts from a clean stream.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value;

use crate::config::BtcdConfig;
use crate::ipc::conn::ConnSock;

/// Bound on each line read of the response.
pub const RPC_TIMEOUT: Duration = Duration::from_secs(5);

const STATUS_OK: &[u8] = b"HTTP/1.1 200 OK";

/// `user:pass` encoded for a Basic `Authorization` header.
pub fn basic_auth(user: &str, pass: &str) -> String {
    STANDARD.encode(format!("{user}:{pass}"))
}

/// Build the HTTP request carrying `body`.
pub fn build_request(url: &str, port: &str, auth: &str, body: &str) -> String {
    format!(
        "POST / HTTP/1.1\r\n\
         Authorization: Basic {auth}\r\n\
         Host: {url}:{port}\r\n\
         Content-type: application/json\r\n\
         Content-Length: {}\r\n\r\n{body}",
        body.len()
    )
}

/// Connection to a daemon, opened eagerly. A failed connect is logged and
/// retried by the first call.
pub fn connect_btcd(btcd: &BtcdConfig) -> ConnSock {
    let (host, port) = btcd.host_port();
    let mut cs = ConnSock::with_endpoint(host, port, basic_auth(&btcd.auth, &btcd.pass));
    if let Err(e) = cs.connect() {
        tracing::warn!(url = %btcd.url, error = %e, "Failed to connect socket to btcd");
    }
    cs
}

fn status_ok(line: &str) -> bool {
    line.len() >= STATUS_OK.len() && line.as_bytes()[..STATUS_OK.len()].eq_ignore_ascii_case(STATUS_OK)
}

/// Perform one call. `None` means the call failed; the reason is logged.
pub fn json_rpc_call(cs: &mut ConnSock, rpc_req: &str) -> Option<Value> {
    if cs.url.is_empty() {
        tracing::warn!("No URL in json_rpc_call");
        return None;
    }
    if cs.port.is_empty() {
        tracing::warn!("No port in json_rpc_call");
        return None;
    }
    if cs.auth.is_empty() {
        tracing::warn!("No auth in json_rpc_call");
        return None;
    }
    if rpc_req.is_empty() {
        tracing::warn!("Zero length rpc_req passed to json_rpc_call");
        return None;
    }
    if !cs.is_open()
        && let Err(e) = cs.connect()
    {
        tracing::warn!(url = %cs.url, port = %cs.port, error = %e, "No connection in json_rpc_call");
        return None;
    }

    let val = exchange(cs, rpc_req);

    cs.drain();
    cs.empty_buffer();
    if val.is_none() {
        tracing::warn!(url = %cs.url, port = %cs.port, "Reopening socket");
        if let Err(e) = cs.connect() {
            tracing::warn!(url = %cs.url, port = %cs.port, error = %e, "Failed to reopen socket");
        }
    }
    val
}

fn exchange(cs: &mut ConnSock, rpc_req: &str) -> Option<Value> {
    let http_req = build_request(&cs.url, &cs.port, &cs.auth, rpc_req);
    if let Err(e) = cs.write_all(http_req.as_bytes()) {
        tracing::warn!(error = %e, "Failed to write to socket in json_rpc_call");
        return None;
    }

    let status = match cs.read_line(Some(RPC_TIMEOUT)) {
        Ok(line) => line,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read socket line in json_rpc_call");
            return None;
        }
    };
    if !status_ok(&status) {
        tracing::warn!(status = %status, "HTTP response not ok");
        return None;
    }

    let body = loop {
        match cs.read_line(Some(RPC_TIMEOUT)) {
            Ok(line) if line.starts_with('{') => break line,
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read http socket lines in json_rpc_call");
                return None;
            }
        }
    };

    match serde_json::from_str(&body) {
        Ok(val) => Some(val),
        Err(e) => {
            tracing::warn!(line = e.line(), error = %e, "JSON decode failed");
            None
        }
    }
}
