//! HTTP-over-Unix-socket client for the in-sandbox runtime server
//!
//! The runtime inside the chroot listens on `<scratch>/comms.sock`
//! and speaks HTTP/1.1. Bodies are opaque bytes; nothing here parses
//! JSON.

use log::debug;
use std::io::{Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;
use zygote_core::{Result, ZygoteError};

/// Default request timeout against the in-sandbox server
pub const COMMS_TIMEOUT: Duration = Duration::from_secs(3);

/// `sockaddr_un.sun_path` capacity
pub const MAX_SOCK_PATH: usize = 108;

/// Response from the runtime server, body untouched
#[derive(Debug)]
pub struct CommsResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl CommsResponse {
    pub fn is_ok(&self) -> bool {
        self.status == 200
    }
}

#[derive(Debug)]
pub struct CommsClient {
    sandbox_id: String,
    sock_path: PathBuf,
    timeout: Duration,
}

impl CommsClient {
    /// Bind a client to `<scratch>/comms.sock`. Fails up front if the
    /// path cannot fit in a `sockaddr_un`.
    pub fn new(sandbox_id: &str, scratch_dir: &Path) -> Result<Self> {
        let sock_path = scratch_dir.join("comms.sock");
        let len = sock_path.as_os_str().as_bytes().len();
        if len > MAX_SOCK_PATH {
            return Err(ZygoteError::SockPathTooLong {
                path: sock_path.display().to_string(),
                len,
            });
        }
        Ok(Self {
            sandbox_id: sandbox_id.to_string(),
            sock_path,
            timeout: COMMS_TIMEOUT,
        })
    }

    pub fn sock_path(&self) -> &Path {
        &self.sock_path
    }

    fn comms_err(&self, reason: String) -> ZygoteError {
        ZygoteError::Comms {
            sandbox: self.sandbox_id.clone(),
            reason,
        }
    }

    /// POST `body` to `path` on the runtime server. One connection
    /// per request; `Connection: close` delimits the response.
    pub fn post(&self, path: &str, body: &[u8]) -> Result<CommsResponse> {
        let mut stream = UnixStream::connect(&self.sock_path)
            .map_err(|e| self.comms_err(format!("connect {}: {}", self.sock_path.display(), e)))?;
        stream
            .set_read_timeout(Some(self.timeout))
            .and_then(|_| stream.set_write_timeout(Some(self.timeout)))
            .map_err(|e| self.comms_err(format!("set timeout: {}", e)))?;

        let head = format!(
            "POST {} HTTP/1.1\r\nHost: sandbox\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            path,
            body.len()
        );
        stream
            .write_all(head.as_bytes())
            .and_then(|_| stream.write_all(body))
            .map_err(|e| self.comms_err(format!("send request: {}", e)))?;

        let mut raw = Vec::new();
        stream
            .read_to_end(&mut raw)
            .map_err(|e| self.comms_err(format!("read response: {}", e)))?;

        let response = parse_response(&raw).map_err(|reason| self.comms_err(reason))?;
        debug!(
            "[SANDBOX {}] POST {} -> {}",
            self.sandbox_id, path, response.status
        );
        Ok(response)
    }

    /// Invoke a lambda by name
    pub fn run(&self, lambda: &str, body: &[u8]) -> Result<CommsResponse> {
        self.post(&format!("/run/{}", lambda), body)
    }
}

fn parse_response(raw: &[u8]) -> std::result::Result<CommsResponse, String> {
    let header_end = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| "response has no header terminator".to_string())?;
    let head = std::str::from_utf8(&raw[..header_end])
        .map_err(|_| "response headers are not UTF-8".to_string())?;
    let status_line = head.lines().next().ok_or_else(|| "empty response".to_string())?;

    // "HTTP/1.1 200 OK"
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        return Err(format!("bad status line: {}", status_line));
    }
    let status = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| format!("bad status line: {}", status_line))?;

    Ok(CommsResponse {
        status,
        body: raw[header_end + 4..].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;
    use std::thread;
    use tempfile::tempdir;

    #[test]
    fn test_sock_path_length_guard() {
        let tmp = tempdir().unwrap();
        // build a scratch path that pushes comms.sock past 108 bytes
        let long = "x".repeat(120);
        let scratch = tmp.path().join(long);
        let err = CommsClient::new("sb", &scratch).unwrap_err();
        assert!(matches!(err, ZygoteError::SockPathTooLong { .. }));
    }

    #[test]
    fn test_parse_response_splits_body() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
        let res = parse_response(raw).unwrap();
        assert_eq!(res.status, 200);
        assert_eq!(res.body, b"ok");
        assert!(res.is_ok());
    }

    #[test]
    fn test_parse_response_rejects_garbage() {
        assert!(parse_response(b"not http at all").is_err());
        assert!(parse_response(b"JUNK 200\r\n\r\n").is_err());
    }

    #[test]
    fn test_post_round_trip_over_unix_socket() {
        let tmp = tempdir().unwrap();
        let client = CommsClient::new("sb", tmp.path()).unwrap();
        let listener = UnixListener::bind(client.sock_path()).unwrap();

        let server = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut req = Vec::new();
            let mut buf = [0u8; 1024];
            while !req.ends_with(b"{\"in\":1}") {
                let n = conn.read(&mut buf).unwrap();
                assert!(n > 0, "client closed before full request");
                req.extend_from_slice(&buf[..n]);
            }
            conn.write_all(b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n{\"out\":1}")
                .unwrap();
            String::from_utf8_lossy(&req).into_owned()
        });

        let res = client.run("echo", b"{\"in\":1}").unwrap();
        assert_eq!(res.status, 200);
        assert_eq!(res.body, b"{\"out\":1}");

        let req = server.join().unwrap();
        assert!(req.starts_with("POST /run/echo HTTP/1.1\r\n"));
        assert!(req.contains("Content-Length: 8"));
        assert!(req.ends_with("{\"in\":1}"));
    }

    #[test]
    fn test_post_fails_when_nothing_listens() {
        let tmp = tempdir().unwrap();
        let client = CommsClient::new("sb", tmp.path()).unwrap();
        let err = client.post("/run/echo", b"{}").unwrap_err();
        assert!(matches!(err, ZygoteError::Comms { .. }));
    }
}
