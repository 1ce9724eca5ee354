//! Connection to the zygoted control socket

use std::os::unix::net::UnixStream;
use std::path::Path;
use zygote_core::{Result, ZygoteError};
use zygote_rs::protocol::{read_record, write_record, Request, Response};

pub struct DaemonClient {
    stream: UnixStream,
}

impl DaemonClient {
    pub fn connect(socket_path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket_path)?;
        Ok(Self { stream })
    }

    /// One request, one response
    pub fn send(&mut self, request: &Request) -> Result<Response> {
        write_record(&mut self.stream, request)?;
        read_record(&mut self.stream)?.ok_or_else(|| {
            ZygoteError::Protocol("daemon closed the connection mid-request".to_string())
        })
    }
}
