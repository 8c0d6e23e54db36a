//! SSH transport for the health probe, backed by `ssh2`.
//!
//! Password authentication, scp upload, and channel execution with
//! captured output. All calls block; the prober is driven through
//! `spawn_blocking` by async callers, so a caller-side cancellation
//! lets the blocking task run to completion and release the session.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use ssh2::Session;
use tracing::trace;

use super::{RemoteSession, RemoteTransport, TransportError};
use crate::registry::SshCredential;

fn transport_err(e: impl std::fmt::Display) -> TransportError {
    TransportError(e.to_string())
}

/// Opens SSH sessions with password auth and per-stage timeouts.
pub struct SshTransport {
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl SshTransport {
    pub fn new(connect_timeout: Duration, io_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            io_timeout,
        }
    }
}

impl RemoteTransport for SshTransport {
    fn connect(
        &self,
        address: &str,
        port: u16,
        username: &str,
        credential: &SshCredential,
    ) -> Result<Box<dyn RemoteSession>, TransportError> {
        let socket_addr = (address, port)
            .to_socket_addrs()
            .map_err(transport_err)?
            .next()
            .ok_or_else(|| TransportError(format!("no usable address for {address}:{port}")))?;

        let tcp = TcpStream::connect_timeout(&socket_addr, self.connect_timeout)
            .map_err(transport_err)?;
        tcp.set_read_timeout(Some(self.io_timeout))
            .map_err(transport_err)?;
        tcp.set_write_timeout(Some(self.io_timeout))
            .map_err(transport_err)?;

        let mut session = Session::new().map_err(transport_err)?;
        session.set_tcp_stream(tcp);
        session.handshake().map_err(transport_err)?;
        session
            .userauth_password(username, credential.expose())
            .map_err(transport_err)?;
        if !session.authenticated() {
            return Err(TransportError("authentication rejected".to_string()));
        }

        trace!(address, port, "ssh session established");
        Ok(Box::new(SshSession { session }))
    }
}

struct SshSession {
    session: Session,
}

impl RemoteSession for SshSession {
    fn upload(&mut self, local: &Path, remote: &str) -> Result<(), TransportError> {
        let payload = std::fs::read(local).map_err(transport_err)?;

        let mut channel = self
            .session
            .scp_send(Path::new(remote), 0o755, payload.len() as u64, None)
            .map_err(transport_err)?;
        channel.write_all(&payload).map_err(transport_err)?;
        channel.send_eof().map_err(transport_err)?;
        channel.wait_eof().map_err(transport_err)?;
        channel.close().map_err(transport_err)?;
        channel.wait_close().map_err(transport_err)?;
        Ok(())
    }

    fn exec(&mut self, command: &str) -> Result<String, TransportError> {
        let mut channel = self.session.channel_session().map_err(transport_err)?;
        channel.exec(command).map_err(transport_err)?;

        let mut output = String::new();
        channel
            .read_to_string(&mut output)
            .map_err(transport_err)?;
        channel
            .stderr()
            .read_to_string(&mut output)
            .map_err(transport_err)?;
        channel.wait_close().map_err(transport_err)?;

        // Strip the shell's final line terminator, nothing more.
        if output.ends_with('\n') {
            output.pop();
            if output.ends_with('\r') {
                output.pop();
            }
        }
        Ok(output)
    }

    fn close(&mut self) {
        // Best effort; the TCP stream drops with the session either way.
        let _ = self
            .session
            .disconnect(None, "probe complete", None);
    }
}
