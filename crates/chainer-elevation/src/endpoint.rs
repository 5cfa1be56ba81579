//! Named endpoints and the authenticated connection handshake.
//!
//! On Unix the endpoint name is a socket path in the temp directory; elsewhere
//! it is a loopback TCP address picked by the parent.

use std::io;
use std::process::Child;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use chainer_core::{status, BufferReader, BufferWriter};
use chainer_security::{generate_pipe_name, generate_session_token};
use tracing::{debug, info, warn};

use crate::channel::{ChannelError, MessageChannel, Received};
use crate::messages::{HANDSHAKE_ACK_MESSAGE, HANDSHAKE_TOKEN_MESSAGE};

#[cfg(unix)]
pub type EndpointStream = std::os::unix::net::UnixStream;
#[cfg(not(unix))]
pub type EndpointStream = std::net::TcpStream;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Handle to a launched elevated worker.
pub trait ChildProcess {
    /// Exit code if the process has already exited.
    fn try_wait(&mut self) -> Result<Option<i32>>;

    fn wait(&mut self) -> Result<i32>;

    fn kill(&mut self) -> Result<()>;
}

impl ChildProcess for Child {
    fn try_wait(&mut self) -> Result<Option<i32>> {
        let status = Child::try_wait(self).context("failed polling elevated process")?;
        Ok(status.map(|status| status.code().unwrap_or(-1)))
    }

    fn wait(&mut self) -> Result<i32> {
        let status = Child::wait(self).context("failed waiting for elevated process")?;
        Ok(status.code().unwrap_or(-1))
    }

    fn kill(&mut self) -> Result<()> {
        Child::kill(self).context("failed terminating elevated process")
    }
}

/// Starts the elevated worker with the endpoint name and token on its
/// command line.
pub trait ChildLauncher {
    fn launch(&mut self, pipe_name: &str, token: &str) -> Result<Box<dyn ChildProcess>>;
}

#[cfg(unix)]
struct Listener {
    inner: std::os::unix::net::UnixListener,
    path: std::path::PathBuf,
}

#[cfg(unix)]
impl Listener {
    fn bind(prefix: &str) -> Result<(Self, String)> {
        let path = std::env::temp_dir().join(format!("{}.sock", generate_pipe_name(prefix)?));
        let inner = std::os::unix::net::UnixListener::bind(&path)
            .with_context(|| format!("failed binding elevation endpoint {}", path.display()))?;
        inner
            .set_nonblocking(true)
            .context("failed configuring elevation endpoint")?;
        let name = path.display().to_string();
        Ok((Self { inner, path }, name))
    }

    fn accept(&self) -> io::Result<EndpointStream> {
        let (stream, _) = self.inner.accept()?;
        stream.set_nonblocking(false)?;
        Ok(stream)
    }
}

#[cfg(unix)]
impl Drop for Listener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(not(unix))]
struct Listener {
    inner: std::net::TcpListener,
}

#[cfg(not(unix))]
impl Listener {
    fn bind(_prefix: &str) -> Result<(Self, String)> {
        let inner = std::net::TcpListener::bind(("127.0.0.1", 0))
            .context("failed binding elevation endpoint")?;
        inner
            .set_nonblocking(true)
            .context("failed configuring elevation endpoint")?;
        let name = inner
            .local_addr()
            .context("failed reading elevation endpoint address")?
            .to_string();
        Ok((Self { inner }, name))
    }

    fn accept(&self) -> io::Result<EndpointStream> {
        let (stream, _) = self.inner.accept()?;
        stream.set_nonblocking(false)?;
        Ok(stream)
    }
}

fn connect_endpoint(name: &str) -> io::Result<EndpointStream> {
    EndpointStream::connect(name)
}

fn encode_token(token: &str) -> Vec<u8> {
    let mut writer = BufferWriter::new();
    writer.write_string(token);
    writer.into_bytes()
}

/// Parent side: creates the endpoint, launches the worker, waits for it to
/// connect, sends the token and blocks until the worker acknowledges it.
pub fn connect_client(
    launcher: &mut dyn ChildLauncher,
    prefix: &str,
    timeout: Duration,
) -> Result<(MessageChannel<EndpointStream>, Box<dyn ChildProcess>)> {
    let token = generate_session_token()?;
    let (listener, name) = Listener::bind(prefix)?;
    let mut child = launcher
        .launch(&name, &token)
        .context("failed launching elevated process")?;
    debug!(endpoint = %name, "waiting for elevated process to connect");

    let started = Instant::now();
    let stream = loop {
        match listener.accept() {
            Ok(stream) => break stream,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => {
                let _ = child.kill();
                return Err(err).context("failed accepting elevated connection");
            }
        }
        if let Some(code) = child.try_wait()? {
            return Err(anyhow!(
                "elevated process exited with code {code} before connecting"
            ));
        }
        if started.elapsed() >= timeout {
            let _ = child.kill();
            return Err(anyhow!(
                "elevated process did not connect within {}s",
                timeout.as_secs()
            ));
        }
        thread::sleep(ACCEPT_POLL_INTERVAL);
    };
    drop(listener);

    let mut channel = MessageChannel::new(stream);
    if let Err(err) = client_handshake(&mut channel, &token) {
        let _ = child.kill();
        return Err(err).context("elevation handshake failed");
    }
    info!(endpoint = %name, "elevated process connected");
    Ok((channel, child))
}

/// Child side: connects to the parent's endpoint, verifies the token the
/// parent sends against the one from the command line and acknowledges.
pub fn open_server(name: &str, token: &str) -> Result<MessageChannel<EndpointStream>, ChannelError> {
    let stream = connect_endpoint(name)?;
    let mut channel = MessageChannel::new(stream);
    server_handshake(&mut channel, token)?;
    debug!(endpoint = %name, "connected to driver");
    Ok(channel)
}

/// Token verification shared by any transport.
pub fn server_handshake<S: io::Read + io::Write>(
    channel: &mut MessageChannel<S>,
    token: &str,
) -> Result<(), ChannelError> {
    let message = match channel.receive()? {
        Received::Message(message) => message,
        Received::Closed => {
            return Err(ChannelError::Protocol(
                "driver closed the channel before the handshake".to_string(),
            ));
        }
    };
    if message.message_type != HANDSHAKE_TOKEN_MESSAGE {
        return Err(ChannelError::UnexpectedMessage(message.message_type));
    }
    let presented = BufferReader::new(&message.payload)
        .read_string()
        .map_err(|err| ChannelError::Protocol(format!("{err:#}")))?;

    if presented != token {
        warn!("elevation token mismatch");
        let mut writer = BufferWriter::new();
        writer.write_u32(status::E_INVALIDARG);
        let _ = channel.send(HANDSHAKE_ACK_MESSAGE, writer.as_slice());
        return Err(ChannelError::TokenMismatch);
    }

    let mut writer = BufferWriter::new();
    writer.write_u32(status::S_OK);
    channel.send(HANDSHAKE_ACK_MESSAGE, writer.as_slice())
}

/// Parent-side token exchange over an already connected stream.
pub fn client_handshake<S: io::Read + io::Write>(
    channel: &mut MessageChannel<S>,
    token: &str,
) -> Result<(), ChannelError> {
    channel.send(HANDSHAKE_TOKEN_MESSAGE, &encode_token(token))?;
    match channel.receive()? {
        Received::Message(reply) if reply.message_type == HANDSHAKE_ACK_MESSAGE => {
            let result = BufferReader::new(&reply.payload)
                .read_u32()
                .map_err(|err| ChannelError::Protocol(format!("{err:#}")))?;
            if status::succeeded(result) {
                Ok(())
            } else {
                Err(ChannelError::TokenMismatch)
            }
        }
        Received::Message(other) => Err(ChannelError::UnexpectedMessage(other.message_type)),
        Received::Closed => Err(ChannelError::Protocol(
            "peer closed the channel during handshake".to_string(),
        )),
    }
}
