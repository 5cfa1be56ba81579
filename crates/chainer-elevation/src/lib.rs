//! Privilege separation over a length-prefixed message channel: the
//! unprivileged driver launches an elevated worker, authenticates it with a
//! one-time token and forwards per-machine work to it one request at a time.

mod channel;
mod endpoint;
mod messages;
mod pump;
mod session;

pub use channel::{
    frame_message, read_frame, write_frame, ChannelError, MessageChannel, RawMessage, Received,
    FRAME_HEADER_LEN, MAX_FRAME_LEN,
};
pub use endpoint::{
    client_handshake, connect_client, open_server, server_handshake, ChildLauncher, ChildProcess,
    EndpointStream, DEFAULT_CONNECT_TIMEOUT,
};
pub use messages::*;
pub use pump::{run_message_pump, ElevatedHandler, ExecuteReporter};
pub use session::{ElevationSession, ExecuteNotice, SessionState};

#[cfg(test)]
mod tests;
