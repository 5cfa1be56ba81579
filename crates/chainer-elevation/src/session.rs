use std::io::{Read, Write};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chainer_core::{status, ActionState, BundleAction, PackageIndex, PayloadIndex};
use tracing::{debug, info, warn};

use crate::channel::{ChannelError, MessageChannel, RawMessage};
use crate::endpoint::{connect_client, ChildLauncher, ChildProcess, EndpointStream};
use crate::messages::ElevationMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connected,
    SessionActive,
    Suspended,
    Ended,
}

/// Notification the worker sends while an `ExecutePackage` request is in
/// flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecuteNotice {
    Progress { package: PackageIndex, percent: u32 },
    Error { code: u32, message: String },
}

/// Parent side of the elevation protocol: strictly one outstanding request
/// at a time, each answered by a result code.
pub struct ElevationSession<S> {
    channel: Option<MessageChannel<S>>,
    child: Option<Box<dyn ChildProcess>>,
    state: SessionState,
}

impl ElevationSession<EndpointStream> {
    /// Launches the elevated worker and completes the handshake.
    pub fn launch(launcher: &mut dyn ChildLauncher, prefix: &str, timeout: Duration) -> Result<Self> {
        let (channel, child) = connect_client(launcher, prefix, timeout)?;
        Ok(Self::from_channel(channel, Some(child)))
    }
}

impl<S: Read + Write> ElevationSession<S> {
    pub fn disconnected() -> Self {
        Self {
            channel: None,
            child: None,
            state: SessionState::Disconnected,
        }
    }

    /// Wraps a channel whose handshake already completed.
    pub fn from_channel(channel: MessageChannel<S>, child: Option<Box<dyn ChildProcess>>) -> Self {
        Self {
            channel: Some(channel),
            child,
            state: SessionState::Connected,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_some()
    }

    fn require(&self, allowed: &[SessionState], operation: &str) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(anyhow!(
                "cannot {operation} while the elevation session is {:?}",
                self.state
            ))
        }
    }

    fn channel(&mut self) -> Result<&mut MessageChannel<S>> {
        self.channel
            .as_mut()
            .ok_or_else(|| anyhow!("elevation session has no channel"))
    }

    fn request(&mut self, message: ElevationMessage) -> Result<u32> {
        let raw = message.to_raw();
        let result = self
            .channel()?
            .transact_status(raw.message_type, &raw.payload)
            .with_context(|| format!("elevated request {:#010x} failed", raw.message_type))?;
        debug!(
            message_type = format_args!("{:#010x}", raw.message_type),
            result = %status::describe(result),
            "elevated request complete"
        );
        Ok(result)
    }

    pub fn load_plan(&mut self, plan: &[u8]) -> Result<u32> {
        self.require(&[SessionState::Connected], "load the elevated plan")?;
        self.request(ElevationMessage::LoadPlan {
            plan: plan.to_vec(),
        })
    }

    pub fn session_begin(&mut self, action: BundleAction, estimated_size: u64) -> Result<u32> {
        self.require(&[SessionState::Connected], "begin a session")?;
        let result = self.request(ElevationMessage::SessionBegin {
            action,
            estimated_size,
        })?;
        if status::succeeded(result) {
            self.state = SessionState::SessionActive;
        }
        Ok(result)
    }

    pub fn session_suspend(&mut self, action: BundleAction, reboot: bool) -> Result<u32> {
        self.require(&[SessionState::SessionActive], "suspend the session")?;
        let result = self.request(ElevationMessage::SessionSuspend { action, reboot })?;
        if status::succeeded(result) {
            self.state = SessionState::Suspended;
        }
        Ok(result)
    }

    /// Resumes a suspended session. A worker started for a new run after a
    /// suspend or reboot resumes straight from `Connected`.
    pub fn session_resume(&mut self, action: BundleAction) -> Result<u32> {
        self.require(
            &[SessionState::Connected, SessionState::Suspended],
            "resume the session",
        )?;
        let result = self.request(ElevationMessage::SessionResume { action })?;
        if status::succeeded(result) {
            self.state = SessionState::SessionActive;
        }
        Ok(result)
    }

    pub fn session_end(&mut self, action: BundleAction, rollback: bool) -> Result<u32> {
        self.require(
            &[SessionState::SessionActive, SessionState::Suspended],
            "end the session",
        )?;
        let result = self.request(ElevationMessage::SessionEnd { action, rollback })?;
        self.state = SessionState::Ended;
        Ok(result)
    }

    pub fn save_state(&mut self, state: &[u8]) -> Result<u32> {
        self.require(&[SessionState::SessionActive], "save state")?;
        self.request(ElevationMessage::SaveState {
            state: state.to_vec(),
        })
    }

    pub fn cache_payload(&mut self, package: PackageIndex, payload: PayloadIndex) -> Result<u32> {
        self.require(&[SessionState::SessionActive], "cache a payload")?;
        self.request(ElevationMessage::CachePayload { package, payload })
    }

    /// Runs one package in the worker. `on_notice` answers each progress or
    /// error notification; returning `E_ABORT` asks the worker to stop.
    pub fn execute_package<F>(
        &mut self,
        package: PackageIndex,
        action: ActionState,
        rollback: bool,
        mut on_notice: F,
    ) -> Result<u32>
    where
        F: FnMut(ExecuteNotice) -> u32,
    {
        self.require(&[SessionState::SessionActive], "execute a package")?;
        let raw = ElevationMessage::ExecutePackage {
            package,
            action,
            rollback,
        }
        .to_raw();
        let reply = self
            .channel()?
            .transact_with(raw.message_type, &raw.payload, |message: &RawMessage| {
                let notice = match ElevationMessage::decode(message)? {
                    ElevationMessage::ExecuteProgress { package, percent } => {
                        ExecuteNotice::Progress { package, percent }
                    }
                    ElevationMessage::ExecuteError { code, message } => {
                        ExecuteNotice::Error { code, message }
                    }
                    _ => return Err(ChannelError::UnexpectedMessage(message.message_type)),
                };
                Ok(on_notice(notice))
            })
            .with_context(|| format!("elevated execute of package {package} failed"))?;
        Ok(reply.result_code()?)
    }

    pub fn launch_embedded_child(&mut self, program: &str, arguments: &[String]) -> Result<u32> {
        self.require(&[SessionState::SessionActive], "launch an embedded child")?;
        self.request(ElevationMessage::LaunchEmbeddedChild {
            program: program.to_string(),
            arguments: arguments.to_vec(),
        })
    }

    /// Ends the worker's message pump and waits for it to exit. Returns the
    /// worker's exit code when a process handle is attached.
    pub fn terminate(&mut self) -> Result<Option<i32>> {
        if let Some(mut channel) = self.channel.take() {
            if let Err(err) = channel.send_terminate() {
                warn!(error = %err, "failed sending terminate to elevated process");
            }
        }
        self.state = SessionState::Ended;
        let Some(mut child) = self.child.take() else {
            return Ok(None);
        };
        let code = child.wait()?;
        info!(exit_code = code, "elevated process exited");
        Ok(Some(code))
    }
}

impl<S> Drop for ElevationSession<S> {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            warn!("elevation session dropped without terminate; killing elevated process");
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
