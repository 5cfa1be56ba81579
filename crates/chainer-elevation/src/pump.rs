use std::io::{Read, Write};

use anyhow::Result;
use chainer_core::{status, ActionState, BundleAction, PackageIndex, PayloadIndex};
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelError, MessageChannel, Received};
use crate::messages::ElevationMessage;

/// Lets the worker report progress and errors back to the driver while a
/// package runs. Each call blocks for the driver's answer.
pub trait ExecuteReporter {
    fn progress(&mut self, package: PackageIndex, percent: u32) -> Result<u32>;

    fn error(&mut self, code: u32, message: &str) -> Result<u32>;
}

/// Worker-side implementation of the elevated requests.
pub trait ElevatedHandler {
    fn load_plan(&mut self, plan: &[u8]) -> Result<()>;

    fn session_begin(&mut self, action: BundleAction, estimated_size: u64) -> Result<()>;

    fn session_suspend(&mut self, action: BundleAction, reboot: bool) -> Result<()>;

    fn session_resume(&mut self, action: BundleAction) -> Result<()>;

    fn session_end(&mut self, action: BundleAction, rollback: bool) -> Result<()>;

    fn save_state(&mut self, state: &[u8]) -> Result<()>;

    fn cache_payload(&mut self, package: PackageIndex, payload: PayloadIndex) -> Result<()>;

    /// Returns the status code for the driver.
    fn execute_package(
        &mut self,
        package: PackageIndex,
        action: ActionState,
        rollback: bool,
        reporter: &mut dyn ExecuteReporter,
    ) -> Result<u32>;

    /// Returns the child's status code.
    fn launch_embedded_child(&mut self, program: &str, arguments: &[String]) -> Result<u32>;
}

struct ChannelReporter<'a, S> {
    channel: &'a mut MessageChannel<S>,
}

impl<S: Read + Write> ExecuteReporter for ChannelReporter<'_, S> {
    fn progress(&mut self, package: PackageIndex, percent: u32) -> Result<u32> {
        let raw = ElevationMessage::ExecuteProgress { package, percent }.to_raw();
        Ok(self
            .channel
            .transact_status(raw.message_type, &raw.payload)?)
    }

    fn error(&mut self, code: u32, message: &str) -> Result<u32> {
        let raw = ElevationMessage::ExecuteError {
            code,
            message: message.to_string(),
        }
        .to_raw();
        Ok(self
            .channel
            .transact_status(raw.message_type, &raw.payload)?)
    }
}

fn status_of(operation: &str, result: Result<()>) -> u32 {
    match result {
        Ok(()) => status::S_OK,
        Err(err) => {
            error!(operation, error = %format!("{err:#}"), "elevated operation failed");
            status::E_FAIL
        }
    }
}

/// Serves driver requests until `Terminate` arrives or the driver goes away.
/// Failed operations are answered with a failure code and the pump keeps
/// running; only channel errors end it early.
pub fn run_message_pump<S: Read + Write>(
    channel: &mut MessageChannel<S>,
    handler: &mut dyn ElevatedHandler,
) -> Result<(), ChannelError> {
    loop {
        let raw = match channel.receive()? {
            Received::Closed => {
                info!("driver closed the channel");
                return Ok(());
            }
            Received::Message(raw) => raw,
        };

        let message = match ElevationMessage::decode(&raw) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "rejecting elevated request");
                channel.send_complete(status::E_INVALIDARG)?;
                continue;
            }
        };
        debug!(message_type = format_args!("{:#010x}", raw.message_type), "elevated request");

        let result = match message {
            ElevationMessage::Terminate => {
                info!("terminate received");
                return Ok(());
            }
            ElevationMessage::LoadPlan { plan } => status_of("load plan", handler.load_plan(&plan)),
            ElevationMessage::SessionBegin {
                action,
                estimated_size,
            } => status_of(
                "session begin",
                handler.session_begin(action, estimated_size),
            ),
            ElevationMessage::SessionSuspend { action, reboot } => status_of(
                "session suspend",
                handler.session_suspend(action, reboot),
            ),
            ElevationMessage::SessionResume { action } => {
                status_of("session resume", handler.session_resume(action))
            }
            ElevationMessage::SessionEnd { action, rollback } => {
                status_of("session end", handler.session_end(action, rollback))
            }
            ElevationMessage::SaveState { state } => {
                status_of("save state", handler.save_state(&state))
            }
            ElevationMessage::CachePayload { package, payload } => status_of(
                "cache payload",
                handler.cache_payload(package, payload),
            ),
            ElevationMessage::ExecutePackage {
                package,
                action,
                rollback,
            } => {
                let mut reporter = ChannelReporter {
                    channel: &mut *channel,
                };
                let outcome = handler.execute_package(package, action, rollback, &mut reporter);
                match outcome {
                    Ok(code) => code,
                    Err(err) => {
                        error!(%package, error = %format!("{err:#}"), "elevated execute failed");
                        status::E_FAIL
                    }
                }
            }
            ElevationMessage::LaunchEmbeddedChild { program, arguments } => {
                match handler.launch_embedded_child(&program, &arguments) {
                    Ok(code) => code,
                    Err(err) => {
                        error!(program = %program, error = %format!("{err:#}"), "embedded child failed");
                        status::E_FAIL
                    }
                }
            }
            ElevationMessage::ExecuteProgress { .. } | ElevationMessage::ExecuteError { .. } => {
                warn!("driver sent a worker notification");
                status::E_INVALIDARG
            }
        };
        channel.send_complete(result)?;
    }
}
