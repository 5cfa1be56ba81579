use anyhow::Result;
use chainer_core::{ActionState, BufferReader, BufferWriter, BundleAction, PackageIndex, PayloadIndex};

use crate::channel::{ChannelError, RawMessage};

pub const LOAD_PLAN_MESSAGE: u32 = 1;
pub const SESSION_BEGIN_MESSAGE: u32 = 2;
pub const SESSION_SUSPEND_MESSAGE: u32 = 3;
pub const SESSION_RESUME_MESSAGE: u32 = 4;
pub const SESSION_END_MESSAGE: u32 = 5;
pub const SAVE_STATE_MESSAGE: u32 = 6;
pub const CACHE_PAYLOAD_MESSAGE: u32 = 7;
pub const EXECUTE_PACKAGE_MESSAGE: u32 = 8;
pub const LAUNCH_EMBEDDED_CHILD_MESSAGE: u32 = 9;
pub const EXECUTE_PROGRESS_MESSAGE: u32 = 10;
pub const EXECUTE_ERROR_MESSAGE: u32 = 11;

pub const COMPLETE_MESSAGE: u32 = 0xF000_0002;
pub const TERMINATE_MESSAGE: u32 = 0xF000_0003;
pub const HANDSHAKE_TOKEN_MESSAGE: u32 = 0xF000_0010;
pub const HANDSHAKE_ACK_MESSAGE: u32 = 0xF000_0011;

/// Requests and notifications exchanged between the driver and the elevated
/// worker. Replies are always a `Complete` frame carrying a result code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElevationMessage {
    LoadPlan {
        plan: Vec<u8>,
    },
    SessionBegin {
        action: BundleAction,
        estimated_size: u64,
    },
    SessionSuspend {
        action: BundleAction,
        reboot: bool,
    },
    SessionResume {
        action: BundleAction,
    },
    SessionEnd {
        action: BundleAction,
        rollback: bool,
    },
    SaveState {
        state: Vec<u8>,
    },
    CachePayload {
        package: PackageIndex,
        payload: PayloadIndex,
    },
    ExecutePackage {
        package: PackageIndex,
        action: ActionState,
        rollback: bool,
    },
    LaunchEmbeddedChild {
        program: String,
        arguments: Vec<String>,
    },
    ExecuteProgress {
        package: PackageIndex,
        percent: u32,
    },
    ExecuteError {
        code: u32,
        message: String,
    },
    Terminate,
}

impl ElevationMessage {
    pub fn message_type(&self) -> u32 {
        match self {
            Self::LoadPlan { .. } => LOAD_PLAN_MESSAGE,
            Self::SessionBegin { .. } => SESSION_BEGIN_MESSAGE,
            Self::SessionSuspend { .. } => SESSION_SUSPEND_MESSAGE,
            Self::SessionResume { .. } => SESSION_RESUME_MESSAGE,
            Self::SessionEnd { .. } => SESSION_END_MESSAGE,
            Self::SaveState { .. } => SAVE_STATE_MESSAGE,
            Self::CachePayload { .. } => CACHE_PAYLOAD_MESSAGE,
            Self::ExecutePackage { .. } => EXECUTE_PACKAGE_MESSAGE,
            Self::LaunchEmbeddedChild { .. } => LAUNCH_EMBEDDED_CHILD_MESSAGE,
            Self::ExecuteProgress { .. } => EXECUTE_PROGRESS_MESSAGE,
            Self::ExecuteError { .. } => EXECUTE_ERROR_MESSAGE,
            Self::Terminate => TERMINATE_MESSAGE,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut writer = BufferWriter::new();
        match self {
            Self::LoadPlan { plan } => {
                writer.write_bytes(plan);
            }
            Self::SessionBegin {
                action,
                estimated_size,
            } => {
                writer.write_u32(action.as_u32()).write_u64(*estimated_size);
            }
            Self::SessionSuspend { action, reboot } => {
                writer.write_u32(action.as_u32()).write_bool(*reboot);
            }
            Self::SessionResume { action } => {
                writer.write_u32(action.as_u32());
            }
            Self::SessionEnd { action, rollback } => {
                writer.write_u32(action.as_u32()).write_bool(*rollback);
            }
            Self::SaveState { state } => {
                writer.write_bytes(state);
            }
            Self::CachePayload { package, payload } => {
                writer.write_u32(package.get()).write_u32(payload.get());
            }
            Self::ExecutePackage {
                package,
                action,
                rollback,
            } => {
                writer
                    .write_u32(package.get())
                    .write_u32(action.as_u32())
                    .write_bool(*rollback);
            }
            Self::LaunchEmbeddedChild { program, arguments } => {
                writer.write_string(program);
                writer.write_u32(arguments.len() as u32);
                for argument in arguments {
                    writer.write_string(argument);
                }
            }
            Self::ExecuteProgress { package, percent } => {
                writer.write_u32(package.get()).write_u32(*percent);
            }
            Self::ExecuteError { code, message } => {
                writer.write_u32(*code).write_string(message);
            }
            Self::Terminate => {}
        }
        writer.into_bytes()
    }

    pub fn to_raw(&self) -> RawMessage {
        RawMessage::new(self.message_type(), self.encode())
    }

    pub fn decode(message: &RawMessage) -> Result<Self, ChannelError> {
        decode_payload(message.message_type, &message.payload).map_err(|err| match err
            .downcast::<ChannelError>()
        {
            Ok(channel) => channel,
            Err(other) => ChannelError::Protocol(format!(
                "malformed payload for message {:#010x}: {other:#}",
                message.message_type
            )),
        })
    }
}

fn decode_payload(message_type: u32, payload: &[u8]) -> Result<ElevationMessage> {
    let mut reader = BufferReader::new(payload);
    let message = match message_type {
        LOAD_PLAN_MESSAGE => ElevationMessage::LoadPlan {
            plan: reader.read_bytes()?,
        },
        SESSION_BEGIN_MESSAGE => ElevationMessage::SessionBegin {
            action: BundleAction::from_u32(reader.read_u32()?)?,
            estimated_size: reader.read_u64()?,
        },
        SESSION_SUSPEND_MESSAGE => ElevationMessage::SessionSuspend {
            action: BundleAction::from_u32(reader.read_u32()?)?,
            reboot: reader.read_bool()?,
        },
        SESSION_RESUME_MESSAGE => ElevationMessage::SessionResume {
            action: BundleAction::from_u32(reader.read_u32()?)?,
        },
        SESSION_END_MESSAGE => ElevationMessage::SessionEnd {
            action: BundleAction::from_u32(reader.read_u32()?)?,
            rollback: reader.read_bool()?,
        },
        SAVE_STATE_MESSAGE => ElevationMessage::SaveState {
            state: reader.read_bytes()?,
        },
        CACHE_PAYLOAD_MESSAGE => ElevationMessage::CachePayload {
            package: read_package_index(&mut reader)?,
            payload: PayloadIndex::new(reader.read_u32()?)
                .ok_or_else(|| ChannelError::Protocol("payload ordinal 0".to_string()))?,
        },
        EXECUTE_PACKAGE_MESSAGE => ElevationMessage::ExecutePackage {
            package: read_package_index(&mut reader)?,
            action: ActionState::from_u32(reader.read_u32()?)?,
            rollback: reader.read_bool()?,
        },
        LAUNCH_EMBEDDED_CHILD_MESSAGE => {
            let program = reader.read_string()?;
            let count = reader.read_u32()?;
            let mut arguments = Vec::with_capacity(count.min(256) as usize);
            for _ in 0..count {
                arguments.push(reader.read_string()?);
            }
            ElevationMessage::LaunchEmbeddedChild { program, arguments }
        }
        EXECUTE_PROGRESS_MESSAGE => ElevationMessage::ExecuteProgress {
            package: read_package_index(&mut reader)?,
            percent: reader.read_u32()?,
        },
        EXECUTE_ERROR_MESSAGE => ElevationMessage::ExecuteError {
            code: reader.read_u32()?,
            message: reader.read_string()?,
        },
        TERMINATE_MESSAGE => ElevationMessage::Terminate,
        other => return Err(ChannelError::UnexpectedMessage(other).into()),
    };
    if !reader.is_empty() {
        return Err(ChannelError::Protocol(format!(
            "{} trailing bytes after message {message_type:#010x}",
            reader.remaining()
        ))
        .into());
    }
    Ok(message)
}

fn read_package_index(reader: &mut BufferReader<'_>) -> Result<PackageIndex> {
    let ordinal = reader.read_u32()?;
    Ok(PackageIndex::new(ordinal)
        .ok_or_else(|| ChannelError::Protocol("package ordinal 0".to_string()))?)
}
