use std::io::{self, Cursor, Read};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use chainer_core::{status, ActionState, BundleAction, PackageIndex, PayloadIndex};

use super::*;

/// Reader that hands out at most `chunk` bytes per call.
struct ChunkedReader<R> {
    inner: R,
    chunk: usize,
}

impl<R: Read> Read for ChunkedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let limit = buf.len().min(self.chunk);
        self.inner.read(&mut buf[..limit])
    }
}

fn read_back(bytes: Vec<u8>, chunk: usize) -> Result<Received, ChannelError> {
    let mut reader = ChunkedReader {
        inner: Cursor::new(bytes),
        chunk,
    };
    read_frame(&mut reader)
}

#[test]
fn frames_round_trip_for_empty_small_and_large_payloads() {
    for size in [0_usize, 1, 70 * 1024] {
        let payload: Vec<u8> = (0..size).map(|value| (value % 251) as u8).collect();
        let frame = frame_message(SAVE_STATE_MESSAGE, &payload).expect("frame must encode");
        assert_eq!(frame.len(), FRAME_HEADER_LEN + size);

        let received = read_back(frame, 4096).expect("frame must decode");
        assert_eq!(
            received,
            Received::Message(RawMessage::new(SAVE_STATE_MESSAGE, payload)),
            "payload size {size}"
        );
    }
}

#[test]
fn header_is_little_endian_type_then_length() {
    let frame = frame_message(0x0102_0304, &[9, 9]).expect("frame must encode");
    assert_eq!(&frame[..8], &[4, 3, 2, 1, 2, 0, 0, 0]);
}

#[test]
fn empty_stream_reads_as_closed() {
    assert_eq!(read_back(Vec::new(), 16).expect("closed"), Received::Closed);
}

#[test]
fn truncated_frames_are_fatal() {
    let err = read_back(vec![1, 0, 0], 16).expect_err("partial header");
    assert!(matches!(err, ChannelError::Truncated("frame header")));

    let mut frame = frame_message(LOAD_PLAN_MESSAGE, &[1, 2, 3, 4]).expect("frame must encode");
    frame.truncate(frame.len() - 2);
    let err = read_back(frame, 16).expect_err("partial payload");
    assert!(matches!(err, ChannelError::Truncated("frame payload")));
}

#[test]
fn oversized_length_prefix_is_rejected_before_reading_payload() {
    let mut frame = Vec::new();
    frame.extend_from_slice(&LOAD_PLAN_MESSAGE.to_le_bytes());
    frame.extend_from_slice(&(MAX_FRAME_LEN + 1).to_le_bytes());
    let err = read_back(frame, 16).expect_err("length over limit");
    assert!(matches!(err, ChannelError::FrameTooLarge(length) if length == MAX_FRAME_LEN + 1));
}

#[test]
fn messages_survive_encoding() {
    let messages = [
        ElevationMessage::SessionBegin {
            action: BundleAction::Install,
            estimated_size: 5 * 1024 * 1024 * 1024,
        },
        ElevationMessage::ExecutePackage {
            package: PackageIndex::from_slot(2),
            action: ActionState::MajorUpgrade,
            rollback: true,
        },
        ElevationMessage::LaunchEmbeddedChild {
            program: "setup.exe".to_string(),
            arguments: vec!["/quiet".to_string(), "path with spaces".to_string()],
        },
        ElevationMessage::ExecuteError {
            code: 1603,
            message: "installer failed".to_string(),
        },
        ElevationMessage::Terminate,
    ];
    for message in messages {
        let decoded = ElevationMessage::decode(&message.to_raw()).expect("message must decode");
        assert_eq!(decoded, message);
    }
}

#[test]
fn malformed_message_payloads_are_protocol_errors() {
    let mut raw = ElevationMessage::SessionResume {
        action: BundleAction::Repair,
    }
    .to_raw();
    raw.payload.push(0);
    assert!(matches!(
        ElevationMessage::decode(&raw),
        Err(ChannelError::Protocol(_))
    ));

    let raw = RawMessage::new(EXECUTE_PACKAGE_MESSAGE, 0_u32.to_le_bytes().to_vec());
    assert!(matches!(
        ElevationMessage::decode(&raw),
        Err(ChannelError::Protocol(_))
    ));

    let raw = RawMessage::new(0x7777, Vec::new());
    assert!(matches!(
        ElevationMessage::decode(&raw),
        Err(ChannelError::UnexpectedMessage(0x7777))
    ));
}

#[test]
fn completion_without_result_code_is_rejected() {
    let raw = RawMessage::new(COMPLETE_MESSAGE, vec![1, 2]);
    assert!(matches!(raw.result_code(), Err(ChannelError::Protocol(_))));
    let raw = RawMessage::new(COMPLETE_MESSAGE, status::E_ABORT.to_le_bytes().to_vec());
    assert_eq!(raw.result_code().expect("result code"), status::E_ABORT);
}

#[test]
fn session_rejects_out_of_order_requests() {
    let mut session: ElevationSession<Cursor<Vec<u8>>> = ElevationSession::disconnected();
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(session.session_begin(BundleAction::Install, 0).is_err());

    let mut session = ElevationSession::from_channel(MessageChannel::new(Cursor::new(Vec::new())), None);
    assert!(session.session_suspend(BundleAction::Install, false).is_err());
    assert!(session
        .execute_package(
            PackageIndex::from_slot(0),
            ActionState::Install,
            false,
            |_| status::S_OK,
        )
        .is_err());
}

#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<String>>,
}

impl Recorder {
    fn push(&self, call: String) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("recorder lock").clone()
    }
}

struct RecordingHandler {
    recorder: Arc<Recorder>,
}

impl ElevatedHandler for RecordingHandler {
    fn load_plan(&mut self, plan: &[u8]) -> Result<()> {
        self.recorder.push(format!("load_plan:{}", plan.len()));
        Ok(())
    }

    fn session_begin(&mut self, action: BundleAction, estimated_size: u64) -> Result<()> {
        self.recorder
            .push(format!("begin:{}:{estimated_size}", action.as_str()));
        Ok(())
    }

    fn session_suspend(&mut self, _action: BundleAction, reboot: bool) -> Result<()> {
        self.recorder.push(format!("suspend:{reboot}"));
        Ok(())
    }

    fn session_resume(&mut self, _action: BundleAction) -> Result<()> {
        self.recorder.push("resume".to_string());
        Ok(())
    }

    fn session_end(&mut self, _action: BundleAction, rollback: bool) -> Result<()> {
        self.recorder.push(format!("end:{rollback}"));
        Ok(())
    }

    fn save_state(&mut self, state: &[u8]) -> Result<()> {
        self.recorder.push(format!("save:{}", state.len()));
        Ok(())
    }

    fn cache_payload(&mut self, package: PackageIndex, payload: PayloadIndex) -> Result<()> {
        if payload.get() > 1 {
            return Err(anyhow!("payload {} missing", payload.get()));
        }
        self.recorder
            .push(format!("cache:{}:{}", package.get(), payload.get()));
        Ok(())
    }

    fn execute_package(
        &mut self,
        package: PackageIndex,
        action: ActionState,
        rollback: bool,
        reporter: &mut dyn ExecuteReporter,
    ) -> Result<u32> {
        self.recorder.push(format!(
            "execute:{}:{}:{rollback}",
            package.get(),
            action.as_str()
        ));
        if package.get() == 2 {
            reporter.error(1603, "fatal error during installation")?;
            return Ok(status::from_exit_code(1603));
        }
        for percent in [50, 100] {
            if reporter.progress(package, percent)? == status::E_ABORT {
                return Ok(status::E_ABORT);
            }
        }
        Ok(status::S_OK)
    }

    fn launch_embedded_child(&mut self, program: &str, arguments: &[String]) -> Result<u32> {
        self.recorder
            .push(format!("launch:{program}:{}", arguments.len()));
        Ok(status::S_OK)
    }
}

#[cfg(unix)]
mod unix {
    use std::os::unix::net::UnixStream;
    use std::thread;
    use std::time::Duration;

    use super::*;

    const TOKEN: &str = "0123456789abcdef";

    fn spawn_worker(
        stream: UnixStream,
        token: &'static str,
        recorder: Arc<Recorder>,
    ) -> thread::JoinHandle<Result<(), ChannelError>> {
        thread::spawn(move || {
            let mut channel = MessageChannel::new(stream);
            server_handshake(&mut channel, token)?;
            let mut handler = RecordingHandler { recorder };
            run_message_pump(&mut channel, &mut handler)
        })
    }

    fn connected_session(recorder: Arc<Recorder>) -> (
        ElevationSession<UnixStream>,
        thread::JoinHandle<Result<(), ChannelError>>,
    ) {
        let (parent, child) = UnixStream::pair().expect("socket pair");
        let worker = spawn_worker(child, TOKEN, recorder);
        let mut channel = MessageChannel::new(parent);
        client_handshake(&mut channel, TOKEN).expect("handshake must succeed");
        (ElevationSession::from_channel(channel, None), worker)
    }

    #[test]
    fn session_drives_worker_through_full_lifecycle() {
        let recorder = Arc::new(Recorder::default());
        let (mut session, worker) = connected_session(Arc::clone(&recorder));

        assert_eq!(session.load_plan(&[1, 2, 3]).expect("load plan"), status::S_OK);
        assert_eq!(
            session
                .session_begin(BundleAction::Install, 4096)
                .expect("begin"),
            status::S_OK
        );
        assert_eq!(session.state(), SessionState::SessionActive);
        assert_eq!(session.save_state(&[0; 10]).expect("save"), status::S_OK);
        assert_eq!(
            session
                .cache_payload(PackageIndex::from_slot(0), PayloadIndex::from_slot(0))
                .expect("cache"),
            status::S_OK
        );

        let mut notices = Vec::new();
        let result = session
            .execute_package(
                PackageIndex::from_slot(0),
                ActionState::Install,
                false,
                |notice| {
                    notices.push(notice);
                    status::S_OK
                },
            )
            .expect("execute");
        assert_eq!(result, status::S_OK);
        assert_eq!(
            notices,
            vec![
                ExecuteNotice::Progress {
                    package: PackageIndex::from_slot(0),
                    percent: 50
                },
                ExecuteNotice::Progress {
                    package: PackageIndex::from_slot(0),
                    percent: 100
                },
            ]
        );

        assert_eq!(
            session
                .launch_embedded_child("child.exe", &["/quiet".to_string()])
                .expect("launch"),
            status::S_OK
        );
        session
            .session_suspend(BundleAction::Install, true)
            .expect("suspend");
        assert_eq!(session.state(), SessionState::Suspended);
        session.session_resume(BundleAction::Install).expect("resume");
        session
            .session_end(BundleAction::Install, false)
            .expect("end");
        assert_eq!(session.state(), SessionState::Ended);
        assert_eq!(session.terminate().expect("terminate"), None);

        worker
            .join()
            .expect("worker thread")
            .expect("pump ends cleanly");
        assert_eq!(
            recorder.calls(),
            vec![
                "load_plan:3",
                "begin:install:4096",
                "save:10",
                "cache:1:1",
                "execute:1:install:false",
                "launch:child.exe:1",
                "suspend:true",
                "resume",
                "end:false",
            ]
        );
    }

    #[test]
    fn new_worker_resumes_a_suspended_run_without_beginning() {
        let recorder = Arc::new(Recorder::default());
        let (mut session, worker) = connected_session(Arc::clone(&recorder));

        assert_eq!(session.load_plan(&[7]).expect("load plan"), status::S_OK);
        assert_eq!(
            session.session_resume(BundleAction::Install).expect("resume"),
            status::S_OK
        );
        assert_eq!(session.state(), SessionState::SessionActive);
        assert_eq!(session.save_state(&[0; 4]).expect("save"), status::S_OK);
        session
            .session_end(BundleAction::Install, false)
            .expect("end");
        session.terminate().expect("terminate");
        worker
            .join()
            .expect("worker thread")
            .expect("pump ends cleanly");
        assert_eq!(
            recorder.calls(),
            vec!["load_plan:1", "resume", "save:4", "end:false"]
        );
    }

    #[test]
    fn failed_operations_keep_the_channel_open() {
        let recorder = Arc::new(Recorder::default());
        let (mut session, worker) = connected_session(Arc::clone(&recorder));
        session
            .session_begin(BundleAction::Install, 0)
            .expect("begin");

        let mut errors = Vec::new();
        let result = session
            .execute_package(
                PackageIndex::from_slot(1),
                ActionState::Install,
                false,
                |notice| {
                    if let ExecuteNotice::Error { code, .. } = notice {
                        errors.push(code);
                    }
                    status::S_OK
                },
            )
            .expect("execute transact succeeds");
        assert!(status::failed(result));
        assert_eq!(errors, vec![1603]);

        let result = session
            .cache_payload(PackageIndex::from_slot(0), PayloadIndex::from_slot(4))
            .expect("cache transact succeeds");
        assert_eq!(result, status::E_FAIL);

        let result = session
            .execute_package(
                PackageIndex::from_slot(0),
                ActionState::Install,
                true,
                |_| status::E_ABORT,
            )
            .expect("channel still usable");
        assert_eq!(result, status::E_ABORT);

        session
            .session_end(BundleAction::Install, true)
            .expect("end");
        session.terminate().expect("terminate");
        worker
            .join()
            .expect("worker thread")
            .expect("pump ends cleanly");
    }

    #[test]
    fn worker_stops_when_driver_disconnects() {
        let recorder = Arc::new(Recorder::default());
        let (session, worker) = connected_session(recorder);
        drop(session);
        worker
            .join()
            .expect("worker thread")
            .expect("closed channel ends the pump");
    }

    #[test]
    fn wrong_token_is_refused_by_both_sides() {
        let (parent, child) = UnixStream::pair().expect("socket pair");
        let worker = spawn_worker(child, TOKEN, Arc::new(Recorder::default()));
        let mut channel = MessageChannel::new(parent);
        let err = client_handshake(&mut channel, "not-the-token").expect_err("mismatch");
        assert!(matches!(err, ChannelError::TokenMismatch));
        let worker_result = worker.join().expect("worker thread");
        assert!(matches!(worker_result, Err(ChannelError::TokenMismatch)));
    }

    struct ThreadChild {
        handle: Option<thread::JoinHandle<Result<(), ChannelError>>>,
    }

    impl ChildProcess for ThreadChild {
        fn try_wait(&mut self) -> Result<Option<i32>> {
            match &self.handle {
                Some(handle) if !handle.is_finished() => Ok(None),
                _ => self.wait().map(Some),
            }
        }

        fn wait(&mut self) -> Result<i32> {
            let Some(handle) = self.handle.take() else {
                return Ok(0);
            };
            match handle.join() {
                Ok(Ok(())) => Ok(0),
                Ok(Err(_)) => Ok(1),
                Err(_) => Err(anyhow!("worker thread panicked")),
            }
        }

        fn kill(&mut self) -> Result<()> {
            Ok(())
        }
    }

    struct ThreadLauncher {
        recorder: Arc<Recorder>,
        token_override: Option<String>,
    }

    impl ChildLauncher for ThreadLauncher {
        fn launch(&mut self, pipe_name: &str, token: &str) -> Result<Box<dyn ChildProcess>> {
            let name = pipe_name.to_string();
            let token = self
                .token_override
                .clone()
                .unwrap_or_else(|| token.to_string());
            let recorder = Arc::clone(&self.recorder);
            let handle = thread::spawn(move || {
                let mut channel = open_server(&name, &token)?;
                let mut handler = RecordingHandler { recorder };
                run_message_pump(&mut channel, &mut handler)
            });
            Ok(Box::new(ThreadChild {
                handle: Some(handle),
            }))
        }
    }

    #[test]
    fn connect_client_launches_and_authenticates_worker() {
        let recorder = Arc::new(Recorder::default());
        let mut launcher = ThreadLauncher {
            recorder: Arc::clone(&recorder),
            token_override: None,
        };
        let mut session =
            ElevationSession::launch(&mut launcher, "chainer-test", Duration::from_secs(10))
                .expect("worker must connect");
        assert!(session.is_connected());
        session
            .session_begin(BundleAction::Repair, 1)
            .expect("begin");
        session
            .session_end(BundleAction::Repair, false)
            .expect("end");
        assert_eq!(session.terminate().expect("terminate"), Some(0));
        assert_eq!(recorder.calls(), vec!["begin:repair:1", "end:false"]);
    }

    #[test]
    fn connect_client_fails_when_worker_presents_wrong_token() {
        let mut launcher = ThreadLauncher {
            recorder: Arc::new(Recorder::default()),
            token_override: Some("forged".to_string()),
        };
        let result = connect_client(&mut launcher, "chainer-test", Duration::from_secs(10));
        assert!(result.is_err());
    }
}
