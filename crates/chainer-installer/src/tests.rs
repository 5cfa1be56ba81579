use super::*;
use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::anyhow;
use chainer_core::section::{
    BUNDLE_SECTION_MAGIC, BUNDLE_SECTION_NAME, BUNDLE_SECTION_VERSION, CONTAINER_FORMAT_CABINET,
};
use chainer_core::status;
use chainer_core::{
    ActionState, BufferWriter, CacheLayout, CurrentState, EmbeddedPayload, ExitCodeBehavior,
    ExitCodeRule, Package, PackageIndex, PackageKind, Payload, PayloadIndex, Variables,
};
use chainer_plan::{PackageEngine, PackageOutcome};
use chainer_security::sha256_hex;
use semver::Version;

use crate::native::kb_number;
use crate::receipts::parse_receipt;

static TEST_ROOT_COUNTER: AtomicU64 = AtomicU64::new(0);

fn test_root() -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let sequence = TEST_ROOT_COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!(
        "chainer-installer-tests-{}-{}-{}",
        std::process::id(),
        nanos,
        sequence
    ))
}

/// Records every launch and answers with queued exit codes (0 once drained).
#[derive(Default)]
struct RecordingRunner {
    calls: RefCell<Vec<(PathBuf, Vec<String>)>>,
    exit_codes: RefCell<Vec<u32>>,
}

impl RecordingRunner {
    fn answering(codes: &[u32]) -> Rc<Self> {
        let runner = Self::default();
        runner.exit_codes.borrow_mut().extend(codes.iter().rev());
        Rc::new(runner)
    }

    fn calls(&self) -> Vec<(PathBuf, Vec<String>)> {
        self.calls.borrow().clone()
    }
}

impl ProcessRunner for RecordingRunner {
    fn run(&self, program: &Path, arguments: &[String]) -> anyhow::Result<u32> {
        self.calls
            .borrow_mut()
            .push((program.to_path_buf(), arguments.to_vec()));
        Ok(self.exit_codes.borrow_mut().pop().unwrap_or(0))
    }
}

struct Fixture {
    root: PathBuf,
    source_dir: PathBuf,
    cache: PayloadCache,
    products: Rc<ReceiptStore>,
}

impl Fixture {
    fn new() -> Self {
        let root = test_root();
        let source_dir = root.join("source");
        fs::create_dir_all(&source_dir).expect("must create source dir");
        let layout = CacheLayout::under(root.join("cache"));
        Self {
            cache: PayloadCache::new(layout.clone(), &source_dir),
            products: Rc::new(ReceiptStore::new(layout)),
            source_dir,
            root,
        }
    }

    fn add_source(&self, name: &str, bytes: &[u8]) -> String {
        fs::write(self.source_dir.join(name), bytes).expect("must write source payload");
        sha256_hex(bytes)
    }

    fn context(&self, runner: Rc<RecordingRunner>) -> InstallerContext {
        InstallerContext {
            cache: self.cache.clone(),
            runner,
            products: self.products.clone(),
            tools: NativeTools::default(),
        }
    }

    /// Copies the package's payloads into the cache.
    fn cache_package(&self, package: &Package) {
        for payload in &package.payloads {
            self.cache
                .cache_payload(package, payload, |_, _| {})
                .expect("must cache payload");
        }
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

fn payload(file_name: &str, sha256: Option<String>) -> Payload {
    Payload {
        id: file_name.to_string(),
        index: PayloadIndex::from_slot(0),
        file_name: file_name.to_string(),
        size: 4,
        sha256,
        source_path: Some(file_name.to_string()),
        download_url: None,
        embedded: None,
    }
}

fn package(id: &str, kind: PackageKind, payload: Payload) -> Package {
    let mut package = Package::new(id, PackageIndex::from_slot(0), kind);
    package.payloads.push(payload);
    package
}

#[test]
fn split_arguments_honours_quotes() {
    let arguments =
        split_arguments(r#"/quiet  INSTALLDIR="C:\Program Files\App" """#).expect("must split");
    assert_eq!(
        arguments,
        vec![
            "/quiet".to_string(),
            r"INSTALLDIR=C:\Program Files\App".to_string(),
            String::new(),
        ]
    );
    assert!(split_arguments("   ").expect("must split blank").is_empty());
    assert!(split_arguments(r#"/log "unterminated"#).is_err());
}

#[test]
fn receipts_round_trip_through_the_store() {
    let fixture = Fixture::new();
    let receipt = ProductReceipt::new(
        "{8A1F-22B0}",
        "runtime",
        PackageKind::Msi,
        Some(Version::new(2, 1, 0)),
    );
    let path = fixture
        .products
        .write(true, &receipt)
        .expect("must write receipt");
    assert!(path.starts_with(fixture.root.join("cache").join("machine")));
    assert_eq!(
        path.file_name().and_then(|name| name.to_str()),
        Some("_8a1f-22b0_.receipt")
    );

    let loaded = fixture
        .products
        .read(true, "{8A1F-22B0}")
        .expect("must read receipt")
        .expect("receipt must exist");
    assert_eq!(loaded, receipt);
    assert!(fixture
        .products
        .read(false, "{8A1F-22B0}")
        .expect("must read per-user receipts")
        .is_none());

    assert!(fixture.products.remove(true, "{8A1F-22B0}").expect("must remove"));
    assert!(!fixture.products.remove(true, "{8A1F-22B0}").expect("must tolerate missing"));
}

#[test]
fn parse_receipt_rejects_unknown_kind_and_missing_fields() {
    let err = parse_receipt("key=a\npackage_id=a\nkind=pkg\ninstalled_at_unix=1\n")
        .expect_err("unknown kind must fail");
    assert!(err.to_string().contains("invalid receipt kind"));
    assert!(parse_receipt("key=a\nkind=exe\ninstalled_at_unix=1\n").is_err());
}

#[test]
fn cache_copies_from_source_then_hits() {
    let fixture = Fixture::new();
    let digest = fixture.add_source("setup.exe", b"MZ\x90\x00");
    let package = package("tool", PackageKind::Exe, payload("setup.exe", Some(digest)));

    assert!(!fixture.cache.is_cached(&package).expect("must check cache"));
    let mut reported = Vec::new();
    let outcome = fixture
        .cache
        .cache_payload(&package, &package.payloads[0], |done, total| {
            reported.push((done, total))
        })
        .expect("must cache payload");
    assert_eq!(outcome, CacheOutcome::Copied);
    assert_eq!(reported.last(), Some(&(4, Some(4))));
    assert!(fixture.cache.is_cached(&package).expect("must check cache"));

    let again = fixture
        .cache
        .cache_payload(&package, &package.payloads[0], |_, _| {})
        .expect("must recheck cached payload");
    assert_eq!(again, CacheOutcome::Hit);

    fixture.cache.remove_package(&package);
    assert!(!fixture.cache.is_cached(&package).expect("must check cache"));
    fixture.cache.remove_package(&package);
}

#[test]
fn cache_rejects_digest_mismatch() {
    let fixture = Fixture::new();
    fixture.add_source("setup.exe", b"MZ\x90\x00");
    let package = package(
        "tool",
        PackageKind::Exe,
        payload("setup.exe", Some(sha256_hex(b"something else"))),
    );

    let err = fixture
        .cache
        .cache_payload(&package, &package.payloads[0], |_, _| {})
        .expect_err("mismatched digest must fail");
    assert!(err.to_string().contains("sha256 mismatch"));

    let target = fixture.cache.payload_path(&package, &package.payloads[0]);
    assert!(!target.exists());
    assert!(!target.with_file_name("setup.exe.part").exists());
}

#[test]
fn cache_reports_missing_source_without_download_url() {
    let fixture = Fixture::new();
    let package = package("tool", PackageKind::Exe, payload("absent.exe", None));
    let err = fixture
        .cache
        .cache_payload(&package, &package.payloads[0], |_, _| {})
        .expect_err("missing source must fail");
    assert!(err.to_string().contains("not found"));
}

const IMAGE_STUB_SIZE: usize = 0x400;

/// Bootstrapper image: a PE stub carrying one `.wixburn` section, followed by
/// the containers back to back.
fn bundle_image(containers: &[&[u8]]) -> Vec<u8> {
    let nt_offset = 0x80_usize;
    let section_table = nt_offset + 4 + 20;
    let data_offset = section_table + 40;

    let mut image = vec![0_u8; data_offset];
    image[..2].copy_from_slice(b"MZ");
    image[0x3c..0x40].copy_from_slice(&(nt_offset as u32).to_le_bytes());
    image[nt_offset..nt_offset + 4].copy_from_slice(b"PE\0\0");
    image[nt_offset + 6..nt_offset + 8].copy_from_slice(&1_u16.to_le_bytes());
    image[section_table..section_table + 8].copy_from_slice(BUNDLE_SECTION_NAME);
    image[section_table + 20..section_table + 24]
        .copy_from_slice(&(data_offset as u32).to_le_bytes());

    let mut writer = BufferWriter::new();
    writer
        .write_u32(BUNDLE_SECTION_MAGIC)
        .write_u32(BUNDLE_SECTION_VERSION);
    image.extend_from_slice(writer.as_slice());
    image.extend_from_slice(&[0x5A; 16]);
    let mut writer = BufferWriter::new();
    writer
        .write_u32(IMAGE_STUB_SIZE as u32)
        .write_u32(0)
        .write_u32(0)
        .write_u32(0)
        .write_u32(CONTAINER_FORMAT_CABINET)
        .write_u32(containers.len() as u32);
    for container in containers {
        writer.write_u32(container.len() as u32);
    }
    image.extend_from_slice(writer.as_slice());

    image.resize(IMAGE_STUB_SIZE, 0);
    for container in containers {
        image.extend_from_slice(container);
    }
    image
}

fn attached_payload(file_name: &str, body: &[u8], offset: u64) -> Payload {
    Payload {
        source_path: None,
        size: body.len() as u64,
        embedded: Some(EmbeddedPayload {
            container: 1,
            offset,
        }),
        ..payload(file_name, Some(sha256_hex(body)))
    }
}

#[test]
fn cache_extracts_payload_attached_to_the_bundle_image() {
    let fixture = Fixture::new();
    let body = b"attached installer body";
    let mut container = vec![0xEE_u8; 32];
    container.extend_from_slice(body);
    container.extend_from_slice(&[0xEE; 8]);
    let image_path = fixture.source_dir.join("suite-setup.exe");
    fs::write(&image_path, bundle_image(&[b"ux container".as_slice(), container.as_slice()]))
        .expect("must write bundle image");
    let cache = fixture.cache.clone().with_bundle_image(&image_path);
    let package = package("tool", PackageKind::Exe, attached_payload("tool.exe", body, 32));

    let mut reported = Vec::new();
    let outcome = cache
        .cache_payload(&package, &package.payloads[0], |done, total| {
            reported.push((done, total))
        })
        .expect("must extract attached payload");
    assert_eq!(outcome, CacheOutcome::Extracted);
    assert_eq!(
        reported.last(),
        Some(&(body.len() as u64, Some(body.len() as u64)))
    );
    assert_eq!(
        fs::read(cache.payload_path(&package, &package.payloads[0])).expect("cached payload"),
        body
    );
    assert_eq!(
        cache
            .cache_payload(&package, &package.payloads[0], |_, _| {})
            .expect("must recheck cached payload"),
        CacheOutcome::Hit
    );

    let overrun = Payload {
        sha256: None,
        ..attached_payload("big.exe", &[0; 64], 32)
    };
    let err = cache
        .cache_payload(&package, &overrun, |_, _| {})
        .expect_err("payload past the container end must fail");
    assert!(err.to_string().contains("overruns container 1"));

    let missing_container = Payload {
        embedded: Some(EmbeddedPayload {
            container: 2,
            offset: 0,
        }),
        ..attached_payload("other.exe", body, 0)
    };
    assert!(cache
        .cache_payload(&package, &missing_container, |_, _| {})
        .is_err());
}

#[test]
fn attached_payload_needs_a_bundle_image() {
    let fixture = Fixture::new();
    let package = package(
        "tool",
        PackageKind::Exe,
        attached_payload("tool.exe", b"body", 0),
    );
    let err = fixture
        .cache
        .cache_payload(&package, &package.payloads[0], |_, _| {})
        .expect_err("no image to extract from");
    assert!(err.to_string().contains("no bundle image"));
}

#[test]
fn loose_source_file_wins_over_the_attached_copy() {
    let fixture = Fixture::new();
    let digest = fixture.add_source("tool.exe", b"loose");
    let cache = fixture
        .cache
        .clone()
        .with_bundle_image(fixture.source_dir.join("missing-setup.exe"));
    let package = package(
        "tool",
        PackageKind::Exe,
        Payload {
            source_path: Some("tool.exe".to_string()),
            sha256: Some(digest),
            ..attached_payload("tool.exe", b"loose", 0)
        },
    );
    assert_eq!(
        cache
            .cache_payload(&package, &package.payloads[0], |_, _| {})
            .expect("must copy loose payload"),
        CacheOutcome::Copied
    );
}

#[test]
fn cache_downloads_payload_missing_from_source() {
    let fixture = Fixture::new();
    let body = b"downloaded payload bytes".to_vec();
    let listener =
        std::net::TcpListener::bind("127.0.0.1:0").expect("must bind one-shot test server");
    let address = listener
        .local_addr()
        .expect("must read one-shot test server address");
    let served = body.clone();
    let handle = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("must accept test client");
        let mut request_buffer = [0_u8; 1024];
        let _ = std::io::Read::read(&mut stream, &mut request_buffer);
        std::io::Write::write_all(
            &mut stream,
            format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                served.len()
            )
            .as_bytes(),
        )
        .expect("must write test response headers");
        std::io::Write::write_all(&mut stream, &served).expect("must write test response body");
        std::io::Write::flush(&mut stream).expect("must flush test response");
    });

    let mut remote = payload("update.msu", Some(sha256_hex(&body)));
    remote.source_path = Some("not-shipped/update.msu".to_string());
    remote.download_url = Some(format!("http://{address}/update.msu"));
    let package = package("kb", PackageKind::Msu, remote);

    let outcome = fixture
        .cache
        .cache_payload(&package, &package.payloads[0], |_, _| {})
        .expect("must download payload");
    handle.join().expect("test server must finish");

    assert_eq!(outcome, CacheOutcome::Downloaded);
    let cached = fs::read(fixture.cache.payload_path(&package, &package.payloads[0]))
        .expect("must read downloaded payload");
    assert_eq!(cached, body);
}

#[test]
fn exe_detection_prefers_declared_condition() {
    let fixture = Fixture::new();
    let engine = ExeEngine::new(
        fixture.cache.clone(),
        RecordingRunner::answering(&[]),
        fixture.products.clone(),
    );
    let mut package = package("tool", PackageKind::Exe, payload("setup.exe", None));
    package.detect_condition = Some("ToolVersion >= 3".to_string());

    let mut variables = Variables::new();
    variables.set_numeric("ToolVersion", 4).expect("must set variable");
    let detection = engine.detect(&package, &variables).expect("must detect");
    assert_eq!(detection.state, CurrentState::Present);

    variables.set_numeric("ToolVersion", 2).expect("must set variable");
    let detection = engine.detect(&package, &variables).expect("must detect");
    assert_eq!(detection.state, CurrentState::Absent);

    package.detect_condition = Some("ToolVersion >=".to_string());
    assert!(engine.detect(&package, &variables).is_err());
}

#[test]
fn exe_install_then_uninstall_maintains_receipt() {
    let fixture = Fixture::new();
    fixture.add_source("setup.exe", b"MZ\x90\x00");
    let runner = RecordingRunner::answering(&[0, 0]);
    let engines = default_engines(&fixture.context(runner.clone()));
    let engine = engines.get(PackageKind::Exe).expect("exe engine");

    let mut package = package("tool", PackageKind::Exe, payload("setup.exe", None));
    package.version = Some(Version::new(1, 4, 0));
    package.commands.install_arguments = Some("/install /quiet".to_string());
    package.commands.uninstall_arguments = Some("/uninstall /quiet".to_string());
    fixture.cache_package(&package);
    let variables = Variables::new();

    assert_eq!(
        engine.detect(&package, &variables).expect("must detect").state,
        CurrentState::Absent
    );
    let outcome = engine
        .execute(&package, ActionState::Install, &variables, false)
        .expect("must install");
    assert_eq!(outcome, PackageOutcome::Success);

    let detection = engine.detect(&package, &variables).expect("must detect");
    assert_eq!(detection.state, CurrentState::Present);
    assert_eq!(detection.installed_version, Some(Version::new(1, 4, 0)));

    engine
        .execute(&package, ActionState::Uninstall, &variables, true)
        .expect("must uninstall");
    assert_eq!(
        engine.detect(&package, &variables).expect("must detect").state,
        CurrentState::Absent
    );

    let calls = runner.calls();
    assert_eq!(calls.len(), 2);
    let program = fixture.cache.payload_path(&package, &package.payloads[0]);
    assert_eq!(calls[0].0, program);
    assert_eq!(calls[0].1, vec!["/install", "/quiet"]);
    assert_eq!(calls[1].1, vec!["/uninstall", "/quiet"]);
}

#[test]
fn exe_exit_code_rules_classify_outcome() {
    let fixture = Fixture::new();
    fixture.add_source("setup.exe", b"MZ\x90\x00");
    let runner = RecordingRunner::answering(&[3010, 1603]);
    let engine = ExeEngine::new(fixture.cache.clone(), runner, fixture.products.clone());

    let mut package = package("tool", PackageKind::Exe, payload("setup.exe", None));
    package.commands.exit_codes = vec![
        ExitCodeRule::exact(0, ExitCodeBehavior::Success),
        ExitCodeRule::exact(3010, ExitCodeBehavior::ScheduleReboot),
    ];
    fixture.cache_package(&package);
    let variables = Variables::new();

    let outcome = engine
        .execute(&package, ActionState::Install, &variables, false)
        .expect("must execute");
    assert_eq!(outcome, PackageOutcome::ScheduleReboot);

    fixture.products.remove(false, "tool").expect("must reset receipt");
    let outcome = engine
        .execute(&package, ActionState::Install, &variables, false)
        .expect("failed installer is an outcome, not an error");
    assert_eq!(outcome, PackageOutcome::Failed(0x8007_0643));
    assert!(fixture
        .products
        .read(false, "tool")
        .expect("must read receipt")
        .is_none());
}

#[test]
fn exe_execute_contract_violations_are_errors() {
    let fixture = Fixture::new();
    let runner = RecordingRunner::answering(&[]);
    let engine = ExeEngine::new(fixture.cache.clone(), runner.clone(), fixture.products.clone());
    let package = package("tool", PackageKind::Exe, payload("setup.exe", None));
    let variables = Variables::new();

    let err = engine
        .execute(&package, ActionState::Install, &variables, false)
        .expect_err("uncached payload must fail");
    assert!(err.to_string().contains("not cached"));

    let err = engine
        .execute(&package, ActionState::Uninstall, &variables, false)
        .expect_err("missing uninstall arguments must fail");
    assert!(err.to_string().contains("no uninstall arguments"));

    assert_eq!(
        engine
            .execute(&package, ActionState::None, &variables, false)
            .expect("none is a no-op"),
        PackageOutcome::Success
    );
    assert!(runner.calls().is_empty());
}

#[test]
fn msi_engine_builds_msiexec_command_lines() {
    let fixture = Fixture::new();
    fixture.add_source("runtime.msi", b"\xd0\xcf\x11\xe0");
    let runner = RecordingRunner::answering(&[3010, 0, 0]);
    let engines = default_engines(&fixture.context(runner.clone()));
    let engine = engines.get(PackageKind::Msi).expect("msi engine");

    let mut package = package("runtime", PackageKind::Msi, payload("runtime.msi", None));
    package.per_machine = true;
    package.product_code = Some("{0F2A-11}".to_string());
    package.version = Some(Version::new(2, 0, 0));
    package.commands.install_arguments = Some("ADDLOCAL=ALL".to_string());
    fixture.cache_package(&package);
    let variables = Variables::new();

    let outcome = engine
        .execute(&package, ActionState::Install, &variables, false)
        .expect("must install");
    assert_eq!(outcome, PackageOutcome::ScheduleReboot);
    let detection = engine.detect(&package, &variables).expect("must detect");
    assert_eq!(detection.state, CurrentState::Present);
    assert_eq!(detection.installed_version, Some(Version::new(2, 0, 0)));

    engine
        .execute(&package, ActionState::Maintenance, &variables, false)
        .expect("must repair");
    engine
        .execute(&package, ActionState::Uninstall, &variables, false)
        .expect("must uninstall");
    assert_eq!(
        engine.detect(&package, &variables).expect("must detect").state,
        CurrentState::Absent
    );

    let payload_path = fixture
        .cache
        .payload_path(&package, &package.payloads[0])
        .to_string_lossy()
        .into_owned();
    let calls = runner.calls();
    assert_eq!(calls[0].0, PathBuf::from("msiexec"));
    assert_eq!(
        calls[0].1,
        vec!["/i", payload_path.as_str(), "ADDLOCAL=ALL", "/qn", "/norestart"]
    );
    assert_eq!(
        calls[1].1,
        vec![
            "/i",
            payload_path.as_str(),
            "REINSTALL=ALL",
            "ADDLOCAL=ALL",
            "/qn",
            "/norestart"
        ]
    );
    assert_eq!(calls[2].1, vec!["/x", "{0F2A-11}", "/qn", "/norestart"]);
}

#[test]
fn msi_engine_requires_product_code() {
    let fixture = Fixture::new();
    let engine = MsiEngine::new(
        fixture.cache.clone(),
        RecordingRunner::answering(&[]),
        fixture.products.clone(),
        &NativeTools::default(),
    );
    let package = package("runtime", PackageKind::Msi, payload("runtime.msi", None));
    let err = engine
        .detect(&package, &Variables::new())
        .expect_err("missing product code must fail");
    assert!(err.to_string().contains("no product code"));
}

#[test]
fn msu_engine_reports_forced_reboot_and_uninstalls_by_kb() {
    let fixture = Fixture::new();
    fixture.add_source("update.msu", b"MSCF");
    let runner = RecordingRunner::answering(&[1641, 0]);
    let tools = NativeTools {
        msiexec: PathBuf::from("msiexec"),
        wusa: PathBuf::from("/opt/tools/wusa"),
    };
    let engine = MsuEngine::new(
        fixture.cache.clone(),
        runner.clone(),
        fixture.products.clone(),
        &tools,
    );
    let mut package = package("kb", PackageKind::Msu, payload("update.msu", None));
    package.product_code = Some("KB5034441".to_string());
    fixture.cache_package(&package);
    let variables = Variables::new();

    assert_eq!(
        engine
            .execute(&package, ActionState::Install, &variables, false)
            .expect("must install"),
        PackageOutcome::ForceReboot
    );
    engine
        .execute(&package, ActionState::Uninstall, &variables, true)
        .expect("must uninstall");

    let calls = runner.calls();
    assert_eq!(calls[0].0, PathBuf::from("/opt/tools/wusa"));
    assert_eq!(calls[0].1[1..], ["/quiet", "/norestart"]);
    assert_eq!(calls[1].1, vec!["/uninstall", "/kb:5034441", "/quiet", "/norestart"]);
}

#[test]
fn kb_number_strips_prefix_case_insensitively() {
    assert_eq!(kb_number("KB123"), "123");
    assert_eq!(kb_number(" kb456 "), "456");
    assert_eq!(kb_number("789"), "789");
    assert_eq!(kb_number("k"), "k");
}

#[test]
fn default_engines_cover_every_kind() {
    let fixture = Fixture::new();
    let engines = default_engines(&fixture.context(RecordingRunner::answering(&[])));
    for kind in [PackageKind::Exe, PackageKind::Msi, PackageKind::Msu] {
        assert_eq!(engines.get(kind).expect("engine must exist").kind(), kind);
    }
}

#[test]
fn failing_runner_errors_propagate() {
    struct FailingRunner;
    impl ProcessRunner for FailingRunner {
        fn run(&self, program: &Path, _arguments: &[String]) -> anyhow::Result<u32> {
            Err(anyhow!("cannot launch {}", program.display()))
        }
    }

    let fixture = Fixture::new();
    fixture.add_source("setup.exe", b"MZ\x90\x00");
    let engine = ExeEngine::new(
        fixture.cache.clone(),
        Rc::new(FailingRunner),
        fixture.products.clone(),
    );
    let package = package("tool", PackageKind::Exe, payload("setup.exe", None));
    fixture.cache_package(&package);
    assert!(engine
        .execute(&package, ActionState::Install, &Variables::new(), false)
        .is_err());
    assert_eq!(
        PackageOutcome::from_exit_code(&[], 1603).status_code(),
        status::from_exit_code(1603)
    );
}
