use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chainer_core::{read_bundle_section, CacheLayout, EmbeddedPayload, Package, Payload};
use chainer_security::verify_sha256_file;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Hit,
    Copied,
    Extracted,
    Downloaded,
}

impl CacheOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "cache-hit",
            Self::Copied => "copied",
            Self::Extracted => "extracted",
            Self::Downloaded => "downloaded",
        }
    }
}

/// Moves payloads from the bundle source, the bundle image's attached
/// containers or the network into the package cache and verifies them.
#[derive(Debug, Clone)]
pub struct PayloadCache {
    layout: CacheLayout,
    source_dir: PathBuf,
    bundle_image: Option<PathBuf>,
}

impl PayloadCache {
    pub fn new(layout: CacheLayout, source_dir: impl Into<PathBuf>) -> Self {
        Self {
            layout,
            source_dir: source_dir.into(),
            bundle_image: None,
        }
    }

    /// The bootstrapper image whose attached containers hold embedded
    /// payloads.
    pub fn with_bundle_image(mut self, image: impl Into<PathBuf>) -> Self {
        self.bundle_image = Some(image.into());
        self
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    pub fn payload_path(&self, package: &Package, payload: &Payload) -> PathBuf {
        self.layout
            .payload_cache_path(package.per_machine, &package.id, &payload.file_name)
    }

    /// Cached path of the payload the package launches.
    pub fn primary_payload_path(&self, package: &Package) -> Result<PathBuf> {
        let payload = package
            .payloads
            .first()
            .ok_or_else(|| anyhow!("package '{}' declares no payloads", package.id))?;
        Ok(self.payload_path(package, payload))
    }

    /// True when every payload is present and matches its declared digest.
    pub fn is_cached(&self, package: &Package) -> Result<bool> {
        for payload in &package.payloads {
            if !self.is_payload_valid(&self.payload_path(package, payload), payload)? {
                return Ok(false);
            }
        }
        Ok(!package.payloads.is_empty())
    }

    fn is_payload_valid(&self, path: &Path, payload: &Payload) -> Result<bool> {
        if !path.is_file() {
            return Ok(false);
        }
        match &payload.sha256 {
            Some(expected) => verify_sha256_file(path, expected),
            None => Ok(true),
        }
    }

    pub fn cache_payload<F>(&self, package: &Package, payload: &Payload, mut on_progress: F) -> Result<CacheOutcome>
    where
        F: FnMut(u64, Option<u64>),
    {
        let target = self.payload_path(package, payload);
        if self.is_payload_valid(&target, payload)? {
            debug!(payload = %payload.id, "payload already cached");
            return Ok(CacheOutcome::Hit);
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create cache dir: {}", parent.display()))?;
        }
        let part_path = target.with_file_name(format!("{}.part", payload.file_name));

        let loose_source = payload
            .source_path
            .as_ref()
            .map(|source| self.source_dir.join(source))
            .filter(|source| source.is_file());
        let outcome = match (loose_source, payload.embedded, &payload.download_url) {
            (Some(source), _, _) => {
                copy_with_progress(&source, &part_path, &mut on_progress)?;
                CacheOutcome::Copied
            }
            (None, Some(embedded), _) => {
                self.extract_embedded(payload, embedded, &part_path, &mut on_progress)?;
                CacheOutcome::Extracted
            }
            (None, None, Some(url)) => {
                download_with_progress(url, &part_path, &mut on_progress)?;
                CacheOutcome::Downloaded
            }
            (None, None, None) => {
                return Err(match &payload.source_path {
                    Some(source) => anyhow!(
                        "payload '{}' not found at {}",
                        payload.id,
                        self.source_dir.join(source).display()
                    ),
                    None => anyhow!("payload '{}' has no source", payload.id),
                });
            }
        };

        if let Some(expected) = &payload.sha256 {
            let verified = verify_sha256_file(&part_path, expected).with_context(|| {
                format!("failed to verify payload '{}'", payload.id)
            })?;
            if !verified {
                let _ = fs::remove_file(&part_path);
                return Err(anyhow!(
                    "sha256 mismatch for payload '{}' (expected {expected})",
                    payload.id
                ));
            }
        }

        if target.exists() {
            fs::remove_file(&target)
                .with_context(|| format!("failed to replace cache file: {}", target.display()))?;
        }
        fs::rename(&part_path, &target).with_context(|| {
            format!(
                "failed to move payload into cache: {}",
                target.display()
            )
        })?;
        info!(
            package = %package.id,
            payload = %payload.id,
            outcome = outcome.as_str(),
            "payload cached"
        );
        Ok(outcome)
    }

    fn extract_embedded(
        &self,
        payload: &Payload,
        embedded: EmbeddedPayload,
        destination: &Path,
        on_progress: &mut dyn FnMut(u64, Option<u64>),
    ) -> Result<()> {
        let image_path = self.bundle_image.as_deref().ok_or_else(|| {
            anyhow!(
                "payload '{}' is attached to the bundle but no bundle image is known",
                payload.id
            )
        })?;
        let image = fs::read(image_path)
            .with_context(|| format!("failed to read bundle image: {}", image_path.display()))?;
        let section = read_bundle_section(&image).with_context(|| {
            format!("failed to read bundle section of {}", image_path.display())
        })?;

        let container = embedded.container as usize;
        let container_size = u64::from(section.container_size(container)?);
        let fits = embedded
            .offset
            .checked_add(payload.size)
            .is_some_and(|end| end <= container_size);
        if !fits {
            return Err(anyhow!(
                "payload '{}' ({} bytes at offset {}) overruns container {container} ({container_size} bytes)",
                payload.id,
                payload.size,
                embedded.offset
            ));
        }
        let start = section.container_offset(container)? + embedded.offset;
        let end = start + payload.size;
        let mut bytes = usize::try_from(start)
            .ok()
            .zip(usize::try_from(end).ok())
            .and_then(|(start, end)| image.get(start..end))
            .ok_or_else(|| {
                anyhow!(
                    "payload '{}' lies beyond the end of bundle image {}",
                    payload.id,
                    image_path.display()
                )
            })?;
        debug!(
            payload = %payload.id,
            container,
            offset = start,
            "extracting attached payload"
        );

        let output = fs::File::create(destination)
            .with_context(|| format!("failed to create {}", destination.display()))?;
        stream_with_progress(&mut bytes, output, Some(payload.size), on_progress).with_context(
            || {
                format!(
                    "failed to extract payload '{}' from {}",
                    payload.id,
                    image_path.display()
                )
            },
        )
    }

    /// Deletes the package's cached payloads; failures are logged only.
    pub fn remove_package(&self, package: &Package) {
        let dir = self.layout.package_cache_dir(package.per_machine, &package.id);
        if let Err(err) = fs::remove_dir_all(&dir) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %dir.display(), error = %err, "failed to remove package cache");
            }
        }
    }
}

fn copy_with_progress(
    source: &Path,
    destination: &Path,
    on_progress: &mut dyn FnMut(u64, Option<u64>),
) -> Result<()> {
    let mut input = fs::File::open(source)
        .with_context(|| format!("failed to open payload source: {}", source.display()))?;
    let total = input.metadata().ok().map(|metadata| metadata.len());
    let output = fs::File::create(destination)
        .with_context(|| format!("failed to create {}", destination.display()))?;
    stream_with_progress(&mut input, output, total, on_progress).with_context(|| {
        format!(
            "failed to copy {} to {}",
            source.display(),
            destination.display()
        )
    })
}

fn download_with_progress(
    url: &str,
    destination: &Path,
    on_progress: &mut dyn FnMut(u64, Option<u64>),
) -> Result<()> {
    let mut response = reqwest::blocking::get(url)
        .and_then(|response| response.error_for_status())
        .with_context(|| format!("failed to download {url}"))?;
    let total = response.content_length();
    let output = fs::File::create(destination)
        .with_context(|| format!("failed to create {}", destination.display()))?;
    let result = stream_with_progress(&mut response, output, total, on_progress)
        .with_context(|| format!("failed reading download body from {url}"));
    if result.is_err() {
        let _ = fs::remove_file(destination);
    }
    result
}

fn stream_with_progress(
    input: &mut dyn Read,
    mut output: fs::File,
    total: Option<u64>,
    on_progress: &mut dyn FnMut(u64, Option<u64>),
) -> Result<()> {
    let mut buffer = [0_u8; 64 * 1024];
    let mut written = 0_u64;
    loop {
        let read = input.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        output.write_all(&buffer[..read])?;
        written += read as u64;
        on_progress(written, total);
    }
    output.flush()?;
    on_progress(written, total.or(Some(written)));
    Ok(())
}
