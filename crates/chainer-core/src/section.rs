//! Locates and parses the bundle section embedded in the bootstrapper image.
//! Container offsets for payload lookup are derived from it.

use anyhow::{anyhow, Context, Result};

use crate::buffer::BufferReader;

pub const BUNDLE_SECTION_NAME: &[u8; 8] = b".wixburn";
pub const BUNDLE_SECTION_MAGIC: u32 = 0x00f1_4300;
pub const BUNDLE_SECTION_VERSION: u32 = 2;
pub const CONTAINER_FORMAT_CABINET: u32 = 1;

const DOS_SIGNATURE: &[u8; 2] = b"MZ";
const NT_SIGNATURE: &[u8; 4] = b"PE\0\0";
const DOS_LFANEW_OFFSET: usize = 0x3c;
const FILE_HEADER_SIZE: usize = 20;
const SECTION_HEADER_SIZE: usize = 40;
const SECTION_HEADER_FIXED_SIZE: usize = 4 * 8 + 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleSection {
    /// File offset of the section data.
    pub offset: u32,
    pub bundle_code: [u8; 16],
    pub stub_size: u32,
    pub original_checksum: u32,
    pub original_signature_offset: u32,
    pub original_signature_size: u32,
    pub container_format: u32,
    pub container_sizes: Vec<u32>,
}

impl BundleSection {
    pub fn container_count(&self) -> usize {
        self.container_sizes.len()
    }

    /// Absolute file offset of a container. Containers follow the stub
    /// back to back; index 0 is the UX container.
    pub fn container_offset(&self, index: usize) -> Result<u64> {
        if index >= self.container_sizes.len() {
            return Err(anyhow!(
                "container index {index} is out of range ({} containers)",
                self.container_sizes.len()
            ));
        }
        let preceding = self.container_sizes[..index]
            .iter()
            .map(|size| u64::from(*size))
            .sum::<u64>();
        Ok(u64::from(self.stub_size) + preceding)
    }

    pub fn container_size(&self, index: usize) -> Result<u32> {
        self.container_sizes
            .get(index)
            .copied()
            .ok_or_else(|| anyhow!("container index {index} is out of range"))
    }
}

/// Finds the bundle section in a PE image and parses its header.
pub fn read_bundle_section(image: &[u8]) -> Result<BundleSection> {
    let offset = find_section_offset(image, BUNDLE_SECTION_NAME)?
        .ok_or_else(|| anyhow!("bundle section was not found in image"))?;
    let data = image
        .get(offset as usize..)
        .ok_or_else(|| anyhow!("bundle section offset {offset} is beyond end of image"))?;
    parse_bundle_section(data, offset)
}

pub fn parse_bundle_section(data: &[u8], offset: u32) -> Result<BundleSection> {
    if data.len() < SECTION_HEADER_FIXED_SIZE {
        return Err(anyhow!(
            "bundle section is {} bytes, smaller than its {} byte header",
            data.len(),
            SECTION_HEADER_FIXED_SIZE
        ));
    }

    let mut reader = BufferReader::new(data);
    let magic = reader.read_u32()?;
    if magic != BUNDLE_SECTION_MAGIC {
        return Err(anyhow!("invalid bundle section magic: 0x{magic:08x}"));
    }
    let version = reader.read_u32()?;
    if version != BUNDLE_SECTION_VERSION {
        return Err(anyhow!("unsupported bundle section version: {version}"));
    }
    let bundle_code = reader.read_fixed::<16>()?;
    let stub_size = reader.read_u32()?;
    let original_checksum = reader.read_u32()?;
    let original_signature_offset = reader.read_u32()?;
    let original_signature_size = reader.read_u32()?;
    let container_format = reader.read_u32()?;
    if container_format != CONTAINER_FORMAT_CABINET {
        return Err(anyhow!("unknown container format: {container_format}"));
    }
    let container_count = reader.read_u32()?;
    let mut container_sizes = Vec::with_capacity(container_count.min(64) as usize);
    for slot in 0..container_count {
        container_sizes.push(
            reader
                .read_u32()
                .with_context(|| format!("bundle section truncated at container {slot}"))?,
        );
    }

    Ok(BundleSection {
        offset,
        bundle_code,
        stub_size,
        original_checksum,
        original_signature_offset,
        original_signature_size,
        container_format,
        container_sizes,
    })
}

fn find_section_offset(image: &[u8], name: &[u8; 8]) -> Result<Option<u32>> {
    if image.get(..2) != Some(DOS_SIGNATURE.as_slice()) {
        return Err(anyhow!("image does not start with a DOS header"));
    }
    let nt_offset = read_u32_at(image, DOS_LFANEW_OFFSET)? as usize;
    if image.get(nt_offset..nt_offset + 4) != Some(NT_SIGNATURE.as_slice()) {
        return Err(anyhow!("image has no NT header at offset {nt_offset}"));
    }

    let file_header = nt_offset + 4;
    let section_count = read_u16_at(image, file_header + 2)? as usize;
    let optional_header_size = read_u16_at(image, file_header + 16)? as usize;
    let section_table = file_header + FILE_HEADER_SIZE + optional_header_size;

    for slot in 0..section_count {
        let header = section_table + slot * SECTION_HEADER_SIZE;
        let section_name = image
            .get(header..header + 8)
            .ok_or_else(|| anyhow!("section table truncated at entry {slot}"))?;
        if section_name == name.as_slice() {
            return Ok(Some(read_u32_at(image, header + 20)?));
        }
    }
    Ok(None)
}

fn read_u16_at(image: &[u8], offset: usize) -> Result<u16> {
    let raw = image
        .get(offset..offset + 2)
        .ok_or_else(|| anyhow!("image truncated reading u16 at offset {offset}"))?;
    Ok(u16::from_le_bytes([raw[0], raw[1]]))
}

fn read_u32_at(image: &[u8], offset: usize) -> Result<u32> {
    let raw = image
        .get(offset..offset + 4)
        .ok_or_else(|| anyhow!("image truncated reading u32 at offset {offset}"))?;
    Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}
