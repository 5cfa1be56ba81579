//! Little-endian binary codec shared by the elevation protocol, the elevated
//! plan and the state file.
//!
//! Every integer is written little-endian regardless of host. Strings are a
//! `u32` count of UTF-16 code units followed by the units. Byte streams are a
//! `u32` length followed by the bytes.

use anyhow::{anyhow, Context, Result};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BufferWriter {
    bytes: Vec<u8>,
}

impl BufferWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_u64(&mut self, value: u64) -> &mut Self {
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_bool(&mut self, value: bool) -> &mut Self {
        self.write_u32(u32::from(value))
    }

    pub fn write_string(&mut self, value: &str) -> &mut Self {
        let units = value.encode_utf16().collect::<Vec<_>>();
        self.write_u32(units.len() as u32);
        for unit in units {
            self.bytes.extend_from_slice(&unit.to_le_bytes());
        }
        self
    }

    pub fn write_bytes(&mut self, value: &[u8]) -> &mut Self {
        self.write_u32(value.len() as u32);
        self.bytes.extend_from_slice(value);
        self
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

#[derive(Debug, Clone)]
pub struct BufferReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> BufferReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, count: usize, what: &str) -> Result<&'a [u8]> {
        if self.remaining() < count {
            return Err(anyhow!(
                "buffer truncated reading {what}: need {count} bytes at offset {}, {} available",
                self.offset,
                self.remaining()
            ));
        }
        let slice = &self.data[self.offset..self.offset + count];
        self.offset += count;
        Ok(slice)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let raw = self.take(4, "u32")?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let raw = self.take(8, "u64")?;
        let mut array = [0_u8; 8];
        array.copy_from_slice(raw);
        Ok(u64::from_le_bytes(array))
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_u32()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(anyhow!("invalid boolean value in buffer: {other}")),
        }
    }

    pub fn read_string(&mut self) -> Result<String> {
        let count = self.read_u32()? as usize;
        let byte_count = count
            .checked_mul(2)
            .ok_or_else(|| anyhow!("string length overflows buffer: {count}"))?;
        let raw = self.take(byte_count, "string")?;
        let units = raw
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect::<Vec<_>>();
        String::from_utf16(&units).context("buffer string is not valid UTF-16")
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let count = self.read_u32()? as usize;
        Ok(self.take(count, "byte stream")?.to_vec())
    }

    pub fn read_fixed<const N: usize>(&mut self) -> Result<[u8; N]> {
        let raw = self.take(N, "fixed-width field")?;
        let mut array = [0_u8; N];
        array.copy_from_slice(raw);
        Ok(array)
    }
}
