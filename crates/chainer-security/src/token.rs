use anyhow::{Context, Result};
use rand::rngs::OsRng;
use rand::RngCore;

const TOKEN_BYTES: usize = 32;
const PIPE_SUFFIX_BYTES: usize = 8;

fn random_bytes<const N: usize>() -> Result<[u8; N]> {
    let mut bytes = [0_u8; N];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed reading operating system randomness")?;
    Ok(bytes)
}

/// One-time capability handed to the elevated worker on its command line.
pub fn generate_session_token() -> Result<String> {
    Ok(hex::encode(random_bytes::<TOKEN_BYTES>()?))
}

/// Unique endpoint name for one elevation session.
pub fn generate_pipe_name(prefix: &str) -> Result<String> {
    let suffix = random_bytes::<PIPE_SUFFIX_BYTES>()?;
    Ok(format!(
        "{prefix}.{}.{}",
        std::process::id(),
        hex::encode(suffix)
    ))
}
