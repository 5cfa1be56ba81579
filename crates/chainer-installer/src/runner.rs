use std::path::Path;
use std::process::Command;

use anyhow::{anyhow, Context, Result};
use tracing::debug;

/// Launches installer processes and reports their exit codes.
pub trait ProcessRunner {
    fn run(&self, program: &Path, arguments: &[String]) -> Result<u32>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcessRunner;

impl ProcessRunner for SystemProcessRunner {
    fn run(&self, program: &Path, arguments: &[String]) -> Result<u32> {
        debug!(program = %program.display(), ?arguments, "launching installer process");
        let status = Command::new(program)
            .args(arguments)
            .status()
            .with_context(|| format!("failed to launch {}", program.display()))?;
        let code = match status.code() {
            Some(code) => code as u32,
            None => {
                return Err(anyhow!(
                    "{} was terminated by a signal",
                    program.display()
                ))
            }
        };
        debug!(program = %program.display(), exit_code = code, "installer process exited");
        Ok(code)
    }
}

/// Splits a declared command line on whitespace, honouring double quotes.
pub fn split_arguments(raw: &str) -> Result<Vec<String>> {
    let mut arguments = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut pending = false;

    for ch in raw.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                pending = true;
            }
            ch if ch.is_whitespace() && !in_quotes => {
                if pending {
                    arguments.push(std::mem::take(&mut current));
                    pending = false;
                }
            }
            ch => {
                current.push(ch);
                pending = true;
            }
        }
    }
    if in_quotes {
        return Err(anyhow!("unterminated quote in arguments: {raw}"));
    }
    if pending {
        arguments.push(current);
    }
    Ok(arguments)
}
