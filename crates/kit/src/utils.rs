use std::process::Command;

use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use itertools::Itertools;

/// Extension methods for running external commands with checked results
pub(crate) trait CommandRunExt {
    /// Run the command, capturing output; non-zero exit becomes an error
    /// carrying the tail of stderr.
    fn run_checked(&mut self) -> Result<()>;

    /// Render the command as a single shell-quoted line for logging
    fn to_string_pretty(&self) -> String;
}

impl CommandRunExt for Command {
    fn run_checked(&mut self) -> Result<()> {
        let pretty = self.to_string_pretty();
        tracing::debug!("+ {pretty}");
        let output = self
            .output()
            .wrap_err_with(|| format!("Failed to execute: {pretty}"))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // Keep errors readable; tools like xorriso are chatty on stderr
            let tail: Vec<&str> = stderr.lines().rev().take(10).collect();
            let tail: Vec<&str> = tail.into_iter().rev().collect();
            return Err(eyre!(
                "{pretty} failed with {}: {}",
                output.status,
                tail.join("\n")
            ));
        }
        Ok(())
    }

    fn to_string_pretty(&self) -> String {
        std::iter::once(self.get_program())
            .chain(self.get_args())
            .map(|a| {
                let a = a.to_string_lossy();
                shlex::try_quote(&a)
                    .map(|q| q.into_owned())
                    .unwrap_or_else(|_| a.into_owned())
            })
            .join(" ")
    }
}

/// Parse size string (e.g., "10G", "5120M", "1T") to bytes
pub(crate) fn parse_size(size_str: &str) -> Result<u64> {
    let size_str = size_str.trim().to_uppercase();

    if size_str.is_empty() {
        return Err(eyre!("Empty size string"));
    }

    let (number_part, unit_part) = if let Some(pos) = size_str.rfind(|c: char| c.is_ascii_digit()) {
        let (num, unit) = size_str.split_at(pos + 1);
        (num, unit)
    } else {
        return Err(eyre!("Invalid size format: {}", size_str));
    };

    let number: u64 = number_part
        .parse()
        .map_err(|_| eyre!("Invalid number in size: {}", number_part))?;

    let multiplier = match unit_part {
        "" | "B" => 1,
        "K" | "KB" => 1024,
        "M" | "MB" => 1024 * 1024,
        "G" | "GB" => 1024 * 1024 * 1024,
        "T" | "TB" => 1024_u64.pow(4),
        _ => return Err(eyre!("Unknown size unit: {}", unit_part)),
    };

    Ok(number * multiplier)
}

/// Parse a memory string (like "2G", "1024M", "512") to megabytes
pub(crate) fn parse_memory_to_mb(memory_str: &str) -> Result<u32> {
    let memory_str = memory_str.trim();

    if memory_str.is_empty() {
        return Err(eyre!("Memory string cannot be empty"));
    }

    // Check if it ends with a unit suffix
    if let Some(last_char) = memory_str.chars().last() {
        match last_char.to_ascii_uppercase() {
            'G' => {
                let number_part = &memory_str[..memory_str.len() - 1];
                let gb: f64 = number_part
                    .parse()
                    .context("Invalid number in memory specification")?;
                Ok((gb * 1024.0) as u32)
            }
            'M' => {
                let number_part = &memory_str[..memory_str.len() - 1];
                let mb: u32 = number_part
                    .parse()
                    .context("Invalid number in memory specification")?;
                Ok(mb)
            }
            'K' => {
                let number_part = &memory_str[..memory_str.len() - 1];
                let kb: u32 = number_part
                    .parse()
                    .context("Invalid number in memory specification")?;
                Ok(kb / 1024)
            }
            _ => {
                // No suffix, assume megabytes
                let mb: u32 = memory_str
                    .parse()
                    .context("Invalid number in memory specification")?;
                Ok(mb)
            }
        }
    } else {
        Err(eyre!("Memory specification cannot be empty - please provide a value like '2G', '1024M', or '512'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("512").unwrap(), 512);
        assert_eq!(parse_size("1K").unwrap(), 1024);
        assert_eq!(parse_size("20G").unwrap(), 20 * 1024 * 1024 * 1024);
        assert_eq!(parse_size("2 TB").unwrap(), 2 * 1024_u64.pow(4));
        assert!(parse_size("").is_err());
        assert!(parse_size("abc").is_err());
        assert!(parse_size("10X").is_err());
    }

    #[test]
    fn test_parse_memory_to_mb() {
        assert_eq!(parse_memory_to_mb("512").unwrap(), 512);
        assert_eq!(parse_memory_to_mb("1024M").unwrap(), 1024);
        assert_eq!(parse_memory_to_mb("4G").unwrap(), 4096);
        assert_eq!(parse_memory_to_mb("2048K").unwrap(), 2);
        assert!(parse_memory_to_mb("").is_err());
        assert!(parse_memory_to_mb("lots").is_err());
    }

    #[test]
    fn test_to_string_pretty() {
        let mut c = Command::new("qemu-img");
        c.args(["create", "-f", "qcow2", "disk with space.qcow2", "20G"]);
        assert_eq!(
            c.to_string_pretty(),
            "qemu-img create -f qcow2 \"disk with space.qcow2\" 20G"
        );
    }
}
