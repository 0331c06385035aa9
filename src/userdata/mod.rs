//! Instance user-data
//!
//! Builds the first-boot shell script handed to an instance and encodes it the
//! ways the EC2 API accepts it:
//! - Plain text (wrapped in `Fn::Base64` by the template)
//! - Base64
//! - Gzip, then base64 (cloud-init decompresses it on boot)

use crate::InfraError;
use base64::Engine;
use flate2::Compression;
use flate2::write::GzEncoder;
use std::io::Write;
use tracing::debug;

/// EC2 limit on raw user-data size, in bytes
pub const MAX_USER_DATA_BYTES: usize = 16 * 1024;

/// Interpreter line for Linux user-data
pub const LINUX_SHEBANG: &str = "#!/bin/bash";

/// Output encoding for user-data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Plain,
    Base64,
    GzipBase64,
}

impl std::str::FromStr for Encoding {
    type Err = InfraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "plain" | "text" => Ok(Self::Plain),
            "base64" => Ok(Self::Base64),
            "gzip" | "gzip+base64" => Ok(Self::GzipBase64),
            other => Err(InfraError::UserData(format!("Unknown encoding '{}'", other))),
        }
    }
}

/// Ordered shell commands run once at first boot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserData {
    shebang: String,
    commands: Vec<String>,
}

impl UserData {
    /// Empty Linux user-data
    pub fn for_linux() -> Self {
        Self {
            shebang: LINUX_SHEBANG.to_string(),
            commands: Vec::new(),
        }
    }

    /// Append commands, one per line
    pub fn add_commands<I, S>(&mut self, commands: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.commands.extend(commands.into_iter().map(Into::into));
    }

    /// Append every line of a script body
    pub fn add_script(&mut self, body: &str) {
        self.add_commands(body.lines());
    }

    pub fn commands(&self) -> &[String] {
        &self.commands
    }

    /// Full script text
    pub fn render(&self) -> String {
        let mut script = String::with_capacity(
            self.shebang.len() + self.commands.iter().map(|c| c.len() + 1).sum::<usize>() + 1,
        );
        script.push_str(&self.shebang);
        for command in &self.commands {
            script.push('\n');
            script.push_str(command);
        }
        script
    }

    /// Render and check the EC2 size limit
    pub fn render_checked(&self) -> Result<String, InfraError> {
        let script = self.render();
        if script.len() > MAX_USER_DATA_BYTES {
            return Err(InfraError::UserData(format!(
                "User-data is {} bytes, limit is {}",
                script.len(),
                MAX_USER_DATA_BYTES
            )));
        }
        Ok(script)
    }

    /// Render in the requested encoding
    pub fn encode(&self, encoding: Encoding) -> Result<String, InfraError> {
        let script = self.render_checked()?;
        match encoding {
            Encoding::Plain => Ok(script),
            Encoding::Base64 => Ok(base64::engine::general_purpose::STANDARD.encode(script)),
            Encoding::GzipBase64 => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
                encoder.write_all(script.as_bytes())?;
                let compressed = encoder.finish()?;
                debug!(
                    "Compressed user-data from {} to {} bytes",
                    script.len(),
                    compressed.len()
                );
                Ok(base64::engine::general_purpose::STANDARD.encode(compressed))
            }
        }
    }
}

impl Default for UserData {
    fn default() -> Self {
        Self::for_linux()
    }
}
