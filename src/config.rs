//! Extractor configuration
//!
//! Parses the packet layout, command table and queue sizes from YAML.
//! Byte patterns and command codes are written as hex strings:
//!
//! ```yaml
//! ingress_capacity: 4096
//! egress_capacity: 64
//! layout:
//!   - kind: header
//!     pattern: "AA 55"
//!   - kind: length
//!     width: 2
//!     byte_order: msb
//!   - kind: command
//!     size: 1
//!   - kind: data
//!   - kind: checksum
//!     algorithm: crc32
//!     covers: [command, data]
//!   - kind: footer
//!     pattern: "0D0A"
//! commands:
//!   - code: "01"
//!     name: ping
//!     size: 3
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::extractor::{
    ExtractorOptions, DEFAULT_EGRESS_CAPACITY, DEFAULT_INGRESS_CAPACITY, DEFAULT_MAX_PAYLOAD_SIZE,
};
use crate::packet::{
    BuiltinChecksum, ByteOrder, ChecksumAlgorithm, CommandTable, PacketLayout, Section,
    SectionKind,
};

/// One layout entry, tagged by `kind`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SectionConfig {
    Header {
        pattern: String,
    },
    Length {
        width: usize,
        #[serde(default)]
        byte_order: ByteOrder,
    },
    Command {
        size: usize,
    },
    Data {
        #[serde(default)]
        size: usize,
    },
    Checksum {
        algorithm: ChecksumAlgorithm,
        covers: Vec<SectionKind>,
        #[serde(default)]
        byte_order: ByteOrder,
    },
    Footer {
        pattern: String,
    },
    Other,
}

/// One command table entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandConfig {
    pub code: String,
    pub name: String,
    /// Payload size used when the layout has no length field
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractorConfig {
    #[serde(default = "default_ingress_capacity")]
    pub ingress_capacity: usize,

    #[serde(default = "default_egress_capacity")]
    pub egress_capacity: usize,

    #[serde(default = "default_max_payload_size")]
    pub max_payload_size: usize,

    pub layout: Vec<SectionConfig>,

    #[serde(default)]
    pub commands: Vec<CommandConfig>,
}

fn default_ingress_capacity() -> usize {
    DEFAULT_INGRESS_CAPACITY
}

fn default_egress_capacity() -> usize {
    DEFAULT_EGRESS_CAPACITY
}

fn default_max_payload_size() -> usize {
    DEFAULT_MAX_PAYLOAD_SIZE
}

/// Decode a hex string, ignoring whitespace ("AA 55" == "aa55").
fn parse_hex(field: &str, value: &str) -> Result<Vec<u8>> {
    let compact: String = value.chars().filter(|c| !c.is_whitespace()).collect();
    hex::decode(&compact).with_context(|| format!("{field}: invalid hex \"{value}\""))
}

impl ExtractorConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: ExtractorConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse YAML in {}", path.display()))?;

        config.validate()?;

        tracing::info!(
            "[config] loaded {} sections={} commands={}",
            path.display(),
            config.layout.len(),
            config.commands.len()
        );
        Ok(config)
    }

    /// Parse configuration from a YAML string
    pub fn from_str(contents: &str) -> Result<Self> {
        let config: ExtractorConfig =
            serde_yaml::from_str(contents).context("Failed to parse YAML")?;

        config.validate()?;

        Ok(config)
    }

    /// Check capacities, hex fields, the command table and the layout itself
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.ingress_capacity > 0, "ingress_capacity must be non-zero");
        anyhow::ensure!(self.egress_capacity > 0, "egress_capacity must be non-zero");

        for section in &self.layout {
            if let SectionConfig::Checksum { covers, .. } = section {
                anyhow::ensure!(!covers.is_empty(), "checksum must cover at least one section");
            }
        }

        self.build_layout()?;
        Ok(())
    }

    /// Build the command table, checking codes against the command section size
    pub fn command_table(&self) -> Result<CommandTable> {
        let command_size = self.layout.iter().find_map(|s| match s {
            SectionConfig::Command { size } => Some(*size),
            _ => None,
        });

        if command_size.is_none() && !self.commands.is_empty() {
            anyhow::bail!("commands are configured but the layout has no command section");
        }

        let mut table = CommandTable::new();
        let mut seen = HashSet::new();
        for entry in &self.commands {
            let code = parse_hex("commands.code", &entry.code)?;
            if let Some(size) = command_size {
                anyhow::ensure!(
                    code.len() == size,
                    "command {} code \"{}\" is {} bytes, command section is {}",
                    entry.name,
                    entry.code,
                    code.len(),
                    size
                );
            }
            anyhow::ensure!(
                seen.insert(code.clone()),
                "duplicate command code \"{}\"",
                entry.code
            );
            table.register(code, entry.name.clone(), entry.size);
        }
        Ok(table)
    }

    /// Turn the configured sections into a validated layout
    pub fn build_layout(&self) -> Result<PacketLayout> {
        let factory = Arc::new(self.command_table()?);

        let mut sections = Vec::with_capacity(self.layout.len());
        for entry in &self.layout {
            let section = match entry {
                SectionConfig::Header { pattern } => Section::Header {
                    pattern: parse_hex("header.pattern", pattern)?,
                },
                SectionConfig::Length { width, byte_order } => Section::Length {
                    width: *width,
                    order: *byte_order,
                },
                SectionConfig::Command { size } => Section::Command {
                    size: *size,
                    factory: factory.clone(),
                },
                SectionConfig::Data { size } => Section::Data { size: *size },
                SectionConfig::Checksum {
                    algorithm,
                    covers,
                    byte_order,
                } => Section::Checksum {
                    size: algorithm.width(),
                    covers: covers.clone(),
                    validator: Arc::new(BuiltinChecksum::new(*algorithm, *byte_order)),
                },
                SectionConfig::Footer { pattern } => Section::Footer {
                    pattern: parse_hex("footer.pattern", pattern)?,
                },
                SectionConfig::Other => Section::Other,
            };
            sections.push(section);
        }

        PacketLayout::new(sections).context("Invalid packet layout")
    }

    pub fn options(&self) -> ExtractorOptions {
        ExtractorOptions {
            ingress_capacity: self.ingress_capacity,
            egress_capacity: self.egress_capacity,
            max_payload_size: self.max_payload_size,
        }
    }

    /// Save configuration to a YAML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(&self).context("Failed to serialize config to YAML")?;

        fs::write(path.as_ref(), yaml)
            .with_context(|| format!("Failed to write config to {}", path.as_ref().display()))?;

        Ok(())
    }
}
