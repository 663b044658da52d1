//! Command-code to message mapping
//!
//! The command section hands its raw bytes to a [`MessageFactory`]. A
//! matching message tells the extractor how many payload bytes to read when
//! the layout carries no length field.

use std::collections::HashMap;
use std::fmt;

/// A typed message recognised from a command code.
pub trait Message: Send + fmt::Debug {
    fn name(&self) -> &str;

    fn command(&self) -> &[u8];

    /// Expected payload size in bytes.
    fn serialized_size(&self) -> usize;
}

/// Builds messages from command bytes.
pub trait MessageFactory: Send + Sync + fmt::Debug {
    /// `None` when no message type matches `command`.
    fn build_message(&self, command: &[u8]) -> Option<Box<dyn Message>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub name: String,
    pub size: usize,
}

/// Factory backed by a fixed table of command codes.
#[derive(Debug, Clone, Default)]
pub struct CommandTable {
    entries: HashMap<Vec<u8>, CommandSpec>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `code`, returning the entry it replaced.
    pub fn register(
        &mut self,
        code: impl Into<Vec<u8>>,
        name: impl Into<String>,
        size: usize,
    ) -> Option<CommandSpec> {
        self.entries.insert(
            code.into(),
            CommandSpec {
                name: name.into(),
                size,
            },
        )
    }

    pub fn get(&self, code: &[u8]) -> Option<&CommandSpec> {
        self.entries.get(code)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl MessageFactory for CommandTable {
    fn build_message(&self, command: &[u8]) -> Option<Box<dyn Message>> {
        let spec = self.entries.get(command)?;
        Some(Box::new(TableMessage {
            name: spec.name.clone(),
            command: command.to_vec(),
            size: spec.size,
        }))
    }
}

/// Message produced by [`CommandTable`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMessage {
    name: String,
    command: Vec<u8>,
    size: usize,
}

impl Message for TableMessage {
    fn name(&self) -> &str {
        &self.name
    }

    fn command(&self) -> &[u8] {
        &self.command
    }

    fn serialized_size(&self) -> usize {
        self.size
    }
}
