//! Checksum validation
//!
//! A checksum section names the sections it covers. At extraction time the
//! covered bytes are collected into [`CoveredBytes`] (in wire order) and
//! handed to the section's [`ChecksumValidator`] together with the received
//! checksum field.

use std::fmt;

use crc32fast::Hasher;
use serde::{Deserialize, Serialize};

use super::{ByteOrder, SectionKind};

/// Covered section bytes, in layout order.
#[derive(Debug, Clone, Default)]
pub struct CoveredBytes<'a> {
    parts: Vec<(SectionKind, &'a [u8])>,
}

impl<'a> CoveredBytes<'a> {
    pub fn from_parts<I>(parts: I) -> Self
    where
        I: IntoIterator<Item = (SectionKind, &'a [u8])>,
    {
        Self {
            parts: parts.into_iter().collect(),
        }
    }

    pub fn get(&self, kind: SectionKind) -> Option<&'a [u8]> {
        self.parts.iter().find(|(k, _)| *k == kind).map(|(_, b)| *b)
    }

    pub fn parts(&self) -> &[(SectionKind, &'a [u8])] {
        &self.parts
    }

    /// All covered bytes joined in wire order.
    pub fn concat(&self) -> Vec<u8> {
        let len = self.parts.iter().map(|(_, b)| b.len()).sum();
        let mut out = Vec::with_capacity(len);
        for (_, bytes) in &self.parts {
            out.extend_from_slice(bytes);
        }
        out
    }
}

/// Decides whether a received checksum field matches the covered bytes.
pub trait ChecksumValidator: Send + Sync + fmt::Debug {
    fn validate(&self, covered: &CoveredBytes<'_>, checksum: &[u8]) -> bool;

    /// Checksum field for `covered`, when the validator can produce one.
    fn compute(&self, _covered: &CoveredBytes<'_>) -> Option<Vec<u8>> {
        None
    }

    /// Width of the checksum field in bytes, if fixed by the algorithm.
    fn width(&self) -> Option<usize> {
        None
    }
}

/// Checksum algorithms shipped with the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumAlgorithm {
    /// Wrapping 8-bit sum.
    Sum8,
    /// XOR of all bytes.
    Xor8,
    /// CRC-16/CCITT-FALSE (poly 0x1021, init 0xFFFF).
    Crc16Ccitt,
    /// CRC-32 (IEEE).
    Crc32,
}

impl ChecksumAlgorithm {
    pub fn width(self) -> usize {
        match self {
            ChecksumAlgorithm::Sum8 | ChecksumAlgorithm::Xor8 => 1,
            ChecksumAlgorithm::Crc16Ccitt => 2,
            ChecksumAlgorithm::Crc32 => 4,
        }
    }

    pub fn checksum(self, data: &[u8]) -> u32 {
        match self {
            ChecksumAlgorithm::Sum8 => u32::from(data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))),
            ChecksumAlgorithm::Xor8 => u32::from(data.iter().fold(0u8, |acc, b| acc ^ b)),
            ChecksumAlgorithm::Crc16Ccitt => u32::from(crc16_ccitt(data)),
            ChecksumAlgorithm::Crc32 => {
                let mut hasher = Hasher::new();
                hasher.update(data);
                hasher.finalize()
            }
        }
    }
}

fn crc16_ccitt(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// A [`ChecksumAlgorithm`] with the byte order of its field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuiltinChecksum {
    pub algorithm: ChecksumAlgorithm,
    pub order: ByteOrder,
}

impl BuiltinChecksum {
    pub fn new(algorithm: ChecksumAlgorithm, order: ByteOrder) -> Self {
        Self { algorithm, order }
    }

    fn field(&self, data: &[u8]) -> Vec<u8> {
        let value = self.algorithm.checksum(data);
        let width = self.algorithm.width();
        match self.order {
            ByteOrder::Msb => value.to_be_bytes()[4 - width..].to_vec(),
            ByteOrder::Lsb => value.to_le_bytes()[..width].to_vec(),
        }
    }
}

impl ChecksumValidator for BuiltinChecksum {
    fn validate(&self, covered: &CoveredBytes<'_>, checksum: &[u8]) -> bool {
        self.field(&covered.concat()) == checksum
    }

    fn compute(&self, covered: &CoveredBytes<'_>) -> Option<Vec<u8>> {
        Some(self.field(&covered.concat()))
    }

    fn width(&self) -> Option<usize> {
        Some(self.algorithm.width())
    }
}
