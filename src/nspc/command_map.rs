//! Per-engine command map
//!
//! Five contiguous byte ranges partition the track opcode space, plus two
//! opcode bijections between raw bytes and canonical vcmd ids. Either map
//! may be declared strict, in which case an unmapped id fails the whole
//! operation instead of falling through to identity.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Opcode-space partition and vcmd translation for one engine flavor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CommandMap {
    /// First note byte
    pub note_start: u8,
    /// Last note byte
    pub note_end: u8,
    /// Tie byte
    pub tie: u8,
    /// First rest byte
    pub rest_start: u8,
    /// Last rest byte
    pub rest_end: u8,
    /// Canonical byte written for a rest
    pub rest_write: u8,
    /// First percussion byte
    pub percussion_start: u8,
    /// Last percussion byte
    pub percussion_end: u8,
    /// First vcmd byte
    pub vcmd_start: u8,
    /// Raw byte -> canonical vcmd id
    pub read_vcmd_map: BTreeMap<u8, u8>,
    /// Canonical vcmd id -> raw byte
    pub write_vcmd_map: BTreeMap<u8, u8>,
    /// Fail on raw bytes absent from the read map
    pub strict_read_vcmd_map: bool,
    /// Fail on canonical ids absent from the write map
    pub strict_write_vcmd_map: bool,
}

impl Default for CommandMap {
    /// The stock N-SPC partition: notes $80-$C5, tie $C6, rest $C7,
    /// percussion $CA-$DF, vcmds from $E0.
    fn default() -> Self {
        CommandMap {
            note_start: 0x80,
            note_end: 0xC5,
            tie: 0xC6,
            rest_start: 0xC7,
            rest_end: 0xC7,
            rest_write: 0xC7,
            percussion_start: 0xCA,
            percussion_end: 0xDF,
            vcmd_start: 0xE0,
            read_vcmd_map: BTreeMap::new(),
            write_vcmd_map: BTreeMap::new(),
            strict_read_vcmd_map: false,
            strict_write_vcmd_map: false,
        }
    }
}

impl CommandMap {
    /// Translate a raw opcode byte into its canonical vcmd id.
    ///
    /// Returns `None` below the vcmd range, or when a non-empty strict read
    /// map has no entry for the byte. An empty or non-strict map falls
    /// through to identity.
    pub fn map_read_vcmd(&self, raw: u8) -> Option<u8> {
        if raw < self.vcmd_start {
            return None;
        }
        if let Some(&mapped) = self.read_vcmd_map.get(&raw) {
            return Some(mapped);
        }
        if self.strict_read_vcmd_map && !self.read_vcmd_map.is_empty() {
            return None;
        }
        Some(raw)
    }

    /// Translate a canonical vcmd id into the raw byte to emit.
    ///
    /// Returns `None` only when a strict write map misses the id.
    pub fn map_write_vcmd(&self, canonical: u8) -> Option<u8> {
        if let Some(&mapped) = self.write_vcmd_map.get(&canonical) {
            return Some(mapped);
        }
        if self.strict_write_vcmd_map {
            return None;
        }
        Some(canonical)
    }

    /// Largest note pitch representable in this map's note range.
    pub fn note_max(&self) -> u8 {
        self.note_end.saturating_sub(self.note_start)
    }

    /// Largest percussion index representable in this map's range.
    pub fn percussion_max(&self) -> u8 {
        self.percussion_end.saturating_sub(self.percussion_start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_partition_is_contiguous() {
        let map = CommandMap::default();
        assert_eq!(map.note_max(), 0x45);
        assert_eq!(map.percussion_max(), 0x15);
        assert!(map.note_end < map.tie);
        assert!(map.tie < map.rest_start);
        assert!(map.percussion_end < map.vcmd_start);
    }

    #[test]
    fn test_identity_fallthrough() {
        let map = CommandMap::default();
        assert_eq!(map.map_read_vcmd(0xE5), Some(0xE5));
        assert_eq!(map.map_write_vcmd(0xE5), Some(0xE5));
        assert_eq!(map.map_read_vcmd(0x80), None);
    }

    #[test]
    fn test_strict_read_map_rejects_unmapped() {
        let mut map = CommandMap::default();
        map.read_vcmd_map.insert(0xE0, 0xE0);
        map.strict_read_vcmd_map = true;
        assert_eq!(map.map_read_vcmd(0xE0), Some(0xE0));
        assert_eq!(map.map_read_vcmd(0xE1), None);
    }

    #[test]
    fn test_strict_read_map_needs_entries_to_bite() {
        let mut map = CommandMap::default();
        map.strict_read_vcmd_map = true;
        // an empty strict map still falls through
        assert_eq!(map.map_read_vcmd(0xE1), Some(0xE1));
    }

    #[test]
    fn test_write_map_translation() {
        let mut map = CommandMap::default();
        map.write_vcmd_map.insert(0xE0, 0xDA);
        map.write_vcmd_map.insert(0xF9, 0xDD);
        assert_eq!(map.map_write_vcmd(0xE0), Some(0xDA));
        assert_eq!(map.map_write_vcmd(0xF9), Some(0xDD));
        assert_eq!(map.map_write_vcmd(0xE1), Some(0xE1));
        map.strict_write_vcmd_map = true;
        assert_eq!(map.map_write_vcmd(0xE1), None);
    }
}
