//! Engine descriptor
//!
//! Where a driver keeps its tables in ARAM, which regions it reserves, how
//! big its table entries are, and which extension commands are patched in.
//! Descriptors merge with user override files keyed by engine id or name.

use serde::{Deserialize, Serialize};

use super::command_map::CommandMap;
use crate::{NspcError, Result};

/// A reserved ARAM range `[from, to)` the planner must never allocate over.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReservedRegion {
    /// Inclusive start
    pub from: u16,
    /// Exclusive end
    pub to: u16,
    /// Label shown in usage reports
    pub name: String,
}

/// One extension command added by an engine patch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExtensionVcmd {
    /// Raw command id the engine dispatches on
    pub id: u8,
    /// Parameter byte count, clamped to 4
    pub param_count: u8,
}

/// Bytes an extension overlays onto ARAM when enabled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EnginePatch {
    /// Label shown in upload chunk lists
    pub name: String,
    /// Target ARAM address
    pub address: u16,
    /// Patch bytes
    pub bytes: Vec<u8>,
}

/// An optional engine extension: commands plus the patches enabling them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineExtension {
    /// Extension name (unique per engine)
    pub name: String,
    /// Whether the extension is active for this project
    pub enabled: bool,
    /// Commands the extension adds
    pub vcmds: Vec<ExtensionVcmd>,
    /// Patch bytes overlaid when enabled
    pub patches: Vec<EnginePatch>,
}

/// Descriptor of one N-SPC-family engine build.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Stable engine id
    pub id: String,
    /// Display name
    pub name: String,
    /// Engine version string ("0.0" marks the SMW variant with 7-byte
    /// percussion entries)
    pub engine_version: String,
    /// Engine variant tag (e.g. "addmusick")
    pub engine_variant: String,

    /// Driver entry point
    pub entry_point: u16,
    /// Song index pointer table, 0 when absent
    pub song_index_pointers: u16,
    /// Instrument table, 0 when absent
    pub instrument_headers: u16,
    /// Percussion table, 0 when absent
    pub percussion_headers: u16,
    /// Sample directory, 0 when absent
    pub sample_headers: u16,

    /// Instrument entry size in bytes (5 or 6)
    pub instrument_entry_bytes: u8,
    /// Percussion entry size in bytes (6 or 7)
    pub percussion_entry_bytes: u8,

    /// Regions the planner must leave alone
    pub reserved: Vec<ReservedRegion>,
    /// Echo buffer end address (the hardware buffer grows down from it)
    pub echo_buffer: u16,
    /// Echo buffer length in bytes
    pub echo_buffer_len: u16,

    /// Track-stream command map; `None` uses the stock N-SPC map
    pub command_map: Option<CommandMap>,
    /// Optional extension command sets
    pub extensions: Vec<EngineExtension>,
    /// First per-song custom instrument index, for engines whose top of the
    /// instrument table is song-owned
    pub custom_instrument_start_index: Option<u8>,

    /// Raw engine image; used as the reserved region when none is declared
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub engine_bytes: Vec<u8>,

    /// Songs the engine itself ships (content-origin defaults)
    pub default_engine_provided_song_ids: Vec<i32>,
    /// Whether the song id list above is authoritative
    pub has_default_engine_provided_songs: bool,
    /// Instruments the engine itself ships
    pub default_engine_provided_instrument_ids: Vec<i32>,
    /// Whether the instrument id list above is authoritative
    pub has_default_engine_provided_instruments: bool,
    /// Samples the engine itself ships
    pub default_engine_provided_sample_ids: Vec<i32>,
    /// Whether the sample id list above is authoritative
    pub has_default_engine_provided_samples: bool,
}

impl EngineConfig {
    /// The engine's command map, or the stock one.
    pub fn command_map_or_default(&self) -> CommandMap {
        self.command_map.clone().unwrap_or_default()
    }

    /// Instrument entry size clamped to the legal 5..=6 range.
    pub fn instrument_entry_size(&self) -> u8 {
        self.instrument_entry_bytes.clamp(5, 6)
    }

    /// Percussion entry size clamped to the legal 6..=7 range.
    pub fn percussion_entry_size(&self) -> u8 {
        self.percussion_entry_bytes.clamp(6, 7)
    }

    /// True for the SMW "v0.0" engine family.
    pub fn is_smw_v00(&self) -> bool {
        self.engine_version == "0.0"
    }

    /// Parameter count of an extension command, searching enabled
    /// extensions only when `enabled_only` is set. Counts clamp to 4.
    pub fn extension_vcmd_param_count(&self, id: u8, enabled_only: bool) -> Option<u8> {
        for extension in &self.extensions {
            if enabled_only && !extension.enabled {
                continue;
            }
            for vcmd in &extension.vcmds {
                if vcmd.id == id {
                    return Some(vcmd.param_count.min(4));
                }
            }
        }
        None
    }

    /// Enable or disable an extension by name.
    pub fn set_extension_enabled(&mut self, name: &str, enabled: bool) -> bool {
        for extension in &mut self.extensions {
            if extension.name == name {
                extension.enabled = enabled;
                return true;
            }
        }
        false
    }

    /// Merge an override file (JSON keyed by engine id or name) over this
    /// descriptor. Scalar fields replace; extensions merge by name.
    pub fn apply_overrides(&mut self, overrides_json: &str) -> Result<bool> {
        let root: serde_json::Value = serde_json::from_str(overrides_json)
            .map_err(|e| NspcError::InvalidInput(format!("Engine override file: {e}")))?;
        let map = root.as_object().ok_or_else(|| {
            NspcError::InvalidInput("Engine override file must be a JSON object".into())
        })?;

        let entry = map
            .get(&self.id)
            .or_else(|| map.get(&self.name))
            .and_then(|v| v.as_object());
        let Some(entry) = entry else {
            return Ok(false);
        };

        let mut base = serde_json::to_value(&*self)
            .map_err(|e| NspcError::InvalidInput(format!("Engine config serialization: {e}")))?;
        if let Some(base_map) = base.as_object_mut() {
            for (key, value) in entry {
                if key == "extensions" {
                    continue;
                }
                base_map.insert(key.clone(), value.clone());
            }
        }

        let mut merged: EngineConfig = serde_json::from_value(base)
            .map_err(|e| NspcError::InvalidInput(format!("Engine override file: {e}")))?;

        if let Some(extensions) = entry.get("extensions").and_then(|v| v.as_array()) {
            for value in extensions {
                let incoming: EngineExtension = serde_json::from_value(value.clone())
                    .map_err(|e| NspcError::InvalidInput(format!("Engine override extension: {e}")))?;
                match merged
                    .extensions
                    .iter_mut()
                    .find(|existing| existing.name == incoming.name)
                {
                    Some(existing) => *existing = incoming,
                    None => merged.extensions.push(incoming),
                }
            }
        }

        *self = merged;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_with_extension(enabled: bool) -> EngineConfig {
        EngineConfig {
            id: "nspc-test".into(),
            name: "Test Engine".into(),
            extensions: vec![EngineExtension {
                name: "extra".into(),
                enabled,
                vcmds: vec![ExtensionVcmd {
                    id: 0xFB,
                    param_count: 2,
                }],
                patches: vec![],
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_extension_param_lookup_honors_enabled_flag() {
        let engine = engine_with_extension(false);
        assert_eq!(engine.extension_vcmd_param_count(0xFB, true), None);
        assert_eq!(engine.extension_vcmd_param_count(0xFB, false), Some(2));
        let engine = engine_with_extension(true);
        assert_eq!(engine.extension_vcmd_param_count(0xFB, true), Some(2));
    }

    #[test]
    fn test_extension_param_count_clamps_to_four() {
        let mut engine = engine_with_extension(true);
        engine.extensions[0].vcmds[0].param_count = 9;
        assert_eq!(engine.extension_vcmd_param_count(0xFB, true), Some(4));
    }

    #[test]
    fn test_entry_sizes_clamp() {
        let engine = EngineConfig {
            instrument_entry_bytes: 9,
            percussion_entry_bytes: 1,
            ..Default::default()
        };
        assert_eq!(engine.instrument_entry_size(), 6);
        assert_eq!(engine.percussion_entry_size(), 6);
    }

    #[test]
    fn test_overrides_merge_by_id_and_name() {
        let mut engine = engine_with_extension(false);
        engine.entry_point = 0x0500;

        let overrides = r#"{
            "Test Engine": {
                "entryPoint": 1536,
                "extensions": [
                    { "name": "extra", "enabled": true,
                      "vcmds": [{ "id": 251, "paramCount": 3 }] },
                    { "name": "hooks", "enabled": true,
                      "patches": [{ "name": "init", "address": 512, "bytes": [1, 2] }] }
                ]
            }
        }"#;

        assert!(engine.apply_overrides(overrides).unwrap());
        assert_eq!(engine.entry_point, 0x0600);
        assert_eq!(engine.extensions.len(), 2);
        assert!(engine.extensions[0].enabled);
        assert_eq!(engine.extensions[0].vcmds[0].param_count, 3);
        assert_eq!(engine.extensions[1].patches[0].bytes, vec![1, 2]);
    }

    #[test]
    fn test_overrides_for_other_engine_are_ignored() {
        let mut engine = engine_with_extension(false);
        let untouched = engine.clone();
        assert!(!engine.apply_overrides(r#"{ "someone-else": { "entryPoint": 4 } }"#).unwrap());
        assert_eq!(engine, untouched);
    }

    #[test]
    fn test_overrides_reject_malformed_json() {
        let mut engine = engine_with_extension(false);
        assert!(engine.apply_overrides("not json").is_err());
    }
}
