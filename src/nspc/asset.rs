//! Instrument/sample interchange ("NTI")
//!
//! A JSON container carrying one instrument and its sample: table bytes,
//! loop wiring and the BRR payload in base64. Loops must be block-aligned
//! and the payload must validate as BRR.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use super::project::{BrrSample, NspcInstrument};
use crate::brr::validate_brr;
use crate::{NspcError, Result};

const NTI_FORMAT_TAG: &str = "ntrak_instrument";
const NTI_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NtiInstrumentPayload {
    id: i32,
    name: String,
    sample_index: u8,
    adsr1: u8,
    adsr2: u8,
    gain: u8,
    base_pitch_mult: u8,
    frac_pitch_mult: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NtiSamplePayload {
    id: i32,
    name: String,
    loop_enabled: bool,
    loop_offset_bytes: u32,
    data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NtiContainer {
    format: String,
    version: u32,
    instrument: NtiInstrumentPayload,
    sample: NtiSamplePayload,
}

/// One instrument bundled with its sample, as carried by an NTI container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NtiAsset {
    /// The instrument table entry
    pub instrument: NspcInstrument,
    /// The sample the entry references
    pub sample: BrrSample,
    /// Whether the sample loops
    pub loop_enabled: bool,
    /// Loop start in bytes from the sample start (block-aligned)
    pub loop_offset_bytes: u32,
}

/// Serialize an asset to NTI text.
pub fn save_nti(asset: &NtiAsset) -> Result<String> {
    if asset.loop_enabled && asset.loop_offset_bytes % 9 != 0 {
        return Err(NspcError::InvalidInput(format!(
            "Sample {} loop offset {} is not block-aligned",
            asset.sample.id, asset.loop_offset_bytes
        )));
    }
    validate_brr(&asset.sample.data, false).map_err(|e| {
        NspcError::InvalidInput(format!("Sample {}: {e}", asset.sample.id))
    })?;

    let container = NtiContainer {
        format: NTI_FORMAT_TAG.to_string(),
        version: NTI_FORMAT_VERSION,
        instrument: NtiInstrumentPayload {
            id: asset.instrument.id,
            name: asset.instrument.name.clone(),
            sample_index: asset.instrument.sample_index,
            adsr1: asset.instrument.adsr1,
            adsr2: asset.instrument.adsr2,
            gain: asset.instrument.gain,
            base_pitch_mult: asset.instrument.base_pitch_mult,
            frac_pitch_mult: asset.instrument.frac_pitch_mult,
        },
        sample: NtiSamplePayload {
            id: asset.sample.id,
            name: asset.sample.name.clone(),
            loop_enabled: asset.loop_enabled,
            loop_offset_bytes: asset.loop_offset_bytes,
            data: BASE64.encode(&asset.sample.data),
        },
    };

    serde_json::to_string_pretty(&container)
        .map_err(|e| NspcError::InvalidInput(format!("NTI serialization: {e}")))
}

/// Parse NTI text, validating the tag, version, loop alignment and BRR
/// payload.
pub fn load_nti(text: &str) -> Result<NtiAsset> {
    let container: NtiContainer = serde_json::from_str(text)
        .map_err(|e| NspcError::InvalidInput(format!("NTI parse: {e}")))?;

    if container.format != NTI_FORMAT_TAG {
        return Err(NspcError::InvalidInput(format!(
            "NTI format tag '{}' is not '{NTI_FORMAT_TAG}'",
            container.format
        )));
    }
    if container.version != NTI_FORMAT_VERSION {
        return Err(NspcError::InvalidInput(format!(
            "Unsupported NTI version {} (expected {NTI_FORMAT_VERSION})",
            container.version
        )));
    }

    let data = BASE64
        .decode(container.sample.data.as_bytes())
        .map_err(|e| NspcError::InvalidInput(format!("NTI sample data: {e}")))?;

    validate_brr(&data, false)
        .map_err(|e| NspcError::InvalidInput(format!("Sample {}: {e}", container.sample.id)))?;

    if container.sample.loop_enabled && container.sample.loop_offset_bytes % 9 != 0 {
        return Err(NspcError::InvalidInput(format!(
            "Sample {} loop offset {} is not block-aligned",
            container.sample.id, container.sample.loop_offset_bytes
        )));
    }

    Ok(NtiAsset {
        instrument: NspcInstrument {
            id: container.instrument.id,
            sample_index: container.instrument.sample_index,
            adsr1: container.instrument.adsr1,
            adsr2: container.instrument.adsr2,
            gain: container.instrument.gain,
            base_pitch_mult: container.instrument.base_pitch_mult,
            frac_pitch_mult: container.instrument.frac_pitch_mult,
            percussion_note: 0,
            original_addr: 0,
            content_origin: None,
            song_id: None,
            name: container.instrument.name,
        },
        sample: BrrSample {
            id: container.sample.id,
            data,
            original_addr: 0,
            original_loop_addr: 0,
            content_origin: None,
            name: container.sample.name,
        },
        loop_enabled: container.sample.loop_enabled,
        loop_offset_bytes: container.sample.loop_offset_bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn asset() -> NtiAsset {
        let mut data = vec![0u8; 18];
        data[0] = 0x42; // shift 4, loop
        data[9] = 0x43; // end + loop
        NtiAsset {
            instrument: NspcInstrument {
                id: 7,
                sample_index: 3,
                adsr1: 0x8F,
                adsr2: 0xE0,
                gain: 0x7F,
                base_pitch_mult: 1,
                frac_pitch_mult: 0x80,
                name: "Strings".into(),
                ..Default::default()
            },
            sample: BrrSample {
                id: 3,
                data,
                name: "Strings sample".into(),
                ..Default::default()
            },
            loop_enabled: true,
            loop_offset_bytes: 9,
        }
    }

    #[test]
    fn test_round_trip() {
        let original = asset();
        let text = save_nti(&original).unwrap();
        let loaded = load_nti(&text).unwrap();
        assert_eq!(loaded.instrument.adsr1, 0x8F);
        assert_eq!(loaded.sample.data, original.sample.data);
        assert_eq!(loaded.loop_offset_bytes, 9);
        assert!(loaded.loop_enabled);
    }

    #[test]
    fn test_misaligned_loop_rejected() {
        let mut bad = asset();
        bad.loop_offset_bytes = 5;
        assert!(save_nti(&bad).is_err());
    }

    #[test]
    fn test_wrong_tag_rejected() {
        let text = save_nti(&asset()).unwrap().replace(NTI_FORMAT_TAG, "other");
        assert!(load_nti(&text).is_err());
    }

    #[test]
    fn test_invalid_brr_rejected() {
        let mut bad = asset();
        bad.sample.data[9] = 0x41; // second block claims end... first lacks it
        bad.sample.data[0] = 0x41; // end flag in first of two blocks
        assert!(save_nti(&bad).is_err());
    }
}
