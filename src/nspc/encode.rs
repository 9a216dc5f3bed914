//! Song serialization
//!
//! The inverse of disassembly: events, sequences and pattern tables back to
//! engine bytes. Values outside their legal ranges clamp with a warning;
//! strict write-map misses fail the whole encode.

use std::collections::HashMap;

use super::engine::EngineConfig;
use super::event::{EventEntry, NspcEvent, Vcmd};
use super::song::SequenceOp;
use crate::{NspcError, Result};

pub(crate) fn append_u16(out: &mut Vec<u8>, value: u16) {
    out.push(value as u8);
    out.push((value >> 8) as u8);
}

fn map_vcmd_id(id: u8, engine: &EngineConfig) -> Result<u8> {
    let map = engine.command_map_or_default();
    map.map_write_vcmd(id).ok_or_else(|| {
        NspcError::StrictMappingMiss(format!(
            "Vcmd ${:02X} is not mapped for engine '{}'",
            id,
            if engine.name.is_empty() {
                "unknown"
            } else {
                &engine.name
            }
        ))
    })
}

fn encode_vcmd(
    vcmd: &Vcmd,
    out: &mut Vec<u8>,
    subroutine_addr_by_id: &HashMap<i32, u16>,
    warnings: &mut Vec<String>,
    engine: &EngineConfig,
) -> Result<()> {
    if let Vcmd::Extension {
        id,
        param_count,
        params,
    } = vcmd
    {
        let declared = engine.extension_vcmd_param_count(*id, true).ok_or_else(|| {
            NspcError::InvalidInput(format!(
                "Extension vcmd ${:02X} is not enabled for engine '{}'",
                id,
                if engine.name.is_empty() {
                    "unknown"
                } else {
                    &engine.name
                }
            ))
        })?;
        if *param_count != declared {
            return Err(NspcError::InvalidInput(format!(
                "Extension vcmd ${id:02X} expected {declared} params, got {param_count}"
            )));
        }
        out.push(map_vcmd_id(*id, engine)?);
        out.extend_from_slice(&params[..usize::from(*param_count)]);
        return Ok(());
    }

    out.push(map_vcmd_id(vcmd.canonical_id(), engine)?);

    match vcmd {
        Vcmd::Inst { instrument } => out.push(*instrument),
        Vcmd::Panning { panning } => out.push(*panning),
        Vcmd::PanFade { time, target }
        | Vcmd::GlobalVolumeFade { time, target }
        | Vcmd::VolumeFade { time, target }
        | Vcmd::TempoFade { time, target } => {
            out.push(*time);
            out.push(*target);
        }
        Vcmd::VibratoOn { delay, rate, depth } | Vcmd::TremoloOn { delay, rate, depth } => {
            out.push(*delay);
            out.push(*rate);
            out.push(*depth);
        }
        Vcmd::GlobalVolume { volume } | Vcmd::Volume { volume } => out.push(*volume),
        Vcmd::Tempo { tempo } => out.push(*tempo),
        Vcmd::GlobalTranspose { semitones }
        | Vcmd::VoiceTranspose { semitones }
        | Vcmd::FineTune { semitones } => out.push(*semitones as u8),
        Vcmd::SubroutineCall {
            sub_id,
            original_addr,
            count,
        } => {
            let mut addr = *original_addr;
            match subroutine_addr_by_id.get(sub_id) {
                Some(&resolved) => addr = resolved,
                None => warnings.push(format!(
                    "Subroutine id {sub_id} not found; using original address ${original_addr:04X}"
                )),
            }
            append_u16(out, addr);
            out.push(*count);
        }
        Vcmd::VibratoFadeIn { time } => out.push(*time),
        Vcmd::PitchEnvelopeTo {
            delay,
            length,
            semitone,
        }
        | Vcmd::PitchEnvelopeFrom {
            delay,
            length,
            semitone,
        } => {
            out.push(*delay);
            out.push(*length);
            out.push(*semitone);
        }
        Vcmd::EchoOn {
            channels,
            left,
            right,
        } => {
            out.push(*channels);
            out.push(*left);
            out.push(*right);
        }
        Vcmd::EchoParams {
            delay,
            feedback,
            fir_index,
        } => {
            out.push(*delay);
            out.push(*feedback);
            out.push(*fir_index);
        }
        Vcmd::EchoVolumeFade {
            time,
            left_target,
            right_target,
        } => {
            out.push(*time);
            out.push(*left_target);
            out.push(*right_target);
        }
        Vcmd::PitchSlideToNote {
            delay,
            length,
            note,
        } => {
            out.push(*delay);
            out.push(*length);
            out.push(*note);
        }
        Vcmd::PercussionBase { index } => out.push(*index),
        Vcmd::Nop { bytes } => append_u16(out, *bytes),
        Vcmd::VibratoOff
        | Vcmd::TremoloOff
        | Vcmd::PitchEnvelopeOff
        | Vcmd::EchoOff
        | Vcmd::MuteChannel
        | Vcmd::FastForwardOn
        | Vcmd::FastForwardOff
        | Vcmd::Unused => {}
        Vcmd::Extension { .. } => unreachable!("handled above"),
    }

    Ok(())
}

/// Encode an event stream into engine bytes. Subroutine calls resolve
/// through `subroutine_addr_by_id`; clamped values surface as warnings.
pub fn encode_event_stream(
    events: &[EventEntry],
    subroutine_addr_by_id: &HashMap<i32, u16>,
    warnings: &mut Vec<String>,
    engine: &EngineConfig,
) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(events.len() * 2);
    let map = engine.command_map_or_default();
    let note_max = map.note_max();
    let percussion_max = map.percussion_max();

    for entry in events {
        match &entry.event {
            NspcEvent::Duration {
                ticks,
                quantization,
                velocity,
            } => {
                let mut ticks = *ticks;
                if ticks == 0 {
                    ticks = 1;
                    warnings.push("Duration tick of 0 encountered; clamped to 1".into());
                }
                out.push(ticks);
                if quantization.is_some() || velocity.is_some() {
                    let quant = quantization.unwrap_or(0) & 0x07;
                    let vel = velocity.unwrap_or(0) & 0x0F;
                    out.push((quant << 4) | vel);
                }
            }
            NspcEvent::Vcmd(vcmd) => {
                encode_vcmd(vcmd, &mut out, subroutine_addr_by_id, warnings, engine)?;
            }
            NspcEvent::Note { pitch } => {
                let mut pitch = *pitch;
                if pitch > 0x47 {
                    warnings.push(format!("Note pitch {pitch:02X} out of range; clamped to 47"));
                    pitch = 0x47;
                }
                if pitch > note_max {
                    warnings.push(format!(
                        "Note pitch {pitch:02X} exceeds engine note range; clamped to {note_max:02X}"
                    ));
                    pitch = note_max;
                }
                out.push(map.note_start.wrapping_add(pitch));
            }
            NspcEvent::Tie => out.push(map.tie),
            NspcEvent::Rest => out.push(map.rest_write),
            NspcEvent::Percussion { index } => {
                let mut index = *index;
                if index > 0x15 {
                    warnings.push(format!(
                        "Percussion index {index:02X} out of range; clamped to 15"
                    ));
                    index = 0x15;
                }
                if index > percussion_max {
                    warnings.push(format!(
                        "Percussion index {index:02X} exceeds engine range; clamped to {percussion_max:02X}"
                    ));
                    index = percussion_max;
                }
                out.push(map.percussion_start.wrapping_add(index));
            }
            NspcEvent::Subroutine { id, original_addr } => {
                warnings.push(format!(
                    "Standalone subroutine annotation id {id} at ${original_addr:04X} ignored during encode"
                ));
            }
            NspcEvent::End => out.push(0x00),
        }
    }

    Ok(out)
}

/// Total encoded size of a stream, floored at one byte (an empty stream is
/// forced to a single End).
pub fn stream_size(events: &[EventEntry]) -> u32 {
    events
        .iter()
        .map(|entry| entry.event.encoded_size())
        .sum::<u32>()
        .max(1)
}

/// Byte offsets of each sequence op plus the total size.
pub fn sequence_offsets(sequence: &[SequenceOp]) -> (Vec<u32>, u32) {
    let mut offsets = Vec::with_capacity(sequence.len());
    let mut running = 0u32;
    for op in sequence {
        offsets.push(running);
        running += op.encoded_size();
    }
    (offsets, running)
}

/// Encode a sequence program against its final base address; jump targets
/// carrying a resolved index re-anchor to `sequence_addr + offset`.
pub fn encode_sequence(
    sequence: &[SequenceOp],
    sequence_addr: u16,
    pattern_addr_by_id: &HashMap<i32, u16>,
    warnings: &mut Vec<String>,
) -> Vec<u8> {
    let (offsets, total) = sequence_offsets(sequence);
    let mut out = Vec::with_capacity(total as usize);

    let resolve_target = |target: &super::song::SequenceTarget, warnings: &mut Vec<String>| {
        let mut addr = target.addr;
        if let Some(index) = target.index {
            if index >= 0 && (index as usize) < offsets.len() {
                addr = sequence_addr.wrapping_add(offsets[index as usize] as u16);
            } else {
                warnings.push(format!(
                    "Jump target index {index} is out of sequence range; using stored address ${addr:04X}"
                ));
            }
        }
        addr
    };

    for op in sequence {
        match op {
            SequenceOp::PlayPattern {
                pattern_id,
                track_table_addr,
            } => {
                let mut addr = *track_table_addr;
                match pattern_addr_by_id.get(pattern_id) {
                    Some(&resolved) => addr = resolved,
                    None if addr == 0 => warnings.push(format!(
                        "Sequence PlayPattern id {pattern_id} has no track table address; writing null"
                    )),
                    None => warnings.push(format!(
                        "Sequence PlayPattern id {pattern_id} missing from pattern list; using stored address ${addr:04X}"
                    )),
                }
                append_u16(&mut out, addr);
            }
            SequenceOp::JumpTimes { count, target } => {
                append_u16(&mut out, u16::from((*count).clamp(1, 0x7F)));
                let addr = resolve_target(target, warnings);
                append_u16(&mut out, addr);
            }
            SequenceOp::AlwaysJump { opcode, target } => {
                append_u16(&mut out, u16::from((*opcode).max(0x82)));
                let addr = resolve_target(target, warnings);
                append_u16(&mut out, addr);
            }
            SequenceOp::FastForwardOn => append_u16(&mut out, 0x0080),
            SequenceOp::FastForwardOff => append_u16(&mut out, 0x0081),
            SequenceOp::EndSequence => append_u16(&mut out, 0x0000),
        }
    }

    if out.is_empty() {
        out.push(0x00);
        warnings.push("Sequence encoded to 0 bytes; inserted End marker".into());
    }

    out
}

/// Encode one pattern as its 16-byte track-pointer table.
pub fn encode_pattern(
    channel_track_ids: &[i32; 8],
    track_addr_by_id: &HashMap<i32, u16>,
    pattern_id: i32,
    warnings: &mut Vec<String>,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    for &track_id in channel_track_ids {
        let mut addr = 0u16;
        if track_id >= 0 {
            match track_addr_by_id.get(&track_id) {
                Some(&resolved) => addr = resolved,
                None => warnings.push(format!(
                    "Pattern {pattern_id} references missing track id {track_id}; writing null pointer"
                )),
            }
        }
        append_u16(&mut out, addr);
    }
    out
}

// ---- pointer masks (round-trip comparison ignores relocated bytes) ----

/// Mask of the sequence bytes that hold jump-target pointers.
pub fn sequence_pointer_mask(sequence: &[SequenceOp], encoded_size: usize) -> Vec<u8> {
    let mut mask = vec![0u8; encoded_size];
    let mut offset = 0usize;

    for op in sequence {
        match op {
            SequenceOp::PlayPattern { .. } => {
                if offset + 1 < mask.len() {
                    mask[offset] = 1;
                    mask[offset + 1] = 1;
                }
                offset += 2;
            }
            SequenceOp::JumpTimes { .. } | SequenceOp::AlwaysJump { .. } => {
                if offset + 3 < mask.len() {
                    mask[offset + 2] = 1;
                    mask[offset + 3] = 1;
                }
                offset += 4;
            }
            _ => offset += 2,
        }
    }

    mask
}

/// Mask for a pattern table: every byte is a pointer.
pub fn pattern_pointer_mask(size: usize) -> Vec<u8> {
    vec![1u8; size]
}

/// Mask of the stream bytes holding subroutine-call addresses.
pub fn stream_pointer_mask(events: &[EventEntry], encoded_size: usize) -> Vec<u8> {
    let mut mask = vec![0u8; encoded_size];
    let mut offset = 0usize;

    for entry in events {
        if let NspcEvent::Vcmd(Vcmd::SubroutineCall { .. }) = &entry.event {
            if offset + 2 < mask.len() {
                mask[offset + 1] = 1;
                mask[offset + 2] = 1;
            }
        }
        offset += entry.event.encoded_size() as usize;
    }

    mask
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nspc::song::SequenceTarget;

    fn entry(event: NspcEvent) -> EventEntry {
        EventEntry {
            id: 0,
            event,
            original_addr: None,
        }
    }

    #[test]
    fn test_rest_canonicalizes_to_rest_write() {
        let mut engine = EngineConfig::default();
        let mut map = crate::nspc::CommandMap {
            rest_start: 0xC7,
            rest_end: 0xC9,
            rest_write: 0xC8,
            ..Default::default()
        };
        map.percussion_start = 0xCA;
        engine.command_map = Some(map);

        let mut warnings = Vec::new();
        let bytes =
            encode_event_stream(&[entry(NspcEvent::Rest)], &HashMap::new(), &mut warnings, &engine)
                .unwrap();
        assert_eq!(bytes, vec![0xC8]);
    }

    #[test]
    fn test_note_clamps_with_warning() {
        let engine = EngineConfig::default();
        let mut warnings = Vec::new();
        let bytes = encode_event_stream(
            &[entry(NspcEvent::Note { pitch: 0x60 })],
            &HashMap::new(),
            &mut warnings,
            &engine,
        )
        .unwrap();
        // clamped to 0x47 then to the map's note range (0x45)
        assert_eq!(bytes, vec![0x80 + 0x45]);
        assert_eq!(warnings.len(), 2);
    }

    #[test]
    fn test_subroutine_call_uses_resolved_address() {
        let engine = EngineConfig::default();
        let mut addr_by_id = HashMap::new();
        addr_by_id.insert(3, 0x1234u16);
        let mut warnings = Vec::new();
        let bytes = encode_event_stream(
            &[entry(NspcEvent::Vcmd(Vcmd::SubroutineCall {
                sub_id: 3,
                original_addr: 0x9999,
                count: 5,
            }))],
            &addr_by_id,
            &mut warnings,
            &engine,
        )
        .unwrap();
        assert_eq!(bytes, vec![0xEF, 0x34, 0x12, 0x05]);
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_strict_write_map_fails_encode() {
        let mut engine = EngineConfig::default();
        let mut map = crate::nspc::CommandMap::default();
        map.write_vcmd_map.insert(0xE0, 0xDA);
        map.strict_write_vcmd_map = true;
        engine.command_map = Some(map);

        let mut warnings = Vec::new();
        let err = encode_event_stream(
            &[entry(NspcEvent::Vcmd(Vcmd::Tempo { tempo: 0x20 }))],
            &HashMap::new(),
            &mut warnings,
            &engine,
        )
        .unwrap_err();
        assert!(matches!(err, NspcError::StrictMappingMiss(_)));
    }

    #[test]
    fn test_sequence_targets_reanchor_to_offsets() {
        let sequence = vec![
            SequenceOp::PlayPattern {
                pattern_id: 0,
                track_table_addr: 0,
            },
            SequenceOp::JumpTimes {
                count: 2,
                target: SequenceTarget {
                    index: Some(0),
                    addr: 0xDEAD,
                },
            },
            SequenceOp::EndSequence,
        ];
        let mut patterns = HashMap::new();
        patterns.insert(0, 0x1100u16);
        let mut warnings = Vec::new();
        let bytes = encode_sequence(&sequence, 0x2000, &patterns, &mut warnings);
        assert_eq!(
            bytes,
            vec![0x00, 0x11, 0x02, 0x00, 0x00, 0x20, 0x00, 0x00]
        );
    }

    #[test]
    fn test_pattern_missing_channel_writes_null() {
        let mut warnings = Vec::new();
        let mut addr_by_id = HashMap::new();
        addr_by_id.insert(0, 0x4000u16);
        let bytes = encode_pattern(
            &[0, -1, -1, -1, -1, -1, -1, -1],
            &addr_by_id,
            0,
            &mut warnings,
        );
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[0..2], &[0x00, 0x40]);
        assert!(bytes[2..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_stream_pointer_mask_marks_call_addresses() {
        let events = vec![
            entry(NspcEvent::Duration {
                ticks: 8,
                quantization: None,
                velocity: None,
            }),
            entry(NspcEvent::Vcmd(Vcmd::SubroutineCall {
                sub_id: 0,
                original_addr: 0,
                count: 1,
            })),
            entry(NspcEvent::End),
        ];
        let mask = stream_pointer_mask(&events, 6);
        assert_eq!(mask, vec![0, 0, 1, 1, 0, 0]);
    }
}
