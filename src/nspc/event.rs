//! Track event model
//!
//! Events form a closed sum type; engine-specific commands ride in the
//! `Extension` variant so a new engine command needs a configuration entry,
//! not a new type.

/// Stable id of one event entry within a song.
pub type EventId = u64;

/// Track/subroutine-stream virtual command.
///
/// The discriminants of the canonical id space are 0xE0..=0xFF; raw opcode
/// bytes map into it through the command map's read map and back out through
/// its write map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Vcmd {
    /// Select an instrument
    Inst {
        /// Instrument table index
        instrument: u8,
    },
    /// Set stereo panning
    Panning {
        /// Pan position byte
        panning: u8,
    },
    /// Fade panning over time
    PanFade {
        /// Fade time in ticks
        time: u8,
        /// Target pan position
        target: u8,
    },
    /// Start vibrato
    VibratoOn {
        /// Delay before onset
        delay: u8,
        /// Oscillation rate
        rate: u8,
        /// Depth
        depth: u8,
    },
    /// Stop vibrato
    VibratoOff,
    /// Set the song master volume
    GlobalVolume {
        /// New volume
        volume: u8,
    },
    /// Fade the song master volume
    GlobalVolumeFade {
        /// Fade time in ticks
        time: u8,
        /// Target volume
        target: u8,
    },
    /// Set the tempo
    Tempo {
        /// Tempo byte
        tempo: u8,
    },
    /// Fade the tempo
    TempoFade {
        /// Fade time in ticks
        time: u8,
        /// Target tempo
        target: u8,
    },
    /// Transpose every voice
    GlobalTranspose {
        /// Signed semitone offset
        semitones: i8,
    },
    /// Transpose this voice
    VoiceTranspose {
        /// Signed semitone offset
        semitones: i8,
    },
    /// Start tremolo
    TremoloOn {
        /// Delay before onset
        delay: u8,
        /// Oscillation rate
        rate: u8,
        /// Depth
        depth: u8,
    },
    /// Stop tremolo
    TremoloOff,
    /// Set the voice volume
    Volume {
        /// New volume
        volume: u8,
    },
    /// Fade the voice volume
    VolumeFade {
        /// Fade time in ticks
        time: u8,
        /// Target volume
        target: u8,
    },
    /// Repeat a shared subroutine `count` times
    SubroutineCall {
        /// Callee id within the song
        sub_id: i32,
        /// ARAM address the call referenced when imported
        original_addr: u16,
        /// Repeat count, 1..=0xFF
        count: u8,
    },
    /// Ramp vibrato in
    VibratoFadeIn {
        /// Ramp time in ticks
        time: u8,
    },
    /// Pitch envelope towards the note
    PitchEnvelopeTo {
        /// Delay before onset
        delay: u8,
        /// Envelope length
        length: u8,
        /// Semitone span
        semitone: u8,
    },
    /// Pitch envelope away from the note
    PitchEnvelopeFrom {
        /// Delay before onset
        delay: u8,
        /// Envelope length
        length: u8,
        /// Semitone span
        semitone: u8,
    },
    /// Stop the pitch envelope
    PitchEnvelopeOff,
    /// Detune this voice
    FineTune {
        /// Signed fraction of a semitone
        semitones: i8,
    },
    /// Enable echo on a channel set
    EchoOn {
        /// Channel bitmask
        channels: u8,
        /// Echo volume left
        left: u8,
        /// Echo volume right
        right: u8,
    },
    /// Disable echo
    EchoOff,
    /// Configure the echo unit
    EchoParams {
        /// Delay setting
        delay: u8,
        /// Feedback amount
        feedback: u8,
        /// FIR preset index
        fir_index: u8,
    },
    /// Fade the echo volume
    EchoVolumeFade {
        /// Fade time in ticks
        time: u8,
        /// Target left volume
        left_target: u8,
        /// Target right volume
        right_target: u8,
    },
    /// Slide the pitch to a note
    PitchSlideToNote {
        /// Delay before the slide
        delay: u8,
        /// Slide length in ticks
        length: u8,
        /// Target note
        note: u8,
    },
    /// Select the percussion base instrument
    PercussionBase {
        /// Base instrument index
        index: u8,
    },
    /// Engine no-op carrying two raw bytes
    Nop {
        /// The two skipped bytes as a little-endian word
        bytes: u16,
    },
    /// Mute this channel
    MuteChannel,
    /// Fast-forward on
    FastForwardOn,
    /// Fast-forward off
    FastForwardOff,
    /// Reserved opcode with no engine behavior
    Unused,
    /// Engine-specific extension command (id + up to four parameter bytes)
    Extension {
        /// Raw command id
        id: u8,
        /// Number of parameter bytes in use
        param_count: u8,
        /// Parameter bytes, `param_count` of them meaningful
        params: [u8; 4],
    },
}

impl Vcmd {
    /// Canonical command id in the 0xE0..=0xFF space. Extensions report
    /// their raw id.
    pub fn canonical_id(&self) -> u8 {
        match self {
            Vcmd::Inst { .. } => 0xE0,
            Vcmd::Panning { .. } => 0xE1,
            Vcmd::PanFade { .. } => 0xE2,
            Vcmd::VibratoOn { .. } => 0xE3,
            Vcmd::VibratoOff => 0xE4,
            Vcmd::GlobalVolume { .. } => 0xE5,
            Vcmd::GlobalVolumeFade { .. } => 0xE6,
            Vcmd::Tempo { .. } => 0xE7,
            Vcmd::TempoFade { .. } => 0xE8,
            Vcmd::GlobalTranspose { .. } => 0xE9,
            Vcmd::VoiceTranspose { .. } => 0xEA,
            Vcmd::TremoloOn { .. } => 0xEB,
            Vcmd::TremoloOff => 0xEC,
            Vcmd::Volume { .. } => 0xED,
            Vcmd::VolumeFade { .. } => 0xEE,
            Vcmd::SubroutineCall { .. } => 0xEF,
            Vcmd::VibratoFadeIn { .. } => 0xF0,
            Vcmd::PitchEnvelopeTo { .. } => 0xF1,
            Vcmd::PitchEnvelopeFrom { .. } => 0xF2,
            Vcmd::PitchEnvelopeOff => 0xF3,
            Vcmd::FineTune { .. } => 0xF4,
            Vcmd::EchoOn { .. } => 0xF5,
            Vcmd::EchoOff => 0xF6,
            Vcmd::EchoParams { .. } => 0xF7,
            Vcmd::EchoVolumeFade { .. } => 0xF8,
            Vcmd::PitchSlideToNote { .. } => 0xF9,
            Vcmd::PercussionBase { .. } => 0xFA,
            Vcmd::Nop { .. } => 0xFB,
            Vcmd::MuteChannel => 0xFC,
            Vcmd::FastForwardOn => 0xFD,
            Vcmd::FastForwardOff => 0xFE,
            Vcmd::Unused => 0xFF,
            Vcmd::Extension { id, .. } => *id,
        }
    }

    /// Encoded size in bytes, opcode included.
    pub fn encoded_size(&self) -> u32 {
        match self {
            Vcmd::VibratoOff
            | Vcmd::TremoloOff
            | Vcmd::PitchEnvelopeOff
            | Vcmd::EchoOff
            | Vcmd::MuteChannel
            | Vcmd::FastForwardOn
            | Vcmd::FastForwardOff
            | Vcmd::Unused => 1,
            Vcmd::Inst { .. }
            | Vcmd::Panning { .. }
            | Vcmd::GlobalVolume { .. }
            | Vcmd::Tempo { .. }
            | Vcmd::GlobalTranspose { .. }
            | Vcmd::VoiceTranspose { .. }
            | Vcmd::Volume { .. }
            | Vcmd::VibratoFadeIn { .. }
            | Vcmd::FineTune { .. }
            | Vcmd::PercussionBase { .. } => 2,
            Vcmd::PanFade { .. }
            | Vcmd::GlobalVolumeFade { .. }
            | Vcmd::TempoFade { .. }
            | Vcmd::VolumeFade { .. }
            | Vcmd::Nop { .. } => 3,
            Vcmd::VibratoOn { .. }
            | Vcmd::TremoloOn { .. }
            | Vcmd::SubroutineCall { .. }
            | Vcmd::PitchEnvelopeTo { .. }
            | Vcmd::PitchEnvelopeFrom { .. }
            | Vcmd::EchoOn { .. }
            | Vcmd::EchoParams { .. }
            | Vcmd::EchoVolumeFade { .. }
            | Vcmd::PitchSlideToNote { .. } => 4,
            Vcmd::Extension { param_count, .. } => 1 + u32::from(*param_count),
        }
    }

    /// Human-readable command name.
    pub fn name(&self) -> &'static str {
        match self {
            Vcmd::Inst { .. } => "Inst",
            Vcmd::Panning { .. } => "Panning",
            Vcmd::PanFade { .. } => "PanFade",
            Vcmd::VibratoOn { .. } => "VibratoOn",
            Vcmd::VibratoOff => "VibratoOff",
            Vcmd::GlobalVolume { .. } => "GlobalVolume",
            Vcmd::GlobalVolumeFade { .. } => "GlobalVolumeFade",
            Vcmd::Tempo { .. } => "Tempo",
            Vcmd::TempoFade { .. } => "TempoFade",
            Vcmd::GlobalTranspose { .. } => "GlobalTranspose",
            Vcmd::VoiceTranspose { .. } => "VoiceTranspose",
            Vcmd::TremoloOn { .. } => "TremoloOn",
            Vcmd::TremoloOff => "TremoloOff",
            Vcmd::Volume { .. } => "Volume",
            Vcmd::VolumeFade { .. } => "VolumeFade",
            Vcmd::SubroutineCall { .. } => "SubroutineCall",
            Vcmd::VibratoFadeIn { .. } => "VibratoFadeIn",
            Vcmd::PitchEnvelopeTo { .. } => "PitchEnvelopeTo",
            Vcmd::PitchEnvelopeFrom { .. } => "PitchEnvelopeFrom",
            Vcmd::PitchEnvelopeOff => "PitchEnvelopeOff",
            Vcmd::FineTune { .. } => "FineTune",
            Vcmd::EchoOn { .. } => "EchoOn",
            Vcmd::EchoOff => "EchoOff",
            Vcmd::EchoParams { .. } => "EchoParams",
            Vcmd::EchoVolumeFade { .. } => "EchoVolumeFade",
            Vcmd::PitchSlideToNote { .. } => "PitchSlideToNote",
            Vcmd::PercussionBase { .. } => "PercussionBase",
            Vcmd::Nop { .. } => "Nop",
            Vcmd::MuteChannel => "MuteChannel",
            Vcmd::FastForwardOn => "FastForwardOn",
            Vcmd::FastForwardOff => "FastForwardOff",
            Vcmd::Unused => "Unused",
            Vcmd::Extension { .. } => "Extension",
        }
    }
}

/// Parameter byte count of a canonical command id.
pub fn vcmd_param_byte_count(id: u8) -> u8 {
    match id {
        0xE0 | 0xE1 | 0xE5 | 0xE7 | 0xE9 | 0xEA | 0xED | 0xF0 | 0xF4 | 0xFA => 1,
        0xE2 | 0xE6 | 0xE8 | 0xEE | 0xFB => 2,
        0xE3 | 0xEB | 0xEF | 0xF1 | 0xF2 | 0xF5 | 0xF7 | 0xF8 | 0xF9 => 3,
        _ => 0,
    }
}

/// Build a canonical vcmd from its id and parameter bytes. Returns `None`
/// for ids with no fixed interpretation (0xE0 instrument, 0xED volume, the
/// subroutine call and NOP are parsed in context; unused stays unused).
pub fn construct_vcmd(id: u8, params: &[u8; 4]) -> Option<Vcmd> {
    match id {
        0xE1 => Some(Vcmd::Panning { panning: params[0] }),
        0xE2 => Some(Vcmd::PanFade {
            time: params[0],
            target: params[1],
        }),
        0xE3 => Some(Vcmd::VibratoOn {
            delay: params[0],
            rate: params[1],
            depth: params[2],
        }),
        0xE4 => Some(Vcmd::VibratoOff),
        0xE5 => Some(Vcmd::GlobalVolume { volume: params[0] }),
        0xE6 => Some(Vcmd::GlobalVolumeFade {
            time: params[0],
            target: params[1],
        }),
        0xE7 => Some(Vcmd::Tempo { tempo: params[0] }),
        0xE8 => Some(Vcmd::TempoFade {
            time: params[0],
            target: params[1],
        }),
        0xE9 => Some(Vcmd::GlobalTranspose {
            semitones: params[0] as i8,
        }),
        0xEA => Some(Vcmd::VoiceTranspose {
            semitones: params[0] as i8,
        }),
        0xEB => Some(Vcmd::TremoloOn {
            delay: params[0],
            rate: params[1],
            depth: params[2],
        }),
        0xEC => Some(Vcmd::TremoloOff),
        0xEE => Some(Vcmd::VolumeFade {
            time: params[0],
            target: params[1],
        }),
        0xF0 => Some(Vcmd::VibratoFadeIn { time: params[0] }),
        0xF1 => Some(Vcmd::PitchEnvelopeTo {
            delay: params[0],
            length: params[1],
            semitone: params[2],
        }),
        0xF2 => Some(Vcmd::PitchEnvelopeFrom {
            delay: params[0],
            length: params[1],
            semitone: params[2],
        }),
        0xF3 => Some(Vcmd::PitchEnvelopeOff),
        0xF4 => Some(Vcmd::FineTune {
            semitones: params[0] as i8,
        }),
        0xF5 => Some(Vcmd::EchoOn {
            channels: params[0],
            left: params[1],
            right: params[2],
        }),
        0xF6 => Some(Vcmd::EchoOff),
        0xF7 => Some(Vcmd::EchoParams {
            delay: params[0],
            feedback: params[1],
            fir_index: params[2],
        }),
        0xF8 => Some(Vcmd::EchoVolumeFade {
            time: params[0],
            left_target: params[1],
            right_target: params[2],
        }),
        0xF9 => Some(Vcmd::PitchSlideToNote {
            delay: params[0],
            length: params[1],
            note: params[2],
        }),
        0xFA => Some(Vcmd::PercussionBase { index: params[0] }),
        0xFC => Some(Vcmd::MuteChannel),
        0xFD => Some(Vcmd::FastForwardOn),
        0xFE => Some(Vcmd::FastForwardOff),
        _ => None,
    }
}

/// A single track-stream event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NspcEvent {
    /// Note length, with optional quantization/velocity modifier
    Duration {
        /// Tick count, 1..=0x7F
        ticks: u8,
        /// Quantization 0..=7 when the modifier byte was present
        quantization: Option<u8>,
        /// Velocity 0..=15 when the modifier byte was present
        velocity: Option<u8>,
    },
    /// Pitched note, 0..=0x47
    Note {
        /// Pitch relative to the note range start
        pitch: u8,
    },
    /// Hold the previous note
    Tie,
    /// Silence for the current duration
    Rest,
    /// Percussion note, 0..=0x15
    Percussion {
        /// Index into the percussion range
        index: u8,
    },
    /// Virtual command
    Vcmd(Vcmd),
    /// Annotation marking an inlined subroutine boundary; never emitted
    Subroutine {
        /// Original subroutine id
        id: i32,
        /// Original ARAM address
        original_addr: u16,
    },
    /// Stream terminator
    End,
}

impl NspcEvent {
    /// Encoded size in bytes. Annotations encode to nothing.
    pub fn encoded_size(&self) -> u32 {
        match self {
            NspcEvent::Duration {
                quantization,
                velocity,
                ..
            } => {
                if quantization.is_some() || velocity.is_some() {
                    2
                } else {
                    1
                }
            }
            NspcEvent::Vcmd(vcmd) => vcmd.encoded_size(),
            NspcEvent::Note { .. } | NspcEvent::Tie | NspcEvent::Rest | NspcEvent::Percussion { .. } => 1,
            NspcEvent::Subroutine { .. } => 0,
            NspcEvent::End => 1,
        }
    }

    /// True for events that advance musical time.
    pub fn consumes_duration_ticks(&self) -> bool {
        matches!(
            self,
            NspcEvent::Note { .. } | NspcEvent::Tie | NspcEvent::Rest | NspcEvent::Percussion { .. }
        )
    }
}

/// One entry of a track or subroutine event list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventEntry {
    /// Stable id within the song
    pub id: EventId,
    /// The event
    pub event: NspcEvent,
    /// ARAM address the event was read from, when imported
    pub original_addr: Option<u16>,
}

// ---- semantic hashing (used by the subroutine optimizer) ----

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

fn hash_add(h: &mut u64, v: u64) {
    *h ^= splitmix64(
        v.wrapping_add(0x9E37_79B9_7F4A_7C15)
            .wrapping_add(*h << 6)
            .wrapping_add(*h >> 2),
    );
}

fn hash_vcmd_semantic(vcmd: &Vcmd) -> u64 {
    let mut h = 0xC0DE_C0DE_1234_5678u64;
    hash_add(&mut h, u64::from(vcmd.canonical_id()));
    match vcmd {
        Vcmd::Inst { instrument } => hash_add(&mut h, u64::from(*instrument)),
        Vcmd::Panning { panning } => hash_add(&mut h, u64::from(*panning)),
        Vcmd::PanFade { time, target }
        | Vcmd::GlobalVolumeFade { time, target }
        | Vcmd::TempoFade { time, target }
        | Vcmd::VolumeFade { time, target } => {
            hash_add(&mut h, u64::from(*time));
            hash_add(&mut h, u64::from(*target));
        }
        Vcmd::VibratoOn { delay, rate, depth } | Vcmd::TremoloOn { delay, rate, depth } => {
            hash_add(&mut h, u64::from(*delay));
            hash_add(&mut h, u64::from(*rate));
            hash_add(&mut h, u64::from(*depth));
        }
        Vcmd::GlobalVolume { volume } | Vcmd::Volume { volume } => {
            hash_add(&mut h, u64::from(*volume))
        }
        Vcmd::Tempo { tempo } => hash_add(&mut h, u64::from(*tempo)),
        Vcmd::GlobalTranspose { semitones }
        | Vcmd::VoiceTranspose { semitones }
        | Vcmd::FineTune { semitones } => hash_add(&mut h, u64::from(*semitones as u8)),
        Vcmd::SubroutineCall { sub_id, count, .. } => {
            hash_add(&mut h, *sub_id as u32 as u64);
            hash_add(&mut h, u64::from(*count));
        }
        Vcmd::VibratoFadeIn { time } => hash_add(&mut h, u64::from(*time)),
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
            hash_add(&mut h, u64::from(*delay));
            hash_add(&mut h, u64::from(*length));
            hash_add(&mut h, u64::from(*semitone));
        }
        Vcmd::EchoOn {
            channels,
            left,
            right,
        } => {
            hash_add(&mut h, u64::from(*channels));
            hash_add(&mut h, u64::from(*left));
            hash_add(&mut h, u64::from(*right));
        }
        Vcmd::EchoParams {
            delay,
            feedback,
            fir_index,
        } => {
            hash_add(&mut h, u64::from(*delay));
            hash_add(&mut h, u64::from(*feedback));
            hash_add(&mut h, u64::from(*fir_index));
        }
        Vcmd::EchoVolumeFade {
            time,
            left_target,
            right_target,
        } => {
            hash_add(&mut h, u64::from(*time));
            hash_add(&mut h, u64::from(*left_target));
            hash_add(&mut h, u64::from(*right_target));
        }
        Vcmd::PitchSlideToNote {
            delay,
            length,
            note,
        } => {
            hash_add(&mut h, u64::from(*delay));
            hash_add(&mut h, u64::from(*length));
            hash_add(&mut h, u64::from(*note));
        }
        Vcmd::PercussionBase { index } => hash_add(&mut h, u64::from(*index)),
        Vcmd::Nop { bytes } => hash_add(&mut h, u64::from(*bytes)),
        Vcmd::Extension {
            id,
            param_count,
            params,
        } => {
            hash_add(&mut h, 0xF0FF);
            hash_add(&mut h, u64::from(*id));
            hash_add(&mut h, u64::from(*param_count));
            for i in 0..usize::from(*param_count) {
                hash_add(&mut h, u64::from(params[i]));
            }
        }
        Vcmd::VibratoOff
        | Vcmd::TremoloOff
        | Vcmd::PitchEnvelopeOff
        | Vcmd::EchoOff
        | Vcmd::MuteChannel
        | Vcmd::FastForwardOn
        | Vcmd::FastForwardOff
        | Vcmd::Unused => {}
    }

    h & !(1u64 << 63)
}

/// Hash an event to a deterministic 63-bit semantic token; the top bit is
/// reserved for the optimizer's separator tokens.
pub(crate) fn hash_event_semantic(event: &NspcEvent) -> u64 {
    let mut h = 0xBADC_0FFE_E0DD_F00Du64;

    match event {
        NspcEvent::Duration {
            ticks,
            quantization,
            velocity,
        } => {
            // canonicalize the way the encoder does
            let ticks = if *ticks == 0 { 1 } else { *ticks };
            hash_add(&mut h, 0x01);
            hash_add(&mut h, u64::from(ticks));
            if quantization.is_some() || velocity.is_some() {
                let q = u64::from(quantization.unwrap_or(0) & 0x07);
                let v = u64::from(velocity.unwrap_or(0) & 0x0F);
                hash_add(&mut h, 0x100);
                hash_add(&mut h, q);
                hash_add(&mut h, v);
            } else {
                hash_add(&mut h, 0x101);
            }
        }
        NspcEvent::Vcmd(vcmd) => {
            hash_add(&mut h, 0x02);
            hash_add(&mut h, hash_vcmd_semantic(vcmd));
        }
        NspcEvent::Note { pitch } => {
            hash_add(&mut h, 0x03);
            hash_add(&mut h, u64::from(*pitch));
        }
        NspcEvent::Tie => hash_add(&mut h, 0x04),
        NspcEvent::Rest => hash_add(&mut h, 0x05),
        NspcEvent::Percussion { index } => {
            hash_add(&mut h, 0x06);
            hash_add(&mut h, u64::from(*index));
        }
        NspcEvent::Subroutine { id, original_addr } => {
            hash_add(&mut h, 0x07);
            hash_add(&mut h, *id as u32 as u64);
            hash_add(&mut h, u64::from(*original_addr));
        }
        NspcEvent::End => hash_add(&mut h, 0x08),
    }

    splitmix64(h) & !(1u64 << 63)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoded_sizes_match_param_counts() {
        for id in 0xE0u8..=0xFF {
            if let Some(vcmd) = construct_vcmd(id, &[0; 4]) {
                assert_eq!(
                    vcmd.encoded_size(),
                    1 + u32::from(vcmd_param_byte_count(id)),
                    "size mismatch for ${id:02X}"
                );
            }
        }
        assert_eq!(
            Vcmd::SubroutineCall {
                sub_id: 0,
                original_addr: 0,
                count: 1
            }
            .encoded_size(),
            4
        );
        assert_eq!(Vcmd::Inst { instrument: 0 }.encoded_size(), 2);
        assert_eq!(Vcmd::Nop { bytes: 0 }.encoded_size(), 3);
    }

    #[test]
    fn test_duration_size_depends_on_modifier() {
        let bare = NspcEvent::Duration {
            ticks: 8,
            quantization: None,
            velocity: None,
        };
        let qv = NspcEvent::Duration {
            ticks: 8,
            quantization: Some(3),
            velocity: Some(9),
        };
        assert_eq!(bare.encoded_size(), 1);
        assert_eq!(qv.encoded_size(), 2);
    }

    #[test]
    fn test_semantic_hash_is_deterministic_and_top_bit_clear() {
        let a = NspcEvent::Note { pitch: 0x20 };
        let b = NspcEvent::Note { pitch: 0x20 };
        let c = NspcEvent::Note { pitch: 0x21 };
        assert_eq!(hash_event_semantic(&a), hash_event_semantic(&b));
        assert_ne!(hash_event_semantic(&a), hash_event_semantic(&c));
        assert_eq!(hash_event_semantic(&a) >> 63, 0);
    }

    #[test]
    fn test_duration_hash_canonicalizes_zero_ticks() {
        let zero = NspcEvent::Duration {
            ticks: 0,
            quantization: None,
            velocity: None,
        };
        let one = NspcEvent::Duration {
            ticks: 1,
            quantization: None,
            velocity: None,
        };
        assert_eq!(hash_event_semantic(&zero), hash_event_semantic(&one));
    }
}
