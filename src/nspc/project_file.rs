//! Project persistence ("project IR")
//!
//! A JSON container for everything the user added on top of a base image:
//! full user songs, instruments and samples, plus explicit id lists of the
//! engine content that was kept. Track and subroutine event streams pack
//! into a compact binary form (varint counts, tagged records, zigzag
//! integers) carried as base64. Loading is strict about the format tag,
//! version and the presence of the retained-content lists.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use super::event::{EventEntry, EventId, NspcEvent, Vcmd};
use super::project::{BrrSample, NspcInstrument, NspcProject};
use super::song::{ContentOrigin, NspcSong, Pattern, SequenceOp, Subroutine, Track};
use crate::{NspcError, Result};

const PROJECT_FORMAT_TAG: &str = "ntrak_project_ir";
const PROJECT_FORMAT_VERSION: u32 = 4;
const PACKED_EVENTS_ENCODING_VERSION: u8 = 1;

// ---- varint primitives ----

fn append_var_uint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

fn append_var_int(out: &mut Vec<u8>, value: i64) {
    let zigzag = ((value << 1) ^ (value >> 63)) as u64;
    append_var_uint(out, zigzag);
}

fn read_var_uint(bytes: &[u8], offset: &mut usize) -> Option<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let &byte = bytes.get(*offset)?;
        *offset += 1;
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Some(value);
        }
        shift += 7;
        if shift >= 64 {
            return None;
        }
    }
}

fn read_var_int(bytes: &[u8], offset: &mut usize) -> Option<i64> {
    let zigzag = read_var_uint(bytes, offset)?;
    Some((zigzag >> 1) as i64 ^ -((zigzag & 1) as i64))
}

fn append_u16_le(out: &mut Vec<u8>, value: u16) {
    out.push(value as u8);
    out.push((value >> 8) as u8);
}

fn read_u16_le(bytes: &[u8], offset: &mut usize) -> Option<u16> {
    let lo = *bytes.get(*offset)?;
    let hi = *bytes.get(*offset + 1)?;
    *offset += 2;
    Some(u16::from(lo) | u16::from(hi) << 8)
}

// ---- packed event records ----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PackedEventKind {
    Empty = 0,
    Duration = 1,
    Vcmd = 2,
    Note = 3,
    Tie = 4,
    Rest = 5,
    Percussion = 6,
    Subroutine = 7,
    End = 8,
}

fn packed_kind_for(event: &NspcEvent) -> PackedEventKind {
    match event {
        NspcEvent::Duration { .. } => PackedEventKind::Duration,
        NspcEvent::Vcmd(_) => PackedEventKind::Vcmd,
        NspcEvent::Note { .. } => PackedEventKind::Note,
        NspcEvent::Tie => PackedEventKind::Tie,
        NspcEvent::Rest => PackedEventKind::Rest,
        NspcEvent::Percussion { .. } => PackedEventKind::Percussion,
        NspcEvent::Subroutine { .. } => PackedEventKind::Subroutine,
        NspcEvent::End => PackedEventKind::End,
    }
}

struct RawVcmd {
    id: u8,
    param_count: u8,
    params: [u8; 4],
    subroutine_id: Option<i32>,
    original_addr: Option<u16>,
    is_extension: bool,
}

fn to_raw_vcmd(vcmd: &Vcmd) -> RawVcmd {
    let mut raw = RawVcmd {
        id: vcmd.canonical_id(),
        param_count: (vcmd.encoded_size() - 1) as u8,
        params: [0; 4],
        subroutine_id: None,
        original_addr: None,
        is_extension: false,
    };

    match vcmd {
        Vcmd::Inst { instrument } => raw.params[0] = *instrument,
        Vcmd::Panning { panning } => raw.params[0] = *panning,
        Vcmd::PanFade { time, target }
        | Vcmd::GlobalVolumeFade { time, target }
        | Vcmd::TempoFade { time, target }
        | Vcmd::VolumeFade { time, target } => {
            raw.params[0] = *time;
            raw.params[1] = *target;
        }
        Vcmd::VibratoOn { delay, rate, depth } | Vcmd::TremoloOn { delay, rate, depth } => {
            raw.params[0] = *delay;
            raw.params[1] = *rate;
            raw.params[2] = *depth;
        }
        Vcmd::GlobalVolume { volume } | Vcmd::Volume { volume } => raw.params[0] = *volume,
        Vcmd::Tempo { tempo } => raw.params[0] = *tempo,
        Vcmd::GlobalTranspose { semitones }
        | Vcmd::VoiceTranspose { semitones }
        | Vcmd::FineTune { semitones } => raw.params[0] = *semitones as u8,
        Vcmd::SubroutineCall {
            sub_id,
            original_addr,
            count,
        } => {
            raw.params[0] = *original_addr as u8;
            raw.params[1] = (*original_addr >> 8) as u8;
            raw.params[2] = *count;
            raw.subroutine_id = Some(*sub_id);
            raw.original_addr = Some(*original_addr);
        }
        Vcmd::VibratoFadeIn { time } => raw.params[0] = *time,
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
            raw.params[0] = *delay;
            raw.params[1] = *length;
            raw.params[2] = *semitone;
        }
        Vcmd::EchoOn {
            channels,
            left,
            right,
        } => {
            raw.params[0] = *channels;
            raw.params[1] = *left;
            raw.params[2] = *right;
        }
        Vcmd::EchoParams {
            delay,
            feedback,
            fir_index,
        } => {
            raw.params[0] = *delay;
            raw.params[1] = *feedback;
            raw.params[2] = *fir_index;
        }
        Vcmd::EchoVolumeFade {
            time,
            left_target,
            right_target,
        } => {
            raw.params[0] = *time;
            raw.params[1] = *left_target;
            raw.params[2] = *right_target;
        }
        Vcmd::PitchSlideToNote {
            delay,
            length,
            note,
        } => {
            raw.params[0] = *delay;
            raw.params[1] = *length;
            raw.params[2] = *note;
        }
        Vcmd::PercussionBase { index } => raw.params[0] = *index,
        Vcmd::Nop { bytes } => {
            raw.params[0] = *bytes as u8;
            raw.params[1] = (*bytes >> 8) as u8;
        }
        Vcmd::Extension {
            param_count,
            params,
            ..
        } => {
            raw.param_count = *param_count;
            raw.params = *params;
            raw.is_extension = true;
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

    raw
}

fn vcmd_from_raw(raw: &RawVcmd) -> Result<Vcmd> {
    if raw.is_extension {
        return Ok(Vcmd::Extension {
            id: raw.id,
            param_count: raw.param_count.min(4),
            params: raw.params,
        });
    }

    match raw.id {
        0xE0 => Ok(Vcmd::Inst {
            instrument: raw.params[0],
        }),
        0xED => Ok(Vcmd::Volume {
            volume: raw.params[0],
        }),
        0xEF => {
            let fallback_addr =
                u16::from(raw.params[0]) | u16::from(raw.params[1]) << 8;
            Ok(Vcmd::SubroutineCall {
                sub_id: raw.subroutine_id.unwrap_or(-1),
                original_addr: raw.original_addr.unwrap_or(fallback_addr),
                count: raw.params[2],
            })
        }
        0xFB => Ok(Vcmd::Nop {
            bytes: u16::from(raw.params[0]) | u16::from(raw.params[1]) << 8,
        }),
        0xFF => Ok(Vcmd::Unused),
        id => super::event::construct_vcmd(id, &raw.params).ok_or_else(|| {
            NspcError::InvalidInput(format!("Unsupported vcmd ${id:02X} in project file"))
        }),
    }
}

fn pack_event_entries(entries: &[EventEntry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + entries.len() * 8);
    out.push(PACKED_EVENTS_ENCODING_VERSION);
    append_var_uint(&mut out, entries.len() as u64);

    for entry in entries {
        append_var_uint(&mut out, entry.id);

        let kind = packed_kind_for(&entry.event);
        let mut header = (kind as u8) << 1;
        if entry.original_addr.is_some() {
            header |= 0x01;
        }
        out.push(header);

        if let Some(addr) = entry.original_addr {
            append_u16_le(&mut out, addr);
        }

        match &entry.event {
            NspcEvent::Duration {
                ticks,
                quantization,
                velocity,
            } => {
                out.push(*ticks);
                let mut flags = 0u8;
                if quantization.is_some() {
                    flags |= 0x01;
                }
                if velocity.is_some() {
                    flags |= 0x02;
                }
                out.push(flags);
                if let Some(q) = quantization {
                    out.push(*q);
                }
                if let Some(v) = velocity {
                    out.push(*v);
                }
            }
            NspcEvent::Vcmd(vcmd) => {
                let raw = to_raw_vcmd(vcmd);
                out.push(raw.id);
                out.push(raw.param_count);
                out.extend_from_slice(&raw.params[..usize::from(raw.param_count.min(4))]);
                let mut flags = 0u8;
                if raw.subroutine_id.is_some() {
                    flags |= 0x01;
                }
                if raw.original_addr.is_some() {
                    flags |= 0x02;
                }
                if raw.is_extension {
                    flags |= 0x04;
                }
                out.push(flags);
                if let Some(sub_id) = raw.subroutine_id {
                    append_var_int(&mut out, i64::from(sub_id));
                }
                if let Some(addr) = raw.original_addr {
                    append_u16_le(&mut out, addr);
                }
            }
            NspcEvent::Note { pitch } => out.push(*pitch),
            NspcEvent::Tie | NspcEvent::Rest | NspcEvent::End => {}
            NspcEvent::Percussion { index } => out.push(*index),
            NspcEvent::Subroutine { id, original_addr } => {
                append_var_int(&mut out, i64::from(*id));
                append_u16_le(&mut out, *original_addr);
            }
        }
    }

    out
}

fn unpack_event_entries(bytes: &[u8], label: &str) -> Result<Vec<EventEntry>> {
    let fail = |detail: String| -> NspcError {
        NspcError::InvalidInput(format!("{label} packed events decode error: {detail}"))
    };

    if bytes.is_empty() {
        return Err(fail("payload is empty".into()));
    }

    let mut offset = 0usize;
    let encoding_version = bytes[offset];
    offset += 1;
    if encoding_version != PACKED_EVENTS_ENCODING_VERSION {
        return Err(fail(format!("unsupported encoding version {encoding_version}")));
    }

    let count = read_var_uint(bytes, &mut offset)
        .ok_or_else(|| fail("missing event count".into()))? as usize;

    let mut out = Vec::with_capacity(count);
    for event_index in 0..count {
        let id: EventId = read_var_uint(bytes, &mut offset)
            .ok_or_else(|| fail(format!("event {event_index} has invalid id encoding")))?;

        let header = *bytes
            .get(offset)
            .ok_or_else(|| fail(format!("event {event_index} is missing header")))?;
        offset += 1;
        let has_original_addr = header & 0x01 != 0;
        let kind = (header >> 1) & 0x0F;

        let original_addr = if has_original_addr {
            Some(
                read_u16_le(bytes, &mut offset)
                    .ok_or_else(|| fail(format!("event {event_index} originalAddr is truncated")))?,
            )
        } else {
            None
        };

        let take_byte = |offset: &mut usize| -> Result<u8> {
            let byte = *bytes
                .get(*offset)
                .ok_or_else(|| fail(format!("event {event_index} payload is truncated")))?;
            *offset += 1;
            Ok(byte)
        };

        let event = match kind {
            k if k == PackedEventKind::Empty as u8 => {
                return Err(fail(format!("event {event_index} has empty kind")));
            }
            k if k == PackedEventKind::Duration as u8 => {
                let ticks = take_byte(&mut offset)?;
                let flags = take_byte(&mut offset)?;
                let quantization = if flags & 0x01 != 0 {
                    Some(take_byte(&mut offset)?)
                } else {
                    None
                };
                let velocity = if flags & 0x02 != 0 {
                    Some(take_byte(&mut offset)?)
                } else {
                    None
                };
                NspcEvent::Duration {
                    ticks,
                    quantization,
                    velocity,
                }
            }
            k if k == PackedEventKind::Vcmd as u8 => {
                let id = take_byte(&mut offset)?;
                let param_count = take_byte(&mut offset)?;
                if param_count > 4 {
                    return Err(fail(format!(
                        "event {event_index} vcmd has {param_count} params"
                    )));
                }
                let mut params = [0u8; 4];
                for slot in params.iter_mut().take(usize::from(param_count)) {
                    *slot = take_byte(&mut offset)?;
                }
                let flags = take_byte(&mut offset)?;
                let subroutine_id = if flags & 0x01 != 0 {
                    Some(
                        read_var_int(bytes, &mut offset).ok_or_else(|| {
                            fail(format!("event {event_index} subroutine id is truncated"))
                        })? as i32,
                    )
                } else {
                    None
                };
                let call_addr = if flags & 0x02 != 0 {
                    Some(read_u16_le(bytes, &mut offset).ok_or_else(|| {
                        fail(format!("event {event_index} call address is truncated"))
                    })?)
                } else {
                    None
                };

                let raw = RawVcmd {
                    id,
                    param_count,
                    params,
                    subroutine_id,
                    original_addr: call_addr,
                    is_extension: flags & 0x04 != 0,
                };
                NspcEvent::Vcmd(vcmd_from_raw(&raw)?)
            }
            k if k == PackedEventKind::Note as u8 => NspcEvent::Note {
                pitch: take_byte(&mut offset)?,
            },
            k if k == PackedEventKind::Tie as u8 => NspcEvent::Tie,
            k if k == PackedEventKind::Rest as u8 => NspcEvent::Rest,
            k if k == PackedEventKind::Percussion as u8 => NspcEvent::Percussion {
                index: take_byte(&mut offset)?,
            },
            k if k == PackedEventKind::Subroutine as u8 => {
                let id = read_var_int(bytes, &mut offset)
                    .ok_or_else(|| fail(format!("event {event_index} annotation id is truncated")))?
                    as i32;
                let addr = read_u16_le(bytes, &mut offset).ok_or_else(|| {
                    fail(format!("event {event_index} annotation address is truncated"))
                })?;
                NspcEvent::Subroutine {
                    id,
                    original_addr: addr,
                }
            }
            k if k == PackedEventKind::End as u8 => NspcEvent::End,
            k => return Err(fail(format!("event {event_index} has unknown kind {k}"))),
        };

        out.push(EventEntry {
            id,
            event,
            original_addr,
        });
    }

    Ok(out)
}

// ---- container schema ----

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamPayload {
    id: i32,
    original_addr: u16,
    events: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SongPayload {
    song_id: i32,
    name: String,
    sequence: Vec<SequenceOp>,
    patterns: Vec<Pattern>,
    tracks: Vec<StreamPayload>,
    subroutines: Vec<StreamPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstrumentPayload {
    id: i32,
    name: String,
    sample_index: u8,
    adsr1: u8,
    adsr2: u8,
    gain: u8,
    base_pitch_mult: u8,
    frac_pitch_mult: u8,
    percussion_note: u8,
    original_addr: u16,
    song_id: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SamplePayload {
    id: i32,
    name: String,
    original_addr: u16,
    original_loop_addr: u16,
    data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EngineRetainedPayload {
    song_ids: Vec<i32>,
    instrument_ids: Vec<i32>,
    sample_ids: Vec<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectContainer {
    format: String,
    version: u32,
    engine: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    base_spc_path: Option<String>,
    enabled_extensions: Vec<String>,
    songs: Vec<SongPayload>,
    instruments: Vec<InstrumentPayload>,
    samples: Vec<SamplePayload>,
    engine_retained: Option<EngineRetainedPayload>,
}

/// Ids of engine-provided content a saved project kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineRetained {
    /// Retained engine song ids
    pub song_ids: Vec<i32>,
    /// Retained engine instrument ids
    pub instrument_ids: Vec<i32>,
    /// Retained engine sample ids
    pub sample_ids: Vec<i32>,
}

/// A loaded project IR, ready to merge over a freshly parsed base image.
#[derive(Debug, Clone)]
pub struct ProjectIr {
    /// Engine the project was authored against
    pub engine_name: String,
    /// Path of the base SPC, when one was recorded
    pub base_spc_path: Option<String>,
    /// Names of enabled engine extensions
    pub enabled_extensions: Vec<String>,
    /// Full user-provided songs
    pub user_songs: Vec<NspcSong>,
    /// Full user-provided instruments
    pub user_instruments: Vec<NspcInstrument>,
    /// Full user-provided samples
    pub user_samples: Vec<BrrSample>,
    /// Which engine content to keep
    pub engine_retained: EngineRetained,
}

fn song_to_payload(song: &NspcSong) -> SongPayload {
    SongPayload {
        song_id: song.song_id(),
        name: song.name.clone(),
        sequence: song.sequence().to_vec(),
        patterns: song.patterns().to_vec(),
        tracks: song
            .tracks()
            .iter()
            .map(|track| StreamPayload {
                id: track.id,
                original_addr: track.original_addr,
                events: BASE64.encode(pack_event_entries(&track.events)),
            })
            .collect(),
        subroutines: song
            .subroutines()
            .iter()
            .map(|sub| StreamPayload {
                id: sub.id,
                original_addr: sub.original_addr,
                events: BASE64.encode(pack_event_entries(&sub.events)),
            })
            .collect(),
    }
}

fn song_from_payload(payload: SongPayload, project: &NspcProject) -> Result<NspcSong> {
    let mut tracks = Vec::with_capacity(payload.tracks.len());
    for stream in payload.tracks {
        let bytes = BASE64
            .decode(stream.events.as_bytes())
            .map_err(|e| NspcError::InvalidInput(format!("Track {} events: {e}", stream.id)))?;
        tracks.push(Track {
            id: stream.id,
            events: unpack_event_entries(&bytes, &format!("Track {}", stream.id))?,
            original_addr: stream.original_addr,
        });
    }

    let mut subroutines = Vec::with_capacity(payload.subroutines.len());
    for stream in payload.subroutines {
        let bytes = BASE64
            .decode(stream.events.as_bytes())
            .map_err(|e| NspcError::InvalidInput(format!("Subroutine {} events: {e}", stream.id)))?;
        subroutines.push(Subroutine {
            id: stream.id,
            events: unpack_event_entries(&bytes, &format!("Subroutine {}", stream.id))?,
            original_addr: stream.original_addr,
        });
    }

    Ok(NspcSong::from_parts(
        payload.song_id,
        ContentOrigin::UserProvided,
        payload.name,
        payload.sequence,
        payload.patterns,
        tracks,
        subroutines,
        project.engine_config().command_map_or_default(),
    ))
}

/// Serialize a project's user content and retained-engine-content lists.
pub fn save_project_ir(project: &NspcProject, base_spc_path: Option<&str>) -> Result<String> {
    let engine = project.engine_config();

    let retained = EngineRetainedPayload {
        song_ids: project
            .songs()
            .iter()
            .filter(|song| !song.is_user_provided())
            .map(|song| song.song_id())
            .collect(),
        instrument_ids: project
            .instruments()
            .iter()
            .filter(|inst| inst.content_origin == Some(ContentOrigin::EngineProvided))
            .map(|inst| inst.id)
            .collect(),
        sample_ids: project
            .samples()
            .iter()
            .filter(|sample| sample.content_origin == Some(ContentOrigin::EngineProvided))
            .map(|sample| sample.id)
            .collect(),
    };

    let container = ProjectContainer {
        format: PROJECT_FORMAT_TAG.to_string(),
        version: PROJECT_FORMAT_VERSION,
        engine: engine.name.clone(),
        base_spc_path: base_spc_path.map(str::to_string),
        enabled_extensions: engine
            .extensions
            .iter()
            .filter(|extension| extension.enabled)
            .map(|extension| extension.name.clone())
            .collect(),
        songs: project
            .songs()
            .iter()
            .filter(|song| song.is_user_provided())
            .map(song_to_payload)
            .collect(),
        instruments: project
            .instruments()
            .iter()
            .filter(|inst| inst.content_origin == Some(ContentOrigin::UserProvided))
            .map(|inst| InstrumentPayload {
                id: inst.id,
                name: inst.name.clone(),
                sample_index: inst.sample_index,
                adsr1: inst.adsr1,
                adsr2: inst.adsr2,
                gain: inst.gain,
                base_pitch_mult: inst.base_pitch_mult,
                frac_pitch_mult: inst.frac_pitch_mult,
                percussion_note: inst.percussion_note,
                original_addr: inst.original_addr,
                song_id: inst.song_id,
            })
            .collect(),
        samples: project
            .samples()
            .iter()
            .filter(|sample| sample.content_origin == Some(ContentOrigin::UserProvided))
            .map(|sample| SamplePayload {
                id: sample.id,
                name: sample.name.clone(),
                original_addr: sample.original_addr,
                original_loop_addr: sample.original_loop_addr,
                data: BASE64.encode(&sample.data),
            })
            .collect(),
        engine_retained: Some(retained),
    };

    serde_json::to_string_pretty(&container)
        .map_err(|e| NspcError::InvalidInput(format!("Project serialization: {e}")))
}

/// Parse project IR text against the project's engine. Strict about the
/// format tag, version and the `engineRetained` payload.
pub fn load_project_ir(text: &str, project: &NspcProject) -> Result<ProjectIr> {
    let container: ProjectContainer = serde_json::from_str(text)
        .map_err(|e| NspcError::InvalidInput(format!("Project parse: {e}")))?;

    if container.format != PROJECT_FORMAT_TAG {
        return Err(NspcError::InvalidInput(format!(
            "Project format tag '{}' is not '{PROJECT_FORMAT_TAG}'",
            container.format
        )));
    }
    if container.version != PROJECT_FORMAT_VERSION {
        return Err(NspcError::InvalidInput(format!(
            "Unsupported project format version {} (expected {PROJECT_FORMAT_VERSION})",
            container.version
        )));
    }

    let engine = project.engine_config();
    if container.engine != engine.name {
        return Err(NspcError::EngineMismatch(format!(
            "Project declares engine '{}' but the loaded base is '{}'",
            container.engine, engine.name
        )));
    }

    let Some(retained) = container.engine_retained else {
        return Err(NspcError::InvalidInput(
            "Project is missing the engineRetained payload".into(),
        ));
    };

    let mut user_songs = Vec::with_capacity(container.songs.len());
    for payload in container.songs {
        user_songs.push(song_from_payload(payload, project)?);
    }

    let user_samples = container
        .samples
        .into_iter()
        .map(|payload| {
            let data = BASE64
                .decode(payload.data.as_bytes())
                .map_err(|e| NspcError::InvalidInput(format!("Sample {} data: {e}", payload.id)))?;
            Ok(BrrSample {
                id: payload.id,
                data,
                original_addr: payload.original_addr,
                original_loop_addr: payload.original_loop_addr,
                content_origin: Some(ContentOrigin::UserProvided),
                name: payload.name,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let user_instruments = container
        .instruments
        .into_iter()
        .map(|payload| NspcInstrument {
            id: payload.id,
            sample_index: payload.sample_index,
            adsr1: payload.adsr1,
            adsr2: payload.adsr2,
            gain: payload.gain,
            base_pitch_mult: payload.base_pitch_mult,
            frac_pitch_mult: payload.frac_pitch_mult,
            percussion_note: payload.percussion_note,
            original_addr: payload.original_addr,
            content_origin: Some(ContentOrigin::UserProvided),
            song_id: payload.song_id,
            name: payload.name,
        })
        .collect();

    Ok(ProjectIr {
        engine_name: container.engine,
        base_spc_path: container.base_spc_path,
        enabled_extensions: container.enabled_extensions,
        user_songs,
        user_instruments,
        user_samples,
        engine_retained: EngineRetained {
            song_ids: retained.song_ids,
            instrument_ids: retained.instrument_ids,
            sample_ids: retained.sample_ids,
        },
    })
}

impl ProjectIr {
    /// Merge this IR into a freshly parsed base project: drop engine
    /// content the project did not retain, append the user content and
    /// enable the recorded extensions.
    pub fn apply_to(self, project: &mut NspcProject) -> Result<()> {
        for name in &self.enabled_extensions {
            project.engine_config_mut().set_extension_enabled(name, true);
        }

        project.songs_mut().retain(|song| {
            song.is_user_provided() || self.engine_retained.song_ids.contains(&song.song_id())
        });
        project.instruments_mut().retain(|inst| {
            inst.content_origin != Some(ContentOrigin::EngineProvided)
                || self.engine_retained.instrument_ids.contains(&inst.id)
        });
        project.samples_mut().retain(|sample| {
            sample.content_origin != Some(ContentOrigin::EngineProvided)
                || self.engine_retained.sample_ids.contains(&sample.id)
        });

        project.songs_mut().extend(self.user_songs);
        project.instruments_mut().extend(self.user_instruments);
        project.samples_mut().extend(self.user_samples);

        project.refresh_aram_usage();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nspc::engine::EngineConfig;

    fn project() -> NspcProject {
        let mut aram = Box::new([0u8; 0x10000]);
        let writes: &[(u16, &[u8])] = &[
            (0x0400, &[0x00, 0x06, 0xFF, 0xFF]),
            (0x0600, &[0x00, 0x07, 0x00, 0x00]),
            (0x0700, &[0x00, 0x08]),
            (0x0800, &[0x08, 0x80, 0xEF, 0x00, 0x09, 0x02, 0x00]),
            (0x0900, &[0xC6, 0x00]),
        ];
        for (addr, data) in writes {
            let start = usize::from(*addr);
            aram[start..start + data.len()].copy_from_slice(data);
        }
        let engine = EngineConfig {
            id: "test".into(),
            name: "Test Engine".into(),
            song_index_pointers: 0x0400,
            ..Default::default()
        };
        NspcProject::new(engine, aram).unwrap()
    }

    #[test]
    fn test_packed_events_round_trip() {
        let entries = vec![
            EventEntry {
                id: 1,
                event: NspcEvent::Duration {
                    ticks: 8,
                    quantization: Some(7),
                    velocity: None,
                },
                original_addr: Some(0x0800),
            },
            EventEntry {
                id: 2,
                event: NspcEvent::Note { pitch: 0x12 },
                original_addr: None,
            },
            EventEntry {
                id: 3,
                event: NspcEvent::Vcmd(Vcmd::SubroutineCall {
                    sub_id: 4,
                    original_addr: 0x0900,
                    count: 3,
                }),
                original_addr: Some(0x0802),
            },
            EventEntry {
                id: 4,
                event: NspcEvent::Vcmd(Vcmd::Extension {
                    id: 0xFB,
                    param_count: 2,
                    params: [9, 8, 0, 0],
                }),
                original_addr: None,
            },
            EventEntry {
                id: 5,
                event: NspcEvent::End,
                original_addr: None,
            },
        ];

        let packed = pack_event_entries(&entries);
        let unpacked = unpack_event_entries(&packed, "Track 0").unwrap();
        assert_eq!(unpacked, entries);
    }

    #[test]
    fn test_varint_zigzag_round_trip() {
        for value in [0i64, 1, -1, 63, -64, 300, -300, i64::from(i32::MAX)] {
            let mut out = Vec::new();
            append_var_int(&mut out, value);
            let mut offset = 0;
            assert_eq!(read_var_int(&out, &mut offset), Some(value));
            assert_eq!(offset, out.len());
        }
    }

    #[test]
    fn test_save_load_round_trip() {
        let mut base = project();
        base.songs_mut()[0].set_content_origin(ContentOrigin::UserProvided);
        base.songs_mut()[0].name = "My Song".into();

        let text = save_project_ir(&base, Some("base.spc")).unwrap();
        let loaded = load_project_ir(&text, &base).unwrap();

        assert_eq!(loaded.engine_name, "Test Engine");
        assert_eq!(loaded.base_spc_path.as_deref(), Some("base.spc"));
        assert_eq!(loaded.user_songs.len(), 1);
        let song = &loaded.user_songs[0];
        assert_eq!(song.name, "My Song");
        assert_eq!(song.tracks().len(), 1);
        assert_eq!(song.subroutines().len(), 1);
        assert_eq!(
            song.tracks()[0].events,
            base.songs()[0].tracks()[0].events
        );
    }

    #[test]
    fn test_engine_mismatch_rejected() {
        let base = project();
        let text = save_project_ir(&base, None).unwrap().replace("Test Engine", "Other Engine");
        let err = load_project_ir(&text, &base).unwrap_err();
        assert!(matches!(err, NspcError::EngineMismatch(_)));
    }

    #[test]
    fn test_missing_engine_retained_rejected() {
        let base = project();
        let mut value: serde_json::Value =
            serde_json::from_str(&save_project_ir(&base, None).unwrap()).unwrap();
        value.as_object_mut().unwrap()["engineRetained"] = serde_json::Value::Null;
        let err = load_project_ir(&value.to_string(), &base).unwrap_err();
        assert!(err.to_string().contains("engineRetained"));
    }

    #[test]
    fn test_wrong_version_rejected() {
        let base = project();
        let text = save_project_ir(&base, None)
            .unwrap()
            .replace("\"version\": 4", "\"version\": 3");
        assert!(load_project_ir(&text, &base).is_err());
    }

    #[test]
    fn test_apply_drops_unretained_engine_content() {
        let mut base = project();
        // user copy of the song plus the retained engine original
        base.duplicate_song(0).unwrap();
        let text = save_project_ir(&base, None).unwrap();

        let mut fresh = project();
        let ir = load_project_ir(&text, &fresh).unwrap();
        assert_eq!(ir.engine_retained.song_ids, vec![0]);
        ir.apply_to(&mut fresh).unwrap();
        assert_eq!(fresh.songs().len(), 2);
        assert!(fresh.songs().iter().any(|s| s.is_user_provided()));
    }
}
