//! Project container and ARAM usage model
//!
//! Owns the engine descriptor, the ARAM image and everything parsed out of
//! it: songs, instruments and samples. The per-byte ownership map is rebuilt
//! on demand by painting known regions over a fresh Free bitmap; the first
//! kind to claim a byte wins, so explicit reserves override everything.

use std::collections::{HashMap, HashSet};

use num_derive::FromPrimitive;

use super::command_map::CommandMap;
use super::engine::EngineConfig;
use super::event::{vcmd_param_byte_count, EventEntry};
use super::song::{ContentOrigin, NspcSong, SequenceOp};
use crate::apu::AramView;
use crate::Result;

pub(crate) const ARAM_SIZE: u32 = 0x10000;
const BRR_BLOCK_SIZE: u32 = 9;
const MAX_SAMPLE_DIRECTORY_ENTRIES: u32 = 64;
const MAX_INSTRUMENTS: u32 = 64;
const MAX_BRR_BLOCKS_PER_SAMPLE: u32 = 0x2000;
const MAX_SONG_ENTRIES: usize = 256;
const SEQUENCE_PROBE_LIMIT: u32 = 128;
const TRACK_PROBE_LIMIT: u32 = 16384;

/// What a byte of ARAM is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum AramRegionKind {
    /// Unclaimed
    Free,
    /// Engine-reserved (code, echo, workspace)
    Reserved,
    /// Song index pointer table
    SongIndexTable,
    /// Instrument table
    InstrumentTable,
    /// Sample directory
    SampleDirectory,
    /// BRR sample bytes
    SampleData,
    /// Song sequence bytes
    SequenceData,
    /// Pattern track-pointer tables
    PatternTable,
    /// Track event bytes
    TrackData,
    /// Subroutine event bytes
    SubroutineData,
}

/// One labelled region of ARAM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AramRegion {
    /// Region kind
    pub kind: AramRegionKind,
    /// Inclusive start
    pub from: u16,
    /// Exclusive end (clamped to the top of ARAM)
    pub to: u32,
    /// Owning song, -1 for global regions
    pub song_id: i32,
    /// Owning object within the song, -1 when not applicable
    pub object_id: i32,
    /// Display label
    pub label: String,
}

/// Aggregated ownership statistics plus the region list behind them.
#[derive(Debug, Clone, Default)]
pub struct AramUsage {
    /// Bytes not claimed by anything
    pub free_bytes: u32,
    /// Bytes in engine-reserved regions
    pub reserved_bytes: u32,
    /// Song index table bytes
    pub song_index_bytes: u32,
    /// Instrument table bytes
    pub instrument_bytes: u32,
    /// Sample directory bytes
    pub sample_directory_bytes: u32,
    /// BRR payload bytes
    pub sample_data_bytes: u32,
    /// Sequence bytes
    pub sequence_bytes: u32,
    /// Pattern table bytes
    pub pattern_table_bytes: u32,
    /// Track bytes
    pub track_bytes: u32,
    /// Subroutine bytes
    pub subroutine_bytes: u32,
    /// All regions, in paint order
    pub regions: Vec<AramRegion>,
}

/// A persisted song layout: where the last build placed each object.
#[derive(Debug, Clone, Default)]
pub struct SongAddressLayout {
    /// Sequence base address
    pub sequence_addr: u16,
    /// Pattern id -> address
    pub pattern_addr_by_id: HashMap<i32, u16>,
    /// Track id -> address
    pub track_addr_by_id: HashMap<i32, u16>,
    /// Subroutine id -> address
    pub subroutine_addr_by_id: HashMap<i32, u16>,
    /// Track id -> encoded size
    pub track_size_by_id: HashMap<i32, u32>,
    /// Subroutine id -> encoded size
    pub subroutine_size_by_id: HashMap<i32, u32>,
}

/// One instrument table entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NspcInstrument {
    /// Table index
    pub id: i32,
    /// Sample directory index (low 7 bits; bit 7 is the noise flag)
    pub sample_index: u8,
    /// ADSR byte 1
    pub adsr1: u8,
    /// ADSR byte 2
    pub adsr2: u8,
    /// GAIN byte
    pub gain: u8,
    /// Pitch multiplier, integer part
    pub base_pitch_mult: u8,
    /// Pitch multiplier, fractional part (6-byte entries only)
    pub frac_pitch_mult: u8,
    /// Percussion note (SMW v0.0 percussion entries)
    pub percussion_note: u8,
    /// Table address the entry was read from, 0 for fresh entries
    pub original_addr: u16,
    /// Who owns the entry
    pub content_origin: Option<ContentOrigin>,
    /// Owning song for per-song custom instruments
    pub song_id: Option<i32>,
    /// Display name
    pub name: String,
}

/// One BRR sample and its directory entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrrSample {
    /// Sample directory index
    pub id: i32,
    /// BRR payload
    pub data: Vec<u8>,
    /// Sample start address
    pub original_addr: u16,
    /// Loop point address
    pub original_loop_addr: u16,
    /// Who owns the sample
    pub content_origin: Option<ContentOrigin>,
    /// Display name
    pub name: String,
}

fn default_content_origin(id: i32, engine_ids: &[i32], has_explicit: bool) -> ContentOrigin {
    if id < 0 {
        return ContentOrigin::UserProvided;
    }
    if !has_explicit {
        return ContentOrigin::EngineProvided;
    }
    if engine_ids.binary_search(&id).is_ok() {
        ContentOrigin::EngineProvided
    } else {
        ContentOrigin::UserProvided
    }
}

fn parse_brr_sample(
    aram: &AramView<'_>,
    sample_start: u16,
    max_end_exclusive: u32,
    allow_extended_range: bool,
) -> Option<Vec<u8>> {
    if sample_start == 0 {
        return None;
    }
    let max_end = max_end_exclusive.min(ARAM_SIZE);
    if u32::from(sample_start) >= max_end {
        return None;
    }

    let mut bytes = Vec::with_capacity(9 * 8);
    let mut addr = u32::from(sample_start);
    for _ in 0..MAX_BRR_BLOCKS_PER_SAMPLE {
        if addr + BRR_BLOCK_SIZE > max_end {
            return None;
        }

        let header = aram.read(addr as u16);
        let range = header >> 4;
        if !allow_extended_range && range > 0x0C {
            // not a plausible BRR block
            return None;
        }

        for i in 0..BRR_BLOCK_SIZE {
            bytes.push(aram.read((addr + i) as u16));
        }

        addr += BRR_BLOCK_SIZE;
        if header & 0x01 != 0 {
            return Some(bytes);
        }
    }

    None
}

// ---- song pointer probing ----

fn is_likely_track_lead_byte(byte: u8, map: &CommandMap, engine: &EngineConfig) -> bool {
    if byte == 0x00 || (0x01..=0x7F).contains(&byte) {
        return true;
    }
    if byte >= map.note_start && byte <= map.note_end {
        return true;
    }
    if byte == map.tie {
        return true;
    }
    if byte >= map.rest_start && byte <= map.rest_end {
        return true;
    }
    if byte >= map.percussion_start && byte <= map.percussion_end {
        return true;
    }
    if byte < map.vcmd_start {
        return false;
    }
    let Some(mapped) = map.map_read_vcmd(byte) else {
        return false;
    };
    if engine.extension_vcmd_param_count(mapped, true).is_some() {
        return true;
    }
    mapped != 0xFF
}

fn probe_track_stream(
    aram: &AramView<'_>,
    track_addr: u16,
    map: &CommandMap,
    engine: &EngineConfig,
) -> bool {
    let mut addr = u32::from(track_addr);
    for _ in 0..TRACK_PROBE_LIMIT {
        if addr >= ARAM_SIZE {
            return false;
        }
        let byte = aram.read(addr as u16);

        if byte == 0x00 {
            return true;
        }

        if (0x01..=0x7F).contains(&byte) {
            addr += 1;
            if addr >= ARAM_SIZE {
                return false;
            }
            let maybe_qv = aram.read(addr as u16);
            if (0x01..=0x7F).contains(&maybe_qv) {
                addr += 1;
            }
            continue;
        }

        if (byte >= map.note_start && byte <= map.note_end)
            || byte == map.tie
            || (byte >= map.rest_start && byte <= map.rest_end)
            || (byte >= map.percussion_start && byte <= map.percussion_end)
        {
            addr += 1;
            continue;
        }

        if byte >= map.vcmd_start {
            let Some(mapped) = map.map_read_vcmd(byte) else {
                return false;
            };

            let needed = if let Some(count) = engine.extension_vcmd_param_count(mapped, true) {
                1 + u32::from(count)
            } else {
                if mapped == 0xFF {
                    return false;
                }
                1 + u32::from(vcmd_param_byte_count(mapped))
            };

            if addr + needed > ARAM_SIZE {
                return false;
            }
            addr += needed;
            continue;
        }

        return false;
    }

    false
}

fn find_first_track_pointer(aram: &AramView<'_>, sequence_ptr: u16) -> Option<Option<u16>> {
    let mut seq_addr = u32::from(sequence_ptr);
    for _ in 0..SEQUENCE_PROBE_LIMIT {
        if seq_addr + 1 >= ARAM_SIZE {
            return None;
        }
        let seq_word = aram.read16(seq_addr as u16);

        if seq_word == 0x0000 {
            return None;
        }

        if seq_word & 0xFF00 == 0 {
            let low = (seq_word & 0xFF) as u8;
            if (0x01..=0x7F).contains(&low) || low >= 0x82 {
                seq_addr += 4;
            } else {
                seq_addr += 2;
            }
            continue;
        }

        let pattern_addr = seq_word;
        if u32::from(pattern_addr) + 15 >= ARAM_SIZE {
            return None;
        }
        for channel in 0..8u16 {
            let track_addr = aram.read16(pattern_addr + channel * 2);
            if track_addr != 0 {
                return Some(Some(track_addr));
            }
        }
        // a pattern with no active tracks can still be a valid song
        return Some(None);
    }

    None
}

/// Probe whether a sequence pointer plausibly heads a song: trace the
/// sequence to the first track and classify its lead bytes.
pub(crate) fn is_likely_song_pointer(
    aram: &AramView<'_>,
    sequence_ptr: u16,
    map: &CommandMap,
    engine: &EngineConfig,
) -> bool {
    if sequence_ptr == 0 || sequence_ptr == 0xFFFF {
        return false;
    }
    if u32::from(sequence_ptr) + 1 >= ARAM_SIZE {
        return false;
    }

    let Some(first_track_addr) = find_first_track_pointer(aram, sequence_ptr) else {
        return false;
    };
    let Some(track_addr) = first_track_addr else {
        return true;
    };
    let first_byte = aram.read(track_addr);
    if !is_likely_track_lead_byte(first_byte, map, engine) {
        return false;
    }
    probe_track_stream(aram, track_addr, map, engine)
}

fn instrument_table_scan_end(config: &EngineConfig, entry_size: u8) -> u32 {
    if config.instrument_headers == 0 {
        return 0;
    }

    let table_start = u32::from(config.instrument_headers);
    let mut scan_end = ARAM_SIZE.min(table_start + MAX_INSTRUMENTS * u32::from(entry_size));

    let mut clamp_end = |candidate: u16| {
        let c = u32::from(candidate);
        if c > table_start && c < scan_end {
            scan_end = c;
        }
    };

    clamp_end(config.song_index_pointers);
    clamp_end(config.sample_headers);
    clamp_end(config.percussion_headers);
    for region in &config.reserved {
        clamp_end(region.from);
    }

    scan_end
}

fn referenced_sample_ids(aram: &AramView<'_>, config: &EngineConfig) -> HashSet<i32> {
    let mut referenced = HashSet::new();
    if config.instrument_headers == 0 {
        return referenced;
    }

    let entry_size = config.instrument_entry_size();
    let scan_end = instrument_table_scan_end(config, entry_size);
    let mut addr = u32::from(config.instrument_headers);
    let mut seen_non_empty = false;
    for _ in 0..MAX_INSTRUMENTS {
        if addr + u32::from(entry_size) > scan_end {
            break;
        }
        let fields: Vec<u8> = (0..entry_size)
            .map(|i| aram.read((addr + u32::from(i)) as u16))
            .collect();
        let sample_index = fields[0];

        if seen_non_empty && (sample_index == 0x00 || sample_index == 0xFF) {
            break;
        }

        let all_ff = fields.iter().all(|&b| b == 0xFF);
        let all_zero = fields.iter().all(|&b| b == 0x00);
        if !all_ff && !all_zero {
            seen_non_empty = true;
            referenced.insert(i32::from(sample_index & 0x7F));
        }

        addr += u32::from(entry_size);
    }

    referenced
}

fn parse_samples_from_aram(aram: &AramView<'_>, config: &EngineConfig) -> Vec<BrrSample> {
    let mut samples = Vec::new();
    if config.sample_headers == 0 {
        return samples;
    }

    // directory entries are 4 bytes: start address, loop address
    struct DirEntry {
        index: u32,
        start: u16,
        loop_point: u16,
    }

    let mut entries = Vec::new();
    let mut sample_starts = Vec::new();
    for index in 0..MAX_SAMPLE_DIRECTORY_ENTRIES {
        let dir_addr = u32::from(config.sample_headers) + index * 4;
        if dir_addr + 3 >= ARAM_SIZE {
            break;
        }

        let start = aram.read16(dir_addr as u16);
        let loop_point = aram.read16((dir_addr + 2) as u16);
        entries.push(DirEntry {
            index,
            start,
            loop_point,
        });

        if start != 0 && start != 0xFFFF && start >= 0x0200 {
            sample_starts.push(start);
        }
    }

    sample_starts.sort_unstable();
    sample_starts.dedup();
    let referenced = referenced_sample_ids(aram, config);
    let mut parsed_ids = HashSet::new();

    let mut push_sample = |samples: &mut Vec<BrrSample>, entry: &DirEntry, data: Vec<u8>| {
        samples.push(BrrSample {
            id: entry.index as i32,
            data,
            original_addr: entry.start,
            original_loop_addr: entry.loop_point,
            content_origin: Some(default_content_origin(
                entry.index as i32,
                &config.default_engine_provided_sample_ids,
                config.has_default_engine_provided_samples,
            )),
            name: String::new(),
        });
    };

    for entry in &entries {
        if entry.start == 0 || entry.start == 0xFFFF || entry.start < 0x0200 {
            continue;
        }

        // clip at the next directory start so runaway payloads don't
        // swallow their neighbors
        let parse_limit = sample_starts
            .iter()
            .find(|&&s| s > entry.start)
            .map_or(ARAM_SIZE, |&s| u32::from(s));

        let Some(bytes) = parse_brr_sample(aram, entry.start, parse_limit, false) else {
            continue;
        };
        push_sample(&mut samples, entry, bytes);
        parsed_ids.insert(entry.index as i32);
    }

    // fallback pass: instrument-referenced entries rejected only by the
    // clipping heuristics retry without it
    for entry in &entries {
        let id = entry.index as i32;
        if !referenced.contains(&id) || parsed_ids.contains(&id) {
            continue;
        }
        if entry.start == 0 || entry.start == 0xFFFF || entry.start < 0x0200 {
            continue;
        }

        let Some(bytes) = parse_brr_sample(aram, entry.start, ARAM_SIZE, true) else {
            continue;
        };
        push_sample(&mut samples, entry, bytes);
        parsed_ids.insert(id);
    }

    samples.sort_by_key(|sample| sample.id);
    samples
}

fn parse_instruments_from_aram(
    aram: &AramView<'_>,
    config: &EngineConfig,
    samples: &[BrrSample],
) -> Vec<NspcInstrument> {
    let mut instruments = Vec::new();
    if config.instrument_headers == 0 {
        return instruments;
    }

    let entry_size = config.instrument_entry_size();
    let scan_end = instrument_table_scan_end(config, entry_size);

    // entries: sample index (bit 7 = noise), ADSR1, ADSR2, GAIN, pitch
    // multiplier, fractional pitch multiplier (6-byte formats)
    let global_table_limit = config
        .custom_instrument_start_index
        .map_or(MAX_INSTRUMENTS as i32, i32::from);

    let mut addr = u32::from(config.instrument_headers);
    let mut seen_non_empty = false;
    for inst_id in 0..global_table_limit {
        if addr + u32::from(entry_size) > scan_end {
            break;
        }

        let sample_index = aram.read(addr as u16);
        let adsr1 = aram.read((addr + 1) as u16);
        let adsr2 = aram.read((addr + 2) as u16);
        let gain = aram.read((addr + 3) as u16);
        let base_pitch = aram.read((addr + 4) as u16);
        let frac_pitch = if entry_size >= 6 {
            aram.read((addr + 5) as u16)
        } else {
            0
        };

        let entry_addr = addr;
        addr += u32::from(entry_size);

        if seen_non_empty && (sample_index == 0x00 || sample_index == 0xFF) {
            break;
        }

        let all_ff = sample_index == 0xFF
            && adsr1 == 0xFF
            && adsr2 == 0xFF
            && gain == 0xFF
            && base_pitch == 0xFF
            && (entry_size < 6 || frac_pitch == 0xFF);
        let all_zero = sample_index == 0
            && adsr1 == 0
            && adsr2 == 0
            && gain == 0
            && base_pitch == 0
            && (entry_size < 6 || frac_pitch == 0);
        if all_ff || all_zero {
            continue;
        }

        seen_non_empty = true;

        let sample_id = i32::from(sample_index & 0x7F);
        if !samples.iter().any(|s| s.id == sample_id) {
            continue;
        }

        instruments.push(NspcInstrument {
            id: inst_id,
            sample_index: sample_index & 0x7F,
            adsr1,
            adsr2,
            gain,
            base_pitch_mult: base_pitch,
            frac_pitch_mult: frac_pitch,
            percussion_note: 0,
            original_addr: entry_addr as u16,
            content_origin: Some(default_content_origin(
                inst_id,
                &config.default_engine_provided_instrument_ids,
                config.has_default_engine_provided_instruments,
            )),
            song_id: None,
            name: String::new(),
        });
    }

    apply_percussion_table_notes(aram, config, &mut instruments);
    instruments
}

/// The "addmusick" variant places extra per-song instrument entries right
/// after each song's sequence data, all numbered from the custom-instrument
/// start index; the unique key is (song id, instrument id).
fn parse_extended_instruments(
    aram: &AramView<'_>,
    config: &EngineConfig,
    songs: &[NspcSong],
    samples: &[BrrSample],
    instruments: &mut Vec<NspcInstrument>,
) {
    const MAX_EXTENDED_INSTRUMENTS: u32 = 32;

    let entry_size = config.instrument_entry_size();

    let global_ids: HashSet<i32> = instruments
        .iter()
        .filter(|inst| inst.song_id.is_none())
        .map(|inst| inst.id)
        .collect();

    let custom_start_id = config.custom_instrument_start_index.map_or_else(
        || instruments.last().map_or(0, |inst| inst.id + 1),
        i32::from,
    );

    let mut parsed_keys: HashSet<(i32, i32)> = instruments
        .iter()
        .filter_map(|inst| inst.song_id.map(|song_id| (song_id, inst.id)))
        .collect();

    for song in songs {
        let seq_end = song.sequence_end_addr();
        if seq_end == 0 {
            continue;
        }

        let mut addr = u32::from(seq_end);
        let mut next_id = custom_start_id;

        for _ in 0..MAX_EXTENDED_INSTRUMENTS {
            if addr + u32::from(entry_size) > ARAM_SIZE {
                break;
            }

            let sample_index = aram.read(addr as u16);
            let adsr1 = aram.read((addr + 1) as u16);
            let adsr2 = aram.read((addr + 2) as u16);
            let gain = aram.read((addr + 3) as u16);
            let base_pitch = aram.read((addr + 4) as u16);
            let frac_pitch = if entry_size >= 6 {
                aram.read((addr + 5) as u16)
            } else {
                0
            };

            let all_ff = sample_index == 0xFF
                && adsr1 == 0xFF
                && adsr2 == 0xFF
                && gain == 0xFF
                && base_pitch == 0xFF
                && (entry_size < 6 || frac_pitch == 0xFF);
            let all_zero = sample_index == 0
                && adsr1 == 0
                && adsr2 == 0
                && gain == 0
                && base_pitch == 0
                && (entry_size < 6 || frac_pitch == 0);
            if all_ff || all_zero {
                break;
            }

            let sample_id = i32::from(sample_index & 0x7F);
            if !samples.iter().any(|s| s.id == sample_id) {
                break;
            }

            let entry_addr = addr;
            addr += u32::from(entry_size);
            let inst_id = next_id;
            next_id += 1;

            // never shadow a global instrument or re-add a saved one
            if global_ids.contains(&inst_id) || !parsed_keys.insert((song.song_id(), inst_id)) {
                continue;
            }

            instruments.push(NspcInstrument {
                id: inst_id,
                sample_index: sample_index & 0x7F,
                adsr1,
                adsr2,
                gain,
                base_pitch_mult: base_pitch,
                frac_pitch_mult: frac_pitch,
                percussion_note: 0,
                original_addr: entry_addr as u16,
                content_origin: Some(ContentOrigin::UserProvided),
                song_id: Some(song.song_id()),
                name: String::new(),
            });
        }
    }
}

/// SMW v0.0 percussion entries become instruments carrying their note.
fn apply_percussion_table_notes(
    aram: &AramView<'_>,
    config: &EngineConfig,
    instruments: &mut Vec<NspcInstrument>,
) {
    if !config.is_smw_v00() || config.percussion_headers == 0 {
        return;
    }

    let percussion_start_inst_id = (u32::from(
        config.percussion_headers.wrapping_sub(config.instrument_headers),
    ) / 5)
        .min(MAX_INSTRUMENTS) as i32;

    let map = config.command_map_or_default();
    let percussion_count = i32::from(map.percussion_max()) + 1;

    // cap entries so they don't overflow into custom instrument territory
    let max_entries = config.custom_instrument_start_index.map_or(
        percussion_count,
        |start| percussion_count.min(i32::from(start) - percussion_start_inst_id),
    );
    if max_entries <= 0 {
        return;
    }

    let entry_size = config.percussion_entry_size();

    for i in 0..max_entries {
        let entry_addr = u32::from(config.percussion_headers) + i as u32 * u32::from(entry_size);
        if entry_addr + u32::from(entry_size) > ARAM_SIZE {
            break;
        }

        let sample_index = aram.read(entry_addr as u16);
        let adsr1 = aram.read((entry_addr + 1) as u16);
        let adsr2 = aram.read((entry_addr + 2) as u16);
        let gain = aram.read((entry_addr + 3) as u16);
        let base_pitch = aram.read((entry_addr + 4) as u16);
        let frac_pitch = if entry_size >= 7 {
            aram.read((entry_addr + 5) as u16)
        } else {
            0
        };
        let note = aram.read((entry_addr + u32::from(entry_size) - 1) as u16);

        let all_ff = sample_index == 0xFF
            && adsr1 == 0xFF
            && adsr2 == 0xFF
            && gain == 0xFF
            && base_pitch == 0xFF
            && note == 0xFF;
        let all_zero = sample_index == 0
            && adsr1 == 0
            && adsr2 == 0
            && gain == 0
            && base_pitch == 0
            && note == 0;
        if all_ff || all_zero {
            continue;
        }

        let inst_id = percussion_start_inst_id + i;
        if inst_id >= MAX_INSTRUMENTS as i32 {
            break;
        }

        instruments.push(NspcInstrument {
            id: inst_id,
            sample_index,
            adsr1,
            adsr2,
            gain,
            base_pitch_mult: base_pitch,
            frac_pitch_mult: frac_pitch,
            percussion_note: note,
            original_addr: entry_addr as u16,
            content_origin: Some(default_content_origin(
                inst_id,
                &config.default_engine_provided_instrument_ids,
                config.has_default_engine_provided_instruments,
            )),
            song_id: None,
            name: String::new(),
        });
    }
}

/// A project: engine descriptor + ARAM image + everything parsed from them.
pub struct NspcProject {
    engine_config: EngineConfig,
    aram: Box<[u8; 0x10000]>,

    songs: Vec<NspcSong>,
    instruments: Vec<NspcInstrument>,
    samples: Vec<BrrSample>,
    aram_usage: AramUsage,
    song_address_layouts: HashMap<i32, SongAddressLayout>,
    parse_warnings: Vec<String>,
}

impl NspcProject {
    /// Build a project by parsing samples, songs and instruments out of an
    /// ARAM image under the given engine descriptor.
    pub fn new(mut config: EngineConfig, mut aram: Box<[u8; 0x10000]>) -> Result<Self> {
        for ids in [
            &mut config.default_engine_provided_song_ids,
            &mut config.default_engine_provided_instrument_ids,
            &mut config.default_engine_provided_sample_ids,
        ] {
            ids.sort_unstable();
            ids.dedup();
        }

        let mut parse_warnings = Vec::new();
        let (samples, songs, instruments) = {
            let view = AramView::new(&mut aram);
            let samples = parse_samples_from_aram(&view, &config);
            let songs = parse_songs_from_aram(&view, &config, &mut parse_warnings);
            let mut instruments = parse_instruments_from_aram(&view, &config, &samples);
            if config.engine_variant == "addmusick" {
                parse_extended_instruments(&view, &config, &songs, &samples, &mut instruments);
            }
            (samples, songs, instruments)
        };

        let mut project = NspcProject {
            engine_config: config,
            aram,
            songs,
            instruments,
            samples,
            aram_usage: AramUsage::default(),
            song_address_layouts: HashMap::new(),
            parse_warnings,
        };
        project.refresh_aram_usage();
        Ok(project)
    }

    /// The engine descriptor.
    pub fn engine_config(&self) -> &EngineConfig {
        &self.engine_config
    }

    /// Mutable engine descriptor.
    pub fn engine_config_mut(&mut self) -> &mut EngineConfig {
        &mut self.engine_config
    }

    /// View over the project's ARAM image.
    pub fn aram(&mut self) -> AramView<'_> {
        AramView::new(&mut self.aram)
    }

    /// Read-only bytes of the ARAM image.
    pub fn aram_bytes(&self) -> &[u8; 0x10000] {
        &self.aram
    }

    /// Parsed songs.
    pub fn songs(&self) -> &[NspcSong] {
        &self.songs
    }

    /// Mutable songs.
    pub fn songs_mut(&mut self) -> &mut Vec<NspcSong> {
        &mut self.songs
    }

    /// Parsed instruments.
    pub fn instruments(&self) -> &[NspcInstrument] {
        &self.instruments
    }

    /// Mutable instruments.
    pub fn instruments_mut(&mut self) -> &mut Vec<NspcInstrument> {
        &mut self.instruments
    }

    /// Parsed samples.
    pub fn samples(&self) -> &[BrrSample] {
        &self.samples
    }

    /// Mutable samples.
    pub fn samples_mut(&mut self) -> &mut Vec<BrrSample> {
        &mut self.samples
    }

    /// Current usage statistics (refresh with
    /// [`NspcProject::refresh_aram_usage`]).
    pub fn aram_usage(&self) -> &AramUsage {
        &self.aram_usage
    }

    /// Non-fatal notes collected while parsing the image.
    pub fn parse_warnings(&self) -> &[String] {
        &self.parse_warnings
    }

    /// Persisted layout for a song, if a build has run.
    pub fn song_address_layout(&self, song_id: i32) -> Option<&SongAddressLayout> {
        self.song_address_layouts.get(&song_id)
    }

    /// Persist a song layout.
    pub fn set_song_address_layout(&mut self, song_id: i32, layout: SongAddressLayout) {
        self.song_address_layouts.insert(song_id, layout);
    }

    /// Drop a song's persisted layout.
    pub fn clear_song_address_layout(&mut self, song_id: i32) {
        self.song_address_layouts.remove(&song_id);
    }

    // ---- song management ----

    /// Append an empty user song. Returns its index, or `None` when the
    /// song table is full.
    pub fn add_empty_song(&mut self) -> Option<usize> {
        if self.songs.len() >= MAX_SONG_ENTRIES {
            return None;
        }
        let index = self.songs.len();
        self.songs.push(NspcSong::create_empty(index as i32));
        self.refresh_aram_usage();
        Some(index)
    }

    /// Duplicate a song right after itself; the copy becomes user-provided.
    pub fn duplicate_song(&mut self, song_index: usize) -> Option<usize> {
        if self.songs.len() >= MAX_SONG_ENTRIES || song_index >= self.songs.len() {
            return None;
        }
        let mut duplicate = self.songs[song_index].clone();
        duplicate.set_content_origin(ContentOrigin::UserProvided);
        self.songs.insert(song_index + 1, duplicate);
        self.reindex_songs_and_layouts();
        self.refresh_aram_usage();
        Some(song_index + 1)
    }

    /// Remove a song, re-slotting the rest.
    pub fn remove_song(&mut self, song_index: usize) -> bool {
        if song_index >= self.songs.len() {
            return false;
        }
        self.songs.remove(song_index);
        self.reindex_songs_and_layouts();
        self.refresh_aram_usage();
        true
    }

    fn reindex_songs_and_layouts(&mut self) {
        let mut remapped = HashMap::new();
        let mut consumed = HashSet::new();

        for i in 0..self.songs.len() {
            let old_id = self.songs[i].song_id();
            let new_id = i as i32;
            self.songs[i].set_song_id(new_id);

            if !consumed.insert(old_id) {
                continue;
            }
            if let Some(layout) = self.song_address_layouts.remove(&old_id) {
                remapped.insert(new_id, layout);
            }
        }

        self.song_address_layouts = remapped;
    }

    // ---- usage model ----

    /// Rebuild the ownership map and statistics from current state.
    pub fn refresh_aram_usage(&mut self) {
        let mut regions: Vec<AramRegion> = Vec::new();
        self.collect_static_regions(&mut regions);
        self.collect_song_regions(&mut regions);

        // paint first-wins over a fresh Free map
        let mut ownership = vec![AramRegionKind::Free; ARAM_SIZE as usize];
        for region in &regions {
            for addr in u32::from(region.from)..region.to.min(ARAM_SIZE) {
                let cell = &mut ownership[addr as usize];
                if *cell == AramRegionKind::Free {
                    *cell = region.kind;
                }
            }
        }

        let mut usage = AramUsage {
            regions,
            ..Default::default()
        };
        for kind in &ownership {
            match kind {
                AramRegionKind::Free => usage.free_bytes += 1,
                AramRegionKind::Reserved => usage.reserved_bytes += 1,
                AramRegionKind::SongIndexTable => usage.song_index_bytes += 1,
                AramRegionKind::InstrumentTable => usage.instrument_bytes += 1,
                AramRegionKind::SampleDirectory => usage.sample_directory_bytes += 1,
                AramRegionKind::SampleData => usage.sample_data_bytes += 1,
                AramRegionKind::SequenceData => usage.sequence_bytes += 1,
                AramRegionKind::PatternTable => usage.pattern_table_bytes += 1,
                AramRegionKind::TrackData => usage.track_bytes += 1,
                AramRegionKind::SubroutineData => usage.subroutine_bytes += 1,
            }
        }

        self.aram_usage = usage;
    }

    fn collect_static_regions(&self, regions: &mut Vec<AramRegion>) {
        let config = &self.engine_config;

        for region in &config.reserved {
            if region.to <= region.from {
                continue;
            }
            push_region(
                regions,
                AramRegionKind::Reserved,
                u32::from(region.from),
                u32::from(region.to),
                if region.name.is_empty() {
                    "Reserved".to_string()
                } else {
                    region.name.clone()
                },
                -1,
                -1,
            );
        }

        if regions.is_empty() && !config.engine_bytes.is_empty() {
            let from = u32::from(config.entry_point);
            push_region(
                regions,
                AramRegionKind::Reserved,
                from,
                from + config.engine_bytes.len() as u32,
                "Engine".to_string(),
                -1,
                -1,
            );
        }

        if config.echo_buffer != 0 && config.echo_buffer_len > 0 {
            let echo_end = u32::from(config.echo_buffer);
            let echo_size = u32::from(config.echo_buffer_len);
            let echo_start = echo_end.saturating_sub(echo_size);
            push_region(
                regions,
                AramRegionKind::Reserved,
                echo_start,
                echo_end,
                "Echo buffer".to_string(),
                -1,
                -1,
            );
        }

        if config.song_index_pointers != 0 && !self.songs.is_empty() {
            let from = u32::from(config.song_index_pointers);
            push_region(
                regions,
                AramRegionKind::SongIndexTable,
                from,
                from + self.songs.len() as u32 * 2,
                "Song index table".to_string(),
                -1,
                -1,
            );
        }

        let entry_size = u32::from(config.instrument_entry_size());
        for inst in &self.instruments {
            if inst.original_addr == 0 {
                continue;
            }
            push_region(
                regions,
                AramRegionKind::InstrumentTable,
                u32::from(inst.original_addr),
                u32::from(inst.original_addr) + entry_size,
                format!("Inst {:02X}", inst.id),
                -1,
                inst.id,
            );
        }

        if config.sample_headers != 0 {
            for sample in &self.samples {
                let from = u32::from(config.sample_headers) + sample.id as u32 * 4;
                push_region(
                    regions,
                    AramRegionKind::SampleDirectory,
                    from,
                    from + 4,
                    format!("Sample {:02X} Header", sample.id),
                    -1,
                    sample.id,
                );
            }
        }

        for sample in &self.samples {
            if sample.original_addr == 0 || sample.data.is_empty() {
                continue;
            }
            push_region(
                regions,
                AramRegionKind::SampleData,
                u32::from(sample.original_addr),
                u32::from(sample.original_addr) + sample.data.len() as u32,
                format!("Sample {:02X} BRR", sample.id),
                -1,
                sample.id,
            );
        }
    }

    fn collect_song_regions(&self, regions: &mut Vec<AramRegion>) {
        for song in &self.songs {
            let song_id = song.song_id();
            let layout = self.song_address_layouts.get(&song_id);

            let sequence_addr = self.resolve_sequence_address(song_id, layout);
            if sequence_addr != 0 && sequence_addr != 0xFFFF {
                let seq_size: u32 = song.sequence().iter().map(|op| op.encoded_size()).sum();
                push_region(
                    regions,
                    AramRegionKind::SequenceData,
                    u32::from(sequence_addr),
                    u32::from(sequence_addr) + seq_size.max(1),
                    format!("Song {song_id:02X} Sequence"),
                    song_id,
                    -1,
                );
            }

            for pattern in song.patterns() {
                let pattern_addr = resolve_layout_address(
                    layout.map(|l| &l.pattern_addr_by_id),
                    pattern.id,
                    pattern.track_table_addr,
                );
                if pattern_addr == 0 {
                    continue;
                }
                push_region(
                    regions,
                    AramRegionKind::PatternTable,
                    u32::from(pattern_addr),
                    u32::from(pattern_addr) + 16,
                    format!("Song {song_id:02X} Pattern {:02X}", pattern.id),
                    song_id,
                    pattern.id,
                );
            }

            for track in song.tracks() {
                let track_addr = resolve_layout_address(
                    layout.map(|l| &l.track_addr_by_id),
                    track.id,
                    track.original_addr,
                );
                if track_addr == 0 {
                    continue;
                }
                let size = resolve_layout_size(
                    layout.map(|l| &l.track_size_by_id),
                    track.id,
                    stream_region_size(&track.events),
                );
                push_region(
                    regions,
                    AramRegionKind::TrackData,
                    u32::from(track_addr),
                    u32::from(track_addr) + size,
                    format!("Song {song_id:02X} Track {:02X}", track.id),
                    song_id,
                    track.id,
                );
            }

            let mut seen_subroutines = HashSet::new();
            for subroutine in song.subroutines() {
                let sub_addr = resolve_layout_address(
                    layout.map(|l| &l.subroutine_addr_by_id),
                    subroutine.id,
                    subroutine.original_addr,
                );
                if sub_addr == 0 {
                    continue;
                }
                let size = resolve_layout_size(
                    layout.map(|l| &l.subroutine_size_by_id),
                    subroutine.id,
                    stream_region_size(&subroutine.events),
                );
                seen_subroutines.insert(subroutine.id);
                push_region(
                    regions,
                    AramRegionKind::SubroutineData,
                    u32::from(sub_addr),
                    u32::from(sub_addr) + size,
                    format!("Song {song_id:02X} Sub {:02X}", subroutine.id),
                    song_id,
                    subroutine.id,
                );
            }

            // layout entries for subroutines the song no longer carries
            // still occupy their bytes until the next build
            if let Some(layout) = layout {
                for (&sub_id, &sub_addr) in &layout.subroutine_addr_by_id {
                    if sub_addr == 0 || seen_subroutines.contains(&sub_id) {
                        continue;
                    }
                    let size = resolve_layout_size(Some(&layout.subroutine_size_by_id), sub_id, 1);
                    push_region(
                        regions,
                        AramRegionKind::SubroutineData,
                        u32::from(sub_addr),
                        u32::from(sub_addr) + size,
                        format!("Song {song_id:02X} Sub {sub_id:02X}"),
                        song_id,
                        sub_id,
                    );
                }
            }
        }
    }

    pub(crate) fn resolve_sequence_address(
        &self,
        song_id: i32,
        layout: Option<&SongAddressLayout>,
    ) -> u16 {
        if let Some(layout) = layout {
            if layout.sequence_addr != 0 {
                return layout.sequence_addr;
            }
        }
        if self.engine_config.song_index_pointers == 0 {
            return 0;
        }
        let pointer_addr = u32::from(self.engine_config.song_index_pointers) + song_id as u32 * 2;
        if pointer_addr + 1 >= ARAM_SIZE {
            return 0;
        }
        let lo = self.aram[pointer_addr as usize];
        let hi = self.aram[(pointer_addr + 1) as usize];
        u16::from(lo) | u16::from(hi) << 8
    }

    /// Read the song-index pointer for a slot straight from the image.
    pub(crate) fn song_sequence_pointer(&self, song_index: usize) -> Option<u16> {
        if self.engine_config.song_index_pointers == 0 {
            return None;
        }
        let entry_addr = u32::from(self.engine_config.song_index_pointers) + song_index as u32 * 2;
        if entry_addr + 1 >= ARAM_SIZE {
            return None;
        }
        let lo = self.aram[entry_addr as usize];
        let hi = self.aram[(entry_addr + 1) as usize];
        Some(u16::from(lo) | u16::from(hi) << 8)
    }
}

fn parse_songs_from_aram(
    aram: &AramView<'_>,
    config: &EngineConfig,
    warnings: &mut Vec<String>,
) -> Vec<NspcSong> {
    let mut songs = Vec::new();
    if config.song_index_pointers == 0 {
        return songs;
    }

    let map = config.command_map_or_default();
    let mut discovered: HashSet<u16> = HashSet::new();

    for i in 0..MAX_SONG_ENTRIES {
        let entry_addr = u32::from(config.song_index_pointers) + i as u32 * 2;
        if entry_addr + 1 >= ARAM_SIZE {
            break;
        }

        let seq_ptr = aram.read16(entry_addr as u16);

        // sparse hole: skip but keep scanning
        if seq_ptr == 0 {
            continue;
        }
        // table terminator
        if seq_ptr == 0xFFFF {
            break;
        }
        // a pointer seen before means the table has ended
        if discovered.contains(&seq_ptr) {
            break;
        }

        if !is_likely_song_pointer(aram, seq_ptr, &map, config) {
            warnings.push(format!(
                "Stopped parsing songs at index {i:02X}: pointer ${seq_ptr:04X} is not a valid song"
            ));
            break;
        }

        match NspcSong::disassemble(aram, config, i as i32) {
            Ok(mut song) => {
                song.set_content_origin(default_content_origin(
                    song.song_id(),
                    &config.default_engine_provided_song_ids,
                    config.has_default_engine_provided_songs,
                ));
                collect_song_pointers(&song, seq_ptr, &mut discovered);
                songs.push(song);
            }
            Err(err) => {
                warnings.push(format!("Stopped parsing songs at index {i:02X}: {err}"));
                break;
            }
        }
    }

    songs
}

fn collect_song_pointers(song: &NspcSong, sequence_ptr: u16, pointers: &mut HashSet<u16>) {
    let mut insert = |pointer: u16| {
        if pointer != 0 && pointer != 0xFFFF {
            pointers.insert(pointer);
        }
    };

    insert(sequence_ptr);
    for op in song.sequence() {
        match op {
            SequenceOp::PlayPattern {
                track_table_addr, ..
            } => insert(*track_table_addr),
            SequenceOp::JumpTimes { target, .. } | SequenceOp::AlwaysJump { target, .. } => {
                insert(target.addr)
            }
            _ => {}
        }
    }
    for pattern in song.patterns() {
        insert(pattern.track_table_addr);
    }
    for track in song.tracks() {
        insert(track.original_addr);
    }
    for subroutine in song.subroutines() {
        insert(subroutine.original_addr);
    }
}

fn push_region(
    regions: &mut Vec<AramRegion>,
    kind: AramRegionKind,
    from: u32,
    to: u32,
    label: String,
    song_id: i32,
    object_id: i32,
) {
    let from = from.min(ARAM_SIZE);
    let to = to.min(ARAM_SIZE);
    if to <= from {
        return;
    }
    regions.push(AramRegion {
        kind,
        from: from as u16,
        to,
        song_id,
        object_id,
        label,
    });
}

fn resolve_layout_address(map: Option<&HashMap<i32, u16>>, object_id: i32, fallback: u16) -> u16 {
    if let Some(map) = map {
        if let Some(&addr) = map.get(&object_id) {
            if addr != 0 {
                return addr;
            }
        }
    }
    fallback
}

fn resolve_layout_size(map: Option<&HashMap<i32, u32>>, object_id: i32, fallback: u32) -> u32 {
    if let Some(map) = map {
        if let Some(&size) = map.get(&object_id) {
            if size > 0 {
                return size;
            }
        }
    }
    fallback
}

fn stream_region_size(events: &[EventEntry]) -> u32 {
    events
        .iter()
        .map(|entry| entry.event.encoded_size())
        .sum::<u32>()
        .max(1)
}

/// True when a region belongs to `song_id` and moves with its layout.
pub(crate) fn is_relocatable_song_region(region: &AramRegion, song_id: i32) -> bool {
    if region.song_id != song_id {
        return false;
    }
    matches!(
        region.kind,
        AramRegionKind::SequenceData
            | AramRegionKind::PatternTable
            | AramRegionKind::TrackData
            | AramRegionKind::SubroutineData
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_with(bytes: &[(u16, &[u8])]) -> Box<[u8; 0x10000]> {
        let mut aram = Box::new([0u8; 0x10000]);
        for (addr, data) in bytes {
            let start = usize::from(*addr);
            aram[start..start + data.len()].copy_from_slice(data);
        }
        aram
    }

    fn basic_engine() -> EngineConfig {
        EngineConfig {
            id: "test".into(),
            name: "Test".into(),
            song_index_pointers: 0x0400,
            ..Default::default()
        }
    }

    fn single_song_image() -> Box<[u8; 0x10000]> {
        image_with(&[
            (0x0400, &[0x00, 0x06, 0xFF, 0xFF]),
            (0x0600, &[0x00, 0x07, 0x00, 0x00]),
            (0x0700, &[0x00, 0x08]),
            (0x0800, &[0x08, 0x80, 0x00]),
        ])
    }

    #[test]
    fn test_project_parses_single_song() {
        let project = NspcProject::new(basic_engine(), single_song_image()).unwrap();
        assert_eq!(project.songs().len(), 1);
        assert_eq!(
            project.songs()[0].content_origin(),
            ContentOrigin::EngineProvided
        );
    }

    #[test]
    fn test_sparse_hole_skipped_invalid_pointer_stops() {
        // slot 0 valid, slot 1 sparse, slot 2 valid, slot 3 garbage
        let image = image_with(&[
            (0x0400, &[0x00, 0x06, 0x00, 0x00, 0x10, 0x06, 0x34, 0x12]),
            (0x0600, &[0x00, 0x07, 0x00, 0x00]),
            (0x0610, &[0x00, 0x07, 0x00, 0x00]),
            (0x0700, &[0x00, 0x08]),
            (0x0800, &[0x08, 0x80, 0x00]),
        ]);
        let project = NspcProject::new(basic_engine(), image).unwrap();
        assert_eq!(project.songs().len(), 2);
        assert_eq!(project.songs()[0].song_id(), 0);
        assert_eq!(project.songs()[1].song_id(), 2);
        assert!(!project.parse_warnings().is_empty());
    }

    #[test]
    fn test_sample_directory_parsing_with_clip() {
        let mut engine = basic_engine();
        engine.song_index_pointers = 0;
        engine.sample_headers = 0x0300;
        // two samples; the first's BRR would run away without the clip
        let mut image = image_with(&[(0x0300, &[0x00, 0x20, 0x00, 0x20, 0x09, 0x20, 0x09, 0x20])]);
        // sample 0 at 0x2000: one block WITHOUT end flag (invalid alone)
        image[0x2000] = 0x40;
        // sample 1 at 0x2009: one block with end flag
        image[0x2009] = 0x41;
        let project = NspcProject::new(engine, image).unwrap();
        // sample 0 fails (no end flag before the clip); sample 1 parses
        assert_eq!(project.samples().len(), 1);
        assert_eq!(project.samples()[0].id, 1);
        assert_eq!(project.samples()[0].data.len(), 9);
    }

    #[test]
    fn test_instruments_require_existing_sample() {
        let mut engine = basic_engine();
        engine.song_index_pointers = 0;
        engine.sample_headers = 0x0300;
        engine.instrument_headers = 0x0340;
        engine.instrument_entry_bytes = 6;
        let mut image = image_with(&[(0x0300, &[0x00, 0x20, 0x00, 0x20])]);
        image[0x2000] = 0x01; // end-flagged block
        // instrument 0 references sample 0 (exists)
        image[0x0340..0x0346].copy_from_slice(&[0x00, 0x8F, 0xE0, 0x00, 0x01, 0x00]);
        // instrument 1 references sample 5 (missing)
        image[0x0346..0x034C].copy_from_slice(&[0x05, 0x8F, 0xE0, 0x00, 0x01, 0x00]);
        let project = NspcProject::new(engine, image).unwrap();
        assert_eq!(project.instruments().len(), 1);
        assert_eq!(project.instruments()[0].id, 0);
        assert_eq!(project.instruments()[0].adsr1, 0x8F);
    }

    #[test]
    fn test_usage_paint_first_wins_and_is_idempotent() {
        let mut engine = basic_engine();
        engine.reserved = vec![super::super::engine::ReservedRegion {
            from: 0x0500,
            to: 0x0A00,
            name: "Engine".into(),
        }];
        let mut project = NspcProject::new(engine, single_song_image()).unwrap();

        project.refresh_aram_usage();
        let first = project.aram_usage().clone();
        project.refresh_aram_usage();
        let second = project.aram_usage();

        assert_eq!(first.free_bytes, second.free_bytes);
        assert_eq!(first.reserved_bytes, second.reserved_bytes);
        assert_eq!(first.track_bytes, second.track_bytes);
        // the reserve overlaps the song data; reserved wins the paint
        assert_eq!(first.reserved_bytes, 0x0A00 - 0x0500);
        assert_eq!(first.track_bytes, 0);
    }

    #[test]
    fn test_song_management_reindexes() {
        let mut project = NspcProject::new(basic_engine(), single_song_image()).unwrap();
        let added = project.add_empty_song().unwrap();
        assert_eq!(added, 1);
        assert!(project.songs()[1].is_user_provided());

        let dup = project.duplicate_song(0).unwrap();
        assert_eq!(dup, 1);
        assert_eq!(project.songs().len(), 3);
        assert!(project.songs()[1].is_user_provided());
        assert_eq!(project.songs()[2].song_id(), 2);

        assert!(project.remove_song(0));
        assert_eq!(project.songs().len(), 2);
        assert_eq!(project.songs()[0].song_id(), 0);
        assert_eq!(project.songs()[1].song_id(), 1);
    }

    #[test]
    fn test_echo_region_grows_down_from_end() {
        let mut engine = basic_engine();
        engine.song_index_pointers = 0;
        engine.echo_buffer = 0xF000;
        engine.echo_buffer_len = 0x0800;
        let mut project = NspcProject::new(engine, Box::new([0u8; 0x10000])).unwrap();
        project.refresh_aram_usage();
        let echo = project
            .aram_usage()
            .regions
            .iter()
            .find(|r| r.label == "Echo buffer")
            .unwrap();
        assert_eq!(echo.from, 0xE800);
        assert_eq!(echo.to, 0xF000);
    }
}
