//! Song model and disassembler
//!
//! Recovers the sequence -> pattern -> track -> subroutine structure from a
//! raw ARAM image under an engine's command map, and owns the recovered
//! objects. Patterns reference tracks by id, sequence ops reference patterns
//! by id, calls reference subroutines by id; back-references are ids, never
//! owning pointers.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::command_map::CommandMap;
use super::engine::EngineConfig;
use super::event::{
    construct_vcmd, vcmd_param_byte_count, EventEntry, EventId, NspcEvent, Vcmd,
};
use crate::apu::AramView;
use crate::{NspcError, Result};

/// Where song content came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentOrigin {
    /// Parsed out of the engine's own ARAM image
    EngineProvided,
    /// Created or imported by the user
    UserProvided,
}

/// A jump destination: the resolved sequence-op index when known, plus the
/// raw ARAM address as a fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceTarget {
    /// Index into the sequence when resolvable
    pub index: Option<i32>,
    /// Raw target address
    pub addr: u16,
}

/// One sequence program step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SequenceOp {
    /// Play one pattern
    PlayPattern {
        /// Pattern id
        pattern_id: i32,
        /// Address of the pattern's track table when imported
        track_table_addr: u16,
    },
    /// Jump back `count` times, then fall through
    JumpTimes {
        /// Repeat count, 1..=0x7F
        count: u8,
        /// Destination
        target: SequenceTarget,
    },
    /// Unconditional jump (opcode 0x82..=0xFF)
    AlwaysJump {
        /// Raw opcode low byte
        opcode: u8,
        /// Destination
        target: SequenceTarget,
    },
    /// Fast-forward on
    FastForwardOn,
    /// Fast-forward off
    FastForwardOff,
    /// End of the song
    EndSequence,
}

impl SequenceOp {
    /// Encoded size of this op in sequence bytes.
    pub fn encoded_size(&self) -> u32 {
        match self {
            SequenceOp::JumpTimes { .. } | SequenceOp::AlwaysJump { .. } => 4,
            _ => 2,
        }
    }
}

/// Eight channel slots mapping to track ids; missing channels are silent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pattern {
    /// Pattern id
    pub id: i32,
    /// channel -> track id (-1 for silent), `None` for an empty pattern
    pub channel_track_ids: Option<[i32; 8]>,
    /// ARAM address of the track-pointer table when imported
    pub track_table_addr: u16,
}

/// A linear event stream driving one channel.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Track {
    /// Track id
    pub id: i32,
    /// Events in play order, ending with `End`
    pub events: Vec<EventEntry>,
    /// ARAM address the track was read from
    pub original_addr: u16,
}

/// A reusable slice of track events invoked by subroutine-call vcmds.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Subroutine {
    /// Subroutine id
    pub id: i32,
    /// Events, ending with `End`
    pub events: Vec<EventEntry>,
    /// ARAM address the body was read from (0 for extracted bodies)
    pub original_addr: u16,
}

/// Which list an [`EventRef`] points into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOwner {
    /// A track
    Track,
    /// A subroutine
    Subroutine,
}

/// Address of one event entry for point edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRef {
    /// Owning list kind
    pub owner: EventOwner,
    /// Track or subroutine id
    pub owner_id: i32,
    /// Index within the owner's event list
    pub event_index: usize,
    /// Expected event id; 0 skips the check
    pub event_id: EventId,
}

/// One song: sequence, patterns, tracks and subroutines.
#[derive(Debug, Clone)]
pub struct NspcSong {
    song_id: i32,
    content_origin: ContentOrigin,
    sequence: Vec<SequenceOp>,
    patterns: Vec<Pattern>,
    tracks: Vec<Track>,
    subroutines: Vec<Subroutine>,
    /// Display name; empty when untitled
    pub name: String,

    command_map: CommandMap,
    extension_param_count_by_id: BTreeMap<u8, u8>,

    track_addr_to_index: HashMap<u16, i32>,
    subroutine_addr_to_index: HashMap<u16, i32>,
    next_pattern_id: i32,
    next_track_id: i32,
    next_subroutine_id: i32,
    next_event_id: EventId,
    sequence_end_addr: u16,
    loop_pattern_index: Option<i32>,
}

fn next_event_id_for(tracks: &[Track], subroutines: &[Subroutine]) -> EventId {
    let mut next = 1;
    for track in tracks {
        for entry in &track.events {
            next = next.max(entry.id + 1);
        }
    }
    for subroutine in subroutines {
        for entry in &subroutine.events {
            next = next.max(entry.id + 1);
        }
    }
    next
}

impl NspcSong {
    /// Song id (its slot in the song index table).
    pub fn song_id(&self) -> i32 {
        self.song_id
    }

    /// Re-slot the song.
    pub fn set_song_id(&mut self, id: i32) {
        self.song_id = id;
    }

    /// Content origin tag.
    pub fn content_origin(&self) -> ContentOrigin {
        self.content_origin
    }

    /// Change the content origin tag.
    pub fn set_content_origin(&mut self, origin: ContentOrigin) {
        self.content_origin = origin;
    }

    /// True for user-created or user-claimed songs.
    pub fn is_user_provided(&self) -> bool {
        self.content_origin == ContentOrigin::UserProvided
    }

    /// The sequence program.
    pub fn sequence(&self) -> &[SequenceOp] {
        &self.sequence
    }

    /// Mutable sequence program.
    pub fn sequence_mut(&mut self) -> &mut Vec<SequenceOp> {
        &mut self.sequence
    }

    /// The patterns.
    pub fn patterns(&self) -> &[Pattern] {
        &self.patterns
    }

    /// Mutable patterns.
    pub fn patterns_mut(&mut self) -> &mut Vec<Pattern> {
        &mut self.patterns
    }

    /// The tracks.
    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    /// Mutable tracks.
    pub fn tracks_mut(&mut self) -> &mut Vec<Track> {
        &mut self.tracks
    }

    /// The subroutines.
    pub fn subroutines(&self) -> &[Subroutine] {
        &self.subroutines
    }

    /// Mutable subroutines.
    pub fn subroutines_mut(&mut self) -> &mut Vec<Subroutine> {
        &mut self.subroutines
    }

    /// The command map the song was parsed (and will be encoded) under.
    pub fn command_map(&self) -> &CommandMap {
        &self.command_map
    }

    /// Address just past the sequence data when imported.
    pub fn sequence_end_addr(&self) -> u16 {
        self.sequence_end_addr
    }

    /// Destination of the last resolved always-jump, if any.
    pub fn loop_pattern_index(&self) -> Option<i32> {
        self.loop_pattern_index
    }

    /// Allocate a fresh event id.
    pub fn allocate_event_id(&mut self) -> EventId {
        let id = self.next_event_id;
        self.next_event_id += 1;
        id
    }

    /// A minimal user song: one empty pattern played once.
    pub fn create_empty(song_id: i32) -> Self {
        NspcSong {
            song_id,
            content_origin: ContentOrigin::UserProvided,
            sequence: vec![
                SequenceOp::PlayPattern {
                    pattern_id: 0,
                    track_table_addr: 0,
                },
                SequenceOp::EndSequence,
            ],
            patterns: vec![Pattern {
                id: 0,
                channel_track_ids: Some([-1; 8]),
                track_table_addr: 0,
            }],
            tracks: Vec::new(),
            subroutines: Vec::new(),
            name: String::new(),
            command_map: CommandMap::default(),
            extension_param_count_by_id: BTreeMap::new(),
            track_addr_to_index: HashMap::new(),
            subroutine_addr_to_index: HashMap::new(),
            next_pattern_id: 1,
            next_track_id: 0,
            next_subroutine_id: 0,
            next_event_id: 1,
            sequence_end_addr: 0,
            loop_pattern_index: None,
        }
    }

    /// Rebuild a song from parts (project/file loading).
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        song_id: i32,
        content_origin: ContentOrigin,
        name: String,
        sequence: Vec<SequenceOp>,
        patterns: Vec<Pattern>,
        tracks: Vec<Track>,
        subroutines: Vec<Subroutine>,
        command_map: CommandMap,
    ) -> Self {
        let next_pattern_id = patterns.iter().map(|p| p.id + 1).max().unwrap_or(0);
        let next_track_id = tracks.iter().map(|t| t.id + 1).max().unwrap_or(0);
        let next_subroutine_id = subroutines.iter().map(|s| s.id + 1).max().unwrap_or(0);
        let next_event_id = next_event_id_for(&tracks, &subroutines);
        NspcSong {
            song_id,
            content_origin,
            sequence,
            patterns,
            tracks,
            subroutines,
            name,
            command_map,
            extension_param_count_by_id: BTreeMap::new(),
            track_addr_to_index: HashMap::new(),
            subroutine_addr_to_index: HashMap::new(),
            next_pattern_id,
            next_track_id,
            next_subroutine_id,
            next_event_id,
            sequence_end_addr: 0,
            loop_pattern_index: None,
        }
    }

    /// Disassemble song `song_index` from an ARAM image.
    pub fn disassemble(
        aram: &AramView<'_>,
        config: &EngineConfig,
        song_index: i32,
    ) -> Result<Self> {
        let mut song = NspcSong::create_empty(song_index);
        song.content_origin = ContentOrigin::EngineProvided;
        song.command_map = config.command_map_or_default();
        song.sequence.clear();
        song.patterns.clear();
        song.next_pattern_id = 0;

        for extension in &config.extensions {
            if !extension.enabled {
                continue;
            }
            for vcmd in &extension.vcmds {
                song.extension_param_count_by_id
                    .insert(vcmd.id, vcmd.param_count.min(4));
            }
        }

        let mut seq_pointer =
            aram.read16(config.song_index_pointers.wrapping_add(song_index as u16 * 2));
        if seq_pointer == 0 {
            return Err(NspcError::InvalidInput(format!(
                "Song {song_index} index entry holds a null sequence pointer"
            )));
        }

        let mut sequence_addr_to_index: HashMap<u16, i32> = HashMap::new();
        let mut pattern_addr_to_index: HashMap<u16, i32> = HashMap::new();

        // sequence walk
        loop {
            let op_addr = seq_pointer;
            sequence_addr_to_index.insert(op_addr, song.sequence.len() as i32);

            let seq_word = aram.read16(seq_pointer);

            if seq_word == 0x0000 {
                song.sequence.push(SequenceOp::EndSequence);
                song.sequence_end_addr = seq_pointer.wrapping_add(2);
                break;
            } else if seq_word & 0xFF00 == 0x0000 {
                let low = (seq_word & 0xFF) as u8;
                match low {
                    0x01..=0x7F => {
                        let jump_addr = aram.read16(seq_pointer.wrapping_add(2));
                        let index = sequence_addr_to_index.get(&jump_addr).copied();
                        song.sequence.push(SequenceOp::JumpTimes {
                            count: low,
                            target: SequenceTarget {
                                index,
                                addr: jump_addr,
                            },
                        });
                        seq_pointer = seq_pointer.wrapping_add(4);
                    }
                    0x80 => {
                        song.sequence.push(SequenceOp::FastForwardOn);
                        seq_pointer = seq_pointer.wrapping_add(2);
                    }
                    0x81 => {
                        song.sequence.push(SequenceOp::FastForwardOff);
                        seq_pointer = seq_pointer.wrapping_add(2);
                    }
                    _ => {
                        let jump_addr = aram.read16(seq_pointer.wrapping_add(2));
                        let index = sequence_addr_to_index.get(&jump_addr).copied();
                        song.sequence.push(SequenceOp::AlwaysJump {
                            opcode: low,
                            target: SequenceTarget {
                                index,
                                addr: jump_addr,
                            },
                        });
                        seq_pointer = seq_pointer.wrapping_add(4);
                    }
                }
            } else {
                let pattern_addr = seq_word;
                let pattern_id = match pattern_addr_to_index.get(&pattern_addr) {
                    Some(&id) => id,
                    None => {
                        let id = song.next_pattern_id;
                        song.next_pattern_id += 1;
                        pattern_addr_to_index.insert(pattern_addr, id);
                        id
                    }
                };
                song.sequence.push(SequenceOp::PlayPattern {
                    pattern_id,
                    track_table_addr: pattern_addr,
                });
                seq_pointer = seq_pointer.wrapping_add(2);
            }
        }

        // resolve jump targets now that every row address is known
        for op in &mut song.sequence {
            match op {
                SequenceOp::JumpTimes { target, .. } => {
                    if let Some(&index) = sequence_addr_to_index.get(&target.addr) {
                        target.index = Some(index);
                    }
                }
                SequenceOp::AlwaysJump { target, .. } => {
                    if let Some(&index) = sequence_addr_to_index.get(&target.addr) {
                        target.index = Some(index);
                        song.loop_pattern_index = Some(index);
                    }
                }
                _ => {}
            }
        }

        // patterns and their track pointers
        let mut pattern_entries: Vec<(u16, i32)> = pattern_addr_to_index.into_iter().collect();
        pattern_entries.sort_by_key(|&(_, id)| id);
        for (pattern_addr, pattern_id) in pattern_entries {
            song.parse_pattern(aram, pattern_addr, pattern_id);
        }

        // tracks sorted by address, each hard-stopped at the next track
        let mut track_entries: Vec<(u16, i32)> =
            song.track_addr_to_index.iter().map(|(&a, &i)| (a, i)).collect();
        track_entries.sort_by_key(|&(addr, _)| addr);

        for i in 0..track_entries.len() {
            let (track_addr, track_index) = track_entries[i];
            let hard_stop = track_entries.get(i + 1).map(|&(addr, _)| addr);
            song.parse_track(aram, track_addr, track_index, hard_stop)?;
        }

        // subroutines discovered while parsing tracks (and other
        // subroutines) until the worklist drains
        let mut parsed: HashSet<u16> = HashSet::new();
        loop {
            let mut pending: Vec<(u16, i32)> = song
                .subroutine_addr_to_index
                .iter()
                .filter(|(addr, _)| !parsed.contains(addr))
                .map(|(&a, &i)| (a, i))
                .collect();
            if pending.is_empty() {
                break;
            }
            pending.sort_by_key(|&(_, index)| index);

            for (sub_addr, sub_index) in pending {
                parsed.insert(sub_addr);
                let events = song.parse_events(aram, sub_addr, None)?.0;
                let slot = sub_index as usize;
                if slot >= song.subroutines.len() {
                    song.subroutines.resize_with(slot + 1, Subroutine::default);
                }
                song.subroutines[slot] = Subroutine {
                    id: sub_index,
                    events,
                    original_addr: sub_addr,
                };
            }
        }

        Ok(song)
    }

    fn parse_pattern(&mut self, aram: &AramView<'_>, pattern_addr: u16, pattern_id: i32) {
        let mut channel_track_ids = [-1i32; 8];

        for (channel, slot) in channel_track_ids.iter_mut().enumerate() {
            let track_addr = aram.read16(pattern_addr.wrapping_add(channel as u16 * 2));
            if track_addr == 0 {
                continue;
            }

            let track_id = match self.track_addr_to_index.get(&track_addr) {
                Some(&id) => id,
                None => {
                    let id = self.next_track_id;
                    self.next_track_id += 1;
                    self.track_addr_to_index.insert(track_addr, id);
                    id
                }
            };
            *slot = track_id;
        }

        let slot = pattern_id as usize;
        if slot >= self.patterns.len() {
            self.patterns.resize_with(slot + 1, || Pattern {
                id: 0,
                channel_track_ids: None,
                track_table_addr: 0,
            });
        }
        self.patterns[slot] = Pattern {
            id: pattern_id,
            channel_track_ids: Some(channel_track_ids),
            track_table_addr: pattern_addr,
        };
    }

    fn parse_track(
        &mut self,
        aram: &AramView<'_>,
        track_addr: u16,
        track_index: i32,
        hard_stop_exclusive: Option<u16>,
    ) -> Result<()> {
        if track_addr == 0 {
            return Ok(());
        }

        let slot = track_index as usize;
        if slot < self.tracks.len() && self.tracks[slot].original_addr == track_addr {
            return Ok(());
        }

        let (events, _end_addr) = self.parse_events(aram, track_addr, hard_stop_exclusive)?;

        if slot >= self.tracks.len() {
            self.tracks.resize_with(slot + 1, Track::default);
        }
        self.tracks[slot] = Track {
            id: track_index,
            events,
            original_addr: track_addr,
        };
        Ok(())
    }

    /// Parse an event stream starting at `start_addr`, stopping at End or at
    /// the exclusive hard-stop address. Returns the events and the address
    /// one past the consumed bytes.
    fn parse_events(
        &mut self,
        aram: &AramView<'_>,
        start_addr: u16,
        hard_stop_exclusive: Option<u16>,
    ) -> Result<(Vec<EventEntry>, u16)> {
        let mut events = Vec::new();
        let mut addr = u32::from(start_addr);
        let stop = hard_stop_exclusive.map(u32::from);

        loop {
            if let Some(stop) = stop {
                if addr >= stop {
                    break;
                }
            }
            if addr >= 0x10000 {
                break;
            }

            let event_addr = addr as u16;
            let byte = aram.read(event_addr);

            if byte == 0x00 {
                let id = self.allocate_event_id();
                events.push(EventEntry {
                    id,
                    event: NspcEvent::End,
                    original_addr: Some(event_addr),
                });
                addr += 1;
                break;
            } else if (0x01..=0x7F).contains(&byte) {
                // duration, optionally followed by a (q<<4)|v modifier that
                // is itself in the duration range
                addr += 1;
                let mut quantization = None;
                let mut velocity = None;
                let can_read_next = stop.map_or(addr < 0x10000, |s| addr < s);
                if can_read_next {
                    let next = aram.read(addr as u16);
                    if (0x01..=0x7F).contains(&next) {
                        quantization = Some((next >> 4) & 0x07);
                        velocity = Some(next & 0x0F);
                        addr += 1;
                    }
                }
                let id = self.allocate_event_id();
                events.push(EventEntry {
                    id,
                    event: NspcEvent::Duration {
                        ticks: byte,
                        quantization,
                        velocity,
                    },
                    original_addr: Some(event_addr),
                });
            } else if byte >= self.command_map.note_start && byte <= self.command_map.note_end {
                let pitch = byte - self.command_map.note_start;
                let id = self.allocate_event_id();
                events.push(EventEntry {
                    id,
                    event: NspcEvent::Note { pitch },
                    original_addr: Some(event_addr),
                });
                addr += 1;
            } else if byte == self.command_map.tie {
                let id = self.allocate_event_id();
                events.push(EventEntry {
                    id,
                    event: NspcEvent::Tie,
                    original_addr: Some(event_addr),
                });
                addr += 1;
            } else if byte >= self.command_map.rest_start && byte <= self.command_map.rest_end {
                let id = self.allocate_event_id();
                events.push(EventEntry {
                    id,
                    event: NspcEvent::Rest,
                    original_addr: Some(event_addr),
                });
                addr += 1;
            } else if byte >= self.command_map.percussion_start
                && byte <= self.command_map.percussion_end
            {
                let index = byte - self.command_map.percussion_start;
                let id = self.allocate_event_id();
                events.push(EventEntry {
                    id,
                    event: NspcEvent::Percussion { index },
                    original_addr: Some(event_addr),
                });
                addr += 1;
            } else if byte >= self.command_map.vcmd_start {
                let mapped = self.command_map.map_read_vcmd(byte).ok_or_else(|| {
                    NspcError::StrictMappingMiss(format!(
                        "Raw vcmd ${byte:02X} at ${event_addr:04X} has no read mapping"
                    ))
                })?;

                if let Some(&param_count) = self.extension_param_count_by_id.get(&mapped) {
                    let needed = 1 + u32::from(param_count);
                    if let Some(stop) = stop {
                        if addr + needed > stop {
                            break;
                        }
                    }
                    let mut params = [0u8; 4];
                    for (i, slot) in params.iter_mut().take(usize::from(param_count)).enumerate() {
                        *slot = aram.read((addr + 1 + i as u32) as u16);
                    }
                    addr += needed;
                    let id = self.allocate_event_id();
                    events.push(EventEntry {
                        id,
                        event: NspcEvent::Vcmd(Vcmd::Extension {
                            id: mapped,
                            param_count,
                            params,
                        }),
                        original_addr: Some(event_addr),
                    });
                    continue;
                }

                if mapped == 0xFF {
                    return Err(NspcError::InvariantViolation(format!(
                        "Unused vcmd ${mapped:02X} in track data at ${event_addr:04X}"
                    )));
                }
                if let Some(stop) = stop {
                    let needed = 1 + u32::from(vcmd_param_byte_count(mapped));
                    if addr + needed > stop {
                        break;
                    }
                }

                let mut cursor = event_addr;
                let vcmd = self.parse_vcmd(aram, &mut cursor)?;
                addr = u32::from(cursor);
                let id = self.allocate_event_id();
                events.push(EventEntry {
                    id,
                    event: NspcEvent::Vcmd(vcmd),
                    original_addr: Some(event_addr),
                });
            } else {
                // unclassifiable byte in the gap between ranges; skip
                addr += 1;
            }

            if addr < u32::from(start_addr) {
                break;
            }
        }

        Ok((events, addr as u16))
    }

    fn parse_vcmd(&mut self, aram: &AramView<'_>, addr: &mut u16) -> Result<Vcmd> {
        let raw = aram.read(*addr);
        *addr = addr.wrapping_add(1);
        let cmd = self.command_map.map_read_vcmd(raw).ok_or_else(|| {
            NspcError::StrictMappingMiss(format!("Raw vcmd ${raw:02X} has no read mapping"))
        })?;

        let mut take = || {
            let value = aram.read(*addr);
            *addr = addr.wrapping_add(1);
            value
        };

        match cmd {
            0xE0 => Ok(Vcmd::Inst { instrument: take() }),
            0xED => Ok(Vcmd::Volume { volume: take() }),
            0xEF => {
                let lo = take();
                let hi = take();
                let sub_addr = u16::from(lo) | u16::from(hi) << 8;
                let count = take();

                let sub_id = match self.subroutine_addr_to_index.get(&sub_addr) {
                    Some(&id) => id,
                    None => {
                        let id = self.next_subroutine_id;
                        self.next_subroutine_id += 1;
                        self.subroutine_addr_to_index.insert(sub_addr, id);
                        id
                    }
                };

                Ok(Vcmd::SubroutineCall {
                    sub_id,
                    original_addr: sub_addr,
                    count,
                })
            }
            0xFB => {
                let lo = take();
                let hi = take();
                Ok(Vcmd::Nop {
                    bytes: u16::from(lo) | u16::from(hi) << 8,
                })
            }
            _ => {
                let mut params = [0u8; 4];
                for slot in params
                    .iter_mut()
                    .take(usize::from(vcmd_param_byte_count(cmd)))
                {
                    *slot = take();
                }
                construct_vcmd(cmd, &params).ok_or_else(|| {
                    NspcError::InvariantViolation(format!("Unsupported vcmd ${cmd:02X}"))
                })
            }
        }
    }

    // ---- event addressing ----

    /// Resolve an event reference.
    pub fn resolve_event(&self, reference: &EventRef) -> Option<&NspcEvent> {
        self.resolve_entry(reference).map(|entry| &entry.event)
    }

    fn resolve_entry(&self, reference: &EventRef) -> Option<&EventEntry> {
        if reference.owner_id < 0 {
            return None;
        }
        let owner_index = reference.owner_id as usize;
        let (owner_id, events) = match reference.owner {
            EventOwner::Track => {
                let track = self.tracks.get(owner_index)?;
                (track.id, &track.events)
            }
            EventOwner::Subroutine => {
                let sub = self.subroutines.get(owner_index)?;
                (sub.id, &sub.events)
            }
        };
        if owner_id != reference.owner_id {
            return None;
        }
        let entry = events.get(reference.event_index)?;
        if reference.event_id != 0 && entry.id != reference.event_id {
            return None;
        }
        Some(entry)
    }

    /// Replace the event an [`EventRef`] points at. Returns false when the
    /// reference does not resolve.
    pub fn replace_event(&mut self, reference: &EventRef, replacement: NspcEvent) -> bool {
        if self.resolve_entry(reference).is_none() {
            return false;
        }
        let owner_index = reference.owner_id as usize;
        let entry = match reference.owner {
            EventOwner::Track => &mut self.tracks[owner_index].events[reference.event_index],
            EventOwner::Subroutine => {
                &mut self.subroutines[owner_index].events[reference.event_index]
            }
        };
        entry.event = replacement;
        true
    }

    /// Inline every subroutine call (count times, dropping the callee's
    /// trailing End) and clear the subroutine list.
    pub fn flatten_subroutines(&mut self) {
        if self.tracks.is_empty() {
            self.subroutines.clear();
            self.subroutine_addr_to_index.clear();
            self.next_subroutine_id = 0;
            return;
        }

        let mut next_id = next_event_id_for(&self.tracks, &self.subroutines);
        let subroutines = std::mem::take(&mut self.subroutines);

        for track in &mut self.tracks {
            let mut flat: Vec<EventEntry> = Vec::with_capacity(track.events.len());
            for entry in &track.events {
                if let NspcEvent::Vcmd(Vcmd::SubroutineCall { sub_id, count, .. }) = &entry.event {
                    if let Some(sub) = subroutines.iter().find(|s| s.id == *sub_id) {
                        for _ in 0..*count {
                            for (j, sub_entry) in sub.events.iter().enumerate() {
                                let is_trailing_end = j == sub.events.len() - 1
                                    && matches!(sub_entry.event, NspcEvent::End);
                                if is_trailing_end {
                                    continue;
                                }
                                let mut clone = sub_entry.clone();
                                clone.id = next_id;
                                next_id += 1;
                                flat.push(clone);
                            }
                        }
                        continue;
                    }
                }
                flat.push(entry.clone());
            }
            track.events = flat;
        }

        self.subroutine_addr_to_index.clear();
        self.next_subroutine_id = 0;
        self.next_event_id = next_id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aram_with(bytes: &[(u16, &[u8])]) -> Box<[u8; 0x10000]> {
        let mut aram = Box::new([0u8; 0x10000]);
        for (addr, data) in bytes {
            let start = usize::from(*addr);
            aram[start..start + data.len()].copy_from_slice(data);
        }
        aram
    }

    fn engine_at(song_index_pointers: u16) -> EngineConfig {
        EngineConfig {
            song_index_pointers,
            ..Default::default()
        }
    }

    #[test]
    fn test_disassemble_minimal_song() {
        // index -> sequence at 0x0600: play pattern 0x0700, end
        // pattern: channel 0 -> track 0x0800, rest silent
        // track: duration 8, note 0, end
        let mut aram = aram_with(&[
            (0x0400, &[0x00, 0x06]),
            (0x0600, &[0x00, 0x07, 0x00, 0x00]),
            (0x0800, &[0x08, 0x80, 0x00]),
        ]);
        aram[0x0700] = 0x00;
        aram[0x0701] = 0x08;
        let mut image = aram;
        let view = AramView::new(&mut image);
        let song = NspcSong::disassemble(&view, &engine_at(0x0400), 0).unwrap();

        assert_eq!(song.sequence().len(), 2);
        assert!(matches!(
            song.sequence()[0],
            SequenceOp::PlayPattern {
                pattern_id: 0,
                track_table_addr: 0x0700
            }
        ));
        assert_eq!(song.patterns().len(), 1);
        let channels = song.patterns()[0].channel_track_ids.unwrap();
        assert_eq!(channels[0], 0);
        assert!(channels[1..].iter().all(|&c| c == -1));

        let track = &song.tracks()[0];
        assert_eq!(track.events.len(), 3);
        assert!(matches!(
            track.events[0].event,
            NspcEvent::Duration {
                ticks: 8,
                quantization: None,
                velocity: None
            }
        ));
        assert!(matches!(track.events[1].event, NspcEvent::Note { pitch: 0 }));
        assert!(matches!(track.events[2].event, NspcEvent::End));
    }

    #[test]
    fn test_duration_qv_modifier_parsed() {
        // duration 0x18 followed by qv byte 0x7F -> q=7 v=15
        let mut image = aram_with(&[
            (0x0400, &[0x00, 0x06]),
            (0x0600, &[0x00, 0x07, 0x00, 0x00]),
            (0x0700, &[0x00, 0x08]),
            (0x0800, &[0x18, 0x7F, 0xC6, 0x00]),
        ]);
        let view = AramView::new(&mut image);
        let song = NspcSong::disassemble(&view, &engine_at(0x0400), 0).unwrap();
        let track = &song.tracks()[0];
        assert!(matches!(
            track.events[0].event,
            NspcEvent::Duration {
                ticks: 0x18,
                quantization: Some(7),
                velocity: Some(15)
            }
        ));
        assert!(matches!(track.events[1].event, NspcEvent::Tie));
    }

    #[test]
    fn test_jump_target_resolves_backwards() {
        // seq: pattern, always-jump back to row 0
        let mut image = aram_with(&[
            (0x0400, &[0x00, 0x06]),
            (0x0600, &[0x00, 0x07, 0xFF, 0x00, 0x00, 0x06, 0x00, 0x00]),
            (0x0700, &[0x00, 0x08]),
            (0x0800, &[0x00]),
        ]);
        let view = AramView::new(&mut image);
        let song = NspcSong::disassemble(&view, &engine_at(0x0400), 0).unwrap();
        match &song.sequence()[1] {
            SequenceOp::AlwaysJump { opcode, target } => {
                assert_eq!(*opcode, 0xFF);
                assert_eq!(target.index, Some(0));
                assert_eq!(target.addr, 0x0600);
            }
            other => panic!("expected AlwaysJump, got {other:?}"),
        }
        assert_eq!(song.loop_pattern_index(), Some(0));
    }

    #[test]
    fn test_subroutine_discovered_and_parsed() {
        // track calls subroutine at 0x0900 twice
        let mut image = aram_with(&[
            (0x0400, &[0x00, 0x06]),
            (0x0600, &[0x00, 0x07, 0x00, 0x00]),
            (0x0700, &[0x00, 0x08]),
            (0x0800, &[0xEF, 0x00, 0x09, 0x02, 0x00]),
            (0x0900, &[0x0C, 0x82, 0x00]),
        ]);
        let view = AramView::new(&mut image);
        let song = NspcSong::disassemble(&view, &engine_at(0x0400), 0).unwrap();

        assert_eq!(song.subroutines().len(), 1);
        let sub = &song.subroutines()[0];
        assert_eq!(sub.original_addr, 0x0900);
        assert!(matches!(sub.events.last().unwrap().event, NspcEvent::End));

        match &song.tracks()[0].events[0].event {
            NspcEvent::Vcmd(Vcmd::SubroutineCall {
                sub_id,
                original_addr,
                count,
            }) => {
                assert_eq!(*sub_id, 0);
                assert_eq!(*original_addr, 0x0900);
                assert_eq!(*count, 2);
            }
            other => panic!("expected SubroutineCall, got {other:?}"),
        }
    }

    #[test]
    fn test_hard_stop_contains_runaway_track() {
        // track 0 has no End before track 1 starts; the hard stop caps it
        let mut image = aram_with(&[
            (0x0400, &[0x00, 0x06]),
            (0x0600, &[0x00, 0x07, 0x00, 0x00]),
            (0x0700, &[0x00, 0x08, 0x04, 0x08]),
            (0x0800, &[0xC6, 0xC6, 0xC6, 0xC6]),
            (0x0804, &[0xC7, 0x00]),
        ]);
        let view = AramView::new(&mut image);
        let song = NspcSong::disassemble(&view, &engine_at(0x0400), 0).unwrap();
        assert_eq!(song.tracks()[0].events.len(), 4);
        assert!(song.tracks()[0]
            .events
            .iter()
            .all(|e| matches!(e.event, NspcEvent::Tie)));
        assert_eq!(song.tracks()[1].events.len(), 2);
    }

    #[test]
    fn test_strict_read_map_fails_disassembly() {
        let mut engine = engine_at(0x0400);
        let mut map = CommandMap::default();
        map.read_vcmd_map.insert(0xE0, 0xE0);
        map.strict_read_vcmd_map = true;
        engine.command_map = Some(map);

        let mut image = aram_with(&[
            (0x0400, &[0x00, 0x06]),
            (0x0600, &[0x00, 0x07, 0x00, 0x00]),
            (0x0700, &[0x00, 0x08]),
            (0x0800, &[0xE5, 0x40, 0x00]),
        ]);
        let view = AramView::new(&mut image);
        let err = NspcSong::disassemble(&view, &engine, 0).unwrap_err();
        assert!(matches!(err, NspcError::StrictMappingMiss(_)));
    }

    #[test]
    fn test_flatten_inlines_calls() {
        let mut image = aram_with(&[
            (0x0400, &[0x00, 0x06]),
            (0x0600, &[0x00, 0x07, 0x00, 0x00]),
            (0x0700, &[0x00, 0x08]),
            (0x0800, &[0x0C, 0xEF, 0x00, 0x09, 0x02, 0x00]),
            (0x0900, &[0x80, 0xC6, 0x00]),
        ]);
        let view = AramView::new(&mut image);
        let mut song = NspcSong::disassemble(&view, &engine_at(0x0400), 0).unwrap();
        song.flatten_subroutines();

        assert!(song.subroutines().is_empty());
        let kinds: Vec<&NspcEvent> = song.tracks()[0].events.iter().map(|e| &e.event).collect();
        // duration, then (note, tie) twice, then end
        assert_eq!(kinds.len(), 6);
        assert!(matches!(kinds[1], NspcEvent::Note { pitch: 0 }));
        assert!(matches!(kinds[2], NspcEvent::Tie));
        assert!(matches!(kinds[3], NspcEvent::Note { pitch: 0 }));
        assert!(matches!(kinds[4], NspcEvent::Tie));
        assert!(matches!(kinds[5], NspcEvent::End));
    }
}
