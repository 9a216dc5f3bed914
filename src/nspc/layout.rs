//! ARAM layout planning and upload building
//!
//! Bin-packs a song's sequence, patterns, tracks and subroutines into the
//! free ranges of ARAM, preferring addresses from the previous build so
//! stable objects stay put, then re-encodes everything against the final
//! addresses and emits (address, bytes) chunks.

use std::collections::{BTreeMap, HashMap};

use super::encode::{
    append_u16, encode_event_stream, encode_pattern, encode_sequence, pattern_pointer_mask,
    sequence_offsets, sequence_pointer_mask, stream_pointer_mask,
};
use super::optimize::{optimize_song_subroutines, OptimizerOptions};
use super::project::{is_relocatable_song_region, NspcProject, SongAddressLayout, ARAM_SIZE};
use super::song::{ContentOrigin, NspcSong};
use crate::{NspcError, Result};

/// One contiguous write to ARAM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadChunk {
    /// Destination address
    pub address: u16,
    /// Bytes to write
    pub bytes: Vec<u8>,
    /// Human-readable label for reports
    pub label: String,
}

/// An ordered list of upload chunks, consumed by overlaying.
#[derive(Debug, Clone, Default)]
pub struct Upload {
    /// Chunks in address order
    pub chunks: Vec<UploadChunk>,
}

/// Options for the song build pipeline.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Run the subroutine optimizer as a pre-pass
    pub optimize_subroutines: bool,
    /// Keep the optimized song in the project afterwards
    pub apply_optimized_song_to_project: bool,
    /// Ignore preferred addresses and pack from scratch
    pub compact_aram_layout: bool,
    /// Emit enabled engine-extension patch bytes with the upload
    pub include_engine_extensions: bool,
    /// Optimizer tuning
    pub optimizer_options: OptimizerOptions,
}

impl Default for BuildOptions {
    fn default() -> Self {
        BuildOptions {
            optimize_subroutines: false,
            apply_optimized_song_to_project: false,
            compact_aram_layout: false,
            include_engine_extensions: true,
            optimizer_options: OptimizerOptions::default(),
        }
    }
}

/// A finished build: the upload plus non-fatal notes.
#[derive(Debug, Clone)]
pub struct CompileOutput {
    /// The chunks to overlay
    pub upload: Upload,
    /// Clamps, fallbacks and other warnings
    pub warnings: Vec<String>,
}

/// Result of comparing a disassembled song against its source bytes.
#[derive(Debug, Clone, Default)]
pub struct RoundTripReport {
    /// True when no non-pointer byte differed
    pub equivalent: bool,
    /// Objects compared
    pub objects_compared: u32,
    /// Bytes compared
    pub bytes_compared: u64,
    /// Non-pointer byte differences
    pub differing_bytes: u64,
    /// Pointer byte differences ignored by the mask
    pub pointer_differences_ignored: u64,
    /// Per-difference messages (capped)
    pub messages: Vec<String>,
}

// ---- free-range arithmetic ----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AddressRange {
    from: u32, // inclusive
    to: u32,   // exclusive
}

fn add_clamped_range(ranges: &mut Vec<AddressRange>, from: u32, to: u32) {
    let from = from.min(ARAM_SIZE);
    let to = to.min(ARAM_SIZE);
    if to <= from {
        return;
    }
    ranges.push(AddressRange { from, to });
}

fn normalize_ranges(ranges: &mut Vec<AddressRange>) {
    if ranges.is_empty() {
        return;
    }

    ranges.sort_by_key(|range| range.from);

    let mut merged: Vec<AddressRange> = Vec::with_capacity(ranges.len());
    for &range in ranges.iter() {
        match merged.last_mut() {
            Some(current) if range.from <= current.to => {
                current.to = current.to.max(range.to);
            }
            _ => merged.push(range),
        }
    }

    *ranges = merged;
}

fn invert_ranges(blocked: &[AddressRange]) -> Vec<AddressRange> {
    let mut free = Vec::new();
    let mut cursor = 0u32;
    for range in blocked {
        if range.from > cursor {
            free.push(AddressRange {
                from: cursor,
                to: range.from,
            });
        }
        cursor = cursor.max(range.to);
    }
    if cursor < ARAM_SIZE {
        free.push(AddressRange {
            from: cursor,
            to: ARAM_SIZE,
        });
    }
    free
}

fn total_range_bytes(ranges: &[AddressRange]) -> u32 {
    ranges.iter().map(|range| range.to - range.from).sum()
}

fn consume_allocated_range(free: &mut Vec<AddressRange>, start: u32, size: u32) {
    let end = start + size;
    for i in 0..free.len() {
        let range = free[i];
        if start < range.from || end > range.to {
            continue;
        }

        if start == range.from && end == range.to {
            free.remove(i);
        } else if start == range.from {
            free[i].from = end;
        } else if end == range.to {
            free[i].to = start;
        } else {
            let tail = AddressRange {
                from: end,
                to: range.to,
            };
            free[i].to = start;
            free.insert(i + 1, tail);
        }
        return;
    }
}

fn allocate_from_free_ranges(
    free: &mut Vec<AddressRange>,
    size: u32,
    preferred_addr: Option<u16>,
) -> Option<u16> {
    if size == 0 || size > ARAM_SIZE {
        return None;
    }

    let fits_at = |free: &[AddressRange], start: u32| {
        let end = start + size;
        end <= ARAM_SIZE
            && free
                .iter()
                .any(|range| start >= range.from && end <= range.to)
    };

    if let Some(preferred) = preferred_addr {
        let start = u32::from(preferred);
        if fits_at(free, start) {
            consume_allocated_range(free, start, size);
            return Some(preferred);
        }
    }

    let start = free
        .iter()
        .find(|range| range.to - range.from >= size)
        .map(|range| range.from)?;
    consume_allocated_range(free, start, size);
    Some(start as u16)
}

// ---- allocation worklist ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum AllocObjectKind {
    Sequence,
    Pattern,
    Track,
    Subroutine,
}

#[derive(Debug, Clone)]
struct AllocRequest {
    kind: AllocObjectKind,
    id: i32,
    preferred_addr: Option<u16>,
    size: u32,
    label: String,
}

fn enabled_extension_patch_chunks(project: &NspcProject) -> Vec<UploadChunk> {
    let mut chunks = Vec::new();
    for extension in &project.engine_config().extensions {
        if !extension.enabled {
            continue;
        }
        for patch in &extension.patches {
            if patch.bytes.is_empty() {
                continue;
            }
            chunks.push(UploadChunk {
                address: patch.address,
                bytes: patch.bytes.clone(),
                label: format!("Ext {} {}", extension.name, patch.name),
            });
        }
    }
    chunks
}

fn sort_chunks_by_address(chunks: &mut [UploadChunk], stable: bool) {
    if stable {
        chunks.sort_by_key(|chunk| chunk.address);
    } else {
        chunks.sort_unstable_by_key(|chunk| chunk.address);
    }
}

fn validate_chunk_bounds_and_overlap(chunks: &[UploadChunk], detailed: bool) -> Result<()> {
    for (i, chunk) in chunks.iter().enumerate() {
        let chunk_end = u32::from(chunk.address) + chunk.bytes.len() as u32;
        if chunk_end > ARAM_SIZE {
            return Err(NspcError::CapacityExceeded(format!(
                "Upload chunk {} at ${:04X} exceeds ARAM bounds",
                chunk.label, chunk.address
            )));
        }
        if i == 0 {
            continue;
        }

        let prev = &chunks[i - 1];
        let prev_end = u32::from(prev.address) + prev.bytes.len() as u32;
        if u32::from(chunk.address) < prev_end {
            if detailed {
                let prev_end_display = if prev.bytes.is_empty() {
                    prev.address
                } else {
                    (prev_end - 1).min(0xFFFF) as u16
                };
                return Err(NspcError::InvariantViolation(format!(
                    "Upload chunks overlap: {} ends at ${:04X}, {} starts at ${:04X}",
                    prev.label, prev_end_display, chunk.label, chunk.address
                )));
            }
            return Err(NspcError::InvariantViolation(format!(
                "Upload chunks overlap: {} at ${:04X} and {} at ${:04X}",
                prev.label, prev.address, chunk.label, chunk.address
            )));
        }
    }
    Ok(())
}

impl NspcProject {
    /// Plan and encode one song into an upload, persisting the resolved
    /// layout for the next build.
    pub fn build_song_upload(
        &mut self,
        song_index: usize,
        options: BuildOptions,
    ) -> Result<CompileOutput> {
        if song_index >= self.songs().len() {
            return Err(NspcError::InvalidInput(format!(
                "Song index {song_index} is out of range"
            )));
        }

        let engine = self.engine_config().clone();
        let mut song = self.songs()[song_index].clone();
        if song.sequence().is_empty() {
            return Err(NspcError::InvalidInput(
                "Selected song has an empty sequence".into(),
            ));
        }
        if engine.song_index_pointers == 0 {
            return Err(NspcError::InvalidInput(
                "Engine config has no song index pointer table".into(),
            ));
        }

        if options.optimize_subroutines {
            optimize_song_subroutines(&mut song, &options.optimizer_options);
        }
        let persist_optimized_song =
            options.optimize_subroutines && options.apply_optimized_song_to_project;

        let song_index_entry_addr =
            u32::from(engine.song_index_pointers) + song_index as u32 * 2;
        if song_index_entry_addr + 1 >= ARAM_SIZE {
            return Err(NspcError::InvalidInput(format!(
                "Song index {song_index} table entry is outside ARAM at ${:04X}",
                song_index_entry_addr & 0xFFFF
            )));
        }
        let song_index_entry_addr = song_index_entry_addr as u16;

        let song_id = song.song_id();

        // preferred sequence address: previous layout, else the live pointer
        let mut preferred_sequence_addr = None;
        if !options.compact_aram_layout {
            if let Some(layout) = self.song_address_layout(song_id) {
                if layout.sequence_addr != 0 {
                    preferred_sequence_addr = Some(layout.sequence_addr);
                }
            }
            if preferred_sequence_addr.is_none() {
                if let Some(live) = self.song_sequence_pointer(song_index) {
                    if live != 0 && live != 0xFFFF {
                        preferred_sequence_addr = Some(live);
                    }
                }
            }
        }

        let mut warnings = Vec::new();

        self.refresh_aram_usage();

        // blocked = everything except this song's relocatable bytes; the
        // null-pointer value at 0 is never handed out
        let mut blocked: Vec<AddressRange> = Vec::new();
        add_clamped_range(&mut blocked, 0, 1);
        for region in &self.aram_usage().regions {
            if is_relocatable_song_region(region, song_id) {
                continue;
            }
            add_clamped_range(&mut blocked, u32::from(region.from), region.to);
        }
        normalize_ranges(&mut blocked);
        let mut free_ranges = invert_ranges(&blocked);
        if free_ranges.is_empty() {
            return Err(NspcError::CapacityExceeded(
                "No writable ARAM ranges available for song-scoped upload".into(),
            ));
        }

        // addresses used for the sizing pass: previous layout, else import
        let active_layout = self.song_address_layout(song_id);
        let mut sizing_subroutine_addrs: HashMap<i32, u16> = HashMap::new();
        for subroutine in song.subroutines() {
            let mut addr = subroutine.original_addr;
            if let Some(layout) = active_layout {
                if let Some(&layout_addr) = layout.subroutine_addr_by_id.get(&subroutine.id) {
                    if layout_addr != 0 {
                        addr = layout_addr;
                    }
                }
            }
            sizing_subroutine_addrs.insert(subroutine.id, addr);
        }

        // size every object once; call sizes depend only on the pointer slot
        let mut track_size_by_id: HashMap<i32, u32> = HashMap::new();
        for track in song.tracks() {
            let mut sizing_warnings = Vec::new();
            let encoded = encode_event_stream(
                &track.events,
                &sizing_subroutine_addrs,
                &mut sizing_warnings,
                &engine,
            )
            .map_err(|e| NspcError::from(format!("Failed to encode track {}: {e}", track.id)))?;
            if encoded.is_empty() {
                warnings.push(format!(
                    "Track {} encoded to 0 bytes; forcing End marker",
                    track.id
                ));
            }
            track_size_by_id.insert(track.id, (encoded.len() as u32).max(1));
        }

        let mut subroutine_size_by_id: HashMap<i32, u32> = HashMap::new();
        for subroutine in song.subroutines() {
            let mut sizing_warnings = Vec::new();
            let encoded = encode_event_stream(
                &subroutine.events,
                &sizing_subroutine_addrs,
                &mut sizing_warnings,
                &engine,
            )
            .map_err(|e| {
                NspcError::from(format!("Failed to encode subroutine {}: {e}", subroutine.id))
            })?;
            if encoded.is_empty() {
                warnings.push(format!(
                    "Subroutine {} encoded to 0 bytes; forcing End marker",
                    subroutine.id
                ));
            }
            subroutine_size_by_id.insert(subroutine.id, (encoded.len() as u32).max(1));
        }

        let (_, mut sequence_size) = sequence_offsets(song.sequence());
        if sequence_size > ARAM_SIZE {
            return Err(NspcError::CapacityExceeded(
                "Sequence data exceeds ARAM addressable range".into(),
            ));
        }
        sequence_size = sequence_size.max(1);

        // allocation worklist
        let mut requests = Vec::with_capacity(
            1 + song.patterns().len() + song.tracks().len() + song.subroutines().len(),
        );
        requests.push(AllocRequest {
            kind: AllocObjectKind::Sequence,
            id: -1,
            preferred_addr: preferred_sequence_addr,
            size: sequence_size,
            label: format!("Song {song_index:02X} Sequence"),
        });

        for pattern in song.patterns() {
            let mut preferred = None;
            if !options.compact_aram_layout {
                if let Some(layout) = active_layout {
                    if let Some(&addr) = layout.pattern_addr_by_id.get(&pattern.id) {
                        if addr != 0 {
                            preferred = Some(addr);
                        }
                    }
                }
                if preferred.is_none() && pattern.track_table_addr != 0 {
                    preferred = Some(pattern.track_table_addr);
                }
            }
            requests.push(AllocRequest {
                kind: AllocObjectKind::Pattern,
                id: pattern.id,
                preferred_addr: preferred,
                size: 16,
                label: format!("Pattern {:02X} TrackTable", pattern.id),
            });
        }

        for track in song.tracks() {
            let size = *track_size_by_id
                .get(&track.id)
                .ok_or_else(|| NspcError::from(format!("Missing size estimate for track {}", track.id)))?;
            let mut preferred = None;
            if !options.compact_aram_layout {
                if let Some(layout) = active_layout {
                    if let Some(&addr) = layout.track_addr_by_id.get(&track.id) {
                        if addr != 0 {
                            preferred = Some(addr);
                        }
                    }
                }
                if preferred.is_none() && track.original_addr != 0 {
                    preferred = Some(track.original_addr);
                }
            }
            requests.push(AllocRequest {
                kind: AllocObjectKind::Track,
                id: track.id,
                preferred_addr: preferred,
                size,
                label: format!("Track {:02X}", track.id),
            });
        }

        for subroutine in song.subroutines() {
            let size = *subroutine_size_by_id.get(&subroutine.id).ok_or_else(|| {
                NspcError::from(format!("Missing size estimate for subroutine {}", subroutine.id))
            })?;
            let mut preferred = None;
            if !options.compact_aram_layout {
                if let Some(layout) = active_layout {
                    if let Some(&addr) = layout.subroutine_addr_by_id.get(&subroutine.id) {
                        if addr != 0 {
                            preferred = Some(addr);
                        }
                    }
                }
                if preferred.is_none() && subroutine.original_addr != 0 {
                    preferred = Some(subroutine.original_addr);
                }
            }
            requests.push(AllocRequest {
                kind: AllocObjectKind::Subroutine,
                id: subroutine.id,
                preferred_addr: preferred,
                size,
                label: format!("Subroutine {:02X}", subroutine.id),
            });
        }

        // preferred requests first (address ascending), then large first;
        // this biases towards stable addresses and packs big objects early
        requests.sort_by(|lhs, rhs| {
            rhs.preferred_addr
                .is_some()
                .cmp(&lhs.preferred_addr.is_some())
                .then_with(|| lhs.preferred_addr.cmp(&rhs.preferred_addr))
                .then_with(|| rhs.size.cmp(&lhs.size))
                .then_with(|| lhs.kind.cmp(&rhs.kind))
                .then_with(|| lhs.id.cmp(&rhs.id))
        });

        let mut sequence_addr = 0u16;
        let mut pattern_addr_by_id: HashMap<i32, u16> = HashMap::new();
        let mut track_addr_by_id: HashMap<i32, u16> = HashMap::new();
        let mut subroutine_addr_by_id: HashMap<i32, u16> = HashMap::new();

        for request in &requests {
            let allocated =
                allocate_from_free_ranges(&mut free_ranges, request.size, request.preferred_addr);
            let Some(address) = allocated else {
                let free_bytes = total_range_bytes(&free_ranges);
                let mut range_info = String::new();
                for range in &free_ranges {
                    range_info.push_str(&format!(
                        " ${:04X}-${:04X}({} bytes)",
                        range.from,
                        range.to,
                        range.to - range.from
                    ));
                }
                return Err(NspcError::CapacityExceeded(format!(
                    "Out of ARAM while allocating {} (needs {} bytes, {} bytes still free in {} ranges:{}); request exceeds ARAM capacity",
                    request.label,
                    request.size,
                    free_bytes,
                    free_ranges.len(),
                    range_info
                )));
            };

            match request.kind {
                AllocObjectKind::Sequence => sequence_addr = address,
                AllocObjectKind::Pattern => {
                    pattern_addr_by_id.insert(request.id, address);
                }
                AllocObjectKind::Track => {
                    track_addr_by_id.insert(request.id, address);
                }
                AllocObjectKind::Subroutine => {
                    subroutine_addr_by_id.insert(request.id, address);
                }
            }
        }

        if sequence_addr == 0 {
            return Err(NspcError::CapacityExceeded(
                "Failed to allocate sequence address".into(),
            ));
        }

        // emit chunks, re-encoding against the final addresses
        let mut upload = Upload::default();
        if options.include_engine_extensions {
            upload.chunks.extend(enabled_extension_patch_chunks(self));
        }

        let sequence_bytes =
            encode_sequence(song.sequence(), sequence_addr, &pattern_addr_by_id, &mut warnings);
        upload.chunks.push(UploadChunk {
            address: sequence_addr,
            bytes: sequence_bytes,
            label: format!("Song {song_index:02X} Sequence"),
        });

        for pattern in song.patterns() {
            let address = *pattern_addr_by_id.get(&pattern.id).ok_or_else(|| {
                NspcError::from(format!("Pattern {} was not allocated an address", pattern.id))
            })?;
            let channels = pattern.channel_track_ids.unwrap_or([-1; 8]);
            let bytes = encode_pattern(&channels, &track_addr_by_id, pattern.id, &mut warnings);
            upload.chunks.push(UploadChunk {
                address,
                bytes,
                label: format!("Pattern {:02X} TrackTable", pattern.id),
            });
        }

        for track in song.tracks() {
            let address = *track_addr_by_id.get(&track.id).ok_or_else(|| {
                NspcError::from(format!("Track {} was not allocated an address", track.id))
            })?;
            let mut bytes =
                encode_event_stream(&track.events, &subroutine_addr_by_id, &mut warnings, &engine)
                    .map_err(|e| NspcError::from(format!("Failed to encode track {}: {e}", track.id)))?;
            if bytes.is_empty() {
                bytes.push(0x00);
                warnings.push(format!("Track {} encoded to 0 bytes; inserted End marker", track.id));
            }
            upload.chunks.push(UploadChunk {
                address,
                bytes,
                label: format!("Track {:02X}", track.id),
            });
        }

        for subroutine in song.subroutines() {
            let address = *subroutine_addr_by_id.get(&subroutine.id).ok_or_else(|| {
                NspcError::from(format!(
                    "Subroutine {} was not allocated an address",
                    subroutine.id
                ))
            })?;
            let mut bytes = encode_event_stream(
                &subroutine.events,
                &subroutine_addr_by_id,
                &mut warnings,
                &engine,
            )
            .map_err(|e| {
                NspcError::from(format!("Failed to encode subroutine {}: {e}", subroutine.id))
            })?;
            if bytes.is_empty() {
                bytes.push(0x00);
                warnings.push(format!(
                    "Subroutine {} encoded to 0 bytes; inserted End marker",
                    subroutine.id
                ));
            }
            upload.chunks.push(UploadChunk {
                address,
                bytes,
                label: format!("Subroutine {:02X}", subroutine.id),
            });
        }

        let mut song_index_bytes = Vec::with_capacity(2);
        append_u16(&mut song_index_bytes, sequence_addr);
        upload.chunks.push(UploadChunk {
            address: song_index_entry_addr,
            bytes: song_index_bytes,
            label: format!("Song {song_index:02X} IndexPtr"),
        });

        sort_chunks_by_address(&mut upload.chunks, false);
        validate_chunk_bounds_and_overlap(&upload.chunks, true)?;

        let new_layout = SongAddressLayout {
            sequence_addr,
            pattern_addr_by_id,
            track_addr_by_id,
            subroutine_addr_by_id,
            track_size_by_id,
            subroutine_size_by_id,
        };
        if persist_optimized_song {
            self.songs_mut()[song_index] = song;
        }
        self.set_song_address_layout(song_id, new_layout);
        self.refresh_aram_usage();

        Ok(CompileOutput {
            upload,
            warnings,
        })
    }

    /// Build one upload covering all user-provided content: per-song uploads
    /// plus user instrument-table entries, percussion entries, sample
    /// directory entries, BRR bytes and enabled extension patches.
    pub fn build_user_content_upload(&mut self, options: BuildOptions) -> Result<Upload> {
        let mut upload = Upload::default();
        let mut has_user_content = false;

        let engine = self.engine_config().clone();
        let include_engine_extensions = options.include_engine_extensions;
        let song_build_options = BuildOptions {
            include_engine_extensions: false,
            ..options
        };

        let instrument_entry_size = engine.instrument_entry_size();
        let perc_entry_size = engine.percussion_entry_size();
        let is_smw_v00 = engine.is_smw_v00();
        let map = engine.command_map_or_default();
        let percussion_count = i32::from(map.percussion_max()) + 1;

        // give fresh user instruments their table slot up front so the
        // usage model blocks it during the per-song builds
        if engine.instrument_headers != 0 {
            for instrument in self.instruments_mut() {
                if instrument.content_origin != Some(ContentOrigin::UserProvided)
                    || instrument.id < 0
                    || instrument.original_addr != 0
                    || instrument.song_id.is_some()
                {
                    continue;
                }
                let address = u32::from(engine.instrument_headers)
                    + instrument.id as u32 * u32::from(instrument_entry_size);
                if address + u32::from(instrument_entry_size) <= ARAM_SIZE {
                    instrument.original_addr = address as u16;
                }
            }
        }
        self.refresh_aram_usage();

        for song_index in 0..self.songs().len() {
            if !self.songs()[song_index].is_user_provided() {
                continue;
            }

            let song_output = self
                .build_song_upload(song_index, song_build_options.clone())
                .map_err(|e| {
                    NspcError::from(format!("Failed to compile user song {song_index:02X}: {e}"))
                })?;
            has_user_content = true;
            upload.chunks.extend(song_output.upload.chunks);
        }

        for instrument in self.instruments() {
            if instrument.content_origin != Some(ContentOrigin::UserProvided) {
                continue;
            }
            // song-scoped custom instruments ride with their song's upload
            if instrument.song_id.is_some() {
                continue;
            }
            if engine.instrument_headers == 0 {
                return Err(NspcError::InvalidInput(
                    "Engine config has no instrument table for user-provided instruments".into(),
                ));
            }
            if instrument.id < 0 {
                return Err(NspcError::InvalidInput(
                    "User-provided instrument has a negative id".into(),
                ));
            }

            let address = u32::from(engine.instrument_headers)
                + instrument.id as u32 * u32::from(instrument_entry_size);
            if address + u32::from(instrument_entry_size) > ARAM_SIZE {
                return Err(NspcError::CapacityExceeded(format!(
                    "Instrument {:02X} table write at ${:04X} exceeds ARAM bounds",
                    instrument.id,
                    address & 0xFFFF
                )));
            }

            let mut bytes = Vec::with_capacity(usize::from(instrument_entry_size));
            bytes.push(instrument.sample_index);
            bytes.push(instrument.adsr1);
            bytes.push(instrument.adsr2);
            bytes.push(instrument.gain);
            bytes.push(instrument.base_pitch_mult);
            if instrument_entry_size >= 6 {
                bytes.push(instrument.frac_pitch_mult);
            }

            upload.chunks.push(UploadChunk {
                address: address as u16,
                bytes,
                label: format!("Instrument {:02X}", instrument.id),
            });

            if is_smw_v00
                && engine.percussion_headers != 0
                && instrument.id < percussion_count
            {
                let percussion_address = u32::from(engine.percussion_headers)
                    + instrument.id as u32 * u32::from(perc_entry_size);
                if percussion_address + u32::from(perc_entry_size) > ARAM_SIZE {
                    return Err(NspcError::CapacityExceeded(format!(
                        "Percussion instrument {:02X} write at ${:04X} exceeds ARAM bounds",
                        instrument.id,
                        percussion_address & 0xFFFF
                    )));
                }

                let mut percussion_bytes = Vec::with_capacity(usize::from(perc_entry_size));
                percussion_bytes.push(instrument.sample_index);
                percussion_bytes.push(instrument.adsr1);
                percussion_bytes.push(instrument.adsr2);
                percussion_bytes.push(instrument.gain);
                percussion_bytes.push(instrument.base_pitch_mult);
                if perc_entry_size >= 7 {
                    percussion_bytes.push(instrument.frac_pitch_mult);
                }
                percussion_bytes.push(instrument.percussion_note);

                upload.chunks.push(UploadChunk {
                    address: percussion_address as u16,
                    bytes: percussion_bytes,
                    label: format!("Percussion {:02X}", instrument.id),
                });
            }
            has_user_content = true;
        }

        // user samples: directory entries plus BRR payloads, with
        // exact-alias sharing and partial-overlap failure
        struct BrrRange<'a> {
            sample_id: i32,
            from: u16,
            to: u32,
            data: &'a [u8],
        }
        let mut user_ranges: Vec<BrrRange<'_>> = Vec::new();
        let range_end_display = |end_exclusive: u32| -> u16 {
            if end_exclusive == 0 {
                0
            } else {
                (end_exclusive - 1).min(0xFFFF) as u16
            }
        };

        for sample in self.samples() {
            if sample.content_origin != Some(ContentOrigin::UserProvided) {
                continue;
            }
            if sample.id < 0 {
                return Err(NspcError::InvalidInput(
                    "User-provided sample has a negative id".into(),
                ));
            }
            if sample.data.is_empty() {
                return Err(NspcError::InvalidInput(format!(
                    "User sample {:02X} has empty BRR data",
                    sample.id
                )));
            }
            if sample.original_addr == 0 {
                return Err(NspcError::InvalidInput(format!(
                    "User sample {:02X} has no ARAM start address",
                    sample.id
                )));
            }
            let sample_end = u32::from(sample.original_addr) + sample.data.len() as u32;
            if sample_end > ARAM_SIZE {
                return Err(NspcError::CapacityExceeded(format!(
                    "User sample {:02X} data at ${:04X} exceeds ARAM bounds",
                    sample.id, sample.original_addr
                )));
            }
            if engine.sample_headers == 0 {
                return Err(NspcError::InvalidInput(
                    "Engine config has no sample directory for user-provided samples".into(),
                ));
            }

            let directory_addr = u32::from(engine.sample_headers) + sample.id as u32 * 4;
            if directory_addr + 4 > ARAM_SIZE {
                return Err(NspcError::CapacityExceeded(format!(
                    "Sample {:02X} directory entry at ${:04X} exceeds ARAM bounds",
                    sample.id,
                    directory_addr & 0xFFFF
                )));
            }

            let mut directory_bytes = Vec::with_capacity(4);
            append_u16(&mut directory_bytes, sample.original_addr);
            append_u16(&mut directory_bytes, sample.original_loop_addr);
            upload.chunks.push(UploadChunk {
                address: directory_addr as u16,
                bytes: directory_bytes,
                label: format!("Sample {:02X} Directory", sample.id),
            });

            let mut skip_brr_upload = false;
            for existing in &user_ranges {
                let overlaps = u32::from(sample.original_addr) < existing.to
                    && u32::from(existing.from) < sample_end;
                if !overlaps {
                    continue;
                }

                let exact_alias = u32::from(sample.original_addr) == u32::from(existing.from)
                    && sample_end == existing.to
                    && sample.data == existing.data;
                if exact_alias {
                    skip_brr_upload = true;
                    break;
                }

                return Err(NspcError::InvariantViolation(format!(
                    "User sample {:02X} BRR at ${:04X}-${:04X} overlaps user sample {:02X} BRR at ${:04X}-${:04X}",
                    sample.id,
                    sample.original_addr,
                    range_end_display(sample_end),
                    existing.sample_id,
                    existing.from,
                    range_end_display(existing.to)
                )));
            }

            if !skip_brr_upload {
                upload.chunks.push(UploadChunk {
                    address: sample.original_addr,
                    bytes: sample.data.clone(),
                    label: format!("Sample {:02X} BRR", sample.id),
                });
                user_ranges.push(BrrRange {
                    sample_id: sample.id,
                    from: sample.original_addr,
                    to: sample_end,
                    data: &sample.data,
                });
            }
            has_user_content = true;
        }

        if include_engine_extensions {
            let extension_chunks = enabled_extension_patch_chunks(self);
            if !extension_chunks.is_empty() {
                has_user_content = true;
                upload.chunks.extend(extension_chunks);
            }
        }

        if !has_user_content {
            return Err(NspcError::InvalidInput(
                "Project has no user-provided content to export".into(),
            ));
        }

        sort_chunks_by_address(&mut upload.chunks, true);
        validate_chunk_bounds_and_overlap(&upload.chunks, false)?;

        Ok(upload)
    }

    /// Flatten a user-content upload into the N-SPC transfer stream:
    /// `[len u16][addr u16][bytes]`* terminated by a zero length and the
    /// engine entry point.
    pub fn build_user_content_export(&mut self, options: BuildOptions) -> Result<Vec<u8>> {
        let upload = self.build_user_content_upload(options)?;

        let mut byte_writes: BTreeMap<u32, u8> = BTreeMap::new();
        for chunk in &upload.chunks {
            for (i, &byte) in chunk.bytes.iter().enumerate() {
                byte_writes.insert(u32::from(chunk.address) + i as u32, byte);
            }
        }

        if byte_writes.is_empty() {
            return Err(NspcError::InvalidInput(
                "No bytes generated for user-content export".into(),
            ));
        }

        let mut output = Vec::with_capacity(byte_writes.len() + byte_writes.len() / 16 + 8);
        let mut iter = byte_writes.into_iter().peekable();
        while let Some((segment_start, first_byte)) = iter.next() {
            let mut segment = vec![first_byte];
            let mut expected_next = segment_start + 1;
            while let Some(&(addr, byte)) = iter.peek() {
                if addr != expected_next || segment.len() >= 0xFFFF {
                    break;
                }
                segment.push(byte);
                expected_next += 1;
                iter.next();
            }

            append_u16(&mut output, segment.len() as u16);
            append_u16(&mut output, (segment_start & 0xFFFF) as u16);
            output.extend_from_slice(&segment);
        }

        append_u16(&mut output, 0x0000);
        let entry = self.engine_config().entry_point;
        append_u16(&mut output, entry);
        Ok(output)
    }

    /// Re-encode a freshly disassembled song against its source bytes,
    /// ignoring relocated pointer bytes.
    pub fn verify_song_round_trip(&self, song_index: usize) -> Result<RoundTripReport> {
        const MAX_MESSAGES: usize = 64;

        let songs = self.songs();
        if song_index >= songs.len() {
            return Err(NspcError::InvalidInput(format!(
                "Song index {song_index} is out of range"
            )));
        }
        let song: &NspcSong = &songs[song_index];
        let engine = self.engine_config();
        if engine.song_index_pointers == 0 {
            return Err(NspcError::InvalidInput(
                "Engine config has no song index pointer table".into(),
            ));
        }

        let sequence_addr = self
            .song_sequence_pointer(song_index)
            .filter(|&p| p != 0 && p != 0xFFFF)
            .ok_or_else(|| {
                NspcError::InvalidInput(
                    "Selected song has no valid sequence pointer in index table".into(),
                )
            })?;

        let mut report = RoundTripReport {
            equivalent: true,
            ..Default::default()
        };

        let pattern_addr_by_id: HashMap<i32, u16> = song
            .patterns()
            .iter()
            .map(|p| (p.id, p.track_table_addr))
            .collect();
        let track_addr_by_id: HashMap<i32, u16> = song
            .tracks()
            .iter()
            .map(|t| (t.id, t.original_addr))
            .collect();
        let subroutine_addr_by_id: HashMap<i32, u16> = song
            .subroutines()
            .iter()
            .map(|s| (s.id, s.original_addr))
            .collect();

        let read_original = |address: u16, size: usize, label: &str| -> Result<Vec<u8>> {
            let end = u32::from(address) + size as u32;
            if end > ARAM_SIZE {
                return Err(NspcError::InvalidInput(format!(
                    "{label} at ${address:04X} with size {size} exceeds ARAM bounds"
                )));
            }
            let start = usize::from(address);
            Ok(self.aram_bytes()[start..start + size].to_vec())
        };

        let compare =
            |label: String, original: &[u8], rebuilt: &[u8], mask: &[u8], report: &mut RoundTripReport| {
                report.objects_compared += 1;

                if original.len() != rebuilt.len() {
                    report.messages.push(format!(
                        "{label} size mismatch: original={} rebuilt={}",
                        original.len(),
                        rebuilt.len()
                    ));
                }

                let common = original.len().min(rebuilt.len());
                report.bytes_compared += common as u64;

                for i in 0..common {
                    if original[i] == rebuilt[i] {
                        continue;
                    }
                    if mask.get(i).copied().unwrap_or(0) != 0 {
                        report.pointer_differences_ignored += 1;
                        continue;
                    }
                    report.differing_bytes += 1;
                    if report.messages.len() < MAX_MESSAGES {
                        report.messages.push(format!(
                            "{label} +{i:04X}: {:02X} != {:02X}",
                            original[i], rebuilt[i]
                        ));
                    }
                }

                report.differing_bytes += original.len().abs_diff(rebuilt.len()) as u64;
            };

        // sequence
        let mut warnings = Vec::new();
        let mut rebuilt_sequence =
            encode_sequence(song.sequence(), sequence_addr, &pattern_addr_by_id, &mut warnings);
        if rebuilt_sequence.is_empty() {
            rebuilt_sequence.push(0x00);
        }
        let label = format!("Song {song_index:02X} Sequence");
        let original = read_original(sequence_addr, rebuilt_sequence.len(), &label)?;
        let mask = sequence_pointer_mask(song.sequence(), rebuilt_sequence.len());
        compare(label, &original, &rebuilt_sequence, &mask, &mut report);

        // patterns
        for pattern in song.patterns() {
            if pattern.track_table_addr == 0 {
                continue;
            }
            let channels = pattern.channel_track_ids.unwrap_or([-1; 8]);
            let mut warnings = Vec::new();
            let rebuilt = encode_pattern(&channels, &track_addr_by_id, pattern.id, &mut warnings);
            let label = format!("Pattern {:02X}", pattern.id);
            let original = read_original(pattern.track_table_addr, rebuilt.len(), &label)?;
            let mask = pattern_pointer_mask(rebuilt.len());
            compare(label, &original, &rebuilt, &mask, &mut report);
        }

        // tracks
        for track in song.tracks() {
            if track.original_addr == 0 {
                continue;
            }
            let mut warnings = Vec::new();
            let mut rebuilt =
                encode_event_stream(&track.events, &subroutine_addr_by_id, &mut warnings, engine)
                    .map_err(|e| {
                        NspcError::from(format!(
                            "Failed to encode track {:02X} during verification: {e}",
                            track.id
                        ))
                    })?;
            if rebuilt.is_empty() {
                rebuilt.push(0x00);
            }
            let label = format!("Track {:02X}", track.id);
            let original = read_original(track.original_addr, rebuilt.len(), &label)?;
            let mask = stream_pointer_mask(&track.events, rebuilt.len());
            compare(label, &original, &rebuilt, &mask, &mut report);
        }

        // subroutines
        for subroutine in song.subroutines() {
            if subroutine.original_addr == 0 {
                continue;
            }
            let mut warnings = Vec::new();
            let mut rebuilt = encode_event_stream(
                &subroutine.events,
                &subroutine_addr_by_id,
                &mut warnings,
                engine,
            )
            .map_err(|e| {
                NspcError::from(format!(
                    "Failed to encode subroutine {:02X} during verification: {e}",
                    subroutine.id
                ))
            })?;
            if rebuilt.is_empty() {
                rebuilt.push(0x00);
            }
            let label = format!("Subroutine {:02X}", subroutine.id);
            let original = read_original(subroutine.original_addr, rebuilt.len(), &label)?;
            let mask = stream_pointer_mask(&subroutine.events, rebuilt.len());
            compare(label, &original, &rebuilt, &mask, &mut report);
        }

        report.equivalent = report.differing_bytes == 0;
        report.messages.insert(
            0,
            format!(
                "Roundtrip {} | objects={} bytes={} diffs={} (ignored pointer diffs={})",
                if report.equivalent { "OK" } else { "FAILED" },
                report.objects_compared,
                report.bytes_compared,
                report.differing_bytes,
                report.pointer_differences_ignored
            ),
        );

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nspc::engine::EngineConfig;

    fn image_with(bytes: &[(u16, &[u8])]) -> Box<[u8; 0x10000]> {
        let mut aram = Box::new([0u8; 0x10000]);
        for (addr, data) in bytes {
            let start = usize::from(*addr);
            aram[start..start + data.len()].copy_from_slice(data);
        }
        aram
    }

    fn engine() -> EngineConfig {
        EngineConfig {
            id: "test".into(),
            name: "Test".into(),
            song_index_pointers: 0x0400,
            ..Default::default()
        }
    }

    fn song_image() -> Box<[u8; 0x10000]> {
        image_with(&[
            (0x0400, &[0x00, 0x06, 0xFF, 0xFF]),
            (0x0600, &[0x00, 0x07, 0x00, 0x00]),
            (0x0700, &[0x00, 0x08]),
            (0x0800, &[0x08, 0x80, 0xC6, 0x00]),
        ])
    }

    #[test]
    fn test_build_reuses_import_addresses() {
        let mut project = NspcProject::new(engine(), song_image()).unwrap();
        let output = project.build_song_upload(0, BuildOptions::default()).unwrap();

        let by_label: HashMap<&str, &UploadChunk> = output
            .upload
            .chunks
            .iter()
            .map(|c| (c.label.as_str(), c))
            .collect();

        assert_eq!(by_label["Song 00 Sequence"].address, 0x0600);
        assert_eq!(by_label["Pattern 00 TrackTable"].address, 0x0700);
        assert_eq!(by_label["Track 00"].address, 0x0800);
        assert_eq!(by_label["Song 00 IndexPtr"].bytes, vec![0x00, 0x06]);
        // rebuilt bytes match the source image
        assert_eq!(by_label["Track 00"].bytes, vec![0x08, 0x80, 0xC6, 0x00]);
    }

    #[test]
    fn test_chunks_sorted_and_disjoint() {
        let mut project = NspcProject::new(engine(), song_image()).unwrap();
        let output = project.build_song_upload(0, BuildOptions::default()).unwrap();
        let chunks = &output.upload.chunks;
        for pair in chunks.windows(2) {
            let prev_end = u32::from(pair[0].address) + pair[0].bytes.len() as u32;
            assert!(u32::from(pair[1].address) >= prev_end);
            assert!(prev_end <= 0x10000);
        }
    }

    #[test]
    fn test_compact_layout_ignores_preferred() {
        let mut project = NspcProject::new(engine(), song_image()).unwrap();
        let options = BuildOptions {
            compact_aram_layout: true,
            ..Default::default()
        };
        let output = project.build_song_upload(0, options).unwrap();
        let seq = output
            .upload
            .chunks
            .iter()
            .find(|c| c.label == "Song 00 Sequence")
            .unwrap();
        // packing starts at the low end of free space, not the old address
        assert!(seq.address < 0x0400);
        assert_ne!(seq.address, 0);
    }

    #[test]
    fn test_capacity_failure_reports_free_ranges() {
        let mut project = NspcProject::new(engine(), song_image()).unwrap();
        // a sequence of 20k jump ops cannot fit in 64 KiB
        let song = &mut project.songs_mut()[0];
        let sequence = song.sequence_mut();
        sequence.clear();
        for _ in 0..20_000 {
            sequence.push(crate::nspc::song::SequenceOp::JumpTimes {
                count: 2,
                target: crate::nspc::song::SequenceTarget {
                    index: Some(0),
                    addr: 0,
                },
            });
        }
        sequence.push(crate::nspc::song::SequenceOp::EndSequence);

        let err = project
            .build_song_upload(0, BuildOptions::default())
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("exceeds ARAM"), "message: {message}");
    }

    #[test]
    fn test_round_trip_clean_song_is_equivalent() {
        let project = NspcProject::new(engine(), song_image()).unwrap();
        let report = project.verify_song_round_trip(0).unwrap();
        assert!(report.equivalent, "report: {:?}", report.messages);
        assert!(report.objects_compared >= 3);
        assert_eq!(report.differing_bytes, 0);
    }

    #[test]
    fn test_user_content_export_format() {
        let mut project = NspcProject::new(engine(), song_image()).unwrap();
        project.songs_mut()[0].set_content_origin(ContentOrigin::UserProvided);
        let bytes = project
            .build_user_content_export(BuildOptions::default())
            .unwrap();
        // stream ends with zero length + entry point
        let tail = &bytes[bytes.len() - 4..];
        assert_eq!(&tail[0..2], &[0x00, 0x00]);
        // first segment header: [len][addr]
        let first_len = u16::from(bytes[0]) | u16::from(bytes[1]) << 8;
        assert!(first_len > 0);
    }

    #[test]
    fn test_user_upload_requires_user_content() {
        let mut project = NspcProject::new(engine(), song_image()).unwrap();
        let err = project
            .build_user_content_upload(BuildOptions::default())
            .unwrap_err();
        assert!(err.to_string().contains("no user-provided content"));
    }

    #[test]
    fn test_sample_alias_shares_chunk_and_partial_overlap_fails() {
        use crate::nspc::project::BrrSample;

        let mut base = engine();
        base.sample_headers = 0x0300;
        let mut project = NspcProject::new(base, song_image()).unwrap();
        project.songs_mut()[0].set_content_origin(ContentOrigin::UserProvided);

        let payload = vec![0x01, 0, 0, 0, 0, 0, 0, 0, 0];
        for id in 0..2 {
            project.samples_mut().push(BrrSample {
                id,
                data: payload.clone(),
                original_addr: 0x5000,
                original_loop_addr: 0x5000,
                content_origin: Some(ContentOrigin::UserProvided),
                name: String::new(),
            });
        }

        let upload = project
            .build_user_content_upload(BuildOptions::default())
            .unwrap();
        let brr_chunks = upload
            .chunks
            .iter()
            .filter(|c| c.label.contains("BRR"))
            .count();
        assert_eq!(brr_chunks, 1);

        // a partial overlap with different bytes must fail
        project.samples_mut().push(BrrSample {
            id: 2,
            data: vec![0x41, 1, 2, 3, 4, 5, 6, 7, 0x01, 0, 0, 0, 0, 0, 0, 0, 0, 0],
            original_addr: 0x5004,
            original_loop_addr: 0x5004,
            content_origin: Some(ContentOrigin::UserProvided),
            name: String::new(),
        });
        let err = project
            .build_user_content_upload(BuildOptions::default())
            .unwrap_err();
        assert!(err.to_string().contains("overlaps"));
    }
}
