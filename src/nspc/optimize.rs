//! Subroutine optimizer
//!
//! Mines repeated slices of track data into shared subroutines. Tracks are
//! flattened first, then each pass tokenizes the events into semantic
//! symbols, builds a suffix automaton over the concatenated stream, scores
//! repeat candidates by real byte savings and applies the best one; passes
//! repeat until nothing pays for itself or the iteration budget runs out.

use super::event::{hash_event_semantic, EventEntry, EventId, NspcEvent, Vcmd};
use super::song::{NspcSong, Subroutine};

// a call encodes as opcode + u16 addr + u8 count; a body adds its trailing End
const CALL_BYTES: u32 = 4;
const SUB_TERMINATOR_BYTES: u32 = 1;

/// Tuning knobs for the optimizer.
#[derive(Debug, Clone)]
pub struct OptimizerOptions {
    /// Rebuild-and-apply passes before giving up
    pub max_optimize_iterations: i32,
    /// Automaton states kept as candidates per pass
    pub top_candidates: i32,
    /// Upper bound on extracted body size in bytes
    pub max_candidate_bytes: u32,
    /// Runtime-cost proxy charged per count=1 call; raise it if playback
    /// load on the sound CPU becomes excessive
    pub single_iteration_call_penalty_bytes: i64,
    /// Allow count=1 calls at all
    pub allow_single_iteration_calls: bool,
}

impl Default for OptimizerOptions {
    fn default() -> Self {
        OptimizerOptions {
            max_optimize_iterations: 128,
            top_candidates: 2048,
            max_candidate_bytes: 2048,
            single_iteration_call_penalty_bytes: 4,
            allow_single_iteration_calls: true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct EffectiveOptions {
    max_optimize_iterations: i32,
    top_candidates: usize,
    max_candidate_bytes: u32,
    single_iteration_call_penalty_bytes: i64,
    allow_single_iteration_calls: bool,
}

fn effective_options(options: &OptimizerOptions) -> EffectiveOptions {
    EffectiveOptions {
        max_optimize_iterations: options.max_optimize_iterations.clamp(1, 4096),
        top_candidates: options.top_candidates.clamp(1, 16384) as usize,
        max_candidate_bytes: options.max_candidate_bytes.clamp(8, 32768),
        single_iteration_call_penalty_bytes: options
            .single_iteration_call_penalty_bytes
            .clamp(0, 256),
        allow_single_iteration_calls: options.allow_single_iteration_calls,
    }
}

fn is_subroutine_call(entry: &EventEntry) -> bool {
    matches!(
        entry.event,
        NspcEvent::Vcmd(Vcmd::SubroutineCall { .. })
    )
}

fn is_pitch_slide(entry: &EventEntry) -> bool {
    matches!(entry.event, NspcEvent::Vcmd(Vcmd::PitchSlideToNote { .. }))
}

fn is_bare_duration(entry: &EventEntry) -> bool {
    matches!(
        entry.event,
        NspcEvent::Duration {
            quantization: None,
            velocity: None,
            ..
        }
    )
}

fn slice_consumes_duration_ticks(events: &[EventEntry], start: usize, count: usize) -> bool {
    events
        .iter()
        .skip(start)
        .take(count)
        .any(|entry| entry.event.consumes_duration_ticks())
}

// ---- tokenized segments ----
//
// The match domain excludes End events and splits at boundaries: existing
// calls (no nesting) and events that encode to nothing.

#[derive(Debug, Default)]
struct Segment {
    track_index: usize,
    event_start_index: usize,
    tokens: Vec<u64>,
    sizes: Vec<u8>,
}

fn build_segments(song: &NspcSong) -> Vec<Segment> {
    let mut segments = Vec::with_capacity(song.tracks().len() * 2);

    for (track_index, track) in song.tracks().iter().enumerate() {
        let mut current: Option<Segment> = None;

        for (i, entry) in track.events.iter().enumerate() {
            if matches!(entry.event, NspcEvent::End) {
                // End is a hard stop and never appears inside a body
                if let Some(segment) = current.take() {
                    if !segment.tokens.is_empty() {
                        segments.push(segment);
                    }
                }
                break;
            }

            if is_subroutine_call(entry) || entry.event.encoded_size() == 0 {
                if let Some(segment) = current.take() {
                    if !segment.tokens.is_empty() {
                        segments.push(segment);
                    }
                }
                continue;
            }

            let segment = current.get_or_insert_with(|| Segment {
                track_index,
                event_start_index: i,
                tokens: Vec::new(),
                sizes: Vec::new(),
            });
            segment.tokens.push(hash_event_semantic(&entry.event));
            segment.sizes.push(entry.event.encoded_size() as u8);
        }

        if let Some(segment) = current.take() {
            if !segment.tokens.is_empty() {
                segments.push(segment);
            }
        }
    }

    segments
}

fn build_global_sequence(segments: &[Segment]) -> (Vec<u64>, Vec<u32>, Vec<u32>) {
    let total: usize = segments.iter().map(|s| s.tokens.len() + 1).sum();
    let mut sequence = Vec::with_capacity(total);
    let mut sizes = Vec::with_capacity(total);

    // separators are unique with the top bit set so no match crosses them
    let mut separator_id = 1u64;
    for segment in segments {
        sequence.extend_from_slice(&segment.tokens);
        sizes.extend_from_slice(&segment.sizes);
        sequence.push((1u64 << 63) | separator_id);
        separator_id += 1;
        sizes.push(0);
    }

    let mut prefix_bytes = vec![0u32; sequence.len() + 1];
    let mut prefix_sep = vec![0u32; sequence.len() + 1];
    for i in 0..sequence.len() {
        prefix_bytes[i + 1] = prefix_bytes[i] + u32::from(sizes[i]);
        prefix_sep[i + 1] = prefix_sep[i] + u32::from(sequence[i] >> 63 != 0);
    }

    (sequence, prefix_bytes, prefix_sep)
}

// ---- suffix automaton over u64 symbols ----
//
// Transitions live in small vectors; typical out-degree is tiny and linear
// scans beat hashing here.

#[derive(Debug, Clone, Default)]
struct SamState {
    link: i32,
    len: i32,
    first_pos: i32,
    occurrences: i32,
    next: Vec<(u64, i32)>,
}

struct SuffixAutomaton {
    states: Vec<SamState>,
    last: i32,
}

impl SuffixAutomaton {
    fn new(reserve_states: usize) -> Self {
        let mut states = Vec::with_capacity(reserve_states.max(2));
        states.push(SamState {
            link: -1,
            len: 0,
            first_pos: -1,
            occurrences: 0,
            next: Vec::new(),
        });
        SuffixAutomaton { states, last: 0 }
    }

    fn find_next(&self, state: i32, symbol: u64) -> i32 {
        for &(sym, next) in &self.states[state as usize].next {
            if sym == symbol {
                return next;
            }
        }
        -1
    }

    fn set_next(&mut self, state: i32, symbol: u64, next: i32) {
        for slot in &mut self.states[state as usize].next {
            if slot.0 == symbol {
                slot.1 = next;
                return;
            }
        }
        self.states[state as usize].next.push((symbol, next));
    }

    fn extend(&mut self, symbol: u64, position: i32) {
        let current = self.states.len() as i32;
        self.states.push(SamState {
            link: 0,
            len: self.states[self.last as usize].len + 1,
            first_pos: position,
            occurrences: 1,
            next: Vec::new(),
        });

        let mut p = self.last;
        while p != -1 && self.find_next(p, symbol) == -1 {
            self.set_next(p, symbol, current);
            p = self.states[p as usize].link;
        }

        if p == -1 {
            self.states[current as usize].link = 0;
        } else {
            let q = self.find_next(p, symbol);
            if self.states[p as usize].len + 1 == self.states[q as usize].len {
                self.states[current as usize].link = q;
            } else {
                let clone = self.states.len() as i32;
                let mut cloned = self.states[q as usize].clone();
                cloned.len = self.states[p as usize].len + 1;
                cloned.occurrences = 0; // clones carry no endpos of their own
                self.states.push(cloned);

                let mut p = p;
                while p != -1 && self.find_next(p, symbol) == q {
                    self.set_next(p, symbol, clone);
                    p = self.states[p as usize].link;
                }
                self.states[q as usize].link = clone;
                self.states[current as usize].link = clone;
            }
        }

        self.last = current;
    }

    /// Propagate endpos counts up the suffix links (counting sort by len).
    fn compute_occurrences(&mut self) {
        let max_len = self.states.iter().map(|s| s.len).max().unwrap_or(0) as usize;

        let mut counts = vec![0usize; max_len + 1];
        for state in &self.states {
            counts[state.len as usize] += 1;
        }
        for i in 1..=max_len {
            counts[i] += counts[i - 1];
        }

        let mut order = vec![0usize; self.states.len()];
        for i in (0..self.states.len()).rev() {
            counts[self.states[i].len as usize] -= 1;
            order[counts[self.states[i].len as usize]] = i;
        }

        for &index in order.iter().rev() {
            if index == 0 {
                continue;
            }
            let parent = self.states[index].link;
            if parent >= 0 {
                self.states[parent as usize].occurrences += self.states[index].occurrences;
            }
        }
    }
}

// ---- candidate selection and application ----

#[derive(Debug, Clone, Copy)]
struct Candidate {
    len_tokens: i32,
    len_bytes: u32,
    occurrences: i32,
    first_pos: i32,
    estimated_savings: i64,
    state_index: i32,
}

#[derive(Debug, Clone, Copy)]
struct Run {
    start_event_index: usize,
    repeats: u32,
}

#[derive(Debug, Clone, Default)]
struct ApplyPlan {
    track_index: usize,
    runs: Vec<Run>,
}

fn call_chunk_iterations(repeats: u32, allow_single: bool, chunks: &mut Vec<u32>) -> bool {
    chunks.clear();
    if repeats < if allow_single { 1 } else { 2 } {
        return false;
    }

    let mut remaining = repeats;
    while remaining > 0 {
        // a call's count byte covers 1..=255 iterations
        let chunk = remaining.min(255);
        chunks.push(chunk);
        remaining -= chunk;
    }

    true
}

fn optimistic_min_call_count(occurrences: u32) -> u32 {
    (occurrences + 254) / 255
}

fn make_call_entry(next_id: &mut EventId, sub_id: i32, count: u8) -> EventEntry {
    let id = *next_id;
    *next_id += 1;
    EventEntry {
        id,
        event: NspcEvent::Vcmd(Vcmd::SubroutineCall {
            sub_id,
            original_addr: 0, // the planner patches via the id->addr map
            count,
        }),
        original_addr: None,
    }
}

fn make_end_entry(next_id: &mut EventId) -> EventEntry {
    let id = *next_id;
    *next_id += 1;
    EventEntry {
        id,
        event: NspcEvent::End,
        original_addr: None,
    }
}

fn collect_top_candidates(
    sam: &SuffixAutomaton,
    prefix_bytes: &[u32],
    prefix_sep: &[u32],
    options: &EffectiveOptions,
) -> Vec<Candidate> {
    let better = |a: &Candidate, b: &Candidate| {
        b.estimated_savings
            .cmp(&a.estimated_savings)
            .then_with(|| b.len_bytes.cmp(&a.len_bytes))
            .then_with(|| b.len_tokens.cmp(&a.len_tokens))
            .then_with(|| b.occurrences.cmp(&a.occurrences))
            .then_with(|| a.first_pos.cmp(&b.first_pos))
            .then_with(|| a.state_index.cmp(&b.state_index))
    };

    let mut candidates = Vec::new();

    for (state_index, state) in sam.states.iter().enumerate().skip(1) {
        if state.occurrences < 2 || state.len <= 0 || state.first_pos < 0 {
            continue;
        }

        let len_tokens = state.len;
        let end_pos = state.first_pos;
        let start_pos = end_pos - len_tokens + 1;
        if start_pos < 0 {
            continue;
        }

        // O(1) separator rejection via the prefix sums
        let start = start_pos as usize;
        let end = (start_pos + len_tokens) as usize;
        if prefix_sep[end] != prefix_sep[start] {
            continue;
        }

        let len_bytes = prefix_bytes[end] - prefix_bytes[start];
        if len_bytes == 0 || len_bytes > options.max_candidate_bytes {
            continue;
        }

        // optimistic score: every occurrence collapses into minimal calls
        let optimistic_calls = optimistic_min_call_count(state.occurrences as u32);
        let estimated = i64::from(state.occurrences) * i64::from(len_bytes)
            - i64::from(optimistic_calls) * i64::from(CALL_BYTES)
            - i64::from(len_bytes + SUB_TERMINATOR_BYTES);
        if estimated <= 0 {
            continue;
        }

        candidates.push(Candidate {
            len_tokens,
            len_bytes,
            occurrences: state.occurrences,
            first_pos: state.first_pos,
            estimated_savings: estimated,
            state_index: state_index as i32,
        });
    }

    if candidates.len() > options.top_candidates {
        candidates.select_nth_unstable_by(options.top_candidates, |a, b| better(a, b));
        candidates.truncate(options.top_candidates);
    }
    candidates.sort_by(|a, b| better(a, b));
    candidates
}

struct PlanOutcome {
    plans: Vec<ApplyPlan>,
    len_tokens: u32,
    representative_track: usize,
    representative_start: usize,
}

#[allow(clippy::too_many_arguments)]
fn build_apply_plans(
    candidate: &Candidate,
    song: &NspcSong,
    segments: &[Segment],
    global_sequence: &[u64],
    prefix_bytes: &[u32],
    prefix_sep: &[u32],
    options: &EffectiveOptions,
) -> Option<PlanOutcome> {
    let len_tokens = candidate.len_tokens;
    if len_tokens <= 0 {
        return None;
    }

    let end_pos = candidate.first_pos;
    let start_pos = end_pos - len_tokens + 1;
    if start_pos < 0 {
        return None;
    }

    let start = start_pos as usize;
    let end = (start_pos + len_tokens) as usize;
    if prefix_sep[end] != prefix_sep[start] {
        return None;
    }

    let len_bytes = prefix_bytes[end] - prefix_bytes[start];
    if len_bytes == 0 || len_bytes > options.max_candidate_bytes {
        return None;
    }

    let pattern = &global_sequence[start..end];
    let pattern_len = pattern.len();
    let tracks = song.tracks();

    // gather match starts per track across all segments
    let mut starts_by_track: Vec<Vec<usize>> = vec![Vec::new(); tracks.len()];
    let mut candidate_ends_with_bare_duration: Option<bool> = None;

    for segment in segments {
        if segment.tokens.len() < pattern_len {
            continue;
        }

        let mut search_from = 0usize;
        while search_from + pattern_len <= segment.tokens.len() {
            let window = &segment.tokens[search_from..];
            let Some(relative) = window
                .windows(pattern_len)
                .position(|candidate_window| candidate_window == pattern)
            else {
                break;
            };
            let pos = search_from + relative;
            search_from = pos + 1; // overlapping detection; planning drops overlaps

            let start_event_index = segment.event_start_index + pos;
            let track_events = &tracks[segment.track_index].events;

            // fragile call boundaries around pitch slides are rejected:
            // a body must not begin on one or end immediately before one
            if start_event_index < track_events.len()
                && is_pitch_slide(&track_events[start_event_index])
            {
                continue;
            }
            let end_event_index = start_event_index + pattern_len;
            if end_event_index < track_events.len()
                && is_pitch_slide(&track_events[end_event_index])
            {
                continue;
            }

            // keep Duration-byte adjacency in the caller: no call directly
            // after a Duration event
            if start_event_index > 0
                && start_event_index - 1 < track_events.len()
                && matches!(track_events[start_event_index - 1].event, NspcEvent::Duration { .. })
            {
                continue;
            }

            // a body ending on a bare Duration can desynchronize playback
            // against the terminator on some engines
            if end_event_index == 0 || end_event_index > track_events.len() {
                continue;
            }
            if candidate_ends_with_bare_duration.is_none() {
                let bare = is_bare_duration(&track_events[end_event_index - 1]);
                candidate_ends_with_bare_duration = Some(bare);
                if bare {
                    return None;
                }
            }

            starts_by_track[segment.track_index].push(start_event_index);
        }
    }

    // build non-overlapping adjacency runs per track
    let mut plans: Vec<ApplyPlan> = Vec::new();
    let mut representative: Option<(usize, usize)> = None;

    let mut total_occurrences = 0u64;
    let mut total_calls = 0u64;
    let mut total_single_iteration_calls = 0u64;
    let mut candidate_consumes_duration: Option<bool> = None;
    let mut chunks = Vec::with_capacity(8);

    for (track_index, starts) in starts_by_track.iter_mut().enumerate() {
        if starts.is_empty() {
            continue;
        }

        starts.sort_unstable();
        starts.dedup();

        let mut plan = ApplyPlan {
            track_index,
            runs: Vec::new(),
        };
        let track_events = &tracks[track_index].events;

        let mut i = 0usize;
        let mut next_allowed = 0usize;
        while i < starts.len() {
            let s = starts[i];
            if s < next_allowed {
                i += 1;
                continue;
            }

            // grow an adjacency run: s, s+len, s+2len, ...
            let mut repeats = 1u32;
            let mut j = i + 1;
            while j < starts.len()
                && starts[j] == s + repeats as usize * pattern_len
            {
                repeats += 1;
                j += 1;
            }

            // count=1 calls carry the most dispatch overhead; keep them
            // only when the body advances musical time
            if repeats == 1 {
                if candidate_consumes_duration.is_none() {
                    candidate_consumes_duration =
                        Some(slice_consumes_duration_ticks(track_events, s, pattern_len));
                }
                if candidate_consumes_duration != Some(true) {
                    i += 1;
                    continue;
                }
            }

            if !call_chunk_iterations(repeats, options.allow_single_iteration_calls, &mut chunks) {
                i += 1;
                continue;
            }

            plan.runs.push(Run {
                start_event_index: s,
                repeats,
            });

            if representative.is_none() {
                representative = Some((track_index, s));
            }

            total_occurrences += u64::from(repeats);
            total_calls += chunks.len() as u64;
            total_single_iteration_calls += chunks.iter().filter(|&&c| c == 1).count() as u64;

            next_allowed = s + repeats as usize * pattern_len;
            i = j;
            while i < starts.len() && starts[i] < next_allowed {
                i += 1;
            }
        }

        if !plan.runs.is_empty() {
            plans.push(plan);
        }
    }

    let (representative_track, representative_start) = representative?;
    if total_occurrences < 2 {
        return None;
    }

    // real savings: removed bytes - call bytes - body (+End) - penalty
    let removed = total_occurrences * u64::from(len_bytes);
    let call_bytes = total_calls * u64::from(CALL_BYTES);
    let sub_bytes = u64::from(len_bytes + SUB_TERMINATOR_BYTES);
    let runtime_penalty =
        total_single_iteration_calls as i64 * options.single_iteration_call_penalty_bytes;

    let real_savings =
        removed as i64 - call_bytes as i64 - sub_bytes as i64 - runtime_penalty;
    if real_savings <= 0 {
        return None;
    }

    Some(PlanOutcome {
        plans,
        len_tokens: len_tokens as u32,
        representative_track,
        representative_start,
    })
}

fn apply_plans(
    song: &mut NspcSong,
    outcome: &PlanOutcome,
    allow_single_iteration_calls: bool,
    next_id: &mut EventId,
) {
    let new_sub_id = song.subroutines().len() as i32;
    let len_tokens = outcome.len_tokens as usize;

    // build the body from the representative slice; never include an End
    let mut sub_events = Vec::with_capacity(len_tokens + 1);
    {
        let source = &song.tracks()[outcome.representative_track].events;
        let slice_end = outcome.representative_start + len_tokens;
        for entry in &source[outcome.representative_start..slice_end] {
            if matches!(entry.event, NspcEvent::End) {
                break;
            }
            let mut cloned = entry.clone();
            cloned.id = *next_id;
            *next_id += 1;
            cloned.original_addr = None;
            sub_events.push(cloned);
        }
    }
    sub_events.push(make_end_entry(next_id));

    song.subroutines_mut().push(Subroutine {
        id: new_sub_id,
        events: sub_events,
        original_addr: 0,
    });

    let mut chunks = Vec::with_capacity(8);
    for plan in &outcome.plans {
        let track = &mut song.tracks_mut()[plan.track_index];
        let old = std::mem::take(&mut track.events);
        let mut out: Vec<EventEntry> = Vec::with_capacity(old.len());

        let mut run_index = 0usize;
        let mut i = 0usize;
        while i < old.len() {
            if matches!(old[i].event, NspcEvent::End) {
                out.push(old[i].clone());
                break;
            }

            if run_index < plan.runs.len() && i == plan.runs[run_index].start_event_index {
                let run = plan.runs[run_index];

                if call_chunk_iterations(run.repeats, allow_single_iteration_calls, &mut chunks) {
                    for &chunk in &chunks {
                        out.push(make_call_entry(next_id, new_sub_id, chunk as u8));
                    }
                } else {
                    // keep the original events when the run cannot encode
                    for keep in 0..run.repeats as usize * len_tokens {
                        out.push(old[i + keep].clone());
                    }
                }

                i += run.repeats as usize * len_tokens;
                run_index += 1;
                continue;
            }

            out.push(old[i].clone());
            i += 1;
        }

        track.events = out;
    }
}

fn has_any_subroutine_calls(song: &NspcSong) -> bool {
    song.tracks()
        .iter()
        .any(|track| track.events.iter().any(is_subroutine_call))
}

fn next_event_id(song: &NspcSong) -> EventId {
    let mut next = 1;
    for track in song.tracks() {
        for entry in &track.events {
            next = next.max(entry.id + 1);
        }
    }
    for subroutine in song.subroutines() {
        for entry in &subroutine.events {
            next = next.max(entry.id + 1);
        }
    }
    next
}

/// Flatten, then iteratively extract the best-paying repeated slice into a
/// shared subroutine until no candidate yields savings.
pub fn optimize_song_subroutines(song: &mut NspcSong, options: &OptimizerOptions) {
    let options = effective_options(options);

    // linear tracks first; extraction never nests calls
    song.flatten_subroutines();

    // recursive or unresolved calls survive flattening; leave the song be
    if has_any_subroutine_calls(song) {
        return;
    }

    song.subroutines_mut().clear();

    let mut next_id = next_event_id(song);

    for _ in 0..options.max_optimize_iterations {
        let segments = build_segments(song);

        let token_count: usize = segments.iter().map(|s| s.tokens.len()).sum();
        if token_count < 8 {
            break;
        }

        let (global_sequence, prefix_bytes, prefix_sep) = build_global_sequence(&segments);

        let mut sam = SuffixAutomaton::new(global_sequence.len() * 2);
        for (position, &symbol) in global_sequence.iter().enumerate() {
            sam.extend(symbol, position as i32);
        }
        sam.compute_occurrences();

        let candidates = collect_top_candidates(&sam, &prefix_bytes, &prefix_sep, &options);
        if candidates.is_empty() {
            break;
        }

        // best-first; apply the first candidate whose real plan still pays
        let mut applied = false;
        for candidate in &candidates {
            let Some(outcome) = build_apply_plans(
                candidate,
                song,
                &segments,
                &global_sequence,
                &prefix_bytes,
                &prefix_sep,
                &options,
            ) else {
                continue;
            };

            apply_plans(song, &outcome, options.allow_single_iteration_calls, &mut next_id);
            applied = true;
            break;
        }

        if !applied {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nspc::song::Track;

    fn note(pitch: u8) -> NspcEvent {
        NspcEvent::Note { pitch }
    }

    fn duration(ticks: u8) -> NspcEvent {
        NspcEvent::Duration {
            ticks,
            quantization: Some(3),
            velocity: Some(10),
        }
    }

    fn entries(events: Vec<NspcEvent>) -> Vec<EventEntry> {
        events
            .into_iter()
            .enumerate()
            .map(|(i, event)| EventEntry {
                id: i as EventId + 1,
                event,
                original_addr: None,
            })
            .collect()
    }

    fn flatten_track(song: &NspcSong, track_index: usize) -> Vec<NspcEvent> {
        let mut out = Vec::new();
        for entry in &song.tracks()[track_index].events {
            match &entry.event {
                NspcEvent::Vcmd(Vcmd::SubroutineCall { sub_id, count, .. }) => {
                    let sub = song
                        .subroutines()
                        .iter()
                        .find(|s| s.id == *sub_id)
                        .expect("call target exists");
                    for _ in 0..*count {
                        for sub_entry in &sub.events {
                            if matches!(sub_entry.event, NspcEvent::End) {
                                continue;
                            }
                            out.push(sub_entry.event.clone());
                        }
                    }
                }
                event => out.push(event.clone()),
            }
        }
        out
    }

    fn motif() -> Vec<NspcEvent> {
        vec![
            duration(12),
            note(10),
            note(12),
            note(14),
            NspcEvent::Tie,
            NspcEvent::Rest,
        ]
    }

    fn two_track_song() -> NspcSong {
        let mut song = NspcSong::create_empty(0);

        let mut track0 = Vec::new();
        for filler in [0u8, 1, 2] {
            track0.extend(motif());
            track0.push(note(0x20 + filler));
        }
        track0.push(NspcEvent::End);

        let mut track1 = Vec::new();
        track1.push(note(0x30));
        for _ in 0..2 {
            track1.extend(motif());
        }
        track1.push(note(0x31));
        track1.push(NspcEvent::End);

        song.tracks_mut().push(Track {
            id: 0,
            events: entries(track0),
            original_addr: 0,
        });
        song.tracks_mut().push(Track {
            id: 1,
            events: entries(track1),
            original_addr: 0,
        });
        song
    }

    #[test]
    fn test_optimizer_extracts_shared_motif() {
        let mut song = two_track_song();
        let before: Vec<Vec<NspcEvent>> = (0..2).map(|i| flatten_track(&song, i)).collect();

        optimize_song_subroutines(&mut song, &OptimizerOptions::default());

        assert!(!song.subroutines().is_empty(), "no subroutine extracted");
        let calls: usize = song
            .tracks()
            .iter()
            .map(|t| t.events.iter().filter(|e| is_subroutine_call(e)).count())
            .sum();
        assert!(calls >= 1, "no calls inserted");

        for sub in song.subroutines() {
            assert!(matches!(sub.events.last().unwrap().event, NspcEvent::End));
            // no End in the interior
            assert!(!sub.events[..sub.events.len() - 1]
                .iter()
                .any(|e| matches!(e.event, NspcEvent::End)));
        }

        // inlining the calls reproduces the original event sequences
        for (i, original) in before.iter().enumerate() {
            assert_eq!(&flatten_track(&song, i), original, "track {i} semantics changed");
        }
    }

    #[test]
    fn test_optimizer_saves_bytes() {
        let mut song = two_track_song();
        let size_of = |song: &NspcSong| -> u32 {
            let tracks: u32 = song
                .tracks()
                .iter()
                .map(|t| t.events.iter().map(|e| e.event.encoded_size()).sum::<u32>())
                .sum();
            let subs: u32 = song
                .subroutines()
                .iter()
                .map(|s| s.events.iter().map(|e| e.event.encoded_size()).sum::<u32>())
                .sum();
            tracks + subs
        };
        let before = size_of(&song);
        optimize_song_subroutines(&mut song, &OptimizerOptions::default());
        let after = size_of(&song);
        assert!(after < before, "no savings: {before} -> {after}");
    }

    #[test]
    fn test_optimizer_flattens_existing_calls_first(){
        let mut song = two_track_song();
        optimize_song_subroutines(&mut song, &OptimizerOptions::default());
        let first_pass: Vec<Vec<NspcEvent>> = (0..2).map(|i| flatten_track(&song, i)).collect();

        // a second run starts from the flattened form and stays equivalent
        optimize_song_subroutines(&mut song, &OptimizerOptions::default());
        for (i, expected) in first_pass.iter().enumerate() {
            assert_eq!(&flatten_track(&song, i), expected);
        }
    }

    #[test]
    fn test_no_extraction_from_tiny_song() {
        let mut song = NspcSong::create_empty(0);
        song.tracks_mut().push(Track {
            id: 0,
            events: entries(vec![note(1), note(2), NspcEvent::End]),
            original_addr: 0,
        });
        optimize_song_subroutines(&mut song, &OptimizerOptions::default());
        assert!(song.subroutines().is_empty());
    }

    #[test]
    fn test_bodies_never_end_on_bare_duration() {
        // repeated slices deliberately end on a bare duration byte
        let mut song = NspcSong::create_empty(0);
        let bare = NspcEvent::Duration {
            ticks: 9,
            quantization: None,
            velocity: None,
        };
        let mut track = Vec::new();
        for _ in 0..4 {
            track.push(note(5));
            track.push(note(6));
            track.push(NspcEvent::Tie);
            track.push(bare.clone());
        }
        track.push(NspcEvent::End);
        song.tracks_mut().push(Track {
            id: 0,
            events: entries(track),
            original_addr: 0,
        });

        optimize_song_subroutines(&mut song, &OptimizerOptions::default());

        for sub in song.subroutines() {
            let body = &sub.events[..sub.events.len() - 1];
            if let Some(last) = body.last() {
                assert!(
                    !is_bare_duration(last),
                    "extracted body ends on a bare duration"
                );
            }
        }
    }
}
