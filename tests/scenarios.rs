//! End-to-end scenarios across the toolchain: disassemble/serialize round
//! trips, codec contracts, capacity failures, optimizer semantics and the
//! preview stepping contract.

use std::collections::HashMap;

use anyhow::Result;

use nspckit::apu::Apu;
use nspckit::brr::{decode_brr_to_pcm, encode_pcm_to_brr, BrrEncodeOptions};
use nspckit::nspc::event::{EventEntry, NspcEvent, Vcmd};
use nspckit::nspc::song::Track;
use nspckit::nspc::{
    encode_event_stream, optimize_song_subroutines, BuildOptions, CommandMap, EngineConfig,
    NspcProject, NspcSong, OptimizerOptions,
};

fn image_with(writes: &[(u16, &[u8])]) -> Box<[u8; 0x10000]> {
    let mut aram = Box::new([0u8; 0x10000]);
    for (addr, data) in writes {
        let start = usize::from(*addr);
        aram[start..start + data.len()].copy_from_slice(data);
    }
    aram
}

/// The remapped engine of scenario S1: notes from $80, tie $C6, a one-byte
/// rest range at $C9 writing $C7, percussion from $D0 and vcmds from $DA
/// with $DA<->$E0 and $DD<->$F9 translations.
fn remapped_engine() -> EngineConfig {
    let mut map = CommandMap {
        note_start: 0x80,
        note_end: 0xC5,
        tie: 0xC6,
        rest_start: 0xC9,
        rest_end: 0xC9,
        rest_write: 0xC7,
        percussion_start: 0xD0,
        percussion_end: 0xD9,
        vcmd_start: 0xDA,
        ..Default::default()
    };
    map.read_vcmd_map.insert(0xDA, 0xE0);
    map.read_vcmd_map.insert(0xDD, 0xF9);
    map.write_vcmd_map.insert(0xE0, 0xDA);
    map.write_vcmd_map.insert(0xF9, 0xDD);

    EngineConfig {
        id: "remapped".into(),
        name: "Remapped".into(),
        song_index_pointers: 0x0400,
        command_map: Some(map),
        ..Default::default()
    }
}

const S1_TRACK_BYTES: [u8; 12] = [
    0x08, 0x80, 0xC6, 0xC9, 0xD2, 0xDA, 0x07, 0xDD, 0x01, 0x02, 0x03, 0x00,
];

fn s1_image() -> Box<[u8; 0x10000]> {
    image_with(&[
        (0x0400, &[0x40, 0x04, 0xFF, 0xFF]),
        (0x0440, &[0x60, 0x04, 0x00, 0x00]),
        (0x0460, &[0x00, 0x05]),
        (0x0500, &S1_TRACK_BYTES),
    ])
}

#[test]
fn s1_round_trip_single_channel_track() -> Result<()> {
    let engine = remapped_engine();
    let project = NspcProject::new(engine.clone(), s1_image())?;

    assert_eq!(project.songs().len(), 1);
    let song = &project.songs()[0];
    let events: Vec<&NspcEvent> = song.tracks()[0].events.iter().map(|e| &e.event).collect();

    assert!(matches!(
        events[0],
        NspcEvent::Duration {
            ticks: 8,
            quantization: None,
            velocity: None
        }
    ));
    assert!(matches!(events[1], NspcEvent::Note { pitch: 0 }));
    assert!(matches!(events[2], NspcEvent::Tie));
    assert!(matches!(events[3], NspcEvent::Rest));
    assert!(matches!(events[4], NspcEvent::Percussion { index: 2 }));
    assert!(matches!(
        events[5],
        NspcEvent::Vcmd(Vcmd::Inst { instrument: 7 })
    ));
    assert!(matches!(
        events[6],
        NspcEvent::Vcmd(Vcmd::PitchSlideToNote {
            delay: 1,
            length: 2,
            note: 3
        })
    ));
    assert!(matches!(events[7], NspcEvent::End));
    assert_eq!(events.len(), 8);

    // the rest byte canonicalizes to restWrite on the way back out
    let mut warnings = Vec::new();
    let rebuilt = encode_event_stream(
        &song.tracks()[0].events,
        &HashMap::new(),
        &mut warnings,
        &engine,
    )?;
    assert_eq!(
        rebuilt,
        vec![0x08, 0x80, 0xC6, 0xC7, 0xD2, 0xDA, 0x07, 0xDD, 0x01, 0x02, 0x03, 0x00]
    );
    assert!(warnings.is_empty());
    Ok(())
}

#[test]
fn round_trip_report_masks_pointer_bytes_only() -> Result<()> {
    // a song with a subroutine call; the call address is a pointer byte
    let engine = EngineConfig {
        id: "plain".into(),
        name: "Plain".into(),
        song_index_pointers: 0x0400,
        ..Default::default()
    };
    let image = image_with(&[
        (0x0400, &[0x40, 0x04, 0xFF, 0xFF]),
        (0x0440, &[0x60, 0x04, 0x02, 0x00, 0x40, 0x04, 0x00, 0x00]),
        (0x0460, &[0x00, 0x05]),
        (0x0500, &[0x18, 0x80, 0xEF, 0x00, 0x06, 0x03, 0x00]),
        (0x0600, &[0xC6, 0xC7, 0x00]),
    ]);
    let project = NspcProject::new(engine, image)?;
    let report = project.verify_song_round_trip(0)?;
    assert!(report.equivalent, "{:?}", report.messages);
    assert_eq!(report.differing_bytes, 0);
    Ok(())
}

#[test]
fn s2_brr_end_flag_on_last_block_only() -> Result<()> {
    // 96 samples of a low-frequency triangle
    let pcm: Vec<i16> = (0..96)
        .map(|i| {
            let phase = i % 48;
            let level = if phase < 24 { phase } else { 48 - phase };
            (level * 300 - 3600) as i16
        })
        .collect();

    let plain = encode_pcm_to_brr(&pcm, &BrrEncodeOptions::default())?;
    assert_eq!(plain.bytes.len() % 9, 0);
    let blocks: Vec<&[u8]> = plain.bytes.chunks_exact(9).collect();
    for (i, block) in blocks.iter().enumerate() {
        assert_eq!(block[0] & 0x01 != 0, i + 1 == blocks.len());
    }

    let looped = encode_pcm_to_brr(
        &pcm,
        &BrrEncodeOptions {
            enable_loop: true,
            loop_start_sample: Some(0),
            ..Default::default()
        },
    )?;
    for block in looped.bytes.chunks_exact(9) {
        assert_ne!(block[0] & 0x02, 0);
    }
    assert_eq!(looped.loop_offset_bytes.unwrap() % 9, 0);

    let decoded = decode_brr_to_pcm(&plain.bytes)?;
    assert_eq!(decoded.len() % 16, 0);
    Ok(())
}

#[test]
fn s3_capacity_failure_mentions_aram() -> Result<()> {
    let engine = EngineConfig {
        id: "plain".into(),
        name: "Plain".into(),
        song_index_pointers: 0x0400,
        ..Default::default()
    };
    let image = image_with(&[
        (0x0400, &[0x40, 0x04, 0xFF, 0xFF]),
        (0x0440, &[0x60, 0x04, 0x00, 0x00]),
        (0x0460, &[0x00, 0x05]),
        (0x0500, &[0x08, 0x80, 0x00]),
    ]);
    let mut project = NspcProject::new(engine, image)?;

    let song = &mut project.songs_mut()[0];
    let sequence = song.sequence_mut();
    sequence.clear();
    for _ in 0..20_000 {
        sequence.push(nspckit::nspc::SequenceOp::JumpTimes {
            count: 1,
            target: nspckit::nspc::SequenceTarget {
                index: Some(0),
                addr: 0,
            },
        });
    }
    sequence.push(nspckit::nspc::SequenceOp::EndSequence);

    let err = project
        .build_song_upload(0, BuildOptions::default())
        .expect_err("an 80 KiB sequence cannot fit");
    assert!(err.to_string().contains("exceeds ARAM"), "{err}");
    Ok(())
}

fn entries(events: Vec<NspcEvent>) -> Vec<EventEntry> {
    events
        .into_iter()
        .enumerate()
        .map(|(i, event)| EventEntry {
            id: i as u64 + 1,
            event,
            original_addr: None,
        })
        .collect()
}

fn inline_calls(song: &NspcSong, track_index: usize) -> Vec<NspcEvent> {
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

#[test]
fn s4_optimizer_preserves_semantics() {
    let motif = vec![
        NspcEvent::Duration {
            ticks: 16,
            quantization: Some(5),
            velocity: Some(12),
        },
        NspcEvent::Note { pitch: 4 },
        NspcEvent::Note { pitch: 7 },
        NspcEvent::Tie,
        NspcEvent::Note { pitch: 11 },
        NspcEvent::Rest,
    ];

    let mut song = NspcSong::create_empty(0);
    let mut track0 = Vec::new();
    for unique in [0x30u8, 0x32, 0x34] {
        track0.extend(motif.clone());
        track0.push(NspcEvent::Note { pitch: unique });
    }
    track0.push(NspcEvent::End);

    let mut track1 = vec![NspcEvent::Note { pitch: 0x20 }];
    track1.extend(motif.clone());
    track1.push(NspcEvent::Note { pitch: 0x21 });
    track1.extend(motif.clone());
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

    let before: Vec<Vec<NspcEvent>> = (0..2).map(|i| inline_calls(&song, i)).collect();

    optimize_song_subroutines(&mut song, &OptimizerOptions::default());

    let total_calls: usize = song
        .tracks()
        .iter()
        .flat_map(|t| &t.events)
        .filter(|e| matches!(e.event, NspcEvent::Vcmd(Vcmd::SubroutineCall { .. })))
        .count();
    assert!(total_calls >= 1, "optimizer extracted nothing");

    for sub in song.subroutines() {
        assert!(matches!(sub.events.last().unwrap().event, NspcEvent::End));
    }

    for (i, original) in before.iter().enumerate() {
        assert_eq!(&inline_calls(&song, i), original, "track {i} changed");
    }
}

#[test]
fn s5_sparse_song_table_with_trailing_garbage() -> Result<()> {
    let engine = EngineConfig {
        id: "plain".into(),
        name: "Plain".into(),
        song_index_pointers: 0x0400,
        ..Default::default()
    };
    // table: 0600 0000 0610 1234 ...
    let image = image_with(&[
        (0x0400, &[0x00, 0x06, 0x00, 0x00, 0x10, 0x06, 0x34, 0x12]),
        (0x0600, &[0x40, 0x06, 0x00, 0x00]),
        (0x0610, &[0x40, 0x06, 0x00, 0x00]),
        (0x0640, &[0x60, 0x06]),
        (0x0660, &[0x08, 0x80, 0x00]),
    ]);
    let project = NspcProject::new(engine, image)?;

    assert_eq!(project.songs().len(), 2);
    assert_eq!(project.songs()[0].song_id(), 0);
    assert_eq!(project.songs()[1].song_id(), 2);
    assert!(project
        .parse_warnings()
        .iter()
        .any(|w| w.contains("$1234")));
    Ok(())
}

#[test]
fn s6_preview_path_does_not_advance_cpu() {
    let mut apu = Apu::new();
    apu.reset(None, false);
    apu.set_pc(0x0200);

    let before = apu.registers();
    let cycles_before = apu.cycle_count();

    let mut produced = 0;
    for _ in 0..64 {
        let _sample = apu.step_dsp_only();
        produced += 1;
    }

    let after = apu.registers();
    assert_eq!(produced, 64);
    assert_eq!(before.pc, after.pc);
    assert_eq!(before.a, after.a);
    assert_eq!(before.x, after.x);
    assert_eq!(before.y, after.y);
    assert_eq!(before.s, after.s);
    assert_eq!(before.p, after.p);
    assert_eq!(cycles_before, apu.cycle_count());
}

#[test]
fn dsp_stepping_is_deterministic() {
    let mut a = Apu::new();
    let mut b = Apu::new();
    a.reset(None, false);
    b.reset(None, false);

    // write a few registers through the preview path on both
    for apu in [&mut a, &mut b] {
        apu.write_dsp(0x6C, 0x20); // unmute
        apu.write_dsp(0x0C, 0x7F);
        apu.write_dsp(0x1C, 0x7F);
        apu.write_dsp(0x4C, 0x01); // key on voice 0
    }

    let samples_a: Vec<(i16, i16)> = (0..256).map(|_| a.step_dsp_only()).collect();
    let samples_b: Vec<(i16, i16)> = (0..256).map(|_| b.step_dsp_only()).collect();
    assert_eq!(samples_a, samples_b);
}

#[test]
fn planner_chunks_stay_in_bounds_and_disjoint() -> Result<()> {
    let engine = EngineConfig {
        id: "plain".into(),
        name: "Plain".into(),
        song_index_pointers: 0x0400,
        ..Default::default()
    };
    let image = image_with(&[
        (0x0400, &[0x40, 0x04, 0xFF, 0xFF]),
        (0x0440, &[0x60, 0x04, 0x00, 0x00]),
        (0x0460, &[0x00, 0x05, 0x20, 0x05]),
        (0x0500, &[0x08, 0x80, 0xC6, 0x00]),
        (0x0520, &[0x10, 0x84, 0xC7, 0x00]),
    ]);
    let mut project = NspcProject::new(engine, image)?;

    for compact in [false, true] {
        let output = project.build_song_upload(
            0,
            BuildOptions {
                compact_aram_layout: compact,
                ..Default::default()
            },
        )?;
        let chunks = &output.upload.chunks;
        assert!(!chunks.is_empty());
        for pair in chunks.windows(2) {
            let prev_end = u32::from(pair[0].address) + pair[0].bytes.len() as u32;
            assert!(prev_end <= u32::from(pair[1].address), "chunks overlap");
        }
        let last = chunks.last().unwrap();
        assert!(u32::from(last.address) + last.bytes.len() as u32 <= 0x10000);
    }
    Ok(())
}

#[test]
fn usage_refresh_is_idempotent() -> Result<()> {
    let engine = EngineConfig {
        id: "plain".into(),
        name: "Plain".into(),
        song_index_pointers: 0x0400,
        ..Default::default()
    };
    let image = image_with(&[
        (0x0400, &[0x40, 0x04, 0xFF, 0xFF]),
        (0x0440, &[0x60, 0x04, 0x00, 0x00]),
        (0x0460, &[0x00, 0x05]),
        (0x0500, &[0x08, 0x80, 0x00]),
    ]);
    let mut project = NspcProject::new(engine, image)?;

    project.refresh_aram_usage();
    let once = project.aram_usage().clone();
    project.refresh_aram_usage();
    let twice = project.aram_usage();

    assert_eq!(once.free_bytes, twice.free_bytes);
    assert_eq!(once.regions.len(), twice.regions.len());
    for (a, b) in once.regions.iter().zip(&twice.regions) {
        assert_eq!(a, b);
    }
    Ok(())
}
