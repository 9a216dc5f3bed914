//! BRR block-ADPCM codec
//!
//! Encoder and decoder for the DSP's 9-byte sample blocks. The encoder
//! brute-forces every shift/filter pair per block, scoring squared error
//! under the real decoder's dynamics so the bytes sound the way the search
//! predicted.

use crate::{NspcError, Result};

const BLOCK_SIZE: usize = 9;
const SAMPLES_PER_BLOCK: usize = 16;

/// Encoder options.
#[derive(Debug, Clone)]
pub struct BrrEncodeOptions {
    /// Emit the loop flag on every block and align the loop start.
    pub enable_loop: bool,
    /// Loop start in input samples (aligned down to a block boundary).
    pub loop_start_sample: Option<usize>,
    /// Pre-filter the input to compensate the DSP's Gaussian low-pass.
    pub enhance_treble: bool,
    /// Per-filter enable switches for the search.
    pub filter_enabled: [bool; 4],
    /// Allow the 15-bit wrap trick when quantizing large deltas.
    pub wrap_enabled: bool,
}

impl Default for BrrEncodeOptions {
    fn default() -> Self {
        BrrEncodeOptions {
            enable_loop: false,
            loop_start_sample: None,
            enhance_treble: false,
            filter_enabled: [true; 4],
            wrap_enabled: true,
        }
    }
}

/// Encoder output.
#[derive(Debug, Clone)]
pub struct BrrEncodeResult {
    /// BRR payload, a whole number of 9-byte blocks.
    pub bytes: Vec<u8>,
    /// Byte offset of the loop block when looping was requested.
    pub loop_offset_bytes: Option<u32>,
}

// Predictor shared by the encoder model and the decoder. Filter taps match
// the DSP's fixed-point coefficients.
fn brr_prediction(filter: u8, p1: i32, p2: i32) -> i32 {
    match filter {
        0 => 0,
        1 => p1 - (p1 >> 4),
        2 => {
            let mut p = p1 << 1;
            p += (-(p1 + (p1 << 1))) >> 5;
            p -= p2;
            p += p2 >> 4;
            p
        }
        3 => {
            let mut p = p1 << 1;
            p += (-(p1 + (p1 << 2) + (p1 << 3))) >> 6;
            p -= p2;
            p += (p2 + (p2 << 1)) >> 4;
            p
        }
        _ => 0,
    }
}

fn clamp16(value: i32) -> i32 {
    if i32::from(value as i16) != value {
        i32::from((0x7FFF - (value >> 24)) as i16)
    } else {
        value
    }
}

struct EncoderState {
    p1: i32,
    p2: i32,
    filter_at_loop: u8,
    p1_at_loop: i32,
    p2_at_loop: i32,
    filter_enabled: [bool; 4],
    wrap_enabled: bool,
}

/// Quantize one 16-sample block with a given shift/filter, returning the
/// squared error. When `write_block` is set, the nibbles and header are
/// packed into `out_block` and the predictor state advances.
fn mash_block(
    state: &mut EncoderState,
    shift: u8,
    filter: u8,
    pcm: &[i32; SAMPLES_PER_BLOCK],
    write_block: bool,
    is_end_point: bool,
    out_block: &mut [u8; BLOCK_SIZE],
) -> f64 {
    let mut error = 0.0f64;
    let mut l1 = state.p1;
    let mut l2 = state.p2;
    let step = 1i32 << shift;

    for (i, &sample) in pcm.iter().enumerate() {
        let vlin = brr_prediction(filter, l1, l2) >> 1;
        let mut d = (sample >> 1) - vlin;
        let da = d.abs();
        if state.wrap_enabled && da > 16384 && da < 32768 {
            d -= 32768 * (d >> 24);
        }

        let mut dp = d + (step << 2) + (step >> 2);
        let mut c = 0i32;
        if dp > 0 {
            c = if step > 1 { dp / (step / 2) } else { dp * 2 };
            c = c.min(15);
        }
        c -= 8;
        dp = (c << shift) >> 1;
        if shift > 12 {
            dp = (dp >> 14) & !0x7FF;
        }
        c &= 0x0F;

        l2 = l1;
        l1 = clamp16(vlin + dp) * 2;

        let e = sample - l1;
        error += f64::from(e) * f64::from(e);

        if write_block {
            out_block[1 + (i >> 1)] |= if i & 1 != 0 { c as u8 } else { (c as u8) << 4 };
        }
    }

    if is_end_point {
        // at the wrap, the predictor restarts from the loop-entry state;
        // include that mismatch in the score
        match state.filter_at_loop {
            0 => error /= 16.0,
            1 => {
                let e = l1 - state.p1_at_loop;
                error += f64::from(e) * f64::from(e);
                error /= 17.0;
            }
            _ => {
                let e1 = l1 - state.p1_at_loop;
                let e2 = l2 - state.p2_at_loop;
                error += f64::from(e1) * f64::from(e1);
                error += f64::from(e2) * f64::from(e2);
                error /= 18.0;
            }
        }
    } else {
        error /= 16.0;
    }

    if write_block {
        state.p1 = l1;
        state.p2 = l2;
        out_block[0] = (shift << 4) | (filter << 2);
        if is_end_point {
            out_block[0] |= 0x01;
        }
    }

    error
}

fn encode_block(
    state: &mut EncoderState,
    pcm: &[i32; SAMPLES_PER_BLOCK],
    is_loop_point: bool,
    is_end_point: bool,
) -> [u8; BLOCK_SIZE] {
    let mut best_shift = 0u8;
    let mut best_filter = 0u8;
    let mut best_error = f64::INFINITY;

    for shift in 0u8..13 {
        for filter in 0u8..4 {
            if !state.filter_enabled[usize::from(filter)] {
                continue;
            }

            let mut discard = [0u8; BLOCK_SIZE];
            let error = mash_block(state, shift, filter, pcm, false, is_end_point, &mut discard);
            if error < best_error {
                best_error = error;
                best_shift = shift;
                best_filter = filter;
            }
        }
    }

    if is_loop_point {
        state.filter_at_loop = best_filter;
        state.p1_at_loop = state.p1;
        state.p2_at_loop = state.p2;
    }

    let mut block = [0u8; BLOCK_SIZE];
    mash_block(state, best_shift, best_filter, pcm, true, is_end_point, &mut block);
    block
}

fn normalize_input_pcm(mono_pcm: &[i16]) -> Result<Vec<i32>> {
    if mono_pcm.is_empty() {
        return Err(NspcError::InvalidInput("Input PCM data is empty".into()));
    }

    let mut samples: Vec<i32> = Vec::with_capacity(mono_pcm.len() + SAMPLES_PER_BLOCK);
    if mono_pcm.len() % SAMPLES_PER_BLOCK != 0 {
        let padding = SAMPLES_PER_BLOCK - mono_pcm.len() % SAMPLES_PER_BLOCK;
        samples.resize(padding, 0);
    }
    samples.extend(mono_pcm.iter().map(|&s| i32::from(s)));

    if samples.len() < SAMPLES_PER_BLOCK {
        samples.resize(SAMPLES_PER_BLOCK, 0);
    }

    Ok(samples)
}

fn decode_nibble(nibble: i32, shift: u8, filter: u8, p1: &mut i32, p2: &mut i32) -> i16 {
    let mut a = if shift <= 0x0C {
        ((if nibble < 8 { nibble } else { nibble - 16 }) << shift) >> 1
    } else if nibble < 8 {
        2048
    } else {
        -2048
    };

    a += brr_prediction(filter, *p1, *p2);
    a = a.clamp(-0x8000, 0x7FFF);
    if a > 0x3FFF {
        a -= 0x8000;
    } else if a < -0x4000 {
        a += 0x8000;
    }

    *p2 = *p1;
    *p1 = a;
    (2 * *p1) as i16
}

// Tepples compensation coefficients for the DSP's Gaussian low-pass.
const TREBLE_COEFS: [f64; 8] = [
    0.912962,
    -0.16199,
    -0.0153283,
    0.0426783,
    -0.0372004,
    0.023436,
    -0.0105816,
    0.00250474,
];

fn apply_treble_boost_filter(mono_pcm: &[i16]) -> Vec<i16> {
    let mut out = vec![0i16; mono_pcm.len()];
    if mono_pcm.is_empty() {
        return out;
    }

    for i in 0..mono_pcm.len() {
        let mut acc = f64::from(mono_pcm[i]) * TREBLE_COEFS[0];
        for (k, &coef) in TREBLE_COEFS.iter().enumerate().skip(1) {
            let plus = (i + k).min(mono_pcm.len() - 1);
            let minus = i.saturating_sub(k);
            acc += coef * f64::from(mono_pcm[plus]);
            acc += coef * f64::from(mono_pcm[minus]);
        }
        out[i] = acc.round().clamp(-32768.0, 32767.0) as i16;
    }

    out
}

/// Encode signed-16 mono PCM into BRR blocks.
///
/// The input is front-padded with zeros to a 16-sample multiple; a silent
/// lead-in block is prepended when the first block is not already silent so
/// the hardware starts decoding from a clean predictor state.
pub fn encode_pcm_to_brr(mono_pcm: &[i16], options: &BrrEncodeOptions) -> Result<BrrEncodeResult> {
    let treble_boosted;
    let working_pcm: &[i16] = if options.enhance_treble {
        treble_boosted = apply_treble_boost_filter(mono_pcm);
        &treble_boosted
    } else {
        mono_pcm
    };

    let samples = normalize_input_pcm(working_pcm)?;

    let mut loop_start_sample = options.loop_start_sample.unwrap_or(0);
    if options.enable_loop {
        if loop_start_sample >= working_pcm.len() {
            return Err(NspcError::InvalidInput(
                "Loop start sample is out of range".into(),
            ));
        }
        let prepended = samples.len() - working_pcm.len();
        loop_start_sample += prepended;
        loop_start_sample -= loop_start_sample % SAMPLES_PER_BLOCK;
    }

    let add_initial_block = samples[..SAMPLES_PER_BLOCK].iter().any(|&s| s != 0);

    let mut state = EncoderState {
        p1: 0,
        p2: 0,
        filter_at_loop: 0,
        p1_at_loop: 0,
        p2_at_loop: 0,
        filter_enabled: options.filter_enabled,
        wrap_enabled: options.wrap_enabled,
    };

    let mut out =
        Vec::with_capacity((samples.len() / SAMPLES_PER_BLOCK + usize::from(add_initial_block)) * BLOCK_SIZE);

    if add_initial_block {
        let loop_flag = if options.enable_loop { 0x02 } else { 0x00 };
        out.push(loop_flag);
        out.extend(std::iter::repeat(0u8).take(8));
    }

    for (block_index, chunk) in samples.chunks_exact(SAMPLES_PER_BLOCK).enumerate() {
        let mut block_pcm = [0i32; SAMPLES_PER_BLOCK];
        block_pcm.copy_from_slice(chunk);

        let sample_index = block_index * SAMPLES_PER_BLOCK;
        let is_loop_point = options.enable_loop && sample_index == loop_start_sample;
        let is_end_point = sample_index + SAMPLES_PER_BLOCK == samples.len();
        let mut block = encode_block(&mut state, &block_pcm, is_loop_point, is_end_point);
        if options.enable_loop {
            block[0] |= 0x02;
        }
        out.extend_from_slice(&block);
    }

    let loop_offset_bytes = options.enable_loop.then(|| {
        let loop_block_index = loop_start_sample / SAMPLES_PER_BLOCK + usize::from(add_initial_block);
        (loop_block_index * BLOCK_SIZE) as u32
    });

    Ok(BrrEncodeResult {
        bytes: out,
        loop_offset_bytes,
    })
}

/// Decode BRR blocks into signed-16 PCM. Stops at the first end-flagged
/// block; fails on empty or misaligned input.
pub fn decode_brr_to_pcm(brr_data: &[u8]) -> Result<Vec<i16>> {
    if brr_data.is_empty() {
        return Err(NspcError::InvalidInput("BRR data is empty".into()));
    }
    if brr_data.len() % BLOCK_SIZE != 0 {
        return Err(NspcError::InvalidInput(
            "BRR data size must be a multiple of 9 bytes".into(),
        ));
    }

    let mut pcm = Vec::with_capacity(brr_data.len() / BLOCK_SIZE * SAMPLES_PER_BLOCK);

    let mut p1 = 0i32;
    let mut p2 = 0i32;
    for block in brr_data.chunks_exact(BLOCK_SIZE) {
        let header = block[0];
        let filter = (header & 0x0C) >> 2;
        let shift = (header >> 4) & 0x0F;

        for &byte in &block[1..] {
            let high = i32::from((byte >> 4) & 0x0F);
            let low = i32::from(byte & 0x0F);
            pcm.push(decode_nibble(high, shift, filter, &mut p1, &mut p2));
            pcm.push(decode_nibble(low, shift, filter, &mut p1, &mut p2));
        }

        if header & 0x01 != 0 {
            break;
        }
    }

    Ok(pcm)
}

/// Validate a BRR payload: nonempty, block-aligned, legal shift nibbles and
/// exactly one end flag on the final block.
pub fn validate_brr(brr_data: &[u8], allow_extended_shift: bool) -> Result<()> {
    if brr_data.is_empty() {
        return Err(NspcError::InvalidInput("BRR data is empty".into()));
    }
    if brr_data.len() % BLOCK_SIZE != 0 {
        return Err(NspcError::InvalidInput(
            "BRR data size must be a multiple of 9 bytes".into(),
        ));
    }

    let block_count = brr_data.len() / BLOCK_SIZE;
    for (index, block) in brr_data.chunks_exact(BLOCK_SIZE).enumerate() {
        let header = block[0];
        let shift = header >> 4;
        if shift > 0x0C && !allow_extended_shift {
            return Err(NspcError::InvalidInput(format!(
                "BRR block {index} has invalid shift nibble {shift}"
            )));
        }

        let is_last = index + 1 == block_count;
        let has_end = header & 0x01 != 0;
        if has_end != is_last {
            return Err(NspcError::InvalidInput(format!(
                "BRR end flag {} at block {index}",
                if has_end { "appears early" } else { "is missing" }
            )));
        }
    }

    decode_brr_to_pcm(brr_data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle(len: usize, period: usize, amplitude: i16) -> Vec<i16> {
        (0..len)
            .map(|i| {
                let phase = i % period;
                let half = period / 2;
                let level = if phase < half {
                    phase as i32 * 2 - half as i32
                } else {
                    (period - phase) as i32 * 2 - half as i32
                };
                (level * i32::from(amplitude) / half as i32) as i16
            })
            .collect()
    }

    #[test]
    fn test_encode_rejects_empty_input() {
        assert!(encode_pcm_to_brr(&[], &BrrEncodeOptions::default()).is_err());
    }

    #[test]
    fn test_encode_block_aligned_with_single_end_flag() {
        let pcm = triangle(96, 32, 8000);
        let result = encode_pcm_to_brr(&pcm, &BrrEncodeOptions::default()).unwrap();
        assert_eq!(result.bytes.len() % 9, 0);
        let blocks: Vec<&[u8]> = result.bytes.chunks_exact(9).collect();
        for (i, block) in blocks.iter().enumerate() {
            let is_last = i + 1 == blocks.len();
            assert_eq!(block[0] & 1 != 0, is_last, "end flag wrong at block {i}");
        }
        validate_brr(&result.bytes, false).unwrap();
    }

    #[test]
    fn test_silent_input_needs_no_leadin_block() {
        let pcm = vec![0i16; 32];
        let result = encode_pcm_to_brr(&pcm, &BrrEncodeOptions::default()).unwrap();
        assert_eq!(result.bytes.len(), 2 * 9);
    }

    #[test]
    fn test_loud_start_gets_leadin_block() {
        let mut pcm = vec![4000i16; 32];
        pcm[0] = 4000;
        let result = encode_pcm_to_brr(&pcm, &BrrEncodeOptions::default()).unwrap();
        assert_eq!(result.bytes.len(), 3 * 9);
        // lead-in block is all zero nibbles
        assert_eq!(&result.bytes[1..9], &[0u8; 8]);
    }

    #[test]
    fn test_loop_flags_and_alignment() {
        let pcm = triangle(96, 32, 8000);
        let options = BrrEncodeOptions {
            enable_loop: true,
            loop_start_sample: Some(0),
            ..Default::default()
        };
        let result = encode_pcm_to_brr(&pcm, &options).unwrap();
        for block in result.bytes.chunks_exact(9) {
            assert_ne!(block[0] & 0x02, 0);
        }
        let loop_offset = result.loop_offset_bytes.unwrap();
        assert_eq!(loop_offset % 9, 0);
    }

    #[test]
    fn test_decode_round_trip_terminates() {
        let pcm = triangle(64, 16, 12000);
        let encoded = encode_pcm_to_brr(&pcm, &BrrEncodeOptions::default()).unwrap();
        let decoded = decode_brr_to_pcm(&encoded.bytes).unwrap();
        assert_eq!(decoded.len() % 16, 0);
        assert!(!decoded.is_empty());
    }

    #[test]
    fn test_decode_rejects_misaligned() {
        assert!(decode_brr_to_pcm(&[0u8; 10]).is_err());
        assert!(decode_brr_to_pcm(&[]).is_err());
    }

    #[test]
    fn test_encoder_tracks_decoder_closely_on_smooth_input() {
        let pcm = triangle(160, 32, 6000);
        let encoded = encode_pcm_to_brr(&pcm, &BrrEncodeOptions::default()).unwrap();
        let decoded = decode_brr_to_pcm(&encoded.bytes).unwrap();
        // the decoded tail aligns with the (front-padded) input
        let offset = decoded.len() - pcm.len();
        let mut worst = 0i32;
        for (i, &s) in pcm.iter().enumerate() {
            let d = i32::from(decoded[offset + i]) - i32::from(s);
            worst = worst.max(d.abs());
        }
        assert!(worst < 2048, "worst-case error {worst} too high");
    }

    #[test]
    fn test_validate_rejects_early_end_flag() {
        let mut bytes = vec![0u8; 18];
        bytes[0] = 0x01; // end in first of two blocks
        bytes[9] = 0x01;
        assert!(validate_brr(&bytes, false).is_err());
    }

    #[test]
    fn test_validate_rejects_extended_shift_by_default() {
        let mut bytes = vec![0u8; 9];
        bytes[0] = 0xD1; // shift 13 + end flag
        assert!(validate_brr(&bytes, false).is_err());
        assert!(validate_brr(&bytes, true).is_ok());
    }

    #[test]
    fn test_treble_boost_preserves_length() {
        let pcm = triangle(48, 16, 5000);
        let options = BrrEncodeOptions {
            enhance_treble: true,
            ..Default::default()
        };
        let result = encode_pcm_to_brr(&pcm, &options).unwrap();
        validate_brr(&result.bytes, false).unwrap();
    }
}
