//! Gaussian interpolation
//!
//! The 512-entry cosine-apodized sinc table is derived deterministically at
//! first use; the four mirrored quadrants are normalized so that each phase's
//! four taps sum to 2048.

use std::sync::OnceLock;

use super::{Dsp, Voice};
use crate::apu::bits::sclamp16;

static GAUSSIAN_TABLE: OnceLock<[i16; 512]> = OnceLock::new();

/// The process-wide interpolation table.
pub(crate) fn gaussian_table() -> &'static [i16; 512] {
    GAUSSIAN_TABLE.get_or_init(construct_table)
}

fn construct_table() -> [i16; 512] {
    let mut table = [0f64; 512];
    for n in 0..512usize {
        let k = 0.5 + n as f64;
        let s = (std::f64::consts::PI * k * 1.280 / 1024.0).sin();
        let t = ((std::f64::consts::PI * k * 2.000 / 1023.0).cos() - 1.0) * 0.50;
        let u = ((std::f64::consts::PI * k * 4.000 / 1023.0).cos() - 1.0) * 0.08;
        table[511 - n] = s * (t + u + 1.0) / k;
    }

    let mut out = [0i16; 512];
    for phase in 0..128usize {
        let sum = table[phase] + table[phase + 256] + table[511 - phase] + table[255 - phase];
        let scale = 2048.0 / sum;
        out[phase] = (table[phase] * scale + 0.5) as i16;
        out[phase + 256] = (table[phase + 256] * scale + 0.5) as i16;
        out[511 - phase] = (table[511 - phase] * scale + 0.5) as i16;
        out[255 - phase] = (table[255 - phase] * scale + 0.5) as i16;
    }
    out
}

impl Dsp {
    /// Four-tap interpolation over the voice's decoded ring buffer.
    ///
    /// The first three taps accumulate with 16-bit wraparound; the final tap
    /// is clamped and the LSB cleared, as the hardware does.
    pub(crate) fn gaussian_interpolate(v: &Voice) -> i32 {
        let table = gaussian_table();
        let offset = usize::from((v.gaussian_offset >> 4) & 0xFF);

        let mut off = (usize::from(v.buffer_offset) + usize::from(v.gaussian_offset >> 12)) % 12;
        let mut output: i32;
        output = (i32::from(table[255 - offset]) * i32::from(v.buffer[off])) >> 11;
        off = (off + 1) % 12;
        output += (i32::from(table[511 - offset]) * i32::from(v.buffer[off])) >> 11;
        off = (off + 1) % 12;
        output += (i32::from(table[256 + offset]) * i32::from(v.buffer[off])) >> 11;
        off = (off + 1) % 12;
        output = i32::from(output as i16);
        output += (i32::from(table[offset]) * i32::from(v.buffer[off])) >> 11;
        sclamp16(i64::from(output)) & !1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taps_sum_to_2048() {
        let table = gaussian_table();
        for phase in 0..128usize {
            let sum = i32::from(table[phase])
                + i32::from(table[phase + 256])
                + i32::from(table[511 - phase])
                + i32::from(table[255 - phase]);
            assert!((2047..=2049).contains(&sum), "phase {phase} sums to {sum}");
        }
    }

    #[test]
    fn test_table_is_monotonic_at_center() {
        let table = gaussian_table();
        // The impulse response peaks at the end of the table.
        assert!(table[511] > table[300]);
        assert!(table[300] > table[0]);
    }

    #[test]
    fn test_interpolate_silence_is_zero() {
        let v = Voice::new(0);
        assert_eq!(Dsp::gaussian_interpolate(&v), 0);
    }
}
