//! ADSR/GAIN envelope generator

use super::{Dsp, EnvelopeMode};

impl Dsp {
    /// Advance one voice's envelope by one sample, gated by the rate counter.
    pub(crate) fn envelope_run(&mut self, voice: usize) {
        let adsr0 = self.latch.adsr0;
        let v = &mut self.voices[voice];
        let mut envelope = i32::from(v.envelope);

        if v.envelope_mode == EnvelopeMode::Release {
            envelope -= 0x8;
            if envelope < 0 {
                envelope = 0;
            }
            v.envelope = envelope as u16;
            return;
        }

        let rate: u32;
        let mut envelope_data = i32::from(v.adsr1);
        if adsr0 & 0x80 != 0 {
            // ADSR
            if v.envelope_mode >= EnvelopeMode::Decay {
                envelope -= 1;
                envelope -= envelope >> 8;
                rate = (envelope_data & 0x1F) as u32;
                let rate = if v.envelope_mode == EnvelopeMode::Decay {
                    u32::from((adsr0 >> 4) & 7) * 2 + 16
                } else {
                    rate
                };
                self.finish_envelope_step(voice, envelope, envelope_data, rate);
                return;
            }
            // attack
            rate = u32::from(adsr0 & 0x0F) * 2 + 1;
            envelope += if rate < 31 { 0x20 } else { 0x400 };
        } else {
            // GAIN
            envelope_data = i32::from(v.gain);
            let mode = envelope_data >> 5;
            if mode < 4 {
                // direct
                envelope = envelope_data << 4;
                rate = 31;
            } else {
                rate = (envelope_data & 0x1F) as u32;
                if mode == 4 {
                    // linear decrease
                    envelope -= 0x20;
                } else if mode < 6 {
                    // exponential decrease
                    envelope -= 1;
                    envelope -= envelope >> 8;
                } else {
                    // linear increase
                    envelope += 0x20;
                    if mode > 6 && v.env_scratch as u32 >= 0x600 {
                        // two-slope linear increase
                        envelope += 0x8 - 0x20;
                    }
                }
            }
        }

        self.finish_envelope_step(voice, envelope, envelope_data, rate);
    }

    fn finish_envelope_step(&mut self, voice: usize, mut envelope: i32, envelope_data: i32, rate: u32) {
        let fired = self.counter_poll(rate);
        let v = &mut self.voices[voice];

        // sustain level
        if (envelope >> 8) == (envelope_data >> 5) && v.envelope_mode == EnvelopeMode::Decay {
            v.envelope_mode = EnvelopeMode::Sustain;
        }
        v.env_scratch = envelope;

        // unsigned comparison so linear-decrease underflow also triggers
        if envelope as u32 > 0x7FF {
            envelope = if envelope < 0 { 0 } else { 0x7FF };
            if v.envelope_mode == EnvelopeMode::Attack {
                v.envelope_mode = EnvelopeMode::Decay;
            }
        }

        if fired {
            v.envelope = envelope as u16;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_steps_down_by_8() {
        let mut dsp = Dsp::new();
        dsp.voices[0].envelope = 0x100;
        dsp.voices[0].envelope_mode = EnvelopeMode::Release;
        dsp.envelope_run(0);
        assert_eq!(dsp.voices[0].envelope, 0x100 - 8);
    }

    #[test]
    fn test_release_floors_at_zero() {
        let mut dsp = Dsp::new();
        dsp.voices[0].envelope = 3;
        dsp.voices[0].envelope_mode = EnvelopeMode::Release;
        dsp.envelope_run(0);
        assert_eq!(dsp.voices[0].envelope, 0);
    }

    #[test]
    fn test_gain_direct_sets_level() {
        let mut dsp = Dsp::new();
        dsp.latch.adsr0 = 0x00; // GAIN mode
        dsp.voices[0].gain = 0x35; // direct, level 0x35 << 4
        dsp.voices[0].envelope_mode = EnvelopeMode::Attack;
        // rate 31 fires on every counter value divisible by 1
        dsp.envelope_run(0);
        assert_eq!(dsp.voices[0].envelope, 0x350);
    }

    #[test]
    fn test_attack_max_rate_jumps_0x400() {
        let mut dsp = Dsp::new();
        dsp.latch.adsr0 = 0x8F; // ADSR, attack rate nibble 15 -> rate 31
        dsp.voices[0].envelope_mode = EnvelopeMode::Attack;
        dsp.envelope_run(0);
        assert_eq!(dsp.voices[0].envelope, 0x400);
        dsp.envelope_run(0);
        // clamps at 0x7FF and flips to decay
        assert_eq!(dsp.voices[0].envelope, 0x7FF);
        assert_eq!(dsp.voices[0].envelope_mode, EnvelopeMode::Decay);
    }
}
