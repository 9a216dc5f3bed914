//! Voice pipeline sub-steps V1..V9
//!
//! Each step touches exactly the state the hardware touches at that clock so
//! mid-sample register writes land (or miss) the same way they do on silicon.

use super::{Dsp, EnvelopeMode};
use crate::apu::bits::sclamp16;

impl Dsp {
    fn voice_output(&mut self, voice: usize, channel: usize) {
        let v = &self.voices[voice];
        let mut amp = (i64::from(self.latch.output) * i64::from(v.volume[channel])) >> 7;

        if self.channel_mask & (1 << v.number) == 0 {
            amp = 0;
        }

        self.mainvol.output[channel] =
            sclamp16(i64::from(self.mainvol.output[channel]) + amp);

        if v.latched_echo {
            self.echo.output[channel] = sclamp16(i64::from(self.echo.output[channel]) + amp);
        }
    }

    /// V1: compute the directory entry address from the latched source.
    pub(crate) fn voice1(&mut self, voice: usize) {
        self.brr.address = (u16::from(self.brr.latched_bank) << 8)
            .wrapping_add(u16::from(self.brr.source) << 2);
        self.brr.source = self.voices[voice].source;
    }

    /// V2: read the next block address (start on fresh key-on, loop
    /// otherwise); latch ADSR0 and the pitch low byte.
    pub(crate) fn voice2(&mut self, voice: usize) {
        let mut address = self.brr.address;
        if self.voices[voice].keyon_delay == 0 {
            address = address.wrapping_add(2);
        }
        let lo = self.aram_read(address);
        let hi = self.aram_read(address.wrapping_add(1));
        self.brr.next_address = u16::from(lo) | (u16::from(hi) << 8);
        self.latch.adsr0 = self.voices[voice].adsr0;

        self.latch.pitch = self.voices[voice].pitch & 0xFF;
    }

    pub(crate) fn voice3(&mut self, voice: usize) {
        self.voice3a(voice);
        self.voice3b(voice);
        self.voice3c(voice);
    }

    /// V3a: OR in the pitch high byte.
    pub(crate) fn voice3a(&mut self, voice: usize) {
        self.latch.pitch |= self.voices[voice].pitch & !0xFF;
    }

    /// V3b: read the current BRR data byte and block header.
    pub(crate) fn voice3b(&mut self, voice: usize) {
        let v = &self.voices[voice];
        self.brr.byte = self.aram_read(v.brr_address.wrapping_add(u16::from(v.brr_offset)));
        self.brr.header = self.aram_read(v.brr_address);
    }

    /// V3c: pitch modulation, key-on warm-up, interpolation, envelope.
    pub(crate) fn voice3c(&mut self, voice: usize) {
        if self.voices[voice].latched_modulate {
            let delta =
                ((i32::from(self.latch.output) >> 5) * i32::from(self.latch.pitch)) >> 10;
            self.latch.pitch =
                Self::mask15((i32::from(self.latch.pitch) + delta) as u32);
        }

        {
            let next_address = self.brr.next_address;
            let v = &mut self.voices[voice];
            if v.keyon_delay != 0 {
                if v.keyon_delay == 5 {
                    v.brr_address = next_address;
                    v.brr_offset = 1;
                    v.buffer_offset = 0;
                    self.brr.header = 0;
                }

                v.envelope = 0;
                v.env_scratch = 0;

                v.gaussian_offset = 0;
                v.keyon_delay -= 1;
                if v.keyon_delay & 3 != 0 {
                    v.gaussian_offset = 0x4000;
                }

                self.latch.pitch = 0;
            }
        }

        let mut output = Self::gaussian_interpolate(&self.voices[voice]);

        if self.voices[voice].latched_noise {
            output = i32::from(((u32::from(self.noise.lfsr) << 1) as u16) as i16);
        }

        {
            let v = &mut self.voices[voice];
            self.latch.output =
                (((output * i32::from(v.envelope)) >> 11) & !1) as i16;
            v.envx = (v.envelope >> 4) as u8;
        }

        if self.mainvol.reset || self.brr.header & 3 == 1 {
            let v = &mut self.voices[voice];
            v.envelope_mode = EnvelopeMode::Release;
            v.envelope = 0;
        }

        if self.clock.sample {
            let v = &mut self.voices[voice];
            if v.latched_keyoff {
                v.envelope_mode = EnvelopeMode::Release;
            }

            if v.keyon_latched {
                v.keyon_delay = 5;
                v.envelope_mode = EnvelopeMode::Attack;
            }
        }

        if self.voices[voice].keyon_delay == 0 {
            self.envelope_run(voice);
        }
    }

    /// V4: decode when the phase crossed a sample boundary, advance the block
    /// cursor and the Gaussian phase, mix into the left output.
    pub(crate) fn voice4(&mut self, voice: usize) {
        self.voices[voice].looped = false;
        if self.voices[voice].gaussian_offset >= 0x4000 {
            self.brr_decode(voice);
            let header = self.brr.header;
            let next_address = self.brr.next_address;
            let v = &mut self.voices[voice];
            v.brr_offset += 2;
            if v.brr_offset >= 9 {
                v.brr_address = v.brr_address.wrapping_add(9);
                if header & 1 != 0 {
                    v.brr_address = next_address;
                    v.looped = true;
                }
                v.brr_offset = 1;
            }
        }

        {
            let pitch = self.latch.pitch;
            let v = &mut self.voices[voice];
            let advanced = u32::from(v.gaussian_offset & 0x3FFF) + u32::from(pitch);
            v.gaussian_offset = if advanced > 0x7FFF {
                0x7FFF
            } else {
                advanced as u16
            };
        }

        self.voice_output(voice, 0);
    }

    /// V5: mix into the right output, fold the looped flag into `end`.
    pub(crate) fn voice5(&mut self, voice: usize) {
        self.voice_output(voice, 1);

        let v = &mut self.voices[voice];
        v.end |= v.looped;

        if v.keyon_delay == 5 {
            v.end = false;
        }
    }

    /// V6: latch OUTX.
    pub(crate) fn voice6(&mut self, _voice: usize) {
        self.latch.outx = (self.latch.output >> 8) as u8;
    }

    /// V7: assemble ENDX from every voice; latch ENVX.
    pub(crate) fn voice7(&mut self, voice: usize) {
        let mut endx = 0u8;
        for n in 0..8 {
            endx |= u8::from(self.voices[n].end) << n;
        }
        self.registers[0x7C] = endx;

        self.latch.envx = self.voices[voice].envx;
    }

    /// V8: publish OUTX to the voice readback register.
    pub(crate) fn voice8(&mut self, voice: usize) {
        self.registers[(voice << 4) | 0x09] = self.latch.outx;
    }

    /// V9: publish ENVX to the voice readback register.
    pub(crate) fn voice9(&mut self, voice: usize) {
        self.registers[(voice << 4) | 0x08] = self.latch.envx;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_voice1_latches_directory_entry() {
        let mut dsp = Dsp::new();
        dsp.brr.latched_bank = 0x20;
        dsp.brr.source = 0x05;
        dsp.voices[2].source = 0x09;
        dsp.voice1(2);
        assert_eq!(dsp.brr.address, 0x2000 + 0x05 * 4);
        assert_eq!(dsp.brr.source, 0x09);
    }

    #[test]
    fn test_voice2_reads_loop_address_after_warmup() {
        let mut dsp = Dsp::new();
        dsp.brr.address = 0x2014;
        // dir entry: start 0x3000, loop 0x3009
        dsp.aram[0x2014] = 0x00;
        dsp.aram[0x2015] = 0x30;
        dsp.aram[0x2016] = 0x09;
        dsp.aram[0x2017] = 0x30;
        dsp.voices[0].keyon_delay = 0;
        dsp.voice2(0);
        assert_eq!(dsp.brr.next_address, 0x3009);

        dsp.brr.address = 0x2014;
        dsp.voices[0].keyon_delay = 5;
        dsp.voice2(0);
        assert_eq!(dsp.brr.next_address, 0x3000);
    }

    #[test]
    fn test_endx_assembled_from_voice_flags() {
        let mut dsp = Dsp::new();
        dsp.voices[1].end = true;
        dsp.voices[6].end = true;
        dsp.voice7(0);
        assert_eq!(dsp.registers[0x7C], 0x42);
    }

    #[test]
    fn test_keyon_warmup_silences_and_arms_block() {
        let mut dsp = Dsp::new();
        dsp.brr.next_address = 0x4321;
        dsp.voices[0].keyon_delay = 5;
        dsp.voices[0].envelope = 0x7FF;
        dsp.voice3c(0);
        let v = &dsp.voices[0];
        assert_eq!(v.brr_address, 0x4321);
        assert_eq!(v.brr_offset, 1);
        assert_eq!(v.envelope, 0);
        assert_eq!(v.keyon_delay, 4);
        // countdown 4 -> phase clamped for warm-up silence
        assert_eq!(v.gaussian_offset, 0x4000);
        assert_eq!(dsp.latch.pitch, 0);
    }

    #[test]
    fn test_channel_mask_silences_voice() {
        let mut dsp = Dsp::new();
        dsp.latch.output = 0x1000;
        dsp.voices[0].volume[0] = 0x40;
        dsp.channel_mask = 0xFE;
        dsp.voice4(0);
        assert_eq!(dsp.mainvol.output[0], 0);
        dsp.channel_mask = 0xFF;
        dsp.latch.output = 0x1000;
        dsp.voice_output(0, 0);
        assert_eq!(dsp.mainvol.output[0], (0x1000 * 0x40) >> 7);
    }
}
