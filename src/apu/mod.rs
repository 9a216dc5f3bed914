//! SNES APU emulation
//!
//! Hosts the sound CPU and the DSP, clocking them in lockstep: the CPU runs
//! until 64 clocks have accumulated, then the DSP produces one output
//! sample. The cycle remainder carries across calls.

pub mod bits;
pub(crate) mod dsp;
pub(crate) mod smp;

use dsp::Dsp;
use smp::Smp;

pub use smp::{AccessKind, Flags, MemoryAccess, Registers};

/// CPU clocks per DSP output sample.
const CLOCKS_PER_SAMPLE: u32 = 64;

/// Non-owning view over the 64 KiB ARAM shared by the CPU and DSP.
pub struct AramView<'a> {
    mem: &'a mut [u8; 0x10000],
}

impl<'a> AramView<'a> {
    /// ARAM size in bytes.
    pub const SIZE: usize = 0x10000;

    pub(crate) fn new(mem: &'a mut [u8; 0x10000]) -> Self {
        AramView { mem }
    }

    /// Read one byte.
    #[inline]
    pub fn read(&self, address: u16) -> u8 {
        self.mem[usize::from(address)]
    }

    /// Read a little-endian 16-bit word (wrapping at the top of ARAM).
    #[inline]
    pub fn read16(&self, address: u16) -> u16 {
        u16::from(self.read(address)) | (u16::from(self.read(address.wrapping_add(1))) << 8)
    }

    /// Write one byte.
    #[inline]
    pub fn write(&mut self, address: u16, value: u8) {
        self.mem[usize::from(address)] = value;
    }

    /// Write a little-endian 16-bit word (wrapping at the top of ARAM).
    #[inline]
    pub fn write16(&mut self, address: u16, value: u16) {
        self.write(address, value as u8);
        self.write(address.wrapping_add(1), (value >> 8) as u8);
    }

    /// Borrow a byte range.
    pub fn bytes(&self, start: u16, len: usize) -> &[u8] {
        let start = usize::from(start);
        &self.mem[start..start + len]
    }

    /// Borrow the whole address space.
    pub fn all(&self) -> &[u8; 0x10000] {
        self.mem
    }
}

/// The SNES APU: sound CPU + DSP behind one object.
///
/// External code observes ARAM and the DSP register file only through this
/// wrapper. Scheduling is single-threaded; callbacks observe but must not
/// re-enter `step`.
pub struct Apu {
    smp: Smp,
    dsp: Dsp,
}

impl Apu {
    /// Create a powered-down APU. Call [`Apu::reset`] before stepping.
    pub fn new() -> Self {
        Apu {
            smp: Smp::new(),
            dsp: Dsp::new(),
        }
    }

    /// Power both cores. `ipl_rom` replaces the built-in bootstrap when
    /// given; `preserve_ram` keeps ARAM (and the noise LFSR) intact.
    pub fn reset(&mut self, ipl_rom: Option<&[u8; 64]>, preserve_ram: bool) {
        self.dsp.power(preserve_ram);
        if let Some(ipl) = ipl_rom {
            self.smp.iplrom = *ipl;
        } else {
            self.smp.iplrom = smp::DEFAULT_IPL;
        }
        self.smp.power();
    }

    /// Run the sound CPU for one DSP sample's worth of clocks, then the DSP
    /// for one sample. Returns the stereo sample.
    ///
    /// The clock remainder is carried, never discarded, so long runs stay
    /// exactly on the 64-clocks-per-sample ratio.
    pub fn step(&mut self) -> (i16, i16) {
        while self.smp.cycle_counter < CLOCKS_PER_SAMPLE {
            self.smp.run_instruction(&mut self.dsp);
        }
        self.smp.cycle_counter -= CLOCKS_PER_SAMPLE;

        self.dsp.run_sample();
        (self.dsp.sample_left, self.dsp.sample_right)
    }

    /// Advance only the DSP by one sample, leaving the CPU frozen. Used by
    /// preview paths that poke DSP registers directly.
    pub fn step_dsp_only(&mut self) -> (i16, i16) {
        self.dsp.run_sample();
        (self.dsp.sample_left, self.dsp.sample_right)
    }

    // ---- mailbox ports ----

    /// Read CPU output port 0..=3 as the host sees it.
    pub fn read_port(&self, port: u8) -> u8 {
        self.smp.port_read(port)
    }

    /// Write CPU input port 0..=3 as the host does.
    pub fn write_port(&mut self, port: u8, data: u8) {
        self.smp.port_write(port, data);
    }

    // ---- ARAM ----

    /// Read one ARAM byte.
    pub fn read_aram(&self, address: u16) -> u8 {
        self.dsp.aram[usize::from(address)]
    }

    /// Write one ARAM byte.
    pub fn write_aram(&mut self, address: u16, value: u8) {
        self.dsp.aram[usize::from(address)] = value;
    }

    /// Read a block of ARAM.
    pub fn read_aram_block(&self, address: u16, len: usize) -> &[u8] {
        let start = usize::from(address);
        &self.dsp.aram[start..start + len]
    }

    /// Write a block of ARAM.
    pub fn write_aram_block(&mut self, address: u16, data: &[u8]) {
        let start = usize::from(address);
        self.dsp.aram[start..start + data.len()].copy_from_slice(data);
    }

    /// Mutable view over the whole ARAM.
    pub fn aram_view(&mut self) -> AramView<'_> {
        AramView::new(&mut self.dsp.aram)
    }

    // ---- DSP registers ----

    /// Read a DSP register; the index is masked to 7 bits.
    pub fn read_dsp(&self, register: u8) -> u8 {
        self.dsp.read(register & 0x7F)
    }

    /// Write a DSP register; the index is masked to 7 bits.
    pub fn write_dsp(&mut self, register: u8, value: u8) {
        self.dsp.write(register & 0x7F, value);
    }

    /// Restore an SMP I/O register ($F0..$FF) through the proper write path
    /// so internal state stays consistent (used by SPC loading).
    pub fn write_smp_io(&mut self, register: u8, value: u8) {
        let address = 0x00F0 | u16::from(register & 0x0F);
        self.smp.write_io(&mut self.dsp, address, value);
    }

    /// Read an SMP I/O register through the read path.
    pub fn read_smp_io(&mut self, register: u8) -> u8 {
        let address = 0x00F0 | u16::from(register & 0x0F);
        self.smp.read_io(&mut self.dsp, address)
    }

    /// Restore the three timer readback counters (SPC loading; the bus
    /// exposes them read-only).
    pub(crate) fn restore_timer_outputs(&mut self, outputs: [u8; 3]) {
        self.smp.timer0.stage3 = outputs[0] & 0x0F;
        self.smp.timer1.stage3 = outputs[1] & 0x0F;
        self.smp.timer2.stage3 = outputs[2] & 0x0F;
    }

    // ---- CPU registers ----

    /// CPU register file.
    pub fn registers(&self) -> Registers {
        self.smp.regs
    }

    /// Set the program counter.
    pub fn set_pc(&mut self, pc: u16) {
        self.smp.regs.pc = pc;
    }

    /// Set the accumulator.
    pub fn set_a(&mut self, a: u8) {
        self.smp.regs.a = a;
    }

    /// Set index X.
    pub fn set_x(&mut self, x: u8) {
        self.smp.regs.x = x;
    }

    /// Set index Y.
    pub fn set_y(&mut self, y: u8) {
        self.smp.regs.y = y;
    }

    /// Set the stack pointer.
    pub fn set_sp(&mut self, s: u8) {
        self.smp.regs.s = s;
    }

    /// Set the status word from its raw byte.
    pub fn set_ps(&mut self, p: u8) {
        self.smp.regs.p = Flags::from_bits_retain(p);
    }

    // ---- hooks ----

    /// Mark a PC for the execute hook.
    pub fn add_breakpoint(&mut self, address: u16) {
        self.smp.add_breakpoint(address);
    }

    /// Unmark a PC.
    pub fn remove_breakpoint(&mut self, address: u16) {
        self.smp.remove_breakpoint(address);
    }

    /// Clear every breakpoint.
    pub fn clear_breakpoints(&mut self) {
        self.smp.clear_breakpoints();
    }

    /// Install the execute hook fired before a marked instruction.
    /// Callbacks observe only; they must not call back into `step`.
    pub fn set_exec_hook(&mut self, hook: Option<Box<dyn FnMut(u16)>>) {
        self.smp.exec_hook = hook;
    }

    /// Install the memory-access watch.
    pub fn set_access_hook(&mut self, hook: Option<Box<dyn FnMut(&MemoryAccess)>>) {
        self.smp.access_hook = hook;
    }

    // ---- channels ----

    /// Per-voice mute bitmask (set bit = audible).
    pub fn channel_mask(&self) -> u8 {
        self.dsp.channel_mask
    }

    /// Replace the per-voice mute bitmask.
    pub fn set_channel_mask(&mut self, mask: u8) {
        self.dsp.channel_mask = mask;
    }

    /// Mute or unmute one voice.
    pub fn mute_channel(&mut self, channel: u8, mute: bool) {
        if channel > 7 {
            return;
        }
        if mute {
            self.dsp.channel_mask &= !(1 << channel);
        } else {
            self.dsp.channel_mask |= 1 << channel;
        }
    }

    /// True when voice `channel` is muted.
    pub fn is_channel_muted(&self, channel: u8) -> bool {
        channel > 7 || self.dsp.channel_mask & (1 << channel) == 0
    }

    /// Reflects FLG bit 7: writing 0 to FLG is what audibly starts the DSP.
    pub fn muted(&self) -> bool {
        self.dsp.muted()
    }

    /// Total CPU clocks since power-on.
    pub fn cycle_count(&self) -> u64 {
        self.smp.global_cycle_counter
    }
}

impl Default for Apu {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_leaves_control_at_entry() {
        let mut apu = Apu::new();
        apu.reset(None, false);
        assert_eq!(apu.registers().pc, 0xFFC0);
        // park a STOP at the entry point and run the IPL handshake into it
        apu.write_aram(0x0200, 0xFF);
        apu.write_aram(0x00A0, 0x77); // the bootstrap clears the zero page
        for _ in 0..256 {
            apu.step();
        }
        assert_eq!(apu.registers().pc, 0x0201);
        assert_eq!(apu.registers().s, 0xEF);
        assert_eq!(apu.read_aram(0x00A0), 0x00);
    }

    #[test]
    fn test_step_dsp_only_freezes_cpu() {
        let mut apu = Apu::new();
        apu.reset(None, false);
        apu.set_pc(0x0200);
        let before = apu.registers();
        let cycles = apu.cycle_count();
        for _ in 0..64 {
            apu.step_dsp_only();
        }
        let after = apu.registers();
        assert_eq!(before.pc, after.pc);
        assert_eq!(before.a, after.a);
        assert_eq!(before.x, after.x);
        assert_eq!(before.y, after.y);
        assert_eq!(before.s, after.s);
        assert_eq!(before.p, after.p);
        assert_eq!(cycles, apu.cycle_count());
    }

    #[test]
    fn test_cycle_carry_preserved_across_steps() {
        let mut apu = Apu::new();
        apu.reset(None, false);
        // 2N steps in one loop equal N + N steps split across loops
        let mut other = Apu::new();
        other.reset(None, false);
        let mut samples_a = Vec::new();
        for _ in 0..32 {
            samples_a.push(apu.step());
        }
        let mut samples_b = Vec::new();
        for _ in 0..16 {
            samples_b.push(other.step());
        }
        for _ in 0..16 {
            samples_b.push(other.step());
        }
        assert_eq!(samples_a, samples_b);
    }

    #[test]
    fn test_dsp_register_masking() {
        let mut apu = Apu::new();
        apu.reset(None, false);
        apu.write_dsp(0x8C, 0x55); // masked to 0x0C (MVOLL)
        assert_eq!(apu.read_dsp(0x0C), 0x55);
    }

    #[test]
    fn test_muted_reflects_flg() {
        let mut apu = Apu::new();
        apu.reset(None, false);
        assert!(apu.muted());
        apu.write_dsp(0x6C, 0x00);
        assert!(!apu.muted());
    }

    #[test]
    fn test_ports_round_trip() {
        let mut apu = Apu::new();
        apu.reset(None, false);
        apu.write_port(1, 0x5C);
        // the CPU sees the write at $F5; the host port readback is the CPU's
        // outgoing register, still zero
        assert_eq!(apu.read_port(1), 0x00);
        assert_eq!(apu.read_smp_io(0x05), 0x5C);
    }
}
