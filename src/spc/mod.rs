//! SPC snapshot format
//!
//! The standard 65920-byte-minimum SPC700 snapshot: a 256-byte header with
//! signature, tag metadata and CPU registers, 64 KiB of ARAM, then the 128
//! DSP registers. Loading restores everything into the emulator through the
//! proper write paths so internal state stays consistent.

use nom::bytes::complete::{tag, take};
use nom::number::complete::{le_u16, le_u8};
use nom::IResult;

use crate::apu::Apu;
use crate::nspc::Upload;
use crate::{NspcError, Result};

const SPC_SIGNATURE: &[u8] = b"SNES-SPC700 Sound File Data v0.30";
const SPC_HEADER_SIZE: usize = 0x100;
const ARAM_SIZE: usize = 0x10000;
const DSP_REGISTER_COUNT: usize = 128;
/// Smallest loadable image: header + ARAM + DSP registers.
pub const SPC_MIN_FILE_SIZE: usize = SPC_HEADER_SIZE + ARAM_SIZE + DSP_REGISTER_COUNT;
/// Size of a written image (standard layout with the trailing extra RAM).
pub const SPC_FILE_SIZE: usize = 0x10200;

/// Textual metadata from the snapshot header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpcFileInfo {
    /// Song title (32 bytes)
    pub song_title: String,
    /// Game title (32 bytes)
    pub game_title: String,
    /// Dumper name (16 bytes)
    pub dumper: String,
    /// Comment (32 bytes)
    pub comment: String,
    /// Artist (32 bytes)
    pub artist: String,
    /// Track length in seconds (3 decimal ASCII bytes)
    pub track_length_seconds: u32,
    /// Fade length in milliseconds (5 decimal ASCII bytes)
    pub fade_length_ms: u32,
}

/// CPU registers at their fixed header offsets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpcRegisters {
    /// Program counter
    pub pc: u16,
    /// Accumulator
    pub a: u8,
    /// Index X
    pub x: u8,
    /// Index Y
    pub y: u8,
    /// Status word
    pub psw: u8,
    /// Stack pointer
    pub sp: u8,
}

/// A parsed snapshot: metadata, registers, ARAM and DSP registers.
pub struct SpcImage {
    /// Header metadata
    pub info: SpcFileInfo,
    /// CPU registers
    pub registers: SpcRegisters,
    /// The 64 KiB ARAM payload
    pub aram: Box<[u8; ARAM_SIZE]>,
    /// The DSP register file
    pub dsp_registers: [u8; DSP_REGISTER_COUNT],
}

fn text_field(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim_end().to_string()
}

fn decimal_field(bytes: &[u8]) -> u32 {
    let text = text_field(bytes);
    text.trim().parse().unwrap_or(0)
}

fn parse_header(input: &[u8]) -> IResult<&[u8], (SpcFileInfo, SpcRegisters)> {
    let (input, _) = tag(SPC_SIGNATURE)(input)?;
    let (input, _) = take(2usize)(input)?; // 0x1A 0x1A
    let (input, _has_id666) = le_u8(input)?;
    let (input, _version_minor) = le_u8(input)?;

    let (input, pc) = le_u16(input)?;
    let (input, a) = le_u8(input)?;
    let (input, x) = le_u8(input)?;
    let (input, y) = le_u8(input)?;
    let (input, psw) = le_u8(input)?;
    let (input, sp) = le_u8(input)?;
    let (input, _reserved) = take(2usize)(input)?;

    let (input, song_title) = take(32usize)(input)?;
    let (input, game_title) = take(32usize)(input)?;
    let (input, dumper) = take(16usize)(input)?;
    let (input, comment) = take(32usize)(input)?;
    let (input, _date) = take(11usize)(input)?;
    let (input, track_length) = take(3usize)(input)?;
    let (input, fade_length) = take(5usize)(input)?;
    let (input, artist) = take(32usize)(input)?;

    let info = SpcFileInfo {
        song_title: text_field(song_title),
        game_title: text_field(game_title),
        dumper: text_field(dumper),
        comment: text_field(comment),
        artist: text_field(artist),
        track_length_seconds: decimal_field(track_length),
        fade_length_ms: decimal_field(fade_length),
    };
    let registers = SpcRegisters {
        pc,
        a,
        x,
        y,
        psw,
        sp,
    };

    Ok((input, (info, registers)))
}

impl SpcImage {
    /// Parse a snapshot, checking the signature and minimum size.
    pub fn parse(data: &[u8]) -> Result<SpcImage> {
        if data.len() < SPC_MIN_FILE_SIZE {
            return Err(NspcError::InvalidInput(format!(
                "SPC file is {} bytes; at least {SPC_MIN_FILE_SIZE} required",
                data.len()
            )));
        }

        let (_, (info, registers)) = parse_header(data)
            .map_err(|_| NspcError::InvalidInput("SPC header signature mismatch".into()))?;

        let mut aram = Box::new([0u8; ARAM_SIZE]);
        aram.copy_from_slice(&data[SPC_HEADER_SIZE..SPC_HEADER_SIZE + ARAM_SIZE]);

        let mut dsp_registers = [0u8; DSP_REGISTER_COUNT];
        dsp_registers.copy_from_slice(
            &data[SPC_HEADER_SIZE + ARAM_SIZE..SPC_HEADER_SIZE + ARAM_SIZE + DSP_REGISTER_COUNT],
        );

        Ok(SpcImage {
            info,
            registers,
            aram,
            dsp_registers,
        })
    }

    /// Restore this snapshot into an APU: ARAM and DSP registers verbatim,
    /// CPU registers, then the I/O-controlled SMP registers through their
    /// write path.
    pub fn load_into(&self, apu: &mut Apu) {
        apu.reset(None, false);

        apu.write_aram_block(0, self.aram.as_ref());

        for (register, &value) in self.dsp_registers.iter().enumerate() {
            apu.write_dsp(register as u8, value);
        }

        apu.set_pc(self.registers.pc);
        apu.set_a(self.registers.a);
        apu.set_x(self.registers.x);
        apu.set_y(self.registers.y);
        apu.set_ps(self.registers.psw);
        apu.set_sp(self.registers.sp);

        // $F1 control first (it can clear ports), then the DSP address
        // select, the mailbox ports, aux registers and timer targets
        apu.write_smp_io(0x01, self.aram[0x00F1]);
        apu.write_smp_io(0x02, self.aram[0x00F2]);
        for port in 0..4u8 {
            let value = self.aram[0x00F4 + usize::from(port)];
            apu.write_smp_io(0x04 + port, value);
            apu.write_port(port, value);
        }
        apu.write_smp_io(0x08, self.aram[0x00F8]);
        apu.write_smp_io(0x09, self.aram[0x00F9]);
        apu.write_smp_io(0x0A, self.aram[0x00FA]);
        apu.write_smp_io(0x0B, self.aram[0x00FB]);
        apu.write_smp_io(0x0C, self.aram[0x00FC]);
        // timer readbacks are read-only on the bus; restore them directly
        apu.restore_timer_outputs([
            self.aram[0x00FD] & 0x0F,
            self.aram[0x00FE] & 0x0F,
            self.aram[0x00FF] & 0x0F,
        ]);
    }

    /// Capture an APU into a snapshot image.
    pub fn capture(apu: &Apu, info: &SpcFileInfo) -> SpcImage {
        let registers = apu.registers();
        let mut aram = Box::new([0u8; ARAM_SIZE]);
        aram.copy_from_slice(apu.read_aram_block(0, ARAM_SIZE));

        let mut dsp_registers = [0u8; DSP_REGISTER_COUNT];
        for (register, slot) in dsp_registers.iter_mut().enumerate() {
            *slot = apu.read_dsp(register as u8);
        }

        SpcImage {
            info: info.clone(),
            registers: SpcRegisters {
                pc: registers.pc,
                a: registers.a,
                x: registers.x,
                y: registers.y,
                psw: registers.p.bits(),
                sp: registers.s,
            },
            aram,
            dsp_registers,
        }
    }

    /// Serialize back to the standard byte layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; SPC_FILE_SIZE];

        out[..SPC_SIGNATURE.len()].copy_from_slice(SPC_SIGNATURE);
        out[0x21] = 0x1A;
        out[0x22] = 0x1A;
        out[0x23] = 0x1A; // ID666 tag present
        out[0x24] = 30;

        out[0x25..0x27].copy_from_slice(&self.registers.pc.to_le_bytes());
        out[0x27] = self.registers.a;
        out[0x28] = self.registers.x;
        out[0x29] = self.registers.y;
        out[0x2A] = self.registers.psw;
        out[0x2B] = self.registers.sp;

        let mut write_text = |offset: usize, len: usize, text: &str| {
            let bytes = text.as_bytes();
            let count = bytes.len().min(len);
            out[offset..offset + count].copy_from_slice(&bytes[..count]);
        };
        write_text(0x2E, 32, &self.info.song_title);
        write_text(0x4E, 32, &self.info.game_title);
        write_text(0x6E, 16, &self.info.dumper);
        write_text(0x7E, 32, &self.info.comment);
        write_text(0xA9, 3, &format!("{:03}", self.info.track_length_seconds.min(999)));
        write_text(0xAC, 5, &format!("{:05}", self.info.fade_length_ms.min(99999)));
        write_text(0xB1, 32, &self.info.artist);

        out[SPC_HEADER_SIZE..SPC_HEADER_SIZE + ARAM_SIZE].copy_from_slice(self.aram.as_ref());
        out[SPC_HEADER_SIZE + ARAM_SIZE..SPC_HEADER_SIZE + ARAM_SIZE + DSP_REGISTER_COUNT]
            .copy_from_slice(&self.dsp_registers);

        out
    }

    /// Copy the image and overwrite ARAM bytes from an upload, with bounds
    /// checking per chunk.
    pub fn overlay_upload(base_spc: &[u8], upload: &Upload) -> Result<Vec<u8>> {
        if base_spc.len() < SPC_MIN_FILE_SIZE {
            return Err(NspcError::InvalidInput("Base SPC image is too small".into()));
        }

        let mut output = base_spc.to_vec();
        for chunk in &upload.chunks {
            let offset = SPC_HEADER_SIZE + usize::from(chunk.address);
            let end = offset + chunk.bytes.len();
            if end > SPC_HEADER_SIZE + ARAM_SIZE || end > output.len() {
                return Err(NspcError::InvalidInput(format!(
                    "Upload chunk {} at ${:04X} exceeds SPC image bounds",
                    chunk.label, chunk.address
                )));
            }
            output[offset..end].copy_from_slice(&chunk.bytes);
        }

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nspc::UploadChunk;

    fn sample_image() -> SpcImage {
        let mut aram = Box::new([0u8; ARAM_SIZE]);
        aram[0x0200] = 0xFF;
        aram[0x00FA] = 0x10; // timer 0 target
        aram[0x00F2] = 0x4C;
        SpcImage {
            info: SpcFileInfo {
                song_title: "Title Theme".into(),
                game_title: "Some Game".into(),
                dumper: "dumper".into(),
                comment: "test".into(),
                artist: "composer".into(),
                track_length_seconds: 120,
                fade_length_ms: 8000,
            },
            registers: SpcRegisters {
                pc: 0x0200,
                a: 0x11,
                x: 0x22,
                y: 0x33,
                psw: 0x02,
                sp: 0xEF,
            },
            aram,
            dsp_registers: [0u8; DSP_REGISTER_COUNT],
        }
    }

    #[test]
    fn test_round_trip_bytes() {
        let image = sample_image();
        let bytes = image.to_bytes();
        assert_eq!(bytes.len(), SPC_FILE_SIZE);

        let parsed = SpcImage::parse(&bytes).unwrap();
        assert_eq!(parsed.info, image.info);
        assert_eq!(parsed.registers, image.registers);
        assert_eq!(parsed.aram[0x0200], 0xFF);
    }

    #[test]
    fn test_parse_rejects_bad_signature() {
        let mut bytes = sample_image().to_bytes();
        bytes[0] = b'X';
        assert!(SpcImage::parse(&bytes).is_err());
    }

    #[test]
    fn test_parse_rejects_truncated() {
        let bytes = sample_image().to_bytes();
        assert!(SpcImage::parse(&bytes[..SPC_MIN_FILE_SIZE - 1]).is_err());
    }

    #[test]
    fn test_load_restores_cpu_and_io() {
        let image = sample_image();
        let mut apu = Apu::new();
        image.load_into(&mut apu);

        let regs = apu.registers();
        assert_eq!(regs.pc, 0x0200);
        assert_eq!(regs.a, 0x11);
        assert_eq!(regs.s, 0xEF);
        assert_eq!(apu.read_aram(0x0200), 0xFF);
        // DSP select restored through the write path
        assert_eq!(apu.read_smp_io(0x02), 0x4C);
    }

    #[test]
    fn test_overlay_writes_chunks() {
        let base = sample_image().to_bytes();
        let upload = Upload {
            chunks: vec![UploadChunk {
                address: 0x1234,
                bytes: vec![0xAA, 0xBB],
                label: "patch".into(),
            }],
        };
        let patched = SpcImage::overlay_upload(&base, &upload).unwrap();
        assert_eq!(patched[SPC_HEADER_SIZE + 0x1234], 0xAA);
        assert_eq!(patched[SPC_HEADER_SIZE + 0x1235], 0xBB);

        let oversized = Upload {
            chunks: vec![UploadChunk {
                address: 0xFFFF,
                bytes: vec![0, 0],
                label: "oob".into(),
            }],
        };
        assert!(SpcImage::overlay_upload(&base, &oversized).is_err());
    }
}
