//! SNES APU Emulator and N-SPC Tracker Toolchain Core
//!
//! A cycle-accurate emulator of the SNES audio subsystem (SPC700-family sound
//! CPU plus the 8-voice DSP) together with the toolchain needed to turn a
//! running sound-driver snapshot back into an editable song and recompile it
//! into audio RAM.
//!
//! # Features
//! - Cycle-accurate sound CPU with all 256 opcodes, timers and mailbox ports
//! - 32-step DSP sample pipeline with Gaussian BRR playback, ADSR/GAIN
//!   envelopes, FIR echo and noise
//! - BRR block-ADPCM codec with exhaustive per-block shift/filter search
//! - N-SPC song disassembler and serializer under a configurable command map
//! - ARAM layout planner, upload builder and suffix-automaton subroutine
//!   optimizer
//! - SPC snapshot loading/saving and upload overlay
//!
//! # Quick start
//! ## Run the emulator
//! ```no_run
//! use nspckit::apu::Apu;
//! let mut apu = Apu::new();
//! apu.reset(None, false);
//! let (left, right) = apu.step();
//! # let _ = (left, right);
//! ```
//!
//! ## Disassemble and rebuild a song
//! ```no_run
//! use nspckit::nspc::{BuildOptions, EngineConfig, NspcProject};
//! # fn load_aram() -> Box<[u8; 0x10000]> { Box::new([0; 0x10000]) }
//! let engine = EngineConfig::default();
//! let mut project = NspcProject::new(engine, load_aram()).unwrap();
//! let output = project.build_song_upload(0, BuildOptions::default()).unwrap();
//! for chunk in &output.upload.chunks {
//!     println!("{} -> ${:04X} ({} bytes)", chunk.label, chunk.address, chunk.bytes.len());
//! }
//! ```

#![warn(missing_docs)]

pub mod apu; // APU emulation (sound CPU + DSP)
pub mod brr; // BRR codec
pub mod nspc; // Song model, disassembler, serializer, layout, optimizer
pub mod spc; // SPC snapshot format

/// Error type for toolchain operations
#[derive(thiserror::Error, Debug)]
pub enum NspcError {
    /// Malformed SPC/BRR/project/NTI payload, illegal command-map
    /// configuration, or an address outside ARAM
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A project declares an engine other than the loaded base
    #[error("Engine mismatch: {0}")]
    EngineMismatch(String),

    /// A strict command map encountered an unmapped opcode
    #[error("Strict mapping miss: {0}")]
    StrictMappingMiss(String),

    /// A layout request cannot fit in the remaining free ARAM ranges
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// An event stream or payload parsed into an illegal form
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<String> for NspcError {
    /// Converts a String into `NspcError::Other`.
    ///
    /// Prefer the specific variant constructors where the failure kind is
    /// known; the taxonomy is what callers match on.
    fn from(msg: String) -> Self {
        NspcError::Other(msg)
    }
}

impl From<&str> for NspcError {
    /// Converts a string slice into `NspcError::Other`.
    fn from(msg: &str) -> Self {
        NspcError::Other(msg.to_string())
    }
}

/// Result type for toolchain operations
pub type Result<T> = std::result::Result<T, NspcError>;

// Public API exports
pub use apu::{AccessKind, Apu, AramView, MemoryAccess};
pub use brr::{decode_brr_to_pcm, encode_pcm_to_brr, validate_brr, BrrEncodeOptions, BrrEncodeResult};
pub use nspc::{
    BuildOptions, CommandMap, EngineConfig, NspcProject, NspcSong, OptimizerOptions, Upload,
    UploadChunk,
};
pub use spc::{SpcFileInfo, SpcImage};
