//! N-SPC song toolchain
//!
//! Command maps, the event model, the disassembler and serializer, the
//! project container with its ARAM usage model, the layout planner and the
//! subroutine optimizer, plus the interchange containers built on top.

pub mod asset;
pub mod command_map;
pub mod encode;
pub mod engine;
pub mod event;
pub mod layout;
pub mod optimize;
pub mod project;
pub mod project_file;
pub mod song;

pub use asset::{load_nti, save_nti, NtiAsset};
pub use command_map::CommandMap;
pub use encode::{encode_event_stream, encode_pattern, encode_sequence};
pub use engine::{EngineConfig, EngineExtension, EnginePatch, ExtensionVcmd, ReservedRegion};
pub use event::{EventEntry, EventId, NspcEvent, Vcmd};
pub use layout::{BuildOptions, CompileOutput, RoundTripReport, Upload, UploadChunk};
pub use optimize::{optimize_song_subroutines, OptimizerOptions};
pub use project::{
    AramRegion, AramRegionKind, AramUsage, BrrSample, NspcInstrument, NspcProject,
    SongAddressLayout,
};
pub use project_file::{load_project_ir, save_project_ir, EngineRetained, ProjectIr};
pub use song::{
    ContentOrigin, EventOwner, EventRef, NspcSong, Pattern, SequenceOp, SequenceTarget,
    Subroutine, Track,
};
