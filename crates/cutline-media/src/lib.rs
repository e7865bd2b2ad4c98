// crates/cutline-media/src/lib.rs

pub mod disk_cache;
pub mod ffmpeg;
pub mod frame_cache;
pub mod gop_index;
pub mod proxy;
pub mod reader;
pub mod scrub_decoder;
pub mod session;
pub mod source;

pub use frame_cache::{FrameCache, RenderDelegate, ViewSpec};
pub use gop_index::GopIndex;
pub use proxy::{ProxyDecision, ProxyManager, ProxyService};
pub use reader::TrackReader;
pub use scrub_decoder::{BackendProvider, DecodeOutcome, EnhancedScrubDecoder};
pub use session::{DecodeBackend, DecodedFrame, DecoderSession, LadderLevel};
pub use source::{MediaSource, SourceHandle, SourceOpener, TrackInfo};
