//! VideoSentinel engine
//!
//! Batch processor for video libraries: probes files, classifies them
//! against modernization policies, re-encodes non-compliant files by driving
//! an external encoder, pipelines remote files through local staging, and
//! groups duplicates by perceptual hash or filename.

pub mod batch;
pub mod dupes;
pub mod encoder;
pub mod hasher;
pub mod pipeline;
pub mod policy;
pub mod probe;
pub mod progress;
pub mod scan;
pub mod shutdown;

pub use videosentinel_config as config;
pub use videosentinel_config::Config;

pub use batch::{BatchController, BatchOptions, BatchReport, FileOutcome, ReplaceError};
pub use dupes::{DuplicateGroup, PerceptualScan};
pub use encoder::{EncodeError, EncodeRequest, InvalidReason};
pub use hasher::{FrameHash, HashError};
pub use pipeline::{
    EntryState, NetworkPipeline, PipelineConfig, PipelineProgress, QueueEntry, QueueError,
};
pub use policy::{ComplianceAction, ComplianceVerdict, TargetCodec};
pub use probe::{MediaInfo, ProbeCache, ProbeError};
pub use progress::{NullSink, ProgressSink, ProgressUpdate};
pub use shutdown::ShutdownFlag;
