pub mod convert;
pub mod engine;
pub mod pool;
pub mod queue;
pub mod stats;

pub use convert::OutputFormat;
pub use engine::{PreviewEngine, PreviewState};
pub use pool::{FramePool, FRAME_POOL_SIZE};
pub use queue::{FrameQueue, MAX_FRAME};
pub use stats::{PipelineCounters, PipelineStats};
