//! The generation pipeline: stage coordinator, fan-out pool and the
//! per-artifact regeneration loop, plus the job handlers that run it.

pub mod coordinator;
pub mod fanout;
pub mod handlers;
pub mod regeneration;

pub use coordinator::{
    Capabilities, GenerationOutput, GenerationPipeline, GenerationRequest, PipelineError,
};
pub use fanout::{FanOut, FanOutItem, FanOutReport, FanOutTick, QaSummary, run_all};
pub use handlers::{GenerationHandler, RegenerationHandler, RegenerationRequest};
pub use regeneration::RegenerationLoop;
