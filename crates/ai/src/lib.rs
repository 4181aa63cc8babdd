//! `inkwell-ai`
//!
//! **Responsibility:** boundary to the generation capabilities the pipeline consumes.
//!
//! This crate only describes *what* is asked of a provider:
//! - A text generator turns a brief into a draft plus discovered entities.
//! - An artifact generator turns a request into content.
//! - An evaluator judges content and returns a verdict with structured issues.
//!
//! Providers and their wire protocols live outside this workspace.

pub mod capability;
pub mod error;
pub mod feedback;
pub mod pricing;

pub use capability::{
    ArtifactGenerator, ArtifactRequest, Avoidance, CallUsage, EntityRef, Evaluation, Evaluator,
    GeneratedContent, ReferenceContent, TextDraft, TextGenerator, TextRequest,
};
pub use error::GenerationError;
pub use feedback::augment_request;
pub use pricing::{ModelPrice, PriceTable};
