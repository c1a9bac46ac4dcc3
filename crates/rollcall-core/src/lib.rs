//! rollcall-core — face verification and presentation-attack detection.
//!
//! Validates a single still image through a staged pipeline (quality gate,
//! cascade face location, eye visibility, six-technique anti-spoofing
//! battery, embedding match with histogram fallback) and produces one
//! immutable [`VerificationResult`] per invocation.

pub mod config;
pub mod locator;
pub mod matcher;
pub mod pipeline;
pub mod quality;
pub mod spoof;
pub mod types;

pub use config::{MatchPolicy, PipelineConfig};
pub use pipeline::{PipelineError, Verifier};
pub use types::{
    Embedding, EyePair, EyeRegion, FaceRegion, MatchStrategy, RejectionReason, SpoofSignal,
    SpoofTechnique, VerificationResult,
};
