//! Verification orchestrator.
//!
//! Sequences the pipeline stages per request:
//!
//! ```text
//! Decoding → Located → EyesChecked → SpoofChecked → Matched → Decided
//! ```
//!
//! Each stage short-circuits on its first failure into a `Rejected(reason)`
//! result — a frame that fails face location never reaches the spoof battery,
//! and an absent reference image rejects before any image processing runs.
//! Expected validation failures never raise; only unusable model artifacts at
//! construction abort with [`PipelineError`].

use crate::config::{MatchPolicy, PipelineConfig};
use crate::locator::{FaceLocator, LocatorError, SeetaBackend};
use crate::matcher::{self, ArcFaceEncoder, MatchBackend};
use crate::quality;
use crate::spoof;
use crate::types::{EyePair, MatchStrategy, RejectionReason, VerificationResult};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("locator: {0}")]
    Locator(#[from] LocatorError),
}

/// The verification pipeline bound to one detection backend and one match
/// strategy.
///
/// The match strategy is capability-checked once at construction: if the
/// embedding model cannot be loaded the histogram strategy is bound for the
/// lifetime of the verifier, and every result records which strategy ran.
pub struct Verifier {
    locator: FaceLocator,
    backend: MatchBackend,
    config: PipelineConfig,
}

impl Verifier {
    pub fn new(locator: FaceLocator, backend: MatchBackend, config: PipelineConfig) -> Self {
        Self {
            locator,
            backend,
            config,
        }
    }

    /// Build a verifier from model artifacts on disk.
    ///
    /// The cascade detection model is required. The embedding model is
    /// optional: when missing or unloadable the verifier degrades to the
    /// histogram fallback strategy rather than failing.
    pub fn with_models(
        cascade_model: &Path,
        embedding_model: &Path,
        config: PipelineConfig,
    ) -> Result<Self, PipelineError> {
        let seeta = SeetaBackend::load(cascade_model, &config.locator)?;
        let locator = FaceLocator::new(Box::new(seeta), config.locator.clone());

        let backend = match ArcFaceEncoder::load(embedding_model) {
            Ok(encoder) => MatchBackend::Embedding(Box::new(encoder)),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "embedding model unavailable — binding histogram fallback strategy"
                );
                MatchBackend::Histogram
            }
        };

        Ok(Self::new(locator, backend, config))
    }

    /// Strategy bound at construction.
    pub fn match_strategy(&self) -> MatchStrategy {
        self.backend.strategy()
    }

    /// Verify a candidate image against a stored reference image.
    ///
    /// Every expected failure is recovered into a rejected result carrying
    /// the most specific reason available. One structured audit event is
    /// emitted per invocation.
    pub fn verify(
        &mut self,
        candidate: &[u8],
        reference: Option<&[u8]>,
        policy: MatchPolicy,
    ) -> VerificationResult {
        let result = self.run(candidate, reference, policy);

        tracing::info!(
            target: "rollcall_core::audit",
            accepted = result.accepted,
            confidence = result.confidence_score,
            strategy = ?result.match_strategy_used,
            reason = %result
                .failure_reason
                .as_ref()
                .map(|r| r.to_string())
                .unwrap_or_default(),
            signals = %serde_json::to_string(&result.spoof_signals).unwrap_or_default(),
            "verification decided"
        );

        result
    }

    fn run(
        &mut self,
        candidate: &[u8],
        reference: Option<&[u8]>,
        policy: MatchPolicy,
    ) -> VerificationResult {
        let bound_strategy = self.backend.strategy();

        // Reference precondition — checked before any image processing.
        let Some(reference) = reference else {
            return VerificationResult::rejected(RejectionReason::NoReferenceImage, bound_strategy);
        };

        // Decoding
        let frame = match quality::decode(candidate, &self.config.quality) {
            Ok(frame) => frame,
            Err(e) => {
                return VerificationResult::rejected(
                    RejectionReason::MalformedImage { detail: e.to_string() },
                    bound_strategy,
                );
            }
        };

        // Quality gate
        let sharpness = quality::laplacian_variance(&frame.gray, frame.width, frame.height);
        if sharpness < self.config.quality.min_sharpness {
            return VerificationResult::rejected(
                RejectionReason::ImageTooBlurry { sharpness },
                bound_strategy,
            );
        }

        // Located
        let face = match self.locator.locate_face(&frame) {
            Ok(face) => face,
            Err(reason) => return VerificationResult::rejected(reason, bound_strategy),
        };

        // EyesChecked
        let eyes = self.locator.locate_eyes(&frame, &face);
        if eyes.len() != 2 {
            return VerificationResult::rejected(
                RejectionReason::EyesNotVisible { eyes_found: eyes.len() },
                bound_strategy,
            );
        }
        let eye_pair = EyePair { left: eyes[0], right: eyes[1] };

        // SpoofChecked — all six signals are computed for the audit trail;
        // the verdict fails closed on the first failing technique in order.
        let signals = spoof::run_battery(&frame, &face, &self.config.spoof);
        if let Some(technique) = spoof::first_failure(&signals) {
            return VerificationResult {
                accepted: false,
                confidence_score: 0.0,
                failure_reason: Some(RejectionReason::SpoofingDetected { technique }),
                match_strategy_used: bound_strategy,
                spoof_signals: signals,
            };
        }

        // Reference preparation. An undecodable or faceless stored reference
        // maps to NoReferenceImage; the caller's remedy is re-enrollment.
        let ref_frame = match quality::decode(reference, &self.config.quality) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "stored reference image failed to decode");
                return VerificationResult::rejected(
                    RejectionReason::NoReferenceImage,
                    bound_strategy,
                );
            }
        };
        let Some(ref_face) = self.locator.locate_best_face(&ref_frame) else {
            tracing::warn!("no face located in stored reference image");
            return VerificationResult::rejected(RejectionReason::NoReferenceImage, bound_strategy);
        };
        let ref_eyes = {
            let eyes = self.locator.locate_eyes(&ref_frame, &ref_face);
            if eyes.len() == 2 {
                Some(EyePair { left: eyes[0], right: eyes[1] })
            } else {
                None
            }
        };

        // Matched → Decided
        let threshold = self.config.matching.distance_threshold(policy);
        let mut strategy = bound_strategy;

        let embedding_decision = match &mut self.backend {
            MatchBackend::Embedding(encoder) => {
                let aligned_candidate = matcher::align_face_crop(&frame, &face, Some(&eye_pair));
                let aligned_reference =
                    matcher::align_face_crop(&ref_frame, &ref_face, ref_eyes.as_ref());

                match (
                    encoder.encode(&aligned_candidate),
                    encoder.encode(&aligned_reference),
                ) {
                    (Ok(probe), Ok(stored)) => {
                        let distance = probe.euclidean_distance(&stored);
                        tracing::debug!(distance, threshold, "embedding comparison");
                        Some((distance <= threshold, matcher::confidence_from_distance(distance)))
                    }
                    (Err(e), _) | (_, Err(e)) => {
                        tracing::warn!(
                            error = %e,
                            "embedding inference failed — degrading this request to histogram fallback"
                        );
                        None
                    }
                }
            }
            MatchBackend::Histogram => None,
        };

        let (matched, confidence) = match embedding_decision {
            Some(decision) => decision,
            None => {
                strategy = MatchStrategy::HistogramFallback;
                let correlation =
                    matcher::histogram_correlation(&frame, &face, &ref_frame, &ref_face);
                tracing::debug!(
                    correlation,
                    floor = self.config.matching.histogram_correlation_floor,
                    "histogram comparison"
                );
                (
                    correlation >= self.config.matching.histogram_correlation_floor,
                    matcher::confidence_from_correlation(correlation),
                )
            }
        };

        VerificationResult {
            accepted: matched,
            confidence_score: confidence,
            failure_reason: if matched {
                None
            } else {
                Some(RejectionReason::MatchBelowThreshold { confidence })
            },
            match_strategy_used: strategy,
            spoof_signals: signals,
        }
    }

    /// Screen an image for enrollment as a profile reference: it must decode,
    /// pass the sharpness floor, contain exactly one face, and show both
    /// eyes. Returns the rejection reason, or `None` when acceptable.
    pub fn screen_reference(&self, image: &[u8]) -> Option<RejectionReason> {
        let frame = match quality::decode(image, &self.config.quality) {
            Ok(frame) => frame,
            Err(e) => {
                return Some(RejectionReason::MalformedImage { detail: e.to_string() });
            }
        };

        let sharpness = quality::laplacian_variance(&frame.gray, frame.width, frame.height);
        if sharpness < self.config.quality.min_sharpness {
            return Some(RejectionReason::ImageTooBlurry { sharpness });
        }

        let face = match self.locator.locate_face(&frame) {
            Ok(face) => face,
            Err(reason) => return Some(reason),
        };

        let eyes = self.locator.locate_eyes(&frame, &face);
        if eyes.len() != 2 {
            return Some(RejectionReason::EyesNotVisible { eyes_found: eyes.len() });
        }

        None
    }
}
