//! Face matching: ArcFace embeddings with a histogram-correlation fallback.
//!
//! The primary strategy extracts a 512-dimensional embedding from a face crop
//! aligned to the canonical 112×112 position and compares by Euclidean
//! distance. When the embedding model is unavailable the matcher degrades to
//! grayscale histogram correlation between the two face crops — explicitly
//! weaker, and always flagged in the result.

use crate::quality::{self, ImageBuffer};
use crate::types::{Embedding, EyePair, FaceRegion, MatchStrategy};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

/// Canonical aligned crop edge.
pub const ALIGNED_SIZE: usize = 112;
const EMBED_MEAN: f32 = 127.5;
const EMBED_STD: f32 = 127.5; // symmetric normalization, unlike detector models
const EMBED_DIM: usize = 512;
const EMBED_MODEL_VERSION: &str = "w600k_r50";

/// Comparison crop edge for the histogram fallback.
const HIST_CROP_SIZE: u32 = 100;

/// ArcFace reference eye centres for a 112×112 aligned crop.
const REFERENCE_EYES: [(f32, f32); 2] = [(38.2946, 51.6963), (73.5318, 51.5014)];

#[derive(Error, Debug)]
pub enum MatcherError {
    #[error("embedding model not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Produces identity embeddings from aligned face crops.
///
/// A trait seam so the orchestrator can be exercised with deterministic stub
/// encoders in tests.
pub trait FaceEncoder: Send {
    fn encode(&mut self, aligned: &[u8]) -> Result<Embedding, MatcherError>;
}

/// ArcFace embedding extractor via ONNX Runtime.
pub struct ArcFaceEncoder {
    session: Session,
}

impl ArcFaceEncoder {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, MatcherError> {
        if !model_path.exists() {
            return Err(MatcherError::ModelNotFound(
                model_path.display().to_string(),
            ));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// Preprocess a 112×112 grayscale aligned crop into a NCHW float tensor.
    fn preprocess(aligned: &[u8]) -> Array4<f32> {
        let size = ALIGNED_SIZE;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

        for y in 0..size {
            for x in 0..size {
                let pixel = aligned.get(y * size + x).copied().unwrap_or(0) as f32;
                let normalized = (pixel - EMBED_MEAN) / EMBED_STD;
                // Grayscale → 3-channel: replicate Y → [R=Y, G=Y, B=Y]
                tensor[[0, 0, y, x]] = normalized;
                tensor[[0, 1, y, x]] = normalized;
                tensor[[0, 2, y, x]] = normalized;
            }
        }

        tensor
    }
}

impl FaceEncoder for ArcFaceEncoder {
    fn encode(&mut self, aligned: &[u8]) -> Result<Embedding, MatcherError> {
        let input = Self::preprocess(aligned);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| MatcherError::InferenceFailed(format!("embedding extraction: {e}")))?;

        let raw: Vec<f32> = raw_data.to_vec();
        if raw.len() != EMBED_DIM {
            return Err(MatcherError::InferenceFailed(format!(
                "expected {EMBED_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        // L2-normalize
        let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
        let values = if norm > 0.0 {
            raw.iter().map(|x| x / norm).collect()
        } else {
            raw
        };

        Ok(Embedding {
            values,
            model_version: Some(EMBED_MODEL_VERSION.to_string()),
        })
    }
}

/// The strategy bound for a verifier instance.
pub enum MatchBackend {
    Embedding(Box<dyn FaceEncoder>),
    Histogram,
}

impl MatchBackend {
    pub fn strategy(&self) -> MatchStrategy {
        match self {
            MatchBackend::Embedding(_) => MatchStrategy::Embedding,
            MatchBackend::Histogram => MatchStrategy::HistogramFallback,
        }
    }
}

/// Align a face crop to the canonical 112×112 position.
///
/// With a detected eye pair, estimates the 2-point similarity transform
/// (scale, rotation, translation) mapping the eye centres onto the ArcFace
/// reference positions and samples through its inverse. Without eyes, or when
/// the eye geometry is degenerate, falls back to a plain bilinear resize of
/// the face crop.
pub fn align_face_crop(frame: &ImageBuffer, face: &FaceRegion, eyes: Option<&EyePair>) -> Vec<u8> {
    if let Some(pair) = eyes {
        let s1 = pair.left.center();
        let s2 = pair.right.center();
        let dx = s2.0 - s1.0;
        let dy = s2.1 - s1.1;
        let denom = dx * dx + dy * dy;

        if denom >= 4.0 {
            let (d1, d2) = (REFERENCE_EYES[0], REFERENCE_EYES[1]);
            // Complex-number form of the similarity: T(z) = a·z + b, with
            // a = (d2 - d1) / (s2 - s1) and b = d1 - a·s1.
            let ex = d2.0 - d1.0;
            let ey = d2.1 - d1.1;
            let ar = (ex * dx + ey * dy) / denom;
            let ai = (ey * dx - ex * dy) / denom;
            let br = d1.0 - (ar * s1.0 - ai * s1.1);
            let bi = d1.1 - (ai * s1.0 + ar * s1.1);

            let a_norm = ar * ar + ai * ai;
            if a_norm > 0.0 {
                let mut out = vec![0u8; ALIGNED_SIZE * ALIGNED_SIZE];
                for y in 0..ALIGNED_SIZE {
                    for x in 0..ALIGNED_SIZE {
                        // Inverse transform: z = (w - b) / a.
                        let zr = x as f32 - br;
                        let zi = y as f32 - bi;
                        let sx = (zr * ar + zi * ai) / a_norm;
                        let sy = (zi * ar - zr * ai) / a_norm;
                        out[y * ALIGNED_SIZE + x] = sample_bilinear(frame, sx, sy);
                    }
                }
                return out;
            }
        }
    }

    let crop = frame.crop_gray(face.x, face.y, face.width, face.height);
    quality::resize_gray(
        &crop,
        face.width,
        face.height,
        ALIGNED_SIZE as u32,
        ALIGNED_SIZE as u32,
    )
}

/// Bilinear sample of the grayscale plane; outside the frame reads as black.
fn sample_bilinear(frame: &ImageBuffer, x: f32, y: f32) -> u8 {
    let w = frame.width as i32;
    let h = frame.height as i32;
    if x < -1.0 || y < -1.0 || x >= w as f32 || y >= h as f32 {
        return 0;
    }

    let x0 = x.floor() as i32;
    let y0 = y.floor() as i32;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let pixel = |px: i32, py: i32| -> f32 {
        if px < 0 || py < 0 || px >= w || py >= h {
            0.0
        } else {
            frame.gray[(py * w + px) as usize] as f32
        }
    };

    let val = pixel(x0, y0) * (1.0 - fx) * (1.0 - fy)
        + pixel(x0 + 1, y0) * fx * (1.0 - fy)
        + pixel(x0, y0 + 1) * (1.0 - fx) * fy
        + pixel(x0 + 1, y0 + 1) * fx * fy;
    val.round().clamp(0.0, 255.0) as u8
}

/// Fallback comparison: both face crops are resized to a common size and
/// their 256-bin intensity histograms compared by Pearson correlation.
pub fn histogram_correlation(frame_a: &ImageBuffer, face_a: &FaceRegion, frame_b: &ImageBuffer, face_b: &FaceRegion) -> f64 {
    let crop_a = normalized_crop(frame_a, face_a);
    let crop_b = normalized_crop(frame_b, face_b);
    correlate_histograms(&histogram(&crop_a), &histogram(&crop_b))
}

fn normalized_crop(frame: &ImageBuffer, face: &FaceRegion) -> Vec<u8> {
    let crop = frame.crop_gray(face.x, face.y, face.width, face.height);
    quality::resize_gray(&crop, face.width, face.height, HIST_CROP_SIZE, HIST_CROP_SIZE)
}

fn histogram(gray: &[u8]) -> [f64; 256] {
    let mut bins = [0.0f64; 256];
    for &p in gray {
        bins[p as usize] += 1.0;
    }
    bins
}

fn correlate_histograms(a: &[f64; 256], b: &[f64; 256]) -> f64 {
    let n = a.len() as f64;
    let mean_a = a.iter().sum::<f64>() / n;
    let mean_b = b.iter().sum::<f64>() / n;

    let mut cov = 0.0f64;
    let mut var_a = 0.0f64;
    let mut var_b = 0.0f64;
    for i in 0..a.len() {
        let da = a[i] - mean_a;
        let db = b[i] - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }

    let denom = (var_a * var_b).sqrt();
    if denom > 0.0 {
        cov / denom
    } else {
        0.0
    }
}

/// Map an embedding distance to a 0–100 confidence percentage.
pub fn confidence_from_distance(distance: f32) -> f32 {
    ((1.0 - distance) * 100.0).clamp(0.0, 100.0)
}

/// Map a histogram correlation to a 0–100 confidence percentage.
pub fn confidence_from_correlation(correlation: f64) -> f32 {
    ((correlation * 100.0) as f32).clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EyeRegion;

    fn frame_from_gray(width: u32, height: u32, gray: Vec<u8>) -> ImageBuffer {
        let rgb = gray.iter().flat_map(|&p| [p, p, p]).collect();
        ImageBuffer { width, height, rgb, gray }
    }

    fn eye_at(x: u32, y: u32) -> EyeRegion {
        EyeRegion { x, y, width: 20, height: 20 }
    }

    #[test]
    fn test_preprocess_output_shape() {
        let aligned = vec![128u8; ALIGNED_SIZE * ALIGNED_SIZE];
        let tensor = ArcFaceEncoder::preprocess(&aligned);
        assert_eq!(tensor.shape(), &[1, 3, ALIGNED_SIZE, ALIGNED_SIZE]);
    }

    #[test]
    fn test_preprocess_normalization_and_channels() {
        let aligned = vec![200u8; ALIGNED_SIZE * ALIGNED_SIZE];
        let tensor = ArcFaceEncoder::preprocess(&aligned);
        let expected = (200.0 - EMBED_MEAN) / EMBED_STD;
        assert!((tensor[[0, 0, 5, 5]] - expected).abs() < 1e-6);
        assert_eq!(tensor[[0, 0, 5, 5]], tensor[[0, 1, 5, 5]]);
        assert_eq!(tensor[[0, 1, 5, 5]], tensor[[0, 2, 5, 5]]);
    }

    #[test]
    fn test_align_uniform_stays_uniform() {
        let frame = frame_from_gray(200, 200, vec![90; 200 * 200]);
        let face = FaceRegion { x: 40, y: 40, width: 120, height: 120, score: 3.0 };
        let eyes = EyePair { left: eye_at(60, 80), right: eye_at(110, 80) };
        let aligned = align_face_crop(&frame, &face, Some(&eyes));
        assert_eq!(aligned.len(), ALIGNED_SIZE * ALIGNED_SIZE);
        // Interior pixels come from inside the uniform frame.
        assert_eq!(aligned[56 * ALIGNED_SIZE + 56], 90);
    }

    #[test]
    fn test_align_degenerate_eyes_falls_back_to_resize() {
        let frame = frame_from_gray(200, 200, vec![133; 200 * 200]);
        let face = FaceRegion { x: 40, y: 40, width: 120, height: 120, score: 3.0 };
        // Coincident eye centres: degenerate geometry.
        let eyes = EyePair { left: eye_at(90, 80), right: eye_at(90, 80) };
        let aligned = align_face_crop(&frame, &face, Some(&eyes));
        let resized = align_face_crop(&frame, &face, None);
        assert_eq!(aligned, resized);
    }

    #[test]
    fn test_align_maps_eye_centres_to_reference() {
        // Mark single bright pixels at the eye centres and check they land
        // near the canonical positions.
        let mut gray = vec![0u8; 300 * 300];
        let left = (100u32, 140u32);
        let right = (180u32, 140u32);
        gray[(140 * 300 + 100) as usize] = 255;
        gray[(140 * 300 + 180) as usize] = 255;
        let frame = frame_from_gray(300, 300, gray);
        let face = FaceRegion { x: 60, y: 80, width: 160, height: 160, score: 3.0 };
        let eyes = EyePair {
            left: EyeRegion { x: left.0 - 10, y: left.1 - 10, width: 20, height: 20 },
            right: EyeRegion { x: right.0 - 10, y: right.1 - 10, width: 20, height: 20 },
        };

        let aligned = align_face_crop(&frame, &face, Some(&eyes));

        let brightest_near = |cx: f32, cy: f32| -> u8 {
            let mut best = 0u8;
            for y in (cy as usize).saturating_sub(2)..=(cy as usize + 2) {
                for x in (cx as usize).saturating_sub(2)..=(cx as usize + 2) {
                    best = best.max(aligned[y * ALIGNED_SIZE + x]);
                }
            }
            best
        };
        assert!(brightest_near(REFERENCE_EYES[0].0, REFERENCE_EYES[0].1) > 0);
        assert!(brightest_near(REFERENCE_EYES[1].0, REFERENCE_EYES[1].1) > 0);
    }

    #[test]
    fn test_histogram_correlation_identical_crops() {
        let gray: Vec<u8> = (0..(150u32 * 150)).map(|i| (i % 251) as u8).collect();
        let frame = frame_from_gray(150, 150, gray);
        let face = FaceRegion { x: 10, y: 10, width: 100, height: 100, score: 3.0 };
        let corr = histogram_correlation(&frame, &face, &frame, &face);
        assert!((corr - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_histogram_correlation_disjoint_intensities() {
        // One crop dark, one bright: negatively correlated histograms.
        let dark = frame_from_gray(120, 120, vec![30; 120 * 120]);
        let bright = frame_from_gray(120, 120, vec![220; 120 * 120]);
        let face = FaceRegion { x: 10, y: 10, width: 100, height: 100, score: 3.0 };
        let corr = histogram_correlation(&dark, &face, &bright, &face);
        assert!(corr < 0.7);
    }

    #[test]
    fn test_confidence_from_distance_clamps() {
        assert_eq!(confidence_from_distance(0.0), 100.0);
        assert!((confidence_from_distance(0.4) - 60.0).abs() < 1e-3);
        assert_eq!(confidence_from_distance(1.5), 0.0);
        assert_eq!(confidence_from_distance(-0.5), 100.0);
    }

    #[test]
    fn test_confidence_from_correlation_clamps() {
        assert_eq!(confidence_from_correlation(0.7), 70.0);
        assert_eq!(confidence_from_correlation(-0.2), 0.0);
        assert_eq!(confidence_from_correlation(1.3), 100.0);
    }

    #[test]
    fn test_backend_strategy_labels() {
        assert_eq!(MatchBackend::Histogram.strategy(), MatchStrategy::HistogramFallback);
    }
}
