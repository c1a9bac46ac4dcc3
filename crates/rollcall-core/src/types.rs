use serde::{Deserialize, Serialize};

/// Rectangle of a detected face within a decoded frame, in pixel coordinates.
///
/// Always fully contained within the frame that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Cascade classifier score for this region.
    pub score: f32,
}

impl FaceRegion {
    /// Whether `other` lies fully inside this region.
    pub fn contains(&self, other: &EyeRegion) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.x + other.width <= self.x + self.width
            && other.y + other.height <= self.y + self.height
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// One detected eye sub-region, in frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EyeRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl EyeRegion {
    /// Centre point of the region.
    pub fn center(&self) -> (f32, f32) {
        (
            self.x as f32 + self.width as f32 / 2.0,
            self.y as f32 + self.height as f32 / 2.0,
        )
    }
}

/// Both eyes of an accepted face: left first, right second (image order).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EyePair {
    pub left: EyeRegion,
    pub right: EyeRegion,
}

/// The six anti-spoofing techniques, in battery evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpoofTechnique {
    /// Laplacian-variance re-check on the face crop.
    FaceSharpness,
    /// High-pass filter variance — screen pixel-grid interference.
    MoireInterference,
    /// Hue histogram peak count — emissive-display gamut.
    ColorGamut,
    /// Large rectangular contour — device bezel.
    ScreenBorder,
    /// Frame brightness standard deviation — uniform screen emission.
    LightingUniformity,
    /// 8-aligned spectral magnitude ratio — compression block grid.
    CompressionGrid,
}

impl SpoofTechnique {
    /// All techniques in battery order.
    pub const ALL: [SpoofTechnique; 6] = [
        SpoofTechnique::FaceSharpness,
        SpoofTechnique::MoireInterference,
        SpoofTechnique::ColorGamut,
        SpoofTechnique::ScreenBorder,
        SpoofTechnique::LightingUniformity,
        SpoofTechnique::CompressionGrid,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SpoofTechnique::FaceSharpness => "face-sharpness",
            SpoofTechnique::MoireInterference => "moire-interference",
            SpoofTechnique::ColorGamut => "color-gamut",
            SpoofTechnique::ScreenBorder => "screen-border",
            SpoofTechnique::LightingUniformity => "lighting-uniformity",
            SpoofTechnique::CompressionGrid => "compression-grid",
        }
    }
}

impl std::fmt::Display for SpoofTechnique {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one anti-spoofing technique over one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpoofSignal {
    pub technique: SpoofTechnique,
    /// The measured value the verdict was taken on.
    pub metric: f64,
    pub passed: bool,
    pub reason: String,
}

/// Face embedding vector (512-dimensional for the bundled ArcFace model).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    /// Compute Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// Which comparison strategy produced a match decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchStrategy {
    /// Deep embedding comparison (primary).
    Embedding,
    /// Grayscale histogram correlation (degraded).
    HistogramFallback,
}

/// Why a verification was rejected. Every variant carries enough detail for
/// the caller to show an actionable message and for security review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum RejectionReason {
    MalformedImage { detail: String },
    ImageTooBlurry { sharpness: f64 },
    NoFaceDetected,
    MultipleFacesDetected { count: usize },
    EyesNotVisible { eyes_found: usize },
    SpoofingDetected { technique: SpoofTechnique },
    NoReferenceImage,
    MatchBelowThreshold { confidence: f32 },
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectionReason::MalformedImage { detail } => {
                write!(f, "image could not be decoded: {detail}")
            }
            RejectionReason::ImageTooBlurry { sharpness } => write!(
                f,
                "image too blurry (sharpness {sharpness:.1}); hold the camera steady and retake"
            ),
            RejectionReason::NoFaceDetected => {
                write!(f, "no face detected; ensure your face is clearly visible")
            }
            RejectionReason::MultipleFacesDetected { count } => write!(
                f,
                "{count} faces detected; ensure only your face is in the image"
            ),
            RejectionReason::EyesNotVisible { eyes_found } => write!(
                f,
                "eyes not clearly visible ({eyes_found} found); remove sunglasses or anything covering your face"
            ),
            RejectionReason::SpoofingDetected { technique } => {
                write!(f, "spoofing detected ({technique})")
            }
            RejectionReason::NoReferenceImage => {
                write!(f, "no enrolled profile image for this student")
            }
            RejectionReason::MatchBelowThreshold { confidence } => {
                write!(f, "face does not match the enrolled profile (confidence {confidence:.1}%)")
            }
        }
    }
}

/// Immutable outcome of one pipeline invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    pub accepted: bool,
    /// Match confidence in [0, 100]; 0 when the pipeline never reached the
    /// matching stage.
    pub confidence_score: f32,
    pub failure_reason: Option<RejectionReason>,
    /// Strategy bound for (or used by) this invocation.
    pub match_strategy_used: MatchStrategy,
    /// All technique signals, in battery order; empty when the frame was
    /// rejected before the battery ran.
    pub spoof_signals: Vec<SpoofSignal>,
}

impl VerificationResult {
    pub fn rejected(reason: RejectionReason, strategy: MatchStrategy) -> Self {
        Self {
            accepted: false,
            confidence_score: 0.0,
            failure_reason: Some(reason),
            match_strategy_used: strategy,
            spoof_signals: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_euclidean_distance_identical() {
        let a = Embedding { values: vec![0.5, 0.5, 0.5], model_version: None };
        assert!(a.euclidean_distance(&a).abs() < 1e-6);
    }

    #[test]
    fn test_euclidean_distance_known() {
        let a = Embedding { values: vec![0.0, 0.0], model_version: None };
        let b = Embedding { values: vec![3.0, 4.0], model_version: None };
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_face_contains_eye() {
        let face = FaceRegion { x: 10, y: 10, width: 100, height: 100, score: 1.0 };
        let inside = EyeRegion { x: 20, y: 30, width: 20, height: 20 };
        let straddling = EyeRegion { x: 100, y: 30, width: 20, height: 20 };
        assert!(face.contains(&inside));
        assert!(!face.contains(&straddling));
    }

    #[test]
    fn test_technique_order_is_stable() {
        let names: Vec<&str> = SpoofTechnique::ALL.iter().map(|t| t.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "face-sharpness",
                "moire-interference",
                "color-gamut",
                "screen-border",
                "lighting-uniformity",
                "compression-grid",
            ]
        );
    }

    #[test]
    fn test_result_serializes_camel_case() {
        let r = VerificationResult::rejected(
            RejectionReason::NoReferenceImage,
            MatchStrategy::Embedding,
        );
        let json = serde_json::to_string(&r).unwrap();
        assert!(json.contains("\"confidenceScore\""));
        assert!(json.contains("\"matchStrategyUsed\":\"embedding\""));
        assert!(json.contains("\"NoReferenceImage\""));
    }
}
