//! Face and eye location.
//!
//! Face detection runs a funnel-structured cascade classifier (SeetaFace via
//! the `rustface` crate) over a multi-scale image pyramid. The detection
//! backend is a trait so the daemon can plug in the real cascade while tests
//! instrument the call with stubs.
//!
//! Eye location repeats the sliding-window idea restricted to the upper band
//! of the face crop: a window is a positive when it sits darker than its
//! horizontal flanks by a contrast margin (pupil/iris against skin), and a
//! cluster of overlapping positives counts as one eye only when enough
//! windows concur. Sunglasses and masks produce a uniformly dark band with no
//! flank contrast, so no cluster forms.

use crate::config::LocatorConfig;
use crate::quality::ImageBuffer;
use crate::types::{EyeRegion, FaceRegion, RejectionReason};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LocatorError {
    #[error("cascade model not found: {0} — run `rollcall setup` to download models")]
    ModelNotFound(String),
    #[error("failed to read cascade model {path}: {source}")]
    ModelRead {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// One raw cascade detection, before bounds clamping and size filtering.
#[derive(Debug, Clone)]
pub struct RawDetection {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub score: f64,
}

/// Pluggable face detection backend over a grayscale plane.
pub trait DetectorBackend: Send {
    fn detect(&self, gray: &[u8], width: u32, height: u32) -> Vec<RawDetection>;
}

/// Cascade detector backed by the `rustface` crate (SeetaFace engine).
///
/// Holds only the model weights; a detector instance is built per call from a
/// clone of the model, which keeps the shared state read-only and the backend
/// safe for concurrent use from multiple workers.
pub struct SeetaBackend {
    model: rustface::Model,
    min_face_size: u32,
    score_threshold: f64,
    pyramid_scale_factor: f32,
    slide_window_step: u32,
}

impl SeetaBackend {
    /// Load the SeetaFace cascade model from the given path.
    pub fn load(model_path: &Path, cfg: &LocatorConfig) -> Result<Self, LocatorError> {
        if !model_path.exists() {
            return Err(LocatorError::ModelNotFound(
                model_path.display().to_string(),
            ));
        }

        let file = std::fs::File::open(model_path).map_err(|source| LocatorError::ModelRead {
            path: model_path.display().to_string(),
            source,
        })?;
        let model = rustface::read_model(std::io::BufReader::new(file)).map_err(|source| {
            LocatorError::ModelRead {
                path: model_path.display().to_string(),
                source,
            }
        })?;

        tracing::info!(path = %model_path.display(), "loaded SeetaFace cascade model");

        Ok(Self {
            model,
            // The cascade window cannot go below 20 px; the configured floor
            // is enforced exactly by the post-filter in locate_face.
            min_face_size: cfg.min_face_size.max(20),
            score_threshold: cfg.score_threshold,
            pyramid_scale_factor: cfg.pyramid_scale_factor,
            slide_window_step: cfg.slide_window_step.max(1),
        })
    }
}

impl DetectorBackend for SeetaBackend {
    fn detect(&self, gray: &[u8], width: u32, height: u32) -> Vec<RawDetection> {
        let mut detector = rustface::create_detector_with_model(self.model.clone());
        detector.set_min_face_size(self.min_face_size);
        detector.set_score_thresh(self.score_threshold);
        detector.set_pyramid_scale_factor(self.pyramid_scale_factor);
        detector.set_slide_window_step(self.slide_window_step, self.slide_window_step);

        let image = rustface::ImageData::new(gray, width, height);
        detector
            .detect(&image)
            .iter()
            .map(|face| {
                let bbox = face.bbox();
                RawDetection {
                    x: bbox.x(),
                    y: bbox.y(),
                    width: bbox.width(),
                    height: bbox.height(),
                    score: face.score(),
                }
            })
            .collect()
    }
}

/// Face and eye locator enforcing the exactly-one-face policy.
pub struct FaceLocator {
    backend: Box<dyn DetectorBackend>,
    cfg: LocatorConfig,
}

impl FaceLocator {
    pub fn new(backend: Box<dyn DetectorBackend>, cfg: LocatorConfig) -> Self {
        Self { backend, cfg }
    }

    /// Locate exactly one face. Zero surviving candidates is
    /// [`RejectionReason::NoFaceDetected`]; two or more is
    /// [`RejectionReason::MultipleFacesDetected`] — the locator never picks
    /// "the largest face" on an ambiguous frame.
    pub fn locate_face(&self, frame: &ImageBuffer) -> Result<FaceRegion, RejectionReason> {
        let regions = self.candidate_regions(frame);
        match regions.len() {
            0 => Err(RejectionReason::NoFaceDetected),
            1 => Ok(regions[0]),
            count => Err(RejectionReason::MultipleFacesDetected { count }),
        }
    }

    /// Locate the best-scoring face, for reference images that were validated
    /// single-face at enrollment time.
    pub fn locate_best_face(&self, frame: &ImageBuffer) -> Option<FaceRegion> {
        self.candidate_regions(frame)
            .into_iter()
            .max_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal))
    }

    /// Run the backend, clamp detections into frame bounds, and discard
    /// candidates below the minimum face size.
    fn candidate_regions(&self, frame: &ImageBuffer) -> Vec<FaceRegion> {
        self.backend
            .detect(&frame.gray, frame.width, frame.height)
            .into_iter()
            .filter_map(|det| clamp_detection(&det, frame.width, frame.height))
            .filter(|region| {
                region.width >= self.cfg.min_face_size && region.height >= self.cfg.min_face_size
            })
            .collect()
    }

    /// Locate eyes inside a face region. Returns zero, one, or two regions in
    /// left-to-right order, each contained in (and smaller than) the face.
    pub fn locate_eyes(&self, frame: &ImageBuffer, face: &FaceRegion) -> Vec<EyeRegion> {
        let crop = frame.crop_gray(face.x, face.y, face.width, face.height);
        let w = face.width as usize;
        let h = face.height as usize;
        if crop.len() < w * h || w == 0 || h == 0 {
            return Vec::new();
        }

        // Eye band: upper portion of the face, between forehead and nose.
        let band_y0 = h / 5;
        let band_y1 = h / 2;
        let win = ((h / 6).max(self.cfg.min_eye_size as usize)).min(band_y1.saturating_sub(band_y0));
        if win < self.cfg.min_eye_size as usize || w < 2 * win {
            return Vec::new();
        }

        let integral = IntegralImage::new(&crop, w, h);
        let step = (win / 4).max(1);
        let flank = (win / 2).max(1);

        // Classify windows: positive when darker than horizontal flanks.
        let mut positives: Vec<(f64, f64, f64)> = Vec::new(); // (cx, cy, contrast)
        let mut y = band_y0;
        while y + win <= band_y1 {
            let mut x = 0usize;
            while x + win <= w {
                let window_mean = integral.mean(x, y, win, win);

                let lx0 = x.saturating_sub(flank);
                let left_area = (x - lx0) * win;
                let left_sum = integral.sum(lx0, y, x - lx0, win);

                let rx1 = (x + win + flank).min(w);
                let right_area = (rx1 - (x + win)) * win;
                let right_sum = integral.sum(x + win, y, rx1 - (x + win), win);

                let flank_area = left_area + right_area;
                if flank_area > 0 {
                    let flank_mean = (left_sum + right_sum) as f64 / flank_area as f64;
                    let contrast = flank_mean - window_mean;
                    if contrast >= self.cfg.eye_contrast_margin {
                        positives.push((
                            x as f64 + win as f64 / 2.0,
                            y as f64 + win as f64 / 2.0,
                            contrast,
                        ));
                    }
                }
                x += step;
            }
            y += step;
        }

        // Cluster overlapping positives; a cluster is an eye only when at
        // least min_eye_neighbors windows concur.
        let clusters = cluster_positives(&positives, win as f64, self.cfg.min_eye_neighbors);

        // Best cluster per half of the face.
        let mid = w as f64 / 2.0;
        let best_left = clusters
            .iter()
            .filter(|c| c.cx < mid)
            .max_by(|a, b| a.weight.partial_cmp(&b.weight).unwrap_or(std::cmp::Ordering::Equal));
        let best_right = clusters
            .iter()
            .filter(|c| c.cx >= mid)
            .max_by(|a, b| a.weight.partial_cmp(&b.weight).unwrap_or(std::cmp::Ordering::Equal));

        let mut eyes = Vec::new();
        for cluster in [best_left, best_right].into_iter().flatten() {
            eyes.push(eye_region_at(cluster, win, face));
        }
        eyes
    }
}

/// Clamp a raw detection into frame bounds. Returns `None` when nothing of
/// the detection lies inside the frame.
fn clamp_detection(det: &RawDetection, frame_w: u32, frame_h: u32) -> Option<FaceRegion> {
    let x0 = det.x.max(0) as u32;
    let y0 = det.y.max(0) as u32;
    let x1 = (det.x.saturating_add(det.width as i32)).clamp(0, frame_w as i32) as u32;
    let y1 = (det.y.saturating_add(det.height as i32)).clamp(0, frame_h as i32) as u32;
    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    Some(FaceRegion {
        x: x0,
        y: y0,
        width: x1 - x0,
        height: y1 - y0,
        score: det.score as f32,
    })
}

struct EyeCluster {
    cx: f64,
    cy: f64,
    weight: f64,
}

/// Greedy clustering of positive windows: the strongest unclaimed positive
/// seeds a cluster that absorbs every positive within one window size of it.
fn cluster_positives(positives: &[(f64, f64, f64)], radius: f64, min_members: usize) -> Vec<EyeCluster> {
    let mut order: Vec<usize> = (0..positives.len()).collect();
    order.sort_by(|&a, &b| {
        positives[b].2.partial_cmp(&positives[a].2).unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut claimed = vec![false; positives.len()];
    let mut clusters = Vec::new();

    for &seed in &order {
        if claimed[seed] {
            continue;
        }
        let (sx, sy, _) = positives[seed];
        let members: Vec<usize> = (0..positives.len())
            .filter(|&i| {
                !claimed[i]
                    && (positives[i].0 - sx).abs() <= radius
                    && (positives[i].1 - sy).abs() <= radius
            })
            .collect();

        for &i in &members {
            claimed[i] = true;
        }

        if members.len() >= min_members {
            let n = members.len() as f64;
            clusters.push(EyeCluster {
                cx: members.iter().map(|&i| positives[i].0).sum::<f64>() / n,
                cy: members.iter().map(|&i| positives[i].1).sum::<f64>() / n,
                weight: members.iter().map(|&i| positives[i].2).sum::<f64>(),
            });
        }
    }

    clusters
}

/// Build a frame-space eye region of `win` pixels centred on a cluster,
/// clamped to stay inside the face.
fn eye_region_at(cluster: &EyeCluster, win: usize, face: &FaceRegion) -> EyeRegion {
    let half = win as f64 / 2.0;
    let max_x = face.width.saturating_sub(win as u32);
    let max_y = face.height.saturating_sub(win as u32);
    let local_x = ((cluster.cx - half).round().max(0.0) as u32).min(max_x);
    let local_y = ((cluster.cy - half).round().max(0.0) as u32).min(max_y);
    EyeRegion {
        x: face.x + local_x,
        y: face.y + local_y,
        width: win as u32,
        height: win as u32,
    }
}

/// Summed-area table for O(1) rectangle sums over a grayscale plane.
struct IntegralImage {
    width: usize,
    table: Vec<u64>, // (w+1) x (h+1)
}

impl IntegralImage {
    fn new(gray: &[u8], width: usize, height: usize) -> Self {
        let mut table = vec![0u64; (width + 1) * (height + 1)];
        for y in 0..height {
            let mut row_sum = 0u64;
            for x in 0..width {
                row_sum += gray[y * width + x] as u64;
                table[(y + 1) * (width + 1) + (x + 1)] = table[y * (width + 1) + (x + 1)] + row_sum;
            }
        }
        Self { width, table }
    }

    fn sum(&self, x: usize, y: usize, w: usize, h: usize) -> u64 {
        let stride = self.width + 1;
        let a = self.table[y * stride + x];
        let b = self.table[y * stride + (x + w)];
        let c = self.table[(y + h) * stride + x];
        let d = self.table[(y + h) * stride + (x + w)];
        d + a - b - c
    }

    fn mean(&self, x: usize, y: usize, w: usize, h: usize) -> f64 {
        if w == 0 || h == 0 {
            return 0.0;
        }
        self.sum(x, y, w, h) as f64 / (w * h) as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::ImageBuffer;

    struct StubBackend {
        detections: Vec<RawDetection>,
    }

    impl DetectorBackend for StubBackend {
        fn detect(&self, _gray: &[u8], _width: u32, _height: u32) -> Vec<RawDetection> {
            self.detections.clone()
        }
    }

    fn frame_filled(width: u32, height: u32, value: u8) -> ImageBuffer {
        ImageBuffer {
            width,
            height,
            rgb: vec![value; (width * height * 3) as usize],
            gray: vec![value; (width * height) as usize],
        }
    }

    fn locator_with(detections: Vec<RawDetection>) -> FaceLocator {
        FaceLocator::new(Box::new(StubBackend { detections }), LocatorConfig::default())
    }

    fn det(x: i32, y: i32, size: u32) -> RawDetection {
        RawDetection { x, y, width: size, height: size, score: 3.0 }
    }

    #[test]
    fn test_zero_faces_rejected() {
        let locator = locator_with(vec![]);
        let frame = frame_filled(100, 100, 128);
        assert_eq!(
            locator.locate_face(&frame),
            Err(RejectionReason::NoFaceDetected)
        );
    }

    #[test]
    fn test_single_face_accepted() {
        let locator = locator_with(vec![det(10, 10, 50)]);
        let frame = frame_filled(100, 100, 128);
        let face = locator.locate_face(&frame).unwrap();
        assert_eq!((face.x, face.y, face.width, face.height), (10, 10, 50, 50));
    }

    #[test]
    fn test_multiple_faces_rejected() {
        let locator = locator_with(vec![det(5, 5, 40), det(55, 5, 40)]);
        let frame = frame_filled(120, 120, 128);
        assert_eq!(
            locator.locate_face(&frame),
            Err(RejectionReason::MultipleFacesDetected { count: 2 })
        );
    }

    #[test]
    fn test_min_face_size_boundary() {
        let frame = frame_filled(100, 100, 128);

        // Exactly at the 30x30 floor: accepted.
        let at_floor = locator_with(vec![det(10, 10, 30)]);
        assert!(at_floor.locate_face(&frame).is_ok());

        // One pixel below: discarded, leaving zero candidates.
        let below_floor = locator_with(vec![det(10, 10, 29)]);
        assert_eq!(
            below_floor.locate_face(&frame),
            Err(RejectionReason::NoFaceDetected)
        );
    }

    #[test]
    fn test_undersized_candidates_do_not_mask_real_face() {
        // A 29px speck plus one real face: the speck is filtered before the
        // count policy, so the real face is accepted rather than reported as
        // a multi-face frame.
        let locator = locator_with(vec![det(0, 0, 29), det(30, 30, 60)]);
        let frame = frame_filled(120, 120, 128);
        let face = locator.locate_face(&frame).unwrap();
        assert_eq!(face.width, 60);
    }

    #[test]
    fn test_detection_clamped_to_frame() {
        let locator = locator_with(vec![det(-10, -10, 60)]);
        let frame = frame_filled(100, 100, 128);
        let face = locator.locate_face(&frame).unwrap();
        assert_eq!((face.x, face.y), (0, 0));
        assert_eq!((face.width, face.height), (50, 50));
    }

    #[test]
    fn test_best_face_picks_highest_score() {
        let locator = locator_with(vec![
            RawDetection { x: 0, y: 0, width: 40, height: 40, score: 1.0 },
            RawDetection { x: 50, y: 50, width: 40, height: 40, score: 4.0 },
        ]);
        let frame = frame_filled(120, 120, 128);
        let best = locator.locate_best_face(&frame).unwrap();
        assert_eq!(best.x, 50);
    }

    // ── Eye location ─────────────────────────────────────────────────────

    /// A 160x160 frame with a 120x120 "face" at (20, 20): skin value 150,
    /// with optional dark patches painted in face-local coordinates.
    fn face_frame(patches: &[(u32, u32, u32, u32)]) -> (ImageBuffer, FaceRegion) {
        let mut frame = frame_filled(160, 160, 150);
        for &(px, py, pw, ph) in patches {
            for y in py..py + ph {
                for x in px..px + pw {
                    let fx = 20 + x;
                    let fy = 20 + y;
                    frame.gray[(fy * 160 + fx) as usize] = 60;
                }
            }
        }
        let face = FaceRegion { x: 20, y: 20, width: 120, height: 120, score: 3.0 };
        (frame, face)
    }

    #[test]
    fn test_two_eyes_found() {
        // Dark 16x16 patches centred at (35, 40) and (85, 40), inside the
        // band [24, 60) of a 120px face.
        let (frame, face) = face_frame(&[(27, 32, 16, 16), (77, 32, 16, 16)]);
        let locator = locator_with(vec![]);
        let eyes = locator.locate_eyes(&frame, &face);
        assert_eq!(eyes.len(), 2);

        let (lx, _) = eyes[0].center();
        let (rx, _) = eyes[1].center();
        assert!(lx < rx, "eyes should be reported left to right");
        for eye in &eyes {
            assert!(face.contains(eye));
            assert!(eye.width < face.width && eye.height < face.height);
        }
    }

    #[test]
    fn test_sunglasses_band_yields_no_eyes() {
        // A uniformly dark strip across the whole eye band: no horizontal
        // flank contrast, so no positive windows.
        let (frame, face) = face_frame(&[(0, 30, 120, 20)]);
        let locator = locator_with(vec![]);
        assert!(locator.locate_eyes(&frame, &face).is_empty());
    }

    #[test]
    fn test_single_eye_found() {
        let (frame, face) = face_frame(&[(27, 32, 16, 16)]);
        let locator = locator_with(vec![]);
        let eyes = locator.locate_eyes(&frame, &face);
        assert_eq!(eyes.len(), 1);
    }

    #[test]
    fn test_blank_face_yields_no_eyes() {
        let (frame, face) = face_frame(&[]);
        let locator = locator_with(vec![]);
        assert!(locator.locate_eyes(&frame, &face).is_empty());
    }

    #[test]
    fn test_tiny_face_yields_no_eyes() {
        let frame = frame_filled(60, 60, 150);
        let face = FaceRegion { x: 0, y: 0, width: 30, height: 30, score: 3.0 };
        let locator = locator_with(vec![]);
        // 30px face: the minimum eye window cannot fit the band.
        assert!(locator.locate_eyes(&frame, &face).is_empty());
    }

    #[test]
    fn test_integral_image_sums() {
        let gray: Vec<u8> = (0..16).collect();
        let integral = IntegralImage::new(&gray, 4, 4);
        assert_eq!(integral.sum(0, 0, 4, 4), (0..16u64).sum::<u64>());
        assert_eq!(integral.sum(1, 1, 2, 2), 5 + 6 + 9 + 10);
        assert!((integral.mean(1, 1, 2, 2) - 7.5).abs() < 1e-9);
    }
}
