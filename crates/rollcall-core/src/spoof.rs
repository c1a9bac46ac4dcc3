//! Anti-spoofing battery: six independent heuristics over one frame.
//!
//! Each technique is a pure function `(frame, face) -> SpoofSignal`. The
//! battery always evaluates all six in a fixed order — signals are logged
//! even for accepted frames — and the aggregate verdict fails closed on the
//! first failing technique in that order, so diagnostics are reproducible.

use crate::config::SpoofConfig;
use crate::quality::{self, ImageBuffer};
use crate::types::{FaceRegion, SpoofSignal, SpoofTechnique};
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;

/// JPEG block size; the compression-grid check samples the spectrum at
/// multiples of this pitch.
const BLOCK_SIZE: usize = 8;

/// Run the full battery in fixed order.
pub fn run_battery(frame: &ImageBuffer, face: &FaceRegion, cfg: &SpoofConfig) -> Vec<SpoofSignal> {
    vec![
        check_face_sharpness(frame, face, cfg),
        check_moire(frame, cfg),
        check_color_gamut(frame, cfg),
        check_screen_border(frame, face, cfg),
        check_lighting_uniformity(frame, cfg),
        check_compression_grid(frame, cfg),
    ]
}

/// First failing technique in battery order, if any.
pub fn first_failure(signals: &[SpoofSignal]) -> Option<SpoofTechnique> {
    signals.iter().find(|s| !s.passed).map(|s| s.technique)
}

/// Technique 1: sharpness re-check on the face crop.
///
/// A re-photographed print loses texture to double compression; the crop is
/// held to its own floor, independent of the full-frame quality gate.
fn check_face_sharpness(frame: &ImageBuffer, face: &FaceRegion, cfg: &SpoofConfig) -> SpoofSignal {
    let crop = frame.crop_gray(face.x, face.y, face.width, face.height);
    let metric = quality::laplacian_variance(&crop, face.width, face.height);
    let passed = metric >= cfg.face_sharpness_floor;
    SpoofSignal {
        technique: SpoofTechnique::FaceSharpness,
        metric,
        passed,
        reason: if passed {
            format!("face crop sharpness {metric:.1}")
        } else {
            format!(
                "face crop too soft ({metric:.1} < {:.1})",
                cfg.face_sharpness_floor
            )
        },
    }
}

/// Technique 2: moiré / high-frequency interference.
///
/// Photographing an emissive display aliases its pixel grid into strong
/// high-frequency content. Variance of an 8-neighbour high-pass response
/// (saturated to the 8-bit range) above the ceiling fails the frame.
fn check_moire(frame: &ImageBuffer, cfg: &SpoofConfig) -> SpoofSignal {
    let w = frame.width as usize;
    let h = frame.height as usize;
    let gray = &frame.gray;

    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    let mut count = 0usize;

    if w >= 3 && h >= 3 {
        for y in 1..h - 1 {
            for x in 1..w - 1 {
                let c = gray[y * w + x] as f64;
                let neighbours = gray[(y - 1) * w + x - 1] as f64
                    + gray[(y - 1) * w + x] as f64
                    + gray[(y - 1) * w + x + 1] as f64
                    + gray[y * w + x - 1] as f64
                    + gray[y * w + x + 1] as f64
                    + gray[(y + 1) * w + x - 1] as f64
                    + gray[(y + 1) * w + x] as f64
                    + gray[(y + 1) * w + x + 1] as f64;

                let response = (8.0 * c - neighbours).clamp(0.0, 255.0);
                sum += response;
                sum_sq += response * response;
                count += 1;
            }
        }
    }

    let metric = if count > 0 {
        let mean = sum / count as f64;
        sum_sq / count as f64 - mean * mean
    } else {
        0.0
    };

    let passed = metric <= cfg.highfreq_variance_ceiling;
    SpoofSignal {
        technique: SpoofTechnique::MoireInterference,
        metric,
        passed,
        reason: if passed {
            format!("high-frequency variance {metric:.1}")
        } else {
            format!(
                "screen interference pattern ({metric:.1} > {:.1})",
                cfg.highfreq_variance_ceiling
            )
        },
    }
}

/// Technique 3: colour-gamut distribution.
///
/// Natural skin and lighting spread mass over many hue bins; an emissive
/// display concentrates it. Counts the bins exceeding `hue_peak_factor` times
/// the mean bin height and fails when fewer than `min_hue_peaks` exist.
fn check_color_gamut(frame: &ImageBuffer, cfg: &SpoofConfig) -> SpoofSignal {
    let mut bins = [0u32; 180];
    for px in frame.rgb.chunks_exact(3) {
        bins[hue_bin(px[0], px[1], px[2])] += 1;
    }

    let mean = bins.iter().map(|&b| b as f64).sum::<f64>() / bins.len() as f64;
    let peaks = bins
        .iter()
        .filter(|&&b| b as f64 > mean * cfg.hue_peak_factor)
        .count();

    let passed = peaks >= cfg.min_hue_peaks;
    SpoofSignal {
        technique: SpoofTechnique::ColorGamut,
        metric: peaks as f64,
        passed,
        reason: if passed {
            format!("{peaks} hue peaks")
        } else {
            format!(
                "narrow colour gamut ({peaks} peaks < {})",
                cfg.min_hue_peaks
            )
        },
    }
}

/// OpenCV-convention hue bin in [0, 180).
fn hue_bin(r: u8, g: u8, b: u8) -> usize {
    let (r, g, b) = (r as f64, g as f64, b as f64);
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;
    if delta == 0.0 {
        return 0;
    }

    let degrees = if max == r {
        60.0 * (g - b) / delta
    } else if max == g {
        120.0 + 60.0 * (b - r) / delta
    } else {
        240.0 + 60.0 * (r - g) / delta
    };
    let degrees = if degrees < 0.0 { degrees + 360.0 } else { degrees };
    ((degrees / 2.0) as usize).min(179)
}

/// Technique 4: rectangular screen-border detection.
///
/// Device bezels photograph as long straight edges. Builds a gradient edge
/// map, collects rows/columns that are mostly edge pixels, and fails when two
/// horizontal and two vertical lines enclose a rectangle covering at least
/// `border_area_fraction` of the frame that is not simply the face region.
fn check_screen_border(frame: &ImageBuffer, face: &FaceRegion, cfg: &SpoofConfig) -> SpoofSignal {
    let w = frame.width as usize;
    let h = frame.height as usize;
    let gray = &frame.gray;

    let mut row_counts = vec![0usize; h];
    let mut col_counts = vec![0usize; w];

    if w >= 3 && h >= 3 {
        for y in 1..h - 1 {
            for x in 1..w - 1 {
                let gx = -(gray[(y - 1) * w + x - 1] as i32)
                    + gray[(y - 1) * w + x + 1] as i32
                    - 2 * gray[y * w + x - 1] as i32
                    + 2 * gray[y * w + x + 1] as i32
                    - gray[(y + 1) * w + x - 1] as i32
                    + gray[(y + 1) * w + x + 1] as i32;
                let gy = -(gray[(y - 1) * w + x - 1] as i32)
                    - 2 * gray[(y - 1) * w + x] as i32
                    - gray[(y - 1) * w + x + 1] as i32
                    + gray[(y + 1) * w + x - 1] as i32
                    + 2 * gray[(y + 1) * w + x] as i32
                    + gray[(y + 1) * w + x + 1] as i32;

                if (gx.abs() + gy.abs()) as f64 >= cfg.edge_magnitude_floor {
                    row_counts[y] += 1;
                    col_counts[x] += 1;
                }
            }
        }
    }

    let h_lines = collect_lines(&row_counts, (cfg.edge_line_fraction * w as f64) as usize);
    let v_lines = collect_lines(&col_counts, (cfg.edge_line_fraction * h as f64) as usize);

    let frame_area = (w * h) as f64;
    let mut best_fraction = 0.0f64;

    for (i, &top) in h_lines.iter().enumerate() {
        for &bottom in h_lines.iter().skip(i + 1) {
            for (k, &left) in v_lines.iter().enumerate() {
                for &right in v_lines.iter().skip(k + 1) {
                    let fraction = ((bottom - top) * (right - left)) as f64 / frame_area;
                    if fraction < cfg.border_area_fraction {
                        continue;
                    }
                    if rect_within_face(left, top, right, bottom, face) {
                        continue;
                    }
                    if fraction > best_fraction {
                        best_fraction = fraction;
                    }
                }
            }
        }
    }

    let passed = best_fraction == 0.0;
    SpoofSignal {
        technique: SpoofTechnique::ScreenBorder,
        metric: best_fraction,
        passed,
        reason: if passed {
            "no rectangular border".to_string()
        } else {
            format!(
                "rectangular border covering {:.0}% of frame",
                best_fraction * 100.0
            )
        },
    }
}

/// Collapse consecutive qualifying rows/columns into single line positions.
/// Capped to bound the pair search.
fn collect_lines(counts: &[usize], min_count: usize) -> Vec<usize> {
    const MAX_LINES: usize = 16;

    let mut lines = Vec::new();
    let mut run_start: Option<usize> = None;
    for (i, &count) in counts.iter().enumerate() {
        let qualifies = min_count > 0 && count >= min_count;
        match (qualifies, run_start) {
            (true, None) => run_start = Some(i),
            (false, Some(start)) => {
                lines.push((start + i - 1) / 2);
                run_start = None;
            }
            _ => {}
        }
    }
    if let Some(start) = run_start {
        lines.push((start + counts.len() - 1) / 2);
    }
    lines.truncate(MAX_LINES);
    lines
}

/// Whether a candidate rectangle sits inside the (slightly expanded) face
/// region — the face outline itself is not a bezel.
fn rect_within_face(left: usize, top: usize, right: usize, bottom: usize, face: &FaceRegion) -> bool {
    let margin_x = face.width / 10;
    let margin_y = face.height / 10;
    let fx0 = face.x.saturating_sub(margin_x) as usize;
    let fy0 = face.y.saturating_sub(margin_y) as usize;
    let fx1 = (face.x + face.width + margin_x) as usize;
    let fy1 = (face.y + face.height + margin_y) as usize;
    left >= fx0 && top >= fy0 && right <= fx1 && bottom <= fy1
}

/// Technique 5: lighting uniformity.
///
/// Screen emission lights the frame flatly; natural scenes carry shadow
/// structure. Brightness standard deviation below the floor fails.
fn check_lighting_uniformity(frame: &ImageBuffer, cfg: &SpoofConfig) -> SpoofSignal {
    let n = frame.gray.len() as f64;
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    for &p in &frame.gray {
        sum += p as f64;
        sum_sq += (p as f64) * (p as f64);
    }
    let mean = sum / n;
    let metric = (sum_sq / n - mean * mean).max(0.0).sqrt();

    let passed = metric >= cfg.brightness_std_floor;
    SpoofSignal {
        technique: SpoofTechnique::LightingUniformity,
        metric,
        passed,
        reason: if passed {
            format!("brightness spread {metric:.1}")
        } else {
            format!(
                "unnaturally uniform lighting ({metric:.1} < {:.1})",
                cfg.brightness_std_floor
            )
        },
    }
}

/// Technique 6: compression block-grid detection.
///
/// Re-encoded digital photos carry energy at the 8-pixel JPEG block pitch.
/// Takes the 2-D spectrum of the grayscale frame, centres it, and sums
/// magnitude at 8-aligned grid points (the DC bin excluded — it would swamp
/// the ratio on block-aligned frame sizes); a ratio to total magnitude above
/// the ceiling fails.
fn check_compression_grid(frame: &ImageBuffer, cfg: &SpoofConfig) -> SpoofSignal {
    let w = frame.width as usize;
    let h = frame.height as usize;

    let mut data: Vec<Complex<f64>> = frame
        .gray
        .iter()
        .map(|&p| Complex::new(p as f64, 0.0))
        .collect();

    let mut planner = FftPlanner::new();
    planner.plan_fft_forward(w).process(&mut data);

    // Transpose, then run the column transforms as contiguous rows.
    let mut transposed = vec![Complex::new(0.0, 0.0); w * h];
    for y in 0..h {
        for x in 0..w {
            transposed[x * h + y] = data[y * w + x];
        }
    }
    planner.plan_fft_forward(h).process(&mut transposed);

    let total: f64 = transposed.iter().map(|c| c.norm()).sum();

    let mut block = 0.0f64;
    for sy in (0..h).step_by(BLOCK_SIZE) {
        for sx in (0..w).step_by(BLOCK_SIZE) {
            // Map centred-spectrum coordinates back to raw spectrum indices.
            let fy = (sy + h / 2) % h;
            let fx = (sx + w / 2) % w;
            if fx == 0 && fy == 0 {
                continue; // DC
            }
            block += transposed[fx * h + fy].norm();
        }
    }

    let metric = if total > 0.0 { block / total } else { 0.0 };
    let passed = metric <= cfg.block_energy_ceiling;
    SpoofSignal {
        technique: SpoofTechnique::CompressionGrid,
        metric,
        passed,
        reason: if passed {
            format!("block-grid energy ratio {metric:.3}")
        } else {
            format!(
                "compression block pattern (ratio {metric:.3} > {:.3})",
                cfg.block_energy_ceiling
            )
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_from_gray(width: u32, height: u32, gray: Vec<u8>) -> ImageBuffer {
        let rgb = gray.iter().flat_map(|&p| [p, p, p]).collect();
        ImageBuffer { width, height, rgb, gray }
    }

    fn centre_face(width: u32, height: u32) -> FaceRegion {
        FaceRegion {
            x: width / 4,
            y: height / 4,
            width: width / 2,
            height: height / 2,
            score: 3.0,
        }
    }

    /// Deterministic pseudo-noise.
    fn xorshift(state: &mut u32) -> u32 {
        let mut x = *state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        *state = x;
        x
    }

    fn noisy_gray(width: u32, height: u32, base: u8, amplitude: i32, seed: u32) -> Vec<u8> {
        let mut state = seed.max(1);
        (0..width * height)
            .map(|_| {
                let n = (xorshift(&mut state) % (2 * amplitude as u32 + 1)) as i32 - amplitude;
                (base as i32 + n).clamp(0, 255) as u8
            })
            .collect()
    }

    #[test]
    fn test_battery_order_matches_technique_list() {
        let frame = frame_from_gray(64, 64, vec![128; 64 * 64]);
        let face = centre_face(64, 64);
        let signals = run_battery(&frame, &face, &SpoofConfig::default());
        let order: Vec<_> = signals.iter().map(|s| s.technique).collect();
        assert_eq!(order, SpoofTechnique::ALL.to_vec());
    }

    #[test]
    fn test_face_sharpness_uniform_fails_noisy_passes() {
        let cfg = SpoofConfig::default();
        let face = centre_face(100, 100);

        let flat = frame_from_gray(100, 100, vec![128; 100 * 100]);
        assert!(!check_face_sharpness(&flat, &face, &cfg).passed);

        let noisy = frame_from_gray(100, 100, noisy_gray(100, 100, 128, 30, 7));
        assert!(check_face_sharpness(&noisy, &face, &cfg).passed);
    }

    #[test]
    fn test_moire_flat_passes_heavy_noise_fails() {
        let cfg = SpoofConfig::default();

        let flat = frame_from_gray(100, 100, vec![128; 100 * 100]);
        assert!(check_moire(&flat, &cfg).passed);

        // Hard per-pixel noise drives the high-pass response across the full
        // 8-bit range, like an aliased pixel grid.
        let harsh = frame_from_gray(100, 100, noisy_gray(100, 100, 128, 90, 11));
        let signal = check_moire(&harsh, &cfg);
        assert!(!signal.passed, "metric was {}", signal.metric);
    }

    #[test]
    fn test_color_gamut_single_hue_fails() {
        let gray = vec![0u8; 80 * 80];
        let rgb: Vec<u8> = (0..80 * 80).flat_map(|_| [200u8, 90, 40]).collect();
        let frame = ImageBuffer { width: 80, height: 80, rgb, gray };
        let signal = check_color_gamut(&frame, &SpoofConfig::default());
        assert!(!signal.passed);
        assert!(signal.metric < 5.0);
    }

    #[test]
    fn test_color_gamut_diverse_palette_passes() {
        // Eight equal vertical bands of distinct hues.
        let palette: [[u8; 3]; 8] = [
            [200, 60, 60],
            [200, 140, 60],
            [190, 190, 60],
            [60, 190, 60],
            [60, 190, 190],
            [60, 60, 200],
            [150, 60, 190],
            [190, 60, 150],
        ];
        let w = 80u32;
        let h = 80u32;
        let mut rgb = Vec::with_capacity((w * h * 3) as usize);
        for _y in 0..h {
            for x in 0..w {
                let band = (x * 8 / w) as usize;
                rgb.extend_from_slice(&palette[band]);
            }
        }
        let frame = ImageBuffer { width: w, height: h, rgb, gray: vec![0; (w * h) as usize] };
        let signal = check_color_gamut(&frame, &SpoofConfig::default());
        assert!(signal.passed, "peaks: {}", signal.metric);
    }

    #[test]
    fn test_lighting_uniform_fails_gradient_passes() {
        let cfg = SpoofConfig::default();

        let flat = frame_from_gray(60, 60, vec![200; 60 * 60]);
        assert!(!check_lighting_uniformity(&flat, &cfg).passed);

        let gradient: Vec<u8> = (0..60u32)
            .flat_map(|_| (0..60u32).map(|x| (x * 4) as u8))
            .collect();
        let frame = frame_from_gray(60, 60, gradient);
        assert!(check_lighting_uniformity(&frame, &cfg).passed);
    }

    #[test]
    fn test_screen_border_rectangle_fails() {
        // 200x200 frame with a full device-bezel rectangle drawn 10 px in.
        let w = 200usize;
        let mut gray = vec![160u8; w * w];
        for t in 0..3usize {
            for x in 10..190 {
                gray[(10 + t) * w + x] = 10; // top
                gray[(187 + t) * w + x] = 10; // bottom
            }
            for y in 10..190 {
                gray[y * w + 10 + t] = 10; // left
                gray[y * w + 187 + t] = 10; // right
            }
        }
        let frame = frame_from_gray(200, 200, gray);
        let face = FaceRegion { x: 80, y: 80, width: 40, height: 40, score: 3.0 };
        let signal = check_screen_border(&frame, &face, &SpoofConfig::default());
        assert!(!signal.passed);
        assert!(signal.metric >= 0.3);
    }

    #[test]
    fn test_screen_border_clean_frame_passes() {
        let frame = frame_from_gray(200, 200, noisy_gray(200, 200, 140, 12, 3));
        let face = centre_face(200, 200);
        assert!(check_screen_border(&frame, &face, &SpoofConfig::default()).passed);
    }

    #[test]
    fn test_compression_grid_block_pitch_fails() {
        // Bright seams every 8 pixels in both axes — the block-boundary comb
        // puts its energy exactly at the sampled harmonics.
        let w = 64usize;
        let gray: Vec<u8> = (0..w * w)
            .map(|i| {
                let (x, y) = (i % w, i / w);
                if x % 8 == 0 || y % 8 == 0 { 190 } else { 128 }
            })
            .collect();
        let frame = frame_from_gray(64, 64, gray);
        let signal = check_compression_grid(&frame, &SpoofConfig::default());
        assert!(!signal.passed, "ratio was {}", signal.metric);
    }

    #[test]
    fn test_compression_grid_smooth_passes() {
        let gray: Vec<u8> = (0..100u32 * 100)
            .map(|i| ((i % 100) + (i / 100) / 2) as u8)
            .collect();
        let frame = frame_from_gray(100, 100, gray);
        let signal = check_compression_grid(&frame, &SpoofConfig::default());
        assert!(signal.passed, "ratio was {}", signal.metric);
    }

    #[test]
    fn test_first_failure_is_earliest_in_order() {
        let mk = |technique, passed| SpoofSignal {
            technique,
            metric: 0.0,
            passed,
            reason: String::new(),
        };
        let signals = vec![
            mk(SpoofTechnique::FaceSharpness, true),
            mk(SpoofTechnique::MoireInterference, false),
            mk(SpoofTechnique::ColorGamut, true),
            mk(SpoofTechnique::ScreenBorder, false),
            mk(SpoofTechnique::LightingUniformity, true),
            mk(SpoofTechnique::CompressionGrid, true),
        ];
        assert_eq!(
            first_failure(&signals),
            Some(SpoofTechnique::MoireInterference)
        );
        assert_eq!(first_failure(&signals[..1]), None);
    }
}
