use rollcall_core::config::{MatchPolicy, PipelineConfig};
use std::path::PathBuf;

/// Daemon configuration, loaded from `ROLLCALL_*` environment variables.
pub struct Config {
    /// Directory containing the cascade and embedding model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite profile database.
    pub db_path: PathBuf,
    /// Verification worker threads (each owns its own model sessions).
    pub workers: usize,
    /// Timeout in seconds for one verification request.
    pub verify_timeout_secs: u64,
    /// Match policy applied when the caller does not specify one.
    pub default_policy: MatchPolicy,
    /// Serve on the session bus instead of the system bus (development).
    pub session_bus: bool,
    /// Failed attempts within the window before lockout.
    pub max_failed_attempts: u32,
    /// Sliding window over which failures are counted, in seconds.
    pub failure_window_secs: u64,
    /// Lockout duration after exceeding the failure budget, in seconds.
    pub lockout_secs: u64,
}

impl Config {
    /// Load configuration with documented defaults.
    pub fn from_env() -> Self {
        let model_dir = std::env::var("ROLLCALL_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| rollcall_models::default_model_dir());

        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let db_path = std::env::var("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("profiles.db"));

        let default_workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2)
            .min(4);

        let default_policy = std::env::var("ROLLCALL_MATCH_POLICY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(MatchPolicy::Default);

        Self {
            model_dir,
            db_path,
            workers: env_usize("ROLLCALL_WORKERS", default_workers),
            verify_timeout_secs: env_u64("ROLLCALL_VERIFY_TIMEOUT_SECS", 10),
            default_policy,
            session_bus: std::env::var("ROLLCALL_SESSION_BUS")
                .map(|v| v != "0")
                .unwrap_or(false),
            max_failed_attempts: env_u64("ROLLCALL_MAX_FAILED_ATTEMPTS", 5) as u32,
            failure_window_secs: env_u64("ROLLCALL_FAILURE_WINDOW_SECS", 60),
            lockout_secs: env_u64("ROLLCALL_LOCKOUT_SECS", 300),
        }
    }
}

/// Pipeline thresholds with environment overrides, so operators can retune
/// sensitivity per deployment without a rebuild.
pub fn pipeline_from_env() -> PipelineConfig {
    let mut cfg = PipelineConfig::default();

    cfg.quality.min_sharpness = env_f64("ROLLCALL_MIN_SHARPNESS", cfg.quality.min_sharpness);
    cfg.quality.max_dimension = env_usize("ROLLCALL_MAX_DIMENSION", cfg.quality.max_dimension as usize) as u32;

    cfg.locator.min_face_size =
        env_usize("ROLLCALL_MIN_FACE_SIZE", cfg.locator.min_face_size as usize) as u32;

    cfg.spoof.face_sharpness_floor =
        env_f64("ROLLCALL_FACE_SHARPNESS_FLOOR", cfg.spoof.face_sharpness_floor);
    cfg.spoof.highfreq_variance_ceiling =
        env_f64("ROLLCALL_HIGHFREQ_CEILING", cfg.spoof.highfreq_variance_ceiling);
    cfg.spoof.min_hue_peaks = env_usize("ROLLCALL_MIN_HUE_PEAKS", cfg.spoof.min_hue_peaks);
    cfg.spoof.border_area_fraction =
        env_f64("ROLLCALL_BORDER_AREA_FRACTION", cfg.spoof.border_area_fraction);
    cfg.spoof.brightness_std_floor =
        env_f64("ROLLCALL_BRIGHTNESS_STD_FLOOR", cfg.spoof.brightness_std_floor);
    cfg.spoof.block_energy_ceiling =
        env_f64("ROLLCALL_BLOCK_ENERGY_CEILING", cfg.spoof.block_energy_ceiling);

    cfg.matching.strict_distance = env_f32("ROLLCALL_STRICT_DISTANCE", cfg.matching.strict_distance);
    cfg.matching.default_distance =
        env_f32("ROLLCALL_DEFAULT_DISTANCE", cfg.matching.default_distance);
    cfg.matching.relaxed_distance =
        env_f32("ROLLCALL_RELAXED_DISTANCE", cfg.matching.relaxed_distance);
    cfg.matching.histogram_correlation_floor = env_f64(
        "ROLLCALL_HISTOGRAM_CORRELATION_FLOOR",
        cfg.matching.histogram_correlation_floor,
    );

    cfg
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
