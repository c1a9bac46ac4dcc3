use std::sync::Arc;
use tokio::sync::Mutex;
use zbus::interface;

use rollcall_core::types::RejectionReason;
use crate::config::Config;
use crate::engine::EngineHandle;
use crate::rate_limiter::RateLimiter;
use crate::store::ProfileStore;

/// Shared state accessible by D-Bus method handlers.
pub struct AppState {
    pub config: Config,
    pub engine: EngineHandle,
    pub store: ProfileStore,
    pub rate_limiter: RateLimiter,
}

/// D-Bus interface for the attendance verification daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
pub struct AttendanceService {
    pub state: Arc<Mutex<AppState>>,
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Verify a submitted face image against a student's enrolled profile.
    ///
    /// `image` is the candidate image: raw bytes Base64-encoded, or a
    /// `data:image/...` URI. `policy` is "strict", "default", "relaxed", or
    /// empty for the configured default. Returns the verification result as
    /// JSON; the attendance workflow decides the business effect.
    async fn submit_verification(
        &self,
        student_id: &str,
        image: &str,
        policy: &str,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(student_id, "verification requested");

        let (engine, store, default_policy, timeout_secs) = {
            let state = self.state.lock().await;
            (
                state.engine.clone(),
                state.store.clone(),
                state.config.default_policy,
                state.config.verify_timeout_secs,
            )
        };

        let policy = if policy.is_empty() {
            default_policy
        } else {
            policy
                .parse()
                .map_err(|e: String| zbus::fdo::Error::InvalidArgs(e))?
        };

        // --- Rate limit check ---
        {
            let mut state = self.state.lock().await;
            state.rate_limiter.check(student_id).map_err(|msg| {
                tracing::warn!(student_id, "verification rate limited");
                zbus::fdo::Error::Failed(msg)
            })?;
        }

        // --- Fetch the stored reference (absent stays None: the pipeline
        // reports NoReferenceImage without touching the image) ---
        let reference = store.get_reference(student_id).await.map_err(|e| {
            tracing::error!(error = %e, "reference fetch failed");
            zbus::fdo::Error::Failed(e.to_string())
        })?;

        // --- Run the pipeline with a timeout (no lock held) ---
        let timeout = std::time::Duration::from_secs(timeout_secs);
        let result = tokio::time::timeout(
            timeout,
            engine.verify(image.as_bytes().to_vec(), reference, policy),
        )
        .await
        .map_err(|_| {
            tracing::error!(student_id, "verification timed out");
            zbus::fdo::Error::Failed("verification timed out".to_string())
        })?
        .map_err(|e| {
            tracing::error!(error = %e, "verification failed");
            zbus::fdo::Error::Failed(e.to_string())
        })?;

        // --- Record the rate-limit outcome. Only identity and spoofing
        // failures count; quality problems are correctable resubmissions. ---
        {
            let mut state = self.state.lock().await;
            if result.accepted {
                state.rate_limiter.record_success(student_id);
            } else if matches!(
                result.failure_reason,
                Some(RejectionReason::MatchBelowThreshold { .. })
                    | Some(RejectionReason::SpoofingDetected { .. })
            ) {
                state.rate_limiter.record_failure(student_id);
            }
        }

        tracing::info!(
            student_id,
            accepted = result.accepted,
            confidence = result.confidence_score,
            strategy = ?result.match_strategy_used,
            "verification complete"
        );

        serde_json::to_string(&result).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Enroll (or replace) a student's profile reference image.
    ///
    /// The image is screened through the quality, single-face, and
    /// eye-visibility gates before being stored. Returns JSON
    /// `{"enrolled": bool, "reason": string|null}`.
    async fn enroll_profile(
        &self,
        student_id: &str,
        display_name: &str,
        image: &str,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(student_id, "enrollment requested");

        let (engine, store) = {
            let state = self.state.lock().await;
            (state.engine.clone(), state.store.clone())
        };

        let screened = engine
            .screen(image.as_bytes().to_vec())
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

        if let Some(reason) = screened {
            tracing::warn!(student_id, reason = %reason, "enrollment image rejected");
            return Ok(serde_json::json!({
                "enrolled": false,
                "reason": reason.to_string(),
            })
            .to_string());
        }

        store
            .upsert_profile(student_id, display_name, image.as_bytes())
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "profile store failed");
                zbus::fdo::Error::Failed(e.to_string())
            })?;

        tracing::info!(student_id, "profile enrolled");
        Ok(serde_json::json!({ "enrolled": true, "reason": null }).to_string())
    }

    /// Whether the student has an enrolled profile image.
    async fn has_profile(&self, student_id: &str) -> zbus::fdo::Result<bool> {
        let store = self.state.lock().await.store.clone();
        store
            .has_profile(student_id)
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Remove a student's profile. Returns whether one existed.
    async fn remove_profile(&self, student_id: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(student_id, "profile removal requested");
        let store = self.state.lock().await.store.clone();
        let removed = store
            .remove_profile(student_id)
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        if removed {
            tracing::info!(student_id, "profile removed");
        }
        Ok(removed)
    }

    /// List enrolled profiles (metadata only, never image bytes) as JSON.
    async fn list_profiles(&self) -> zbus::fdo::Result<String> {
        let store = self.state.lock().await.store.clone();
        let profiles = store
            .list_profiles()
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        serde_json::to_string(&profiles).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Daemon status as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let state = self.state.lock().await;
        let profiles = state.store.count_profiles().await.unwrap_or(0);

        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "profiles_enrolled": profiles,
            "match_strategy": state.engine.strategy(),
            "default_policy": state.config.default_policy,
            "workers": state.config.workers,
        })
        .to_string())
    }
}
