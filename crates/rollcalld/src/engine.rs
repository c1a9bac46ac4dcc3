//! Bounded verification worker pool.
//!
//! The pipeline is CPU-bound, so verifications run on dedicated OS threads —
//! one verifier per worker, each owning its own model sessions — fed
//! round-robin over bounded channels. Requests never share mutable state;
//! the cascade model weights are the only cross-worker data and are cloned
//! read-only at spawn time.

use rollcall_core::config::{MatchPolicy, PipelineConfig};
use rollcall_core::types::{MatchStrategy, RejectionReason, VerificationResult};
use rollcall_core::Verifier;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("pipeline: {0}")]
    Pipeline(#[from] rollcall_core::PipelineError),
    #[error("verification worker unavailable")]
    ChannelClosed,
}

/// Messages sent from D-Bus handlers to worker threads.
enum EngineRequest {
    Verify {
        candidate: Vec<u8>,
        reference: Option<Vec<u8>>,
        policy: MatchPolicy,
        reply: oneshot::Sender<VerificationResult>,
    },
    Screen {
        image: Vec<u8>,
        reply: oneshot::Sender<Option<RejectionReason>>,
    },
}

/// Clone-safe handle dispatching requests round-robin across the pool.
#[derive(Clone)]
pub struct EngineHandle {
    txs: Vec<mpsc::Sender<EngineRequest>>,
    next: Arc<AtomicUsize>,
    strategy: MatchStrategy,
}

impl EngineHandle {
    /// Match strategy bound at startup (identical for every worker).
    pub fn strategy(&self) -> MatchStrategy {
        self.strategy
    }

    fn next_tx(&self) -> &mpsc::Sender<EngineRequest> {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.txs.len();
        &self.txs[i]
    }

    /// Run a full verification on the pool.
    pub async fn verify(
        &self,
        candidate: Vec<u8>,
        reference: Option<Vec<u8>>,
        policy: MatchPolicy,
    ) -> Result<VerificationResult, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.next_tx()
            .send(EngineRequest::Verify {
                candidate,
                reference,
                policy,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Screen an image for enrollment (decode, sharpness, one face, eyes).
    pub async fn screen(&self, image: Vec<u8>) -> Result<Option<RejectionReason>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.next_tx()
            .send(EngineRequest::Screen {
                image,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// Spawn the worker pool.
///
/// Every verifier is constructed up front on the caller thread so unusable
/// model artifacts fail fast at startup rather than on the first request.
pub fn spawn_engine(
    model_dir: &Path,
    pipeline: PipelineConfig,
    workers: usize,
) -> Result<EngineHandle, EngineError> {
    let cascade_path = model_dir.join(rollcall_models::cascade_model().name);
    let embedding_path = model_dir.join(rollcall_models::embedding_model().name);

    let workers = workers.max(1);
    let mut verifiers = Vec::with_capacity(workers);
    for _ in 0..workers {
        verifiers.push(Verifier::with_models(
            &cascade_path,
            &embedding_path,
            pipeline.clone(),
        )?);
    }
    let strategy = verifiers[0].match_strategy();

    let mut txs = Vec::with_capacity(workers);
    for (i, mut verifier) in verifiers.into_iter().enumerate() {
        let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);
        std::thread::Builder::new()
            .name(format!("rollcall-verify-{i}"))
            .spawn(move || {
                tracing::info!(worker = i, "verification worker started");
                while let Some(req) = rx.blocking_recv() {
                    match req {
                        EngineRequest::Verify {
                            candidate,
                            reference,
                            policy,
                            reply,
                        } => {
                            let result = verifier.verify(&candidate, reference.as_deref(), policy);
                            let _ = reply.send(result);
                        }
                        EngineRequest::Screen { image, reply } => {
                            let _ = reply.send(verifier.screen_reference(&image));
                        }
                    }
                }
                tracing::info!(worker = i, "verification worker exiting");
            })
            .expect("failed to spawn verification worker");
        txs.push(tx);
    }

    Ok(EngineHandle {
        txs,
        next: Arc::new(AtomicUsize::new(0)),
        strategy,
    })
}
