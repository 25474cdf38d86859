//! Cryptographic verification worker
//!
//! Schnorr verification is CPU-bound, so it runs on a dedicated thread that
//! drains its queue in batches and verifies them in parallel, keeping the
//! async connection tasks free of blocking work.

use crate::error::{Error, Result};
use crate::event::Event;
use rayon::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

const MAX_VERIFY_BATCH: usize = 256;

/// Request to verify an event
struct VerifyRequest {
    event: Arc<Event>,
    response: oneshot::Sender<Result<()>>,
}

/// Handle for event signature verification
#[derive(Clone)]
pub struct CryptoVerifier {
    verify_sender: flume::Sender<VerifyRequest>,
    verified_count: Arc<AtomicUsize>,
}

impl std::fmt::Debug for CryptoVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoVerifier").finish()
    }
}

impl Default for CryptoVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl CryptoVerifier {
    /// Create a verifier and spawn its processing thread
    pub fn new() -> Self {
        let (verify_sender, verify_receiver) = flume::bounded::<VerifyRequest>(10_000);
        let verified_count = Arc::new(AtomicUsize::new(0));

        let verified_count_clone = Arc::clone(&verified_count);
        std::thread::spawn(move || {
            Self::run_verify_processor(&verify_receiver, &verified_count_clone);
        });

        Self {
            verify_sender,
            verified_count,
        }
    }

    /// Verify an event's id digest and Schnorr signature off the async
    /// runtime. Resolves once the worker has processed the request.
    pub async fn verify_event(&self, event: Arc<Event>) -> Result<()> {
        let (response, receiver) = oneshot::channel();
        self.verify_sender
            .send_async(VerifyRequest { event, response })
            .await
            .map_err(|_| Error::internal("verification worker is gone"))?;
        receiver
            .await
            .map_err(|_| Error::internal("verification worker dropped the request"))?
    }

    /// Number of events verified successfully since startup
    pub fn verified_count(&self) -> usize {
        self.verified_count.load(Ordering::Relaxed)
    }

    fn run_verify_processor(
        receiver: &flume::Receiver<VerifyRequest>,
        verified_count: &AtomicUsize,
    ) {
        while let Ok(first) = receiver.recv() {
            // Opportunistically drain whatever queued up behind the first
            // request so a burst is verified as one parallel batch.
            let mut batch = vec![first];
            while batch.len() < MAX_VERIFY_BATCH {
                match receiver.try_recv() {
                    Ok(request) => batch.push(request),
                    Err(_) => break,
                }
            }

            let results: Vec<Result<()>> = if batch.len() > 1 {
                debug!("Verifying batch of {} events", batch.len());
                batch.par_iter().map(|r| r.event.verify()).collect()
            } else {
                batch.iter().map(|r| r.event.verify()).collect()
            };

            for (request, result) in batch.into_iter().zip(results) {
                if result.is_ok() {
                    verified_count.fetch_add(1, Ordering::Relaxed);
                }
                // Receiver may have gone away with its connection
                let _ = request.response.send(result);
            }
        }
    }
}
