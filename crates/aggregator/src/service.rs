//! Pipeline orchestrator: drives each window from ingestion batches to a
//! signed sum batch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use facilitator_codec::{BatchHeader, IngestionPacket, ValidationPacket};
use facilitator_core::{AggregationWindow, BatchKind, Classify, FailureClass, Interval};
use facilitator_crypto::{KeySet, SigningKeypair};
use facilitator_field::{Field32, VectorShares};
use facilitator_storage::{BatchKey, BatchStore};
use futures::stream::{self, StreamExt};
use tokio::task::JoinSet;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::accumulator::WindowState;
use crate::config::FacilitatorConfig;
use crate::emitter::{BatchEmitter, EmitStatus};
use crate::intake::{authenticate_and_decode_blocking, check_header, AuthenticatedBatch, ExpectedHeader};
use crate::outcome::{
    RunReport, SkipReason, SkippedBatch, WindowFailure, WindowOutcome, WindowStatus,
};
use crate::retry::{poll_until_ready, retry_transient};
use crate::validation::{
    extract_shares, judge, LinearSketchVerifier, PacketKeyring, PacketLedger, PacketShare,
    PacketState, ProofVerifier,
};
use crate::PipelineError;

/// The four batch stores one processor works with.
#[derive(Clone)]
pub struct PipelineStores {
    /// Ingestion batches addressed to this processor.
    pub ingestion: BatchStore,
    /// Validation batches this processor writes for its peer.
    pub own_validation: BatchStore,
    /// Validation batches the peer writes for this processor.
    pub peer_validation: BatchStore,
    /// Sum batches this processor writes for the window.
    pub sum: BatchStore,
}

/// Key material a processor needs.
pub struct FacilitatorKeys {
    pub signing: SigningKeypair,
    pub packet_keys: PacketKeyring,
    /// Active batch signing keys of the ingestor.
    pub ingestor: KeySet,
    /// Active batch signing keys of the peer processor.
    pub peer: KeySet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Ingestion,
    OwnValidation,
    PeerValidation,
}

struct BatchFailure {
    key: BatchKey,
    stage: Stage,
    error: PipelineError,
}

impl BatchFailure {
    fn at(key: &BatchKey, stage: Stage) -> impl FnOnce(PipelineError) -> BatchFailure + '_ {
        move |error| BatchFailure {
            key: key.clone(),
            stage,
            error,
        }
    }
}

struct Extracted {
    shares: Vec<PacketShare>,
    ledger: PacketLedger,
    fragments: Vec<ValidationPacket>,
}

/// One data share processor.
pub struct Facilitator {
    config: FacilitatorConfig,
    stores: PipelineStores,
    emitter: BatchEmitter,
    own_keys: Arc<KeySet>,
    ingestor_keys: Arc<KeySet>,
    peer_keys: Arc<KeySet>,
    packet_keys: Arc<PacketKeyring>,
    verifier: Arc<dyn ProofVerifier>,
    scheme: VectorShares,
}

impl Facilitator {
    pub fn new(
        config: FacilitatorConfig,
        stores: PipelineStores,
        keys: FacilitatorKeys,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let verifier = Arc::new(LinearSketchVerifier::new(config.verification_seed()?));
        let emitter = BatchEmitter::new(keys.signing, config.signing_key_id.clone());
        let own_keys = Arc::new(emitter.key_set(config.own_party.as_str()));
        let scheme = VectorShares::new(config.dimension as usize);

        Ok(Self {
            stores,
            emitter,
            own_keys,
            ingestor_keys: Arc::new(keys.ingestor),
            peer_keys: Arc::new(keys.peer),
            packet_keys: Arc::new(keys.packet_keys),
            verifier,
            scheme,
            config,
        })
    }

    /// Replace the validity predicate.
    pub fn with_verifier(mut self, verifier: Arc<dyn ProofVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn config(&self) -> &FacilitatorConfig {
        &self.config
    }

    pub fn stores(&self) -> &PipelineStores {
        &self.stores
    }

    pub fn sum_key(&self, window: &AggregationWindow) -> BatchKey {
        BatchKey::for_sum(window, &self.config.own_party, &self.config.peer_party)
    }

    /// Deterministic UUID of this processor's sum batch for `window`.
    pub fn sum_batch_uuid(&self, window: &AggregationWindow) -> Uuid {
        let name = format!(
            "facilitator/sum/{}/{}/{}/{}/{}",
            window.aggregation_id,
            window.interval.start,
            window.interval.end,
            self.config.own_party,
            self.config.peer_party
        );
        Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes())
    }

    /// Process one window end to end.
    ///
    /// Recomputes from the start of the window on every call. Existing
    /// validation batches are reused and an existing sum batch short-circuits
    /// the run.
    pub async fn run_window(
        &self,
        window: &AggregationWindow,
        cancel: &CancellationToken,
    ) -> Result<WindowOutcome, PipelineError> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let retry = &self.config.retry;
        let sum_key = self.sum_key(window);

        let done = retry_transient(retry, "check sum batch", || async {
            self.stores.sum.exists(&sum_key).await.map_err(PipelineError::from)
        })
        .await?;
        if done {
            info!(window = %window, batch = %sum_key, "sum batch exists, window already processed");
            return Ok(WindowOutcome::already_processed(window.clone(), sum_key));
        }

        let keys = retry_transient(retry, "list ingestion batches", || async {
            self.stores
                .ingestion
                .list_window(&window.aggregation_id, &window.interval)
                .await
                .map_err(PipelineError::from)
        })
        .await?;
        info!(window = %window, batches = keys.len(), "processing window");

        let results: Vec<Result<WindowState<VectorShares>, BatchFailure>> = stream::iter(keys)
            .map(|key| self.process_batch(window, key, cancel))
            .buffer_unordered(self.config.max_concurrent_batches)
            .collect()
            .await;

        let mut state = WindowState::new(self.scheme);
        let mut skipped = Vec::new();
        let mut waiting_on = Vec::new();
        let mut cancelled = false;
        for result in results {
            match result {
                Ok(partial) => state = state.merge(partial)?,
                Err(failure) => match failure.error.class() {
                    _ if matches!(failure.error, PipelineError::Cancelled) => cancelled = true,
                    FailureClass::Malformed | FailureClass::Authentication => {
                        skipped.push(self.skip(failure));
                    }
                    FailureClass::NotReady => {
                        warn!(batch = %failure.key, error = %failure.error, "batch not ready");
                        waiting_on.push(failure.key);
                    }
                    _ => {
                        let key = failure.key.clone();
                        skipped.push(self.skip(failure));
                        waiting_on.push(key);
                    }
                },
            }
        }
        if cancelled {
            return Err(PipelineError::Cancelled);
        }
        skipped.sort_by(|a: &SkippedBatch, b| a.key.cmp(&b.key));
        waiting_on.sort();

        let valid_packets = state.valid();
        let invalid_packets = state.invalid();

        if !waiting_on.is_empty() {
            warn!(
                window = %window,
                waiting = waiting_on.len(),
                "window incomplete, no sum batch emitted"
            );
            return Ok(WindowOutcome {
                window: window.clone(),
                status: WindowStatus::Incomplete { waiting_on },
                valid_packets,
                invalid_packets,
                skipped,
                sum_key: None,
            });
        }

        let header = BatchHeader::new(
            self.sum_batch_uuid(window),
            window.aggregation_id.clone(),
            BatchKind::Sum,
            window.interval,
            self.config.dimension,
        );
        let files = self.emitter.build(&header, &[state.finalize()])?;
        let status = match self
            .emitter
            .emit(&self.stores.sum, &sum_key, &files, retry)
            .await
        {
            Ok(EmitStatus::Written) => WindowStatus::Completed,
            Ok(EmitStatus::AlreadyPresent) => {
                info!(window = %window, "sum batch written concurrently, keeping existing");
                WindowStatus::AlreadyProcessed
            }
            Err(e) if e.class() == FailureClass::NotReady => {
                error!(
                    window = %window,
                    batch = %sum_key,
                    error = %e,
                    "partial sum batch with different contents present, no sum emitted"
                );
                WindowStatus::Incomplete {
                    waiting_on: vec![sum_key.clone()],
                }
            }
            Err(e) => return Err(e),
        };
        let sum_key = (!matches!(status, WindowStatus::Incomplete { .. })).then_some(sum_key);

        info!(
            window = %window,
            valid = valid_packets,
            invalid = invalid_packets,
            skipped = skipped.len(),
            "window aggregated"
        );

        Ok(WindowOutcome {
            window: window.clone(),
            status,
            valid_packets,
            invalid_packets,
            skipped,
            sum_key,
        })
    }

    /// Intake and aggregation of one ingestion batch.
    async fn process_batch(
        &self,
        window: &AggregationWindow,
        key: BatchKey,
        cancel: &CancellationToken,
    ) -> Result<WindowState<VectorShares>, BatchFailure> {
        if cancel.is_cancelled() {
            return Err(BatchFailure::at(&key, Stage::Ingestion)(PipelineError::Cancelled));
        }
        let retry = &self.config.retry;

        // Intake.
        let files = retry_transient(retry, "fetch ingestion batch", || async {
            self.stores.ingestion.fetch(&key).await.map_err(PipelineError::from)
        })
        .await
        .map_err(BatchFailure::at(&key, Stage::Ingestion))?;

        let batch: AuthenticatedBatch<IngestionPacket> =
            authenticate_and_decode_blocking(key.clone(), files, Arc::clone(&self.ingestor_keys))
                .await
                .map_err(BatchFailure::at(&key, Stage::Ingestion))?;
        check_header(
            &key,
            &batch.header,
            &ExpectedHeader {
                aggregation_id: &window.aggregation_id,
                window,
                kind: BatchKind::Ingestion,
                dimension: self.config.dimension,
                batch_uuid: None,
            },
        )
        .map_err(BatchFailure::at(&key, Stage::Ingestion))?;

        let header = batch.header;
        let Extracted {
            shares,
            mut ledger,
            fragments,
        } = self
            .extract(batch.packets)
            .await
            .map_err(BatchFailure::at(&key, Stage::Ingestion))?;

        // Own validation batch; a stored copy from an earlier run wins.
        let own_fragments = self
            .emit_validation(&key, &header, fragments)
            .await
            .map_err(BatchFailure::at(&key, Stage::OwnValidation))?;
        ledger.advance_all(PacketState::ShareExtracted, PacketState::ValidationShareEmitted);

        // Peer validation batch.
        let what = format!("peer validation {key}");
        let peer_files = poll_until_ready(&self.config.peer_poll, &what, cancel, || async {
            self.stores.peer_validation.fetch(&key).await.map_err(PipelineError::from)
        })
        .await
        .map_err(BatchFailure::at(&key, Stage::PeerValidation))?;

        let peer: AuthenticatedBatch<ValidationPacket> =
            authenticate_and_decode_blocking(key.clone(), peer_files, Arc::clone(&self.peer_keys))
                .await
                .map_err(BatchFailure::at(&key, Stage::PeerValidation))?;
        check_header(
            &key,
            &peer.header,
            &ExpectedHeader {
                aggregation_id: &window.aggregation_id,
                window,
                kind: BatchKind::Validation,
                dimension: self.config.dimension,
                batch_uuid: Some(header.batch_uuid),
            },
        )
        .map_err(BatchFailure::at(&key, Stage::PeerValidation))?;

        let own: HashMap<Uuid, Vec<Field32>> = own_fragments
            .into_iter()
            .map(|p| (p.uuid, p.fragment))
            .collect();
        let peer: HashMap<Uuid, Vec<Field32>> = peer
            .packets
            .into_iter()
            .map(|p| (p.uuid, p.fragment))
            .collect();

        let accepted = judge(self.verifier.as_ref(), &shares, &own, &peer, &mut ledger);
        let mut state = WindowState::new(self.scheme).with_batch(header.batch_uuid);
        for share in accepted {
            state = state
                .accumulate(&share.data)
                .map_err(|e| BatchFailure::at(&key, Stage::Ingestion)(e.into()))?;
        }
        let state = state.reject(ledger.rejected_count());

        if ledger.is_empty() {
            debug!(batch = %key, "batch carries no packets");
        } else {
            debug!(
                batch = %key,
                packets = ledger.len(),
                valid = ledger.valid_count(),
                invalid = state.invalid(),
                unresolved = ledger.unresolved(),
                rejections = ?ledger.rejections(),
                "batch judged"
            );
        }
        Ok(state)
    }

    /// Open packets and compute fragments on the blocking pool.
    async fn extract(&self, packets: Vec<IngestionPacket>) -> Result<Extracted, PipelineError> {
        let keys = Arc::clone(&self.packet_keys);
        let verifier = Arc::clone(&self.verifier);
        let dimension = self.config.dimension as usize;

        let extracted = tokio::task::spawn_blocking(move || {
            let mut ledger = PacketLedger::authenticated(packets.iter().map(|p| &p.uuid));
            let proof_len = verifier.proof_len(dimension);
            let shares = extract_shares(&packets, &keys, dimension, proof_len, &mut ledger);
            let fragments = shares
                .iter()
                .map(|share| ValidationPacket {
                    uuid: share.uuid,
                    fragment: verifier.fragment(share),
                })
                .collect();
            Extracted {
                shares,
                ledger,
                fragments,
            }
        })
        .await?;
        Ok(extracted)
    }

    /// Write this processor's validation batch and return the fragments the
    /// peer will see.
    async fn emit_validation(
        &self,
        key: &BatchKey,
        ingestion: &BatchHeader,
        fragments: Vec<ValidationPacket>,
    ) -> Result<Vec<ValidationPacket>, PipelineError> {
        let header = BatchHeader::new(
            ingestion.batch_uuid,
            ingestion.aggregation_id.clone(),
            BatchKind::Validation,
            ingestion.interval,
            ingestion.dimension,
        );
        let files = self.emitter.build(&header, &fragments)?;
        let retry = &self.config.retry;

        match self
            .emitter
            .emit(&self.stores.own_validation, key, &files, retry)
            .await?
        {
            EmitStatus::Written => Ok(fragments),
            EmitStatus::AlreadyPresent => {
                let stored = retry_transient(retry, "fetch own validation batch", || async {
                    self.stores.own_validation.fetch(key).await.map_err(PipelineError::from)
                })
                .await?;
                let batch: AuthenticatedBatch<ValidationPacket> =
                    authenticate_and_decode_blocking(key.clone(), stored, Arc::clone(&self.own_keys))
                        .await?;
                Ok(batch.packets)
            }
        }
    }

    fn skip(&self, failure: BatchFailure) -> SkippedBatch {
        let class = failure.error.class();
        let reason = match (failure.stage, class) {
            (_, FailureClass::Transient) => SkipReason::StorageUnavailable,
            (Stage::PeerValidation, FailureClass::Authentication) => SkipReason::PeerUnauthenticated,
            (Stage::PeerValidation, FailureClass::Malformed) => SkipReason::PeerMalformed,
            (_, FailureClass::Authentication) => SkipReason::Unauthenticated,
            (_, FailureClass::Malformed) => SkipReason::Malformed,
            _ => SkipReason::Failed,
        };

        if reason.is_retryable() {
            error!(
                batch = %failure.key,
                reason = reason.code(),
                error = %failure.error,
                "batch failed, window left incomplete"
            );
        } else if reason.is_security_event() {
            error!(
                security_event = true,
                batch = %failure.key,
                reason = reason.code(),
                error = %failure.error,
                "batch failed authentication, skipped"
            );
        } else {
            warn!(
                batch = %failure.key,
                reason = reason.code(),
                error = %failure.error,
                "malformed batch skipped"
            );
        }

        SkippedBatch {
            key: failure.key,
            reason,
            detail: failure.error.to_string(),
        }
    }

    /// Run several windows concurrently, one task each.
    pub async fn run_windows(
        self: &Arc<Self>,
        windows: Vec<AggregationWindow>,
        cancel: &CancellationToken,
    ) -> RunReport {
        let mut tasks = JoinSet::new();
        for window in windows {
            let this = Arc::clone(self);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let result = this.run_window(&window, &cancel).await;
                (window, result)
            });
        }

        let mut report = RunReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(outcome))) => report.outcomes.push(outcome),
                Ok((window, Err(e))) => {
                    error!(window = %window, error = %e, "window failed");
                    report.failures.push(WindowFailure {
                        window,
                        error: e.to_string(),
                    });
                }
                Err(e) => error!(error = %e, "window task aborted"),
            }
        }

        report
            .outcomes
            .sort_by_key(|o| (o.window.interval.start, o.window.aggregation_id.clone()));
        report
            .failures
            .sort_by_key(|f| (f.window.interval.start, f.window.aggregation_id.clone()));

        info!(
            windows = report.windows_processed(),
            failed = report.failures.len(),
            valid = report.valid_packets(),
            invalid = report.invalid_packets(),
            "run complete"
        );
        report
    }

    /// Process each window once its grace period has passed, until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), PipelineError> {
        let duration = self.config.window_duration_secs as i64;
        let grace = self.config.grace_period_secs as i64;
        info!(
            window_duration = duration,
            grace_period = grace,
            own = %self.config.own_party,
            peer = %self.config.peer_party,
            "facilitator starting"
        );

        // Start with the most recently closed window.
        let mut start = align_to_window(current_timestamp(), duration) - duration;
        loop {
            let end = start + duration;
            let now = current_timestamp();
            if now < end + grace {
                let wait = Duration::from_secs((end + grace - now) as u64);
                info!(wait_secs = wait.as_secs(), "waiting for window to close");
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("facilitator stopping");
                        return Ok(());
                    }
                    _ = time::sleep(wait) => {}
                }
            }

            let interval =
                Interval::new(start, end).map_err(|e| PipelineError::Config(e.to_string()))?;
            let window = AggregationWindow::new(self.config.aggregation_id.clone(), interval);
            match self.run_window(&window, &cancel).await {
                Ok(outcome) => info!(
                    window = %window,
                    status = ?outcome.status,
                    valid = outcome.valid_packets,
                    invalid = outcome.invalid_packets,
                    "window processed"
                ),
                Err(PipelineError::Cancelled) => {
                    info!("facilitator stopping");
                    return Ok(());
                }
                Err(e) => error!(window = %window, error = %e, "window failed"),
            }
            start = end;
        }
    }
}

/// Current unix timestamp in seconds.
fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Align a timestamp to the start of its window.
pub fn align_to_window(timestamp: i64, duration: i64) -> i64 {
    timestamp - timestamp.rem_euclid(duration)
}
