//! Batch aggregation for cost-efficient grouped dispatch.
//!
//! Requests collect in a queue until either the size threshold is reached or
//! `batch_timeout` elapses since the first entry of the batch, then the whole
//! group goes to the backend in one call. Each caller holds a [`BatchTicket`]
//! and awaits its own result.
//!
//! The queue lock is a short synchronous critical section and is never held
//! across the backend call, so new entries start a fresh batch while a flush
//! is outstanding. Backend calls themselves are serialized by a separate
//! async lock: one flush in flight at a time.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::backend::GenerationBackend;
use crate::clock::Clock;
use crate::config::CoreConfig;
use crate::error::{Result, VolleyError};
use crate::types::{BatchId, EntryId, GenerationOutput, GenerationPayload};

/// A queued request waiting for its batch to flush.
struct PendingEntry {
    id: EntryId,
    payload: GenerationPayload,
    enqueued_at: DateTime<Utc>,
    tx: oneshot::Sender<Result<GenerationOutput>>,
}

/// The batch currently being collected.
///
/// Invariant: an empty queue has no armed timer and a fresh batch id, so a
/// stale timer can never flush entries it did not see enqueued.
struct CollectState {
    entries: Vec<PendingEntry>,
    batch_id: BatchId,
    timer: Option<CancellationToken>,
}

struct AggregatorInner<B> {
    backend: Arc<B>,
    clock: Arc<dyn Clock>,
    threshold: usize,
    timeout: Duration,
    state: Arc<Mutex<CollectState>>,
    /// Serializes backend calls without blocking new submissions.
    flush_order: tokio::sync::Mutex<()>,
}

/// Collects generation requests and dispatches them in groups.
///
/// Cloning is cheap; all clones share the same queue. The aggregator is
/// optional per request class: latency-sensitive requests should call
/// [`GenerationBackend::generate_single`] directly instead of submitting
/// here.
///
/// # Example
/// ```ignore
/// let aggregator = BatchAggregator::new(backend, clock, &config)?;
/// let ticket = aggregator.submit(payload);
/// let output = ticket.wait().await?;
/// ```
pub struct BatchAggregator<B: GenerationBackend> {
    inner: Arc<AggregatorInner<B>>,
}

impl<B: GenerationBackend> Clone for BatchAggregator<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<B: GenerationBackend + 'static> BatchAggregator<B> {
    /// Create a new aggregator.
    ///
    /// # Errors
    /// Returns `InvalidConfiguration` if the config fails validation.
    pub fn new(backend: Arc<B>, clock: Arc<dyn Clock>, config: &CoreConfig) -> Result<Self> {
        config.validate()?;

        info!(
            threshold = config.batch_size_threshold,
            timeout_secs = config.batch_timeout.as_secs(),
            "Batch aggregator initialized"
        );

        Ok(Self {
            inner: Arc::new(AggregatorInner {
                backend,
                clock,
                threshold: config.batch_size_threshold,
                timeout: config.batch_timeout,
                state: Arc::new(Mutex::new(CollectState {
                    entries: Vec::new(),
                    batch_id: BatchId::new(),
                    timer: None,
                })),
                flush_order: tokio::sync::Mutex::new(()),
            }),
        })
    }

    /// Enqueue a payload for the next batch.
    ///
    /// The first entry of a batch arms a cancellable timer for
    /// `batch_timeout`; reaching `batch_size_threshold` flushes immediately.
    /// The returned ticket resolves when the batch completes.
    #[instrument(skip(self, payload), fields(user_id = %payload.user_id))]
    pub fn submit(&self, payload: GenerationPayload) -> BatchTicket {
        let (tx, rx) = oneshot::channel();
        let id = EntryId::new();
        let enqueued_at = self.inner.clock.now();

        let to_flush = {
            let mut state = self.inner.state.lock();

            state.entries.push(PendingEntry {
                id,
                payload,
                enqueued_at,
                tx,
            });
            debug!(
                entry_id = %id,
                batch_id = %state.batch_id,
                pending = state.entries.len(),
                "Entry enqueued"
            );

            if state.entries.len() == 1 {
                self.arm_timer(&mut state);
            }

            if state.entries.len() >= self.inner.threshold {
                Some(Self::take_batch(&mut state))
            } else {
                None
            }
        };

        if let Some((batch_id, entries)) = to_flush {
            debug!(batch_id = %batch_id, "Size threshold reached, flushing");
            let aggregator = self.clone();
            tokio::spawn(async move {
                aggregator.dispatch(batch_id, entries).await;
            });
        }

        BatchTicket {
            id,
            rx,
            state: Arc::downgrade(&self.inner.state),
        }
    }

    /// Drain the current queue and dispatch it now, regardless of size.
    ///
    /// No-op if the queue is empty. Useful for graceful shutdown.
    pub async fn flush(&self) {
        let taken = {
            let mut state = self.inner.state.lock();
            if state.entries.is_empty() {
                None
            } else {
                Some(Self::take_batch(&mut state))
            }
        };

        if let Some((batch_id, entries)) = taken {
            self.dispatch(batch_id, entries).await;
        }
    }

    /// Number of entries waiting for the next flush.
    pub fn pending_len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    /// How long the oldest queued entry has been waiting, or `None` when the
    /// queue is empty. Status surfaces show this alongside
    /// [`pending_len`](Self::pending_len).
    pub fn oldest_pending_age(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.inner
            .state
            .lock()
            .entries
            .first()
            .map(|entry| (now - entry.enqueued_at).to_std().unwrap_or_default())
    }

    /// Arm the timeout for the batch that just received its first entry.
    fn arm_timer(&self, state: &mut CollectState) {
        let token = CancellationToken::new();
        state.timer = Some(token.clone());

        let aggregator = self.clone();
        let batch_id = state.batch_id;
        let timeout = self.inner.timeout;

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    aggregator.flush_if_current(batch_id).await;
                }
            }
        });
    }

    /// Timer path: flush only if the queue still holds the batch the timer
    /// was armed for.
    async fn flush_if_current(&self, batch_id: BatchId) {
        let taken = {
            let mut state = self.inner.state.lock();
            if state.batch_id == batch_id && !state.entries.is_empty() {
                Some(Self::take_batch(&mut state))
            } else {
                None
            }
        };

        if let Some((batch_id, entries)) = taken {
            debug!(batch_id = %batch_id, "Batch timeout elapsed, flushing");
            self.dispatch(batch_id, entries).await;
        }
    }

    /// Take ownership of the collected batch and reset the queue to Idle.
    /// Caller must hold the state lock.
    fn take_batch(state: &mut CollectState) -> (BatchId, Vec<PendingEntry>) {
        if let Some(token) = state.timer.take() {
            token.cancel();
        }
        let entries = std::mem::take(&mut state.entries);
        let batch_id = state.batch_id;
        state.batch_id = BatchId::new();
        (batch_id, entries)
    }

    /// Send one grouped backend call and resolve every ticket positionally.
    ///
    /// A backend error, or a result count that does not match the payload
    /// count, fails the whole batch uniformly. The aggregator never
    /// resubmits; retrying is the caller's call, which prevents silent
    /// duplicate billing.
    #[instrument(skip(self, entries, batch_id), fields(batch_id = %batch_id, size = entries.len()))]
    async fn dispatch(&self, batch_id: BatchId, entries: Vec<PendingEntry>) {
        let _order = self.inner.flush_order.lock().await;

        let payloads: Vec<GenerationPayload> =
            entries.iter().map(|e| e.payload.clone()).collect();

        info!(size = payloads.len(), "Dispatching batch");

        match self.inner.backend.generate_batch(&payloads).await {
            Ok(outputs) if outputs.len() == entries.len() => {
                debug!("Batch completed");
                for (entry, output) in entries.into_iter().zip(outputs) {
                    // A closed receiver means the caller canceled; nothing to do.
                    let _ = entry.tx.send(Ok(output));
                }
            }
            Ok(outputs) => {
                let failure = VolleyError::BatchDispatchFailure(format!(
                    "backend returned {} results for {} payloads",
                    outputs.len(),
                    payloads.len()
                ));
                error!(error = %failure, "Batch result shape mismatch, failing whole batch");
                for entry in entries {
                    let _ = entry.tx.send(Err(failure.clone()));
                }
            }
            Err(e) => {
                let failure = VolleyError::BatchDispatchFailure(e.to_string());
                error!(error = %failure, "Batch dispatch failed");
                for entry in entries {
                    let _ = entry.tx.send(Err(failure.clone()));
                }
            }
        }
    }
}

/// Completion handle for a submitted entry.
///
/// Holds the receiving half of the entry's result channel. Dropping the
/// ticket discards the result; [`cancel`](Self::cancel) additionally pulls
/// the entry out of the queue if its batch has not flushed yet.
pub struct BatchTicket {
    id: EntryId,
    rx: oneshot::Receiver<Result<GenerationOutput>>,
    state: Weak<Mutex<CollectState>>,
}

impl BatchTicket {
    /// The id of the submitted entry.
    pub fn id(&self) -> EntryId {
        self.id
    }

    /// Wait for the entry's result.
    ///
    /// Resolves to `Canceled` if the aggregator went away before the batch
    /// flushed.
    pub async fn wait(self) -> Result<GenerationOutput> {
        self.rx.await.unwrap_or(Err(VolleyError::Canceled))
    }

    /// Abandon this entry.
    ///
    /// If the batch has not flushed, the entry is removed from the queue and
    /// the others are unaffected. If a flush is already in flight, the
    /// network call proceeds and only result delivery is suppressed.
    pub fn cancel(self) {
        if let Some(state) = self.state.upgrade() {
            let mut state = state.lock();
            if let Some(pos) = state.entries.iter().position(|e| e.id == self.id) {
                state.entries.remove(pos);
                debug!(entry_id = %self.id, "Entry canceled before flush");

                // Keep the empty-queue invariant: no armed timer, fresh id.
                if state.entries.is_empty() {
                    if let Some(token) = state.timer.take() {
                        token.cancel();
                    }
                    state.batch_id = BatchId::new();
                }
            }
        }
        // self.rx drops here, suppressing delivery for in-flight flushes.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::clock::{ManualClock, SystemClock};
    use chrono::TimeDelta;
    use async_trait::async_trait;
    use tokio::sync::Notify;

    fn config(threshold: usize, timeout_secs: u64) -> CoreConfig {
        CoreConfig {
            batch_size_threshold: threshold,
            batch_timeout: Duration::from_secs(timeout_secs),
            ..CoreConfig::default()
        }
    }

    fn aggregator(backend: &MockBackend, cfg: &CoreConfig) -> BatchAggregator<MockBackend> {
        BatchAggregator::new(Arc::new(backend.clone()), Arc::new(SystemClock), cfg).unwrap()
    }

    fn outputs(n: usize) -> Vec<GenerationOutput> {
        (0..n).map(|i| GenerationOutput::png(vec![i as u8])).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_triggers_single_flush_in_order() {
        let backend = MockBackend::new();
        backend.push_batch_response(Ok(outputs(2)));
        let aggregator = aggregator(&backend, &config(2, 60));

        let ticket_a = aggregator.submit(GenerationPayload::new("u1", "a"));
        assert_eq!(aggregator.pending_len(), 1);

        let ticket_b = aggregator.submit(GenerationPayload::new("u2", "b"));

        // Results resolve positionally.
        assert_eq!(ticket_a.wait().await.unwrap().image, vec![0]);
        assert_eq!(ticket_b.wait().await.unwrap().image, vec![1]);

        // Exactly one flush, entries in submission order.
        let calls = backend.batch_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0][0].prompt, "a");
        assert_eq!(calls[0][1].prompt, "b");
        assert_eq!(aggregator.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_oldest_pending_age_tracks_first_entry() {
        let backend = MockBackend::new();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let aggregator = BatchAggregator::new(
            Arc::new(backend.clone()),
            clock.clone(),
            &config(10, 600),
        )
        .unwrap();

        assert_eq!(aggregator.oldest_pending_age(clock.now()), None);

        let _ticket_a = aggregator.submit(GenerationPayload::new("u1", "a"));
        clock.advance(TimeDelta::seconds(10));
        let _ticket_b = aggregator.submit(GenerationPayload::new("u2", "b"));

        // Age is measured from the first entry of the batch, not the latest.
        assert_eq!(
            aggregator.oldest_pending_age(clock.now()),
            Some(Duration::from_secs(10))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_flushes_single_entry() {
        let backend = MockBackend::new();
        backend.push_batch_response(Ok(outputs(1)));
        let aggregator = aggregator(&backend, &config(5, 60));

        let ticket = aggregator.submit(GenerationPayload::new("u1", "c"));

        // Nothing flushes before the timeout.
        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(backend.batch_call_count(), 0);
        assert_eq!(aggregator.pending_len(), 1);

        // Paused time auto-advances past the timer while we await the ticket.
        let output = ticket.wait().await.unwrap();
        assert_eq!(output.image, vec![0]);

        let calls = backend.batch_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].len(), 1);
        assert_eq!(calls[0][0].prompt, "c");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_from_first_entry() {
        // threshold 2, timeout 60s: A at t0, B at t10 flushes immediately on
        // the threshold, well before the timer.
        let backend = MockBackend::new();
        backend.push_batch_response(Ok(outputs(2)));
        let aggregator = aggregator(&backend, &config(2, 60));

        let ticket_a = aggregator.submit(GenerationPayload::new("u1", "a"));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(backend.batch_call_count(), 0);

        let ticket_b = aggregator.submit(GenerationPayload::new("u2", "b"));

        ticket_a.wait().await.unwrap();
        ticket_b.wait().await.unwrap();

        let calls = backend.batch_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_failure_fails_all_entries_uniformly() {
        let backend = MockBackend::new();
        backend.push_batch_response(Err(VolleyError::Backend("upstream 500".to_string())));
        let aggregator = aggregator(&backend, &config(2, 60));

        let ticket_a = aggregator.submit(GenerationPayload::new("u1", "a"));
        let ticket_b = aggregator.submit(GenerationPayload::new("u2", "b"));

        let err_a = ticket_a.wait().await.unwrap_err();
        let err_b = ticket_b.wait().await.unwrap_err();

        assert!(matches!(err_a, VolleyError::BatchDispatchFailure(_)));
        assert_eq!(err_a, err_b);
        assert!(err_a.is_retryable());

        // Failure does not trigger a resubmit.
        assert_eq!(backend.batch_call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_count_mismatch_fails_whole_batch() {
        let backend = MockBackend::new();
        // Two entries, one result: partial success is treated as wholesale failure.
        backend.push_batch_response(Ok(outputs(1)));
        let aggregator = aggregator(&backend, &config(2, 60));

        let ticket_a = aggregator.submit(GenerationPayload::new("u1", "a"));
        let ticket_b = aggregator.submit(GenerationPayload::new("u2", "b"));

        assert!(matches!(
            ticket_a.wait().await,
            Err(VolleyError::BatchDispatchFailure(_))
        ));
        assert!(matches!(
            ticket_b.wait().await,
            Err(VolleyError::BatchDispatchFailure(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_removes_entry_without_affecting_others() {
        let backend = MockBackend::new();
        backend.push_batch_response(Ok(outputs(3)));
        let aggregator = aggregator(&backend, &config(3, 60));

        let ticket_a = aggregator.submit(GenerationPayload::new("u1", "a"));
        let ticket_b = aggregator.submit(GenerationPayload::new("u2", "b"));
        assert_eq!(aggregator.pending_len(), 2);

        ticket_a.cancel();
        assert_eq!(aggregator.pending_len(), 1);

        let ticket_c = aggregator.submit(GenerationPayload::new("u3", "c"));
        let ticket_d = aggregator.submit(GenerationPayload::new("u4", "d"));

        ticket_b.wait().await.unwrap();
        ticket_c.wait().await.unwrap();
        ticket_d.wait().await.unwrap();

        let calls = backend.batch_calls();
        assert_eq!(calls.len(), 1);
        let prompts: Vec<_> = calls[0].iter().map(|p| p.prompt.as_str()).collect();
        assert_eq!(prompts, vec!["b", "c", "d"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_sole_entry_disarms_timer() {
        let backend = MockBackend::new();
        backend.push_batch_response(Ok(outputs(1)));
        let aggregator = aggregator(&backend, &config(5, 60));

        let ticket_a = aggregator.submit(GenerationPayload::new("u1", "a"));
        tokio::time::sleep(Duration::from_secs(30)).await;
        ticket_a.cancel();
        assert_eq!(aggregator.pending_len(), 0);

        // B starts a fresh batch with its own full timeout; the stale timer
        // from A's batch must not flush it early.
        let ticket_b = aggregator.submit(GenerationPayload::new("u2", "b"));
        tokio::time::sleep(Duration::from_secs(45)).await;
        assert_eq!(backend.batch_call_count(), 0);

        let output = ticket_b.wait().await.unwrap();
        assert_eq!(output.image, vec![0]);

        let calls = backend.batch_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0][0].prompt, "b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_flush_drains_queue() {
        let backend = MockBackend::new();
        backend.push_batch_response(Ok(outputs(2)));
        let aggregator = aggregator(&backend, &config(10, 600));

        let ticket_a = aggregator.submit(GenerationPayload::new("u1", "a"));
        let ticket_b = aggregator.submit(GenerationPayload::new("u2", "b"));

        aggregator.flush().await;
        assert_eq!(aggregator.pending_len(), 0);

        ticket_a.wait().await.unwrap();
        ticket_b.wait().await.unwrap();
        assert_eq!(backend.batch_call_count(), 1);

        // Flushing an empty queue does nothing.
        aggregator.flush().await;
        assert_eq!(backend.batch_call_count(), 1);
    }

    /// Backend that blocks each batch call until released, for overlap tests.
    #[derive(Clone, Default)]
    struct GatedBackend {
        release: Arc<Notify>,
        calls: Arc<Mutex<Vec<Vec<GenerationPayload>>>>,
    }

    #[async_trait]
    impl GenerationBackend for GatedBackend {
        async fn generate_single(
            &self,
            _payload: &GenerationPayload,
        ) -> Result<GenerationOutput> {
            unimplemented!("not used in these tests")
        }

        async fn generate_batch(
            &self,
            payloads: &[GenerationPayload],
        ) -> Result<Vec<GenerationOutput>> {
            self.calls.lock().push(payloads.to_vec());
            self.release.notified().await;
            Ok(payloads
                .iter()
                .map(|_| GenerationOutput::png(vec![0]))
                .collect())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_during_flush_starts_new_batch() {
        let backend = GatedBackend::default();
        let aggregator = BatchAggregator::new(
            Arc::new(backend.clone()),
            Arc::new(SystemClock),
            &config(1, 60),
        )
        .unwrap();

        // Threshold 1: A dispatches immediately and blocks in the backend.
        let ticket_a = aggregator.submit(GenerationPayload::new("u1", "a"));
        tokio::task::yield_now().await;
        assert_eq!(backend.calls.lock().len(), 1);

        // B collects into a fresh batch while A's call is outstanding; its
        // dispatch waits on the flush-order lock, not on the queue lock.
        let ticket_b = aggregator.submit(GenerationPayload::new("u2", "b"));
        tokio::task::yield_now().await;
        assert_eq!(backend.calls.lock().len(), 1);

        // Release A, then B.
        backend.release.notify_one();
        ticket_a.wait().await.unwrap();

        backend.release.notify_one();
        ticket_b.wait().await.unwrap();

        let calls = backend.calls.lock().clone();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0][0].prompt, "a");
        assert_eq!(calls[1][0].prompt, "b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_gates_batch_submission() {
        // End-to-end shape of the command-handler flow: the limiter decides,
        // admitted requests go into the aggregator, rejected ones never reach
        // the backend.
        use crate::limiter::{Decision, RateLimiter};

        let cfg = CoreConfig {
            max_requests_per_window: 2,
            batch_size_threshold: 2,
            ..CoreConfig::default()
        };
        let limiter = RateLimiter::new(&cfg).unwrap();
        let backend = MockBackend::new();
        backend.push_batch_response(Ok(outputs(2)));
        let aggregator = aggregator(&backend, &cfg);

        let now = Utc::now();
        let mut tickets = Vec::new();
        let mut rejected = 0;

        for prompt in ["a", "b", "c"] {
            match limiter.check_and_increment("u1", now) {
                Decision::Admitted { .. } => {
                    tickets.push(aggregator.submit(GenerationPayload::new("u1", prompt)));
                }
                Decision::Rejected { retry_after } => {
                    assert!(retry_after <= Duration::from_secs(3600));
                    rejected += 1;
                }
            }
        }

        assert_eq!(tickets.len(), 2);
        assert_eq!(rejected, 1);

        for ticket in tickets {
            ticket.wait().await.unwrap();
        }
        // Only the admitted payloads reached the backend.
        assert_eq!(backend.batch_calls(), vec![vec![
            GenerationPayload::new("u1", "a"),
            GenerationPayload::new("u1", "b"),
        ]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_aggregator_still_flushes_queued_entries() {
        let backend = MockBackend::new();
        backend.push_batch_response(Ok(outputs(1)));
        let aggregator = aggregator(&backend, &config(5, 60));

        let ticket = aggregator.submit(GenerationPayload::new("u1", "a"));

        // The armed timer holds a clone of the shared core, so dropping the
        // caller's handle does not abandon the queued entry. The timeout
        // flush still runs and the ticket resolves normally.
        drop(aggregator);

        let output = ticket.wait().await.unwrap();
        assert_eq!(output.image, vec![0]);
        assert_eq!(backend.batch_call_count(), 1);
    }
}
