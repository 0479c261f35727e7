//! Generation backend abstraction.
//!
//! The core never speaks a wire format. It invokes the backend through this
//! trait, which the application implements on top of whatever client it
//! already has. The mock implementation lets tests script responses without
//! any network traffic.

use async_trait::async_trait;

use crate::error::{Result, VolleyError};
use crate::types::{GenerationOutput, GenerationPayload};

/// Capability for generating images, singly or in bulk.
///
/// Implementations perform the actual (network) work; the core only decides
/// when and with what to call them.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Generate a single image. Used by the immediate-dispatch path for
    /// latency-sensitive requests that bypass batching.
    async fn generate_single(&self, payload: &GenerationPayload) -> Result<GenerationOutput>;

    /// Generate one image per payload, in one grouped call.
    ///
    /// On success the returned vector must have the same length and order as
    /// `payloads`. The aggregator treats any other shape as a wholesale
    /// failure of the batch.
    async fn generate_batch(
        &self,
        payloads: &[GenerationPayload],
    ) -> Result<Vec<GenerationOutput>>;
}

// ============================================================================
// Test/Mock Implementation
// ============================================================================

use parking_lot::Mutex;
use std::sync::Arc;

/// Mock backend for testing.
///
/// Scripted responses are returned in FIFO order and every call is recorded
/// for later assertions.
///
/// # Example
/// ```ignore
/// let backend = MockBackend::new();
/// backend.push_batch_response(Ok(vec![GenerationOutput::png(vec![1])]));
///
/// // ... drive the aggregator ...
///
/// assert_eq!(backend.batch_calls().len(), 1);
/// ```
#[derive(Clone, Default)]
pub struct MockBackend {
    single_responses: Arc<Mutex<Vec<Result<GenerationOutput>>>>,
    batch_responses: Arc<Mutex<Vec<Result<Vec<GenerationOutput>>>>>,
    single_calls: Arc<Mutex<Vec<GenerationPayload>>>,
    batch_calls: Arc<Mutex<Vec<Vec<GenerationPayload>>>>,
}

impl MockBackend {
    /// Create a new mock backend with no scripted responses.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for the next unanswered `generate_single` call.
    pub fn push_single_response(&self, response: Result<GenerationOutput>) {
        self.single_responses.lock().push(response);
    }

    /// Queue a response for the next unanswered `generate_batch` call.
    pub fn push_batch_response(&self, response: Result<Vec<GenerationOutput>>) {
        self.batch_responses.lock().push(response);
    }

    /// Get all payloads passed to `generate_single`, in call order.
    pub fn single_calls(&self) -> Vec<GenerationPayload> {
        self.single_calls.lock().clone()
    }

    /// Get all payload groups passed to `generate_batch`, in call order.
    pub fn batch_calls(&self) -> Vec<Vec<GenerationPayload>> {
        self.batch_calls.lock().clone()
    }

    /// Number of `generate_batch` calls made.
    pub fn batch_call_count(&self) -> usize {
        self.batch_calls.lock().len()
    }
}

#[async_trait]
impl GenerationBackend for MockBackend {
    async fn generate_single(&self, payload: &GenerationPayload) -> Result<GenerationOutput> {
        self.single_calls.lock().push(payload.clone());

        let mut responses = self.single_responses.lock();
        if responses.is_empty() {
            return Err(VolleyError::Backend(
                "no mock response configured for generate_single".to_string(),
            ));
        }
        responses.remove(0)
    }

    async fn generate_batch(
        &self,
        payloads: &[GenerationPayload],
    ) -> Result<Vec<GenerationOutput>> {
        self.batch_calls.lock().push(payloads.to_vec());

        let mut responses = self.batch_responses.lock();
        if responses.is_empty() {
            return Err(VolleyError::Backend(format!(
                "no mock response configured for batch of {}",
                payloads.len()
            )));
        }
        responses.remove(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_single_fifo_order() {
        let backend = MockBackend::new();
        backend.push_single_response(Ok(GenerationOutput::png(vec![1])));
        backend.push_single_response(Ok(GenerationOutput::png(vec![2])));

        let payload = GenerationPayload::new("u1", "first");
        let first = backend.generate_single(&payload).await.unwrap();
        let second = backend.generate_single(&payload).await.unwrap();

        assert_eq!(first.image, vec![1]);
        assert_eq!(second.image, vec![2]);
        assert_eq!(backend.single_calls().len(), 2);
    }

    #[tokio::test]
    async fn test_mock_batch_records_payloads() {
        let backend = MockBackend::new();
        backend.push_batch_response(Ok(vec![
            GenerationOutput::png(vec![1]),
            GenerationOutput::png(vec![2]),
        ]));

        let payloads = vec![
            GenerationPayload::new("u1", "a"),
            GenerationPayload::new("u2", "b"),
        ];
        let outputs = backend.generate_batch(&payloads).await.unwrap();

        assert_eq!(outputs.len(), 2);
        assert_eq!(backend.batch_calls(), vec![payloads]);
    }

    #[tokio::test]
    async fn test_mock_unscripted_call_errors() {
        let backend = MockBackend::new();
        let payload = GenerationPayload::new("u1", "oops");

        let result = backend.generate_single(&payload).await;
        assert!(matches!(result, Err(VolleyError::Backend(_))));

        let result = backend.generate_batch(&[payload]).await;
        assert!(matches!(result, Err(VolleyError::Backend(_))));
    }
}
