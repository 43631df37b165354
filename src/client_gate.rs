use std::sync::Arc;

use rdkafka::consumer::BaseConsumer;

use crate::rebalance::RunloopContext;

/// Serializes access to the underlying broker client, which is not safe
/// for concurrent use (spec.md §4.1). `tokio::sync::Mutex` queues waiters
/// in acquisition (FIFO) order, giving the "calls are FIFO" contract for
/// free. Because every `librdkafka` call made through here is itself a
/// blocking call, the guarded body always runs on a blocking-pool thread
/// via `spawn_blocking` rather than tying up the async runtime.
pub struct ClientGate {
    client: Arc<BaseConsumer<RunloopContext>>,
    gate: tokio::sync::Mutex<()>,
}

impl ClientGate {
    pub fn new(client: BaseConsumer<RunloopContext>) -> Self {
        Self {
            client: Arc::new(client),
            gate: tokio::sync::Mutex::new(()),
        }
    }

    /// A handle to the client for use from *within* a section already
    /// holding the gate (e.g. the rebalance callback, which runs
    /// synchronously inside `poll` and must not re-acquire the gate).
    pub fn client_unguarded(&self) -> &BaseConsumer<RunloopContext> {
        &self.client
    }

    /// Run `f` with exclusive access to the client. At most one `run` body
    /// executes at a time; a panicking or failing `f` still releases the
    /// gate (the `MutexGuard` is dropped unconditionally when this future
    /// completes or is cancelled).
    pub async fn run<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&BaseConsumer<RunloopContext>) -> T + Send + 'static,
        T: Send + 'static,
    {
        let _permit = self.gate.lock().await;
        let client = self.client.clone();
        match tokio::task::spawn_blocking(move || f(&client)).await {
            Ok(value) => value,
            Err(join_err) => std::panic::resume_unwind(join_err.into_panic()),
        }
    }
}
