//! Inference task lifecycle.
//!
//! Every proxied inference request becomes a task: created `in-progress`,
//! then finalized once as `succeed` (with an earnings record) or `failed`.
//! Finalization is sticky; later updates are ignored by the store.

mod ndjson;
mod rewards;

pub use ndjson::LineBuffer;
pub use rewards::{FixedBlockReward, RandomBlockReward, RewardPolicy};

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use miner_common::{EarningsRecord, TaskMetrics, TaskRecord, TaskStatus};

use crate::engine::{ByteStream, EngineEndpoint, InferenceEngine};
use crate::error::{Error, Result};
use crate::store::{FinalizeOutcome, Store};

/// NDJSON lines forwarded to the client, one `Bytes` per line.
pub type TaskStream = ReceiverStream<Result<Bytes>>;

const STREAM_BUFFER: usize = 32;

/// Tracks inference jobs through the engine and credits earnings.
pub struct TaskLifecycleTracker {
    store: Arc<dyn Store>,
    engine: Arc<dyn InferenceEngine>,
    rewards: Arc<dyn RewardPolicy>,
    // Held from the status check through the store write.
    finalize: Mutex<()>,
}

impl TaskLifecycleTracker {
    pub fn new(
        store: Arc<dyn Store>,
        engine: Arc<dyn InferenceEngine>,
        rewards: Arc<dyn RewardPolicy>,
    ) -> Self {
        Self {
            store,
            engine,
            rewards,
            finalize: Mutex::new(()),
        }
    }

    pub fn create_task(&self, model: &str) -> Result<TaskRecord> {
        let task = TaskRecord::new(model);
        self.store.create_task(&task)?;
        tracing::debug!("Created task {} for model {}", task.id, task.model);
        Ok(task)
    }

    /// Move a task to a terminal status. A successful task is credited
    /// `job_rewards = prompt_eval_count + eval_count` plus a block reward.
    /// Updates to an already terminal task change nothing.
    pub fn update_task(
        &self,
        task_id: &str,
        metrics: &TaskMetrics,
        status: TaskStatus,
    ) -> Result<FinalizeOutcome> {
        if !status.is_terminal() {
            return Err(Error::InvalidRequest(format!(
                "Task status must be terminal, got {}",
                status.as_str()
            )));
        }

        let _finalizing = self
            .finalize
            .lock()
            .map_err(|_| Error::Internal("task finalize lock poisoned".to_string()))?;
        let task = self
            .store
            .get_task(task_id)?
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;
        if task.status.is_terminal() {
            tracing::debug!("Task {} already {}, ignoring update", task_id, task.status.as_str());
            return Ok(FinalizeOutcome::AlreadyTerminal(task));
        }

        let earnings = (status == TaskStatus::Succeed)
            .then(|| EarningsRecord::new(task_id, self.rewards.block_reward(), metrics.job_tokens()));

        let outcome = self
            .store
            .finalize_task(task_id, status, metrics, earnings.as_ref())?;
        if outcome.is_finalized() {
            match &earnings {
                Some(e) => tracing::info!(
                    "Task {} succeeded (block rewards {}, job rewards {})",
                    task_id,
                    e.block_rewards,
                    e.job_rewards
                ),
                None => tracing::warn!("Task {} failed", task_id),
            }
        }
        Ok(outcome)
    }

    fn fail_task(&self, task_id: &str) {
        if let Err(e) = self.update_task(task_id, &TaskMetrics::default(), TaskStatus::Failed) {
            tracing::error!("Failed to mark task {} failed: {}", task_id, e);
        }
    }

    /// Forward a non-streaming request and finalize its task from the answer.
    pub async fn run_unary(&self, endpoint: EngineEndpoint, body: &Value) -> Result<Value> {
        let task = self.create_task(&crate::engine::requested_model(body))?;

        match self.engine.forward(endpoint, body).await {
            Ok(response) => {
                let metrics = TaskMetrics::from_response(&response);
                self.update_task(&task.id, &metrics, TaskStatus::Succeed)?;
                Ok(response)
            }
            Err(e) => {
                tracing::error!("Inference for task {} failed: {}", task.id, e);
                self.fail_task(&task.id);
                Err(e)
            }
        }
    }

    /// Forward a streaming request. The returned stream carries every
    /// well-formed NDJSON line of the engine's answer; the task is finalized
    /// by the first line with `done: true`.
    pub async fn run_stream(self: &Arc<Self>, endpoint: EngineEndpoint, body: &Value) -> Result<TaskStream> {
        let task = self.create_task(&crate::engine::requested_model(body))?;

        match self.engine.forward_stream(endpoint, body).await {
            Ok(upstream) => Ok(self.clone().relay(task.id, upstream)),
            Err(e) => {
                tracing::error!("Inference for task {} failed: {}", task.id, e);
                self.fail_task(&task.id);
                Err(e)
            }
        }
    }

    /// Spawn the relay from the engine stream to the client stream.
    ///
    /// The engine stream is drained to the end even if the client goes away,
    /// so the task is still finalized.
    pub fn relay(self: Arc<Self>, task_id: String, mut upstream: ByteStream) -> TaskStream {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);

        tokio::spawn(async move {
            let mut lines = LineBuffer::new();
            let mut finalized = false;
            let mut client_open = true;

            while let Some(chunk) = upstream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        if finalized {
                            tracing::warn!("Stream error after task {} completed: {}", task_id, e);
                        } else {
                            tracing::error!("Stream for task {} failed: {}", task_id, e);
                            self.fail_task(&task_id);
                            if client_open {
                                let _ = tx.send(Err(e)).await;
                            }
                        }
                        return;
                    }
                };

                for line in lines.push(&chunk) {
                    let Some(part) = parse_line(&task_id, &line) else {
                        continue;
                    };
                    if !finalized && is_done(&part) {
                        self.complete(&task_id, &part);
                        finalized = true;
                    }
                    if client_open && !forward_line(&tx, line).await {
                        tracing::debug!("Client left task {}, draining engine stream", task_id);
                        client_open = false;
                    }
                }
            }

            if let Some(line) = lines.finish() {
                if let Some(part) = parse_line(&task_id, &line) {
                    if !finalized && is_done(&part) {
                        self.complete(&task_id, &part);
                        finalized = true;
                    }
                    if client_open {
                        forward_line(&tx, line).await;
                    }
                }
            }

            if !finalized {
                tracing::warn!("Stream for task {} ended without completion", task_id);
                self.fail_task(&task_id);
            }
        });

        ReceiverStream::new(rx)
    }

    fn complete(&self, task_id: &str, part: &Value) {
        let metrics = TaskMetrics::from_response(part);
        if let Err(e) = self.update_task(task_id, &metrics, TaskStatus::Succeed) {
            tracing::error!("Failed to finalize task {}: {}", task_id, e);
        }
    }
}

/// Parse one NDJSON line. Only JSON objects are well-formed answer parts.
fn parse_line(task_id: &str, line: &[u8]) -> Option<Value> {
    match serde_json::from_slice::<Value>(line) {
        Ok(part) if part.is_object() => Some(part),
        Ok(_) => {
            tracing::warn!("Skipping non-object line in task {}", task_id);
            None
        }
        Err(e) => {
            tracing::warn!("Skipping malformed line in task {}: {}", task_id, e);
            None
        }
    }
}

fn is_done(part: &Value) -> bool {
    part.get("done").and_then(Value::as_bool) == Some(true)
}

/// Send a line with its newline. Returns false once the client is gone.
async fn forward_line(tx: &mpsc::Sender<Result<Bytes>>, mut line: Vec<u8>) -> bool {
    line.push(b'\n');
    tx.send(Ok(Bytes::from(line))).await.is_ok()
}
