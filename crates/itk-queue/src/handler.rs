//! Task handler contract and in-memory registry.
//!
//! A handler is an async function from a JSON payload map to a JSON result
//! map. Handlers must be `Send + Sync` trait objects so the worker task can
//! invoke them outside any storage critical section; a blanket impl lets
//! plain async closures register directly.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

/// JSON object payload handed to a handler.
pub type TaskPayload = Map<String, Value>;
/// JSON object result returned by a handler.
pub type TaskResult = Map<String, Value>;

/// Asynchronous task handler contract.
///
/// Any error is captured as its display string and fed to the retry policy;
/// handlers never crash the worker.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, payload: TaskPayload) -> Result<TaskResult>;
}

#[async_trait]
impl<F, Fut> TaskHandler for F
where
    F: Fn(TaskPayload) -> Fut + Send + Sync,
    Fut: Future<Output = Result<TaskResult>> + Send + 'static,
{
    async fn run(&self, payload: TaskPayload) -> Result<TaskResult> {
        (self)(payload).await
    }
}

/// Handler map keyed by normalized task type. Registration is expected
/// before `start()`; later registrations are permitted but race in-flight
/// claims.
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
}

impl HandlerRegistry {
    pub(crate) fn insert(&self, task_type: String, handler: Arc<dyn TaskHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task_type, handler);
    }

    pub(crate) fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task_type)
            .cloned()
    }
}
