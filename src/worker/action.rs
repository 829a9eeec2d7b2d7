//! # Actions
//!
//! Worker-side units of execution. Every action is registered under an
//! explicit id and invoked with the JSON payload of its step run. Typed
//! handlers go through [`TypedAction`], which decodes the payload into the
//! handler's input type and encodes its output; there is no runtime type
//! inspection.

use super::cancellation::CancellationToken;
use crate::error::{SchedulerError, SchedulerResult};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use uuid::Uuid;

/// What an action knows about the step run it executes.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub step_run_id: Uuid,
    pub action_id: String,
    pub worker_id: Uuid,
    cancellation: CancellationToken,
}

impl ActionContext {
    pub fn new(
        step_run_id: Uuid,
        action_id: impl Into<String>,
        worker_id: Uuid,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            step_run_id,
            action_id: action_id.into(),
            worker_id,
            cancellation,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once the step run is cancelled.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }
}

#[async_trait]
pub trait Action: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn invoke(&self, ctx: ActionContext, payload: Value) -> SchedulerResult<Value>;
}

/// Adapter from a typed async handler to [`Action`].
pub struct TypedAction<I, O, F> {
    name: String,
    handler: F,
    _types: PhantomData<fn(I) -> O>,
}

impl<I, O, F> fmt::Debug for TypedAction<I, O, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedAction").field("name", &self.name).finish()
    }
}

impl<I, O, F, Fut, E> TypedAction<I, O, F>
where
    F: Fn(ActionContext, I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, E>> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    pub fn new(name: impl Into<String>, handler: F) -> Self {
        Self {
            name: name.into(),
            handler,
            _types: PhantomData,
        }
    }
}

#[async_trait]
impl<I, O, F, Fut, E> Action for TypedAction<I, O, F>
where
    I: DeserializeOwned + Send + 'static,
    O: Serialize + Send + 'static,
    F: Fn(ActionContext, I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, E>> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, ctx: ActionContext, payload: Value) -> SchedulerResult<Value> {
        let input: I = serde_json::from_value(payload).map_err(|e| {
            SchedulerError::Validation(format!("could not decode payload for {}: {e}", self.name))
        })?;

        let output = (self.handler)(ctx, input)
            .await
            .map_err(|e| SchedulerError::Worker(e.to_string()))?;

        serde_json::to_value(output).map_err(|e| {
            SchedulerError::Validation(format!("could not encode output of {}: {e}", self.name))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::CancellationRegistry;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct Resize {
        width: u32,
        height: u32,
    }

    #[derive(Serialize)]
    struct Area {
        area: u32,
    }

    fn context() -> ActionContext {
        let registry = CancellationRegistry::new();
        let step_run_id = Uuid::new_v4();
        ActionContext::new(step_run_id, "image:resize", Uuid::new_v4(), registry.insert(step_run_id))
    }

    #[tokio::test]
    async fn test_typed_action_round_trip() {
        let action = TypedAction::new("image:resize", |_ctx, input: Resize| async move {
            Ok::<_, String>(Area {
                area: input.width * input.height,
            })
        });

        let output = action
            .invoke(context(), json!({"width": 3, "height": 4}))
            .await
            .unwrap();
        assert_eq!(output, json!({"area": 12}));
    }

    #[tokio::test]
    async fn test_typed_action_rejects_bad_payload() {
        let action = TypedAction::new("image:resize", |_ctx, input: Resize| async move {
            Ok::<_, String>(input.width)
        });

        let err = action.invoke(context(), json!({"width": "wide"})).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Validation(_)));
    }

    #[tokio::test]
    async fn test_typed_action_surfaces_handler_error() {
        let action = TypedAction::new("image:resize", |_ctx, _input: Resize| async move {
            Err::<u32, _>("disk full")
        });

        let err = action
            .invoke(context(), json!({"width": 1, "height": 1}))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Worker error: disk full");
    }
}
