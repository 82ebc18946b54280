//! Stage handlers: the typed [`Step`] trait and its erased [`StageHandler`] form.
//!
//! Pipelines store handlers as `Arc<dyn StageHandler>` so stages with
//! different input and output types can live in one graph. Authors implement
//! [`Step`] with concrete serde types and wrap it with [`handler`]; the
//! adapter converts to and from `serde_json::Value` at the boundary, which is
//! also what the audit log records.

use crate::error::StepError;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

/// Correlation data and upstream results handed to every stage attempt.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub run_id: String,
    pub pipeline: String,
    pub stage: String,
    /// 1-based attempt number.
    pub attempt: u32,
    input: Arc<Value>,
    parents: Arc<HashMap<String, Value>>,
}

impl StepContext {
    pub(crate) fn new(
        run_id: impl Into<String>,
        pipeline: impl Into<String>,
        stage: impl Into<String>,
        attempt: u32,
        input: Arc<Value>,
        parents: Arc<HashMap<String, Value>>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            pipeline: pipeline.into(),
            stage: stage.into(),
            attempt,
            input,
            parents,
        }
    }

    /// The trigger payload the run was started with.
    pub fn trigger_input(&self) -> &Value {
        &self.input
    }

    /// Raw output of a direct parent, if `name` is one.
    pub fn parent_output_value(&self, name: &str) -> Option<&Value> {
        self.parents.get(name)
    }

    /// Typed output of a direct parent.
    ///
    /// # Errors
    /// [`StepError::InvalidInput`] when `name` is not a parent of this stage
    /// or its output does not deserialize into `T`.
    pub fn parent_output<T: DeserializeOwned>(&self, name: &str) -> Result<T, StepError> {
        let value = self.parents.get(name).ok_or_else(|| {
            StepError::InvalidInput(format!(
                "stage '{}' has no parent output named '{}'",
                self.stage, name
            ))
        })?;
        serde_json::from_value(value.clone()).map_err(|e| {
            StepError::InvalidInput(format!("output of parent '{}': {}", name, e))
        })
    }
}

/// A unit of work with statically typed input and output.
///
/// Every stage receives the run's trigger input as `Input`; outputs of
/// parent stages are read through [`StepContext::parent_output`].
#[async_trait]
pub trait Step: Send + Sync + 'static {
    type Input: DeserializeOwned + Send + 'static;
    type Output: Serialize + Send + 'static;

    async fn run(&self, ctx: StepContext, input: Self::Input) -> Result<Self::Output, StepError>;
}

/// Object-safe stage handler over JSON values.
#[async_trait]
pub trait StageHandler: Send + Sync {
    async fn invoke(&self, ctx: StepContext, input: Value) -> Result<Value, StepError>;

    /// Name of the input type, reported at registration.
    fn input_type(&self) -> &'static str;

    /// Name of the output type, reported at registration.
    fn output_type(&self) -> &'static str;
}

struct TypedHandler<S>(S);

#[async_trait]
impl<S: Step> StageHandler for TypedHandler<S> {
    async fn invoke(&self, ctx: StepContext, input: Value) -> Result<Value, StepError> {
        let typed: S::Input =
            serde_json::from_value(input).map_err(|e| StepError::InvalidInput(e.to_string()))?;
        let output = self.0.run(ctx, typed).await?;
        serde_json::to_value(output)
            .map_err(|e| StepError::Failed(format!("stage output is not serializable: {}", e)))
    }

    fn input_type(&self) -> &'static str {
        std::any::type_name::<S::Input>()
    }

    fn output_type(&self) -> &'static str {
        std::any::type_name::<S::Output>()
    }
}

/// Erase a [`Step`] into a shareable [`StageHandler`].
pub fn handler<S: Step>(step: S) -> Arc<dyn StageHandler> {
    Arc::new(TypedHandler(step))
}

/// [`Step`] backed by an async closure.
pub struct FnStep<F, I, O> {
    f: F,
    _types: PhantomData<fn(I) -> O>,
}

#[async_trait]
impl<F, Fut, I, O> Step for FnStep<F, I, O>
where
    F: Fn(StepContext, I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, StepError>> + Send + 'static,
    I: DeserializeOwned + Send + 'static,
    O: Serialize + Send + 'static,
{
    type Input = I;
    type Output = O;

    async fn run(&self, ctx: StepContext, input: I) -> Result<O, StepError> {
        (self.f)(ctx, input).await
    }
}

/// Build a handler from an async closure.
///
/// ```rust
/// use edgequake_docflow::pipeline::{step_fn, StageHandler};
/// use serde_json::Value;
///
/// let echo = step_fn(|_ctx, input: Value| async move { Ok::<_, edgequake_docflow::StepError>(input) });
/// assert!(echo.input_type().ends_with("Value"));
/// ```
pub fn step_fn<F, Fut, I, O>(f: F) -> Arc<dyn StageHandler>
where
    F: Fn(StepContext, I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, StepError>> + Send + 'static,
    I: DeserializeOwned + Send + 'static,
    O: Serialize + Send + 'static,
{
    handler(FnStep {
        f,
        _types: PhantomData,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct Order {
        id: String,
        quantity: u32,
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Priced {
        id: String,
        total: u32,
    }

    struct PriceStep;

    #[async_trait]
    impl Step for PriceStep {
        type Input = Order;
        type Output = Priced;

        async fn run(&self, _ctx: StepContext, input: Order) -> Result<Priced, StepError> {
            Ok(Priced {
                id: input.id,
                total: input.quantity * 3,
            })
        }
    }

    fn ctx_with_parents(parents: HashMap<String, Value>) -> StepContext {
        StepContext::new(
            "run-1",
            "orders",
            "price",
            1,
            Arc::new(json!({})),
            Arc::new(parents),
        )
    }

    #[tokio::test]
    async fn typed_handler_round_trips_json() {
        let h = handler(PriceStep);
        let out = h
            .invoke(ctx_with_parents(HashMap::new()), json!({"id": "o-1", "quantity": 4}))
            .await
            .unwrap();
        assert_eq!(out, json!({"id": "o-1", "total": 12}));
    }

    #[tokio::test]
    async fn mistyped_input_is_invalid_input() {
        let h = handler(PriceStep);
        let err = h
            .invoke(ctx_with_parents(HashMap::new()), json!({"id": 7}))
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::InvalidInput(_)));
    }

    #[test]
    fn handler_reports_type_names() {
        let h = handler(PriceStep);
        assert!(h.input_type().ends_with("Order"));
        assert!(h.output_type().ends_with("Priced"));
    }

    #[test]
    fn parent_output_is_typed() {
        let mut parents = HashMap::new();
        parents.insert("quote".to_string(), json!({"id": "o-2", "total": 9}));
        let ctx = ctx_with_parents(parents);

        let priced: Priced = ctx.parent_output("quote").unwrap();
        assert_eq!(priced.total, 9);
        assert!(ctx.parent_output::<Priced>("missing").is_err());
        assert!(ctx.parent_output::<Vec<u8>>("quote").is_err());
    }

    #[tokio::test]
    async fn closure_steps_work() {
        let h = step_fn(|ctx: StepContext, input: Value| async move {
            Ok::<_, StepError>(json!({"stage": ctx.stage, "echo": input}))
        });
        let out = h
            .invoke(ctx_with_parents(HashMap::new()), json!(1))
            .await
            .unwrap();
        assert_eq!(out["stage"], "price");
        assert_eq!(out["echo"], 1);
    }
}
