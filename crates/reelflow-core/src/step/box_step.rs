//! BoxStep -- object-safe dynamic dispatch wrapper for Step.
//!
//! 1. Define an object-safe `StepDyn` trait with boxed futures
//! 2. Blanket-impl `StepDyn` for all `T: Step`
//! 3. `BoxStep` wraps `Box<dyn StepDyn>` and delegates

use std::future::Future;
use std::pin::Pin;

use reelflow_types::ValueMap;
use reelflow_types::error::StepError;

use super::{Step, StepContext};

/// Object-safe version of [`Step`] with boxed futures.
pub trait StepDyn: Send + Sync {
    fn idempotent(&self) -> bool;

    fn execute_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
        params: ValueMap,
    ) -> Pin<Box<dyn Future<Output = Result<ValueMap, StepError>> + Send + 'a>>;
}

impl<T: Step> StepDyn for T {
    fn idempotent(&self) -> bool {
        Step::idempotent(self)
    }

    fn execute_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
        params: ValueMap,
    ) -> Pin<Box<dyn Future<Output = Result<ValueMap, StepError>> + Send + 'a>> {
        Box::pin(self.execute(ctx, params))
    }
}

/// Type-erased step for the runtime registry.
///
/// Since `Step` uses RPITIT it cannot be a trait object directly; `BoxStep`
/// provides the same methods and delegates to the inner `StepDyn`.
pub struct BoxStep {
    inner: Box<dyn StepDyn + Send + Sync>,
}

impl BoxStep {
    /// Wrap a concrete `Step` in a type-erased box.
    pub fn new<T: Step + 'static>(step: T) -> Self {
        Self {
            inner: Box::new(step),
        }
    }

    pub fn idempotent(&self) -> bool {
        self.inner.idempotent()
    }

    pub async fn execute(&self, ctx: &StepContext, params: ValueMap) -> Result<ValueMap, StepError> {
        self.inner.execute_boxed(ctx, params).await
    }
}

impl std::fmt::Debug for BoxStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxStep")
            .field("idempotent", &self.idempotent())
            .finish()
    }
}
