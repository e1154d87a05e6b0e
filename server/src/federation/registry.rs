//! Event registry and dispatcher.
//!
//! Maps an event name to a typed handler. The registry is built once at
//! startup, stored in the application state and never mutated afterwards.

use std::collections::HashMap;
use std::future::Future;

use futures_util::future::{ready, BoxFuture};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::envelope::{Envelope, EventPayload};
use crate::error::{FederationError, FederationResult};

/// Authenticated facts about the inbound request a handler runs for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventContext {
    /// Domain that signed the request.
    pub origin: String,
    pub event_id: String,
}

type BoxedHandler<S> =
    Box<dyn Fn(S, EventContext, Value) -> BoxFuture<'static, FederationResult<Value>> + Send + Sync>;

pub struct EventRegistry<S> {
    handlers: HashMap<&'static str, BoxedHandler<S>>,
}

impl<S> Default for EventRegistry<S> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<S> std::fmt::Debug for EventRegistry<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("EventRegistry").field("events", &names).finish()
    }
}

impl<S: Send + 'static> EventRegistry<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `P::NAME`. The payload is decoded and validated
    /// before the handler runs; a later registration replaces an earlier one.
    pub fn register<P, R, F, Fut>(&mut self, handler: F)
    where
        P: EventPayload,
        R: Serialize + Send + 'static,
        F: Fn(S, EventContext, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FederationResult<R>> + Send + 'static,
    {
        let boxed: BoxedHandler<S> = Box::new(
            move |state: S, ctx: EventContext, raw: Value| -> BoxFuture<'static, FederationResult<Value>> {
                let payload = match decode::<P>(raw) {
                    Ok(payload) => payload,
                    Err(e) => return Box::pin(ready(Err(e))),
                };
                let fut = handler(state, ctx, payload);
                Box::pin(async move {
                    let response = fut.await?;
                    serde_json::to_value(response).map_err(|e| {
                        FederationError::Internal(anyhow::anyhow!(
                            "encoding {} response: {}",
                            P::NAME,
                            e
                        ))
                    })
                })
            },
        );
        self.handlers.insert(P::NAME, boxed);
    }

    pub fn contains(&self, event: &str) -> bool {
        self.handlers.contains_key(event)
    }

    /// Route an envelope to its handler.
    pub async fn dispatch(
        &self,
        state: S,
        ctx: EventContext,
        envelope: Envelope,
    ) -> FederationResult<Value> {
        let handler = self
            .handlers
            .get(envelope.event.as_str())
            .ok_or_else(|| FederationError::validation(format!("unknown event {}", envelope.event)))?;

        debug!(
            "Federation: dispatching {} ({}) from {}",
            envelope.event, ctx.event_id, ctx.origin
        );
        handler(state, ctx, envelope.payload).await
    }
}

fn decode<P: EventPayload>(raw: Value) -> FederationResult<P> {
    let payload: P = serde_json::from_value(raw)
        .map_err(|e| FederationError::validation(format!("invalid payload for {}: {}", P::NAME, e)))?;
    payload
        .validate()
        .map_err(|e| FederationError::validation(format!("invalid payload for {}: {}", P::NAME, e)))?;
    Ok(payload)
}
