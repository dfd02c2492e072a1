//! Named-signal publish/subscribe registry.
//!
//! A `Signals` instance is shared by reference between the gateway session
//! (which publishes decoded events and consumes control signals) and
//! application code (which registers event handlers). Handlers for one name
//! run in insertion order; wildcard handlers additionally receive the signal
//! name. The tables are lock-guarded so the registry is safe to share across
//! tasks, but handlers must not register or clear subscriptions from inside
//! a handler invocation.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use serde_json::Value;

use crate::control::ControlSignal;

type Handler = Box<dyn Fn(&Value) + Send + Sync>;
type AnyHandler = Box<dyn Fn(&str, &Value) + Send + Sync>;
type ControlHandler = Box<dyn Fn(&ControlSignal) + Send + Sync>;

// ----------------------------------------------------------------------------
// Signals
// ----------------------------------------------------------------------------

/// Named-signal broadcaster with a wildcard subscription class and a typed
/// control lane.
#[derive(Default)]
pub struct Signals {
    /// Ordered handlers per signal name.
    named: RwLock<HashMap<String, Vec<Handler>>>,
    /// Handlers receiving every signal plus its name.
    any: RwLock<Vec<AnyHandler>>,
    /// Handlers for the typed control lane; re-registered per connection
    /// generation, never visible to wildcard subscribers.
    control: RwLock<Vec<ControlHandler>>,
}

impl Signals {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit a signal to its named handlers, then to the wildcard handlers.
    pub fn emit(&self, name: &str, payload: &Value) {
        let named = self.named.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(handlers) = named.get(name) {
            for handler in handlers {
                handler(payload);
            }
        }
        drop(named);

        let any = self.any.read().unwrap_or_else(PoisonError::into_inner);
        for handler in any.iter() {
            handler(name, payload);
        }
    }

    /// Connect a handler to a named signal.
    pub fn connect<F>(&self, name: &str, handler: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.named
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_default()
            .push(Box::new(handler));
    }

    /// Connect a handler to every signal; it receives the signal name
    /// alongside the payload.
    pub fn connect_any<F>(&self, handler: F)
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        self.any
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(handler));
    }

    /// Disconnect all handlers from a named signal.
    pub fn clear(&self, name: &str) {
        self.named
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }

    /// Disconnect all wildcard handlers.
    pub fn clear_any(&self) {
        self.any
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Emit a control signal on the typed lane.
    pub fn emit_control(&self, signal: &ControlSignal) {
        let control = self.control.read().unwrap_or_else(PoisonError::into_inner);
        for handler in control.iter() {
            handler(signal);
        }
    }

    /// Connect a handler to the control lane.
    pub fn connect_control<F>(&self, handler: F)
    where
        F: Fn(&ControlSignal) + Send + Sync + 'static,
    {
        self.control
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(handler));
    }

    /// Disconnect all control handlers.
    pub fn clear_control(&self) {
        self.control
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
