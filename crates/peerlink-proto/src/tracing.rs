//! W3C trace context carried on [`Open`](crate::Open).
//!
//! The dialing side injects the span of its connection attempt so the
//! accepting side's stream handler shows up in the same trace, even though
//! the two clusters report to different collectors.
//!
//! Format of `traceparent`: `00-{trace_id}-{span_id}-{trace_flags}`

use opentelemetry::propagation::{Extractor, Injector};
use opentelemetry::{global, Context};
use serde::{Deserialize, Serialize};

/// Propagated trace headers
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    /// `traceparent` header value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceparent: Option<String>,
    /// `tracestate` header value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracestate: Option<String>,
}

impl TraceContext {
    /// Whether no header is present
    pub fn is_empty(&self) -> bool {
        self.traceparent.is_none() && self.tracestate.is_none()
    }

    /// Capture the current context using the global propagator
    pub fn current() -> Self {
        let mut carrier = Self::default();
        let cx = Context::current();
        global::get_text_map_propagator(|propagator| {
            propagator.inject_context(&cx, &mut carrier);
        });
        carrier
    }

    /// Rebuild an OpenTelemetry context to parent the receiving span
    pub fn extract(&self) -> Context {
        global::get_text_map_propagator(|propagator| propagator.extract(self))
    }

    /// Trace ID if a `traceparent` is present
    pub fn trace_id(&self) -> Option<&str> {
        self.traceparent.as_deref()?.split('-').nth(1)
    }
}

impl Injector for TraceContext {
    fn set(&mut self, key: &str, value: String) {
        match key.to_ascii_lowercase().as_str() {
            "traceparent" => self.traceparent = Some(value),
            "tracestate" => self.tracestate = Some(value),
            _ => {}
        }
    }
}

impl Extractor for TraceContext {
    fn get(&self, key: &str) -> Option<&str> {
        match key.to_ascii_lowercase().as_str() {
            "traceparent" => self.traceparent.as_deref(),
            "tracestate" => self.tracestate.as_deref(),
            _ => None,
        }
    }

    fn keys(&self) -> Vec<&str> {
        let mut keys = Vec::new();
        if self.traceparent.is_some() {
            keys.push("traceparent");
        }
        if self.tracestate.is_some() {
            keys.push("tracestate");
        }
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_without_provider_is_harmless() {
        let carrier = TraceContext::current();
        let _cx = carrier.extract();
    }

    #[test]
    fn test_trace_id_is_second_component() {
        let carrier = TraceContext {
            traceparent: Some("00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01".into()),
            tracestate: None,
        };
        assert_eq!(carrier.trace_id(), Some("0af7651916cd43dd8448eb211c80319c"));
        assert!(!carrier.is_empty());
    }

    #[test]
    fn test_keys_follow_present_headers() {
        let mut carrier = TraceContext::default();
        assert!(carrier.keys().is_empty());
        carrier.set("TraceParent", "x".to_string());
        assert_eq!(carrier.keys(), vec!["traceparent"]);
        carrier.set("tracestate", "y".to_string());
        assert_eq!(carrier.keys(), vec!["traceparent", "tracestate"]);
        assert_eq!(carrier.get("tracestate"), Some("y"));
    }
}
