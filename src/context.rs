//! Context-scoped span attributes.
//!
//! Extra attributes ride along in the OpenTelemetry [`Context`] of the
//! current logical call, so every span started inside the scope picks them
//! up without the values being threaded through function arguments. The
//! context is immutable: entering a scope pushes a copy with the merged
//! mapping, and leaving it (normally, by error, or by dropping the future)
//! restores the enclosing one.
//!
//! Async scopes attach the context on every poll, so the mapping follows
//! the task across suspension points and worker threads.

use opentelemetry::context::FutureExt as _;
use opentelemetry::{Context, Key, KeyValue, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Attribute mapping. Keys are unique; later writes overwrite.
pub type Attributes = HashMap<Key, Value>;

/// Ambient attribute that replaces the default span name when present.
pub const SPAN_NAME_OVERRIDE: &str = "langspan.span.name";

/// Context entry holding the active extra-attributes mapping.
#[derive(Debug, Clone)]
struct AmbientAttributes(Arc<Attributes>);

/// Build an [`Attributes`] map from key-values. Later duplicates win.
pub fn attributes<I>(pairs: I) -> Attributes
where
    I: IntoIterator<Item = KeyValue>,
{
    pairs.into_iter().map(|kv| (kv.key, kv.value)).collect()
}

/// Snapshot of the attributes active in the current context.
pub fn current_attributes() -> Attributes {
    attributes_in(&Context::current())
}

/// Snapshot of the attributes carried by `cx`.
pub fn attributes_in(cx: &Context) -> Attributes {
    cx.get::<AmbientAttributes>()
        .map(|ambient| ambient.0.as_ref().clone())
        .unwrap_or_default()
}

/// Derive a context from `cx` whose ambient mapping is the enclosing one
/// overridden by `extra`.
pub fn context_with_attributes(cx: &Context, extra: Attributes) -> Context {
    let mut merged = attributes_in(cx);
    merged.extend(extra);
    cx.with_value(AmbientAttributes(Arc::new(merged)))
}

/// Run `future` with `extra` merged into the ambient attributes.
///
/// Spans started anywhere inside `future` (including nested instrumented
/// calls) receive the merged mapping. Sibling futures are unaffected.
pub fn with_attributes<F>(extra: Attributes, future: F) -> impl Future<Output = F::Output>
where
    F: Future,
{
    let cx = context_with_attributes(&Context::current(), extra);
    future.with_context(cx)
}

/// Synchronous counterpart of [`with_attributes`].
pub fn with_attributes_sync<R>(extra: Attributes, f: impl FnOnce() -> R) -> R {
    let _guard = context_with_attributes(&Context::current(), extra).attach();
    f()
}

/// Span name requested through [`SPAN_NAME_OVERRIDE`], if any.
pub fn span_name_override(attrs: &Attributes) -> Option<String> {
    match attrs.get(&Key::from_static_str(SPAN_NAME_OVERRIDE)) {
        Some(Value::String(name)) if !name.as_str().is_empty() => Some(name.as_str().to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_scopes_override_and_restore() {
        let outer = attributes([KeyValue::new("user", "a"), KeyValue::new("team", "x")]);
        let inner = attributes([KeyValue::new("user", "b")]);

        with_attributes_sync(outer, || {
            with_attributes_sync(inner, || {
                let seen = current_attributes();
                assert_eq!(seen.get(&Key::new("user")), Some(&Value::from("b")));
                assert_eq!(seen.get(&Key::new("team")), Some(&Value::from("x")));
            });
            let seen = current_attributes();
            assert_eq!(seen.get(&Key::new("user")), Some(&Value::from("a")));
        });

        assert!(current_attributes().is_empty());
    }

    #[test]
    fn scope_is_restored_after_panic() {
        let result = std::panic::catch_unwind(|| {
            with_attributes_sync(attributes([KeyValue::new("k", "v")]), || -> u32 { panic!("boom") })
        });
        assert!(result.is_err());
        assert!(current_attributes().is_empty());
    }

    #[test]
    fn span_name_override_ignores_empty_names() {
        let attrs = attributes([KeyValue::new(SPAN_NAME_OVERRIDE, "")]);
        assert_eq!(span_name_override(&attrs), None);

        let attrs = attributes([KeyValue::new(SPAN_NAME_OVERRIDE, "custom")]);
        assert_eq!(span_name_override(&attrs).as_deref(), Some("custom"));
    }
}
