//! Interceptor registry over shared method tables.
//!
//! A [`MethodTable`] is the type-level table of a provider client: every
//! instance built over the same `Arc<MethodTable>` dispatches through it, so
//! replacing an entry affects all of them. The [`InterceptorRegistry`]
//! remembers, per table and operation, the original method and the wrapper
//! it installed, which makes re-installing idempotent and uninstalling an
//! exact inverse.

use crate::error::{Error, Result};
use futures::future::BoxFuture;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

/// A shareable async method taking `Req` and resolving to `Out`.
pub type Method<Req, Out> = Arc<dyn Fn(Req) -> BoxFuture<'static, Out> + Send + Sync>;

/// Build a [`Method`] from an async closure.
pub fn method<Req, Out, F, Fut>(f: F) -> Method<Req, Out>
where
    F: Fn(Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Out> + Send + 'static,
{
    Arc::new(move |req| -> BoxFuture<'static, Out> { Box::pin(f(req)) })
}

type Slot = Arc<dyn Any + Send + Sync>;

static NEXT_TABLE_ID: AtomicU64 = AtomicU64::new(1);

/// Named table of type-erased methods, shared by every client instance.
pub struct MethodTable {
    name: String,
    id: u64,
    methods: RwLock<HashMap<String, Slot>>,
}

impl MethodTable {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            id: NEXT_TABLE_ID.fetch_add(1, Ordering::Relaxed),
            methods: RwLock::new(HashMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Define (or redefine) `operation`.
    pub fn define<Req, Out>(&self, operation: &str, method: Method<Req, Out>)
    where
        Req: 'static,
        Out: 'static,
    {
        self.replace(operation, Arc::new(method));
    }

    pub fn contains(&self, operation: &str) -> bool {
        self.read().contains_key(operation)
    }

    /// Look up `operation` with the expected signature.
    ///
    /// # Errors
    /// [`Error::NotFound`] when the operation is not defined and
    /// [`Error::SignatureMismatch`] when it was defined with other types.
    pub fn get<Req, Out>(&self, operation: &str) -> Result<Method<Req, Out>>
    where
        Req: 'static,
        Out: 'static,
    {
        let slot = self
            .slot(operation)
            .ok_or_else(|| Error::NotFound(format!("{}.{operation}", self.name)))?;
        downcast(&slot, operation)
    }

    /// Dispatch `req` through whatever is currently installed for
    /// `operation`.
    ///
    /// The outer `Result` reports lookup failures only; the method's own
    /// output is returned untouched.
    pub async fn call<Req, Out>(&self, operation: &str, req: Req) -> Result<Out>
    where
        Req: 'static,
        Out: 'static,
    {
        let method = self.get::<Req, Out>(operation)?;
        Ok(method(req).await)
    }

    fn slot(&self, operation: &str) -> Option<Slot> {
        self.read().get(operation).cloned()
    }

    fn replace(&self, operation: &str, slot: Slot) {
        self.methods
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(operation.to_string(), slot);
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Slot>> {
        self.methods.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut operations: Vec<String> = self.read().keys().cloned().collect();
        operations.sort();
        f.debug_struct("MethodTable")
            .field("name", &self.name)
            .field("operations", &operations)
            .finish()
    }
}

fn downcast<Req, Out>(slot: &Slot, operation: &str) -> Result<Method<Req, Out>>
where
    Req: 'static,
    Out: 'static,
{
    slot.downcast_ref::<Method<Req, Out>>()
        .cloned()
        .ok_or_else(|| Error::SignatureMismatch {
            operation: operation.to_string(),
        })
}

/// Original and wrapper installed for one operation.
struct Record {
    original: Slot,
    wrapper: Slot,
}

/// Tracks which operations carry an installed wrapper.
///
/// Install and uninstall hold the registry lock for their whole duration,
/// so concurrent calls on the same operation are serialized.
#[derive(Default)]
pub struct InterceptorRegistry {
    records: Mutex<HashMap<(u64, String), Record>>,
}

impl InterceptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace `operation` in `table` with `factory(original)`.
    ///
    /// If the slot still holds a wrapper installed here, the stored original
    /// is restored first, so installing twice leaves a single layer.
    ///
    /// # Errors
    /// [`Error::NotFound`] when the table has no such operation and
    /// [`Error::SignatureMismatch`] when it has different types. Both are
    /// logged as warnings and leave the table untouched.
    pub fn install<Req, Out, F>(&self, table: &MethodTable, operation: &str, factory: F) -> Result<()>
    where
        Req: 'static,
        Out: 'static,
        F: FnOnce(Method<Req, Out>) -> Method<Req, Out>,
    {
        let mut records = self.lock();
        let key = (table.id, operation.to_string());

        let Some(current) = table.slot(operation) else {
            tracing::warn!(table = table.name(), operation, "operation not found, skipping instrumentation");
            return Err(Error::NotFound(format!("{}.{operation}", table.name)));
        };

        let original = match records.get(&key) {
            Some(record) if Arc::ptr_eq(&current, &record.wrapper) => Arc::clone(&record.original),
            _ => current,
        };

        let original_method = downcast::<Req, Out>(&original, operation).inspect_err(|_| {
            tracing::warn!(table = table.name(), operation, "operation signature mismatch, skipping instrumentation");
        })?;

        let wrapper: Slot = Arc::new(factory(original_method));
        table.replace(operation, Arc::clone(&wrapper));
        records.insert(key, Record { original, wrapper });

        tracing::debug!(table = table.name(), operation, "interceptor installed");
        Ok(())
    }

    /// Restore the original method and forget the record.
    ///
    /// Returns `false` without touching the table when nothing was installed,
    /// or when the slot was redefined by someone else since.
    pub fn uninstall(&self, table: &MethodTable, operation: &str) -> bool {
        let mut records = self.lock();
        let Some(record) = records.remove(&(table.id, operation.to_string())) else {
            return false;
        };

        match table.slot(operation) {
            Some(current) if Arc::ptr_eq(&current, &record.wrapper) => {
                table.replace(operation, record.original);
                tracing::debug!(table = table.name(), operation, "interceptor uninstalled");
                true
            }
            _ => {
                tracing::warn!(
                    table = table.name(),
                    operation,
                    "operation was redefined after install, leaving it in place"
                );
                false
            }
        }
    }

    /// Whether `operation` currently dispatches through a wrapper from this
    /// registry.
    pub fn is_installed(&self, table: &MethodTable, operation: &str) -> bool {
        let records = self.lock();
        match (records.get(&(table.id, operation.to_string())), table.slot(operation)) {
            (Some(record), Some(current)) => Arc::ptr_eq(&current, &record.wrapper),
            _ => false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(u64, String), Record>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for InterceptorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptorRegistry")
            .field("installed", &self.lock().len())
            .finish()
    }
}
