//! Export table for dispatching inbound calls by object path.
//!
//! Handlers are registered per `(path, interface, member)`. A call whose
//! path has no exports at all is an unknown object; a call to a known path
//! that matches no member is an unknown method. Calls without an interface
//! header match on the member name alone.
//!
//! # Example
//!
//! ```ignore
//! use busline::handler::{ExportTable, FnHandler};
//!
//! let table = ExportTable::new();
//! table.export(
//!     ObjectPath::new("/org/example/Echo")?,
//!     "org.example.Echo",
//!     "Echo",
//!     FnHandler::new(|call: MethodCall| async move { Ok(call.into_body()) }),
//! );
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::RwLock;

use super::MethodCall;
use crate::error::MethodError;
use crate::protocol::{ObjectPath, Value};

/// Result type for handler functions: the reply body or an error reply.
pub type HandlerResult = std::result::Result<Vec<Value>, MethodError>;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Trait for exported method implementations.
pub trait CallHandler: Send + Sync + 'static {
    /// Handle one inbound call.
    fn call(&self, call: MethodCall) -> BoxFuture<'static, HandlerResult>;
}

/// Adapter turning an async closure into a [`CallHandler`].
pub struct FnHandler<F, Fut>
where
    F: Fn(MethodCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnHandler<F, Fut>
where
    F: Fn(MethodCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, Fut> CallHandler for FnHandler<F, Fut>
where
    F: Fn(MethodCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, call: MethodCall) -> BoxFuture<'static, HandlerResult> {
        Box::pin((self.handler)(call))
    }
}

/// Outcome of resolving a call against the table.
pub enum Lookup {
    Found(Arc<dyn CallHandler>),
    UnknownObject,
    UnknownMethod,
}

type Members = HashMap<(String, String), Arc<dyn CallHandler>>;

/// Exported objects, keyed by path.
///
/// Shared between the connection facade (which edits it) and handler tasks
/// (which read it), hence the interior lock.
pub struct ExportTable {
    objects: RwLock<HashMap<ObjectPath, Members>>,
}

impl ExportTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
        }
    }

    /// Register `handler` for `interface.member` on `path`.
    ///
    /// Returns `true` if an earlier handler was replaced.
    pub fn export<H: CallHandler>(
        &self,
        path: ObjectPath,
        interface: &str,
        member: &str,
        handler: H,
    ) -> bool {
        self.export_arc(path, interface, member, Arc::new(handler))
    }

    pub(crate) fn export_arc(
        &self,
        path: ObjectPath,
        interface: &str,
        member: &str,
        handler: Arc<dyn CallHandler>,
    ) -> bool {
        tracing::debug!("Exporting {}.{} on {}", interface, member, path);
        self.objects
            .write()
            .entry(path)
            .or_default()
            .insert((interface.to_string(), member.to_string()), handler)
            .is_some()
    }

    /// Remove one method. Returns `false` if it was not exported.
    pub fn unexport(&self, path: &ObjectPath, interface: &str, member: &str) -> bool {
        let mut objects = self.objects.write();
        let Some(members) = objects.get_mut(path) else {
            return false;
        };
        let removed = members
            .remove(&(interface.to_string(), member.to_string()))
            .is_some();
        if members.is_empty() {
            objects.remove(path);
        }
        removed
    }

    /// Remove every method on `path`. Returns `false` if nothing was exported.
    pub fn unexport_object(&self, path: &ObjectPath) -> bool {
        self.objects.write().remove(path).is_some()
    }

    /// Resolve a call target.
    pub fn lookup(&self, path: &ObjectPath, interface: Option<&str>, member: &str) -> Lookup {
        let objects = self.objects.read();
        let Some(members) = objects.get(path) else {
            return Lookup::UnknownObject;
        };
        let found = match interface {
            Some(iface) => members.get(&(iface.to_string(), member.to_string())),
            None => members
                .iter()
                .find(|((_, m), _)| m == member)
                .map(|(_, handler)| handler),
        };
        match found {
            Some(handler) => Lookup::Found(handler.clone()),
            None => Lookup::UnknownMethod,
        }
    }

    /// Whether anything is exported on `path`.
    pub fn is_exported(&self, path: &ObjectPath) -> bool {
        self.objects.read().contains_key(path)
    }
}

impl Default for ExportTable {
    fn default() -> Self {
        Self::new()
    }
}
