use crate::context::RequestContext;
use crate::core::{CacheError, EntityKind, EntityRef, GameObject, Result, Tsid};
use crate::tracker::MutationTracker;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub type OperationHandler = Arc<dyn Fn(&mut OperationCall<'_>) -> Result<Value> + Send + Sync>;

/// Wraps a closure as an [`OperationHandler`].
pub fn handler<F>(f: F) -> OperationHandler
where
    F: Fn(&mut OperationCall<'_>) -> Result<Value> + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperationDescriptor {
    pub name: String,
    /// Successful calls mark the target dirty without the handler asking.
    pub mutates_state: bool,
}

impl OperationDescriptor {
    pub fn reader(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mutates_state: false,
        }
    }

    pub fn mutator(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mutates_state: true,
        }
    }
}

#[derive(Clone)]
struct RegisteredOperation {
    descriptor: OperationDescriptor,
    handler: OperationHandler,
}

/// One invocation of a named operation on a live object.
///
/// The object is borrowed mutably for the duration of the call; the handle
/// and the request's tracker are available for explicit dirty/unload marks.
pub struct OperationCall<'a> {
    entity: &'a EntityRef,
    object: &'a mut GameObject,
    args: &'a [Value],
    tracker: &'a MutationTracker,
    context: &'a RequestContext,
}

impl<'a> OperationCall<'a> {
    pub fn tsid(&self) -> &Tsid {
        self.entity.tsid()
    }

    pub fn object(&self) -> &GameObject {
        &*self.object
    }

    pub fn object_mut(&mut self) -> &mut GameObject {
        &mut *self.object
    }

    pub fn args(&self) -> &[Value] {
        self.args
    }

    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    /// Argument `index` as a string, or an operation error naming it.
    pub fn str_arg(&self, index: usize) -> Result<&str> {
        self.arg(index).and_then(Value::as_str).ok_or_else(|| {
            CacheError::operation(format!("argument {} must be a string", index))
        })
    }

    pub fn context(&self) -> &RequestContext {
        self.context
    }

    pub fn mark_dirty(&self) -> Result<()> {
        self.tracker.mark_dirty(self.entity)
    }

    pub fn mark_unload(&self) -> Result<()> {
        self.tracker.mark_unload(self.entity)
    }
}

/// Named operations per object kind, resolved at dispatch time.
///
/// A kind-specific registration shadows one made for every kind.
#[derive(Clone, Default)]
pub struct OperationRegistry {
    by_kind: HashMap<EntityKind, HashMap<String, RegisteredOperation>>,
    any_kind: HashMap<String, RegisteredOperation>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        kind: EntityKind,
        descriptor: OperationDescriptor,
        handler: OperationHandler,
    ) {
        let entry = self.by_kind.entry(kind).or_default();
        entry.insert(
            descriptor.name.clone(),
            RegisteredOperation { descriptor, handler },
        );
    }

    pub fn register_for_all(&mut self, descriptor: OperationDescriptor, handler: OperationHandler) {
        self.any_kind.insert(
            descriptor.name.clone(),
            RegisteredOperation { descriptor, handler },
        );
    }

    fn resolve(&self, kind: EntityKind, operation: &str) -> Option<&RegisteredOperation> {
        self.by_kind
            .get(&kind)
            .and_then(|operations| operations.get(operation))
            .or_else(|| self.any_kind.get(operation))
    }

    pub fn supports(&self, kind: EntityKind, operation: &str) -> bool {
        self.resolve(kind, operation).is_some()
    }

    pub fn descriptor(&self, kind: EntityKind, operation: &str) -> Option<&OperationDescriptor> {
        self.resolve(kind, operation).map(|op| &op.descriptor)
    }

    /// Operations callable on objects of `kind`, sorted by name.
    pub fn operations_for(&self, kind: EntityKind) -> Vec<OperationDescriptor> {
        let mut merged: HashMap<&str, &OperationDescriptor> = self
            .any_kind
            .values()
            .map(|op| (op.descriptor.name.as_str(), &op.descriptor))
            .collect();
        if let Some(operations) = self.by_kind.get(&kind) {
            merged.extend(
                operations
                    .values()
                    .map(|op| (op.descriptor.name.as_str(), &op.descriptor)),
            );
        }
        let mut descriptors = merged.into_values().cloned().collect::<Vec<_>>();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    pub fn len(&self) -> usize {
        self.any_kind.len() + self.by_kind.values().map(HashMap::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls `operation` on `entity` under its write lock.
    ///
    /// Mutating operations mark the entity dirty once they succeed. A failed
    /// call marks nothing by itself.
    pub fn invoke(
        &self,
        entity: &EntityRef,
        operation: &str,
        args: &[Value],
        tracker: &MutationTracker,
        context: &RequestContext,
    ) -> Result<Value> {
        let registered = self.resolve(entity.kind(), operation).ok_or_else(|| {
            CacheError::OperationNotFound {
                kind: entity.kind().to_string(),
                operation: operation.to_string(),
            }
        })?;

        let value = {
            let mut guard = entity.write()?;
            let mut call = OperationCall {
                entity,
                object: &mut guard,
                args,
                tracker,
                context,
            };
            (registered.handler)(&mut call)?
        };

        if registered.descriptor.mutates_state {
            tracker.mark_dirty(entity)?;
        }
        Ok(value)
    }
}

impl fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds = self.by_kind.keys().map(|kind| kind.as_str()).collect::<Vec<_>>();
        kinds.sort_unstable();
        f.debug_struct("OperationRegistry")
            .field("operations", &self.len())
            .field("kinds", &kinds)
            .finish()
    }
}
