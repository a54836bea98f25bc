use super::{CacheError, EntityKind, Result, Tsid};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObjectMetadata {
    /// Incremented on every field mutation.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Whether the durability layer has ever acknowledged this object.
    pub persisted: bool,
}

impl ObjectMetadata {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            version: 0,
            created_at: now,
            updated_at: now,
            persisted: false,
        }
    }
}

/// A cacheable game object: id, script class and a JSON data payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GameObject {
    tsid: Tsid,
    pub class_tsid: String,
    #[serde(default)]
    fields: serde_json::Map<String, serde_json::Value>,
    pub metadata: ObjectMetadata,
}

impl GameObject {
    /// Creates an object with a freshly generated id.
    pub fn create(kind: EntityKind, class_tsid: impl Into<String>) -> Self {
        Self::with_tsid(Tsid::generate(kind), class_tsid)
    }

    pub fn with_tsid(tsid: Tsid, class_tsid: impl Into<String>) -> Self {
        Self {
            tsid,
            class_tsid: class_tsid.into(),
            fields: serde_json::Map::new(),
            metadata: ObjectMetadata::new(Utc::now()),
        }
    }

    /// Builder-style initial payload. Non-object payloads are rejected.
    pub fn with_fields(mut self, fields: serde_json::Value) -> Result<Self> {
        match fields {
            serde_json::Value::Object(map) => {
                self.fields = map;
                Ok(self)
            }
            _ => Err(CacheError::Serialization(format!(
                "fields of '{}' must be a JSON object",
                self.tsid
            ))),
        }
    }

    pub fn tsid(&self) -> &Tsid {
        &self.tsid
    }

    pub fn kind(&self) -> EntityKind {
        self.tsid.kind()
    }

    pub fn fields(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.fields().get(name)
    }

    /// Mutable access to the payload. Counts as a mutation.
    pub fn fields_mut(&mut self) -> &mut serde_json::Map<String, serde_json::Value> {
        self.touch();
        &mut self.fields
    }

    pub fn set_field(&mut self, name: impl Into<String>, value: serde_json::Value) {
        self.fields_mut().insert(name.into(), value);
    }

    pub fn remove_field(&mut self, name: &str) -> Option<serde_json::Value> {
        self.fields_mut().remove(name)
    }

    fn touch(&mut self) {
        self.metadata.version = self.metadata.version.saturating_add(1);
        self.metadata.updated_at = Utc::now();
    }

    /// Serialized copy of the object; goes stale as soon as the live object changes.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

struct EntityCell {
    tsid: Tsid,
    state: RwLock<GameObject>,
}

/// Shared handle to a live game object.
///
/// Cloning the handle never clones the object: every clone points at the same
/// instance, and identity is pointer identity ([`EntityRef::same_instance`]).
#[derive(Clone)]
pub struct EntityRef(Arc<EntityCell>);

impl EntityRef {
    pub fn new(object: GameObject) -> Self {
        Self(Arc::new(EntityCell {
            tsid: object.tsid.clone(),
            state: RwLock::new(object),
        }))
    }

    pub fn tsid(&self) -> &Tsid {
        &self.0.tsid
    }

    pub fn kind(&self) -> EntityKind {
        self.0.tsid.kind()
    }

    pub fn same_instance(&self, other: &EntityRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn read(&self) -> Result<RwLockReadGuard<'_, GameObject>> {
        Ok(self.0.state.read()?)
    }

    pub fn write(&self) -> Result<RwLockWriteGuard<'_, GameObject>> {
        Ok(self.0.state.write()?)
    }

    /// Runs `f` against the live object under a write lock.
    pub fn update<T>(&self, f: impl FnOnce(&mut GameObject) -> T) -> Result<T> {
        let mut guard = self.write()?;
        Ok(f(&mut guard))
    }

    /// Point-in-time copy handed to the durability layer.
    pub fn snapshot(&self) -> Result<GameObject> {
        Ok(self.read()?.clone())
    }
}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityRef")
            .field("tsid", &self.0.tsid)
            .field("instance", &Arc::as_ptr(&self.0))
            .finish()
    }
}
