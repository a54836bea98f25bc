use crate::core::{CacheError, Result, Tsid};
use serde::{Serialize, Serializer};
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashSet};

/// Per-target result of a batch dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Success { id: Tsid, result: Value },
    /// Target not reachable and the batch was restricted to online targets.
    Offline,
    Failed { error: String },
}

impl DispatchOutcome {
    pub fn failed(error: impl ToString) -> Self {
        Self::Failed {
            error: error.to_string(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn result(&self) -> Option<&Value> {
        match self {
            Self::Success { result, .. } => Some(result),
            _ => None,
        }
    }

    /// Shape consumed by game scripts.
    ///
    /// A structured result has its fields merged next to `ok` and `id`; any
    /// other value is nested under `result`.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Success { id, result } => match result {
                Value::Object(fields) => {
                    let mut merged = fields.clone();
                    merged.insert("id".to_string(), json!(id));
                    merged.insert("ok".to_string(), Value::Bool(true));
                    Value::Object(merged)
                }
                other => json!({"ok": true, "id": id, "result": other}),
            },
            Self::Offline => json!({"ok": false, "offline": true}),
            Self::Failed { error } => json!({"ok": false, "error": error}),
        }
    }
}

impl Serialize for DispatchOutcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

/// Outcomes of one batch, keyed by target id.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct DispatchReport {
    outcomes: BTreeMap<Tsid, DispatchOutcome>,
}

impl DispatchReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, tsid: Tsid, outcome: DispatchOutcome) {
        self.outcomes.insert(tsid, outcome);
    }

    pub fn get(&self, tsid: &str) -> Option<&DispatchOutcome> {
        self.outcomes.get(tsid)
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Tsid, &DispatchOutcome)> {
        self.outcomes.iter()
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes
            .values()
            .filter(|o| matches!(o, DispatchOutcome::Failed { .. }))
            .count()
    }

    pub fn offline(&self) -> usize {
        self.outcomes
            .values()
            .filter(|o| matches!(o, DispatchOutcome::Offline))
            .count()
    }

    pub fn to_json(&self) -> Value {
        let map = self
            .outcomes
            .iter()
            .map(|(tsid, outcome)| (tsid.to_string(), outcome.to_json()))
            .collect::<Map<_, _>>();
        Value::Object(map)
    }
}

impl IntoIterator for DispatchReport {
    type Item = (Tsid, DispatchOutcome);
    type IntoIter = std::collections::btree_map::IntoIter<Tsid, DispatchOutcome>;

    fn into_iter(self) -> Self::IntoIter {
        self.outcomes.into_iter()
    }
}

/// The objects a batch is sent to.
///
/// Scripts pass either a list of ids or a hash keyed by id; both end up as
/// the same id set, only enumeration order differs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchTargets {
    List(Vec<Tsid>),
    Keyed(Vec<Tsid>),
}

impl DispatchTargets {
    pub fn list(ids: impl IntoIterator<Item = Tsid>) -> Self {
        Self::List(ids.into_iter().collect())
    }

    /// Targets taken from the keys of any map.
    pub fn from_keys<K, V>(map: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<Tsid>,
    {
        Self::Keyed(map.into_iter().map(|(key, _)| key.into()).collect())
    }

    pub fn parse_list<S: AsRef<str>>(raw: impl IntoIterator<Item = S>) -> Result<Self> {
        let ids = raw
            .into_iter()
            .map(|id| Tsid::parse(id.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::List(ids))
    }

    /// Accepts a JSON array of id strings or a JSON object keyed by id.
    pub fn from_json(value: &Value) -> Result<Self> {
        match value {
            Value::Array(items) => {
                let ids = items
                    .iter()
                    .map(|item| match item {
                        Value::String(raw) => Tsid::parse(raw.as_str()),
                        other => Err(CacheError::InvalidTsid(other.to_string())),
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Self::List(ids))
            }
            Value::Object(map) => {
                let ids = map
                    .keys()
                    .map(|key| Tsid::parse(key.as_str()))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Self::Keyed(ids))
            }
            other => Err(CacheError::InvalidTsid(other.to_string())),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::List(ids) | Self::Keyed(ids) => ids.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids in enumeration order with repeats removed.
    pub fn into_unique(self) -> Vec<Tsid> {
        let ids = match self {
            Self::List(ids) | Self::Keyed(ids) => ids,
        };
        let mut seen = HashSet::with_capacity(ids.len());
        ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
    }
}

impl From<Vec<Tsid>> for DispatchTargets {
    fn from(ids: Vec<Tsid>) -> Self {
        Self::List(ids)
    }
}
