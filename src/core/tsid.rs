use super::{CacheError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::borrow::Borrow;
use std::fmt;
use uuid::Uuid;

const MAX_TSID_LEN: usize = 64;

/// Broad class of a game object, encoded in the first character of its id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Player,
    Item,
    Bag,
    Location,
    Geo,
    Group,
    Quest,
    DataContainer,
    Other,
}

impl EntityKind {
    pub const ALL: [EntityKind; 9] = [
        EntityKind::Player,
        EntityKind::Item,
        EntityKind::Bag,
        EntityKind::Location,
        EntityKind::Geo,
        EntityKind::Group,
        EntityKind::Quest,
        EntityKind::DataContainer,
        EntityKind::Other,
    ];

    /// Id prefix used when generating identifiers for this kind.
    pub fn prefix(self) -> char {
        match self {
            EntityKind::Player => 'P',
            EntityKind::Item => 'I',
            EntityKind::Bag => 'B',
            EntityKind::Location => 'L',
            EntityKind::Geo => 'G',
            EntityKind::Group => 'R',
            EntityKind::Quest => 'Q',
            EntityKind::DataContainer => 'D',
            EntityKind::Other => 'X',
        }
    }

    pub fn from_prefix(prefix: char) -> Self {
        match prefix {
            'P' => EntityKind::Player,
            'I' => EntityKind::Item,
            'B' => EntityKind::Bag,
            'L' => EntityKind::Location,
            'G' => EntityKind::Geo,
            'R' => EntityKind::Group,
            'Q' => EntityKind::Quest,
            'D' => EntityKind::DataContainer,
            _ => EntityKind::Other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Player => "player",
            EntityKind::Item => "item",
            EntityKind::Bag => "bag",
            EntityKind::Location => "location",
            EntityKind::Geo => "geo",
            EntityKind::Group => "group",
            EntityKind::Quest => "quest",
            EntityKind::DataContainer => "data_container",
            EntityKind::Other => "other",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable, validated identifier of a game object.
///
/// Accepts 1 to 64 ASCII characters from `[A-Za-z0-9_.-]`. The first
/// character determines the [`EntityKind`]; ids that do not follow the
/// prefix convention are still valid and classify as [`EntityKind::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tsid(String);

impl Tsid {
    pub fn parse(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        if is_valid_tsid(&raw) {
            Ok(Self(raw))
        } else {
            Err(CacheError::InvalidTsid(raw))
        }
    }

    /// Generates a fresh identifier for a new object of the given kind.
    pub fn generate(kind: EntityKind) -> Self {
        let body = Uuid::new_v4().simple().to_string().to_ascii_uppercase();
        Self(format!("{}{}", kind.prefix(), body))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn kind(&self) -> EntityKind {
        self.0
            .chars()
            .next()
            .map(EntityKind::from_prefix)
            .unwrap_or(EntityKind::Other)
    }

    pub fn is_player(&self) -> bool {
        self.kind() == EntityKind::Player
    }
}

/// Checks a raw string against the identifier rules without allocating.
pub fn is_valid_tsid(raw: &str) -> bool {
    !raw.is_empty()
        && raw.len() <= MAX_TSID_LEN
        && raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'))
}

impl fmt::Display for Tsid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Tsid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for Tsid {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&Tsid> for Tsid {
    fn from(value: &Tsid) -> Self {
        value.clone()
    }
}

impl TryFrom<&str> for Tsid {
    type Error = CacheError;

    fn try_from(value: &str) -> Result<Self> {
        Self::parse(value)
    }
}

impl TryFrom<String> for Tsid {
    type Error = CacheError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(value)
    }
}

impl std::str::FromStr for Tsid {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for Tsid {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Tsid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Tsid::parse(raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_game_and_test_style_ids() {
        for raw in ["PUVF8J2KTNHE2AA", "item_1", "loc_9", "bag.private-3"] {
            assert!(Tsid::parse(raw).is_ok(), "{raw} should be valid");
        }
    }

    #[test]
    fn parse_rejects_malformed_ids() {
        let too_long = "I".repeat(MAX_TSID_LEN + 1);
        for raw in ["", "has space", "semi;colon", "ünïcode", too_long.as_str()] {
            let err = Tsid::parse(raw).unwrap_err();
            assert!(matches!(err, CacheError::InvalidTsid(_)), "{raw:?}");
        }
    }

    #[test]
    fn kind_follows_prefix() {
        assert_eq!(Tsid::parse("PABC").unwrap().kind(), EntityKind::Player);
        assert_eq!(Tsid::parse("RXYZ").unwrap().kind(), EntityKind::Group);
        assert_eq!(Tsid::parse("item_1").unwrap().kind(), EntityKind::Other);
        assert!(Tsid::parse("P1").unwrap().is_player());
    }

    #[test]
    fn generated_ids_are_unique_and_carry_kind() {
        for kind in EntityKind::ALL {
            let a = Tsid::generate(kind);
            let b = Tsid::generate(kind);
            assert_ne!(a, b);
            assert_eq!(a.kind(), kind);
            assert!(is_valid_tsid(a.as_str()));
        }
    }

    #[test]
    fn deserialize_validates() {
        let ok: Tsid = serde_json::from_str("\"LHV11D8BQG\"").unwrap();
        assert_eq!(ok.kind(), EntityKind::Location);
        assert!(serde_json::from_str::<Tsid>("\"bad id\"").is_err());
    }
}
