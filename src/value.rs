//! Entity data model. Entities are ordered maps of field names to dynamically
//! typed [`Value`]s, keyed by their entity type and a string id.

use num_bigint::{BigInt, Sign};
use serde::{Deserialize, Serialize};
use solabi::{ethprim::Address, value::Value as AbiValue};
use std::{
    cmp::Ordering,
    collections::BTreeMap,
    fmt::{self, Display, Formatter},
};

/// A single entity field value.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Value {
    Null,
    String(String),
    Int(#[serde(with = "decimal")] BigInt),
    Bool(bool),
    Bytes(#[serde(with = "bytes")] Vec<u8>),
    Address(#[serde(with = "address")] Address),
    List(Vec<Value>),
    /// The id of another entity. References are not checked for existence.
    Reference(String),
}

impl Value {
    /// Converts a decoded ABI value into an entity value.
    pub fn from_abi(value: &AbiValue) -> Self {
        match value {
            AbiValue::Int(v) => Self::Int(BigInt::from_signed_bytes_be(&v.get().to_be_bytes())),
            AbiValue::Uint(v) => Self::Int(BigInt::from_bytes_be(
                Sign::Plus,
                &v.get().to_be_bytes(),
            )),
            AbiValue::Address(v) => Self::Address(*v),
            AbiValue::Bool(v) => Self::Bool(*v),
            AbiValue::FixedBytes(v) => Self::Bytes(v.as_bytes().to_vec()),
            AbiValue::Function(v) => Self::Bytes(
                v.address
                    .0
                    .iter()
                    .copied()
                    .chain(v.selector.0.iter().copied())
                    .collect(),
            ),
            AbiValue::Bytes(v) => Self::Bytes(v.clone()),
            AbiValue::String(v) => Self::String(v.clone()),
            AbiValue::Array(v) | AbiValue::FixedArray(v) => {
                Self::List(v.as_slice().iter().map(Self::from_abi).collect())
            }
            AbiValue::Tuple(v) => Self::List(v.iter().map(Self::from_abi).collect()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) | Self::Reference(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<&BigInt> {
        match self {
            Self::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_address(&self) -> Option<Address> {
        match self {
            Self::Address(v) => Some(*v),
            _ => None,
        }
    }

    /// Compares two values of the same kind. `Null` sorts before everything
    /// else; values of different kinds are incomparable.
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Null, Self::Null) => Some(Ordering::Equal),
            (Self::Null, _) => Some(Ordering::Less),
            (_, Self::Null) => Some(Ordering::Greater),
            (Self::String(a), Self::String(b)) => Some(a.cmp(b)),
            (Self::Reference(a), Self::Reference(b)) => Some(a.cmp(b)),
            (Self::Int(a), Self::Int(b)) => Some(a.cmp(b)),
            (Self::Bool(a), Self::Bool(b)) => Some(a.cmp(b)),
            (Self::Bytes(a), Self::Bytes(b)) => Some(a.cmp(b)),
            (Self::Address(a), Self::Address(b)) => Some(a.0.cmp(&b.0)),
            (Self::List(a), Self::List(b)) => {
                for (a, b) in a.iter().zip(b) {
                    match a.compare(b)? {
                        Ordering::Equal => continue,
                        ordering => return Some(ordering),
                    }
                }
                Some(a.len().cmp(&b.len()))
            }
            _ => None,
        }
    }

    /// A total order over all values: values of the same kind compare as in
    /// [`Value::compare`], and different kinds are ordered by kind.
    pub fn total_cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::List(a), Self::List(b)) => a
                .iter()
                .zip(b)
                .map(|(a, b)| a.total_cmp(b))
                .find(|ordering| ordering.is_ne())
                .unwrap_or_else(|| a.len().cmp(&b.len())),
            _ => self
                .compare(other)
                .unwrap_or_else(|| self.rank().cmp(&other.rank())),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Bool(_) => 1,
            Self::Int(_) => 2,
            Self::String(_) => 3,
            Self::Reference(_) => 4,
            Self::Bytes(_) => 5,
            Self::Address(_) => 6,
            Self::List(_) => 7,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::String(v) | Self::Reference(v) => f.write_str(v),
            Self::Int(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Bytes(v) => write!(f, "0x{}", hex::encode(v)),
            Self::Address(v) => write!(f, "0x{}", hex::encode(v.0)),
            Self::List(v) => {
                f.write_str("[")?;
                for (i, value) in v.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{value}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<BigInt> for Value {
    fn from(value: BigInt) -> Self {
        Self::Int(value)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Self::Int(value.into())
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value.into())
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<Address> for Value {
    fn from(value: Address) -> Self {
        Self::Address(value)
    }
}

/// An entity's fields, ordered by name.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Entity(BTreeMap<String, Value>);

impl Entity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder style [`Entity::set`].
    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.set(field, value);
        self
    }

    pub fn set(&mut self, field: &str, value: impl Into<Value>) {
        self.0.insert(field.to_owned(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn string(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Value::as_str)
    }

    pub fn int(&self, field: &str) -> Option<&BigInt> {
        self.get(field).and_then(Value::as_int)
    }

    pub fn bool(&self, field: &str) -> Option<bool> {
        self.get(field).and_then(Value::as_bool)
    }

    pub fn address(&self, field: &str) -> Option<Address> {
        self.get(field).and_then(Value::as_address)
    }

    /// Copies all fields of `other` into this entity, replacing existing
    /// values with the same name.
    pub fn merge(&mut self, other: Entity) {
        self.0.extend(other.0);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for Entity
where
    K: Into<String>,
    V: Into<Value>,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Key identifying an entity.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct EntityKey {
    pub entity_type: String,
    pub id: String,
}

impl EntityKey {
    pub fn new(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }
}

impl Display for EntityKey {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}[{}]", self.entity_type, self.id)
    }
}

mod decimal {
    use num_bigint::BigInt;
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::borrow::Cow;

    pub fn serialize<S>(value: &BigInt, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BigInt, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = Cow::<str>::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

pub(crate) mod bytes {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::borrow::Cow;

    pub fn serialize<S>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("0x{}", hex::encode(value)))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = Cow::<str>::deserialize(deserializer)?;
        let s = s
            .strip_prefix("0x")
            .ok_or_else(|| de::Error::custom("expected 0x-prefixed hex string"))?;
        hex::decode(s).map_err(de::Error::custom)
    }
}

pub(crate) mod address {
    use serde::{de, Deserializer, Serializer};
    use solabi::ethprim::Address;

    pub fn serialize<S>(value: &Address, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        super::bytes::serialize(&value.0, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Address, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes = super::bytes::deserialize(deserializer)?;
        let bytes = <[u8; 20]>::try_from(bytes.as_slice())
            .map_err(|_| de::Error::custom("expected 20 byte address"))?;
        Ok(Address(bytes))
    }
}
