//! Typed access to KMS object properties.
//!
//! Property tables are read once when an object is initialized. Afterwards every write goes
//! through a [`Property`] handle, which validates the value against what the driver advertised
//! and stages it into an [`AtomicRequest`].

use std::collections::BTreeMap;
use std::io;

use thiserror::Error;
use tracing::trace;

use super::types::{ObjectRef, PropertyId, PropertyInfo, PropertyKind};
use super::KmsDevice;

#[derive(Debug, Error)]
pub enum PropertyError {
    #[error("{object} has no property {name:?}")]
    Missing { object: ObjectRef, name: String },
    #[error("property {name:?} is immutable")]
    Immutable { name: String },
    #[error("value {value} is out of range for property {name:?}")]
    OutOfRange { name: String, value: u64 },
    #[error("value {value:#x} is not a valid value for property {name:?}")]
    InvalidEnumValue { name: String, value: u64 },
    #[error("error getting properties of {object}")]
    Io {
        object: ObjectRef,
        #[source]
        source: io::Error,
    },
}

// =============================================================================
// Atomic Request
// =============================================================================

/// One staged property write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyWrite {
    pub object: ObjectRef,
    pub property: PropertyId,
    pub name: String,
    pub value: u64,
}

/// Property writes accumulated for one atomic commit.
///
/// Writes are kept in staging order. Writing the same property of the same object twice keeps
/// the position of the first write and the value of the second.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AtomicRequest {
    writes: Vec<PropertyWrite>,
}

impl AtomicRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, object: ObjectRef, property: PropertyId, name: &str, value: u64) {
        if let Some(write) = self
            .writes
            .iter_mut()
            .find(|w| w.object == object && w.property == property)
        {
            write.value = value;
            return;
        }

        self.writes.push(PropertyWrite {
            object,
            property,
            name: name.to_owned(),
            value,
        });
    }

    /// Append every write of `other`.
    pub fn merge(&mut self, other: AtomicRequest) {
        for write in other.writes {
            self.add(write.object, write.property, &write.name, write.value);
        }
    }

    pub fn writes(&self) -> &[PropertyWrite] {
        &self.writes
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// The staged value of the named property on `object`, if any.
    pub fn value(&self, object: ObjectRef, name: &str) -> Option<u64> {
        self.writes
            .iter()
            .find(|w| w.object == object && w.name == name)
            .map(|w| w.value)
    }

    /// Every write staged for `object`, in staging order.
    pub fn writes_for(&self, object: ObjectRef) -> impl Iterator<Item = &PropertyWrite> {
        self.writes.iter().filter(move |w| w.object == object)
    }
}

// =============================================================================
// Enum Maps
// =============================================================================

/// Maps a domain enum onto the values a driver advertised for an enum or bitmask property.
///
/// Only values the driver knows about are present, so membership doubles as a capability test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumMap<K: Ord>(BTreeMap<K, u64>);

impl<K: Ord> Default for EnumMap<K> {
    fn default() -> Self {
        Self(BTreeMap::new())
    }
}

impl<K: Ord + Copy> EnumMap<K> {
    pub fn get(&self, key: &K) -> Option<u64> {
        self.0.get(key).copied()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.0.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn keys(&self) -> impl Iterator<Item = K> + '_ {
        self.0.keys().copied()
    }
}

// =============================================================================
// Properties
// =============================================================================

/// A resolved property of one KMS object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    object: ObjectRef,
    info: PropertyInfo,
    /// Value at the time the table was read.
    value: u64,
}

impl Property {
    pub fn new(object: ObjectRef, info: PropertyInfo, value: u64) -> Self {
        Self {
            object,
            info,
            value,
        }
    }

    pub fn object(&self) -> ObjectRef {
        self.object
    }

    pub fn id(&self) -> PropertyId {
        self.info.id
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn kind(&self) -> &PropertyKind {
        &self.info.kind
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn is_immutable(&self) -> bool {
        self.info.immutable
    }

    /// Lower bound of a range property.
    pub fn range_min(&self) -> Option<u64> {
        match self.info.kind {
            PropertyKind::Range { min, .. } => Some(min),
            PropertyKind::SignedRange { min, .. } => Some(min as u64),
            _ => None,
        }
    }

    /// The value to write for the named enum entry.
    ///
    /// For bitmask properties this is the bit itself, not its index.
    pub fn enum_value(&self, name: &str) -> Option<u64> {
        match &self.info.kind {
            PropertyKind::Enum(entries) => entries
                .iter()
                .find(|e| e.name == name)
                .map(|e| e.value),
            PropertyKind::Bitmask(entries) => entries
                .iter()
                .find(|e| e.name == name)
                .and_then(|e| 1u64.checked_shl(e.value as u32)),
            _ => None,
        }
    }

    /// Build a map for the given domain values, keeping only names the driver advertises.
    pub fn enum_map<K: Ord + Copy>(&self, names: &[(&str, K)]) -> EnumMap<K> {
        let mut map = BTreeMap::new();
        for (name, key) in names {
            match self.enum_value(name) {
                Some(value) => {
                    map.insert(*key, value);
                }
                None => trace!("{} does not support {name:?} on {}", self.name(), self.object),
            }
        }
        EnumMap(map)
    }

    fn check(&self, value: u64) -> Result<(), PropertyError> {
        let name = || self.info.name.clone();

        if self.info.immutable {
            return Err(PropertyError::Immutable { name: name() });
        }

        match &self.info.kind {
            PropertyKind::Range { min, max } => {
                if value < *min || value > *max {
                    return Err(PropertyError::OutOfRange {
                        name: name(),
                        value,
                    });
                }
            }
            PropertyKind::SignedRange { min, max } => {
                let signed = value as i64;
                if signed < *min || signed > *max {
                    return Err(PropertyError::OutOfRange {
                        name: name(),
                        value,
                    });
                }
            }
            PropertyKind::Enum(entries) => {
                if !entries.iter().any(|e| e.value == value) {
                    return Err(PropertyError::InvalidEnumValue {
                        name: name(),
                        value,
                    });
                }
            }
            PropertyKind::Bitmask(entries) => {
                let mask = entries
                    .iter()
                    .filter_map(|e| 1u64.checked_shl(e.value as u32))
                    .fold(0, |acc, bit| acc | bit);
                if value & !mask != 0 {
                    return Err(PropertyError::InvalidEnumValue {
                        name: name(),
                        value,
                    });
                }
            }
            PropertyKind::Blob | PropertyKind::Object => (),
        }

        Ok(())
    }

    /// Stage `value` into `req` after validating it against the driver's description.
    pub fn atomic_set(&self, req: &mut AtomicRequest, value: u64) -> Result<(), PropertyError> {
        self.check(value)?;
        req.add(self.object, self.info.id, &self.info.name, value);
        Ok(())
    }
}

// =============================================================================
// Property Tables
// =============================================================================

/// Every property of one object, read once.
#[derive(Debug, Clone)]
pub struct PropertyTable {
    object: ObjectRef,
    properties: Vec<Property>,
}

impl PropertyTable {
    pub fn load(device: &dyn KmsDevice, object: ObjectRef) -> Result<Self, PropertyError> {
        let properties = device
            .properties(object)
            .map_err(|source| PropertyError::Io { object, source })?
            .into_iter()
            .map(|(info, value)| Property::new(object, info, value))
            .collect();

        Ok(Self { object, properties })
    }

    pub fn object(&self) -> ObjectRef {
        self.object
    }

    pub fn find(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name() == name)
    }

    /// A property the object cannot work without.
    pub fn mandatory(&self, name: &str) -> Result<Property, PropertyError> {
        self.find(name).cloned().ok_or_else(|| PropertyError::Missing {
            object: self.object,
            name: name.to_owned(),
        })
    }

    pub fn optional(&self, name: &str) -> Option<Property> {
        let prop = self.find(name).cloned();
        if prop.is_none() {
            trace!("{} has no optional property {name:?}", self.object);
        }
        prop
    }

    pub fn iter(&self) -> impl Iterator<Item = &Property> {
        self.properties.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kms::types::{EnumEntry, PlaneId};

    fn prop(kind: PropertyKind) -> Property {
        Property::new(
            ObjectRef::Plane(PlaneId(31)),
            PropertyInfo {
                id: PropertyId(7),
                name: "test".to_owned(),
                kind,
                immutable: false,
            },
            0,
        )
    }

    fn entries(names: &[(&str, u64)]) -> Vec<EnumEntry> {
        names
            .iter()
            .map(|(name, value)| EnumEntry {
                name: (*name).to_owned(),
                value: *value,
            })
            .collect()
    }

    #[test]
    fn range_is_validated() {
        let p = prop(PropertyKind::Range { min: 2, max: 5 });
        let mut req = AtomicRequest::new();
        assert!(p.atomic_set(&mut req, 2).is_ok());
        assert!(p.atomic_set(&mut req, 5).is_ok());
        assert!(matches!(
            p.atomic_set(&mut req, 6),
            Err(PropertyError::OutOfRange { value: 6, .. })
        ));
        assert_eq!(req.len(), 1);
        assert_eq!(req.value(p.object(), "test"), Some(5));
    }

    #[test]
    fn immutable_is_rejected() {
        let mut p = prop(PropertyKind::Range { min: 0, max: 5 });
        p.info.immutable = true;
        let mut req = AtomicRequest::new();
        assert!(matches!(
            p.atomic_set(&mut req, 1),
            Err(PropertyError::Immutable { .. })
        ));
        assert!(req.is_empty());
    }

    #[test]
    fn bitmask_values_are_bits() {
        let p = prop(PropertyKind::Bitmask(entries(&[
            ("rotate-0", 0),
            ("rotate-90", 1),
            ("reflect-x", 4),
        ])));
        assert_eq!(p.enum_value("rotate-0"), Some(1));
        assert_eq!(p.enum_value("rotate-90"), Some(2));
        assert_eq!(p.enum_value("reflect-x"), Some(16));
        assert_eq!(p.enum_value("rotate-180"), None);

        let mut req = AtomicRequest::new();
        assert!(p.atomic_set(&mut req, 2 | 16).is_ok());
        assert!(p.atomic_set(&mut req, 4).is_err());
    }

    #[test]
    fn enum_map_keeps_advertised_names_only() {
        let p = prop(PropertyKind::Enum(entries(&[("None", 2), ("Coverage", 1)])));
        let map = p.enum_map(&[("None", 'n'), ("Pre-multiplied", 'p'), ("Coverage", 'c')]);
        assert_eq!(map.len(), 2);
        assert_eq!(map.get(&'n'), Some(2));
        assert_eq!(map.get(&'c'), Some(1));
        assert!(!map.contains(&'p'));

        let mut req = AtomicRequest::new();
        assert!(p.atomic_set(&mut req, 0).is_err());
        assert!(p.atomic_set(&mut req, 1).is_ok());
    }

    #[test]
    fn later_write_replaces_earlier() {
        let mut req = AtomicRequest::new();
        let obj = ObjectRef::Plane(PlaneId(1));
        req.add(obj, PropertyId(1), "CRTC_ID", 5);
        req.add(obj, PropertyId(2), "FB_ID", 6);
        req.add(obj, PropertyId(1), "CRTC_ID", 0);

        assert_eq!(req.len(), 2);
        assert_eq!(req.writes()[0].value, 0);
        assert_eq!(req.value(obj, "FB_ID"), Some(6));
    }
}
