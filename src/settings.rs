//! Recursive, typed configuration values carried by every target and used to
//! key its variants. Grounded on the per-node flag design of a settings tree
//! that backs a native build system's target configuration: each node can opt
//! out of hashing, comparison, or serialization independently of its value.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};

use crate::error::{Error, Result};

/// One node of a settings tree: a sum type over absent/scalar/array/map/null,
/// decorated with the flags that control hashing, comparison, and
/// serialization.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Setting {
    value: Value,
    used_in_hash: bool,
    ignore_in_comparison: bool,
    serializable: bool,
    required: bool,
    use_count: i32,
}

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Absent,
    Scalar(String),
    Array(Vec<Setting>),
    Map(Settings),
    Null,
}

impl Default for Value {
    fn default() -> Self {
        Value::Absent
    }
}

impl Default for Setting {
    fn default() -> Self {
        Setting {
            value: Value::Absent,
            used_in_hash: true,
            ignore_in_comparison: false,
            serializable: true,
            required: false,
            use_count: 1,
        }
    }
}

impl Setting {
    pub fn absent() -> Self {
        Self::default()
    }

    pub fn null() -> Self {
        Setting {
            value: Value::Null,
            ..Default::default()
        }
    }

    pub fn scalar(s: impl Into<String>) -> Self {
        Setting {
            value: Value::Scalar(s.into()),
            ..Default::default()
        }
    }

    pub fn array(items: Vec<Setting>) -> Self {
        Setting {
            value: Value::Array(items),
            ..Default::default()
        }
    }

    pub fn map(m: Settings) -> Self {
        Setting {
            value: Value::Map(m),
            ..Default::default()
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self.value, Value::Absent)
    }

    pub fn is_null(&self) -> bool {
        matches!(self.value, Value::Null)
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self.value, Value::Scalar(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(self.value, Value::Array(_))
    }

    pub fn is_map(&self) -> bool {
        matches!(self.value, Value::Map(_))
    }

    /// Reads the scalar value. Fails with `BadInput` (standing in for the
    /// source's `BadKind`) if this node isn't a scalar.
    pub fn value(&self) -> Result<&str> {
        match &self.value {
            Value::Scalar(s) => Ok(s),
            _ => Err(Error::BadInput(format!(
                "expected scalar setting, found {:?}",
                self.value
            ))),
        }
    }

    pub fn array_value(&self) -> Result<&[Setting]> {
        match &self.value {
            Value::Array(a) => Ok(a),
            _ => Err(Error::BadInput("expected array setting".into())),
        }
    }

    pub fn map_value(&self) -> Result<&Settings> {
        match &self.value {
            Value::Map(m) => Ok(m),
            _ => Err(Error::BadInput("expected map setting".into())),
        }
    }

    pub fn map_value_mut(&mut self) -> &mut Settings {
        if !matches!(self.value, Value::Map(_)) {
            self.value = Value::Map(Settings::default());
        }
        match &mut self.value {
            Value::Map(m) => m,
            _ => unreachable!(),
        }
    }

    pub fn used_in_hash(&self) -> bool {
        self.used_in_hash
    }

    pub fn set_used_in_hash(&mut self, v: bool) -> &mut Self {
        self.used_in_hash = v;
        self
    }

    pub fn ignore_in_comparison(&self) -> bool {
        self.ignore_in_comparison
    }

    pub fn set_ignore_in_comparison(&mut self, v: bool) -> &mut Self {
        self.ignore_in_comparison = v;
        self
    }

    pub fn serializable(&self) -> bool {
        self.serializable
    }

    pub fn set_serializable(&mut self, v: bool) -> &mut Self {
        self.serializable = v;
        self
    }

    pub fn required(&self) -> bool {
        self.required
    }

    pub fn set_required(&mut self, v: bool) -> &mut Self {
        self.required = v;
        self
    }

    pub fn use_count(&self) -> i32 {
        self.use_count
    }

    pub fn increment_use_count(&mut self) {
        self.use_count += 1;
    }

    /// Equality for comparison purposes: nodes with `ignore_in_comparison` set
    /// on either side are treated as equal regardless of value.
    fn eq_for_comparison(&self, other: &Setting) -> bool {
        if self.ignore_in_comparison || other.ignore_in_comparison {
            return true;
        }
        match (&self.value, &other.value) {
            (Value::Absent, Value::Absent) | (Value::Null, Value::Null) => true,
            (Value::Scalar(a), Value::Scalar(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.eq_for_comparison(y))
            }
            (Value::Map(a), Value::Map(b)) => a.eq_for_comparison(b),
            _ => false,
        }
    }

    /// `self` is a subset of `other` iff every scalar/array/map this node
    /// carries recursively agrees with `other`'s; array values compare as
    /// multiset-equals (order-independent).
    fn is_subset_of(&self, other: &Setting) -> bool {
        match (&self.value, &other.value) {
            (Value::Absent, _) => true,
            (Value::Null, Value::Null) => true,
            (Value::Scalar(a), Value::Scalar(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => {
                a.len() == b.len() && multiset_eq(a, b)
            }
            (Value::Map(a), Value::Map(b)) => a.is_subset_of(b),
            _ => false,
        }
    }

    fn merge_and_assign(&mut self, other: &Setting) {
        match (&mut self.value, &other.value) {
            (Value::Map(a), Value::Map(b)) => a.merge_and_assign(b),
            _ => *self = other.clone(),
        }
    }

    fn merge_missing(&mut self, other: &Setting) {
        if self.is_absent() {
            *self = other.clone();
            return;
        }
        if let (Value::Map(a), Value::Map(b)) = (&mut self.value, &other.value) {
            a.merge_missing(b);
        }
    }

    fn hash_into(&self, out: &mut Vec<u8>) {
        if !self.used_in_hash {
            return;
        }
        match &self.value {
            Value::Absent => out.push(0),
            Value::Null => out.push(1),
            Value::Scalar(s) => {
                out.push(2);
                out.extend_from_slice(s.as_bytes());
            }
            Value::Array(a) => {
                out.push(3);
                for item in a {
                    if item.used_in_hash {
                        item.hash_into(out);
                    }
                }
            }
            Value::Map(m) => {
                out.push(4);
                m.hash_into(out);
            }
        }
    }

    fn to_json(&self) -> Option<serde_json::Value> {
        if !self.serializable {
            return None;
        }
        Some(match &self.value {
            Value::Absent => serde_json::Value::Null,
            Value::Null => serde_json::Value::Null,
            Value::Scalar(s) => serde_json::Value::String(s.clone()),
            Value::Array(a) => {
                serde_json::Value::Array(a.iter().filter_map(Setting::to_json).collect())
            }
            Value::Map(m) => m.to_json(),
        })
    }

    fn from_json(v: &serde_json::Value) -> Setting {
        match v {
            serde_json::Value::Null => Setting::null(),
            serde_json::Value::String(s) => Setting::scalar(s.clone()),
            serde_json::Value::Bool(b) => Setting::scalar(b.to_string()),
            serde_json::Value::Number(n) => Setting::scalar(n.to_string()),
            serde_json::Value::Array(a) => {
                Setting::array(a.iter().map(Setting::from_json).collect())
            }
            serde_json::Value::Object(o) => {
                let mut settings = Settings::default();
                for (k, v) in o {
                    settings.nodes.insert(k.clone(), Setting::from_json(v));
                }
                Setting::map(settings)
            }
        }
    }
}

fn multiset_eq(a: &[Setting], b: &[Setting]) -> bool {
    let mut used = vec![false; b.len()];
    'outer: for x in a {
        for (i, y) in b.iter().enumerate() {
            if !used[i] && x.is_subset_of(y) && y.is_subset_of(x) {
                used[i] = true;
                continue 'outer;
            }
        }
        return false;
    }
    true
}

/// An ordered-by-key mapping from string to `Setting`. The outermost value a
/// target or a command-line query carries around.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Settings {
    nodes: BTreeMap<String, Setting>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.iter().all(|(_, v)| v.is_absent())
    }

    /// `get` auto-vivifies: a missing key path is no error, it just returns an
    /// absent node (matching the source's `operator[]` semantics).
    pub fn get(&self, key: &str) -> Setting {
        self.get_path(&split_path(key))
    }

    fn get_path(&self, path: &[&str]) -> Setting {
        match path.split_first() {
            None => Setting::absent(),
            Some((head, rest)) => match self.nodes.get(*head) {
                None => Setting::absent(),
                Some(node) if rest.is_empty() => node.clone(),
                Some(node) => match node.map_value() {
                    Ok(m) => m.get_path(rest),
                    Err(_) => Setting::absent(),
                },
            },
        }
    }

    /// `set` auto-vivifies every intermediate map along a dotted key path.
    pub fn set(&mut self, key: &str, value: Setting) {
        self.set_path(&split_path(key), value);
    }

    fn set_path(&mut self, path: &[&str], value: Setting) {
        match path.split_first() {
            None => {}
            Some((head, rest)) if rest.is_empty() => {
                self.nodes.insert(head.to_string(), value);
            }
            Some((head, rest)) => {
                let entry = self
                    .nodes
                    .entry(head.to_string())
                    .or_insert_with(|| Setting::map(Settings::default()));
                entry.map_value_mut().set_path(rest, value);
            }
        }
    }

    pub fn insert_scalar(&mut self, key: &str, value: impl Into<String>) {
        self.set(key, Setting::scalar(value));
    }

    /// Values from `other` overwrite values present here; maps merge
    /// recursively, every other kind is a wholesale replacement.
    pub fn merge_and_assign(&mut self, other: &Settings) {
        for (k, v) in &other.nodes {
            match self.nodes.get_mut(k) {
                Some(existing) => existing.merge_and_assign(v),
                None => {
                    self.nodes.insert(k.clone(), v.clone());
                }
            }
        }
    }

    /// Values from `other` fill in only where this tree has nothing.
    pub fn merge_missing(&mut self, other: &Settings) {
        for (k, v) in &other.nodes {
            match self.nodes.get_mut(k) {
                Some(existing) => existing.merge_missing(v),
                None => {
                    self.nodes.insert(k.clone(), v.clone());
                }
            }
        }
    }

    fn eq_for_comparison(&self, other: &Settings) -> bool {
        let keys: std::collections::BTreeSet<_> =
            self.nodes.keys().chain(other.nodes.keys()).collect();
        keys.into_iter().all(|k| {
            let a = self.nodes.get(k).cloned().unwrap_or_default();
            let b = other.nodes.get(k).cloned().unwrap_or_default();
            a.eq_for_comparison(&b)
        })
    }

    /// `self` is a subset of `other` iff every key present here has an equal
    /// value in `other`, recursively.
    pub fn is_subset_of(&self, other: &Settings) -> bool {
        self.nodes.iter().all(|(k, v)| match other.nodes.get(k) {
            Some(ov) => v.is_subset_of(ov),
            None => v.is_absent(),
        })
    }

    fn hash_into(&self, out: &mut Vec<u8>) {
        for (k, v) in &self.nodes {
            if !v.used_in_hash() {
                continue;
            }
            out.extend_from_slice(k.as_bytes());
            v.hash_into(out);
        }
    }

    /// Canonicalises the tree (sorted keys, nodes with `used_in_hash=false`
    /// skipped), digests it with SHA-512, and truncates to a 64-bit hex
    /// string. `BTreeMap` already keeps keys sorted, so canonicalisation is
    /// free.
    pub fn hash(&self) -> String {
        let mut bytes = Vec::new();
        self.hash_into(&mut bytes);
        let digest = Sha512::digest(&bytes);
        let truncated = u64::from_be_bytes(digest[..8].try_into().unwrap());
        format!("{:016x}", truncated)[..8].to_string()
    }

    fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (k, v) in &self.nodes {
            if let Some(json) = v.to_json() {
                map.insert(k.clone(), json);
            }
        }
        serde_json::Value::Object(map)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.to_json())?)
    }

    pub fn from_json_str(s: &str) -> Result<Settings> {
        let v: serde_json::Value = serde_json::from_str(s)?;
        match Setting::from_json(&v).value {
            Value::Map(m) => Ok(m),
            _ => Err(Error::BadInput("settings JSON root must be an object".into())),
        }
    }
}

impl PartialEq<()> for Settings {
    fn eq(&self, _: &()) -> bool {
        self.is_empty()
    }
}

impl fmt::Display for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

fn split_path(key: &str) -> Vec<&str> {
    key.split('.').collect()
}

// Custom equality separate from derived PartialEq: the derived one compares
// flags too (used for exact-state assertions in tests), while the semantic
// "are these two settings the same configuration" comparison used by the rest
// of the engine goes through `semantically_equal`.
impl Settings {
    pub fn semantically_equal(&self, other: &Settings) -> bool {
        self.eq_for_comparison(other)
    }
}

impl Serialize for Settings {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Settings {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let v = serde_json::Value::deserialize(deserializer)?;
        match Setting::from_json(&v).value {
            Value::Map(m) => Ok(m),
            _ => Ok(Settings::default()),
        }
    }
}
