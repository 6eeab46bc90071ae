//! Flat field maps exchanged with the payment gateway.
//!
//! Every gateway request and callback is a flat `key=value` form. Keys are
//! compared case-sensitively for lookup, but signed in case-insensitive order.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A flat set of gateway form fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GatewayFields(BTreeMap<String, String>);

impl GatewayFields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a field, replacing any previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Builder-style variant of [`GatewayFields::insert`].
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Returns the value of `key`, treating empty strings as absent.
    pub fn get_non_empty(&self, key: &str) -> Option<&str> {
        self.get(key).filter(|v| !v.is_empty())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Returns the fields in signing order, skipping any key equal to `exclude`
    /// (ASCII case-insensitive).
    ///
    /// Keys are ordered by their ASCII-uppercased form; keys that fold to the
    /// same string fall back to byte order.
    pub fn signing_order(&self, exclude: &str) -> Vec<(&str, &str)> {
        let mut pairs: Vec<(&str, &str)> = self
            .iter()
            .filter(|(k, _)| !k.eq_ignore_ascii_case(exclude))
            .collect();
        pairs.sort_by(|a, b| compare_keys(a.0, b.0));
        pairs
    }
}

fn compare_keys(a: &str, b: &str) -> Ordering {
    let folded = a
        .bytes()
        .map(|c| c.to_ascii_uppercase())
        .cmp(b.bytes().map(|c| c.to_ascii_uppercase()));
    folded.then_with(|| a.cmp(b))
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for GatewayFields {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl From<BTreeMap<String, String>> for GatewayFields {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

impl IntoIterator for GatewayFields {
    type Item = (String, String);
    type IntoIter = std::collections::btree_map::IntoIter<String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
