// Copyright (c) 2026 Adrian Robinson. All rights reserved.
// Licensed under the MIT License. See LICENSE file in the project root for full license information.

use serde::{Deserialize, Serialize};

/// Replicated state of a grow-only counter.
///
/// The state pairs a logical counter name with one tally per replica. The
/// counter's total is the sum of all tallies; merging two states takes the
/// pointwise maximum per replica, so replicas converge regardless of message
/// order, duplication, or loss.
///
/// # Algebraic Properties
///
/// - **Commutativity**: `merge(a, b) == merge(b, a)`.
/// - **Associativity**: `merge(merge(a, b), c) == merge(a, merge(b, c))`.
/// - **Idempotence**: `merge(a, a) == a`.
///
/// # Example
///
/// ```
/// use gcounter_cluster::GCounterState;
///
/// let mut a = GCounterState::named("hits");
/// a.increment_tally("replica-1");
/// a.increment_tally("replica-1");
///
/// let mut b = GCounterState::named("hits");
/// b.increment_tally("replica-2");
///
/// a.merge(&b);
/// assert_eq!(a.value(), 3);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GCounterState {
    /// Logical counter name; doubles as the file base name on disk.
    #[serde(default)]
    pub name: String,
    /// (replica id, tally) pairs sorted by replica id, serialized as the
    /// JSON map `peers`.
    #[serde(
        default,
        rename = "peers",
        serialize_with = "serialize_tallies",
        deserialize_with = "deserialize_tallies"
    )]
    pub tallies: Vec<(String, i64)>,
}

pub(crate) fn serialize_tallies<S>(
    tallies: &Vec<(String, i64)>,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    use serde::ser::SerializeMap;
    let mut map = serializer.serialize_map(Some(tallies.len()))?;
    for (k, v) in tallies {
        map.serialize_entry(k, v)?;
    }
    map.end()
}

pub(crate) fn deserialize_tallies<'de, D>(deserializer: D) -> Result<Vec<(String, i64)>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct TalliesVisitor;

    impl<'de> serde::de::Visitor<'de> for TalliesVisitor {
        type Value = Vec<(String, i64)>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a map of per-replica tallies")
        }

        fn visit_map<M>(self, mut access: M) -> Result<Self::Value, M::Error>
        where
            M: serde::de::MapAccess<'de>,
        {
            let mut tallies: Vec<(String, i64)> =
                Vec::with_capacity(access.size_hint().unwrap_or(0));
            while let Some((key, value)) = access.next_entry::<String, i64>()? {
                // A grow-only counter never holds a negative tally; clamp
                // anything a foreign writer may have left behind.
                tallies.push((key, value.max(0)));
            }
            // Sort to maintain invariant; keep the maximum on duplicate keys.
            tallies.sort_by(|a, b| a.0.cmp(&b.0));
            tallies.dedup_by(|b, a| {
                if a.0 == b.0 {
                    a.1 = a.1.max(b.1);
                    true
                } else {
                    false
                }
            });
            Ok(tallies)
        }
    }

    deserializer.deserialize_map(TalliesVisitor)
}

impl GCounterState {
    /// Creates a new, empty state with an empty name.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new, empty state with the given name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tallies: Vec::new(),
        }
    }

    /// Returns the total aggregated value: the sum of all replica tallies.
    pub fn value(&self) -> i64 {
        self.tallies.iter().map(|(_, v)| v).sum()
    }

    /// Returns the tally recorded for one replica, 0 if absent.
    pub fn tally_of(&self, replica_id: &str) -> i64 {
        match self
            .tallies
            .binary_search_by(|(k, _)| k.as_str().cmp(replica_id))
        {
            Ok(idx) => self.tallies[idx].1,
            Err(_) => 0,
        }
    }

    /// Increments the tally for one replica, inserting it at 1 if absent.
    ///
    /// Overflowing a 64-bit tally would break monotonicity and is fatal.
    pub fn increment_tally(&mut self, replica_id: &str) {
        match self
            .tallies
            .binary_search_by(|(k, _)| k.as_str().cmp(replica_id))
        {
            Ok(idx) => {
                self.tallies[idx].1 = match self.tallies[idx].1.checked_add(1) {
                    Some(v) => v,
                    None => panic!(
                        "tally overflow for replica {} in counter {:?}",
                        replica_id, self.name
                    ),
                };
            }
            Err(idx) => {
                self.tallies.insert(idx, (replica_id.to_string(), 1));
            }
        }
    }

    /// Merges another state into this one by pointwise maximum.
    ///
    /// A linear scan merge of the two sorted vectors; replicas present on
    /// one side only are carried over unchanged. The name is left untouched.
    pub fn merge(&mut self, other: &Self) {
        let mut merged = Vec::with_capacity(self.tallies.len() + other.tallies.len());
        let mut i = 0;
        let mut j = 0;

        while i < self.tallies.len() && j < other.tallies.len() {
            let (k1, v1) = &self.tallies[i];
            let (k2, v2) = &other.tallies[j];

            match k1.cmp(k2) {
                std::cmp::Ordering::Less => {
                    merged.push((k1.clone(), *v1));
                    i += 1;
                }
                std::cmp::Ordering::Greater => {
                    merged.push((k2.clone(), *v2));
                    j += 1;
                }
                std::cmp::Ordering::Equal => {
                    merged.push((k1.clone(), (*v1).max(*v2)));
                    i += 1;
                    j += 1;
                }
            }
        }

        if i < self.tallies.len() {
            merged.extend_from_slice(&self.tallies[i..]);
        }
        if j < other.tallies.len() {
            merged.extend_from_slice(&other.tallies[j..]);
        }

        self.tallies = merged;
    }

    /// Replaces an empty name with the given default.
    pub fn with_default_name(mut self, default: &str) -> Self {
        if self.name.is_empty() {
            self.name = default.to_string();
        }
        self
    }

    /// Returns true if no replica has ever incremented this counter.
    pub fn is_empty(&self) -> bool {
        self.tallies.is_empty()
    }
}
