//! Purpose-built containers for the dependency graph indices.

use std::{
    borrow::Borrow,
    collections::{HashMap, HashSet},
    hash::Hash,
};

/// A map that can be queried in both directions.
///
/// Assigning a new value to an existing key erases the stale reverse entry so
/// that the two directions always describe the same bijection.
#[derive(Clone, Debug, Default)]
pub struct BidirectionalMap<A, B> {
    forward: HashMap<A, B>,
    reverse: HashMap<B, A>,
}

impl<A, B> BidirectionalMap<A, B>
where
    A: Clone + Eq + Hash,
    B: Clone + Eq + Hash,
{
    pub fn new() -> Self {
        Self { forward: HashMap::new(), reverse: HashMap::new() }
    }

    /// Inserts the pairing `a <-> b`, erasing any prior pairing involving
    /// either side.
    pub fn insert(&mut self, a: A, b: B) {
        if let Some(old_b) = self.forward.remove(&a) {
            self.reverse.remove(&old_b);
        }
        if let Some(old_a) = self.reverse.remove(&b) {
            self.forward.remove(&old_a);
        }
        self.forward.insert(a.clone(), b.clone());
        self.reverse.insert(b, a);
    }

    pub fn forward<Q>(&self, a: &Q) -> Option<&B>
    where
        A: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.forward.get(a)
    }

    pub fn reverse<Q>(&self, b: &Q) -> Option<&A>
    where
        B: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.reverse.get(b)
    }

    pub fn contains_key<Q>(&self, a: &Q) -> bool
    where
        A: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.forward.contains_key(a)
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&A, &B)> {
        self.forward.iter()
    }
}

/// A mapping from `K1` to an inner mapping `K2 -> V`.
#[derive(Clone, Debug)]
pub struct TwoLevelMap<K1, K2, V> {
    inner: HashMap<K1, HashMap<K2, V>>,
}

impl<K1, K2, V> Default for TwoLevelMap<K1, K2, V> {
    fn default() -> Self {
        Self { inner: HashMap::new() }
    }
}

impl<K1, K2, V> TwoLevelMap<K1, K2, V>
where
    K1: Eq + Hash,
    K2: Eq + Hash,
{
    pub fn get(&self, k1: &K1, k2: &K2) -> Option<&V> {
        self.inner.get(k1)?.get(k2)
    }

    /// The inner map for `k1`, if any entry was ever inserted under it.
    pub fn get_outer(&self, k1: &K1) -> Option<&HashMap<K2, V>> {
        self.inner.get(k1)
    }

    pub fn insert(&mut self, k1: K1, k2: K2, v: V) -> Option<V> {
        self.inner.entry(k1).or_default().insert(k2, v)
    }

    pub fn remove(&mut self, k1: &K1, k2: &K2) -> Option<V> {
        let inner = self.inner.get_mut(k1)?;
        let removed = inner.remove(k2);
        if inner.is_empty() {
            self.inner.remove(k1);
        }
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K1, &K2, &V)> {
        self.inner.iter().flat_map(|(k1, inner)| inner.iter().map(move |(k2, v)| (k1, k2, v)))
    }
}

/// A two-level map mirrored in both key orders, so that `by_k1` and `by_k2`
/// lookups are both O(1).
///
/// Every mutation updates both mirrors and checks they agree.
#[derive(Clone, Debug)]
pub struct TwoDMap<K1, K2, V> {
    by_k1: TwoLevelMap<K1, K2, V>,
    by_k2: TwoLevelMap<K2, K1, V>,
}

impl<K1, K2, V> Default for TwoDMap<K1, K2, V> {
    fn default() -> Self {
        Self { by_k1: Default::default(), by_k2: Default::default() }
    }
}

impl<K1, K2, V> TwoDMap<K1, K2, V>
where
    K1: Clone + Eq + Hash,
    K2: Clone + Eq + Hash,
    V: Clone + PartialEq + std::fmt::Debug,
{
    pub fn get(&self, k1: &K1, k2: &K2) -> Option<&V> {
        self.by_k1.get(k1, k2)
    }

    pub fn by_k1(&self, k1: &K1) -> Option<&HashMap<K2, V>> {
        self.by_k1.get_outer(k1)
    }

    pub fn by_k2(&self, k2: &K2) -> Option<&HashMap<K1, V>> {
        self.by_k2.get_outer(k2)
    }

    pub fn insert(&mut self, k1: K1, k2: K2, v: V) -> Option<V> {
        let prior = self.by_k1.insert(k1.clone(), k2.clone(), v.clone());
        let mirrored = self.by_k2.insert(k2, k1, v);
        debug_assert_eq!(prior, mirrored, "mirrors diverged on insert");
        prior
    }

    pub fn remove(&mut self, k1: &K1, k2: &K2) -> Option<V> {
        let removed = self.by_k1.remove(k1, k2);
        let mirrored = self.by_k2.remove(k2, k1);
        debug_assert_eq!(removed, mirrored, "mirrors diverged on removal");
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K1, &K2, &V)> {
        self.by_k1.iter()
    }

    /// Checks that the two mirrors hold exactly the same entries.
    pub fn is_consistent(&self) -> bool {
        let count_matches =
            self.by_k1.iter().count() == self.by_k2.iter().count();
        count_matches
            && self.by_k1.iter().all(|(k1, k2, v)| self.by_k2.get(k2, k1) == Some(v))
    }
}

/// A multimap `K -> Set<V>` with a reverse index `V -> Set<K>`, so that
/// `keys_containing` and `remove_occurrences_of` do not scan every bucket.
#[derive(Clone, Debug)]
pub struct Multidictionary<K, V> {
    forward: HashMap<K, HashSet<V>>,
    reverse: HashMap<V, HashSet<K>>,
}

impl<K, V> Default for Multidictionary<K, V> {
    fn default() -> Self {
        Self { forward: HashMap::new(), reverse: HashMap::new() }
    }
}

impl<K, V> Multidictionary<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone + Eq + Hash,
{
    /// Adds `v` to the set for `k`. Returns `true` if the pair was new.
    pub fn insert(&mut self, k: K, v: V) -> bool {
        let newly = self.forward.entry(k.clone()).or_default().insert(v.clone());
        if newly {
            self.reverse.entry(v).or_default().insert(k);
        }
        newly
    }

    pub fn get(&self, k: &K) -> Option<&HashSet<V>> {
        self.forward.get(k)
    }

    /// All keys whose set contains `v`.
    pub fn keys_containing(&self, v: &V) -> Option<&HashSet<K>> {
        self.reverse.get(v)
    }

    /// Removes one `(k, v)` pair.
    pub fn remove(&mut self, k: &K, v: &V) -> bool {
        let Some(values) = self.forward.get_mut(k) else { return false };
        if !values.remove(v) {
            return false;
        }
        if values.is_empty() {
            self.forward.remove(k);
        }
        if let Some(keys) = self.reverse.get_mut(v) {
            keys.remove(k);
            if keys.is_empty() {
                self.reverse.remove(v);
            }
        }
        true
    }

    /// Removes `v` from every bucket it appears in.
    pub fn remove_occurrences_of(&mut self, v: &V) {
        let Some(keys) = self.reverse.remove(v) else { return };
        for k in keys {
            if let Some(values) = self.forward.get_mut(&k) {
                values.remove(v);
                if values.is_empty() {
                    self.forward.remove(&k);
                }
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &HashSet<V>)> {
        self.forward.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bidirectional_insert_erases_stale_pairings() {
        let mut map = BidirectionalMap::new();
        map.insert("a", 1);
        assert_eq!(map.forward(&"a"), Some(&1));
        assert_eq!(map.reverse(&1), Some(&"a"));

        // re-point "a" at 2: the 1 -> "a" entry must go away
        map.insert("a", 2);
        assert_eq!(map.forward(&"a"), Some(&2));
        assert_eq!(map.reverse(&1), None);
        assert_eq!(map.reverse(&2), Some(&"a"));

        // steal 2 for "b": the "a" -> 2 entry must go away
        map.insert("b", 2);
        assert_eq!(map.forward(&"a"), None);
        assert_eq!(map.reverse(&2), Some(&"b"));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn two_d_map_mirrors_stay_consistent() {
        let mut map = TwoDMap::default();
        map.insert("s1", "k1", 10);
        map.insert("s1", "k2", 11);
        map.insert("s2", "k1", 12);
        assert!(map.is_consistent());

        assert_eq!(map.get(&"s1", &"k2"), Some(&11));
        assert_eq!(map.by_k1(&"s1").unwrap().len(), 2);
        assert_eq!(map.by_k2(&"k1").unwrap().len(), 2);

        assert_eq!(map.remove(&"s1", &"k1"), Some(10));
        assert!(map.is_consistent());
        assert_eq!(map.by_k2(&"k1").unwrap().len(), 1);
        assert_eq!(map.remove(&"s1", &"k1"), None);
    }

    #[test]
    fn multidictionary_reverse_index() {
        let mut dict = Multidictionary::default();
        assert!(dict.insert("k1", 1));
        assert!(dict.insert("k1", 2));
        assert!(!dict.insert("k1", 2));
        assert!(dict.insert("k2", 2));

        assert_eq!(dict.get(&"k1").unwrap().len(), 2);
        let containing: HashSet<_> = dict.keys_containing(&2).unwrap().clone();
        assert_eq!(containing, HashSet::from(["k1", "k2"]));

        dict.remove_occurrences_of(&2);
        assert_eq!(dict.keys_containing(&2), None);
        assert_eq!(dict.get(&"k1").unwrap().len(), 1);
        assert_eq!(dict.get(&"k2"), None);

        assert!(dict.remove(&"k1", &1));
        assert!(dict.is_empty());
    }
}
