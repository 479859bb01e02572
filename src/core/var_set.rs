//! Growable bit vector indexed by variable id.

use crate::ir::VarId;

/// Set of variables, one bit per id.
///
/// Queries past the end answer `false`; inserts grow the vector, so sets sized
/// before SSA renaming keep working after new variables appear.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VarSet {
    words: Vec<u64>,
}

impl VarSet {
    pub fn new() -> Self {
        Self { words: Vec::new() }
    }

    pub fn with_capacity(vars: usize) -> Self {
        Self {
            words: vec![0; vars.div_ceil(64)],
        }
    }

    pub fn contains(&self, var: VarId) -> bool {
        let idx = var.index();
        self.words
            .get(idx / 64)
            .is_some_and(|word| word & (1 << (idx % 64)) != 0)
    }

    /// Insert `var`, returning whether it was newly added.
    pub fn insert(&mut self, var: VarId) -> bool {
        let idx = var.index();
        if idx / 64 >= self.words.len() {
            self.words.resize(idx / 64 + 1, 0);
        }
        let bit = 1 << (idx % 64);
        let fresh = self.words[idx / 64] & bit == 0;
        self.words[idx / 64] |= bit;
        fresh
    }

    pub fn remove(&mut self, var: VarId) {
        let idx = var.index();
        if let Some(word) = self.words.get_mut(idx / 64) {
            *word &= !(1 << (idx % 64));
        }
    }

    pub fn clear(&mut self) {
        self.words.iter_mut().for_each(|word| *word = 0);
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|word| *word == 0)
    }

    pub fn len(&self) -> usize {
        self.words.iter().map(|word| word.count_ones() as usize).sum()
    }

    pub fn union_with(&mut self, other: &VarSet) {
        if other.words.len() > self.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        for (word, theirs) in self.words.iter_mut().zip(&other.words) {
            *word |= theirs;
        }
    }

    pub fn intersect_with(&mut self, other: &VarSet) {
        for (i, word) in self.words.iter_mut().enumerate() {
            *word &= other.words.get(i).copied().unwrap_or(0);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = VarId> + '_ {
        self.words.iter().enumerate().flat_map(|(i, &word)| {
            (0..64)
                .filter(move |bit| word & (1 << bit) != 0)
                .map(move |bit| VarId((i * 64 + bit) as u32))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_grows() {
        let mut set = VarSet::with_capacity(4);
        assert!(!set.contains(VarId(200)));
        assert!(set.insert(VarId(200)));
        assert!(!set.insert(VarId(200)));
        assert!(set.contains(VarId(200)));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_iter_and_union() {
        let mut a = VarSet::new();
        a.insert(VarId(1));
        a.insert(VarId(65));
        let mut b = VarSet::new();
        b.insert(VarId(3));
        b.insert(VarId(130));

        a.union_with(&b);
        let vars: Vec<_> = a.iter().collect();
        assert_eq!(vars, vec![VarId(1), VarId(3), VarId(65), VarId(130)]);

        a.remove(VarId(65));
        assert!(!a.contains(VarId(65)));
        a.clear();
        assert!(a.is_empty());
    }

    #[test]
    fn test_intersect_with_shorter_set() {
        let mut a = VarSet::new();
        a.insert(VarId(2));
        a.insert(VarId(90));
        let mut b = VarSet::new();
        b.insert(VarId(2));

        a.intersect_with(&b);
        assert_eq!(a.iter().collect::<Vec<_>>(), vec![VarId(2)]);
    }
}
