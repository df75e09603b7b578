//! Alpha memories: elements grouped by their constant fields.

use std::collections::HashMap;

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

use crate::symbol::Symbol;
use crate::wm::{Timetag, Wme};

use super::node::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AlphaId(pub u32);

/// Constant-equality signature of a condition. `None` fields match anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AlphaKey {
    pub id: Option<Symbol>,
    pub attr: Option<Symbol>,
    pub value: Option<Symbol>,
    pub acceptable: bool,
}

impl AlphaKey {
    /// The eight keys an element can be filed under.
    pub fn candidates(wme: &Wme) -> impl Iterator<Item = AlphaKey> {
        let (id, attr, value, acceptable) = (wme.id, wme.attr, wme.value, wme.acceptable);
        (0u8..8).map(move |mask| AlphaKey {
            id: (mask & 1 != 0).then_some(id),
            attr: (mask & 2 != 0).then_some(attr),
            value: (mask & 4 != 0).then_some(value),
            acceptable,
        })
    }
}

#[derive(Debug, Clone)]
pub struct AlphaMemory {
    pub key: AlphaKey,
    pub items: IndexSet<Timetag>,
    /// Joins and negative nodes fed by this memory, descendants first.
    pub successors: Vec<NodeId>,
}

/// All alpha memories, indexed by key.
#[derive(Debug, Default)]
pub struct AlphaNetwork {
    memories: Vec<Option<AlphaMemory>>,
    free: Vec<u32>,
    index: HashMap<AlphaKey, AlphaId>,
}

impl AlphaNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: AlphaId) -> Option<&AlphaMemory> {
        self.memories.get(id.0 as usize).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: AlphaId) -> Option<&mut AlphaMemory> {
        self.memories.get_mut(id.0 as usize).and_then(Option::as_mut)
    }

    pub fn lookup(&self, key: &AlphaKey) -> Option<AlphaId> {
        self.index.get(key).copied()
    }

    /// Find or create the memory for `key`, filling a new one from `existing`.
    pub fn build_or_share<'a>(
        &mut self,
        key: AlphaKey,
        existing: impl Iterator<Item = &'a Wme>,
    ) -> AlphaId {
        if let Some(id) = self.index.get(&key) {
            return *id;
        }
        let items: IndexSet<Timetag> = existing
            .filter(|w| Self::key_matches(&key, w))
            .map(|w| w.timetag)
            .collect();
        let memory = AlphaMemory {
            key,
            items,
            successors: Vec::new(),
        };
        let id = match self.free.pop() {
            Some(slot) => {
                self.memories[slot as usize] = Some(memory);
                AlphaId(slot)
            }
            None => {
                self.memories.push(Some(memory));
                AlphaId(self.memories.len() as u32 - 1)
            }
        };
        self.index.insert(key, id);
        tracing::trace!(alpha = id.0, "alpha memory created");
        id
    }

    pub fn key_matches(key: &AlphaKey, wme: &Wme) -> bool {
        key.acceptable == wme.acceptable
            && key.id.is_none_or(|s| s == wme.id)
            && key.attr.is_none_or(|s| s == wme.attr)
            && key.value.is_none_or(|s| s == wme.value)
    }

    /// Drop a memory that has no successors left.
    pub fn remove(&mut self, id: AlphaId) -> Option<AlphaMemory> {
        let memory = self.memories.get_mut(id.0 as usize)?.take()?;
        self.index.remove(&memory.key);
        self.free.push(id.0);
        Some(memory)
    }

    /// Memories that currently hold `wme`'s key signature.
    pub fn memories_for(&self, wme: &Wme) -> Vec<AlphaId> {
        AlphaKey::candidates(wme)
            .filter_map(|key| self.lookup(&key))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(id: u64) -> Symbol {
        Symbol::new(id).unwrap()
    }

    fn wme(tt: u64, id: u64, attr: u64, value: u64) -> Wme {
        Wme {
            timetag: Timetag(tt),
            id: sym(id),
            attr: sym(attr),
            value: sym(value),
            acceptable: false,
        }
    }

    #[test]
    fn eight_candidate_keys_are_distinct() {
        let keys: std::collections::HashSet<_> = AlphaKey::candidates(&wme(1, 1, 2, 3)).collect();
        assert_eq!(keys.len(), 8);
    }

    #[test]
    fn new_memory_is_filled_from_existing_elements() {
        let mut net = AlphaNetwork::new();
        let existing = [wme(1, 1, 2, 3), wme(2, 1, 4, 3), wme(3, 5, 2, 6)];
        let key = AlphaKey {
            id: None,
            attr: Some(sym(2)),
            value: None,
            acceptable: false,
        };
        let id = net.build_or_share(key, existing.iter());
        let items: Vec<_> = net.get(id).unwrap().items.iter().copied().collect();
        assert_eq!(items, vec![Timetag(1), Timetag(3)]);
        assert_eq!(net.build_or_share(key, existing.iter()), id);
        assert_eq!(net.len(), 1);
    }

    #[test]
    fn acceptable_flag_is_part_of_key() {
        let mut acceptable = wme(1, 1, 2, 3);
        acceptable.acceptable = true;
        let key = AlphaKey {
            id: None,
            attr: Some(sym(2)),
            value: None,
            acceptable: false,
        };
        assert!(!AlphaNetwork::key_matches(&key, &acceptable));
    }

    #[test]
    fn removed_slot_is_reused() {
        let mut net = AlphaNetwork::new();
        let key = AlphaKey {
            id: None,
            attr: None,
            value: None,
            acceptable: false,
        };
        let id = net.build_or_share(key, std::iter::empty());
        net.remove(id);
        assert!(net.is_empty());
        let again = net.build_or_share(key, std::iter::empty());
        assert_eq!(again, id);
    }
}
