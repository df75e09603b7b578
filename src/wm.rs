//! Working memory: the store of (id, attr, value) elements.
//!
//! Each element carries a timetag that is unique for the lifetime of the store
//! and a list of supporters. An element lives exactly as long as it has at
//! least one supporter: detaching the last one removes it in the same call.
//! Callers get one `Created` result and one removed `Wme` per element lifetime,
//! which is what they forward to the match network.

use std::collections::HashMap;

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};

use crate::error::{KernelResult, WmError};
use crate::preference::PreferenceId;
use crate::symbol::Symbol;

/// Creation stamp of a working memory element. Strictly increasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timetag(pub u64);

impl std::fmt::Display for Timetag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why an element is in working memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Supporter {
    /// A preference that the decider turned into this element.
    Preference(PreferenceId),
    /// Submitted through the input queue.
    Input,
    /// Created by the decider itself (goal and impasse structure).
    Architecture,
}

/// A working memory element as seen by the rest of the kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wme {
    pub timetag: Timetag,
    pub id: Symbol,
    pub attr: Symbol,
    pub value: Symbol,
    /// Marks an acceptable-preference element such as `(S1 ^operator O1 +)`.
    pub acceptable: bool,
}

impl Wme {
    pub fn triple(&self) -> (Symbol, Symbol, Symbol) {
        (self.id, self.attr, self.value)
    }
}

/// Outcome of [`WorkingMemory::add_wme`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WmeAdd {
    /// A new element was created and must be forwarded to the network.
    Created(Wme),
    /// The element already existed; only its supporter list changed.
    Supported(Timetag),
}

impl WmeAdd {
    pub fn timetag(&self) -> Timetag {
        match self {
            WmeAdd::Created(wme) => wme.timetag,
            WmeAdd::Supported(tt) => *tt,
        }
    }
}

type TripleKey = (Symbol, Symbol, Symbol, bool);

#[derive(Debug, Clone)]
struct WmeEntry {
    wme: Wme,
    supporters: Vec<Supporter>,
}

/// The working memory store.
#[derive(Debug)]
pub struct WorkingMemory {
    /// Timetag → entry, in creation order.
    entries: IndexMap<Timetag, WmeEntry>,
    by_triple: HashMap<TripleKey, Timetag>,
    by_id: HashMap<Symbol, IndexSet<Timetag>>,
    /// Preference → the element it supports.
    by_supporter: HashMap<PreferenceId, Timetag>,
    next_timetag: u64,
}

impl WorkingMemory {
    pub fn new() -> Self {
        Self {
            entries: IndexMap::new(),
            by_triple: HashMap::new(),
            by_id: HashMap::new(),
            by_supporter: HashMap::new(),
            next_timetag: 1,
        }
    }

    /// Find or create `(id ^attr value)` and attach `supporter` to it.
    pub fn add_wme(
        &mut self,
        id: Symbol,
        attr: Symbol,
        value: Symbol,
        acceptable: bool,
        supporter: Supporter,
    ) -> WmeAdd {
        let key = (id, attr, value, acceptable);
        if let Some(&tt) = self.by_triple.get(&key) {
            if let Some(entry) = self.entries.get_mut(&tt) {
                if !entry.supporters.contains(&supporter) {
                    entry.supporters.push(supporter);
                }
            }
            if let Supporter::Preference(pref) = supporter {
                self.by_supporter.insert(pref, tt);
            }
            return WmeAdd::Supported(tt);
        }

        let timetag = Timetag(self.next_timetag);
        self.next_timetag += 1;
        let wme = Wme {
            timetag,
            id,
            attr,
            value,
            acceptable,
        };
        self.entries.insert(
            timetag,
            WmeEntry {
                wme: wme.clone(),
                supporters: vec![supporter],
            },
        );
        self.by_triple.insert(key, timetag);
        self.by_id.entry(id).or_default().insert(timetag);
        if let Supporter::Preference(pref) = supporter {
            self.by_supporter.insert(pref, timetag);
        }
        tracing::trace!(timetag = %timetag, "wme created");
        WmeAdd::Created(wme)
    }

    /// Detach a preference from the element it supports.
    ///
    /// Returns the removed element when that was its last supporter.
    pub fn remove_support(&mut self, pref: PreferenceId) -> KernelResult<Option<Wme>> {
        let tt = self
            .by_supporter
            .remove(&pref)
            .ok_or(WmError::UnknownSupporter { preference: pref.0 })?;
        let entry = self
            .entries
            .get_mut(&tt)
            .ok_or(WmError::UnknownWme { timetag: tt.0 })?;
        entry
            .supporters
            .retain(|s| *s != Supporter::Preference(pref));
        if entry.supporters.is_empty() {
            Ok(self.unlink(tt))
        } else {
            Ok(None)
        }
    }

    /// Detach a non-preference supporter, removing the element when it was
    /// the last one.
    pub fn detach(&mut self, tt: Timetag, supporter: Supporter) -> KernelResult<Option<Wme>> {
        if let Supporter::Preference(pref) = supporter {
            return self.remove_support(pref);
        }
        let entry = self
            .entries
            .get_mut(&tt)
            .ok_or(WmError::UnknownWme { timetag: tt.0 })?;
        entry.supporters.retain(|s| *s != supporter);
        if entry.supporters.is_empty() {
            Ok(self.unlink(tt))
        } else {
            Ok(None)
        }
    }

    /// Whether a preference currently supports an element.
    pub fn is_supporting(&self, pref: PreferenceId) -> bool {
        self.by_supporter.contains_key(&pref)
    }

    /// Remove an element regardless of its supporters.
    pub fn remove_wme(&mut self, tt: Timetag) -> Option<Wme> {
        let entry = self.entries.get(&tt)?;
        for supporter in &entry.supporters {
            if let Supporter::Preference(pref) = supporter {
                self.by_supporter.remove(pref);
            }
        }
        self.unlink(tt)
    }

    fn unlink(&mut self, tt: Timetag) -> Option<Wme> {
        let entry = self.entries.shift_remove(&tt)?;
        let wme = entry.wme;
        self.by_triple
            .remove(&(wme.id, wme.attr, wme.value, wme.acceptable));
        if let Some(set) = self.by_id.get_mut(&wme.id) {
            set.shift_remove(&tt);
            if set.is_empty() {
                self.by_id.remove(&wme.id);
            }
        }
        tracing::trace!(timetag = %tt, "wme removed");
        Some(wme)
    }

    pub fn get(&self, tt: Timetag) -> Option<&Wme> {
        self.entries.get(&tt).map(|e| &e.wme)
    }

    pub fn contains(&self, tt: Timetag) -> bool {
        self.entries.contains_key(&tt)
    }

    /// Exact lookup of a triple.
    pub fn find(&self, id: Symbol, attr: Symbol, value: Symbol, acceptable: bool) -> Option<&Wme> {
        self.by_triple
            .get(&(id, attr, value, acceptable))
            .and_then(|tt| self.get(*tt))
    }

    pub fn supporters(&self, tt: Timetag) -> &[Supporter] {
        self.entries
            .get(&tt)
            .map(|e| e.supporters.as_slice())
            .unwrap_or(&[])
    }

    /// Elements matching the bound fields, in creation order.
    ///
    /// Uses the id index when `id` is given, otherwise scans.
    pub fn query(
        &self,
        id: Option<Symbol>,
        attr: Option<Symbol>,
        value: Option<Symbol>,
    ) -> Box<dyn Iterator<Item = &Wme> + '_> {
        let matches = move |w: &&Wme| {
            attr.is_none_or(|a| w.attr == a) && value.is_none_or(|v| w.value == v)
        };
        match id {
            Some(id) => {
                let iter = self
                    .by_id
                    .get(&id)
                    .into_iter()
                    .flat_map(|set| set.iter())
                    .filter_map(|tt| self.get(*tt))
                    .filter(matches);
                Box::new(iter)
            }
            None => Box::new(self.iter().filter(matches)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Wme> + '_ {
        self.entries.values().map(|e| &e.wme)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every element. Timetags keep increasing across a clear.
    pub fn clear(&mut self) -> Vec<Wme> {
        self.by_triple.clear();
        self.by_id.clear();
        self.by_supporter.clear();
        self.entries.drain(..).map(|(_, e)| e.wme).collect()
    }
}

impl Default for WorkingMemory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(id: u64) -> Symbol {
        Symbol::new(id).unwrap()
    }

    #[test]
    fn first_add_creates_second_add_supports() {
        let mut wm = WorkingMemory::new();
        let first = wm.add_wme(sym(1), sym(2), sym(3), false, Supporter::Input);
        let WmeAdd::Created(wme) = first else {
            panic!("expected creation");
        };
        let second = wm.add_wme(
            sym(1),
            sym(2),
            sym(3),
            false,
            Supporter::Preference(PreferenceId(9)),
        );
        assert_eq!(second, WmeAdd::Supported(wme.timetag));
        assert_eq!(wm.len(), 1);
        assert_eq!(wm.supporters(wme.timetag).len(), 2);
    }

    #[test]
    fn acceptable_flag_distinguishes_elements() {
        let mut wm = WorkingMemory::new();
        let a = wm.add_wme(sym(1), sym(2), sym(3), false, Supporter::Input);
        let b = wm.add_wme(sym(1), sym(2), sym(3), true, Supporter::Input);
        assert!(matches!(a, WmeAdd::Created(_)));
        assert!(matches!(b, WmeAdd::Created(_)));
        assert_eq!(wm.len(), 2);
    }

    #[test]
    fn timetags_strictly_increase_and_are_not_reused() {
        let mut wm = WorkingMemory::new();
        let a = wm.add_wme(sym(1), sym(2), sym(3), false, Supporter::Input).timetag();
        wm.remove_wme(a);
        let b = wm.add_wme(sym(1), sym(2), sym(3), false, Supporter::Input).timetag();
        assert!(b > a);
    }

    #[test]
    fn removing_last_supporter_removes_element() {
        let mut wm = WorkingMemory::new();
        let p1 = PreferenceId(1);
        let p2 = PreferenceId(2);
        wm.add_wme(sym(1), sym(2), sym(3), false, Supporter::Preference(p1));
        wm.add_wme(sym(1), sym(2), sym(3), false, Supporter::Preference(p2));
        assert!(wm.remove_support(p1).unwrap().is_none());
        assert_eq!(wm.len(), 1);
        let removed = wm.remove_support(p2).unwrap();
        assert!(removed.is_some());
        assert!(wm.is_empty());
    }

    #[test]
    fn unknown_supporter_is_error() {
        let mut wm = WorkingMemory::new();
        assert!(wm.remove_support(PreferenceId(4)).is_err());
    }

    #[test]
    fn forced_removal_detaches_preference_supporters() {
        let mut wm = WorkingMemory::new();
        let p = PreferenceId(1);
        let tt = wm
            .add_wme(sym(1), sym(2), sym(3), false, Supporter::Preference(p))
            .timetag();
        assert!(wm.remove_wme(tt).is_some());
        assert!(!wm.is_supporting(p));
        assert!(wm.remove_wme(tt).is_none());
    }

    #[test]
    fn detaching_input_keeps_preference_support() {
        let mut wm = WorkingMemory::new();
        let tt = wm.add_wme(sym(1), sym(2), sym(3), false, Supporter::Input).timetag();
        wm.add_wme(sym(1), sym(2), sym(3), false, Supporter::Preference(PreferenceId(5)));
        assert!(wm.detach(tt, Supporter::Input).unwrap().is_none());
        assert_eq!(wm.supporters(tt), &[Supporter::Preference(PreferenceId(5))]);
        assert!(wm.detach(tt, Supporter::Preference(PreferenceId(5))).unwrap().is_some());
        assert!(wm.detach(tt, Supporter::Input).is_err());
    }

    #[test]
    fn query_by_id_and_attr() {
        let mut wm = WorkingMemory::new();
        wm.add_wme(sym(1), sym(2), sym(3), false, Supporter::Input);
        wm.add_wme(sym(1), sym(4), sym(5), false, Supporter::Input);
        wm.add_wme(sym(6), sym(2), sym(3), false, Supporter::Input);
        assert_eq!(wm.query(Some(sym(1)), None, None).count(), 2);
        assert_eq!(wm.query(Some(sym(1)), Some(sym(2)), None).count(), 1);
        assert_eq!(wm.query(None, Some(sym(2)), Some(sym(3))).count(), 2);
        assert_eq!(wm.query(Some(sym(9)), None, None).count(), 0);
    }

    #[test]
    fn every_element_has_a_supporter() {
        let mut wm = WorkingMemory::new();
        for i in 0..5u64 {
            wm.add_wme(
                sym(1),
                sym(2),
                sym(10 + i),
                false,
                Supporter::Preference(PreferenceId(i)),
            );
        }
        wm.remove_support(PreferenceId(2)).unwrap();
        for wme in wm.iter() {
            assert!(!wm.supporters(wme.timetag).is_empty());
        }
        assert_eq!(wm.len(), 4);
    }
}
