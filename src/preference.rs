//! Preference memory: preferences grouped into (id, attr) slots.
//!
//! Preferences are immutable once stored. A slot exists while it holds at least
//! one preference and remembers whether its contents changed since the decider
//! last looked at it.

use std::collections::HashMap;

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};

use crate::instantiation::InstantiationId;
use crate::production::Support;
use crate::symbol::{Symbol, SymbolTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PreferenceId(pub u64);

impl std::fmt::Display for PreferenceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pref:{}", self.0)
    }
}

/// The kind of claim a preference makes about its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PreferenceType {
    Acceptable,
    Require,
    Reject,
    Prohibit,
    Reconsider,
    UnaryIndifferent,
    BinaryIndifferent,
    NumericIndifferent,
    Best,
    Worst,
    Better,
    Worse,
}

impl PreferenceType {
    /// Compares the value with a second candidate given as referent.
    pub fn is_binary(self) -> bool {
        matches!(
            self,
            PreferenceType::Better | PreferenceType::Worse | PreferenceType::BinaryIndifferent
        )
    }

    /// Prefix notation used in traces: `+ ! - ~ @ = > <`.
    pub fn glyph(self) -> &'static str {
        match self {
            PreferenceType::Acceptable => "+",
            PreferenceType::Require => "!",
            PreferenceType::Reject => "-",
            PreferenceType::Prohibit => "~",
            PreferenceType::Reconsider => "@",
            PreferenceType::UnaryIndifferent
            | PreferenceType::BinaryIndifferent
            | PreferenceType::NumericIndifferent => "=",
            PreferenceType::Best | PreferenceType::Better => ">",
            PreferenceType::Worst | PreferenceType::Worse => "<",
        }
    }
}

impl std::fmt::Display for PreferenceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.glyph())
    }
}

/// A single preference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preference {
    pub id: Symbol,
    pub attr: Symbol,
    pub value: Symbol,
    pub kind: PreferenceType,
    /// Second candidate of a binary preference, or the number of a numeric
    /// indifferent one.
    pub referent: Option<Symbol>,
    pub support: Support,
    /// Producing instantiation. `None` for preferences the kernel adds itself.
    pub instantiation: Option<InstantiationId>,
    /// Goal level the producing match was made at.
    pub level: u32,
}

impl Preference {
    pub fn new(id: Symbol, attr: Symbol, value: Symbol, kind: PreferenceType) -> Self {
        Self {
            id,
            attr,
            value,
            kind,
            referent: None,
            support: Support::I,
            instantiation: None,
            level: 1,
        }
    }

    pub fn with_referent(mut self, referent: Symbol) -> Self {
        self.referent = Some(referent);
        self
    }

    pub fn with_support(mut self, support: Support) -> Self {
        self.support = support;
        self
    }

    pub fn at_level(mut self, level: u32) -> Self {
        self.level = level;
        self
    }

    pub fn describe(&self, table: &SymbolTable) -> String {
        let mut s = format!(
            "({} ^{} {} {}",
            table.display(self.id),
            table.display(self.attr),
            table.display(self.value),
            self.kind
        );
        if let Some(r) = self.referent {
            s.push(' ');
            s.push_str(&table.display(r));
        }
        s.push(')');
        s
    }
}

/// Preferences and bookkeeping for one (id, attr) pair.
#[derive(Debug, Clone)]
pub struct Slot {
    pub id: Symbol,
    pub attr: Symbol,
    /// Operator slot of a goal.
    pub context: bool,
    preferences: IndexSet<PreferenceId>,
}

impl Slot {
    pub fn preferences(&self) -> impl Iterator<Item = PreferenceId> + '_ {
        self.preferences.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.preferences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.preferences.is_empty()
    }
}

type SlotKey = (Symbol, Symbol);

/// All live preferences, indexed by slot.
#[derive(Debug, Default)]
pub struct PreferenceMemory {
    preferences: HashMap<PreferenceId, Preference>,
    slots: IndexMap<SlotKey, Slot>,
    changed: IndexSet<SlotKey>,
    next_id: u64,
}

impl PreferenceMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a preference, creating its slot on first use.
    ///
    /// `context` marks a newly created slot as a goal's operator slot.
    pub fn add(&mut self, pref: Preference, context: bool) -> PreferenceId {
        self.next_id += 1;
        let pid = PreferenceId(self.next_id);
        let key = (pref.id, pref.attr);
        let slot = self.slots.entry(key).or_insert_with(|| Slot {
            id: pref.id,
            attr: pref.attr,
            context,
            preferences: IndexSet::new(),
        });
        slot.preferences.insert(pid);
        self.changed.insert(key);
        self.preferences.insert(pid, pref);
        pid
    }

    /// Remove a preference; destroys its slot when it was the last one.
    pub fn remove(&mut self, pid: PreferenceId) -> Option<Preference> {
        let pref = self.preferences.remove(&pid)?;
        let key = (pref.id, pref.attr);
        let now_empty = match self.slots.get_mut(&key) {
            Some(slot) => {
                slot.preferences.shift_remove(&pid);
                slot.preferences.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.slots.shift_remove(&key);
        }
        self.changed.insert(key);
        Some(pref)
    }

    pub fn get(&self, pid: PreferenceId) -> Option<&Preference> {
        self.preferences.get(&pid)
    }

    pub fn contains(&self, pid: PreferenceId) -> bool {
        self.preferences.contains_key(&pid)
    }

    pub fn slot(&self, id: Symbol, attr: Symbol) -> Option<&Slot> {
        self.slots.get(&(id, attr))
    }

    /// Preferences of one slot, in insertion order.
    pub fn preferences_for(&self, id: Symbol, attr: Symbol) -> Vec<(PreferenceId, &Preference)> {
        self.slot(id, attr)
            .map(|slot| {
                slot.preferences()
                    .filter_map(|pid| self.preferences.get(&pid).map(|p| (pid, p)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Slots whose preferences changed since the last [`take_changed`](Self::take_changed).
    pub fn changed_slots(&self) -> impl Iterator<Item = (Symbol, Symbol)> + '_ {
        self.changed.iter().copied()
    }

    pub fn is_changed(&self, id: Symbol, attr: Symbol) -> bool {
        self.changed.contains(&(id, attr))
    }

    pub fn take_changed(&mut self) -> Vec<(Symbol, Symbol)> {
        self.changed.drain(..).collect()
    }

    /// Clear the changed flag of one slot.
    pub fn mark_decided(&mut self, id: Symbol, attr: Symbol) {
        self.changed.shift_remove(&(id, attr));
    }

    /// Re-flag a slot so the decider visits it again.
    pub fn mark_changed(&mut self, id: Symbol, attr: Symbol) {
        self.changed.insert((id, attr));
    }

    /// O-supported preferences for exactly (id, attr, value).
    pub fn o_supported_matching(&self, id: Symbol, attr: Symbol, value: Symbol) -> Vec<PreferenceId> {
        self.preferences_for(id, attr)
            .into_iter()
            .filter(|(_, p)| p.support == Support::O && p.value == value)
            .map(|(pid, _)| pid)
            .collect()
    }

    /// Preferences made at `level` or deeper.
    pub fn at_or_below(&self, level: u32) -> Vec<PreferenceId> {
        let mut ids: Vec<PreferenceId> = self
            .preferences
            .iter()
            .filter(|(_, p)| p.level >= level)
            .map(|(pid, _)| *pid)
            .collect();
        ids.sort();
        ids
    }

    pub fn iter(&self) -> impl Iterator<Item = (PreferenceId, &Preference)> + '_ {
        self.preferences.iter().map(|(k, v)| (*k, v))
    }

    pub fn len(&self) -> usize {
        self.preferences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.preferences.is_empty()
    }
}
