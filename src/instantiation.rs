//! Instantiations: fired matches and the preferences they produced.
//!
//! Complete matches reported by the network are first held as
//! [`PendingMatch`]es. Firing one evaluates the production's actions against
//! its bindings and records the result as an [`Instantiation`]. When the match
//! goes away the instantiation is retracted: its i-supported preferences are
//! removed, its o-supported ones stay.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};

use crate::error::KernelResult;
use crate::event::KernelEvent;
use crate::kernel::Reasoner;
use crate::preference::{Preference, PreferenceId, PreferenceType};
use crate::production::{Action, ProductionId, RhsFunction, RhsValue, Support};
use crate::rete::{MatchChange, TokenId};
use crate::symbol::{Symbol, SymbolTable, SymbolValue};
use crate::wm::{Supporter, Timetag};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstantiationId(pub u64);

impl std::fmt::Display for InstantiationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "i{}", self.0)
    }
}

/// A production token, identified the way the network reports it.
pub type MatchKey = (ProductionId, TokenId);

/// A complete match that has not fired yet.
#[derive(Debug, Clone)]
pub struct PendingMatch {
    pub production: ProductionId,
    pub token: TokenId,
    pub wmes: Vec<Timetag>,
    pub bindings: Vec<(Symbol, Symbol)>,
    pub support: Support,
}

/// A fired match.
#[derive(Debug, Clone)]
pub struct Instantiation {
    pub id: InstantiationId,
    pub production: ProductionId,
    pub token: TokenId,
    pub wmes: Vec<Timetag>,
    pub bindings: Vec<(Symbol, Symbol)>,
    /// Deepest goal among the matched identifiers.
    pub match_goal: Option<Symbol>,
    pub level: u32,
    pub support: Support,
    pub preferences: Vec<PreferenceId>,
}

/// Match bookkeeping between the network and the firing loop.
#[derive(Debug, Default)]
pub struct MatchSet {
    pub pending: IndexMap<MatchKey, PendingMatch>,
    pub fired: HashMap<MatchKey, InstantiationId>,
    /// Fired instantiations whose match is gone.
    pub retractions: IndexSet<InstantiationId>,
}

impl MatchSet {
    pub fn clear(&mut self) {
        self.pending.clear();
        self.fired.clear();
        self.retractions.clear();
    }
}

// ---------------------------------------------------------------------------
// RHS evaluation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    fn as_f64(self) -> f64 {
        match self {
            Number::Int(i) => i as f64,
            Number::Float(x) => x,
        }
    }
}

/// A preference as produced by one action, before it is stored.
#[derive(Debug, Clone, PartialEq)]
pub struct PreferenceDraft {
    pub id: Symbol,
    pub attr: Symbol,
    pub value: Symbol,
    pub kind: PreferenceType,
    pub referent: Option<Symbol>,
}

/// Evaluates right-hand side values for one firing.
///
/// Every symbol it interns or creates carries one reference owned by the
/// evaluator; [`finish`](Self::finish) hands them back for release once the
/// firing's preferences hold their own references.
pub struct RhsEvaluator<'a> {
    table: &'a mut SymbolTable,
    bindings: HashMap<Symbol, Symbol>,
    created: HashMap<Symbol, Symbol>,
    owned: Vec<Symbol>,
    level: u32,
}

impl<'a> RhsEvaluator<'a> {
    pub fn new(table: &'a mut SymbolTable, bindings: &[(Symbol, Symbol)], level: u32) -> Self {
        Self {
            table,
            bindings: bindings.iter().copied().collect(),
            created: HashMap::new(),
            owned: Vec::new(),
            level,
        }
    }

    pub fn eval(&mut self, value: &RhsValue) -> Result<Symbol, String> {
        match value {
            RhsValue::Symbol(sym) => Ok(self.resolve(*sym)),
            RhsValue::Function { function, args } => {
                let args = args
                    .iter()
                    .map(|a| self.eval(a))
                    .collect::<Result<Vec<_>, _>>()?;
                self.call(*function, &args)
            }
        }
    }

    fn resolve(&mut self, sym: Symbol) -> Symbol {
        let name = match self.table.value(sym) {
            Some(SymbolValue::Variable(name)) => name.clone(),
            _ => return sym,
        };
        if let Some(bound) = self.bindings.get(&sym) {
            return *bound;
        }
        if let Some(made) = self.created.get(&sym) {
            return *made;
        }
        let letter = name.chars().next().unwrap_or('I');
        let id = self.table.new_identifier(letter);
        self.table.promote_level(id, self.level);
        self.created.insert(sym, id);
        self.owned.push(id);
        id
    }

    fn number(&self, sym: Symbol, function: RhsFunction) -> Result<Number, String> {
        match self.table.value(sym) {
            Some(SymbolValue::Int(i)) => Ok(Number::Int(*i)),
            Some(SymbolValue::Float(x)) => Ok(Number::Float(*x)),
            _ => Err(format!(
                "non-numeric argument {} to {}",
                self.table.display(sym),
                function.name()
            )),
        }
    }

    fn call(&mut self, function: RhsFunction, args: &[Symbol]) -> Result<Symbol, String> {
        if function == RhsFunction::Concat {
            let text: String = args.iter().map(|a| self.table.display(*a)).collect();
            let sym = self.table.intern_str(&text);
            self.owned.push(sym);
            return Ok(sym);
        }
        let nums = args
            .iter()
            .map(|a| self.number(*a, function))
            .collect::<Result<Vec<_>, _>>()?;
        let result = arithmetic(function, &nums)?;
        let sym = match result {
            Number::Int(i) => self.table.intern_int(i),
            Number::Float(x) => self.table.intern_float(x),
        };
        self.owned.push(sym);
        Ok(sym)
    }

    /// Evaluate a make-preference action.
    pub fn preference(
        &mut self,
        id: &RhsValue,
        attr: &RhsValue,
        value: &RhsValue,
        kind: PreferenceType,
        referent: Option<&RhsValue>,
    ) -> Result<PreferenceDraft, String> {
        let id = self.eval(id)?;
        if !self.table.is_identifier(id) {
            return Err(format!(
                "preference id {} is not an identifier",
                self.table.display(id)
            ));
        }
        let attr = self.eval(attr)?;
        let value = self.eval(value)?;
        let referent = referent.map(|r| self.eval(r)).transpose()?;
        if (kind.is_binary() || kind == PreferenceType::NumericIndifferent) && referent.is_none() {
            return Err(format!("{kind} preference on {} needs a referent", self.table.display(value)));
        }
        Ok(PreferenceDraft {
            id,
            attr,
            value,
            kind,
            referent,
        })
    }

    /// Concatenated text of a write action.
    pub fn text(&mut self, values: &[RhsValue]) -> Result<String, String> {
        let mut out = String::new();
        for v in values {
            let sym = self.eval(v)?;
            out.push_str(&self.table.display(sym));
        }
        Ok(out)
    }

    /// Symbols whose evaluator reference must be released.
    pub fn finish(self) -> Vec<Symbol> {
        self.owned
    }
}

fn arithmetic(function: RhsFunction, nums: &[Number]) -> Result<Number, String> {
    let all_int = nums.iter().all(|n| matches!(n, Number::Int(_)));
    let overflow = || format!("integer overflow in {}", function.name());
    let Some((&first, rest)) = nums.split_first() else {
        return Err(format!("{} needs arguments", function.name()));
    };
    match function {
        RhsFunction::Add | RhsFunction::Multiply if all_int => {
            let mut acc: i64 = if function == RhsFunction::Add { 0 } else { 1 };
            for n in nums {
                let Number::Int(i) = n else { continue };
                acc = if function == RhsFunction::Add {
                    acc.checked_add(*i)
                } else {
                    acc.checked_mul(*i)
                }
                .ok_or_else(overflow)?;
            }
            Ok(Number::Int(acc))
        }
        RhsFunction::Add => Ok(Number::Float(nums.iter().map(|n| n.as_f64()).sum())),
        RhsFunction::Multiply => Ok(Number::Float(nums.iter().map(|n| n.as_f64()).product())),
        RhsFunction::Subtract if rest.is_empty() => match first {
            Number::Int(i) => i.checked_neg().map(Number::Int).ok_or_else(overflow),
            Number::Float(x) => Ok(Number::Float(-x)),
        },
        RhsFunction::Subtract if all_int => {
            let mut acc = match first {
                Number::Int(i) => i,
                Number::Float(_) => 0,
            };
            for n in rest {
                if let Number::Int(i) = n {
                    acc = acc.checked_sub(*i).ok_or_else(overflow)?;
                }
            }
            Ok(Number::Int(acc))
        }
        RhsFunction::Subtract => Ok(Number::Float(
            rest.iter().fold(first.as_f64(), |acc, n| acc - n.as_f64()),
        )),
        RhsFunction::Divide => {
            if rest.iter().any(|n| n.as_f64() == 0.0) {
                return Err("division by zero".to_string());
            }
            if all_int {
                let mut acc = match first {
                    Number::Int(i) => i,
                    Number::Float(_) => 0,
                };
                let mut exact = true;
                for n in rest {
                    if let Number::Int(i) = n {
                        match (acc.checked_rem(*i), acc.checked_div(*i)) {
                            (Some(0), Some(q)) => acc = q,
                            _ => {
                                exact = false;
                                break;
                            }
                        }
                    }
                }
                if exact {
                    return Ok(Number::Int(acc));
                }
            }
            Ok(Number::Float(
                rest.iter().fold(first.as_f64(), |acc, n| acc / n.as_f64()),
            ))
        }
        RhsFunction::Concat => Err("concat is not arithmetic".to_string()),
    }
}

// ---------------------------------------------------------------------------
// Match absorption, firing and retraction
// ---------------------------------------------------------------------------

impl Reasoner {
    /// Move the network's match changes into the match set.
    ///
    /// An assert and a retract of the same token within one batch cancel each
    /// other and produce no events.
    pub(crate) fn absorb_matches(&mut self) -> KernelResult<()> {
        let changes = self.rete.drain_changes();
        if changes.is_empty() {
            return Ok(());
        }
        let mut asserts: IndexMap<MatchKey, MatchChange> = IndexMap::new();
        let mut retracts: Vec<MatchKey> = Vec::new();
        for change in changes {
            match change {
                MatchChange::Assert {
                    production, token, ..
                } => {
                    asserts.insert((production, token), change);
                }
                MatchChange::Retract { production, token } => {
                    if asserts.shift_remove(&(production, token)).is_none() {
                        retracts.push((production, token));
                    }
                }
            }
        }

        for key in retracts {
            if self.matches.pending.shift_remove(&key).is_some() {
                self.emit(KernelEvent::InstantiationRetracted {
                    production: self.production_name(key.0),
                    token: key.1.0,
                    fired: false,
                });
            } else if let Some(inst) = self.matches.fired.remove(&key) {
                self.matches.retractions.insert(inst);
            }
        }

        for (key, change) in asserts {
            let MatchChange::Assert { wmes, bindings, .. } = change else {
                continue;
            };
            let Some(support) = self.productions.get(&key.0).map(|p| p.support) else {
                continue;
            };
            tracing::trace!(production = %key.0, token = %key.1, "match asserted");
            self.matches.pending.insert(
                key,
                PendingMatch {
                    production: key.0,
                    token: key.1,
                    wmes,
                    bindings,
                    support,
                },
            );
            self.emit(KernelEvent::InstantiationMatched {
                production: self.production_name(key.0),
                token: key.1.0,
            });
        }
        Ok(())
    }

    /// Goal level a match is made at: the deepest level among its identifiers.
    fn match_level(&self, wmes: &[Timetag]) -> u32 {
        wmes.iter()
            .filter_map(|tt| self.wm.get(*tt))
            .filter_map(|w| self.symbols.goal_level(w.id))
            .max()
            .unwrap_or(1)
    }

    /// Fire a pending match.
    pub(crate) fn fire(&mut self, m: PendingMatch) -> KernelResult<()> {
        let Some(def) = self.productions.get(&m.production).map(|p| Arc::clone(&p.def)) else {
            return Ok(());
        };
        let level = self.match_level(&m.wmes);
        let match_goal = self.goals.at_level(level).map(|g| g.id);
        self.next_instantiation += 1;
        let id = InstantiationId(self.next_instantiation);

        let mut drafts = Vec::new();
        let mut writes = Vec::new();
        let mut failures = Vec::new();
        let mut halt = false;
        let mut eval = RhsEvaluator::new(&mut self.symbols, &m.bindings, level);
        for action in &def.actions {
            match action {
                Action::MakePreference {
                    id,
                    attr,
                    value,
                    kind,
                    referent,
                } => match eval.preference(id, attr, value, *kind, referent.as_ref()) {
                    Ok(draft) => drafts.push(draft),
                    Err(message) => failures.push(message),
                },
                Action::Halt => halt = true,
                Action::Write(values) => match eval.text(values) {
                    Ok(text) => writes.push(text),
                    Err(message) => failures.push(message),
                },
            }
        }
        let owned = eval.finish();

        let preferences: Vec<Preference> = drafts
            .into_iter()
            .map(|d| Preference {
                id: d.id,
                attr: d.attr,
                value: d.value,
                kind: d.kind,
                referent: d.referent,
                support: m.support,
                instantiation: Some(id),
                level: self.symbols.goal_level(d.id).unwrap_or(level),
            })
            .collect();

        tracing::debug!(
            production = %def.name,
            instantiation = %id,
            level,
            support = ?m.support,
            "production fired"
        );
        let described = if self.has_sinks() {
            preferences.iter().map(|p| p.describe(&self.symbols)).collect()
        } else {
            Vec::new()
        };
        self.emit(KernelEvent::ProductionFired {
            production: def.name.clone(),
            instantiation: id.0,
            support: m.support,
            level,
            preferences: described,
        });

        let local_o_support = m.support == Support::O
            && level > 1
            && preferences.iter().any(|p| p.level >= level);
        let mut stored = Vec::new();
        for pref in preferences {
            if let Some(pid) = self.add_preference(pref)? {
                stored.push(pid);
            }
        }
        if local_o_support {
            self.extend_gds(level, &m.wmes);
        }
        for sym in owned {
            self.symbols.release(sym)?;
        }

        if let Some(p) = self.productions.get_mut(&m.production) {
            p.firings += 1;
        }
        self.matches.fired.insert((m.production, m.token), id);
        self.instantiations.insert(
            id,
            Instantiation {
                id,
                production: m.production,
                token: m.token,
                wmes: m.wmes,
                bindings: m.bindings,
                match_goal,
                level,
                support: m.support,
                preferences: stored,
            },
        );

        for text in writes {
            self.emit(KernelEvent::Write {
                production: def.name.clone(),
                text,
            });
        }
        for message in failures {
            tracing::warn!(production = %def.name, %message, "action failed");
            self.emit(KernelEvent::ActionFailed {
                production: def.name.clone(),
                message,
            });
        }
        if halt {
            self.halt_with(format!("halt in {}", def.name));
        }
        Ok(())
    }

    /// Retract a fired instantiation whose match is gone.
    pub(crate) fn retract_instantiation(&mut self, id: InstantiationId) -> KernelResult<()> {
        let Some(inst) = self.instantiations.shift_remove(&id) else {
            return Ok(());
        };
        for pid in &inst.preferences {
            if self.prefs.get(*pid).is_some_and(|p| p.support == Support::I) {
                self.remove_preference(*pid)?;
            }
        }
        tracing::debug!(production = %inst.production, instantiation = %id, "instantiation retracted");
        self.emit(KernelEvent::InstantiationRetracted {
            production: self.production_name(inst.production),
            token: inst.token.0,
            fired: true,
        });
        Ok(())
    }

    /// Add the superstate elements behind a sub-goal's persistent result to
    /// that goal's dependency set.
    ///
    /// Elements local to the goal are traced back through the i-supported
    /// preferences that produced them.
    fn extend_gds(&mut self, level: u32, wmes: &[Timetag]) {
        let mut stack: Vec<Timetag> = wmes.to_vec();
        let mut seen: HashSet<Timetag> = HashSet::new();
        let mut found: Vec<Timetag> = Vec::new();
        while let Some(tt) = stack.pop() {
            if !seen.insert(tt) {
                continue;
            }
            let Some(wme) = self.wm.get(tt) else { continue };
            match self.symbols.goal_level(wme.id) {
                Some(l) if l < level => found.push(tt),
                Some(l) if l == level => {
                    for supporter in self.wm.supporters(tt) {
                        let Supporter::Preference(pid) = supporter else {
                            continue;
                        };
                        let Some(pref) = self.prefs.get(*pid) else { continue };
                        if pref.support != Support::I {
                            continue;
                        }
                        if let Some(inst) = pref.instantiation.and_then(|i| self.instantiations.get(&i)) {
                            stack.extend(inst.wmes.iter().copied());
                        }
                    }
                }
                _ => {}
            }
        }
        if found.is_empty() {
            return;
        }
        tracing::trace!(level, count = found.len(), "goal dependency set extended");
        if let Some(goal) = self.goals.at_level_mut(level) {
            goal.gds.extend(found);
        }
    }
}
