//! The decider: turns slot preferences into working memory and goal changes.
//!
//! Non-context slots are decided after every elaboration wave. The operator
//! slot of each goal is decided once per DECISION phase; a slot that cannot
//! be decided creates an impasse sub-goal. Goal removal cleans up everything
//! that belongs to the removed levels.

use crate::cycle::StopReason;
use crate::error::KernelResult;
use crate::event::KernelEvent;
use crate::goal::{Goal, Impasse, ImpasseAttribute, ImpasseKind};
use crate::kernel::Reasoner;
use crate::preference::{Preference, PreferenceId, PreferenceType};
use crate::semantics::{SemanticsResult, run_preference_semantics};
use crate::symbol::Symbol;
use crate::wm::{Supporter, Timetag};

impl Reasoner {
    /// Whether (id, attr) is a goal's operator slot.
    pub(crate) fn is_context_key(&self, id: Symbol, attr: Symbol) -> bool {
        attr == self.predefined.operator && self.symbols.is_goal(id)
    }

    fn slot_semantics(&self, id: Symbol, attr: Symbol, context: bool) -> SemanticsResult {
        let prefs = self.prefs.preferences_for(id, attr);
        let refs: Vec<&Preference> = prefs.iter().map(|(_, p)| *p).collect();
        run_preference_semantics(&refs, context, &self.symbols)
    }

    // -----------------------------------------------------------------------
    // After every elaboration wave
    // -----------------------------------------------------------------------

    pub(crate) fn process_slot_changes(&mut self) -> KernelResult<()> {
        self.decide_non_context_slots()?;
        self.check_selected_operators()?;
        self.process_gds_violations()
    }

    /// Bring the elements of every changed non-context slot in line with its
    /// winners.
    fn decide_non_context_slots(&mut self) -> KernelResult<()> {
        let changed: Vec<(Symbol, Symbol)> = self
            .prefs
            .changed_slots()
            .filter(|&(id, attr)| !self.is_context_key(id, attr))
            .collect();
        for (id, attr) in changed {
            self.prefs.mark_decided(id, attr);
            let winners = match self.slot_semantics(id, attr, false) {
                SemanticsResult::Winners(w) => w,
                _ => Vec::new(),
            };
            let supporting: Vec<(PreferenceId, Symbol)> = self
                .prefs
                .preferences_for(id, attr)
                .into_iter()
                .filter(|(_, p)| {
                    matches!(p.kind, PreferenceType::Acceptable | PreferenceType::Require)
                        && winners.contains(&p.value)
                })
                .map(|(pid, p)| (pid, p.value))
                .collect();
            let stale: Vec<Timetag> = self
                .wm
                .query(Some(id), Some(attr), None)
                .filter(|w| !w.acceptable && !winners.contains(&w.value))
                .filter(|w| {
                    self.wm
                        .supporters(w.timetag)
                        .iter()
                        .all(|s| matches!(s, Supporter::Preference(_)))
                })
                .map(|w| w.timetag)
                .collect();
            for tt in stale {
                self.remove_wme_internal(tt)?;
            }
            for (pid, value) in supporting {
                if !self.wm.is_supporting(pid) {
                    self.add_wme_internal(id, attr, value, false, Supporter::Preference(pid))?;
                }
            }
        }
        Ok(())
    }

    /// Deselect operators that are no longer candidates of their slot.
    fn check_selected_operators(&mut self) -> KernelResult<()> {
        let operator = self.predefined.operator;
        let selected: Vec<(u32, Symbol, Symbol)> = self
            .goals
            .iter()
            .filter_map(|g| g.operator.map(|(op, _)| (g.level, g.id, op)))
            .collect();
        for (level, goal, op) in selected {
            if self.goals.at_level(level).map(|g| g.id) != Some(goal) {
                continue;
            }
            if !self.prefs.is_changed(goal, operator) {
                continue;
            }
            let reconsidered: Vec<PreferenceId> = self
                .prefs
                .preferences_for(goal, operator)
                .into_iter()
                .filter(|(_, p)| p.kind == PreferenceType::Reconsider && p.value == op)
                .map(|(pid, _)| pid)
                .collect();
            let still_candidate = match self.slot_semantics(goal, operator, true) {
                SemanticsResult::Selected(v) => v == op,
                SemanticsResult::Indifferent(cands) => cands.iter().any(|c| c.value == op),
                SemanticsResult::Impasse {
                    kind: ImpasseKind::Tie,
                    items,
                } => items.contains(&op),
                _ => false,
            };
            if still_candidate && reconsidered.is_empty() {
                continue;
            }
            tracing::debug!(
                goal = %self.symbols.display(goal),
                operator = %self.symbols.display(op),
                "selected operator no longer consistent"
            );
            for pid in reconsidered {
                self.remove_preference(pid)?;
            }
            self.deselect_operator(level)?;
        }
        Ok(())
    }

    fn deselect_operator(&mut self, level: u32) -> KernelResult<()> {
        self.remove_goals_from(level + 1)?;
        let Some(goal) = self.goals.at_level_mut(level) else {
            return Ok(());
        };
        let id = goal.id;
        if let Some((_, tt)) = goal.operator.take() {
            self.remove_wme_internal(tt)?;
        }
        self.prefs.mark_changed(id, self.predefined.operator);
        Ok(())
    }

    /// Remove goals whose dependency set lost an element.
    pub(crate) fn process_gds_violations(&mut self) -> KernelResult<()> {
        while let Some(level) = self.pending_gds.iter().copied().min() {
            self.pending_gds.clear();
            if self.goals.at_level(level).is_none() {
                continue;
            }
            let Some(parent) = self.goals.at_level(level - 1).map(|g| g.id) else {
                continue;
            };
            tracing::debug!(level, "goal dependency set changed, removing sub-goal");
            self.remove_goals_from(level)?;
            self.prefs.mark_changed(parent, self.predefined.operator);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // DECISION phase
    // -----------------------------------------------------------------------

    /// Decide the highest decidable operator slot, or extend the goal stack
    /// with a no-change impasse when nothing is decidable.
    pub(crate) fn run_decision(&mut self) -> KernelResult<Option<StopReason>> {
        let operator = self.predefined.operator;
        let decidable = self
            .goals
            .iter()
            .find(|g| g.operator.is_none() && self.prefs.is_changed(g.id, operator))
            .map(|g| (g.level, g.id));

        let stop = match decidable {
            Some((level, goal)) => {
                self.prefs.mark_decided(goal, operator);
                match self.slot_semantics(goal, operator, true) {
                    SemanticsResult::Selected(value) => self.select_operator(level, value)?,
                    SemanticsResult::Indifferent(candidates) => {
                        match self.selection.select(&candidates) {
                            Some(value) => {
                                tracing::debug!(
                                    policy = self.selection.name(),
                                    candidates = candidates.len(),
                                    "indifferent selection"
                                );
                                self.select_operator(level, value)?
                            }
                            None => self.state_no_change(level)?,
                        }
                    }
                    SemanticsResult::Impasse { kind, items } => {
                        self.impasse(level, kind, ImpasseAttribute::Operator, items)?
                    }
                    SemanticsResult::NoCandidates | SemanticsResult::Winners(_) => {
                        self.state_no_change(level)?
                    }
                }
            }
            None => match self.goals.bottom().map(|g| (g.level, g.operator.is_some())) {
                Some((level, true)) => {
                    self.impasse(level, ImpasseKind::NoChange, ImpasseAttribute::Operator, Vec::new())?
                }
                Some((level, false)) => self.state_no_change(level)?,
                None => None,
            },
        };
        self.process_gds_violations()?;
        Ok(stop)
    }

    fn state_no_change(&mut self, level: u32) -> KernelResult<Option<StopReason>> {
        if self.config.wait_on_state_no_change {
            return Ok(None);
        }
        self.impasse(level, ImpasseKind::NoChange, ImpasseAttribute::State, Vec::new())
    }

    fn select_operator(&mut self, level: u32, value: Symbol) -> KernelResult<Option<StopReason>> {
        self.remove_goals_from(level + 1)?;
        let Some(goal) = self.goals.at_level(level).map(|g| g.id) else {
            return Ok(None);
        };
        let operator = self.predefined.operator;
        let tt = self.add_wme_internal(goal, operator, value, false, Supporter::Architecture)?;
        if let Some(g) = self.goals.at_level_mut(level) {
            g.operator = Some((value, tt));
        }
        tracing::debug!(
            goal = %self.symbols.display(goal),
            operator = %self.symbols.display(value),
            "operator selected"
        );
        self.emit(KernelEvent::SlotDecided {
            goal: self.symbols.display(goal),
            attr: self.symbols.display(operator),
            value: self.symbols.display(value),
        });
        Ok(None)
    }

    /// Record an impasse on the goal at `level`.
    ///
    /// An identical impasse already below it only has its items refreshed.
    fn impasse(
        &mut self,
        level: u32,
        kind: ImpasseKind,
        attribute: ImpasseAttribute,
        items: Vec<Symbol>,
    ) -> KernelResult<Option<StopReason>> {
        let impasse = Impasse { kind, attribute };
        let sub_level = level + 1;
        if let Some(sub) = self.goals.at_level(sub_level) {
            if sub.impasse.as_ref() == Some(&impasse) {
                self.update_items(sub_level, &items)?;
                return Ok(None);
            }
        }
        self.remove_goals_from(sub_level)?;
        if sub_level > self.config.max_goal_depth {
            let reason = format!(
                "goal depth {sub_level} exceeds max_goal_depth {}",
                self.config.max_goal_depth
            );
            tracing::warn!(%reason, "goal stack limit reached");
            self.halt_with(reason);
            return Ok(Some(StopReason::MaxGoalDepth));
        }
        self.create_goal(sub_level, impasse, &items)?;
        Ok(None)
    }

    fn create_goal(&mut self, level: u32, impasse: Impasse, items: &[Symbol]) -> KernelResult<()> {
        let Some(superstate) = self.goals.at_level(level - 1).map(|g| g.id) else {
            return Ok(());
        };
        let id = self.symbols.new_identifier('S');
        self.symbols.set_goal(id, true);
        self.symbols.set_goal_level(id, level);
        self.goals.push(Goal::new(id, level, Some(impasse.clone())));

        let p = self.predefined;
        let choices = match impasse.kind {
            ImpasseKind::NoChange => p.none,
            _ => p.multiple,
        };
        let structure = [
            (p.type_, p.state),
            (p.superstate, superstate),
            (p.impasse, impasse.kind.symbol(&p)),
            (p.attribute, impasse.attribute.symbol(&p)),
            (p.choices, choices),
            (p.quiescence, p.t),
        ];
        let mut tts = Vec::with_capacity(structure.len());
        for (attr, value) in structure {
            tts.push(self.add_wme_internal(id, attr, value, false, Supporter::Architecture)?);
        }
        if let Some(goal) = self.goals.at_level_mut(level) {
            goal.structure = tts;
        }
        self.update_items(level, items)?;

        tracing::debug!(
            goal = %self.symbols.display(id),
            level,
            kind = %impasse.kind,
            items = items.len(),
            "impasse created"
        );
        self.emit(KernelEvent::ImpasseCreated {
            goal: self.symbols.display(id),
            superstate: self.symbols.display(superstate),
            level,
            kind: impasse.kind,
            attribute: impasse.attribute,
            items: items.iter().map(|s| self.symbols.display(*s)).collect(),
        });
        Ok(())
    }

    /// Make the goal's `^item` elements exactly `items`.
    fn update_items(&mut self, level: u32, items: &[Symbol]) -> KernelResult<()> {
        let Some(goal) = self.goals.at_level(level) else {
            return Ok(());
        };
        let id = goal.id;
        let stale: Vec<(Symbol, Timetag)> = goal
            .items
            .iter()
            .filter(|(v, _)| !items.contains(v))
            .map(|(v, tt)| (*v, *tt))
            .collect();
        for (value, tt) in stale {
            self.remove_wme_internal(tt)?;
            if let Some(g) = self.goals.at_level_mut(level) {
                g.items.shift_remove(&value);
            }
        }
        let item = self.predefined.item;
        for &value in items {
            let present = self
                .goals
                .at_level(level)
                .is_some_and(|g| g.items.contains_key(&value));
            if present {
                continue;
            }
            let tt = self.add_wme_internal(id, item, value, false, Supporter::Architecture)?;
            if let Some(g) = self.goals.at_level_mut(level) {
                g.items.insert(value, tt);
            }
        }
        Ok(())
    }

    /// Remove the goal at `level` and every goal below it, together with the
    /// preferences and architecture elements that belong to them.
    ///
    /// The top state is never removed.
    pub(crate) fn remove_goals_from(&mut self, level: u32) -> KernelResult<()> {
        if level <= 1 || self.goals.at_level(level).is_none() {
            return Ok(());
        }
        let removed = self.goals.split_off(level);
        for pid in self.prefs.at_or_below(level) {
            self.remove_preference(pid)?;
        }
        for goal in removed {
            if let Some((_, tt)) = goal.operator {
                self.remove_wme_internal(tt)?;
            }
            for tt in goal.items.values() {
                self.remove_wme_internal(*tt)?;
            }
            for tt in &goal.structure {
                self.remove_wme_internal(*tt)?;
            }
            let leftovers: Vec<Timetag> = self
                .wm
                .query(Some(goal.id), None, None)
                .map(|w| w.timetag)
                .collect();
            for tt in leftovers {
                self.remove_wme_internal(tt)?;
            }
            self.symbols.set_goal(goal.id, false);
            tracing::debug!(goal = %self.symbols.display(goal.id), level = goal.level, "impasse removed");
            self.emit(KernelEvent::ImpasseRemoved {
                goal: self.symbols.display(goal.id),
                level: goal.level,
            });
            self.symbols.release(goal.id)?;
        }
        Ok(())
    }
}
