//! The reasoner: one self-contained production-system instance.
//!
//! A `Reasoner` owns the symbol table, working memory, match network,
//! preference memory and goal stack, and runs the decision cycle over them.
//! Everything is single-threaded; other threads interact only through the
//! [`InputQueue`], the [`StopHandle`] and owned [`KernelSnapshot`]s.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::config::KernelConfig;
use crate::cycle::{Phase, PhaseReport, StopHandle, StopReason};
use crate::error::{CycleError, KernelResult, ProductionError, SymbolError};
use crate::event::{EventSink, KernelEvent};
use crate::exploration::{Exploration, SelectionPolicy};
use crate::goal::{Goal, GoalStack, ImpasseAttribute, ImpasseKind};
use crate::instantiation::{Instantiation, InstantiationId, MatchSet};
use crate::io::{InputQueue, InputRequest, InputValue};
use crate::loader::{RuleSpec, build_production};
use crate::preference::{Preference, PreferenceId, PreferenceMemory, PreferenceType};
use crate::production::{Production, ProductionId, Support};
use crate::rete::{NodeId, Rete, ReteStats};
use crate::symbol::{PredefinedSymbols, Symbol, SymbolTable};
use crate::wm::{Supporter, Timetag, Wme, WmeAdd, WorkingMemory};

/// A production loaded into the reasoner.
#[derive(Debug, Clone)]
pub struct LoadedProduction {
    pub def: Arc<Production>,
    pub node: NodeId,
    pub support: Support,
    pub firings: u64,
}

/// Identifiers of the top state's io structure.
#[derive(Debug, Clone, Copy)]
pub struct IoLinks {
    pub top: Symbol,
    pub io: Symbol,
    pub input_link: Symbol,
    pub output_link: Symbol,
}

/// The production-system instance.
pub struct Reasoner {
    pub(crate) config: KernelConfig,
    pub(crate) symbols: SymbolTable,
    pub(crate) predefined: PredefinedSymbols,
    pub(crate) wm: WorkingMemory,
    pub(crate) rete: Rete,
    pub(crate) prefs: PreferenceMemory,
    pub(crate) goals: GoalStack,
    pub(crate) productions: IndexMap<ProductionId, LoadedProduction>,
    names: HashMap<String, ProductionId>,
    next_production: u32,
    pub(crate) matches: MatchSet,
    pub(crate) instantiations: IndexMap<InstantiationId, Instantiation>,
    pub(crate) next_instantiation: u64,
    pub(crate) selection: Box<dyn SelectionPolicy>,
    sinks: Vec<Arc<dyn EventSink>>,
    input: InputQueue,
    stop: StopHandle,
    links: IoLinks,
    phase: Phase,
    cycle: u64,
    halted: Option<String>,
    in_phase: bool,
    /// Output-link elements seen by the previous OUTPUT phase.
    output_seen: IndexMap<Timetag, String>,
    /// Goal levels whose dependency set lost an element.
    pub(crate) pending_gds: Vec<u32>,
    /// Count of working memory additions and removals.
    wm_changes: u64,
}

impl std::fmt::Debug for Reasoner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reasoner")
            .field("phase", &self.phase)
            .field("cycle", &self.cycle)
            .field("wmes", &self.wm.len())
            .field("preferences", &self.prefs.len())
            .field("productions", &self.productions.len())
            .field("goal_depth", &self.goals.depth())
            .field("halted", &self.halted)
            .finish()
    }
}

impl Reasoner {
    /// Create a reasoner with the top state `S1` and its io links.
    pub fn new(config: KernelConfig) -> KernelResult<Self> {
        config.validate()?;
        let mut symbols = SymbolTable::new();
        let predefined = PredefinedSymbols::new(&mut symbols);
        let top = symbols.new_identifier('S');
        symbols.set_goal(top, true);
        symbols.set_goal_level(top, 1);
        let links = IoLinks {
            top,
            io: symbols.new_identifier('I'),
            input_link: symbols.new_identifier('I'),
            output_link: symbols.new_identifier('I'),
        };
        let mut goals = GoalStack::new();
        goals.push(Goal::new(top, 1, None));
        let selection: Box<dyn SelectionPolicy> = Box::new(Exploration::from_config(&config)?);

        let mut reasoner = Self {
            config,
            symbols,
            predefined,
            wm: WorkingMemory::new(),
            rete: Rete::new(),
            prefs: PreferenceMemory::new(),
            goals,
            productions: IndexMap::new(),
            names: HashMap::new(),
            next_production: 0,
            matches: MatchSet::default(),
            instantiations: IndexMap::new(),
            next_instantiation: 0,
            selection,
            sinks: Vec::new(),
            input: InputQueue::new(),
            stop: StopHandle::new(),
            links,
            phase: Phase::Input,
            cycle: 0,
            halted: None,
            in_phase: false,
            output_seen: IndexMap::new(),
            pending_gds: Vec::new(),
            wm_changes: 0,
        };
        reasoner.build_top_state()?;
        tracing::info!(
            exploration = %reasoner.config.exploration,
            max_elaborations = reasoner.config.max_elaborations,
            max_goal_depth = reasoner.config.max_goal_depth,
            "reasoner created"
        );
        Ok(reasoner)
    }

    fn build_top_state(&mut self) -> KernelResult<()> {
        let p = self.predefined;
        let IoLinks {
            top,
            io,
            input_link,
            output_link,
        } = self.links;
        let mut structure = Vec::new();
        for (id, attr, value) in [
            (top, p.type_, p.state),
            (top, p.superstate, p.nil),
            (top, p.io, io),
            (io, p.input_link, input_link),
            (io, p.output_link, output_link),
        ] {
            structure.push(self.add_wme_internal(id, attr, value, false, Supporter::Architecture)?);
        }
        if let Some(goal) = self.goals.at_level_mut(1) {
            goal.structure = structure;
        }
        Ok(())
    }

    /// Replace the tie-breaking policy for indifferent candidates.
    pub fn set_selection_policy(&mut self, policy: Box<dyn SelectionPolicy>) {
        self.selection = policy;
    }

    pub fn add_sink(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }

    pub(crate) fn has_sinks(&self) -> bool {
        !self.sinks.is_empty()
    }

    pub(crate) fn emit(&self, event: KernelEvent) {
        for sink in &self.sinks {
            sink.emit(&event);
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    /// Mutable access for interning rule symbols.
    pub fn symbols_mut(&mut self) -> &mut SymbolTable {
        &mut self.symbols
    }

    pub fn predefined(&self) -> &PredefinedSymbols {
        &self.predefined
    }

    pub fn top_state(&self) -> Symbol {
        self.links.top
    }

    pub fn io_links(&self) -> IoLinks {
        self.links
    }

    pub fn input_link(&self) -> Symbol {
        self.links.input_link
    }

    pub fn output_link(&self) -> Symbol {
        self.links.output_link
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Completed decision cycles.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    pub fn halt_reason(&self) -> Option<&str> {
        self.halted.as_deref()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn input_queue(&self) -> InputQueue {
        self.input.clone()
    }

    pub fn queue_input(&self, request: InputRequest) {
        self.input.push(request);
    }

    pub fn wmes(&self) -> impl Iterator<Item = &Wme> + '_ {
        self.wm.iter()
    }

    pub fn query(
        &self,
        id: Option<Symbol>,
        attr: Option<Symbol>,
        value: Option<Symbol>,
    ) -> Vec<&Wme> {
        self.wm.query(id, attr, value).collect()
    }

    pub fn supporters(&self, tt: Timetag) -> &[Supporter] {
        self.wm.supporters(tt)
    }

    pub fn preferences_for(&self, id: Symbol, attr: Symbol) -> Vec<(PreferenceId, &Preference)> {
        self.prefs.preferences_for(id, attr)
    }

    pub fn preference_count(&self) -> usize {
        self.prefs.len()
    }

    pub fn rete_stats(&self) -> ReteStats {
        self.rete.stats()
    }

    pub fn goal_stack(&self) -> &GoalStack {
        &self.goals
    }

    pub fn instantiations(&self) -> impl Iterator<Item = &Instantiation> + '_ {
        self.instantiations.values()
    }

    /// Complete matches not yet fired.
    pub fn pending_matches(&self) -> usize {
        self.matches.pending.len()
    }

    pub fn production(&self, name: &str) -> Option<&LoadedProduction> {
        self.names.get(name).and_then(|id| self.productions.get(id))
    }

    pub fn productions(&self) -> impl Iterator<Item = (ProductionId, &LoadedProduction)> + '_ {
        self.productions.iter().map(|(id, p)| (*id, p))
    }

    /// Current complete matches of a production, as matched timetags.
    pub fn matches_of(&self, name: &str) -> Vec<Vec<Timetag>> {
        self.production(name)
            .map(|p| self.rete.matches(p.node))
            .unwrap_or_default()
    }

    pub(crate) fn production_name(&self, id: ProductionId) -> String {
        self.productions
            .get(&id)
            .map(|p| p.def.name.clone())
            .unwrap_or_else(|| id.to_string())
    }

    /// `(S1 ^type state)` style rendering; acceptable elements get a `+`.
    pub fn describe_wme(&self, wme: &Wme) -> String {
        let mut s = format!(
            "{} ^{} {}",
            self.symbols.display(wme.id),
            self.symbols.display(wme.attr),
            self.symbols.display(wme.value)
        );
        if wme.acceptable {
            s.push_str(" +");
        }
        s
    }

    // -----------------------------------------------------------------------
    // Productions
    // -----------------------------------------------------------------------

    /// Compile and load a production. Matches against current working memory
    /// become pending immediately.
    pub fn add_production(&mut self, def: Production) -> KernelResult<ProductionId> {
        if self.names.contains_key(&def.name) {
            return Err(ProductionError::Duplicate { name: def.name }.into());
        }
        let id = ProductionId(self.next_production);
        let node = self.rete.compile(id, &def, &self.symbols)?;
        self.next_production += 1;
        for sym in def.symbols() {
            self.symbols.add_ref(sym)?;
        }
        let support = def.support(&self.predefined);
        tracing::debug!(production = %def.name, id = %id, support = ?support, "production added");
        self.names.insert(def.name.clone(), id);
        self.productions.insert(
            id,
            LoadedProduction {
                def: Arc::new(def),
                node,
                support,
                firings: 0,
            },
        );
        self.absorb_matches()?;
        Ok(id)
    }

    /// Build and load productions from rule specs. Stops at the first error;
    /// productions loaded before it stay loaded.
    pub fn load_rules(&mut self, specs: &[RuleSpec]) -> KernelResult<Vec<ProductionId>> {
        let mut ids = Vec::with_capacity(specs.len());
        for spec in specs {
            let def = build_production(spec, &mut self.symbols)?;
            let symbols = def.symbols();
            let result = self.add_production(def);
            // Interning during the build took one reference per occurrence;
            // the loaded production holds its own.
            for sym in symbols {
                self.symbols.release(sym)?;
            }
            ids.push(result?);
        }
        tracing::info!(count = ids.len(), "rules loaded");
        Ok(ids)
    }

    /// Remove a production. Its fired instantiations are retracted at once.
    pub fn excise_production(&mut self, name: &str) -> KernelResult<()> {
        let id = *self
            .names
            .get(name)
            .ok_or_else(|| ProductionError::NotFound {
                name: name.to_string(),
            })?;
        let node = self
            .productions
            .get(&id)
            .map(|p| p.node)
            .ok_or_else(|| ProductionError::NotFound {
                name: name.to_string(),
            })?;
        self.rete.excise(node, &self.symbols)?;
        self.absorb_matches()?;
        let retractions: Vec<InstantiationId> = self.matches.retractions.drain(..).collect();
        for inst in retractions {
            self.retract_instantiation(inst)?;
        }
        self.process_slot_changes()?;
        self.names.remove(name);
        if let Some(loaded) = self.productions.shift_remove(&id) {
            for sym in loaded.def.symbols() {
                self.symbols.release(sym)?;
            }
        }
        tracing::debug!(production = name, "production excised");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Working memory and preference primitives
    // -----------------------------------------------------------------------

    pub(crate) fn add_wme_internal(
        &mut self,
        id: Symbol,
        attr: Symbol,
        value: Symbol,
        acceptable: bool,
        supporter: Supporter,
    ) -> KernelResult<Timetag> {
        let wme = match self.wm.add_wme(id, attr, value, acceptable, supporter) {
            WmeAdd::Supported(tt) => return Ok(tt),
            WmeAdd::Created(wme) => wme,
        };
        for sym in [id, attr, value] {
            self.symbols.add_ref(sym)?;
        }
        if let Some(level) = self.symbols.goal_level(id) {
            if !self.symbols.is_goal(value) {
                self.symbols.promote_level(value, level);
            }
        }
        self.rete.add_wme(&wme, &self.symbols);
        self.wm_changes += 1;
        if self.has_sinks() {
            self.emit(KernelEvent::WmeAdded {
                timetag: wme.timetag.0,
                wme: self.describe_wme(&wme),
            });
        }
        Ok(wme.timetag)
    }

    pub(crate) fn remove_wme_internal(&mut self, tt: Timetag) -> KernelResult<()> {
        if let Some(wme) = self.wm.remove_wme(tt) {
            self.on_wme_removed(wme)?;
        }
        Ok(())
    }

    fn on_wme_removed(&mut self, wme: Wme) -> KernelResult<()> {
        self.rete.remove_wme(wme.timetag, &self.symbols);
        self.wm_changes += 1;
        if let Some(level) = self.goals.gds_owner(wme.timetag) {
            self.pending_gds.push(level);
        }
        if self.has_sinks() {
            self.emit(KernelEvent::WmeRemoved {
                timetag: wme.timetag.0,
                wme: self.describe_wme(&wme),
            });
        }
        for sym in [wme.id, wme.attr, wme.value] {
            self.symbols.release(sym)?;
        }
        Ok(())
    }

    /// Store a preference. O-supported rejects are applied instead of
    /// stored and return `None`.
    pub(crate) fn add_preference(&mut self, pref: Preference) -> KernelResult<Option<PreferenceId>> {
        if pref.kind == PreferenceType::Reject && pref.support == Support::O {
            for pid in self.prefs.o_supported_matching(pref.id, pref.attr, pref.value) {
                self.remove_preference(pid)?;
            }
            return Ok(None);
        }
        let context = self.is_context_key(pref.id, pref.attr);
        let mirror = context
            && matches!(pref.kind, PreferenceType::Acceptable | PreferenceType::Require);
        let (id, attr, value) = (pref.id, pref.attr, pref.value);
        for sym in [id, attr, value].into_iter().chain(pref.referent) {
            self.symbols.add_ref(sym)?;
        }
        let pid = self.prefs.add(pref, context);
        if mirror {
            self.add_wme_internal(id, attr, value, true, Supporter::Preference(pid))?;
        }
        Ok(Some(pid))
    }

    pub(crate) fn remove_preference(&mut self, pid: PreferenceId) -> KernelResult<()> {
        let Some(pref) = self.prefs.remove(pid) else {
            return Ok(());
        };
        if self.wm.is_supporting(pid) {
            if let Some(wme) = self.wm.remove_support(pid)? {
                self.on_wme_removed(wme)?;
            }
        }
        for sym in [pref.id, pref.attr, pref.value].into_iter().chain(pref.referent) {
            self.symbols.release(sym)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Run control
    // -----------------------------------------------------------------------

    /// Run the current phase and advance to the next one.
    pub fn step_phase(&mut self) -> KernelResult<PhaseReport> {
        if let Some(reason) = &self.halted {
            return Err(CycleError::Halted {
                reason: reason.clone(),
            }
            .into());
        }
        if self.in_phase {
            return Err(CycleError::Reentered {
                phase: self.phase.to_string(),
            }
            .into());
        }
        let phase = self.phase;
        if self.stop.take() {
            return Ok(self.stopped(phase));
        }

        self.in_phase = true;
        self.emit(KernelEvent::PhaseStarted {
            cycle: self.cycle,
            phase,
        });
        let result = self.run_phase(phase);
        self.in_phase = false;
        let mut stop = result?;

        if phase == Phase::Output {
            self.cycle += 1;
        }
        self.phase = phase.next();
        if stop.is_none() && self.halted.is_some() {
            stop = Some(StopReason::Halted);
        }
        Ok(PhaseReport {
            phase,
            cycle: self.cycle,
            stop,
        })
    }

    fn run_phase(&mut self, phase: Phase) -> KernelResult<Option<StopReason>> {
        tracing::trace!(cycle = self.cycle, %phase, "phase started");
        match phase {
            Phase::Input => {
                self.apply_input()?;
                self.elaborate(phase)
            }
            Phase::Propose | Phase::Apply => self.elaborate(phase),
            Phase::Decision => self.run_decision(),
            Phase::Output => {
                self.report_output();
                Ok(None)
            }
        }
    }

    fn stopped(&mut self, phase: Phase) -> PhaseReport {
        tracing::info!(%phase, "stop requested");
        self.emit(KernelEvent::Stopped {
            reason: StopReason::Stopped,
            phase: Some(phase),
        });
        PhaseReport {
            phase,
            cycle: self.cycle,
            stop: Some(StopReason::Stopped),
        }
    }

    /// Run `n` complete decision cycles, or fewer if the reasoner halts or is
    /// stopped.
    pub fn run_decisions(&mut self, n: u64) -> KernelResult<StopReason> {
        self.ensure_runnable()?;
        let target = self.cycle + n;
        while self.cycle < target {
            let report = self.step_phase()?;
            match report.stop {
                None | Some(StopReason::MaxElaborations) => {}
                Some(reason) => return Ok(reason),
            }
        }
        Ok(StopReason::Completed)
    }

    /// Run until the reasoner halts or is stopped, or `limit` cycles pass.
    pub fn run_until_halt(&mut self, limit: Option<u64>) -> KernelResult<StopReason> {
        self.ensure_runnable()?;
        let start = self.cycle;
        loop {
            if limit.is_some_and(|l| self.cycle - start >= l) {
                return Ok(StopReason::Completed);
            }
            let report = self.step_phase()?;
            match report.stop {
                None | Some(StopReason::MaxElaborations) => {}
                Some(reason) => return Ok(reason),
            }
        }
    }

    fn ensure_runnable(&self) -> KernelResult<()> {
        match &self.halted {
            Some(reason) => Err(CycleError::Halted {
                reason: reason.clone(),
            }
            .into()),
            None => Ok(()),
        }
    }

    /// Halt the reasoner. Takes effect at the next phase boundary.
    pub fn halt(&mut self, reason: impl Into<String>) {
        self.halt_with(reason.into());
    }

    pub(crate) fn halt_with(&mut self, reason: String) {
        if self.halted.is_some() {
            return;
        }
        tracing::info!(%reason, cycle = self.cycle, "reasoner halted");
        self.emit(KernelEvent::Halted {
            reason: reason.clone(),
        });
        self.halted = Some(reason);
    }

    /// Clear working memory, preferences, sub-goals and instantiations, and
    /// rebuild the top state. Loaded productions are kept.
    pub fn reset(&mut self) -> KernelResult<()> {
        self.remove_goals_from(2)?;
        let top_operator = self.goals.at_level_mut(1).and_then(|g| {
            g.gds.clear();
            g.items.clear();
            g.structure.clear();
            g.operator.take()
        });
        if let Some((_, tt)) = top_operator {
            self.remove_wme_internal(tt)?;
        }
        let pids: Vec<PreferenceId> = self.prefs.iter().map(|(pid, _)| pid).collect();
        for pid in pids {
            self.remove_preference(pid)?;
        }
        let all: Vec<Timetag> = self.wm.iter().map(|w| w.timetag).collect();
        for tt in all {
            self.remove_wme_internal(tt)?;
        }
        self.absorb_matches()?;
        self.matches.clear();
        self.instantiations.clear();
        self.prefs.take_changed();
        self.pending_gds.clear();
        self.output_seen.clear();
        self.halted = None;
        self.in_phase = false;
        self.phase = Phase::Input;
        self.cycle = 0;
        self.stop.take();
        self.build_top_state()?;
        tracing::info!("reasoner reset");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Phases
    // -----------------------------------------------------------------------

    /// Fire and retract until quiescence or the elaboration ceiling.
    fn elaborate(&mut self, phase: Phase) -> KernelResult<Option<StopReason>> {
        let limit = self.config.max_elaborations;
        let mut waves = 0u32;
        loop {
            if self.stop.take() {
                tracing::info!(%phase, waves, "stop requested during elaboration");
                self.emit(KernelEvent::Stopped {
                    reason: StopReason::Stopped,
                    phase: Some(phase),
                });
                return Ok(Some(StopReason::Stopped));
            }
            if !self.elaboration_wave(phase)? {
                tracing::trace!(%phase, waves, "quiescence");
                return Ok(None);
            }
            waves += 1;
            if self.halted.is_some() {
                return Ok(Some(StopReason::Halted));
            }
            if waves >= limit {
                tracing::warn!(%phase, limit, "max elaborations reached");
                self.emit(KernelEvent::Stopped {
                    reason: StopReason::MaxElaborations,
                    phase: Some(phase),
                });
                return Ok(Some(StopReason::MaxElaborations));
            }
        }
    }

    /// One wave: every pending retraction, then every match still firable
    /// once the retractions' slot changes are decided, then the slot
    /// decisions the firings cause. Returns whether anything changed.
    fn elaboration_wave(&mut self, phase: Phase) -> KernelResult<bool> {
        let before = self.wm_changes;
        self.absorb_matches()?;
        let retractions: Vec<InstantiationId> = self.matches.retractions.drain(..).collect();
        if !retractions.is_empty() {
            for inst in &retractions {
                self.retract_instantiation(*inst)?;
            }
            // A deselected operator withdraws the apply matches that tested it.
            self.process_slot_changes()?;
            self.absorb_matches()?;
        }
        let firable: Vec<_> = self
            .matches
            .pending
            .iter()
            .filter(|(_, m)| phase.fires_o_support() || m.support == Support::I)
            .map(|(key, _)| *key)
            .collect();
        for key in &firable {
            if let Some(m) = self.matches.pending.shift_remove(key) {
                self.fire(m)?;
            }
        }
        self.process_slot_changes()?;
        Ok(!retractions.is_empty() || !firable.is_empty() || self.wm_changes != before)
    }

    fn apply_input(&mut self) -> KernelResult<()> {
        let requests = self.input.drain();
        if requests.is_empty() {
            return Ok(());
        }
        tracing::debug!(count = requests.len(), "applying input");
        let mut fresh: HashMap<String, Symbol> = HashMap::new();
        let mut owned: Vec<Symbol> = Vec::new();
        for request in requests {
            match request {
                InputRequest::Add { id, attr, value } => {
                    let resolved = [&id, &attr, &value]
                        .into_iter()
                        .map(|v| self.resolve_input(v, &mut fresh, &mut owned, true))
                        .collect::<KernelResult<Vec<_>>>();
                    let (id, attr, value) = match resolved.as_deref() {
                        Ok([Some(id), Some(attr), Some(value)]) => (*id, *attr, *value),
                        Ok(_) => continue,
                        Err(err) => {
                            tracing::warn!(error = %err, "input request skipped");
                            continue;
                        }
                    };
                    if !self.symbols.is_identifier(id) {
                        tracing::warn!(id = %self.symbols.display(id), "input id is not an identifier");
                        continue;
                    }
                    self.add_wme_internal(id, attr, value, false, Supporter::Input)?;
                }
                InputRequest::Remove { id, attr, value } => {
                    let resolved = [&id, &attr, &value]
                        .into_iter()
                        .map(|v| self.resolve_input(v, &mut fresh, &mut owned, false))
                        .collect::<KernelResult<Vec<_>>>();
                    let Ok([Some(id), Some(attr), Some(value)]) = resolved.as_deref() else {
                        continue;
                    };
                    let target = self
                        .wm
                        .find(*id, *attr, *value, false)
                        .map(|w| w.timetag)
                        .filter(|tt| self.wm.supporters(*tt).contains(&Supporter::Input));
                    if let Some(tt) = target {
                        if let Some(wme) = self.wm.detach(tt, Supporter::Input)? {
                            self.on_wme_removed(wme)?;
                        }
                    }
                }
            }
        }
        for sym in owned.into_iter().chain(fresh.into_values()) {
            self.symbols.release(sym)?;
        }
        Ok(())
    }

    /// Map an input value to a symbol. Interned literals and new identifiers
    /// are recorded for release once the batch is applied.
    fn resolve_input(
        &mut self,
        value: &InputValue,
        fresh: &mut HashMap<String, Symbol>,
        owned: &mut Vec<Symbol>,
        create: bool,
    ) -> KernelResult<Option<Symbol>> {
        match value {
            InputValue::Symbol(sym) => {
                if self.symbols.value(*sym).is_none() {
                    return Err(SymbolError::Unknown { symbol: sym.get() }.into());
                }
                Ok(Some(*sym))
            }
            InputValue::Literal(lit) => {
                let sym = self.symbols.intern(lit);
                owned.push(sym);
                Ok(Some(sym))
            }
            InputValue::NewId { letter, key } => {
                if let Some(sym) = fresh.get(key) {
                    return Ok(Some(*sym));
                }
                if !create {
                    return Ok(None);
                }
                let sym = self.symbols.new_identifier(*letter);
                fresh.insert(key.clone(), sym);
                Ok(Some(sym))
            }
        }
    }

    /// Elements reachable from the output-link.
    fn output_view(&self) -> IndexMap<Timetag, String> {
        let mut view = IndexMap::new();
        let mut visited: HashSet<Symbol> = HashSet::new();
        let mut queue: VecDeque<Symbol> = VecDeque::from([self.links.output_link]);
        while let Some(id) = queue.pop_front() {
            if !visited.insert(id) {
                continue;
            }
            for wme in self.wm.query(Some(id), None, None) {
                if wme.acceptable {
                    continue;
                }
                view.insert(wme.timetag, self.describe_wme(wme));
                if self.symbols.is_identifier(wme.value) {
                    queue.push_back(wme.value);
                }
            }
        }
        view
    }

    fn report_output(&mut self) {
        let current = self.output_view();
        let added: Vec<String> = current
            .iter()
            .filter(|(tt, _)| !self.output_seen.contains_key(*tt))
            .map(|(_, s)| s.clone())
            .collect();
        let removed: Vec<String> = self
            .output_seen
            .iter()
            .filter(|(tt, _)| !current.contains_key(*tt))
            .map(|(_, s)| s.clone())
            .collect();
        if !added.is_empty() || !removed.is_empty() {
            tracing::debug!(added = added.len(), removed = removed.len(), "output changed");
            self.emit(KernelEvent::Output { added, removed });
        }
        self.output_seen = current;
    }

    // -----------------------------------------------------------------------
    // Snapshot
    // -----------------------------------------------------------------------

    /// Owned view of the reasoner state for use outside the kernel thread.
    pub fn snapshot(&self) -> KernelSnapshot {
        let d = |s: Symbol| self.symbols.display(s);
        KernelSnapshot {
            cycle: self.cycle,
            phase: self.phase,
            halted: self.halted.clone(),
            goals: self
                .goals
                .iter()
                .map(|g| GoalSnapshot {
                    id: d(g.id),
                    level: g.level,
                    impasse: g.impasse.as_ref().map(|i| i.kind),
                    attribute: g.impasse.as_ref().map(|i| i.attribute),
                    operator: g.operator.map(|(op, _)| d(op)),
                    items: g.items.keys().map(|s| d(*s)).collect(),
                })
                .collect(),
            wmes: self
                .wm
                .iter()
                .map(|w| WmeSnapshot {
                    timetag: w.timetag.0,
                    id: d(w.id),
                    attr: d(w.attr),
                    value: d(w.value),
                    acceptable: w.acceptable,
                })
                .collect(),
            preferences: self
                .prefs
                .iter()
                .map(|(_, p)| p.describe(&self.symbols))
                .collect(),
            productions: self.productions.values().map(|p| p.def.name.clone()).collect(),
            rete: self.rete.stats(),
        }
    }
}

/// Goal as seen in a [`KernelSnapshot`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalSnapshot {
    pub id: String,
    pub level: u32,
    pub impasse: Option<ImpasseKind>,
    pub attribute: Option<ImpasseAttribute>,
    pub operator: Option<String>,
    pub items: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WmeSnapshot {
    pub timetag: u64,
    pub id: String,
    pub attr: String,
    pub value: String,
    pub acceptable: bool,
}

/// Serializable copy of the reasoner state, taken between phases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelSnapshot {
    pub cycle: u64,
    pub phase: Phase,
    pub halted: Option<String>,
    pub goals: Vec<GoalSnapshot>,
    pub wmes: Vec<WmeSnapshot>,
    pub preferences: Vec<String>,
    pub productions: Vec<String>,
    pub rete: ReteStats,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::VecSink;
    use crate::production::{Action, Condition, ConditionTriple, RhsValue, Test};

    fn reasoner() -> Reasoner {
        Reasoner::new(KernelConfig::default()).unwrap()
    }

    #[test]
    fn top_state_structure() {
        let r = reasoner();
        let snap = r.snapshot();
        let texts: Vec<String> = r.wmes().map(|w| r.describe_wme(w)).collect();
        assert_eq!(
            texts,
            vec![
                "S1 ^type state",
                "S1 ^superstate nil",
                "S1 ^io I1",
                "I1 ^input-link I2",
                "I1 ^output-link I3",
            ]
        );
        assert_eq!(snap.goals.len(), 1);
        assert_eq!(r.symbols().goal_level(r.input_link()), Some(1));
    }

    #[test]
    fn duplicate_production_rejected() {
        let mut r = reasoner();
        let s = r.symbols_mut().intern_variable("s");
        let ty = r.predefined().type_;
        let cond = Condition::Positive(ConditionTriple::new(
            Test::Equality(s),
            Test::Equality(ty),
            Test::Blank,
        ));
        let p = Production::new("dup", vec![cond], vec![Action::Halt]);
        r.add_production(p.clone()).unwrap();
        let err = r.add_production(p).unwrap_err();
        assert!(matches!(
            err,
            crate::error::KernelError::Production(ProductionError::Duplicate { .. })
        ));
        assert_eq!(r.pending_matches(), 1);
    }

    #[test]
    fn halted_reasoner_rejects_steps_until_reset() {
        let mut r = reasoner();
        r.halt("test");
        assert!(r.step_phase().is_err());
        assert!(r.run_decisions(1).is_err());
        r.reset().unwrap();
        assert!(r.step_phase().is_ok());
    }

    #[test]
    fn input_adds_and_removes_elements() {
        let mut r = reasoner();
        let link = r.input_link();
        r.queue_input(InputRequest::add(link, "block", InputValue::new_id('B', "b")));
        r.queue_input(InputRequest::add(InputValue::new_id('B', "b"), "color", "red"));
        r.step_phase().unwrap();
        assert_eq!(r.wmes().count(), 7);
        let color = r.symbols().find_str("color").unwrap();
        let block = r.query(None, Some(color), None)[0].id;
        assert_eq!(r.symbols().display(block), "B1");
        assert_eq!(r.symbols().goal_level(block), Some(1));

        r.queue_input(InputRequest::remove(block, "color", "red"));
        while r.phase() != Phase::Input {
            r.step_phase().unwrap();
        }
        r.step_phase().unwrap();
        assert!(r.query(None, Some(color), None).is_empty());
        assert_eq!(r.query(Some(link), None, None).len(), 1);
    }

    #[test]
    fn rule_halt_stops_run() {
        let mut r = reasoner();
        let sink = Arc::new(VecSink::new());
        r.add_sink(sink.clone());
        let s = r.symbols_mut().intern_variable("s");
        let ty = r.predefined().type_;
        let state = r.predefined().state;
        let done = r.symbols_mut().intern_str("done");
        let cond = Condition::Positive(ConditionTriple::new(
            Test::Equality(s),
            Test::Equality(ty),
            Test::Equality(state),
        ));
        let p = Production::new(
            "stop",
            vec![cond],
            vec![Action::Write(vec![RhsValue::Symbol(done)]), Action::Halt],
        );
        r.add_production(p).unwrap();
        let reason = r.run_decisions(5).unwrap();
        assert_eq!(reason, StopReason::Halted);
        assert!(r.is_halted());
        assert_eq!(sink.with_label("write").len(), 1);
        assert_eq!(sink.with_label("halt").len(), 1);
    }

    #[test]
    fn stop_handle_interrupts_run() {
        let mut r = reasoner();
        r.stop_handle().request_stop();
        assert_eq!(r.run_decisions(3).unwrap(), StopReason::Stopped);
        assert_eq!(r.cycle(), 0);
        assert!(!r.is_halted());
    }

    #[test]
    fn state_no_change_stacks_to_max_depth() {
        let config = KernelConfig {
            max_goal_depth: 3,
            ..Default::default()
        };
        let mut r = Reasoner::new(config).unwrap();
        let reason = r.run_decisions(10).unwrap();
        assert_eq!(reason, StopReason::MaxGoalDepth);
        assert_eq!(r.goal_stack().depth(), 3);
        assert!(r.is_halted());
    }

    #[test]
    fn wait_on_state_no_change_keeps_single_goal() {
        let config = KernelConfig {
            wait_on_state_no_change: true,
            ..Default::default()
        };
        let mut r = Reasoner::new(config).unwrap();
        assert_eq!(r.run_decisions(4).unwrap(), StopReason::Completed);
        assert_eq!(r.goal_stack().depth(), 1);
        assert_eq!(r.cycle(), 4);
    }

    #[test]
    fn snapshot_serializes() {
        let r = reasoner();
        let json = serde_json::to_string(&r.snapshot()).unwrap();
        assert!(json.contains("\"phase\":\"input\""));
        assert!(json.contains("input-link"));
    }
}
