//! The goal stack: the top state and the impasse sub-states below it.

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};

use crate::symbol::{PredefinedSymbols, Symbol};
use crate::wm::Timetag;

/// Why a sub-goal exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImpasseKind {
    Tie,
    Conflict,
    ConstraintFailure,
    NoChange,
}

impl ImpasseKind {
    pub fn symbol(self, predefined: &PredefinedSymbols) -> Symbol {
        match self {
            ImpasseKind::Tie => predefined.tie,
            ImpasseKind::Conflict => predefined.conflict,
            ImpasseKind::ConstraintFailure => predefined.constraint_failure,
            ImpasseKind::NoChange => predefined.no_change,
        }
    }
}

impl std::fmt::Display for ImpasseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ImpasseKind::Tie => "tie",
            ImpasseKind::Conflict => "conflict",
            ImpasseKind::ConstraintFailure => "constraint-failure",
            ImpasseKind::NoChange => "no-change",
        };
        f.write_str(s)
    }
}

/// The slot an impasse is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImpasseAttribute {
    /// The superstate's operator slot could not be decided, or the selected
    /// operator made no progress.
    Operator,
    /// The superstate had no operator to select.
    State,
}

impl ImpasseAttribute {
    pub fn symbol(self, predefined: &PredefinedSymbols) -> Symbol {
        match self {
            ImpasseAttribute::Operator => predefined.operator,
            ImpasseAttribute::State => predefined.state,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Impasse {
    pub kind: ImpasseKind,
    pub attribute: ImpasseAttribute,
}

/// One state on the goal stack.
#[derive(Debug, Clone)]
pub struct Goal {
    pub id: Symbol,
    /// 1 for the top state.
    pub level: u32,
    /// `None` for the top state.
    pub impasse: Option<Impasse>,
    /// Selected operator and the timetag of its `^operator` element.
    pub operator: Option<(Symbol, Timetag)>,
    /// Architecture elements describing the impasse, except `^item`s.
    pub structure: Vec<Timetag>,
    /// `^item` elements by item value.
    pub items: IndexMap<Symbol, Timetag>,
    /// Superstate elements this goal's persistent results depend on.
    pub gds: IndexSet<Timetag>,
}

impl Goal {
    pub fn new(id: Symbol, level: u32, impasse: Option<Impasse>) -> Self {
        Self {
            id,
            level,
            impasse,
            operator: None,
            structure: Vec::new(),
            items: IndexMap::new(),
            gds: IndexSet::new(),
        }
    }
}

/// Goals ordered from the top state down.
#[derive(Debug, Default)]
pub struct GoalStack {
    goals: Vec<Goal>,
}

impl GoalStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, goal: Goal) {
        self.goals.push(goal);
    }

    pub fn top(&self) -> Option<&Goal> {
        self.goals.first()
    }

    pub fn bottom(&self) -> Option<&Goal> {
        self.goals.last()
    }

    pub fn at_level(&self, level: u32) -> Option<&Goal> {
        level
            .checked_sub(1)
            .and_then(|i| self.goals.get(i as usize))
    }

    pub fn at_level_mut(&mut self, level: u32) -> Option<&mut Goal> {
        level
            .checked_sub(1)
            .and_then(|i| self.goals.get_mut(i as usize))
    }

    pub fn find(&self, id: Symbol) -> Option<&Goal> {
        self.goals.iter().find(|g| g.id == id)
    }

    pub fn depth(&self) -> u32 {
        self.goals.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.goals.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Goal> + '_ {
        self.goals.iter()
    }

    /// Detach every goal at `level` or deeper, deepest first.
    pub fn split_off(&mut self, level: u32) -> Vec<Goal> {
        let keep = level.saturating_sub(1) as usize;
        if keep >= self.goals.len() {
            return Vec::new();
        }
        let mut removed = self.goals.split_off(keep);
        removed.reverse();
        removed
    }

    /// Shallowest goal whose dependency set contains `tt`.
    pub fn gds_owner(&self, tt: Timetag) -> Option<u32> {
        self.goals
            .iter()
            .find(|g| g.gds.contains(&tt))
            .map(|g| g.level)
    }
}
