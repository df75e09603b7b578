//! Interned symbols for the kernel.
//!
//! Every atomic value that appears in working memory, in a rule, or in a
//! preference is a [`Symbol`]: a copyable handle into the reasoner's
//! [`SymbolTable`]. Interning makes equality a handle comparison. The table owns
//! symbol lifetime through reference counts; handles are allocated
//! monotonically and never reused, so a stale handle can never alias a newer
//! symbol.

use std::collections::HashMap;
use std::num::NonZeroU64;

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::error::{KernelResult, SymbolError};

/// Handle to an interned symbol. Resolve it through the owning
/// [`SymbolTable`]; on its own it renders as `#<handle>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Symbol(NonZeroU64);

impl Symbol {
    /// Handle number `raw`; zero is never a handle.
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Symbol)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The value an interned symbol stands for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SymbolValue {
    /// A generated object reference such as `S1`.
    Identifier { letter: char, number: u64 },
    Str(String),
    Int(i64),
    Float(f64),
    /// A rule variable such as `<s>`. Never appears in working memory.
    Variable(String),
}

impl SymbolValue {
    pub fn kind(&self) -> SymbolKind {
        match self {
            SymbolValue::Identifier { .. } => SymbolKind::Identifier,
            SymbolValue::Str(_) => SymbolKind::Str,
            SymbolValue::Int(_) => SymbolKind::Int,
            SymbolValue::Float(_) => SymbolKind::Float,
            SymbolValue::Variable(_) => SymbolKind::Variable,
        }
    }

    /// Numeric view for relational tests and RHS arithmetic.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            SymbolValue::Int(i) => Some(*i as f64),
            SymbolValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn is_identifier(&self) -> bool {
        matches!(self, SymbolValue::Identifier { .. })
    }
}

impl std::fmt::Display for SymbolValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SymbolValue::Identifier { letter, number } => write!(f, "{letter}{number}"),
            SymbolValue::Str(s) => write!(f, "{s}"),
            SymbolValue::Int(i) => write!(f, "{i}"),
            SymbolValue::Float(x) => write!(f, "{x:?}"),
            SymbolValue::Variable(v) => write!(f, "<{v}>"),
        }
    }
}

/// Discriminant of a [`SymbolValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SymbolKind {
    Identifier,
    Str,
    Int,
    Float,
    Variable,
}

/// A literal as it arrives from a rule file or an input adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    Int(i64),
    Float(f64),
    Str(String),
}

impl From<&str> for Literal {
    fn from(s: &str) -> Self {
        Literal::Str(s.to_string())
    }
}

impl From<i64> for Literal {
    fn from(i: i64) -> Self {
        Literal::Int(i)
    }
}

impl From<f64> for Literal {
    fn from(x: f64) -> Self {
        Literal::Float(x)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ConstantKey {
    Str(String),
    Int(i64),
    Float(OrderedFloat<f64>),
    Variable(String),
}

impl ConstantKey {
    fn of(value: &SymbolValue) -> Option<Self> {
        match value {
            SymbolValue::Identifier { .. } => None,
            SymbolValue::Str(s) => Some(ConstantKey::Str(s.clone())),
            SymbolValue::Int(i) => Some(ConstantKey::Int(*i)),
            SymbolValue::Float(x) => Some(ConstantKey::Float(OrderedFloat(normalize_float(*x)))),
            SymbolValue::Variable(v) => Some(ConstantKey::Variable(v.clone())),
        }
    }
}

/// Fold `-0.0` into `0.0` so both intern to the same handle.
fn normalize_float(x: f64) -> f64 {
    if x == 0.0 { 0.0 } else { x }
}

#[derive(Debug, Clone)]
struct SymbolEntry {
    value: SymbolValue,
    refs: u32,
    /// Goal-stack level for identifiers attached to (or rooting) a state.
    level: Option<u32>,
    goal: bool,
}

/// Per-reasoner intern table.
#[derive(Debug)]
pub struct SymbolTable {
    entries: HashMap<Symbol, SymbolEntry>,
    constants: HashMap<ConstantKey, Symbol>,
    id_counters: HashMap<char, u64>,
    next_handle: NonZeroU64,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            constants: HashMap::new(),
            id_counters: HashMap::new(),
            next_handle: NonZeroU64::MIN,
        }
    }

    fn allocate(&mut self, value: SymbolValue) -> Symbol {
        let sym = Symbol(self.next_handle);
        self.next_handle = self.next_handle.saturating_add(1);
        self.entries.insert(
            sym,
            SymbolEntry {
                value,
                refs: 1,
                level: None,
                goal: false,
            },
        );
        sym
    }

    fn intern_value(&mut self, value: SymbolValue) -> Symbol {
        let Some(key) = ConstantKey::of(&value) else {
            return self.allocate(value);
        };
        if let Some(&sym) = self.constants.get(&key) {
            if let Some(entry) = self.entries.get_mut(&sym) {
                entry.refs += 1;
            }
            return sym;
        }
        let sym = self.allocate(value);
        self.constants.insert(key, sym);
        sym
    }

    /// Intern a string constant, adding one reference.
    pub fn intern_str(&mut self, s: &str) -> Symbol {
        self.intern_value(SymbolValue::Str(s.to_string()))
    }

    pub fn intern_int(&mut self, i: i64) -> Symbol {
        self.intern_value(SymbolValue::Int(i))
    }

    pub fn intern_float(&mut self, x: f64) -> Symbol {
        self.intern_value(SymbolValue::Float(normalize_float(x)))
    }

    /// Intern a rule variable. The name is stored without angle brackets.
    pub fn intern_variable(&mut self, name: &str) -> Symbol {
        let bare = name.trim_start_matches('<').trim_end_matches('>');
        self.intern_value(SymbolValue::Variable(bare.to_string()))
    }

    pub fn intern(&mut self, literal: &Literal) -> Symbol {
        match literal {
            Literal::Int(i) => self.intern_int(*i),
            Literal::Float(x) => self.intern_float(*x),
            Literal::Str(s) => self.intern_str(s),
        }
    }

    /// Create a fresh identifier such as `S3`.
    ///
    /// The numeric suffix is unique per leading letter for the lifetime of the
    /// table; freed identifiers never give their number back.
    pub fn new_identifier(&mut self, letter: char) -> Symbol {
        let letter = if letter.is_ascii_alphabetic() {
            letter.to_ascii_uppercase()
        } else {
            'I'
        };
        let counter = self.id_counters.entry(letter).or_insert(0);
        *counter += 1;
        let number = *counter;
        self.allocate(SymbolValue::Identifier { letter, number })
    }

    /// Add one reference to a live symbol.
    pub fn add_ref(&mut self, sym: Symbol) -> KernelResult<()> {
        let entry = self
            .entries
            .get_mut(&sym)
            .ok_or(SymbolError::Unknown { symbol: sym.get() })?;
        entry.refs += 1;
        Ok(())
    }

    /// Drop one reference. Returns `true` when the symbol was freed.
    pub fn release(&mut self, sym: Symbol) -> KernelResult<bool> {
        let entry = self
            .entries
            .get_mut(&sym)
            .ok_or(SymbolError::UnknownRelease { symbol: sym.get() })?;
        entry.refs -= 1;
        if entry.refs > 0 {
            return Ok(false);
        }
        if let Some(entry) = self.entries.remove(&sym) {
            if let Some(key) = ConstantKey::of(&entry.value) {
                self.constants.remove(&key);
            }
        }
        Ok(true)
    }

    pub fn value(&self, sym: Symbol) -> Option<&SymbolValue> {
        self.entries.get(&sym).map(|e| &e.value)
    }

    pub fn kind(&self, sym: Symbol) -> Option<SymbolKind> {
        self.value(sym).map(SymbolValue::kind)
    }

    pub fn is_identifier(&self, sym: Symbol) -> bool {
        self.value(sym).is_some_and(SymbolValue::is_identifier)
    }

    pub fn is_variable(&self, sym: Symbol) -> bool {
        matches!(self.value(sym), Some(SymbolValue::Variable(_)))
    }

    pub fn ref_count(&self, sym: Symbol) -> u32 {
        self.entries.get(&sym).map(|e| e.refs).unwrap_or(0)
    }

    /// Human-readable rendering, falling back to the raw handle.
    pub fn display(&self, sym: Symbol) -> String {
        self.value(sym)
            .map(ToString::to_string)
            .unwrap_or_else(|| sym.to_string())
    }

    /// Look up an existing constant without adding a reference.
    pub fn find_str(&self, s: &str) -> Option<Symbol> {
        self.constants.get(&ConstantKey::Str(s.to_string())).copied()
    }

    pub fn find_int(&self, i: i64) -> Option<Symbol> {
        self.constants.get(&ConstantKey::Int(i)).copied()
    }

    pub fn is_goal(&self, sym: Symbol) -> bool {
        self.entries.get(&sym).is_some_and(|e| e.goal)
    }

    pub fn set_goal(&mut self, sym: Symbol, goal: bool) {
        if let Some(entry) = self.entries.get_mut(&sym) {
            entry.goal = goal;
        }
    }

    pub fn goal_level(&self, sym: Symbol) -> Option<u32> {
        self.entries.get(&sym).and_then(|e| e.level)
    }

    /// Overwrite the goal-stack level of an identifier.
    pub fn set_goal_level(&mut self, sym: Symbol, level: u32) {
        if let Some(entry) = self.entries.get_mut(&sym) {
            if entry.value.is_identifier() {
                entry.level = Some(level);
            }
        }
    }

    /// Assign a level to an identifier that has none, or move it up to a
    /// shallower level. Deeper levels never override an existing one.
    pub fn promote_level(&mut self, sym: Symbol, level: u32) {
        if let Some(entry) = self.entries.get_mut(&sym) {
            if !entry.value.is_identifier() {
                return;
            }
            entry.level = Some(entry.level.map_or(level, |existing| existing.min(level)));
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Architecture symbols the decider and the default top state rely on.
///
/// Each is held with one permanent reference by the reasoner.
#[derive(Debug, Clone, Copy)]
pub struct PredefinedSymbols {
    pub state: Symbol,
    pub operator: Symbol,
    pub superstate: Symbol,
    pub type_: Symbol,
    pub impasse: Symbol,
    pub attribute: Symbol,
    pub choices: Symbol,
    pub item: Symbol,
    pub quiescence: Symbol,
    pub t: Symbol,
    pub nil: Symbol,
    pub none: Symbol,
    pub multiple: Symbol,
    pub tie: Symbol,
    pub conflict: Symbol,
    pub constraint_failure: Symbol,
    pub no_change: Symbol,
    pub io: Symbol,
    pub input_link: Symbol,
    pub output_link: Symbol,
}

impl PredefinedSymbols {
    pub fn new(table: &mut SymbolTable) -> Self {
        Self {
            state: table.intern_str("state"),
            operator: table.intern_str("operator"),
            superstate: table.intern_str("superstate"),
            type_: table.intern_str("type"),
            impasse: table.intern_str("impasse"),
            attribute: table.intern_str("attribute"),
            choices: table.intern_str("choices"),
            item: table.intern_str("item"),
            quiescence: table.intern_str("quiescence"),
            t: table.intern_str("t"),
            nil: table.intern_str("nil"),
            none: table.intern_str("none"),
            multiple: table.intern_str("multiple"),
            tie: table.intern_str("tie"),
            conflict: table.intern_str("conflict"),
            constraint_failure: table.intern_str("constraint-failure"),
            no_change: table.intern_str("no-change"),
            io: table.intern_str("io"),
            input_link: table.intern_str("input-link"),
            output_link: table.intern_str("output-link"),
        }
    }
}
