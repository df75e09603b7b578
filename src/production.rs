//! Productions: condition/action rules over working memory.
//!
//! A production is a closed tree of [`Condition`]s and a list of [`Action`]s,
//! all expressed in interned [`Symbol`]s. Variables are symbols of kind
//! `Variable`; the match network and the RHS evaluator both consult the symbol
//! table to tell them apart from constants.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::ReteError;
use crate::preference::PreferenceType;
use crate::symbol::{PredefinedSymbols, Symbol, SymbolTable};

/// Handle to a loaded production.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProductionId(pub u32);

impl std::fmt::Display for ProductionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "p{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

/// Relational operator of a relational test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelOp {
    NotEqual,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
    /// `<=>`: both values have the same symbol kind.
    SameType,
}

impl RelOp {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "<>" => Some(Self::NotEqual),
            "<" => Some(Self::Less),
            "<=" => Some(Self::LessOrEqual),
            ">" => Some(Self::Greater),
            ">=" => Some(Self::GreaterOrEqual),
            "<=>" => Some(Self::SameType),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotEqual => "<>",
            Self::Less => "<",
            Self::LessOrEqual => "<=",
            Self::Greater => ">",
            Self::GreaterOrEqual => ">=",
            Self::SameType => "<=>",
        }
    }
}

/// A test on one field of a working memory element.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Test {
    /// Matches anything.
    Blank,
    /// Equal to a constant, or binds/compares a variable.
    Equality(Symbol),
    Relational { op: RelOp, referent: Symbol },
    /// Equal to any of the listed constants.
    Disjunction(Vec<Symbol>),
    /// Every sub-test must pass.
    Conjunction(Vec<Test>),
    /// The value is a goal (state) identifier.
    GoalId,
    /// The value is the identifier of an impasse state.
    ImpasseId,
}

impl Test {
    /// Every equality-test symbol, descending into conjunctions.
    pub fn equality_symbols(&self) -> Vec<Symbol> {
        match self {
            Test::Equality(s) => vec![*s],
            Test::Conjunction(tests) => tests.iter().flat_map(Test::equality_symbols).collect(),
            _ => Vec::new(),
        }
    }

    /// The constant this test requires by equality, if any.
    pub fn constant_equality(&self, table: &SymbolTable) -> Option<Symbol> {
        self.equality_symbols()
            .into_iter()
            .find(|s| !table.is_variable(*s))
    }

    fn collect_symbols(&self, out: &mut Vec<Symbol>) {
        match self {
            Test::Equality(s) => out.push(*s),
            Test::Relational { referent, .. } => out.push(*referent),
            Test::Disjunction(items) => out.extend(items.iter().copied()),
            Test::Conjunction(tests) => tests.iter().for_each(|t| t.collect_symbols(out)),
            Test::Blank | Test::GoalId | Test::ImpasseId => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Conditions
// ---------------------------------------------------------------------------

/// Field tests of one condition element.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConditionTriple {
    pub id: Test,
    pub attr: Test,
    pub value: Test,
    /// Matches only acceptable-preference elements when set.
    pub acceptable: bool,
}

impl ConditionTriple {
    pub fn new(id: Test, attr: Test, value: Test) -> Self {
        Self {
            id,
            attr,
            value,
            acceptable: false,
        }
    }

    pub fn acceptable(mut self) -> Self {
        self.acceptable = true;
        self
    }

    pub fn fields(&self) -> [&Test; 3] {
        [&self.id, &self.attr, &self.value]
    }
}

/// A left-hand side condition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Condition {
    Positive(ConditionTriple),
    Negative(ConditionTriple),
    /// Negated conjunction: matches when the sub-conditions have no match.
    Ncc(Vec<Condition>),
}

impl Condition {
    fn collect_symbols(&self, out: &mut Vec<Symbol>) {
        match self {
            Condition::Positive(t) | Condition::Negative(t) => {
                t.fields().iter().for_each(|f| f.collect_symbols(out))
            }
            Condition::Ncc(conds) => conds.iter().for_each(|c| c.collect_symbols(out)),
        }
    }
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// Right-hand side function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RhsFunction {
    #[serde(rename = "+")]
    Add,
    #[serde(rename = "-")]
    Subtract,
    #[serde(rename = "*")]
    Multiply,
    #[serde(rename = "/")]
    Divide,
    Concat,
}

impl RhsFunction {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "+" => Some(Self::Add),
            "-" => Some(Self::Subtract),
            "*" => Some(Self::Multiply),
            "/" => Some(Self::Divide),
            "concat" => Some(Self::Concat),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Subtract => "-",
            Self::Multiply => "*",
            Self::Divide => "/",
            Self::Concat => "concat",
        }
    }

    pub fn min_arity(self) -> usize {
        match self {
            Self::Divide => 2,
            _ => 1,
        }
    }
}

/// A value computed on the right-hand side.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RhsValue {
    /// A constant, or a variable bound on the LHS or created by this firing.
    Symbol(Symbol),
    Function {
        function: RhsFunction,
        args: Vec<RhsValue>,
    },
}

impl RhsValue {
    fn collect_symbols(&self, out: &mut Vec<Symbol>) {
        match self {
            RhsValue::Symbol(s) => out.push(*s),
            RhsValue::Function { args, .. } => args.iter().for_each(|a| a.collect_symbols(out)),
        }
    }
}

/// A right-hand side action.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    MakePreference {
        id: RhsValue,
        attr: RhsValue,
        value: RhsValue,
        kind: PreferenceType,
        /// Second operand of binary preferences (`better`, `worse`, binary
        /// indifferent) or the numeric value of a numeric-indifferent one.
        referent: Option<RhsValue>,
    },
    Halt,
    Write(Vec<RhsValue>),
}

impl Action {
    fn collect_symbols(&self, out: &mut Vec<Symbol>) {
        match self {
            Action::MakePreference {
                id,
                attr,
                value,
                referent,
                ..
            } => {
                id.collect_symbols(out);
                attr.collect_symbols(out);
                value.collect_symbols(out);
                if let Some(r) = referent {
                    r.collect_symbols(out);
                }
            }
            Action::Halt => {}
            Action::Write(values) => values.iter().for_each(|v| v.collect_symbols(out)),
        }
    }
}

// ---------------------------------------------------------------------------
// Production
// ---------------------------------------------------------------------------

/// Declared support mode of a production.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SupportMode {
    /// Derived from the conditions (tests a selected operator ⇒ o-support).
    #[default]
    Inferred,
    ISupport,
    OSupport,
}

/// Support attached to a preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Support {
    I,
    O,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Production {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documentation: Option<String>,
    pub conditions: Vec<Condition>,
    pub actions: Vec<Action>,
    #[serde(default)]
    pub support: SupportMode,
}

impl Production {
    pub fn new(name: impl Into<String>, conditions: Vec<Condition>, actions: Vec<Action>) -> Self {
        Self {
            name: name.into(),
            documentation: None,
            conditions,
            actions,
            support: SupportMode::Inferred,
        }
    }

    pub fn with_support(mut self, support: SupportMode) -> Self {
        self.support = support;
        self
    }

    /// Every symbol the production mentions, with repeats.
    pub fn symbols(&self) -> Vec<Symbol> {
        let mut out = Vec::new();
        self.conditions.iter().for_each(|c| c.collect_symbols(&mut out));
        self.actions.iter().for_each(|a| a.collect_symbols(&mut out));
        out
    }

    /// Support given to every preference this production makes.
    pub fn support(&self, predefined: &PredefinedSymbols) -> Support {
        match self.support {
            SupportMode::ISupport => Support::I,
            SupportMode::OSupport => Support::O,
            SupportMode::Inferred if self.tests_selected_operator(predefined) => Support::O,
            SupportMode::Inferred => Support::I,
        }
    }

    /// A positive, non-acceptable condition on `^operator`.
    pub fn tests_selected_operator(&self, predefined: &PredefinedSymbols) -> bool {
        self.conditions.iter().any(|c| match c {
            Condition::Positive(t) => {
                !t.acceptable && t.attr.equality_symbols().contains(&predefined.operator)
            }
            _ => false,
        })
    }

    /// Variables bound by top-level positive conditions.
    pub fn lhs_bound_variables(&self, table: &SymbolTable) -> HashSet<Symbol> {
        let mut bound = HashSet::new();
        for cond in &self.conditions {
            if let Condition::Positive(t) = cond {
                for field in t.fields() {
                    bound.extend(
                        field
                            .equality_symbols()
                            .into_iter()
                            .filter(|s| table.is_variable(*s)),
                    );
                }
            }
        }
        bound
    }

    /// Check the right-hand side against the variables bound on the left.
    ///
    /// Action identifiers must be LHS-bound variables or variables created as
    /// the value of an earlier action; function calls must respect arity.
    pub fn check_actions(&self, table: &SymbolTable) -> Result<(), ReteError> {
        let bound = self.lhs_bound_variables(table);
        let mut created: HashSet<Symbol> = HashSet::new();
        for action in &self.actions {
            match action {
                Action::MakePreference {
                    id,
                    attr,
                    value,
                    referent,
                    ..
                } => {
                    self.check_function_arity(id, table)?;
                    self.check_function_arity(attr, table)?;
                    self.check_function_arity(value, table)?;
                    if let Some(r) = referent {
                        self.check_function_arity(r, table)?;
                    }
                    match id {
                        RhsValue::Symbol(s) if table.is_variable(*s) => {
                            if !bound.contains(s) && !created.contains(s) {
                                return Err(ReteError::UnconnectedIdentifier {
                                    production: self.name.clone(),
                                    variable: table.display(*s),
                                });
                            }
                        }
                        RhsValue::Symbol(s) => {
                            return Err(ReteError::ConstantIdentifier {
                                production: self.name.clone(),
                                found: table.display(*s),
                            });
                        }
                        RhsValue::Function { function, .. } => {
                            return Err(ReteError::ConstantIdentifier {
                                production: self.name.clone(),
                                found: format!("({} ...)", function.name()),
                            });
                        }
                    }
                    for v in [Some(attr), Some(value), referent.as_ref()].into_iter().flatten() {
                        if let RhsValue::Symbol(s) = v {
                            if table.is_variable(*s) && !bound.contains(s) {
                                created.insert(*s);
                            }
                        }
                    }
                }
                Action::Halt => {}
                Action::Write(values) => {
                    for v in values {
                        self.check_function_arity(v, table)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn check_function_arity(&self, value: &RhsValue, table: &SymbolTable) -> Result<(), ReteError> {
        if let RhsValue::Function { function, args } = value {
            if args.len() < function.min_arity() {
                return Err(ReteError::BadArity {
                    production: self.name.clone(),
                    function: function.name().to_string(),
                    expected: format!("at least {}", function.min_arity()),
                    actual: args.len(),
                });
            }
            for arg in args {
                self.check_function_arity(arg, table)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        table: SymbolTable,
        predefined: PredefinedSymbols,
    }

    fn fixture() -> Fixture {
        let mut table = SymbolTable::new();
        let predefined = PredefinedSymbols::new(&mut table);
        Fixture { table, predefined }
    }

    fn pref(id: Symbol, attr: Symbol, value: Symbol) -> Action {
        Action::MakePreference {
            id: RhsValue::Symbol(id),
            attr: RhsValue::Symbol(attr),
            value: RhsValue::Symbol(value),
            kind: PreferenceType::Acceptable,
            referent: None,
        }
    }

    #[test]
    fn operator_test_yields_o_support() {
        let mut f = fixture();
        let s = f.table.intern_variable("s");
        let o = f.table.intern_variable("o");
        let cond = Condition::Positive(ConditionTriple::new(
            Test::Equality(s),
            Test::Equality(f.predefined.operator),
            Test::Equality(o),
        ));
        let p = Production::new("apply", vec![cond.clone()], vec![]);
        assert_eq!(p.support(&f.predefined), Support::O);

        let acceptable = Condition::Positive(
            ConditionTriple::new(
                Test::Equality(s),
                Test::Equality(f.predefined.operator),
                Test::Equality(o),
            )
            .acceptable(),
        );
        let p = Production::new("elab", vec![acceptable], vec![]);
        assert_eq!(p.support(&f.predefined), Support::I);

        let forced = Production::new("forced", vec![cond], vec![]).with_support(SupportMode::ISupport);
        assert_eq!(forced.support(&f.predefined), Support::I);
    }

    #[test]
    fn unconnected_action_identifier_rejected() {
        let mut f = fixture();
        let s = f.table.intern_variable("s");
        let x = f.table.intern_variable("x");
        let color = f.table.intern_str("color");
        let red = f.table.intern_str("red");
        let cond = Condition::Positive(ConditionTriple::new(
            Test::Equality(s),
            Test::Equality(color),
            Test::Blank,
        ));
        let p = Production::new("bad", vec![cond], vec![pref(x, color, red)]);
        let err = p.check_actions(&f.table).unwrap_err();
        assert!(matches!(err, ReteError::UnconnectedIdentifier { .. }));
    }

    #[test]
    fn identifier_created_by_earlier_action_is_connected() {
        let mut f = fixture();
        let s = f.table.intern_variable("s");
        let n = f.table.intern_variable("n");
        let attr = f.table.intern_str("thing");
        let name = f.table.intern_str("name");
        let red = f.table.intern_str("red");
        let cond = Condition::Positive(ConditionTriple::new(
            Test::Equality(s),
            Test::Equality(f.predefined.type_),
            Test::Equality(f.predefined.state),
        ));
        let p = Production::new(
            "make",
            vec![cond],
            vec![pref(s, attr, n), pref(n, name, red)],
        );
        assert!(p.check_actions(&f.table).is_ok());
    }

    #[test]
    fn arity_checked_recursively() {
        let mut f = fixture();
        let s = f.table.intern_variable("s");
        let attr = f.table.intern_str("x");
        let one = f.table.intern_int(1);
        let cond = Condition::Positive(ConditionTriple::new(
            Test::Equality(s),
            Test::Blank,
            Test::Blank,
        ));
        let p = Production::new(
            "div",
            vec![cond],
            vec![Action::MakePreference {
                id: RhsValue::Symbol(s),
                attr: RhsValue::Symbol(attr),
                value: RhsValue::Function {
                    function: RhsFunction::Add,
                    args: vec![RhsValue::Function {
                        function: RhsFunction::Divide,
                        args: vec![RhsValue::Symbol(one)],
                    }],
                },
                kind: PreferenceType::Acceptable,
                referent: None,
            }],
        );
        let err = p.check_actions(&f.table).unwrap_err();
        assert!(matches!(err, ReteError::BadArity { actual: 1, .. }));
    }

    #[test]
    fn constant_identifier_rejected() {
        let mut f = fixture();
        let s = f.table.intern_variable("s");
        let c = f.table.intern_str("c");
        let cond = Condition::Positive(ConditionTriple::new(
            Test::Equality(s),
            Test::Blank,
            Test::Blank,
        ));
        let p = Production::new("const", vec![cond], vec![pref(c, c, c)]);
        assert!(matches!(
            p.check_actions(&f.table),
            Err(ReteError::ConstantIdentifier { .. })
        ));
    }

    #[test]
    fn relop_parse_roundtrip() {
        for op in ["<>", "<", "<=", ">", ">=", "<=>"] {
            assert_eq!(RelOp::parse(op).unwrap().as_str(), op);
        }
        assert!(RelOp::parse("==").is_none());
    }
}
