//! Rule specifications: the serde form productions are written in.
//!
//! A rule file is JSON or TOML with a top-level `rules` list. Field tests and
//! right-hand side values use a compact text syntax:
//!
//! - `*` matches anything, `<x>` is a variable, `|text|` is a string constant
//!   taken verbatim
//! - `<< a b c >>` is a disjunction of constants
//! - `> 3`, `<> <x>`, `<=> <y>` are relational tests (`<>` `<` `<=` `>` `>=` `<=>`)
//! - `@state` and `@impasse` test that the value is a (impasse) state identifier
//! - a list of tests is a conjunction; native numbers are numeric constants
//!
//! Right-hand side function calls are objects: `{ "call": "+", "args": ["<x>", 1] }`.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{KernelResult, ProductionError};
use crate::preference::PreferenceType;
use crate::production::{
    Action, Condition, ConditionTriple, Production, RelOp, RhsFunction, RhsValue, SupportMode, Test,
};
use crate::symbol::{Symbol, SymbolTable};

// ---------------------------------------------------------------------------
// Spec types
// ---------------------------------------------------------------------------

/// One field test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TestSpec {
    Int(i64),
    Float(f64),
    Text(String),
    /// Conjunction: every test must pass.
    All(Vec<TestSpec>),
}

impl From<&str> for TestSpec {
    fn from(s: &str) -> Self {
        TestSpec::Text(s.to_string())
    }
}

/// One condition element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripleSpec {
    pub id: TestSpec,
    pub attr: TestSpec,
    pub value: TestSpec,
    #[serde(default, skip_serializing_if = "is_false")]
    pub negated: bool,
    /// Match the acceptable-preference element instead of the regular one.
    #[serde(default, skip_serializing_if = "is_false")]
    pub acceptable: bool,
}

impl TripleSpec {
    pub fn new(id: impl Into<TestSpec>, attr: impl Into<TestSpec>, value: impl Into<TestSpec>) -> Self {
        Self {
            id: id.into(),
            attr: attr.into(),
            value: value.into(),
            negated: false,
            acceptable: false,
        }
    }

    pub fn negated(mut self) -> Self {
        self.negated = true;
        self
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionSpec {
    /// Negated conjunction of the nested conditions.
    Ncc { ncc: Vec<ConditionSpec> },
    Triple(TripleSpec),
}

impl From<TripleSpec> for ConditionSpec {
    fn from(t: TripleSpec) -> Self {
        ConditionSpec::Triple(t)
    }
}

/// A right-hand side value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValueSpec {
    Int(i64),
    Float(f64),
    Text(String),
    Call {
        call: String,
        #[serde(default)]
        args: Vec<ValueSpec>,
    },
}

impl From<&str> for ValueSpec {
    fn from(s: &str) -> Self {
        ValueSpec::Text(s.to_string())
    }
}

impl From<i64> for ValueSpec {
    fn from(i: i64) -> Self {
        ValueSpec::Int(i)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ActionSpec {
    /// Make a preference. `preference` is a glyph (`+ ! - ~ @ = > <`) or a
    /// name; with a referent, `>` `<` `=` become binary preferences.
    Preference {
        id: ValueSpec,
        attr: ValueSpec,
        value: ValueSpec,
        #[serde(default = "default_preference")]
        preference: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        referent: Option<ValueSpec>,
    },
    Halt,
    Write { text: Vec<ValueSpec> },
}

fn default_preference() -> String {
    "+".to_string()
}

impl ActionSpec {
    /// An acceptable preference.
    pub fn make(id: impl Into<ValueSpec>, attr: impl Into<ValueSpec>, value: impl Into<ValueSpec>) -> Self {
        ActionSpec::Preference {
            id: id.into(),
            attr: attr.into(),
            value: value.into(),
            preference: default_preference(),
            referent: None,
        }
    }

    pub fn prefer(
        id: impl Into<ValueSpec>,
        attr: impl Into<ValueSpec>,
        value: impl Into<ValueSpec>,
        preference: &str,
        referent: Option<ValueSpec>,
    ) -> Self {
        ActionSpec::Preference {
            id: id.into(),
            attr: attr.into(),
            value: value.into(),
            preference: preference.to_string(),
            referent,
        }
    }
}

/// A production as written in a rule file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documentation: Option<String>,
    #[serde(default)]
    pub support: SupportMode,
    pub conditions: Vec<ConditionSpec>,
    pub actions: Vec<ActionSpec>,
}

impl RuleSpec {
    pub fn new(
        name: impl Into<String>,
        conditions: Vec<ConditionSpec>,
        actions: Vec<ActionSpec>,
    ) -> Self {
        Self {
            name: name.into(),
            documentation: None,
            support: SupportMode::Inferred,
            conditions,
            actions,
        }
    }

    pub fn with_support(mut self, support: SupportMode) -> Self {
        self.support = support;
        self
    }
}

/// The top level of a rule file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleFile {
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
}

impl RuleFile {
    pub fn from_json_str(s: &str) -> KernelResult<Self> {
        serde_json::from_str(s).map_err(|e| parse_error("rule file", e))
    }

    pub fn from_toml_str(s: &str) -> KernelResult<Self> {
        toml::from_str(s).map_err(|e| parse_error("rule file", e))
    }

    /// Load a rule file; `.toml` files are TOML, anything else is JSON.
    pub fn load(path: &Path) -> KernelResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ProductionError::RuleFile {
            path: path.display().to_string(),
            source: e,
        })?;
        let is_toml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("toml"));
        let parsed = if is_toml {
            toml::from_str(&content).map_err(|e| parse_error(&path.display().to_string(), e))
        } else {
            serde_json::from_str(&content).map_err(|e| parse_error(&path.display().to_string(), e))
        }?;
        tracing::debug!(path = %path.display(), "rule file loaded");
        Ok(parsed)
    }
}

fn parse_error(name: &str, e: impl std::fmt::Display) -> crate::error::KernelError {
    ProductionError::InvalidSpec {
        name: name.to_string(),
        message: e.to_string(),
    }
    .into()
}

// ---------------------------------------------------------------------------
// Building productions
// ---------------------------------------------------------------------------

/// Intern a rule spec into a [`Production`].
///
/// Each symbol occurrence in the result holds one reference taken here. On
/// error every reference taken so far is released again.
pub fn build_production(spec: &RuleSpec, table: &mut SymbolTable) -> KernelResult<Production> {
    let mut builder = Builder {
        table,
        interned: Vec::new(),
    };
    match builder.production(spec) {
        Ok(production) => Ok(production),
        Err(message) => {
            for sym in builder.interned {
                builder.table.release(sym)?;
            }
            Err(ProductionError::InvalidSpec {
                name: spec.name.clone(),
                message,
            }
            .into())
        }
    }
}

struct Builder<'a> {
    table: &'a mut SymbolTable,
    interned: Vec<Symbol>,
}

impl Builder<'_> {
    fn production(&mut self, spec: &RuleSpec) -> Result<Production, String> {
        if spec.name.trim().is_empty() {
            return Err("rule name is empty".to_string());
        }
        let conditions = spec
            .conditions
            .iter()
            .map(|c| self.condition(c))
            .collect::<Result<Vec<_>, _>>()?;
        let actions = spec
            .actions
            .iter()
            .map(|a| self.action(a))
            .collect::<Result<Vec<_>, _>>()?;
        let mut production = Production::new(spec.name.clone(), conditions, actions)
            .with_support(spec.support);
        production.documentation = spec.documentation.clone();
        Ok(production)
    }

    fn condition(&mut self, spec: &ConditionSpec) -> Result<Condition, String> {
        match spec {
            ConditionSpec::Ncc { ncc } => {
                let inner = ncc
                    .iter()
                    .map(|c| self.condition(c))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Condition::Ncc(inner))
            }
            ConditionSpec::Triple(t) => {
                let mut triple =
                    ConditionTriple::new(self.test(&t.id)?, self.test(&t.attr)?, self.test(&t.value)?);
                if t.acceptable {
                    triple = triple.acceptable();
                }
                Ok(if t.negated {
                    Condition::Negative(triple)
                } else {
                    Condition::Positive(triple)
                })
            }
        }
    }

    fn test(&mut self, spec: &TestSpec) -> Result<Test, String> {
        match spec {
            TestSpec::Int(i) => Ok(Test::Equality(self.keep(|t| t.intern_int(*i)))),
            TestSpec::Float(x) => Ok(Test::Equality(self.keep(|t| t.intern_float(*x)))),
            TestSpec::All(tests) if tests.is_empty() => Err("empty conjunctive test".to_string()),
            TestSpec::All(tests) => Ok(Test::Conjunction(
                tests.iter().map(|t| self.test(t)).collect::<Result<_, _>>()?,
            )),
            TestSpec::Text(text) => self.text_test(text.trim()),
        }
    }

    fn text_test(&mut self, text: &str) -> Result<Test, String> {
        match text {
            "*" => return Ok(Test::Blank),
            "@state" => return Ok(Test::GoalId),
            "@impasse" => return Ok(Test::ImpasseId),
            _ => {}
        }
        if let Some(rest) = text.strip_prefix("<<") {
            let inner = rest
                .strip_suffix(">>")
                .ok_or_else(|| format!("unterminated disjunction: {text}"))?;
            let mut items = Vec::new();
            for word in inner.split_whitespace() {
                let sym = self.atom(word)?;
                if self.table.is_variable(sym) {
                    return Err(format!("disjunction items must be constants: {word}"));
                }
                items.push(sym);
            }
            if items.is_empty() {
                return Err("empty disjunction".to_string());
            }
            return Ok(Test::Disjunction(items));
        }
        if RelOp::parse(text).is_some() {
            return Err(format!("relational test '{text}' needs an operand"));
        }
        if let Some((op, operand)) = text.split_once(char::is_whitespace) {
            if let Some(op) = RelOp::parse(op) {
                let referent = self.atom(operand)?;
                return Ok(Test::Relational { op, referent });
            }
        }
        Ok(Test::Equality(self.atom(text)?))
    }

    fn value(&mut self, spec: &ValueSpec) -> Result<RhsValue, String> {
        match spec {
            ValueSpec::Int(i) => Ok(RhsValue::Symbol(self.keep(|t| t.intern_int(*i)))),
            ValueSpec::Float(x) => Ok(RhsValue::Symbol(self.keep(|t| t.intern_float(*x)))),
            ValueSpec::Text(text) => Ok(RhsValue::Symbol(self.atom(text)?)),
            ValueSpec::Call { call, args } => {
                let function = RhsFunction::parse(call.trim())
                    .ok_or_else(|| format!("unknown function: {call}"))?;
                let args = args.iter().map(|a| self.value(a)).collect::<Result<_, _>>()?;
                Ok(RhsValue::Function { function, args })
            }
        }
    }

    fn action(&mut self, spec: &ActionSpec) -> Result<Action, String> {
        match spec {
            ActionSpec::Halt => Ok(Action::Halt),
            ActionSpec::Write { text } => Ok(Action::Write(
                text.iter().map(|v| self.value(v)).collect::<Result<_, _>>()?,
            )),
            ActionSpec::Preference {
                id,
                attr,
                value,
                preference,
                referent,
            } => {
                let kind = preference_kind(preference.trim(), referent.as_ref())?;
                Ok(Action::MakePreference {
                    id: self.value(id)?,
                    attr: self.value(attr)?,
                    value: self.value(value)?,
                    kind,
                    referent: referent.as_ref().map(|r| self.value(r)).transpose()?,
                })
            }
        }
    }

    /// A single constant or variable.
    fn atom(&mut self, text: &str) -> Result<Symbol, String> {
        let text = text.trim();
        if text.is_empty() {
            return Err("empty value".to_string());
        }
        if let Some(inner) = text
            .strip_prefix('|')
            .and_then(|t| t.strip_suffix('|'))
            .filter(|_| text.len() >= 2)
        {
            return Ok(self.keep(|t| t.intern_str(inner)));
        }
        if is_variable_name(text) {
            return Ok(self.keep(|t| t.intern_variable(text)));
        }
        if let Ok(i) = text.parse::<i64>() {
            return Ok(self.keep(|t| t.intern_int(i)));
        }
        if let Some(x) = parse_float(text) {
            return Ok(self.keep(|t| t.intern_float(x)));
        }
        Ok(self.keep(|t| t.intern_str(text)))
    }

    fn keep(&mut self, intern: impl FnOnce(&mut SymbolTable) -> Symbol) -> Symbol {
        let sym = intern(self.table);
        self.interned.push(sym);
        sym
    }
}

fn is_variable_name(text: &str) -> bool {
    text.strip_prefix('<')
        .and_then(|t| t.strip_suffix('>'))
        .is_some_and(|inner| {
            !inner.is_empty()
                && inner
                    .chars()
                    .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '*'))
        })
}

fn parse_float(text: &str) -> Option<f64> {
    if !text.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }
    text.parse::<f64>().ok().filter(|x| x.is_finite())
}

const UNARY_PREFERENCES: &[&str] = &[
    "+",
    "acceptable",
    "!",
    "require",
    "-",
    "reject",
    "~",
    "prohibit",
    "@",
    "reconsider",
    "best",
    "worst",
    "unary-indifferent",
];

fn preference_kind(name: &str, referent: Option<&ValueSpec>) -> Result<PreferenceType, String> {
    use PreferenceType::*;
    match (name, referent) {
        ("+" | "acceptable", None) => Ok(Acceptable),
        ("!" | "require", None) => Ok(Require),
        ("-" | "reject", None) => Ok(Reject),
        ("~" | "prohibit", None) => Ok(Prohibit),
        ("@" | "reconsider", None) => Ok(Reconsider),
        (">" | "best", None) => Ok(Best),
        ("<" | "worst", None) => Ok(Worst),
        ("=" | "indifferent" | "unary-indifferent", None) => Ok(UnaryIndifferent),
        (">" | "better", Some(_)) => Ok(Better),
        ("<" | "worse", Some(_)) => Ok(Worse),
        ("=" | "indifferent", Some(r)) if is_numeric(r) => Ok(NumericIndifferent),
        ("=" | "indifferent" | "binary-indifferent", Some(_)) => Ok(BinaryIndifferent),
        ("numeric-indifferent", Some(_)) => Ok(NumericIndifferent),
        ("better" | "worse" | "binary-indifferent" | "numeric-indifferent", None) => {
            Err(format!("preference '{name}' needs a referent"))
        }
        (name, Some(_)) if UNARY_PREFERENCES.contains(&name) => {
            Err(format!("preference '{name}' takes no referent"))
        }
        (name, _) => Err(format!("unknown preference type: {name}")),
    }
}

fn is_numeric(value: &ValueSpec) -> bool {
    match value {
        ValueSpec::Int(_) | ValueSpec::Float(_) => true,
        ValueSpec::Text(t) => t.trim().parse::<i64>().is_ok() || parse_float(t.trim()).is_some(),
        ValueSpec::Call { call, .. } => call.trim() != "concat",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KernelError;

    fn build(spec: &RuleSpec) -> (SymbolTable, KernelResult<Production>) {
        let mut table = SymbolTable::new();
        let result = build_production(spec, &mut table);
        (table, result)
    }

    fn cond(id: &str, attr: &str, value: &str) -> ConditionSpec {
        TripleSpec::new(id, attr, value).into()
    }

    fn first_value_test(p: &Production) -> &Test {
        match &p.conditions[0] {
            Condition::Positive(t) | Condition::Negative(t) => &t.value,
            Condition::Ncc(_) => panic!("expected a triple"),
        }
    }

    fn value_test(text: &str) -> Test {
        let spec = RuleSpec::new("t", vec![cond("<s>", "a", text)], vec![ActionSpec::Halt]);
        let (_, result) = build(&spec);
        first_value_test(&result.unwrap()).clone()
    }

    #[test]
    fn text_tests_parse_to_test_forms() {
        assert_eq!(value_test("*"), Test::Blank);
        assert_eq!(value_test("@state"), Test::GoalId);
        assert_eq!(value_test("@impasse"), Test::ImpasseId);
        assert!(matches!(value_test("<< red blue >>"), Test::Disjunction(v) if v.len() == 2));
        assert!(matches!(
            value_test("> 3"),
            Test::Relational { op: RelOp::Greater, .. }
        ));
        assert!(matches!(
            value_test("<> <x>"),
            Test::Relational { op: RelOp::NotEqual, .. }
        ));
        assert!(matches!(value_test("<x>"), Test::Equality(_)));
        let spec = RuleSpec::new("t", vec![cond("<s>", "a", "<=")], vec![ActionSpec::Halt]);
        assert!(build(&spec).1.is_err());
    }

    #[test]
    fn atoms_distinguish_variables_numbers_and_strings() {
        let spec = RuleSpec::new(
            "atoms",
            vec![cond("<s>", "n", "3")],
            vec![ActionSpec::Write {
                text: vec!["<s>".into(), "2.5".into(), "|<s>|".into(), "plain".into()],
            }],
        );
        let (table, result) = build(&spec);
        let p = result.unwrap();
        let Action::Write(values) = &p.actions[0] else {
            panic!("expected write");
        };
        let shown: Vec<String> = values
            .iter()
            .map(|v| match v {
                RhsValue::Symbol(s) => format!("{:?}", table.kind(*s).unwrap()),
                RhsValue::Function { .. } => "fn".to_string(),
            })
            .collect();
        assert_eq!(shown, vec!["Variable", "Float", "Str", "Str"]);
        assert!(matches!(first_value_test(&p), Test::Equality(s) if table.find_int(3) == Some(*s)));
    }

    #[test]
    fn preference_glyphs_resolve_with_referents() {
        assert_eq!(preference_kind("+", None).unwrap(), PreferenceType::Acceptable);
        assert_eq!(preference_kind(">", None).unwrap(), PreferenceType::Best);
        assert_eq!(
            preference_kind(">", Some(&"<o2>".into())).unwrap(),
            PreferenceType::Better
        );
        assert_eq!(preference_kind("=", None).unwrap(), PreferenceType::UnaryIndifferent);
        assert_eq!(
            preference_kind("=", Some(&ValueSpec::Int(5))).unwrap(),
            PreferenceType::NumericIndifferent
        );
        assert_eq!(
            preference_kind("=", Some(&"<o2>".into())).unwrap(),
            PreferenceType::BinaryIndifferent
        );
        assert!(preference_kind("better", None).is_err());
        assert!(preference_kind("!", Some(&"<x>".into())).is_err());
        assert!(preference_kind("maybe", None).is_err());
    }

    #[test]
    fn failed_build_releases_interned_symbols() {
        let mut table = SymbolTable::new();
        let before = table.len();
        let spec = RuleSpec::new(
            "bad",
            vec![cond("<s>", "color", "<< red <x> >>")],
            vec![ActionSpec::Halt],
        );
        let err = build_production(&spec, &mut table).unwrap_err();
        assert!(matches!(
            err,
            KernelError::Production(ProductionError::InvalidSpec { ref name, .. }) if name == "bad"
        ));
        assert_eq!(table.len(), before);
    }

    #[test]
    fn json_rule_file_parses() {
        let json = r#"{
            "rules": [{
                "name": "propose*wait",
                "conditions": [
                    {"id": "<s>", "attr": "type", "value": "state"},
                    {"id": "<s>", "attr": "count", "value": ["<n>", "< 10"]},
                    {"ncc": [{"id": "<s>", "attr": "done", "value": "*"}]}
                ],
                "actions": [
                    {"kind": "preference", "id": "<s>", "attr": "operator", "value": "<o>"},
                    {"kind": "preference", "id": "<o>", "attr": "next",
                     "value": {"call": "+", "args": ["<n>", 1]}},
                    {"kind": "write", "text": ["count ", "<n>"]}
                ]
            }]
        }"#;
        let file = RuleFile::from_json_str(json).unwrap();
        assert_eq!(file.rules.len(), 1);
        let rule = &file.rules[0];
        assert!(matches!(rule.conditions[2], ConditionSpec::Ncc { .. }));
        assert!(matches!(
            &rule.actions[1],
            ActionSpec::Preference { value: ValueSpec::Call { call, .. }, .. } if call == "+"
        ));

        let mut table = SymbolTable::new();
        let p = build_production(rule, &mut table).unwrap();
        assert_eq!(p.conditions.len(), 3);
        assert!(matches!(p.conditions[2], Condition::Ncc(ref inner) if inner.len() == 1));
        assert!(matches!(
            first_value_test(&p),
            Test::Equality(_)
        ));
    }

    #[test]
    fn toml_rule_file_parses() {
        let toml = r#"
            [[rules]]
            name = "apply*stop"
            support = "o-support"
            conditions = [
                { id = "<s>", attr = "operator", value = "<o>" },
                { id = "<o>", attr = "name", value = "stop", negated = true },
            ]
            actions = [{ kind = "halt" }]
        "#;
        let file = RuleFile::from_toml_str(toml).unwrap();
        let rule = &file.rules[0];
        assert_eq!(rule.support, SupportMode::OSupport);
        assert_eq!(rule.actions, vec![ActionSpec::Halt]);
        let ConditionSpec::Triple(t) = &rule.conditions[1] else {
            panic!("expected triple");
        };
        assert!(t.negated);
    }

    #[test]
    fn load_picks_format_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.toml");
        std::fs::write(
            &path,
            "[[rules]]\nname = \"r\"\nconditions = [{ id = \"<s>\", attr = \"a\", value = \"*\" }]\nactions = [{ kind = \"halt\" }]\n",
        )
        .unwrap();
        let file = RuleFile::load(&path).unwrap();
        assert_eq!(file.rules[0].name, "r");

        let missing = RuleFile::load(&dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(
            missing,
            KernelError::Production(ProductionError::RuleFile { .. })
        ));
    }
}
