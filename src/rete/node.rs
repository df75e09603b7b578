//! Beta network nodes, tokens and join tests.

use serde::{Deserialize, Serialize};

use crate::production::{ProductionId, RelOp};
use crate::symbol::{Symbol, SymbolTable, SymbolValue};
use crate::wm::{Timetag, Wme};

use super::alpha::AlphaId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "n{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TokenId(pub u32);

impl std::fmt::Display for TokenId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Field of a working memory element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Field {
    Id,
    Attr,
    Value,
}

impl Field {
    pub const ALL: [Field; 3] = [Field::Id, Field::Attr, Field::Value];

    pub fn of(self, wme: &Wme) -> Symbol {
        match self {
            Field::Id => wme.id,
            Field::Attr => wme.attr,
            Field::Value => wme.value,
        }
    }
}

/// Comparison applied by a join test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TestOp {
    Equal,
    Rel(RelOp),
}

/// A test performed when a token meets a candidate element.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JoinTest {
    /// Compare a field with a field bound earlier at token depth `depth`.
    Bound {
        field: Field,
        op: TestOp,
        depth: u32,
        bound: Field,
    },
    /// Compare two fields of the candidate itself.
    Intra { field: Field, op: TestOp, other: Field },
    /// Relational test against a constant.
    Constant { field: Field, op: RelOp, value: Symbol },
    Disjunction { field: Field, values: Vec<Symbol> },
    GoalId { field: Field },
    ImpasseId { field: Field },
}

impl JoinTest {
    /// Whether the test only looks at the candidate element.
    pub fn is_local(&self) -> bool {
        !matches!(self, JoinTest::Bound { .. })
    }
}

/// Apply `op` to `a` (candidate) and `b` (referent).
///
/// Ordering tests on values of different kinds are false. Integers and floats
/// compare numerically.
pub fn compare(op: TestOp, a: Symbol, b: Symbol, table: &SymbolTable) -> bool {
    let rel = match op {
        TestOp::Equal => return a == b,
        TestOp::Rel(rel) => rel,
    };
    if rel == RelOp::NotEqual {
        return a != b;
    }
    let (Some(va), Some(vb)) = (table.value(a), table.value(b)) else {
        return false;
    };
    if rel == RelOp::SameType {
        return va.kind() == vb.kind();
    }
    let ordering = match (va, vb) {
        (SymbolValue::Str(x), SymbolValue::Str(y)) => Some(x.cmp(y)),
        (
            SymbolValue::Identifier {
                letter: la,
                number: na,
            },
            SymbolValue::Identifier {
                letter: lb,
                number: nb,
            },
        ) => Some((la, na).cmp(&(lb, nb))),
        _ => match (va.as_number(), vb.as_number()) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => None,
        },
    };
    let Some(ordering) = ordering else {
        return false;
    };
    match rel {
        RelOp::Less => ordering.is_lt(),
        RelOp::LessOrEqual => ordering.is_le(),
        RelOp::Greater => ordering.is_gt(),
        RelOp::GreaterOrEqual => ordering.is_ge(),
        RelOp::NotEqual | RelOp::SameType => false,
    }
}

/// Test of a candidate element that needs nothing from the token.
pub fn passes_local(test: &JoinTest, wme: &Wme, table: &SymbolTable) -> bool {
    match test {
        JoinTest::Bound { .. } => true,
        JoinTest::Intra { field, op, other } => compare(*op, field.of(wme), other.of(wme), table),
        JoinTest::Constant { field, op, value } => {
            compare(TestOp::Rel(*op), field.of(wme), *value, table)
        }
        JoinTest::Disjunction { field, values } => {
            let v = field.of(wme);
            values.iter().any(|x| *x == v)
        }
        JoinTest::GoalId { field } => table.is_goal(field.of(wme)),
        JoinTest::ImpasseId { field } => {
            let v = field.of(wme);
            table.is_goal(v) && table.goal_level(v).is_some_and(|l| l > 1)
        }
    }
}

/// The role a node plays in the beta network.
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// Holds the single empty token every match starts from.
    Root,
    BetaMemory,
    Join {
        alpha: AlphaId,
        tests: Vec<JoinTest>,
    },
    Negative {
        alpha: AlphaId,
        tests: Vec<JoinTest>,
    },
    Ncc {
        partner: NodeId,
    },
    NccPartner {
        ncc: NodeId,
        /// Subnetwork results whose owner does not exist yet.
        buffer: Vec<TokenId>,
    },
    Production {
        production: ProductionId,
        /// Where each LHS variable is bound: (variable, depth, field).
        bindings: Vec<(Symbol, u32, Field)>,
    },
}

impl NodeKind {
    /// Nodes that create and own tokens.
    pub fn stores_tokens(&self) -> bool {
        !matches!(self, NodeKind::Join { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Root => "root",
            NodeKind::BetaMemory => "beta-memory",
            NodeKind::Join { .. } => "join",
            NodeKind::Negative { .. } => "negative",
            NodeKind::Ncc { .. } => "ncc",
            NodeKind::NccPartner { .. } => "ncc-partner",
            NodeKind::Production { .. } => "production",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    /// Tokens stored here. Partner results live with their owners instead.
    pub items: Vec<TokenId>,
    /// Depth of the tokens this node stores; for joins, the parent's depth.
    pub depth: u32,
}

impl Node {
    pub fn new(kind: NodeKind, parent: Option<NodeId>, depth: u32) -> Self {
        Self {
            kind,
            parent,
            children: Vec::new(),
            items: Vec::new(),
            depth,
        }
    }
}

/// A partial match: one element (or none) on top of a parent token.
#[derive(Debug, Clone)]
pub struct Token {
    pub node: NodeId,
    pub parent: Option<TokenId>,
    pub wme: Option<Timetag>,
    pub children: Vec<TokenId>,
    /// Negative nodes: elements currently blocking this token.
    pub blockers: Vec<Timetag>,
    /// NCC nodes: subnetwork results currently blocking this token.
    pub ncc_results: Vec<TokenId>,
    /// NCC partner results: the NCC token this result belongs to.
    pub owner: Option<TokenId>,
}

impl Token {
    pub fn new(node: NodeId, parent: Option<TokenId>, wme: Option<Timetag>) -> Self {
        Self {
            node,
            parent,
            wme,
            children: Vec::new(),
            blockers: Vec::new(),
            ncc_results: Vec::new(),
            owner: None,
        }
    }
}
