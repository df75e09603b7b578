//! Compiling productions into the network, and excising them again.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;

use crate::error::{KernelResult, ReteError};
use crate::production::{Condition, ConditionTriple, Production, ProductionId, Test};
use crate::symbol::{Symbol, SymbolTable};
use crate::wm::Wme;

use super::alpha::AlphaKey;
use super::node::{Field, JoinTest, Node, NodeId, NodeKind, TestOp};
use super::Rete;

/// Where each variable bound so far lives: token depth and field.
type Bindings = IndexMap<Symbol, (u32, Field)>;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate(def: &Production, table: &SymbolTable) -> Result<(), ReteError> {
    if !def
        .conditions
        .iter()
        .any(|c| matches!(c, Condition::Positive(_)))
    {
        return Err(ReteError::NoPositiveCondition {
            production: def.name.clone(),
        });
    }
    let mut bound = HashSet::new();
    validate_conditions(&def.conditions, &mut bound, def, table)?;
    def.check_actions(table)
}

fn validate_conditions(
    conditions: &[Condition],
    bound: &mut HashSet<Symbol>,
    def: &Production,
    table: &SymbolTable,
) -> Result<(), ReteError> {
    for cond in conditions {
        match cond {
            Condition::Positive(triple) => validate_triple(triple, bound, def, table)?,
            Condition::Negative(triple) => {
                let mut local = bound.clone();
                validate_triple(triple, &mut local, def, table)?;
            }
            Condition::Ncc(sub) => {
                if sub.is_empty() {
                    return Err(ReteError::EmptyNegation {
                        production: def.name.clone(),
                    });
                }
                let mut local = bound.clone();
                validate_conditions(sub, &mut local, def, table)?;
            }
        }
    }
    Ok(())
}

fn validate_triple(
    triple: &ConditionTriple,
    bound: &mut HashSet<Symbol>,
    def: &Production,
    table: &SymbolTable,
) -> Result<(), ReteError> {
    for field in triple.fields() {
        bound.extend(
            field
                .equality_symbols()
                .into_iter()
                .filter(|s| table.is_variable(*s)),
        );
    }
    for field in triple.fields() {
        for referent in relational_referents(field) {
            if table.is_variable(referent) && !bound.contains(&referent) {
                return Err(ReteError::UnboundVariable {
                    production: def.name.clone(),
                    variable: table.display(referent),
                });
            }
        }
    }
    Ok(())
}

fn relational_referents(test: &Test) -> Vec<Symbol> {
    match test {
        Test::Relational { referent, .. } => vec![*referent],
        Test::Disjunction(values) => values.clone(),
        Test::Conjunction(tests) => tests.iter().flat_map(relational_referents).collect(),
        _ => Vec::new(),
    }
}

fn flatten(test: &Test) -> Vec<&Test> {
    match test {
        Test::Conjunction(tests) => tests.iter().flat_map(flatten).collect(),
        other => vec![other],
    }
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

impl Rete {
    /// Compile a production into the network and return its production node.
    ///
    /// The whole production is validated before the network is touched, so a
    /// failed compile leaves it unchanged. Matches against elements already in
    /// the network are reported as `Assert` changes.
    pub fn compile(
        &mut self,
        production: ProductionId,
        def: &Production,
        table: &SymbolTable,
    ) -> KernelResult<NodeId> {
        validate(def, table)?;

        let mut bindings = Bindings::new();
        let cursor = self.build_conditions(self.root, &def.conditions, &mut bindings, table);
        let depth = self.child_depth(cursor);
        let exported = bindings
            .iter()
            .map(|(var, (depth, field))| (*var, *depth, *field))
            .collect();
        let node = self.attach(
            cursor,
            NodeKind::Production {
                production,
                bindings: exported,
            },
            depth,
        );
        self.populate(node, table);
        tracing::debug!(production = %def.name, node = %node, "production compiled");
        Ok(node)
    }

    fn build_conditions(
        &mut self,
        mut cursor: NodeId,
        conditions: &[Condition],
        bindings: &mut Bindings,
        table: &SymbolTable,
    ) -> NodeId {
        for cond in conditions {
            cursor = match cond {
                Condition::Positive(triple) => {
                    let memory = self.ensure_memory(cursor, table);
                    let depth = self.child_depth(memory);
                    let (key, tests) = self.condition_tests(triple, depth, bindings, table);
                    let alpha = self.alpha_for(key);
                    self.build_or_share(memory, NodeKind::Join { alpha, tests }, table)
                }
                Condition::Negative(triple) => {
                    let depth = self.child_depth(cursor);
                    let mut local = bindings.clone();
                    let (key, tests) = self.condition_tests(triple, depth, &mut local, table);
                    let alpha = self.alpha_for(key);
                    self.build_or_share(cursor, NodeKind::Negative { alpha, tests }, table)
                }
                Condition::Ncc(sub) => {
                    let mut local = bindings.clone();
                    let bottom = self.build_conditions(cursor, sub, &mut local, table);
                    self.build_or_share_ncc(cursor, bottom, table)
                }
            };
        }
        cursor
    }

    fn alpha_for(&mut self, key: AlphaKey) -> super::AlphaId {
        let mut existing: Vec<&Wme> = self.wmes.values().collect();
        existing.sort_by_key(|w| w.timetag);
        self.alpha.build_or_share(key, existing.into_iter())
    }

    /// Depth of tokens created by children of `node`.
    fn child_depth(&self, node: NodeId) -> u32 {
        self.node(node).map(|n| n.depth + 1).unwrap_or(1)
    }

    /// Joins hang below a root or beta memory; insert one when needed.
    fn ensure_memory(&mut self, cursor: NodeId, table: &SymbolTable) -> NodeId {
        match self.node(cursor).map(|n| &n.kind) {
            Some(NodeKind::Root) | Some(NodeKind::BetaMemory) => cursor,
            _ => self.build_or_share(cursor, NodeKind::BetaMemory, table),
        }
    }

    /// Split a condition into its alpha key and the tests joins must perform.
    fn condition_tests(
        &self,
        triple: &ConditionTriple,
        depth: u32,
        bindings: &mut Bindings,
        table: &SymbolTable,
    ) -> (AlphaKey, Vec<JoinTest>) {
        let mut key = AlphaKey {
            id: None,
            attr: None,
            value: None,
            acceptable: triple.acceptable,
        };
        let mut tests = Vec::new();
        let mut here: HashMap<Symbol, Field> = HashMap::new();

        let fields = [
            (Field::Id, &triple.id),
            (Field::Attr, &triple.attr),
            (Field::Value, &triple.value),
        ];

        // Equalities first, so relational tests can refer to bindings made in
        // the same condition.
        for (field, test) in fields {
            for atom in flatten(test) {
                let Test::Equality(sym) = atom else { continue };
                if table.is_variable(*sym) {
                    if let Some(other) = here.get(sym) {
                        tests.push(JoinTest::Intra {
                            field,
                            op: TestOp::Equal,
                            other: *other,
                        });
                    } else if let Some((d, bound)) = bindings.get(sym) {
                        tests.push(JoinTest::Bound {
                            field,
                            op: TestOp::Equal,
                            depth: *d,
                            bound: *bound,
                        });
                    } else {
                        here.insert(*sym, field);
                    }
                } else {
                    let slot = match field {
                        Field::Id => &mut key.id,
                        Field::Attr => &mut key.attr,
                        Field::Value => &mut key.value,
                    };
                    match *slot {
                        None => *slot = Some(*sym),
                        Some(existing) if existing == *sym => {}
                        Some(_) => tests.push(JoinTest::Disjunction {
                            field,
                            values: vec![*sym],
                        }),
                    }
                }
            }
        }

        for (field, test) in fields {
            for atom in flatten(test) {
                match atom {
                    Test::Blank | Test::Equality(_) | Test::Conjunction(_) => {}
                    Test::Relational { op, referent } => {
                        if !table.is_variable(*referent) {
                            tests.push(JoinTest::Constant {
                                field,
                                op: *op,
                                value: *referent,
                            });
                        } else if let Some(other) = here.get(referent) {
                            tests.push(JoinTest::Intra {
                                field,
                                op: TestOp::Rel(*op),
                                other: *other,
                            });
                        } else if let Some((d, bound)) = bindings.get(referent) {
                            tests.push(JoinTest::Bound {
                                field,
                                op: TestOp::Rel(*op),
                                depth: *d,
                                bound: *bound,
                            });
                        }
                    }
                    Test::Disjunction(values) => tests.push(JoinTest::Disjunction {
                        field,
                        values: values.clone(),
                    }),
                    Test::GoalId => tests.push(JoinTest::GoalId { field }),
                    Test::ImpasseId => tests.push(JoinTest::ImpasseId { field }),
                }
            }
        }

        for (var, field) in here {
            bindings.insert(var, (depth, field));
        }
        (key, tests)
    }

    fn build_or_share(&mut self, parent: NodeId, kind: NodeKind, table: &SymbolTable) -> NodeId {
        let existing = self.children_of(parent).into_iter().find(|child| {
            let Some(node) = self.node(*child) else {
                return false;
            };
            match (&node.kind, &kind) {
                (NodeKind::BetaMemory, NodeKind::BetaMemory) => true,
                (
                    NodeKind::Join { alpha: a, tests: t },
                    NodeKind::Join {
                        alpha: b,
                        tests: u,
                    },
                ) => a == b && t == u,
                (
                    NodeKind::Negative { alpha: a, tests: t },
                    NodeKind::Negative {
                        alpha: b,
                        tests: u,
                    },
                ) => a == b && t == u,
                _ => false,
            }
        });
        if let Some(node) = existing {
            return node;
        }

        let depth = match kind {
            NodeKind::Join { .. } => self.node(parent).map(|n| n.depth).unwrap_or(0),
            _ => self.child_depth(parent),
        };
        let alpha = match &kind {
            NodeKind::Join { alpha, .. } | NodeKind::Negative { alpha, .. } => Some(*alpha),
            _ => None,
        };
        let stores_tokens = kind.stores_tokens();
        let node = self.attach(parent, kind, depth);
        if let Some(am) = alpha {
            if let Some(memory) = self.alpha.get_mut(am) {
                memory.successors.insert(0, node);
            }
        }
        if stores_tokens {
            self.populate(node, table);
        }
        node
    }

    fn build_or_share_ncc(&mut self, parent: NodeId, bottom: NodeId, table: &SymbolTable) -> NodeId {
        let existing = self.children_of(parent).into_iter().find(|child| {
            match self.node(*child).map(|n| &n.kind) {
                Some(NodeKind::Ncc { partner }) => {
                    self.node(*partner).and_then(|p| p.parent) == Some(bottom)
                }
                _ => false,
            }
        });
        if let Some(node) = existing {
            return node;
        }

        let ncc_depth = self.child_depth(parent);
        let partner_depth = self.child_depth(bottom);
        let ncc = self.attach(parent, NodeKind::Ncc { partner: NodeId(0) }, ncc_depth);
        let partner = self.attach(
            bottom,
            NodeKind::NccPartner {
                ncc,
                buffer: Vec::new(),
            },
            partner_depth,
        );
        if let Some(node) = self.node_mut(ncc) {
            node.kind = NodeKind::Ncc { partner };
        }
        self.populate(ncc, table);
        self.populate(partner, table);
        ncc
    }

    fn attach(&mut self, parent: NodeId, kind: NodeKind, depth: u32) -> NodeId {
        let node = self.alloc_node(Node::new(kind, Some(parent), depth));
        if let Some(p) = self.node_mut(parent) {
            p.children.push(node);
        }
        node
    }

    /// Feed a new node every match that already exists above it.
    fn populate(&mut self, node: NodeId, table: &SymbolTable) {
        let Some(parent) = self.node(node).and_then(|n| n.parent) else {
            return;
        };
        match self.node(parent).map(|n| &n.kind) {
            Some(NodeKind::Join { alpha, .. }) => {
                let candidates: Vec<_> = self
                    .alpha
                    .get(*alpha)
                    .map(|m| m.items.iter().copied().collect())
                    .unwrap_or_default();
                let saved = match self.node_mut(parent) {
                    Some(p) => std::mem::replace(&mut p.children, vec![node]),
                    None => return,
                };
                for tt in candidates {
                    self.right_activate(parent, tt, table);
                }
                if let Some(p) = self.node_mut(parent) {
                    p.children = saved;
                }
            }
            Some(_) => {
                for tok in self.active_items(parent) {
                    self.left_activate(node, tok, None, table);
                }
            }
            None => {}
        }
    }

    // -----------------------------------------------------------------------
    // Excision
    // -----------------------------------------------------------------------

    /// Remove a production node and every node left without successors.
    ///
    /// Its current matches are reported as `Retract` changes.
    pub fn excise(&mut self, node: NodeId, table: &SymbolTable) -> KernelResult<()> {
        match self.node(node).map(|n| &n.kind) {
            Some(NodeKind::Production { .. }) => {}
            _ => return Err(ReteError::UnknownNode { node: node.0 }.into()),
        }
        self.delete_node_and_unused_ancestors(node, table);
        Ok(())
    }

    fn delete_node_and_unused_ancestors(&mut self, node: NodeId, table: &SymbolTable) {
        if node == self.root {
            return;
        }
        while let Some(tok) = self.node(node).and_then(|n| n.items.last().copied()) {
            self.delete_token(tok, table);
        }
        let Some(kind) = self.node(node).map(|n| n.kind.clone()) else {
            return;
        };
        match kind {
            NodeKind::Ncc { partner } => self.delete_node_and_unused_ancestors(partner, table),
            NodeKind::NccPartner { buffer, .. } => {
                for result in buffer {
                    self.delete_token(result, table);
                }
            }
            NodeKind::Join { alpha, .. } | NodeKind::Negative { alpha, .. } => {
                let orphaned = match self.alpha.get_mut(alpha) {
                    Some(memory) => {
                        memory.successors.retain(|n| *n != node);
                        memory.successors.is_empty()
                    }
                    None => false,
                };
                if orphaned {
                    if let Some(memory) = self.alpha.remove(alpha) {
                        for tt in memory.items {
                            if let Some(list) = self.wme_alpha.get_mut(&tt) {
                                list.retain(|a| *a != alpha);
                            }
                        }
                    }
                }
            }
            _ => {}
        }

        let parent = self.node(node).and_then(|n| n.parent);
        if let Some(slot) = self.nodes.get_mut(node.0 as usize) {
            *slot = None;
            self.free_nodes.push(node.0);
        }
        if let Some(parent) = parent {
            let now_empty = match self.node_mut(parent) {
                Some(p) => {
                    p.children.retain(|c| *c != node);
                    p.children.is_empty()
                }
                None => false,
            };
            if now_empty {
                self.delete_node_and_unused_ancestors(parent, table);
            }
        }
    }
}
