//! Rete match network.
//!
//! Productions are compiled into a shared discrimination network: alpha
//! memories select elements by their constant fields, and a beta network of
//! joins, negative nodes and negated-conjunction (NCC) nodes builds partial
//! matches (tokens) from them. Adding or removing an element propagates
//! incrementally; every production token created or deleted is recorded as a
//! [`MatchChange`] that the kernel drains after each batch.
//!
//! Nodes and tokens live in arenas addressed by [`NodeId`] and [`TokenId`].
//! The network keeps its own copy of every element it has seen so that tests
//! never reach back into working memory.

pub mod alpha;
mod builder;
pub mod node;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::production::ProductionId;
use crate::symbol::{Symbol, SymbolTable};
use crate::wm::{Timetag, Wme};

pub use alpha::{AlphaId, AlphaKey, AlphaNetwork};
pub use node::{Field, JoinTest, Node, NodeId, NodeKind, TestOp, Token, TokenId};

/// A change in the set of complete matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchChange {
    Assert {
        production: ProductionId,
        token: TokenId,
        /// Matched elements, outermost condition first.
        wmes: Vec<Timetag>,
        /// Values of the production's LHS variables.
        bindings: Vec<(Symbol, Symbol)>,
    },
    Retract {
        production: ProductionId,
        token: TokenId,
    },
}

impl MatchChange {
    pub fn production(&self) -> ProductionId {
        match self {
            MatchChange::Assert { production, .. } | MatchChange::Retract { production, .. } => {
                *production
            }
        }
    }
}

/// Size counters for the network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReteStats {
    pub alpha_memories: usize,
    pub beta_memories: usize,
    pub joins: usize,
    pub negatives: usize,
    pub nccs: usize,
    pub productions: usize,
    pub tokens: usize,
    pub wmes: usize,
}

impl std::fmt::Display for ReteStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "alpha: {}, beta: {}, join: {}, negative: {}, ncc: {}, production: {}, tokens: {}, wmes: {}",
            self.alpha_memories,
            self.beta_memories,
            self.joins,
            self.negatives,
            self.nccs,
            self.productions,
            self.tokens,
            self.wmes
        )
    }
}

/// The match network.
#[derive(Debug)]
pub struct Rete {
    alpha: AlphaNetwork,
    nodes: Vec<Option<Node>>,
    free_nodes: Vec<u32>,
    tokens: Vec<Option<Token>>,
    free_tokens: Vec<u32>,
    root: NodeId,
    /// Copies of every element currently in the network.
    wmes: HashMap<Timetag, Wme>,
    wme_alpha: HashMap<Timetag, Vec<AlphaId>>,
    /// Tokens that hold an element.
    wme_tokens: HashMap<Timetag, Vec<TokenId>>,
    /// Negative-node tokens an element blocks.
    wme_blocking: HashMap<Timetag, Vec<TokenId>>,
    changes: Vec<MatchChange>,
}

impl Rete {
    pub fn new() -> Self {
        let mut rete = Self {
            alpha: AlphaNetwork::new(),
            nodes: Vec::new(),
            free_nodes: Vec::new(),
            tokens: Vec::new(),
            free_tokens: Vec::new(),
            root: NodeId(0),
            wmes: HashMap::new(),
            wme_alpha: HashMap::new(),
            wme_tokens: HashMap::new(),
            wme_blocking: HashMap::new(),
            changes: Vec::new(),
        };
        let root = rete.alloc_node(Node::new(NodeKind::Root, None, 0));
        let dummy = rete.alloc_token(Token::new(root, None, None));
        if let Some(node) = rete.node_mut(root) {
            node.items.push(dummy);
        }
        rete.root = root;
        rete
    }

    // -----------------------------------------------------------------------
    // Arena access
    // -----------------------------------------------------------------------

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0 as usize).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id.0 as usize).and_then(Option::as_mut)
    }

    pub fn token(&self, id: TokenId) -> Option<&Token> {
        self.tokens.get(id.0 as usize).and_then(Option::as_ref)
    }

    fn token_mut(&mut self, id: TokenId) -> Option<&mut Token> {
        self.tokens.get_mut(id.0 as usize).and_then(Option::as_mut)
    }

    fn alloc_node(&mut self, node: Node) -> NodeId {
        match self.free_nodes.pop() {
            Some(slot) => {
                self.nodes[slot as usize] = Some(node);
                NodeId(slot)
            }
            None => {
                self.nodes.push(Some(node));
                NodeId(self.nodes.len() as u32 - 1)
            }
        }
    }

    fn alloc_token(&mut self, token: Token) -> TokenId {
        match self.free_tokens.pop() {
            Some(slot) => {
                self.tokens[slot as usize] = Some(token);
                TokenId(slot)
            }
            None => {
                self.tokens.push(Some(token));
                TokenId(self.tokens.len() as u32 - 1)
            }
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    fn children_of(&self, node: NodeId) -> Vec<NodeId> {
        self.node(node).map(|n| n.children.clone()).unwrap_or_default()
    }

    fn items_of(&self, node: NodeId) -> Vec<TokenId> {
        self.node(node).map(|n| n.items.clone()).unwrap_or_default()
    }

    // -----------------------------------------------------------------------
    // Element propagation
    // -----------------------------------------------------------------------

    /// Add an element and propagate it. Adding a known timetag is a no-op.
    pub fn add_wme(&mut self, wme: &Wme, table: &SymbolTable) {
        if self.wmes.contains_key(&wme.timetag) {
            return;
        }
        self.wmes.insert(wme.timetag, wme.clone());
        let memories = self.alpha.memories_for(wme);
        tracing::trace!(timetag = %wme.timetag, alpha_memories = memories.len(), "rete add");
        for am in &memories {
            let successors = match self.alpha.get_mut(*am) {
                Some(memory) => {
                    memory.items.insert(wme.timetag);
                    memory.successors.clone()
                }
                None => continue,
            };
            self.wme_alpha.entry(wme.timetag).or_default().push(*am);
            for node in successors {
                self.right_activate(node, wme.timetag, table);
            }
        }
    }

    /// Remove an element and retract everything that depended on it.
    pub fn remove_wme(&mut self, tt: Timetag, table: &SymbolTable) {
        if self.wmes.remove(&tt).is_none() {
            return;
        }
        tracing::trace!(timetag = %tt, "rete remove");
        for am in self.wme_alpha.remove(&tt).unwrap_or_default() {
            if let Some(memory) = self.alpha.get_mut(am) {
                memory.items.shift_remove(&tt);
            }
        }
        let mut doomed = self.wme_tokens.remove(&tt).unwrap_or_default();
        // NCC owners go before their subnetwork tokens, otherwise freeing a
        // partner result would unblock an owner that is about to be deleted.
        doomed.sort_by_key(|t| !self.is_ncc_token(*t));
        for tok in doomed {
            if self.token(tok).is_some_and(|t| t.wme == Some(tt)) {
                self.delete_token(tok, table);
            }
        }
        for tok in self.wme_blocking.remove(&tt).unwrap_or_default() {
            let unblocked = match self.token_mut(tok) {
                Some(t) if t.blockers.contains(&tt) => {
                    t.blockers.retain(|b| *b != tt);
                    t.blockers.is_empty()
                }
                _ => false,
            };
            if unblocked {
                let node = match self.token(tok) {
                    Some(t) => t.node,
                    None => continue,
                };
                for child in self.children_of(node) {
                    self.left_activate(child, tok, None, table);
                }
            }
        }
    }

    pub fn contains_wme(&self, tt: Timetag) -> bool {
        self.wmes.contains_key(&tt)
    }

    /// Take the match changes recorded since the last drain.
    pub fn drain_changes(&mut self) -> Vec<MatchChange> {
        std::mem::take(&mut self.changes)
    }

    // -----------------------------------------------------------------------
    // Activations
    // -----------------------------------------------------------------------

    fn right_activate(&mut self, node: NodeId, tt: Timetag, table: &SymbolTable) {
        let Some(n) = self.node(node) else { return };
        match &n.kind {
            NodeKind::Join { .. } => {
                let Some(parent) = n.parent else { return };
                for tok in self.active_items(parent) {
                    if self.passes(node, tok, tt, table) {
                        for child in self.children_of(node) {
                            self.left_activate(child, tok, Some(tt), table);
                        }
                    }
                }
            }
            NodeKind::Negative { .. } => {
                for tok in self.items_of(node) {
                    if !self.passes(node, tok, tt, table) {
                        continue;
                    }
                    let was_unblocked = self.token(tok).is_some_and(|t| t.blockers.is_empty());
                    if was_unblocked {
                        self.delete_descendants(tok, table);
                    }
                    if let Some(t) = self.token_mut(tok) {
                        t.blockers.push(tt);
                    }
                    self.wme_blocking.entry(tt).or_default().push(tok);
                }
            }
            _ => {}
        }
    }

    /// Tokens of a memory-type node that are visible to its children.
    fn active_items(&self, node: NodeId) -> Vec<TokenId> {
        let Some(n) = self.node(node) else {
            return Vec::new();
        };
        n.items
            .iter()
            .copied()
            .filter(|t| match (&n.kind, self.token(*t)) {
                (NodeKind::Negative { .. }, Some(tok)) => tok.blockers.is_empty(),
                (NodeKind::Ncc { .. }, Some(tok)) => tok.ncc_results.is_empty(),
                (_, Some(_)) => true,
                (_, None) => false,
            })
            .collect()
    }

    fn left_activate(
        &mut self,
        node: NodeId,
        parent: TokenId,
        wme: Option<Timetag>,
        table: &SymbolTable,
    ) {
        let Some(n) = self.node(node) else { return };
        match &n.kind {
            NodeKind::Root => {}
            NodeKind::BetaMemory => {
                let tok = self.make_token(node, parent, wme);
                for child in self.children_of(node) {
                    self.left_activate(child, tok, None, table);
                }
            }
            NodeKind::Join { alpha, .. } => {
                let candidates: Vec<Timetag> = self
                    .alpha
                    .get(*alpha)
                    .map(|m| m.items.iter().copied().collect())
                    .unwrap_or_default();
                for tt in candidates {
                    if self.passes(node, parent, tt, table) {
                        for child in self.children_of(node) {
                            self.left_activate(child, parent, Some(tt), table);
                        }
                    }
                }
            }
            NodeKind::Negative { alpha, .. } => {
                let candidates: Vec<Timetag> = self
                    .alpha
                    .get(*alpha)
                    .map(|m| m.items.iter().copied().collect())
                    .unwrap_or_default();
                let tok = self.make_token(node, parent, wme);
                for tt in candidates {
                    if self.passes(node, tok, tt, table) {
                        if let Some(t) = self.token_mut(tok) {
                            t.blockers.push(tt);
                        }
                        self.wme_blocking.entry(tt).or_default().push(tok);
                    }
                }
                if self.token(tok).is_some_and(|t| t.blockers.is_empty()) {
                    for child in self.children_of(node) {
                        self.left_activate(child, tok, None, table);
                    }
                }
            }
            NodeKind::Ncc { partner } => {
                let partner = *partner;
                let tok = self.make_token(node, parent, wme);
                let buffered = match self.node(partner).map(|p| &p.kind) {
                    Some(NodeKind::NccPartner { buffer, .. }) => buffer.clone(),
                    _ => Vec::new(),
                };
                let mut claimed = Vec::new();
                for result in buffered {
                    if self.owner_of(partner, result) == Some(tok) {
                        claimed.push(result);
                    }
                }
                if let Some(NodeKind::NccPartner { buffer, .. }) =
                    self.node_mut(partner).map(|p| &mut p.kind)
                {
                    buffer.retain(|r| !claimed.contains(r));
                }
                for result in &claimed {
                    if let Some(r) = self.token_mut(*result) {
                        r.owner = Some(tok);
                    }
                }
                let blocked = !claimed.is_empty();
                if let Some(t) = self.token_mut(tok) {
                    t.ncc_results = claimed;
                }
                if !blocked {
                    for child in self.children_of(node) {
                        self.left_activate(child, tok, None, table);
                    }
                }
            }
            NodeKind::NccPartner { .. } => {
                let result = self.make_token(node, parent, wme);
                match self.owner_of(node, result) {
                    Some(owner) => {
                        let first = self.token(owner).is_some_and(|o| o.ncc_results.is_empty());
                        if let Some(r) = self.token_mut(result) {
                            r.owner = Some(owner);
                        }
                        if let Some(o) = self.token_mut(owner) {
                            o.ncc_results.push(result);
                        }
                        if first {
                            self.delete_descendants(owner, table);
                        }
                    }
                    None => {
                        if let Some(NodeKind::NccPartner { buffer, .. }) =
                            self.node_mut(node).map(|p| &mut p.kind)
                        {
                            buffer.push(result);
                        }
                    }
                }
            }
            NodeKind::Production {
                production,
                bindings,
            } => {
                let production = *production;
                let bindings = bindings.clone();
                let tok = self.make_token(node, parent, wme);
                let chain = self.chain(tok);
                let wmes: Vec<Timetag> = chain.iter().filter_map(|w| *w).collect();
                let values = bindings
                    .iter()
                    .filter_map(|(var, depth, field)| {
                        let tt = chain.get(*depth as usize).copied().flatten()?;
                        let wme = self.wmes.get(&tt)?;
                        Some((*var, field.of(wme)))
                    })
                    .collect();
                tracing::trace!(production = %production, token = %tok, "match asserted");
                self.changes.push(MatchChange::Assert {
                    production,
                    token: tok,
                    wmes,
                    bindings: values,
                });
            }
        }
    }

    /// Find the NCC token owning a partner result.
    ///
    /// The result's ancestor at the NCC node's depth shares its parent (and,
    /// when the NCC hangs below a join, its element) with the owner.
    fn owner_of(&self, partner: NodeId, result: TokenId) -> Option<TokenId> {
        let partner_node = self.node(partner)?;
        let NodeKind::NccPartner { ncc, .. } = partner_node.kind else {
            return None;
        };
        let ncc_node = self.node(ncc)?;
        let mut ancestor = result;
        for _ in ncc_node.depth..partner_node.depth {
            ancestor = self.token(ancestor)?.parent?;
        }
        let a = self.token(ancestor)?;
        ncc_node.items.iter().copied().find(|o| {
            self.token(*o).is_some_and(|owner| {
                owner.parent == a.parent && (owner.wme.is_none() || owner.wme == a.wme)
            })
        })
    }

    fn make_token(&mut self, node: NodeId, parent: TokenId, wme: Option<Timetag>) -> TokenId {
        let tok = self.alloc_token(Token::new(node, Some(parent), wme));
        if let Some(p) = self.token_mut(parent) {
            p.children.push(tok);
        }
        let is_partner = matches!(
            self.node(node).map(|n| &n.kind),
            Some(NodeKind::NccPartner { .. })
        );
        if !is_partner {
            if let Some(n) = self.node_mut(node) {
                n.items.push(tok);
            }
        }
        if let Some(tt) = wme {
            self.wme_tokens.entry(tt).or_default().push(tok);
        }
        tok
    }

    /// Elements of a token's chain indexed by depth; index 0 is the root.
    fn chain(&self, tok: TokenId) -> Vec<Option<Timetag>> {
        let mut chain = Vec::new();
        let mut current = Some(tok);
        while let Some(id) = current {
            let Some(t) = self.token(id) else { break };
            chain.push(t.wme);
            current = t.parent;
        }
        chain.reverse();
        chain
    }

    /// Run a join or negative node's tests of `tok` against element `tt`.
    fn passes(&self, node: NodeId, tok: TokenId, tt: Timetag, table: &SymbolTable) -> bool {
        let Some(n) = self.node(node) else {
            return false;
        };
        let tests = match &n.kind {
            NodeKind::Join { tests, .. } | NodeKind::Negative { tests, .. } => tests,
            _ => return true,
        };
        let Some(wme) = self.wmes.get(&tt) else {
            return false;
        };
        for test in tests {
            let ok = match test {
                JoinTest::Bound {
                    field,
                    op,
                    depth,
                    bound,
                } => match self.wme_at_depth(tok, n.depth, *depth) {
                    Some(other) => node::compare(*op, field.of(wme), bound.of(other), table),
                    None => false,
                },
                local => node::passes_local(local, wme, table),
            };
            if !ok {
                return false;
            }
        }
        true
    }

    fn wme_at_depth(&self, tok: TokenId, tok_depth: u32, depth: u32) -> Option<&Wme> {
        let mut current = tok;
        for _ in depth..tok_depth {
            current = self.token(current)?.parent?;
        }
        let tt = self.token(current)?.wme?;
        self.wmes.get(&tt)
    }

    // -----------------------------------------------------------------------
    // Token deletion
    // -----------------------------------------------------------------------

    fn delete_descendants(&mut self, tok: TokenId, table: &SymbolTable) {
        while let Some(child) = self.next_child_to_delete(tok) {
            self.delete_token(child, table);
        }
    }

    /// Children on NCC nodes first, then the newest child.
    fn next_child_to_delete(&self, tok: TokenId) -> Option<TokenId> {
        let children = &self.token(tok)?.children;
        children
            .iter()
            .rev()
            .copied()
            .find(|c| self.is_ncc_token(*c))
            .or_else(|| children.last().copied())
    }

    fn is_ncc_token(&self, tok: TokenId) -> bool {
        self.token(tok)
            .and_then(|t| self.node(t.node))
            .is_some_and(|n| matches!(n.kind, NodeKind::Ncc { .. }))
    }

    fn delete_token(&mut self, tok: TokenId, table: &SymbolTable) {
        self.delete_descendants(tok, table);
        let Some(token) = self.tokens.get_mut(tok.0 as usize).and_then(Option::take) else {
            return;
        };
        self.free_tokens.push(tok.0);

        if let Some(tt) = token.wme {
            if let Some(list) = self.wme_tokens.get_mut(&tt) {
                list.retain(|t| *t != tok);
            }
        }
        if let Some(parent) = token.parent {
            if let Some(p) = self.token_mut(parent) {
                p.children.retain(|t| *t != tok);
            }
        }
        for tt in &token.blockers {
            if let Some(list) = self.wme_blocking.get_mut(tt) {
                list.retain(|t| *t != tok);
            }
        }
        for result in &token.ncc_results {
            self.free_result(*result);
        }

        let kind = self.node(token.node).map(|n| n.kind.clone());
        match kind {
            Some(NodeKind::NccPartner { ncc, .. }) => match token.owner {
                Some(owner) => {
                    let emptied = match self.token_mut(owner) {
                        Some(o) => {
                            o.ncc_results.retain(|r| *r != tok);
                            o.ncc_results.is_empty()
                        }
                        None => false,
                    };
                    if emptied {
                        for child in self.children_of(ncc) {
                            self.left_activate(child, owner, None, table);
                        }
                    }
                }
                None => {
                    if let Some(NodeKind::NccPartner { buffer, .. }) =
                        self.node_mut(token.node).map(|n| &mut n.kind)
                    {
                        buffer.retain(|r| *r != tok);
                    }
                }
            },
            Some(NodeKind::Production { production, .. }) => {
                self.remove_item(token.node, tok);
                tracing::trace!(production = %production, token = %tok, "match retracted");
                self.changes.push(MatchChange::Retract {
                    production,
                    token: tok,
                });
            }
            Some(_) => self.remove_item(token.node, tok),
            None => {}
        }
    }

    /// Free an NCC result whose owner is going away.
    fn free_result(&mut self, result: TokenId) {
        let Some(token) = self.tokens.get_mut(result.0 as usize).and_then(Option::take) else {
            return;
        };
        self.free_tokens.push(result.0);
        if let Some(tt) = token.wme {
            if let Some(list) = self.wme_tokens.get_mut(&tt) {
                list.retain(|t| *t != result);
            }
        }
        if let Some(parent) = token.parent {
            if let Some(p) = self.token_mut(parent) {
                p.children.retain(|t| *t != result);
            }
        }
    }

    fn remove_item(&mut self, node: NodeId, tok: TokenId) {
        if let Some(n) = self.node_mut(node) {
            n.items.retain(|t| *t != tok);
        }
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    /// Current complete matches of a production node.
    pub fn matches(&self, node: NodeId) -> Vec<Vec<Timetag>> {
        let Some(n) = self.node(node) else {
            return Vec::new();
        };
        if !matches!(n.kind, NodeKind::Production { .. }) {
            return Vec::new();
        }
        n.items
            .iter()
            .map(|t| self.chain(*t).into_iter().flatten().collect())
            .collect()
    }

    pub fn stats(&self) -> ReteStats {
        let mut stats = ReteStats {
            alpha_memories: self.alpha.len(),
            wmes: self.wmes.len(),
            tokens: self.tokens.iter().filter(|t| t.is_some()).count(),
            ..Default::default()
        };
        for node in self.nodes.iter().flatten() {
            match node.kind {
                NodeKind::BetaMemory => stats.beta_memories += 1,
                NodeKind::Join { .. } => stats.joins += 1,
                NodeKind::Negative { .. } => stats.negatives += 1,
                NodeKind::Ncc { .. } => stats.nccs += 1,
                NodeKind::Production { .. } => stats.productions += 1,
                NodeKind::Root | NodeKind::NccPartner { .. } => {}
            }
        }
        stats
    }
}

impl Default for Rete {
    fn default() -> Self {
        Self::new()
    }
}
