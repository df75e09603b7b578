//! Incremental matching must agree with matching from scratch.
//!
//! A seeded random walk adds and removes elements on one network; at
//! checkpoints a fresh network is built from the surviving elements (with the
//! productions compiled after the elements are present) and both must report
//! the same complete matches for every production.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use soar_kernel::loader::{ActionSpec, ConditionSpec, RuleSpec, TestSpec, TripleSpec, build_production};
use soar_kernel::production::{Production, ProductionId};
use soar_kernel::rete::{NodeId, Rete};
use soar_kernel::symbol::{Symbol, SymbolTable};
use soar_kernel::wm::{Timetag, Wme};

fn c(id: &str, attr: &str, value: impl Into<TestSpec>) -> ConditionSpec {
    TripleSpec::new(id, attr, value).into()
}

fn rules() -> Vec<RuleSpec> {
    let halt = || vec![ActionSpec::Halt];
    vec![
        RuleSpec::new("chain", vec![c("<x>", "a", "<y>"), c("<y>", "b", "<z>")], halt()),
        RuleSpec::new(
            "negated",
            vec![
                c("<x>", "a", "<y>"),
                TripleSpec::new("<y>", "c", "*").negated().into(),
            ],
            halt(),
        ),
        RuleSpec::new(
            "ncc",
            vec![
                c("<x>", "b", "<y>"),
                ConditionSpec::Ncc {
                    ncc: vec![c("<y>", "a", "<z>"), c("<z>", "c", "> 1")],
                },
            ],
            halt(),
        ),
        RuleSpec::new(
            "relational",
            vec![
                c("<x>", "c", "<n>"),
                c("<x>", "c", TestSpec::All(vec!["<m>".into(), "> <n>".into()])),
            ],
            halt(),
        ),
        RuleSpec::new(
            "disjunction",
            vec![c("<x>", "c", "<< 1 3 >>"), c("<x>", "a", "<y>")],
            halt(),
        ),
        RuleSpec::new(
            "shared-prefix",
            vec![
                c("<x>", "a", "<y>"),
                c("<y>", "b", "<z>"),
                c("<z>", "c", "<n>"),
            ],
            halt(),
        ),
    ]
}

struct Universe {
    table: SymbolTable,
    productions: Vec<Production>,
    ids: Vec<Symbol>,
    attrs: Vec<Symbol>,
    numbers: Vec<Symbol>,
}

impl Universe {
    fn new() -> Self {
        let mut table = SymbolTable::new();
        let productions = rules()
            .iter()
            .map(|r| build_production(r, &mut table).unwrap())
            .collect();
        let ids = (0..5).map(|_| table.new_identifier('X')).collect();
        let attrs = ["a", "b", "c"].iter().map(|a| table.intern_str(a)).collect();
        let numbers = (1..=3).map(|i| table.intern_int(i)).collect();
        Self {
            table,
            productions,
            ids,
            attrs,
            numbers,
        }
    }

    fn compile(&self, rete: &mut Rete) -> Vec<NodeId> {
        self.productions
            .iter()
            .enumerate()
            .map(|(i, p)| rete.compile(ProductionId(i as u32), p, &self.table).unwrap())
            .collect()
    }

    fn random_triple(&self, rng: &mut StdRng) -> (Symbol, Symbol, Symbol) {
        let id = self.ids[rng.gen_range(0..self.ids.len())];
        let attr_index = rng.gen_range(0..self.attrs.len());
        let value = if attr_index == 2 {
            self.numbers[rng.gen_range(0..self.numbers.len())]
        } else {
            self.ids[rng.gen_range(0..self.ids.len())]
        };
        (id, self.attrs[attr_index], value)
    }
}

fn snapshot(rete: &Rete, nodes: &[NodeId]) -> Vec<Vec<Vec<Timetag>>> {
    nodes
        .iter()
        .map(|n| {
            let mut m = rete.matches(*n);
            m.sort();
            m
        })
        .collect()
}

fn from_scratch(universe: &Universe, live: &[Wme]) -> Vec<Vec<Vec<Timetag>>> {
    let mut rete = Rete::new();
    for wme in live {
        rete.add_wme(wme, &universe.table);
    }
    let nodes = universe.compile(&mut rete);
    snapshot(&rete, &nodes)
}

fn random_walk(seed: u64) {
    let universe = Universe::new();
    let mut rng = StdRng::seed_from_u64(seed);
    let mut rete = Rete::new();
    let nodes = universe.compile(&mut rete);
    let mut live: Vec<Wme> = Vec::new();
    let mut next = 0u64;

    for step in 1..=300 {
        if live.is_empty() || rng.gen_bool(0.6) {
            let (id, attr, value) = universe.random_triple(&mut rng);
            if live.iter().any(|w| w.triple() == (id, attr, value)) {
                continue;
            }
            next += 1;
            let wme = Wme {
                timetag: Timetag(next),
                id,
                attr,
                value,
                acceptable: false,
            };
            rete.add_wme(&wme, &universe.table);
            live.push(wme);
        } else {
            let index = rng.gen_range(0..live.len());
            let wme = live.remove(index);
            rete.remove_wme(wme.timetag, &universe.table);
        }
        rete.drain_changes();

        if step % 25 == 0 {
            assert_eq!(
                snapshot(&rete, &nodes),
                from_scratch(&universe, &live),
                "seed {seed}, step {step}"
            );
        }
    }
}

#[test]
fn incremental_matches_equal_batch_matches() {
    for seed in 0..6 {
        random_walk(seed);
    }
}

#[test]
fn removing_everything_leaves_no_tokens() {
    let universe = Universe::new();
    let mut rng = StdRng::seed_from_u64(42);
    let mut rete = Rete::new();
    let nodes = universe.compile(&mut rete);
    let mut live: Vec<Wme> = Vec::new();
    for i in 1..=60u64 {
        let (id, attr, value) = universe.random_triple(&mut rng);
        if live.iter().any(|w| w.triple() == (id, attr, value)) {
            continue;
        }
        let wme = Wme {
            timetag: Timetag(i),
            id,
            attr,
            value,
            acceptable: false,
        };
        rete.add_wme(&wme, &universe.table);
        live.push(wme);
    }
    for wme in live.drain(..) {
        rete.remove_wme(wme.timetag, &universe.table);
    }
    let stats = rete.stats();
    assert_eq!(stats.wmes, 0);
    for node in nodes {
        assert!(rete.matches(node).is_empty());
    }
}
