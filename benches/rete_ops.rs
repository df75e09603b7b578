//! Benchmarks for match network and decision cycle operations.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use soar_kernel::config::KernelConfig;
use soar_kernel::kernel::Reasoner;
use soar_kernel::loader::{build_production, ActionSpec, RuleFile, RuleSpec, TripleSpec};
use soar_kernel::production::ProductionId;
use soar_kernel::rete::Rete;
use soar_kernel::symbol::SymbolTable;
use soar_kernel::wm::{Timetag, Wme};

fn chain_rule() -> RuleSpec {
    RuleSpec::new(
        "chain",
        vec![
            TripleSpec::new("<x>", "next", "<y>").into(),
            TripleSpec::new("<y>", "next", "<z>").into(),
            TripleSpec::new("<z>", "weight", "> 5").into(),
        ],
        vec![ActionSpec::Halt],
    )
}

fn bench_add_remove(c: &mut Criterion) {
    let mut table = SymbolTable::new();
    let production = build_production(&chain_rule(), &mut table).unwrap();
    let mut rete = Rete::new();
    rete.compile(ProductionId(0), &production, &table).unwrap();

    let next = table.intern_str("next");
    let weight = table.intern_str("weight");
    let ids: Vec<_> = (0..200).map(|_| table.new_identifier('N')).collect();
    let mut wmes = Vec::new();
    for (i, pair) in ids.windows(2).enumerate() {
        let w = table.intern_int(i as i64 % 10);
        wmes.push((pair[0], next, pair[1]));
        wmes.push((pair[1], weight, w));
    }

    c.bench_function("rete_add_remove_400", |bench| {
        bench.iter(|| {
            for (i, &(id, attr, value)) in wmes.iter().enumerate() {
                let wme = Wme {
                    timetag: Timetag(i as u64 + 1),
                    id,
                    attr,
                    value,
                    acceptable: false,
                };
                rete.add_wme(&wme, &table);
            }
            black_box(rete.drain_changes());
            for i in 0..wmes.len() {
                rete.remove_wme(Timetag(i as u64 + 1), &table);
            }
            black_box(rete.drain_changes());
        })
    });
}

fn bench_counter_run(c: &mut Criterion) {
    let json = r#"{"rules": [
        {"name": "propose*init",
         "conditions": [{"id": "<s>", "attr": "superstate", "value": "nil"},
                        {"id": "<s>", "attr": "count", "value": "*", "negated": true}],
         "actions": [{"kind": "preference", "id": "<s>", "attr": "operator", "value": "<o>"},
                     {"kind": "preference", "id": "<o>", "attr": "name", "value": "init"}]},
        {"name": "apply*init",
         "conditions": [{"id": "<s>", "attr": "operator", "value": "<o>"},
                        {"id": "<o>", "attr": "name", "value": "init"}],
         "actions": [{"kind": "preference", "id": "<s>", "attr": "count", "value": 0}]},
        {"name": "propose*inc",
         "conditions": [{"id": "<s>", "attr": "superstate", "value": "nil"},
                        {"id": "<s>", "attr": "count", "value": ["<c>", "< 50"]}],
         "actions": [{"kind": "preference", "id": "<s>", "attr": "operator", "value": "<o>"},
                     {"kind": "preference", "id": "<o>", "attr": "name", "value": "inc"}]},
        {"name": "apply*inc",
         "conditions": [{"id": "<s>", "attr": "operator", "value": "<o>"},
                        {"id": "<o>", "attr": "name", "value": "inc"},
                        {"id": "<s>", "attr": "count", "value": "<c>"}],
         "actions": [{"kind": "preference", "id": "<s>", "attr": "count", "value": "<c>", "preference": "-"},
                     {"kind": "preference", "id": "<s>", "attr": "count", "value": {"call": "+", "args": ["<c>", 1]}}]},
        {"name": "stop",
         "conditions": [{"id": "<s>", "attr": "count", "value": 50}],
         "actions": [{"kind": "halt"}]}
    ]}"#;
    let file = RuleFile::from_json_str(json).unwrap();
    let mut reasoner = Reasoner::new(KernelConfig {
        wait_on_state_no_change: true,
        ..Default::default()
    })
    .unwrap();
    reasoner.load_rules(&file.rules).unwrap();

    c.bench_function("counter_to_50", |bench| {
        bench.iter(|| {
            reasoner.reset().unwrap();
            black_box(reasoner.run_decisions(100).unwrap())
        })
    });
}

criterion_group!(benches, bench_add_remove, bench_counter_run);
criterion_main!(benches);
