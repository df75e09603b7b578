//! Preference semantics: turn one slot's preferences into a decision.
//!
//! The evaluation runs on a snapshot of the slot. It never fails: a slot whose
//! preferences contradict each other yields an impasse result for the decider
//! to act on.

use indexmap::{IndexMap, IndexSet};

use crate::goal::ImpasseKind;
use crate::preference::{Preference, PreferenceType};
use crate::symbol::{Symbol, SymbolTable};

/// A candidate that survived filtering, with its summed numeric preferences.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub value: Symbol,
    /// Sum of numeric-indifferent values; `None` when it has none.
    pub numeric: Option<f64>,
}

/// Outcome of evaluating a slot.
#[derive(Debug, Clone, PartialEq)]
pub enum SemanticsResult {
    /// Non-context slot: every candidate is a winner (possibly none).
    Winners(Vec<Symbol>),
    /// Context slot with a single winner.
    Selected(Symbol),
    /// Mutually indifferent candidates; a selection policy picks one.
    Indifferent(Vec<Candidate>),
    /// Contradictory or unresolved preferences.
    Impasse { kind: ImpasseKind, items: Vec<Symbol> },
    /// Context slot with nothing acceptable.
    NoCandidates,
}

impl SemanticsResult {
    pub fn is_impasse(&self) -> bool {
        matches!(self, SemanticsResult::Impasse { .. })
    }
}

/// Evaluate one slot.
///
/// `is_context` selects operator-slot semantics: a single winner, with
/// dominance, best/worst and indifference filtering. Other slots accept every
/// candidate.
pub fn run_preference_semantics(
    prefs: &[&Preference],
    is_context: bool,
    table: &SymbolTable,
) -> SemanticsResult {
    let values_of = |kind: PreferenceType| -> IndexSet<Symbol> {
        prefs
            .iter()
            .filter(|p| p.kind == kind)
            .map(|p| p.value)
            .collect()
    };

    let rejected: IndexSet<Symbol> = prefs
        .iter()
        .filter(|p| matches!(p.kind, PreferenceType::Reject | PreferenceType::Prohibit))
        .map(|p| p.value)
        .collect();

    // Requires
    let required = values_of(PreferenceType::Require);
    if required.len() > 1 {
        return SemanticsResult::Impasse {
            kind: ImpasseKind::ConstraintFailure,
            items: required.into_iter().collect(),
        };
    }
    if let Some(&value) = required.first() {
        // A reject does not block a require; a prohibit does.
        if values_of(PreferenceType::Prohibit).contains(&value) {
            return SemanticsResult::Impasse {
                kind: ImpasseKind::ConstraintFailure,
                items: vec![value],
            };
        }
        return if is_context {
            SemanticsResult::Selected(value)
        } else {
            SemanticsResult::Winners(vec![value])
        };
    }

    // Acceptables minus rejects and prohibits
    let mut candidates: Vec<Symbol> = values_of(PreferenceType::Acceptable)
        .into_iter()
        .filter(|v| !rejected.contains(v))
        .collect();

    if !is_context {
        return SemanticsResult::Winners(candidates);
    }
    if candidates.is_empty() {
        return SemanticsResult::NoCandidates;
    }

    // Better / worse
    let mut dominated: IndexSet<Symbol> = IndexSet::new();
    for p in prefs {
        let Some(referent) = p.referent else { continue };
        let loser = match p.kind {
            PreferenceType::Better => referent,
            PreferenceType::Worse => p.value,
            _ => continue,
        };
        let winner = if loser == referent { p.value } else { referent };
        if candidates.contains(&loser) && candidates.contains(&winner) && loser != winner {
            dominated.insert(loser);
        }
    }
    if !dominated.is_empty() {
        if candidates.iter().all(|c| dominated.contains(c)) {
            return SemanticsResult::Impasse {
                kind: ImpasseKind::Conflict,
                items: candidates,
            };
        }
        candidates.retain(|c| !dominated.contains(c));
    }

    // Best
    let best = values_of(PreferenceType::Best);
    if candidates.iter().any(|c| best.contains(c)) {
        candidates.retain(|c| best.contains(c));
    }

    // Worst
    let worst = values_of(PreferenceType::Worst);
    if !candidates.iter().all(|c| worst.contains(c)) {
        candidates.retain(|c| !worst.contains(c));
    }

    match candidates.len() {
        0 => return SemanticsResult::NoCandidates,
        1 => return SemanticsResult::Selected(candidates[0]),
        _ => {}
    }

    // Indifference
    let unary: IndexSet<Symbol> = prefs
        .iter()
        .filter(|p| {
            matches!(
                p.kind,
                PreferenceType::UnaryIndifferent | PreferenceType::NumericIndifferent
            )
        })
        .map(|p| p.value)
        .collect();
    let binary = |a: Symbol, b: Symbol| {
        prefs.iter().any(|p| {
            p.kind == PreferenceType::BinaryIndifferent
                && ((p.value == a && p.referent == Some(b)) || (p.value == b && p.referent == Some(a)))
        })
    };
    let all_indifferent = candidates.iter().all(|&c| {
        unary.contains(&c)
            || candidates
                .iter()
                .filter(|&&d| d != c)
                .all(|&d| binary(c, d))
    });
    if !all_indifferent {
        return SemanticsResult::Impasse {
            kind: ImpasseKind::Tie,
            items: candidates,
        };
    }

    let mut numeric: IndexMap<Symbol, f64> = IndexMap::new();
    for p in prefs {
        if p.kind != PreferenceType::NumericIndifferent || !candidates.contains(&p.value) {
            continue;
        }
        let amount = p
            .referent
            .and_then(|r| table.value(r))
            .and_then(|v| v.as_number())
            .unwrap_or(0.0);
        *numeric.entry(p.value).or_insert(0.0) += amount;
    }
    SemanticsResult::Indifferent(
        candidates
            .into_iter()
            .map(|value| Candidate {
                value,
                numeric: numeric.get(&value).copied(),
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        table: SymbolTable,
        s: Symbol,
        op: Symbol,
        a: Symbol,
        b: Symbol,
        c: Symbol,
    }

    fn fixture() -> Fixture {
        let mut table = SymbolTable::new();
        let s = table.new_identifier('S');
        let op = table.intern_str("operator");
        let a = table.new_identifier('O');
        let b = table.new_identifier('O');
        let c = table.new_identifier('O');
        Fixture { table, s, op, a, b, c }
    }

    fn pref(f: &Fixture, value: Symbol, kind: PreferenceType) -> Preference {
        Preference::new(f.s, f.op, value, kind)
    }

    fn run(f: &Fixture, prefs: &[Preference], context: bool) -> SemanticsResult {
        let refs: Vec<&Preference> = prefs.iter().collect();
        run_preference_semantics(&refs, context, &f.table)
    }

    #[test]
    fn single_acceptable_wins() {
        let f = fixture();
        let prefs = vec![pref(&f, f.a, PreferenceType::Acceptable)];
        assert_eq!(run(&f, &prefs, true), SemanticsResult::Selected(f.a));
    }

    #[test]
    fn two_unpreferred_candidates_tie() {
        let f = fixture();
        let prefs = vec![
            pref(&f, f.a, PreferenceType::Acceptable),
            pref(&f, f.b, PreferenceType::Acceptable),
        ];
        assert_eq!(
            run(&f, &prefs, true),
            SemanticsResult::Impasse {
                kind: ImpasseKind::Tie,
                items: vec![f.a, f.b]
            }
        );
    }

    #[test]
    fn single_require_wins_over_acceptables() {
        let f = fixture();
        let prefs = vec![
            pref(&f, f.a, PreferenceType::Acceptable),
            pref(&f, f.b, PreferenceType::Acceptable),
            pref(&f, f.b, PreferenceType::Require),
        ];
        assert_eq!(run(&f, &prefs, true), SemanticsResult::Selected(f.b));
    }

    #[test]
    fn conflicting_requires_fail() {
        let f = fixture();
        let prefs = vec![
            pref(&f, f.a, PreferenceType::Require),
            pref(&f, f.b, PreferenceType::Require),
        ];
        assert!(matches!(
            run(&f, &prefs, true),
            SemanticsResult::Impasse {
                kind: ImpasseKind::ConstraintFailure,
                ..
            }
        ));
    }

    #[test]
    fn required_and_prohibited_fails() {
        let f = fixture();
        let prefs = vec![
            pref(&f, f.a, PreferenceType::Require),
            pref(&f, f.a, PreferenceType::Prohibit),
        ];
        assert_eq!(
            run(&f, &prefs, true),
            SemanticsResult::Impasse {
                kind: ImpasseKind::ConstraintFailure,
                items: vec![f.a]
            }
        );
    }

    #[test]
    fn require_with_reject_still_selects() {
        let f = fixture();
        let prefs = vec![
            pref(&f, f.a, PreferenceType::Acceptable),
            pref(&f, f.a, PreferenceType::Require),
            pref(&f, f.a, PreferenceType::Reject),
            pref(&f, f.b, PreferenceType::Acceptable),
        ];
        assert_eq!(run(&f, &prefs, true), SemanticsResult::Selected(f.a));
        assert_eq!(run(&f, &prefs, false), SemanticsResult::Winners(vec![f.a]));
    }

    #[test]
    fn reject_removes_candidate() {
        let f = fixture();
        let prefs = vec![
            pref(&f, f.a, PreferenceType::Acceptable),
            pref(&f, f.b, PreferenceType::Acceptable),
            pref(&f, f.a, PreferenceType::Reject),
        ];
        assert_eq!(run(&f, &prefs, true), SemanticsResult::Selected(f.b));
    }

    #[test]
    fn all_rejected_means_no_candidates() {
        let f = fixture();
        let prefs = vec![
            pref(&f, f.a, PreferenceType::Acceptable),
            pref(&f, f.a, PreferenceType::Reject),
        ];
        assert_eq!(run(&f, &prefs, true), SemanticsResult::NoCandidates);
    }

    #[test]
    fn better_breaks_tie() {
        let f = fixture();
        let prefs = vec![
            pref(&f, f.a, PreferenceType::Acceptable),
            pref(&f, f.b, PreferenceType::Acceptable),
            pref(&f, f.b, PreferenceType::Better).with_referent(f.a),
        ];
        assert_eq!(run(&f, &prefs, true), SemanticsResult::Selected(f.b));
    }

    #[test]
    fn mutual_dominance_is_conflict() {
        let f = fixture();
        let prefs = vec![
            pref(&f, f.a, PreferenceType::Acceptable),
            pref(&f, f.b, PreferenceType::Acceptable),
            pref(&f, f.a, PreferenceType::Better).with_referent(f.b),
            pref(&f, f.a, PreferenceType::Worse).with_referent(f.b),
        ];
        assert_eq!(
            run(&f, &prefs, true),
            SemanticsResult::Impasse {
                kind: ImpasseKind::Conflict,
                items: vec![f.a, f.b]
            }
        );
    }

    #[test]
    fn best_then_worst_filtering() {
        let f = fixture();
        let prefs = vec![
            pref(&f, f.a, PreferenceType::Acceptable),
            pref(&f, f.b, PreferenceType::Acceptable),
            pref(&f, f.c, PreferenceType::Acceptable),
            pref(&f, f.c, PreferenceType::Worst),
            pref(&f, f.a, PreferenceType::Best),
        ];
        assert_eq!(run(&f, &prefs, true), SemanticsResult::Selected(f.a));
    }

    #[test]
    fn worst_never_removes_every_candidate() {
        let f = fixture();
        let prefs = vec![
            pref(&f, f.a, PreferenceType::Acceptable),
            pref(&f, f.a, PreferenceType::Worst),
        ];
        assert_eq!(run(&f, &prefs, true), SemanticsResult::Selected(f.a));
    }

    #[test]
    fn unary_indifferent_candidates_go_to_selection() {
        let f = fixture();
        let prefs = vec![
            pref(&f, f.a, PreferenceType::Acceptable),
            pref(&f, f.b, PreferenceType::Acceptable),
            pref(&f, f.a, PreferenceType::UnaryIndifferent),
            pref(&f, f.b, PreferenceType::UnaryIndifferent),
        ];
        let SemanticsResult::Indifferent(cands) = run(&f, &prefs, true) else {
            panic!("expected indifferent result");
        };
        assert_eq!(cands.len(), 2);
        assert!(cands.iter().all(|c| c.numeric.is_none()));
    }

    #[test]
    fn binary_indifference_covers_pairs() {
        let f = fixture();
        let prefs = vec![
            pref(&f, f.a, PreferenceType::Acceptable),
            pref(&f, f.b, PreferenceType::Acceptable),
            pref(&f, f.a, PreferenceType::BinaryIndifferent).with_referent(f.b),
        ];
        assert!(matches!(run(&f, &prefs, true), SemanticsResult::Indifferent(_)));
    }

    #[test]
    fn numeric_values_are_summed() {
        let mut f = fixture();
        let half = f.table.intern_float(0.5);
        let two = f.table.intern_int(2);
        let prefs = vec![
            pref(&f, f.a, PreferenceType::Acceptable),
            pref(&f, f.b, PreferenceType::Acceptable),
            pref(&f, f.a, PreferenceType::NumericIndifferent).with_referent(half),
            pref(&f, f.a, PreferenceType::NumericIndifferent).with_referent(two),
            pref(&f, f.b, PreferenceType::UnaryIndifferent),
        ];
        let SemanticsResult::Indifferent(cands) = run(&f, &prefs, true) else {
            panic!("expected indifferent result");
        };
        assert_eq!(cands[0].numeric, Some(2.5));
        assert_eq!(cands[1].numeric, None);
    }

    #[test]
    fn non_context_slot_accepts_all_candidates() {
        let f = fixture();
        let prefs = vec![
            pref(&f, f.a, PreferenceType::Acceptable),
            pref(&f, f.b, PreferenceType::Acceptable),
            pref(&f, f.c, PreferenceType::Acceptable),
            pref(&f, f.c, PreferenceType::Reject),
        ];
        assert_eq!(run(&f, &prefs, false), SemanticsResult::Winners(vec![f.a, f.b]));
    }
}
