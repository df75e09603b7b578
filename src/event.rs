//! Structured event protocol for the decision cycle.
//!
//! `KernelEvent` is the trace of everything the reasoner does: phases,
//! matches, firings, decisions, impasses and working memory changes. Events
//! are rendered by pluggable sinks: terminal trace, JSON lines, or collected
//! in memory (testing).

use serde::{Deserialize, Serialize};
use std::sync::Mutex;

use crate::cycle::{Phase, StopReason};
use crate::goal::{ImpasseAttribute, ImpasseKind};
use crate::production::Support;

// ── Event types ─────────────────────────────────────────────────────────

/// A structured event emitted by the reasoner.
///
/// Symbols are rendered to text so that events can outlive the reasoner and
/// cross thread boundaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum KernelEvent {
    PhaseStarted {
        cycle: u64,
        phase: Phase,
    },
    /// A production gained a complete match.
    InstantiationMatched {
        production: String,
        token: u32,
    },
    /// A complete match went away. `fired` is false when it never fired.
    InstantiationRetracted {
        production: String,
        token: u32,
        fired: bool,
    },
    ProductionFired {
        production: String,
        instantiation: u64,
        support: Support,
        level: u32,
        preferences: Vec<String>,
    },
    /// A goal's operator slot got a winner.
    SlotDecided {
        goal: String,
        attr: String,
        value: String,
    },
    ImpasseCreated {
        goal: String,
        superstate: String,
        level: u32,
        kind: ImpasseKind,
        attribute: ImpasseAttribute,
        items: Vec<String>,
    },
    ImpasseRemoved {
        goal: String,
        level: u32,
    },
    WmeAdded {
        timetag: u64,
        wme: String,
    },
    WmeRemoved {
        timetag: u64,
        wme: String,
    },
    /// Changes under the output-link since the previous output phase.
    Output {
        added: Vec<String>,
        removed: Vec<String>,
    },
    Write {
        production: String,
        text: String,
    },
    /// A right-hand side action could not be evaluated and was skipped.
    ActionFailed {
        production: String,
        message: String,
    },
    Halted {
        reason: String,
    },
    Stopped {
        reason: StopReason,
        #[serde(skip_serializing_if = "Option::is_none")]
        phase: Option<Phase>,
    },
}

impl KernelEvent {
    /// Short tag used by the trace renderer and by tests.
    pub fn label(&self) -> &'static str {
        match self {
            KernelEvent::PhaseStarted { .. } => "phase",
            KernelEvent::InstantiationMatched { .. } => "match",
            KernelEvent::InstantiationRetracted { .. } => "retract",
            KernelEvent::ProductionFired { .. } => "fire",
            KernelEvent::SlotDecided { .. } => "decide",
            KernelEvent::ImpasseCreated { .. } => "impasse",
            KernelEvent::ImpasseRemoved { .. } => "impasse-removed",
            KernelEvent::WmeAdded { .. } => "wme+",
            KernelEvent::WmeRemoved { .. } => "wme-",
            KernelEvent::Output { .. } => "output",
            KernelEvent::Write { .. } => "write",
            KernelEvent::ActionFailed { .. } => "action-failed",
            KernelEvent::Halted { .. } => "halt",
            KernelEvent::Stopped { .. } => "stop",
        }
    }
}

// ── EventSink trait ─────────────────────────────────────────────────────

/// A destination for kernel events.
pub trait EventSink: Send + Sync {
    /// Emit a single event.
    fn emit(&self, event: &KernelEvent);

    /// Emit a batch of events.
    fn emit_batch(&self, events: &[KernelEvent]) {
        for e in events {
            self.emit(e);
        }
    }
}

// ── StdoutSink ──────────────────────────────────────────────────────────

/// Renders events as a human-readable trace.
///
/// Element-level events are only shown with `verbose`.
pub struct StdoutSink {
    pub verbose: bool,
}

impl StdoutSink {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl EventSink for StdoutSink {
    fn emit(&self, event: &KernelEvent) {
        match event {
            KernelEvent::PhaseStarted { cycle, phase } => {
                if self.verbose {
                    println!("--- {cycle}: {phase} ---");
                }
            }
            KernelEvent::InstantiationMatched { production, .. } => {
                if self.verbose {
                    println!("[match] {production}");
                }
            }
            KernelEvent::InstantiationRetracted {
                production, fired, ..
            } => {
                if self.verbose {
                    let tag = if *fired { "retract" } else { "unmatch" };
                    println!("[{tag}] {production}");
                }
            }
            KernelEvent::ProductionFired {
                production,
                support,
                preferences,
                ..
            } => {
                let support = match support {
                    Support::I => "i",
                    Support::O => "o",
                };
                println!("[fire:{support}] {production}");
                if self.verbose {
                    for p in preferences {
                        println!("    {p}");
                    }
                }
            }
            KernelEvent::SlotDecided { goal, attr, value } => {
                println!("[decide] {goal} ^{attr} {value}");
            }
            KernelEvent::ImpasseCreated {
                goal,
                superstate,
                kind,
                attribute,
                items,
                ..
            } => {
                let attribute = match attribute {
                    ImpasseAttribute::Operator => "operator",
                    ImpasseAttribute::State => "state",
                };
                print!("[impasse] {goal} ({attribute} {kind}) under {superstate}");
                if !items.is_empty() {
                    print!(": {}", items.join(" "));
                }
                println!();
            }
            KernelEvent::ImpasseRemoved { goal, .. } => {
                println!("[impasse-removed] {goal}");
            }
            KernelEvent::WmeAdded { timetag, wme } => {
                if self.verbose {
                    println!("=>WM: ({timetag}: {wme})");
                }
            }
            KernelEvent::WmeRemoved { timetag, wme } => {
                if self.verbose {
                    println!("<=WM: ({timetag}: {wme})");
                }
            }
            KernelEvent::Output { added, removed } => {
                for w in added {
                    println!("[output+] {w}");
                }
                for w in removed {
                    println!("[output-] {w}");
                }
            }
            KernelEvent::Write { text, .. } => {
                println!("{text}");
            }
            KernelEvent::ActionFailed {
                production,
                message,
            } => {
                eprintln!("[action-failed] {production}: {message}");
            }
            KernelEvent::Halted { reason } => {
                println!("[halt] {reason}");
            }
            KernelEvent::Stopped { reason, phase } => match phase {
                Some(phase) => println!("[stop] {reason} during {phase}"),
                None => println!("[stop] {reason}"),
            },
        }
    }
}

// ── JsonSink ────────────────────────────────────────────────────────────

/// Emits events as newline-delimited JSON.
pub struct JsonSink;

impl EventSink for JsonSink {
    fn emit(&self, event: &KernelEvent) {
        if let Ok(json) = serde_json::to_string(event) {
            println!("{json}");
        }
    }
}

// ── VecSink ─────────────────────────────────────────────────────────────

/// Collects events into a `Vec<KernelEvent>` for testing.
pub struct VecSink {
    events: Mutex<Vec<KernelEvent>>,
}

impl VecSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    /// Get all collected events.
    pub fn events(&self) -> Vec<KernelEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Collected events with the given [`KernelEvent::label`].
    pub fn with_label(&self, label: &str) -> Vec<KernelEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.label() == label)
            .cloned()
            .collect()
    }

    /// Drop everything collected so far.
    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    /// Number of collected events.
    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for VecSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for VecSink {
    fn emit(&self, event: &KernelEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vec_sink_collects_events() {
        let sink = VecSink::new();
        sink.emit(&KernelEvent::Halted {
            reason: "done".into(),
        });
        sink.emit_batch(&[
            KernelEvent::WmeAdded {
                timetag: 1,
                wme: "S1 ^type state".into(),
            },
            KernelEvent::WmeRemoved {
                timetag: 1,
                wme: "S1 ^type state".into(),
            },
        ]);
        assert_eq!(sink.len(), 3);
        assert_eq!(sink.with_label("wme+").len(), 1);
        sink.clear();
        assert!(sink.is_empty());
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let event = KernelEvent::ImpasseCreated {
            goal: "S2".into(),
            superstate: "S1".into(),
            level: 2,
            kind: ImpasseKind::Tie,
            attribute: ImpasseAttribute::Operator,
            items: vec!["O1".into(), "O2".into()],
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"ImpasseCreated\""));
        assert!(json.contains("\"kind\":\"tie\""));
        let back: KernelEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn stopped_event_omits_missing_phase() {
        let event = KernelEvent::Stopped {
            reason: StopReason::Stopped,
            phase: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("phase"));
    }
}
