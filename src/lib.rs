// thiserror's #[error("...{field}...")] format strings reference struct fields,
// but the compiler doesn't see through the derive macro and reports false positives.
#![allow(unused_assignments)]

//! # soar-kernel
//!
//! A production-rule execution kernel: working memory, an incremental Rete
//! match network, preference-based decisions and automatic sub-goaling.
//!
//! ## Architecture
//!
//! - **Symbols** (`symbol`): reference-counted intern table with identifier levels
//! - **Working memory** (`wm`): timetagged elements with supporter tracking
//! - **Match network** (`rete`): alpha memories, shared beta joins, negation and NCCs
//! - **Preferences** (`preference`, `semantics`): per-slot preference memory and
//!   the resolution procedure that turns it into winners or impasses
//! - **Decision cycle** (`kernel`, `cycle`, `goal`): INPUT, PROPOSE, DECISION,
//!   APPLY and OUTPUT phases over a stack of impasse sub-goals
//!
//! ## Library usage
//!
//! ```no_run
//! use soar_kernel::config::KernelConfig;
//! use soar_kernel::kernel::Reasoner;
//! use soar_kernel::loader::RuleFile;
//!
//! let mut reasoner = Reasoner::new(KernelConfig::default()).unwrap();
//! let file = RuleFile::load(std::path::Path::new("rules.json")).unwrap();
//! reasoner.load_rules(&file.rules).unwrap();
//! reasoner.run_decisions(10).unwrap();
//! ```

pub mod config;
pub mod cycle;
mod decider;
pub mod error;
pub mod event;
pub mod exploration;
pub mod goal;
pub mod instantiation;
pub mod io;
pub mod kernel;
pub mod loader;
pub mod preference;
pub mod production;
pub mod rete;
pub mod semantics;
pub mod symbol;
pub mod wm;
