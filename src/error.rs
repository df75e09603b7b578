//! Rich diagnostic error types for the kernel.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives,
//! providing error codes and help text. Impasses and resource limits (elaboration
//! ceiling, goal depth) are not errors: they surface as events and stop reasons.

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for the kernel.
///
/// Each variant wraps a subsystem-specific error, preserving the full diagnostic
/// chain through to the caller.
#[derive(Debug, Error, Diagnostic)]
pub enum KernelError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Symbol(#[from] SymbolError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    WorkingMemory(#[from] WmError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Rete(#[from] ReteError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Production(#[from] ProductionError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Cycle(#[from] CycleError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),
}

// ---------------------------------------------------------------------------
// Symbol errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum SymbolError {
    #[error("release of unknown symbol {symbol}")]
    #[diagnostic(
        code(kernel::symbol::unknown_release),
        help(
            "The symbol was already freed or never interned by this table. \
             Every release must pair with an earlier intern or add_ref."
        )
    )]
    UnknownRelease { symbol: u64 },

    #[error("unknown symbol {symbol}")]
    #[diagnostic(
        code(kernel::symbol::unknown),
        help("The symbol handle does not belong to this reasoner's symbol table.")
    )]
    Unknown { symbol: u64 },
}

// ---------------------------------------------------------------------------
// Working memory errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum WmError {
    #[error("preference {preference} does not support any working memory element")]
    #[diagnostic(
        code(kernel::wm::unknown_supporter),
        help(
            "A support removal was requested for a preference that was never \
             attached or was already detached. This is a bug in the caller."
        )
    )]
    UnknownSupporter { preference: u64 },

    #[error("no working memory element with timetag {timetag}")]
    #[diagnostic(
        code(kernel::wm::unknown_wme),
        help("The element was already removed. Timetags are never reused.")
    )]
    UnknownWme { timetag: u64 },

    #[error("identifier expected in position {position}, got {found}")]
    #[diagnostic(
        code(kernel::wm::not_identifier),
        help("Only identifiers may appear as the id of a working memory element.")
    )]
    NotIdentifier { position: &'static str, found: String },
}

// ---------------------------------------------------------------------------
// Rete (structural) errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ReteError {
    #[error("production '{production}' tests variable {variable} before it is bound")]
    #[diagnostic(
        code(kernel::rete::unbound_variable),
        help(
            "Relational and disjunctive tests need a value to compare against. \
             Bind the variable with an equality test in an earlier positive condition."
        )
    )]
    UnboundVariable { production: String, variable: String },

    #[error("production '{production}' has no positive condition")]
    #[diagnostic(
        code(kernel::rete::no_positive_condition),
        help("A rule must match at least one working memory element positively.")
    )]
    NoPositiveCondition { production: String },

    #[error("production '{production}' contains an empty negated conjunction")]
    #[diagnostic(
        code(kernel::rete::empty_negation),
        help("A negated conjunction must contain at least one condition.")
    )]
    EmptyNegation { production: String },

    #[error("production '{production}' uses {variable} as an identifier but never binds or creates it")]
    #[diagnostic(
        code(kernel::rete::unconnected_identifier),
        help(
            "A right-hand side action can only add to an identifier matched on the \
             left-hand side or created as the value of an earlier action."
        )
    )]
    UnconnectedIdentifier { production: String, variable: String },

    #[error("production '{production}' calls {function} with {actual} argument(s), expected {expected}")]
    #[diagnostic(
        code(kernel::rete::bad_arity),
        help("Check the argument count of the right-hand side function call.")
    )]
    BadArity {
        production: String,
        function: String,
        expected: String,
        actual: usize,
    },

    #[error("production '{production}' uses a constant identifier position: {found}")]
    #[diagnostic(
        code(kernel::rete::constant_identifier),
        help("The id field of an action must be a variable bound to an identifier.")
    )]
    ConstantIdentifier { production: String, found: String },

    #[error("no production node {node}")]
    #[diagnostic(
        code(kernel::rete::unknown_node),
        help("The node was already excised or belongs to another network.")
    )]
    UnknownNode { node: u32 },
}

// ---------------------------------------------------------------------------
// Production errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ProductionError {
    #[error("duplicate production name: {name}")]
    #[diagnostic(
        code(kernel::production::duplicate),
        help("Excise the existing production first, or choose a different name.")
    )]
    Duplicate { name: String },

    #[error("production not found: {name}")]
    #[diagnostic(
        code(kernel::production::not_found),
        help("List loaded productions with `Reasoner::productions()`.")
    )]
    NotFound { name: String },

    #[error("invalid rule specification '{name}': {message}")]
    #[diagnostic(
        code(kernel::production::invalid_spec),
        help("Check the rule file against the condition/action schema.")
    )]
    InvalidSpec { name: String, message: String },

    #[error("failed to read rule file: {path}")]
    #[diagnostic(
        code(kernel::production::read),
        help("Rule files are JSON (`.json`) or TOML (`.toml`) with a top-level `rules` list.")
    )]
    RuleFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Decision cycle errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum CycleError {
    #[error("reasoner is halted: {reason}")]
    #[diagnostic(
        code(kernel::cycle::halted),
        help("Call `Reasoner::reset()` before running further decision cycles.")
    )]
    Halted { reason: String },

    #[error("phase {phase} re-entered while another phase is running")]
    #[diagnostic(
        code(kernel::cycle::reentered),
        help("Decision-cycle steps must not be issued from inside an event sink.")
    )]
    Reentered { phase: String },
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read config: {path}")]
    #[diagnostic(
        code(kernel::config::read),
        help("Ensure the config file exists and is readable.")
    )]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {message}")]
    #[diagnostic(
        code(kernel::config::parse),
        help("Check the TOML syntax and field names in the kernel config.")
    )]
    Parse { message: String },

    #[error("failed to write config: {path}")]
    #[diagnostic(
        code(kernel::config::write),
        help("Ensure you have write permissions to the target directory.")
    )]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {message}")]
    #[diagnostic(code(kernel::config::invalid), help("Check the KernelConfig fields. {message}"))]
    Invalid { message: String },
}

/// Convenience alias for functions returning kernel results.
pub type KernelResult<T> = std::result::Result<T, KernelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rete_error_converts_to_kernel_error() {
        let err = ReteError::NoPositiveCondition {
            production: "p".into(),
        };
        let kernel: KernelError = err.into();
        assert!(matches!(
            kernel,
            KernelError::Rete(ReteError::NoPositiveCondition { .. })
        ));
    }

    #[test]
    fn wm_error_converts_to_kernel_error() {
        let err = WmError::UnknownSupporter { preference: 7 };
        let kernel: KernelError = err.into();
        assert!(matches!(
            kernel,
            KernelError::WorkingMemory(WmError::UnknownSupporter { preference: 7 })
        ));
    }

    #[test]
    fn error_display_messages_are_descriptive() {
        let err = ReteError::UnboundVariable {
            production: "propose*move".into(),
            variable: "<x>".into(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("propose*move"));
        assert!(msg.contains("<x>"));
    }
}
