//! Error taxonomy for the non-signal-context parts of the profiler and
//! tracer: symbol resolution and report emission. Signal-context code never
//! constructs these — see `crate::async_safe` convention followed by the
//! two preload crates for diagnostics that must not allocate.

use thiserror::Error;

/// Failures encountered while building a module's symbol table.
///
/// None of these are fatal: every caller that can observe one marks the
/// offending module `Failed` (see [`crate::module_registry::ModuleState`])
/// and moves on, per spec §7 ("Symbolization failure").
#[derive(Debug, Error)]
pub enum SymbolError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} is not a parseable ELF object: {source}")]
    Parse {
        path: String,
        #[source]
        source: object::Error,
    },

    #[error("{path} has no SYMTAB or DYNSYM section")]
    NoSymbolTable { path: String },
}

/// Failures encountered while writing a report to its configured
/// destination. Per spec §7 ("Report output failure"), the profiler falls
/// back to stderr and the tracer drops the report with a short diagnostic;
/// neither is fatal to the host process.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("could not open report destination {path}: {source}")]
    Destination {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
