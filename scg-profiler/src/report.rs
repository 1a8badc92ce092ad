//! Builds the profile database and writes it to its configured
//! destination (spec §4.7, §6).

use std::io::Write;

use scg_core::config::{self, OutputTarget};
use scg_core::domain::Pid;
use scg_core::module_registry::ModuleRegistry;
use scg_core::report::Database;
use scg_core::resolver;

fn short_program_name() -> String {
    std::fs::read_to_string("/proc/self/comm")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

fn pid() -> Pid {
    Pid(std::process::id())
}

/// Builds the current profile and writes it to `SCG_OUTPUT` (or stderr),
/// per spec §6. Falls back to stderr if the configured path can't be
/// opened (spec §7 "Report output failure").
pub fn emit() {
    let registry = ModuleRegistry::snapshot();
    let database = Database::build(|address| resolver::resolve(&registry, address));
    let text = database.render(&short_program_name());

    match config::output_target(pid()) {
        OutputTarget::Stderr => {
            let _ = std::io::stderr().write_all(text.as_bytes());
        }
        OutputTarget::Path(path) => {
            if let Err(err) = scg_core::report::write_to_path(&path, &text) {
                log::warn!("could not open profile output {path}: {err}; falling back to stderr");
                let _ = std::io::stderr().write_all(text.as_bytes());
            }
        }
    }
}
