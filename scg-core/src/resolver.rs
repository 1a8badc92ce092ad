//! Address → `(module, symbol, offset)` resolution via binary search
//! (spec §4.6). A pure function over a [`ModuleRegistry`] snapshot —
//! callable any number of times, never inside signal context (it may
//! trigger the Symbol Cache's lazy fill, which performs I/O).

use crate::module_registry::ModuleRegistry;
use crate::symbol_cache::{self, SymbolTable};

/// The result of resolving one address. `module_name`/`symbol_name` are
/// `None` when no containing module/symbol was found; `offset` is always
/// populated (spec §4.6: "else from zero").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub module_name: Option<String>,
    pub symbol_name: Option<String>,
    pub offset: usize,
}

pub fn resolve(registry: &ModuleRegistry, address: usize) -> Resolved {
    let modules = registry.modules();
    let module_idx = modules.partition_point(|m| m.base_address <= address);
    if module_idx == 0 {
        return Resolved { module_name: None, symbol_name: None, offset: address };
    }
    let module = &modules[module_idx - 1];
    if address - module.base_address > module.size {
        return Resolved { module_name: None, symbol_name: None, offset: address };
    }

    let table = symbol_cache::ensure_filled(module);
    let symbols: &[symbol_cache::Symbol] = match table {
        SymbolTable::Loaded(symbols) => symbols,
        SymbolTable::Failed => &[],
    };

    let symbol_idx = symbols.partition_point(|s| s.address <= address);
    if symbol_idx == 0 {
        return Resolved {
            module_name: Some(module.name.clone()),
            symbol_name: None,
            offset: address - module.base_address,
        };
    }
    let symbol = &symbols[symbol_idx - 1];
    let residual = (address - symbol.address) as u64;
    if residual > symbol.size {
        return Resolved {
            module_name: Some(module.name.clone()),
            symbol_name: None,
            offset: address - module.base_address,
        };
    }

    Resolved {
        module_name: Some(module.name.clone()),
        symbol_name: Some(symbol.name.clone()),
        offset: residual as usize,
    }
}
