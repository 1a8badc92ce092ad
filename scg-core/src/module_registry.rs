//! Snapshot of currently loaded ELF modules, sorted by base address
//! (spec §4.4).

use std::ffi::CStr;
use std::os::raw::{c_int, c_void};
use std::path::PathBuf;

use once_cell::sync::OnceCell;

use crate::symbol_cache::SymbolTable;

/// Lifecycle of a module's symbol table. Transitions monotonically:
/// `Unresolved -> Loaded | Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Unresolved,
    Loaded,
    Failed,
}

pub struct Module {
    pub base_address: usize,
    pub size: usize,
    /// Runtime base minus file base — the ELF loader's "load bias". Added
    /// to a symbol's file-relative `st_value` to get a runtime address.
    pub load_delta: i64,
    pub name: String,
    pub file_path: Option<PathBuf>,
    pub(crate) symbols: OnceCell<SymbolTable>,
}

impl Module {
    pub fn contains(&self, address: usize) -> bool {
        address >= self.base_address && address - self.base_address <= self.size
    }

    /// Current lifecycle state, without forcing the lazy fill.
    pub fn state(&self) -> ModuleState {
        match self.symbols.get() {
            None => ModuleState::Unresolved,
            Some(SymbolTable::Loaded(_)) => ModuleState::Loaded,
            Some(SymbolTable::Failed) => ModuleState::Failed,
        }
    }
}

pub struct ModuleRegistry {
    /// Sorted ascending by `base_address`.
    modules: Vec<Module>,
}

impl ModuleRegistry {
    /// Builds a registry from an already-sorted module list. Used by
    /// `resolver`'s and `symbol_cache`'s own tests to exercise boundary
    /// and debuglink behavior against synthetic ELF files without relying
    /// on whatever happens to be mapped into the test process.
    #[cfg(test)]
    pub(crate) fn from_modules(modules: Vec<Module>) -> ModuleRegistry {
        ModuleRegistry { modules }
    }

    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    /// Builds a fresh snapshot of every currently loaded module, replacing
    /// any prior one the caller may be holding. Performs blocking I/O
    /// (`/proc/self/exe`); never call from signal context.
    pub fn snapshot() -> ModuleRegistry {
        let mut raw = collect_raw_modules();
        raw.sort_by_key(|m| m.base_address);

        let exe_path = std::fs::read_link("/proc/self/exe").ok();
        let exe_name = exe_path
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned());

        let modules = raw
            .into_iter()
            .map(|raw| {
                let (name, file_path) = if raw.name.is_empty() {
                    (
                        exe_name.clone().unwrap_or_else(|| "<main>".to_string()),
                        exe_path.clone(),
                    )
                } else {
                    let path = PathBuf::from(&raw.name);
                    let display = path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| raw.name.clone());
                    (display, Some(path))
                };
                Module {
                    base_address: raw.base_address,
                    size: raw.size,
                    load_delta: raw.load_delta,
                    name,
                    file_path,
                    symbols: OnceCell::new(),
                }
            })
            .collect();

        ModuleRegistry { modules }
    }
}

struct RawModule {
    base_address: usize,
    size: usize,
    load_delta: i64,
    name: String,
}

fn collect_raw_modules() -> Vec<RawModule> {
    let mut modules: Vec<RawModule> = Vec::new();
    unsafe {
        libc::dl_iterate_phdr(Some(phdr_callback), &mut modules as *mut _ as *mut c_void);
    }
    modules
}

unsafe extern "C" fn phdr_callback(
    info: *mut libc::dl_phdr_info,
    _size: usize,
    data: *mut c_void,
) -> c_int {
    let modules = &mut *(data as *mut Vec<RawModule>);
    let info = &*info;

    let name = if info.dlpi_name.is_null() {
        String::new()
    } else {
        CStr::from_ptr(info.dlpi_name).to_string_lossy().into_owned()
    };

    let mut lo = u64::MAX;
    let mut hi = 0u64;
    for i in 0..info.dlpi_phnum as usize {
        let phdr = &*info.dlpi_phdr.add(i);
        if phdr.p_type == libc::PT_LOAD {
            lo = lo.min(phdr.p_vaddr);
            hi = hi.max(phdr.p_vaddr + phdr.p_memsz);
        }
    }

    if hi > lo {
        let load_delta = info.dlpi_addr as i64;
        let base_address = (info.dlpi_addr as u64 + lo) as usize;
        let size = (hi - lo) as usize;
        modules.push(RawModule { base_address, size, load_delta, name });
    }

    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_includes_the_executable_and_libc() {
        let registry = ModuleRegistry::snapshot();
        assert!(!registry.modules().is_empty());
        assert!(registry.modules().windows(2).all(|w| w[0].base_address <= w[1].base_address));
    }
}
