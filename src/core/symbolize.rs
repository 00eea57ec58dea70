//! Best-effort symbol resolution
//!
//! Report rendering never depends on whether a symbol backend is present:
//! resolution is an injected capability, any failure degrades one report
//! line to a raw address, and the rest of the report is unaffected.

use fxhash::FxHashMap;
use std::path::PathBuf;

/// A resolved return address
#[derive(Debug, Clone)]
pub struct Symbol {
    /// Demangled function name
    pub name: String,
    /// Byte offset of the address into the function, when the function's
    /// start address is known
    pub offset: Option<usize>,
    /// Source file, when line tables are loadable
    pub file: Option<PathBuf>,
    /// Source line, when line tables are loadable
    pub line: Option<u32>,
}

/// Capability to map a return address back to source
pub trait SymbolResolver: Send {
    /// Resolve `addr`, or `None` when no symbol is known for it
    fn resolve(&mut self, addr: usize) -> Option<Symbol>;
}

/// Resolver backed by the process's own debug info via the `backtrace`
/// crate, with a per-address cache
///
/// Dump-time lookups hit the same handful of park-site addresses on every
/// report, so negative results are cached too.
pub struct BacktraceResolver {
    cache: FxHashMap<usize, Option<Symbol>>,
}

impl Default for BacktraceResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl BacktraceResolver {
    pub fn new() -> Self {
        BacktraceResolver {
            cache: FxHashMap::default(),
        }
    }

    fn resolve_uncached(addr: usize) -> Option<Symbol> {
        let mut resolved = None;
        backtrace::resolve(addr as *mut std::ffi::c_void, |symbol| {
            if resolved.is_some() {
                return;
            }
            let Some(name) = symbol.name() else {
                return;
            };
            let offset = symbol
                .addr()
                .map(|start| addr.saturating_sub(start as usize));
            resolved = Some(Symbol {
                name: name.to_string(),
                offset,
                file: symbol.filename().map(|path| path.to_path_buf()),
                line: symbol.lineno(),
            });
        });
        resolved
    }
}

impl SymbolResolver for BacktraceResolver {
    fn resolve(&mut self, addr: usize) -> Option<Symbol> {
        self.cache
            .entry(addr)
            .or_insert_with(|| Self::resolve_uncached(addr))
            .clone()
    }
}
