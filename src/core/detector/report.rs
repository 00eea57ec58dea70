//! Report rendering and sinks
//!
//! A report-producing round retains full stacks, then every address is
//! resolved best-effort: a failed lookup degrades its one line to a raw
//! address and the rest of the report is unaffected. The configured file
//! sink is written as UTF-16-LE with a byte order mark; without a path the
//! report goes to stderr. When the file cannot be opened the report falls
//! back to stderr rather than being lost, and the sink failure is logged.

use crate::core::detector::{Detector, Inner};
use crate::core::registry::ThreadRegistry;
use crate::core::symbolize::SymbolResolver;
use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, BufWriter, Write};

impl Detector {
    /// Write a full report immediately, without waiting for deadlock
    /// confirmation
    ///
    /// Runs a full-stack snapshot round first, so the report reflects this
    /// instant; threads that are making progress show as active.
    pub fn dump_now(&self) -> Result<()> {
        self.inner().dump()
    }
}

impl Inner {
    /// Full snapshot + render + write, all under the exclusive section
    pub(crate) fn dump(&self) -> Result<()> {
        let mut registry = self.registry.lock();
        self.snapshot_locked(&mut registry, true);
        let mut resolver = self.resolver.lock();
        let text = render(&registry, resolver.as_mut());
        self.write_report(&text)
    }

    fn write_report(&self, text: &str) -> Result<()> {
        if let Some(path) = &self.config.report_path {
            match File::create(path) {
                Ok(file) => {
                    return write_utf16(BufWriter::new(file), text).with_context(|| {
                        format!("failed to write the hang report to {}", path.display())
                    });
                }
                Err(error) => {
                    // Deliberate fallback: a report about a wedged process
                    // must not vanish because a path was bad.
                    log::error!(
                        "cannot open report sink {}: {error}; writing to stderr instead",
                        path.display()
                    );
                }
            }
        }
        io::stderr()
            .lock()
            .write_all(text.as_bytes())
            .context("failed to write the hang report to stderr")
    }
}

/// Render one block per registered thread, registration order, blank line
/// separated
fn render(registry: &ThreadRegistry, resolver: &mut dyn SymbolResolver) -> String {
    let mut out = String::new();
    for (index, thread) in registry.iter().enumerate() {
        if thread.valid() {
            let state = if thread.is_idle() { "idle" } else { "active" };
            let _ = writeln!(
                out,
                "[{index}] thread {} ({}) is {state}",
                thread.name(),
                thread.identity()
            );
            for (frame, &addr) in thread.captured_frames().iter().enumerate() {
                render_frame(&mut out, resolver, frame, addr);
            }
        } else {
            let _ = writeln!(
                out,
                "[{index}] thread {} ({}) was interrupted",
                thread.name(),
                thread.identity()
            );
        }
        out.push('\n');
    }
    out
}

fn render_frame(out: &mut String, resolver: &mut dyn SymbolResolver, frame: usize, addr: usize) {
    let Some(symbol) = resolver.resolve(addr) else {
        let _ = writeln!(out, "  [{frame}] {addr:#018x}, source unavailable");
        return;
    };
    match (&symbol.file, symbol.line) {
        (Some(file), Some(line)) => {
            let offset = symbol.offset.unwrap_or(0);
            let _ = writeln!(
                out,
                "  [{frame}] {} +{offset:#x} ({addr:#018x}), source {}:{line}",
                symbol.name,
                file.display()
            );
        }
        _ => {
            let _ = writeln!(
                out,
                "  [{frame}] {} ({addr:#018x}), source unavailable",
                symbol.name
            );
        }
    }
}

/// UTF-16-LE with byte order mark, the format debuggers and editors expect
/// from the file sink
fn write_utf16<W: Write>(mut writer: W, text: &str) -> io::Result<()> {
    writer.write_all(&0xFEFF_u16.to_le_bytes())?;
    for unit in text.encode_utf16() {
        writer.write_all(&unit.to_le_bytes())?;
    }
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::symbolize::Symbol;
    use std::collections::HashMap;
    use std::path::PathBuf;

    struct MapResolver(HashMap<usize, Symbol>);

    impl SymbolResolver for MapResolver {
        fn resolve(&mut self, addr: usize) -> Option<Symbol> {
            self.0.get(&addr).cloned()
        }
    }

    fn sample_registry() -> ThreadRegistry {
        let mut registry = ThreadRegistry::new();
        registry.register(11, "worker-a".into());
        registry.register(12, "worker-b".into());
        registry.register(13, "io-poll".into());

        // worker-a: two identical rounds -> idle, frames retained
        let a = registry.get_mut(0).unwrap();
        a.classify(&[0x1000, 0x2000]);
        a.classify(&[0x1000, 0x2000]);
        a.retain_frames(&[0x1000, 0x2000]);

        // worker-b: fresh stack -> active
        let b = registry.get_mut(1).unwrap();
        b.classify(&[0x3000]);
        b.retain_frames(&[0x3000]);

        // io-poll: vanished
        registry.get_mut(2).unwrap().invalidate();
        registry
    }

    fn sample_resolver() -> MapResolver {
        let mut symbols = HashMap::new();
        symbols.insert(
            0x1000,
            Symbol {
                name: "park_forever".into(),
                offset: Some(0x1f),
                file: Some(PathBuf::from("src/worker.rs")),
                line: Some(42),
            },
        );
        symbols.insert(
            0x2000,
            Symbol {
                name: "run_worker".into(),
                offset: None,
                file: None,
                line: None,
            },
        );
        // 0x3000 deliberately unresolved
        MapResolver(symbols)
    }

    #[test]
    fn report_has_one_block_per_thread_in_registration_order() {
        let registry = sample_registry();
        let mut resolver = sample_resolver();
        let text = render(&registry, &mut resolver);

        let blocks: Vec<&str> = text.trim_end().split("\n\n").collect();
        assert_eq!(blocks.len(), 3);
        assert!(blocks[0].starts_with("[0] thread worker-a (11) is idle"));
        assert!(blocks[1].starts_with("[1] thread worker-b (12) is active"));
        assert_eq!(blocks[2], "[2] thread io-poll (13) was interrupted");
    }

    #[test]
    fn resolution_detail_degrades_per_line() {
        let registry = sample_registry();
        let mut resolver = sample_resolver();
        let text = render(&registry, &mut resolver);

        assert!(
            text.contains("  [0] park_forever +0x1f (0x0000000000001000), source src/worker.rs:42")
        );
        assert!(text.contains("  [1] run_worker (0x0000000000002000), source unavailable"));
        assert!(text.contains("  [0] 0x0000000000003000, source unavailable"));
    }

    #[test]
    fn utf16_sink_starts_with_byte_order_mark() {
        let mut bytes = Vec::new();
        write_utf16(&mut bytes, "hi\n").unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xFE]);
        let units: Vec<u16> = bytes[2..]
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        assert_eq!(String::from_utf16(&units).unwrap(), "hi\n");
    }
}
