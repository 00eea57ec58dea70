use hangwatch::{
    DeadlockInfo, Detector, Hangwatch, StackSampler, SuspendError, Suspended, Symbol,
    SymbolResolver, ThreadContext, ThreadId,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Duration;

#[allow(dead_code)]
pub const DEADLOCK_TIMEOUT: Duration = Duration::from_secs(3);
#[allow(dead_code)]
pub const NO_DEADLOCK_TIMEOUT: Duration = Duration::from_millis(500);

struct Script {
    stacks: Vec<Vec<usize>>,
    cursor: usize,
    gone: bool,
    suspend_attempts: usize,
}

/// Deterministic suspension backend: each registered id gets a scripted
/// sequence of stacks served round after round, no real threads involved
#[derive(Clone, Default)]
pub struct ScriptedSampler {
    state: Arc<Mutex<HashMap<ThreadId, Script>>>,
}

#[allow(dead_code)]
impl ScriptedSampler {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self, thread: ThreadId, stacks: Vec<Vec<usize>>, gone: bool) {
        self.state.lock().unwrap().insert(
            thread,
            Script {
                stacks,
                cursor: 0,
                gone,
                suspend_attempts: 0,
            },
        );
    }

    /// Thread whose stack never changes
    pub fn stuck(&self, thread: ThreadId, stack: Vec<usize>) {
        self.script(thread, vec![stack], false);
    }

    /// Thread that cycles through several distinct stacks (always active)
    pub fn busy(&self, thread: ThreadId, stacks: Vec<Vec<usize>>) {
        assert!(stacks.len() >= 2, "busy thread needs at least two stacks");
        self.script(thread, stacks, false);
    }

    /// Thread whose stack can never be captured
    pub fn unreadable(&self, thread: ThreadId) {
        self.script(thread, vec![Vec::new()], false);
    }

    /// Thread the OS no longer knows about
    pub fn gone(&self, thread: ThreadId) {
        self.script(thread, Vec::new(), true);
    }

    /// How many times `suspend` was attempted for this thread
    pub fn suspend_attempts(&self, thread: ThreadId) -> usize {
        self.state
            .lock()
            .unwrap()
            .get(&thread)
            .map_or(0, |script| script.suspend_attempts)
    }
}

impl StackSampler for ScriptedSampler {
    fn suspend(&self, thread: ThreadId) -> Result<Suspended, SuspendError> {
        let mut state = self.state.lock().unwrap();
        let Some(script) = state.get_mut(&thread) else {
            return Err(SuspendError::Gone);
        };
        script.suspend_attempts += 1;
        if script.gone {
            return Err(SuspendError::Gone);
        }
        Ok(Suspended::new(thread, ThreadContext::default()))
    }

    fn unwind(&self, suspended: &Suspended, out: &mut Vec<usize>) {
        out.clear();
        let mut state = self.state.lock().unwrap();
        if let Some(script) = state.get_mut(&suspended.thread())
            && !script.stacks.is_empty()
        {
            let stack = &script.stacks[script.cursor % script.stacks.len()];
            script.cursor += 1;
            out.extend_from_slice(stack);
        }
    }
}

/// Resolver backed by a fixed address table
pub struct MapResolver(pub HashMap<usize, Symbol>);

impl SymbolResolver for MapResolver {
    fn resolve(&mut self, addr: usize) -> Option<Symbol> {
        self.0.get(&addr).cloned()
    }
}

/// Symbols for the well-known addresses the scenario tests use
#[allow(dead_code)]
pub fn scenario_symbols() -> MapResolver {
    let mut symbols = HashMap::new();
    for (addr, name) in [
        (0x1000_usize, "gate_wait"),
        (0x2000, "level2"),
        (0x3000, "level1"),
        (0x1100, "gate_wait"),
        (0x2100, "level2"),
        (0x3100, "level1"),
    ] {
        symbols.insert(
            addr,
            Symbol {
                name: name.to_string(),
                offset: Some(addr & 0xff),
                file: Some(PathBuf::from("src/worker.rs")),
                line: Some((addr & 0xfff) as u32),
            },
        );
    }
    MapResolver(symbols)
}

pub struct DetectorHarness {
    pub detector: Detector,
    pub rx: mpsc::Receiver<DeadlockInfo>,
}

/// Detector wired to the scripted sampler with a short tick and a small
/// confirmation window, reporting deadlocks through a channel
#[allow(dead_code)]
pub fn start_harness(
    sampler: &ScriptedSampler,
    confirm_rounds: u32,
    report: Option<&Path>,
) -> DetectorHarness {
    let (tx, rx) = mpsc::channel::<DeadlockInfo>();
    let mut builder = Hangwatch::new()
        .with_tick(Duration::from_millis(2))
        .with_confirmation_rounds(confirm_rounds)
        .with_sampler(sampler.clone())
        .with_resolver(scenario_symbols())
        .callback(move |info| {
            let _ = tx.send(info);
        });
    if let Some(path) = report {
        builder = builder.with_report_file(path);
    }
    let detector = builder.build().expect("failed to build detector");
    DetectorHarness { detector, rx }
}

#[allow(dead_code)]
pub fn expect_deadlock(harness: &DetectorHarness, timeout: Duration) -> DeadlockInfo {
    match harness.rx.recv_timeout(timeout) {
        Ok(info) => info,
        Err(_) => panic!("No deadlock declared within {timeout:?}"),
    }
}

#[allow(dead_code)]
pub fn assert_no_deadlock(harness: &DetectorHarness, timeout: Duration) {
    assert!(
        harness.rx.recv_timeout(timeout).is_err(),
        "Unexpected deadlock declared"
    );
}

/// Decode a report written by the file sink (UTF-16-LE with BOM)
#[allow(dead_code)]
pub fn read_utf16_report(path: &Path) -> String {
    let bytes = std::fs::read(path).expect("report file readable");
    assert_eq!(&bytes[..2], &[0xFF, 0xFE], "missing byte order mark");
    let units: Vec<u16> = bytes[2..]
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).expect("report is valid UTF-16")
}
