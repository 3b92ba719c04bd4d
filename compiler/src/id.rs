// id.rs - Stable identifiers for pipeline entities
//
// Functions are addressed by `FuncId` handles into the `Pipeline` arena.
// IDs are allocated in definition order so that every traversal keyed by
// them is deterministic. `NameGen` hands out the `$N`-suffixed names used
// for wrappers, intermediates and compiler temporaries.

use std::collections::BTreeMap;
use std::fmt;

/// Stable identifier for a function in a `Pipeline`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncId(pub u32);

impl fmt::Display for FuncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "func#{}", self.0)
    }
}

/// Allocator for function IDs. Monotonically increasing in allocation order.
#[derive(Debug, Default, Clone)]
pub struct IdAllocator {
    next_func: u32,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc_func(&mut self) -> FuncId {
        let id = FuncId(self.next_func);
        self.next_func += 1;
        id
    }
}

/// Per-prefix counters for generated names: `prefix$0`, `prefix$1`, ...
#[derive(Debug, Default, Clone)]
pub struct NameGen {
    counters: BTreeMap<String, u32>,
}

impl NameGen {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fresh(&mut self, prefix: &str) -> String {
        let n = self.counters.entry(prefix.to_string()).or_insert(0);
        let name = format!("{}${}", prefix, n);
        *n += 1;
        name
    }
}
