//! Per-instruction dispatch tables for `switch.i32`.
//!
//! Each switch instruction compiles, on first execution, into one of four
//! backends chosen by a density heuristic. Caches live in the execution
//! state, keyed by instruction identity, so recursive invocations never
//! share tables.

use hashbrown::HashMap;
use once_cell::sync::Lazy;
use xxhash_rust::xxh3::Xxh3Builder;

use crate::instruction::{Instr, Opcode};

/// Forced backend selection; `Auto` applies the density heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SwitchMode {
    /// Pick a backend from case density.
    #[default]
    Auto,
    /// Force the dense jump table.
    Dense,
    /// Force binary search over sorted cases.
    Sorted,
    /// Force the hashed map.
    Hashed,
    /// Force a linear scan of the instruction's case list.
    Linear,
}

impl SwitchMode {
    /// Parse a selector string; unknown spellings fall back to `Auto`.
    pub fn parse(text: &str) -> SwitchMode {
        match text.to_ascii_lowercase().as_str() {
            "dense" => SwitchMode::Dense,
            "sorted" => SwitchMode::Sorted,
            "hashed" => SwitchMode::Hashed,
            "linear" => SwitchMode::Linear,
            _ => SwitchMode::Auto,
        }
    }

    /// Mode selected by `ILVM_SWITCH_MODE`, read once at startup.
    pub fn from_env() -> SwitchMode {
        static MODE: Lazy<SwitchMode> = Lazy::new(|| {
            std::env::var("ILVM_SWITCH_MODE")
                .map(|v| SwitchMode::parse(&v))
                .unwrap_or_default()
        });
        *MODE
    }
}

/// Heuristic thresholds, overridable through the environment at startup.
#[derive(Debug, Clone, Copy)]
pub struct SwitchTunables {
    /// Upper bound on `max - min + 1` for the dense backend.
    pub dense_max_range: i64,
    /// Minimum `cases / range` for the dense backend.
    pub dense_min_density: f64,
    /// Case-count threshold for the hashed backend.
    pub hash_min_cases: usize,
    /// Maximum density for the hashed backend.
    pub hash_max_density: f64,
}

impl Default for SwitchTunables {
    fn default() -> Self {
        Self {
            dense_max_range: 4096,
            dense_min_density: 0.60,
            hash_min_cases: 64,
            hash_max_density: 0.15,
        }
    }
}

fn env_i64(name: &str) -> Option<i64> {
    std::env::var(name).ok()?.parse().ok()
}

fn env_f64(name: &str) -> Option<f64> {
    std::env::var(name).ok()?.parse().ok()
}

/// Tunables read once from the environment.
pub fn tunables() -> &'static SwitchTunables {
    static TUNABLES: Lazy<SwitchTunables> = Lazy::new(|| {
        let mut t = SwitchTunables::default();
        if let Some(v) = env_i64("ILVM_SWITCH_DENSE_MAX_RANGE") {
            if v > 0 {
                t.dense_max_range = v;
            }
        }
        if let Some(v) = env_f64("ILVM_SWITCH_DENSE_MIN_DENSITY") {
            if v > 0.0 && v <= 1.0 {
                t.dense_min_density = v;
            }
        }
        if let Some(v) = env_i64("ILVM_SWITCH_HASH_MIN_CASES") {
            if v >= 0 {
                t.hash_min_cases = v as usize;
            }
        }
        if let Some(v) = env_f64("ILVM_SWITCH_HASH_MAX_DENSITY") {
            if v > 0.0 && v <= 1.0 {
                t.hash_max_density = v;
            }
        }
        t
    });
    &TUNABLES
}

/// Metadata extracted from a switch instruction.
///
/// Distinct case values with their 1-based successor indices; duplicates keep
/// the first occurrence so dispatch stays deterministic.
#[derive(Debug, Default)]
pub struct SwitchMeta {
    /// Distinct case values.
    pub values: Vec<i32>,
    /// Successor label index per value; index 0 is the default.
    pub succ_idx: Vec<i32>,
    /// Default successor index, -1 when the instruction has no labels.
    pub default_idx: i32,
}

/// Collect case metadata from a `switch.i32` instruction.
pub fn collect_switch_meta(instr: &Instr) -> SwitchMeta {
    debug_assert_eq!(instr.op, Opcode::SwitchI32);

    let case_count = instr.switch_case_count();
    let mut meta = SwitchMeta {
        default_idx: if instr.labels.is_empty() { -1 } else { 0 },
        values: Vec::with_capacity(case_count),
        succ_idx: Vec::with_capacity(case_count),
    };

    let mut seen = hashbrown::HashSet::with_capacity(case_count);
    for idx in 0..case_count {
        let value = instr.switch_case_value(idx);
        if !seen.insert(value) {
            continue;
        }
        meta.values.push(value);
        meta.succ_idx.push(idx as i32 + 1);
    }
    meta
}

/// Dense jump table indexed by `sel - base`; -1 entries fall to the default.
#[derive(Debug, Default)]
pub struct DenseJumpTable {
    /// Smallest case value.
    pub base: i32,
    /// Successor index per offset, -1 for holes.
    pub targets: Vec<i32>,
}

/// Sorted case values with aligned successor indices, for binary search.
#[derive(Debug, Default)]
pub struct SortedCases {
    /// Case values in ascending order.
    pub keys: Vec<i32>,
    /// Successor index aligned with `keys`.
    pub target_idx: Vec<i32>,
}

/// Hashed case map for sparse, large case sets.
#[derive(Debug, Default)]
pub struct HashedCases {
    /// Case value to successor index.
    pub map: HashMap<i32, i32, Xxh3Builder>,
}

/// Compiled backend of one cached switch.
#[derive(Debug)]
pub enum SwitchBackend {
    /// Direct indexing.
    Dense(DenseJumpTable),
    /// Lower-bound search.
    Sorted(SortedCases),
    /// Hash lookup.
    Hashed(HashedCases),
    /// Scan the instruction's case list at dispatch time.
    Linear,
}

/// One cached switch dispatch table.
#[derive(Debug)]
pub struct SwitchCacheEntry {
    /// Default successor index.
    pub default_idx: i32,
    /// Compiled lookup structure.
    pub backend: SwitchBackend,
}

/// Choose a backend from case density.
pub fn choose_backend(meta: &SwitchMeta, t: &SwitchTunables) -> SwitchMode {
    if meta.values.is_empty() {
        return SwitchMode::Sorted;
    }
    let min = *meta.values.iter().min().expect("non-empty case set");
    let max = *meta.values.iter().max().expect("non-empty case set");
    let range = max as i64 - min as i64 + 1;
    let density = meta.values.len() as f64 / range as f64;

    if range <= t.dense_max_range && density >= t.dense_min_density {
        SwitchMode::Dense
    } else if meta.values.len() >= t.hash_min_cases && density < t.hash_max_density {
        SwitchMode::Hashed
    } else {
        SwitchMode::Sorted
    }
}

fn build_dense(meta: &SwitchMeta) -> DenseJumpTable {
    let mut table = DenseJumpTable::default();
    if meta.values.is_empty() {
        return table;
    }
    let min = *meta.values.iter().min().expect("non-empty case set");
    let max = *meta.values.iter().max().expect("non-empty case set");
    table.base = min;
    table.targets = vec![-1; (max as i64 - min as i64 + 1) as usize];
    for (value, succ) in meta.values.iter().zip(&meta.succ_idx) {
        table.targets[(value - min) as usize] = *succ;
    }
    table
}

fn build_sorted(meta: &SwitchMeta) -> SortedCases {
    let mut order: Vec<usize> = (0..meta.values.len()).collect();
    order.sort_by_key(|&i| meta.values[i]);
    let mut sorted = SortedCases::default();
    sorted.keys.reserve(order.len());
    sorted.target_idx.reserve(order.len());
    for idx in order {
        sorted.keys.push(meta.values[idx]);
        sorted.target_idx.push(meta.succ_idx[idx]);
    }
    sorted
}

fn build_hashed(meta: &SwitchMeta) -> HashedCases {
    let mut hashed = HashedCases {
        map: HashMap::with_capacity_and_hasher(meta.values.len() * 2, Xxh3Builder::new()),
    };
    for (value, succ) in meta.values.iter().zip(&meta.succ_idx) {
        hashed.map.insert(*value, *succ);
    }
    hashed
}

fn lookup_dense(table: &DenseJumpTable, sel: i32, default_idx: i32) -> i32 {
    let offset = sel as i64 - table.base as i64;
    if offset < 0 || offset >= table.targets.len() as i64 {
        return default_idx;
    }
    let target = table.targets[offset as usize];
    if target < 0 {
        default_idx
    } else {
        target
    }
}

fn lookup_sorted(cases: &SortedCases, sel: i32, default_idx: i32) -> i32 {
    match cases.keys.binary_search(&sel) {
        Ok(idx) => cases.target_idx[idx],
        Err(_) => default_idx,
    }
}

fn lookup_hashed(cases: &HashedCases, sel: i32, default_idx: i32) -> i32 {
    cases.map.get(&sel).copied().unwrap_or(default_idx)
}

fn lookup_linear(instr: &Instr, sel: i32, default_idx: i32) -> i32 {
    for idx in 0..instr.switch_case_count() {
        if instr.switch_case_value(idx) == sel {
            return idx as i32 + 1;
        }
    }
    default_idx
}

impl SwitchCacheEntry {
    /// Resolve a scrutinee to a successor label index.
    pub fn lookup(&self, instr: &Instr, sel: i32) -> i32 {
        match &self.backend {
            SwitchBackend::Dense(table) => lookup_dense(table, sel, self.default_idx),
            SwitchBackend::Sorted(cases) => lookup_sorted(cases, sel, self.default_idx),
            SwitchBackend::Hashed(cases) => lookup_hashed(cases, sel, self.default_idx),
            SwitchBackend::Linear => lookup_linear(instr, sel, self.default_idx),
        }
    }
}

/// Per-execution-state cache keyed by instruction identity.
#[derive(Debug, Default)]
pub struct SwitchCache {
    entries: HashMap<usize, SwitchCacheEntry>,
}

impl SwitchCache {
    /// Drop every cached table, e.g. when a frame is reused for a tail call.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Fetch or build the cached entry for an instruction.
    pub fn get_or_build(&mut self, instr: &Instr, mode: SwitchMode) -> &SwitchCacheEntry {
        let key = instr as *const Instr as usize;
        self.entries.entry(key).or_insert_with(|| {
            let meta = collect_switch_meta(instr);
            let selected = match mode {
                SwitchMode::Auto => choose_backend(&meta, tunables()),
                forced => forced,
            };
            let backend = match selected {
                SwitchMode::Dense => SwitchBackend::Dense(build_dense(&meta)),
                SwitchMode::Hashed => SwitchBackend::Hashed(build_hashed(&meta)),
                SwitchMode::Linear => SwitchBackend::Linear,
                SwitchMode::Sorted | SwitchMode::Auto => SwitchBackend::Sorted(build_sorted(&meta)),
            };
            SwitchCacheEntry {
                default_idx: meta.default_idx,
                backend,
            }
        })
    }
}
