//! Debug controller: breakpoints, watches, scripted stepping.
//!
//! The controller owns no VM state; the dispatch loop consults it before and
//! after each instruction. The `[BREAK]` and `[WATCH]` stderr lines are part
//! of the observable contract and keep their exact shapes.

use std::collections::VecDeque;

use hashbrown::{HashMap, HashSet};

use crate::instruction::Instr;
use crate::module::{BasicBlock, SourceMap};
use crate::types::TypeKind;

/// A source-line breakpoint, stored in both canonical and basename form.
#[derive(Debug, Clone)]
struct SrcLineBp {
    norm_file: String,
    base: String,
    line: u32,
}

/// State of one variable watch.
#[derive(Debug, Clone, Default)]
struct WatchEntry {
    ty: TypeKind,
    i64: i64,
    f64: f64,
    has_value: bool,
}

/// One memory watch range, half-open.
#[derive(Debug, Clone)]
struct MemWatchRange {
    start: usize,
    end: usize,
    addr: usize,
    size: usize,
    tag: String,
}

/// A recorded memory-watch hit, drained by consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemWatchHit {
    /// Address of the intersecting store.
    pub addr: usize,
    /// Store size in bytes.
    pub size: usize,
    /// Tag of the watch that matched.
    pub tag: String,
}

/// One scripted debugger action.
#[derive(Debug, Clone, Copy)]
pub enum DebugAction {
    /// Run this many instructions, then pause again.
    Step(u64),
}

/// Scripted debugger interaction consumed at breakpoints.
#[derive(Debug, Default)]
pub struct DebugScript {
    actions: VecDeque<DebugAction>,
}

impl DebugScript {
    /// Empty script.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an action.
    pub fn push(&mut self, action: DebugAction) {
        self.actions.push_back(action);
    }

    /// True when no actions remain.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Consume the next action.
    pub fn next_action(&mut self) -> Option<DebugAction> {
        self.actions.pop_front()
    }
}

/// Breakpoint, watch, and stepping state for one VM instance.
#[derive(Debug, Default)]
pub struct Debugger {
    breaks: HashSet<String>,
    src_line_bps: Vec<SrcLineBp>,
    src_line_bps_by_line: HashMap<u32, Vec<usize>>,
    last_hit_src: Option<(u32, u32)>,
    watch_ids: HashMap<String, u32>,
    watch_entries: Vec<WatchEntry>,
    mem_watches: Vec<MemWatchRange>,
    mem_watches_sorted: bool,
    mem_events: Vec<MemWatchHit>,
    source_map: Option<SourceMap>,
}

/// Normalise a file-system path so breakpoint comparisons are stable.
///
/// Backslashes become forward slashes, `.` and `..` segments collapse
/// lexically, and empty inputs become `.`. On case-insensitive platforms the
/// result is lowercased to match the source manager.
pub fn normalize_path(path: &str) -> String {
    let replaced = path.replace('\\', "/");
    if replaced.is_empty() {
        return ".".to_string();
    }

    let absolute = replaced.starts_with('/');
    let mut segments: Vec<&str> = Vec::new();
    for segment in replaced.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if matches!(segments.last(), Some(&s) if s != "..") {
                    segments.pop();
                } else if !absolute {
                    segments.push("..");
                }
            }
            other => segments.push(other),
        }
    }

    let mut out = String::new();
    if absolute {
        out.push('/');
    }
    out.push_str(&segments.join("/"));
    if out.is_empty() {
        out.push('.');
    }

    #[cfg(windows)]
    let out = out.to_ascii_lowercase();

    out
}

/// Canonical path plus basename for breakpoint matching.
pub fn normalize_path_with_base(path: &str) -> (String, String) {
    let norm = normalize_path(path);
    let base = match norm.rfind('/') {
        Some(pos) => norm[pos + 1..].to_string(),
        None => norm.clone(),
    };
    (norm, base)
}

impl Debugger {
    /// Controller with no breakpoints or watches.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the map used to resolve instruction file ids.
    pub fn set_source_map(&mut self, map: SourceMap) {
        self.source_map = Some(map);
    }

    /// Register a block-label breakpoint.
    pub fn add_break(&mut self, label: impl Into<String>) {
        self.breaks.insert(label.into());
    }

    /// True when the block has a label breakpoint.
    pub fn should_break(&self, block: &BasicBlock) -> bool {
        !self.breaks.is_empty() && self.breaks.contains(block.label.as_str())
    }

    /// Register a source-line breakpoint by path (or basename) and line.
    pub fn add_break_src_line(&mut self, file: &str, line: u32) {
        let (norm_file, base) = normalize_path_with_base(file);
        let idx = self.src_line_bps.len();
        self.src_line_bps.push(SrcLineBp {
            norm_file,
            base,
            line,
        });
        self.src_line_bps_by_line.entry(line).or_default().push(idx);
    }

    /// True when any source-line breakpoints exist.
    pub fn has_src_line_bps(&self) -> bool {
        !self.src_line_bps.is_empty()
    }

    /// Decide whether this instruction hits a source-line breakpoint.
    ///
    /// The last-hit cache suppresses repeated stops on the same line until
    /// execution leaves and re-enters it.
    pub fn should_break_on(&mut self, instr: &Instr) -> bool {
        if self.src_line_bps.is_empty() || !instr.loc.has_file() || !instr.loc.has_line() {
            return false;
        }
        let Some(map) = &self.source_map else {
            return false;
        };

        let file_id = instr.loc.file_id;
        let line = instr.loc.line;
        if self.last_hit_src == Some((file_id, line)) {
            return false;
        }

        let Some(path) = map.path(file_id) else {
            log::debug!("unresolved file id {file_id} while checking breakpoint line {line}");
            return false;
        };

        let Some(candidates) = self.src_line_bps_by_line.get(&line) else {
            return false;
        };

        let (norm_file, base) = normalize_path_with_base(path);
        for &idx in candidates {
            let bp = &self.src_line_bps[idx];
            if norm_file == bp.norm_file || base == bp.base {
                self.last_hit_src = Some((file_id, line));
                return true;
            }
        }
        false
    }

    /// Forget the last source-line hit so the same line can stop again.
    pub fn reset_last_hit(&mut self) {
        self.last_hit_src = None;
    }

    /// Basename of the path registered for a file id, empty when unknown.
    pub fn source_basename(&self, file_id: u32) -> String {
        self.source_map
            .as_ref()
            .and_then(|map| map.path(file_id))
            .map(|path| normalize_path_with_base(path).1)
            .unwrap_or_default()
    }

    /// Register a variable watch; returns its numeric id (>= 1).
    pub fn add_watch(&mut self, name: impl Into<String>) -> u32 {
        let name = name.into();
        if let Some(&id) = self.watch_ids.get(name.as_str()) {
            return id;
        }
        if self.watch_entries.is_empty() {
            // Index 0 is the "not watched" sentinel.
            self.watch_entries.push(WatchEntry::default());
        }
        self.watch_entries.push(WatchEntry::default());
        let id = (self.watch_entries.len() - 1) as u32;
        self.watch_ids.insert(name, id);
        id
    }

    /// O(1) watch-id lookup; 0 means not watched.
    pub fn watch_id(&self, name: &str) -> u32 {
        self.watch_ids.get(name).copied().unwrap_or(0)
    }

    /// True when any variable watches exist; store handlers use this to skip
    /// all string work on the hot path.
    pub fn has_var_watches(&self) -> bool {
        !self.watch_ids.is_empty()
    }

    /// Report a store to a possibly-watched name.
    #[allow(clippy::too_many_arguments)]
    pub fn on_store(
        &mut self,
        name: &str,
        ty: TypeKind,
        i64: i64,
        f64: f64,
        func: &str,
        block: &str,
        ip: usize,
    ) {
        let id = self.watch_id(name);
        if id == 0 {
            return;
        }
        self.on_store_by_id(id, name, ty, i64, f64, func, block, ip);
    }

    /// Report a store to a watched variable by id (fast path).
    #[allow(clippy::too_many_arguments)]
    pub fn on_store_by_id(
        &mut self,
        watch_id: u32,
        name: &str,
        ty: TypeKind,
        i64: i64,
        f64: f64,
        func: &str,
        block: &str,
        ip: usize,
    ) {
        let Some(entry) = self.watch_entries.get_mut(watch_id as usize) else {
            return;
        };
        if watch_id == 0 {
            return;
        }

        if !ty.is_integer() && ty != TypeKind::F64 {
            eprintln!("[WATCH] {name}=[unsupported]  (fn=@{func} blk={block} ip=#{ip})");
            return;
        }

        let type_changed = entry.has_value && entry.ty != ty;
        let mut changed = !entry.has_value || type_changed;
        if !changed {
            if ty == TypeKind::F64 {
                changed = entry.f64 != f64;
            } else {
                changed = entry.i64 != i64;
            }
        }

        if changed {
            if ty == TypeKind::F64 {
                eprintln!(
                    "[WATCH] {name}={}:{f64}  (fn=@{func} blk={block} ip=#{ip})",
                    ty.name()
                );
            } else {
                eprintln!(
                    "[WATCH] {name}={}:{i64}  (fn=@{func} blk={block} ip=#{ip})",
                    ty.name()
                );
            }
        }

        if ty == TypeKind::F64 {
            if type_changed {
                entry.i64 = 0;
            }
            entry.f64 = f64;
        } else {
            if type_changed {
                entry.f64 = 0.0;
            }
            entry.i64 = i64;
        }
        entry.ty = ty;
        entry.has_value = true;
    }

    /// Register a memory watch over `[addr, addr + size)` with a tag.
    pub fn add_mem_watch(&mut self, addr: usize, size: usize, tag: impl Into<String>) -> bool {
        if addr == 0 || size == 0 {
            return false;
        }
        self.mem_watches.push(MemWatchRange {
            start: addr,
            end: addr + size,
            addr,
            size,
            tag: tag.into(),
        });
        self.mem_watches_sorted = false;
        true
    }

    /// Remove the watch matching the (addr, size, tag) triple.
    pub fn remove_mem_watch(&mut self, addr: usize, size: usize, tag: &str) -> bool {
        if let Some(pos) = self
            .mem_watches
            .iter()
            .position(|w| w.addr == addr && w.size == size && w.tag == tag)
        {
            self.mem_watches.remove(pos);
            self.mem_watches_sorted = self.mem_watches.is_empty();
            return true;
        }
        false
    }

    /// True when any memory watches exist.
    pub fn has_mem_watches(&self) -> bool {
        !self.mem_watches.is_empty()
    }

    /// Test a store against the installed ranges and enqueue hits.
    ///
    /// Small watch sets scan linearly; larger sets sort by start address once
    /// and binary-search for the first candidate.
    pub fn on_mem_write(&mut self, addr: usize, size: usize) {
        if self.mem_watches.is_empty() || addr == 0 || size == 0 {
            return;
        }

        let write_start = addr;
        let write_end = addr + size;

        const LINEAR_THRESHOLD: usize = 8;
        if self.mem_watches.len() < LINEAR_THRESHOLD {
            for w in &self.mem_watches {
                if write_end > w.start && w.end > write_start {
                    self.mem_events.push(MemWatchHit {
                        addr,
                        size,
                        tag: w.tag.clone(),
                    });
                }
            }
            return;
        }

        if !self.mem_watches_sorted {
            self.mem_watches.sort_by_key(|w| w.start);
            self.mem_watches_sorted = true;
        }

        let first = self.mem_watches.partition_point(|w| w.end <= write_start);
        for w in &self.mem_watches[first..] {
            if w.start >= write_end {
                break;
            }
            if write_end > w.start && w.end > write_start {
                self.mem_events.push(MemWatchHit {
                    addr,
                    size,
                    tag: w.tag.clone(),
                });
            }
        }
    }

    /// Drain pending memory-watch hits.
    pub fn drain_mem_watch_events(&mut self) -> Vec<MemWatchHit> {
        std::mem::take(&mut self.mem_events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("a\\b\\c.bas"), "a/b/c.bas");
        assert_eq!(normalize_path("a/./b/../c.bas"), "a/c.bas");
        assert_eq!(normalize_path(""), ".");
        assert_eq!(normalize_path("/x//y/"), "/x/y");
    }

    #[test]
    fn test_normalize_path_with_base() {
        let (norm, base) = normalize_path_with_base("src\\prog\\main.bas");
        assert_eq!(norm, "src/prog/main.bas");
        assert_eq!(base, "main.bas");
    }

    #[test]
    fn test_watch_ids() {
        let mut dbg = Debugger::new();
        assert_eq!(dbg.watch_id("x"), 0);
        let id = dbg.add_watch("x");
        assert!(id >= 1);
        assert_eq!(dbg.add_watch("x"), id);
        assert_eq!(dbg.watch_id("x"), id);
        assert!(dbg.has_var_watches());
    }

    #[test]
    fn test_mem_watch_linear_hits() {
        let mut dbg = Debugger::new();
        assert!(dbg.add_mem_watch(0x1000, 16, "buf"));
        dbg.on_mem_write(0x1008, 8);
        dbg.on_mem_write(0x2000, 8);
        let hits = dbg.drain_mem_watch_events();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].tag, "buf");
        assert!(dbg.drain_mem_watch_events().is_empty());
    }

    #[test]
    fn test_mem_watch_sorted_regime() {
        let mut dbg = Debugger::new();
        for i in 0..10usize {
            assert!(dbg.add_mem_watch(0x1000 + i * 0x100, 16, format!("w{i}")));
        }
        dbg.on_mem_write(0x1208, 4);
        let hits = dbg.drain_mem_watch_events();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].tag, "w2");
    }

    #[test]
    fn test_mem_watch_remove() {
        let mut dbg = Debugger::new();
        assert!(dbg.add_mem_watch(0x1000, 8, "a"));
        assert!(dbg.remove_mem_watch(0x1000, 8, "a"));
        assert!(!dbg.remove_mem_watch(0x1000, 8, "a"));
        assert!(!dbg.has_mem_watches());
    }
}
