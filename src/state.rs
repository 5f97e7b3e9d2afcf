//! Per-assembly-run state (`SPEC_FULL.md` §3, §4.2).
//!
//! Mirrors the C original's `dasm_State`: a section array, the local/global
//! and PC label tables, the current status, the installed endianness, and
//! (once `setup` has run) a borrow of the action list driving the current
//! `put`/`link`/`encode` cycle. `Drop` stands in for the C contract's `free`.

use std::fmt;

use crate::endian::Endian;
use crate::label::{LgLabels, PcLabels};
use crate::section::{EntryKind, Section};
use crate::status::Status;

/// Allocator hook (§6, "required"): invoked whenever a section buffer or
/// label table must grow past its current capacity. Mirrors the C ABI's
/// `grow(state, oldptr, &size, requested_size)` minus the raw pointer --
/// given the old and requested capacity (in entries), it returns the
/// capacity to actually reserve, so a host can substitute an arena-backed
/// growth policy instead of `Vec`'s own allocator. The returned value is
/// clamped up to whatever the caller actually needs, so a hook is free to
/// under-promise without corrupting state.
pub type GrowHook = dyn FnMut(u32, u32) -> u32;

fn default_grow_hook(_old: u32, requested: u32) -> u32 {
    requested
}

/// A boxed [`GrowHook`] with a manual `Debug` impl, since `Box<dyn FnMut>`
/// has none.
pub struct GrowHookBox(Box<GrowHook>);

impl GrowHookBox {
    pub fn new(hook: Box<GrowHook>) -> GrowHookBox {
        GrowHookBox(hook)
    }

    fn call(&mut self, old: u32, requested: u32) -> u32 {
        (self.0)(old, requested)
    }
}

impl Default for GrowHookBox {
    fn default() -> GrowHookBox {
        GrowHookBox::new(Box::new(default_grow_hook))
    }
}

impl fmt::Debug for GrowHookBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("GrowHook(..)")
    }
}

/// Owns everything a `put`/`link`/`encode` cycle needs except the action
/// list itself, which is borrowed only for the duration of one cycle via
/// [`State::setup`] (the lifetime `'a` on that borrow, not on `State` as a
/// whole -- `State` outlives any one action list).
#[derive(Debug)]
pub struct State {
    pub sections: Vec<Section>,
    pub cur_section: usize,
    pub lg_labels: LgLabels,
    pub pc_labels: PcLabels,
    pub status: Status,
    pub endian: Endian,
    pub codesize: u32,
    alloc_hook: GrowHookBox,
}

impl State {
    /// `init(maxsections)`: allocates `maxsections` zeroed section
    /// descriptors and installs the host-detected endianness, plus the
    /// default `Vec`-backed allocator hook.
    pub fn init(maxsections: u32) -> State {
        State {
            sections: (0..maxsections).map(|_| Section::new()).collect(),
            cur_section: 0,
            lg_labels: LgLabels::new(),
            pc_labels: PcLabels::new(),
            status: Status::OK,
            endian: Endian::host(),
            codesize: 0,
            alloc_hook: GrowHookBox::default(),
        }
    }

    /// As [`Self::init`], but with an explicit endianness instead of the
    /// host-detected default (§1.1's ambient generalization for
    /// cross-assembling).
    pub fn init_with_endian(maxsections: u32, endian: Endian) -> State {
        let mut state = State::init(maxsections);
        state.endian = endian;
        state
    }

    /// As [`Self::init`], but installs `hook` in place of the default
    /// grow-to-exactly-what-was-requested behavior (§6's allocator hook),
    /// so a host can route section/label growth through an arena or other
    /// custom allocation discipline.
    pub fn init_with_grow_hook(maxsections: u32, hook: Box<GrowHook>) -> State {
        let mut state = State::init(maxsections);
        state.alloc_hook = GrowHookBox::new(hook);
        state
    }

    /// `setupglobal(capacity)`: grows the local/global label table to
    /// `10 + capacity` slots, all unused, consulting the allocator hook for
    /// the capacity to actually reserve.
    pub fn setup_global(&mut self, capacity: u32) {
        let granted = self.alloc_hook.call(0, capacity).max(capacity);
        self.lg_labels.setup_global(granted);
    }

    /// `growpc(n)`: enlarges the PC label table to at least `n` slots,
    /// consulting the allocator hook for the capacity to actually reserve.
    pub fn growpc(&mut self, n: u32) {
        let old = self.pc_labels.len();
        if n > old {
            let granted = self.alloc_hook.call(old, n).max(n);
            self.pc_labels.grow(granted);
        }
    }

    /// `setup`: resets status to OK, clears both label tables, resets every
    /// section's running offset, and selects section 0 as current. Called
    /// once per `put`/`link`/`encode` cycle, before the first `put`.
    pub fn setup(&mut self) {
        self.status = Status::OK;
        self.lg_labels.reset();
        self.pc_labels.reset();
        for section in &mut self.sections {
            section.reset();
        }
        self.cur_section = 0;
        self.codesize = 0;
    }

    pub fn current_section(&mut self) -> &mut Section {
        &mut self.sections[self.cur_section]
    }

    /// Appends one buffer entry to the active section, consulting the
    /// allocator hook (§6) before growing the underlying storage when it is
    /// full. Every buffer write `put` performs goes through this, so the
    /// hook installed by [`State::init_with_grow_hook`] is a genuine
    /// interception point rather than bypassed by `Vec`'s implicit growth.
    pub fn push_entry(&mut self, value: i32, kind: EntryKind) -> u32 {
        let cur = self.cur_section;
        let (old_cap, len) = {
            let section = &self.sections[cur];
            (section.buffer.capacity() as u32, section.buffer.len())
        };
        if len == old_cap as usize {
            let requested = if old_cap == 0 { 16 } else { old_cap * 2 };
            let granted = self.alloc_hook.call(old_cap, requested).max(len as u32 + 1);
            let section = &mut self.sections[cur];
            let additional = (granted as usize).saturating_sub(section.buffer.len());
            section.buffer.reserve(additional);
            section.kinds.reserve(additional);
        }
        self.sections[cur].push(value, kind)
    }

    /// `free` (§4.2): releases all owned storage. `Drop` already does this
    /// implicitly once `State` goes out of scope; this method exists so
    /// hosts ported from the C ABI have an explicit call site, and consumes
    /// `self` so the state cannot be used again afterwards.
    pub fn free(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_allocates_requested_sections() {
        let state = State::init(3);
        assert_eq!(state.sections.len(), 3);
        assert_eq!(state.status, Status::OK);
    }

    #[test]
    fn setup_resets_labels_and_sections() {
        let mut state = State::init(1);
        state.push_entry(42, crate::section::EntryKind::Literal);
        state.setup();
        assert_eq!(state.current_section().buffer.len(), 0);
        assert_eq!(state.cur_section, 0);
    }

    #[test]
    fn setup_global_and_growpc_resize_label_tables() {
        let mut state = State::init(1);
        state.setup_global(5);
        assert_eq!(state.lg_labels.len(), 15);
        state.growpc(8);
        assert_eq!(state.pc_labels.len(), 8);
    }

    #[test]
    fn push_entry_grows_past_initial_capacity() {
        let mut state = State::init(1);
        for i in 0..40 {
            state.push_entry(i, crate::section::EntryKind::Literal);
        }
        assert_eq!(state.current_section().buffer.len(), 40);
    }

    #[test]
    fn custom_grow_hook_is_consulted_on_section_growth() {
        use std::cell::Cell;
        use std::rc::Rc;

        let calls = Rc::new(Cell::new(0u32));
        let calls_in_hook = calls.clone();
        let hook: Box<GrowHook> = Box::new(move |_old, requested| {
            calls_in_hook.set(calls_in_hook.get() + 1);
            requested
        });
        let mut state = State::init_with_grow_hook(1, hook);
        for i in 0..20 {
            state.push_entry(i, crate::section::EntryKind::Literal);
        }
        assert!(calls.get() > 0);
    }

    #[test]
    fn free_consumes_the_state() {
        let state = State::init(1);
        state.free();
    }
}
