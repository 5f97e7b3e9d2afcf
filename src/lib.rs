//! A runtime encoding engine for assembling ARMv7-M (Thumb-2 + VFP) code at
//! runtime. Combined with a dynasm-style preprocessor that emits an [`action
//! list`](action) and supplies runtime operand values, this crate resolves
//! labels, computes branch displacements, patches immediates, and produces an
//! executable byte image ready to be copied into executable memory for JIT
//! execution.
//!
//! The engine runs as three passes over one [`State`]:
//!
//! 1. [`emit::put`] walks the action list, buffering one entry per action and
//!    threading forward label references into chains living in the section
//!    buffers themselves.
//! 2. [`link::link`] resolves every chain it can, shrinks `ALIGN` padding to
//!    its minimal size, and computes final byte offsets.
//! 3. [`encode::encode`] replays the buffered entries, emitting the Thumb-2
//!    instruction stream and patching displacements, immediates and VFP
//!    register lists into it.
//!
//! Parsing mnemonics, matching templates and reading source files is out of
//! scope here; this crate consumes only the binary action-opcode contract a
//! preprocessor produces.

pub mod action;
pub mod emit;
pub mod encode;
pub mod endian;
pub mod imm;
pub mod label;
pub mod link;
pub mod section;
pub mod state;
pub mod status;

pub use action::{Action, ActionWord};
pub use endian::Endian;
pub use label::{LabelSlot, LgLabels, PcLabels};
pub use link::getpclabel;
pub use section::{Position, Section};
pub use state::{GrowHook, State};
pub use status::{EngineError, Status, StatusClass};

use std::ops::Deref;

/// Casts an expression to a `*const _` pointer and then to the `i32` an
/// action-list argument slot expects. A shorthand for passing pointers
/// (label targets, jump tables, host callback addresses) as `put` arguments
/// on this engine's 32-bit target.
#[macro_export]
macro_rules! Pointer {
    ($e:expr) => {
        $e as *const _ as i32
    };
}

/// As [`Pointer!`], but casts through a `*mut _` pointer.
#[macro_export]
macro_rules! MutPointer {
    ($e:expr) => {
        $e as *mut _ as i32
    };
}

/// A thin ergonomic wrapper around a [`State`] plus the action list and
/// runtime-argument staging buffer a `put` call needs, mirroring
/// `dynasmrt::Assembler` minus the mmap-backed execution machinery (out of
/// scope per this engine's non-goals: code-cache and icache management are
/// the host's responsibility).
///
/// `'a` is the lifetime of the borrowed, preprocessor-emitted action list;
/// `State` itself has no such borrow and outlives any one `put`/`link`/`encode`
/// cycle.
#[derive(Debug)]
pub struct Assembler<'a> {
    state: State,
    actions: &'a [u32],
    args: Vec<i32>,
}

impl<'a> Assembler<'a> {
    /// Allocates a fresh [`State`] with `maxsections` sections and installs
    /// `actions` as the action list subsequent [`Assembler::put`] calls walk.
    pub fn new(maxsections: u32, actions: &'a [u32]) -> Assembler<'a> {
        let mut state = State::init(maxsections);
        state.setup();
        Assembler { state, actions, args: Vec::new() }
    }

    /// Borrows the underlying [`State`], for hosts that need direct access to
    /// label tables or status outside the `put`/`finalize` happy path.
    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut State {
        &mut self.state
    }

    /// Stages one runtime argument for the next [`Assembler::put`] call, in
    /// the order the action list's opcodes will consume them.
    pub fn push_arg(&mut self, value: i32) -> &mut Self {
        self.args.push(value);
        self
    }

    /// Runs `put` from `start` against the staged argument buffer, then
    /// clears it for the next call.
    pub fn put(&mut self, start: u32) -> Result<(), EngineError> {
        let args = std::mem::take(&mut self.args);
        emit::put(&mut self.state, self.actions, start, &args)
    }

    /// Links and encodes the buffered sections into a fresh [`CodeBuffer`],
    /// with no external-label relocations expected.
    pub fn finalize(self, base_addr: u32, globals: &mut [u32]) -> Result<CodeBuffer, EngineError> {
        self.finalize_with_extern(base_addr, globals, &mut |_, _, _| 0)
    }

    /// As [`Assembler::finalize`], but routes `REL_EXT` actions through
    /// `extern_resolve` (§6's external-label callback).
    pub fn finalize_with_extern(
        mut self,
        base_addr: u32,
        globals: &mut [u32],
        extern_resolve: &mut dyn FnMut(u32, u32, bool) -> i32,
    ) -> Result<CodeBuffer, EngineError> {
        let size = link::link(&mut self.state)?;
        let mut bytes = vec![0u8; size as usize];
        encode::encode(&mut self.state, &mut bytes, base_addr, globals, extern_resolve)?;
        Ok(CodeBuffer { bytes })
    }
}

/// The finished instruction stream produced by [`Assembler::finalize`].
/// Dereferences to `&[u8]`, ready to be copied into executable memory by the
/// host; this crate performs no mmap or page-protection work itself.
#[derive(Debug, Clone)]
pub struct CodeBuffer {
    bytes: Vec<u8>,
}

impl Deref for CodeBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{make, Action};

    #[test]
    fn assembler_runs_put_link_encode_end_to_end() {
        let actions = [
            make(Action::LabelLg, 1),
            0xF000_D000u32,
            make(Action::RelLg, 0xC000 | 1),
            make(Action::Stop, 0),
        ];
        let mut globals = Vec::new();
        let mut asm = Assembler::new(1, &actions);
        asm.put(0).unwrap();
        let code = asm.finalize(0, &mut globals).unwrap();
        assert_eq!(code.len(), 4);
    }

    #[test]
    fn pointer_macros_cast_through_raw_pointers() {
        let value: u32 = 7;
        let as_arg: i32 = Pointer!(&value);
        assert_ne!(as_arg, 0);
        let mut other: u32 = 9;
        let as_mut_arg: i32 = MutPointer!(&mut other);
        assert_ne!(as_mut_arg, 0);
    }
}
