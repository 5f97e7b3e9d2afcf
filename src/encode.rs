//! Pass 3: `encode` (`SPEC_FULL.md` §4.5).
//!
//! Like `link`, this pass never re-walks the action list: each section's
//! parallel `buffer`/`kinds` vectors carry everything needed to reproduce the
//! instruction stream. The deferred endian swap (§4.6, §9) is implemented by
//! [`Cursor`], which holds the most recently emitted word un-swapped until
//! either a new word is emitted or the buffer ends, so later actions can
//! still `OR` bits into it.

use crate::action::{self, RelKind};
use crate::emit;
use crate::endian::Endian;
use crate::imm;
use crate::label::LgLabels;
use crate::section::EntryKind;
use crate::state::State;
use crate::status::{EngineError, Status, StatusClass};

fn fail(state: &mut State, class: StatusClass, index: u32) -> EngineError {
    let status = Status::new(class, index);
    state.status = status;
    log::warn!("encode failed: {status}");
    EngineError::from_status(status).expect("non-OK class always maps to an EngineError")
}

/// Holds the most recently emitted word un-swapped (and its byte offset)
/// until it must be finalized, so in-place `OR`-patching by later actions
/// (§4.5) stays correct. `flush` performs the actual endian swap and byte
/// write (§4.6); it is a no-op once nothing is pending.
struct Cursor<'a> {
    endian: Endian,
    out: &'a mut [u8],
    written: u32,
    pending: Option<(u32, usize)>,
}

impl<'a> Cursor<'a> {
    fn new(endian: Endian, out: &'a mut [u8]) -> Cursor<'a> {
        Cursor { endian, out, written: 0, pending: None }
    }

    fn flush(&mut self) {
        if let Some((word, offset)) = self.pending.take() {
            self.endian.write_word(word, &mut self.out[offset..offset + 4]);
        }
    }

    fn emit(&mut self, word: u32) {
        self.flush();
        let offset = self.written as usize;
        self.pending = Some((word, offset));
        self.written += 4;
    }

    /// `cp[-1] |= bits`. Returns `false` (a phase error, per §4.5's final
    /// check) if there is no previously emitted word to patch.
    fn patch_or(&mut self, bits: u32) -> bool {
        match &mut self.pending {
            Some((word, _)) => {
                *word |= bits;
                true
            }
            None => false,
        }
    }

    /// `cp`: the address one past the most recently emitted word.
    fn cp(&self, base_addr: u32) -> u32 {
        base_addr + self.written
    }

    /// The address of the most recently emitted word itself (`cp - 4`),
    /// used by `REL_APC`'s alternate bias (§4.5).
    fn instr_addr(&self, base_addr: u32) -> u32 {
        base_addr + self.pending.map(|(_, off)| off as u32).unwrap_or(self.written.saturating_sub(4))
    }
}

/// Patches a branch/load/ADR displacement `n` into the pending word per its
/// [`RelKind`] (§4.5's `REL_LG`/`REL_PC`/`REL_APC` bullet).
fn patch_rel(cursor: &mut Cursor, kind: RelKind, n: i32) -> Result<(), StatusClass> {
    let bits = match kind {
        RelKind::Branch { wide: true } => imm::pack_branch_wide(n).ok_or(StatusClass::RangeRel)?,
        RelKind::Branch { wide: false } => imm::pack_branch_narrow(n).ok_or(StatusClass::RangeRel)?,
        RelKind::VfpLoad => {
            if n % 4 != 0 {
                return Err(StatusClass::RangeRel);
            }
            let scaled = n / 4;
            if scaled.unsigned_abs() > 0xFF {
                return Err(StatusClass::RangeRel);
            }
            imm::pack_immv8(scaled)
        }
        RelKind::Adr => imm::pack_adr(n).ok_or(StatusClass::RangeRel)?,
        RelKind::Imml => {
            if n.unsigned_abs() > 0xFFF {
                return Err(StatusClass::RangeRel);
            }
            imm::pack_imml(n)
        }
    };
    if !cursor.patch_or(bits) {
        return Err(StatusClass::Phase);
    }
    Ok(())
}

fn label_address(state: &State, pos: crate::section::Position, base_addr: u32) -> u32 {
    let section = &state.sections[pos.section() as usize];
    base_addr + section.base_offset + section.buffer[pos.index() as usize] as u32
}

/// Runs the encode pass, writing the final Thumb-2 image into `out`
/// (which must be at least `state.codesize` bytes). `base_addr` is the
/// address `out`'s first byte will occupy once the host copies it into
/// executable memory -- it is folded into every absolute-address
/// computation (REL_APC targets, and the addresses this pass publishes into
/// `globals`) even though displacement math itself does not depend on it.
/// `globals` is the host's global-label address array (§3 `Globals` entity,
/// biased by `-10` per `LgLabels::global_array_index`); `extern_resolve` is
/// the optional `REL_EXT` callback (§6), invoked as
/// `extern_resolve(cp_addr, extern_index, is_data) -> displacement`.
pub fn encode(
    state: &mut State,
    out: &mut [u8],
    base_addr: u32,
    globals: &mut [u32],
    extern_resolve: &mut dyn FnMut(u32, u32, bool) -> i32,
) -> Result<u32, EngineError> {
    if !state.status.is_ok() {
        log::trace!("encode: short-circuiting, status already {}", state.status);
        return Err(EngineError::from_status(state.status).expect("non-OK status maps to an error"));
    }
    if (out.len() as u64) < state.codesize as u64 {
        return Err(fail(state, StatusClass::NoMem, 0));
    }

    let mut cursor = Cursor::new(state.endian, out);

    for sec_idx in 0..state.sections.len() {
        let len = state.sections[sec_idx].buffer.len();
        let mut i = 0usize;
        while i < len {
            let kind = state.sections[sec_idx].kinds[i];
            let value = state.sections[sec_idx].buffer[i];
            let action_index = crate::section::Position::new(sec_idx as u8, i as u32).raw();
            match kind {
                EntryKind::Literal => cursor.emit(value as u32),
                EntryKind::Align(_) => {
                    let pad_bytes = value as u32;
                    for _ in 0..(pad_bytes / 4) {
                        cursor.emit(imm::NOP_W);
                    }
                }
                EntryKind::LabelLg(idx) => {
                    if idx >= crate::label::GLOBAL_HOST_ARRAY_BASE {
                        let addr = base_addr + state.sections[sec_idx].base_offset + value as u32;
                        let slot = LgLabels::global_array_index(idx);
                        if slot >= globals.len() {
                            return Err(fail(state, StatusClass::RangeLg, action_index));
                        }
                        globals[slot] = addr;
                    }
                }
                EntryKind::LabelPc(_) => {}
                EntryKind::RelLg(payload) => {
                    let pos = emit::resolved_position(value)
                        .ok_or_else(|| fail(state, StatusClass::Phase, action_index))?;
                    let target = label_address(state, pos, base_addr);
                    let n = target as i64 - cursor.cp(base_addr) as i64;
                    patch_rel(&mut cursor, action::decode_rel_kind(payload), n as i32)
                        .map_err(|c| fail(state, c, action_index))?;
                }
                EntryKind::RelLgExternal(payload, global_idx) => {
                    let slot = LgLabels::global_array_index(global_idx);
                    let target = *globals.get(slot).ok_or_else(|| fail(state, StatusClass::RangeLg, action_index))?;
                    let n = target as i64 - cursor.cp(base_addr) as i64;
                    patch_rel(&mut cursor, action::decode_rel_kind(payload), n as i32)
                        .map_err(|c| fail(state, c, action_index))?;
                }
                EntryKind::RelPc(payload) => {
                    let pos = emit::resolved_position(value)
                        .ok_or_else(|| fail(state, StatusClass::Phase, action_index))?;
                    let target = label_address(state, pos, base_addr);
                    let n = target as i64 - cursor.cp(base_addr) as i64;
                    patch_rel(&mut cursor, action::decode_rel_kind(payload), n as i32)
                        .map_err(|c| fail(state, c, action_index))?;
                }
                EntryKind::RelApc(payload) => {
                    let target = value as u32;
                    let n = target as i64 - cursor.instr_addr(base_addr) as i64;
                    patch_rel(&mut cursor, action::decode_rel_kind(payload), n as i32)
                        .map_err(|c| fail(state, c, action_index))?;
                }
                EntryKind::RelExt(payload) => {
                    let (extern_index, is_data) = action::decode_rel_ext(payload);
                    let cp_addr = cursor.cp(base_addr);
                    let displacement = extern_resolve(cp_addr, extern_index, is_data);
                    if !cursor.patch_or(displacement as u32) {
                        return Err(fail(state, StatusClass::Phase, action_index));
                    }
                }
                EntryKind::Imm(payload) => {
                    let p = action::decode_imm_payload(payload);
                    let raw = (value as u32).wrapping_shr(p.scale);
                    let masked = if p.bits >= 32 { raw } else { raw & ((1u32 << p.bits) - 1) };
                    if !cursor.patch_or(masked << p.shift) {
                        return Err(fail(state, StatusClass::Phase, action_index));
                    }
                }
                EntryKind::Imm12 => {
                    let code = imm::encode_modified_imm12(value as u32)
                        .ok_or_else(|| fail(state, StatusClass::RangeI, action_index))?;
                    if !cursor.patch_or(imm::pack_modified_imm12(code)) {
                        return Err(fail(state, StatusClass::Phase, action_index));
                    }
                }
                EntryKind::Imm16 => {
                    if !cursor.patch_or(imm::pack_imm16(value as u32 & 0xFFFF)) {
                        return Err(fail(state, StatusClass::Phase, action_index));
                    }
                }
                EntryKind::Imm32 => {
                    if !cursor.patch_or(value as u32) {
                        return Err(fail(state, StatusClass::Phase, action_index));
                    }
                }
                EntryKind::Imml => {
                    if value.unsigned_abs() > 0xFFF {
                        return Err(fail(state, StatusClass::RangeI, action_index));
                    }
                    if !cursor.patch_or(imm::pack_imml(value)) {
                        return Err(fail(state, StatusClass::Phase, action_index));
                    }
                }
                EntryKind::Immv8 => {
                    let scaled = value / 4;
                    if value % 4 != 0 || scaled.unsigned_abs() > 0xFF {
                        return Err(fail(state, StatusClass::RangeI, action_index));
                    }
                    if !cursor.patch_or(imm::pack_immv8(scaled)) {
                        return Err(fail(state, StatusClass::Phase, action_index));
                    }
                }
                EntryKind::Immshift(payload) => {
                    if !cursor.patch_or(imm::pack_immshift(payload as u32, value as u32)) {
                        return Err(fail(state, StatusClass::Phase, action_index));
                    }
                }
                EntryKind::VrlistRa(payload) => {
                    debug_assert!(i + 1 < len, "VRLIST's second register entry is missing");
                    let rb_value = state.sections[sec_idx].buffer[i + 1];
                    let double_precision = payload & 1 != 0;
                    let bits = imm::pack_vrlist(double_precision, value as u32, rb_value as u32)
                        .ok_or_else(|| fail(state, StatusClass::RangeI, action_index))?;
                    if !cursor.patch_or(bits) {
                        return Err(fail(state, StatusClass::Phase, action_index));
                    }
                    i += 1;
                }
                EntryKind::VrlistRb(_) => {
                    unreachable!("VRLIST's second entry is consumed together with its first")
                }
            }
            i += 1;
        }
    }

    cursor.flush();

    if cursor.written != state.codesize {
        return Err(fail(state, StatusClass::Phase, 0));
    }
    log::debug!("encode: wrote {} bytes", cursor.written);
    Ok(cursor.written)
}
