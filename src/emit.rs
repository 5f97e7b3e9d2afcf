//! Pass 1: `put` (`SPEC_FULL.md` §4.3).
//!
//! Walks the action list starting at `start`, consuming runtime arguments
//! from an ordered slice (the Rust stand-in for the C original's variadic
//! argument list, per the Design Note in §9), and appends one buffer entry
//! per action into the active section. Immediates are range-checked here,
//! gated by the `checked` feature; labels are threaded into forward-reference
//! chains living inside the section buffers themselves.

use crate::action::{self, Action, ActionWord};
use crate::imm;
use crate::label::LabelSlot;
use crate::section::{EntryKind, Position};
use crate::state::State;
use crate::status::{EngineError, Status, StatusClass};

struct Args<'a> {
    values: &'a [i32],
    cursor: usize,
}

impl<'a> Args<'a> {
    fn new(values: &'a [i32]) -> Args<'a> {
        Args { values, cursor: 0 }
    }

    /// Pulls the next argument. Like the C variadic contract it mirrors,
    /// reading past the end is the caller's bug, not a recoverable error;
    /// it yields `0` rather than panicking so a malformed `put` call fails
    /// the (cheap, local) range checks downstream instead of the process.
    fn next(&mut self) -> i32 {
        let v = self.values.get(self.cursor).copied().unwrap_or(0);
        self.cursor += 1;
        v
    }
}

/// A forward-reference chain link stored in a section buffer entry: `0` is
/// the chain terminator, any other value is `position.raw() + 1` of the next
/// (older) waiting reference.
fn encode_chain_link(next: Option<Position>) -> i32 {
    match next {
        None => 0,
        Some(p) => (p.raw() as i32).wrapping_add(1),
    }
}

fn decode_chain_link(value: i32) -> Option<Position> {
    if value == 0 {
        None
    } else {
        Some(Position::from_raw((value - 1) as u32))
    }
}

/// A resolved (defined) label reference stored in a buffer entry: always
/// strictly negative, so it can never be confused with a chain link (which
/// is always `>= 0`).
fn encode_defined(pos: Position) -> i32 {
    -(pos.raw() as i32) - 1
}

fn decode_defined(value: i32) -> Position {
    Position::from_raw((-(value + 1)) as u32)
}

fn fits_bits(value: i32, bits: u32, signed: bool) -> bool {
    if bits >= 32 {
        return true;
    }
    if signed {
        let min = -(1i64 << (bits.saturating_sub(1).min(62)));
        let max = (1i64 << (bits.saturating_sub(1).min(62))) - 1;
        let v = value as i64;
        v >= min && v <= max
    } else {
        value >= 0 && (value as u32) < (1u32 << bits)
    }
}

fn fail(state: &mut State, class: StatusClass, index: u32) -> Result<(), EngineError> {
    let status = Status::new(class, index);
    state.status = status;
    log::warn!("put failed at action #{index}: {status}");
    Err(EngineError::from_status(status).expect("non-OK class always maps to an EngineError"))
}

/// Runs one `put` call: walks `actions` from `start` until a terminal
/// `STOP`/`SECTION`, appending buffer entries to `state`'s active section.
pub fn put(state: &mut State, actions: &[u32], start: u32, args: &[i32]) -> Result<(), EngineError> {
    log::trace!("put: starting at action index {start}");
    let mut ip = start as usize;
    let mut args = Args::new(args);
    loop {
        let action_index = ip as u32;
        let word = actions[ip];
        ip += 1;
        match action::decode(word) {
            ActionWord::Literal(w) => {
                state.push_entry(w as i32, EntryKind::Literal);
                state.current_section().offset += 4;
            }
            ActionWord::Pseudo(Action::Stop, _) => {
                log::trace!("put: STOP at action index {action_index}");
                return Ok(());
            }
            ActionWord::Pseudo(Action::Section, payload) => {
                let target = action::section_index(payload) as usize;
                if target >= state.sections.len() {
                    return fail(state, StatusClass::RangeSec, action_index);
                }
                state.cur_section = target;
                log::trace!("put: SECTION switched to {target} at action index {action_index}");
                return Ok(());
            }
            ActionWord::Pseudo(Action::Esc, _) => {
                let literal = actions[ip];
                ip += 1;
                state.push_entry(literal as i32, EntryKind::Literal);
                state.current_section().offset += 4;
            }
            ActionWord::Pseudo(Action::RelExt, payload) => {
                state.push_entry(0, EntryKind::RelExt(payload));
            }
            ActionWord::Pseudo(Action::Align, payload) => {
                let mask = action::align_mask(payload);
                let offset = state.current_section().offset as i32;
                state.push_entry(offset, EntryKind::Align(mask));
                state.current_section().offset += mask;
            }
            ActionWord::Pseudo(Action::RelLg, payload) => {
                put_rel_lg(state, payload, action_index)?;
            }
            ActionWord::Pseudo(Action::RelPc, payload) => {
                let idx = args.next() as u32;
                put_rel_pc(state, idx, payload, action_index)?;
            }
            ActionWord::Pseudo(Action::RelApc, payload) => {
                let pointer = args.next();
                state.push_entry(pointer, EntryKind::RelApc(payload));
            }
            ActionWord::Pseudo(Action::LabelLg, payload) => {
                put_label_lg(state, payload, action_index)?;
            }
            ActionWord::Pseudo(Action::LabelPc, _payload) => {
                let idx = args.next() as u32;
                put_label_pc(state, idx, action_index)?;
            }
            ActionWord::Pseudo(Action::Imm, payload) => {
                let value = args.next();
                let p = action::decode_imm_payload(payload);
                if cfg!(feature = "checked") && !fits_bits(value, p.bits, p.signed) {
                    return fail(state, StatusClass::RangeI, action_index);
                }
                state.push_entry(value, EntryKind::Imm(payload));
            }
            ActionWord::Pseudo(Action::Imm12, _) => {
                let value = args.next();
                if cfg!(feature = "checked") && imm::encode_modified_imm12(value as u32).is_none() {
                    return fail(state, StatusClass::RangeI, action_index);
                }
                state.push_entry(value, EntryKind::Imm12);
            }
            ActionWord::Pseudo(Action::Imm16, _) => {
                let value = args.next();
                if cfg!(feature = "checked") && !(0..=0xFFFF).contains(&value) {
                    return fail(state, StatusClass::RangeI, action_index);
                }
                state.push_entry(value, EntryKind::Imm16);
            }
            ActionWord::Pseudo(Action::Imm32, _) => {
                let value = args.next();
                state.push_entry(value, EntryKind::Imm32);
            }
            ActionWord::Pseudo(Action::Imml, _) => {
                let value = args.next();
                if cfg!(feature = "checked") && value.unsigned_abs() > 0xFFF {
                    return fail(state, StatusClass::RangeI, action_index);
                }
                state.push_entry(value, EntryKind::Imml);
            }
            ActionWord::Pseudo(Action::Immv8, _) => {
                let value = args.next();
                if cfg!(feature = "checked") && (value % 4 != 0 || (value / 4).unsigned_abs() > 0xFF) {
                    return fail(state, StatusClass::RangeI, action_index);
                }
                state.push_entry(value, EntryKind::Immv8);
            }
            ActionWord::Pseudo(Action::Immshift, payload) => {
                let value = args.next();
                state.push_entry(value, EntryKind::Immshift(payload));
            }
            ActionWord::Pseudo(Action::Vrlist, payload) => {
                let ra = args.next();
                let rb = args.next();
                let in_range = (0..=30).contains(&ra) && (0..=30).contains(&rb);
                if cfg!(feature = "checked") && !(in_range && ra <= rb) {
                    return fail(state, StatusClass::RangeI, action_index);
                }
                state.push_entry(ra, EntryKind::VrlistRa(payload));
                state.push_entry(rb, EntryKind::VrlistRb(payload));
            }
        }
    }
}

fn put_rel_lg(state: &mut State, payload: u16, action_index: u32) -> Result<(), EngineError> {
    let idx = action::lg_slot(payload);
    if idx >= state.lg_labels.len() {
        return fail(state, StatusClass::RangeLg, action_index);
    }
    let cur_pos = Position::new(state.cur_section as u8, state.current_section().pos());
    let entry = match state.lg_labels.get(idx).unwrap() {
        LabelSlot::Defined(pos) => encode_defined(pos),
        LabelSlot::Chain(head) => {
            state.lg_labels.set(idx, LabelSlot::Chain(cur_pos));
            encode_chain_link(Some(head))
        }
        LabelSlot::Unused => {
            state.lg_labels.set(idx, LabelSlot::Chain(cur_pos));
            encode_chain_link(None)
        }
    };
    state.push_entry(entry, EntryKind::RelLg(payload));
    Ok(())
}

fn put_rel_pc(state: &mut State, idx: u32, payload: u16, action_index: u32) -> Result<(), EngineError> {
    if idx >= state.pc_labels.len() {
        return fail(state, StatusClass::RangePc, action_index);
    }
    let cur_pos = Position::new(state.cur_section as u8, state.current_section().pos());
    let entry = match state.pc_labels.get(idx).unwrap() {
        LabelSlot::Defined(pos) => encode_defined(pos),
        LabelSlot::Chain(head) => {
            state.pc_labels.set(idx, LabelSlot::Chain(cur_pos));
            encode_chain_link(Some(head))
        }
        LabelSlot::Unused => {
            state.pc_labels.set(idx, LabelSlot::Chain(cur_pos));
            encode_chain_link(None)
        }
    };
    state.push_entry(entry, EntryKind::RelPc(payload));
    Ok(())
}

fn put_label_lg(state: &mut State, payload: u16, action_index: u32) -> Result<(), EngineError> {
    let idx = action::lg_slot(payload);
    if idx >= state.lg_labels.len() {
        return fail(state, StatusClass::RangeLg, action_index);
    }
    let def_pos = Position::new(state.cur_section as u8, state.current_section().pos());
    if let Some(LabelSlot::Chain(head)) = state.lg_labels.get(idx) {
        patch_chain(state, head, def_pos);
    }
    state.lg_labels.set(idx, LabelSlot::Defined(def_pos));
    let offset = state.current_section().offset as i32;
    state.push_entry(offset, EntryKind::LabelLg(idx));
    Ok(())
}

fn put_label_pc(state: &mut State, idx: u32, action_index: u32) -> Result<(), EngineError> {
    if idx >= state.pc_labels.len() {
        return fail(state, StatusClass::RangePc, action_index);
    }
    let def_pos = Position::new(state.cur_section as u8, state.current_section().pos());
    if let Some(LabelSlot::Chain(head)) = state.pc_labels.get(idx) {
        patch_chain(state, head, def_pos);
    }
    state.pc_labels.set(idx, LabelSlot::Defined(def_pos));
    let offset = state.current_section().offset as i32;
    state.push_entry(offset, EntryKind::LabelPc(idx));
    Ok(())
}

/// Walks a forward-reference chain starting at `head`, overwriting every
/// node with the now-known `def_pos`, stopping at the `0` terminator.
fn patch_chain(state: &mut State, head: Position, def_pos: Position) {
    let mut cur = head;
    loop {
        let section = cur.section() as usize;
        let index = cur.index() as usize;
        let raw_val = state.sections[section].buffer[index];
        let next = decode_chain_link(raw_val);
        state.sections[section].buffer[index] = encode_defined(def_pos);
        match next {
            Some(p) => cur = p,
            None => break,
        }
    }
}

/// Reads back a resolved buffer entry written by [`patch_chain`] or an
/// already-`Defined` reference; used by `link`/`encode`.
pub fn resolved_position(entry: i32) -> Option<Position> {
    if entry < 0 {
        Some(decode_defined(entry))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{make, Action};

    fn run(state: &mut State, actions: &[u32], args: &[i32]) -> Result<(), EngineError> {
        put(state, actions, 0, args)
    }

    #[test]
    fn literal_word_advances_offset_and_is_buffered() {
        let mut state = State::init(1);
        let actions = [0xF000_D000u32, make(Action::Stop, 0)];
        run(&mut state, &actions, &[]).unwrap();
        assert_eq!(state.current_section().buffer, vec![0xF000_D000u32 as i32]);
        assert_eq!(state.current_section().offset, 4);
    }

    #[test]
    fn section_switch_is_terminal() {
        let mut state = State::init(2);
        let actions = [make(Action::Section, 1)];
        run(&mut state, &actions, &[]).unwrap();
        assert_eq!(state.cur_section, 1);
    }

    #[test]
    fn section_out_of_range_fails() {
        let mut state = State::init(1);
        let actions = [make(Action::Section, 5)];
        let err = run(&mut state, &actions, &[]).unwrap_err();
        assert_eq!(err.status().class(), StatusClass::RangeSec);
    }

    #[test]
    fn align_records_offset_and_advances_by_mask() {
        let mut state = State::init(1);
        state.current_section().offset = 2;
        let actions = [make(Action::Align, 0x03), make(Action::Stop, 0)];
        run(&mut state, &actions, &[]).unwrap();
        assert_eq!(state.current_section().buffer, vec![2]);
        assert_eq!(state.current_section().offset, 2 + 3);
    }

    #[test]
    fn imm12_rejects_unrepresentable_value() {
        let mut state = State::init(1);
        let actions = [make(Action::Imm12, 0), make(Action::Stop, 0)];
        let err = run(&mut state, &actions, &[0x1234_5678]).unwrap_err();
        assert_eq!(err.status().class(), StatusClass::RangeI);
    }

    #[test]
    fn forward_reference_chains_then_resolves_on_label_definition() {
        let mut state = State::init(1);
        // Two forward REL_LG references to local label 3, then LABEL_LG 3.
        let actions = [
            make(Action::RelLg, 3),
            make(Action::RelLg, 3),
            make(Action::LabelLg, 3),
            make(Action::Stop, 0),
        ];
        run(&mut state, &actions, &[]).unwrap();
        let buf = &state.current_section().buffer;
        // Both forward-reference slots (buffer[0], buffer[1]) were patched to
        // point at the label's definition position, not left as chain links.
        let def_pos = resolved_position(buf[0]).unwrap();
        assert_eq!(resolved_position(buf[1]).unwrap(), def_pos);
        assert!(matches!(state.lg_labels.get(3), Some(LabelSlot::Defined(p)) if p == def_pos));
    }

    #[test]
    fn backward_reference_resolves_immediately() {
        let mut state = State::init(1);
        let actions = [
            make(Action::LabelLg, 2),
            make(Action::RelLg, 2),
            make(Action::Stop, 0),
        ];
        run(&mut state, &actions, &[]).unwrap();
        let buf = &state.current_section().buffer;
        assert!(resolved_position(buf[1]).is_some());
    }

    #[test]
    fn vrlist_rejects_register_out_of_range() {
        let mut state = State::init(1);
        let actions = [make(Action::Vrlist, 0), make(Action::Stop, 0)];
        let err = run(&mut state, &actions, &[0, 31]).unwrap_err();
        assert_eq!(err.status().class(), StatusClass::RangeI);
    }
}
