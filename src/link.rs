//! Pass 2: `link` (`SPEC_FULL.md` §4.4).
//!
//! Unlike the C original, this pass never re-walks the action list: every
//! buffer entry already carries the [`EntryKind`] that produced it (see
//! `section.rs`), so `link` only needs to walk each section's buffer once to
//! recompute byte offsets, and separately sweep the label tables to resolve
//! or reject whatever `put` left unresolved.

use crate::label::LabelSlot;
use crate::section::{EntryKind, Position};
use crate::state::State;
use crate::status::{EngineError, Status, StatusClass};

fn fail(state: &mut State, class: StatusClass, index: u32) -> EngineError {
    let status = Status::new(class, index);
    state.status = status;
    log::warn!("link failed: {status}");
    EngineError::from_status(status).expect("non-OK class always maps to an EngineError")
}

fn align_padding(cumulative: u32, mask: u32) -> u32 {
    let align = mask + 1;
    (align - (cumulative % align)) % align
}

/// Walks the forward-reference chain rooted at `head` for global label `idx`,
/// overwriting each node's `RelLg` entry with [`EntryKind::RelLgExternal`] so
/// `encode` resolves it through the host's globals array instead of treating
/// it as a phase error.
fn collapse_global_chain(state: &mut State, idx: u32, head: Position) {
    let mut cur = head;
    loop {
        let section = cur.section() as usize;
        let index = cur.index() as usize;
        let raw = state.sections[section].buffer[index];
        let payload = match state.sections[section].kinds[index] {
            EntryKind::RelLg(p) => p,
            other => unreachable!("global label chain node was not a RelLg entry: {:?}", other),
        };
        state.sections[section].kinds[index] = EntryKind::RelLgExternal(payload, idx);
        match decode_chain_link(raw) {
            Some(next) => cur = next,
            None => break,
        }
    }
}

/// A still-unresolved chain node is always `>= 0` (never `Defined`, since a
/// label whose slot remains `Chain` at link time has never patched any of
/// its waiting nodes); `0` is the terminator.
fn decode_chain_link(value: i32) -> Option<Position> {
    if value == 0 {
        None
    } else {
        Some(Position::from_raw((value - 1) as u32))
    }
}

/// Runs the link pass over every section in `state`, returning the final
/// code size in bytes on success.
pub fn link(state: &mut State) -> Result<u32, EngineError> {
    if !state.status.is_ok() {
        log::trace!("link: short-circuiting, status already {}", state.status);
        return Err(EngineError::from_status(state.status).expect("non-OK status maps to an error"));
    }

    for idx in 0..state.pc_labels.len() {
        if matches!(state.pc_labels.get(idx), Some(LabelSlot::Chain(_))) {
            return Err(fail(state, StatusClass::UndefPc, idx));
        }
    }

    for idx in 0..state.lg_labels.len() {
        match state.lg_labels.get(idx) {
            Some(LabelSlot::Chain(head)) => {
                if idx < crate::label::LOCAL_LABEL_COUNT {
                    return Err(fail(state, StatusClass::UndefLg, idx));
                }
                collapse_global_chain(state, idx, head);
            }
            _ => {}
        }
    }

    let mut cumulative: u32 = 0;
    for section in &mut state.sections {
        section.base_offset = cumulative;
        for i in 0..section.buffer.len() {
            match section.kinds[i] {
                EntryKind::Literal => cumulative += 4,
                EntryKind::Align(mask) => {
                    let pad = align_padding(cumulative, mask);
                    section.buffer[i] = pad as i32;
                    cumulative += pad;
                }
                EntryKind::LabelLg(_) | EntryKind::LabelPc(_) => {
                    section.buffer[i] = cumulative as i32;
                }
                _ => {}
            }
        }
        section.offset = cumulative - section.base_offset;
    }

    state.codesize = cumulative;
    log::debug!("link: codesize = {} bytes across {} section(s)", cumulative, state.sections.len());
    Ok(cumulative)
}

/// `getpclabel` (§4.7): the label's link-time byte offset (`> -2`), `-1` if
/// referenced-but-undefined (or never touched), `-2` if `pc` is out of range.
pub fn getpclabel(state: &State, pc: u32) -> i64 {
    match state.pc_labels.get(pc) {
        None => -2,
        Some(LabelSlot::Defined(pos)) => {
            let section = &state.sections[pos.section() as usize];
            (section.base_offset + section.buffer[pos.index() as usize] as u32) as i64
        }
        Some(LabelSlot::Chain(_)) | Some(LabelSlot::Unused) => -1,
    }
}

/// `checkstep` (§4.7, gated by the `checked` feature): verifies local labels
/// `1..=9` are undefined and (optionally) that the active section matches
/// the host's expectation, at a `put`-sequence boundary.
#[cfg(feature = "checked")]
pub fn checkstep(state: &State, expect_section: Option<u32>) -> bool {
    for local in 1..crate::label::LOCAL_LABEL_COUNT {
        if !matches!(state.lg_labels.get(local), Some(LabelSlot::Unused) | None) {
            return false;
        }
    }
    match expect_section {
        Some(expected) => state.cur_section as u32 == expected,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{make, Action};
    use crate::emit::put;

    #[test]
    fn empty_run_yields_zero_codesize() {
        let mut state = State::init(1);
        state.setup();
        let size = link(&mut state).unwrap();
        assert_eq!(size, 0);
    }

    #[test]
    fn undef_pc_label_fails_link() {
        let mut state = State::init(1);
        state.setup();
        state.growpc(2);
        let actions = [make(Action::RelPc, 0x8000), make(Action::Stop, 0)];
        put(&mut state, &actions, 0, &[1]).unwrap();
        let err = link(&mut state).unwrap_err();
        assert_eq!(err.status().class(), StatusClass::UndefPc);
    }

    #[test]
    fn undef_local_label_fails_link() {
        let mut state = State::init(1);
        state.setup();
        let actions = [make(Action::RelLg, 3), make(Action::Stop, 0)];
        put(&mut state, &actions, 0, &[]).unwrap();
        let err = link(&mut state).unwrap_err();
        assert_eq!(err.status().class(), StatusClass::UndefLg);
    }

    #[test]
    fn undefined_global_label_collapses_instead_of_failing() {
        let mut state = State::init(1);
        state.setup_global(5);
        state.setup();
        let actions = [make(Action::RelLg, 12), make(Action::Stop, 0)];
        put(&mut state, &actions, 0, &[]).unwrap();
        link(&mut state).unwrap();
        match state.sections[0].kinds[0] {
            EntryKind::RelLgExternal(_, idx) => assert_eq!(idx, 12),
            other => panic!("expected RelLgExternal, got {:?}", other),
        }
    }

    #[test]
    fn align_shrinks_to_minimal_padding() {
        // S5: three literal words then ALIGN 16 must shrink to 4 bytes of padding.
        let mut state = State::init(1);
        state.setup();
        let actions = [
            0xF000_D000u32,
            0xF000_D000u32,
            0xF000_D000u32,
            make(Action::Align, 0x0F),
            0xF000_D000u32,
            make(Action::Stop, 0),
        ];
        put(&mut state, &actions, 0, &[]).unwrap();
        link(&mut state).unwrap();
        let align_idx = 3;
        assert_eq!(state.sections[0].buffer[align_idx], 4);
        assert_eq!(state.codesize, 20);
    }

    #[test]
    fn label_offset_is_corrected_after_preceding_align_shrinks() {
        let mut state = State::init(1);
        state.setup();
        let actions = [
            0xF000_D000u32,
            make(Action::Align, 0x0F),
            make(Action::LabelLg, 2),
            make(Action::Stop, 0),
        ];
        put(&mut state, &actions, 0, &[]).unwrap();
        // Pass-1 conservatively recorded offset 4 for the label (before the
        // ALIGN's raw payload count is added); link must correct it to 16.
        link(&mut state).unwrap();
        let label_idx = 2;
        assert_eq!(state.sections[0].buffer[label_idx], 16);
    }

    #[test]
    fn getpclabel_reports_defined_offset() {
        let mut state = State::init(1);
        state.setup();
        state.growpc(2);
        let actions = [0xF000_D000u32, make(Action::LabelPc, 0), make(Action::Stop, 0)];
        put(&mut state, &actions, 0, &[1]).unwrap();
        link(&mut state).unwrap();
        assert_eq!(getpclabel(&state, 1), 4);
    }

    #[test]
    fn getpclabel_reports_undefined_and_out_of_range() {
        let mut state = State::init(1);
        state.growpc(2);
        assert_eq!(getpclabel(&state, 0), -1);
        assert_eq!(getpclabel(&state, 99), -2);
    }
}
