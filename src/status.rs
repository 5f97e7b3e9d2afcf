//! The packed `Status` integer (class + offending action index) and the ambient
//! `EngineError` wrapper around it (see `SPEC_FULL.md` §1.1, §6, §7).

use std::fmt;

const CLASS_SHIFT: u32 = 24;
const INDEX_MASK: u32 = 0x00FF_FFFF;

/// The class of a non-OK `Status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Ok,
    NoMem,
    Phase,
    Match,
    RangeI,
    RangeSec,
    RangeLg,
    RangePc,
    RangeRel,
    UndefLg,
    UndefPc,
}

impl StatusClass {
    fn code(self) -> u32 {
        match self {
            StatusClass::Ok => 0,
            StatusClass::NoMem => 1,
            StatusClass::Phase => 2,
            StatusClass::Match => 3,
            StatusClass::RangeI => 4,
            StatusClass::RangeSec => 5,
            StatusClass::RangeLg => 6,
            StatusClass::RangePc => 7,
            StatusClass::RangeRel => 8,
            StatusClass::UndefLg => 9,
            StatusClass::UndefPc => 10,
        }
    }

    fn from_code(code: u32) -> StatusClass {
        match code {
            0 => StatusClass::Ok,
            1 => StatusClass::NoMem,
            2 => StatusClass::Phase,
            3 => StatusClass::Match,
            4 => StatusClass::RangeI,
            5 => StatusClass::RangeSec,
            6 => StatusClass::RangeLg,
            7 => StatusClass::RangePc,
            8 => StatusClass::RangeRel,
            9 => StatusClass::UndefLg,
            10 => StatusClass::UndefPc,
            _ => StatusClass::Phase,
        }
    }
}

/// A single 32-bit integer packing an error class in the high bits and the
/// offending action-list index in the low 24 bits. `Status::OK` is all-zero.
///
/// This is the wire-level contract described in §6: hosts that only want the
/// packed representation (for logging alongside a C-ported caller, say) can
/// read `.raw()` directly without ever touching `EngineError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Status(u32);

impl Status {
    pub const OK: Status = Status(0);

    pub fn new(class: StatusClass, index: u32) -> Status {
        Status((class.code() << CLASS_SHIFT) | (index & INDEX_MASK))
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn class(self) -> StatusClass {
        StatusClass::from_code(self.0 >> CLASS_SHIFT)
    }

    pub fn index(self) -> u32 {
        self.0 & INDEX_MASK
    }

    pub fn is_ok(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}|{}", self.class(), self.index())
    }
}

/// Ambient `std::error::Error` wrapper over `Status` (§1.1). Every variant
/// carries the underlying packed `Status` so nothing from the base wire
/// contract is lost by going through this friendlier type.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum EngineError {
    #[error("immediate out of range for action #{index}")]
    RangeImmediate { index: u32, status: Status },
    #[error("section index out of range for action #{index}")]
    RangeSection { index: u32, status: Status },
    #[error("local/global label index out of range for action #{index}")]
    RangeLocalGlobal { index: u32, status: Status },
    #[error("pc label index out of range for action #{index}")]
    RangePc { index: u32, status: Status },
    #[error("branch or load displacement out of reach for action #{index}")]
    RangeDisplacement { index: u32, status: Status },
    #[error("local/global label never defined (action #{index})")]
    UndefinedLocalGlobal { index: u32, status: Status },
    #[error("pc label never defined (action #{index})")]
    UndefinedPc { index: u32, status: Status },
    #[error("internal phase error at action #{index}: link-computed size disagreed with the encoded size")]
    Phase { index: u32, status: Status },
    #[error("action stream and buffer positions disagreed at action #{index}")]
    Match { index: u32, status: Status },
    #[error("out of memory growing a section or label table")]
    OutOfMemory,
}

impl EngineError {
    /// Reconstructs an `EngineError` from a non-OK `Status`.
    pub fn from_status(status: Status) -> Option<EngineError> {
        let index = status.index();
        Some(match status.class() {
            StatusClass::Ok => return None,
            StatusClass::NoMem => EngineError::OutOfMemory,
            StatusClass::Phase => EngineError::Phase { index, status },
            StatusClass::Match => EngineError::Match { index, status },
            StatusClass::RangeI => EngineError::RangeImmediate { index, status },
            StatusClass::RangeSec => EngineError::RangeSection { index, status },
            StatusClass::RangeLg => EngineError::RangeLocalGlobal { index, status },
            StatusClass::RangePc => EngineError::RangePc { index, status },
            StatusClass::RangeRel => EngineError::RangeDisplacement { index, status },
            StatusClass::UndefLg => EngineError::UndefinedLocalGlobal { index, status },
            StatusClass::UndefPc => EngineError::UndefinedPc { index, status },
        })
    }

    pub fn status(&self) -> Status {
        match *self {
            EngineError::RangeImmediate { status, .. }
            | EngineError::RangeSection { status, .. }
            | EngineError::RangeLocalGlobal { status, .. }
            | EngineError::RangePc { status, .. }
            | EngineError::RangeDisplacement { status, .. }
            | EngineError::UndefinedLocalGlobal { status, .. }
            | EngineError::UndefinedPc { status, .. }
            | EngineError::Phase { status, .. }
            | EngineError::Match { status, .. } => status,
            EngineError::OutOfMemory => Status::new(StatusClass::NoMem, 0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrips_class_and_index() {
        let s = Status::new(StatusClass::RangeI, 42);
        assert_eq!(s.class(), StatusClass::RangeI);
        assert_eq!(s.index(), 42);
        assert!(!s.is_ok());
    }

    #[test]
    fn ok_status_is_zero() {
        assert_eq!(Status::OK.raw(), 0);
        assert!(Status::OK.is_ok());
    }

    #[test]
    fn error_from_status_preserves_index() {
        let s = Status::new(StatusClass::UndefPc, 7);
        let err = EngineError::from_status(s).unwrap();
        match err {
            EngineError::UndefinedPc { index, .. } => assert_eq!(index, 7),
            other => panic!("wrong variant: {:?}", other),
        }
    }
}
