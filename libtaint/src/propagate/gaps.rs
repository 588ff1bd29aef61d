//! # gaps
//! Instructions the rule engine cannot classify are coverage gaps. Each
//! distinct opcode is reported once, however often it is encountered.
//!
//! Instructions of a known opcode whose operands do not fit its rule point at
//! the decoder rather than at the rule table, they are kept apart from the
//! gaps and reported once per opcode as well.
use hashbrown::HashSet;
use log::warn;
use spin::Mutex;

use crate::{GuestAddr, instr::Opcode, propagate::PropagationError};

#[derive(Debug, Default)]
pub struct GapReporter {
    unhandled: Mutex<HashSet<Opcode>>,
    malformed: Mutex<HashSet<Opcode>>,
}

impl GapReporter {
    /// Record a classification failure at `pc`, returns `true` the first time
    /// its opcode is reported for this kind of failure
    pub fn report(&self, pc: GuestAddr, err: &PropagationError) -> bool {
        match err {
            PropagationError::Unhandled(opcode) => {
                let first = self.unhandled.lock().insert(*opcode);
                if first {
                    warn!("coverage gap - {err} (first seen at {pc:#x})");
                }
                first
            }
            PropagationError::Malformed { opcode, .. } => {
                let first = self.malformed.lock().insert(*opcode);
                if first {
                    warn!("malformed instruction - {err}");
                }
                first
            }
        }
    }

    /// The opcodes without a rule reported so far, in no particular order
    #[must_use]
    pub fn seen(&self) -> Vec<Opcode> {
        self.unhandled.lock().iter().copied().collect()
    }

    /// The opcodes seen with operands their rule does not accept
    #[must_use]
    pub fn malformed(&self) -> Vec<Opcode> {
        self.malformed.lock().iter().copied().collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.unhandled.lock().is_empty() && self.malformed.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reported_once() {
        let gaps = GapReporter::default();
        let err = PropagationError::Unhandled(Opcode::Tbh);
        assert!(gaps.is_empty());
        assert!(gaps.report(0x1000, &err));
        assert!(!gaps.report(0x2000, &err));
        assert_eq!(gaps.seen(), vec![Opcode::Tbh]);
        assert!(gaps.malformed().is_empty());
    }

    #[test]
    fn test_malformed_is_not_a_gap() {
        let gaps = GapReporter::default();
        let err = PropagationError::Malformed {
            opcode: Opcode::Ldr,
            pc: 0x1000,
        };
        assert!(gaps.report(0x1000, &err));
        assert!(!gaps.report(0x1000, &err));
        assert!(gaps.seen().is_empty());
        assert_eq!(gaps.malformed(), vec![Opcode::Ldr]);
        assert!(!gaps.is_empty());
    }
}
