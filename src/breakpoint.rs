//! Software breakpoints: one byte of tracee code displaced by int3.

use nix::unistd::Pid;

use crate::ptrace;

// x86 int $3
// https://www.felixcloutier.com/x86/intn:into:int3:int1
const INT3: u8 = 0xcc;

/// Replace the low byte of `word`, returning the patched word and the byte
/// that was displaced.
fn splice_low_byte(word: u64, byte: u8) -> (u64, u8) {
    let displaced = (word & 0xff) as u8;
    ((word & !0xffu64) | byte as u64, displaced)
}

pub struct Breakpoint {
    pid: Pid,
    addr: u64,
    saved_byte: Option<u8>,
}

impl Breakpoint {
    pub fn new(pid: Pid, addr: u64) -> Self {
        Breakpoint {
            pid,
            addr,
            saved_byte: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.saved_byte.is_some()
    }

    /// Write the trap byte, caching the displaced byte. Idempotent. If the
    /// word at the address reads as zero the address is not mapped code and
    /// the breakpoint is left disabled.
    pub fn enable(&mut self) {
        if self.is_enabled() {
            return;
        }
        let word = ptrace::read_word(self.pid, self.addr);
        if word == 0 {
            return;
        }
        let (patched, displaced) = splice_low_byte(word, INT3);
        ptrace::write_word(self.pid, self.addr, patched);
        self.saved_byte = Some(displaced);
    }

    /// Restore the displaced byte. Idempotent.
    pub fn disable(&mut self) {
        let saved = match self.saved_byte.take() {
            Some(byte) => byte,
            None => return,
        };
        let word = ptrace::read_word(self.pid, self.addr);
        let (restored, _) = splice_low_byte(word, saved);
        ptrace::write_word(self.pid, self.addr, restored);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splice_replaces_only_the_low_byte() {
        let (patched, displaced) = splice_low_byte(0x1122_3344_5566_7788, INT3);
        assert_eq!(displaced, 0x88);
        assert_eq!(patched, 0x1122_3344_5566_77cc);
    }

    #[test]
    fn splice_round_trips() {
        let word = 0x0102_0304_0506_0708u64;
        let (patched, displaced) = splice_low_byte(word, INT3);
        let (restored, trap) = splice_low_byte(patched, displaced);
        assert_eq!(trap, INT3);
        assert_eq!(restored, word);
    }

    #[test]
    fn splice_preserves_the_upper_seven_bytes() {
        for byte in [0x00u8, 0x55, INT3, 0xff] {
            let word = 0xfedc_ba98_7654_3210u64;
            let (patched, _) = splice_low_byte(word, byte);
            assert_eq!(patched & !0xff, word & !0xff);
            assert_eq!(patched & 0xff, byte as u64);
        }
    }
}
