pub enum RegisterAction {
    Dump,
    Read(String),
    Write(String, String),
}

pub enum MemoryAction {
    Read(String),
    Write(String, String),
}

pub enum DebuggerCommand {
    Continue,
    Break(String),
    Register(RegisterAction),
    Memory(MemoryAction),
    Step,
    StepInstruction,
    Next,
    Finish,
    Symbol(String),
    Backtrace,
    Quit,
}

fn is_prefix(token: &str, of: &str) -> bool {
    !token.is_empty() && of.starts_with(token)
}

impl DebuggerCommand {
    /// Match the first token by prefix against the command vocabulary, so
    /// `c` means continue and `b` means break. `step` is tested before
    /// `stepi`: any prefix of "step" steps a source line, and only the full
    /// word `stepi` steps one instruction.
    pub fn from_tokens(tokens: &[&str]) -> Option<DebuggerCommand> {
        let command = *tokens.first()?;
        if is_prefix(command, "continue") {
            Some(DebuggerCommand::Continue)
        } else if is_prefix(command, "break") {
            Some(DebuggerCommand::Break(tokens.get(1)?.to_string()))
        } else if is_prefix(command, "register") {
            let action = *tokens.get(1)?;
            if is_prefix(action, "dump") {
                Some(DebuggerCommand::Register(RegisterAction::Dump))
            } else if is_prefix(action, "read") {
                Some(DebuggerCommand::Register(RegisterAction::Read(
                    tokens.get(2)?.to_string(),
                )))
            } else if is_prefix(action, "write") {
                Some(DebuggerCommand::Register(RegisterAction::Write(
                    tokens.get(2)?.to_string(),
                    tokens.get(3)?.to_string(),
                )))
            } else {
                None
            }
        } else if is_prefix(command, "memory") {
            let action = *tokens.get(1)?;
            if is_prefix(action, "read") {
                Some(DebuggerCommand::Memory(MemoryAction::Read(
                    tokens.get(2)?.to_string(),
                )))
            } else if is_prefix(action, "write") {
                Some(DebuggerCommand::Memory(MemoryAction::Write(
                    tokens.get(2)?.to_string(),
                    tokens.get(3)?.to_string(),
                )))
            } else {
                None
            }
        } else if is_prefix(command, "step") {
            Some(DebuggerCommand::Step)
        } else if is_prefix(command, "stepi") {
            Some(DebuggerCommand::StepInstruction)
        } else if is_prefix(command, "next") {
            Some(DebuggerCommand::Next)
        } else if is_prefix(command, "finish") {
            Some(DebuggerCommand::Finish)
        } else if is_prefix(command, "symbol") {
            Some(DebuggerCommand::Symbol(tokens.get(1)?.to_string()))
        } else if is_prefix(command, "backtrace") {
            Some(DebuggerCommand::Backtrace)
        } else if is_prefix(command, "quit") {
            Some(DebuggerCommand::Quit)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_letters_resolve_by_prefix() {
        assert!(matches!(
            DebuggerCommand::from_tokens(&["c"]),
            Some(DebuggerCommand::Continue)
        ));
        assert!(matches!(
            DebuggerCommand::from_tokens(&["n"]),
            Some(DebuggerCommand::Next)
        ));
        assert!(matches!(
            DebuggerCommand::from_tokens(&["f"]),
            Some(DebuggerCommand::Finish)
        ));
        assert!(matches!(
            DebuggerCommand::from_tokens(&["q"]),
            Some(DebuggerCommand::Quit)
        ));
        assert!(matches!(
            DebuggerCommand::from_tokens(&["ba"]),
            Some(DebuggerCommand::Backtrace)
        ));
    }

    #[test]
    fn step_and_stepi_are_both_reachable() {
        assert!(matches!(
            DebuggerCommand::from_tokens(&["s"]),
            Some(DebuggerCommand::Step)
        ));
        assert!(matches!(
            DebuggerCommand::from_tokens(&["step"]),
            Some(DebuggerCommand::Step)
        ));
        assert!(matches!(
            DebuggerCommand::from_tokens(&["stepi"]),
            Some(DebuggerCommand::StepInstruction)
        ));
        assert!(matches!(
            DebuggerCommand::from_tokens(&["sy", "main"]),
            Some(DebuggerCommand::Symbol(_))
        ));
    }

    #[test]
    fn break_takes_its_argument() {
        match DebuggerCommand::from_tokens(&["b", "hello.cpp:14"]) {
            Some(DebuggerCommand::Break(target)) => assert_eq!(target, "hello.cpp:14"),
            _ => panic!("expected a break command"),
        }
        assert!(DebuggerCommand::from_tokens(&["b"]).is_none());
    }

    #[test]
    fn register_and_memory_subcommands_parse() {
        assert!(matches!(
            DebuggerCommand::from_tokens(&["register", "dump"]),
            Some(DebuggerCommand::Register(RegisterAction::Dump))
        ));
        assert!(matches!(
            DebuggerCommand::from_tokens(&["reg", "d"]),
            Some(DebuggerCommand::Register(RegisterAction::Dump))
        ));
        match DebuggerCommand::from_tokens(&["register", "write", "rax", "0xdeadbeef"]) {
            Some(DebuggerCommand::Register(RegisterAction::Write(reg, val))) => {
                assert_eq!(reg, "rax");
                assert_eq!(val, "0xdeadbeef");
            }
            _ => panic!("expected a register write"),
        }
        match DebuggerCommand::from_tokens(&["mem", "r", "0x401000"]) {
            Some(DebuggerCommand::Memory(MemoryAction::Read(addr))) => {
                assert_eq!(addr, "0x401000")
            }
            _ => panic!("expected a memory read"),
        }
        assert!(DebuggerCommand::from_tokens(&["memory", "write", "0x1"]).is_none());
    }

    #[test]
    fn unknown_or_empty_input_is_rejected() {
        assert!(DebuggerCommand::from_tokens(&[]).is_none());
        assert!(DebuggerCommand::from_tokens(&["frobnicate"]).is_none());
        assert!(DebuggerCommand::from_tokens(&["register", "frob"]).is_none());
    }
}
