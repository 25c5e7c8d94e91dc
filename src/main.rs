mod breakpoint;
mod debugger;
mod debugger_command;
mod dwarf_data;
mod gimli_wrapper;
mod inferior;
mod ptrace;
mod registers;

use crate::debugger::Debugger;

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("Program name not specified");
        std::process::exit(-1);
    }
    let target = &args[1];

    Debugger::new(target, &args[2..]).run();
}
