use std::process::Command;

#[test]
fn requires_a_program_name() {
    let output = Command::new(env!("CARGO_BIN_EXE_minidbg"))
        .output()
        .expect("failed to run minidbg");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Program name not specified"));
}

#[test]
fn reports_an_unopenable_target() {
    let output = Command::new(env!("CARGO_BIN_EXE_minidbg"))
        .arg("/no/such/binary/anywhere")
        .output()
        .expect("failed to run minidbg");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Could not open file"));
}
