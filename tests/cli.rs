use std::io::Write;
use std::process::{Command, Output};

fn moonlet() -> Command {
    Command::new(env!("CARGO_BIN_EXE_moonlet"))
}

fn run(args: &[&str]) -> Output {
    moonlet().args(args).output().expect("failed to run moonlet")
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).into_owned()
}

fn stderr(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).into_owned()
}

// --- Running code ---

#[test]
fn eval_prints_result() {
    let out = run(&["-e", "print(1 + 2 * 3)"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out), "7\n");
}

#[test]
fn eval_break_out_of_while() {
    let out = run(&["--eval", "i=0; while true do i=i+1; if i==5 then break end end; print(i)"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out), "5\n");
}

#[test]
fn runs_a_script_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "-- sum of the first ten squares").unwrap();
    writeln!(file, "local sum = 0").unwrap();
    writeln!(file, "for i = 1, 10 do sum = sum + i * i end").unwrap();
    writeln!(file, "print('sum', sum)").unwrap();
    let out = run(&[file.path().to_str().unwrap()]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out), "sum\t385\n");
}

#[test]
fn missing_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nope.lua");
    let out = run(&["--no-color", path.to_str().unwrap()]);
    assert_eq!(out.status.code(), Some(1));
    assert!(stderr(&out).contains("io error: cannot read"), "stderr: {}", stderr(&out));
}

#[test]
fn file_and_eval_conflict() {
    let out = run(&["script.lua", "-e", "print(1)"]);
    assert!(!out.status.success());
}

// --- Program output ---

#[test]
fn dump_lists_the_program() {
    let out = run(&["--dump", "-e", "local x = 'hello' print(x)"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    let text = stdout(&out);
    assert!(text.contains("K0\t\"hello\""), "{text}");
    assert!(text.contains("Call(1, 1, 0)"), "{text}");
    assert!(text.contains("Return(0, 0)"), "{text}");
    assert!(!text.contains("\nhello\n"), "dump must not run the program: {text}");
}

#[test]
fn emit_json_serializes_the_program() {
    let out = run(&["--emit", "json", "-e", "local a = 2.5"]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    let v: serde_json::Value = serde_json::from_str(&stdout(&out)).expect("valid JSON");
    assert_eq!(v["constants"][0], 2.5);
    assert_eq!(v["byte_codes"][0]["LoadConst"][0], 0);
    assert_eq!(v["max_slots"], 1);
}

// --- Errors ---

#[test]
fn compile_error_shows_source_location() {
    let out = run(&["--no-color", "-e", "local x = 1\nwhile x do\n  x = = 2\nend"]);
    assert_eq!(out.status.code(), Some(1));
    let err = stderr(&out);
    assert!(err.contains("syntax error: expression expected near '='"), "{err}");
    assert!(err.contains("--> 3:7"), "{err}");
    assert!(err.contains("x = = 2"), "{err}");
    assert!(stdout(&out).is_empty());
}

#[test]
fn unclosed_block_points_at_the_opener() {
    let out = run(&["--no-color", "-e", "print(1)\nwhile true do"]);
    assert_eq!(out.status.code(), Some(1));
    let err = stderr(&out);
    assert!(err.contains("'end' expected to close 'while'"), "{err}");
    assert!(err.contains("--> 2:1"), "{err}");
}

#[test]
fn runtime_error_stops_execution() {
    let out = run(&["--no-color", "-e", "print('before') local s = 'x' .. true print('after')"]);
    assert_eq!(out.status.code(), Some(1));
    assert_eq!(stdout(&out), "before\n");
    assert!(stderr(&out).contains("runtime error: attempt to concatenate a boolean value"), "{}", stderr(&out));
}

#[test]
fn json_diagnostics() {
    let out = run(&["--json", "-e", "break"]);
    assert_eq!(out.status.code(), Some(1));
    let v: serde_json::Value = serde_json::from_str(stderr(&out).trim()).expect("valid JSON");
    assert_eq!(v["phase"], "compile");
    assert_eq!(v["message"], "break outside a loop");
    assert_eq!(v["span"]["line"], 1);
    assert_eq!(v["span"]["col"], 1);
}

#[test]
fn no_color_output_has_no_escape_codes() {
    let out = run(&["--no-color", "-e", "x = 1 +"]);
    assert!(!stderr(&out).contains("\x1b["));
}
