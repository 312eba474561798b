use moonlet::{CompileError, RuntimeError, Value, Vm, compile};

fn run(source: &str) -> (Vec<Value>, String) {
    let program = compile(source).unwrap_or_else(|e| panic!("compile failed: {e}\n{source}"));
    let mut vm = Vm::with_output(Vec::new());
    let results = vm.execute(&program).unwrap_or_else(|e| panic!("execute failed: {e}\n{source}"));
    (results, String::from_utf8(vm.into_output()).unwrap())
}

fn output(source: &str) -> String {
    run(source).1
}

fn returns(source: &str) -> Vec<Value> {
    run(source).0
}

#[test]
fn compilation_is_deterministic() {
    let src = "local t = 0 for i = 1, 10 do if i % 3 == 0 then continue end t = t + i end print(t, 'done')";
    assert_eq!(compile(src).unwrap(), compile(src).unwrap());
}

#[test]
fn repeated_literal_has_one_pool_entry() {
    let program = compile("a = 'shared literal text' b = 'shared literal text'").unwrap();
    let matches = program.constants.iter().filter(|c| **c == Value::from("shared literal text")).count();
    assert_eq!(matches, 1);
}

#[test]
fn precedence_and_associativity() {
    assert_eq!(returns("return 1 + 2 * 3"), vec![Value::Integer(7)]);
    assert_eq!(returns("return 2 ^ 3 ^ 2"), vec![Value::Float(512.0)]);
    assert_eq!(returns("return -2 ^ 2"), vec![Value::Float(-4.0)]);
    assert_eq!(returns("local x = 2 return -x ^ 2"), vec![Value::Float(-4.0)]);
    assert_eq!(returns("local a = 'a' return a .. 'b' .. 'c'"), vec![Value::from("abc")]);
    assert_eq!(returns("local x = 5 return 1 < x and x < 10"), vec![Value::Boolean(true)]);
    assert_eq!(returns("return 1 | 2 ~ 3 & 4 << 1"), vec![Value::Integer(3)]);
}

#[test]
fn block_locals_go_out_of_scope() {
    // After the block `x` is a global again, which is nil.
    assert_eq!(output("do local x = 1 end print(x)"), "nil\n");
    assert_eq!(output("local x = 1 do local x = 2 print(x) end print(x)"), "2\n1\n");
    assert_eq!(output("local x = 1 local x = x + 1 print(x)"), "2\n");
}

#[test]
fn while_with_break_prints_five() {
    assert_eq!(output("i=0; while true do i=i+1; if i==5 then break end end; print(i)"), "5\n");
}

#[test]
fn continue_may_not_skip_a_declaration_the_condition_sees() {
    let err = compile("local i = 0 repeat i = i + 1 continue local done = i > 3 until done").unwrap_err();
    assert!(matches!(err, CompileError::ContinueIntoScope { ref name, .. } if name == "done"), "{err}");

    let src = "local i = 0 repeat local done = i > 3 i = i + 1 if i < 2 then continue end print(i) until done";
    assert_eq!(output(src), "2\n3\n4\n5\n");
}

#[test]
fn numeric_subtypes() {
    assert_eq!(returns("local one = 1 return one + 1.0"), vec![Value::Float(2.0)]);
    assert!(matches!(returns("local one = 1 return one + 1.0")[0], Value::Float(_)));
    assert!(matches!(returns("local five = 5 return five / 2")[0], Value::Float(f) if f == 2.5));
    assert_eq!(returns("local one = 1 return one == 1.0"), vec![Value::Boolean(true)]);
    assert_eq!(output("print(1 + 1.0, 5 / 2, 1 == 1.0, 10 // 3, 7 % -3)"), "2.0\t2.5\ttrue\t3\t-2\n");
}

#[test]
fn long_strings_keep_value_semantics() {
    let src = "
        local a = 'a string that is too long to be stored inline'
        local b = a
        b = 'another string, also too long to be stored inline'
        return a, b
    ";
    let results = returns(src);
    assert_eq!(results[0], Value::from("a string that is too long to be stored inline"));
    assert_eq!(results[1], Value::from("another string, also too long to be stored inline"));
}

#[test]
fn multiple_assignment_swaps() {
    assert_eq!(output("local a, b = 1, 2 a, b = b, a print(a, b)"), "2\t1\n");
    assert_eq!(output("x, y = 'x', 'y' x, y = y, x print(x, y)"), "y\tx\n");
    assert_eq!(output("local a, b, c = 1 print(a, b, c)"), "1\tnil\tnil\n");
}

#[test]
fn if_elseif_else_chain() {
    let src = "
        for i = 1, 4 do
            if i == 1 then print('one')
            elseif i == 2 then print('two')
            elseif i == 3 then print('three')
            else print('many') end
        end
    ";
    assert_eq!(output(src), "one\ntwo\nthree\nmany\n");
}

#[test]
fn nested_loops_break_only_the_innermost() {
    let src = "
        for i = 1, 3 do
            local j = 0
            while true do
                j = j + 1
                if j > i then break end
            end
            print(i, j)
        end
    ";
    assert_eq!(output(src), "1\t2\n2\t3\n3\t4\n");
}

#[test]
fn string_call_syntax_and_escapes() {
    assert_eq!(output(r#"print "tab\there""#), "tab\there\n");
    assert_eq!(output(r"print('\65\x42\u{43}')"), "ABC\n");
}

#[test]
fn runtime_errors_abort_execution() {
    let program = compile("print('start') local x = nil + 1 print('unreachable')").unwrap();
    let mut vm = Vm::with_output(Vec::new());
    let err = vm.execute(&program).unwrap_err();
    assert!(matches!(err, RuntimeError::Arithmetic { ty: "nil" }), "{err}");
    assert_eq!(String::from_utf8_lossy(vm.output()), "start\n");
}

#[test]
fn host_functions_can_be_registered() {
    fn add(w: &mut moonlet::ArgWindow<'_>) -> Result<usize, RuntimeError> {
        w.check_arity("add", 2)?;
        let sum = match (w.arg(0), w.arg(1)) {
            (Some(Value::Integer(a)), Some(Value::Integer(b))) => Value::Integer(a + b),
            _ => Value::Nil,
        };
        w.set_result(0, sum);
        Ok(1)
    }

    let mut vm = Vm::with_output(Vec::new());
    vm.register("add", add);
    let program = compile("print(add(2, 3), add(add(1, 1), 1))").unwrap();
    vm.execute(&program).unwrap();
    assert_eq!(String::from_utf8_lossy(vm.output()), "5\t3\n");

    let program = compile("add(1, 2, 3)").unwrap();
    let err = vm.execute(&program).unwrap_err();
    assert_eq!(err.to_string(), "wrong number of arguments to 'add' (expected 2, got 3)");
}
