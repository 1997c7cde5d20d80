// ABOUTME: Integration tests asserting on the text of generated host source

use lilt::codegen::generate_unit;
use lilt::{Interp, LispError};

fn gen(src: &str) -> String {
    let mut interp = Interp::new();
    generate_unit(&mut interp, src, Some("prog.lisp"), "Prog")
        .unwrap_or_else(|e| panic!("codegen of {:?} failed: {}", src, e))
}

const STAK: &str = "(defun stak (x y z)
                      (if (not (< y x))
                          z
                          (stak (stak (1- x) y z)
                                (stak (1- y) z x)
                                (stak (1- z) x y))))
                    (write (stak 18 12 6))";

#[test]
fn test_unit_shape() {
    let out = gen(STAK);
    assert!(out.contains("pub struct Prog"));
    assert!(out.contains("pub fn new() -> LispResult<Prog>"));
    assert!(out.contains("pub fn body(&mut self) -> LispResult<Value>"));
    assert!(out.contains("pub fn get_value(&mut self, name: &str)"));
    assert!(out.contains("pub fn get_function(&mut self, name: &str)"));
    assert!(out.contains("set_command_line_args"));
    assert!(out.contains("fn main()"));
}

#[test]
fn test_stak_compiles_with_tail_and_funcall_shapes() {
    let out = gen(STAK);
    // the outer self-call is in tail position of the taken if branch
    assert!(out.contains("tailcall(__f"));
    // the inner calls are argument positions and stay synchronous
    assert!(out.contains("funcall(rt, __f"));
    // the mangled recursion target reads through the global slot
    assert!(out.contains("global(rt, \"stak\")?"));
}

#[test]
fn test_generation_is_deterministic() {
    assert_eq!(gen(STAK), gen(STAK));
}

#[test]
fn test_constant_pool_shared_across_globals_and_body() {
    let src = "(define a '(shared list))
               (write '(shared list))
               (write '(other))";
    let out = gen(src);
    assert_eq!(out.matches("// q0: (shared list)").count(), 1);
    assert_eq!(out.matches("qref(rt, 0)").count(), 2);
    assert!(out.contains("// q1: (other)"));
}

#[test]
fn test_string_and_char_literals() {
    let out = gen("(write \"he\\\"llo\") (write #\\a)");
    assert!(out.contains("string(rt, \"he\\\"llo\")"));
    assert!(out.contains("Value::Char('a')"));
}

#[test]
fn test_doubles_keep_their_point() {
    let out = gen("(write 126.0)");
    assert!(out.contains("Value::Double(126.0f64)"));
}

#[test]
fn test_named_let_lowering() {
    let out = gen(
        "(write (let loop ((n 10) (acc 0))
                  (if (= n 0) acc (loop (1- n) (1+ acc)))))",
    );
    // the synthesized local function lives in a cell and tail-calls itself
    assert!(out.contains("_loop_"));
    assert!(out.contains("let __f = _loop_"));
    assert!(out.contains("tailcall(__f"));
}

#[test]
fn test_let_star_sees_earlier_bindings() {
    let out = gen("(write (let* ((x 1) (y (1+ x))) y))");
    // y's initializer reads x's cell rather than a global
    assert!(out.contains("let __a0 = _x_"));
    assert!(out.contains("inc1(&__a0)"));
}

#[test]
fn test_lambda_in_argument_position_clones_captures() {
    let out = gen("(write (let ((n 1)) (list (lambda (x) (cons x n)) n)))");
    assert!(out.contains(".clone(); make_fun(move |rt: &mut Rt, args: &[Value]|"));
}

#[test]
fn test_quote_idempotence_against_interpreter() {
    // both pipelines read the same expanded backquote, so the generated
    // constant matches what the interpreter evaluates
    let mut interp = Interp::new();
    let value = interp.interpret_expression("`(a ,@'(1 2) b)").unwrap();
    assert_eq!(lilt::value::print_value(&value, true), "(a 1 2 b)");

    let out = gen("(write `(a ,@'(1 2) b))");
    // the constant pool holds the quoted pieces of the expansion
    assert!(out.contains(": a\n"));
    assert!(out.contains(": (1 2)"));
    assert!(out.contains(": (b)"));
}

#[test]
fn test_errors_fail_generation_not_runtime() {
    let cases: &[(&str, fn(&LispError) -> bool)] = &[
        ("(undefined-fn 1)", |e| {
            e.to_string().contains("undefined-fn")
        }),
        ("(define x 1) (define x 2)", |e| {
            e.to_string().contains("duplicate")
        }),
        ("(write (car 1 2))", |e| matches!(e, LispError::Arity { .. })),
        ("(write (1+ \"one\"))", |e| matches!(e, LispError::Type { .. })),
        ("(lambda (t) t)", |e| e.to_string().contains("reserved")),
        ("(defun f () (provide \"m\"))", |e| {
            e.to_string().contains("top-level")
        }),
    ];
    for (src, check) in cases {
        let mut interp = Interp::new();
        let e = generate_unit(&mut interp, src, None, "Prog").unwrap_err();
        assert!(check(&e), "{:?} gave unexpected error {:?}", src, e);
    }
}

#[test]
fn test_macros_shared_between_passes() {
    // the macro is registered with the in-process evaluator in pass 1 and
    // expanded during pass 2, including inside later loaded bodies
    let out = gen("(defmacro twice (x) `(+ ,x ,x))
                   (defun f (n) (twice n))
                   (write (f 3))");
    assert!(out.contains("num(&"), "macro did not expand:\n{}", out);
    assert!(!out.contains("\"twice\""));
}

#[test]
fn test_load_inlines_at_top_level() {
    let dir = tempfile::tempdir().unwrap();
    let lib = dir.path().join("lib.lisp");
    std::fs::write(&lib, "(define from-lib 7)").unwrap();
    let main = dir.path().join("main.lisp");
    std::fs::write(&main, "(load \"lib\") (write from-lib)").unwrap();

    let mut interp = Interp::new();
    let source = std::fs::read_to_string(&main).unwrap();
    interp.libdir = Some(dir.path().to_path_buf());
    let out = generate_unit(
        &mut interp,
        &source,
        Some(&main.display().to_string()),
        "Prog",
    )
    .unwrap();
    assert!(out.contains("define_global(rt, \"from-lib\""));
}

#[test]
fn test_speed_levels_gate_inlining() {
    let fast = gen("(write (+ 1 2))");
    assert!(fast.contains("num(&"));

    let slow = gen("(declaim (optimize (speed 0))) (write (+ 1 2))");
    assert!(!slow.contains("num(&"));
    assert!(slow.contains("global(rt, \"+\")?"));
}
