//! End-to-end tests driving real J* source through the full lexer → parser → compiler → VM
//! pipeline via the public embedding API, rather than hand-built `Function`/`Ast` values.
//!
//! Top-level `return` is a parse error (there is no enclosing function at script scope), and
//! there is no stdlib `print`, so every program here binds its result to a top-level `var`
//! and the test reads it back with [`Vm::get_global`] once [`Vm::interpret_main`] succeeds —
//! the same global-binding path `compiler::declare_and_define` takes for any `depth == 0`
//! declaration.

use jstar::config::{ImportCallback, ImportResolution, NoImports};
use jstar::{Config, Value, Vm};

fn run(src: &str) -> (Vm, Result<Value, Value>) {
    run_with_imports(src, Box::new(NoImports))
}

fn run_with_imports(src: &str, imports: Box<dyn ImportCallback>) -> (Vm, Result<Value, Value>) {
    let mut vm = Vm::new(Config::new(), imports, Box::new(|_| {}));
    let ast = jstar::parser::Parser::new(src, "test.jsr").parse_program().expect("parses");
    let main = jstar::compiler::compile(&ast, vm.heap_mut(), "test.jsr", "main").expect("compiles");
    let result = vm.interpret_main(main);
    (vm, result)
}

fn global(vm: &mut Vm, name: &str) -> Value {
    let core = vm.core_module();
    vm.get_global(core, name).unwrap_or_else(|| panic!("no global '{name}'"))
}

#[test]
fn classes_inherit_fields_and_dispatch_through_super() {
    let (mut vm, result) = run(
        r#"
        class Shape
            construct(this, name)
                this.name = name
            end

            fun describe(this)
                return this.name
            end
        end

        class Square is Shape
            construct(this, side)
                super.construct("square")
                this.side = side
            end

            fun describe(this)
                return super.describe()
            end

            fun area(this)
                return this.side * this.side
            end
        end

        var sq = Square(4)
        var label = sq.describe()
        var area = sq.area()
        "#,
    );
    assert!(result.is_ok(), "program raised: {result:?}");
    assert_eq!(global(&mut vm, "area"), Value::Number(16.0));
    let label = global(&mut vm, "label");
    match label {
        Value::Obj(id) => assert_eq!(vm.heap().str_of(id), "square"),
        other => panic!("expected a string, got {other:?}"),
    }
}

#[test]
fn for_in_iterates_a_list_without_dunder_dispatch() {
    let (mut vm, result) = run(
        r#"
        var total = 0
        for x in [1, 2, 3, 4] do
            total = total + x
        end
        "#,
    );
    assert!(result.is_ok(), "program raised: {result:?}");
    assert_eq!(global(&mut vm, "total"), Value::Number(10.0));
}

#[test]
fn for_in_drives_a_user_iterator_through_iter_and_next() {
    let (mut vm, result) = run(
        r#"
        class Countdown
            construct(this, from)
                this.from = from
            end

            fun __iter__(this, prev)
                if prev == null
                    return this.from
                end
                if prev <= 0
                    return false
                end
                return prev - 1
            end

            fun __next__(this, state)
                return state
            end
        end

        var total = 0
        var steps = 0
        for n in Countdown(3) do
            total = total + n
            steps = steps + 1
        end
        "#,
    );
    assert!(result.is_ok(), "program raised: {result:?}");
    assert_eq!(global(&mut vm, "steps"), Value::Number(3.0));
    assert_eq!(global(&mut vm, "total"), Value::Number(6.0));
}

#[test]
fn try_except_matches_a_builtin_exception_type_and_ensure_always_runs() {
    let (mut vm, result) = run(
        r#"
        var ensure_ran = false
        var caught = ""
        try
            raise TypeError("bad value")
        except TypeError e
            caught = e.msg
        ensure
            ensure_ran = true
        end
        "#,
    );
    assert!(result.is_ok(), "program raised: {result:?}");
    assert_eq!(global(&mut vm, "ensure_ran"), Value::Bool(true));
    match global(&mut vm, "caught") {
        Value::Obj(id) => assert_eq!(vm.heap().str_of(id), "bad value"),
        other => panic!("expected a string, got {other:?}"),
    }
}

#[test]
fn uncaught_exception_propagates_out_of_interpret_main() {
    let (mut vm, result) = run(
        r#"
        raise TypeError("boom")
        "#,
    );
    let exc = result.expect_err("should have raised");
    assert_eq!(vm.describe(exc), "TypeError: boom");
}

#[test]
fn generator_yields_are_observed_through_for_in() {
    let (mut vm, result) = run(
        r#"
        fun count_to(n)
            var i = 1
            while i <= n do
                yield i
                i = i + 1
            end
        end

        var total = 0
        for v in count_to(3) do
            total = total + v
        end
        "#,
    );
    assert!(result.is_ok(), "program raised: {result:?}");
    assert_eq!(global(&mut vm, "total"), Value::Number(6.0));
}

#[test]
fn spread_call_arguments_flatten_into_positional_args() {
    let (mut vm, result) = run(
        r#"
        fun sum3(a, b, c)
            return a + b + c
        end
        var args = [1, 2, 3]
        var total = sum3(...args)
        "#,
    );
    assert!(result.is_ok(), "program raised: {result:?}");
    assert_eq!(global(&mut vm, "total"), Value::Number(6.0));
}

#[test]
fn unpack_assignment_destructures_a_tuple() {
    let (mut vm, result) = run(
        r#"
        var a = null
        var b = null
        var c = null
        a, b, c = (1, 2, 3)
        var total = a + b + c
        "#,
    );
    assert!(result.is_ok(), "program raised: {result:?}");
    assert_eq!(global(&mut vm, "total"), Value::Number(6.0));
}

/// A single-module, in-memory import resolver: no filesystem involvement, just enough to
/// exercise `IMPORT`'s compile-and-register path and cyclic-import registration order.
struct OneModule {
    path: &'static str,
    code: &'static str,
}

impl ImportCallback for OneModule {
    fn resolve(&mut self, _vm: &mut Vm, dotted_path: &str) -> ImportResolution {
        if dotted_path == self.path {
            ImportResolution::Source { code: self.code.to_owned(), path: format!("{dotted_path}.jsr") }
        } else {
            ImportResolution::NotFound
        }
    }
}

#[test]
fn import_resolves_through_the_host_callback_and_binds_a_module_global() {
    let resolver = OneModule { path: "mathutil", code: "fun double(x)\n  return x * 2\nend\n" };
    let (mut vm, result) = run_with_imports(
        r#"
        import mathutil
        var result = mathutil.double(21)
        "#,
        Box::new(resolver),
    );
    assert!(result.is_ok(), "program raised: {result:?}");
    assert_eq!(global(&mut vm, "result"), Value::Number(42.0));
}

#[test]
fn import_not_found_raises_instead_of_panicking() {
    let (mut vm, result) = run_with_imports(
        r#"
        import does_not_exist
        "#,
        Box::new(NoImports),
    );
    let exc = result.expect_err("should have raised");
    let msg = vm.describe(exc);
    assert!(msg.contains("ImportError"), "expected an ImportError, got: {msg}");
}

#[test]
fn bytecode_round_trips_through_a_real_compile() {
    let mut vm = Vm::new(Config::new(), Box::new(NoImports), Box::new(|_| {}));
    let ast = jstar::parser::Parser::new("fun add(a, b)\n  return a + b\nend\n", "math.jsr")
        .parse_program()
        .expect("parses");
    let function = jstar::compiler::compile(&ast, vm.heap_mut(), "math.jsr", "main").expect("compiles");

    let bytes = jstar::serialize::serialize(&function, vm.heap());
    let restored = jstar::serialize::deserialize(&bytes, vm.heap_mut()).expect("deserializes");

    let result = vm.interpret_main(restored);
    assert!(result.is_ok(), "program raised: {result:?}");
    let core = vm.core_module();
    let add = vm.get_global(core, "add").expect("add is a global");
    let sum = vm.call_value(add, &[Value::Number(3.0), Value::Number(4.0)]).expect("call succeeds");
    assert_eq!(sum, Value::Number(7.0));
}
