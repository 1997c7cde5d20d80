// ABOUTME: The evaluator: special forms, tail-call loop, macros, dynamic bindings

use crate::builtins;
use crate::env::Env;
use crate::error::{LispError, LispResult};
use crate::interp::Interp;
use crate::symbol::Symbol;
use crate::value::{
    cons, list_elements, list_from, list_parts, print_value, ArraySlice, Step, Value,
};
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// Outcome of special-form dispatch.
enum Special {
    /// The operator is not a special form; take the application path.
    NotSpecial,
    /// The form's value is complete.
    Value(Value),
    /// Continue the evaluation loop with a new form (tail position).
    Tail { form: Value, env: Env },
}

/// Outcome of one application step.
pub(crate) enum AppResult {
    Done(Value),
    /// A closure body to evaluate in its argument environment.
    Enter { body: Value, env: Env },
}

enum LetKind {
    Plain,
    Star,
    Rec,
}

impl Interp {
    /// Evaluate one form.  Dynamic bindings established inside this
    /// invocation are restored on every exit path, normal or error.
    pub fn eval(&mut self, form: Value, env: &Env) -> LispResult<Value> {
        let mark = self.dynamic_unwind.len();
        let result = self.eval_loop(form, env.clone());
        while self.dynamic_unwind.len() > mark {
            if let Some((cell, old)) = self.dynamic_unwind.pop() {
                cell.borrow_mut().cdr = old;
            }
        }
        result
    }

    /// The single loop that rebinds `form`/`env` on every tail step: bodies,
    /// taken `if`/`cond` branches, macro expansions, `eval`/`apply` and
    /// direct closure application all continue here instead of recursing.
    fn eval_loop(&mut self, mut form: Value, mut env: Env) -> LispResult<Value> {
        let mut trace_frames = 0usize;
        let result = 'outer: loop {
            match &form {
                Value::Nil => break Ok(Value::Nil),
                Value::Sym(s) => break self.lookup_symbol(s, &env),
                Value::Cons(_) => {}
                other => break Ok(other.clone()),
            }

            let (op, rest) = match list_parts(&form) {
                Some(parts) => parts,
                None => break Ok(form.clone()),
            };

            let mut pre_args: Option<Vec<Value>> = None;

            if let Value::Sym(op_sym) = &op {
                match self.eval_special(op_sym, &rest, &env) {
                    Err(e) => break Err(e),
                    Ok(Special::Value(v)) => break Ok(v),
                    Ok(Special::Tail { form: f, env: e }) => {
                        form = f;
                        env = e;
                        continue;
                    }
                    Ok(Special::NotSpecial) => {}
                }

                // macro expansion replaces the form in tail position
                if let Some(mac) = self.macros.get(op_sym).cloned() {
                    let args = match self.unevaluated_args(&rest) {
                        Ok(a) => a,
                        Err(e) => break Err(e),
                    };
                    match self.apply(mac, &args) {
                        Ok(expansion) => {
                            form = expansion;
                            continue;
                        }
                        Err(e) => break Err(e),
                    }
                }

                // open-coding fast path; a `None` from open_code means
                // NOT_HANDLED and falls through to the general path with
                // the already-evaluated arguments
                if self.speed >= 1 {
                    if let Some(def) = self.open_coded.get(op_sym).copied() {
                        let argv = match self.eval_args(&rest, &env) {
                            Ok(v) => v,
                            Err(e) => break Err(e),
                        };
                        match builtins::open_code(self, def, &argv) {
                            Some(result) => break result,
                            None => pre_args = Some(argv),
                        }
                    }
                }
            }

            // general application
            let mut func = match self.eval(op.clone(), &env) {
                Ok(f) => f,
                Err(e) => break Err(e),
            };
            let mut argv = match pre_args.take() {
                Some(v) => v,
                None => match self.eval_args(&rest, &env) {
                    Ok(v) => v,
                    Err(e) => break Err(e),
                },
            };

            if let Value::Sym(op_sym) = &op {
                if self.traced.contains(op_sym) {
                    self.trace_enter(op_sym, &argv);
                    trace_frames += 1;
                }
            }

            // `apply` rewrites to its target in the same loop step
            loop {
                let is_apply = matches!(&func, Value::Prim(p) if std::ptr::eq(*p, self.prim_apply));
                if !is_apply {
                    break;
                }
                if argv.len() != 2 {
                    break 'outer Err(LispError::arity("apply", crate::error::ARITY_TWO, argv.len()));
                }
                let target = argv[0].clone();
                let (items, tail) = match list_elements(&argv[1]) {
                    Ok(parts) => parts,
                    Err(_) => {
                        break 'outer Err(LispError::malformed("apply", "circular argument list"))
                    }
                };
                if !tail.is_nil() {
                    break 'outer Err(LispError::type_error(
                        "apply",
                        "proper list",
                        print_value(&argv[1], true),
                    ));
                }
                func = target;
                argv = items;
            }

            // `eval` rebinds the loop instead of recursing
            let is_eval = matches!(&func, Value::Prim(p) if std::ptr::eq(*p, self.prim_eval));
            if is_eval {
                if argv.is_empty() || argv.len() > 2 {
                    break Err(LispError::arity(
                        "eval",
                        crate::error::ARITY_ONE_OR_TWO,
                        argv.len(),
                    ));
                }
                env = if argv.len() == 2 {
                    Env::from_alist(argv[1].clone())
                } else {
                    self.globals.clone()
                };
                form = argv[0].clone();
                continue;
            }

            match self.apply_step(func, argv, &env) {
                Err(e) => break Err(e),
                Ok(AppResult::Done(v)) => break Ok(v),
                Ok(AppResult::Enter { body, env: e }) => {
                    match self.eval_body_head(&body, &e) {
                        Err(err) => break Err(err),
                        Ok(Some(last)) => {
                            form = last;
                            env = e;
                            continue;
                        }
                        Ok(None) => break Ok(Value::Nil),
                    }
                }
            }
        };
        if trace_frames > 0 {
            self.trace_exit(trace_frames, &result);
        }
        result
    }

    fn lookup_symbol(&self, sym: &Symbol, env: &Env) -> LispResult<Value> {
        let wk = &self.symtab.wk;
        if sym == &wk.nil {
            return Ok(Value::Nil);
        }
        if sym == &wk.t {
            return Ok(Value::Sym(wk.t.clone()));
        }
        match env.lookup(sym) {
            Some(v) if self.is_unassigned(&v) => Err(LispError::Unbound(format!(
                "{} (used before its value was assigned)",
                sym
            ))),
            Some(v) => Ok(v),
            None => Err(LispError::Unbound(sym.name().to_string())),
        }
    }

    /// Apply a callable to already-evaluated arguments, running closure
    /// bodies to completion (no caller tail context).
    pub fn apply(&mut self, func: Value, args: &[Value]) -> LispResult<Value> {
        let globals = self.globals.clone();
        match self.apply_step(func, args.to_vec(), &globals)? {
            AppResult::Done(v) => Ok(v),
            AppResult::Enter { body, env } => {
                let (items, tail) = list_elements(&body)
                    .map_err(|_| LispError::malformed("lambda", "circular body"))?;
                if !tail.is_nil() {
                    return Err(LispError::malformed("lambda", "dotted body"));
                }
                let mut result = Value::Nil;
                for f in items {
                    result = self.eval(f, &env)?;
                }
                Ok(result)
            }
        }
    }

    /// One application step: primitives and compiled functions produce a
    /// value; closures produce a body to enter.
    pub(crate) fn apply_step(
        &mut self,
        func: Value,
        argv: Vec<Value>,
        caller_env: &Env,
    ) -> LispResult<AppResult> {
        match &func {
            Value::Prim(p) => {
                builtins::check_arity(p, argv.len())?;
                let result = (p.func)(self, &argv)?;
                Ok(AppResult::Done(result))
            }
            Value::Host(h) => {
                // the trampoline: drive pending tail calls to a plain value
                let mut step = (h.as_ref())(self, &argv)?;
                loop {
                    match step {
                        Step::Done(v) => return Ok(AppResult::Done(v)),
                        Step::Tail(next, args) => match next {
                            Value::Host(h2) => step = (h2.as_ref())(self, &args)?,
                            other => return Ok(AppResult::Done(self.apply(other, &args)?)),
                        },
                    }
                }
            }
            Value::Cons(cell) => {
                let wk_lambda = self.symtab.wk.lambda.clone();
                let wk_dynamic = self.symtab.wk.dynamic.clone();
                let (head, tail) = {
                    let b = cell.borrow();
                    (b.car.clone(), b.cdr.clone())
                };
                let is_lambda = matches!(&head, Value::Sym(s) if *s == wk_lambda);
                if !is_lambda {
                    return Err(LispError::type_error(
                        "function application",
                        "function",
                        print_value(&func, true),
                    ));
                }
                let captured = cell.borrow().env.clone();
                let (first, after) = list_parts(&tail)
                    .ok_or_else(|| LispError::malformed("lambda", "missing parameter list"))?;
                let (params, body) = match &first {
                    Value::Sym(s) if *s == wk_dynamic => list_parts(&after)
                        .ok_or_else(|| LispError::malformed("lambda", "missing parameter list"))?,
                    _ => (first, after),
                };
                // dynamic lambdas have no captured environment and look up
                // free variables in the caller's environment
                let base = match captured {
                    Some(e) => e,
                    None => caller_env.clone(),
                };
                let env = self.bind_params(&params, argv, &base)?;
                Ok(AppResult::Enter { body, env })
            }
            other => Err(LispError::type_error(
                "function application",
                "function",
                print_value(other, true),
            )),
        }
    }

    /// Zip a parameter list against evaluated arguments.  Supports a bare
    /// symbol (whole-list binding) and dotted tails; rejects reserved words,
    /// duplicates and circular parameter lists.
    fn bind_params(&mut self, params: &Value, argv: Vec<Value>, base: &Env) -> LispResult<Env> {
        match params {
            Value::Nil => {
                if !argv.is_empty() {
                    return Err(LispError::arity("lambda", "0", argv.len()));
                }
                Ok(base.clone())
            }
            Value::Sym(rest) => {
                check_binding_target(rest, "lambda")?;
                let items: Rc<[Value]> = Rc::from(argv);
                Ok(base.extend(rest, ArraySlice::new(items, 0)))
            }
            Value::Cons(_) => {
                let mut env = base.clone();
                let mut seen: Vec<Symbol> = Vec::new();
                let mut visited: std::collections::HashSet<usize> = std::collections::HashSet::new();
                let mut cur = params.clone();
                let mut i = 0usize;
                loop {
                    match cur {
                        Value::Nil => {
                            if i != argv.len() {
                                return Err(LispError::arity("lambda", i.to_string(), argv.len()));
                            }
                            return Ok(env);
                        }
                        Value::Sym(rest) => {
                            check_binding_target(&rest, "lambda")?;
                            if seen.contains(&rest) {
                                return Err(LispError::malformed(
                                    "lambda",
                                    format!("duplicate parameter {}", rest),
                                ));
                            }
                            let items: Rc<[Value]> = Rc::from(argv[i..].to_vec());
                            return Ok(env.extend(&rest, ArraySlice::new(items, 0)));
                        }
                        Value::Cons(ref c) => {
                            let key = Rc::as_ptr(c) as usize;
                            if !visited.insert(key) {
                                return Err(LispError::malformed(
                                    "lambda",
                                    "circular parameter list",
                                ));
                            }
                            let (p, next) = {
                                let b = c.borrow();
                                (b.car.clone(), b.cdr.clone())
                            };
                            let sym = match p {
                                Value::Sym(s) => s,
                                other => {
                                    return Err(LispError::malformed(
                                        "lambda",
                                        format!("parameter is not a symbol: {}", other),
                                    ))
                                }
                            };
                            check_binding_target(&sym, "lambda")?;
                            if seen.contains(&sym) {
                                return Err(LispError::malformed(
                                    "lambda",
                                    format!("duplicate parameter {}", sym),
                                ));
                            }
                            if i >= argv.len() {
                                return Err(LispError::arity(
                                    "lambda",
                                    format!("at least {}", i + 1),
                                    argv.len(),
                                ));
                            }
                            env = env.extend(&sym, argv[i].clone());
                            seen.push(sym);
                            i += 1;
                            cur = next;
                        }
                        other => {
                            return Err(LispError::malformed(
                                "lambda",
                                format!("parameter list contains {}", other),
                            ))
                        }
                    }
                }
            }
            other => Err(LispError::malformed(
                "lambda",
                format!("bad parameter list: {}", other),
            )),
        }
    }

    // ------------------------------------------------------------------
    // special forms
    // ------------------------------------------------------------------

    fn eval_special(&mut self, op: &Symbol, rest: &Value, env: &Env) -> LispResult<Special> {
        let wk = self.symtab.wk.clone();

        if *op == wk.quote {
            let args = self.unevaluated_args(rest)?;
            if args.len() != 1 {
                return Err(LispError::arity("quote", crate::error::ARITY_ONE, args.len()));
            }
            return Ok(Special::Value(args[0].clone()));
        }

        if *op == wk.lambda {
            return self.make_lambda(rest, env).map(Special::Value);
        }

        if *op == wk.setq {
            return self.eval_setq(rest, env).map(Special::Value);
        }

        if *op == wk.define {
            return self.eval_define(rest, env).map(Special::Value);
        }

        if *op == wk.defun {
            // sugar: (defun f (params) body...) rewrites to
            // (define f (lambda (params) body...)) and continues in the loop
            let (name, after) = list_parts(rest)
                .ok_or_else(|| LispError::malformed("defun", "missing function name"))?;
            let (params, body) = list_parts(&after)
                .ok_or_else(|| LispError::malformed("defun", "missing parameter list"))?;
            let lambda_form = cons(Value::Sym(wk.lambda.clone()), cons(params, body));
            let rewritten = list_from(&[Value::Sym(wk.define.clone()), name, lambda_form]);
            return Ok(Special::Tail {
                form: rewritten,
                env: env.clone(),
            });
        }

        if *op == wk.defmacro {
            return self.eval_defmacro(rest).map(Special::Value);
        }

        if *op == wk.if_ {
            let args = self.unevaluated_args(rest)?;
            if args.len() < 2 || args.len() > 3 {
                return Err(LispError::arity(
                    "if",
                    crate::error::ARITY_TWO_OR_THREE,
                    args.len(),
                ));
            }
            let test = self.eval(args[0].clone(), env)?;
            if test.truthy() {
                return Ok(Special::Tail {
                    form: args[1].clone(),
                    env: env.clone(),
                });
            }
            if args.len() == 3 {
                return Ok(Special::Tail {
                    form: args[2].clone(),
                    env: env.clone(),
                });
            }
            return Ok(Special::Value(Value::Nil));
        }

        if *op == wk.cond {
            let clauses = self.unevaluated_args(rest)?;
            for clause in clauses {
                let (pred, body) = list_parts(&clause)
                    .ok_or_else(|| LispError::malformed("cond", "clause is not a list"))?;
                let test = self.eval(pred, env)?;
                if test.truthy() {
                    return match self.eval_body_head(&body, env)? {
                        Some(last) => Ok(Special::Tail {
                            form: last,
                            env: env.clone(),
                        }),
                        None => Ok(Special::Value(test)),
                    };
                }
            }
            return Ok(Special::Value(Value::Nil));
        }

        if *op == wk.progn {
            return match self.eval_body_head(rest, env)? {
                Some(last) => Ok(Special::Tail {
                    form: last,
                    env: env.clone(),
                }),
                None => Ok(Special::Value(Value::Nil)),
            };
        }

        if *op == wk.labels {
            return self.eval_labels(rest, env);
        }

        if *op == wk.let_ {
            return self.eval_let(LetKind::Plain, rest, env);
        }
        if *op == wk.let_star {
            return self.eval_let(LetKind::Star, rest, env);
        }
        if *op == wk.letrec {
            return self.eval_let(LetKind::Rec, rest, env);
        }

        if *op == wk.load {
            let args = self.unevaluated_args(rest)?;
            if args.len() != 1 {
                return Err(LispError::arity("load", crate::error::ARITY_ONE, args.len()));
            }
            let spec = path_designator(&args[0], "load")?;
            return self.load_file(&spec).map(Special::Value);
        }

        if *op == wk.require {
            let args = self.unevaluated_args(rest)?;
            if args.is_empty() || args.len() > 2 {
                return Err(LispError::arity(
                    "require",
                    crate::error::ARITY_ONE_OR_TWO,
                    args.len(),
                ));
            }
            let name = path_designator(&args[0], "require")?;
            if self.modules.contains(&name) {
                return Ok(Special::Value(Value::Nil));
            }
            let spec = if args.len() == 2 {
                path_designator(&args[1], "require")?
            } else {
                name.clone()
            };
            self.load_file(&spec)?;
            if !self.modules.contains(&name) {
                return Err(LispError::malformed(
                    "require",
                    format!("file did not (provide {})", name),
                ));
            }
            return Ok(Special::Value(Value::Nil));
        }

        if *op == wk.provide {
            let args = self.unevaluated_args(rest)?;
            if args.len() != 1 {
                return Err(LispError::arity(
                    "provide",
                    crate::error::ARITY_ONE,
                    args.len(),
                ));
            }
            let name = path_designator(&args[0], "provide")?;
            self.modules.insert(name);
            return Ok(Special::Value(Value::Nil));
        }

        if *op == wk.declaim {
            for clause in crate::value::iter_list(rest) {
                if let Some((head, specs)) = list_parts(&clause) {
                    if matches!(&head, Value::Sym(s) if *s == wk.optimize) {
                        for spec in crate::value::iter_list(&specs) {
                            if let Some((what, val)) = list_parts(&spec) {
                                if matches!(&what, Value::Sym(s) if *s == wk.speed) {
                                    if let Some((Value::Long(n), _)) = list_parts(&val) {
                                        self.speed = n.clamp(0, 3) as u8;
                                    }
                                }
                            }
                        }
                    }
                    // other declaim clauses are accepted and ignored
                }
            }
            return Ok(Special::Value(Value::Nil));
        }

        Ok(Special::NotSpecial)
    }

    fn make_lambda(&mut self, rest: &Value, env: &Env) -> LispResult<Value> {
        let wk = self.symtab.wk.clone();
        let (first, after) = list_parts(rest)
            .ok_or_else(|| LispError::malformed("lambda", "missing parameter list"))?;
        let dynamic_mode = matches!(&first, Value::Sym(s) if *s == wk.dynamic);
        let (params, body) = if dynamic_mode {
            list_parts(&after)
                .ok_or_else(|| LispError::malformed("lambda", "missing parameter list"))?
        } else {
            (first, after)
        };
        self.validate_params(&params)?;
        if dynamic_mode {
            Ok(cons(
                Value::Sym(wk.lambda.clone()),
                cons(Value::Sym(wk.dynamic.clone()), cons(params, body)),
            ))
        } else {
            let closure = cons(Value::Sym(wk.lambda.clone()), cons(params, body));
            if let Value::Cons(c) = &closure {
                c.borrow_mut().env = Some(env.clone());
            }
            Ok(closure)
        }
    }

    pub(crate) fn validate_params(&self, params: &Value) -> LispResult<()> {
        match params {
            Value::Nil => Ok(()),
            Value::Sym(s) => check_binding_target(s, "lambda"),
            Value::Cons(_) => {
                let mut visited: std::collections::HashSet<usize> =
                    std::collections::HashSet::new();
                let mut seen: Vec<Symbol> = Vec::new();
                let mut cur = params.clone();
                loop {
                    match cur {
                        Value::Nil => return Ok(()),
                        Value::Sym(s) => return check_binding_target(&s, "lambda"),
                        Value::Cons(ref c) => {
                            let key = Rc::as_ptr(c) as usize;
                            if !visited.insert(key) {
                                return Err(LispError::malformed(
                                    "lambda",
                                    "circular parameter list",
                                ));
                            }
                            let (p, next) = {
                                let b = c.borrow();
                                (b.car.clone(), b.cdr.clone())
                            };
                            match p {
                                Value::Sym(s) => {
                                    check_binding_target(&s, "lambda")?;
                                    if seen.contains(&s) {
                                        return Err(LispError::malformed(
                                            "lambda",
                                            format!("duplicate parameter {}", s),
                                        ));
                                    }
                                    seen.push(s);
                                }
                                other => {
                                    return Err(LispError::malformed(
                                        "lambda",
                                        format!("parameter is not a symbol: {}", other),
                                    ))
                                }
                            }
                            cur = next;
                        }
                        other => {
                            return Err(LispError::malformed(
                                "lambda",
                                format!("parameter list contains {}", other),
                            ))
                        }
                    }
                }
            }
            other => Err(LispError::malformed(
                "lambda",
                format!("bad parameter list: {}", other),
            )),
        }
    }

    fn eval_setq(&mut self, rest: &Value, env: &Env) -> LispResult<Value> {
        let args = self.unevaluated_args(rest)?;
        if args.len() % 2 != 0 {
            return Err(LispError::malformed("setq", "odd number of arguments"));
        }
        let mut last = Value::Nil;
        for pair in args.chunks(2) {
            let sym = match &pair[0] {
                Value::Sym(s) => s.clone(),
                other => {
                    return Err(LispError::malformed(
                        "setq",
                        format!("cannot assign to {}", other),
                    ))
                }
            };
            check_binding_target(&sym, "setq")?;
            let value = self.eval(pair[1].clone(), env)?;
            match env.lookup_cell(&sym) {
                Some(cell) => cell.borrow_mut().cdr = value.clone(),
                None => return Err(LispError::Unbound(sym.name().to_string())),
            }
            last = value;
        }
        Ok(last)
    }

    fn eval_define(&mut self, rest: &Value, env: &Env) -> LispResult<Value> {
        let args = self.unevaluated_args(rest)?;
        if args.len() != 2 {
            return Err(LispError::arity("define", crate::error::ARITY_TWO, args.len()));
        }
        let sym = match &args[0] {
            Value::Sym(s) => s.clone(),
            other => {
                return Err(LispError::malformed(
                    "define",
                    format!("cannot define {}", other),
                ))
            }
        };
        check_binding_target(&sym, "define")?;
        let value = self.eval(args[1].clone(), env)?;
        if self.globals.lookup_cell(&sym).is_some() {
            self.globals.set(&sym, value);
        } else {
            self.globals.insert(&sym, value);
        }
        Ok(Value::Sym(sym))
    }

    fn eval_defmacro(&mut self, rest: &Value) -> LispResult<Value> {
        let (name_v, after) = list_parts(rest)
            .ok_or_else(|| LispError::malformed("defmacro", "missing macro name"))?;
        let name = match name_v {
            Value::Sym(s) => s,
            other => {
                return Err(LispError::malformed(
                    "defmacro",
                    format!("macro name is not a symbol: {}", other),
                ))
            }
        };
        check_binding_target(&name, "defmacro")?;
        if after.is_nil() {
            // (defmacro name) uninstalls
            self.macros.remove(&name);
            return Ok(Value::Sym(name));
        }
        let (params, body) = list_parts(&after)
            .ok_or_else(|| LispError::malformed("defmacro", "missing parameter list"))?;
        self.validate_params(&params)?;
        let wk_lambda = self.symtab.wk.lambda.clone();
        let closure = cons(Value::Sym(wk_lambda), cons(params, body));
        if let Value::Cons(c) = &closure {
            c.borrow_mut().env = Some(self.globals.clone());
        }
        self.macros.insert(name.clone(), closure);
        Ok(Value::Sym(name))
    }

    fn eval_labels(&mut self, rest: &Value, env: &Env) -> LispResult<Special> {
        let (defs_form, body) = list_parts(rest)
            .ok_or_else(|| LispError::malformed("labels", "missing definition list"))?;
        let (defs, tail) = list_elements(&defs_form)
            .map_err(|_| LispError::malformed("labels", "circular definition list"))?;
        if !tail.is_nil() {
            return Err(LispError::malformed("labels", "dotted definition list"));
        }

        // pre-bind every name so the definitions see each other
        let mut env2 = env.clone();
        let mut pending = Vec::new();
        for def in &defs {
            let (name_v, after_name) = list_parts(def)
                .ok_or_else(|| LispError::malformed("labels", "definition is not a list"))?;
            let name = match name_v {
                Value::Sym(s) => s,
                other => {
                    return Err(LispError::malformed(
                        "labels",
                        format!("function name is not a symbol: {}", other),
                    ))
                }
            };
            check_binding_target(&name, "labels")?;
            let (params, fn_body) = list_parts(&after_name)
                .ok_or_else(|| LispError::malformed("labels", "missing parameter list"))?;
            self.validate_params(&params)?;
            let (extended, cell) = env2.extend_cell(&name, self.unassigned.clone());
            env2 = extended;
            pending.push((cell, params, fn_body));
        }

        let wk_lambda = self.symtab.wk.lambda.clone();
        for (cell, params, fn_body) in pending {
            let closure = cons(Value::Sym(wk_lambda.clone()), cons(params, fn_body));
            if let Value::Cons(c) = &closure {
                c.borrow_mut().env = Some(env2.clone());
            }
            cell.borrow_mut().cdr = closure;
        }

        match self.eval_body_head(&body, &env2)? {
            Some(last) => Ok(Special::Tail {
                form: last,
                env: env2,
            }),
            None => Ok(Special::Value(Value::Nil)),
        }
    }

    fn eval_let(&mut self, kind: LetKind, rest: &Value, env: &Env) -> LispResult<Special> {
        let wk = self.symtab.wk.clone();
        let (first, mut body) = list_parts(rest)
            .ok_or_else(|| LispError::malformed("let", "missing binding list"))?;

        let mut named: Option<Symbol> = None;
        let mut dynamic = false;
        let bindings_form;
        match &first {
            Value::Sym(s) if *s == wk.dynamic => {
                dynamic = true;
                let (b, after) = list_parts(&body)
                    .ok_or_else(|| LispError::malformed("let", "missing binding list"))?;
                bindings_form = b;
                body = after;
            }
            Value::Sym(s) => match list_parts(&body) {
                Some((maybe_bindings, after))
                    if matches!(maybe_bindings, Value::Nil | Value::Cons(_)) =>
                {
                    check_binding_target(s, "let")?;
                    named = Some(s.clone());
                    bindings_form = maybe_bindings;
                    body = after;
                }
                _ => {
                    // a bare symbol is the binding list: (let x ...) binds x to nil
                    bindings_form = first.clone();
                }
            },
            _ => {
                bindings_form = first.clone();
            }
        }

        let bindings = self.parse_bindings(&bindings_form)?;

        if dynamic {
            return self.eval_let_dynamic(kind, bindings, body, env);
        }

        if let Some(name) = named {
            return self.eval_named_let(name, bindings, body, env);
        }

        let env2 = match kind {
            LetKind::Plain => {
                let mut vals = Vec::with_capacity(bindings.len());
                for (_, rhs) in &bindings {
                    vals.push(self.eval(rhs.clone(), env)?);
                }
                let mut e = env.clone();
                for ((sym, _), val) in bindings.iter().zip(vals) {
                    e = e.extend(sym, val);
                }
                e
            }
            LetKind::Star => {
                let mut e = env.clone();
                for (sym, rhs) in &bindings {
                    let val = self.eval(rhs.clone(), &e)?;
                    e = e.extend(sym, val);
                }
                e
            }
            LetKind::Rec => {
                let mut e = env.clone();
                let mut cells = Vec::with_capacity(bindings.len());
                for (sym, _) in &bindings {
                    let (extended, cell) = e.extend_cell(sym, self.unassigned.clone());
                    e = extended;
                    cells.push(cell);
                }
                for ((_, rhs), cell) in bindings.iter().zip(cells) {
                    let val = self.eval(rhs.clone(), &e)?;
                    cell.borrow_mut().cdr = val;
                }
                e
            }
        };

        match self.eval_body_head(&body, &env2)? {
            Some(last) => Ok(Special::Tail {
                form: last,
                env: env2,
            }),
            None => Ok(Special::Value(Value::Nil)),
        }
    }

    /// Named let: a local recursive function applied to the initial values.
    fn eval_named_let(
        &mut self,
        name: Symbol,
        bindings: Vec<(Symbol, Value)>,
        body: Value,
        env: &Env,
    ) -> LispResult<Special> {
        let wk_lambda = self.symtab.wk.lambda.clone();
        let (env2, cell) = env.extend_cell(&name, self.unassigned.clone());

        let params = list_from(
            &bindings
                .iter()
                .map(|(s, _)| Value::Sym(s.clone()))
                .collect::<Vec<_>>(),
        );
        let closure = cons(Value::Sym(wk_lambda), cons(params.clone(), body.clone()));
        if let Value::Cons(c) = &closure {
            c.borrow_mut().env = Some(env2.clone());
        }
        cell.borrow_mut().cdr = closure;

        let mut vals = Vec::with_capacity(bindings.len());
        for (_, rhs) in &bindings {
            vals.push(self.eval(rhs.clone(), env)?);
        }
        let env3 = self.bind_params(&params, vals, &env2)?;
        match self.eval_body_head(&body, &env3)? {
            Some(last) => Ok(Special::Tail {
                form: last,
                env: env3,
            }),
            None => Ok(Special::Value(Value::Nil)),
        }
    }

    /// `let dynamic`: mutate global cells for the duration of the body and
    /// record the old values on the unwind list.
    fn eval_let_dynamic(
        &mut self,
        kind: LetKind,
        bindings: Vec<(Symbol, Value)>,
        body: Value,
        env: &Env,
    ) -> LispResult<Special> {
        match kind {
            LetKind::Plain => {
                let mut vals = Vec::with_capacity(bindings.len());
                for (_, rhs) in &bindings {
                    vals.push(self.eval(rhs.clone(), env)?);
                }
                for ((sym, _), val) in bindings.iter().zip(vals) {
                    self.push_dynamic(sym, val);
                }
            }
            LetKind::Star => {
                for (sym, rhs) in &bindings {
                    let val = self.eval(rhs.clone(), env)?;
                    self.push_dynamic(sym, val);
                }
            }
            LetKind::Rec => {
                for (sym, _) in &bindings {
                    let sentinel = self.unassigned.clone();
                    self.push_dynamic(sym, sentinel);
                }
                for (sym, rhs) in &bindings {
                    let val = self.eval(rhs.clone(), env)?;
                    self.globals.set(sym, val);
                }
            }
        }
        match self.eval_body_head(&body, env)? {
            Some(last) => Ok(Special::Tail {
                form: last,
                env: env.clone(),
            }),
            None => Ok(Special::Value(Value::Nil)),
        }
    }

    fn push_dynamic(&mut self, sym: &Symbol, value: Value) {
        let cell = match self.globals.lookup_cell(sym) {
            Some(cell) => cell,
            None => {
                let sentinel = self.unassigned.clone();
                self.globals.insert(sym, sentinel);
                self.globals
                    .lookup_cell(sym)
                    .expect("binding was just inserted")
            }
        };
        let old = cell.borrow().cdr.clone();
        self.dynamic_unwind.push((cell.clone(), old));
        cell.borrow_mut().cdr = value;
    }

    pub(crate) fn parse_bindings(&mut self, form: &Value) -> LispResult<Vec<(Symbol, Value)>> {
        match form {
            Value::Nil => Ok(Vec::new()),
            Value::Sym(s) => {
                check_binding_target(s, "let")?;
                Ok(vec![(s.clone(), Value::Nil)])
            }
            Value::Cons(_) => {
                let (items, tail) = list_elements(form)
                    .map_err(|_| LispError::malformed("let", "circular binding list"))?;
                if !tail.is_nil() {
                    return Err(LispError::malformed("let", "dotted binding list"));
                }
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    match &item {
                        Value::Sym(s) => {
                            check_binding_target(s, "let")?;
                            out.push((s.clone(), Value::Nil));
                        }
                        Value::Cons(_) => {
                            let (parts, ptail) = list_elements(&item).map_err(|_| {
                                LispError::malformed("let", "circular binding list")
                            })?;
                            if !ptail.is_nil() || parts.is_empty() || parts.len() > 2 {
                                return Err(LispError::malformed(
                                    "let",
                                    format!("bad binding {}", print_value(&item, true)),
                                ));
                            }
                            let sym = match &parts[0] {
                                Value::Sym(s) => s.clone(),
                                other => {
                                    return Err(LispError::malformed(
                                        "let",
                                        format!("binding name is not a symbol: {}", other),
                                    ))
                                }
                            };
                            check_binding_target(&sym, "let")?;
                            let rhs = parts.get(1).cloned().unwrap_or(Value::Nil);
                            out.push((sym, rhs));
                        }
                        other => {
                            return Err(LispError::malformed(
                                "let",
                                format!("bad binding {}", other),
                            ))
                        }
                    }
                }
                Ok(out)
            }
            other => Err(LispError::malformed(
                "let",
                format!("bad binding list: {}", other),
            )),
        }
    }

    // ------------------------------------------------------------------
    // shared helpers
    // ------------------------------------------------------------------

    /// Evaluate everything but the last body form; hand back the last for
    /// the tail loop.  `None` means the body was empty.
    pub(crate) fn eval_body_head(&mut self, body: &Value, env: &Env) -> LispResult<Option<Value>> {
        let (items, tail) =
            list_elements(body).map_err(|_| LispError::malformed("body", "circular body"))?;
        if !tail.is_nil() {
            return Err(LispError::malformed("body", "dotted body"));
        }
        if items.is_empty() {
            return Ok(None);
        }
        for form in &items[..items.len() - 1] {
            self.eval(form.clone(), env)?;
        }
        Ok(Some(items[items.len() - 1].clone()))
    }

    fn unevaluated_args(&self, rest: &Value) -> LispResult<Vec<Value>> {
        let (items, tail) = list_elements(rest)
            .map_err(|_| LispError::malformed("form", "circular argument list"))?;
        if !tail.is_nil() {
            return Err(LispError::malformed("form", "dotted argument list"));
        }
        Ok(items)
    }

    fn eval_args(&mut self, rest: &Value, env: &Env) -> LispResult<Vec<Value>> {
        let items = self.unevaluated_args(rest)?;
        let mut out = Vec::with_capacity(items.len());
        for form in items {
            out.push(self.eval(form, env)?);
        }
        Ok(out)
    }

    /// Expand a macro call once; the form comes back unchanged when the
    /// head is not a macro.
    pub fn macroexpand_1(&mut self, form: &Value) -> LispResult<Value> {
        if let Some((Value::Sym(head), rest)) = list_parts(form) {
            if let Some(mac) = self.macros.get(&head).cloned() {
                let args = self.unevaluated_args(&rest)?;
                return self.apply(mac, &args);
            }
        }
        Ok(form.clone())
    }

    // ------------------------------------------------------------------
    // load / require plumbing
    // ------------------------------------------------------------------

    pub fn load_file(&mut self, spec: &str) -> LispResult<Value> {
        let path = self.resolve_load_path(spec)?;
        tracing::debug!(path = %path.display(), "loading");
        let source = std::fs::read_to_string(&path)
            .map_err(|e| LispError::Io(format!("cannot load {}: {}", path.display(), e)))?;
        let shown = path.display().to_string();
        self.load_stack.push(path);
        let result = self.interpret(&source, Some(&shown));
        self.load_stack.pop();
        result
    }

    pub(crate) fn resolve_load_path(&self, spec: &str) -> LispResult<PathBuf> {
        let direct = Path::new(spec);
        if direct.is_absolute() {
            return Ok(direct.to_path_buf());
        }
        let sibling = self
            .load_stack
            .last()
            .and_then(|p| p.parent())
            .map(|d| d.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        let mut candidates = vec![sibling.join(spec), sibling.join(format!("{}.lisp", spec))];
        if let Some(lib) = &self.libdir {
            candidates.push(lib.join(spec));
            candidates.push(lib.join(format!("{}.lisp", spec)));
        }
        for candidate in &candidates {
            if candidate.is_file() {
                return Ok(candidate.clone());
            }
        }
        Err(LispError::Io(format!("file not found: {}", spec)))
    }

    // ------------------------------------------------------------------
    // trace output
    // ------------------------------------------------------------------

    fn trace_enter(&mut self, sym: &Symbol, args: &[Value]) {
        self.tail_stack.push_back(sym.clone());
        let depth = self.tail_stack.len();
        let rendered: Vec<String> = args.iter().map(|a| print_value(a, true)).collect();
        eprintln!("({}) enter ({} {})", depth, sym, rendered.join(" "));
    }

    fn trace_exit(&mut self, frames: usize, result: &LispResult<Value>) {
        for _ in 0..frames {
            let depth = self.tail_stack.len();
            let name = match self.tail_stack.pop_back() {
                Some(s) => s,
                None => break,
            };
            match result {
                Ok(v) => eprintln!("({}) exit {} => {}", depth, name, print_value(v, true)),
                Err(_) => eprintln!("({}) exit {} => <error>", depth, name),
            }
        }
    }
}

fn check_binding_target(sym: &Symbol, what: &str) -> LispResult<()> {
    if sym.is_reserved() {
        Err(LispError::malformed(
            what,
            format!("cannot bind reserved word {}", sym),
        ))
    } else {
        Ok(())
    }
}

fn path_designator(v: &Value, what: &str) -> LispResult<String> {
    match v {
        Value::Str(s) => Ok(s.to_string()),
        Value::Sym(s) => Ok(s.name().to_string()),
        other => Err(LispError::type_error(
            what,
            "string or symbol",
            other.type_name(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::eq;

    fn run(src: &str) -> Value {
        let mut interp = Interp::new();
        interp.interpret_expression(src).unwrap()
    }

    fn run_err(src: &str) -> LispError {
        let mut interp = Interp::new();
        interp.interpret_expression(src).unwrap_err()
    }

    #[test]
    fn test_self_evaluating_atoms() {
        assert!(eq(&run("42"), &Value::Long(42)));
        assert!(eq(&run("2.5"), &Value::Double(2.5)));
        assert!(eq(&run("#\\a"), &Value::Char('a')));
        assert!(eq(&run("()"), &Value::Nil));
        assert_eq!(print_value(&run("\"s\""), false), "s");
    }

    #[test]
    fn test_t_evaluates_to_itself() {
        assert_eq!(print_value(&run("t"), true), "t");
    }

    #[test]
    fn test_nil_symbol_evaluates_to_empty_list() {
        assert!(run("nil").is_nil());
    }

    #[test]
    fn test_unbound_symbol() {
        assert!(matches!(run_err("no-such-var"), LispError::Unbound(_)));
    }

    #[test]
    fn test_quote() {
        assert_eq!(print_value(&run("'(1 2)"), true), "(1 2)");
        assert!(matches!(run_err("(quote 1 2)"), LispError::Arity { .. }));
    }

    #[test]
    fn test_if_branches_and_truthiness() {
        assert!(eq(&run("(if t 1 2)"), &Value::Long(1)));
        assert!(eq(&run("(if nil 1 2)"), &Value::Long(2)));
        assert!(eq(&run("(if 0 1 2)"), &Value::Long(1))); // 0 is not nil
        assert!(run("(if nil 1)").is_nil());
    }

    #[test]
    fn test_define_returns_symbol_and_binds() {
        let mut interp = Interp::new();
        let v = interp.interpret_expression("(define x 42)").unwrap();
        assert_eq!(print_value(&v, true), "x");
        assert!(eq(
            &interp.interpret_expression("x").unwrap(),
            &Value::Long(42)
        ));
    }

    #[test]
    fn test_define_reserved_word_fails() {
        assert!(matches!(
            run_err("(define lambda 1)"),
            LispError::Malformed { .. }
        ));
    }

    #[test]
    fn test_setq_mutates_and_returns_last() {
        let mut interp = Interp::new();
        interp.interpret_expression("(define x 1) (define y 2)").unwrap();
        let v = interp.interpret_expression("(setq x 10 y 20)").unwrap();
        assert!(eq(&v, &Value::Long(20)));
        assert!(eq(&interp.interpret_expression("x").unwrap(), &Value::Long(10)));
    }

    #[test]
    fn test_setq_unknown_symbol_fails() {
        assert!(matches!(run_err("(setq ghost 1)"), LispError::Unbound(_)));
    }

    #[test]
    fn test_lambda_application() {
        assert!(eq(&run("((lambda (x) x) 42)"), &Value::Long(42)));
        assert!(eq(&run("((lambda (x y) (+ x y)) 1 2)"), &Value::Double(3.0)));
    }

    #[test]
    fn test_lambda_closure_captures() {
        let src = "(define make-adder (lambda (n) (lambda (x) (+ x n))))
                   (define add5 (make-adder 5))
                   (add5 10)";
        assert!(eq(&run(src), &Value::Double(15.0)));
    }

    #[test]
    fn test_lambda_varargs_symbol_param() {
        assert_eq!(print_value(&run("((lambda args args) 1 2 3)"), true), "(1 2 3)");
    }

    #[test]
    fn test_lambda_dotted_params() {
        assert_eq!(
            print_value(&run("((lambda (a . rest) rest) 1 2 3)"), true),
            "(2 3)"
        );
        assert!(eq(&run("((lambda (a . rest) a) 1 2 3)"), &Value::Long(1)));
    }

    #[test]
    fn test_lambda_arity_errors() {
        assert!(matches!(
            run_err("((lambda (x) x) 1 2)"),
            LispError::Arity { .. }
        ));
        assert!(run_err("((lambda (x y) x) 1)")
            .to_string()
            .contains("argument"));
    }

    #[test]
    fn test_reserved_parameter_rejected() {
        assert!(run_err("((lambda (t) t) 1)").to_string().contains("reserved"));
        assert!(run_err("(lambda (if) if)").to_string().contains("reserved"));
    }

    #[test]
    fn test_duplicate_parameter_rejected() {
        assert!(run_err("(lambda (x x) x)").to_string().contains("duplicate"));
    }

    #[test]
    fn test_progn_sequences() {
        assert!(eq(&run("(progn 1 2 3)"), &Value::Long(3)));
        assert!(run("(progn)").is_nil());
    }

    #[test]
    fn test_cond() {
        assert!(eq(&run("(cond (nil 1) (t 2))"), &Value::Long(2)));
        assert!(run("(cond (nil 1))").is_nil());
        // a clause without a body yields the predicate's value
        assert!(eq(&run("(cond (42))"), &Value::Long(42)));
    }

    #[test]
    fn test_let_and_let_star() {
        assert!(eq(&run("(let ((x 1) (y 2)) (1+ x) y)"), &Value::Long(2)));
        assert!(eq(&run("(let* ((x 1) (y (1+ x))) y)"), &Value::Long(2)));
        // plain let evaluates right-hand sides in the outer environment
        let e = run_err("(let ((x 1) (y (1+ x))) y)");
        assert!(e.to_string().contains("x"));
    }

    #[test]
    fn test_let_bare_symbol_binding() {
        assert!(run("(let (x) x)").is_nil());
        assert!(run("(let ((x)) x)").is_nil());
    }

    #[test]
    fn test_letrec() {
        let src = "(letrec ((even? (lambda (n) (if (= n 0) t (odd? (1- n)))))
                            (odd?  (lambda (n) (if (= n 0) nil (even? (1- n))))))
                     (even? 10))";
        assert_eq!(print_value(&run(src), true), "t");
    }

    #[test]
    fn test_letrec_use_before_assignment() {
        let e = run_err("(letrec ((a b) (b 1)) a)");
        assert!(e.to_string().contains("assigned"));
    }

    #[test]
    fn test_named_let_loops_in_constant_stack() {
        let src = "(let loop ((n 100000) (acc 0))
                     (if (= n 0) acc (loop (1- n) (1+ acc))))";
        assert!(eq(&run(src), &Value::Long(100000)));
    }

    #[test]
    fn test_labels_mutual_recursion() {
        let src = "(labels ((even? (n) (if (= n 0) t (odd? (1- n))))
                           (odd?  (n) (if (= n 0) nil (even? (1- n)))))
                     (odd? 7))";
        assert_eq!(print_value(&run(src), true), "t");
    }

    #[test]
    fn test_deep_tail_recursion_defun() {
        let src = "(defun sum (n acc) (if (= n 0) acc (sum (1- n) (+ acc n))))
                   (sum 100000 0)";
        assert!(eq(&run(src), &Value::Double(5000050000.0)));
    }

    #[test]
    fn test_defun_and_defmacro() {
        assert!(eq(&run("(defun sq (x) (* x x)) (sq 4)"), &Value::Double(16.0)));
        assert!(eq(
            &run("(progn (defmacro m (a b) `(+ ,a ,b)) (m 1 2))"),
            &Value::Double(3.0)
        ));
    }

    #[test]
    fn test_defmacro_uninstall() {
        let mut interp = Interp::new();
        interp
            .interpret_expression("(defmacro m (a) `(+ ,a 1))")
            .unwrap();
        assert!(eq(
            &interp.interpret_expression("(m 1)").unwrap(),
            &Value::Double(2.0)
        ));
        interp.interpret_expression("(defmacro m)").unwrap();
        assert!(interp.interpret_expression("(m 1)").is_err());
    }

    #[test]
    fn test_dynamic_let_restores_on_exit() {
        let mut interp = Interp::new();
        interp.interpret_expression("(define *g* 1)").unwrap();
        let v = interp
            .interpret_expression("(let dynamic ((*g* 2)) *g*)")
            .unwrap();
        assert!(eq(&v, &Value::Long(2)));
        assert!(eq(
            &interp.interpret_expression("*g*").unwrap(),
            &Value::Long(1)
        ));
    }

    #[test]
    fn test_dynamic_let_restores_on_error() {
        let mut interp = Interp::new();
        interp.interpret_expression("(define *g* 1)").unwrap();
        let r = interp.interpret_expression("(let dynamic ((*g* 2)) (car 5))");
        assert!(r.is_err());
        assert!(eq(
            &interp.interpret_expression("*g*").unwrap(),
            &Value::Long(1)
        ));
    }

    #[test]
    fn test_dynamic_lookup_scenario() {
        // dynamic rebinding is observable through a function defined earlier
        let src = "(let* dynamic ((x 1))
                     (defun probe () x)
                     (let* dynamic ((x 2)) (probe)))";
        assert!(eq(&run(src), &Value::Long(2)));

        // the lexical version captures instead
        let src_lex = "(define probe2 nil)
                       (let* ((x 1))
                         (setq probe2 (lambda () x))
                         (let* ((x 2)) (probe2)))";
        assert!(eq(&run(src_lex), &Value::Long(1)));
    }

    #[test]
    fn test_eval_and_apply_are_tail_forms() {
        assert!(eq(&run("(eval '(+ 1 2))"), &Value::Double(3.0)));
        assert!(eq(&run("(apply + '(1 2 3))"), &Value::Double(6.0)));
        assert!(eq(&run("(apply apply (list + '(1 2)))"), &Value::Double(3.0)));
    }

    #[test]
    fn test_eval_idempotent_on_side_effect_free_forms() {
        // eval(eval x) == eval(x) when eval(x) is self-evaluating
        let mut interp = Interp::new();
        let a = interp
            .interpret_expression("(eval (eval '(+ 1 2)))")
            .unwrap();
        let b = interp.interpret_expression("(eval '(+ 1 2))").unwrap();
        assert!(crate::value::equal(&a, &b));
    }

    #[test]
    fn test_not_a_function_application() {
        assert!(run_err("(1 2 3)").to_string().contains("function"));
    }

    #[test]
    fn test_declaim_sets_speed() {
        let mut interp = Interp::new();
        interp
            .interpret_expression("(declaim (optimize (speed 0)))")
            .unwrap();
        assert_eq!(interp.speed, 0);
        interp
            .interpret_expression("(declaim (optimize (speed 2)))")
            .unwrap();
        assert_eq!(interp.speed, 2);
    }

    #[test]
    fn test_provide_require() {
        let mut interp = Interp::new();
        interp.interpret_expression("(provide \"mod\")").unwrap();
        // already provided: require is a no-op instead of a load
        assert!(interp
            .interpret_expression("(require \"mod\")")
            .unwrap()
            .is_nil());
    }

    #[test]
    fn test_load_missing_file() {
        let e = run_err("(load \"no-such-file-anywhere\")");
        assert!(e.to_string().contains("I/O error") || e.to_string().contains("file not found"));
    }

    #[test]
    fn test_macroexpand_entry() {
        let mut interp = Interp::new();
        interp
            .interpret_expression("(defmacro twice (x) `(+ ,x ,x))")
            .unwrap();
        let form = {
            let mut reader =
                crate::reader::Reader::new(&mut interp.symtab, "(twice 3)", None);
            reader.next_form().unwrap().unwrap()
        };
        let expanded = interp.macroexpand_1(&form).unwrap();
        assert_eq!(print_value(&expanded, true), "(+ 3 3)");
    }
}
