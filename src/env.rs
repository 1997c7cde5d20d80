// ABOUTME: Association-list environments with shadowing and in-place cell mutation

use crate::symbol::Symbol;
use crate::value::{cons, ConsRef, Value};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// An environment is an association list of `(symbol . value)` cons cells.
/// The handle is shared: closures capture it, and the global environment's
/// handle keeps its identity across `define`, so previously captured
/// references observe new global bindings.  `setq` mutates a binding cell in
/// place, which makes the change visible through every environment that
/// shares the cell.
#[derive(Clone)]
pub struct Env(Rc<RefCell<Value>>);

impl Env {
    pub fn new() -> Self {
        Env(Rc::new(RefCell::new(Value::Nil)))
    }

    /// The current association list.  New bindings added later to a child
    /// environment are not visible through this snapshot.
    pub fn bindings(&self) -> Value {
        self.0.borrow().clone()
    }

    pub fn same(&self, other: &Env) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// The binding cell for `sym`, innermost first.  Lookup is linear and
    /// compares symbols by identity.
    pub fn lookup_cell(&self, sym: &Symbol) -> Option<ConsRef> {
        let mut cur = self.bindings();
        loop {
            match cur {
                Value::Cons(node) => {
                    let (entry, rest) = {
                        let b = node.borrow();
                        (b.car.clone(), b.cdr.clone())
                    };
                    if let Value::Cons(cell) = entry {
                        if let Value::Sym(bound) = &cell.borrow().car {
                            if bound == sym {
                                return Some(cell.clone());
                            }
                        }
                    }
                    cur = rest;
                }
                _ => return None,
            }
        }
    }

    pub fn lookup(&self, sym: &Symbol) -> Option<Value> {
        self.lookup_cell(sym).map(|cell| cell.borrow().cdr.clone())
    }

    /// An environment whose bindings are an existing association list.
    pub fn from_alist(list: Value) -> Env {
        Env(Rc::new(RefCell::new(list)))
    }

    /// A child environment with one additional binding shadowing `sym`.
    /// The parent is unaffected.
    pub fn extend(&self, sym: &Symbol, value: Value) -> Env {
        self.extend_cell(sym, value).0
    }

    /// Like `extend`, additionally handing back the fresh binding cell so
    /// `letrec`-style constructs can assign it after the fact.
    pub fn extend_cell(&self, sym: &Symbol, value: Value) -> (Env, ConsRef) {
        let pair = cons(Value::Sym(sym.clone()), value);
        let cell = match &pair {
            Value::Cons(c) => c.clone(),
            _ => unreachable!("cons() returns a cons"),
        };
        let env = Env(Rc::new(RefCell::new(cons(pair, self.bindings()))));
        (env, cell)
    }

    /// Destructively add a binding while preserving the list header's
    /// identity: the new pair goes in right behind the first element, so
    /// every snapshot that shares the header cons observes it.  Used by
    /// `define` on the global environment.
    pub fn insert(&self, sym: &Symbol, value: Value) {
        let pair = cons(Value::Sym(sym.clone()), value);
        let list = self.bindings();
        match &list {
            Value::Cons(head) => {
                let tail = head.borrow().cdr.clone();
                let node = cons(pair, tail);
                head.borrow_mut().cdr = node;
            }
            _ => {
                *self.0.borrow_mut() = cons(pair, Value::Nil);
            }
        }
    }

    /// Mutate an existing binding in place; reports whether one was found.
    pub fn set(&self, sym: &Symbol, value: Value) -> bool {
        match self.lookup_cell(sym) {
            Some(cell) => {
                cell.borrow_mut().cdr = value;
                true
            }
            None => false,
        }
    }
}

impl Default for Env {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#<environment>")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::SymbolTable;
    use crate::value::eq;

    #[test]
    fn test_insert_and_lookup() {
        let mut table = SymbolTable::new();
        let env = Env::new();
        let x = table.intern("x");
        env.insert(&x, Value::Long(42));
        assert!(eq(&env.lookup(&x).unwrap(), &Value::Long(42)));
    }

    #[test]
    fn test_lookup_missing() {
        let mut table = SymbolTable::new();
        let env = Env::new();
        assert!(env.lookup(&table.intern("nope")).is_none());
    }

    #[test]
    fn test_extend_shadows_without_mutating_parent() {
        let mut table = SymbolTable::new();
        let x = table.intern("x");
        let outer = Env::new();
        outer.insert(&x, Value::Long(1));

        let inner = outer.extend(&x, Value::Long(2));
        assert!(eq(&inner.lookup(&x).unwrap(), &Value::Long(2)));
        assert!(eq(&outer.lookup(&x).unwrap(), &Value::Long(1)));
    }

    #[test]
    fn test_insert_visible_through_captured_handle() {
        // A closure captures the global handle; defines that happen later
        // must be visible through it.
        let mut table = SymbolTable::new();
        let globals = Env::new();
        let captured = globals.clone();

        let y = table.intern("y");
        globals.insert(&y, Value::Long(7));
        assert!(eq(&captured.lookup(&y).unwrap(), &Value::Long(7)));
    }

    #[test]
    fn test_insert_visible_through_extension_snapshots() {
        // Lexical extensions share the global list's header cons, so globals
        // defined after a closure captured its environment stay reachable.
        let mut table = SymbolTable::new();
        let globals = Env::new();
        let a = table.intern("a");
        globals.insert(&a, Value::Long(1));

        let child = globals.extend(&table.intern("local"), Value::Nil);
        let b = table.intern("b");
        globals.insert(&b, Value::Long(2));

        assert!(eq(&child.lookup(&b).unwrap(), &Value::Long(2)));
        assert!(child.lookup(&a).is_some());
    }

    #[test]
    fn test_from_alist() {
        let mut table = SymbolTable::new();
        let x = table.intern("x");
        let alist = cons(cons(Value::Sym(x.clone()), Value::Long(9)), Value::Nil);
        let env = Env::from_alist(alist);
        assert!(eq(&env.lookup(&x).unwrap(), &Value::Long(9)));
    }

    #[test]
    fn test_set_mutates_shared_cell() {
        let mut table = SymbolTable::new();
        let x = table.intern("x");
        let outer = Env::new();
        outer.insert(&x, Value::Long(1));

        // Extending with an unrelated binding shares the tail, so mutation
        // through the child is seen by the parent.
        let child = outer.extend(&table.intern("other"), Value::Nil);
        assert!(child.set(&x, Value::Long(99)));
        assert!(eq(&outer.lookup(&x).unwrap(), &Value::Long(99)));
    }

    #[test]
    fn test_set_unknown_reports_false() {
        let mut table = SymbolTable::new();
        let env = Env::new();
        assert!(!env.set(&table.intern("ghost"), Value::Long(0)));
    }
}
