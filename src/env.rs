//! Lexically chained name->value scopes
//!
//! An environment is shared: closures, frames and child scopes may all
//! point at the same instance, so lifetime is the longest holder. Scopes
//! form a tree through the outer link, never a cycle in well-formed
//! programs.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::cell::Cell;
use crate::eval::EvalError;

/// Shared handle to a scope.
pub type Env = Rc<RefCell<EnvInner>>;

#[derive(Debug)]
pub struct EnvInner {
    bindings: HashMap<String, Cell>,
    outer: Option<Env>,
}

impl EnvInner {
    pub fn new() -> Env {
        Rc::new(RefCell::new(EnvInner {
            bindings: HashMap::new(),
            outer: None,
        }))
    }

    pub fn with_outer(outer: &Env) -> Env {
        Rc::new(RefCell::new(EnvInner {
            bindings: HashMap::new(),
            outer: Some(outer.clone()),
        }))
    }

    /// Fresh scope binding `params[i]` to `args[i]`, linked to `outer`.
    /// Used by lambda application; extra parameters stay unbound.
    pub fn with_bindings(params: &[Cell], args: &[Cell], outer: &Env) -> Env {
        let mut bindings = HashMap::new();
        for (param, arg) in params.iter().zip(args.iter()) {
            bindings.insert(param.text().to_string(), arg.clone());
        }
        Rc::new(RefCell::new(EnvInner {
            bindings,
            outer: Some(outer.clone()),
        }))
    }

    /// Bind in this scope only, shadowing any outer binding.
    pub fn define(&mut self, name: &str, value: Cell) {
        self.bindings.insert(name.to_string(), value);
    }

    fn binds(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }
}

/// The innermost scope binding `name`, walking the outer chain.
pub fn find(env: &Env, name: &str) -> Result<Env, EvalError> {
    if env.borrow().binds(name) {
        return Ok(env.clone());
    }
    let outer = env.borrow().outer.clone();
    match outer {
        Some(outer) => find(&outer, name),
        None => Err(EvalError::UnboundSymbol(name.to_string())),
    }
}

/// Look `name` up through the scope chain.
pub fn get(env: &Env, name: &str) -> Result<Cell, EvalError> {
    let scope = find(env, name)?;
    let cell = scope.borrow().bindings.get(name).cloned();
    cell.ok_or_else(|| EvalError::UnboundSymbol(name.to_string()))
}

/// Write through to the innermost scope that already binds `name`.
pub fn set_existing(env: &Env, name: &str, value: Cell) -> Result<(), EvalError> {
    let scope = find(env, name)?;
    scope.borrow_mut().bindings.insert(name.to_string(), value);
    Ok(())
}
