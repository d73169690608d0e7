//! Builtin procedures for the Scheme instantiation
//!
//! Numbers live as text in their cells; arithmetic parses them as base-10
//! signed integers and re-stringifies the result. Unparsable text folds
//! as 0. The comparison builtins hold the first element against each
//! subsequent one.

use crate::cell::Cell;
use crate::env::Env;
use crate::eval::EvalError;

fn num(cell: &Cell) -> i64 {
    cell.text().parse().unwrap_or(0)
}

fn fold(args: &[Cell], op: impl Fn(i64, i64) -> i64) -> i64 {
    match args.split_first() {
        Some((first, rest)) => rest.iter().fold(num(first), |acc, c| op(acc, num(c))),
        None => 0,
    }
}

fn compare_first(args: &[Cell], keep: impl Fn(i64, i64) -> bool) -> Cell {
    let (first, rest) = match args.split_first() {
        Some(parts) => parts,
        None => return Cell::t(),
    };
    let n = num(first);
    for arg in rest {
        if !keep(n, num(arg)) {
            return Cell::f();
        }
    }
    Cell::t()
}

pub fn add(args: &[Cell]) -> Result<Cell, EvalError> {
    Ok(Cell::Number(fold(args, |a, b| a + b).to_string()))
}

pub fn sub(args: &[Cell]) -> Result<Cell, EvalError> {
    Ok(Cell::Number(fold(args, |a, b| a - b).to_string()))
}

pub fn mul(args: &[Cell]) -> Result<Cell, EvalError> {
    let product = args.iter().fold(1i64, |acc, c| acc * num(c));
    Ok(Cell::Number(product.to_string()))
}

pub fn div(args: &[Cell]) -> Result<Cell, EvalError> {
    let (first, rest) = match args.split_first() {
        Some(parts) => parts,
        None => return Ok(Cell::Number("0".to_string())),
    };
    let mut n = num(first);
    for arg in rest {
        let divisor = num(arg);
        if divisor == 0 {
            return Err(EvalError::DivisionByZero);
        }
        n /= divisor;
    }
    Ok(Cell::Number(n.to_string()))
}

pub fn greater(args: &[Cell]) -> Result<Cell, EvalError> {
    Ok(compare_first(args, |a, b| a > b))
}

pub fn less(args: &[Cell]) -> Result<Cell, EvalError> {
    Ok(compare_first(args, |a, b| a < b))
}

pub fn less_equal(args: &[Cell]) -> Result<Cell, EvalError> {
    Ok(compare_first(args, |a, b| a <= b))
}

pub fn list(args: &[Cell]) -> Result<Cell, EvalError> {
    Ok(Cell::List(args.to_vec()))
}

pub fn head(args: &[Cell]) -> Result<Cell, EvalError> {
    let items = args.first().map(Cell::items).unwrap_or(&[]);
    Ok(items.first().cloned().unwrap_or_else(Cell::nil))
}

pub fn tail(args: &[Cell]) -> Result<Cell, EvalError> {
    let items = args.first().map(Cell::items).unwrap_or(&[]);
    if items.len() < 2 {
        return Ok(Cell::nil());
    }
    Ok(Cell::List(items[1..].to_vec()))
}

pub fn cons(args: &[Cell]) -> Result<Cell, EvalError> {
    let mut items = Vec::new();
    if let Some(first) = args.first() {
        items.push(first.clone());
    }
    if let Some(second) = args.get(1) {
        items.extend(second.items().iter().cloned());
    }
    Ok(Cell::List(items))
}

pub fn append(args: &[Cell]) -> Result<Cell, EvalError> {
    let mut items: Vec<Cell> = args
        .first()
        .map(|c| c.items().to_vec())
        .unwrap_or_default();
    if let Some(second) = args.get(1) {
        items.extend(second.items().iter().cloned());
    }
    Ok(Cell::List(items))
}

pub fn length(args: &[Cell]) -> Result<Cell, EvalError> {
    let len = args.first().map(|c| c.items().len()).unwrap_or(0);
    Ok(Cell::Number(len.to_string()))
}

pub fn null_p(args: &[Cell]) -> Result<Cell, EvalError> {
    let empty = args.first().map(|c| c.items().is_empty()).unwrap_or(true);
    Ok(Cell::truth(empty))
}

/// Bind the primitive procedures and the canonical symbols into `env`.
pub fn install_globals(env: &Env) {
    let mut env = env.borrow_mut();
    env.define("nil", Cell::nil());
    env.define("#f", Cell::f());
    env.define("#t", Cell::t());
    env.define("+", Cell::Builtin(add));
    env.define("-", Cell::Builtin(sub));
    env.define("*", Cell::Builtin(mul));
    env.define("/", Cell::Builtin(div));
    env.define(">", Cell::Builtin(greater));
    env.define("<", Cell::Builtin(less));
    env.define("<=", Cell::Builtin(less_equal));
    env.define("list", Cell::Builtin(list));
    env.define("head", Cell::Builtin(head));
    env.define("tail", Cell::Builtin(tail));
    env.define("cons", Cell::Builtin(cons));
    env.define("append", Cell::Builtin(append));
    env.define("length", Cell::Builtin(length));
    env.define("null?", Cell::Builtin(null_p));
}
