//! Test support: a conventional recursive evaluator used as a
//! correctness oracle, plus program-running helpers shared by the test
//! suites.
//!
//! The oracle recurses on the host stack the way a textbook interpreter
//! does. The stackless machine must agree with it on every closed
//! program, which gives the suites a second, independently-written answer
//! for each case.

use crate::builtins::install_globals;
use crate::cell::Cell;
use crate::env::{self, Env, EnvInner};
use crate::eval::{EvalError, Machine};
use crate::reader::read_all;

/// A fresh global environment with the builtins installed.
pub fn global_env() -> Env {
    let env = EnvInner::new();
    install_globals(&env);
    env
}

/// The reference evaluator: plain recursion, no frames.
pub fn oracle_eval(exp: &Cell, env: &Env) -> Result<Cell, EvalError> {
    match exp {
        Cell::Symbol(name) => env::get(env, name),
        Cell::Number(_) => Ok(exp.clone()),
        Cell::List(items) if items.is_empty() => Ok(Cell::nil()),
        Cell::List(items) => oracle_eval_list(items, env),
        other => Ok(other.clone()),
    }
}

fn oracle_eval_list(items: &[Cell], env: &Env) -> Result<Cell, EvalError> {
    if let Cell::Symbol(head) = &items[0] {
        match head.as_str() {
            "quote" => return Ok(items.get(1).cloned().unwrap_or_else(Cell::nil)),
            "if" => {
                // The oracle treats anything that is not #f as true.
                let test = oracle_eval(&items[1], env)?;
                let chosen = if test.text() == "#f" {
                    items.get(3).cloned().unwrap_or_else(Cell::nil)
                } else {
                    items.get(2).cloned().unwrap_or_else(Cell::nil)
                };
                return oracle_eval(&chosen, env);
            }
            "set!" => {
                let value = oracle_eval(&items[2], env)?;
                env::set_existing(env, items[1].text(), value.clone())?;
                return Ok(value);
            }
            "define" => {
                let value = oracle_eval(&items[2], env)?;
                env.borrow_mut().define(items[1].text(), value.clone());
                return Ok(value);
            }
            "lambda" => {
                return Ok(Cell::Lambda {
                    list: items.to_vec(),
                    env: env.clone(),
                })
            }
            "begin" => {
                let mut result = Cell::nil();
                for item in &items[1..] {
                    result = oracle_eval(item, env)?;
                }
                return Ok(result);
            }
            _ => {}
        }
    }
    let proc = oracle_eval(&items[0], env)?;
    let mut args = Vec::with_capacity(items.len() - 1);
    for item in &items[1..] {
        args.push(oracle_eval(item, env)?);
    }
    match proc {
        Cell::Builtin(proc) => proc(&args),
        Cell::Lambda { list, env: captured } => {
            let params = list.get(1).cloned().unwrap_or_else(Cell::nil);
            let body = list.get(2).cloned().unwrap_or_else(Cell::nil);
            let call_env = match &params {
                Cell::Symbol(_) => EnvInner::with_bindings(
                    std::slice::from_ref(&params),
                    &[Cell::List(args)],
                    &captured,
                ),
                _ => EnvInner::with_bindings(params.items(), &args, &captured),
            };
            oracle_eval(&body, &call_env)
        }
        other => Err(EvalError::InvalidOperation(format!(
            "cannot apply {}",
            other
        ))),
    }
}

/// Parse a whole program and run it on the stackless machine.
pub fn run_stackless(source: &str, env: &Env) -> Result<Cell, String> {
    let forms = read_all(source).map_err(|e| format!("read error: {}", e))?;
    let mut machine =
        Machine::new(forms, env.clone()).map_err(|e| format!("eval error: {}", e))?;
    machine.run().map_err(|e| format!("eval error: {}", e))
}

/// Parse a whole program and run it through the recursive oracle,
/// returning the last form's result.
pub fn run_oracle(source: &str, env: &Env) -> Result<Cell, String> {
    let forms = read_all(source).map_err(|e| format!("read error: {}", e))?;
    let mut result = Cell::nil();
    for form in &forms {
        result = oracle_eval(form, env).map_err(|e| format!("eval error: {}", e))?;
    }
    Ok(result)
}
