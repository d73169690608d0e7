//! Stackless frame-based evaluator
//!
//! A `Frame` is the heap-allocated replacement for a host-language call
//! frame: it can suspend between any two atomic actions and resume later.
//! Sub-computations (call arguments, lambda bodies) never recurse on the
//! host stack; they become child frames pushed onto an arena owned by the
//! `Machine`, with the parent's `subframe_mode` recording how the child's
//! result is consumed once it resolves.

use thiserror::Error;

use crate::cell::Cell;
use crate::env::{self, Env, EnvInner};
use crate::runtime::Implementation;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
    #[error("unbound symbol '{0}'")]
    UnboundSymbol(String),
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("invalid frame state: {0}")]
    InvalidFrameState(&'static str),
    #[error("division by zero")]
    DivisionByZero,
}

/// The closed set of call kinds the dispatcher distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionKind {
    Quote,
    If,
    Set,
    Define,
    Lambda,
    Begin,
    Proc,
    Invalid,
}

/// Classify an operator cell. `Proc` is chosen when the operator has
/// already been resolved to something callable.
pub fn classify(exp: &Cell) -> InstructionKind {
    match exp {
        Cell::Builtin(_) | Cell::Lambda { .. } => InstructionKind::Proc,
        Cell::Symbol(name) => match name.as_str() {
            "quote" => InstructionKind::Quote,
            "if" => InstructionKind::If,
            "set!" => InstructionKind::Set,
            "define" => InstructionKind::Define,
            "lambda" => InstructionKind::Lambda,
            "begin" => InstructionKind::Begin,
            _ => InstructionKind::Invalid,
        },
        _ => InstructionKind::Invalid,
    }
}

/// A list in argument position is a call when its operator slot holds
/// something evaluable to a procedure: a symbol, another call, or an
/// already-callable cell. Data lists (empty, or headed by a literal)
/// pass through argument resolution untouched.
fn is_call_list(items: &[Cell]) -> bool {
    match items.first() {
        Some(Cell::Symbol(_)) | Some(Cell::Builtin(_)) | Some(Cell::Lambda { .. }) => true,
        Some(Cell::List(inner)) => !inner.is_empty(),
        _ => false,
    }
}

/// How the machine consumes the result of the frame stacked above this
/// one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubframeMode {
    None,
    Argument,
    Procedure,
}

/// A suspendable evaluation record.
pub struct Frame {
    pub env: Env,
    /// Expressions evaluated in order; seeded with the program, replaced
    /// wholesale by `begin`.
    pub expressions: Vec<Cell>,
    pub exp_cursor: usize,
    /// The current expression; the operator once a call is prepared.
    pub exp: Cell,
    /// Argument expressions still to be reduced.
    pub arguments: Vec<Cell>,
    pub arg_cursor: usize,
    /// Reduced argument values. Special forms preload some slots, so this
    /// can run ahead of `arguments`.
    pub resolved_arguments: Vec<Cell>,
    /// Last produced value and the eventual return of the frame.
    pub result: Cell,
    pub resolved: bool,
    pub subframe_mode: SubframeMode,
    /// A general application queued its unresolved operator at
    /// `arguments[0]`; the dispatcher shifts the resolved operator out of
    /// `resolved_arguments[0]` before classifying.
    operator_pending: bool,
}

impl Frame {
    pub fn new(exp: Cell, env: Env) -> Result<Frame, EvalError> {
        Frame::program(vec![exp], env)
    }

    /// A frame over a whole sequence of top-level expressions.
    pub fn program(expressions: Vec<Cell>, env: Env) -> Result<Frame, EvalError> {
        let mut frame = Frame {
            env,
            expressions,
            exp_cursor: 0,
            exp: Cell::nil(),
            arguments: Vec::new(),
            arg_cursor: 0,
            resolved_arguments: Vec::new(),
            result: Cell::nil(),
            resolved: false,
            subframe_mode: SubframeMode::None,
            operator_pending: false,
        };
        match frame.expressions.first().cloned() {
            Some(first) => {
                if frame.load(first)? {
                    frame.next_expression()?;
                }
            }
            None => frame.resolved = true,
        }
        Ok(frame)
    }

    /// Load a new current expression: classify it and either reduce it on
    /// the spot or prepare its argument lists. Returns true when the
    /// expression reduced immediately.
    fn load(&mut self, exp: Cell) -> Result<bool, EvalError> {
        self.arguments.clear();
        self.resolved_arguments.clear();
        self.arg_cursor = 0;
        self.operator_pending = false;
        self.exp = exp;
        match self.exp.clone() {
            Cell::Symbol(name) => {
                self.result = env::get(&self.env, &name)?;
                Ok(true)
            }
            cell @ (Cell::Number(_) | Cell::Builtin(_) | Cell::Lambda { .. }) => {
                self.result = cell;
                Ok(true)
            }
            Cell::List(items) if items.is_empty() => {
                self.result = Cell::List(items);
                Ok(true)
            }
            Cell::List(items) => self.prepare_list(items),
        }
    }

    /// Special-form preparation and call preparation for a non-empty list
    /// expression.
    fn prepare_list(&mut self, items: Vec<Cell>) -> Result<bool, EvalError> {
        let head = match &items[0] {
            Cell::Symbol(name) => Some(name.clone()),
            _ => None,
        };
        if let Some(head) = head {
            match head.as_str() {
                // (quote exp)
                "quote" => {
                    self.result = items.get(1).cloned().unwrap_or_else(Cell::nil);
                    return Ok(true);
                }
                // (if test conseq [alt]) -- branches preloaded, the
                // resolved test lands after them
                "if" => {
                    self.exp = items[0].clone();
                    self.arguments = vec![items.get(1).cloned().unwrap_or_else(Cell::nil)];
                    self.resolved_arguments = vec![
                        items.get(2).cloned().unwrap_or_else(Cell::nil),
                        items.get(3).cloned().unwrap_or_else(Cell::nil),
                    ];
                    return Ok(false);
                }
                // (set! var exp) / (define var exp)
                "set!" | "define" => {
                    self.exp = items[0].clone();
                    self.resolved_arguments =
                        vec![items.get(1).cloned().unwrap_or_else(Cell::nil)];
                    self.arguments = vec![items.get(2).cloned().unwrap_or_else(Cell::nil)];
                    return Ok(false);
                }
                // (lambda (var*) exp) -- retype the source, capturing the
                // current environment
                "lambda" => {
                    self.result = Cell::Lambda {
                        list: items,
                        env: self.env.clone(),
                    };
                    return Ok(true);
                }
                // (begin exp*)
                "begin" => {
                    self.exp = items[0].clone();
                    self.resolved_arguments = items[1..].to_vec();
                    return Ok(false);
                }
                // (proc exp*) with a symbol operator: plain lookup now,
                // arguments reduced one step at a time
                _ => {
                    self.exp = env::get(&self.env, &head)?;
                    self.arguments = items[1..].to_vec();
                    return Ok(false);
                }
            }
        }
        // The operator is itself an expression; reduce it through the
        // argument machinery along with the arguments.
        self.exp = items[0].clone();
        self.operator_pending = true;
        self.arguments = items;
        Ok(false)
    }

    /// One atomic action: reduce one argument, spawn the sub-frame a call
    /// argument needs, or dispatch.
    fn advance(&mut self) -> Result<Option<Frame>, EvalError> {
        if self.arg_cursor < self.arguments.len() {
            let arg = self.arguments[self.arg_cursor].clone();
            match self.resolve_argument(arg)? {
                Some(child) => {
                    self.subframe_mode = SubframeMode::Argument;
                    Ok(Some(child))
                }
                None => {
                    self.arg_cursor += 1;
                    Ok(None)
                }
            }
        } else {
            self.dispatch()
        }
    }

    /// Directly reduce an argument where possible: symbols by lookup,
    /// literals, empty lists and non-call lists untouched. Only a call
    /// needs its own frame.
    fn resolve_argument(&mut self, arg: Cell) -> Result<Option<Frame>, EvalError> {
        match &arg {
            Cell::Symbol(name) => {
                let value = env::get(&self.env, name)?;
                self.resolved_arguments.push(value);
                Ok(None)
            }
            Cell::List(items) if is_call_list(items) => {
                Ok(Some(Frame::new(arg, self.env.clone())?))
            }
            _ => {
                self.resolved_arguments.push(arg);
                Ok(None)
            }
        }
    }

    /// All arguments resolved: run the step procedure for the call kind.
    /// Returns the sub-frame when a lambda body was installed.
    fn dispatch(&mut self) -> Result<Option<Frame>, EvalError> {
        if self.operator_pending {
            if self.resolved_arguments.is_empty() {
                return Err(EvalError::InvalidFrameState(
                    "operator missing from resolved arguments",
                ));
            }
            self.exp = self.resolved_arguments.remove(0);
            self.operator_pending = false;
        }
        match classify(&self.exp) {
            InstructionKind::If => self.dispatch_if().map(|_| None),
            InstructionKind::Set => self.dispatch_set().map(|_| None),
            InstructionKind::Define => self.dispatch_define().map(|_| None),
            InstructionKind::Begin => self.dispatch_begin().map(|_| None),
            InstructionKind::Proc => self.dispatch_proc(),
            // Quote and Lambda reduce at load time; anything reaching the
            // dispatcher with those kinds, or unclassifiable, is not
            // applicable.
            _ => Err(EvalError::InvalidOperation(format!(
                "cannot apply {}",
                self.exp
            ))),
        }
    }

    /// (if test conseq alt): resolved arguments are [conseq, alt, test].
    /// A compound branch replaces the current expression in place, so
    /// `if` in tail position reuses this frame.
    fn dispatch_if(&mut self) -> Result<(), EvalError> {
        if self.resolved_arguments.len() < 3 {
            return Err(EvalError::InvalidFrameState(
                "if dispatched before its test resolved",
            ));
        }
        let test = self.resolved_arguments[2].clone();
        let chosen = if test.text() == "#t" {
            self.resolved_arguments[0].clone()
        } else {
            self.resolved_arguments[1].clone()
        };
        match &chosen {
            Cell::Symbol(name) => {
                self.result = env::get(&self.env, name)?;
                self.next_expression()
            }
            Cell::List(items) if !items.is_empty() => {
                if self.load(chosen.clone())? {
                    self.next_expression()?;
                }
                Ok(())
            }
            _ => {
                self.result = chosen;
                self.next_expression()
            }
        }
    }

    /// (set! var exp): mutate the innermost existing binding.
    fn dispatch_set(&mut self) -> Result<(), EvalError> {
        let (var, value) = self.assignment_operands()?;
        env::set_existing(&self.env, var.text(), value.clone())?;
        self.result = value;
        self.next_expression()
    }

    /// (define var exp): create or shadow in the current scope.
    fn dispatch_define(&mut self) -> Result<(), EvalError> {
        let (var, value) = self.assignment_operands()?;
        self.env.borrow_mut().define(var.text(), value.clone());
        self.result = value;
        self.next_expression()
    }

    fn assignment_operands(&self) -> Result<(Cell, Cell), EvalError> {
        if self.resolved_arguments.len() < 2 {
            return Err(EvalError::InvalidFrameState(
                "assignment dispatched before its value resolved",
            ));
        }
        Ok((
            self.resolved_arguments[0].clone(),
            self.resolved_arguments[1].clone(),
        ))
    }

    /// (begin e1 ... en): the preloaded argument list becomes the
    /// expression list and the frame re-enters on the first entry, so
    /// `begin` never grows the frame stack.
    fn dispatch_begin(&mut self) -> Result<(), EvalError> {
        if self.resolved_arguments.is_empty() {
            self.result = Cell::nil();
            return self.next_expression();
        }
        self.expressions = std::mem::take(&mut self.resolved_arguments);
        self.exp_cursor = 0;
        let first = self.expressions[0].clone();
        if self.load(first)? {
            self.next_expression()?;
        }
        Ok(())
    }

    /// Apply the operator in `exp` to the resolved arguments.
    fn dispatch_proc(&mut self) -> Result<Option<Frame>, EvalError> {
        match self.exp.clone() {
            Cell::Builtin(proc) => {
                self.result = proc(&self.resolved_arguments)?;
                self.next_expression()?;
                Ok(None)
            }
            Cell::Lambda { list, env } => {
                let params = list.get(1).cloned().unwrap_or_else(Cell::nil);
                let body = list.get(2).cloned().unwrap_or_else(Cell::nil);
                let call_env = match &params {
                    // A single-symbol parameter receives every argument
                    // as one list.
                    Cell::Symbol(_) => EnvInner::with_bindings(
                        std::slice::from_ref(&params),
                        &[Cell::List(self.resolved_arguments.clone())],
                        &env,
                    ),
                    _ => EnvInner::with_bindings(params.items(), &self.resolved_arguments, &env),
                };
                self.subframe_mode = SubframeMode::Procedure;
                Ok(Some(Frame::new(body, call_env)?))
            }
            other => Err(EvalError::InvalidOperation(format!(
                "cannot apply {}",
                other
            ))),
        }
    }

    /// Move to the next expression, or mark the frame resolved with the
    /// last result. Immediately-reducible expressions are consumed here.
    fn next_expression(&mut self) -> Result<(), EvalError> {
        loop {
            if self.exp_cursor + 1 >= self.expressions.len() {
                self.resolved = true;
                return Ok(());
            }
            self.exp_cursor += 1;
            let next = self.expressions[self.exp_cursor].clone();
            if !self.load(next)? {
                return Ok(());
            }
        }
    }
}

/// An environment paired with the frame arena for one program: the thing
/// a micro-thread owns and steps.
pub struct Machine {
    env: Env,
    /// Frame stack. `frames[0]` is the top-level frame; the last entry is
    /// the innermost active sub-frame.
    frames: Vec<Frame>,
}

impl Machine {
    pub fn new(expressions: Vec<Cell>, env: Env) -> Result<Machine, EvalError> {
        let top = Frame::program(expressions, env.clone())?;
        Ok(Machine {
            env,
            frames: vec![top],
        })
    }

    pub fn env(&self) -> &Env {
        &self.env
    }

    /// The top-level frame; its result is the program's result.
    pub fn current_frame(&self) -> &Frame {
        &self.frames[0]
    }

    /// Number of live frames. Evaluation depth lives here on the heap,
    /// never on the host stack.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_resolved(&self) -> bool {
        self.frames.len() == 1 && self.frames[0].resolved
    }

    pub fn result(&self) -> Cell {
        self.frames[0].result.clone()
    }

    /// One atomic action: consume a resolved child into its parent, or
    /// advance the innermost frame. Returns true iff work was done.
    pub fn step(&mut self) -> Result<bool, EvalError> {
        if self.is_resolved() {
            return Ok(false);
        }
        let top = self.frames.len() - 1;
        if self.frames[top].resolved {
            // Child return: hand the innermost frame's result to its
            // parent according to the recorded mode.
            let child = match self.frames.pop() {
                Some(child) => child,
                None => return Err(EvalError::InvalidFrameState("empty frame arena")),
            };
            let parent = match self.frames.last_mut() {
                Some(parent) => parent,
                None => {
                    return Err(EvalError::InvalidFrameState(
                        "resolved sub-frame without a parent",
                    ))
                }
            };
            match parent.subframe_mode {
                SubframeMode::Argument => {
                    parent.resolved_arguments.push(child.result);
                    parent.arg_cursor += 1;
                    parent.subframe_mode = SubframeMode::None;
                }
                SubframeMode::Procedure => {
                    parent.result = child.result;
                    parent.subframe_mode = SubframeMode::None;
                    parent.next_expression()?;
                }
                SubframeMode::None => {
                    return Err(EvalError::InvalidFrameState(
                        "sub-frame resolved with no consumption mode",
                    ))
                }
            }
        } else if let Some(child) = self.frames[top].advance()? {
            self.frames.push(child);
        }
        Ok(true)
    }

    /// Drive to completion. Hosts that want metered execution go through
    /// the scheduler instead.
    pub fn run(&mut self) -> Result<Cell, EvalError> {
        while self.step()? {}
        Ok(self.result())
    }
}

impl Implementation for Machine {
    type Value = Cell;
    type Error = EvalError;

    fn is_resolved(&self) -> bool {
        Machine::is_resolved(self)
    }

    fn step(&mut self) -> Result<bool, EvalError> {
        Machine::step(self)
    }

    fn result(&self) -> Cell {
        Machine::result(self)
    }
}
