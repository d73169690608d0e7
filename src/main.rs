//! Skein CLI - REPL and file execution

use std::env;
use std::fs;
use std::io::{self, BufRead, Write};

use skein::builtins::install_globals;
use skein::cell::Cell;
use skein::env::{Env, EnvInner};
use skein::eval::Machine;
use skein::reader::read_all;
use skein::runtime::{Scheduler, Threading, CYCLES_MED};

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() > 1 {
        // Run a file
        run_file(&args[1]);
    } else {
        // Start REPL
        repl();
    }
}

fn run_file(path: &str) {
    let source = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error reading file: {}", e);
            return;
        }
    };

    let global = EnvInner::new();
    install_globals(&global);
    match eval_source(&source, &global) {
        Ok(result) => println!("{}", result),
        Err(e) => eprintln!("{}", e),
    }
}

/// Evaluate a chunk of source on a fresh scheduler thread against the
/// given global environment.
fn eval_source(source: &str, global: &Env) -> Result<Cell, String> {
    let forms = read_all(source).map_err(|e| format!("read error: {}", e))?;
    if forms.is_empty() {
        return Ok(Cell::nil());
    }
    let machine =
        Machine::new(forms, global.clone()).map_err(|e| format!("eval error: {}", e))?;

    let mut scheduler: Scheduler<Machine> = Scheduler::new();
    let id = scheduler.start(CYCLES_MED, move |_| machine);
    scheduler
        .run_to_completion(id, Threading::Single)
        .map_err(|e| format!("eval error: {}", e))?;
    let result = scheduler
        .thread(id)
        .map(|thread| thread.result())
        .unwrap_or_else(Cell::nil);
    scheduler.remove_thread(id);
    Ok(result)
}

fn repl() {
    println!("skein v0.1.0 - :quit to exit");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    let global = EnvInner::new();
    install_globals(&global);

    loop {
        print!("> ");
        stdout.flush().unwrap();

        let mut line = String::new();
        if stdin.lock().read_line(&mut line).unwrap() == 0 {
            break;
        }

        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == ":quit" || line == ":q" {
            break;
        }

        match eval_source(line, &global) {
            Ok(result) => println!("{}", result),
            Err(e) => eprintln!("{}", e),
        }
    }

    println!("Goodbye!");
}
