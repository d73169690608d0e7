//! Property tests for the runtime invariants
//!
//! - reader/printer round-trip over generated cells
//! - cycle budget bounds on scheduler passes
//! - host-stack independence from program recursion depth

use std::convert::Infallible;

use proptest::prelude::*;

use skein::cell::Cell;
use skein::reader::read;
use skein::runtime::{Implementation, Scheduler};
use skein::test_support::{global_env, run_stackless};

// ============================================================================
// Generators
// ============================================================================

/// Reader-producible cells: symbols, numbers, and lists of them.
fn arb_cell(depth: u32) -> BoxedStrategy<Cell> {
    if depth == 0 {
        prop_oneof![
            "[a-z][a-z?!*+<=>-]{0,6}".prop_map(Cell::Symbol),
            any::<i64>().prop_map(|n| Cell::Number(n.to_string())),
        ]
        .boxed()
    } else {
        prop_oneof![
            3 => arb_cell(0),
            1 => prop::collection::vec(arb_cell(depth - 1), 0..4).prop_map(Cell::List),
        ]
        .boxed()
    }
}

proptest! {
    #[test]
    fn read_print_round_trip(cell in arb_cell(3)) {
        let printed = cell.to_string();
        let reread = read(&printed).unwrap();
        prop_assert_eq!(reread, cell);
    }
}

// ============================================================================
// Cycle budget
// ============================================================================

/// Busy-loops forever, counting its steps.
struct Spinner {
    steps: u32,
}

impl Implementation for Spinner {
    type Value = u32;
    type Error = Infallible;

    fn is_resolved(&self) -> bool {
        false
    }

    fn step(&mut self) -> Result<bool, Infallible> {
        self.steps += 1;
        Ok(true)
    }

    fn result(&self) -> u32 {
        self.steps
    }
}

proptest! {
    #[test]
    fn a_pass_spends_exactly_the_budget_on_a_busy_thread(cycles in 1u32..50) {
        let mut scheduler = Scheduler::new();
        let id = scheduler.start(cycles, |_| Spinner { steps: 0 });
        scheduler.watch(id);

        scheduler.execute_threads().unwrap();
        let after_one = scheduler.thread(id).unwrap().result();
        // A runnable thread takes at least one step and at most `cycles`.
        prop_assert!(after_one >= 1);
        prop_assert!(after_one <= cycles);

        scheduler.execute_threads().unwrap();
        let after_two = scheduler.thread(id).unwrap().result();
        prop_assert!(after_two - after_one <= cycles);
    }
}

// ============================================================================
// Stacklessness
// ============================================================================

#[test]
fn recursion_depth_lives_on_the_heap() {
    // A 10000-deep non-tail recursion would overflow the test thread's
    // host stack if evaluation recursed; here it only grows the frame
    // arena.
    let env = global_env();
    let program = "(define depth (lambda (n) (if (<= n 0) 0 (+ 1 (depth (- n 1)))))) \
                   (depth 10000)";
    let result = run_stackless(program, &env).unwrap();
    assert_eq!(result.to_string(), "10000");
}

#[test]
fn deep_recursion_in_metered_slices() {
    // The same shape still completes when execution is chopped into
    // single-step scheduler passes.
    use skein::eval::Machine;
    use skein::reader::read_all;
    use skein::runtime::Threading;

    let program = "(define depth (lambda (n) (if (<= n 0) 0 (+ 1 (depth (- n 1)))))) \
                   (depth 500)";
    let machine = Machine::new(read_all(program).unwrap(), global_env()).unwrap();
    let mut scheduler = Scheduler::new();
    let id = scheduler.start(1, move |_| machine);
    scheduler.run_to_completion(id, Threading::Single).unwrap();
    assert_eq!(scheduler.thread(id).unwrap().result().to_string(), "500");
}
