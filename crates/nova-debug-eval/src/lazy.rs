use parking_lot::Mutex;

use crate::error::{ContractViolation, EvalResult, EvaluateError};

type Computation<A, T> = Box<dyn FnOnce(&mut A) -> EvalResult<T> + Send>;

enum State<A: ?Sized, T> {
    Pending(Computation<A, T>),
    Computing,
    Done(EvalResult<T>),
}

/// A single-shot deferred computation.
///
/// The computation runs at most once, on the first [`LazyResult::get`]. Its
/// outcome, success or failure, is cached and handed out to every later
/// caller unchanged; a failure is never retried.
///
/// `A` is the environment the computation needs (for receivers this is the
/// manager context, which only the manager thread can lend out). The lock is
/// not held while computing, so a computation that reads its own result gets
/// [`ContractViolation::ReentrantLazyResult`] instead of deadlocking.
pub struct LazyResult<A: ?Sized, T> {
    state: Mutex<State<A, T>>,
}

impl<A: ?Sized, T: Clone> LazyResult<A, T> {
    pub fn new(compute: impl FnOnce(&mut A) -> EvalResult<T> + Send + 'static) -> Self {
        Self {
            state: Mutex::new(State::Pending(Box::new(compute))),
        }
    }

    pub fn ready(value: T) -> Self {
        Self {
            state: Mutex::new(State::Done(Ok(value))),
        }
    }

    pub fn failed(err: EvaluateError) -> Self {
        Self {
            state: Mutex::new(State::Done(Err(err))),
        }
    }

    pub fn is_computed(&self) -> bool {
        matches!(*self.state.lock(), State::Done(_))
    }

    pub fn get(&self, env: &mut A) -> EvalResult<T> {
        let compute = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, State::Computing) {
                State::Done(result) => {
                    let out = result.clone();
                    *state = State::Done(result);
                    return out;
                }
                State::Computing => {
                    return Err(ContractViolation::ReentrantLazyResult.into());
                }
                State::Pending(compute) => compute,
            }
        };

        let guard = PoisonOnUnwind { lazy: self };
        let result = compute(env);
        std::mem::forget(guard);

        *self.state.lock() = State::Done(result.clone());
        result
    }
}

/// Caches [`EvaluateError::CommandPanicked`] if the computation unwinds.
struct PoisonOnUnwind<'a, A: ?Sized, T> {
    lazy: &'a LazyResult<A, T>,
}

impl<A: ?Sized, T> Drop for PoisonOnUnwind<'_, A, T> {
    fn drop(&mut self) {
        *self.lazy.state.lock() = State::Done(Err(EvaluateError::CommandPanicked));
    }
}

impl<A: ?Sized, T: std::fmt::Debug> std::fmt::Debug for LazyResult<A, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &*self.state.lock() {
            State::Pending(_) => f.write_str("LazyResult(<pending>)"),
            State::Computing => f.write_str("LazyResult(<computing>)"),
            State::Done(result) => f.debug_tuple("LazyResult").field(result).finish(),
        }
    }
}
