use std::panic::Location;
use std::sync::{Mutex, MutexGuard};

use crate::mock::MockVm;

/// Lock the shared mock VM, recovering it if a scripted handler panicked
/// while holding it.
///
/// The poison flag is cleared after recovery so one failing test handler is
/// reported once instead of on every later call against the same VM.
#[track_caller]
pub(crate) fn lock_vm<'a>(vm: &'a Mutex<MockVm>, operation: &'static str) -> MutexGuard<'a, MockVm> {
    match vm.lock() {
        Ok(guard) => guard,
        Err(err) => {
            let loc = Location::caller();
            tracing::error!(
                target = "nova.jdwp",
                operation,
                file = loc.file(),
                line = loc.line(),
                "mock VM poisoned by a panicking handler; continuing with its last state"
            );
            vm.clear_poison();
            err.into_inner()
        }
    }
}
