//! Execution-context stack.
//!
//! Tracks the stack of open span IDs for one logical execution unit so the
//! client can answer "what is the current parent span". Two storage
//! bindings sit behind one facade and behave identically from the caller's
//! perspective:
//!
//! - a `tokio::task_local!` slot keyed by task identity, consulted first,
//!   so context travels with the logical task rather than whichever worker
//!   thread resumes it;
//! - a `thread_local!` slot keyed by the literal thread of control, used
//!   when no task scope has been established.
//!
//! Stacks are created lazily on first use and discarded with their unit.
//! Pops must mirror pushes in LIFO order; anything else is a contract
//! violation surfaced as [`TraceError::ContextViolation`] rather than a
//! silent desync.

use std::cell::RefCell;
use std::future::Future;

use crate::error::{Result, TraceError};
use crate::span::SpanId;

tokio::task_local! {
    static TASK_STACK: RefCell<Vec<SpanId>>;
}

thread_local! {
    static THREAD_STACK: RefCell<Vec<SpanId>> = const { RefCell::new(Vec::new()) };
}

/// Run a closure against the current unit's stack.
///
/// The task binding wins when present; otherwise the thread binding is
/// used. No cross-unit locking is needed since each stack belongs to
/// exactly one unit.
fn with_stack<T>(f: impl FnOnce(&mut Vec<SpanId>) -> T) -> T {
    let mut f = Some(f);
    match TASK_STACK.try_with(|cell| (f.take().unwrap())(&mut cell.borrow_mut())) {
        Ok(value) => value,
        Err(_) => THREAD_STACK.with(|cell| (f.take().unwrap())(&mut cell.borrow_mut())),
    }
}

/// Push a span ID onto the current unit's stack.
pub fn push(id: SpanId) {
    with_stack(|stack| stack.push(id));
}

/// Pop and return the top of the current unit's stack.
///
/// Popping an empty stack is a contract violation: callers must only pop
/// what they pushed, in LIFO order.
pub fn pop() -> Result<SpanId> {
    with_stack(|stack| {
        stack.pop().ok_or_else(|| {
            TraceError::ContextViolation("pop on empty context stack".to_string())
        })
    })
}

/// Pop the top of the stack, verifying it is the expected span.
///
/// Rejects out-of-LIFO finishes without mutating the stack, so a single
/// misbehaving caller cannot corrupt parent linkage for the rest of the
/// unit.
pub fn pop_expected(expected: &SpanId) -> Result<SpanId> {
    with_stack(|stack| match stack.last() {
        Some(top) if top == expected => Ok(stack.pop().unwrap()),
        Some(top) => Err(TraceError::ContextViolation(format!(
            "out-of-order finish: expected {} on top of the context stack, found {}",
            expected, top
        ))),
        None => Err(TraceError::ContextViolation(format!(
            "finish of {} with an empty context stack",
            expected
        ))),
    })
}

/// Return the top of the current unit's stack without mutation.
pub fn peek() -> Option<SpanId> {
    with_stack(|stack| stack.last().cloned())
}

/// Number of open spans on the current unit's stack.
pub fn depth() -> usize {
    with_stack(|stack| stack.len())
}

/// Clone the current unit's stack.
pub(crate) fn stack_snapshot() -> Vec<SpanId> {
    with_stack(|stack| stack.clone())
}

/// Push a span ID and return a guard that pops it on every exit path.
///
/// The guard restores the exact previous top on drop, whether the scope
/// exits by return, panic, or cancellation.
pub fn scoped(id: SpanId) -> StackGuard {
    push(id.clone());
    StackGuard {
        id,
        released: false,
    }
}

/// Run a future inside a fresh task-local stack seeded with a snapshot of
/// the caller's stack.
///
/// The spawned work sees the context established by its logical caller
/// (its spans parent correctly) while remaining fully isolated: pushes and
/// pops inside the scope are never observable outside it.
///
/// The snapshot is taken when `scope` is called, not when the returned
/// future is first polled, so the future can be handed to `tokio::spawn`
/// and still carry its caller's context.
pub fn scope<F>(fut: F) -> impl Future<Output = F::Output>
where
    F: Future,
{
    let snapshot = stack_snapshot();
    TASK_STACK.scope(RefCell::new(snapshot), fut)
}

/// RAII guard returned by [`scoped`].
#[derive(Debug)]
pub struct StackGuard {
    id: SpanId,
    released: bool,
}

impl StackGuard {
    /// The span ID this guard holds on the stack.
    pub fn id(&self) -> &SpanId {
        &self.id
    }

    /// Pop eagerly, consuming the guard and reporting violations.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        pop_expected(&self.id).map(|_| ())
    }
}

impl Drop for StackGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = pop_expected(&self.id) {
            tracing::error!(span_id = %self.id, error = %e, "context stack corrupted on scope exit");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> SpanId {
        SpanId::from_string(s)
    }

    #[test]
    fn test_push_pop_peek() {
        assert!(peek().is_none());

        push(id("a"));
        push(id("b"));
        assert_eq!(peek(), Some(id("b")));
        assert_eq!(depth(), 2);

        assert_eq!(pop().unwrap(), id("b"));
        assert_eq!(pop().unwrap(), id("a"));
        assert!(peek().is_none());
    }

    #[test]
    fn test_pop_empty_is_violation() {
        let err = pop().unwrap_err();
        assert!(matches!(err, TraceError::ContextViolation(_)));
    }

    #[test]
    fn test_pop_expected_rejects_out_of_order() {
        push(id("outer"));
        push(id("inner"));

        let err = pop_expected(&id("outer")).unwrap_err();
        assert!(matches!(err, TraceError::ContextViolation(_)));
        // Stack unchanged after the rejected pop.
        assert_eq!(peek(), Some(id("inner")));

        pop_expected(&id("inner")).unwrap();
        pop_expected(&id("outer")).unwrap();
    }

    #[test]
    fn test_scoped_guard_pops_on_drop() {
        push(id("outer"));
        {
            let _guard = scoped(id("inner"));
            assert_eq!(peek(), Some(id("inner")));
        }
        assert_eq!(peek(), Some(id("outer")));
        pop().unwrap();
    }

    #[test]
    fn test_scoped_guard_pops_on_panic() {
        push(id("outer"));
        let result = std::panic::catch_unwind(|| {
            let _guard = scoped(id("inner"));
            panic!("boom");
        });
        assert!(result.is_err());
        assert_eq!(peek(), Some(id("outer")));
        pop().unwrap();
    }

    #[test]
    fn test_release_reports_violation() {
        let guard = scoped(id("a"));
        push(id("b"));

        let err = guard.release().unwrap_err();
        assert!(matches!(err, TraceError::ContextViolation(_)));

        pop().unwrap();
        pop().unwrap();
    }

    #[tokio::test]
    async fn test_scope_seeds_caller_stack() {
        scope(async {
            push(id("parent"));
            let seen = scope(async { peek() }).await;
            assert_eq!(seen, Some(id("parent")));
            // Inner scope's pushes never leaked back.
            assert_eq!(depth(), 1);
            pop().unwrap();
        })
        .await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_task_isolation() {
        let a = tokio::spawn(scope(async {
            push(id("task-a"));
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            let top = peek();
            pop().unwrap();
            top
        }));
        let b = tokio::spawn(scope(async {
            push(id("task-b"));
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            let top = peek();
            pop().unwrap();
            top
        }));

        assert_eq!(a.await.unwrap(), Some(id("task-a")));
        assert_eq!(b.await.unwrap(), Some(id("task-b")));
    }
}
