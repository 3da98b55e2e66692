//! Context-level error scopes.
//!
//! Errors raised by builders, compiles and computes of a context are offered to the innermost
//! scope whose filter matches; unmatched errors go to the uncaptured-error callback. Internal
//! errors and device loss are fatal: every open scope records them and the callback still sees
//! them.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, WebnnError, WebnnResult};

/// Class of errors an error scope captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorFilter {
    Validation,
    Lowering,
    Execution,
}

impl ErrorFilter {
    fn captures(self, err: &WebnnError) -> bool {
        matches!(
            (self, err.kind()),
            (ErrorFilter::Validation, ErrorKind::Validation)
                | (ErrorFilter::Lowering, ErrorKind::Lowering)
                | (ErrorFilter::Execution, ErrorKind::Execution)
        )
    }
}

fn is_fatal(err: &WebnnError) -> bool {
    err.kind() == ErrorKind::Internal || err.is_device_lost()
}

pub type ErrorCallback = Box<dyn FnMut(&WebnnError) + Send>;

struct ErrorScope {
    filter: ErrorFilter,
    /// First error captured; later ones are dropped.
    error: Option<WebnnError>,
}

#[derive(Default)]
struct ScopeStack {
    scopes: Vec<ErrorScope>,
    uncaptured: Option<ErrorCallback>,
}

/// Shared handle to a context's error scope stack.
#[derive(Clone, Default)]
pub struct ErrorReporter {
    stack: Arc<Mutex<ScopeStack>>,
}

impl ErrorReporter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ScopeStack> {
        self.stack.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push_scope(&self, filter: ErrorFilter) {
        self.lock().scopes.push(ErrorScope {
            filter,
            error: None,
        });
    }

    /// Closes the innermost scope and returns the first error it captured.
    pub fn pop_scope(&self) -> WebnnResult<Option<WebnnError>> {
        self.lock()
            .scopes
            .pop()
            .map(|scope| scope.error)
            .ok_or_else(|| WebnnError::validation("no error scope to pop"))
    }

    pub fn depth(&self) -> usize {
        self.lock().scopes.len()
    }

    pub fn set_uncaptured_callback(&self, callback: Option<ErrorCallback>) {
        self.lock().uncaptured = callback;
    }

    /// Routes `err` to the scope stack.
    pub fn report(&self, err: &WebnnError) {
        let fatal = is_fatal(err);
        let mut callback = {
            let mut stack = self.lock();
            for scope in stack.scopes.iter_mut().rev() {
                if !fatal && !scope.filter.captures(err) {
                    continue;
                }
                if scope.error.is_none() {
                    scope.error = Some(err.clone());
                }
                if !fatal {
                    debug!("error captured by {:?} scope: {err}", scope.filter);
                    return;
                }
            }
            match stack.uncaptured.take() {
                Some(callback) => callback,
                None => {
                    debug!("uncaptured error without a callback: {err}");
                    return;
                }
            }
        };
        // The lock is released so the callback may use the context.
        callback(err);
        let mut stack = self.lock();
        if stack.uncaptured.is_none() {
            stack.uncaptured = Some(callback);
        }
    }

    /// Reports the error of `result`, if any, and passes the result through.
    pub fn observe<T>(&self, result: WebnnResult<T>) -> WebnnResult<T> {
        if let Err(err) = &result {
            self.report(err);
        }
        result
    }
}
