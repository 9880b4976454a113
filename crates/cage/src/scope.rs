use anyhow::anyhow;

use crate::handle::Handle;

enum Disposable {
    Handle(Handle),
    Custom(Box<dyn FnOnce()>),
}

/// A stack-discipline owner of disposables.
///
/// Everything managed by a scope is released in reverse registration order
/// when the scope closes. Closing is idempotent, and `Drop` closes the scope
/// if its owner did not, so disposal runs on every exit path - success,
/// failure, and cancellation of an enclosing future.
pub struct Scope {
    items: Vec<Disposable>,
    closed: bool,
}

impl Scope {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            closed: false,
        }
    }

    /// Register a handle for disposal at scope close. The scope takes its own
    /// owner of the value; the handle passed in is returned to the caller
    /// untouched.
    pub fn manage(&mut self, handle: Handle) -> anyhow::Result<Handle> {
        if self.closed {
            return Err(anyhow!("manage() on a closed scope"));
        }
        self.items.push(Disposable::Handle(handle.dup()));
        Ok(handle)
    }

    /// Register an arbitrary disposal action, run at scope close.
    pub fn defer(&mut self, f: impl FnOnce() + 'static) -> anyhow::Result<()> {
        if self.closed {
            return Err(anyhow!("defer() on a closed scope"));
        }
        self.items.push(Disposable::Custom(Box::new(f)));
        Ok(())
    }

    /// Dispose everything managed by this scope, in LIFO order. Closing an
    /// already-closed scope is a no-op.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        while let Some(item) = self.items.pop() {
            match item {
                Disposable::Handle(mut h) => h.dispose(),
                Disposable::Custom(f) => f(),
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Run `body` against a fresh scope, closing it on both the success and
    /// the failure path before propagating the result.
    pub fn enter<R>(body: impl FnOnce(&mut Scope) -> anyhow::Result<R>) -> anyhow::Result<R> {
        let mut scope = Scope::new();
        let result = body(&mut scope);
        scope.close();
        result
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        cell::RefCell,
        rc::Rc,
    };

    use super::Scope;

    #[test]
    fn test_lifo_disposal_order() -> anyhow::Result<()> {
        let order = Rc::new(RefCell::new(Vec::new()));
        let mut scope = Scope::new();
        for i in 0..3 {
            let order = order.clone();
            scope.defer(move || order.borrow_mut().push(i))?;
        }
        scope.close();
        assert_eq!(*order.borrow(), vec![2, 1, 0]);
        Ok(())
    }

    #[test]
    fn test_close_is_idempotent() -> anyhow::Result<()> {
        let count = Rc::new(RefCell::new(0));
        let mut scope = Scope::new();
        {
            let count = count.clone();
            scope.defer(move || *count.borrow_mut() += 1)?;
        }
        scope.close();
        scope.close();
        assert_eq!(*count.borrow(), 1);
        Ok(())
    }

    #[test]
    fn test_manage_after_close_fails() {
        let mut scope = Scope::new();
        scope.close();
        assert!(scope.defer(|| ()).is_err());
    }

    #[test]
    fn test_drop_disposes() -> anyhow::Result<()> {
        let count = Rc::new(RefCell::new(0));
        {
            let mut scope = Scope::new();
            let count = count.clone();
            scope.defer(move || *count.borrow_mut() += 1)?;
        }
        assert_eq!(*count.borrow(), 1);
        Ok(())
    }

    #[test]
    fn test_enter_closes_on_failure() {
        let count = Rc::new(RefCell::new(0));
        let result: anyhow::Result<()> = Scope::enter(|scope| {
            let count = count.clone();
            scope.defer(move || *count.borrow_mut() += 1)?;
            anyhow::bail!("boom")
        });
        assert!(result.is_err());
        assert_eq!(*count.borrow(), 1);
    }
}
