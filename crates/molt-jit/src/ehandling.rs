//! Exception handler management
//!
//! Compile-time model of nested try/except/finally scopes. All handlers
//! for one compilation live in a `HandlerArena`; parent references are
//! plain indices (strictly up-tree, never ownership), and handler 0 is the
//! synthetic root whose raise/reraise labels terminate the function with
//! an error return.

use crate::compiler::stack::StackEntryKind;
use crate::il::{IlLocal, Label};

/// The IL locals a handler saves the previous exception state into.
#[derive(Debug, Clone, Copy)]
pub struct ExcVars {
    pub prev_exc: IlLocal,
    pub prev_val: IlLocal,
    pub prev_tb: IlLocal,
}

/// One compile-time exception handler.
#[derive(Debug)]
pub struct ExceptionHandler {
    pub id: usize,
    pub vars: ExcVars,
    /// Error paths inside the protected region branch here.
    pub raise_label: Label,
    /// Propagation past this handler branches here.
    pub reraise_label: Label,
    /// Entry of the handler body (None for the root).
    pub handler_label: Option<Label>,
    /// Operand-stack shape at the setup site; non-local exits unwind the
    /// stack down to this depth.
    pub stack_snapshot: Vec<StackEntryKind>,
    pub in_try_finally: bool,
    pub in_except_handler: bool,
    /// Enclosing handler (None only for the root).
    pub parent: Option<usize>,
}

/// Arena owning every handler of one compilation.
#[derive(Debug, Default)]
pub struct HandlerArena {
    handlers: Vec<ExceptionHandler>,
}

impl HandlerArena {
    pub fn new() -> HandlerArena {
        HandlerArena::default()
    }

    /// Install handler 0. Must be the first handler registered.
    pub fn set_root_handler(
        &mut self,
        raise_label: Label,
        reraise_label: Label,
        vars: ExcVars,
    ) -> usize {
        debug_assert!(self.handlers.is_empty(), "root handler must come first");
        self.handlers.push(ExceptionHandler {
            id: 0,
            vars,
            raise_label,
            reraise_label,
            handler_label: None,
            stack_snapshot: Vec::new(),
            in_try_finally: false,
            in_except_handler: false,
            parent: None,
        });
        0
    }

    /// Register the handler for a `SetupFinally` site.
    #[allow(clippy::too_many_arguments)]
    pub fn add_setup_finally_handler(
        &mut self,
        raise_label: Label,
        reraise_label: Label,
        handler_label: Label,
        stack_snapshot: Vec<StackEntryKind>,
        parent: usize,
        vars: ExcVars,
    ) -> usize {
        let id = self.handlers.len();
        self.handlers.push(ExceptionHandler {
            id,
            vars,
            raise_label,
            reraise_label,
            handler_label: Some(handler_label),
            stack_snapshot,
            in_try_finally: true,
            in_except_handler: false,
            parent: Some(parent),
        });
        id
    }

    /// Register the handler active inside an except clause (raises there
    /// must restore the previous exception state before propagating).
    #[allow(clippy::too_many_arguments)]
    pub fn add_in_try_handler(
        &mut self,
        raise_label: Label,
        reraise_label: Label,
        handler_label: Label,
        stack_snapshot: Vec<StackEntryKind>,
        parent: usize,
        vars: ExcVars,
        in_try_finally: bool,
    ) -> usize {
        let id = self.handlers.len();
        self.handlers.push(ExceptionHandler {
            id,
            vars,
            raise_label,
            reraise_label,
            handler_label: Some(handler_label),
            stack_snapshot,
            in_try_finally,
            in_except_handler: true,
            parent: Some(parent),
        });
        id
    }

    pub fn root(&self) -> &ExceptionHandler {
        &self.handlers[0]
    }

    pub fn get(&self, id: usize) -> &ExceptionHandler {
        &self.handlers[id]
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn handlers(&self) -> &[ExceptionHandler] {
        &self.handlers
    }

    /// Chain of handler ids from `id` up to (excluding) the root.
    pub fn chain(&self, mut id: usize) -> Vec<usize> {
        let mut out = Vec::new();
        while let Some(parent) = self.handlers[id].parent {
            out.push(id);
            id = parent;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::il::{IlLocal, Label};

    fn vars(base: u32) -> ExcVars {
        ExcVars {
            prev_exc: IlLocal(base),
            prev_val: IlLocal(base + 1),
            prev_tb: IlLocal(base + 2),
        }
    }

    #[test]
    fn test_root_then_nested() {
        let mut arena = HandlerArena::new();
        let root = arena.set_root_handler(Label(0), Label(1), vars(0));
        assert_eq!(root, 0);
        assert!(arena.root().parent.is_none());
        assert!(!arena.root().in_try_finally);

        let h1 = arena.add_setup_finally_handler(
            Label(2),
            Label(3),
            Label(4),
            vec![StackEntryKind::Object],
            root,
            vars(3),
        );
        let h2 = arena.add_in_try_handler(
            Label(5),
            Label(6),
            Label(4),
            Vec::new(),
            root,
            vars(3),
            true,
        );
        assert_eq!(arena.len(), 3);
        assert!(arena.get(h1).in_try_finally);
        assert!(!arena.get(h1).in_except_handler);
        assert!(arena.get(h2).in_except_handler);
        assert!(arena.get(h2).in_try_finally);
        assert_eq!(arena.get(h1).stack_snapshot.len(), 1);
    }

    #[test]
    fn test_chain_walks_to_root() {
        let mut arena = HandlerArena::new();
        arena.set_root_handler(Label(0), Label(1), vars(0));
        let a = arena.add_setup_finally_handler(Label(2), Label(3), Label(4), vec![], 0, vars(3));
        let b = arena.add_setup_finally_handler(Label(5), Label(6), Label(7), vec![], a, vars(6));
        assert_eq!(arena.chain(b), vec![b, a]);
        assert_eq!(arena.chain(0), Vec::<usize>::new());
    }
}
