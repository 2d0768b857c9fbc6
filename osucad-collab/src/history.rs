//! Transactions and the client-local undo/redo stack.
//!
//! A transaction records, for every mutation applied while it is open,
//! the forward payload and the payload that reverses it. Entries for the
//! same object key collapse: the first inverse is kept (the state before
//! the transaction) and the forward payload is replaced by the latest one.
//!
//! Undo and redo never roll anything back. They are replayed through the
//! runtime as new forward mutations.

use std::collections::{HashMap, VecDeque};

use crate::object::{MutationPayload, ObjectId};

#[derive(Debug, Clone, PartialEq)]
pub struct TransactionEntry {
    pub target: ObjectId,
    pub redo: MutationPayload,
    pub undo: MutationPayload,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transaction {
    entries: Vec<TransactionEntry>,
    /// (target, key) → index into `entries`, for map keys only.
    keyed: HashMap<(ObjectId, String), usize>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an applied mutation together with its inverse.
    pub fn record(&mut self, target: &ObjectId, redo: MutationPayload, undo: MutationPayload) {
        match &redo {
            MutationPayload::MapSet { key, .. } | MutationPayload::MapDelete { key } => {
                let slot = (target.clone(), key.clone());
                if let Some(&index) = self.keyed.get(&slot) {
                    self.entries[index].redo = redo;
                    return;
                }
                self.keyed.insert(slot, self.entries.len());
            }
            MutationPayload::MapClear | MutationPayload::MapReplace { .. } => {
                // Later writes to this object must not fold into entries
                // recorded before the whole-object change.
                self.keyed.retain(|(t, _), _| t != target);
            }
            MutationPayload::ListInsert { .. } | MutationPayload::ListRemove { .. } => {}
        }

        self.entries.push(TransactionEntry {
            target: target.clone(),
            redo,
            undo,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[TransactionEntry] {
        &self.entries
    }

    /// Inverse mutations, in reverse entry order.
    pub fn undo_mutations(&self) -> Vec<(ObjectId, MutationPayload)> {
        self.entries
            .iter()
            .rev()
            .map(|e| (e.target.clone(), e.undo.clone()))
            .collect()
    }

    /// Forward mutations, in entry order.
    pub fn redo_mutations(&self) -> Vec<(ObjectId, MutationPayload)> {
        self.entries
            .iter()
            .map(|e| (e.target.clone(), e.redo.clone()))
            .collect()
    }
}

/// Opaque handle returned by `begin_transaction`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionHandle(pub(crate) u64);

/// Bounded undo stack plus redo stack.
#[derive(Debug, Clone)]
pub struct UndoStack {
    undo: VecDeque<Transaction>,
    redo: Vec<Transaction>,
    max_depth: usize,
}

impl UndoStack {
    pub fn new(max_depth: usize) -> Self {
        Self {
            undo: VecDeque::new(),
            redo: Vec::new(),
            max_depth: max_depth.max(1),
        }
    }

    /// Push a committed transaction and clear the redo stack.
    /// Empty transactions are ignored.
    pub fn commit(&mut self, transaction: Transaction) -> bool {
        if transaction.is_empty() {
            return false;
        }
        self.push_undo(transaction);
        self.redo.clear();
        true
    }

    pub(crate) fn push_undo(&mut self, transaction: Transaction) {
        self.undo.push_back(transaction);
        while self.undo.len() > self.max_depth {
            self.undo.pop_front();
        }
    }

    pub(crate) fn pop_undo(&mut self) -> Option<Transaction> {
        self.undo.pop_back()
    }

    pub(crate) fn push_redo(&mut self, transaction: Transaction) {
        self.redo.push(transaction);
    }

    pub(crate) fn pop_redo(&mut self) -> Option<Transaction> {
        self.redo.pop()
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    pub fn undo_len(&self) -> usize {
        self.undo.len()
    }

    pub fn redo_len(&self) -> usize {
        self.redo.len()
    }

    pub fn clear(&mut self) {
        self.undo.clear();
        self.redo.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn id(s: &str) -> ObjectId {
        ObjectId::new(s)
    }

    #[test]
    fn test_same_key_collapses_keeping_first_inverse() {
        let mut tx = Transaction::new();
        tx.record(&id("h1"), MutationPayload::set("x", 1i64), MutationPayload::set("x", 0i64));
        tx.record(&id("h1"), MutationPayload::set("x", 2i64), MutationPayload::set("x", 1i64));
        tx.record(&id("h1"), MutationPayload::set("x", 3i64), MutationPayload::set("x", 2i64));

        assert_eq!(tx.len(), 1);
        assert_eq!(tx.entries()[0].undo, MutationPayload::set("x", 0i64));
        assert_eq!(tx.entries()[0].redo, MutationPayload::set("x", 3i64));
    }

    #[test]
    fn test_different_targets_do_not_collapse() {
        let mut tx = Transaction::new();
        tx.record(&id("a"), MutationPayload::set("x", 1i64), MutationPayload::delete("x"));
        tx.record(&id("b"), MutationPayload::set("x", 1i64), MutationPayload::delete("x"));
        assert_eq!(tx.len(), 2);
    }

    #[test]
    fn test_undo_order_is_reversed() {
        let mut tx = Transaction::new();
        tx.record(&id("a"), MutationPayload::set("x", 1i64), MutationPayload::delete("x"));
        tx.record(&id("b"), MutationPayload::set("y", 1i64), MutationPayload::delete("y"));

        let undo: Vec<_> = tx.undo_mutations().into_iter().map(|(t, _)| t).collect();
        assert_eq!(undo, vec![id("b"), id("a")]);
        let redo: Vec<_> = tx.redo_mutations().into_iter().map(|(t, _)| t).collect();
        assert_eq!(redo, vec![id("a"), id("b")]);
    }

    #[test]
    fn test_clear_breaks_key_collapsing() {
        let mut tx = Transaction::new();
        tx.record(&id("m"), MutationPayload::set("k", 1i64), MutationPayload::delete("k"));
        tx.record(
            &id("m"),
            MutationPayload::MapClear,
            MutationPayload::MapReplace {
                entries: BTreeMap::new(),
            },
        );
        tx.record(&id("m"), MutationPayload::set("k", 2i64), MutationPayload::delete("k"));
        assert_eq!(tx.len(), 3);
    }

    #[test]
    fn test_stack_depth_and_redo_clearing() {
        let mut stack = UndoStack::new(2);
        for i in 0..3i64 {
            let mut tx = Transaction::new();
            tx.record(&id("a"), MutationPayload::set("x", i), MutationPayload::delete("x"));
            stack.commit(tx);
        }
        assert_eq!(stack.undo_len(), 2);

        let tx = stack.pop_undo().unwrap();
        stack.push_redo(tx);
        assert!(stack.can_redo());

        let mut tx = Transaction::new();
        tx.record(&id("a"), MutationPayload::set("y", 1i64), MutationPayload::delete("y"));
        stack.commit(tx);
        assert!(!stack.can_redo());
        assert!(!stack.commit(Transaction::new()));
    }
}
