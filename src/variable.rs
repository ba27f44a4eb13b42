// Copyright 2026 The Worksheet Engine Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! Named mutable cells.  Every assignment bumps a generation counter;
//! compiled programs remember the generations they were built against
//! and recompile on mismatch, which replaces change-notification
//! callbacks with a cheap stamp comparison.

use std::cell::RefCell;
use std::rc::Rc;

use crate::common::Result;
use crate::math_err;
use crate::value::Value;

#[derive(Debug)]
pub struct Variable {
    value: Option<Value>,
    generation: u64,
}

pub type VarCell = Rc<RefCell<Variable>>;

impl Variable {
    pub fn empty() -> VarCell {
        Rc::new(RefCell::new(Variable {
            value: None,
            generation: 0,
        }))
    }

    pub fn with_value(value: Value) -> VarCell {
        Rc::new(RefCell::new(Variable {
            value: Some(value),
            generation: 1,
        }))
    }

    pub fn is_assigned(&self) -> bool {
        self.value.is_some()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn get(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn value(&self, name: &str) -> Result<Value> {
        match self.value {
            Some(ref v) => Ok(v.clone()),
            None => math_err!(UndefinedVariable, "undefined variable: '{name}'"),
        }
    }

    pub fn assign(&mut self, value: Value) {
        self.value = Some(value);
        self.generation += 1;
    }

    /// Take the current value out, keeping the stamp; used by the
    /// per-statement backup slot.
    pub fn replace(&mut self, value: Option<Value>) -> Option<Value> {
        self.generation += 1;
        std::mem::replace(&mut self.value, value)
    }
}

/// Holds the assignment target's prior value for the current statement
/// so a failing statement can roll it back.
#[derive(Default)]
pub struct Backup {
    slot: Option<(VarCell, Option<Value>)>,
}

impl Backup {
    pub fn record(&mut self, cell: &VarCell) {
        let prior = cell.borrow().value.clone();
        self.slot = Some((Rc::clone(cell), prior));
    }

    pub fn restore(&mut self) {
        if let Some((cell, prior)) = self.slot.take() {
            cell.borrow_mut().replace(prior);
        }
    }

    pub fn clear(&mut self) {
        self.slot = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn generations_bump_on_assignment() {
        let cell = Variable::empty();
        assert_eq!(cell.borrow().generation(), 0);
        assert!(cell.borrow().value("x").is_err());
        cell.borrow_mut().assign(Value::real(1.0));
        assert_eq!(cell.borrow().generation(), 1);
        cell.borrow_mut().assign(Value::real(2.0));
        assert_eq!(cell.borrow().generation(), 2);
    }

    #[test]
    fn backup_restores_prior_value() {
        let cell = Variable::with_value(Value::real(1.0));
        let mut backup = Backup::default();
        backup.record(&cell);
        cell.borrow_mut().assign(Value::real(99.0));
        backup.restore();
        assert_eq!(cell.borrow().value("x").unwrap(), Value::real(1.0));
    }

    #[test]
    fn backup_restores_unassigned_state() {
        let cell = Variable::empty();
        let mut backup = Backup::default();
        backup.record(&cell);
        cell.borrow_mut().assign(Value::real(5.0));
        backup.restore();
        assert!(!cell.borrow().is_assigned());
    }
}
