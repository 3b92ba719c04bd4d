// function.rs - A named computation and its function-level schedule
//
// A function is undefined until it has a pure definition or an extern
// definition. Stage 0 is the pure definition; stages 1..=N are the updates,
// run in order for every point of the pure domain.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::id::FuncId;
use crate::ir::Type;

use super::definition::Definition;
use super::schedule::FuncSchedule;

/// A function produced by one call to an external routine.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternDefinition {
    pub routine: String,
    pub args: Vec<crate::ir::Expr>,
}

/// Which loads, stores and realizations of a function emit trace events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TraceFlags {
    pub loads: bool,
    pub stores: bool,
    pub realizations: bool,
}

impl TraceFlags {
    pub fn any(&self) -> bool {
        self.loads || self.stores || self.realizations
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub id: FuncId,
    pub name: String,
    /// Pure argument names, outermost storage dim last.
    pub args: Vec<String>,
    pub output_types: Vec<Type>,
    pub init: Option<Definition>,
    pub updates: Vec<Definition>,
    pub extern_def: Option<ExternDefinition>,
    pub schedule: FuncSchedule,
    /// Consumer name (empty for "every consumer") to wrapper function name.
    pub wrappers: BTreeMap<String, String>,
    pub trace: TraceFlags,
}

impl Function {
    pub fn new(id: FuncId, name: impl Into<String>) -> Self {
        Function {
            id,
            name: name.into(),
            args: Vec::new(),
            output_types: Vec::new(),
            init: None,
            updates: Vec::new(),
            extern_def: None,
            schedule: FuncSchedule::default(),
            wrappers: BTreeMap::new(),
            trace: TraceFlags::default(),
        }
    }

    pub fn is_defined(&self) -> bool {
        self.init.is_some() || self.extern_def.is_some()
    }

    pub fn is_extern(&self) -> bool {
        self.extern_def.is_some()
    }

    pub fn has_updates(&self) -> bool {
        !self.updates.is_empty()
    }

    pub fn dimensions(&self) -> usize {
        self.args.len()
    }

    pub fn is_tuple(&self) -> bool {
        self.output_types.len() > 1
    }

    pub fn stage_count(&self) -> usize {
        if self.is_defined() {
            1 + self.updates.len()
        } else {
            0
        }
    }

    /// `f.s2` for stage 2 of `f`.
    pub fn stage_name(&self, stage: usize) -> String {
        format!("{}.s{}", self.name, stage)
    }

    pub fn definition(&self, stage: usize) -> Option<&Definition> {
        if stage == 0 {
            self.init.as_ref()
        } else {
            self.updates.get(stage - 1)
        }
    }

    pub fn definition_mut(&mut self, stage: usize) -> Option<&mut Definition> {
        if stage == 0 {
            self.init.as_mut()
        } else {
            self.updates.get_mut(stage - 1)
        }
    }

    /// Every definition, pure first.
    pub fn definitions(&self) -> impl Iterator<Item = &Definition> {
        self.init.iter().chain(self.updates.iter())
    }

    pub fn definitions_mut(&mut self) -> impl Iterator<Item = &mut Definition> {
        self.init.iter_mut().chain(self.updates.iter_mut())
    }

    /// Has any schedule directive been applied to this function or one of
    /// its stages?
    pub fn is_scheduled(&self) -> bool {
        self.schedule.touched || self.definitions().any(|d| d.schedule.touched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Expr;

    #[test]
    fn stages_follow_definitions() {
        let mut f = Function::new(FuncId(0), "f");
        assert!(!f.is_defined());
        assert_eq!(f.stage_count(), 0);
        f.args = vec!["x".into()];
        f.init = Some(Definition::new(true, vec![Expr::var("x")], vec![Expr::int(0)]));
        f.updates.push(Definition::new(false, vec![Expr::var("x")], vec![Expr::int(1)]));
        assert_eq!(f.stage_count(), 2);
        assert_eq!(f.stage_name(1), "f.s1");
        assert!(f.definition(1).is_some());
        assert!(f.definition(2).is_none());
    }
}
