// scope.rs - Name-keyed stack of bindings
//
// Used by passes that track what an enclosing binder says about a name
// (an interval, a widened replacement, ...). Pushing a name that is already
// bound shadows the older binding until the matching pop.

use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct Scope<T> {
    table: BTreeMap<String, Vec<T>>,
}

impl<T> Default for Scope<T> {
    fn default() -> Self {
        Scope {
            table: BTreeMap::new(),
        }
    }
}

impl<T> Scope<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: T) {
        self.table.entry(name.into()).or_default().push(value);
    }

    pub fn pop(&mut self, name: &str) -> Option<T> {
        let stack = self.table.get_mut(name)?;
        let v = stack.pop();
        if stack.is_empty() {
            self.table.remove(name);
        }
        v
    }

    pub fn get(&self, name: &str) -> Option<&T> {
        self.table.get(name).and_then(|s| s.last())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.table.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}
