// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The server-side global registry: every object a client can `bind()`
//! to, announced via `registry.global` events as clients subscribe
//! (SPEC_FULL.md §4.1/§6).

use pinos_wire::id_map::IdMap;

#[derive(Clone, Debug)]
pub struct Global {
    pub type_name: String,
    pub version: u32,
}

#[derive(Default)]
pub struct GlobalRegistry {
    globals: IdMap<Global>,
}

impl GlobalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, type_name: impl Into<String>, version: u32) -> u32 {
        self.globals.insert(Global { type_name: type_name.into(), version })
    }

    pub fn remove(&mut self, id: u32) -> Option<Global> {
        self.globals.remove(id)
    }

    pub fn get(&self, id: u32) -> Option<&Global> {
        self.globals.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &Global)> {
        self.globals.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn added_globals_are_enumerable_and_removable() {
        let mut reg = GlobalRegistry::new();
        let id = reg.add("Node", 3);
        assert_eq!(reg.iter().count(), 1);
        assert_eq!(reg.get(id).unwrap().type_name, "Node");
        reg.remove(id);
        assert_eq!(reg.iter().count(), 0);
    }
}
