// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The per-connection `u32 -> interned string` type table. Append-only and
//! monotonic: once an id is assigned a name it keeps it for the life of
//! the connection (Testable Property #2).

use std::collections::HashMap;

use crate::error::Error;

#[derive(Default)]
pub struct TypeMap {
    names: Vec<String>,
    lookup: HashMap<String, u32>,
}

impl TypeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `names` starting at `first_id`. `first_id` must equal the
    /// next unused id (the table cannot have gaps or be rewritten).
    pub fn announce(&mut self, first_id: u32, names: &[String]) -> Result<(), Error> {
        let expected = self.names.len() as u32;
        if first_id != expected {
            return Err(Error::TypeMapNotContiguous { expected, got: first_id });
        }
        for name in names {
            let id = self.names.len() as u32;
            self.names.push(name.clone());
            self.lookup.insert(name.clone(), id);
        }
        Ok(())
    }

    pub fn id_of(&self, name: &str) -> Option<u32> {
        self.lookup.get(name).copied()
    }

    pub fn name_of(&self, id: u32) -> Option<&str> {
        self.names.get(id as usize).map(String::as_str)
    }

    pub fn next_id(&self) -> u32 {
        self.names.len() as u32
    }

    /// All known `(id, name)` pairs, for re-announcing to a peer.
    pub fn all(&self) -> impl Iterator<Item = (u32, &str)> {
        self.names.iter().enumerate().map(|(i, n)| (i as u32, n.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announce_assigns_ids_in_order() {
        let mut m = TypeMap::new();
        m.announce(0, &["Core".into(), "Registry".into()]).unwrap();
        assert_eq!(m.id_of("Core"), Some(0));
        assert_eq!(m.id_of("Registry"), Some(1));
        assert_eq!(m.name_of(0), Some("Core"));
    }

    #[test]
    fn non_contiguous_announce_rejected() {
        let mut m = TypeMap::new();
        m.announce(0, &["Core".into()]).unwrap();
        assert!(m.announce(5, &["Registry".into()]).is_err());
    }

    #[test]
    fn names_never_change_once_assigned() {
        let mut m = TypeMap::new();
        m.announce(0, &["Core".into()]).unwrap();
        m.announce(1, &["Registry".into(), "Node".into()]).unwrap();
        assert_eq!(m.name_of(0), Some("Core"));
        assert_eq!(m.name_of(1), Some("Registry"));
        assert_eq!(m.name_of(2), Some("Node"));
    }
}
