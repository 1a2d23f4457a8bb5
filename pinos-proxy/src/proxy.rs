// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The proxy registry (C4): per-object interface dispatch, owned by a
//! [`Context`] as a dense id-indexed table of trait objects, one per
//! bound global, since each carries its own event handlers.

use pinos_wire::id_map::IdMap;

use crate::error::Error;

/// An interface-specific event table. `dispatch_event` returns `Ok(true)`
/// on a recognized, successfully-demarshaled opcode, `Ok(false)` on a
/// recognized opcode whose body failed to parse (logged, non-fatal), and
/// `Err` for an opcode the interface does not define at all (also
/// non-fatal at this layer — logged and dropped by the caller).
pub trait ProxyObject {
    fn interface_name(&self) -> &'static str;
    fn dispatch_event(&mut self, opcode: u8, body: &[u8]) -> Result<bool, Error>;
}

/// Client-side handle to a remote object, addressed by a `u32` id.
pub struct Proxy {
    pub id: u32,
    pub type_id: u32,
    object: Box<dyn ProxyObject>,
    destroy_listeners: Vec<Box<dyn FnMut(u32)>>,
}

impl Proxy {
    pub fn new(id: u32, type_id: u32, object: Box<dyn ProxyObject>) -> Self {
        Self { id, type_id, object, destroy_listeners: Vec::new() }
    }

    pub fn interface_name(&self) -> &'static str {
        self.object.interface_name()
    }

    pub fn object_mut(&mut self) -> &mut dyn ProxyObject {
        self.object.as_mut()
    }

    /// Downcasts is intentionally not offered here: callers that need a
    /// concrete interface type keep their own side-table of ids to typed
    /// wrappers (see `pinos_proxy::core_protocol`), matching how the
    /// dispatch layer here stays interface-agnostic.
    pub fn on_destroy(&mut self, f: impl FnMut(u32) + 'static) {
        self.destroy_listeners.push(Box::new(f));
    }

    /// Dispatches one event to this proxy. Unknown opcodes and demarshal
    /// failures are logged and otherwise swallowed, per the component
    /// design: a bad event must never take down the connection.
    pub fn dispatch(&mut self, opcode: u8, body: &[u8]) {
        match self.object.dispatch_event(opcode, body) {
            Ok(true) => {}
            Ok(false) => {
                log::warn!(
                    "proxy {} ({}): event {opcode} failed to demarshal, dropping",
                    self.id,
                    self.interface_name()
                );
            }
            Err(e) => {
                log::warn!(
                    "proxy {} ({}): {e}, dropping event {opcode}",
                    self.id,
                    self.interface_name()
                );
            }
        }
    }

    /// Runs destroy listeners, emitted before the id slot is released.
    fn fire_destroy(&mut self) {
        let id = self.id;
        for listener in &mut self.destroy_listeners {
            listener(id);
        }
    }
}

/// Owns the full proxy id space for one connection (the Context ⇄ Proxy
/// cycle is broken by back-references being ids, resolved through this
/// map, never raw pointers — see SPEC_FULL.md design notes on arena
/// ownership).
#[derive(Default)]
pub struct ProxyTable {
    proxies: IdMap<Proxy>,
}

impl ProxyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, type_id: u32, object: Box<dyn ProxyObject>) -> u32 {
        // Reserve the id first so `Proxy::new` can be told its own id.
        let id = self.proxies.insert(Proxy::new(0, type_id, object));
        self.proxies.get_mut(id).unwrap().id = id;
        id
    }

    /// Inserts at a specific id (used for id 0, the core, and for ids the
    /// peer chose via `new_id` in a method call). Requires `id` to be
    /// either already free (from a prior `destroy`) or exactly the next
    /// id the map would hand out — callers choosing ids out of thin air
    /// must go through [`insert`](Self::insert) instead.
    pub fn insert_at(&mut self, id: u32, type_id: u32, object: Box<dyn ProxyObject>) -> Result<(), Error> {
        if self.proxies.contains(id) {
            return Err(Error::UnknownProxy(id));
        }
        while self.proxies.len() as u32 <= id {
            let filler = self.proxies.insert(Proxy::new(0, 0, Box::new(NullObject)));
            self.proxies.get_mut(filler).unwrap().id = filler;
        }
        let slot = self.proxies.get_mut(id).ok_or(Error::UnknownProxy(id))?;
        *slot = Proxy::new(id, type_id, object);
        Ok(())
    }

    pub fn get(&self, id: u32) -> Option<&Proxy> {
        self.proxies.get(id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut Proxy> {
        self.proxies.get_mut(id)
    }

    pub fn dispatch(&mut self, id: u32, opcode: u8, body: &[u8]) {
        match self.proxies.get_mut(id) {
            Some(proxy) => proxy.dispatch(opcode, body),
            None => log::warn!("event for unknown proxy id {id}, dropping"),
        }
    }

    /// Destroys a proxy locally (mirrors `core.remove_id` from the peer,
    /// or a local `destroy()` call): fires destroy listeners then frees
    /// the id slot.
    pub fn destroy(&mut self, id: u32) -> Result<(), Error> {
        let mut proxy = self.proxies.remove(id).ok_or(Error::UnknownProxy(id))?;
        proxy.fire_destroy();
        Ok(())
    }

    pub fn contains(&self, id: u32) -> bool {
        self.proxies.contains(id)
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }
}

struct NullObject;

impl ProxyObject for NullObject {
    fn interface_name(&self) -> &'static str {
        "null"
    }

    fn dispatch_event(&mut self, _opcode: u8, _body: &[u8]) -> Result<bool, Error> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter(u32);

    impl ProxyObject for Counter {
        fn interface_name(&self) -> &'static str {
            "counter"
        }

        fn dispatch_event(&mut self, opcode: u8, _body: &[u8]) -> Result<bool, Error> {
            match opcode {
                0 => {
                    self.0 += 1;
                    Ok(true)
                }
                1 => Ok(false),
                _ => Err(Error::UnknownProxy(99)),
            }
        }
    }

    #[test]
    fn two_live_proxies_never_share_an_id() {
        let mut table = ProxyTable::new();
        let a = table.insert(0, Box::new(Counter(0)));
        let b = table.insert(0, Box::new(Counter(0)));
        assert_ne!(a, b);
    }

    #[test]
    fn destroy_frees_id_for_reuse_and_fires_listener() {
        let mut table = ProxyTable::new();
        let a = table.insert(0, Box::new(Counter(0)));
        let fired = std::rc::Rc::new(std::cell::Cell::new(false));
        let fired2 = fired.clone();
        table.get_mut(a).unwrap().on_destroy(move |_id| fired2.set(true));
        table.destroy(a).unwrap();
        assert!(fired.get());
        assert!(!table.contains(a));

        let b = table.insert(0, Box::new(Counter(0)));
        assert_eq!(a, b);
    }

    #[test]
    fn unknown_opcode_is_logged_not_fatal() {
        let mut table = ProxyTable::new();
        let a = table.insert(0, Box::new(Counter(0)));
        table.dispatch(a, 200, &[]);
        assert!(table.contains(a));
    }

    #[test]
    fn demarshal_failure_is_logged_not_fatal() {
        let mut table = ProxyTable::new();
        let a = table.insert(0, Box::new(Counter(0)));
        table.dispatch(a, 1, &[]);
        assert!(table.contains(a));
    }

    #[test]
    fn dispatch_to_missing_proxy_is_a_noop() {
        let mut table = ProxyTable::new();
        table.dispatch(42, 0, &[]);
    }
}
