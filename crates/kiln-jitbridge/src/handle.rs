//! Handle arena: opaque boundary identities for entities
//!
//! The backend only ever sees fixed-width opaque handles; the arena owns
//! the bidirectional mapping back to entities. Within one compilation the
//! mapping is a lazily-populated, append-only bijection — handles are
//! never reused or freed mid-compilation.
//!
//! Handles are a monotone counter encoded into a reserved tag range that
//! no real allocation can occupy, so a backend crash with a corrupted
//! handle is distinguishable from a real pointer.

use rustc_hash::FxHashMap;

use kiln_types::Entity;

/// Bit pattern marking the reserved handle range
const HANDLE_TAG: u64 = 0x4B00_0000_0000_0000;
/// Mask selecting the tag byte
const HANDLE_TAG_MASK: u64 = 0xFF00_0000_0000_0000;
/// Handles advance in pointer-width strides within the range
const HANDLE_SHIFT: u32 = 3;

/// Opaque fixed-width reference to an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u64);

impl Handle {
    fn from_index(index: usize) -> Handle {
        Handle(HANDLE_TAG | ((index as u64) << HANDLE_SHIFT))
    }

    fn index(self) -> usize {
        ((self.0 & !HANDLE_TAG_MASK) >> HANDLE_SHIFT) as usize
    }

    /// The raw bits exchanged with the backend
    pub fn raw(self) -> u64 {
        self.0
    }

    /// Reinterpret raw bits as a handle if they carry the reserved tag.
    /// A tagged value may still be a forgery; [`HandleArena::entity`]
    /// rejects anything this arena never issued.
    pub fn from_raw(raw: u64) -> Option<Handle> {
        if raw & HANDLE_TAG_MASK == HANDLE_TAG {
            Some(Handle(raw))
        } else {
            None
        }
    }
}

/// A pinned byte buffer with a stable address for the duration of the
/// compilation
#[derive(Debug, Clone, Copy)]
pub struct PinnedSlice {
    /// Stable address of the first byte
    pub addr: usize,
    /// Length in bytes
    pub len: usize,
    /// Pin index within the current compilation
    pub index: u32,
}

/// Per-compilation entity/handle bijection plus pinned buffers
pub struct HandleArena {
    entities: Vec<Entity>,
    index: FxHashMap<Entity, Handle>,
    pins: Vec<Box<[u8]>>,
}

impl HandleArena {
    pub fn new() -> Self {
        HandleArena {
            entities: Vec::new(),
            index: FxHashMap::default(),
            pins: Vec::new(),
        }
    }

    /// Map an entity to its handle, issuing a fresh one on first sight.
    /// Idempotent; never fails.
    pub fn to_handle(&mut self, entity: Entity) -> Handle {
        if let Some(&h) = self.index.get(&entity) {
            return h;
        }
        let h = Handle::from_index(self.entities.len());
        self.entities.push(entity);
        self.index.insert(entity, h);
        h
    }

    /// Map a handle back to its entity.
    ///
    /// # Panics
    ///
    /// Panics if the handle was never issued by this arena — a
    /// programming-contract violation by the backend, not a recoverable
    /// condition.
    pub fn entity(&self, handle: Handle) -> Entity {
        match self.try_entity(handle) {
            Some(e) => e,
            None => panic!(
                "handle {:#018x} was not issued by this arena",
                handle.raw()
            ),
        }
    }

    /// Non-panicking lookup, for callers that can reject bad input
    pub fn try_entity(&self, handle: Handle) -> Option<Entity> {
        if handle.raw() & HANDLE_TAG_MASK != HANDLE_TAG {
            return None;
        }
        self.entities.get(handle.index()).copied()
    }

    /// Number of handles issued so far
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Pin a byte buffer at a stable address until cleanup
    pub fn pin_bytes(&mut self, bytes: Vec<u8>) -> PinnedSlice {
        let boxed = bytes.into_boxed_slice();
        let slice = PinnedSlice {
            addr: boxed.as_ptr() as usize,
            len: boxed.len(),
            index: self.pins.len() as u32,
        };
        self.pins.push(boxed);
        slice
    }

    /// The pin whose byte range contains `addr`, if any
    pub fn find_pin(&self, addr: usize) -> Option<u32> {
        self.pins.iter().position(|p| {
            let base = p.as_ptr() as usize;
            addr >= base && addr < base + p.len()
        }).map(|i| i as u32)
    }

    /// Number of live pins
    pub fn pin_count(&self) -> usize {
        self.pins.len()
    }

    /// Release every mapping and pin; the arena is ready for the next
    /// compilation.
    pub fn reset(&mut self) {
        self.entities.clear();
        self.index.clear();
        self.pins.clear();
    }
}

impl Default for HandleArena {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_types::{MetadataStore, MethodFlags, PrimitiveKind};

    #[test]
    fn test_bijection_and_idempotence() {
        let store = MetadataStore::new(8);
        let mut arena = HandleArena::new();
        let e1 = Entity::Type(store.well_known().object);
        let e2 = Entity::Type(store.well_known().string);

        let h1 = arena.to_handle(e1);
        let h2 = arena.to_handle(e2);
        assert_ne!(h1, h2);
        assert_eq!(arena.to_handle(e1), h1);
        assert_eq!(arena.entity(h1), e1);
        assert_eq!(arena.entity(h2), e2);
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn test_distinct_kinds_distinct_handles() {
        let mut store = MetadataStore::new(8);
        let object = store.well_known().object;
        let void = store.primitive(PrimitiveKind::Void);
        let m = store.add_method(object, "M", vec![], void, MethodFlags::default(), 0);

        let mut arena = HandleArena::new();
        let t = Entity::Type(object);
        let me = Entity::Method(m);
        assert_ne!(arena.to_handle(t), arena.to_handle(me));
    }

    #[test]
    fn test_tag_range() {
        let store = MetadataStore::new(8);
        let mut arena = HandleArena::new();
        let h = arena.to_handle(Entity::Type(store.well_known().object));
        assert_eq!(h.raw() & HANDLE_TAG_MASK, HANDLE_TAG);
        assert_eq!(Handle::from_raw(h.raw()), Some(h));
        assert_eq!(Handle::from_raw(0x7fff_1234_5678), None);
    }

    #[test]
    #[should_panic(expected = "was not issued by this arena")]
    fn test_forged_handle_panics() {
        let arena = HandleArena::new();
        arena.entity(Handle(HANDLE_TAG | 0x40));
    }

    #[test]
    fn test_pins() {
        let mut arena = HandleArena::new();
        let pin = arena.pin_bytes(vec![1, 2, 3, 4]);
        assert_eq!(pin.len, 4);
        assert_eq!(arena.find_pin(pin.addr), Some(0));
        assert_eq!(arena.find_pin(pin.addr + 3), Some(0));
        assert_eq!(arena.find_pin(pin.addr + 4), None);
        assert_eq!(arena.pin_count(), 1);

        arena.reset();
        assert_eq!(arena.pin_count(), 0);
        assert!(arena.is_empty());
    }
}
