// The Id -> (type, handle) map (L5's `map`).
//
// dvz-slots' `Container` gives a block-sparse store keyed by an
// internally-minted `Entity`; here the key is a caller-supplied
// opaque u64 (spec 3.1), so entity auto-allocation doesn't fit. This
// is a dedicated `HashMap`-backed table instead, with the same idea
// dvz-slots uses of pairing a status field with every stored value.

use crate::error::{DvzError, Result};
use crate::request::ObjectType;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

pub type Id = u64;

/// `none < alloc < init < created < {need_recreate,need_update,need_destroy} < destroyed`
/// (3.5). The three `need_*` members are mutually exclusive states at
/// the same rank, not a strict total order past `created`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[allow(non_camel_case_types)]
pub enum ObjectStatus {
    None = 0,
    Alloc = 1,
    Init = 2,
    Created = 3,
    NeedRecreate = 4,
    NeedUpdate = 4,
    NeedDestroy = 4,
    Destroyed = 5,
}

/// Opaque handle stored behind an `Id`. The renderer is the sole owner
/// of the Vulkan-backed object any of these indices addresses; every
/// other component only ever holds the `Id`.
#[derive(Debug, Clone, Copy)]
pub enum Handle {
    /// Index into `Renderer::canvases`/`boards`.
    Canvas(usize),
    Board(usize),
    /// Index into `Renderer::dats`.
    Dat(usize),
    Tex(usize),
    Sampler(usize),
    Graphics(usize),
    Compute(usize),
    Shader(usize),
    Slots(usize),
    Descriptors(usize),
}

struct Slot {
    object_type: ObjectType,
    status: ObjectStatus,
    handle: Handle,
}

/// Id -> (ObjectType, handle) map with O(1) expected lookup (3.1).
/// Touched from the renderer thread only (5, "Shared mutable state").
pub struct IdMap {
    slots: HashMap<Id, Slot>,
    next_auto: AtomicU64,
}

impl IdMap {
    pub fn new() -> Self {
        IdMap {
            slots: HashMap::new(),
            // Ids start at 1; 0 is reserved for "none/auto" (3.1).
            next_auto: AtomicU64::new(1),
        }
    }

    /// Mints a fresh id for a `create` request with `id == 0` (4.2
    /// edge policy: auto-create must assign a fresh id).
    pub fn allocate_id(&self) -> Id {
        loop {
            let candidate = self.next_auto.fetch_add(1, Ordering::Relaxed);
            if candidate != 0 && !self.slots.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    /// Unconditionally overwrites whatever slot `id` held. Callers that
    /// reuse an id already present in the map are responsible for
    /// tearing down its previous handle first (`Renderer::reap_existing`
    /// does this ahead of every `Create`) -- this map has no way to
    /// destroy a Vulkan resource itself.
    pub fn insert(&mut self, id: Id, object_type: ObjectType, handle: Handle) {
        self.slots.insert(
            id,
            Slot {
                object_type,
                status: ObjectStatus::Created,
                handle,
            },
        );
    }

    pub fn get(&self, id: Id) -> Result<(ObjectType, Handle)> {
        self.slots
            .get(&id)
            .map(|s| (s.object_type, s.handle))
            .ok_or(DvzError::InvalidId(id))
    }

    pub fn get_typed(&self, id: Id, expected: ObjectType) -> Result<Handle> {
        let (object_type, handle) = self.get(id)?;
        if object_type != expected {
            return Err(DvzError::InvalidId(id));
        }
        Ok(handle)
    }

    pub fn status(&self, id: Id) -> Option<ObjectStatus> {
        self.slots.get(&id).map(|s| s.status)
    }

    pub fn set_status(&mut self, id: Id, status: ObjectStatus) {
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.status = status;
        }
    }

    /// Marks an id as queued for destruction (4.2: `delete` does not
    /// destroy synchronously). The slot is removed from the map only
    /// once the renderer actually frees the underlying resource at
    /// the next safe point.
    pub fn mark_need_destroy(&mut self, id: Id) {
        self.set_status(id, ObjectStatus::NeedDestroy);
    }

    pub fn remove(&mut self, id: Id) -> Option<Handle> {
        self.slots.remove(&id).map(|s| s.handle)
    }

    pub fn contains(&self, id: Id) -> bool {
        self.slots.contains_key(&id)
    }

    pub fn iter_by_type(&self, object_type: ObjectType) -> impl Iterator<Item = (Id, Handle)> + '_ {
        self.slots.iter().filter_map(move |(id, s)| {
            if s.object_type == object_type {
                Some((*id, s.handle))
            } else {
                None
            }
        })
    }
}

impl Default for IdMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_id_skips_zero_and_taken() {
        let map = IdMap::new();
        let a = map.allocate_id();
        let b = map.allocate_id();
        assert_ne!(a, 0);
        assert_ne!(b, 0);
        assert_ne!(a, b);
    }

    #[test]
    fn insert_then_get_roundtrips() {
        let mut map = IdMap::new();
        map.insert(7, ObjectType::Canvas, Handle::Canvas(3));
        let (object_type, handle) = map.get(7).unwrap();
        assert_eq!(object_type, ObjectType::Canvas);
        assert!(matches!(handle, Handle::Canvas(3)));
        assert_eq!(map.status(7), Some(ObjectStatus::Created));
    }

    #[test]
    fn get_unknown_id_is_invalid() {
        let map = IdMap::new();
        assert!(matches!(map.get(42), Err(DvzError::InvalidId(42))));
    }

    #[test]
    fn get_typed_rejects_wrong_type() {
        let mut map = IdMap::new();
        map.insert(1, ObjectType::Tex, Handle::Tex(0));
        assert!(map.get_typed(1, ObjectType::Tex).is_ok());
        assert!(matches!(
            map.get_typed(1, ObjectType::Canvas),
            Err(DvzError::InvalidId(1))
        ));
    }

    #[test]
    fn mark_need_destroy_then_remove() {
        let mut map = IdMap::new();
        map.insert(1, ObjectType::Dat, Handle::Dat(0));
        map.mark_need_destroy(1);
        assert_eq!(map.status(1), Some(ObjectStatus::NeedDestroy));
        assert!(map.remove(1).is_some());
        assert!(!map.contains(1));
    }

    #[test]
    fn iter_by_type_filters() {
        let mut map = IdMap::new();
        map.insert(1, ObjectType::Tex, Handle::Tex(0));
        map.insert(2, ObjectType::Canvas, Handle::Canvas(0));
        map.insert(3, ObjectType::Tex, Handle::Tex(1));

        let texes: Vec<Id> = map.iter_by_type(ObjectType::Tex).map(|(id, _)| id).collect();
        assert_eq!(texes.len(), 2);
        assert!(texes.contains(&1));
        assert!(texes.contains(&3));
    }
}
