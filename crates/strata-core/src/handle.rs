//! Typed generational handles.
//!
//! A handle is an opaque `u64`: the low 32 bits hold `slot index + 1` and the
//! high 32 bits hold the slot generation. The raw value 0 is reserved as
//! [`Handle::INVALID`]. Generations are bumped every time a slot is freed, so a
//! handle that outlives its resource never aliases the next occupant.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Resource kind tag carried by a [`Handle`].
pub trait ResourceKind: 'static {
    /// Human-readable kind name used in logs.
    const NAME: &'static str;
}

/// Marker types for every kind of handle the device hands out.
pub mod kind {
    use super::ResourceKind;

    /// Shader-resource, unordered-access, render-target or depth-stencil view.
    #[derive(Debug)]
    pub enum View {}

    /// Buffer backed by a persistent sub-allocation or a dedicated region.
    #[derive(Debug)]
    pub enum Buffer {}

    /// Texture with dedicated backing storage.
    #[derive(Debug)]
    pub enum Texture {}

    /// Pipeline state object (created outside the lifetime core).
    #[derive(Debug)]
    pub enum Pipeline {}

    impl ResourceKind for View {
        const NAME: &'static str = "view";
    }

    impl ResourceKind for Buffer {
        const NAME: &'static str = "buffer";
    }

    impl ResourceKind for Texture {
        const NAME: &'static str = "texture";
    }

    impl ResourceKind for Pipeline {
        const NAME: &'static str = "pipeline";
    }
}

/// Opaque, kind-tagged reference to a slot in a [`HandleArena`](crate::HandleArena).
#[repr(transparent)]
pub struct Handle<K> {
    raw: u64,
    _kind: PhantomData<fn() -> K>,
}

/// Handle to a view.
pub type ViewHandle = Handle<kind::View>;
/// Handle to a buffer.
pub type BufferHandle = Handle<kind::Buffer>;
/// Handle to a texture.
pub type TextureHandle = Handle<kind::Texture>;
/// Handle to a pipeline.
pub type PipelineHandle = Handle<kind::Pipeline>;

impl<K> Handle<K> {
    /// The reserved invalid handle.
    pub const INVALID: Self = Self::from_raw(0);

    /// Reinterpret a raw value as a handle.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self {
            raw,
            _kind: PhantomData,
        }
    }

    #[inline]
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self::from_raw(((generation as u64) << 32) | (index as u64 + 1))
    }

    /// Raw encoded value.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.raw
    }

    /// Returns true for the reserved zero handle.
    #[inline]
    #[must_use]
    pub const fn is_invalid(self) -> bool {
        self.raw as u32 == 0
    }

    /// Dense slot index, or `None` for the invalid handle.
    ///
    /// Descriptor tables use this index as the descriptor position.
    #[inline]
    #[must_use]
    pub const fn index(self) -> Option<u32> {
        match self.raw as u32 {
            0 => None,
            n => Some(n - 1),
        }
    }

    /// Generation the slot had when this handle was issued.
    #[inline]
    #[must_use]
    pub const fn generation(self) -> u32 {
        (self.raw >> 32) as u32
    }
}

impl<K> Clone for Handle<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K> Copy for Handle<K> {}

impl<K> PartialEq for Handle<K> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<K> Eq for Handle<K> {}

impl<K> Hash for Handle<K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl<K> Default for Handle<K> {
    fn default() -> Self {
        Self::INVALID
    }
}

impl<K: ResourceKind> fmt::Debug for Handle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index() {
            Some(index) => write!(f, "{}({}v{})", K::NAME, index, self.generation()),
            None => write!(f, "{}(invalid)", K::NAME),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_invalid() {
        let handle = ViewHandle::default();
        assert!(handle.is_invalid());
        assert_eq!(handle.index(), None);
        assert_eq!(handle, ViewHandle::INVALID);
    }

    #[test]
    fn index_and_generation_are_packed() {
        let handle = BufferHandle::new(7, 3);
        assert_eq!(handle.index(), Some(7));
        assert_eq!(handle.generation(), 3);
        assert!(!handle.is_invalid());
        assert_eq!(BufferHandle::from_raw(handle.raw()), handle);
    }

    #[test]
    fn slot_zero_is_not_invalid() {
        let handle = TextureHandle::new(0, 0);
        assert_eq!(handle.index(), Some(0));
        assert!(!handle.is_invalid());
    }

    #[test]
    fn debug_names_the_kind() {
        assert_eq!(format!("{:?}", ViewHandle::new(2, 1)), "view(2v1)");
        assert_eq!(format!("{:?}", TextureHandle::INVALID), "texture(invalid)");
    }
}
