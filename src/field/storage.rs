// src/field/storage.rs
/*!
Raw per-site buffers behind a field.

Two physical layouts implement the same [`FieldStorage`] interface:

- [`AosStorage`]: one `Vec<T>`, element `i` at slot `i`.
- [`SoaStorage`]: one `Vec<T::Component>` holding every component plane back to
  back; component `k` of element `i` lives at `k * size + i`.

Both always compile. [`DefaultStorage`] picks one at build time through the
`soa` cargo feature, and nothing above this module can tell which one is in use.

# Invariants
- `get(i)` after `set(i, v)` returns a value bit-identical to `v` in either layout.
- `gather(list)` yields exactly `list.len() * size_of::<T>()` bytes in list
  order; `scatter` accepts only that length.
- `free()` is idempotent.
*/

use std::alloc::{handle_alloc_error, Layout};
use std::marker::PhantomData;
use std::mem::size_of;

use bytemuck::Zeroable;

use super::element::Element;
use crate::error::{fatal, LatticeError};

pub trait FieldStorage<T: Element>: Default + Send + Sync {
    /// Reserve zeroed room for `size` elements; aborts the process when the
    /// allocator fails. Re-allocating discards the old contents.
    fn allocate(&mut self, size: usize);

    fn is_allocated(&self) -> bool;

    /// Allocated size in elements (0 when unallocated).
    fn len(&self) -> usize;

    fn get(&self, index: usize) -> T;

    fn set(&mut self, index: usize, value: T);

    /// Write `values` to the consecutive slots starting at `start`.
    fn set_range(&mut self, start: usize, values: &[T]) {
        for (i, &v) in values.iter().enumerate() {
            self.set(start + i, v);
        }
    }

    /// Pack the listed elements into a byte buffer, preserving list order.
    fn gather(&self, indices: &[usize]) -> Vec<u8> {
        let mut out = Vec::with_capacity(indices.len() * size_of::<T>());
        for &i in indices {
            out.extend_from_slice(bytemuck::bytes_of(&self.get(i)));
        }
        out
    }

    /// Unpack `bytes` into the listed slots; the inverse of [`gather`](Self::gather).
    fn scatter(&mut self, bytes: &[u8], indices: &[usize]) {
        let width = size_of::<T>();
        check_buffer_len(bytes.len(), indices.len() * width);
        for (chunk, &i) in bytes.chunks_exact(width).zip(indices) {
            self.set(i, bytemuck::pod_read_unaligned(chunk));
        }
    }

    /// Release the buffer; a no-op when nothing is allocated.
    fn free(&mut self);
}

#[inline]
fn check_buffer_len(actual: usize, expected: usize) {
    if actual != expected {
        fatal(LatticeError::LayoutMismatch { expected, actual });
    }
}

fn zeroed_buffer<C: Zeroable + Copy>(len: usize) -> Vec<C> {
    let mut buf: Vec<C> = Vec::new();
    if buf.try_reserve_exact(len).is_err() {
        tracing::error!(elements = len, bytes = len.saturating_mul(size_of::<C>()), "field allocation failed");
        handle_alloc_error(Layout::array::<C>(len).unwrap_or_else(|_| Layout::new::<C>()));
    }
    buf.resize(len, C::zeroed());
    buf
}

// ==============================================================================
// ------------------------- Array of structures --------------------------------
// ==============================================================================

#[derive(Debug, Clone)]
pub struct AosStorage<T: Element> {
    data: Vec<T>,
    allocated: bool,
}

impl<T: Element> Default for AosStorage<T> {
    fn default() -> Self {
        Self { data: Vec::new(), allocated: false }
    }
}

impl<T: Element> FieldStorage<T> for AosStorage<T> {
    fn allocate(&mut self, size: usize) {
        self.free();
        self.data = zeroed_buffer(size);
        self.allocated = true;
    }

    #[inline]
    fn is_allocated(&self) -> bool {
        self.allocated
    }

    #[inline]
    fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    fn get(&self, index: usize) -> T {
        assert!(index < self.data.len(), "get: index {index} out of range (size {})", self.data.len());
        self.data[index]
    }

    #[inline]
    fn set(&mut self, index: usize, value: T) {
        assert!(index < self.data.len(), "set: index {index} out of range (size {})", self.data.len());
        self.data[index] = value;
    }

    fn set_range(&mut self, start: usize, values: &[T]) {
        self.data[start..start + values.len()].copy_from_slice(values);
    }

    fn gather(&self, indices: &[usize]) -> Vec<u8> {
        let mut out = Vec::with_capacity(indices.len() * size_of::<T>());
        for &i in indices {
            out.extend_from_slice(bytemuck::bytes_of(&self.data[i]));
        }
        out
    }

    fn free(&mut self) {
        self.data = Vec::new();
        self.allocated = false;
    }
}

// ==============================================================================
// ------------------------- Structure of arrays --------------------------------
// ==============================================================================

#[derive(Debug, Clone)]
pub struct SoaStorage<T: Element> {
    /// Component planes, each `size` long.
    data: Vec<T::Component>,
    size: usize,
    allocated: bool,
    _marker: PhantomData<T>,
}

impl<T: Element> Default for SoaStorage<T> {
    fn default() -> Self {
        Self { data: Vec::new(), size: 0, allocated: false, _marker: PhantomData }
    }
}

impl<T: Element> SoaStorage<T> {
    /// Contiguous plane of component `k` (length = allocated size).
    #[inline]
    pub fn component_plane(&self, k: usize) -> &[T::Component] {
        assert!(k < T::COMPONENTS, "component_plane: k {k} out of range ({} components)", T::COMPONENTS);
        &self.data[k * self.size..(k + 1) * self.size]
    }
}

impl<T: Element> FieldStorage<T> for SoaStorage<T> {
    fn allocate(&mut self, size: usize) {
        self.free();
        self.data = zeroed_buffer(size * T::COMPONENTS);
        self.size = size;
        self.allocated = true;
    }

    #[inline]
    fn is_allocated(&self) -> bool {
        self.allocated
    }

    #[inline]
    fn len(&self) -> usize {
        self.size
    }

    #[inline]
    fn get(&self, index: usize) -> T {
        assert!(index < self.size, "get: index {index} out of range (size {})", self.size);
        let mut value = T::zeroed();
        for (k, c) in value.components_mut().iter_mut().enumerate() {
            *c = self.data[k * self.size + index];
        }
        value
    }

    #[inline]
    fn set(&mut self, index: usize, value: T) {
        assert!(index < self.size, "set: index {index} out of range (size {})", self.size);
        for (k, &c) in value.components().iter().enumerate() {
            self.data[k * self.size + index] = c;
        }
    }

    fn set_range(&mut self, start: usize, values: &[T]) {
        assert!(start + values.len() <= self.size, "set_range: {}..{} out of range (size {})", start, start + values.len(), self.size);
        for k in 0..T::COMPONENTS {
            let plane = &mut self.data[k * self.size + start..k * self.size + start + values.len()];
            for (dst, v) in plane.iter_mut().zip(values) {
                *dst = v.components()[k];
            }
        }
    }

    fn free(&mut self) {
        self.data = Vec::new();
        self.size = 0;
        self.allocated = false;
    }
}

#[cfg(not(feature = "soa"))]
pub type DefaultStorage<T> = AosStorage<T>;

#[cfg(feature = "soa")]
pub type DefaultStorage<T> = SoaStorage<T>;
