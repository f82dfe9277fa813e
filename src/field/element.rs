// src/field/element.rs
//! Site values stored in a field.
//!
//! An `Element` is a plain-old-data value made of `COMPONENTS` identical scalar
//! components laid out back to back (a real, a complex number, a fixed-size
//! vector or matrix of those). The storage layer only ever moves elements as
//! raw bytes or as component slices, so any `Pod` type built from one of the
//! supported scalars can live in a field.
//!
//! Supported components: `f32`, `f64`, `i32`, `i64`.

use core::fmt::Debug;

use bytemuck::Pod;
use num_complex::Complex;
use num_traits::{NumCast, Signed};

// ==============================================================================
// ------------------- Sealing: keep impl surface controlled --------------------
// ==============================================================================

mod sealed {
    pub trait Sealed {}
    macro_rules! impl_sealed_for {
        ($($t:ty),* $(,)?) => { $(impl Sealed for $t {})* };
    }
    impl_sealed_for!(f32, f64, i32, i64);
}
use sealed::Sealed;

// ==============================================================================
// -------------------------------- Component -----------------------------------
// ==============================================================================

/// One scalar slot of an element; the unit the SoA layout splits on.
pub trait Component: Pod + Signed + NumCast + Send + Sync + Debug + PartialEq + 'static + Sealed {
    /// Lossy conversion used by random fills; out-of-range values map to zero.
    #[inline]
    fn from_f64(x: f64) -> Self {
        <Self as NumCast>::from(x).unwrap_or_else(Self::zero)
    }
}

impl Component for f32 {}
impl Component for f64 {}
impl Component for i32 {}
impl Component for i64 {}

// ==============================================================================
// --------------------------------- Element ------------------------------------
// ==============================================================================

pub trait Element: Pod + Send + Sync + Debug + PartialEq + 'static {
    type Component: Component;

    /// Number of scalar components; `size_of::<Self>() == COMPONENTS * size_of::<Component>()`.
    const COMPONENTS: usize;

    #[inline]
    fn components(&self) -> &[Self::Component] {
        bytemuck::cast_slice(core::slice::from_ref(self))
    }

    #[inline]
    fn components_mut(&mut self) -> &mut [Self::Component] {
        bytemuck::cast_slice_mut(core::slice::from_mut(self))
    }

    /// Every component sign-flipped; the antiperiodic boundary transform.
    #[inline]
    fn negated(mut self) -> Self {
        for c in self.components_mut() {
            *c = -*c;
        }
        self
    }
}

macro_rules! impl_element_scalar {
    ($($t:ty),* $(,)?) => {$(
        impl Element for $t {
            type Component = $t;
            const COMPONENTS: usize = 1;
        }
    )*};
}
impl_element_scalar!(f32, f64, i32, i64);

impl<C: Component + Pod> Element for Complex<C> {
    type Component = C;
    const COMPONENTS: usize = 2;
}

impl<E: Element, const N: usize> Element for [E; N] {
    type Component = E::Component;
    const COMPONENTS: usize = N * E::COMPONENTS;
}
