pub mod frames;
use std::{
    fmt,
    marker::PhantomData,
    ops::{Deref, DerefMut, Mul},
};

pub use frames::*;
use nalgebra::{Isometry3, RealField};

/// A value tagged with the coordinate frame it is expressed in.
///
/// Transforms are tagged with `fn(From) -> To`, so that `point * transform`
/// only type-checks when the point lives in the transform's source frame.
pub struct Framed<T, F> {
    inner: T,
    frame: PhantomData<F>,
}

impl<T: Clone, F> Clone for Framed<T, F> {
    fn clone(&self) -> Self {
        Self::new(self.inner.clone())
    }
}

impl<T: Copy, F> Copy for Framed<T, F> {}

impl<T: Default, F> Default for Framed<T, F> {
    fn default() -> Self {
        Self::new(Default::default())
    }
}

impl<T: PartialEq, F> PartialEq for Framed<T, F> {
    fn eq(&self, other: &Self) -> bool {
        self.inner == other.inner
    }
}

impl<T: fmt::Debug, F> fmt::Debug for Framed<T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

impl<T, F> Framed<T, F> {
    pub const fn new(inner: T) -> Self {
        Self {
            inner,
            frame: PhantomData,
        }
    }
    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T, F1, F2> Framed<T, fn(F1) -> F2> {
    pub fn new_transform(inner: T, from: F1, to: F2) -> Self {
        let _ = (from, to);
        Self::new(inner)
    }
}

impl<T: RealField, F1, F2> Framed<Isometry3<T>, fn(F1) -> F2> {
    pub fn inverse(&self) -> Framed<Isometry3<T>, fn(F2) -> F1> {
        Framed::new(self.inner.inverse())
    }
    /// Chains `F1 -> F2` then `F2 -> F3`.
    pub fn then<F3>(
        &self,
        next: &Framed<Isometry3<T>, fn(F2) -> F3>,
    ) -> Framed<Isometry3<T>, fn(F1) -> F3> {
        Framed::new(&next.inner * &self.inner)
    }
}

impl<T, F> Deref for Framed<T, F> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<T, F> DerefMut for Framed<T, F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl<'a, T1, T2, F1, F2> Mul<&'a Framed<T2, fn(F1) -> F2>> for &'a Framed<T1, F1>
where
    &'a T2: Mul<&'a T1>,
{
    type Output = Framed<<&'a T2 as Mul<&'a T1>>::Output, F2>;
    fn mul(self, transform: &'a Framed<T2, fn(F1) -> F2>) -> Self::Output {
        Framed::new(transform.deref() * self.deref())
    }
}
