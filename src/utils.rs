use nalgebra::{
    Cholesky, ComplexField, DefaultAllocator, Dim, DimAdd, DimMin, DimMinimum, DimSum, Matrix,
    Matrix3, OMatrix, OVector, RawStorageMut, RealField, Scalar, SymmetricEigen, U1, Vector3,
    VectorViewMut, ViewStorageMut, allocator::Allocator,
};
use num_traits::Zero;
use std::iter::Sum;

pub trait ViewDiagonalMut {
    type Element;
    type Dim: Dim;
    type RStride: Dim;
    fn view_diagonal_mut(
        &mut self,
    ) -> VectorViewMut<'_, Self::Element, Self::Dim, Self::RStride, U1>;
}

impl<T, R, C> ViewDiagonalMut for OMatrix<T, R, C>
where
    T: Scalar,
    R: Dim + DimMin<C> + DimAdd<U1>,
    C: Dim,
    DefaultAllocator: Allocator<R, C>,
{
    type Element = T;
    type Dim = DimMinimum<R, C>;
    type RStride = DimSum<R, U1>;
    #[inline]
    fn view_diagonal_mut(
        &mut self,
    ) -> VectorViewMut<'_, Self::Element, Self::Dim, Self::RStride, U1> {
        let (rows, cols) = self.shape_generic();
        let min_dim = rows.min(cols);
        // SAFETY:
        //
        // The storage is contiguous and column-major, so stepping `rows + 1`
        // elements from the first one visits exactly the diagonal, and the
        // view length is bounded by the smaller dimension.
        unsafe {
            let data = ViewStorageMut::from_raw_parts(
                self.data.ptr_mut(),
                (min_dim, U1),
                (rows.add(U1), U1),
            );
            Matrix::from_data_statically_unchecked(data)
        }
    }
}

/// Relative damping added to the diagonal when a normal-equation system is
/// not positive definite.
const DAMPING: f64 = 1e-6;

/// Solves `h * x = rhs` for a symmetric positive semi-definite `h`.
///
/// Falls back to a Levenberg-style damped system when the plain Cholesky
/// factorization fails, and gives up only if the damped one fails too.
pub(crate) fn solve_with_substitute<T, D>(
    h: OMatrix<T, D, D>,
    rhs: &OVector<T, D>,
) -> Option<OVector<T, D>>
where
    T: RealField + Copy,
    D: Dim + DimMin<D> + DimAdd<U1>,
    DefaultAllocator: Allocator<D, D> + Allocator<D>,
{
    let solved = Cholesky::new(h.clone())
        .map(|cholesky| cholesky.solve(rhs))
        .filter(|x| x.iter().all(|v| v.is_finite()));
    if solved.is_some() {
        return solved;
    }
    let mut damped = h;
    let trace = damped.trace();
    let scale: T = nalgebra::convert(DAMPING);
    let floor: T = nalgebra::convert(f64::EPSILON);
    let dim: T = nalgebra::convert(damped.nrows() as f64);
    damped
        .view_diagonal_mut()
        .add_scalar_mut((trace / dim).max(floor) * scale);
    Cholesky::new(damped)
        .map(|cholesky| cholesky.solve(rhs))
        .filter(|x| x.iter().all(|v| v.is_finite()))
}

/// Running first and second moments of a set of vectors.
#[derive(Debug, Clone)]
pub struct VectorSquareSum<T: Scalar> {
    count: usize,
    sum: Vector3<T>,
    square_sum: Matrix3<T>,
}

impl<T> VectorSquareSum<T>
where
    T: ComplexField,
{
    pub fn mean(&self) -> (Vector3<T>, Matrix3<T>) {
        let count: T = nalgebra::convert(self.count as f64);
        let mean = &self.sum / count.clone();
        let covariance = &self.square_sum / count - &mean * mean.transpose();
        (mean, covariance)
    }
}

impl<T> VectorSquareSum<T>
where
    T: RealField + Copy,
{
    /// Eigen-decomposes the covariance, eigenpairs sorted by ascending eigenvalue.
    ///
    /// Returns `None` for an empty set.
    pub fn surface(&self) -> Option<Surface<T>> {
        if self.count == 0 {
            return None;
        }
        let (mean, covariance) = self.mean();
        let SymmetricEigen {
            eigenvectors,
            eigenvalues,
        } = covariance.symmetric_eigen();

        let mut order = [0usize, 1, 2];
        order.sort_by(|&a, &b| {
            eigenvalues[a]
                .partial_cmp(&eigenvalues[b])
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        // round-off can push the smallest eigenvalue of a perfect plane below zero
        let eigenvalues = Vector3::from_fn(|i, _| eigenvalues[order[i]].max(T::zero()));
        let eigenvectors = Matrix3::from_fn(|r, c| eigenvectors[(r, order[c])]);

        Some(Surface {
            mean,
            eigenvalues,
            eigenvectors,
            count: self.count,
        })
    }
}

/// Principal components of a point set.
#[derive(Debug, Clone)]
pub struct Surface<T: Scalar> {
    pub mean: Vector3<T>,
    /// Ascending.
    pub eigenvalues: Vector3<T>,
    /// Column `i` belongs to `eigenvalues[i]`.
    pub eigenvectors: Matrix3<T>,
    pub count: usize,
}

impl<T: RealField + Copy> Surface<T> {
    /// Share of the total variance along the normal, 0 for a perfect plane.
    pub fn thickness_ratio(&self) -> T {
        let total = self.eigenvalues.sum();
        if total <= T::zero() {
            return T::zero();
        }
        self.eigenvalues[0] / total
    }
}

impl<T> Default for VectorSquareSum<T>
where
    T: Scalar + Zero,
{
    fn default() -> Self {
        Self {
            count: 0,
            sum: Vector3::zeros(),
            square_sum: Matrix3::zeros(),
        }
    }
}

impl<'a, T> Sum<&'a Vector3<T>> for VectorSquareSum<T>
where
    T: ComplexField,
{
    fn sum<I>(iter: I) -> Self
    where
        I: Iterator<Item = &'a Vector3<T>>,
    {
        iter.fold(Self::default(), |mut acc, current| {
            acc.count += 1;
            acc.sum += current;
            acc.square_sum += current * current.transpose();
            acc
        })
    }
}

pub trait CollectTo: Iterator {
    fn collect_to<T>(self, collection: &mut T) -> &mut T
    where
        T: Extend<Self::Item>;
}

impl<I: Iterator> CollectTo for I {
    fn collect_to<T: Extend<I::Item>>(self, collection: &mut T) -> &mut T {
        collection.extend(self);
        collection
    }
}
