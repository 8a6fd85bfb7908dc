use linfa::Float;
use ndarray::{Array2, ArrayBase, Data, Ix1, Ix2};
use std::cmp::Ordering;

/// Compute the differences between each row of `x` and each row of `y`,
/// flattened row-major into a `(x.nrows() * y.nrows(), ncols)` array:
/// row `i * y.nrows() + j` holds `x[i] - y[j]`.
pub fn pairwise_differences<F: Float>(
    x: &ArrayBase<impl Data<Elem = F>, Ix2>,
    y: &ArrayBase<impl Data<Elem = F>, Ix2>,
) -> Array2<F> {
    let ny = y.nrows();
    let mut diff = Array2::zeros((x.nrows() * ny, x.ncols()));
    for (i, xi) in x.rows().into_iter().enumerate() {
        for (j, yj) in y.rows().into_iter().enumerate() {
            let mut row = diff.row_mut(i * ny + j);
            row.assign(&xi);
            row -= &yj;
        }
    }
    diff
}

/// Permutation sorting a 1-d coordinate column by increasing value.
pub fn argsort_by_value<F: Float>(t: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Vec<usize> {
    let mut inds: Vec<usize> = (0..t.len()).collect();
    inds.sort_by(|&a, &b| t[a].partial_cmp(&t[b]).unwrap_or(Ordering::Equal));
    inds
}

/// Permutation ordering rows by increasing euclidean distance from the
/// first row. Used for multidimensional inputs where no total order on
/// coordinates exists.
pub fn argsort_by_distance<F: Float>(x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Vec<usize> {
    let first = x.row(0);
    let d2: Vec<F> = x
        .rows()
        .into_iter()
        .map(|r| (&r - &first).mapv(|v| v * v).sum())
        .collect();
    let mut inds: Vec<usize> = (0..x.nrows()).collect();
    inds.sort_by(|&a, &b| d2[a].partial_cmp(&d2[b]).unwrap_or(Ordering::Equal));
    inds
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_pairwise_differences() {
        let x = array![[1., 2.], [3., 4.]];
        let y = array![[1., 2.], [5., 6.], [7., 8.]];
        let expected = array![
            [0., 0.],
            [-4., -4.],
            [-6., -6.],
            [2., 2.],
            [-2., -2.],
            [-4., -4.]
        ];
        assert_abs_diff_eq!(expected, pairwise_differences(&x, &y), epsilon = 1e-12);
    }

    #[test]
    fn test_argsort_by_value() {
        let t = array![3.0, 1.0, 2.0, -4.0];
        assert_eq!(vec![3, 1, 2, 0], argsort_by_value(&t));
    }

    #[test]
    fn test_argsort_by_distance() {
        let x = array![[0., 0.], [3., 4.], [1., 0.], [0., 2.]];
        assert_eq!(vec![0, 2, 3, 1], argsort_by_distance(&x));
    }
}
