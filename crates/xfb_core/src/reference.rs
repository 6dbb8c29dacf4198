//! Reference BLAS model.
//!
//! Straightforward loops over row-major data. Accumulation happens in `f64`
//! so the reference is at least as accurate as the device it checks.

use crate::instr::DataType;
use xfb_common::isa::Opcode;

/// Relative tolerance used when comparing device output against the model.
pub const REL_TOLERANCE: f64 = 1e-3;

/// Absolute tolerance for results close to zero.
pub const ABS_TOLERANCE: f64 = 1e-5;

/// Index of the first element with the smallest magnitude, zero when empty.
pub fn amin(x: &[DataType]) -> usize {
    x.iter()
        .enumerate()
        .fold(None::<(usize, f32)>, |best, (i, v)| match best {
            Some((_, b)) if b <= v.abs() => best,
            _ => Some((i, v.abs())),
        })
        .map_or(0, |(i, _)| i)
}

/// Index of the first element with the largest magnitude, zero when empty.
pub fn amax(x: &[DataType]) -> usize {
    x.iter()
        .enumerate()
        .fold(None::<(usize, f32)>, |best, (i, v)| match best {
            Some((_, b)) if b >= v.abs() => best,
            _ => Some((i, v.abs())),
        })
        .map_or(0, |(i, _)| i)
}

pub fn asum(x: &[DataType]) -> DataType {
    x.iter().map(|v| f64::from(v.abs())).sum::<f64>() as DataType
}

/// `y := alpha * x + y`.
pub fn axpy(alpha: DataType, x: &[DataType], y: &mut [DataType]) {
    for (yi, xi) in y.iter_mut().zip(x) {
        *yi += alpha * xi;
    }
}

pub fn copy(x: &[DataType], y: &mut [DataType]) {
    y.copy_from_slice(x);
}

pub fn dot(x: &[DataType], y: &[DataType]) -> DataType {
    x.iter()
        .zip(y)
        .map(|(a, b)| f64::from(*a) * f64::from(*b))
        .sum::<f64>() as DataType
}

pub fn nrm2(x: &[DataType]) -> DataType {
    x.iter()
        .map(|v| f64::from(*v).powi(2))
        .sum::<f64>()
        .sqrt() as DataType
}

/// `x := alpha * x`.
pub fn scal(alpha: DataType, x: &mut [DataType]) {
    x.iter_mut().for_each(|v| *v *= alpha);
}

pub fn swap(x: &mut [DataType], y: &mut [DataType]) {
    x.swap_with_slice(y);
}

/// Expected outputs of one vector instruction.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Golden {
    pub x_res: Option<Vec<DataType>>,
    pub y_res: Option<Vec<DataType>>,
    pub res_scalar: DataType,
}

/// Runs a vector operation on copies of its inputs and returns what the
/// device is expected to produce.
///
/// Missing inputs are treated as zero vectors of length `x.len()` or
/// `y.len()`, whichever is present. Index results are reported as a scalar.
pub fn b1_golden(op: Opcode, alpha: DataType, x: Option<&[DataType]>, y: Option<&[DataType]>) -> Golden {
    let n = x.or(y).map_or(0, <[DataType]>::len);
    let mut xv = x.map_or_else(|| vec![0.0; n], <[DataType]>::to_vec);
    let mut yv = y.map_or_else(|| vec![0.0; n], <[DataType]>::to_vec);
    let scalar = |v: DataType| Golden {
        res_scalar: v,
        ..Golden::default()
    };
    match op {
        Opcode::Amin => scalar(amin(&xv) as DataType),
        Opcode::Amax => scalar(amax(&xv) as DataType),
        Opcode::Asum => scalar(asum(&xv)),
        Opcode::Nrm2 => scalar(nrm2(&xv)),
        Opcode::Dot => scalar(dot(&xv, &yv)),
        Opcode::Axpy => {
            axpy(alpha, &xv, &mut yv);
            Golden {
                y_res: Some(yv),
                ..Golden::default()
            }
        }
        Opcode::Copy => {
            copy(&xv, &mut yv);
            Golden {
                y_res: Some(yv),
                ..Golden::default()
            }
        }
        Opcode::Scal => {
            scal(alpha, &mut xv);
            Golden {
                x_res: Some(xv),
                ..Golden::default()
            }
        }
        Opcode::Swap => {
            swap(&mut xv, &mut yv);
            Golden {
                x_res: Some(xv),
                y_res: Some(yv),
                res_scalar: 0.0,
            }
        }
        Opcode::Gemv | Opcode::Gemm => Golden::default(),
    }
}

/// `C := alpha * A * B + beta * C` over row-major storage with leading
/// dimensions in elements.
#[allow(clippy::too_many_arguments)]
pub fn gemm_ref(
    m: usize,
    k: usize,
    n: usize,
    alpha: DataType,
    a: &[DataType],
    lda: usize,
    b: &[DataType],
    ldb: usize,
    beta: DataType,
    c: &mut [DataType],
    ldc: usize,
) {
    for i in 0..m {
        for j in 0..n {
            let acc: f64 = (0..k)
                .map(|p| f64::from(a[i * lda + p]) * f64::from(b[p * ldb + j]))
                .sum();
            let cij = &mut c[i * ldc + j];
            *cij = (f64::from(alpha) * acc + f64::from(beta) * f64::from(*cij)) as DataType;
        }
    }
}

/// `y := alpha * A * x + beta * y`.
#[allow(clippy::too_many_arguments)]
pub fn gemv_ref(
    m: usize,
    n: usize,
    alpha: DataType,
    a: &[DataType],
    lda: usize,
    x: &[DataType],
    beta: DataType,
    y: &mut [DataType],
) {
    for (i, yi) in y.iter_mut().enumerate().take(m) {
        let acc: f64 = (0..n)
            .map(|j| f64::from(a[i * lda + j]) * f64::from(x[j]))
            .sum();
        *yi = (f64::from(alpha) * acc + f64::from(beta) * f64::from(*yi)) as DataType;
    }
}

/// True when `got` matches `want` within the relative or absolute tolerance.
pub fn within_tolerance(got: DataType, want: DataType) -> bool {
    let (g, w) = (f64::from(got), f64::from(want));
    let diff = (g - w).abs();
    diff <= ABS_TOLERANCE || diff <= REL_TOLERANCE * w.abs()
}

/// First mismatching element between two results.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mismatch {
    pub index: usize,
    pub got: DataType,
    pub want: DataType,
}

/// Compares two result vectors element by element.
///
/// # Returns
///
/// `None` when every element is within tolerance, otherwise the first
/// mismatch. A length difference is reported at the shorter length.
pub fn compare(got: &[DataType], want: &[DataType]) -> Option<Mismatch> {
    if let Some((index, (&g, &w))) = got
        .iter()
        .zip(want)
        .enumerate()
        .find(|(_, (g, w))| !within_tolerance(**g, **w))
    {
        return Some(Mismatch { index, got: g, want: w });
    }
    (got.len() != want.len()).then(|| {
        let index = got.len().min(want.len());
        Mismatch {
            index,
            got: got.get(index).copied().unwrap_or(f32::NAN),
            want: want.get(index).copied().unwrap_or(f32::NAN),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_ops_return_first_extreme() {
        let x = [3.0, -1.0, 4.0, 1.0, -4.0];
        assert_eq!(amin(&x), 1);
        assert_eq!(amax(&x), 2);
        assert_eq!(amin(&[]), 0);
    }

    #[test]
    fn vector_goldens() {
        let x = [1.0, 2.0, 2.0];
        let y = [1.0, 1.0, 1.0];
        assert_eq!(b1_golden(Opcode::Nrm2, 0.0, Some(&x), None).res_scalar, 3.0);
        assert_eq!(b1_golden(Opcode::Dot, 0.0, Some(&x), Some(&y)).res_scalar, 5.0);
        assert_eq!(
            b1_golden(Opcode::Axpy, 2.0, Some(&x), Some(&y)).y_res,
            Some(vec![3.0, 5.0, 5.0])
        );
        let swapped = b1_golden(Opcode::Swap, 0.0, Some(&x), Some(&y));
        assert_eq!(swapped.x_res.as_deref(), Some(&y[..]));
        assert_eq!(swapped.y_res.as_deref(), Some(&x[..]));
        assert_eq!(b1_golden(Opcode::Asum, 0.0, None, None).res_scalar, 0.0);
    }

    #[test]
    fn gemm_against_hand_computed_product() {
        let a = [1.0, 2.0, 3.0, 4.0];
        let b = [5.0, 6.0, 7.0, 8.0];
        let mut c = [1.0; 4];
        gemm_ref(2, 2, 2, 1.0, &a, 2, &b, 2, 1.0, &mut c, 2);
        assert_eq!(c, [20.0, 23.0, 44.0, 51.0]);

        let mut y = [1.0, 1.0];
        gemv_ref(2, 2, 2.0, &a, 2, &[1.0, 1.0], 0.0, &mut y);
        assert_eq!(y, [6.0, 14.0]);
    }

    #[test]
    fn tolerance_is_relative_or_absolute() {
        assert!(within_tolerance(1000.5, 1000.0));
        assert!(!within_tolerance(1002.0, 1000.0));
        assert!(within_tolerance(5e-6, 0.0));
        assert_eq!(compare(&[1.0, 2.0], &[1.0, 2.0]), None);
        assert_eq!(compare(&[1.0, 2.5], &[1.0, 2.0]).map(|m| m.index), Some(1));
        assert_eq!(compare(&[1.0], &[1.0, 2.0]).map(|m| m.index), Some(1));
    }
}
