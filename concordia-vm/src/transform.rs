use concordia_asm::{TransformKind, TransformRecord};

use crate::error::ConcordiaError;

/// Maximum number of bisection iterations spent inverting a monotonic curve
/// (spec.md §4.3); convergence is declared once the bracket is narrower than
/// `BISECTION_EPS` raw units, which comfortably exceeds any integer width's
/// precision.
const BISECTION_MAX_ITERS: u32 = 64;
const BISECTION_EPS: f64 = 1e-9;

/// A decoded, ready-to-apply transform: maps a raw integer to/from an
/// engineering-unit float.
#[derive(Debug, Clone, PartialEq)]
pub enum Transform {
    /// `eng = raw * scale + offset`; `raw = (eng - offset) / scale`.
    Affine { scale: f64, offset: f64 },
    /// `eng = sum(coeffs[i] * raw^i)`, Horner-evaluated on decode; encode
    /// inverts by bisection over the raw domain (monotonic by construction,
    /// per spec.md §4.3's invariant on compiler-emitted polynomials).
    Polynomial { coeffs: Vec<f64> },
    /// A natural cubic spline through `(raw_i, eng_i)` knots, sorted by
    /// `raw`. Decode picks the bracketing segment by `raw`'s position;
    /// encode picks it by `eng`'s position, since the curve is monotonic.
    Spline { knots: Vec<(f64, f64)> },
}

impl Transform {
    /// Build a [`Transform`] from a decoded IL transform-table record.
    pub fn from_record(record: &TransformRecord) -> Result<Self, ConcordiaError> {
        match record.kind {
            TransformKind::Affine => {
                if record.payload.len() != 2 {
                    return Err(ConcordiaError::TransformErr(format!(
                        "affine transform expects 2 payload values, found {}",
                        record.payload.len()
                    )));
                }
                Ok(Transform::Affine { scale: record.payload[0], offset: record.payload[1] })
            }
            TransformKind::Polynomial => {
                if record.payload.is_empty() {
                    return Err(ConcordiaError::TransformErr("polynomial transform has no coefficients".into()));
                }
                Ok(Transform::Polynomial { coeffs: record.payload.clone() })
            }
            TransformKind::Spline => {
                if record.payload.len() < 4 || record.payload.len() % 2 != 0 {
                    return Err(ConcordiaError::TransformErr(format!(
                        "spline transform expects an even number (>= 4) of payload values, found {}",
                        record.payload.len()
                    )));
                }
                let knots: Vec<(f64, f64)> = record.payload.chunks_exact(2).map(|c| (c[0], c[1])).collect();
                Ok(Transform::Spline { knots })
            }
        }
    }

    /// Raw integer -> engineering-unit float.
    pub fn decode(&self, raw: i64) -> Result<f64, ConcordiaError> {
        match self {
            Transform::Affine { scale, offset } => Ok(raw as f64 * scale + offset),
            Transform::Polynomial { coeffs } => Ok(horner(coeffs, raw as f64)),
            Transform::Spline { knots } => spline_eval(knots, raw as f64),
        }
    }

    /// Engineering-unit float -> raw integer, inverting [`decode`](Self::decode).
    pub fn encode(&self, eng: f64) -> Result<i64, ConcordiaError> {
        match self {
            Transform::Affine { scale, offset } => {
                if *scale == 0.0 {
                    return Err(ConcordiaError::TransformErr("affine transform has zero scale".into()));
                }
                Ok(((eng - offset) / scale).round() as i64)
            }
            Transform::Polynomial { coeffs } => {
                let raw = bisection_invert(eng, |x| horner(coeffs, x))?;
                Ok(raw.round() as i64)
            }
            Transform::Spline { knots } => {
                let raw = bisection_invert(eng, |x| spline_eval(knots, x).unwrap_or(f64::NAN))?;
                Ok(raw.round() as i64)
            }
        }
    }
}

fn horner(coeffs: &[f64], x: f64) -> f64 {
    coeffs.iter().rev().fold(0.0, |acc, c| acc * x + c)
}

/// Natural cubic spline evaluation: fit second derivatives via the standard
/// tridiagonal system, then evaluate the bracketing segment's cubic. `knots`
/// must be sorted ascending by `.0` (the compiler guarantees this; spec.md
/// §4.3).
fn spline_eval(knots: &[(f64, f64)], x: f64) -> Result<f64, ConcordiaError> {
    let n = knots.len();
    if n < 2 {
        return Err(ConcordiaError::TransformErr("spline needs at least 2 knots".into()));
    }
    let second_derivs = natural_cubic_second_derivatives(knots);

    let seg = match knots.windows(2).position(|w| x >= w[0].0 && x <= w[1].0) {
        Some(i) => i,
        None if x < knots[0].0 => 0,
        None => n - 2,
    };
    let (x0, y0) = knots[seg];
    let (x1, y1) = knots[seg + 1];
    let h = x1 - x0;
    if h == 0.0 {
        return Err(ConcordiaError::TransformErr("spline has duplicate knot positions".into()));
    }
    let a = (x1 - x) / h;
    let b = (x - x0) / h;
    let y = a * y0
        + b * y1
        + ((a.powi(3) - a) * second_derivs[seg] + (b.powi(3) - b) * second_derivs[seg + 1]) * (h * h) / 6.0;
    Ok(y)
}

fn natural_cubic_second_derivatives(knots: &[(f64, f64)]) -> Vec<f64> {
    let n = knots.len();
    let mut y2 = vec![0.0; n];
    if n < 3 {
        return y2;
    }
    let mut u = vec![0.0; n];

    for i in 1..n - 1 {
        let (x_im1, y_im1) = knots[i - 1];
        let (x_i, y_i) = knots[i];
        let (x_ip1, y_ip1) = knots[i + 1];
        let sig = (x_i - x_im1) / (x_ip1 - x_im1);
        let p = sig * y2[i - 1] + 2.0;
        y2[i] = (sig - 1.0) / p;
        let mut upart = (y_ip1 - y_i) / (x_ip1 - x_i) - (y_i - y_im1) / (x_i - x_im1);
        upart = (6.0 * upart / (x_ip1 - x_im1) - sig * u[i - 1]) / p;
        u[i] = upart;
    }
    for i in (0..n - 1).rev() {
        y2[i] = y2[i] * y2[i + 1] + u[i];
    }
    y2
}

/// Invert a monotonic function `f` by bisection: find `x` such that
/// `f(x) ~= target`. The initial bracket is widened geometrically from the
/// origin until it straddles the target, since transforms carry no
/// explicit domain bounds in the IL image.
fn bisection_invert(target: f64, f: impl Fn(f64) -> f64) -> Result<f64, ConcordiaError> {
    let mut lo = -1.0f64;
    let mut hi = 1.0f64;
    let ascending;
    loop {
        let flo = f(lo);
        let fhi = f(hi);
        if (flo <= target && target <= fhi) || (fhi <= target && target <= flo) {
            ascending = fhi >= flo;
            break;
        }
        if lo.abs() > 1e18 {
            return Err(ConcordiaError::TransformErr(format!(
                "engineering value {target} is outside the transform's invertible domain"
            )));
        }
        lo *= 2.0;
        hi *= 2.0;
    }

    for _ in 0..BISECTION_MAX_ITERS {
        if (hi - lo).abs() < BISECTION_EPS {
            break;
        }
        let mid = (lo + hi) / 2.0;
        let fmid = f(mid);
        let mid_is_low = if ascending { fmid < target } else { fmid > target };
        if mid_is_low {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    Ok((lo + hi) / 2.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn affine_round_trip_matches_bench_features_scenario() {
        // @scale(0.1) @offset(10.0) uint16 val; val_eng = 25.5 -> raw = 155
        let t = Transform::Affine { scale: 0.1, offset: 10.0 };
        let eng = t.decode(155).unwrap();
        assert!((eng - 25.5).abs() < 1e-9);
        assert_eq!(t.encode(25.5).unwrap(), 155);
    }

    #[test]
    fn affine_zero_scale_is_error() {
        let t = Transform::Affine { scale: 0.0, offset: 1.0 };
        assert!(t.encode(5.0).is_err());
    }

    #[test]
    fn polynomial_round_trip_matches_bench_math_scenario() {
        // @poly(0.5, 2.0, 1.5): eng = 0.5 + 2.0*raw + 1.5*raw^2
        let t = Transform::Polynomial { coeffs: vec![0.5, 2.0, 1.5] };
        let eng = t.decode(10).unwrap();
        assert!((eng - 170.5).abs() < 1e-9);
        let raw = t.encode(eng).unwrap();
        assert_eq!(raw, 10);
    }

    #[test]
    fn spline_round_trip_matches_bench_math_scenario() {
        // @spline(0,0, 10,100, 20,400, 30,900)
        let t = Transform::Spline { knots: vec![(0.0, 0.0), (10.0, 100.0), (20.0, 400.0), (30.0, 900.0)] };
        let eng_at_10 = t.decode(10).unwrap();
        assert!((eng_at_10 - 100.0).abs() < 1e-6);
        let raw = t.encode(eng_at_10).unwrap();
        assert!((raw - 10).abs() <= 1);
    }

    #[test]
    fn spline_interpolates_between_knots() {
        let t = Transform::Spline { knots: vec![(0.0, 0.0), (10.0, 100.0), (20.0, 400.0), (30.0, 900.0)] };
        let mid = t.decode(5).unwrap();
        assert!(mid > 0.0 && mid < 100.0);
    }

    #[quickcheck_macros::quickcheck]
    fn affine_round_trip(raw: i32, scale_bits: u16, offset: i16) -> bool {
        let raw = (raw % 100_000) as i64;
        let scale = 0.01 + (scale_bits as f64 % 1000.0) / 100.0;
        let t = Transform::Affine { scale, offset: offset as f64 };
        match t.decode(raw) {
            Ok(eng) => t.encode(eng).map(|back| back == raw).unwrap_or(false),
            Err(_) => false,
        }
    }

    #[quickcheck_macros::quickcheck]
    fn polynomial_round_trip_linear(raw: i16, slope_bits: u8, offset: i16) -> bool {
        let raw = raw as i64;
        let slope = 1.0 + (slope_bits as f64) / 16.0;
        let t = Transform::Polynomial { coeffs: vec![offset as f64, slope] };
        match t.decode(raw) {
            Ok(eng) => match t.encode(eng) {
                Ok(back) => (back - raw).abs() <= 1,
                Err(_) => false,
            },
            Err(_) => false,
        }
    }
}
