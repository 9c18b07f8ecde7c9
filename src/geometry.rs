use anyhow::{Result, ensure};
use ndarray::{Array1, ArrayView2};

/// Speed of light in km/s.
pub const SPEED_OF_LIGHT: f64 = 299_792.458;

pub type Vec3 = [f64; 3];

#[inline]
fn wrap(dx: f64, box_size: f64) -> f64 {
    if dx >= 0.5 * box_size {
        dx - box_size
    } else if dx < -0.5 * box_size {
        dx + box_size
    } else {
        dx
    }
}

#[inline]
pub fn norm(v: Vec3) -> f64 {
    (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt()
}

#[inline]
pub fn sub(a: Vec3, b: Vec3) -> Vec3 {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

/// Distances between the rows of `points` and `reference`.
///
/// `reference` is either a single row, broadcast against every point, or has
/// exactly as many rows as `points` and is paired row by row. With a box size
/// each axis difference is wrapped into `[-L/2, L/2)` before squaring.
pub fn distance(
    points: ArrayView2<f64>,
    reference: ArrayView2<f64>,
    box_size: Option<f64>,
) -> Result<Array1<f64>> {
    let (n, nd) = points.dim();
    ensure!(
        reference.ncols() == nd,
        "reference has {} columns, points have {}",
        reference.ncols(),
        nd
    );
    let broadcast = reference.nrows() == 1;
    ensure!(
        broadcast || reference.nrows() == n,
        "reference has {} rows, expected 1 or {}",
        reference.nrows(),
        n
    );

    let mut out = Array1::<f64>::zeros(n);
    for (i, row) in points.outer_iter().enumerate() {
        let other = reference.row(if broadcast { 0 } else { i });
        let mut delta = 0.0f64;
        for (&a, &b) in row.iter().zip(other.iter()) {
            let mut dx = a - b;
            if let Some(l) = box_size {
                dx = wrap(dx, l);
            }
            delta += dx * dx;
        }
        out[i] = delta.sqrt();
    }
    Ok(out)
}

/// Where a halo's interpolated trajectory meets the lightcone.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Crossing {
    pub chi: f64,
    pub position: Vec3,
    /// km/s
    pub velocity: Vec3,
    pub closer_to_current: bool,
    /// The halo recedes in lockstep with the shell; `chi` was clamped to the
    /// current distance.
    pub degenerate: bool,
}

/// Two consecutive lightcone shells, `prev` being the earlier (farther) one.
#[derive(Debug, Clone, Copy)]
pub struct Shells {
    pub chi_prev: f64,
    pub chi_cur: f64,
}

impl Shells {
    pub fn new(chi_prev: f64, chi_cur: f64) -> Result<Self> {
        ensure!(
            chi_prev > chi_cur,
            "progenitor shell chi={chi_prev} must lie beyond the current shell chi={chi_cur}"
        );
        Ok(Self { chi_prev, chi_cur })
    }

    #[inline]
    pub fn spacing(&self) -> f64 {
        self.chi_prev - self.chi_cur
    }
}

/// Solve for the comoving radius at which the straight line from `pos_prev`
/// (at shell `chi_prev`) to `pos_cur` (at shell `chi_cur`) meets the shell.
///
/// The progenitor is first moved by a box length on any axis where the pair
/// straddles the periodic boundary. `degenerate_tol` is relative to the shell
/// spacing.
pub fn solve_crossing(
    pos_prev: Vec3,
    pos_cur: Vec3,
    shells: Shells,
    box_size: f64,
    origin: Vec3,
    degenerate_tol: f64,
) -> Crossing {
    let Shells {
        chi_prev: chi1,
        chi_cur: chi2,
    } = shells;

    let mut pos1 = pos_prev;
    for ax in 0..3 {
        let dx = pos_prev[ax] - pos_cur[ax];
        if dx.abs() > 0.5 * box_size {
            pos1[ax] = pos_cur[ax] + dx - dx.signum() * box_size;
        }
    }

    let r1 = norm(sub(pos1, origin));
    let r2 = norm(sub(pos_cur, origin));

    let spacing = chi1 - chi2;
    let v_avg = [
        (pos_cur[0] - pos1[0]) / spacing,
        (pos_cur[1] - pos1[1]) / spacing,
        (pos_cur[2] - pos1[2]) / spacing,
    ];
    let velocity = [
        v_avg[0] * SPEED_OF_LIGHT,
        v_avg[1] * SPEED_OF_LIGHT,
        v_avg[2] * SPEED_OF_LIGHT,
    ];

    let denom = spacing + (r2 - r1);
    if denom.abs() <= degenerate_tol * spacing {
        return Crossing {
            chi: r2,
            position: pos_cur,
            velocity,
            closer_to_current: true,
            degenerate: true,
        };
    }

    // r1 + (chi1 - chi)/(chi1 - chi2) * (r2 - r1) = chi
    let chi_star = (r1 * spacing + chi1 * (r2 - r1)) / denom;
    let back = chi1 - chi_star;
    let position = [
        pos1[0] + v_avg[0] * back,
        pos1[1] + v_avg[1] * back,
        pos1[2] + v_avg[2] * back,
    ];

    Crossing {
        chi: chi_star,
        position,
        velocity,
        closer_to_current: (chi_star - chi2).abs() < (chi_star - chi1).abs(),
        degenerate: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, array};

    const ORIGIN: Vec3 = [0.0, 0.0, 0.0];

    #[test]
    fn periodic_image_is_at_zero_distance() {
        let l = 100.0;
        let p = array![[12.5, -3.0, 40.0]];
        for ax in 0..3 {
            let mut shifted = p.clone();
            shifted[[0, ax]] += l;
            let d = distance(p.view(), shifted.view(), Some(l)).unwrap();
            assert!(d[0].abs() < 1e-12, "axis {ax}: {}", d[0]);
        }
        let d = distance(p.view(), p.view(), None).unwrap();
        assert_eq!(d[0], 0.0);
    }

    #[test]
    fn broadcast_and_paired_agree() {
        let pts = array![[3.0, 4.0, 0.0], [0.0, 0.0, 2.0], [1.0, 2.0, 2.0]];
        let origin = array![[0.0, 0.0, 0.0]];
        let d = distance(pts.view(), origin.view(), None).unwrap();
        assert_eq!(d.to_vec(), vec![5.0, 2.0, 3.0]);

        let zeros = Array2::<f64>::zeros((3, 3));
        let paired = distance(pts.view(), zeros.view(), None).unwrap();
        assert_eq!(paired, d);
    }

    #[test]
    fn periodic_wrap_takes_short_way_round() {
        let a = array![[1.0, 0.0, 0.0]];
        let b = array![[99.0, 0.0, 0.0]];
        let d = distance(a.view(), b.view(), Some(100.0)).unwrap();
        assert!((d[0] - 2.0).abs() < 1e-12);
        let d = distance(a.view(), b.view(), None).unwrap();
        assert!((d[0] - 98.0).abs() < 1e-12);
    }

    #[test]
    fn mismatched_reference_is_rejected() {
        let pts = Array2::<f64>::zeros((3, 3));
        let other = Array2::<f64>::zeros((2, 3));
        assert!(distance(pts.view(), other.view(), None).is_err());
        let flat = Array2::<f64>::zeros((1, 2));
        assert!(distance(pts.view(), flat.view(), None).is_err());
    }

    #[test]
    fn crossing_lies_between_shells() {
        let shells = Shells::new(3000.0, 2800.0).unwrap();
        let c = solve_crossing(
            [2900.0, 0.0, 0.0],
            [2850.0, 0.0, 0.0],
            shells,
            100.0,
            ORIGIN,
            1e-9,
        );
        assert!(!c.degenerate);
        assert!(c.chi >= 2800.0 && c.chi <= 3000.0, "chi* = {}", c.chi);
        assert!((c.chi - 2866.0 - 2.0 / 3.0).abs() < 1e-9);
        // The interpolated point sits on the shell it was solved for.
        assert!((norm(c.position) - c.chi).abs() < 1e-9);
        assert!(c.closer_to_current);
        assert!((c.velocity[0] + 0.25 * SPEED_OF_LIGHT).abs() < 1e-6);
    }

    #[test]
    fn crossing_near_progenitor_shell_is_deferred() {
        let shells = Shells::new(3000.0, 2800.0).unwrap();
        let c = solve_crossing(
            [2955.0, 0.0, 0.0],
            [2950.0, 0.0, 0.0],
            shells,
            100.0,
            ORIGIN,
            1e-9,
        );
        assert!(c.chi > 2900.0 && c.chi <= 3000.0);
        assert!(!c.closer_to_current);
    }

    #[test]
    fn boundary_straddling_pair_is_unwrapped() {
        let shells = Shells::new(3000.0, 2800.0).unwrap();
        // progenitor stored on the far side of a 100-wide box along y
        let wrapped = solve_crossing(
            [2900.0, 98.0, 0.0],
            [2850.0, 2.0, 0.0],
            shells,
            100.0,
            ORIGIN,
            1e-9,
        );
        let direct = solve_crossing(
            [2900.0, -2.0, 0.0],
            [2850.0, 2.0, 0.0],
            shells,
            100.0,
            ORIGIN,
            1e-9,
        );
        assert!((wrapped.chi - direct.chi).abs() < 1e-9);
        for ax in 0..3 {
            assert!((wrapped.position[ax] - direct.position[ax]).abs() < 1e-9);
            assert!((wrapped.velocity[ax] - direct.velocity[ax]).abs() < 1e-6);
        }
    }

    #[test]
    fn lockstep_motion_is_flagged() {
        let shells = Shells::new(3000.0, 2800.0).unwrap();
        // recedes exactly as fast as the shell shrinks: r - chi is constant
        let c = solve_crossing(
            [3050.0, 0.0, 0.0],
            [2850.0, 0.0, 0.0],
            shells,
            1000.0,
            ORIGIN,
            1e-9,
        );
        assert!(c.degenerate);
        assert!(c.closer_to_current);
        assert_eq!(c.chi, 2850.0);
        assert_eq!(c.position, [2850.0, 0.0, 0.0]);
        assert!(c.chi.is_finite());
    }

    #[test]
    fn shells_must_be_ordered() {
        assert!(Shells::new(2800.0, 3000.0).is_err());
        assert!(Shells::new(2800.0, 2800.0).is_err());
    }
}
