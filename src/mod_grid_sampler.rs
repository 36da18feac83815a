/*
File: mod_grid_sampler.rs
Copyright (C) 2025 Kostis Papadakis 2024/2025 (kpapadakis@protonmail.com)
This program is free software; you can redistribute it and/or modify
it under the terms of the GNU General Public License as published by
the Free Software Foundation; either version 2 of the License, or
(at your option) any later version.

Structured grid helpers: cell geometry, CellID ordering, and the two field
interpolators used by the tracers.
    PlanarFieldSampler: quadratic tensor-product B-splines over the two active
        axes of a quasi-2D run. Queries are clamped to the data range.
    VolumeFieldSampler: trilinear over all three axes, NaN outside the data.
    interpolate_cell_centred: trilinear between neighbouring cells found by a
        lookup, so it also works on refined meshes without a dense copy.

Keywords:
    GridGeometry, Centering, order_by_cellid, reshape_to_grid, QuadraticSurface, TrilinearInterpolator,
    interpolate_cell_centred
*/
use crate::mod_errors::{Error, Result};
use crate::mod_vlsv_reader::SnapshotReader;
use ndarray::{Array2, Array3, Array4, ArrayView2, ArrayView4, Axis, Order};
use serde::Deserialize;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Centering {
    Face,
    Volume,
    Node,
}

impl FromStr for Centering {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "face" => Ok(Centering::Face),
            "volume" | "vol" => Ok(Centering::Volume),
            "node" => Ok(Centering::Node),
            other => Err(Error::InvalidArgument(format!("unknown centering '{other}'"))),
        }
    }
}

impl std::fmt::Display for Centering {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Centering::Face => "face",
            Centering::Volume => "volume",
            Centering::Node => "node",
        };
        f.write_str(s)
    }
}

/// Uniform cartesian grid: cell counts and outer extents per axis.
#[derive(Debug, Clone, PartialEq)]
pub struct GridGeometry {
    pub cells: [usize; 3],
    pub min: [f64; 3],
    pub max: [f64; 3],
}

impl GridGeometry {
    pub fn new(cells: [usize; 3], min: [f64; 3], max: [f64; 3]) -> Result<Self> {
        for d in 0..3 {
            if cells[d] == 0 || !(max[d] > min[d]) {
                return Err(Error::InvalidArgument(format!(
                    "bad grid along axis {d}: {} cells over [{}, {}]",
                    cells[d], min[d], max[d]
                )));
            }
        }
        Ok(GridGeometry { cells, min, max })
    }

    /// Base (level 0) spatial grid of a snapshot.
    pub fn from_reader<R: SnapshotReader + ?Sized>(reader: &R) -> Result<Self> {
        let cells = [
            reader.read_parameter("xcells_ini")? as usize,
            reader.read_parameter("ycells_ini")? as usize,
            reader.read_parameter("zcells_ini")? as usize,
        ];
        Self::with_cells_from_reader(reader, cells)
    }

    /// Snapshot extents with an explicit cell count, e.g. the field solver grid.
    pub fn with_cells_from_reader<R: SnapshotReader + ?Sized>(
        reader: &R,
        cells: [usize; 3],
    ) -> Result<Self> {
        let min = [
            reader.read_parameter("xmin")?,
            reader.read_parameter("ymin")?,
            reader.read_parameter("zmin")?,
        ];
        let max = [
            reader.read_parameter("xmax")?,
            reader.read_parameter("ymax")?,
            reader.read_parameter("zmax")?,
        ];
        Self::new(cells, min, max)
    }

    pub fn num_cells(&self) -> usize {
        self.cells.iter().product()
    }

    pub fn cell_width(&self) -> [f64; 3] {
        std::array::from_fn(|d| (self.max[d] - self.min[d]) / self.cells[d] as f64)
    }

    /// Cell centre coordinates along `axis`, shifted by `shift` cell widths.
    pub fn axis_centers(&self, axis: usize, shift: f64) -> Vec<f64> {
        let d = self.cell_width()[axis];
        (0..self.cells[axis])
            .map(|i| self.min[axis] + (i as f64 + 0.5 + shift) * d)
            .collect()
    }

    /// Inclusive on both ends.
    pub fn contains(&self, p: [f64; 3]) -> bool {
        (0..3).all(|d| p[d] >= self.min[d] && p[d] <= self.max[d])
    }

    /// Index of the cell holding `p` on the grid refined `level` times,
    /// clamped to the grid.
    pub fn cell_index_at(&self, p: [f64; 3], level: u32) -> [usize; 3] {
        std::array::from_fn(|d| {
            let n = self.cells[d] << level;
            let frac = (p[d] - self.min[d]) / (self.max[d] - self.min[d]);
            ((frac * n as f64).floor().max(0.0) as usize).min(n - 1)
        })
    }

    /// The two non-degenerate axes of a quasi-2D grid, ascending.
    pub fn active_axes(&self) -> Result<[usize; 2]> {
        let flat: Vec<usize> = (0..3).filter(|&d| self.cells[d] <= 1).collect();
        match flat.as_slice() {
            [d] => {
                let mut it = (0..3).filter(|a| a != d);
                match (it.next(), it.next()) {
                    (Some(a), Some(b)) => Ok([a, b]),
                    _ => Err(Error::NotQuasi2D(self.cells)),
                }
            }
            _ => Err(Error::NotQuasi2D(self.cells)),
        }
    }
}

/// Sorts read-order rows by ascending CellID.
pub fn order_by_cellid(cellids: &[u64], samples: ArrayView2<f64>) -> Result<Array2<f64>> {
    if cellids.len() != samples.nrows() {
        return Err(Error::InvalidArgument(format!(
            "{} cell ids for {} sample rows",
            cellids.len(),
            samples.nrows()
        )));
    }
    let mut order: Vec<usize> = (0..cellids.len()).collect();
    order.sort_unstable_by_key(|&i| cellids[i]);
    Ok(samples.select(Axis(0), &order))
}

/// Reshapes CellID-ordered rows (x fastest) into `[x, y, z, component]`.
pub fn reshape_to_grid(ordered: ArrayView2<f64>, cells: [usize; 3]) -> Result<Array4<f64>> {
    let [nx, ny, nz] = cells;
    if ordered.nrows() != nx * ny * nz {
        return Err(Error::Reshape {
            len: ordered.nrows(),
            shape: cells,
        });
    }
    let ncomp = ordered.ncols();
    let grid = ordered
        .to_shape(((nx, ny, nz, ncomp), Order::F))
        .map_err(|_| Error::Reshape {
            len: ordered.nrows(),
            shape: cells,
        })?;
    Ok(grid.to_owned())
}

/// Anything the tracers can step through.
pub trait FieldSampler: Sync {
    fn sample(&self, p: [f64; 3]) -> [f64; 3];
}

/// One-dimensional quadratic B-spline basis interpolating at the data points.
/// Triple knots at both ends, interior knots at the midpoints of the data.
#[derive(Debug, Clone)]
struct QuadraticBasis {
    knots: Vec<f64>,
    n: usize,
}

impl QuadraticBasis {
    fn new(x: &[f64]) -> Result<Self> {
        let n = x.len();
        if n < 3 || x.windows(2).any(|w| !(w[1] > w[0])) {
            return Err(Error::InvalidArgument(format!(
                "quadratic spline needs at least 3 strictly increasing points, got {n}"
            )));
        }
        let mut knots = Vec::with_capacity(n + 3);
        knots.extend([x[0]; 3]);
        knots.extend((1..n - 2).map(|i| 0.5 * (x[i] + x[i + 1])));
        knots.extend([x[n - 1]; 3]);
        Ok(QuadraticBasis { knots, n })
    }

    /// First non-zero basis index and the three non-zero values at `x`.
    fn eval(&self, x: f64) -> (usize, [f64; 3]) {
        let t = &self.knots;
        let x = x.clamp(t[0], t[self.n + 2]);
        let l = 2 + t[3..self.n].partition_point(|&k| k <= x);
        let mut nb = [1.0, 0.0, 0.0];
        let mut left = [0.0; 3];
        let mut right = [0.0; 3];
        for j in 1..=2 {
            left[j] = x - t[l + 1 - j];
            right[j] = t[l + j] - x;
            let mut saved = 0.0;
            for r in 0..j {
                let temp = nb[r] / (right[r + 1] + left[j - r]);
                nb[r] = saved + right[r + 1] * temp;
                saved = left[j - r] * temp;
            }
            nb[j] = saved;
        }
        (l - 2, nb)
    }

    fn collocation(&self, x: &[f64]) -> Result<BandedLu> {
        let mut rows = vec![[0.0; 5]; self.n];
        for (i, &xi) in x.iter().enumerate() {
            let (first, vals) = self.eval(xi);
            for (p, v) in vals.into_iter().enumerate() {
                let off = (first + p + 2)
                    .checked_sub(i)
                    .filter(|&o| o < 5)
                    .ok_or_else(|| {
                        Error::InvalidArgument("spline collocation left the band".to_string())
                    })?;
                rows[i][off] = v;
            }
        }
        BandedLu::factor(rows)
    }
}

/// LU of a pentadiagonal matrix without pivoting.
/// Row `i` stores `A[i][j]` at `rows[i][j + 2 - i]`.
/// B-spline collocation matrices are totally positive so no pivoting is needed.
#[derive(Debug, Clone)]
struct BandedLu {
    rows: Vec<[f64; 5]>,
}

impl BandedLu {
    fn factor(mut rows: Vec<[f64; 5]>) -> Result<Self> {
        let n = rows.len();
        for k in 0..n {
            let pivot = rows[k][2];
            if pivot.abs() < f64::MIN_POSITIVE {
                return Err(Error::InvalidArgument(
                    "singular spline collocation matrix".to_string(),
                ));
            }
            for i in k + 1..(k + 3).min(n) {
                let l = rows[i][k + 2 - i] / pivot;
                rows[i][k + 2 - i] = l;
                for j in k + 1..(k + 3).min(n) {
                    rows[i][j + 2 - i] -= l * rows[k][j + 2 - k];
                }
            }
        }
        Ok(BandedLu { rows })
    }

    fn solve(&self, b: &mut [f64]) {
        let n = self.rows.len();
        for i in 0..n {
            for k in i.saturating_sub(2)..i {
                b[i] -= self.rows[i][k + 2 - i] * b[k];
            }
        }
        for i in (0..n).rev() {
            for j in i + 1..(i + 3).min(n) {
                b[i] -= self.rows[i][j + 2 - i] * b[j];
            }
            b[i] /= self.rows[i][2];
        }
    }
}

/// Interpolating tensor-product quadratic spline on a rectangular grid
/// (degree 2 along both axes, no smoothing).
#[derive(Debug, Clone)]
pub struct QuadraticSurface {
    basis_a: QuadraticBasis,
    basis_b: QuadraticBasis,
    coefs: Array2<f64>,
}

impl QuadraticSurface {
    pub fn fit(xa: &[f64], xb: &[f64], values: ArrayView2<f64>) -> Result<Self> {
        if values.dim() != (xa.len(), xb.len()) {
            return Err(Error::InvalidArgument(format!(
                "spline values {:?} do not match axes ({}, {})",
                values.shape(),
                xa.len(),
                xb.len()
            )));
        }
        let basis_a = QuadraticBasis::new(xa)?;
        let basis_b = QuadraticBasis::new(xb)?;
        let lu_a = basis_a.collocation(xa)?;
        let lu_b = basis_b.collocation(xb)?;

        let mut coefs = values.to_owned();
        let mut buf = vec![0.0; xa.len()];
        for mut col in coefs.columns_mut() {
            buf.iter_mut().zip(col.iter()).for_each(|(b, &v)| *b = v);
            lu_a.solve(&mut buf);
            col.iter_mut().zip(buf.iter()).for_each(|(c, &v)| *c = v);
        }
        let mut buf = vec![0.0; xb.len()];
        for mut row in coefs.rows_mut() {
            buf.iter_mut().zip(row.iter()).for_each(|(b, &v)| *b = v);
            lu_b.solve(&mut buf);
            row.iter_mut().zip(buf.iter()).for_each(|(c, &v)| *c = v);
        }
        Ok(QuadraticSurface {
            basis_a,
            basis_b,
            coefs,
        })
    }

    pub fn eval(&self, a: f64, b: f64) -> f64 {
        let (ia, wa) = self.basis_a.eval(a);
        let (ib, wb) = self.basis_b.eval(b);
        let mut acc = 0.0;
        for (p, &u) in wa.iter().enumerate() {
            for (q, &v) in wb.iter().enumerate() {
                acc += u * v * self.coefs[[ia + p, ib + q]];
            }
        }
        acc
    }
}

/// Vector field on a quasi-2D grid, one spline surface per in-plane component.
/// The out-of-plane component is reported as zero.
#[derive(Debug, Clone)]
pub struct PlanarFieldSampler {
    axes: [usize; 2],
    surfaces: [QuadraticSurface; 2],
}

impl PlanarFieldSampler {
    /// `field` is indexed `[x, y, z, component]` and must match `geometry.cells`.
    pub fn new(geometry: &GridGeometry, centering: Centering, field: ArrayView4<f64>) -> Result<Self> {
        if centering == Centering::Node {
            return Err(Error::UnsupportedCentering(centering.to_string()));
        }
        check_field_dims(geometry, &field)?;
        let axes = geometry.active_axes()?;
        let flat = 3 - axes[0] - axes[1];
        let plane = field.index_axis(Axis(flat), 0);

        let fit = |comp: usize| -> Result<QuadraticSurface> {
            let shift = |axis: usize| {
                if centering == Centering::Face && axis == comp {
                    -0.5
                } else {
                    0.0
                }
            };
            let xa = geometry.axis_centers(axes[0], shift(axes[0]));
            let xb = geometry.axis_centers(axes[1], shift(axes[1]));
            QuadraticSurface::fit(&xa, &xb, plane.index_axis(Axis(2), comp))
        };
        let surfaces = [fit(axes[0])?, fit(axes[1])?];
        Ok(PlanarFieldSampler { axes, surfaces })
    }

    pub fn axes(&self) -> [usize; 2] {
        self.axes
    }
}

impl FieldSampler for PlanarFieldSampler {
    fn sample(&self, p: [f64; 3]) -> [f64; 3] {
        let [a, b] = self.axes;
        let mut out = [0.0; 3];
        for (k, &comp) in self.axes.iter().enumerate() {
            out[comp] = self.surfaces[k].eval(p[a], p[b]);
        }
        out
    }
}

/// Trilinear interpolation of a scalar on a rectilinear grid.
/// Out-of-range queries give NaN; an axis with a single node is unconstrained.
#[derive(Debug, Clone)]
pub struct TrilinearInterpolator {
    coords: [Vec<f64>; 3],
    values: Array3<f64>,
}

impl TrilinearInterpolator {
    pub fn new(coords: [Vec<f64>; 3], values: Array3<f64>) -> Result<Self> {
        let dims = values.dim();
        if [dims.0, dims.1, dims.2] != [coords[0].len(), coords[1].len(), coords[2].len()] {
            return Err(Error::InvalidArgument(format!(
                "interpolator values {:?} do not match axes",
                values.shape()
            )));
        }
        Ok(TrilinearInterpolator { coords, values })
    }

    #[inline]
    fn locate(x: &[f64], v: f64) -> Option<(usize, f64)> {
        let n = x.len();
        if n == 1 {
            return Some((0, 0.0));
        }
        if !(v >= x[0] && v <= x[n - 1]) {
            return None;
        }
        let i = x.partition_point(|&c| c <= v).saturating_sub(1).min(n - 2);
        Some((i, (v - x[i]) / (x[i + 1] - x[i])))
    }

    pub fn eval(&self, p: [f64; 3]) -> f64 {
        let mut idx = [0usize; 3];
        let mut w = [0.0; 3];
        for d in 0..3 {
            match Self::locate(&self.coords[d], p[d]) {
                Some((i, t)) => {
                    idx[d] = i;
                    w[d] = t;
                }
                None => return f64::NAN,
            }
        }
        let mut acc = 0.0;
        for corner in 0..8usize {
            let mut weight = 1.0;
            let mut at = idx;
            for d in 0..3 {
                if (corner >> d) & 1 == 1 {
                    weight *= w[d];
                    at[d] += 1;
                } else {
                    weight *= 1.0 - w[d];
                }
            }
            if weight != 0.0 {
                acc += weight * self.values[at];
            }
        }
        acc
    }
}

/// Vector field on a full 3D grid, one trilinear interpolator per component.
#[derive(Debug, Clone)]
pub struct VolumeFieldSampler {
    components: Vec<TrilinearInterpolator>,
}

impl VolumeFieldSampler {
    pub fn new(geometry: &GridGeometry, centering: Centering, field: ArrayView4<f64>) -> Result<Self> {
        if centering == Centering::Node {
            return Err(Error::UnsupportedCentering(centering.to_string()));
        }
        check_field_dims(geometry, &field)?;
        let components = (0..field.len_of(Axis(3)))
            .map(|comp| {
                let coords = std::array::from_fn(|axis| {
                    let shift = if centering == Centering::Face && axis == comp {
                        -0.5
                    } else {
                        0.0
                    };
                    geometry.axis_centers(axis, shift)
                });
                TrilinearInterpolator::new(coords, field.index_axis(Axis(3), comp).to_owned())
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(VolumeFieldSampler { components })
    }
}

impl FieldSampler for VolumeFieldSampler {
    fn sample(&self, p: [f64; 3]) -> [f64; 3] {
        std::array::from_fn(|c| self.components.get(c).map_or(0.0, |i| i.eval(p)))
    }
}

/// Cell found at a query point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellHit {
    pub cellid: u64,
    /// Row of the cell in the variable's file order.
    pub row: usize,
    pub center: [f64; 3],
    pub width: [f64; 3],
}

/// Trilinear interpolation of cell-centred rows at `p`.
///
/// The eight support points lie one cell width apart around the cell that
/// holds `p`; each takes the row of whichever cell `locate` finds there, so
/// refined neighbours answer at their own level. Support points beyond the
/// domain fall back to the holding cell. Points outside `domain` give NaN.
pub fn interpolate_cell_centred<L>(
    domain: &GridGeometry,
    rows: ArrayView2<f64>,
    p: [f64; 3],
    locate: L,
) -> Result<Vec<f64>>
where
    L: Fn([f64; 3]) -> Result<Option<CellHit>>,
{
    let nan = vec![f64::NAN; rows.ncols()];
    if !domain.contains(p) {
        return Ok(nan);
    }
    let Some(home) = locate(p)? else {
        return Ok(nan);
    };
    let lo: [f64; 3] = std::array::from_fn(|d| {
        if p[d] >= home.center[d] {
            home.center[d]
        } else {
            home.center[d] - home.width[d]
        }
    });
    let t: [f64; 3] = std::array::from_fn(|d| (p[d] - lo[d]) / home.width[d]);

    let mut acc = vec![0.0; rows.ncols()];
    for corner in 0..8usize {
        let mut weight = 1.0;
        let mut q = lo;
        for d in 0..3 {
            if (corner >> d) & 1 == 1 {
                weight *= t[d];
                q[d] += home.width[d];
            } else {
                weight *= 1.0 - t[d];
            }
            if !(q[d] >= domain.min[d] && q[d] <= domain.max[d]) {
                q[d] = home.center[d];
            }
        }
        if weight == 0.0 {
            continue;
        }
        let row = locate(q)?.map_or(home.row, |hit| hit.row);
        if row >= rows.nrows() {
            return Err(Error::Format(format!(
                "cell row {row} past the {} stored rows",
                rows.nrows()
            )));
        }
        for (a, &v) in acc.iter_mut().zip(rows.row(row)) {
            *a += weight * v;
        }
    }
    Ok(acc)
}

fn check_field_dims(geometry: &GridGeometry, field: &ArrayView4<f64>) -> Result<()> {
    let (nx, ny, nz, _) = field.dim();
    if [nx, ny, nz] != geometry.cells {
        return Err(Error::Reshape {
            len: nx * ny * nz,
            shape: geometry.cells,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array4, array};

    fn poly(a: f64, b: f64) -> f64 {
        1.0 + 2.0 * a - b + 0.5 * a * a + a * b - 0.3 * b * b + 0.1 * a * a * b * b
    }

    #[test]
    fn quadratic_surface_reproduces_biquadratic() {
        let xa = [0.0, 0.5, 1.5, 2.0, 3.2];
        let xb = [-1.0, 0.0, 0.7, 2.0];
        let values = Array2::from_shape_fn((xa.len(), xb.len()), |(i, j)| poly(xa[i], xb[j]));
        let s = QuadraticSurface::fit(&xa, &xb, values.view()).unwrap();
        for &(a, b) in &[(1.1, 0.3), (0.2, -0.8), (3.0, 1.9), (2.0, 0.7)] {
            assert_abs_diff_eq!(s.eval(a, b), poly(a, b), epsilon = 1e-9);
        }
    }

    #[test]
    fn quadratic_surface_interpolates_nodes_and_clamps() {
        let xa = [0.0, 1.0, 2.0, 3.0];
        let xb = [0.0, 1.0, 2.0];
        let values = array![[1.0, -2.0, 0.5], [3.0, 0.0, 4.0], [-1.0, 2.0, 2.0], [0.0, 1.0, -3.0]];
        let s = QuadraticSurface::fit(&xa, &xb, values.view()).unwrap();
        for (i, &a) in xa.iter().enumerate() {
            for (j, &b) in xb.iter().enumerate() {
                assert_abs_diff_eq!(s.eval(a, b), values[[i, j]], epsilon = 1e-12);
            }
        }
        assert_abs_diff_eq!(s.eval(10.0, 0.5), s.eval(3.0, 0.5), epsilon = 1e-12);
        assert_abs_diff_eq!(s.eval(-4.0, -4.0), values[[0, 0]], epsilon = 1e-12);
    }

    #[test]
    fn spline_needs_three_points() {
        let values = Array2::<f64>::zeros((2, 3));
        assert!(QuadraticSurface::fit(&[0.0, 1.0], &[0.0, 1.0, 2.0], values.view()).is_err());
    }

    #[test]
    fn trilinear_is_exact_for_linear_fields_and_nan_outside() {
        let xs = vec![0.0, 1.0, 2.0];
        let ys = vec![0.0, 2.0];
        let zs = vec![-1.0, 0.0, 1.0, 3.0];
        let f = |x: f64, y: f64, z: f64| 2.0 * x - y + 0.5 * z + 1.0;
        let values = Array3::from_shape_fn((3, 2, 4), |(i, j, k)| f(xs[i], ys[j], zs[k]));
        let interp = TrilinearInterpolator::new([xs, ys, zs], values).unwrap();
        assert_abs_diff_eq!(interp.eval([0.3, 1.7, 2.2]), f(0.3, 1.7, 2.2), epsilon = 1e-12);
        assert_abs_diff_eq!(interp.eval([2.0, 2.0, 3.0]), f(2.0, 2.0, 3.0), epsilon = 1e-12);
        assert!(interp.eval([2.1, 1.0, 0.0]).is_nan());
        assert!(interp.eval([f64::NAN, 1.0, 0.0]).is_nan());
    }

    fn uniform_locator(g: &GridGeometry) -> impl Fn([f64; 3]) -> Result<Option<CellHit>> + '_ {
        move |p| {
            let ijk = g.cell_index_at(p, 0);
            let w = g.cell_width();
            let row = ijk[0] + ijk[1] * g.cells[0] + ijk[2] * g.cells[0] * g.cells[1];
            Ok(Some(CellHit {
                cellid: row as u64 + 1,
                row,
                center: std::array::from_fn(|d| g.min[d] + (ijk[d] as f64 + 0.5) * w[d]),
                width: w,
            }))
        }
    }

    #[test]
    fn cell_centred_interpolation_reaches_the_boundary() {
        let g = GridGeometry::new([4, 2, 1], [0.0; 3], [4.0, 2.0, 1.0]).unwrap();
        // value = x of the cell centre
        let rows = Array2::from_shape_fn((8, 1), |(r, _)| (r % 4) as f64 + 0.5);
        let at = |p| interpolate_cell_centred(&g, rows.view(), p, uniform_locator(&g)).unwrap()[0];
        assert_abs_diff_eq!(at([2.2, 1.3, 0.5]), 2.2, epsilon = 1e-12);
        assert_abs_diff_eq!(at([1.0, 0.0, 0.0]), 1.0, epsilon = 1e-12);
        // half a cell from the walls the outermost value is held
        assert_abs_diff_eq!(at([3.8, 1.9, 0.9]), 3.5, epsilon = 1e-12);
        assert_abs_diff_eq!(at([0.1, 0.1, 0.1]), 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(at([4.0, 2.0, 1.0]), 3.5, epsilon = 1e-12);
        assert!(at([4.01, 1.0, 0.5]).is_nan());
        assert!(at([f64::NAN, 1.0, 0.5]).is_nan());
    }

    #[test]
    fn single_node_axis_is_unconstrained() {
        let values = Array3::from_shape_fn((2, 1, 2), |(i, _, k)| (i + 2 * k) as f64);
        let interp = TrilinearInterpolator::new([vec![0.0, 1.0], vec![5.0], vec![0.0, 1.0]], values).unwrap();
        assert_abs_diff_eq!(interp.eval([0.5, -100.0, 0.5]), 1.5, epsilon = 1e-12);
    }

    #[test]
    fn cellid_ordering_and_reshape() {
        let cellids = [3u64, 1, 4, 2];
        let samples = array![[30.0, 0.3], [10.0, 0.1], [40.0, 0.4], [20.0, 0.2]];
        let ordered = order_by_cellid(&cellids, samples.view()).unwrap();
        assert_eq!(ordered.column(0).to_vec(), vec![10.0, 20.0, 30.0, 40.0]);
        let grid = reshape_to_grid(ordered.view(), [2, 2, 1]).unwrap();
        assert_eq!(grid[[1, 0, 0, 0]], 20.0);
        assert_eq!(grid[[0, 1, 0, 0]], 30.0);
        assert_eq!(grid[[1, 1, 0, 1]], 0.4);
        assert!(matches!(
            reshape_to_grid(ordered.view(), [3, 1, 1]),
            Err(Error::Reshape { len: 4, .. })
        ));
    }

    #[test]
    fn active_axes_need_one_flat_axis() {
        let g = |cells| GridGeometry::new(cells, [0.0; 3], [1.0; 3]).unwrap();
        assert_eq!(g([4, 1, 5]).active_axes().unwrap(), [0, 2]);
        assert_eq!(g([1, 4, 5]).active_axes().unwrap(), [1, 2]);
        assert_eq!(g([4, 5, 1]).active_axes().unwrap(), [0, 1]);
        assert!(matches!(g([4, 5, 6]).active_axes(), Err(Error::NotQuasi2D(_))));
        assert!(matches!(g([4, 1, 1]).active_axes(), Err(Error::NotQuasi2D(_))));
    }

    #[test]
    fn planar_sampler_recovers_uniform_field() {
        let geometry = GridGeometry::new([5, 1, 4], [0.0, -0.5, 0.0], [5.0, 0.5, 4.0]).unwrap();
        let mut field = Array4::<f64>::zeros((5, 1, 4, 3));
        field.index_axis_mut(Axis(3), 0).fill(2.0);
        field.index_axis_mut(Axis(3), 1).fill(7.0);
        field.index_axis_mut(Axis(3), 2).fill(-1.0);
        let sampler = PlanarFieldSampler::new(&geometry, Centering::Face, field.view()).unwrap();
        let v = sampler.sample([2.2, 0.0, 1.3]);
        assert_abs_diff_eq!(v[0], 2.0, epsilon = 1e-12);
        assert_eq!(v[1], 0.0);
        assert_abs_diff_eq!(v[2], -1.0, epsilon = 1e-12);
    }

    #[test]
    fn node_centering_is_rejected() {
        let geometry = GridGeometry::new([3, 1, 3], [0.0; 3], [3.0, 1.0, 3.0]).unwrap();
        let field = Array4::<f64>::zeros((3, 1, 3, 3));
        assert!(matches!(
            PlanarFieldSampler::new(&geometry, Centering::Node, field.view()),
            Err(Error::UnsupportedCentering(_))
        ));
        assert!(matches!(
            VolumeFieldSampler::new(&geometry, Centering::Node, field.view()),
            Err(Error::UnsupportedCentering(_))
        ));
    }

    #[test]
    fn face_centering_shifts_own_axis_only() {
        let geometry = GridGeometry::new([4, 4, 4], [0.0; 3], [4.0; 3]).unwrap();
        let field = Array4::from_shape_fn((4, 4, 4, 3), |(i, j, k, c)| match c {
            0 => i as f64,
            1 => j as f64,
            _ => k as f64,
        });
        let sampler = VolumeFieldSampler::new(&geometry, Centering::Face, field.view()).unwrap();
        let v = sampler.sample([1.0, 1.5, 2.5]);
        assert_abs_diff_eq!(v[0], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(v[1], 1.5, epsilon = 1e-12);
        assert_abs_diff_eq!(v[2], 2.5, epsilon = 1e-12);
        let vol = VolumeFieldSampler::new(&geometry, Centering::Volume, field.view()).unwrap();
        assert_abs_diff_eq!(vol.sample([1.5, 1.5, 1.5])[0], 1.0, epsilon = 1e-12);
        assert!(vol.sample([0.2, 1.5, 1.5])[0].is_nan());
    }

    #[test]
    fn centering_parses() {
        assert_eq!("Face".parse::<Centering>().unwrap(), Centering::Face);
        assert_eq!("vol".parse::<Centering>().unwrap(), Centering::Volume);
        assert!("edge".parse::<Centering>().is_err());
    }
}
