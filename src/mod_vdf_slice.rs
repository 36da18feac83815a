/*
File: mod_vdf_slice.rs
Copyright (C) 2025 Kostis Papadakis 2024/2025 (kpapadakis@protonmail.com)
This program is free software; you can redistribute it and/or modify
it under the terms of the GNU General Public License as published by
the Free Software Foundation; either version 2 of the License, or
(at your option) any later version.

Velocity distribution slices. The velocity cells of one spatial cell are
shifted to the requested frame, thresholded, re-expressed in the slice plane
and binned into a 2D histogram. A zero slab thickness projects the whole
distribution onto the plane.

The returned histogram is indexed [row, col] = [y bin, x bin].

EXAMPLES:
    let cfg = VdfSliceConfig { slice: Some(SliceKind::BPara), frame: FrameShift::Bulk, ..Default::default() };
    let outcome = slice_vdf(&f, 256, &cfg)?;
    if let Some(h) = outcome.histogram() { let (lo, hi) = h.positive_range().unwrap_or((1e-20, 1e-10)); }

Keywords:
    histogram_2d, vspace_reducer, slice_vdf, slice_vdfs, velocity_bins, resolve_bulk_velocity,
    sparsity_threshold, nearest_cell_with_vspace, cells_for_coordinates, default_slice
*/
use crate::mod_errors::{Error, Result};
use crate::mod_rotation::{rotate_vectors_to_vector, rotated_cube_extent, vec3};
use crate::mod_vlsv_reader::{SnapshotReader, VelocityMesh};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip, aview1};
use rayon::prelude::*;
use serde::Deserialize;
use std::f64::consts::PI;
use std::str::FromStr;
use tracing::{debug, info, warn};

pub const DEFAULT_SPARSITY_THRESHOLD: f64 = 1.0e-16;

/// Plane the distribution is sliced or projected onto.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SliceKind {
    Xy,
    Xz,
    Yz,
    /// Plane perpendicular to an arbitrary vector.
    Normal([f64; 3]),
    /// Plane perpendicular to the local magnetic field.
    BPerp,
    /// Plane spanned by the field direction (horizontal) and a perpendicular.
    BPara,
}

impl FromStr for SliceKind {
    type Err = Error;

    /// Named planes, or a normal vector written as `nx,ny,nz`.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "xy" => Ok(SliceKind::Xy),
            "xz" => Ok(SliceKind::Xz),
            "yz" => Ok(SliceKind::Yz),
            "bperp" => Ok(SliceKind::BPerp),
            "bpara" => Ok(SliceKind::BPara),
            other => {
                let parts = other
                    .split(',')
                    .map(|p| p.trim().parse::<f64>())
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|_| Error::InvalidArgument(format!("unknown slice '{s}'")))?;
                match parts.as_slice() {
                    [x, y, z] => Ok(SliceKind::Normal([*x, *y, *z])),
                    _ => Err(Error::InvalidArgument(format!("slice normal needs 3 components, got '{s}'"))),
                }
            }
        }
    }
}

/// Velocity frame the samples are expressed in before binning.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameShift {
    #[default]
    None,
    /// Plasma frame, bulk velocity taken from the first variable that resolves.
    Bulk,
    /// Plasma frame, trying the named variable before the usual candidates.
    BulkVariable(String),
    /// Frame moving at a fixed velocity.
    Center([f64; 3]),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct VdfSliceConfig {
    pub pop: String,
    /// `None` picks the plane from the run geometry.
    pub slice: Option<SliceKind>,
    /// Slab thickness in velocity cells. `None` widens it to cover a rotated
    /// cell, `Some(0.0)` projects the whole distribution.
    pub slice_thickness: Option<f64>,
    /// Bin width in velocity cells; overrides the rotation based ratio.
    pub cellsize: Option<f64>,
    pub flux: bool,
    pub frame: FrameShift,
    pub threshold: Option<f64>,
    pub coordswap: bool,
}

impl Default for VdfSliceConfig {
    fn default() -> Self {
        VdfSliceConfig {
            pop: "proton".to_string(),
            slice: None,
            slice_thickness: None,
            cellsize: None,
            flux: false,
            frame: FrameShift::None,
            threshold: None,
            coordswap: false,
        }
    }
}

/// Binned slice. `values` has shape `(edges_y.len() - 1, edges_x.len() - 1)`.
#[derive(Debug, Clone, PartialEq)]
pub struct SliceHistogram {
    pub values: Array2<f64>,
    pub edges_x: Vec<f64>,
    pub edges_y: Vec<f64>,
}

impl SliceHistogram {
    /// Exchanges the horizontal and vertical axes.
    pub fn swapped(self) -> Self {
        SliceHistogram {
            values: self.values.reversed_axes().as_standard_layout().into_owned(),
            edges_x: self.edges_y,
            edges_y: self.edges_x,
        }
    }

    /// Smallest and largest strictly positive bin, `None` if there is none.
    pub fn positive_range(&self) -> Option<(f64, f64)> {
        self.values
            .iter()
            .filter(|&&v| v > 0.0)
            .fold(None, |acc, &v| match acc {
                None => Some((v, v)),
                Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
            })
    }
}

/// Velocity cells of one spatial cell: centres `(N, 3)` and phase space densities.
#[derive(Debug, Clone, PartialEq)]
pub struct VelocitySamples {
    pub v: Array2<f64>,
    pub f: Array1<f64>,
}

impl VelocitySamples {
    pub fn read<R: SnapshotReader + ?Sized>(
        reader: &R,
        cellid: u64,
        pop: &str,
        mesh: &VelocityMesh,
    ) -> Result<Self> {
        let cells = reader.read_velocity_cells(cellid, pop)?;
        let ids: Vec<u64> = cells.iter().map(|(id, _)| *id).collect();
        Ok(VelocitySamples {
            v: mesh.cell_coordinates(&ids),
            f: cells.iter().map(|(_, f)| *f).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.f.len()
    }

    pub fn is_empty(&self) -> bool {
        self.f.is_empty()
    }

    /// Moves the samples into a frame travelling at `velocity`.
    pub fn shift(&mut self, velocity: [f64; 3]) {
        self.v -= &aview1(&velocity);
    }

    /// Samples with `f >= threshold`.
    pub fn above_threshold(&self, threshold: f64) -> Self {
        let keep: Vec<usize> = self
            .f
            .iter()
            .enumerate()
            .filter(|&(_, &f)| f >= threshold)
            .map(|(i, _)| i)
            .collect();
        VelocitySamples {
            v: self.v.select(Axis(0), &keep),
            f: self.f.select(Axis(0), &keep),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoData {
    /// The cell is flagged as not storing its distribution.
    NotSaved,
    EmptyVelocitySpace,
    /// Every velocity cell fell under the sparsity threshold.
    BelowThreshold,
    /// No sample landed inside the slab and the bin box.
    OutsideBins,
    /// No selected sample carries a positive weight.
    NonPositiveWeights,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SliceOutcome {
    Histogram(SliceHistogram),
    NoData(NoData),
}

impl SliceOutcome {
    pub fn histogram(&self) -> Option<&SliceHistogram> {
        match self {
            SliceOutcome::Histogram(h) => Some(h),
            SliceOutcome::NoData(_) => None,
        }
    }
}

fn validate_edges(axis: &str, edges: &[f64]) -> Result<()> {
    if edges.len() < 2 {
        return Err(Error::InvalidArgument(format!("{axis} bin edges need at least 2 values")));
    }
    if edges.windows(2).any(|w| !(w[1] > w[0])) {
        return Err(Error::InvalidArgument(format!("{axis} bin edges must be strictly increasing")));
    }
    Ok(())
}

/// Bins samples given in slice coordinates.
///
/// `v_plane` columns are (horizontal, vertical, out of plane). Samples must lie
/// strictly inside the bin box and, for a positive `thickness`, within half
/// the thickness of the plane. Each bin holds the mean weight of its samples.
/// With `thickness == 0` the histogram is rescaled so its total equals the
/// total selected weight. Flux weighting multiplies each weight by |v| and
/// divides the result by `4π` times the last horizontal bin width.
pub fn histogram_2d(
    f: ArrayView1<f64>,
    v_plane: ArrayView2<f64>,
    edges_x: &[f64],
    edges_y: &[f64],
    thickness: f64,
    flux_weighted: bool,
) -> Result<SliceOutcome> {
    validate_edges("horizontal", edges_x)?;
    validate_edges("vertical", edges_y)?;
    if v_plane.ncols() != 3 || v_plane.nrows() != f.len() {
        return Err(Error::InvalidArgument(format!(
            "expected ({}, 3) velocities, got {:?}",
            f.len(),
            v_plane.shape()
        )));
    }
    if !(thickness.is_finite() && thickness >= 0.0) {
        return Err(Error::InvalidArgument(format!("slab thickness must be non-negative, got {thickness}")));
    }

    let (nx, ny) = (edges_x.len() - 1, edges_y.len() - 1);
    let (x_lo, x_hi) = (edges_x[0], edges_x[nx]);
    let (y_lo, y_hi) = (edges_y[0], edges_y[ny]);

    let mut sums = Array2::<f64>::zeros((nx, ny));
    let mut counts = Array2::<u32>::zeros((nx, ny));
    let mut selected = 0usize;
    let mut selected_weight = 0.0;
    let mut any_positive = false;
    for (v, &fv) in v_plane.rows().into_iter().zip(f.iter()) {
        let (x, y, n) = (v[0], v[1], v[2]);
        if !(x > x_lo && x < x_hi && y > y_lo && y < y_hi) {
            continue;
        }
        if thickness > 0.0 && n.abs() > 0.5 * thickness {
            continue;
        }
        let w = if flux_weighted {
            fv * (x * x + y * y + n * n).sqrt()
        } else {
            fv
        };
        let i = edges_x.partition_point(|&e| e <= x) - 1;
        let j = edges_y.partition_point(|&e| e <= y) - 1;
        sums[[i, j]] += w;
        counts[[i, j]] += 1;
        selected += 1;
        selected_weight += w;
        any_positive |= w > 0.0;
    }
    if selected == 0 {
        return Ok(SliceOutcome::NoData(NoData::OutsideBins));
    }
    if !any_positive {
        return Ok(SliceOutcome::NoData(NoData::NonPositiveWeights));
    }

    Zip::from(&mut sums).and(&counts).for_each(|s, &c| {
        if c > 0 {
            *s /= c as f64;
        }
    });
    if thickness == 0.0 {
        let projected = sums.sum();
        if projected != 0.0 {
            sums *= selected_weight / projected;
        }
    }

    let mut values = sums.reversed_axes().as_standard_layout().into_owned();
    if flux_weighted {
        let dv = (edges_x[nx] - edges_x[nx - 1]).abs();
        values /= dv * 4.0 * PI;
    }
    debug!(selected, nx, ny, thickness, "binned velocity samples");
    Ok(SliceOutcome::Histogram(SliceHistogram {
        values,
        edges_x: edges_x.to_vec(),
        edges_y: edges_y.to_vec(),
    }))
}

fn to_vec3(name: &str, v: &[f64]) -> Result<[f64; 3]> {
    match v {
        [x, y, z, ..] => Ok([*x, *y, *z]),
        _ => Err(Error::Format(format!("'{name}' has {} components, expected 3", v.len()))),
    }
}

/// `proton` falls back to the legacy `avgs` population of older files.
pub fn resolve_population<R: SnapshotReader + ?Sized>(reader: &R, pop: &str) -> Result<String> {
    if reader.check_population(pop) {
        return Ok(pop.to_string());
    }
    if pop == "proton" && reader.check_population("avgs") {
        debug!("population 'proton' not found, using 'avgs'");
        return Ok("avgs".to_string());
    }
    Err(Error::MissingPopulation(pop.to_string()))
}

/// Bulk velocity of a cell. `explicit` is tried first, then restart file
/// moments, the plain bulk velocity variables, the per population ones and
/// finally `rho_v / rho`.
pub fn resolve_bulk_velocity<R: SnapshotReader + ?Sized>(
    reader: &R,
    cellid: u64,
    pop: &str,
    explicit: Option<&str>,
) -> Result<[f64; 3]> {
    if let Some(name) = explicit {
        if reader.check_variable(name) {
            info!(cellid, variable = name, "bulk velocity");
            return to_vec3(name, &reader.read_variable_at(name, cellid)?);
        }
        warn!(variable = name, "bulk velocity variable not found, trying defaults");
    }

    if reader.check_variable("moments") {
        let m = reader.read_variable_at("moments", cellid)?;
        match m.len() {
            4 if m[0] > 0.0 => {
                info!(cellid, variable = "moments", "bulk velocity");
                return Ok([m[1] / m[0], m[2] / m[0], m[3] / m[0]]);
            }
            5 => {
                info!(cellid, variable = "moments", "bulk velocity");
                return Ok([m[1], m[2], m[3]]);
            }
            n => warn!(cellid, components = n, "could not interpret moments"),
        }
    }

    let candidates = [
        "v".to_string(),
        "V".to_string(),
        "vg_v".to_string(),
        format!("{pop}/V"),
        format!("{pop}/vg_v"),
    ];
    for name in &candidates {
        if reader.check_variable(name) {
            info!(cellid, variable = name.as_str(), "bulk velocity");
            return to_vec3(name, &reader.read_variable_at(name, cellid)?);
        }
    }

    if reader.check_variable("rho_v") && reader.check_variable("rho") {
        let rho_v = to_vec3("rho_v", &reader.read_variable_at("rho_v", cellid)?)?;
        let rho = reader.read_variable_at("rho", cellid)?;
        if let Some(&rho) = rho.first().filter(|&&r| r > 0.0) {
            info!(cellid, variable = "rho_v", "bulk velocity");
            return Ok(vec3::scale(rho_v, 1.0 / rho));
        }
    }
    Err(Error::BulkVelocityUnresolved { cellid })
}

/// Phase space density below which velocity cells are dropped.
pub fn sparsity_threshold<R: SnapshotReader + ?Sized>(
    reader: &R,
    cellid: u64,
    pop: &str,
    explicit: Option<f64>,
) -> Result<f64> {
    if let Some(t) = explicit {
        return Ok(t);
    }
    let candidates = [
        "MinValue".to_string(),
        format!("{pop}/EffectiveSparsityThreshold"),
        format!("{pop}/vg_effectivesparsitythreshold"),
    ];
    for name in &candidates {
        if reader.check_variable(name) {
            let v = reader.read_variable_at(name, cellid)?;
            let t = v
                .first()
                .copied()
                .ok_or_else(|| Error::Format(format!("'{name}' is empty")))?;
            info!(cellid, variable = name.as_str(), threshold = t, "sparsity threshold");
            return Ok(t);
        }
    }
    warn!(
        cellid,
        threshold = DEFAULT_SPARSITY_THRESHOLD,
        "no sparsity threshold stored, using the default"
    );
    Ok(DEFAULT_SPARSITY_THRESHOLD)
}

/// Magnetic field of a cell from `B`, `background_B + perturbed_B` or `vg_b_vol`.
pub fn magnetic_field_at<R: SnapshotReader + ?Sized>(reader: &R, cellid: u64) -> Result<[f64; 3]> {
    if reader.check_variable("B") {
        return to_vec3("B", &reader.read_variable_at("B", cellid)?);
    }
    if reader.check_variable("background_B") && reader.check_variable("perturbed_B") {
        let bg = to_vec3("background_B", &reader.read_variable_at("background_B", cellid)?)?;
        let pert = to_vec3("perturbed_B", &reader.read_variable_at("perturbed_B", cellid)?)?;
        return Ok(vec3::add(bg, pert));
    }
    if reader.check_variable("vg_b_vol") {
        return to_vec3("vg_b_vol", &reader.read_variable_at("vg_b_vol", cellid)?);
    }
    Err(Error::MissingVariable("B".to_string()))
}

/// `xz` for polar runs (one cell in y), `xy` for ecliptic runs (one cell in z),
/// otherwise `yz`.
pub fn default_slice<R: SnapshotReader + ?Sized>(reader: &R) -> Result<SliceKind> {
    let ny = reader.read_parameter("ycells_ini")?;
    let nz = reader.read_parameter("zcells_ini")?;
    if ny == 1.0 {
        Ok(SliceKind::Xz)
    } else if nz == 1.0 {
        Ok(SliceKind::Xy)
    } else {
        warn!("run is neither polar nor ecliptic, slicing in yz");
        Ok(SliceKind::Yz)
    }
}

/// Normal of the slice plane at `cellid`.
pub fn slice_normal<R: SnapshotReader + ?Sized>(
    reader: &R,
    cellid: u64,
    slice: &SliceKind,
) -> Result<[f64; 3]> {
    match slice {
        SliceKind::Xy => Ok([0.0, 0.0, 1.0]),
        SliceKind::Xz => Ok([0.0, 1.0, 0.0]),
        SliceKind::Yz => Ok([1.0, 0.0, 0.0]),
        SliceKind::Normal(n) => Ok(*n),
        SliceKind::BPerp | SliceKind::BPara => magnetic_field_at(reader, cellid),
    }
}

/// Bin edges spanning the velocity mesh scaled by `gridratio`, one bin per
/// velocity cell. Rotated slices use the vx and vy extents.
pub fn velocity_bins(mesh: &VelocityMesh, slice: &SliceKind, gridratio: f64) -> (Vec<f64>, Vec<f64>) {
    let (ax, ay) = match slice {
        SliceKind::Xy => (0, 1),
        SliceKind::Xz => (0, 2),
        SliceKind::Yz => (1, 2),
        SliceKind::Normal(_) | SliceKind::BPerp | SliceKind::BPara => (0, 1),
    };
    let cells = mesh.cells();
    let edges = |a: usize| {
        Array1::linspace(mesh.min[a] * gridratio, mesh.max[a] * gridratio, cells[a] + 1).to_vec()
    };
    (edges(ax), edges(ay))
}

fn is_not_saved<R: SnapshotReader + ?Sized>(reader: &R, cellid: u64) -> Result<bool> {
    for name in ["fSaved", "vg_f_saved"] {
        if reader.check_variable(name) {
            let flag = reader.read_variable_at(name, cellid)?;
            return Ok(flag.first().copied() != Some(1.0));
        }
    }
    Ok(false)
}

/// Reduces the velocity distribution of `cellid` to a slice histogram.
///
/// `normal` orients the rotated slices and sizes the default slab.
pub fn vspace_reducer<R: SnapshotReader + ?Sized>(
    reader: &R,
    cellid: u64,
    slice: &SliceKind,
    normal: [f64; 3],
    edges_x: &[f64],
    edges_y: &[f64],
    config: &VdfSliceConfig,
) -> Result<SliceOutcome> {
    if is_not_saved(reader, cellid)? {
        debug!(cellid, "velocity distribution not saved");
        return Ok(SliceOutcome::NoData(NoData::NotSaved));
    }
    let pop = resolve_population(reader, &config.pop)?;
    let mesh = reader.velocity_mesh(&pop)?;
    let cell_size = mesh.cell_size()[0];

    let mut samples = VelocitySamples::read(reader, cellid, &pop, &mesh)?;
    debug!(cellid, pop = pop.as_str(), cells = samples.len(), "read velocity cells");
    if samples.is_empty() {
        return Ok(SliceOutcome::NoData(NoData::EmptyVelocitySpace));
    }

    match &config.frame {
        FrameShift::None => {}
        FrameShift::Bulk => samples.shift(resolve_bulk_velocity(reader, cellid, &pop, None)?),
        FrameShift::BulkVariable(name) => {
            samples.shift(resolve_bulk_velocity(reader, cellid, &pop, Some(name))?)
        }
        FrameShift::Center(c) => {
            info!(cellid, center = ?c, "shifting to a fixed frame");
            samples.shift(*c);
        }
    }

    let threshold = sparsity_threshold(reader, cellid, &pop, config.threshold)?;
    let VelocitySamples { v, f } = samples.above_threshold(threshold);
    if f.is_empty() {
        return Ok(SliceOutcome::NoData(NoData::BelowThreshold));
    }

    let thickness = match config.slice_thickness {
        None => cell_size * rotated_cube_extent(normal)?,
        Some(m) => cell_size * m,
    };
    if thickness == 0.0 {
        info!(cellid, "projecting the whole distribution onto the plane");
    } else {
        info!(cellid, thickness, "slicing");
    }

    let v_plane = match slice {
        SliceKind::Xy => v.select(Axis(1), &[0, 1, 2]),
        SliceKind::Yz => v.select(Axis(1), &[1, 2, 0]),
        SliceKind::Xz => v.select(Axis(1), &[0, 2, 1]),
        SliceKind::Normal(_) | SliceKind::BPerp => rotate_vectors_to_vector(v.view(), normal)?,
        SliceKind::BPara => rotate_vectors_to_vector(v.view(), normal)?.select(Axis(1), &[2, 1, 0]),
    };
    histogram_2d(f.view(), v_plane.view(), edges_x, edges_y, thickness, config.flux)
}

pub fn verify_cell_with_vspace<R: SnapshotReader + ?Sized>(reader: &R, cellid: u64, pop: &str) -> Result<bool> {
    Ok(reader.cells_with_vspace(pop)?.contains(&cellid))
}

/// Closest cell to `cellid` (by centre distance) that stores a distribution.
pub fn nearest_cell_with_vspace<R: SnapshotReader + ?Sized>(reader: &R, cellid: u64, pop: &str) -> Result<u64> {
    let candidates = reader.cells_with_vspace(pop)?;
    if candidates.is_empty() {
        return Err(Error::InvalidArgument(format!(
            "no velocity distributions stored for population '{pop}'"
        )));
    }
    let target = reader.cell_coordinates(cellid)?;
    let mut best = (f64::INFINITY, candidates[0]);
    for &c in &candidates {
        let d = vec3::norm(vec3::sub(reader.cell_coordinates(c)?, target));
        if d < best.0 {
            best = (d, c);
        }
    }
    Ok(best.1)
}

/// Unique, sorted cells with a distribution nearest to each coordinate.
pub fn cells_for_coordinates<R: SnapshotReader + ?Sized>(
    reader: &R,
    coordinates: &[[f64; 3]],
    pop: &str,
) -> Result<Vec<u64>> {
    let mut out = Vec::with_capacity(coordinates.len());
    for &p in coordinates {
        let cid = reader
            .cellid_at(p)?
            .ok_or_else(|| Error::InvalidArgument(format!("no cell contains {p:?}")))?;
        let nearest = nearest_cell_with_vspace(reader, cid, pop)?;
        debug!(requested = cid, nearest, "nearest cell with a distribution");
        out.push(nearest);
    }
    out.sort_unstable();
    out.dedup();
    Ok(out)
}

/// Full slice of one cell: population, plane, bins and slab follow `config`.
pub fn slice_vdf<R: SnapshotReader + ?Sized>(
    reader: &R,
    cellid: u64,
    config: &VdfSliceConfig,
) -> Result<SliceOutcome> {
    let pop = resolve_population(reader, &config.pop)?;
    if !verify_cell_with_vspace(reader, cellid, &pop)? {
        warn!(cellid, pop = pop.as_str(), "cell does not store a velocity distribution");
        return Ok(SliceOutcome::NoData(NoData::EmptyVelocitySpace));
    }
    let slice = match config.slice {
        Some(s) => s,
        None => default_slice(reader)?,
    };
    let normal = slice_normal(reader, cellid, &slice)?;
    let gridratio = match config.cellsize {
        Some(c) => c,
        None => rotated_cube_extent(normal)?,
    };
    let mesh = reader.velocity_mesh(&pop)?;
    let (edges_x, edges_y) = velocity_bins(&mesh, &slice, gridratio);
    debug!(cellid, ?slice, gridratio, "slicing velocity distribution");

    let outcome = vspace_reducer(reader, cellid, &slice, normal, &edges_x, &edges_y, config)?;
    Ok(match outcome {
        SliceOutcome::Histogram(h) if config.coordswap => SliceOutcome::Histogram(h.swapped()),
        other => other,
    })
}

/// `slice_vdf` over many cells in parallel, results in input order.
pub fn slice_vdfs<R: SnapshotReader + Sync + ?Sized>(
    reader: &R,
    cellids: &[u64],
    config: &VdfSliceConfig,
) -> Result<Vec<(u64, SliceOutcome)>> {
    cellids
        .par_iter()
        .map(|&cid| slice_vdf(reader, cid, config).map(|o| (cid, o)))
        .collect()
}
