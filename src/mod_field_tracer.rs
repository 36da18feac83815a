/*
File: mod_field_tracer.rs
Copyright (C) 2025 Kostis Papadakis 2024/2025 (kpapadakis@protonmail.com)
This program is free software; you can redistribute it and/or modify
it under the terms of the GNU General Public License as published by
the Free Software Foundation; either version 2 of the License, or
(at your option) any later version.

Field line and streamline tracing with fixed-step forward Euler.
Every step moves a point by `dx` along the unit field direction. A seed that
meets its stop condition is frozen and repeats its last accepted position.

    static_field_tracer:     one seed through a quasi-2D run (spline sampled)
    static_field_tracer_3d:  many seeds, fsgrid ("fg") or spatial grid ("vg") variables
    dynamic_field_tracer:    one seed followed through a time series of snapshots

Keywords:
    Direction, StopCondition, RadialBounds, TraceConfig, Trace3dConfig, classify_grid_variable
*/
use crate::mod_errors::{Error, Result};
use crate::mod_grid_sampler::{
    Centering, FieldSampler, GridGeometry, PlanarFieldSampler, VolumeFieldSampler,
    order_by_cellid, reshape_to_grid,
};
use crate::mod_rotation::vec3::{add, norm, scale};
use crate::mod_vlsv_reader::SnapshotReader;
use ndarray::parallel::prelude::*;
use ndarray::{Array3, ArrayView2, ArrayViewMut1, Axis, concatenate, s};
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum Direction {
    #[default]
    #[serde(rename = "+")]
    Forward,
    #[serde(rename = "-")]
    Backward,
    #[serde(rename = "+-")]
    Both,
}

impl Direction {
    fn sign(self) -> f64 {
        match self {
            Direction::Backward => -1.0,
            _ => 1.0,
        }
    }
}

impl FromStr for Direction {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "+" => Ok(Direction::Forward),
            "-" => Ok(Direction::Backward),
            "+-" | "-+" => Ok(Direction::Both),
            other => Err(Error::InvalidArgument(format!("unknown direction '{other}'"))),
        }
    }
}

/// Predicate on a freshly stepped position; `true` freezes the seed.
pub trait StopCondition: Sync {
    fn should_stop(&self, p: &[f64; 3]) -> bool;
}

impl<F> StopCondition for F
where
    F: Fn(&[f64; 3]) -> bool + Sync,
{
    fn should_stop(&self, p: &[f64; 3]) -> bool {
        self(p)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NeverStop;

impl StopCondition for NeverStop {
    fn should_stop(&self, _p: &[f64; 3]) -> bool {
        false
    }
}

/// Stops inside `inner` or beyond `outer` distance from the origin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RadialBounds {
    pub inner: f64,
    pub outer: f64,
}

impl StopCondition for RadialBounds {
    fn should_stop(&self, p: &[f64; 3]) -> bool {
        let r = norm(*p);
        r < self.inner || r > self.outer
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldSource {
    /// Uniform field solver grid, read whole and interpolated locally.
    FieldSolver,
    /// AMR spatial grid, sampled through reader point queries.
    Spatial,
}

/// Picks the tracer from the first `/` component tagged `fg` or `vg`.
pub fn classify_grid_variable(name: &str) -> Result<FieldSource> {
    for part in name.split('/') {
        if part.starts_with("fg") {
            return Ok(FieldSource::FieldSolver);
        }
        if part.starts_with("vg") {
            return Ok(FieldSource::Spatial);
        }
    }
    Err(Error::UnknownGridTag(name.to_string()))
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    pub variable: String,
    /// `None` means face centering, or volume centering for `*vol*` variables.
    pub centering: Option<Centering>,
    /// Stop once the distance from the origin drops below this radius.
    pub boundary_inner: Option<f64>,
    pub max_iterations: usize,
    pub dx: f64,
    pub direction: Direction,
}

impl Default for TraceConfig {
    fn default() -> Self {
        TraceConfig {
            variable: "B".to_string(),
            centering: None,
            boundary_inner: None,
            max_iterations: 1000,
            dx: 1.0e4,
            direction: Direction::Forward,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Trace3dConfig {
    pub grid_variable: String,
    pub max_iterations: usize,
    pub dx: f64,
    pub direction: Direction,
}

impl Default for Trace3dConfig {
    fn default() -> Self {
        Trace3dConfig {
            grid_variable: "vg_b_vol".to_string(),
            max_iterations: 1000,
            dx: 1.0e4,
            direction: Direction::Forward,
        }
    }
}

fn validate_step(max_iterations: usize, dx: f64) -> Result<()> {
    if max_iterations == 0 {
        return Err(Error::InvalidArgument("max_iterations must be at least 1".to_string()));
    }
    if !(dx.is_finite() && dx > 0.0) {
        return Err(Error::InvalidArgument(format!("step length must be finite and positive, got {dx}")));
    }
    Ok(())
}

/// Zero field magnitude yields NaN, which then propagates along the path.
#[inline]
fn euler_step(p: [f64; 3], v: [f64; 3], step: f64) -> [f64; 3] {
    add(p, scale(v, step / norm(v)))
}

#[inline]
fn write_point(mut row: ArrayViewMut1<f64>, p: [f64; 3]) {
    row[0] = p[0];
    row[1] = p[1];
    row[2] = p[2];
}

fn planar_sampler<R: SnapshotReader + ?Sized>(reader: &R, config: &TraceConfig) -> Result<PlanarFieldSampler> {
    if config.variable != "B" {
        warn!(variable = %config.variable, "tracing a variable other than B");
    }
    let centering = match config.centering {
        Some(c) => c,
        None if config.variable.contains("vol") => {
            warn!(variable = %config.variable, "volume variable, switching to volume centering");
            Centering::Volume
        }
        None => Centering::Face,
    };
    if centering == Centering::Node {
        return Err(Error::UnsupportedCentering(centering.to_string()));
    }
    let geometry = GridGeometry::from_reader(reader)?;
    geometry.active_axes()?;
    let cellids = reader.read_cellids()?;
    let raw = reader.read_variable(&config.variable, None)?;
    if raw.ncols() != 3 {
        return Err(Error::InvalidArgument(format!(
            "'{}' has {} components, expected a vector",
            config.variable,
            raw.ncols()
        )));
    }
    let ordered = order_by_cellid(&cellids, raw.view())?;
    let grid = reshape_to_grid(ordered.view(), geometry.cells)?;
    PlanarFieldSampler::new(&geometry, centering, grid.view())
}

fn trace_planar(sampler: &PlanarFieldSampler, seed: [f64; 3], sign: f64, config: &TraceConfig) -> Vec<[f64; 3]> {
    let mut points = Vec::with_capacity(config.max_iterations + 1);
    points.push(seed);
    let mut p = seed;
    for _ in 0..config.max_iterations {
        let next = euler_step(p, sampler.sample(p), sign * config.dx);
        if config.boundary_inner.is_some_and(|r| norm(next) < r) {
            break;
        }
        points.push(next);
        p = next;
    }
    points
}

/// Traces one seed through a quasi-2D snapshot.
///
/// Returns at most `max_iterations + 1` points starting at the seed. With
/// `Direction::Both` the backward path is reversed and joined to the forward
/// path, and the seed appears once.
pub fn static_field_tracer<R: SnapshotReader + ?Sized>(
    reader: &R,
    seed: [f64; 3],
    config: &TraceConfig,
) -> Result<Vec<[f64; 3]>> {
    validate_step(config.max_iterations, config.dx)?;
    let sampler = planar_sampler(reader, config)?;
    let path = match config.direction {
        Direction::Both => {
            let mut path = trace_planar(&sampler, seed, -1.0, config);
            path.reverse();
            path.pop();
            path.extend(trace_planar(&sampler, seed, 1.0, config));
            path
        }
        d => trace_planar(&sampler, seed, d.sign(), config),
    };
    debug!(points = path.len(), axes = ?sampler.axes(), "traced planar field line");
    Ok(path)
}

fn fsgrid_sampler<R: SnapshotReader + ?Sized>(reader: &R, name: &str) -> Result<VolumeFieldSampler> {
    if name.contains("vol") {
        warn!(variable = name, "fsgrid tracing assumes face centred data");
    }
    let data = reader.read_fsgrid_variable(name)?;
    let (nx, ny, nz, nc) = data.dim();
    if nc < 3 {
        return Err(Error::InvalidArgument(format!("'{name}' has {nc} components, expected a vector")));
    }
    let geometry = GridGeometry::with_cells_from_reader(reader, [nx, ny, nz])?;
    VolumeFieldSampler::new(&geometry, Centering::Face, data.view())
}

fn trace_dense<F, S>(sampler: &F, seeds: ArrayView2<f64>, max_iterations: usize, step: f64, stop: &S) -> Array3<f64>
where
    F: FieldSampler,
    S: StopCondition + ?Sized,
{
    let mut out = Array3::<f64>::zeros((seeds.nrows(), max_iterations, 3));
    out.axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(seeds.axis_iter(Axis(0)).into_par_iter())
        .for_each(|(mut path, seed)| {
            let mut p = [seed[0], seed[1], seed[2]];
            let mut frozen = false;
            write_point(path.row_mut(0), p);
            for i in 1..max_iterations {
                if !frozen {
                    let next = euler_step(p, sampler.sample(p), step);
                    if stop.should_stop(&next) {
                        frozen = true;
                    } else {
                        p = next;
                    }
                }
                write_point(path.row_mut(i), p);
            }
        });
    out
}

/// Unique seed coordinates in first-seen order, and for every input row the
/// index of its unique coordinate.
fn dedup_seeds(seeds: ArrayView2<f64>) -> (Vec<[f64; 3]>, Vec<usize>) {
    let key = |v: f64| if v == 0.0 { 0.0f64.to_bits() } else { v.to_bits() };
    let mut seen: HashMap<[u64; 3], usize> = HashMap::new();
    let mut unique = Vec::new();
    let inverse = seeds
        .rows()
        .into_iter()
        .map(|r| {
            let p = [r[0], r[1], r[2]];
            *seen.entry(p.map(key)).or_insert_with(|| {
                unique.push(p);
                unique.len() - 1
            })
        })
        .collect();
    (unique, inverse)
}

fn trace_scattered<R, S>(
    reader: &R,
    name: &str,
    seeds: ArrayView2<f64>,
    max_iterations: usize,
    step: f64,
    stop: &S,
) -> Result<Array3<f64>>
where
    R: SnapshotReader + ?Sized,
    S: StopCondition + ?Sized,
{
    let (unique, inverse) = dedup_seeds(seeds);
    let n = unique.len();
    let mut current = unique;
    let mut active = vec![true; n];
    let mut paths = Array3::<f64>::zeros((n, max_iterations, 3));
    for (k, &p) in current.iter().enumerate() {
        write_point(paths.slice_mut(s![k, 0, ..]), p);
    }
    for i in 1..max_iterations {
        let live: Vec<usize> = (0..n).filter(|&k| active[k]).collect();
        if !live.is_empty() {
            let coords: Vec<[f64; 3]> = live.iter().map(|&k| current[k]).collect();
            let field = reader.read_interpolated_variable(name, &coords)?;
            if field.ncols() < 3 || field.nrows() != live.len() {
                return Err(Error::InvalidArgument(format!(
                    "'{name}' returned {:?} for {} query points",
                    field.shape(),
                    live.len()
                )));
            }
            for (row, &k) in field.rows().into_iter().zip(&live) {
                let next = euler_step(current[k], [row[0], row[1], row[2]], step);
                if stop.should_stop(&next) {
                    active[k] = false;
                } else {
                    current[k] = next;
                }
            }
        }
        for (k, &p) in current.iter().enumerate() {
            write_point(paths.slice_mut(s![k, i, ..]), p);
        }
    }
    debug!(seeds = seeds.nrows(), unique = n, "traced scattered field lines");
    Ok(paths.select(Axis(0), &inverse))
}

fn run_directions<F>(direction: Direction, trace: F) -> Result<Array3<f64>>
where
    F: Fn(f64) -> Result<Array3<f64>>,
{
    match direction {
        Direction::Both => {
            let backward = trace(-1.0)?;
            let forward = trace(1.0)?;
            Ok(concatenate(
                Axis(1),
                &[backward.slice(s![.., ..;-1, ..]), forward.slice(s![.., 1.., ..])],
            )?)
        }
        d => trace(d.sign()),
    }
}

/// Traces a batch of seeds, returning `(N, max_iterations, 3)` positions
/// (`(N, 2*max_iterations - 1, 3)` for `Direction::Both`).
///
/// `fg` variables are interpolated trilinearly on the face-centred field
/// solver grid, seeds in parallel. `vg` variables are sampled through the
/// reader with one query per step for all still-active unique seeds.
pub fn static_field_tracer_3d<R, S>(
    reader: &R,
    seeds: ArrayView2<f64>,
    config: &Trace3dConfig,
    stop: &S,
) -> Result<Array3<f64>>
where
    R: SnapshotReader + ?Sized,
    S: StopCondition + ?Sized,
{
    if seeds.ncols() != 3 {
        return Err(Error::SeedShape(seeds.shape().to_vec()));
    }
    validate_step(config.max_iterations, config.dx)?;
    let name = config.grid_variable.as_str();
    let (max_it, dx) = (config.max_iterations, config.dx);
    match classify_grid_variable(name)? {
        FieldSource::FieldSolver => {
            let sampler = fsgrid_sampler(reader, name)?;
            run_directions(config.direction, |sign| {
                Ok(trace_dense(&sampler, seeds, max_it, sign * dx, stop))
            })
        }
        FieldSource::Spatial => {
            let handle = reader.read_variable_to_cache(name)?;
            debug!(variable = %handle.variable, components = handle.components, "variable cached");
            run_directions(config.direction, |sign| {
                trace_scattered(reader, name, seeds, max_it, sign * dx, stop)
            })
        }
    }
}

/// Follows a seed through time ordered snapshots.
///
/// In every snapshot the field line through the current seed is traced in
/// both directions, then the seed is advected with the local bulk velocity
/// (`velocity_variable`) over the time step of the first two snapshots.
pub fn dynamic_field_tracer<R: SnapshotReader>(
    readers: &[R],
    seed: [f64; 3],
    config: &TraceConfig,
    velocity_variable: &str,
) -> Result<Vec<Vec<[f64; 3]>>> {
    let [first, second, ..] = readers else {
        return Err(Error::InvalidArgument("need at least two snapshots".to_string()));
    };
    let dt = second.read_time()? - first.read_time()?;
    let config = TraceConfig {
        direction: Direction::Both,
        ..config.clone()
    };
    let mut x0 = seed;
    let mut streams = Vec::with_capacity(readers.len());
    for (i, reader) in readers.iter().enumerate() {
        let stream = static_field_tracer(reader, x0, &config)?;
        let v = reader.read_interpolated_variable(velocity_variable, &[x0])?;
        if v.ncols() < 3 {
            return Err(Error::InvalidArgument(format!("'{velocity_variable}' is not a vector")));
        }
        info!(snapshot = i, points = stream.len(), seed = ?x0, "traced snapshot");
        x0 = add(x0, scale([v[[0, 0]], v[[0, 1]], v[[0, 2]]], dt));
        streams.push(stream);
    }
    Ok(streams)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mod_memory_snapshot::MemorySnapshot;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, Array4, array};

    fn uniform_planar(b: [f64; 3]) -> MemorySnapshot {
        let geometry = GridGeometry::new([8, 1, 8], [-4.0, -0.5, -4.0], [4.0, 0.5, 4.0]).unwrap();
        let n = geometry.num_cells();
        let rows = Array2::from_shape_fn((n, 3), |(_, c)| b[c]);
        MemorySnapshot::new(geometry).with_variable("B", rows).unwrap()
    }

    fn planar_config(max_iterations: usize, dx: f64) -> TraceConfig {
        TraceConfig {
            max_iterations,
            dx,
            ..TraceConfig::default()
        }
    }

    #[test]
    fn direction_and_grid_tags_parse() {
        assert_eq!("+-".parse::<Direction>().unwrap(), Direction::Both);
        assert_eq!("-".parse::<Direction>().unwrap(), Direction::Backward);
        assert!("up".parse::<Direction>().is_err());
        assert_eq!(classify_grid_variable("fg_b").unwrap(), FieldSource::FieldSolver);
        assert_eq!(classify_grid_variable("proton/vg_v").unwrap(), FieldSource::Spatial);
        assert!(matches!(classify_grid_variable("B"), Err(Error::UnknownGridTag(_))));
    }

    #[test]
    fn planar_trace_follows_uniform_field() {
        let snap = uniform_planar([2.0, 0.0, 0.0]);
        let path = static_field_tracer(&snap, [-2.0, 0.0, 1.0], &planar_config(4, 0.5)).unwrap();
        assert_eq!(path.len(), 5);
        for (i, p) in path.iter().enumerate() {
            assert_abs_diff_eq!(p[0], -2.0 + 0.5 * i as f64, epsilon = 1e-12);
            assert_abs_diff_eq!(p[2], 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn planar_inner_boundary_truncates() {
        let snap = uniform_planar([-1.0, 0.0, 0.0]);
        let config = TraceConfig {
            boundary_inner: Some(1.5),
            ..planar_config(10, 1.0)
        };
        let path = static_field_tracer(&snap, [3.0, 0.0, 0.0], &config).unwrap();
        assert_eq!(path.len(), 2);
        assert_abs_diff_eq!(path[1][0], 2.0, epsilon = 1e-12);
    }

    #[test]
    fn planar_both_directions_share_seed() {
        let snap = uniform_planar([0.0, 0.0, 1.0]);
        let config = TraceConfig {
            direction: Direction::Both,
            ..planar_config(3, 0.25)
        };
        let path = static_field_tracer(&snap, [0.0, 0.0, 0.0], &config).unwrap();
        assert_eq!(path.len(), 7);
        assert_abs_diff_eq!(path[0][2], -0.75, epsilon = 1e-12);
        assert_eq!(path[3], [0.0, 0.0, 0.0]);
        assert_abs_diff_eq!(path[6][2], 0.75, epsilon = 1e-12);
    }

    #[test]
    fn planar_rejects_node_centering_and_full_3d_grids() {
        let snap = uniform_planar([1.0, 0.0, 0.0]);
        let config = TraceConfig {
            centering: Some(Centering::Node),
            ..planar_config(3, 0.1)
        };
        assert!(matches!(
            static_field_tracer(&snap, [0.0; 3], &config),
            Err(Error::UnsupportedCentering(_))
        ));
        let geometry = GridGeometry::new([3, 3, 3], [0.0; 3], [3.0; 3]).unwrap();
        let cube = MemorySnapshot::new(geometry)
            .with_variable("B", Array2::ones((27, 3)))
            .unwrap();
        assert!(matches!(
            static_field_tracer(&cube, [1.0; 3], &planar_config(3, 0.1)),
            Err(Error::NotQuasi2D(_))
        ));
    }

    fn fsgrid_snapshot() -> MemorySnapshot {
        let geometry = GridGeometry::new([4, 4, 4], [0.0; 3], [4.0; 3]).unwrap();
        let field = Array4::from_shape_fn((4, 4, 4, 3), |(_, _, _, c)| if c == 2 { 2.0 } else { 0.0 });
        MemorySnapshot::new(geometry).with_fsgrid_variable("fg_b", field)
    }

    fn fg_config(max_iterations: usize, direction: Direction) -> Trace3dConfig {
        Trace3dConfig {
            grid_variable: "fg_b".to_string(),
            max_iterations,
            dx: 0.5,
            direction,
        }
    }

    #[test]
    fn fg_batch_steps_and_freezes() {
        let snap = fsgrid_snapshot();
        let seeds = array![[1.0, 1.0, 1.0], [2.0, 2.0, 0.5]];
        let stop = |p: &[f64; 3]| p[2] > 2.2;
        let out = static_field_tracer_3d(&snap, seeds.view(), &fg_config(5, Direction::Forward), &stop).unwrap();
        assert_eq!(out.dim(), (2, 5, 3));
        let z: Vec<f64> = out.slice(s![0, .., 2]).to_vec();
        assert_eq!(z, vec![1.0, 1.5, 2.0, 2.0, 2.0]);
        let z: Vec<f64> = out.slice(s![1, .., 2]).to_vec();
        assert_eq!(z, vec![0.5, 1.0, 1.5, 2.0, 2.0]);
        assert_eq!(out[[1, 4, 0]], 2.0);
    }

    #[test]
    fn fg_both_directions_concatenate() {
        let snap = fsgrid_snapshot();
        let seeds = array![[1.5, 1.5, 1.5]];
        let out = static_field_tracer_3d(&snap, seeds.view(), &fg_config(3, Direction::Both), &NeverStop).unwrap();
        assert_eq!(out.dim(), (1, 5, 3));
        let z: Vec<f64> = out.slice(s![0, .., 2]).to_vec();
        assert_eq!(z, vec![0.5, 1.0, 1.5, 2.0, 2.5]);
    }

    #[test]
    fn vg_batch_dedups_and_queries_once_per_step() {
        let geometry = GridGeometry::new([4, 4, 4], [-2.0; 3], [2.0; 3]).unwrap();
        let snap = MemorySnapshot::new(geometry).with_field("vg_b_vol", |_| vec![0.0, 3.0, 0.0]);
        let seeds = array![[0.0, 0.0, 0.0], [1.0, -1.0, 0.0], [0.0, 0.0, 0.0]];
        let config = Trace3dConfig {
            max_iterations: 4,
            dx: 0.25,
            ..Trace3dConfig::default()
        };
        let out = static_field_tracer_3d(&snap, seeds.view(), &config, &NeverStop).unwrap();
        assert_eq!(out.dim(), (3, 4, 3));
        assert_eq!(out.slice(s![0, .., ..]), out.slice(s![2, .., ..]));
        assert_abs_diff_eq!(out[[1, 3, 1]], -0.25, epsilon = 1e-12);
        assert_eq!(snap.interpolation_queries(), 3);
    }

    fn swirl() -> MemorySnapshot {
        let geometry = GridGeometry::new([4, 4, 4], [-4.0; 3], [4.0; 3]).unwrap();
        MemorySnapshot::new(geometry).with_field("vg_b_vol", |p| vec![-p[1], p[0], 0.3])
    }

    fn vg_config(max_iterations: usize, dx: f64, direction: Direction) -> Trace3dConfig {
        Trace3dConfig {
            grid_variable: "vg_b_vol".to_string(),
            max_iterations,
            dx,
            direction,
        }
    }

    #[test]
    fn repeated_seeds_trace_like_a_single_seed() {
        let snap = swirl();
        let config = vg_config(12, 0.1, Direction::Both);
        let batch = array![[1.0, 0.5, -0.5], [0.0, 2.0, 1.0], [1.0, 0.5, -0.5]];
        let many = static_field_tracer_3d(&snap, batch.view(), &config, &NeverStop).unwrap();
        let single = static_field_tracer_3d(&snap, array![[1.0, 0.5, -0.5]].view(), &config, &NeverStop).unwrap();
        assert_eq!(many.slice(s![0, .., ..]), single.slice(s![0, .., ..]));
        assert_eq!(many.slice(s![2, .., ..]), single.slice(s![0, .., ..]));
        assert_ne!(many.slice(s![1, .., ..]), single.slice(s![0, .., ..]));
    }

    #[test]
    fn backward_pass_returns_near_the_seed() {
        let snap = swirl();
        let seed = [1.0, 0.0, 0.0];
        let seeds = Array2::from(vec![seed]);
        let forward = static_field_tracer_3d(&snap, seeds.view(), &vg_config(21, 0.05, Direction::Forward), &NeverStop)
            .unwrap();
        let end = forward.slice(s![.., 20, ..]).to_owned();
        let back = static_field_tracer_3d(&snap, end.view(), &vg_config(21, 0.05, Direction::Backward), &NeverStop)
            .unwrap();
        let dist = |a: [f64; 3], b: [f64; 3]| norm(add(a, scale(b, -1.0)));
        let end = [end[[0, 0]], end[[0, 1]], end[[0, 2]]];
        let returned = [back[[0, 20, 0]], back[[0, 20, 1]], back[[0, 20, 2]]];
        assert!(dist(end, seed) > 0.5);
        // Euler drift grows like N * dx^2
        assert!(dist(returned, seed) < 0.1, "returned to {returned:?}");
    }

    #[test]
    fn zero_field_propagates_nan() {
        let geometry = GridGeometry::new([4, 4, 4], [-2.0; 3], [2.0; 3]).unwrap();
        let snap = MemorySnapshot::new(geometry).with_field("vg_b_vol", |_| vec![0.0; 3]);
        let seeds = array![[0.0, 0.0, 0.0]];
        let config = Trace3dConfig {
            max_iterations: 3,
            ..Trace3dConfig::default()
        };
        let out = static_field_tracer_3d(&snap, seeds.view(), &config, &NeverStop).unwrap();
        assert_eq!(out[[0, 0, 0]], 0.0);
        assert!(out[[0, 1, 0]].is_nan());
        assert!(out[[0, 2, 2]].is_nan());
    }

    #[test]
    fn batch_input_validation() {
        let snap = fsgrid_snapshot();
        let bad = Array2::<f64>::zeros((2, 2));
        assert!(matches!(
            static_field_tracer_3d(&snap, bad.view(), &fg_config(3, Direction::Forward), &NeverStop),
            Err(Error::SeedShape(_))
        ));
        let seeds = array![[1.0, 1.0, 1.0]];
        assert!(matches!(
            static_field_tracer_3d(&snap, seeds.view(), &fg_config(0, Direction::Forward), &NeverStop),
            Err(Error::InvalidArgument(_))
        ));
        let config = Trace3dConfig {
            grid_variable: "B".to_string(),
            ..fg_config(3, Direction::Forward)
        };
        assert!(matches!(
            static_field_tracer_3d(&snap, seeds.view(), &config, &NeverStop),
            Err(Error::UnknownGridTag(_))
        ));
    }

    #[test]
    fn radial_bounds_stop() {
        let bounds = RadialBounds { inner: 1.0, outer: 5.0 };
        assert!(bounds.should_stop(&[0.5, 0.0, 0.0]));
        assert!(bounds.should_stop(&[0.0, 6.0, 0.0]));
        assert!(!bounds.should_stop(&[0.0, 0.0, 3.0]));
    }
}
