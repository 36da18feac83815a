/*
File: mod_rotation.rs
Copyright (C) 2025 Kostis Papadakis 2024/2025 (kpapadakis@protonmail.com)
This program is free software; you can redistribute it and/or modify
it under the terms of the GNU General Public License as published by
the Free Software Foundation; either version 2 of the License, or
(at your option) any later version.

Rotations that bring a reference direction (magnetic field, slice normal)
onto a principal axis, so velocity samples can be binned in that frame.
*/
use crate::mod_errors::{Error, Result};
use ndarray::{Array2, ArrayView2};
use std::f64::consts::PI;

const PARALLEL_TOL: f64 = 1e-12;

pub(crate) mod vec3 {
    #[inline]
    pub fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
        a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
    }

    #[inline]
    pub fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
        [
            a[1] * b[2] - a[2] * b[1],
            a[2] * b[0] - a[0] * b[2],
            a[0] * b[1] - a[1] * b[0],
        ]
    }

    #[inline]
    pub fn norm(a: [f64; 3]) -> f64 {
        dot(a, a).sqrt()
    }

    #[inline]
    pub fn scale(a: [f64; 3], s: f64) -> [f64; 3] {
        [a[0] * s, a[1] * s, a[2] * s]
    }

    #[inline]
    pub fn add(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
        [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
    }

    #[inline]
    pub fn sub(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
        [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
    }
}

use vec3::{cross, dot, norm, scale};

fn unit(v: [f64; 3], what: &str) -> Result<[f64; 3]> {
    let n = norm(v);
    if !(n.is_finite() && n > 0.0) {
        return Err(Error::InvalidArgument(format!(
            "{what} must be a finite non-zero vector, got {v:?}"
        )));
    }
    Ok(scale(v, 1.0 / n))
}

/// Proper 3x3 rotation matrix, row major.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rotation {
    m: [[f64; 3]; 3],
}

impl Rotation {
    pub fn identity() -> Self {
        Rotation {
            m: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
        }
    }

    /// Rodrigues rotation by `angle` radians about `axis` (right hand rule).
    pub fn about_axis(axis: [f64; 3], angle: f64) -> Result<Self> {
        let [x, y, z] = unit(axis, "rotation axis")?;
        let (s, c) = angle.sin_cos();
        let t = 1.0 - c;
        Ok(Rotation {
            m: [
                [c + x * x * t, x * y * t - z * s, x * z * t + y * s],
                [y * x * t + z * s, c + y * y * t, y * z * t - x * s],
                [z * x * t - y * s, z * y * t + x * s, c + z * z * t],
            ],
        })
    }

    /// Rotation taking the direction of `reference` onto the direction of `target`.
    ///
    /// Parallel inputs give the identity. Antiparallel inputs give a half turn about
    /// an axis perpendicular to `target`, since the rotation axis is undefined there.
    pub fn aligning(reference: [f64; 3], target: [f64; 3]) -> Result<Self> {
        let a = unit(reference, "reference vector")?;
        let b = unit(target, "target vector")?;
        let axis = cross(a, b);
        let s = norm(axis);
        let c = dot(a, b);
        if s <= PARALLEL_TOL {
            if c > 0.0 {
                return Ok(Self::identity());
            }
            return Self::about_axis(perpendicular(b), PI);
        }
        Self::about_axis(axis, s.atan2(c))
    }

    /// Rotation taking `reference` onto the z axis.
    pub fn to_z(reference: [f64; 3]) -> Result<Self> {
        Self::aligning(reference, [0.0, 0.0, 1.0])
    }

    pub fn matrix(&self) -> [[f64; 3]; 3] {
        self.m
    }

    #[inline]
    pub fn apply(&self, v: [f64; 3]) -> [f64; 3] {
        [dot(self.m[0], v), dot(self.m[1], v), dot(self.m[2], v)]
    }

    /// Rotates every row of an (N, 3) array.
    pub fn apply_batch(&self, vectors: ArrayView2<f64>) -> Result<Array2<f64>> {
        if vectors.ncols() != 3 {
            return Err(Error::InvalidArgument(format!(
                "expected (N, 3) vectors, got {:?}",
                vectors.shape()
            )));
        }
        let rt = Array2::from_shape_fn((3, 3), |(i, j)| self.m[j][i]);
        Ok(vectors.dot(&rt))
    }

    pub fn inverse(&self) -> Self {
        let m = self.m;
        Rotation {
            m: std::array::from_fn(|i| std::array::from_fn(|j| m[j][i])),
        }
    }
}

fn perpendicular(v: [f64; 3]) -> [f64; 3] {
    let mut axis = 0;
    for i in 1..3 {
        if v[i].abs() < v[axis].abs() {
            axis = i;
        }
    }
    let mut e = [0.0; 3];
    e[axis] = 1.0;
    let p = cross(v, e);
    scale(p, 1.0 / norm(p))
}

/// Re-expresses (N, 3) vectors in the frame where `reference` points along z.
pub fn rotate_vectors_to_vector(
    vectors: ArrayView2<f64>,
    reference: [f64; 3],
) -> Result<Array2<f64>> {
    Rotation::to_z(reference)?.apply_batch(vectors)
}

/// Largest axis-aligned extent of a unit cube after rotating `normal` onto z.
///
/// Used as the ratio between slab thickness and velocity cell size so a
/// rotated slab still covers at least one full cell.
pub fn rotated_cube_extent(normal: [f64; 3]) -> Result<f64> {
    let rot = Rotation::to_z(normal)?;
    let mut lo = [f64::INFINITY; 3];
    let mut hi = [f64::NEG_INFINITY; 3];
    for corner in 0..8u8 {
        let p = [
            (corner & 1) as f64,
            ((corner >> 1) & 1) as f64,
            ((corner >> 2) & 1) as f64,
        ];
        let r = rot.apply(p);
        for d in 0..3 {
            lo[d] = lo[d].min(r[d]);
            hi[d] = hi[d].max(r[d]);
        }
    }
    Ok((0..3).map(|d| hi[d] - lo[d]).fold(0.0, f64::max))
}
