/*
File: vdf_slice.rs
Copyright (C) 2025 Kostis Papadakis 2024/2025 (kpapadakis@protonmail.com)
This program is free software; you can redistribute it and/or modify
it under the terms of the GNU General Public License as published by
the Free Software Foundation; either version 2 of the License, or
(at your option) any later version.
*/
use approx::assert_abs_diff_eq;
use vlsv_analysis::mod_vdf_slice::cells_for_coordinates;
use vlsv_analysis::{
    GridGeometry, MemorySnapshot, NoData, SliceOutcome, VdfSliceConfig, VelocityMesh, slice_vdfs,
};

fn vcell(i: u64, j: u64, k: u64) -> u64 {
    i + 4 * j + 16 * k
}

fn polar_run() -> MemorySnapshot {
    let mesh = VelocityMesh {
        blocks: [1, 1, 1],
        block_width: 4,
        min: [-2.0; 3],
        max: [2.0; 3],
    };
    MemorySnapshot::new(GridGeometry::new([2, 1, 1], [0.0; 3], [2.0, 1.0, 1.0]).unwrap())
        .with_population("proton", mesh)
        .with_velocity_cells(
            "proton",
            1,
            vec![
                // (1.5, -0.5, -1.5) and (1.5, 0.5, -1.5) share an xz bin
                (vcell(3, 1, 0), 2.0),
                (vcell(3, 2, 0), 4.0),
                // (-1.5, 0.5, 0.5)
                (vcell(0, 2, 2), 1.0),
            ],
        )
        .unwrap()
}

#[test]
fn projects_every_cell_in_order() {
    let snap = polar_run();
    let cfg = VdfSliceConfig {
        slice_thickness: Some(0.0),
        coordswap: true,
        ..Default::default()
    };
    let out = slice_vdfs(&snap, &[1, 2], &cfg).unwrap();
    assert_eq!(out.len(), 2);
    assert_eq!(out[1], (2, SliceOutcome::NoData(NoData::EmptyVelocitySpace)));

    let (cid, outcome) = &out[0];
    assert_eq!(*cid, 1);
    let h = outcome.histogram().unwrap();
    // default plane of a polar run is xz, swapped so rows follow vx
    assert_eq!(h.values.dim(), (4, 4));
    assert_abs_diff_eq!(h.values.sum(), 7.0, epsilon = 1e-12);
    assert_abs_diff_eq!(h.values[[3, 0]], 5.25, epsilon = 1e-12);
    assert_abs_diff_eq!(h.values[[0, 2]], 1.75, epsilon = 1e-12);
    let (lo, hi) = h.positive_range().unwrap();
    assert_abs_diff_eq!(lo, 1.75, epsilon = 1e-12);
    assert_abs_diff_eq!(hi, 5.25, epsilon = 1e-12);
}

#[test]
fn coordinates_map_to_cells_with_distributions() {
    let snap = polar_run();
    let cells = cells_for_coordinates(&snap, &[[1.7, 0.5, 0.5], [0.1, 0.9, 0.2]], "proton").unwrap();
    assert_eq!(cells, vec![1]);
}
