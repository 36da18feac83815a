/*
File: lib.rs
Copyright (C) 2025 Kostis Papadakis 2024/2025 (kpapadakis@protonmail.com)
This program is free software; you can redistribute it and/or modify
it under the terms of the GNU General Public License as published by
the Free Software Foundation; either version 2 of the License, or
(at your option) any later version.

Field line tracing and velocity distribution slicing for Vlasiator
snapshots. Numbers in, numbers out: plotting is left to the caller.

EXAMPLES:
    let f = VlsvFile::new("bulk.0001000.vlsv")?;
    let line = static_field_tracer(&f, [-1.0e8, 0.0, 2.0e7], &TraceConfig::default())?;
    let seeds = ndarray::array![[5.0e7, 0.0, 0.0], [6.0e7, 0.0, 0.0]];
    let lines = static_field_tracer_3d(&f, seeds.view(), &Trace3dConfig::default(), &NeverStop)?;
    let vdf = slice_vdf(&f, 256, &VdfSliceConfig::default())?;

There are 5 main parts here:
1) MOD_VLSV_READER:
    SnapshotReader query surface and the memory mapped VlsvFile backend.
    MOD_MEMORY_SNAPSHOT is an in-memory SnapshotReader for synthetic data.

    Keywords:
    read_parameter, read_variable, read_fsgrid_variable, read_interpolated_variable,
    read_velocity_cells, cellid_at

2) MOD_GRID_SAMPLER:
    Cell ordering, quadratic spline surfaces for quasi-2D runs, trilinear
    interpolation for 3D runs and between neighbouring AMR cells.

    Keywords:
    GridGeometry, order_by_cellid, reshape_to_grid, QuadraticSurface, PlanarFieldSampler,
    TrilinearInterpolator, VolumeFieldSampler, interpolate_cell_centred

3) MOD_FIELD_TRACER:
    Fixed step Euler tracing of field lines and streamlines.

    Keywords:
    static_field_tracer, static_field_tracer_3d, dynamic_field_tracer, StopCondition, RadialBounds

4) MOD_ROTATION:
    Rotations aligning a vector with an axis.

    Keywords:
    Rotation, rotate_vectors_to_vector, rotated_cube_extent

5) MOD_VDF_SLICE:
    Slices and projections of velocity distributions into 2D histograms.

    Keywords:
    histogram_2d, vspace_reducer, slice_vdf, slice_vdfs, velocity_bins

Settings for all of the above load from TOML through MOD_SETTINGS.
*/
pub mod mod_errors;
pub mod mod_field_tracer;
pub mod mod_grid_sampler;
pub mod mod_memory_snapshot;
pub mod mod_rotation;
pub mod mod_settings;
pub mod mod_vdf_slice;
pub mod mod_vlsv_reader;

pub use mod_errors::{Error, Result};
pub use mod_field_tracer::{
    Direction, NeverStop, RadialBounds, StopCondition, Trace3dConfig, TraceConfig,
    dynamic_field_tracer, static_field_tracer, static_field_tracer_3d,
};
pub use mod_grid_sampler::{Centering, FieldSampler, GridGeometry};
pub use mod_memory_snapshot::MemorySnapshot;
pub use mod_rotation::{Rotation, rotate_vectors_to_vector, rotated_cube_extent};
pub use mod_settings::Settings;
pub use mod_vdf_slice::{
    FrameShift, NoData, SliceHistogram, SliceKind, SliceOutcome, VdfSliceConfig, VelocitySamples,
    histogram_2d, slice_vdf, slice_vdfs, vspace_reducer,
};
pub use mod_vlsv_reader::{SnapshotReader, VelocityMesh, VlsvFile};
