/*
File: field_tracing.rs
Copyright (C) 2025 Kostis Papadakis 2024/2025 (kpapadakis@protonmail.com)
This program is free software; you can redistribute it and/or modify
it under the terms of the GNU General Public License as published by
the Free Software Foundation; either version 2 of the License, or
(at your option) any later version.
*/
use approx::assert_abs_diff_eq;
use ndarray::{Array2, Array4, array, s};
use vlsv_analysis::{
    Direction, Error, GridGeometry, MemorySnapshot, RadialBounds, Settings, Trace3dConfig, TraceConfig,
    dynamic_field_tracer, static_field_tracer, static_field_tracer_3d,
};

fn polar_snapshot(time: f64, b: [f64; 3]) -> MemorySnapshot {
    let geometry = GridGeometry::new([8, 1, 8], [-4.0, -0.5, -4.0], [4.0, 0.5, 4.0]).unwrap();
    let rows = Array2::from_shape_fn((geometry.num_cells(), 3), |(_, c)| b[c]);
    MemorySnapshot::new(geometry)
        .with_parameter("time", time)
        .with_variable("B", rows)
        .unwrap()
        .with_field("v", |_| vec![0.0, 0.0, 1.0])
}

#[test]
fn dynamic_tracer_advects_the_seed() {
    let snapshots = vec![polar_snapshot(0.0, [1.0, 0.0, 0.0]), polar_snapshot(2.0, [1.0, 0.0, 0.0])];
    let config = TraceConfig {
        max_iterations: 2,
        dx: 0.5,
        ..TraceConfig::default()
    };
    let streams = dynamic_field_tracer(&snapshots, [0.0, 0.0, 0.0], &config, "v").unwrap();
    assert_eq!(streams.len(), 2);
    // both directions are always traced
    assert_eq!(streams[0].len(), 5);
    assert_eq!(streams[0][2], [0.0, 0.0, 0.0]);
    assert_eq!(streams[1][2], [0.0, 0.0, 2.0]);
    assert_abs_diff_eq!(streams[1][0][0], -1.0, epsilon = 1e-9);
    assert_abs_diff_eq!(streams[1][4][0], 1.0, epsilon = 1e-9);
    assert_abs_diff_eq!(streams[1][4][2], 2.0, epsilon = 1e-9);

    assert!(matches!(
        dynamic_field_tracer(&snapshots[..1], [0.0; 3], &config, "v"),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn planar_trace_from_settings_is_repeatable() {
    let settings = Settings::from_toml_str(
        r#"
        [trace]
        direction = "-"
        max_iterations = 6
        dx = 0.25
        "#,
    )
    .unwrap();
    assert_eq!(settings.trace.direction, Direction::Backward);
    let snap = polar_snapshot(0.0, [0.0, 0.0, 3.0]);
    let first = static_field_tracer(&snap, [1.0, 0.0, 1.0], &settings.trace).unwrap();
    let second = static_field_tracer(&snap, [1.0, 0.0, 1.0], &settings.trace).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.len(), 7);
    assert_abs_diff_eq!(first[6][2], -0.5, epsilon = 1e-9);
    assert_abs_diff_eq!(first[6][0], 1.0, epsilon = 1e-9);
}

#[test]
fn forward_and_backward_mirror_each_other() {
    let geometry = GridGeometry::new([6, 6, 6], [-3.0; 3], [3.0; 3]).unwrap();
    let field = Array4::from_shape_fn((6, 6, 6, 3), |(_, _, _, c)| if c == 0 { 1.0 } else { 0.0 });
    let snap = MemorySnapshot::new(geometry).with_fsgrid_variable("fg_b", field);
    let seeds = array![[0.0, 0.0, 0.0], [0.0, 1.0, -1.0]];
    let bounds = RadialBounds {
        inner: 0.0,
        outer: 2.6,
    };
    let run = |direction| {
        let config = Trace3dConfig {
            grid_variable: "fg_b".to_string(),
            max_iterations: 6,
            dx: 0.5,
            direction,
        };
        static_field_tracer_3d(&snap, seeds.view(), &config, &bounds).unwrap()
    };
    let forward = run(Direction::Forward);
    let backward = run(Direction::Backward);
    for i in 0..6 {
        assert_abs_diff_eq!(forward[[0, i, 0]], -backward[[0, i, 0]], epsilon = 1e-12);
    }
    // |(2.5, 1, -1)| > 2.6, so the second seed freezes at x = 2
    let x = forward.slice(s![1, .., 0]).to_vec();
    for (got, want) in x.iter().zip([0.0, 0.5, 1.0, 1.5, 2.0, 2.0]) {
        assert_abs_diff_eq!(*got, want, epsilon = 1e-12);
    }
    assert_abs_diff_eq!(forward[[0, 5, 0]], 2.5, epsilon = 1e-12);

    let both = run(Direction::Both);
    assert_eq!(both.dim(), (2, 11, 3));
    assert_eq!(both.slice(s![.., 5, ..]), seeds);
    assert_eq!(both.slice(s![.., 6.., ..]), forward.slice(s![.., 1.., ..]));
}
