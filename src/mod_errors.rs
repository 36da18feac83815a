/*
File: mod_errors.rs
Copyright (C) 2025 Kostis Papadakis 2024/2025 (kpapadakis@protonmail.com)
This program is free software; you can redistribute it and/or modify
it under the terms of the GNU General Public License as published by
the Free Software Foundation; either version 2 of the License, or
(at your option) any later version.

Error type shared by the reader, the tracers and the VDF reducer.
*/
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("seed points must have shape (N, 3), got {0:?}")]
    SeedShape(Vec<usize>),

    #[error("no 'fg' or 'vg' component in variable name '{0}'")]
    UnknownGridTag(String),

    #[error("{0} centering is not implemented")]
    UnsupportedCentering(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("grid with cell counts {0:?} does not have exactly one degenerate axis")]
    NotQuasi2D([usize; 3]),

    #[error("cannot reshape {len} samples into a {shape:?} grid")]
    Reshape { len: usize, shape: [usize; 3] },

    #[error("variable '{0}' not found")]
    MissingVariable(String),

    #[error("parameter '{0}' not found")]
    MissingParameter(String),

    #[error("population '{0}' not found")]
    MissingPopulation(String),

    #[error("cell {0} not found")]
    MissingCell(u64),

    #[error("could not resolve a bulk velocity for cell {cellid}")]
    BulkVelocityUnresolved { cellid: u64 },

    #[error("malformed VLSV data: {0}")]
    Format(String),

    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Xml(#[from] serde_xml_rs::Error),

    #[error(transparent)]
    Settings(#[from] toml::de::Error),
}
