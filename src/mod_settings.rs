/*
File: mod_settings.rs
Copyright (C) 2025 Kostis Papadakis 2024/2025 (kpapadakis@protonmail.com)
This program is free software; you can redistribute it and/or modify
it under the terms of the GNU General Public License as published by
the Free Software Foundation; either version 2 of the License, or
(at your option) any later version.

Analysis settings loaded from TOML. Every table and key is optional.

    [trace]
    variable = "B"
    direction = "+-"
    dx = 5e4

    [trace_3d]
    grid_variable = "fg_b"

    [vdf]
    pop = "proton"
    slice = "bpara"
    frame = "bulk"
*/
use crate::mod_errors::Result;
use crate::mod_field_tracer::{Trace3dConfig, TraceConfig};
use crate::mod_vdf_slice::VdfSliceConfig;
use serde::Deserialize;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub trace: TraceConfig,
    pub trace_3d: Trace3dConfig,
    pub vdf: VdfSliceConfig,
}

impl Settings {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "loading settings");
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}
