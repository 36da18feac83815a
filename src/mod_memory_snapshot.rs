/*
File: mod_memory_snapshot.rs
Copyright (C) 2025 Kostis Papadakis 2024/2025 (kpapadakis@protonmail.com)
This program is free software; you can redistribute it and/or modify
it under the terms of the GNU General Public License as published by
the Free Software Foundation; either version 2 of the License, or
(at your option) any later version.

In-memory snapshot on a uniform (non-AMR) grid. Handy for synthetic fields
and for driving the tracers and the VDF reducer without a VLSV file.
*/
use crate::mod_errors::{Error, Result};
use crate::mod_grid_sampler::{CellHit, GridGeometry, interpolate_cell_centred};
use crate::mod_vlsv_reader::{CacheHandle, SnapshotReader, VelocityMesh};
use ndarray::{Array2, Array4, Axis};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

pub type AnalyticField = Box<dyn Fn([f64; 3]) -> Vec<f64> + Send + Sync>;

struct Population {
    mesh: VelocityMesh,
    cells: Vec<(u64, Vec<(u64, f64)>)>,
}

pub struct MemorySnapshot {
    geometry: GridGeometry,
    parameters: HashMap<String, f64>,
    cellids: Vec<u64>,
    variables: HashMap<String, Array2<f64>>,
    fsgrid: HashMap<String, Array4<f64>>,
    fields: HashMap<String, AnalyticField>,
    populations: HashMap<String, Population>,
    interpolation_queries: AtomicUsize,
}

impl MemorySnapshot {
    /// Snapshot over `geometry` with CellIDs `1..=N` stored in x-fastest order.
    pub fn new(geometry: GridGeometry) -> Self {
        let mut parameters = HashMap::new();
        for (d, axis) in ["x", "y", "z"].iter().enumerate() {
            parameters.insert(format!("{axis}min"), geometry.min[d]);
            parameters.insert(format!("{axis}max"), geometry.max[d]);
            parameters.insert(format!("{axis}cells_ini"), geometry.cells[d] as f64);
        }
        let cellids = (1..=geometry.num_cells() as u64).collect();
        MemorySnapshot {
            geometry,
            parameters,
            cellids,
            variables: HashMap::new(),
            fsgrid: HashMap::new(),
            fields: HashMap::new(),
            populations: HashMap::new(),
            interpolation_queries: AtomicUsize::new(0),
        }
    }

    /// Replaces the file order of the cells. Must be a permutation of `1..=N`
    /// and be set before any variable is added.
    pub fn with_cell_order(mut self, cellids: Vec<u64>) -> Result<Self> {
        let mut sorted = cellids.clone();
        sorted.sort_unstable();
        if sorted != self.cellids || !self.variables.is_empty() {
            return Err(Error::InvalidArgument(
                "cell order must permute 1..=N before variables are added".to_string(),
            ));
        }
        self.cellids = cellids;
        Ok(self)
    }

    pub fn with_parameter(mut self, name: &str, value: f64) -> Self {
        self.parameters.insert(name.to_string(), value);
        self
    }

    /// Per-cell rows in the current cell order.
    pub fn with_variable(mut self, name: &str, rows: Array2<f64>) -> Result<Self> {
        if rows.nrows() != self.cellids.len() {
            return Err(Error::Reshape {
                len: rows.nrows(),
                shape: self.geometry.cells,
            });
        }
        self.variables.insert(name.to_string(), rows);
        Ok(self)
    }

    pub fn with_fsgrid_variable(mut self, name: &str, data: Array4<f64>) -> Self {
        self.fsgrid.insert(name.to_string(), data);
        self
    }

    /// Variable given as a closure of position, used for point interpolation.
    pub fn with_field<F>(mut self, name: &str, field: F) -> Self
    where
        F: Fn([f64; 3]) -> Vec<f64> + Send + Sync + 'static,
    {
        self.fields.insert(name.to_string(), Box::new(field));
        self
    }

    pub fn with_population(mut self, pop: &str, mesh: VelocityMesh) -> Self {
        self.populations.insert(
            pop.to_string(),
            Population {
                mesh,
                cells: Vec::new(),
            },
        );
        self
    }

    pub fn with_velocity_cells(mut self, pop: &str, cellid: u64, cells: Vec<(u64, f64)>) -> Result<Self> {
        let population = self
            .populations
            .get_mut(pop)
            .ok_or_else(|| Error::MissingPopulation(pop.to_string()))?;
        population.cells.retain(|(c, _)| *c != cellid);
        population.cells.push((cellid, cells));
        Ok(self)
    }

    /// Number of `read_interpolated_variable` calls served so far.
    pub fn interpolation_queries(&self) -> usize {
        self.interpolation_queries.load(Ordering::Relaxed)
    }

    fn index_of(&self, cellid: u64) -> Result<usize> {
        self.cellids
            .iter()
            .position(|&c| c == cellid)
            .ok_or(Error::MissingCell(cellid))
    }

    fn locate(&self, p: [f64; 3], rows: &HashMap<u64, usize>) -> Option<CellHit> {
        let g = &self.geometry;
        let ijk = g.cell_index_at(p, 0);
        let cellid = (1 + ijk[0] + ijk[1] * g.cells[0] + ijk[2] * g.cells[0] * g.cells[1]) as u64;
        let width = g.cell_width();
        Some(CellHit {
            cellid,
            row: *rows.get(&cellid)?,
            center: std::array::from_fn(|d| g.min[d] + (ijk[d] as f64 + 0.5) * width[d]),
            width,
        })
    }

    /// Analytic field evaluated at every cell centre, in cell order.
    fn sample_field_at_cells(&self, name: &str, field: &AnalyticField) -> Result<Array2<f64>> {
        let rows = self
            .cellids
            .iter()
            .map(|&c| Ok(field(self.cell_coordinates(c)?)))
            .collect::<Result<Vec<_>>>()?;
        let ncomp = rows.first().map_or(0, Vec::len);
        Array2::from_shape_vec((rows.len(), ncomp), rows.into_iter().flatten().collect())
            .map_err(|e| Error::InvalidArgument(format!("field '{name}' is ragged: {e}")))
    }

    fn population(&self, pop: &str) -> Result<&Population> {
        self.populations
            .get(pop)
            .ok_or_else(|| Error::MissingPopulation(pop.to_string()))
    }
}

impl SnapshotReader for MemorySnapshot {
    fn read_parameter(&self, name: &str) -> Result<f64> {
        self.parameters
            .get(name)
            .copied()
            .ok_or_else(|| Error::MissingParameter(name.to_string()))
    }

    fn check_parameter(&self, name: &str) -> bool {
        self.parameters.contains_key(name)
    }

    fn check_variable(&self, name: &str) -> bool {
        self.variables.contains_key(name) || self.fields.contains_key(name)
    }

    fn check_population(&self, pop: &str) -> bool {
        self.populations.contains_key(pop)
    }

    fn read_cellids(&self) -> Result<Vec<u64>> {
        Ok(self.cellids.clone())
    }

    fn read_variable(&self, name: &str, cellids: Option<&[u64]>) -> Result<Array2<f64>> {
        let sampled;
        let rows = match (self.variables.get(name), self.fields.get(name)) {
            (Some(rows), _) => rows,
            (None, Some(field)) => {
                sampled = self.sample_field_at_cells(name, field)?;
                &sampled
            }
            (None, None) => return Err(Error::MissingVariable(name.to_string())),
        };
        match cellids {
            None => Ok(rows.clone()),
            Some(wanted) => {
                let picks = wanted
                    .iter()
                    .map(|&c| self.index_of(c))
                    .collect::<Result<Vec<_>>>()?;
                Ok(rows.select(Axis(0), &picks))
            }
        }
    }

    fn read_fsgrid_variable(&self, name: &str) -> Result<Array4<f64>> {
        self.fsgrid
            .get(name)
            .cloned()
            .ok_or_else(|| Error::MissingVariable(name.to_string()))
    }

    fn read_variable_to_cache(&self, name: &str) -> Result<CacheHandle> {
        let components = if let Some(field) = self.fields.get(name) {
            field(self.geometry.min).len()
        } else {
            self.variables
                .get(name)
                .ok_or_else(|| Error::MissingVariable(name.to_string()))?
                .ncols()
        };
        Ok(CacheHandle {
            variable: name.to_string(),
            components,
        })
    }

    fn read_interpolated_variable(&self, name: &str, coords: &[[f64; 3]]) -> Result<Array2<f64>> {
        self.interpolation_queries.fetch_add(1, Ordering::Relaxed);
        let rows: Vec<Vec<f64>> = if let Some(field) = self.fields.get(name) {
            coords.iter().map(|&p| field(p)).collect()
        } else {
            let raw = self
                .variables
                .get(name)
                .ok_or_else(|| Error::MissingVariable(name.to_string()))?;
            let row_of: HashMap<u64, usize> =
                self.cellids.iter().enumerate().map(|(i, &c)| (c, i)).collect();
            coords
                .iter()
                .map(|&p| {
                    interpolate_cell_centred(&self.geometry, raw.view(), p, |q| {
                        Ok(self.locate(q, &row_of))
                    })
                })
                .collect::<Result<Vec<_>>>()?
        };
        let ncomp = rows.first().map_or(0, Vec::len);
        let flat: Vec<f64> = rows.into_iter().flatten().collect();
        Array2::from_shape_vec((coords.len(), ncomp), flat)
            .map_err(|e| Error::InvalidArgument(format!("field '{name}' is ragged: {e}")))
    }

    fn cell_coordinates(&self, cellid: u64) -> Result<[f64; 3]> {
        let [nx, ny, _] = self.geometry.cells;
        if cellid == 0 || cellid as usize > self.geometry.num_cells() {
            return Err(Error::MissingCell(cellid));
        }
        let id = cellid as usize - 1;
        let ijk = [id % nx, (id / nx) % ny, id / (nx * ny)];
        let d = self.geometry.cell_width();
        Ok(std::array::from_fn(|a| {
            self.geometry.min[a] + (ijk[a] as f64 + 0.5) * d[a]
        }))
    }

    fn cellid_at(&self, coords: [f64; 3]) -> Result<Option<u64>> {
        let g = &self.geometry;
        if (0..3).any(|a| !(coords[a] >= g.min[a] && coords[a] < g.max[a])) {
            return Ok(None);
        }
        let d = g.cell_width();
        let ijk: [usize; 3] = std::array::from_fn(|a| {
            (((coords[a] - g.min[a]) / d[a]).floor() as usize).min(g.cells[a] - 1)
        });
        let cid = 1 + ijk[0] + ijk[1] * g.cells[0] + ijk[2] * g.cells[0] * g.cells[1];
        Ok(Some(cid as u64))
    }

    fn cells_with_vspace(&self, pop: &str) -> Result<Vec<u64>> {
        Ok(self.population(pop)?.cells.iter().map(|(c, _)| *c).collect())
    }

    fn velocity_mesh(&self, pop: &str) -> Result<VelocityMesh> {
        Ok(self.population(pop)?.mesh.clone())
    }

    fn read_velocity_cells(&self, cellid: u64, pop: &str) -> Result<Vec<(u64, f64)>> {
        Ok(self
            .population(pop)?
            .cells
            .iter()
            .find(|(c, _)| *c == cellid)
            .map(|(_, v)| v.clone())
            .unwrap_or_default())
    }
}
