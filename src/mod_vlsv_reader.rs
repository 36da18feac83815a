/*
File: mod_vlsv_reader.rs
Copyright (C) 2025 Kostis Papadakis 2024/2025 (kpapadakis@protonmail.com)
This program is free software; you can redistribute it and/or modify
it under the terms of the GNU General Public License as published by
the Free Software Foundation; either version 2 of the License, or
(at your option) any later version.

Snapshot access used by the tracers and the VDF reducer.
SnapshotReader is the query surface; VlsvFile implements it on top of a
memory mapped VLSV file. Nothing here ever writes to the snapshot.

EXAMPLES:
    let f = VlsvFile::new("bulk.0001000.vlsv")?;
    let t = f.read_parameter("time")?;
    let b = f.read_variable("vg_b_vol", Some(&[1, 2, 3]))?;
    let b_fg = f.read_fsgrid_variable("fg_b")?;
    let f_cells = f.read_velocity_cells(256, "proton")?;

Keywords:
    read_scalar_parameter, get_dataset, get_wid, get_vspace_mesh_extents, get_domain_decomposition,
    get_max_amr_refinement, get_writing_tasks, get_spatial_mesh_bbox, read_fsgrid_variable,
    read_velocity_cells, cellid_at, interpolate_cell_centred
*/
use crate::mod_errors::{Error, Result};
use crate::mod_grid_sampler::{CellHit, GridGeometry, interpolate_cell_centred};
use bytemuck::{Pod, pod_read_unaligned};
use memmap2::Mmap;
use ndarray::{Array2, Array4, Order, s};
use num_traits::{NumCast, ToPrimitive};
use once_cell::sync::OnceCell;
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use tracing::debug;

pub const VLSV_FOOTER_LOC_START: usize = 8;
pub const VLSV_FOOTER_LOC_END: usize = 16;
pub const MAX_REFINEMENT_LEVEL: u32 = 16;

/// Velocity space mesh of one particle population.
#[derive(Debug, Clone, PartialEq)]
pub struct VelocityMesh {
    pub blocks: [usize; 3],
    pub block_width: usize,
    pub min: [f64; 3],
    pub max: [f64; 3],
}

impl VelocityMesh {
    pub fn cells(&self) -> [usize; 3] {
        self.blocks.map(|b| b * self.block_width)
    }

    pub fn cell_size(&self) -> [f64; 3] {
        let cells = self.cells();
        std::array::from_fn(|d| (self.max[d] - self.min[d]) / cells[d] as f64)
    }

    /// Centre of a velocity cell. Ids are `block * wid^3 + i + j*wid + k*wid^2`
    /// with blocks numbered x fastest.
    pub fn cell_center(&self, vcellid: u64) -> [f64; 3] {
        let wid = self.block_width as u64;
        let wid3 = wid * wid * wid;
        let block = vcellid / wid3;
        let local = vcellid % wid3;
        let (nbx, nby) = (self.blocks[0] as u64, self.blocks[1] as u64);
        let b = [block % nbx, (block / nbx) % nby, block / (nbx * nby)];
        let c = [local % wid, (local / wid) % wid, local / (wid * wid)];
        let dv = self.cell_size();
        std::array::from_fn(|d| self.min[d] + ((b[d] * wid + c[d]) as f64 + 0.5) * dv[d])
    }

    pub fn cell_coordinates(&self, vcellids: &[u64]) -> Array2<f64> {
        let mut out = Array2::<f64>::zeros((vcellids.len(), 3));
        for (mut row, &id) in out.rows_mut().into_iter().zip(vcellids) {
            let c = self.cell_center(id);
            row[0] = c[0];
            row[1] = c[1];
            row[2] = c[2];
        }
        out
    }
}

/// Receipt for a variable pre-loaded into a reader's interpolation cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheHandle {
    pub variable: String,
    pub components: usize,
}

/// Read-only queries against one simulation snapshot.
///
/// Per-cell variables are returned as `(cells, vectorsize)` rows, in file
/// order when `cellids` is `None` and in the requested order otherwise.
pub trait SnapshotReader {
    fn read_parameter(&self, name: &str) -> Result<f64>;
    fn check_parameter(&self, name: &str) -> bool;
    /// Whether `read_variable` can serve per-cell rows of `name`.
    fn check_variable(&self, name: &str) -> bool;
    fn check_population(&self, pop: &str) -> bool;
    fn read_cellids(&self) -> Result<Vec<u64>>;
    fn read_variable(&self, name: &str, cellids: Option<&[u64]>) -> Result<Array2<f64>>;
    /// Field solver variable indexed `[x, y, z, component]`.
    fn read_fsgrid_variable(&self, name: &str) -> Result<Array4<f64>>;
    fn read_variable_to_cache(&self, name: &str) -> Result<CacheHandle>;
    /// Point interpolation of a cell variable, one row per coordinate.
    /// Every point inside the simulation domain (boundary included) gets a
    /// value; coordinates outside it give NaN rows.
    fn read_interpolated_variable(&self, name: &str, coords: &[[f64; 3]]) -> Result<Array2<f64>>;
    fn cell_coordinates(&self, cellid: u64) -> Result<[f64; 3]>;
    fn cellid_at(&self, coords: [f64; 3]) -> Result<Option<u64>>;
    fn cells_with_vspace(&self, pop: &str) -> Result<Vec<u64>>;
    fn velocity_mesh(&self, pop: &str) -> Result<VelocityMesh>;
    /// Stored `(velocity cell id, phase space density)` pairs of one spatial cell.
    /// Empty when the cell has no velocity distribution.
    fn read_velocity_cells(&self, cellid: u64, pop: &str) -> Result<Vec<(u64, f64)>>;

    fn read_variable_at(&self, name: &str, cellid: u64) -> Result<Vec<f64>> {
        let rows = self.read_variable(name, Some(&[cellid]))?;
        Ok(rows.row(0).to_vec())
    }

    /// Simulation time, `time` in newer files and `t` in older ones.
    fn read_time(&self) -> Result<f64> {
        self.read_parameter("time")
            .or_else(|_| self.read_parameter("t"))
    }
}

#[derive(Debug)]
pub struct VlsvFile {
    pub filename: String,
    variables: OnceCell<HashMap<String, Variable>>,
    parameters: OnceCell<HashMap<String, Variable>>,
    memmap: OnceCell<Mmap>,
    root: OnceCell<VlsvRoot>,
    cellids: OnceCell<Vec<u64>>,
    cell_index: OnceCell<HashMap<u64, usize>>,
    /// Rows of the variable last used for point interpolation.
    interpolation_rows: RwLock<Option<(String, Arc<Array2<f64>>)>>,
    /// Per population: CellID -> (first block, block count).
    vspace_index: RwLock<HashMap<String, Arc<HashMap<u64, (usize, usize)>>>>,
}

impl VlsvFile {
    pub fn new(filename: &str) -> Result<Self> {
        std::fs::metadata(filename)?;
        Ok(Self {
            filename: filename.to_string(),
            variables: OnceCell::new(),
            parameters: OnceCell::new(),
            memmap: OnceCell::new(),
            root: OnceCell::new(),
            cellids: OnceCell::new(),
            cell_index: OnceCell::new(),
            interpolation_rows: RwLock::new(None),
            vspace_index: RwLock::new(HashMap::new()),
        })
    }

    fn memorymap(&self) -> Result<&Mmap> {
        self.memmap.get_or_try_init(|| {
            let file = std::fs::File::open(&self.filename)?;
            let map = unsafe { memmap2::MmapOptions::new().map(&file)? };
            Ok(map)
        })
    }

    fn root(&self) -> Result<&VlsvRoot> {
        self.root.get_or_try_init(|| {
            let map = self.memorymap()?;
            let head = map
                .get(VLSV_FOOTER_LOC_START..VLSV_FOOTER_LOC_END)
                .ok_or_else(|| Error::Format(format!("{} is too short", self.filename)))?;
            let mut buf = [0u8; 8];
            buf.copy_from_slice(head);
            let footer_offset = u64::from_ne_bytes(buf) as usize;
            let footer = map.get(footer_offset..).ok_or_else(|| {
                Error::Format(format!("footer offset {footer_offset} past end of file"))
            })?;
            let xml_str = std::str::from_utf8(footer)
                .map_err(|e| Error::Format(format!("footer is not UTF-8: {e}")))?;
            Ok(serde_xml_rs::from_str(xml_str)?)
        })
    }

    pub fn variables(&self) -> Result<&HashMap<String, Variable>> {
        self.variables.get_or_try_init(|| {
            Ok(self
                .root()?
                .variables
                .iter()
                .filter_map(|var| var.name.clone().map(|n| (n, var.clone())))
                .collect())
        })
    }

    pub fn parameters(&self) -> Result<&HashMap<String, Variable>> {
        self.parameters.get_or_try_init(|| {
            Ok(self
                .root()?
                .parameters
                .iter()
                .filter_map(|var| var.name.clone().map(|n| (n, var.clone())))
                .collect())
        })
    }

    pub fn get_dataset(&self, name: &str) -> Result<VlsvDataset> {
        let var = self
            .variables()?
            .get(name)
            .or(self.parameters()?.get(name))
            .ok_or_else(|| Error::MissingVariable(name.to_string()))?;
        var.try_into()
    }

    fn dataset_bytes(&self, ds: &VlsvDataset) -> Result<&[u8]> {
        let range = ds
            .arraysize
            .checked_mul(ds.vectorsize)
            .and_then(|n| n.checked_mul(ds.datasize))
            .and_then(|len| Some(ds.offset..ds.offset.checked_add(len)?));
        let map = self.memorymap()?;
        range
            .and_then(|r| map.get(r))
            .ok_or_else(|| {
                Error::Format(format!(
                    "dataset at {} ({} x {} x {} bytes) lies outside {}",
                    ds.offset, ds.arraysize, ds.vectorsize, ds.datasize, self.filename
                ))
            })
    }

    /// Reads a whole dataset converting every element to `T`.
    pub fn read_dataset_as<T: NumCast + Copy>(&self, ds: &VlsvDataset) -> Result<Vec<T>> {
        if ds.compression != CompressionMethod::NONE {
            return Err(Error::Format(format!(
                "{:?} compressed datasets are not supported",
                ds.compression
            )));
        }
        let bytes = self.dataset_bytes(ds)?;
        match (&ds.datatype, ds.datasize) {
            (DataType::Float, 4) => convert_slice::<f32, T>(bytes),
            (DataType::Float, 8) => convert_slice::<f64, T>(bytes),
            (DataType::Int, 4) => convert_slice::<i32, T>(bytes),
            (DataType::Int, 8) => convert_slice::<i64, T>(bytes),
            (DataType::Uint, 4) => convert_slice::<u32, T>(bytes),
            (DataType::Uint, 8) => convert_slice::<u64, T>(bytes),
            (DataType::Uint | DataType::U8, 1) => convert_slice::<u8, T>(bytes),
            (dt, size) => Err(Error::Format(format!(
                "unsupported element type {dt:?} of {size} bytes"
            ))),
        }
    }

    pub fn read_scalar_parameter(&self, name: &str) -> Result<f64> {
        let info = self
            .parameters()?
            .get(name)
            .or(self.variables()?.get(name))
            .ok_or_else(|| Error::MissingParameter(name.to_string()))
            .and_then(VlsvDataset::try_from)?;
        self.read_dataset_as::<f64>(&info)?
            .first()
            .copied()
            .ok_or_else(|| Error::Format(format!("parameter '{name}' is empty")))
    }

    pub fn get_max_amr_refinement(&self) -> Result<u32> {
        let lmax = self
            .root()?
            .mesh
            .as_ref()
            .and_then(|meshes| {
                meshes
                    .iter()
                    .find_map(|v| v.max_refinement_level.as_ref()?.parse::<u32>().ok())
            })
            .unwrap_or(0);
        if lmax > MAX_REFINEMENT_LEVEL {
            return Err(Error::Format(format!("refinement level {lmax} is out of range")));
        }
        Ok(lmax)
    }

    fn base_cells(&self) -> Result<[usize; 3]> {
        Ok([
            self.read_scalar_parameter("xcells_ini")? as usize,
            self.read_scalar_parameter("ycells_ini")? as usize,
            self.read_scalar_parameter("zcells_ini")? as usize,
        ])
    }

    /// Cell counts of the finest refinement level (= field solver grid).
    pub fn get_spatial_mesh_bbox(&self) -> Result<[usize; 3]> {
        let lmax = self.get_max_amr_refinement()?;
        let mut out = [0usize; 3];
        for (dst, n) in out.iter_mut().zip(self.base_cells()?) {
            *dst = n
                .checked_mul(1usize << lmax)
                .ok_or_else(|| Error::Format(format!("{n} cells refined {lmax} times overflow")))?;
        }
        Ok(out)
    }

    pub fn get_domain_decomposition(&self) -> Result<[usize; 3]> {
        let decomposition: VlsvDataset = self
            .root()?
            .mesh_decomposition
            .as_ref()
            .and_then(|v| v.first())
            .ok_or_else(|| Error::Format("no MESH_DECOMPOSITION in file".to_string()))?
            .try_into()?;
        let decomp = self.read_dataset_as::<usize>(&decomposition)?;
        match decomp.as_slice() {
            [a, b, c, ..] => Ok([*a, *b, *c]),
            _ => Err(Error::Format("MESH_DECOMPOSITION needs 3 entries".to_string())),
        }
    }

    pub fn get_writing_tasks(&self) -> Result<usize> {
        Ok(self.read_scalar_parameter("numWritingRanks")? as usize)
    }

    pub fn get_wid(&self) -> usize {
        self.read_scalar_parameter("velocity_block_width")
            .map(|w| w as usize)
            .unwrap_or(4)
    }

    fn population_dataset(list: Option<&Vec<Variable>>, pop: &str, by_mesh: bool) -> Result<VlsvDataset> {
        list.and_then(|items| {
            items.iter().find(|v| {
                let key = if by_mesh { &v.mesh } else { &v.name };
                key.as_deref() == Some(pop)
            })
        })
        .ok_or_else(|| Error::MissingPopulation(pop.to_string()))?
        .try_into()
    }

    fn node_coordinates(&self, pop: &str) -> Result<[Vec<f64>; 3]> {
        let root = self.root()?;
        let lists = [
            root.mesh_node_crds_x.as_ref(),
            root.mesh_node_crds_y.as_ref(),
            root.mesh_node_crds_z.as_ref(),
        ];
        let mut out: [Vec<f64>; 3] = Default::default();
        for (dst, list) in out.iter_mut().zip(lists) {
            let ds = Self::population_dataset(list, pop, true)?;
            *dst = self.read_dataset_as::<f64>(&ds)?;
            if dst.len() < 2 {
                return Err(Error::Format(format!("mesh '{pop}' has fewer than two nodes")));
            }
        }
        Ok(out)
    }

    pub fn get_vspace_mesh_extents(&self, pop: &str) -> Result<([f64; 3], [f64; 3])> {
        let nodes = self.node_coordinates(pop)?;
        Ok((
            std::array::from_fn(|d| nodes[d][0]),
            std::array::from_fn(|d| nodes[d][nodes[d].len() - 1]),
        ))
    }

    pub fn get_vspace_mesh_bbox(&self, pop: &str) -> Result<[usize; 3]> {
        let root = self.root()?;
        let lists = [
            root.mesh_node_crds_x.as_ref(),
            root.mesh_node_crds_y.as_ref(),
            root.mesh_node_crds_z.as_ref(),
        ];
        let mut out = [0usize; 3];
        for (dst, list) in out.iter_mut().zip(lists) {
            *dst = Self::population_dataset(list, pop, true)?.arraysize.saturating_sub(1);
        }
        Ok(out)
    }

    fn cellids(&self) -> Result<&[u64]> {
        self.cellids
            .get_or_try_init(|| {
                let ds = self.get_dataset("CellID")?;
                self.read_dataset_as::<u64>(&ds)
            })
            .map(|v| v.as_slice())
    }

    fn cell_index(&self) -> Result<&HashMap<u64, usize>> {
        self.cell_index.get_or_try_init(|| {
            Ok(self
                .cellids()?
                .iter()
                .enumerate()
                .map(|(i, &c)| (c, i))
                .collect())
        })
    }

    pub fn get_cell_coordinates_batch(&self, cellids: &[u64]) -> Result<Vec<[f64; 3]>> {
        let geometry = GridGeometry::from_reader(self)?;
        let base = geometry.cells;
        let lmax = self.get_max_amr_refinement()?;
        let fine = base.map(|n| n as f64 * <f64 as From<u32>>::from(1u32 << lmax));
        let d: [f64; 3] = std::array::from_fn(|a| (geometry.max[a] - geometry.min[a]) / fine[a]);
        cellids
            .iter()
            .map(|&cid| {
                let lvl = amr_level(cid, base, lmax).ok_or(Error::MissingCell(cid))?;
                let ijk = cid2fineijk(cid, lvl, lmax, base).ok_or(Error::MissingCell(cid))?;
                let scale = (1usize << (lmax - lvl)) as f64;
                Ok(std::array::from_fn(|a| {
                    geometry.min[a] + (ijk[a] as f64 + 0.5 * scale) * d[a]
                }))
            })
            .collect()
    }

    /// Rows of a spatial grid variable kept for point interpolation. Only the
    /// most recently used variable is held, one copy of its file rows.
    fn interpolation_rows(&self, name: &str) -> Result<Arc<Array2<f64>>> {
        if let Some((cached, rows)) = self
            .interpolation_rows
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
        {
            if cached == name {
                return Ok(Arc::clone(rows));
            }
        }
        let info = self.get_dataset(name)?;
        if info.grid != Some(VlasiatorGrid::SPATIALGRID) {
            return Err(Error::InvalidArgument(format!(
                "'{name}' is not a spatial grid variable"
            )));
        }
        let rows = Arc::new(self.read_variable(name, None)?);
        if rows.nrows() != self.cellids()?.len() {
            return Err(Error::Format(format!(
                "'{name}' has {} rows for {} cells",
                rows.nrows(),
                self.cellids()?.len()
            )));
        }
        debug!(variable = name, cells = rows.nrows(), "cached interpolation rows");
        *self
            .interpolation_rows
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some((name.to_string(), Arc::clone(&rows)));
        Ok(rows)
    }

    /// Finest stored cell holding `p`, searching from level 0 upwards.
    /// Points beyond the upper boundary are clamped onto the last cell.
    fn locate_cell(&self, geometry: &GridGeometry, lmax: u32, p: [f64; 3]) -> Result<Option<CellHit>> {
        let index = self.cell_index()?;
        let overflow = || Error::Format("cell id arithmetic overflows".to_string());
        let mut offset = 0u64;
        for lvl in 0..=lmax {
            let n = geometry.cells.map(|c| (c as u64) << lvl);
            let ijk = geometry.cell_index_at(p, lvl).map(|i| i as u64);
            let layer = n[0].checked_mul(n[1]).ok_or_else(overflow)?;
            let cid = ijk[2]
                .checked_mul(layer)
                .and_then(|v| v.checked_add(ijk[1].checked_mul(n[0])?))
                .and_then(|v| v.checked_add(ijk[0] + 1))
                .and_then(|v| v.checked_add(offset))
                .ok_or_else(overflow)?;
            if let Some(&row) = index.get(&cid) {
                let width: [f64; 3] =
                    std::array::from_fn(|d| (geometry.max[d] - geometry.min[d]) / n[d] as f64);
                return Ok(Some(CellHit {
                    cellid: cid,
                    row,
                    center: std::array::from_fn(|d| {
                        geometry.min[d] + (ijk[d] as f64 + 0.5) * width[d]
                    }),
                    width,
                }));
            }
            offset = layer
                .checked_mul(n[2])
                .and_then(|v| v.checked_add(offset))
                .ok_or_else(overflow)?;
        }
        Ok(None)
    }

    /// Block ranges of the cells that store velocity blocks, read once per population.
    fn vspace_index(&self, pop: &str) -> Result<Arc<HashMap<u64, (usize, usize)>>> {
        if let Some(hit) = self
            .vspace_index
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(pop)
        {
            return Ok(Arc::clone(hit));
        }
        let root = self.root()?;
        let cellswithblocks = Self::population_dataset(root.cellswithblocks.as_ref(), pop, false)?;
        let blockspercell = Self::population_dataset(root.blockspercell.as_ref(), pop, false)?;
        let cids = self.read_dataset_as::<u64>(&cellswithblocks)?;
        let counts = self.read_dataset_as::<usize>(&blockspercell)?;
        if counts.len() < cids.len() {
            return Err(Error::Format("BLOCKSPERCELL shorter than CELLSWITHBLOCKS".into()));
        }
        let mut index = HashMap::with_capacity(cids.len());
        let mut start = 0usize;
        for (&cid, &count) in cids.iter().zip(&counts) {
            index.insert(cid, (start, count));
            start = start
                .checked_add(count)
                .ok_or_else(|| Error::Format("BLOCKSPERCELL total overflows".into()))?;
        }
        debug!(pop, cells = index.len(), blocks = start, "indexed velocity blocks");
        let index = Arc::new(index);
        self.vspace_index
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pop.to_string(), Arc::clone(&index));
        Ok(index)
    }
}

impl SnapshotReader for VlsvFile {
    fn read_parameter(&self, name: &str) -> Result<f64> {
        self.read_scalar_parameter(name)
    }

    fn check_parameter(&self, name: &str) -> bool {
        self.parameters().is_ok_and(|p| p.contains_key(name))
    }

    fn check_variable(&self, name: &str) -> bool {
        self.get_dataset(name)
            .is_ok_and(|ds| ds.grid == Some(VlasiatorGrid::SPATIALGRID))
    }

    fn check_population(&self, pop: &str) -> bool {
        self.root().is_ok_and(|root| {
            root.blockvariable
                .as_ref()
                .is_some_and(|l| l.iter().any(|v| v.name.as_deref() == Some(pop)))
        })
    }

    fn read_cellids(&self) -> Result<Vec<u64>> {
        Ok(self.cellids()?.to_vec())
    }

    fn read_variable(&self, name: &str, cellids: Option<&[u64]>) -> Result<Array2<f64>> {
        let info = self.get_dataset(name)?;
        match cellids {
            None => {
                let rows = self.read_dataset_as::<f64>(&info)?;
                Array2::from_shape_vec((info.arraysize, info.vectorsize), rows)
                    .map_err(|e| Error::Format(format!("'{name}': {e}")))
            }
            Some(wanted) => {
                let index = self.cell_index()?;
                let mut out = Array2::<f64>::zeros((wanted.len(), info.vectorsize));
                for (mut row, c) in out.rows_mut().into_iter().zip(wanted) {
                    let i = *index.get(c).ok_or(Error::MissingCell(*c))?;
                    if i >= info.arraysize {
                        return Err(Error::Format(format!("'{name}' has no row for cell {c}")));
                    }
                    let values = self.read_dataset_as::<f64>(&info.rows(i, 1))?;
                    row.iter_mut().zip(values).for_each(|(dst, v)| *dst = v);
                }
                Ok(out)
            }
        }
    }

    fn read_fsgrid_variable(&self, name: &str) -> Result<Array4<f64>> {
        let info = self.get_dataset(name)?;
        if info.grid != Some(VlasiatorGrid::FSGRID) {
            return Err(Error::InvalidArgument(format!("'{name}' is not an fsgrid variable")));
        }
        let decomp = self.get_domain_decomposition()?;
        let ntasks = self.get_writing_tasks()?;
        let bbox = self.get_spatial_mesh_bbox()?;
        let [nx, ny, nz] = bbox;
        if decomp.iter().product::<usize>() != ntasks || nx * ny * nz != info.arraysize {
            return Err(Error::Format(format!(
                "'{name}': decomposition {decomp:?} over {ntasks} ranks does not tile {bbox:?}"
            )));
        }

        fn calc_local_start(global_cells: usize, ntasks: usize, my_n: usize) -> usize {
            let n_per_task = global_cells / ntasks;
            let remainder = global_cells % ntasks;
            if my_n < remainder {
                my_n * (n_per_task + 1)
            } else {
                my_n * n_per_task + remainder
            }
        }

        fn calc_local_size(global_cells: usize, ntasks: usize, my_n: usize) -> usize {
            let n_per_task = global_cells / ntasks;
            let remainder = global_cells % ntasks;
            if my_n < remainder { n_per_task + 1 } else { n_per_task }
        }

        let var = Array2::from_shape_vec(
            (info.arraysize, info.vectorsize),
            self.read_dataset_as::<f64>(&info)?,
        )
        .map_err(|e| Error::Format(format!("'{name}': {e}")))?;
        let mut ordered_var = Array4::<f64>::zeros((nx, ny, nz, info.vectorsize));
        let mut current_offset = 0;
        for i in 0..ntasks {
            let rank = [(i / decomp[2]) / decomp[1], (i / decomp[2]) % decomp[1], i % decomp[2]];
            let task_size: [usize; 3] =
                std::array::from_fn(|d| calc_local_size(bbox[d], decomp[d], rank[d]));
            let task_start: [usize; 3] =
                std::array::from_fn(|d| calc_local_start(bbox[d], decomp[d], rank[d]));
            let total_size = task_size.iter().product::<usize>();
            let chunk = var.slice(s![current_offset..current_offset + total_size, ..]);
            let block = chunk
                .to_shape((
                    (task_size[0], task_size[1], task_size[2], info.vectorsize),
                    Order::F,
                ))
                .map_err(|e| Error::Format(format!("'{name}' rank {i}: {e}")))?;
            ordered_var
                .slice_mut(s![
                    task_start[0]..task_start[0] + task_size[0],
                    task_start[1]..task_start[1] + task_size[1],
                    task_start[2]..task_start[2] + task_size[2],
                    ..
                ])
                .assign(&block);
            current_offset += total_size;
        }
        Ok(ordered_var)
    }

    fn read_variable_to_cache(&self, name: &str) -> Result<CacheHandle> {
        let rows = self.interpolation_rows(name)?;
        Ok(CacheHandle {
            variable: name.to_string(),
            components: rows.ncols(),
        })
    }

    fn read_interpolated_variable(&self, name: &str, coords: &[[f64; 3]]) -> Result<Array2<f64>> {
        let rows = self.interpolation_rows(name)?;
        let geometry = GridGeometry::from_reader(self)?;
        let lmax = self.get_max_amr_refinement()?;
        let mut out = Array2::<f64>::zeros((coords.len(), rows.ncols()));
        for (mut row, &p) in out.rows_mut().into_iter().zip(coords) {
            let values = interpolate_cell_centred(&geometry, rows.view(), p, |q| {
                self.locate_cell(&geometry, lmax, q)
            })?;
            row.iter_mut().zip(values).for_each(|(dst, v)| *dst = v);
        }
        Ok(out)
    }

    fn cell_coordinates(&self, cellid: u64) -> Result<[f64; 3]> {
        self.get_cell_coordinates_batch(&[cellid])?
            .into_iter()
            .next()
            .ok_or(Error::MissingCell(cellid))
    }

    fn cellid_at(&self, coords: [f64; 3]) -> Result<Option<u64>> {
        let geometry = GridGeometry::from_reader(self)?;
        if (0..3).any(|d| !(coords[d] >= geometry.min[d] && coords[d] < geometry.max[d])) {
            return Ok(None);
        }
        let lmax = self.get_max_amr_refinement()?;
        Ok(self.locate_cell(&geometry, lmax, coords)?.map(|hit| hit.cellid))
    }

    fn cells_with_vspace(&self, pop: &str) -> Result<Vec<u64>> {
        let ds = Self::population_dataset(self.root()?.cellswithblocks.as_ref(), pop, false)?;
        self.read_dataset_as::<u64>(&ds)
    }

    fn velocity_mesh(&self, pop: &str) -> Result<VelocityMesh> {
        let wid = self.get_wid();
        let cells = self.get_vspace_mesh_bbox(pop)?;
        let (min, max) = self.get_vspace_mesh_extents(pop)?;
        Ok(VelocityMesh {
            blocks: cells.map(|c| c / wid),
            block_width: wid,
            min,
            max,
        })
    }

    fn read_velocity_cells(&self, cellid: u64, pop: &str) -> Result<Vec<(u64, f64)>> {
        let root = self.root()?;
        let blockvariable = Self::population_dataset(root.blockvariable.as_ref(), pop, false)?;
        let blockids = Self::population_dataset(root.blockids.as_ref(), pop, false)?;
        if blockvariable.compression != CompressionMethod::NONE {
            return Err(Error::Format(format!(
                "{:?} compressed velocity blocks are not supported",
                blockvariable.compression
            )));
        }
        if blockvariable.vectorsize == 0 {
            return Err(Error::Format(format!("'{pop}' velocity blocks have no cells")));
        }

        let Some(&(start_block, read_size)) = self.vspace_index(pop)?.get(&cellid) else {
            debug!(cellid, pop, "cell stores no velocity blocks");
            return Ok(Vec::new());
        };
        let wid3 = blockvariable.vectorsize;
        let block_ids = self.read_dataset_as::<u64>(&blockids.rows(start_block, read_size))?;
        let values = self.read_dataset_as::<f64>(&blockvariable.rows(start_block, read_size))?;
        let mut out = Vec::with_capacity(values.len());
        for (&bid, block) in block_ids.iter().zip(values.chunks_exact(wid3)) {
            let first = bid
                .checked_mul(wid3 as u64)
                .ok_or_else(|| Error::Format(format!("velocity block id {bid} overflows")))?;
            out.extend(block.iter().enumerate().map(|(local, &f)| (first + local as u64, f)));
        }
        debug!(cellid, pop, blocks = read_size, "read velocity blocks");
        Ok(out)
    }
}

fn convert_slice<S: Pod + ToPrimitive, T: NumCast>(bytes: &[u8]) -> Result<Vec<T>> {
    bytes
        .chunks_exact(std::mem::size_of::<S>())
        .map(|chunk| {
            let v: S = pod_read_unaligned(chunk);
            T::from(v).ok_or_else(|| Error::Format("element does not fit target type".to_string()))
        })
        .collect()
}

/// Refinement level of a CellID given the level 0 cell counts.
fn amr_level(cellid: u64, base: [usize; 3], lmax: u32) -> Option<u32> {
    let n0 = base.iter().try_fold(1u64, |acc, &n| acc.checked_mul(n as u64))?;
    let mut cum = 0u64;
    for lvl in 0..=lmax {
        let count = n0.checked_mul(1u64.checked_shl(3 * lvl)?)?;
        if cellid >= 1 && cellid <= cum.saturating_add(count) {
            return Some(lvl);
        }
        cum = cum.checked_add(count)?;
    }
    None
}

/// Lower corner of a cell in finest-level index space.
fn cid2fineijk(cellid: u64, level: u32, lmax: u32, base: [usize; 3]) -> Option<[usize; 3]> {
    let n0 = base.iter().try_fold(1u64, |acc, &n| acc.checked_mul(n as u64))?;
    let mut cum = 0u64;
    for l in 0..level {
        cum = cum.checked_add(n0.checked_mul(1u64.checked_shl(3 * l)?)?)?;
    }
    let id0 = cellid.checked_sub(cum)?.checked_sub(1)?;
    let nx_l = (base[0] as u64).checked_mul(1u64.checked_shl(level)?)?;
    let ny_l = (base[1] as u64).checked_mul(1u64.checked_shl(level)?)?;
    let scale = 1u64.checked_shl(lmax.checked_sub(level)?)?;
    let ijk = [id0 % nx_l, (id0 / nx_l) % ny_l, id0 / nx_l.checked_mul(ny_l)?];
    let mut out = [0usize; 3];
    for (dst, i) in out.iter_mut().zip(ijk) {
        *dst = usize::try_from(i.checked_mul(scale)?).ok()?;
    }
    Some(out)
}

#[derive(Deserialize, Debug, Clone)]
pub struct Variable {
    #[serde(rename = "arraysize")]
    pub arraysize: Option<String>,
    #[serde(rename = "datasize")]
    pub datasize: Option<String>,
    #[serde(rename = "datatype")]
    pub datatype: Option<String>,
    #[serde(rename = "mesh")]
    pub mesh: Option<String>,
    #[serde(rename = "name")]
    pub name: Option<String>,
    #[serde(rename = "vectorsize")]
    pub vectorsize: Option<String>,
    #[serde(rename = "compression")]
    pub compression: Option<String>,
    #[serde(rename = "max_refinement_level")]
    pub max_refinement_level: Option<String>,
    #[serde(rename = "unit")]
    pub unit: Option<String>,
    #[serde(rename = "$value")]
    pub offset: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct VlsvRoot {
    #[serde(rename = "VARIABLE", default)]
    pub variables: Vec<Variable>,

    #[serde(rename = "PARAMETER", default)]
    pub parameters: Vec<Variable>,

    #[serde(rename = "BLOCKIDS")]
    pub blockids: Option<Vec<Variable>>,

    #[serde(rename = "BLOCKSPERCELL")]
    pub blockspercell: Option<Vec<Variable>>,

    #[serde(rename = "BLOCKVARIABLE")]
    pub blockvariable: Option<Vec<Variable>>,

    #[serde(rename = "CELLSWITHBLOCKS")]
    pub cellswithblocks: Option<Vec<Variable>>,

    #[serde(rename = "MESH")]
    pub mesh: Option<Vec<Variable>>,

    #[serde(rename = "MESH_DECOMPOSITION")]
    pub mesh_decomposition: Option<Vec<Variable>>,

    #[serde(rename = "MESH_NODE_CRDS_X")]
    pub mesh_node_crds_x: Option<Vec<Variable>>,

    #[serde(rename = "MESH_NODE_CRDS_Y")]
    pub mesh_node_crds_y: Option<Vec<Variable>>,

    #[serde(rename = "MESH_NODE_CRDS_Z")]
    pub mesh_node_crds_z: Option<Vec<Variable>>,
}

fn parse_attr<T: FromStr>(value: Option<&str>, what: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .ok_or_else(|| Error::Format(format!("missing {what}")))?
        .trim()
        .parse::<T>()
        .map_err(|e| Error::Format(format!("invalid {what}: {e}")))
}

impl TryFrom<&Variable> for VlsvDataset {
    type Error = Error;

    fn try_from(var: &Variable) -> Result<Self> {
        let grid = var.mesh.as_deref().map(VlasiatorGrid::from_mesh_name);
        Ok(Self {
            offset: parse_attr(var.offset.as_deref(), "offset")?,
            arraysize: parse_attr(var.arraysize.as_deref(), "arraysize")?,
            vectorsize: parse_attr(Some(var.vectorsize.as_deref().unwrap_or("1")), "vectorsize")?,
            datasize: parse_attr(var.datasize.as_deref(), "datasize")?,
            datatype: parse_attr(var.datatype.as_deref(), "datatype")?,
            grid,
            compression: parse_attr(Some(var.compression.as_deref().unwrap_or("NONE")), "compression")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum VlasiatorGrid {
    FSGRID,
    SPATIALGRID,
    VMESH,
    IONOSPHERE,
}

impl VlasiatorGrid {
    fn from_mesh_name(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "FSGRID" => VlasiatorGrid::FSGRID,
            "SPATIALGRID" => VlasiatorGrid::SPATIALGRID,
            "IONOSPHERE" => VlasiatorGrid::IONOSPHERE,
            _ => VlasiatorGrid::VMESH,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DataType {
    Float,
    Int,
    Uint,
    U8,
}

impl FromStr for DataType {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "float" => Ok(DataType::Float),
            "int" => Ok(DataType::Int),
            "uint" => Ok(DataType::Uint),
            "u8" => Ok(DataType::U8),
            other => Err(format!("unknown datatype: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompressionMethod {
    NONE,
    ZFP,
    OCTREE,
    MLP,
    MLPMULTI,
    HERMITE,
}

impl FromStr for CompressionMethod {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "" | "NONE" => Ok(CompressionMethod::NONE),
            "ZFP" => Ok(CompressionMethod::ZFP),
            "OCTREE" => Ok(CompressionMethod::OCTREE),
            "HERMITE" => Ok(CompressionMethod::HERMITE),
            "MLP" => Ok(CompressionMethod::MLP),
            "MLPMULTI" => Ok(CompressionMethod::MLPMULTI),
            other => Err(format!("unknown compression scheme: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VlsvDataset {
    pub offset: usize,
    pub arraysize: usize,
    pub vectorsize: usize,
    pub datasize: usize,
    pub datatype: DataType,
    pub grid: Option<VlasiatorGrid>,
    pub compression: CompressionMethod,
}

impl VlsvDataset {
    /// The `count` rows starting at row `first`. Offsets that overflow are
    /// saturated and then rejected when the bytes are fetched.
    pub fn rows(&self, first: usize, count: usize) -> VlsvDataset {
        let mut sub = self.clone();
        sub.offset = first
            .saturating_mul(self.vectorsize)
            .saturating_mul(self.datasize)
            .saturating_add(self.offset);
        sub.arraysize = count;
        sub
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amr_levels_and_fine_indices() {
        let base = [2, 2, 1];
        assert_eq!(amr_level(1, base, 1), Some(0));
        assert_eq!(amr_level(4, base, 1), Some(0));
        assert_eq!(amr_level(5, base, 1), Some(1));
        assert_eq!(amr_level(36, base, 1), Some(1));
        assert_eq!(amr_level(37, base, 1), None);
        assert_eq!(amr_level(0, base, 1), None);
        assert_eq!(cid2fineijk(2, 0, 1, base), Some([2, 0, 0]));
        assert_eq!(cid2fineijk(3, 0, 1, base), Some([0, 2, 0]));
        // first level 1 cell: 4x4x2 fine grid
        assert_eq!(cid2fineijk(5, 1, 1, base), Some([0, 0, 0]));
        assert_eq!(cid2fineijk(5 + 4, 1, 1, base), Some([0, 1, 0]));
    }

    #[test]
    fn cell_id_arithmetic_does_not_overflow() {
        let huge = [usize::MAX / 2, 4, 4];
        assert_eq!(amr_level(1, huge, 3), None);
        assert_eq!(amr_level(1, [1 << 20, 1 << 20, 1 << 20], 3), Some(0));
        assert_eq!(amr_level(u64::MAX, [1 << 20, 1 << 20, 1 << 20], 3), None);
        assert_eq!(cid2fineijk(u64::MAX, 3, 3, [1 << 20, 1 << 20, 1 << 20]), None);
        assert_eq!(cid2fineijk(5, 1, 0, [2, 2, 1]), None);
    }

    #[test]
    fn dataset_rows_address_one_row() {
        let ds = VlsvDataset {
            offset: 100,
            arraysize: 10,
            vectorsize: 3,
            datasize: 8,
            datatype: DataType::Float,
            grid: Some(VlasiatorGrid::SPATIALGRID),
            compression: CompressionMethod::NONE,
        };
        let row = ds.rows(2, 1);
        assert_eq!(row.offset, 100 + 2 * 24);
        assert_eq!(row.arraysize, 1);
        assert_eq!(ds.rows(usize::MAX, 1).offset, usize::MAX);
    }

    #[test]
    fn velocity_cell_centres() {
        let mesh = VelocityMesh {
            blocks: [2, 3, 1],
            block_width: 2,
            min: [-4.0, -6.0, -2.0],
            max: [4.0, 6.0, 2.0],
        };
        assert_eq!(mesh.cells(), [4, 6, 2]);
        assert_eq!(mesh.cell_size(), [2.0, 2.0, 2.0]);
        assert_eq!(mesh.cell_center(0), [-3.0, -5.0, -1.0]);
        // block 1 is the next block along x, local cell (1,1,1)
        assert_eq!(mesh.cell_center(8 + 7), [3.0, -3.0, 1.0]);
        // block 2 starts the second row of blocks along y
        assert_eq!(mesh.cell_center(16), [-3.0, -1.0, -1.0]);
    }

    #[test]
    fn dataset_attributes_parse() {
        let var = Variable {
            arraysize: Some("10".into()),
            datasize: Some("8".into()),
            datatype: Some("float".into()),
            mesh: Some("fsgrid".into()),
            name: Some("fg_b".into()),
            vectorsize: Some("3".into()),
            compression: None,
            max_refinement_level: None,
            unit: None,
            offset: Some(" 128 ".into()),
        };
        let ds = VlsvDataset::try_from(&var).unwrap();
        assert_eq!(ds.offset, 128);
        assert_eq!(ds.grid, Some(VlasiatorGrid::FSGRID));
        assert_eq!(ds.compression, CompressionMethod::NONE);
        let bad = Variable {
            datatype: Some("complex".into()),
            ..var
        };
        assert!(matches!(VlsvDataset::try_from(&bad), Err(Error::Format(_))));
    }
}
