pub use archive::{CellArchive, CellChunk, Location, TimeSeries, WriteOptions};
pub use bulk::{GridAlignment, ImageBlock, ImageBulkReader, Layout};
pub use config::{GridMatch, ImageBuffer, ResampleConfig, ReshuffleConfig};
pub use error::{ReshuffleError, ReshuffleResult};
pub use geo::{BoundingBox, Coord};
pub use grid::{ease36_cell_grid, ease36_grid_from_file, lonlat2cell, CellGrid};
pub use image::{AttrValue, Attributes, Image, ImageReader};
pub use overpass::{Overpass, VariableNaming};
pub use reshuffle::{partition_block, CellOrder, Reshuffler, RunState, RunSummary};
pub use resample::{NeighbourTable, ResampleMethod, WeightFunction};
pub use smap::{Field, FieldFile, FieldSource, RasterLayout, SmapConfig, SmapL3Dataset};
pub use time_units::{TimeUnit, TimeUnits};

#[cfg(feature = "netcdf")]
pub use smap::NetcdfFieldSource;

/**************************************************************************************************
 * Private Implementation
 *************************************************************************************************/
mod archive;
mod bulk;
mod config;
mod error;
mod geo;
mod grid;
mod image;
mod overpass;
mod resample;
mod reshuffle;
mod smap;
mod time_units;
