//! Grid rasters and the double-buffered field store.

mod fields;
mod raster;

pub use fields::{FieldId, FieldStore, PingPong};
pub use raster::Grid;
