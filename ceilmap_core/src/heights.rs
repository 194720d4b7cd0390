//! Per-marker physical scale, keyed by id range.
//!
//! Ceiling height can vary across a building, so markers are grouped into
//! id bands that share a height. Each band carries the floor distance spanned
//! by one image pixel for a marker mounted at that height.

use serde::{Deserialize, Serialize};

/// One contiguous id range sharing a ceiling height.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeightBand {
    /// First marker id covered by this band (inclusive)
    pub first_id: u32,

    /// Last marker id covered by this band (inclusive)
    pub last_id: u32,

    /// Floor distance spanned by one image pixel for markers in this band
    pub distance_per_pixel: f64,

    /// Ceiling height above the floor
    pub z: f64,
}

impl HeightBand {
    /// Whether `id` falls inside this band.
    pub fn contains(&self, id: u32) -> bool {
        self.first_id <= id && id <= self.last_id
    }
}

/// Lookup table from marker id to physical scale.
///
/// Bands are kept sorted by `first_id`; lookup is a linear first-match scan.
/// An id outside every band resolves to a `distance_per_pixel` of zero,
/// which callers must treat as "unknown".
#[derive(Debug, Clone, Default)]
pub struct HeightTable {
    bands: Vec<HeightBand>,
}

impl HeightTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self { bands: Vec::new() }
    }

    /// Build a table from externally parsed bands.
    pub fn from_bands(bands: Vec<HeightBand>) -> Self {
        let mut table = Self::new();
        table.load(bands);
        table
    }

    /// Replace the table contents. Bands are sorted by `first_id` ascending;
    /// overlapping bands are not rejected, the first match wins.
    pub fn load(&mut self, mut bands: Vec<HeightBand>) {
        bands.sort_by_key(|band| band.first_id);
        self.bands = bands;
    }

    /// Floor distance per pixel for `id`, or 0.0 when no band covers it.
    pub fn distance_per_pixel(&self, id: u32) -> f64 {
        self.band(id).map_or(0.0, |band| band.distance_per_pixel)
    }

    /// The first band containing `id`.
    pub fn band(&self, id: u32) -> Option<&HeightBand> {
        self.bands.iter().find(|band| band.contains(id))
    }

    /// All bands, sorted by `first_id`.
    pub fn bands(&self) -> &[HeightBand] {
        &self.bands
    }

    /// Number of bands.
    pub fn len(&self) -> usize {
        self.bands.len()
    }

    /// Whether the table has no bands.
    pub fn is_empty(&self) -> bool {
        self.bands.is_empty()
    }
}
