//! Ceilmap - ceiling fiducial marker mapping
//!
//! Builds and maintains a floor-plane map of ceiling markers seen by an
//! upward-facing camera. The library solves four problems:
//! 1. **Measurement fusion**: one observation per marker pair, keeping only
//!    the best measurement (radial-offset goodness gating)
//! 2. **Absolute poses from relative data**: a shortest-edge-first spanning
//!    tree from the lowest-id marker, with planar transforms composed along
//!    tree edges
//! 3. **Physical scale**: per-id-band ceiling heights mapping pixels to
//!    floor distance
//! 4. **Persistence and inspection**: XML round trips and SVG rendering
//!
//! The engine is a plain single-threaded library; camera input and fiducial
//! detection happen in the host process.

pub mod fusion;
pub mod heights;
pub mod persistence;
pub mod svg;

// Re-export key types for convenience
pub use fusion::{
    normalize_angle, Observation, Tag, TagAnnounce, TagDetection, TagMap, UNMEASURED_GOODNESS,
};
pub use heights::{HeightBand, HeightTable};
pub use persistence::{
    heights_from_xml, load_heights, map_from_xml, map_to_xml, restore_map, save_map, PersistError,
};
pub use svg::{render_svg, write_svg, SvgOptions, TrailPoint};
