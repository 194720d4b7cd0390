//! XML persistence for maps and height tables.
//!
//! Map files carry tag and arc elements under a counted `<Map>` root; height
//! tables carry `<Tag_Height>` bands under `<Map_Tag_Heights>`. Twists are
//! stored in degrees on disk and converted to radians on load. Restoring
//! builds a fresh engine, so a malformed file can never corrupt the map a
//! host is already holding.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use roxmltree::{Document, Node};
use thiserror::Error;

use crate::fusion::TagMap;
use crate::heights::{HeightBand, HeightTable};

/// Errors from loading or saving persisted maps and height tables.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("XML syntax error: {0}")]
    Syntax(#[from] roxmltree::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("expected <{expected}> root element, found <{found}>")]
    UnexpectedRoot { expected: &'static str, found: String },

    #[error("unexpected <{0}> element")]
    UnexpectedElement(String),

    #[error("<{element}> is missing the {attribute} attribute")]
    MissingAttribute {
        element: &'static str,
        attribute: &'static str,
    },

    #[error("attribute {attribute}=\"{value}\" is not a number")]
    InvalidNumber { attribute: &'static str, value: String },

    #[error("{element} count is {declared} but {actual} elements are present")]
    CountMismatch {
        element: &'static str,
        declared: usize,
        actual: usize,
    },

    #[error("arc {from}->{to} endpoints are not in ascending id order")]
    NonCanonicalArc { from: u32, to: u32 },
}

fn numeric_attr<T: FromStr>(
    node: Node,
    element: &'static str,
    attribute: &'static str,
) -> Result<T, PersistError> {
    let value = node
        .attribute(attribute)
        .ok_or(PersistError::MissingAttribute { element, attribute })?;
    value.trim().parse().map_err(|_| PersistError::InvalidNumber {
        attribute,
        value: value.to_string(),
    })
}

// ============================================================================
// MAP SAVE
// ============================================================================

/// Serialize a map to its XML document.
pub fn map_to_xml(map: &TagMap) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "<Map Tags_Count=\"{}\" Arcs_Count=\"{}\">",
        map.tag_count(),
        map.observation_count()
    );
    for tag in map.tags() {
        let _ = writeln!(
            out,
            " <Tag Id=\"{}\" X=\"{}\" Y=\"{}\" Twist=\"{}\" Distance_Per_Pixel=\"{}\" Z=\"{}\"/>",
            tag.id,
            tag.x,
            tag.y,
            tag.twist.to_degrees(),
            tag.distance_per_pixel,
            tag.z
        );
    }
    for obs in map.observations() {
        let (from, to) = map.endpoints(obs);
        let _ = writeln!(
            out,
            " <Arc From_Tag_Id=\"{}\" From_Twist=\"{}\" Distance=\"{}\" To_Tag_Id=\"{}\" To_Twist=\"{}\" Goodness=\"{}\" In_Tree=\"{}\"/>",
            from.id,
            obs.from_twist.to_degrees(),
            obs.distance,
            to.id,
            obs.to_twist.to_degrees(),
            obs.goodness,
            u8::from(obs.in_tree)
        );
    }
    out.push_str("</Map>\n");
    out
}

/// Save a map to an XML file.
pub fn save_map(map: &TagMap, path: impl AsRef<Path>) -> Result<(), PersistError> {
    fs::write(path, map_to_xml(map))?;
    Ok(())
}

// ============================================================================
// MAP RESTORE
// ============================================================================

/// Rebuild a map from its XML document.
///
/// Arcs may precede the tag elements they reference; markers are created
/// lazily on first reference, and the tag elements later overwrite their
/// pose and scale. Arc endpoints must already be in ascending id order on
/// disk; the loader rejects rather than re-canonicalizes, so stored twists
/// are never swap-adjusted.
pub fn map_from_xml(xml: &str, heights: HeightTable) -> Result<TagMap, PersistError> {
    let doc = Document::parse(xml)?;
    let root = doc.root_element();
    if root.tag_name().name() != "Map" {
        return Err(PersistError::UnexpectedRoot {
            expected: "Map",
            found: root.tag_name().name().to_string(),
        });
    }
    let tags_declared: usize = numeric_attr(root, "Map", "Tags_Count")?;
    let arcs_declared: usize = numeric_attr(root, "Map", "Arcs_Count")?;

    let mut map = TagMap::new(heights);
    let mut tag_elements = 0usize;
    let mut arc_elements = 0usize;

    for node in root.children().filter(Node::is_element) {
        match node.tag_name().name() {
            "Tag" => {
                tag_elements += 1;
                let id: u32 = numeric_attr(node, "Tag", "Id")?;
                let x: f64 = numeric_attr(node, "Tag", "X")?;
                let y: f64 = numeric_attr(node, "Tag", "Y")?;
                let twist: f64 = numeric_attr(node, "Tag", "Twist")?;
                let distance_per_pixel: f64 = numeric_attr(node, "Tag", "Distance_Per_Pixel")?;
                let z: f64 = numeric_attr(node, "Tag", "Z")?;
                map.load_tag(id, x, y, twist.to_radians(), distance_per_pixel, z);
            }
            "Arc" => {
                arc_elements += 1;
                let from: u32 = numeric_attr(node, "Arc", "From_Tag_Id")?;
                let to: u32 = numeric_attr(node, "Arc", "To_Tag_Id")?;
                if from >= to {
                    return Err(PersistError::NonCanonicalArc { from, to });
                }
                let from_twist: f64 = numeric_attr(node, "Arc", "From_Twist")?;
                let distance: f64 = numeric_attr(node, "Arc", "Distance")?;
                let to_twist: f64 = numeric_attr(node, "Arc", "To_Twist")?;
                let goodness: f64 = numeric_attr(node, "Arc", "Goodness")?;
                let in_tree: u8 = numeric_attr(node, "Arc", "In_Tree")?;
                map.load_arc(
                    from,
                    from_twist.to_radians(),
                    distance,
                    to,
                    to_twist.to_radians(),
                    goodness,
                    in_tree != 0,
                );
            }
            other => return Err(PersistError::UnexpectedElement(other.to_string())),
        }
    }

    if tag_elements != tags_declared {
        return Err(PersistError::CountMismatch {
            element: "Tag",
            declared: tags_declared,
            actual: tag_elements,
        });
    }
    // Markers referenced by arcs but never declared also break the count.
    if map.tag_count() != tags_declared {
        return Err(PersistError::CountMismatch {
            element: "Tag",
            declared: tags_declared,
            actual: map.tag_count(),
        });
    }
    if arc_elements != arcs_declared {
        return Err(PersistError::CountMismatch {
            element: "Arc",
            declared: arcs_declared,
            actual: arc_elements,
        });
    }

    Ok(map)
}

/// Restore a map from an XML file.
pub fn restore_map(path: impl AsRef<Path>, heights: HeightTable) -> Result<TagMap, PersistError> {
    let xml = fs::read_to_string(path)?;
    map_from_xml(&xml, heights)
}

// ============================================================================
// HEIGHT TABLE
// ============================================================================

/// Parse a height table from its XML document.
pub fn heights_from_xml(xml: &str) -> Result<HeightTable, PersistError> {
    let doc = Document::parse(xml)?;
    let root = doc.root_element();
    if root.tag_name().name() != "Map_Tag_Heights" {
        return Err(PersistError::UnexpectedRoot {
            expected: "Map_Tag_Heights",
            found: root.tag_name().name().to_string(),
        });
    }
    let declared: usize = numeric_attr(root, "Map_Tag_Heights", "Count")?;

    let mut bands = Vec::new();
    for node in root.children().filter(Node::is_element) {
        if node.tag_name().name() != "Tag_Height" {
            return Err(PersistError::UnexpectedElement(
                node.tag_name().name().to_string(),
            ));
        }
        bands.push(HeightBand {
            first_id: numeric_attr(node, "Tag_Height", "First_Id")?,
            last_id: numeric_attr(node, "Tag_Height", "Last_Id")?,
            distance_per_pixel: numeric_attr(node, "Tag_Height", "Distance_Per_Pixel")?,
            z: numeric_attr(node, "Tag_Height", "Z")?,
        });
    }
    if bands.len() != declared {
        return Err(PersistError::CountMismatch {
            element: "Tag_Height",
            declared,
            actual: bands.len(),
        });
    }
    Ok(HeightTable::from_bands(bands))
}

/// Load a height table from an XML file.
pub fn load_heights(path: impl AsRef<Path>) -> Result<HeightTable, PersistError> {
    let xml = fs::read_to_string(path)?;
    heights_from_xml(&xml)
}
