//! SVG rendering of a tag map.
//!
//! Draws world axes, every tag as an oriented glyph, observations as line
//! segments (red for spanning-tree edges, green for cross edges), and an
//! optional robot trail as a polyline over oriented triangle glyphs. The
//! world-to-page scale is fitted from the bounding box over all tag
//! positions and trail points.

use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::PathBuf;

use nalgebra::Point2;

use crate::fusion::TagMap;

/// Page geometry for rendered maps.
#[derive(Debug, Clone, Copy)]
pub struct SvgOptions {
    /// Page width in pixels
    pub page_width: f64,

    /// Page height in pixels
    pub page_height: f64,

    /// Blank border kept around the drawing
    pub margin: f64,
}

impl Default for SvgOptions {
    fn default() -> Self {
        Self {
            page_width: 800.0,
            page_height: 800.0,
            margin: 40.0,
        }
    }
}

/// One sample of the robot trajectory overlay.
#[derive(Debug, Clone, Copy)]
pub struct TrailPoint {
    /// Floor-plane position
    pub x: f64,
    pub y: f64,

    /// Travel heading, radians
    pub heading: f64,
}

/// World-to-page mapping: uniform scale, y flipped for the page.
struct PageFrame {
    scale: f64,
    world_min: Point2<f64>,
    world_max: Point2<f64>,
    margin: f64,
}

impl PageFrame {
    fn fit(points: impl Iterator<Item = Point2<f64>>, options: &SvgOptions) -> Self {
        let mut world_min = Point2::new(f64::MAX, f64::MAX);
        let mut world_max = Point2::new(f64::MIN, f64::MIN);
        let mut any = false;
        for point in points {
            world_min.x = world_min.x.min(point.x);
            world_min.y = world_min.y.min(point.y);
            world_max.x = world_max.x.max(point.x);
            world_max.y = world_max.y.max(point.y);
            any = true;
        }
        if !any {
            world_min = Point2::new(-1.0, -1.0);
            world_max = Point2::new(1.0, 1.0);
        }
        // A degenerate span still needs a finite scale.
        let span_x = (world_max.x - world_min.x).max(1e-9);
        let span_y = (world_max.y - world_min.y).max(1e-9);
        let scale = ((options.page_width - 2.0 * options.margin) / span_x)
            .min((options.page_height - 2.0 * options.margin) / span_y);
        Self {
            scale,
            world_min,
            world_max,
            margin: options.margin,
        }
    }

    fn to_page(&self, x: f64, y: f64) -> (f64, f64) {
        (
            self.margin + (x - self.world_min.x) * self.scale,
            self.margin + (self.world_max.y - y) * self.scale,
        )
    }
}

/// Render a map (and optional robot trail) to an SVG document.
pub fn render_svg(map: &TagMap, trail: &[TrailPoint], options: &SvgOptions) -> String {
    let frame = PageFrame::fit(
        map.tags()
            .map(|tag| Point2::new(tag.x, tag.y))
            .chain(trail.iter().map(|point| Point2::new(point.x, point.y))),
        options,
    );

    let mut out = String::new();
    let _ = writeln!(
        out,
        "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"{}\" height=\"{}\" viewBox=\"0 0 {} {}\">",
        options.page_width, options.page_height, options.page_width, options.page_height
    );
    let _ = writeln!(out, "<rect width=\"100%\" height=\"100%\" fill=\"white\"/>");

    // World axes through the origin.
    let (origin_x, origin_y) = frame.to_page(0.0, 0.0);
    let _ = writeln!(
        out,
        "<line x1=\"0\" y1=\"{origin_y:.2}\" x2=\"{}\" y2=\"{origin_y:.2}\" stroke=\"gray\" stroke-width=\"0.5\"/>",
        options.page_width
    );
    let _ = writeln!(
        out,
        "<line x1=\"{origin_x:.2}\" y1=\"0\" x2=\"{origin_x:.2}\" y2=\"{}\" stroke=\"gray\" stroke-width=\"0.5\"/>",
        options.page_height
    );

    // Observations under the tag glyphs: red tree edges, green cross edges.
    for obs in map.observations() {
        let (from, to) = map.endpoints(obs);
        let (x1, y1) = frame.to_page(from.x, from.y);
        let (x2, y2) = frame.to_page(to.x, to.y);
        let stroke = if obs.in_tree { "red" } else { "green" };
        let _ = writeln!(
            out,
            "<line x1=\"{x1:.2}\" y1=\"{y1:.2}\" x2=\"{x2:.2}\" y2=\"{y2:.2}\" stroke=\"{stroke}\" stroke-width=\"1\"/>"
        );
    }

    // Tags as oriented glyphs: a square with a heading stroke and the id.
    for tag in map.tags() {
        let (x, y) = frame.to_page(tag.x, tag.y);
        // The page y axis points down, so rotations flip sign.
        let rotation = -tag.twist.to_degrees();
        let _ = writeln!(
            out,
            "<g transform=\"translate({x:.2} {y:.2}) rotate({rotation:.2})\">\
             <rect x=\"-4\" y=\"-4\" width=\"8\" height=\"8\" fill=\"none\" stroke=\"black\"/>\
             <line x1=\"0\" y1=\"0\" x2=\"8\" y2=\"0\" stroke=\"black\"/>\
             </g>"
        );
        let _ = writeln!(
            out,
            "<text x=\"{:.2}\" y=\"{:.2}\" font-size=\"10\">{}</text>",
            x + 6.0,
            y - 6.0,
            tag.id
        );
    }

    // Robot trail: polyline over oriented triangles.
    if !trail.is_empty() {
        let mut points = String::new();
        for sample in trail {
            let (x, y) = frame.to_page(sample.x, sample.y);
            let _ = write!(points, "{x:.2},{y:.2} ");
        }
        let _ = writeln!(
            out,
            "<polyline points=\"{}\" fill=\"none\" stroke=\"blue\" stroke-width=\"0.8\"/>",
            points.trim_end()
        );
        for sample in trail {
            let (x, y) = frame.to_page(sample.x, sample.y);
            let rotation = -sample.heading.to_degrees();
            let _ = writeln!(
                out,
                "<polygon points=\"6,0 -4,3 -4,-3\" fill=\"blue\" \
                 transform=\"translate({x:.2} {y:.2}) rotate({rotation:.2})\"/>"
            );
        }
    }

    out.push_str("</svg>\n");
    out
}

/// Render a map to `<base_name>.svg`. Returns the path written.
pub fn write_svg(
    map: &TagMap,
    trail: &[TrailPoint],
    base_name: &str,
    options: &SvgOptions,
) -> io::Result<PathBuf> {
    let path = PathBuf::from(format!("{base_name}.svg"));
    fs::write(&path, render_svg(map, trail, options))?;
    Ok(path)
}
