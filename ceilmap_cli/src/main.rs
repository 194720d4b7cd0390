//! Ceilmap host CLI
//!
//! Loads a height table and a persisted map, re-runs pose propagation, and
//! reports the result. Optionally writes the refreshed map back and renders
//! an SVG snapshot.

use std::path::PathBuf;

use anyhow::{Context, Result};
use ceilmap_core::{load_heights, restore_map, save_map, write_svg, SvgOptions, TagMap};
use clap::Parser;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Ceiling fiducial map maintenance CLI
#[derive(Parser, Debug)]
#[command(name = "ceilmap")]
#[command(about = "Refresh and inspect ceiling fiducial maps", long_about = None)]
struct Args {
    /// Height table XML (id bands to distance-per-pixel)
    #[arg(long)]
    heights: PathBuf,

    /// Persisted map XML; starts empty when the file does not exist
    #[arg(long)]
    map: PathBuf,

    /// Write the refreshed map back to --map
    #[arg(long)]
    save: bool,

    /// Render the map to <BASE>.svg
    #[arg(long, value_name = "BASE")]
    svg: Option<String>,

    /// JSON summary on stdout for script consumption
    #[arg(long)]
    json: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");

    let heights = load_heights(&args.heights)
        .with_context(|| format!("loading height table {}", args.heights.display()))?;
    info!("height table: {} bands", heights.len());

    let mut map = if args.map.exists() {
        restore_map(&args.map, heights)
            .with_context(|| format!("restoring map {}", args.map.display()))?
    } else {
        warn!("map {} not found, starting empty", args.map.display());
        TagMap::new(heights)
    };
    info!(
        "map: {} tags, {} observations",
        map.tag_count(),
        map.observation_count()
    );

    // Recompute every pose from the stored observations.
    map.invalidate();
    map.update();

    let tree_edges = map.observations().filter(|obs| obs.in_tree).count();
    let mut bounds = (f64::MAX, f64::MAX, f64::MIN, f64::MIN);
    for tag in map.tags() {
        bounds.0 = bounds.0.min(tag.x);
        bounds.1 = bounds.1.min(tag.y);
        bounds.2 = bounds.2.max(tag.x);
        bounds.3 = bounds.3.max(tag.y);
        debug!(
            "tag {:>4}: x={:8.3} y={:8.3} twist={:7.3} hops={}",
            tag.id,
            tag.x,
            tag.y,
            tag.twist,
            tag.hop_count()
        );
    }
    info!("spanning tree: {} of {} edges", tree_edges, map.observation_count());

    if args.json {
        let summary = serde_json::json!({
            "tags": map.tag_count(),
            "observations": map.observation_count(),
            "tree_edges": tree_edges,
            "bounds": if map.tag_count() > 0 {
                serde_json::json!({
                    "min_x": bounds.0, "min_y": bounds.1,
                    "max_x": bounds.2, "max_y": bounds.3,
                })
            } else {
                serde_json::Value::Null
            },
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }

    if args.save {
        map.sort();
        save_map(&map, &args.map)
            .with_context(|| format!("saving map {}", args.map.display()))?;
        info!("saved {}", args.map.display());
    }

    if let Some(base) = &args.svg {
        let path = write_svg(&map, &[], base, &SvgOptions::default())
            .with_context(|| format!("rendering {base}.svg"))?;
        info!("rendered {}", path.display());
    }

    Ok(())
}
