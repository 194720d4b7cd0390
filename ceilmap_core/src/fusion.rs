//! The map fusion engine - tags, pairwise observations, pose propagation.
//!
//! Builds a floor-plane map of ceiling markers from pairwise detections by:
//! - Deduplicating measurements into one observation per unordered id pair
//! - Keeping only the best measurement per pair (radial-offset "goodness")
//! - Growing a shortest-edge-first spanning tree from the lowest-id marker
//! - Composing planar rigid-body transforms along tree edges into absolute poses
//!
//! The engine is single-threaded: no engine state is locked, and calling it
//! from more than one thread concurrently is a user error. Hosts that need
//! multi-producer ingestion wrap the engine in their own mutex.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::f64::consts::PI;

use nalgebra::{Point2, Vector2};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::heights::HeightTable;

/// Goodness of an observation that has never been measured.
/// Any real measurement compares strictly better.
pub const UNMEASURED_GOODNESS: f64 = 123_456_789.0;

/// Twists closer than this compare equal between two maps.
const TWIST_TOLERANCE: f64 = 1e-6;

/// Coordinates, distances and goodness closer than this compare equal.
const COORD_TOLERANCE: f64 = 1e-3;

/// Shift an angle into the half-open interval (-PI, PI].
pub fn normalize_angle(mut angle: f64) -> f64 {
    while angle > PI {
        angle -= 2.0 * PI;
    }
    while angle <= -PI {
        angle += 2.0 * PI;
    }
    angle
}

// ============================================================================
// ARENA HANDLES
// ============================================================================

/// Stable slot of a tag in the engine's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TagId(usize);

/// Stable slot of an observation in the engine's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObsId(usize);

// ============================================================================
// INGEST INPUT
// ============================================================================

/// One marker seen in one camera frame: decoded id, pixel center, pixel twist.
///
/// Detection itself (image decoding, fiducial recognition) happens upstream;
/// the engine only consumes the decoded result.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TagDetection {
    /// Marker id decoded from the fiducial pattern
    pub id: u32,

    /// Pixel x of the marker center
    pub x: f64,

    /// Pixel y of the marker center
    pub y: f64,

    /// Marker orientation in the image plane, radians
    pub twist: f64,
}

// ============================================================================
// ANNOUNCE HOOK
// ============================================================================

/// Pose report delivered to the announce handler each time propagation
/// assigns a tag's pose. Expect many reports per [`TagMap::update`] call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TagAnnounce {
    /// Marker id
    pub id: u32,

    /// Floor-plane position
    pub x: f64,
    pub y: f64,

    /// Ceiling height of the tag's band
    pub z: f64,

    /// Orientation on the floor plane, radians in (-PI, PI]
    pub twist: f64,

    /// Floor units per pixel at this tag's ceiling height, as a glyph-size
    /// hint for display consumers
    pub dx: f64,
    pub dy: f64,

    /// Zero for coplanar ceiling maps
    pub dz: f64,
}

type AnnounceHandler = Box<dyn FnMut(&TagAnnounce) + Send>;

// ============================================================================
// TAG (A MAPPED MARKER)
// ============================================================================

/// A mapped ceiling marker.
///
/// Created lazily on first reference by id, either from ingestion or from a
/// persisted map; never destroyed while the engine lives. Pose fields are
/// assigned by pose propagation and are stale until a tag is reached from
/// the origin.
#[derive(Debug)]
pub struct Tag {
    /// Marker id, unique within the map
    pub id: u32,

    /// Floor-plane position
    pub x: f64,
    pub y: f64,

    /// Orientation on the floor plane, radians in (-PI, PI]
    pub twist: f64,

    /// Floor distance per image pixel at this tag's ceiling height
    pub distance_per_pixel: f64,

    /// Ceiling height above the floor
    pub z: f64,

    /// Observations incident on this tag
    edges: Vec<ObsId>,

    /// Tree depth from the origin, scratch for the current propagation pass
    hop_count: u32,

    /// Generation stamp of the last propagation pass that reached this tag
    visit: u64,
}

impl Tag {
    fn new(id: u32, distance_per_pixel: f64, z: f64) -> Self {
        Self {
            id,
            x: 0.0,
            y: 0.0,
            twist: 0.0,
            distance_per_pixel,
            z,
            edges: Vec::new(),
            hop_count: 0,
            visit: 0,
        }
    }

    /// Register an incident observation, rejecting duplicates.
    fn attach_edge(&mut self, obs: ObsId) {
        if !self.edges.contains(&obs) {
            self.edges.push(obs);
        }
    }

    /// Tree depth from the origin after the last propagation pass.
    pub fn hop_count(&self) -> u32 {
        self.hop_count
    }

    /// Number of observations incident on this tag.
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }
}

// ============================================================================
// OBSERVATION (AN UNDIRECTED EDGE)
// ============================================================================

/// The best relative measurement ever seen between two tags.
///
/// Endpoints are stored in canonical order: the lower marker id is the
/// `from` side. Both twists are referred to the line segment joining the
/// pair, the `to` side rotated by PI.
#[derive(Debug)]
pub struct Observation {
    from: TagId,
    to: TagId,

    /// Rotation of the `from` endpoint relative to the joining segment
    pub from_twist: f64,

    /// Rotation of the `to` endpoint relative to the joining segment,
    /// flipped by PI
    pub to_twist: f64,

    /// Floor-plane distance between the two marker centers
    pub distance: f64,

    /// Measurement quality, lower is better; [`UNMEASURED_GOODNESS`] until
    /// the first real measurement lands
    pub goodness: f64,

    /// Whether the last propagation pass used this edge in its spanning tree
    pub in_tree: bool,

    /// Generation stamp of the last propagation pass that popped this edge
    visit: u64,
}

impl Observation {
    fn unmeasured(from: TagId, to: TagId) -> Self {
        Self {
            from,
            to,
            from_twist: 0.0,
            to_twist: 0.0,
            distance: 0.0,
            goodness: UNMEASURED_GOODNESS,
            in_tree: false,
            visit: 0,
        }
    }

    /// Overwrite the measurement in place. Endpoints never change.
    fn update(&mut self, from_twist: f64, distance: f64, to_twist: f64, goodness: f64) {
        self.from_twist = from_twist;
        self.to_twist = to_twist;
        self.distance = distance;
        self.goodness = goodness;
    }
}

// ============================================================================
// TAG MAP (THE ENGINE)
// ============================================================================

/// The map fusion engine.
///
/// Owns every tag, observation and height band for its whole lifetime.
/// Tags and observations reference each other through arena slots, so the
/// cyclic marker/edge structure needs no shared ownership.
pub struct TagMap {
    /// Tag arena; slots are stable for the engine's lifetime
    tags: Vec<Tag>,

    /// Marker id to tag slot
    tag_index: HashMap<u32, TagId>,

    /// Observation arena; slots are stable for the engine's lifetime
    observations: Vec<Observation>,

    /// Canonical (low id, high id) pair to observation slot. Guarantees at
    /// most one observation per unordered pair.
    pair_index: HashMap<(u32, u32), ObsId>,

    /// Physical scale per marker id band
    heights: HeightTable,

    /// Propagation generation counter. Stamping tags and observations with
    /// the current generation avoids clearing per-entity scratch between
    /// passes.
    visit: u64,

    /// Whether any observation changed since the last propagation pass
    changed: bool,

    /// Pose report hook, fired once per tag reached during propagation
    announce: Option<AnnounceHandler>,
}

impl std::fmt::Debug for TagMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TagMap")
            .field("tags", &self.tags)
            .field("tag_index", &self.tag_index)
            .field("observations", &self.observations)
            .field("pair_index", &self.pair_index)
            .field("heights", &self.heights)
            .field("visit", &self.visit)
            .field("changed", &self.changed)
            .field("announce", &self.announce.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl TagMap {
    /// Create an empty map over the given height table.
    pub fn new(heights: HeightTable) -> Self {
        Self {
            tags: Vec::new(),
            tag_index: HashMap::new(),
            observations: Vec::new(),
            pair_index: HashMap::new(),
            heights,
            visit: 0,
            changed: false,
            announce: None,
        }
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    /// Number of mapped tags.
    pub fn tag_count(&self) -> usize {
        self.tags.len()
    }

    /// Number of observations.
    pub fn observation_count(&self) -> usize {
        self.observations.len()
    }

    /// Whether any observation changed since the last propagation pass.
    pub fn is_changed(&self) -> bool {
        self.changed
    }

    /// The height table this map resolves marker scale from.
    pub fn heights(&self) -> &HeightTable {
        &self.heights
    }

    /// Look up a tag by marker id.
    pub fn tag(&self, id: u32) -> Option<&Tag> {
        self.tag_index.get(&id).map(|slot| &self.tags[slot.0])
    }

    /// All tags, in arena order.
    pub fn tags(&self) -> impl Iterator<Item = &Tag> {
        self.tags.iter()
    }

    /// All observations, in arena order.
    pub fn observations(&self) -> impl Iterator<Item = &Observation> {
        self.observations.iter()
    }

    /// Look up the observation between two marker ids, either order.
    pub fn observation(&self, a: u32, b: u32) -> Option<&Observation> {
        let key = (a.min(b), a.max(b));
        self.pair_index.get(&key).map(|slot| &self.observations[slot.0])
    }

    /// Resolve an observation's endpoints, canonical `from` first.
    pub fn endpoints(&self, obs: &Observation) -> (&Tag, &Tag) {
        (&self.tags[obs.from.0], &self.tags[obs.to.0])
    }

    /// Register the pose report hook fired during propagation.
    pub fn on_tag_update(&mut self, handler: impl FnMut(&TagAnnounce) + Send + 'static) {
        self.announce = Some(Box::new(handler));
    }

    /// Force the next [`update`](Self::update) call to re-propagate poses
    /// even though no observation changed.
    pub fn invalidate(&mut self) {
        self.changed = true;
    }

    // ========================================================================
    // TAG AND OBSERVATION CREATION
    // ========================================================================

    /// Look up a tag slot by id, creating the tag on first reference.
    /// Scale and ceiling height come from the height table.
    pub(crate) fn intern_tag(&mut self, id: u32) -> TagId {
        if let Some(&slot) = self.tag_index.get(&id) {
            return slot;
        }
        let (distance_per_pixel, z) = match self.heights.band(id) {
            Some(band) => (band.distance_per_pixel, band.z),
            None => {
                warn!(id, "tag id outside every height band, distance scale unknown");
                (0.0, 0.0)
            }
        };
        let slot = TagId(self.tags.len());
        self.tags.push(Tag::new(id, distance_per_pixel, z));
        self.tag_index.insert(id, slot);
        slot
    }

    /// Look up the observation for a canonical id pair, creating an
    /// unmeasured one on first reference. A repeated create for the same
    /// pair always returns the existing slot.
    pub(crate) fn lookup_or_create(&mut self, from_id: u32, to_id: u32) -> ObsId {
        debug_assert!(from_id < to_id, "observation endpoints must be in ascending id order");
        if let Some(&slot) = self.pair_index.get(&(from_id, to_id)) {
            return slot;
        }
        let from = self.intern_tag(from_id);
        let to = self.intern_tag(to_id);
        let slot = ObsId(self.observations.len());
        self.observations.push(Observation::unmeasured(from, to));
        self.tags[from.0].attach_edge(slot);
        self.tags[to.0].attach_edge(slot);
        self.pair_index.insert((from_id, to_id), slot);
        slot
    }

    /// Restore a tag from persisted state, overwriting pose and scale.
    pub(crate) fn load_tag(&mut self, id: u32, x: f64, y: f64, twist: f64, distance_per_pixel: f64, z: f64) {
        let slot = self.intern_tag(id);
        let tag = &mut self.tags[slot.0];
        tag.x = x;
        tag.y = y;
        tag.twist = normalize_angle(twist);
        tag.distance_per_pixel = distance_per_pixel;
        tag.z = z;
    }

    /// Restore an observation from persisted state.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn load_arc(
        &mut self,
        from_id: u32,
        from_twist: f64,
        distance: f64,
        to_id: u32,
        to_twist: f64,
        goodness: f64,
        in_tree: bool,
    ) {
        let slot = self.lookup_or_create(from_id, to_id);
        let obs = &mut self.observations[slot.0];
        obs.update(normalize_angle(from_twist), distance, normalize_angle(to_twist), goodness);
        obs.in_tree = in_tree;
    }

    // ========================================================================
    // INGEST
    // ========================================================================

    /// Fuse one same-frame detection pair into the map.
    ///
    /// The candidate measurement's goodness is the absolute difference of
    /// the two pixel centers' distances from the image center: radial lens
    /// distortion grows away from the optical axis, so a pair seen at equal
    /// radii is the most trustworthy. The stored observation is overwritten
    /// only when the candidate is strictly better.
    ///
    /// Returns `true` iff the stored observation was improved.
    pub fn observe_pair(
        &mut self,
        a: &TagDetection,
        b: &TagDetection,
        image_width: f64,
        image_height: f64,
    ) -> bool {
        if a.id == b.id {
            warn!(id = a.id, "detection pair with a single marker id, dropped");
            return false;
        }
        // Canonical order up front. Swapping the pair rotates the joining
        // segment by PI, which exactly exchanges the two relative twists, so
        // ordering before the math is equivalent to swapping afterwards.
        let (from, to) = if a.id < b.id { (a, b) } else { (b, a) };

        let center = Point2::new(image_width / 2.0, image_height / 2.0);
        let from_offset: Vector2<f64> = Point2::new(from.x, from.y) - center;
        let to_offset: Vector2<f64> = Point2::new(to.x, to.y) - center;
        let from_rho = from_offset.norm();
        let to_rho = to_offset.norm();
        let goodness = (from_rho - to_rho).abs();

        let slot = self.lookup_or_create(from.id, to.id);
        if goodness >= self.observations[slot.0].goodness {
            return false;
        }

        // Project both centers onto the floor plane as seen from the optical
        // axis. Each endpoint carries its own scale: the pair may sit under
        // different ceiling heights.
        let from_phi = from_offset.y.atan2(from_offset.x);
        let to_phi = to_offset.y.atan2(to_offset.x);
        let from_dpp = self.heights.distance_per_pixel(from.id);
        let to_dpp = self.heights.distance_per_pixel(to.id);
        let from_floor = Vector2::new(
            from_dpp * from_rho * from_phi.cos(),
            from_dpp * from_rho * from_phi.sin(),
        );
        let to_floor = Vector2::new(to_dpp * to_rho * to_phi.cos(), to_dpp * to_rho * to_phi.sin());
        let distance = (from_floor - to_floor).norm();

        let segment = (to.y - from.y).atan2(to.x - from.x);
        let from_twist = normalize_angle(from.twist - segment);
        let to_twist = normalize_angle(to.twist + PI - segment);

        self.observations[slot.0].update(from_twist, distance, to_twist, goodness);
        self.changed = true;
        debug!(
            from = from.id,
            to = to.id,
            distance,
            goodness,
            "observation improved"
        );
        true
    }

    // ========================================================================
    // POSE PROPAGATION
    // ========================================================================

    /// Recompute absolute poses if any observation changed since the last
    /// pass. Returns `true` iff propagation ran.
    ///
    /// The lowest-id tag becomes the origin at (0, 0, 0); a spanning tree is
    /// grown over observations by ascending distance (ties broken toward the
    /// endpoint pair with the lowest hop count), and poses are composed along
    /// tree edges. Tags unreachable from the origin keep their stale pose.
    pub fn update(&mut self) -> bool {
        if !self.changed {
            return false;
        }
        self.propagate_poses();
        self.changed = false;
        true
    }

    fn propagate_poses(&mut self) {
        let Some(origin) = self
            .tags
            .iter()
            .enumerate()
            .min_by_key(|(_, tag)| tag.id)
            .map(|(slot, _)| TagId(slot))
        else {
            return;
        };
        self.visit += 1;
        let generation = self.visit;

        {
            let tag = &mut self.tags[origin.0];
            tag.x = 0.0;
            tag.y = 0.0;
            tag.twist = 0.0;
            tag.hop_count = 0;
            tag.visit = generation;
        }
        self.announce_tag(origin);

        let mut frontier: Vec<ObsId> = self.tags[origin.0].edges.clone();
        let mut reached = 1usize;
        let mut tree_edges = 0usize;

        while !frontier.is_empty() {
            // Longest first, so the tail is the shortest edge with the
            // best-connected endpoint pair.
            frontier.sort_by(|a, b| self.distance_compare(*a, *b));
            let slot = match frontier.pop() {
                Some(slot) => slot,
                None => break,
            };

            let (from, to) = {
                let obs = &mut self.observations[slot.0];
                if obs.visit == generation {
                    continue;
                }
                obs.visit = generation;
                (obs.from, obs.to)
            };
            let from_new = self.tags[from.0].visit != generation;
            let to_new = self.tags[to.0].visit != generation;

            match (from_new, to_new) {
                (false, false) => {
                    // Both endpoints already placed: non-tree cross edge.
                    self.observations[slot.0].in_tree = false;
                }
                (true, true) => {
                    // Frontier edges are collected from placed tags only, so
                    // this cannot happen unless frontier management broke.
                    debug_assert!(false, "frontier edge with two unplaced endpoints");
                    error!(
                        from = self.tags[from.0].id,
                        to = self.tags[to.0].id,
                        "frontier edge with two unplaced endpoints, pose left untouched"
                    );
                }
                _ => {
                    let (parent, child) = if from_new { (to, from) } else { (from, to) };
                    let hop_count = self.tags[parent.0].hop_count + 1;
                    {
                        let tag = &mut self.tags[child.0];
                        tag.hop_count = hop_count;
                        tag.visit = generation;
                    }
                    self.observations[slot.0].in_tree = true;
                    self.compose_child_pose(slot, parent, child);
                    frontier.extend(self.tags[child.0].edges.iter().copied());
                    self.announce_tag(child);
                    reached += 1;
                    tree_edges += 1;
                }
            }
        }

        debug!(
            reached,
            tree_edges,
            tags = self.tags.len(),
            observations = self.observations.len(),
            "pose propagation finished"
        );
    }

    /// Assign the child's pose from its placed parent across a tree edge.
    ///
    /// Both twists of an observation are referred to the joining segment
    /// (the `to` side flipped by PI), so from either parent role:
    /// bearing = parent twist - parent role twist (+ PI from the `to` side),
    /// child twist = parent twist - parent role twist + child role twist.
    fn compose_child_pose(&mut self, slot: ObsId, parent: TagId, child: TagId) {
        let obs = &self.observations[slot.0];
        let (parent_twist, child_twist, flip) = if obs.from == parent {
            (obs.from_twist, obs.to_twist, 0.0)
        } else {
            (obs.to_twist, obs.from_twist, PI)
        };
        let distance = obs.distance;

        let anchor = &self.tags[parent.0];
        let bearing = normalize_angle(anchor.twist - parent_twist + flip);
        let twist = normalize_angle(anchor.twist - parent_twist + child_twist);
        let (anchor_x, anchor_y) = (anchor.x, anchor.y);

        let tag = &mut self.tags[child.0];
        tag.x = anchor_x + distance * bearing.cos();
        tag.y = anchor_y + distance * bearing.sin();
        tag.twist = twist;
    }

    /// Frontier ordering: descending by distance, ties descending by the
    /// minimum endpoint hop count. Popping from the tail of a list sorted
    /// this way yields the shortest edge whose neighborhood is already the
    /// best connected.
    fn distance_compare(&self, a: ObsId, b: ObsId) -> Ordering {
        let obs_a = &self.observations[a.0];
        let obs_b = &self.observations[b.0];
        obs_b
            .distance
            .partial_cmp(&obs_a.distance)
            .unwrap_or(Ordering::Equal)
            .then_with(|| {
                let hops_a = self.tags[obs_a.from.0]
                    .hop_count
                    .min(self.tags[obs_a.to.0].hop_count);
                let hops_b = self.tags[obs_b.from.0]
                    .hop_count
                    .min(self.tags[obs_b.to.0].hop_count);
                hops_b.cmp(&hops_a)
            })
    }

    fn announce_tag(&mut self, slot: TagId) {
        if self.announce.is_none() {
            return;
        }
        let tag = &self.tags[slot.0];
        let report = TagAnnounce {
            id: tag.id,
            x: tag.x,
            y: tag.y,
            z: tag.z,
            twist: tag.twist,
            dx: tag.distance_per_pixel,
            dy: tag.distance_per_pixel,
            dz: 0.0,
        };
        if let Some(handler) = self.announce.as_mut() {
            handler(&report);
        }
    }

    // ========================================================================
    // SORTING AND COMPARISON
    // ========================================================================

    /// Physically sort tags by id and observations by canonical id pair,
    /// remapping every stored arena slot.
    pub fn sort(&mut self) {
        let pair_ids: Vec<(u32, u32)> = self
            .observations
            .iter()
            .map(|obs| (self.tags[obs.from.0].id, self.tags[obs.to.0].id))
            .collect();

        let mut indexed_tags: Vec<(usize, Tag)> =
            std::mem::take(&mut self.tags).into_iter().enumerate().collect();
        indexed_tags.sort_by_key(|(_, tag)| tag.id);
        let mut tag_remap = vec![0usize; indexed_tags.len()];
        for (new_slot, (old_slot, _)) in indexed_tags.iter().enumerate() {
            tag_remap[*old_slot] = new_slot;
        }
        self.tags = indexed_tags.into_iter().map(|(_, tag)| tag).collect();

        let mut indexed_obs: Vec<(usize, Observation)> = std::mem::take(&mut self.observations)
            .into_iter()
            .enumerate()
            .collect();
        indexed_obs.sort_by_key(|(old_slot, _)| pair_ids[*old_slot]);
        let mut obs_remap = vec![0usize; indexed_obs.len()];
        for (new_slot, (old_slot, _)) in indexed_obs.iter().enumerate() {
            obs_remap[*old_slot] = new_slot;
        }
        self.observations = indexed_obs.into_iter().map(|(_, obs)| obs).collect();

        for obs in &mut self.observations {
            obs.from = TagId(tag_remap[obs.from.0]);
            obs.to = TagId(tag_remap[obs.to.0]);
        }
        for tag in &mut self.tags {
            for edge in &mut tag.edges {
                *edge = ObsId(obs_remap[edge.0]);
            }
        }
        self.tag_index = self
            .tags
            .iter()
            .enumerate()
            .map(|(slot, tag)| (tag.id, TagId(slot)))
            .collect();
        self.pair_index = self
            .observations
            .iter()
            .enumerate()
            .map(|(slot, obs)| {
                ((self.tags[obs.from.0].id, self.tags[obs.to.0].id), ObsId(slot))
            })
            .collect();
    }

    /// Total order over maps: tag-list sizes, then tags in ascending id
    /// order, then observation-list sizes, then observations in ascending
    /// pair order. Real-valued fields compare equal within a small tolerance
    /// so that a persistence round trip compares equal.
    pub fn compare(&self, other: &TagMap) -> Ordering {
        let ord = self.tags.len().cmp(&other.tags.len());
        if ord != Ordering::Equal {
            return ord;
        }

        let mut mine: Vec<&Tag> = self.tags.iter().collect();
        let mut theirs: Vec<&Tag> = other.tags.iter().collect();
        mine.sort_by_key(|tag| tag.id);
        theirs.sort_by_key(|tag| tag.id);
        for (a, b) in mine.iter().zip(&theirs) {
            let ord = a
                .id
                .cmp(&b.id)
                .then_with(|| approx_compare(a.x, b.x, COORD_TOLERANCE))
                .then_with(|| approx_compare(a.y, b.y, COORD_TOLERANCE))
                .then_with(|| approx_compare(a.twist, b.twist, TWIST_TOLERANCE));
            if ord != Ordering::Equal {
                return ord;
            }
        }

        let ord = self.observations.len().cmp(&other.observations.len());
        if ord != Ordering::Equal {
            return ord;
        }

        let mut mine: Vec<&Observation> = self.observations.iter().collect();
        let mut theirs: Vec<&Observation> = other.observations.iter().collect();
        mine.sort_by_key(|obs| (self.tags[obs.from.0].id, self.tags[obs.to.0].id));
        theirs.sort_by_key(|obs| (other.tags[obs.from.0].id, other.tags[obs.to.0].id));
        for (a, b) in mine.iter().zip(&theirs) {
            let pair_a = (self.tags[a.from.0].id, self.tags[a.to.0].id);
            let pair_b = (other.tags[b.from.0].id, other.tags[b.to.0].id);
            let ord = pair_a
                .cmp(&pair_b)
                .then_with(|| approx_compare(a.from_twist, b.from_twist, TWIST_TOLERANCE))
                .then_with(|| approx_compare(a.to_twist, b.to_twist, TWIST_TOLERANCE))
                .then_with(|| approx_compare(a.distance, b.distance, COORD_TOLERANCE))
                .then_with(|| approx_compare(a.goodness, b.goodness, COORD_TOLERANCE))
                .then_with(|| a.in_tree.cmp(&b.in_tree));
            if ord != Ordering::Equal {
                return ord;
            }
        }

        Ordering::Equal
    }
}

fn approx_compare(a: f64, b: f64, tolerance: f64) -> Ordering {
    if (a - b).abs() <= tolerance {
        Ordering::Equal
    } else {
        a.partial_cmp(&b).unwrap_or(Ordering::Equal)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heights::HeightBand;
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;
    use std::sync::{Arc, Mutex};

    fn unit_heights() -> HeightTable {
        HeightTable::from_bands(vec![HeightBand {
            first_id: 0,
            last_id: 99,
            distance_per_pixel: 1.0,
            z: 1.0,
        }])
    }

    fn detection(id: u32, x: f64, y: f64, twist: f64) -> TagDetection {
        TagDetection { id, x, y, twist }
    }

    /// The two-marker frame of the basic vertical-pair scenario: ids 1 and 2
    /// at (100, 50) and (100, 150) in a 200x200 image, both with zero twist.
    fn observe_vertical_pair(map: &mut TagMap) -> bool {
        map.observe_pair(
            &detection(1, 100.0, 50.0, 0.0),
            &detection(2, 100.0, 150.0, 0.0),
            200.0,
            200.0,
        )
    }

    #[test]
    fn normalize_angle_lands_in_half_open_interval() {
        assert_eq!(normalize_angle(0.0), 0.0);
        assert_eq!(normalize_angle(PI), PI);
        assert_eq!(normalize_angle(-PI), PI);
        assert_abs_diff_eq!(normalize_angle(3.0 * PI / 2.0), -PI / 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(normalize_angle(-5.0 * PI / 2.0), -PI / 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(normalize_angle(2.0 * PI), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn empty_map_update_is_inert() {
        let mut map = TagMap::new(unit_heights());
        let fired = Arc::new(Mutex::new(0usize));
        let counter = fired.clone();
        map.on_tag_update(move |_| *counter.lock().unwrap() += 1);

        assert!(!map.is_changed());
        assert!(!map.update());
        assert_eq!(map.tag_count(), 0);
        assert_eq!(map.observation_count(), 0);
        assert_eq!(*fired.lock().unwrap(), 0);
    }

    #[test]
    fn single_edge_assigns_child_pose() {
        let mut map = TagMap::new(unit_heights());
        assert!(observe_vertical_pair(&mut map));
        assert!(map.update());

        let obs = map.observation(1, 2).unwrap();
        assert!(obs.in_tree);
        assert_abs_diff_eq!(obs.goodness, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(obs.distance, 100.0, epsilon = 1e-9);

        let origin = map.tag(1).unwrap();
        assert_eq!(origin.hop_count(), 0);
        assert_abs_diff_eq!(origin.x, 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(origin.y, 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(origin.twist, 0.0, epsilon = 1e-9);

        let child = map.tag(2).unwrap();
        assert_eq!(child.hop_count(), 1);
        assert_abs_diff_eq!(child.x, 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(child.y, 100.0, epsilon = 1e-9);
        assert_abs_diff_eq!(child.twist, PI, epsilon = 1e-9);
    }

    #[test]
    fn worse_measurement_is_discarded() {
        let mut map = TagMap::new(unit_heights());
        assert!(observe_vertical_pair(&mut map));
        assert!(map.update());

        // Radii now differ by 5 pixels: goodness 5 loses to the stored 0.
        let updated = map.observe_pair(
            &detection(1, 100.0, 45.0, 0.0),
            &detection(2, 100.0, 150.0, 0.0),
            200.0,
            200.0,
        );
        assert!(!updated);
        assert!(!map.is_changed());

        let obs = map.observation(1, 2).unwrap();
        assert_abs_diff_eq!(obs.goodness, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(obs.distance, 100.0, epsilon = 1e-9);
    }

    #[test]
    fn better_measurement_overwrites() {
        let mut map = TagMap::new(unit_heights());

        // Poor first: radii 70 and 50.
        assert!(map.observe_pair(
            &detection(1, 100.0, 30.0, 0.0),
            &detection(2, 100.0, 150.0, 0.0),
            200.0,
            200.0,
        ));
        let obs = map.observation(1, 2).unwrap();
        assert_abs_diff_eq!(obs.goodness, 20.0, epsilon = 1e-9);

        // Better second: radii 52 and 50.
        assert!(map.observe_pair(
            &detection(1, 100.0, 48.0, 0.0),
            &detection(2, 100.0, 150.0, 0.0),
            200.0,
            200.0,
        ));
        let obs = map.observation(1, 2).unwrap();
        assert_abs_diff_eq!(obs.goodness, 2.0, epsilon = 1e-9);
        assert_abs_diff_eq!(obs.distance, 102.0, epsilon = 1e-9);
    }

    /// Three tags with pair distances 60, 60 and ~84.9: the two short edges
    /// span the triangle, the long one becomes a cross edge.
    fn observe_triangle(map: &mut TagMap) {
        map.observe_pair(
            &detection(1, 100.0, 100.0, 0.0),
            &detection(2, 100.0, 160.0, 0.0),
            200.0,
            200.0,
        );
        map.observe_pair(
            &detection(2, 100.0, 160.0, 0.0),
            &detection(3, 160.0, 100.0, 0.0),
            200.0,
            200.0,
        );
        map.observe_pair(
            &detection(1, 100.0, 100.0, 0.0),
            &detection(3, 160.0, 100.0, 0.0),
            200.0,
            200.0,
        );
    }

    #[test]
    fn triangle_keeps_two_shortest_edges_in_tree() {
        let mut map = TagMap::new(unit_heights());
        observe_triangle(&mut map);
        assert_eq!(map.tag_count(), 3);
        assert_eq!(map.observation_count(), 3);
        assert!(map.update());

        assert!(map.observation(1, 2).unwrap().in_tree);
        assert!(map.observation(1, 3).unwrap().in_tree);
        assert!(!map.observation(2, 3).unwrap().in_tree);

        let tree_edges = map.observations().filter(|obs| obs.in_tree).count();
        assert_eq!(tree_edges, 2);

        // Tree distances survive into world coordinates.
        let origin = map.tag(1).unwrap();
        let b = map.tag(2).unwrap();
        let c = map.tag(3).unwrap();
        let d_ab = ((b.x - origin.x).powi(2) + (b.y - origin.y).powi(2)).sqrt();
        let d_ac = ((c.x - origin.x).powi(2) + (c.y - origin.y).powi(2)).sqrt();
        assert_abs_diff_eq!(d_ab, 60.0, epsilon = 1e-9);
        assert_abs_diff_eq!(d_ac, 60.0, epsilon = 1e-9);
        assert_eq!(b.hop_count(), 1);
        assert_eq!(c.hop_count(), 1);
    }

    #[test]
    fn reversed_argument_order_stores_the_same_measurement() {
        let mut forward = TagMap::new(unit_heights());
        let mut reversed = TagMap::new(unit_heights());
        let a = detection(1, 80.0, 50.0, 0.7);
        let b = detection(2, 120.0, 150.0, -1.2);

        assert!(forward.observe_pair(&a, &b, 200.0, 200.0));
        assert!(reversed.observe_pair(&b, &a, 200.0, 200.0));

        let obs_f = forward.observation(1, 2).unwrap();
        let obs_r = reversed.observation(1, 2).unwrap();
        let (from_f, to_f) = forward.endpoints(obs_f);
        assert!(from_f.id < to_f.id);
        assert_abs_diff_eq!(obs_f.from_twist, obs_r.from_twist, epsilon = 1e-12);
        assert_abs_diff_eq!(obs_f.to_twist, obs_r.to_twist, epsilon = 1e-12);
        assert_abs_diff_eq!(obs_f.distance, obs_r.distance, epsilon = 1e-12);
        assert_abs_diff_eq!(obs_f.goodness, obs_r.goodness, epsilon = 1e-12);
    }

    #[test]
    fn repeated_pairs_deduplicate_to_one_observation() {
        let mut map = TagMap::new(unit_heights());
        for offset in 0..5 {
            let shift = offset as f64;
            map.observe_pair(
                &detection(1, 100.0, 50.0 - shift, 0.0),
                &detection(2, 100.0, 150.0, 0.0),
                200.0,
                200.0,
            );
            map.observe_pair(
                &detection(2, 100.0, 150.0, 0.0),
                &detection(1, 100.0, 50.0 - shift, 0.0),
                200.0,
                200.0,
            );
        }
        assert_eq!(map.observation_count(), 1);
        assert_eq!(map.tag_count(), 2);
    }

    #[test]
    fn incidence_is_bidirectional() {
        let mut map = TagMap::new(unit_heights());
        observe_triangle(&mut map);

        for (slot, obs) in map.observations.iter().enumerate() {
            let handle = ObsId(slot);
            assert!(map.tags[obs.from.0].edges.contains(&handle));
            assert!(map.tags[obs.to.0].edges.contains(&handle));
            assert_eq!(
                map.tags[obs.from.0].edges.iter().filter(|&&e| e == handle).count(),
                1
            );
            assert_eq!(
                map.tags[obs.to.0].edges.iter().filter(|&&e| e == handle).count(),
                1
            );
        }
    }

    #[test]
    fn update_without_new_observations_is_a_no_op() {
        let mut map = TagMap::new(unit_heights());
        assert!(observe_vertical_pair(&mut map));
        assert!(map.update());
        let before: Vec<(u32, f64, f64, f64)> = map
            .tags()
            .map(|tag| (tag.id, tag.x, tag.y, tag.twist))
            .collect();

        assert!(!map.update());
        let after: Vec<(u32, f64, f64, f64)> = map
            .tags()
            .map(|tag| (tag.id, tag.x, tag.y, tag.twist))
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn announce_fires_once_per_reached_tag() {
        let mut map = TagMap::new(unit_heights());
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = reports.clone();
        map.on_tag_update(move |report| sink.lock().unwrap().push(*report));

        observe_vertical_pair(&mut map);
        map.update();

        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].id, 1);
        assert_eq!(reports[1].id, 2);
        assert_abs_diff_eq!(reports[1].y, 100.0, epsilon = 1e-9);
        assert_abs_diff_eq!(reports[1].z, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(reports[1].dx, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn propagation_through_to_side_parent() {
        let mut map = TagMap::new(unit_heights());
        // Frame A: tags 1 and 3, 30 pixels apart along x.
        map.observe_pair(
            &detection(1, 100.0, 100.0, 0.0),
            &detection(3, 130.0, 100.0, 0.0),
            200.0,
            200.0,
        );
        // Frame B: tags 2 and 3; tag 3 is the higher id, so the placed
        // parent sits on the canonical `to` side of this edge.
        map.observe_pair(
            &detection(2, 100.0, 140.0, 0.0),
            &detection(3, 100.0, 100.0, 0.0),
            200.0,
            200.0,
        );
        assert!(map.update());

        let anchor = map.tag(3).unwrap();
        assert_abs_diff_eq!(anchor.x, 30.0, epsilon = 1e-9);
        assert_abs_diff_eq!(anchor.y, 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(anchor.twist, PI, epsilon = 1e-9);

        let leaf = map.tag(2).unwrap();
        assert_eq!(leaf.hop_count(), 2);
        assert_abs_diff_eq!(leaf.x, 30.0, epsilon = 1e-9);
        assert_abs_diff_eq!(leaf.y, 40.0, epsilon = 1e-9);
        assert_abs_diff_eq!(leaf.twist, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn unreachable_component_keeps_stale_pose() {
        let mut map = TagMap::new(unit_heights());
        observe_vertical_pair(&mut map);
        // A second, disconnected pair.
        map.observe_pair(
            &detection(5, 100.0, 90.0, 0.0),
            &detection(6, 100.0, 110.0, 0.0),
            200.0,
            200.0,
        );

        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = reports.clone();
        map.on_tag_update(move |report| sink.lock().unwrap().push(report.id));
        assert!(map.update());

        // Only the origin's component is reached.
        assert_eq!(&*reports.lock().unwrap(), &[1, 2]);
        let stray = map.tag(5).unwrap();
        assert_eq!(stray.x, 0.0);
        assert_eq!(stray.y, 0.0);
        assert!(!map.observation(5, 6).unwrap().in_tree);
    }

    #[test]
    fn all_stored_twists_are_normalized() {
        let mut map = TagMap::new(unit_heights());
        map.observe_pair(
            &detection(1, 60.0, 40.0, 3.0),
            &detection(2, 150.0, 170.0, -3.0),
            200.0,
            200.0,
        );
        map.observe_pair(
            &detection(2, 150.0, 170.0, -3.0),
            &detection(3, 30.0, 120.0, 2.9),
            200.0,
            200.0,
        );
        map.update();

        for obs in map.observations() {
            assert!(obs.from_twist > -PI && obs.from_twist <= PI);
            assert!(obs.to_twist > -PI && obs.to_twist <= PI);
        }
        for tag in map.tags() {
            assert!(tag.twist > -PI && tag.twist <= PI);
        }
    }

    #[test]
    fn sort_orders_tags_and_observations() {
        let mut map = TagMap::new(unit_heights());
        // Ingest in an order that interleaves ids.
        map.observe_pair(
            &detection(7, 100.0, 60.0, 0.0),
            &detection(3, 100.0, 140.0, 0.0),
            200.0,
            200.0,
        );
        map.observe_pair(
            &detection(3, 100.0, 140.0, 0.0),
            &detection(1, 60.0, 100.0, 0.0),
            200.0,
            200.0,
        );
        map.update();
        map.sort();

        let ids: Vec<u32> = map.tags().map(|tag| tag.id).collect();
        assert_eq!(ids, vec![1, 3, 7]);
        let pairs: Vec<(u32, u32)> = map
            .observations()
            .map(|obs| {
                let (from, to) = map.endpoints(obs);
                (from.id, to.id)
            })
            .collect();
        assert_eq!(pairs, vec![(1, 3), (3, 7)]);

        // Remapped slots still resolve.
        assert!(map.observation(7, 3).is_some());
        assert_eq!(map.tag(7).unwrap().edge_count(), 1);
        assert_eq!(map.tag(3).unwrap().edge_count(), 2);
    }

    #[test]
    fn compare_orders_by_structure_then_fields() {
        let mut small = TagMap::new(unit_heights());
        observe_vertical_pair(&mut small);
        let mut large = TagMap::new(unit_heights());
        observe_triangle(&mut large);

        assert_eq!(small.compare(&large), Ordering::Less);
        assert_eq!(large.compare(&small), Ordering::Greater);

        let mut twin = TagMap::new(unit_heights());
        observe_vertical_pair(&mut twin);
        assert_eq!(small.compare(&twin), Ordering::Equal);

        small.update();
        // Updated poses differ from the twin's unpropagated ones.
        assert_ne!(small.compare(&twin), Ordering::Equal);
    }

    proptest! {
        #[test]
        fn normalized_angles_stay_in_range(angle in -100.0f64..100.0) {
            let normalized = normalize_angle(angle);
            prop_assert!(normalized > -PI && normalized <= PI);
        }

        #[test]
        fn ingest_invariants_hold_for_arbitrary_frames(
            frames in prop::collection::vec(
                (0u32..12, 0u32..12, 0.0f64..200.0, 0.0f64..200.0, 0.0f64..200.0, 0.0f64..200.0, -3.2f64..3.2, -3.2f64..3.2),
                1..40,
            )
        ) {
            let mut map = TagMap::new(unit_heights());
            let mut best: std::collections::HashMap<(u32, u32), f64> = std::collections::HashMap::new();

            for (id_a, id_b, ax, ay, bx, by, twist_a, twist_b) in frames {
                if id_a == id_b {
                    continue;
                }
                let a = detection(id_a, ax, ay, twist_a);
                let b = detection(id_b, bx, by, twist_b);

                let center_distance_a = ((ax - 100.0).powi(2) + (ay - 100.0).powi(2)).sqrt();
                let center_distance_b = ((bx - 100.0).powi(2) + (by - 100.0).powi(2)).sqrt();
                let goodness = (center_distance_a - center_distance_b).abs();
                let key = (id_a.min(id_b), id_a.max(id_b));
                let entry = best.entry(key).or_insert(f64::MAX);
                *entry = entry.min(goodness);

                map.observe_pair(&a, &b, 200.0, 200.0);
            }

            // One observation per distinct unordered pair.
            prop_assert_eq!(map.observation_count(), best.len());

            for obs in map.observations() {
                let (from, to) = map.endpoints(obs);
                // Canonical ordering.
                prop_assert!(from.id < to.id);
                // The stored goodness is the best ever offered for the pair.
                let expected = best[&(from.id, to.id)];
                prop_assert!((obs.goodness - expected).abs() < 1e-9);
                // Twists normalized.
                prop_assert!(obs.from_twist > -PI && obs.from_twist <= PI);
                prop_assert!(obs.to_twist > -PI && obs.to_twist <= PI);
            }
        }
    }
}
