//! Spatial frames agents live in.
//!
//! Every population owns a [`Topology`]. Continuous and composite topologies share the
//! spatial index of the simulation-wide [`RootTopology`]; amorphous topologies have no
//! geometry beyond the union of what was placed in them.

use habitat_index::{AgentHandle, Envelope, IndexConfig, IndexError, Point, SpatialIndex};
use ordered_float::OrderedFloat;
use rand::{Rng, RngCore};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tracing::{debug, info};

/// Failure of a topology operation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TopologyError {
    /// The topology was disposed; every later operation fails with this.
    #[error("topology has been disposed")]
    Disposed,
    /// A shape or location with NaN/infinite coordinates or inverted corners.
    #[error("invalid geometry: {0:?}")]
    InvalidGeometry(Envelope),
    #[error("invalid topology configuration: {0}")]
    InvalidConfig(&'static str),
    /// A composite topology only accepts agents inside exactly one of its places.
    #[error("location {0:?} is not inside exactly one place")]
    InvalidPlacement(Point),
    #[error("only root topologies can be merged")]
    MergeRequiresRoots,
    #[error("{0} topology cannot change its environment")]
    FixedEnvironment(&'static str),
}

impl TopologyError {
    /// Structural errors abort a cycle; the rest are per-agent.
    #[must_use]
    pub const fn is_structural(&self) -> bool {
        matches!(self, Self::Disposed | Self::MergeRequiresRoots)
    }
}

impl From<IndexError> for TopologyError {
    fn from(error: IndexError) -> Self {
        match error {
            IndexError::InvalidConfig(reason) => Self::InvalidConfig(reason),
            IndexError::InvalidGeometry(envelope) => Self::InvalidGeometry(envelope),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyKind {
    Root,
    Continuous,
    Amorphous,
    Composite,
}

impl TopologyKind {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Root => "root",
            Self::Continuous => "continuous",
            Self::Amorphous => "amorphous",
            Self::Composite => "composite",
        }
    }
}

fn read<T: Copy>(lock: &RwLock<T>) -> T {
    *lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn store<T>(lock: &RwLock<T>, value: T) {
    *lock.write().unwrap_or_else(PoisonError::into_inner) = value;
}

fn check_disposed(flag: &AtomicBool) -> Result<(), TopologyError> {
    if flag.load(Ordering::Acquire) {
        Err(TopologyError::Disposed)
    } else {
        Ok(())
    }
}

fn checked_point(point: Point) -> Result<Point, TopologyError> {
    if point.is_finite() {
        Ok(point)
    } else {
        Err(TopologyError::InvalidGeometry(Envelope::from_point(point)))
    }
}

/// Heading in degrees, normalized to `[0, 360)`.
fn heading_degrees(dx: f64, dy: f64) -> f64 {
    let degrees = dy.atan2(dx).to_degrees().rem_euclid(360.0);
    // rem_euclid can round up to exactly 360 for tiny negative angles.
    if degrees >= 360.0 { 0.0 } else { degrees }
}

fn uniform_in(rng: &mut dyn RngCore, bounds: &Envelope) -> Point {
    Point::new(
        bounds.min_x + rng.random::<f64>() * bounds.width(),
        bounds.min_y + rng.random::<f64>() * bounds.height(),
    )
}

/// Geometry shared by the topology variants: the environment and the wrapping rule.
#[derive(Debug, Clone, Copy)]
struct Frame {
    environment: Envelope,
    torus: bool,
}

impl Frame {
    /// Shortest signed offset from `a` to `b` along one axis.
    fn offset(delta: f64, period: f64, torus: bool) -> f64 {
        if !torus || period <= 0.0 {
            return delta;
        }
        let wrapped = delta.rem_euclid(period);
        if wrapped > period / 2.0 {
            wrapped - period
        } else {
            wrapped
        }
    }

    fn delta(&self, from: &Point, to: &Point) -> (f64, f64) {
        (
            Self::offset(to.x - from.x, self.environment.width(), self.torus),
            Self::offset(to.y - from.y, self.environment.height(), self.torus),
        )
    }

    fn distance(&self, from: &Point, to: &Point) -> f64 {
        let (dx, dy) = self.delta(from, to);
        dx.hypot(dy)
    }

    /// The eight neighboring copies of the environment plus the identity.
    fn translations(&self) -> Vec<(f64, f64)> {
        if !self.torus {
            return vec![(0.0, 0.0)];
        }
        let (w, h) = (self.environment.width(), self.environment.height());
        let mut out = Vec::with_capacity(9);
        for dy in [0.0, -h, h] {
            for dx in [0.0, -w, w] {
                out.push((dx, dy));
            }
        }
        out
    }

    fn shape_distance(&self, a: &Envelope, b: &Envelope) -> f64 {
        self.translations()
            .into_iter()
            .map(|(dx, dy)| a.distance_to(&b.translate(dx, dy)))
            .fold(f64::INFINITY, f64::min)
    }

    fn wrap(value: f64, min: f64, period: f64) -> f64 {
        if period <= 0.0 {
            return min;
        }
        let wrapped = min + (value - min).rem_euclid(period);
        if wrapped >= min + period { min } else { wrapped }
    }

    fn normalize(&self, point: Point) -> Point {
        if !self.torus {
            return point;
        }
        let env = &self.environment;
        Point::new(
            Self::wrap(point.x, env.min_x, env.width()),
            Self::wrap(point.y, env.min_y, env.height()),
        )
    }
}

/// Simulation-wide topology owning the shared spatial index.
#[derive(Debug)]
pub struct RootTopology {
    environment: RwLock<Envelope>,
    torus: bool,
    index: SpatialIndex,
    disposed: AtomicBool,
}

impl RootTopology {
    pub fn new(environment: Envelope, torus: bool, config: IndexConfig) -> Result<Self, TopologyError> {
        let environment = environment.validated()?;
        let index = SpatialIndex::new(environment, config)?;
        Ok(Self {
            environment: RwLock::new(environment),
            torus,
            index,
            disposed: AtomicBool::new(false),
        })
    }

    pub fn environment(&self) -> Result<Envelope, TopologyError> {
        self.check()?;
        Ok(read(&self.environment))
    }

    #[must_use]
    pub const fn is_torus(&self) -> bool {
        self.torus
    }

    pub fn index(&self) -> Result<&SpatialIndex, TopologyError> {
        self.check()?;
        Ok(&self.index)
    }

    /// Resize the world and re-lay the index grid over the new bounds.
    pub fn update_environment(&self, bounds: Envelope) -> Result<(), TopologyError> {
        self.check()?;
        let bounds = bounds.validated()?;
        self.index.rebuild(bounds)?;
        store(&self.environment, bounds);
        info!(?bounds, "root environment updated");
        Ok(())
    }

    /// Move every agent indexed by `other` into this root, then dispose `other`.
    ///
    /// Returns the number of index entries moved.
    pub fn merge_with<R>(&self, other: &RootTopology, rekey: R) -> Result<usize, TopologyError>
    where
        R: Fn(AgentHandle) -> AgentHandle,
    {
        self.check()?;
        other.check()?;
        if std::ptr::eq(self, other) {
            return Ok(0);
        }
        let moved = self.index.merge(&other.index, rekey);
        other.dispose();
        info!(moved, "merged root topologies");
        Ok(moved)
    }

    pub fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            self.index.clear();
            debug!("root topology disposed");
        }
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn check(&self) -> Result<(), TopologyError> {
        check_disposed(&self.disposed)
    }

    fn frame(&self) -> Frame {
        Frame {
            environment: read(&self.environment),
            torus: self.torus,
        }
    }
}

/// Plane, optionally bounded and optionally wrapping, backed by the root index.
#[derive(Debug)]
pub struct ContinuousTopology {
    environment: RwLock<Envelope>,
    bounded: bool,
    torus: bool,
    root: Arc<RootTopology>,
    disposed: AtomicBool,
}

impl ContinuousTopology {
    /// Bounded plane; `torus` wraps locations and distances around its edges.
    pub fn bounded(
        environment: Envelope,
        torus: bool,
        root: Arc<RootTopology>,
    ) -> Result<Self, TopologyError> {
        let environment = environment.validated()?;
        if torus && (environment.width() <= 0.0 || environment.height() <= 0.0) {
            return Err(TopologyError::InvalidConfig(
                "a torus needs positive width and height",
            ));
        }
        Ok(Self {
            environment: RwLock::new(environment),
            bounded: true,
            torus,
            root,
            disposed: AtomicBool::new(false),
        })
    }

    /// Unbounded plane; every finite location is valid.
    pub fn unbounded(root: Arc<RootTopology>) -> Result<Self, TopologyError> {
        let environment = root.environment()?;
        Ok(Self {
            environment: RwLock::new(environment),
            bounded: false,
            torus: false,
            root,
            disposed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub const fn is_bounded(&self) -> bool {
        self.bounded
    }

    fn frame(&self) -> Frame {
        Frame {
            environment: read(&self.environment),
            torus: self.torus,
        }
    }
}

/// Non-spatial topology: distances are meaningless and agents have no neighbors.
///
/// The environment only ever grows to cover the shapes placed in it.
#[derive(Debug)]
pub struct AmorphousTopology {
    environment: RwLock<Envelope>,
    disposed: AtomicBool,
}

impl Default for AmorphousTopology {
    fn default() -> Self {
        Self::new()
    }
}

impl AmorphousTopology {
    #[must_use]
    pub fn new() -> Self {
        Self {
            environment: RwLock::new(Envelope::from_point(Point::new(0.0, 0.0))),
            disposed: AtomicBool::new(false),
        }
    }

    fn expand(&self, shape: &Envelope) {
        let mut environment = self
            .environment
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *environment = environment.union(shape);
    }
}

/// Set of disjoint places sharing the root index.
#[derive(Debug)]
pub struct CompositeTopology {
    places: Vec<Envelope>,
    environment: Envelope,
    root: Arc<RootTopology>,
    disposed: AtomicBool,
}

impl CompositeTopology {
    pub fn new(places: Vec<Envelope>, root: Arc<RootTopology>) -> Result<Self, TopologyError> {
        let Some(first) = places.first() else {
            return Err(TopologyError::InvalidConfig(
                "a composite topology needs at least one place",
            ));
        };
        let mut environment = first.validated()?;
        for (i, place) in places.iter().enumerate() {
            place.validated()?;
            environment = environment.union(place);
            let overlaps = places[..i].iter().any(|other| {
                other
                    .intersection(place)
                    .is_some_and(|shared| shared.width() > 0.0 && shared.height() > 0.0)
            });
            if overlaps {
                return Err(TopologyError::InvalidConfig("composite places must not overlap"));
            }
        }
        Ok(Self {
            places,
            environment,
            root,
            disposed: AtomicBool::new(false),
        })
    }

    /// Index of the single place that covers all of `shape`.
    fn place_of(&self, shape: &Envelope) -> Result<usize, TopologyError> {
        let mut covering = self
            .places
            .iter()
            .enumerate()
            .filter(|(_, place)| place.covers(shape))
            .map(|(i, _)| i);
        match (covering.next(), covering.next()) {
            (Some(i), None) => Ok(i),
            _ => Err(TopologyError::InvalidPlacement(shape.center())),
        }
    }

    fn frame(&self) -> Frame {
        Frame {
            environment: self.environment,
            torus: false,
        }
    }
}

/// The spatial frame of a population.
#[derive(Debug)]
pub enum Topology {
    Root(Arc<RootTopology>),
    Continuous(ContinuousTopology),
    Amorphous(AmorphousTopology),
    Composite(CompositeTopology),
}

impl Topology {
    #[must_use]
    pub const fn kind(&self) -> TopologyKind {
        match self {
            Self::Root(_) => TopologyKind::Root,
            Self::Continuous(_) => TopologyKind::Continuous,
            Self::Amorphous(_) => TopologyKind::Amorphous,
            Self::Composite(_) => TopologyKind::Composite,
        }
    }

    #[must_use]
    pub fn is_torus(&self) -> bool {
        match self {
            Self::Root(root) => root.torus,
            Self::Continuous(topology) => topology.torus,
            Self::Amorphous(_) | Self::Composite(_) => false,
        }
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        match self {
            Self::Root(root) => root.is_disposed(),
            Self::Continuous(topology) => {
                topology.disposed.load(Ordering::Acquire) || topology.root.is_disposed()
            }
            Self::Amorphous(topology) => topology.disposed.load(Ordering::Acquire),
            Self::Composite(topology) => {
                topology.disposed.load(Ordering::Acquire) || topology.root.is_disposed()
            }
        }
    }

    fn check(&self) -> Result<(), TopologyError> {
        if self.is_disposed() {
            Err(TopologyError::Disposed)
        } else {
            Ok(())
        }
    }

    /// Spatial index backing the topology, if it has one.
    fn index(&self) -> Option<&SpatialIndex> {
        match self {
            Self::Root(root) => Some(&root.index),
            Self::Continuous(topology) => Some(&topology.root.index),
            Self::Composite(topology) => Some(&topology.root.index),
            Self::Amorphous(_) => None,
        }
    }

    fn frame(&self) -> Frame {
        match self {
            Self::Root(root) => root.frame(),
            Self::Continuous(topology) => topology.frame(),
            Self::Composite(topology) => topology.frame(),
            Self::Amorphous(topology) => Frame {
                environment: read(&topology.environment),
                torus: false,
            },
        }
    }

    /// Point the topology directly over another root, keeping its own geometry.
    pub fn set_root(&mut self, root: Arc<RootTopology>) {
        match self {
            Self::Root(current) => *current = root,
            Self::Continuous(topology) => topology.root = root,
            Self::Composite(topology) => topology.root = root,
            Self::Amorphous(_) => {}
        }
    }

    pub fn environment(&self) -> Result<Envelope, TopologyError> {
        self.check()?;
        Ok(self.frame().environment)
    }

    pub fn width(&self) -> Result<f64, TopologyError> {
        Ok(self.environment()?.width())
    }

    pub fn height(&self) -> Result<f64, TopologyError> {
        Ok(self.environment()?.height())
    }

    /// Places making up the topology; a single place for every variant but composite.
    pub fn places(&self) -> Result<Vec<Envelope>, TopologyError> {
        self.check()?;
        Ok(match self {
            Self::Composite(topology) => topology.places.clone(),
            _ => vec![self.frame().environment],
        })
    }

    /// Distance between two locations; wraps around the edges of a torus.
    pub fn distance_between(&self, a: &Point, b: &Point) -> Result<f64, TopologyError> {
        self.check()?;
        let (a, b) = (checked_point(*a)?, checked_point(*b)?);
        Ok(self.frame().distance(&a, &b))
    }

    /// Gap between two shapes (zero when they touch or overlap).
    pub fn distance_between_shapes(&self, a: &Envelope, b: &Envelope) -> Result<f64, TopologyError> {
        self.check()?;
        let (a, b) = (a.validated()?, b.validated()?);
        Ok(self.frame().shape_distance(&a, &b))
    }

    /// Heading from `from` towards `to` in degrees, in `[0, 360)`.
    ///
    /// On a torus the heading follows the shortest wrapped path.
    pub fn direction_to(&self, from: &Point, to: &Point) -> Result<f64, TopologyError> {
        self.check()?;
        let (from, to) = (checked_point(*from)?, checked_point(*to)?);
        let (dx, dy) = self.frame().delta(&from, &to);
        Ok(heading_degrees(dx, dy))
    }

    /// Map a location into the environment. Only a torus changes locations.
    pub fn normalize_location(&self, point: Point) -> Result<Point, TopologyError> {
        self.check()?;
        Ok(self.frame().normalize(checked_point(point)?))
    }

    /// Whether `point` is a location agents of this topology may occupy.
    pub fn is_valid_location(&self, point: &Point) -> Result<bool, TopologyError> {
        self.check()?;
        if !point.is_finite() {
            return Ok(false);
        }
        Ok(match self {
            Self::Root(root) => root.torus || root.frame().environment.contains_point(point),
            Self::Continuous(topology) => {
                !topology.bounded || topology.torus || topology.frame().environment.contains_point(point)
            }
            Self::Composite(topology) => topology.place_of(&Envelope::from_point(*point)).is_ok(),
            Self::Amorphous(_) => true,
        })
    }

    /// Location reached by travelling `distance` along `heading` degrees from `source`.
    ///
    /// Torus topologies wrap the result. Otherwise, when the destination is not a valid
    /// location, returns `None` if `none_if_outside` is set and the raw point if not.
    pub fn destination(
        &self,
        source: &Point,
        heading: f64,
        distance: f64,
        none_if_outside: bool,
    ) -> Result<Option<Point>, TopologyError> {
        self.check()?;
        let source = checked_point(*source)?;
        let radians = heading.to_radians();
        let target = checked_point(source.translate(radians.cos() * distance, radians.sin() * distance))?;
        let frame = self.frame();
        if frame.torus {
            return Ok(Some(frame.normalize(target)));
        }
        if none_if_outside && !self.is_valid_location(&target)? {
            return Ok(None);
        }
        Ok(Some(target))
    }

    /// Uniformly random valid location.
    pub fn random_location(&self, rng: &mut dyn RngCore) -> Result<Point, TopologyError> {
        self.check()?;
        Ok(match self {
            Self::Composite(topology) => {
                let place = topology.places[rng.random_range(0..topology.places.len())];
                uniform_in(rng, &place)
            }
            _ => uniform_in(rng, &self.frame().environment),
        })
    }

    /// Random shape of half size `half_extent` that [`Topology::place_agent`] accepts.
    ///
    /// Composite shapes are drawn inside a single place; a place too small for the shape
    /// is an [`TopologyError::InvalidPlacement`].
    pub fn random_shape(&self, rng: &mut dyn RngCore, half_extent: f64) -> Result<Envelope, TopologyError> {
        let Self::Composite(topology) = self else {
            return Ok(Envelope::around(self.random_location(rng)?, half_extent));
        };
        self.check()?;
        let half = half_extent.abs();
        let place = topology.places[rng.random_range(0..topology.places.len())];
        if place.width() < 2.0 * half || place.height() < 2.0 * half {
            return Err(TopologyError::InvalidPlacement(place.center()));
        }
        let inner = Envelope {
            min_x: place.min_x + half,
            min_y: place.min_y + half,
            max_x: place.max_x - half,
            max_y: place.max_y - half,
        };
        Ok(Envelope::around(uniform_in(rng, &inner), half))
    }

    /// Agents whose shapes lie within `max_distance` of `source`, ordered by handle.
    ///
    /// Amorphous topologies have no neighbors. On a torus the search also covers the
    /// wrapped copies of the environment.
    pub fn neighbors_of<F>(
        &self,
        source: &Envelope,
        max_distance: f64,
        filter: F,
    ) -> Result<Vec<AgentHandle>, TopologyError>
    where
        F: Fn(AgentHandle, &Envelope) -> bool,
    {
        self.check()?;
        let source = source.validated()?;
        if max_distance.is_nan() {
            return Err(TopologyError::InvalidGeometry(source));
        }
        let Some(index) = self.index() else {
            return Ok(Vec::new());
        };
        let frame = self.frame();
        let radius = max_distance.max(0.0);
        let mut found = BTreeSet::new();
        for (dx, dy) in frame.translations() {
            let shifted = source.translate(dx, dy);
            for (handle, envelope) in index.query_range(&shifted.expand_by(radius), &filter)? {
                if envelope.distance_to(&shifted) <= radius {
                    found.insert(handle);
                }
            }
        }
        Ok(found.into_iter().collect())
    }

    /// Up to `k` agents closest to `source`, nearest first, ties broken by handle.
    pub fn closest_to<F>(
        &self,
        source: &Envelope,
        k: usize,
        filter: F,
    ) -> Result<Vec<AgentHandle>, TopologyError>
    where
        F: Fn(AgentHandle, &Envelope) -> bool,
    {
        self.check()?;
        let source = source.validated()?;
        let Some(index) = self.index() else {
            return Ok(Vec::new());
        };
        let frame = self.frame();
        let center = source.center();
        let mut best: BTreeMap<AgentHandle, f64> = BTreeMap::new();
        for (dx, dy) in frame.translations() {
            let shifted = center.translate(dx, dy);
            for (handle, envelope) in index.nearest(&shifted, k, &filter)? {
                let distance = envelope.distance_to_point(&shifted);
                best.entry(handle)
                    .and_modify(|d| *d = d.min(distance))
                    .or_insert(distance);
            }
        }
        let mut ranked: Vec<(AgentHandle, f64)> = best.into_iter().collect();
        ranked.sort_by_key(|(handle, distance)| (OrderedFloat(*distance), *handle));
        Ok(ranked.into_iter().take(k).map(|(handle, _)| handle).collect())
    }

    /// Agent farthest from `source`; ties go to the lowest handle.
    pub fn farthest_from<F>(
        &self,
        source: &Envelope,
        filter: F,
    ) -> Result<Option<AgentHandle>, TopologyError>
    where
        F: Fn(AgentHandle, &Envelope) -> bool,
    {
        self.check()?;
        let source = source.validated()?;
        let Some(index) = self.index() else {
            return Ok(None);
        };
        let frame = self.frame();
        Ok(index
            .entries()
            .into_iter()
            .filter(|(handle, envelope)| filter(*handle, envelope))
            .map(|(handle, envelope)| (frame.shape_distance(&source, &envelope), handle))
            .max_by(|(da, ha), (db, hb)| {
                OrderedFloat(*da).cmp(&OrderedFloat(*db)).then_with(|| hb.cmp(ha))
            })
            .map(|(_, handle)| handle))
    }

    /// Agents whose shapes intersect `region`, ordered by handle.
    pub fn agents_in<F>(&self, region: &Envelope, filter: F) -> Result<Vec<AgentHandle>, TopologyError>
    where
        F: Fn(AgentHandle, &Envelope) -> bool,
    {
        self.check()?;
        let region = region.validated()?;
        let Some(index) = self.index() else {
            return Ok(Vec::new());
        };
        let frame = self.frame();
        let mut found = BTreeSet::new();
        for (dx, dy) in frame.translations() {
            for (handle, _) in index.query_range(&region.translate(dx, dy), &filter)? {
                found.insert(handle);
            }
        }
        Ok(found.into_iter().collect())
    }

    /// Register a newly created agent's shape.
    pub fn place_agent(&self, handle: AgentHandle, shape: Envelope) -> Result<(), TopologyError> {
        let shape = self.admit(&shape)?;
        match self {
            Self::Amorphous(topology) => {
                topology.expand(&shape);
                Ok(())
            }
            Self::Composite(topology) => Ok(topology.root.index.insert(handle, shape)?),
            Self::Root(root) => Ok(root.index.insert(handle, shape)?),
            Self::Continuous(topology) => Ok(topology.root.index.insert(handle, shape)?),
        }
    }

    /// Check that an agent may take `shape` without registering anything.
    pub fn admit(&self, shape: &Envelope) -> Result<Envelope, TopologyError> {
        self.check()?;
        let shape = shape.validated()?;
        if let Self::Composite(topology) = self {
            topology.place_of(&shape)?;
        }
        Ok(shape)
    }

    /// Record that an agent's shape changed from `previous` to `shape`.
    pub fn update_agent(
        &self,
        handle: AgentHandle,
        previous: Option<&Envelope>,
        shape: Envelope,
    ) -> Result<(), TopologyError> {
        let shape = self.admit(&shape)?;
        match (self, self.index()) {
            (Self::Amorphous(topology), _) => {
                topology.expand(&shape);
                Ok(())
            }
            (_, Some(index)) => Ok(index.update(handle, previous, shape)?),
            (_, None) => Ok(()),
        }
    }

    /// Forget an agent. Unknown handles are ignored.
    pub fn remove_agent(&self, handle: AgentHandle, last: Option<&Envelope>) -> Result<(), TopologyError> {
        self.check()?;
        if let Some(index) = self.index() {
            index.remove(handle, last);
        }
        Ok(())
    }

    /// Change the environment bounds.
    ///
    /// Amorphous topologies only grow; composite topologies are fixed by their places.
    pub fn update_environment(&self, bounds: Envelope) -> Result<(), TopologyError> {
        self.check()?;
        let bounds = bounds.validated()?;
        match self {
            Self::Root(root) => root.update_environment(bounds),
            Self::Continuous(topology) => {
                if topology.torus && (bounds.width() <= 0.0 || bounds.height() <= 0.0) {
                    return Err(TopologyError::InvalidConfig(
                        "a torus needs positive width and height",
                    ));
                }
                store(&topology.environment, bounds);
                Ok(())
            }
            Self::Amorphous(topology) => {
                topology.expand(&bounds);
                Ok(())
            }
            Self::Composite(_) => Err(TopologyError::FixedEnvironment(self.kind().name())),
        }
    }

    /// Absorb `other`'s agents into this topology's index, disposing `other`.
    pub fn merge_with<R>(&self, other: &Topology, rekey: R) -> Result<usize, TopologyError>
    where
        R: Fn(AgentHandle) -> AgentHandle,
    {
        self.check()?;
        other.check()?;
        match (self, other) {
            (Self::Root(root), Self::Root(other)) => root.merge_with(other, rekey),
            _ => Err(TopologyError::MergeRequiresRoots),
        }
    }

    /// Release the topology. A root also drops its index contents.
    pub fn dispose(&self) {
        match self {
            Self::Root(root) => root.dispose(),
            Self::Continuous(topology) => topology.disposed.store(true, Ordering::Release),
            Self::Amorphous(topology) => topology.disposed.store(true, Ordering::Release),
            Self::Composite(topology) => topology.disposed.store(true, Ordering::Release),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use habitat_index::{AgentKey, PopulationId};
    use proptest::prelude::*;
    use rand::{SeedableRng, rngs::SmallRng};
    use slotmap::SlotMap;

    fn root(torus: bool) -> Arc<RootTopology> {
        Arc::new(
            RootTopology::new(
                Envelope::new(0.0, 0.0, 100.0, 100.0),
                torus,
                IndexConfig::default(),
            )
            .expect("root"),
        )
    }

    fn handles(count: usize) -> Vec<AgentHandle> {
        let mut slots: SlotMap<AgentKey, ()> = SlotMap::with_key();
        (0..count)
            .map(|_| AgentHandle::new(PopulationId(0), slots.insert(())))
            .collect()
    }

    #[test]
    fn amorphous_environment_grows_from_origin() {
        let topology = Topology::Amorphous(AmorphousTopology::new());
        let id = handles(1)[0];
        topology
            .place_agent(id, Envelope::around(Point::new(3.0, 3.0), 1.0))
            .expect("place");
        assert_eq!(
            topology.environment().expect("env"),
            Envelope::new(0.0, 0.0, 4.0, 4.0)
        );
        assert_eq!(topology.width(), Ok(4.0));
        assert_eq!(topology.height(), Ok(4.0));
        assert!(
            topology
                .neighbors_of(&Envelope::from_point(Point::new(3.0, 3.0)), 100.0, |_, _| true)
                .expect("neighbors")
                .is_empty()
        );
        topology
            .update_environment(Envelope::new(1.0, 1.0, 2.0, 2.0))
            .expect("grow only");
        assert_eq!(
            topology.environment().expect("env"),
            Envelope::new(0.0, 0.0, 4.0, 4.0)
        );
        topology.dispose();
        assert_eq!(
            topology.distance_between(&Point::new(0.0, 0.0), &Point::new(1.0, 1.0)),
            Err(TopologyError::Disposed)
        );
    }

    #[test]
    fn torus_distance_and_direction_wrap() {
        let topology = Topology::Root(root(true));
        let a = Point::new(5.0, 50.0);
        let b = Point::new(95.0, 50.0);
        let distance = topology.distance_between(&a, &b).expect("distance");
        assert!((distance - 10.0).abs() < 1e-9);
        let heading = topology.direction_to(&a, &b).expect("heading");
        assert!((heading - 180.0).abs() < 1e-9);
        let plane = Topology::Root(root(false));
        assert!((plane.distance_between(&a, &b).expect("distance") - 90.0).abs() < 1e-9);
        assert!(plane.direction_to(&a, &b).expect("heading").abs() < 1e-9);
    }

    #[test]
    fn direction_is_normalized() {
        let topology = Topology::Root(root(false));
        let origin = Point::new(50.0, 50.0);
        let down = topology
            .direction_to(&origin, &Point::new(50.0, 40.0))
            .expect("heading");
        assert!((down - 270.0).abs() < 1e-9);
        let same = topology.direction_to(&origin, &origin).expect("heading");
        assert!((0.0..360.0).contains(&same));
    }

    #[test]
    fn torus_neighbors_cross_edges() {
        let root = root(true);
        let topology = Topology::Root(root.clone());
        let ids = handles(3);
        topology
            .place_agent(ids[0], Envelope::around(Point::new(1.0, 50.0), 0.5))
            .expect("place");
        topology
            .place_agent(ids[1], Envelope::around(Point::new(99.0, 50.0), 0.5))
            .expect("place");
        topology
            .place_agent(ids[2], Envelope::around(Point::new(50.0, 50.0), 0.5))
            .expect("place");
        let source = Envelope::around(Point::new(1.0, 50.0), 0.5);
        let me = ids[0];
        let found = topology
            .neighbors_of(&source, 3.0, |h, _| h != me)
            .expect("neighbors");
        assert_eq!(found, vec![ids[1]]);
        // Every wrapped copy matches at this radius; each agent is still listed once.
        let everyone = topology
            .neighbors_of(&source, 200.0, |_, _| true)
            .expect("neighbors");
        assert_eq!(everyone, ids);
        let covered = topology
            .agents_in(&Envelope::new(-10.0, -10.0, 110.0, 110.0), |_, _| true)
            .expect("agents");
        assert_eq!(covered, ids);
        let closest = topology.closest_to(&source, 1, |h, _| h != me).expect("closest");
        assert_eq!(closest, vec![ids[1]]);
        let farthest = topology.farthest_from(&source, |h, _| h != me).expect("farthest");
        assert_eq!(farthest, Some(ids[2]));
    }

    #[test]
    fn normalize_and_destination() {
        let torus = Topology::Root(root(true));
        assert_eq!(
            torus.normalize_location(Point::new(-5.0, 205.0)).expect("normalize"),
            Point::new(95.0, 5.0)
        );
        let wrapped = torus
            .destination(&Point::new(95.0, 50.0), 0.0, 10.0, true)
            .expect("destination")
            .expect("torus never leaves");
        assert!((wrapped.x - 5.0).abs() < 1e-9);

        let plane = Topology::Root(root(false));
        assert_eq!(
            plane.normalize_location(Point::new(-5.0, 5.0)).expect("normalize"),
            Point::new(-5.0, 5.0)
        );
        assert_eq!(
            plane
                .destination(&Point::new(95.0, 50.0), 0.0, 10.0, true)
                .expect("destination"),
            None
        );
        assert!(
            plane
                .destination(&Point::new(95.0, 50.0), 0.0, 10.0, false)
                .expect("destination")
                .is_some()
        );
        assert!(matches!(
            plane.normalize_location(Point::new(f64::NAN, 0.0)),
            Err(TopologyError::InvalidGeometry(_))
        ));
    }

    #[test]
    fn composite_places_reject_outside_agents() {
        let root = root(false);
        let topology = Topology::Composite(
            CompositeTopology::new(
                vec![
                    Envelope::new(0.0, 0.0, 10.0, 10.0),
                    Envelope::new(20.0, 0.0, 30.0, 10.0),
                ],
                root.clone(),
            )
            .expect("composite"),
        );
        let ids = handles(2);
        topology
            .place_agent(ids[0], Envelope::around(Point::new(25.0, 5.0), 1.0))
            .expect("inside a place");
        assert_eq!(
            topology.place_agent(ids[1], Envelope::around(Point::new(15.0, 5.0), 1.0)),
            Err(TopologyError::InvalidPlacement(Point::new(15.0, 5.0)))
        );
        assert!(root.index().expect("index").contains(ids[0]));
        assert!(!root.index().expect("index").contains(ids[1]));
        assert_eq!(topology.places().expect("places").len(), 2);
        assert!(matches!(
            topology.update_environment(Envelope::new(0.0, 0.0, 50.0, 50.0)),
            Err(TopologyError::FixedEnvironment(_))
        ));

        let mut rng = SmallRng::seed_from_u64(3);
        for _ in 0..32 {
            let location = topology.random_location(&mut rng).expect("location");
            assert!(topology.is_valid_location(&location).expect("valid"));
        }

        assert!(
            CompositeTopology::new(
                vec![
                    Envelope::new(0.0, 0.0, 10.0, 10.0),
                    Envelope::new(5.0, 5.0, 15.0, 15.0),
                ],
                root,
            )
            .is_err()
        );
    }

    #[test]
    fn composite_shapes_must_fit_one_place() {
        let root = root(false);
        let topology = Topology::Composite(
            CompositeTopology::new(
                vec![
                    Envelope::new(0.0, 0.0, 10.0, 10.0),
                    Envelope::new(10.0, 0.0, 20.0, 10.0),
                ],
                root.clone(),
            )
            .expect("composite"),
        );
        let ids = handles(3);
        assert_eq!(
            topology.place_agent(ids[0], Envelope::around(Point::new(9.0, 5.0), 3.0)),
            Err(TopologyError::InvalidPlacement(Point::new(9.0, 5.0)))
        );
        assert!(!root.index().expect("index").contains(ids[0]));

        let inside = Envelope::around(Point::new(5.0, 5.0), 1.0);
        topology.place_agent(ids[1], inside).expect("inside the left place");
        assert_eq!(
            topology.update_agent(ids[1], Some(&inside), Envelope::around(Point::new(10.0, 5.0), 1.0)),
            Err(TopologyError::InvalidPlacement(Point::new(10.0, 5.0)))
        );
        assert_eq!(root.index().expect("index").envelope_of(ids[1]), Some(inside));
        assert!(!topology.is_valid_location(&Point::new(10.0, 5.0)).expect("valid"));

        let mut rng = SmallRng::seed_from_u64(11);
        for _ in 0..64 {
            let shape = topology.random_shape(&mut rng, 2.0).expect("shape");
            assert!(topology.place_agent(ids[2], shape).is_ok(), "{shape:?}");
            topology.remove_agent(ids[2], Some(&shape)).expect("remove");
        }
        assert!(matches!(
            topology.random_shape(&mut rng, 6.0),
            Err(TopologyError::InvalidPlacement(_))
        ));
    }

    #[test]
    fn amorphous_random_locations_follow_the_environment() {
        let topology = Topology::Amorphous(AmorphousTopology::new());
        let mut rng = SmallRng::seed_from_u64(5);
        assert_eq!(
            topology.random_location(&mut rng).expect("location"),
            Point::new(0.0, 0.0)
        );
        topology
            .update_environment(Envelope::new(-40.0, 0.0, 0.0, 25.0))
            .expect("grow");
        let environment = topology.environment().expect("environment");
        assert_eq!(environment, Envelope::new(-40.0, 0.0, 0.0, 25.0));
        let mut spread = Envelope::from_point(topology.random_location(&mut rng).expect("location"));
        for _ in 0..200 {
            let location = topology.random_location(&mut rng).expect("location");
            assert!(environment.contains_point(&location));
            spread = spread.union(&Envelope::from_point(location));
        }
        assert!(spread.width() > 20.0 && spread.height() > 12.0);
    }

    #[test]
    fn merge_moves_agents_and_disposes_other() {
        let left = Topology::Root(root(false));
        let right = Topology::Root(root(false));
        let ids = handles(2);
        left.place_agent(ids[0], Envelope::around(Point::new(10.0, 10.0), 1.0))
            .expect("place");
        right
            .place_agent(ids[1], Envelope::around(Point::new(20.0, 20.0), 1.0))
            .expect("place");
        let moved = left.merge_with(&right, |handle| handle).expect("merge");
        assert_eq!(moved, 1);
        assert!(right.is_disposed());
        assert_eq!(
            right.distance_between(&Point::new(0.0, 0.0), &Point::new(1.0, 0.0)),
            Err(TopologyError::Disposed)
        );
        let everyone = left
            .agents_in(&Envelope::new(0.0, 0.0, 100.0, 100.0), |_, _| true)
            .expect("query");
        assert_eq!(everyone.len(), 2);

        let amorphous = Topology::Amorphous(AmorphousTopology::new());
        assert_eq!(
            left.merge_with(&amorphous, |handle| handle),
            Err(TopologyError::MergeRequiresRoots)
        );
    }

    #[test]
    fn continuous_topology_follows_root_disposal() {
        let root = root(false);
        let topology = Topology::Continuous(
            ContinuousTopology::bounded(Envelope::new(0.0, 0.0, 50.0, 50.0), false, root.clone())
                .expect("continuous"),
        );
        assert!(
            !topology
                .is_valid_location(&Point::new(60.0, 10.0))
                .expect("valid")
        );
        root.dispose();
        assert!(topology.is_disposed());
        assert_eq!(
            topology.environment(),
            Err(TopologyError::Disposed)
        );
    }

    #[test]
    fn resizing_root_keeps_agents_queryable() {
        let root = root(false);
        let topology = Topology::Root(root.clone());
        let ids = handles(1);
        topology
            .place_agent(ids[0], Envelope::around(Point::new(150.0, 150.0), 1.0))
            .expect("place");
        topology
            .update_environment(Envelope::new(0.0, 0.0, 200.0, 200.0))
            .expect("resize");
        assert_eq!(
            topology
                .agents_in(&Envelope::new(140.0, 140.0, 160.0, 160.0), |_, _| true)
                .expect("query"),
            ids
        );
        assert_eq!(
            topology.environment().expect("env"),
            Envelope::new(0.0, 0.0, 200.0, 200.0)
        );
    }

    proptest! {
        #[test]
        fn torus_distance_never_exceeds_plane(
            ax in -50.0..150.0_f64, ay in -50.0..150.0_f64,
            bx in -50.0..150.0_f64, by in -50.0..150.0_f64,
        ) {
            let torus = Topology::Root(root(true));
            let plane = Topology::Root(root(false));
            let (a, b) = (Point::new(ax, ay), Point::new(bx, by));
            let wrapped = torus.distance_between(&a, &b).expect("distance");
            let straight = plane.distance_between(&a, &b).expect("distance");
            prop_assert!(wrapped <= straight + 1e-9);
            prop_assert!(wrapped <= 50.0_f64.hypot(50.0) + 1e-9);

            let normalized = torus.normalize_location(a).expect("normalize");
            prop_assert!((0.0..100.0).contains(&normalized.x));
            prop_assert!((0.0..100.0).contains(&normalized.y));
            let heading = torus.direction_to(&a, &b).expect("heading");
            prop_assert!((0.0..360.0).contains(&heading));
        }
    }
}
