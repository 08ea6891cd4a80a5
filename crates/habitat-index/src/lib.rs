//! Spatial indexing abstractions for agent neighborhood queries.
//!
//! The index maps stable [`AgentHandle`]s to axis-aligned [`Envelope`]s. Entries are
//! bucketed into a uniform grid of cells by envelope center, and cells are grouped into
//! square tiles, each tile guarded by its own lock (a shard). Moves inside one region only
//! contend on that region's shard; queries lock every shard they touch at once so a
//! concurrent move is observed either before or after, never half-applied.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use slotmap::new_key_type;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tracing::{debug, info};

new_key_type! {
    /// Generational slot key of an agent inside its population.
    pub struct AgentKey;
}

/// Identifier of a population inside one simulation.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct PopulationId(pub u32);

/// Stable lightweight agent reference: population + slot + generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AgentHandle {
    pub population: PopulationId,
    pub key: AgentKey,
}

impl AgentHandle {
    #[must_use]
    pub const fn new(population: PopulationId, key: AgentKey) -> Self {
        Self { population, key }
    }
}

/// Errors emitted by the spatial index.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IndexError {
    /// Indicates configuration values that cannot be used (e.g., zero shards).
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// A NaN, infinite or inverted envelope reached the index boundary.
    #[error("invalid geometry: {0:?}")]
    InvalidGeometry(Envelope),
}

/// A 2D location in world units.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }

    #[must_use]
    pub fn distance_to(&self, other: &Point) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }

    #[must_use]
    pub fn translate(&self, dx: f64, dy: f64) -> Point {
        Point::new(self.x + dx, self.y + dy)
    }
}

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Envelope {
    /// Build an envelope from two corners given in any order.
    #[must_use]
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self {
            min_x: x1.min(x2),
            min_y: y1.min(y2),
            max_x: x1.max(x2),
            max_y: y1.max(y2),
        }
    }

    /// Zero-area envelope located at `point`.
    #[must_use]
    pub const fn from_point(point: Point) -> Self {
        Self {
            min_x: point.x,
            min_y: point.y,
            max_x: point.x,
            max_y: point.y,
        }
    }

    /// Envelope of the given half extents centered on `center`.
    #[must_use]
    pub fn centered(center: Point, half_width: f64, half_height: f64) -> Self {
        Self::new(
            center.x - half_width,
            center.y - half_height,
            center.x + half_width,
            center.y + half_height,
        )
    }

    /// Square envelope of half size `radius` around `center`.
    #[must_use]
    pub fn around(center: Point, radius: f64) -> Self {
        Self::centered(center, radius, radius)
    }

    /// Returns true when every coordinate is finite and the corners are ordered.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.min_x.is_finite()
            && self.min_y.is_finite()
            && self.max_x.is_finite()
            && self.max_y.is_finite()
            && self.min_x <= self.max_x
            && self.min_y <= self.max_y
    }

    /// Reject degenerate envelopes with [`IndexError::InvalidGeometry`].
    pub fn validated(self) -> Result<Self, IndexError> {
        if self.is_valid() {
            Ok(self)
        } else {
            Err(IndexError::InvalidGeometry(self))
        }
    }

    #[must_use]
    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    #[must_use]
    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    #[must_use]
    pub fn center(&self) -> Point {
        Point::new(
            self.min_x + self.width() * 0.5,
            self.min_y + self.height() * 0.5,
        )
    }

    #[must_use]
    pub fn min(&self) -> Point {
        Point::new(self.min_x, self.min_y)
    }

    #[must_use]
    pub fn max(&self) -> Point {
        Point::new(self.max_x, self.max_y)
    }

    /// Largest half extent over both axes.
    #[must_use]
    pub fn half_extent(&self) -> f64 {
        self.width().max(self.height()) * 0.5
    }

    #[must_use]
    pub fn intersects(&self, other: &Envelope) -> bool {
        self.min_x <= other.max_x
            && other.min_x <= self.max_x
            && self.min_y <= other.max_y
            && other.min_y <= self.max_y
    }

    /// Closed containment test.
    #[must_use]
    pub fn contains_point(&self, point: &Point) -> bool {
        point.x >= self.min_x && point.x <= self.max_x && point.y >= self.min_y && point.y <= self.max_y
    }

    /// Returns true when `other` lies entirely inside `self`.
    #[must_use]
    pub fn covers(&self, other: &Envelope) -> bool {
        other.min_x >= self.min_x
            && other.max_x <= self.max_x
            && other.min_y >= self.min_y
            && other.max_y <= self.max_y
    }

    #[must_use]
    pub fn expand_by(&self, distance: f64) -> Envelope {
        Envelope {
            min_x: self.min_x - distance,
            min_y: self.min_y - distance,
            max_x: self.max_x + distance,
            max_y: self.max_y + distance,
        }
    }

    #[must_use]
    pub fn union(&self, other: &Envelope) -> Envelope {
        Envelope {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }

    /// Overlapping part of both envelopes, if any.
    #[must_use]
    pub fn intersection(&self, other: &Envelope) -> Option<Envelope> {
        if !self.intersects(other) {
            return None;
        }
        Some(Envelope {
            min_x: self.min_x.max(other.min_x),
            min_y: self.min_y.max(other.min_y),
            max_x: self.max_x.min(other.max_x),
            max_y: self.max_y.min(other.max_y),
        })
    }

    #[must_use]
    pub fn translate(&self, dx: f64, dy: f64) -> Envelope {
        Envelope {
            min_x: self.min_x + dx,
            min_y: self.min_y + dy,
            max_x: self.max_x + dx,
            max_y: self.max_y + dy,
        }
    }

    /// Same extents, recentered on `center`.
    #[must_use]
    pub fn moved_to(&self, center: Point) -> Envelope {
        Envelope::centered(center, self.width() * 0.5, self.height() * 0.5)
    }

    /// Shortest gap between the two boxes; zero when they intersect.
    #[must_use]
    pub fn distance_to(&self, other: &Envelope) -> f64 {
        let dx = (other.min_x - self.max_x).max(self.min_x - other.max_x).max(0.0);
        let dy = (other.min_y - self.max_y).max(self.min_y - other.max_y).max(0.0);
        dx.hypot(dy)
    }

    #[must_use]
    pub fn distance_to_point(&self, point: &Point) -> f64 {
        self.distance_to(&Envelope::from_point(*point))
    }
}

impl Default for Envelope {
    fn default() -> Self {
        Self::from_point(Point::default())
    }
}

/// Sizing parameters for a [`SpatialIndex`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Number of grid cells along each axis of the bounds.
    pub cells_per_axis: u32,
    /// Requested number of lock shards; rounded down to a square tile count.
    pub shards: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            cells_per_axis: 32,
            shards: 16,
        }
    }
}

impl IndexConfig {
    /// Largest accepted grid side; keeps cell and tile arithmetic well inside `u32`.
    pub const MAX_CELLS_PER_AXIS: u32 = 4096;

    pub fn validate(&self) -> Result<(), IndexError> {
        if self.cells_per_axis == 0 {
            return Err(IndexError::InvalidConfig("cells_per_axis must be positive"));
        }
        if self.cells_per_axis > Self::MAX_CELLS_PER_AXIS {
            return Err(IndexError::InvalidConfig("cells_per_axis must be at most 4096"));
        }
        if self.shards == 0 {
            return Err(IndexError::InvalidConfig("shards must be positive"));
        }
        Ok(())
    }

    fn tiles_per_axis(&self) -> u32 {
        let side = (self.shards as f64).sqrt().floor() as u32;
        side.clamp(1, self.cells_per_axis)
    }
}

type CellCoord = (u32, u32);

/// Cell geometry; replaced only under the structural barrier.
#[derive(Debug, Clone, Copy)]
struct GridLayout {
    bounds: Envelope,
    cells: u32,
    tiles: u32,
    cell_w: f64,
    cell_h: f64,
}

impl GridLayout {
    fn new(bounds: Envelope, config: &IndexConfig) -> Self {
        let cells = config.cells_per_axis;
        let cell_w = if bounds.width() > 0.0 {
            bounds.width() / f64::from(cells)
        } else {
            1.0
        };
        let cell_h = if bounds.height() > 0.0 {
            bounds.height() / f64::from(cells)
        } else {
            1.0
        };
        Self {
            bounds,
            cells,
            tiles: config.tiles_per_axis(),
            cell_w,
            cell_h,
        }
    }

    fn shard_count(&self) -> usize {
        self.tiles as usize * self.tiles as usize
    }

    /// Tile holding cell coordinate `c` along one axis.
    fn tile_of(&self, c: u32) -> usize {
        (u64::from(c) * u64::from(self.tiles) / u64::from(self.cells)) as usize
    }

    fn axis_cell(&self, value: f64, origin: f64, size: f64) -> u32 {
        let last = f64::from(self.cells - 1);
        let raw = ((value - origin) / size).floor();
        if raw.is_nan() {
            return 0;
        }
        raw.clamp(0.0, last) as u32
    }

    fn cell_of(&self, point: &Point) -> CellCoord {
        (
            self.axis_cell(point.x, self.bounds.min_x, self.cell_w),
            self.axis_cell(point.y, self.bounds.min_y, self.cell_h),
        )
    }

    /// Inclusive cell range covering `envelope` (clamped to the grid).
    fn cell_range(&self, envelope: &Envelope) -> (CellCoord, CellCoord) {
        (self.cell_of(&envelope.min()), self.cell_of(&envelope.max()))
    }

    fn shard_of(&self, cell: CellCoord) -> usize {
        self.tile_of(cell.1) * self.tiles as usize + self.tile_of(cell.0)
    }

    fn shards_for(&self, range: (CellCoord, CellCoord)) -> SmallVec<[usize; 8]> {
        let ((x0, y0), (x1, y1)) = range;
        let (tx0, tx1) = (self.tile_of(x0), self.tile_of(x1));
        let (ty0, ty1) = (self.tile_of(y0), self.tile_of(y1));
        let mut shards = SmallVec::new();
        for ty in ty0..=ty1 {
            for tx in tx0..=tx1 {
                shards.push(ty * self.tiles as usize + tx);
            }
        }
        shards
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    envelope: Envelope,
    cell: CellCoord,
}

#[derive(Debug, Default)]
struct Shard {
    cells: HashMap<CellCoord, Vec<AgentHandle>>,
    entries: HashMap<AgentHandle, Slot>,
}

impl Shard {
    fn put(&mut self, handle: AgentHandle, envelope: Envelope, cell: CellCoord) {
        self.cells.entry(cell).or_default().push(handle);
        self.entries.insert(handle, Slot { envelope, cell });
    }

    fn take(&mut self, handle: AgentHandle) -> Option<Envelope> {
        let slot = self.entries.remove(&handle)?;
        if let Some(bucket) = self.cells.get_mut(&slot.cell) {
            if let Some(pos) = bucket.iter().position(|h| *h == handle) {
                bucket.swap_remove(pos);
            }
            if bucket.is_empty() {
                self.cells.remove(&slot.cell);
            }
        }
        Some(slot.envelope)
    }

    fn clear(&mut self) {
        self.cells.clear();
        self.entries.clear();
    }
}

/// Structural state: the grid layout plus the shards bucketed by it.
///
/// Regular operations hold `layout` shared for their whole duration; `merge`, `rebuild`
/// and `clear` hold it exclusively, which drains in-flight readers first.
#[derive(Debug)]
pub struct SpatialIndex {
    config: IndexConfig,
    layout: RwLock<GridLayout>,
    shards: RwLock<Box<[RwLock<Shard>]>>,
    max_half_extent: AtomicU64,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn new_shards(count: usize) -> Box<[RwLock<Shard>]> {
    (0..count).map(|_| RwLock::new(Shard::default())).collect()
}

impl SpatialIndex {
    /// Create an empty index covering `bounds`.
    pub fn new(bounds: Envelope, config: IndexConfig) -> Result<Self, IndexError> {
        config.validate()?;
        let bounds = bounds.validated()?;
        let layout = GridLayout::new(bounds, &config);
        let shards = new_shards(layout.shard_count());
        Ok(Self {
            config,
            layout: RwLock::new(layout),
            shards: RwLock::new(shards),
            max_half_extent: AtomicU64::new(0.0_f64.to_bits()),
        })
    }

    /// Bounds the grid is currently laid out over.
    #[must_use]
    pub fn bounds(&self) -> Envelope {
        read(&self.layout).bounds
    }

    #[must_use]
    pub fn config(&self) -> IndexConfig {
        self.config
    }

    fn note_extent(&self, envelope: &Envelope) {
        // Non-negative f64 bit patterns order the same way as the values.
        self.max_half_extent
            .fetch_max(envelope.half_extent().to_bits(), Ordering::AcqRel);
    }

    fn search_margin(&self) -> f64 {
        f64::from_bits(self.max_half_extent.load(Ordering::Acquire))
    }

    /// Insert `handle`, replacing any entry it already has.
    pub fn insert(&self, handle: AgentHandle, envelope: Envelope) -> Result<(), IndexError> {
        let envelope = envelope.validated()?;
        let layout = read(&self.layout);
        let shards = read(&self.shards);
        let owner = Self::locate(&shards, handle);
        self.note_extent(&envelope);
        Self::relocate(&layout, &shards, handle, owner, envelope);
        Ok(())
    }

    /// Remove `handle`. Unknown handles are a no-op so double teardown stays harmless.
    ///
    /// `hint` is the last envelope the caller believes is indexed; a stale hint only costs a
    /// scan of the remaining shards.
    pub fn remove(&self, handle: AgentHandle, hint: Option<&Envelope>) -> Option<Envelope> {
        let layout = read(&self.layout);
        let shards = read(&self.shards);
        if let Some(hint) = hint.filter(|h| h.is_valid()) {
            let shard = layout.shard_of(layout.cell_of(&hint.center()));
            if let Some(envelope) = write(&shards[shard]).take(handle) {
                return Some(envelope);
            }
        }
        let owner = Self::locate(&shards, handle)?;
        write(&shards[owner]).take(handle)
    }

    /// Move `handle` from `old` to `new` without a window where it is absent.
    ///
    /// When `handle` is not indexed yet it is inserted.
    pub fn update(
        &self,
        handle: AgentHandle,
        old: Option<&Envelope>,
        new: Envelope,
    ) -> Result<(), IndexError> {
        let new = new.validated()?;
        let layout = read(&self.layout);
        let shards = read(&self.shards);
        let hinted = old
            .filter(|e| e.is_valid())
            .map(|e| layout.shard_of(layout.cell_of(&e.center())))
            .filter(|&shard| read(&shards[shard]).entries.contains_key(&handle));
        let owner = hinted.or_else(|| Self::locate(&shards, handle));
        // Widen the query margin before the entry becomes visible at its new size.
        self.note_extent(&new);
        Self::relocate(&layout, &shards, handle, owner, new);
        Ok(())
    }

    fn locate(shards: &[RwLock<Shard>], handle: AgentHandle) -> Option<usize> {
        shards
            .iter()
            .position(|shard| read(shard).entries.contains_key(&handle))
    }

    /// Atomically (w.r.t. readers) move the entry from shard `owner` to its new cell.
    fn relocate(
        layout: &GridLayout,
        shards: &[RwLock<Shard>],
        handle: AgentHandle,
        owner: Option<usize>,
        envelope: Envelope,
    ) {
        let cell = layout.cell_of(&envelope.center());
        let target = layout.shard_of(cell);
        match owner {
            Some(source) if source != target => {
                // Lock in ascending shard order; queries follow the same order.
                let (low, high) = if source < target {
                    (source, target)
                } else {
                    (target, source)
                };
                let mut first = write(&shards[low]);
                let mut second = write(&shards[high]);
                let (from, to) = if source < target {
                    (&mut *first, &mut *second)
                } else {
                    (&mut *second, &mut *first)
                };
                from.take(handle);
                to.put(handle, envelope, cell);
            }
            _ => {
                let mut shard = write(&shards[target]);
                shard.take(handle);
                shard.put(handle, envelope, cell);
            }
        }
    }

    /// All entries intersecting `query` that satisfy `filter`, ordered by handle.
    ///
    /// The filter runs after every shard lock has been released.
    pub fn query_range<F>(
        &self,
        query: &Envelope,
        filter: F,
    ) -> Result<Vec<(AgentHandle, Envelope)>, IndexError>
    where
        F: Fn(AgentHandle, &Envelope) -> bool,
    {
        if query.min_x.is_nan() || query.min_y.is_nan() || query.max_x.is_nan() || query.max_y.is_nan() {
            return Err(IndexError::InvalidGeometry(*query));
        }
        let mut found = {
            let layout = read(&self.layout);
            let shards = read(&self.shards);
            let search = query.expand_by(self.search_margin());
            let range = layout.cell_range(&search);
            let mut ids = layout.shards_for(range);
            ids.sort_unstable();
            let guards: SmallVec<[RwLockReadGuard<'_, Shard>; 8]> =
                ids.iter().map(|&id| read(&shards[id])).collect();
            let mut found = Vec::new();
            for guard in &guards {
                Self::collect_in_range(guard, range, query, &mut found);
            }
            found
        };
        found.retain(|(handle, envelope)| filter(*handle, envelope));
        found.sort_unstable_by_key(|(handle, _)| *handle);
        Ok(found)
    }

    fn collect_in_range(
        shard: &Shard,
        range: (CellCoord, CellCoord),
        query: &Envelope,
        out: &mut Vec<(AgentHandle, Envelope)>,
    ) {
        let ((x0, y0), (x1, y1)) = range;
        let span = u64::from(x1 - x0 + 1) * u64::from(y1 - y0 + 1);
        let matches = |slot: &Slot| {
            slot.cell.0 >= x0
                && slot.cell.0 <= x1
                && slot.cell.1 >= y0
                && slot.cell.1 <= y1
                && slot.envelope.intersects(query)
        };
        if span as usize > shard.cells.len() {
            for (handle, slot) in &shard.entries {
                if matches(slot) {
                    out.push((*handle, slot.envelope));
                }
            }
            return;
        }
        for y in y0..=y1 {
            for x in x0..=x1 {
                let Some(bucket) = shard.cells.get(&(x, y)) else {
                    continue;
                };
                for handle in bucket {
                    if let Some(slot) = shard.entries.get(handle) {
                        if slot.envelope.intersects(query) {
                            out.push((*handle, slot.envelope));
                        }
                    }
                }
            }
        }
    }

    /// Widening radii tried by [`SpatialIndex::nearest`] before a full scan.
    fn search_steps(&self) -> [f64; 7] {
        let bounds = self.bounds();
        let biggest = bounds.width().max(bounds.height()).max(1.0);
        [
            biggest / 100.0,
            biggest / 50.0,
            biggest / 20.0,
            biggest / 10.0,
            biggest / 2.0,
            biggest,
            biggest * std::f64::consts::SQRT_2,
        ]
    }

    /// Up to `k` entries closest to `point`, nearest first, ties broken by handle.
    pub fn nearest<F>(
        &self,
        point: &Point,
        k: usize,
        filter: F,
    ) -> Result<Vec<(AgentHandle, Envelope)>, IndexError>
    where
        F: Fn(AgentHandle, &Envelope) -> bool,
    {
        if !point.is_finite() {
            return Err(IndexError::InvalidGeometry(Envelope::from_point(*point)));
        }
        if k == 0 {
            return Ok(Vec::new());
        }
        let mut candidates = None;
        for step in self.search_steps() {
            let found = self.query_range(&Envelope::around(*point, step), &filter)?;
            if found.len() >= k {
                candidates = Some(found);
                break;
            }
        }
        let mut candidates = match candidates {
            Some(found) => {
                // The square may have missed entries closer than the k-th candidate found.
                let kth = Self::kth_distance(point, &found, k);
                self.query_range(&Envelope::around(*point, kth), &filter)?
            }
            None => {
                let mut all = self.entries();
                all.retain(|(handle, envelope)| filter(*handle, envelope));
                all
            }
        };
        candidates.sort_by_key(|(handle, envelope)| {
            (OrderedFloat(envelope.distance_to_point(point)), *handle)
        });
        candidates.truncate(k);
        Ok(candidates)
    }

    fn kth_distance(point: &Point, found: &[(AgentHandle, Envelope)], k: usize) -> f64 {
        let mut distances: Vec<OrderedFloat<f64>> = found
            .iter()
            .map(|(_, envelope)| OrderedFloat(envelope.distance_to_point(point)))
            .collect();
        distances.sort_unstable();
        distances
            .get(k.saturating_sub(1))
            .map_or(0.0, |d| d.into_inner())
    }

    /// Closest entry within `max_distance` of `point`, if any.
    pub fn first_within<F>(
        &self,
        point: &Point,
        max_distance: f64,
        filter: F,
    ) -> Result<Option<(AgentHandle, Envelope)>, IndexError>
    where
        F: Fn(AgentHandle, &Envelope) -> bool,
    {
        if !point.is_finite() || max_distance.is_nan() {
            return Err(IndexError::InvalidGeometry(Envelope::from_point(*point)));
        }
        let found = self.query_range(&Envelope::around(*point, max_distance.max(0.0)), filter)?;
        Ok(found
            .into_iter()
            .map(|(handle, envelope)| (envelope.distance_to_point(point), handle, envelope))
            .filter(|(distance, _, _)| *distance <= max_distance)
            .min_by_key(|(distance, handle, _)| (OrderedFloat(*distance), *handle))
            .map(|(_, handle, envelope)| (handle, envelope)))
    }

    /// Move every entry of `other` into `self`, re-keyed through `rekey`.
    ///
    /// Both indices are held exclusively for the duration, so queries in flight on either
    /// side complete first. `other` is left empty. Returns the number of moved entries.
    pub fn merge<R>(&self, other: &SpatialIndex, rekey: R) -> usize
    where
        R: Fn(AgentHandle) -> AgentHandle,
    {
        if std::ptr::eq(self, other) {
            return 0;
        }
        // Consistent address order keeps two opposite merges from deadlocking.
        let self_first = (self as *const Self) < (other as *const Self);
        let (layout_a, layout_b) = if self_first {
            (write(&self.layout), write(&other.layout))
        } else {
            let b = write(&other.layout);
            (write(&self.layout), b)
        };
        let moved: Vec<(AgentHandle, Envelope)> = {
            let other_shards = write(&other.shards);
            let mut moved = Vec::new();
            for shard in other_shards.iter() {
                let mut shard = write(shard);
                moved.extend(shard.entries.iter().map(|(h, slot)| (*h, slot.envelope)));
                shard.clear();
            }
            moved
        };
        drop(layout_b);
        let shards = write(&self.shards);
        for (handle, envelope) in &moved {
            let handle = rekey(*handle);
            if let Some(owner) = Self::locate(&shards, handle) {
                write(&shards[owner]).take(handle);
            }
            let cell = layout_a.cell_of(&envelope.center());
            write(&shards[layout_a.shard_of(cell)]).put(handle, *envelope, cell);
            self.note_extent(envelope);
        }
        other
            .max_half_extent
            .store(0.0_f64.to_bits(), Ordering::Release);
        info!(moved = moved.len(), "merged spatial index");
        moved.len()
    }

    /// Re-lay the grid over `bounds` and re-bucket every entry.
    pub fn rebuild(&self, bounds: Envelope) -> Result<(), IndexError> {
        let bounds = bounds.validated()?;
        let mut layout = write(&self.layout);
        let mut shards = write(&self.shards);
        let entries: Vec<(AgentHandle, Envelope)> = shards
            .iter()
            .flat_map(|shard| {
                read(shard)
                    .entries
                    .iter()
                    .map(|(h, slot)| (*h, slot.envelope))
                    .collect::<Vec<_>>()
            })
            .collect();
        *layout = GridLayout::new(bounds, &self.config);
        *shards = new_shards(layout.shard_count());
        let mut margin = 0.0_f64;
        for (handle, envelope) in &entries {
            let cell = layout.cell_of(&envelope.center());
            write(&shards[layout.shard_of(cell)]).put(*handle, *envelope, cell);
            margin = margin.max(envelope.half_extent());
        }
        self.max_half_extent
            .store(margin.to_bits(), Ordering::Release);
        debug!(entries = entries.len(), ?bounds, "rebuilt spatial index");
        Ok(())
    }

    /// Every (handle, envelope) pair, ordered by handle; for snapshotting.
    #[must_use]
    pub fn entries(&self) -> Vec<(AgentHandle, Envelope)> {
        let _layout = read(&self.layout);
        let shards = read(&self.shards);
        let guards: Vec<RwLockReadGuard<'_, Shard>> = shards.iter().map(read).collect();
        let mut all: Vec<(AgentHandle, Envelope)> = guards
            .iter()
            .flat_map(|shard| shard.entries.iter().map(|(h, slot)| (*h, slot.envelope)))
            .collect();
        all.sort_unstable_by_key(|(handle, _)| *handle);
        all
    }

    /// Bulk restore. Every envelope is validated before anything is inserted.
    pub fn reinsert<I>(&self, entries: I) -> Result<usize, IndexError>
    where
        I: IntoIterator<Item = (AgentHandle, Envelope)>,
    {
        let entries: Vec<(AgentHandle, Envelope)> = entries.into_iter().collect();
        for (_, envelope) in &entries {
            envelope.validated()?;
        }
        for (handle, envelope) in &entries {
            self.insert(*handle, *envelope)?;
        }
        Ok(entries.len())
    }

    #[must_use]
    pub fn envelope_of(&self, handle: AgentHandle) -> Option<Envelope> {
        let _layout = read(&self.layout);
        let shards = read(&self.shards);
        shards
            .iter()
            .find_map(|shard| read(shard).entries.get(&handle).map(|slot| slot.envelope))
    }

    #[must_use]
    pub fn contains(&self, handle: AgentHandle) -> bool {
        self.envelope_of(handle).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        let _layout = read(&self.layout);
        let shards = read(&self.shards);
        let guards: Vec<RwLockReadGuard<'_, Shard>> = shards.iter().map(read).collect();
        guards.iter().map(|shard| shard.entries.len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry belonging to `population`; returns how many were removed.
    pub fn remove_population(&self, population: PopulationId) -> usize {
        let _layout = write(&self.layout);
        let shards = read(&self.shards);
        let mut removed = 0;
        for shard in shards.iter() {
            let mut shard = write(shard);
            let doomed: Vec<AgentHandle> = shard
                .entries
                .keys()
                .filter(|h| h.population == population)
                .copied()
                .collect();
            for handle in doomed {
                shard.take(handle);
                removed += 1;
            }
        }
        removed
    }

    pub fn clear(&self) {
        let _layout = write(&self.layout);
        let shards = read(&self.shards);
        for shard in shards.iter() {
            write(shard).clear();
        }
        self.max_half_extent
            .store(0.0_f64.to_bits(), Ordering::Release);
    }
}
