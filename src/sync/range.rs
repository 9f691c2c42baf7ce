//! Subresource rectangles and their disjoint partitions.

use ash::vk;

/// A rectangle over an image's (mip level × array layer) space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubresourceRange {
    pub base_mip_level: u32,
    pub level_count: u32,
    pub base_array_layer: u32,
    pub layer_count: u32,
}

impl SubresourceRange {
    pub const fn new(
        base_mip_level: u32,
        level_count: u32,
        base_array_layer: u32,
        layer_count: u32,
    ) -> Self {
        Self {
            base_mip_level,
            level_count,
            base_array_layer,
            layer_count,
        }
    }

    /// A single mip level of a single layer.
    pub const fn single(mip_level: u32, array_layer: u32) -> Self {
        Self::new(mip_level, 1, array_layer, 1)
    }

    pub fn mip_end(&self) -> u32 {
        self.base_mip_level + self.level_count
    }

    pub fn layer_end(&self) -> u32 {
        self.base_array_layer + self.layer_count
    }

    pub fn is_empty(&self) -> bool {
        self.level_count == 0 || self.layer_count == 0
    }

    /// Number of (mip, layer) subresources covered.
    pub fn area(&self) -> u64 {
        self.level_count as u64 * self.layer_count as u64
    }

    /// Both the mip interval and the layer interval intersect.
    pub fn overlaps(&self, other: &Self) -> bool {
        self.base_mip_level < other.mip_end()
            && other.base_mip_level < self.mip_end()
            && self.base_array_layer < other.layer_end()
            && other.base_array_layer < self.layer_end()
    }

    pub fn contains(&self, other: &Self) -> bool {
        self.base_mip_level <= other.base_mip_level
            && other.mip_end() <= self.mip_end()
            && self.base_array_layer <= other.base_array_layer
            && other.layer_end() <= self.layer_end()
    }

    pub fn contains_subresource(&self, mip_level: u32, array_layer: u32) -> bool {
        (self.base_mip_level..self.mip_end()).contains(&mip_level)
            && (self.base_array_layer..self.layer_end()).contains(&array_layer)
    }

    /// The overlapping box, if any.
    pub fn intersect(&self, other: &Self) -> Option<Self> {
        if !self.overlaps(other) {
            return None;
        }
        let mip = self.base_mip_level.max(other.base_mip_level);
        let layer = self.base_array_layer.max(other.base_array_layer);
        Some(Self::new(
            mip,
            self.mip_end().min(other.mip_end()) - mip,
            layer,
            self.layer_end().min(other.layer_end()) - layer,
        ))
    }

    /// Remove `hole` from this rectangle.
    ///
    /// The remainder is returned as at most four disjoint rectangles: the
    /// layers below the hole, the layers above it, and within the hole's
    /// layers the mips before and after it.
    pub fn subtract(&self, hole: &Self) -> Vec<Self> {
        let Some(hole) = self.intersect(hole) else {
            return vec![*self];
        };

        let mut pieces = Vec::with_capacity(4);
        if hole.base_array_layer > self.base_array_layer {
            pieces.push(Self::new(
                self.base_mip_level,
                self.level_count,
                self.base_array_layer,
                hole.base_array_layer - self.base_array_layer,
            ));
        }
        if hole.layer_end() < self.layer_end() {
            pieces.push(Self::new(
                self.base_mip_level,
                self.level_count,
                hole.layer_end(),
                self.layer_end() - hole.layer_end(),
            ));
        }
        if hole.base_mip_level > self.base_mip_level {
            pieces.push(Self::new(
                self.base_mip_level,
                hole.base_mip_level - self.base_mip_level,
                hole.base_array_layer,
                hole.layer_count,
            ));
        }
        if hole.mip_end() < self.mip_end() {
            pieces.push(Self::new(
                hole.mip_end(),
                self.mip_end() - hole.mip_end(),
                hole.base_array_layer,
                hole.layer_count,
            ));
        }
        pieces
    }

    pub fn to_vk(self, aspect_mask: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask,
            base_mip_level: self.base_mip_level,
            level_count: self.level_count,
            base_array_layer: self.base_array_layer,
            layer_count: self.layer_count,
        }
    }
}

/// A set of disjoint subresource rectangles, each carrying a value.
///
/// The rectangles never overlap. They need not cover the whole image:
/// subresources outside every rectangle are simply untracked.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeMap<V> {
    entries: Vec<(SubresourceRange, V)>,
}

impl<V> Default for RangeMap<V> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<V: Clone> RangeMap<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// A map with one rectangle covering `range`.
    pub fn filled(range: SubresourceRange, value: V) -> Self {
        let mut map = Self::new();
        map.insert_disjoint(range, value);
        map
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SubresourceRange, &V)> {
        self.entries.iter().map(|(range, value)| (range, value))
    }

    /// Value of a single subresource.
    pub fn get(&self, mip_level: u32, array_layer: u32) -> Option<&V> {
        self.entries
            .iter()
            .find(|(range, _)| range.contains_subresource(mip_level, array_layer))
            .map(|(_, value)| value)
    }

    /// Insert a rectangle known not to overlap any tracked one.
    pub fn insert_disjoint(&mut self, range: SubresourceRange, value: V) {
        if range.is_empty() {
            return;
        }
        debug_assert!(
            self.entries.iter().all(|(r, _)| !r.overlaps(&range)),
            "range {:?} overlaps a tracked rectangle",
            range
        );
        self.entries.push((range, value));
    }

    /// Visit the overlap of `range` with every tracked rectangle.
    pub fn for_each_overlap(&self, range: SubresourceRange, mut f: impl FnMut(&SubresourceRange, &V)) {
        for (tracked, value) in &self.entries {
            if let Some(overlap) = tracked.intersect(&range) {
                f(&overlap, value);
            }
        }
    }

    /// Replace the value of every tracked subresource inside `range`.
    ///
    /// Each tracked rectangle that overlaps `range` is split into the
    /// overlap, which receives `f(overlap, old)`, and up to four remainder
    /// rectangles that keep the old value. Returns the parts of `range`
    /// that no rectangle covered; they are left untracked.
    pub fn update(
        &mut self,
        range: SubresourceRange,
        mut f: impl FnMut(&SubresourceRange, &V) -> V,
    ) -> Vec<SubresourceRange> {
        if range.is_empty() {
            return Vec::new();
        }

        let mut gaps = vec![range];
        let mut entries = Vec::with_capacity(self.entries.len() + 4);
        for (tracked, value) in self.entries.drain(..) {
            let Some(overlap) = tracked.intersect(&range) else {
                entries.push((tracked, value));
                continue;
            };
            let replaced = f(&overlap, &value);
            for remainder in tracked.subtract(&overlap) {
                entries.push((remainder, value.clone()));
            }
            entries.push((overlap, replaced));
            gaps = gaps.iter().flat_map(|gap| gap.subtract(&overlap)).collect();
        }
        self.entries = entries;
        gaps
    }

    /// [`update`](Self::update) followed by inserting `value` into the gaps.
    ///
    /// Afterwards `range` is fully tracked. Returns the gaps that were filled.
    pub fn overwrite(
        &mut self,
        range: SubresourceRange,
        value: V,
        f: impl FnMut(&SubresourceRange, &V) -> V,
    ) -> Vec<SubresourceRange> {
        let gaps = self.update(range, f);
        for gap in &gaps {
            self.entries.push((*gap, value.clone()));
        }
        gaps
    }
}
