//! Bounding volume hierarchy construction and refitting.

use glam::Vec3;
use photon_core::Aabb;

use super::layout::BvhNode;

/// Most primitives a leaf holds.
pub const MAX_LEAF_SIZE: u32 = 4;
const SAH_BINS: usize = 12;
const TRAVERSAL_COST: f32 = 1.0;
const INTERSECTION_COST: f32 = 1.0;

/// Nodes and the leaf order of the primitives they cover.
#[derive(Debug, Default)]
pub struct Tree {
    pub nodes: Vec<BvhNode>,
    /// Index into the input bounds for each leaf slot.
    pub order: Vec<u32>,
}

#[derive(Clone, Copy)]
struct Bin {
    bounds: Aabb,
    count: u32,
}

impl Default for Bin {
    fn default() -> Self {
        Self {
            bounds: Aabb::EMPTY,
            count: 0,
        }
    }
}

fn range_bounds(order: &[u32], bounds: &[Aabb]) -> Aabb {
    order
        .iter()
        .fold(Aabb::EMPTY, |acc, &i| acc.merge(&bounds[i as usize]))
}

/// Build a tree over every valid box in `bounds`. Invalid (empty or
/// non-finite) boxes are left out; such primitives can never be hit.
///
/// `fast_build` splits at the object median instead of evaluating the
/// surface area heuristic.
#[cfg_attr(
    feature = "profiling-tracy",
    tracing::instrument(level = "trace", skip_all)
)]
pub fn build(bounds: &[Aabb], fast_build: bool) -> Tree {
    let mut order: Vec<u32> = (0..bounds.len() as u32)
        .filter(|&i| {
            let b = &bounds[i as usize];
            b.is_valid() && b.min.is_finite() && b.max.is_finite()
        })
        .collect();
    if order.is_empty() {
        return Tree::default();
    }
    let centroids: Vec<Vec3> = bounds.iter().map(Aabb::center).collect();

    let mut root = BvhNode {
        left_first: 0,
        count: order.len() as u32,
        ..BvhNode::default()
    };
    root.set_bounds(&range_bounds(&order, bounds));
    let mut nodes = Vec::with_capacity(order.len() * 2);
    nodes.push(root);

    let mut stack = vec![0usize];
    while let Some(index) = stack.pop() {
        let node = nodes[index];
        if node.count <= MAX_LEAF_SIZE {
            continue;
        }
        let first = node.left_first as usize;
        let range = &mut order[first..first + node.count as usize];
        let split = if fast_build {
            median_split(range, &centroids)
        } else {
            sah_split(range, bounds, &centroids, &node.bounds())
        };
        let Some(split) = split else {
            continue;
        };

        let left_index = nodes.len();
        for (start, count) in [(first, split), (first + split, range.len() - split)] {
            let mut child = BvhNode {
                left_first: start as u32,
                count: count as u32,
                ..BvhNode::default()
            };
            child.set_bounds(&range_bounds(&order[start..start + count], bounds));
            nodes.push(child);
        }
        nodes[index].left_first = left_index as u32;
        nodes[index].count = 0;
        stack.push(left_index);
        stack.push(left_index + 1);
    }

    Tree { nodes, order }
}

fn widest_axis(size: Vec3) -> usize {
    if size.x >= size.y && size.x >= size.z {
        0
    } else if size.y >= size.z {
        1
    } else {
        2
    }
}

fn centroid_bounds(range: &[u32], centroids: &[Vec3]) -> Aabb {
    Aabb::from_points(range.iter().map(|&i| centroids[i as usize]))
}

/// Split at the object median of the widest centroid axis.
fn median_split(range: &mut [u32], centroids: &[Vec3]) -> Option<usize> {
    let axis = widest_axis(centroid_bounds(range, centroids).size());
    let mid = range.len() / 2;
    range.select_nth_unstable_by(mid, |&a, &b| {
        centroids[a as usize][axis].total_cmp(&centroids[b as usize][axis])
    });
    Some(mid)
}

/// Binned surface area heuristic. `None` keeps the node as a leaf, which
/// only happens when it is small enough and no split pays off.
fn sah_split(
    range: &mut [u32],
    bounds: &[Aabb],
    centroids: &[Vec3],
    node_bounds: &Aabb,
) -> Option<usize> {
    let extent = centroid_bounds(range, centroids);
    let size = extent.size();
    let axis = widest_axis(size);
    if size[axis] <= f32::EPSILON * extent.max.abs().max_element().max(1.0) {
        // Coincident centroids; halve by position in the range.
        return Some(range.len() / 2);
    }

    let scale = SAH_BINS as f32 / size[axis];
    let bin_of = |i: u32| {
        let offset = (centroids[i as usize][axis] - extent.min[axis]) * scale;
        (offset as usize).min(SAH_BINS - 1)
    };
    let mut bins = [Bin::default(); SAH_BINS];
    for &i in range.iter() {
        let bin = &mut bins[bin_of(i)];
        bin.bounds = bin.bounds.merge(&bounds[i as usize]);
        bin.count += 1;
    }

    // Sweep from the right to get suffix areas and counts.
    let mut right_area = [0.0f32; SAH_BINS];
    let mut right_count = [0u32; SAH_BINS];
    let mut acc = Bin::default();
    for b in (1..SAH_BINS).rev() {
        acc.bounds = acc.bounds.merge(&bins[b].bounds);
        acc.count += bins[b].count;
        right_area[b] = if acc.count > 0 {
            acc.bounds.surface_area()
        } else {
            0.0
        };
        right_count[b] = acc.count;
    }

    let mut best = (f32::INFINITY, 0usize);
    let mut left = Bin::default();
    for b in 0..SAH_BINS - 1 {
        left.bounds = left.bounds.merge(&bins[b].bounds);
        left.count += bins[b].count;
        if left.count == 0 || right_count[b + 1] == 0 {
            continue;
        }
        let cost = left.bounds.surface_area() * left.count as f32
            + right_area[b + 1] * right_count[b + 1] as f32;
        if cost < best.0 {
            best = (cost, b);
        }
    }

    let parent_area = node_bounds.surface_area().max(f32::MIN_POSITIVE);
    let split_cost = TRAVERSAL_COST + INTERSECTION_COST * best.0 / parent_area;
    let leaf_cost = INTERSECTION_COST * range.len() as f32;
    if !best.0.is_finite() {
        return Some(range.len() / 2);
    }
    if split_cost >= leaf_cost && range.len() as u32 <= MAX_LEAF_SIZE * 2 {
        return None;
    }

    // Partition in place: bins <= best go left.
    let mut mid = 0;
    for j in 0..range.len() {
        if bin_of(range[j]) <= best.1 {
            range.swap(j, mid);
            mid += 1;
        }
    }
    if mid == 0 || mid == range.len() {
        return Some(range.len() / 2);
    }
    Some(mid)
}

/// Recompute node bounds bottom-up from `leaf_bounds`, given in leaf order.
pub fn refit(nodes: &mut [BvhNode], leaf_bounds: &[Aabb]) {
    for index in (0..nodes.len()).rev() {
        let node = nodes[index];
        let bounds = if node.is_leaf() {
            let first = node.left_first as usize;
            leaf_bounds[first..first + node.count as usize]
                .iter()
                .fold(Aabb::EMPTY, |acc, b| acc.merge(b))
        } else {
            let left = node.left_first as usize;
            nodes[left].bounds().merge(&nodes[left + 1].bounds())
        };
        nodes[index].set_bounds(&bounds);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(n: usize) -> Vec<Aabb> {
        (0..n)
            .map(|i| {
                let p = Vec3::new((i % 10) as f32, (i / 10) as f32, (i % 7) as f32);
                Aabb::from_center(p, Vec3::splat(0.25))
            })
            .collect()
    }

    fn check_tree(tree: &Tree, bounds: &[Aabb]) {
        let mut seen = vec![false; bounds.len()];
        for (index, node) in tree.nodes.iter().enumerate() {
            let node_bounds = node.bounds();
            if node.is_leaf() {
                assert!(node.count <= MAX_LEAF_SIZE * 2);
                let first = node.left_first as usize;
                for &prim in &tree.order[first..first + node.count as usize] {
                    let b = bounds[prim as usize];
                    assert!(node_bounds.contains_point(b.min) && node_bounds.contains_point(b.max));
                    assert!(!seen[prim as usize]);
                    seen[prim as usize] = true;
                }
            } else {
                assert!(node.left_first as usize > index);
            }
        }
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn sah_tree_covers_every_primitive() {
        let bounds = grid(257);
        let tree = build(&bounds, false);
        check_tree(&tree, &bounds);
        assert!(tree.nodes.len() < 2 * bounds.len());
    }

    #[test]
    fn median_tree_covers_every_primitive() {
        let bounds = grid(100);
        let tree = build(&bounds, true);
        check_tree(&tree, &bounds);
    }

    #[test]
    fn coincident_boxes_still_split() {
        let bounds = vec![Aabb::from_center(Vec3::ZERO, Vec3::ONE); 33];
        let tree = build(&bounds, false);
        check_tree(&tree, &bounds);
    }

    #[test]
    fn invalid_boxes_are_skipped() {
        let mut bounds = grid(5);
        bounds[2] = Aabb::EMPTY;
        bounds[3].max.x = f32::NAN;
        let tree = build(&bounds, false);
        assert_eq!(tree.order.len(), 3);
        assert!(build(&[Aabb::EMPTY], false).nodes.is_empty());
    }

    #[test]
    fn refit_tracks_moved_primitives() {
        let bounds = grid(40);
        let mut tree = build(&bounds, false);
        let moved: Vec<Aabb> = tree
            .order
            .iter()
            .map(|&i| {
                let b = bounds[i as usize];
                Aabb::new(b.min + Vec3::X * 100.0, b.max + Vec3::X * 100.0)
            })
            .collect();
        refit(&mut tree.nodes, &moved);
        let root = tree.nodes[0].bounds();
        assert!(root.min.x >= 100.0 - 0.25);
        assert!(root.contains_point(moved[0].center()));
    }
}
