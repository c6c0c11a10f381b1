//! Seeded point scenes and their CPU reference answers.

use std::f64::consts::PI;

use glam::{IVec3, Vec3};
use hashbrown::HashMap;
use photon_core::{Aabb, Float3A};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Points in the unit cube, each the centre of a box of half-width `radius`.
#[derive(Clone, Debug)]
pub struct PointCloud {
    points: Vec<Vec3>,
    radius: f32,
}

impl PointCloud {
    /// `count` uniformly distributed points drawn from `seed`.
    pub fn random(count: usize, radius: f32, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let points = (0..count)
            .map(|_| Vec3::new(rng.gen(), rng.gen(), rng.gen()))
            .collect();
        Self { points, radius }
    }

    pub fn from_points(points: Vec<Vec3>, radius: f32) -> Self {
        Self { points, radius }
    }

    pub fn points(&self) -> &[Vec3] {
        &self.points
    }

    pub fn radius(&self) -> f32 {
        self.radius
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Points in the padded layout device programs read.
    pub fn device_points(&self) -> Vec<Float3A> {
        self.points.iter().copied().map(Float3A::from).collect()
    }

    /// One box per point.
    pub fn aabbs(&self) -> Vec<Aabb> {
        let half = Vec3::splat(self.radius);
        self.points
            .iter()
            .map(|&p| Aabb::from_center(p, half))
            .collect()
    }

    /// Move every point by up to `amount` along each axis.
    pub fn jitter(&mut self, amount: f32, seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        for p in &mut self.points {
            *p += Vec3::new(
                rng.gen_range(-amount..=amount),
                rng.gen_range(-amount..=amount),
                rng.gen_range(-amount..=amount),
            );
        }
    }

    /// Number of pairs `i < j` closer than `radius`, counted on a uniform
    /// grid of `radius`-sized cells.
    pub fn count_pairs(&self) -> u64 {
        if self.radius <= 0.0 {
            return 0;
        }
        let cell = |p: Vec3| (p / self.radius).floor().as_ivec3();
        let mut grid: HashMap<IVec3, Vec<usize>> = HashMap::new();
        for (i, &p) in self.points.iter().enumerate() {
            grid.entry(cell(p)).or_default().push(i);
        }

        let r2 = self.radius * self.radius;
        let mut pairs = 0;
        for (i, &p) in self.points.iter().enumerate() {
            let home = cell(p);
            for dz in -1..=1 {
                for dy in -1..=1 {
                    for dx in -1..=1 {
                        let Some(bucket) = grid.get(&(home + IVec3::new(dx, dy, dz))) else {
                            continue;
                        };
                        pairs += bucket
                            .iter()
                            .filter(|&&j| j > i && p.distance_squared(self.points[j]) < r2)
                            .count() as u64;
                    }
                }
            }
        }
        pairs
    }

    /// Expected pair count for uniform points in the unit cube, ignoring
    /// boundary effects: `2/3 * pi * n^2 * r^3`.
    pub fn estimated_pairs(&self) -> f64 {
        let n = self.points.len() as f64;
        let r = f64::from(self.radius);
        2.0 / 3.0 * PI * n * n * r * r * r
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn brute_force(cloud: &PointCloud) -> u64 {
        let points = cloud.points();
        let r2 = cloud.radius() * cloud.radius();
        let mut pairs = 0;
        for i in 0..points.len() {
            for j in i + 1..points.len() {
                if points[i].distance_squared(points[j]) < r2 {
                    pairs += 1;
                }
            }
        }
        pairs
    }

    #[test]
    fn same_seed_same_scene() {
        let a = PointCloud::random(64, 0.1, 7);
        let b = PointCloud::random(64, 0.1, 7);
        let c = PointCloud::random(64, 0.1, 8);
        assert_eq!(a.points(), b.points());
        assert_ne!(a.points(), c.points());
        assert!(a.points().iter().all(|p| p.cmpge(Vec3::ZERO).all() && p.cmplt(Vec3::ONE).all()));
    }

    #[test]
    fn grid_count_matches_brute_force() {
        for seed in 0..4 {
            let cloud = PointCloud::random(500, 0.08, seed);
            assert_eq!(cloud.count_pairs(), brute_force(&cloud));
        }
    }

    #[test]
    fn pairs_are_strictly_closer_than_radius() {
        let cloud = PointCloud::from_points(
            vec![
                Vec3::new(0.5, 0.5, 0.5),
                Vec3::new(0.75, 0.5, 0.5),
                Vec3::new(0.5, 0.6, 0.5),
            ],
            0.25,
        );
        // (0, 1) is exactly at the radius.
        assert_eq!(cloud.count_pairs(), 1);
    }

    #[test]
    fn boxes_are_centred_on_points() {
        let cloud = PointCloud::random(8, 0.05, 3);
        for (aabb, &p) in cloud.aabbs().iter().zip(cloud.points()) {
            assert_relative_eq!(aabb.center().x, p.x, epsilon = 1e-6);
            assert_relative_eq!(aabb.size().y, 0.1, epsilon = 1e-6);
        }
    }

    #[test]
    fn estimate_is_close_for_dense_scenes() {
        let cloud = PointCloud::random(4000, 0.02, 11);
        let ratio = cloud.count_pairs() as f64 / cloud.estimated_pairs();
        assert!((0.75..1.2).contains(&ratio), "ratio {ratio}");
    }
}
