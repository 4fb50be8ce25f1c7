//! Periodic strip boundary.
//!
//! A sheet that is periodic along `y` is simulated with a band of image
//! particles beyond each edge of the strip `|y| <= period / 2`. Each image
//! mirrors an interior source particle shifted by `±period`. The pairing is
//! found by position, so it does not depend on the order in which particles
//! are enumerated, and is cached until the mesh generation changes.

use std::collections::HashMap;

use nalgebra::{Point3, Vector3};

use crate::error::{MeshError, Result};
use crate::mesh::Particle;
use crate::params::ParamMap;

const CONTEXT: &str = "periodic strip";

/// Geometry of a strip that is periodic along `y`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeriodicStrip {
    /// Length of one period.
    pub period: f64,
    /// Particles per unit length; sets the matching resolution.
    pub packing: f64,
    /// Width of the image band beyond each edge.
    pub width: f64,
}

impl PeriodicStrip {
    /// Create a validated strip.
    pub fn new(period: f64, packing: f64, width: f64) -> Result<Self> {
        positive("period", period)?;
        positive("packing", packing)?;
        positive("width", width)?;
        if width > period {
            return Err(MeshError::invalid_param("width", width, "must not exceed the period"));
        }
        Ok(Self {
            period,
            packing,
            width,
        })
    }

    /// Read `period` (required), `packing` and `width` from a parameter block.
    ///
    /// `width` defaults to a quarter of the period.
    pub fn from_params(params: &ParamMap) -> Result<Self> {
        let period: f64 = params.required("period", CONTEXT)?;
        let packing = params.optional("packing", 1.0, CONTEXT)?;
        let width = params.optional("width", 0.25 * period, CONTEXT)?;
        Self::new(period, packing, width)
    }

    #[inline]
    fn half(&self) -> f64 {
        0.5 * self.period
    }

    /// Largest distance at which an image still matches its source.
    #[inline]
    fn tolerance(&self) -> f64 {
        0.5 / self.packing
    }

    fn region(&self, y: f64) -> Region {
        let half = self.half();
        if y.abs() <= half {
            Region::Interior
        } else if y > half && y <= half + self.width {
            Region::Image(-self.period)
        } else if y < -half && y >= -half - self.width {
            Region::Image(self.period)
        } else {
            Region::Outside
        }
    }
}

fn positive(name: &str, value: f64) -> Result<()> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(MeshError::invalid_param(name, value, "must be positive"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Region {
    Interior,
    /// Image whose source lies this far along `y`.
    Image(f64),
    Outside,
}

/// One image particle and the interior particle it mirrors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageLink {
    /// Index of the image particle.
    pub image: usize,
    /// Index of its source.
    pub source: usize,
    /// Offset added to the source `y` coordinate to obtain the image.
    pub shift: f64,
}

/// Image/source pairing for one particle configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundaryIndex {
    generation: u64,
    interior: usize,
    links: Vec<ImageLink>,
    unmatched: Vec<usize>,
}

impl BoundaryIndex {
    /// Pair every image particle with its source.
    ///
    /// `generation` is the mesh generation the particles belong to.
    pub fn classify(particles: &[Particle], strip: &PeriodicStrip, generation: u64) -> Self {
        let h = 1.0 / strip.packing;
        let key = |p: &Point3<f64>| -> [i64; 3] {
            [
                (p.x / h).floor() as i64,
                (p.y / h).floor() as i64,
                (p.z / h).floor() as i64,
            ]
        };

        let mut interior = 0;
        let mut grid: HashMap<[i64; 3], Vec<usize>> = HashMap::new();
        let mut images = Vec::new();
        for (i, p) in particles.iter().enumerate() {
            match strip.region(p.position.y) {
                Region::Interior => {
                    interior += 1;
                    grid.entry(key(&p.position)).or_default().push(i);
                }
                Region::Image(shift) => images.push((i, shift)),
                Region::Outside => {}
            }
        }

        let tolerance = strip.tolerance();
        let mut links = Vec::with_capacity(images.len());
        let mut unmatched = Vec::new();
        for (i, shift) in images {
            let target = particles[i].position + Vector3::y() * shift;
            let [cx, cy, cz] = key(&target);
            let mut best: Option<(usize, f64)> = None;
            for dx in -1..=1 {
                for dy in -1..=1 {
                    for dz in -1..=1 {
                        let Some(bucket) = grid.get(&[cx + dx, cy + dy, cz + dz]) else {
                            continue;
                        };
                        for &j in bucket {
                            let d = (particles[j].position - target).norm();
                            if d <= tolerance && best.map_or(true, |(_, bd)| d < bd) {
                                best = Some((j, d));
                            }
                        }
                    }
                }
            }
            match best {
                Some((source, _)) => links.push(ImageLink {
                    image: i,
                    source,
                    // Source to image is the opposite of image to source
                    shift: -shift,
                }),
                None => {
                    log::warn!(
                        "{}: image particle {} at y = {} has no source",
                        CONTEXT,
                        particles[i].id,
                        particles[i].position.y
                    );
                    unmatched.push(i);
                }
            }
        }

        log::debug!(
            "{}: {} interior particles, {} images, {} unmatched",
            CONTEXT,
            interior,
            links.len(),
            unmatched.len()
        );

        Self {
            generation,
            interior,
            links,
            unmatched,
        }
    }

    /// Whether this index was built for `generation`.
    #[inline]
    pub fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }

    /// Number of interior particles.
    #[inline]
    pub fn interior(&self) -> usize {
        self.interior
    }

    /// Matched image particles.
    #[inline]
    pub fn links(&self) -> &[ImageLink] {
        &self.links
    }

    /// Image particles without a source.
    #[inline]
    pub fn unmatched(&self) -> &[usize] {
        &self.unmatched
    }

    /// Copy each source position, shifted by the period, and normal onto its image.
    ///
    /// Returns the number of images updated.
    pub fn sync_images(&self, particles: &mut [Particle]) -> Result<usize> {
        for link in &self.links {
            let missing = link.image.max(link.source);
            if missing >= particles.len() {
                return Err(MeshError::MissingVertex { id: missing });
            }
        }
        for link in &self.links {
            let source = &particles[link.source];
            let position = source.position + Vector3::y() * link.shift;
            let normal = source.normal;
            let image = &mut particles[link.image];
            image.position = position;
            image.normal = normal;
        }
        Ok(self.links.len())
    }
}

/// Boundary index kept across steps and rebuilt when the generation changes.
#[derive(Debug, Clone)]
pub struct BoundaryCache {
    strip: PeriodicStrip,
    index: Option<BoundaryIndex>,
}

impl BoundaryCache {
    /// Create an empty cache for `strip`.
    pub fn new(strip: PeriodicStrip) -> Self {
        Self { strip, index: None }
    }

    /// The strip geometry.
    pub fn strip(&self) -> &PeriodicStrip {
        &self.strip
    }

    /// Current index, classifying `particles` first if `generation` changed.
    pub fn get_or_classify(&mut self, particles: &[Particle], generation: u64) -> &BoundaryIndex {
        let stale = self
            .index
            .as_ref()
            .map_or(true, |index| !index.is_current(generation));
        if stale {
            log::debug!("{}: reclassifying for generation {}", CONTEXT, generation);
            self.index = None;
        }
        let strip = self.strip;
        self.index
            .get_or_insert_with(|| BoundaryIndex::classify(particles, &strip, generation))
    }

    /// Drop the cached index.
    pub fn invalidate(&mut self) {
        self.index = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Rows of particles at unit spacing from y = -7 to y = 7 with period 10.
    fn strip_particles() -> Vec<Particle> {
        let mut particles = Vec::new();
        // Enumerate rows in a scrambled order
        for &j in &[3, -7, 0, 6, -2, 7, -6, 5, 1, -5, 4, -1, 2, -3, -4] {
            for i in 0..3 {
                let id = particles.len();
                particles.push(Particle::new(id, i as f64, j as f64, 0.0));
            }
        }
        particles
    }

    #[test]
    fn test_strip_validation() {
        assert!(PeriodicStrip::new(10.0, 1.0, 2.0).is_ok());
        assert!(PeriodicStrip::new(0.0, 1.0, 2.0).is_err());
        assert!(PeriodicStrip::new(10.0, -1.0, 2.0).is_err());
        assert!(PeriodicStrip::new(10.0, 1.0, 20.0).is_err());

        let strip = PeriodicStrip::from_params(&ParamMap::new().with("period", 8)).unwrap();
        assert_eq!(strip.width, 2.0);
        assert!(matches!(
            PeriodicStrip::from_params(&ParamMap::new()),
            Err(MeshError::MissingParameter { .. })
        ));
    }

    #[test]
    fn test_classify_pairs_images_by_position() {
        let particles = strip_particles();
        let strip = PeriodicStrip::new(10.0, 1.0, 2.0).unwrap();
        let index = BoundaryIndex::classify(&particles, &strip, 0);

        // Rows -5..=5 are interior, rows ±6 and ±7 are images
        assert_eq!(index.interior(), 33);
        assert_eq!(index.links().len(), 12);
        assert!(index.unmatched().is_empty());
        for link in index.links() {
            let image = &particles[link.image];
            let source = &particles[link.source];
            assert_eq!(image.position.x, source.position.x);
            assert!((image.position.y - (source.position.y + link.shift)).abs() < 1e-12);
        }
    }

    #[test]
    fn test_sync_images_follows_sources() {
        let mut particles = strip_particles();
        let strip = PeriodicStrip::new(10.0, 1.0, 2.0).unwrap();
        let index = BoundaryIndex::classify(&particles, &strip, 0);

        // Move every interior particle a little
        for p in particles.iter_mut() {
            if p.position.y.abs() <= 5.0 {
                p.position.x += 0.1;
                p.normal = Some(Vector3::z());
            }
        }
        assert_eq!(index.sync_images(&mut particles).unwrap(), 12);

        for link in index.links() {
            let image = &particles[link.image];
            let source = &particles[link.source];
            assert_eq!(image.position.x, source.position.x);
            assert_eq!(image.normal, Some(Vector3::z()));
        }

        assert!(index.sync_images(&mut particles[..10]).is_err());
    }

    #[test]
    fn test_unmatched_image() {
        let mut particles = strip_particles();
        let id = particles.len();
        particles.push(Particle::new(id, 40.0, 6.0, 0.0));
        let strip = PeriodicStrip::new(10.0, 1.0, 2.0).unwrap();
        let index = BoundaryIndex::classify(&particles, &strip, 0);
        assert_eq!(index.unmatched(), &[id]);
    }

    #[test]
    fn test_cache_reclassifies_on_new_generation() {
        let particles = strip_particles();
        let strip = PeriodicStrip::new(10.0, 1.0, 2.0).unwrap();
        let mut cache = BoundaryCache::new(strip);

        assert!(cache.get_or_classify(&particles, 1).is_current(1));
        // Same generation: the cached index is reused even for other input
        assert_eq!(cache.get_or_classify(&[], 1).links().len(), 12);
        assert!(cache.get_or_classify(&[], 2).links().is_empty());

        cache.invalidate();
        assert_eq!(cache.get_or_classify(&particles, 2).links().len(), 12);
    }
}
