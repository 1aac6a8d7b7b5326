//! Surface catalog of candidate contact sites.
//!
//! Sites are loaded once at startup from a TOML file and never mutated.
//! Each site carries its friction cone rotated into the surface normal and
//! the 6×4 basis mapping cone coefficients to the link-frame wrench; the
//! joint-space map H = Jᵀ·basis is recomputed per step because the Jacobian
//! moves with the configuration.

use crate::model::{LinkFrameCache, LinkId, RigidBodyModel};
use nalgebra::{Matrix3x4, Matrix6x4, Point3, Rotation3, Unit, Vector3};
use rand::rngs::StdRng;
use rand::Rng;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Linearized friction cone edge count, fixed process-wide.
pub const FRICTION_CONE_EDGES: usize = 4;

/// Default coefficient of friction for the cone linearization.
pub const DEFAULT_MU: f64 = 0.4;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read site file {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("failed to parse site file {0}: {1}")]
    Parse(PathBuf, #[source] toml::de::Error),

    #[error("site on unknown link '{0}'")]
    UnknownLink(String),

    #[error("site on link '{0}' has a zero-norm normal")]
    ZeroNormal(String),

    #[error("site file contains no sites")]
    Empty,
}

// ============================================================================
// Candidate Site
// ============================================================================

/// Stable site identity. The catalog issues ids densely from 0; the locator
/// adapter issues fresh ids above the catalog range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SiteId(pub u32);

/// One discretized contact location: link, position and inward normal in the
/// link frame, plus the precomputed cone and wrench projections.
#[derive(Debug, Clone)]
pub struct CandidateSite {
    pub id: SiteId,
    pub link: LinkId,
    pub link_name: String,
    /// Contact position, link frame.
    pub position: Point3<f64>,
    /// Inward unit normal, link frame.
    pub normal: Unit<Vector3<f64>>,
    /// Cone edges rotated so the cone axis aligns with the normal (3×4).
    pub friction_cone: Matrix3x4<f64>,
    /// Maps cone coefficients α to the link-frame wrench [torque; force].
    pub wrench_basis: Matrix6x4<f64>,
}

/// Canonical cone edges before rotation: unit z-component, ±μ tangentials.
pub fn friction_cone_edges(mu: f64) -> Matrix3x4<f64> {
    Matrix3x4::new(
        mu, -mu, 0.0, 0.0, //
        0.0, 0.0, mu, -mu, //
        1.0, 1.0, 1.0, 1.0,
    )
}

/// Rotation carrying +z onto `normal`. Antiparallel normals get a half-turn
/// about x.
fn rotation_from_z(normal: &Unit<Vector3<f64>>) -> Rotation3<f64> {
    Rotation3::rotation_between(&Vector3::z(), normal).unwrap_or_else(|| {
        Rotation3::from_axis_angle(&Vector3::x_axis(), std::f64::consts::PI)
    })
}

impl CandidateSite {
    /// Precompute the rotated cone and wrench basis for a site.
    pub fn new(
        id: SiteId,
        link: LinkId,
        link_name: impl Into<String>,
        position: Point3<f64>,
        normal: Vector3<f64>,
        mu: f64,
    ) -> Result<Self, CatalogError> {
        let link_name = link_name.into();
        if normal.norm() < 1e-9 {
            return Err(CatalogError::ZeroNormal(link_name));
        }
        let normal = Unit::new_normalize(normal);
        let rotation = rotation_from_z(&normal);
        let friction_cone = rotation * friction_cone_edges(mu);

        let p = position.coords;
        let mut wrench_basis = Matrix6x4::zeros();
        for c in 0..FRICTION_CONE_EDGES {
            let edge = Vector3::new(
                friction_cone[(0, c)],
                friction_cone[(1, c)],
                friction_cone[(2, c)],
            );
            let torque = p.cross(&edge);
            for r in 0..3 {
                wrench_basis[(r, c)] = torque[r];
                wrench_basis[(r + 3, c)] = edge[r];
            }
        }

        Ok(Self {
            id,
            link,
            link_name,
            position,
            normal,
            friction_cone,
            wrench_basis,
        })
    }

    pub fn world_position(&self, frames: &LinkFrameCache) -> Point3<f64> {
        frames.world_from_link(self.link).transform_point(&self.position)
    }

    pub fn world_normal(&self, frames: &LinkFrameCache) -> Vector3<f64> {
        frames.world_from_link(self.link).rotation * self.normal.into_inner()
    }
}

// ============================================================================
// Site File
// ============================================================================

#[derive(Debug, Deserialize)]
struct SiteFile {
    #[serde(default)]
    sites: Vec<SiteFileEntry>,
}

#[derive(Debug, Deserialize)]
struct SiteFileEntry {
    link: String,
    position: [f64; 3],
    normal: [f64; 3],
}

// ============================================================================
// Catalog
// ============================================================================

/// Immutable collection of candidate sites, indexed by link.
pub struct SurfaceCatalog {
    sites: Vec<Arc<CandidateSite>>,
    by_link: BTreeMap<String, Vec<Arc<CandidateSite>>>,
}

impl SurfaceCatalog {
    /// Load the initial particle locations file and precompute every site.
    pub fn load_from_file(path: &Path, model: &dyn RigidBodyModel) -> Result<Self, CatalogError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| CatalogError::Io(path.to_path_buf(), e))?;
        let file: SiteFile =
            toml::from_str(&contents).map_err(|e| CatalogError::Parse(path.to_path_buf(), e))?;
        Self::from_entries(
            file.sites.iter().map(|s| {
                (
                    s.link.as_str(),
                    Point3::from(s.position),
                    Vector3::from(s.normal),
                )
            }),
            model,
        )
    }

    /// Build a catalog from (link, position, normal) triples.
    pub fn from_entries<'a>(
        entries: impl IntoIterator<Item = (&'a str, Point3<f64>, Vector3<f64>)>,
        model: &dyn RigidBodyModel,
    ) -> Result<Self, CatalogError> {
        let mut sites = Vec::new();
        let mut by_link: BTreeMap<String, Vec<Arc<CandidateSite>>> = BTreeMap::new();
        for (link_name, position, normal) in entries {
            let link = model
                .link_id(link_name)
                .ok_or_else(|| CatalogError::UnknownLink(link_name.to_string()))?;
            let id = SiteId(u32::try_from(sites.len()).unwrap_or(u32::MAX));
            let site = Arc::new(CandidateSite::new(
                id,
                link,
                link_name,
                position,
                normal,
                DEFAULT_MU,
            )?);
            by_link
                .entry(site.link_name.clone())
                .or_default()
                .push(Arc::clone(&site));
            sites.push(site);
        }
        if sites.is_empty() {
            return Err(CatalogError::Empty);
        }
        Ok(Self { sites, by_link })
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    /// Flat iteration in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<CandidateSite>> {
        self.sites.iter()
    }

    pub fn get(&self, id: SiteId) -> Option<&Arc<CandidateSite>> {
        self.sites.get(id.0 as usize)
    }

    /// Link names carrying at least one site, in sorted order.
    pub fn link_names(&self) -> impl Iterator<Item = &str> {
        self.by_link.keys().map(String::as_str)
    }

    pub fn sites_on_link(&self, link_name: &str) -> &[Arc<CandidateSite>] {
        self.by_link.get(link_name).map_or(&[], Vec::as_slice)
    }

    /// Uniform draw of `n` sites with replacement, for seeding hypotheses.
    pub fn draw_uniform(&self, n: usize, rng: &mut StdRng) -> Vec<Arc<CandidateSite>> {
        (0..n)
            .map(|_| Arc::clone(&self.sites[rng.gen_range(0..self.sites.len())]))
            .collect()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::KinematicTree;
    use approx::assert_relative_eq;
    use rand::SeedableRng;

    fn model() -> KinematicTree {
        KinematicTree::from_urdf_str(
            r#"<robot name="r">
                 <link name="base"/>
                 <link name="arm"/>
                 <joint name="j" type="revolute">
                   <origin xyz="0.2 0 0"/>
                   <axis xyz="0 0 1"/>
                   <parent link="base"/>
                   <child link="arm"/>
                 </joint>
               </robot>"#,
        )
        .expect("parse")
    }

    fn catalog(model: &KinematicTree) -> SurfaceCatalog {
        SurfaceCatalog::from_entries(
            [
                ("arm", Point3::new(0.1, 0.0, 0.0), Vector3::new(0.0, 1.0, 0.0)),
                ("arm", Point3::new(0.2, 0.0, 0.0), Vector3::new(0.0, 0.0, 3.0)),
                ("base", Point3::new(0.0, 0.1, 0.0), Vector3::new(1.0, 0.0, 0.0)),
            ],
            model,
        )
        .expect("catalog")
    }

    #[test]
    fn normals_are_unit_after_load() {
        let m = model();
        let cat = catalog(&m);
        for site in cat.iter() {
            assert_relative_eq!(site.normal.norm(), 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn cone_edges_have_unit_axis_component_before_rotation() {
        let edges = friction_cone_edges(DEFAULT_MU);
        for c in 0..FRICTION_CONE_EDGES {
            assert_relative_eq!(edges[(2, c)], 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn rotated_cone_axis_aligns_with_normal() {
        let m = model();
        let cat = catalog(&m);
        for site in cat.iter() {
            // the four canonical edges sum to (0, 0, 4); rotation carries
            // that onto 4·normal
            let mut sum = Vector3::zeros();
            for c in 0..FRICTION_CONE_EDGES {
                sum += Vector3::new(
                    site.friction_cone[(0, c)],
                    site.friction_cone[(1, c)],
                    site.friction_cone[(2, c)],
                );
            }
            let axis = sum / 4.0;
            assert_relative_eq!(axis.x, site.normal.x, epsilon = 1e-10);
            assert_relative_eq!(axis.y, site.normal.y, epsilon = 1e-10);
            assert_relative_eq!(axis.z, site.normal.z, epsilon = 1e-10);
        }
    }

    #[test]
    fn wrench_basis_torque_is_position_cross_force() {
        let m = model();
        let cat = catalog(&m);
        let site = cat.get(SiteId(0)).expect("site");
        for c in 0..FRICTION_CONE_EDGES {
            let force = Vector3::new(
                site.wrench_basis[(3, c)],
                site.wrench_basis[(4, c)],
                site.wrench_basis[(5, c)],
            );
            let torque = site.position.coords.cross(&force);
            for r in 0..3 {
                assert_relative_eq!(site.wrench_basis[(r, c)], torque[r], epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn antiparallel_normal_still_builds() {
        let m = model();
        let site = CandidateSite::new(
            SiteId(9),
            m.link_id("arm").expect("id"),
            "arm",
            Point3::origin(),
            Vector3::new(0.0, 0.0, -1.0),
            DEFAULT_MU,
        )
        .expect("site");
        // cone axis must point along -z
        let mut sum = Vector3::zeros();
        for c in 0..FRICTION_CONE_EDGES {
            sum += Vector3::new(
                site.friction_cone[(0, c)],
                site.friction_cone[(1, c)],
                site.friction_cone[(2, c)],
            );
        }
        assert_relative_eq!(sum.z / 4.0, -1.0, epsilon = 1e-12);
    }

    #[test]
    fn rejects_unknown_link_and_zero_normal() {
        let m = model();
        let unknown = SurfaceCatalog::from_entries(
            [("wrist", Point3::origin(), Vector3::z())],
            &m,
        );
        assert!(matches!(unknown, Err(CatalogError::UnknownLink(_))));

        let degenerate = SurfaceCatalog::from_entries(
            [("arm", Point3::origin(), Vector3::zeros())],
            &m,
        );
        assert!(matches!(degenerate, Err(CatalogError::ZeroNormal(_))));
    }

    #[test]
    fn uniform_draw_returns_requested_count() {
        let m = model();
        let cat = catalog(&m);
        let mut rng = StdRng::seed_from_u64(7);
        let drawn = cat.draw_uniform(25, &mut rng);
        assert_eq!(drawn.len(), 25);
        assert!(drawn.iter().all(|s| (s.id.0 as usize) < cat.len()));
    }

    #[test]
    fn lookup_by_link() {
        let m = model();
        let cat = catalog(&m);
        assert_eq!(cat.sites_on_link("arm").len(), 2);
        assert_eq!(cat.sites_on_link("base").len(), 1);
        assert!(cat.sites_on_link("nothing").is_empty());
        let links: Vec<&str> = cat.link_names().collect();
        assert_eq!(links, vec!["arm", "base"]);
    }
}
