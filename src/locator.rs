//! Closest-point surface lookup and the candidate-site adapter.
//!
//! [`SurfaceLocator`] is the seam to the external skin-mesh service: one
//! query, world point in, nearest surface point + normal + owning link out.
//! [`SiteFactory`] turns a locator answer into a fully-formed
//! [`CandidateSite`] with the same precomputation the catalog does at load.
//! Neither caches anything; frames change every step.
//!
//! [`CatalogLocator`] is the built-in reference implementation that snaps
//! to the nearest catalog site, for deployments without a mesh service.

use crate::catalog::{CandidateSite, CatalogError, SiteId, SurfaceCatalog, DEFAULT_MU};
use crate::model::{LinkFrameCache, LinkId};
use nalgebra::{Point3, Vector3};
use std::cell::Cell;
use std::sync::Arc;

/// Answer from a closest-point query, all in world coordinates.
#[derive(Debug, Clone)]
pub struct ClosestPoint {
    pub link: LinkId,
    pub link_name: String,
    pub point_world: Point3<f64>,
    pub normal_world: Vector3<f64>,
}

/// External closest-point service over the robot's skin.
pub trait SurfaceLocator: Send {
    /// Nearest surface point to `point`. `None` when the service has no
    /// answer (empty mesh, out-of-range query).
    fn find_closest_point(
        &self,
        point: &Point3<f64>,
        frames: &LinkFrameCache,
    ) -> Option<ClosestPoint>;
}

// ============================================================================
// Catalog-Backed Locator
// ============================================================================

/// Snaps queries to the nearest catalog site. Coarse but mesh-free.
pub struct CatalogLocator {
    catalog: Arc<SurfaceCatalog>,
}

impl CatalogLocator {
    pub fn new(catalog: Arc<SurfaceCatalog>) -> Self {
        Self { catalog }
    }
}

impl SurfaceLocator for CatalogLocator {
    fn find_closest_point(
        &self,
        point: &Point3<f64>,
        frames: &LinkFrameCache,
    ) -> Option<ClosestPoint> {
        let mut best: Option<(f64, &Arc<CandidateSite>)> = None;
        for site in self.catalog.iter() {
            let d2 = (site.world_position(frames) - point).norm_squared();
            if best.map_or(true, |(bd, _)| d2 < bd) {
                best = Some((d2, site));
            }
        }
        best.map(|(_, site)| ClosestPoint {
            link: site.link,
            link_name: site.link_name.clone(),
            point_world: site.world_position(frames),
            normal_world: site.world_normal(frames),
        })
    }
}

// ============================================================================
// Site Factory
// ============================================================================

/// Builds candidate sites from locator answers.
///
/// Ids continue above the catalog range so adapter-born sites never collide
/// with catalog ids in the per-pass solution cache.
pub struct SiteFactory {
    next_id: Cell<u32>,
    mu: f64,
}

impl SiteFactory {
    pub fn new(first_free_id: u32) -> Self {
        Self {
            next_id: Cell::new(first_free_id),
            mu: DEFAULT_MU,
        }
    }

    /// Convert a world-frame locator answer into a link-frame candidate
    /// site with rotated cone and wrench basis.
    ///
    /// A zero-norm normal from the service is an invalid site and surfaces
    /// as an error; callers replace the particle with a fresh motion draw.
    pub fn site_from_closest(
        &self,
        closest: &ClosestPoint,
        frames: &LinkFrameCache,
    ) -> Result<Arc<CandidateSite>, CatalogError> {
        let world_from_link = frames.world_from_link(closest.link);
        let position = world_from_link.inverse_transform_point(&closest.point_world);
        let normal = world_from_link.inverse_transform_vector(&closest.normal_world);

        let id = SiteId(self.next_id.get());
        let site = CandidateSite::new(
            id,
            closest.link,
            closest.link_name.clone(),
            position,
            normal,
            self.mu,
        )?;
        self.next_id.set(self.next_id.get().wrapping_add(1));
        Ok(Arc::new(site))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{KinematicTree, RigidBodyModel};
    use approx::assert_relative_eq;
    use nalgebra::DVector;

    fn setup() -> (KinematicTree, Arc<SurfaceCatalog>, LinkFrameCache) {
        let mut model = KinematicTree::from_urdf_str(
            r#"<robot name="r">
                 <link name="base"/>
                 <link name="arm"/>
                 <joint name="j" type="revolute">
                   <origin xyz="0.4 0 0"/>
                   <axis xyz="0 0 1"/>
                   <parent link="base"/>
                   <child link="arm"/>
                 </joint>
               </robot>"#,
        )
        .expect("parse");
        model
            .set_joint_positions(&DVector::from_vec(vec![0.6]))
            .expect("set q");
        let catalog = Arc::new(
            SurfaceCatalog::from_entries(
                [
                    ("base", Point3::new(0.0, 0.0, 0.1), Vector3::z()),
                    ("arm", Point3::new(0.2, 0.0, 0.0), Vector3::y()),
                    ("arm", Point3::new(0.3, 0.1, 0.0), Vector3::y()),
                ],
                &model,
            )
            .expect("catalog"),
        );
        let mut frames = LinkFrameCache::new();
        frames.refresh(&model);
        (model, catalog, frames)
    }

    #[test]
    fn locator_returns_nearest_site() {
        let (_model, catalog, frames) = setup();
        let locator = CatalogLocator::new(Arc::clone(&catalog));
        let target = catalog.get(SiteId(1)).expect("site").world_position(&frames);
        let query = target + Vector3::new(0.01, -0.02, 0.005);
        let found = locator
            .find_closest_point(&query, &frames)
            .expect("closest point");
        assert_eq!(found.link_name, "arm");
        assert_relative_eq!((found.point_world - target).norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn factory_round_trips_world_to_link_frame() {
        let (_model, catalog, frames) = setup();
        let locator = CatalogLocator::new(Arc::clone(&catalog));
        let factory = SiteFactory::new(u32::try_from(catalog.len()).expect("fits"));

        let original = catalog.get(SiteId(2)).expect("site");
        let found = locator
            .find_closest_point(&original.world_position(&frames), &frames)
            .expect("closest point");
        let rebuilt = factory
            .site_from_closest(&found, &frames)
            .expect("site");

        // fresh identity above the catalog range, same geometry
        assert_eq!(rebuilt.id, SiteId(3));
        assert_relative_eq!(
            (rebuilt.position - original.position).norm(),
            0.0,
            epsilon = 1e-10
        );
        assert_relative_eq!(
            (rebuilt.normal.into_inner() - original.normal.into_inner()).norm(),
            0.0,
            epsilon = 1e-10
        );
    }

    #[test]
    fn factory_rejects_zero_normal() {
        let (model, catalog, frames) = setup();
        let factory = SiteFactory::new(u32::try_from(catalog.len()).expect("fits"));
        let bogus = ClosestPoint {
            link: model.link_id("arm").expect("id"),
            link_name: "arm".to_string(),
            point_world: Point3::origin(),
            normal_world: Vector3::zeros(),
        };
        assert!(matches!(
            factory.site_from_closest(&bogus, &frames),
            Err(CatalogError::ZeroNormal(_))
        ));
        // the failed build must not burn an id
        let ok = ClosestPoint {
            normal_world: Vector3::y(),
            ..bogus
        };
        let site = factory.site_from_closest(&ok, &frames).expect("site");
        assert_eq!(site.id, SiteId(3));
    }
}
