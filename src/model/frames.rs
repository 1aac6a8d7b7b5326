//! Per-step snapshot of link frames.
//!
//! The driver refreshes this once at the top of every step; everything
//! downstream (proposal, best averaging, estimate assembly) reads from the
//! snapshot instead of re-querying the model.

use super::{LinkId, RigidBodyModel};
use nalgebra::Isometry3;

#[derive(Debug, Clone, Default)]
pub struct LinkFrameCache {
    frames: Vec<Isometry3<f64>>,
}

impl LinkFrameCache {
    pub fn new() -> Self {
        Self { frames: Vec::new() }
    }

    /// Snapshot every link's world-from-link isometry at the model's current
    /// configuration.
    pub fn refresh(&mut self, model: &dyn RigidBodyModel) {
        self.frames.clear();
        self.frames
            .extend((0..model.num_links()).map(|i| model.link_to_world(LinkId(i))));
    }

    pub fn world_from_link(&self, id: LinkId) -> Isometry3<f64> {
        self.frames[id.0]
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::KinematicTree;
    use nalgebra::DVector;

    #[test]
    fn snapshot_is_stable_after_model_moves() {
        let urdf = r#"
            <robot name="one">
              <link name="base"/>
              <link name="arm"/>
              <joint name="j" type="revolute">
                <origin xyz="1 0 0"/>
                <axis xyz="0 0 1"/>
                <parent link="base"/>
                <child link="arm"/>
              </joint>
            </robot>"#;
        let mut model = KinematicTree::from_urdf_str(urdf).expect("parse");
        let mut cache = LinkFrameCache::new();
        cache.refresh(&model);
        let arm = model.link_id("arm").expect("id");
        let before = cache.world_from_link(arm);

        // moving the model must not disturb the snapshot
        model
            .set_joint_positions(&DVector::from_vec(vec![1.0]))
            .expect("set q");
        let after = cache.world_from_link(arm);
        assert_eq!(before, after);
        assert_eq!(cache.len(), 2);
    }
}
