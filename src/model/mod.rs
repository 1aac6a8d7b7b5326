//! Rigid-body model seam.
//!
//! The filter only ever talks to [`RigidBodyModel`]: joint ordering, forward
//! kinematics, and geometric Jacobians at the current configuration. The
//! concrete [`KinematicTree`] implementation covers fixed-base serial/tree
//! robots loaded from a minimal URDF subset; a full dynamics engine can be
//! swapped in behind the same trait.

mod frames;
mod urdf;

pub use frames::LinkFrameCache;

use nalgebra::{DMatrix, DVector, Isometry3, Translation3, Unit, UnitQuaternion, Vector3};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("failed to read robot description {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("URDF parse error: {0}")]
    Urdf(String),

    #[error("unknown link '{0}'")]
    UnknownLink(String),

    #[error("joint position vector has length {got}, model has {expected} joints")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("unsupported joint type '{0}' (expected revolute, continuous, or fixed)")]
    UnsupportedJoint(String),
}

// ============================================================================
// Trait
// ============================================================================

/// Stable handle for a link. Issued densely from 0 at model load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub usize);

/// The filter's view of the robot.
///
/// `geometric_jacobian` returns the 6×n map from generalized velocities to
/// the link-frame twist, angular rows on top; its transpose maps a
/// link-frame wrench [torque; force] into generalized forces.
pub trait RigidBodyModel: Send {
    fn num_joints(&self) -> usize;

    /// Actuated joint names, in generalized-coordinate order.
    fn joint_names(&self) -> &[String];

    fn num_links(&self) -> usize;

    fn link_id(&self, name: &str) -> Option<LinkId>;

    fn link_name(&self, id: LinkId) -> &str;

    /// Put the model at configuration `q` and refresh forward kinematics.
    fn set_joint_positions(&mut self, q: &DVector<f64>) -> Result<(), ModelError>;

    /// World-from-link isometry at the current configuration.
    fn link_to_world(&self, id: LinkId) -> Isometry3<f64>;

    /// 6×n geometric Jacobian of `id`, expressed in the link frame,
    /// [angular; linear] row order.
    fn geometric_jacobian(&self, id: LinkId) -> DMatrix<f64>;
}

// ============================================================================
// Kinematic Tree
// ============================================================================

#[derive(Debug, Clone)]
enum JointKind {
    Fixed,
    Revolute { axis: Unit<Vector3<f64>> },
}

#[derive(Debug, Clone)]
struct Link {
    name: String,
    parent: Option<LinkId>,
    /// Parent-to-this transform at q = 0.
    origin: Isometry3<f64>,
    joint: JointKind,
    /// Index into `q` for revolute joints.
    q_index: Option<usize>,
}

/// Fixed-base tree of rigid links connected by revolute joints.
///
/// Links are stored topologically (parents before children), so one forward
/// pass refreshes all frames.
pub struct KinematicTree {
    links: Vec<Link>,
    link_index: HashMap<String, LinkId>,
    joint_names: Vec<String>,
    q: DVector<f64>,
    world_from_link: Vec<Isometry3<f64>>,
}

impl KinematicTree {
    /// Load from a URDF file. Only the kinematic subset is read: links,
    /// revolute/continuous/fixed joints, origins, and axes.
    pub fn from_urdf_file(path: &Path) -> Result<Self, ModelError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ModelError::Io(path.to_path_buf(), e))?;
        Self::from_urdf_str(&contents)
    }

    /// Build from URDF text.
    pub fn from_urdf_str(text: &str) -> Result<Self, ModelError> {
        let robot = urdf::parse(text)?;
        Self::from_parts(robot)
    }

    fn from_parts(robot: urdf::UrdfRobot) -> Result<Self, ModelError> {
        // The root link is the one that never appears as a joint's child.
        let children: Vec<&str> = robot.joints.iter().map(|j| j.child.as_str()).collect();
        let root = robot
            .links
            .iter()
            .find(|l| !children.contains(&l.as_str()))
            .ok_or_else(|| ModelError::Urdf("no root link (kinematic loop?)".to_string()))?
            .clone();

        let mut links = vec![Link {
            name: root.clone(),
            parent: None,
            origin: Isometry3::identity(),
            joint: JointKind::Fixed,
            q_index: None,
        }];
        let mut link_index = HashMap::new();
        link_index.insert(root, LinkId(0));
        let mut joint_names = Vec::new();

        // Attach joints breadth-first so parents always precede children.
        let mut remaining: Vec<&urdf::UrdfJoint> = robot.joints.iter().collect();
        while !remaining.is_empty() {
            let before = remaining.len();
            remaining.retain(|j| {
                let Some(&parent) = link_index.get(&j.parent) else {
                    return true;
                };
                let origin = Isometry3::from_parts(
                    Translation3::from(j.origin_xyz),
                    UnitQuaternion::from_euler_angles(
                        j.origin_rpy.x,
                        j.origin_rpy.y,
                        j.origin_rpy.z,
                    ),
                );
                let (joint, q_index) = match j.kind {
                    urdf::UrdfJointKind::Fixed => (JointKind::Fixed, None),
                    urdf::UrdfJointKind::Revolute => {
                        joint_names.push(j.name.clone());
                        (
                            JointKind::Revolute {
                                axis: Unit::new_normalize(j.axis),
                            },
                            Some(joint_names.len() - 1),
                        )
                    }
                };
                let id = LinkId(links.len());
                links.push(Link {
                    name: j.child.clone(),
                    parent: Some(parent),
                    origin,
                    joint,
                    q_index,
                });
                link_index.insert(j.child.clone(), id);
                false
            });
            if remaining.len() == before {
                let orphans: Vec<_> = remaining.iter().map(|j| j.name.as_str()).collect();
                return Err(ModelError::Urdf(format!(
                    "joints with unreachable parents: {}",
                    orphans.join(", ")
                )));
            }
        }

        let n = joint_names.len();
        let mut tree = Self {
            world_from_link: vec![Isometry3::identity(); links.len()],
            links,
            link_index,
            joint_names,
            q: DVector::zeros(n),
        };
        tree.refresh_kinematics();
        Ok(tree)
    }

    fn refresh_kinematics(&mut self) {
        for i in 0..self.links.len() {
            let link = &self.links[i];
            let local = match (&link.joint, link.q_index) {
                (JointKind::Revolute { axis }, Some(qi)) => {
                    link.origin
                        * Isometry3::from_parts(
                            Translation3::identity(),
                            UnitQuaternion::from_axis_angle(axis, self.q[qi]),
                        )
                }
                _ => link.origin,
            };
            let parent_frame = match link.parent {
                Some(LinkId(p)) => self.world_from_link[p],
                None => Isometry3::identity(),
            };
            self.world_from_link[i] = parent_frame * local;
        }
    }
}

impl RigidBodyModel for KinematicTree {
    fn num_joints(&self) -> usize {
        self.joint_names.len()
    }

    fn joint_names(&self) -> &[String] {
        &self.joint_names
    }

    fn num_links(&self) -> usize {
        self.links.len()
    }

    fn link_id(&self, name: &str) -> Option<LinkId> {
        self.link_index.get(name).copied()
    }

    fn link_name(&self, id: LinkId) -> &str {
        &self.links[id.0].name
    }

    fn set_joint_positions(&mut self, q: &DVector<f64>) -> Result<(), ModelError> {
        if q.len() != self.q.len() {
            return Err(ModelError::DimensionMismatch {
                expected: self.q.len(),
                got: q.len(),
            });
        }
        self.q.copy_from(q);
        self.refresh_kinematics();
        Ok(())
    }

    fn link_to_world(&self, id: LinkId) -> Isometry3<f64> {
        self.world_from_link[id.0]
    }

    fn geometric_jacobian(&self, id: LinkId) -> DMatrix<f64> {
        let n = self.joint_names.len();
        let mut jac = DMatrix::zeros(6, n);
        let t_wl = self.world_from_link[id.0];
        let r_lw = t_wl.rotation.inverse();
        let p_link = t_wl.translation.vector;

        let mut cursor = Some(id);
        while let Some(LinkId(i)) = cursor {
            let link = &self.links[i];
            if let (JointKind::Revolute { axis }, Some(qi)) = (&link.joint, link.q_index) {
                let t_wj = self.world_from_link[i];
                let axis_w = t_wj.rotation * axis.into_inner();
                let p_joint = t_wj.translation.vector;
                let angular = r_lw * axis_w;
                let linear = r_lw * axis_w.cross(&(p_link - p_joint));
                for row in 0..3 {
                    jac[(row, qi)] = angular[row];
                    jac[(row + 3, qi)] = linear[row];
                }
            }
            cursor = link.parent;
        }
        jac
    }
}

// ============================================================================
// Tests
// ============================================================================
