//! Minimal URDF reader.
//!
//! Only the kinematic subset the filter needs: `<link>` names and
//! `<joint type="revolute|continuous|fixed">` with `<origin>`, `<axis>`,
//! `<parent>`, `<child>`. Inertial, visual, collision, limit, and mimic
//! elements are skipped.

use super::ModelError;
use nalgebra::Vector3;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum UrdfJointKind {
    Revolute,
    Fixed,
}

#[derive(Debug, Clone)]
pub(super) struct UrdfJoint {
    pub name: String,
    pub kind: UrdfJointKind,
    pub parent: String,
    pub child: String,
    pub origin_xyz: Vector3<f64>,
    pub origin_rpy: Vector3<f64>,
    pub axis: Vector3<f64>,
}

#[derive(Debug, Clone)]
pub(super) struct UrdfRobot {
    pub links: Vec<String>,
    pub joints: Vec<UrdfJoint>,
}

fn attr(e: &BytesStart<'_>, name: &str) -> Result<Option<String>, ModelError> {
    let found = e
        .try_get_attribute(name)
        .map_err(|err| ModelError::Urdf(err.to_string()))?;
    match found {
        Some(a) => {
            let value = a
                .unescape_value()
                .map_err(|err| ModelError::Urdf(err.to_string()))?;
            Ok(Some(value.into_owned()))
        }
        None => Ok(None),
    }
}

fn required_attr(e: &BytesStart<'_>, name: &str, context: &str) -> Result<String, ModelError> {
    attr(e, name)?
        .ok_or_else(|| ModelError::Urdf(format!("<{context}> is missing the '{name}' attribute")))
}

fn parse_vec3(text: &str, context: &str) -> Result<Vector3<f64>, ModelError> {
    let parts: Vec<f64> = text
        .split_whitespace()
        .map(|t| {
            t.parse::<f64>()
                .map_err(|_| ModelError::Urdf(format!("bad number '{t}' in {context}")))
        })
        .collect::<Result<_, _>>()?;
    if parts.len() != 3 {
        return Err(ModelError::Urdf(format!(
            "{context} expects 3 components, got {}",
            parts.len()
        )));
    }
    Ok(Vector3::new(parts[0], parts[1], parts[2]))
}

struct PendingJoint {
    name: String,
    kind: UrdfJointKind,
    parent: Option<String>,
    child: Option<String>,
    origin_xyz: Vector3<f64>,
    origin_rpy: Vector3<f64>,
    axis: Vector3<f64>,
}

impl PendingJoint {
    fn new(name: String, kind: UrdfJointKind) -> Self {
        Self {
            name,
            kind,
            parent: None,
            child: None,
            origin_xyz: Vector3::zeros(),
            origin_rpy: Vector3::zeros(),
            // URDF default axis
            axis: Vector3::x(),
        }
    }

    fn finish(self) -> Result<UrdfJoint, ModelError> {
        let parent = self
            .parent
            .ok_or_else(|| ModelError::Urdf(format!("joint '{}' has no <parent>", self.name)))?;
        let child = self
            .child
            .ok_or_else(|| ModelError::Urdf(format!("joint '{}' has no <child>", self.name)))?;
        Ok(UrdfJoint {
            name: self.name,
            kind: self.kind,
            parent,
            child,
            origin_xyz: self.origin_xyz,
            origin_rpy: self.origin_rpy,
            axis: self.axis,
        })
    }
}

pub(super) fn parse(text: &str) -> Result<UrdfRobot, ModelError> {
    let mut reader = Reader::from_str(text);

    let mut links = Vec::new();
    let mut joints = Vec::new();
    let mut joint: Option<PendingJoint> = None;

    loop {
        let event = reader.read_event().map_err(|e| {
            ModelError::Urdf(format!("XML error at byte {}: {e}", reader.buffer_position()))
        })?;
        match event {
            Event::Start(ref e) | Event::Empty(ref e) => match e.name().as_ref() {
                b"link" if joint.is_none() => {
                    links.push(required_attr(e, "name", "link")?);
                }
                b"joint" if joint.is_none() => {
                    let name = required_attr(e, "name", "joint")?;
                    let kind = match required_attr(e, "type", "joint")?.as_str() {
                        "revolute" | "continuous" => UrdfJointKind::Revolute,
                        "fixed" => UrdfJointKind::Fixed,
                        other => return Err(ModelError::UnsupportedJoint(other.to_string())),
                    };
                    let pending = PendingJoint::new(name, kind);
                    if matches!(event, Event::Empty(_)) {
                        // a self-closing joint can never carry parent/child
                        return Err(ModelError::Urdf(format!(
                            "joint '{}' has no <parent>",
                            pending.name
                        )));
                    }
                    joint = Some(pending);
                }
                b"origin" => {
                    if let Some(j) = joint.as_mut() {
                        if let Some(xyz) = attr(e, "xyz")? {
                            j.origin_xyz = parse_vec3(&xyz, "origin xyz")?;
                        }
                        if let Some(rpy) = attr(e, "rpy")? {
                            j.origin_rpy = parse_vec3(&rpy, "origin rpy")?;
                        }
                    }
                }
                b"axis" => {
                    if let Some(j) = joint.as_mut() {
                        if let Some(xyz) = attr(e, "xyz")? {
                            j.axis = parse_vec3(&xyz, "axis xyz")?;
                        }
                    }
                }
                b"parent" => {
                    if let Some(j) = joint.as_mut() {
                        j.parent = Some(required_attr(e, "link", "parent")?);
                    }
                }
                b"child" => {
                    if let Some(j) = joint.as_mut() {
                        j.child = Some(required_attr(e, "link", "child")?);
                    }
                }
                _ => {}
            },
            Event::End(ref e) => {
                if e.name().as_ref() == b"joint" {
                    if let Some(pending) = joint.take() {
                        joints.push(pending.finish()?);
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if links.is_empty() {
        return Err(ModelError::Urdf("no <link> elements found".to_string()));
    }
    Ok(UrdfRobot { links, joints })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_joints_with_defaults() {
        let robot = parse(
            r#"<robot name="r">
                 <link name="a"/>
                 <link name="b"/>
                 <joint name="j" type="revolute">
                   <parent link="a"/>
                   <child link="b"/>
                 </joint>
               </robot>"#,
        )
        .expect("parse");
        assert_eq!(robot.links, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(robot.joints.len(), 1);
        let j = &robot.joints[0];
        assert_eq!(j.kind, UrdfJointKind::Revolute);
        // default origin and axis
        assert_eq!(j.origin_xyz, Vector3::zeros());
        assert_eq!(j.axis, Vector3::x());
    }

    #[test]
    fn skips_visual_geometry() {
        let robot = parse(
            r#"<robot name="r">
                 <link name="a">
                   <visual><geometry><box size="1 1 1"/></geometry></visual>
                 </link>
               </robot>"#,
        )
        .expect("parse");
        assert_eq!(robot.links, vec!["a".to_string()]);
        assert!(robot.joints.is_empty());
    }

    #[test]
    fn rejects_prismatic() {
        let err = parse(
            r#"<robot name="r">
                 <link name="a"/>
                 <link name="b"/>
                 <joint name="j" type="prismatic">
                   <parent link="a"/>
                   <child link="b"/>
                 </joint>
               </robot>"#,
        )
        .expect_err("must reject");
        assert!(matches!(err, ModelError::UnsupportedJoint(ref k) if k == "prismatic"));
    }

    #[test]
    fn rejects_joint_without_child() {
        let err = parse(
            r#"<robot name="r">
                 <link name="a"/>
                 <joint name="j" type="fixed">
                   <parent link="a"/>
                 </joint>
               </robot>"#,
        )
        .expect_err("must reject");
        assert!(err.to_string().contains("no <child>"));
    }
}
