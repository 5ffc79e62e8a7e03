//! The instance a run requires or has been given

use crate::same;

/// The instance requirements for a run along with the node that fills them once assigned
///
/// Only the requirement fields take part in matching. The assignment fields (`node_id`,
/// `node_ip`, `node_name`) identify a concrete node and are ignored when deciding if an
/// existing node can be reused.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct InstanceProfile {
    /// The instance type to use
    #[serde(default)]
    pub node_type: Option<String>,
    /// The disk size requested in GiB
    #[serde(default)]
    pub disk: Option<u64>,
    /// The disk size actually attached in GiB
    #[serde(default)]
    pub effective_disk: Option<u64>,
    /// The image to boot this node from
    #[serde(default)]
    pub image: Option<String>,
    /// Whether this is a spot/preemptible instance
    #[serde(default)]
    pub spot: bool,
    /// The cloud region this node lives in
    #[serde(default)]
    pub region_id: Option<u64>,
    /// The platform this node runs workloads for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    /// The cloud id of the assigned node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    /// The ip of the assigned node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_ip: Option<String>,
    /// The Kubernetes name of the assigned node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
}

impl InstanceProfile {
    /// Create a new instance requirement
    ///
    /// # Arguments
    ///
    /// * `node_type` - The instance type to use
    /// * `disk` - The disk size to request
    /// * `image` - The image to boot from
    pub fn new<T: Into<String>, I: Into<String>>(node_type: T, disk: u64, image: I) -> Self {
        InstanceProfile {
            node_type: Some(node_type.into()),
            disk: Some(disk),
            effective_disk: Some(disk),
            image: Some(image.into()),
            ..Default::default()
        }
    }

    /// Set the effective disk size
    ///
    /// # Arguments
    ///
    /// * `effective_disk` - The disk size actually attached
    #[must_use]
    pub fn effective_disk(mut self, effective_disk: u64) -> Self {
        self.effective_disk = Some(effective_disk);
        self
    }

    /// Set whether this is a spot instance
    ///
    /// # Arguments
    ///
    /// * `spot` - Whether to use spot capacity
    #[must_use]
    pub fn spot(mut self, spot: bool) -> Self {
        self.spot = spot;
        self
    }

    /// Set the region for this instance
    ///
    /// # Arguments
    ///
    /// * `region_id` - The region to use
    #[must_use]
    pub fn region(mut self, region_id: u64) -> Self {
        self.region_id = Some(region_id);
        self
    }

    /// Set the platform for this instance
    ///
    /// # Arguments
    ///
    /// * `platform` - The platform to run workloads for
    #[must_use]
    pub fn platform<T: Into<String>>(mut self, platform: T) -> Self {
        self.platform = Some(platform.into());
        self
    }

    /// Set the concrete node that fills this requirement
    ///
    /// # Arguments
    ///
    /// * `node_id` - The cloud id of the node
    /// * `node_ip` - The ip of the node
    /// * `node_name` - The Kubernetes name of the node
    #[must_use]
    pub fn assigned<T: Into<String>>(mut self, node_id: T, node_ip: T, node_name: T) -> Self {
        self.node_id = Some(node_id.into());
        self.node_ip = Some(node_ip.into());
        self.node_name = Some(node_name.into());
        self
    }

    /// Check if another profile fills the same requirement as this one
    ///
    /// # Arguments
    ///
    /// * `other` - The profile to compare against
    pub fn matches(&self, other: &InstanceProfile) -> bool {
        same!(self.node_type, other.node_type);
        same!(self.disk, other.disk);
        same!(self.effective_disk, other.effective_disk);
        same!(self.image, other.image);
        same!(self.spot, other.spot);
        same!(self.region_id, other.region_id);
        same!(self.platform, other.platform);
        true
    }

    /// Get just the requirement half of this profile
    #[must_use]
    pub fn requirement(&self) -> Self {
        InstanceProfile {
            node_id: None,
            node_ip: None,
            node_name: None,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::InstanceProfile;

    fn profile() -> InstanceProfile {
        InstanceProfile::new("m5.large", 50, "pipeline/base:1")
            .effective_disk(80)
            .region(1)
    }

    #[test]
    fn assignment_fields_are_ignored() {
        let left = profile().assigned("i-0001", "10.0.0.1", "node-a");
        let right = profile().assigned("i-0002", "10.0.0.2", "node-b");
        assert!(left.matches(&right));
        assert!(right.matches(&profile()));
    }

    #[test]
    fn spot_flag_breaks_a_match() {
        assert!(!profile().matches(&profile().spot(true)));
    }

    #[test]
    fn platform_breaks_a_match() {
        assert!(!profile().matches(&profile().platform("windows")));
        assert!(profile().platform("linux").matches(&profile().platform("linux")));
    }

    #[test]
    fn missing_fields_only_match_missing_fields() {
        let mut missing = profile();
        missing.region_id = None;
        assert!(!missing.matches(&profile()));
        assert!(missing.matches(&missing.clone()));
    }

    #[test]
    fn requirement_strips_assignment() {
        let assigned = profile().assigned("i-0001", "10.0.0.1", "node-a");
        assert_eq!(assigned.requirement(), profile());
    }
}
