//! The disks attached to compute nodes

/// A disk attached to a node
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Disk {
    /// The cloud id of this disk
    pub id: String,
    /// The size of this disk in GiB
    pub size: u64,
    /// The region this disk lives in
    #[serde(default)]
    pub region_id: Option<u64>,
    /// When this disk was created
    #[serde(default)]
    pub created: Option<chrono::DateTime<chrono::Utc>>,
}

impl Disk {
    /// Create a new disk
    ///
    /// # Arguments
    ///
    /// * `id` - The cloud id of this disk
    /// * `size` - The size of this disk in GiB
    pub fn new<T: Into<String>>(id: T, size: u64) -> Self {
        Disk {
            id: id.into(),
            size,
            region_id: None,
            created: None,
        }
    }
}
