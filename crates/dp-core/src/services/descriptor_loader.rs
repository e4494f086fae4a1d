use std::path::Path;

use crate::error::{PlatformError, Result};
use crate::models::DeployDescriptor;

pub const DESCRIPTOR_FILENAME: &str = "deploy.yml";

/// Read `deploy.yml` from a project root. A missing file yields web-app
/// defaults; a malformed one is an error.
pub fn load(project_root: &Path) -> Result<DeployDescriptor> {
    let path = project_root.join(DESCRIPTOR_FILENAME);
    if !path.exists() {
        return Ok(DeployDescriptor::default());
    }
    let contents = std::fs::read_to_string(&path)?;
    if contents.trim().is_empty() {
        return Ok(DeployDescriptor::default());
    }
    let descriptor: DeployDescriptor =
        serde_yaml::from_str(&contents).map_err(|e| PlatformError::InvalidDescriptor {
            path: path.clone(),
            message: e.to_string(),
        })?;
    if descriptor.app.node_version.trim().is_empty() {
        return Err(PlatformError::InvalidDescriptor {
            path,
            message: "app.node_version must not be empty".into(),
        });
    }
    Ok(descriptor)
}
