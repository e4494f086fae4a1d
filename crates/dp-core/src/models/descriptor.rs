use serde::Deserialize;

/// Optional `deploy.yml` at the root of a project.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeployDescriptor {
    #[serde(default)]
    pub app: AppDescriptor,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppDescriptor {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_node_version", deserialize_with = "version_string")]
    pub node_version: String,
    #[serde(default)]
    pub build_command: Option<String>,
    #[serde(default)]
    pub start_command: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

impl Default for AppDescriptor {
    fn default() -> Self {
        Self {
            name: None,
            node_version: default_node_version(),
            build_command: None,
            start_command: None,
            port: None,
        }
    }
}

fn default_node_version() -> String {
    "18".to_string()
}

/// Accept `node_version: 20` as well as `node_version: "20"`.
fn version_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Int(u64),
        Float(f64),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(s) => s,
        Raw::Int(n) => n.to_string(),
        Raw::Float(f) => f.to_string(),
    })
}
