pub mod caller;
pub mod database;
pub mod deployment;
pub mod descriptor;
pub mod docker_host;
pub mod settings;

pub use caller::{Caller, Role};
pub use database::{DatabaseInstance, DatabaseKind, DatabaseServer, InstanceStatus};
pub use deployment::{Deployment, DeploymentStatus};
pub use descriptor::{AppDescriptor, DeployDescriptor};
pub use docker_host::{DockerHost, HostTarget};
pub use settings::{PlatformSettings, ProbeFailurePolicy, TimeoutSettings};
