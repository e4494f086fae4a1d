pub mod descriptor_loader;
pub mod docker;
pub mod git;
pub mod image_spec;
pub mod inventory;
pub mod pipeline;
pub mod platform;
pub mod port_detector;
pub mod ports;
pub mod provisioner;
pub mod reconciler;
pub mod remote;
pub mod scheduler;
pub mod sql_admin;
pub mod state;
pub mod supervisor;
pub mod transport;
