//! Cloud provider interface.
//!
//! The node manager never talks to a cloud API directly. It sequences calls
//! to a [`Provider`], and everything about how instances are actually
//! launched stays behind this trait.

pub mod callback;
mod mock;

use std::net::IpAddr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

pub use mock::MockProvider;

/// What to provision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// Machine image to boot.
    pub image_id: String,

    /// Provider instance type.
    pub instance_type: String,
}

impl ResourceSpec {
    pub fn new(image_id: impl Into<String>) -> Self {
        Self {
            image_id: image_id.into(),
            instance_type: "m1.small".to_string(),
        }
    }

    pub fn with_instance_type(mut self, instance_type: impl Into<String>) -> Self {
        self.instance_type = instance_type.into();
        self
    }
}

/// A provisioned instance.
///
/// Not `Clone`: the supervisor that created it is the only owner and the
/// only one allowed to destroy it.
#[derive(Debug, PartialEq, Eq)]
pub struct ResourceHandle {
    /// Provider-assigned instance ID.
    pub provider_instance_id: String,

    /// Where the worker process listens.
    pub address: IpAddr,
}

/// Cloud provider operations used by a worker node supervisor.
#[async_trait]
pub trait Provider: Send + Sync + 'static {
    /// Dependency name for circuit breaking and logs.
    fn name(&self) -> &str;

    /// Launch exactly one instance for `spec`.
    async fn create_resource(&self, spec: &ResourceSpec) -> Result<ResourceHandle, ProviderError>;

    /// Terminate the instance behind `handle`.
    async fn destroy_resource(&self, handle: &ResourceHandle) -> Result<(), ProviderError>;

    /// Out-of-band health probe (instance status checks).
    async fn check_health(&self, handle: &ResourceHandle) -> Result<bool, ProviderError>;
}
