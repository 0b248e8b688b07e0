//! Mock provider for testing and development.
//!
//! Completes every call through [`super::callback`] from a spawned task, the
//! way an async SDK invokes its completion handler from its own thread pool.

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use super::callback;
use super::{Provider, ResourceHandle, ResourceSpec};
use crate::error::ProviderError;

/// Mock provider with scripted outcomes.
///
/// Scripted failures are consumed front to back; once a script is empty,
/// calls succeed.
pub struct MockProvider {
    name: String,
    create_script: Mutex<VecDeque<ProviderError>>,
    destroy_script: Mutex<VecDeque<ProviderError>>,
    create_latency: Duration,
    destroy_latency: Duration,
    healthy: AtomicBool,
    instance_counter: AtomicU32,
    create_calls: AtomicU32,
    destroy_calls: AtomicU32,
    health_calls: AtomicU32,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            name: "mock".to_string(),
            create_script: Mutex::new(VecDeque::new()),
            destroy_script: Mutex::new(VecDeque::new()),
            create_latency: Duration::ZERO,
            destroy_latency: Duration::ZERO,
            healthy: AtomicBool::new(true),
            instance_counter: AtomicU32::new(0),
            create_calls: AtomicU32::new(0),
            destroy_calls: AtomicU32::new(0),
            health_calls: AtomicU32::new(0),
        }
    }

    /// Fail the next create calls with these errors, in order.
    pub fn fail_creates(self, errors: impl IntoIterator<Item = ProviderError>) -> Self {
        lock(&self.create_script).extend(errors);
        self
    }

    /// Fail the next destroy calls with these errors, in order.
    pub fn fail_destroys(self, errors: impl IntoIterator<Item = ProviderError>) -> Self {
        lock(&self.destroy_script).extend(errors);
        self
    }

    pub fn with_create_latency(mut self, latency: Duration) -> Self {
        self.create_latency = latency;
        self
    }

    pub fn with_destroy_latency(mut self, latency: Duration) -> Self {
        self.destroy_latency = latency;
        self
    }

    /// Make subsequent health checks report healthy or not.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn create_calls(&self) -> u32 {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn destroy_calls(&self) -> u32 {
        self.destroy_calls.load(Ordering::SeqCst)
    }

    pub fn health_calls(&self) -> u32 {
        self.health_calls.load(Ordering::SeqCst)
    }

    fn next_instance(&self) -> ResourceHandle {
        let n = self.instance_counter.fetch_add(1, Ordering::SeqCst);
        ResourceHandle {
            provider_instance_id: format!("i-{:017x}", n),
            address: IpAddr::V4(Ipv4Addr::new(10, 0, (n >> 8) as u8, (n & 0xff) as u8)),
        }
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create_resource(&self, spec: &ResourceSpec) -> Result<ResourceHandle, ProviderError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        info!(
            image_id = %spec.image_id,
            instance_type = %spec.instance_type,
            "[MOCK] Creating instance"
        );

        let outcome = match lock(&self.create_script).pop_front() {
            Some(error) => Err(error),
            None => Ok(self.next_instance()),
        };

        let (done, pending) = callback::completion();
        let latency = self.create_latency;
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            done.complete(outcome);
        });

        pending.await
    }

    async fn destroy_resource(&self, handle: &ResourceHandle) -> Result<(), ProviderError> {
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);
        info!(
            instance_id = %handle.provider_instance_id,
            "[MOCK] Terminating instance"
        );

        let outcome = match lock(&self.destroy_script).pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        };

        let (done, pending) = callback::completion();
        let latency = self.destroy_latency;
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            done.complete(outcome);
        });

        pending.await
    }

    async fn check_health(&self, handle: &ResourceHandle) -> Result<bool, ProviderError> {
        self.health_calls.fetch_add(1, Ordering::SeqCst);
        debug!(
            instance_id = %handle.provider_instance_id,
            "[MOCK] Checking instance health"
        );

        Ok(self.healthy.load(Ordering::SeqCst))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
