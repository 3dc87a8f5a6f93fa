//! Two-phase holder for a client shared by several triggers
//!
//! The gateway is built once, under an initialization lock, and dependents
//! only ever see it after the `Uninitialized -> Ready` transition.

use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::{MarketDataError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Ready,
}

pub struct GatewayLifecycle<G: ?Sized> {
    init: Mutex<()>,
    ready: RwLock<Option<Arc<G>>>,
}

impl<G: ?Sized + Send + Sync> Default for GatewayLifecycle<G> {
    fn default() -> Self {
        Self::new()
    }
}

impl<G: ?Sized + Send + Sync> GatewayLifecycle<G> {
    pub fn new() -> Self {
        Self {
            init: Mutex::new(()),
            ready: RwLock::new(None),
        }
    }

    /// Build the gateway unless already ready; `build` runs at most once
    /// across concurrent callers
    ///
    /// Returns the gateway and whether this call performed the transition.
    pub async fn initialize<F, Fut>(&self, build: F) -> Result<(Arc<G>, bool)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<G>>>,
    {
        if let Ok(gateway) = self.get() {
            return Ok((gateway, false));
        }

        let _init = self.init.lock().await;
        if let Ok(gateway) = self.get() {
            return Ok((gateway, false));
        }

        let gateway = build().await?;
        *self.ready.write() = Some(Arc::clone(&gateway));
        info!("Order gateway ready");
        Ok((gateway, true))
    }

    pub fn get(&self) -> Result<Arc<G>> {
        self.ready
            .read()
            .clone()
            .ok_or(MarketDataError::GatewayNotReady)
    }

    pub fn state(&self) -> LifecycleState {
        if self.ready.read().is_some() {
            LifecycleState::Ready
        } else {
            LifecycleState::Uninitialized
        }
    }
}
