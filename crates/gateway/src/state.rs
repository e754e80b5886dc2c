//! Shared application state: the composition root owns the stores, caches
//! and workflow registries; handlers and pipeline fibers borrow them
//! through cheap clones.

use std::collections::HashMap;
use std::sync::Arc;

use fp_domain::config::Config;
use fp_imaging::draw::OsdFont;
use fp_infer::InferenceClient;
use fp_store::frs::FrsStore;
use fp_store::lprs::LprsStore;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::frs::caches::FrsCaches;
use crate::frs::{DnnStats, UnknownDescriptor};
use crate::lprs::ban::BanRegistry;
use crate::lprs::caches::LprsCaches;
use crate::workflow::WorkflowRegistry;

pub struct FrsRuntime {
    pub store: FrsStore,
    pub caches: FrsCaches,
    pub workflows: WorkflowRegistry,
    /// Per-stream rings of recently seen unknown faces (spawned-descriptor
    /// candidates). Guarded accesses only; never held across await.
    pub unknown_descriptors: Mutex<HashMap<i32, Vec<UnknownDescriptor>>>,
    /// Per-stream inference counters, persisted across restarts.
    pub dnn_stats: Mutex<HashMap<i32, DnnStats>>,
    pub osd_font: Option<OsdFont>,
}

pub struct LprsRuntime {
    pub store: LprsStore,
    pub caches: LprsCaches,
    pub workflows: WorkflowRegistry,
    pub bans: BanRegistry,
}

/// Cloneable handle passed to every API handler and pipeline fiber.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// Shared outbound HTTP client (frame fetch, callbacks).
    pub http: reqwest::Client,
    pub infer: InferenceClient,
    pub frs: Arc<FrsRuntime>,
    pub lprs: Arc<LprsRuntime>,
    /// Cancelled first on shutdown: wakes interruptible sleeps and stops
    /// pipeline re-arming.
    pub shutdown: CancellationToken,
    /// Tracks detached pipeline fibers so shutdown can join them.
    pub tracker: TaskTracker,
}
