//! Registry of loaded model versions

use crate::backend::{GenerateRequest, ModelBackend};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rill_types::{ModelConfig, Result, ServeError};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Future returned by a model loader.
pub type LoaderFuture = Pin<Box<dyn Future<Output = Result<Arc<dyn ModelBackend>>> + Send>>;

/// A registered capability to materialize a backend from a config.
pub type LoaderFn = Arc<dyn Fn(ModelConfig) -> LoaderFuture + Send + Sync>;

/// A published model version with its runtime counters.
pub struct LoadedModel {
    config: ModelConfig,
    backend: Arc<dyn ModelBackend>,
    loaded_at: DateTime<Utc>,
    last_health_ok: Mutex<Option<DateTime<Utc>>>,
    healthy: AtomicBool,
    requests: AtomicU64,
    errors: AtomicU64,
    tokens: AtomicU64,
}

impl std::fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModel")
            .field("config", &self.config)
            .field("loaded_at", &self.loaded_at)
            .field("healthy", &self.healthy.load(Ordering::Relaxed))
            .field("requests", &self.requests.load(Ordering::Relaxed))
            .field("errors", &self.errors.load(Ordering::Relaxed))
            .field("tokens", &self.tokens.load(Ordering::Relaxed))
            .finish()
    }
}

impl LoadedModel {
    fn new(config: ModelConfig, backend: Arc<dyn ModelBackend>) -> Self {
        Self {
            config,
            backend,
            loaded_at: Utc::now(),
            last_health_ok: Mutex::new(None),
            healthy: AtomicBool::new(true),
            requests: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            tokens: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn ModelBackend> {
        &self.backend
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tokens(&self, count: u64) {
        self.tokens.fetch_add(count, Ordering::Relaxed);
    }

    pub fn stats(&self) -> ModelStats {
        ModelStats {
            name: self.config.name.clone(),
            version: self.config.version.clone(),
            device: self.config.device.clone(),
            uptime_seconds: (Utc::now() - self.loaded_at).num_milliseconds() as f64 / 1000.0,
            requests: self.requests.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            tokens_generated: self.tokens.load(Ordering::Relaxed),
            healthy: self.is_healthy(),
            last_health_ok: *self.last_health_ok.lock(),
        }
    }
}

/// Point-in-time counters for one model version.
#[derive(Debug, Clone, Serialize)]
pub struct ModelStats {
    pub name: String,
    pub version: String,
    pub device: String,
    pub uptime_seconds: f64,
    pub requests: u64,
    pub errors: u64,
    pub tokens_generated: u64,
    pub healthy: bool,
    pub last_health_ok: Option<DateTime<Utc>>,
}

/// Listing entry for `/models`.
#[derive(Debug, Clone, Serialize)]
pub struct ModelListing {
    pub name: String,
    pub versions: Vec<String>,
    pub active: String,
}

struct ModelFamily {
    versions: HashMap<String, Arc<LoadedModel>>,
    active: String,
}

/// Holds every loaded model keyed by (name, version).
///
/// Reads take a short `RwLock` read guard and never await. Loads, unloads
/// and version switches serialize on one async mutex, which is stricter
/// than the per-name serialization the design requires but keeps the
/// mutation path simple.
pub struct ModelRegistry {
    models: RwLock<HashMap<String, ModelFamily>>,
    loaders: RwLock<HashMap<String, LoaderFn>>,
    mutate: tokio::sync::Mutex<()>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self {
            models: RwLock::new(HashMap::new()),
            loaders: RwLock::new(HashMap::new()),
            mutate: tokio::sync::Mutex::new(()),
        }
    }

    /// Store a loader capability for a model family.
    ///
    /// Fails if the name already has a loader unless `replace` is set.
    pub fn register_loader(
        &self,
        model_name: impl Into<String>,
        loader: LoaderFn,
        replace: bool,
    ) -> Result<()> {
        let name = model_name.into();
        let mut loaders = self.loaders.write();
        if loaders.contains_key(&name) && !replace {
            return Err(ServeError::load_error(format!(
                "loader for {name} already registered"
            )));
        }
        loaders.insert(name.clone(), loader);
        info!(model = %name, "registered loader");
        Ok(())
    }

    pub fn has_loader(&self, model_name: &str) -> bool {
        self.loaders.read().contains_key(model_name)
    }

    /// Load a model version: call the loader, run warm-up, check health,
    /// then publish atomically. The first version of a name becomes active;
    /// later versions are published without switching.
    pub async fn load(&self, config: ModelConfig) -> Result<Arc<LoadedModel>> {
        config.validate()?;
        let loader = self
            .loaders
            .read()
            .get(&config.name)
            .cloned()
            .ok_or_else(|| {
                ServeError::load_error(format!("no loader registered for {}", config.name))
            })?;

        let _guard = self.mutate.lock().await;

        if let Some(family) = self.models.read().get(&config.name) {
            if family.versions.contains_key(&config.version) {
                return Err(ServeError::AlreadyLoaded {
                    name: config.name.clone(),
                    version: config.version.clone(),
                });
            }
        }

        info!(model = %config.name, version = %config.version, device = %config.device, "loading model");
        let backend = loader(config.clone())
            .await
            .map_err(|e| ServeError::load_error(e.to_string()))?;

        if config.warmup_tokens > 0 {
            Self::warmup(&backend, config.warmup_tokens).await?;
        }

        if !backend.health_check().await {
            return Err(ServeError::load_error(format!(
                "initial health check failed for {} v{}",
                config.name, config.version
            )));
        }

        let model = Arc::new(LoadedModel::new(config.clone(), backend));
        *model.last_health_ok.lock() = Some(Utc::now());

        let mut models = self.models.write();
        let family = models
            .entry(config.name.clone())
            .or_insert_with(|| ModelFamily {
                versions: HashMap::new(),
                active: config.version.clone(),
            });
        family
            .versions
            .insert(config.version.clone(), Arc::clone(&model));

        info!(
            model = %config.name,
            version = %config.version,
            active = %family.active,
            "model published"
        );
        Ok(model)
    }

    /// Dummy generation to prime caches and compilation; the produced
    /// tokens are discarded. This absorbs the first-request latency spike.
    async fn warmup(backend: &Arc<dyn ModelBackend>, warmup_tokens: usize) -> Result<()> {
        let (tx, mut rx) = mpsc::channel(64);
        let request = GenerateRequest {
            prompt: "warmup".to_string(),
            max_tokens: warmup_tokens,
            temperature: 1.0,
            top_p: 1.0,
        };
        let drain = async {
            let mut discarded = 0u64;
            while rx.recv().await.is_some() {
                discarded += 1;
            }
            discarded
        };
        let (result, discarded): (Result<()>, u64) =
            tokio::join!(backend.generate(vec![request], tx), drain);
        result.map_err(|e| ServeError::warmup_error(e.to_string()))?;
        info!(tokens = discarded, "warm-up complete");
        Ok(())
    }

    /// Resolve the active version for a name.
    pub fn lookup(&self, model_name: &str) -> Result<Arc<LoadedModel>> {
        let models = self.models.read();
        let family = models
            .get(model_name)
            .ok_or_else(|| ServeError::unknown_model(model_name))?;
        family
            .versions
            .get(&family.active)
            .cloned()
            .ok_or_else(|| ServeError::internal(format!("active version missing for {model_name}")))
    }

    /// Resolve a specific version.
    pub fn lookup_version(&self, model_name: &str, version: &str) -> Result<Arc<LoadedModel>> {
        let models = self.models.read();
        models
            .get(model_name)
            .and_then(|family| family.versions.get(version))
            .cloned()
            .ok_or_else(|| ServeError::unknown_model(format!("{model_name} v{version}")))
    }

    /// Atomically switch which version lookups return. In-flight work
    /// holding the old handle is undisturbed.
    pub async fn set_active_version(&self, model_name: &str, version: &str) -> Result<()> {
        let _guard = self.mutate.lock().await;
        let mut models = self.models.write();
        let family = models
            .get_mut(model_name)
            .ok_or_else(|| ServeError::unknown_model(model_name))?;
        if !family.versions.contains_key(version) {
            return Err(ServeError::unknown_model(format!(
                "{model_name} v{version}"
            )));
        }
        let old = std::mem::replace(&mut family.active, version.to_string());
        info!(model = %model_name, from = %old, to = %version, "switched active version");
        Ok(())
    }

    /// Remove a version from the table. New lookups fail immediately;
    /// handles already issued keep the model alive, and the backend's
    /// cleanup runs once the last one drops.
    pub async fn unload(&self, model_name: &str, version: &str) -> Result<()> {
        let _guard = self.mutate.lock().await;
        let removed = {
            let mut models = self.models.write();
            let family = models
                .get_mut(model_name)
                .ok_or_else(|| ServeError::unknown_model(model_name))?;
            let removed = family.versions.remove(version).ok_or_else(|| {
                ServeError::unknown_model(format!("{model_name} v{version}"))
            })?;

            if family.versions.is_empty() {
                models.remove(model_name);
            } else if family.active == version {
                // Keep the invariant: the active version exists in the set.
                // Prefer the highest remaining semver.
                let next = family
                    .versions
                    .values()
                    .max_by_key(|m| m.config().semver().ok())
                    .map(|m| m.config().version.clone());
                if let Some(next) = next {
                    warn!(model = %model_name, from = %version, to = %next, "unloaded active version, falling back");
                    family.active = next;
                }
            }
            removed
        };

        info!(model = %model_name, version = %version, "model unloaded, draining references");
        Self::spawn_reaper(removed);
        Ok(())
    }

    /// Run `cleanup` once every in-flight reference to the version drops.
    fn spawn_reaper(model: Arc<LoadedModel>) {
        tokio::spawn(async move {
            while Arc::strong_count(&model) > 1 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            model.backend.cleanup().await;
            info!(model = %model.config.name, version = %model.config.version, "model cleanup complete");
        });
    }

    /// Poll every version's health capability. Failures mark the entry
    /// unhealthy but never auto-unload it.
    pub async fn health_check_all(&self) {
        let snapshot: Vec<Arc<LoadedModel>> = {
            let models = self.models.read();
            models
                .values()
                .flat_map(|family| family.versions.values().cloned())
                .collect()
        };

        for model in snapshot {
            let ok = model.backend.health_check().await;
            model.healthy.store(ok, Ordering::Relaxed);
            if ok {
                *model.last_health_ok.lock() = Some(Utc::now());
            } else {
                error!(
                    model = %model.config.name,
                    version = %model.config.version,
                    "health check failed"
                );
            }
        }
    }

    /// Enumerate loaded (name, versions, active), versions semver-sorted.
    pub fn list_models(&self) -> Vec<ModelListing> {
        let models = self.models.read();
        let mut listings: Vec<ModelListing> = models
            .iter()
            .map(|(name, family)| {
                let mut versions: Vec<&Arc<LoadedModel>> = family.versions.values().collect();
                versions.sort_by_key(|m| m.config().semver().ok());
                ModelListing {
                    name: name.clone(),
                    versions: versions
                        .iter()
                        .map(|m| m.config().version.clone())
                        .collect(),
                    active: family.active.clone(),
                }
            })
            .collect();
        listings.sort_by(|a, b| a.name.cmp(&b.name));
        listings
    }

    /// Stats for the active version of a name.
    pub fn model_stats(&self, model_name: &str) -> Option<ModelStats> {
        self.lookup(model_name).ok().map(|m| m.stats())
    }

    /// Unload everything, draining references as usual.
    pub async fn shutdown(&self) {
        let entries: Vec<(String, String)> = {
            let models = self.models.read();
            models
                .iter()
                .flat_map(|(name, family)| {
                    family
                        .versions
                        .keys()
                        .map(|v| (name.clone(), v.clone()))
                        .collect::<Vec<_>>()
                })
                .collect()
        };
        for (name, version) in entries {
            if let Err(e) = self.unload(&name, &version).await {
                warn!(model = %name, version = %version, error = %e, "unload during shutdown failed");
            }
        }
        info!("model registry shut down");
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}
