use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use haven_core::error::GatewayError;

use crate::provider::{ModelDescriptor, ModelStatus, ProviderAdapter};

/// Consecutive refresh failures before a provider's models are marked
/// unavailable. A single flaky poll keeps the previous descriptors as-is.
const FAILURES_BEFORE_UNAVAILABLE: u32 = 2;

/// Number of Levenshtein-closest names suggested for an unknown model.
const SUGGESTION_COUNT: usize = 3;

/// A routable model: its descriptor plus the adapter that serves it.
#[derive(Clone)]
pub struct RegisteredModel {
    pub descriptor: ModelDescriptor,
    pub adapter: Arc<dyn ProviderAdapter>,
}

impl std::fmt::Debug for RegisteredModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredModel")
            .field("descriptor", &self.descriptor)
            .field("adapter", &self.adapter.id())
            .finish()
    }
}

#[derive(Default)]
struct Snapshot {
    models: BTreeMap<String, RegisteredModel>,
}

/// Process-wide model table populated from provider model-list endpoints.
///
/// Refreshes build a fresh immutable snapshot and swap it in under the write
/// lock; readers clone the Arc under the read lock and never block a refresh.
pub struct ModelRegistry {
    adapters: Vec<Arc<dyn ProviderAdapter>>,
    precedence: Vec<String>,
    refresh_interval: Duration,
    snapshot: RwLock<Arc<Snapshot>>,
    /// Consecutive list_models failures per provider id.
    failures: Mutex<HashMap<String, u32>>,
}

impl ModelRegistry {
    pub fn new(
        adapters: Vec<Arc<dyn ProviderAdapter>>,
        precedence: Vec<String>,
        refresh_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            adapters,
            precedence,
            refresh_interval,
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            failures: Mutex::new(HashMap::new()),
        })
    }

    /// Poll every enabled provider and swap in a new snapshot.
    ///
    /// An unreachable provider keeps its previously known descriptors;
    /// after two consecutive failures they flip to `unavailable`.
    pub async fn refresh(&self) {
        let previous = self.current();
        let mut fresh: HashMap<String, Vec<ModelDescriptor>> = HashMap::new();

        for adapter in &self.adapters {
            let id = adapter.id().to_string();
            match adapter.list_models().await {
                Ok(models) => {
                    debug!(provider = %id, count = models.len(), "model list refreshed");
                    self.failures.lock().unwrap().remove(&id);
                    fresh.insert(id, models);
                }
                Err(e) => {
                    let mut failures = self.failures.lock().unwrap();
                    let count = failures.entry(id.clone()).or_insert(0);
                    *count += 1;
                    warn!(provider = %id, consecutive = *count, err = %e, "model list refresh failed");
                }
            }
        }

        let failures = self.failures.lock().unwrap().clone();
        let mut models: BTreeMap<String, RegisteredModel> = BTreeMap::new();

        for adapter in self.ordered_adapters() {
            let id = adapter.id().to_string();
            let descriptors: Vec<ModelDescriptor> = match fresh.get(&id) {
                Some(list) => list.clone(),
                None => {
                    // Keep what we knew; degrade status once the provider has
                    // been unreachable for two consecutive polls.
                    let degraded = failures.get(&id).copied().unwrap_or(0)
                        >= FAILURES_BEFORE_UNAVAILABLE;
                    previous
                        .models
                        .values()
                        .filter(|m| m.descriptor.provider == id)
                        .map(|m| {
                            let mut d = m.descriptor.clone();
                            if degraded {
                                d.status = ModelStatus::Unavailable;
                            }
                            d
                        })
                        .collect()
                }
            };

            for descriptor in descriptors {
                // First writer wins: adapters iterate in precedence order, so
                // a name collision hides the lower-precedence provider's model.
                models
                    .entry(descriptor.name.clone())
                    .or_insert_with(|| RegisteredModel {
                        descriptor,
                        adapter: adapter.clone(),
                    });
            }
        }

        info!(models = models.len(), "model registry snapshot swapped");
        *self.snapshot.write().unwrap() = Arc::new(Snapshot { models });
    }

    /// Resolve a model name to its adapter. Exact match only; unknown names
    /// come back with the closest available names as suggestions.
    pub fn route(&self, name: &str) -> Result<RegisteredModel, GatewayError> {
        let snapshot = self.current();
        if let Some(model) = snapshot.models.get(name) {
            return Ok(model.clone());
        }
        Err(GatewayError::model_not_found(
            name,
            closest_names(name, snapshot.models.keys()),
        ))
    }

    /// Flattened descriptor list, sorted by name.
    pub fn models(&self) -> Vec<ModelDescriptor> {
        self.current()
            .models
            .values()
            .map(|m| m.descriptor.clone())
            .collect()
    }

    /// The configured adapters, for health probes.
    pub fn adapters(&self) -> &[Arc<dyn ProviderAdapter>] {
        &self.adapters
    }

    /// Background refresh loop; ticks until `shutdown` broadcasts true.
    pub async fn run_refresh_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.refresh_interval, "model registry refresh loop started");
        let mut interval = tokio::time::interval(self.refresh_interval);
        // First tick fires immediately; the startup refresh already ran.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => self.refresh().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("model registry refresh loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    fn current(&self) -> Arc<Snapshot> {
        self.snapshot.read().unwrap().clone()
    }

    /// Adapters in precedence order; ids missing from the precedence list
    /// keep their registration order after the listed ones.
    fn ordered_adapters(&self) -> Vec<Arc<dyn ProviderAdapter>> {
        let mut ordered: Vec<Arc<dyn ProviderAdapter>> = Vec::with_capacity(self.adapters.len());
        for id in &self.precedence {
            for adapter in &self.adapters {
                if adapter.id() == id {
                    ordered.push(adapter.clone());
                }
            }
        }
        for adapter in &self.adapters {
            if !self.precedence.iter().any(|id| id == adapter.id()) {
                ordered.push(adapter.clone());
            }
        }
        ordered
    }
}

/// Up to three closest names by edit distance, nearest first.
fn closest_names<'a>(target: &str, names: impl Iterator<Item = &'a String>) -> Vec<String> {
    let mut scored: Vec<(usize, &String)> = names
        .map(|name| (levenshtein(target, name), name))
        .collect();
    scored.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)));
    scored
        .into_iter()
        .take(SUGGESTION_COUNT)
        .map(|(_, name)| name.clone())
        .collect()
}

/// Plain two-row Levenshtein distance.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{
        ChatMessage, ChatOutcome, ChatParams, ModelCapabilities, ProviderError, ProviderHealth,
    };
    use crate::stream::StreamEvent;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;

    struct FakeAdapter {
        id: &'static str,
        models: Vec<&'static str>,
        failing: AtomicBool,
    }

    impl FakeAdapter {
        fn new(id: &'static str, models: Vec<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                id,
                models,
                failing: AtomicBool::new(false),
            })
        }

        fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ProviderAdapter for FakeAdapter {
        fn id(&self) -> &str {
            self.id
        }

        async fn list_models(&self) -> Result<Vec<ModelDescriptor>, ProviderError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(ProviderError::Unreachable("scripted failure".to_string()));
            }
            Ok(self
                .models
                .iter()
                .map(|name| ModelDescriptor {
                    name: name.to_string(),
                    provider: self.id.to_string(),
                    context_window: 4096,
                    capabilities: ModelCapabilities {
                        streaming: true,
                        tools: false,
                        reasoning: false,
                    },
                    status: ModelStatus::Available,
                })
                .collect())
        }

        fn count_tokens(&self, _model: &str, text: &str) -> u32 {
            text.split_whitespace().count() as u32
        }

        fn context_limit(&self, _model: &str) -> u32 {
            4096
        }

        async fn chat_once(
            &self,
            _model: &str,
            _messages: &[ChatMessage],
            _params: &ChatParams,
        ) -> Result<ChatOutcome, ProviderError> {
            Err(ProviderError::Unreachable("not scripted".to_string()))
        }

        async fn chat_stream(
            &self,
            _model: &str,
            _messages: &[ChatMessage],
            _params: &ChatParams,
            _tx: mpsc::Sender<StreamEvent>,
        ) -> Result<(), ProviderError> {
            Err(ProviderError::Unreachable("not scripted".to_string()))
        }

        async fn health(&self) -> ProviderHealth {
            ProviderHealth {
                ok: !self.failing.load(Ordering::SeqCst),
                detail: String::new(),
            }
        }
    }

    fn registry(adapters: Vec<Arc<FakeAdapter>>) -> Arc<ModelRegistry> {
        ModelRegistry::new(
            adapters
                .into_iter()
                .map(|a| a as Arc<dyn ProviderAdapter>)
                .collect(),
            vec!["local".to_string(), "anthropic".to_string()],
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn every_listed_model_routes_to_one_adapter() {
        let reg = registry(vec![
            FakeAdapter::new("local", vec!["m-small", "m-large"]),
            FakeAdapter::new("anthropic", vec!["claude-x"]),
        ]);
        reg.refresh().await;

        let models = reg.models();
        assert_eq!(models.len(), 3);
        for m in models {
            let routed = reg.route(&m.name).unwrap();
            assert_eq!(routed.descriptor.name, m.name);
        }
    }

    #[tokio::test]
    async fn unknown_model_gets_suggestions() {
        let reg = registry(vec![FakeAdapter::new(
            "local",
            vec!["m-small", "m-medium", "m-large"],
        )]);
        reg.refresh().await;

        let err = reg.route("m-smal").unwrap_err();
        assert_eq!(err.code, "MODEL_NOT_FOUND");
        assert_eq!(err.status(), 404);
        assert!(!err.suggestions.is_empty());
        assert_eq!(err.suggestions[0], "m-small");
        assert!(err.suggestions.len() <= 3);
    }

    #[tokio::test]
    async fn collision_resolved_by_precedence() {
        let reg = registry(vec![
            FakeAdapter::new("anthropic", vec!["shared-model"]),
            FakeAdapter::new("local", vec!["shared-model"]),
        ]);
        reg.refresh().await;

        let routed = reg.route("shared-model").unwrap();
        // "local" precedes "anthropic" in the precedence list even though it
        // was registered second.
        assert_eq!(routed.adapter.id(), "local");
        assert_eq!(reg.models().len(), 1);
    }

    #[tokio::test]
    async fn one_failure_keeps_descriptors_available() {
        let local = FakeAdapter::new("local", vec!["m-small"]);
        let reg = registry(vec![local.clone()]);
        reg.refresh().await;

        local.set_failing(true);
        reg.refresh().await;

        let models = reg.models();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].status, ModelStatus::Available);
    }

    #[tokio::test]
    async fn two_failures_mark_unavailable() {
        let local = FakeAdapter::new("local", vec!["m-small"]);
        let reg = registry(vec![local.clone()]);
        reg.refresh().await;

        local.set_failing(true);
        reg.refresh().await;
        reg.refresh().await;

        let models = reg.models();
        assert_eq!(models[0].status, ModelStatus::Unavailable);
        // Still routable; the provider call itself will surface the outage.
        assert!(reg.route("m-small").is_ok());

        // Recovery flips it back.
        local.set_failing(false);
        reg.refresh().await;
        assert_eq!(reg.models()[0].status, ModelStatus::Available);
    }

    #[test]
    fn levenshtein_basics() {
        assert_eq!(levenshtein("", ""), 0);
        assert_eq!(levenshtein("abc", ""), 3);
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("m-small", "m-small"), 0);
        assert_eq!(levenshtein("m-smal", "m-small"), 1);
    }
}
