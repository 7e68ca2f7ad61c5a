//! Pipeline resolution: component keys to adapter instances, per call.
//!
//! The registry maps `<provider>_<role>` keys to factories. Factories run
//! once per call at resolution time; the resolution is cached and stays
//! immutable for the life of the call.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;

use super::deepgram::{DeepgramStt, DeepgramTts};
use super::local::{LocalLlm, LocalStt, LocalTts};
use super::traits::{AdapterResult, LlmAdapter, PlaceholderAdapter, SttAdapter, TtsAdapter};
use super::webhook::WebhookLlm;
use super::{split_component_key, Role};
use crate::config::{AdapterOptions, Config};
use crate::error::{ParlanceError, ParlanceResult};

/// An adapter instance produced by a factory, tagged by role.
pub enum AdapterInstance {
    Stt(Arc<dyn SttAdapter>),
    Llm(Arc<dyn LlmAdapter>),
    Tts(Arc<dyn TtsAdapter>),
}

impl AdapterInstance {
    fn role(&self) -> Role {
        match self {
            Self::Stt(_) => Role::Stt,
            Self::Llm(_) => Role::Llm,
            Self::Tts(_) => Role::Tts,
        }
    }
}

type Factory = Box<dyn Fn(&str) -> AdapterResult<AdapterInstance> + Send + Sync>;

/// Snapshot of the adapters and options assigned to one call.
///
/// Assigned at call start and immutable thereafter.
pub struct PipelineResolution {
    pub call_id: String,
    pub pipeline_name: String,
    pub stt_key: String,
    pub stt: Arc<dyn SttAdapter>,
    pub stt_options: AdapterOptions,
    pub llm_key: String,
    pub llm: Arc<dyn LlmAdapter>,
    pub llm_options: AdapterOptions,
    pub tts_key: String,
    pub tts: Arc<dyn TtsAdapter>,
    pub tts_options: AdapterOptions,
    /// Provider tag shared by the majority of the components, for logs.
    pub primary_provider: Option<String>,
}

impl PipelineResolution {
    /// Opens the per-call session on every adapter.
    pub async fn open_all(&self) -> AdapterResult<()> {
        self.stt
            .open_call(&self.call_id, &self.stt_options)
            .await?;
        self.llm
            .open_call(&self.call_id, &self.llm_options)
            .await?;
        self.tts
            .open_call(&self.call_id, &self.tts_options)
            .await?;
        Ok(())
    }
}

/// Resolves pipelines to adapter instances and manages their lifecycle.
pub struct PipelineOrchestrator {
    config: Arc<Config>,
    registry: HashMap<String, Factory>,
    resolutions: DashMap<String, Arc<PipelineResolution>>,
}

impl PipelineOrchestrator {
    pub fn new(config: Arc<Config>) -> Self {
        let registry = build_registry(&config);
        Self {
            config,
            registry,
            resolutions: DashMap::new(),
        }
    }

    /// Verifies every configured pipeline key resolves to a factory.
    /// Fatal at startup when one does not.
    pub fn validate(&self) -> ParlanceResult<()> {
        for (name, entry) in &self.config.pipelines {
            for key in [&entry.stt, &entry.llm, &entry.tts] {
                if split_component_key(key).is_none() {
                    return Err(ParlanceError::Configuration(format!(
                        "pipeline '{}': malformed component key '{}'",
                        name, key
                    )));
                }
                if self.find_factory(key).is_none() {
                    return Err(ParlanceError::Configuration(format!(
                        "pipeline '{}': no adapter factory for component '{}'",
                        name, key
                    )));
                }
            }
        }
        log::info!(
            "[Pipeline] Validated {} pipeline(s) against {} registered factories",
            self.config.pipelines.len(),
            self.registry.len()
        );
        Ok(())
    }

    fn find_factory(&self, key: &str) -> Option<&Factory> {
        if let Some(factory) = self.registry.get(key) {
            return Some(factory);
        }
        let (_, role) = split_component_key(key)?;
        self.registry.get(&format!("*_{}", role.as_str()))
    }

    fn make(&self, key: &str, want: Role) -> ParlanceResult<AdapterInstance> {
        let factory = self.find_factory(key).ok_or_else(|| {
            ParlanceError::Configuration(format!("no adapter factory for '{}'", key))
        })?;
        let instance = factory(key)?;
        if instance.role() != want {
            return Err(ParlanceError::Configuration(format!(
                "component '{}' resolved to the wrong role",
                key
            )));
        }
        Ok(instance)
    }

    /// Returns the (possibly just-created) resolution for a call.
    ///
    /// Selection order: explicit `pipeline_name`, then the configured
    /// active pipeline, then the first pipeline in insertion order.
    pub fn get_pipeline(
        &self,
        call_id: &str,
        pipeline_name: Option<&str>,
    ) -> ParlanceResult<Arc<PipelineResolution>> {
        if let Some(existing) = self.resolutions.get(call_id) {
            return Ok(Arc::clone(existing.value()));
        }

        let name = pipeline_name
            .filter(|name| {
                let known = self.config.pipelines.contains_key(*name);
                if !known {
                    log::warn!(
                        "[Pipeline] Requested pipeline '{}' not configured; using default",
                        name
                    );
                }
                known
            })
            .or_else(|| self.config.default_pipeline())
            .ok_or_else(|| {
                ParlanceError::Configuration("no pipelines configured".to_string())
            })?
            .to_string();

        let entry = self
            .config
            .pipelines
            .get(&name)
            .ok_or_else(|| {
                ParlanceError::Configuration(format!("pipeline '{}' not configured", name))
            })?
            .clone();

        let AdapterInstance::Stt(stt) = self.make(&entry.stt, Role::Stt)? else {
            unreachable!("role checked by make()")
        };
        let AdapterInstance::Llm(llm) = self.make(&entry.llm, Role::Llm)? else {
            unreachable!("role checked by make()")
        };
        let AdapterInstance::Tts(tts) = self.make(&entry.tts, Role::Tts)? else {
            unreachable!("role checked by make()")
        };

        let primary_provider = primary_provider(&entry.stt, &entry.llm, &entry.tts);
        let resolution = Arc::new(PipelineResolution {
            call_id: call_id.to_string(),
            pipeline_name: name.clone(),
            stt_key: entry.stt,
            stt,
            stt_options: entry.options.stt,
            llm_key: entry.llm,
            llm,
            llm_options: entry.options.llm,
            tts_key: entry.tts,
            tts,
            tts_options: entry.options.tts,
            primary_provider,
        });

        log::info!(
            "[Pipeline] Call {} resolved pipeline '{}' (stt={}, llm={}, tts={})",
            call_id,
            name,
            resolution.stt_key,
            resolution.llm_key,
            resolution.tts_key
        );

        self.resolutions
            .insert(call_id.to_string(), Arc::clone(&resolution));
        Ok(resolution)
    }

    /// Closes and forgets a call's resolution. Best-effort: adapter
    /// failures are logged, never raised.
    pub async fn release_pipeline(&self, call_id: &str) {
        let Some((_, resolution)) = self.resolutions.remove(call_id) else {
            return;
        };

        if let Err(e) = resolution.stt.close_call(call_id).await {
            log::warn!("[Pipeline] close_call failed for {}: {}", resolution.stt_key, e);
        }
        if let Err(e) = resolution.stt.stop().await {
            log::warn!("[Pipeline] stop failed for {}: {}", resolution.stt_key, e);
        }
        if let Err(e) = resolution.llm.close_call(call_id).await {
            log::warn!("[Pipeline] close_call failed for {}: {}", resolution.llm_key, e);
        }
        if let Err(e) = resolution.llm.stop().await {
            log::warn!("[Pipeline] stop failed for {}: {}", resolution.llm_key, e);
        }
        if let Err(e) = resolution.tts.close_call(call_id).await {
            log::warn!("[Pipeline] close_call failed for {}: {}", resolution.tts_key, e);
        }
        if let Err(e) = resolution.tts.stop().await {
            log::warn!("[Pipeline] stop failed for {}: {}", resolution.tts_key, e);
        }
        log::info!(
            "[Pipeline] Released pipeline '{}' for call {}",
            resolution.pipeline_name,
            call_id
        );
    }

    /// Number of calls with a cached resolution.
    pub fn resolution_count(&self) -> usize {
        self.resolutions.len()
    }
}

/// Provider tag shared by at least two of the three keys.
fn primary_provider(stt: &str, llm: &str, tts: &str) -> Option<String> {
    let providers: Vec<&str> = [stt, llm, tts]
        .into_iter()
        .filter_map(|key| split_component_key(key).map(|(p, _)| p))
        .collect();
    for candidate in &providers {
        if providers.iter().filter(|p| **p == *candidate).count() >= 2 {
            return Some((*candidate).to_string());
        }
    }
    None
}

fn build_registry(config: &Config) -> HashMap<String, Factory> {
    let mut registry: HashMap<String, Factory> = HashMap::new();

    if let Some(deepgram) = config.providers.deepgram.clone() {
        if deepgram.api_key.is_empty() {
            log::warn!("[Pipeline] Deepgram provider configured without api_key; skipping");
        } else {
            let dg = deepgram.clone();
            registry.insert(
                "deepgram_stt".to_string(),
                Box::new(move |key| Ok(AdapterInstance::Stt(Arc::new(DeepgramStt::new(key, dg.clone()))))),
            );
            let dg = deepgram;
            registry.insert(
                "deepgram_tts".to_string(),
                Box::new(move |key| Ok(AdapterInstance::Tts(Arc::new(DeepgramTts::new(key, dg.clone()))))),
            );
        }
    }

    if let Some(local) = config.providers.local.clone() {
        let lc = local.clone();
        registry.insert(
            "local_stt".to_string(),
            Box::new(move |key| Ok(AdapterInstance::Stt(Arc::new(LocalStt::new(key, lc.clone()))))),
        );
        let lc = local.clone();
        registry.insert(
            "local_llm".to_string(),
            Box::new(move |key| Ok(AdapterInstance::Llm(Arc::new(LocalLlm::new(key, lc.clone()))))),
        );
        let lc = local;
        registry.insert(
            "local_tts".to_string(),
            Box::new(move |key| Ok(AdapterInstance::Tts(Arc::new(LocalTts::new(key, lc.clone()))))),
        );
    }

    if let Some(webhook) = config.providers.webhook.clone() {
        if webhook.url.is_empty() {
            log::warn!("[Pipeline] Webhook provider configured without url; skipping");
        } else {
            registry.insert(
                "webhook_llm".to_string(),
                Box::new(move |key| {
                    Ok(AdapterInstance::Llm(Arc::new(WebhookLlm::new(
                        key,
                        webhook.clone(),
                    ))))
                }),
            );
        }
    }

    // Wildcard placeholders: resolution succeeds, invocation errors.
    registry.insert(
        "*_stt".to_string(),
        Box::new(|key| Ok(AdapterInstance::Stt(Arc::new(PlaceholderAdapter::new(key))))),
    );
    registry.insert(
        "*_llm".to_string(),
        Box::new(|key| Ok(AdapterInstance::Llm(Arc::new(PlaceholderAdapter::new(key))))),
    );
    registry.insert(
        "*_tts".to_string(),
        Box::new(|key| Ok(AdapterInstance::Tts(Arc::new(PlaceholderAdapter::new(key))))),
    );

    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PipelineEntry, PipelineOptions, WebhookProviderConfig};

    fn test_config() -> Arc<Config> {
        let mut config = Config::default();
        config.providers.webhook = Some(WebhookProviderConfig {
            url: "http://127.0.0.1:9/llm".to_string(),
            response_key: "response".to_string(),
        });
        config.pipelines.insert(
            "main".to_string(),
            PipelineEntry {
                stt: "acme_stt".to_string(),
                llm: "webhook_llm".to_string(),
                tts: "acme_tts".to_string(),
                options: PipelineOptions::default(),
            },
        );
        config.pipelines.insert(
            "alt".to_string(),
            PipelineEntry {
                stt: "other_stt".to_string(),
                llm: "other_llm".to_string(),
                tts: "other_tts".to_string(),
                options: PipelineOptions::default(),
            },
        );
        Arc::new(config)
    }

    #[test]
    fn validate_accepts_wildcard_backed_keys() {
        let orchestrator = PipelineOrchestrator::new(test_config());
        orchestrator.validate().unwrap();
    }

    #[test]
    fn validate_rejects_malformed_keys() {
        let mut config = Config::default();
        config.pipelines.insert(
            "bad".to_string(),
            PipelineEntry {
                stt: "nounderscore".to_string(),
                llm: "x_llm".to_string(),
                tts: "x_tts".to_string(),
                options: PipelineOptions::default(),
            },
        );
        let orchestrator = PipelineOrchestrator::new(Arc::new(config));
        assert!(orchestrator.validate().is_err());
    }

    #[test]
    fn get_pipeline_caches_the_resolution() {
        let orchestrator = PipelineOrchestrator::new(test_config());

        let first = orchestrator.get_pipeline("call-1", Some("main")).unwrap();
        let second = orchestrator.get_pipeline("call-1", Some("alt")).unwrap();
        // Resolution is immutable for the call's life: the second request
        // (even naming a different pipeline) returns the cached one.
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.pipeline_name, "main");
        assert_eq!(orchestrator.resolution_count(), 1);
    }

    #[test]
    fn unknown_pipeline_name_falls_back_to_default() {
        let orchestrator = PipelineOrchestrator::new(test_config());
        let resolution = orchestrator.get_pipeline("call-1", Some("missing")).unwrap();
        assert_eq!(resolution.pipeline_name, "main"); // first in insertion order
    }

    #[tokio::test]
    async fn release_pipeline_forgets_the_call() {
        let orchestrator = PipelineOrchestrator::new(test_config());
        orchestrator.get_pipeline("call-1", None).unwrap();
        assert_eq!(orchestrator.resolution_count(), 1);

        orchestrator.release_pipeline("call-1").await;
        assert_eq!(orchestrator.resolution_count(), 0);

        // Releasing again is a no-op.
        orchestrator.release_pipeline("call-1").await;
    }

    #[test]
    fn primary_provider_needs_a_majority() {
        assert_eq!(
            primary_provider("deepgram_stt", "deepgram_llm", "other_tts"),
            Some("deepgram".to_string())
        );
        assert_eq!(primary_provider("a_stt", "b_llm", "c_tts"), None);
    }
}
