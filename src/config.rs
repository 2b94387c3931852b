//! YAML configuration and component registries
//!
//! A worker is configured with a broker section and one entry per event
//! type naming its event pipeline, generators, and output pipeline.
//! Components are referred to by registered name and resolved against a
//! [`Registry`] at load time:
//!
//! ```yaml
//! queue:
//!   backend: rabbitmq
//!   host: localhost
//!   port: 5672
//! events:
//!   example_event:
//!     event_pipeline: [noop]
//!     generators:
//!       - name: count
//!         kwargs: {count: 3}
//!     output: [console]
//! logging:
//!   level: info
//! ```

use crate::broker::RabbitConfig;
use crate::error::{CourierError, Result};
use crate::outputs::OutputRegistry;
use crate::pipeline::{
    AnnotateFilter, CountGenerator, DropEmptyFilter, EventFilter, EventPipeline, Generator,
    GenerationPipeline, NoopFilter,
};
use crate::router::{PipelineFn, Router};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

/// Top-level worker configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub events: BTreeMap<String, EventTypeConfig>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Broker connection section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub backend: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub virtual_host: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: "rabbitmq".to_string(),
            host: "localhost".to_string(),
            port: 5672,
            username: "guest".to_string(),
            password: "guest".to_string(),
            virtual_host: "/".to_string(),
        }
    }
}

/// Per-event-type pipeline configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EventTypeConfig {
    /// Serial chain of event filters
    #[serde(default)]
    pub event_pipeline: Vec<ComponentSpec>,

    /// Parallel set of generators
    #[serde(default)]
    pub generators: Vec<ComponentSpec>,

    /// Output pipeline: a registered pipeline name or a list of backends
    pub output: OutputPipelineConfig,

    /// Outputs served by this worker; absent means everything the
    /// pipeline selects is considered available
    #[serde(default)]
    pub outputs: Option<Vec<String>>,
}

/// Reference to a registered component, with optional keyword arguments
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ComponentSpec {
    Name(String),
    Detailed {
        name: String,
        #[serde(default)]
        kwargs: serde_json::Map<String, serde_json::Value>,
    },
}

impl ComponentSpec {
    pub fn name(&self) -> &str {
        match self {
            ComponentSpec::Name(name) => name,
            ComponentSpec::Detailed { name, .. } => name,
        }
    }

    pub fn kwargs(&self) -> serde_json::Map<String, serde_json::Value> {
        match self {
            ComponentSpec::Name(_) => serde_json::Map::new(),
            ComponentSpec::Detailed { kwargs, .. } => kwargs.clone(),
        }
    }
}

/// Output pipeline spec: a registered generator-function name, or the
/// list-of-backends sugar for a single send effect
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OutputPipelineConfig {
    Path(String),
    Outputs(Vec<ComponentSpec>),
}

/// Logging section
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    /// Level filter directive (e.g. `info`, `courier=debug`)
    #[serde(default)]
    pub level: Option<String>,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            CourierError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_str(&raw)
    }

    /// Parse configuration from a YAML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Event types served by this worker
    pub fn event_types(&self) -> Vec<String> {
        self.events.keys().cloned().collect()
    }

    fn event_config(&self, event_type: &str) -> Result<&EventTypeConfig> {
        self.events
            .get(event_type)
            .ok_or_else(|| CourierError::Config(format!("no such event type: {event_type}")))
    }

    /// Resolve the event pipeline for an event type
    pub fn event_pipeline(&self, event_type: &str, registry: &Registry) -> Result<EventPipeline> {
        let filters = self
            .event_config(event_type)?
            .event_pipeline
            .iter()
            .map(|spec| registry.build_filter(spec.name(), &spec.kwargs()))
            .collect::<Result<Vec<_>>>()?;
        Ok(EventPipeline::new(filters))
    }

    /// Resolve the generation pipeline for an event type
    pub fn generators(&self, event_type: &str, registry: &Registry) -> Result<GenerationPipeline> {
        let generators = self
            .event_config(event_type)?
            .generators
            .iter()
            .map(|spec| registry.build_generator(spec.name(), &spec.kwargs()))
            .collect::<Result<Vec<_>>>()?;
        Ok(GenerationPipeline::new(generators))
    }

    /// Resolve the router for an event type
    pub fn router(&self, event_type: &str, registry: &Registry) -> Result<Router> {
        match &self.event_config(event_type)?.output {
            OutputPipelineConfig::Path(path) => {
                let pipeline = registry.pipeline(path)?;
                Ok(Router::new(pipeline))
            }
            OutputPipelineConfig::Outputs(refs) => {
                let outputs = refs
                    .iter()
                    .map(|spec| {
                        registry.outputs.build(&crate::outputs::OutputSpec::with_kwargs(
                            spec.name(),
                            spec.kwargs(),
                        ))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Router::from_outputs(outputs))
            }
        }
    }

    /// Outputs this worker serves for an event type
    ///
    /// Explicit `outputs:` wins; a list-form output pipeline implies its
    /// backends; a named pipeline implies no restriction.
    pub fn enabled_outputs(&self, event_type: &str) -> Result<Option<HashSet<String>>> {
        let config = self.event_config(event_type)?;
        if let Some(outputs) = &config.outputs {
            return Ok(Some(outputs.iter().cloned().collect()));
        }
        match &config.output {
            OutputPipelineConfig::Outputs(refs) => {
                Ok(Some(refs.iter().map(|r| r.name().to_string()).collect()))
            }
            OutputPipelineConfig::Path(_) => Ok(None),
        }
    }

    /// Broker configuration for the worker
    pub fn rabbit_config(&self) -> Result<RabbitConfig> {
        if self.queue.backend != "rabbitmq" {
            return Err(CourierError::Config(format!(
                "unsupported queue backend: {}",
                self.queue.backend
            )));
        }
        Ok(RabbitConfig {
            host: self.queue.host.clone(),
            port: self.queue.port,
            username: self.queue.username.clone(),
            password: self.queue.password.clone(),
            virtual_host: self.queue.virtual_host.clone(),
            ..Default::default()
        })
    }
}

type FilterCtor =
    Arc<dyn Fn(&serde_json::Map<String, serde_json::Value>) -> Result<Arc<dyn EventFilter>> + Send + Sync>;
type GeneratorCtor =
    Arc<dyn Fn(&serde_json::Map<String, serde_json::Value>) -> Result<Arc<dyn Generator>> + Send + Sync>;

/// Name-keyed constructors for every pluggable component kind
///
/// Built explicitly at startup; configuration entries resolve against it.
#[derive(Clone)]
pub struct Registry {
    pub outputs: OutputRegistry,
    filters: HashMap<String, FilterCtor>,
    generators: HashMap<String, GeneratorCtor>,
    pipelines: HashMap<String, PipelineFn>,
}

impl Registry {
    /// Registry preloaded with the built-in components
    pub fn with_builtins() -> Self {
        let mut registry = Self {
            outputs: OutputRegistry::with_builtins(),
            filters: HashMap::new(),
            generators: HashMap::new(),
            pipelines: HashMap::new(),
        };

        registry.register_filter("noop", |_| Ok(Arc::new(NoopFilter) as _));
        registry.register_filter("drop_empty", |_| Ok(Arc::new(DropEmptyFilter) as _));
        registry.register_filter("annotate", |kwargs| {
            let key = kwargs
                .get("key")
                .and_then(|k| k.as_str())
                .unwrap_or("tag")
                .to_string();
            let value = kwargs
                .get("value")
                .cloned()
                .unwrap_or(serde_json::Value::Bool(true));
            Ok(Arc::new(AnnotateFilter::new(key, value)) as _)
        });

        registry.register_generator("count", |kwargs| {
            let count = kwargs.get("count").and_then(|v| v.as_u64()).unwrap_or(1);
            Ok(Arc::new(CountGenerator::new(count as usize)) as _)
        });

        for (name, pipeline) in builtin_pipelines() {
            registry.register_pipeline(name, pipeline);
        }

        registry
    }

    pub fn register_filter<F>(&mut self, name: impl Into<String>, ctor: F)
    where
        F: Fn(&serde_json::Map<String, serde_json::Value>) -> Result<Arc<dyn EventFilter>>
            + Send
            + Sync
            + 'static,
    {
        self.filters.insert(name.into(), Arc::new(ctor));
    }

    pub fn register_generator<F>(&mut self, name: impl Into<String>, ctor: F)
    where
        F: Fn(&serde_json::Map<String, serde_json::Value>) -> Result<Arc<dyn Generator>>
            + Send
            + Sync
            + 'static,
    {
        self.generators.insert(name.into(), Arc::new(ctor));
    }

    pub fn register_pipeline(&mut self, name: impl Into<String>, pipeline: PipelineFn) {
        self.pipelines.insert(name.into(), pipeline);
    }

    fn build_filter(
        &self,
        name: &str,
        kwargs: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Arc<dyn EventFilter>> {
        let ctor = self
            .filters
            .get(name)
            .ok_or_else(|| CourierError::UnknownComponent(name.to_string()))?;
        ctor(kwargs)
    }

    fn build_generator(
        &self,
        name: &str,
        kwargs: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Arc<dyn Generator>> {
        let ctor = self
            .generators
            .get(name)
            .ok_or_else(|| CourierError::UnknownComponent(name.to_string()))?;
        ctor(kwargs)
    }

    fn pipeline(&self, name: &str) -> Result<PipelineFn> {
        self.pipelines
            .get(name)
            .cloned()
            .ok_or_else(|| CourierError::UnknownPipeline(name.to_string()))
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// The built-in output pipelines
fn builtin_pipelines() -> Vec<(&'static str, PipelineFn)> {
    use crate::effects::send;
    use crate::message::Message;
    use crate::outputs::{
        ConsoleOutput, NeverDeliveredOutput, NullOutput, RetryOutput,
    };

    vec![
        (
            "simple",
            Arc::new(|_m: &Message| {
                vec![send(vec![
                    Arc::new(NullOutput::new()) as _,
                    Arc::new(NullOutput::new()) as _,
                ])]
            }) as PipelineFn,
        ),
        (
            "sequence",
            Arc::new(|_m: &Message| {
                vec![
                    send(vec![Arc::new(NullOutput::tagged(2)) as _]),
                    send(vec![Arc::new(NullOutput::tagged(1)) as _]),
                ]
            }),
        ),
        (
            "fallback",
            Arc::new(|_m: &Message| {
                vec![send(vec![
                    Arc::new(NeverDeliveredOutput::new()) as _,
                    Arc::new(NullOutput::new()) as _,
                ])]
            }),
        ),
        (
            "example",
            Arc::new(|_m: &Message| {
                vec![
                    send(vec![
                        Arc::new(RetryOutput::new(1)) as _,
                        Arc::new(NeverDeliveredOutput::new()) as _,
                    ]),
                    send(vec![Arc::new(ConsoleOutput::new()) as _]),
                ]
            }),
        ),
    ]
}
