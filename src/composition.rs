//! Supergraph composition
//!
//! The [`CompositionEngine`] validates a [`FederationCompositionConfig`],
//! fetches every subgraph's SDL through its `_service { sdl }` field, merges
//! the type definitions and adds the federation entry points:
//!
//! ```graphql
//! scalar _Any
//! type _Service { sdl: String }
//! union _Entity = User | Product
//! type Query {
//!   _service: _Service!
//!   _entities(representations: [_Any!]!): [_Entity]!
//! }
//! ```
//!
//! Types defined by several subgraphs are merged: fields, enum values and
//! union members are combined by name (first definition wins) and directives
//! are deduplicated. The merged SDL is parsed once more before it is
//! accepted.

use crate::batch_loader::DataLoaderConfig;
use crate::error::{Error, Result};
use crate::error_boundary::ErrorBoundaryConfig;
use crate::executor::{ExecutorConfig, HttpSubgraphClient, OptimizedExecutor, SubgraphClient, SubgraphRequest};
use crate::plan_cache::QueryPlanCacheConfig;
use crate::registry::{validate_service_url, SubgraphRegistry};
use crate::types::ServiceDefinition;
use async_graphql::parser::parse_schema;
use async_graphql::parser::types::{
    ConstDirective, FieldDefinition, InputValueDefinition, TypeDefinition, TypeKind, TypeSystemDefinition,
};
use async_graphql::parser::Positioned;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Overall limit for [`CompositionEngine::create_federated_schema`]
pub const COMPOSITION_TIMEOUT: Duration = Duration::from_secs(30);

/// SDL fetches in flight at once
pub const MAX_CONCURRENT_SDL_FETCHES: usize = 3;

/// Query every federated subgraph answers with its own SDL
pub const SERVICE_SDL_QUERY: &str = "{ _service { sdl } }";

const FEDERATION_TYPES: &[&str] = &[
    "_Any",
    "_Service",
    "_Entity",
    "_FieldSet",
    "FieldSet",
    "link__Import",
    "link__Purpose",
];
const FEDERATION_QUERY_FIELDS: &[&str] = &["_service", "_entities"];

/// Resolves an entity from its representation (`{ "__typename": ..., <key fields> }`).
#[async_trait]
pub trait ReferenceResolver: Send + Sync + 'static {
    async fn resolve_reference(&self, representation: &Value) -> Result<Value>;
}

/// An entity type shared across subgraphs
#[derive(Clone)]
pub struct FederationEntity {
    pub typename: String,
    /// Key fields that identify an instance
    pub key: Vec<String>,
    pub fields: Option<Vec<String>>,
    /// Passed through, not validated
    pub directives: Option<Vec<String>>,
    pub resolve_reference: Option<Arc<dyn ReferenceResolver>>,
}

impl FederationEntity {
    pub fn new<I, S>(typename: impl Into<String>, key: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            typename: typename.into(),
            key: key.into_iter().map(Into::into).collect(),
            fields: None,
            directives: None,
            resolve_reference: None,
        }
    }

    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.get_or_insert_with(Vec::new).push(directive.into());
        self
    }

    pub fn with_resolver(mut self, resolver: impl ReferenceResolver) -> Self {
        self.resolve_reference = Some(Arc::new(resolver));
        self
    }
}

impl std::fmt::Debug for FederationEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FederationEntity")
            .field("typename", &self.typename)
            .field("key", &self.key)
            .field("fields", &self.fields)
            .field("directives", &self.directives)
            .field("resolve_reference", &self.resolve_reference.is_some())
            .finish()
    }
}

/// Plan cache, batching and metrics settings handed to the executor
#[derive(Debug, Clone)]
pub struct PerformanceConfig {
    pub plan_cache: QueryPlanCacheConfig,
    pub data_loader: DataLoaderConfig,
    pub metrics_max_samples: usize,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            plan_cache: QueryPlanCacheConfig::default(),
            data_loader: DataLoaderConfig::default(),
            metrics_max_samples: 1000,
        }
    }
}

/// Everything needed to build a supergraph
#[derive(Debug, Clone, Default)]
pub struct FederationCompositionConfig {
    pub entities: Vec<FederationEntity>,
    pub services: Vec<ServiceDefinition>,
    pub error_boundaries: ErrorBoundaryConfig,
    pub performance: PerformanceConfig,
}

impl FederationCompositionConfig {
    pub fn new(entities: Vec<FederationEntity>, services: Vec<ServiceDefinition>) -> Self {
        Self {
            entities,
            services,
            ..Default::default()
        }
    }

    pub fn error_boundaries(mut self, config: ErrorBoundaryConfig) -> Self {
        self.error_boundaries = config;
        self
    }

    pub fn performance(mut self, config: PerformanceConfig) -> Self {
        self.performance = config;
        self
    }
}

/// Facts about a composed schema
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaMetadata {
    pub composed_at: DateTime<Utc>,
    pub subgraph_count: usize,
    pub entity_count: usize,
    pub type_count: usize,
}

/// The composed supergraph
#[derive(Debug, Clone)]
pub struct FederatedSchema {
    sdl: String,
    type_names: Vec<String>,
    entities: HashMap<String, FederationEntity>,
    services: Vec<ServiceDefinition>,
    error_boundaries: ErrorBoundaryConfig,
    performance: PerformanceConfig,
    metadata: SchemaMetadata,
}

impl FederatedSchema {
    /// Merged SDL including the federation entry points
    pub fn sdl(&self) -> &str {
        &self.sdl
    }

    pub fn metadata(&self) -> &SchemaMetadata {
        &self.metadata
    }

    pub fn type_names(&self) -> &[String] {
        &self.type_names
    }

    pub fn has_type(&self, name: &str) -> bool {
        self.type_names.iter().any(|t| t == name)
    }

    pub fn services(&self) -> &[ServiceDefinition] {
        &self.services
    }

    pub fn entity(&self, typename: &str) -> Option<&FederationEntity> {
        self.entities.get(typename)
    }

    /// Resolve an entity representation through its reference resolver.
    pub async fn resolve_entity(&self, typename: &str, representation: &Value) -> Result<Value> {
        let entity = self.entities.get(typename).ok_or_else(|| {
            Error::field_resolution(format!("'{}' is not a federated entity", typename))
                .with_context("typename", typename)
        })?;

        let missing: Vec<&str> = entity
            .key
            .iter()
            .map(String::as_str)
            .filter(|field| representation.get(field).map_or(true, Value::is_null))
            .collect();
        if !missing.is_empty() {
            return Err(Error::entity_resolution(format!(
                "representation of '{}' is missing key fields: {}",
                typename,
                missing.join(", ")
            ))
            .with_context("typename", typename)
            .with_context("missingFields", &missing));
        }

        let resolver = entity.resolve_reference.as_ref().ok_or_else(|| {
            Error::entity_resolution(format!("no reference resolver for '{}'", typename))
                .with_context("typename", typename)
        })?;

        resolver.resolve_reference(representation).await.map_err(|err| {
            Error::entity_resolution(format!("failed to resolve '{}'", typename))
                .with_context("typename", typename)
                .with_cause(err)
        })
    }

    /// Executor configured with this schema's error boundary and performance settings.
    pub fn executor(&self, registry: Arc<SubgraphRegistry>, client: Arc<dyn SubgraphClient>) -> Result<OptimizedExecutor> {
        let config = ExecutorConfig {
            plan_cache: self.performance.plan_cache.clone(),
            data_loader: self.performance.data_loader.clone(),
            error_boundary: self.error_boundaries.clone(),
            metrics_max_samples: self.performance.metrics_max_samples,
        };
        OptimizedExecutor::new(config, registry, client)
    }
}

/// Fetches a subgraph's SDL
#[async_trait]
pub trait SdlFetcher: Send + Sync + 'static {
    async fn fetch_sdl(&self, service: &ServiceDefinition) -> Result<String>;
}

#[async_trait]
impl SdlFetcher for HttpSubgraphClient {
    async fn fetch_sdl(&self, service: &ServiceDefinition) -> Result<String> {
        let request = SubgraphRequest {
            query: SERVICE_SDL_QUERY.to_string(),
            variables: Map::new(),
            operation_name: None,
        };
        let data = self.execute(service, &request).await?;
        data.pointer("/_service/sdl")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                Error::composition(format!("subgraph '{}' did not return its SDL", service.id))
                    .with_context("serviceId", &service.id)
            })
    }
}

/// Builds federated schemas
pub struct CompositionEngine {
    fetcher: Arc<dyn SdlFetcher>,
    timeout: Duration,
}

impl Default for CompositionEngine {
    fn default() -> Self {
        Self::new(Arc::new(HttpSubgraphClient::default()))
    }
}

impl CompositionEngine {
    pub fn new(fetcher: Arc<dyn SdlFetcher>) -> Self {
        Self {
            fetcher,
            timeout: COMPOSITION_TIMEOUT,
        }
    }

    /// Override the overall limit used by [`create_federated_schema`](Self::create_federated_schema).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn validate(&self, config: &FederationCompositionConfig) -> Result<()> {
        if config.entities.is_empty() {
            return Err(Error::validation("at least one federation entity is required"));
        }
        if config.services.is_empty() {
            return Err(Error::validation("at least one subgraph service is required"));
        }
        for service in &config.services {
            validate_service_url(&service.url).map_err(|reason| {
                Error::validation(reason).with_context("serviceId", &service.id)
            })?;
        }
        for entity in &config.entities {
            if entity.typename.trim().is_empty() {
                return Err(Error::validation("entity typename must not be empty"));
            }
            if entity.key.is_empty() || entity.key.iter().any(|k| k.trim().is_empty()) {
                return Err(Error::validation(format!(
                    "entity '{}' needs at least one non-empty key field",
                    entity.typename
                ))
                .with_context("typename", &entity.typename));
            }
        }
        config.error_boundaries.validate()?;
        config.performance.plan_cache.validate()?;
        config.performance.data_loader.validate()
    }

    /// Validate, fetch every SDL, merge and parse.
    #[instrument(skip_all, fields(services = config.services.len()))]
    pub async fn compose(&self, config: FederationCompositionConfig) -> Result<FederatedSchema> {
        self.validate(&config)?;

        let fetcher = &self.fetcher;
        let mut sdls: Vec<(usize, String)> = stream::iter(config.services.iter().enumerate())
            .map(|(index, service)| async move {
                let sdl = fetcher.fetch_sdl(service).await.map_err(|err| {
                    Error::composition(format!("failed to fetch SDL from '{}'", service.id))
                        .with_context("serviceId", &service.id)
                        .with_cause(err)
                })?;
                debug!(service = %service.id, bytes = sdl.len(), "Fetched subgraph SDL");
                Ok::<_, Error>((index, sdl))
            })
            .buffer_unordered(MAX_CONCURRENT_SDL_FETCHES)
            .try_collect()
            .await?;
        sdls.sort_by_key(|(index, _)| *index);

        let mut merger = SchemaMerger::default();
        for ((_, sdl), service) in sdls.iter().zip(&config.services) {
            merger.add_subgraph(&service.id, sdl)?;
        }
        let entity_names: Vec<&str> = config.entities.iter().map(|e| e.typename.as_str()).collect();
        let sdl = merger.finish(&entity_names)?;

        let document = parse_schema(&sdl).map_err(|e| {
            Error::composition("merged schema failed validation")
                .with_cause(Error::schema_validation(e.to_string()))
        })?;
        let type_names: Vec<String> = document
            .definitions
            .iter()
            .filter_map(|def| match def {
                TypeSystemDefinition::Type(ty) => Some(ty.node.name.node.to_string()),
                _ => None,
            })
            .collect();

        let metadata = SchemaMetadata {
            composed_at: Utc::now(),
            subgraph_count: config.services.len(),
            entity_count: config.entities.len(),
            type_count: type_names.len(),
        };
        info!(
            subgraphs = metadata.subgraph_count,
            entities = metadata.entity_count,
            types = metadata.type_count,
            "Supergraph composed"
        );

        Ok(FederatedSchema {
            sdl,
            type_names,
            entities: config
                .entities
                .into_iter()
                .map(|e| (e.typename.clone(), e))
                .collect(),
            services: config.services,
            error_boundaries: config.error_boundaries,
            performance: config.performance,
            metadata,
        })
    }

    /// Compose using the registry's current service list.
    pub async fn compose_from_registry(
        &self,
        registry: &SubgraphRegistry,
        entities: Vec<FederationEntity>,
    ) -> Result<FederatedSchema> {
        let services = registry.discover().await?;
        self.compose(FederationCompositionConfig::new(entities, services)).await
    }

    /// [`compose`](Self::compose) under the overall composition timeout.
    pub async fn create_federated_schema(&self, config: FederationCompositionConfig) -> Result<FederatedSchema> {
        match tokio::time::timeout(self.timeout, self.compose(config)).await {
            Ok(result) => result,
            Err(_) => Err(Error::composition(format!(
                "composition did not finish within {}ms",
                self.timeout.as_millis()
            ))
            .with_cause(Error::timeout("composition timed out"))),
        }
    }
}

impl std::fmt::Debug for CompositionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositionEngine")
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MergedKind {
    Scalar,
    Object,
    Interface,
    Union,
    Enum,
    InputObject,
}

impl MergedKind {
    fn of(kind: &TypeKind) -> Self {
        match kind {
            TypeKind::Scalar => MergedKind::Scalar,
            TypeKind::Object(_) => MergedKind::Object,
            TypeKind::Interface(_) => MergedKind::Interface,
            TypeKind::Union(_) => MergedKind::Union,
            TypeKind::Enum(_) => MergedKind::Enum,
            TypeKind::InputObject(_) => MergedKind::InputObject,
        }
    }

    fn keyword(self) -> &'static str {
        match self {
            MergedKind::Scalar => "scalar",
            MergedKind::Object => "type",
            MergedKind::Interface => "interface",
            MergedKind::Union => "union",
            MergedKind::Enum => "enum",
            MergedKind::InputObject => "input",
        }
    }
}

/// Entries keyed by name, first one kept, insertion order preserved.
#[derive(Debug, Default)]
struct OrderedEntries {
    names: HashSet<String>,
    rendered: Vec<String>,
}

impl OrderedEntries {
    fn add(&mut self, name: &str, rendered: String) {
        if self.names.insert(name.to_string()) {
            self.rendered.push(rendered);
        }
    }
}

#[derive(Debug)]
struct MergedType {
    kind: MergedKind,
    name: String,
    defined_by: String,
    implements: OrderedEntries,
    directives: OrderedEntries,
    entries: OrderedEntries,
}

#[derive(Debug, Default)]
struct SchemaMerger {
    types: Vec<MergedType>,
    index: HashMap<String, usize>,
}

impl SchemaMerger {
    fn add_subgraph(&mut self, service_id: &str, sdl: &str) -> Result<()> {
        let document = parse_schema(sdl).map_err(|e| {
            Error::composition(format!("subgraph '{}' has an invalid schema", service_id))
                .with_context("serviceId", service_id)
                .with_cause(Error::schema_validation(e.to_string()))
        })?;

        for definition in &document.definitions {
            if let TypeSystemDefinition::Type(ty) = definition {
                self.add_type(service_id, &ty.node)?;
            }
        }
        Ok(())
    }

    fn add_type(&mut self, service_id: &str, def: &TypeDefinition) -> Result<()> {
        let name = def.name.node.as_str();
        if FEDERATION_TYPES.contains(&name) {
            return Ok(());
        }
        let kind = MergedKind::of(&def.kind);

        let position = match self.index.get(name) {
            Some(&position) => {
                let existing = &self.types[position];
                if existing.kind != kind {
                    return Err(Error::composition(format!(
                        "type '{}' is a {} in '{}' but a {} in '{}'",
                        name,
                        existing.kind.keyword(),
                        existing.defined_by,
                        kind.keyword(),
                        service_id
                    ))
                    .with_context("typename", name));
                }
                position
            }
            None => {
                self.index.insert(name.to_string(), self.types.len());
                self.types.push(MergedType {
                    kind,
                    name: name.to_string(),
                    defined_by: service_id.to_string(),
                    implements: OrderedEntries::default(),
                    directives: OrderedEntries::default(),
                    entries: OrderedEntries::default(),
                });
                self.types.len() - 1
            }
        };

        let merged = &mut self.types[position];
        for directive in &def.directives {
            let rendered = render_directive(&directive.node);
            merged.directives.add(&rendered, rendered.clone());
        }

        let is_query = name == "Query";
        match &def.kind {
            TypeKind::Scalar => {}
            TypeKind::Object(object) => {
                add_implements(merged, &object.implements);
                for field in &object.fields {
                    let field_name = field.node.name.node.as_str();
                    if is_query && FEDERATION_QUERY_FIELDS.contains(&field_name) {
                        continue;
                    }
                    merged.entries.add(field_name, render_field(&field.node));
                }
            }
            TypeKind::Interface(interface) => {
                add_implements(merged, &interface.implements);
                for field in &interface.fields {
                    merged
                        .entries
                        .add(field.node.name.node.as_str(), render_field(&field.node));
                }
            }
            TypeKind::Union(union) => {
                for member in &union.members {
                    merged.entries.add(member.node.as_str(), member.node.to_string());
                }
            }
            TypeKind::Enum(enumeration) => {
                for value in &enumeration.values {
                    let mut rendered = value.node.value.node.to_string();
                    push_directives(&mut rendered, &value.node.directives);
                    merged.entries.add(value.node.value.node.as_str(), rendered);
                }
            }
            TypeKind::InputObject(input) => {
                for field in &input.fields {
                    merged
                        .entries
                        .add(field.node.name.node.as_str(), render_input_value(&field.node));
                }
            }
        }
        Ok(())
    }

    /// Render the merged schema with the federation entry points.
    fn finish(mut self, entities: &[&str]) -> Result<String> {
        let mut union_members: Vec<&str> = Vec::new();
        for entity in entities {
            match self.index.get(*entity).map(|&i| self.types[i].kind) {
                Some(MergedKind::Object) => {
                    if !union_members.contains(entity) {
                        union_members.push(*entity);
                    }
                }
                Some(other) => {
                    return Err(Error::composition(format!(
                        "entity '{}' must be an object type, found {}",
                        entity,
                        other.keyword()
                    ))
                    .with_context("typename", *entity))
                }
                None => {
                    return Err(Error::composition(format!(
                        "entity '{}' is not defined by any subgraph",
                        entity
                    ))
                    .with_context("typename", *entity))
                }
            }
        }

        let query_position = match self.index.get("Query") {
            Some(&position) => position,
            None => {
                self.types.push(MergedType {
                    kind: MergedKind::Object,
                    name: "Query".to_string(),
                    defined_by: "federation".to_string(),
                    implements: OrderedEntries::default(),
                    directives: OrderedEntries::default(),
                    entries: OrderedEntries::default(),
                });
                self.types.len() - 1
            }
        };
        let query = &mut self.types[query_position];
        query.entries.add("_service", "_service: _Service!".to_string());
        if !union_members.is_empty() {
            query.entries.add(
                "_entities",
                "_entities(representations: [_Any!]!): [_Entity]!".to_string(),
            );
        }

        let mut sdl = String::new();
        sdl.push_str("scalar _Any\n\ntype _Service {\n  sdl: String\n}\n\n");
        if !union_members.is_empty() {
            let _ = writeln!(sdl, "union _Entity = {}\n", union_members.join(" | "));
        }
        for merged in &self.types {
            render_type(&mut sdl, merged);
            sdl.push('\n');
        }
        Ok(sdl)
    }
}

fn add_implements(merged: &mut MergedType, implements: &[Positioned<async_graphql::Name>]) {
    for interface in implements {
        merged
            .implements
            .add(interface.node.as_str(), interface.node.to_string());
    }
}

fn render_type(out: &mut String, merged: &MergedType) {
    out.push_str(merged.kind.keyword());
    out.push(' ');
    out.push_str(&merged.name);
    if !merged.implements.rendered.is_empty() {
        let _ = write!(out, " implements {}", merged.implements.rendered.join(" & "));
    }
    for directive in &merged.directives.rendered {
        out.push(' ');
        out.push_str(directive);
    }

    match merged.kind {
        MergedKind::Scalar => out.push('\n'),
        MergedKind::Union => {
            if merged.entries.rendered.is_empty() {
                out.push('\n');
            } else {
                let _ = writeln!(out, " = {}", merged.entries.rendered.join(" | "));
            }
        }
        _ => {
            if merged.entries.rendered.is_empty() {
                out.push('\n');
            } else {
                out.push_str(" {\n");
                for entry in &merged.entries.rendered {
                    let _ = writeln!(out, "  {}", entry);
                }
                out.push_str("}\n");
            }
        }
    }
}

fn render_field(field: &FieldDefinition) -> String {
    let mut out = field.name.node.to_string();
    if !field.arguments.is_empty() {
        let args: Vec<String> = field
            .arguments
            .iter()
            .map(|arg| render_input_value(&arg.node))
            .collect();
        let _ = write!(out, "({})", args.join(", "));
    }
    let _ = write!(out, ": {}", field.ty.node);
    push_directives(&mut out, &field.directives);
    out
}

fn render_input_value(value: &InputValueDefinition) -> String {
    let mut out = format!("{}: {}", value.name.node, value.ty.node);
    if let Some(default) = &value.default_value {
        let _ = write!(out, " = {}", default.node);
    }
    push_directives(&mut out, &value.directives);
    out
}

fn push_directives(out: &mut String, directives: &[Positioned<ConstDirective>]) {
    for directive in directives {
        out.push(' ');
        out.push_str(&render_directive(&directive.node));
    }
}

fn render_directive(directive: &ConstDirective) -> String {
    let mut out = format!("@{}", directive.name.node);
    if !directive.arguments.is_empty() {
        let args: Vec<String> = directive
            .arguments
            .iter()
            .map(|(name, value)| format!("{}: {}", name.node, value.node))
            .collect();
        let _ = write!(out, "({})", args.join(", "));
    }
    out
}
