//! Demo module exercised by the CLI.
//!
//! A small search service: a storage folder and a search client shared by
//! the whole application, plus per-round state and a per-round document
//! collection. Closing a round writes its event log into the storage folder.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::definition::{DependencyDefinition, Provision, Release};
use crate::error::DiError;
use crate::module::Module;
use crate::proxy::ScopeAdaptingProxy;
use crate::scope::Scope;
use crate::tasks::ContextTaskRunner;
use crate::Injectable;

static NEXT_ROUND: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Managed types
// ============================================================================

/// Singleton search client. Counts the queries it served.
#[derive(Debug, Default)]
pub struct SearchClient {
    queries: AtomicUsize,
}

impl SearchClient {
    /// Documents containing `query`, case-insensitively.
    pub fn search(&self, documents: &[String], query: &str) -> Vec<String> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        let needle = query.to_lowercase();
        documents
            .iter()
            .filter(|doc| doc.to_lowercase().contains(&needle))
            .cloned()
            .collect()
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Release for SearchClient {
    async fn release(&self) -> anyhow::Result<()> {
        tracing::info!(queries = self.queries(), "Search client closed");
        Ok(())
    }
}

/// Round-scoped state. Its event log is persisted when the round closes.
#[derive(Debug)]
pub struct RoundState {
    id: u64,
    folder: PathBuf,
    events: Mutex<Vec<String>>,
}

impl RoundState {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn record(&self, event: impl Into<String>) {
        self.events.lock().await.push(event.into());
    }

    pub async fn events(&self) -> Vec<String> {
        self.events.lock().await.clone()
    }

    pub fn log_path(&self) -> PathBuf {
        self.folder.join(format!("round-{}.log", self.id))
    }

    async fn persist(&self) -> Result<(), DiError> {
        let body = self.events.lock().await.join("\n");
        let path = self.log_path();
        tokio::fs::write(&path, body).await.map_err(|err| {
            DiError::RoundStorage(format!("failed to write {}: {}", path.display(), err))
        })
    }
}

/// Documents added during one round.
#[derive(Debug)]
pub struct RoundCollection {
    round: Arc<RoundState>,
    search: Arc<SearchClient>,
    documents: Mutex<Vec<String>>,
}

impl RoundCollection {
    pub fn round_id(&self) -> u64 {
        self.round.id()
    }

    pub async fn add(&self, document: String) -> usize {
        self.round.record(format!("add {document}")).await;
        let mut documents = self.documents.lock().await;
        documents.push(document);
        documents.len()
    }

    pub async fn search(&self, query: &str) -> Vec<String> {
        self.round.record(format!("search {query}")).await;
        let documents = self.documents.lock().await;
        self.search.search(&documents, query)
    }
}

/// Collection interface exposed over the scope-adapting proxy.
#[async_trait]
pub trait Collection: Send + Sync {
    async fn add(&self, document: String) -> Result<usize, DiError>;
    async fn search(&self, query: &str) -> Result<Vec<String>, DiError>;
    async fn round_id(&self) -> Result<u64, DiError>;
}

#[async_trait]
impl Collection for ScopeAdaptingProxy<RoundCollection> {
    async fn add(&self, document: String) -> Result<usize, DiError> {
        self.call(|collection| async move { collection.add(document).await })
            .await
    }

    async fn search(&self, query: &str) -> Result<Vec<String>, DiError> {
        self.call(|collection| async move { collection.search(query).await })
            .await
    }

    async fn round_id(&self) -> Result<u64, DiError> {
        self.with(RoundCollection::round_id).await
    }
}

// ============================================================================
// Module
// ============================================================================

/// Typed handles to the demo definitions.
#[derive(Debug, Clone)]
pub struct DemoDefinitions {
    pub storage_folder: DependencyDefinition<PathBuf>,
    pub search_client: DependencyDefinition<SearchClient>,
    pub round_state: DependencyDefinition<RoundState>,
    pub collection: DependencyDefinition<RoundCollection>,
}

/// Builds the demo module.
pub fn demo_module() -> (Module, DemoDefinitions) {
    let mut module = Module::new("demo");

    let storage_folder = module
        .provides("storage_folder", Scope::Singleton)
        .build(|deps| async move {
            let folder = deps
                .config::<PathBuf>("storage.folder")?
                .unwrap_or_else(|| std::env::temp_dir().join("ambit"));
            tokio::fs::create_dir_all(&folder).await?;
            tracing::debug!(folder = %folder.display(), "Storage folder ready");
            Ok(Provision::new(folder))
        });

    let search_client = module
        .provides("search_client", Scope::Singleton)
        .build(|_| async { Ok(Provision::releasable(SearchClient::default())) });

    let round_state = module
        .provides("round_state", Scope::Round)
        .depends_on(&storage_folder)
        .build({
            let storage_folder = storage_folder.clone();
            move |deps| {
                let folder = deps.get(&storage_folder);
                async move {
                    let state = RoundState {
                        id: NEXT_ROUND.fetch_add(1, Ordering::Relaxed),
                        folder: (*folder?).clone(),
                        events: Mutex::new(Vec::new()),
                    };
                    Ok(Provision::new(state).on_release(|state: Arc<RoundState>| async move {
                        state.persist().await?;
                        tracing::debug!(round = state.id(), "Round log written");
                        Ok(())
                    }))
                }
            }
        });

    let collection = module
        .provides("collection", Scope::Round)
        .depends_on(&round_state)
        .depends_on(&search_client)
        .build({
            let round_state = round_state.clone();
            let search_client = search_client.clone();
            move |deps| {
                let round = deps.get(&round_state);
                let search = deps.get(&search_client);
                async move {
                    Ok(Provision::new(RoundCollection {
                        round: round?,
                        search: search?,
                        documents: Mutex::new(Vec::new()),
                    }))
                }
            }
        });

    (
        module,
        DemoDefinitions {
            storage_folder,
            search_client,
            round_state,
            collection,
        },
    )
}

/// Call-time dependencies of one demo round.
#[derive(Injectable)]
pub struct RoundDeps {
    #[inject(dep = "round_state")]
    pub state: Arc<RoundState>,
    #[inject(dep = "task_runner")]
    pub runner: Arc<ContextTaskRunner>,
    #[inject(config = "demo.query", default = "round".to_string())]
    pub query: String,
}
