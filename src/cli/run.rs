//! Run command handler.

use color_eyre::eyre::eyre;
use color_eyre::Result;
use futures::future::join_all;

use crate::app_context::ApplicationContext;
use crate::config::{FigmentConfigProvider, Settings};
use crate::error::DiError;
use crate::placeholder::managed;
use crate::proxy::ScopeAdaptingProxy;
use crate::scope::Scope;
use crate::tasks::TaskRunner;

use super::demo::{demo_module, Collection, RoundCollection, RoundDeps};
use super::App;

/// Outcome of one demo round.
#[derive(Debug)]
struct RoundReport {
    round: u64,
    matches: usize,
    hits: Vec<String>,
    events: usize,
}

impl App {
    /// Run `rounds` concurrent rounds, each in its own round scope.
    pub async fn run_rounds(&self, rounds: usize) -> Result<()> {
        let settings = Settings::load()?;
        let (module, definitions) = demo_module();

        let app = ApplicationContext::builder(module)
            .config(FigmentConfigProvider::new(Settings::figment()))
            .settings(settings)
            .start()
            .await?;
        tracing::info!("Started application context '{}'", app.module_name());

        let collection = app.scope_adapting_dynamic_proxy_dep(&definitions.collection);
        let results = join_all((0..rounds).map(|index| {
            let app = app.clone();
            let collection = collection.clone();
            async move { app.scoped(Scope::Round, run_round(index, collection)).await }
        }))
        .await;

        let mut failures = 0;
        for result in results {
            match result {
                Ok(report) => tracing::info!(
                    round = report.round,
                    matches = report.matches,
                    hits = ?report.hits,
                    events = report.events,
                    "Round finished"
                ),
                Err(err) => {
                    failures += 1;
                    tracing::error!(error = %err, providers = ?err.provider_names(), "Round failed");
                }
            }
        }

        app.shutdown().await?;

        if failures > 0 {
            return Err(eyre!("{} of {} rounds failed", failures, rounds));
        }
        tracing::info!("All {} rounds completed", rounds);
        Ok(())
    }
}

/// One round: a spawned task fills the round's collection through the
/// proxy, then the round searches it.
async fn run_round(
    index: usize,
    collection: ScopeAdaptingProxy<RoundCollection>,
) -> Result<RoundReport, DiError> {
    managed(|deps: RoundDeps| async move {
        deps.state.record(format!("round {index} started")).await;

        let writer = collection.clone();
        let query = deps.query.clone();
        let task = deps.runner.create_task(async move {
            for n in 0..3 {
                writer.add(format!("{query} {index} document {n}")).await?;
            }
            Ok::<_, DiError>(())
        })?;
        task.await??;

        let hits = collection.search(&deps.query).await?;
        let matches = hits.len();
        Ok(RoundReport {
            round: collection.round_id().await?,
            matches,
            hits,
            events: deps.state.events().await.len(),
        })
    })
    .await
}
