//! Integration tests for the demo module behind the `ambit` binary.

use std::sync::Arc;

use ambit::cli::demo::{demo_module, Collection, RoundDeps};
use ambit::{managed, resolve, ApplicationContext, DiError, MapConfigProvider, Scope, TaskRunner};

fn demo_app(folder: &std::path::Path) -> ApplicationContext {
    let (module, _) = demo_module();
    ApplicationContext::builder(module)
        .config(MapConfigProvider::new().with("storage.folder", folder.display().to_string()))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_round_log_written_when_round_closes() {
    let dir = tempfile::tempdir().unwrap();
    let app = demo_app(dir.path());
    let (_, definitions) = demo_module();
    let collection = app.scope_adapting_dynamic_proxy_dep(&definitions.collection);

    let (round, log_path) = app
        .scoped(Scope::Round, async {
            managed(|deps: RoundDeps| async move {
                let writer = collection.clone();
                let task = deps.runner.create_task(async move {
                    writer.add("round one notes".to_string()).await
                })?;
                assert_eq!(task.await??, 1);

                let hits = collection.search("ROUND").await?;
                assert_eq!(hits, ["round one notes"]);
                Ok::<_, DiError>((deps.state.id(), deps.state.log_path()))
            })
            .await
        })
        .await
        .unwrap();

    let log = std::fs::read_to_string(&log_path).unwrap();
    assert!(log_path.ends_with(format!("round-{round}.log")));
    assert!(log.contains("add round one notes"));
    assert!(log.contains("search ROUND"));

    app.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_search_client_shared_across_rounds() {
    let dir = tempfile::tempdir().unwrap();
    let app = demo_app(dir.path());
    let (_, definitions) = demo_module();

    let (a, b) = tokio::join!(
        app.scoped(Scope::Round, resolve(&definitions.search_client)),
        app.scoped(Scope::Round, resolve(&definitions.search_client)),
    );
    assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));

    let (x, y) = tokio::join!(
        app.scoped(Scope::Round, resolve(&definitions.round_state)),
        app.scoped(Scope::Round, resolve(&definitions.round_state)),
    );
    assert_ne!(x.unwrap().id(), y.unwrap().id());
}

#[tokio::test]
async fn test_unwritable_round_log_is_a_release_failure() {
    let dir = tempfile::tempdir().unwrap();
    let folder = dir.path().join("rounds");
    let app = demo_app(&folder);
    let (_, definitions) = demo_module();

    let err = app
        .scoped(Scope::Round, async {
            resolve(&definitions.round_state).await?;
            std::fs::remove_dir_all(&folder).map_err(DiError::operation)?;
            Ok::<_, DiError>(())
        })
        .await
        .unwrap_err();

    assert_eq!(err.provider_names(), ["round_state"]);
    assert!(err.to_string().contains("Round storage error"));
}

#[tokio::test]
async fn test_describe_demo_module() {
    let dir = tempfile::tempdir().unwrap();
    let app = demo_app(dir.path());
    let rows = app.describe();

    let collection = rows.iter().find(|row| row.name == "collection").unwrap();
    assert_eq!(collection.scope, Scope::Round);
    assert_eq!(collection.depends_on, ["round_state", "search_client"]);

    let json = serde_json::to_value(&rows).unwrap();
    assert!(json.as_array().unwrap().len() >= 5);
}
