//! Integration tests for scope lifecycles: release ordering, teardown error
//! reporting, cancellation and eager startup.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use ambit::config::RuntimeSettings;
use ambit::{
    create_app_context, resolve, ApplicationContext, DependencyDefinition, DiError, Module,
    Provision, Scope, ScopeState,
};
use tokio::sync::oneshot;

type Log = Arc<Mutex<Vec<String>>>;

/// Registers a provider whose release appends its name to `log`.
fn tracked(
    module: &mut Module,
    name: &'static str,
    scope: Scope,
    depends_on: &[&'static str],
    log: &Log,
    fail_release: bool,
) -> DependencyDefinition<String> {
    let mut provider = module.provides(name, scope);
    for dep in depends_on {
        provider = provider.depends_on_name(*dep);
    }
    let log = log.clone();
    provider.build(move |_| {
        let log = log.clone();
        async move {
            Ok(Provision::new(name.to_string()).on_release(move |_| async move {
                log.lock().unwrap().push(name.to_string());
                if fail_release {
                    anyhow::bail!("{name} refused to close");
                }
                Ok(())
            }))
        }
    })
}

fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

#[tokio::test]
async fn test_round_releases_in_reverse_build_order() {
    let log = Log::default();
    let mut module = Module::new("app");
    tracked(&mut module, "a", Scope::Round, &[], &log, false);
    tracked(&mut module, "b", Scope::Round, &["a"], &log, false);
    let c = tracked(&mut module, "c", Scope::Round, &["b"], &log, false);

    let app = create_app_context(module).unwrap();
    app.scoped(Scope::Round, async { resolve(&c).await })
        .await
        .unwrap();

    assert_eq!(entries(&log), ["c", "b", "a"]);
}

#[tokio::test]
async fn test_release_failures_are_aggregated_and_do_not_stop_teardown() {
    let log = Log::default();
    let mut module = Module::new("app");
    tracked(&mut module, "a", Scope::Round, &[], &log, true);
    tracked(&mut module, "b", Scope::Round, &["a"], &log, false);
    let c = tracked(&mut module, "c", Scope::Round, &["b"], &log, true);

    let app = create_app_context(module).unwrap();
    let err = app
        .scoped(Scope::Round, async { resolve(&c).await })
        .await
        .unwrap_err();

    assert_eq!(entries(&log), ["c", "b", "a"]);
    assert!(matches!(err, DiError::ProviderRelease { .. }));
    assert_eq!(err.provider_names(), ["c", "a"]);
}

#[tokio::test]
async fn test_release_failure_is_attached_to_primary_error() {
    let log = Log::default();
    let mut module = Module::new("app");
    let a = tracked(&mut module, "a", Scope::Round, &[], &log, true);

    let app = create_app_context(module).unwrap();
    let err = app
        .scoped(Scope::Round, async {
            resolve(&a).await?;
            Err::<(), _>(DiError::operation(anyhow::anyhow!("handler failed")))
        })
        .await
        .unwrap_err();

    match &err {
        DiError::Teardown { primary, release } => {
            assert!(matches!(**primary, DiError::Operation(_)));
            assert_eq!(release.provider_names(), ["a"]);
        }
        other => panic!("expected teardown error, got {other:?}"),
    }
    assert_eq!(entries(&log), ["a"]);
}

#[tokio::test]
async fn test_singletons_released_on_shutdown() {
    let log = Log::default();
    let mut module = Module::new("app");
    tracked(&mut module, "db", Scope::Singleton, &[], &log, false);
    let repo = tracked(&mut module, "repo", Scope::Singleton, &["db"], &log, false);

    let app = create_app_context(module).unwrap();
    app.resolve(&repo).await.unwrap();
    assert!(entries(&log).is_empty());

    app.shutdown().await.unwrap();
    assert_eq!(entries(&log), ["repo", "db"]);
    assert_eq!(app.singleton_scope().state(), ScopeState::Closed);

    let err = app.resolve(&repo).await.unwrap_err();
    assert!(matches!(err, DiError::ManagedScope(_)));
}

#[tokio::test]
async fn test_round_instances_are_isolated() {
    let log = Log::default();
    let mut module = Module::new("app");
    let session = tracked(&mut module, "session", Scope::Round, &[], &log, false);
    let app = create_app_context(module).unwrap();

    let (first, second) = tokio::join!(
        app.scoped(Scope::Round, async {
            let one = resolve(&session).await?;
            let again = resolve(&session).await?;
            assert!(Arc::ptr_eq(&one, &again));
            Ok::<_, DiError>(one)
        }),
        app.scoped(Scope::Round, async { resolve(&session).await }),
    );

    assert!(!Arc::ptr_eq(&first.unwrap(), &second.unwrap()));
    assert_eq!(entries(&log), ["session", "session"]);
}

#[tokio::test]
async fn test_transient_is_rebuilt_and_released_by_innermost_scope() {
    let log = Log::default();
    let mut module = Module::new("app");
    let temp = tracked(&mut module, "temp", Scope::Transient, &[], &log, false);
    let app = create_app_context(module).unwrap();

    app.scoped(Scope::Round, async {
        let one = resolve(&temp).await?;
        let two = resolve(&temp).await?;
        assert!(!Arc::ptr_eq(&one, &two));
        Ok::<_, DiError>(())
    })
    .await
    .unwrap();
    assert_eq!(entries(&log), ["temp", "temp"]);

    // Outside a round the singleton scope adopts it
    app.run(resolve(&temp)).await.unwrap();
    assert_eq!(entries(&log).len(), 2);
    app.shutdown().await.unwrap();
    assert_eq!(entries(&log).len(), 3);
}

#[tokio::test]
async fn test_cancelled_operation_still_closes_its_scope() {
    let (tx, rx) = oneshot::channel::<()>();
    let tx = Arc::new(Mutex::new(Some(tx)));

    let mut module = Module::new("app");
    let connection = module
        .provides("connection", Scope::Round)
        .build(move |_| {
            let tx = tx.clone();
            async move {
                Ok(Provision::new(()).on_release(move |_| async move {
                    if let Some(tx) = tx.lock().unwrap().take() {
                        let _ = tx.send(());
                    }
                    Ok(())
                }))
            }
        });
    let app = create_app_context(module).unwrap();

    let outcome = tokio::time::timeout(
        Duration::from_millis(20),
        app.scoped(Scope::Round, async {
            resolve(&connection).await?;
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, DiError>(())
        }),
    )
    .await;
    assert!(outcome.is_err(), "operation should have been cancelled");

    tokio::time::timeout(Duration::from_secs(1), rx)
        .await
        .expect("scope was not closed after cancellation")
        .unwrap();
}

#[tokio::test]
async fn test_release_timeout_counts_as_failure() {
    let mut module = Module::new("app");
    let slow = module.provides("slow", Scope::Round).build(|_| async {
        Ok(Provision::new(()).on_release(|_| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }))
    });

    let app = ApplicationContext::builder(module)
        .runtime(RuntimeSettings {
            release_timeout_ms: Some(10),
            ..Default::default()
        })
        .build()
        .unwrap();

    let err = app
        .scoped(Scope::Round, async { resolve(&slow).await })
        .await
        .unwrap_err();
    assert_eq!(err.provider_names(), ["slow"]);
    assert!(err.to_string().contains("timed out"));
}

#[tokio::test]
async fn test_eager_startup_failure_releases_built_singletons() {
    let log = Log::default();
    let mut module = Module::new("app");
    tracked(&mut module, "alpha", Scope::Singleton, &[], &log, false);
    module
        .provides("broken", Scope::Singleton)
        .build(|_| async { Err::<Provision<()>, _>(anyhow::anyhow!("no credentials")) });

    let err = ApplicationContext::builder(module)
        .runtime(RuntimeSettings {
            eager_singletons: true,
            ..Default::default()
        })
        .start()
        .await
        .unwrap_err();

    assert_eq!(err.provider_names(), ["broken"]);
    assert_eq!(entries(&log), ["alpha"]);
}

#[tokio::test]
async fn test_round_scope_cannot_open_inside_closed_parent() {
    let app = create_app_context(Module::new("app")).unwrap();
    let outer = app.open_scope(Scope::Round).unwrap();
    let nested_context = outer.context().clone();
    outer.close().await.unwrap();

    let err = nested_context.open_scope(Scope::Round).unwrap_err();
    assert!(matches!(err, DiError::ManagedScope(_)));
}

#[tokio::test]
async fn test_singleton_scope_cannot_be_opened() {
    let app = create_app_context(Module::new("app")).unwrap();
    assert!(matches!(
        app.open_scope(Scope::Singleton),
        Err(DiError::ManagedScope(_))
    ));
}
