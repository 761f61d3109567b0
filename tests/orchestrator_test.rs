// tests/orchestrator_test.rs
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use battery_core::{
    event::{Collection, EventKind},
    flow::FlowTarget,
    module::{FnModule, ModuleDescriptor, NoopModule, ResolverError},
    orchestrator::probe::IntegrationProbe,
    state::Entry,
    App, CoreConfig, Health, OrchestratorError,
};
use futures::future::join_all;
use serde_json::json;

fn counting_module(counter: Arc<AtomicUsize>) -> Arc<FnModule> {
    FnModule::new(move |_ctx| {
        counter.fetch_add(1, Ordering::SeqCst);
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(())
        }
    })
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_initialize_boots_once() {
    let app = App::new(CoreConfig::default()).unwrap();
    let inits = Arc::new(AtomicUsize::new(0));
    app.resolver()
        .register_module(ModuleDescriptor::new("energy", 1), counting_module(inits.clone()))
        .unwrap();
    app.resolver()
        .register_module(
            ModuleDescriptor::new("charts", 2).depends_on(["energy"]),
            counting_module(inits.clone()),
        )
        .unwrap();

    let outcomes = join_all((0..8).map(|_| app.start())).await;

    assert_eq!(inits.load(Ordering::SeqCst), 2);
    let first = outcomes[0].clone().unwrap();
    assert_eq!(first.load.loaded, vec!["energy".to_string(), "charts".to_string()]);
    assert!(outcomes.iter().all(|o| o.as_ref() == Ok(&first)));
    assert_eq!(app.bus().get_history_by_kind(&EventKind::SystemReady).len(), 1);

    // later callers get the cached outcome without booting again
    app.start().await.unwrap();
    assert_eq!(inits.load(Ordering::SeqCst), 2);
    app.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_initialize_shares_failure() {
    let app = App::new(CoreConfig::default()).unwrap();
    let attempts = Arc::new(AtomicUsize::new(0));
    let a = attempts.clone();
    let broken = FnModule::new(move |_ctx| {
        a.fetch_add(1, Ordering::SeqCst);
        async { anyhow::bail!("storage unavailable") }
    });
    app.resolver().register_module(ModuleDescriptor::new("energy", 1), broken).unwrap();

    let outcomes = join_all((0..4).map(|_| app.start())).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    let first = outcomes[0].clone().unwrap_err();
    assert!(matches!(
        first,
        OrchestratorError::Resolver(ResolverError::CriticalModuleLoadFailure { .. })
    ));
    assert!(outcomes.iter().all(|o| o.as_ref().err() == Some(&first)));
    assert_eq!(app.bus().get_history_by_kind(&EventKind::SystemFailed).len(), 1);
}

#[tokio::test]
async fn test_critical_failure_excludes_dependents() {
    let app = App::new(CoreConfig::default()).unwrap();
    let resolver = app.resolver();
    resolver
        .register_module(
            ModuleDescriptor::new("energy", 1),
            FnModule::new(|_ctx| async { anyhow::bail!("corrupt store") }),
        )
        .unwrap();
    resolver
        .register_module(ModuleDescriptor::new("charts", 2).depends_on(["energy"]), Arc::new(NoopModule))
        .unwrap();
    resolver
        .register_module(
            ModuleDescriptor::new("insights", 3).depends_on(["energy", "charts"]),
            Arc::new(NoopModule),
        )
        .unwrap();

    let err = app.start().await.unwrap_err();
    match err {
        OrchestratorError::Resolver(ResolverError::CriticalModuleLoadFailure { module, reason }) => {
            assert_eq!(module, "energy");
            assert!(reason.contains("corrupt store"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(resolver.loaded_modules().is_empty());
    assert!(!resolver.is_loaded("charts"));
    assert!(!resolver.is_loaded("insights"));

    let status = app.orchestrator().get_status();
    assert!(!status.initialized);
    assert_eq!(status.health, Health::Error);
    assert_eq!(
        app.bus().get_history_by_kind(&EventKind::FeatureFailed("energy".into())).len(),
        1
    );
}

#[tokio::test]
async fn test_cycle_fails_before_any_module_loads() {
    let app = App::new(CoreConfig::default()).unwrap();
    let inits = Arc::new(AtomicUsize::new(0));
    let resolver = app.resolver();
    resolver
        .register_module(ModuleDescriptor::new("sync", 6), counting_module(inits.clone()))
        .unwrap();
    resolver
        .register_module(ModuleDescriptor::new("a", 2).depends_on(["b"]), counting_module(inits.clone()))
        .unwrap();
    resolver
        .register_module(ModuleDescriptor::new("b", 3).depends_on(["a"]), counting_module(inits.clone()))
        .unwrap();

    let err = app.start().await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Resolver(ResolverError::CycleDetected { .. })
    ));
    assert_eq!(inits.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_probe_failures_are_aggregated() {
    let app = App::with_defaults(CoreConfig::default()).unwrap();
    // nothing ever answers these two
    app.orchestrator().add_probe(IntegrationProbe::new(
        "calendar-sync",
        EventKind::custom("calendar:request"),
        EventKind::custom("calendar:response"),
    ));
    app.orchestrator().add_probe(IntegrationProbe::new(
        "pwa-install",
        EventKind::custom("pwa:prompt"),
        EventKind::AppInstalled,
    ));

    let err = app.start().await.unwrap_err();
    let mut failed = err.failed_probes();
    failed.sort();
    assert_eq!(failed, vec!["calendar-sync", "pwa-install"]);

    // modules did load; only verification failed
    assert_eq!(app.resolver().loaded_modules().len(), 8);
    assert!(app.orchestrator().last_consistency_report().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_default_app_boots_healthy() {
    let app = App::with_defaults(CoreConfig::default()).unwrap();
    let report = app.start().await.unwrap();

    assert_eq!(report.load.loaded.len(), 8);
    assert!(report.load.failed.is_empty());
    assert_eq!(report.probes_passed.len(), 3);

    let status = app.orchestrator().get_status();
    assert!(status.initialized);
    assert_eq!(status.loaded_module_count, 8);
    assert_eq!(status.active_flow_count, 7);
    assert_eq!(status.health, Health::Healthy);

    let readiness = app.resolver().get_readiness();
    assert!(readiness.critical_loaded);
    app.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_non_critical_failure_degrades_to_warning() {
    let app = App::with_defaults(CoreConfig::default()).unwrap();
    app.resolver()
        .register_module(
            ModuleDescriptor::new("ai", 5).depends_on(["insights"]),
            FnModule::new(|_ctx| async { anyhow::bail!("model offline") }),
        )
        .unwrap();

    let report = app.start().await.unwrap();
    assert_eq!(report.load.failed.len(), 1);
    assert_eq!(report.load.failed[0].0, "ai");

    let status = app.orchestrator().get_status();
    assert_eq!(status.loaded_module_count, 7);
    assert_eq!(status.health, Health::Warning);
    app.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_logged_entry_reaches_charts() {
    let app = App::with_defaults(CoreConfig::default()).unwrap();
    app.start().await.unwrap();
    app.bus().clear_history();

    app.state()
        .add_entry(Collection::Energy, Entry::new("e-1", json!({ "level": 7 })))
        .unwrap();

    let charts = app.bus().get_history_by_kind(&EventKind::DataFlow("charts".into()));
    assert_eq!(charts.len(), 1);
    assert_eq!(charts[0].source(), "flow:energy");
    assert_eq!(charts[0].data()["id"], "e-1");
    assert_eq!(charts[0].data()["value"], 7);
    assert_eq!(charts[0].data()["mood"], "neutral");

    let insights = app.bus().get_history_by_kind(&EventKind::DataFlow("insights".into()));
    assert_eq!(insights.len(), 1);
    assert_eq!(insights[0].data()["data"]["level"], 7);
    app.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_offline_online_round_trip_reenables_everything() {
    let app = App::with_defaults(CoreConfig::default()).unwrap();
    app.start().await.unwrap();
    let router = app.router();

    router.disable("energy", "charts").unwrap();
    assert_eq!(router.active_flow_count(), 6);

    app.state().set_online(false).unwrap();
    assert!(!router.is_online());
    let active: Vec<_> = router.get_active_flows().into_iter().filter(|f| f.enabled).collect();
    assert!(active.iter().all(|f| f.target != FlowTarget::from("ai")));
    // "all" is not a network target
    assert!(active.iter().any(|f| f.target == FlowTarget::All));
    assert_eq!(active.len(), 5);

    app.state().set_online(true).unwrap();
    assert!(router.is_online());
    assert_eq!(router.active_flow_count(), 7);
    app.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_consistency_runs_after_activity() {
    let app = App::with_defaults(CoreConfig::default()).unwrap();
    app.start().await.unwrap();
    assert!(app.orchestrator().last_consistency_report().is_none());

    for i in 0..3 {
        app.state()
            .add_entry(Collection::Social, Entry::new(format!("s-{i}"), json!({ "battery": 4 })))
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let report = app.orchestrator().last_consistency_report().unwrap();
    assert!(report.consistent);
    assert_eq!(report.counts.social, 3);
    assert_eq!(app.bus().get_history_by_kind(&EventKind::ConsistencyChecked).len(), 1);
    app.shutdown();
}
