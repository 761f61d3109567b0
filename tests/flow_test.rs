// tests/flow_test.rs
use std::io::Write;
use std::sync::{Arc, Mutex};

use battery_core::{
    bus::Topic,
    event::{Collection, ErrorKind, ErrorReport, EventKind, RecoveryKind},
    flow::{save_flow_specs, FlowSpec, FlowTarget, Mapper, ScriptMapper},
    state::Entry,
    App, CoreConfig, EventBus, FlowEdge, FlowRouter,
};
use serde_json::{json, Value};

fn bare() -> (Arc<EventBus>, Arc<FlowRouter>) {
    let bus = EventBus::with_defaults();
    let router = FlowRouter::new(bus.clone(), ["ai", "calendar", "sync"]);
    router.attach();
    (bus, router)
}

fn payloads(bus: &Arc<EventBus>, target: &str) -> Vec<Value> {
    bus.get_history_by_kind(&EventKind::DataFlow(target.into()))
        .iter()
        .map(|e| e.data().clone())
        .collect()
}

#[test]
fn test_yaml_flow_file_drives_routing() {
    let (bus, router) = bare();
    let mut file = tempfile::Builder::new().suffix(".yml").tempfile().unwrap();
    file.write_all(
        br#"
- source: energy
  target: charts
  transform:
    type: script
    template: '{ "point": {{data.level}}, "entry": "{{id}}" }'
- source: energy
  target: insights
  transform:
    type: copy
    fields: [id, { "/data/mood": "unknown" }]
- source: energy
  target: calendar
  enabled: false
"#,
    )
    .unwrap();

    assert_eq!(router.load_flows_from_file(file.path()).unwrap(), 3);
    assert_eq!(router.active_flow_count(), 2);

    bus.emit(
        EventKind::EntryLogged(Collection::Energy),
        json!({ "id": "e-9", "data": { "level": 3 } }),
        "test",
    );

    assert_eq!(payloads(&bus, "charts"), vec![json!({ "point": 3, "entry": "e-9" })]);
    let insights = payloads(&bus, "insights");
    assert_eq!(insights.len(), 1);
    assert_eq!(insights[0]["id"], "e-9");
    assert!(payloads(&bus, "calendar").is_empty());
}

#[test]
fn test_json_flow_file_upserts_existing_edges() {
    let (bus, router) = bare();
    router.register_flow(FlowEdge::new("social", "insights")).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("flows.json");
    let specs = vec![FlowSpec {
        source: "social".into(),
        target: FlowTarget::from("insights"),
        transform: Some(Mapper::Script(ScriptMapper::new(r#"{ "battery": {{data.battery}} }"#))),
        enabled: true,
    }];
    save_flow_specs(&path, &specs).unwrap();

    assert_eq!(router.load_flows_from_file(&path).unwrap(), 1);
    assert_eq!(router.get_active_flows().len(), 1);
    assert!(router.get_active_flows()[0].has_transform);

    bus.emit(
        EventKind::EntryUpdated(Collection::Social),
        json!({ "id": "s-1", "data": { "battery": 2 } }),
        "test",
    );
    assert_eq!(payloads(&bus, "insights"), vec![json!({ "battery": 2 })]);
}

#[test]
fn test_routed_payload_can_feed_the_next_flow() {
    let app = App::with_defaults(CoreConfig::default()).unwrap();
    let state = app.state().clone();

    // the insights feature turns every routed entry into an insight record
    let _sub = app.bus().subscribe(EventKind::DataFlow("insights".into()), move |event| {
        let id = event.data()["id"].as_str().unwrap_or_default().to_string();
        state.add_entry(
            Collection::Insights,
            Entry::new(format!("insight-{id}"), json!({ "from": id })),
        )?;
        Ok(())
    });

    app.state()
        .add_entry(Collection::Social, Entry::new("s-1", json!({ "battery": 5 })))
        .unwrap();

    assert_eq!(app.state().count(Collection::Insights), 1);
    let notifications = payloads(app.bus(), "notifications");
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0]["id"], "insight-s-1");
}

#[test]
fn test_sync_broadcast_skips_its_own_source() {
    let app = App::with_defaults(CoreConfig::default()).unwrap();
    app.bus().emit(EventKind::SyncCompleted, json!({ "synced": 4 }), "sync-service");

    for target in ["charts", "insights", "notifications", "ai"] {
        assert_eq!(payloads(app.bus(), target), vec![json!({ "synced": 4 })], "target {target}");
    }
    assert!(payloads(app.bus(), "sync").is_empty());
}

#[test]
fn test_failing_edge_is_classified_as_data_flow() {
    let app = App::with_defaults(CoreConfig::default()).unwrap();
    app.router()
        .register_flow(FlowEdge::new("energy", "insights").with_fn(|_| anyhow::bail!("model not ready")))
        .unwrap();

    let reports = Arc::new(Mutex::new(Vec::new()));
    let seen = reports.clone();
    app.orchestrator().register_recovery_hook(RecoveryKind::DataFlow, move |report| {
        seen.lock().unwrap().push(report.clone());
        Ok(())
    });

    app.state()
        .add_entry(Collection::Energy, Entry::new("e-1", json!({ "level": 6 })))
        .unwrap();

    // siblings still delivered
    assert_eq!(payloads(app.bus(), "charts").len(), 1);
    assert_eq!(payloads(app.bus(), "ai").len(), 1);
    assert!(payloads(app.bus(), "insights").is_empty());

    let errors = app.bus().get_history_by_kind(&EventKind::ErrorOccurred);
    assert_eq!(errors.len(), 1);
    let report = ErrorReport::from_value(errors[0].data());
    assert_eq!(report.kind, ErrorKind::DataFlow);
    assert_eq!(report.context["target"], "insights");

    assert_eq!(
        app.bus()
            .get_history_by_kind(&EventKind::RecoveryAttempt(RecoveryKind::DataFlow))
            .len(),
        1
    );
    assert_eq!(reports.lock().unwrap().len(), 1);
    assert!(reports.lock().unwrap()[0].message.contains("model not ready"));
}

#[test]
fn test_detached_router_stops_routing() {
    let (bus, router) = bare();
    router.register_flow(FlowEdge::new("energy", "charts")).unwrap();
    assert_eq!(bus.listener_count(&Topic::Wildcard), 1);

    router.detach();
    bus.emit(EventKind::EntryLogged(Collection::Energy), json!({ "id": "e" }), "test");
    assert!(payloads(&bus, "charts").is_empty());
    assert!(!bus.has_bucket(&Topic::Wildcard));
}
