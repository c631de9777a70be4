//! End-to-end tests for the request processor: submission, result
//! absorption, caching, stale drops, deadlock signaling, and alerting.

use std::time::Duration;

use ace_core::{
    Analysis, AnalysisModuleType, AnalysisRequest, CoreConfig, CoreSystem, DetectionPoint,
    InMemoryAlertSink, MemoryBlobStore, Observable, ObservableId, RootAnalysis,
};
use std::sync::Arc;

fn core() -> CoreSystem {
    CoreSystem::new(CoreConfig::default())
}

fn core_with_sink() -> (CoreSystem, Arc<InMemoryAlertSink>) {
    let sink = Arc::new(InMemoryAlertSink::new());
    let system = CoreSystem::with_subsystems(
        CoreConfig::default(),
        Arc::new(MemoryBlobStore::new()),
        Arc::clone(&sink) as Arc<dyn ace_core::AlertSink>,
    );
    (system, sink)
}

async fn lease(
    core: &CoreSystem,
    amt_name: &str,
    version: &str,
    owner: &str,
) -> AnalysisRequest {
    core.get_next_analysis_request(owner, amt_name, version, Duration::ZERO)
        .await
        .expect("work request")
        .expect("a request should be queued")
}

/// Run the module side of the loop: lease, mutate the result root through
/// `f`, post the result back.
async fn run_module<F>(core: &CoreSystem, amt_name: &str, version: &str, owner: &str, f: F)
where
    F: FnOnce(&mut RootAnalysis, &ObservableId),
{
    let mut request = lease(core, amt_name, version, owner).await;
    request.initialize_result();
    let observable = request.observable.clone().expect("observable request");
    f(&mut request.root, &observable);
    core.post_result(request).await.expect("result accepted");
}

fn complete_analysis() -> Analysis {
    Analysis::new().completed()
}

#[tokio::test]
async fn side_effects_from_concurrent_results_are_preserved() {
    let system = core();
    system
        .register_analysis_module_type(
            AnalysisModuleType::new("amt_a", "1.0.0").with_observable_types(["ipv4"]),
        )
        .unwrap();
    system
        .register_analysis_module_type(
            AnalysisModuleType::new("amt_b", "1.0.0").with_observable_types(["ipv4"]),
        )
        .unwrap();

    let mut root = RootAnalysis::new();
    root.add_observable(Observable::new("ipv4", "3.127.0.4"));
    let uuid = system.submit(root).await.unwrap();

    // amt_b returns first, tagging the observable
    run_module(&system, "amt_b", "1.0.0", "mod-b", |result, observable| {
        let target = result.get_observable_mut(observable).unwrap();
        target.add_tag("malicious");
        target.add_analysis("amt_b", complete_analysis());
    })
    .await;

    // amt_a returns second with only an analysis record
    run_module(&system, "amt_a", "1.0.0", "mod-a", |result, observable| {
        let target = result.get_observable_mut(observable).unwrap();
        target.add_analysis("amt_a", complete_analysis().with_summary("clean"));
    })
    .await;

    let tracked = system.get_root(&uuid).unwrap();
    assert!(tracked.completed);
    let observable = tracked
        .get_observable(&ObservableId::new("ipv4", "3.127.0.4"))
        .unwrap();
    assert!(observable.get_analysis("amt_a").is_some());
    assert!(observable.get_analysis("amt_b").is_some());
    assert!(observable.has_tag("malicious"));
}

#[tokio::test]
async fn mode_change_survives_a_later_unchanged_result() {
    let system = core();
    for name in ["amt_a", "amt_b"] {
        system
            .register_analysis_module_type(
                AnalysisModuleType::new(name, "1.0.0").with_observable_types(["ipv4"]),
            )
            .unwrap();
    }

    let mut root = RootAnalysis::new().with_analysis_mode("analysis");
    root.add_observable(Observable::new("ipv4", "10.0.0.1"));
    let uuid = system.submit(root).await.unwrap();

    // amt_a escalates the analysis mode
    run_module(&system, "amt_a", "1.0.0", "mod-a", |result, observable| {
        result.analysis_mode = "correlation".to_string();
        let target = result.get_observable_mut(observable).unwrap();
        target.add_analysis("amt_a", complete_analysis());
    })
    .await;

    // amt_b returns later with the mode untouched in its before/after pair
    run_module(&system, "amt_b", "1.0.0", "mod-b", |result, observable| {
        let target = result.get_observable_mut(observable).unwrap();
        target.add_analysis("amt_b", complete_analysis());
    })
    .await;

    let tracked = system.get_root(&uuid).unwrap();
    assert_eq!(tracked.analysis_mode, "correlation");
    assert!(tracked.completed);
}

#[tokio::test]
async fn cache_hit_skips_the_queue_round_trip() {
    let system = core();
    system
        .register_analysis_module_type(
            AnalysisModuleType::new("amt_whois", "1.0.0")
                .with_observable_types(["ipv4"])
                .with_cache_ttl(3600),
        )
        .unwrap();

    let mut first = RootAnalysis::new();
    first.add_observable(Observable::new("ipv4", "8.8.8.8"));
    let first_uuid = system.submit(first).await.unwrap();

    run_module(&system, "amt_whois", "1.0.0", "mod-whois", |result, observable| {
        let target = result.get_observable_mut(observable).unwrap();
        target.add_tag("resolved");
        target.add_analysis("amt_whois", complete_analysis().with_summary("registrar: example"));
    })
    .await;
    assert!(system.get_root(&first_uuid).unwrap().completed);

    // the second root carrying the same observable replays from cache
    let mut second = RootAnalysis::new();
    second.add_observable(Observable::new("ipv4", "8.8.8.8"));
    let second_uuid = system.submit(second).await.unwrap();

    assert_eq!(system.queue_size("amt_whois"), 0, "no queue round-trip");
    let replayed = system.get_root(&second_uuid).unwrap();
    assert!(replayed.completed);

    let observable = replayed
        .get_observable(&ObservableId::new("ipv4", "8.8.8.8"))
        .unwrap();
    let analysis = observable.get_analysis("amt_whois").unwrap();
    assert_eq!(analysis.summary.as_deref(), Some("registrar: example"));
    assert!(observable.has_tag("resolved"));
}

#[tokio::test]
async fn stale_result_is_dropped_after_version_replacement() {
    let system = core();
    let mut modified_events = system.subscribe("/core/module/modified");

    system
        .register_analysis_module_type(
            AnalysisModuleType::new("amt_x", "1.0.0").with_observable_types(["ipv4"]),
        )
        .unwrap();

    let mut root = RootAnalysis::new();
    root.add_observable(Observable::new("ipv4", "172.16.0.9"));
    let uuid = system.submit(root).await.unwrap();

    // lease under v1, then invalidate the queue by re-registering at v2
    let mut leased = lease(&system, "amt_x", "1.0.0", "mod-x").await;
    system
        .register_analysis_module_type(
            AnalysisModuleType::new("amt_x", "2.0.0").with_observable_types(["ipv4"]),
        )
        .unwrap();

    let modified = modified_events.recv().await.unwrap();
    assert_eq!(modified.payload["name"], "amt_x");

    leased.initialize_result();
    let observable = leased.observable.clone().unwrap();
    leased
        .root
        .get_observable_mut(&observable)
        .unwrap()
        .add_analysis("amt_x", complete_analysis());

    // silently dropped, not an error
    system.post_result(leased).await.unwrap();

    let tracked = system.get_root(&uuid).unwrap();
    let observable = tracked
        .get_observable(&ObservableId::new("ipv4", "172.16.0.9"))
        .unwrap();
    assert!(observable.get_analysis("amt_x").is_none());

    // the observable re-queued onto the v2 queue
    assert_eq!(system.queue_size("amt_x"), 1);
}

#[tokio::test]
async fn detections_alert_exactly_once_until_they_grow() {
    let (system, sink) = core_with_sink();
    system
        .register_analysis_module_type(
            AnalysisModuleType::new("amt_c", "1.0.0").with_observable_types(["url"]),
        )
        .unwrap();

    let mut root = RootAnalysis::new();
    root.add_observable(Observable::new("url", "http://evil.test/payload"));
    let uuid = system.submit(root.clone()).await.unwrap();

    run_module(&system, "amt_c", "1.0.0", "mod-c", |result, observable| {
        let target = result.get_observable_mut(observable).unwrap();
        target.add_detection_point(DetectionPoint::new("known malware distribution host"));
        target.add_analysis("amt_c", complete_analysis());
    })
    .await;
    assert_eq!(sink.times_alerted(&uuid), 1);

    // re-submitting the same root-level state adds no detections
    system.submit(root).await.unwrap();
    assert_eq!(sink.times_alerted(&uuid), 1, "no re-alert without growth");

    // a new detection point re-escalates
    let mut update = system.get_root(&uuid).unwrap();
    update.add_detection_point(DetectionPoint::new("second stage beacon"));
    system.submit(update).await.unwrap();
    assert_eq!(sink.times_alerted(&uuid), 2);
}

#[tokio::test]
async fn completion_fires_when_no_requests_remain() {
    let system = core();
    let mut completed_events = system.subscribe("/core/analysis/root/completed");

    system
        .register_analysis_module_type(
            AnalysisModuleType::new("amt_a", "1.0.0").with_observable_types(["ipv4"]),
        )
        .unwrap();

    let mut root = RootAnalysis::new();
    root.add_observable(Observable::new("ipv4", "192.0.2.1"));
    let uuid = system.submit(root).await.unwrap();
    assert!(!system.get_root(&uuid).unwrap().completed);

    run_module(&system, "amt_a", "1.0.0", "mod-a", |result, observable| {
        let target = result.get_observable_mut(observable).unwrap();
        target.add_analysis("amt_a", complete_analysis());
    })
    .await;

    assert!(system.get_root(&uuid).unwrap().completed);
    let event = completed_events.recv().await.unwrap();
    assert_eq!(event.payload["uuid"], uuid.to_string());
}

#[tokio::test]
async fn newly_discovered_observables_are_requeued() {
    let system = core();
    system
        .register_analysis_module_type(
            AnalysisModuleType::new("amt_crawl", "1.0.0").with_observable_types(["url"]),
        )
        .unwrap();
    system
        .register_analysis_module_type(
            AnalysisModuleType::new("amt_geo", "1.0.0").with_observable_types(["ipv4"]),
        )
        .unwrap();

    let mut root = RootAnalysis::new();
    root.add_observable(Observable::new("url", "http://evil.test/"));
    let uuid = system.submit(root).await.unwrap();

    // the crawl discovers an ipv4, which must fan out to amt_geo
    run_module(&system, "amt_crawl", "1.0.0", "mod-crawl", |result, observable| {
        let discovered = Observable::new("ipv4", "198.51.100.7");
        let discovered_id = discovered.identity();
        result.add_observable(discovered);

        let target = result.get_observable_mut(observable).unwrap();
        let mut analysis = complete_analysis();
        analysis.add_observable_reference(discovered_id);
        target.add_analysis("amt_crawl", analysis);
    })
    .await;

    let tracked = system.get_root(&uuid).unwrap();
    assert!(!tracked.completed, "geo lookup still outstanding");
    assert_eq!(system.queue_size("amt_geo"), 1);

    run_module(&system, "amt_geo", "1.0.0", "mod-geo", |result, observable| {
        let target = result.get_observable_mut(observable).unwrap();
        target.add_analysis("amt_geo", complete_analysis());
    })
    .await;

    let tracked = system.get_root(&uuid).unwrap();
    assert!(tracked.completed);
    assert!(tracked
        .get_observable(&ObservableId::new("ipv4", "198.51.100.7"))
        .is_some());
}

#[tokio::test]
async fn canceled_roots_spawn_no_work_and_never_alert() {
    let (system, sink) = core_with_sink();
    system
        .register_analysis_module_type(
            AnalysisModuleType::new("amt_a", "1.0.0").with_observable_types(["ipv4"]),
        )
        .unwrap();

    let mut root = RootAnalysis::new();
    root.canceled = true;
    root.add_detection_point(DetectionPoint::new("preexisting"));
    root.add_observable(Observable::new("ipv4", "203.0.113.5"));
    let uuid = system.submit(root).await.unwrap();

    assert_eq!(system.queue_size("amt_a"), 0);
    assert_eq!(sink.times_alerted(&uuid), 0);
}

#[tokio::test]
async fn manual_module_types_are_not_auto_dispatched() {
    let system = core();
    system
        .register_analysis_module_type(
            AnalysisModuleType::new("amt_sandbox", "1.0.0")
                .with_observable_types(["file"])
                .manual(),
        )
        .unwrap();

    let mut root = RootAnalysis::new();
    root.add_observable(Observable::new("file", "dropper.exe"));
    let uuid = system.submit(root).await.unwrap();

    assert_eq!(system.queue_size("amt_sandbox"), 0);
    assert!(system.get_root(&uuid).unwrap().completed);
}

#[tokio::test]
async fn excluded_analysis_is_honored() {
    let system = core();
    system
        .register_analysis_module_type(
            AnalysisModuleType::new("amt_a", "1.0.0").with_observable_types(["ipv4"]),
        )
        .unwrap();

    let mut root = RootAnalysis::new();
    let mut observable = Observable::new("ipv4", "198.18.0.1");
    observable.exclude_analysis("amt_a");
    root.add_observable(observable);
    let uuid = system.submit(root).await.unwrap();

    assert_eq!(system.queue_size("amt_a"), 0);
    assert!(system.get_root(&uuid).unwrap().completed);
}

#[tokio::test]
async fn expiring_roots_are_deleted_on_completion() {
    let system = core();
    let mut expired_events = system.subscribe("/core/analysis/root/expired");

    let mut root = RootAnalysis::new();
    root.expires = true;
    root.add_observable(Observable::new("ipv4", "192.0.2.8"));
    let uuid = system.submit(root).await.unwrap();

    // no module types registered, so the root completes and expires at once
    assert!(system.get_root(&uuid).is_none());
    let event = expired_events.recv().await.unwrap();
    assert_eq!(event.payload["uuid"], uuid.to_string());
}

#[tokio::test]
async fn resubmission_direct_merges_into_tracked_root() {
    let system = core();

    let mut root = RootAnalysis::new();
    root.add_observable(Observable::new("ipv4", "192.0.2.77"));
    let uuid = system.submit(root.clone()).await.unwrap();

    let mut update = root.clone();
    update.analysis_mode = "correlation".to_string();
    update.add_observable(Observable::new("user", "jdoe"));
    system.submit(update).await.unwrap();

    let tracked = system.get_root(&uuid).unwrap();
    // direct merge adds observables but leaves scalars of the tracked root
    assert_eq!(tracked.observables.len(), 2);
    assert_eq!(tracked.analysis_mode, "analysis");
}

#[tokio::test]
async fn version_mismatch_on_work_request_returns_none() {
    let system = core();
    system
        .register_analysis_module_type(
            AnalysisModuleType::new("amt_x", "2.0.0").with_observable_types(["ipv4"]),
        )
        .unwrap();

    let mut root = RootAnalysis::new();
    root.add_observable(Observable::new("ipv4", "192.0.2.3"));
    system.submit(root).await.unwrap();

    let stale = system
        .get_next_analysis_request("mod-x", "amt_x", "1.0.0", Duration::ZERO)
        .await
        .unwrap();
    assert!(stale.is_none(), "stale module version gets no work");

    let current = system
        .get_next_analysis_request("mod-x", "amt_x", "2.0.0", Duration::ZERO)
        .await
        .unwrap();
    assert!(current.is_some());
}
