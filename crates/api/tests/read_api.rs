use std::sync::Arc;

use axum::http::StatusCode;
use axum_test::TestServer;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use ordin_api::{router, ApiState, ErrorBody, Pong, Stats};
use ordin_queue::PipelineStats;
use ordin_store::MirrorStore;

fn deploy(uid: &str) -> Deployment {
    Deployment { metadata: ObjectMeta { uid: Some(uid.into()), name: Some(format!("web-{}", uid)), namespace: Some("default".into()), ..Default::default() }, ..Default::default() }
}

fn server() -> (TestServer, Arc<MirrorStore<Deployment>>, Arc<PipelineStats>) {
    let store = Arc::new(MirrorStore::new());
    let stats = Arc::new(PipelineStats::new());
    let app = router(ApiState::new(store.clone(), stats.clone()));
    (TestServer::new(app).unwrap(), store, stats)
}

#[tokio::test]
async fn ping_answers_pong() {
    let (server, _, _) = server();
    let res = server.get("/ping").await;
    res.assert_status_ok();
    assert_eq!(res.json::<Pong>(), Pong { message: "pong".into() });
}

#[tokio::test]
async fn lists_current_mirror_contents() {
    let (server, store, _) = server();
    assert!(server.get("/deployments").await.json::<Vec<Deployment>>().is_empty());

    store.apply_add("b".into(), deploy("b"), None);
    store.apply_add("a".into(), deploy("a"), None);
    let names: Vec<String> = server.get("/deployments").await.json::<Vec<Deployment>>().into_iter().filter_map(|d| d.metadata.name).collect();
    assert_eq!(names, vec!["web-a", "web-b"]);

    store.apply_delete(&"a".into(), None);
    assert_eq!(server.get("/deployments").await.json::<Vec<Deployment>>().len(), 1);
}

#[tokio::test]
async fn single_lookup_by_uid_or_404() {
    let (server, store, _) = server();
    store.apply_add("a".into(), deploy("a"), None);

    let res = server.get("/deployments/a").await;
    res.assert_status_ok();
    assert_eq!(res.json::<Deployment>().metadata.name.as_deref(), Some("web-a"));

    let missing = server.get("/deployments/zzz").await;
    missing.assert_status(StatusCode::NOT_FOUND);
    assert!(missing.json::<ErrorBody>().error.contains("zzz"));
}

#[tokio::test]
async fn stats_report_counters_and_epoch() {
    let (server, store, stats) = server();
    stats.record_received();
    stats.record_malformed();
    store.apply_add("a".into(), deploy("a"), Some(3));

    let s = server.get("/stats").await.json::<Stats>();
    assert_eq!((s.epoch, s.entries), (1, 1));
    assert_eq!((s.pipeline.received, s.pipeline.malformed), (1, 1));
}
