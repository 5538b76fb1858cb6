//! End-to-end behavior of the origin: request routing, single-flight cold
//! fill, invalidation, and CDN-assisted rebuilds, exercised through the
//! router with mocked upstream sources.

use std::path::Path;
use std::sync::Arc;

use facade::acquire::Acquirer;
use facade::archive;
use facade::cache::CacheDir;
use facade::cdn::{CdnStore, MemoryCdnStore};
use facade::config::OriginConfig;
use facade::server::{route, Origin, Request, VERSION_HEADER};
use facade::store::{AppRecord, MemoryStore, MetadataStore, VersionRecord};
use facade::sync::{SyncPayload, METHOD_DELETE_CACHE};

fn packed_site(marker: &str) -> Vec<u8> {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("static")).unwrap();
    std::fs::write(dir.path().join("index.html"), marker).unwrap();
    std::fs::write(dir.path().join("static/app.js"), b"1;").unwrap();
    let mut buf = Vec::new();
    archive::pack_dir(dir.path(), &mut buf).unwrap();
    buf
}

fn make_origin(
    output_root: &Path,
    store: Arc<MemoryStore>,
    cdn: Option<Arc<dyn CdnStore>>,
) -> Origin {
    let mut config = OriginConfig::default();
    config.output_root = output_root.to_path_buf();
    config.cdn.root_dir = "assets".to_string();
    config.cdn.domain = "//cdn.test.invalid".to_string();
    config.sync.token = "shh".to_string();
    let dir = Arc::new(CacheDir::new());
    let acquirer = Acquirer::new(config.clone(), store.clone(), cdn);
    Origin::new(config, store, dir, acquirer, None)
}

fn seed(store: &MemoryStore, version: VersionRecord) {
    store.add_app(AppRecord {
        app: "site".to_string(),
        domain: "site.test".to_string(),
        ..Default::default()
    });
    store.put_version(version);
}

fn ver(image: &str, flags: impl FnOnce(&mut VersionRecord)) -> VersionRecord {
    let mut v = VersionRecord {
        vpp: "site".to_string(),
        version: "1.0".to_string(),
        image: image.to_string(),
        ..Default::default()
    };
    flags(&mut v);
    v
}

fn get(path: &str) -> Request {
    Request {
        method: "GET".to_string(),
        path: path.to_string(),
        host: "site.test".to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn concurrent_misses_build_once() {
    let upstream = httpmock::MockServer::start_async().await;
    let tgz = upstream
        .mock_async(|when, then| {
            when.method(httpmock::Method::GET).path("/site.tgz");
            then.status(200).body(packed_site("hello"));
        })
        .await;

    let root = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    seed(&store, ver(&upstream.url("/site.tgz"), |_| {}));
    let origin = Arc::new(make_origin(root.path(), store, None));

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let origin = Arc::clone(&origin);
        tasks.push(tokio::spawn(async move {
            route(&origin, &get("/")).await
        }));
    }
    for task in tasks {
        let resp = task.await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"hello");
    }

    // Sixteen racing misses, one upstream download.
    tgz.assert_hits_async(1).await;
    assert_eq!(origin.dir.len(), 1);
}

#[tokio::test]
async fn version_header_names_group_and_version() {
    let upstream = httpmock::MockServer::start_async().await;
    upstream
        .mock_async(|when, then| {
            when.method(httpmock::Method::GET).path("/site.tgz");
            then.status(200).body(packed_site("hello"));
        })
        .await;

    let root = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    seed(&store, ver(&upstream.url("/site.tgz"), |_| {}));
    let origin = make_origin(root.path(), store, None);

    let resp = route(&origin, &get("/")).await;
    assert!(resp
        .headers
        .iter()
        .any(|(k, v)| k == VERSION_HEADER && v == "site; version=1.0"));
}

#[tokio::test]
async fn force_recache_rebuilds_once_then_settles() {
    let upstream = httpmock::MockServer::start_async().await;
    let tgz = upstream
        .mock_async(|when, then| {
            when.method(httpmock::Method::GET).path("/site.tgz");
            then.status(200).body(packed_site("v1"));
        })
        .await;

    let root = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    seed(&store, ver(&upstream.url("/site.tgz"), |_| {}));
    let origin = make_origin(root.path(), store.clone(), None);

    assert_eq!(route(&origin, &get("/")).await.status, 200);
    tgz.assert_hits_async(1).await;

    // Operator marks the version for a forced rebuild.
    seed(
        &store,
        ver(&upstream.url("/site.tgz"), |v| v.force_recache = true),
    );
    assert_eq!(route(&origin, &get("/")).await.status, 200);
    tgz.assert_hits_async(2).await;

    // The flag cleared itself; steady state does not rebuild again.
    let persisted = store.version("site", "1.0").await.unwrap().unwrap();
    assert!(!persisted.force_recache);
    assert_eq!(route(&origin, &get("/")).await.status, 200);
    tgz.assert_hits_async(2).await;
}

#[tokio::test]
async fn cdn_renew_refetches_source_before_push() {
    let upstream = httpmock::MockServer::start_async().await;
    let stale = upstream
        .mock_async(|when, then| {
            when.method(httpmock::Method::GET).path("/old.tgz");
            then.status(200).body(packed_site("old"));
        })
        .await;
    let fresh = upstream
        .mock_async(|when, then| {
            when.method(httpmock::Method::GET).path("/new.tgz");
            then.status(200).body(packed_site("new"));
        })
        .await;

    let root = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    seed(&store, ver(&upstream.url("/old.tgz"), |_| {}));
    let cdn = Arc::new(MemoryCdnStore::new());
    let origin = make_origin(root.path(), store.clone(), Some(cdn.clone()));

    assert_eq!(route(&origin, &get("/")).await.body, b"old");
    stale.assert_hits_async(1).await;

    // Operator repoints the version at new content and marks the CDN copy
    // stale. The rebuild must discard the local tree and acquire from the
    // new source; pushing the old bytes would defeat the renewal.
    seed(
        &store,
        ver(&upstream.url("/new.tgz"), |v| {
            v.cdn_push = true;
            v.cdn_renew = true;
        }),
    );
    let resp = route(&origin, &get("/")).await;
    assert_eq!(resp.status, 301);

    fresh.assert_hits_async(1).await;
    let pushed = cdn
        .get("assets/site/1.0/index.html")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pushed, b"new");

    let persisted = store.version("site", "1.0").await.unwrap().unwrap();
    assert!(!persisted.cdn_renew);
}

#[tokio::test]
async fn forced_rebuild_storm_acquires_once() {
    let upstream = httpmock::MockServer::start_async().await;
    let tgz = upstream
        .mock_async(|when, then| {
            when.method(httpmock::Method::GET).path("/site.tgz");
            then.status(200).body(packed_site("v1"));
        })
        .await;

    let root = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    seed(&store, ver(&upstream.url("/site.tgz"), |_| {}));
    let origin = Arc::new(make_origin(root.path(), store.clone(), None));

    assert_eq!(route(&origin, &get("/")).await.status, 200);
    tgz.assert_hits_async(1).await;

    // Many requests race a single forced recache. The first rebuild clears
    // the flag; everyone queued behind the population lock must pick up the
    // fresh record and the rebuilt entry instead of rebuilding in turn.
    seed(
        &store,
        ver(&upstream.url("/site.tgz"), |v| v.force_recache = true),
    );
    let mut tasks = Vec::new();
    for _ in 0..16 {
        let origin = Arc::clone(&origin);
        tasks.push(tokio::spawn(async move { route(&origin, &get("/")).await }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap().status, 200);
    }

    tgz.assert_hits_async(2).await;
    let persisted = store.version("site", "1.0").await.unwrap().unwrap();
    assert!(!persisted.force_recache);
}

#[tokio::test]
async fn mode_flip_to_cdn_invalidates_local_entry() {
    let upstream = httpmock::MockServer::start_async().await;
    upstream
        .mock_async(|when, then| {
            when.method(httpmock::Method::GET).path("/site.tgz");
            then.status(200).body(packed_site("local"));
        })
        .await;

    let root = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    seed(&store, ver(&upstream.url("/site.tgz"), |_| {}));
    let cdn = Arc::new(MemoryCdnStore::new());
    let origin = make_origin(root.path(), store.clone(), Some(cdn.clone()));

    let resp = route(&origin, &get("/")).await;
    assert_eq!(resp.body, b"local");

    // Flip the version to CDN mode; the next request must rebuild, push the
    // tree, and answer through the CDN instead of local disk.
    seed(&store, ver(&upstream.url("/site.tgz"), |v| v.cdn_push = true));
    let resp = route(&origin, &get("/")).await;

    // The CDN domain is unreachable in tests, so delivery falls back to a
    // client redirect at the recorded public location.
    assert_eq!(resp.status, 301);
    let location = resp
        .headers
        .iter()
        .find(|(k, _)| k == "Location")
        .map(|(_, v)| v.clone())
        .unwrap();
    assert_eq!(
        location,
        "https://cdn.test.invalid/assets/site/1.0/index.html"
    );

    // The push itself happened: tree and sentinel are in the bucket, and the
    // coordinates were persisted.
    assert!(cdn.keys().contains(&"assets/site/1.0/cname".to_string()));
    let persisted = store.version("site", "1.0").await.unwrap().unwrap();
    assert_eq!(persisted.cdn_name, "//cdn.test.invalid/assets/site/1.0");
}

#[tokio::test]
async fn parked_archive_feeds_sibling_cold_fill() {
    let upstream = httpmock::MockServer::start_async().await;
    let tgz = upstream
        .mock_async(|when, then| {
            when.method(httpmock::Method::GET).path("/site.tgz");
            then.status(200).body(packed_site("shared"));
        })
        .await;

    let cdn: Arc<MemoryCdnStore> = Arc::new(MemoryCdnStore::new());

    // First replica builds from the upstream and parks an archive.
    let root_a = tempfile::tempdir().unwrap();
    let store_a = Arc::new(MemoryStore::new());
    seed(
        &store_a,
        ver(&upstream.url("/site.tgz"), |v| v.cdn_cache_reuse = true),
    );
    let origin_a = make_origin(root_a.path(), store_a, Some(cdn.clone()));
    assert_eq!(route(&origin_a, &get("/")).await.body, b"shared");
    tgz.assert_hits_async(1).await;
    assert!(cdn.keys().contains(&"assets/site/1.0.tgz".to_string()));

    // Second replica cold-fills from the archive without touching upstream.
    let root_b = tempfile::tempdir().unwrap();
    let store_b = Arc::new(MemoryStore::new());
    seed(
        &store_b,
        ver(&upstream.url("/site.tgz"), |v| v.cdn_cache_reuse = true),
    );
    let origin_b = make_origin(root_b.path(), store_b, Some(cdn));
    assert_eq!(route(&origin_b, &get("/")).await.body, b"shared");
    tgz.assert_hits_async(1).await;
}

#[tokio::test]
async fn sync_invalidation_is_idempotent_and_deletes_content() {
    let upstream = httpmock::MockServer::start_async().await;
    let tgz = upstream
        .mock_async(|when, then| {
            when.method(httpmock::Method::GET).path("/site.tgz");
            then.status(200).body(packed_site("v1"));
        })
        .await;

    let root = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    seed(&store, ver(&upstream.url("/site.tgz"), |_| {}));
    let origin = make_origin(root.path(), store, None);

    assert_eq!(route(&origin, &get("/")).await.status, 200);
    let tree = root.path().join("site/1.0");
    assert!(tree.join("index.html").exists());

    let sync_req = || {
        let mut req = Request {
            method: "POST".to_string(),
            path: "/-/sync".to_string(),
            host: "site.test".to_string(),
            query: vec![
                ("method".to_string(), METHOD_DELETE_CACHE.to_string()),
                ("source".to_string(), "10.0.0.9".to_string()),
            ],
            ..Default::default()
        };
        req.body = serde_json::to_vec(&SyncPayload {
            token: "shh".to_string(),
            key: "site@1.0".to_string(),
        })
        .unwrap();
        req
    };

    let resp = route(&origin, &sync_req()).await;
    assert_eq!((resp.status, resp.body.as_slice()), (200, b"ok".as_slice()));
    assert!(!tree.exists());
    assert!(origin.dir.is_empty());

    // Replaying the same invalidation stays a no-op.
    let resp = route(&origin, &sync_req()).await;
    assert_eq!((resp.status, resp.body.as_slice()), (200, b"ok".as_slice()));

    // Next request rebuilds from source.
    assert_eq!(route(&origin, &get("/")).await.status, 200);
    tgz.assert_hits_async(2).await;
}

#[tokio::test]
async fn failed_download_leaves_no_partial_tree() {
    let upstream = httpmock::MockServer::start_async().await;
    upstream
        .mock_async(|when, then| {
            when.method(httpmock::Method::GET).path("/site.tgz");
            then.status(500).body("nope");
        })
        .await;

    let root = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    seed(&store, ver(&upstream.url("/site.tgz"), |_| {}));
    let origin = make_origin(root.path(), store, None);

    let resp = route(&origin, &get("/")).await;
    assert_eq!(resp.status, 500);
    assert!(!root.path().join("site/1.0").exists());
    assert!(origin.dir.is_empty());
}
