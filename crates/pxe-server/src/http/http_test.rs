//! Unit tests for the HTTP mirror and provisioning endpoints

#[cfg(test)]
mod tests {
    use crate::config::ClusterConfig;
    use crate::http::{router, AppState, Mirror};
    use crate::metrics::Metrics;
    use crate::nodes::NodeService;
    use crate::test_utils::RecordingExecutor;
    use axum::body::Body;
    use axum::extract::connect_info::MockConnectInfo;
    use axum::http::{header, Method, Request, StatusCode};
    use axum::response::Response;
    use axum::routing::get;
    use axum::Router;
    use netboot_store::{MemoryStore, NewKernel, NodeStage, NodeStatus, Repository};
    use std::net::{Ipv4Addr, SocketAddr};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const VMLINUZ_PATH: &str = "/alpine/netboot/3.14.0/vmlinuz-lts";
    const MODLOOP_PATH: &str = "/alpine/netboot/3.14.0/modloop-lts";
    const LAST_MODIFIED: &str = "Wed, 16 Jun 2021 12:00:00 GMT";

    fn vmlinuz() -> Vec<u8> {
        (0..20_000u32).map(|i| (i % 251) as u8).collect()
    }

    /// Upstream archive counting how often each artifact is fetched
    async fn upstream(hits: Arc<AtomicUsize>) -> String {
        let app = Router::new()
            .route(
                VMLINUZ_PATH,
                get(move || {
                    let hits = hits.clone();
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        // Keep the fill open long enough for requests to pile up
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        ([(header::LAST_MODIFIED, LAST_MODIFIED)], vmlinuz())
                    }
                }),
            )
            .route(MODLOOP_PATH, get(|| async { b"modloop".to_vec() }));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{}", addr)
    }

    struct Fixture {
        root: TempDir,
        store: Arc<MemoryStore>,
        nodes: Arc<NodeService>,
        state: Arc<AppState>,
        hits: Arc<AtomicUsize>,
    }

    impl Fixture {
        /// Router as seen by a client at `peer`
        fn app(&self, peer: Ipv4Addr) -> Router {
            router(self.state.clone()).layer(MockConnectInfo(SocketAddr::from((peer, 40000))))
        }
    }

    async fn fixture() -> Fixture {
        let hits = Arc::new(AtomicUsize::new(0));
        let archive = upstream(hits.clone()).await;
        let root = tempfile::tempdir().unwrap();

        let store = Arc::new(MemoryStore::new());
        store
            .create_kernel(NewKernel {
                name: "alpine".to_string(),
                version: "3.14.0".to_string(),
                vmlinuz: VMLINUZ_PATH.to_string(),
                initramfs: "/alpine/netboot/3.14.0/initramfs-lts".to_string(),
                modloop: Some(MODLOOP_PATH.to_string()),
                archive: Some(archive),
                apkovl: Some("/alpine/node.apkovl.tar.gz".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .create_kernel(NewKernel {
                name: "k3os".to_string(),
                version: "0.21.5".to_string(),
                vmlinuz: "/k3os/k3os-vmlinuz-amd64".to_string(),
                initramfs: "/k3os/k3os-initrd-amd64".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let nodes = Arc::new(NodeService::new(
            store.clone(),
            Arc::new(RecordingExecutor::new()),
            "alpine",
            "/nonexistent/authorized_keys",
        ));
        let metrics = Metrics::new().unwrap();
        let state = Arc::new(AppState {
            store: store.clone(),
            nodes: nodes.clone(),
            mirror: Mirror::new(root.path(), reqwest::Client::new(), metrics.clone()),
            cluster: ClusterConfig::default(),
            root: root.path().to_path_buf(),
            metrics,
        });

        Fixture {
            root,
            store,
            nodes,
            state,
            hits,
        }
    }

    fn request(method: Method, uri: &str) -> Request<Body> {
        Request::builder().method(method).uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    const CLIENT: Ipv4Addr = Ipv4Addr::new(10, 1, 10, 10);

    #[tokio::test]
    async fn test_cold_mirror_request_downloads_and_records_entry() {
        let f = fixture().await;

        let response = f.app(CLIENT).oneshot(request(Method::GET, VMLINUZ_PATH)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "20000");
        assert_eq!(response.headers()[header::LAST_MODIFIED], LAST_MODIFIED);
        assert_eq!(body_bytes(response).await, vmlinuz());

        let on_disk = std::fs::read(f.root.path().join("alpine/netboot/3.14.0/vmlinuz-lts")).unwrap();
        assert_eq!(on_disk, vmlinuz());

        let entry = f.state.mirror.get(VMLINUZ_PATH).unwrap();
        assert!(entry.is_downloaded);
        assert!(!entry.is_downloading);
        assert_eq!(entry.size, 20_000);
        assert_eq!(entry.pending_requests, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_cold_requests_share_one_download() {
        let f = fixture().await;
        let app = f.app(CLIENT);

        let requests = (0..8).map(|_| {
            let app = app.clone();
            tokio::spawn(async move {
                let response = app.oneshot(request(Method::GET, VMLINUZ_PATH)).await.unwrap();
                assert_eq!(response.status(), StatusCode::OK);
                body_bytes(response).await
            })
        });
        let bodies = futures::future::join_all(requests).await;

        assert_eq!(f.hits.load(Ordering::SeqCst), 1);
        for body in bodies {
            assert_eq!(body.unwrap(), vmlinuz());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_aliased_paths_share_one_entry_and_download() {
        let f = fixture().await;
        let app = f.app(CLIENT);
        let paths = [
            VMLINUZ_PATH,
            "/alpine//netboot/3.14.0/vmlinuz-lts",
            "/alpine/netboot/./3.14.0//vmlinuz-lts",
        ];

        let requests = paths.into_iter().map(|path| {
            let app = app.clone();
            tokio::spawn(async move {
                let response = app.oneshot(request(Method::GET, path)).await.unwrap();
                assert_eq!(response.status(), StatusCode::OK);
                body_bytes(response).await
            })
        });
        let bodies = futures::future::join_all(requests).await;

        assert_eq!(f.hits.load(Ordering::SeqCst), 1);
        for body in bodies {
            assert_eq!(body.unwrap(), vmlinuz());
        }
        let entries = f.state.mirror.list();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, VMLINUZ_PATH);

        let dir = f.root.path().join("alpine/netboot/3.14.0");
        let files: Vec<_> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(files, vec![std::ffi::OsString::from("vmlinuz-lts")]);
    }

    #[tokio::test]
    async fn test_cached_file_is_served_from_disk_after_clear() {
        let f = fixture().await;
        let app = f.app(CLIENT);

        app.clone().oneshot(request(Method::GET, VMLINUZ_PATH)).await.unwrap();
        assert_eq!(f.state.mirror.clear(), 1);
        let response = app.oneshot(request(Method::GET, VMLINUZ_PATH)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, vmlinuz());
        assert_eq!(f.hits.load(Ordering::SeqCst), 1);
        assert!(f.state.mirror.get(VMLINUZ_PATH).unwrap().is_downloaded);
    }

    #[tokio::test]
    async fn test_upstream_not_found_drops_entry() {
        let f = fixture().await;

        let response = f
            .app(CLIENT)
            .oneshot(request(Method::GET, "/alpine/netboot/3.14.0/missing"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(f.state.mirror.list().is_empty());
        assert!(!f.root.path().join("alpine/netboot/3.14.0/missing").exists());
    }

    #[tokio::test]
    async fn test_unknown_kernel_is_not_found() {
        let f = fixture().await;

        let response = f.app(CLIENT).oneshot(request(Method::GET, "/debian/linux")).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(f.hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_mirror_rejects_other_methods() {
        let f = fixture().await;

        let response = f.app(CLIENT).oneshot(request(Method::PUT, VMLINUZ_PATH)).await.unwrap();

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_head_has_length_but_no_body() {
        let f = fixture().await;

        let response = f.app(CLIENT).oneshot(request(Method::HEAD, VMLINUZ_PATH)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "20000");
        assert!(body_bytes(response).await.is_empty());
    }

    #[tokio::test]
    async fn test_modloop_fetch_marks_node_running() {
        let f = fixture().await;
        let node = f.nodes.register(CLIENT, None).await.unwrap();

        let response = f.app(CLIENT).oneshot(request(Method::GET, MODLOOP_PATH)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(f.nodes.get(node.id).await.unwrap().status, NodeStatus::Running);
    }

    #[tokio::test]
    async fn test_k3os_agent_config_joins_control_node() {
        let f = fixture().await;
        let control = f.nodes.register(Ipv4Addr::new(10, 1, 10, 20), None).await.unwrap();
        f.nodes.set_control_node(control.id, true).await.unwrap();
        let agent = f.nodes.register(CLIENT, None).await.unwrap();
        f.nodes.set_kernel(agent.id, "k3os").await.unwrap();

        let response = f.app(CLIENT).oneshot(request(Method::GET, "/k3os/config")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/yaml");
        let yaml = String::from_utf8(body_bytes(response).await).unwrap();
        assert!(yaml.contains(&format!("hostname: {}", agent.hostname)));
        assert!(yaml.contains("server_url: https://10.1.10.20:6443"));
        assert!(yaml.contains(&format!("password: {}", agent.password.unwrap())));

        let agent = f.nodes.get(agent.id).await.unwrap();
        assert_eq!(agent.status, NodeStatus::Running);
        assert_eq!(agent.stage, NodeStage::Provisioned);
    }

    #[tokio::test]
    async fn test_k3os_agent_without_control_node_is_not_found() {
        let f = fixture().await;
        let agent = f.nodes.register(CLIENT, None).await.unwrap();

        let response = f.app(CLIENT).oneshot(request(Method::GET, "/k3os/config")).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(f.nodes.get(agent.id).await.unwrap().stage, NodeStage::Commissioning);
    }

    #[tokio::test]
    async fn test_password_is_generated_once() {
        let f = fixture().await;
        let node = f.nodes.register(CLIENT, None).await.unwrap();
        f.nodes.set_control_node(node.id, true).await.unwrap();
        let mut cleared = f.store.get_node(node.id).await.unwrap();
        cleared.password = None;
        f.store.update_node(&cleared).await.unwrap();

        let app = f.app(CLIENT);
        app.clone().oneshot(request(Method::GET, "/k3os/config")).await.unwrap();
        let first = f.nodes.get(node.id).await.unwrap().password.unwrap();
        app.oneshot(request(Method::GET, "/k3os/config")).await.unwrap();
        let second = f.nodes.get(node.id).await.unwrap().password.unwrap();

        assert_eq!(first.len(), 32);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_ignition_is_json_and_provisions() {
        let f = fixture().await;
        let node = f.nodes.register(CLIENT, None).await.unwrap();

        let response = f.app(CLIENT).oneshot(request(Method::GET, "/coreos/ignition")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let doc: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(doc["ignition"]["version"], "3.3.0");
        assert_eq!(f.nodes.get(node.id).await.unwrap().stage, NodeStage::Provisioned);
    }

    #[tokio::test]
    async fn test_ssh_keys() {
        let f = fixture().await;
        let node = f.nodes.register(CLIENT, None).await.unwrap();
        let app = f.app(CLIENT);

        let response = app.clone().oneshot(request(Method::GET, "/ssh_keys")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        f.nodes
            .set_authorized_keys(node.id, Some("ssh-ed25519 AAAA admin@lab\n".to_string()))
            .await
            .unwrap();
        let response = app.oneshot(request(Method::GET, "/ssh_keys")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, b"ssh-ed25519 AAAA admin@lab\n");
    }

    #[tokio::test]
    async fn test_ssh_keys_unknown_client() {
        let f = fixture().await;

        let response = f.app(CLIENT).oneshot(request(Method::GET, "/ssh_keys")).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_apkovl_upload_is_stored_under_kernel_path() {
        let f = fixture().await;
        f.nodes.register(CLIENT, None).await.unwrap();

        let upload = Request::builder()
            .method(Method::POST)
            .uri("/apkovl")
            .body(Body::from(vec![0x1f, 0x8b, 0x08, 0x00]))
            .unwrap();
        let response = f.app(CLIENT).oneshot(upload).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let stored = std::fs::read(f.root.path().join("alpine/node.apkovl.tar.gz")).unwrap();
        assert_eq!(stored, vec![0x1f, 0x8b, 0x08, 0x00]);
    }

    #[tokio::test]
    async fn test_admin_cache_listing_and_clear() {
        let f = fixture().await;
        let app = f.app(CLIENT);
        app.clone().oneshot(request(Method::GET, VMLINUZ_PATH)).await.unwrap();

        let response = app.clone().oneshot(request(Method::GET, "/api/cache")).await.unwrap();
        let listing: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(listing[0]["path"], VMLINUZ_PATH);
        assert_eq!(listing[0]["isDownloaded"], true);
        assert_eq!(listing[0]["pendingRequests"], 0);

        let response = app.oneshot(request(Method::DELETE, "/api/cache")).await.unwrap();
        let cleared: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(cleared["cleared"], 1);
        assert!(f.state.mirror.list().is_empty());
    }

    #[tokio::test]
    async fn test_admin_prefetch_fills_cache() {
        let f = fixture().await;

        let prefetch = Request::builder()
            .method(Method::POST)
            .uri("/api/cache/prefetch")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(format!(r#"{{"kernel": "alpine", "path": "{}"}}"#, VMLINUZ_PATH)))
            .unwrap();
        let response = f.app(CLIENT).oneshot(prefetch).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(f.root.path().join("alpine/netboot/3.14.0/vmlinuz-lts").exists());
        assert_eq!(f.hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_admin_node_lifecycle() {
        let f = fixture().await;
        let app = f.app(Ipv4Addr::LOCALHOST);

        let register = Request::builder()
            .method(Method::POST)
            .uri("/api/nodes/register")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"ip": "10.1.10.30", "mac": "aa:bb:cc:dd:ee:30"}"#))
            .unwrap();
        let response = app.clone().oneshot(register).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let node: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        let id = node["id"].as_u64().unwrap();

        let stage = Request::builder()
            .method(Method::POST)
            .uri(format!("/api/nodes/{}/stage", id))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"stage": "provisioning"}"#))
            .unwrap();
        let response = app.clone().oneshot(stage).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(f.nodes.get(id).await.unwrap().stage, NodeStage::Provisioning);

        let response = app
            .clone()
            .oneshot(request(Method::DELETE, &format!("/api/nodes/{}", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .oneshot(request(Method::GET, &format!("/api/nodes/{}", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let f = fixture().await;
        let app = f.app(CLIENT);
        app.clone().oneshot(request(Method::GET, VMLINUZ_PATH)).await.unwrap();

        let response = app.oneshot(request(Method::GET, "/metrics")).await.unwrap();

        let text = String::from_utf8(body_bytes(response).await).unwrap();
        assert!(text.contains("netboot_mirror_requests_total{result=\"miss\"} 1"));
        assert!(text.contains("netboot_mirror_downloads_total{result=\"ok\"} 1"));
    }
}
