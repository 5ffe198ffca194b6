//! Service-level functional tests.
//!
//! Calls each bundled service through its method table, exactly the way the
//! dispatch bridge does, without a session around it.

use std::sync::Arc;

use keel_services::{ServiceInterface, ServiceResult};
use serde_json::{json, Value};

async fn call<S: ServiceInterface>(svc: &Arc<S>, method: &str, args: Value) -> ServiceResult<Value> {
    let handler = S::method_table()
        .get(method)
        .unwrap_or_else(|| panic!("{} has no method {method}", S::INTERFACE));
    handler(svc.clone(), args).await
}

// ─────────────────────────────────────────────────────────────────────────────
// Config service
// ─────────────────────────────────────────────────────────────────────────────

mod config {
    use super::*;
    use keel_services::config::ConfigService;

    #[tokio::test]
    async fn set_then_get_is_shared_between_instances() {
        let settings = ConfigService::shared_defaults();
        let a = Arc::new(ConfigService::new(settings.clone()));
        let b = Arc::new(ConfigService::new(settings));

        call(&a, "set", json!({ "key": "custom.flag", "value": true })).await.unwrap();
        let got = call(&b, "get", json!({ "key": "custom.flag" })).await.unwrap();
        assert_eq!(got["value"], true);
    }

    #[tokio::test]
    async fn reset_single_key_restores_default() {
        let svc = Arc::new(ConfigService::new(ConfigService::shared_defaults()));
        call(&svc, "set", json!({ "key": "session.keepAliveSeconds", "value": 5 })).await.unwrap();
        call(&svc, "reset", json!({ "key": "session.keepAliveSeconds" })).await.unwrap();

        let got = call(&svc, "get", json!({ "key": "session.keepAliveSeconds" })).await.unwrap();
        assert_eq!(got["value"], 300);
    }

    #[tokio::test]
    async fn reset_without_args_restores_everything() {
        let svc = Arc::new(ConfigService::new(ConfigService::shared_defaults()));
        call(&svc, "set", json!({ "key": "extra", "value": 1 })).await.unwrap();
        call(&svc, "reset", Value::Null).await.unwrap();

        let all = call(&svc, "getAll", Value::Null).await.unwrap();
        assert!(all["settings"].get("extra").is_none());
    }

    #[tokio::test]
    async fn get_without_key_is_validation_error() {
        let svc = Arc::new(ConfigService::new(ConfigService::shared_defaults()));
        let err = call(&svc, "get", json!({})).await.unwrap_err();
        let rpc: keel_protocol::RpcError = err.into();
        assert_eq!(rpc.error_code(), keel_protocol::RpcErrorCode::ValidationError);
    }

    #[test]
    fn table_lists_interface_methods() {
        let table = ConfigService::method_table();
        assert_eq!(table.interface(), "Config");
        assert_eq!(table.names(), vec!["get", "getAll", "reset", "set"]);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// RawFile service
// ─────────────────────────────────────────────────────────────────────────────

mod raw_file {
    use super::*;
    use base64::Engine;
    use keel_services::raw_file::RawFileService;
    use keel_services::{ServiceError, StatefulService};
    use tempfile::TempDir;

    fn svc_with_file(contents: &[u8]) -> (TempDir, Arc<RawFileService>) {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("plane.raw"), contents).unwrap();
        let svc = Arc::new(RawFileService::new(dir.path().to_path_buf()));
        (dir, svc)
    }

    fn decode(v: &Value) -> Vec<u8> {
        base64::engine::general_purpose::STANDARD
            .decode(v["data"].as_str().unwrap())
            .unwrap()
    }

    #[tokio::test]
    async fn open_and_read_range() {
        let (_dir, svc) = svc_with_file(b"0123456789");
        let opened = call(&svc, "open", json!({ "path": "plane.raw" })).await.unwrap();
        assert_eq!(opened["size"], 10);

        let got = call(&svc, "read", json!({ "offset": 2, "length": 4 })).await.unwrap();
        assert_eq!(decode(&got), b"2345");
    }

    #[tokio::test]
    async fn read_past_end_is_truncated() {
        let (_dir, svc) = svc_with_file(b"abc");
        call(&svc, "open", json!({ "path": "plane.raw" })).await.unwrap();

        let got = call(&svc, "read", json!({ "offset": 1, "length": 100 })).await.unwrap();
        assert_eq!(decode(&got), b"bc");
        let empty = call(&svc, "read", json!({ "offset": 3, "length": 1 })).await.unwrap();
        assert_eq!(empty["length"], 0);
    }

    #[tokio::test]
    async fn traversal_is_rejected() {
        let (_dir, svc) = svc_with_file(b"x");
        let err = call(&svc, "open", json!({ "path": "../etc/passwd" })).await.unwrap_err();
        assert!(matches!(err, ServiceError::Security(_)));
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let (_dir, svc) = svc_with_file(b"x");
        let err = call(&svc, "open", json!({ "path": "nope.raw" })).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn passivate_releases_and_activate_restores_handle() {
        let (_dir, svc) = svc_with_file(b"hello");
        call(&svc, "open", json!({ "path": "plane.raw" })).await.unwrap();
        assert!(svc.holds_handle().await);

        svc.passivate().await.unwrap();
        assert!(!svc.holds_handle().await);
        assert!(call(&svc, "read", json!({ "length": 1 })).await.is_err());

        svc.activate().await.unwrap();
        let got = call(&svc, "read", json!({ "length": 5 })).await.unwrap();
        assert_eq!(decode(&got), b"hello");
    }

    #[tokio::test]
    async fn close_then_post_close_releases_everything() {
        let (_dir, svc) = svc_with_file(b"hello");
        call(&svc, "open", json!({ "path": "plane.raw" })).await.unwrap();

        svc.pre_close().await.unwrap();
        svc.close().await.unwrap();
        assert!(!svc.holds_handle().await);
        svc.post_close().await;
        assert!(call(&svc, "size", Value::Null).await.is_err());
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SharedResources service
// ─────────────────────────────────────────────────────────────────────────────

mod shared_resources {
    use super::*;
    use std::time::Duration;

    use keel_acquire::{
        BroadcastAccept, DirectoryPoll, InMemoryBus, InMemoryJobStore, LocalProcessor,
        StaticDiscovery, WorkerHandle,
    };
    use keel_protocol::{CallContext, Identity, Principal, RpcErrorCode};
    use keel_services::shared_resources::SharedResourcesService;
    use keel_services::with_context;

    fn alice_ctx() -> CallContext {
        CallContext::new(
            "call-1",
            "client-1",
            Principal {
                user: "alice".into(),
                user_id: 2,
                group: "lab".into(),
                group_id: 3,
                admin: false,
                session: "alice-session".into(),
            },
            Identity::new("alice-session", "SharedResources"),
        )
    }

    fn service(bus: Arc<InMemoryBus>) -> Arc<SharedResourcesService> {
        let jobs = Arc::new(InMemoryJobStore::new());
        Arc::new(SharedResourcesService::new(
            Arc::new(BroadcastAccept::new(bus, jobs, Duration::from_secs(5))),
            Arc::new(DirectoryPoll::new(Arc::new(StaticDiscovery::new()))),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_processor_uses_ambient_principal() {
        let bus = Arc::new(InMemoryBus::new());
        let handle = WorkerHandle {
            worker_id: "proc-1".into(),
            endpoint: "local://proc-1".into(),
        };
        LocalProcessor::new(handle.clone(), 2).spawn(bus.clone());
        let svc = service(bus);

        let args = json!({ "job": { "id": 10, "kind": "script" }, "maxWaitSeconds": 3 });
        let got = with_context(alice_ctx(), call(&svc, "acquireProcessor", args))
            .await
            .unwrap();
        assert_eq!(got["worker"]["workerId"], "proc-1");
    }

    #[tokio::test]
    async fn acquire_processor_without_context_is_refused() {
        let svc = service(Arc::new(InMemoryBus::new()));
        let args = json!({ "job": { "id": 11, "kind": "script" }, "maxWaitSeconds": 1 });
        let err = call(&svc, "acquireProcessor", args).await.unwrap_err();
        let rpc: keel_protocol::RpcError = err.into();
        assert_eq!(rpc.error_code(), RpcErrorCode::AuthorizationError);
    }

    #[tokio::test]
    async fn acquire_resource_over_ceiling_is_validation_error() {
        let svc = service(Arc::new(InMemoryBus::new()));
        let args = json!({
            "descriptor": { "kind": "Tables", "target": "t" },
            "maxWaitSeconds": 600,
        });
        let err = with_context(alice_ctx(), call(&svc, "acquireResource", args))
            .await
            .unwrap_err();
        let rpc: keel_protocol::RpcError = err.into();
        assert_eq!(rpc.error_code(), RpcErrorCode::ValidationError);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_resource_with_no_endpoints_is_null() {
        let svc = service(Arc::new(InMemoryBus::new()));
        let args = json!({
            "descriptor": { "kind": "Tables", "target": "t" },
            "maxWaitSeconds": 2,
        });
        let got = with_context(alice_ctx(), call(&svc, "acquireResource", args))
            .await
            .unwrap();
        assert!(got["resource"].is_null());
    }
}
