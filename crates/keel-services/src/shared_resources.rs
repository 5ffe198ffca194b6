//! SharedResources service: the client-facing acquisition surface.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use keel_acquire::{
    AcquisitionRequest, BroadcastAccept, DirectoryPoll, JobDescriptor, Requester,
    ResourceDescriptor,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{parse_args, require_context, MethodTable, ServiceInterface, ServiceResult};

/// Stateless servant exposing `acquireProcessor` (broadcast-accept) and
/// `acquireResource` (directory-poll). The requester is taken from the
/// ambient call context.
pub struct SharedResourcesService {
    processors: Arc<BroadcastAccept>,
    resources: Arc<DirectoryPoll>,
}

impl SharedResourcesService {
    pub fn new(processors: Arc<BroadcastAccept>, resources: Arc<DirectoryPoll>) -> Self {
        Self {
            processors,
            resources,
        }
    }

    async fn acquire_processor(&self, args: Value) -> ServiceResult<Value> {
        let p: AcquireProcessorParams = parse_args(args)?;
        let ctx = require_context()?;
        let requester = Requester {
            user_id: ctx.principal.user_id,
            group_id: ctx.principal.group_id,
        };
        let request = AcquisitionRequest::new(
            p.job,
            requester,
            Duration::from_secs(p.max_wait_seconds),
        );
        let worker = self.processors.acquire(request).await?;
        Ok(json!({ "worker": worker }))
    }

    async fn acquire_resource(&self, args: Value) -> ServiceResult<Value> {
        let p: AcquireResourceParams = parse_args(args)?;
        let resource = self
            .resources
            .acquire(&p.descriptor, Duration::from_secs(p.max_wait_seconds))
            .await?;
        Ok(json!({ "resource": resource }))
    }
}

impl ServiceInterface for SharedResourcesService {
    const INTERFACE: &'static str = "SharedResources";

    fn method_table() -> &'static MethodTable<Self> {
        static TABLE: OnceLock<MethodTable<SharedResourcesService>> = OnceLock::new();
        TABLE.get_or_init(|| {
            MethodTable::new(Self::INTERFACE)
                .method("acquireProcessor", |svc: Arc<Self>, args| async move {
                    svc.acquire_processor(args).await
                })
                .method("acquireResource", |svc: Arc<Self>, args| async move {
                    svc.acquire_resource(args).await
                })
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AcquireProcessorParams {
    job: JobDescriptor,
    max_wait_seconds: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AcquireResourceParams {
    descriptor: ResourceDescriptor,
    max_wait_seconds: u64,
}
