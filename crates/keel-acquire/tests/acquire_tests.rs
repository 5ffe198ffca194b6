//! Acquisition protocol tests: broadcast-accept and directory-poll behavior
//! under virtual time.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use keel_acquire::*;
use keel_protocol::RpcErrorCode;
use tokio::time::Instant;

fn job(id: i64) -> JobDescriptor {
    JobDescriptor {
        id,
        kind: "script".into(),
        params: serde_json::json!({ "script": "thumbnail.py" }),
    }
}

fn worker(id: &str) -> WorkerHandle {
    WorkerHandle {
        worker_id: id.into(),
        endpoint: format!("local://{id}"),
    }
}

const ALICE: Requester = Requester {
    user_id: 2,
    group_id: 3,
};

// ─────────────────────────────────────────────────────────────────────────────
// Broadcast-accept
// ─────────────────────────────────────────────────────────────────────────────

mod broadcast {
    use super::*;

    fn setup(budget: Duration) -> (Arc<InMemoryBus>, Arc<InMemoryJobStore>, BroadcastAccept) {
        let bus = Arc::new(InMemoryBus::new());
        let jobs = Arc::new(InMemoryJobStore::new());
        let acceptor = BroadcastAccept::new(bus.clone(), jobs.clone(), budget);
        (bus, jobs, acceptor)
    }

    #[tokio::test(start_paused = true)]
    async fn single_authorized_acceptor_wins() {
        let (bus, _jobs, acceptor) = setup(Duration::from_secs(30));

        LocalProcessor::new(worker("other-user"), 99).spawn(bus.clone());
        LocalProcessor::new(worker("decliner"), 2)
            .with_policy(|_| false)
            .spawn(bus.clone());
        LocalProcessor::new(worker("alice-proc"), 2).spawn(bus.clone());

        let request = AcquisitionRequest::new(job(1), ALICE, Duration::from_secs(10));
        let got = acceptor.acquire(request).await.unwrap();
        assert_eq!(got, Some(worker("alice-proc")));
    }

    #[tokio::test(start_paused = true)]
    async fn admin_owned_processor_is_authorized() {
        let (bus, _jobs, acceptor) = setup(Duration::from_secs(30));
        LocalProcessor::new(worker("shared"), 0).admin().spawn(bus.clone());

        let request = AcquisitionRequest::new(job(2), ALICE, Duration::from_secs(5));
        let got = acceptor.acquire(request).await.unwrap();
        assert_eq!(got, Some(worker("shared")));
    }

    #[tokio::test(start_paused = true)]
    async fn no_workers_returns_none_after_wait_and_job_was_waiting() {
        let (bus, jobs, acceptor) = setup(Duration::from_secs(30));

        let start = Instant::now();
        let request = AcquisitionRequest::new(job(3), ALICE, Duration::from_secs(10));
        let got = acceptor.acquire(request).await.unwrap();

        assert_eq!(got, None);
        assert!(start.elapsed() >= Duration::from_secs(10));
        assert!(start.elapsed() < Duration::from_secs(11));
        assert_eq!(jobs.status(3), Some(JobStatus::Waiting));
        assert_eq!(bus.reply_identities(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_is_capped_by_budget() {
        let (_bus, _jobs, acceptor) = setup(Duration::from_secs(2));

        let start = Instant::now();
        let request = AcquisitionRequest::new(job(4), ALICE, Duration::from_secs(60));
        assert_eq!(acceptor.acquire(request).await.unwrap(), None);
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn only_unauthorized_acceptors_yield_none() {
        let (bus, _jobs, acceptor) = setup(Duration::from_secs(30));
        LocalProcessor::new(worker("bob-1"), 7).spawn(bus.clone());
        LocalProcessor::new(worker("bob-2"), 7).spawn(bus.clone());

        let request = AcquisitionRequest::new(job(5), ALICE, Duration::from_secs(4));
        assert_eq!(acceptor.acquire(request).await.unwrap(), None);
        assert_eq!(bus.reply_identities(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reply_identity_released_after_win() {
        let (bus, _jobs, acceptor) = setup(Duration::from_secs(30));
        LocalProcessor::new(worker("p1"), 2).spawn(bus.clone());
        LocalProcessor::new(worker("p2"), 2).spawn(bus.clone());

        let request = AcquisitionRequest::new(job(6), ALICE, Duration::from_secs(10));
        let got = acceptor.acquire(request).await.unwrap();
        assert!(got.is_some());
        assert_eq!(bus.reply_identities(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn enormous_wait_is_capped_by_budget() {
        let (_bus, _jobs, acceptor) = setup(Duration::from_secs(2));

        let start = Instant::now();
        let request = AcquisitionRequest::new(job(8), ALICE, Duration::from_secs(u64::MAX));
        assert_eq!(acceptor.acquire(request).await.unwrap(), None);
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn job_of_another_user_is_an_authorization_error() {
        let (_bus, jobs, acceptor) = setup(Duration::from_secs(1));
        jobs.submit_waiting(&job(9), 7, 3).unwrap();

        let request = AcquisitionRequest::new(job(9), ALICE, Duration::from_secs(1));
        let err = acceptor.acquire(request).await.unwrap_err();
        assert!(matches!(err, AcquireError::NotOwner { job_id: 9, user_id: 2 }));
        let rpc: keel_protocol::RpcError = err.into();
        assert_eq!(rpc.error_code(), RpcErrorCode::AuthorizationError);
        assert_eq!(jobs.get(9).unwrap().owner_user_id, 7);
    }

    #[tokio::test]
    async fn shut_down_bus_is_shutdown_in_progress() {
        let (bus, jobs, acceptor) = setup(Duration::from_secs(1));
        bus.shut_down();

        let request = AcquisitionRequest::new(job(7), ALICE, Duration::from_secs(1));
        let err = acceptor.acquire(request).await.unwrap_err();
        let rpc: keel_protocol::RpcError = err.into();
        assert_eq!(rpc.error_code(), RpcErrorCode::ShutdownInProgress);
        // The job was recorded before the bus was touched.
        assert_eq!(jobs.status(7), Some(JobStatus::Waiting));
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Directory-poll
// ─────────────────────────────────────────────────────────────────────────────

mod poll {
    use super::*;

    fn descriptor() -> ResourceDescriptor {
        ResourceDescriptor {
            kind: "Tables".into(),
            target: "table-42".into(),
            params: serde_json::Value::Null,
        }
    }

    /// Fails with `Unreachable` a fixed number of times, then succeeds.
    struct Flaky {
        endpoint: String,
        failures_left: AtomicUsize,
        attempts: AtomicUsize,
    }

    impl Candidate for Flaky {
        fn endpoint(&self) -> &str {
            &self.endpoint
        }

        fn acquire<'a>(
            &'a self,
            descriptor: &'a ResourceDescriptor,
        ) -> BoxFuture<'a, Result<Option<ResourceHandle>, CandidateError>> {
            Box::pin(async move {
                self.attempts.fetch_add(1, Ordering::SeqCst);
                let left = self.failures_left.load(Ordering::SeqCst);
                if left > 0 {
                    self.failures_left.store(left - 1, Ordering::SeqCst);
                    return Err(CandidateError::Unreachable(self.endpoint.clone()));
                }
                Ok(Some(ResourceHandle {
                    endpoint: self.endpoint.clone(),
                    resource_id: descriptor.target.clone(),
                }))
            })
        }
    }

    /// Never answers.
    struct BlackHole;

    impl Candidate for BlackHole {
        fn endpoint(&self) -> &str {
            "black-hole"
        }

        fn acquire<'a>(
            &'a self,
            _descriptor: &'a ResourceDescriptor,
        ) -> BoxFuture<'a, Result<Option<ResourceHandle>, CandidateError>> {
            Box::pin(std::future::pending())
        }
    }

    /// Always declines.
    struct Decliner;

    impl Candidate for Decliner {
        fn endpoint(&self) -> &str {
            "decliner"
        }

        fn acquire<'a>(
            &'a self,
            _descriptor: &'a ResourceDescriptor,
        ) -> BoxFuture<'a, Result<Option<ResourceHandle>, CandidateError>> {
            Box::pin(async { Ok(None) })
        }
    }

    #[tokio::test]
    async fn rejects_wait_over_three_minutes_immediately() {
        let discovery = Arc::new(StaticDiscovery::new());
        let flaky = Arc::new(Flaky {
            endpoint: "t1".into(),
            failures_left: AtomicUsize::new(0),
            attempts: AtomicUsize::new(0),
        });
        discovery.register("Tables", flaky.clone());

        let poll = DirectoryPoll::new(discovery);
        let err = poll
            .acquire(&descriptor(), Duration::from_secs(181))
            .await
            .unwrap_err();
        assert!(matches!(err, AcquireError::WaitTooLong { requested_secs: 181, .. }));
        assert_eq!(flaky.attempts.load(Ordering::SeqCst), 0);

        let rpc: keel_protocol::RpcError = err.into();
        assert_eq!(rpc.error_code(), RpcErrorCode::ValidationError);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_until_success() {
        let discovery = Arc::new(StaticDiscovery::new());
        discovery.register("Tables", Arc::new(Decliner));
        let flaky = Arc::new(Flaky {
            endpoint: "t1".into(),
            failures_left: AtomicUsize::new(3),
            attempts: AtomicUsize::new(0),
        });
        discovery.register("Tables", flaky.clone());

        let poll = DirectoryPoll::new(discovery);
        let got = poll
            .acquire(&descriptor(), Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(
            got,
            Some(ResourceHandle {
                endpoint: "t1".into(),
                resource_id: "table-42".into(),
            })
        );
        assert_eq!(flaky.attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn never_blocks_past_deadline() {
        let discovery = Arc::new(StaticDiscovery::new());
        discovery.register("Tables", Arc::new(BlackHole));

        let poll = DirectoryPoll::new(discovery);
        let start = Instant::now();
        let got = poll
            .acquire(&descriptor(), Duration::from_secs(15))
            .await
            .unwrap();

        assert_eq!(got, None);
        assert!(start.elapsed() <= Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_candidate_does_not_starve_the_rest() {
        let discovery = Arc::new(StaticDiscovery::new());
        discovery.register("Tables", Arc::new(BlackHole));
        let healthy = Arc::new(Flaky {
            endpoint: "t2".into(),
            failures_left: AtomicUsize::new(0),
            attempts: AtomicUsize::new(0),
        });
        discovery.register("Tables", healthy.clone());

        let poll = DirectoryPoll::new(discovery);
        let start = Instant::now();
        let got = poll
            .acquire(&descriptor(), Duration::from_secs(10))
            .await
            .unwrap();

        assert_eq!(got.map(|h| h.endpoint), Some("t2".to_string()));
        assert_eq!(healthy.attempts.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn configured_ceiling_rejects_longer_waits() {
        let poll = DirectoryPoll::with_ceiling(
            Arc::new(StaticDiscovery::new()),
            Duration::from_secs(30),
        );
        assert_eq!(poll.ceiling(), Duration::from_secs(30));
        let err = poll
            .acquire(&descriptor(), Duration::from_secs(31))
            .await
            .unwrap_err();
        assert!(matches!(err, AcquireError::WaitTooLong { max_secs: 30, .. }));

        let clamped = DirectoryPoll::with_ceiling(
            Arc::new(StaticDiscovery::new()),
            Duration::from_secs(600),
        );
        assert_eq!(clamped.ceiling(), MAX_WAIT);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_directory_returns_none() {
        let poll = DirectoryPoll::new(Arc::new(StaticDiscovery::new()));
        let start = Instant::now();
        let got = poll
            .acquire(&descriptor(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(got, None);
        assert!(start.elapsed() <= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn deregistered_endpoint_is_not_tried() {
        let discovery = Arc::new(StaticDiscovery::new());
        discovery.register("Tables", Arc::new(Decliner));
        assert_eq!(discovery.deregister("decliner"), 1);
        assert!(discovery.candidates("Tables").await.unwrap().is_empty());
    }
}
