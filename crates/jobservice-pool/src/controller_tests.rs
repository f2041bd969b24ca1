    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use jobservice_kv::MemoryKv;
    use jobservice_opm::StatsManagerConfig;
    use jobservice_protocols::{
        Job, JobContext, JobError, JobLogger, JobMetadata, JobServiceResult, Parameters, Status,
    };
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;
    use tracing::Level;

    use crate::config::PoolConfig;
    use crate::logger::JobLoggerFactory;

    /// Requires an `image` parameter.
    struct Replicate;

    #[async_trait]
    impl Job for Replicate {
        fn validate(&self, params: &Parameters) -> JobServiceResult<()> {
            if params.contains_key("image") {
                Ok(())
            } else {
                Err(JobServiceError::Validation("missing image".to_string()))
            }
        }

        async fn run(&self, _ctx: &JobContext, _params: &Parameters) -> Result<(), JobError> {
            Ok(())
        }
    }

    struct Fixture {
        controller: Arc<Controller>,
        _cancel: CancellationToken,
        _dir: TempDir,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let config = PoolConfig {
            stats: StatsManagerConfig {
                backoff_unit: Duration::from_millis(1),
                ..Default::default()
            },
            ..PoolConfig::with_workers(1)
        };
        let pool = WorkerPool::new(
            Arc::new(MemoryKv::new()),
            "test",
            JobLoggerFactory::new(dir.path(), Level::INFO),
            config,
        )
        .unwrap();
        pool.register_job("REPLICATION", Arc::new(Replicate)).unwrap();
        let cancel = CancellationToken::new();
        pool.stats_manager().start(cancel.clone()).unwrap();
        Fixture {
            controller: Controller::new(pool),
            _cancel: cancel,
            _dir: dir,
        }
    }

    fn params() -> Parameters {
        let mut params = Parameters::new();
        params.insert("image".to_string(), serde_json::json!("library/redis"));
        params
    }

    fn request(metadata: JobMetadata) -> JobRequest {
        JobRequest::generic("REPLICATION", params()).with_metadata(metadata)
    }

    fn assert_validation(result: JobServiceResult<JobStats>) {
        match result {
            Err(JobServiceError::Validation(_)) => {}
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_launch_generic_job() {
        let f = fixture();
        let stats = f
            .controller
            .launch_job(JobRequest::generic("REPLICATION", params()))
            .await
            .unwrap();
        assert_eq!(stats.job_kind, JobKind::Generic);
        assert_eq!(stats.status, Status::Pending);
        assert_eq!(stats.ref_link, format!("/api/v1/jobs/{}", stats.job_id));

        f.controller.pool().stats_manager().sync().await;
        let stored = f.controller.get_job(&stats.job_id).await.unwrap();
        assert_eq!(stored.job_name, "REPLICATION");
        assert_eq!(stored.parameters, params());
    }

    #[tokio::test]
    async fn test_launch_rejects_invalid_requests() {
        let f = fixture();

        assert_validation(
            f.controller
                .launch_job(JobRequest::generic("UNKNOWN", params()))
                .await,
        );
        assert_validation(
            f.controller
                .launch_job(JobRequest::generic("REPLICATION", Parameters::new()))
                .await,
        );
        assert_validation(
            f.controller
                .launch_job(request(JobMetadata {
                    kind: JobKind::Scheduled,
                    ..Default::default()
                }))
                .await,
        );
        assert_validation(
            f.controller
                .launch_job(request(JobMetadata {
                    kind: JobKind::Scheduled,
                    schedule_delay: Some(0),
                    ..Default::default()
                }))
                .await,
        );
        assert_validation(
            f.controller
                .launch_job(request(JobMetadata {
                    kind: JobKind::Periodic,
                    ..Default::default()
                }))
                .await,
        );
        assert_validation(
            f.controller
                .launch_job(JobRequest::generic("REPLICATION", params()).with_status_hook("ftp://x"))
                .await,
        );

        let err = f
            .controller
            .launch_job(request(JobMetadata {
                kind: JobKind::Periodic,
                cron_spec: Some("not a cron".to_string()),
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert!(matches!(err, JobServiceError::Cron { .. }));
        assert_eq!(f.controller.pool().policies().size(), 0);
    }

    #[tokio::test]
    async fn test_launch_scheduled_and_periodic_jobs() {
        let f = fixture();

        let scheduled = f
            .controller
            .launch_job(request(JobMetadata {
                kind: JobKind::Scheduled,
                schedule_delay: Some(30),
                ..Default::default()
            }))
            .await
            .unwrap();
        assert_eq!(scheduled.job_kind, JobKind::Scheduled);
        assert_eq!(scheduled.status, Status::Scheduled);

        let periodic = f
            .controller
            .launch_job(
                request(JobMetadata {
                    kind: JobKind::Periodic,
                    cron_spec: Some("0 0 * * * *".to_string()),
                    ..Default::default()
                })
                .with_status_hook("https://hooks.local/periodic"),
            )
            .await
            .unwrap();
        assert_eq!(periodic.job_kind, JobKind::Periodic);
        assert_eq!(periodic.web_hook_url, "https://hooks.local/periodic");
        assert_eq!(f.controller.pool().policies().size(), 1);
    }

    #[tokio::test]
    async fn test_handle_action() {
        let f = fixture();
        let stats = f
            .controller
            .launch_job(request(JobMetadata {
                kind: JobKind::Scheduled,
                schedule_delay: Some(30),
                ..Default::default()
            }))
            .await
            .unwrap();

        let err = f
            .controller
            .handle_action(
                &stats.job_id,
                &JobActionRequest {
                    action: "pause".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, JobServiceError::Validation(_)));

        f.controller
            .handle_action(
                &stats.job_id,
                &JobActionRequest {
                    action: "stop".to_string(),
                },
            )
            .await
            .unwrap();
        f.controller.pool().stats_manager().sync().await;
        assert_eq!(
            f.controller.get_job(&stats.job_id).await.unwrap().status,
            Status::Stopped
        );

        let err = f
            .controller
            .handle_action(
                &stats.job_id,
                &JobActionRequest {
                    action: "retry".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, JobServiceError::Validation(_)));
    }

    #[tokio::test]
    async fn test_job_log_and_status() {
        let f = fixture();
        assert!(f.controller.get_job_log("abc").await.unwrap_err().is_not_found());
        assert!(f.controller.check_status().await.unwrap_err().is_not_found());

        let logger = f.controller.pool().loggers().create("abc").await.unwrap();
        logger.info("copying layers");
        let content = f.controller.get_job_log("abc").await.unwrap();
        assert!(content.contains("[INFO]: copying layers"));
    }

    #[tokio::test]
    async fn test_launcher_is_wired() {
        let f = fixture();
        let launcher = f.controller.pool().launcher().unwrap();
        let stats = launcher(JobRequest::generic("REPLICATION", params()))
            .await
            .unwrap();
        assert_eq!(stats.job_name, "REPLICATION");

        let pool = Arc::clone(f.controller.pool());
        drop(f.controller);
        let launcher = pool.launcher().unwrap();
        let err = launcher(JobRequest::generic("REPLICATION", params()))
            .await
            .unwrap_err();
        assert!(matches!(err, JobServiceError::Internal(_)));
    }
