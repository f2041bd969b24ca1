    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use jobservice_kv::MemoryKv;
    use jobservice_opm::StatsManagerConfig;
    use jobservice_protocols::{JobContext, JobError};
    use tempfile::TempDir;
    use tracing::Level;

    struct Succeed;

    #[async_trait]
    impl Job for Succeed {
        async fn run(&self, ctx: &JobContext, _params: &Parameters) -> Result<(), JobError> {
            ctx.check_in("done").await;
            Ok(())
        }
    }

    struct Other;

    #[async_trait]
    impl Job for Other {
        async fn run(&self, _ctx: &JobContext, _params: &Parameters) -> Result<(), JobError> {
            Ok(())
        }
    }

    fn test_config() -> PoolConfig {
        PoolConfig {
            workers: 2,
            fetch_interval: Duration::from_millis(10),
            requeue_interval: Duration::from_millis(10),
            heartbeat_interval: Duration::from_millis(50),
            ping_attempts: 2,
            ping_backoff: Duration::from_millis(1),
            die_at_delay: Duration::ZERO,
            stats: StatsManagerConfig {
                backoff_unit: Duration::from_millis(1),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    struct Fixture {
        kv: MemoryKv,
        pool: Arc<WorkerPool>,
        cancel: CancellationToken,
        _dir: TempDir,
    }

    fn fixture() -> Fixture {
        let kv = MemoryKv::new();
        let dir = TempDir::new().unwrap();
        let pool = WorkerPool::new(
            Arc::new(kv.clone()),
            "test",
            JobLoggerFactory::new(dir.path(), Level::DEBUG),
            test_config(),
        )
        .unwrap();
        pool.register_job("DEMO", Arc::new(Succeed)).unwrap();
        Fixture {
            kv,
            pool,
            cancel: CancellationToken::new(),
            _dir: dir,
        }
    }

    impl Fixture {
        /// Start only the stats write loop, leaving workers idle.
        fn start_stats(&self) {
            self.pool.stats.start(self.cancel.clone()).unwrap();
        }

        async fn stats_of(&self, job_id: &str) -> JobStats {
            self.pool.stats.sync().await;
            self.pool.stats.retrieve(job_id).await.unwrap()
        }
    }

    #[test]
    fn test_zero_workers_rejected() {
        let result = WorkerPool::new(
            Arc::new(MemoryKv::new()),
            "test",
            JobLoggerFactory::new("/tmp", Level::INFO),
            PoolConfig::with_workers(0),
        );
        assert!(matches!(result, Err(JobServiceError::Fatal(_))));
    }

    #[tokio::test]
    async fn test_enqueue_unknown_job() {
        let f = fixture();
        let err = f
            .pool
            .enqueue("NOPE", Parameters::new(), false, None)
            .await
            .unwrap_err();
        assert!(matches!(err, JobServiceError::Validation(_)));
    }

    #[tokio::test]
    async fn test_enqueue_writes_record_before_queue() {
        let f = fixture();
        f.start_stats();

        let stats = f
            .pool
            .enqueue("DEMO", Parameters::new(), false, Some("http://hooks.local/cb"))
            .await
            .unwrap();
        assert_eq!(stats.status, Status::Pending);
        assert_eq!(stats.job_kind, JobKind::Generic);
        assert_eq!(f.pool.queue.ready_len("DEMO").await.unwrap(), 1);

        let stored = f.stats_of(&stats.job_id).await;
        assert_eq!(stored.status, Status::Pending);
        assert_eq!(stored.web_hook_url, "http://hooks.local/cb");
        assert_eq!(
            f.pool.stats.get_hook(&stats.job_id).await.unwrap(),
            "http://hooks.local/cb"
        );
    }

    #[tokio::test]
    async fn test_unique_enqueue_conflicts() {
        let f = fixture();
        f.start_stats();
        let mut params = Parameters::new();
        params.insert("image".to_string(), serde_json::json!("library/busybox"));

        f.pool.enqueue("DEMO", params.clone(), true, None).await.unwrap();
        let err = f
            .pool
            .enqueue("DEMO", params.clone(), true, None)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(f.pool.queue.ready_len("DEMO").await.unwrap(), 1);

        // Non-unique submissions of the same job are not affected.
        f.pool.enqueue("DEMO", params, false, None).await.unwrap();
        assert_eq!(f.pool.queue.ready_len("DEMO").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_enqueue_in_schedules_entry() {
        let f = fixture();
        f.start_stats();

        let stats = f
            .pool
            .enqueue_in("DEMO", 60, Parameters::new(), false, None)
            .await
            .unwrap();
        assert_eq!(stats.job_kind, JobKind::Scheduled);
        assert_eq!(stats.status, Status::Scheduled);
        assert!(stats.run_at >= now_epoch() + 59);

        let entries = f.kv.zrange_with_scores("test:scheduled").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1, stats.run_at);
        assert_eq!(f.pool.queue.ready_len("DEMO").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stop_scheduled_job() {
        let f = fixture();
        f.start_stats();
        let stats = f
            .pool
            .enqueue_in("DEMO", 60, Parameters::new(), false, None)
            .await
            .unwrap();

        f.pool.stop_job(&stats.job_id).await.unwrap();
        assert_eq!(f.kv.zcard("test:scheduled").await.unwrap(), 0);
        assert_eq!(f.stats_of(&stats.job_id).await.status, Status::Stopped);

        let err = f.pool.stop_job(&stats.job_id).await.unwrap_err();
        assert!(matches!(err, JobServiceError::Validation(_)));
    }

    #[tokio::test]
    async fn test_stopping_unique_scheduled_job_releases_lock() {
        let f = fixture();
        f.start_stats();
        let stats = f
            .pool
            .enqueue_in("DEMO", 60, Parameters::new(), true, None)
            .await
            .unwrap();
        assert!(
            f.pool
                .enqueue_in("DEMO", 60, Parameters::new(), true, None)
                .await
                .unwrap_err()
                .is_conflict()
        );

        f.pool.stop_job(&stats.job_id).await.unwrap();
        assert_eq!(f.stats_of(&stats.job_id).await.status, Status::Stopped);

        let again = f
            .pool
            .enqueue_in("DEMO", 60, Parameters::new(), true, None)
            .await
            .unwrap();
        assert_ne!(again.job_id, stats.job_id);
    }

    #[tokio::test]
    async fn test_stop_and_cancel_need_running_job() {
        let f = fixture();
        f.start_stats();
        let stats = f
            .pool
            .enqueue("DEMO", Parameters::new(), false, None)
            .await
            .unwrap();

        let err = f.pool.stop_job(&stats.job_id).await.unwrap_err();
        assert!(matches!(err, JobServiceError::Validation(_)));
        let err = f.pool.cancel_job(&stats.job_id).await.unwrap_err();
        assert!(matches!(err, JobServiceError::Validation(_)));
        assert!(f.pool.stats.ctl_command(&stats.job_id).is_err());

        f.pool.stats.set_job_status(&stats.job_id, Status::Running).await;
        f.pool.stats.sync().await;
        f.pool.stop_job(&stats.job_id).await.unwrap();
        assert_eq!(
            f.pool.stats.ctl_command(&stats.job_id).unwrap(),
            OpCommand::Stop
        );

        assert!(f.pool.stop_job("missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_cancel_rejects_scheduled_kind() {
        let f = fixture();
        f.start_stats();
        let stats = f
            .pool
            .enqueue_in("DEMO", 60, Parameters::new(), false, None)
            .await
            .unwrap();
        let err = f.pool.cancel_job(&stats.job_id).await.unwrap_err();
        assert!(matches!(err, JobServiceError::Validation(_)));
    }

    #[tokio::test]
    async fn test_retry_dead_job() {
        let f = fixture();
        f.start_stats();
        let stats = f
            .pool
            .enqueue("DEMO", Parameters::new(), false, None)
            .await
            .unwrap();

        let err = f.pool.retry_job(&stats.job_id).await.unwrap_err();
        assert!(matches!(err, JobServiceError::Validation(_)));

        let job = f
            .pool
            .queue
            .dequeue(&["DEMO".to_string()], f.pool.id())
            .await
            .unwrap()
            .unwrap()
            .job;
        let died_at = now_epoch();
        f.pool.queue.bury(&job, died_at).await.unwrap();
        f.pool.stats.die_at(&job.id, died_at).await;
        f.pool.stats.sync().await;
        assert_eq!(f.stats_of(&job.id).await.die_at, died_at);

        f.pool.retry_job(&job.id).await.unwrap();
        assert_eq!(f.kv.zcard("test:dead").await.unwrap(), 0);
        assert_eq!(f.pool.queue.ready_len("DEMO").await.unwrap(), 1);
        assert_eq!(f.stats_of(&job.id).await.die_at, 0);

        // The dead entry is gone now.
        f.pool
            .stats
            .update(&job.id, vec![(FIELD_DIE_AT.to_string(), died_at.to_string())])
            .await;
        f.pool.stats.sync().await;
        assert!(f.pool.retry_job(&job.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_periodic_enqueue_and_stop() {
        let f = fixture();
        f.start_stats();

        let stats = f
            .pool
            .periodically_enqueue("DEMO", Parameters::new(), "0 */5 * * * *", None)
            .await
            .unwrap();
        assert_eq!(stats.job_kind, JobKind::Periodic);
        assert_eq!(stats.status, Status::Scheduled);
        assert_eq!(stats.cron_spec, "0 */5 * * * *");
        assert!(stats.run_at > now_epoch());
        assert!(stats.numeric_policy_id > 0);
        assert_eq!(f.pool.policies.size(), 1);
        assert!(f.kv.zcard("test:scheduled").await.unwrap() > 0);

        let stored = f.stats_of(&stats.job_id).await;
        assert_eq!(stored.numeric_policy_id, stats.numeric_policy_id);

        f.pool.stop_job(&stats.job_id).await.unwrap();
        assert_eq!(f.pool.policies.size(), 0);
        assert_eq!(f.kv.zcard("test:period:policies").await.unwrap(), 0);
        assert_eq!(f.kv.zcard("test:scheduled").await.unwrap(), 0);
        assert_eq!(f.stats_of(&stats.job_id).await.status, Status::Stopped);
    }

    #[tokio::test]
    async fn test_periodic_enqueue_rejects_bad_cron() {
        let f = fixture();
        f.start_stats();
        let err = f
            .pool
            .periodically_enqueue("DEMO", Parameters::new(), "every minute", None)
            .await
            .unwrap_err();
        assert!(matches!(err, JobServiceError::Cron { .. }));
        assert_eq!(f.pool.policies.size(), 0);
    }

    #[tokio::test]
    async fn test_heartbeat_and_pool_stats() {
        let f = fixture();
        f.pool.register_job("OTHER", Arc::new(Other)).unwrap();
        assert!(f.pool.stats().await.unwrap_err().is_not_found());

        let now = now_epoch();
        f.pool.heartbeat(now).await.unwrap();

        let pools = f.pool.stats_at(now).await.unwrap();
        assert_eq!(pools.len(), 1);
        assert_eq!(pools[0].pool_id, f.pool.id());
        assert_eq!(pools[0].heartbeat_at, now);
        assert_eq!(pools[0].concurrency, 2);
        assert_eq!(pools[0].job_names, vec!["DEMO".to_string(), "OTHER".to_string()]);
        assert_eq!(pools[0].status, PoolStatus::Healthy);

        let later = f.pool.stats_at(now + HEARTBEAT_DEAD_SECS + 1).await.unwrap();
        assert_eq!(later[0].status, PoolStatus::Dead);
    }

    #[test]
    fn test_fetch_order_rotates() {
        let f = fixture();
        f.pool.register_job("OTHER", Arc::new(Other)).unwrap();
        assert_eq!(f.pool.fetch_order(), vec!["DEMO", "OTHER"]);
        assert_eq!(f.pool.fetch_order(), vec!["OTHER", "DEMO"]);
        assert_eq!(f.pool.fetch_order(), vec!["DEMO", "OTHER"]);
    }

    #[tokio::test]
    async fn test_start_requires_registered_jobs() {
        let dir = TempDir::new().unwrap();
        let pool = WorkerPool::new(
            Arc::new(MemoryKv::new()),
            "test",
            JobLoggerFactory::new(dir.path(), Level::INFO),
            test_config(),
        )
        .unwrap();
        let err = pool.start(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, JobServiceError::Fatal(_)));
    }

    #[tokio::test]
    async fn test_started_pool_runs_jobs() {
        let f = fixture();
        f.pool.start(f.cancel.clone()).await.unwrap();
        assert!(f.pool.start(f.cancel.clone()).await.is_err());

        let stats = f
            .pool
            .enqueue("DEMO", Parameters::new(), false, None)
            .await
            .unwrap();

        let mut status = Status::Pending;
        for _ in 0..200 {
            status = f.stats_of(&stats.job_id).await.status;
            if status == Status::Success {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, Status::Success);
        assert_eq!(f.stats_of(&stats.job_id).await.check_in, "done");
        assert_eq!(f.kv.zcard("test:worker_pools").await.unwrap(), 1);

        f.cancel.cancel();
        f.pool.wait().await;
        assert_eq!(f.kv.zcard("test:worker_pools").await.unwrap(), 0);
    }
