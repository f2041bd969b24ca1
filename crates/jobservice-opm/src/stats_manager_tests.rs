    use super::*;
    use jobservice_kv::MemoryKv;
    use serde_json::Value;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    fn test_config() -> StatsManagerConfig {
        StatsManagerConfig {
            backoff_unit: Duration::from_millis(1),
            ..Default::default()
        }
    }

    fn start_manager(kv: &MemoryKv) -> (Arc<JobStatsManager>, CancellationToken) {
        let manager =
            JobStatsManager::new(Arc::new(kv.clone()), KeyBuilder::new("test"), test_config())
                .unwrap();
        let cancel = CancellationToken::new();
        manager.start(cancel.clone()).unwrap();
        (manager, cancel)
    }

    async fn wait_for_requests(server: &MockServer, count: usize) -> Vec<Request> {
        for _ in 0..100 {
            let requests = server.received_requests().await.unwrap_or_default();
            if requests.len() >= count {
                return requests;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        server.received_requests().await.unwrap_or_default()
    }

    fn body(request: &Request) -> Value {
        serde_json::from_slice(&request.body).unwrap()
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let kv = MemoryKv::new();
        let (manager, _cancel) = start_manager(&kv);
        assert!(manager.start(CancellationToken::new()).is_err());
    }

    #[tokio::test]
    async fn test_save_and_retrieve() {
        let kv = MemoryKv::new();
        let (manager, _cancel) = start_manager(&kv);

        let mut stats = JobStats::new("J1", "DEMO", JobKind::Generic);
        stats.parameters.insert("n".to_string(), serde_json::json!(1));
        manager.save(stats.clone()).await;
        manager.sync().await;

        let back = manager.retrieve("J1").await.unwrap();
        assert_eq!(back, stats);

        let ttl = kv.ttl("test:job_stats:J1").await.unwrap();
        assert!(ttl >= ONE_WEEK_SECS - 1 && ttl < ONE_WEEK_SECS + TTL_JITTER_SECS);
    }

    #[tokio::test]
    async fn test_ttl_by_kind() {
        let now = 1_000_000;
        let periodic = JobStats::new("P1", "gc", JobKind::Periodic);
        assert_eq!(stats_ttl(&periodic, now), None);

        let mut scheduled = JobStats::new("S1", "gc", JobKind::Scheduled);
        scheduled.run_at = now + 3600;
        let ttl = stats_ttl(&scheduled, now).unwrap();
        assert!(ttl >= ONE_WEEK_SECS + 3600 && ttl < ONE_WEEK_SECS + 3600 + TTL_JITTER_SECS);

        // A run_at in the past adds nothing.
        scheduled.run_at = now - 3600;
        let ttl = stats_ttl(&scheduled, now).unwrap();
        assert!(ttl < ONE_WEEK_SECS + TTL_JITTER_SECS);
    }

    #[tokio::test]
    async fn test_periodic_stats_do_not_expire_until_told() {
        let kv = MemoryKv::new();
        let (manager, _cancel) = start_manager(&kv);

        manager.save(JobStats::new("P1", "gc", JobKind::Periodic)).await;
        manager.sync().await;
        assert_eq!(kv.ttl("test:job_stats:P1").await.unwrap(), -1);

        manager.expire_periodic_job_stats("P1").await.unwrap();
        assert!(kv.ttl("test:job_stats:P1").await.unwrap() > 0);
    }

    #[tokio::test]
    async fn test_retrieve_missing() {
        let kv = MemoryKv::new();
        let (manager, _cancel) = start_manager(&kv);

        assert!(manager.retrieve("nope").await.unwrap_err().is_not_found());
        assert!(matches!(
            manager.retrieve("").await,
            Err(JobServiceError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_update_refreshes_update_time() {
        let kv = MemoryKv::new();
        let (manager, _cancel) = start_manager(&kv);

        let mut stats = JobStats::new("J1", "DEMO", JobKind::Generic);
        stats.update_time = 1;
        manager.save(stats).await;
        manager
            .update("J1", vec![(FIELD_DIE_AT.to_string(), "77".to_string())])
            .await;
        manager.sync().await;

        let back = manager.retrieve("J1").await.unwrap();
        assert_eq!(back.die_at, 77);
        assert!(back.update_time > 1);
    }

    #[tokio::test]
    async fn test_status_is_reported_to_hook() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let kv = MemoryKv::new();
        let (manager, _cancel) = start_manager(&kv);

        let hook = format!("{}/hook", server.uri());
        manager.register_hook("J1", &hook, false).await.unwrap();
        manager.set_job_status("J1", Status::Running).await;

        let requests = wait_for_requests(&server, 1).await;
        assert_eq!(requests.len(), 1);
        let payload = body(&requests[0]);
        assert_eq!(payload["job_id"], "J1");
        assert_eq!(payload["status"], "Running");
        assert_eq!(payload["metadata"]["job_id"], "J1");
        assert_eq!(payload["metadata"]["web_hook_url"], hook.as_str());

        // Give a duplicate POST the chance to show up.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_check_in_is_recorded_and_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let kv = MemoryKv::new();
        let (manager, _cancel) = start_manager(&kv);

        manager.save(JobStats::new("J1", "gc", JobKind::Periodic)).await;
        manager
            .register_hook("J1", &format!("{}/hook", server.uri()), false)
            .await
            .unwrap();
        manager.check_in("J1", "msg1").await;
        manager.sync().await;

        let stats = manager.retrieve("J1").await.unwrap();
        assert_eq!(stats.check_in, "msg1");
        assert!(stats.check_in_at > 0);

        let requests = wait_for_requests(&server, 1).await;
        let payload = body(&requests[0]);
        assert_eq!(payload["check_in"], "msg1");
        assert_eq!(payload["status"], "Running");
    }

    #[tokio::test]
    async fn test_status_never_moves_backwards() {
        let kv = MemoryKv::new();
        let (manager, _cancel) = start_manager(&kv);

        manager.save(JobStats::new("J1", "DEMO", JobKind::Generic)).await;
        manager.set_job_status("J1", Status::Running).await;
        manager.set_job_status("J1", Status::Success).await;
        manager.set_job_status("J1", Status::Running).await;
        manager.set_job_status("J1", Status::Error).await;
        manager.sync().await;

        assert_eq!(manager.retrieve("J1").await.unwrap().status, Status::Success);
    }

    #[tokio::test]
    async fn test_failed_job_can_run_again() {
        let kv = MemoryKv::new();
        let (manager, _cancel) = start_manager(&kv);

        manager.save(JobStats::new("J1", "DEMO", JobKind::Generic)).await;
        manager.set_job_status("J1", Status::Running).await;
        manager.set_job_status("J1", Status::Error).await;
        manager.set_job_status("J1", Status::Running).await;
        manager.sync().await;

        assert_eq!(manager.retrieve("J1").await.unwrap().status, Status::Running);
    }

    #[tokio::test]
    async fn test_hook_retries_are_bounded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let kv = MemoryKv::new();
        let (manager, _cancel) = start_manager(&kv);

        manager
            .register_hook("J1", &format!("{}/hook", server.uri()), true)
            .await
            .unwrap();
        manager.set_job_status("J1", Status::Running).await;

        let requests = wait_for_requests(&server, 3).await;
        assert_eq!(requests.len(), 3);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
        assert!(manager.hooks.get("J1").is_none());
    }

    #[tokio::test]
    async fn test_hook_cache_dropped_after_final_report() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let kv = MemoryKv::new();
        let (manager, _cancel) = start_manager(&kv);

        manager
            .register_hook("J1", &format!("{}/hook", server.uri()), true)
            .await
            .unwrap();
        manager.set_job_status("J1", Status::Running).await;
        manager.set_job_status("J1", Status::Success).await;

        wait_for_requests(&server, 2).await;
        for _ in 0..50 {
            if manager.hooks.get("J1").is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(manager.hooks.get("J1").is_none());
    }

    #[tokio::test]
    async fn test_get_hook_falls_back_to_store() {
        let kv = MemoryKv::new();
        let (manager, _cancel) = start_manager(&kv);

        manager
            .register_hook("J1", "http://x/hook", false)
            .await
            .unwrap();
        manager.hooks.remove("J1");

        assert_eq!(manager.get_hook("J1").await.unwrap(), "http://x/hook");
        assert_eq!(manager.hooks.get("J1").as_deref(), Some("http://x/hook"));
        assert!(manager.get_hook("J2").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_register_hook_validates_and_publishes() {
        let kv = MemoryKv::new();
        let (manager, _cancel) = start_manager(&kv);
        let mut sub = kv.subscribe("test:period:policies:notifications").await.unwrap();

        assert!(manager.register_hook("J1", "not-a-url", false).await.is_err());
        assert!(manager.register_hook("", "http://x/hook", false).await.is_err());

        manager
            .register_hook("J1", "http://x/hook", false)
            .await
            .unwrap();
        let event = BusEvent::decode(&sub.recv().await.unwrap()).unwrap();
        assert_eq!(
            event,
            BusEvent::RegisterHook(HookData {
                job_id: "J1".to_string(),
                hook_url: "http://x/hook".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_die_at_resolves_dead_entry() {
        let kv = MemoryKv::new();
        let (manager, _cancel) = start_manager(&kv);

        let mut other = QueuedJob::new("DEMO", Default::default());
        other.id = "OTHER".to_string();
        let mut dead = QueuedJob::new("DEMO", Default::default());
        dead.id = "J1".to_string();
        kv.zadd("test:dead", &other.encode().unwrap(), 1_001).await.unwrap();
        kv.zadd("test:dead", &dead.encode().unwrap(), 1_003).await.unwrap();

        manager.save(JobStats::new("J1", "DEMO", JobKind::Generic)).await;
        manager.save(JobStats::new("J2", "DEMO", JobKind::Generic)).await;
        manager.die_at("J1", 1_000).await;
        manager.die_at("J2", 1_000).await;
        manager.sync().await;

        assert_eq!(manager.retrieve("J1").await.unwrap().die_at, 1_003);
        assert_eq!(manager.retrieve("J2").await.unwrap().die_at, 0);
    }

    #[tokio::test]
    async fn test_attach_execution() {
        let kv = MemoryKv::new();
        let (manager, _cancel) = start_manager(&kv);

        let mut upstream = JobStats::new("P1", "gc", JobKind::Periodic);
        upstream.is_multiple_executions = true;
        manager.save(upstream).await;
        manager
            .attach_execution("P1", &["E1".to_string(), "E2".to_string()])
            .await;
        manager.attach_execution("P1", &["E3".to_string()]).await;
        manager.sync().await;

        let stats = manager.retrieve("P1").await.unwrap();
        assert_eq!(stats.executions, vec!["E1", "E2", "E3"]);
        assert!(kv.ttl("test:upstream_job_executions:P1").await.unwrap() > 0);
    }

    #[tokio::test]
    async fn test_commands() {
        let kv = MemoryKv::new();
        let (manager, _cancel) = start_manager(&kv);
        let mut sub = kv.subscribe("test:period:policies:notifications").await.unwrap();

        assert!(manager.ctl_command("J1").unwrap_err().is_not_found());
        assert!(manager.send_command("J1", OpCommand::Retry, false).await.is_err());

        manager.send_command("J1", OpCommand::Stop, true).await.unwrap();
        assert_eq!(manager.ctl_command("J1").unwrap(), OpCommand::Stop);

        manager.send_command("J2", OpCommand::Cancel, false).await.unwrap();
        let event = BusEvent::decode(&sub.recv().await.unwrap()).unwrap();
        assert_eq!(event, BusEvent::FireCommand("J2".to_string(), OpCommand::Cancel));

        assert_eq!(manager.pop_command("J1"), Some(OpCommand::Stop));
        assert!(manager.ctl_command("J1").is_err());
    }

    #[tokio::test]
    async fn test_backoff_grows() {
        let unit = Duration::from_millis(1);
        let first = backoff(unit, 1);
        let second = backoff(unit, 2);
        assert!(first >= Duration::from_millis(2) && first < Duration::from_millis(7));
        assert!(second >= Duration::from_millis(9) && second < Duration::from_millis(14));
    }

    #[tokio::test]
    async fn test_stopped_manager_drops_writes() {
        let kv = MemoryKv::new();
        let (manager, cancel) = start_manager(&kv);
        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(10)).await;

        manager.save(JobStats::new("J1", "DEMO", JobKind::Generic)).await;
        assert!(manager.retrieve("J1").await.is_err());
    }

    #[test]
    fn test_execution_scores_increase() {
        let manager = JobStatsManager::new(
            Arc::new(MemoryKv::new()),
            KeyBuilder::new("test"),
            test_config(),
        )
        .unwrap();
        let a = manager.next_execution_score();
        let b = manager.next_execution_score();
        assert!(b > a);
    }
