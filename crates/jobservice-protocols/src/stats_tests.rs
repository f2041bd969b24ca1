    use super::*;

    fn to_map(fields: Vec<(String, String)>) -> HashMap<String, String> {
        fields.into_iter().collect()
    }

    #[test]
    fn test_new_stats() {
        let stats = JobStats::new("J1", "DEMO", JobKind::Generic);
        assert_eq!(stats.status, Status::Pending);
        assert_eq!(stats.ref_link, "/api/v1/jobs/J1");
        assert!(stats.enqueue_time > 0);
        assert_eq!(stats.enqueue_time, stats.update_time);
    }

    #[test]
    fn test_hash_round_trip() {
        let mut stats = JobStats::new("J1", "DEMO", JobKind::Scheduled);
        stats.is_unique = true;
        stats.status = Status::Scheduled;
        stats.run_at = 1_700_000_000;
        stats.check_in = "half way".to_string();
        stats.check_in_at = 1_700_000_010;
        stats.die_at = 1_700_000_020;
        stats.web_hook_url = "http://x/hook".to_string();
        stats.upstream_job_id = "P1".to_string();
        stats.parameters.insert("count".to_string(), serde_json::json!(3));

        let back = JobStats::from_hash("J1", &to_map(stats.to_hash_fields()));
        assert_eq!(back, stats);
    }

    #[test]
    fn test_optional_fields_not_written_when_empty() {
        let stats = JobStats::new("J1", "DEMO", JobKind::Generic);
        let map = to_map(stats.to_hash_fields());
        assert!(!map.contains_key(FIELD_CHECK_IN));
        assert!(!map.contains_key(FIELD_DIE_AT));
        assert!(!map.contains_key(FIELD_STATUS_HOOK));
        assert!(!map.contains_key(FIELD_PARAMETERS));
    }

    #[test]
    fn test_from_partial_hash() {
        let mut hash = HashMap::new();
        hash.insert(FIELD_STATUS_HOOK.to_string(), "http://x/hook".to_string());
        hash.insert(FIELD_ENQUEUE_TIME.to_string(), "garbage".to_string());

        let stats = JobStats::from_hash("J1", &hash);
        assert_eq!(stats.job_id, "J1");
        assert_eq!(stats.web_hook_url, "http://x/hook");
        assert_eq!(stats.enqueue_time, 0);
        assert_eq!(stats.status, Status::Pending);
    }

    #[test]
    fn test_json_field_names() {
        let stats = JobStats::new("J1", "DEMO", JobKind::Periodic);
        let value = serde_json::to_value(&stats).unwrap();
        assert_eq!(value["job_id"], "J1");
        assert_eq!(value["job_kind"], "Periodic");
        assert_eq!(value["status"], "Pending");
        assert!(value.get("check_in").is_none());
    }
