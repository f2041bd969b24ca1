    use super::*;

    #[tokio::test]
    async fn test_set_nx_ex() {
        let kv = MemoryKv::new();
        assert!(kv.set("lock", "a", SetOptions::nx_ex(30)).await.unwrap());
        assert!(!kv.set("lock", "b", SetOptions::nx_ex(30)).await.unwrap());
        assert_eq!(kv.get("lock").await.unwrap().as_deref(), Some("a"));

        let ttl = kv.ttl("lock").await.unwrap();
        assert!(ttl > 0 && ttl <= 30);
    }

    #[tokio::test]
    async fn test_expired_key_disappears() {
        let kv = MemoryKv::new();
        kv.set("k", "v", SetOptions::default()).await.unwrap();
        assert_eq!(kv.ttl("k").await.unwrap(), -1);

        kv.expire("k", 0).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), None);
        assert_eq!(kv.ttl("k").await.unwrap(), -2);
    }

    #[tokio::test]
    async fn test_del_if_eq() {
        let kv = MemoryKv::new();
        kv.set("lock", "token-1", SetOptions::default()).await.unwrap();

        assert!(!kv.del_if_eq("lock", "token-2").await.unwrap());
        assert!(kv.get("lock").await.unwrap().is_some());
        assert!(kv.del_if_eq("lock", "token-1").await.unwrap());
        assert!(kv.get("lock").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_hash_ops() {
        let kv = MemoryKv::new();
        kv.hset_multiple(
            "h",
            &[
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string()),
            ],
        )
        .await
        .unwrap();
        kv.hset_multiple("h", &[("a".to_string(), "3".to_string())])
            .await
            .unwrap();

        assert_eq!(kv.hget("h", "a").await.unwrap().as_deref(), Some("3"));
        assert_eq!(kv.hget_all("h").await.unwrap().len(), 2);
        assert!(kv.hget_all("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wrong_type() {
        let kv = MemoryKv::new();
        kv.set("s", "v", SetOptions::default()).await.unwrap();
        let err = kv.zadd("s", "m", 1).await.unwrap_err();
        assert!(matches!(err, KvError::WrongType(_)));
    }

    #[tokio::test]
    async fn test_list_is_fifo() {
        let kv = MemoryKv::new();
        kv.lpush("q", "first").await.unwrap();
        kv.lpush("q", "second").await.unwrap();
        assert_eq!(kv.llen("q").await.unwrap(), 2);

        assert_eq!(kv.rpop("q").await.unwrap().as_deref(), Some("first"));
        assert_eq!(kv.rpop("q").await.unwrap().as_deref(), Some("second"));
        assert_eq!(kv.rpop("q").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_rpoplpush_and_lrem() {
        let kv = MemoryKv::new();
        kv.lpush("q", "a").await.unwrap();
        kv.lpush("q", "b").await.unwrap();

        assert_eq!(kv.rpoplpush("q", "busy").await.unwrap().as_deref(), Some("a"));
        assert_eq!(kv.llen("q").await.unwrap(), 1);
        assert_eq!(kv.llen("busy").await.unwrap(), 1);

        assert!(kv.lrem("busy", "a").await.unwrap());
        assert!(!kv.lrem("busy", "a").await.unwrap());
        assert_eq!(kv.llen("busy").await.unwrap(), 0);

        assert_eq!(kv.rpoplpush("empty", "busy").await.unwrap(), None);
        assert_eq!(kv.ttl("busy").await.unwrap(), -2);
    }

    #[tokio::test]
    async fn test_hdel() {
        let kv = MemoryKv::new();
        kv.hset_multiple("h", &[("f".to_string(), "1".to_string())])
            .await
            .unwrap();
        assert!(kv.hdel("h", "f").await.unwrap());
        assert!(!kv.hdel("h", "f").await.unwrap());
        assert!(kv.hget_all("h").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sorted_set_ranges() {
        let kv = MemoryKv::new();
        kv.zadd("z", "c", 30).await.unwrap();
        kv.zadd("z", "a", 10).await.unwrap();
        kv.zadd("z", "b", 20).await.unwrap();
        // Re-adding a member overwrites its score.
        kv.zadd("z", "a", 10).await.unwrap();
        assert_eq!(kv.zcard("z").await.unwrap(), 3);

        let range = kv.zrange_by_score("z", 10, 20).await.unwrap();
        assert_eq!(range, vec![("a".to_string(), 10), ("b".to_string(), 20)]);

        assert_eq!(kv.zscore("z", "c").await.unwrap(), Some(30));
        assert!(kv.zrem("z", "c").await.unwrap());
        assert!(!kv.zrem("z", "c").await.unwrap());

        assert_eq!(kv.zrem_range_by_score("z", 0, 15).await.unwrap(), 1);
        assert_eq!(
            kv.zrange_with_scores("z").await.unwrap(),
            vec![("b".to_string(), 20)]
        );
    }

    #[tokio::test]
    async fn test_pubsub_fans_out_to_every_subscriber() {
        let kv = MemoryKv::new();
        let replica = kv.clone();

        let mut a = kv.subscribe("ch").await.unwrap();
        let mut b = replica.subscribe("ch").await.unwrap();
        kv.publish("ch", "hello").await.unwrap();
        kv.publish("other", "ignored").await.unwrap();

        assert_eq!(a.recv().await.as_deref(), Some("hello"));
        assert_eq!(b.recv().await.as_deref(), Some("hello"));
        assert_eq!(a.channel(), "ch");
    }

    #[tokio::test]
    async fn test_exec_applies_batch_and_publishes() {
        let kv = MemoryKv::new();
        let mut sub = kv.subscribe("ch").await.unwrap();

        let batch = Batch::new()
            .zadd("policies", "{\"job_name\":\"gc\"}", 100)
            .zadd("key_score", "P1", 100)
            .publish("ch", "scheduled");
        kv.exec(batch).await.unwrap();

        assert_eq!(kv.zcard("policies").await.unwrap(), 1);
        assert_eq!(kv.zscore("key_score", "P1").await.unwrap(), Some(100));
        assert_eq!(sub.recv().await.as_deref(), Some("scheduled"));
    }

    #[tokio::test]
    async fn test_failed_batch_is_not_applied() {
        let kv = MemoryKv::new();
        kv.set("s", "v", SetOptions::default()).await.unwrap();

        let batch = Batch::new().zadd("z", "m", 1).zadd("s", "m", 1);
        assert!(kv.exec(batch).await.is_err());
        assert_eq!(kv.zcard("z").await.unwrap(), 0);
    }
