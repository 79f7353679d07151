//! Tests for the in-memory backend.

use super::*;

const SHORT: Duration = Duration::from_millis(500);

async fn connect(backend: &InMemoryBackend) -> Box<dyn Connection> {
    backend.connect().await.expect("connect should succeed")
}

// ============================================================================
// Read key parsing
// ============================================================================

mod read_request_parsing {
    use super::*;

    #[test]
    fn test_plain_key() {
        let request = ReadRequest::parse("fooQueue").unwrap();
        assert_eq!(request.queue, "fooQueue");
        assert_eq!(request.wait, None);
        assert!(!request.open && !request.close && !request.abort && !request.peek);
    }

    #[test]
    fn test_reliable_key_with_close_and_open() {
        let request = ReadRequest::parse("fooQueue/t=30000/close/open").unwrap();
        assert_eq!(request.queue, "fooQueue");
        assert_eq!(request.wait, Some(Duration::from_millis(30_000)));
        assert!(request.open);
        assert!(request.close);
    }

    #[test]
    fn test_unknown_option_is_protocol_error() {
        assert!(matches!(
            ReadRequest::parse("fooQueue/bogus"),
            Err(TransportError::Protocol { .. })
        ));
        assert!(matches!(
            ReadRequest::parse("fooQueue/t=soon"),
            Err(TransportError::Protocol { .. })
        ));
        assert!(matches!(
            ReadRequest::parse("/open"),
            Err(TransportError::Protocol { .. })
        ));
        assert!(matches!(
            ReadRequest::parse("fooQueue/open/peek"),
            Err(TransportError::Protocol { .. })
        ));
    }
}

// ============================================================================
// Plain reads
// ============================================================================

mod plain_reads {
    use super::*;

    #[tokio::test]
    async fn test_set_then_get_removes_item() {
        let backend = InMemoryBackend::new();
        let mut conn = connect(&backend).await;

        assert!(conn.set("q", 60, "one").await.unwrap());
        assert_eq!(backend.queue_depth("q"), 1);

        let value = conn.get("q", SHORT).await.unwrap();
        assert_eq!(value.as_deref(), Some("one"));
        assert_eq!(backend.queue_depth("q"), 0);
    }

    #[tokio::test]
    async fn test_items_come_out_in_fifo_order() {
        let backend = InMemoryBackend::new();
        let mut conn = connect(&backend).await;

        for value in ["a", "b", "c"] {
            conn.set("q", 0, value).await.unwrap();
        }

        for expected in ["a", "b", "c"] {
            assert_eq!(conn.get("q", SHORT).await.unwrap().as_deref(), Some(expected));
        }
        assert_eq!(conn.get("q", SHORT).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_empty_queue_without_wait_returns_none_immediately() {
        let backend = InMemoryBackend::new();
        let mut conn = connect(&backend).await;

        let start = Instant::now();
        assert_eq!(conn.get("empty", SHORT).await.unwrap(), None);
        assert!(start.elapsed() < SHORT);
    }

    #[tokio::test]
    async fn test_blocking_read_wakes_on_arrival() {
        let backend = InMemoryBackend::new();
        let mut reader = connect(&backend).await;
        let mut writer = connect(&backend).await;

        let read = tokio::spawn(async move { reader.get("q/t=2000", Duration::from_secs(3)).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        writer.set("q", 0, "late").await.unwrap();

        let value = read.await.unwrap().unwrap();
        assert_eq!(value.as_deref(), Some("late"));
    }

    #[tokio::test]
    async fn test_blocking_read_times_out_on_server_side() {
        let backend = InMemoryBackend::new();
        let mut conn = connect(&backend).await;

        let value = conn.get("q/t=50", Duration::from_secs(1)).await.unwrap();
        assert_eq!(value, None);
    }

    #[tokio::test]
    async fn test_client_deadline_shorter_than_wait_is_transport_timeout() {
        let backend = InMemoryBackend::new();
        let mut conn = connect(&backend).await;

        let result = conn.get("q/t=1000", Duration::from_millis(50)).await;
        assert!(matches!(result, Err(TransportError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_expired_items_are_not_delivered() {
        let backend = InMemoryBackend::new();
        let mut conn = connect(&backend).await;

        conn.set("q", 1, "short-lived").await.unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert_eq!(conn.get("q", SHORT).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_peek_leaves_item_in_queue() {
        let backend = InMemoryBackend::new();
        let mut conn = connect(&backend).await;
        conn.set("q", 0, "x").await.unwrap();

        assert_eq!(conn.get("q/peek", SHORT).await.unwrap().as_deref(), Some("x"));
        assert_eq!(backend.queue_depth("q"), 1);
    }

    #[tokio::test]
    async fn test_set_with_read_options_is_rejected() {
        let backend = InMemoryBackend::new();
        let mut conn = connect(&backend).await;

        let result = conn.set("q/open", 0, "x").await;
        assert!(matches!(result, Err(TransportError::Protocol { .. })));
    }
}

// ============================================================================
// Reliable reads
// ============================================================================

mod reliable_reads {
    use super::*;

    #[tokio::test]
    async fn test_open_hides_item_until_closed() {
        let backend = InMemoryBackend::new();
        let mut consumer = connect(&backend).await;
        let mut other = connect(&backend).await;
        consumer.set("q", 0, "job").await.unwrap();

        let opened = consumer.get("q/open", SHORT).await.unwrap();
        assert_eq!(opened.as_deref(), Some("job"));
        assert_eq!(backend.open_count("q"), 1);
        assert_eq!(backend.queue_depth("q"), 0);

        // Invisible to other readers while open
        assert_eq!(other.get("q", SHORT).await.unwrap(), None);

        // Closing acknowledges and removes it for good
        assert_eq!(consumer.get("q/close", SHORT).await.unwrap(), None);
        assert_eq!(other.get("q", SHORT).await.unwrap(), None);
        assert_eq!(backend.open_count("q"), 0);
        assert_eq!(backend.queue_depth("q"), 0);
    }

    #[tokio::test]
    async fn test_close_and_open_in_one_read() {
        let backend = InMemoryBackend::new();
        let mut conn = connect(&backend).await;
        conn.set("q", 0, "first").await.unwrap();
        conn.set("q", 0, "second").await.unwrap();

        assert_eq!(conn.get("q/open", SHORT).await.unwrap().as_deref(), Some("first"));
        assert_eq!(
            conn.get("q/close/open", SHORT).await.unwrap().as_deref(),
            Some("second")
        );
        assert_eq!(backend.open_count("q"), 1);

        assert_eq!(conn.get("q/close/open", SHORT).await.unwrap(), None);
        assert_eq!(backend.open_count("q"), 0);
        assert_eq!(backend.queue_depth("q"), 0);
    }

    #[tokio::test]
    async fn test_second_open_without_close_is_rejected() {
        let backend = InMemoryBackend::new();
        let mut conn = connect(&backend).await;
        conn.set("q", 0, "first").await.unwrap();
        conn.set("q", 0, "second").await.unwrap();

        assert_eq!(conn.get("q/open", SHORT).await.unwrap().as_deref(), Some("first"));
        assert!(matches!(
            conn.get("q/open", SHORT).await,
            Err(TransportError::Protocol { .. })
        ));
        assert_eq!(backend.open_count("q"), 1);
        assert_eq!(backend.queue_depth("q"), 1);

        // Aborting first frees the connection to open again
        assert_eq!(conn.get("q/abort/open", SHORT).await.unwrap().as_deref(), Some("first"));
        assert_eq!(backend.open_count("q"), 1);
    }

    #[tokio::test]
    async fn test_open_items_of_several_connections_return_in_order() {
        let backend = InMemoryBackend::with_open_grace(Duration::from_millis(100));
        let mut first = connect(&backend).await;
        let mut second = connect(&backend).await;
        let mut other = connect(&backend).await;
        for value in ["a", "b", "c"] {
            first.set("q", 0, value).await.unwrap();
        }

        first.get("q/open", SHORT).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        second.get("q/open", SHORT).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        for expected in ["a", "b", "c"] {
            assert_eq!(other.get("q", SHORT).await.unwrap().as_deref(), Some(expected));
        }
    }

    #[tokio::test]
    async fn test_abort_returns_item() {
        let backend = InMemoryBackend::new();
        let mut conn = connect(&backend).await;
        conn.set("q", 0, "job").await.unwrap();

        conn.get("q/open", SHORT).await.unwrap();
        assert_eq!(conn.get("q/t=1000/abort", SHORT).await.unwrap(), None);
        assert_eq!(backend.open_count("q"), 0);
        assert_eq!(conn.get("q", SHORT).await.unwrap().as_deref(), Some("job"));
    }

    #[tokio::test]
    async fn test_bare_close_acknowledges_without_fetching() {
        let backend = InMemoryBackend::new();
        let mut conn = connect(&backend).await;
        conn.set("q", 0, "first").await.unwrap();
        conn.set("q", 0, "second").await.unwrap();

        conn.get("q/open", SHORT).await.unwrap();
        assert_eq!(conn.get("q/close", SHORT).await.unwrap(), None);

        assert_eq!(backend.open_count("q"), 0);
        assert_eq!(backend.queue_depth("q"), 1);
    }

    #[tokio::test]
    async fn test_open_item_returns_after_grace_window() {
        let backend = InMemoryBackend::with_open_grace(Duration::from_millis(100));
        let mut consumer = connect(&backend).await;
        let mut other = connect(&backend).await;
        consumer.set("q", 0, "job").await.unwrap();

        consumer.get("q/open", SHORT).await.unwrap();
        assert_eq!(other.get("q", SHORT).await.unwrap(), None);

        let redelivered = other.get("q/t=1000", Duration::from_secs(2)).await.unwrap();
        assert_eq!(redelivered.as_deref(), Some("job"));
    }

    #[tokio::test]
    async fn test_shutdown_returns_open_items() {
        let backend = InMemoryBackend::new();
        let mut consumer = connect(&backend).await;
        let mut other = connect(&backend).await;
        consumer.set("q", 0, "job").await.unwrap();

        consumer.get("q/open", SHORT).await.unwrap();
        consumer.shutdown().await.unwrap();

        assert_eq!(other.get("q", SHORT).await.unwrap().as_deref(), Some("job"));
    }
}

// ============================================================================
// Connections and fault injection
// ============================================================================

mod connections {
    use super::*;

    #[tokio::test]
    async fn test_connection_accounting() {
        let backend = InMemoryBackend::new();
        let mut first = connect(&backend).await;
        let second = connect(&backend).await;

        assert_eq!(backend.connections_created(), 2);
        assert_eq!(backend.live_connections(), 2);

        first.shutdown().await.unwrap();
        assert!(first.is_shutdown());
        assert_eq!(backend.live_connections(), 1);

        // Shutting down twice does not double count
        first.shutdown().await.unwrap();
        assert_eq!(backend.live_connections(), 1);

        drop(second);
        assert_eq!(backend.live_connections(), 0);
        drop(first);
        assert_eq!(backend.live_connections(), 0);
    }

    #[tokio::test]
    async fn test_shut_down_connection_rejects_commands() {
        let backend = InMemoryBackend::new();
        let mut conn = connect(&backend).await;
        conn.shutdown().await.unwrap();

        assert!(matches!(
            conn.get("q", SHORT).await,
            Err(TransportError::Shutdown)
        ));
        assert!(matches!(
            conn.set("q", 0, "x").await,
            Err(TransportError::Shutdown)
        ));
    }

    #[tokio::test]
    async fn test_injected_faults_are_consumed_in_order() {
        let backend = InMemoryBackend::new();
        backend.inject_connect_failures(1);
        assert!(matches!(backend.connect().await, Err(TransportError::Io(_))));

        let mut conn = connect(&backend).await;
        backend.inject_read_timeouts(1);
        backend.inject_protocol_errors(1);

        assert!(matches!(
            conn.get("q", SHORT).await,
            Err(TransportError::Timeout { .. })
        ));
        assert!(matches!(
            conn.get("q", SHORT).await,
            Err(TransportError::Protocol { .. })
        ));
        assert_eq!(conn.get("q", SHORT).await.unwrap(), None);
        assert_eq!(backend.requests(), vec!["q", "q", "q"]);
    }

    #[tokio::test]
    async fn test_request_log_keeps_only_recent_keys() {
        let backend = InMemoryBackend::new();
        let mut conn = connect(&backend).await;

        for n in 0..REQUEST_LOG_LIMIT + 10 {
            conn.get(&format!("q{}", n), SHORT).await.unwrap();
        }

        let requests = backend.requests();
        assert_eq!(requests.len(), REQUEST_LOG_LIMIT);
        assert_eq!(requests[0], "q10");
        assert_eq!(requests[REQUEST_LOG_LIMIT - 1], format!("q{}", REQUEST_LOG_LIMIT + 9));
    }
}
