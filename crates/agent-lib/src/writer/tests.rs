//! Writer tests against a mock ingest server

#[cfg(test)]
mod writer_tests {
    use crate::config::WriterConfig;
    use crate::models::{Datapoint, DimProperties, Event, EventCategory, TraceSpan};
    use crate::writer::{CounterSnapshot, Writer};
    use mockito::Matcher;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    fn config(url: &str) -> WriterConfig {
        let mut conf = WriterConfig {
            ingest_url: url.to_string(),
            api_url: url.to_string(),
            access_token: "tok".to_string(),
            event_send_interval: Duration::from_millis(50),
            ..Default::default()
        };
        conf.host_id_dimensions.insert("host".into(), "testhost".into());
        conf
    }

    async fn wait_for(writer: &Writer, done: impl Fn(&CounterSnapshot) -> bool) -> CounterSnapshot {
        for _ in 0..200 {
            let snap = writer.snapshot();
            if done(&snap) {
                return snap;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("writer counters never reached the expected state: {:?}", writer.snapshot());
    }

    #[tokio::test]
    async fn test_datapoints_are_posted_with_host_dims() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v2/datapoint")
            .match_header("x-sf-token", "tok")
            .match_header("content-type", "application/json")
            .match_body(Matcher::AllOf(vec![
                Matcher::Regex(r#""metric":"cpu.utilization""#.to_string()),
                Matcher::Regex(r#""host":"testhost""#.to_string()),
            ]))
            .with_status(200)
            .create_async()
            .await;

        let writer = Writer::start(config(&server.url()), CancellationToken::new()).unwrap();
        assert!(writer
            .sinks()
            .send_datapoint(Datapoint::gauge("cpu.utilization", 12.5)));

        let snap = wait_for(&writer, |s| s.dps_sent == 1).await;
        assert_eq!(snap.dps_received, 1);
        assert_eq!(snap.dp_requests_failed, 0);
        mock.assert_async().await;
        writer.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_batches_are_counted_and_dropped() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v2/datapoint")
            .with_status(500)
            .create_async()
            .await;

        let writer = Writer::start(config(&server.url()), CancellationToken::new()).unwrap();
        writer.sinks().send_datapoint(Datapoint::gauge("a", 1i64));

        let snap = wait_for(&writer, |s| s.dp_requests_failed == 1).await;
        assert_eq!(snap.dps_sent, 0);
        assert_eq!(snap.dps_in_flight, 0);
        assert_eq!(snap.dp_requests_active, 0);
        writer.shutdown().await;
    }

    #[tokio::test]
    async fn test_events_flush_on_interval() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v2/event")
            .match_body(Matcher::Regex(r#""eventType":"deploy""#.to_string()))
            .with_status(200)
            .create_async()
            .await;

        let writer = Writer::start(config(&server.url()), CancellationToken::new()).unwrap();
        writer
            .sinks()
            .send_event(Event::new("deploy", EventCategory::UserDefined));

        wait_for(&writer, |s| s.events_sent == 1).await;
        mock.assert_async().await;
        writer.shutdown().await;
    }

    #[tokio::test]
    async fn test_spans_are_protobuf() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/trace")
            .match_header("content-type", "application/x-protobuf")
            .with_status(200)
            .create_async()
            .await;

        let writer = Writer::start(config(&server.url()), CancellationToken::new()).unwrap();
        writer.sinks().send_span(TraceSpan {
            trace_id: "t".into(),
            id: "s".into(),
            ..Default::default()
        });

        wait_for(&writer, |s| s.trace_spans_sent == 1).await;
        mock.assert_async().await;
        writer.shutdown().await;
    }

    #[tokio::test]
    async fn test_dim_props_dedup() {
        let mut server = mockito::Server::new_async().await;
        let first = server
            .mock("PUT", "/v2/dimension/k8s_pod_uid/abc")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "customProperties": {"app": "x"}
            })))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;
        let second = server
            .mock("PUT", "/v2/dimension/k8s_pod_uid/abc")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "customProperties": {"app": "y"}
            })))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let writer = Writer::start(config(&server.url()), CancellationToken::new()).unwrap();
        let sinks = writer.sinks();
        let update = |app: &str| DimProperties::new("k8s_pod_uid", "abc").with_property("app", app);

        for _ in 0..3 {
            sinks.send_dim_props(update("x"));
        }
        wait_for(&writer, |s| s.dim_props_sent == 1 && s.dim_props_duplicate == 2).await;

        sinks.send_dim_props(update("y"));
        wait_for(&writer, |s| s.dim_props_sent == 2).await;

        first.assert_async().await;
        second.assert_async().await;
        writer.shutdown().await;
    }

    #[tokio::test]
    async fn test_closed_channel_counts_drops() {
        let server = mockito::Server::new_async().await;
        let mut conf = config(&server.url());
        conf.datapoint_max_batch_size = 2;
        conf.datapoint_max_requests = 1;

        // Cancelled workers close the channels
        let cancel = CancellationToken::new();
        cancel.cancel();
        let writer = Writer::start(conf, cancel).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let sinks = writer.sinks();
        let accepted = (0..5)
            .filter(|i| sinks.send_datapoint(Datapoint::gauge("a", *i as i64)))
            .count();
        assert_eq!(accepted, 0);
        assert_eq!(writer.snapshot().dps_dropped, 5);
    }

    /// Ingest that answers every request after `delay`, keeping the bodies
    async fn slow_ingest(delay: Duration) -> (String, Arc<Mutex<Vec<Vec<u8>>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let bodies = Arc::new(Mutex::new(Vec::new()));
        let seen = bodies.clone();
        tokio::spawn(async move {
            while let Ok((mut conn, _)) = listener.accept().await {
                let seen = seen.clone();
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 4096];
                    loop {
                        let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
                            match conn.read(&mut chunk).await {
                                Ok(0) | Err(_) => return,
                                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                            }
                            continue;
                        };
                        let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
                        let len = head
                            .lines()
                            .find_map(|l| l.strip_prefix("content-length:"))
                            .and_then(|v| v.trim().parse::<usize>().ok())
                            .unwrap_or(0);
                        while buf.len() < end + 4 + len {
                            match conn.read(&mut chunk).await {
                                Ok(0) | Err(_) => return,
                                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                            }
                        }
                        let rest = buf.split_off(end + 4 + len);
                        seen.lock().unwrap().push(buf[end + 4..].to_vec());
                        buf = rest;

                        tokio::time::sleep(delay).await;
                        let reply = b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n";
                        if conn.write_all(reply).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        (url, bodies)
    }

    #[tokio::test]
    async fn test_full_channel_drops_under_slow_ingest() {
        let (url, bodies) = slow_ingest(Duration::from_millis(400)).await;
        let mut conf = config(&url);
        conf.datapoint_max_batch_size = 2;
        conf.datapoint_max_requests = 1;

        let writer = Writer::start(conf, CancellationToken::new()).unwrap();
        let sinks = writer.sinks();
        assert!(sinks.send_datapoint(Datapoint::gauge("dp-0", 1i64)));
        wait_for(&writer, |s| s.dp_requests_active == 1).await;

        // The only request slot is busy, so the channel holds two and the rest drop
        let accepted = (1..=10)
            .filter(|i| sinks.send_datapoint(Datapoint::gauge(format!("dp-{i}"), 1i64)))
            .count();
        assert_eq!(accepted, 2);
        assert_eq!(writer.snapshot().dps_dropped, 8);

        let mut max_active = 0;
        for _ in 0..300 {
            let snap = writer.snapshot();
            max_active = max_active.max(snap.dp_requests_active);
            if snap.dps_sent == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let snap = writer.snapshot();
        assert_eq!(snap.dps_sent, 3);
        assert!(max_active <= 1, "{} datapoint requests were active at once", max_active);

        let mut metrics = Vec::new();
        for body in bodies.lock().unwrap().iter() {
            let json: serde_json::Value = serde_json::from_slice(body).unwrap();
            for dp in json["gauge"].as_array().unwrap() {
                metrics.push(dp["metric"].as_str().unwrap().to_string());
            }
        }
        metrics.sort();
        let before = metrics.len();
        metrics.dedup();
        assert_eq!(before, metrics.len(), "a datapoint was posted twice");
        assert_eq!(metrics, vec!["dp-0", "dp-1", "dp-2"]);
        writer.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_rejects_bad_config() {
        let mut conf = config("http://localhost:1");
        conf.access_token.clear();
        assert!(Writer::start(conf, CancellationToken::new()).is_err());

        let conf = config("not a url");
        assert!(Writer::start(conf, CancellationToken::new()).is_err());
    }

    #[tokio::test]
    async fn test_configure_swaps_settings() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/custom")
            .with_status(200)
            .create_async()
            .await;

        let writer = Writer::start(config("http://127.0.0.1:9"), CancellationToken::new()).unwrap();
        let mut conf = config(&server.url());
        conf.datapoint_endpoint_url = Some(format!("{}/custom", server.url()));
        writer.configure(conf).unwrap();

        writer.sinks().send_datapoint(Datapoint::gauge("a", 1i64));
        wait_for(&writer, |s| s.dps_sent == 1).await;
        mock.assert_async().await;
        writer.shutdown().await;
    }
}
