//! Tests for monitor lifecycle and output stamping

#[cfg(test)]
mod manager_tests {
    use crate::config::{parse_config_text, Config};
    use crate::endpoint::{Endpoint, PortType};
    use crate::error::InstantiationError;
    use crate::models::Datapoint;
    use crate::monitors::{Monitor, MonitorInit, MonitorManager, MonitorManagerBuilder, MonitorOutput};
    use crate::process::ProcessContext;
    use crate::writer::counters::WriterCounters;
    use crate::writer::sinks::{channel, SinkReceivers};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::path::Path;
    use std::sync::Arc;

    /// Lifecycle records shared between fakes and the test
    #[derive(Default)]
    struct Journal {
        events: Mutex<Vec<String>>,
        outputs: Mutex<Vec<MonitorOutput>>,
    }

    struct FakeMonitor {
        journal: Arc<Journal>,
        id: String,
        fail: bool,
    }

    #[async_trait]
    impl Monitor for FakeMonitor {
        async fn configure(&mut self, init: MonitorInit) -> Result<(), InstantiationError> {
            if self.fail {
                return Err(InstantiationError::monitor("cpu", "refused"));
            }
            self.id = init.monitor_id.clone();
            self.journal
                .events
                .lock()
                .push(format!("configure {}", init.monitor_id));
            self.journal.outputs.lock().push(init.output);
            Ok(())
        }

        async fn shutdown(&mut self) {
            self.journal.events.lock().push(format!("shutdown {}", self.id));
        }
    }

    fn manager(journal: Arc<Journal>, fail: bool) -> (MonitorManager, SinkReceivers) {
        let (sinks, receivers) = channel(100, 100, Arc::new(WriterCounters::default()));
        let ctx = Arc::new(ProcessContext::from_vars(Vec::<(String, String)>::new()));
        let manager = MonitorManagerBuilder::new(sinks, ctx)
            .factory(Arc::new(move |_: &str| {
                Some(Box::new(FakeMonitor {
                    journal: journal.clone(),
                    id: String::new(),
                    fail,
                }) as Box<dyn Monitor>)
            }))
            .build();
        (manager, receivers)
    }

    async fn config(monitors: &str) -> Config {
        let text = format!(
            "signalFxAccessToken: abc\nhostname: testhost\nmonitors:\n{}",
            monitors
        );
        let ctx = ProcessContext::from_vars(Vec::<(String, String)>::new());
        parse_config_text(&text, Path::new("."), &ctx).await.unwrap()
    }

    fn http_endpoint(id: &str, port: u16) -> Endpoint {
        Endpoint::new(id, "web", "host")
            .with_address("127.0.0.1", port, PortType::Tcp)
            .with_dimension("service", "web")
    }

    #[tokio::test]
    async fn test_static_monitor_starts_and_stamps_plugin() {
        let journal = Arc::new(Journal::default());
        let (manager, mut rx) = manager(journal.clone(), false);

        manager.configure(&config("  - type: cpu\n").await).await;

        let snap = manager.snapshot();
        assert_eq!(snap.active.len(), 1);
        assert_eq!(snap.active[0].monitor_type, "cpu");

        let output = journal.outputs.lock()[0].clone();
        assert!(output.send_datapoint(Datapoint::gauge("cpu.utilization", 1.0)));
        let dp = rx.datapoints.recv().await.unwrap();
        assert_eq!(dp.dimensions["plugin"], "cpu");
        // Only instance of a single-instance type
        assert!(!dp.dimensions.contains_key("monitorID"));
        assert_eq!(dp.meta.monitor_type.as_deref(), Some("cpu"));
    }

    #[tokio::test]
    async fn test_unchanged_config_keeps_instance() {
        let journal = Arc::new(Journal::default());
        let (manager, _rx) = manager(journal.clone(), false);
        let conf = config("  - type: cpu\n").await;

        manager.configure(&conf).await;
        let first = manager.snapshot().active[0].id.clone();
        manager.configure(&conf).await;

        assert_eq!(manager.snapshot().active[0].id, first);
        assert_eq!(journal.events.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_changed_config_starts_new_before_stopping_old() {
        let journal = Arc::new(Journal::default());
        let (manager, _rx) = manager(journal.clone(), false);

        manager.configure(&config("  - type: cpu\n").await).await;
        let old = manager.snapshot().active[0].id.clone();
        manager
            .configure(&config("  - type: cpu\n    intervalSeconds: 5\n").await)
            .await;
        let new = manager.snapshot().active[0].id.clone();

        assert_ne!(old, new);
        let events = journal.events.lock().clone();
        assert_eq!(
            events,
            vec![
                format!("configure {}", old),
                format!("configure {}", new),
                format!("shutdown {}", old),
            ]
        );
    }

    #[tokio::test]
    async fn test_second_instance_adds_monitor_id() {
        let journal = Arc::new(Journal::default());
        let (manager, mut rx) = manager(journal.clone(), false);

        manager
            .configure(&config("  - type: cpu\n  - type: cpu\n    intervalSeconds: 5\n").await)
            .await;
        assert_eq!(manager.snapshot().active.len(), 2);

        let output = journal.outputs.lock()[0].clone();
        output.send_datapoint(Datapoint::gauge("cpu.utilization", 1.0));
        let dp = rx.datapoints.recv().await.unwrap();
        assert_eq!(dp.dimensions["monitorID"], output.monitor_id());
    }

    #[tokio::test]
    async fn test_endpoint_binding_lifecycle() {
        let journal = Arc::new(Journal::default());
        let (manager, mut rx) = manager(journal.clone(), false);
        manager
            .configure(&config("  - type: http-check\n    discoveryRule: port == 8080\n").await)
            .await;
        assert!(manager.snapshot().active.is_empty());

        manager.endpoint_added(http_endpoint("a", 9090)).await;
        assert!(manager.snapshot().active.is_empty());

        manager.endpoint_added(http_endpoint("b", 8080)).await;
        manager.endpoint_added(http_endpoint("b", 8080)).await;
        let snap = manager.snapshot();
        assert_eq!(snap.active.len(), 1);
        assert_eq!(snap.active[0].endpoint_id.as_deref(), Some("b"));
        assert_eq!(snap.endpoints, 2);

        let output = journal.outputs.lock()[0].clone();
        output.send_datapoint(Datapoint::gauge("http.up", 1i64));
        let dp = rx.datapoints.recv().await.unwrap();
        assert_eq!(dp.dimensions["service"], "web");
        assert_eq!(dp.meta.endpoint_id.as_deref(), Some("b"));

        manager.endpoint_removed("missing").await;
        manager.endpoint_removed("b").await;
        assert!(manager.snapshot().active.is_empty());
        assert_eq!(journal.events.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_manager_runs_on_spawned_tasks() {
        let journal = Arc::new(Journal::default());
        let (manager, _rx) = manager(journal.clone(), false);
        let manager = Arc::new(manager);
        let conf = config("  - type: http-check\n    discoveryRule: port == 8080 && portType == \"tcp\"\n").await;

        let m = manager.clone();
        tokio::spawn(async move { m.configure(&conf).await }).await.unwrap();
        let m = manager.clone();
        tokio::spawn(async move { m.endpoint_added(http_endpoint("b", 8080)).await })
            .await
            .unwrap();
        assert_eq!(manager.snapshot().active.len(), 1);

        let m = manager.clone();
        tokio::spawn(async move { m.shutdown().await }).await.unwrap();
        assert!(manager.snapshot().active.is_empty());
    }

    #[tokio::test]
    async fn test_config_applies_to_known_endpoints() {
        let journal = Arc::new(Journal::default());
        let (manager, _rx) = manager(journal, false);

        manager.configure(&config("  - type: cpu\n").await).await;
        manager.endpoint_added(http_endpoint("b", 8080)).await;
        manager
            .configure(&config("  - type: http-check\n    discoveryRule: port == 8080\n").await)
            .await;

        let snap = manager.snapshot();
        assert_eq!(snap.active.len(), 1);
        assert_eq!(snap.active[0].monitor_type, "http-check");
    }

    #[tokio::test]
    async fn test_invalid_and_duplicate_configs_are_reported() {
        let journal = Arc::new(Journal::default());
        let (manager, _rx) = manager(journal, false);

        manager
            .configure(&config("  - type: nope\n  - type: cpu\n  - type: cpu\n").await)
            .await;

        let snap = manager.snapshot();
        assert_eq!(snap.active.len(), 1);
        assert_eq!(snap.bad_configs.len(), 2);
        assert_eq!(snap.bad_configs[0].monitor_type, "nope");
        assert!(snap.bad_configs[0].line.is_some());
        assert!(snap.bad_configs[1].error.contains("duplicate"));
    }

    #[tokio::test]
    async fn test_solo_disables_others() {
        let journal = Arc::new(Journal::default());
        let (manager, _rx) = manager(journal, false);

        manager
            .configure(&config("  - type: cpu\n  - type: memory\n    solo: true\n").await)
            .await;

        let snap = manager.snapshot();
        assert_eq!(snap.active.len(), 1);
        assert_eq!(snap.active[0].monitor_type, "memory");
    }

    #[tokio::test]
    async fn test_failed_configure_is_not_active() {
        let journal = Arc::new(Journal::default());
        let (manager, _rx) = manager(journal.clone(), true);

        manager.configure(&config("  - type: cpu\n").await).await;

        assert!(manager.snapshot().active.is_empty());
        assert_eq!(journal.events.lock().as_slice(), ["shutdown ".to_string()]);
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let journal = Arc::new(Journal::default());
        let (manager, _rx) = manager(journal.clone(), false);
        manager
            .configure(&config("  - type: cpu\n  - type: memory\n").await)
            .await;

        manager.shutdown().await;

        assert!(manager.snapshot().active.is_empty());
        let stops = journal
            .events
            .lock()
            .iter()
            .filter(|e| e.starts_with("shutdown"))
            .count();
        assert_eq!(stops, 2);
    }
}

#[cfg(test)]
mod output_tests {
    use crate::endpoint::{Endpoint, PortType};
    use crate::models::{Datapoint, TraceSpan, NOT_HOST_SPECIFIC_TAG};
    use crate::monitors::filter::MonitorFilter;
    use crate::monitors::output::{MonitorOutput, OutputParams};
    use crate::monitors::lookup_metadata;
    use crate::writer::counters::WriterCounters;
    use crate::writer::sinks::{channel, SinkReceivers};
    use std::collections::HashMap;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn output(
        endpoint: Option<Endpoint>,
        extra: &[(&str, &str)],
        builtin: bool,
    ) -> (MonitorOutput, SinkReceivers) {
        let (sinks, rx) = channel(10, 10, Arc::new(WriterCounters::default()));
        let meta = lookup_metadata("http-check").unwrap();
        let out = MonitorOutput::new(OutputParams {
            sinks,
            monitor_type: "http-check".into(),
            monitor_id: "http-check-1".into(),
            config_hash: "abc".into(),
            endpoint,
            disable_endpoint_dimensions: false,
            extra_dimensions: extra
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
            not_host_specific: true,
            include_monitor_id: Arc::new(AtomicBool::new(true)),
            filter: MonitorFilter::new(meta, builtin, &[], &[]).unwrap(),
        });
        (out, rx)
    }

    #[tokio::test]
    async fn test_stamping_order() {
        let ep = Endpoint::new("e1", "web", "host")
            .with_address("10.0.0.1", 80, PortType::Tcp)
            .with_dimension("env", "endpoint");
        let (out, mut rx) = output(Some(ep), &[("env", "extra")], false);

        let dp = Datapoint::gauge("http.up", 1i64)
            .with_dimension("plugin", "custom")
            .with_dimension("monitorID", "spoofed");
        assert!(out.send_datapoint(dp));

        let got = rx.datapoints.recv().await.unwrap();
        assert_eq!(got.dimensions["plugin"], "custom");
        assert_eq!(got.dimensions["env"], "extra");
        assert_eq!(got.dimensions["monitorID"], "http-check-1");
        assert!(got.meta.not_host_specific);
    }

    #[tokio::test]
    async fn test_builtin_filter_drops_unknown_metrics() {
        let (out, mut rx) = output(None, &[], true);
        assert!(!out.send_datapoint(Datapoint::gauge("http.bogus", 1i64)));
        assert!(out.send_datapoint(Datapoint::gauge("http.up", 1i64)));
        assert_eq!(rx.datapoints.recv().await.unwrap().metric, "http.up");
    }

    #[tokio::test]
    async fn test_extra_dimensions_can_change_at_runtime() {
        let (out, mut rx) = output(None, &[], false);
        out.add_extra_dimension("zone", "a");
        out.send_datapoint(Datapoint::gauge("http.up", 1i64));
        out.remove_extra_dimension("zone");
        out.send_datapoint(Datapoint::gauge("http.up", 1i64));

        assert_eq!(rx.datapoints.recv().await.unwrap().dimensions["zone"], "a");
        assert!(!rx.datapoints.recv().await.unwrap().dimensions.contains_key("zone"));
    }

    #[tokio::test]
    async fn test_span_gets_not_host_specific_tag() {
        let (out, mut rx) = output(None, &[], false);
        out.send_span(TraceSpan::default());
        let span = rx.spans.recv().await.unwrap();
        assert_eq!(span.tags[NOT_HOST_SPECIFIC_TAG], "true");
    }
}
