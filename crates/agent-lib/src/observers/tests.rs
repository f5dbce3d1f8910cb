//! Tests for endpoint discovery

#[cfg(test)]
mod host_tests {
    use crate::endpoint::{EndpointEvent, PortType};
    use crate::observers::host::{diff, scan};
    use crate::observers::parse_socket_table;
    use std::collections::BTreeMap;
    use std::net::IpAddr;

    const TCP: &str = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 12345 1 0000000000000000 100 0 0 10 0
   1: 0100007F:0CEA 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 23456 1 0000000000000000 100 0 0 10 0
   2: 0100007F:A2C4 0100007F:1F90 01 00000000:00000000 00:00000000 00000000  1000        0 34567 1 0000000000000000 20 4 30 10 -1
";

    const TCP6: &str = "  sl  local_address                         remote_address                        st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000000000000000000000000000:0050 00000000000000000000000000000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 45678 1 0000000000000000 100 0 0 10 0
";

    const UDP: &str = "   sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode ref pointer drops
  10: 00000000:0202 00000000:0000 07 00000000:00000000 00:00000000 00000000     0        0 56789 2 0000000000000000 0
";

    #[test]
    fn test_only_listening_tcp_sockets() {
        let sockets = parse_socket_table(TCP, PortType::Tcp);
        assert_eq!(sockets.len(), 2);
        assert_eq!(sockets[0].ip, "0.0.0.0".parse::<IpAddr>().unwrap());
        assert_eq!(sockets[0].port, 8080);
        assert_eq!(sockets[0].inode, 12345);
        assert_eq!(sockets[1].ip, "127.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(sockets[1].port, 3306);
    }

    #[test]
    fn test_ipv6_and_udp_tables() {
        let v6 = parse_socket_table(TCP6, PortType::Tcp);
        assert_eq!(v6[0].ip, "::".parse::<IpAddr>().unwrap());
        assert_eq!(v6[0].port, 80);

        let udp = parse_socket_table(UDP, PortType::Udp);
        assert_eq!(udp.len(), 1);
        assert_eq!(udp[0].port, 514);
        assert_eq!(udp[0].port_type, PortType::Udp);
    }

    #[cfg(unix)]
    #[test]
    fn test_scan_resolves_owning_process() {
        let dir = tempfile::tempdir().unwrap();
        let proc_dir = dir.path();
        std::fs::create_dir_all(proc_dir.join("net")).unwrap();
        std::fs::write(proc_dir.join("net/tcp"), TCP).unwrap();
        std::fs::create_dir_all(proc_dir.join("42/fd")).unwrap();
        std::fs::write(proc_dir.join("42/comm"), "java\n").unwrap();
        std::os::unix::fs::symlink("socket:[12345]", proc_dir.join("42/fd/7")).unwrap();
        std::os::unix::fs::symlink("/dev/null", proc_dir.join("42/fd/0")).unwrap();

        let found = scan(proc_dir, "host");
        // The 3306 socket has no owner in this tree
        assert_eq!(found.len(), 1);
        let ep = &found["127.0.0.1-8080-42"];
        assert_eq!(ep.host, "127.0.0.1");
        assert_eq!(ep.port, 8080);
        assert_eq!(ep.port_type, PortType::Tcp);
        assert_eq!(ep.name, "java");
        assert_eq!(ep.discovered_by, "host");
        assert_eq!(ep.dimensions["pid"], "42");
        assert_eq!(ep.dimensions["command"], "java");
    }

    #[test]
    fn test_diff_emits_removals_then_additions() {
        use crate::endpoint::Endpoint;

        let a = Endpoint::new("a", "a", "host");
        let b = Endpoint::new("b", "b", "host");
        let b2 = Endpoint::new("b", "b", "host").with_dimension("pid", "2");
        let c = Endpoint::new("c", "c", "host");

        let old: BTreeMap<_, _> = [("a".to_string(), a), ("b".to_string(), b)].into();
        let new: BTreeMap<_, _> = [("b".to_string(), b2.clone()), ("c".to_string(), c.clone())].into();

        assert_eq!(
            diff(&old, &new),
            vec![
                EndpointEvent::Removed("a".into()),
                EndpointEvent::Added(b2),
                EndpointEvent::Added(c),
            ]
        );
        assert!(diff(&new, &new).is_empty());
    }
}

#[cfg(test)]
mod registry_tests {
    use crate::endpoint::{Endpoint, EndpointEvent};
    use crate::observers::EndpointRegistry;

    #[test]
    fn test_add_existing_id_is_remove_then_add() {
        let registry = EndpointRegistry::new();
        let ep = Endpoint::new("e1", "svc", "host");
        assert_eq!(
            registry.apply("obs", EndpointEvent::Added(ep.clone())),
            vec![EndpointEvent::Added(ep.clone())]
        );

        let changed = ep.with_dimension("pid", "9");
        assert_eq!(
            registry.apply("obs", EndpointEvent::Added(changed.clone())),
            vec![EndpointEvent::Removed("e1".into()), EndpointEvent::Added(changed.clone())]
        );
        assert_eq!(registry.get("e1"), Some(changed));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_unknown_is_ignored() {
        let registry = EndpointRegistry::new();
        assert!(registry
            .apply("obs", EndpointEvent::Removed("nope".into()))
            .is_empty());
    }

    #[test]
    fn test_retire_only_removes_own_endpoints() {
        let registry = EndpointRegistry::new();
        registry.apply("a", EndpointEvent::Added(Endpoint::new("x", "x", "a")));
        registry.apply("a", EndpointEvent::Added(Endpoint::new("y", "y", "a")));
        registry.apply("b", EndpointEvent::Added(Endpoint::new("z", "z", "b")));
        assert_eq!(registry.count_for("a"), 2);

        let mut removed = registry.retire("a");
        removed.sort_by(|l, r| l.endpoint_id().cmp(r.endpoint_id()));
        assert_eq!(
            removed,
            vec![EndpointEvent::Removed("x".into()), EndpointEvent::Removed("y".into())]
        );
        let ids: Vec<String> = registry.list().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["z"]);
    }
}

#[cfg(test)]
mod manager_tests {
    use crate::config::{parse_config_text, Config};
    use crate::endpoint::{Endpoint, EndpointEvent};
    use crate::error::InstantiationError;
    use crate::observers::*;
    use crate::process::ProcessContext;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Emits one endpoint per configured poll interval value on start
    struct FakeObserver {
        id: String,
        journal: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl Observer for FakeObserver {
        async fn configure(&mut self, init: ObserverInit) -> Result<(), InstantiationError> {
            if let ObserverSettings::Host(s) = &init.config.settings {
                self.id = format!("ep-{}", s.poll_interval_seconds);
            }
            if self.fail {
                return Err(InstantiationError::observer("host", "boom"));
            }
            self.journal.lock().unwrap().push(format!("configure {}", self.id));
            Ok(())
        }

        fn start(&mut self, sink: EndpointSink) {
            sink.added(Endpoint::new(self.id.clone(), "svc", sink.observer()));
        }

        async fn shutdown(&mut self) {
            self.journal.lock().unwrap().push(format!("shutdown {}", self.id));
        }
    }

    struct Harness {
        manager: ObserverManager,
        events: mpsc::UnboundedReceiver<EndpointEvent>,
        journal: Arc<Mutex<Vec<String>>>,
    }

    fn harness(fail: bool) -> Harness {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let (tx, events) = mpsc::unbounded_channel();
        let j = journal.clone();
        let factory: ObserverFactory = Arc::new(move |_: &str| {
            Some(Box::new(FakeObserver {
                id: String::new(),
                journal: j.clone(),
                fail,
            }) as Box<dyn Observer>)
        });
        let manager = ObserverManagerBuilder::new(
            Arc::new(EndpointRegistry::new()),
            tx,
            Arc::new(ProcessContext::from_vars(Vec::<(String, String)>::new())),
        )
        .factory(factory)
        .build();
        Harness {
            manager,
            events,
            journal,
        }
    }

    async fn config(observers: &str) -> Config {
        let text = format!(
            "signalFxAccessToken: abc\nhostname: testhost\nobservers:\n{}",
            observers
        );
        let ctx = ProcessContext::from_vars(Vec::<(String, String)>::new());
        parse_config_text(&text, Path::new("/tmp"), &ctx).await.unwrap()
    }

    async fn next(events: &mut mpsc::UnboundedReceiver<EndpointEvent>) -> EndpointEvent {
        tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("no endpoint event")
            .expect("dispatcher closed")
    }

    #[tokio::test]
    async fn test_started_observer_feeds_registry_and_stream() {
        let mut h = harness(false);
        let conf = config("  - type: host\n    pollIntervalSeconds: 5\n").await;
        h.manager.configure(&conf.observers).await;

        match next(&mut h.events).await {
            EndpointEvent::Added(ep) => assert_eq!(ep.id, "ep-5"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(h.manager.registry().get("ep-5").is_some());

        let snap = h.manager.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].observer_type, "host");
        assert_eq!(snap[0].endpoints, 1);
    }

    #[tokio::test]
    async fn test_unchanged_config_keeps_observer() {
        let mut h = harness(false);
        let conf = config("  - type: host\n    pollIntervalSeconds: 5\n").await;
        h.manager.configure(&conf.observers).await;
        next(&mut h.events).await;
        h.manager.configure(&conf.observers).await;

        assert_eq!(*h.journal.lock().unwrap(), vec!["configure ep-5"]);
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_replaced_observer_endpoints_are_removed() {
        let mut h = harness(false);
        h.manager
            .configure(&config("  - type: host\n    pollIntervalSeconds: 5\n").await.observers)
            .await;
        next(&mut h.events).await;

        h.manager
            .configure(&config("  - type: host\n    pollIntervalSeconds: 6\n").await.observers)
            .await;
        let mut seen = vec![next(&mut h.events).await, next(&mut h.events).await];
        seen.sort_by(|a, b| a.endpoint_id().cmp(b.endpoint_id()));
        assert_eq!(seen[0], EndpointEvent::Removed("ep-5".into()));
        assert!(matches!(&seen[1], EndpointEvent::Added(ep) if ep.id == "ep-6"));

        assert_eq!(
            *h.journal.lock().unwrap(),
            vec!["configure ep-5", "configure ep-6", "shutdown ep-5"]
        );
    }

    #[tokio::test]
    async fn test_invalid_and_failed_observers_are_skipped() {
        let h = harness(true);
        let conf = config("  - type: host\n  - type: nope\n  - type: host\n    bogus: 1\n").await;
        h.manager.configure(&conf.observers).await;

        assert!(h.manager.snapshot().is_empty());
        // Only the valid entry reached configure, which failed
        assert_eq!(*h.journal.lock().unwrap(), vec!["shutdown ep-10"]);
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let mut h = harness(false);
        let conf = config("  - type: host\n").await;
        h.manager.configure(&conf.observers).await;
        assert!(matches!(next(&mut h.events).await, EndpointEvent::Added(ep) if ep.id == "ep-10"));
        h.manager.shutdown().await;

        assert_eq!(next(&mut h.events).await, EndpointEvent::Removed("ep-10".into()));
        assert!(h.manager.snapshot().is_empty());
        assert_eq!(
            *h.journal.lock().unwrap(),
            vec!["configure ep-10", "shutdown ep-10"]
        );
    }
}
