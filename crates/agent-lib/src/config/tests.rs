//! Tests for config parsing and loading

#[cfg(test)]
mod parse_tests {
    use crate::config::{parse_config_text, Config, LogFormat};
    use crate::error::ConfigError;
    use crate::process::ProcessContext;
    use std::path::Path;
    use std::time::Duration;

    fn ctx(vars: &[(&str, &str)]) -> ProcessContext {
        ProcessContext::from_vars(vars.iter().map(|(k, v)| (k.to_string(), v.to_string())))
    }

    async fn parse(text: &str) -> Result<Config, ConfigError> {
        parse_config_text(text, Path::new("."), &ctx(&[])).await
    }

    #[tokio::test]
    async fn test_defaults() {
        let conf = parse("signalFxAccessToken: abc\nhostname: testhost\n").await.unwrap();

        assert_eq!(conf.ingest_url, "https://ingest.signalfx.com");
        assert_eq!(conf.api_url, "https://api.signalfx.com");
        assert_eq!(conf.interval_seconds, 10);
        assert!(conf.enable_builtin_filtering);
        assert_eq!(
            conf.diagnostics_socket_path,
            Path::new("/var/run/signalfx-agent/diagnostics.sock")
        );
        assert_eq!(conf.logging.format, LogFormat::Text);
        assert_eq!((conf.profiling_host.as_str(), conf.profiling_port), ("127.0.0.1", 6060));

        let w = &conf.writer;
        assert_eq!(w.access_token, "abc");
        assert_eq!(w.ingest_url, conf.ingest_url);
        assert_eq!(w.host_id_dimensions["host"], "testhost");
        assert_eq!(w.datapoint_max_batch_size, 1000);
        assert_eq!(w.event_send_interval, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_access_token_required() {
        let err = parse("hostname: testhost\n").await.unwrap_err();
        assert!(matches!(err, ConfigError::Validation { .. }));
        assert!(err.to_string().contains("signalFxAccessToken"));
    }

    #[tokio::test]
    async fn test_env_token_override_and_substitution() {
        let ctx = ctx(&[("SFX_ACCESS_TOKEN", "from-env"), ("REGION", "us-west")]);
        let text = "signalFxAccessToken: abc\nhostname: h\nglobalDimensions:\n  region: ${REGION}\n";
        let conf = parse_config_text(text, Path::new("."), &ctx).await.unwrap();

        assert_eq!(conf.access_token, "from-env");
        assert_eq!(conf.writer.access_token, "from-env");
        assert_eq!(conf.global_dimensions["region"], "us-west");
    }

    #[tokio::test]
    async fn test_writer_subtree_wins_over_top_level() {
        let text = r#"signalFxAccessToken: abc
hostname: h
ingestUrl: https://top.example.com
globalDimensions:
  env: prod
  team: a
writer:
  ingestUrl: https://writer.example.com
  globalDimensions:
    team: b
  maxRequests: 3
"#;
        let conf = parse(text).await.unwrap();
        let w = &conf.writer;
        assert_eq!(w.ingest_url, "https://writer.example.com");
        assert_eq!(w.api_url, "https://api.signalfx.com");
        assert_eq!(w.global_dimensions.len(), 1);
        assert_eq!(w.global_dimensions["team"], "b");
        assert_eq!(w.datapoint_max_requests, 3);
    }

    #[tokio::test]
    async fn test_top_level_global_dimensions_reach_writer() {
        let text = "signalFxAccessToken: abc\nhostname: h\nglobalDimensions:\n  env: prod\n";
        let conf = parse(text).await.unwrap();
        assert_eq!(conf.writer.global_dimensions["env"], "prod");
    }

    #[tokio::test]
    async fn test_config_sources_key_is_known() {
        assert!(parse("signalFxAccessToken: abc\nhostname: h\nconfigSources: {}\n").await.is_ok());

        let err = parse("signalFxAccessToken: abc\nhostname: h\nconfigSources:\n  bogus: 1\n")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("configSources"));
    }

    #[tokio::test]
    async fn test_disable_host_dimensions() {
        let conf = parse("signalFxAccessToken: abc\nhostname: h\ndisableHostDimensions: true\n")
            .await
            .unwrap();
        assert!(conf.writer.host_id_dimensions.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_values_fail_the_load() {
        for text in [
            "signalFxAccessToken: abc\nintervalSeconds: 0\n",
            "signalFxAccessToken: abc\ningestUrl: 'not a url'\n",
            "signalFxAccessToken: abc\nwriter:\n  datapointMaxBatchSize: 0\n",
            "signalFxAccessToken: abc\nwriter:\n  bogusKey: 1\n",
        ] {
            assert!(parse(text).await.is_err(), "accepted: {text}");
        }
    }

    #[tokio::test]
    async fn test_yaml_syntax_error_has_line() {
        let err = parse("signalFxAccessToken: abc\nmonitors:\n  - type: cpu\n   bad: [\n")
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.line().is_some());
    }

    #[tokio::test]
    async fn test_bad_monitor_entries_cite_their_line() {
        let text = r#"signalFxAccessToken: abc
hostname: h
monitors:
  - type: cpu
  - type: nope
  - type: memory
    discoveryRule: port == 80
  - type: http-check
    discoveryRule: 'port =='
"#;
        let conf = parse(text).await.unwrap();
        assert_eq!(conf.monitors.len(), 4);
        assert!(conf.monitors[0].is_valid());

        let unknown = conf.monitors[1].validation_error.as_ref().unwrap();
        assert_eq!(unknown.line(), Some(5));
        assert!(unknown.to_string().contains("unknown monitor type"));

        let rule_on_static = conf.monitors[2].validation_error.as_ref().unwrap();
        assert!(rule_on_static.to_string().contains("does not accept discovery rules"));

        assert_eq!(conf.monitors[3].validation_error.as_ref().unwrap().line(), Some(8));
    }

    #[tokio::test]
    async fn test_monitor_common_keys() {
        let text = r#"signalFxAccessToken: abc
hostname: h
intervalSeconds: 20
monitors:
  - type: cpu
  - type: http-check
    discoveryRule: port == 8080
    intervalSeconds: 5
    extraDimensions:
      team: web
    path: /health
"#;
        let conf = parse(text).await.unwrap();
        let cpu = &conf.monitors[0];
        assert!(cpu.is_static());
        assert_eq!(cpu.interval, Duration::from_secs(20));

        let http = &conf.monitors[1];
        assert!(!http.is_static());
        assert_eq!(http.interval, Duration::from_secs(5));
        assert_eq!(http.extra_dimensions["team"], "web");
        assert_ne!(cpu.hash, http.hash);
    }

    #[tokio::test]
    async fn test_display_yaml_masks_token() {
        let conf = parse("signalFxAccessToken: supersecret\nhostname: h\nwriter:\n  accessToken: other\n")
            .await
            .unwrap();
        assert!(!conf.display_yaml.contains("supersecret"));
        assert!(!conf.display_yaml.contains("other"));
        assert!(conf.display_yaml.contains("signalFxAccessToken"));
    }

    #[tokio::test]
    async fn test_content_hash_tracks_content() {
        let a = parse("signalFxAccessToken: abc\nhostname: h\n").await.unwrap();
        let b = parse("hostname: h\nsignalFxAccessToken: abc\n").await.unwrap();
        let c = parse("signalFxAccessToken: abc\nhostname: other\n").await.unwrap();
        assert_eq!(a.content_hash, b.content_hash);
        assert_ne!(a.content_hash, c.content_hash);
    }
}

#[cfg(test)]
mod loader_tests {
    use crate::config::load;
    use crate::process::ProcessContext;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> ProcessContext {
        ProcessContext::from_vars(Vec::<(String, String)>::new())
    }

    #[tokio::test]
    async fn test_first_load_without_watching() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.yaml");
        std::fs::write(&path, "signalFxAccessToken: abc\nhostname: h\n").unwrap();

        let mut stream = load(&path, ctx(), Duration::ZERO, CancellationToken::new())
            .await
            .unwrap();
        assert!(!stream.is_watching());
        assert_eq!(stream.recv().await.unwrap().hostname, "h");
    }

    #[tokio::test]
    async fn test_first_load_errors_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.yaml");
        std::fs::write(&path, "hostname: h\n").unwrap();
        assert!(load(&path, ctx(), Duration::ZERO, CancellationToken::new())
            .await
            .is_err());

        let missing = dir.path().join("missing.yaml");
        assert!(load(&missing, ctx(), Duration::ZERO, CancellationToken::new())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_watch_skips_bad_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.yaml");
        std::fs::write(&path, "signalFxAccessToken: abc\nhostname: one\n").unwrap();

        let cancel = CancellationToken::new();
        let mut stream = load(&path, ctx(), Duration::from_millis(50), cancel.clone())
            .await
            .unwrap();
        assert!(stream.is_watching());
        assert_eq!(stream.recv().await.unwrap().hostname, "one");

        // A broken file keeps the previous config; the next good one is emitted
        std::fs::write(&path, "hostname: [\n").unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        std::fs::write(&path, "signalFxAccessToken: abc\nhostname: two\n").unwrap();

        let next = tokio::time::timeout(Duration::from_secs(5), stream.recv())
            .await
            .expect("no reload")
            .unwrap();
        assert_eq!(next.hostname, "two");
        cancel.cancel();
    }
}
