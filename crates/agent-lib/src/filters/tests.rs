//! Tests for datapoint and property filtering

#[cfg(test)]
mod string_filter_tests {
    use crate::filters::{StringFilter, StringMapFilter};
    use std::collections::HashMap;

    #[test]
    fn test_static_glob_and_regex() {
        let f = StringFilter::new(&["cpu.idle", "memory.*", "/^disk\\.(read|write)$/"]).unwrap();

        assert!(f.matches("cpu.idle"));
        assert!(f.matches("memory.used"));
        assert!(f.matches("disk.read"));
        assert!(!f.matches("disk.reads"));
        assert!(!f.matches("cpu.user"));
    }

    #[test]
    fn test_negated_static_matches_everything_else() {
        let f = StringFilter::new(&["!cpu.idle"]).unwrap();
        assert!(!f.matches("cpu.idle"));
        assert!(f.matches("cpu.user"));
    }

    #[test]
    fn test_glob_escapes_regex_metacharacters() {
        let f = StringFilter::new(&["a.b*"]).unwrap();
        assert!(f.matches("a.bc"));
        assert!(!f.matches("axbc"));
    }

    #[test]
    fn test_invalid_regex_is_config_error() {
        assert!(StringFilter::new(&["/(unclosed/"]).is_err());
    }

    #[test]
    fn test_map_filter_requires_all_keys() {
        let mut spec = HashMap::new();
        spec.insert("plugin".to_string(), vec!["cpu".to_string()]);
        spec.insert("host".to_string(), vec!["web-*".to_string()]);
        let f = StringMapFilter::new(&spec).unwrap();

        let mut dims = HashMap::new();
        dims.insert("plugin".to_string(), "cpu".to_string());
        assert!(!f.matches(&dims));

        dims.insert("host".to_string(), "web-1".to_string());
        assert!(f.matches(&dims));

        dims.insert("host".to_string(), "db-1".to_string());
        assert!(!f.matches(&dims));
    }
}

#[cfg(test)]
mod datapoint_filter_tests {
    use crate::filters::{DatapointFilter, FilterSet, MetricFilter, StringOrList};
    use crate::models::Datapoint;
    use std::collections::HashMap;

    fn by_name(name: &str) -> MetricFilter {
        MetricFilter {
            metric_name: Some(name.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_filter_rejected() {
        assert!(DatapointFilter::new(&MetricFilter::default()).is_err());
    }

    #[test]
    fn test_name_and_dimensions_both_required() {
        let mut dims = HashMap::new();
        dims.insert(
            "plugin".to_string(),
            StringOrList::Many(vec!["cpu".to_string(), "memory".to_string()]),
        );
        let filter = DatapointFilter::new(&MetricFilter {
            metric_names: vec!["*.utilization".to_string()],
            dimensions: dims,
            ..Default::default()
        })
        .unwrap();

        let dp = Datapoint::gauge("cpu.utilization", 1.0).with_dimension("plugin", "cpu");
        assert!(filter.matches(&dp));

        let dp = Datapoint::gauge("cpu.utilization", 1.0).with_dimension("plugin", "disk");
        assert!(!filter.matches(&dp));

        let dp = Datapoint::gauge("cpu.idle", 1.0).with_dimension("plugin", "cpu");
        assert!(!filter.matches(&dp));
    }

    #[test]
    fn test_negated_filter_inverts() {
        let filter = DatapointFilter::new(&MetricFilter {
            negated: true,
            ..by_name("cpu.*")
        })
        .unwrap();

        assert!(!filter.matches(&Datapoint::gauge("cpu.idle", 1.0)));
        assert!(filter.matches(&Datapoint::gauge("memory.used", 1.0)));
    }

    #[test]
    fn test_monitor_type_uses_meta() {
        let filter = DatapointFilter::new(&MetricFilter {
            monitor_type: Some("cpu".to_string()),
            ..Default::default()
        })
        .unwrap();

        let mut dp = Datapoint::gauge("anything", 1.0);
        assert!(!filter.matches(&dp));
        dp.meta.monitor_type = Some("cpu".to_string());
        assert!(filter.matches(&dp));
    }

    #[test]
    fn test_include_overrides_exclude() {
        let set = FilterSet::new(&[by_name("memory.*")], &[by_name("memory.used")]).unwrap();

        assert!(set.matches(&Datapoint::gauge("memory.free", 1.0)));
        assert!(!set.matches(&Datapoint::gauge("memory.used", 1.0)));
        assert!(!set.matches(&Datapoint::gauge("cpu.idle", 1.0)));
    }

    #[test]
    fn test_metric_filter_from_yaml() {
        let yaml = r#"
metricNames: [cpu.idle, "cpu.steal"]
dimensions:
  plugin: cpu
"#;
        let conf: MetricFilter = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(conf.metric_names.len(), 2);
        assert_eq!(
            conf.dimensions.get("plugin"),
            Some(&StringOrList::One("cpu".to_string()))
        );

        let bad = "metricNames: [a]\nbogus: 1\n";
        assert!(serde_yaml::from_str::<MetricFilter>(bad).is_err());
    }
}

#[cfg(test)]
mod dimprops_filter_tests {
    use crate::filters::{DimPropsFilter, PropertyFilterConfig};
    use crate::models::DimProperties;

    #[test]
    fn test_removes_matching_properties_only_on_matching_dimension() {
        let filter = DimPropsFilter::new(&[PropertyFilterConfig {
            property_name: "secret*".to_string(),
            dimension_name: "k8s_pod_uid".to_string(),
            ..Default::default()
        }])
        .unwrap();

        let update = DimProperties::new("k8s_pod_uid", "abc")
            .with_property("app", "x")
            .with_property("secret_key", "y");
        let out = filter.apply(update).unwrap();
        assert_eq!(out.properties.len(), 1);
        assert!(out.properties.contains_key("app"));

        let other = DimProperties::new("host", "h1").with_property("secret_key", "y");
        let out = filter.apply(other).unwrap();
        assert!(out.properties.contains_key("secret_key"));
    }

    #[test]
    fn test_update_with_nothing_left_is_dropped() {
        let filter = DimPropsFilter::new(&[PropertyFilterConfig::default()]).unwrap();
        let update = DimProperties::new("k", "v").with_property("a", "b");
        assert!(filter.apply(update).is_none());

        let tagged = DimProperties::new("k", "v")
            .with_property("a", "b")
            .with_tag("keep");
        let out = filter.apply(tagged).unwrap();
        assert!(out.properties.is_empty());
        assert_eq!(out.tags.len(), 1);
    }

    #[test]
    fn test_no_filters_passes_through() {
        let filter = DimPropsFilter::default();
        let update = DimProperties::new("k", "v").with_property("a", "b");
        assert_eq!(filter.apply(update.clone()), Some(update));
    }
}
