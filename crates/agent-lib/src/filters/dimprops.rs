//! Property filtering for dimension-property updates

use super::StringFilter;
use crate::error::ConfigError;
use crate::models::DimProperties;
use serde::{Deserialize, Serialize};

fn default_match_all() -> String {
    "*".to_string()
}

/// One entry of `writer.propertiesToExclude`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PropertyFilterConfig {
    #[serde(default = "default_match_all")]
    pub property_name: String,
    #[serde(default = "default_match_all")]
    pub property_value: String,
    #[serde(default = "default_match_all")]
    pub dimension_name: String,
    #[serde(default = "default_match_all")]
    pub dimension_value: String,
}

impl Default for PropertyFilterConfig {
    fn default() -> Self {
        Self {
            property_name: default_match_all(),
            property_value: default_match_all(),
            dimension_name: default_match_all(),
            dimension_value: default_match_all(),
        }
    }
}

#[derive(Debug, Clone)]
struct PropertyFilter {
    property_name: StringFilter,
    property_value: StringFilter,
    dimension_name: StringFilter,
    dimension_value: StringFilter,
}

impl PropertyFilter {
    fn new(conf: &PropertyFilterConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            property_name: StringFilter::new(&[&conf.property_name])?,
            property_value: StringFilter::new(&[&conf.property_value])?,
            dimension_name: StringFilter::new(&[&conf.dimension_name])?,
            dimension_value: StringFilter::new(&[&conf.dimension_value])?,
        })
    }

    fn matches_dimension(&self, name: &str, value: &str) -> bool {
        self.dimension_name.matches(name) && self.dimension_value.matches(value)
    }

    fn matches_property(&self, name: &str, value: &str) -> bool {
        self.property_name.matches(name) && self.property_value.matches(value)
    }
}

/// Removes unwanted properties from dimension updates
#[derive(Debug, Clone, Default)]
pub struct DimPropsFilter {
    filters: Vec<PropertyFilter>,
}

impl DimPropsFilter {
    pub fn new(confs: &[PropertyFilterConfig]) -> Result<Self, ConfigError> {
        Ok(Self {
            filters: confs
                .iter()
                .map(PropertyFilter::new)
                .collect::<Result<_, _>>()?,
        })
    }

    /// Returns the filtered update, or `None` if nothing is left to send
    pub fn apply(&self, mut update: DimProperties) -> Option<DimProperties> {
        if !self.filters.is_empty() {
            let dim = &update.dimension;
            let active: Vec<&PropertyFilter> = self
                .filters
                .iter()
                .filter(|f| f.matches_dimension(&dim.name, &dim.value))
                .collect();

            if !active.is_empty() {
                update
                    .properties
                    .retain(|k, v| !active.iter().any(|f| f.matches_property(k, v)));
            }
        }

        if update.properties.is_empty() && update.tags.is_empty() {
            None
        } else {
            Some(update)
        }
    }
}
