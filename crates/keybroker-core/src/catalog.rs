//! Service catalog served on `GET /v2/catalog`.
//!
//! The catalog is static configuration: it is read from the `[catalog]`
//! table of the broker config and echoed back as JSON without
//! interpretation. Field names follow the broker protocol, so the TOML keys
//! and the JSON keys are identical.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Catalog {
    #[serde(default)]
    pub services: Vec<ServiceOffering>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceOffering {
    pub id: String,
    pub name: String,
    pub description: String,
    pub bindable: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: ServiceMetadata,
    pub plans: Vec<ServicePlan>,
}

/// Display metadata for a service offering.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub documentation_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub long_description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub support_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServicePlan {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub metadata: PlanMetadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlanMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub costs: Vec<PlanCost>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanCost {
    pub unit: String,
    /// Currency code → amount, e.g. `usd = 0.0`.
    pub amount: BTreeMap<String, f64>,
}

impl Catalog {
    /// Structural problems that would make the catalog unusable to a platform.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for service in &self.services {
            if service.id.is_empty() {
                problems.push(format!("service '{}' has an empty id", service.name));
            }
            if service.plans.is_empty() {
                problems.push(format!("service '{}' has no plans", service.name));
            }
            for plan in &service.plans {
                if plan.id.is_empty() {
                    problems.push(format!(
                        "plan '{}' of service '{}' has an empty id",
                        plan.name, service.name
                    ));
                }
            }
        }
        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG_TOML: &str = r#"
[[services]]
id = "service-id"
name = "keyspace"
description = "Multi-tenant keyspaces"
bindable = true
tags = ["nosql", "keyspace"]

[services.metadata]
displayName = "Keyspace"
documentationUrl = "http://example.com"
imageUrl = "http://example.com/logo.png"
longDescription = "A dedicated keyspace on a shared cluster"
providerDisplayName = "Example"
supportUrl = "http://example.com/support"

[[services.plans]]
id = "plan-id"
name = "free"
description = "plan desc"

[services.plans.metadata]
displayName = "keyspace"

[[services.plans.metadata.costs]]
unit = "MONTHLY"
amount = { usd = 0.0, eur = 0.0 }
"#;

    #[test]
    fn parses_full_catalog() {
        let catalog: Catalog = toml::from_str(CATALOG_TOML).unwrap();
        assert_eq!(catalog.services.len(), 1);

        let service = &catalog.services[0];
        assert_eq!(service.id, "service-id");
        assert!(service.bindable);
        assert_eq!(service.tags, vec!["nosql", "keyspace"]);
        assert_eq!(service.metadata.display_name.as_deref(), Some("Keyspace"));
        assert_eq!(
            service.metadata.image_url.as_deref(),
            Some("http://example.com/logo.png")
        );

        let plan = &service.plans[0];
        assert_eq!(plan.id, "plan-id");
        assert_eq!(plan.metadata.display_name.as_deref(), Some("keyspace"));
        assert_eq!(plan.metadata.costs[0].unit, "MONTHLY");
        assert_eq!(plan.metadata.costs[0].amount["usd"], 0.0);
        assert!(catalog.problems().is_empty());
    }

    #[test]
    fn renders_protocol_field_names() {
        let catalog: Catalog = toml::from_str(CATALOG_TOML).unwrap();
        let json = serde_json::to_value(&catalog).unwrap();
        let service = &json["services"][0];
        assert_eq!(service["metadata"]["displayName"], "Keyspace");
        assert_eq!(service["metadata"]["providerDisplayName"], "Example");
        assert_eq!(service["plans"][0]["metadata"]["costs"][0]["amount"]["eur"], 0.0);
    }

    #[test]
    fn absent_metadata_is_not_rendered() {
        let catalog: Catalog = toml::from_str(
            r#"
[[services]]
id = "s"
name = "bare"
description = "no metadata"
bindable = false

[[services.plans]]
id = "p"
name = "p"
description = "p"
"#,
        )
        .unwrap();
        let json = serde_json::to_value(&catalog).unwrap();
        assert_eq!(json["services"][0]["metadata"], serde_json::json!({}));
        assert_eq!(json["services"][0]["tags"], serde_json::json!([]));
    }

    #[test]
    fn reports_service_without_plans() {
        let catalog = Catalog {
            services: vec![ServiceOffering {
                id: "s".to_string(),
                name: "empty".to_string(),
                description: String::new(),
                bindable: true,
                tags: Vec::new(),
                metadata: ServiceMetadata::default(),
                plans: Vec::new(),
            }],
        };
        assert_eq!(catalog.problems(), vec!["service 'empty' has no plans"]);
    }
}
