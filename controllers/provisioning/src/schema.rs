//! JSON Schema checks for ProvisioningRequest template parameters.

use crate::error::ControllerError;
use jsonschema::JSONSchema;
use serde_json::Value;

/// Key of the ClusterInstance parameters in `templateParameters` and its schema
pub const CLUSTER_INSTANCE_PARAMETERS: &str = "clusterInstanceParameters";
/// Key of the policy template parameters in `templateParameters` and its schema
pub const POLICY_TEMPLATE_PARAMETERS: &str = "policyTemplateParameters";

/// Adds `additionalProperties: false` to every object schema that declares
/// `properties` (unless it already sets `additionalProperties`), recursing
/// through `properties` and `items`.
pub fn disallow_unknown_fields(schema: &mut Value) {
    let Some(object) = schema.as_object_mut() else {
        return;
    };

    if object.contains_key("properties") {
        object
            .entry("additionalProperties")
            .or_insert(Value::Bool(false));
        if let Some(properties) = object.get_mut("properties").and_then(Value::as_object_mut) {
            properties.values_mut().for_each(disallow_unknown_fields);
        }
    }

    if let Some(items) = object.get_mut("items") {
        disallow_unknown_fields(items);
    }
}

/// Schema under `properties.<key>`
pub fn sub_schema(schema: &Value, key: &str) -> Result<Value, ControllerError> {
    schema
        .get("properties")
        .and_then(|p| p.get(key))
        .filter(|s| s.is_object())
        .cloned()
        .ok_or_else(|| ControllerError::input(format!("failed to extract {} subschema: subSchema '{}' does not exist", key, key)))
}

/// The schema with the two parameter sub-schemas reduced to their type checks,
/// so the top-level parameters can be checked on their own
pub fn top_level_schema(schema: &Value, template: &str) -> Result<Value, ControllerError> {
    let mut schema = schema.clone();
    let properties = schema
        .get_mut("properties")
        .and_then(Value::as_object_mut)
        .ok_or_else(|| {
            ControllerError::input(format!(
                "missing keyword 'properties' in the schema from ClusterTemplate ({})",
                template
            ))
        })?;
    for key in [CLUSTER_INSTANCE_PARAMETERS, POLICY_TEMPLATE_PARAMETERS] {
        let sub = properties.get_mut(key).and_then(Value::as_object_mut).ok_or_else(|| {
            ControllerError::input(format!(
                "missing required property '{}' in the schema from ClusterTemplate ({})",
                key, template
            ))
        })?;
        sub.remove("properties");
    }
    Ok(schema)
}

/// Validates `input` against `schema`. Every violation is reported, joined
/// with "; " after an `invalid input: ` prefix.
pub fn validate(schema: &Value, input: &Value) -> Result<(), ControllerError> {
    let compiled = JSONSchema::options()
        .compile(schema)
        .map_err(|e| ControllerError::input(format!("failed when validating the input against the schema: {}", e)))?;

    let Err(errors) = compiled.validate(input) else {
        return Ok(());
    };
    let issues: Vec<String> = errors
        .map(|error| format!("{}: {}", field_path(&error.instance_path.to_string()), error))
        .collect();
    if issues.is_empty() {
        return Ok(());
    }
    Err(ControllerError::input(format!("invalid input: {}", issues.join("; "))))
}

/// JSON pointer to dotted field path, `(root)` for the document itself
fn field_path(pointer: &str) -> String {
    let path = pointer.trim_start_matches('/').replace('/', ".");
    if path.is_empty() {
        "(root)".to_string()
    } else {
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "nodeClusterName": {"type": "string"},
                "oCloudSiteId": {"type": "string"},
                "clusterInstanceParameters": {
                    "type": "object",
                    "properties": {
                        "clusterName": {"type": "string"},
                        "nodes": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {"hostName": {"type": "string"}}
                            }
                        }
                    }
                },
                "policyTemplateParameters": {
                    "type": "object",
                    "properties": {"sriov-network-vlan-1": {"type": "string"}}
                }
            },
            "required": ["nodeClusterName", "oCloudSiteId", "clusterInstanceParameters"]
        })
    }

    #[test]
    fn test_disallow_unknown_fields() {
        let mut ci = sub_schema(&schema(), CLUSTER_INSTANCE_PARAMETERS).unwrap();
        disallow_unknown_fields(&mut ci);
        assert_eq!(ci["additionalProperties"], json!(false));
        assert_eq!(ci["properties"]["nodes"]["items"]["additionalProperties"], json!(false));
        // Leaves without properties are untouched
        assert!(ci["properties"]["clusterName"].get("additionalProperties").is_none());

        let mut explicit = json!({"properties": {}, "additionalProperties": true});
        disallow_unknown_fields(&mut explicit);
        assert_eq!(explicit["additionalProperties"], json!(true));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let mut ci = sub_schema(&schema(), CLUSTER_INSTANCE_PARAMETERS).unwrap();
        disallow_unknown_fields(&mut ci);
        assert!(validate(&ci, &json!({"clusterName": "c1", "nodes": [{"hostName": "n1"}]})).is_ok());

        let err = validate(&ci, &json!({"clusterName": "c1", "nodes": [{"hostName": "n1", "bogus": 1}]})).unwrap_err();
        assert!(err.is_input_error());
        assert!(err.to_string().starts_with("invalid input: nodes.0: "));
    }

    #[test]
    fn test_all_violations_joined() {
        let top = top_level_schema(&schema(), "sno.v1").unwrap();
        let err = validate(&top, &json!({"nodeClusterName": 1, "clusterInstanceParameters": {"anything": true}})).unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("invalid input: "));
        assert_eq!(message.matches("; ").count(), 1, "{}", message);
        assert!(message.contains("nodeClusterName"));
        assert!(message.contains("oCloudSiteId"));
    }

    #[test]
    fn test_missing_sub_schema() {
        let err = sub_schema(&json!({"properties": {}}), POLICY_TEMPLATE_PARAMETERS).unwrap_err();
        assert!(err.is_input_error());
        let err = top_level_schema(&json!({"type": "object"}), "sno.v1").unwrap_err();
        assert_eq!(err.to_string(), "missing keyword 'properties' in the schema from ClusterTemplate (sno.v1)");
    }
}
