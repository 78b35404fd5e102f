use k8s_openapi::api::core::v1::Node;
use thiserror::Error;

/// Node annotation holding the relative weight of its endpoints (1..=127)
pub const NODE_WEIGHT_ANNOTATION: &str = "ingress.kubernetes.io/node-weight";

/// Service annotation: "true" routes to the cluster IP instead of the endpoints
pub const SERVICE_UPSTREAM_ANNOTATION: &str = "ingress.kubernetes.io/service-upstream";

/// Ingress annotation naming the Secret with basic authentication users
pub const AUTH_SECRET_ANNOTATION: &str = "ingress.kubernetes.io/auth-secret";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AnnotationError {
    #[error("ingress rule without annotations")]
    MissingAnnotations,

    #[error("invalid annotation name")]
    InvalidName,

    #[error("annotation {0} not found")]
    Missing(String),

    #[error("the annotation {name} does not contain a valid value ({value})")]
    InvalidContent { name: String, value: String },
}

/// Integer value of a node annotation
pub fn node_int_annotation(node: &Node, name: &str) -> Result<i32, AnnotationError> {
    let annotations = match node.metadata.annotations.as_ref() {
        Some(annotations) if !annotations.is_empty() => annotations,
        _ => return Err(AnnotationError::MissingAnnotations),
    };
    if name.is_empty() {
        return Err(AnnotationError::InvalidName);
    }
    let value = annotations
        .get(name)
        .ok_or_else(|| AnnotationError::Missing(name.to_string()))?;
    value
        .trim()
        .parse::<i32>()
        .map_err(|_| AnnotationError::InvalidContent {
            name: name.to_string(),
            value: value.clone(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn node(annotations: &[(&str, &str)]) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some("node-a".to_string()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect::<BTreeMap<_, _>>(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_reads_integer() {
        let n = node(&[(NODE_WEIGHT_ANNOTATION, "80")]);
        assert_eq!(node_int_annotation(&n, NODE_WEIGHT_ANNOTATION), Ok(80));
    }

    #[test]
    fn test_distinguishes_failures() {
        assert_eq!(
            node_int_annotation(&Node::default(), NODE_WEIGHT_ANNOTATION),
            Err(AnnotationError::MissingAnnotations)
        );

        let n = node(&[("other", "1")]);
        assert_eq!(
            node_int_annotation(&n, NODE_WEIGHT_ANNOTATION),
            Err(AnnotationError::Missing(NODE_WEIGHT_ANNOTATION.to_string()))
        );
        assert_eq!(node_int_annotation(&n, ""), Err(AnnotationError::InvalidName));

        let n = node(&[(NODE_WEIGHT_ANNOTATION, "heavy")]);
        assert!(matches!(
            node_int_annotation(&n, NODE_WEIGHT_ANNOTATION),
            Err(AnnotationError::InvalidContent { .. })
        ));
    }
}
