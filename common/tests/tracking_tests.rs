/// Tracking model tests
///
/// TrackingLinks must stay sorted and de-duplicated no matter the insertion
/// order, otherwise two reconciliations of the same state would not compare.
use gatehouse_common::{
    Endpoint, ResourceType, TrackingLinks, TrackingRef, DEFAULT_ENDPOINT_WEIGHT,
};

#[test]
fn test_links_are_sorted_and_deduplicated() {
    let mut links = TrackingLinks::new();
    assert!(links.insert(ResourceType::Backend, "default_web_8080"));
    assert!(links.insert(ResourceType::Backend, "default_api_80"));
    assert!(!links.insert(ResourceType::Backend, "default_web_8080"));
    assert!(links.insert(ResourceType::Hostname, "example.com"));

    assert_eq!(
        links.get(ResourceType::Backend),
        &["default_api_80".to_string(), "default_web_8080".to_string()]
    );
    assert_eq!(links.len(), 3);
    assert!(links.contains(ResourceType::Hostname, "example.com"));
    assert!(!links.contains(ResourceType::Hostname, "example.org"));
}

#[test]
fn test_insertion_order_does_not_matter() {
    let a: TrackingLinks = vec![
        (ResourceType::Secret, "default/b".to_string()),
        (ResourceType::Secret, "default/a".to_string()),
        (ResourceType::Ingress, "default/web".to_string()),
    ]
    .into_iter()
    .collect();

    let b: TrackingLinks = vec![
        (ResourceType::Ingress, "default/web".to_string()),
        (ResourceType::Secret, "default/a".to_string()),
        (ResourceType::Secret, "default/b".to_string()),
        (ResourceType::Secret, "default/a".to_string()),
    ]
    .into_iter()
    .collect();

    assert_eq!(a, b);
    assert_eq!(
        a.to_string(),
        "{Ingress=[default/web] Secret=[default/a,default/b]}"
    );
}

#[test]
fn test_merge_and_remove() {
    let mut links = TrackingLinks::new();
    links.insert(ResourceType::Backend, "b1");

    let mut other = TrackingLinks::new();
    other.insert(ResourceType::Backend, "b1");
    other.insert(ResourceType::Backend, "b2");
    other.insert(ResourceType::AcmeData, "default/site-tls");

    links.merge(&other);
    assert_eq!(links.len(), 3);

    let backends = links.remove(ResourceType::Backend);
    assert_eq!(backends, vec!["b1".to_string(), "b2".to_string()]);
    assert!(links.get(ResourceType::Backend).is_empty());
    assert!(!links.is_empty());
}

#[test]
fn test_refs_round_trip_through_links() {
    let refs = vec![
        TrackingRef::new(ResourceType::Service, "default/web"),
        TrackingRef::new(ResourceType::Endpoints, "default/web"),
    ];
    let links: TrackingLinks = refs.clone().into_iter().collect();
    let mut back: Vec<TrackingRef> = links.refs().collect();
    back.sort();
    let mut expected = refs;
    expected.sort();
    assert_eq!(back, expected);
}

#[test]
fn test_internal_resource_types() {
    assert!(ResourceType::Backend.is_internal());
    assert!(ResourceType::AcmeData.is_internal());
    assert!(!ResourceType::Secret.is_internal());
    assert_eq!(ResourceType::HttpRoute.to_string(), "HTTPRoute");
    assert_eq!(
        TrackingRef::new(ResourceType::Secret, "default/tls").to_string(),
        "Secret:default/tls"
    );
}

#[test]
fn test_endpoint_target_and_defaults() {
    let ep = Endpoint::new("10.0.1.2", 8080).with_target_ref("default", "web-0");
    assert_eq!(ep.target, "10.0.1.2:8080");
    assert_eq!(ep.target_ref, "default/web-0");
    assert_eq!(ep.weight, DEFAULT_ENDPOINT_WEIGHT);
    assert!(ep.has_valid_weight());

    let ep = ep.with_node(Some("node-a".to_string()), 128);
    assert!(!ep.has_valid_weight());
    assert_eq!(ep.to_string(), "10.0.1.2:8080 weight=128 ref=default/web-0 node=node-a");
}

#[test]
fn test_links_serialize_as_plain_map() {
    let mut links = TrackingLinks::new();
    links.insert(ResourceType::Backend, "default_web_8080");
    let json = serde_json::to_string(&links).expect("Should serialize links");
    assert_eq!(json, r#"{"Backend":["default_web_8080"]}"#);
}
