//! Event eligibility and outbound payload construction.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::error::{EngineError, FilterMiss, Rejection};
use crate::types::{ContentType, DomainEvent, Filters, Subscription};

/// Decide whether `event` should be delivered to `subscription`.
///
/// Checks short-circuit in a fixed order: active, subscribed type, entity
/// allow-lists, tags, then data conditions.
pub fn check_eligibility(
    subscription: &Subscription,
    is_active: bool,
    event: &DomainEvent,
) -> Result<(), Rejection> {
    if !is_active {
        return Err(Rejection::Inactive);
    }
    if !subscription.events.contains(&event.event_type) {
        return Err(Rejection::NotSubscribed);
    }
    check_filters(&subscription.filters, event).map_err(Rejection::FilteredOut)
}

fn check_filters(filters: &Filters, event: &DomainEvent) -> Result<(), FilterMiss> {
    let refs = &event.entity_refs;
    let allow_lists = [
        (&filters.document_ids, &refs.document_id, FilterMiss::Document),
        (&filters.folder_ids, &refs.folder_id, FilterMiss::Folder),
        (&filters.user_ids, &refs.user_id, FilterMiss::User),
    ];
    for (allowed, referenced, miss) in allow_lists {
        if allowed.is_empty() {
            continue;
        }
        match referenced {
            Some(id) if allowed.contains(id) => {}
            _ => return Err(miss),
        }
    }

    if !filters.tags.is_empty() && !filters.tags.iter().any(|t| event.tags.contains(t)) {
        return Err(FilterMiss::Tags);
    }

    for (path, expected) in &filters.conditions {
        if lookup_path(&event.data, path) != Some(expected) {
            return Err(FilterMiss::Condition);
        }
    }

    Ok(())
}

fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Apply the subscription's transform to the event data.
pub fn transform_payload(
    subscription: &Subscription,
    data: &Value,
    now: DateTime<Utc>,
) -> Value {
    let transform = &subscription.transform;
    if !transform.enabled {
        return data.clone();
    }

    let mut object = match data {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("data".to_string(), other.clone());
            map
        }
    };

    for field in &transform.exclude_fields {
        object.remove(field);
    }
    for (key, value) in &transform.custom_fields {
        object.insert(key.clone(), value.clone());
    }
    if transform.include_metadata {
        object.insert(
            "_webhook".to_string(),
            serde_json::json!({
                "id": subscription.id.0,
                "name": subscription.name,
                "timestamp": now.to_rfc3339_opts(SecondsFormat::Millis, true),
            }),
        );
    }

    Value::Object(object)
}

/// Encode the payload into the exact bytes that get signed and sent.
pub fn encode_body(content_type: ContentType, payload: &Value) -> Result<String, EngineError> {
    match content_type {
        ContentType::Json => Ok(serde_json::to_string(payload)?),
        ContentType::FormUrlEncoded => {
            let mut serializer = url::form_urlencoded::Serializer::new(String::new());
            match payload {
                Value::Object(map) => {
                    for (key, value) in map {
                        match value {
                            Value::String(s) => serializer.append_pair(key, s),
                            other => serializer.append_pair(key, &serde_json::to_string(other)?),
                        };
                    }
                }
                other => {
                    serializer.append_pair("payload", &serde_json::to_string(other)?);
                }
            }
            Ok(serializer.finish())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Transform;
    use serde_json::json;

    fn subscription() -> Subscription {
        Subscription::new("wh_1", "ws_1", "https://hooks.example.com", "secret")
            .with_name("Docs hook")
            .with_events(["document.updated", "comment.created"])
    }

    fn event() -> DomainEvent {
        DomainEvent::new("document.updated", "ws_1")
            .with_document("doc_1")
            .with_folder("folder_1")
            .with_user("user_1")
            .with_tags(["legal"])
            .with_data(json!({"title": "Q3", "meta": {"state": "final"}}))
    }

    #[test]
    fn test_inactive_short_circuits() {
        let sub = subscription();
        assert_eq!(check_eligibility(&sub, false, &event()), Err(Rejection::Inactive));
    }

    #[test]
    fn test_unsubscribed_event_type() {
        let sub = subscription();
        let event = DomainEvent::new("folder.created", "ws_1");
        assert_eq!(check_eligibility(&sub, true, &event), Err(Rejection::NotSubscribed));
    }

    #[test]
    fn test_entity_allow_lists() {
        let mut filters = Filters::default();
        filters.document_ids.insert("doc_1".to_string());
        let sub = subscription().with_filters(filters.clone());
        assert!(check_eligibility(&sub, true, &event()).is_ok());

        let other_doc = event().with_document("doc_2");
        assert_eq!(
            check_eligibility(&sub, true, &other_doc),
            Err(Rejection::FilteredOut(FilterMiss::Document))
        );

        let no_doc = DomainEvent::new("document.updated", "ws_1");
        assert_eq!(
            check_eligibility(&sub, true, &no_doc),
            Err(Rejection::FilteredOut(FilterMiss::Document))
        );

        filters.user_ids.insert("user_9".to_string());
        let sub = subscription().with_filters(filters);
        assert_eq!(
            check_eligibility(&sub, true, &event()),
            Err(Rejection::FilteredOut(FilterMiss::User))
        );
    }

    #[test]
    fn test_tag_and_condition_filters() {
        let filters = Filters {
            tags: vec!["finance".to_string(), "legal".to_string()],
            ..Default::default()
        };
        let sub = subscription().with_filters(filters);
        assert!(check_eligibility(&sub, true, &event()).is_ok());
        assert_eq!(
            check_eligibility(&sub, true, &event().with_tags(["hr"])),
            Err(Rejection::FilteredOut(FilterMiss::Tags))
        );

        let mut filters = Filters::default();
        filters.conditions.insert("meta.state".to_string(), json!("final"));
        let sub = subscription().with_filters(filters);
        assert!(check_eligibility(&sub, true, &event()).is_ok());

        let draft = event().with_data(json!({"meta": {"state": "draft"}}));
        assert_eq!(
            check_eligibility(&sub, true, &draft),
            Err(Rejection::FilteredOut(FilterMiss::Condition))
        );
    }

    #[test]
    fn test_transform_excludes_and_adds_metadata() {
        let mut custom = Map::new();
        custom.insert("source".to_string(), json!("docs"));
        let sub = subscription().with_transform(Transform {
            enabled: true,
            exclude_fields: vec!["secretField".to_string()],
            custom_fields: custom,
            include_metadata: true,
        });

        let now = Utc::now();
        let payload = transform_payload(&sub, &json!({"title": "Q3", "secretField": "x"}), now);

        assert!(payload.get("secretField").is_none());
        assert_eq!(payload["title"], "Q3");
        assert_eq!(payload["source"], "docs");
        assert_eq!(payload["_webhook"]["id"], "wh_1");
        assert_eq!(payload["_webhook"]["name"], "Docs hook");
        assert!(payload["_webhook"]["timestamp"].is_string());
    }

    #[test]
    fn test_disabled_transform_passes_through() {
        let data = json!({"secretField": "kept"});
        assert_eq!(transform_payload(&subscription(), &data, Utc::now()), data);
    }

    #[test]
    fn test_form_encoding() {
        let body = encode_body(
            ContentType::FormUrlEncoded,
            &json!({"title": "Q3 plan", "count": 2}),
        )
        .unwrap();
        assert!(body.contains("title=Q3+plan"));
        assert!(body.contains("count=2"));

        let json_body = encode_body(ContentType::Json, &json!({"a": 1})).unwrap();
        assert_eq!(json_body, r#"{"a":1}"#);
    }
}
