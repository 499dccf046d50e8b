//! The paged list envelope returned by table controllers.

use serde::{Deserialize, Serialize};

/// One page of a query result.
///
/// `count` is populated only when the query requested a total count, and
/// `next_link` is an opaque query string (not a full URL) that reproduces
/// the subsequent page when appended to the same endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_link: Option<String>,
}

impl<T> Default for Page<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            count: None,
            next_link: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn envelope_uses_camel_case_and_omits_absent_fields() {
        let page = Page {
            items: vec![json!({"id": "a"})],
            count: Some(25),
            next_link: Some("$skip=10".to_string()),
        };
        let encoded = serde_json::to_value(&page).unwrap();
        assert_eq!(
            encoded,
            json!({"items": [{"id": "a"}], "count": 25, "nextLink": "$skip=10"})
        );

        let bare = Page::<Value> {
            items: vec![],
            count: None,
            next_link: None,
        };
        assert_eq!(serde_json::to_value(&bare).unwrap(), json!({"items": []}));
    }

    #[test]
    fn envelope_parses_with_absent_fields() {
        let page: Page<Value> = serde_json::from_str(r#"{"items":[]}"#).unwrap();
        assert!(page.items.is_empty());
        assert!(page.count.is_none());
        assert!(page.next_link.is_none());
    }
}
