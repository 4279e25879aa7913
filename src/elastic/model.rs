use serde::Deserialize;
use serde_json::Value;

/// Body of a `POST /_bulk` response. Only the fields needed to spot item failures.
#[derive(Deserialize, Debug)]
pub struct BulkResponse {
    pub errors: bool,
    #[serde(default)]
    pub items: Vec<Value>,
}

impl BulkResponse {
    /// First per-item error, rendered for logging.
    pub fn first_error(&self) -> Option<String> {
        self.items.iter().find_map(|item| {
            let action = item.as_object()?.values().next()?;
            let error = action.get("error")?;
            let id = action.get("_id").and_then(Value::as_str).unwrap_or("?");
            let reason = error
                .get("reason")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            Some(format!("{}: {}", id, reason))
        })
    }

    pub fn failed_items(&self) -> usize {
        self.items
            .iter()
            .filter(|item| {
                item.as_object()
                    .and_then(|o| o.values().next())
                    .and_then(|action| action.get("error"))
                    .is_some()
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn finds_first_item_error() {
        let resp: BulkResponse = serde_json::from_value(json!({
            "took": 3,
            "errors": true,
            "items": [
                {"index": {"_id": "users_1", "status": 200}},
                {"index": {"_id": "users_2", "status": 429, "error": {"type": "es_rejected_execution_exception", "reason": "queue full"}}},
                {"index": {"_id": "users_3", "status": 400, "error": {"type": "mapper_parsing_exception"}}}
            ]
        }))
        .unwrap();
        assert_eq!(resp.first_error().unwrap(), "users_2: queue full");
        assert_eq!(resp.failed_items(), 2);
    }

    #[test]
    fn clean_response_has_no_error() {
        let resp: BulkResponse = serde_json::from_value(json!({"errors": false})).unwrap();
        assert!(resp.first_error().is_none());
        assert_eq!(resp.failed_items(), 0);
    }
}
