use reqwest::Client as HttpClient;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::api::models::{ConversationFilter, ConversationKey, ConversationPage, MessagePage, Role, SortSpec};
use crate::error::{Result, SyncError};
use crate::utils::base_api;

/// Parameters of one `GET conversations` call.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationQuery {
    pub role: Role,
    pub page: u32,
    pub limit: u32,
    pub filter: ConversationFilter,
    pub sort: SortSpec,
}

impl ConversationQuery {
    pub fn to_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("role", self.role.to_string()),
            ("page", self.page.to_string()),
            ("limit", self.limit.to_string()),
            ("sortField", self.sort.field.clone()),
            ("sortOrder", self.sort.order.as_str().to_string()),
        ];
        if let Some(filter) = self.filter.as_query() {
            params.push(("filter", filter.to_string()));
        }
        params
    }
}

/// Parameters of one `GET messages` call.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageQuery {
    pub conversation: ConversationKey,
    pub page: u32,
    pub limit: u32,
}

impl MessageQuery {
    pub fn to_params(&self) -> Vec<(&'static str, String)> {
        let target = match &self.conversation {
            ConversationKey::User(id) => ("otherUserId", id.clone()),
            ConversationKey::Room(id) => ("chatRoomId", id.clone()),
        };
        vec![target, ("page", self.page.to_string()), ("limit", self.limit.to_string())]
    }
}

/// REST side of the chat backend.
pub struct ApiClient {
    pub http: HttpClient,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(base_url: &str, token: Option<String>) -> Self {
        Self { http: HttpClient::new(), base_url: base_api(base_url), token }
    }

    fn with_auth(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(t) = &self.token {
            req = req.header("Authorization", format!("Bearer {}", t));
        }
        req
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, params: &[(&'static str, String)]) -> Result<T> {
        let endpoint = format!("{}/{}", self.base_url, path);
        let resp = self.with_auth(self.http.get(&endpoint).query(params)).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(SyncError::Fetch { status: Some(status.as_u16()), message: format!("GET {path} returned {status}") });
        }
        let json: Value = resp.json().await?;
        unwrap_envelope(json)
    }

    pub async fn conversations(&self, query: &ConversationQuery) -> Result<ConversationPage> {
        log::debug!("fetching {} conversations page {}", query.role, query.page);
        self.get_json("chat/conversations", &query.to_params()).await
    }

    pub async fn messages(&self, query: &MessageQuery) -> Result<MessagePage> {
        log::debug!("fetching messages for {} page {}", query.conversation, query.page);
        self.get_json("chat/messages", &query.to_params()).await
    }
}

/// Responses come either bare or wrapped in `{"data": ...}`.
pub fn unwrap_envelope<T: DeserializeOwned>(json: Value) -> Result<T> {
    let body = match json {
        Value::Object(mut map) if map.contains_key("data") && !map.contains_key("meta") => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    };
    serde_json::from_value(body).map_err(|e| SyncError::fetch(format!("unexpected response shape: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::models::SortOrder;
    use serde_json::json;

    #[test]
    fn conversation_query_omits_all_filter() {
        let query = ConversationQuery {
            role: Role::Provider,
            page: 2,
            limit: 20,
            filter: ConversationFilter::All,
            sort: SortSpec { field: "updatedAt".into(), order: SortOrder::Asc },
        };
        let params = query.to_params();
        assert!(params.contains(&("role", "provider".to_string())));
        assert!(params.contains(&("sortOrder", "asc".to_string())));
        assert!(!params.iter().any(|(k, _)| *k == "filter"));

        let filtered = ConversationQuery { filter: ConversationFilter::Unread, ..query };
        assert!(filtered.to_params().contains(&("filter", "unread".to_string())));
    }

    #[test]
    fn message_query_targets_user_or_room() {
        let query = MessageQuery { conversation: ConversationKey::Room("r1".into()), page: 1, limit: 30 };
        assert_eq!(query.to_params()[0], ("chatRoomId", "r1".to_string()));
    }

    #[test]
    fn envelope_is_optional() {
        let wrapped = json!({"data": {"conversations": [], "meta": {"page": 1, "totalPages": 3}}});
        let page: ConversationPage = unwrap_envelope(wrapped).unwrap();
        assert_eq!(page.meta.total_pages, 3);

        let bare = json!({"messages": [], "meta": {"page": 1, "hasNextPage": false}});
        let page: MessagePage = unwrap_envelope(bare).unwrap();
        assert!(!page.meta.has_next_page);

        let broken = json!({"unexpected": true});
        assert!(matches!(unwrap_envelope::<MessagePage>(broken), Err(SyncError::Fetch { .. })));
    }
}
