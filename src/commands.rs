//! Typed pass-throughs for the commands the automation script understands.
//!
//! Every method returns the raw response payload; [`CommandReply`] gives a
//! read-only view of the conventional `success` / `message` / `data` fields.

use serde::Serialize;
use serde_json::{json, Value};

use crate::bridge::Bridge;
use crate::dispatcher::CommandError;

/// Borrowing client over a [`Bridge`].
#[derive(Clone, Copy)]
pub struct WechatClient<'a> {
    bridge: &'a Bridge,
}

#[derive(Debug, Serialize)]
struct BulkSendParams<'a> {
    contacts: &'a [String],
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    delay_range: Option<[u64; 2]>,
}

#[derive(Debug, Serialize)]
struct HistoryParams<'a> {
    contact_name: &'a str,
    force_refresh: bool,
    page: u32,
    per_page: u32,
}

#[derive(Debug, Serialize)]
struct LoadMoreParams<'a> {
    contact_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    before_timestamp: Option<i64>,
    limit: u32,
}

impl<'a> WechatClient<'a> {
    /// Wrap a bridge.
    pub fn new(bridge: &'a Bridge) -> Self {
        Self { bridge }
    }

    async fn call(&self, command: &str, params: Value) -> Result<Value, CommandError> {
        self.bridge.send(command, params).await
    }

    /// Connection and monitoring status (`get_connection_status`).
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] if the command cannot be settled.
    pub async fn get_status(&self) -> Result<Value, CommandError> {
        self.call("get_connection_status", Value::Null).await
    }

    /// Attach to the running WeChat client.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] if the command cannot be settled.
    pub async fn init_wechat(&self) -> Result<Value, CommandError> {
        self.call("init_wechat", Value::Null).await
    }

    /// Drop and re-create the WeChat client attachment.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] if the command cannot be settled.
    pub async fn reconnect(&self) -> Result<Value, CommandError> {
        self.call("reconnect", Value::Null).await
    }

    /// Friend list.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] if the command cannot be settled.
    pub async fn get_contacts(&self) -> Result<Value, CommandError> {
        self.call("get_contacts", Value::Null).await
    }

    /// Group chats.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] if the command cannot be settled.
    pub async fn get_groups(&self) -> Result<Value, CommandError> {
        self.call("get_groups", Value::Null).await
    }

    /// Sessions currently listed in the client.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] if the command cannot be settled.
    pub async fn get_session_list(&self) -> Result<Value, CommandError> {
        self.call("get_session_list", Value::Null).await
    }

    /// Send one text message.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] if the command cannot be settled.
    pub async fn send_message(&self, contact_name: &str, message: &str) -> Result<Value, CommandError> {
        self.call(
            "send_message",
            json!({ "contact_name": contact_name, "message": message }),
        )
        .await
    }

    /// Send the same message to several contacts with a random delay in
    /// `delay_range` seconds between sends.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] if the command cannot be settled.
    pub async fn bulk_send(
        &self,
        contacts: &[String],
        message: &str,
        delay_range: Option<(u64, u64)>,
    ) -> Result<Value, CommandError> {
        let params = serde_json::to_value(BulkSendParams {
            contacts,
            message,
            delay_range: delay_range.map(|(lo, hi)| [lo, hi]),
        })?;
        self.call("bulk_send", params).await
    }

    /// One page of chat history. This is the slow one; it can take most of
    /// the command timeout when `force_refresh` scrolls the chat window.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] if the command cannot be settled.
    pub async fn get_message_history(
        &self,
        contact_name: &str,
        force_refresh: bool,
        page: u32,
        per_page: u32,
    ) -> Result<Value, CommandError> {
        let params = serde_json::to_value(HistoryParams {
            contact_name,
            force_refresh,
            page,
            per_page,
        })?;
        self.call("get_message_history", params).await
    }

    /// Start listening to a contact. New messages arrive as automation events.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] if the command cannot be settled.
    pub async fn start_monitoring(&self, contact_name: &str, auto_reply: bool) -> Result<Value, CommandError> {
        self.call(
            "start_monitoring",
            json!({ "contact_name": contact_name, "auto_reply": auto_reply }),
        )
        .await
    }

    /// Stop listening to a contact.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] if the command cannot be settled.
    pub async fn stop_monitoring(&self, contact_name: &str) -> Result<Value, CommandError> {
        self.call("stop_monitoring", json!({ "contact_name": contact_name }))
            .await
    }

    /// Older messages for a contact, before `before_timestamp` (Unix
    /// seconds) or from the newest stored message when absent.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] if the command cannot be settled.
    pub async fn load_more_message_history(
        &self,
        contact_name: &str,
        before_timestamp: Option<i64>,
        limit: u32,
    ) -> Result<Value, CommandError> {
        let params = serde_json::to_value(LoadMoreParams {
            contact_name,
            before_timestamp,
            limit,
        })?;
        self.call("load_more_message_history", params).await
    }

    /// One page of a stored session.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] if the command cannot be settled.
    pub async fn get_session_messages(
        &self,
        session_id: &str,
        page: u32,
        limit: u32,
    ) -> Result<Value, CommandError> {
        self.call(
            "get_session_messages",
            json!({ "session_id": session_id, "page": page, "limit": limit }),
        )
        .await
    }

    /// One page of messages from the script's local database, without
    /// touching the chat window.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] if the command cannot be settled.
    pub async fn get_messages_from_db(
        &self,
        contact_name: &str,
        page: u32,
        per_page: u32,
    ) -> Result<Value, CommandError> {
        self.call(
            "get_messages_from_db",
            json!({ "contact_name": contact_name, "page": page, "per_page": per_page }),
        )
        .await
    }

    /// Delete the stored messages of a contact.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] if the command cannot be settled.
    pub async fn clear_chat_messages(&self, contact_name: &str) -> Result<Value, CommandError> {
        self.call("clear_chat_messages", json!({ "contact_name": contact_name }))
            .await
    }

    /// Clear and re-read a contact's messages from the chat window.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] if the command cannot be settled.
    pub async fn refresh_chat_messages(&self, contact_name: &str) -> Result<Value, CommandError> {
        self.call("refresh_chat_messages", json!({ "contact_name": contact_name }))
            .await
    }

    /// Whether a contact is monitored and with which options.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] if the command cannot be settled.
    pub async fn get_session_monitoring_status(
        &self,
        contact_name: &str,
    ) -> Result<Value, CommandError> {
        self.call(
            "get_session_monitoring_status",
            json!({ "contact_name": contact_name }),
        )
        .await
    }

    /// Sales-assistant configuration.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] if the command cannot be settled.
    pub async fn get_ai_sales_config(&self) -> Result<Value, CommandError> {
        self.call("get_ai_sales_config", Value::Null).await
    }

    /// Replace the sales-assistant configuration. `config` is passed through
    /// as-is; the script owns its schema.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] if the command cannot be settled.
    pub async fn update_ai_sales_config(&self, config: &Value) -> Result<Value, CommandError> {
        self.call("update_ai_sales_config", json!({ "config": config }))
            .await
    }

    /// Remove the sales-assistant configuration.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] if the command cannot be settled.
    pub async fn delete_ai_sales_config(&self) -> Result<Value, CommandError> {
        self.call("delete_ai_sales_config", Value::Null).await
    }

    /// Stored reply suggestions for a session, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] if the command cannot be settled.
    pub async fn get_reply_suggestions(&self, session_id: &str, limit: u32) -> Result<Value, CommandError> {
        self.call(
            "get_reply_suggestions",
            json!({ "session_id": session_id, "limit": limit }),
        )
        .await
    }

    /// Flag a reply suggestion as used.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] if the command cannot be settled.
    pub async fn mark_suggestion_as_used(&self, suggestion_id: i64) -> Result<Value, CommandError> {
        self.call(
            "mark_suggestion_as_used",
            json!({ "suggestion_id": suggestion_id }),
        )
        .await
    }

    /// Purge expired reply suggestions.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] if the command cannot be settled.
    pub async fn delete_old_suggestions(&self) -> Result<Value, CommandError> {
        self.call("delete_old_suggestions", Value::Null).await
    }

    /// Contacts cached in the script's database.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] if the command cannot be settled.
    pub async fn get_contacts_from_db(&self) -> Result<Value, CommandError> {
        self.call("get_contacts_from_db", Value::Null).await
    }

    /// Store contact records in the script's database.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] if the command cannot be settled.
    pub async fn save_contacts_to_db(&self, contacts: &[Value]) -> Result<Value, CommandError> {
        self.call("save_contacts_to_db", json!({ "contacts": contacts }))
            .await
    }

    /// Select the account whose database the script reads and writes.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] if the command cannot be settled.
    pub async fn set_current_wxid(&self, wxid: &str) -> Result<Value, CommandError> {
        self.call("set_current_wxid", json!({ "wxid": wxid })).await
    }

    /// Whether automatic replies are on.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] if the command cannot be settled.
    pub async fn get_auto_reply_status(&self) -> Result<Value, CommandError> {
        self.call("get_auto_reply_status", Value::Null).await
    }

    /// Turn automatic replies on or off.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] if the command cannot be settled.
    pub async fn toggle_auto_reply(&self, enabled: bool) -> Result<Value, CommandError> {
        self.call("toggle_auto_reply", json!({ "enabled": enabled }))
            .await
    }
}

/// Read-only view of a response payload.
#[derive(Debug, Clone, Copy)]
pub struct CommandReply<'a> {
    payload: &'a Value,
}

impl<'a> CommandReply<'a> {
    /// View `payload`.
    pub fn new(payload: &'a Value) -> Self {
        Self { payload }
    }

    /// The `success` flag; absent or non-boolean counts as failure.
    pub fn success(&self) -> bool {
        self.payload
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// The `message` text, if any.
    pub fn message(&self) -> Option<&'a str> {
        self.payload.get("message").and_then(Value::as_str)
    }

    /// The `data` field, if any.
    pub fn data(&self) -> Option<&'a Value> {
        self.payload.get("data")
    }
}
