//! 待发送索引模型

use crate::im::message::models::SendStatus;
use crate::im::types::{ConversationKey, ConversationType};
use serde::{Deserialize, Serialize};

/// 待发送索引项：指向某个会话分表中尚未发送成功的消息
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendingEntry {
    #[serde(rename = "localId")]
    pub local_id: Option<i64>,
    #[serde(rename = "conversationType")]
    pub conversation_type: ConversationType,
    #[serde(rename = "targetUserId")]
    pub target_user_id: i64,
    #[serde(rename = "messageLocalId")]
    pub message_local_id: i64,
    #[serde(rename = "localSendStatus")]
    pub local_send_status: SendStatus,
}

impl SendingEntry {
    pub fn new(key: ConversationKey, message_local_id: i64, status: SendStatus) -> Self {
        Self {
            local_id: None,
            conversation_type: key.conversation_type,
            target_user_id: key.target_user_id,
            message_local_id,
            local_send_status: status,
        }
    }

    pub fn key(&self) -> ConversationKey {
        ConversationKey::new(self.conversation_type, self.target_user_id)
    }
}
