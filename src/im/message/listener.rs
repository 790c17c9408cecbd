//! 消息监听器回调接口

use crate::im::message::models::LocalMessage;
use crate::im::types::ConversationKey;
use async_trait::async_trait;

/// 消息监听器
#[async_trait]
pub trait MessageListener: Send + Sync {
    /// 新消息落库
    async fn on_message_created(&self, session_user_id: i64, key: ConversationKey, message: LocalMessage);

    /// 消息变更（发送状态、撤回等），携带提交后的记录
    async fn on_message_changed(&self, session_user_id: i64, key: ConversationKey, message: LocalMessage);
}

/// 空实现（默认监听器）
pub struct EmptyMessageListener;

#[async_trait]
impl MessageListener for EmptyMessageListener {
    async fn on_message_created(&self, _session_user_id: i64, _key: ConversationKey, _message: LocalMessage) {}
    async fn on_message_changed(&self, _session_user_id: i64, _key: ConversationKey, _message: LocalMessage) {}
}
