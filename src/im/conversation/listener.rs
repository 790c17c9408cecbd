//! 会话监听器回调接口

use crate::im::conversation::models::LocalConversation;
use async_trait::async_trait;

/// 会话监听器
///
/// 回调在通知总线的派发任务中执行，不会阻塞写队列。
#[async_trait]
pub trait ConversationListener: Send + Sync {
    /// 新会话
    async fn on_conversation_created(&self, session_user_id: i64, conversation: LocalConversation);

    /// 会话变更（携带提交后重新读取的记录）
    async fn on_conversation_changed(&self, session_user_id: i64, conversation: LocalConversation);
}

/// 空实现（默认监听器）
pub struct EmptyConversationListener;

#[async_trait]
impl ConversationListener for EmptyConversationListener {
    async fn on_conversation_created(&self, _session_user_id: i64, _conversation: LocalConversation) {}
    async fn on_conversation_changed(&self, _session_user_id: i64, _conversation: LocalConversation) {}
}
