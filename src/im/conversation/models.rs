//! 会话本地模型定义

use crate::im::types::{ConversationKey, ConversationType, SeqCursor, SeqOrdered};
use serde::{Deserialize, Serialize};

/// 本地会话
///
/// `local_id` 由存储在插入时分配，之后不可变且不会复用。
/// 会话只做软删除（`local_delete`），不会物理删除。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalConversation {
    #[serde(rename = "localId")]
    pub local_id: Option<i64>,
    #[serde(rename = "localSeq")]
    pub local_seq: i64,
    #[serde(rename = "conversationType")]
    pub conversation_type: ConversationType,
    #[serde(rename = "targetUserId")]
    pub target_user_id: i64,

    /// 对端的逻辑消息区间，可能引用本地不存在的消息
    #[serde(rename = "remoteMessageStart")]
    pub remote_message_start: i64,
    #[serde(rename = "remoteMessageEnd")]
    pub remote_message_end: i64,
    #[serde(rename = "remoteMessageLastRead")]
    pub remote_message_last_read: i64,

    /// 展示用的消息，不一定是最后一条（比如撤回占位）
    #[serde(rename = "remoteShowMessageId")]
    pub remote_show_message_id: i64,
    #[serde(rename = "localShowMessageId")]
    pub local_show_message_id: i64,

    #[serde(rename = "remoteUnread")]
    pub remote_unread: i64,
    #[serde(rename = "localUnreadCount")]
    pub local_unread_count: i64,

    /// 展示/排序时间
    #[serde(rename = "localTimeMs")]
    pub local_time_ms: i64,
    #[serde(rename = "localDelete")]
    pub local_delete: bool,
    #[serde(rename = "localLastModifyMs")]
    pub local_last_modify_ms: i64,

    #[serde(default)]
    pub flags: ConversationFlags,
}

/// 业务标记，存储层不解释其含义
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationFlags {
    pub matched: bool,
    #[serde(rename = "newMessage")]
    pub new_message: bool,
    #[serde(rename = "myMove")]
    pub my_move: bool,
    #[serde(rename = "iceBreak")]
    pub ice_break: bool,
    #[serde(rename = "tipFree")]
    pub tip_free: bool,
    #[serde(rename = "topAlbum")]
    pub top_album: bool,
    #[serde(rename = "iBlockU")]
    pub i_block_u: bool,
    pub connected: bool,
}

impl LocalConversation {
    /// 新会话，尚未分配 local_id
    pub fn new(conversation_type: ConversationType, target_user_id: i64) -> Self {
        Self {
            local_id: None,
            local_seq: 0,
            conversation_type,
            target_user_id,
            remote_message_start: 0,
            remote_message_end: 0,
            remote_message_last_read: 0,
            remote_show_message_id: 0,
            local_show_message_id: 0,
            remote_unread: 0,
            local_unread_count: 0,
            local_time_ms: 0,
            local_delete: false,
            local_last_modify_ms: 0,
            flags: ConversationFlags::default(),
        }
    }

    pub fn key(&self) -> ConversationKey {
        ConversationKey::new(self.conversation_type, self.target_user_id)
    }
}

impl SeqOrdered for LocalConversation {
    fn cursor(&self) -> SeqCursor {
        SeqCursor::new(self.local_seq, self.local_id.unwrap_or(0))
    }
}
