//! 消息本地模型定义

use crate::im::error::StoreError;
use crate::im::types::{SeqCursor, SeqOrdered};
use serde::{Deserialize, Serialize};

/// 消息类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum MessageType {
    Text = 1,
    Image = 2,
    Audio = 3,
    Video = 4,
    Location = 5,
    /// 自定义/控制消息，内容由业务解释
    Custom = 6,
    /// 已撤回，原内容已清空
    Revoked = 100,
}

impl From<MessageType> for i32 {
    fn from(t: MessageType) -> Self {
        t as i32
    }
}

impl TryFrom<i32> for MessageType {
    type Error = StoreError;

    fn try_from(v: i32) -> Result<Self, Self::Error> {
        Ok(match v {
            1 => MessageType::Text,
            2 => MessageType::Image,
            3 => MessageType::Audio,
            4 => MessageType::Video,
            5 => MessageType::Location,
            6 => MessageType::Custom,
            100 => MessageType::Revoked,
            other => return Err(StoreError::invalid(format!("未知消息类型: {}", other))),
        })
    }
}

/// 本地发送状态，只有 `Success` 是终态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum SendStatus {
    Idle = 0,
    Sending = 1,
    Success = 2,
    Fail = 3,
}

impl SendStatus {
    pub fn is_terminal(self) -> bool {
        self == SendStatus::Success
    }
}

impl From<SendStatus> for i32 {
    fn from(s: SendStatus) -> Self {
        s as i32
    }
}

impl TryFrom<i32> for SendStatus {
    type Error = StoreError;

    fn try_from(v: i32) -> Result<Self, Self::Error> {
        Ok(match v {
            0 => SendStatus::Idle,
            1 => SendStatus::Sending,
            2 => SendStatus::Success,
            3 => SendStatus::Fail,
            other => return Err(StoreError::invalid(format!("未知发送状态: {}", other))),
        })
    }
}

/// 媒体元数据
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaMeta {
    pub width: i32,
    pub height: i32,
    /// 毫秒
    pub duration: i64,
    pub lat: f64,
    pub lng: f64,
    pub zoom: i32,
}

/// 本地消息（属于某个会话分表）
///
/// `local_id` 在分表内唯一；`remote_message_id` 一经分配不再改变。
/// 类型和内容可以原地修改（例如撤回）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalMessage {
    #[serde(rename = "localId")]
    pub local_id: Option<i64>,
    #[serde(rename = "localSeq")]
    pub local_seq: i64,
    #[serde(rename = "fromUserId")]
    pub from_user_id: i64,
    #[serde(rename = "toUserId")]
    pub to_user_id: i64,
    /// 未被服务端确认的本地发送为 None
    #[serde(rename = "remoteMessageId")]
    pub remote_message_id: Option<i64>,
    #[serde(rename = "remoteMessageTime")]
    pub remote_message_time: Option<i64>,
    #[serde(rename = "localTimeMs")]
    pub local_time_ms: i64,
    #[serde(rename = "messageType")]
    pub message_type: MessageType,

    pub title: String,
    pub body: String,
    pub thumb: String,
    /// 上传前的本地来源（如本地文件路径）
    #[serde(rename = "localTitleOrigin")]
    pub local_title_origin: String,
    #[serde(rename = "localBodyOrigin")]
    pub local_body_origin: String,
    #[serde(rename = "localThumbOrigin")]
    pub local_thumb_origin: String,

    #[serde(default)]
    pub media: MediaMeta,

    #[serde(rename = "localSendStatus")]
    pub local_send_status: SendStatus,
    /// 不可见的协议/控制消息
    #[serde(rename = "localActionMessage")]
    pub local_action_message: bool,
    /// 同一发送者、相近时间的连续消息共用一个块
    #[serde(rename = "localBlockId")]
    pub local_block_id: i64,
    #[serde(rename = "localLastModifyMs")]
    pub local_last_modify_ms: i64,
}

impl LocalMessage {
    pub fn new(from_user_id: i64, to_user_id: i64, message_type: MessageType) -> Self {
        Self {
            local_id: None,
            local_seq: 0,
            from_user_id,
            to_user_id,
            remote_message_id: None,
            remote_message_time: None,
            local_time_ms: 0,
            message_type,
            title: String::new(),
            body: String::new(),
            thumb: String::new(),
            local_title_origin: String::new(),
            local_body_origin: String::new(),
            local_thumb_origin: String::new(),
            media: MediaMeta::default(),
            local_send_status: SendStatus::Success,
            local_action_message: false,
            local_block_id: 0,
            local_last_modify_ms: 0,
        }
    }

    /// 撤回：改为撤回类型并清空内容，保留 ID 与 seq
    pub(crate) fn revoke(&mut self) {
        self.message_type = MessageType::Revoked;
        self.title.clear();
        self.body.clear();
        self.thumb.clear();
        self.local_title_origin.clear();
        self.local_body_origin.clear();
        self.local_thumb_origin.clear();
        self.media = MediaMeta::default();
    }
}

impl SeqOrdered for LocalMessage {
    fn cursor(&self) -> SeqCursor {
        SeqCursor::new(self.local_seq, self.local_id.unwrap_or(0))
    }
}
