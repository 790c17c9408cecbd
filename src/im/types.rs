//! 跨模块共享的基础类型

use crate::im::error::{Result, StoreError};
use serde::{Deserialize, Serialize};

/// 会话类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum ConversationType {
    /// 单聊
    Single = 1,
    /// 系统会话（target 为会话用户自己或系统账号）
    System = 2,
}

impl From<ConversationType> for i32 {
    fn from(t: ConversationType) -> Self {
        t as i32
    }
}

impl TryFrom<i32> for ConversationType {
    type Error = StoreError;

    fn try_from(v: i32) -> Result<Self> {
        match v {
            1 => Ok(ConversationType::Single),
            2 => Ok(ConversationType::System),
            other => Err(StoreError::invalid(format!("未知会话类型: {}", other))),
        }
    }
}

/// 会话键：(会话类型, 对端用户)，每个会话用户内唯一
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationKey {
    #[serde(rename = "conversationType")]
    pub conversation_type: ConversationType,
    #[serde(rename = "targetUserId")]
    pub target_user_id: i64,
}

impl ConversationKey {
    pub fn new(conversation_type: ConversationType, target_user_id: i64) -> Self {
        Self {
            conversation_type,
            target_user_id,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.target_user_id <= 0 {
            return Err(StoreError::invalid(format!(
                "非法的对端用户 ID: {}",
                self.target_user_id
            )));
        }
        Ok(())
    }
}

/// 倒序分页游标
///
/// seq 可能重复，游标由 (seq, local_id) 组成，与排序 `local_seq DESC, local_id DESC` 一致。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeqCursor {
    pub seq: i64,
    #[serde(rename = "localId")]
    pub local_id: i64,
}

impl SeqCursor {
    /// 从最新处开始
    pub const START: SeqCursor = SeqCursor {
        seq: i64::MAX,
        local_id: i64::MAX,
    };

    /// 位于 (seq, local_id) 这一行之后（更旧）的位置
    pub fn new(seq: i64, local_id: i64) -> Self {
        Self { seq, local_id }
    }

    /// 只按 seq 定位：严格小于 `seq` 的行
    pub fn before_seq(seq: i64) -> Self {
        Self {
            seq,
            local_id: i64::MIN,
        }
    }

    /// `seq <= 0` 视为从最新处开始
    pub(crate) fn normalized(self) -> Self {
        if self.seq <= 0 {
            Self::START
        } else {
            self
        }
    }
}

impl Default for SeqCursor {
    fn default() -> Self {
        Self::START
    }
}

/// 按 seq 倒序分页的记录
pub trait SeqOrdered {
    /// 指向这条记录之后的游标
    fn cursor(&self) -> SeqCursor;
}

/// 分页结果
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// 是否还有更多数据（多查一条判断，无需额外 count）
    #[serde(rename = "hasMore")]
    pub has_more: bool,
    /// 下一页的游标，仅按 seq 分页且还有更多数据时存在
    #[serde(rename = "nextCursor", skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<SeqCursor>,
}

impl<T> Page<T> {
    /// 由 limit+1 条查询结果构造分页
    pub(crate) fn from_overfetch(mut rows: Vec<T>, limit: u32) -> Self {
        let has_more = rows.len() > limit as usize;
        rows.truncate(limit as usize);
        Self {
            items: rows,
            has_more,
            next_cursor: None,
        }
    }

    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            has_more: false,
            next_cursor: None,
        }
    }
}

impl<T: SeqOrdered> Page<T> {
    /// 同 [`Page::from_overfetch`]，并以最后一条记录作为下一页游标
    pub(crate) fn from_seq_overfetch(rows: Vec<T>, limit: u32) -> Self {
        let mut page = Self::from_overfetch(rows, limit);
        if page.has_more {
            page.next_cursor = page.items.last().map(SeqOrdered::cursor);
        }
        page
    }
}

pub(crate) fn check_limit(limit: u32) -> Result<()> {
    if limit == 0 {
        return Err(StoreError::invalid("分页 limit 必须大于 0"));
    }
    Ok(())
}

pub(crate) fn bool_col(v: bool) -> i64 {
    if v {
        1
    } else {
        0
    }
}
