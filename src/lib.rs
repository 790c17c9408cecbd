pub mod im;

// 重新导出常用类型，方便外部使用
pub use im::{
    clock::{Clock, SystemClock},
    conversation::{ConversationListener, ConversationStore, LocalConversation},
    message::{LocalMessage, MessageListener, MessageStore, MessageType, SendStatus},
    notify::{ListenerHandle, NotifyBus},
    sending::{SendingEntry, SendingQueue},
    sequence::Sequence,
    types::{ConversationKey, ConversationType, Page, SeqCursor, SeqOrdered},
    user::{SyncTransport, UserInfo, UserInfoListener, UserInfoStore, UserInfoSyncer, UserProfile},
    Result, StoreConfig, StoreContext, StoreError, SyncPolicy,
};
