//! 变更通知总线
//!
//! 会话、消息、用户资料各一个通道。发布方只把事件放进无界队列，
//! 每个通道由独立的派发任务按发布顺序逐个回调监听器，慢监听器不会阻塞写队列。
//! 总线被丢弃后派发任务自然退出。

use crate::im::conversation::listener::ConversationListener;
use crate::im::conversation::models::LocalConversation;
use crate::im::message::listener::MessageListener;
use crate::im::message::models::LocalMessage;
use crate::im::types::ConversationKey;
use crate::im::user::listener::UserInfoListener;
use async_trait::async_trait;
use futures_util::FutureExt;
use parking_lot::RwLock;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// 会话事件
#[derive(Debug, Clone)]
pub enum ConversationEvent {
    Created {
        session_user_id: i64,
        conversation: LocalConversation,
    },
    Changed {
        session_user_id: i64,
        conversation: LocalConversation,
    },
}

/// 消息事件
#[derive(Debug, Clone)]
pub enum MessageEvent {
    Created {
        session_user_id: i64,
        key: ConversationKey,
        message: LocalMessage,
    },
    Changed {
        session_user_id: i64,
        key: ConversationKey,
        message: LocalMessage,
    },
}

/// 用户资料事件
#[derive(Debug, Clone, Copy)]
pub struct UserInfoEvent {
    pub session_user_id: i64,
    pub uid: i64,
}

#[async_trait]
trait EventSink<E>: Send + Sync {
    async fn deliver(&self, event: &E);
}

struct ConversationSink(Arc<dyn ConversationListener>);

#[async_trait]
impl EventSink<ConversationEvent> for ConversationSink {
    async fn deliver(&self, event: &ConversationEvent) {
        match event {
            ConversationEvent::Created {
                session_user_id,
                conversation,
            } => {
                self.0
                    .on_conversation_created(*session_user_id, conversation.clone())
                    .await
            }
            ConversationEvent::Changed {
                session_user_id,
                conversation,
            } => {
                self.0
                    .on_conversation_changed(*session_user_id, conversation.clone())
                    .await
            }
        }
    }
}

struct MessageSink(Arc<dyn MessageListener>);

#[async_trait]
impl EventSink<MessageEvent> for MessageSink {
    async fn deliver(&self, event: &MessageEvent) {
        match event {
            MessageEvent::Created {
                session_user_id,
                key,
                message,
            } => {
                self.0
                    .on_message_created(*session_user_id, *key, message.clone())
                    .await
            }
            MessageEvent::Changed {
                session_user_id,
                key,
                message,
            } => {
                self.0
                    .on_message_changed(*session_user_id, *key, message.clone())
                    .await
            }
        }
    }
}

struct UserInfoSink(Arc<dyn UserInfoListener>);

#[async_trait]
impl EventSink<UserInfoEvent> for UserInfoSink {
    async fn deliver(&self, event: &UserInfoEvent) {
        self.0
            .on_user_info_changed(event.session_user_id, event.uid)
            .await
    }
}

type SinkList<E> = RwLock<Vec<(u64, Arc<dyn EventSink<E>>)>>;

struct Channel<E> {
    name: &'static str,
    tx: mpsc::UnboundedSender<E>,
    sinks: Arc<SinkList<E>>,
    next_id: AtomicU64,
}

impl<E: Send + Sync + 'static> Channel<E> {
    fn new(name: &'static str) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<E>();
        let sinks: Arc<SinkList<E>> = Arc::new(RwLock::new(Vec::new()));

        let dispatch_sinks = sinks.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let snapshot: Vec<Arc<dyn EventSink<E>>> =
                    dispatch_sinks.read().iter().map(|(_, s)| s.clone()).collect();
                for sink in snapshot {
                    if AssertUnwindSafe(sink.deliver(&event))
                        .catch_unwind()
                        .await
                        .is_err()
                    {
                        error!("[Notify] {} 监听器回调 panic，已跳过", name);
                    }
                }
            }
            debug!("[Notify] {} 派发任务退出", name);
        });

        Self {
            name,
            tx,
            sinks,
            next_id: AtomicU64::new(1),
        }
    }

    fn publish(&self, event: E) {
        if self.tx.send(event).is_err() {
            warn!("[Notify] {} 派发任务已停止，事件被丢弃", self.name);
        }
    }

    fn subscribe(&self, sink: Arc<dyn EventSink<E>>) -> ListenerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sinks.write().push((id, sink));

        let weak: Weak<SinkList<E>> = Arc::downgrade(&self.sinks);
        ListenerHandle {
            remove: Some(Box::new(move || {
                if let Some(sinks) = weak.upgrade() {
                    sinks.write().retain(|(sid, _)| *sid != id);
                }
            })),
        }
    }

    fn listener_count(&self) -> usize {
        self.sinks.read().len()
    }
}

/// 订阅句柄，丢弃或调用 [`ListenerHandle::unsubscribe`] 即取消订阅
#[must_use = "丢弃句柄会立即取消订阅"]
pub struct ListenerHandle {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl ListenerHandle {
    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }

    /// 放弃句柄但保持订阅，直到总线销毁
    pub fn detach(mut self) {
        self.remove = None;
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

/// 通知总线
///
/// 必须在 tokio 运行时内创建（会启动派发任务）。
pub struct NotifyBus {
    enabled: bool,
    conversation: Channel<ConversationEvent>,
    message: Channel<MessageEvent>,
    user_info: Channel<UserInfoEvent>,
}

impl NotifyBus {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            conversation: Channel::new("conversation"),
            message: Channel::new("message"),
            user_info: Channel::new("user_info"),
        }
    }

    pub fn subscribe_conversation(&self, listener: Arc<dyn ConversationListener>) -> ListenerHandle {
        self.conversation.subscribe(Arc::new(ConversationSink(listener)))
    }

    pub fn subscribe_message(&self, listener: Arc<dyn MessageListener>) -> ListenerHandle {
        self.message.subscribe(Arc::new(MessageSink(listener)))
    }

    pub fn subscribe_user_info(&self, listener: Arc<dyn UserInfoListener>) -> ListenerHandle {
        self.user_info.subscribe(Arc::new(UserInfoSink(listener)))
    }

    pub(crate) fn publish_conversation(&self, event: ConversationEvent) {
        if self.enabled {
            self.conversation.publish(event);
        }
    }

    pub(crate) fn publish_message(&self, event: MessageEvent) {
        if self.enabled {
            self.message.publish(event);
        }
    }

    pub(crate) fn publish_user_info(&self, event: UserInfoEvent) {
        if self.enabled {
            self.user_info.publish(event);
        }
    }

    /// 各通道的监听器数量：(会话, 消息, 用户资料)
    pub fn listener_counts(&self) -> (usize, usize, usize) {
        (
            self.conversation.listener_count(),
            self.message.listener_count(),
            self.user_info.listener_count(),
        )
    }
}
