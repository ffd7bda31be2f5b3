use std::sync::Arc;
use std::time::Duration;

use crate::scheduler::{Scheduler, TaskId};
use crate::{Adapter, Message};

/// 回复的种类，决定是否需要撤回
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    /// 抓取成功
    Success,
    /// 抓取失败
    Failure,
    /// 排行榜、冷却提示、权限提示等
    Status,
}

/// 延时撤回策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetractPolicy {
    pub delay: Option<Duration>,
    pub keep_success: bool,
}

impl RetractPolicy {
    /// 该类回复需要在多久之后撤回
    pub fn delay_for(&self, kind: ReplyKind) -> Option<Duration> {
        if kind == ReplyKind::Success && self.keep_success {
            return None;
        }
        self.delay
    }
}

/// 延时撤回机器人自己发出的消息
pub struct Retractor {
    scheduler: Scheduler,
}

impl Retractor {
    pub fn new() -> Self {
        Self {
            scheduler: Scheduler::new(),
        }
    }

    /// 在 `delay` 之后撤回 `sent` 中的第一条消息。
    /// 发送结果里没有可用的消息 ID 时跳过，只记录警告。
    pub fn schedule_retract(
        &self,
        adapter: Arc<dyn Adapter>,
        channel_id: &str,
        sent: &[Message],
        delay: Duration,
    ) -> Option<TaskId> {
        let Some(message_id) = sent.first().map(|m| m.id.clone()).filter(|id| !id.is_empty())
        else {
            warn!(target: "SakiSaki/Retract", "发送结果中没有消息 ID，跳过撤回");
            return None;
        };

        let channel_id = channel_id.to_string();
        let id = self.scheduler.add_delayed(delay, async move {
            match adapter.delete_message(&channel_id, &message_id).await {
                Ok(()) => {
                    debug!(target: "SakiSaki/Retract", "已撤回消息 {}", message_id);
                }
                Err(e) => {
                    warn!(target: "SakiSaki/Retract", "撤回消息 {} 失败: {}", message_id, e);
                }
            }
        });
        Some(id)
    }

    /// 取消一条尚未执行的撤回
    pub fn cancel(&self, id: TaskId) -> bool {
        self.scheduler.remove(id)
    }

    pub fn pending(&self) -> usize {
        self.scheduler.pending()
    }

    /// 取消所有待执行的撤回
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }
}

impl Default for Retractor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{AdapterContext, BotResult};
    use async_trait::async_trait;
    use std::any::Any;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::time::sleep;

    /// 记录收发的内存适配器
    pub(crate) struct MockAdapter {
        pub sent: Mutex<Vec<(String, String)>>,
        pub deleted: Mutex<Vec<String>>,
        pub fail_delete: bool,
        pub return_ids: bool,
        seq: AtomicU64,
    }

    impl MockAdapter {
        pub(crate) const ID: &'static str = "mock";

        pub(crate) fn new() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                deleted: Mutex::new(Vec::new()),
                fail_delete: false,
                return_ids: true,
                seq: AtomicU64::new(0),
            }
        }

        pub(crate) fn sent_texts(&self) -> Vec<String> {
            self.sent.lock().unwrap().iter().map(|(_, c)| c.clone()).collect()
        }

        pub(crate) fn deleted_ids(&self) -> Vec<String> {
            self.deleted.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Adapter for MockAdapter {
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn id(&self) -> &str {
            Self::ID
        }
        fn name(&self) -> &str {
            "Mock Adapter"
        }
        fn platforms(&self) -> Vec<&str> {
            vec!["mock"]
        }

        async fn start(&self, _ctx: AdapterContext) -> BotResult<()> {
            Ok(())
        }

        async fn stop(&self) -> BotResult<()> {
            Ok(())
        }

        async fn send_message(&self, channel_id: &str, content: &str) -> BotResult<Vec<Message>> {
            let seq = self.seq.fetch_add(1, Ordering::SeqCst);
            self.sent
                .lock()
                .unwrap()
                .push((channel_id.to_string(), content.to_string()));
            if !self.return_ids {
                return Ok(Vec::new());
            }
            Ok(vec![Message::new(format!("sent_{}", seq), content)])
        }

        async fn delete_message(&self, _channel_id: &str, message_id: &str) -> BotResult<()> {
            if self.fail_delete {
                return Err("permission denied".into());
            }
            self.deleted.lock().unwrap().push(message_id.to_string());
            Ok(())
        }
    }

    #[test]
    fn test_policy_keeps_success_only_when_asked() {
        let policy = RetractPolicy {
            delay: Some(Duration::from_secs(10)),
            keep_success: true,
        };
        assert_eq!(policy.delay_for(ReplyKind::Success), None);
        assert_eq!(policy.delay_for(ReplyKind::Failure), Some(Duration::from_secs(10)));
        assert_eq!(policy.delay_for(ReplyKind::Status), Some(Duration::from_secs(10)));

        let off = RetractPolicy {
            delay: None,
            keep_success: false,
        };
        assert_eq!(off.delay_for(ReplyKind::Failure), None);
    }

    #[tokio::test]
    async fn test_retracts_after_delay() {
        let adapter = Arc::new(MockAdapter::new());
        let retractor = Retractor::new();
        let sent = vec![Message::new("m1", "hi")];

        let id = retractor.schedule_retract(adapter.clone(), "c", &sent, Duration::from_millis(50));
        assert!(id.is_some());
        assert!(adapter.deleted_ids().is_empty());

        sleep(Duration::from_millis(150)).await;
        assert_eq!(adapter.deleted_ids(), vec!["m1".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_message_id_is_skipped() {
        let adapter = Arc::new(MockAdapter::new());
        let retractor = Retractor::new();

        assert!(retractor.schedule_retract(adapter.clone(), "c", &[], Duration::ZERO).is_none());
        let blank = vec![Message::new("", "hi")];
        assert!(retractor.schedule_retract(adapter, "c", &blank, Duration::ZERO).is_none());
        assert_eq!(retractor.pending(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_retraction_never_deletes() {
        let adapter = Arc::new(MockAdapter::new());
        let retractor = Retractor::new();
        let sent = vec![Message::new("m1", "hi")];

        let id = retractor
            .schedule_retract(adapter.clone(), "c", &sent, Duration::from_millis(50))
            .unwrap();
        assert!(retractor.cancel(id));

        sleep(Duration::from_millis(150)).await;
        assert!(adapter.deleted_ids().is_empty());
    }

    #[tokio::test]
    async fn test_delete_failure_is_swallowed() {
        let mut adapter = MockAdapter::new();
        adapter.fail_delete = true;
        let adapter = Arc::new(adapter);
        let retractor = Retractor::new();
        let sent = vec![Message::new("m1", "hi")];

        retractor.schedule_retract(adapter.clone(), "c", &sent, Duration::from_millis(10));
        sleep(Duration::from_millis(100)).await;

        assert!(adapter.deleted_ids().is_empty());
        assert_eq!(retractor.pending(), 0);
    }
}
