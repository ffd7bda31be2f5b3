use sakisaki::message_elements::{parse, to_plain_text};
use sakisaki::prelude::*;
use sakisaki::{debug, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{RwLock, mpsc};

/// 终端适配器：标准输入作为群消息，回复打印到标准输出。
///
/// 输入 `/as <id>` 切换当前发言用户，`/exit` 退出。
pub struct ConsoleAdapter {
    id: String,
    msg_seq: AtomicU64,
    event_tx: RwLock<Option<mpsc::Sender<Event>>>,
}

impl Default for ConsoleAdapter {
    fn default() -> Self {
        Self {
            id: "console-01".to_string(),
            msg_seq: AtomicU64::new(0),
            event_tx: RwLock::new(None),
        }
    }
}

fn console_user(id: &str) -> User {
    User {
        id: id.to_string(),
        name: Some(id.to_string()),
        nick: None,
        is_bot: Some(false),
    }
}

#[async_trait]
impl Adapter for ConsoleAdapter {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn id(&self) -> &str {
        &self.id
    }
    fn name(&self) -> &str {
        "Console Adapter"
    }
    fn platforms(&self) -> Vec<&str> {
        vec!["console"]
    }

    async fn start(&self, ctx: AdapterContext) -> BotResult<()> {
        {
            let mut tx = self.event_tx.write().await;
            *tx = Some(ctx.event_tx.clone());
        }

        let channel = Channel {
            id: "main_terminal".to_string(),
            name: Some("Terminal".to_string()),
        };

        let event_tx = ctx.event_tx.clone();
        let adapter_id = self.id.to_string();
        let mut sys_rx = ctx.system_rx.resubscribe();

        tokio::spawn(async move {
            let stdin = tokio::io::stdin();
            let mut reader = BufReader::new(stdin).lines();
            let mut counter = 0u64;
            let mut user = console_user("console_user");

            let mut login_info = Login::new("console", &adapter_id);
            login_info.status = LoginStatus::Online;

            if let Err(e) = event_tx.send(Event::login_added(login_info.clone())).await {
                warn!(target: "Console", "发送 login-added 失败: {}", e);
                return;
            }
            info!(target: "Console", "当前用户: {}（输入 /as <id> 切换，/exit 退出）", user.id);

            loop {
                tokio::select! {
                    Ok(SystemSignal::Shutdown) = sys_rx.recv() => {
                        break;
                    }
                    line_result = reader.next_line() => {
                        match line_result {
                            Ok(Some(text)) => {
                                let content = text.trim().to_string();
                                if content.is_empty() { continue; }

                                if content == "/exit" {
                                    break;
                                }

                                if let Some(id) = content.strip_prefix("/as ") {
                                    user = console_user(id.trim());
                                    info!(target: "Console", "已切换为用户: {}", user.id);
                                    continue;
                                }

                                counter += 1;
                                let encoded = MessageBuilder::new().text(&content).build();
                                let mut msg = Message::new(format!("msg_{}", counter), encoded);
                                msg.user = Some(user.clone());
                                msg.channel = Some(channel.clone());

                                let event = Event::message_created(msg).with_login(login_info.clone());
                                if let Err(e) = event_tx.send(event).await {
                                    warn!(target: "Console", "发送事件失败: {}", e);
                                    break;
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                warn!(target: "Console", "读取输入错误: {}", e);
                                break;
                            }
                        }
                    }
                }
            }

            login_info.status = LoginStatus::Offline;
            let _ = event_tx.send(Event::login_removed(login_info)).await;
        });

        Ok(())
    }

    async fn stop(&self) -> BotResult<()> {
        Ok(())
    }

    async fn send_message(&self, channel_id: &str, content: &str) -> BotResult<Vec<Message>> {
        let seq = self.msg_seq.fetch_add(1, Ordering::Relaxed);
        let msg_id = format!("reply_{}", seq);

        println!("[{}] {}", msg_id, to_plain_text(&parse(content)));

        let mut message = Message::new(msg_id, content);
        message.user = Some(User {
            id: self.id.clone(),
            name: Some("SakiSaki".to_string()),
            nick: None,
            is_bot: Some(true),
        });
        message.channel = Some(Channel::new(channel_id));

        // 回显为事件，插件会忽略机器人自己的消息
        let event = Event::message_created(message.clone()).with_login(Login::new("console", &self.id));
        if let Some(tx) = &*self.event_tx.read().await
            && let Err(e) = tx.send(event).await
        {
            debug!(target: "Console", "回显事件发送失败: {}", e);
        }

        Ok(vec![message])
    }

    async fn delete_message(&self, _channel_id: &str, message_id: &str) -> BotResult<()> {
        println!("[{}] (已撤回)", message_id);
        Ok(())
    }
}
