// adapter_console.rs
//
// 控制台适配器：stdin 每行一条消息，回复渲染到 stdout。
// 用于本地运行和手动验证，消息模型与正式平台一致。

use caidan::prelude::*;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncBufReadExt, BufReader};

pub struct ConsoleAdapter {
    id: String,
    msg_seq: AtomicU64,
}

impl Default for ConsoleAdapter {
    fn default() -> Self {
        Self {
            id: "console-01".to_string(),
            msg_seq: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl Adapter for ConsoleAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        "Console Adapter"
    }

    async fn start(&self, ctx: AdapterContext) -> BotResult<()> {
        let mock_user = User {
            id: "console_user".to_string(),
            name: Some("Developer".to_string()),
            nick: Some("Dev".to_string()),
            is_bot: Some(false),
        };

        let mock_channel = Channel {
            id: "main_terminal".to_string(),
            channel_type: ChannelType::Text,
            name: Some("Terminal".to_string()),
        };

        let event_tx = ctx.event_tx.clone();
        let adapter_id = self.id.to_string();
        let mut sys_rx = ctx.system_rx.resubscribe();

        tokio::spawn(async move {
            let stdin = tokio::io::stdin();
            let mut reader = BufReader::new(stdin).lines();
            let mut counter = 0u64;

            // --- 生命周期：创建登录信息 ---
            let mut login_info = Login::new("console", &adapter_id);
            login_info.user = Some(mock_user.clone());
            login_info.status = LoginStatus::Online;

            if let Err(e) = event_tx.send(Event::login_added(login_info.clone())).await {
                eprintln!("ConsoleAdapter 发送 login-added 失败: {}", e);
                return;
            }

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

                                counter += 1;
                                let msg_id = format!("msg_{}", counter);
                                let mut msg = Message::new(msg_id, content);
                                msg.user = Some(mock_user.clone());
                                msg.channel = Some(mock_channel.clone());

                                let mut event = Event::message_created(msg);
                                event.login = Some(login_info.clone());

                                if let Err(e) = event_tx.send(event).await {
                                    eprintln!("发送事件失败: {}", e);
                                    break;
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                eprintln!("读取输入错误: {}", e);
                                break;
                            }
                        }
                    }
                }
            }

            // --- 生命周期：清理登录信息 ---
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

        // 渲染到控制台：文本保持原样，图片显示为路径
        let elements = message_elements::parse(content);
        let rendered = render_elements(&elements);
        println!("\x1b[36m[Bot -> {}]\x1b[0m {}", channel_id, rendered);

        let bot_user = User {
            id: self.id.clone(),
            name: Some("Caidan Bot".to_string()),
            nick: Some("Bot".to_string()),
            is_bot: Some(true),
        };

        let channel = Channel {
            id: channel_id.to_string(),
            channel_type: ChannelType::Text,
            name: Some("Terminal".to_string()),
        };

        let mut message = Message::new(msg_id, content);
        message.user = Some(bot_user);
        message.channel = Some(channel);

        Ok(vec![message])
    }
}

/// 把消息元素渲染为控制台可读文本
fn render_elements(elements: &[Element]) -> String {
    let mut out = String::new();
    for elem in elements {
        match elem {
            Element::Text(t) => out.push_str(t),
            Element::Break => out.push('\n'),
            Element::Image { src, .. } => {
                out.push_str(&format!("[图片: {}]", src));
            }
            other => out.push_str(&message_elements::to_plain_text(std::slice::from_ref(
                other,
            ))),
        }
    }
    out
}
