//! 香草小祥小游戏
//!
//! 消息包含触发词时掷一次骰子，成功则记入排行榜；
//! 支持排行榜查询、管理员清空，以及回复消息的延时撤回。

pub mod asset;
pub mod config;
pub mod game;
pub mod limiter;
pub mod retract;
pub mod store;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use tokio::sync::{Mutex, RwLock};

use crate::prelude::*;
use crate::scheduler::Scheduler;

use config::{Clamped, SakiConfig};
use game::{Odds, RollOutcome};
use limiter::{Admission, Clock, RateLimiter, SystemClock, WindowLimiter};
use retract::{ReplyKind, RetractPolicy, Retractor};
use store::{CounterStore, LeaderboardState, LoadOrigin};

const TARGET: &str = "SakiSaki";

pub const RANK_DISABLED: &str = "该群未启用排行榜功能。";
pub const RESET_DONE: &str = "🧹 香草小祥排行榜已清空。";
pub const RESET_DENIED: &str = "只有管理员才能清空排行榜哦。";
pub const REWARD_MISSING: &str = "（奖励图片暂时无法加载）";

/// 一条待发送的回复
#[derive(Debug, Clone, PartialEq)]
struct Reply {
    content: String,
    kind: ReplyKind,
}

impl Reply {
    fn status(text: impl AsRef<str>) -> Self {
        Self {
            content: MessageBuilder::new().text(text).build(),
            kind: ReplyKind::Status,
        }
    }
}

/// 消息被识别成的请求
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Request {
    Catch,
    Rank,
    Reset,
}

fn classify(cfg: &SakiConfig, prefixes: &[String], text: &str) -> Option<Request> {
    if command::is_command(text, prefixes, &cfg.rank_command) {
        Some(Request::Rank)
    } else if command::is_command(text, prefixes, &cfg.reset_command) {
        Some(Request::Reset)
    } else if cfg.is_trigger(text) {
        Some(Request::Catch)
    } else {
        None
    }
}

/// 需要串行访问的可变状态
struct Session {
    limiter: RateLimiter,
    state: LeaderboardState,
}

/// 插件加载后才存在的运行时
struct Runtime {
    config: SakiConfig,
    session: Mutex<Session>,
    store: CounterStore,
    retractor: Retractor,
    housekeeping: Scheduler,
    reward_image: Option<PathBuf>,
}

pub struct SakiSakiPlugin {
    clock: Arc<dyn Clock>,
    runtime: RwLock<Option<Arc<Runtime>>>,
}

impl SakiSakiPlugin {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// 指定限流使用的时钟
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            runtime: RwLock::new(None),
        }
    }

    async fn runtime(&self) -> Option<Arc<Runtime>> {
        self.runtime.read().await.clone()
    }

    fn build_limiter(&self, cfg: &SakiConfig) -> RateLimiter {
        RateLimiter::new(
            self.clock.clone(),
            WindowLimiter::new(cfg.game_trigger_limit, cfg.game_window()),
            WindowLimiter::new(cfg.rank_query_limit, cfg.rank_window()),
            cfg.debounce(),
        )
    }

    /// 读取并规范化插件配置，调整过的字段写日志
    async fn load_config(ctx: &PluginContext) -> SakiConfig {
        let raw: SakiConfig = ctx.plugin_config().await.unwrap_or_default();
        let (cfg, adjusted) = raw.normalized();
        for (field, clamp) in adjusted {
            if let Clamped::Adjusted { from, to } = clamp {
                warn!(target: TARGET, "配置项 {} = {} 超出 [0, 1]，已调整为 {}", field, from, to);
            }
        }
        if cfg.max_fail_prob < cfg.success_prob {
            warn!(
                target: TARGET,
                "max_fail_prob ({}) 小于 success_prob ({})，失败提示中的概率将低于成功概率",
                cfg.max_fail_prob,
                cfg.success_prob
            );
        }
        cfg
    }

    /// 处理一条已识别的请求，返回需要发送的回复
    async fn handle(
        &self,
        ctx: &PluginContext,
        runtime: &Runtime,
        request: Request,
        user_id: &str,
        user_name: &str,
    ) -> Option<Reply> {
        // 管理员判定在锁外完成
        let is_admin = match request {
            Request::Reset => ctx.is_admin(user_id).await,
            _ => false,
        };

        let mut session = runtime.session.lock().await;

        if !session.limiter.pass_debounce() {
            debug!(target: TARGET, "防抖窗口内的重复消息，已丢弃 (user: {})", user_id);
            return None;
        }

        match request {
            Request::Rank => {
                if !runtime.config.enable_rank_command {
                    return Some(Reply::status(RANK_DISABLED));
                }
                match session.limiter.check_rank(user_id) {
                    Admission::Denied { wait_secs } => Some(Reply::status(format!(
                        "⏳ 排行榜查询太频繁啦，请 {} 秒后再试。",
                        wait_secs
                    ))),
                    Admission::Allowed { .. } => {
                        Some(Reply::status(game::render_leaderboard(&session.state)))
                    }
                }
            }

            Request::Reset => {
                if !is_admin {
                    info!(target: TARGET, "非管理员 {} 尝试清空排行榜", user_id);
                    return Some(Reply::status(RESET_DENIED));
                }
                session.state = LeaderboardState::default();
                if let Err(e) = runtime.store.reset().await {
                    error!(target: TARGET, "清空排行榜写盘失败: {:#}", e);
                }
                info!(target: TARGET, "管理员 {} 清空了排行榜", user_id);
                Some(Reply::status(RESET_DONE))
            }

            Request::Catch => {
                if let Admission::Denied { wait_secs } = session.limiter.check_game(user_id) {
                    return Some(Reply::status(format!(
                        "⏳ 你玩得太频繁啦，请 {} 秒后再来找小祥吧。",
                        wait_secs
                    )));
                }

                let odds = Odds {
                    success_prob: runtime.config.success_prob,
                    max_fail_prob: runtime.config.max_fail_prob,
                };
                let outcome = game::roll(
                    &mut session.state,
                    user_id,
                    user_name,
                    odds,
                    &mut rand::rng(),
                );

                match &outcome {
                    RollOutcome::Success { play_count, .. } => {
                        info!(target: TARGET, "{} ({}) 抓到了小祥，第 {} 位", user_name, user_id, play_count);
                        if let Err(e) = runtime.store.save(&session.state).await {
                            error!(target: TARGET, "保存排行榜失败，本次结果仅保留在内存中: {:#}", e);
                        }
                    }
                    RollOutcome::Failure { .. } => {
                        debug!(target: TARGET, "{} ({}) 没抓到", user_name, user_id);
                    }
                }

                let wants_image = runtime.config.reward_image_url.is_some();
                Some(catch_reply(
                    &outcome,
                    wants_image,
                    runtime.reward_image.as_deref(),
                ))
            }
        }
    }
}

/// 抓取结果的回复；配置了奖励图片但不可用时以文字说明代替
fn catch_reply(outcome: &RollOutcome, wants_image: bool, image: Option<&Path>) -> Reply {
    if !outcome.is_success() {
        return Reply {
            content: MessageBuilder::new().text(outcome.message()).build(),
            kind: ReplyKind::Failure,
        };
    }

    let mut builder = MessageBuilder::new().text(outcome.message());
    match (wants_image, image) {
        (true, Some(path)) => builder = builder.image(asset::file_url(path)),
        (true, None) => builder = builder.br().text(REWARD_MISSING),
        (false, _) => {}
    }

    Reply {
        content: builder.build(),
        kind: ReplyKind::Success,
    }
}

impl Default for SakiSakiPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for SakiSakiPlugin {
    fn id(&self) -> &str {
        "sakisaki"
    }

    fn name(&self) -> &str {
        "SakiSaki"
    }

    fn description(&self) -> &str {
        "香草小祥小游戏：关键词触发抓取、排行榜与自动撤回"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn default_config(&self) -> Option<toml::Value> {
        toml::Value::try_from(SakiConfig::default()).ok()
    }

    async fn on_load(&self, ctx: &PluginContext) -> BotResult<()> {
        let cfg = Self::load_config(ctx).await;
        let data_dir = ctx.ensure_data_dir().await?;

        let store = CounterStore::in_dir(&data_dir);
        let loaded = store.load().await;
        match &loaded.origin {
            LoadOrigin::File => info!(
                target: TARGET,
                "已加载排行榜：{} 位玩家，共 {} 次",
                loaded.state.players.len(),
                loaded.state.play_count
            ),
            LoadOrigin::Missing => info!(target: TARGET, "未找到排行榜文件，从零开始"),
            LoadOrigin::Corrupt(_) => warn!(target: TARGET, "排行榜文件损坏，已按空排行榜处理"),
        }

        let reward_image = match &cfg.reward_image_url {
            Some(url) => match asset::ensure_reward_image(url, &data_dir).await {
                Ok(path) => Some(path),
                Err(e) => {
                    warn!(target: TARGET, "奖励图片不可用，成功时仅发送文字: {:#}", e);
                    None
                }
            },
            None => None,
        };

        let sweep_interval = cfg.sweep_interval();
        let runtime = Arc::new(Runtime {
            session: Mutex::new(Session {
                limiter: self.build_limiter(&cfg),
                state: loaded.state,
            }),
            config: cfg,
            store,
            retractor: Retractor::new(),
            housekeeping: Scheduler::new(),
            reward_image,
        });

        let weak: Weak<Runtime> = Arc::downgrade(&runtime);
        runtime.housekeeping.add_interval(sweep_interval, move || {
            let weak = weak.clone();
            async move {
                if let Some(runtime) = weak.upgrade() {
                    let evicted = runtime.session.lock().await.limiter.sweep();
                    if evicted > 0 {
                        debug!(target: TARGET, "清理了 {} 条过期冷却记录", evicted);
                    }
                }
            }
        });

        *self.runtime.write().await = Some(runtime);
        Ok(())
    }

    async fn on_unload(&self, _ctx: &PluginContext) -> BotResult<()> {
        if let Some(runtime) = self.runtime.write().await.take() {
            runtime.housekeeping.shutdown();
            runtime.retractor.shutdown();
        }
        Ok(())
    }

    async fn on_event(&self, ctx: &PluginContext, event: &Event) -> BotResult<EventResult> {
        if event.event_type != event_types::MESSAGE_CREATED || event.is_from_bot() {
            return Ok(EventResult::Continue);
        }
        let (Some(content), Some(user_id)) = (event.content(), event.sender_id()) else {
            return Ok(EventResult::Continue);
        };
        let Some(runtime) = self.runtime().await else {
            return Ok(EventResult::Continue);
        };

        // 提及、图片等元素不参与匹配
        let text = message_elements::text_content(&message_elements::parse(content));
        let prefixes = ctx.config().await.core.cmd_prefix;
        let Some(request) = classify(&runtime.config, &prefixes, &text) else {
            return Ok(EventResult::Continue);
        };
        let policy = RetractPolicy {
            delay: runtime.config.retract_delay(),
            keep_success: runtime.config.dont_retract_on_success,
        };

        let user_name = event.sender_name().unwrap_or(user_id);
        let Some(reply) = self
            .handle(ctx, &runtime, request, user_id, user_name)
            .await
        else {
            return Ok(EventResult::Stop);
        };

        let sent = match ctx.reply(event, &reply.content).await {
            Ok(sent) => sent,
            Err(e) => {
                warn!(target: TARGET, "发送回复失败: {}", e);
                return Ok(EventResult::Stop);
            }
        };

        if let Some(delay) = policy.delay_for(reply.kind)
            && let (Some(adapter_id), Some(channel_id)) = (event.adapter(), event.channel_id())
            && let Some(adapter) = ctx.get_adapter(adapter_id).await
        {
            runtime
                .retractor
                .schedule_retract(adapter, channel_id, &sent, delay);
        }

        Ok(EventResult::Stop)
    }
}
