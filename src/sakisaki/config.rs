use serde::{Deserialize, Serialize};
use std::time::Duration;

/// `[sakisaki]` 配置块
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SakiConfig {
    /// 单次抓取成功概率
    pub success_prob: f64,
    /// 失败提示中展示的概率上限
    pub max_fail_prob: f64,
    /// 是否启用排行榜指令
    pub enable_rank_command: bool,
    /// 冷却窗口内允许的抓取次数
    pub game_trigger_limit: u32,
    pub game_cooldown_secs: u64,
    /// 冷却窗口内允许的排行榜查询次数
    pub rank_query_limit: u32,
    pub rank_cooldown_secs: u64,
    /// 全局防抖间隔，用于吞掉平台重复投递的消息
    pub debounce_millis: u64,
    /// 回复消息自动撤回的延时，0 表示不撤回
    pub retract_delay_secs: u64,
    /// 抓取成功的回复不撤回
    pub dont_retract_on_success: bool,
    /// 触发关键词（不区分大小写，包含即触发）
    pub trigger_keywords: Vec<String>,
    pub rank_command: String,
    /// 清空排行榜，仅管理员可用
    pub reset_command: String,
    /// 奖励图片地址，首次加载时下载并缓存
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reward_image_url: Option<String>,
    /// 冷却表过期清理间隔
    pub sweep_interval_secs: u64,
}

impl Default for SakiConfig {
    fn default() -> Self {
        Self {
            success_prob: 0.25,
            max_fail_prob: 0.95,
            enable_rank_command: true,
            game_trigger_limit: 3,
            game_cooldown_secs: 60,
            rank_query_limit: 1,
            rank_cooldown_secs: 60,
            debounce_millis: 1000,
            retract_delay_secs: 10,
            dont_retract_on_success: true,
            trigger_keywords: vec!["saki".to_string(), "小祥".to_string()],
            rank_command: "saki排行".to_string(),
            reset_command: "saki清空".to_string(),
            reward_image_url: None,
            sweep_interval_secs: 300,
        }
    }
}

/// 概率裁剪的结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Clamped {
    Unchanged(f64),
    Adjusted { from: f64, to: f64 },
}

impl Clamped {
    pub fn value(self) -> f64 {
        match self {
            Clamped::Unchanged(v) => v,
            Clamped::Adjusted { to, .. } => to,
        }
    }
}

/// 把概率裁剪进 [0, 1]，NaN 视为 0
pub fn clamp_probability(value: f64) -> Clamped {
    if value.is_nan() {
        return Clamped::Adjusted { from: value, to: 0.0 };
    }
    let clamped = value.clamp(0.0, 1.0);
    if clamped == value {
        Clamped::Unchanged(value)
    } else {
        Clamped::Adjusted { from: value, to: clamped }
    }
}

impl SakiConfig {
    /// 规范化配置：裁剪概率，关键词转小写并去掉空词。
    /// 返回被调整过的字段，交给调用方记录日志。
    pub fn normalized(mut self) -> (Self, Vec<(&'static str, Clamped)>) {
        let mut adjusted = Vec::new();

        for (field, slot) in [
            ("success_prob", &mut self.success_prob),
            ("max_fail_prob", &mut self.max_fail_prob),
        ] {
            let result = clamp_probability(*slot);
            if let Clamped::Adjusted { .. } = result {
                adjusted.push((field, result));
            }
            *slot = result.value();
        }

        self.trigger_keywords = self
            .trigger_keywords
            .iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();

        (self, adjusted)
    }

    pub fn game_window(&self) -> Duration {
        Duration::from_secs(self.game_cooldown_secs)
    }

    pub fn rank_window(&self) -> Duration {
        Duration::from_secs(self.rank_cooldown_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_millis)
    }

    /// 撤回延时，未启用时为 None
    pub fn retract_delay(&self) -> Option<Duration> {
        (self.retract_delay_secs > 0).then(|| Duration::from_secs(self.retract_delay_secs))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    /// 消息是否包含任意触发词
    pub fn is_trigger(&self, text: &str) -> bool {
        let text = text.to_lowercase();
        self.trigger_keywords.iter().any(|k| text.contains(k.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probabilities_are_clamped() {
        let cfg = SakiConfig {
            success_prob: 1.7,
            max_fail_prob: -0.2,
            ..Default::default()
        };
        let (cfg, adjusted) = cfg.normalized();

        assert_eq!(cfg.success_prob, 1.0);
        assert_eq!(cfg.max_fail_prob, 0.0);
        assert_eq!(
            adjusted,
            vec![
                ("success_prob", Clamped::Adjusted { from: 1.7, to: 1.0 }),
                ("max_fail_prob", Clamped::Adjusted { from: -0.2, to: 0.0 }),
            ]
        );
    }

    #[test]
    fn test_defaults_need_no_adjustment() {
        let (cfg, adjusted) = SakiConfig::default().normalized();
        assert!(adjusted.is_empty());
        assert_eq!(cfg.success_prob, 0.25);
    }

    #[test]
    fn test_nan_probability_becomes_zero() {
        assert_eq!(clamp_probability(f64::NAN).value(), 0.0);
        assert_eq!(clamp_probability(0.5), Clamped::Unchanged(0.5));
    }

    #[test]
    fn test_keyword_match_is_case_insensitive() {
        let cfg = SakiConfig {
            trigger_keywords: vec![" SAKI ".to_string(), "".to_string()],
            ..Default::default()
        };
        let (cfg, _) = cfg.normalized();

        assert_eq!(cfg.trigger_keywords, vec!["saki".to_string()]);
        assert!(cfg.is_trigger("hello Saki!"));
        assert!(!cfg.is_trigger("hello"));
    }

    #[test]
    fn test_partial_toml_falls_back_to_defaults() {
        let cfg: SakiConfig = toml::from_str("success_prob = 0.5\nretract_delay_secs = 0").unwrap();
        assert_eq!(cfg.success_prob, 0.5);
        assert_eq!(cfg.game_trigger_limit, 3);
        assert_eq!(cfg.retract_delay(), None);
    }
}
