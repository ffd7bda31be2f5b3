use rand::Rng;

use super::store::{LeaderboardState, PlayerRecord};

/// 排行榜最多展示的人数
pub const LEADERBOARD_SIZE: usize = 10;

pub const LEADERBOARD_TITLE: &str = "🏆 香草小祥排行榜：";
pub const NO_RECORDS: &str = "暂无玩家记录~";

/// 抓取概率参数，取值均已裁剪到 [0, 1]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Odds {
    pub success_prob: f64,
    pub max_fail_prob: f64,
}

/// 一次抓取的结果
#[derive(Debug, Clone, PartialEq)]
pub enum RollOutcome {
    Success {
        /// 本次成功后的全局成功次数，即“第几位”
        play_count: u64,
        /// 该玩家累计成功次数
        personal_count: u64,
    },
    Failure {
        /// 仅用于展示的失败概率百分比，保留两位小数
        fail_prob_pct: f64,
    },
}

impl RollOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RollOutcome::Success { .. })
    }

    pub fn message(&self) -> String {
        match self {
            RollOutcome::Success {
                play_count,
                personal_count,
            } => format!(
                "🎉 恭喜，你是本群第 {} 位三角初音！你已经与香草小祥玩耍了 {} 次！",
                play_count, personal_count
            ),
            RollOutcome::Failure { fail_prob_pct } => format!(
                "😢 你在概率为 {}% 时与小祥失之交臂，正在重新概率运算……",
                format_pct(*fail_prob_pct)
            ),
        }
    }
}

/// 整数百分比保留一位小数（72.0），其余按最短形式输出（61.25）
fn format_pct(pct: f64) -> String {
    if pct.fract() == 0.0 {
        format!("{:.1}", pct)
    } else {
        format!("{}", pct)
    }
}

/// 掷一次骰子。成功时更新状态，失败时状态不变。
pub fn roll<R: Rng>(
    state: &mut LeaderboardState,
    user_id: &str,
    name: &str,
    odds: Odds,
    rng: &mut R,
) -> RollOutcome {
    let r: f64 = rng.random();
    if r < odds.success_prob {
        state.play_count += 1;
        let record = state
            .players
            .entry(user_id.to_string())
            .or_insert_with(PlayerRecord::default);
        record.name = name.to_string();
        record.count += 1;

        RollOutcome::Success {
            play_count: state.play_count,
            personal_count: record.count,
        }
    } else {
        // 与上下界的先后顺序无关
        let u: f64 = rng.random();
        let lo = odds.success_prob;
        let hi = odds.max_fail_prob;
        let fail_prob = lo + (hi - lo) * u;

        RollOutcome::Failure {
            fail_prob_pct: (fail_prob * 100.0 * 100.0).round() / 100.0,
        }
    }
}

/// 排行榜中的一行
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankEntry<'a> {
    pub rank: usize,
    pub user_id: &'a str,
    pub name: &'a str,
    pub count: u64,
}

/// 按次数降序排列，次数相同按用户 ID 升序，取前 `limit` 名
pub fn leaderboard(state: &LeaderboardState, limit: usize) -> Vec<RankEntry<'_>> {
    let mut players: Vec<(&String, &PlayerRecord)> = state.players.iter().collect();
    players.sort_by(|a, b| b.1.count.cmp(&a.1.count).then_with(|| a.0.cmp(b.0)));

    players
        .into_iter()
        .take(limit)
        .enumerate()
        .map(|(i, (id, record))| RankEntry {
            rank: i + 1,
            user_id: id,
            name: &record.name,
            count: record.count,
        })
        .collect()
}

/// 渲染排行榜文本，没有玩家时返回固定提示
pub fn render_leaderboard(state: &LeaderboardState) -> String {
    let entries = leaderboard(state, LEADERBOARD_SIZE);
    if entries.is_empty() {
        return NO_RECORDS.to_string();
    }

    let mut msg = String::from(LEADERBOARD_TITLE);
    for entry in entries {
        msg.push_str(&format!("\n{}. {} - {} 次", entry.rank, entry.name, entry.count));
    }
    msg
}
