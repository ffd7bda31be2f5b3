//! 冷却与限流
//!
//! 两个独立的固定窗口计数器（抓取 / 排行榜查询）加一个全局防抖时间戳。
//! 窗口只在窗口过期后的下一次触发时重置，而不是由计时器驱动。

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// 时间来源，测试中替换为 [`ManualClock`]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// 手动拨动的时钟
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
    }

    pub fn advance_secs(&self, secs: u64) {
        self.advance(Duration::from_secs(secs));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// 限流判定结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// 放行，`count` 为当前窗口内的第几次
    Allowed { count: u32 },
    /// 拒绝，需要再等待 `wait_secs` 秒（四舍五入）
    Denied { wait_secs: u64 },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed { .. })
    }
}

#[derive(Debug, Clone, Copy)]
struct WindowEntry {
    window_start: DateTime<Utc>,
    count: u32,
}

/// 按用户计数的固定窗口限流器
#[derive(Debug)]
pub struct WindowLimiter {
    window: Duration,
    limit: u32,
    entries: HashMap<String, WindowEntry>,
}

impl WindowLimiter {
    /// `limit` 为 0 时按 1 处理
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            window,
            limit: limit.max(1),
            entries: HashMap::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// 记录一次触发并给出判定
    pub fn check(&mut self, user_id: &str, now: DateTime<Utc>) -> Admission {
        let window = self.window;
        let limit = self.limit;

        let Some(entry) = self.entries.get_mut(user_id) else {
            self.entries.insert(
                user_id.to_string(),
                WindowEntry {
                    window_start: now,
                    count: 1,
                },
            );
            return Admission::Allowed { count: 1 };
        };

        let elapsed = (now - entry.window_start).to_std().unwrap_or(Duration::ZERO);
        if elapsed >= window {
            *entry = WindowEntry {
                window_start: now,
                count: 1,
            };
            Admission::Allowed { count: 1 }
        } else if entry.count < limit {
            entry.count += 1;
            Admission::Allowed { count: entry.count }
        } else {
            let remaining = window - elapsed;
            Admission::Denied {
                wait_secs: remaining.as_secs_f64().round() as u64,
            }
        }
    }

    /// 清理窗口早已过期的条目，返回清理数量
    pub fn sweep(&mut self, now: DateTime<Utc>, older_than: Duration) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| {
            (now - e.window_start)
                .to_std()
                .map(|age| age < older_than)
                .unwrap_or(true)
        });
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 插件使用的限流服务：抓取限流、查询限流与全局防抖
pub struct RateLimiter {
    clock: Arc<dyn Clock>,
    game: WindowLimiter,
    rank: WindowLimiter,
    debounce: Duration,
    last_global: Option<DateTime<Utc>>,
}

impl RateLimiter {
    pub fn new(
        clock: Arc<dyn Clock>,
        game: WindowLimiter,
        rank: WindowLimiter,
        debounce: Duration,
    ) -> Self {
        Self {
            clock,
            game,
            rank,
            debounce,
            last_global: None,
        }
    }

    /// 全局防抖：距上一次放行不足 `debounce` 时返回 false，消息应被静默丢弃。
    /// 只有放行的消息会刷新时间戳。
    pub fn pass_debounce(&mut self) -> bool {
        let now = self.clock.now();
        if let Some(last) = self.last_global {
            let since = (now - last).to_std().unwrap_or(Duration::ZERO);
            if since < self.debounce {
                return false;
            }
        }
        self.last_global = Some(now);
        true
    }

    pub fn check_game(&mut self, user_id: &str) -> Admission {
        let now = self.clock.now();
        self.game.check(user_id, now)
    }

    pub fn check_rank(&mut self, user_id: &str) -> Admission {
        let now = self.clock.now();
        self.rank.check(user_id, now)
    }

    /// 清理两个表中超过最长窗口的条目
    pub fn sweep(&mut self) -> usize {
        let now = self.clock.now();
        let horizon = self.game.window().max(self.rank.window());
        self.game.sweep(now, horizon) + self.rank.sweep(now, horizon)
    }

    /// 当前记录的用户条目数（抓取, 查询）
    pub fn tracked(&self) -> (usize, usize) {
        (self.game.len(), self.rank.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap(),
        ))
    }

    fn limiter(clock: Arc<ManualClock>) -> RateLimiter {
        RateLimiter::new(
            clock,
            WindowLimiter::new(3, Duration::from_secs(60)),
            WindowLimiter::new(1, Duration::from_secs(60)),
            Duration::from_secs(1),
        )
    }

    #[test]
    fn test_fourth_trigger_in_window_is_denied() {
        let clock = clock();
        let mut limiter = limiter(clock.clone());

        assert_eq!(limiter.check_game("u1"), Admission::Allowed { count: 1 });
        clock.advance_secs(1);
        assert_eq!(limiter.check_game("u1"), Admission::Allowed { count: 2 });
        clock.advance_secs(1);
        assert_eq!(limiter.check_game("u1"), Admission::Allowed { count: 3 });
        clock.advance_secs(1);
        assert_eq!(limiter.check_game("u1"), Admission::Denied { wait_secs: 57 });
    }

    #[test]
    fn test_window_resets_after_expiry() {
        let clock = clock();
        let mut limiter = limiter(clock.clone());

        for _ in 0..3 {
            assert!(limiter.check_game("u1").is_allowed());
            clock.advance_secs(1);
        }
        // 此时距窗口起点 3 秒，再拨到 t0 + 61
        clock.advance_secs(58);
        assert_eq!(limiter.check_game("u1"), Admission::Allowed { count: 1 });
        assert_eq!(limiter.check_game("u1"), Admission::Allowed { count: 2 });
    }

    #[test]
    fn test_window_start_is_not_refreshed_by_allowed_triggers() {
        let clock = clock();
        let mut limiter = limiter(clock.clone());

        assert!(limiter.check_game("u1").is_allowed());
        clock.advance_secs(50);
        assert!(limiter.check_game("u1").is_allowed());
        assert!(limiter.check_game("u1").is_allowed());
        assert_eq!(limiter.check_game("u1"), Admission::Denied { wait_secs: 10 });
        clock.advance_secs(10);
        assert_eq!(limiter.check_game("u1"), Admission::Allowed { count: 1 });
    }

    #[test]
    fn test_wait_is_rounded_to_nearest_second() {
        let clock = clock();
        let mut limiter = limiter(clock.clone());

        assert!(limiter.check_rank("u1").is_allowed());
        clock.advance(Duration::from_millis(20_300));
        assert_eq!(limiter.check_rank("u1"), Admission::Denied { wait_secs: 40 });
        clock.advance(Duration::from_millis(300));
        assert_eq!(limiter.check_rank("u1"), Admission::Denied { wait_secs: 39 });
        clock.advance(Duration::from_millis(1_000));
        assert_eq!(limiter.check_rank("u1"), Admission::Denied { wait_secs: 38 });
    }

    #[test]
    fn test_users_and_paths_are_independent() {
        let clock = clock();
        let mut limiter = limiter(clock.clone());

        assert!(limiter.check_rank("u1").is_allowed());
        assert!(!limiter.check_rank("u1").is_allowed());
        assert!(limiter.check_rank("u2").is_allowed());
        assert!(limiter.check_game("u1").is_allowed());
    }

    #[test]
    fn test_zero_limit_behaves_as_one() {
        let mut window = WindowLimiter::new(0, Duration::from_secs(10));
        let now = Utc::now();
        assert!(window.check("u", now).is_allowed());
        assert!(!window.check("u", now).is_allowed());
    }

    #[test]
    fn test_debounce_drops_near_simultaneous_triggers() {
        let clock = clock();
        let mut limiter = limiter(clock.clone());

        assert!(limiter.pass_debounce());
        clock.advance(Duration::from_millis(400));
        assert!(!limiter.pass_debounce());
        // 被丢弃的消息不刷新时间戳
        clock.advance(Duration::from_millis(600));
        assert!(limiter.pass_debounce());
    }

    #[test]
    fn test_sweep_evicts_only_expired_entries() {
        let clock = clock();
        let mut limiter = limiter(clock.clone());

        limiter.check_game("old");
        limiter.check_rank("old");
        clock.advance_secs(45);
        limiter.check_game("fresh");
        clock.advance_secs(20);

        assert_eq!(limiter.tracked(), (2, 1));
        assert_eq!(limiter.sweep(), 2);
        assert_eq!(limiter.tracked(), (1, 0));
        // 被清理的用户重新开始计数
        assert_eq!(limiter.check_game("old"), Admission::Allowed { count: 1 });
    }
}
