//! 截止时间状态机
//!
//! 为本身不支持截止时间的传输（WebSocket、QUIC流）模拟阻塞套接字的
//! read/write deadline 语义。每个方向一个 [`Deadline`]。

use tokio::sync::watch;
use tokio::time::Instant;

/// 单方向截止时间状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineState {
    /// 未设置截止时间
    Disarmed,
    /// 将在指定时刻到期
    Armed(Instant),
    /// 已到期，直到重新设置前所有操作立即失败
    Expired,
}

/// 驱动状态转换的事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineEvent {
    /// 设置新截止时间，`None` 表示清除
    Set(Option<Instant>),
    /// 时钟推进到给定时刻
    Tick(Instant),
}

impl DeadlineState {
    /// 唯一的状态转换函数
    pub fn transition(self, event: DeadlineEvent) -> Self {
        match (self, event) {
            (_, DeadlineEvent::Set(None)) => DeadlineState::Disarmed,
            (_, DeadlineEvent::Set(Some(at))) => DeadlineState::Armed(at),
            (DeadlineState::Armed(at), DeadlineEvent::Tick(now)) if now >= at => DeadlineState::Expired,
            (state, DeadlineEvent::Tick(_)) => state,
        }
    }
}

/// 单方向截止时间
///
/// 状态保存在 watch 通道中，正在进行的操作通过 [`Deadline::expired`]
/// 观察到重新设置并据此重新计时。
#[derive(Debug)]
pub struct Deadline {
    state: watch::Sender<DeadlineState>,
}

impl Deadline {
    pub fn new() -> Self {
        let (state, _) = watch::channel(DeadlineState::Disarmed);
        Self { state }
    }

    /// 设置或清除截止时间，同时清除已到期标记
    pub fn set(&self, at: Option<Instant>) {
        self.apply(DeadlineEvent::Set(at));
    }

    /// 当前状态（先按当前时刻推进）
    pub fn state(&self) -> DeadlineState {
        self.apply(DeadlineEvent::Tick(Instant::now()));
        *self.state.borrow()
    }

    pub fn is_expired(&self) -> bool {
        self.state() == DeadlineState::Expired
    }

    /// 截止时间到达时完成；未设置截止时间时一直挂起
    ///
    /// 与正在进行的读写操作 `select!`，只有在途操作会被中止。
    pub async fn expired(&self) {
        let mut rx = self.state.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            match current {
                DeadlineState::Expired => return,
                DeadlineState::Armed(at) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(at) => {
                            if self.is_expired() {
                                return;
                            }
                        }
                        changed = rx.changed() => {
                            if changed.is_err() {
                                return std::future::pending().await;
                            }
                        }
                    }
                }
                DeadlineState::Disarmed => {
                    if rx.changed().await.is_err() {
                        return std::future::pending().await;
                    }
                }
            }
        }
    }

    fn apply(&self, event: DeadlineEvent) {
        self.state.send_if_modified(|state| {
            let next = state.transition(event);
            let changed = next != *state;
            *state = next;
            changed
        });
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Self::new()
    }
}
