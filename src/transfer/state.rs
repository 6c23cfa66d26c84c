// 单文件传输状态机
//
// Init → SizeProbed → OffsetDetermined → Transferring → Verifying → {Completed | Failed}
// SizeProbed / OffsetDetermined 可直接到 Completed（目标已完整）
// 任何非终态都可以到 Failed，终态之后不允许再迁移

use crate::error::{TransferError, TransferResultOf};
use serde::Serialize;
use std::fmt;
use tracing::{debug, warn};

/// 传输状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Init,
    SizeProbed,
    OffsetDetermined,
    Transferring,
    Verifying,
    Completed,
    Failed,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferState::Completed | TransferState::Failed)
    }

    /// 是否允许迁移到 `next`
    pub fn can_transition_to(&self, next: TransferState) -> bool {
        use TransferState::*;
        match (self, next) {
            (s, _) if s.is_terminal() => false,
            (_, Failed) => true,
            (Init, SizeProbed) => true,
            (SizeProbed, OffsetDetermined) | (SizeProbed, Completed) => true,
            (OffsetDetermined, Transferring) | (OffsetDetermined, Completed) => true,
            (Transferring, Verifying) => true,
            (Verifying, Completed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferState::Init => "init",
            TransferState::SizeProbed => "size_probed",
            TransferState::OffsetDetermined => "offset_determined",
            TransferState::Transferring => "transferring",
            TransferState::Verifying => "verifying",
            TransferState::Completed => "completed",
            TransferState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// 带日志的状态机
#[derive(Debug)]
pub struct TransferStateMachine {
    label: String,
    state: TransferState,
}

impl TransferStateMachine {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            state: TransferState::Init,
        }
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    /// 迁移到下一个状态
    pub fn advance(&mut self, next: TransferState) -> TransferResultOf<()> {
        if !self.state.can_transition_to(next) {
            return Err(TransferError::Config(format!(
                "非法状态迁移 {} -> {} ({})",
                self.state, next, self.label
            )));
        }
        debug!("{}: {} -> {}", self.label, self.state, next);
        self.state = next;
        Ok(())
    }

    /// 进入 Failed（已是终态时忽略）
    pub fn fail(&mut self, err: &TransferError) {
        if self.state.is_terminal() {
            return;
        }
        warn!("{}: {} -> failed: {}", self.label, self.state, err);
        self.state = TransferState::Failed;
    }
}
