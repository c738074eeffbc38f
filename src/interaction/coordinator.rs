use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::backend::{ByteStream, DynFlowBackend, ResumeRequest, ResumeResponse};
use crate::error::{InteractionError, Result};

use super::pending::{Decision, InteractionKey, InteractionRequest, PendingInteraction};

/// `resolve` 成功时的结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// 决策已交给恢复任务
    Delivered,
    /// 会话已终结，决策被忽略
    SessionClosed,
}

#[derive(Default)]
struct Registry {
    pending: HashMap<InteractionKey, PendingInteraction>,
    /// 当前等待实例已作答或被撤销的步骤；步骤再次进入等待时清除
    resolved: HashSet<InteractionKey>,
    /// 每个步骤进行中的恢复调用数
    in_flight: HashMap<InteractionKey, usize>,
    closed: bool,
}

/// 等待中交互的登记表。
///
/// 会话循环登记交互，UI 通过 `resolve` 提交决策；每个交互只能被解决一次。
#[derive(Default)]
pub struct InteractionCoordinator {
    registry: Mutex<Registry>,
}

impl InteractionCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记新的交互，返回接收决策的一次性通道。
    ///
    /// 同一步骤每次进入等待状态都是一个新交互，上一次的作答记录随之失效。
    /// 会话已关闭或该步骤仍有未作答的交互时返回 `None`。
    pub fn open(&self, request: InteractionRequest) -> Option<oneshot::Receiver<Decision>> {
        let mut registry = self.registry.lock();
        let key = request.key();
        if registry.closed || registry.pending.contains_key(&key) {
            debug!(task_id = %key.task_id, step_id = %key.step_id, "interaction already open");
            return None;
        }
        if registry.resolved.remove(&key) {
            debug!(task_id = %key.task_id, step_id = %key.step_id, "step waiting again");
        }
        let (pending, receiver) = PendingInteraction::new(request);
        registry.pending.insert(key, pending);
        Some(receiver)
    }

    pub fn resolve(
        &self,
        task_id: &str,
        step_id: &str,
        decision: Decision,
    ) -> std::result::Result<Resolution, InteractionError> {
        let mut registry = self.registry.lock();
        if registry.closed {
            debug!(task_id, step_id, "ignoring decision for closed session");
            return Ok(Resolution::SessionClosed);
        }

        let key = InteractionKey::new(task_id, step_id);
        if registry.resolved.contains(&key) {
            return Err(InteractionError::AlreadyResolved {
                task_id: key.task_id,
                step_id: key.step_id,
            });
        }
        match registry.pending.get(&key) {
            None => {
                return Err(InteractionError::Unknown {
                    task_id: key.task_id,
                    step_id: key.step_id,
                })
            }
            Some(pending) if !decision.fits(&pending.request.kind) => {
                return Err(InteractionError::KindMismatch {
                    expected: pending.request.kind.label(),
                });
            }
            Some(_) => {}
        }

        let Some(pending) = registry.pending.remove(&key) else {
            return Err(InteractionError::Unknown {
                task_id: key.task_id,
                step_id: key.step_id,
            });
        };
        registry.resolved.insert(key.clone());
        info!(task_id, step_id, decline = decision.is_decline(), "interaction resolved");
        if pending.responder.send(decision).is_err() {
            return Ok(Resolution::SessionClosed);
        }
        *registry.in_flight.entry(key).or_default() += 1;
        Ok(Resolution::Delivered)
    }

    /// 服务端已越过该等待点（例如其他客户端作答），撤销交互
    pub fn withdraw(&self, key: &InteractionKey) -> bool {
        let mut registry = self.registry.lock();
        if registry.pending.remove(key).is_some() {
            registry.resolved.insert(key.clone());
            true
        } else {
            false
        }
    }

    /// 恢复调用已返回
    pub fn complete(&self, key: &InteractionKey) {
        let mut registry = self.registry.lock();
        if let Some(count) = registry.in_flight.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                registry.in_flight.remove(key);
            }
        }
    }

    /// 会话终结：丢弃所有未决交互，之后的决策都是空操作
    pub fn close(&self) {
        let mut registry = self.registry.lock();
        registry.closed = true;
        registry.pending.clear();
        registry.in_flight.clear();
    }

    /// 该步骤当前的等待实例已作答或被撤销
    pub fn is_answered(&self, key: &InteractionKey) -> bool {
        let registry = self.registry.lock();
        registry.resolved.contains(key) && !registry.pending.contains_key(key)
    }

    pub fn is_closed(&self) -> bool {
        self.registry.lock().closed
    }

    /// 是否有等待用户或正在进行的恢复调用
    pub fn has_outstanding(&self) -> bool {
        let registry = self.registry.lock();
        !registry.pending.is_empty() || !registry.in_flight.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.registry.lock().pending.len()
    }

    pub fn pending_requests(&self) -> Vec<InteractionRequest> {
        self.registry
            .lock()
            .pending
            .values()
            .map(|pending| pending.request.clone())
            .collect()
    }
}

/// 构造恢复请求所需的会话信息
#[derive(Clone, Debug)]
pub struct ResumeTarget {
    pub key: InteractionKey,
    pub conversation_id: String,
    pub app_id: String,
    pub flow_id: String,
    pub language: String,
    pub llm_id: String,
}

impl ResumeTarget {
    pub fn request(&self, response: ResumeResponse) -> ResumeRequest {
        ResumeRequest {
            task_id: self.key.task_id.clone(),
            step_id: self.key.step_id.clone(),
            conversation_id: self.conversation_id.clone(),
            app_id: self.app_id.clone(),
            flow_id: self.flow_id.clone(),
            language: self.language.clone(),
            llm_id: self.llm_id.clone(),
            response,
        }
    }
}

/// 恢复调用的结果，回传给会话循环
pub struct ResumeOutcome {
    pub key: InteractionKey,
    pub declined: bool,
    pub result: Result<Option<ByteStream>>,
}

/// 为一个交互启动独立的恢复任务：等待决策，然后调用服务端。
/// 会话拆除时任务随之退出，不再回传结果。
pub fn spawn_resume(
    backend: DynFlowBackend,
    target: ResumeTarget,
    decision: oneshot::Receiver<Decision>,
    teardown: CancellationToken,
    outcomes: mpsc::UnboundedSender<ResumeOutcome>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let decision = tokio::select! {
            _ = teardown.cancelled() => return,
            decision = decision => match decision {
                Ok(decision) => decision,
                // 交互被撤销或会话关闭
                Err(_) => return,
            },
        };

        let declined = decision.is_decline();
        let request = target.request(decision.into_response());
        let result = tokio::select! {
            _ = teardown.cancelled() => return,
            result = backend.resume(request) => result,
        };

        let outcome = ResumeOutcome {
            key: target.key,
            declined,
            result,
        };
        if outcomes.send(outcome).is_err() {
            debug!("session loop gone before resume finished");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interaction::InteractionKind;
    use crate::stream::RiskLevel;

    fn confirm_request(step_id: &str) -> InteractionRequest {
        InteractionRequest {
            task_id: "t1".into(),
            step_id: step_id.into(),
            step_name: "shell".into(),
            kind: InteractionKind::Confirm {
                risk: RiskLevel::Low,
                reason: "list files".into(),
            },
        }
    }

    #[tokio::test]
    async fn resolves_exactly_once() {
        let coordinator = InteractionCoordinator::new();
        let receiver = coordinator.open(confirm_request("s1")).unwrap();

        let first = coordinator.resolve("t1", "s1", Decision::Confirm(true));
        assert_eq!(first, Ok(Resolution::Delivered));
        assert_eq!(receiver.await.unwrap(), Decision::Confirm(true));
        assert!(coordinator.has_outstanding());

        let second = coordinator.resolve("t1", "s1", Decision::Confirm(false));
        assert!(matches!(second, Err(InteractionError::AlreadyResolved { .. })));

        coordinator.complete(&InteractionKey::new("t1", "s1"));
        assert!(!coordinator.has_outstanding());
    }

    #[test]
    fn unknown_and_mismatched_decisions_are_rejected() {
        let coordinator = InteractionCoordinator::new();
        let _receiver = coordinator.open(confirm_request("s1"));

        assert!(matches!(
            coordinator.resolve("t1", "other", Decision::Confirm(true)),
            Err(InteractionError::Unknown { .. })
        ));
        assert_eq!(
            coordinator.resolve("t1", "s1", Decision::Parameters(Some(Default::default()))),
            Err(InteractionError::KindMismatch {
                expected: "confirm"
            })
        );
        assert_eq!(coordinator.pending_count(), 1);
    }

    #[test]
    fn closed_session_ignores_decisions() {
        let coordinator = InteractionCoordinator::new();
        let _receiver = coordinator.open(confirm_request("s1"));
        coordinator.close();
        assert_eq!(
            coordinator.resolve("t1", "s1", Decision::Confirm(true)),
            Ok(Resolution::SessionClosed)
        );
        assert!(coordinator.open(confirm_request("s2")).is_none());
        assert!(!coordinator.has_outstanding());
    }

    #[tokio::test]
    async fn step_waiting_again_opens_fresh_interaction() {
        let coordinator = InteractionCoordinator::new();
        let first = coordinator.open(confirm_request("s1")).unwrap();
        coordinator
            .resolve("t1", "s1", Decision::Confirm(true))
            .unwrap();
        assert_eq!(first.await.unwrap(), Decision::Confirm(true));

        let mut again = confirm_request("s1");
        again.kind = InteractionKind::Parameters {
            message: "missing key".into(),
            schema: serde_json::Value::Null,
        };
        let second = coordinator.open(again.clone()).unwrap();
        assert!(coordinator.open(again).is_none());

        // 新实例尚未作答，前一次的作答不再阻止提交
        let mut params = serde_json::Map::new();
        params.insert("key".into(), "abc".into());
        assert_eq!(
            coordinator.resolve("t1", "s1", Decision::Parameters(Some(params.clone()))),
            Ok(Resolution::Delivered)
        );
        assert_eq!(second.await.unwrap(), Decision::Parameters(Some(params)));

        // 两次恢复调用都返回后才算清空
        let key = InteractionKey::new("t1", "s1");
        coordinator.complete(&key);
        assert!(coordinator.has_outstanding());
        coordinator.complete(&key);
        assert!(!coordinator.has_outstanding());
    }

    #[tokio::test]
    async fn withdrawn_interaction_drops_responder() {
        let coordinator = InteractionCoordinator::new();
        let receiver = coordinator.open(confirm_request("s1")).unwrap();
        assert!(coordinator.withdraw(&InteractionKey::new("t1", "s1")));
        assert!(receiver.await.is_err());
        assert!(matches!(
            coordinator.resolve("t1", "s1", Decision::Confirm(true)),
            Err(InteractionError::AlreadyResolved { .. })
        ));
    }
}
