use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{FabricError, Result};
use crate::transport::protocol::AssignmentMessage;

/// How assignments reach agents.
#[async_trait]
pub trait Delivery: Send + Sync {
    /// Hand `message` to `agent_id`. Errors mean the agent is unreachable.
    async fn deliver(&self, agent_id: Uuid, message: AssignmentMessage) -> Result<()>;

    /// Prepare to deliver to a (re-)registered agent, discarding anything queued before.
    fn open(&self, agent_id: Uuid);

    /// Stop delivering to an agent that left the registry.
    fn close(&self, agent_id: Uuid);

    /// Assignments waiting for `agent_id` to pick them up.
    fn drain(&self, _agent_id: Uuid) -> Vec<AssignmentMessage> {
        Vec::new()
    }

    fn pending(&self, _agent_id: Uuid) -> usize {
        0
    }
}

/// Agent-poll delivery: one mailbox per registered agent, drained by
/// `GET /agent/poll`. Draining removes the messages, so every assignment
/// is handed out once.
#[derive(Debug, Default)]
pub struct Mailbox {
    boxes: Mutex<HashMap<Uuid, VecDeque<AssignmentMessage>>>,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Delivery for Mailbox {
    async fn deliver(&self, agent_id: Uuid, message: AssignmentMessage) -> Result<()> {
        let mut boxes = self
            .boxes
            .lock()
            .map_err(|_| FabricError::Internal("mailbox lock poisoned".to_string()))?;
        let mailbox = boxes
            .get_mut(&agent_id)
            .ok_or_else(|| FabricError::Connection(format!("no mailbox for agent {}", agent_id)))?;
        mailbox.push_back(message);
        Ok(())
    }

    fn open(&self, agent_id: Uuid) {
        if let Ok(mut boxes) = self.boxes.lock() {
            boxes.insert(agent_id, VecDeque::new());
        }
    }

    fn close(&self, agent_id: Uuid) {
        if let Ok(mut boxes) = self.boxes.lock() {
            boxes.remove(&agent_id);
        }
    }

    fn drain(&self, agent_id: Uuid) -> Vec<AssignmentMessage> {
        self.boxes
            .lock()
            .ok()
            .and_then(|mut boxes| boxes.get_mut(&agent_id).map(|q| q.drain(..).collect()))
            .unwrap_or_default()
    }

    fn pending(&self, agent_id: Uuid) -> usize {
        self.boxes
            .lock()
            .ok()
            .and_then(|boxes| boxes.get(&agent_id).map(|q| q.len()))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::task::TaskPayload;
    use chrono::Utc;

    fn message() -> AssignmentMessage {
        AssignmentMessage {
            task_id: Uuid::new_v4(),
            attempt: 1,
            payload: TaskPayload::shell("true"),
            deadline: Utc::now(),
        }
    }

    #[tokio::test]
    async fn deliver_requires_open_mailbox() {
        let mailbox = Mailbox::new();
        let agent = Uuid::new_v4();
        assert!(matches!(
            mailbox.deliver(agent, message()).await,
            Err(FabricError::Connection(_))
        ));

        mailbox.open(agent);
        mailbox.deliver(agent, message()).await.unwrap();
        assert_eq!(mailbox.pending(agent), 1);
    }

    #[tokio::test]
    async fn drain_hands_out_each_message_once() {
        let mailbox = Mailbox::new();
        let agent = Uuid::new_v4();
        mailbox.open(agent);
        let first = message();
        mailbox.deliver(agent, first.clone()).await.unwrap();
        mailbox.deliver(agent, message()).await.unwrap();

        let drained = mailbox.drain(agent);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0], first);
        assert!(mailbox.drain(agent).is_empty());
    }

    #[tokio::test]
    async fn reopen_discards_queued_messages() {
        let mailbox = Mailbox::new();
        let agent = Uuid::new_v4();
        mailbox.open(agent);
        mailbox.deliver(agent, message()).await.unwrap();
        mailbox.open(agent);
        assert_eq!(mailbox.pending(agent), 0);

        mailbox.close(agent);
        assert!(mailbox.deliver(agent, message()).await.is_err());
    }
}
