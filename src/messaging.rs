//! Inter-session messages and the escalation lifecycle.
//!
//! Delivery is at-least-once: the manager forwards pending rows into the
//! recipient's terminal on every tick until they are marked read, and reads
//! are idempotent, so a redelivered message cannot double-apply.

use anyhow::Result;

use crate::db::DbHandle;
use crate::db::models::{Escalation, EscalationStatus, Message};
use crate::events;

#[derive(Clone)]
pub struct MessageService {
    db: DbHandle,
}

impl MessageService {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    pub async fn send(
        &self,
        from_session: &str,
        to_session: &str,
        body: &str,
        subject: Option<&str>,
    ) -> Result<Message> {
        let (from, to, body, subject) = (
            from_session.to_string(),
            to_session.to_string(),
            body.to_string(),
            subject.map(str::to_string),
        );
        self.db
            .call(move |store| store.send_message(&from, &to, subject.as_deref(), &body))
            .await
    }

    /// Pending messages by default; `include_read` returns the full history.
    pub async fn inbox(&self, to_session: &str, include_read: bool) -> Result<Vec<Message>> {
        let to = to_session.to_string();
        self.db
            .call(move |store| store.inbox(&to, include_read))
            .await
    }

    /// Mark read (idempotent) and return the message.
    pub async fn read(&self, id: i64) -> Result<Option<Message>> {
        self.db
            .call(move |store| {
                store.mark_message_read(id)?;
                store.get_message(id)
            })
            .await
    }

    /// Attach a reply; a second reply to the same message is a no-op.
    pub async fn reply(&self, id: i64, text: &str) -> Result<bool> {
        let text = text.to_string();
        self.db
            .call(move |store| store.reply_message(id, &text))
            .await
    }

    /// Raise an escalation; `to_agent_id = None` targets a human operator.
    pub async fn escalate(
        &self,
        story_id: Option<i64>,
        from_agent_id: Option<&str>,
        to_agent_id: Option<&str>,
        reason: &str,
    ) -> Result<Escalation> {
        let from = from_agent_id.map(str::to_string);
        let to = to_agent_id.map(str::to_string);
        let reason = reason.to_string();
        self.db
            .call(move |store| {
                let escalation =
                    store.create_escalation(story_id, from.as_deref(), to.as_deref(), &reason)?;
                store.create_log(
                    from.as_deref().unwrap_or("system"),
                    story_id,
                    events::ESCALATION,
                    Some(escalation.status.as_str()),
                    Some(&reason),
                    None,
                )?;
                Ok(escalation)
            })
            .await
    }

    pub async fn pending_escalations(&self) -> Result<Vec<Escalation>> {
        self.db
            .call(|store| store.list_escalations_by_status(EscalationStatus::Pending))
            .await
    }

    pub async fn resolve(&self, id: i64, resolution: &str) -> Result<()> {
        let resolution = resolution.to_string();
        self.db
            .call(move |store| {
                store.resolve_escalation(id, &resolution)?;
                let agent = store
                    .get_escalation(id)?
                    .and_then(|e| e.from_agent_id)
                    .unwrap_or_else(|| "system".to_string());
                store.create_log(
                    &agent,
                    None,
                    events::ESCALATION_RESOLVED,
                    Some(EscalationStatus::Resolved.as_str()),
                    Some(&resolution),
                    None,
                )
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Store;
    use crate::db::models::MessageStatus;

    fn service() -> MessageService {
        MessageService::new(DbHandle::new(Store::open_in_memory().unwrap()))
    }

    #[tokio::test]
    async fn test_send_and_inbox_roundtrip() -> Result<()> {
        let svc = service();
        svc.send("hive-senior-acme", "hive-qa-acme-1", "review please", Some("PR 12"))
            .await?;

        let inbox = svc.inbox("hive-qa-acme-1", false).await?;
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].subject.as_deref(), Some("PR 12"));
        assert_eq!(inbox[0].status, MessageStatus::Pending);
        Ok(())
    }

    #[tokio::test]
    async fn test_reading_twice_is_a_noop() -> Result<()> {
        let svc = service();
        let msg = svc.send("a", "b", "hello", None).await?;

        let first = svc.read(msg.id).await?.expect("message exists");
        assert_eq!(first.status, MessageStatus::Read);
        let second = svc.read(msg.id).await?.expect("message exists");
        assert_eq!(second.status, MessageStatus::Read);
        assert_eq!(first.updated_at, second.updated_at);
        Ok(())
    }

    #[tokio::test]
    async fn test_replying_twice_keeps_first_reply() -> Result<()> {
        let svc = service();
        let msg = svc.send("a", "b", "question", None).await?;

        assert!(svc.reply(msg.id, "first answer").await?);
        assert!(!svc.reply(msg.id, "second answer").await?);

        let stored = svc.read(msg.id).await?.expect("message exists");
        assert_eq!(stored.reply.as_deref(), Some("first answer"));
        assert_eq!(stored.status, MessageStatus::Replied);
        Ok(())
    }

    #[tokio::test]
    async fn test_escalation_lifecycle() -> Result<()> {
        let svc = service();
        let escalation = svc
            .escalate(Some(3), Some("agent-1"), None, "blocked on prod credentials")
            .await?;
        assert_eq!(escalation.status, EscalationStatus::Pending);
        assert!(escalation.to_agent_id.is_none());

        assert_eq!(svc.pending_escalations().await?.len(), 1);

        svc.resolve(escalation.id, "credentials granted").await?;
        assert!(svc.pending_escalations().await?.is_empty());
        Ok(())
    }
}
