//! Inter-session messaging and escalation commands.

use std::path::Path;

use anyhow::Result;

use hive::db::models::EscalationStatus;
use hive::messaging::MessageService;

use super::super::{EscalationCommands, MsgCommands};

pub async fn cmd_msg(workspace: &Path, command: &MsgCommands) -> Result<()> {
    let ctx = super::CommandContext::load(workspace)?;
    let service = MessageService::new(ctx.db.clone());

    match command {
        MsgCommands::Send { from, to, body, subject } => {
            let message = service.send(from, to, body, subject.as_deref()).await?;
            println!("Sent message #{} to {}", message.id, message.to_session);
        }
        MsgCommands::Inbox { session, all } => {
            let messages = service.inbox(session, *all).await?;
            if messages.is_empty() {
                println!("Inbox empty.");
                return Ok(());
            }
            for message in messages {
                println!(
                    "#{:<5} {:<10} from {:<28} {}",
                    message.id,
                    message.status.as_str(),
                    message.from_session,
                    message.subject.as_deref().unwrap_or("-")
                );
            }
        }
        MsgCommands::Read { id } => match service.read(*id).await? {
            Some(message) => {
                println!("From: {}", message.from_session);
                if let Some(subject) = &message.subject {
                    println!("Subject: {}", subject);
                }
                println!();
                println!("{}", message.body);
                if let Some(reply) = &message.reply {
                    println!();
                    println!("Reply: {}", reply);
                }
            }
            None => anyhow::bail!("No message with id {}", id),
        },
        MsgCommands::Reply { id, body } => {
            if service.reply(*id, body).await? {
                println!("Replied to message #{}", id);
            } else {
                println!("Message #{} was already replied to; left unchanged.", id);
            }
        }
    }
    Ok(())
}

pub async fn cmd_escalations(workspace: &Path, command: &EscalationCommands) -> Result<()> {
    let ctx = super::CommandContext::load(workspace)?;
    let service = MessageService::new(ctx.db.clone());

    match command {
        EscalationCommands::List => {
            let pending = service.pending_escalations().await?;
            if pending.is_empty() {
                println!("No pending escalations.");
                return Ok(());
            }
            for escalation in pending {
                let target = match &escalation.to_agent_id {
                    Some(agent) => agent.as_str(),
                    None => "human",
                };
                println!(
                    "#{:<5} {} -> {}: {}",
                    escalation.id,
                    escalation.from_agent_id.as_deref().unwrap_or("unknown"),
                    console::style(target).yellow(),
                    escalation.reason
                );
            }
        }
        EscalationCommands::Resolve { id, resolution } => {
            let ctx_db = ctx.db.clone();
            let escalation = ctx_db.call({
                let id = *id;
                move |store| store.get_escalation(id)
            })
            .await?;
            match escalation {
                Some(e) if e.status != EscalationStatus::Resolved => {
                    service.resolve(*id, resolution).await?;
                    println!("Resolved escalation #{}", id);
                }
                Some(_) => println!("Escalation #{} is already resolved.", id),
                None => anyhow::bail!("No escalation with id {}", id),
            }
        }
    }
    Ok(())
}
