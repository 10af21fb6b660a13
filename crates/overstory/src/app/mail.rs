//! Mail client: higher-level send/check/reply semantics over the mail store.
//!
//! Group addresses are resolved against the live session list *before*
//! insertion, producing one row per recipient, so readers never need to
//! know about groups.

use std::collections::HashSet;

use serde::Serialize;

use crate::domain::mail::{MailMessage, MailPriority, MailType};
use crate::domain::session::Capability;
use crate::error::{Error, Result};
use crate::infra::db::mail::MailStore;
use crate::infra::db::sessions::SessionStore;

/// Maximum root-ward hops when resolving a reply's thread root.
const MAX_THREAD_HOPS: usize = 64;

/// Client over the mail and session stores.
#[derive(Clone)]
pub struct MailClient {
    mail: MailStore,
    sessions: SessionStore,
}

impl MailClient {
    /// Creates a client over the two stores.
    pub fn new(mail: MailStore, sessions: SessionStore) -> Self {
        Self { mail, sessions }
    }

    /// Returns the underlying mail store.
    pub fn store(&self) -> &MailStore {
        &self.mail
    }

    /// Sends one message, fanning out group addresses.
    ///
    /// Recipients starting with `@` resolve against active sessions with the
    /// sender excluded; one row is inserted per recipient and all new ids
    /// are returned. An empty resolution is a no-op returning an empty
    /// list.
    ///
    /// # Errors
    /// Returns [`Error::Validation`] for an unknown group address and
    /// [`Error::Mail`] on store failure.
    pub async fn send(&self, message: &MailMessage) -> Result<Vec<String>> {
        let recipients = self.resolve_recipients(&message.from, &message.to).await?;

        let mut ids = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            let mut copy = message.clone();
            copy.id = String::new();
            copy.to = recipient;
            ids.push(self.mail.insert(&copy).await?);
        }

        Ok(ids)
    }

    /// Sends a typed protocol payload serialized into the `payload` column.
    ///
    /// # Errors
    /// Returns [`Error::Mail`] when the payload cannot be serialized and
    /// store errors otherwise.
    pub async fn send_protocol<T: Serialize + Sync>(
        &self,
        from: &str,
        to: &str,
        subject: &str,
        mail_type: MailType,
        payload: &T,
    ) -> Result<Vec<String>> {
        let encoded = serde_json::to_string(payload)
            .map_err(|err| Error::mail(format!("failed to encode payload: {err}"), ""))?;

        let mut message = MailMessage::new(from, to, subject, "");
        message.mail_type = mail_type;
        message.priority = MailPriority::Normal;
        message.payload = Some(encoded);

        self.send(&message).await
    }

    /// Atomic read-and-mark: fetches unread mail and marks it read in the
    /// same transaction, returning the snapshot.
    ///
    /// # Errors
    /// Returns an error if the store transaction fails.
    pub async fn check(&self, agent_name: &str) -> Result<Vec<MailMessage>> {
        self.mail.take_unread(agent_name).await
    }

    /// Like [`check`](Self::check), formatted as a single block for
    /// injection into agent context. Returns `None` when the mailbox is
    /// empty.
    ///
    /// # Errors
    /// Returns an error if the store transaction fails.
    pub async fn check_inject(&self, agent_name: &str) -> Result<Option<String>> {
        let messages = self.check(agent_name).await?;
        if messages.is_empty() {
            return Ok(None);
        }

        let mut block = format!("You have {} unread message(s):\n", messages.len());
        for message in &messages {
            block.push_str(&format!(
                "\n[{}|{}] from {}: {}\n",
                message.mail_type, message.priority, message.from, message.subject
            ));
            for line in message.body.lines() {
                block.push_str(&format!("  {line}\n"));
            }
        }

        Ok(Some(block))
    }

    /// Replies to a message, inheriting its conversation thread.
    ///
    /// The thread id is the root of the conversation: replies to replies
    /// walk the `thread_id` chain root-ward (with a hop limit against
    /// corrupt cycles). The recipient is the original sender.
    ///
    /// # Errors
    /// Returns [`Error::Mail`] when the original message does not exist.
    pub async fn reply(&self, message_id: &str, body: &str, from: &str) -> Result<String> {
        let original = self
            .mail
            .get_by_id(message_id)
            .await?
            .ok_or_else(|| Error::mail("message not found", message_id))?;

        let thread_id = self.resolve_thread_root(&original).await?;
        let subject = if original.subject.starts_with("Re: ") {
            original.subject.clone()
        } else {
            format!("Re: {}", original.subject)
        };

        let mut message = MailMessage::new(from, &original.from, &subject, body);
        message.mail_type = original.mail_type;
        message.priority = original.priority;
        message.thread_id = Some(thread_id);

        self.mail.insert(&message).await
    }

    /// Walks root-ward from a message to its thread root id.
    async fn resolve_thread_root(&self, message: &MailMessage) -> Result<String> {
        let mut root_id = message.id.clone();
        let mut next = message.thread_id.clone();
        let mut seen: HashSet<String> = HashSet::from([root_id.clone()]);

        for _ in 0..MAX_THREAD_HOPS {
            let Some(candidate) = next else {
                return Ok(root_id);
            };
            if !seen.insert(candidate.clone()) {
                // Cycle in thread links; the last sound id wins.
                return Ok(root_id);
            }

            match self.mail.get_by_id(&candidate).await? {
                Some(parent) => {
                    root_id = parent.id;
                    next = parent.thread_id;
                }
                // Dangling link: the referenced id is the best root we have.
                None => return Ok(candidate),
            }
        }

        Ok(root_id)
    }

    /// Resolves a recipient string into concrete agent names.
    async fn resolve_recipients(&self, from: &str, to: &str) -> Result<Vec<String>> {
        let Some(group) = to.strip_prefix('@') else {
            return Ok(vec![to.to_string()]);
        };

        let capability = match group {
            "all" => None,
            "builders" => Some(Capability::Builder),
            "scouts" => Some(Capability::Scout),
            "reviewers" => Some(Capability::Reviewer),
            "mergers" => Some(Capability::Merger),
            "leads" => Some(Capability::Lead),
            _ => {
                return Err(Error::validation(
                    format!("unknown group address: {to}"),
                    &[("to", to)],
                ));
            }
        };

        let active = self.sessions.get_active().await?;
        let recipients = active
            .into_iter()
            .filter(|session| session.agent_name != from)
            .filter(|session| capability.is_none_or(|capability| session.capability == capability))
            .map(|session| session.agent_name)
            .collect();

        Ok(recipients)
    }
}
