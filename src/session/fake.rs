//! Scripted session driver for scheduler and manager tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::errors::SessionError;

use super::{SessionDriver, SpawnSpec};

#[derive(Default)]
struct FakeSession {
    buffer: String,
    running: bool,
}

#[derive(Default)]
struct FakeState {
    sessions: HashMap<String, FakeSession>,
    sent: Vec<(String, String)>,
    enters: Vec<String>,
    keys: Vec<(String, String)>,
    killed: Vec<String>,
    spawned: Vec<String>,
}

/// In-memory driver; sessions are rows in a map, sends are recorded.
#[derive(Default)]
pub struct FakeDriver {
    state: Mutex<FakeState>,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_session(&self, name: &str, buffer: &str) {
        let mut state = self.state.lock().unwrap();
        state.sessions.insert(
            name.to_string(),
            FakeSession {
                buffer: buffer.to_string(),
                running: true,
            },
        );
    }

    pub fn set_buffer(&self, name: &str, buffer: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(session) = state.sessions.get_mut(name) {
            session.buffer = buffer.to_string();
        }
    }

    pub fn remove_session(&self, name: &str) {
        self.state.lock().unwrap().sessions.remove(name);
    }

    pub fn sent_to(&self, name: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .sent
            .iter()
            .filter(|(session, _)| session == name)
            .map(|(_, text)| text.clone())
            .collect()
    }

    pub fn enters_sent(&self, name: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .enters
            .iter()
            .filter(|session| session.as_str() == name)
            .count()
    }

    pub fn keys_sent(&self, name: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .keys
            .iter()
            .filter(|(session, _)| session == name)
            .map(|(_, key)| key.clone())
            .collect()
    }

    pub fn killed_sessions(&self) -> Vec<String> {
        self.state.lock().unwrap().killed.clone()
    }

    pub fn spawned_sessions(&self) -> Vec<String> {
        self.state.lock().unwrap().spawned.clone()
    }
}

#[async_trait]
impl SessionDriver for FakeDriver {
    async fn spawn(&self, spec: SpawnSpec<'_>) -> Result<(), SessionError> {
        let mut state = self.state.lock().unwrap();
        state.spawned.push(spec.name.to_string());
        state.sessions.insert(
            spec.name.to_string(),
            FakeSession {
                buffer: "? for shortcuts".to_string(),
                running: true,
            },
        );
        Ok(())
    }

    async fn send(&self, name: &str, text: &str) -> Result<(), SessionError> {
        let mut state = self.state.lock().unwrap();
        if !state.sessions.contains_key(name) {
            return Err(SessionError::NotFound(name.to_string()));
        }
        state.sent.push((name.to_string(), text.to_string()));
        Ok(())
    }

    async fn send_enter(&self, name: &str) -> Result<(), SessionError> {
        self.state.lock().unwrap().enters.push(name.to_string());
        Ok(())
    }

    async fn send_key(&self, name: &str, key: &str) -> Result<(), SessionError> {
        self.state
            .lock()
            .unwrap()
            .keys
            .push((name.to_string(), key.to_string()));
        Ok(())
    }

    async fn send_with_confirmation(&self, name: &str, text: &str) -> Result<bool, SessionError> {
        self.send(name, text).await?;
        Ok(true)
    }

    async fn capture(&self, name: &str, _lines: u32) -> Result<String, SessionError> {
        let state = self.state.lock().unwrap();
        state
            .sessions
            .get(name)
            .filter(|s| s.running)
            .map(|s| s.buffer.clone())
            .ok_or_else(|| SessionError::NotFound(name.to_string()))
    }

    async fn kill(&self, name: &str) -> Result<(), SessionError> {
        let mut state = self.state.lock().unwrap();
        state.killed.push(name.to_string());
        if let Some(session) = state.sessions.get_mut(name) {
            session.running = false;
        }
        Ok(())
    }

    async fn is_running(&self, name: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .sessions
            .get(name)
            .map(|s| s.running)
            .unwrap_or(false)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, SessionError> {
        let state = self.state.lock().unwrap();
        let mut names: Vec<String> = state
            .sessions
            .iter()
            .filter(|(name, session)| session.running && name.starts_with(prefix))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn wait_ready(&self, name: &str, _timeout: Duration) -> Result<(), SessionError> {
        if self.is_running(name).await {
            Ok(())
        } else {
            Err(SessionError::NotFound(name.to_string()))
        }
    }
}
