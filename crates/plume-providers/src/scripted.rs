//! In-process provider with scripted outcomes, for tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::{Content, Credential, Provider, PublishError};

/// Replays queued outcomes in order. Once the script runs out every publish
/// succeeds with `"{channel}-{n}"`.
pub struct ScriptedProvider {
    channel: String,
    script: Mutex<VecDeque<Result<String, PublishError>>>,
    published: Mutex<Vec<Content>>,
    delay: Mutex<Option<Duration>>,
}

impl ScriptedProvider {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            script: Mutex::new(VecDeque::new()),
            published: Mutex::new(Vec::new()),
            delay: Mutex::new(None),
        }
    }

    pub fn push_ok(&self, id: impl Into<String>) {
        self.script.lock().unwrap().push_back(Ok(id.into()));
    }

    pub fn push_err(&self, err: PublishError) {
        self.script.lock().unwrap().push_back(Err(err));
    }

    /// Sleep this long inside every publish.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Number of publish calls so far.
    pub fn calls(&self) -> usize {
        self.published.lock().unwrap().len()
    }

    /// Content of every publish call, in order.
    pub fn published(&self) -> Vec<Content> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn channel(&self) -> &str {
        &self.channel
    }

    async fn publish(
        &self,
        _credential: &Credential,
        content: &Content,
    ) -> Result<String, PublishError> {
        let n = {
            let mut published = self.published.lock().unwrap();
            published.push(content.clone());
            published.len()
        };
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(format!("{}-{}", self.channel, n)))
    }
}
