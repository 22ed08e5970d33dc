//! The conversation controller.
//!
//! Owns per-chat memory and activation state, decides when the bot speaks,
//! services the two idle timers, and maps provider failures to a canned
//! apology. Inbound updates arrive one at a time from the transport loop;
//! timer handlers run as spawned tasks and take the same state lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use rand::Rng;

use crate::config::BotConfig;
use crate::llm_client::CompletionBackend;
use crate::memory::{ConversationMemory, Role, Turn};
use crate::scheduler::IdleScheduler;
use crate::telegram::{ChatTransport, IncomingMessage};

// ─── Canned replies ──────────────────────────────────────────────────────────

const OPERATOR_ONLY_REPLY: &str = "Sorry bro, that command is reserved for my creator.";
const GROUP_ONLY_REPLY: &str =
    "I'm a group-chat kind of guy. Add me to a group and we'll talk there!";
const ACTIVATED_REPLY: &str = "Ibrahim is in the house! Let's go!";
const DEACTIVATED_REPLY: &str = "Fine, I'll keep quiet. Ping me with /start when you miss me.";
const FAREWELL_REPLY: &str = "Alright folks, I'm off to get some sleep. Powering down...";
const NEEDS_START_REPLY: &str = "Wake me up with /start first.";
const PROVIDER_ERROR_REPLY: &str =
    "Hmm, something's up with my processor... can't think straight right now. Try me later.";

const IMAGE_DEFLECTIONS: [&str; 5] = [
    "I can tell there's something interesting in there, but my eyes are failing me today!",
    "Ooh, a picture! Shame I left my image-recognition glasses at home.",
    "High-quality visual content detected! The details, sadly, are classified.",
    "If only I had image-analysis superpowers... for now it's just a picture to me.",
    "Pete, is that you posting memes again? No caption, no comprehension!",
];

// ─── Synthetic prompts for idle triggers and commands ────────────────────────

const CHIME_IN_PROMPT: &str = "Ten minutes of silence have passed in the chat. Look over the \
     last few messages and, if there is something worth reacting to, drop a short remark to \
     liven things up. If there is nothing to say, just reply with the words: stay silent.";

const FOUR_HOUR_JOKE_PROMPT: &str = "The chat has been dead quiet for four hours. Time to \
     break the ice. Tell a fresh joke or a funny short story in your own style.";

const MOVIE_PROMPT: &str = "Recommend me a good movie. Action, thriller, comedy, or something \
     with real substance. Surprise me.";

const JOKE_PROMPT: &str = "Tell a funny joke or short story in your own style.";

/// Marker phrase a chime-in reply uses to decline speaking. Checked
/// case-insensitively against the whole reply.
const SILENCE_MARKER: &str = "stay silent";

fn chime_key(chat_id: i64) -> String {
    format!("chime_in_{chat_id}")
}

fn joke_key(chat_id: i64) -> String {
    format!("four_hour_joke_{chat_id}")
}

fn random_deflection() -> &'static str {
    let mut rng = rand::thread_rng();
    IMAGE_DEFLECTIONS[rng.gen_range(0..IMAGE_DEFLECTIONS.len())]
}

// ─── Commands ────────────────────────────────────────────────────────────────

/// Control commands, parsed from the first whitespace token of a text
/// message. A `/cmd@botname` suffix is honored only when it names this bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    Disconnect,
    Movie,
    Joke,
}

impl Command {
    pub fn parse(text: &str, bot_username: &str) -> Option<Self> {
        let first = text.split_whitespace().next()?;
        let token = first.strip_prefix('/')?;
        let name = match token.split_once('@') {
            Some((name, target)) => {
                if !target.eq_ignore_ascii_case(bot_username.trim_start_matches('@')) {
                    return None;
                }
                name
            }
            None => token,
        };

        match name {
            "start" => Some(Self::Start),
            "stop" => Some(Self::Stop),
            "disconnect" => Some(Self::Disconnect),
            "movie" => Some(Self::Movie),
            "joke" => Some(Self::Joke),
            _ => None,
        }
    }
}

// ─── Per-chat state ──────────────────────────────────────────────────────────

/// Whether the bot is allowed to speak in a chat. Flipped only by the
/// operator; deactivation never touches conversation memory.
#[derive(Debug, Default)]
pub struct ActivationRegistry {
    active: HashMap<i64, bool>,
}

impl ActivationRegistry {
    pub fn activate(&mut self, chat_id: i64) {
        self.active.insert(chat_id, true);
    }

    pub fn deactivate(&mut self, chat_id: i64) {
        self.active.insert(chat_id, false);
    }

    pub fn is_active(&self, chat_id: i64) -> bool {
        self.active.get(&chat_id).copied().unwrap_or(false)
    }
}

#[derive(Default)]
struct RoomState {
    memory: ConversationMemory,
    activation: ActivationRegistry,
}

// ─── Agent ───────────────────────────────────────────────────────────────────

pub struct Agent {
    config: BotConfig,
    transport: Arc<dyn ChatTransport>,
    backend: Arc<dyn CompletionBackend>,
    scheduler: IdleScheduler,
    state: Mutex<RoomState>,
    shutdown_tx: flume::Sender<()>,
}

impl Agent {
    pub fn new(
        config: BotConfig,
        transport: Arc<dyn ChatTransport>,
        backend: Arc<dyn CompletionBackend>,
        shutdown_tx: flume::Sender<()>,
    ) -> Self {
        Self {
            config,
            transport,
            backend,
            scheduler: IdleScheduler::new(),
            state: Mutex::new(RoomState::default()),
            shutdown_tx,
        }
    }

    /// Helper to lock the shared room state
    fn lock_state(&self) -> Result<MutexGuard<'_, RoomState>> {
        self.state
            .lock()
            .map_err(|e| anyhow::anyhow!("Room state lock poisoned: {}", e))
    }

    /// Entry point for every inbound update, called in arrival order.
    pub async fn handle_update(self: Arc<Self>, msg: IncomingMessage) -> Result<()> {
        if let Some(command) = msg
            .text
            .as_deref()
            .and_then(|text| Command::parse(text, &self.config.bot_username))
        {
            return self.handle_command(command, &msg).await;
        }
        self.handle_message(msg).await
    }

    async fn handle_command(&self, command: Command, msg: &IncomingMessage) -> Result<()> {
        if let Some(rejection) = self.command_rejection(msg) {
            self.send(msg.chat_id, rejection).await;
            return Ok(());
        }

        match command {
            Command::Start => self.cmd_start(msg).await,
            Command::Stop => self.cmd_stop(msg).await,
            Command::Disconnect => self.cmd_disconnect(msg).await,
            Command::Movie => self.cmd_prompted_reply(msg, MOVIE_PROMPT).await,
            Command::Joke => self.cmd_prompted_reply(msg, JOKE_PROMPT).await,
        }
    }

    /// Guards for control commands: operator identity first, then the
    /// group-chat requirement.
    fn command_rejection(&self, msg: &IncomingMessage) -> Option<&'static str> {
        if msg.sender_id != self.config.admin_id {
            return Some(OPERATOR_ONLY_REPLY);
        }
        if msg.is_private {
            return Some(GROUP_ONLY_REPLY);
        }
        None
    }

    /// A plain (non-command) message: record it, answer a mention if the
    /// chat is active, then push both idle timers out.
    async fn handle_message(self: Arc<Self>, msg: IncomingMessage) -> Result<()> {
        if msg.is_private {
            return Ok(());
        }

        let entry = format!("{}: {}", msg.sender_name, msg.body());
        let active = {
            let mut state = self.lock_state()?;
            state.memory.append(msg.chat_id, Turn::user(entry));
            state.activation.is_active(msg.chat_id)
        };

        if active && msg.body().contains(&self.config.bot_username) {
            if let Err(e) = self.transport.send_typing(msg.chat_id).await {
                tracing::debug!("Typing indicator failed for chat {}: {:#}", msg.chat_id, e);
            }

            let response = if msg.has_photo {
                let line = random_deflection();
                self.lock_state()?
                    .memory
                    .append(msg.chat_id, Turn::assistant(line));
                line.to_string()
            } else {
                match self.generate_reply(msg.chat_id).await {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!("Completion failed for chat {}: {:#}", msg.chat_id, e);
                        PROVIDER_ERROR_REPLY.to_string()
                    }
                }
            };

            if !response.is_empty() {
                self.send(msg.chat_id, &response).await;
            }
        }

        self.rearm_idle_timers(msg.chat_id);
        Ok(())
    }

    /// Build `persona + room transcript`, ask the completion backend, and on
    /// success record the reply as an assistant turn before returning it.
    /// Callers that end up discarding a successful reply must roll the
    /// memory back themselves.
    async fn generate_reply(&self, chat_id: i64) -> Result<String> {
        let turns = {
            let state = self.lock_state()?;
            if !state.memory.has_room(chat_id) {
                anyhow::bail!("No conversation context for chat {}", chat_id);
            }
            let mut turns = vec![Turn::system(self.config.persona.clone())];
            turns.extend(state.memory.snapshot(chat_id));
            turns
        };

        let text = self.backend.complete(&turns).await?;
        self.lock_state()?
            .memory
            .append(chat_id, Turn::assistant(text.clone()));
        Ok(text)
    }

    /// Cancel-and-replace both idle timers for the chat. Runs exactly once
    /// per observed inbound message, whether or not the bot replied.
    fn rearm_idle_timers(self: Arc<Self>, chat_id: i64) {
        let short = Duration::from_secs(self.config.short_idle_secs);
        let long = Duration::from_secs(self.config.long_idle_secs);

        let agent = Arc::clone(&self);
        self.scheduler.schedule(chime_key(chat_id), short, async move {
            if let Err(e) = agent.chime_in(chat_id).await {
                tracing::error!("Chime-in handler failed for chat {}: {:#}", chat_id, e);
            }
        });

        let agent = Arc::clone(&self);
        self.scheduler.schedule(joke_key(chat_id), long, async move {
            if let Err(e) = agent.four_hour_joke(chat_id).await {
                tracing::error!("Joke handler failed for chat {}: {:#}", chat_id, e);
            }
        });
    }

    // ─── Commands ────────────────────────────────────────────────────────────

    async fn cmd_start(&self, msg: &IncomingMessage) -> Result<()> {
        self.lock_state()?.activation.activate(msg.chat_id);
        tracing::info!("Activated in chat {}", msg.chat_id);
        self.send(msg.chat_id, ACTIVATED_REPLY).await;
        Ok(())
    }

    /// Deactivate and drop pending idle timers. Memory stays.
    async fn cmd_stop(&self, msg: &IncomingMessage) -> Result<()> {
        self.lock_state()?.activation.deactivate(msg.chat_id);
        self.scheduler.cancel(&chime_key(msg.chat_id));
        self.scheduler.cancel(&joke_key(msg.chat_id));
        tracing::info!("Deactivated in chat {}", msg.chat_id);
        self.send(msg.chat_id, DEACTIVATED_REPLY).await;
        Ok(())
    }

    async fn cmd_disconnect(&self, msg: &IncomingMessage) -> Result<()> {
        self.send(msg.chat_id, FAREWELL_REPLY).await;
        tracing::info!("Disconnect requested from chat {}", msg.chat_id);
        let _ = self.shutdown_tx.send(());
        Ok(())
    }

    /// /movie and /joke: feed a synthetic user prompt through the normal
    /// generation path. Requires the chat to be activated first.
    async fn cmd_prompted_reply(&self, msg: &IncomingMessage, prompt: &str) -> Result<()> {
        let active = {
            let mut state = self.lock_state()?;
            state.memory.ensure_room(msg.chat_id);
            state.activation.is_active(msg.chat_id)
        };
        if !active {
            self.send(msg.chat_id, NEEDS_START_REPLY).await;
            return Ok(());
        }

        if let Err(e) = self.transport.send_typing(msg.chat_id).await {
            tracing::debug!("Typing indicator failed for chat {}: {:#}", msg.chat_id, e);
        }
        self.lock_state()?
            .memory
            .append(msg.chat_id, Turn::user(prompt));

        let response = match self.generate_reply(msg.chat_id).await {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("Completion failed for chat {}: {:#}", msg.chat_id, e);
                PROVIDER_ERROR_REPLY.to_string()
            }
        };
        self.send(msg.chat_id, &response).await;
        Ok(())
    }

    // ─── Idle triggers ───────────────────────────────────────────────────────

    /// Short-idle trigger: offer the model one chance to break the silence.
    /// The synthetic prompt and the reply both stay in memory when it
    /// speaks; both are rolled back when it declines.
    async fn chime_in(&self, chat_id: i64) -> Result<()> {
        {
            let mut state = self.lock_state()?;
            if !state.activation.is_active(chat_id)
                || state.memory.is_empty(chat_id)
                || state.memory.last_role(chat_id) == Some(Role::Assistant)
            {
                tracing::debug!(
                    "Chime-in skipped for chat {}: inactive, empty, or bot spoke last",
                    chat_id
                );
                return Ok(());
            }
            state.memory.append(chat_id, Turn::user(CHIME_IN_PROMPT));
        }
        tracing::info!("Chime-in triggered for chat {}", chat_id);

        match self.generate_reply(chat_id).await {
            Ok(text) => {
                if !text.is_empty() && !text.to_lowercase().contains(SILENCE_MARKER) {
                    self.send(chat_id, &text).await;
                } else {
                    let removed = self.lock_state()?.memory.pop_last(chat_id, 2);
                    if removed != 2 {
                        tracing::warn!(
                            "Chime-in rollback removed {} turns in chat {}",
                            removed,
                            chat_id
                        );
                    }
                }
            }
            Err(e) => {
                tracing::error!("Chime-in completion failed for chat {}: {:#}", chat_id, e);
                self.send(chat_id, PROVIDER_ERROR_REPLY).await;
            }
        }
        Ok(())
    }

    /// Long-idle trigger: four hours of silence earns an unprompted joke,
    /// sent unconditionally as long as the chat is active.
    async fn four_hour_joke(&self, chat_id: i64) -> Result<()> {
        {
            let mut state = self.lock_state()?;
            if !state.activation.is_active(chat_id) {
                return Ok(());
            }
            state
                .memory
                .append(chat_id, Turn::user(FOUR_HOUR_JOKE_PROMPT));
        }
        tracing::info!("Four-hour joke triggered for chat {}", chat_id);

        let response = match self.generate_reply(chat_id).await {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("Joke completion failed for chat {}: {:#}", chat_id, e);
                PROVIDER_ERROR_REPLY.to_string()
            }
        };
        self.send(chat_id, &response).await;
        Ok(())
    }

    /// Send a message to a chat; delivery failures are logged, not fatal.
    async fn send(&self, chat_id: i64, text: &str) {
        if let Err(e) = self.transport.send_message(chat_id, text).await {
            tracing::warn!("Failed to send message to chat {}: {:#}", chat_id, e);
        }
    }
}
