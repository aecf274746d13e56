//! Bounded conversation memory per (user, coach).
//!
//! Each conversation is a rolling summary plus the messages not yet folded
//! into it. The manager only signals when a compression pass is due; the
//! summarizer itself runs elsewhere and reports back through
//! [`ConversationMemoryManager::complete_compression`]. The most recent
//! `recent_window` messages are never folded.

use std::fmt::Write as _;
use std::sync::Arc;

use tracing::{debug, info, warn};

use coach_core::conversation::ConversationWindow;
use coach_core::ids::{CoachId, ConversationKey, UserId};
use coach_core::messages::ChatMessage;
use coach_core::settings::MemorySettings;
use coach_store::{ConversationStore, StoreError};

use crate::cache::ReadThroughCache;

/// What a turn gets to see of its conversation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConversationContext {
    pub recent_messages: Vec<ChatMessage>,
    pub summary: Option<String>,
    pub count: u64,
}

impl From<ConversationWindow> for ConversationContext {
    fn from(w: ConversationWindow) -> Self {
        Self {
            recent_messages: w.recent_messages,
            summary: w.summary,
            count: w.message_count,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AddMessageOutcome {
    pub window: ConversationWindow,
    /// The unsummarized window is over the compression threshold.
    pub needs_compression: bool,
}

pub struct ConversationMemoryManager {
    store: Arc<dyn ConversationStore>,
    settings: MemorySettings,
    cache: ReadThroughCache<ConversationKey, ConversationWindow>,
}

impl ConversationMemoryManager {
    pub fn new(store: Arc<dyn ConversationStore>, settings: MemorySettings) -> Self {
        Self {
            store,
            settings,
            cache: ReadThroughCache::new(),
        }
    }

    pub fn settings(&self) -> &MemorySettings {
        &self.settings
    }

    /// Current context. A store failure yields the empty context so the turn
    /// can go on without history.
    pub async fn get_context(&self, user_id: &UserId, coach_id: &CoachId) -> ConversationContext {
        let key = ConversationKey::new(user_id, coach_id);
        match self.load(&key).await {
            Ok(window) => window.into(),
            Err(e) => {
                warn!(user_id = %user_id, coach_id = %coach_id, error = %e, "conversation store unavailable, continuing without history");
                ConversationContext::default()
            }
        }
    }

    pub async fn add_message(
        &self,
        user_id: &UserId,
        coach_id: &CoachId,
        message: ChatMessage,
    ) -> Result<AddMessageOutcome, StoreError> {
        let key = ConversationKey::new(user_id, coach_id);
        let window = match self.store.append(&key, &message).await {
            Ok(window) => window,
            Err(e) => {
                self.cache.invalidate(&key);
                return Err(e);
            }
        };
        self.cache.put(key, window.clone());

        let needs_compression = window.recent_messages.len() > self.settings.compression_threshold;
        if needs_compression {
            debug!(
                user_id = %user_id,
                coach_id = %coach_id,
                unsummarized = window.recent_messages.len(),
                threshold = self.settings.compression_threshold,
                "conversation needs compression"
            );
        }
        Ok(AddMessageOutcome {
            window,
            needs_compression,
        })
    }

    /// Prompt text: summary, then recent messages oldest first, then the total
    /// message count. Empty sections are left out.
    pub async fn get_prompt_context(&self, user_id: &UserId, coach_id: &CoachId) -> String {
        render_prompt_context(&self.get_context(user_id, coach_id).await)
    }

    pub async fn clear(&self, user_id: &UserId, coach_id: &CoachId) -> Result<(), StoreError> {
        let key = ConversationKey::new(user_id, coach_id);
        self.cache.invalidate(&key);
        self.store.clear(&key).await?;
        info!(user_id = %user_id, coach_id = %coach_id, "conversation cleared");
        Ok(())
    }

    /// Messages a compression pass may fold: everything older than the last
    /// `recent_window` messages.
    pub async fn compression_candidates(
        &self,
        user_id: &UserId,
        coach_id: &CoachId,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let key = ConversationKey::new(user_id, coach_id);
        let window = self.load(&key).await?;
        Ok(window.foldable(self.settings.recent_window).to_vec())
    }

    /// Install a summary produced from the oldest `folded` messages.
    ///
    /// `folded` is clamped against a fresh read so that messages appended
    /// since the candidates were taken can never push the last
    /// `recent_window` messages out.
    pub async fn complete_compression(
        &self,
        user_id: &UserId,
        coach_id: &CoachId,
        summary: &str,
        folded: usize,
    ) -> Result<ConversationWindow, StoreError> {
        let key = ConversationKey::new(user_id, coach_id);
        let store = self.store.clone();
        let fresh = self
            .cache
            .resync(key.clone(), || async { store.load(&key).await })
            .await?;

        let allowed = fresh.foldable(self.settings.recent_window).len();
        let folded = folded.min(allowed);

        match self.store.fold(&key, summary, folded).await {
            Ok(window) => {
                info!(
                    user_id = %user_id,
                    coach_id = %coach_id,
                    folded,
                    remaining = window.recent_messages.len(),
                    "conversation compressed"
                );
                self.cache.put(key, window.clone());
                Ok(window)
            }
            Err(e) => {
                self.cache.invalidate(&key);
                Err(e)
            }
        }
    }

    pub fn invalidate(&self, user_id: &UserId, coach_id: &CoachId) {
        self.cache.invalidate(&ConversationKey::new(user_id, coach_id));
    }

    /// Drop the cached window and reload it from the store.
    pub async fn resync(
        &self,
        user_id: &UserId,
        coach_id: &CoachId,
    ) -> Result<ConversationWindow, StoreError> {
        let key = ConversationKey::new(user_id, coach_id);
        let store = self.store.clone();
        self.cache
            .resync(key.clone(), || async { store.load(&key).await })
            .await
    }

    async fn load(&self, key: &ConversationKey) -> Result<ConversationWindow, StoreError> {
        let store = self.store.clone();
        self.cache
            .get_or_load(key.clone(), || async { store.load(key).await })
            .await
    }
}

pub fn render_prompt_context(ctx: &ConversationContext) -> String {
    let mut sections: Vec<String> = Vec::new();

    if let Some(summary) = ctx.summary.as_deref().filter(|s| !s.trim().is_empty()) {
        sections.push(format!("Summary of earlier conversation:\n{summary}"));
    }

    if !ctx.recent_messages.is_empty() {
        let mut recent = String::from("Recent messages:");
        for m in &ctx.recent_messages {
            let _ = write!(recent, "\n{}: {}", m.role, m.content);
        }
        sections.push(recent);
    }

    if ctx.count > 0 {
        sections.push(format!("Total messages in conversation: {}", ctx.count));
    }

    sections.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeConversations;
    use std::sync::atomic::Ordering;

    fn ids() -> (UserId, CoachId) {
        (UserId::from_raw("user_a"), CoachId::from_raw("coach_fit"))
    }

    fn manager(store: Arc<FakeConversations>) -> ConversationMemoryManager {
        ConversationMemoryManager::new(store, MemorySettings::default())
    }

    async fn fill(mgr: &ConversationMemoryManager, n: usize) -> AddMessageOutcome {
        let (user, coach) = ids();
        let mut last = None;
        for i in 0..n {
            last = Some(mgr.add_message(&user, &coach, ChatMessage::user(format!("m{i}"))).await.unwrap());
        }
        last.unwrap()
    }

    #[tokio::test]
    async fn compression_signalled_above_threshold() {
        let mgr = manager(Arc::new(FakeConversations::default()));
        assert!(!fill(&mgr, 20).await.needs_compression);

        let (user, coach) = ids();
        let outcome = mgr.add_message(&user, &coach, ChatMessage::user("m20")).await.unwrap();
        assert!(outcome.needs_compression);
        assert_eq!(outcome.window.message_count, 21);
        // the manager never compresses on its own
        assert_eq!(outcome.window.recent_messages.len(), 21);
    }

    #[tokio::test]
    async fn keeps_signalling_until_compressed() {
        let mgr = manager(Arc::new(FakeConversations::default()));
        assert!(fill(&mgr, 25).await.needs_compression);
        let (user, coach) = ids();
        let again = mgr.add_message(&user, &coach, ChatMessage::user("more")).await.unwrap();
        assert!(again.needs_compression);
    }

    #[tokio::test]
    async fn compression_keeps_recent_window() {
        let mgr = manager(Arc::new(FakeConversations::default()));
        fill(&mgr, 25).await;
        let (user, coach) = ids();

        let candidates = mgr.compression_candidates(&user, &coach).await.unwrap();
        assert_eq!(candidates.len(), 15);
        assert_eq!(candidates[0].content, "m0");

        // asking to fold more than allowed is clamped
        let window = mgr
            .complete_compression(&user, &coach, "earlier: m0..m24", 100)
            .await
            .unwrap();
        assert_eq!(window.recent_messages.len(), 10);
        assert_eq!(window.recent_messages[0].content, "m15");
        assert_eq!(window.summary.as_deref(), Some("earlier: m0..m24"));
        assert_eq!(window.message_count, 25);

        let next = mgr.add_message(&user, &coach, ChatMessage::user("m25")).await.unwrap();
        assert!(!next.needs_compression);
    }

    #[tokio::test]
    async fn clamp_accounts_for_messages_added_during_compression() {
        let mgr = manager(Arc::new(FakeConversations::default()));
        fill(&mgr, 22).await;
        let (user, coach) = ids();
        let candidates = mgr.compression_candidates(&user, &coach).await.unwrap();
        assert_eq!(candidates.len(), 12);

        for i in 0..3 {
            mgr.add_message(&user, &coach, ChatMessage::user(format!("late{i}"))).await.unwrap();
        }
        let window = mgr
            .complete_compression(&user, &coach, "summary", candidates.len())
            .await
            .unwrap();
        assert_eq!(window.recent_messages.len(), 13);
        assert_eq!(window.recent_messages.last().unwrap().content, "late2");
    }

    #[tokio::test]
    async fn prompt_context_orders_summary_first() {
        let mgr = manager(Arc::new(FakeConversations::default()));
        fill(&mgr, 12).await;
        let (user, coach) = ids();
        mgr.complete_compression(&user, &coach, "User wants to squat 100kg.", 2)
            .await
            .unwrap();

        let prompt = mgr.get_prompt_context(&user, &coach).await;
        let summary_at = prompt.find("User wants to squat").unwrap();
        let first_recent = prompt.find("user: m2").unwrap();
        let last_recent = prompt.find("user: m11").unwrap();
        assert!(summary_at < first_recent);
        assert!(first_recent < last_recent);
        assert!(prompt.ends_with("Total messages in conversation: 12"));
        assert!(!prompt.contains("user: m1\n"));
    }

    #[test]
    fn prompt_context_omits_empty_sections() {
        assert_eq!(render_prompt_context(&ConversationContext::default()), "");

        let ctx = ConversationContext {
            recent_messages: vec![ChatMessage::coach("Nice work")],
            summary: None,
            count: 1,
        };
        let prompt = render_prompt_context(&ctx);
        assert!(!prompt.contains("Summary"));
        assert!(prompt.starts_with("Recent messages:\ncoach: Nice work"));
    }

    #[tokio::test]
    async fn store_failure_degrades_to_empty_context() {
        let store = Arc::new(FakeConversations::default());
        store.set_failing(true);
        let mgr = manager(store);
        let (user, coach) = ids();

        assert_eq!(mgr.get_context(&user, &coach).await, ConversationContext::default());
        assert_eq!(mgr.get_prompt_context(&user, &coach).await, "");
    }

    #[tokio::test]
    async fn append_failure_is_reported_and_drops_cache() {
        let store = Arc::new(FakeConversations::default());
        let mgr = manager(store.clone());
        fill(&mgr, 2).await;
        let (user, coach) = ids();

        store.set_failing(true);
        assert!(mgr.add_message(&user, &coach, ChatMessage::user("x")).await.is_err());
        // the cached window was dropped, so the read goes to the failing store
        assert_eq!(mgr.get_context(&user, &coach).await.count, 0);

        store.set_failing(false);
        assert_eq!(mgr.get_context(&user, &coach).await.count, 2);
    }

    #[tokio::test]
    async fn reads_are_served_from_cache() {
        let store = Arc::new(FakeConversations::default());
        let mgr = manager(store.clone());
        fill(&mgr, 3).await;
        let (user, coach) = ids();

        mgr.get_context(&user, &coach).await;
        mgr.get_context(&user, &coach).await;
        assert_eq!(store.loads.load(Ordering::SeqCst), 0);

        mgr.invalidate(&user, &coach);
        mgr.get_context(&user, &coach).await;
        assert_eq!(store.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn clear_resets_conversation() {
        let mgr = manager(Arc::new(FakeConversations::default()));
        fill(&mgr, 4).await;
        let (user, coach) = ids();
        mgr.clear(&user, &coach).await.unwrap();
        assert_eq!(mgr.get_context(&user, &coach).await, ConversationContext::default());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_load_never_hides_a_newer_append() {
        let store = Arc::new(FakeConversations::default());
        *store.load_delay.lock() = Some(std::time::Duration::from_millis(100));
        let mgr = Arc::new(manager(store.clone()));
        let (user, coach) = ids();

        let reader = {
            let mgr = mgr.clone();
            let (user, coach) = (user.clone(), coach.clone());
            tokio::spawn(async move { mgr.get_context(&user, &coach).await })
        };
        // let the reader miss the cache and start its load
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(store.loads.load(Ordering::SeqCst), 1);

        mgr.add_message(&user, &coach, ChatMessage::user("hello")).await.unwrap();
        reader.await.unwrap();

        let ctx = mgr.get_context(&user, &coach).await;
        assert_eq!(ctx.count, 1);
        assert_eq!(ctx.recent_messages.len(), 1);
        assert_eq!(ctx.recent_messages[0].content, "hello");
        assert_eq!(store.loads.load(Ordering::SeqCst), 1);
    }
}
