/// The palette session: mode, input, chat messages and request lifecycle.
///
/// The controller is synchronous and owned by the host's event loop. Sending
/// a message spawns the transport on the ambient tokio runtime; streamed
/// output comes back as `ChatEvent`s on the receiver returned by `new`, and
/// the host feeds each one to `apply_chat_event`. Every request carries an
/// id, so events from a request abandoned by "new chat" or "load" are dropped.
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::commands::{ask_ai_matches, CommandAction, CommandDefinition, FuzzyMatch};
use crate::history::{Conversation, ConversationHistory, ConversationSummary};
use crate::message::{Approval, ApprovalDecision, ChatStatus, Message, Mode, Role, ToolCall};
use crate::telemetry::{guard, ErrorReporter, TracingReporter};
use crate::transport::{dispatch, ChatBackend, ChatEvent, ChatRequest, ChatTransport, RequestId};

const RECENT_LIMIT: usize = 5;

pub type ModeChangeFn = Box<dyn Fn(Mode) -> Result<()>>;
pub type OpenChangeFn = Box<dyn Fn(bool) -> Result<()>>;

// ── Outcomes ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Dispatched(RequestId),
    /// Blank after trimming
    Empty,
    /// No chat backend configured
    Disabled,
    WrongMode,
    /// A request is already in flight
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Recorded,
    AlreadyDecided,
    /// The call runs without approval; nothing to record
    NotRequested,
    UnknownToolCall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaletteKey {
    Escape,
    Enter { modifier: bool, shift: bool },
    /// Mod+K
    Toggle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOutcome {
    /// Not ours; the host handles it (list navigation, newline, ...)
    Unhandled,
    Opened,
    Closed,
    ModeChanged(Mode),
    Sent(SendOutcome),
}

/// What a custom command-list renderer gets to see.
#[derive(Debug, Clone, Copy)]
pub struct RenderContext<'a> {
    pub mode: Mode,
    pub messages: &'a [Message],
    pub status: ChatStatus,
    pub is_enabled: bool,
}

// ── Controller ────────────────────────────────────────────────────────────────

pub struct Controller {
    mode: Mode,
    open: bool,
    input: String,
    messages: Vec<Message>,
    status: ChatStatus,
    active_conversation_id: Option<String>,

    transport: Option<Arc<dyn ChatTransport>>,
    history: Arc<ConversationHistory>,
    recent: Vec<ConversationSummary>,

    events_tx: mpsc::UnboundedSender<ChatEvent>,
    next_request: RequestId,
    in_flight: Option<RequestId>,
    /// The spawned transport task of `in_flight`
    task: Option<AbortHandle>,
    /// Assistant message the in-flight request writes into
    streaming_into: Option<String>,
    /// An approval was recorded; resume once every pending call is decided
    awaiting_resume: bool,

    on_mode_change: Option<ModeChangeFn>,
    on_open_change: Option<OpenChangeFn>,
    reporter: Arc<dyn ErrorReporter>,
    /// A host callback failed; the list renders an empty fallback until reopen
    faulted: bool,
}

impl Controller {
    pub fn new(
        transport: Option<Arc<dyn ChatTransport>>,
        history: Arc<ConversationHistory>,
    ) -> (Self, mpsc::UnboundedReceiver<ChatEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let recent = history.summaries(RECENT_LIMIT);
        let controller = Self {
            mode: Mode::Command,
            open: false,
            input: String::new(),
            messages: Vec::new(),
            status: ChatStatus::Idle,
            active_conversation_id: None,
            transport,
            history,
            recent,
            events_tx,
            next_request: 1,
            in_flight: None,
            task: None,
            streaming_into: None,
            awaiting_resume: false,
            on_mode_change: None,
            on_open_change: None,
            reporter: Arc::new(TracingReporter),
            faulted: false,
        };
        (controller, events_rx)
    }

    pub fn from_backend(
        backend: Option<ChatBackend>,
        history: Arc<ConversationHistory>,
    ) -> (Self, mpsc::UnboundedReceiver<ChatEvent>) {
        Self::new(backend.map(ChatBackend::into_transport), history)
    }

    pub fn on_mode_change(mut self, f: impl Fn(Mode) -> Result<()> + 'static) -> Self {
        self.on_mode_change = Some(Box::new(f));
        self
    }

    pub fn on_open_change(mut self, f: impl Fn(bool) -> Result<()> + 'static) -> Self {
        self.on_open_change = Some(Box::new(f));
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn status(&self) -> ChatStatus {
        self.status
    }

    pub fn active_conversation_id(&self) -> Option<&str> {
        self.active_conversation_id.as_deref()
    }

    /// Chat is available (a transport is configured).
    pub fn is_enabled(&self) -> bool {
        self.transport.is_some()
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted
    }

    pub fn recent_conversations(&self) -> &[ConversationSummary] {
        &self.recent
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    pub fn render_context(&self) -> RenderContext<'_> {
        RenderContext {
            mode: self.mode,
            messages: &self.messages,
            status: self.status,
            is_enabled: self.is_enabled(),
        }
    }

    // ── Open / close ─────────────────────────────────────────────────────────

    pub fn set_open(&mut self, open: bool) {
        if open == self.open {
            return;
        }
        self.open = open;
        if open {
            self.input.clear();
            self.faulted = false;
            self.set_mode(Mode::Command);
            self.refresh_recent();
        } else {
            self.archive_session();
        }
        if let Some(cb) = &self.on_open_change {
            guard(self.reporter.as_ref(), "on_open_change", || cb(open));
        }
    }

    pub fn toggle(&mut self) {
        self.set_open(!self.open);
    }

    // ── Mode ─────────────────────────────────────────────────────────────────

    /// No-op (returns false) when chat is disabled.
    pub fn switch_to_chat(&mut self) -> bool {
        if !self.is_enabled() {
            return false;
        }
        self.set_mode(Mode::Chat);
        true
    }

    pub fn switch_to_command(&mut self) {
        self.input.clear();
        self.set_mode(Mode::Command);
    }

    fn set_mode(&mut self, mode: Mode) {
        if self.mode == mode {
            return;
        }
        debug!(?mode, "mode change");
        self.mode = mode;
        if let Some(cb) = &self.on_mode_change {
            guard(self.reporter.as_ref(), "on_mode_change", || cb(mode));
        }
    }

    pub fn set_input(&mut self, value: impl Into<String>) {
        self.input = value.into();
    }

    // ── Keys ─────────────────────────────────────────────────────────────────

    pub fn handle_key(&mut self, key: PaletteKey) -> KeyOutcome {
        match key {
            PaletteKey::Toggle => {
                self.toggle();
                if self.open { KeyOutcome::Opened } else { KeyOutcome::Closed }
            }
            PaletteKey::Escape => match self.mode {
                Mode::Chat => {
                    self.switch_to_command();
                    KeyOutcome::ModeChanged(Mode::Command)
                }
                Mode::Command => {
                    self.set_open(false);
                    KeyOutcome::Closed
                }
            },
            PaletteKey::Enter { modifier: true, .. } => {
                if self.input.trim().is_empty() {
                    return KeyOutcome::Unhandled;
                }
                match self.mode {
                    Mode::Chat => KeyOutcome::Sent(self.send_input()),
                    Mode::Command => {
                        if !self.is_enabled() {
                            return KeyOutcome::Unhandled;
                        }
                        let text = std::mem::take(&mut self.input);
                        self.start_new_chat();
                        self.switch_to_chat();
                        KeyOutcome::Sent(self.send_message(&text))
                    }
                }
            }
            PaletteKey::Enter { shift: false, .. } if self.mode == Mode::Chat => {
                if self.input.trim().is_empty() {
                    return KeyOutcome::Unhandled;
                }
                KeyOutcome::Sent(self.send_input())
            }
            PaletteKey::Enter { .. } => KeyOutcome::Unhandled,
        }
    }

    fn send_input(&mut self) -> SendOutcome {
        let text = self.input.clone();
        self.send_message(&text)
    }

    // ── List selections ──────────────────────────────────────────────────────

    /// The Ask-AI entry. With text and no other match the text becomes the
    /// first message of a new chat; otherwise we just enter chat mode.
    pub fn select_ask_ai(&mut self, regular_match_count: usize, matcher: &dyn FuzzyMatch) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let query = self.input.trim().to_string();
        if query.is_empty() {
            return self.switch_to_chat();
        }
        if regular_match_count == 0 && !ask_ai_matches(matcher, &query) {
            let text = std::mem::take(&mut self.input);
            self.start_new_chat();
            self.switch_to_chat();
            self.send_message(&text);
        } else {
            self.switch_to_chat();
            self.input.clear();
        }
        true
    }

    /// Run a command's `on_select`. A failing callback is reported and puts
    /// the palette into its faulted state; returns whether it succeeded.
    pub fn select_command(&mut self, command: &CommandDefinition) -> bool {
        if command.disabled {
            return false;
        }
        let Some(on_select) = &command.on_select else {
            return true;
        };
        let context = format!("on_select:{}", command.name);
        match guard(self.reporter.as_ref(), &context, || on_select()) {
            Some(()) => true,
            None => {
                self.faulted = true;
                false
            }
        }
    }

    pub fn select_action(&mut self, action: &CommandAction) -> SendOutcome {
        if !self.is_enabled() {
            return SendOutcome::Disabled;
        }
        let label = action.display_label().to_string();
        self.start_new_chat();
        self.switch_to_chat();
        self.send_message(&label)
    }

    // ── Conversations ────────────────────────────────────────────────────────

    /// Archive the current session (if it has an exchange) and reset it.
    pub fn start_new_chat(&mut self) {
        self.archive_session();
        self.reset_session();
    }

    /// Replace the session with a copy of a stored conversation and enter chat mode.
    /// Choosing the conversation that is already active keeps the live session,
    /// which is never older than the stored copy.
    pub fn load_conversation(&mut self, id: &str) -> bool {
        if self.active_conversation_id.as_deref() == Some(id) {
            self.archive_session();
            self.input.clear();
            self.set_mode(Mode::Chat);
            return true;
        }
        let Some(messages) = self.history.load(id) else {
            warn!(id, "conversation not found");
            return false;
        };
        self.archive_session();
        self.reset_session();
        self.messages = messages;
        self.active_conversation_id = Some(id.to_string());
        self.input.clear();
        self.set_mode(Mode::Chat);
        true
    }

    fn reset_session(&mut self) {
        if let Some(task) = self.task.take() {
            debug!(request = ?self.in_flight, "aborting abandoned chat request");
            task.abort();
        }
        self.messages.clear();
        self.status = ChatStatus::Idle;
        self.active_conversation_id = None;
        self.in_flight = None;
        self.streaming_into = None;
        self.awaiting_resume = false;
    }

    fn archive_session(&mut self) {
        if !self.messages.iter().any(|m| m.role == Role::User) {
            return;
        }
        let conversation = match &self.active_conversation_id {
            Some(id) => Conversation::with_id(id.clone(), self.messages.clone()),
            None => Conversation::new(self.messages.clone()),
        };
        match self.history.save(conversation) {
            Ok(stored) => {
                debug!(id = %stored.id, title = %stored.title, "conversation saved");
                self.active_conversation_id = Some(stored.id);
            }
            Err(e) => warn!("saving conversation failed: {e:#}"),
        }
        self.refresh_recent();
    }

    pub fn refresh_recent(&mut self) {
        self.recent = self.history.summaries(RECENT_LIMIT);
    }

    // ── Sending ──────────────────────────────────────────────────────────────

    pub fn send_message(&mut self, text: &str) -> SendOutcome {
        if !self.is_enabled() {
            return SendOutcome::Disabled;
        }
        if self.mode != Mode::Chat {
            return SendOutcome::WrongMode;
        }
        if text.trim().is_empty() {
            return SendOutcome::Empty;
        }
        if self.in_flight.is_some() {
            return SendOutcome::Busy;
        }
        self.messages.push(Message::user(text));
        self.input.clear();
        SendOutcome::Dispatched(self.start_request(None))
    }

    fn start_request(&mut self, continue_into: Option<String>) -> RequestId {
        let id = self.next_request;
        self.next_request += 1;
        self.in_flight = Some(id);
        self.streaming_into = continue_into;
        self.status = ChatStatus::Submitted;

        let Some(transport) = self.transport.clone() else {
            self.apply_chat_event(ChatEvent::Failed { request: id, error: "chat is disabled".into() });
            return id;
        };
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                warn!("no async runtime for chat request: {e}");
                self.apply_chat_event(ChatEvent::Failed {
                    request: id,
                    error: "no async runtime available".into(),
                });
                return id;
            }
        };
        let request = ChatRequest { id, messages: self.messages.clone() };
        debug!(request = id, messages = request.messages.len(), "dispatching chat request");
        let task = dispatch(&handle, transport, request, self.events_tx.clone());
        self.task = Some(task.abort_handle());
        id
    }

    // ── Streamed events ──────────────────────────────────────────────────────

    pub fn apply_chat_event(&mut self, event: ChatEvent) {
        if self.in_flight != Some(event.request_id()) {
            debug!(request = event.request_id(), "dropping stale chat event");
            return;
        }
        match event {
            ChatEvent::Delta { text, .. } => {
                self.status = ChatStatus::Streaming;
                self.streaming_message().content.push_str(&text);
            }
            ChatEvent::ToolCall { call, .. } => {
                self.status = ChatStatus::Streaming;
                upsert_tool_call(self.streaming_message(), call);
            }
            ChatEvent::Finished { .. } => {
                self.streaming_message();
                self.finish_request(ChatStatus::Idle);
                self.maybe_resume();
            }
            ChatEvent::Failed { error, .. } => {
                self.streaming_message().error = Some(error);
                self.finish_request(ChatStatus::Error);
            }
        }
    }

    fn finish_request(&mut self, status: ChatStatus) {
        self.status = status;
        self.in_flight = None;
        self.task = None;
        self.streaming_into = None;
    }

    /// The assistant message the current request writes into, created on first use.
    fn streaming_message(&mut self) -> &mut Message {
        let idx = self
            .streaming_into
            .as_ref()
            .and_then(|id| self.messages.iter().position(|m| &m.id == id));
        let idx = match idx {
            Some(idx) => idx,
            None => {
                let message = Message::assistant("");
                self.streaming_into = Some(message.id.clone());
                self.messages.push(message);
                self.messages.len() - 1
            }
        };
        &mut self.messages[idx]
    }

    // ── Tool approvals ───────────────────────────────────────────────────────

    pub fn add_tool_approval_response(&mut self, decision: ApprovalDecision<'_>) -> ApprovalOutcome {
        let Some(call) = self
            .messages
            .iter_mut()
            .rev()
            .find_map(|m| m.tool_call_mut(decision.id))
        else {
            return ApprovalOutcome::UnknownToolCall;
        };
        match call.approval {
            Approval::NotRequired => return ApprovalOutcome::NotRequested,
            Approval::Approved | Approval::Rejected => return ApprovalOutcome::AlreadyDecided,
            Approval::Pending => {}
        }
        call.approval = if decision.approved { Approval::Approved } else { Approval::Rejected };
        debug!(tool_call = decision.id, approved = decision.approved, "tool approval recorded");
        self.awaiting_resume = true;
        self.maybe_resume();
        ApprovalOutcome::Recorded
    }

    /// Forward decisions by resuming the transport once nothing is pending.
    fn maybe_resume(&mut self) {
        if !self.awaiting_resume || self.in_flight.is_some() || !self.is_enabled() {
            return;
        }
        let Some(last) = self.messages.iter().rev().find(|m| m.role == Role::Assistant) else {
            return;
        };
        if last.tool_calls.iter().any(ToolCall::needs_decision) {
            return;
        }
        let target = last.id.clone();
        self.awaiting_resume = false;
        self.start_request(Some(target));
    }
}

fn upsert_tool_call(message: &mut Message, call: ToolCall) {
    match message.tool_call_mut(&call.id) {
        Some(existing) => {
            let decided = existing.approval.is_decided();
            let approval = existing.approval;
            *existing = call;
            if decided {
                existing.approval = approval;
            }
        }
        None => message.tool_calls.push(call),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::SkimFuzzy;
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::transport::ChatSink;

    #[derive(Clone)]
    enum Step {
        Text(&'static str),
        Tool(&'static str, Approval),
        Fail(&'static str),
    }

    /// Plays one script per request and records what it was sent.
    #[derive(Default)]
    struct Scripted {
        scripts: Mutex<VecDeque<Vec<Step>>>,
        seen: Mutex<Vec<ChatRequest>>,
    }

    impl Scripted {
        fn new(scripts: Vec<Vec<Step>>) -> Arc<Self> {
            Arc::new(Self { scripts: Mutex::new(scripts.into()), seen: Mutex::default() })
        }
    }

    #[async_trait]
    impl ChatTransport for Scripted {
        async fn stream(&self, request: ChatRequest, sink: ChatSink) -> Result<()> {
            self.seen.lock().unwrap().push(request);
            let script = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
            for step in script {
                match step {
                    Step::Text(t) => {
                        sink.delta(t);
                    }
                    Step::Tool(id, approval) => {
                        sink.tool_call(ToolCall {
                            id: id.into(),
                            name: "delete_file".into(),
                            input: serde_json::Value::Null,
                            approval,
                        });
                    }
                    Step::Fail(e) => anyhow::bail!(e),
                }
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct Capture(Mutex<Vec<String>>);

    impl ErrorReporter for Capture {
        fn capture(&self, _error: &anyhow::Error, context: &str) {
            self.0.lock().unwrap().push(context.to_string());
        }
    }

    fn history() -> Arc<ConversationHistory> {
        Arc::new(ConversationHistory::new(Arc::new(MemoryStorage::new()), "test", 10))
    }

    fn controller(transport: Arc<Scripted>) -> (Controller, mpsc::UnboundedReceiver<ChatEvent>) {
        let (mut c, rx) = Controller::new(Some(transport), history());
        c.set_open(true);
        (c, rx)
    }

    async fn settle(c: &mut Controller, rx: &mut mpsc::UnboundedReceiver<ChatEvent>) {
        while c.status().is_loading() {
            let ev = rx.recv().await.unwrap();
            c.apply_chat_event(ev);
        }
    }

    #[tokio::test]
    async fn test_send_appends_user_then_one_assistant() {
        let transport = Scripted::new(vec![vec![Step::Text("Hi "), Step::Text("there")]]);
        let (mut c, mut rx) = controller(transport.clone());
        assert!(c.switch_to_chat());

        assert!(matches!(c.send_message("hello"), SendOutcome::Dispatched(_)));
        assert_eq!(c.status(), ChatStatus::Submitted);
        settle(&mut c, &mut rx).await;

        assert_eq!(c.status(), ChatStatus::Idle);
        let msgs = c.messages();
        assert_eq!(msgs.len(), 2);
        assert_eq!((msgs[0].role, msgs[0].content.as_str()), (Role::User, "hello"));
        assert_eq!((msgs[1].role, msgs[1].content.as_str()), (Role::Assistant, "Hi there"));
        assert_eq!(transport.seen.lock().unwrap()[0].messages.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_reply_still_yields_one_assistant_message() {
        let (mut c, mut rx) = controller(Scripted::new(vec![vec![]]));
        c.switch_to_chat();
        c.send_message("hello");
        settle(&mut c, &mut rx).await;
        assert_eq!(c.messages().len(), 2);
        assert_eq!(c.messages()[1].role, Role::Assistant);
        assert!(c.messages()[1].content.is_empty());
    }

    #[tokio::test]
    async fn test_blank_and_wrong_mode_sends_are_noops() {
        let (mut c, _rx) = controller(Scripted::new(vec![]));
        assert_eq!(c.send_message("hello"), SendOutcome::WrongMode);
        c.switch_to_chat();
        assert_eq!(c.send_message(""), SendOutcome::Empty);
        assert_eq!(c.send_message("   \n"), SendOutcome::Empty);
        assert!(c.messages().is_empty());
        assert_eq!(c.status(), ChatStatus::Idle);
    }

    #[tokio::test]
    async fn test_second_send_while_in_flight_is_rejected() {
        let (mut c, mut rx) = controller(Scripted::new(vec![vec![Step::Text("one")], vec![Step::Text("two")]]));
        c.switch_to_chat();
        c.set_input("second");
        assert!(matches!(c.send_message("first"), SendOutcome::Dispatched(_)));
        c.set_input("second");
        assert_eq!(c.handle_key(PaletteKey::Enter { modifier: false, shift: false }), KeyOutcome::Sent(SendOutcome::Busy));
        assert_eq!(c.input(), "second");
        settle(&mut c, &mut rx).await;
        assert!(matches!(c.send_message("second"), SendOutcome::Dispatched(_)));
        settle(&mut c, &mut rx).await;
        let contents: Vec<_> = c.messages().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "one", "second", "two"]);
    }

    #[tokio::test]
    async fn test_failure_keeps_partial_output_with_error_marker() {
        let (mut c, mut rx) = controller(Scripted::new(vec![vec![Step::Text("partial"), Step::Fail("reset")]]));
        c.switch_to_chat();
        c.send_message("hello");
        settle(&mut c, &mut rx).await;
        assert_eq!(c.status(), ChatStatus::Error);
        let last = c.messages().last().unwrap();
        assert_eq!(last.content, "partial");
        assert!(last.error.as_deref().unwrap().contains("reset"));
        assert_eq!(c.messages().len(), 2);
    }

    #[tokio::test]
    async fn test_failure_without_output_appends_error_message() {
        let (mut c, mut rx) = controller(Scripted::new(vec![vec![Step::Fail("down")]]));
        c.switch_to_chat();
        c.send_message("hello");
        settle(&mut c, &mut rx).await;
        assert_eq!(c.messages().len(), 2);
        assert!(c.messages()[1].is_error());
        // Retrying is an explicit new send.
        assert!(matches!(c.send_message("again"), SendOutcome::Dispatched(_)));
    }

    #[test]
    fn test_send_without_runtime_fails_into_error_status() {
        let (mut c, _rx) = controller(Scripted::new(vec![]));
        c.switch_to_chat();
        assert!(matches!(c.send_message("hello"), SendOutcome::Dispatched(_)));
        assert_eq!(c.status(), ChatStatus::Error);
        assert!(c.messages()[1].is_error());
    }

    #[tokio::test]
    async fn test_disabled_controller() {
        let (mut c, _rx) = Controller::new(None, history());
        c.set_open(true);
        assert!(!c.is_enabled());
        assert!(!c.switch_to_chat());
        assert_eq!(c.mode(), Mode::Command);
        assert_eq!(c.send_message("hi"), SendOutcome::Disabled);
        c.set_input("hi");
        assert!(!c.select_ask_ai(0, &SkimFuzzy::default()));
        assert_eq!(c.handle_key(PaletteKey::Enter { modifier: true, shift: false }), KeyOutcome::Unhandled);
        assert!(c.messages().is_empty());
    }

    #[tokio::test]
    async fn test_escape_in_chat_returns_to_command_and_clears_input() {
        let (mut c, _rx) = controller(Scripted::new(vec![]));
        c.switch_to_chat();
        c.set_input("draft");
        assert_eq!(c.handle_key(PaletteKey::Escape), KeyOutcome::ModeChanged(Mode::Command));
        assert_eq!(c.mode(), Mode::Command);
        assert_eq!(c.input(), "");
        assert!(c.is_open());

        assert_eq!(c.handle_key(PaletteKey::Escape), KeyOutcome::Closed);
        assert_eq!(c.mode(), Mode::Command);
        assert!(!c.is_open());
    }

    #[tokio::test]
    async fn test_mod_enter_in_command_mode_sends_typed_text() {
        let (mut c, mut rx) = controller(Scripted::new(vec![vec![Step::Text("sure")]]));
        c.set_input("how do I rebase?");
        let out = c.handle_key(PaletteKey::Enter { modifier: true, shift: false });
        assert!(matches!(out, KeyOutcome::Sent(SendOutcome::Dispatched(_))));
        assert_eq!(c.mode(), Mode::Chat);
        assert_eq!(c.input(), "");
        settle(&mut c, &mut rx).await;
        assert_eq!(c.messages()[0].content, "how do I rebase?");
    }

    #[tokio::test]
    async fn test_shift_enter_is_left_to_the_host() {
        let (mut c, _rx) = controller(Scripted::new(vec![]));
        c.switch_to_chat();
        c.set_input("line");
        assert_eq!(c.handle_key(PaletteKey::Enter { modifier: false, shift: true }), KeyOutcome::Unhandled);
        assert!(c.messages().is_empty());
    }

    #[tokio::test]
    async fn test_new_chat_persists_one_conversation() {
        let (mut c, mut rx) = controller(Scripted::new(vec![vec![Step::Text("pong")]]));
        c.switch_to_chat();
        c.send_message("ping the server please");
        settle(&mut c, &mut rx).await;

        c.start_new_chat();
        assert!(c.messages().is_empty());
        assert_eq!(c.mode(), Mode::Chat);
        let stored = c.history().list();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].title, "ping the server please");
        assert_eq!(c.recent_conversations().len(), 1);

        // Nothing to archive the second time.
        c.start_new_chat();
        assert_eq!(c.history().list().len(), 1);
    }

    #[tokio::test]
    async fn test_close_then_reopen_does_not_duplicate_history() {
        let (mut c, mut rx) = controller(Scripted::new(vec![vec![Step::Text("pong")]]));
        c.switch_to_chat();
        c.send_message("ping");
        settle(&mut c, &mut rx).await;
        c.set_open(false);
        c.set_open(true);
        assert_eq!(c.mode(), Mode::Command);
        c.set_open(false);
        assert_eq!(c.history().list().len(), 1);
    }

    #[tokio::test]
    async fn test_load_conversation_copies_messages() {
        let (mut c, mut rx) = controller(Scripted::new(vec![vec![Step::Text("pong")], vec![Step::Text("more")]]));
        c.switch_to_chat();
        c.send_message("ping");
        settle(&mut c, &mut rx).await;
        c.start_new_chat();
        c.switch_to_command();

        let id = c.recent_conversations()[0].id.clone();
        assert!(c.load_conversation(&id));
        assert_eq!(c.mode(), Mode::Chat);
        assert_eq!(c.active_conversation_id(), Some(id.as_str()));
        let contents: Vec<_> = c.messages().iter().map(|m| m.content.clone()).collect();
        assert_eq!(contents, vec!["ping", "pong"]);

        c.send_message("again");
        settle(&mut c, &mut rx).await;
        assert_eq!(c.messages().len(), 4);
        assert_eq!(c.history().load(&id).unwrap().len(), 2);

        assert!(!c.load_conversation("missing"));
    }

    #[tokio::test]
    async fn test_reloading_the_active_conversation_keeps_new_messages() {
        let (mut c, mut rx) = controller(Scripted::new(vec![vec![Step::Text("pong")], vec![Step::Text("more")]]));
        c.switch_to_chat();
        c.send_message("ping");
        settle(&mut c, &mut rx).await;
        c.start_new_chat();
        let id = c.recent_conversations()[0].id.clone();

        assert!(c.load_conversation(&id));
        c.send_message("second");
        settle(&mut c, &mut rx).await;
        assert_eq!(c.messages().len(), 4);

        c.handle_key(PaletteKey::Escape);
        assert_eq!(c.mode(), Mode::Command);
        assert!(c.load_conversation(&id));
        assert_eq!(c.mode(), Mode::Chat);
        let contents: Vec<_> = c.messages().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["ping", "pong", "second", "more"]);
        assert_eq!(c.history().load(&id).unwrap().len(), 4);

        c.set_open(false);
        assert_eq!(c.history().list().len(), 1);
        assert_eq!(c.history().load(&id).unwrap().len(), 4);
    }

    /// Emits a chunk every 10ms and counts what it managed to produce.
    struct Trickle {
        produced: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ChatTransport for Trickle {
        async fn stream(&self, _request: ChatRequest, sink: ChatSink) -> Result<()> {
            for i in 0..20 {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                sink.delta(format!("{i} "));
                self.produced.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_abandoned_request_stops_streaming() {
        let produced = Arc::new(AtomicUsize::new(0));
        let transport = Arc::new(Trickle { produced: Arc::clone(&produced) });
        let (mut c, _rx) = Controller::new(Some(transport), history());
        c.set_open(true);
        c.switch_to_chat();

        c.send_message("tell me a long story");
        tokio::time::sleep(std::time::Duration::from_millis(35)).await;
        c.start_new_chat();
        let at_abandon = produced.load(Ordering::SeqCst);
        assert!(at_abandon < 20);

        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        assert_eq!(produced.load(Ordering::SeqCst), at_abandon);
        assert_eq!(c.status(), ChatStatus::Idle);
    }

    #[tokio::test]
    async fn test_loading_another_conversation_aborts_the_request() {
        let produced = Arc::new(AtomicUsize::new(0));
        let transport = Arc::new(Trickle { produced: Arc::clone(&produced) });
        let (mut c, _rx) = Controller::new(Some(transport), history());
        c.set_open(true);
        c.switch_to_chat();
        c.history().save(Conversation::with_id("older", vec![Message::user("ping")])).unwrap();

        c.send_message("hello");
        tokio::time::sleep(std::time::Duration::from_millis(35)).await;
        assert!(c.load_conversation("older"));
        let at_abandon = produced.load(Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(produced.load(Ordering::SeqCst), at_abandon);
        assert_eq!(c.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_events_after_new_chat_are_ignored() {
        let (mut c, mut rx) = controller(Scripted::new(vec![vec![Step::Text("late")]]));
        c.switch_to_chat();
        let SendOutcome::Dispatched(old) = c.send_message("hello") else {
            panic!("not dispatched");
        };
        c.start_new_chat();
        assert_eq!(c.status(), ChatStatus::Idle);

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        while let Ok(ev) = rx.try_recv() {
            c.apply_chat_event(ev);
        }
        c.apply_chat_event(ChatEvent::Delta { request: old, text: "late".into() });
        c.apply_chat_event(ChatEvent::Finished { request: old });
        assert!(c.messages().is_empty());
        assert_eq!(c.status(), ChatStatus::Idle);
        // The abandoned session was archived.
        assert_eq!(c.history().list().len(), 1);
    }

    #[tokio::test]
    async fn test_tool_approval_is_idempotent_and_resumes() {
        let transport = Scripted::new(vec![
            vec![Step::Text("Deleting."), Step::Tool("call-1", Approval::Pending)],
            vec![Step::Text(" Done.")],
        ]);
        let (mut c, mut rx) = controller(transport.clone());
        c.switch_to_chat();
        c.send_message("delete a.txt");
        settle(&mut c, &mut rx).await;
        assert_eq!(c.messages()[1].tool_calls[0].approval, Approval::Pending);

        let approve = ApprovalDecision { id: "call-1", approved: true };
        assert_eq!(c.add_tool_approval_response(approve), ApprovalOutcome::Recorded);
        assert_eq!(c.status(), ChatStatus::Submitted);
        assert_eq!(
            c.add_tool_approval_response(ApprovalDecision { id: "call-1", approved: false }),
            ApprovalOutcome::AlreadyDecided
        );
        assert_eq!(
            c.add_tool_approval_response(ApprovalDecision { id: "nope", approved: true }),
            ApprovalOutcome::UnknownToolCall
        );
        settle(&mut c, &mut rx).await;

        assert_eq!(c.messages().len(), 2);
        assert_eq!(c.messages()[1].content, "Deleting. Done.");
        assert_eq!(c.messages()[1].tool_calls[0].approval, Approval::Approved);
        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].messages[1].tool_calls[0].approval, Approval::Approved);
    }

    #[tokio::test]
    async fn test_unapproved_tool_calls_cannot_be_decided() {
        let (mut c, mut rx) = controller(Scripted::new(vec![vec![Step::Tool("auto", Approval::NotRequired)]]));
        c.switch_to_chat();
        c.send_message("list files");
        settle(&mut c, &mut rx).await;
        assert_eq!(
            c.add_tool_approval_response(ApprovalDecision { id: "auto", approved: true }),
            ApprovalOutcome::NotRequested
        );
        assert_eq!(c.status(), ChatStatus::Idle);
    }

    #[tokio::test]
    async fn test_ask_ai_paths() {
        let matcher = SkimFuzzy::default();
        let (mut c, mut rx) = controller(Scripted::new(vec![vec![Step::Text("answer")]]));

        // Nothing matched: the text becomes the first message.
        c.set_input("what is a monad");
        assert!(c.select_ask_ai(0, &matcher));
        assert_eq!(c.mode(), Mode::Chat);
        settle(&mut c, &mut rx).await;
        assert_eq!(c.messages()[0].content, "what is a monad");

        // Commands matched: just switch, dropping the query.
        c.switch_to_command();
        c.start_new_chat();
        c.set_input("deploy");
        assert!(c.select_ask_ai(2, &matcher));
        assert_eq!(c.mode(), Mode::Chat);
        assert_eq!(c.input(), "");
        assert!(c.messages().is_empty());

        // Query matching "ask-ai" itself also just switches.
        c.switch_to_command();
        c.set_input("ask");
        assert!(c.select_ask_ai(0, &matcher));
        assert!(c.messages().is_empty());
    }

    #[tokio::test]
    async fn test_select_action_starts_chat_with_label() {
        let (mut c, mut rx) = controller(Scripted::new(vec![vec![Step::Text("ok")]]));
        let action = CommandAction { name: "summarize".into(), label: Some("Summarize page".into()), executable: true };
        assert!(matches!(c.select_action(&action), SendOutcome::Dispatched(_)));
        settle(&mut c, &mut rx).await;
        assert_eq!(c.mode(), Mode::Chat);
        assert_eq!(c.messages()[0].content, "Summarize page");
    }

    #[tokio::test]
    async fn test_failing_host_callbacks_are_contained() {
        let capture = Arc::new(Capture::default());
        let (c, _rx) = Controller::new(Some(Scripted::new(vec![])), history());
        let mut c = c
            .with_reporter(capture.clone())
            .on_open_change(|_| anyhow::bail!("listener broke"))
            .on_mode_change(|_| panic!("listener panicked"));

        c.set_open(true);
        assert!(c.is_open());
        assert!(c.switch_to_chat());
        assert_eq!(c.mode(), Mode::Chat);

        let bad = CommandDefinition::new("deploy").on_select(|| anyhow::bail!("no creds"));
        assert!(!c.select_command(&bad));
        assert!(c.is_faulted());

        c.set_open(false);
        c.set_open(true);
        assert!(!c.is_faulted());

        let seen = capture.0.lock().unwrap();
        assert!(seen.contains(&"on_open_change".to_string()));
        assert!(seen.contains(&"on_mode_change".to_string()));
        assert!(seen.contains(&"on_select:deploy".to_string()));
    }

    #[tokio::test]
    async fn test_callbacks_see_transitions() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let (mode_log, open_log) = (Rc::clone(&log), Rc::clone(&log));
        let (c, _rx) = Controller::new(Some(Scripted::new(vec![])), history());
        let mut c = c
            .on_mode_change(move |m| {
                mode_log.borrow_mut().push(format!("mode:{m:?}"));
                Ok(())
            })
            .on_open_change(move |o| {
                open_log.borrow_mut().push(format!("open:{o}"));
                Ok(())
            });

        c.handle_key(PaletteKey::Toggle);
        c.switch_to_chat();
        c.handle_key(PaletteKey::Toggle);
        c.handle_key(PaletteKey::Toggle);
        assert_eq!(
            *log.borrow(),
            vec!["open:true", "mode:Chat", "open:false", "mode:Command", "open:true"]
        );
    }

    #[tokio::test]
    async fn test_disabled_command_is_not_run() {
        let (mut c, _rx) = controller(Scripted::new(vec![]));
        let ran = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&ran);
        let cmd = CommandDefinition::new("x").disabled(true).on_select(move || {
            *flag.lock().unwrap() = true;
            Ok(())
        });
        assert!(!c.select_command(&cmd));
        assert!(!*ran.lock().unwrap());
        assert!(!c.is_faulted());
    }

    #[tokio::test]
    async fn test_render_context_mirrors_state() {
        let (mut c, _rx) = controller(Scripted::new(vec![]));
        c.switch_to_chat();
        let ctx = c.render_context();
        assert_eq!(ctx.mode, Mode::Chat);
        assert!(ctx.is_enabled);
        assert_eq!(ctx.status, ChatStatus::Idle);
        assert!(ctx.messages.is_empty());
    }
}
