/// Declarative command list: grouping, fuzzy filtering and the section
/// layout of the command-mode list (quick actions, groups, recent chats,
/// actions, then the Ask-AI entry or the empty state).
///
/// Everything here is a pure projection over the command definitions and
/// the controller's current mode and input; nothing is stored.
use fuzzy_matcher::FuzzyMatcher;
use fuzzy_matcher::skim::SkimMatcherV2;
use std::collections::HashSet;
use std::sync::Arc;

use crate::history::ConversationSummary;
use crate::message::Mode;
use crate::mobile::MobileUi;

pub const QUICK_ACTIONS_HEADING: &str = "Quick Actions";
pub const RECENT_CHATS_HEADING: &str = "Recent Chats";
pub const DEFAULT_ACTIONS_HEADING: &str = "Actions";
pub const ASK_AI_VALUE: &str = "ask-ai";
pub const EMPTY_LABEL: &str = "No results found.";
const RECENT_CHATS_LIMIT: usize = 5;

pub type SelectFn = Arc<dyn Fn() -> anyhow::Result<()> + Send + Sync>;

// ── Definitions ───────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct CommandDefinition {
    /// Unique key, also searched
    pub name: String,
    /// Display text; falls back to `name`
    pub label: Option<String>,
    pub group: Option<String>,
    pub icon: Option<String>,
    /// Display-only shortcut hint
    pub shortcut: Option<String>,
    pub keywords: Vec<String>,
    /// Shown greyed out, never selectable
    pub disabled: bool,
    pub on_select: Option<SelectFn>,
}

impl std::fmt::Debug for CommandDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDefinition")
            .field("name", &self.name)
            .field("label", &self.label)
            .field("group", &self.group)
            .field("disabled", &self.disabled)
            .field("on_select", &self.on_select.is_some())
            .finish()
    }
}

impl CommandDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn shortcut(mut self, shortcut: impl Into<String>) -> Self {
        self.shortcut = Some(shortcut.into());
        self
    }

    pub fn keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    pub fn disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    pub fn on_select(mut self, f: impl Fn() -> anyhow::Result<()> + Send + Sync + 'static) -> Self {
        self.on_select = Some(Arc::new(f));
        self
    }

    pub fn display_label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.name)
    }

    /// Explicit keywords plus the label when it differs from the name.
    pub fn search_keywords(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self.keywords.iter().map(String::as_str).collect();
        if let Some(label) = &self.label {
            if label != &self.name {
                out.push(label);
            }
        }
        out
    }
}

/// An agentic action offered in the "Actions" group. Selecting one starts a
/// new chat with the action's label as the first message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandAction {
    pub name: String,
    pub label: Option<String>,
    /// Only executable actions are listed
    pub executable: bool,
}

impl CommandAction {
    pub fn display_label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.name)
    }
}

// ── Source resolution ─────────────────────────────────────────────────────────

/// Where the command-mode list comes from, decided once at construction.
pub enum CommandSource<R> {
    Declarative(Vec<CommandDefinition>),
    /// Host renders its own list
    Custom(R),
}

impl<R> CommandSource<R> {
    /// Non-empty `commands` win over a custom renderer; neither gives an empty
    /// declarative list (input plus Ask-AI only).
    pub fn resolve(commands: Option<Vec<CommandDefinition>>, custom: Option<R>) -> Self {
        match (commands, custom) {
            (Some(commands), custom) if !commands.is_empty() => {
                if custom.is_some() && cfg!(debug_assertions) {
                    tracing::warn!(
                        "both `commands` and a custom list were supplied; the custom list is ignored"
                    );
                }
                warn_duplicate_names(&commands);
                CommandSource::Declarative(commands)
            }
            (_, Some(custom)) => CommandSource::Custom(custom),
            (_, None) => CommandSource::Declarative(Vec::new()),
        }
    }

    pub fn commands(&self) -> &[CommandDefinition] {
        match self {
            CommandSource::Declarative(commands) => commands,
            CommandSource::Custom(_) => &[],
        }
    }
}

pub fn duplicate_names(commands: &[CommandDefinition]) -> Vec<&str> {
    let mut seen = HashSet::new();
    let mut dups = Vec::new();
    for cmd in commands {
        if !seen.insert(cmd.name.as_str()) && !dups.contains(&cmd.name.as_str()) {
            dups.push(cmd.name.as_str());
        }
    }
    dups
}

fn warn_duplicate_names(commands: &[CommandDefinition]) {
    if !cfg!(debug_assertions) {
        return;
    }
    for name in duplicate_names(commands) {
        tracing::warn!("duplicate command name \"{name}\"; names must be unique");
    }
}

// ── Grouping ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct CommandGroup<'a> {
    pub heading: Option<&'a str>,
    pub commands: Vec<&'a CommandDefinition>,
}

/// Group by `group` in first-encounter order; the ungrouped bucket goes first.
pub fn group_commands(commands: &[CommandDefinition]) -> Vec<CommandGroup<'_>> {
    let mut groups: Vec<CommandGroup<'_>> = Vec::new();
    for cmd in commands {
        let key = cmd.group.as_deref();
        match groups.iter_mut().find(|g| g.heading == key) {
            Some(group) => group.commands.push(cmd),
            None => groups.push(CommandGroup { heading: key, commands: vec![cmd] }),
        }
    }
    if let Some(idx) = groups.iter().position(|g| g.heading.is_none()) {
        if idx > 0 {
            let ungrouped = groups.remove(idx);
            groups.insert(0, ungrouped);
        }
    }
    groups
}

// ── Matching ──────────────────────────────────────────────────────────────────

pub trait FuzzyMatch {
    /// `None` when `candidate` does not match `query`; higher is better.
    fn score(&self, candidate: &str, query: &str) -> Option<i64>;
}

#[derive(Default)]
pub struct SkimFuzzy {
    matcher: SkimMatcherV2,
}

impl FuzzyMatch for SkimFuzzy {
    fn score(&self, candidate: &str, query: &str) -> Option<i64> {
        self.matcher.fuzzy_match(candidate, query)
    }
}

/// Best score over name, label and keywords. An empty query matches all.
pub fn command_score(matcher: &dyn FuzzyMatch, cmd: &CommandDefinition, query: &str) -> Option<i64> {
    let query = query.trim();
    if query.is_empty() {
        return Some(0);
    }
    std::iter::once(cmd.name.as_str())
        .chain(cmd.search_keywords())
        .filter_map(|candidate| matcher.score(candidate, query))
        .max()
}

fn text_score(matcher: &dyn FuzzyMatch, candidates: &[&str], query: &str) -> Option<i64> {
    let query = query.trim();
    if query.is_empty() {
        return Some(0);
    }
    candidates.iter().filter_map(|c| matcher.score(c, query)).max()
}

/// Whether the query itself looks like a request for the Ask-AI entry.
pub fn ask_ai_matches(matcher: &dyn FuzzyMatch, query: &str) -> bool {
    let query = query.trim();
    !query.is_empty() && matcher.score(ASK_AI_VALUE, query).is_some()
}

// ── Projection ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub enum ListItem<'a> {
    Command(&'a CommandDefinition),
    Conversation(&'a ConversationSummary),
    Action(&'a CommandAction),
    AskAi { label: &'a str },
    /// Shown when chat is unavailable and nothing matched
    Empty,
}

impl ListItem<'_> {
    pub fn is_selectable(&self) -> bool {
        match self {
            ListItem::Command(cmd) => !cmd.disabled,
            ListItem::Empty => false,
            _ => true,
        }
    }
}

#[derive(Debug)]
pub struct ListSection<'a> {
    pub heading: Option<&'a str>,
    pub items: Vec<ListItem<'a>>,
}

pub struct ListInput<'a> {
    pub commands: &'a [CommandDefinition],
    pub actions: &'a [CommandAction],
    pub actions_heading: &'a str,
    pub recent: &'a [ConversationSummary],
    pub query: &'a str,
    pub mode: Mode,
    pub mobile: MobileUi,
    pub chat_enabled: bool,
    pub ask_ai_label: &'a str,
}

#[derive(Debug, Default)]
pub struct CommandListView<'a> {
    pub sections: Vec<ListSection<'a>>,
    /// Matched items other than Ask-AI / empty state
    pub regular_match_count: usize,
}

impl<'a> CommandListView<'a> {
    pub fn items(&self) -> impl Iterator<Item = &ListItem<'a>> {
        self.sections.iter().flat_map(|s| s.items.iter())
    }

    pub fn selectable(&self) -> Vec<ListItem<'a>> {
        self.items().copied().filter(ListItem::is_selectable).collect()
    }
}

/// Filter `items` by score, best first; ties keep their declared order.
fn ranked<'a, T>(items: impl Iterator<Item = &'a T>, score: impl Fn(&T) -> Option<i64>) -> Vec<&'a T>
where
    T: 'a,
{
    let mut scored: Vec<(i64, &'a T)> = items.filter_map(|i| score(i).map(|s| (s, i))).collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0));
    scored.into_iter().map(|(_, i)| i).collect()
}

pub fn project<'a>(input: &ListInput<'a>, matcher: &dyn FuzzyMatch) -> CommandListView<'a> {
    let mut view = CommandListView::default();
    let query = input.query;

    let quick_actions: Vec<&CommandDefinition> = if input.mobile.quick_actions_visible(input.mode, query) {
        input
            .commands
            .iter()
            .filter(|c| !c.disabled)
            .take(input.mobile.quick_actions_count)
            .collect()
    } else {
        Vec::new()
    };
    let quick_names: HashSet<&str> = quick_actions.iter().map(|c| c.name.as_str()).collect();

    if !quick_actions.is_empty() {
        view.regular_match_count += quick_actions.len();
        view.sections.push(ListSection {
            heading: Some(QUICK_ACTIONS_HEADING),
            items: quick_actions.into_iter().map(ListItem::Command).collect(),
        });
    }

    for group in group_commands(input.commands) {
        let visible = group
            .commands
            .iter()
            .copied()
            .filter(|c| !quick_names.contains(c.name.as_str()));
        let matched = ranked(visible, |c| command_score(matcher, c, query));
        if matched.is_empty() {
            continue;
        }
        view.regular_match_count += matched.len();
        view.sections.push(ListSection {
            heading: group.heading,
            items: matched.into_iter().map(ListItem::Command).collect(),
        });
    }

    let recent = ranked(input.recent.iter().take(RECENT_CHATS_LIMIT), |c| {
        text_score(matcher, &[c.title.as_str()], query)
    });
    if !recent.is_empty() {
        view.regular_match_count += recent.len();
        view.sections.push(ListSection {
            heading: Some(RECENT_CHATS_HEADING),
            items: recent.into_iter().map(ListItem::Conversation).collect(),
        });
    }

    let actions = ranked(input.actions.iter().filter(|a| a.executable), |a| {
        text_score(matcher, &[a.name.as_str(), a.display_label()], query)
    });
    if !actions.is_empty() {
        view.regular_match_count += actions.len();
        view.sections.push(ListSection {
            heading: Some(input.actions_heading),
            items: actions.into_iter().map(ListItem::Action).collect(),
        });
    }

    if input.chat_enabled {
        view.sections.push(ListSection {
            heading: None,
            items: vec![ListItem::AskAi { label: input.ask_ai_label }],
        });
    } else if view.regular_match_count == 0 {
        view.sections.push(ListSection { heading: None, items: vec![ListItem::Empty] });
    }

    view
}
