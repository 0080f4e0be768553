use crate::grammar::{AttrClass, AttrId, GrammarStore, RuleSet};
use crate::parser::{self, ParsedLine, Span};
use crate::stack::ContextStack;
use std::borrow::Cow;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Where the engine reads lines from. Lines are plain text without the
/// trailing newline; anything rope- or array-backed can implement this.
pub trait LineSource {
    fn len_lines(&self) -> usize;
    fn line(&self, index: usize) -> Option<Cow<'_, str>>;
}

impl LineSource for Vec<String> {
    fn len_lines(&self) -> usize {
        self.len()
    }

    fn line(&self, index: usize) -> Option<Cow<'_, str>> {
        self.get(index).map(|s| Cow::Borrowed(s.as_str()))
    }
}

/// Host integration points. `line_highlighted` delivers fresh spans for a
/// line; `schedule_resume` asks the host to call [`Highlighter::resume`]
/// from its event loop as soon as possible (single-shot).
pub trait HostHooks {
    fn line_highlighted(&mut self, _line: usize, _spans: &[Span]) {}
    fn schedule_resume(&mut self) {}
}

/// Hook implementation for callers that only want the stored results.
pub struct NullHooks;

impl HostHooks for NullHooks {}

/// The persisted result of parsing one line: the context stack at end of
/// line, the continuation flag, and the spans last produced for it.
#[derive(Debug)]
pub struct LineState {
    pub stack: ContextStack,
    pub continues: bool,
    pub spans: Vec<Span>,
}

impl LineState {
    /// Convergence comparison: spans are derived data and do not
    /// participate.
    fn same_state(&self, other: &ParsedLine) -> bool {
        self.continues == other.continues && self.stack == other.stack
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SchedState {
    Idle,
    Pending { resume: usize, until: usize },
}

/// Per-chunk wall-clock budgets. Small for keystrokes so typing stays
/// responsive, large for bulk edits and initial load.
#[derive(Debug, Clone, Copy)]
pub struct Budgets {
    pub keystroke: Duration,
    pub bulk: Duration,
    /// An edit touching at least this many lines counts as bulk.
    pub bulk_threshold: usize,
}

impl Default for Budgets {
    fn default() -> Self {
        Budgets {
            keystroke: Duration::from_millis(10),
            bulk: Duration::from_millis(250),
            bulk_threshold: 16,
        }
    }
}

/// Incremental highlighter for one document. Owns one [`LineState`] per
/// buffer line and re-parses the smallest line range that can be proven
/// sufficient after each edit, yielding to the host when the time budget
/// runs out.
pub struct Highlighter {
    store: Rc<GrammarStore>,
    set: Rc<RuleSet>,
    states: Vec<Option<LineState>>,
    sched: SchedState,
    budgets: Budgets,
}

impl Highlighter {
    pub fn new(store: Rc<GrammarStore>, set: Rc<RuleSet>) -> Self {
        Highlighter {
            store,
            set,
            states: Vec::new(),
            sched: SchedState::Idle,
            budgets: Budgets::default(),
        }
    }

    pub fn with_budgets(mut self, budgets: Budgets) -> Self {
        self.budgets = budgets;
        self
    }

    pub fn grammar(&self) -> &Rc<RuleSet> {
        &self.set
    }

    /// Spans last computed for a line, if it has been parsed.
    pub fn spans(&self, line: usize) -> Option<&[Span]> {
        self.states.get(line)?.as_ref().map(|s| s.spans.as_slice())
    }

    pub fn line_state(&self, line: usize) -> Option<&LineState> {
        self.states.get(line)?.as_ref()
    }

    /// True while a chunk is parked waiting for [`Highlighter::resume`].
    pub fn is_pending(&self) -> bool {
        matches!(self.sched, SchedState::Pending { .. })
    }

    /// Throw away all state and re-parse the whole document (initial
    /// load, grammar switch). Uses the bulk budget.
    pub fn rehighlight(&mut self, source: &impl LineSource, hooks: &mut impl HostHooks) {
        self.states.clear();
        self.states.resize_with(source.len_lines(), || None);
        let until = source.len_lines().saturating_sub(1);
        self.sched = SchedState::Pending { resume: 0, until };
        self.run_chunk(source, hooks, self.budgets.bulk);
    }

    /// Buffer edit notification. `first_line` is the first changed line;
    /// the removed/inserted counts are the number of line breaks the edit
    /// removed and added. Line states below the edit shift accordingly,
    /// then the affected range is scheduled, merging with any still
    /// pending range.
    pub fn on_edit(
        &mut self,
        source: &impl LineSource,
        hooks: &mut impl HostHooks,
        first_line: usize,
        lines_removed: usize,
        lines_inserted: usize,
    ) {
        if self.states.len() < source.len_lines() {
            self.states.resize_with(source.len_lines(), || None);
        }

        // lines merged into first_line disappear, new lines start unknown
        if lines_removed > 0 && first_line + 1 < self.states.len() {
            let end = (first_line + 1 + lines_removed).min(self.states.len());
            self.states.drain(first_line + 1..end);
        }
        for _ in 0..lines_inserted {
            let at = (first_line + 1).min(self.states.len());
            self.states.insert(at, None);
        }
        self.states.resize_with(source.len_lines(), || None);

        let mut resume = first_line;
        let mut until = first_line + lines_inserted;
        if let SchedState::Pending { resume: r, until: u } = self.sched {
            // merge with in-flight work instead of doing it twice
            resume = resume.min(r);
            until = until.max(u);
        }
        self.sched = SchedState::Pending { resume, until };

        let touched = lines_removed + lines_inserted + 1;
        let budget = if touched >= self.budgets.bulk_threshold {
            self.budgets.bulk
        } else {
            self.budgets.keystroke
        };
        self.run_chunk(source, hooks, budget);
    }

    /// Continue a chunk that ran out of budget. Called by the host after
    /// `schedule_resume`; a no-op when nothing is pending.
    pub fn resume(&mut self, source: &impl LineSource, hooks: &mut impl HostHooks) {
        self.run_chunk(source, hooks, self.budgets.bulk);
    }

    /// Attribute at a position, from the line's last computed spans.
    pub fn attr_at(&self, line: usize, column: usize) -> Option<AttrId> {
        let state = self.states.get(line)?.as_ref()?;
        let mut consumed = 0;
        for span in &state.spans {
            consumed += span.length;
            if column < consumed {
                return Some(span.attr);
            }
        }
        None
    }

    fn class_at(&self, line: usize, column: usize) -> Option<AttrClass> {
        let attr = self.attr_at(line, column)?;
        Some(self.set.attributes.get(attr.0 as usize)?.class)
    }

    /// True for anything that is not string, char, comment or here-doc
    /// text, so keywords and numbers count as code too.
    pub fn is_code(&self, line: usize, column: usize) -> bool {
        matches!(
            self.class_at(line, column),
            Some(AttrClass::Code) | Some(AttrClass::Other)
        )
    }

    pub fn is_comment(&self, line: usize, column: usize) -> bool {
        matches!(
            self.class_at(line, column),
            Some(AttrClass::Comment) | Some(AttrClass::BlockComment)
        )
    }

    /// Parse lines from the pending resume point, in strictly increasing
    /// order. Inside the requested range every line is parsed; past it,
    /// parsing continues only while the computed state differs from what
    /// was stored, so a stabilized line ends the chunk.
    fn run_chunk(&mut self, source: &impl LineSource, hooks: &mut impl HostHooks, budget: Duration) {
        let (mut line, until) = match self.sched {
            SchedState::Pending { resume, until } => (resume, until),
            SchedState::Idle => return,
        };
        let started = Instant::now();

        loop {
            if line >= source.len_lines() {
                self.sched = SchedState::Idle;
                return;
            }
            if self.states.len() < source.len_lines() {
                self.states.resize_with(source.len_lines(), || None);
            }

            let (prev_stack, prev_continues) = match line.checked_sub(1) {
                Some(p) => match self.states.get(p).and_then(|s| s.as_ref()) {
                    Some(state) => (state.stack.clone(), state.continues),
                    None => (self.default_stack(), false),
                },
                None => (self.default_stack(), false),
            };

            let text = source.line(line).unwrap_or(Cow::Borrowed(""));
            let parsed = parser::parse_line(&self.store, &prev_stack, &text, prev_continues);
            let changed = match &self.states[line] {
                Some(old) => !old.same_state(&parsed),
                None => true,
            };
            trace!(line, changed, "line parsed");

            hooks.line_highlighted(line, &parsed.spans);
            self.states[line] = Some(LineState {
                stack: parsed.stack,
                continues: parsed.continues,
                spans: parsed.spans,
            });

            if line >= until && !changed {
                // convergence: everything below this line is untouched
                self.sched = SchedState::Idle;
                return;
            }
            line += 1;
            if line >= source.len_lines() {
                self.sched = SchedState::Idle;
                return;
            }

            if started.elapsed() >= budget {
                debug!(resume = line, until, "chunk budget exhausted, yielding");
                self.sched = SchedState::Pending {
                    resume: line,
                    until: until.max(line),
                };
                hooks.schedule_resume();
                return;
            }
        }
    }

    fn default_stack(&self) -> ContextStack {
        ContextStack::new(self.store.default_handle(&self.set))
    }
}
