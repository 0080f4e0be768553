use crate::grammar::{
    AttrId, ContextSwitch, GrammarStore, RuleKind, RuleSet, SwitchTarget,
};
use crate::matcher::{self, LineText};
use crate::stack::ContextStack;
use std::rc::Rc;
use tracing::{debug, warn};

/// Depth cap for `IncludeRules` delegation, so mutually-including
/// contexts cannot recurse forever.
const MAX_INCLUDE_DEPTH: usize = 8;

/// How many times the end-of-line switch may be reapplied before we give
/// up on a grammar that never stabilizes.
const MAX_LINE_END_SWITCHES: usize = 64;

/// How many zero-width matches are tolerated at one column before the
/// parser force-advances past a misconfigured look-ahead loop.
const MAX_ZERO_WIDTH: usize = 32;

/// One segment of a line's formatting: `length` characters styled with
/// `attr`. Spans tile the whole line with no gaps or overlaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub length: usize,
    pub attr: AttrId,
}

/// Result of parsing one line: its span decomposition, the context stack
/// at end of line, and whether the line ended in a continuation marker.
#[derive(Debug)]
pub struct ParsedLine {
    pub spans: Vec<Span>,
    pub stack: ContextStack,
    pub continues: bool,
}

/// Accumulates spans, merging adjacent runs with the same attribute.
#[derive(Default)]
struct SpanBuilder {
    spans: Vec<Span>,
}

impl SpanBuilder {
    fn push(&mut self, length: usize, attr: AttrId) {
        if length == 0 {
            return;
        }
        if let Some(last) = self.spans.last_mut() {
            if last.attr == attr {
                last.length += length;
                return;
            }
        }
        self.spans.push(Span { length, attr });
    }
}

/// A winning rule, flattened into what the parser needs: delegated rules
/// may live in another grammar, so the attribute is already mapped into
/// the root grammar's table and the owning set travels with the switch.
struct RuleWin {
    length: usize,
    captures: Option<Rc<[String]>>,
    attr: Option<AttrId>,
    switch: ContextSwitch,
    owner: Rc<RuleSet>,
    line_continue: bool,
}

/// Tokenize one line. Pure: same rule set, same input stack, same text,
/// same result. `prev_continues` is the continuation flag of the previous
/// line's state and gates the line-begin switch.
pub fn parse_line(
    store: &GrammarStore,
    stack: &ContextStack,
    text: &str,
    prev_continues: bool,
) -> ParsedLine {
    let line = LineText::new(text);
    let root = stack.bottom_handle().set.clone();
    let mut stack = stack.clone();

    if !prev_continues {
        let (switch, owner) = {
            let top = stack.top_handle();
            (top.context().line_begin.clone(), Rc::clone(&top.set))
        };
        if !switch.is_stay() {
            stack = apply_switch(&stack, &switch, &owner, None, store);
        }
    }

    let mut spans = SpanBuilder::default();
    let mut continues = false;
    let mut column = 0;
    let mut zero_width = 0;

    while column < line.len() {
        let top = stack.top_handle().clone();
        let captures = stack.top_captures().cloned();
        let context = top.context();
        let default_attr =
            map_attr(Some(context.attribute), &top.set, &root).unwrap_or(AttrId(0));

        let win = first_match(
            store,
            &top.set,
            context,
            &line,
            column,
            captures.as_ref(),
            &root,
            MAX_INCLUDE_DEPTH,
        );

        match win {
            Some(win) => {
                spans.push(win.length, win.attr.unwrap_or(default_attr));
                column += win.length;
                continues = win.line_continue;
                if !win.switch.is_stay() {
                    let next =
                        apply_switch(&stack, &win.switch, &win.owner, win.captures.clone(), store);
                    stack = next;
                }
                if win.length == 0 {
                    zero_width += 1;
                    if zero_width > MAX_ZERO_WIDTH {
                        warn!(
                            context = %context.name,
                            column,
                            "look-ahead rules looping without progress, forcing advance"
                        );
                        spans.push(1, default_attr);
                        column += 1;
                        zero_width = 0;
                    }
                } else {
                    zero_width = 0;
                }
            }
            None => {
                let fallthrough = context.fallthrough.clone();
                let mut advanced = false;
                if let Some(switch) = fallthrough {
                    let next = apply_switch(&stack, &switch, &top.set, None, store);
                    if next != stack {
                        stack = next;
                        advanced = true;
                        zero_width += 1;
                        if zero_width > MAX_ZERO_WIDTH {
                            warn!(
                                context = %context.name,
                                column,
                                "fallthrough switches looping without progress, forcing advance"
                            );
                            spans.push(1, default_attr);
                            column += 1;
                            zero_width = 0;
                        }
                    }
                }
                if !advanced {
                    spans.push(1, default_attr);
                    column += 1;
                    zero_width = 0;
                }
            }
        }
    }

    if !continues {
        let mut applied = 0;
        loop {
            let (switch, owner) = {
                let top = stack.top_handle();
                (top.context().line_end.clone(), Rc::clone(&top.set))
            };
            if switch.is_stay() {
                break;
            }
            let next = apply_switch(&stack, &switch, &owner, None, store);
            if next == stack {
                break;
            }
            stack = next;
            applied += 1;
            if applied >= MAX_LINE_END_SWITCHES {
                warn!("line-end switches did not stabilize, stopping");
                break;
            }
        }
    }

    ParsedLine {
        spans: spans.spans,
        stack,
        continues,
    }
}

/// Apply a context switch to a stack: pop, then push. The push target is
/// resolved up front; if it cannot be resolved the whole switch is a
/// logged no-op, never a pop without its push. Captured data is attached
/// to the new frame only when the pushed context is dynamic.
pub fn apply_switch(
    stack: &ContextStack,
    switch: &ContextSwitch,
    owner: &Rc<RuleSet>,
    captures: Option<Rc<[String]>>,
    store: &GrammarStore,
) -> ContextStack {
    let pushed = match &switch.push {
        Some(target) => match resolve_target(target, owner, store) {
            Some(handle) => Some(handle),
            None => {
                debug!(?target, "context push target not resolvable, switch ignored");
                return stack.clone();
            }
        },
        None => None,
    };
    let mut stack = stack.pop(switch.pops);
    if let Some(handle) = pushed {
        let data = if handle.context().dynamic { captures } else { None };
        stack = stack.push(handle, data);
    }
    stack
}

fn resolve_target(
    target: &SwitchTarget,
    owner: &Rc<RuleSet>,
    store: &GrammarStore,
) -> Option<crate::grammar::ContextHandle> {
    match target {
        SwitchTarget::Context(id) => Some(crate::grammar::ContextHandle {
            set: Rc::clone(owner),
            id: *id,
        }),
        SwitchTarget::Grammar(name) => {
            let set = store.resolve(name)?;
            Some(store.default_handle(&set))
        }
    }
}

fn map_attr(attr: Option<AttrId>, owner: &Rc<RuleSet>, root: &Rc<RuleSet>) -> Option<AttrId> {
    let id = attr?;
    if Rc::ptr_eq(owner, root) {
        return Some(id);
    }
    // a delegated rule from another grammar: carry its attribute over by
    // name, falling back to the root default
    let name = &owner.attributes.get(id.0 as usize)?.name;
    root.attr_by_name(name)
}

/// Scan a context's rules in declaration order and report the first match.
/// `IncludeRules` entries are tried as if the delegated context's rules
/// were inlined here; no stack frame is involved.
#[allow(clippy::too_many_arguments)]
fn first_match(
    store: &GrammarStore,
    set: &Rc<RuleSet>,
    context: &crate::grammar::Context,
    line: &LineText,
    column: usize,
    captures: Option<&Rc<[String]>>,
    root: &Rc<RuleSet>,
    depth: usize,
) -> Option<RuleWin> {
    for rule in &context.rules {
        if let RuleKind::IncludeRules { target } = &rule.kind {
            if depth == 0 {
                debug!(context = %context.name, "include depth limit reached, skipping");
                continue;
            }
            let (other_set, other_id) = match target {
                SwitchTarget::Context(id) => (Rc::clone(set), *id),
                SwitchTarget::Grammar(name) => match store.resolve(name) {
                    Some(other) => {
                        let id = other.default_context;
                        (other, id)
                    }
                    None => {
                        debug!(grammar = %name, "included grammar not loaded yet");
                        continue;
                    }
                },
            };
            let other_ctx = other_set.context(other_id);
            if let Some(win) = first_match(
                store, &other_set, other_ctx, line, column, captures, root, depth - 1,
            ) {
                return Some(win);
            }
            continue;
        }

        if let Some(outcome) = matcher::try_match(rule, set, line, column, captures) {
            return Some(RuleWin {
                length: outcome.length,
                captures: outcome.captures,
                attr: map_attr(rule.attribute, set, root),
                switch: rule.switch.clone(),
                owner: Rc::clone(set),
                line_continue: matches!(rule.kind, RuleKind::LineContinue { .. }),
            });
        }
    }
    None
}
